// SPDX-License-Identifier: MIT
/*
 * Copyright (c) [2023 - Present] Emily Matheys <emilymatt96@gmail.com>
 *
 * Permission is hereby granted, free of charge, to any person obtaining a copy
 * of this software and associated documentation files (the "Software"), to deal
 * in the Software without restriction, including without limitation the rights
 * to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
 * copies of the Software, and to permit persons to whom the Software is
 * furnished to do so, subject to the following conditions:
 *
 * The above copyright notice and this permission notice shall be included in all
 * copies or substantial portions of the Software.
 *
 * THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
 * FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
 * AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
 * LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
 * OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
 * SOFTWARE.
 */

use std::cmp::Ordering;

use nalgebra::{Point, RealField};

use crate::{
    concurrent,
    spatial::{KdTree, Neighbour},
    types::RegistrationError,
};

/// A putative match between a source keypoint and a target keypoint, with
/// their distance in descriptor space.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Correspondence<T> {
    /// Index of the matched point in the source cloud.
    pub source_index: usize,
    /// Index of the matched point in the target cloud.
    pub target_index: usize,
    /// Distance between the two descriptors.
    pub distance: T,
}

fn validate_inputs<T: RealField + Copy, const D: usize>(
    source_descriptors: &[Point<T, D>],
    source_indices: &[usize],
    target_descriptors: &[Point<T, D>],
    target_indices: &[usize],
    ratio: T,
) -> Result<(), RegistrationError> {
    if ratio <= T::zero() || ratio > T::one() {
        return Err(RegistrationError::ParameterError(
            "ratio must lie in (0, 1]",
        ));
    }

    if source_descriptors.is_empty() || target_descriptors.is_empty() {
        return Err(RegistrationError::InvalidInput(
            "correspondence generation requires non-empty descriptor sets",
        ));
    }

    if source_descriptors.len() != source_indices.len()
        || target_descriptors.len() != target_indices.len()
    {
        return Err(RegistrationError::InvalidInput(
            "descriptor and keypoint index arrays must have equal length",
        ));
    }

    Ok(())
}

/// Applies the Lowe-style ratio test to the two best matches of one source
/// descriptor; `None` rejects the match, `Some` keeps the best one.
fn ratio_filter<T: RealField + Copy>(
    two_nearest: &[Neighbour<T>],
    ratio: T,
) -> Option<Neighbour<T>> {
    let best = *two_nearest.first()?;
    match two_nearest.get(1) {
        // A runner-up at distance zero is an exact duplicate of the best
        // match, which is as ambiguous as a match can get.
        Some(second) => {
            if second.distance > T::zero() {
                (best.distance / second.distance < ratio).then_some(best)
            } else {
                None
            }
        }
        None => Some(best),
    }
}

fn sort_and_map<T: RealField + Copy>(
    kept: Vec<Option<Neighbour<T>>>,
    source_indices: &[usize],
    target_indices: &[usize],
) -> Vec<Correspondence<T>> {
    let mut correspondences = kept
        .into_iter()
        .enumerate()
        .filter_map(|(source_pos, best)| {
            best.map(|best| Correspondence {
                source_index: source_indices[source_pos],
                target_index: target_indices[best.index],
                distance: best.distance,
            })
        })
        .collect::<Vec<_>>();

    // The ascending-quality ordering is load-bearing: PROSAC consumes it
    // directly as its sampling priority.
    correspondences.sort_by(|a, b| {
        a.distance
            .partial_cmp(&b.distance)
            .unwrap_or(Ordering::Equal)
            .then(a.source_index.cmp(&b.source_index))
            .then(a.target_index.cmp(&b.target_index))
    });

    correspondences
}

/// Generates putative correspondences by matching descriptors through a k-d
/// tree built over the target descriptor space.
///
/// Each source descriptor is matched to its nearest target descriptor, kept
/// only if the ratio of its two best distances beats `ratio` (a lone
/// candidate is kept unconditionally), and optionally verified mutually: with
/// `mutual_verification`, a match survives only if the target descriptor's
/// own best match points back at the source.
///
/// # Arguments
/// * `source_descriptors` / `target_descriptors`: one signature per keypoint.
/// * `source_indices` / `target_indices`: the cloud index of each keypoint,
///   parallel to the descriptor arrays.
/// * `ratio`: the Lowe ratio threshold, in `(0, 1]`.
/// * `mutual_verification`: whether to require agreement in both directions.
///
/// # Returns
/// Correspondences sorted ascending by descriptor distance.
#[cfg_attr(
    feature = "tracing",
    tracing::instrument("Generate Correspondences", skip_all, level = "info")
)]
pub fn generate_correspondences<T, const D: usize>(
    source_descriptors: &[Point<T, D>],
    source_indices: &[usize],
    target_descriptors: &[Point<T, D>],
    target_indices: &[usize],
    ratio: T,
    mutual_verification: bool,
) -> Result<Vec<Correspondence<T>>, RegistrationError>
where
    T: RealField + Copy + Send + Sync,
{
    validate_inputs(
        source_descriptors,
        source_indices,
        target_descriptors,
        target_indices,
        ratio,
    )?;

    let target_tree = KdTree::new(target_descriptors);
    let reverse_best = mutual_verification.then(|| {
        let source_tree = KdTree::new(source_descriptors);
        target_descriptors
            .iter()
            .map(|descriptor| source_tree.kneighbors(descriptor, 1).first().map(|n| n.index))
            .collect::<Vec<_>>()
    });

    let kept = source_descriptors
        .iter()
        .enumerate()
        .map(|(source_pos, descriptor)| {
            ratio_filter(&target_tree.kneighbors(descriptor, 2), ratio).filter(|best| {
                reverse_best
                    .as_ref()
                    .map_or(true, |reverse| reverse[best.index] == Some(source_pos))
            })
        })
        .collect::<Vec<_>>();

    Ok(sort_and_map(kept, source_indices, target_indices))
}

/// The brute-force twin of [`generate_correspondences`]: scans every target
/// descriptor for every source descriptor, parallelised over the source side.
///
/// Exists as the correctness oracle; it produces the identical correspondence
/// set, up to the stable ordering of equal-distance matches.
#[cfg_attr(
    feature = "tracing",
    tracing::instrument("Generate Correspondences Brute Force", skip_all, level = "info")
)]
pub fn generate_correspondences_brute_force<T, const D: usize>(
    source_descriptors: &[Point<T, D>],
    source_indices: &[usize],
    target_descriptors: &[Point<T, D>],
    target_indices: &[usize],
    ratio: T,
    mutual_verification: bool,
    parallel: bool,
) -> Result<Vec<Correspondence<T>>, RegistrationError>
where
    T: RealField + Copy + Send + Sync,
{
    validate_inputs(
        source_descriptors,
        source_indices,
        target_descriptors,
        target_indices,
        ratio,
    )?;

    let target_search = crate::spatial::BruteForce::new(target_descriptors);
    let reverse_best = mutual_verification.then(|| {
        let source_search = crate::spatial::BruteForce::new(source_descriptors);
        concurrent::map_indexed(parallel, target_descriptors.len(), |target_pos| {
            source_search
                .kneighbors(&target_descriptors[target_pos], 1)
                .first()
                .map(|n| n.index)
        })
    });

    let kept = concurrent::map_indexed(parallel, source_descriptors.len(), |source_pos| {
        ratio_filter(
            &target_search.kneighbors(&source_descriptors[source_pos], 2),
            ratio,
        )
        .filter(|best| {
            reverse_best
                .as_ref()
                .map_or(true, |reverse| reverse[best.index] == Some(source_pos))
        })
    });

    Ok(sort_and_map(kept, source_indices, target_indices))
}

#[cfg(test)]
mod tests {
    use crate::descriptors::FpfhSignature;

    use super::*;

    fn signature(fill: f64, hot_bin: usize) -> FpfhSignature<f64> {
        let mut signature = FpfhSignature::origin();
        signature.coords.fill(fill);
        signature.coords[hot_bin] = 1.0;
        signature
    }

    fn identity_indices(len: usize) -> Vec<usize> {
        (0..len).collect()
    }

    #[test]
    fn test_ratio_rejects_bad_parameter() {
        let descriptors = vec![signature(0.1, 0)];
        let indices = identity_indices(1);

        for bad_ratio in [0.0, -1.0, 1.5] {
            assert_eq!(
                generate_correspondences(
                    &descriptors,
                    &indices,
                    &descriptors,
                    &indices,
                    bad_ratio,
                    false
                )
                .err(),
                Some(RegistrationError::ParameterError("ratio must lie in (0, 1]"))
            );
        }
    }

    #[test]
    fn test_empty_inputs_are_invalid() {
        let descriptors: Vec<FpfhSignature<f64>> = vec![signature(0.1, 0)];
        let empty: Vec<FpfhSignature<f64>> = Vec::new();

        assert!(matches!(
            generate_correspondences(&empty, &[], &descriptors, &[0], 0.8, false),
            Err(RegistrationError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_distinct_descriptors_match_one_to_one() {
        let source = vec![signature(0.0, 0), signature(0.0, 5), signature(0.0, 9)];
        let target = vec![signature(0.0, 5), signature(0.0, 9), signature(0.0, 0)];
        let source_indices = vec![10, 20, 30];
        let target_indices = vec![100, 200, 300];

        let correspondences = generate_correspondences(
            &source,
            &source_indices,
            &target,
            &target_indices,
            0.8,
            true,
        )
        .unwrap();

        assert_eq!(correspondences.len(), 3);
        for correspondence in &correspondences {
            assert!(correspondence.distance < 1e-9);
        }
        assert!(correspondences
            .iter()
            .any(|c| c.source_index == 10 && c.target_index == 300));
        assert!(correspondences
            .iter()
            .any(|c| c.source_index == 20 && c.target_index == 100));
    }

    #[test]
    fn test_ratio_test_rejects_ambiguous_match() {
        // Two nearly identical targets make every match ambiguous.
        let source = vec![signature(0.0, 3)];
        let mut near_duplicate = signature(0.0, 3);
        near_duplicate.coords[4] = 0.05;
        let target = vec![signature(0.01, 3), near_duplicate];

        let correspondences = generate_correspondences(
            &source,
            &identity_indices(1),
            &target,
            &identity_indices(2),
            0.8,
            false,
        )
        .unwrap();

        assert!(correspondences.is_empty());
    }

    #[test]
    fn test_single_target_kept_unconditionally() {
        let source = vec![signature(0.0, 1)];
        let target = vec![signature(0.3, 7)];

        let correspondences = generate_correspondences(
            &source,
            &identity_indices(1),
            &target,
            &identity_indices(1),
            0.5,
            false,
        )
        .unwrap();

        assert_eq!(correspondences.len(), 1);
    }

    #[test]
    fn test_output_sorted_by_distance() {
        let source = vec![signature(0.0, 2), signature(0.0, 8)];
        let mut close_match = signature(0.0, 2);
        close_match.coords[0] = 0.01;
        let mut far_match = signature(0.0, 8);
        far_match.coords[0] = 0.4;
        let target = vec![far_match, close_match];

        let correspondences = generate_correspondences(
            &source,
            &identity_indices(2),
            &target,
            &identity_indices(2),
            0.9,
            false,
        )
        .unwrap();

        assert_eq!(correspondences.len(), 2);
        assert!(correspondences[0].distance <= correspondences[1].distance);
    }

    #[test]
    fn test_brute_force_agrees_with_index_variant() {
        let source = (0..20).map(|i| signature(0.01 * i as f64, i % 33)).collect::<Vec<_>>();
        let target = (0..25)
            .map(|i| signature(0.013 * i as f64, (i * 7) % 33))
            .collect::<Vec<_>>();
        let source_indices = identity_indices(source.len());
        let target_indices = identity_indices(target.len());

        for mutual in [false, true] {
            let indexed = generate_correspondences(
                &source,
                &source_indices,
                &target,
                &target_indices,
                0.9,
                mutual,
            )
            .unwrap();
            let brute = generate_correspondences_brute_force(
                &source,
                &source_indices,
                &target,
                &target_indices,
                0.9,
                mutual,
                true,
            )
            .unwrap();

            assert_eq!(indexed, brute);
        }
    }
}
