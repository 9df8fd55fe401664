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

use nalgebra::{Matrix3, Point3, RealField, Vector3};
use num_traits::{AsPrimitive, Bounded};
use rand::{seq::SliceRandom, Rng, SeedableRng};

use crate::{
    metrics::lcp_score_with_tree,
    registration::{estimate_rigid_transform_svd, CoarseConfiguration, RegistrationResult},
    spatial::KdTree,
    types::{IsFinite, PointCloud, RegistrationError},
};

/// Tolerance on the two affine invariants when matching congruent bases.
/// Empirical, inherited from the reference implementations.
pub(crate) const INVARIANT_TOLERANCE: f64 = 0.1;

/// Random target quadruples 4PCS examines per source base.
const MAX_CONGRUENT_TRIES: usize = 1000;

/// Configuration of the 4PCS family (shared by [`four_pcs_registration`] and
/// [`super_four_pcs_registration`](crate::registration::super_four_pcs_registration)).
#[derive(Clone, Copy, Debug)]
pub struct FourPcsConfiguration<T> {
    pub(crate) coarse: CoarseConfiguration<T>,
    pub(crate) delta: T,
    pub(crate) overlap: T,
    pub(crate) sample_size: usize,
    pub(crate) num_bases: usize,
    pub(crate) pair_distance_epsilon: Option<T>,
    pub(crate) grid_resolution: Option<T>,
    pub(crate) max_pairs: usize,
}

impl<T: 'static + Copy> FourPcsConfiguration<T>
where
    f64: AsPrimitive<T>,
{
    /// Returns a builder for the configuration struct.
    pub fn builder() -> FourPcsConfigurationBuilder<T> {
        FourPcsConfigurationBuilder {
            _internal: FourPcsConfiguration {
                coarse: CoarseConfiguration::builder().build(),
                delta: 0.01.as_(),
                overlap: 0.5.as_(),
                sample_size: 500,
                num_bases: 10,
                pair_distance_epsilon: None,
                grid_resolution: None,
                max_pairs: 1000,
            },
        }
    }
}

/// A Builder-pattern struct for safely constructing a [`FourPcsConfiguration`].
#[derive(Clone, Copy, Debug)]
pub struct FourPcsConfigurationBuilder<T> {
    _internal: FourPcsConfiguration<T>,
}

impl<T: Copy> FourPcsConfigurationBuilder<T> {
    /// Replaces the shared coarse parameters.
    pub fn with_coarse(&self, coarse: CoarseConfiguration<T>) -> Self {
        Self {
            _internal: FourPcsConfiguration {
                coarse,
                ..self._internal
            },
        }
    }

    /// The registration precision: coplanarity uses `2δ`, base points must be
    /// `10δ` apart, and LCP inliers must land within `δ`.
    pub fn with_delta(&self, delta: T) -> Self {
        Self {
            _internal: FourPcsConfiguration {
                delta,
                ..self._internal
            },
        }
    }

    /// The assumed fraction of the source that overlaps the target, in (0, 1].
    pub fn with_overlap(&self, overlap: T) -> Self {
        Self {
            _internal: FourPcsConfiguration {
                overlap,
                ..self._internal
            },
        }
    }

    /// How many points are sampled from each cloud before matching.
    pub fn with_sample_size(&self, sample_size: usize) -> Self {
        Self {
            _internal: FourPcsConfiguration {
                sample_size,
                ..self._internal
            },
        }
    }

    /// How many coplanar source bases are extracted and matched.
    pub fn with_num_bases(&self, num_bases: usize) -> Self {
        Self {
            _internal: FourPcsConfiguration {
                num_bases,
                ..self._internal
            },
        }
    }

    /// Half-width of the distance band used when extracting point pairs
    /// (Super4PCS only); defaults to `2δ`.
    pub fn with_pair_distance_epsilon(&self, pair_distance_epsilon: Option<T>) -> Self {
        Self {
            _internal: FourPcsConfiguration {
                pair_distance_epsilon,
                ..self._internal
            },
        }
    }

    /// Voxel edge length of the pair-extraction grid (Super4PCS only);
    /// defaults to five times the median nearest-neighbour distance.
    pub fn with_grid_resolution(&self, grid_resolution: Option<T>) -> Self {
        Self {
            _internal: FourPcsConfiguration {
                grid_resolution,
                ..self._internal
            },
        }
    }

    /// Cap on extracted pairs per diagonal (Super4PCS only).
    pub fn with_max_pairs(&self, max_pairs: usize) -> Self {
        Self {
            _internal: FourPcsConfiguration {
                max_pairs,
                ..self._internal
            },
        }
    }

    /// Generates a [`FourPcsConfiguration`] from the struct currently
    /// contained by the builder, leaving the builder intact for another use.
    pub fn build(&self) -> FourPcsConfiguration<T> {
        self._internal
    }
}

/// A coplanar 4-point base with its plane and the two affine invariants of
/// its diagonal intersection.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Base4Pcs<T: RealField> {
    pub(crate) indices: [usize; 4],
    pub(crate) points: [Point3<T>; 4],
    pub(crate) normal: Vector3<T>,
    pub(crate) invariant1: T,
    pub(crate) invariant2: T,
}

pub(crate) fn validate_four_pcs_inputs<T>(
    source: &PointCloud<T>,
    target: &PointCloud<T>,
    config: &FourPcsConfiguration<T>,
) -> Result<(), RegistrationError>
where
    T: RealField + Copy + IsFinite,
{
    if config.delta <= T::zero() {
        return Err(RegistrationError::ParameterError("delta must be positive"));
    }

    if config.overlap <= T::zero() || config.overlap > T::one() {
        return Err(RegistrationError::ParameterError(
            "overlap must lie in (0, 1]",
        ));
    }

    if source.is_empty() || target.is_empty() {
        return Err(RegistrationError::InvalidInput(
            "registration requires non-empty source and target clouds",
        ));
    }
    source.validate()?;
    target.validate()?;

    if source.len() < 4 || target.len() < 4 {
        return Err(RegistrationError::InsufficientSamples {
            required: 4,
            actual: source.len().min(target.len()),
        });
    }

    Ok(())
}

/// Uniformly samples `num_samples` point indices. A fresh generator is seeded
/// per cloud, so the source and target of an aligned pair see the same
/// permutation.
pub(crate) fn sample_point_indices<T: RealField + Copy>(
    cloud: &PointCloud<T>,
    num_samples: usize,
    seed: u64,
) -> Vec<usize> {
    if num_samples >= cloud.len() {
        return (0..cloud.len()).collect();
    }

    let mut rng = rand::rngs::SmallRng::seed_from_u64(seed);
    let mut indices: Vec<usize> = (0..cloud.len()).collect();
    indices.shuffle(&mut rng);
    indices.truncate(num_samples);
    indices
}

/// Coplanarity of a quadruple: distance of the fourth point to the plane of
/// the first three, against `tolerance`. Degenerate (collinear) triples fail.
pub(crate) fn are_coplanar<T>(points: &[Point3<T>; 4], tolerance: T) -> bool
where
    T: RealField + Copy,
{
    let v1 = points[1] - points[0];
    let v2 = points[2] - points[0];
    let mut normal = v1.cross(&v2);
    if normal.normalize_mut() <= T::default_epsilon() {
        return false;
    }

    let offset = -normal.dot(&points[0].coords);
    (normal.dot(&points[3].coords) + offset).abs() <= tolerance
}

/// Computes the two affine invariants of the base: the parameters `s` (along
/// diagonal AC) and `t` (along diagonal BD) of the diagonals' intersection.
/// The plane normal completes the linear system so it stays non-singular.
pub(crate) fn compute_invariants<T>(base: &mut Base4Pcs<T>) -> bool
where
    T: RealField + Copy,
{
    let ac_dir = base.points[2] - base.points[0];
    let bd_dir = base.points[3] - base.points[1];

    let system = Matrix3::from_columns(&[ac_dir, -bd_dir, base.normal]);
    let rhs = base.points[1] - base.points[0];

    match system.full_piv_lu().solve(&rhs) {
        Some(params) => {
            base.invariant1 = params[0];
            base.invariant2 = params[1];
            true
        }
        None => false,
    }
}

/// Assembles and validates a base from four cloud indices: coplanarity,
/// plane parameters, and invariants.
pub(crate) fn base_from_indices<T>(
    points: &[Point3<T>],
    indices: [usize; 4],
    coplanar_tolerance: T,
) -> Option<Base4Pcs<T>>
where
    T: RealField + Copy,
{
    let base_points = [
        points[indices[0]],
        points[indices[1]],
        points[indices[2]],
        points[indices[3]],
    ];

    if !are_coplanar(&base_points, coplanar_tolerance) {
        return None;
    }

    let v1 = base_points[1] - base_points[0];
    let v2 = base_points[2] - base_points[0];
    let normal = v1.cross(&v2).normalize();

    let mut base = Base4Pcs {
        indices,
        points: base_points,
        normal,
        invariant1: T::zero(),
        invariant2: T::zero(),
    };

    compute_invariants(&mut base).then_some(base)
}

/// Extracts up to `num_bases` wide, coplanar 4-point bases from the sampled
/// source points: coplanar within `2δ`, pairwise separated by at least `10δ`.
#[cfg_attr(
    feature = "tracing",
    tracing::instrument("Extract Coplanar Bases", skip_all, level = "debug")
)]
pub(crate) fn extract_coplanar_bases<T>(
    points: &[Point3<T>],
    sample_indices: &[usize],
    config: &FourPcsConfiguration<T>,
) -> Vec<Base4Pcs<T>>
where
    T: RealField + Copy,
    f64: AsPrimitive<T>,
{
    let mut bases = Vec::with_capacity(config.num_bases);
    if sample_indices.len() < 4 {
        return bases;
    }

    let coplanar_tolerance = config.delta * 2.0.as_();
    let min_separation = config.delta * 10.0.as_();
    let max_attempts = config.num_bases * 100;

    let mut rng = rand::rngs::SmallRng::seed_from_u64(config.coarse.random_seed);

    let mut attempts = 0;
    while bases.len() < config.num_bases && attempts < max_attempts {
        attempts += 1;

        let mut selected = [0usize; 4];
        let mut cursor = 0;
        while cursor < 4 {
            let candidate = sample_indices[rng.gen_range(0..sample_indices.len())];
            if !selected[..cursor].contains(&candidate) {
                selected[cursor] = candidate;
                cursor += 1;
            }
        }

        let Some(base) = base_from_indices(points, selected, coplanar_tolerance) else {
            continue;
        };

        let mut wide_enough = true;
        'pairs: for i in 0..4 {
            for j in (i + 1)..4 {
                if (base.points[i] - base.points[j]).norm() < min_separation {
                    wide_enough = false;
                    break 'pairs;
                }
            }
        }

        if wide_enough {
            bases.push(base);
        }
    }

    bases
}

/// Shared evaluation state of the 4PCS family: tracks the best candidate by
/// `(inlier count, LCP score)` and answers the early-stop question.
pub(crate) struct CandidateTracker<'a, T: RealField + Copy> {
    pub(crate) source_sample_points: Vec<Point3<T>>,
    pub(crate) source_sample_indices: &'a [usize],
    pub(crate) target_tree: KdTree<'a, T, 3>,
    pub(crate) best_transform: nalgebra::Isometry3<T>,
    pub(crate) best_score: T,
    pub(crate) best_inliers: Vec<usize>,
    early_stop_count: usize,
    delta: T,
    parallel: bool,
}

impl<'a, T> CandidateTracker<'a, T>
where
    T: RealField + Copy + Bounded + Send + Sync,
    usize: AsPrimitive<T>,
    f64: AsPrimitive<T>,
    T: AsPrimitive<usize>,
{
    pub(crate) fn new(
        source: &PointCloud<T>,
        source_sample_indices: &'a [usize],
        target_sample_points: &'a [Point3<T>],
        config: &FourPcsConfiguration<T>,
    ) -> Self {
        let source_sample_points = source_sample_indices
            .iter()
            .map(|&idx| source.points[idx])
            .collect::<Vec<_>>();

        let early_stop_count = <T as AsPrimitive<usize>>::as_(
            <usize as AsPrimitive<T>>::as_(source_sample_indices.len())
                * config.overlap
                * 0.9.as_(),
        );

        Self {
            source_sample_points,
            source_sample_indices,
            target_tree: KdTree::new(target_sample_points),
            best_transform: nalgebra::Isometry3::identity(),
            best_score: <T as Bounded>::max_value(),
            best_inliers: Vec::new(),
            early_stop_count,
            delta: config.delta,
            parallel: config.coarse.parallel,
        }
    }

    /// Estimates the transform of a source/target base pairing, scores it by
    /// LCP over the sampled clouds, and keeps it when it beats the best so
    /// far. Returns true when the early-stop quota is reached.
    pub(crate) fn evaluate(&mut self, source_base: &Base4Pcs<T>, target_base: &Base4Pcs<T>) -> bool {
        let Ok(transform) =
            estimate_rigid_transform_svd(&source_base.points, &target_base.points)
        else {
            return false; // degenerate pairing, recovered locally
        };

        let (score, sampled_inliers) = lcp_score_with_tree(
            &self.source_sample_points,
            &self.target_tree,
            &transform,
            self.delta,
            self.parallel,
        );

        if sampled_inliers.len() > self.best_inliers.len()
            || (sampled_inliers.len() == self.best_inliers.len() && score < self.best_score)
        {
            self.best_transform = transform;
            self.best_score = score;
            // Sample positions map back to original cloud indices.
            self.best_inliers = sampled_inliers
                .into_iter()
                .map(|pos| self.source_sample_indices[pos])
                .collect();
        }

        self.best_inliers.len() >= self.early_stop_count.max(1)
    }

    pub(crate) fn into_result(
        self,
        num_iterations: usize,
        min_inliers: usize,
    ) -> RegistrationResult<T> {
        let converged = self.best_inliers.len() >= min_inliers.max(1);
        RegistrationResult {
            transform: self.best_transform,
            fitness_score: self.best_score,
            inliers: self.best_inliers,
            num_iterations,
            converged,
            history: Vec::new(),
        }
    }
}

/// 4PCS rigid registration: correspondence-free alignment through congruent
/// coplanar 4-point bases.
///
/// Wide coplanar bases are extracted from a sampled subset of the source;
/// for each base, random target quadruples are screened by coplanarity, the
/// six pairwise distances (within `2δ`), and the two affine invariants of the
/// diagonal intersection (within 0.1). Surviving pairings are solved in
/// closed form and scored by LCP over the sampled clouds; the search stops
/// early once the inlier count reaches `0.9 · overlap · |source samples|`.
///
/// # Returns
/// The best [`RegistrationResult`]; inlier indices refer to the source cloud.
#[cfg_attr(
    feature = "tracing",
    tracing::instrument("4PCS Registration", skip_all, level = "info")
)]
pub fn four_pcs_registration<T>(
    source: &PointCloud<T>,
    target: &PointCloud<T>,
    config: &FourPcsConfiguration<T>,
) -> Result<RegistrationResult<T>, RegistrationError>
where
    T: RealField + Copy + Bounded + IsFinite + Send + Sync,
    usize: AsPrimitive<T>,
    f64: AsPrimitive<T>,
    T: AsPrimitive<usize>,
{
    validate_four_pcs_inputs(source, target, config)?;

    let source_samples =
        sample_point_indices(source, config.sample_size, config.coarse.random_seed);
    let target_samples =
        sample_point_indices(target, config.sample_size, config.coarse.random_seed);
    let target_sample_points = target_samples
        .iter()
        .map(|&idx| target.points[idx])
        .collect::<Vec<_>>();

    let source_bases = extract_coplanar_bases(&source.points, &source_samples, config);
    if source_bases.is_empty() {
        return Err(RegistrationError::InsufficientSamples {
            required: 4,
            actual: 0,
        });
    }
    log::debug!("4PCS extracted {} coplanar bases", source_bases.len());

    let mut tracker = CandidateTracker::new(source, &source_samples, &target_sample_points, config);
    let mut rng = rand::rngs::SmallRng::seed_from_u64(config.coarse.random_seed);

    let coplanar_tolerance = config.delta * 2.0.as_();
    let invariant_tolerance: T = INVARIANT_TOLERANCE.as_();

    let mut num_iterations = 0;

    'bases: for source_base in &source_bases {
        num_iterations += 1;

        let mut source_distances = [T::zero(); 6];
        let mut edge = 0;
        for i in 0..4 {
            for j in (i + 1)..4 {
                source_distances[edge] = (source_base.points[i] - source_base.points[j]).norm();
                edge += 1;
            }
        }

        for _ in 0..MAX_CONGRUENT_TRIES {
            let mut selected = [0usize; 4];
            let mut cursor = 0;
            let mut picks = 0;
            while cursor < 4 {
                picks += 1;
                if picks > 100 {
                    break;
                }
                let candidate = target_samples[rng.gen_range(0..target_samples.len())];
                if !selected[..cursor].contains(&candidate) {
                    selected[cursor] = candidate;
                    cursor += 1;
                }
            }
            if cursor < 4 {
                continue;
            }

            let Some(target_base) =
                base_from_indices(&target.points, selected, coplanar_tolerance)
            else {
                continue;
            };

            // Every source edge length must be present among the target's.
            let mut target_distances = [T::zero(); 6];
            let mut edge = 0;
            for i in 0..4 {
                for j in (i + 1)..4 {
                    target_distances[edge] =
                        (target_base.points[i] - target_base.points[j]).norm();
                    edge += 1;
                }
            }
            let distances_match = source_distances.iter().all(|&source_distance| {
                target_distances
                    .iter()
                    .any(|&target_distance| {
                        (source_distance - target_distance).abs() < coplanar_tolerance
                    })
            });
            if !distances_match {
                continue;
            }

            if (source_base.invariant1 - target_base.invariant1).abs() >= invariant_tolerance
                || (source_base.invariant2 - target_base.invariant2).abs() >= invariant_tolerance
            {
                continue;
            }

            if tracker.evaluate(source_base, &target_base) {
                log::debug!("4PCS early stop, found a good enough match");
                break 'bases;
            }
        }
    }

    let result = tracker.into_result(num_iterations, config.coarse.min_inliers);
    log::debug!(
        "4PCS finished after {} bases with {} inliers",
        result.num_iterations,
        result.inliers.len()
    );

    Ok(result)
}
