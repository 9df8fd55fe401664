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

use nalgebra::{Isometry3, Point3, RealField};
use num_traits::AsPrimitive;

use crate::{
    concurrent,
    registration::IterationStats,
    spatial::KdTree,
    types::{se3::transform_delta_norm, IsFinite, PointCloud, RegistrationError},
};

pub use aa_icp::{anderson_icp, AndersonIcpConfiguration, AndersonIcpConfigurationBuilder};
pub use gicp::{generalized_icp, GicpConfiguration, GicpConfigurationBuilder};
pub use icp::icp;
pub use ndt::{ndt_registration, NdtConfiguration, NdtConfigurationBuilder};
pub use point_to_plane::point_to_plane_icp;

mod aa_icp;
mod gicp;
mod icp;
mod ndt;
mod point_to_plane;

#[cfg(feature = "pregenerated")]
pub(crate) mod single_precision {
    pub use super::icp::single_precision::*;
}

#[cfg(feature = "pregenerated")]
pub(crate) mod double_precision {
    pub use super::icp::double_precision::*;
}

/// The configuration shared by every fine registration algorithm.
#[derive(Clone, Copy, Debug)]
pub struct FineConfiguration<T> {
    pub(crate) max_iterations: usize,
    pub(crate) max_correspondence_distance: T,
    pub(crate) transformation_epsilon: T,
    pub(crate) euclidean_fitness_epsilon: T,
    pub(crate) outlier_rejection_ratio: T,
    pub(crate) parallel: bool,
    pub(crate) record_history: bool,
}

impl<T: 'static + Copy> FineConfiguration<T>
where
    f64: AsPrimitive<T>,
{
    /// Returns a builder for the configuration struct.
    pub fn builder() -> FineConfigurationBuilder<T> {
        FineConfigurationBuilder {
            _internal: FineConfiguration {
                max_iterations: 50,
                max_correspondence_distance: 1.0.as_(),
                transformation_epsilon: 1e-6.as_(),
                euclidean_fitness_epsilon: 1e-6.as_(),
                outlier_rejection_ratio: 0.0.as_(),
                parallel: true,
                record_history: false,
            },
        }
    }
}

/// A Builder-pattern struct for safely constructing a [`FineConfiguration`].
#[derive(Clone, Copy, Debug)]
pub struct FineConfigurationBuilder<T> {
    _internal: FineConfiguration<T>,
}

impl<T: Copy> FineConfigurationBuilder<T> {
    /// The iteration budget before giving up on convergence.
    pub fn with_max_iterations(&self, max_iterations: usize) -> Self {
        Self {
            _internal: FineConfiguration {
                max_iterations,
                ..self._internal
            },
        }
    }

    /// Correspondences farther than this are discarded each iteration.
    pub fn with_max_correspondence_distance(&self, max_correspondence_distance: T) -> Self {
        Self {
            _internal: FineConfiguration {
                max_correspondence_distance,
                ..self._internal
            },
        }
    }

    /// Convergence threshold on the Frobenius norm of the transform change.
    pub fn with_transformation_epsilon(&self, transformation_epsilon: T) -> Self {
        Self {
            _internal: FineConfiguration {
                transformation_epsilon,
                ..self._internal
            },
        }
    }

    /// Convergence threshold on the change of the mean error.
    pub fn with_euclidean_fitness_epsilon(&self, euclidean_fitness_epsilon: T) -> Self {
        Self {
            _internal: FineConfiguration {
                euclidean_fitness_epsilon,
                ..self._internal
            },
        }
    }

    /// Fraction of the worst correspondences (by distance) dropped before
    /// solving each iteration; zero disables rejection.
    pub fn with_outlier_rejection_ratio(&self, outlier_rejection_ratio: T) -> Self {
        Self {
            _internal: FineConfiguration {
                outlier_rejection_ratio,
                ..self._internal
            },
        }
    }

    /// Whether per-iteration fan-outs use the thread pool.
    pub fn with_parallel(&self, parallel: bool) -> Self {
        Self {
            _internal: FineConfiguration {
                parallel,
                ..self._internal
            },
        }
    }

    /// Whether per-iteration statistics are recorded into the result.
    pub fn with_record_history(&self, record_history: bool) -> Self {
        Self {
            _internal: FineConfiguration {
                record_history,
                ..self._internal
            },
        }
    }

    /// Generates a [`FineConfiguration`] from the struct currently contained
    /// by the builder, leaving the builder intact for another use.
    pub fn build(&self) -> FineConfiguration<T> {
        self._internal
    }
}

pub(crate) fn validate_fine_inputs<T>(
    source: &PointCloud<T>,
    target: &PointCloud<T>,
    config: &FineConfiguration<T>,
) -> Result<(), RegistrationError>
where
    T: RealField + Copy + IsFinite,
{
    if config.max_iterations == 0 {
        return Err(RegistrationError::ParameterError(
            "max iterations must be positive",
        ));
    }

    if config.max_correspondence_distance <= T::zero() {
        return Err(RegistrationError::ParameterError(
            "max correspondence distance must be positive",
        ));
    }

    if config.outlier_rejection_ratio < T::zero() || config.outlier_rejection_ratio >= T::one() {
        return Err(RegistrationError::ParameterError(
            "outlier rejection ratio must lie in [0, 1)",
        ));
    }

    if source.is_empty() || target.is_empty() {
        return Err(RegistrationError::InvalidInput(
            "registration requires non-empty source and target clouds",
        ));
    }
    source.validate()?;
    target.validate()?;

    Ok(())
}

/// One matched pair of a fine-registration iteration.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct FinePair<T> {
    pub(crate) source_index: usize,
    pub(crate) target_index: usize,
    pub(crate) distance: T,
}

/// Matches every transformed source point to its nearest target within the
/// configured distance, fanning the queries out when `parallel` is set.
pub(crate) fn find_fine_correspondences<T>(
    transformed_source: &[Point3<T>],
    target_tree: &KdTree<T, 3>,
    config: &FineConfiguration<T>,
) -> Vec<FinePair<T>>
where
    T: RealField + Copy + Send + Sync,
{
    concurrent::map_indexed(config.parallel, transformed_source.len(), |source_index| {
        target_tree
            .kneighbors(&transformed_source[source_index], 1)
            .first()
            .filter(|nearest| nearest.distance <= config.max_correspondence_distance)
            .map(|nearest| FinePair {
                source_index,
                target_index: nearest.index,
                distance: nearest.distance,
            })
    })
    .into_iter()
    .flatten()
    .collect()
}

/// Drops the worst `outlier_rejection_ratio` of the pairs by distance,
/// keeping at least one pair.
pub(crate) fn reject_outlier_pairs<T>(pairs: &mut Vec<FinePair<T>>, rejection_ratio: T)
where
    T: RealField + Copy,
    T: AsPrimitive<usize>,
    usize: AsPrimitive<T>,
{
    if rejection_ratio <= T::zero() || pairs.is_empty() {
        return;
    }

    pairs.sort_by(|a, b| {
        a.distance
            .partial_cmp(&b.distance)
            .unwrap_or(Ordering::Equal)
            .then(a.source_index.cmp(&b.source_index))
    });

    let keep: usize = <T as AsPrimitive<usize>>::as_(
        <usize as AsPrimitive<T>>::as_(pairs.len()) * (T::one() - rejection_ratio),
    )
    .max(1);
    pairs.truncate(keep);
}

/// The two shared convergence criteria: the transform change falling under
/// `transformation_epsilon`, or the mean-error change falling under
/// `euclidean_fitness_epsilon`.
pub(crate) fn has_converged<T>(
    previous: &Isometry3<T>,
    current: &Isometry3<T>,
    error_change: T,
    config: &FineConfiguration<T>,
) -> bool
where
    T: RealField + Copy,
{
    transform_delta_norm(previous, current) < config.transformation_epsilon
        || error_change < config.euclidean_fitness_epsilon
}

/// Appends an entry to the optional iteration history.
pub(crate) fn record_iteration<T>(
    history: &mut Vec<IterationStats<T>>,
    config: &FineConfiguration<T>,
    iteration: usize,
    transform: &Isometry3<T>,
    error: T,
    error_change: T,
    num_correspondences: usize,
) where
    T: RealField + Copy,
{
    if config.record_history {
        history.push(IterationStats {
            iteration,
            transform: *transform,
            error,
            error_change,
            num_correspondences,
        });
    }
}

/// Mean squared distance of the matched pairs under `transform`.
pub(crate) fn mean_squared_error<T>(
    source_points: &[Point3<T>],
    target_points: &[Point3<T>],
    pairs: &[FinePair<T>],
    transform: &Isometry3<T>,
) -> T
where
    T: RealField + Copy + num_traits::Bounded,
    usize: AsPrimitive<T>,
{
    if pairs.is_empty() {
        return <T as num_traits::Bounded>::max_value();
    }

    pairs
        .iter()
        .fold(T::zero(), |acc, pair| {
            let transformed = transform.transform_point(&source_points[pair.source_index]);
            acc + (transformed - target_points[pair.target_index]).norm_squared()
        })
        / pairs.len().as_()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outlier_rejection_keeps_best() {
        let mut pairs = (0..10)
            .map(|idx| FinePair {
                source_index: idx,
                target_index: idx,
                distance: idx as f64,
            })
            .collect::<Vec<_>>();

        reject_outlier_pairs(&mut pairs, 0.3);
        assert_eq!(pairs.len(), 7);
        assert!(pairs.iter().all(|pair| pair.distance < 7.0));
    }

    #[test]
    fn test_outlier_rejection_keeps_at_least_one() {
        let mut pairs = vec![FinePair {
            source_index: 0,
            target_index: 0,
            distance: 1.0f32,
        }];
        reject_outlier_pairs(&mut pairs, 0.99);
        assert_eq!(pairs.len(), 1);
    }

    #[test]
    fn test_fine_validation() {
        let cloud = PointCloud::from_points(vec![Point3::new(0.0f32, 0.0, 0.0)]);
        let empty = PointCloud::<f32>::new();

        assert!(matches!(
            validate_fine_inputs(&empty, &cloud, &FineConfiguration::builder().build()),
            Err(RegistrationError::InvalidInput(_))
        ));
        assert!(matches!(
            validate_fine_inputs(
                &cloud,
                &cloud,
                &FineConfiguration::builder()
                    .with_max_correspondence_distance(0.0)
                    .build()
            ),
            Err(RegistrationError::ParameterError(_))
        ));
    }

    #[test]
    fn test_correspondence_gating() {
        let source = vec![Point3::new(0.0f64, 0.0, 0.0), Point3::new(10.0, 0.0, 0.0)];
        let target = vec![Point3::new(0.1, 0.0, 0.0)];
        let tree = KdTree::new(target.as_slice());
        let config = FineConfiguration::builder()
            .with_max_correspondence_distance(1.0)
            .build();

        let pairs = find_fine_correspondences(&source, &tree, &config);
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].source_index, 0);
    }
}
