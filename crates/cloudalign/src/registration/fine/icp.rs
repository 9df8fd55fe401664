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

use nalgebra::{Isometry3, RealField};
use num_traits::{AsPrimitive, Bounded};

use crate::{
    registration::{
        estimate_rigid_transform_svd,
        fine::{
            find_fine_correspondences, has_converged, mean_squared_error, record_iteration,
            reject_outlier_pairs, validate_fine_inputs, FineConfiguration,
        },
        RegistrationResult,
    },
    spatial::KdTree,
    types::{IsFinite, PointCloud, RegistrationError},
};

/// Point-to-point ICP.
///
/// Each iteration transforms the source by the current estimate, matches every
/// point to its nearest target within the configured distance, optionally
/// drops the worst fraction by distance, and re-solves the closed-form SVD
/// alignment on the survivors. The loop ends when the transform change or the
/// mean-error change falls below its epsilon, or when the iteration budget is
/// exhausted (`converged = false`, never an error).
///
/// # Arguments
/// * `source` / `target`: the clouds to align; only geometry is used.
/// * `initial_guess`: an optional starting transform (identity otherwise).
/// * `config`: the shared fine-registration parameters.
///
/// # Returns
/// A [`RegistrationResult`] whose `inliers` are the source indices matched in
/// the final iteration and whose `fitness_score` is the final mean squared
/// error.
#[cfg_attr(
    feature = "tracing",
    tracing::instrument("Point To Point ICP", skip_all, level = "info")
)]
pub fn icp<T>(
    source: &PointCloud<T>,
    target: &PointCloud<T>,
    initial_guess: Option<Isometry3<T>>,
    config: &FineConfiguration<T>,
) -> Result<RegistrationResult<T>, RegistrationError>
where
    T: RealField + Copy + Bounded + IsFinite + Send + Sync,
    usize: AsPrimitive<T>,
    f64: AsPrimitive<T>,
    T: AsPrimitive<usize>,
{
    validate_fine_inputs(source, target, config)?;

    let target_tree = KdTree::new(&target.points);
    let mut current_transform = initial_guess.unwrap_or_else(Isometry3::identity);
    let mut previous_error = <T as Bounded>::max_value();

    let mut result = RegistrationResult::unconverged();
    result.transform = current_transform;

    for iteration in 0..config.max_iterations {
        result.num_iterations = iteration + 1;

        let transformed = source
            .points
            .iter()
            .map(|point| current_transform.transform_point(point))
            .collect::<Vec<_>>();

        let mut pairs = find_fine_correspondences(&transformed, &target_tree, config);
        if pairs.is_empty() {
            log::debug!("ICP iteration {iteration}: no correspondences in range");
            break;
        }
        reject_outlier_pairs(&mut pairs, config.outlier_rejection_ratio);

        let error = mean_squared_error(&source.points, &target.points, &pairs, &current_transform);
        let error_change = (previous_error - error).abs();
        record_iteration(
            &mut result.history,
            config,
            iteration,
            &current_transform,
            error,
            error_change,
            pairs.len(),
        );

        let (pair_source, pair_target): (Vec<_>, Vec<_>) = pairs
            .iter()
            .map(|pair| {
                (
                    transformed[pair.source_index],
                    target.points[pair.target_index],
                )
            })
            .unzip();
        let Ok(delta) = estimate_rigid_transform_svd(&pair_source, &pair_target) else {
            // A degenerate pair set cannot improve the estimate any further.
            result.inliers = pairs.iter().map(|pair| pair.source_index).collect();
            result.fitness_score = error;
            break;
        };

        let new_transform = delta * current_transform;
        let converged = has_converged(&current_transform, &new_transform, error_change, config);

        current_transform = new_transform;
        previous_error = error;
        result.inliers = pairs.iter().map(|pair| pair.source_index).collect();
        result.fitness_score =
            mean_squared_error(&source.points, &target.points, &pairs, &current_transform);

        if converged {
            log::trace!("ICP converged after {} iterations", iteration + 1);
            result.converged = true;
            break;
        }
    }

    result.transform = current_transform;
    Ok(result)
}

#[cfg(feature = "pregenerated")]
macro_rules! impl_icp {
    ($precision:expr, doc $doc:tt) => {
        ::paste::paste! {
            #[doc = "Pregenerated point-to-point ICP for " $doc " precision."]
            pub(crate) mod [<$doc _precision>] {
                use nalgebra::Isometry3;

                use crate::{
                    registration::{fine::FineConfiguration, RegistrationResult},
                    types::{PointCloud, RegistrationError},
                };

                #[doc = "A point-to-point ICP, in " $doc " precision."]
                #[doc = ""]
                #[doc = "# Arguments"]
                #[doc = "* `source`: the source [`PointCloud`]."]
                #[doc = "* `target`: the target [`PointCloud`]."]
                #[doc = "* `initial_guess`: an optional starting transform."]
                #[doc = "* `config`: a [`FineConfiguration`], specifying the behaviour of the algorithm."]
                #[doc = ""]
                #[doc = "# Returns"]
                #[doc = "A [`RegistrationResult`], or an error explaining what went wrong."]
                pub fn icp(
                    source: &PointCloud<$precision>,
                    target: &PointCloud<$precision>,
                    initial_guess: Option<Isometry3<$precision>>,
                    config: &FineConfiguration<$precision>,
                ) -> Result<RegistrationResult<$precision>, RegistrationError> {
                    super::super::icp(source, target, initial_guess, config)
                }
            }
        }
    };
}

#[cfg(feature = "pregenerated")]
impl_icp!(f32, doc single);
#[cfg(feature = "pregenerated")]
impl_icp!(f64, doc double);

#[cfg(test)]
mod tests {
    use nalgebra::{Point3, Vector3};

    use crate::utils::{generate_point_cloud, transform_point_cloud};

    use super::*;

    #[test]
    fn test_identity_alignment() {
        let cloud = PointCloud::from_points(vec![
            Point3::new(0.0f64, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(0.0, 1.0, 0.0),
            Point3::new(1.0, 1.0, 0.0),
            Point3::new(0.0, 0.0, 1.0),
        ]);
        let config = FineConfiguration::builder()
            .with_max_correspondence_distance(1.0)
            .build();

        let result = icp(&cloud, &cloud, None, &config).unwrap();

        assert!(result.converged);
        assert!(result.num_iterations <= 2);
        assert!(
            (result.transform.to_homogeneous() - Isometry3::identity().to_homogeneous()).norm()
                < 1e-6
        );
    }

    #[test]
    fn test_known_translation_recovery() {
        // Corners ordered with x = 1 first, so equal-distance matches resolve
        // toward the true counterparts.
        let corners = vec![
            Point3::new(1.0f64, 0.0, 0.0),
            Point3::new(1.0, 1.0, 0.0),
            Point3::new(1.0, 0.0, 1.0),
            Point3::new(1.0, 1.0, 1.0),
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(0.0, 1.0, 0.0),
            Point3::new(0.0, 0.0, 1.0),
            Point3::new(0.0, 1.0, 1.0),
        ];
        let translation = Vector3::new(0.5, 0.3, 0.2);
        let source = PointCloud::from_points(corners.clone());
        let target =
            PointCloud::from_points(corners.iter().map(|p| p + translation).collect::<Vec<_>>());

        let config = FineConfiguration::builder()
            .with_max_correspondence_distance(2.0)
            .build();
        let result = icp(&source, &target, None, &config).unwrap();

        assert!(result.converged);
        assert!(
            (result.transform.translation.vector - translation).norm() < 1e-4,
            "translation was {:?}",
            result.transform.translation.vector
        );
    }

    #[test]
    fn test_icp_3d_random_cloud() {
        let points = generate_point_cloud(500, std::array::from_fn(|_| -15.0f32..=15.0));
        let isom = nalgebra::Isometry3::new(
            Vector3::new(-0.8, 1.3, 0.2),
            Vector3::new(0.1, 0.2, -0.21),
        );
        let source = PointCloud::from_points(points.clone());
        let target = PointCloud::from_points(transform_point_cloud(&points, isom));

        let config = FineConfiguration::builder()
            .with_max_iterations(50)
            .with_max_correspondence_distance(10.0)
            .build();
        let result = icp(&source, &target, None, &config).unwrap();

        assert!(result.converged);
        assert!(result.fitness_score < 0.05);
    }

    #[test]
    fn test_refined_guess_converges_immediately() {
        let points = generate_point_cloud(300, std::array::from_fn(|_| -5.0f64..=5.0));
        let isom = nalgebra::Isometry3::new(
            Vector3::new(0.4, -0.3, 0.25),
            Vector3::new(0.05, -0.1, 0.15),
        );
        let source = PointCloud::from_points(points.clone());
        let target = PointCloud::from_points(transform_point_cloud(&points, isom));

        // Handing the ground truth in as the guess leaves nothing to solve.
        let config = FineConfiguration::builder()
            .with_max_correspondence_distance(5.0)
            .build();
        let result = icp(&source, &target, Some(isom), &config).unwrap();

        assert!(result.converged);
        assert!(result.num_iterations <= 2);
    }

    #[test]
    fn test_history_recording() {
        let points = generate_point_cloud(100, std::array::from_fn(|_| -2.0f32..=2.0));
        let source = PointCloud::from_points(points.clone());
        let target = PointCloud::from_points(
            points
                .iter()
                .map(|p| p + Vector3::new(0.1, 0.0, 0.0))
                .collect::<Vec<_>>(),
        );

        let config = FineConfiguration::builder()
            .with_max_correspondence_distance(1.0)
            .with_record_history(true)
            .build();
        let result = icp(&source, &target, None, &config).unwrap();

        assert!(result.converged);
        assert_eq!(result.history.len(), result.num_iterations);
        assert!(result
            .history
            .iter()
            .enumerate()
            .all(|(idx, stats)| stats.iteration == idx));
    }

    #[test]
    #[cfg(feature = "pregenerated")]
    fn test_pregenerated_entry_points() {
        let points = generate_point_cloud(100, std::array::from_fn(|_| -3.0f32..=3.0));
        let cloud = PointCloud::from_points(points);
        let config = FineConfiguration::builder()
            .with_max_correspondence_distance(1.0)
            .build();

        let result =
            crate::registration::single_precision::icp(&cloud, &cloud, None, &config).unwrap();
        assert!(result.converged);
    }

    #[test]
    fn test_empty_inputs_are_invalid() {
        let empty = PointCloud::<f32>::new();
        let cloud = PointCloud::from_points(vec![Point3::new(0.0, 0.0, 0.0)]);
        let config = FineConfiguration::builder().build();

        assert!(matches!(
            icp(&empty, &cloud, None, &config),
            Err(RegistrationError::InvalidInput(_))
        ));
        assert!(matches!(
            icp(&cloud, &empty, None, &config),
            Err(RegistrationError::InvalidInput(_))
        ));
    }
}
