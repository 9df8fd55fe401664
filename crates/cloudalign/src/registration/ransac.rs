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
use rand::{Rng, SeedableRng};

use crate::{
    correspondence::Correspondence,
    registration::{
        count_inliers, estimate_rigid_transform_svd, fitness_from_inliers, gather_pairs,
        is_sample_valid, CoarseConfiguration, RegistrationResult, SAMPLE_SIZE,
    },
    types::{IsFinite, PointCloud, RegistrationError},
};

/// Sliding window length of the stagnation check.
const CONVERGENCE_WINDOW: usize = 20;

/// `N = log(1 − p) / log(1 − (1 − e)^s)`, the adaptive iteration budget for
/// outlier ratio `e`, confidence `p` and sample size `s`.
pub(crate) fn calculate_iterations<T>(
    outlier_ratio: T,
    confidence: T,
    sample_size: usize,
    max_iterations: usize,
) -> usize
where
    T: RealField + Copy,
    T: AsPrimitive<usize>,
{
    if outlier_ratio <= T::zero() || outlier_ratio >= T::one() {
        return max_iterations;
    }

    let inlier_ratio = T::one() - outlier_ratio;
    let sample_success_prob = inlier_ratio.powi(sample_size as i32);
    if sample_success_prob <= T::zero() || sample_success_prob >= T::one() {
        return max_iterations;
    }

    let num_iterations = (T::one() - confidence).ln() / (T::one() - sample_success_prob).ln();
    <T as AsPrimitive<usize>>::as_(num_iterations.ceil()).max(1)
}

pub(crate) fn validate_coarse_inputs<T>(
    source: &PointCloud<T>,
    target: &PointCloud<T>,
    correspondences: &[Correspondence<T>],
    config: &CoarseConfiguration<T>,
) -> Result<(), RegistrationError>
where
    T: RealField + Copy + IsFinite,
{
    if config.max_iterations == 0 {
        return Err(RegistrationError::ParameterError(
            "max iterations must be positive",
        ));
    }

    if config.inlier_threshold <= T::zero() {
        return Err(RegistrationError::ParameterError(
            "inlier threshold must be positive",
        ));
    }

    if config.confidence <= T::zero() || config.confidence >= T::one() {
        return Err(RegistrationError::ParameterError(
            "confidence must lie in (0, 1)",
        ));
    }

    if source.is_empty() || target.is_empty() {
        return Err(RegistrationError::InvalidInput(
            "registration requires non-empty source and target clouds",
        ));
    }
    source.validate()?;
    target.validate()?;

    if correspondences.len() < SAMPLE_SIZE {
        return Err(RegistrationError::InsufficientSamples {
            required: SAMPLE_SIZE,
            actual: correspondences.len(),
        });
    }

    if correspondences
        .iter()
        .any(|c| c.source_index >= source.len() || c.target_index >= target.len())
    {
        return Err(RegistrationError::InvalidInput(
            "correspondence index out of bounds",
        ));
    }

    Ok(())
}

/// Correspondence-driven RANSAC rigid registration.
///
/// Repeatedly samples a minimal set of three correspondences, solves the
/// closed-form SVD alignment, counts inliers, and keeps the best model. The
/// iteration budget adapts to the best inlier ratio found so far; the search
/// additionally stops early once the inlier ratio beats the early-stop
/// threshold, or when the best inlier count has stagnated over a sliding
/// window of [`CONVERGENCE_WINDOW`] iterations (average improvement below 0.5
/// per iteration *and* relative improvement below 1 %).
///
/// Degenerate samples (duplicate indices, collinear source points) are
/// skipped locally and never surface as errors.
///
/// # Returns
/// The best [`RegistrationResult`]; `converged` is set only when the inlier
/// quota was reached. With `refine_result`, the transform is re-solved on all
/// inliers and the inliers recounted before returning.
#[cfg_attr(
    feature = "tracing",
    tracing::instrument("RANSAC Registration", skip_all, level = "info")
)]
pub fn ransac_registration<T>(
    source: &PointCloud<T>,
    target: &PointCloud<T>,
    correspondences: &[Correspondence<T>],
    config: &CoarseConfiguration<T>,
) -> Result<RegistrationResult<T>, RegistrationError>
where
    T: RealField + Copy + Bounded + IsFinite + Send + Sync,
    usize: AsPrimitive<T>,
    f64: AsPrimitive<T>,
    T: AsPrimitive<usize>,
{
    validate_coarse_inputs(source, target, correspondences, config)?;

    let num_correspondences = correspondences.len();
    let mut rng = rand::rngs::SmallRng::seed_from_u64(config.random_seed);

    // Initial outlier estimate; refined after every improvement.
    let mut outlier_ratio: T = 0.5.as_();
    let mut iterations = config.max_iterations.min(calculate_iterations(
        outlier_ratio,
        config.confidence,
        SAMPLE_SIZE,
        config.max_iterations,
    ));

    let mut best_transform = Isometry3::identity();
    let mut best_inliers: Vec<usize> = Vec::new();
    let mut inlier_history: Vec<usize> = Vec::with_capacity(CONVERGENCE_WINDOW);

    let mut result = RegistrationResult::unconverged();

    let mut iteration = 0;
    while iteration < iterations {
        result.num_iterations = iteration + 1;
        iteration += 1;

        // Partial Fisher-Yates shuffle: three distinct correspondences.
        let mut indices: Vec<usize> = (0..num_correspondences).collect();
        for slot in 0..SAMPLE_SIZE {
            let chosen = rng.gen_range(slot..num_correspondences);
            indices.swap(slot, chosen);
        }
        let sample = [
            correspondences[indices[0]],
            correspondences[indices[1]],
            correspondences[indices[2]],
        ];

        if !is_sample_valid(&source.points, &sample) {
            continue;
        }

        let (sample_source, sample_target) = gather_pairs(&source.points, &target.points, &sample);
        let Ok(transform) = estimate_rigid_transform_svd(&sample_source, &sample_target) else {
            continue; // degenerate sample, recovered locally
        };

        let inliers = count_inliers(
            &source.points,
            &target.points,
            correspondences,
            &transform,
            config.inlier_threshold,
            config.parallel,
        );

        if inliers.len() > best_inliers.len() {
            best_transform = transform;
            best_inliers = inliers;

            outlier_ratio = (num_correspondences - best_inliers.len()).as_()
                / num_correspondences.as_();
            iterations = config.max_iterations.min(calculate_iterations(
                outlier_ratio,
                config.confidence,
                SAMPLE_SIZE,
                config.max_iterations,
            ));

            let inlier_ratio: T = best_inliers.len().as_() / num_correspondences.as_();
            if inlier_ratio >= config.early_stop_ratio {
                log::debug!("RANSAC early stop at inlier ratio {inlier_ratio}");
                break;
            }
        }

        inlier_history.push(best_inliers.len());
        if inlier_history.len() > CONVERGENCE_WINDOW {
            inlier_history.remove(0);
        }

        if inlier_history.len() >= CONVERGENCE_WINDOW {
            let window_improvement = inlier_history[inlier_history.len() - 1] - inlier_history[0];
            let avg_improvement: T =
                window_improvement.as_() / (CONVERGENCE_WINDOW - 1).as_();

            let relative_improvement = if inlier_history[0] > 0 {
                window_improvement.as_() / inlier_history[0].as_()
            } else {
                T::zero()
            };

            if avg_improvement < 0.5.as_() && relative_improvement < 0.01.as_() {
                log::debug!(
                    "RANSAC converged, inlier count improved by {window_improvement} over the last {CONVERGENCE_WINDOW} iterations"
                );
                break;
            }
        }
    }

    if config.refine_result && best_inliers.len() >= SAMPLE_SIZE {
        let refinement_sample = best_inliers
            .iter()
            .map(|&idx| correspondences[idx])
            .collect::<Vec<_>>();
        let (refined_source, refined_target) =
            gather_pairs(&source.points, &target.points, &refinement_sample);

        if let Ok(refined) = estimate_rigid_transform_svd(&refined_source, &refined_target) {
            best_transform = refined;
            best_inliers = count_inliers(
                &source.points,
                &target.points,
                correspondences,
                &best_transform,
                config.inlier_threshold,
                config.parallel,
            );
        }
    }

    result.converged = best_inliers.len() >= config.min_inliers;
    result.fitness_score = fitness_from_inliers(
        &source.points,
        &target.points,
        correspondences,
        &best_inliers,
        &best_transform,
        config.inlier_threshold,
    );
    result.transform = best_transform;
    result.inliers = best_inliers;

    log::debug!(
        "RANSAC finished after {} iterations with {}/{} inliers",
        result.num_iterations,
        result.inliers.len(),
        num_correspondences
    );

    Ok(result)
}

#[cfg(feature = "pregenerated")]
macro_rules! impl_ransac_registration {
    ($precision:expr, doc $doc:tt) => {
        ::paste::paste! {
            #[doc = "Pregenerated RANSAC registration for " $doc " precision."]
            pub(crate) mod [<$doc _precision>] {
                use crate::{
                    correspondence::Correspondence,
                    registration::{CoarseConfiguration, RegistrationResult},
                    types::{PointCloud, RegistrationError},
                };

                #[doc = "A RANSAC rigid registration, in " $doc " precision."]
                #[doc = ""]
                #[doc = "# Arguments"]
                #[doc = "* `source`: the source [`PointCloud`]."]
                #[doc = "* `target`: the target [`PointCloud`]."]
                #[doc = "* `correspondences`: putative matches between the two clouds."]
                #[doc = "* `config`: a [`CoarseConfiguration`], specifying the behaviour of the algorithm."]
                #[doc = ""]
                #[doc = "# Returns"]
                #[doc = "A [`RegistrationResult`], or an error explaining what went wrong."]
                pub fn ransac_registration(
                    source: &PointCloud<$precision>,
                    target: &PointCloud<$precision>,
                    correspondences: &[Correspondence<$precision>],
                    config: &CoarseConfiguration<$precision>,
                ) -> Result<RegistrationResult<$precision>, RegistrationError> {
                    super::super::ransac_registration(source, target, correspondences, config)
                }
            }
        }
    };
}

#[cfg(feature = "pregenerated")]
impl_ransac_registration!(f32, doc single);
#[cfg(feature = "pregenerated")]
impl_ransac_registration!(f64, doc double);

#[cfg(test)]
mod tests {
    use nalgebra::{Point3, Vector3};

    use crate::registration::test_utils::noisy_scene;

    use super::*;

    #[test]
    fn test_ransac_on_noisy_correspondences() {
        let scene = noisy_scene(700, false);
        let config = CoarseConfiguration::builder()
            .with_max_iterations(1000)
            .with_inlier_threshold(0.05)
            .with_confidence(0.99)
            .with_random_seed(11)
            .with_refine_result(true)
            .build();

        let result =
            ransac_registration(&scene.source, &scene.target, &scene.correspondences, &config)
                .unwrap();

        assert!(result.converged);
        assert!(
            result.inliers.len() >= 600,
            "only {} inliers found",
            result.inliers.len()
        );
        let drift = (result.transform.to_homogeneous()
            - scene.ground_truth.to_homogeneous())
        .norm();
        assert!(drift < 0.01, "transform drifted by {drift}");
    }

    #[test]
    fn test_ransac_is_deterministic_for_a_fixed_seed() {
        let scene = noisy_scene(650, false);
        let config = CoarseConfiguration::builder()
            .with_max_iterations(500)
            .with_inlier_threshold(0.05)
            .with_random_seed(123)
            .build();

        let first =
            ransac_registration(&scene.source, &scene.target, &scene.correspondences, &config)
                .unwrap();
        let second =
            ransac_registration(&scene.source, &scene.target, &scene.correspondences, &config)
                .unwrap();

        assert_eq!(first.transform, second.transform);
        assert_eq!(first.inliers, second.inliers);
        assert_eq!(first.num_iterations, second.num_iterations);
    }

    #[test]
    fn test_ransac_exactly_three_correspondences() {
        let source = PointCloud::from_points(vec![
            Point3::new(0.0f64, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(0.0, 1.0, 0.0),
        ]);
        let translation = Vector3::new(0.5, 0.3, 0.2);
        let target = PointCloud::from_points(
            source.points.iter().map(|p| p + translation).collect::<Vec<_>>(),
        );
        let correspondences = (0..3)
            .map(|idx| Correspondence {
                source_index: idx,
                target_index: idx,
                distance: 0.0,
            })
            .collect::<Vec<_>>();

        let config = CoarseConfiguration::builder()
            .with_max_iterations(50)
            .with_inlier_threshold(0.01)
            .build();
        let result = ransac_registration(&source, &target, &correspondences, &config).unwrap();

        // The unique sample either solves the problem or the run reports
        // an unconverged result; with clean data it must solve it.
        assert!(result.converged);
        assert_eq!(result.inliers.len(), 3);
        assert!((result.transform.translation.vector - translation).norm() < 1e-9);
    }

    #[test]
    fn test_ransac_empty_cloud_is_invalid_input() {
        let empty = PointCloud::<f64>::new();
        let cloud = PointCloud::from_points(vec![Point3::new(0.0, 0.0, 0.0)]);
        let config = CoarseConfiguration::builder().build();

        assert!(matches!(
            ransac_registration(&empty, &cloud, &[], &config),
            Err(RegistrationError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_ransac_too_few_correspondences() {
        let cloud = PointCloud::from_points(vec![
            Point3::new(0.0f64, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
        ]);
        let correspondences = vec![Correspondence {
            source_index: 0,
            target_index: 0,
            distance: 0.0,
        }];
        let config = CoarseConfiguration::builder().build();

        assert_eq!(
            ransac_registration(&cloud, &cloud, &correspondences, &config).err(),
            Some(RegistrationError::InsufficientSamples {
                required: SAMPLE_SIZE,
                actual: 1
            })
        );
    }

    #[test]
    fn test_calculate_iterations_bounds() {
        // Near-zero outliers should need almost no iterations.
        assert!(calculate_iterations(0.01f64, 0.99, 3, 10_000) < 10);
        // Extreme ratios fall back to the cap.
        assert_eq!(calculate_iterations(0.0f64, 0.99, 3, 500), 500);
        assert_eq!(calculate_iterations(1.0f64, 0.99, 3, 500), 500);
        // Property: with e < 0.5 the budget stays comfortably under the cap.
        assert!(calculate_iterations(0.45f64, 0.99, 3, 100_000) < 30);
    }
}
