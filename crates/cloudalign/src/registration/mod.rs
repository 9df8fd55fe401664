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

use nalgebra::{Isometry3, Matrix3, Point3, RealField, UnitQuaternion};
use num_traits::AsPrimitive;

use crate::{
    concurrent,
    correspondence::Correspondence,
    types::RegistrationError,
    utils::{calculate_point_cloud_center, verify_rotation_matrix_determinant},
};

pub use four_pcs::{four_pcs_registration, FourPcsConfiguration, FourPcsConfigurationBuilder};
pub use prosac::{prosac_registration, ProsacConfiguration, ProsacConfigurationBuilder};
pub use ransac::ransac_registration;
pub use super_four_pcs::super_four_pcs_registration;

#[doc = "Fine registration: ICP variants, GICP, AA-ICP and NDT."]
pub mod fine;

mod four_pcs;
mod prosac;
mod ransac;
mod super_four_pcs;

/// The minimal number of correspondences that determines a rigid transform
/// uniquely (three non-collinear pairs).
pub const SAMPLE_SIZE: usize = 3;

/// One recorded step of an iterative registration loop.
#[derive(Clone, Debug, PartialEq)]
pub struct IterationStats<T: RealField> {
    /// Zero-based iteration number.
    pub iteration: usize,
    /// The transform estimate after this iteration.
    pub transform: Isometry3<T>,
    /// The error measure of this iteration (estimator-specific).
    pub error: T,
    /// Absolute change of the error relative to the previous iteration.
    pub error_change: T,
    /// Number of correspondences that survived this iteration's gating.
    pub num_correspondences: usize,
}

/// What every registration estimator in this crate returns.
///
/// A run that exhausts its budget without reaching its inlier quota is not an
/// error: it still carries the best transform found, with `converged` cleared,
/// so callers can decide whether to accept or retry.
#[derive(Clone, Debug)]
pub struct RegistrationResult<T: RealField> {
    /// The best rigid transform found.
    pub transform: Isometry3<T>,
    /// Fitness of that transform (LCP-style mean inlier distance for the
    /// coarse estimators; final mean error for the fine ones). Lower is better.
    pub fitness_score: T,
    /// Inlier indices at the returned transform (correspondence indices for
    /// correspondence-driven estimators, source point indices otherwise).
    pub inliers: Vec<usize>,
    /// Number of iterations actually executed.
    pub num_iterations: usize,
    /// Whether a convergence criterion was met.
    pub converged: bool,
    /// Per-iteration statistics; filled only when history recording is on.
    pub history: Vec<IterationStats<T>>,
}

impl<T: RealField + Copy + num_traits::Bounded> RegistrationResult<T> {
    pub(crate) fn unconverged() -> Self {
        Self {
            transform: Isometry3::identity(),
            fitness_score: <T as num_traits::Bounded>::max_value(),
            inliers: Vec::new(),
            num_iterations: 0,
            converged: false,
            history: Vec::new(),
        }
    }
}

/// The configuration shared by every coarse estimator.
#[derive(Clone, Copy, Debug)]
pub struct CoarseConfiguration<T> {
    pub(crate) max_iterations: usize,
    pub(crate) inlier_threshold: T,
    pub(crate) min_inliers: usize,
    pub(crate) confidence: T,
    pub(crate) early_stop_ratio: T,
    pub(crate) parallel: bool,
    pub(crate) random_seed: u64,
    pub(crate) refine_result: bool,
}

impl<T: 'static + Copy> CoarseConfiguration<T>
where
    f64: AsPrimitive<T>,
{
    /// Returns a builder for the configuration struct.
    pub fn builder() -> CoarseConfigurationBuilder<T> {
        CoarseConfigurationBuilder {
            _internal: CoarseConfiguration {
                max_iterations: 1000,
                inlier_threshold: 0.05.as_(),
                min_inliers: SAMPLE_SIZE,
                confidence: 0.99.as_(),
                early_stop_ratio: 0.9.as_(),
                parallel: true,
                random_seed: 42,
                refine_result: false,
            },
        }
    }
}

/// A Builder-pattern struct for safely constructing a [`CoarseConfiguration`].
#[derive(Clone, Copy, Debug)]
pub struct CoarseConfigurationBuilder<T> {
    _internal: CoarseConfiguration<T>,
}

impl<T: Copy> CoarseConfigurationBuilder<T> {
    /// The iteration budget before the estimator gives up.
    pub fn with_max_iterations(&self, max_iterations: usize) -> Self {
        Self {
            _internal: CoarseConfiguration {
                max_iterations,
                ..self._internal
            },
        }
    }

    /// The residual below which a correspondence counts as an inlier.
    pub fn with_inlier_threshold(&self, inlier_threshold: T) -> Self {
        Self {
            _internal: CoarseConfiguration {
                inlier_threshold,
                ..self._internal
            },
        }
    }

    /// The inlier quota a result must reach to be declared converged.
    pub fn with_min_inliers(&self, min_inliers: usize) -> Self {
        Self {
            _internal: CoarseConfiguration {
                min_inliers,
                ..self._internal
            },
        }
    }

    /// The probability of finding an outlier-free sample that the adaptive
    /// iteration budget is sized for.
    pub fn with_confidence(&self, confidence: T) -> Self {
        Self {
            _internal: CoarseConfiguration {
                confidence,
                ..self._internal
            },
        }
    }

    /// The inlier ratio at which the search stops early.
    pub fn with_early_stop_ratio(&self, early_stop_ratio: T) -> Self {
        Self {
            _internal: CoarseConfiguration {
                early_stop_ratio,
                ..self._internal
            },
        }
    }

    /// Whether per-iteration fan-outs use the thread pool.
    pub fn with_parallel(&self, parallel: bool) -> Self {
        Self {
            _internal: CoarseConfiguration {
                parallel,
                ..self._internal
            },
        }
    }

    /// The seed for all randomness the estimator consumes; identical seeds,
    /// inputs and thread counts reproduce results byte for byte.
    pub fn with_random_seed(&self, random_seed: u64) -> Self {
        Self {
            _internal: CoarseConfiguration {
                random_seed,
                ..self._internal
            },
        }
    }

    /// Whether to re-solve the transform on all inliers after the search.
    pub fn with_refine_result(&self, refine_result: bool) -> Self {
        Self {
            _internal: CoarseConfiguration {
                refine_result,
                ..self._internal
            },
        }
    }

    /// Generates a [`CoarseConfiguration`] from the struct currently contained
    /// by the builder, leaving the builder intact for another use.
    pub fn build(&self) -> CoarseConfiguration<T> {
        self._internal
    }
}

/// Closed-form rigid alignment of paired points via SVD of the
/// cross-covariance: `R = V·diag(1, 1, det(VUᵀ))·Uᵀ`, `t = t̄ − R·s̄`.
///
/// # Arguments
/// * `source_points` / `target_points`: matched pairs, index-aligned.
///
/// # Returns
/// * [`RegistrationError::InsufficientSamples`] for fewer than 3 pairs.
/// * [`RegistrationError::DegenerateConfiguration`] when the recovered
///   rotation fails the orthogonality/determinant check
///   (`|det R − 1| ≤ 0.1`, `‖RRᵀ − I‖ ≤ 0.1`).
#[cfg_attr(
    feature = "tracing",
    tracing::instrument("Estimate Rigid Transform Using SVD", skip_all, level = "debug")
)]
pub fn estimate_rigid_transform_svd<T>(
    source_points: &[Point3<T>],
    target_points: &[Point3<T>],
) -> Result<Isometry3<T>, RegistrationError>
where
    T: RealField + Copy,
    usize: AsPrimitive<T>,
    f64: AsPrimitive<T>,
{
    if source_points.len() < SAMPLE_SIZE || source_points.len() != target_points.len() {
        return Err(RegistrationError::InsufficientSamples {
            required: SAMPLE_SIZE,
            actual: source_points.len().min(target_points.len()),
        });
    }

    let source_centroid = calculate_point_cloud_center(source_points);
    let target_centroid = calculate_point_cloud_center(target_points);

    let cross_covariance = source_points.iter().zip(target_points.iter()).fold(
        Matrix3::zeros(),
        |acc: Matrix3<T>, (source, target)| {
            let source_centered = source - source_centroid;
            let target_centered = target - target_centroid;
            acc + source_centered * target_centered.transpose()
        },
    );

    let svd = cross_covariance.svd(true, true);
    let (Some(u), Some(v_t)) = (svd.u, svd.v_t) else {
        return Err(RegistrationError::NumericFailure(
            "SVD of the cross-covariance did not produce factors",
        ));
    };

    let rotation = verify_rotation_matrix_determinant(u, v_t);
    if !is_valid_rotation(&rotation) {
        return Err(RegistrationError::DegenerateConfiguration(
            "recovered rotation failed the orthogonality check",
        ));
    }

    let translation = target_centroid.coords - rotation * source_centroid.coords;
    Ok(Isometry3::from_parts(
        translation.into(),
        UnitQuaternion::from_matrix(&rotation),
    ))
}

/// Checks `|det R − 1| ≤ 0.1` and `‖RRᵀ − I‖ ≤ 0.1`.
pub(crate) fn is_valid_rotation<T>(rotation: &Matrix3<T>) -> bool
where
    T: RealField + Copy,
    f64: AsPrimitive<T>,
{
    let tolerance: T = 0.1.as_();

    if (rotation.determinant() - T::one()).abs() > tolerance {
        return false;
    }

    (rotation * rotation.transpose() - Matrix3::identity()).norm() <= tolerance
}

/// Rejects minimal samples that cannot determine a transform: duplicate
/// source/target indices, or collinear source points (cross-product norm
/// below `1e-6`).
pub(crate) fn is_sample_valid<T>(
    source_points: &[Point3<T>],
    sample: &[Correspondence<T>],
) -> bool
where
    T: RealField + Copy,
    f64: AsPrimitive<T>,
{
    if sample.len() < SAMPLE_SIZE {
        return false;
    }

    for (position, correspondence) in sample.iter().enumerate() {
        for other in &sample[position + 1..] {
            if correspondence.source_index == other.source_index
                || correspondence.target_index == other.target_index
            {
                return false;
            }
        }
    }

    let p1 = &source_points[sample[0].source_index];
    let p2 = &source_points[sample[1].source_index];
    let p3 = &source_points[sample[2].source_index];

    let cross = (p2 - p1).cross(&(p3 - p1));
    cross.norm() > 1e-6.as_()
}

/// Collects, in input order, the correspondences whose transformed source
/// point lies within `inlier_threshold` of its matched target.
pub(crate) fn count_inliers<T>(
    source_points: &[Point3<T>],
    target_points: &[Point3<T>],
    correspondences: &[Correspondence<T>],
    transform: &Isometry3<T>,
    inlier_threshold: T,
    parallel: bool,
) -> Vec<usize>
where
    T: RealField + Copy + Send + Sync,
{
    let threshold_squared = inlier_threshold * inlier_threshold;

    concurrent::filter_indices(parallel, correspondences.len(), |idx| {
        let correspondence = &correspondences[idx];
        let transformed = transform.transform_point(&source_points[correspondence.source_index]);
        (transformed - target_points[correspondence.target_index]).norm_squared()
            <= threshold_squared
    })
}

/// The LCP fitness of a transform over the inlying correspondences: the
/// matched pairs are collected into two pointsets and scored by
/// [`crate::metrics::lcp_score`].
pub(crate) fn fitness_from_inliers<T>(
    source_points: &[Point3<T>],
    target_points: &[Point3<T>],
    correspondences: &[Correspondence<T>],
    inliers: &[usize],
    transform: &Isometry3<T>,
    inlier_threshold: T,
) -> T
where
    T: RealField + Copy + num_traits::Bounded + Send + Sync,
    usize: AsPrimitive<T>,
{
    if inliers.is_empty() {
        return <T as num_traits::Bounded>::max_value();
    }

    let (inlier_source, inlier_target): (Vec<_>, Vec<_>) = inliers
        .iter()
        .map(|&idx| {
            let correspondence = &correspondences[idx];
            (
                source_points[correspondence.source_index],
                target_points[correspondence.target_index],
            )
        })
        .unzip();

    crate::metrics::lcp_score(&inlier_source, &inlier_target, transform, inlier_threshold).0
}

/// Gathers the sampled correspondences of `indices` into index-aligned point
/// pair vectors, ready for [`estimate_rigid_transform_svd`].
pub(crate) fn gather_pairs<T: RealField + Copy>(
    source_points: &[Point3<T>],
    target_points: &[Point3<T>],
    correspondences: &[Correspondence<T>],
) -> (Vec<Point3<T>>, Vec<Point3<T>>) {
    correspondences
        .iter()
        .map(|correspondence| {
            (
                source_points[correspondence.source_index],
                target_points[correspondence.target_index],
            )
        })
        .unzip()
}

#[cfg(feature = "pregenerated")]
#[doc = "Contains pregenerated functions for single precision registration."]
pub mod single_precision {
    pub use super::fine::single_precision::*;
    pub use super::ransac::single_precision::*;
}

#[cfg(feature = "pregenerated")]
#[doc = "Contains pregenerated functions for double precision registration."]
pub mod double_precision {
    pub use super::fine::double_precision::*;
    pub use super::ransac::double_precision::*;
}

#[cfg(test)]
pub(crate) mod test_utils {
    use nalgebra::{Isometry3, Point3, Vector3};
    use rand::{Rng, SeedableRng};

    use crate::{correspondence::Correspondence, types::PointCloud, utils::generate_point_cloud};

    /// Approximately Gaussian noise via the Irwin-Hall construction.
    pub(crate) fn gaussian<R: Rng>(rng: &mut R, sigma: f64) -> f64 {
        let sum: f64 = (0..12).map(|_| rng.gen_range(0.0..1.0)).sum();
        (sum - 6.0) * sigma
    }

    pub(crate) struct NoisyScene {
        pub source: PointCloud<f64>,
        pub target: PointCloud<f64>,
        pub correspondences: Vec<Correspondence<f64>>,
        pub ground_truth: Isometry3<f64>,
    }

    /// 1000 correspondences, the first `num_inliers` obeying a known rigid
    /// transform with sigma = 0.001 noise, the rest uniformly random. With
    /// `quality_sorted`, the correspondence distances rank the inliers first,
    /// like a descriptor matcher whose best matches happen to be correct.
    pub(crate) fn noisy_scene(num_inliers: usize, quality_sorted: bool) -> NoisyScene {
        let mut rng = rand::rngs::SmallRng::seed_from_u64(7);

        let ground_truth = Isometry3::new(
            Vector3::new(0.4, -0.25, 0.6),
            Vector3::new(0.15, 0.3, -0.2),
        );

        let total = 1000usize;
        let source_points = generate_point_cloud(total, std::array::from_fn(|_| -10.0f64..=10.0));
        let mut target_points = Vec::with_capacity(total);
        let mut correspondences = Vec::with_capacity(total);

        for (idx, point) in source_points.iter().enumerate() {
            let target_point = if idx < num_inliers {
                let clean = ground_truth.transform_point(point);
                Point3::new(
                    clean.x + gaussian(&mut rng, 0.001),
                    clean.y + gaussian(&mut rng, 0.001),
                    clean.z + gaussian(&mut rng, 0.001),
                )
            } else {
                Point3::new(
                    rng.gen_range(-10.0..10.0),
                    rng.gen_range(-10.0..10.0),
                    rng.gen_range(-10.0..10.0),
                )
            };
            target_points.push(target_point);

            let distance = if quality_sorted {
                idx as f64 / total as f64
            } else {
                0.5
            };
            correspondences.push(Correspondence {
                source_index: idx,
                target_index: idx,
                distance,
            });
        }

        NoisyScene {
            source: PointCloud::from_points(source_points),
            target: PointCloud::from_points(target_points),
            correspondences,
            ground_truth,
        }
    }
}

#[cfg(test)]
mod tests {
    use nalgebra::Vector3;

    use crate::utils::{generate_point_cloud, transform_point_cloud};

    use super::*;

    #[test]
    fn test_svd_alignment_recovers_known_transform() {
        let source = generate_point_cloud(50, std::array::from_fn(|_| -10.0f64..=10.0));
        let isom = Isometry3::new(Vector3::new(0.5, -1.2, 2.0), Vector3::new(0.2, -0.1, 0.35));
        let target = transform_point_cloud(&source, isom);

        let recovered = estimate_rigid_transform_svd(&source, &target).unwrap();
        assert!(
            (recovered.to_homogeneous() - isom.to_homogeneous()).norm() < 1e-6,
            "SVD alignment drifted from the ground truth"
        );
    }

    #[test]
    fn test_svd_alignment_rejects_underdetermined_input() {
        let source = vec![Point3::new(0.0f32, 0.0, 0.0), Point3::new(1.0, 0.0, 0.0)];
        let target = source.clone();

        assert_eq!(
            estimate_rigid_transform_svd(&source, &target).err(),
            Some(RegistrationError::InsufficientSamples {
                required: SAMPLE_SIZE,
                actual: 2
            })
        );
    }

    #[test]
    fn test_sample_validity_rejects_collinear_and_duplicates() {
        let source_points = vec![
            Point3::new(0.0f64, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(2.0, 0.0, 0.0),
            Point3::new(0.0, 1.0, 0.0),
        ];
        let correspondence = |source_index, target_index| Correspondence {
            source_index,
            target_index,
            distance: 0.0,
        };

        // Collinear source points.
        let collinear = [
            correspondence(0, 0),
            correspondence(1, 1),
            correspondence(2, 2),
        ];
        assert!(!is_sample_valid(&source_points, &collinear));

        // Duplicate target index.
        let duplicate = [
            correspondence(0, 0),
            correspondence(1, 0),
            correspondence(3, 2),
        ];
        assert!(!is_sample_valid(&source_points, &duplicate));

        // A proper sample.
        let valid = [
            correspondence(0, 0),
            correspondence(1, 1),
            correspondence(3, 3),
        ];
        assert!(is_sample_valid(&source_points, &valid));
    }

    #[test]
    fn test_full_pipeline_descriptors_to_fine_alignment() {
        use crate::{
            correspondence::generate_correspondences,
            descriptors::{extract_fpfh, DescriptorParams},
            registration::fine::{icp, FineConfiguration},
            spatial::KdTree,
            types::PointCloud,
        };

        // A wavy height field: the curvature varies across the patch, so the
        // FPFH signatures stay distinctive. Normals are analytic; estimating
        // them would make the viewpoint disambiguation unstable for a surface
        // this flat.
        let mut source = PointCloud::new();
        for i in 0..30 {
            for j in 0..30 {
                let x = i as f64 * 0.1;
                let y = j as f64 * 0.1;
                source
                    .points
                    .push(Point3::new(x, y, 0.3 * (2.0 * x).sin() * (2.0 * y).cos()));

                let dz_dx = 0.6 * (2.0 * x).cos() * (2.0 * y).cos();
                let dz_dy = -0.6 * (2.0 * x).sin() * (2.0 * y).sin();
                source
                    .normals
                    .push(Vector3::new(-dz_dx, -dz_dy, 1.0).normalize());
            }
        }
        let ground_truth = Isometry3::new(
            Vector3::new(0.3, -0.2, 0.25),
            Vector3::new(0.0, 0.0, 0.2),
        );
        let target = source.transformed(&ground_truth);

        let source_tree = KdTree::new(&source.points);
        let target_tree = KdTree::new(&target.points);
        let keypoints = (0..source.len()).step_by(8).collect::<Vec<_>>();
        let params = DescriptorParams::new(0.45);

        let source_descriptors =
            extract_fpfh(&source, &source_tree, &keypoints, &params, None).unwrap();
        let target_descriptors =
            extract_fpfh(&target, &target_tree, &keypoints, &params, None).unwrap();

        let correspondences = generate_correspondences(
            &source_descriptors,
            &keypoints,
            &target_descriptors,
            &keypoints,
            0.95,
            true,
        )
        .unwrap();
        assert!(correspondences.len() >= SAMPLE_SIZE);

        let coarse = ransac_registration(
            &source,
            &target,
            &correspondences,
            &CoarseConfiguration::builder()
                .with_max_iterations(1000)
                .with_inlier_threshold(0.1)
                .with_min_inliers(10)
                .with_refine_result(true)
                .build(),
        )
        .unwrap();
        assert!(coarse.converged);

        let refined = icp(
            &source,
            &target,
            Some(coarse.transform),
            &FineConfiguration::builder()
                .with_max_iterations(30)
                .with_max_correspondence_distance(0.5)
                .build(),
        )
        .unwrap();

        assert!(refined.converged);
        let drift = (refined.transform.to_homogeneous() - ground_truth.to_homogeneous()).norm();
        assert!(drift < 0.05, "pipeline drifted by {drift}");
    }

    #[test]
    fn test_count_inliers_is_order_preserving() {
        let source = vec![
            Point3::new(0.0f32, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(2.0, 0.0, 0.0),
        ];
        let target = vec![
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(5.0, 0.0, 0.0),
        ];
        let correspondences = (0..3)
            .map(|idx| Correspondence {
                source_index: idx,
                target_index: idx,
                distance: 0.0,
            })
            .collect::<Vec<_>>();

        let serial = count_inliers(
            &source,
            &target,
            &correspondences,
            &Isometry3::identity(),
            0.1,
            false,
        );
        let parallel = count_inliers(
            &source,
            &target,
            &correspondences,
            &Isometry3::identity(),
            0.1,
            true,
        );

        assert_eq!(serial, vec![0, 1]);
        assert_eq!(serial, parallel);
    }
}
