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

use nalgebra::RealField;
use num_traits::{AsPrimitive, Bounded};

use crate::{
    registration::four_pcs::{
        base_from_indices, extract_coplanar_bases, sample_point_indices,
        validate_four_pcs_inputs, CandidateTracker, FourPcsConfiguration, INVARIANT_TOLERANCE,
    },
    registration::RegistrationResult,
    spatial::{adaptive_cell_size, PairGrid, PointPair},
    types::{IsFinite, PointCloud, RegistrationError},
};

/// Super4PCS rigid registration: the 4PCS pipeline with candidate enumeration
/// driven by a voxel pair grid instead of random quadruples.
///
/// For each source base, the two diagonal lengths are looked up in the grid,
/// which returns target point pairs inside the `[d − ε, d + ε]` band in time
/// proportional to the number of pairs. Diagonal pairs are combined (in all
/// four orientations, since pair extraction has no preferred direction) into
/// candidate bases, screened by coplanarity and the affine invariants, then
/// solved and LCP-scored exactly as in plain 4PCS.
///
/// The grid cell size is the configured resolution, or adaptively about five
/// times the median nearest-neighbour distance of the sampled target.
///
/// # Returns
/// The best [`RegistrationResult`]; inlier indices refer to the source cloud.
#[cfg_attr(
    feature = "tracing",
    tracing::instrument("Super4PCS Registration", skip_all, level = "info")
)]
pub fn super_four_pcs_registration<T>(
    source: &PointCloud<T>,
    target: &PointCloud<T>,
    config: &FourPcsConfiguration<T>,
) -> Result<RegistrationResult<T>, RegistrationError>
where
    T: RealField + Copy + Bounded + IsFinite + Send + Sync,
    usize: AsPrimitive<T>,
    f64: AsPrimitive<T>,
    T: AsPrimitive<usize>,
    T: AsPrimitive<isize>,
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

    let pair_epsilon = config
        .pair_distance_epsilon
        .unwrap_or(config.delta * 2.0.as_());
    let grid_resolution = config.grid_resolution.unwrap_or_else(|| {
        adaptive_cell_size(
            &target.points,
            &target_samples,
            config.coarse.random_seed,
            config.delta * 10.0.as_(),
        )
    });
    log::debug!("Super4PCS pair grid resolution: {grid_resolution}");

    // The grid indexes sample positions (not cloud indices), so extracted
    // pairs line up with `target_sample_points`.
    let sample_positions: Vec<usize> = (0..target_sample_points.len()).collect();
    let pair_grid = PairGrid::new(&target_sample_points, &sample_positions, grid_resolution);

    let source_bases = extract_coplanar_bases(&source.points, &source_samples, config);
    if source_bases.is_empty() {
        return Err(RegistrationError::InsufficientSamples {
            required: 4,
            actual: 0,
        });
    }
    log::debug!("Super4PCS extracted {} coplanar bases", source_bases.len());

    let mut tracker = CandidateTracker::new(source, &source_samples, &target_sample_points, config);

    let coplanar_tolerance = config.delta * 2.0.as_();
    let invariant_tolerance: T = INVARIANT_TOLERANCE.as_();

    let orientations = |pair: &PointPair<T>| [(pair.first, pair.second), (pair.second, pair.first)];

    let mut num_iterations = 0;

    'bases: for source_base in &source_bases {
        num_iterations += 1;

        let diagonal_ac = (source_base.points[2] - source_base.points[0]).norm();
        let diagonal_bd = (source_base.points[3] - source_base.points[1]).norm();

        let ac_pairs = pair_grid.pairs_in_range(diagonal_ac, pair_epsilon, config.max_pairs);
        let bd_pairs = pair_grid.pairs_in_range(diagonal_bd, pair_epsilon, config.max_pairs);
        log::trace!(
            "Super4PCS base {num_iterations}: {} AC pairs, {} BD pairs",
            ac_pairs.len(),
            bd_pairs.len()
        );

        for ac_pair in &ac_pairs {
            for bd_pair in &bd_pairs {
                for (a, c) in orientations(ac_pair) {
                    for (b, d) in orientations(bd_pair) {
                        // The base ordering is (A, B, C, D) with diagonals AC
                        // and BD; duplicate members cannot form a base.
                        if a == b || a == d || c == b || c == d {
                            continue;
                        }

                        let Some(target_base) = base_from_indices(
                            &target_sample_points,
                            [a, b, c, d],
                            coplanar_tolerance,
                        ) else {
                            continue;
                        };

                        if (source_base.invariant1 - target_base.invariant1).abs()
                            >= invariant_tolerance
                            || (source_base.invariant2 - target_base.invariant2).abs()
                                >= invariant_tolerance
                        {
                            continue;
                        }

                        // Map sample positions back to cloud indices before
                        // aligning; the points themselves are already sampled.
                        let mut cloud_base = target_base;
                        for slot in 0..4 {
                            cloud_base.indices[slot] = target_samples[target_base.indices[slot]];
                        }

                        if tracker.evaluate(source_base, &cloud_base) {
                            log::debug!("Super4PCS early stop, found a good enough match");
                            break 'bases;
                        }
                    }
                }
            }
        }
    }

    let result = tracker.into_result(num_iterations, config.coarse.min_inliers);
    log::debug!(
        "Super4PCS finished after {} bases with {} inliers",
        result.num_iterations,
        result.inliers.len()
    );

    Ok(result)
}

#[cfg(test)]
mod tests {
    use nalgebra::{Isometry3, Point3, Vector3};
    use rand::{Rng, SeedableRng};

    use crate::registration::CoarseConfiguration;

    use super::*;

    /// A structured 5000-point scene: a plane, a sphere, and uniform clutter.
    fn structured_cloud() -> PointCloud<f64> {
        let mut rng = rand::rngs::SmallRng::seed_from_u64(1234);
        let mut points = Vec::with_capacity(5000);

        // Plane patch.
        for _ in 0..2000 {
            points.push(Point3::new(
                rng.gen_range(-3.0..3.0),
                rng.gen_range(-3.0..3.0),
                0.0,
            ));
        }

        // Sphere shell.
        for _ in 0..2000 {
            let direction = Vector3::new(
                rng.gen_range(-1.0..1.0f64),
                rng.gen_range(-1.0..1.0),
                rng.gen_range(-1.0..1.0),
            );
            if direction.norm() > 1e-6 {
                let on_sphere = direction.normalize() * 1.5;
                points.push(Point3::new(on_sphere.x + 1.0, on_sphere.y - 1.0, on_sphere.z + 2.0));
            }
        }

        // Unstructured clutter.
        while points.len() < 5000 {
            points.push(Point3::new(
                rng.gen_range(-3.0..3.0),
                rng.gen_range(-3.0..3.0),
                rng.gen_range(-0.5..3.5),
            ));
        }

        PointCloud::from_points(points)
    }

    #[test]
    fn test_super_four_pcs_recovers_rigid_motion() {
        let source = structured_cloud();
        let ground_truth = Isometry3::new(
            Vector3::new(0.5, 0.3, 0.2),
            Vector3::new(0.0, 0.0, 0.2),
        );
        let target = source.transformed(&ground_truth);

        let delta = 0.02;
        let config = FourPcsConfiguration::builder()
            .with_delta(delta)
            .with_overlap(0.6)
            .with_sample_size(1000)
            .with_num_bases(10)
            // Noise-free congruent pairs sit exactly on the diagonal length;
            // a tight band keeps the candidate pool small and exhaustive.
            .with_pair_distance_epsilon(Some(0.005))
            .with_max_pairs(4000)
            .with_coarse(CoarseConfiguration::builder().with_random_seed(3).build())
            .build();

        let result = super_four_pcs_registration(&source, &target, &config).unwrap();

        assert!(result.converged);
        let drift = (result.transform.to_homogeneous() - ground_truth.to_homogeneous()).norm();
        assert!(drift < 5.0 * delta, "transform drifted by {drift}");
    }

    #[test]
    fn test_super_four_pcs_is_deterministic() {
        let source = crate::registration::four_pcs::tests::planar_scene();
        let target = source.transformed(&Isometry3::new(
            Vector3::new(0.3, -0.1, 0.15),
            Vector3::new(0.0, 0.0, 0.25),
        ));
        let config = FourPcsConfiguration::builder()
            .with_delta(0.001)
            .with_overlap(1.0)
            .with_sample_size(source.len())
            .with_num_bases(6)
            .build();

        let first = super_four_pcs_registration(&source, &target, &config).unwrap();
        let second = super_four_pcs_registration(&source, &target, &config).unwrap();

        assert_eq!(first.transform, second.transform);
        assert_eq!(first.inliers, second.inliers);
    }

    #[test]
    fn test_super_four_pcs_validates_parameters() {
        let cloud = structured_cloud();
        assert_eq!(
            super_four_pcs_registration(
                &cloud,
                &cloud,
                &FourPcsConfiguration::builder().with_overlap(0.0).build()
            )
            .err(),
            Some(RegistrationError::ParameterError("overlap must lie in (0, 1]"))
        );
    }
}
