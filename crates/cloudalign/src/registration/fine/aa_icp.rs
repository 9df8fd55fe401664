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

use std::collections::VecDeque;

use nalgebra::{DMatrix, DVector, Isometry3, RealField, Vector6};
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
    types::{
        se3::{isometry_to_twist, twist_to_isometry},
        IsFinite, PointCloud, RegistrationError,
    },
};

/// Configuration of Anderson-accelerated ICP: the shared fine parameters plus
/// the acceleration depth and damping.
#[derive(Clone, Copy, Debug)]
pub struct AndersonIcpConfiguration<T> {
    pub(crate) fine: FineConfiguration<T>,
    pub(crate) anderson_depth: usize,
    pub(crate) damping: T,
}

impl<T: 'static + Copy> AndersonIcpConfiguration<T>
where
    f64: AsPrimitive<T>,
{
    /// Returns a builder for the configuration struct.
    pub fn builder() -> AndersonIcpConfigurationBuilder<T> {
        AndersonIcpConfigurationBuilder {
            _internal: AndersonIcpConfiguration {
                fine: FineConfiguration::builder().build(),
                anderson_depth: 5,
                damping: 1.0.as_(),
            },
        }
    }
}

/// A Builder-pattern struct for safely constructing an
/// [`AndersonIcpConfiguration`].
#[derive(Clone, Copy, Debug)]
pub struct AndersonIcpConfigurationBuilder<T> {
    _internal: AndersonIcpConfiguration<T>,
}

impl<T: Copy> AndersonIcpConfigurationBuilder<T> {
    /// Replaces the shared fine-registration parameters.
    pub fn with_fine(&self, fine: FineConfiguration<T>) -> Self {
        Self {
            _internal: AndersonIcpConfiguration {
                fine,
                ..self._internal
            },
        }
    }

    /// The number of past residuals mixed into each accelerated step.
    pub fn with_anderson_depth(&self, anderson_depth: usize) -> Self {
        Self {
            _internal: AndersonIcpConfiguration {
                anderson_depth,
                ..self._internal
            },
        }
    }

    /// The damping factor `β` of the accelerated update.
    pub fn with_damping(&self, damping: T) -> Self {
        Self {
            _internal: AndersonIcpConfiguration {
                damping,
                ..self._internal
            },
        }
    }

    /// Generates an [`AndersonIcpConfiguration`] from the struct currently
    /// contained by the builder, leaving the builder intact for another use.
    pub fn build(&self) -> AndersonIcpConfiguration<T> {
        self._internal
    }
}

/// One evaluation of the underlying ICP fixed-point map.
struct FixedPointStep<T> {
    next_twist: Vector6<T>,
    energy: T,
    num_correspondences: usize,
}

/// Applies one point-to-point ICP step from the pose `twist` encodes.
fn fixed_point_map<T>(
    source: &PointCloud<T>,
    target: &PointCloud<T>,
    target_tree: &KdTree<T, 3>,
    twist: &Vector6<T>,
    config: &FineConfiguration<T>,
) -> Option<FixedPointStep<T>>
where
    T: RealField + Copy + Bounded + Send + Sync,
    usize: AsPrimitive<T>,
    f64: AsPrimitive<T>,
    T: AsPrimitive<usize>,
{
    let transform = twist_to_isometry(twist);
    let transformed = source
        .points
        .iter()
        .map(|point| transform.transform_point(point))
        .collect::<Vec<_>>();

    let mut pairs = find_fine_correspondences(&transformed, target_tree, config);
    if pairs.is_empty() {
        return None;
    }
    reject_outlier_pairs(&mut pairs, config.outlier_rejection_ratio);

    let energy = mean_squared_error(&source.points, &target.points, &pairs, &transform);

    let (pair_source, pair_target): (Vec<_>, Vec<_>) = pairs
        .iter()
        .map(|pair| (transformed[pair.source_index], target.points[pair.target_index]))
        .unzip();
    let delta = estimate_rigid_transform_svd(&pair_source, &pair_target).ok()?;

    Some(FixedPointStep {
        next_twist: isometry_to_twist(&(delta * transform)),
        energy,
        num_correspondences: pairs.len(),
    })
}

/// Energy of a pose alone, for the acceleration safeguard.
fn pose_energy<T>(
    source: &PointCloud<T>,
    target: &PointCloud<T>,
    target_tree: &KdTree<T, 3>,
    twist: &Vector6<T>,
    config: &FineConfiguration<T>,
) -> T
where
    T: RealField + Copy + Bounded + Send + Sync,
    usize: AsPrimitive<T>,
    f64: AsPrimitive<T>,
    T: AsPrimitive<usize>,
{
    let transform = twist_to_isometry(twist);
    let transformed = source
        .points
        .iter()
        .map(|point| transform.transform_point(point))
        .collect::<Vec<_>>();

    let mut pairs = find_fine_correspondences(&transformed, target_tree, config);
    if pairs.is_empty() {
        return <T as Bounded>::max_value();
    }
    reject_outlier_pairs(&mut pairs, config.outlier_rejection_ratio);

    mean_squared_error(&source.points, &target.points, &pairs, &transform)
}

/// Anderson-accelerated point-to-point ICP.
///
/// The plain ICP update is treated as a fixed-point map `g` over the 6-vector
/// pose twist; each iteration mixes the last `anderson_depth` residuals
/// `f = g(x) − x` through a least-squares combination (with `Σ α = 1`,
/// damped by `β`) to extrapolate a better iterate. If the extrapolation
/// raises the ICP energy, or the residual system is ill-conditioned, the step
/// falls back to plain ICP and the mixing history is restarted.
///
/// # Returns
/// A [`RegistrationResult`] equivalent in contract to [`super::icp`].
#[cfg_attr(
    feature = "tracing",
    tracing::instrument("Anderson Accelerated ICP", skip_all, level = "info")
)]
pub fn anderson_icp<T>(
    source: &PointCloud<T>,
    target: &PointCloud<T>,
    initial_guess: Option<Isometry3<T>>,
    config: &AndersonIcpConfiguration<T>,
) -> Result<RegistrationResult<T>, RegistrationError>
where
    T: RealField + Copy + Bounded + IsFinite + Send + Sync,
    usize: AsPrimitive<T>,
    f64: AsPrimitive<T>,
    T: AsPrimitive<usize>,
{
    if config.damping <= T::zero() || config.damping > T::one() {
        return Err(RegistrationError::ParameterError(
            "damping must lie in (0, 1]",
        ));
    }
    if config.anderson_depth == 0 {
        return Err(RegistrationError::ParameterError(
            "anderson depth must be positive",
        ));
    }
    validate_fine_inputs(source, target, &config.fine)?;

    let target_tree = KdTree::new(&target.points);
    let mut x = isometry_to_twist(&initial_guess.unwrap_or_else(Isometry3::identity));
    let mut previous_error = <T as Bounded>::max_value();

    // The last `depth + 1` iterates and residuals; consecutive differences
    // form the least-squares system.
    let mut x_history: VecDeque<Vector6<T>> = VecDeque::new();
    let mut f_history: VecDeque<Vector6<T>> = VecDeque::new();

    let mut result = RegistrationResult::unconverged();
    result.transform = twist_to_isometry(&x);

    for iteration in 0..config.fine.max_iterations {
        result.num_iterations = iteration + 1;

        let Some(step) = fixed_point_map(source, target, &target_tree, &x, &config.fine) else {
            log::debug!("AA-ICP iteration {iteration}: no correspondences in range");
            break;
        };

        let residual = step.next_twist - x;
        let error = step.energy;
        let error_change = (previous_error - error).abs();
        record_iteration(
            &mut result.history,
            &config.fine,
            iteration,
            &twist_to_isometry(&x),
            error,
            error_change,
            step.num_correspondences,
        );

        x_history.push_back(x);
        f_history.push_back(residual);
        if x_history.len() > config.anderson_depth + 1 {
            x_history.pop_front();
            f_history.pop_front();
        }

        let mut next_x = step.next_twist;
        let depth = x_history.len() - 1;
        if depth > 0 {
            // Columns are the consecutive differences of iterates/residuals.
            let mut delta_x = DMatrix::<T>::zeros(6, depth);
            let mut delta_f = DMatrix::<T>::zeros(6, depth);
            for col in 0..depth {
                for row in 0..6 {
                    delta_x[(row, col)] = x_history[col + 1][row] - x_history[col][row];
                    delta_f[(row, col)] = f_history[col + 1][row] - f_history[col][row];
                }
            }

            let rhs = DVector::from_fn(6, |row, _| residual[row]);
            let svd = delta_f.clone().svd(true, true);
            let max_singular = svd.singular_values.max();
            let well_conditioned = max_singular > T::zero()
                && svd.singular_values.min() / max_singular > 1e-10.as_();

            if well_conditioned {
                if let Ok(gamma) = svd.solve(&rhs, 1e-12.as_()) {
                    let mut accelerated = x + residual * config.damping;
                    for col in 0..depth {
                        for row in 0..6 {
                            accelerated[row] -= (delta_x[(row, col)]
                                + delta_f[(row, col)] * config.damping)
                                * gamma[col];
                        }
                    }

                    // Safeguard: only accept the extrapolation when it does
                    // not increase the ICP energy of the plain step.
                    let plain_energy =
                        pose_energy(source, target, &target_tree, &step.next_twist, &config.fine);
                    let accelerated_energy =
                        pose_energy(source, target, &target_tree, &accelerated, &config.fine);

                    if accelerated_energy <= plain_energy {
                        next_x = accelerated;
                    } else {
                        x_history.clear();
                        f_history.clear();
                    }
                }
            }
        }

        let current_transform = twist_to_isometry(&x);
        let next_transform = twist_to_isometry(&next_x);
        let converged = has_converged(&current_transform, &next_transform, error_change, &config.fine);

        x = next_x;
        previous_error = error;
        result.fitness_score = error;

        if converged {
            log::trace!("AA-ICP converged after {} iterations", iteration + 1);
            result.converged = true;
            break;
        }
    }

    result.transform = twist_to_isometry(&x);
    Ok(result)
}

#[cfg(test)]
mod tests {
    use nalgebra::{Point3, Vector3};

    use crate::utils::{generate_point_cloud, transform_point_cloud};

    use super::*;

    #[test]
    fn test_identity_alignment() {
        let cloud = PointCloud::from_points(generate_point_cloud(
            200,
            std::array::from_fn(|_| -2.0f64..=2.0),
        ));
        let config = AndersonIcpConfiguration::builder()
            .with_fine(
                FineConfiguration::builder()
                    .with_max_correspondence_distance(1.0)
                    .build(),
            )
            .build();

        let result = anderson_icp(&cloud, &cloud, None, &config).unwrap();
        assert!(result.converged);
        assert!(result.num_iterations <= 2);
        assert!(
            (result.transform.to_homogeneous() - nalgebra::Isometry3::identity().to_homogeneous())
                .norm()
                < 1e-6
        );
    }

    #[test]
    fn test_known_motion_recovery() {
        let points = generate_point_cloud(400, std::array::from_fn(|_| -10.0f64..=10.0));
        let isom = nalgebra::Isometry3::new(
            Vector3::new(-0.5, 0.8, 0.2),
            Vector3::new(0.08, 0.12, -0.1),
        );
        let source = PointCloud::from_points(points.clone());
        let target = PointCloud::from_points(transform_point_cloud(&points, isom));

        let config = AndersonIcpConfiguration::builder()
            .with_fine(
                FineConfiguration::builder()
                    .with_max_iterations(60)
                    .with_max_correspondence_distance(8.0)
                    .build(),
            )
            .build();
        let result = anderson_icp(&source, &target, None, &config).unwrap();

        assert!(result.converged);
        assert!(result.fitness_score < 0.05);
    }

    #[test]
    fn test_acceleration_does_not_lose_to_plain_icp() {
        let points = generate_point_cloud(300, std::array::from_fn(|_| -8.0f64..=8.0));
        let isom = nalgebra::Isometry3::new(
            Vector3::new(0.6, -0.4, 0.5),
            Vector3::new(0.05, 0.1, -0.08),
        );
        let source = PointCloud::from_points(points.clone());
        let target = PointCloud::from_points(transform_point_cloud(&points, isom));

        let fine = FineConfiguration::builder()
            .with_max_iterations(80)
            .with_max_correspondence_distance(6.0)
            .with_transformation_epsilon(1e-8)
            .build();

        let plain = crate::registration::fine::icp(&source, &target, None, &fine).unwrap();
        let accelerated = anderson_icp(
            &source,
            &target,
            None,
            &AndersonIcpConfiguration::builder().with_fine(fine).build(),
        )
        .unwrap();

        assert!(plain.converged);
        assert!(accelerated.converged);
        assert!(accelerated.fitness_score <= plain.fitness_score + 1e-6);
    }

    #[test]
    fn test_damping_is_validated() {
        let cloud = PointCloud::from_points(vec![Point3::new(0.0f64, 0.0, 0.0)]);
        let config = AndersonIcpConfiguration::builder().with_damping(0.0).build();

        assert!(matches!(
            anderson_icp(&cloud, &cloud, None, &config),
            Err(RegistrationError::ParameterError(_))
        ));
    }

    #[test]
    fn test_deterministic_across_runs() {
        let points = generate_point_cloud(250, std::array::from_fn(|_| -5.0f32..=5.0));
        let isom = nalgebra::Isometry3::new(
            Vector3::new(0.3, 0.1, -0.2),
            Vector3::new(0.02, -0.05, 0.04),
        );
        let source = PointCloud::from_points(points.clone());
        let target = PointCloud::from_points(transform_point_cloud(&points, isom));

        let config = AndersonIcpConfiguration::builder()
            .with_fine(
                FineConfiguration::builder()
                    .with_max_correspondence_distance(4.0)
                    .build(),
            )
            .build();

        let first = anderson_icp(&source, &target, None, &config).unwrap();
        let second = anderson_icp(&source, &target, None, &config).unwrap();
        assert_eq!(first.transform, second.transform);
        assert_eq!(first.num_iterations, second.num_iterations);
    }
}
