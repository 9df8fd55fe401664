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

use nalgebra::{Isometry3, Matrix3, Point3, RealField, Vector3, Vector6};
use num_traits::{AsPrimitive, Bounded};

use crate::{
    concurrent,
    registration::{
        fine::{
            find_fine_correspondences, has_converged, record_iteration, reject_outlier_pairs,
            validate_fine_inputs, FineConfiguration, FinePair,
        },
        RegistrationResult,
    },
    spatial::KdTree,
    types::{
        se3::{skew_symmetric, twist_to_isometry},
        IsFinite, PointCloud, RegistrationError,
    },
};

/// L-BFGS history depth (two-loop recursion).
const LBFGS_HISTORY: usize = 5;
/// Armijo sufficient-decrease constant of the backtracking line search.
const ARMIJO_C1: f64 = 1e-4;
/// Gradient-norm termination threshold of the inner optimiser.
const GRADIENT_TOLERANCE: f64 = 1e-6;
/// Step-energy termination threshold of the inner optimiser.
const ENERGY_TOLERANCE: f64 = 1e-8;

/// Configuration of Generalised ICP: the shared fine parameters plus the
/// covariance neighbourhood and the inner-optimiser budget.
#[derive(Clone, Copy, Debug)]
pub struct GicpConfiguration<T> {
    pub(crate) fine: FineConfiguration<T>,
    pub(crate) k_correspondences: usize,
    pub(crate) covariance_epsilon: T,
    pub(crate) optimizer_max_iterations: usize,
}

impl<T: 'static + Copy> GicpConfiguration<T>
where
    f64: AsPrimitive<T>,
{
    /// Returns a builder for the configuration struct.
    pub fn builder() -> GicpConfigurationBuilder<T> {
        GicpConfigurationBuilder {
            _internal: GicpConfiguration {
                fine: FineConfiguration::builder().build(),
                k_correspondences: 20,
                covariance_epsilon: 1e-3.as_(),
                optimizer_max_iterations: 20,
            },
        }
    }
}

/// A Builder-pattern struct for safely constructing a [`GicpConfiguration`].
#[derive(Clone, Copy, Debug)]
pub struct GicpConfigurationBuilder<T> {
    _internal: GicpConfiguration<T>,
}

impl<T: Copy> GicpConfigurationBuilder<T> {
    /// Replaces the shared fine-registration parameters.
    pub fn with_fine(&self, fine: FineConfiguration<T>) -> Self {
        Self {
            _internal: GicpConfiguration {
                fine,
                ..self._internal
            },
        }
    }

    /// How many neighbours form each point's covariance.
    pub fn with_k_correspondences(&self, k_correspondences: usize) -> Self {
        Self {
            _internal: GicpConfiguration {
                k_correspondences,
                ..self._internal
            },
        }
    }

    /// The floor of the smallest covariance eigenvalue (the plane-to-plane
    /// prior).
    pub fn with_covariance_epsilon(&self, covariance_epsilon: T) -> Self {
        Self {
            _internal: GicpConfiguration {
                covariance_epsilon,
                ..self._internal
            },
        }
    }

    /// The iteration budget of the inner L-BFGS solve.
    pub fn with_optimizer_max_iterations(&self, optimizer_max_iterations: usize) -> Self {
        Self {
            _internal: GicpConfiguration {
                optimizer_max_iterations,
                ..self._internal
            },
        }
    }

    /// Generates a [`GicpConfiguration`] from the struct currently contained
    /// by the builder, leaving the builder intact for another use.
    pub fn build(&self) -> GicpConfiguration<T> {
        self._internal
    }
}

/// Per-point regularised covariances: the neighbourhood covariance with its
/// eigenvalues replaced by `(1, 1, ε)` in the eigenbasis, the "plane-to-plane"
/// prior of Generalised ICP. Isolated points fall back to the identity.
#[cfg_attr(
    feature = "tracing",
    tracing::instrument("Compute GICP Covariances", skip_all, level = "debug")
)]
pub(crate) fn compute_covariances<T>(
    points: &[Point3<T>],
    tree: &KdTree<T, 3>,
    k_correspondences: usize,
    covariance_epsilon: T,
    parallel: bool,
) -> Vec<Matrix3<T>>
where
    T: RealField + Copy + Send + Sync,
    usize: AsPrimitive<T>,
{
    concurrent::map_indexed(parallel, points.len(), |point_idx| {
        let neighbours = tree.kneighbors(&points[point_idx], k_correspondences + 1);
        let others = neighbours
            .iter()
            .filter(|n| n.index != point_idx)
            .collect::<Vec<_>>();

        if others.len() < 3 {
            return Matrix3::identity();
        }

        let count: T = others.len().as_();
        let centroid = others
            .iter()
            .fold(Vector3::zeros(), |acc: Vector3<T>, n| {
                acc + points[n.index].coords
            })
            / count;

        let covariance = others
            .iter()
            .fold(Matrix3::zeros(), |acc: Matrix3<T>, n| {
                let diff = points[n.index].coords - centroid;
                acc + diff * diff.transpose()
            })
            / count;

        let eigen = covariance.symmetric_eigen();
        let mut smallest = 0;
        for i in 1..3 {
            if eigen.eigenvalues[i] < eigen.eigenvalues[smallest] {
                smallest = i;
            }
        }

        let mut shaped = Matrix3::zeros();
        for i in 0..3 {
            let eigenvalue = if i == smallest {
                covariance_epsilon
            } else {
                T::one()
            };
            let basis_vector: Vector3<T> = eigen.eigenvectors.column(i).into_owned();
            shaped += basis_vector * basis_vector.transpose() * eigenvalue;
        }

        shaped
    })
}

/// The Mahalanobis residual of one pair under `transform`, with its gradient
/// with respect to a left-multiplied delta twist when requested.
fn mahalanobis_residual<T>(
    source_point: &Point3<T>,
    target_point: &Point3<T>,
    source_covariance: &Matrix3<T>,
    target_covariance: &Matrix3<T>,
    transform: &Isometry3<T>,
    gradient: Option<&mut Vector6<T>>,
) -> T
where
    T: RealField + Copy,
    f64: AsPrimitive<T>,
{
    let transformed = transform.transform_point(source_point);
    let rotation = transform.rotation.to_rotation_matrix();
    let rotated_covariance =
        rotation.matrix() * source_covariance * rotation.matrix().transpose();

    let combined = rotated_covariance + target_covariance;
    let inverse = combined
        .try_inverse()
        .unwrap_or_else(|| Matrix3::identity() / 1e-6.as_());

    let residual = transformed - target_point;
    let distance = (residual.transpose() * inverse * residual)[(0, 0)];

    if let Some(gradient) = gradient {
        let two = T::one() + T::one();
        let translation_part = inverse * residual * two;
        let rotation_jacobian = -skew_symmetric(&transformed.coords);
        let rotation_part = rotation_jacobian.transpose() * inverse * residual * two;

        *gradient = Vector6::new(
            translation_part.x,
            translation_part.y,
            translation_part.z,
            rotation_part.x,
            rotation_part.y,
            rotation_part.z,
        );
    }

    distance
}

struct Objective<'a, T: RealField + Copy> {
    source: &'a PointCloud<T>,
    target: &'a PointCloud<T>,
    source_covariances: &'a [Matrix3<T>],
    target_covariances: &'a [Matrix3<T>],
    pairs: &'a [FinePair<T>],
    base_transform: Isometry3<T>,
}

impl<T> Objective<'_, T>
where
    T: RealField + Copy,
    usize: AsPrimitive<T>,
    f64: AsPrimitive<T>,
{
    /// Mean Mahalanobis cost of the delta twist `x`, with its gradient.
    fn evaluate(&self, x: &Vector6<T>, gradient: Option<&mut Vector6<T>>) -> T {
        let transform = twist_to_isometry(x) * self.base_transform;
        let count: T = self.pairs.len().as_();

        let mut total = T::zero();
        let mut total_gradient = Vector6::zeros();
        let mut point_gradient = Vector6::zeros();

        for pair in self.pairs {
            let cost = mahalanobis_residual(
                &self.source.points[pair.source_index],
                &self.target.points[pair.target_index],
                &self.source_covariances[pair.source_index],
                &self.target_covariances[pair.target_index],
                &transform,
                gradient.is_some().then_some(&mut point_gradient),
            );

            total += cost;
            if gradient.is_some() {
                total_gradient += point_gradient;
            }
        }

        if let Some(gradient) = gradient {
            *gradient = total_gradient / count;
        }
        total / count
    }
}

/// Minimises the objective with L-BFGS: two-loop recursion over a depth-5
/// history, backtracking Armijo line search, terminating on a small gradient
/// or a vanishing step energy.
fn lbfgs_optimize<T>(objective: &Objective<'_, T>, max_iterations: usize) -> Vector6<T>
where
    T: RealField + Copy,
    usize: AsPrimitive<T>,
    f64: AsPrimitive<T>,
{
    let mut x = Vector6::zeros();
    let mut gradient = Vector6::zeros();
    let mut value = objective.evaluate(&x, Some(&mut gradient));

    let mut s_history: VecDeque<Vector6<T>> = VecDeque::with_capacity(LBFGS_HISTORY);
    let mut y_history: VecDeque<Vector6<T>> = VecDeque::with_capacity(LBFGS_HISTORY);
    let mut rho_history: VecDeque<T> = VecDeque::with_capacity(LBFGS_HISTORY);

    for _ in 0..max_iterations {
        // Two-loop recursion for the search direction.
        let mut q = gradient;
        let mut alphas = vec![T::zero(); s_history.len()];
        for i in (0..s_history.len()).rev() {
            alphas[i] = rho_history[i] * s_history[i].dot(&q);
            q -= y_history[i] * alphas[i];
        }

        let mut direction = q;
        if let (Some(s), Some(y)) = (s_history.back(), y_history.back()) {
            let gamma = s.dot(y) / y.dot(y);
            direction *= gamma;
        }

        for i in 0..s_history.len() {
            let beta = rho_history[i] * y_history[i].dot(&direction);
            direction += s_history[i] * (alphas[i] - beta);
        }
        direction = -direction;

        // Backtracking Armijo line search.
        let c1: T = ARMIJO_C1.as_();
        let directional = gradient.dot(&direction);
        let mut step = T::one();
        let mut x_new = x + direction * step;
        let mut gradient_new = Vector6::zeros();
        let mut value_new = objective.evaluate(&x_new, Some(&mut gradient_new));

        while value_new > value + c1 * step * directional {
            step *= 0.5.as_();
            if step < 1e-10.as_() {
                break;
            }
            x_new = x + direction * step;
            value_new = objective.evaluate(&x_new, Some(&mut gradient_new));
        }

        // Curvature update.
        let s = x_new - x;
        let y = gradient_new - gradient;
        let denominator = y.dot(&s);
        if denominator > T::default_epsilon() {
            s_history.push_back(s);
            y_history.push_back(y);
            rho_history.push_back(T::one() / denominator);
            if s_history.len() > LBFGS_HISTORY {
                s_history.pop_front();
                y_history.pop_front();
                rho_history.pop_front();
            }
        }

        let converged = gradient_new.norm() < GRADIENT_TOLERANCE.as_()
            || (value_new - value).abs() < ENERGY_TOLERANCE.as_();

        x = x_new;
        value = value_new;
        gradient = gradient_new;

        if converged {
            break;
        }
    }

    x
}

/// Generalised ICP ("plane-to-plane").
///
/// Every point carries a regularised neighbourhood covariance; each outer
/// iteration matches points like plain ICP and then minimises the summed
/// Mahalanobis residual `Σ rᵢᵀ (C_tᵢ + R·C_sᵢ·Rᵀ)⁻¹ rᵢ` over a delta twist
/// with L-BFGS.
///
/// # Returns
/// A [`RegistrationResult`] whose `fitness_score` is the final mean
/// Mahalanobis error.
#[cfg_attr(
    feature = "tracing",
    tracing::instrument("Generalized ICP", skip_all, level = "info")
)]
pub fn generalized_icp<T>(
    source: &PointCloud<T>,
    target: &PointCloud<T>,
    initial_guess: Option<Isometry3<T>>,
    config: &GicpConfiguration<T>,
) -> Result<RegistrationResult<T>, RegistrationError>
where
    T: RealField + Copy + Bounded + IsFinite + Send + Sync,
    usize: AsPrimitive<T>,
    f64: AsPrimitive<T>,
    T: AsPrimitive<usize>,
{
    if config.covariance_epsilon <= T::zero() || config.covariance_epsilon >= T::one() {
        return Err(RegistrationError::ParameterError(
            "covariance epsilon must lie in (0, 1)",
        ));
    }
    validate_fine_inputs(source, target, &config.fine)?;

    let source_tree = KdTree::new(&source.points);
    let target_tree = KdTree::new(&target.points);

    let source_covariances = compute_covariances(
        &source.points,
        &source_tree,
        config.k_correspondences,
        config.covariance_epsilon,
        config.fine.parallel,
    );
    let target_covariances = compute_covariances(
        &target.points,
        &target_tree,
        config.k_correspondences,
        config.covariance_epsilon,
        config.fine.parallel,
    );

    let mut current_transform = initial_guess.unwrap_or_else(Isometry3::identity);
    let mut previous_error = <T as Bounded>::max_value();

    let mut result = RegistrationResult::unconverged();
    result.transform = current_transform;

    for iteration in 0..config.fine.max_iterations {
        result.num_iterations = iteration + 1;

        let transformed = source
            .points
            .iter()
            .map(|point| current_transform.transform_point(point))
            .collect::<Vec<_>>();

        let mut pairs = find_fine_correspondences(&transformed, &target_tree, &config.fine);
        if pairs.is_empty() {
            log::debug!("GICP iteration {iteration}: no correspondences in range");
            break;
        }
        reject_outlier_pairs(&mut pairs, config.fine.outlier_rejection_ratio);

        let objective = Objective {
            source,
            target,
            source_covariances: &source_covariances,
            target_covariances: &target_covariances,
            pairs: &pairs,
            base_transform: current_transform,
        };

        let error = objective.evaluate(&Vector6::zeros(), None);
        let error_change = (previous_error - error).abs();
        record_iteration(
            &mut result.history,
            &config.fine,
            iteration,
            &current_transform,
            error,
            error_change,
            pairs.len(),
        );

        let twist = lbfgs_optimize(&objective, config.optimizer_max_iterations);
        let new_transform = twist_to_isometry(&twist) * current_transform;
        let converged = has_converged(
            &current_transform,
            &new_transform,
            error_change,
            &config.fine,
        );

        current_transform = new_transform;
        previous_error = error;
        result.inliers = pairs.iter().map(|pair| pair.source_index).collect();
        result.fitness_score = error;

        if converged {
            log::trace!("GICP converged after {} iterations", iteration + 1);
            result.converged = true;
            break;
        }
    }

    result.transform = current_transform;
    Ok(result)
}

#[cfg(test)]
mod tests {
    use nalgebra::Vector3;

    use crate::utils::{generate_point_cloud, transform_point_cloud};

    use super::*;

    fn structured_cloud() -> PointCloud<f64> {
        // A slab of jittered grid points; locally planar, so the covariance
        // prior has something to work with.
        let jitter = generate_point_cloud::<f64, 3>(400, std::array::from_fn(|_| -0.02f64..=0.02));
        let mut points = Vec::with_capacity(400);
        for i in 0..20 {
            for j in 0..20 {
                let idx = i * 20 + j;
                points.push(nalgebra::Point3::new(
                    i as f64 * 0.1 + jitter[idx].x,
                    j as f64 * 0.1 + jitter[idx].y,
                    (i as f64 * 0.05).sin() * 0.2 + jitter[idx].z,
                ));
            }
        }
        PointCloud::from_points(points)
    }

    #[test]
    fn test_covariances_are_plane_shaped() {
        let cloud = structured_cloud();
        let tree = KdTree::new(&cloud.points);
        let covariances = compute_covariances(&cloud.points, &tree, 15, 1e-3, false);

        assert_eq!(covariances.len(), cloud.len());
        for covariance in covariances.iter().step_by(37) {
            let eigen = covariance.clone_owned().symmetric_eigen();
            let mut eigenvalues = [
                eigen.eigenvalues[0],
                eigen.eigenvalues[1],
                eigen.eigenvalues[2],
            ];
            eigenvalues.sort_by(|a, b| a.partial_cmp(b).unwrap());

            assert!((eigenvalues[0] - 1e-3).abs() < 1e-9);
            assert!((eigenvalues[2] - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_gicp_recovers_small_motion() {
        let target = structured_cloud();
        let ground_truth = Isometry3::new(
            Vector3::new(0.05, -0.04, 0.03),
            Vector3::new(0.02, 0.03, -0.025),
        );
        let source = target.transformed(&ground_truth.inverse());

        let config = GicpConfiguration::builder()
            .with_fine(
                FineConfiguration::builder()
                    .with_max_iterations(40)
                    .with_max_correspondence_distance(0.5)
                    .build(),
            )
            .build();
        let result = generalized_icp(&source, &target, None, &config).unwrap();

        assert!(result.converged);
        let drift = (result.transform.to_homogeneous() - ground_truth.to_homogeneous()).norm();
        assert!(drift < 0.01, "transform drifted by {drift}");
    }

    #[test]
    fn test_gicp_identity() {
        let cloud = structured_cloud();
        let config = GicpConfiguration::builder()
            .with_fine(
                FineConfiguration::builder()
                    .with_max_correspondence_distance(0.5)
                    .build(),
            )
            .build();

        let result = generalized_icp(&cloud, &cloud, None, &config).unwrap();
        assert!(result.converged);
        assert!(result.fitness_score < 1e-6);
    }

    #[test]
    fn test_gicp_noise_robustness() {
        let target = structured_cloud();
        let noise = generate_point_cloud::<f64, 3>(target.len(), std::array::from_fn(|_| -0.005f64..=0.005));
        let motion = Isometry3::new(Vector3::new(0.03, 0.02, -0.02), Vector3::zeros());
        let source = PointCloud::from_points(
            transform_point_cloud(&target.points, motion.inverse())
                .into_iter()
                .zip(noise)
                .map(|(p, n)| p + n.coords)
                .collect::<Vec<_>>(),
        );

        let config = GicpConfiguration::builder()
            .with_fine(
                FineConfiguration::builder()
                    .with_max_iterations(40)
                    .with_max_correspondence_distance(0.5)
                    .build(),
            )
            .build();
        let result = generalized_icp(&source, &target, None, &config).unwrap();

        assert!(result.converged);
        let drift = (result.transform.to_homogeneous() - motion.to_homogeneous()).norm();
        assert!(drift < 0.05, "transform drifted by {drift}");
    }

    #[test]
    fn test_gicp_rejects_bad_epsilon() {
        let cloud = structured_cloud();
        let config = GicpConfiguration::builder().with_covariance_epsilon(0.0).build();

        assert!(matches!(
            generalized_icp(&cloud, &cloud, None, &config),
            Err(RegistrationError::ParameterError(_))
        ));
    }
}
