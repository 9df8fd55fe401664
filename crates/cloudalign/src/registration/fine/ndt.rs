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

use std::collections::HashMap;

use nalgebra::{Isometry3, Matrix3, Matrix6, Point3, RealField, Vector3, Vector6};
use num_traits::{AsPrimitive, Bounded};

use crate::{
    registration::{
        fine::{record_iteration, validate_fine_inputs, FineConfiguration},
        RegistrationResult,
    },
    types::{se3::twist_to_isometry, IsFinite, PointCloud, RegistrationError},
};

/// Cells with fewer points than this carry no usable distribution.
const MIN_POINTS_PER_CELL: usize = 5;

/// Configuration of NDT: the shared fine parameters plus the voxel size.
#[derive(Clone, Copy, Debug)]
pub struct NdtConfiguration<T> {
    pub(crate) fine: FineConfiguration<T>,
    pub(crate) resolution: T,
}

impl<T: 'static + Copy> NdtConfiguration<T>
where
    f64: AsPrimitive<T>,
{
    /// Returns a builder for the configuration struct.
    pub fn builder() -> NdtConfigurationBuilder<T> {
        NdtConfigurationBuilder {
            _internal: NdtConfiguration {
                fine: FineConfiguration::builder().build(),
                resolution: 1.0.as_(),
            },
        }
    }
}

/// A Builder-pattern struct for safely constructing an [`NdtConfiguration`].
#[derive(Clone, Copy, Debug)]
pub struct NdtConfigurationBuilder<T> {
    _internal: NdtConfiguration<T>,
}

impl<T: Copy> NdtConfigurationBuilder<T> {
    /// Replaces the shared fine-registration parameters.
    pub fn with_fine(&self, fine: FineConfiguration<T>) -> Self {
        Self {
            _internal: NdtConfiguration {
                fine,
                ..self._internal
            },
        }
    }

    /// The voxel edge length the target distribution is discretised at.
    pub fn with_resolution(&self, resolution: T) -> Self {
        Self {
            _internal: NdtConfiguration {
                resolution,
                ..self._internal
            },
        }
    }

    /// Generates an [`NdtConfiguration`] from the struct currently contained
    /// by the builder, leaving the builder intact for another use.
    pub fn build(&self) -> NdtConfiguration<T> {
        self._internal
    }
}

struct NdtCell<T: RealField> {
    mean: Vector3<T>,
    inverse_covariance: Matrix3<T>,
}

fn voxel_key<T>(point: &Point3<T>, resolution: T) -> [isize; 3]
where
    T: RealField + Copy + AsPrimitive<isize>,
{
    std::array::from_fn(|dim| (point[dim] / resolution).floor().as_())
}

/// Discretises the target into voxels of `resolution`; every cell with at
/// least [`MIN_POINTS_PER_CELL`] members stores its mean and the inverse of
/// its regularised covariance (eigenvalues floored at 1 % of the largest).
#[cfg_attr(
    feature = "tracing",
    tracing::instrument("Build NDT Voxel Map", skip_all, level = "debug")
)]
fn build_cells<T>(points: &[Point3<T>], resolution: T) -> HashMap<[isize; 3], NdtCell<T>>
where
    T: RealField + Copy + AsPrimitive<isize>,
    usize: AsPrimitive<T>,
    f64: AsPrimitive<T>,
{
    let mut members: HashMap<[isize; 3], Vec<usize>> = HashMap::new();
    for (idx, point) in points.iter().enumerate() {
        members
            .entry(voxel_key(point, resolution))
            .or_default()
            .push(idx);
    }

    members
        .into_iter()
        .filter(|(_, indices)| indices.len() >= MIN_POINTS_PER_CELL)
        .filter_map(|(key, indices)| {
            let count: T = indices.len().as_();
            let mean = indices
                .iter()
                .fold(Vector3::zeros(), |acc: Vector3<T>, &idx| {
                    acc + points[idx].coords
                })
                / count;

            let covariance = indices
                .iter()
                .fold(Matrix3::zeros(), |acc: Matrix3<T>, &idx| {
                    let diff = points[idx].coords - mean;
                    acc + diff * diff.transpose()
                })
                / (count - T::one());

            // Floor small eigenvalues so near-degenerate cells stay invertible.
            let mut eigen = covariance.symmetric_eigen();
            let mut largest = eigen.eigenvalues[0];
            for i in 1..3 {
                largest = largest.max(eigen.eigenvalues[i]);
            }
            if largest <= T::zero() {
                return None;
            }
            let floor = largest * 0.01.as_();
            for i in 0..3 {
                if eigen.eigenvalues[i] < floor {
                    eigen.eigenvalues[i] = floor;
                }
            }
            let regularised = eigen.recompose();

            regularised
                .try_inverse()
                .map(|inverse_covariance| (key, NdtCell { mean, inverse_covariance }))
        })
        .collect()
}

/// `∂²(exp(δ)q)/∂δ_a∂δ_b` at `δ = 0`, the symmetric second derivative of a
/// left-perturbed rotation.
fn rotation_second_derivative<T>(a: usize, b: usize, q: &Vector3<T>) -> Vector3<T>
where
    T: RealField + Copy,
    f64: AsPrimitive<T>,
{
    let mut e_a = Vector3::zeros();
    e_a[a] = T::one();
    let mut e_b = Vector3::zeros();
    e_b[b] = T::one();

    (e_a.cross(&e_b.cross(q)) + e_b.cross(&e_a.cross(q))) * 0.5.as_()
}

/// Normal Distributions Transform registration.
///
/// The target is modelled as a set of per-voxel Gaussians; the source pose is
/// optimised by Newton's method on the 6-vector twist of a delta transform,
/// maximising `Σ exp(−½ (T·sᵢ − μᵥ)ᵀ Σᵥ⁻¹ (T·sᵢ − μᵥ))` over the points that
/// fall into modelled voxels. The analytic gradient and Hessian include the
/// second-order rotation terms; the Newton system is damped until positive
/// definite.
///
/// Convergence: the twist step norm falls below `transformation_epsilon`, or
/// the mean score change falls below `euclidean_fitness_epsilon`.
///
/// # Returns
/// A [`RegistrationResult`] whose `fitness_score` is the negated mean cell
/// score (lower is better) and whose `inliers` are the source points that fell
/// into modelled voxels in the final iteration.
#[cfg_attr(feature = "tracing", tracing::instrument("NDT Registration", skip_all, level = "info"))]
pub fn ndt_registration<T>(
    source: &PointCloud<T>,
    target: &PointCloud<T>,
    initial_guess: Option<Isometry3<T>>,
    config: &NdtConfiguration<T>,
) -> Result<RegistrationResult<T>, RegistrationError>
where
    T: RealField + Copy + Bounded + IsFinite + Send + Sync,
    usize: AsPrimitive<T>,
    f64: AsPrimitive<T>,
    T: AsPrimitive<usize>,
    T: AsPrimitive<isize>,
{
    if config.resolution <= T::zero() {
        return Err(RegistrationError::ParameterError(
            "resolution must be positive",
        ));
    }
    validate_fine_inputs(source, target, &config.fine)?;

    let cells = build_cells(&target.points, config.resolution);
    if cells.is_empty() {
        return Err(RegistrationError::InvalidInput(
            "no voxel gathered enough target points for a distribution",
        ));
    }
    log::debug!("NDT modelled {} voxels", cells.len());

    let mut current_transform = initial_guess.unwrap_or_else(Isometry3::identity);
    let mut previous_error = <T as Bounded>::max_value();

    let mut result = RegistrationResult::unconverged();
    result.transform = current_transform;

    let half: T = 0.5.as_();

    for iteration in 0..config.fine.max_iterations {
        result.num_iterations = iteration + 1;

        let mut gradient = Vector6::<T>::zeros();
        let mut hessian = Matrix6::<T>::zeros();
        let mut score_sum = T::zero();
        let mut in_cell_indices = Vec::new();

        for (source_idx, point) in source.points.iter().enumerate() {
            let transformed = current_transform.transform_point(point);
            let Some(cell) = cells.get(&voxel_key(&transformed, config.resolution)) else {
                continue;
            };

            let q = transformed.coords - cell.mean;
            let b_matrix = &cell.inverse_covariance;
            let exponent = -half * (q.transpose() * b_matrix * q)[(0, 0)];
            if exponent < (-50.0).as_() {
                continue; // numerically zero contribution
            }
            let score = exponent.exp();

            in_cell_indices.push(source_idx);
            score_sum += score;

            let b_q = b_matrix * q;

            // Jacobian columns of q with respect to the delta twist:
            // translation is the identity, rotation is e_a x q_w.
            let mut jacobian_columns = [Vector3::zeros(); 6];
            for dim in 0..3 {
                let mut column = Vector3::zeros();
                column[dim] = T::one();
                jacobian_columns[dim] = column;
            }
            for axis in 0..3 {
                let mut e_axis = Vector3::zeros();
                e_axis[axis] = T::one();
                jacobian_columns[3 + axis] = e_axis.cross(&transformed.coords);
            }

            let mut q_b_j = Vector6::zeros();
            for j in 0..6 {
                q_b_j[j] = jacobian_columns[j].dot(&b_q);
            }

            for j in 0..6 {
                gradient[j] += score * q_b_j[j];

                for k in j..6 {
                    let mut second_order = T::zero();
                    if j >= 3 && k >= 3 {
                        second_order = rotation_second_derivative(
                            j - 3,
                            k - 3,
                            &transformed.coords,
                        )
                        .dot(&b_q);
                    }

                    let entry = score
                        * (jacobian_columns[k].dot(&(b_matrix * jacobian_columns[j]))
                            + second_order
                            - q_b_j[j] * q_b_j[k]);
                    hessian[(j, k)] += entry;
                    if k != j {
                        hessian[(k, j)] += entry;
                    }
                }
            }
        }

        if in_cell_indices.is_empty() {
            log::debug!("NDT iteration {iteration}: no source point fell into a modelled voxel");
            break;
        }

        let count: T = in_cell_indices.len().as_();
        let error = -(score_sum / count);
        let error_change = (previous_error - error).abs();
        record_iteration(
            &mut result.history,
            &config.fine,
            iteration,
            &current_transform,
            error,
            error_change,
            in_cell_indices.len(),
        );

        // Damped Newton step on E = -score, solving (H + lambda I) step = -g.
        let mut damping = T::zero();
        let step = loop {
            let mut damped = hessian;
            for diag in 0..6 {
                damped[(diag, diag)] += damping;
            }

            if let Some(cholesky) = damped.cholesky() {
                break cholesky.solve(&(-gradient));
            }

            damping = if damping <= T::zero() {
                1e-6.as_()
            } else {
                damping * 10.0.as_()
            };
            if damping > 1e12.as_() {
                // The quadratic model is hopeless; fall back to a tiny
                // gradient descent step.
                break -gradient * 1e-3.as_();
            }
        };

        current_transform = twist_to_isometry(&step) * current_transform;
        previous_error = error;
        result.inliers = in_cell_indices;
        result.fitness_score = error;

        if step.norm() < config.fine.transformation_epsilon
            || error_change < config.fine.euclidean_fitness_epsilon
        {
            log::trace!("NDT converged after {} iterations", iteration + 1);
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

    use crate::utils::generate_point_cloud;

    use super::*;

    /// A dense structured slab; about 40 points land in every unit voxel.
    fn dense_cloud() -> PointCloud<f64> {
        let jitter = generate_point_cloud::<f64, 3>(4096, std::array::from_fn(|_| -0.45f64..=0.45));
        let mut points = Vec::with_capacity(4096);
        for i in 0..16 {
            for j in 0..16 {
                for k in 0..16 {
                    let idx = (i * 16 + j) * 16 + k;
                    points.push(Point3::new(
                        i as f64 * 0.5 + jitter[idx].x,
                        j as f64 * 0.5 + jitter[idx].y,
                        k as f64 * 0.25 + jitter[idx].z * 0.5,
                    ));
                }
            }
        }
        PointCloud::from_points(points)
    }

    #[test]
    fn test_cells_require_minimum_membership() {
        let sparse = PointCloud::from_points(vec![
            Point3::new(0.1f64, 0.1, 0.1),
            Point3::new(0.2, 0.2, 0.2),
            Point3::new(10.0, 10.0, 10.0),
        ]);

        assert!(build_cells(&sparse.points, 1.0).is_empty());

        let dense = dense_cloud();
        assert!(!build_cells(&dense.points, 1.0).is_empty());
    }

    #[test]
    fn test_ndt_identity() {
        let cloud = dense_cloud();
        let config = NdtConfiguration::builder()
            .with_fine(FineConfiguration::builder().with_max_iterations(30).build())
            .with_resolution(1.0)
            .build();

        let result = ndt_registration(&cloud, &cloud, None, &config).unwrap();

        assert!(result.converged);
        let drift = (result.transform.to_homogeneous()
            - Isometry3::identity().to_homogeneous())
        .norm();
        assert!(drift < 0.05, "identity drifted by {drift}");
    }

    #[test]
    fn test_ndt_translation_recovery() {
        let target = dense_cloud();
        let motion = Isometry3::new(Vector3::new(0.2, -0.15, 0.1), Vector3::zeros());
        let source = target.transformed(&motion.inverse());

        let config = NdtConfiguration::builder()
            .with_fine(FineConfiguration::builder().with_max_iterations(50).build())
            .with_resolution(1.0)
            .build();
        let result = ndt_registration(&source, &target, None, &config).unwrap();

        assert!(result.converged);
        let drift = (result.transform.to_homogeneous() - motion.to_homogeneous()).norm();
        assert!(drift < 0.1, "transform drifted by {drift}");
    }

    #[test]
    fn test_ndt_resolutions() {
        let target = dense_cloud();
        let motion = Isometry3::new(Vector3::new(0.1, 0.05, -0.05), Vector3::zeros());
        let source = target.transformed(&motion.inverse());

        for resolution in [0.75, 1.0, 1.5] {
            let config = NdtConfiguration::builder()
                .with_fine(FineConfiguration::builder().with_max_iterations(50).build())
                .with_resolution(resolution)
                .build();
            let result = ndt_registration(&source, &target, None, &config).unwrap();

            assert!(result.converged, "did not converge at resolution {resolution}");
            assert!(!result.inliers.is_empty());
        }
    }

    #[test]
    fn test_ndt_rejects_bad_resolution() {
        let cloud = dense_cloud();
        let config = NdtConfiguration::builder().with_resolution(0.0).build();

        assert!(matches!(
            ndt_registration(&cloud, &cloud, None, &config),
            Err(RegistrationError::ParameterError(_))
        ));
    }
}
