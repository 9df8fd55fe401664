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

use nalgebra::{Isometry3, Matrix6, RealField, Vector6};
use num_traits::{AsPrimitive, Bounded};

use crate::{
    registration::{
        fine::{
            find_fine_correspondences, has_converged, record_iteration, reject_outlier_pairs,
            validate_fine_inputs, FineConfiguration, FinePair,
        },
        RegistrationResult,
    },
    spatial::KdTree,
    types::{se3::twist_to_isometry, IsFinite, PointCloud, RegistrationError},
};

/// Point-to-plane ICP.
///
/// Minimises `Σ ((R·sᵢ + t − tᵢ) · nᵢ)²` over the target normals `nᵢ`,
/// linearising the rotation with a small-angle approximation each iteration
/// and solving the resulting 6×6 normal equations. Converges notably faster
/// than point-to-point on planar surfaces.
///
/// # Returns
/// * [`RegistrationError::MissingNormals`] when the target carries no normals.
/// * [`RegistrationError::NumericFailure`] when the normal equations are
///   singular (all normals parallel).
/// * Otherwise a [`RegistrationResult`] whose `fitness_score` is the final
///   mean squared plane residual.
#[cfg_attr(
    feature = "tracing",
    tracing::instrument("Point To Plane ICP", skip_all, level = "info")
)]
pub fn point_to_plane_icp<T>(
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

    if target.normals.is_empty() {
        return Err(RegistrationError::MissingNormals(
            "point-to-plane ICP requires target normals",
        ));
    }
    if target.normals.len() != target.len() {
        return Err(RegistrationError::InvalidInput(
            "target normals length does not match points length",
        ));
    }

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
            log::debug!("P2L ICP iteration {iteration}: no correspondences in range");
            break;
        }
        reject_outlier_pairs(&mut pairs, config.outlier_rejection_ratio);

        let error = mean_plane_error(&transformed, target, &pairs);
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

        // Accumulate the 6x6 normal equations of the linearised problem;
        // the unknown is the twist (t, omega) of a delta transform.
        let mut normal_matrix = Matrix6::<T>::zeros();
        let mut normal_rhs = Vector6::<T>::zeros();
        for pair in &pairs {
            let point = &transformed[pair.source_index];
            let normal = &target.normals[pair.target_index];
            let residual = (point - target.points[pair.target_index]).dot(normal);

            let rotational = point.coords.cross(normal);
            let row = Vector6::new(
                normal.x, normal.y, normal.z, rotational.x, rotational.y, rotational.z,
            );

            normal_matrix += row * row.transpose();
            normal_rhs -= row * residual;
        }

        let Some(cholesky) = normal_matrix.cholesky() else {
            return Err(RegistrationError::NumericFailure(
                "point-to-plane normal equations are singular",
            ));
        };
        let twist = cholesky.solve(&normal_rhs);

        let new_transform = twist_to_isometry(&twist) * current_transform;
        let converged = has_converged(&current_transform, &new_transform, error_change, config);

        current_transform = new_transform;
        previous_error = error;
        result.inliers = pairs.iter().map(|pair| pair.source_index).collect();
        result.fitness_score = error;

        if converged {
            log::trace!("P2L ICP converged after {} iterations", iteration + 1);
            result.converged = true;
            break;
        }
    }

    result.transform = current_transform;
    Ok(result)
}

fn mean_plane_error<T>(
    transformed_source: &[nalgebra::Point3<T>],
    target: &PointCloud<T>,
    pairs: &[FinePair<T>],
) -> T
where
    T: RealField + Copy + Bounded,
    usize: AsPrimitive<T>,
{
    if pairs.is_empty() {
        return <T as Bounded>::max_value();
    }

    pairs
        .iter()
        .fold(T::zero(), |acc, pair| {
            let residual = (transformed_source[pair.source_index]
                - target.points[pair.target_index])
                .dot(&target.normals[pair.target_index]);
            acc + residual * residual
        })
        / pairs.len().as_()
}
