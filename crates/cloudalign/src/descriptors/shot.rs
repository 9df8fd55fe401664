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
use num_traits::AsPrimitive;

use crate::{
    concurrent,
    descriptors::{
        capped_radius_neighbours, normalize_signature, validate_descriptor_inputs,
        DescriptorParams, ShotSignature,
    },
    spatial::{KdTree, Neighbour},
    types::{PointCloud, RegistrationError},
};

const VALUE_BINS: usize = 11;
const AZIMUTH_BINS: usize = 8;

/// A repeatable orthonormal, right-handed basis attached to a keypoint,
/// used by SHOT to bin neighbours rotation-invariantly.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LocalReferenceFrame<T: RealField> {
    /// The direction of largest weighted spread.
    pub x_axis: Vector3<T>,
    /// Completes the right-handed frame, `y = z × x`.
    pub y_axis: Vector3<T>,
    /// The direction of smallest weighted spread (the surface normal proxy).
    pub z_axis: Vector3<T>,
}

/// Computes the SHOT local reference frame of `query` from its neighbourhood,
/// weighting each neighbour by `(radius − distance)` to reduce boundary
/// sensitivity.
///
/// Axis signs follow the majority rule: an axis is flipped when strictly more
/// than half of the neighbours lie on its negative side; ties keep the
/// unflipped axis, so the frame is repeatable for a fixed neighbourhood.
///
/// # Returns
/// [`None`] when the weighted covariance is degenerate (too few distinct
/// neighbours, or all weights zero).
#[cfg_attr(
    feature = "tracing",
    tracing::instrument("Compute SHOT Reference Frame", skip_all, level = "trace")
)]
pub fn compute_local_reference_frame<T>(
    points: &[Point3<T>],
    query: &Point3<T>,
    neighbours: &[Neighbour<T>],
    radius: T,
) -> Option<LocalReferenceFrame<T>>
where
    T: RealField + Copy,
{
    if neighbours.len() < 3 {
        return None;
    }

    let mut weight_sum = T::zero();
    let mut covariance = Matrix3::zeros();
    for neighbour in neighbours {
        let weight = radius - neighbour.distance;
        if weight <= T::zero() {
            continue;
        }

        let diff = points[neighbour.index] - query;
        covariance += (diff * diff.transpose()) * weight;
        weight_sum += weight;
    }

    if weight_sum <= T::zero() {
        return None;
    }
    covariance /= weight_sum;

    let eigen = covariance.symmetric_eigen();

    // Order the axes by descending eigenvalue without assuming solver order.
    let mut order = [0usize, 1, 2];
    order.sort_by(|&a, &b| {
        eigen.eigenvalues[b]
            .partial_cmp(&eigen.eigenvalues[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    if eigen.eigenvalues[order[0]] <= T::zero() {
        return None;
    }

    let mut x_axis: Vector3<T> = eigen.eigenvectors.column(order[0]).into_owned();
    let mut z_axis: Vector3<T> = eigen.eigenvectors.column(order[2]).into_owned();
    if x_axis.normalize_mut() <= T::zero() || z_axis.normalize_mut() <= T::zero() {
        return None;
    }

    // Majority-rule sign disambiguation; ties prefer no flip.
    for axis in [&mut x_axis, &mut z_axis] {
        let mut negative = 0usize;
        let mut positive = 0usize;
        for neighbour in neighbours {
            let side = (points[neighbour.index] - query).dot(axis);
            if side < T::zero() {
                negative += 1;
            } else if side > T::zero() {
                positive += 1;
            }
        }
        if negative > positive {
            *axis = -*axis;
        }
    }

    let y_axis = z_axis.cross(&x_axis);

    Some(LocalReferenceFrame {
        x_axis,
        y_axis,
        z_axis,
    })
}

/// Accumulates `weight` into the `(radial, value)` position with bilinear
/// interpolation across the two radial shells and the eleven cosine bins.
fn accumulate_interpolated<T>(
    signature: &mut ShotSignature<T>,
    spatial_base: usize,
    radial_pos: T,
    value_pos: T,
    weight: T,
) where
    T: RealField + Copy,
    T: AsPrimitive<usize>,
    usize: AsPrimitive<T>,
    f64: AsPrimitive<T>,
{
    let half: T = 0.5.as_();

    // Each dimension distributes between its two adjacent bins.
    let radial_f = radial_pos - half;
    let value_f = value_pos - half;

    let radial_low = radial_f.floor();
    let value_low = value_f.floor();
    let radial_frac = radial_f - radial_low;
    let value_frac = value_f - value_low;

    let radial_low: isize = if radial_low < T::zero() {
        -1
    } else {
        radial_low.as_() as isize
    };
    let value_low: isize = if value_low < T::zero() {
        -1
    } else {
        value_low.as_() as isize
    };

    for (radial_offset, radial_weight) in [(0isize, T::one() - radial_frac), (1, radial_frac)] {
        let radial_bin = radial_low + radial_offset;
        if !(0..2).contains(&radial_bin) {
            continue;
        }

        for (value_offset, value_weight) in [(0isize, T::one() - value_frac), (1, value_frac)] {
            let value_bin = value_low + value_offset;
            if !(0..VALUE_BINS as isize).contains(&value_bin) {
                continue;
            }

            let spatial_bin = spatial_base + radial_bin as usize;
            signature.coords[spatial_bin * VALUE_BINS + value_bin as usize] +=
                weight * radial_weight * value_weight;
        }
    }
}

/// Extracts a 352-bin SHOT descriptor for every keypoint: 32 spatial bins
/// (2 radial × 2 elevation × 8 azimuth, in the keypoint's local reference
/// frame) of 11-bin histograms over `cos` of the angle between each
/// neighbour's normal and the frame's z-axis.
///
/// Unlike FPFH and PFH, SHOT does not estimate normals on its own: pass them
/// in, or store them on the cloud.
///
/// # Returns
/// One unit-L2 [`ShotSignature`] per keypoint (all-zero for empty or
/// degenerate neighbourhoods), or [`RegistrationError::MissingNormals`] when
/// no normals are available.
#[cfg_attr(
    feature = "tracing",
    tracing::instrument("Extract SHOT Descriptors", skip_all, level = "info")
)]
pub fn extract_shot<T>(
    cloud: &PointCloud<T>,
    tree: &KdTree<T, 3>,
    keypoint_indices: &[usize],
    params: &DescriptorParams<T>,
    normals: Option<&[Vector3<T>]>,
) -> Result<Vec<ShotSignature<T>>, RegistrationError>
where
    T: RealField + Copy + Send + Sync,
    usize: AsPrimitive<T>,
    f64: AsPrimitive<T>,
    T: AsPrimitive<usize>,
{
    validate_descriptor_inputs(cloud, keypoint_indices, params)?;

    let normals = match normals {
        Some(normals) => {
            if normals.len() != cloud.len() {
                return Err(RegistrationError::InvalidInput(
                    "supplied normals length does not match cloud length",
                ));
            }
            normals
        }
        None if !cloud.normals.is_empty() => {
            if cloud.normals.len() != cloud.len() {
                return Err(RegistrationError::InvalidInput(
                    "cloud normals length does not match points length",
                ));
            }
            cloud.normals.as_slice()
        }
        None => {
            return Err(RegistrationError::MissingNormals(
                "SHOT requires per-point normals",
            ))
        }
    };

    let half_radius = params.search_radius / (T::one() + T::one());

    let descriptors = concurrent::map_indexed(params.parallel, keypoint_indices.len(), |i| {
        let keypoint_idx = keypoint_indices[i];
        let query = &cloud.points[keypoint_idx];
        let mut signature = ShotSignature::origin();

        let neighbours = capped_radius_neighbours(tree, query, params);
        let Some(frame) =
            compute_local_reference_frame(&cloud.points, query, &neighbours, params.search_radius)
        else {
            return signature;
        };

        for neighbour in &neighbours {
            if neighbour.index == keypoint_idx {
                continue;
            }

            let normal = &normals[neighbour.index];
            if normal.norm_squared() <= T::zero() {
                continue; // invalid normal, flagged upstream as a zero vector
            }

            let diff = cloud.points[neighbour.index] - query;
            let local_x = frame.x_axis.dot(&diff);
            let local_y = frame.y_axis.dot(&diff);
            let local_z = frame.z_axis.dot(&diff);

            let azimuth = local_y.atan2(local_x); // [-pi, pi]
            let azimuth_normalized = (azimuth + T::pi()) / (T::pi() + T::pi());
            let azimuth_bin = <T as AsPrimitive<usize>>::as_(
                azimuth_normalized * AZIMUTH_BINS.as_(),
            )
            .min(AZIMUTH_BINS - 1);
            let elevation_bin = usize::from(local_z >= T::zero());

            // Spatial layout: ((azimuth * 2) + elevation) * 2 + radial.
            let spatial_base = (azimuth_bin * 2 + elevation_bin) * 2;

            let radial_pos = neighbour.distance / half_radius; // [0, 2)
            let cos_angle = normal.dot(&frame.z_axis).max(-T::one()).min(T::one());
            let value_pos = (cos_angle + T::one()) / (T::one() + T::one()) * VALUE_BINS.as_();

            accumulate_interpolated(&mut signature, spatial_base, radial_pos, value_pos, T::one());
        }

        normalize_signature(&mut signature);
        signature
    });

    Ok(descriptors)
}
