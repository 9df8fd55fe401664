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

use nalgebra::{RealField, Vector3};
use num_traits::AsPrimitive;

use crate::{
    concurrent,
    descriptors::{
        capped_radius_neighbours, normalize_signature,
        pair_features::{bin_index, pair_features},
        resolve_normals, validate_descriptor_inputs, DescriptorParams, FpfhSignature,
    },
    spatial::{KdTree, Neighbour},
    types::{PointCloud, RegistrationError},
};

const BINS_PER_FEATURE: usize = 11;

/// The Simplified Point Feature Histogram of one point: a triplet of 11-bin
/// angle histograms, each normalised by the neighbour count. Cached per point
/// and shared between all keypoints whose neighbourhoods overlap.
#[derive(Clone, Debug)]
struct Spfh<T> {
    f1: [T; BINS_PER_FEATURE],
    f2: [T; BINS_PER_FEATURE],
    f3: [T; BINS_PER_FEATURE],
}

impl<T: RealField + Copy> Default for Spfh<T> {
    fn default() -> Self {
        Self {
            f1: [T::zero(); BINS_PER_FEATURE],
            f2: [T::zero(); BINS_PER_FEATURE],
            f3: [T::zero(); BINS_PER_FEATURE],
        }
    }
}

fn compute_spfh<T>(
    cloud: &PointCloud<T>,
    normals: &[Vector3<T>],
    point_idx: usize,
    neighbours: &[Neighbour<T>],
) -> Spfh<T>
where
    T: RealField + Copy,
    usize: AsPrimitive<T>,
    f64: AsPrimitive<T>,
    T: AsPrimitive<usize>,
{
    let mut spfh = Spfh::default();
    let p1 = &cloud.points[point_idx];
    let n1 = &normals[point_idx];

    let mut valid_neighbours = 0usize;
    for neighbour in neighbours {
        if neighbour.index == point_idx {
            continue;
        }

        let (alpha, phi, theta) = pair_features(
            p1,
            n1,
            &cloud.points[neighbour.index],
            &normals[neighbour.index],
        );

        spfh.f1[bin_index(alpha, -T::one(), T::one(), BINS_PER_FEATURE)] += T::one();
        spfh.f2[bin_index(phi, -T::one(), T::one(), BINS_PER_FEATURE)] += T::one();
        spfh.f3[bin_index(theta, -T::pi(), T::pi(), BINS_PER_FEATURE)] += T::one();

        valid_neighbours += 1;
    }

    if valid_neighbours > 0 {
        let norm_factor = T::one() / valid_neighbours.as_();
        for bin in 0..BINS_PER_FEATURE {
            spfh.f1[bin] *= norm_factor;
            spfh.f2[bin] *= norm_factor;
            spfh.f3[bin] *= norm_factor;
        }
    }

    spfh
}

/// Extracts a 33-bin FPFH descriptor for every keypoint.
///
/// The SPFH intermediates are computed lazily, only for the union of the
/// keypoints and their neighbourhoods, in a single parallel pass before any
/// combination reads them; keypoints sharing neighbours share the cached
/// entries instead of recomputing them.
///
/// Descriptors are L2-normalised; a keypoint with an empty neighbourhood gets
/// an all-zero descriptor. Results are deterministic for fixed inputs and
/// thread count.
///
/// # Arguments
/// * `cloud`: the input cloud.
/// * `tree`: a spatial index over the cloud's points.
/// * `keypoint_indices`: the points descriptors are produced for.
/// * `params`: support radius, neighbour cap, and the parallel flag.
/// * `normals`: optional precomputed unit normals; estimated via PCA when
///   neither these nor the cloud's own normals are present.
///
/// # Returns
/// One [`FpfhSignature`] per keypoint, in keypoint order.
#[cfg_attr(
    feature = "tracing",
    tracing::instrument("Extract FPFH Descriptors", skip_all, level = "info")
)]
pub fn extract_fpfh<T>(
    cloud: &PointCloud<T>,
    tree: &KdTree<T, 3>,
    keypoint_indices: &[usize],
    params: &DescriptorParams<T>,
    normals: Option<&[Vector3<T>]>,
) -> Result<Vec<FpfhSignature<T>>, RegistrationError>
where
    T: RealField + Copy + Send + Sync,
    usize: AsPrimitive<T>,
    f64: AsPrimitive<T>,
    T: AsPrimitive<usize>,
{
    validate_descriptor_inputs(cloud, keypoint_indices, params)?;
    if keypoint_indices.is_empty() {
        return Ok(Vec::new());
    }

    let normals = resolve_normals(cloud, tree, params, normals)?;

    // Phase 1: cache every keypoint's neighbourhood.
    let keypoint_neighbours = concurrent::map_indexed(params.parallel, keypoint_indices.len(), |i| {
        capped_radius_neighbours(tree, &cloud.points[keypoint_indices[i]], params)
    });

    // Phase 2: the set of points whose SPFH is actually needed is the union of
    // the keypoints and all their neighbours. Without this cache the
    // descriptor time becomes quadratic in keypoint density.
    let mut needed_points = keypoint_indices.to_vec();
    for neighbours in &keypoint_neighbours {
        needed_points.extend(neighbours.iter().map(|n| n.index));
    }
    needed_points.sort_unstable();
    needed_points.dedup();

    let slot_of_point: HashMap<usize, usize> = needed_points
        .iter()
        .enumerate()
        .map(|(slot, &point_idx)| (point_idx, slot))
        .collect();

    let spfh_cache = concurrent::map_indexed(params.parallel, needed_points.len(), |slot| {
        let point_idx = needed_points[slot];
        let neighbours = capped_radius_neighbours(tree, &cloud.points[point_idx], params);
        compute_spfh(cloud, &normals, point_idx, &neighbours)
    });

    // Phase 3: combine the cached SPFHs into the final descriptors.
    let descriptors = concurrent::map_indexed(params.parallel, keypoint_indices.len(), |i| {
        let keypoint_idx = keypoint_indices[i];
        let neighbours = &keypoint_neighbours[i];
        let mut signature = FpfhSignature::origin();

        if neighbours.is_empty()
            || (neighbours.len() == 1 && neighbours[0].index == keypoint_idx)
        {
            return signature;
        }

        let own_spfh = &spfh_cache[slot_of_point[&keypoint_idx]];
        for bin in 0..BINS_PER_FEATURE {
            signature.coords[bin] = own_spfh.f1[bin];
            signature.coords[bin + BINS_PER_FEATURE] = own_spfh.f2[bin];
            signature.coords[bin + 2 * BINS_PER_FEATURE] = own_spfh.f3[bin];
        }

        let weight_epsilon: T = 1e-6.as_();
        let mut weight_sum = T::zero();
        for neighbour in neighbours {
            if neighbour.index == keypoint_idx {
                continue;
            }

            let weight = T::one() / (neighbour.distance + weight_epsilon);
            weight_sum += weight;

            let neighbour_spfh = &spfh_cache[slot_of_point[&neighbour.index]];
            for bin in 0..BINS_PER_FEATURE {
                signature.coords[bin] += weight * neighbour_spfh.f1[bin];
                signature.coords[bin + BINS_PER_FEATURE] += weight * neighbour_spfh.f2[bin];
                signature.coords[bin + 2 * BINS_PER_FEATURE] += weight * neighbour_spfh.f3[bin];
            }
        }

        if weight_sum > T::zero() {
            signature.coords /= T::one() + weight_sum;
        }

        normalize_signature(&mut signature);
        signature
    });

    Ok(descriptors)
}
