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

use nalgebra::{RealField, Vector3};
use num_traits::AsPrimitive;

use crate::{
    concurrent,
    descriptors::{
        capped_radius_neighbours, normalize_signature,
        pair_features::{bin_index, pair_features},
        resolve_normals, validate_descriptor_inputs, DescriptorParams, PfhSignature,
    },
    spatial::KdTree,
    types::{PointCloud, RegistrationError},
};

const SUBDIVISIONS: usize = 5;

/// Extracts a 125-bin PFH descriptor for every keypoint: the full 5³ joint
/// histogram of the Darboux angles over all ordered point pairs inside the
/// support neighbourhood.
///
/// The cost is quadratic in the neighbourhood size, so `max_neighbours` should
/// stay small (≤ 30 or so); FPFH is the linear-cost alternative.
///
/// Descriptors are L2-normalised; a keypoint with an empty neighbourhood gets
/// an all-zero descriptor.
///
/// # Arguments
/// * `cloud`: the input cloud.
/// * `tree`: a spatial index over the cloud's points.
/// * `keypoint_indices`: the points descriptors are produced for.
/// * `params`: support radius, neighbour cap, and the parallel flag.
/// * `normals`: optional precomputed unit normals; estimated via PCA when
///   neither these nor the cloud's own normals are present.
#[cfg_attr(
    feature = "tracing",
    tracing::instrument("Extract PFH Descriptors", skip_all, level = "info")
)]
pub fn extract_pfh<T>(
    cloud: &PointCloud<T>,
    tree: &KdTree<T, 3>,
    keypoint_indices: &[usize],
    params: &DescriptorParams<T>,
    normals: Option<&[Vector3<T>]>,
) -> Result<Vec<PfhSignature<T>>, RegistrationError>
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

    let descriptors = concurrent::map_indexed(params.parallel, keypoint_indices.len(), |i| {
        let keypoint_idx = keypoint_indices[i];
        let mut signature = PfhSignature::origin();

        // The neighbourhood always includes the keypoint itself.
        let mut members = capped_radius_neighbours(tree, &cloud.points[keypoint_idx], params)
            .into_iter()
            .map(|n| n.index)
            .collect::<Vec<_>>();
        if !members.contains(&keypoint_idx) {
            members.push(keypoint_idx);
        }

        if members.len() < 2 {
            return signature;
        }

        let mut pair_count = 0usize;
        for &first in &members {
            for &second in &members {
                if first == second {
                    continue;
                }

                let (alpha, phi, theta) = pair_features(
                    &cloud.points[first],
                    &normals[first],
                    &cloud.points[second],
                    &normals[second],
                );

                let b1 = bin_index(alpha, -T::one(), T::one(), SUBDIVISIONS);
                let b2 = bin_index(phi, -T::one(), T::one(), SUBDIVISIONS);
                let b3 = bin_index(theta, -T::pi(), T::pi(), SUBDIVISIONS);

                signature.coords[b1 + SUBDIVISIONS * b2 + SUBDIVISIONS * SUBDIVISIONS * b3] +=
                    T::one();
                pair_count += 1;
            }
        }

        if pair_count > 0 {
            signature.coords /= pair_count.as_();
        }

        normalize_signature(&mut signature);
        signature
    });

    Ok(descriptors)
}

#[cfg(test)]
mod tests {
    use nalgebra::Point3;

    use crate::utils::generate_point_cloud;

    use super::*;

    #[test]
    fn test_pfh_basic_properties() {
        let cloud = PointCloud::from_points(generate_point_cloud(
            200,
            std::array::from_fn(|_| -1.0f64..=1.0),
        ));
        let tree = KdTree::new(&cloud.points);
        let params = DescriptorParams::new(0.5)
            .with_max_neighbours(20)
            .with_parallel(false);
        let keypoints = [3usize, 57, 110];

        let descriptors = extract_pfh(&cloud, &tree, &keypoints, &params, None).unwrap();

        assert_eq!(descriptors.len(), keypoints.len());
        for descriptor in &descriptors {
            assert!((descriptor.coords.norm() - 1.0).abs() < 1e-9);
            assert!(descriptor.coords.iter().all(|&v| v >= 0.0));
        }
    }

    #[test]
    fn test_pfh_deterministic_across_parallelism() {
        let cloud = PointCloud::from_points(generate_point_cloud(
            150,
            std::array::from_fn(|_| -1.0f32..=1.0),
        ));
        let tree = KdTree::new(&cloud.points);
        let keypoints = (0..cloud.len()).step_by(11).collect::<Vec<_>>();

        let serial = extract_pfh(
            &cloud,
            &tree,
            &keypoints,
            &DescriptorParams::new(0.4)
                .with_max_neighbours(16)
                .with_parallel(false),
            None,
        )
        .unwrap();
        let parallel = extract_pfh(
            &cloud,
            &tree,
            &keypoints,
            &DescriptorParams::new(0.4)
                .with_max_neighbours(16)
                .with_parallel(true),
            None,
        )
        .unwrap();

        assert_eq!(serial, parallel);
    }

    #[test]
    fn test_pfh_isolated_keypoint_is_zero() {
        let mut points = generate_point_cloud(64, std::array::from_fn(|_| -1.0f32..=1.0));
        points.push(Point3::new(50.0, 50.0, 50.0));
        let cloud = PointCloud::from_points(points);
        let tree = KdTree::new(&cloud.points);

        let descriptors = extract_pfh(
            &cloud,
            &tree,
            &[cloud.len() - 1],
            &DescriptorParams::new(0.3).with_parallel(false),
            None,
        )
        .unwrap();

        assert_eq!(descriptors[0].coords.norm(), 0.0);
    }
}
