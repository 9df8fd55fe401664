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

use nalgebra::{Isometry3, Point3, RealField};
use num_traits::{AsPrimitive, Bounded};

use crate::{concurrent, spatial::KdTree};

fn directed_max_distance<T: RealField + Copy>(from: &[Point3<T>], to_tree: &KdTree<T, 3>) -> T {
    from.iter()
        .filter_map(|point| to_tree.kneighbors(point, 1).first().map(|n| n.distance))
        .fold(T::zero(), |acc, distance| acc.max(distance))
}

fn directed_mean_distance<T>(from: &[Point3<T>], to_tree: &KdTree<T, 3>) -> T
where
    T: RealField + Copy,
    usize: AsPrimitive<T>,
{
    from.iter()
        .filter_map(|point| to_tree.kneighbors(point, 1).first().map(|n| n.distance))
        .fold(T::zero(), |acc, distance| acc + distance)
        / from.len().as_()
}

/// Hausdorff distance between two clouds: the worst nearest-neighbour
/// distance, taken over both directions.
///
/// # Returns
/// `T::max_value()` when either cloud is empty.
#[cfg_attr(
    feature = "tracing",
    tracing::instrument("Hausdorff Distance", skip_all, level = "debug")
)]
pub fn hausdorff_distance<T>(cloud_a: &[Point3<T>], cloud_b: &[Point3<T>]) -> T
where
    T: RealField + Copy + Bounded,
{
    if cloud_a.is_empty() || cloud_b.is_empty() {
        return <T as Bounded>::max_value();
    }

    let tree_a = KdTree::new(cloud_a);
    let tree_b = KdTree::new(cloud_b);

    directed_max_distance(cloud_a, &tree_b).max(directed_max_distance(cloud_b, &tree_a))
}

/// Chamfer distance between two clouds: the average nearest-neighbour
/// distance, averaged over both directions.
///
/// # Returns
/// `T::max_value()` when either cloud is empty.
#[cfg_attr(
    feature = "tracing",
    tracing::instrument("Chamfer Distance", skip_all, level = "debug")
)]
pub fn chamfer_distance<T>(cloud_a: &[Point3<T>], cloud_b: &[Point3<T>]) -> T
where
    T: RealField + Copy + Bounded,
    usize: AsPrimitive<T>,
    f64: AsPrimitive<T>,
{
    if cloud_a.is_empty() || cloud_b.is_empty() {
        return <T as Bounded>::max_value();
    }

    let tree_a = KdTree::new(cloud_a);
    let tree_b = KdTree::new(cloud_b);

    (directed_mean_distance(cloud_a, &tree_b) + directed_mean_distance(cloud_b, &tree_a))
        * 0.5.as_()
}

/// The Largest-Common-Pointset fitness: transforms every source point, finds
/// its nearest target, and averages the distances of the points that landed
/// within `inlier_threshold`. Lower is better.
///
/// This is the one authoritative quality definition shared by all coarse
/// estimators.
///
/// # Arguments
/// * `source`: the source points the transform is applied to.
/// * `target_tree`: a prebuilt index over the target cloud.
/// * `transform`: the rigid transform under evaluation.
/// * `inlier_threshold`: the inlier radius.
/// * `parallel`: whether to fan the per-point queries out to the thread pool.
///
/// # Returns
/// The mean inlier distance (`T::max_value()` when there are no inliers), and
/// the indices of the inlying source points.
#[cfg_attr(feature = "tracing", tracing::instrument("LCP Score", skip_all))]
pub fn lcp_score_with_tree<T>(
    source: &[Point3<T>],
    target_tree: &KdTree<T, 3>,
    transform: &Isometry3<T>,
    inlier_threshold: T,
    parallel: bool,
) -> (T, Vec<usize>)
where
    T: RealField + Copy + Bounded + Send + Sync,
    usize: AsPrimitive<T>,
{
    if source.is_empty() || target_tree.is_empty() {
        return (<T as Bounded>::max_value(), Vec::new());
    }

    let nearest_distances = concurrent::map_indexed(parallel, source.len(), |idx| {
        let transformed = transform.transform_point(&source[idx]);
        target_tree
            .kneighbors(&transformed, 1)
            .first()
            .map(|n| n.distance)
    });

    let mut total_distance = T::zero();
    let mut inliers = Vec::new();
    for (idx, distance) in nearest_distances.into_iter().enumerate() {
        if let Some(distance) = distance {
            if distance <= inlier_threshold {
                total_distance += distance;
                inliers.push(idx);
            }
        }
    }

    if inliers.is_empty() {
        return (<T as Bounded>::max_value(), inliers);
    }

    (total_distance / inliers.len().as_(), inliers)
}

/// [`lcp_score_with_tree`] for callers without a prebuilt target index.
pub fn lcp_score<T>(
    source: &[Point3<T>],
    target: &[Point3<T>],
    transform: &Isometry3<T>,
    inlier_threshold: T,
) -> (T, Vec<usize>)
where
    T: RealField + Copy + Bounded + Send + Sync,
    usize: AsPrimitive<T>,
{
    let target_tree = KdTree::new(target);
    lcp_score_with_tree(source, &target_tree, transform, inlier_threshold, false)
}

#[cfg(test)]
mod tests {
    use nalgebra::Vector3;

    use crate::utils::{generate_point_cloud, transform_point_cloud};

    use super::*;

    #[test]
    fn test_hausdorff_identical_clouds_is_zero() {
        let cloud = generate_point_cloud(64, std::array::from_fn(|_| -1.0f32..=1.0));
        assert!(hausdorff_distance(&cloud, &cloud) < 1e-6);
    }

    #[test]
    fn test_hausdorff_detects_outlier() {
        let cloud_a = vec![Point3::new(0.0f64, 0.0, 0.0), Point3::new(1.0, 0.0, 0.0)];
        let mut cloud_b = cloud_a.clone();
        cloud_b.push(Point3::new(10.0, 0.0, 0.0));

        assert!((hausdorff_distance(&cloud_a, &cloud_b) - 9.0).abs() < 1e-12);
    }

    #[test]
    fn test_chamfer_is_symmetric() {
        let cloud_a = generate_point_cloud(64, std::array::from_fn(|_| -2.0f64..=2.0));
        let cloud_b = cloud_a
            .iter()
            .map(|p| p + Vector3::new(0.05, 0.0, 0.0))
            .collect::<Vec<_>>();

        let ab = chamfer_distance(&cloud_a, &cloud_b);
        let ba = chamfer_distance(&cloud_b, &cloud_a);
        assert!((ab - ba).abs() < 1e-12);
        assert!(ab <= 0.05 + 1e-9);
    }

    #[test]
    fn test_lcp_perfect_alignment() {
        let cloud = generate_point_cloud(128, std::array::from_fn(|_| -5.0f32..=5.0));
        let (score, inliers) = lcp_score(&cloud, &cloud, &Isometry3::identity(), 0.1);

        assert!(score < 1e-5);
        assert_eq!(inliers.len(), cloud.len());
    }

    #[test]
    fn test_lcp_no_inliers_is_max() {
        let source = vec![Point3::new(0.0f32, 0.0, 0.0)];
        let target = vec![Point3::new(100.0, 0.0, 0.0)];

        let (score, inliers) = lcp_score(&source, &target, &Isometry3::identity(), 0.5);
        assert_eq!(score, f32::MAX);
        assert!(inliers.is_empty());
    }

    #[test]
    fn test_lcp_symmetry_under_swap_and_inverse() {
        let cloud = generate_point_cloud(100, std::array::from_fn(|_| -3.0f64..=3.0));
        let isom = Isometry3::new(Vector3::new(0.4, -0.2, 0.3), Vector3::new(0.1, 0.2, -0.1));
        let transformed = transform_point_cloud(&cloud, isom);

        let (forward, forward_inliers) = lcp_score(&cloud, &transformed, &isom, 0.05);
        let (backward, backward_inliers) =
            lcp_score(&transformed, &cloud, &isom.inverse(), 0.05);

        assert!((forward - backward).abs() < 1e-9);
        assert_eq!(forward_inliers.len(), backward_inliers.len());
    }

    #[test]
    fn test_lcp_parallel_matches_serial() {
        let cloud = generate_point_cloud(256, std::array::from_fn(|_| -4.0f32..=4.0));
        let isom = Isometry3::new(Vector3::new(0.01, 0.0, 0.0), Vector3::zeros());
        let tree = KdTree::new(cloud.as_slice());

        let serial = lcp_score_with_tree(&cloud, &tree, &isom, 0.5, false);
        let parallel = lcp_score_with_tree(&cloud, &tree, &isom, 0.5, true);
        assert_eq!(serial, parallel);
    }
}
