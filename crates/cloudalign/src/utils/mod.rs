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
use std::ops::RangeInclusive;

use nalgebra::{Isometry3, Matrix3, Point, Point3, RealField};
use num_traits::AsPrimitive;

/// Calculates the squared Euclidean distance between two points of any
/// dimension, descriptor-space points included.
///
/// # Generics
/// * `T`: Either an [`f32`] or [`f64`].
/// * `N`: A const usize, representing the number of dimensions in the points.
#[inline]
pub fn distance_squared<T, const N: usize>(point_a: &Point<T, N>, point_b: &Point<T, N>) -> T
where
    T: RealField + Copy,
{
    (point_a - point_b).norm_squared()
}

/// Calculates the mean(centroid) of the point cloud.
///
/// # Arguments
/// * `points`: a slice of [`Point`], representing the point cloud.
///
/// # Returns
/// A [`Point`], representing the point cloud centroid.
/// Returns Point::default() if point cloud is empty.
#[inline]
#[cfg_attr(
    feature = "tracing",
    tracing::instrument("Calculate Mean Point", skip_all)
)]
pub fn calculate_point_cloud_center<T, const N: usize>(points: &[Point<T, N>]) -> Point<T, N>
where
    T: RealField + Copy,
    usize: AsPrimitive<T>,
{
    if points.is_empty() {
        return Point::default();
    }

    points
        .iter()
        .fold(Point::<T, N>::default(), |acc, it| {
            Point::from(acc.coords + it.coords)
        })
        / points.len().as_()
}

/// Transform a point cloud, returning a transformed copy.
/// This function does not mutate the original point cloud.
///
/// # Arguments
/// * `source_points`: a slice of [`Point3`], representing the point cloud.
/// * `isometry_matrix`: the rigid transform to apply.
///
/// # Returns
/// A [`Vec`] of [`Point3`] containing the transformed point cloud.
#[inline]
#[cfg_attr(
    feature = "tracing",
    tracing::instrument("Transform Point Cloud", skip_all)
)]
pub fn transform_point_cloud<T: RealField + Copy>(
    source_points: &[Point3<T>],
    isometry_matrix: Isometry3<T>,
) -> Vec<Point3<T>> {
    source_points
        .iter()
        .map(|point| isometry_matrix.transform_point(point))
        .collect()
} // Just calls a different function a number of times, no specific test needed

/// Generates a randomized points cloud within the specified ranges.
///
/// # Arguments
/// * `num_points`: a [`usize`], specifying the amount of points to generate.
/// * `ranges`: a [`RangeInclusive`] per dimension, bounding the coordinates.
///
/// # Returns
/// A [`Vec`] of [`Point`] representing the point cloud.
#[cfg_attr(
    feature = "tracing",
    tracing::instrument("Generate Randomized Point Cloud", skip_all, level = "debug")
)]
pub fn generate_point_cloud<T, const N: usize>(
    num_points: usize,
    ranges: [RangeInclusive<T>; N],
) -> Vec<Point<T, N>>
where
    T: PartialOrd + rand::distributions::uniform::SampleUniform + nalgebra::Scalar,
{
    use rand::{Rng, SeedableRng};
    let mut rng = rand::rngs::SmallRng::seed_from_u64(3765665954583626552);

    (0..num_points)
        .map(|_| Point::from(std::array::from_fn(|idx| rng.gen_range(ranges[idx].clone()))))
        .collect()
} // Just calls a different function a number of times, no specific test needed

/// Extracts the rotation from the SVD factors of a cross-covariance matrix,
/// fixing up the reflection case so that the determinant is +1.
///
/// # Arguments
/// * `u`: the `U` factor of the decomposition.
/// * `v_t`: the `Vᵀ` factor of the decomposition.
///
/// # Returns
/// A proper rotation [`Matrix3`].
#[inline]
#[cfg_attr(
    feature = "tracing",
    tracing::instrument("Verify Rotation Matrix Determinant", skip_all, level = "debug")
)]
pub fn verify_rotation_matrix_determinant<T: RealField + Copy>(
    u: Matrix3<T>,
    v_t: Matrix3<T>,
) -> Matrix3<T> {
    let mut v = v_t.transpose();
    let rotation = v * u.transpose();
    if rotation.determinant() < T::zero() {
        v.column_mut(2).neg_mut();
        return v * u.transpose();
    }

    rotation
}

/// Returns the median of the passed values, sorting the slice in place.
/// For an even count the upper-middle element is returned.
///
/// # Returns
/// [`None`] if the slice is empty.
pub fn median<T: RealField + Copy>(values: &mut [T]) -> Option<T> {
    if values.is_empty() {
        return None;
    }

    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    Some(values[values.len() / 2])
}

/// Downsample a point cloud, combining all points within each voxel into their mean.
///
/// # Arguments
/// * `points`: a slice of [`Point3`], representing the point cloud.
/// * `voxel_size`: the cubic cell edge length; all points inside a cell collapse
///   to their centroid.
///
/// # Warnings
/// Point cloud order is *never* guaranteed.
#[cfg_attr(
    feature = "tracing",
    tracing::instrument("Downsample Point Cloud Using Voxels", skip_all)
)]
pub fn voxel_downsample_point_cloud<T>(points: &[Point3<T>], voxel_size: T) -> Vec<Point3<T>>
where
    T: RealField + Copy + AsPrimitive<isize>,
    usize: AsPrimitive<T>,
{
    let mut voxel_map: HashMap<[isize; 3], Vec<Point3<T>>> = HashMap::new();

    // Assign points to voxels
    for point in points {
        let voxel_coords: [isize; 3] =
            std::array::from_fn(|idx| (point[idx] / voxel_size).floor().as_());
        voxel_map.entry(voxel_coords).or_default().push(*point);
    }

    // Compute centroid for each voxel and collect them as the downsampled points
    voxel_map
        .into_values()
        .map(|points_in_voxel| {
            let num_points = points_in_voxel.len().as_();
            let sum = points_in_voxel
                .into_iter()
                .fold(Point3::default(), |acc, p| acc + p.coords);
            sum / num_points
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use nalgebra::{Point2, Point3, Vector3};

    use super::*;

    #[test]
    fn test_empty_point_cloud_center() {
        assert_eq!(calculate_point_cloud_center::<f32, 2>(&[]), Point2::origin());
    }

    #[test]
    fn test_calculate_point_cloud_center() {
        let point_cloud = [
            Point3::new(1.0, 2.0, 3.0),
            Point3::new(2.0, 3.0, 4.0),
            Point3::new(3.0, 4.0, 5.0),
            Point3::new(-2.0, -1.0, 0.0),
            Point3::new(-5.0, -2.0, -3.0),
            Point3::new(1.0, 0.0, 0.0),
        ];

        assert_eq!(
            calculate_point_cloud_center(point_cloud.as_slice()),
            Point3::new(0.0, 1.0, 1.5)
        );
    }

    #[test]
    fn test_verify_rotation_matrix_determinant() {
        let rotation = nalgebra::Rotation3::new(Vector3::new(0.2f64, -0.4, 0.8));
        let svd = rotation.matrix().svd(true, true);
        let recovered = verify_rotation_matrix_determinant(svd.u.unwrap(), svd.v_t.unwrap());

        assert!((recovered.determinant() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_median() {
        let mut values = [3.0f32, 1.0, 2.0];
        assert_eq!(median(&mut values), Some(2.0));

        let mut empty: [f32; 0] = [];
        assert_eq!(median(&mut empty), None);
    }

    #[test]
    fn test_downsample_point_cloud() {
        let point_cloud = [
            Point3::new(-5.9, -5.0, -3.9), // These two are very close now
            Point3::new(-6.0, -5.0, -4.0), // Will end up in the same voxel
            Point3::new(-1.0, -2.0, -3.0),
            Point3::new(0.0, 0.0, 0.0),    // These two are also very close
            Point3::new(0.05, 0.08, 0.01), // Will end up in the same voxel
            Point3::new(1.0, 2.0, 3.0),
            Point3::new(6.0, 5.0, 4.0),
        ];

        // We should be left with 5 voxels
        let res = voxel_downsample_point_cloud(point_cloud.as_slice(), 0.5);
        assert_eq!(res.len(), 5);

        // Moreover, the most negative voxel had two points, which should
        // collapse into their centroid.
        assert!(res
            .iter()
            .any(|element| *element == Point3::new(-5.95, -5.0, -3.95)));
    }
}
