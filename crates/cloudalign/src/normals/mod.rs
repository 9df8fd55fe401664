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

use crate::{concurrent, spatial::KdTree};

/// How a point's neighbourhood is gathered.
#[derive(Clone, Copy, Debug)]
pub enum SearchScope<T> {
    /// The `k` nearest neighbours.
    Knn(usize),
    /// Every neighbour within the given radius.
    Radius(T),
}

/// Estimates a unit surface normal for every point by PCA over its local
/// neighbourhood: the eigenvector of the smallest eigenvalue of the centred
/// covariance.
///
/// Signs are disambiguated toward `viewpoint` (defaulting to the origin of the
/// cloud's coordinate frame); when that product is ambiguous the normal is
/// oriented deterministically along its own leading non-zero component.
///
/// A point whose neighbourhood has fewer than 3 members, or whose covariance
/// is rank-deficient, receives the zero vector; downstream consumers treat a
/// zero normal as invalid.
///
/// # Arguments
/// * `points`: the cloud, also the set the tree was built over.
/// * `tree`: a spatial index over `points`.
/// * `scope`: neighbourhood selection, k-NN or radius.
/// * `viewpoint`: optional orientation reference.
/// * `parallel`: whether to fan out across points; there are no shared writes.
#[cfg_attr(
    feature = "tracing",
    tracing::instrument("Estimate Normals Using PCA", skip_all, level = "info")
)]
pub fn estimate_normals<T>(
    points: &[Point3<T>],
    tree: &KdTree<T, 3>,
    scope: SearchScope<T>,
    viewpoint: Option<Point3<T>>,
    parallel: bool,
) -> Vec<Vector3<T>>
where
    T: RealField + Copy + Send + Sync,
    usize: AsPrimitive<T>,
    f64: AsPrimitive<T>,
{
    concurrent::map_indexed(parallel, points.len(), |point_idx| {
        let neighbours = match scope {
            SearchScope::Knn(k) => tree.kneighbors(&points[point_idx], k),
            SearchScope::Radius(radius) => tree.radius_neighbors(&points[point_idx], radius),
        };

        estimate_single_normal(points, &points[point_idx], &neighbours, viewpoint)
    })
}

fn estimate_single_normal<T>(
    points: &[Point3<T>],
    query: &Point3<T>,
    neighbours: &[crate::spatial::Neighbour<T>],
    viewpoint: Option<Point3<T>>,
) -> Vector3<T>
where
    T: RealField + Copy,
    usize: AsPrimitive<T>,
    f64: AsPrimitive<T>,
{
    if neighbours.len() < 3 {
        return Vector3::zeros();
    }

    let count: T = neighbours.len().as_();
    let centroid = neighbours
        .iter()
        .fold(Vector3::zeros(), |acc: Vector3<T>, n| {
            acc + points[n.index].coords
        })
        / count;

    let covariance = neighbours
        .iter()
        .fold(Matrix3::zeros(), |acc: Matrix3<T>, n| {
            let diff = points[n.index].coords - centroid;
            acc + diff * diff.transpose()
        })
        / count;

    let eigen = covariance.symmetric_eigen();

    // The eigensolver does not order its eigenvalues.
    let mut smallest = 0;
    let mut largest = 0;
    for i in 1..3 {
        if eigen.eigenvalues[i] < eigen.eigenvalues[smallest] {
            smallest = i;
        }
        if eigen.eigenvalues[i] > eigen.eigenvalues[largest] {
            largest = i;
        }
    }

    // Rank-deficient neighbourhoods (collinear or coincident points) have no
    // well-defined surface normal.
    let rank_tolerance: T = 1e-9.as_();
    let spread = eigen.eigenvalues[largest];
    if spread <= T::zero() {
        return Vector3::zeros();
    }
    let significant = (0..3)
        .filter(|&i| eigen.eigenvalues[i] > spread * rank_tolerance)
        .count();
    if significant < 2 {
        return Vector3::zeros();
    }

    let mut normal: Vector3<T> = eigen.eigenvectors.column(smallest).into_owned();
    if normal.normalize_mut() <= T::zero() {
        return Vector3::zeros();
    }

    match viewpoint {
        Some(viewpoint) => {
            if (viewpoint - query).dot(&normal) < T::zero() {
                normal = -normal;
            }
        }
        None => {
            // No viewpoint; orient along the leading non-zero component so
            // repeated runs agree.
            let leading = if normal.z != T::zero() {
                normal.z
            } else if normal.y != T::zero() {
                normal.y
            } else {
                normal.x
            };
            if leading < T::zero() {
                normal = -normal;
            }
        }
    }

    normal
}
