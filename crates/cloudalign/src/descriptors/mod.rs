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

use std::borrow::Cow;

use nalgebra::{Point, Point3, RealField, Vector3};
use num_traits::AsPrimitive;

use crate::{
    normals::{estimate_normals, SearchScope},
    spatial::{KdTree, Neighbour},
    types::{PointCloud, RegistrationError},
};

pub use fpfh::extract_fpfh;
pub use pfh::extract_pfh;
pub use shot::{compute_local_reference_frame, extract_shot, LocalReferenceFrame};

mod fpfh;
pub(crate) mod pair_features;
mod pfh;
mod shot;

/// A 33-bin Fast Point Feature Histogram signature.
pub type FpfhSignature<T> = Point<T, 33>;

/// A 125-bin Point Feature Histogram signature.
pub type PfhSignature<T> = Point<T, 125>;

/// A 352-bin SHOT signature.
pub type ShotSignature<T> = Point<T, 352>;

/// The parameters shared by every descriptor extractor.
#[derive(Clone, Copy, Debug)]
pub struct DescriptorParams<T> {
    /// Radius of the support neighbourhood around each keypoint.
    pub search_radius: T,
    /// Hard cap on the number of neighbours considered per point.
    pub max_neighbours: usize,
    /// Whether the extraction fans out to the thread pool.
    pub parallel: bool,
}

impl<T: RealField + Copy> DescriptorParams<T> {
    /// Creates parameters with the given support radius, a 64-neighbour cap,
    /// and parallel extraction enabled.
    pub fn new(search_radius: T) -> Self {
        Self {
            search_radius,
            max_neighbours: 64,
            parallel: true,
        }
    }

    /// Overrides the neighbour cap.
    pub fn with_max_neighbours(mut self, max_neighbours: usize) -> Self {
        self.max_neighbours = max_neighbours;
        self
    }

    /// Overrides the parallel flag.
    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }
}

/// The distance between two descriptor signatures, the hot inner loop of
/// correspondence generation. L2 over the fixed histogram length, which the
/// compiler can unroll and vectorise.
#[inline]
pub fn signature_distance<T: RealField + Copy, const D: usize>(
    a: &Point<T, D>,
    b: &Point<T, D>,
) -> T {
    (a - b).norm()
}

/// Scales a histogram to unit L2 length; an all-zero histogram (empty
/// neighbourhood) stays all-zero.
pub(crate) fn normalize_signature<T: RealField + Copy, const D: usize>(
    signature: &mut Point<T, D>,
) {
    let norm = signature.coords.norm();
    if norm > T::zero() {
        signature.coords /= norm;
    }
}

pub(crate) fn validate_descriptor_inputs<T: RealField + Copy>(
    cloud: &PointCloud<T>,
    keypoint_indices: &[usize],
    params: &DescriptorParams<T>,
) -> Result<(), RegistrationError> {
    if params.search_radius <= T::zero() {
        return Err(RegistrationError::ParameterError(
            "search radius must be positive",
        ));
    }

    if cloud.is_empty() {
        return Err(RegistrationError::InvalidInput(
            "descriptor extraction requires a non-empty cloud",
        ));
    }

    if keypoint_indices.iter().any(|&idx| idx >= cloud.len()) {
        return Err(RegistrationError::InvalidInput(
            "keypoint index out of bounds",
        ));
    }

    Ok(())
}

/// Resolves the normals an extractor should use: explicitly supplied ones win,
/// then the cloud's own, and FPFH/PFH fall back to estimating their own the
/// way the PCA estimator does.
pub(crate) fn resolve_normals<'a, T>(
    cloud: &'a PointCloud<T>,
    tree: &KdTree<T, 3>,
    params: &DescriptorParams<T>,
    supplied: Option<&'a [Vector3<T>]>,
) -> Result<Cow<'a, [Vector3<T>]>, RegistrationError>
where
    T: RealField + Copy + Send + Sync,
    usize: AsPrimitive<T>,
    f64: AsPrimitive<T>,
{
    if let Some(normals) = supplied {
        if normals.len() != cloud.len() {
            return Err(RegistrationError::InvalidInput(
                "supplied normals length does not match cloud length",
            ));
        }
        return Ok(Cow::Borrowed(normals));
    }

    if !cloud.normals.is_empty() {
        if cloud.normals.len() != cloud.len() {
            return Err(RegistrationError::InvalidInput(
                "cloud normals length does not match points length",
            ));
        }
        return Ok(Cow::Borrowed(cloud.normals.as_slice()));
    }

    Ok(Cow::Owned(estimate_normals(
        &cloud.points,
        tree,
        SearchScope::Radius(params.search_radius),
        Some(Point3::origin()),
        params.parallel,
    )))
}

/// Radius neighbourhood of `point`, capped at `max_neighbours`; the cap keeps
/// dense regions from dominating the runtime.
pub(crate) fn capped_radius_neighbours<T: RealField + Copy>(
    tree: &KdTree<T, 3>,
    point: &Point3<T>,
    params: &DescriptorParams<T>,
) -> Vec<Neighbour<T>> {
    let mut neighbours = tree.radius_neighbors(point, params.search_radius);
    neighbours.truncate(params.max_neighbours);
    neighbours
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_distance_zero_for_identical() {
        let signature = FpfhSignature::<f32>::from([0.25; 33]);
        assert_eq!(signature_distance(&signature, &signature), 0.0);
    }

    #[test]
    fn test_signature_distance_symmetry() {
        let mut a = FpfhSignature::<f64>::origin();
        let mut b = FpfhSignature::<f64>::origin();
        a.coords[0] = 1.0;
        b.coords[1] = 1.0;

        assert_eq!(signature_distance(&a, &b), signature_distance(&b, &a));
    }

    #[test]
    fn test_normalize_signature() {
        let mut signature = PfhSignature::<f32>::origin();
        signature.coords[3] = 3.0;
        signature.coords[10] = 4.0;

        normalize_signature(&mut signature);
        assert!((signature.coords.norm() - 1.0).abs() < 1e-6);

        let mut zero = PfhSignature::<f32>::origin();
        normalize_signature(&mut zero);
        assert_eq!(zero.coords.norm(), 0.0);
    }

    #[test]
    fn test_validate_rejects_bad_radius() {
        let cloud = PointCloud::from_points(vec![Point3::new(0.0f32, 0.0, 0.0)]);
        let params = DescriptorParams::new(0.0);

        assert_eq!(
            validate_descriptor_inputs(&cloud, &[0], &params),
            Err(RegistrationError::ParameterError(
                "search radius must be positive"
            ))
        );
    }
}
