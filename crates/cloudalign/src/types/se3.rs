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

use nalgebra::{Isometry3, Matrix3, RealField, Translation3, UnitQuaternion, Vector3, Vector6};

/// Builds the skew-symmetric cross-product matrix `[v]×` of a 3-vector.
#[inline]
pub fn skew_symmetric<T: RealField + Copy>(v: &Vector3<T>) -> Matrix3<T> {
    Matrix3::new(
        T::zero(),
        -v.z,
        v.y,
        v.z,
        T::zero(),
        -v.x,
        -v.y,
        v.x,
        T::zero(),
    )
}

/// Maps a twist `(t, ω)` to a rigid transform, with the translation applied
/// verbatim and the rotation being the exponential of the axis-angle `ω`.
///
/// # Arguments
/// * `twist`: a [`Vector6`], the first three components being the translation
///   and the last three the axis-angle rotation.
///
/// # Returns
/// The corresponding [`Isometry3`].
#[inline]
pub fn twist_to_isometry<T: RealField + Copy>(twist: &Vector6<T>) -> Isometry3<T> {
    let translation = Translation3::new(twist[0], twist[1], twist[2]);
    let rotation = UnitQuaternion::from_scaled_axis(Vector3::new(twist[3], twist[4], twist[5]));
    Isometry3::from_parts(translation, rotation)
}

/// Maps a rigid transform back to its twist `(t, ω)` representation,
/// the inverse of [`twist_to_isometry`].
#[inline]
pub fn isometry_to_twist<T: RealField + Copy>(isometry: &Isometry3<T>) -> Vector6<T> {
    let translation = isometry.translation.vector;
    let omega = isometry.rotation.scaled_axis();

    Vector6::new(
        translation.x,
        translation.y,
        translation.z,
        omega.x,
        omega.y,
        omega.z,
    )
}

/// Frobenius norm of the difference between the homogeneous forms of two
/// transforms; the convergence measure used by the fine registration loops.
#[inline]
pub fn transform_delta_norm<T: RealField + Copy>(a: &Isometry3<T>, b: &Isometry3<T>) -> T {
    (a.to_homogeneous() - b.to_homogeneous()).norm()
}

#[cfg(test)]
mod tests {
    use nalgebra::Vector6;

    use super::*;

    #[test]
    fn test_skew_symmetric_matches_cross_product() {
        let a = Vector3::new(0.3f64, -1.2, 2.0);
        let b = Vector3::new(1.0, 0.5, -0.7);

        assert!((skew_symmetric(&a) * b - a.cross(&b)).norm() < 1e-12);
    }

    #[test]
    fn test_twist_round_trip() {
        let twist = Vector6::new(0.5f64, -0.3, 0.2, 0.1, -0.05, 0.21);
        let recovered = isometry_to_twist(&twist_to_isometry(&twist));

        assert!((twist - recovered).norm() < 1e-12);
    }

    #[test]
    fn test_zero_twist_is_identity() {
        let isom = twist_to_isometry(&Vector6::<f32>::zeros());
        assert!(transform_delta_norm(&isom, &Isometry3::identity()) < 1e-6);
    }

    #[test]
    fn test_transform_delta_norm_is_zero_for_equal() {
        let isom = twist_to_isometry(&Vector6::new(1.0f64, 2.0, 3.0, 0.3, 0.2, 0.1));
        assert!(transform_delta_norm(&isom, &isom) < 1e-12);
    }
}
