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

use nalgebra::{Point3, RealField, Vector3};
use num_traits::AsPrimitive;

/// Computes the three Darboux-frame angular features `(α, φ, θ)` of a point
/// pair, the shared kernel of PFH and FPFH.
///
/// The frame is anchored at `p1`/`n1`: `u = n1`, `v = d̂ × u`, `w = u × v`,
/// with `d̂` the normalised baseline. When the baseline is (anti)parallel to
/// the normal, an arbitrary but deterministic perpendicular is substituted.
pub(crate) fn pair_features<T>(
    p1: &Point3<T>,
    n1: &Vector3<T>,
    p2: &Point3<T>,
    n2: &Vector3<T>,
) -> (T, T, T)
where
    T: RealField + Copy,
    f64: AsPrimitive<T>,
{
    let epsilon: T = 1e-6.as_();

    let mut baseline = p2 - p1;
    if baseline.normalize_mut() <= T::zero() {
        return (T::zero(), T::zero(), T::zero());
    }

    let u = *n1;
    let mut v = baseline.cross(&u);
    if v.normalize_mut() < epsilon {
        // Baseline aligned with the normal; pick a deterministic perpendicular.
        let fallback_axis = if u.x.abs() < 0.9.as_() {
            Vector3::x()
        } else {
            Vector3::y()
        };
        v = fallback_axis.cross(&u);
        v.normalize_mut();
    }
    let w = u.cross(&v);

    let alpha = v.dot(n2);
    let phi = u.dot(&baseline);
    let theta = w.dot(n2).atan2(u.dot(n2));

    (alpha, phi, theta)
}

/// Maps `value` into one of `num_bins` equal subdivisions of `[min, max]`,
/// clamping out-of-range input; the top endpoint collapses into the last bin.
pub(crate) fn bin_index<T>(value: T, min: T, max: T, num_bins: usize) -> usize
where
    T: RealField + Copy,
    usize: AsPrimitive<T>,
    T: AsPrimitive<usize>,
{
    let clamped = value.max(min).min(max);
    let normalized = (clamped - min) / (max - min);
    let bin: usize = (normalized * num_bins.as_()).floor().as_();
    bin.min(num_bins - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bin_index_clamps_and_collapses_top() {
        assert_eq!(bin_index(-2.0f32, -1.0, 1.0, 11), 0);
        assert_eq!(bin_index(2.0f32, -1.0, 1.0, 11), 10);
        assert_eq!(bin_index(1.0f32, -1.0, 1.0, 11), 10);
        assert_eq!(bin_index(-1.0f32, -1.0, 1.0, 11), 0);
        assert_eq!(bin_index(0.0f32, -1.0, 1.0, 11), 5);
    }

    #[test]
    fn test_pair_features_are_bounded() {
        let p1 = Point3::new(0.0f64, 0.0, 0.0);
        let p2 = Point3::new(1.0, 0.3, -0.2);
        let n1 = Vector3::new(0.0, 0.0, 1.0);
        let n2 = Vector3::new(0.3, 0.1, 0.9).normalize();

        let (alpha, phi, theta) = pair_features(&p1, &n1, &p2, &n2);
        assert!(alpha.abs() <= 1.0 + 1e-12);
        assert!(phi.abs() <= 1.0 + 1e-12);
        assert!(theta.abs() <= core::f64::consts::PI + 1e-12);
    }

    #[test]
    fn test_pair_features_handle_aligned_baseline() {
        // Baseline parallel to n1 would make v degenerate without the fallback.
        let p1 = Point3::new(0.0f64, 0.0, 0.0);
        let p2 = Point3::new(0.0, 0.0, 1.0);
        let n1 = Vector3::z();
        let n2 = Vector3::z();

        let (alpha, phi, _) = pair_features(&p1, &n1, &p2, &n2);
        assert!(alpha.is_finite() && phi.is_finite());
        assert!((phi - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_coincident_points_yield_zero_features() {
        let p = Point3::new(0.5f32, 0.5, 0.5);
        let n = Vector3::z();
        assert_eq!(pair_features(&p, &n, &p, &n), (0.0, 0.0, 0.0));
    }
}
