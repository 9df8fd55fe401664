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

use std::marker::PhantomData;

use nalgebra::RealField;
use num_traits::AsPrimitive;

use crate::metrics::Metric;

#[inline]
fn zip_fold<T: RealField + Copy>(a: &[T], b: &[T], mut func: impl FnMut(T, T, T) -> T) -> T {
    debug_assert_eq!(a.len(), b.len(), "metric buffers must have equal length");
    a.iter()
        .zip(b.iter())
        .fold(T::zero(), |acc, (&x, &y)| func(acc, x, y))
}

/// Manhattan distance, `Σ|aᵢ − bᵢ|`.
#[derive(Clone, Copy, Debug, Default)]
pub struct L1Metric;

impl<T: RealField + Copy> Metric<T> for L1Metric {
    fn distance(&self, a: &[T], b: &[T]) -> T {
        zip_fold(a, b, |acc, x, y| acc + (x - y).abs())
    }

    fn has_triangle_inequality(&self) -> bool {
        true
    }
}

/// Euclidean distance, `√Σ(aᵢ − bᵢ)²`; the default descriptor signature
/// distance and the hot inner loop of correspondence generation.
#[derive(Clone, Copy, Debug, Default)]
pub struct L2Metric;

impl<T: RealField + Copy> Metric<T> for L2Metric {
    fn distance(&self, a: &[T], b: &[T]) -> T {
        self.squared_distance(a, b).sqrt()
    }

    fn squared_distance(&self, a: &[T], b: &[T]) -> T {
        zip_fold(a, b, |acc, x, y| {
            let diff = x - y;
            acc + diff * diff
        })
    }

    fn has_triangle_inequality(&self) -> bool {
        true
    }
}

/// Chebyshev distance, `max|aᵢ − bᵢ|`.
#[derive(Clone, Copy, Debug, Default)]
pub struct LInfMetric;

impl<T: RealField + Copy> Metric<T> for LInfMetric {
    fn distance(&self, a: &[T], b: &[T]) -> T {
        zip_fold(a, b, |acc, x, y| acc.max((x - y).abs()))
    }

    fn has_triangle_inequality(&self) -> bool {
        true
    }
}

/// Chi-squared histogram distance, `Σ(aᵢ − bᵢ)²/(aᵢ + bᵢ)`, empty bins skipped.
#[derive(Clone, Copy, Debug, Default)]
pub struct ChiSquaredMetric;

impl<T: RealField + Copy> Metric<T> for ChiSquaredMetric {
    fn distance(&self, a: &[T], b: &[T]) -> T {
        zip_fold(a, b, |acc, x, y| {
            let sum = x + y;
            if sum > T::zero() {
                let diff = x - y;
                acc + diff * diff / sum
            } else {
                acc
            }
        })
    }
}

/// Histogram intersection distance, `1 − Σ min(aᵢ, bᵢ)`, intended for
/// normalised histograms.
#[derive(Clone, Copy, Debug, Default)]
pub struct HistogramIntersectionMetric;

impl<T: RealField + Copy> Metric<T> for HistogramIntersectionMetric {
    fn distance(&self, a: &[T], b: &[T]) -> T {
        T::one() - zip_fold(a, b, |acc, x, y| acc + x.min(y))
    }
}

#[inline]
fn bhattacharyya_coefficient<T: RealField + Copy>(a: &[T], b: &[T]) -> T {
    zip_fold(a, b, |acc, x, y| acc + (x * y).max(T::zero()).sqrt())
}

/// Bhattacharyya distance, `−ln Σ√(aᵢ·bᵢ)`.
#[derive(Clone, Copy, Debug, Default)]
pub struct BhattacharyyaMetric;

impl<T: RealField + Copy + num_traits::Bounded> Metric<T> for BhattacharyyaMetric {
    fn distance(&self, a: &[T], b: &[T]) -> T {
        let coefficient = bhattacharyya_coefficient(a, b);
        if coefficient <= T::zero() {
            return <T as num_traits::Bounded>::max_value();
        }

        -coefficient.ln()
    }
}

/// Hellinger distance, `√(1 − Σ√(aᵢ·bᵢ))`, clamped at zero.
#[derive(Clone, Copy, Debug, Default)]
pub struct HellingerMetric;

impl<T: RealField + Copy> Metric<T> for HellingerMetric {
    fn distance(&self, a: &[T], b: &[T]) -> T {
        (T::one() - bhattacharyya_coefficient(a, b)).max(T::zero()).sqrt()
    }

    fn has_triangle_inequality(&self) -> bool {
        true
    }
}

#[inline]
fn cosine_similarity<T: RealField + Copy>(a: &[T], b: &[T]) -> T {
    let dot = zip_fold(a, b, |acc, x, y| acc + x * y);
    let norm_a = zip_fold(a, a, |acc, x, y| acc + x * y).sqrt();
    let norm_b = zip_fold(b, b, |acc, x, y| acc + x * y).sqrt();

    if norm_a <= T::zero() || norm_b <= T::zero() {
        return T::zero();
    }

    (dot / (norm_a * norm_b)).max(-T::one()).min(T::one())
}

/// Cosine distance, `1 − cos(a, b)`.
#[derive(Clone, Copy, Debug, Default)]
pub struct CosineMetric;

impl<T: RealField + Copy> Metric<T> for CosineMetric {
    fn distance(&self, a: &[T], b: &[T]) -> T {
        T::one() - cosine_similarity(a, b)
    }
}

/// Angular distance, `acos(cos(a, b))` in radians.
#[derive(Clone, Copy, Debug, Default)]
pub struct AngularMetric;

impl<T: RealField + Copy> Metric<T> for AngularMetric {
    fn distance(&self, a: &[T], b: &[T]) -> T {
        cosine_similarity(a, b).acos()
    }

    fn has_triangle_inequality(&self) -> bool {
        true
    }
}

/// Correlation distance, `1 − r(a, b)` with `r` the Pearson correlation.
#[derive(Clone, Copy, Debug, Default)]
pub struct CorrelationMetric;

impl<T: RealField + Copy> Metric<T> for CorrelationMetric
where
    usize: AsPrimitive<T>,
{
    fn distance(&self, a: &[T], b: &[T]) -> T {
        if a.is_empty() {
            return T::zero();
        }

        let inverse_len = T::one() / a.len().as_();
        let mean_a = a.iter().fold(T::zero(), |acc, &x| acc + x) * inverse_len;
        let mean_b = b.iter().fold(T::zero(), |acc, &x| acc + x) * inverse_len;

        let mut covariance = T::zero();
        let mut variance_a = T::zero();
        let mut variance_b = T::zero();
        for (&x, &y) in a.iter().zip(b.iter()) {
            let dx = x - mean_a;
            let dy = y - mean_b;
            covariance += dx * dy;
            variance_a += dx * dx;
            variance_b += dy * dy;
        }

        if variance_a <= T::zero() || variance_b <= T::zero() {
            return T::one();
        }

        T::one() - covariance / (variance_a.sqrt() * variance_b.sqrt())
    }
}

/// A user-supplied metric built from a function object, registrable in the
/// [`MetricRegistry`](crate::metrics::MetricRegistry) next to the built-ins.
pub struct FnMetric<T, F> {
    func: F,
    symmetric: bool,
    triangle_inequality: bool,
    _scalar: PhantomData<T>,
}

impl<T, F: Fn(&[T], &[T]) -> T> FnMetric<T, F> {
    /// Wraps `func` as a metric; properties default to symmetric without a
    /// triangle-inequality guarantee.
    pub fn new(func: F) -> Self {
        Self {
            func,
            symmetric: true,
            triangle_inequality: false,
            _scalar: PhantomData,
        }
    }

    /// Declares whether the wrapped function is symmetric.
    pub fn with_symmetry(mut self, symmetric: bool) -> Self {
        self.symmetric = symmetric;
        self
    }

    /// Declares whether the wrapped function honours the triangle inequality.
    pub fn with_triangle_inequality(mut self, triangle_inequality: bool) -> Self {
        self.triangle_inequality = triangle_inequality;
        self
    }
}

impl<T, F> Metric<T> for FnMetric<T, F>
where
    T: RealField + Copy,
    F: Fn(&[T], &[T]) -> T + Send + Sync,
{
    fn distance(&self, a: &[T], b: &[T]) -> T {
        (self.func)(a, b)
    }

    fn is_symmetric(&self) -> bool {
        self.symmetric
    }

    fn has_triangle_inequality(&self) -> bool {
        self.triangle_inequality
    }
}
