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

pub use point_cloud::{chamfer_distance, hausdorff_distance, lcp_score, lcp_score_with_tree};
pub use registry::MetricRegistry;
pub use vector::{
    AngularMetric, BhattacharyyaMetric, ChiSquaredMetric, CorrelationMetric, CosineMetric,
    FnMetric, HellingerMetric, HistogramIntersectionMetric, L1Metric, L2Metric, LInfMetric,
};

mod point_cloud;
mod registry;
mod vector;

/// A distance function over raw coordinate buffers, with its mathematical
/// properties declared as boolean traits.
///
/// Hot inner loops should be monomorphised over a concrete metric type; the
/// [`MetricRegistry`] offers the same metrics behind runtime dispatch for
/// configuration-driven call sites.
pub trait Metric<T>: Send + Sync {
    /// Computes the distance between two equal-length buffers.
    fn distance(&self, a: &[T], b: &[T]) -> T;

    /// Computes the squared distance; overridden where the square can be
    /// produced cheaper than `distance(a, b)²`.
    fn squared_distance(&self, a: &[T], b: &[T]) -> T
    where
        T: nalgebra::RealField + Copy,
    {
        let distance = self.distance(a, b);
        distance * distance
    }

    /// Whether `distance(a, b) == distance(b, a)` for all inputs.
    fn is_symmetric(&self) -> bool {
        true
    }

    /// Whether the triangle inequality holds (to floating point tolerance).
    fn has_triangle_inequality(&self) -> bool {
        false
    }
}
