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

pub use is_finite::IsFinite;
pub use point_cloud::PointCloud;

mod is_finite;
mod point_cloud;

#[doc = "Conversions between SE(3) twist vectors and isometries."]
pub mod se3;

/// The error kinds shared by every public operation in this crate.
///
/// Note that an estimator which completes but cannot reach its inlier quota
/// is *not* an error; it returns its best-so-far result with the converged
/// flag cleared, so the caller can choose to accept or retry.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RegistrationError {
    /// An empty cloud where points are required, mismatched parallel sequence
    /// lengths, or non-finite coordinates.
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
    /// A component requiring normals received a cloud without them.
    #[error("missing normals: {0}")]
    MissingNormals(&'static str),
    /// Fewer inputs than the sampling minimum of the estimator.
    #[error("insufficient samples: required {required}, got {actual}")]
    InsufficientSamples {
        /// The sampling minimum of the estimator.
        required: usize,
        /// The number of inputs actually provided.
        actual: usize,
    },
    /// A collinear sample, rank-deficient covariance, or failed rotation
    /// orthogonality check.
    #[error("degenerate configuration: {0}")]
    DegenerateConfiguration(&'static str),
    /// An SVD/eigen solver reported no convergence, or a line search collapsed.
    #[error("numeric failure: {0}")]
    NumericFailure(&'static str),
    /// A parameter outside its documented domain.
    #[error("invalid parameter: {0}")]
    ParameterError(&'static str),
}
