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

#![deny(missing_docs)]
#![deny(rustdoc::missing_crate_level_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(rustdoc::private_intra_doc_links)]

//! A collection of 3D point cloud registration algorithms,
//! covering the full coarse-to-fine pipeline:
//! spatial indices, normal estimation, local descriptors (FPFH/PFH/SHOT),
//! descriptor correspondences, robust coarse estimators
//! (RANSAC/PROSAC/4PCS/Super4PCS), and fine refinement
//! (ICP variants, GICP, AA-ICP, NDT).

#[doc = "Order-preserving helpers for fanning work out to the global thread pool."]
pub mod concurrent;

#[doc = "Descriptor-space correspondence generation with ratio test and mutual verification."]
pub mod correspondence;

#[doc = "Local geometric descriptor extractors: FPFH, PFH and SHOT."]
pub mod descriptors;

#[doc = "Distance metrics, both element-wise and point-cloud-level, including the LCP fitness."]
pub mod metrics;

#[doc = "PCA-based surface normal estimation."]
pub mod normals;

#[doc = "Coarse and fine rigid registration estimators."]
pub mod registration;

#[doc = "Spatial indices: a k-d tree, a brute-force oracle, and a pair-extraction voxel grid."]
pub mod spatial;

#[doc = "Common and interfacing structs and types."]
pub mod types;

#[doc = "Various utility functions that are commonly used by these algorithms."]
pub mod utils;
