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

use rayon::prelude::*;

/// Maps every index in `0..len` through `func`, fanning out to the global
/// thread pool when `parallel` is set.
///
/// The output vector is indexed by input position regardless of how the work
/// was scheduled, so callers observe the same ordering either way. The pool
/// itself is rayon's process-wide pool, lazily initialised to the hardware
/// concurrency; the calling thread blocks until the whole batch is done.
pub fn map_indexed<R, F>(parallel: bool, len: usize, func: F) -> Vec<R>
where
    R: Send,
    F: Fn(usize) -> R + Sync + Send,
{
    if parallel {
        (0..len).into_par_iter().map(func).collect()
    } else {
        (0..len).map(func).collect()
    }
}

/// Collects, in input order, every index in `0..len` for which `predicate`
/// holds. The predicate evaluations fan out; the collection does not.
pub fn filter_indices<F>(parallel: bool, len: usize, predicate: F) -> Vec<usize>
where
    F: Fn(usize) -> bool + Sync,
{
    map_indexed(parallel, len, &predicate)
        .into_iter()
        .enumerate()
        .filter_map(|(idx, keep)| keep.then_some(idx))
        .collect()
}
