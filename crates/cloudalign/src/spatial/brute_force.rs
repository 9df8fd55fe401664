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

use std::cmp::Ordering;

use nalgebra::{Point, RealField};

use crate::{concurrent, metrics::Metric, spatial::Neighbour, utils::distance_squared};

/// The always-correct, always-slow neighbour search: computes the distance to
/// every indexed point. Used when `n` is small, when the metric is not
/// Euclidean, and as the oracle the k-d tree is tested against.
#[derive(Clone, Debug)]
pub struct BruteForce<'a, T: RealField + Copy, const N: usize> {
    points: &'a [Point<T, N>],
}

impl<'a, T: RealField + Copy, const N: usize> BruteForce<'a, T, N> {
    /// Creates the search structure; nothing is precomputed.
    pub fn new(points: &'a [Point<T, N>]) -> Self {
        Self { points }
    }

    /// Returns the number of indexed points.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Returns whether no points are indexed.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    fn sorted(mut neighbours: Vec<Neighbour<T>>) -> Vec<Neighbour<T>> {
        neighbours.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(Ordering::Equal)
                .then(a.index.cmp(&b.index))
        });
        neighbours
    }

    /// Finds the `k` nearest neighbours of `query` under the Euclidean metric,
    /// in non-decreasing `(distance, index)` order.
    #[cfg_attr(
        feature = "tracing",
        tracing::instrument("Brute Force K Nearest Neighbours", skip_all, level = "trace")
    )]
    pub fn kneighbors(&self, query: &Point<T, N>, k: usize) -> Vec<Neighbour<T>> {
        let mut all = Self::sorted(
            self.points
                .iter()
                .enumerate()
                .map(|(index, point)| Neighbour {
                    index,
                    distance: distance_squared(query, point).sqrt(),
                })
                .collect(),
        );
        all.truncate(k);
        all
    }

    /// Finds the `k` nearest neighbours of `query` under an arbitrary metric
    /// over the raw coordinate buffers (the descriptor-space entry point).
    pub fn kneighbors_with<M: Metric<T>>(
        &self,
        metric: &M,
        query: &Point<T, N>,
        k: usize,
    ) -> Vec<Neighbour<T>> {
        let mut all = Self::sorted(
            self.points
                .iter()
                .enumerate()
                .map(|(index, point)| Neighbour {
                    index,
                    distance: metric.distance(query.coords.as_slice(), point.coords.as_slice()),
                })
                .collect(),
        );
        all.truncate(k);
        all
    }

    /// Finds every indexed point within `radius` of `query`, in non-decreasing
    /// `(distance, index)` order.
    #[cfg_attr(
        feature = "tracing",
        tracing::instrument("Brute Force Radius Neighbours", skip_all, level = "trace")
    )]
    pub fn radius_neighbors(&self, query: &Point<T, N>, radius: T) -> Vec<Neighbour<T>> {
        let radius_squared = radius * radius;

        Self::sorted(
            self.points
                .iter()
                .enumerate()
                .filter_map(|(index, point)| {
                    let dist_squared = distance_squared(query, point);
                    (dist_squared <= radius_squared).then(|| Neighbour {
                        index,
                        distance: dist_squared.sqrt(),
                    })
                })
                .collect(),
        )
    }

    /// Answers a whole batch of k-NN queries, optionally fanning the batch out
    /// to the thread pool. Output order matches the query order.
    pub fn kneighbors_batch(
        &self,
        parallel: bool,
        queries: &[Point<T, N>],
        k: usize,
    ) -> Vec<Vec<Neighbour<T>>>
    where
        T: Send + Sync,
    {
        concurrent::map_indexed(parallel, queries.len(), |query_idx| {
            self.kneighbors(&queries[query_idx], k)
        })
    }
}
