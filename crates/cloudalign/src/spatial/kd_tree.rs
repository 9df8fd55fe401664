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
use std::collections::BinaryHeap;

use nalgebra::{Point, RealField};

use crate::{spatial::Neighbour, utils::distance_squared};

/// Number of points below which a subtree is stored as a flat leaf.
const LEAF_SIZE: usize = 16;

#[derive(Clone, Debug)]
enum KdNode<T> {
    Split {
        axis: usize,
        value: T,
        left: usize,
        right: usize,
    },
    Leaf {
        start: usize,
        end: usize,
    },
}

/// A max-heap entry ordered by `(distance, index)`, so the root is always the
/// worst of the k best candidates seen so far.
struct HeapEntry<T> {
    distance_squared: T,
    index: usize,
}

impl<T: PartialOrd> PartialEq for HeapEntry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<T: PartialOrd> Eq for HeapEntry<T> {}

impl<T: PartialOrd> PartialOrd for HeapEntry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: PartialOrd> Ord for HeapEntry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Distances are finite; validated inputs contain no NaN.
        self.distance_squared
            .partial_cmp(&other.distance_squared)
            .unwrap_or(Ordering::Equal)
            .then(self.index.cmp(&other.index))
    }
}

/// An axis-aligned BSP over a borrowed point slice, with median splits and
/// flat leaves of up to [`LEAF_SIZE`] points.
///
/// The tree holds an immutable borrow of the cloud it was built on; rebuild it
/// if the cloud changes. Queries take `&self` only and are safe to issue from
/// any number of threads concurrently.
///
/// # Generics
/// * `T`: Either an [`f32`] or [`f64`].
/// * `N`: A const usize specifying how many dimensions each point has;
///   descriptor spaces simply use a larger `N`.
#[derive(Clone, Debug)]
pub struct KdTree<'a, T: RealField + Copy, const N: usize> {
    points: &'a [Point<T, N>],
    indices: Vec<usize>,
    nodes: Vec<KdNode<T>>,
    root: usize,
}

impl<'a, T: RealField + Copy, const N: usize> KdTree<'a, T, N> {
    /// Builds the tree over the passed points.
    /// An empty slice yields an empty index whose queries return empty sets.
    #[cfg_attr(
        feature = "tracing",
        tracing::instrument("Build KD Tree", skip_all, level = "info")
    )]
    pub fn new(points: &'a [Point<T, N>]) -> Self {
        let mut tree = Self {
            points,
            indices: (0..points.len()).collect(),
            nodes: Vec::new(),
            root: 0,
        };

        if !points.is_empty() {
            tree.root = tree.build_recursive(0, points.len(), 0);
        }

        tree
    }

    /// Returns the number of indexed points.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Returns whether the tree indexes no points.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    fn build_recursive(&mut self, start: usize, end: usize, depth: usize) -> usize {
        if end - start <= LEAF_SIZE {
            self.nodes.push(KdNode::Leaf { start, end });
            return self.nodes.len() - 1;
        }

        let axis = depth % N;
        let mid = (start + end) / 2;

        let points = self.points;
        self.indices[start..end].select_nth_unstable_by(mid - start, |&a, &b| {
            points[a].coords[axis]
                .partial_cmp(&points[b].coords[axis])
                .unwrap_or(Ordering::Equal)
        });
        let value = points[self.indices[mid]].coords[axis];

        let node_id = self.nodes.len();
        self.nodes.push(KdNode::Leaf { start, end }); // placeholder until children exist

        let left = self.build_recursive(start, mid, depth + 1);
        let right = self.build_recursive(mid, end, depth + 1);
        self.nodes[node_id] = KdNode::Split {
            axis,
            value,
            left,
            right,
        };

        node_id
    }

    /// Finds the `k` nearest neighbours of `query`, in non-decreasing
    /// `(distance, index)` order. If `k` exceeds the number of indexed points,
    /// all of them are returned.
    #[cfg_attr(
        feature = "tracing",
        tracing::instrument("KD Tree K Nearest Neighbours", skip_all, level = "trace")
    )]
    pub fn kneighbors(&self, query: &Point<T, N>, k: usize) -> Vec<Neighbour<T>> {
        if self.points.is_empty() || k == 0 {
            return Vec::new();
        }

        let mut heap = BinaryHeap::with_capacity(k + 1);
        self.knn_recursive(self.root, query, k, &mut heap);

        let mut neighbours = heap
            .into_iter()
            .map(|entry| Neighbour {
                index: entry.index,
                distance: entry.distance_squared.sqrt(),
            })
            .collect::<Vec<_>>();
        neighbours.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(Ordering::Equal)
                .then(a.index.cmp(&b.index))
        });

        neighbours
    }

    fn knn_recursive(
        &self,
        node_id: usize,
        query: &Point<T, N>,
        k: usize,
        heap: &mut BinaryHeap<HeapEntry<T>>,
    ) {
        match self.nodes[node_id] {
            KdNode::Leaf { start, end } => {
                for &point_idx in &self.indices[start..end] {
                    let candidate = HeapEntry {
                        distance_squared: distance_squared(query, &self.points[point_idx]),
                        index: point_idx,
                    };

                    if heap.len() < k {
                        heap.push(candidate);
                    } else if candidate
                        .cmp(heap.peek().expect("heap is non-empty at capacity"))
                        .is_lt()
                    {
                        heap.pop();
                        heap.push(candidate);
                    }
                }
            }
            KdNode::Split {
                axis,
                value,
                left,
                right,
            } => {
                let axis_distance = query.coords[axis] - value;
                let (near, far) = if axis_distance < T::zero() {
                    (left, right)
                } else {
                    (right, left)
                };

                self.knn_recursive(near, query, k, heap);

                // The far side can only contribute if the splitting plane is
                // closer than the current worst candidate (or the heap is short).
                let plane_distance = axis_distance * axis_distance;
                let worst = heap.peek().map(|entry| entry.distance_squared);
                if heap.len() < k || worst.is_some_and(|worst| plane_distance <= worst) {
                    self.knn_recursive(far, query, k, heap);
                }
            }
        }
    }

    /// Finds every indexed point within `radius` of `query`, in non-decreasing
    /// `(distance, index)` order. Only nodes whose region intersects the query
    /// ball are traversed.
    #[cfg_attr(
        feature = "tracing",
        tracing::instrument("KD Tree Radius Neighbours", skip_all, level = "trace")
    )]
    pub fn radius_neighbors(&self, query: &Point<T, N>, radius: T) -> Vec<Neighbour<T>> {
        if self.points.is_empty() || radius < T::zero() {
            return Vec::new();
        }

        let mut matches = Vec::new();
        self.radius_recursive(self.root, query, radius * radius, &mut matches);

        matches.sort_by(|a: &Neighbour<T>, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(Ordering::Equal)
                .then(a.index.cmp(&b.index))
        });

        matches
    }

    fn radius_recursive(
        &self,
        node_id: usize,
        query: &Point<T, N>,
        radius_squared: T,
        matches: &mut Vec<Neighbour<T>>,
    ) {
        match self.nodes[node_id] {
            KdNode::Leaf { start, end } => {
                for &point_idx in &self.indices[start..end] {
                    let dist_squared = distance_squared(query, &self.points[point_idx]);
                    if dist_squared <= radius_squared {
                        matches.push(Neighbour {
                            index: point_idx,
                            distance: dist_squared.sqrt(),
                        });
                    }
                }
            }
            KdNode::Split {
                axis,
                value,
                left,
                right,
            } => {
                let axis_distance = query.coords[axis] - value;
                let (near, far) = if axis_distance < T::zero() {
                    (left, right)
                } else {
                    (right, left)
                };

                self.radius_recursive(near, query, radius_squared, matches);
                if axis_distance * axis_distance <= radius_squared {
                    self.radius_recursive(far, query, radius_squared, matches);
                }
            }
        }
    }
}
