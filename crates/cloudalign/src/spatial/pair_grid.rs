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

use std::collections::HashMap;

use nalgebra::{Point3, RealField};
use num_traits::AsPrimitive;
use rand::{seq::SliceRandom, SeedableRng};

use crate::utils::{distance_squared, median};

/// An unordered pair of indexed points together with their distance;
/// the unit Super4PCS works in when it hunts for congruent diagonals.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PointPair<T> {
    /// Cloud index of the first member.
    pub first: usize,
    /// Cloud index of the second member.
    pub second: usize,
    /// Euclidean distance between the two members.
    pub distance: T,
}

/// A uniform voxel hash over a subset of a cloud, answering "all point pairs
/// whose distance lies in `[d - ε, d + ε]`" in time proportional to the output
/// instead of `O(n²)`.
///
/// Every indexed point belongs to exactly one cell. The grid is built once per
/// alignment and never mutated during search.
#[derive(Clone, Debug)]
pub struct PairGrid<'a, T: RealField + Copy> {
    points: &'a [Point3<T>],
    cell_size: T,
    min_bound: Point3<T>,
    cells: HashMap<[isize; 3], Vec<usize>>,
}

impl<'a, T> PairGrid<'a, T>
where
    T: RealField + Copy + AsPrimitive<isize>,
{
    /// Builds the grid over `member_indices` of `points` with the given cell
    /// edge length.
    ///
    /// # Panics
    /// Does not panic; an empty member set yields a grid whose queries return
    /// nothing.
    #[cfg_attr(
        feature = "tracing",
        tracing::instrument("Build Pair Grid", skip_all, level = "debug")
    )]
    pub fn new(points: &'a [Point3<T>], member_indices: &[usize], cell_size: T) -> Self {
        let mut min_bound = Point3::from([T::max_value().unwrap_or_else(T::one); 3]);
        for &idx in member_indices {
            let point = &points[idx];
            for dim in 0..3 {
                if point[dim] < min_bound[dim] {
                    min_bound[dim] = point[dim];
                }
            }
        }

        // Pad the lower bound so border points never land on a cell seam.
        for dim in 0..3 {
            min_bound[dim] -= cell_size;
        }

        let mut cells: HashMap<[isize; 3], Vec<usize>> = HashMap::new();
        for &idx in member_indices {
            cells
                .entry(Self::grid_key(&points[idx], &min_bound, cell_size))
                .or_default()
                .push(idx);
        }

        Self {
            points,
            cell_size,
            min_bound,
            cells,
        }
    }

    fn grid_key(point: &Point3<T>, min_bound: &Point3<T>, cell_size: T) -> [isize; 3] {
        std::array::from_fn(|dim| ((point[dim] - min_bound[dim]) / cell_size).floor().as_())
    }

    /// Number of occupied cells.
    pub fn occupied_cells(&self) -> usize {
        self.cells.len()
    }

    /// Extracts up to `max_pairs` point pairs whose distance lies within
    /// `[distance - epsilon, distance + epsilon]`.
    ///
    /// Cells are visited in sorted key order and each unordered pair is
    /// produced exactly once, so the result is deterministic.
    #[cfg_attr(
        feature = "tracing",
        tracing::instrument("Extract Pairs In Distance Band", skip_all, level = "debug")
    )]
    pub fn pairs_in_range(&self, distance: T, epsilon: T, max_pairs: usize) -> Vec<PointPair<T>> {
        let mut pairs = Vec::new();
        if self.cells.is_empty() || max_pairs == 0 {
            return pairs;
        }

        let min_dist = (distance - epsilon).max(T::zero());
        let max_dist = distance + epsilon;
        let min_dist_squared = min_dist * min_dist;
        let max_dist_squared = max_dist * max_dist;

        let search_radius: isize = (max_dist / self.cell_size).ceil().as_();

        let mut keys = self.cells.keys().copied().collect::<Vec<_>>();
        keys.sort_unstable();

        for center_key in keys {
            let center_cell = &self.cells[&center_key];

            for dx in -search_radius..=search_radius {
                for dy in -search_radius..=search_radius {
                    for dz in -search_radius..=search_radius {
                        let neighbour_key = [
                            center_key[0] + dx,
                            center_key[1] + dy,
                            center_key[2] + dz,
                        ];

                        // Visit each unordered cell pair once.
                        if neighbour_key < center_key {
                            continue;
                        }

                        let Some(neighbour_cell) = self.cells.get(&neighbour_key) else {
                            continue;
                        };

                        let same_cell = neighbour_key == center_key;
                        for (pos, &first) in center_cell.iter().enumerate() {
                            let start = if same_cell { pos + 1 } else { 0 };
                            for &second in &neighbour_cell[start..] {
                                let dist_squared =
                                    distance_squared(&self.points[first], &self.points[second]);

                                if dist_squared >= min_dist_squared
                                    && dist_squared <= max_dist_squared
                                {
                                    pairs.push(PointPair {
                                        first,
                                        second,
                                        distance: dist_squared.sqrt(),
                                    });

                                    if pairs.len() >= max_pairs {
                                        return pairs;
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }

        pairs
    }
}

/// Picks a grid cell size adapted to the sampling density: five times the
/// median nearest-neighbour distance of a random subset of the members.
///
/// # Arguments
/// * `fallback`: returned when the members cannot support a density estimate
///   (fewer than two points).
#[cfg_attr(
    feature = "tracing",
    tracing::instrument("Adaptive Pair Grid Resolution", skip_all, level = "debug")
)]
pub fn adaptive_cell_size<T>(
    points: &[Point3<T>],
    member_indices: &[usize],
    random_seed: u64,
    fallback: T,
) -> T
where
    T: RealField + Copy,
    f64: AsPrimitive<T>,
{
    const DENSITY_SAMPLES: usize = 100;

    if member_indices.len() < 2 {
        return fallback;
    }

    let mut rng = rand::rngs::SmallRng::seed_from_u64(random_seed);
    let mut shuffled = member_indices.to_vec();
    shuffled.shuffle(&mut rng);
    shuffled.truncate(DENSITY_SAMPLES.min(member_indices.len()));

    let mut nearest_distances = shuffled
        .iter()
        .map(|&idx| {
            shuffled
                .iter()
                .filter(|&&other| other != idx)
                .map(|&other| distance_squared(&points[idx], &points[other]))
                .fold(T::max_value().unwrap_or_else(T::one), |acc, d| acc.min(d))
                .sqrt()
        })
        .collect::<Vec<_>>();

    match median(&mut nearest_distances) {
        Some(median_distance) if median_distance > T::zero() => median_distance * 5.0.as_(),
        _ => fallback,
    }
}
