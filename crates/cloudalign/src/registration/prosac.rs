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

use nalgebra::{Isometry3, RealField};
use num_traits::{AsPrimitive, Bounded};
use rand::{Rng, SeedableRng};

use crate::{
    correspondence::Correspondence,
    registration::{
        count_inliers, estimate_rigid_transform_svd, fitness_from_inliers, gather_pairs,
        is_sample_valid, ransac::validate_coarse_inputs, CoarseConfiguration, RegistrationResult,
        SAMPLE_SIZE,
    },
    types::{IsFinite, PointCloud, RegistrationError},
};

/// Configuration of the PROSAC estimator: the shared coarse parameters plus
/// the growth-schedule prior and the non-randomness threshold.
#[derive(Clone, Copy, Debug)]
pub struct ProsacConfiguration<T> {
    pub(crate) coarse: CoarseConfiguration<T>,
    pub(crate) initial_inlier_ratio: T,
    pub(crate) non_randomness_threshold: T,
}

impl<T: 'static + Copy> ProsacConfiguration<T>
where
    f64: AsPrimitive<T>,
{
    /// Returns a builder for the configuration struct.
    pub fn builder() -> ProsacConfigurationBuilder<T> {
        ProsacConfigurationBuilder {
            _internal: ProsacConfiguration {
                coarse: CoarseConfiguration::builder().build(),
                initial_inlier_ratio: 0.1.as_(),
                non_randomness_threshold: 0.05.as_(),
            },
        }
    }
}

/// A Builder-pattern struct for safely constructing a [`ProsacConfiguration`].
#[derive(Clone, Copy, Debug)]
pub struct ProsacConfigurationBuilder<T> {
    _internal: ProsacConfiguration<T>,
}

impl<T: Copy> ProsacConfigurationBuilder<T> {
    /// Replaces the shared coarse parameters.
    pub fn with_coarse(&self, coarse: CoarseConfiguration<T>) -> Self {
        Self {
            _internal: ProsacConfiguration {
                coarse,
                ..self._internal
            },
        }
    }

    /// The inlier-ratio prior that sizes `T_N`, the expected number of fully
    /// random samples the growth schedule is anchored to.
    pub fn with_initial_inlier_ratio(&self, initial_inlier_ratio: T) -> Self {
        Self {
            _internal: ProsacConfiguration {
                initial_inlier_ratio,
                ..self._internal
            },
        }
    }

    /// The tail probability below which an inlier count is accepted as
    /// non-random.
    pub fn with_non_randomness_threshold(&self, non_randomness_threshold: T) -> Self {
        Self {
            _internal: ProsacConfiguration {
                non_randomness_threshold,
                ..self._internal
            },
        }
    }

    /// Generates a [`ProsacConfiguration`] from the struct currently contained
    /// by the builder, leaving the builder intact for another use.
    pub fn build(&self) -> ProsacConfiguration<T> {
        self._internal
    }
}

/// Precomputes the PROSAC growth schedule `T_n`: by iteration `T_n` the
/// sampling pool should have grown to the top `n` correspondences.
///
/// `T_{n+1} − T_n` is evaluated in log space to keep the binomial
/// coefficients from overflowing; the first `m` entries are 1.
fn precompute_sampling_schedule<T>(
    num_correspondences: usize,
    initial_inlier_ratio: T,
) -> Vec<usize>
where
    T: RealField + Copy,
    usize: AsPrimitive<T>,
    T: AsPrimitive<usize>,
{
    let mut schedule = Vec::with_capacity(num_correspondences);

    let t_m: T = num_correspondences.as_()
        * (T::one() - initial_inlier_ratio).powi(SAMPLE_SIZE as i32);

    for _ in 0..SAMPLE_SIZE.min(num_correspondences) {
        schedule.push(1);
    }

    for n in (SAMPLE_SIZE + 1)..=num_correspondences {
        let log_numerator = <usize as AsPrimitive<T>>::as_(n - SAMPLE_SIZE).ln() + t_m.ln();

        // log C(n, m), accumulated termwise.
        let mut log_denominator = <usize as AsPrimitive<T>>::as_(SAMPLE_SIZE).ln();
        for i in 0..SAMPLE_SIZE {
            log_denominator += <usize as AsPrimitive<T>>::as_(n - i).ln()
                - <usize as AsPrimitive<T>>::as_(SAMPLE_SIZE - i).ln();
        }

        let increment = (log_numerator - log_denominator).exp();
        let previous = *schedule.last().expect("schedule is seeded");
        schedule.push(previous + <T as AsPrimitive<usize>>::as_(increment.ceil()).max(1));
    }

    schedule
}

/// Probability that an incorrect model is supported by an unrelated
/// correspondence purely by chance; the usual heuristic magnitude of the
/// PROSAC non-randomness argument.
const RANDOM_SUPPORT_PROBABILITY: f64 = 0.05;

/// The non-randomness criterion: could a purely random pool of size `n`
/// plausibly support the model with `inlier_count` correspondences?
///
/// The null model is binomial: each of the `n − m` non-sample correspondences
/// supports a wrong model with probability [`RANDOM_SUPPORT_PROBABILITY`].
/// The upper tail `P(support ≥ inlier_count)` is accumulated in log space and
/// compared against `threshold`.
fn check_non_randomness<T>(inlier_count: usize, n: usize, threshold: T) -> bool
where
    T: RealField + Copy,
    usize: AsPrimitive<T>,
    f64: AsPrimitive<T>,
{
    if inlier_count <= SAMPLE_SIZE || n <= SAMPLE_SIZE {
        return false;
    }

    let beta: T = RANDOM_SUPPORT_PROBABILITY.as_();
    let trials = n - SAMPLE_SIZE;
    let start = (inlier_count - SAMPLE_SIZE).min(trials);

    // log P(X = start) for X ~ B(trials, beta).
    let mut log_term = <usize as AsPrimitive<T>>::as_(trials - start) * (T::one() - beta).ln()
        + <usize as AsPrimitive<T>>::as_(start) * beta.ln();
    for i in 0..start {
        log_term += <usize as AsPrimitive<T>>::as_(trials - i).ln()
            - <usize as AsPrimitive<T>>::as_(i + 1).ln();
    }

    // Walk the upper tail; successive terms differ by a cheap ratio.
    let mut tail = log_term.exp();
    let mut term = tail;
    for j in start..trials {
        let ratio = <usize as AsPrimitive<T>>::as_(trials - j)
            / <usize as AsPrimitive<T>>::as_(j + 1)
            * beta
            / (T::one() - beta);
        term *= ratio;
        tail += term;
        if term < T::default_epsilon() * tail {
            break;
        }
    }

    tail < threshold
}

fn check_maximality<T>(inlier_count: usize, n: usize, t: usize, confidence: T) -> bool
where
    T: RealField + Copy,
    usize: AsPrimitive<T>,
{
    if n == 0 || inlier_count == 0 {
        return false;
    }

    let inlier_ratio: T = <usize as AsPrimitive<T>>::as_(inlier_count) / n.as_();
    let p_better = inlier_ratio.powi(SAMPLE_SIZE as i32);
    if p_better <= T::zero() {
        return true; // no better model can ever be sampled
    }
    if p_better >= T::one() {
        return true;
    }

    let k_max = (T::one() - confidence).ln() / (T::one() - p_better).ln();
    <usize as AsPrimitive<T>>::as_(t) >= k_max
}

/// PROSAC rigid registration: RANSAC's hypothesise-and-verify structure, with
/// samples drawn progressively from a quality-ordered prefix of the
/// correspondences.
///
/// The input must either already be sorted by ascending descriptor distance
/// (which [`crate::correspondence::generate_correspondences`] guarantees), or
/// be accompanied by `sorted_indices`, a permutation ranking it best-first.
///
/// On top of RANSAC's stopping rules, PROSAC stops once the best model is
/// *non-random* (the probability of its inlier count arising from a random
/// pool falls below the configured threshold) or *maximal* (the expected
/// effort to beat it exceeds the remaining budget).
///
/// # Returns
/// The best [`RegistrationResult`]; `converged` only when the inlier quota was
/// reached.
#[cfg_attr(
    feature = "tracing",
    tracing::instrument("PROSAC Registration", skip_all, level = "info")
)]
pub fn prosac_registration<T>(
    source: &PointCloud<T>,
    target: &PointCloud<T>,
    correspondences: &[Correspondence<T>],
    sorted_indices: Option<&[usize]>,
    config: &ProsacConfiguration<T>,
) -> Result<RegistrationResult<T>, RegistrationError>
where
    T: RealField + Copy + Bounded + IsFinite + Send + Sync,
    usize: AsPrimitive<T>,
    f64: AsPrimitive<T>,
    T: AsPrimitive<usize>,
{
    if config.initial_inlier_ratio <= T::zero() || config.initial_inlier_ratio >= T::one() {
        return Err(RegistrationError::ParameterError(
            "initial inlier ratio must lie in (0, 1)",
        ));
    }
    validate_coarse_inputs(source, target, correspondences, &config.coarse)?;

    if let Some(sorted_indices) = sorted_indices {
        if sorted_indices.len() != correspondences.len() {
            return Err(RegistrationError::InvalidInput(
                "sorted indices length does not match correspondences",
            ));
        }
    }

    let num_correspondences = correspondences.len();
    let ranked = |position: usize| -> Correspondence<T> {
        match sorted_indices {
            Some(order) => correspondences[order[position]],
            None => correspondences[position],
        }
    };

    let schedule =
        precompute_sampling_schedule::<T>(num_correspondences, config.initial_inlier_ratio);
    let mut rng = rand::rngs::SmallRng::seed_from_u64(config.coarse.random_seed);

    let mut pool_size = SAMPLE_SIZE; // n: current prefix of the quality ranking
    let mut t = 0usize;

    let mut best_transform = Isometry3::identity();
    let mut best_inliers: Vec<usize> = Vec::new();
    let mut result = RegistrationResult::unconverged();

    while t < config.coarse.max_iterations {
        if t >= schedule[pool_size - 1] && pool_size < num_correspondences {
            pool_size += 1;
        }

        // Progressive sampling: beyond T_n, the n-th ranked correspondence is
        // forced into the sample and the rest come from the top n-1.
        let mut sample = Vec::with_capacity(SAMPLE_SIZE);
        if t >= schedule[pool_size - 1] {
            sample.push(ranked(pool_size - 1));

            let mut indices: Vec<usize> = (0..pool_size - 1).collect();
            for slot in 0..(SAMPLE_SIZE - 1) {
                let chosen = rng.gen_range(slot..indices.len());
                indices.swap(slot, chosen);
                sample.push(ranked(indices[slot]));
            }
        } else {
            let mut indices: Vec<usize> = (0..pool_size).collect();
            for slot in 0..SAMPLE_SIZE {
                let chosen = rng.gen_range(slot..indices.len());
                indices.swap(slot, chosen);
                sample.push(ranked(indices[slot]));
            }
        }

        if !is_sample_valid(&source.points, &sample) {
            t += 1;
            continue;
        }

        let (sample_source, sample_target) = gather_pairs(&source.points, &target.points, &sample);
        let Ok(transform) = estimate_rigid_transform_svd(&sample_source, &sample_target) else {
            t += 1;
            continue;
        };

        let inliers = count_inliers(
            &source.points,
            &target.points,
            correspondences,
            &transform,
            config.coarse.inlier_threshold,
            config.coarse.parallel,
        );

        if inliers.len() > best_inliers.len() {
            best_transform = transform;
            best_inliers = inliers;

            log::debug!(
                "PROSAC iteration {t}: better model with {} inliers (n={pool_size})",
                best_inliers.len()
            );

            let inlier_ratio: T = best_inliers.len().as_() / num_correspondences.as_();
            if inlier_ratio >= config.coarse.early_stop_ratio {
                t += 1;
                break;
            }

            if check_non_randomness(
                best_inliers.len(),
                pool_size,
                config.non_randomness_threshold,
            ) {
                log::debug!("PROSAC non-randomness criterion satisfied at iteration {t}");
                t += 1;
                break;
            }
        }

        if best_inliers.len() >= config.coarse.min_inliers
            && check_maximality(best_inliers.len(), pool_size, t, config.coarse.confidence)
        {
            log::debug!("PROSAC maximality criterion satisfied at iteration {t}");
            t += 1;
            break;
        }

        t += 1;
    }

    result.num_iterations = t;

    if config.coarse.refine_result && best_inliers.len() > SAMPLE_SIZE {
        let refinement_sample = best_inliers
            .iter()
            .map(|&idx| correspondences[idx])
            .collect::<Vec<_>>();
        let (refined_source, refined_target) =
            gather_pairs(&source.points, &target.points, &refinement_sample);

        if let Ok(refined) = estimate_rigid_transform_svd(&refined_source, &refined_target) {
            best_transform = refined;
            best_inliers = count_inliers(
                &source.points,
                &target.points,
                correspondences,
                &best_transform,
                config.coarse.inlier_threshold,
                config.coarse.parallel,
            );
        }
    }

    result.converged = best_inliers.len() >= config.coarse.min_inliers;
    result.fitness_score = fitness_from_inliers(
        &source.points,
        &target.points,
        correspondences,
        &best_inliers,
        &best_transform,
        config.coarse.inlier_threshold,
    );
    result.transform = best_transform;
    result.inliers = best_inliers;

    Ok(result)
}

#[cfg(test)]
mod tests {
    use crate::registration::{ransac_registration, test_utils::noisy_scene};

    use super::*;

    #[test]
    fn test_schedule_is_monotonic() {
        let schedule = precompute_sampling_schedule::<f64>(500, 0.1);
        assert_eq!(schedule.len(), 500);
        assert!(schedule[..SAMPLE_SIZE].iter().all(|&t| t == 1));
        assert!(schedule.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_non_randomness_triggers_on_large_counts() {
        // 3 of 1000 is pure chance; 400 of 1000 cannot be.
        assert!(!check_non_randomness(3, 1000, 0.05f64));
        assert!(check_non_randomness(400, 1000, 0.05f64));

        // Around the binomial mean the tail stays heavy.
        assert!(!check_non_randomness(50, 1000, 0.05f64));
    }

    #[test]
    fn test_prosac_converges_on_quality_sorted_scene() {
        let scene = noisy_scene(700, true);
        let config = ProsacConfiguration::builder()
            .with_coarse(
                CoarseConfiguration::builder()
                    .with_max_iterations(1000)
                    .with_inlier_threshold(0.05)
                    .with_min_inliers(100)
                    .with_random_seed(11)
                    .build(),
            )
            .build();

        let result = prosac_registration(
            &scene.source,
            &scene.target,
            &scene.correspondences,
            None,
            &config,
        )
        .unwrap();

        assert!(result.converged);
        assert!(result.inliers.len() >= 600);
        let drift =
            (result.transform.to_homogeneous() - scene.ground_truth.to_homogeneous()).norm();
        assert!(drift < 0.05, "transform drifted by {drift}");
    }

    #[test]
    fn test_prosac_beats_ransac_on_sorted_correspondences() {
        let scene = noisy_scene(700, true);
        let coarse = CoarseConfiguration::builder()
            .with_max_iterations(1000)
            .with_inlier_threshold(0.05)
            .with_min_inliers(100)
            .with_random_seed(99)
            .build();

        let ransac_result = ransac_registration(
            &scene.source,
            &scene.target,
            &scene.correspondences,
            &coarse,
        )
        .unwrap();
        let prosac_result = prosac_registration(
            &scene.source,
            &scene.target,
            &scene.correspondences,
            None,
            &ProsacConfiguration::builder().with_coarse(coarse).build(),
        )
        .unwrap();

        assert!(ransac_result.converged);
        assert!(prosac_result.converged);
        assert!(
            prosac_result.num_iterations < ransac_result.num_iterations,
            "PROSAC took {} iterations, RANSAC {}",
            prosac_result.num_iterations,
            ransac_result.num_iterations
        );
    }

    #[test]
    fn test_prosac_is_deterministic_for_a_fixed_seed() {
        let scene = noisy_scene(500, true);
        let config = ProsacConfiguration::builder()
            .with_coarse(
                CoarseConfiguration::builder()
                    .with_max_iterations(400)
                    .with_inlier_threshold(0.05)
                    .with_random_seed(5)
                    .build(),
            )
            .build();

        let first = prosac_registration(
            &scene.source,
            &scene.target,
            &scene.correspondences,
            None,
            &config,
        )
        .unwrap();
        let second = prosac_registration(
            &scene.source,
            &scene.target,
            &scene.correspondences,
            None,
            &config,
        )
        .unwrap();

        assert_eq!(first.transform, second.transform);
        assert_eq!(first.inliers, second.inliers);
        assert_eq!(first.num_iterations, second.num_iterations);
    }

    #[test]
    fn test_prosac_rejects_mismatched_permutation() {
        let scene = noisy_scene(500, true);
        let bad_permutation = vec![0usize; 3];

        assert!(matches!(
            prosac_registration(
                &scene.source,
                &scene.target,
                &scene.correspondences,
                Some(&bad_permutation),
                &ProsacConfiguration::builder().build(),
            ),
            Err(RegistrationError::InvalidInput(_))
        ));
    }
}
