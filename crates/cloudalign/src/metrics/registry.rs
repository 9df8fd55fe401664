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

use nalgebra::RealField;
use num_traits::{AsPrimitive, Bounded};

use crate::{
    metrics::{
        AngularMetric, BhattacharyyaMetric, ChiSquaredMetric, CorrelationMetric, CosineMetric,
        HellingerMetric, HistogramIntersectionMetric, L1Metric, L2Metric, LInfMetric, Metric,
    },
    types::RegistrationError,
};

/// A name-keyed collection of runtime-dispatched metrics.
///
/// Compile-time call sites should hold the concrete metric types directly;
/// the registry exists for configuration-driven lookups and for user-supplied
/// function metrics registered next to the built-ins.
pub struct MetricRegistry<T> {
    metrics: HashMap<String, Box<dyn Metric<T>>>,
}

impl<T> MetricRegistry<T>
where
    T: RealField + Copy + Bounded,
    usize: AsPrimitive<T>,
{
    /// Creates a registry pre-seeded with every built-in metric under its
    /// canonical name, plus the `euclidean` alias for `l2`.
    pub fn with_builtins() -> Self {
        let mut registry = Self {
            metrics: HashMap::new(),
        };

        registry.register("l1", L1Metric);
        registry.register("l2", L2Metric);
        registry.register("euclidean", L2Metric);
        registry.register("linf", LInfMetric);
        registry.register("chi_squared", ChiSquaredMetric);
        registry.register("histogram_intersection", HistogramIntersectionMetric);
        registry.register("bhattacharyya", BhattacharyyaMetric);
        registry.register("hellinger", HellingerMetric);
        registry.register("cosine", CosineMetric);
        registry.register("angular", AngularMetric);
        registry.register("correlation", CorrelationMetric);

        registry
    }

    /// Registers `metric` under `name`, replacing any previous entry.
    pub fn register<M: Metric<T> + 'static>(&mut self, name: &str, metric: M) {
        self.metrics.insert(name.to_owned(), Box::new(metric));
    }

    /// Looks a metric up by name.
    ///
    /// # Returns
    /// [`RegistrationError::ParameterError`] for an unknown name.
    pub fn get(&self, name: &str) -> Result<&dyn Metric<T>, RegistrationError> {
        self.metrics
            .get(name)
            .map(AsRef::as_ref)
            .ok_or(RegistrationError::ParameterError("unknown metric name"))
    }

    /// Returns the registered names, sorted for reproducible listings.
    pub fn available(&self) -> Vec<&str> {
        let mut names = self.metrics.keys().map(String::as_str).collect::<Vec<_>>();
        names.sort_unstable();
        names
    }
}

impl<T> Default for MetricRegistry<T>
where
    T: RealField + Copy + Bounded,
    usize: AsPrimitive<T>,
{
    fn default() -> Self {
        Self::with_builtins()
    }
}

#[cfg(test)]
mod tests {
    use crate::metrics::FnMetric;

    use super::*;

    #[test]
    fn test_builtins_are_available() {
        let registry = MetricRegistry::<f32>::with_builtins();

        for name in [
            "l1",
            "l2",
            "euclidean",
            "linf",
            "chi_squared",
            "histogram_intersection",
            "bhattacharyya",
            "hellinger",
            "cosine",
            "angular",
            "correlation",
        ] {
            assert!(registry.get(name).is_ok(), "missing builtin {name}");
        }
    }

    #[test]
    fn test_euclidean_alias_matches_l2() {
        let registry = MetricRegistry::<f64>::with_builtins();
        let a = [1.0, 2.0, 2.0];
        let b = [0.0, 0.0, 0.0];

        let l2 = registry.get("l2").unwrap().distance(&a, &b);
        let euclidean = registry.get("euclidean").unwrap().distance(&a, &b);
        assert_eq!(l2, euclidean);
        assert!((l2 - 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_unknown_metric_is_a_parameter_error() {
        let registry = MetricRegistry::<f32>::with_builtins();
        assert_eq!(
            registry.get("does_not_exist").err(),
            Some(RegistrationError::ParameterError("unknown metric name"))
        );
    }

    #[test]
    fn test_user_registered_metric() {
        let mut registry = MetricRegistry::<f64>::with_builtins();
        registry.register(
            "scaled_l1",
            FnMetric::new(|a: &[f64], b: &[f64]| {
                a.iter()
                    .zip(b.iter())
                    .map(|(x, y)| (x - y).abs() * 0.5)
                    .sum()
            }),
        );

        let distance = registry
            .get("scaled_l1")
            .unwrap()
            .distance(&[2.0, 2.0], &[0.0, 0.0]);
        assert!((distance - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_available_is_sorted() {
        let registry = MetricRegistry::<f32>::with_builtins();
        let names = registry.available();
        let mut sorted = names.clone();
        sorted.sort_unstable();
        assert_eq!(names, sorted);
    }
}
