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

use nalgebra::{Isometry3, Point3, RealField, Vector3};

use crate::types::{IsFinite, RegistrationError};

/// An owned 3D point cloud with optional per-point normals and colours.
///
/// The `normals` and `colors` sequences are either empty (absent) or exactly
/// as long as `points`; [`PointCloud::validate`] enforces this. Every stage of
/// the registration pipeline takes clouds by shared reference and produces
/// freshly owned outputs, so a cloud is never aliased mutably.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PointCloud<T: RealField> {
    /// Point coordinates.
    pub points: Vec<Point3<T>>,
    /// Per-point unit normals; empty when not computed.
    pub normals: Vec<Vector3<T>>,
    /// Per-point colours; empty when not present.
    pub colors: Vec<Vector3<T>>,
    /// A single scalar intensity for the whole cloud.
    pub intensity: T,
}

impl<T: RealField + Copy> PointCloud<T> {
    /// Creates an empty point cloud.
    pub fn new() -> Self {
        Self {
            points: Vec::new(),
            normals: Vec::new(),
            colors: Vec::new(),
            intensity: T::zero(),
        }
    }

    /// Creates a cloud from bare points, without normals or colours.
    pub fn from_points(points: Vec<Point3<T>>) -> Self {
        Self {
            points,
            ..Self::new()
        }
    }

    /// Returns the number of points in the cloud.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Returns whether the cloud contains no points.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Clears all sequences, leaving the intensity untouched.
    pub fn clear(&mut self) {
        self.points.clear();
        self.normals.clear();
        self.colors.clear();
    }

    /// Reserves capacity for at least `additional` more points in every
    /// sequence that is currently in use.
    pub fn reserve(&mut self, additional: usize) {
        self.points.reserve(additional);
        if !self.normals.is_empty() {
            self.normals.reserve(additional);
        }
        if !self.colors.is_empty() {
            self.colors.reserve(additional);
        }
    }

    /// Appends a single point.
    /// If normals or colours are present their lengths will no longer match,
    /// which [`PointCloud::validate`] will report; push to those sequences as well.
    pub fn push(&mut self, point: Point3<T>) {
        self.points.push(point);
    }

    /// Appends all points (and any parallel sequences) of `other` to `self`.
    #[cfg_attr(
        feature = "tracing",
        tracing::instrument("Merge Point Clouds", skip_all, level = "debug")
    )]
    pub fn merge(&mut self, other: &Self) {
        self.points.extend_from_slice(&other.points);
        self.normals.extend_from_slice(&other.normals);
        self.colors.extend_from_slice(&other.colors);
    }

    /// Returns a copy of this cloud with every point (and normal) rigidly
    /// transformed by `isometry`.
    #[cfg_attr(
        feature = "tracing",
        tracing::instrument("Transform Point Cloud", skip_all, level = "debug")
    )]
    pub fn transformed(&self, isometry: &Isometry3<T>) -> Self {
        Self {
            points: self
                .points
                .iter()
                .map(|point| isometry.transform_point(point))
                .collect(),
            normals: self
                .normals
                .iter()
                .map(|normal| isometry.rotation.transform_vector(normal))
                .collect(),
            colors: self.colors.clone(),
            intensity: self.intensity,
        }
    }
}

impl<T: RealField + Copy + IsFinite> PointCloud<T> {
    /// Checks the structural invariants of the cloud.
    ///
    /// # Returns
    /// [`RegistrationError::InvalidInput`] when a parallel sequence has a
    /// mismatched length, or when any coordinate is NaN or infinite.
    pub fn validate(&self) -> Result<(), RegistrationError> {
        if !self.normals.is_empty() && self.normals.len() != self.points.len() {
            return Err(RegistrationError::InvalidInput(
                "normals length does not match points length",
            ));
        }

        if !self.colors.is_empty() && self.colors.len() != self.points.len() {
            return Err(RegistrationError::InvalidInput(
                "colors length does not match points length",
            ));
        }

        if self
            .points
            .iter()
            .any(|point| point.coords.iter().any(|coord| !coord.is_finite()))
        {
            return Err(RegistrationError::InvalidInput(
                "point coordinates must be finite",
            ));
        }

        Ok(())
    }
}

impl<T: RealField + Copy> Extend<Point3<T>> for PointCloud<T> {
    fn extend<I: IntoIterator<Item = Point3<T>>>(&mut self, iter: I) {
        self.points.extend(iter);
    }
}

impl<T: RealField + Copy> FromIterator<Point3<T>> for PointCloud<T> {
    fn from_iter<I: IntoIterator<Item = Point3<T>>>(iter: I) -> Self {
        Self::from_points(iter.into_iter().collect())
    }
}

impl<T: RealField + Copy> From<Vec<Point3<T>>> for PointCloud<T> {
    fn from(points: Vec<Point3<T>>) -> Self {
        Self::from_points(points)
    }
}

#[cfg(test)]
mod tests {
    use nalgebra::{Isometry3, Point3, Vector3};

    use super::*;

    #[test]
    fn test_push_and_len() {
        let mut cloud = PointCloud::<f32>::new();
        assert!(cloud.is_empty());

        cloud.push(Point3::new(1.0, 2.0, 3.0));
        cloud.push(Point3::new(-1.0, 0.5, 0.0));
        assert_eq!(cloud.len(), 2);
        assert!(!cloud.is_empty());

        cloud.clear();
        assert!(cloud.is_empty());
    }

    #[test]
    fn test_merge() {
        let mut cloud_a = PointCloud::from_points(vec![Point3::new(0.0f32, 0.0, 0.0)]);
        let cloud_b = PointCloud::from_points(vec![
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(0.0, 1.0, 0.0),
        ]);

        cloud_a.merge(&cloud_b);
        assert_eq!(cloud_a.len(), 3);
        assert_eq!(cloud_a.points[2], Point3::new(0.0, 1.0, 0.0));
    }

    #[test]
    fn test_validate_normals_mismatch() {
        let mut cloud = PointCloud::from_points(vec![
            Point3::new(0.0f32, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
        ]);
        cloud.normals.push(Vector3::z());

        assert_eq!(
            cloud.validate(),
            Err(RegistrationError::InvalidInput(
                "normals length does not match points length"
            ))
        );
    }

    #[test]
    fn test_validate_non_finite() {
        let cloud = PointCloud::from_points(vec![Point3::new(0.0f32, f32::NAN, 0.0)]);
        assert!(cloud.validate().is_err());

        let cloud = PointCloud::from_points(vec![Point3::new(0.0f32, f32::INFINITY, 0.0)]);
        assert!(cloud.validate().is_err());
    }

    #[test]
    fn test_transformed_moves_points_and_rotates_normals() {
        let mut cloud = PointCloud::from_points(vec![Point3::new(1.0f64, 0.0, 0.0)]);
        cloud.normals.push(Vector3::x());

        let isom = Isometry3::new(
            Vector3::new(0.0, 0.0, 1.0),
            Vector3::new(0.0, 0.0, core::f64::consts::FRAC_PI_2),
        );
        let transformed = cloud.transformed(&isom);

        assert!((transformed.points[0] - Point3::new(0.0, 1.0, 1.0)).norm() < 1e-12);
        // Normals only rotate, they never translate.
        assert!((transformed.normals[0] - Vector3::y()).norm() < 1e-12);
    }
}
