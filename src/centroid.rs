//! Spherical centroids with visit-duration histograms.
//!
//! Positions are kept as unit vectors on a spherical earth. Averaging two
//! centroids is a duration-weighted sum of their vectors, projected back
//! onto the sphere, which stays well-behaved across the antimeridian where
//! plain lat/lng averaging does not.

use serde::{Deserialize, Serialize};

use crate::labels::{decayed, Histogram};
use crate::{PlaceId, PositionSample};

/// Spherical earth radius used for all distances, in meters.
pub const EARTH_RADIUS_METERS: f64 = 6_378_100.0;

/// A 3D vector, unit length when it represents a position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UnitVector {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl UnitVector {
    /// Unit vector for a position: `(cosλ cosφ, sinλ cosφ, sinφ)`.
    pub fn from_degrees(latitude: f64, longitude: f64) -> Self {
        let (lat, lng) = (latitude.to_radians(), longitude.to_radians());
        Self {
            x: lng.cos() * lat.cos(),
            y: lng.sin() * lat.cos(),
            z: lat.sin(),
        }
    }

    pub fn dot(&self, other: &UnitVector) -> f64 {
        self.x * other.x + self.y * other.y + self.z * other.z
    }

    pub fn norm(&self) -> f64 {
        self.dot(self).sqrt()
    }

    pub fn scaled(&self, factor: f64) -> Self {
        Self {
            x: self.x * factor,
            y: self.y * factor,
            z: self.z * factor,
        }
    }

    pub fn add(&self, other: &UnitVector) -> Self {
        Self {
            x: self.x + other.x,
            y: self.y + other.y,
            z: self.z + other.z,
        }
    }

    /// Project back onto the unit sphere.
    ///
    /// Returns `None` for a (near) zero vector, which has no direction.
    pub fn normalized(&self) -> Option<Self> {
        let norm = self.norm();
        if !norm.is_finite() || norm < f64::EPSILON {
            return None;
        }
        Some(self.scaled(1.0 / norm))
    }

    /// Great-circle distance to another unit vector, in meters.
    pub fn distance_to(&self, other: &UnitVector) -> f64 {
        // Round-off can push the dot product of nearly identical vectors past 1.
        self.dot(other).min(1.0).acos() * EARTH_RADIUS_METERS
    }
}

impl From<&PositionSample> for UnitVector {
    fn from(sample: &PositionSample) -> Self {
        UnitVector::from_degrees(sample.latitude, sample.longitude)
    }
}

/// A place candidate: center on the unit sphere plus how long was spent there.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoCentroid {
    center: UnitVector,
    /// Accumulated visit seconds
    duration: u64,
    histogram: Histogram,
    /// Set once this centroid has been promoted to a named place
    place_id: Option<PlaceId>,
}

impl GeoCentroid {
    /// Zero-duration centroid centered on a sample.
    pub fn from_point(sample: &PositionSample) -> Self {
        Self {
            center: UnitVector::from(sample),
            duration: 0,
            histogram: Histogram::new(),
            place_id: None,
        }
    }

    /// Rebuild a centroid from its persisted fields.
    pub fn from_persisted(
        id: PlaceId,
        longitude: f64,
        latitude: f64,
        duration: u64,
        histogram: Histogram,
    ) -> Self {
        Self {
            center: UnitVector::from_degrees(latitude, longitude),
            duration,
            histogram,
            place_id: Some(id),
        }
    }

    pub fn center(&self) -> &UnitVector {
        &self.center
    }

    pub fn duration(&self) -> u64 {
        self.duration
    }

    pub fn histogram(&self) -> &Histogram {
        &self.histogram
    }

    pub fn place_id(&self) -> Option<PlaceId> {
        self.place_id
    }

    pub(crate) fn set_place_id(&mut self, id: PlaceId) {
        self.place_id = Some(id);
    }

    /// Great-circle distance from the center to a sample, in meters.
    pub fn distance_to(&self, sample: &PositionSample) -> f64 {
        self.center.distance_to(&UnitVector::from(sample))
    }

    /// Great-circle distance between two centers, in meters.
    pub fn distance_to_cluster(&self, other: &GeoCentroid) -> f64 {
        self.center.distance_to(&other.center)
    }

    /// Move the center towards `new_center`, weighted by duration.
    ///
    /// The current center gets weight `duration / (duration + new_duration)`,
    /// or 0 when this centroid has no duration yet. Duration itself is not
    /// changed.
    pub fn average_center(&mut self, new_center: &UnitVector, new_duration: u64) {
        let weight = if self.duration == 0 {
            0.0
        } else {
            self.duration as f64 / (self.duration as f64 + new_duration as f64)
        };

        let blended = self
            .center
            .scaled(weight)
            .add(&new_center.scaled(1.0 - weight));

        match blended.normalized() {
            Some(center) => self.center = center,
            None => log::warn!(
                "[PlaceEngine] Degenerate center average (antipodal inputs), keeping previous center"
            ),
        }
    }

    /// Fold another centroid into this one.
    pub fn absorb(&mut self, other: &GeoCentroid) {
        self.average_center(&other.center, other.duration);
        self.histogram.merge(&other.histogram);
        self.duration += other.duration;
    }

    /// Fold committed seconds (and their histogram) centered at `center`.
    pub(crate) fn commit(&mut self, center: &UnitVector, duration: u64, histogram: &Histogram) {
        self.average_center(center, duration);
        self.histogram.merge(histogram);
        self.duration += duration;
    }

    /// Decay duration and every histogram bin to 95%, truncating.
    pub fn forget_past_history(&mut self) {
        self.duration = decayed(self.duration);
        self.histogram.decay();
    }

    /// Strictly more than `threshold` seconds accumulated.
    pub fn pass_threshold(&self, threshold: u64) -> bool {
        self.duration > threshold
    }

    /// Latitude of the center in degrees.
    pub fn latitude(&self) -> f64 {
        self.center.z.clamp(-1.0, 1.0).asin().to_degrees()
    }

    /// Longitude of the center in degrees, in [-180, 180].
    pub fn longitude(&self) -> f64 {
        let lat = self.center.z.clamp(-1.0, 1.0).asin();
        let cos_lat = lat.cos();
        if cos_lat < f64::EPSILON {
            // Longitude is undefined at the poles.
            return 0.0;
        }

        let lng = (self.center.y / cos_lat).clamp(-1.0, 1.0).asin().to_degrees();
        if self.center.x < 0.0 {
            if lng > 0.0 {
                180.0 - lng
            } else {
                -180.0 - lng
            }
        } else {
            lng
        }
    }

    pub(crate) fn set_center(&mut self, center: UnitVector) {
        self.center = center;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::{DayClass, TimeLabel, TimeLabels, TimeOfDay};

    fn sample(lat: f64, lng: f64) -> PositionSample {
        PositionSample::new(lat, lng, 0)
    }

    fn centroid_with(lat: f64, lng: f64, duration: u64) -> GeoCentroid {
        let mut c = GeoCentroid::from_point(&sample(lat, lng));
        let mut histogram = Histogram::new();
        histogram.add_labels(TimeLabels::new(DayClass::Weekday, TimeOfDay::Morning), duration);
        c.commit(&UnitVector::from_degrees(lat, lng), duration, &histogram);
        c
    }

    fn assert_unit(c: &GeoCentroid) {
        assert!((c.center().norm() - 1.0).abs() < 1e-9, "norm = {}", c.center().norm());
    }

    #[test]
    fn test_distance_one_degree_latitude() {
        let c = GeoCentroid::from_point(&sample(0.0, 0.0));
        let d = c.distance_to(&sample(1.0, 0.0));
        let expected = EARTH_RADIUS_METERS * 1f64.to_radians();
        assert!((d - expected).abs() < 1e-6, "got {}", d);
    }

    #[test]
    fn test_distance_to_self_is_zero() {
        let c = GeoCentroid::from_point(&sample(51.5074, -0.1278));
        let d = c.distance_to(&sample(51.5074, -0.1278));
        // acos near 1 is ill-conditioned, so identical points can land ~0.1m apart.
        assert!(d.is_finite());
        assert!(d < 0.5);
    }

    #[test]
    fn test_distance_symmetric() {
        let a = centroid_with(51.5074, -0.1278, 100);
        let b = centroid_with(48.8566, 2.3522, 50);
        assert_eq!(a.distance_to_cluster(&b), b.distance_to_cluster(&a));
    }

    #[test]
    fn test_average_center_zero_duration_takes_new_center() {
        let mut c = GeoCentroid::from_point(&sample(10.0, 10.0));
        let target = UnitVector::from_degrees(20.0, 30.0);
        c.average_center(&target, 60);

        assert!((c.latitude() - 20.0).abs() < 1e-9);
        assert!((c.longitude() - 30.0).abs() < 1e-9);
        assert_eq!(c.duration(), 0);
        assert_unit(&c);
    }

    #[test]
    fn test_average_center_equal_weights_midpoint() {
        let mut c = centroid_with(0.0, 0.0, 100);
        c.average_center(&UnitVector::from_degrees(0.0, 10.0), 100);
        assert!((c.longitude() - 5.0).abs() < 1e-9);
        assert!(c.latitude().abs() < 1e-9);
        assert_unit(&c);
    }

    #[test]
    fn test_absorb_sums_duration_and_histogram() {
        let mut a = centroid_with(51.5, -0.12, 300);
        let mut b = centroid_with(51.5001, -0.1201, 200);
        let mut extra = Histogram::new();
        extra.add(TimeLabel::Weekend, 40);
        b.commit(&UnitVector::from_degrees(51.5001, -0.1201), 40, &extra);

        let before = a.duration();
        a.absorb(&b);

        assert_eq!(a.duration(), before + b.duration());
        assert_eq!(a.histogram().get(TimeLabel::Weekday), 500);
        assert_eq!(a.histogram().get(TimeLabel::Morning), 500);
        assert_eq!(a.histogram().get(TimeLabel::Weekend), 40);
        assert_unit(&a);
    }

    #[test]
    fn test_forget_past_history() {
        let mut c = centroid_with(0.0, 0.0, 999);
        c.forget_past_history();
        assert_eq!(c.duration(), 949); // 999 * 95 / 100 = 949.05
        assert_eq!(c.histogram().get(TimeLabel::Weekday), 949);
    }

    #[test]
    fn test_pass_threshold_is_strict() {
        let c = centroid_with(0.0, 0.0, 600);
        assert!(!c.pass_threshold(600));
        assert!(c.pass_threshold(599));
    }

    #[test]
    fn test_lat_lng_round_trip_all_quadrants() {
        for &(lat, lng) in &[
            (51.5074, -0.1278),
            (-33.8688, 151.2093),
            (40.7128, -74.0060),
            (-22.9068, -43.1729),
            (35.6762, 139.6503),
            (64.1466, -178.9),
            (-10.0, 179.5),
        ] {
            let c = GeoCentroid::from_point(&sample(lat, lng));
            assert!((c.latitude() - lat).abs() < 1e-9, "lat {} -> {}", lat, c.latitude());
            assert!((c.longitude() - lng).abs() < 1e-9, "lng {} -> {}", lng, c.longitude());
        }
    }

    #[test]
    fn test_average_across_antimeridian() {
        let mut c = centroid_with(0.0, 179.0, 100);
        c.average_center(&UnitVector::from_degrees(0.0, -179.0), 100);
        assert!((c.longitude().abs() - 180.0).abs() < 1e-9);
        assert_unit(&c);
    }

    #[test]
    fn test_antipodal_average_keeps_center() {
        let mut c = centroid_with(0.0, 0.0, 100);
        c.average_center(&UnitVector::from_degrees(0.0, 180.0), 100);
        assert!(c.latitude().abs() < 1e-9);
        assert!(c.longitude().abs() < 1e-9);
        assert_unit(&c);
    }
}
