//! Provisional clusters built up between refreshes.
//!
//! A raw cluster buffers samples as they arrive and only folds them into
//! its centroid on consolidation, so the center stays put while a visit is
//! in progress.

use crate::centroid::{GeoCentroid, UnitVector, EARTH_RADIUS_METERS};
use crate::error::{PlaceError, Result};
use crate::labels::{Histogram, TimeLabels};
use crate::{PlaceId, PositionSample};

/// A sample waiting to be folded into its cluster's centroid.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PendingSample {
    pub vector: UnitVector,
    /// Seconds spent at this position
    pub duration: u64,
}

/// Epoch-scoped cluster accumulating samples until the next refresh.
#[derive(Debug, Clone)]
pub struct RawCluster {
    centroid: GeoCentroid,
    pending_samples: Vec<PendingSample>,
    pending_histogram: Histogram,
    /// Existing place this cluster was matched to on promotion
    semantic_backlink: Option<PlaceId>,
}

impl RawCluster {
    /// Start a cluster at `sample`, recording it as the first pending sample.
    ///
    /// The centroid has no committed duration until the first consolidation.
    pub fn new(sample: &PositionSample, duration_secs: u64, labels: TimeLabels) -> Self {
        let mut cluster = Self {
            centroid: GeoCentroid::from_point(sample),
            pending_samples: Vec::new(),
            pending_histogram: Histogram::new(),
            semantic_backlink: None,
        };
        cluster.ingest_sample(sample, duration_secs, labels);
        cluster
    }

    pub fn centroid(&self) -> &GeoCentroid {
        &self.centroid
    }

    pub(crate) fn centroid_mut(&mut self) -> &mut GeoCentroid {
        &mut self.centroid
    }

    pub fn pending_samples(&self) -> &[PendingSample] {
        &self.pending_samples
    }

    pub fn pending_histogram(&self) -> &Histogram {
        &self.pending_histogram
    }

    pub fn semantic_backlink(&self) -> Option<PlaceId> {
        self.semantic_backlink
    }

    pub(crate) fn set_semantic_backlink(&mut self, id: PlaceId) {
        self.semantic_backlink = Some(id);
    }

    /// Not yet promoted and not linked to an existing place.
    pub fn is_unassigned(&self) -> bool {
        self.centroid.place_id().is_none() && self.semantic_backlink.is_none()
    }

    /// Buffer a sample; the centroid is untouched until [`consolidate`](Self::consolidate).
    pub fn ingest_sample(&mut self, sample: &PositionSample, duration_secs: u64, labels: TimeLabels) {
        self.pending_histogram.add_labels(labels, duration_secs);
        self.pending_samples.push(PendingSample {
            vector: UnitVector::from(sample),
            duration: duration_secs,
        });
    }

    /// Fold pending samples into the centroid.
    ///
    /// The pending samples are reduced to their duration-weighted mean
    /// vector, which is averaged into the center; their total duration and
    /// histogram are then added. A zero-duration sample means the ingestion
    /// layer is broken, so it is reported as an error and nothing is folded.
    /// With every sample checked, the total can only be zero if a sample is,
    /// so the total needs only an overflow check.
    pub fn consolidate(&mut self) -> Result<()> {
        if self.pending_samples.is_empty() {
            return Ok(());
        }

        if let Some(index) = self.pending_samples.iter().position(|s| s.duration == 0) {
            return Err(PlaceError::ZeroDurationSample { index });
        }

        let total = self
            .pending_samples
            .iter()
            .try_fold(0u64, |acc, s| acc.checked_add(s.duration))
            .ok_or(PlaceError::PendingDurationOverflow {
                count: self.pending_samples.len(),
            })?;

        let weighted = self
            .pending_samples
            .iter()
            .fold(UnitVector { x: 0.0, y: 0.0, z: 0.0 }, |acc, s| {
                acc.add(&s.vector.scaled(s.duration as f64))
            });
        let mean = weighted.scaled(1.0 / total as f64);

        self.centroid.commit(&mean, total, &self.pending_histogram);

        self.pending_samples.clear();
        self.pending_histogram.clear();
        Ok(())
    }

    /// Merge another raw cluster into this one.
    ///
    /// Committed state goes through [`GeoCentroid::absorb`] and pending
    /// samples are carried over.
    ///
    /// Unlike [`GeoCentroid::absorb`], which always keeps the survivor's
    /// place id, a survivor with no place assignment takes over the absorbed
    /// cluster's place id or backlink. Time already attributed to a place
    /// keeps flowing to it instead of seeding a duplicate place.
    pub fn absorb(&mut self, other: RawCluster) {
        self.centroid.absorb(&other.centroid);
        self.pending_samples.extend(other.pending_samples);
        self.pending_histogram.merge(&other.pending_histogram);

        if self.is_unassigned() {
            if let Some(id) = other.centroid.place_id() {
                self.centroid.set_place_id(id);
            } else if let Some(id) = other.semantic_backlink {
                self.semantic_backlink = Some(id);
            }
        }
    }

    /// Push the center `distance_meters` along the great circle leading
    /// directly away from `other`.
    ///
    /// Does nothing when the two centers coincide or are antipodal, since
    /// there is no unique direction away.
    pub fn move_away(&mut self, other: &GeoCentroid, distance_meters: f64) {
        let p = *self.centroid.center();
        let o = other.center();

        // Tangent at p pointing away from o: the component of -o orthogonal to p.
        let tangent = p.scaled(p.dot(o)).add(&o.scaled(-1.0));
        let direction = if tangent.norm() < 1e-12 {
            None
        } else {
            tangent.normalized()
        };
        let Some(direction) = direction else {
            log::debug!("[PlaceEngine] move_away: no unique bearing, center unchanged");
            return;
        };

        let angle = distance_meters / EARTH_RADIUS_METERS;
        let moved = p.scaled(angle.cos()).add(&direction.scaled(angle.sin()));
        if let Some(center) = moved.normalized() {
            self.centroid.set_center(center);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::{DayClass, TimeLabel, TimeOfDay};

    fn labels() -> TimeLabels {
        TimeLabels::new(DayClass::Weekday, TimeOfDay::Afternoon)
    }

    fn sample(lat: f64, lng: f64) -> PositionSample {
        PositionSample::new(lat, lng, 0)
    }

    #[test]
    fn test_new_cluster_has_pending_seed() {
        let cluster = RawCluster::new(&sample(51.5, -0.12), 30, labels());
        assert_eq!(cluster.pending_samples().len(), 1);
        assert_eq!(cluster.centroid().duration(), 0);
        assert_eq!(cluster.pending_histogram().get(TimeLabel::Weekday), 30);
        assert_eq!(cluster.pending_histogram().get(TimeLabel::Afternoon), 30);
        assert!(cluster.is_unassigned());
    }

    #[test]
    fn test_consolidate_folds_pending() {
        let mut cluster = RawCluster::new(&sample(0.0, 0.0), 100, labels());
        cluster.ingest_sample(&sample(0.0, 0.001), 100, labels());
        cluster.consolidate().unwrap();

        let c = cluster.centroid();
        assert_eq!(c.duration(), 200);
        assert!((c.longitude() - 0.0005).abs() < 1e-9);
        assert_eq!(c.histogram().get(TimeLabel::Weekday), 200);
        assert!(cluster.pending_samples().is_empty());
        assert!(cluster.pending_histogram().is_empty());
        assert!((c.center().norm() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_consolidate_weights_by_duration() {
        let mut cluster = RawCluster::new(&sample(0.0, 0.0), 300, labels());
        cluster.ingest_sample(&sample(0.0, 0.004), 100, labels());
        cluster.consolidate().unwrap();
        // Weighted mean of 0 and 0.004 at 3:1 sits close to 0.001.
        assert!((cluster.centroid().longitude() - 0.001).abs() < 1e-6);
    }

    #[test]
    fn test_consolidate_empty_is_noop() {
        let mut cluster = RawCluster::new(&sample(10.0, 10.0), 50, labels());
        cluster.consolidate().unwrap();
        let before = cluster.centroid().clone();

        cluster.consolidate().unwrap();
        assert_eq!(cluster.centroid(), &before);
    }

    #[test]
    fn test_consolidate_rejects_zero_duration() {
        let mut cluster = RawCluster::new(&sample(10.0, 10.0), 50, labels());
        cluster.ingest_sample(&sample(10.0, 10.0), 0, labels());

        let err = cluster.consolidate().unwrap_err();
        assert_eq!(err, PlaceError::ZeroDurationSample { index: 1 });
        assert!(err.is_fatal());
        // Nothing folded on failure.
        assert_eq!(cluster.pending_samples().len(), 2);
        assert_eq!(cluster.centroid().duration(), 0);
    }

    #[test]
    fn test_consolidate_rejects_duration_overflow() {
        let mut cluster = RawCluster::new(&sample(10.0, 10.0), u64::MAX, labels());
        cluster.ingest_sample(&sample(10.0, 10.0), 1, labels());

        let err = cluster.consolidate().unwrap_err();
        assert_eq!(err, PlaceError::PendingDurationOverflow { count: 2 });
        assert!(err.is_fatal());
        assert_eq!(cluster.pending_samples().len(), 2);
        assert_eq!(cluster.centroid().duration(), 0);
    }

    #[test]
    fn test_absorb_takes_over_place_id_when_unassigned() {
        let mut survivor = RawCluster::new(&sample(0.0, 0.0), 100, labels());
        survivor.consolidate().unwrap();

        let mut owner = RawCluster::new(&sample(0.0, 0.0001), 700, labels());
        owner.consolidate().unwrap();
        owner.centroid_mut().set_place_id(PlaceId(2));

        survivor.absorb(owner);
        assert_eq!(survivor.centroid().place_id(), Some(PlaceId(2)));
        assert_eq!(survivor.semantic_backlink(), None);
        assert_eq!(survivor.centroid().duration(), 800);
    }

    #[test]
    fn test_second_consolidation_blends_with_committed() {
        let mut cluster = RawCluster::new(&sample(0.0, 0.0), 100, labels());
        cluster.consolidate().unwrap();
        cluster.ingest_sample(&sample(0.0, 0.002), 100, labels());
        cluster.consolidate().unwrap();

        assert_eq!(cluster.centroid().duration(), 200);
        assert!((cluster.centroid().longitude() - 0.001).abs() < 1e-9);
    }

    #[test]
    fn test_absorb_carries_pending_and_assignment() {
        let mut survivor = RawCluster::new(&sample(0.0, 0.0), 100, labels());
        survivor.consolidate().unwrap();

        let mut other = RawCluster::new(&sample(0.0, 0.0001), 200, labels());
        other.consolidate().unwrap();
        other.set_semantic_backlink(PlaceId(4));
        other.ingest_sample(&sample(0.0, 0.0001), 20, labels());

        survivor.absorb(other);

        assert_eq!(survivor.centroid().duration(), 300);
        assert_eq!(survivor.pending_samples().len(), 1);
        assert_eq!(survivor.pending_histogram().get(TimeLabel::Weekday), 20);
        assert_eq!(survivor.semantic_backlink(), Some(PlaceId(4)));
    }

    #[test]
    fn test_move_away_increases_distance() {
        let mut cluster = RawCluster::new(&sample(0.0, 0.0), 100, labels());
        cluster.consolidate().unwrap();
        let other = GeoCentroid::from_point(&sample(0.0, -0.0001));

        let before = cluster.centroid().distance_to_cluster(&other);
        cluster.move_away(&other, 50.0);
        let after = cluster.centroid().distance_to_cluster(&other);

        assert!((after - before - 50.0).abs() < 0.5, "before {} after {}", before, after);
        // Pushed east, directly away from a point to the west.
        assert!(cluster.centroid().longitude() > 0.0);
        assert!(cluster.centroid().latitude().abs() < 1e-9);
        assert!((cluster.centroid().center().norm() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_move_away_from_same_point_is_noop() {
        let mut cluster = RawCluster::new(&sample(5.0, 5.0), 100, labels());
        cluster.consolidate().unwrap();
        let other = cluster.centroid().clone();
        let before = *cluster.centroid().center();

        cluster.move_away(&other, 100.0);
        assert_eq!(cluster.centroid().center(), &before);
    }
}
