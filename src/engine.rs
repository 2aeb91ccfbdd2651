//! # Clustering Engine
//!
//! Stateful engine that turns a stream of position samples into a small
//! set of named places.
//!
//! ## Architecture
//!
//! The engine keeps two collections:
//! - **Raw clusters**: provisional, reset at every refresh
//! - **Semantic clusters**: named places, persisted and reloaded on startup
//!
//! Time is measured on the sample stream, not the wall clock. Two nested
//! periods drive the state machine:
//!
//! 1. **Consolidation** (every 10 min of stream time): fold pending samples,
//!    merge overlapping raw clusters, promote long stays to places, persist.
//! 2. **Refresh** (every 24 h of stream time): decay places, absorb linked
//!    raw clusters into their place, discard all raw state.
//!
//! One mutex guards both collections, the clocks and the store together.
//! Consolidation and refresh always touch both collections, so splitting
//! the lock would let a reader observe a raw cluster linked to a place
//! that is not there yet. Persistence also runs under the lock; with a
//! slow store that costs reader latency, not correctness.

use std::sync::{Mutex, MutexGuard};

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

use crate::centroid::GeoCentroid;
use crate::error::{PlaceError, Result};
use crate::labels::{Histogram, TimeLabeler, UtcOffsetLabeler};
use crate::raw_cluster::RawCluster;
use crate::store::{decode_place, encode_place, RowStore};
use crate::{PlaceId, PositionSample, UNKNOWN_PLACE};

// ============================================================================
// Configuration
// ============================================================================

/// Tuning for the clustering engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusteringConfig {
    /// Samples closer than this to a raw cluster join it; raw clusters
    /// closer than this are merged (meters). Default: 25m
    pub capture_radius: f64,
    /// Raw clusters closer than this to a place link to it instead of
    /// becoming a new place; also the lookup radius (meters). Default: 75m
    pub semantic_radius: f64,
    /// A raw cluster needs strictly more than this much time to be
    /// promoted (seconds). Default: 600
    pub promotion_threshold: u64,
    /// Stream time between consolidations (seconds). Default: 600
    pub consolidation_period: i64,
    /// Stream time between refreshes (seconds). Default: 86400
    pub refresh_period: i64,
    /// Offset from UTC used for weekday/time-of-day labels (seconds).
    /// Default: 0
    pub utc_offset_secs: i32,
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            capture_radius: 25.0,
            semantic_radius: 75.0,
            promotion_threshold: 600,
            consolidation_period: 600,
            refresh_period: 86_400,
            utc_offset_secs: 0,
        }
    }
}

impl ClusteringConfig {
    /// Check that every radius and period is positive.
    pub fn validate(&self) -> Result<()> {
        let invalid = |message: String| Err(PlaceError::ConfigError { message });

        if !(self.capture_radius.is_finite() && self.capture_radius > 0.0) {
            return invalid(format!("capture_radius must be > 0, got {}", self.capture_radius));
        }
        if !(self.semantic_radius.is_finite() && self.semantic_radius > 0.0) {
            return invalid(format!("semantic_radius must be > 0, got {}", self.semantic_radius));
        }
        if self.consolidation_period <= 0 {
            return invalid(format!(
                "consolidation_period must be > 0, got {}",
                self.consolidation_period
            ));
        }
        if self.refresh_period <= 0 {
            return invalid(format!("refresh_period must be > 0, got {}", self.refresh_period));
        }
        Ok(())
    }
}

// ============================================================================
// Read-side types
// ============================================================================

/// A named place as exposed to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaceSummary {
    pub id: PlaceId,
    pub latitude: f64,
    pub longitude: f64,
    /// Decayed visit time in seconds
    pub duration_secs: u64,
    pub histogram: Histogram,
}

impl PlaceSummary {
    fn from_centroid(id: PlaceId, centroid: &GeoCentroid) -> Self {
        Self {
            id,
            latitude: centroid.latitude(),
            longitude: centroid.longitude(),
            duration_secs: centroid.duration(),
            histogram: centroid.histogram().clone(),
        }
    }
}

/// Engine statistics for monitoring.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineStats {
    pub raw_cluster_count: usize,
    pub pending_sample_count: usize,
    pub place_count: usize,
    /// Highest place number handed out so far
    pub last_place_number: u64,
    pub last_sample_timestamp: Option<i64>,
    pub halted: bool,
}

// ============================================================================
// Engine State
// ============================================================================

/// Everything the engine mutex protects, apart from the store.
#[derive(Debug, Default)]
struct EngineState {
    raw_clusters: Vec<RawCluster>,
    semantic_clusters: Vec<GeoCentroid>,
    last_sample: Option<PositionSample>,
    consolidate_clock: i64,
    refresh_clock: i64,
    /// Last place number minted; never decreases
    place_counter: u64,
    /// Set after a fatal consolidation error
    halted: Option<String>,
}

impl EngineState {
    fn ensure_running(&self) -> Result<()> {
        match &self.halted {
            Some(reason) => Err(PlaceError::EngineHalted {
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }

    /// Record a fatal error and stop accepting writes.
    fn halt(&mut self, err: PlaceError) -> PlaceError {
        if err.is_fatal() && self.halted.is_none() {
            error!("[PlaceEngine] Halting: {}", err);
            self.halted = Some(err.to_string());
        }
        err
    }

    fn mint_place_id(&mut self) -> PlaceId {
        self.place_counter += 1;
        PlaceId(self.place_counter)
    }

    /// Credit `elapsed` seconds to wherever `at` falls.
    fn assign_elapsed(
        &mut self,
        at: &PositionSample,
        elapsed: u64,
        labeler: &dyn TimeLabeler,
        config: &ClusteringConfig,
    ) {
        let labels = labeler.labels(at.timestamp);

        let nearest = self
            .raw_clusters
            .iter_mut()
            .map(|c| {
                let d = c.centroid().distance_to(at);
                (c, d)
            })
            .min_by(|a, b| a.1.total_cmp(&b.1));

        match nearest {
            Some((cluster, distance)) if distance < config.capture_radius => {
                cluster.ingest_sample(at, elapsed, labels);
            }
            _ => {
                debug!(
                    "[PlaceEngine] New raw cluster at ({:.6}, {:.6})",
                    at.latitude, at.longitude
                );
                self.raw_clusters.push(RawCluster::new(at, elapsed, labels));
            }
        }
    }

    /// Fold, merge and promote raw clusters.
    fn consolidate(&mut self, config: &ClusteringConfig) -> Result<()> {
        for cluster in &mut self.raw_clusters {
            cluster.consolidate()?;
        }

        self.merge_raw_clusters(config.capture_radius);
        self.sync_owned_places();
        self.promote(config);

        debug!(
            "[PlaceEngine] Consolidated: {} raw clusters, {} places",
            self.raw_clusters.len(),
            self.semantic_clusters.len()
        );
        Ok(())
    }

    /// Merge every pair of raw clusters closer than `radius`.
    ///
    /// The lower index survives. After absorbing, the survivor keeps being
    /// compared against the remaining higher-indexed clusters, so each
    /// surviving pair is compared exactly once per pass.
    fn merge_raw_clusters(&mut self, radius: f64) {
        let mut i = 0;
        while i < self.raw_clusters.len() {
            let mut j = i + 1;
            while j < self.raw_clusters.len() {
                let distance = self.raw_clusters[i]
                    .centroid()
                    .distance_to_cluster(self.raw_clusters[j].centroid());
                if distance < radius {
                    let absorbed = self.raw_clusters.remove(j);
                    debug!("[PlaceEngine] Merging raw clusters {} <- {} ({:.1}m)", i, j, distance);
                    self.raw_clusters[i].absorb(absorbed);
                } else {
                    j += 1;
                }
            }
            i += 1;
        }
    }

    /// Copy the centroid of every raw cluster that owns a place into the
    /// place list, so lookups and snapshots see its latest state.
    fn sync_owned_places(&mut self) {
        for cluster in &self.raw_clusters {
            let Some(id) = cluster.centroid().place_id() else {
                continue;
            };
            if let Some(place) = self
                .semantic_clusters
                .iter_mut()
                .find(|p| p.place_id() == Some(id))
            {
                *place = cluster.centroid().clone();
            }
        }
    }

    /// Link long-lived raw clusters to a nearby place, or make them one.
    fn promote(&mut self, config: &ClusteringConfig) {
        for idx in 0..self.raw_clusters.len() {
            let candidate = &self.raw_clusters[idx];
            if !candidate.is_unassigned()
                || !candidate.centroid().pass_threshold(config.promotion_threshold)
            {
                continue;
            }

            let nearest = self
                .semantic_clusters
                .iter()
                .filter_map(|place| {
                    place
                        .place_id()
                        .map(|id| (id, candidate.centroid().distance_to_cluster(place)))
                })
                .min_by(|a, b| a.1.total_cmp(&b.1));

            match nearest {
                Some((id, distance)) if distance < config.semantic_radius => {
                    info!("[PlaceEngine] Raw cluster linked to {} ({:.1}m)", id, distance);
                    self.raw_clusters[idx].set_semantic_backlink(id);
                }
                _ => {
                    let id = self.mint_place_id();
                    let cluster = &mut self.raw_clusters[idx];
                    cluster.centroid_mut().set_place_id(id);
                    info!(
                        "[PlaceEngine] New place {} at ({:.6}, {:.6}) after {}s",
                        id,
                        cluster.centroid().latitude(),
                        cluster.centroid().longitude(),
                        cluster.centroid().duration()
                    );
                    self.semantic_clusters.push(cluster.centroid().clone());
                }
            }
        }
    }

    /// Decay places, fold linked raw clusters into them, drop raw state.
    fn refresh(&mut self) {
        self.sync_owned_places();

        for place in &mut self.semantic_clusters {
            place.forget_past_history();
        }

        let raw_count = self.raw_clusters.len();
        for cluster in self.raw_clusters.drain(..) {
            if !cluster.pending_samples().is_empty() {
                debug!(
                    "[PlaceEngine] Discarding {} unconsolidated samples",
                    cluster.pending_samples().len()
                );
            }
            let Some(id) = cluster.semantic_backlink() else {
                continue;
            };
            match self
                .semantic_clusters
                .iter_mut()
                .find(|p| p.place_id() == Some(id))
            {
                Some(place) => place.absorb(cluster.centroid()),
                None => warn!("[PlaceEngine] Linked place {} no longer exists", id),
            }
        }

        info!(
            "[PlaceEngine] Refreshed: {} places kept, {} raw clusters discarded",
            self.semantic_clusters.len(),
            raw_count
        );
    }

    fn find_place_near(&self, at: &PositionSample, radius: f64) -> Option<PlaceId> {
        // Linear scan; place counts stay small. A spatial index would only
        // matter with thousands of places.
        self.semantic_clusters
            .iter()
            .find(|place| place.distance_to(at) < radius)
            .and_then(|place| place.place_id())
    }
}

struct Inner<S> {
    state: EngineState,
    store: S,
}

fn persist_places<S: RowStore>(state: &EngineState, store: &mut S) -> Result<usize> {
    let rows: Vec<_> = state
        .semantic_clusters
        .iter()
        .filter_map(encode_place)
        .collect();
    let written = store.replace_all(rows)?;
    debug!("[PlaceEngine] Persisted {} places", written);
    Ok(written)
}

// ============================================================================
// Clustering Engine
// ============================================================================

/// Incremental place discovery over a single sample stream.
///
/// All methods take `&self`; the engine can be shared (e.g. in an `Arc`)
/// between the ingesting caller and concurrent readers.
pub struct ClusteringEngine<S: RowStore> {
    inner: Mutex<Inner<S>>,
    config: ClusteringConfig,
    labeler: Box<dyn TimeLabeler>,
}

impl<S: RowStore> ClusteringEngine<S> {
    /// Create an engine over `store` and load its persisted places.
    ///
    /// Fails if the config is invalid or the store cannot be read.
    pub fn new(store: S, config: ClusteringConfig) -> Result<Self> {
        config.validate()?;
        let labeler = UtcOffsetLabeler::new(config.utc_offset_secs).ok_or_else(|| {
            PlaceError::ConfigError {
                message: format!("utc_offset_secs out of range: {}", config.utc_offset_secs),
            }
        })?;

        let engine = Self {
            inner: Mutex::new(Inner {
                state: EngineState::default(),
                store,
            }),
            config,
            labeler: Box::new(labeler),
        };
        engine.load()?;
        Ok(engine)
    }

    /// Replace the weekday/time-of-day labeler.
    pub fn with_labeler(mut self, labeler: impl TimeLabeler + 'static) -> Self {
        self.labeler = Box::new(labeler);
        self
    }

    pub fn config(&self) -> &ClusteringConfig {
        &self.config
    }

    /// Persist a final snapshot and hand back the store.
    pub fn close(self) -> Result<S> {
        let mut inner = self
            .inner
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        persist_places(&inner.state, &mut inner.store)?;
        info!("[PlaceEngine] Closed with {} places", inner.state.semantic_clusters.len());
        Ok(inner.store)
    }

    fn lock(&self) -> MutexGuard<'_, Inner<S>> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            warn!("[PlaceEngine] Recovering from poisoned lock");
            poisoned.into_inner()
        })
    }

    // ========================================================================
    // Ingestion
    // ========================================================================

    /// Feed the next sample of the stream.
    ///
    /// The time since the previous sample is credited to the previous
    /// sample's position. Duplicate timestamps are ignored. Crossing a
    /// consolidation (and possibly refresh) boundary runs that phase and
    /// then persists the places.
    ///
    /// A persistence error is returned after the sample has been applied;
    /// the in-memory state stays consistent.
    pub fn ingest(&self, sample: &PositionSample) -> Result<()> {
        let mut guard = self.lock();
        let Inner { state, store } = &mut *guard;
        state.ensure_running()?;

        if !sample.is_valid() {
            return Err(PlaceError::InvalidCoordinates {
                timestamp: sample.timestamp,
                latitude: sample.latitude,
                longitude: sample.longitude,
            });
        }

        let Some(last) = state.last_sample else {
            state.last_sample = Some(*sample);
            state.consolidate_clock = sample.timestamp;
            state.refresh_clock = sample.timestamp;
            debug!("[PlaceEngine] First sample at t={}", sample.timestamp);
            return Ok(());
        };

        if sample.timestamp == last.timestamp {
            return Ok(());
        }
        if sample.timestamp < last.timestamp {
            return Err(PlaceError::OutOfOrderSample {
                timestamp: sample.timestamp,
                last_timestamp: last.timestamp,
            });
        }

        // Nothing is mutated until every gap is known to fit in an i64.
        let since = |reference: i64| {
            sample
                .timestamp
                .checked_sub(reference)
                .ok_or(PlaceError::TimestampOutOfRange {
                    timestamp: sample.timestamp,
                    reference,
                })
        };
        let elapsed = since(last.timestamp)? as u64;
        let since_consolidation = since(state.consolidate_clock)?;
        let since_refresh = since(state.refresh_clock)?;

        state.assign_elapsed(&last, elapsed, self.labeler.as_ref(), &self.config);
        state.last_sample = Some(*sample);

        if since_consolidation > self.config.consolidation_period {
            if let Err(e) = state.consolidate(&self.config) {
                return Err(state.halt(e));
            }
            state.consolidate_clock = sample.timestamp;

            if since_refresh > self.config.refresh_period {
                state.refresh();
                state.refresh_clock = sample.timestamp;
            }

            persist_places(state, store)?;
        }

        Ok(())
    }

    /// Run a consolidation pass now and persist the result.
    pub fn consolidate(&self) -> Result<()> {
        let mut guard = self.lock();
        let Inner { state, store } = &mut *guard;
        state.ensure_running()?;

        if let Err(e) = state.consolidate(&self.config) {
            return Err(state.halt(e));
        }
        persist_places(state, store)?;
        Ok(())
    }

    /// Run a refresh now and persist the result.
    ///
    /// Samples not yet consolidated are discarded with the raw clusters.
    pub fn refresh(&self) -> Result<()> {
        let mut guard = self.lock();
        let Inner { state, store } = &mut *guard;
        state.ensure_running()?;

        state.refresh();
        persist_places(state, store)?;
        Ok(())
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    /// Rewrite the store from the current places. Returns rows written.
    pub fn persist(&self) -> Result<usize> {
        let mut guard = self.lock();
        let Inner { state, store } = &mut *guard;
        persist_places(state, store)
    }

    /// Replace the in-memory places with the store's contents.
    ///
    /// Raw clusters are dropped, since their links may point at places
    /// that no longer exist. Returns the number of places loaded.
    pub fn load(&self) -> Result<usize> {
        let mut guard = self.lock();
        let Inner { state, store } = &mut *guard;

        let places = store
            .all_rows()?
            .iter()
            .map(decode_place)
            .collect::<Result<Vec<_>>>()?;

        let highest = places
            .iter()
            .filter_map(|p| p.place_id())
            .map(|id| id.number())
            .max()
            .unwrap_or(0);

        state.place_counter = state.place_counter.max(places.len() as u64).max(highest);
        state.semantic_clusters = places;
        state.raw_clusters.clear();

        info!(
            "[PlaceEngine] Loaded {} places (next id {})",
            state.semantic_clusters.len(),
            state.place_counter + 1
        );
        Ok(state.semantic_clusters.len())
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Place containing the last sample, or [`UNKNOWN_PLACE`].
    pub fn lookup_place(&self) -> String {
        self.find_place()
            .map(|id| id.to_string())
            .unwrap_or_else(|| UNKNOWN_PLACE.to_string())
    }

    /// Place containing the last sample, if any.
    pub fn find_place(&self) -> Option<PlaceId> {
        let guard = self.lock();
        let last = guard.state.last_sample?;
        guard.state.find_place_near(&last, self.config.semantic_radius)
    }

    /// First place within the semantic radius of an arbitrary position.
    pub fn lookup_place_at(&self, at: &PositionSample) -> Option<PlaceId> {
        self.lock()
            .state
            .find_place_near(at, self.config.semantic_radius)
    }

    /// Ids of every known place.
    pub fn list_place_names(&self) -> Vec<String> {
        self.lock()
            .state
            .semantic_clusters
            .iter()
            .filter_map(|p| p.place_id())
            .map(|id| id.to_string())
            .collect()
    }

    pub fn place_summaries(&self) -> Vec<PlaceSummary> {
        self.lock()
            .state
            .semantic_clusters
            .iter()
            .filter_map(|p| p.place_id().map(|id| PlaceSummary::from_centroid(id, p)))
            .collect()
    }

    /// Place summaries as a JSON array.
    pub fn place_summaries_json(&self) -> String {
        serde_json::to_string(&self.place_summaries()).unwrap_or_else(|_| "[]".to_string())
    }

    /// Snapshot of the named places.
    pub fn places(&self) -> Vec<GeoCentroid> {
        self.lock().state.semantic_clusters.clone()
    }

    /// Snapshot of the current raw clusters.
    pub fn raw_clusters(&self) -> Vec<RawCluster> {
        self.lock().state.raw_clusters.clone()
    }

    /// Get engine statistics.
    pub fn stats(&self) -> EngineStats {
        let guard = self.lock();
        let state = &guard.state;
        EngineStats {
            raw_cluster_count: state.raw_clusters.len(),
            pending_sample_count: state
                .raw_clusters
                .iter()
                .map(|c| c.pending_samples().len())
                .sum(),
            place_count: state.semantic_clusters.len(),
            last_place_number: state.place_counter,
            last_sample_timestamp: state.last_sample.map(|s| s.timestamp),
            halted: state.halted.is_some(),
        }
    }

    /// Drop all in-memory state, keeping the id counter.
    ///
    /// The store is untouched until the next persist.
    pub fn clear(&self) {
        let mut guard = self.lock();
        let counter = guard.state.place_counter;
        guard.state = EngineState {
            place_counter: counter,
            ..EngineState::default()
        };
        info!("[PlaceEngine] Cleared");
    }
}

// ============================================================================
// Tests
// ============================================================================
