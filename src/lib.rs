//! # Place Matcher
//!
//! Incremental discovery of recurring places ("stay points") from a stream
//! of GPS samples, with no offline batch pass.
//!
//! This library provides:
//! - Spherical centroids with visit-duration histograms
//! - Provisional (raw) clusters that buffer samples between consolidations
//! - A clustering engine that merges, promotes, decays and persists places
//!
//! ## Features
//!
//! - **`persistence`** - SQLite-backed row store for named places
//! - **`full`** - Enable all features
//!
//! ## Quick Start
//!
//! ```rust
//! use place_matcher::{ClusteringConfig, ClusteringEngine, MemoryRowStore, PositionSample};
//!
//! let engine = ClusteringEngine::new(MemoryRowStore::new(), ClusteringConfig::default()).unwrap();
//!
//! // Twelve minutes parked at the same spot, one sample every 10 seconds.
//! for i in 0..=72 {
//!     let sample = PositionSample::new(51.5074, -0.1278, 1_700_000_000 + i * 10);
//!     engine.ingest(&sample).unwrap();
//! }
//!
//! assert_eq!(engine.list_place_names().len(), 1);
//! println!("Currently at {}", engine.lookup_place());
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// Unified error handling
pub mod error;
pub use error::{OptionExt, PlaceError, Result};

// Time labels and visit-duration histograms
pub mod labels;
pub use labels::{DayClass, Histogram, TimeLabel, TimeLabeler, TimeLabels, TimeOfDay, UtcOffsetLabeler};

// Spherical centroid value type
pub mod centroid;
pub use centroid::{GeoCentroid, UnitVector, EARTH_RADIUS_METERS};

// Provisional clusters with pending samples
pub mod raw_cluster;
pub use raw_cluster::{PendingSample, RawCluster};

// Row-store persistence of named places
pub mod store;
pub use store::{MemoryRowStore, Row, RowStore};
#[cfg(feature = "persistence")]
pub use store::sqlite::SqliteRowStore;

// Stateful clustering engine
pub mod engine;
pub use engine::{ClusteringConfig, ClusteringEngine, EngineStats, PlaceSummary};

// ============================================================================
// Core Types
// ============================================================================

/// Returned by place lookups when no known place is close enough.
pub const UNKNOWN_PLACE: &str = "unknown";

/// A timestamped GPS position.
///
/// # Example
/// ```
/// use place_matcher::PositionSample;
/// let sample = PositionSample::new(51.5074, -0.1278, 1_700_000_000); // London
/// assert!(sample.is_valid());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PositionSample {
    pub latitude: f64,
    pub longitude: f64,
    /// Unix time in seconds
    pub timestamp: i64,
}

impl PositionSample {
    /// Create a new sample.
    pub fn new(latitude: f64, longitude: f64, timestamp: i64) -> Self {
        Self {
            latitude,
            longitude,
            timestamp,
        }
    }

    /// Check if the sample has valid coordinates.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && self.latitude >= -90.0
            && self.latitude <= 90.0
            && self.longitude >= -180.0
            && self.longitude <= 180.0
    }
}

/// Stable identity of a named place, rendered as `place-<n>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct PlaceId(pub u64);

impl PlaceId {
    const PREFIX: &'static str = "place-";

    pub fn number(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for PlaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", Self::PREFIX, self.0)
    }
}

impl FromStr for PlaceId {
    type Err = PlaceError;

    fn from_str(s: &str) -> Result<Self> {
        s.strip_prefix(Self::PREFIX)
            .and_then(|n| n.parse::<u64>().ok())
            .map(PlaceId)
            .ok_or_else(|| PlaceError::MalformedRow {
                column: "id".to_string(),
                message: format!("'{}' is not a place id", s),
            })
    }
}

impl From<PlaceId> for String {
    fn from(id: PlaceId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for PlaceId {
    type Error = PlaceError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}
