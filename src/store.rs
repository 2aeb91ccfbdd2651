//! # Place Store
//!
//! Named places are persisted as flat string rows: `id`, `longitude`,
//! `latitude`, `duration`, plus one column per [`TimeLabel`]. A histogram
//! label with no recorded time is left out of the row entirely, so the
//! key set survives a round trip unchanged.
//!
//! Floats are written with Rust's shortest round-trip formatting, so the
//! text adds no loss on top of the unit-vector -> lat/lng conversion.

use std::collections::BTreeMap;

use crate::centroid::GeoCentroid;
use crate::error::{OptionExt, PlaceError, Result};
use crate::labels::{Histogram, TimeLabel};
use crate::PlaceId;

#[cfg(feature = "persistence")]
pub mod sqlite;

/// One persisted place, column name -> string value.
pub type Row = BTreeMap<String, String>;

pub const COL_ID: &str = "id";
pub const COL_LONGITUDE: &str = "longitude";
pub const COL_LATITUDE: &str = "latitude";
pub const COL_DURATION: &str = "duration";

/// Every column of the place table, in schema order.
pub fn columns() -> impl Iterator<Item = &'static str> {
    [COL_ID, COL_LONGITUDE, COL_LATITUDE, COL_DURATION]
        .into_iter()
        .chain(TimeLabel::ALL.into_iter().map(TimeLabel::column_name))
}

/// Durable table of named places.
///
/// All values are strings; the engine does its own encoding.
pub trait RowStore: Send {
    /// Append a row. Returns whether a row was written.
    fn add_row(&mut self, row: Row) -> Result<bool>;

    /// Every stored row.
    fn all_rows(&self) -> Result<Vec<Row>>;

    /// Delete every row, returning how many were removed.
    fn clear(&mut self) -> Result<usize>;

    /// Replace the whole table with `rows`.
    ///
    /// Stores that can do this atomically should override it.
    fn replace_all(&mut self, rows: Vec<Row>) -> Result<usize> {
        self.clear()?;
        let mut written = 0;
        for row in rows {
            if self.add_row(row)? {
                written += 1;
            }
        }
        Ok(written)
    }
}

/// In-memory row store, for tests and ephemeral engines.
#[derive(Debug, Clone, Default)]
pub struct MemoryRowStore {
    rows: Vec<Row>,
}

impl MemoryRowStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rows(rows: Vec<Row>) -> Self {
        Self { rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl RowStore for MemoryRowStore {
    fn add_row(&mut self, row: Row) -> Result<bool> {
        self.rows.push(row);
        Ok(true)
    }

    fn all_rows(&self) -> Result<Vec<Row>> {
        Ok(self.rows.clone())
    }

    fn clear(&mut self) -> Result<usize> {
        let removed = self.rows.len();
        self.rows.clear();
        Ok(removed)
    }
}

// ============================================================================
// Row Encoding
// ============================================================================

/// Encode a named place as a row. Returns `None` for unpromoted centroids.
pub fn encode_place(centroid: &GeoCentroid) -> Option<Row> {
    let id = centroid.place_id()?;

    let mut row = Row::new();
    row.insert(COL_ID.to_string(), id.to_string());
    row.insert(COL_LONGITUDE.to_string(), centroid.longitude().to_string());
    row.insert(COL_LATITUDE.to_string(), centroid.latitude().to_string());
    row.insert(COL_DURATION.to_string(), centroid.duration().to_string());
    for (label, seconds) in centroid.histogram().iter() {
        row.insert(label.column_name().to_string(), seconds.to_string());
    }
    Some(row)
}

/// Decode a row back into a named place.
pub fn decode_place(row: &Row) -> Result<GeoCentroid> {
    let id: PlaceId = row.get(COL_ID).ok_or_missing_column(COL_ID)?.parse()?;
    let longitude: f64 = parse_column(row, COL_LONGITUDE)?;
    let latitude: f64 = parse_column(row, COL_LATITUDE)?;
    let duration: u64 = parse_column(row, COL_DURATION)?;

    if !longitude.is_finite() || !latitude.is_finite() {
        return Err(PlaceError::MalformedRow {
            column: COL_LATITUDE.to_string(),
            message: format!("non-finite position ({}, {})", latitude, longitude),
        });
    }

    let mut histogram = Histogram::new();
    for label in TimeLabel::ALL {
        if row.contains_key(label.column_name()) {
            histogram.add(label, parse_column(row, label.column_name())?);
        }
    }

    Ok(GeoCentroid::from_persisted(
        id, longitude, latitude, duration, histogram,
    ))
}

fn parse_column<T>(row: &Row, column: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let raw = row.get(column).ok_or_missing_column(column)?;
    raw.trim().parse().map_err(|e: T::Err| PlaceError::MalformedRow {
        column: column.to_string(),
        message: format!("'{}': {}", raw, e),
    })
}
