//! SQLite-backed place table.

use rusqlite::{params_from_iter, Connection, Result as SqlResult};

use super::{columns, Row, RowStore};
use crate::error::Result;

const TABLE: &str = "places";

/// Row store keeping named places in a single SQLite table.
pub struct SqliteRowStore {
    db: Connection,
}

impl SqliteRowStore {
    /// Open (or create) the database at `db_path`.
    pub fn open(db_path: &str) -> Result<Self> {
        let db = Connection::open(db_path)?;
        Self::init_schema(&db)?;
        log::info!("[PlaceStore] Opened place table at {}", db_path);
        Ok(Self { db })
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        Self::open(":memory:")
    }

    /// Initialize the database schema.
    fn init_schema(conn: &Connection) -> SqlResult<()> {
        // Histogram columns are nullable: NULL means the label was never seen.
        let label_columns: Vec<String> = columns()
            .skip(4)
            .map(|c| format!("{} TEXT", c))
            .collect();

        conn.execute_batch(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id TEXT PRIMARY KEY,
                longitude TEXT NOT NULL,
                latitude TEXT NOT NULL,
                duration TEXT NOT NULL,
                {labels}
            );
            "#,
            table = TABLE,
            labels = label_columns.join(",\n                "),
        ))
    }

    fn insert(conn: &Connection, row: &Row) -> SqlResult<usize> {
        let cols: Vec<&str> = columns().collect();
        let placeholders = vec!["?"; cols.len()].join(", ");
        let values: Vec<Option<&String>> = cols.iter().map(|c| row.get(*c)).collect();

        for key in row.keys() {
            if !cols.contains(&key.as_str()) {
                log::warn!("[PlaceStore] Dropping unknown column '{}'", key);
            }
        }

        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO {} ({}) VALUES ({})",
                TABLE,
                cols.join(", "),
                placeholders
            ),
            params_from_iter(values.iter()),
        )
    }
}

impl RowStore for SqliteRowStore {
    fn add_row(&mut self, row: Row) -> Result<bool> {
        Ok(Self::insert(&self.db, &row)? > 0)
    }

    fn all_rows(&self) -> Result<Vec<Row>> {
        let cols: Vec<&str> = columns().collect();
        let mut stmt = self.db.prepare(&format!(
            "SELECT {} FROM {} ORDER BY rowid",
            cols.join(", "),
            TABLE
        ))?;

        let rows = stmt
            .query_map([], |r| {
                let mut row = Row::new();
                for (i, col) in cols.iter().enumerate() {
                    if let Some(value) = r.get::<_, Option<String>>(i)? {
                        row.insert(col.to_string(), value);
                    }
                }
                Ok(row)
            })?
            .collect::<SqlResult<Vec<Row>>>()?;

        Ok(rows)
    }

    fn clear(&mut self) -> Result<usize> {
        Ok(self.db.execute(&format!("DELETE FROM {}", TABLE), [])?)
    }

    /// Wipe and rewrite inside one transaction, so readers never see a
    /// half-written table.
    fn replace_all(&mut self, rows: Vec<Row>) -> Result<usize> {
        let tx = self.db.transaction()?;
        tx.execute(&format!("DELETE FROM {}", TABLE), [])?;

        let mut written = 0;
        for row in &rows {
            written += Self::insert(&tx, row)?;
        }

        tx.commit()?;
        Ok(written)
    }
}
