//! # Time-Series Store
//!
//! $$
//! \mathcal S(\text{ticker}) = \{(t_i, p_i, v_i)\}_{i},\quad t_i \ge t_{\min},\ t_i \ne t_j
//! $$
//!
//! In-memory and CSV-directory implementations of [`TimeSeriesStore`].

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::fs;
use std::fs::File;
use std::path::Path;
use std::path::PathBuf;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use tracing::debug;

use super::types::Timestamp;
use crate::error::OptimizerError;
use crate::error::Result;
use crate::traits::TimeSeriesStore;

/// Database that holds one table per asset.
pub const SERIES_DATABASE: &str = "series";

/// Seconds since epoch of 2000-01-01, the oldest accepted entry.
const OLDEST_ENTRY_SECS: i64 = 946_684_800;

/// One stored observation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SeriesRow {
  pub date: Timestamp,
  pub price: f64,
  /// `None` when the source has no trade volume (e.g. macro series).
  pub volume: Option<f64>,
}

impl SeriesRow {
  pub fn new(date: Timestamp, price: f64, volume: Option<f64>) -> Self {
    Self {
      date,
      price,
      volume,
    }
  }
}

/// Entries before this date are stripped on upsert.
pub fn oldest_entry_date() -> Timestamp {
  DateTime::<Utc>::from_timestamp(OLDEST_ENTRY_SECS, 0).unwrap_or_default()
}

/// Coerce `"[database].[table]"` or `"[table]"` to its uppercase table name.
///
/// `series.aapl` becomes `AAPL`.
pub fn coerce_table_name(table: &str) -> Result<String> {
  let parts: Vec<&str> = table.split('.').collect();
  let name = match parts.as_slice() {
    [name] => *name,
    [database, name] if database.eq_ignore_ascii_case(SERIES_DATABASE) => *name,
    [database, _] => {
      return Err(OptimizerError::Store(format!(
        "unknown database {database} in table name {table}"
      )))
    }
    _ => return Err(OptimizerError::Store(format!("table name {table} is invalid"))),
  };

  let name = name.trim().to_uppercase();
  if name.is_empty() {
    return Err(OptimizerError::Store(format!("table name {table} is invalid")));
  }
  Ok(name)
}

/// Deduplicate by timestamp (last write wins) and strip entries before `min_date`.
///
/// The batch is checked as a whole; a bad row leaves `table` untouched.
fn merge_rows(
  table: &mut BTreeMap<Timestamp, SeriesRow>,
  rows: &[SeriesRow],
  min_date: Timestamp,
) -> Result<usize> {
  if let Some(row) = rows.iter().find(|row| !row.price.is_finite()) {
    return Err(OptimizerError::Store(format!(
      "non-finite price at {}",
      row.date
    )));
  }
  let mut kept = 0;
  for row in rows {
    if row.date < min_date {
      continue;
    }
    table.insert(row.date, row.clone());
    kept += 1;
  }
  Ok(kept)
}

fn in_range(date: Timestamp, start: Option<Timestamp>, end: Option<Timestamp>) -> bool {
  start.map_or(true, |s| date >= s) && end.map_or(true, |e| date <= e)
}

/// Store backed by ordered maps, one per ticker.
#[derive(Clone, Debug)]
pub struct InMemoryStore {
  tables: HashMap<String, BTreeMap<Timestamp, SeriesRow>>,
  min_date: Timestamp,
}

impl Default for InMemoryStore {
  fn default() -> Self {
    Self::new()
  }
}

impl InMemoryStore {
  pub fn new() -> Self {
    Self {
      tables: HashMap::new(),
      min_date: oldest_entry_date(),
    }
  }

  /// Override the oldest accepted entry date.
  pub fn with_min_date(mut self, min_date: Timestamp) -> Self {
    self.min_date = min_date;
    self
  }
}

impl TimeSeriesStore for InMemoryStore {
  fn range(
    &self,
    ticker: &str,
    start: Option<Timestamp>,
    end: Option<Timestamp>,
  ) -> Result<Vec<SeriesRow>> {
    let name = coerce_table_name(ticker)?;
    Ok(
      self
        .tables
        .get(&name)
        .map(|table| {
          table
            .values()
            .filter(|row| in_range(row.date, start, end))
            .cloned()
            .collect()
        })
        .unwrap_or_default(),
    )
  }

  fn upsert(&mut self, ticker: &str, rows: &[SeriesRow]) -> Result<usize> {
    let name = coerce_table_name(ticker)?;
    match self.tables.get_mut(&name) {
      Some(table) => merge_rows(table, rows, self.min_date),
      None => {
        let mut table = BTreeMap::new();
        let kept = merge_rows(&mut table, rows, self.min_date)?;
        self.tables.insert(name, table);
        Ok(kept)
      }
    }
  }

  fn tickers(&self) -> Result<Vec<String>> {
    let mut names: Vec<String> = self.tables.keys().cloned().collect();
    names.sort();
    Ok(names)
  }
}

/// Store backed by a directory of `<TICKER>.csv` files with `date,price,volume` columns.
#[derive(Clone, Debug)]
pub struct CsvStore {
  root: PathBuf,
  min_date: Timestamp,
}

impl CsvStore {
  /// Open (and create if needed) a store directory.
  pub fn open(root: impl AsRef<Path>) -> Result<Self> {
    let root = root.as_ref().to_path_buf();
    fs::create_dir_all(&root)?;
    Ok(Self {
      root,
      min_date: oldest_entry_date(),
    })
  }

  pub fn with_min_date(mut self, min_date: Timestamp) -> Self {
    self.min_date = min_date;
    self
  }

  fn table_path(&self, name: &str) -> PathBuf {
    self.root.join(format!("{name}.csv"))
  }

  fn read_table(&self, name: &str) -> Result<BTreeMap<Timestamp, SeriesRow>> {
    let path = self.table_path(name);
    let mut table = BTreeMap::new();
    if !path.exists() {
      return Ok(table);
    }

    let mut reader = csv::Reader::from_path(&path)?;
    for record in reader.deserialize() {
      let row: SeriesRow = record?;
      // Later lines win, matching upsert semantics.
      table.insert(row.date, row);
    }
    Ok(table)
  }

  fn write_table(&self, name: &str, table: &BTreeMap<Timestamp, SeriesRow>) -> Result<()> {
    let file = File::create(self.table_path(name))?;
    let mut writer = csv::Writer::from_writer(file);
    for row in table.values() {
      writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
  }
}

impl TimeSeriesStore for CsvStore {
  fn range(
    &self,
    ticker: &str,
    start: Option<Timestamp>,
    end: Option<Timestamp>,
  ) -> Result<Vec<SeriesRow>> {
    let name = coerce_table_name(ticker)?;
    Ok(
      self
        .read_table(&name)?
        .into_values()
        .filter(|row| in_range(row.date, start, end))
        .collect(),
    )
  }

  fn upsert(&mut self, ticker: &str, rows: &[SeriesRow]) -> Result<usize> {
    let name = coerce_table_name(ticker)?;
    let mut table = self.read_table(&name)?;
    let kept = merge_rows(&mut table, rows, self.min_date)?;
    self.write_table(&name, &table)?;
    debug!(table = %name, kept, total = table.len(), "upserted series rows");
    Ok(kept)
  }

  fn tickers(&self) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(&self.root)? {
      let path = entry?.path();
      if path.extension().and_then(|e| e.to_str()) != Some("csv") {
        continue;
      }
      if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
        names.push(stem.to_string());
      }
    }
    names.sort();
    Ok(names)
  }
}
