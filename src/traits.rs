//! # Traits
//!
//! $$
//! \text{Trait contracts: }\mathcal{S}:\text{ticker}\to\{(t,p,v)\},\quad \mathcal{C}:(P,q,A,b,\mathcal K)\to x^\*
//! $$
//!
//! External collaborators consumed by the pipeline: the time-series store and the
//! conic solver.

use crate::error::Result;
use crate::quant::portfolio::solver::ConicProgram;
use crate::quant::portfolio::solver::ConicSolution;
use crate::quant::portfolio::store::SeriesRow;
use crate::quant::portfolio::types::Timestamp;

/// Date-indexed price/volume rows per asset.
///
/// Implementations keep at most one row per timestamp per ticker (last write wins)
/// and return rows in ascending timestamp order. Ticker names are case-insensitive.
pub trait TimeSeriesStore {
  /// Rows with `start <= date <= end`. Missing bounds are open.
  fn range(
    &self,
    ticker: &str,
    start: Option<Timestamp>,
    end: Option<Timestamp>,
  ) -> Result<Vec<SeriesRow>>;

  /// Insert or replace rows, returning how many were kept.
  fn upsert(&mut self, ticker: &str, rows: &[SeriesRow]) -> Result<usize>;

  /// Tickers that have a table in the store.
  fn tickers(&self) -> Result<Vec<String>>;

  /// Most recent stored timestamp for `ticker`.
  fn latest(&self, ticker: &str) -> Result<Option<Timestamp>> {
    Ok(self.range(ticker, None, None)?.last().map(|row| row.date))
  }
}

/// Conic solver backend.
pub trait ConicSolverExt: Send + Sync {
  /// Backend name for diagnostics.
  fn name(&self) -> &str;

  /// Solve `min ½xᵀPx + qᵀx` subject to the program's cone rows.
  fn solve(&self, program: &ConicProgram) -> Result<ConicSolution>;
}
