//! # Market Data Server
//!
//! $$
//! r_{t,i} = \frac{p_{t,i}}{p_{t-1,i}} - 1,\qquad r_{0,i}=0,\qquad r_{t,\text{cash}} = (1+r_f)^{1/P}-1
//! $$
//!
//! Aligned, gap-filled price/return/volume panels served point-in-time. Past slices
//! returned by [`DataProvider::serve`] never contain the row at `t` or anything after it.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use ndarray::Array2;
use ndarray::ArrayView1;
use ndarray::ArrayView2;
use ndarray::s;
use serde::Deserialize;
use serde::Serialize;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::store::SeriesRow;
use super::types::Timestamp;
use super::types::Universe;
use crate::error::OptimizerError;
use crate::error::Result;
use crate::traits::TimeSeriesStore;

/// Sampling and cash conventions of a panel.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
  /// Annualization factor matching the sampling frequency.
  pub periods_per_year: u32,
  /// Annual risk-free rate credited to cash.
  pub risk_free_rate: f64,
  /// Volume used for rows stored without volume, and for the cash column.
  pub default_volume: f64,
  /// Minimum number of past rows an estimator needs.
  pub min_history: usize,
  /// First timestamp queried from the store.
  pub start: Option<Timestamp>,
  /// Last timestamp queried from the store.
  pub end: Option<Timestamp>,
}

impl Default for DataConfig {
  fn default() -> Self {
    Self {
      periods_per_year: 252,
      risk_free_rate: 0.04,
      default_volume: 1e9,
      min_history: 2,
      start: None,
      end: None,
    }
  }
}

impl DataConfig {
  /// Per-period cash return.
  pub fn cash_return(&self) -> f64 {
    (1.0 + self.risk_free_rate).powf(1.0 / self.periods_per_year as f64) - 1.0
  }

  fn validate(&self) -> Result<()> {
    if self.periods_per_year == 0 {
      return Err(OptimizerError::Configuration(
        "periods_per_year must be positive".to_string(),
      ));
    }
    if !self.risk_free_rate.is_finite() || self.risk_free_rate <= -1.0 {
      return Err(OptimizerError::Configuration(
        "risk_free_rate must be finite and greater than -1".to_string(),
      ));
    }
    if !self.default_volume.is_finite() || self.default_volume < 0.0 {
      return Err(OptimizerError::Configuration(
        "default_volume must be finite and non-negative".to_string(),
      ));
    }
    Ok(())
  }
}

/// Price, return and volume tables over `calendar × (universe + cash)`.
#[derive(Clone, Debug)]
pub struct MarketPanel {
  universe: Universe,
  calendar: Vec<Timestamp>,
  prices: Array2<f64>,
  returns: Array2<f64>,
  volumes: Array2<f64>,
}

impl MarketPanel {
  /// Build a panel from non-cash price and volume tables (`rows × universe`).
  ///
  /// The calendar must be sorted; repeated timestamps are accepted here and rejected
  /// on lookup.
  pub fn from_tables(
    universe: Universe,
    calendar: Vec<Timestamp>,
    prices: Array2<f64>,
    volumes: Array2<f64>,
    cash_return: f64,
    cash_volume: f64,
  ) -> Result<Self> {
    let (rows, cols) = prices.dim();
    if rows != calendar.len() || cols != universe.len() {
      return Err(OptimizerError::DataIntegrity(format!(
        "price table is {rows}x{cols}, expected {}x{}",
        calendar.len(),
        universe.len()
      )));
    }
    if volumes.dim() != prices.dim() {
      return Err(OptimizerError::DataIntegrity(format!(
        "volume table is {:?}, price table is {:?}",
        volumes.dim(),
        prices.dim()
      )));
    }
    if calendar.windows(2).any(|w| w[1] < w[0]) {
      return Err(OptimizerError::DataIntegrity(
        "trading calendar is not sorted".to_string(),
      ));
    }
    if let Some(((row, col), price)) = prices
      .indexed_iter()
      .find(|(_, p)| !p.is_finite() || **p <= 0.0)
    {
      return Err(OptimizerError::DataIntegrity(format!(
        "invalid price {price} for {} at {}",
        universe.tickers()[col],
        calendar[row]
      )));
    }

    let m = cols + 1;
    let mut full_prices = Array2::<f64>::ones((rows, m));
    full_prices.slice_mut(s![.., ..cols]).assign(&prices);

    let mut full_volumes = Array2::<f64>::from_elem((rows, m), cash_volume);
    full_volumes.slice_mut(s![.., ..cols]).assign(&volumes);

    let mut returns = Array2::<f64>::zeros((rows, m));
    for t in 1..rows {
      for i in 0..cols {
        returns[[t, i]] = prices[[t, i]] / prices[[t - 1, i]] - 1.0;
      }
    }
    returns.column_mut(cols).fill(cash_return);

    Ok(Self {
      universe,
      calendar,
      prices: full_prices,
      returns,
      volumes: full_volumes,
    })
  }

  /// Outer-join per-asset series on the union of their timestamps.
  ///
  /// Prices are carried forward, volumes missing from a series are zero and stored rows
  /// without volume get `default_volume`. Leading rows where some asset has not started
  /// trading yet are dropped.
  pub fn align(universe: Universe, series: &[Vec<SeriesRow>], config: &DataConfig) -> Result<Self> {
    if series.len() != universe.len() {
      return Err(OptimizerError::DataIntegrity(format!(
        "{} series for {} tickers",
        series.len(),
        universe.len()
      )));
    }
    for (ticker, rows) in universe.tickers().iter().zip(series) {
      if rows.is_empty() {
        return Err(OptimizerError::MissingTicker(ticker.clone()));
      }
    }

    let union: BTreeSet<Timestamp> = series
      .iter()
      .flat_map(|rows| rows.iter().map(|row| row.date))
      .collect();
    let union: Vec<Timestamp> = union.into_iter().collect();

    let n = universe.len();
    let mut prices = Array2::<f64>::zeros((union.len(), n));
    let mut volumes = Array2::<f64>::zeros((union.len(), n));
    let mut first_complete = 0;
    let mut filled = 0usize;

    for (i, rows) in series.iter().enumerate() {
      let by_date: BTreeMap<Timestamp, &SeriesRow> = rows.iter().map(|r| (r.date, r)).collect();
      let mut last_price: Option<f64> = None;
      let mut first_seen: Option<usize> = None;

      for (t, date) in union.iter().enumerate() {
        match by_date.get(date) {
          Some(row) => {
            last_price = Some(row.price);
            first_seen.get_or_insert(t);
            volumes[[t, i]] = row.volume.unwrap_or(config.default_volume);
          }
          None => {
            if last_price.is_some() {
              filled += 1;
            }
          }
        }
        prices[[t, i]] = last_price.unwrap_or(f64::NAN);
      }

      first_complete = first_complete.max(first_seen.unwrap_or(0));
    }

    if first_complete > 0 {
      warn!(
        dropped = first_complete,
        first = %union[first_complete],
        "dropping leading rows before every asset has a price"
      );
    }
    if filled > 0 {
      debug!(filled, "forward-filled missing prices");
    }

    let calendar = union[first_complete..].to_vec();
    if calendar.is_empty() {
      return Err(OptimizerError::DataIntegrity(
        "aligned calendar is empty".to_string(),
      ));
    }
    let prices = prices.slice(s![first_complete.., ..]).to_owned();
    let volumes = volumes.slice(s![first_complete.., ..]).to_owned();

    Self::from_tables(
      universe,
      calendar,
      prices,
      volumes,
      config.cash_return(),
      config.default_volume,
    )
  }

  pub fn universe(&self) -> &Universe {
    &self.universe
  }

  pub fn calendar(&self) -> &[Timestamp] {
    &self.calendar
  }

  /// Prices over universe plus cash.
  pub fn prices(&self) -> &Array2<f64> {
    &self.prices
  }

  pub fn returns(&self) -> &Array2<f64> {
    &self.returns
  }

  pub fn volumes(&self) -> &Array2<f64> {
    &self.volumes
  }

  /// Row index of `t`, failing on missing or repeated timestamps.
  pub fn locate(&self, t: Timestamp) -> Result<usize> {
    let lo = self.calendar.partition_point(|d| *d < t);
    let hi = self.calendar.partition_point(|d| *d <= t);
    match hi - lo {
      0 => Err(OptimizerError::MissingTimestamp(t)),
      1 => Ok(lo),
      _ => Err(OptimizerError::DuplicateTimestamp(t)),
    }
  }
}

/// Point-in-time view of a panel.
#[derive(Clone, Debug)]
pub struct DataInstance<'a> {
  pub time: Timestamp,
  /// Returns strictly before `time`.
  pub past_returns: ArrayView2<'a, f64>,
  pub current_returns: ArrayView1<'a, f64>,
  /// Volumes strictly before `time`.
  pub past_volumes: ArrayView2<'a, f64>,
  pub current_volumes: ArrayView1<'a, f64>,
  pub current_prices: ArrayView1<'a, f64>,
}

impl DataInstance<'_> {
  /// Number of non-cash assets.
  pub fn num_assets(&self) -> usize {
    self.current_prices.len() - 1
  }

  /// Past returns of the non-cash assets.
  pub fn past_asset_returns(&self) -> ArrayView2<'_, f64> {
    self.past_returns.slice(s![.., ..self.num_assets()])
  }
}

/// Serves market data for the optimization engine.
#[derive(Clone, Debug)]
pub struct DataProvider {
  panel: MarketPanel,
  config: DataConfig,
}

impl DataProvider {
  /// Query every ticker from `store` and build an aligned panel.
  pub fn from_store<S>(store: &S, universe: Universe, config: DataConfig) -> Result<Self>
  where
    S: TimeSeriesStore + ?Sized,
  {
    config.validate()?;
    let panel = load_panel(store, universe, &config)?;
    Ok(Self { panel, config })
  }

  /// Wrap a pre-built panel.
  pub fn from_panel(panel: MarketPanel, config: DataConfig) -> Result<Self> {
    config.validate()?;
    Ok(Self { panel, config })
  }

  /// Rebuild the panel from the store, e.g. after new rows were upserted.
  pub fn refresh<S>(&mut self, store: &S) -> Result<()>
  where
    S: TimeSeriesStore + ?Sized,
  {
    self.panel = load_panel(store, self.panel.universe.clone(), &self.config)?;
    Ok(())
  }

  /// Serve data for the policy at trading time `t`.
  pub fn serve(&self, t: Timestamp) -> Result<DataInstance<'_>> {
    let pos = self.panel.locate(t)?;
    let panel = &self.panel;
    Ok(DataInstance {
      time: t,
      past_returns: panel.returns.slice(s![..pos, ..]),
      current_returns: panel.returns.row(pos),
      past_volumes: panel.volumes.slice(s![..pos, ..]),
      current_volumes: panel.volumes.row(pos),
      current_prices: panel.prices.row(pos),
    })
  }

  /// Trading calendar between `start` (inclusive) and `end`, strictly increasing.
  ///
  /// Missing bounds default to the first and last calendar entries; `include_end`
  /// only applies to an explicit `end`. A repeated timestamp in range is an error.
  pub fn trading_calendar(
    &self,
    start: Option<Timestamp>,
    end: Option<Timestamp>,
    include_end: bool,
  ) -> Result<Vec<Timestamp>> {
    let calendar = &self.panel.calendar;
    let from = match start {
      Some(t) => self.panel.locate(t)?,
      None => 0,
    };
    let to = match end {
      Some(t) => self.panel.locate(t)? + usize::from(include_end),
      None => calendar.len(),
    };
    if from >= to {
      return Ok(Vec::new());
    }
    let slice = &calendar[from..to];
    if let Some(w) = slice.windows(2).find(|w| w[0] >= w[1]) {
      return Err(OptimizerError::DuplicateTimestamp(w[1]));
    }
    Ok(slice.to_vec())
  }

  /// Most recent trading time.
  pub fn latest_time(&self) -> Result<Timestamp> {
    self
      .panel
      .calendar
      .last()
      .copied()
      .ok_or_else(|| OptimizerError::DataIntegrity("trading calendar is empty".to_string()))
  }

  pub fn periods_per_year(&self) -> u32 {
    self.config.periods_per_year
  }

  /// Per-period risk-free return credited to cash.
  pub fn cash_return(&self) -> f64 {
    self.config.cash_return()
  }

  pub fn min_history(&self) -> usize {
    self.config.min_history
  }

  pub fn universe(&self) -> &Universe {
    &self.panel.universe
  }

  /// Tickers followed by the cash label.
  pub fn full_universe(&self) -> Vec<String> {
    self.panel.universe.full_universe()
  }

  pub fn panel(&self) -> &MarketPanel {
    &self.panel
  }

  pub fn config(&self) -> &DataConfig {
    &self.config
  }
}

fn load_panel<S>(store: &S, universe: Universe, config: &DataConfig) -> Result<MarketPanel>
where
  S: TimeSeriesStore + ?Sized,
{
  let series = universe
    .tickers()
    .iter()
    .map(|ticker| store.range(ticker, config.start, config.end))
    .collect::<Result<Vec<_>>>()?;
  let panel = MarketPanel::align(universe, &series, config)?;
  info!(
    assets = panel.universe.len(),
    rows = panel.calendar.len(),
    "built market panel"
  );
  Ok(panel)
}
