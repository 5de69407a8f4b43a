//! # Portfolio Types
//!
//! $$
//! \mathbf{h} = (h_1,\dots,h_N,h_{\text{cash}}),\qquad \mathbf{1}^\top\mathbf{u}=0
//! $$
//!
//! Universe, holdings, forecast snapshots and trade results shared by the pipeline.

use chrono::DateTime;
use chrono::Utc;
use ndarray::Array1;
use ndarray::Array2;
use serde::Deserialize;
use serde::Serialize;

use super::constraints::Constraint;
use crate::error::OptimizerError;
use crate::error::Result;

/// Trading time.
pub type Timestamp = DateTime<Utc>;

/// Label of the synthetic cash asset, always the last slot of the universe.
pub const CASH_TICKER: &str = "USDOLLAR";

/// Ordered, duplicate-free set of tradable assets. Cash is implicit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Universe {
  tickers: Vec<String>,
}

impl Universe {
  /// Build a universe, coercing tickers to uppercase.
  pub fn new<I, S>(tickers: I) -> Result<Self>
  where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
  {
    let mut out: Vec<String> = Vec::new();
    for ticker in tickers {
      let ticker = ticker.as_ref().trim().to_uppercase();
      if ticker.is_empty() {
        return Err(OptimizerError::validation("tickers", "ticker must not be empty"));
      }
      if ticker == CASH_TICKER {
        return Err(OptimizerError::validation(
          "tickers",
          format!("{CASH_TICKER} is reserved for the cash account"),
        ));
      }
      if out.contains(&ticker) {
        return Err(OptimizerError::validation(
          "tickers",
          format!("duplicate ticker {ticker}"),
        ));
      }
      out.push(ticker);
    }

    if out.is_empty() {
      return Err(OptimizerError::validation(
        "tickers",
        "at least one ticker is required",
      ));
    }

    Ok(Self { tickers: out })
  }

  /// Non-cash tickers in universe order.
  pub fn tickers(&self) -> &[String] {
    &self.tickers
  }

  /// Number of non-cash assets.
  pub fn len(&self) -> usize {
    self.tickers.len()
  }

  pub fn is_empty(&self) -> bool {
    self.tickers.is_empty()
  }

  /// Number of assets including cash.
  pub fn size_with_cash(&self) -> usize {
    self.tickers.len() + 1
  }

  /// Index of the cash slot.
  pub fn cash_index(&self) -> usize {
    self.tickers.len()
  }

  /// Tickers followed by the cash label.
  pub fn full_universe(&self) -> Vec<String> {
    let mut labels = self.tickers.clone();
    labels.push(CASH_TICKER.to_string());
    labels
  }
}

/// Expected returns and risk for one trading time.
#[derive(Clone, Debug)]
pub struct ForecastSnapshot {
  /// Trading time the snapshot was computed for.
  pub time: Timestamp,
  /// Per-period expected returns over universe plus cash.
  pub returns: Array1<f64>,
  /// Per-period covariance over the non-cash universe.
  pub covariance: Array2<f64>,
}

/// Hyperparameters and constraint set for a single solve.
#[derive(Clone, Debug)]
pub struct PolicyParameters {
  pub gamma_risk: f64,
  pub gamma_trade: f64,
  /// Number of planning periods, at least one.
  pub planning_horizon: usize,
  pub constraints: Vec<Constraint>,
}

impl PolicyParameters {
  pub fn validate(&self) -> Result<()> {
    if !self.gamma_risk.is_finite() || self.gamma_risk < 0.0 {
      return Err(OptimizerError::validation(
        "gamma_risk",
        "must be finite and non-negative",
      ));
    }
    if !self.gamma_trade.is_finite() || self.gamma_trade < 0.0 {
      return Err(OptimizerError::validation(
        "gamma_trade",
        "must be finite and non-negative",
      ));
    }
    if self.planning_horizon == 0 {
      return Err(OptimizerError::validation(
        "planning_horizon",
        "must be at least 1",
      ));
    }
    Ok(())
  }
}

/// Output of one policy execution.
#[derive(Clone, Debug, Serialize)]
pub struct TradeResult {
  /// Dollar trades over universe plus cash. Sums to zero.
  pub trades: Array1<f64>,
  /// Execution time.
  pub time: Timestamp,
  /// Whole shares traded per non-cash asset.
  pub shares_traded: Vec<i64>,
  pub gamma_risk: f64,
  pub gamma_trade: f64,
}

impl TradeResult {
  /// Post-trade holdings `h + u`.
  pub fn post_trade(&self, h: &Array1<f64>) -> Array1<f64> {
    h + &self.trades
  }
}

/// Check a holdings vector against the universe and return its net value.
pub(crate) fn holdings_value(universe: &Universe, h: &Array1<f64>) -> Result<f64> {
  if h.len() != universe.size_with_cash() {
    return Err(OptimizerError::validation(
      "holdings",
      format!(
        "expected {} values (one per asset plus cash), got {}",
        universe.size_with_cash(),
        h.len()
      ),
    ));
  }
  if h.iter().any(|x| !x.is_finite()) {
    return Err(OptimizerError::validation(
      "holdings",
      "values must be finite",
    ));
  }
  let value = h.sum();
  if value <= 0.0 {
    return Err(OptimizerError::validation(
      "holdings",
      format!("portfolio value must be positive, got {value}"),
    ));
  }
  Ok(value)
}
