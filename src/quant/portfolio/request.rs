//! # Optimization Requests
//!
//! $$
//! \text{request}\;\xrightarrow{\text{validate}}\;(\mathcal U, h, R, S, \hat r, \hat\Sigma)
//! \;\xrightarrow{\text{sweep}}\;\{(u, R_{\text{ann}}, \sigma^2_{\text{ann}})\}
//! $$
//!
//! Caller-facing request boundary: shape validation, then one annotated sweep.

use ndarray::Array1;
use ndarray::Array2;
use serde::Deserialize;
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use super::analytics::AnnotatedTrade;
use super::engine::EngineConfig;
use super::engine::OptimizationEngine;
use super::engine::SweepOptions;
use super::estimators::ForecastSource;
use super::provider::DataConfig;
use super::provider::DataProvider;
use super::types::Universe;
use crate::error::OptimizerError;
use crate::error::Result;
use crate::traits::TimeSeriesStore;

/// One sweep request. Optional fields fall back to engine defaults.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizationRequest {
  pub tickers: Vec<String>,
  /// Dollars per ticker followed by cash. All cash when absent.
  pub holdings: Option<Vec<f64>>,
  /// Gross annual return target, e.g. `1.06`.
  pub returns_target: Option<f64>,
  /// Annual variance bound.
  pub risk_threshold: Option<f64>,
  /// Two rows of per-period expected returns (now, next), one column per ticker.
  pub returns_forecast: Option<Vec<Vec<f64>>>,
  /// Per-period covariance over the tickers.
  pub covariance: Option<Vec<Vec<f64>>>,
}

impl OptimizationRequest {
  pub fn from_json(body: &str) -> Result<Self> {
    Ok(serde_json::from_str(body)?)
  }

  /// Check shapes and values. The error names the first offending field.
  pub fn validate(&self) -> Result<Universe> {
    let universe = Universe::new(&self.tickers)?;
    let n = universe.len();

    if let Some(holdings) = &self.holdings {
      if holdings.len() != n + 1 {
        return Err(OptimizerError::validation(
          "holdings",
          format!("expected {} values (tickers plus cash), got {}", n + 1, holdings.len()),
        ));
      }
      if holdings.iter().any(|h| !h.is_finite()) {
        return Err(OptimizerError::validation("holdings", "values must be finite"));
      }
      if holdings.iter().sum::<f64>() <= 0.0 {
        return Err(OptimizerError::validation(
          "holdings",
          "portfolio value must be positive",
        ));
      }
    }

    check_positive("returns_target", self.returns_target)?;
    check_positive("risk_threshold", self.risk_threshold)?;

    match (&self.returns_forecast, &self.covariance) {
      (Some(returns), Some(covariance)) => {
        check_matrix("returns_forecast", returns, 2, n)?;
        check_matrix("covariance", covariance, n, n)?;
      }
      (Some(_), None) => {
        return Err(OptimizerError::validation(
          "covariance",
          "required when returns_forecast is supplied",
        ))
      }
      (None, Some(_)) => {
        return Err(OptimizerError::validation(
          "returns_forecast",
          "required when covariance is supplied",
        ))
      }
      (None, None) => {}
    }

    Ok(universe)
  }

  /// Caller-supplied forecasts, if any.
  pub fn forecast_source(&self, universe: &Universe) -> Result<Option<ForecastSource>> {
    match (&self.returns_forecast, &self.covariance) {
      (Some(returns), Some(covariance)) => Ok(Some(ForecastSource::supplied(
        universe,
        to_array("returns_forecast", returns)?,
        to_array("covariance", covariance)?,
      )?)),
      _ => Ok(None),
    }
  }
}

fn check_positive(field: &str, value: Option<f64>) -> Result<()> {
  match value {
    Some(v) if !v.is_finite() || v <= 0.0 => Err(OptimizerError::validation(
      field,
      format!("must be finite and positive, got {v}"),
    )),
    _ => Ok(()),
  }
}

fn check_matrix(field: &str, rows: &[Vec<f64>], nrows: usize, ncols: usize) -> Result<()> {
  if rows.len() != nrows {
    return Err(OptimizerError::validation(
      field,
      format!("expected {nrows} rows, got {}", rows.len()),
    ));
  }
  for (i, row) in rows.iter().enumerate() {
    if row.len() != ncols {
      return Err(OptimizerError::validation(
        format!("{field}[{i}]"),
        format!("expected {ncols} values, got {}", row.len()),
      ));
    }
    if row.iter().any(|v| !v.is_finite()) {
      return Err(OptimizerError::validation(
        format!("{field}[{i}]"),
        "values must be finite",
      ));
    }
  }
  Ok(())
}

fn to_array(field: &str, rows: &[Vec<f64>]) -> Result<Array2<f64>> {
  let ncols = rows.first().map_or(0, Vec::len);
  let flat: Vec<f64> = rows.iter().flatten().copied().collect();
  Array2::from_shape_vec((rows.len(), ncols), flat)
    .map_err(|e| OptimizerError::validation(field, e.to_string()))
}

/// Validate `request`, load its universe from `store` and run one annotated sweep.
pub fn run_request<S>(
  store: &S,
  request: &OptimizationRequest,
  data_config: DataConfig,
  engine_config: EngineConfig,
  correlation_id: Uuid,
) -> Result<Vec<AnnotatedTrade>>
where
  S: TimeSeriesStore + ?Sized,
{
  let universe = request.validate()?;
  let source = request.forecast_source(&universe)?;
  info!(
    %correlation_id,
    tickers = universe.len(),
    supplied_forecast = source.is_some(),
    "optimization request accepted"
  );

  let data = DataProvider::from_store(store, universe, data_config)?;
  let mut engine = OptimizationEngine::new(data, engine_config, correlation_id)?;
  if source.is_some() {
    engine = engine.with_forecast_source(source);
  }

  let h = match &request.holdings {
    Some(holdings) => Array1::from_vec(holdings.clone()),
    None => engine.cash_only(),
  };
  let t = engine.data().latest_time()?;
  let options = SweepOptions {
    time: Some(t),
    returns_target: request.returns_target,
    risk_threshold: request.risk_threshold,
  };

  let trades = engine.execute(&h, &options)?;
  let analytics = engine.analytics(Some(t))?;
  trades
    .into_iter()
    .map(|trade| analytics.annotate(trade, &h))
    .collect()
}
