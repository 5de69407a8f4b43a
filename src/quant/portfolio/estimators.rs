//! # Forecast & Risk Estimators
//!
//! $$
//! \hat r_{t+k} = \frac1{T}\sum_{s<t} r_s \;\text{ or supplied},\qquad
//! \hat\Sigma_t = \operatorname{cov}(r_{s<t}) \;\text{ or } V_k\Lambda_kV_k^\top + D
//! $$
//!
//! Estimators are produced fresh by a [`ForecastSource`] for every solve. They are not
//! `Clone`; a policy takes them by value and consumes them when it runs.

use ndarray::Array1;
use ndarray::Array2;
use ndarray::Axis;
use ndarray::concatenate;
use serde::Deserialize;
use serde::Serialize;

use super::data::factor_model_covariance;
use super::data::is_symmetric;
use super::data::mean_returns;
use super::data::min_eigenvalue;
use super::data::sample_covariance;
use super::provider::DataInstance;
use super::provider::DataProvider;
use super::types::Universe;
use crate::error::OptimizerError;
use crate::error::Result;

/// Relative tolerance on negative eigenvalues of a supplied covariance.
const PSD_TOL: f64 = 1e-10;

/// Covariance estimator used with historical forecasts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RiskModelKind {
  /// Sample covariance of past returns.
  FullCovariance,
  /// Leading principal components plus a diagonal residual.
  FactorModel { num_factors: usize },
}

impl Default for RiskModelKind {
  fn default() -> Self {
    RiskModelKind::FactorModel { num_factors: 10 }
  }
}

/// Factory for per-solve estimators.
#[derive(Clone, Debug)]
pub enum ForecastSource {
  /// Estimate from the served history.
  Historical { risk_model: RiskModelKind },
  /// Caller-provided forecasts over the non-cash universe.
  Supplied {
    /// Expected per-period returns for the current period.
    now: Array1<f64>,
    /// Expected per-period returns for every later period.
    next: Array1<f64>,
    covariance: Array2<f64>,
  },
}

impl Default for ForecastSource {
  fn default() -> Self {
    ForecastSource::Historical {
      risk_model: RiskModelKind::default(),
    }
  }
}

impl ForecastSource {
  /// Validated caller override: `returns` is `2 × N` (now, next), `covariance` is `N × N`.
  pub fn supplied(universe: &Universe, returns: Array2<f64>, covariance: Array2<f64>) -> Result<Self> {
    let n = universe.len();
    if returns.dim() != (2, n) {
      return Err(OptimizerError::validation(
        "returns_forecast",
        format!("expected 2x{n}, got {:?}", returns.dim()),
      ));
    }
    if returns.iter().any(|r| !r.is_finite()) {
      return Err(OptimizerError::validation(
        "returns_forecast",
        "values must be finite",
      ));
    }
    check_covariance(&covariance, n)?;

    Ok(ForecastSource::Supplied {
      now: returns.row(0).to_owned(),
      next: returns.row(1).to_owned(),
      covariance,
    })
  }

  pub fn make_returns_forecast(&self, data: &DataProvider) -> ReturnsForecast {
    let kind = match self {
      ForecastSource::Historical { .. } => ReturnsKind::HistoricalMean,
      ForecastSource::Supplied { now, next, .. } => ReturnsKind::Supplied {
        now: now.clone(),
        next: next.clone(),
      },
    };
    ReturnsForecast {
      kind,
      cash_return: data.cash_return(),
      min_history: data.min_history(),
    }
  }

  pub fn make_risk_model(&self, data: &DataProvider) -> RiskModel {
    let kind = match self {
      ForecastSource::Historical {
        risk_model: RiskModelKind::FullCovariance,
      } => RiskKind::Full,
      ForecastSource::Historical {
        risk_model: RiskModelKind::FactorModel { num_factors },
      } => RiskKind::Factor(*num_factors),
      ForecastSource::Supplied { covariance, .. } => RiskKind::Supplied(covariance.clone()),
    };
    RiskModel {
      kind,
      min_history: data.min_history(),
    }
  }
}

fn check_covariance(covariance: &Array2<f64>, n: usize) -> Result<()> {
  if covariance.dim() != (n, n) {
    return Err(OptimizerError::validation(
      "covariance",
      format!("expected {n}x{n}, got {:?}", covariance.dim()),
    ));
  }
  if covariance.iter().any(|c| !c.is_finite()) {
    return Err(OptimizerError::validation("covariance", "values must be finite"));
  }
  if !is_symmetric(covariance, 1e-9) {
    return Err(OptimizerError::validation("covariance", "matrix must be symmetric"));
  }
  let scale = covariance.iter().fold(0.0_f64, |acc, c| acc.max(c.abs()));
  let smallest = min_eigenvalue(covariance);
  if smallest < -PSD_TOL * scale {
    return Err(OptimizerError::validation(
      "covariance",
      format!("matrix must be positive semidefinite, smallest eigenvalue is {smallest:e}"),
    ));
  }
  Ok(())
}

fn check_history(instance: &DataInstance<'_>, min_history: usize) -> Result<()> {
  let available = instance.past_returns.nrows();
  if available < min_history {
    return Err(OptimizerError::InsufficientHistory {
      time: instance.time,
      available,
      required: min_history,
    });
  }
  Ok(())
}

#[derive(Debug)]
enum ReturnsKind {
  HistoricalMean,
  Supplied { now: Array1<f64>, next: Array1<f64> },
}

/// Expected-return estimator for one solve.
#[derive(Debug)]
pub struct ReturnsForecast {
  kind: ReturnsKind,
  cash_return: f64,
  min_history: usize,
}

impl ReturnsForecast {
  /// Expected per-period returns for planning `period`, over universe plus cash when
  /// `include_cash`.
  pub fn estimate(
    &self,
    instance: &DataInstance<'_>,
    period: usize,
    include_cash: bool,
  ) -> Result<Array1<f64>> {
    let n = instance.num_assets();
    let assets = match &self.kind {
      ReturnsKind::HistoricalMean => {
        check_history(instance, self.min_history)?;
        mean_returns(instance.past_asset_returns())
      }
      ReturnsKind::Supplied { now, next } => {
        let row = if period == 0 { now } else { next };
        if row.len() != n {
          return Err(OptimizerError::validation(
            "returns_forecast",
            format!("expected {n} values, got {}", row.len()),
          ));
        }
        row.clone()
      }
    };

    if !include_cash {
      return Ok(assets);
    }
    let cash = Array1::from_elem(1, self.cash_return);
    concatenate(Axis(0), &[assets.view(), cash.view()])
      .map_err(|e| OptimizerError::DataIntegrity(e.to_string()))
  }
}

#[derive(Debug)]
enum RiskKind {
  Full,
  Factor(usize),
  Supplied(Array2<f64>),
}

/// Covariance estimator for one solve.
#[derive(Debug)]
pub struct RiskModel {
  kind: RiskKind,
  min_history: usize,
}

impl RiskModel {
  /// Per-period covariance over the non-cash universe.
  pub fn estimate(&self, instance: &DataInstance<'_>) -> Result<Array2<f64>> {
    let n = instance.num_assets();
    match &self.kind {
      RiskKind::Full => {
        check_history(instance, self.min_history)?;
        Ok(sample_covariance(instance.past_asset_returns()))
      }
      RiskKind::Factor(k) => {
        check_history(instance, self.min_history)?;
        let full = sample_covariance(instance.past_asset_returns());
        Ok(factor_model_covariance(&full, *k))
      }
      RiskKind::Supplied(covariance) => {
        check_covariance(covariance, n)?;
        Ok(covariance.clone())
      }
    }
  }
}
