//! # Optimization Engine
//!
//! $$
//! \{u(\gamma_{\text{risk}},\gamma_{\text{trade}})\;:\;\gamma_{\text{risk}}\in\Gamma_r,\ \gamma_{\text{trade}}\in\Gamma_t\},
//! \qquad |\Gamma_r\times\Gamma_t| = 70
//! $$
//!
//! Hyperparameter sweep over the rolling-horizon policy. Every grid cell builds its own
//! policy with fresh estimators; results come back in grid order, risk outer and trade
//! inner.

use std::sync::Arc;

use ndarray::Array1;
use rayon::prelude::*;
use serde::Deserialize;
use serde::Serialize;
use tracing::debug;
use tracing::info;
use tracing::info_span;
use uuid::Uuid;

use super::analytics::PortfolioAnalytics;
use super::constraints::Constraint;
use super::estimators::ForecastSource;
use super::estimators::RiskModelKind;
use super::policy::MultiPeriodOptimization;
use super::policy::TransactionCostModel;
use super::provider::DataProvider;
use super::solver::ClarabelSolver;
use super::solver::SolverSettings;
use super::types::ForecastSnapshot;
use super::types::PolicyParameters;
use super::types::Timestamp;
use super::types::TradeResult;
use crate::error::OptimizerError;
use crate::error::Result;
use crate::traits::ConicSolverExt;

/// Default risk-aversion grid.
pub const RISK_GRID: [f64; 7] = [5.0, 10.0, 20.0, 50.0, 100.0, 200.0, 500.0];

/// Default trade-aversion grid.
pub const TRADE_GRID: [f64; 10] = [0.5, 0.75, 1.0, 1.25, 1.5, 2.0, 2.5, 3.0, 4.0, 5.0];

/// Runtime configuration for [`OptimizationEngine`].
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
  /// Risk-aversion values, iterated in the outer loop.
  pub risk_grid: Vec<f64>,
  /// Trade-aversion values, iterated in the inner loop.
  pub trade_grid: Vec<f64>,
  /// Planning periods per solve.
  pub planning_horizon: usize,
  /// Add the no-short constraint to every solve.
  pub long_only: bool,
  /// Extend the no-short constraint to the cash account.
  pub long_only_includes_cash: bool,
  /// Gross non-cash exposure bound added to every solve.
  pub leverage_limit: Option<f64>,
  pub cost: TransactionCostModel,
  /// Risk model used with historical forecasts.
  pub risk_model: RiskModelKind,
  pub solver: SolverSettings,
  /// Solve grid cells on the rayon thread pool.
  pub parallel: bool,
  /// Allow the experimental risk-threshold constraint.
  pub enable_risk_threshold: bool,
  /// Dollar value of the all-cash default portfolio.
  pub notional: f64,
}

impl Default for EngineConfig {
  fn default() -> Self {
    Self {
      risk_grid: RISK_GRID.to_vec(),
      trade_grid: TRADE_GRID.to_vec(),
      planning_horizon: 6,
      long_only: true,
      long_only_includes_cash: false,
      leverage_limit: Some(1.0),
      cost: TransactionCostModel::default(),
      risk_model: RiskModelKind::default(),
      solver: SolverSettings::default(),
      parallel: false,
      enable_risk_threshold: false,
      notional: 1_000_000.0,
    }
  }
}

impl EngineConfig {
  fn validate(&self) -> Result<()> {
    let grids = [("risk_grid", &self.risk_grid), ("trade_grid", &self.trade_grid)];
    for (name, grid) in grids {
      if grid.is_empty() {
        return Err(OptimizerError::Configuration(format!("{name} must not be empty")));
      }
      if grid.iter().any(|g| !g.is_finite() || *g < 0.0) {
        return Err(OptimizerError::Configuration(format!(
          "{name} values must be finite and non-negative"
        )));
      }
    }
    if self.planning_horizon == 0 {
      return Err(OptimizerError::Configuration(
        "planning_horizon must be at least 1".to_string(),
      ));
    }
    if !self.notional.is_finite() || self.notional <= 0.0 {
      return Err(OptimizerError::Configuration(
        "notional must be finite and positive".to_string(),
      ));
    }
    Ok(())
  }
}

/// Extra constraints and execution time for one sweep.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepOptions {
  /// Execution time; the latest calendar entry when `None`.
  pub time: Option<Timestamp>,
  /// Gross annual return target, e.g. `1.06`.
  pub returns_target: Option<f64>,
  /// Annual variance bound.
  pub risk_threshold: Option<f64>,
}

/// Entry point for hyperparameter sweeps over one data snapshot.
#[derive(Clone)]
pub struct OptimizationEngine {
  data: DataProvider,
  config: EngineConfig,
  source: Option<ForecastSource>,
  solver: Arc<dyn ConicSolverExt>,
  correlation_id: Uuid,
}

impl OptimizationEngine {
  /// Construct an engine with historical forecasts and the Clarabel backend.
  pub fn new(data: DataProvider, config: EngineConfig, correlation_id: Uuid) -> Result<Self> {
    config.validate()?;
    let solver = Arc::new(ClarabelSolver::new(config.solver.clone()));
    let source = Some(ForecastSource::Historical {
      risk_model: config.risk_model,
    });
    Ok(Self {
      data,
      config,
      source,
      solver,
      correlation_id,
    })
  }

  /// Replace the forecast source. `None` leaves the engine unable to solve.
  pub fn with_forecast_source(mut self, source: Option<ForecastSource>) -> Self {
    self.source = source;
    self
  }

  /// Replace the solver backend.
  pub fn with_solver(mut self, solver: Arc<dyn ConicSolverExt>) -> Self {
    self.solver = solver;
    self
  }

  pub fn data(&self) -> &DataProvider {
    &self.data
  }

  pub fn config(&self) -> &EngineConfig {
    &self.config
  }

  pub fn correlation_id(&self) -> Uuid {
    self.correlation_id
  }

  /// All-cash holdings worth the configured notional.
  pub fn cash_only(&self) -> Array1<f64> {
    let mut h = Array1::zeros(self.data.universe().size_with_cash());
    h[self.data.universe().cash_index()] = self.config.notional;
    h
  }

  /// `(gamma_risk, gamma_trade)` pairs in sweep order.
  pub fn grid(&self) -> Vec<(f64, f64)> {
    self
      .config
      .risk_grid
      .iter()
      .flat_map(|&r| self.config.trade_grid.iter().map(move |&t| (r, t)))
      .collect()
  }

  fn source(&self) -> Result<&ForecastSource> {
    self
      .source
      .as_ref()
      .ok_or_else(|| OptimizerError::Configuration("no forecast source configured".to_string()))
  }

  fn resolve_time(&self, t: Option<Timestamp>) -> Result<Timestamp> {
    match t {
      Some(t) => Ok(t),
      None => self.data.latest_time(),
    }
  }

  /// Base constraints from the configuration plus the sweep's requests.
  pub fn constraints(&self, options: &SweepOptions) -> Result<Vec<Constraint>> {
    let mut constraints = Vec::new();
    if self.config.long_only {
      constraints.push(Constraint::LongOnly {
        include_cash: self.config.long_only_includes_cash,
      });
    }
    if let Some(limit) = self.config.leverage_limit {
      constraints.push(Constraint::LeverageLimit(limit));
    }
    if let Some(target) = options.returns_target {
      constraints.push(Constraint::ReturnsTarget(target));
    }
    if let Some(threshold) = options.risk_threshold {
      if !self.config.enable_risk_threshold {
        return Err(OptimizerError::Configuration(
          "risk threshold constraints are disabled".to_string(),
        ));
      }
      constraints.push(Constraint::RiskThreshold(threshold));
    }
    for constraint in &constraints {
      constraint.validate()?;
    }
    Ok(constraints)
  }

  /// Fresh single-use policy for one grid cell.
  pub fn make_policy(
    &self,
    gamma_risk: f64,
    gamma_trade: f64,
    constraints: Vec<Constraint>,
  ) -> Result<MultiPeriodOptimization> {
    let source = self.source()?;
    Ok(MultiPeriodOptimization::new(
      source.make_returns_forecast(&self.data),
      source.make_risk_model(&self.data),
      PolicyParameters {
        gamma_risk,
        gamma_trade,
        planning_horizon: self.config.planning_horizon,
        constraints,
      },
      self.config.cost.clone(),
      Arc::clone(&self.solver),
    ))
  }

  /// Run the full grid from holdings `h`. Any failing cell aborts the sweep.
  pub fn execute(&self, h: &Array1<f64>, options: &SweepOptions) -> Result<Vec<TradeResult>> {
    let t = self.resolve_time(options.time)?;
    let span = info_span!("sweep", correlation_id = %self.correlation_id, %t);
    let _enter = span.enter();

    self.source()?;
    let constraints = self.constraints(options)?;
    let grid = self.grid();
    info!(
      cells = grid.len(),
      parallel = self.config.parallel,
      constraints = constraints.len(),
      "starting sweep"
    );

    let solve_cell = |&(gamma_risk, gamma_trade): &(f64, f64)| {
      span.in_scope(|| {
        debug!(gamma_risk, gamma_trade, "solving grid cell");
        self
          .make_policy(gamma_risk, gamma_trade, constraints.clone())?
          .execute(h, &self.data, t)
      })
    };

    let results = if self.config.parallel {
      grid.par_iter().map(solve_cell).collect::<Result<Vec<_>>>()
    } else {
      grid.iter().map(solve_cell).collect::<Result<Vec<_>>>()
    }?;

    info!(results = results.len(), "sweep finished");
    Ok(results)
  }

  /// Expected returns and covariance at `t` (latest when `None`).
  pub fn snapshot(&self, t: Option<Timestamp>) -> Result<ForecastSnapshot> {
    let t = self.resolve_time(t)?;
    let source = self.source()?;
    let instance = self.data.serve(t)?;
    let returns = source
      .make_returns_forecast(&self.data)
      .estimate(&instance, 0, true)?;
    let covariance = source.make_risk_model(&self.data).estimate(&instance)?;
    Ok(ForecastSnapshot {
      time: t,
      returns,
      covariance,
    })
  }

  /// Analytics over the snapshot at `t` (latest when `None`).
  pub fn analytics(&self, t: Option<Timestamp>) -> Result<PortfolioAnalytics> {
    Ok(PortfolioAnalytics::new(
      self.snapshot(t)?,
      self.data.periods_per_year(),
    ))
  }
}
