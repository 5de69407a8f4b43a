//! # Multi-Period Optimization
//!
//! $$
//! \max_{z_0,\dots,z_{H-1}} \sum_{k=0}^{H-1} \hat r_k^\top w^+_k
//!   - \gamma_{\text{risk}}\, w^{+\top}_{k,1:N}\Sigma\, w^+_{k,1:N}
//!   - \gamma_{\text{trade}} \sum_i \left(a|z_{k,i}| + b_i z_{k,i}^2\right),
//! \qquad w^+_k = w^+_{k-1} + z_k,\ \mathbf 1^\top z_k = 0
//! $$
//!
//! Rolling-horizon policy: plan `H` periods ahead, apply only the first trade.

use std::iter;
use std::sync::Arc;

use ndarray::Array1;
use ndarray::Array2;
use serde::Deserialize;
use serde::Serialize;
use tracing::debug;

use super::constraints::PeriodContext;
use super::estimators::ReturnsForecast;
use super::estimators::RiskModel;
use super::provider::DataInstance;
use super::provider::DataProvider;
use super::solver::ConicProgram;
use super::solver::LinearExpr;
use super::solver::VarBlock;
use super::types::PolicyParameters;
use super::types::Timestamp;
use super::types::TradeResult;
use super::types::holdings_value;
use crate::error::OptimizerError;
use crate::error::Result;
use crate::traits::ConicSolverExt;

/// Per-asset trading cost in weight units.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionCostModel {
  /// Linear cost per unit of traded weight.
  pub half_spread: f64,
  /// Scale of the volume-adjusted quadratic market impact.
  pub impact: f64,
}

impl Default for TransactionCostModel {
  fn default() -> Self {
    Self {
      half_spread: 2e-4,
      impact: 1.0,
    }
  }
}

impl TransactionCostModel {
  /// Quadratic impact coefficients `b_i = impact·σ_i·v / (p_i·V_i)` over the non-cash universe.
  pub fn impact_coefficients(
    &self,
    instance: &DataInstance<'_>,
    covariance: &Array2<f64>,
    value: f64,
  ) -> Array1<f64> {
    let n = instance.num_assets();
    Array1::from_shape_fn(n, |i| {
      let dollar_volume = instance.current_prices[i] * instance.current_volumes[i];
      if dollar_volume <= 0.0 || !dollar_volume.is_finite() {
        return 0.0;
      }
      let sigma = covariance[[i, i]].max(0.0).sqrt();
      self.impact * sigma * value / dollar_volume
    })
  }

  fn validate(&self) -> Result<()> {
    if !self.half_spread.is_finite() || self.half_spread < 0.0 {
      return Err(OptimizerError::Configuration(
        "half_spread must be finite and non-negative".to_string(),
      ));
    }
    if !self.impact.is_finite() || self.impact < 0.0 {
      return Err(OptimizerError::Configuration(
        "impact must be finite and non-negative".to_string(),
      ));
    }
    Ok(())
  }
}

/// Single-use rolling-horizon policy.
pub struct MultiPeriodOptimization {
  returns_forecast: ReturnsForecast,
  risk_model: RiskModel,
  params: PolicyParameters,
  cost: TransactionCostModel,
  solver: Arc<dyn ConicSolverExt>,
}

impl MultiPeriodOptimization {
  pub fn new(
    returns_forecast: ReturnsForecast,
    risk_model: RiskModel,
    params: PolicyParameters,
    cost: TransactionCostModel,
    solver: Arc<dyn ConicSolverExt>,
  ) -> Self {
    Self {
      returns_forecast,
      risk_model,
      params,
      cost,
      solver,
    }
  }

  pub fn params(&self) -> &PolicyParameters {
    &self.params
  }

  /// Trade from holdings `h` (dollars, cash last) at trading time `t`.
  pub fn execute(self, h: &Array1<f64>, data: &DataProvider, t: Timestamp) -> Result<TradeResult> {
    self.params.validate()?;
    self.cost.validate()?;
    for constraint in &self.params.constraints {
      constraint.validate()?;
    }

    let universe = data.universe();
    let n = universe.len();
    let value = holdings_value(universe, h)?;
    let instance = data.serve(t)?;

    let covariance = self.risk_model.estimate(&instance)?;
    let forecasts = (0..self.params.planning_horizon)
      .map(|k| self.returns_forecast.estimate(&instance, k, true))
      .collect::<Result<Vec<_>>>()?;
    let impact = self.cost.impact_coefficients(&instance, &covariance, value);

    let (program, first_trade) =
      self.build_program(h / value, &forecasts, &covariance, &impact, data.periods_per_year())?;
    let (gamma_risk, gamma_trade) = (self.params.gamma_risk, self.params.gamma_trade);
    let solution = self
      .solver
      .solve(&program)
      .map_err(|e| match e {
        err @ OptimizerError::Solver { .. } => err,
        other => OptimizerError::Solver {
          gamma_risk,
          gamma_trade,
          reason: format!("{}: {other}", self.solver.name()),
        },
      })?;
    if !solution.status.is_optimal() {
      return Err(OptimizerError::Solver {
        gamma_risk,
        gamma_trade,
        reason: format!("{} {}", self.solver.name(), solution.status),
      });
    }
    if solution.x.len() != program.num_vars() {
      return Err(OptimizerError::Solver {
        gamma_risk,
        gamma_trade,
        reason: format!(
          "{} returned {} values for {} variables",
          self.solver.name(),
          solution.x.len(),
          program.num_vars()
        ),
      });
    }

    let trades = Array1::from_shape_fn(n + 1, |i| solution.x[first_trade.at(i)] * value);
    let shares_traded = (0..n)
      .map(|i| (trades[i] / instance.current_prices[i]).round() as i64)
      .collect();

    debug!(
      gamma_risk,
      gamma_trade,
      iterations = solution.iterations,
      objective = solution.objective,
      net_trade = trades.sum(),
      "policy solved"
    );

    Ok(TradeResult {
      trades,
      time: t,
      shares_traded,
      gamma_risk,
      gamma_trade,
    })
  }

  /// Assemble the `H`-period program. Returns it with the period-0 trade block.
  fn build_program(
    &self,
    w0: Array1<f64>,
    forecasts: &[Array1<f64>],
    covariance: &Array2<f64>,
    impact: &Array1<f64>,
    periods_per_year: u32,
  ) -> Result<(ConicProgram, VarBlock)> {
    let n = covariance.nrows();
    let m = n + 1;
    let gamma_trade = self.params.gamma_trade;

    let mut program = ConicProgram::new();
    let mut first_trade = None;
    let mut previous: Option<VarBlock> = None;

    for (period, returns) in forecasts.iter().enumerate() {
      let z = program.add_variables(m);
      let w_plus = program.add_variables(m);
      let abs_z = program.add_variables(n);

      for i in 0..m {
        let expr = LinearExpr::new()
          .term(w_plus.at(i), 1.0)
          .term(z.at(i), -1.0);
        match previous {
          Some(prev) => program.equal(expr.term(prev.at(i), -1.0), 0.0),
          None => program.equal(expr, w0[i]),
        }
      }
      program.equal(LinearExpr::dot(z, iter::repeat(1.0)), 0.0);

      for i in 0..m {
        program.add_linear_cost(w_plus.at(i), -returns[i]);
      }
      let risky: Vec<usize> = (0..n).map(|i| w_plus.at(i)).collect();
      program.add_quadratic_form(&risky, covariance, self.params.gamma_risk);

      for i in 0..n {
        let (a, zi) = (abs_z.at(i), z.at(i));
        program.at_least(LinearExpr::new().term(a, 1.0).term(zi, -1.0), 0.0);
        program.at_least(LinearExpr::new().term(a, 1.0).term(zi, 1.0), 0.0);
        program.add_linear_cost(a, gamma_trade * self.cost.half_spread);
        program.add_quadratic_cost(zi, zi, gamma_trade * impact[i]);
      }

      let ctx = PeriodContext {
        period,
        w_plus,
        z,
        returns,
        covariance,
        periods_per_year,
      };
      for constraint in &self.params.constraints {
        constraint.compile(&mut program, &ctx)?;
      }

      first_trade.get_or_insert(z);
      previous = Some(w_plus);
    }

    let first_trade = first_trade.ok_or_else(|| {
      OptimizerError::validation("planning_horizon", "must be at least 1")
    })?;
    Ok((program, first_trade))
  }
}

#[cfg(test)]
mod tests {
  use approx::assert_abs_diff_eq;
  use chrono::Duration;
  use ndarray::array;

  use super::*;
  use crate::quant::portfolio::constraints::Constraint;
  use crate::quant::portfolio::estimators::ForecastSource;
  use crate::quant::portfolio::provider::DataConfig;
  use crate::quant::portfolio::provider::MarketPanel;
  use crate::quant::portfolio::solver::ClarabelSolver;
  use crate::quant::portfolio::solver::ConicSolution;
  use crate::quant::portfolio::solver::SolveStatus;
  use crate::quant::portfolio::store::oldest_entry_date;
  use crate::quant::portfolio::types::Universe;

  fn day(d: i64) -> Timestamp {
    oldest_entry_date() + Duration::days(d)
  }

  /// Two assets with a steady up-trend in the first one.
  fn provider() -> DataProvider {
    let universe = Universe::new(["UP", "FLAT"]).unwrap();
    let rows = 40;
    let calendar = (0..rows as i64).map(day).collect();
    let prices = Array2::from_shape_fn((rows, 2), |(t, j)| {
      if j == 0 {
        100.0 * (1.0 + 0.002 * t as f64 + if t % 2 == 0 { 0.001 } else { 0.0 })
      } else {
        50.0 * (1.0 + if t % 3 == 0 { 0.002 } else { -0.001 })
      }
    });
    let volumes = Array2::from_elem((rows, 2), 1e7);
    let config = DataConfig::default();
    let panel = MarketPanel::from_tables(
      universe,
      calendar,
      prices,
      volumes,
      config.cash_return(),
      config.default_volume,
    )
    .unwrap();
    DataProvider::from_panel(panel, config).unwrap()
  }

  fn policy(
    data: &DataProvider,
    gamma_risk: f64,
    gamma_trade: f64,
    constraints: Vec<Constraint>,
  ) -> MultiPeriodOptimization {
    let source = ForecastSource::default();
    MultiPeriodOptimization::new(
      source.make_returns_forecast(data),
      source.make_risk_model(data),
      PolicyParameters {
        gamma_risk,
        gamma_trade,
        planning_horizon: 3,
        constraints,
      },
      TransactionCostModel::default(),
      Arc::new(ClarabelSolver::default()),
    )
  }

  #[test]
  fn trades_are_self_financing_and_long_only() -> anyhow::Result<()> {
    let data = provider();
    let h = array![0.0, 0.0, 1_000_000.0];
    let t = day(39);
    let result = policy(
      &data,
      5.0,
      1.0,
      vec![
        Constraint::LongOnly { include_cash: false },
        Constraint::LeverageLimit(1.0),
      ],
    )
    .execute(&h, &data, t)?;

    assert_eq!(result.time, t);
    assert_eq!(result.trades.len(), 3);
    assert!(result.trades.sum().abs() < 1e-3);
    let post = result.post_trade(&h);
    assert!(post[0] >= -1e-3 && post[1] >= -1e-3);
    assert!((post[0].abs() + post[1].abs()) / 1_000_000.0 <= 1.0 + 1e-6);
    // The trending asset is bought.
    assert!(result.trades[0] > 1_000.0);
    assert_eq!(result.shares_traded.len(), 2);
    Ok(())
  }

  #[test]
  fn returns_target_binds_when_requested() -> anyhow::Result<()> {
    let data = provider();
    let h = array![0.0, 0.0, 1_000_000.0];
    let t = day(39);
    let target = 1.10;
    let result = policy(
      &data,
      500.0,
      5.0,
      vec![
        Constraint::LongOnly { include_cash: false },
        Constraint::LeverageLimit(1.0),
        Constraint::ReturnsTarget(target),
      ],
    )
    .execute(&h, &data, t)?;

    let instance = data.serve(t)?;
    let r_hat = ForecastSource::default()
      .make_returns_forecast(&data)
      .estimate(&instance, 0, false)?;
    let post = result.post_trade(&h);
    let asset_return: f64 = (0..2).map(|i| r_hat[i] * post[i] / 1_000_000.0).sum();
    let per_period = target.powf(1.0 / 252.0) - 1.0;
    assert!(asset_return >= per_period - 1e-7);
    Ok(())
  }

  #[test]
  fn non_positive_portfolio_value_is_rejected() {
    let data = provider();
    let err = policy(&data, 5.0, 1.0, Vec::new())
      .execute(&array![0.0, 0.0, 0.0], &data, day(39))
      .unwrap_err();
    assert!(matches!(err, OptimizerError::Validation { ref field, .. } if field == "holdings"));
  }

  #[test]
  fn impact_coefficients_skip_zero_volume() {
    let data = provider();
    let instance = data.serve(day(39)).unwrap();
    let cov = array![[4e-4, 0.0], [0.0, 1e-4]];
    let b = TransactionCostModel::default().impact_coefficients(&instance, &cov, 1e6);
    let p0 = instance.current_prices[0];
    assert_abs_diff_eq!(b[0], 0.02 * 1e6 / (p0 * 1e7), epsilon = 1e-15);
    assert!(b[1] > 0.0);
  }

  struct FailingSolver;

  impl ConicSolverExt for FailingSolver {
    fn name(&self) -> &str {
      "failing"
    }

    fn solve(&self, program: &ConicProgram) -> Result<ConicSolution> {
      Ok(ConicSolution {
        status: SolveStatus::Infeasible,
        x: vec![0.0; program.num_vars()],
        objective: 0.0,
        iterations: 0,
      })
    }
  }

  #[test]
  fn solver_failure_carries_hyperparameters() {
    let data = provider();
    let source = ForecastSource::default();
    let err = MultiPeriodOptimization::new(
      source.make_returns_forecast(&data),
      source.make_risk_model(&data),
      PolicyParameters {
        gamma_risk: 20.0,
        gamma_trade: 2.5,
        planning_horizon: 2,
        constraints: Vec::new(),
      },
      TransactionCostModel::default(),
      Arc::new(FailingSolver),
    )
    .execute(&array![0.0, 0.0, 1.0], &data, day(39))
    .unwrap_err();

    match err {
      OptimizerError::Solver {
        gamma_risk,
        gamma_trade,
        reason,
      } => {
        assert_eq!((gamma_risk, gamma_trade), (20.0, 2.5));
        assert!(reason.contains("infeasible"));
      }
      other => panic!("unexpected error {other}"),
    }
  }

  struct ErroringSolver;

  impl ConicSolverExt for ErroringSolver {
    fn name(&self) -> &str {
      "erroring"
    }

    fn solve(&self, _program: &ConicProgram) -> Result<ConicSolution> {
      Err(OptimizerError::Configuration("backend unavailable".to_string()))
    }
  }

  #[test]
  fn solver_errors_are_tagged_with_hyperparameters() {
    let data = provider();
    let source = ForecastSource::default();
    let err = MultiPeriodOptimization::new(
      source.make_returns_forecast(&data),
      source.make_risk_model(&data),
      PolicyParameters {
        gamma_risk: 50.0,
        gamma_trade: 0.5,
        planning_horizon: 2,
        constraints: Vec::new(),
      },
      TransactionCostModel::default(),
      Arc::new(ErroringSolver),
    )
    .execute(&array![0.0, 0.0, 1.0], &data, day(39))
    .unwrap_err();

    match err {
      OptimizerError::Solver {
        gamma_risk,
        gamma_trade,
        reason,
      } => {
        assert_eq!((gamma_risk, gamma_trade), (50.0, 0.5));
        assert!(reason.contains("erroring") && reason.contains("backend unavailable"));
      }
      other => panic!("unexpected error {other}"),
    }
  }
}
