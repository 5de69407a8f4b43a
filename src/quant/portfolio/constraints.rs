//! # Trading Constraints
//!
//! $$
//! w^+\ge0,\quad \|w^+_{1:N}\|_1\le L,\quad \hat r_{1:N}^\top w^+_{1:N}\ge R^{1/P}-1,\quad
//! \|F w^+_{1:N}\|_2\le\sqrt{S/P}
//! $$
//!
//! Each constraint compiles independently into cone rows over one planning period.

use std::fmt;
use std::fmt::Debug;
use std::fmt::Display;
use std::sync::Arc;

use ndarray::Array1;
use ndarray::Array2;

use super::data::psd_square_root;
use super::solver::ConicProgram;
use super::solver::LinearExpr;
use super::solver::VarBlock;
use crate::error::OptimizerError;
use crate::error::Result;

/// Variables and estimates of one planning period.
#[derive(Clone, Copy, Debug)]
pub struct PeriodContext<'a> {
  /// Zero-based planning period.
  pub period: usize,
  /// Post-trade weights over universe plus cash.
  pub w_plus: VarBlock,
  /// Trade weights over universe plus cash.
  pub z: VarBlock,
  /// Per-period expected returns over universe plus cash.
  pub returns: &'a Array1<f64>,
  /// Per-period covariance over the non-cash universe.
  pub covariance: &'a Array2<f64>,
  pub periods_per_year: u32,
}

impl PeriodContext<'_> {
  /// Number of non-cash assets.
  pub fn num_assets(&self) -> usize {
    self.covariance.nrows()
  }

  fn check(&self) -> Result<()> {
    let n = self.num_assets();
    if self.covariance.ncols() != n {
      return Err(OptimizerError::validation(
        "covariance",
        format!("expected a square matrix, got {:?}", self.covariance.dim()),
      ));
    }
    if self.returns.len() != n + 1 {
      return Err(OptimizerError::validation(
        "returns_forecast",
        format!("expected {} values (assets plus cash), got {}", n + 1, self.returns.len()),
      ));
    }
    if self.w_plus.len != n + 1 || self.z.len != n + 1 {
      return Err(OptimizerError::validation(
        "w_plus",
        format!("variable blocks must span {} assets plus cash", n),
      ));
    }
    Ok(())
  }
}

type CompileFn = dyn Fn(&mut ConicProgram, &PeriodContext<'_>) -> Result<()> + Send + Sync;

/// User-registered constraint compiler.
#[derive(Clone)]
pub struct CustomConstraint {
  name: String,
  compile: Arc<CompileFn>,
}

impl CustomConstraint {
  pub fn new<F>(name: impl Into<String>, compile: F) -> Self
  where
    F: Fn(&mut ConicProgram, &PeriodContext<'_>) -> Result<()> + Send + Sync + 'static,
  {
    Self {
      name: name.into(),
      compile: Arc::new(compile),
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }
}

impl Debug for CustomConstraint {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CustomConstraint")
      .field("name", &self.name)
      .finish_non_exhaustive()
  }
}

/// Trading constraint applied to every planning period.
#[derive(Clone, Debug)]
pub enum Constraint {
  /// No short positions. Cash may still be borrowed unless `include_cash`.
  LongOnly { include_cash: bool },
  /// Gross non-cash exposure bound `L`.
  LeverageLimit(f64),
  /// Gross annual return target `R`, e.g. `1.06`.
  ReturnsTarget(f64),
  /// Annual variance bound `S`.
  RiskThreshold(f64),
  Custom(CustomConstraint),
}

impl Display for Constraint {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Constraint::LongOnly { include_cash } => write!(f, "LongOnly(include_cash={include_cash})"),
      Constraint::LeverageLimit(l) => write!(f, "LeverageLimit({l})"),
      Constraint::ReturnsTarget(r) => write!(f, "ReturnsTarget({r})"),
      Constraint::RiskThreshold(s) => write!(f, "RiskThreshold({s})"),
      Constraint::Custom(c) => write!(f, "Custom({})", c.name),
    }
  }
}

impl Constraint {
  /// Scalar checks, run before any program is built.
  pub fn validate(&self) -> Result<()> {
    let (field, value) = match self {
      Constraint::LeverageLimit(l) => ("leverage_limit", *l),
      Constraint::ReturnsTarget(r) => ("returns_target", *r),
      Constraint::RiskThreshold(s) => ("risk_threshold", *s),
      Constraint::LongOnly { .. } | Constraint::Custom(_) => return Ok(()),
    };
    if !value.is_finite() || value <= 0.0 {
      return Err(OptimizerError::validation(
        field,
        format!("must be finite and positive, got {value}"),
      ));
    }
    Ok(())
  }

  /// Append this constraint's rows for one period.
  pub fn compile(&self, program: &mut ConicProgram, ctx: &PeriodContext<'_>) -> Result<()> {
    self.validate()?;
    ctx.check()?;
    match self {
      Constraint::LongOnly { include_cash } => compile_long_only(program, ctx, *include_cash),
      Constraint::LeverageLimit(l) => compile_leverage_limit(program, ctx, *l),
      Constraint::ReturnsTarget(r) => compile_returns_target(program, ctx, *r),
      Constraint::RiskThreshold(s) => compile_risk_threshold(program, ctx, *s),
      Constraint::Custom(c) => (c.compile)(program, ctx)?,
    }
    Ok(())
  }
}

/// Per-period return from a gross annual return: `R^(1/P) − 1`.
pub fn deannualize_return(gross_annual: f64, periods_per_year: u32) -> f64 {
  gross_annual.powf(1.0 / periods_per_year as f64) - 1.0
}

/// Per-period variance from an annual variance: `S / P`.
pub fn deannualize_risk(annual_variance: f64, periods_per_year: u32) -> f64 {
  annual_variance / periods_per_year as f64
}

fn compile_long_only(program: &mut ConicProgram, ctx: &PeriodContext<'_>, include_cash: bool) {
  let n = ctx.num_assets();
  let last = if include_cash { n + 1 } else { n };
  for i in 0..last {
    program.at_least(LinearExpr::new().term(ctx.w_plus.at(i), 1.0), 0.0);
  }
}

fn compile_leverage_limit(program: &mut ConicProgram, ctx: &PeriodContext<'_>, limit: f64) {
  let n = ctx.num_assets();
  let gross = program.add_variables(n);
  for i in 0..n {
    let (l, w) = (gross.at(i), ctx.w_plus.at(i));
    program.at_least(LinearExpr::new().term(l, 1.0).term(w, -1.0), 0.0);
    program.at_least(LinearExpr::new().term(l, 1.0).term(w, 1.0), 0.0);
  }
  program.at_most(LinearExpr::dot(gross, std::iter::repeat(1.0)), limit);
}

fn compile_returns_target(program: &mut ConicProgram, ctx: &PeriodContext<'_>, target: f64) {
  let n = ctx.num_assets();
  let per_period = deannualize_return(target, ctx.periods_per_year);
  let expr = LinearExpr::dot(ctx.w_plus, ctx.returns.iter().take(n).copied());
  program.at_least(expr, per_period);
}

fn compile_risk_threshold(program: &mut ConicProgram, ctx: &PeriodContext<'_>, threshold: f64) {
  let per_period = deannualize_risk(threshold, ctx.periods_per_year);
  let root = psd_square_root(ctx.covariance);
  if root.nrows() == 0 {
    // Zero covariance, any portfolio qualifies.
    return;
  }
  let rows = root
    .rows()
    .into_iter()
    .map(|row| LinearExpr::dot(ctx.w_plus, row.iter().copied()))
    .collect();
  program.second_order(LinearExpr::constant(per_period.sqrt()), rows);
}
