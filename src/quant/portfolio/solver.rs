//! # Conic Programs
//!
//! $$
//! \min_x \tfrac12 x^\top P x + q^\top x \quad\text{s.t.}\quad Ax + s = b,\ s\in\mathcal K
//! $$
//!
//! Sparse program assembly over zero, non-negative and second-order cones, and the
//! Clarabel interior-point backend.

use std::fmt::Display;

use clarabel::algebra::CscMatrix;
use ndarray::Array2;
use serde::Deserialize;
use serde::Serialize;
use tracing::debug;

use crate::error::OptimizerError;
use crate::error::Result;
use crate::traits::ConicSolverExt;

/// Contiguous range of decision variables.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VarBlock {
  pub start: usize,
  pub len: usize,
}

impl VarBlock {
  /// Global index of the `i`-th variable of the block.
  pub fn at(&self, i: usize) -> usize {
    debug_assert!(i < self.len, "variable {i} out of block of {}", self.len);
    self.start + i
  }

  pub fn indices(&self) -> impl Iterator<Item = usize> {
    self.start..self.start + self.len
  }
}

/// Affine expression `Σ cᵢ xᵢ + constant`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LinearExpr {
  pub terms: Vec<(usize, f64)>,
  pub constant: f64,
}

impl LinearExpr {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn constant(value: f64) -> Self {
    Self {
      terms: Vec::new(),
      constant: value,
    }
  }

  pub fn term(mut self, var: usize, coeff: f64) -> Self {
    self.push(var, coeff);
    self
  }

  pub fn push(&mut self, var: usize, coeff: f64) {
    if coeff != 0.0 {
      self.terms.push((var, coeff));
    }
  }

  /// `Σ cᵢ xᵢ` over the block.
  pub fn dot(block: VarBlock, coeffs: impl IntoIterator<Item = f64>) -> Self {
    let mut expr = Self::new();
    for (i, c) in coeffs.into_iter().enumerate().take(block.len) {
      expr.push(block.at(i), c);
    }
    expr
  }

  pub fn negated(mut self) -> Self {
    for (_, c) in &mut self.terms {
      *c = -*c;
    }
    self.constant = -self.constant;
    self
  }

  pub fn eval(&self, x: &[f64]) -> f64 {
    self.terms.iter().map(|&(i, c)| c * x[i]).sum::<f64>() + self.constant
  }
}

/// Quadratic-objective conic program built row by row.
#[derive(Clone, Debug, Default)]
pub struct ConicProgram {
  q: Vec<f64>,
  /// Upper-triangular entries of `P`.
  p: Vec<(usize, usize, f64)>,
  zero_rows: Vec<LinearExpr>,
  nonneg_rows: Vec<LinearExpr>,
  soc_blocks: Vec<Vec<LinearExpr>>,
}

impl ConicProgram {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn num_vars(&self) -> usize {
    self.q.len()
  }

  pub fn num_rows(&self) -> usize {
    self.zero_rows.len()
      + self.nonneg_rows.len()
      + self.soc_blocks.iter().map(Vec::len).sum::<usize>()
  }

  pub fn add_variables(&mut self, len: usize) -> VarBlock {
    let start = self.q.len();
    self.q.resize(start + len, 0.0);
    VarBlock { start, len }
  }

  /// Add `coeff·x_var` to the objective.
  pub fn add_linear_cost(&mut self, var: usize, coeff: f64) {
    self.q[var] += coeff;
  }

  /// Add `coeff·x_i·x_j` to the objective.
  pub fn add_quadratic_cost(&mut self, i: usize, j: usize, coeff: f64) {
    if coeff == 0.0 {
      return;
    }
    if i == j {
      self.p.push((i, i, 2.0 * coeff));
    } else {
      self.p.push((i.min(j), i.max(j), coeff));
    }
  }

  /// Add `scale·vᵀMv` over `vars` to the objective. `M` is read as given, not symmetrized.
  pub fn add_quadratic_form(&mut self, vars: &[usize], m: &Array2<f64>, scale: f64) {
    if scale == 0.0 {
      return;
    }
    for (a, &i) in vars.iter().enumerate() {
      self.add_quadratic_cost(i, i, scale * m[[a, a]]);
      for (b, &j) in vars.iter().enumerate().skip(a + 1) {
        self.add_quadratic_cost(i, j, scale * (m[[a, b]] + m[[b, a]]));
      }
    }
  }

  /// `expr == rhs`
  pub fn equal(&mut self, mut expr: LinearExpr, rhs: f64) {
    expr.constant -= rhs;
    self.zero_rows.push(expr);
  }

  /// `expr >= rhs`
  pub fn at_least(&mut self, mut expr: LinearExpr, rhs: f64) {
    expr.constant -= rhs;
    self.nonneg_rows.push(expr);
  }

  /// `expr <= rhs`
  pub fn at_most(&mut self, expr: LinearExpr, rhs: f64) {
    self.at_least(expr.negated(), -rhs);
  }

  /// `‖(e₁,…,e_k)‖₂ <= bound`
  pub fn second_order(&mut self, bound: LinearExpr, exprs: Vec<LinearExpr>) {
    let mut block = Vec::with_capacity(exprs.len() + 1);
    block.push(bound);
    block.extend(exprs);
    self.soc_blocks.push(block);
  }

  /// Objective value `½xᵀPx + qᵀx` at `x`.
  pub fn objective(&self, x: &[f64]) -> f64 {
    let linear: f64 = self.q.iter().zip(x).map(|(q, x)| q * x).sum();
    let quadratic: f64 = self
      .p
      .iter()
      .map(|&(i, j, v)| {
        if i == j {
          0.5 * v * x[i] * x[i]
        } else {
          v * x[i] * x[j]
        }
      })
      .sum();
    linear + quadratic
  }

  /// Largest violation of any cone row at `x`.
  pub fn max_violation(&self, x: &[f64]) -> f64 {
    let zero = self.zero_rows.iter().map(|e| e.eval(x).abs());
    let nonneg = self.nonneg_rows.iter().map(|e| (-e.eval(x)).max(0.0));
    let soc = self.soc_blocks.iter().map(|block| {
      let bound = block[0].eval(x);
      let norm = block[1..]
        .iter()
        .map(|e| e.eval(x).powi(2))
        .sum::<f64>()
        .sqrt();
      (norm - bound).max(0.0)
    });
    zero.chain(nonneg).chain(soc).fold(0.0, f64::max)
  }

  /// `s = b − Ax = expr` per row, so `A = −coeffs` and `b = constant`.
  fn stacked_rows(&self) -> (Vec<(usize, usize, f64)>, Vec<f64>, Vec<ConeKind>) {
    let mut a = Vec::new();
    let mut b = Vec::with_capacity(self.num_rows());
    let mut cones = Vec::new();
    let mut row = 0;

    let mut emit = |exprs: &[LinearExpr], a: &mut Vec<(usize, usize, f64)>, b: &mut Vec<f64>| {
      for expr in exprs {
        for &(var, coeff) in &expr.terms {
          a.push((row, var, -coeff));
        }
        b.push(expr.constant);
        row += 1;
      }
    };

    if !self.zero_rows.is_empty() {
      emit(&self.zero_rows, &mut a, &mut b);
      cones.push(ConeKind::Zero(self.zero_rows.len()));
    }
    if !self.nonneg_rows.is_empty() {
      emit(&self.nonneg_rows, &mut a, &mut b);
      cones.push(ConeKind::Nonnegative(self.nonneg_rows.len()));
    }
    for block in &self.soc_blocks {
      emit(block, &mut a, &mut b);
      cones.push(ConeKind::SecondOrder(block.len()));
    }

    (a, b, cones)
  }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ConeKind {
  Zero(usize),
  Nonnegative(usize),
  SecondOrder(usize),
}

/// Compressed-column matrix from (row, col, value) triplets, summing duplicates.
fn csc_from_triplets(rows: usize, cols: usize, triplets: &[(usize, usize, f64)]) -> CscMatrix<f64> {
  let mut sorted: Vec<(usize, usize, f64)> = triplets.to_vec();
  sorted.sort_by(|a, b| (a.1, a.0).cmp(&(b.1, b.0)));

  let mut colptr = vec![0usize; cols + 1];
  let mut rowval = Vec::with_capacity(sorted.len());
  let mut nzval: Vec<f64> = Vec::with_capacity(sorted.len());
  let mut last: Option<(usize, usize)> = None;

  for (r, c, v) in sorted {
    if last == Some((r, c)) {
      if let Some(value) = nzval.last_mut() {
        *value += v;
      }
      continue;
    }
    rowval.push(r);
    nzval.push(v);
    colptr[c + 1] += 1;
    last = Some((r, c));
  }
  for c in 0..cols {
    colptr[c + 1] += colptr[c];
  }

  CscMatrix::new(rows, cols, colptr, rowval, nzval)
}

/// Outcome classification of a solve.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SolveStatus {
  Solved,
  AlmostSolved,
  Infeasible,
  Unbounded,
  NotConverged,
  NumericalError(String),
}

impl SolveStatus {
  pub fn is_optimal(&self) -> bool {
    matches!(self, Self::Solved | Self::AlmostSolved)
  }
}

impl Display for SolveStatus {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      SolveStatus::Solved => write!(f, "solved"),
      SolveStatus::AlmostSolved => write!(f, "almost solved"),
      SolveStatus::Infeasible => write!(f, "infeasible"),
      SolveStatus::Unbounded => write!(f, "unbounded"),
      SolveStatus::NotConverged => write!(f, "did not converge"),
      SolveStatus::NumericalError(s) => write!(f, "numerical error ({s})"),
    }
  }
}

/// Primal solution and diagnostics.
#[derive(Clone, Debug)]
pub struct ConicSolution {
  pub status: SolveStatus,
  pub x: Vec<f64>,
  pub objective: f64,
  pub iterations: u32,
}

/// Interior-point settings forwarded to the backend.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverSettings {
  pub max_iter: u32,
  pub tol_gap_abs: f64,
  pub tol_gap_rel: f64,
  pub tol_feas: f64,
  /// Seconds; `None` means unlimited.
  pub time_limit: Option<f64>,
  pub verbose: bool,
}

impl Default for SolverSettings {
  fn default() -> Self {
    Self {
      max_iter: 200,
      tol_gap_abs: 1e-9,
      tol_gap_rel: 1e-9,
      tol_feas: 1e-9,
      time_limit: None,
      verbose: false,
    }
  }
}

/// [`ConicSolverExt`] backed by the Clarabel interior-point solver.
#[derive(Clone, Debug, Default)]
pub struct ClarabelSolver {
  settings: SolverSettings,
}

impl ClarabelSolver {
  pub fn new(settings: SolverSettings) -> Self {
    Self { settings }
  }
}

impl ConicSolverExt for ClarabelSolver {
  fn name(&self) -> &str {
    "clarabel"
  }

  fn solve(&self, program: &ConicProgram) -> Result<ConicSolution> {
    use clarabel::solver::*;

    let n = program.num_vars();
    if n == 0 {
      return Err(OptimizerError::Configuration(
        "conic program has no variables".to_string(),
      ));
    }

    let p = csc_from_triplets(n, n, &program.p);
    let (a_triplets, b, kinds) = program.stacked_rows();
    let a = csc_from_triplets(b.len(), n, &a_triplets);
    let cones: Vec<SupportedConeT<f64>> = kinds
      .iter()
      .map(|kind| match *kind {
        ConeKind::Zero(k) => ZeroConeT(k),
        ConeKind::Nonnegative(k) => NonnegativeConeT(k),
        ConeKind::SecondOrder(k) => SecondOrderConeT(k),
      })
      .collect();

    let mut settings = DefaultSettings::<f64>::default();
    settings.verbose = self.settings.verbose;
    settings.max_iter = self.settings.max_iter;
    settings.tol_gap_abs = self.settings.tol_gap_abs;
    settings.tol_gap_rel = self.settings.tol_gap_rel;
    settings.tol_feas = self.settings.tol_feas;
    if let Some(limit) = self.settings.time_limit {
      settings.time_limit = limit;
    }

    let mut solver = DefaultSolver::new(&p, &program.q, &a, &b, &cones, settings);
    solver.solve();

    let status = match solver.solution.status {
      SolverStatus::Solved => SolveStatus::Solved,
      SolverStatus::AlmostSolved => SolveStatus::AlmostSolved,
      SolverStatus::PrimalInfeasible | SolverStatus::AlmostPrimalInfeasible => {
        SolveStatus::Infeasible
      }
      SolverStatus::DualInfeasible | SolverStatus::AlmostDualInfeasible => SolveStatus::Unbounded,
      SolverStatus::MaxIterations | SolverStatus::MaxTime => SolveStatus::NotConverged,
      other => SolveStatus::NumericalError(format!("{other:?}")),
    };

    debug!(
      vars = n,
      rows = b.len(),
      iterations = solver.solution.iterations,
      %status,
      "clarabel solve finished"
    );

    Ok(ConicSolution {
      status,
      x: solver.solution.x.clone(),
      objective: solver.solution.obj_val,
      iterations: solver.solution.iterations,
    })
  }
}
