use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use chrono::Duration;
use chrono::TimeZone;
use chrono::Utc;
use ndarray::Array1;
use starline_optimizer::quant::portfolio::constraints::deannualize_return;
use starline_optimizer::quant::portfolio::solver::ConicSolution;
use starline_optimizer::quant::portfolio::solver::SolveStatus;
use starline_optimizer::quant::portfolio::store::SeriesRow;
use starline_optimizer::quant::portfolio::ClarabelSolver;
use starline_optimizer::quant::portfolio::ConicProgram;
use starline_optimizer::quant::portfolio::ForecastSource;
use starline_optimizer::quant::portfolio::Timestamp;
use starline_optimizer::ConicSolverExt;
use starline_optimizer::CsvStore;
use starline_optimizer::DataConfig;
use starline_optimizer::DataProvider;
use starline_optimizer::EngineConfig;
use starline_optimizer::InMemoryStore;
use starline_optimizer::OptimizationEngine;
use starline_optimizer::OptimizationRequest;
use starline_optimizer::OptimizerError;
use starline_optimizer::SweepOptions;
use starline_optimizer::TimeSeriesStore;
use starline_optimizer::Universe;
use starline_optimizer::run_request;
use uuid::Uuid;

const TICKERS: [&str; 3] = ["XLB", "XLE", "XLK"];
const VALUE: f64 = 1_000_000.0;

fn day(i: i64) -> Timestamp {
  Utc.with_ymd_and_hms(2021, 3, 1, 0, 0, 0).unwrap() + Duration::days(i)
}

/// Deterministic trending series with alternating noise.
fn seeded_store() -> anyhow::Result<InMemoryStore> {
  let mut store = InMemoryStore::new();
  let drifts = [0.0012, 0.0006, -0.0003];
  for (j, ticker) in TICKERS.iter().enumerate() {
    let mut price = 40.0 + 10.0 * j as f64;
    let rows: Vec<SeriesRow> = (0..120)
      .map(|i| {
        let noise = match (i + j as i64) % 3 {
          0 => 0.004,
          1 => -0.003,
          _ => -0.001,
        };
        price *= 1.0 + drifts[j] + noise;
        SeriesRow::new(day(i), price, Some(2e6))
      })
      .collect();
    store.upsert(ticker, &rows)?;
  }
  Ok(store)
}

fn engine(config: EngineConfig) -> anyhow::Result<OptimizationEngine> {
  let store = seeded_store()?;
  let data = DataProvider::from_store(&store, Universe::new(TICKERS)?, DataConfig::default())?;
  Ok(OptimizationEngine::new(data, config, Uuid::new_v4())?)
}

fn holdings() -> Array1<f64> {
  Array1::from_vec(vec![200_000.0, 300_000.0, 100_000.0, 400_000.0])
}

#[test]
fn default_sweep_has_seventy_feasible_results() -> anyhow::Result<()> {
  let engine = engine(EngineConfig::default())?;
  let h = holdings();
  let results = engine.execute(&h, &SweepOptions::default())?;
  assert_eq!(results.len(), 70);

  for (result, (gamma_risk, gamma_trade)) in results.iter().zip(engine.grid()) {
    assert_eq!((result.gamma_risk, result.gamma_trade), (gamma_risk, gamma_trade));
    // Self-financing.
    assert!(result.trades.sum().abs() < 1e-2, "net trade {}", result.trades.sum());

    let post = result.post_trade(&h);
    let weights = &post / VALUE;
    // Long-only on non-cash assets.
    for w in weights.iter().take(3) {
      assert!(*w >= -1e-6, "short weight {w}");
    }
    // Leverage limit of one.
    let gross: f64 = weights.iter().take(3).map(|w| w.abs()).sum();
    assert!(gross <= 1.0 + 1e-6, "gross exposure {gross}");
  }
  Ok(())
}

#[test]
fn sweeps_are_idempotent() -> anyhow::Result<()> {
  let engine = engine(EngineConfig {
    risk_grid: vec![10.0, 100.0],
    ..EngineConfig::default()
  })?;
  let h = holdings();
  let first = engine.execute(&h, &SweepOptions::default())?;
  let second = engine.execute(&h, &SweepOptions::default())?;
  assert_eq!(first.len(), 20);
  for (a, b) in first.iter().zip(&second) {
    for (x, y) in a.trades.iter().zip(b.trades.iter()) {
      assert!((x - y).abs() < 1e-4);
    }
    assert_eq!(a.shares_traded, b.shares_traded);
  }
  Ok(())
}

#[test]
fn returns_target_holds_after_compounding() -> anyhow::Result<()> {
  let engine = engine(EngineConfig {
    risk_grid: vec![50.0, 500.0],
    trade_grid: vec![1.0, 5.0],
    ..EngineConfig::default()
  })?;
  let h = engine.cash_only();
  let target = 1.08;
  let options = SweepOptions {
    returns_target: Some(target),
    ..SweepOptions::default()
  };
  let results = engine.execute(&h, &options)?;
  let analytics = engine.analytics(None)?;
  let ppy = engine.data().periods_per_year();

  for result in results {
    let post = result.post_trade(&h);
    let mut noncash = post.clone();
    noncash[3] = 0.0;
    let asset_return = analytics.h_return(&noncash)? - 1.0;
    let value: f64 = post.iter().map(|x| x.abs()).sum();
    let gross_noncash: f64 = noncash.iter().map(|x| x.abs()).sum();
    // Rescale the non-cash return from gross non-cash to total portfolio weights.
    let per_period = asset_return * gross_noncash / value;
    assert!(per_period >= deannualize_return(target, ppy) - 1e-7);

    let annotated = analytics.annotate(result, &h)?;
    assert!(annotated.expected_return >= target - 1e-4);
  }
  Ok(())
}

/// Delegates to Clarabel but reports infeasibility on one call.
struct FailOnCall {
  call: usize,
  calls: AtomicUsize,
  inner: ClarabelSolver,
}

impl ConicSolverExt for FailOnCall {
  fn name(&self) -> &str {
    "fail-on-call"
  }

  fn solve(&self, program: &ConicProgram) -> starline_optimizer::Result<ConicSolution> {
    let n = self.calls.fetch_add(1, Ordering::SeqCst);
    let mut solution = self.inner.solve(program)?;
    if n == self.call {
      solution.status = SolveStatus::Infeasible;
    }
    Ok(solution)
  }
}

#[test]
fn one_failing_cell_aborts_the_sweep() -> anyhow::Result<()> {
  let solver = Arc::new(FailOnCall {
    call: 2,
    calls: AtomicUsize::new(0),
    inner: ClarabelSolver::default(),
  });
  let engine = engine(EngineConfig::default())?.with_solver(solver.clone());
  let err = engine
    .execute(&holdings(), &SweepOptions::default())
    .unwrap_err();

  match err {
    OptimizerError::Solver {
      gamma_risk,
      gamma_trade,
      ..
    } => assert_eq!((gamma_risk, gamma_trade), (5.0, 1.0)),
    other => panic!("unexpected error {other}"),
  }
  // Sequential sweeps stop at the failing cell.
  assert_eq!(solver.calls.load(Ordering::SeqCst), 3);
  Ok(())
}

#[test]
fn supplied_forecast_request_through_csv_store() -> anyhow::Result<()> {
  let dir = tempfile::tempdir()?;
  let mut store = CsvStore::open(dir.path())?;
  let source = seeded_store()?;
  for ticker in TICKERS {
    store.upsert(ticker, &source.range(ticker, None, None)?)?;
  }

  let request = OptimizationRequest::from_json(
    r#"{
      "tickers": ["xlb", "xle", "xlk"],
      "holdings": [0.0, 0.0, 0.0, 100000.0],
      "returns_forecast": [[0.002, 0.0, 0.0], [0.0, 0.0, 0.0]],
      "covariance": [[1e-4, 0.0, 0.0], [0.0, 1e-4, 0.0], [0.0, 0.0, 1e-4]]
    }"#,
  )?;
  let config = EngineConfig {
    risk_grid: vec![5.0],
    trade_grid: vec![0.5, 5.0],
    ..EngineConfig::default()
  };
  let trades = run_request(&store, &request, DataConfig::default(), config, Uuid::new_v4())?;
  assert_eq!(trades.len(), 2);
  for annotated in &trades {
    let u = &annotated.trade.trades;
    assert!(u.sum().abs() < 1e-3);
    // Only the first asset has an edge in the first period.
    assert!(u[0] >= u[1] - 1e-3 && u[0] >= u[2] - 1e-3);
  }

  let bad = OptimizationRequest::from_json(r#"{"tickers": ["xlb"], "holdings": [1.0]}"#)?;
  let err = run_request(&store, &bad, DataConfig::default(), EngineConfig::default(), Uuid::new_v4())
    .unwrap_err();
  assert!(matches!(err, OptimizerError::Validation { ref field, .. } if field == "holdings"));
  Ok(())
}

#[test]
fn snapshot_reflects_forecast_source() -> anyhow::Result<()> {
  let engine = engine(EngineConfig::default())?;
  let universe = engine.data().universe().clone();
  let historical = engine.snapshot(None)?;
  assert_eq!(historical.returns.len(), 4);
  assert_eq!(historical.covariance.dim(), (3, 3));

  let supplied = engine.with_forecast_source(Some(ForecastSource::supplied(
    &universe,
    ndarray::Array2::from_elem((2, 3), 0.001),
    ndarray::Array2::eye(3) * 1e-4,
  )?));
  let snapshot = supplied.snapshot(Some(day(100)))?;
  assert_eq!(snapshot.time, day(100));
  assert_eq!(snapshot.returns[0], 0.001);
  assert_eq!(snapshot.covariance[[1, 1]], 1e-4);
  Ok(())
}
