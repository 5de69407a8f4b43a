use chrono::Duration;
use chrono::TimeZone;
use chrono::Utc;
use ndarray::array;
use starline_optimizer::quant::portfolio::store::SeriesRow;
use starline_optimizer::quant::portfolio::MarketPanel;
use starline_optimizer::quant::portfolio::Timestamp;
use starline_optimizer::DataConfig;
use starline_optimizer::DataProvider;
use starline_optimizer::EngineConfig;
use starline_optimizer::InMemoryStore;
use starline_optimizer::OptimizationRequest;
use starline_optimizer::OptimizerError;
use starline_optimizer::TimeSeriesStore;
use starline_optimizer::Universe;
use starline_optimizer::run_request;
use uuid::Uuid;

fn day(i: i64) -> Timestamp {
  Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap() + Duration::days(i)
}

#[test]
fn flat_prices_produce_no_trades() -> anyhow::Result<()> {
  let mut store = InMemoryStore::new();
  let rows: Vec<SeriesRow> = (0..300)
    .map(|i| SeriesRow::new(day(i), 100.0, Some(1e6)))
    .collect();
  store.upsert("AAPL", &rows)?;

  let request = OptimizationRequest::from_json(r#"{"tickers": ["AAPL"]}"#)?;
  let trades = run_request(
    &store,
    &request,
    DataConfig::default(),
    EngineConfig::default(),
    Uuid::new_v4(),
  )?;

  assert_eq!(trades.len(), 70);
  for annotated in &trades {
    let u = &annotated.trade.trades;
    assert_eq!(u.len(), 2);
    assert!(u.iter().all(|x| x.abs() < 1.0), "unexpected trade {u}");
    assert_eq!(annotated.trade.shares_traded, vec![0]);
    assert_eq!(annotated.trade.time, day(299));
    assert!(annotated.expected_risk.abs() < 1e-12);
  }
  Ok(())
}

#[test]
fn missing_business_day_is_forward_filled() -> anyhow::Result<()> {
  let mut store = InMemoryStore::new();
  let full: Vec<SeriesRow> = (0..10)
    .map(|i| SeriesRow::new(day(i), 50.0 + i as f64, Some(1e5)))
    .collect();
  let gapped: Vec<SeriesRow> = (0..10)
    .filter(|&i| i != 5)
    .map(|i| SeriesRow::new(day(i), 20.0 + 0.5 * i as f64, Some(1e5)))
    .collect();
  store.upsert("AAA", &full)?;
  store.upsert("BBB", &gapped)?;

  let data = DataProvider::from_store(&store, Universe::new(["AAA", "BBB"])?, DataConfig::default())?;
  let panel = data.panel();
  assert_eq!(panel.calendar().len(), 10);
  assert_eq!(panel.prices()[[5, 1]], panel.prices()[[4, 1]]);
  assert_eq!(panel.returns()[[5, 1]], 0.0);
  assert!(panel.returns()[[6, 1]] > 0.0);
  // Missing row volume is zero-filled.
  assert_eq!(panel.volumes()[[5, 1]], 0.0);
  Ok(())
}

#[test]
fn calendar_end_is_exclusive_unless_requested() -> anyhow::Result<()> {
  let mut store = InMemoryStore::new();
  let rows: Vec<SeriesRow> = (0..8)
    .map(|i| SeriesRow::new(day(i), 10.0 + i as f64, None))
    .collect();
  store.upsert("XLB", &rows)?;
  let data = DataProvider::from_store(&store, Universe::new(["XLB"])?, DataConfig::default())?;

  let exclusive = data.trading_calendar(Some(day(2)), Some(day(5)), false)?;
  assert_eq!(exclusive, vec![day(2), day(3), day(4)]);
  let inclusive = data.trading_calendar(Some(day(2)), Some(day(5)), true)?;
  assert_eq!(inclusive.last(), Some(&day(5)));
  assert_eq!(data.trading_calendar(None, None, false)?.len(), 8);
  assert!(data.trading_calendar(None, None, false)?.windows(2).all(|w| w[0] < w[1]));
  Ok(())
}

#[test]
fn duplicate_timestamp_lookup_fails() -> anyhow::Result<()> {
  let universe = Universe::new(["DUP"])?;
  let calendar = vec![day(0), day(1), day(1), day(2)];
  let panel = MarketPanel::from_tables(
    universe,
    calendar,
    array![[10.0], [10.5], [10.6], [10.4]],
    array![[1.0], [1.0], [1.0], [1.0]],
    0.0,
    1e9,
  )?;
  let data = DataProvider::from_panel(panel, DataConfig::default())?;

  let err = data.serve(day(1)).unwrap_err();
  assert!(matches!(err, OptimizerError::DuplicateTimestamp(t) if t == day(1)));
  assert!(err.is_data_integrity());
  assert!(data.serve(day(2)).is_ok());
  assert!(matches!(
    data.serve(day(7)).unwrap_err(),
    OptimizerError::MissingTimestamp(_)
  ));
  Ok(())
}

#[test]
fn serve_never_exposes_current_or_future_rows() -> anyhow::Result<()> {
  let mut store = InMemoryStore::new();
  let rows: Vec<SeriesRow> = (0..20)
    .map(|i| SeriesRow::new(day(i), 100.0 * 1.01_f64.powi(i as i32), Some(1e6)))
    .collect();
  store.upsert("GROW", &rows)?;
  let data = DataProvider::from_store(&store, Universe::new(["GROW"])?, DataConfig::default())?;

  for t in data.trading_calendar(None, None, false)? {
    let instance = data.serve(t)?;
    let pos = data.panel().locate(t)?;
    assert_eq!(instance.past_returns.nrows(), pos);
    assert_eq!(instance.current_prices[0], data.panel().prices()[[pos, 0]]);
  }
  Ok(())
}
