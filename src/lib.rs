//! # Starline Optimizer
//!
//! $$
//! \{u(\gamma_{\text{risk}},\gamma_{\text{trade}})\}_{7\times10},\qquad \mathbf 1^\top u = 0
//! $$
//!
//! Rolling-horizon multi-period portfolio rebalancing. A [`DataProvider`] serves
//! aligned price/return/volume panels from a [`TimeSeriesStore`] without lookahead; an
//! [`OptimizationEngine`] sweeps a grid of risk and trade aversions, solving one conic
//! program per cell, and [`PortfolioAnalytics`] annotates each candidate trade with its
//! annualized expected return and risk.
//!
//! ```ignore
//! let store = CsvStore::open("data")?;
//! let request = OptimizationRequest::from_json(r#"{"tickers": ["XLB", "XLE"]}"#)?;
//! let trades = run_request(
//!   &store,
//!   &request,
//!   DataConfig::default(),
//!   EngineConfig::default(),
//!   Uuid::new_v4(),
//! )?;
//! ```

pub mod error;
pub mod quant;
pub mod traits;

pub use error::OptimizerError;
pub use error::Result;
pub use quant::portfolio::CsvStore;
pub use quant::portfolio::DataConfig;
pub use quant::portfolio::DataProvider;
pub use quant::portfolio::EngineConfig;
pub use quant::portfolio::InMemoryStore;
pub use quant::portfolio::OptimizationEngine;
pub use quant::portfolio::OptimizationRequest;
pub use quant::portfolio::PortfolioAnalytics;
pub use quant::portfolio::SweepOptions;
pub use quant::portfolio::Universe;
pub use quant::portfolio::run_request;
pub use traits::ConicSolverExt;
pub use traits::TimeSeriesStore;
