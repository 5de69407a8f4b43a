//! # Portfolio
//!
//! $$
//! u_t = \operatorname*{arg\,max}_{z_0}\ \sum_{k<H} \hat r_k^\top w^+_k - \gamma_{\text{risk}}\,\psi_k(w^+_k) - \gamma_{\text{trade}}\,\phi_k(z_k)
//! $$
//!
//! Rolling-horizon multi-period portfolio optimization: point-in-time market data,
//! estimators, constraints, the conic policy, hyperparameter sweeps and analytics.

pub mod analytics;
pub mod constraints;
pub mod data;
pub mod engine;
pub mod estimators;
pub mod policy;
pub mod provider;
pub mod request;
pub mod solver;
pub mod store;
pub mod types;

pub use analytics::AnnotatedTrade;
pub use analytics::PortfolioAnalytics;
pub use constraints::Constraint;
pub use constraints::CustomConstraint;
pub use constraints::PeriodContext;
pub use engine::EngineConfig;
pub use engine::OptimizationEngine;
pub use engine::SweepOptions;
pub use estimators::ForecastSource;
pub use estimators::RiskModelKind;
pub use policy::MultiPeriodOptimization;
pub use policy::TransactionCostModel;
pub use provider::DataConfig;
pub use provider::DataInstance;
pub use provider::DataProvider;
pub use provider::MarketPanel;
pub use request::OptimizationRequest;
pub use request::run_request;
pub use solver::ClarabelSolver;
pub use solver::ConicProgram;
pub use solver::SolverSettings;
pub use store::CsvStore;
pub use store::InMemoryStore;
pub use store::SeriesRow;
pub use types::CASH_TICKER;
pub use types::ForecastSnapshot;
pub use types::PolicyParameters;
pub use types::Timestamp;
pub use types::TradeResult;
pub use types::Universe;
