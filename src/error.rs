//! # Errors
//!
//! $$
//! \text{request} \to \text{Validation} \mid \text{DataIntegrity} \mid \text{Solver} \mid \text{Configuration}
//! $$
//!
//! Error taxonomy shared by every stage of the optimization pipeline.

use thiserror::Error;

use crate::quant::portfolio::types::Timestamp;

/// Main error type for the optimizer.
#[derive(Error, Debug)]
pub enum OptimizerError {
  /// Malformed, missing or mis-shaped input. Nothing is computed.
  #[error("invalid {field}: {message}")]
  Validation { field: String, message: String },

  #[error("duplicate timestamp {0} in trading calendar")]
  DuplicateTimestamp(Timestamp),

  #[error("timestamp {0} is not in the trading calendar")]
  MissingTimestamp(Timestamp),

  #[error("insufficient history at {time}: {available} past rows, {required} required")]
  InsufficientHistory {
    time: Timestamp,
    available: usize,
    required: usize,
  },

  #[error("no time series rows for ticker {0}")]
  MissingTicker(String),

  #[error("data integrity error: {0}")]
  DataIntegrity(String),

  /// Infeasible or non-converging program for one hyperparameter combination.
  #[error("solver failed for gamma_risk={gamma_risk}, gamma_trade={gamma_trade}: {reason}")]
  Solver {
    gamma_risk: f64,
    gamma_trade: f64,
    reason: String,
  },

  #[error("configuration error: {0}")]
  Configuration(String),

  #[error("time series store error: {0}")]
  Store(String),

  #[error("CSV error: {0}")]
  Csv(#[from] csv::Error),

  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),

  #[error("JSON error: {0}")]
  Json(#[from] serde_json::Error),
}

impl OptimizerError {
  pub(crate) fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
    Self::Validation {
      field: field.into(),
      message: message.into(),
    }
  }

  /// True for duplicate/missing timestamps, missing tickers and short histories.
  pub fn is_data_integrity(&self) -> bool {
    matches!(
      self,
      Self::DuplicateTimestamp(_)
        | Self::MissingTimestamp(_)
        | Self::InsufficientHistory { .. }
        | Self::MissingTicker(_)
        | Self::DataIntegrity(_)
    )
  }
}

/// Result type alias for optimizer operations.
pub type Result<T> = std::result::Result<T, OptimizerError>;
