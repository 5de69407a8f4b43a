//! # Quant
//!
//! $$
//! h_{t+1} = h_t + u_t
//! $$
//!
//! Quantitative portfolio tooling.

pub mod portfolio;
