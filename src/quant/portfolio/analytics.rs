//! # Portfolio Analytics
//!
//! $$
//! w=\frac{h}{\sum_i|h_i|},\qquad R(h)=1+w^\top\hat r,\quad \sigma^2(h)=w_{1:N}^\top\Sigma\,w_{1:N},
//! \qquad R_{\text{ann}}=R^{P},\quad \sigma^2_{\text{ann}}=P\,\sigma^2
//! $$
//!
//! Expected return and risk of candidate portfolios, used to annotate sweep results.

use ndarray::Array1;
use ndarray::s;
use serde::Serialize;

use super::types::ForecastSnapshot;
use super::types::TradeResult;
use crate::error::OptimizerError;
use crate::error::Result;

/// Weights `h / Σ|h|`; zero gross exposure gives zero weights.
pub fn weights(h: &Array1<f64>) -> Array1<f64> {
  let gross: f64 = h.iter().map(|x| x.abs()).sum();
  if gross == 0.0 {
    return Array1::zeros(h.len());
  }
  h / gross
}

/// Annualize a gross per-period return: `R^P`.
pub fn annualize_return(gross_period: f64, periods_per_year: u32) -> f64 {
  gross_period.powi(periods_per_year as i32)
}

/// Annualize a per-period variance: `σ²·P`.
pub fn annualize_risk(variance: f64, periods_per_year: u32) -> f64 {
  variance * periods_per_year as f64
}

/// Sweep result with post-trade annualized expectations.
#[derive(Clone, Debug, Serialize)]
pub struct AnnotatedTrade {
  #[serde(flatten)]
  pub trade: TradeResult,
  /// Gross annual expected return of `h + u`.
  pub expected_return: f64,
  /// Annual expected variance of `h + u`.
  pub expected_risk: f64,
}

/// Analytics bound to one forecast snapshot.
#[derive(Clone, Debug)]
pub struct PortfolioAnalytics {
  snapshot: ForecastSnapshot,
  periods_per_year: u32,
}

impl PortfolioAnalytics {
  pub fn new(snapshot: ForecastSnapshot, periods_per_year: u32) -> Self {
    Self {
      snapshot,
      periods_per_year,
    }
  }

  pub fn snapshot(&self) -> &ForecastSnapshot {
    &self.snapshot
  }

  /// Gross expected per-period return of holdings over universe plus cash.
  pub fn h_return(&self, h: &Array1<f64>) -> Result<f64> {
    let r_hat = &self.snapshot.returns;
    if h.len() != r_hat.len() {
      return Err(OptimizerError::validation(
        "holdings",
        format!("expected {} values, got {}", r_hat.len(), h.len()),
      ));
    }
    Ok(1.0 + weights(h).dot(r_hat))
  }

  /// Expected per-period variance of non-cash holdings.
  pub fn h_risk(&self, h_noncash: &Array1<f64>) -> Result<f64> {
    let sigma = &self.snapshot.covariance;
    if h_noncash.len() != sigma.nrows() {
      return Err(OptimizerError::validation(
        "holdings",
        format!("expected {} non-cash values, got {}", sigma.nrows(), h_noncash.len()),
      ));
    }
    let w = weights(h_noncash);
    Ok(w.dot(&sigma.dot(&w)))
  }

  /// Attach post-trade annualized return and risk to a sweep result.
  ///
  /// Both figures use the post-trade holdings `h + u`; the risk figure normalizes over
  /// the non-cash part only.
  pub fn annotate(&self, trade: TradeResult, h: &Array1<f64>) -> Result<AnnotatedTrade> {
    if h.len() != trade.trades.len() {
      return Err(OptimizerError::validation(
        "holdings",
        format!("expected {} values, got {}", trade.trades.len(), h.len()),
      ));
    }
    let post = trade.post_trade(h);
    let n = post.len() - 1;
    let expected_return = annualize_return(self.h_return(&post)?, self.periods_per_year);
    let noncash = post.slice(s![..n]).to_owned();
    let expected_risk = annualize_risk(self.h_risk(&noncash)?, self.periods_per_year);
    Ok(AnnotatedTrade {
      trade,
      expected_return,
      expected_risk,
    })
  }
}

#[cfg(test)]
mod tests {
  use approx::assert_abs_diff_eq;
  use ndarray::array;

  use super::*;
  use crate::quant::portfolio::store::oldest_entry_date;

  fn analytics() -> PortfolioAnalytics {
    PortfolioAnalytics::new(
      ForecastSnapshot {
        time: oldest_entry_date(),
        returns: array![0.001, 0.0005, 0.0001],
        covariance: array![[1e-4, 2e-5], [2e-5, 4e-5]],
      },
      252,
    )
  }

  #[test]
  fn h_return_weights_by_gross_exposure() -> anyhow::Result<()> {
    let a = analytics();
    let r = a.h_return(&array![50.0, 0.0, 50.0])?;
    assert_abs_diff_eq!(r, 1.0 + 0.5 * 0.001 + 0.5 * 0.0001, epsilon = 1e-15);
    // Short cash counts toward gross exposure.
    let r = a.h_return(&array![150.0, 0.0, -50.0])?;
    assert_abs_diff_eq!(r, 1.0 + 0.75 * 0.001 - 0.25 * 0.0001, epsilon = 1e-15);
    Ok(())
  }

  #[test]
  fn zero_exposure_gives_neutral_figures() -> anyhow::Result<()> {
    let a = analytics();
    assert_eq!(a.h_return(&array![0.0, 0.0, 0.0])?, 1.0);
    assert_eq!(a.h_risk(&array![0.0, 0.0])?, 0.0);
    Ok(())
  }

  #[test]
  fn h_risk_is_quadratic_form_of_weights() -> anyhow::Result<()> {
    let a = analytics();
    let risk = a.h_risk(&array![30.0, 10.0])?;
    let (w0, w1) = (0.75, 0.25);
    let expected = w0 * w0 * 1e-4 + 2.0 * w0 * w1 * 2e-5 + w1 * w1 * 4e-5;
    assert_abs_diff_eq!(risk, expected, epsilon = 1e-15);
    assert!(a.h_risk(&array![1.0, 2.0, 3.0]).is_err());
    Ok(())
  }

  #[test]
  fn annualization_conventions() {
    assert_abs_diff_eq!(annualize_return(1.0001, 252), 1.0001_f64.powi(252), epsilon = 1e-15);
    assert_abs_diff_eq!(annualize_risk(1e-4, 252), 0.0252, epsilon = 1e-15);
  }

  #[test]
  fn annotate_uses_post_trade_holdings() -> anyhow::Result<()> {
    let a = analytics();
    let h = array![0.0, 0.0, 100.0];
    let trade = TradeResult {
      trades: array![60.0, 20.0, -80.0],
      time: oldest_entry_date(),
      shares_traded: vec![1, 0],
      gamma_risk: 5.0,
      gamma_trade: 1.0,
    };
    let annotated = a.annotate(trade, &h)?;
    let post = array![60.0, 20.0, 20.0];
    assert_abs_diff_eq!(
      annotated.expected_return,
      a.h_return(&post)?.powi(252),
      epsilon = 1e-12
    );
    assert_abs_diff_eq!(
      annotated.expected_risk,
      a.h_risk(&array![60.0, 20.0])? * 252.0,
      epsilon = 1e-15
    );

    let json = serde_json::to_value(&annotated)?;
    assert!(json.get("trades").is_some());
    assert!(json.get("expected_return").is_some());
    Ok(())
  }
}
