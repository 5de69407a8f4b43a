//! # Portfolio Data Utilities
//!
//! $$
//! \hat\Sigma = \frac{1}{T-1}\sum_{t}(r_t-\bar r)(r_t-\bar r)^\top \approx V_k\Lambda_k V_k^\top + D
//! $$
//!
//! Moments of return panels, factor-model covariance and PSD square roots.

use nalgebra::DMatrix;
use nalgebra::SymmetricEigen;
use ndarray::Array1;
use ndarray::Array2;
use ndarray::ArrayView2;
use ndarray::Axis;

/// Eigenvalues below this are treated as zero.
const EIGEN_TOL: f64 = 1e-14;

/// Column means of a `rows × assets` return table.
pub fn mean_returns(returns: ArrayView2<'_, f64>) -> Array1<f64> {
  returns
    .mean_axis(Axis(0))
    .unwrap_or_else(|| Array1::zeros(returns.ncols()))
}

/// Unbiased sample covariance of a `rows × assets` return table.
pub fn sample_covariance(returns: ArrayView2<'_, f64>) -> Array2<f64> {
  let (rows, cols) = returns.dim();
  if rows < 2 {
    return Array2::zeros((cols, cols));
  }

  let mean = mean_returns(returns);
  let centered = &returns - &mean;
  let cov = centered.t().dot(&centered) / (rows - 1) as f64;
  symmetrize(&cov)
}

/// Keep the `num_factors` largest principal components and restore the exact diagonal.
pub fn factor_model_covariance(cov: &Array2<f64>, num_factors: usize) -> Array2<f64> {
  let n = cov.nrows();
  if num_factors >= n {
    return cov.clone();
  }

  let (values, vectors) = sorted_eigen(cov);
  let mut low_rank = Array2::<f64>::zeros((n, n));
  for k in 0..num_factors {
    let lambda = values[k].max(0.0);
    for i in 0..n {
      for j in 0..n {
        low_rank[[i, j]] += lambda * vectors[(i, k)] * vectors[(j, k)];
      }
    }
  }

  for i in 0..n {
    let residual = (cov[[i, i]] - low_rank[[i, i]]).max(0.0);
    low_rank[[i, i]] += residual;
  }
  symmetrize(&low_rank)
}

/// Matrix `F` with `FᵀF = Σ`, one row per non-negligible eigen component.
pub fn psd_square_root(cov: &Array2<f64>) -> Array2<f64> {
  let n = cov.nrows();
  let (values, vectors) = sorted_eigen(cov);
  let scale = values.first().copied().unwrap_or(0.0).abs().max(1.0);
  let kept: Vec<usize> = (0..n).filter(|&k| values[k] > EIGEN_TOL * scale).collect();

  let mut root = Array2::<f64>::zeros((kept.len(), n));
  for (row, &k) in kept.iter().enumerate() {
    let s = values[k].sqrt();
    for j in 0..n {
      root[[row, j]] = s * vectors[(j, k)];
    }
  }
  root
}

/// True when `m` is square and symmetric within `tol` (relative to its largest entry).
pub fn is_symmetric(m: &Array2<f64>, tol: f64) -> bool {
  let (rows, cols) = m.dim();
  if rows != cols {
    return false;
  }
  let scale = m.iter().fold(1.0_f64, |acc, v| acc.max(v.abs()));
  for i in 0..rows {
    for j in (i + 1)..cols {
      if (m[[i, j]] - m[[j, i]]).abs() > tol * scale {
        return false;
      }
    }
  }
  true
}

/// Smallest eigenvalue of a symmetric matrix; zero for an empty one.
pub fn min_eigenvalue(m: &Array2<f64>) -> f64 {
  let (values, _) = sorted_eigen(m);
  values.last().copied().unwrap_or(0.0)
}

fn symmetrize(m: &Array2<f64>) -> Array2<f64> {
  (m + &m.t()) / 2.0
}

/// Eigenvalues in descending order with matching eigenvector columns.
fn sorted_eigen(cov: &Array2<f64>) -> (Vec<f64>, DMatrix<f64>) {
  let n = cov.nrows();
  let m = DMatrix::from_fn(n, n, |i, j| cov[[i, j]]);
  let eig = SymmetricEigen::new(m);

  let mut order: Vec<usize> = (0..n).collect();
  order.sort_by(|&a, &b| {
    eig.eigenvalues[b]
      .partial_cmp(&eig.eigenvalues[a])
      .unwrap_or(std::cmp::Ordering::Equal)
  });

  let values = order.iter().map(|&k| eig.eigenvalues[k]).collect();
  let vectors = DMatrix::from_fn(n, n, |i, j| eig.eigenvectors[(i, order[j])]);
  (values, vectors)
}
