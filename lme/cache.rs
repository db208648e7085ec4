//! Per-gamma memoization of the group covariance factors.
//!
//! Every oracle quantity needs `Omega_g^{-1}` and `log det Omega_g` for the
//! current gamma. Recomputing them costs a Cholesky factorization per group, so
//! the oracle keeps the factors of the last gamma it saw and reuses them while
//! gamma stays bitwise identical. The cache never changes a result: a hit
//! returns exactly the factors a fresh computation would produce.

use crate::oracle::NumericalError;
use crate::problem::Group;
use ndarray::{Array1, Array2, ArrayView1, Axis};
use ndarray_linalg::{FactorizeC, InverseC, UPLO};
use rayon::prelude::*;
use std::sync::Arc;

/// The factorized covariance of a single group for one value of gamma.
#[derive(Debug, Clone)]
pub struct GroupFactor {
    /// `Omega_g^{-1}`, symmetric, shape `[n_g, n_g]`.
    pub omega_inv: Array2<f64>,
    /// `log det Omega_g`.
    pub log_det: f64,
}

impl GroupFactor {
    /// Forms `Omega = Z diag(gamma) Z^T + diag(obs_var)` and factorizes it.
    pub fn compute(group: &Group, gamma: ArrayView1<f64>) -> Result<Self, NumericalError> {
        let omega = covariance(group, gamma);
        let factorized = omega.factorizec(UPLO::Lower).map_err(|source| {
            NumericalError::CovarianceNotPositiveDefinite {
                group: group.id,
                source,
            }
        })?;

        // log|Omega| = 2 * sum(log(diag(L)))
        let log_det = 2.0 * factorized.factor.diag().mapv(f64::ln).sum();
        if !log_det.is_finite() {
            return Err(NumericalError::NonFiniteLogDeterminant { group: group.id });
        }

        let omega_inv = factorized.invc().map_err(|source| {
            NumericalError::CovarianceNotPositiveDefinite {
                group: group.id,
                source,
            }
        })?;

        Ok(Self { omega_inv, log_det })
    }
}

/// `Z diag(gamma) Z^T + diag(obs_var)`.
pub fn covariance(group: &Group, gamma: ArrayView1<f64>) -> Array2<f64> {
    let scaled_z = &group.z * &gamma.insert_axis(Axis(0));
    let mut omega = scaled_z.dot(&group.z.t());
    omega.diag_mut().zip_mut_with(&group.obs_var, |d, &v| *d += v);
    omega
}

/// Factors every group, in parallel, preserving group order.
pub fn factorize_groups(
    groups: &[Group],
    gamma: ArrayView1<f64>,
) -> Result<Vec<GroupFactor>, NumericalError> {
    groups
        .par_iter()
        .map(|group| GroupFactor::compute(group, gamma))
        .collect()
}

/// The factors of the most recently seen gamma.
#[derive(Debug, Default)]
pub struct CovarianceCache {
    last_gamma: Option<Array1<f64>>,
    factors: Arc<Vec<GroupFactor>>,
    valid: bool,
    recomputations: usize,
}

impl CovarianceCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn matches(&self, gamma: ArrayView1<f64>) -> bool {
        self.valid
            && self.last_gamma.as_ref().is_some_and(|last| {
                last.len() == gamma.len()
                    && last
                        .iter()
                        .zip(gamma.iter())
                        .all(|(a, b)| a.to_bits() == b.to_bits())
            })
    }

    /// Returns the factors for `gamma`, recomputing them when gamma differs
    /// from the cached key.
    pub fn factors_for(
        &mut self,
        groups: &[Group],
        gamma: ArrayView1<f64>,
    ) -> Result<Arc<Vec<GroupFactor>>, NumericalError> {
        if self.matches(gamma) {
            return Ok(Arc::clone(&self.factors));
        }

        self.valid = false;
        let factors = Arc::new(factorize_groups(groups, gamma)?);
        self.recomputations += 1;
        log::debug!(
            "Recomputed covariance factors for {} groups (recomputation #{}).",
            groups.len(),
            self.recomputations
        );

        self.last_gamma = Some(gamma.to_owned());
        self.factors = Arc::clone(&factors);
        self.valid = true;
        Ok(factors)
    }

    pub fn invalidate(&mut self) {
        self.valid = false;
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// How many times the factors have been rebuilt since construction.
    pub fn recomputations(&self) -> usize {
        self.recomputations
    }
}
