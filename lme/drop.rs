//! Drop penalties: the exact loss increase caused by zeroing one coefficient.
//!
//! The calculator does not know anything about mixed models. It only needs a
//! [`LossEvaluator`] and the beta-to-gamma linkage, and it evaluates
//!
//! - `drop_gamma[k] = L(beta, gamma with gamma_k = 0) - L(beta, gamma)`,
//! - `drop_beta[j]  = L(beta with beta_j = 0, gamma') - L(beta, gamma)`,
//!
//! where `gamma'` also zeroes the gamma linked to `beta_j`, if there is one.
//! A coefficient that is already zero has a drop penalty of exactly `0.0`.
//!
//! Every entry is obtained from the evaluator itself, so the values agree with
//! recomputing the loss twice and subtracting.

use crate::oracle::OracleError;
use ndarray::{Array1, ArrayView1};

/// Anything that can evaluate the loss at `(beta, gamma)`.
pub trait LossEvaluator {
    fn evaluate_loss(
        &self,
        beta: ArrayView1<f64>,
        gamma: ArrayView1<f64>,
    ) -> Result<f64, OracleError>;
}

impl<F> LossEvaluator for F
where
    F: Fn(ArrayView1<f64>, ArrayView1<f64>) -> Result<f64, OracleError>,
{
    fn evaluate_loss(
        &self,
        beta: ArrayView1<f64>,
        gamma: ArrayView1<f64>,
    ) -> Result<f64, OracleError> {
        self(beta, gamma)
    }
}

/// Storage for the most recently computed drop penalties.
///
/// The vectors describe whatever `(beta, gamma)` was passed to the last
/// [`DropPenalties::recalculate`] call. They are not refreshed automatically.
#[derive(Debug, Clone)]
pub struct DropPenalties {
    beta: Array1<f64>,
    gamma: Array1<f64>,
}

impl DropPenalties {
    pub fn new(num_fixed_effects: usize, num_random_effects: usize) -> Self {
        Self {
            beta: Array1::zeros(num_fixed_effects),
            gamma: Array1::zeros(num_random_effects),
        }
    }

    pub fn beta(&self) -> ArrayView1<'_, f64> {
        self.beta.view()
    }

    pub fn gamma(&self) -> ArrayView1<'_, f64> {
        self.gamma.view()
    }

    /// Recomputes both penalty vectors for `(beta, gamma)`.
    ///
    /// Evaluations are ordered so that everything sharing a gamma runs
    /// back to back, which keeps a gamma-keyed cache in the evaluator warm.
    pub fn recalculate<E>(
        &mut self,
        evaluator: &E,
        beta_to_gamma_map: &[Option<usize>],
        beta: ArrayView1<f64>,
        gamma: ArrayView1<f64>,
    ) -> Result<(), OracleError>
    where
        E: LossEvaluator + ?Sized,
    {
        let p = beta.len();
        let q = gamma.len();
        if beta_to_gamma_map.len() != p {
            return Err(OracleError::DimensionMismatch {
                name: "beta_to_gamma_map",
                expected: p,
                found: beta_to_gamma_map.len(),
            });
        }

        let baseline = evaluator.evaluate_loss(beta, gamma)?;
        let mut drop_beta = Array1::zeros(p);
        let mut drop_gamma = Array1::zeros(q);
        let mut sparse_beta = beta.to_owned();
        let mut sparse_gamma = gamma.to_owned();

        // Unlinked betas keep the original gamma.
        for (j, target) in beta_to_gamma_map.iter().enumerate() {
            if target.is_some() || beta[j] == 0.0 {
                continue;
            }
            sparse_beta[j] = 0.0;
            drop_beta[j] = evaluator.evaluate_loss(sparse_beta.view(), gamma)? - baseline;
            sparse_beta[j] = beta[j];
            log::trace!("drop_beta[{j}] = {:.6e}", drop_beta[j]);
        }

        for k in 0..q {
            let linked_beta = beta_to_gamma_map.iter().position(|&t| t == Some(k));
            if gamma[k] != 0.0 {
                sparse_gamma[k] = 0.0;
                drop_gamma[k] = evaluator.evaluate_loss(beta, sparse_gamma.view())? - baseline;
                log::trace!("drop_gamma[{k}] = {:.6e}", drop_gamma[k]);
            }
            if let Some(j) = linked_beta.filter(|&j| beta[j] != 0.0) {
                sparse_beta[j] = 0.0;
                drop_beta[j] =
                    evaluator.evaluate_loss(sparse_beta.view(), sparse_gamma.view())? - baseline;
                sparse_beta[j] = beta[j];
                log::trace!("drop_beta[{j}] = {:.6e} (joint with gamma {k})", drop_beta[j]);
            }
            sparse_gamma[k] = gamma[k];
        }

        self.beta = drop_beta;
        self.gamma = drop_gamma;
        Ok(())
    }
}
