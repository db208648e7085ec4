//! # Weighted Oracle With Drop Penalties
//!
//! `LinearLmeOracleW` composes three pieces:
//!
//! 1. the base [`LinearLmeOracle`], which answers every loss and gradient query,
//! 2. a [`DropPenalties`] calculator that uses the base oracle as its loss evaluator,
//! 3. the selection settings: the relaxation weights `lb`, `lg` and the sparsity
//!    budgets `nnz_tbeta`, `nnz_tgamma`.
//!
//! Sparse selection works on the drop penalties. Coefficients whose removal
//! would increase the loss the most are kept, up to the budget; everything else
//! is set to zero in the target vectors `tbeta`, `tgamma`. The relaxed loss then
//! couples the parameters to those targets:
//!
//! ```text
//! L_relaxed = L(beta, gamma) + lb/2 |beta - tbeta|^2 + lg/2 |gamma - tgamma|^2
//! ```

use crate::drop::DropPenalties;
use crate::oracle::{LinearLmeOracle, OracleError};
use crate::problem::{ConfigurationError, LinearLmeProblem};
use itertools::Itertools;
use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};

/// Relaxation weights and sparsity budgets for the weighted oracle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SelectionSettings {
    /// Weight of the coupling between beta and its sparse target.
    pub lb: f64,
    /// Weight of the coupling between gamma and its sparse target.
    pub lg: f64,
    /// Maximum number of nonzero entries in the beta target.
    pub nnz_tbeta: usize,
    /// Maximum number of nonzero entries in the gamma target.
    pub nnz_tgamma: usize,
}

impl SelectionSettings {
    /// No relaxation and no sparsity: every coefficient may stay nonzero.
    pub fn for_problem(problem: &LinearLmeProblem) -> Self {
        Self {
            lb: 0.0,
            lg: 0.0,
            nnz_tbeta: problem.num_fixed_effects(),
            nnz_tgamma: problem.num_random_effects(),
        }
    }

    fn validate(&self, problem: &LinearLmeProblem) -> Result<(), ConfigurationError> {
        for (name, value) in [("lb", self.lb), ("lg", self.lg)] {
            if !(value.is_finite() && value >= 0.0) {
                return Err(ConfigurationError::InvalidRegularization { name, value });
            }
        }
        let budgets = [
            ("nnz_tbeta", self.nnz_tbeta, problem.num_fixed_effects()),
            ("nnz_tgamma", self.nnz_tgamma, problem.num_random_effects()),
        ];
        for (name, found, available) in budgets {
            if found > available {
                return Err(ConfigurationError::SparsityBudgetTooLarge {
                    name,
                    found,
                    available,
                });
            }
        }
        Ok(())
    }
}

/// The base oracle extended with drop penalties and sparse targets.
pub struct LinearLmeOracleW<'a> {
    oracle: LinearLmeOracle<'a>,
    settings: SelectionSettings,
    drops: DropPenalties,
}

impl<'a> LinearLmeOracleW<'a> {
    pub fn new(
        problem: &'a LinearLmeProblem,
        settings: SelectionSettings,
    ) -> Result<Self, ConfigurationError> {
        settings.validate(problem)?;
        Ok(Self {
            oracle: LinearLmeOracle::new(problem),
            settings,
            drops: DropPenalties::new(problem.num_fixed_effects(), problem.num_random_effects()),
        })
    }

    /// The underlying loss and gradient oracle.
    pub fn oracle(&self) -> &LinearLmeOracle<'a> {
        &self.oracle
    }

    pub fn settings(&self) -> &SelectionSettings {
        &self.settings
    }

    pub fn beta_to_gamma_map(&self) -> &'a [Option<usize>] {
        self.oracle.problem().beta_to_gamma_map()
    }

    pub fn loss(&self, beta: ArrayView1<f64>, gamma: ArrayView1<f64>) -> Result<f64, OracleError> {
        self.oracle.loss(beta, gamma)
    }

    pub fn gradient_gamma(
        &self,
        beta: ArrayView1<f64>,
        gamma: ArrayView1<f64>,
    ) -> Result<Array1<f64>, OracleError> {
        self.oracle.gradient_gamma(beta, gamma)
    }

    /// Recomputes the drop penalties for `(beta, gamma)`.
    ///
    /// Until this is called again, [`Self::drop_penalties_beta`] and
    /// [`Self::drop_penalties_gamma`] describe these parameters, even if the
    /// caller has moved on to others.
    pub fn recalculate_drop_matrices(
        &mut self,
        beta: ArrayView1<f64>,
        gamma: ArrayView1<f64>,
    ) -> Result<(), OracleError> {
        let map = self.oracle.problem().beta_to_gamma_map();
        self.drops.recalculate(&self.oracle, map, beta, gamma)?;
        log::debug!(
            "Recalculated drop penalties: beta {:?}, gamma {:?}",
            self.drops.beta().to_vec(),
            self.drops.gamma().to_vec()
        );
        Ok(())
    }

    pub fn drop_penalties_beta(&self) -> ArrayView1<'_, f64> {
        self.drops.beta()
    }

    pub fn drop_penalties_gamma(&self) -> ArrayView1<'_, f64> {
        self.drops.gamma()
    }

    /// Sparse targets chosen by the drop penalties at `(beta, gamma)`.
    ///
    /// Refreshes the drop matrices, then keeps the `nnz_tbeta` beta entries and
    /// `nnz_tgamma` gamma entries with the largest penalties. Ties go to the
    /// lower index.
    pub fn sparse_targets(
        &mut self,
        beta: ArrayView1<f64>,
        gamma: ArrayView1<f64>,
    ) -> Result<(Array1<f64>, Array1<f64>), OracleError> {
        self.recalculate_drop_matrices(beta, gamma)?;
        let tbeta = keep_largest(beta, self.drops.beta(), self.settings.nnz_tbeta);
        let tgamma = keep_largest(gamma, self.drops.gamma(), self.settings.nnz_tgamma);
        Ok((tbeta, tgamma))
    }

    /// The loss plus the quadratic coupling to the sparse targets.
    pub fn relaxed_loss(
        &self,
        beta: ArrayView1<f64>,
        gamma: ArrayView1<f64>,
        tbeta: ArrayView1<f64>,
        tgamma: ArrayView1<f64>,
    ) -> Result<f64, OracleError> {
        let loss = self.oracle.loss(beta, gamma)?;
        let beta_gap = squared_distance("tbeta", beta, tbeta)?;
        let gamma_gap = squared_distance("tgamma", gamma, tgamma)?;
        Ok(loss + 0.5 * self.settings.lb * beta_gap + 0.5 * self.settings.lg * gamma_gap)
    }

    pub fn relaxed_gradient_beta(
        &self,
        beta: ArrayView1<f64>,
        gamma: ArrayView1<f64>,
        tbeta: ArrayView1<f64>,
    ) -> Result<Array1<f64>, OracleError> {
        check_same_length("tbeta", beta, tbeta)?;
        let gradient = self.oracle.gradient_beta(beta, gamma)?;
        Ok(gradient + self.settings.lb * (&beta - &tbeta))
    }

    pub fn relaxed_gradient_gamma(
        &self,
        beta: ArrayView1<f64>,
        gamma: ArrayView1<f64>,
        tgamma: ArrayView1<f64>,
    ) -> Result<Array1<f64>, OracleError> {
        check_same_length("tgamma", gamma, tgamma)?;
        let gradient = self.oracle.gradient_gamma(beta, gamma)?;
        Ok(gradient + self.settings.lg * (&gamma - &tgamma))
    }
}

/// Copies `values`, zeroing every entry outside the `budget` largest penalties.
fn keep_largest(values: ArrayView1<f64>, penalties: ArrayView1<f64>, budget: usize) -> Array1<f64> {
    let kept = penalties
        .iter()
        .enumerate()
        .sorted_by(|(i, a), (j, b)| b.total_cmp(a).then(i.cmp(j)))
        .take(budget)
        .map(|(index, _)| index)
        .collect::<Vec<_>>();

    Array1::from_shape_fn(values.len(), |i| {
        if kept.contains(&i) { values[i] } else { 0.0 }
    })
}

fn check_same_length(
    name: &'static str,
    vector: ArrayView1<f64>,
    target: ArrayView1<f64>,
) -> Result<(), OracleError> {
    if vector.len() != target.len() {
        return Err(OracleError::DimensionMismatch {
            name,
            expected: vector.len(),
            found: target.len(),
        });
    }
    Ok(())
}

fn squared_distance(
    name: &'static str,
    vector: ArrayView1<f64>,
    target: ArrayView1<f64>,
) -> Result<f64, OracleError> {
    check_same_length(name, vector, target)?;
    Ok(vector
        .iter()
        .zip(target.iter())
        .map(|(v, t)| (v - t) * (v - t))
        .sum())
}
