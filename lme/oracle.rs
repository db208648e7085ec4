//! # Linear Mixed-Effects Oracle
//!
//! The oracle evaluates the marginal negative log-likelihood of a linear
//! mixed-effects model and its derivatives. For group `g`, with residual
//! `xi_g = y_g - X_g beta` and covariance
//! `Omega_g = Z_g diag(gamma) Z_g^T + diag(obs_var_g)`, the loss is
//!
//! ```text
//! L(beta, gamma) = sum_g  1/2 xi_g^T Omega_g^{-1} xi_g + 1/2 log det Omega_g
//! ```
//!
//! The constant `n/2 log(2 pi)` is dropped because it never affects a
//! comparison between two parameter values.
//!
//! Because `dOmega_g / dgamma_k = z_k z_k^T`, the gamma gradient reduces to
//!
//! ```text
//! dL/dgamma_k = sum_g  1/2 z_k^T Omega_g^{-1} z_k - 1/2 (z_k^T Omega_g^{-1} xi_g)^2
//! ```
//!
//! which is what [`LinearLmeOracle::gradient_gamma`] computes, one column sum per
//! random effect. Per-group terms are evaluated in parallel and reduced in
//! group order, so every result is deterministic.
//!
//! The oracle never optimizes anything. It only answers questions about a
//! given `(beta, gamma)`.

use crate::cache::{CovarianceCache, GroupFactor};
use crate::drop::LossEvaluator;
use crate::problem::{Group, LinearLmeProblem};
use ndarray::{Array1, Array2, ArrayView1, Axis};
use ndarray_linalg::Solve;
use ndarray_linalg::error::LinalgError;
use rayon::prelude::*;
use std::cell::RefCell;
use std::sync::Arc;
use thiserror::Error;

/// Failures of the linear algebra behind the oracle.
#[derive(Error, Debug)]
pub enum NumericalError {
    #[error(
        "The covariance matrix of group {group} is not positive definite. Gamma may contain negative variances. Error: {source}"
    )]
    CovarianceNotPositiveDefinite { group: usize, source: LinalgError },

    #[error("The log-determinant of the covariance matrix of group {group} is not finite.")]
    NonFiniteLogDeterminant { group: usize },

    #[error("The fixed-effects normal equations are singular. Error: {0}")]
    SingularFixedEffectsSystem(LinalgError),

    #[error("The loss evaluated to a non-finite value: {0}")]
    NonFiniteLoss(f64),
}

/// Errors returned by oracle evaluations.
#[derive(Error, Debug)]
pub enum OracleError {
    #[error("'{name}' has length {found}, but the problem expects {expected}.")]
    DimensionMismatch {
        name: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("Numerical failure while evaluating the oracle: {0}")]
    Numerical(#[from] NumericalError),
}

/// Loss and derivative oracle over a borrowed problem.
///
/// Holds a covariance cache keyed on the last gamma, so the oracle is not
/// `Sync`. Use one oracle per thread.
pub struct LinearLmeOracle<'a> {
    problem: &'a LinearLmeProblem,
    cache: RefCell<CovarianceCache>,
}

impl<'a> LinearLmeOracle<'a> {
    pub fn new(problem: &'a LinearLmeProblem) -> Self {
        Self {
            problem,
            cache: RefCell::new(CovarianceCache::new()),
        }
    }

    pub fn problem(&self) -> &'a LinearLmeProblem {
        self.problem
    }

    /// Number of times covariance factors have been rebuilt.
    pub fn cache_recomputations(&self) -> usize {
        self.cache.borrow().recomputations()
    }

    /// Discards the cached covariance factors.
    pub fn clear_cache(&self) {
        self.cache.borrow_mut().invalidate();
    }

    fn check_length(
        name: &'static str,
        vector: ArrayView1<f64>,
        expected: usize,
    ) -> Result<(), OracleError> {
        if vector.len() != expected {
            return Err(OracleError::DimensionMismatch {
                name,
                expected,
                found: vector.len(),
            });
        }
        Ok(())
    }

    fn check_beta(&self, beta: ArrayView1<f64>) -> Result<(), OracleError> {
        Self::check_length("beta", beta, self.problem.num_fixed_effects())
    }

    fn factors(&self, gamma: ArrayView1<f64>) -> Result<Arc<Vec<GroupFactor>>, OracleError> {
        Self::check_length("gamma", gamma, self.problem.num_random_effects())?;
        let factors = self
            .cache
            .borrow_mut()
            .factors_for(self.problem.groups(), gamma)?;
        Ok(factors)
    }

    /// Runs `f` on every group with its factor and returns the results in group order.
    fn per_group<T, F>(&self, factors: &[GroupFactor], f: F) -> Vec<T>
    where
        T: Send,
        F: Fn(&Group, &GroupFactor) -> T + Sync + Send,
    {
        self.problem
            .groups()
            .par_iter()
            .zip(factors.par_iter())
            .map(|(group, factor)| f(group, factor))
            .collect()
    }

    /// The negative log-likelihood at `(beta, gamma)`.
    pub fn loss(&self, beta: ArrayView1<f64>, gamma: ArrayView1<f64>) -> Result<f64, OracleError> {
        self.check_beta(beta)?;
        let factors = self.factors(gamma)?;
        let terms = self.per_group(&factors, |group, factor| group_loss(group, factor, beta));
        let total: f64 = terms.iter().sum();
        if !total.is_finite() {
            return Err(NumericalError::NonFiniteLoss(total).into());
        }
        Ok(total)
    }

    /// Gradient of the loss with respect to gamma, length `q`.
    pub fn gradient_gamma(
        &self,
        beta: ArrayView1<f64>,
        gamma: ArrayView1<f64>,
    ) -> Result<Array1<f64>, OracleError> {
        self.check_beta(beta)?;
        let factors = self.factors(gamma)?;
        let terms = self.per_group(&factors, |group, factor| {
            let residual = &group.y - &group.x.dot(&beta);
            let omega_inv_z = factor.omega_inv.dot(&group.z);
            // diag(Z^T Omega^{-1} Z) without forming the q x q product.
            let trace_terms = (&group.z * &omega_inv_z).sum_axis(Axis(0));
            let projected = omega_inv_z.t().dot(&residual);
            0.5 * (trace_terms - projected.mapv(|v| v * v))
        });
        Ok(sum_arrays(terms, self.problem.num_random_effects()))
    }

    /// Gradient of the loss with respect to beta, length `p`.
    pub fn gradient_beta(
        &self,
        beta: ArrayView1<f64>,
        gamma: ArrayView1<f64>,
    ) -> Result<Array1<f64>, OracleError> {
        self.check_beta(beta)?;
        let factors = self.factors(gamma)?;
        let terms = self.per_group(&factors, |group, factor| {
            let residual = &group.y - &group.x.dot(&beta);
            -group.x.t().dot(&factor.omega_inv.dot(&residual))
        });
        Ok(sum_arrays(terms, self.problem.num_fixed_effects()))
    }

    /// Hessian of the loss with respect to beta. It does not depend on beta.
    pub fn hessian_beta(&self, gamma: ArrayView1<f64>) -> Result<Array2<f64>, OracleError> {
        let factors = self.factors(gamma)?;
        let terms = self.per_group(&factors, |group, factor| {
            group.x.t().dot(&factor.omega_inv.dot(&group.x))
        });
        let p = self.problem.num_fixed_effects();
        Ok(sum_matrices(terms, p, p))
    }

    /// Hessian of the loss with respect to gamma.
    ///
    /// With `A_g = Z_g^T Omega_g^{-1} Z_g` and `a_g = Z_g^T Omega_g^{-1} xi_g`,
    /// the Hessian is `sum_g -1/2 A_g o A_g + (a_g a_g^T) o A_g`, where `o`
    /// is the elementwise product.
    pub fn hessian_gamma(
        &self,
        beta: ArrayView1<f64>,
        gamma: ArrayView1<f64>,
    ) -> Result<Array2<f64>, OracleError> {
        self.check_beta(beta)?;
        let factors = self.factors(gamma)?;
        let terms = self.per_group(&factors, |group, factor| {
            let residual = &group.y - &group.x.dot(&beta);
            let omega_inv_z = factor.omega_inv.dot(&group.z);
            let a_matrix = group.z.t().dot(&omega_inv_z);
            let projected = omega_inv_z.t().dot(&residual);
            let outer = projected
                .view()
                .insert_axis(Axis(1))
                .dot(&projected.view().insert_axis(Axis(0)));
            (&outer - &(0.5 * &a_matrix)) * &a_matrix
        });
        let q = self.problem.num_random_effects();
        Ok(sum_matrices(terms, q, q))
    }

    /// The beta minimizing the loss for fixed gamma (generalized least squares).
    pub fn optimal_beta(&self, gamma: ArrayView1<f64>) -> Result<Array1<f64>, OracleError> {
        let factors = self.factors(gamma)?;
        let terms = self.per_group(&factors, |group, factor| {
            let omega_inv_x = factor.omega_inv.dot(&group.x);
            (group.x.t().dot(&omega_inv_x), omega_inv_x.t().dot(&group.y))
        });

        let p = self.problem.num_fixed_effects();
        let (lhs, rhs) = terms.into_iter().fold(
            (Array2::<f64>::zeros((p, p)), Array1::<f64>::zeros(p)),
            |(lhs, rhs), (group_lhs, group_rhs)| (lhs + group_lhs, rhs + group_rhs),
        );
        let beta = lhs
            .solve_into(rhs)
            .map_err(NumericalError::SingularFixedEffectsSystem)?;
        Ok(beta)
    }

    /// Best linear unbiased predictions of each group's random effects,
    /// `u_g = diag(gamma) Z_g^T Omega_g^{-1} xi_g`, in group order.
    pub fn optimal_random_effects(
        &self,
        beta: ArrayView1<f64>,
        gamma: ArrayView1<f64>,
    ) -> Result<Vec<Array1<f64>>, OracleError> {
        self.check_beta(beta)?;
        let factors = self.factors(gamma)?;
        Ok(self.per_group(&factors, |group, factor| {
            let residual = &group.y - &group.x.dot(&beta);
            &gamma * &group.z.t().dot(&factor.omega_inv.dot(&residual))
        }))
    }
}

impl LossEvaluator for LinearLmeOracle<'_> {
    fn evaluate_loss(
        &self,
        beta: ArrayView1<f64>,
        gamma: ArrayView1<f64>,
    ) -> Result<f64, OracleError> {
        self.loss(beta, gamma)
    }
}

fn group_loss(group: &Group, factor: &GroupFactor, beta: ArrayView1<f64>) -> f64 {
    let residual = &group.y - &group.x.dot(&beta);
    0.5 * residual.dot(&factor.omega_inv.dot(&residual)) + 0.5 * factor.log_det
}

fn sum_arrays(terms: Vec<Array1<f64>>, len: usize) -> Array1<f64> {
    terms
        .into_iter()
        .fold(Array1::zeros(len), |total, term| total + term)
}

fn sum_matrices(terms: Vec<Array2<f64>>, rows: usize, cols: usize) -> Array2<f64> {
    terms
        .into_iter()
        .fold(Array2::zeros((rows, cols)), |total, term| total + term)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generate::GenerationConfig;
    use crate::problem::FeatureLabel;
    use approx::{assert_abs_diff_eq, assert_relative_eq};
    use ndarray::Array;
    use ndarray_linalg::{Determinant, Inverse};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn mixed_problem(seed: u64) -> LinearLmeProblem {
        let config = GenerationConfig {
            groups_sizes: vec![6, 3, 9],
            features_labels: vec![
                FeatureLabel::Fixed,
                FeatureLabel::Random,
                FeatureLabel::FixedAndRandom,
            ],
            random_intercept: true,
            obs_std: 0.3,
            seed,
        };
        LinearLmeProblem::generate(&config).unwrap().0
    }

    fn random_point(rng: &mut StdRng, problem: &LinearLmeProblem) -> (Array1<f64>, Array1<f64>) {
        let beta = Array::from_shape_fn(problem.num_fixed_effects(), |_| rng.gen_range(-1.0..1.0));
        let gamma = Array::from_shape_fn(problem.num_random_effects(), |_| rng.gen_range(0.0..1.0));
        (beta, gamma)
    }

    fn central_difference(f: impl Fn(f64) -> f64, x: f64, h: f64) -> f64 {
        (f(x + h) - f(x - h)) / (2.0 * h)
    }

    /// Evaluates the loss with an explicit inverse and determinant per group.
    fn dense_loss(problem: &LinearLmeProblem, beta: &Array1<f64>, gamma: &Array1<f64>) -> f64 {
        problem
            .groups()
            .iter()
            .map(|group| {
                let omega = group.z.dot(&Array2::from_diag(gamma)).dot(&group.z.t())
                    + Array2::from_diag(&group.obs_var);
                let residual = &group.y - &group.x.dot(beta);
                let quadratic = residual.dot(&omega.inv().unwrap().dot(&residual));
                0.5 * quadratic + 0.5 * omega.det().unwrap().ln()
            })
            .sum()
    }

    #[test]
    fn loss_matches_dense_evaluation() {
        let problem = mixed_problem(3);
        let oracle = LinearLmeOracle::new(&problem);
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..10 {
            let (beta, gamma) = random_point(&mut rng, &problem);
            let loss = oracle.loss(beta.view(), gamma.view()).unwrap();
            assert!(loss.is_finite());
            assert_relative_eq!(loss, dense_loss(&problem, &beta, &gamma), max_relative = 1e-10);
        }
    }

    #[test]
    fn loss_does_not_depend_on_group_order() {
        let problem = mixed_problem(5);
        let shuffled = problem.with_group_order(&[2, 0, 1]).unwrap();
        let oracle = LinearLmeOracle::new(&problem);
        let shuffled_oracle = LinearLmeOracle::new(&shuffled);
        let mut rng = StdRng::seed_from_u64(2);
        for _ in 0..10 {
            let (beta, gamma) = random_point(&mut rng, &problem);
            assert_relative_eq!(
                oracle.loss(beta.view(), gamma.view()).unwrap(),
                shuffled_oracle.loss(beta.view(), gamma.view()).unwrap(),
                max_relative = 1e-12
            );
        }
    }

    #[test]
    fn gamma_gradient_matches_finite_differences() {
        let problem = mixed_problem(8);
        let oracle = LinearLmeOracle::new(&problem);
        let mut rng = StdRng::seed_from_u64(8);
        let h = 1e-6;
        for _ in 0..10 {
            let (beta, gamma) = random_point(&mut rng, &problem);
            let gradient = oracle.gradient_gamma(beta.view(), gamma.view()).unwrap();
            for k in 0..gamma.len() {
                let numeric = central_difference(
                    |x| {
                        let mut shifted = gamma.clone();
                        shifted[k] = x;
                        oracle.loss(beta.view(), shifted.view()).unwrap()
                    },
                    gamma[k],
                    h,
                );
                assert_relative_eq!(gradient[k], numeric, epsilon = 1e-4, max_relative = 1e-4);
            }
        }
    }

    #[test]
    fn beta_gradient_matches_finite_differences() {
        let problem = mixed_problem(4);
        let oracle = LinearLmeOracle::new(&problem);
        let mut rng = StdRng::seed_from_u64(4);
        let (beta, gamma) = random_point(&mut rng, &problem);
        let gradient = oracle.gradient_beta(beta.view(), gamma.view()).unwrap();
        for j in 0..beta.len() {
            let numeric = central_difference(
                |x| {
                    let mut shifted = beta.clone();
                    shifted[j] = x;
                    oracle.loss(shifted.view(), gamma.view()).unwrap()
                },
                beta[j],
                1e-6,
            );
            assert_relative_eq!(gradient[j], numeric, epsilon = 1e-4, max_relative = 1e-4);
        }
    }

    #[test]
    fn hessians_match_finite_differences_of_gradients() {
        let problem = mixed_problem(6);
        let oracle = LinearLmeOracle::new(&problem);
        let mut rng = StdRng::seed_from_u64(6);
        let (beta, gamma) = random_point(&mut rng, &problem);
        let h = 1e-6;

        let hessian_beta = oracle.hessian_beta(gamma.view()).unwrap();
        for j in 0..beta.len() {
            let mut plus = beta.clone();
            let mut minus = beta.clone();
            plus[j] += h;
            minus[j] -= h;
            let column = (oracle.gradient_beta(plus.view(), gamma.view()).unwrap()
                - oracle.gradient_beta(minus.view(), gamma.view()).unwrap())
                / (2.0 * h);
            for i in 0..beta.len() {
                assert_relative_eq!(hessian_beta[(i, j)], column[i], epsilon = 1e-4, max_relative = 1e-4);
            }
        }

        let hessian_gamma = oracle.hessian_gamma(beta.view(), gamma.view()).unwrap();
        for ((i, j), value) in hessian_gamma.indexed_iter() {
            assert_abs_diff_eq!(*value, hessian_gamma[(j, i)], epsilon = 1e-10);
        }
        for k in 0..gamma.len() {
            let mut plus = gamma.clone();
            let mut minus = gamma.clone();
            plus[k] += h;
            minus[k] -= h;
            let column = (oracle.gradient_gamma(beta.view(), plus.view()).unwrap()
                - oracle.gradient_gamma(beta.view(), minus.view()).unwrap())
                / (2.0 * h);
            for l in 0..gamma.len() {
                assert_relative_eq!(hessian_gamma[(l, k)], column[l], epsilon = 1e-4, max_relative = 1e-4);
            }
        }
    }

    #[test]
    fn optimal_beta_zeroes_the_beta_gradient() {
        let problem = mixed_problem(9);
        let oracle = LinearLmeOracle::new(&problem);
        let gamma = Array1::from_elem(problem.num_random_effects(), 0.7);
        let beta = oracle.optimal_beta(gamma.view()).unwrap();
        let gradient = oracle.gradient_beta(beta.view(), gamma.view()).unwrap();
        for g in gradient.iter() {
            assert_abs_diff_eq!(*g, 0.0, epsilon = 1e-8);
        }
    }

    #[test]
    fn random_effects_match_the_mixed_model_equations() {
        let problem = mixed_problem(12);
        let oracle = LinearLmeOracle::new(&problem);
        let mut rng = StdRng::seed_from_u64(12);
        let (beta, gamma) = random_point(&mut rng, &problem);
        let effects = oracle.optimal_random_effects(beta.view(), gamma.view()).unwrap();
        assert_eq!(effects.len(), problem.num_groups());

        // u = (Z^T R^{-1} Z + G^{-1})^{-1} Z^T R^{-1} xi, with R = diag(obs_var), G = diag(gamma).
        for (group, u) in problem.groups().iter().zip(&effects) {
            let r_inv = Array2::from_diag(&group.obs_var.mapv(|v| 1.0 / v));
            let g_inv = Array2::from_diag(&gamma.mapv(|v| 1.0 / v));
            let residual = &group.y - &group.x.dot(&beta);
            let lhs = group.z.t().dot(&r_inv).dot(&group.z) + g_inv;
            let rhs = group.z.t().dot(&r_inv.dot(&residual));
            let expected = lhs.solve_into(rhs).unwrap();
            for (a, b) in u.iter().zip(expected.iter()) {
                assert_relative_eq!(*a, *b, epsilon = 1e-9, max_relative = 1e-8);
            }
        }
    }

    #[test]
    fn cached_and_fresh_evaluations_are_bit_identical() {
        let problem = mixed_problem(1);
        let oracle = LinearLmeOracle::new(&problem);
        let mut rng = StdRng::seed_from_u64(1);
        let (beta, gamma) = random_point(&mut rng, &problem);

        let first = oracle.loss(beta.view(), gamma.view()).unwrap();
        let cached = oracle.loss(beta.view(), gamma.view()).unwrap();
        assert_eq!(oracle.cache_recomputations(), 1);
        oracle.clear_cache();
        let fresh = oracle.loss(beta.view(), gamma.view()).unwrap();
        assert_eq!(oracle.cache_recomputations(), 2);
        assert_eq!(first.to_bits(), cached.to_bits());
        assert_eq!(first.to_bits(), fresh.to_bits());
    }

    #[test]
    fn wrong_lengths_are_reported() {
        let problem = mixed_problem(2);
        let oracle = LinearLmeOracle::new(&problem);
        let beta = Array1::zeros(problem.num_fixed_effects() + 1);
        let gamma = Array1::ones(problem.num_random_effects());
        assert!(matches!(
            oracle.loss(beta.view(), gamma.view()).unwrap_err(),
            OracleError::DimensionMismatch { name: "beta", .. }
        ));

        let beta = Array1::zeros(problem.num_fixed_effects());
        let gamma = Array1::ones(1);
        assert!(matches!(
            oracle.gradient_gamma(beta.view(), gamma.view()).unwrap_err(),
            OracleError::DimensionMismatch { name: "gamma", expected: 3, found: 1 }
        ));
    }

    #[test]
    fn strongly_negative_gamma_is_a_numerical_error() {
        let problem = mixed_problem(2);
        let oracle = LinearLmeOracle::new(&problem);
        let beta = Array1::zeros(problem.num_fixed_effects());
        let gamma = Array1::from_elem(problem.num_random_effects(), -50.0);
        assert!(matches!(
            oracle.loss(beta.view(), gamma.view()).unwrap_err(),
            OracleError::Numerical(NumericalError::CovarianceNotPositiveDefinite { .. })
        ));
    }
}
