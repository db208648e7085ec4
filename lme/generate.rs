//! Seeded synthesis of linear mixed-effects problems.
//!
//! The generator lays out the columns in a fixed canonical order:
//!
//! - fixed effects: the intercept, then every feature labelled `1` or `3`;
//! - random effects: the intercept (only with `random_intercept`), then every
//!   feature labelled `2` or `3`.
//!
//! Each group draws its own random effects `u_g ~ N(0, diag(gamma))` and the
//! observations follow `y_g = X_g beta + Z_g u_g + obs_std * eps`.

use crate::problem::{ConfigurationError, FeatureLabel, Group, LinearLmeProblem};
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

/// Everything the generator needs to build a problem deterministically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Number of observations in each group.
    pub groups_sizes: Vec<usize>,
    /// Role of each generated feature column.
    pub features_labels: Vec<FeatureLabel>,
    /// Adds a random intercept at gamma index 0, linked to the fixed intercept.
    pub random_intercept: bool,
    /// Standard deviation of the observation noise.
    pub obs_std: f64,
    pub seed: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            groups_sizes: vec![10; 5],
            features_labels: vec![FeatureLabel::FixedAndRandom],
            random_intercept: false,
            obs_std: 0.1,
            seed: 0,
        }
    }
}

/// The ground-truth parameters observations were simulated from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrueParameters {
    pub beta: Array1<f64>,
    pub gamma: Array1<f64>,
    /// Per-group random effects that were drawn, in group order.
    pub random_effects: Vec<Array1<f64>>,
}

/// Column bookkeeping derived from the feature labels.
struct ColumnLayout {
    /// Feature indices that become fixed-effect columns, after the intercept.
    fixed_features: Vec<usize>,
    /// Feature indices that become random-effect columns, after the optional intercept.
    random_features: Vec<usize>,
    random_intercept: bool,
}

impl ColumnLayout {
    fn new(labels: &[FeatureLabel], random_intercept: bool) -> Self {
        let fixed_features = (0..labels.len()).filter(|&i| labels[i].is_fixed()).collect();
        let random_features = (0..labels.len()).filter(|&i| labels[i].is_random()).collect();
        Self {
            fixed_features,
            random_features,
            random_intercept,
        }
    }

    fn num_fixed_effects(&self) -> usize {
        1 + self.fixed_features.len()
    }

    fn num_random_effects(&self) -> usize {
        usize::from(self.random_intercept) + self.random_features.len()
    }

    fn beta_to_gamma_map(&self) -> Vec<Option<usize>> {
        let offset = usize::from(self.random_intercept);
        let intercept = self.random_intercept.then_some(0);
        std::iter::once(intercept)
            .chain(self.fixed_features.iter().map(|feature| {
                self.random_features
                    .iter()
                    .position(|candidate| candidate == feature)
                    .map(|k| k + offset)
            }))
            .collect()
    }

    fn fixed_design(&self, features: &Array2<f64>) -> Array2<f64> {
        let n = features.nrows();
        Array2::from_shape_fn((n, self.num_fixed_effects()), |(i, j)| match j {
            0 => 1.0,
            _ => features[(i, self.fixed_features[j - 1])],
        })
    }

    fn random_design(&self, features: &Array2<f64>) -> Array2<f64> {
        let n = features.nrows();
        let offset = usize::from(self.random_intercept);
        Array2::from_shape_fn((n, self.num_random_effects()), |(i, k)| {
            if k < offset {
                1.0
            } else {
                features[(i, self.random_features[k - offset])]
            }
        })
    }
}

impl LinearLmeProblem {
    /// Generates a problem from a seeded `StdRng`.
    pub fn generate(
        config: &GenerationConfig,
    ) -> Result<(LinearLmeProblem, TrueParameters), ConfigurationError> {
        let mut rng = StdRng::seed_from_u64(config.seed);
        Self::generate_with_rng(config, &mut rng)
    }

    /// Generates a problem, drawing every random quantity from `rng`.
    pub fn generate_with_rng<R: Rng>(
        config: &GenerationConfig,
        rng: &mut R,
    ) -> Result<(LinearLmeProblem, TrueParameters), ConfigurationError> {
        validate_config(config)?;

        let layout = ColumnLayout::new(&config.features_labels, config.random_intercept);
        let beta = Array1::<f64>::ones(layout.num_fixed_effects());
        let gamma = Array1::<f64>::ones(layout.num_random_effects());
        let obs_var = config.obs_std * config.obs_std;

        let mut groups = Vec::with_capacity(config.groups_sizes.len());
        let mut random_effects = Vec::with_capacity(config.groups_sizes.len());

        for (id, &n) in config.groups_sizes.iter().enumerate() {
            let features = Array2::from_shape_simple_fn((n, config.features_labels.len()), || {
                rng.sample::<f64, _>(StandardNormal)
            });
            let x = layout.fixed_design(&features);
            let z = layout.random_design(&features);

            let u = gamma.mapv(|variance| variance.sqrt() * rng.sample::<f64, _>(StandardNormal));
            let noise =
                Array1::from_shape_simple_fn(n, || config.obs_std * rng.sample::<f64, _>(StandardNormal));
            let y = x.dot(&beta) + z.dot(&u) + noise;

            groups.push(Group {
                id,
                x,
                z,
                y,
                obs_var: Array1::from_elem(n, obs_var),
            });
            random_effects.push(u);
        }

        let problem = LinearLmeProblem::new(groups, layout.beta_to_gamma_map())?;
        log::info!(
            "Generated problem with {} groups, {} observations, {} fixed and {} random effects.",
            problem.num_groups(),
            problem.num_observations(),
            problem.num_fixed_effects(),
            problem.num_random_effects()
        );

        Ok((
            problem,
            TrueParameters {
                beta,
                gamma,
                random_effects,
            },
        ))
    }
}

fn validate_config(config: &GenerationConfig) -> Result<(), ConfigurationError> {
    if config.groups_sizes.is_empty() {
        return Err(ConfigurationError::NoGroups);
    }
    if let Some(group) = config.groups_sizes.iter().position(|&n| n == 0) {
        return Err(ConfigurationError::EmptyGroup { group });
    }
    if !(config.obs_std.is_finite() && config.obs_std > 0.0) {
        return Err(ConfigurationError::InvalidObservationStd(config.obs_std));
    }
    Ok(())
}
