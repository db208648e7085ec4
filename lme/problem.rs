//! # Mixed-Effects Problem Representation
//!
//! A `LinearLmeProblem` is the immutable description of a grouped dataset:
//! for every group it holds the fixed-effects design `X_g`, the random-effects
//! design `Z_g`, the observations `y_g` and the per-observation noise variances.
//! It also records which fixed effects have a random-effect counterpart
//! (`beta_to_gamma_map`), which is what ties a beta coefficient to a gamma
//! variance when coefficients are dropped jointly.
//!
//! Problems are built either by the synthetic generator in
//! `crate::generate` or by assembling validated groups with
//! [`LinearLmeProblem::new`]. Oracles only ever borrow a problem.

use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use thiserror::Error;

/// Errors raised while constructing a problem or the settings that accompany it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigurationError {
    #[error("A problem needs at least one group, but none were provided.")]
    NoGroups,

    #[error("Group {group} has no observations. Every group must contain at least one row.")]
    EmptyGroup { group: usize },

    #[error(
        "The problem has {found} observations in total, but at least {required} are needed to identify {required} fixed effects."
    )]
    NotEnoughObservations { found: usize, required: usize },

    #[error("Feature label {0} is not recognised. Use 1 (fixed), 2 (random) or 3 (fixed and random).")]
    UnknownFeatureLabel(u8),

    #[error("The observation standard deviation must be finite and positive, got {0}.")]
    InvalidObservationStd(f64),

    #[error(
        "Group {group}: '{what}' has {found} rows, but the observation vector has {expected}."
    )]
    RowCountMismatch {
        group: usize,
        what: &'static str,
        expected: usize,
        found: usize,
    },

    #[error(
        "Group {group}: '{what}' has {found} columns, but the first group established {expected}."
    )]
    ColumnCountMismatch {
        group: usize,
        what: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("The beta-to-gamma map has {found} entries, but there are {expected} fixed effects.")]
    MapLengthMismatch { expected: usize, found: usize },

    #[error(
        "Fixed effect {beta_index} maps to gamma index {gamma_index}, but there are only {num_random_effects} random effects."
    )]
    MapTargetOutOfRange {
        beta_index: usize,
        gamma_index: usize,
        num_random_effects: usize,
    },

    #[error("Gamma index {0} is linked from more than one fixed effect. Linked features must map one-to-one.")]
    DuplicateMapTarget(usize),

    #[error("Group {group} contains non-finite values in '{what}'.")]
    NonFiniteData { group: usize, what: &'static str },

    #[error("Group {group} has a non-positive observation variance ({value}). Noise variances must be strictly positive.")]
    NonPositiveObservationVariance { group: usize, value: f64 },

    #[error("Group position {index} does not exist in this problem.")]
    InvalidGroupOrder { index: usize },

    #[error("The regularization weight '{name}' must be finite and non-negative, got {value}.")]
    InvalidRegularization { name: &'static str, value: f64 },

    #[error("The sparsity budget '{name}' is {found}, but only {available} coefficients exist.")]
    SparsityBudgetTooLarge {
        name: &'static str,
        found: usize,
        available: usize,
    },
}

/// The semantic role of a generated feature column.
///
/// In configuration files labels are written as integers: `1` for a fixed
/// effect only, `2` for a random effect only, `3` for both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum FeatureLabel {
    Fixed,
    Random,
    FixedAndRandom,
}

impl FeatureLabel {
    pub fn is_fixed(self) -> bool {
        matches!(self, FeatureLabel::Fixed | FeatureLabel::FixedAndRandom)
    }

    pub fn is_random(self) -> bool {
        matches!(self, FeatureLabel::Random | FeatureLabel::FixedAndRandom)
    }
}

impl TryFrom<u8> for FeatureLabel {
    type Error = ConfigurationError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(FeatureLabel::Fixed),
            2 => Ok(FeatureLabel::Random),
            3 => Ok(FeatureLabel::FixedAndRandom),
            other => Err(ConfigurationError::UnknownFeatureLabel(other)),
        }
    }
}

impl From<FeatureLabel> for u8 {
    fn from(label: FeatureLabel) -> Self {
        match label {
            FeatureLabel::Fixed => 1,
            FeatureLabel::Random => 2,
            FeatureLabel::FixedAndRandom => 3,
        }
    }
}

impl fmt::Display for FeatureLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", u8::from(*self))
    }
}

/// One partition of the dataset sharing a single random-effects draw.
#[derive(Debug, Clone)]
pub struct Group {
    /// Identifier of the group, unique within a problem.
    pub id: usize,
    /// Fixed-effects design matrix, shape `[n_g, p]`.
    pub x: Array2<f64>,
    /// Random-effects design matrix, shape `[n_g, q]`.
    pub z: Array2<f64>,
    /// Observations, length `n_g`.
    pub y: Array1<f64>,
    /// Noise variance of each observation, length `n_g`.
    pub obs_var: Array1<f64>,
}

impl Group {
    pub fn num_observations(&self) -> usize {
        self.y.len()
    }
}

/// An immutable, validated linear mixed-effects dataset.
#[derive(Debug, Clone)]
pub struct LinearLmeProblem {
    groups: Vec<Group>,
    num_fixed_effects: usize,
    num_random_effects: usize,
    beta_to_gamma_map: Vec<Option<usize>>,
}

impl LinearLmeProblem {
    /// Assembles a problem from groups, checking every dimensional and
    /// numerical invariant the oracles rely on.
    pub fn new(
        groups: Vec<Group>,
        beta_to_gamma_map: Vec<Option<usize>>,
    ) -> Result<Self, ConfigurationError> {
        let first = groups.first().ok_or(ConfigurationError::NoGroups)?;
        let num_fixed_effects = first.x.ncols();
        let num_random_effects = first.z.ncols();

        for group in &groups {
            validate_group(group, num_fixed_effects, num_random_effects)?;
        }
        validate_map(&beta_to_gamma_map, num_fixed_effects, num_random_effects)?;

        let num_observations: usize = groups.iter().map(Group::num_observations).sum();
        if num_observations < num_fixed_effects {
            return Err(ConfigurationError::NotEnoughObservations {
                found: num_observations,
                required: num_fixed_effects,
            });
        }

        Ok(Self {
            groups,
            num_fixed_effects,
            num_random_effects,
            beta_to_gamma_map,
        })
    }

    pub fn groups(&self) -> &[Group] {
        &self.groups
    }

    pub fn num_groups(&self) -> usize {
        self.groups.len()
    }

    /// Number of fixed effects `p`.
    pub fn num_fixed_effects(&self) -> usize {
        self.num_fixed_effects
    }

    /// Number of random effects `q`.
    pub fn num_random_effects(&self) -> usize {
        self.num_random_effects
    }

    pub fn num_observations(&self) -> usize {
        self.groups.iter().map(Group::num_observations).sum()
    }

    /// For each fixed effect, the gamma index of its random-effect counterpart.
    pub fn beta_to_gamma_map(&self) -> &[Option<usize>] {
        &self.beta_to_gamma_map
    }

    /// Returns a copy of the problem with its groups in a different order.
    /// `order` must be a permutation of `0..num_groups()`.
    pub fn with_group_order(&self, order: &[usize]) -> Result<Self, ConfigurationError> {
        let reordered = order
            .iter()
            .map(|&index| {
                self.groups
                    .get(index)
                    .cloned()
                    .ok_or(ConfigurationError::InvalidGroupOrder { index })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(reordered, self.beta_to_gamma_map.clone())
    }
}

fn validate_group(
    group: &Group,
    num_fixed_effects: usize,
    num_random_effects: usize,
) -> Result<(), ConfigurationError> {
    let n = group.y.len();
    if n == 0 {
        return Err(ConfigurationError::EmptyGroup { group: group.id });
    }

    let rows = [
        ("x", group.x.nrows()),
        ("z", group.z.nrows()),
        ("obs_var", group.obs_var.len()),
    ];
    for (what, found) in rows {
        if found != n {
            return Err(ConfigurationError::RowCountMismatch {
                group: group.id,
                what,
                expected: n,
                found,
            });
        }
    }

    if group.x.ncols() != num_fixed_effects {
        return Err(ConfigurationError::ColumnCountMismatch {
            group: group.id,
            what: "x",
            expected: num_fixed_effects,
            found: group.x.ncols(),
        });
    }
    if group.z.ncols() != num_random_effects {
        return Err(ConfigurationError::ColumnCountMismatch {
            group: group.id,
            what: "z",
            expected: num_random_effects,
            found: group.z.ncols(),
        });
    }

    let finite_checks = [
        ("x", group.x.iter().all(|v| v.is_finite())),
        ("z", group.z.iter().all(|v| v.is_finite())),
        ("y", group.y.iter().all(|v| v.is_finite())),
        ("obs_var", group.obs_var.iter().all(|v| v.is_finite())),
    ];
    for (what, finite) in finite_checks {
        if !finite {
            return Err(ConfigurationError::NonFiniteData {
                group: group.id,
                what,
            });
        }
    }

    if let Some(&value) = group.obs_var.iter().find(|&&v| v <= 0.0) {
        return Err(ConfigurationError::NonPositiveObservationVariance {
            group: group.id,
            value,
        });
    }

    Ok(())
}

fn validate_map(
    map: &[Option<usize>],
    num_fixed_effects: usize,
    num_random_effects: usize,
) -> Result<(), ConfigurationError> {
    if map.len() != num_fixed_effects {
        return Err(ConfigurationError::MapLengthMismatch {
            expected: num_fixed_effects,
            found: map.len(),
        });
    }

    let mut seen = HashSet::new();
    for (beta_index, target) in map.iter().enumerate() {
        let Some(gamma_index) = *target else {
            continue;
        };
        if gamma_index >= num_random_effects {
            return Err(ConfigurationError::MapTargetOutOfRange {
                beta_index,
                gamma_index,
                num_random_effects,
            });
        }
        if !seen.insert(gamma_index) {
            return Err(ConfigurationError::DuplicateMapTarget(gamma_index));
        }
    }
    Ok(())
}
