use approx::assert_relative_eq;
use ndarray::{Array1, ArrayView1, array};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sparselme::{
    FeatureLabel, GenerationConfig, LinearLmeOracle, LinearLmeOracleW, LinearLmeProblem,
    SelectionSettings,
};

const TRIALS: usize = 100;
const TOLERANCE: f64 = 1e-10;

fn reference_problem() -> LinearLmeProblem {
    let config = GenerationConfig {
        groups_sizes: vec![20, 5, 10, 50],
        features_labels: vec![
            FeatureLabel::Fixed,
            FeatureLabel::Random,
            FeatureLabel::FixedAndRandom,
            FeatureLabel::FixedAndRandom,
        ],
        random_intercept: true,
        obs_std: 0.1,
        seed: 42,
    };
    LinearLmeProblem::generate(&config).unwrap().0
}

fn uniform(rng: &mut StdRng, len: usize) -> Array1<f64> {
    Array1::from_shape_simple_fn(len, || rng.gen_range(0.0..1.0))
}

#[test]
fn drop_penalties_match_brute_force_loss_differences() {
    let problem = reference_problem();
    let simple = LinearLmeOracle::new(&problem);
    let mut oracle = LinearLmeOracleW::new(&problem, SelectionSettings::for_problem(&problem))
        .expect("default settings are valid");
    let map = problem.beta_to_gamma_map();

    let mut rng = StdRng::seed_from_u64(42);
    for trial in 0..TRIALS {
        let beta = uniform(&mut rng, problem.num_fixed_effects());
        let gamma = uniform(&mut rng, problem.num_random_effects());

        let loss = simple.loss(beta.view(), gamma.view()).unwrap();
        oracle.recalculate_drop_matrices(beta.view(), gamma.view()).unwrap();
        let drop_beta = oracle.drop_penalties_beta();
        let drop_gamma = oracle.drop_penalties_gamma();

        for (j, link) in map.iter().enumerate() {
            let mut sparse_beta = beta.clone();
            sparse_beta[j] = 0.0;
            let mut sparse_gamma = gamma.clone();

            let dropped = match *link {
                Some(k) => {
                    sparse_gamma[k] = 0.0;
                    let gamma_only = simple.loss(beta.view(), sparse_gamma.view()).unwrap();
                    assert_relative_eq!(
                        gamma_only - loss,
                        drop_gamma[k],
                        epsilon = TOLERANCE,
                        max_relative = TOLERANCE
                    );
                    simple.loss(sparse_beta.view(), sparse_gamma.view()).unwrap()
                }
                None => simple.loss(sparse_beta.view(), gamma.view()).unwrap(),
            };
            assert!(
                ((dropped - loss) - drop_beta[j]).abs()
                    <= TOLERANCE + TOLERANCE * drop_beta[j].abs(),
                "trial {trial}: drop_beta[{j}] = {} but brute force gives {}",
                drop_beta[j],
                dropped - loss
            );
        }

        // Random-only effects are not linked to any beta and still get a penalty.
        for k in (0..problem.num_random_effects()).filter(|k| !map.contains(&Some(*k))) {
            let mut sparse_gamma = gamma.clone();
            sparse_gamma[k] = 0.0;
            let gamma_only = simple.loss(beta.view(), sparse_gamma.view()).unwrap();
            assert_relative_eq!(
                gamma_only - loss,
                drop_gamma[k],
                epsilon = TOLERANCE,
                max_relative = TOLERANCE
            );
        }
    }
}

#[test]
fn zero_coefficients_have_zero_drop_penalties() {
    let problem = reference_problem();
    let mut oracle =
        LinearLmeOracleW::new(&problem, SelectionSettings::for_problem(&problem)).unwrap();

    let mut sparse_beta = Array1::<f64>::zeros(problem.num_fixed_effects());
    let mut sparse_gamma = Array1::<f64>::zeros(problem.num_random_effects());
    sparse_beta[0] = 1.0;
    sparse_beta[1] = 1.0;
    sparse_gamma[0] = 1.0;

    oracle
        .recalculate_drop_matrices(sparse_beta.view(), sparse_gamma.view())
        .unwrap();
    assert!(oracle.drop_penalties_gamma().iter().skip(1).all(|&w| w == 0.0));
    assert!(oracle.drop_penalties_beta().iter().skip(2).all(|&w| w == 0.0));
    assert!(oracle.drop_penalties_beta()[0] != 0.0);
    assert!(oracle.drop_penalties_gamma()[0] != 0.0);
}

#[test]
fn recalculation_is_deterministic_and_ignores_cache_state() {
    let problem = reference_problem();
    let mut warm =
        LinearLmeOracleW::new(&problem, SelectionSettings::for_problem(&problem)).unwrap();
    let mut cold =
        LinearLmeOracleW::new(&problem, SelectionSettings::for_problem(&problem)).unwrap();

    let beta = array![0.4, 0.9, 0.2, 0.7];
    let gamma = array![0.3, 0.8, 0.6, 0.5];

    // Prime one cache with unrelated parameters first.
    warm.loss(beta.view(), array![1.0, 1.0, 1.0, 1.0].view()).unwrap();
    warm.recalculate_drop_matrices(beta.view(), gamma.view()).unwrap();
    cold.recalculate_drop_matrices(beta.view(), gamma.view()).unwrap();

    let bits = |values: ArrayView1<f64>| values.iter().map(|v| v.to_bits()).collect::<Vec<_>>();
    assert_eq!(bits(warm.drop_penalties_beta()), bits(cold.drop_penalties_beta()));
    assert_eq!(bits(warm.drop_penalties_gamma()), bits(cold.drop_penalties_gamma()));
}

#[test]
fn penalties_are_stale_until_recalculated() {
    let problem = reference_problem();
    let mut oracle =
        LinearLmeOracleW::new(&problem, SelectionSettings::for_problem(&problem)).unwrap();
    let beta = array![0.5, 0.5, 0.5, 0.5];
    let gamma = array![0.5, 0.5, 0.5, 0.5];

    oracle.recalculate_drop_matrices(beta.view(), gamma.view()).unwrap();
    let before = oracle.drop_penalties_beta().to_owned();

    let moved = array![2.0, 2.0, 2.0, 2.0];
    oracle.loss(moved.view(), gamma.view()).unwrap();
    assert_eq!(oracle.drop_penalties_beta(), before);

    oracle.recalculate_drop_matrices(moved.view(), gamma.view()).unwrap();
    assert_ne!(oracle.drop_penalties_beta(), before);
}
