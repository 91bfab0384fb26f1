use approx::assert_relative_eq;
use rand::{rngs::StdRng, Rng, SeedableRng};
use stokes_mobility::kernel::{oseen_tensor_direct, DirectEvaluator, KernelProvider, Treecode};
use stokes_mobility::linalg::entry;
use stokes_mobility::params::KernelOptions;
use stokes_mobility::traits::StokesEvaluator;
use stokes_mobility::types::EvalType;

extern crate blas_src;
extern crate lapack_src;

fn cloud(n: usize, offset: [f64; 3], rng: &mut StdRng) -> Vec<f64> {
    (0..n)
        .flat_map(|_| {
            [
                offset[0] + rng.gen::<f64>(),
                offset[1] + rng.gen::<f64>(),
                offset[2] + rng.gen::<f64>(),
            ]
        })
        .collect()
}

fn values(n: usize, rng: &mut StdRng) -> Vec<f64> {
    (0..n).map(|_| rng.gen::<f64>() - 0.5).collect()
}

fn relative_error(approx: &[f64], exact: &[f64]) -> f64 {
    let diff: f64 = approx
        .iter()
        .zip(exact)
        .map(|(a, e)| (a - e) * (a - e))
        .sum();
    let norm: f64 = exact.iter().map(|e| e * e).sum();
    (diff / norm).sqrt()
}

fn treecode_options() -> KernelOptions {
    let mut options = KernelOptions::default();
    options
        .treecode_mut()
        .set_degree(5)
        .set_theta(0.5)
        .set_max_leaf_size(32);
    options
}

#[test]
fn test_oseen_reciprocity() {
    let mut rng = StdRng::seed_from_u64(1);
    let points = cloud(40, [0.0; 3], &mut rng);
    let g = oseen_tensor_direct(&points, &points, 1.3, &KernelOptions::default());
    for i in 0..120 {
        for j in 0..120 {
            assert_relative_eq!(entry(&g, i, j), entry(&g, j, i), max_relative = 1e-12);
        }
    }
}

#[test]
fn test_treecode_matches_direct_for_separated_clouds() {
    let mut rng = StdRng::seed_from_u64(2);
    let options = treecode_options();
    let sources = cloud(3000, [0.0; 3], &mut rng);
    let targets = cloud(200, [3.0, 0.5, 0.0], &mut rng);
    let forces = values(9000, &mut rng);
    let normals = values(9000, &mut rng);
    let densities = values(9000, &mut rng);

    let direct = DirectEvaluator::new(1.0, &options);
    let treecode = Treecode::new(1.0, &options);

    for eval_type in [EvalType::Velocity, EvalType::PressureVelocity] {
        let size = eval_type.component_count() * 200;
        let mut exact = vec![0.0; size];
        let mut approx = vec![0.0; size];
        direct.evaluate_single_layer(eval_type, &sources, &forces, &targets, &mut exact);
        treecode.evaluate_single_layer(eval_type, &sources, &forces, &targets, &mut approx);
        assert!(relative_error(&approx, &exact) < 1e-3);

        direct.evaluate_double_layer(eval_type, &sources, &normals, &densities, &targets, &mut exact);
        treecode.evaluate_double_layer(eval_type, &sources, &normals, &densities, &targets, &mut approx);
        assert!(relative_error(&approx, &exact) < 1e-3);
    }
    assert!(treecode.cluster_count() > 1);
}

#[test]
fn test_treecode_matches_direct_on_same_cloud() {
    let mut rng = StdRng::seed_from_u64(3);
    let options = treecode_options();
    let points = cloud(2500, [0.0; 3], &mut rng);
    let forces = values(7500, &mut rng);

    let mut exact = vec![0.0; 7500];
    let mut approx = vec![0.0; 7500];
    DirectEvaluator::new(0.7, &options).evaluate_single_layer(
        EvalType::Velocity,
        &points,
        &forces,
        &points,
        &mut exact,
    );
    Treecode::new(0.7, &options).evaluate_single_layer(
        EvalType::Velocity,
        &points,
        &forces,
        &points,
        &mut approx,
    );
    assert!(relative_error(&approx, &exact) < 1e-3);
}

#[test]
fn test_provider_clear_releases_tree() {
    let mut rng = StdRng::seed_from_u64(4);
    let mut options = treecode_options();
    options.set_direct_crossover(10);
    let provider = KernelProvider::new(1.0, &options);
    let points = cloud(500, [0.0; 3], &mut rng);
    let forces = values(1500, &mut rng);

    let first = provider.stokeslet_velocity(&points, &forces, &points);
    assert!(provider.treecode().is_populated());
    provider.clear();
    assert!(!provider.treecode().is_populated());

    // State from an earlier evaluation does not leak into the next one.
    let other = cloud(300, [5.0; 3], &mut rng);
    let _ = provider.stokeslet_velocity(&other, &values(900, &mut rng), &other);
    let again = provider.stokeslet_velocity(&points, &forces, &points);
    for (a, b) in first.iter().zip(again.iter()) {
        assert_relative_eq!(a, b, max_relative = 1e-12);
    }
}
