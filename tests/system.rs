use approx::assert_relative_eq;
use nalgebra::UnitQuaternion;
use rand::{rngs::StdRng, Rng, SeedableRng};
use stokes_mobility::body::{Body, BodyContainer, BodyPrecompute, BodyShape};
use stokes_mobility::collision::{check_collision, Collider};
use stokes_mobility::distribution::{DistributionPlan, SingleProcess};
use stokes_mobility::fiber::{Fiber, FiberContainer};
use stokes_mobility::geometry::fibonacci_sphere;
use stokes_mobility::params::Parameters;
use stokes_mobility::periphery::{Periphery, PeripheryPrecompute, PeripheryShape};
use stokes_mobility::system::{ExternalForcing, LinkConditions, SolutionLayout, System};
use stokes_mobility::traits::LocalOperator;
use stokes_mobility::types::Error;

extern crate blas_src;
extern crate lapack_src;

fn fiber(params: &Parameters, offset: [f64; 3]) -> Fiber {
    let mut fiber = Fiber::new(16, 1.0, 0.0025, params.eta, &params.fiber, &params.kernel).unwrap();
    fiber.translate(&offset);
    fiber
}

fn body(center: [f64; 3]) -> Body {
    Body::new(
        BodyPrecompute::sphere(30, 0.5).unwrap(),
        center,
        UnitQuaternion::identity(),
        BodyShape::Spherical { radius: 0.5 },
    )
}

/// A spherical shell whose precomputed operator is the identity.
fn shell(n: usize, radius: f64) -> Periphery {
    let (positions, normals) = fibonacci_sphere(n, radius);
    let normals = normals.iter().map(|v| -v).collect();
    let size = 3 * n;
    let mut identity = vec![0.0; size * size];
    for i in 0..size {
        identity[i * size + i] = 1.0;
    }
    let precompute =
        PeripheryPrecompute::new(positions, normals, vec![1.0; n], identity.clone(), identity)
            .unwrap();
    Periphery::new(
        &precompute,
        PeripheryShape::Spherical { radius },
        DistributionPlan::single_process(n),
    )
    .unwrap()
}

fn assert_close(a: &[f64], b: &[f64], tol: f64) {
    assert_eq!(a.len(), b.len());
    let scale = b.iter().fold(1.0_f64, |m, v| m.max(v.abs()));
    for (x, y) in a.iter().zip(b) {
        assert_relative_eq!(x, y, epsilon = tol * scale);
    }
}

#[test]
fn test_split_then_concatenate_is_identity() {
    let mut rng = StdRng::seed_from_u64(11);
    for _ in 0..50 {
        let layout = SolutionLayout::new(
            rng.gen_range(0..200),
            rng.gen_range(0..200),
            rng.gen_range(0..200),
        );
        let x: Vec<f64> = (0..layout.total()).map(|_| rng.gen()).collect();
        let (f, b, p) = layout.split(&x).unwrap();
        assert_eq!((f.len(), b.len(), p.len()), (layout.fibers(), layout.bodies(), layout.periphery()));
        assert_eq!(layout.concatenate(f, b, p).unwrap(), x);
    }
}

#[test]
fn test_isolated_fiber_preconditioner_inverts_matvec() {
    let params = Parameters::default();
    let mut fiber = fiber(&params, [0.0; 3]);
    let n = fiber.n_nodes();
    let zeros = vec![0.0; 3 * n];
    let force: Vec<f64> = (0..3 * n).map(|i| if i % 3 == 1 { 1.0 } else { 0.0 }).collect();
    fiber.update(params.dt, params.eta, &zeros, &force).unwrap();

    let rhs = fiber.rhs().unwrap().to_vec();
    let x = fiber.apply_preconditioner(&rhs).unwrap();
    let y = fiber.matvec(&x, &zeros).unwrap();
    assert_close(&y, &rhs, 1e-6);
}

#[test]
fn test_single_fiber_system_matches_fiber() {
    let params = Parameters::default();
    let fibers = FiberContainer::new(vec![fiber(&params, [0.0; 3])]);
    let mut system = System::new(
        params,
        SingleProcess,
        fibers,
        BodyContainer::new(Vec::new(), 0),
        Periphery::empty(),
    )
    .unwrap();
    system.update_operators().unwrap();
    let forcing = ExternalForcing {
        fiber_flow: (0..48).map(|i| 0.1 * (i % 3) as f64).collect(),
        ..Default::default()
    };
    system.update_rhs(&forcing).unwrap();

    let rhs = system.rhs().unwrap();
    assert_eq!(rhs.len(), system.local_solution_size());
    let x = system.apply_preconditioner(&rhs).unwrap();
    let y = system.matvec(&x).unwrap();
    assert_close(&y, &rhs, 1e-6);
}

#[test]
fn test_coupled_matvec_is_linear() {
    let params = Parameters::default();
    let fibers = FiberContainer::new(vec![
        fiber(&params, [0.0, 0.0, 0.0]),
        fiber(&params, [0.0, 0.5, 0.0]),
    ]);
    let bodies = BodyContainer::new(vec![body([0.5, -1.5, 0.0])], 0);
    let mut system =
        System::new(params, SingleProcess, fibers, bodies, shell(40, 4.0)).unwrap();
    system.update_operators().unwrap();
    system.bodies_mut().bodies_mut()[0].set_external_force([0.0, 1.0, 0.0]);
    system.update_rhs(&ExternalForcing::default()).unwrap();

    let layout = system.layout();
    assert_eq!(layout.fibers(), 2 * 64);
    assert_eq!(layout.bodies(), 90 + 6);
    assert_eq!(layout.periphery(), 120);

    let mut rng = StdRng::seed_from_u64(12);
    let x: Vec<f64> = (0..layout.total()).map(|_| rng.gen::<f64>() - 0.5).collect();
    let scaled: Vec<f64> = x.iter().map(|v| 2.5 * v).collect();
    let y = system.matvec(&x).unwrap();
    let y_scaled = system.matvec(&scaled).unwrap();
    let expected: Vec<f64> = y.iter().map(|v| 2.5 * v).collect();
    assert_close(&y_scaled, &expected, 1e-10);

    // The periphery block of the preconditioner is the precomputed inverse.
    let z = system.apply_preconditioner(&x).unwrap();
    assert_eq!(&z[layout.fibers() + layout.bodies()..], &x[layout.fibers() + layout.bodies()..]);
}

#[test]
fn test_matvec_requires_fresh_body_operators() {
    let params = Parameters::default();
    let bodies = BodyContainer::new(vec![body([0.0; 3])], 0);
    let mut system = System::new(
        params,
        SingleProcess,
        FiberContainer::default(),
        bodies,
        Periphery::empty(),
    )
    .unwrap();
    system.update_operators().unwrap();
    system.bodies_mut().bodies_mut()[0].move_to([0.1, 0.0, 0.0], UnitQuaternion::identity());
    let x = vec![0.0; system.local_solution_size()];
    assert!(matches!(system.matvec(&x), Err(Error::StaleOperator(0))));
}

#[test]
fn test_empty_periphery() {
    let empty = Periphery::empty();
    assert_eq!(empty.local_solution_size(), 0);
    let b = body([0.0; 3]);
    assert!(!check_collision((&empty).into(), (&b).into(), 10.0).unwrap());
    assert!(!check_collision((&empty).into(), Collider::PointCloud(&[100.0, 0.0, 0.0]), 0.0).unwrap());
}

#[test]
fn test_unsupported_shape_pair() {
    let generic = Periphery::new(
        &PeripheryPrecompute::new(
            vec![1.0, 0.0, 0.0],
            vec![-1.0, 0.0, 0.0],
            vec![1.0],
            vec![0.0; 9],
            vec![0.0; 9],
        )
        .unwrap(),
        PeripheryShape::Generic,
        DistributionPlan::single_process(1),
    )
    .unwrap();
    let b = body([0.0; 3]);
    assert!(matches!(
        check_collision((&generic).into(), (&b).into(), 0.0),
        Err(Error::UnsupportedShapePair("generic periphery", "spherical body"))
    ));
}

/// A body at the origin with one nucleation site and a fiber growing from it along x.
fn anchored_system(bound: bool) -> System {
    let params = Parameters::default();
    let mut anchored = fiber(&params, [0.0, 0.5, 0.0]);
    if bound {
        anchored.bind_to_body(0, 0);
    }
    let precompute = BodyPrecompute::sphere(30, 0.5)
        .unwrap()
        .with_nucleation_sites(vec![0.0, 0.5, 0.0])
        .unwrap();
    let anchor = Body::new(
        precompute,
        [0.0; 3],
        UnitQuaternion::identity(),
        BodyShape::Spherical { radius: 0.5 },
    );
    let mut system = System::new(
        params,
        SingleProcess,
        FiberContainer::new(vec![anchored]),
        BodyContainer::new(vec![anchor], 0),
        Periphery::empty(),
    )
    .unwrap();
    system.update_operators().unwrap();
    system.update_rhs(&ExternalForcing::default()).unwrap();
    system
}

#[test]
fn test_link_conditions_of_tensed_fiber() {
    let system = anchored_system(true);
    assert_eq!(system.bodies().global_site_count(), 1);
    let fiber = &system.fibers().fibers()[0];
    let mut x_fibers = fiber.positions().to_vec();
    x_fibers.extend(vec![2.0; fiber.n_nodes()]);

    // Translation along y and spin about z.
    let LinkConditions {
        force_torque_on_bodies,
        velocities_on_fibers,
    } = system
        .body_fiber_link_conditions(&x_fibers, &[0.0, 1.0, 0.0, 0.0, 0.0, 1.0])
        .unwrap();
    assert_close(&force_torque_on_bodies, &[2.0, 0.0, 0.0, 0.0, 0.0, -1.0], 1e-8);
    assert_close(&velocities_on_fibers, &[-0.5, 1.0, 0.0, 0.0, 1.0, 0.0, -0.5], 1e-10);

    let free = anchored_system(false);
    let unbound = free
        .body_fiber_link_conditions(&x_fibers, &[0.0, 1.0, 0.0, 0.0, 0.0, 1.0])
        .unwrap();
    assert!(unbound.force_torque_on_bodies.iter().all(|v| *v == 0.0));
    assert!(unbound.velocities_on_fibers.iter().all(|v| *v == 0.0));
}

#[test]
fn test_link_couples_fiber_and_body_rows() {
    let bound = anchored_system(true);
    let free = anchored_system(false);
    let layout = bound.layout();
    assert_eq!(layout, free.layout());

    let mut rng = StdRng::seed_from_u64(13);
    let x: Vec<f64> = (0..layout.total()).map(|_| rng.gen::<f64>() - 0.5).collect();
    let (x_fibers, x_bodies, _) = layout.split(&x).unwrap();
    let link = bound
        .body_fiber_link_conditions(x_fibers, &bound.global_body_velocities(x_bodies).unwrap())
        .unwrap();

    let difference: Vec<f64> = bound
        .matvec(&x)
        .unwrap()
        .iter()
        .zip(free.matvec(&x).unwrap())
        .map(|(b, f)| b - f)
        .collect();

    let n = 16;
    let mut expected = vec![0.0; layout.total()];
    for c in 0..6 {
        expected[3 * (n - 4) + c] = -link.velocities_on_fibers[c];
        expected[layout.fibers() + 90 + c] = -link.force_torque_on_bodies[c];
    }
    expected[4 * n - 2] = -link.velocities_on_fibers[6];
    for (d, e) in difference.iter().zip(&expected) {
        assert_relative_eq!(d, e, epsilon = 1e-9);
    }
    assert!(link.force_torque_on_bodies.iter().any(|v| v.abs() > 1e-6));
}

#[test]
fn test_binding_to_missing_site_is_rejected() {
    let params = Parameters::default();
    let mut anchored = fiber(&params, [0.0; 3]);
    anchored.bind_to_body(0, 3);
    assert!(matches!(
        System::new(
            params,
            SingleProcess,
            FiberContainer::new(vec![anchored]),
            BodyContainer::new(vec![body([0.0; 3])], 0),
            Periphery::empty(),
        ),
        Err(Error::IndexOutOfRange {
            what: "nucleation site",
            index: 3,
            len: 0,
        })
    ));
}
