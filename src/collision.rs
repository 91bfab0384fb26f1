//! Collision tests between the periphery, bodies and point clouds.
use crate::body::{Body, BodyShape};
use crate::geometry::{norm, point};
use crate::periphery::{Periphery, PeripheryShape};
use crate::types::{Error, Result};

/// Anything that can take part in a collision test.
#[derive(Debug, Clone, Copy)]
pub enum Collider<'a> {
    /// The periphery.
    Periphery(&'a Periphery),
    /// A rigid body.
    Body(&'a Body),
    /// Interleaved points, e.g. fiber nodes.
    PointCloud(&'a [f64]),
}

impl<'a> From<&'a Periphery> for Collider<'a> {
    fn from(periphery: &'a Periphery) -> Self {
        Collider::Periphery(periphery)
    }
}

impl<'a> From<&'a Body> for Collider<'a> {
    fn from(body: &'a Body) -> Self {
        Collider::Body(body)
    }
}

impl<'a> From<&'a [f64]> for Collider<'a> {
    fn from(points: &'a [f64]) -> Self {
        Collider::PointCloud(points)
    }
}

impl Collider<'_> {
    fn name(&self) -> &'static str {
        match self {
            Collider::Periphery(p) => p.shape().name(),
            Collider::Body(b) => b.shape().name(),
            Collider::PointCloud(_) => "point cloud",
        }
    }

    fn is_empty_periphery(&self) -> bool {
        matches!(self, Collider::Periphery(p) if p.n_nodes_global() == 0)
    }
}

/// Whether `a` and `b` are closer than `threshold`.
///
/// A periphery without nodes never collides. Shape pairs without a test give
/// [Error::UnsupportedShapePair].
pub fn check_collision(a: Collider, b: Collider, threshold: f64) -> Result<bool> {
    if a.is_empty_periphery() || b.is_empty_periphery() {
        return Ok(false);
    }
    match (a, b) {
        (Collider::Periphery(p), Collider::Body(body))
        | (Collider::Body(body), Collider::Periphery(p)) => {
            match (p.shape(), body.shape()) {
                (PeripheryShape::Spherical { radius }, BodyShape::Spherical { radius: r_body }) => {
                    Ok(norm(body.position()) + r_body + threshold > *radius)
                }
                _ => Err(Error::UnsupportedShapePair(a.name(), b.name())),
            }
        }
        (Collider::Periphery(p), Collider::PointCloud(points))
        | (Collider::PointCloud(points), Collider::Periphery(p)) => match p.shape() {
            PeripheryShape::Spherical { radius } => {
                let limit = radius - threshold;
                Ok((0..points.len() / 3).any(|i| norm(&point(points, i)) > limit))
            }
            PeripheryShape::Generic => Err(Error::UnsupportedShapePair(a.name(), b.name())),
        },
        (Collider::Body(b1), Collider::Body(b2)) => match (b1.shape(), b2.shape()) {
            (BodyShape::Spherical { radius: r1 }, BodyShape::Spherical { radius: r2 }) => {
                let c1 = b1.position();
                let c2 = b2.position();
                let d = [c1[0] - c2[0], c1[1] - c2[1], c1[2] - c2[2]];
                Ok(norm(&d) < r1 + r2 + threshold)
            }
            _ => Err(Error::UnsupportedShapePair(a.name(), b.name())),
        },
        _ => Err(Error::UnsupportedShapePair(a.name(), b.name())),
    }
}

#[cfg(test)]
mod test {
    use super::{check_collision, Collider};
    use crate::body::{Body, BodyPrecompute, BodyShape};
    use crate::distribution::DistributionPlan;
    use crate::periphery::{Periphery, PeripheryPrecompute, PeripheryShape};
    use crate::types::Error;
    use nalgebra::UnitQuaternion;

    fn sphere_body(center: [f64; 3], radius: f64) -> Body {
        Body::new(
            BodyPrecompute::sphere(8, radius).unwrap(),
            center,
            UnitQuaternion::identity(),
            BodyShape::Spherical { radius },
        )
    }

    fn spherical_shell(radius: f64) -> Periphery {
        let (positions, normals) = crate::geometry::fibonacci_sphere(4, radius);
        let normals = normals.iter().map(|v| -v).collect();
        let precompute =
            PeripheryPrecompute::new(positions, normals, vec![1.0; 4], vec![0.0; 144], vec![0.0; 144])
                .unwrap();
        Periphery::new(
            &precompute,
            PeripheryShape::Spherical { radius },
            DistributionPlan::single_process(4),
        )
        .unwrap()
    }

    #[test]
    fn test_body_in_spherical_periphery() {
        let shell = spherical_shell(5.0);
        let inside = sphere_body([1.0, 0.0, 0.0], 1.0);
        let touching = sphere_body([3.9, 0.0, 0.0], 1.0);
        assert!(!check_collision((&shell).into(), (&inside).into(), 0.1).unwrap());
        assert!(check_collision((&touching).into(), (&shell).into(), 0.2).unwrap());
    }

    #[test]
    fn test_points_in_spherical_periphery() {
        let shell = spherical_shell(2.0);
        let points = [0.0, 0.0, 0.0, 0.0, 1.95, 0.0];
        assert!(!check_collision((&shell).into(), Collider::PointCloud(&points[..3]), 0.1).unwrap());
        assert!(check_collision(Collider::PointCloud(&points), (&shell).into(), 0.1).unwrap());
    }

    #[test]
    fn test_spherical_bodies() {
        let a = sphere_body([0.0; 3], 1.0);
        let b = sphere_body([2.5, 0.0, 0.0], 1.0);
        assert!(!check_collision((&a).into(), (&b).into(), 0.4).unwrap());
        assert!(check_collision((&a).into(), (&b).into(), 0.6).unwrap());
    }

    #[test]
    fn test_empty_periphery_never_collides() {
        let shell = Periphery::empty();
        let body = sphere_body([0.0; 3], 1.0);
        assert!(!check_collision((&shell).into(), (&body).into(), 1.0).unwrap());
        assert!(!check_collision((&shell).into(), Collider::PointCloud(&[10.0, 0.0, 0.0]), 1.0).unwrap());
    }

    #[test]
    fn test_unsupported_pairs() {
        let generic = Body::new(
            BodyPrecompute::sphere(8, 1.0).unwrap(),
            [0.0; 3],
            UnitQuaternion::identity(),
            BodyShape::Generic,
        );
        let sphere = sphere_body([3.0, 0.0, 0.0], 1.0);
        assert!(matches!(
            check_collision((&generic).into(), (&sphere).into(), 0.0),
            Err(Error::UnsupportedShapePair("generic body", "spherical body"))
        ));
        assert!(matches!(
            check_collision((&sphere).into(), Collider::PointCloud(&[0.0; 3]), 0.0),
            Err(Error::UnsupportedShapePair(_, "point cloud"))
        ));
    }
}
