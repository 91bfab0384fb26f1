//! Small geometric helpers on interleaved 3-vectors and point generators.

use nalgebra::{UnitQuaternion, Vector3};
use num::traits::FloatConst;

/// Dot product.
#[inline]
pub fn dot(a: &[f64], b: &[f64]) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

/// Cross product.
#[inline]
pub fn cross(a: &[f64], b: &[f64]) -> [f64; 3] {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

/// Euclidean norm.
#[inline]
pub fn norm(a: &[f64]) -> f64 {
    dot(a, a).sqrt()
}

/// The `i`-th point of an interleaved point array.
#[inline]
pub fn point(points: &[f64], i: usize) -> [f64; 3] {
    [points[3 * i], points[3 * i + 1], points[3 * i + 2]]
}

/// Rotate an interleaved 3-vector.
#[inline]
pub fn rotate(orientation: &UnitQuaternion<f64>, v: &[f64]) -> [f64; 3] {
    let rotated = orientation.transform_vector(&Vector3::new(v[0], v[1], v[2]));
    [rotated.x, rotated.y, rotated.z]
}

/// Quasi-uniform points on a sphere of the given radius centred at the origin.
///
/// Returns interleaved positions and outward unit normals.
pub fn fibonacci_sphere(n_points: usize, radius: f64) -> (Vec<f64>, Vec<f64>) {
    let mut positions = Vec::with_capacity(3 * n_points);
    let mut normals = Vec::with_capacity(3 * n_points);
    let golden_angle = f64::PI() * (3.0 - 5.0_f64.sqrt());
    for i in 0..n_points {
        let z = if n_points == 1 {
            0.0
        } else {
            1.0 - 2.0 * (i as f64 + 0.5) / n_points as f64
        };
        let r = (1.0 - z * z).max(0.0).sqrt();
        let phi = golden_angle * i as f64;
        let normal = if n_points == 1 {
            [0.0, 0.0, 1.0]
        } else {
            [r * phi.cos(), r * phi.sin(), z]
        };
        normals.extend_from_slice(&normal);
        positions.extend(normal.iter().map(|c| radius * c));
    }
    (positions, normals)
}
