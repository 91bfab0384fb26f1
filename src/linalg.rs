//! Dense linear algebra helpers on top of rlst arrays.
//!
//! All matrices are rlst dynamic arrays in column-major storage. Vectors are plain
//! slices; 3-vectors attached to points are stored interleaved, i.e.
//! `[x_0, y_0, z_0, x_1, y_1, z_1, ...]`.

use crate::types::{Error, Result};
use log::warn;
use itertools::izip;
use rlst::{
    empty_array, rlst_array_from_slice1, rlst_array_from_slice_mut1, rlst_dynamic_array2,
    DynamicArray, MultInto, MultIntoResize, RawAccess, RawAccessMut, Shape, TransMode,
};

/// Dense real matrix.
pub type Matrix = DynamicArray<f64, 2>;

/// Inverse entries beyond this magnitude are reported as suspicious.
const LARGE_INVERSE_ENTRY: f64 = 1e12;

/// A zero matrix.
pub fn zeros(rows: usize, cols: usize) -> Matrix {
    rlst_dynamic_array2!(f64, [rows, cols])
}

/// The identity matrix.
pub fn identity(n: usize) -> Matrix {
    from_fn(n, n, |i, j| if i == j { 1.0 } else { 0.0 })
}

/// Build a matrix from a function of the indices.
pub fn from_fn(rows: usize, cols: usize, f: impl Fn(usize, usize) -> f64) -> Matrix {
    let mut mat = zeros(rows, cols);
    let data = mat.data_mut();
    for j in 0..cols {
        for i in 0..rows {
            data[i + j * rows] = f(i, j);
        }
    }
    mat
}

/// Copy of a matrix.
pub fn duplicate(mat: &Matrix) -> Matrix {
    let [m, n] = mat.shape();
    let mut copy = zeros(m, n);
    copy.fill_from(mat.view());
    copy
}

/// Number of rows.
pub fn rows(mat: &Matrix) -> usize {
    mat.shape()[0]
}

/// Number of columns.
pub fn cols(mat: &Matrix) -> usize {
    mat.shape()[1]
}

/// Entry `(i, j)`.
#[inline]
pub fn entry(mat: &Matrix, i: usize, j: usize) -> f64 {
    mat[[i, j]]
}

/// Set entry `(i, j)`.
#[inline]
pub fn set(mat: &mut Matrix, i: usize, j: usize, value: f64) {
    mat[[i, j]] = value;
}

/// Add to entry `(i, j)`.
#[inline]
pub fn add(mat: &mut Matrix, i: usize, j: usize, value: f64) {
    mat[[i, j]] += value;
}

/// Copy `block` into `mat` with its top left corner at `(row, col)`.
pub fn set_block(mat: &mut Matrix, row: usize, col: usize, block: &Matrix) {
    let [m, n] = block.shape();
    for j in 0..n {
        for i in 0..m {
            mat[[row + i, col + j]] = block[[i, j]];
        }
    }
}

/// Matrix-vector product `A x`.
pub fn matvec(mat: &Matrix, x: &[f64]) -> Vec<f64> {
    let mut y = vec![0.0; rows(mat)];
    matvec_add(mat, x, &mut y);
    y
}

/// Accumulate `y += A x`.
pub fn matvec_add(mat: &Matrix, x: &[f64], y: &mut [f64]) {
    let [m, n] = mat.shape();
    assert_eq!(x.len(), n, "Vector length {} does not match {} columns.", x.len(), n);
    assert_eq!(y.len(), m, "Result length {} does not match {} rows.", y.len(), m);
    if m == 0 || n == 0 {
        return;
    }
    let x = rlst_array_from_slice1!(x, [n]);
    let y = rlst_array_from_slice_mut1!(y, [m]);
    y.mult_into(TransMode::NoTrans, TransMode::NoTrans, 1.0, mat.view(), x, 1.0);
}

/// Accumulate `y += alpha x`.
pub fn axpy(alpha: f64, x: &[f64], y: &mut [f64]) {
    assert_eq!(x.len(), y.len(), "Lengths {} and {} do not agree.", x.len(), y.len());
    for (yi, xi) in izip!(y.iter_mut(), x) {
        *yi += alpha * xi;
    }
}

/// Matrix product `A B`.
pub fn matmul(a: &Matrix, b: &Matrix) -> Matrix {
    let [m, k] = a.shape();
    let [k2, n] = b.shape();
    assert_eq!(k, k2, "Inner dimensions {} and {} do not agree.", k, k2);
    if m == 0 || n == 0 || k == 0 {
        return zeros(m, n);
    }
    empty_array::<f64, 2>().simple_mult_into_resize(a.view(), b.view())
}

/// Transpose of a matrix.
pub fn transpose(mat: &Matrix) -> Matrix {
    let [m, n] = mat.shape();
    let mut result = zeros(n, m);
    result.fill_from(mat.view().transpose());
    result
}

/// Invert a square matrix.
///
/// Fails if LAPACK reports a singular matrix or if the inverse contains non-finite values.
pub fn invert(mut mat: Matrix) -> Result<Matrix> {
    let [m, n] = mat.shape();
    if m != n {
        return Err(Error::Factorization(format!(
            "cannot invert a non-square {m}x{n} matrix"
        )));
    }
    if m == 0 {
        return Ok(mat);
    }
    if mat.data().iter().any(|v| !v.is_finite()) {
        return Err(Error::Factorization(
            "matrix contains non-finite entries".to_string(),
        ));
    }
    mat.view_mut()
        .into_inverse_alloc()
        .map_err(|e| Error::Factorization(format!("{e:?}")))?;

    let mut largest = 0.0_f64;
    for v in mat.data() {
        if !v.is_finite() {
            return Err(Error::Factorization(
                "inverse contains non-finite entries".to_string(),
            ));
        }
        largest = largest.max(v.abs());
    }
    if largest > LARGE_INVERSE_ENTRY {
        warn!("Inverse of {m}x{m} matrix has entries of size {largest:e}; the operator is close to singular.");
    }
    Ok(mat)
}

#[cfg(test)]
mod test {
    extern crate blas_src;
    extern crate lapack_src;

    use super::{axpy, entry, from_fn, identity, invert, matmul, matvec, matvec_add, transpose};
    use approx::assert_relative_eq;

    #[test]
    fn test_matvec_and_matmul() {
        let a = from_fn(2, 3, |i, j| (i * 3 + j) as f64);
        let x = [1.0, -1.0, 2.0];
        let y = matvec(&a, &x);
        assert_relative_eq!(y[0], 0.0 - 1.0 + 4.0);
        assert_relative_eq!(y[1], 3.0 - 4.0 + 10.0);

        let at = transpose(&a);
        let ata = matmul(&at, &a);
        assert_relative_eq!(entry(&ata, 0, 0), 9.0);
        assert_relative_eq!(entry(&ata, 1, 2), 1.0 * 2.0 + 4.0 * 5.0);
    }

    #[test]
    fn test_accumulating_products() {
        let a = from_fn(3, 2, |i, j| 1.0 + i as f64 - 2.0 * j as f64);
        let mut y = vec![1.0, 1.0, 1.0];
        matvec_add(&a, &[2.0, 1.0], &mut y);
        assert_relative_eq!(y[0], 2.0);
        assert_relative_eq!(y[1], 5.0);
        assert_relative_eq!(y[2], 8.0);

        axpy(-0.5, &[2.0, 4.0, 6.0], &mut y);
        assert_eq!(y, vec![1.0, 3.0, 5.0]);

        assert!(matvec(&from_fn(0, 2, |_, _| 1.0), &[1.0, 1.0]).is_empty());
        let at = transpose(&a);
        assert_relative_eq!(entry(&at, 1, 2), entry(&a, 2, 1));
    }

    #[test]
    fn test_inverse() {
        let a = from_fn(3, 3, |i, j| if i == j { 4.0 } else { 1.0 / (1.0 + i as f64 + j as f64) });
        let a_inv = invert(from_fn(3, 3, |i, j| entry(&a, i, j))).unwrap();
        let prod = matmul(&a, &a_inv);
        let ident = identity(3);
        for i in 0..3 {
            for j in 0..3 {
                assert_relative_eq!(entry(&prod, i, j), entry(&ident, i, j), epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn test_singular_matrix_fails() {
        let a = from_fn(2, 2, |_, _| 1.0);
        assert!(invert(a).is_err());
    }
}
