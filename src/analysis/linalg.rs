//! Small dense linear systems.
//!
//! The Q fit only ever solves 3×3 complex and up to 7×7 real normal equations, so
//! plain Gaussian elimination with partial pivoting is all that is needed.

use num_complex::Complex64;
use std::ops::{Add, Div, Mul, Sub};

/// Field element the solver works over.
pub trait Scalar:
    Copy + Add<Output = Self> + Sub<Output = Self> + Mul<Output = Self> + Div<Output = Self>
{
    /// Additive identity
    fn zero() -> Self;
    /// Magnitude used for pivot selection
    fn magnitude(self) -> f64;
}

impl Scalar for f64 {
    fn zero() -> Self {
        0.0
    }

    fn magnitude(self) -> f64 {
        self.abs()
    }
}

impl Scalar for Complex64 {
    fn zero() -> Self {
        Complex64::new(0.0, 0.0)
    }

    fn magnitude(self) -> f64 {
        self.norm()
    }
}

/// Solve `a · x = b` for square `a` (row-major, `n × n`).
///
/// Returns `None` when `a` is singular to working precision or the inputs are not
/// square.
pub fn solve<T: Scalar>(mut a: Vec<Vec<T>>, mut b: Vec<T>) -> Option<Vec<T>> {
    let n = b.len();
    if a.len() != n || a.iter().any(|row| row.len() != n) {
        return None;
    }
    let scale = a
        .iter()
        .flat_map(|row| row.iter())
        .map(|v| v.magnitude())
        .fold(0.0_f64, f64::max);
    if !(scale.is_finite() && scale > 0.0) {
        return None;
    }
    let tiny = scale * 1e-14;

    for col in 0..n {
        let pivot = (col..n).max_by(|&i, &j| {
            a[i][col]
                .magnitude()
                .total_cmp(&a[j][col].magnitude())
        })?;
        if a[pivot][col].magnitude() <= tiny {
            return None;
        }
        a.swap(col, pivot);
        b.swap(col, pivot);

        for row in col + 1..n {
            let factor = a[row][col] / a[col][col];
            for k in col..n {
                let delta = factor * a[col][k];
                a[row][k] = a[row][k] - delta;
            }
            b[row] = b[row] - factor * b[col];
        }
    }

    let mut x = vec![T::zero(); n];
    for row in (0..n).rev() {
        let mut acc = b[row];
        for k in row + 1..n {
            acc = acc - a[row][k] * x[k];
        }
        x[row] = acc / a[row][row];
    }
    if x.iter().all(|v| v.magnitude().is_finite()) {
        Some(x)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_real_system_needs_pivoting() {
        let a = vec![
            vec![0.0, 2.0, 1.0],
            vec![1.0, 1.0, 0.0],
            vec![3.0, 0.0, 1.0],
        ];
        let x = solve(a, vec![5.0, 3.0, 4.0]).unwrap();
        for (got, want) in x.iter().zip([1.0, 2.0, 1.0]) {
            assert!((got - want).abs() < 1e-12, "{got} != {want}");
        }
    }

    #[test]
    fn test_complex_system() {
        let j = Complex64::new(0.0, 1.0);
        let one = Complex64::new(1.0, 0.0);
        // [1 j; j 2] x = [1+j, 2+j]  ->  x = [1, 1]
        let a = vec![vec![one, j], vec![j, 2.0 * one]];
        let x = solve(a, vec![one + j, 2.0 * one + j]).unwrap();
        assert!((x[0] - one).norm() < 1e-12);
        assert!((x[1] - one).norm() < 1e-12);
    }

    #[test]
    fn test_singular_system() {
        let a = vec![vec![1.0, 2.0], vec![2.0, 4.0]];
        assert!(solve(a, vec![1.0, 2.0]).is_none());
        assert!(solve(vec![vec![1.0]], vec![1.0, 2.0]).is_none());
    }
}
