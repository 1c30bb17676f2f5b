use nalgebra::{DMatrix, DVector};
use sprs::CsMat;
use thiserror::Error;

/// LU factorization hit a zero or non-finite pivot.
#[derive(Error, Debug, Clone, Copy, PartialEq)]
#[error("Matrix is singular at column {column}")]
pub struct SingularMatrix {
    pub column: usize,
}

/// Dense LU solver with partial pivoting.
///
/// Storage is sized once at construction; `factor` and `solve_in_place`
/// never allocate, so the solver can be driven from the audio thread.
#[derive(Debug, Clone)]
pub struct LuSolver {
    matrix: DMatrix<f64>,
    pivots: Vec<usize>,
}

impl LuSolver {
    pub fn new(size: usize) -> Self {
        LuSolver {
            matrix: DMatrix::zeros(size, size),
            pivots: vec![0; size],
        }
    }

    pub fn size(&self) -> usize {
        self.pivots.len()
    }

    /// Matrix to be filled before calling [`LuSolver::factor`].
    pub fn matrix_mut(&mut self) -> &mut DMatrix<f64> {
        &mut self.matrix
    }

    /// Factor the matrix in place into `L` (unit lower) and `U`.
    pub fn factor(&mut self) -> Result<(), SingularMatrix> {
        let n = self.size();
        for k in 0..n {
            let mut pivot_row = k;
            let mut pivot_abs = self.matrix[(k, k)].abs();
            for r in (k + 1)..n {
                let candidate = self.matrix[(r, k)].abs();
                if candidate > pivot_abs {
                    pivot_row = r;
                    pivot_abs = candidate;
                }
            }
            if !(pivot_abs > f64::MIN_POSITIVE) || !pivot_abs.is_finite() {
                return Err(SingularMatrix { column: k });
            }

            self.pivots[k] = pivot_row;
            if pivot_row != k {
                self.matrix.swap_rows(k, pivot_row);
            }

            let pivot = self.matrix[(k, k)];
            for r in (k + 1)..n {
                let factor = self.matrix[(r, k)] / pivot;
                self.matrix[(r, k)] = factor;
                if factor != 0.0 {
                    for c in (k + 1)..n {
                        let upper = self.matrix[(k, c)];
                        self.matrix[(r, c)] -= factor * upper;
                    }
                }
            }
        }
        Ok(())
    }

    /// Overwrite `rhs` with the solution of `A x = rhs` using the last factorization.
    pub fn solve_in_place(&self, rhs: &mut DVector<f64>) {
        let n = self.size();
        for k in 0..n {
            let p = self.pivots[k];
            if p != k {
                rhs.swap_rows(k, p);
            }
        }
        // Forward substitution with unit diagonal
        for r in 0..n {
            let mut sum = rhs[r];
            for c in 0..r {
                sum -= self.matrix[(r, c)] * rhs[c];
            }
            rhs[r] = sum;
        }
        // Back substitution
        for r in (0..n).rev() {
            let mut sum = rhs[r];
            for c in (r + 1)..n {
                sum -= self.matrix[(r, c)] * rhs[c];
            }
            rhs[r] = sum / self.matrix[(r, r)];
        }
    }
}

/// Solve `A x = b` once, allocating a fresh solver.
pub fn solve_dense(matrix: &DMatrix<f64>, rhs: &DVector<f64>) -> Result<DVector<f64>, SingularMatrix> {
    let mut solver = LuSolver::new(matrix.nrows());
    solver.matrix_mut().copy_from(matrix);
    solver.factor()?;
    let mut solution = rhs.clone();
    solver.solve_in_place(&mut solution);
    Ok(solution)
}

/// Convert sparse matrix to dense matrix
pub fn sparse_to_dense(sparse: &CsMat<f64>) -> DMatrix<f64> {
    let mut dense = DMatrix::zeros(sparse.rows(), sparse.cols());

    for (value, (row, col)) in sparse.iter() {
        dense[(row, col)] = *value;
    }

    dense
}
