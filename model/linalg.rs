//! Thin bridge between `ndarray` storage and `faer` factorizations.

use faer::diag::DiagRef;
use faer::linalg::solvers::{self, Solve};
use faer::{Mat, MatRef, Side};
use ndarray::{Array1, Array2, ArrayBase, Data, Ix1, Ix2};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LinalgError {
    #[error("Self-adjoint eigendecomposition failed: {0:?}")]
    SelfAdjointEigen(solvers::EvdError),
    #[error("Cholesky factorization failed: {0:?}")]
    Cholesky(solvers::LltError),
}

fn mat_to_array(mat: MatRef<'_, f64>) -> Array2<f64> {
    Array2::from_shape_fn((mat.nrows(), mat.ncols()), |(i, j)| mat[(i, j)])
}

fn diag_to_array(diag: DiagRef<'_, f64>) -> Array1<f64> {
    let mat = diag.column_vector().as_mat();
    Array1::from_shape_fn(mat.nrows(), |i| mat[(i, 0)])
}

enum FaerStorage<'a> {
    Borrowed(MatRef<'a, f64>),
    Owned(Mat<f64>),
}

impl FaerStorage<'_> {
    #[inline]
    fn as_ref(&self) -> MatRef<'_, f64> {
        match self {
            FaerStorage::Borrowed(view) => *view,
            FaerStorage::Owned(mat) => mat.as_ref(),
        }
    }
}

/// Zero-copy `faer` view of a standard- or Fortran-layout `ndarray` matrix.
pub struct FaerArrayView<'a> {
    storage: FaerStorage<'a>,
}

impl<'a> FaerArrayView<'a> {
    pub fn new<S: Data<Elem = f64>>(array: &'a ArrayBase<S, Ix2>) -> Self {
        let storage = match array.as_slice_memory_order() {
            Some(slice) if array.is_standard_layout() => FaerStorage::Borrowed(
                MatRef::from_row_major_slice(slice, array.nrows(), array.ncols()),
            ),
            Some(slice) if array.t().is_standard_layout() => FaerStorage::Borrowed(
                MatRef::from_column_major_slice(slice, array.nrows(), array.ncols()),
            ),
            _ => {
                let (rows, cols) = array.dim();
                FaerStorage::Owned(Mat::from_fn(rows, cols, |i, j| array[(i, j)]))
            }
        };
        Self { storage }
    }

    #[inline]
    pub fn as_ref(&self) -> MatRef<'_, f64> {
        self.storage.as_ref()
    }
}

struct FaerColView<'a> {
    storage: FaerStorage<'a>,
}

impl<'a> FaerColView<'a> {
    fn new<S: Data<Elem = f64>>(array: &'a ArrayBase<S, Ix1>) -> Self {
        let len = array.len();
        let storage = match array.as_slice() {
            Some(slice) => FaerStorage::Borrowed(MatRef::from_row_major_slice(slice, len, 1)),
            None => FaerStorage::Owned(Mat::from_fn(len, 1, |i, _| array[i])),
        };
        Self { storage }
    }

    #[inline]
    fn as_ref(&self) -> MatRef<'_, f64> {
        self.storage.as_ref()
    }
}

/// A Cholesky factor `A = L L^T` of a symmetric positive-definite matrix.
pub struct CholeskyFactor {
    factor: solvers::Llt<f64>,
}

impl CholeskyFactor {
    pub fn solve_vec<S: Data<Elem = f64>>(&self, rhs: &ArrayBase<S, Ix1>) -> Array1<f64> {
        let rhs_view = FaerColView::new(rhs);
        let sol = self.factor.solve(rhs_view.as_ref());
        Array1::from_shape_fn(rhs.len(), |i| sol[(i, 0)])
    }

    pub fn solve_mat<S: Data<Elem = f64>>(&self, rhs: &ArrayBase<S, Ix2>) -> Array2<f64> {
        let rhs_view = FaerArrayView::new(rhs);
        let sol = self.factor.solve(rhs_view.as_ref());
        mat_to_array(sol.as_ref())
    }

    /// `A^{-1}`, by solving against the identity.
    pub fn inverse(&self) -> Array2<f64> {
        let n = self.factor.L().nrows();
        self.solve_mat(&Array2::<f64>::eye(n))
    }

    /// `log |A|`.
    pub fn log_determinant(&self) -> f64 {
        2.0 * diag_to_array(self.factor.L().diagonal())
            .iter()
            .map(|d| d.ln())
            .sum::<f64>()
    }
}

pub trait Cholesky {
    fn cholesky(&self) -> Result<CholeskyFactor, LinalgError>;
}

impl<S: Data<Elem = f64>> Cholesky for ArrayBase<S, Ix2> {
    fn cholesky(&self) -> Result<CholeskyFactor, LinalgError> {
        let faer_view = FaerArrayView::new(self);
        let factor = faer_view
            .as_ref()
            .llt(Side::Lower)
            .map_err(LinalgError::Cholesky)?;
        Ok(CholeskyFactor { factor })
    }
}

pub trait SymmetricEigen {
    /// Eigenvalues (ascending) and eigenvectors of a symmetric matrix.
    fn eigh(&self) -> Result<(Array1<f64>, Array2<f64>), LinalgError>;
}

impl<S: Data<Elem = f64>> SymmetricEigen for ArrayBase<S, Ix2> {
    fn eigh(&self) -> Result<(Array1<f64>, Array2<f64>), LinalgError> {
        let faer_view = FaerArrayView::new(self);
        let eigen = faer_view
            .as_ref()
            .self_adjoint_eigen(Side::Lower)
            .map_err(LinalgError::SelfAdjointEigen)?;
        Ok((diag_to_array(eigen.S()), mat_to_array(eigen.U())))
    }
}

/// Numerical rank of the column space of `x`.
///
/// Columns are scaled to unit norm before the eigenvalues of `XᵀX` are
/// inspected, so badly scaled but independent predictors are not miscounted.
/// Zero columns contribute nothing to the rank.
pub fn column_rank<S: Data<Elem = f64>>(
    x: &ArrayBase<S, Ix2>,
    relative_tolerance: f64,
) -> Result<usize, LinalgError> {
    let mut gram = x.t().dot(x);
    let p = gram.nrows();
    if p == 0 {
        return Ok(0);
    }
    let scales: Vec<f64> = (0..p)
        .map(|j| {
            let d = gram[(j, j)];
            if d > 0.0 { 1.0 / d.sqrt() } else { 0.0 }
        })
        .collect();
    for i in 0..p {
        for j in 0..p {
            gram[(i, j)] *= scales[i] * scales[j];
        }
    }
    let (values, _) = gram.eigh()?;
    let largest = values.iter().fold(0.0_f64, |acc, &v| acc.max(v.abs()));
    if largest == 0.0 {
        return Ok(0);
    }
    Ok(values
        .iter()
        .filter(|&&v| v > largest * relative_tolerance)
        .count())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn cholesky_solves_and_inverts() {
        let a = array![[4.0, 2.0], [2.0, 3.0]];
        let factor = a.cholesky().unwrap();
        let x = factor.solve_vec(&array![2.0, 1.0]);
        let back = a.dot(&x);
        assert_abs_diff_eq!(back[0], 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(back[1], 1.0, epsilon = 1e-12);
        let identity = a.dot(&factor.inverse());
        for ((i, j), &value) in identity.indexed_iter() {
            let expected = if i == j { 1.0 } else { 0.0 };
            assert_abs_diff_eq!(value, expected, epsilon = 1e-12);
        }
        assert_abs_diff_eq!(factor.log_determinant(), 8.0_f64.ln(), epsilon = 1e-12);
    }

    #[test]
    fn cholesky_rejects_indefinite_matrix() {
        let a = array![[1.0, 2.0], [2.0, 1.0]];
        assert!(a.cholesky().is_err());
    }

    #[test]
    fn rank_ignores_scale_but_detects_dependence() {
        let independent = array![[1.0, 1.0e6], [1.0, 2.0e6], [1.0, 4.0e6]];
        assert_eq!(column_rank(&independent, 1e-10).unwrap(), 2);

        let dependent = array![[1.0, 2.0, 3.0], [1.0, 4.0, 5.0], [1.0, 6.0, 7.0]];
        assert_eq!(column_rank(&dependent, 1e-10).unwrap(), 2);
    }
}
