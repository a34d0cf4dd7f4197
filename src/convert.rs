//! ndarray -> nalgebra conversions.
//!
//! Arrays cross module boundaries as ndarray; the dense factorizations in the
//! solver and the quadrature provider run on nalgebra.

use nalgebra::{DMatrix, DVector};
use ndarray::{ArrayView1, ArrayView2};

#[inline]
pub fn to_dmatrix(a: ArrayView2<f64>) -> DMatrix<f64> {
    DMatrix::from_fn(a.nrows(), a.ncols(), |i, j| a[[i, j]])
}

#[inline]
pub fn to_dvector(v: ArrayView1<f64>) -> DVector<f64> {
    DVector::from_iterator(v.len(), v.iter().cloned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_matrix_layout_preserved() {
        let a = array![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]];
        let m = to_dmatrix(a.view());
        assert_eq!(m.shape(), (2, 3));
        assert_eq!(m[(1, 0)], 4.0);
        assert_eq!(m[(0, 2)], 3.0);

        let t = to_dmatrix(a.t());
        assert_eq!(t[(2, 1)], 6.0);
    }

    #[test]
    fn test_vector_order_preserved() {
        let v = array![0.5, -1.0, 2.0];
        let d = to_dvector(v.view());
        assert_eq!(d.as_slice(), &[0.5, -1.0, 2.0]);
    }
}
