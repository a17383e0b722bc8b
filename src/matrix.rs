//! Feature-matrix abstraction over dense and sparse blocks.
//!
//! Feature groups for clustering are produced independently (a dense
//! embedding block, sparse one-hot/TF-IDF blocks) and concatenated
//! column-wise before fitting. `FeatureMatrix` makes the dense/sparse split
//! an explicit tagged variant with a small set of operations, instead of
//! type inspection at each call site:
//!
//! - `column_means`: global mean vector for either variant
//! - `row_into` / `row`: row access, densifying sparse rows on demand
//! - `hstack`: column-wise concatenation preserving row order
//! - `to_dense`: full materialization (callers gate this on size)
//!
//! Invariant: row order across all concatenated feature groups is identical
//! and matches the source record order.

use log::trace;
use smartcore::linalg::basic::arrays::Array;
use smartcore::linalg::basic::matrix::DenseMatrix;
use sprs::{CsMat, TriMat};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug)]
pub enum MatrixError {
    ShapeMismatch(String),
    Empty,
    Invalid(String),
}

impl std::fmt::Display for MatrixError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MatrixError::ShapeMismatch(e) => write!(f, "Shape mismatch: {}", e),
            MatrixError::Empty => write!(f, "Empty matrix"),
            MatrixError::Invalid(e) => write!(f, "Invalid: {}", e),
        }
    }
}

impl std::error::Error for MatrixError {}

// ============================================================================
// FeatureMatrix
// ============================================================================

/// An immutable, row-major table of N samples by D numeric features,
/// held either as a dense block or a CSR sparse matrix.
#[derive(Clone, Debug)]
pub enum FeatureMatrix {
    Dense(DenseMatrix<f64>),
    Sparse(CsMat<f64>),
}

impl FeatureMatrix {
    /// Build a dense variant from row vectors.
    pub fn from_rows(rows: &[Vec<f64>]) -> Result<Self, MatrixError> {
        if rows.is_empty() {
            return Err(MatrixError::Empty);
        }
        let ncols = rows[0].len();
        if rows.iter().any(|r| r.len() != ncols) {
            return Err(MatrixError::ShapeMismatch(
                "rows have differing lengths".to_string(),
            ));
        }
        let dm = DenseMatrix::from_2d_vec(&rows.to_vec())
            .map_err(|e| MatrixError::Invalid(e.to_string()))?;
        Ok(FeatureMatrix::Dense(dm))
    }

    /// `(n_rows, n_cols)` of the table.
    pub fn shape(&self) -> (usize, usize) {
        match self {
            FeatureMatrix::Dense(m) => m.shape(),
            FeatureMatrix::Sparse(m) => m.shape(),
        }
    }

    pub fn is_sparse(&self) -> bool {
        matches!(self, FeatureMatrix::Sparse(_))
    }

    /// Densify row `i` into `buf`. `buf` must have length `n_cols`.
    ///
    /// # Panics
    ///
    /// Panics on out-of-bounds `i` or a wrong-sized buffer.
    pub fn row_into(&self, i: usize, buf: &mut [f64]) {
        let (nrows, ncols) = self.shape();
        assert!(i < nrows, "row index {} out of bounds for {} rows", i, nrows);
        assert_eq!(buf.len(), ncols, "buffer length must equal column count");
        match self {
            FeatureMatrix::Dense(m) => {
                for (j, slot) in buf.iter_mut().enumerate() {
                    *slot = *m.get((i, j));
                }
            }
            FeatureMatrix::Sparse(m) => {
                buf.fill(0.0);
                if let Some(view) = m.outer_view(i) {
                    for (j, &v) in view.iter() {
                        buf[j] = v;
                    }
                }
            }
        }
    }

    /// Owned copy of row `i`.
    pub fn row(&self, i: usize) -> Vec<f64> {
        let (_, ncols) = self.shape();
        let mut buf = vec![0.0; ncols];
        self.row_into(i, &mut buf);
        buf
    }

    /// Per-column mean over all rows.
    pub fn column_means(&self) -> Vec<f64> {
        let (nrows, ncols) = self.shape();
        let mut means = vec![0.0; ncols];
        if nrows == 0 {
            return means;
        }
        match self {
            FeatureMatrix::Dense(m) => {
                for i in 0..nrows {
                    for (j, acc) in means.iter_mut().enumerate() {
                        *acc += *m.get((i, j));
                    }
                }
            }
            FeatureMatrix::Sparse(m) => {
                for row in m.outer_iterator() {
                    for (j, &v) in row.iter() {
                        means[j] += v;
                    }
                }
            }
        }
        for acc in &mut means {
            *acc /= nrows as f64;
        }
        means
    }

    /// Materialize the full table as a dense matrix. Callers evaluating
    /// metrics gate this on a size threshold; the clustering engine never
    /// densifies sparse input wholesale.
    pub fn to_dense(&self) -> Result<DenseMatrix<f64>, MatrixError> {
        match self {
            FeatureMatrix::Dense(m) => Ok(m.clone()),
            FeatureMatrix::Sparse(m) => {
                let (nrows, ncols) = m.shape();
                let mut rows = vec![vec![0.0; ncols]; nrows];
                for (i, row) in m.outer_iterator().enumerate() {
                    for (j, &v) in row.iter() {
                        rows[i][j] = v;
                    }
                }
                DenseMatrix::from_2d_vec(&rows).map_err(|e| MatrixError::Invalid(e.to_string()))
            }
        }
    }

    /// Concatenate feature blocks column-wise.
    ///
    /// The result is dense only when every input block is dense; a single
    /// sparse block makes the output sparse (dense blocks are converted,
    /// preserving sparsity of the large categorical groups). All blocks must
    /// share the same row count.
    pub fn hstack(blocks: &[FeatureMatrix]) -> Result<FeatureMatrix, MatrixError> {
        if blocks.is_empty() {
            return Err(MatrixError::Empty);
        }
        let nrows = blocks[0].shape().0;
        for (b, block) in blocks.iter().enumerate() {
            if block.shape().0 != nrows {
                return Err(MatrixError::ShapeMismatch(format!(
                    "block {} has {} rows, expected {}",
                    b,
                    block.shape().0,
                    nrows
                )));
            }
        }
        let total_cols: usize = blocks.iter().map(|b| b.shape().1).sum();
        trace!(
            "hstack: {} blocks -> {} x {} ({})",
            blocks.len(),
            nrows,
            total_cols,
            if blocks.iter().any(|b| b.is_sparse()) {
                "sparse"
            } else {
                "dense"
            }
        );

        if blocks.iter().all(|b| !b.is_sparse()) {
            let mut rows: Vec<Vec<f64>> = (0..nrows)
                .map(|_| Vec::with_capacity(total_cols))
                .collect();
            for block in blocks {
                if let FeatureMatrix::Dense(m) = block {
                    let (_, ncols) = m.shape();
                    for (i, row) in rows.iter_mut().enumerate() {
                        for j in 0..ncols {
                            row.push(*m.get((i, j)));
                        }
                    }
                }
            }
            let dm = DenseMatrix::from_2d_vec(&rows)
                .map_err(|e| MatrixError::Invalid(e.to_string()))?;
            return Ok(FeatureMatrix::Dense(dm));
        }

        let mut trimat = TriMat::new((nrows, total_cols));
        let mut col_offset = 0;
        for block in blocks {
            let (_, ncols) = block.shape();
            match block {
                FeatureMatrix::Dense(m) => {
                    for i in 0..nrows {
                        for j in 0..ncols {
                            let v = *m.get((i, j));
                            if v != 0.0 {
                                trimat.add_triplet(i, col_offset + j, v);
                            }
                        }
                    }
                }
                FeatureMatrix::Sparse(m) => {
                    for (i, row) in m.outer_iterator().enumerate() {
                        for (j, &v) in row.iter() {
                            trimat.add_triplet(i, col_offset + j, v);
                        }
                    }
                }
            }
            col_offset += ncols;
        }
        Ok(FeatureMatrix::Sparse(trimat.to_csr()))
    }
}
