// Symmetric 3x3 diffusion tensor storage, eigen decomposition and Cholesky parameterization

use nalgebra::{Matrix3, Vector3};

/// eigenvalue floor used when a tensor must be made positive definite
const PD_EIGENVALUE_FLOOR: f64 = 1e-9;

/// A symmetric diffusion tensor stored as its 6 unique entries {Dxx Dyy Dzz Dxy Dxz Dyz}
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct DiffusionTensor {
    coefficients: [f64; 6],
}

/// Eigenvalues in descending order with their eigenvectors stored as matrix columns
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TensorEigen {
    pub values: [f64; 3],
    pub vectors: Matrix3<f64>,
}

impl TensorEigen {
    /// eigenvector belonging to the largest eigenvalue
    pub fn principal_direction(&self) -> [f64; 3] {
        let c = self.vectors.column(0);
        [c[0], c[1], c[2]]
    }
}

impl DiffusionTensor {
    pub fn new(coefficients: [f64; 6]) -> Self {
        Self { coefficients }
    }

    pub fn zeros() -> Self {
        Self::default()
    }

    pub fn isotropic(diffusivity: f64) -> Self {
        Self::new([diffusivity, diffusivity, diffusivity, 0., 0., 0.])
    }

    pub fn coefficients(&self) -> &[f64; 6] {
        &self.coefficients
    }

    pub fn is_finite(&self) -> bool {
        self.coefficients.iter().all(|c| c.is_finite())
    }

    /// builds a tensor from the lower triangle of a 3 x 3 matrix
    pub fn from_matrix(m: &Matrix3<f64>) -> Self {
        Self::new([m[(0, 0)], m[(1, 1)], m[(2, 2)], m[(1, 0)], m[(2, 0)], m[(2, 1)]])
    }

    pub fn to_matrix(&self) -> Matrix3<f64> {
        let [xx, yy, zz, xy, xz, yz] = self.coefficients;
        Matrix3::new(
            xx, xy, xz,
            xy, yy, yz,
            xz, yz, zz,
        )
    }

    /// apparent diffusion coefficient g^T D g along a unit direction
    pub fn apparent_diffusivity(&self, g: &[f64; 3]) -> f64 {
        let [xx, yy, zz, xy, xz, yz] = self.coefficients;
        xx * g[0] * g[0] + yy * g[1] * g[1] + zz * g[2] * g[2]
            + 2.0 * (xy * g[0] * g[1] + xz * g[0] * g[2] + yz * g[1] * g[2])
    }

    pub fn trace(&self) -> f64 {
        self.coefficients[0] + self.coefficients[1] + self.coefficients[2]
    }

    /// eigen decomposition with eigenvalues sorted in descending order
    pub fn eigen(&self) -> TensorEigen {
        let eig = self.to_matrix().symmetric_eigen();
        let mut order = [0usize, 1, 2];
        order.sort_by(|&a, &b| eig.eigenvalues[b].total_cmp(&eig.eigenvalues[a]));
        let values = [eig.eigenvalues[order[0]], eig.eigenvalues[order[1]], eig.eigenvalues[order[2]]];
        let vectors = Matrix3::from_columns(&[
            eig.eigenvectors.column(order[0]).into_owned(),
            eig.eigenvectors.column(order[1]).into_owned(),
            eig.eigenvectors.column(order[2]).into_owned(),
        ]);
        TensorEigen { values, vectors }
    }

    pub fn eigenvalues(&self) -> [f64; 3] {
        self.eigen().values
    }

    /// reassembles V diag(values) V^T
    pub fn from_eigen(values: [f64; 3], vectors: &Matrix3<f64>) -> Self {
        let d = Matrix3::from_diagonal(&Vector3::from(values));
        Self::from_matrix(&(vectors * d * vectors.transpose()))
    }

    /// builds a tensor whose principal eigenvector points along dir
    pub fn from_principal_direction(dir: &[f64; 3], values: [f64; 3]) -> Self {
        Self::from_eigen(values, &eigenvector_frame(dir))
    }

    /// replaces eigenvalues below floor with floor
    pub fn project_psd(&self, floor: f64) -> Self {
        let e = self.eigen();
        Self::from_eigen(e.values.map(|v| v.max(floor)), &e.vectors)
    }

    /// Lower-triangular Cholesky factor L (D = L L^T) stored row-wise as {Lxx Lyx Lyy Lzx Lzy Lzz}.
    /// Tensors that are not positive definite are projected first.
    pub fn to_cholesky(&self) -> [f64; 6] {
        let chol = self
            .to_matrix()
            .cholesky()
            .or_else(|| self.project_psd(PD_EIGENVALUE_FLOOR).to_matrix().cholesky());
        match chol {
            Some(c) => {
                let l = c.l();
                [l[(0, 0)], l[(1, 0)], l[(1, 1)], l[(2, 0)], l[(2, 1)], l[(2, 2)]]
            }
            None => {
                let s = PD_EIGENVALUE_FLOOR.sqrt();
                [s, 0., s, 0., 0., s]
            }
        }
    }

    /// inverse of [Self::to_cholesky]. Any 6 values give a positive semi-definite tensor
    pub fn from_cholesky(l: &[f64; 6]) -> Self {
        Self::new(cholesky_to_coefficients(l))
    }
}

pub(crate) fn cholesky_to_coefficients(l: &[f64; 6]) -> [f64; 6] {
    let [l0, l1, l2, l3, l4, l5] = *l;
    [
        l0 * l0,
        l1 * l1 + l2 * l2,
        l3 * l3 + l4 * l4 + l5 * l5,
        l0 * l1,
        l0 * l3,
        l1 * l3 + l2 * l4,
    ]
}

/// Partial derivatives of the tensor coefficients w.r.t. the Cholesky entries. Entry [k][j] is
/// d(coefficient k) / d(l_j)
pub(crate) fn cholesky_jacobian(l: &[f64; 6]) -> [[f64; 6]; 6] {
    let [l0, l1, l2, l3, l4, l5] = *l;
    [
        [2. * l0, 0., 0., 0., 0., 0.],
        [0., 2. * l1, 2. * l2, 0., 0., 0.],
        [0., 0., 0., 2. * l3, 2. * l4, 2. * l5],
        [l1, l0, 0., 0., 0., 0.],
        [l3, 0., 0., l0, 0., 0.],
        [0., l3, l4, l1, l2, 0.],
    ]
}

/// Orthonormal frame whose first column is the normalized principal direction. The remaining
/// columns are arbitrary but perpendicular.
pub fn eigenvector_frame(principal_dir: &[f64; 3]) -> Matrix3<f64> {
    let e1 = Vector3::from(*principal_dir).normalize();

    // any vector not parallel to e1
    let temp = if e1[0].abs() < 0.9 { Vector3::x() } else { Vector3::y() };

    let e2 = e1.cross(&temp).normalize();
    let e3 = e1.cross(&e2);

    Matrix3::from_columns(&[e1, e2, e3])
}
