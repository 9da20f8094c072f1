// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of FisherTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Layer-wise curvature estimators: block-diagonal, Kronecker-factored
//! (KFAC), eigenvalue-corrected (EFB), and diagonally-corrected (INF).
//!
//! Every estimator follows the same lifecycle: `update` feeds per-batch
//! [`LayerRecord`]s while accumulating, `invert` seals the statistics and
//! captures the current parameter means, and `sample_and_replace` then draws
//! Monte-Carlo weight perturbations around those means. Sampling before
//! inversion is a fatal precondition violation, updating after inversion a
//! sealed-estimator violation.

use crate::loading::{invert as dense_invert, DiagonalLoading};
use crate::posterior::WeightSampler;
use crate::{CurvatureError, CurvatureResult};
use ft_nn::{LayerRecord, Module, Tensor, TensorError};
use nalgebra::{Cholesky, DMatrix, DVector, Dyn};
use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::StandardNormal;
use std::collections::{BTreeMap, HashMap};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Accumulating,
    Inverted,
}

fn tensor_to_f64(tensor: &Tensor) -> DMatrix<f64> {
    let (rows, cols) = tensor.shape();
    DMatrix::from_row_iterator(rows, cols, tensor.data().iter().map(|&v| v as f64))
}

/// Appends the homogeneous bias column to an activation matrix.
fn homogeneous(activations: &Tensor) -> DMatrix<f64> {
    let (rows, cols) = activations.shape();
    DMatrix::from_fn(rows, cols + 1, |r, c| {
        if c == cols {
            1.0
        } else {
            activations.data()[r * cols + c] as f64
        }
    })
}

/// Combined weight-and-bias gradient of one layer: `gᵀ [a | 1]`, shaped
/// `(out, in + 1)` with the bias column last.
fn layer_gradient(record: &LayerRecord) -> DMatrix<f64> {
    let g = tensor_to_f64(&record.grad_output);
    let a = homogeneous(&record.activations);
    g.transpose() * a
}

fn standard_normal(rows: usize, cols: usize, rng: &mut StdRng) -> DMatrix<f64> {
    DMatrix::from_fn(rows, cols, |_, _| rng.sample(StandardNormal))
}

fn lower_cholesky(matrix: DMatrix<f64>, label: &'static str) -> CurvatureResult<DMatrix<f64>> {
    Cholesky::<f64, Dyn>::new(matrix)
        .map(|chol| chol.l())
        .ok_or(CurvatureError::DegenerateMatrix { label })
}

/// Writes `mean + delta` into every parameter of the layers present in
/// `deltas`; parameters of unobserved layers are left at their mean.
fn apply_sample<M: Module + ?Sized>(
    module: &mut M,
    means: &HashMap<String, Tensor>,
    deltas: &BTreeMap<String, DMatrix<f64>>,
) -> CurvatureResult<()> {
    module.visit_parameters_mut(&mut |param| {
        let Some(mean) = means.get(param.name()) else {
            return Err(TensorError::MissingParameter {
                name: param.name().to_string(),
            });
        };
        let Some((layer, kind)) = param.name().rsplit_once("::") else {
            return param.load_value(mean);
        };
        let Some(delta) = deltas.get(layer) else {
            return param.load_value(mean);
        };
        let bias_col = delta.ncols() - 1;
        let (rows, cols) = mean.shape();
        let value = match kind {
            "weight" => Tensor::from_fn(rows, cols, |r, c| {
                mean.data()[r * cols + c] + delta[(r, c)] as f32
            })?,
            "bias" => Tensor::from_fn(rows, cols, |_, c| {
                mean.data()[c] + delta[(c, bias_col)] as f32
            })?,
            _ => mean.clone(),
        };
        param.load_value(&value)
    })?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Block-diagonal estimator
// ---------------------------------------------------------------------------

struct DenseBlock {
    sum: DMatrix<f64>,
    updates: usize,
}

/// Dense per-layer gradient outer-product blocks.
///
/// The most faithful (and most expensive) of the layer-wise estimators: each
/// layer keeps the full `(out * (in+1))²` block, so it only scales to the
/// small reference networks.
pub struct BlockDiagonal {
    blocks: BTreeMap<String, DenseBlock>,
    inverted: BTreeMap<String, DMatrix<f64>>,
    means: HashMap<String, Tensor>,
    phase: Phase,
}

impl Default for BlockDiagonal {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockDiagonal {
    /// Creates an empty estimator.
    pub fn new() -> Self {
        Self {
            blocks: BTreeMap::new(),
            inverted: BTreeMap::new(),
            means: HashMap::new(),
            phase: Phase::Accumulating,
        }
    }

    /// Accumulates one batch worth of layer records.
    pub fn update(&mut self, records: &[LayerRecord]) -> CurvatureResult<()> {
        if self.phase == Phase::Inverted {
            return Err(CurvatureError::EstimatorSealed {
                estimator: "block_diagonal",
            });
        }
        for record in records {
            let grad = layer_gradient(record);
            let n = grad.nrows() * grad.ncols();
            let v = DVector::from_iterator(n, grad.transpose().iter().copied());
            let block = self
                .blocks
                .entry(record.layer.clone())
                .or_insert_with(|| DenseBlock {
                    sum: DMatrix::zeros(n, n),
                    updates: 0,
                });
            if block.sum.nrows() != n {
                return Err(CurvatureError::UnsupportedConfiguration {
                    expected: block.sum.nrows(),
                    got: n,
                });
            }
            block.sum.ger(1.0, &v, &v, 1.0);
            block.updates += 1;
        }
        Ok(())
    }

    /// Regularises and inverts every block, capturing the parameter means.
    pub fn invert<M: Module + ?Sized>(
        &mut self,
        module: &M,
        add: f64,
        multiply: f64,
    ) -> CurvatureResult<()> {
        let loading = DiagonalLoading::Scaled { add, multiply };
        loading.validate()?;
        if self.blocks.is_empty() {
            return Err(CurvatureError::EmptyAccumulator {
                label: "block_diagonal",
            });
        }
        let mut inverted = BTreeMap::new();
        for (layer, block) in &self.blocks {
            if block.updates == 0 {
                return Err(CurvatureError::EmptyAccumulator {
                    label: "block_diagonal_layer",
                });
            }
            let averaged = &block.sum / block.updates as f64;
            let reg = loading.apply(&averaged)?;
            let inverse = dense_invert(&reg)?;
            inverted.insert(
                layer.clone(),
                lower_cholesky(inverse, "block_diagonal_covariance")?,
            );
        }
        self.inverted = inverted;
        self.means = module.state_dict()?;
        self.phase = Phase::Inverted;
        Ok(())
    }

    /// Draws one posterior sample and writes it into the live module.
    pub fn sample_and_replace<M: Module + ?Sized>(
        &self,
        module: &mut M,
        rng: &mut StdRng,
    ) -> CurvatureResult<()> {
        if self.phase != Phase::Inverted {
            return Err(CurvatureError::EstimatorNotInverted {
                estimator: "block_diagonal",
            });
        }
        let mut deltas = BTreeMap::new();
        for (layer, lower) in &self.inverted {
            let block = self.blocks.get(layer).ok_or_else(|| {
                CurvatureError::UnknownLayer {
                    name: layer.clone(),
                }
            })?;
            let n = block.sum.nrows();
            let z = DVector::from_fn(n, |_, _| rng.sample(StandardNormal));
            let flat = lower * z;
            // Vector layout is (out, in+1) row-major, matching layer_gradient.
            let inp = self.layer_cols(layer)?;
            let out = n / inp;
            let delta = DMatrix::from_fn(out, inp, |r, c| flat[r * inp + c]);
            deltas.insert(layer.clone(), delta);
        }
        apply_sample(module, &self.means, &deltas)
    }

    fn layer_cols(&self, layer: &str) -> CurvatureResult<usize> {
        let weight = self
            .means
            .get(&format!("{layer}::weight"))
            .ok_or_else(|| CurvatureError::UnknownLayer {
                name: layer.to_string(),
            })?;
        Ok(weight.shape().1 + 1)
    }

    /// Restores the captured parameter means.
    pub fn restore<M: Module + ?Sized>(&self, module: &mut M) -> CurvatureResult<()> {
        if self.phase != Phase::Inverted {
            return Err(CurvatureError::EstimatorNotInverted {
                estimator: "block_diagonal",
            });
        }
        module.load_state_dict(&self.means)?;
        Ok(())
    }
}

impl WeightSampler for BlockDiagonal {
    fn sample_and_replace(
        &self,
        module: &mut dyn Module,
        rng: &mut StdRng,
    ) -> CurvatureResult<()> {
        BlockDiagonal::sample_and_replace(self, module, rng)
    }

    fn restore(&self, module: &mut dyn Module) -> CurvatureResult<()> {
        BlockDiagonal::restore(self, module)
    }
}

// ---------------------------------------------------------------------------
// KFAC
// ---------------------------------------------------------------------------

struct Factor {
    a_cov: DMatrix<f64>,
    g_cov: DMatrix<f64>,
    updates: usize,
}

struct KroneckerCholesky {
    a_lower: DMatrix<f64>,
    g_lower: DMatrix<f64>,
}

/// Kronecker-factored approximate curvature.
///
/// Per layer: `A` is the covariance of the homogeneous input activations,
/// `G` the covariance of the pre-activation output gradients rescaled by the
/// record's row count (the loss already averaged over the batch). The layer
/// Fisher block is approximated by `A ⊗ G`.
pub struct Kfac {
    factors: BTreeMap<String, Factor>,
    inverted: BTreeMap<String, KroneckerCholesky>,
    means: HashMap<String, Tensor>,
    phase: Phase,
}

impl Default for Kfac {
    fn default() -> Self {
        Self::new()
    }
}

impl Kfac {
    /// Creates an empty estimator.
    pub fn new() -> Self {
        Self {
            factors: BTreeMap::new(),
            inverted: BTreeMap::new(),
            means: HashMap::new(),
            phase: Phase::Accumulating,
        }
    }

    /// Accumulates one batch worth of layer records.
    pub fn update(&mut self, records: &[LayerRecord]) -> CurvatureResult<()> {
        if self.phase == Phase::Inverted {
            return Err(CurvatureError::EstimatorSealed { estimator: "kfac" });
        }
        for record in records {
            let rows = record.grad_output.shape().0;
            if rows == 0 || rows != record.activations.shape().0 {
                return Err(CurvatureError::UnsupportedConfiguration {
                    expected: record.activations.shape().0,
                    got: rows,
                });
            }
            let a = homogeneous(&record.activations);
            let g = tensor_to_f64(&record.grad_output);
            let a_update = a.transpose() * &a / rows as f64;
            let g_update = g.transpose() * &g * rows as f64;
            let factor = self
                .factors
                .entry(record.layer.clone())
                .or_insert_with(|| Factor {
                    a_cov: DMatrix::zeros(a_update.nrows(), a_update.ncols()),
                    g_cov: DMatrix::zeros(g_update.nrows(), g_update.ncols()),
                    updates: 0,
                });
            if factor.a_cov.nrows() != a_update.nrows()
                || factor.g_cov.nrows() != g_update.nrows()
            {
                return Err(CurvatureError::UnsupportedConfiguration {
                    expected: factor.a_cov.nrows(),
                    got: a_update.nrows(),
                });
            }
            factor.a_cov += a_update;
            factor.g_cov += g_update;
            factor.updates += 1;
        }
        Ok(())
    }

    /// Names of the layers with accumulated statistics.
    pub fn layers(&self) -> impl Iterator<Item = &str> {
        self.factors.keys().map(String::as_str)
    }

    /// Averaged `(A, G)` factors for one layer.
    pub(crate) fn averaged(&self, layer: &str) -> CurvatureResult<(DMatrix<f64>, DMatrix<f64>)> {
        let factor = self
            .factors
            .get(layer)
            .ok_or_else(|| CurvatureError::UnknownLayer {
                name: layer.to_string(),
            })?;
        if factor.updates == 0 {
            return Err(CurvatureError::EmptyAccumulator {
                label: "kfac_factor",
            });
        }
        let scale = 1.0 / factor.updates as f64;
        Ok((&factor.a_cov * scale, &factor.g_cov * scale))
    }

    /// Regularises and inverts both factors of every layer.
    pub fn invert<M: Module + ?Sized>(
        &mut self,
        module: &M,
        add: f64,
        multiply: f64,
    ) -> CurvatureResult<()> {
        let loading = DiagonalLoading::Scaled { add, multiply };
        loading.validate()?;
        if self.factors.is_empty() {
            return Err(CurvatureError::EmptyAccumulator { label: "kfac" });
        }
        let layer_names: Vec<String> = self.factors.keys().cloned().collect();
        let mut inverted = BTreeMap::new();
        for layer in layer_names {
            let (a_avg, g_avg) = self.averaged(&layer)?;
            let a_inv = dense_invert(&loading.apply(&a_avg)?)?;
            let g_inv = dense_invert(&loading.apply(&g_avg)?)?;
            inverted.insert(
                layer,
                KroneckerCholesky {
                    a_lower: lower_cholesky(a_inv, "kfac_a_inverse")?,
                    g_lower: lower_cholesky(g_inv, "kfac_g_inverse")?,
                },
            );
        }
        self.inverted = inverted;
        self.means = module.state_dict()?;
        self.phase = Phase::Inverted;
        Ok(())
    }

    /// Draws one matrix-normal posterior sample per layer and writes it into
    /// the live module.
    pub fn sample_and_replace<M: Module + ?Sized>(
        &self,
        module: &mut M,
        rng: &mut StdRng,
    ) -> CurvatureResult<()> {
        if self.inverted.is_empty() {
            return Err(CurvatureError::EstimatorNotInverted { estimator: "kfac" });
        }
        let mut deltas = BTreeMap::new();
        for (layer, chol) in &self.inverted {
            let out = chol.g_lower.nrows();
            let inp = chol.a_lower.nrows();
            let noise = standard_normal(out, inp, rng);
            let delta = &chol.g_lower * noise * chol.a_lower.transpose();
            deltas.insert(layer.clone(), delta);
        }
        apply_sample(module, &self.means, &deltas)
    }

    /// Restores the captured parameter means.
    pub fn restore<M: Module + ?Sized>(&self, module: &mut M) -> CurvatureResult<()> {
        if self.inverted.is_empty() {
            return Err(CurvatureError::EstimatorNotInverted { estimator: "kfac" });
        }
        module.load_state_dict(&self.means)?;
        Ok(())
    }
}

impl WeightSampler for Kfac {
    fn sample_and_replace(
        &self,
        module: &mut dyn Module,
        rng: &mut StdRng,
    ) -> CurvatureResult<()> {
        Kfac::sample_and_replace(self, module, rng)
    }

    fn restore(&self, module: &mut dyn Module) -> CurvatureResult<()> {
        Kfac::restore(self, module)
    }
}

// ---------------------------------------------------------------------------
// EFB
// ---------------------------------------------------------------------------

struct EfbLayer {
    a_basis: DMatrix<f64>,
    g_basis: DMatrix<f64>,
    second_moments: DMatrix<f64>,
    diag_moments: DMatrix<f64>,
    updates: usize,
    inv_scale: Option<DMatrix<f64>>,
}

/// Eigenvalue-corrected Kronecker factorisation.
///
/// Keeps the KFAC eigenbases but replaces the Kronecker eigenvalue products
/// with exact second moments of the per-batch gradients projected into that
/// basis. Also tracks the exact parameter-space gradient diagonal, which the
/// INF correction consumes.
pub struct Efb {
    layers: BTreeMap<String, EfbLayer>,
    means: HashMap<String, Tensor>,
    phase: Phase,
}

impl Efb {
    /// Builds the eigenbases from an accumulated KFAC estimator.
    pub fn from_kfac(kfac: &Kfac) -> CurvatureResult<Self> {
        let mut layers = BTreeMap::new();
        for layer in kfac.layers() {
            let (a_avg, g_avg) = kfac.averaged(layer)?;
            let a_sym = (&a_avg + a_avg.transpose()) * 0.5;
            let g_sym = (&g_avg + g_avg.transpose()) * 0.5;
            let a_basis = a_sym.symmetric_eigen().eigenvectors;
            let g_basis = g_sym.symmetric_eigen().eigenvectors;
            let out = g_basis.nrows();
            let inp = a_basis.nrows();
            layers.insert(
                layer.to_string(),
                EfbLayer {
                    a_basis,
                    g_basis,
                    second_moments: DMatrix::zeros(out, inp),
                    diag_moments: DMatrix::zeros(out, inp),
                    updates: 0,
                    inv_scale: None,
                },
            );
        }
        if layers.is_empty() {
            return Err(CurvatureError::EmptyAccumulator { label: "efb" });
        }
        Ok(Self {
            layers,
            means: HashMap::new(),
            phase: Phase::Accumulating,
        })
    }

    /// Accumulates projected second moments for one batch.
    pub fn update(&mut self, records: &[LayerRecord]) -> CurvatureResult<()> {
        if self.phase == Phase::Inverted {
            return Err(CurvatureError::EstimatorSealed { estimator: "efb" });
        }
        for record in records {
            let layer = self
                .layers
                .get_mut(&record.layer)
                .ok_or_else(|| CurvatureError::UnknownLayer {
                    name: record.layer.clone(),
                })?;
            let grad = layer_gradient(record);
            let projected = layer.g_basis.transpose() * &grad * &layer.a_basis;
            layer.second_moments += projected.map(|v| v * v);
            layer.diag_moments += grad.map(|v| v * v);
            layer.updates += 1;
        }
        Ok(())
    }

    pub(crate) fn layer_state(
        &self,
        layer: &str,
    ) -> CurvatureResult<(DMatrix<f64>, DMatrix<f64>, DMatrix<f64>, DMatrix<f64>)> {
        let state = self
            .layers
            .get(layer)
            .ok_or_else(|| CurvatureError::UnknownLayer {
                name: layer.to_string(),
            })?;
        if state.updates == 0 {
            return Err(CurvatureError::EmptyAccumulator { label: "efb_layer" });
        }
        let scale = 1.0 / state.updates as f64;
        Ok((
            state.a_basis.clone(),
            state.g_basis.clone(),
            &state.second_moments * scale,
            &state.diag_moments * scale,
        ))
    }

    pub(crate) fn layer_names(&self) -> impl Iterator<Item = &str> {
        self.layers.keys().map(String::as_str)
    }

    /// Seals the statistics and precomputes the inverse scalings.
    pub fn invert<M: Module + ?Sized>(
        &mut self,
        module: &M,
        add: f64,
        multiply: f64,
    ) -> CurvatureResult<()> {
        DiagonalLoading::Scaled { add, multiply }.validate()?;
        let layer_names: Vec<String> = self.layers.keys().cloned().collect();
        for layer in layer_names {
            let (_, _, scalings, _) = self.layer_state(&layer)?;
            let inv_scale =
                scalings.map(|s| 1.0 / (multiply.sqrt() * s + add.sqrt()));
            if let Some(state) = self.layers.get_mut(&layer) {
                state.inv_scale = Some(inv_scale);
            }
        }
        self.means = module.state_dict()?;
        self.phase = Phase::Inverted;
        Ok(())
    }

    /// Draws one posterior sample in the eigenbasis and writes it into the
    /// live module.
    pub fn sample_and_replace<M: Module + ?Sized>(
        &self,
        module: &mut M,
        rng: &mut StdRng,
    ) -> CurvatureResult<()> {
        if self.phase != Phase::Inverted {
            return Err(CurvatureError::EstimatorNotInverted { estimator: "efb" });
        }
        let mut deltas = BTreeMap::new();
        for (layer, state) in &self.layers {
            let Some(inv_scale) = state.inv_scale.as_ref() else {
                return Err(CurvatureError::EstimatorNotInverted { estimator: "efb" });
            };
            let noise = standard_normal(inv_scale.nrows(), inv_scale.ncols(), rng);
            let scaled = noise.zip_map(inv_scale, |n, s| n * s.sqrt());
            let delta = &state.g_basis * scaled * state.a_basis.transpose();
            deltas.insert(layer.clone(), delta);
        }
        apply_sample(module, &self.means, &deltas)
    }

    /// Restores the captured parameter means.
    pub fn restore<M: Module + ?Sized>(&self, module: &mut M) -> CurvatureResult<()> {
        if self.phase != Phase::Inverted {
            return Err(CurvatureError::EstimatorNotInverted { estimator: "efb" });
        }
        module.load_state_dict(&self.means)?;
        Ok(())
    }
}

impl WeightSampler for Efb {
    fn sample_and_replace(
        &self,
        module: &mut dyn Module,
        rng: &mut StdRng,
    ) -> CurvatureResult<()> {
        Efb::sample_and_replace(self, module, rng)
    }

    fn restore(&self, module: &mut dyn Module) -> CurvatureResult<()> {
        Efb::restore(self, module)
    }
}

// ---------------------------------------------------------------------------
// INF
// ---------------------------------------------------------------------------

struct InfLayer {
    a_basis: DMatrix<f64>,
    g_basis: DMatrix<f64>,
    scalings: DMatrix<f64>,
    diag_fim: DMatrix<f64>,
    kept: Vec<(usize, usize, f64)>,
    correction: Option<DVector<f64>>,
    inv_lower: Option<DMatrix<f64>>,
}

/// Information-form estimator: a rank-limited eigen expansion of the EFB
/// approximation plus a diagonal correction that pins the approximation's
/// diagonal to the running exact gradient diagonal.
pub struct Inf {
    layers: BTreeMap<String, InfLayer>,
    means: HashMap<String, Tensor>,
    phase: Phase,
}

impl Inf {
    /// Copies the averaged EFB state.
    pub fn from_efb(efb: &Efb) -> CurvatureResult<Self> {
        let mut layers = BTreeMap::new();
        for layer in efb.layer_names() {
            let (a_basis, g_basis, scalings, diag_fim) = efb.layer_state(layer)?;
            layers.insert(
                layer.to_string(),
                InfLayer {
                    a_basis,
                    g_basis,
                    scalings,
                    diag_fim,
                    kept: Vec::new(),
                    correction: None,
                    inv_lower: None,
                },
            );
        }
        if layers.is_empty() {
            return Err(CurvatureError::EmptyAccumulator { label: "inf" });
        }
        Ok(Self {
            layers,
            means: HashMap::new(),
            phase: Phase::Accumulating,
        })
    }

    /// Computes the rank-limited diagonal correction term.
    ///
    /// Keeps the `rank` largest eigen-coordinate scalings per layer and sets
    /// the correction to the (clamped) gap between the exact gradient
    /// diagonal and the truncated expansion's diagonal.
    pub fn update(&mut self, rank: usize) -> CurvatureResult<()> {
        if self.phase == Phase::Inverted {
            return Err(CurvatureError::EstimatorSealed { estimator: "inf" });
        }
        if rank == 0 {
            return Err(CurvatureError::InvalidParameter { label: "inf_rank" });
        }
        for state in self.layers.values_mut() {
            let out = state.scalings.nrows();
            let inp = state.scalings.ncols();
            let mut pairs: Vec<(usize, usize, f64)> = (0..out)
                .flat_map(|k| (0..inp).map(move |l| (k, l)))
                .map(|(k, l)| (k, l, state.scalings[(k, l)]))
                .collect();
            pairs.sort_by(|lhs, rhs| rhs.2.total_cmp(&lhs.2));
            pairs.truncate(rank.min(out * inp));

            let mut approx_diag: DVector<f64> = DVector::zeros(out * inp);
            for &(k, l, lambda) in &pairs {
                for i in 0..out {
                    let gi = state.g_basis[(i, k)];
                    for j in 0..inp {
                        let aj = state.a_basis[(j, l)];
                        approx_diag[i * inp + j] += lambda * (gi * aj).powi(2);
                    }
                }
            }
            let mut correction = DVector::zeros(out * inp);
            for i in 0..out {
                for j in 0..inp {
                    let gap = state.diag_fim[(i, j)] - approx_diag[i * inp + j];
                    correction[i * inp + j] = gap.max(0.0);
                }
            }
            state.kept = pairs;
            state.correction = Some(correction);
        }
        Ok(())
    }

    /// Reconstructs each corrected layer block, regularises, inverts, and
    /// factorises it for sampling.
    pub fn invert<M: Module + ?Sized>(
        &mut self,
        module: &M,
        add: f64,
        multiply: f64,
    ) -> CurvatureResult<()> {
        let loading = DiagonalLoading::Scaled { add, multiply };
        loading.validate()?;
        for state in self.layers.values_mut() {
            let Some(correction) = state.correction.as_ref() else {
                return Err(CurvatureError::InvalidParameter {
                    label: "inf_update_required_before_invert",
                });
            };
            let out = state.scalings.nrows();
            let inp = state.scalings.ncols();
            let n = out * inp;
            let mut block = DMatrix::from_diagonal(correction);
            for &(k, l, lambda) in &state.kept {
                let mut basis_column = DVector::zeros(n);
                for i in 0..out {
                    let gi = state.g_basis[(i, k)];
                    for j in 0..inp {
                        basis_column[i * inp + j] = gi * state.a_basis[(j, l)];
                    }
                }
                block.ger(lambda, &basis_column, &basis_column, 1.0);
            }
            let reg = loading.apply(&block)?;
            let inverse = dense_invert(&reg)?;
            state.inv_lower = Some(lower_cholesky(inverse, "inf_covariance")?);
        }
        self.means = module.state_dict()?;
        self.phase = Phase::Inverted;
        Ok(())
    }

    /// Draws one posterior sample and writes it into the live module.
    pub fn sample_and_replace<M: Module + ?Sized>(
        &self,
        module: &mut M,
        rng: &mut StdRng,
    ) -> CurvatureResult<()> {
        if self.phase != Phase::Inverted {
            return Err(CurvatureError::EstimatorNotInverted { estimator: "inf" });
        }
        let mut deltas = BTreeMap::new();
        for (layer, state) in &self.layers {
            let Some(lower) = state.inv_lower.as_ref() else {
                return Err(CurvatureError::EstimatorNotInverted { estimator: "inf" });
            };
            let out = state.scalings.nrows();
            let inp = state.scalings.ncols();
            let z = DVector::from_fn(out * inp, |_, _| rng.sample(StandardNormal));
            let flat = lower * z;
            let delta = DMatrix::from_fn(out, inp, |r, c| flat[r * inp + c]);
            deltas.insert(layer.clone(), delta);
        }
        apply_sample(module, &self.means, &deltas)
    }

    /// Restores the captured parameter means.
    pub fn restore<M: Module + ?Sized>(&self, module: &mut M) -> CurvatureResult<()> {
        if self.phase != Phase::Inverted {
            return Err(CurvatureError::EstimatorNotInverted { estimator: "inf" });
        }
        module.load_state_dict(&self.means)?;
        Ok(())
    }
}

impl WeightSampler for Inf {
    fn sample_and_replace(
        &self,
        module: &mut dyn Module,
        rng: &mut StdRng,
    ) -> CurvatureResult<()> {
        Inf::sample_and_replace(self, module, rng)
    }

    fn restore(&self, module: &mut dyn Module) -> CurvatureResult<()> {
        Inf::restore(self, module)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ft_nn::{CrossEntropyLoss, Linear, Loss};
    use rand::SeedableRng;

    fn record_from_backward(layer: &mut Linear, input: &Tensor, grad: &Tensor) -> LayerRecord {
        let mut records = Vec::new();
        layer
            .backward_recorded(input, grad, &mut |record| {
                records.push(record);
                Ok(())
            })
            .unwrap();
        records.pop().unwrap()
    }

    fn trained_layer_and_records() -> (Linear, Vec<LayerRecord>) {
        let mut layer = Linear::new("fc", 2, 2).unwrap();
        let mut rng = StdRng::seed_from_u64(8);
        layer.init_gaussian(0.5, &mut rng).unwrap();
        let mut loss = CrossEntropyLoss::new();
        let mut records = Vec::new();
        for step in 0..4 {
            let input =
                Tensor::from_vec(2, 2, vec![1.0, step as f32 * 0.1, -0.5, 1.0]).unwrap();
            let target = Tensor::one_hot(&[step % 2, (step + 1) % 2], 2).unwrap();
            layer.zero_accumulators().unwrap();
            let logits = layer.forward(&input).unwrap();
            let grad = loss.backward(&logits, &target).unwrap();
            records.push(record_from_backward(&mut layer, &input, &grad));
        }
        (layer, records)
    }

    #[test]
    fn sampling_before_invert_is_a_precondition_violation() {
        let (mut layer, records) = trained_layer_and_records();
        let mut kfac = Kfac::new();
        kfac.update(&records).unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        assert!(matches!(
            Kfac::sample_and_replace(&kfac, &mut layer, &mut rng),
            Err(CurvatureError::EstimatorNotInverted { .. })
        ));
    }

    #[test]
    fn update_after_invert_is_sealed() {
        let (layer, records) = trained_layer_and_records();
        let mut kfac = Kfac::new();
        kfac.update(&records).unwrap();
        kfac.invert(&layer, 1.0, 10.0).unwrap();
        assert!(matches!(
            kfac.update(&records),
            Err(CurvatureError::EstimatorSealed { .. })
        ));
    }

    #[test]
    fn kfac_sampling_perturbs_and_restore_recovers_means() {
        let (mut layer, records) = trained_layer_and_records();
        let mut kfac = Kfac::new();
        kfac.update(&records).unwrap();
        kfac.invert(&layer, 1.0, 10.0).unwrap();
        let means = layer.state_dict().unwrap();
        let mut rng = StdRng::seed_from_u64(5);
        Kfac::sample_and_replace(&kfac, &mut layer, &mut rng).unwrap();
        assert_ne!(layer.state_dict().unwrap(), means);
        Kfac::restore(&kfac, &mut layer).unwrap();
        assert_eq!(layer.state_dict().unwrap(), means);
    }

    #[test]
    fn efb_requires_known_layers() {
        let (_, records) = trained_layer_and_records();
        let mut kfac = Kfac::new();
        kfac.update(&records).unwrap();
        let mut efb = Efb::from_kfac(&kfac).unwrap();
        efb.update(&records).unwrap();
        let rogue = LayerRecord {
            layer: "ghost".to_string(),
            activations: Tensor::zeros(1, 2).unwrap(),
            grad_output: Tensor::zeros(1, 2).unwrap(),
        };
        assert!(matches!(
            efb.update(&[rogue]),
            Err(CurvatureError::UnknownLayer { .. })
        ));
    }

    #[test]
    fn inf_pipeline_runs_end_to_end() {
        let (mut layer, records) = trained_layer_and_records();
        let mut kfac = Kfac::new();
        kfac.update(&records).unwrap();
        let mut efb = Efb::from_kfac(&kfac).unwrap();
        efb.update(&records).unwrap();
        let mut inf = Inf::from_efb(&efb).unwrap();
        inf.update(3).unwrap();
        inf.invert(&layer, 1.0, 100.0).unwrap();
        let means = layer.state_dict().unwrap();
        let mut rng = StdRng::seed_from_u64(77);
        Inf::sample_and_replace(&inf, &mut layer, &mut rng).unwrap();
        assert_ne!(layer.state_dict().unwrap(), means);
        Inf::restore(&inf, &mut layer).unwrap();
        assert_eq!(layer.state_dict().unwrap(), means);
    }

    #[test]
    fn inf_invert_requires_update() {
        let (layer, records) = trained_layer_and_records();
        let mut kfac = Kfac::new();
        kfac.update(&records).unwrap();
        let mut efb = Efb::from_kfac(&kfac).unwrap();
        efb.update(&records).unwrap();
        let mut inf = Inf::from_efb(&efb).unwrap();
        assert!(matches!(
            inf.invert(&layer, 1.0, 1.0),
            Err(CurvatureError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn block_diagonal_matches_dense_layer_fisher_diagonal_shape() {
        let (mut layer, records) = trained_layer_and_records();
        let mut block = BlockDiagonal::new();
        block.update(&records).unwrap();
        block.invert(&layer, 1.0, 10.0).unwrap();
        let means = layer.state_dict().unwrap();
        let mut rng = StdRng::seed_from_u64(2);
        BlockDiagonal::sample_and_replace(&block, &mut layer, &mut rng).unwrap();
        assert_ne!(layer.state_dict().unwrap(), means);
        BlockDiagonal::restore(&block, &mut layer).unwrap();
        assert_eq!(layer.state_dict().unwrap(), means);
    }
}
