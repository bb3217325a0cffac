//! Per-residue rigid frames built from backbone atoms.
//!
//! A [`Rigid`] holds a rotation `[..., 3, 3]` and a translation `[..., 3]` over arbitrary
//! leading (batch) dims. The rotation columns are the frame's unit axes, so `apply` maps
//! local points to global ones and `invert_apply` goes back.
use super::utilities::cross_product;
use candle_core::{Result, Tensor, D};

const NORM_EPS: f64 = 1e-8;

#[derive(Clone, Debug)]
pub struct Rigid {
    rots: Tensor,
    trans: Tensor,
}

fn normalize(v: &Tensor) -> Result<Tensor> {
    let norm = (v.sqr()?.sum_keepdim(D::Minus1)? + NORM_EPS)?.sqrt()?;
    v.broadcast_div(&norm)
}

/// R · v for rotations `[..., 3, 3]` and vectors `[..., 3]`, broadcasting leading dims.
fn rotate(rots: &Tensor, v: &Tensor) -> Result<Tensor> {
    rots.broadcast_mul(&v.unsqueeze(D::Minus2)?)?.sum(D::Minus1)
}

/// Rᵀ · v
fn rotate_inverse(rots: &Tensor, v: &Tensor) -> Result<Tensor> {
    rots.broadcast_mul(&v.unsqueeze(D::Minus1)?)?.sum(D::Minus2)
}

impl Rigid {
    pub fn new(rots: Tensor, trans: Tensor) -> Self {
        Self { rots, trans }
    }

    /// Gram-Schmidt frame centred on `origin`: x along `origin - p_neg_x`, y in the plane
    /// of the three points.
    ///
    /// Colinear inputs give an undefined frame.
    pub fn from_3_points(p_neg_x: &Tensor, origin: &Tensor, p_xy_plane: &Tensor) -> Result<Self> {
        let e0 = normalize(&(origin - p_neg_x)?)?;
        let v1 = (p_xy_plane - origin)?;
        let proj = (&e0 * &v1)?.sum_keepdim(D::Minus1)?;
        let e1 = normalize(&(v1 - e0.broadcast_mul(&proj)?)?)?;
        let e2 = cross_product(&e0, &e1)?;
        let rots = Tensor::stack(&[&e0, &e1, &e2], e0.rank())?;
        Ok(Self {
            rots,
            trans: origin.clone(),
        })
    }

    pub fn rots(&self) -> &Tensor {
        &self.rots
    }

    pub fn trans(&self) -> &Tensor {
        &self.trans
    }

    /// Number of leading batch dims.
    pub fn batch_rank(&self) -> usize {
        self.trans.rank() - 1
    }

    /// Local -> global: `R p + t`. `points` may carry extra dims after the frame's batch dims
    /// as long as the frame was unsqueezed to match.
    pub fn apply(&self, points: &Tensor) -> Result<Tensor> {
        rotate(&self.rots, points)?.broadcast_add(&self.trans)
    }

    /// Global -> local: `Rᵀ (p - t)`.
    pub fn invert_apply(&self, points: &Tensor) -> Result<Tensor> {
        let v = points.broadcast_sub(&self.trans)?;
        rotate_inverse(&self.rots, &v)
    }

    pub fn invert(&self) -> Result<Self> {
        let rots = self.rots.transpose(D::Minus1, D::Minus2)?.contiguous()?;
        let trans = rotate(&rots, &self.trans)?.neg()?;
        Ok(Self { rots, trans })
    }

    /// `self ∘ other`: apply `other` first.
    pub fn compose(&self, other: &Rigid) -> Result<Self> {
        let rots = self.rots.broadcast_matmul(&other.rots)?;
        let trans = self.apply(&other.trans)?;
        Ok(Self { rots, trans })
    }

    /// Insert a batch dim at `dim` (`0..=batch_rank`).
    pub fn unsqueeze(&self, dim: usize) -> Result<Self> {
        Ok(Self {
            rots: self.rots.unsqueeze(dim)?,
            trans: self.trans.unsqueeze(dim)?,
        })
    }

    /// Pick entry `index` of batch dim `dim`, dropping that dim.
    pub fn select(&self, dim: usize, index: usize) -> Result<Self> {
        Ok(Self {
            rots: self.rots.narrow(dim, index, 1)?.squeeze(dim)?,
            trans: self.trans.narrow(dim, index, 1)?.squeeze(dim)?,
        })
    }
}
