//! Sequence losses, recovery metrics and the residue strata used to break recovery down:
//! burial (core / surface), interface (core / rim), monomer / oligomer and amino acid type.
use super::utilities::{nan_to_zero, virtual_cb};
use candle_core::{DType, Result, Tensor, D};
use candle_nn::encoding::one_hot;
use std::ops::AddAssign;
use thermompnn_core::alphabet::{ALPHABET, NUM_LETTERS};

/// Normaliser of the smoothed loss, a fixed token count rather than the mask sum.
pub const SMOOTHED_LOSS_TOKENS: f64 = 2000.0;
/// C-beta radius used to count neighbours for burial.
pub const BURIAL_RADIUS: f32 = 10.0;
pub const CORE_MIN_NEIGHBORS: f32 = 20.0;
pub const SURFACE_MAX_NEIGHBORS: f32 = 15.0;
/// Thresholds on C-beta neighbours from other chains.
pub const INTERFACE_CORE_MIN_NEIGHBORS: f32 = 10.0;
pub const INTERFACE_RIM_MIN_NEIGHBORS: f32 = 5.0;

fn sequence_one_hot(s: &Tensor, num_letters: usize) -> Result<Tensor> {
    one_hot(s.to_dtype(DType::U32)?, num_letters, 1f32, 0f32)
}

/// Negative log likelihood per residue, its masked mean, and arg-max correctness.
///
/// Returns `(loss [B, L], loss_av [], true_false [B, L])`.
pub fn loss_nll(s: &Tensor, log_probs: &Tensor, mask: &Tensor) -> Result<(Tensor, Tensor, Tensor)> {
    let num_letters = log_probs.dim(D::Minus1)?;
    let s_onehot = sequence_one_hot(s, num_letters)?;
    let loss = (s_onehot * log_probs)?.sum(D::Minus1)?.neg()?;
    let loss_av = ((&loss * mask)?.sum_all()? / mask.sum_all()?.to_scalar::<f32>()? as f64)?;
    let predicted = log_probs.argmax(D::Minus1)?;
    let true_false = s.to_dtype(DType::U32)?.eq(&predicted)?.to_dtype(DType::F32)?;
    Ok((loss, loss_av, true_false))
}

/// Label-smoothed negative log likelihood. Returns `(loss [B, L], loss_av [])`.
pub fn loss_smoothed(
    s: &Tensor,
    log_probs: &Tensor,
    mask: &Tensor,
    weight: f64,
) -> Result<(Tensor, Tensor)> {
    let num_letters = log_probs.dim(D::Minus1)?;
    let s_onehot = (sequence_one_hot(s, num_letters)? + weight / num_letters as f64)?;
    let s_onehot = s_onehot.broadcast_div(&s_onehot.sum_keepdim(D::Minus1)?)?;
    let loss = (s_onehot * log_probs)?.sum(D::Minus1)?.neg()?;
    let loss_av = ((&loss * mask)?.sum_all()? / SMOOTHED_LOSS_TOKENS)?;
    Ok((loss, loss_av))
}

/// `[B, L]` f32, 1 where `s_pred` matches `s`.
pub fn sequence_matches(s: &Tensor, s_pred: &Tensor) -> Result<Tensor> {
    s.to_dtype(DType::U32)?
        .eq(&s_pred.to_dtype(DType::U32)?)?
        .to_dtype(DType::F32)
}

/// Fraction of valid residues where `s_pred` matches `s`, per batch row.
pub fn sequence_recovery(s: &Tensor, s_pred: &Tensor, mask: &Tensor) -> Result<Tensor> {
    (sequence_matches(s, s_pred)? * mask)?
        .sum(1)?
        .div(&mask.sum(1)?)
}

pub fn perplexity(loss_av: &Tensor) -> Result<Tensor> {
    loss_av.exp()
}

/// `[B, L, L]` 1 where both residues are valid and their virtual C-betas lie within 10 Å.
fn contacts(x: &Tensor, mask: &Tensor) -> Result<Tensor> {
    let cb = virtual_cb(&nan_to_zero(x)?)?;
    let diff = cb.unsqueeze(2)?.broadcast_sub(&cb.unsqueeze(1)?)?;
    let dist = diff.sqr()?.sum(D::Minus1)?.sqrt()?;
    let radius = Tensor::full(BURIAL_RADIUS, dist.shape(), dist.device())?;
    let in_sphere = dist.lt(&radius)?.to_dtype(DType::F32)?;
    let mask_2d = mask.unsqueeze(2)?.broadcast_mul(&mask.unsqueeze(1)?)?;
    in_sphere * mask_2d
}

/// `[B, L, L]` f32, 1 where the two residues carry different chain labels.
fn other_chain(chain_labels: &Tensor) -> Result<Tensor> {
    let (b, l) = chain_labels.dims2()?;
    let li = chain_labels.unsqueeze(2)?.broadcast_as((b, l, l))?;
    let lj = chain_labels.unsqueeze(1)?.broadcast_as((b, l, l))?;
    li.ne(&lj)?.to_dtype(DType::F32)
}

/// Number of other valid residues whose virtual C-beta lies within 10 Å, `[B, L]`.
/// Invalid residues count 0.
pub fn burial_counts(x: &Tensor, mask: &Tensor) -> Result<Tensor> {
    contacts(x, mask)?.sum(D::Minus1)? - mask
}

/// Like [`burial_counts`], counting only neighbours from other chains.
pub fn interface_counts(x: &Tensor, mask: &Tensor, chain_labels: &Tensor) -> Result<Tensor> {
    (contacts(x, mask)? * other_chain(chain_labels)?)?.sum(D::Minus1)
}

/// Residue strata by neighbour count, each a `[B, L]` f32 indicator.
#[derive(Clone, Debug)]
pub struct BurialClasses {
    pub core: Tensor,
    pub surface: Tensor,
}

pub fn burial_classes(counts: &Tensor, mask: &Tensor) -> Result<BurialClasses> {
    let core_min = Tensor::full(CORE_MIN_NEIGHBORS, counts.shape(), counts.device())?;
    let surface_max = Tensor::full(SURFACE_MAX_NEIGHBORS, counts.shape(), counts.device())?;
    let core = (counts.ge(&core_min)?.to_dtype(DType::F32)? * mask)?;
    let surface = (counts.le(&surface_max)?.to_dtype(DType::F32)? * mask)?;
    Ok(BurialClasses { core, surface })
}

/// Interface strata by other-chain neighbour count. `rim` includes `core`.
#[derive(Clone, Debug)]
pub struct InterfaceClasses {
    pub core: Tensor,
    pub rim: Tensor,
}

pub fn interface_classes(counts: &Tensor, mask: &Tensor) -> Result<InterfaceClasses> {
    let at_least = |min: f32| -> Result<Tensor> {
        let min = Tensor::full(min, counts.shape(), counts.device())?;
        counts.ge(&min)?.to_dtype(DType::F32)? * mask
    };
    Ok(InterfaceClasses {
        core: at_least(INTERFACE_CORE_MIN_NEIGHBORS)?,
        rim: at_least(INTERFACE_RIM_MIN_NEIGHBORS)?,
    })
}

/// `[B, L]` f32, 1 at valid residues of rows with more than one chain. Label 0 is padding.
/// The monomer stratum is `mask - oligomer_mask`.
pub fn oligomer_mask(chain_labels: &Tensor, mask: &Tensor) -> Result<Tensor> {
    let labels = chain_labels.to_dtype(DType::F32)?;
    let real = labels.gt(&labels.zeros_like()?)?.to_dtype(DType::F32)?;
    let real_2d = real.unsqueeze(2)?.broadcast_mul(&real.unsqueeze(1)?)?;
    let several = (other_chain(&labels)? * real_2d)?.flatten_from(1)?.max(1)?;
    several.unsqueeze(1)?.broadcast_mul(mask)
}

/// Recovered and total residues of one stratum, summed over a batch. Add batches together
/// with `+=` and read the accuracy at the end.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct RecoveryCounts {
    pub correct: f32,
    pub total: f32,
}

impl RecoveryCounts {
    /// `true_false`, `mask` and `stratum` are `[B, L]` f32 indicators.
    pub fn new(true_false: &Tensor, mask: &Tensor, stratum: &Tensor) -> Result<Self> {
        let in_stratum = (mask * stratum)?;
        Ok(Self {
            correct: (true_false * &in_stratum)?.sum_all()?.to_scalar::<f32>()?,
            total: in_stratum.sum_all()?.to_scalar::<f32>()?,
        })
    }

    /// `None` for an empty stratum.
    pub fn accuracy(&self) -> Option<f32> {
        (self.total > 0.0).then(|| self.correct / self.total)
    }
}

impl AddAssign for RecoveryCounts {
    fn add_assign(&mut self, other: Self) {
        self.correct += other.correct;
        self.total += other.total;
    }
}

/// Recovery of each of the 20 standard amino acids, keyed by the native residue.
pub fn recovery_by_type(
    s: &Tensor,
    true_false: &Tensor,
    mask: &Tensor,
) -> Result<Vec<(char, RecoveryCounts)>> {
    let s_onehot = sequence_one_hot(s, NUM_LETTERS)?;
    let per_type = |weights: &Tensor| -> Result<Vec<f32>> {
        s_onehot
            .broadcast_mul(&weights.unsqueeze(D::Minus1)?)?
            .sum((0, 1))?
            .to_vec1::<f32>()
    };
    let correct = per_type(&(true_false * mask)?)?;
    let total = per_type(mask)?;
    Ok(ALPHABET
        .iter()
        .take(20)
        .zip(correct.into_iter().zip(total))
        .map(|(&aa, (correct, total))| (aa, RecoveryCounts { correct, total }))
        .collect())
}
