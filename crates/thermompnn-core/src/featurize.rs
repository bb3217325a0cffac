//! Protein entries -> padded batch tensors.
use crate::alphabet::{aa_to_index, AtomSlot};
use crate::entry::ProteinEntry;
use crate::error::StructureError;
use candle_core::{Device, Result, Tensor};
use rand::seq::SliceRandom;
use rand::Rng;

/// Residue index gap inserted between consecutive chains.
pub const CHAIN_GAP: i64 = 100;
/// Residue index written at padded positions.
pub const PAD_RESIDUE_IDX: i64 = -100;

/// Padded model inputs for a batch of `B` entries, `L` = longest entry.
#[derive(Debug, Clone)]
pub struct ProteinBatch {
    /// `[B, L, atoms, 3]` f32. `NaN` for missing atoms and padding.
    pub x: Tensor,
    /// `[B, L]` u32 alphabet indices.
    pub s: Tensor,
    /// `[B, L]` f32. 1 where all backbone atoms are finite.
    pub mask: Tensor,
    pub lengths: Vec<usize>,
    /// `[B, L]` f32. 1 for residues to predict, 0 for given context.
    pub chain_m: Tensor,
    /// `[B, L]` i64.
    pub residue_idx: Tensor,
    /// `[B, L, L]` f32. 0 within a chain block, 1 elsewhere.
    pub mask_self: Tensor,
    /// `[B, L]` i64. 1-based chain number, 0 for padding.
    pub chain_encoding_all: Tensor,
}

struct ChainPlan {
    id: String,
    masked: bool,
}

/// Deduplicated chain lists, with visible chains that duplicate a masked chain's sequence
/// merged into the masked set.
fn resolve_chain_lists(
    entry: &ProteinEntry,
) -> std::result::Result<(Vec<String>, Vec<String>), StructureError> {
    let (mut masked, mut visible) = entry.chain_lists();
    let mut promoted = Vec::new();
    for m in masked.iter() {
        let m_seq = &entry.chain(m)?.sequence;
        for v in visible.iter() {
            if &entry.chain(v)?.sequence == m_seq && !promoted.contains(v) {
                promoted.push(v.clone());
            }
        }
    }
    for v in promoted {
        masked.push(v.clone());
        visible.retain(|c| c != &v);
    }
    Ok((masked, visible))
}

/// Build padded tensors from a batch of entries.
///
/// Chain order inside each entry is shuffled with `rng`.
pub fn featurize<R: Rng + ?Sized>(
    batch: &[ProteinEntry],
    device: &Device,
    side_chains: bool,
    rng: &mut R,
) -> Result<ProteinBatch> {
    if batch.is_empty() {
        return Err(StructureError::EmptyBatch.into());
    }
    let slots = AtomSlot::slots(side_chains);
    let n_atoms = slots.len();
    let b = batch.len();
    let lengths: Vec<usize> = batch.iter().map(ProteinEntry::len).collect();
    let l_max = lengths.iter().copied().max().unwrap_or(0);

    let mut x = vec![f32::NAN; b * l_max * n_atoms * 3];
    let mut s = vec![0u32; b * l_max];
    let mut chain_m = vec![0f32; b * l_max];
    let mut residue_idx = vec![PAD_RESIDUE_IDX; b * l_max];
    let mut mask_self = vec![1f32; b * l_max * l_max];
    let mut chain_encoding = vec![0i64; b * l_max];

    for (i, entry) in batch.iter().enumerate() {
        let (masked, visible) = resolve_chain_lists(entry)?;
        let mut plan: Vec<ChainPlan> = masked
            .iter()
            .map(|id| ChainPlan {
                id: id.clone(),
                masked: true,
            })
            .chain(visible.iter().map(|id| ChainPlan {
                id: id.clone(),
                masked: false,
            }))
            .collect();
        plan.shuffle(rng);

        let mut l0 = 0usize;
        for (c, chain_plan) in plan.iter().enumerate() {
            let chain = entry.chain(&chain_plan.id)?;
            let chain_len = chain.len();
            let l1 = l0 + chain_len;

            for (a, slot) in slots.iter().enumerate() {
                let atom = slot.to_string();
                let positions =
                    chain
                        .coords
                        .get(&atom)
                        .ok_or_else(|| StructureError::MissingAtom {
                            chain: chain_plan.id.clone(),
                            atom: atom.clone(),
                        })?;
                if positions.len() != chain_len {
                    return Err(StructureError::LengthMismatch {
                        chain: chain_plan.id.clone(),
                        atom,
                        expected: chain_len,
                        found: positions.len(),
                    }
                    .into());
                }
                for (r, xyz) in positions.iter().enumerate() {
                    let base = ((i * l_max + l0 + r) * n_atoms + a) * 3;
                    x[base..base + 3].copy_from_slice(xyz);
                }
            }

            for (r, aa) in chain.sequence.chars().enumerate() {
                let pos = i * l_max + l0 + r;
                s[pos] = aa_to_index(aa).ok_or(StructureError::UnknownResidue(aa))?;
                chain_m[pos] = if chain_plan.masked { 1.0 } else { 0.0 };
                chain_encoding[pos] = (c + 1) as i64;
                residue_idx[pos] = CHAIN_GAP * c as i64 + (l0 + r) as i64;
            }
            for p in l0..l1 {
                for q in l0..l1 {
                    mask_self[(i * l_max + p) * l_max + q] = 0.0;
                }
            }
            l0 = l1;
        }
    }

    // only the backbone slots decide residue validity
    let mask: Vec<f32> = (0..b * l_max)
        .map(|pos| {
            let base = pos * n_atoms * 3;
            let finite = x[base..base + 4 * 3].iter().all(|v| v.is_finite());
            if finite {
                1.0
            } else {
                0.0
            }
        })
        .collect();

    log::debug!(
        "featurized {} entries: L_max = {}, atoms = {}, valid residues = {}",
        b,
        l_max,
        n_atoms,
        mask.iter().sum::<f32>()
    );

    Ok(ProteinBatch {
        x: Tensor::from_vec(x, (b, l_max, n_atoms, 3), device)?,
        s: Tensor::from_vec(s, (b, l_max), device)?,
        mask: Tensor::from_vec(mask, (b, l_max), device)?,
        lengths,
        chain_m: Tensor::from_vec(chain_m, (b, l_max), device)?,
        residue_idx: Tensor::from_vec(residue_idx, (b, l_max), device)?,
        mask_self: Tensor::from_vec(mask_self, (b, l_max, l_max), device)?,
        chain_encoding_all: Tensor::from_vec(chain_encoding, (b, l_max), device)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::ChainRecord;
    use candle_core::IndexOp;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn chain(seq: &str, offset: f32) -> ChainRecord {
        let n = seq.len();
        let mut rec = ChainRecord::new(seq);
        for (k, atom) in ["N", "CA", "C", "O"].iter().enumerate() {
            let pos = (0..n)
                .map(|i| [offset + i as f32 * 3.8, k as f32, 0.5 * k as f32])
                .collect();
            rec = rec.with_atom(atom, pos);
        }
        rec
    }

    #[test]
    fn test_featurize_single_chain() -> Result<()> {
        let entry = ProteinEntry::new("one").with_chain("A", chain("ACDE", 0.0), true);
        let short = ProteinEntry::new("two").with_chain("A", chain("GG", 0.0), false);
        let mut rng = StdRng::seed_from_u64(0);
        let batch = featurize(&[entry, short], &Device::Cpu, false, &mut rng)?;

        assert_eq!(batch.x.dims(), &[2, 4, 4, 3]);
        assert_eq!(batch.lengths, vec![4, 2]);
        assert_eq!(batch.s.i(0)?.to_vec1::<u32>()?, vec![0, 1, 2, 3]);
        assert_eq!(batch.mask.i(1)?.to_vec1::<f32>()?, vec![1., 1., 0., 0.]);
        assert_eq!(batch.chain_m.i(0)?.to_vec1::<f32>()?, vec![1.; 4]);
        assert_eq!(batch.chain_m.i(1)?.to_vec1::<f32>()?, vec![0.; 4]);
        assert_eq!(
            batch.residue_idx.i(1)?.to_vec1::<i64>()?,
            vec![0, 1, PAD_RESIDUE_IDX, PAD_RESIDUE_IDX]
        );
        assert_eq!(
            batch.chain_encoding_all.i(1)?.to_vec1::<i64>()?,
            vec![1, 1, 0, 0]
        );
        // padded coordinates stay NaN
        let pad: Vec<f32> = batch.x.i((1, 3, 0))?.to_vec1()?;
        assert!(pad.iter().all(|v| v.is_nan()));
        Ok(())
    }

    #[test]
    fn test_featurize_chain_gap_and_self_mask() -> Result<()> {
        let entry = ProteinEntry::new("dimer")
            .with_chain("A", chain("AAA", 0.0), true)
            .with_chain("B", chain("CC", 20.0), false);
        let mut rng = StdRng::seed_from_u64(7);
        let batch = featurize(&[entry], &Device::Cpu, false, &mut rng)?;

        let ridx = batch.residue_idx.i(0)?.to_vec1::<i64>()?;
        let enc = batch.chain_encoding_all.i(0)?.to_vec1::<i64>()?;
        let cm = batch.chain_m.i(0)?.to_vec1::<f32>()?;
        let first_len = if cm[0] == 1.0 { 3 } else { 2 };
        for p in 0..5 {
            let expected_chain = if p < first_len { 1 } else { 2 };
            assert_eq!(enc[p], expected_chain);
            assert_eq!(ridx[p], CHAIN_GAP * (expected_chain - 1) + p as i64);
        }
        let mask_self = batch.mask_self.i(0)?.to_vec2::<f32>()?;
        assert_eq!(mask_self[0][1], 0.0);
        assert_eq!(mask_self[0][4], 1.0);
        assert_eq!(mask_self[4][3], 0.0);
        Ok(())
    }

    #[test]
    fn test_homo_oligomer_promotion() -> Result<()> {
        let entry = ProteinEntry::new("homodimer")
            .with_chain("A", chain("MKV", 0.0), true)
            .with_chain("B", chain("MKV", 15.0), false)
            .with_chain("C", chain("GG", 30.0), false);
        let mut rng = StdRng::seed_from_u64(3);
        let batch = featurize(&[entry], &Device::Cpu, false, &mut rng)?;
        let total: f32 = batch.chain_m.sum_all()?.to_scalar()?;
        assert_eq!(total, 6.0);
        Ok(())
    }

    #[test]
    fn test_repeated_chain_ids_pad_once() -> Result<()> {
        let mut entry = ProteinEntry::new("dup")
            .with_chain("A", chain("MKV", 0.0), true)
            .with_chain("B", chain("GG", 15.0), false);
        entry.masked_list.push("A".to_string());
        entry.visible_list.push("A".to_string());
        let short = ProteinEntry::new("short").with_chain("C", chain("W", 0.0), true);
        let batch = featurize(&[entry, short], &Device::Cpu, false, &mut StdRng::seed_from_u64(5))?;
        assert_eq!(batch.lengths, vec![5, 1]);
        assert_eq!(batch.x.dims(), &[2, 5, 4, 3]);
        assert_eq!(batch.mask.i(0)?.sum_all()?.to_scalar::<f32>()?, 5.0);
        assert_eq!(batch.chain_m.i(0)?.sum_all()?.to_scalar::<f32>()?, 3.0);
        let chains = batch.chain_encoding_all.i(0)?.to_vec1::<i64>()?;
        assert_eq!(chains.iter().max(), Some(&2));
        Ok(())
    }

    #[test]
    fn test_featurize_errors() {
        let mut rng = StdRng::seed_from_u64(0);
        assert!(featurize(&[], &Device::Cpu, false, &mut rng).is_err());

        let bad = ProteinEntry::new("bad").with_chain("A", chain("AZ", 0.0), true);
        assert!(featurize(&[bad], &Device::Cpu, false, &mut rng).is_err());

        // side chain slots requested but absent
        let bb_only = ProteinEntry::new("bb").with_chain("A", chain("AA", 0.0), true);
        assert!(featurize(&[bb_only], &Device::Cpu, true, &mut rng).is_err());
    }

    #[test]
    fn test_shuffle_is_seeded() -> Result<()> {
        let entry = ProteinEntry::new("trimer")
            .with_chain("A", chain("AAAA", 0.0), true)
            .with_chain("B", chain("CC", 20.0), false)
            .with_chain("C", chain("DDD", 40.0), false);
        let a = featurize(
            &[entry.clone()],
            &Device::Cpu,
            false,
            &mut StdRng::seed_from_u64(11),
        )?;
        let b = featurize(&[entry], &Device::Cpu, false, &mut StdRng::seed_from_u64(11))?;
        assert_eq!(a.s.to_vec2::<u32>()?, b.s.to_vec2::<u32>()?);
        Ok(())
    }
}
