use crate::alphabet::{aa3to1, AtomSlot, Residue};
use crate::entry::{ChainRecord, ProteinEntry};
use crate::error::StructureError;
use pdbtbx::PDB;

const SOLVENT: [&str; 2] = ["HOH", "WAT"];

impl ProteinEntry {
    /// Build an entry from a parsed structure.
    ///
    /// Every polymer chain becomes a `ChainRecord` with all 14 atom slots filled (`NaN` where
    /// an atom is absent). Chains named in `masked_chains` are marked for design, the rest are
    /// visible context. Hetero residues and water are skipped.
    pub fn from_pdb(pdb: &PDB, name: &str, masked_chains: &[&str]) -> Result<Self, StructureError> {
        let mut entry = ProteinEntry::new(name);
        for chain in pdb.chains() {
            let chain_id = chain.id().to_string();
            let mut sequence = String::new();
            let mut slots: Vec<Vec<[f32; 3]>> = vec![Vec::new(); 14];

            for residue in chain.residues() {
                let res_name = residue.name().unwrap_or_default();
                if SOLVENT.contains(&res_name) || residue.atoms().any(|a| a.hetero()) {
                    continue;
                }
                let mut row = [[f32::NAN; 3]; 14];
                let side_chain = Residue::from_code3(res_name).side_chain_atoms();
                for atom in residue.atoms() {
                    let slot = match atom.name() {
                        "N" => Some(AtomSlot::N.to_index()),
                        "CA" => Some(AtomSlot::CA.to_index()),
                        "C" => Some(AtomSlot::C.to_index()),
                        "O" => Some(AtomSlot::O.to_index()),
                        other => side_chain.iter().position(|n| *n == other).map(|k| k + 4),
                    };
                    if let Some(slot) = slot {
                        // alternate conformers: first one wins
                        if row[slot][0].is_nan() {
                            let (x, y, z) = atom.pos();
                            row[slot] = [x as f32, y as f32, z as f32];
                        }
                    }
                }
                sequence.push(aa3to1(res_name));
                for (column, xyz) in slots.iter_mut().zip(row) {
                    column.push(xyz);
                }
            }

            if sequence.is_empty() {
                log::debug!("skipping chain {} with no polymer residues", chain_id);
                continue;
            }
            if entry.chains.contains_key(&chain_id) {
                log::warn!("duplicate chain id {}; keeping the first", chain_id);
                continue;
            }
            let record = AtomSlot::slots(true)
                .into_iter()
                .zip(slots)
                .fold(ChainRecord::new(sequence), |rec, (slot, column)| {
                    rec.with_atom(&slot.to_string(), column)
                });
            let masked = masked_chains.contains(&chain_id.as_str());
            entry = entry.with_chain(&chain_id, record, masked);
        }

        for id in masked_chains {
            if !entry.chains.contains_key(*id) {
                return Err(StructureError::MissingChain(id.to_string()));
            }
        }
        log::debug!(
            "parsed {}: {} chains, {} residues",
            name,
            entry.num_of_chains(),
            entry.len()
        );
        Ok(entry)
    }
}
