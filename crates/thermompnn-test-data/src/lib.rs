//! thermompnn-test-data
//!
//! Synthetic structures for use in testing.
//!
//! Coordinates are generated from an idealised alpha helix so tests do not depend on
//! downloaded files. Structures can be handed out either as raw per-residue coordinate
//! arrays or rendered to PDB text and written to a temporary file.
use std::fmt::Write as _;
use std::fs;
use tempfile::{Builder, NamedTempFile};

/// Rise per residue along the helix axis (Å).
const HELIX_RISE: f32 = 1.5;
/// Rotation per residue around the helix axis (degrees).
const HELIX_TWIST: f32 = 100.0;

/// Number of side-chain heavy atoms for each one-letter code, CB included.
#[rustfmt::skip]
pub fn side_chain_atom_count(aa: char) -> usize {
    match aa {
        'A' => 1, 'C' => 2, 'D' => 4, 'E' => 5, 'F' => 7,
        'G' => 0, 'H' => 6, 'I' => 4, 'K' => 5, 'L' => 4,
        'M' => 4, 'N' => 4, 'P' => 3, 'Q' => 5, 'R' => 7,
        'S' => 2, 'T' => 3, 'V' => 3, 'W' => 10, 'Y' => 8,
        _ => 0,
    }
}

/// A single chain with N/CA/C/O backbone coordinates and up to ten side-chain slots.
///
/// Absent side-chain atoms are `f32::NAN`.
#[derive(Debug, Clone)]
pub struct SyntheticChain {
    pub id: String,
    pub sequence: String,
    pub backbone: Vec<[[f32; 3]; 4]>,
    pub side_chain: Vec<[[f32; 3]; 10]>,
}

impl SyntheticChain {
    /// Ideal helix following `sequence`, with the axis through `origin` along z.
    pub fn helix(id: &str, sequence: &str, origin: [f32; 3]) -> Self {
        let backbone = ideal_helix(sequence.chars().count(), origin);
        let side_chain = sequence
            .chars()
            .enumerate()
            .map(|(i, aa)| side_chain_slots(i, side_chain_atom_count(aa), origin))
            .collect();
        Self {
            id: id.to_string(),
            sequence: sequence.to_string(),
            backbone,
            side_chain,
        }
    }

    pub fn len(&self) -> usize {
        self.backbone.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backbone.is_empty()
    }

    /// Per-slot coordinate columns: N, CA, C, O then SC1..SC10.
    pub fn atom_column(&self, slot: usize) -> Vec<[f32; 3]> {
        if slot < 4 {
            self.backbone.iter().map(|r| r[slot]).collect()
        } else {
            self.side_chain.iter().map(|r| r[slot - 4]).collect()
        }
    }

    /// Blank out every atom of residue `idx`, as for an unresolved residue.
    pub fn with_missing_residue(mut self, idx: usize) -> Self {
        self.backbone[idx] = [[f32::NAN; 3]; 4];
        self.side_chain[idx] = [[f32::NAN; 3]; 10];
        self
    }
}

fn helix_point(i: usize, radius: f32, phase_deg: f32, dz: f32, origin: [f32; 3]) -> [f32; 3] {
    let theta = (i as f32 * HELIX_TWIST + phase_deg).to_radians();
    [
        origin[0] + radius * theta.cos(),
        origin[1] + radius * theta.sin(),
        origin[2] + i as f32 * HELIX_RISE + dz,
    ]
}

/// Backbone atoms (N, CA, C, O) of an ideal helix with `n` residues.
pub fn ideal_helix(n: usize, origin: [f32; 3]) -> Vec<[[f32; 3]; 4]> {
    (0..n)
        .map(|i| {
            [
                helix_point(i, 1.55, -28.0, -0.8, origin),
                helix_point(i, 2.30, 0.0, 0.0, origin),
                helix_point(i, 1.60, 26.0, 0.9, origin),
                helix_point(i, 1.85, 30.0, 2.1, origin),
            ]
        })
        .collect()
}

fn side_chain_slots(i: usize, count: usize, origin: [f32; 3]) -> [[f32; 3]; 10] {
    let mut slots = [[f32::NAN; 3]; 10];
    for (k, slot) in slots.iter_mut().enumerate().take(count.min(10)) {
        *slot = helix_point(i, 3.3 + 1.2 * k as f32, 4.0 * k as f32, -0.5, origin);
    }
    slots
}

/// Two helices 12 Å apart, chain A and chain B.
pub fn two_chain_complex() -> Vec<SyntheticChain> {
    vec![
        SyntheticChain::helix("A", "MKTAYIAKQR", [0.0, 0.0, 0.0]),
        SyntheticChain::helix("B", "GSEELLKKAW", [12.0, 0.0, 0.0]),
    ]
}

/// Render chains as PDB ATOM records.
pub fn to_pdb_string(chains: &[SyntheticChain]) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "CRYST1  100.000  100.000  100.000  90.00  90.00  90.00 P 1           1"
    );
    let mut serial = 1usize;
    for chain in chains {
        for (i, aa) in chain.sequence.chars().enumerate() {
            let resname = three_letter(aa);
            let names = atom_names(aa);
            for (slot, name) in names.iter().enumerate() {
                let xyz = if slot < 4 {
                    chain.backbone[i][slot]
                } else {
                    chain.side_chain[i][slot - 4]
                };
                if xyz.iter().any(|v| !v.is_finite()) {
                    continue;
                }
                let element = &name[..1];
                let _ = writeln!(
                    out,
                    "ATOM  {:>5} {:<4} {:>3} {}{:>4}    {:>8.3}{:>8.3}{:>8.3}{:>6.2}{:>6.2}          {:>2}",
                    serial,
                    format!(" {name}"),
                    resname,
                    chain.id,
                    i + 1,
                    xyz[0],
                    xyz[1],
                    xyz[2],
                    1.0,
                    20.0,
                    element
                );
                serial += 1;
            }
        }
        let _ = writeln!(out, "TER");
    }
    let _ = writeln!(out, "END");
    out
}

#[rustfmt::skip]
fn three_letter(aa: char) -> &'static str {
    match aa {
        'A' => "ALA", 'C' => "CYS", 'D' => "ASP", 'E' => "GLU", 'F' => "PHE",
        'G' => "GLY", 'H' => "HIS", 'I' => "ILE", 'K' => "LYS", 'L' => "LEU",
        'M' => "MET", 'N' => "ASN", 'P' => "PRO", 'Q' => "GLN", 'R' => "ARG",
        'S' => "SER", 'T' => "THR", 'V' => "VAL", 'W' => "TRP", 'Y' => "TYR",
        _ => "UNK",
    }
}

/// Heavy atom names in 14-slot order for the residues used by the fixtures.
#[rustfmt::skip]
fn atom_names(aa: char) -> Vec<&'static str> {
    let side: &[&str] = match aa {
        'A' => &["CB"],
        'C' => &["CB", "SG"],
        'D' => &["CB", "CG", "OD1", "OD2"],
        'E' => &["CB", "CG", "CD", "OE1", "OE2"],
        'F' => &["CB", "CG", "CD1", "CD2", "CE1", "CE2", "CZ"],
        'H' => &["CB", "CG", "ND1", "CD2", "CE1", "NE2"],
        'I' => &["CB", "CG1", "CG2", "CD1"],
        'K' => &["CB", "CG", "CD", "CE", "NZ"],
        'L' => &["CB", "CG", "CD1", "CD2"],
        'M' => &["CB", "CG", "SD", "CE"],
        'N' => &["CB", "CG", "OD1", "ND2"],
        'P' => &["CB", "CG", "CD"],
        'Q' => &["CB", "CG", "CD", "OE1", "NE2"],
        'R' => &["CB", "CG", "CD", "NE", "CZ", "NH1", "NH2"],
        'S' => &["CB", "OG"],
        'T' => &["CB", "OG1", "CG2"],
        'V' => &["CB", "CG1", "CG2"],
        'W' => &["CB", "CG", "CD1", "CD2", "NE1", "CE2", "CE3", "CZ2", "CZ3", "CH2"],
        'Y' => &["CB", "CG", "CD1", "CD2", "CE1", "CE2", "CZ", "OH"],
        _ => &[],
    };
    let mut names = vec!["N", "CA", "C", "O"];
    names.extend_from_slice(side);
    names
}

#[derive(Debug)]
/// Test File
///
/// Example usage:
///
/// ```ignore
/// // returns (filepath, _tempfile_handle).
/// // _handle ensures the tempfile remains in scope
/// use thermompnn_test_data::TestFile;
/// let (prot_file, _temp) = TestFile::helix_dimer().create_temp().unwrap();
/// ```
pub struct TestFile {
    contents: String,
    suffix: &'static str,
}

impl TestFile {
    /// Two-chain helix complex from [`two_chain_complex`] as PDB.
    pub fn helix_dimer() -> Self {
        Self {
            contents: to_pdb_string(&two_chain_complex()),
            suffix: "pdb",
        }
    }

    /// 20 residue poly-alanine helix, chain A.
    pub fn polyala_helix() -> Self {
        let chain = SyntheticChain::helix("A", &"A".repeat(20), [0.0, 0.0, 0.0]);
        Self {
            contents: to_pdb_string(&[chain]),
            suffix: "pdb",
        }
    }

    pub fn contents(&self) -> &str {
        &self.contents
    }

    pub fn create_temp(&self) -> std::io::Result<(String, NamedTempFile)> {
        let temp = Builder::new()
            .suffix(&format!(".{}", self.suffix))
            .tempfile()?;

        fs::write(&temp, self.contents.as_bytes())?;
        let path = temp.path().to_string_lossy().into_owned();

        Ok((path, temp))
    }
}
