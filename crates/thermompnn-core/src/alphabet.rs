//! Amino acid alphabet and atom slot layout.
use strum::{Display, EnumIter, EnumString};

/// Model alphabet. Index 20 (`X`) is the unknown / gap token.
pub const ALPHABET: [char; 21] = [
    'A', 'C', 'D', 'E', 'F', 'G', 'H', 'I', 'K', 'L', 'M', 'N', 'P', 'Q', 'R', 'S', 'T', 'V', 'W',
    'Y', 'X',
];

pub const NUM_LETTERS: usize = ALPHABET.len();

#[rustfmt::skip]
pub fn aa3to1(aa: &str) -> char {
    match aa {
        "ALA" => 'A', "CYS" => 'C', "ASP" => 'D',
        "GLU" => 'E', "PHE" => 'F', "GLY" => 'G',
        "HIS" => 'H', "ILE" => 'I', "LYS" => 'K',
        "LEU" => 'L', "MET" => 'M', "ASN" => 'N',
        "PRO" => 'P', "GLN" => 'Q', "ARG" => 'R',
        "SER" => 'S', "THR" => 'T', "VAL" => 'V',
        "TRP" => 'W', "TYR" => 'Y', _     => 'X',
    }
}

/// Position of a one-letter code in [`ALPHABET`]. `None` for letters outside it.
pub fn aa_to_index(aa: char) -> Option<u32> {
    ALPHABET.iter().position(|&c| c == aa).map(|i| i as u32)
}

pub fn index_to_aa(idx: u32) -> char {
    ALPHABET.get(idx as usize).copied().unwrap_or('X')
}

pub fn decode_sequence(indices: &[u32]) -> String {
    indices.iter().map(|&i| index_to_aa(i)).collect()
}

/// Per-residue coordinate slots. The first four are the backbone; `SC1..SC10` hold
/// side-chain heavy atoms in the standard 14-atom residue order (CB first).
#[rustfmt::skip]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, EnumIter)]
pub enum AtomSlot {
    N = 0, CA = 1, C = 2, O = 3,
    SC1 = 4, SC2 = 5, SC3 = 6, SC4 = 7, SC5 = 8,
    SC6 = 9, SC7 = 10, SC8 = 11, SC9 = 12, SC10 = 13,
}

impl AtomSlot {
    pub const BACKBONE: [AtomSlot; 4] = [AtomSlot::N, AtomSlot::CA, AtomSlot::C, AtomSlot::O];

    pub fn to_index(&self) -> usize {
        *self as usize
    }

    /// Slots used by a featurized batch.
    pub fn slots(side_chains: bool) -> Vec<AtomSlot> {
        use strum::IntoEnumIterator;
        if side_chains {
            AtomSlot::iter().collect()
        } else {
            AtomSlot::BACKBONE.to_vec()
        }
    }
}

macro_rules! define_residues {
    ($($name:ident: $code3:expr, $code1:expr, $side:expr),* $(,)?) => {
        #[derive(Debug, Copy, Clone, PartialEq, Eq)]
        pub enum Residue {
            $($name),*
        }

        impl Residue {
            pub const fn code3(&self) -> &'static str {
                match self {
                    $(Self::$name => $code3),*
                }
            }
            pub const fn code1(&self) -> char {
                match self {
                    $(Self::$name => $code1),*
                }
            }
            /// Side-chain heavy atoms in slot order `SC1..`.
            pub const fn side_chain_atoms(&self) -> &'static [&'static str] {
                match self {
                    $(Self::$name => $side),*
                }
            }
            pub fn from_code3(code: &str) -> Self {
                match code {
                    $($code3 => Self::$name,)*
                    _ => Self::UNK
                }
            }
        }
    }
}

define_residues! {
    ALA: "ALA", 'A', &["CB"],
    CYS: "CYS", 'C', &["CB", "SG"],
    ASP: "ASP", 'D', &["CB", "CG", "OD1", "OD2"],
    GLU: "GLU", 'E', &["CB", "CG", "CD", "OE1", "OE2"],
    PHE: "PHE", 'F', &["CB", "CG", "CD1", "CD2", "CE1", "CE2", "CZ"],
    GLY: "GLY", 'G', &[],
    HIS: "HIS", 'H', &["CB", "CG", "ND1", "CD2", "CE1", "NE2"],
    ILE: "ILE", 'I', &["CB", "CG1", "CG2", "CD1"],
    LYS: "LYS", 'K', &["CB", "CG", "CD", "CE", "NZ"],
    LEU: "LEU", 'L', &["CB", "CG", "CD1", "CD2"],
    MET: "MET", 'M', &["CB", "CG", "SD", "CE"],
    ASN: "ASN", 'N', &["CB", "CG", "OD1", "ND2"],
    PRO: "PRO", 'P', &["CB", "CG", "CD"],
    GLN: "GLN", 'Q', &["CB", "CG", "CD", "OE1", "NE2"],
    ARG: "ARG", 'R', &["CB", "CG", "CD", "NE", "CZ", "NH1", "NH2"],
    SER: "SER", 'S', &["CB", "OG"],
    THR: "THR", 'T', &["CB", "OG1", "CG2"],
    VAL: "VAL", 'V', &["CB", "CG1", "CG2"],
    TRP: "TRP", 'W', &["CB", "CG", "CD1", "CD2", "NE1", "CE2", "CE3", "CZ2", "CZ3", "CH2"],
    TYR: "TYR", 'Y', &["CB", "CG", "CD1", "CD2", "CE1", "CE2", "CZ", "OH"],
    UNK: "UNK", 'X', &[],
}
