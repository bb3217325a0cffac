//! Pre-parsed protein entries, one per structure.
//!
//! An entry holds per-chain sequences and per-chain atom coordinates keyed by slot name
//! (`N`, `CA`, `C`, `O`, `SC1`..`SC10`). Missing atoms are `NaN`; in JSON they are `null`.
use crate::error::StructureError;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainRecord {
    pub sequence: String,
    #[serde(with = "nan_coords")]
    pub coords: BTreeMap<String, Vec<[f32; 3]>>,
}

impl ChainRecord {
    pub fn new(sequence: impl Into<String>) -> Self {
        Self {
            sequence: sequence.into(),
            coords: BTreeMap::new(),
        }
    }

    pub fn with_atom(mut self, slot: &str, positions: Vec<[f32; 3]>) -> Self {
        self.coords.insert(slot.to_string(), positions);
        self
    }

    pub fn len(&self) -> usize {
        self.sequence.chars().count()
    }

    pub fn is_empty(&self) -> bool {
        self.sequence.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProteinEntry {
    pub name: String,
    pub chains: BTreeMap<String, ChainRecord>,
    /// Chains whose residues are to be predicted.
    pub masked_list: Vec<String>,
    /// Chains given as fixed context.
    pub visible_list: Vec<String>,
}

impl ProteinEntry {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            chains: BTreeMap::new(),
            masked_list: Vec::new(),
            visible_list: Vec::new(),
        }
    }

    pub fn with_chain(mut self, id: &str, chain: ChainRecord, masked: bool) -> Self {
        self.chains.insert(id.to_string(), chain);
        if masked {
            self.masked_list.push(id.to_string());
        } else {
            self.visible_list.push(id.to_string());
        }
        self
    }

    /// Masked and visible chain ids with repeats removed, in listing order. An id listed as
    /// both keeps only its masked entry.
    pub fn chain_lists(&self) -> (Vec<String>, Vec<String>) {
        let masked: Vec<String> = self.masked_list.iter().unique().cloned().collect();
        let visible = self
            .visible_list
            .iter()
            .unique()
            .filter(|id| !masked.contains(*id))
            .cloned()
            .collect();
        (masked, visible)
    }

    pub fn num_of_chains(&self) -> usize {
        let (masked, visible) = self.chain_lists();
        masked.len() + visible.len()
    }

    pub fn chain(&self, id: &str) -> Result<&ChainRecord, StructureError> {
        self.chains
            .get(id)
            .ok_or_else(|| StructureError::MissingChain(id.to_string()))
    }

    /// Total residue count across the listed chains, each chain counted once.
    pub fn len(&self) -> usize {
        let (masked, visible) = self.chain_lists();
        masked
            .iter()
            .chain(visible.iter())
            .filter_map(|id| self.chains.get(id))
            .map(ChainRecord::len)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn from_json_str(s: &str) -> Result<Self, StructureError> {
        Ok(serde_json::from_str(s)?)
    }

    pub fn to_json_string(&self) -> Result<String, StructureError> {
        Ok(serde_json::to_string(self)?)
    }
}

mod nan_coords {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::BTreeMap;

    type Coords = BTreeMap<String, Vec<[f32; 3]>>;
    type Nullable = BTreeMap<String, Vec<[Option<f32>; 3]>>;

    pub fn serialize<S: Serializer>(coords: &Coords, serializer: S) -> Result<S::Ok, S::Error> {
        let nullable: Nullable = coords
            .iter()
            .map(|(k, v)| {
                let v = v
                    .iter()
                    .map(|xyz| xyz.map(|c| if c.is_nan() { None } else { Some(c) }))
                    .collect();
                (k.clone(), v)
            })
            .collect();
        nullable.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Coords, D::Error> {
        let nullable = Nullable::deserialize(deserializer)?;
        Ok(nullable
            .into_iter()
            .map(|(k, v)| {
                let v = v
                    .into_iter()
                    .map(|xyz| xyz.map(|c| c.unwrap_or(f32::NAN)))
                    .collect();
                (k, v)
            })
            .collect())
    }
}
