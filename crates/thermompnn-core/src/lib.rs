//! # thermompnn-core
//!
//! Structure input handling for the ProteinMPNN family of models:
//!
//! - [`alphabet`]: the 21 letter model alphabet and the 14 atom slot layout.
//! - [`ProteinEntry`]: per-chain sequences and coordinates, from JSON or a parsed PDB.
//! - [`featurize`]: pad a batch of entries into the tensors the network consumes.
pub mod alphabet;
mod entry;
mod error;
pub mod featurize;
mod pdb;

pub use alphabet::{decode_sequence, AtomSlot, ALPHABET, NUM_LETTERS};
pub use entry::{ChainRecord, ProteinEntry};
pub use error::StructureError;
pub use featurize::{featurize, ProteinBatch};
