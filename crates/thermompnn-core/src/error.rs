use thiserror::Error;

#[derive(Error, Debug)]
pub enum StructureError {
    #[error("unknown residue code `{0}`")]
    UnknownResidue(char),
    #[error("chain `{0}` is listed but not present in the entry")]
    MissingChain(String),
    #[error("chain `{chain}` has no coordinates for atom `{atom}`")]
    MissingAtom { chain: String, atom: String },
    #[error("chain `{chain}`: atom `{atom}` has {found} positions for {expected} residues")]
    LengthMismatch {
        chain: String,
        atom: String,
        expected: usize,
        found: usize,
    },
    #[error("cannot featurize an empty batch")]
    EmptyBatch,
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl From<StructureError> for candle_core::Error {
    fn from(err: StructureError) -> Self {
        candle_core::Error::wrap(err)
    }
}
