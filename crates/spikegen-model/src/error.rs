//! Error types for model construction and finalization.

/// Result type for model operations.
pub type Result<T> = std::result::Result<T, ModelError>;

/// Errors raised while building or finalizing a network model.
///
/// Construction errors leave the model usable; the rejected call simply has
/// no effect. Finalize errors are fatal for that call and never produce a
/// partially finalized model.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("cannot add a neuron population with duplicate name: {0}")]
    DuplicateNeuronGroup(String),

    #[error("cannot add a synapse population with duplicate name: {0}")]
    DuplicateSynapseGroup(String),

    #[error("cannot add a current source with duplicate name: {0}")]
    DuplicateCurrentSource(String),

    #[error("unknown neuron group: {0}")]
    UnknownNeuronGroup(String),

    #[error("variable '{var}' is not declared by the snippet of group '{group}'")]
    UnknownVariable { group: String, var: String },

    #[error("snippet '{name}' has kind {actual}, expected {expected}")]
    WrongSnippetKind {
        name: String,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("snippet '{snippet}' declares {expected} parameters, {actual} values given")]
    ParamCountMismatch {
        snippet: String,
        expected: usize,
        actual: usize,
    },

    #[error("group '{group}' needs {expected} variable initialisers, {actual} given")]
    VarInitCountMismatch {
        group: String,
        expected: usize,
        actual: usize,
    },

    #[error("synapse group '{group}' has an incompatible matrix type: {reason}")]
    IncompatibleMatrixType { group: String, reason: String },

    #[error("variable '{var}' of group '{group}' is implemented globally and needs a constant initialiser")]
    NonConstantGlobalVar { group: String, var: String },

    #[error("cannot {operation} after the model has been finalized")]
    ModelFinalized { operation: &'static str },

    #[error("model must be finalized before code generation")]
    NotFinalized,
}
