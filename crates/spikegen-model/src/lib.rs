//! In-memory network model for the spikegen code generator
//!
//! A [`Model`] is a registry of neuron groups, synapse groups and current
//! sources, each driven by a user-supplied [`Snippet`]. Callers populate the
//! model through the `add_*` methods, then call [`Model::finalize`] exactly
//! once before handing the model to the code-generation pipeline. Finalization
//! materializes derived parameters, propagates delay requirements, detects
//! which variables need history queues and merges compatible postsynaptic
//! models.

pub mod error;
pub mod init_snippets;
pub mod model;
pub mod snippet;
pub mod types;
pub mod utils;
pub mod var_init;

mod current_source;
mod neuron_group;
mod synapse_group;

pub use current_source::CurrentSource;
pub use error::{ModelError, Result};
pub use model::Model;
pub use neuron_group::NeuronGroup;
pub use snippet::{
    AdditionalInputVar, CurrentSourceCode, DerivedParam, DerivedParamFn, ExtraGlobalParam, NeuronCode,
    PostsynapticCode, RowBuildStateVar, Snippet, SnippetBuilder, SnippetKind, SparseConnectivityCode, Var,
    VarInitCode, WeightUpdateCode,
};
pub use synapse_group::SynapseGroup;
pub use types::{
    MatrixConnectivity, MatrixWeight, ScalarPrecision, SpanType, SynapseMatrixType, TimePrecision, VarAccess,
    VarImplementation, VarLocation, NO_DELAY,
};
pub use var_init::{SparseConnectivityInit, VarInit};
