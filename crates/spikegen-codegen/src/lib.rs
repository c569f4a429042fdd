//! Code-generation core for spikegen.
//!
//! This crate holds the pieces between the in-memory model and a concrete
//! target: the placeholder substitution engine ([`text`], [`substitutions`]),
//! the [`backend::Backend`] capability contract, and the generators that emit
//! the neuron-update, synapse-update, initialization and runner artifacts by
//! interleaving user snippet code with backend scaffolding.
//!
//! The generator itself is single-threaded and deterministic: given the same
//! finalized model, two runs produce byte-identical output.

pub mod backend;
pub mod code_stream;
pub mod error;
pub mod functions;
pub mod init;
pub mod model_subst;
pub mod neuron_update;
pub mod runner;
pub mod substitutions;
pub mod synapse_update;
pub mod text;

pub use backend::{Backend, NeuronGroupHandler, SynapseGroupHandler, VarInitHandler};
pub use code_stream::CodeStream;
pub use error::{CodegenError, Result};
pub use functions::{function_substitutions, FunctionTemplate};
pub use init::generate_init;
pub use neuron_update::generate_neuron_update;
pub use runner::{generate_makefile, generate_runner};
pub use substitutions::Substitutions;
pub use synapse_update::generate_synapse_update;
