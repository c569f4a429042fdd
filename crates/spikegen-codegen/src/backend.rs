//! The backend contract: the capability set the generator pipeline consumes.
//!
//! A backend decides the scaffold (memory, parallel dispatch, atomics,
//! synchronization) while the generator decides the body. The pipeline hands
//! the backend callbacks which receive a [`CodeStream`] plus a
//! [`Substitutions`] frame whose bindings (`id`, `id_pre`, `id_syn`, ...) the
//! backend established; the callbacks emit the snippet-derived body into the
//! stream the backend has opened.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                     Backend trait                       │
//! │  - gen_neuron_update / gen_synapse_update / gen_init    │
//! │  - variable declaration / allocation / push / pull      │
//! │  - RNG, atomics, spike emission primitives              │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!              ┌────────┴────────┐
//!              ▼                 ▼
//!        ┌──────────┐      ┌──────────┐
//!        │   CUDA   │      │   CPU    │
//!        │ flavored │      │  style   │
//!        └──────────┘      └──────────┘
//! ```

use spikegen_model::{Model, NeuronGroup, ScalarPrecision, SynapseGroup, VarLocation};

use crate::code_stream::CodeStream;
use crate::error::Result;
use crate::substitutions::Substitutions;

/// Callback emitting the body for one neuron group.
pub type NeuronGroupHandler<'h> =
    &'h dyn Fn(&mut CodeStream, &Model, &NeuronGroup, &Substitutions) -> Result<()>;

/// Callback emitting a body for one synapse group.
pub type SynapseGroupHandler<'h> =
    &'h dyn Fn(&mut CodeStream, &Model, &SynapseGroup, &Substitutions) -> Result<()>;

/// Callback emitting one variable initialiser body.
pub type VarInitHandler<'h> = &'h dyn Fn(&mut CodeStream, &Substitutions) -> Result<()>;

/// Capability contract between the generator pipeline and a target.
pub trait Backend {
    // --------------------------------------------------------------------
    // Top-level artifacts
    // --------------------------------------------------------------------

    /// Emit the neuron update artifact: the pre-reset kernel (queue pointer
    /// advance, spike count zeroing) and the update kernel dispatching
    /// `handler` per neuron group with `id` bound to the in-group index.
    fn gen_neuron_update(&self, os: &mut CodeStream, model: &Model, handler: NeuronGroupHandler) -> Result<()>;

    /// Emit the synapse update artifact: presynaptic update (spike and
    /// spike-like-event), postsynaptic learning and synapse dynamics kernels.
    #[allow(clippy::too_many_arguments)]
    fn gen_synapse_update(
        &self,
        os: &mut CodeStream,
        model: &Model,
        wum_thresh_handler: SynapseGroupHandler,
        wum_sim_handler: SynapseGroupHandler,
        wum_event_handler: SynapseGroupHandler,
        wum_procedural_connect_handler: SynapseGroupHandler,
        wum_procedural_var_handler: SynapseGroupHandler,
        post_learn_handler: SynapseGroupHandler,
        synapse_dynamics_handler: SynapseGroupHandler,
    ) -> Result<()>;

    /// Emit the initialization artifact and the `initializeSparse` host step.
    fn gen_init(
        &self,
        os: &mut CodeStream,
        model: &Model,
        ng_handler: NeuronGroupHandler,
        sg_dense_var_handler: SynapseGroupHandler,
        sg_sparse_connect_handler: SynapseGroupHandler,
        sg_sparse_var_handler: SynapseGroupHandler,
    ) -> Result<()>;

    // --------------------------------------------------------------------
    // Definitions and runner plumbing
    // --------------------------------------------------------------------

    fn gen_definitions_preamble(&self, os: &mut CodeStream, model: &Model) -> Result<()>;

    fn gen_runner_preamble(&self, os: &mut CodeStream, model: &Model) -> Result<()>;

    /// Declare a variable in the user-facing and internal definition streams.
    fn gen_variable_definition(
        &self,
        definitions: &mut CodeStream,
        definitions_internal: &mut CodeStream,
        ty: &str,
        name: &str,
        loc: VarLocation,
    ) -> Result<()>;

    fn gen_variable_implementation(&self, os: &mut CodeStream, ty: &str, name: &str, loc: VarLocation) -> Result<()>;

    fn gen_variable_allocation(
        &self,
        os: &mut CodeStream,
        ty: &str,
        name: &str,
        loc: VarLocation,
        count: u32,
    ) -> Result<()>;

    fn gen_variable_free(&self, os: &mut CodeStream, name: &str, loc: VarLocation) -> Result<()>;

    /// Copy a variable host-to-device. `autoinitialized` variables are only
    /// pushed when uninitialized state must reach the device before
    /// `initializeSparse`.
    fn gen_variable_push(
        &self,
        os: &mut CodeStream,
        ty: &str,
        name: &str,
        loc: VarLocation,
        autoinitialized: bool,
        count: u32,
    ) -> Result<()>;

    fn gen_variable_pull(&self, os: &mut CodeStream, ty: &str, name: &str, loc: VarLocation, count: u32) -> Result<()>;

    /// Push one neuron variable restricted to the current delay slot when the
    /// variable is queued.
    fn gen_current_variable_push(
        &self,
        os: &mut CodeStream,
        model: &Model,
        ng: &NeuronGroup,
        ty: &str,
        name: &str,
        loc: VarLocation,
    ) -> Result<()>;

    fn gen_current_variable_pull(
        &self,
        os: &mut CodeStream,
        model: &Model,
        ng: &NeuronGroup,
        ty: &str,
        name: &str,
        loc: VarLocation,
    ) -> Result<()>;

    fn gen_extra_global_param_definition(
        &self,
        definitions: &mut CodeStream,
        ty: &str,
        name: &str,
        loc: VarLocation,
    ) -> Result<()>;

    fn gen_extra_global_param_implementation(&self, os: &mut CodeStream, ty: &str, name: &str, loc: VarLocation)
        -> Result<()>;

    /// Emit the runtime-sized allocation function for a pointer-typed extra
    /// global parameter.
    fn gen_extra_global_param_allocation(&self, os: &mut CodeStream, ty: &str, name: &str) -> Result<()>;

    fn gen_extra_global_param_push(&self, os: &mut CodeStream, ty: &str, name: &str) -> Result<()>;

    fn gen_extra_global_param_pull(&self, os: &mut CodeStream, ty: &str, name: &str) -> Result<()>;

    /// Declare a host scalar with a device mirror (queue pointers and other
    /// per-population bookkeeping).
    fn gen_global_scalar(&self, definitions: &mut CodeStream, runner: &mut CodeStream, ty: &str, name: &str)
        -> Result<()>;

    // --------------------------------------------------------------------
    // Initialization scaffolds
    // --------------------------------------------------------------------

    /// Emit a once-per-population initializer block (guarded by `id == 0` on
    /// cooperative targets).
    fn gen_pop_variable_init(
        &self,
        os: &mut CodeStream,
        loc: VarLocation,
        subs: &Substitutions,
        handler: VarInitHandler,
    ) -> Result<()>;

    /// Emit a per-element initializer; `id` is already bound by the enclosing
    /// parallel dispatch.
    fn gen_variable_init(
        &self,
        os: &mut CodeStream,
        loc: VarLocation,
        count: u32,
        index_var_name: &str,
        subs: &Substitutions,
        handler: VarInitHandler,
    ) -> Result<()>;

    /// Emit per-element initialization for one row of a synapse group's
    /// matrix; `id_pre` is bound by the caller, `id_syn`/`id_post` by the
    /// backend.
    fn gen_synapse_variable_row_init(
        &self,
        os: &mut CodeStream,
        loc: VarLocation,
        model: &Model,
        sg: &SynapseGroup,
        subs: &Substitutions,
        handler: VarInitHandler,
    ) -> Result<()>;

    // --------------------------------------------------------------------
    // Primitives
    // --------------------------------------------------------------------

    /// Textual invocation of an atomic floating point add for the target.
    fn float_atomic_add(&self, precision: ScalarPrecision) -> String;

    /// Prefix for device-resident symbols (empty on host-only targets).
    fn var_prefix(&self) -> &'static str;

    fn gen_global_rng(
        &self,
        definitions: &mut CodeStream,
        definitions_internal: &mut CodeStream,
        runner: &mut CodeStream,
        allocations: &mut CodeStream,
        free: &mut CodeStream,
    ) -> Result<()>;

    #[allow(clippy::too_many_arguments)]
    fn gen_population_rng(
        &self,
        definitions: &mut CodeStream,
        definitions_internal: &mut CodeStream,
        runner: &mut CodeStream,
        allocations: &mut CodeStream,
        free: &mut CodeStream,
        name: &str,
        count: u32,
    ) -> Result<()>;

    /// Create and destroy the timing primitives behind the model's timers.
    fn gen_timer_setup(&self, allocations: &mut CodeStream, free: &mut CodeStream, model: &Model) -> Result<()>;

    /// Stage a true spike into the backend's spike buffer.
    fn gen_emit_true_spike(&self, os: &mut CodeStream, model: &Model, ng: &NeuronGroup, subs: &Substitutions)
        -> Result<()>;

    /// Stage a spike-like event into the backend's event buffer.
    fn gen_emit_spike_like_event(
        &self,
        os: &mut CodeStream,
        model: &Model,
        ng: &NeuronGroup,
        subs: &Substitutions,
    ) -> Result<()>;

    /// Emit build rules for the generated sources.
    fn gen_makefile_fragment(&self, os: &mut CodeStream) -> Result<()>;
}
