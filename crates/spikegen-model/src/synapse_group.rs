//! A named directed edge between two neuron groups, carrying a weight-update
//! snippet and a postsynaptic snippet.

use std::sync::Arc;

use crate::error::{ModelError, Result};
use crate::snippet::{PostsynapticCode, Snippet, WeightUpdateCode};
use crate::types::{SpanType, SynapseMatrixType, VarImplementation, VarLocation, NO_DELAY};
use crate::utils;
use crate::var_init::{SparseConnectivityInit, VarInit};

/// A synapse population. Owned by the [`crate::Model`]; refers to its source
/// and target neuron groups by name.
#[derive(Debug)]
pub struct SynapseGroup {
    name: String,
    matrix_type: SynapseMatrixType,
    delay_steps: u32,
    back_prop_delay_steps: u32,
    max_dendritic_delay_timesteps: u32,
    max_connections: u32,
    max_source_connections: u32,

    wu_snippet: Arc<Snippet>,
    wu_params: Vec<f64>,
    wu_derived_params: Vec<f64>,
    wu_var_initialisers: Vec<VarInit>,
    wu_pre_var_initialisers: Vec<VarInit>,
    wu_post_var_initialisers: Vec<VarInit>,

    ps_snippet: Arc<Snippet>,
    ps_params: Vec<f64>,
    ps_derived_params: Vec<f64>,
    ps_var_initialisers: Vec<VarInit>,

    connectivity_initialiser: SparseConnectivityInit,

    src: String,
    trg: String,
    src_num_neurons: u32,
    trg_num_neurons: u32,

    span_type: SpanType,
    num_threads_per_spike: u32,
    event_threshold_retest: bool,

    wu_var_location: Vec<VarLocation>,
    wu_var_implementation: Vec<VarImplementation>,
    wu_pre_var_location: Vec<VarLocation>,
    wu_post_var_location: Vec<VarLocation>,
    ps_var_location: Vec<VarLocation>,
    ps_var_implementation: Vec<VarImplementation>,
    in_syn_location: VarLocation,
    dendritic_delay_location: VarLocation,
    sparse_connectivity_location: VarLocation,
    narrow_sparse_ind: bool,

    ps_model_target_name: String,
    ps_model_merged: bool,
}

impl SynapseGroup {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        name: &str,
        matrix_type: SynapseMatrixType,
        delay_steps: u32,
        wu_snippet: Arc<Snippet>,
        wu_params: Vec<f64>,
        wu_var_initialisers: Vec<VarInit>,
        wu_pre_var_initialisers: Vec<VarInit>,
        wu_post_var_initialisers: Vec<VarInit>,
        ps_snippet: Arc<Snippet>,
        ps_params: Vec<f64>,
        ps_var_initialisers: Vec<VarInit>,
        connectivity_initialiser: SparseConnectivityInit,
        src: &str,
        trg: &str,
        src_num_neurons: u32,
        trg_num_neurons: u32,
        default_var_location: VarLocation,
        default_sparse_connectivity_location: VarLocation,
        narrow_sparse_ind: bool,
    ) -> Self {
        let num_wu_vars = wu_snippet.vars().len();
        let wu_code = wu_snippet
            .weight_update_code()
            .expect("synapse group holds a non-weight-update snippet");
        let num_pre_vars = wu_code.pre_vars.len();
        let num_post_vars = wu_code.post_vars.len();
        let num_ps_vars = ps_snippet.vars().len();

        // Sparse connectivity snippets that can bound their row length give a
        // tighter default than the full target population.
        let max_connections = connectivity_initialiser
            .max_row_length(src_num_neurons, trg_num_neurons)
            .unwrap_or(trg_num_neurons);

        // The matrix weight representation decides how weight variables are
        // implemented by default.
        let default_wu_var_implementation = match matrix_type.weight {
            crate::types::MatrixWeight::Individual => VarImplementation::Individual,
            crate::types::MatrixWeight::Global => VarImplementation::Global,
            crate::types::MatrixWeight::Procedural => VarImplementation::Procedural,
        };

        Self {
            name: name.to_string(),
            matrix_type,
            delay_steps,
            back_prop_delay_steps: NO_DELAY,
            max_dendritic_delay_timesteps: 1,
            max_connections,
            max_source_connections: src_num_neurons,
            wu_snippet,
            wu_params,
            wu_derived_params: Vec::new(),
            wu_var_initialisers,
            wu_pre_var_initialisers,
            wu_post_var_initialisers,
            ps_snippet,
            ps_params,
            ps_derived_params: Vec::new(),
            ps_var_initialisers,
            connectivity_initialiser,
            src: src.to_string(),
            trg: trg.to_string(),
            src_num_neurons,
            trg_num_neurons,
            span_type: SpanType::Postsynaptic,
            num_threads_per_spike: 1,
            event_threshold_retest: false,
            wu_var_location: vec![default_var_location; num_wu_vars],
            wu_var_implementation: vec![default_wu_var_implementation; num_wu_vars],
            wu_pre_var_location: vec![default_var_location; num_pre_vars],
            wu_post_var_location: vec![default_var_location; num_post_vars],
            ps_var_location: vec![default_var_location; num_ps_vars],
            ps_var_implementation: vec![VarImplementation::Individual; num_ps_vars],
            in_syn_location: default_var_location,
            dendritic_delay_location: default_var_location,
            sparse_connectivity_location: default_sparse_connectivity_location,
            narrow_sparse_ind,
            ps_model_target_name: name.to_string(),
            ps_model_merged: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn matrix_type(&self) -> SynapseMatrixType {
        self.matrix_type
    }

    pub fn delay_steps(&self) -> u32 {
        self.delay_steps
    }

    pub fn back_prop_delay_steps(&self) -> u32 {
        self.back_prop_delay_steps
    }

    /// Set the delay with which postsynaptic spikes reach the weight-update
    /// learning rule.
    pub fn set_back_prop_delay_steps(&mut self, steps: u32) {
        self.back_prop_delay_steps = steps;
    }

    pub fn src_name(&self) -> &str {
        &self.src
    }

    pub fn trg_name(&self) -> &str {
        &self.trg
    }

    pub fn src_num_neurons(&self) -> u32 {
        self.src_num_neurons
    }

    pub fn trg_num_neurons(&self) -> u32 {
        self.trg_num_neurons
    }

    pub fn wu_snippet(&self) -> &Arc<Snippet> {
        &self.wu_snippet
    }

    pub fn wu_code(&self) -> &WeightUpdateCode {
        self.wu_snippet
            .weight_update_code()
            .expect("synapse group holds a non-weight-update snippet")
    }

    pub fn ps_snippet(&self) -> &Arc<Snippet> {
        &self.ps_snippet
    }

    pub fn ps_code(&self) -> &PostsynapticCode {
        self.ps_snippet
            .postsynaptic_code()
            .expect("synapse group holds a non-postsynaptic snippet")
    }

    pub fn wu_params(&self) -> &[f64] {
        &self.wu_params
    }

    pub fn wu_derived_params(&self) -> &[f64] {
        &self.wu_derived_params
    }

    pub fn ps_params(&self) -> &[f64] {
        &self.ps_params
    }

    pub fn ps_derived_params(&self) -> &[f64] {
        &self.ps_derived_params
    }

    pub fn wu_var_initialisers(&self) -> &[VarInit] {
        &self.wu_var_initialisers
    }

    pub fn wu_pre_var_initialisers(&self) -> &[VarInit] {
        &self.wu_pre_var_initialisers
    }

    pub fn wu_post_var_initialisers(&self) -> &[VarInit] {
        &self.wu_post_var_initialisers
    }

    pub fn ps_var_initialisers(&self) -> &[VarInit] {
        &self.ps_var_initialisers
    }

    pub fn connectivity_initialiser(&self) -> &SparseConnectivityInit {
        &self.connectivity_initialiser
    }

    pub fn span_type(&self) -> SpanType {
        self.span_type
    }

    pub fn set_span_type(&mut self, span_type: SpanType) {
        self.span_type = span_type;
    }

    pub fn num_threads_per_spike(&self) -> u32 {
        self.num_threads_per_spike
    }

    pub fn set_num_threads_per_spike(&mut self, threads: u32) {
        self.num_threads_per_spike = threads.max(1);
    }

    /// Maximum synapses per presynaptic row (the row stride of the matrix).
    pub fn max_connections(&self) -> u32 {
        self.max_connections
    }

    pub fn set_max_connections(&mut self, max: u32) {
        self.max_connections = max;
    }

    /// Maximum synapses converging onto one postsynaptic neuron.
    pub fn max_source_connections(&self) -> u32 {
        self.max_source_connections
    }

    pub fn set_max_source_connections(&mut self, max: u32) {
        self.max_source_connections = max;
    }

    pub fn max_dendritic_delay_timesteps(&self) -> u32 {
        self.max_dendritic_delay_timesteps
    }

    pub fn set_max_dendritic_delay_timesteps(&mut self, timesteps: u32) {
        self.max_dendritic_delay_timesteps = timesteps.max(1);
    }

    pub fn is_dendritic_delay_required(&self) -> bool {
        self.max_dendritic_delay_timesteps > 1
    }

    /// Should the spike-like-event threshold be re-tested inside the synapse
    /// update? Required when the condition reads presynaptic state that may
    /// have changed since the event was emitted.
    pub fn is_event_threshold_retest_required(&self) -> bool {
        self.event_threshold_retest
    }

    pub fn set_event_threshold_retest_required(&mut self, required: bool) {
        self.event_threshold_retest = required;
    }

    pub fn is_true_spike_required(&self) -> bool {
        !self.wu_code().sim_code.is_empty()
    }

    pub fn is_spike_event_required(&self) -> bool {
        !self.wu_code().event_code.is_empty()
    }

    pub fn wu_var_location(&self, index: usize) -> VarLocation {
        self.wu_var_location[index]
    }

    pub fn wu_var_implementation(&self, index: usize) -> VarImplementation {
        self.wu_var_implementation[index]
    }

    pub fn wu_var_implementations(&self) -> &[VarImplementation] {
        &self.wu_var_implementation
    }

    pub fn wu_pre_var_location(&self, index: usize) -> VarLocation {
        self.wu_pre_var_location[index]
    }

    pub fn wu_post_var_location(&self, index: usize) -> VarLocation {
        self.wu_post_var_location[index]
    }

    pub fn ps_var_location(&self, index: usize) -> VarLocation {
        self.ps_var_location[index]
    }

    pub fn ps_var_implementation(&self, index: usize) -> VarImplementation {
        self.ps_var_implementation[index]
    }

    pub fn set_wu_var_location(&mut self, var: &str, location: VarLocation) -> Result<()> {
        let index = self.wu_var_index(var)?;
        self.wu_var_location[index] = location;
        Ok(())
    }

    pub fn set_wu_var_implementation(&mut self, var: &str, implementation: VarImplementation) -> Result<()> {
        let index = self.wu_var_index(var)?;
        self.wu_var_implementation[index] = implementation;
        Ok(())
    }

    pub fn set_ps_var_location(&mut self, var: &str, location: VarLocation) -> Result<()> {
        let index = self.ps_var_index(var)?;
        self.ps_var_location[index] = location;
        Ok(())
    }

    pub fn set_ps_var_implementation(&mut self, var: &str, implementation: VarImplementation) -> Result<()> {
        let index = self.ps_var_index(var)?;
        self.ps_var_implementation[index] = implementation;
        Ok(())
    }

    pub fn in_syn_location(&self) -> VarLocation {
        self.in_syn_location
    }

    pub fn set_in_syn_location(&mut self, location: VarLocation) {
        self.in_syn_location = location;
    }

    pub fn dendritic_delay_location(&self) -> VarLocation {
        self.dendritic_delay_location
    }

    pub fn sparse_connectivity_location(&self) -> VarLocation {
        self.sparse_connectivity_location
    }

    pub fn set_sparse_connectivity_location(&mut self, location: VarLocation) {
        self.sparse_connectivity_location = location;
    }

    /// Index type for sparse connectivity, narrowed to the target population
    /// size when narrow indices are enabled.
    pub fn sparse_ind_type(&self) -> &'static str {
        if self.narrow_sparse_ind {
            if self.trg_num_neurons <= u32::from(u8::MAX) {
                "uint8_t"
            } else if self.trg_num_neurons <= u32::from(u16::MAX) {
                "uint16_t"
            } else {
                "uint32_t"
            }
        } else {
            "unsigned int"
        }
    }

    /// Name of the synapse group whose `inSyn` buffer this group accumulates
    /// into (its own name unless the postsynaptic model was merged).
    pub fn ps_model_target_name(&self) -> &str {
        &self.ps_model_target_name
    }

    /// Does this group share an `inSyn` buffer with another group? Shared
    /// buffers must be accumulated with an atomic add.
    pub fn is_ps_model_merged(&self) -> bool {
        self.ps_model_merged
    }

    /// Expression for the queue slot presynaptic spikes are read from,
    /// honoring this group's axonal delay. `src_delay_slots` is the source
    /// group's (post-finalize) ring length.
    pub fn presynaptic_axonal_delay_slot(&self, dev_prefix: &str, src_delay_slots: u32) -> String {
        format!(
            "(({}spkQuePtr{} + {}) % {})",
            dev_prefix,
            self.src,
            src_delay_slots - self.delay_steps,
            src_delay_slots
        )
    }

    /// Expression for the queue slot postsynaptic spikes are read from,
    /// honoring this group's back-propagation delay.
    pub fn postsynaptic_back_prop_delay_slot(&self, dev_prefix: &str, trg_delay_slots: u32) -> String {
        format!(
            "(({}spkQuePtr{} + {}) % {})",
            dev_prefix,
            self.trg,
            trg_delay_slots - self.back_prop_delay_steps,
            trg_delay_slots
        )
    }

    /// Expression for the dendritic delay buffer offset. With no `offset`
    /// expression the front (current timestep) slot is addressed.
    pub fn dendritic_delay_offset(&self, dev_prefix: &str, offset: Option<&str>) -> String {
        match offset {
            None => format!(
                "({}denDelayPtr{} * {}) + ",
                dev_prefix, self.ps_model_target_name, self.trg_num_neurons
            ),
            Some(offset) => format!(
                "((({}denDelayPtr{} + {}) % {}) * {}) + ",
                dev_prefix,
                self.ps_model_target_name,
                offset,
                self.max_dendritic_delay_timesteps,
                self.trg_num_neurons
            ),
        }
    }

    pub fn is_wu_init_rng_required(&self) -> bool {
        self.wu_var_initialisers.iter().any(|init| init.is_rng_required())
            || self.connectivity_initialiser.is_rng_required()
    }

    pub fn is_ps_init_rng_required(&self) -> bool {
        self.ps_var_initialisers.iter().any(|init| init.is_rng_required())
    }

    fn wu_var_index(&self, var: &str) -> Result<usize> {
        self.wu_snippet.var_index(var).ok_or_else(|| ModelError::UnknownVariable {
            group: self.name.clone(),
            var: var.to_string(),
        })
    }

    fn ps_var_index(&self, var: &str) -> Result<usize> {
        self.ps_snippet.var_index(var).ok_or_else(|| ModelError::UnknownVariable {
            group: self.name.clone(),
            var: var.to_string(),
        })
    }

    // ---------------------------------------------------------------------
    // Model-internal mutation.
    // ---------------------------------------------------------------------

    pub(crate) fn init_derived_params(&mut self, dt: f64) {
        self.wu_derived_params = self
            .wu_snippet
            .derived_params()
            .iter()
            .map(|d| (d.func)(&self.wu_params, dt))
            .collect();
        self.ps_derived_params = self
            .ps_snippet
            .derived_params()
            .iter()
            .map(|d| (d.func)(&self.ps_params, dt))
            .collect();
        for init in self
            .wu_var_initialisers
            .iter_mut()
            .chain(&mut self.wu_pre_var_initialisers)
            .chain(&mut self.wu_post_var_initialisers)
            .chain(&mut self.ps_var_initialisers)
        {
            init.materialize_derived_params(dt);
        }
        self.connectivity_initialiser.materialize_derived_params(dt);
    }

    pub(crate) fn set_ps_model_merge_target(&mut self, target: &str) {
        self.ps_model_target_name = target.to_string();
        self.ps_model_merged = true;
    }

    /// Can this group's postsynaptic model share an `inSyn` buffer with
    /// `other`? Snippet identity, parameters, derived parameters, variable
    /// state and dendritic delay requirement must all agree, and merged
    /// postsynaptic state must be global (individual state would alias).
    pub(crate) fn can_ps_be_merged_with(&self, other: &SynapseGroup) -> bool {
        let globals_only = |group: &SynapseGroup| {
            group
                .ps_var_implementation
                .iter()
                .all(|impl_| matches!(impl_, VarImplementation::Global))
        };

        Arc::ptr_eq(&self.ps_snippet, &other.ps_snippet)
            && self.ps_params == other.ps_params
            && self.ps_derived_params == other.ps_derived_params
            && globals_only(self)
            && globals_only(other)
            && self.ps_var_init_values() == other.ps_var_init_values()
            && self.is_dendritic_delay_required() == other.is_dendritic_delay_required()
            && self.max_dendritic_delay_timesteps == other.max_dendritic_delay_timesteps
    }

    fn ps_var_init_values(&self) -> Vec<Option<f64>> {
        self.ps_var_initialisers
            .iter()
            .map(|init| init.constant_value())
            .collect()
    }

    /// All weight-update code strings, for the finalize queue scan.
    pub(crate) fn wu_code_strings(&self) -> String {
        let code = self.wu_code();
        let mut all = String::new();
        for part in [
            &code.sim_code,
            &code.event_code,
            &code.event_threshold_condition_code,
            &code.learn_post_code,
            &code.synapse_dynamics_code,
        ] {
            all.push_str(part);
            all.push('\n');
        }
        all
    }

    /// The spike-like-event condition with parameter and derived parameter
    /// values substituted, ready for the source group's condition set.
    pub(crate) fn substituted_event_threshold_condition(&self) -> String {
        let mut condition = self.wu_code().event_threshold_condition_code.clone();
        for (name, value) in self.wu_snippet.param_names().iter().zip(&self.wu_params) {
            utils::substitute(
                &mut condition,
                &format!("$({})", name),
                &utils::write_precise_string(*value),
            );
        }
        for (derived, value) in self.wu_snippet.derived_params().iter().zip(&self.wu_derived_params) {
            utils::substitute(
                &mut condition,
                &format!("$({})", derived.name),
                &utils::write_precise_string(*value),
            );
        }
        for egp in self.wu_snippet.extra_global_params() {
            utils::substitute(
                &mut condition,
                &format!("$({})", egp.name),
                &format!("{}{}", egp.name, self.name),
            );
        }
        condition
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snippet::{Snippet, WeightUpdateCode};

    fn static_pulse() -> Arc<Snippet> {
        Snippet::weight_update(
            "StaticPulse",
            WeightUpdateCode {
                sim_code: "$(addToInSyn, $(g));".to_string(),
                ..Default::default()
            },
        )
        .var("g", "scalar")
        .build()
    }

    fn delta_curr() -> Arc<Snippet> {
        Snippet::postsynaptic(
            "DeltaCurr",
            PostsynapticCode {
                apply_input_code: "$(Isyn) += $(inSyn); $(inSyn) = 0;".to_string(),
                ..Default::default()
            },
        )
        .build()
    }

    fn group_with(psm: Arc<Snippet>) -> SynapseGroup {
        SynapseGroup::new(
            "AtoB",
            SynapseMatrixType::SPARSE_INDIVIDUAL,
            NO_DELAY,
            static_pulse(),
            vec![],
            vec![VarInit::constant(0.5)],
            vec![],
            vec![],
            psm,
            vec![],
            vec![],
            SparseConnectivityInit::uninitialised(),
            "A",
            "B",
            32,
            200,
            VarLocation::HOST_DEVICE,
            VarLocation::HOST_DEVICE,
            false,
        )
    }

    fn group() -> SynapseGroup {
        group_with(delta_curr())
    }

    #[test]
    fn test_defaults() {
        let sg = group();
        assert_eq!(sg.max_connections(), 200);
        assert_eq!(sg.max_source_connections(), 32);
        assert_eq!(sg.span_type(), SpanType::Postsynaptic);
        assert_eq!(sg.ps_model_target_name(), "AtoB");
        assert!(!sg.is_ps_model_merged());
        assert!(!sg.is_dendritic_delay_required());
        assert!(sg.is_true_spike_required());
        assert!(!sg.is_spike_event_required());
    }

    #[test]
    fn test_narrow_sparse_ind_type() {
        let mut sg = group();
        assert_eq!(sg.sparse_ind_type(), "unsigned int");
        sg.narrow_sparse_ind = true;
        assert_eq!(sg.sparse_ind_type(), "uint8_t");
        sg.trg_num_neurons = 300;
        assert_eq!(sg.sparse_ind_type(), "uint16_t");
        sg.trg_num_neurons = 70_000;
        assert_eq!(sg.sparse_ind_type(), "uint32_t");
    }

    #[test]
    fn test_dendritic_delay_offset() {
        let mut sg = group();
        sg.set_max_dendritic_delay_timesteps(8);
        assert_eq!(sg.dendritic_delay_offset("dd_", None), "(dd_denDelayPtrAtoB * 200) + ");
        assert_eq!(
            sg.dendritic_delay_offset("dd_", Some("$(1)")),
            "(((dd_denDelayPtrAtoB + $(1)) % 8) * 200) + "
        );
    }

    #[test]
    fn test_merge_compatibility() {
        let psm = delta_curr();
        let mut a = group_with(Arc::clone(&psm));
        let mut b = group_with(psm);
        assert!(a.can_ps_be_merged_with(&b));

        b.set_max_dendritic_delay_timesteps(4);
        assert!(!a.can_ps_be_merged_with(&b));

        b.set_max_dendritic_delay_timesteps(1);
        a.set_ps_model_merge_target("AtoB");
        assert!(a.is_ps_model_merged());
    }

    #[test]
    fn test_threads_per_spike_clamped() {
        let mut sg = group();
        sg.set_num_threads_per_spike(0);
        assert_eq!(sg.num_threads_per_spike(), 1);
    }
}
