//! A named population of identical neurons simulated by one snippet.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::error::{ModelError, Result};
use crate::snippet::{NeuronCode, Snippet};
use crate::types::{VarImplementation, VarLocation};
use crate::utils;
use crate::var_init::VarInit;

/// A neuron population. Owned by the [`crate::Model`]; synapse groups and
/// current sources refer to it by name.
#[derive(Debug)]
pub struct NeuronGroup {
    name: String,
    num_neurons: u32,
    snippet: Arc<Snippet>,
    params: Vec<f64>,
    derived_params: Vec<f64>,
    var_initialisers: Vec<VarInit>,
    var_location: Vec<VarLocation>,
    var_implementation: Vec<VarImplementation>,
    egp_location: Vec<VarLocation>,
    host_id: i32,

    // Edges into the model arena, filled in by Model::add_* calls.
    in_syn: Vec<String>,
    out_syn: Vec<String>,
    merged_in_syn: Vec<(String, Vec<String>)>,
    current_sources: Vec<String>,

    // Derived facts computed at finalize.
    num_delay_slots: u32,
    var_queue_required: Vec<bool>,
    spike_event_conditions: BTreeSet<String>,
    spike_time_required: bool,
    true_spike_required: bool,
    spike_event_required: bool,
    sim_rng_required: bool,
    init_rng_required: bool,

    spike_location: VarLocation,
    spike_event_location: VarLocation,
    spike_time_location: VarLocation,
}

impl NeuronGroup {
    pub(crate) fn new(
        name: &str,
        num_neurons: u32,
        snippet: Arc<Snippet>,
        params: Vec<f64>,
        var_initialisers: Vec<VarInit>,
        default_var_location: VarLocation,
        default_egp_location: VarLocation,
        host_id: i32,
    ) -> Self {
        let num_vars = snippet.vars().len();
        let num_egps = snippet.extra_global_params().len();
        Self {
            name: name.to_string(),
            num_neurons,
            snippet,
            params,
            derived_params: Vec::new(),
            var_initialisers,
            var_location: vec![default_var_location; num_vars],
            var_implementation: vec![VarImplementation::Individual; num_vars],
            egp_location: vec![default_egp_location; num_egps],
            host_id,
            in_syn: Vec::new(),
            out_syn: Vec::new(),
            merged_in_syn: Vec::new(),
            current_sources: Vec::new(),
            num_delay_slots: 1,
            var_queue_required: vec![false; num_vars],
            spike_event_conditions: BTreeSet::new(),
            spike_time_required: false,
            true_spike_required: false,
            spike_event_required: false,
            sim_rng_required: false,
            init_rng_required: false,
            spike_location: default_var_location,
            spike_event_location: default_var_location,
            spike_time_location: default_var_location,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn num_neurons(&self) -> u32 {
        self.num_neurons
    }

    pub fn snippet(&self) -> &Arc<Snippet> {
        &self.snippet
    }

    /// The neuron code roles of this group's snippet.
    pub fn neuron_code(&self) -> &NeuronCode {
        // Kind is checked in Model::add_neuron_population.
        self.snippet
            .neuron_code()
            .expect("neuron group holds a non-neuron snippet")
    }

    pub fn params(&self) -> &[f64] {
        &self.params
    }

    /// Derived parameter values; empty before finalize.
    pub fn derived_params(&self) -> &[f64] {
        &self.derived_params
    }

    pub fn var_initialisers(&self) -> &[VarInit] {
        &self.var_initialisers
    }

    pub fn cluster_host_id(&self) -> i32 {
        self.host_id
    }

    fn var_index(&self, var: &str) -> Result<usize> {
        self.snippet.var_index(var).ok_or_else(|| ModelError::UnknownVariable {
            group: self.name.clone(),
            var: var.to_string(),
        })
    }

    /// Set the location of a neuron state variable.
    pub fn set_var_location(&mut self, var: &str, location: VarLocation) -> Result<()> {
        let index = self.var_index(var)?;
        self.var_location[index] = location;
        Ok(())
    }

    /// Set the implementation of a neuron state variable.
    pub fn set_var_implementation(&mut self, var: &str, implementation: VarImplementation) -> Result<()> {
        let index = self.var_index(var)?;
        self.var_implementation[index] = implementation;
        Ok(())
    }

    /// Set the location of an extra global parameter (pointer-typed parameters
    /// only; scalar parameters are passed by value).
    pub fn set_extra_global_param_location(&mut self, param: &str, location: VarLocation) -> Result<()> {
        let index = self
            .snippet
            .extra_global_params()
            .iter()
            .position(|p| p.name == param)
            .ok_or_else(|| ModelError::UnknownVariable {
                group: self.name.clone(),
                var: param.to_string(),
            })?;
        self.egp_location[index] = location;
        Ok(())
    }

    pub fn var_location(&self, index: usize) -> VarLocation {
        self.var_location[index]
    }

    pub fn var_implementation(&self, index: usize) -> VarImplementation {
        self.var_implementation[index]
    }

    pub fn extra_global_param_location(&self, index: usize) -> VarLocation {
        self.egp_location[index]
    }

    pub fn set_spike_location(&mut self, location: VarLocation) {
        self.spike_location = location;
    }

    pub fn set_spike_event_location(&mut self, location: VarLocation) {
        self.spike_event_location = location;
    }

    pub fn set_spike_time_location(&mut self, location: VarLocation) {
        self.spike_time_location = location;
    }

    pub fn spike_location(&self) -> VarLocation {
        self.spike_location
    }

    pub fn spike_event_location(&self) -> VarLocation {
        self.spike_event_location
    }

    pub fn spike_time_location(&self) -> VarLocation {
        self.spike_time_location
    }

    pub fn num_delay_slots(&self) -> u32 {
        self.num_delay_slots
    }

    pub fn is_delay_required(&self) -> bool {
        self.num_delay_slots > 1
    }

    /// Is any state of this group placed in zero-copy memory?
    pub fn is_zero_copy_enabled(&self) -> bool {
        self.spike_location.is_zero_copy()
            || self.spike_event_location.is_zero_copy()
            || self.spike_time_location.is_zero_copy()
            || self.var_location.iter().any(|loc| loc.is_zero_copy())
    }

    pub fn is_var_queue_required(&self, var: &str) -> bool {
        self.snippet
            .var_index(var)
            .map(|index| self.var_queue_required[index])
            .unwrap_or(false)
    }

    pub fn is_var_queue_required_index(&self, index: usize) -> bool {
        self.var_queue_required[index]
    }

    /// Names of synapse groups providing input to this group.
    pub fn in_syn(&self) -> &[String] {
        &self.in_syn
    }

    /// Incoming synapse groups after postsynaptic-model merging: pairs of
    /// (head group, all members sharing its `inSyn` buffer).
    pub fn merged_in_syn(&self) -> &[(String, Vec<String>)] {
        &self.merged_in_syn
    }

    /// Names of synapse groups emanating from this group.
    pub fn out_syn(&self) -> &[String] {
        &self.out_syn
    }

    /// Names of current sources injecting into this group.
    pub fn current_sources(&self) -> &[String] {
        &self.current_sources
    }

    /// Spike-like-event conditions contributed by outgoing synapse groups,
    /// with parameter values already substituted.
    pub fn spike_event_conditions(&self) -> &BTreeSet<String> {
        &self.spike_event_conditions
    }

    pub fn is_spike_time_required(&self) -> bool {
        self.spike_time_required
    }

    pub fn is_true_spike_required(&self) -> bool {
        self.true_spike_required
    }

    pub fn is_spike_event_required(&self) -> bool {
        self.spike_event_required
    }

    /// Does simulating this group need a per-neuron RNG?
    pub fn is_sim_rng_required(&self) -> bool {
        self.sim_rng_required
    }

    /// Does initialising this group's state need an RNG?
    pub fn is_init_rng_required(&self) -> bool {
        self.init_rng_required
    }

    /// Expression for the queue offset addressing this timestep's slot.
    pub fn current_queue_offset(&self, dev_prefix: &str) -> String {
        format!("({}spkQuePtr{} * {})", dev_prefix, self.name, self.num_neurons)
    }

    /// Expression for the queue offset addressing the previous timestep's slot.
    pub fn prev_queue_offset(&self, dev_prefix: &str) -> String {
        format!(
            "((({}spkQuePtr{} + {}) % {}) * {})",
            dev_prefix,
            self.name,
            self.num_delay_slots - 1,
            self.num_delay_slots,
            self.num_neurons
        )
    }

    // ---------------------------------------------------------------------
    // Model-internal mutation, driven by Model::add_* and Model::finalize.
    // ---------------------------------------------------------------------

    pub(crate) fn add_in_syn(&mut self, synapse_group: &str) {
        self.in_syn.push(synapse_group.to_string());
    }

    pub(crate) fn add_out_syn(&mut self, synapse_group: &str) {
        self.out_syn.push(synapse_group.to_string());
    }

    pub(crate) fn inject_current(&mut self, current_source: &str) {
        self.current_sources.push(current_source.to_string());
    }

    /// Widen the delay ring so it covers `required_delay` slots.
    pub(crate) fn check_num_delay_slots(&mut self, required_delay: u32) {
        if required_delay > self.num_delay_slots {
            self.num_delay_slots = required_delay;
        }
    }

    /// Mark variables referenced as `$(X_pre)` in synaptic code as queued.
    pub(crate) fn update_pre_var_queues(&mut self, code: &str) {
        self.update_var_queues(code, "_pre");
    }

    /// Mark variables referenced as `$(X_post)` in synaptic code as queued.
    pub(crate) fn update_post_var_queues(&mut self, code: &str) {
        self.update_var_queues(code, "_post");
    }

    fn update_var_queues(&mut self, code: &str, suffix: &str) {
        for (index, var) in self.snippet.vars().iter().enumerate() {
            if code.contains(&format!("$({}{})", var.name, suffix)) {
                self.var_queue_required[index] = true;
            }
        }
    }

    pub(crate) fn add_spike_event_condition(&mut self, condition: String) {
        self.spike_event_conditions.insert(condition);
    }

    pub(crate) fn set_merged_in_syn(&mut self, merged: Vec<(String, Vec<String>)>) {
        self.merged_in_syn = merged;
    }

    pub(crate) fn set_derived_facts(
        &mut self,
        spike_time_required: bool,
        true_spike_required: bool,
        spike_event_required: bool,
        sim_rng_required: bool,
        init_rng_required: bool,
    ) {
        self.spike_time_required = spike_time_required;
        self.true_spike_required = true_spike_required;
        self.spike_event_required = spike_event_required;
        self.sim_rng_required = sim_rng_required;
        self.init_rng_required = init_rng_required;
    }

    pub(crate) fn init_derived_params(&mut self, dt: f64) {
        self.derived_params = self
            .snippet
            .derived_params()
            .iter()
            .map(|d| (d.func)(&self.params, dt))
            .collect();
        for init in &mut self.var_initialisers {
            init.materialize_derived_params(dt);
        }
    }

    /// Does this group's own simulation code pull from an RNG? Current
    /// sources are folded in by the finalize pass.
    pub(crate) fn scan_sim_rng(&self) -> bool {
        self.snippet
            .code_strings()
            .iter()
            .any(|(_, code)| utils::is_rng_required(code))
    }

    pub(crate) fn scan_init_rng(&self) -> bool {
        self.var_initialisers.iter().any(|init| init.is_rng_required())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snippet::NeuronCode;

    fn group() -> NeuronGroup {
        let snippet = Snippet::neuron(
            "LIF",
            NeuronCode {
                sim_code: "$(V) += $(Isyn);".to_string(),
                threshold_condition_code: "$(V) >= 1.0".to_string(),
                ..Default::default()
            },
        )
        .var("V", "scalar")
        .var("U", "scalar")
        .build();
        NeuronGroup::new(
            "pop",
            16,
            snippet,
            vec![],
            vec![VarInit::constant(0.0), VarInit::constant(0.0)],
            VarLocation::HOST_DEVICE,
            VarLocation::HOST_DEVICE,
            0,
        )
    }

    #[test]
    fn test_delay_slots_widen_only() {
        let mut ng = group();
        assert_eq!(ng.num_delay_slots(), 1);
        assert!(!ng.is_delay_required());

        ng.check_num_delay_slots(4);
        assert_eq!(ng.num_delay_slots(), 4);
        ng.check_num_delay_slots(2);
        assert_eq!(ng.num_delay_slots(), 4);
        assert!(ng.is_delay_required());
    }

    #[test]
    fn test_var_queue_scan() {
        let mut ng = group();
        ng.update_pre_var_queues("$(addToInSyn, $(g) * $(V_pre));");
        assert!(ng.is_var_queue_required("V"));
        assert!(!ng.is_var_queue_required("U"));
    }

    #[test]
    fn test_queue_offsets() {
        let mut ng = group();
        ng.check_num_delay_slots(4);
        assert_eq!(ng.current_queue_offset("dd_"), "(dd_spkQuePtrpop * 16)");
        assert_eq!(ng.prev_queue_offset("dd_"), "(((dd_spkQuePtrpop + 3) % 4) * 16)");
    }

    #[test]
    fn test_unknown_variable_rejected() {
        let mut ng = group();
        let err = ng.set_var_location("W", VarLocation::DEVICE).unwrap_err();
        assert!(matches!(err, ModelError::UnknownVariable { .. }));
    }

    #[test]
    fn test_zero_copy_detection() {
        let mut ng = group();
        assert!(!ng.is_zero_copy_enabled());
        ng.set_var_location("V", VarLocation::HOST_DEVICE_ZERO_COPY).unwrap();
        assert!(ng.is_zero_copy_enabled());
    }
}
