//! The network model: registries of neuron groups, synapse groups and current
//! sources, plus the finalization pass that computes derived facts.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use crate::current_source::CurrentSource;
use crate::error::{ModelError, Result};
use crate::neuron_group::NeuronGroup;
use crate::snippet::{Snippet, SnippetKind};
use crate::synapse_group::SynapseGroup;
use crate::types::{
    MatrixConnectivity, MatrixWeight, ScalarPrecision, SynapseMatrixType, TimePrecision, VarLocation, NO_DELAY,
};
use crate::utils;
use crate::var_init::{SparseConnectivityInit, VarInit};

/// A neuronal network model.
///
/// The model exclusively owns every group; groups reference each other by
/// name. Registries are ordered maps so that two generator runs over the same
/// model iterate identically and produce byte-identical output.
#[derive(Debug)]
pub struct Model {
    name: String,
    precision: ScalarPrecision,
    time_precision: TimePrecision,
    dt: f64,
    timing_enabled: bool,
    seed: u32,
    default_var_location: VarLocation,
    default_egp_location: VarLocation,
    default_sparse_connectivity_location: VarLocation,
    default_narrow_sparse_ind: bool,
    merge_postsynaptic_models: bool,

    neuron_groups: BTreeMap<String, NeuronGroup>,
    synapse_groups: BTreeMap<String, SynapseGroup>,
    current_sources: BTreeMap<String, CurrentSource>,

    finalized: bool,
}

impl Default for Model {
    fn default() -> Self {
        Self::new()
    }
}

impl Model {
    pub fn new() -> Self {
        Self {
            name: String::new(),
            precision: ScalarPrecision::Single,
            time_precision: TimePrecision::Default,
            dt: 0.5,
            timing_enabled: false,
            seed: 0,
            default_var_location: VarLocation::HOST_DEVICE,
            default_egp_location: VarLocation::HOST_DEVICE,
            default_sparse_connectivity_location: VarLocation::HOST_DEVICE,
            default_narrow_sparse_ind: false,
            merge_postsynaptic_models: false,
            neuron_groups: BTreeMap::new(),
            synapse_groups: BTreeMap::new(),
            current_sources: BTreeMap::new(),
            finalized: false,
        }
    }

    // ---------------------------------------------------------------------
    // Configuration
    // ---------------------------------------------------------------------

    pub fn set_name(&mut self, name: &str) {
        self.name = name.to_string();
    }

    pub fn set_precision(&mut self, precision: ScalarPrecision) {
        self.precision = precision;
    }

    pub fn set_time_precision(&mut self, precision: TimePrecision) {
        self.time_precision = precision;
    }

    /// Set the integration step size of the model.
    pub fn set_dt(&mut self, dt: f64) {
        self.dt = dt;
    }

    /// Set whether timers and timing commands are included in generated code.
    pub fn set_timing(&mut self, enabled: bool) {
        self.timing_enabled = enabled;
    }

    /// Set the random seed (0 keeps automatic seeding).
    pub fn set_seed(&mut self, seed: u32) {
        self.seed = seed;
    }

    pub fn set_default_var_location(&mut self, location: VarLocation) {
        self.default_var_location = location;
    }

    pub fn set_default_extra_global_param_location(&mut self, location: VarLocation) {
        self.default_egp_location = location;
    }

    pub fn set_default_sparse_connectivity_location(&mut self, location: VarLocation) {
        self.default_sparse_connectivity_location = location;
    }

    /// Use narrow (less than 32-bit) types for sparse matrix indices where the
    /// target population size allows.
    pub fn set_default_narrow_sparse_ind(&mut self, enabled: bool) {
        self.default_narrow_sparse_ind = enabled;
    }

    /// Merge compatible postsynaptic models so they share one `inSyn` buffer.
    pub fn set_merge_postsynaptic_models(&mut self, merge: bool) {
        self.merge_postsynaptic_models = merge;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn precision(&self) -> ScalarPrecision {
        self.precision
    }

    /// The C type used for model state.
    pub fn precision_str(&self) -> &'static str {
        self.precision.type_str()
    }

    /// The C type used for time values.
    pub fn time_precision_str(&self) -> &'static str {
        match self.time_precision {
            TimePrecision::Default => self.precision.type_str(),
            TimePrecision::Float => "float",
            TimePrecision::Double => "double",
        }
    }

    pub fn dt(&self) -> f64 {
        self.dt
    }

    pub fn seed(&self) -> u32 {
        self.seed
    }

    pub fn is_timing_enabled(&self) -> bool {
        self.timing_enabled
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// The string literal representing `value` in the model's floating point
    /// type, written at full precision.
    pub fn scalar_expr(&self, value: f64) -> String {
        let literal = utils::write_precise_string(value);
        if self.precision.is_single() {
            format!("{}f", literal)
        } else {
            literal
        }
    }

    /// Are any variables in any populations placed in zero-copy memory?
    pub fn zero_copy_in_use(&self) -> bool {
        self.neuron_groups.values().any(|ng| ng.is_zero_copy_enabled())
    }

    // ---------------------------------------------------------------------
    // Population registry
    // ---------------------------------------------------------------------

    /// Adds a neuron population of `size` neurons driven by a neuron snippet.
    pub fn add_neuron_population(
        &mut self,
        name: &str,
        size: u32,
        snippet: &Arc<Snippet>,
        params: Vec<f64>,
        var_initialisers: Vec<VarInit>,
        host_id: i32,
    ) -> Result<&mut NeuronGroup> {
        self.check_not_finalized("add a neuron population")?;
        check_kind(snippet, "neuron", |kind| matches!(kind, SnippetKind::Neuron(_)))?;
        check_param_count(snippet, &params)?;
        check_var_init_count(name, snippet.vars().len(), var_initialisers.len())?;
        if self.neuron_groups.contains_key(name) {
            return Err(ModelError::DuplicateNeuronGroup(name.to_string()));
        }

        let group = NeuronGroup::new(
            name,
            size,
            Arc::clone(snippet),
            params,
            var_initialisers,
            self.default_var_location,
            self.default_egp_location,
            host_id,
        );
        Ok(self.neuron_groups.entry(name.to_string()).or_insert(group))
    }

    /// Adds a synapse population connecting `src` to `trg`.
    #[allow(clippy::too_many_arguments)]
    pub fn add_synapse_population(
        &mut self,
        name: &str,
        matrix_type: SynapseMatrixType,
        delay_steps: u32,
        src: &str,
        trg: &str,
        wum: &Arc<Snippet>,
        wum_params: Vec<f64>,
        wum_var_initialisers: Vec<VarInit>,
        wum_pre_var_initialisers: Vec<VarInit>,
        wum_post_var_initialisers: Vec<VarInit>,
        psm: &Arc<Snippet>,
        psm_params: Vec<f64>,
        psm_var_initialisers: Vec<VarInit>,
        connectivity_initialiser: SparseConnectivityInit,
    ) -> Result<&mut SynapseGroup> {
        self.check_not_finalized("add a synapse population")?;
        check_kind(wum, "weight update", |kind| matches!(kind, SnippetKind::WeightUpdate(_)))?;
        check_kind(psm, "postsynaptic", |kind| matches!(kind, SnippetKind::Postsynaptic(_)))?;
        check_param_count(wum, &wum_params)?;
        check_param_count(psm, &psm_params)?;
        check_var_init_count(name, wum.vars().len(), wum_var_initialisers.len())?;
        check_var_init_count(name, psm.vars().len(), psm_var_initialisers.len())?;
        let wu_code = wum
            .weight_update_code()
            .expect("weight update kind checked above");
        check_var_init_count(name, wu_code.pre_vars.len(), wum_pre_var_initialisers.len())?;
        check_var_init_count(name, wu_code.post_vars.len(), wum_post_var_initialisers.len())?;
        check_matrix_type(name, matrix_type)?;
        if self.synapse_groups.contains_key(name) {
            return Err(ModelError::DuplicateSynapseGroup(name.to_string()));
        }

        // Global weights carry no per-synapse storage, so their value must be
        // known at generation time.
        if matches!(matrix_type.weight, MatrixWeight::Global) {
            for (var, init) in wum.vars().iter().zip(&wum_var_initialisers) {
                if init.constant_value().is_none() {
                    return Err(ModelError::NonConstantGlobalVar {
                        group: name.to_string(),
                        var: var.name.clone(),
                    });
                }
            }
        }

        let src_num = self
            .neuron_groups
            .get(src)
            .ok_or_else(|| ModelError::UnknownNeuronGroup(src.to_string()))?
            .num_neurons();
        let trg_num = self
            .neuron_groups
            .get(trg)
            .ok_or_else(|| ModelError::UnknownNeuronGroup(trg.to_string()))?
            .num_neurons();

        let group = SynapseGroup::new(
            name,
            matrix_type,
            delay_steps,
            Arc::clone(wum),
            wum_params,
            wum_var_initialisers,
            wum_pre_var_initialisers,
            wum_post_var_initialisers,
            Arc::clone(psm),
            psm_params,
            psm_var_initialisers,
            connectivity_initialiser,
            src,
            trg,
            src_num,
            trg_num,
            self.default_var_location,
            self.default_sparse_connectivity_location,
            self.default_narrow_sparse_ind,
        );

        self.neuron_group_internal_mut(src).add_out_syn(name);
        self.neuron_group_internal_mut(trg).add_in_syn(name);
        Ok(self.synapse_groups.entry(name.to_string()).or_insert(group))
    }

    /// Adds a current source injecting into `target` each timestep.
    pub fn add_current_source(
        &mut self,
        name: &str,
        snippet: &Arc<Snippet>,
        target: &str,
        params: Vec<f64>,
        var_initialisers: Vec<VarInit>,
    ) -> Result<&mut CurrentSource> {
        self.check_not_finalized("add a current source")?;
        check_kind(snippet, "current source", |kind| {
            matches!(kind, SnippetKind::CurrentSource(_))
        })?;
        check_param_count(snippet, &params)?;
        check_var_init_count(name, snippet.vars().len(), var_initialisers.len())?;
        if self.current_sources.contains_key(name) {
            return Err(ModelError::DuplicateCurrentSource(name.to_string()));
        }
        if !self.neuron_groups.contains_key(target) {
            return Err(ModelError::UnknownNeuronGroup(target.to_string()));
        }

        let source = CurrentSource::new(
            name,
            Arc::clone(snippet),
            params,
            var_initialisers,
            target,
            self.default_var_location,
            self.default_egp_location,
        );
        self.neuron_group_internal_mut(target).inject_current(name);
        Ok(self.current_sources.entry(name.to_string()).or_insert(source))
    }

    pub fn neuron_group(&self, name: &str) -> Option<&NeuronGroup> {
        self.neuron_groups.get(name)
    }

    pub fn neuron_group_mut(&mut self, name: &str) -> Option<&mut NeuronGroup> {
        self.neuron_groups.get_mut(name)
    }

    pub fn synapse_group(&self, name: &str) -> Option<&SynapseGroup> {
        self.synapse_groups.get(name)
    }

    pub fn synapse_group_mut(&mut self, name: &str) -> Option<&mut SynapseGroup> {
        self.synapse_groups.get_mut(name)
    }

    pub fn current_source(&self, name: &str) -> Option<&CurrentSource> {
        self.current_sources.get(name)
    }

    /// Neuron groups in deterministic (name) order.
    pub fn neuron_groups(&self) -> impl Iterator<Item = &NeuronGroup> {
        self.neuron_groups.values()
    }

    /// Synapse groups in deterministic (name) order.
    pub fn synapse_groups(&self) -> impl Iterator<Item = &SynapseGroup> {
        self.synapse_groups.values()
    }

    /// Current sources in deterministic (name) order.
    pub fn current_sources(&self) -> impl Iterator<Item = &CurrentSource> {
        self.current_sources.values()
    }

    /// Source neuron group of a synapse group. The reference is valid by
    /// construction: groups are only added with resolvable endpoints and never
    /// removed.
    pub fn src_neuron_group(&self, sg: &SynapseGroup) -> &NeuronGroup {
        self.neuron_groups
            .get(sg.src_name())
            .expect("synapse group references unknown source neuron group")
    }

    /// Target neuron group of a synapse group.
    pub fn trg_neuron_group(&self, sg: &SynapseGroup) -> &NeuronGroup {
        self.neuron_groups
            .get(sg.trg_name())
            .expect("synapse group references unknown target neuron group")
    }

    // ---------------------------------------------------------------------
    // Finalization
    // ---------------------------------------------------------------------

    /// Finalize the model: materialize derived parameters, propagate delay
    /// requirements, detect queued variables, collect spike-event conditions
    /// and merge compatible postsynaptic models.
    ///
    /// Must be called before code generation. A second call is a no-op.
    pub fn finalize(&mut self) -> Result<()> {
        if self.finalized {
            return Ok(());
        }
        debug!(model = %self.name, "finalizing model");

        let dt = self.dt;
        for ng in self.neuron_groups.values_mut() {
            ng.init_derived_params(dt);
        }
        for cs in self.current_sources.values_mut() {
            cs.init_derived_params(dt);
        }
        for sg in self.synapse_groups.values_mut() {
            sg.init_derived_params(dt);
        }

        // Delay widening, queue detection and spike-event condition
        // collection, flowing from each synapse group to its endpoints.
        let synapse_groups = &self.synapse_groups;
        let neuron_groups = &mut self.neuron_groups;
        for sg in synapse_groups.values() {
            let wu_code = sg.wu_code_strings();

            let src = neuron_groups
                .get_mut(sg.src_name())
                .expect("synapse group references unknown source neuron group");
            if sg.delay_steps() != NO_DELAY {
                src.check_num_delay_slots(sg.delay_steps() + 1);
            }
            src.update_pre_var_queues(&wu_code);
            if sg.is_spike_event_required() {
                src.add_spike_event_condition(sg.substituted_event_threshold_condition());
            }

            let trg = neuron_groups
                .get_mut(sg.trg_name())
                .expect("synapse group references unknown target neuron group");
            if sg.back_prop_delay_steps() != NO_DELAY {
                trg.check_num_delay_slots(sg.back_prop_delay_steps() + 1);
            }
            trg.update_post_var_queues(&wu_code);
        }

        self.merge_incoming_psm();
        self.compute_neuron_group_facts();

        self.finalized = true;
        Ok(())
    }

    /// Partition each neuron group's incoming synapse groups into merge sets.
    fn merge_incoming_psm(&mut self) {
        let ng_names: Vec<String> = self.neuron_groups.keys().cloned().collect();
        for ng_name in &ng_names {
            let in_syn: Vec<String> = self.neuron_groups[ng_name].in_syn().to_vec();

            let mut merged: Vec<(String, Vec<String>)> = Vec::new();
            for sg_name in &in_syn {
                let mut target = None;
                if self.merge_postsynaptic_models {
                    let sg = &self.synapse_groups[sg_name];
                    target = merged
                        .iter()
                        .position(|(head, _)| sg.can_ps_be_merged_with(&self.synapse_groups[head]));
                }
                match target {
                    Some(index) => merged[index].1.push(sg_name.clone()),
                    None => merged.push((sg_name.clone(), vec![sg_name.clone()])),
                }
            }

            for (head, members) in &merged {
                if members.len() > 1 {
                    debug!(neuron_group = %ng_name, head = %head, members = members.len(),
                           "merging postsynaptic models");
                    let head = head.clone();
                    for member in members {
                        self.synapse_groups
                            .get_mut(member)
                            .expect("merged synapse group disappeared")
                            .set_ps_model_merge_target(&head);
                    }
                }
            }

            self.neuron_groups
                .get_mut(ng_name)
                .expect("neuron group disappeared during finalize")
                .set_merged_in_syn(merged);
        }
    }

    /// Derive the per-neuron-group facts the generator consumes.
    fn compute_neuron_group_facts(&mut self) {
        let ng_names: Vec<String> = self.neuron_groups.keys().cloned().collect();
        for ng_name in &ng_names {
            let ng = &self.neuron_groups[ng_name];

            let mut spike_time = false;
            let mut true_spike = false;
            let mut spike_event = false;
            for sg_name in ng.out_syn() {
                let sg = &self.synapse_groups[sg_name];
                let code = sg.wu_code_strings();
                true_spike |= sg.is_true_spike_required() || !sg.wu_code().learn_post_code.is_empty();
                spike_event |= sg.is_spike_event_required();
                spike_time |= code.contains("$(sT_pre)");
            }
            for sg_name in ng.in_syn() {
                let sg = &self.synapse_groups[sg_name];
                spike_time |= sg.wu_code_strings().contains("$(sT_post)");
            }

            let mut sim_rng = ng.scan_sim_rng();
            let mut init_rng = ng.scan_init_rng();
            for cs_name in ng.current_sources() {
                let cs = &self.current_sources[cs_name];
                sim_rng |= cs.is_sim_rng_required();
                init_rng |= cs.is_init_rng_required();
            }
            for (head, _) in ng.merged_in_syn() {
                init_rng |= self.synapse_groups[head].is_ps_init_rng_required();
            }

            self.neuron_groups
                .get_mut(ng_name)
                .expect("neuron group disappeared during finalize")
                .set_derived_facts(spike_time, true_spike, spike_event, sim_rng, init_rng);
        }
    }

    fn check_not_finalized(&self, operation: &'static str) -> Result<()> {
        if self.finalized {
            Err(ModelError::ModelFinalized { operation })
        } else {
            Ok(())
        }
    }

    fn neuron_group_internal_mut(&mut self, name: &str) -> &mut NeuronGroup {
        self.neuron_groups
            .get_mut(name)
            .expect("neuron group checked present above")
    }
}

fn check_kind(snippet: &Arc<Snippet>, expected: &'static str, check: impl Fn(&SnippetKind) -> bool) -> Result<()> {
    if check(snippet.kind()) {
        Ok(())
    } else {
        Err(ModelError::WrongSnippetKind {
            name: snippet.name().to_string(),
            expected,
            actual: snippet.kind().kind_str(),
        })
    }
}

fn check_param_count(snippet: &Arc<Snippet>, params: &[f64]) -> Result<()> {
    if params.len() == snippet.param_names().len() {
        Ok(())
    } else {
        Err(ModelError::ParamCountMismatch {
            snippet: snippet.name().to_string(),
            expected: snippet.param_names().len(),
            actual: params.len(),
        })
    }
}

fn check_var_init_count(group: &str, expected: usize, actual: usize) -> Result<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(ModelError::VarInitCountMismatch {
            group: group.to_string(),
            expected,
            actual,
        })
    }
}

fn check_matrix_type(group: &str, matrix_type: SynapseMatrixType) -> Result<()> {
    let reason = match (matrix_type.connectivity, matrix_type.weight) {
        (MatrixConnectivity::Procedural, MatrixWeight::Individual) => {
            Some("procedural connectivity cannot store individual weights")
        }
        (MatrixConnectivity::Bitmask, MatrixWeight::Individual) => {
            Some("bitmask connectivity cannot store individual weights")
        }
        (connectivity, MatrixWeight::Procedural) if !matches!(connectivity, MatrixConnectivity::Procedural) => {
            Some("procedural weights require procedural connectivity")
        }
        _ => None,
    };
    match reason {
        Some(reason) => Err(ModelError::IncompatibleMatrixType {
            group: group.to_string(),
            reason: reason.to_string(),
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snippet::{CurrentSourceCode, NeuronCode, PostsynapticCode, WeightUpdateCode};

    fn lif() -> Arc<Snippet> {
        Snippet::neuron(
            "LIF",
            NeuronCode {
                sim_code: "$(V) += (-$(V) + $(Isyn)) * $(ExpTC);".to_string(),
                threshold_condition_code: "$(V) >= $(Vthresh)".to_string(),
                reset_code: "$(V) = $(Vreset);".to_string(),
                ..Default::default()
            },
        )
        .param_names(["Vthresh", "Vreset", "TauM"])
        .derived_param("ExpTC", |pars, dt| (-dt / pars[2]).exp())
        .var("V", "scalar")
        .build()
    }

    fn static_pulse_pre() -> Arc<Snippet> {
        Snippet::weight_update(
            "StaticPulsePre",
            WeightUpdateCode {
                sim_code: "$(addToInSyn, $(g) * $(V_pre));".to_string(),
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

    fn dc() -> Arc<Snippet> {
        Snippet::current_source(
            "DC",
            CurrentSourceCode {
                injection_code: "$(injectCurrent, $(amp));".to_string(),
            },
        )
        .param_names(["amp"])
        .build()
    }

    fn two_pop_model() -> Model {
        let mut model = Model::new();
        model.set_name("test");
        model.set_dt(1.0);
        let neuron = lif();
        model
            .add_neuron_population("A", 16, &neuron, vec![-55.0, -60.0, 20.0], vec![VarInit::constant(-60.0)], 0)
            .unwrap();
        model
            .add_neuron_population("B", 8, &neuron, vec![-55.0, -60.0, 20.0], vec![VarInit::constant(-60.0)], 0)
            .unwrap();
        model
    }

    #[test]
    fn test_duplicate_neuron_group_rejected() {
        let mut model = two_pop_model();
        let err = model
            .add_neuron_population("A", 4, &lif(), vec![-55.0, -60.0, 20.0], vec![VarInit::constant(0.0)], 0)
            .unwrap_err();
        assert!(matches!(err, ModelError::DuplicateNeuronGroup(name) if name == "A"));
        // The rejected call left the model usable.
        assert_eq!(model.neuron_group("A").unwrap().num_neurons(), 16);
    }

    #[test]
    fn test_unknown_target_rejected() {
        let mut model = two_pop_model();
        let err = model
            .add_current_source("stim", &dc(), "nowhere", vec![0.7], vec![])
            .unwrap_err();
        assert!(matches!(err, ModelError::UnknownNeuronGroup(name) if name == "nowhere"));
    }

    #[test]
    fn test_delay_widening_and_queue_flag() {
        let mut model = two_pop_model();
        model
            .add_synapse_population(
                "S",
                SynapseMatrixType::DENSE_INDIVIDUAL,
                3,
                "A",
                "B",
                &static_pulse_pre(),
                vec![],
                vec![VarInit::constant(0.1)],
                vec![],
                vec![],
                &delta_curr(),
                vec![],
                vec![],
                SparseConnectivityInit::uninitialised(),
            )
            .unwrap();
        model.finalize().unwrap();

        let a = model.neuron_group("A").unwrap();
        assert_eq!(a.num_delay_slots(), 4);
        assert!(a.is_var_queue_required("V"));
        assert!(a.is_delay_required());

        let b = model.neuron_group("B").unwrap();
        assert_eq!(b.num_delay_slots(), 1);
        assert!(!b.is_var_queue_required("V"));
    }

    #[test]
    fn test_finalize_is_idempotent() {
        let mut model = two_pop_model();
        model.finalize().unwrap();
        model.finalize().unwrap();
        assert!(model.is_finalized());
        let err = model
            .add_current_source("stim", &dc(), "A", vec![0.7], vec![])
            .unwrap_err();
        assert!(matches!(err, ModelError::ModelFinalized { .. }));
    }

    #[test]
    fn test_derived_params_materialized() {
        let mut model = two_pop_model();
        model.finalize().unwrap();
        let a = model.neuron_group("A").unwrap();
        let expected = (-1.0f64 / 20.0).exp();
        assert!((a.derived_params()[0] - expected).abs() < 1e-12);
    }

    #[test]
    fn test_procedural_individual_rejected() {
        let mut model = two_pop_model();
        let err = model
            .add_synapse_population(
                "S",
                SynapseMatrixType {
                    connectivity: MatrixConnectivity::Procedural,
                    weight: MatrixWeight::Individual,
                },
                NO_DELAY,
                "A",
                "B",
                &static_pulse_pre(),
                vec![],
                vec![VarInit::constant(0.1)],
                vec![],
                vec![],
                &delta_curr(),
                vec![],
                vec![],
                SparseConnectivityInit::uninitialised(),
            )
            .unwrap_err();
        assert!(matches!(err, ModelError::IncompatibleMatrixType { .. }));
    }

    #[test]
    fn test_psm_merge() {
        let mut model = two_pop_model();
        model.set_merge_postsynaptic_models(true);
        let wum = static_pulse_pre();
        let psm = delta_curr();
        for name in ["S1", "S2"] {
            model
                .add_synapse_population(
                    name,
                    SynapseMatrixType::DENSE_INDIVIDUAL,
                    NO_DELAY,
                    "A",
                    "B",
                    &wum,
                    vec![],
                    vec![VarInit::constant(0.1)],
                    vec![],
                    vec![],
                    &psm,
                    vec![],
                    vec![],
                    SparseConnectivityInit::uninitialised(),
                )
                .unwrap();
        }
        model.finalize().unwrap();

        let b = model.neuron_group("B").unwrap();
        assert_eq!(b.merged_in_syn().len(), 1);
        let (head, members) = &b.merged_in_syn()[0];
        assert_eq!(head, "S1");
        assert_eq!(members, &["S1".to_string(), "S2".to_string()]);

        // Both members share storage and must accumulate atomically.
        assert!(model.synapse_group("S1").unwrap().is_ps_model_merged());
        assert!(model.synapse_group("S2").unwrap().is_ps_model_merged());
        assert_eq!(model.synapse_group("S2").unwrap().ps_model_target_name(), "S1");
    }

    #[test]
    fn test_current_source_rng_propagates_to_group() {
        let mut model = two_pop_model();
        let noise = Snippet::current_source(
            "GaussianNoise",
            CurrentSourceCode {
                injection_code: "$(injectCurrent, $(mean) + $(gennrand_normal) * $(sd));".to_string(),
            },
        )
        .param_names(["mean", "sd"])
        .build();
        model
            .add_current_source("noise", &noise, "A", vec![0.0, 0.1], vec![])
            .unwrap();
        model.finalize().unwrap();
        assert!(model.neuron_group("A").unwrap().is_sim_rng_required());
        assert!(!model.neuron_group("B").unwrap().is_sim_rng_required());
    }

    #[test]
    fn test_scalar_expr_precision() {
        let mut model = Model::new();
        assert_eq!(model.scalar_expr(0.0), "0.0f");
        assert_eq!(model.scalar_expr(0.7), "0.7f");
        model.set_precision(ScalarPrecision::Double);
        assert_eq!(model.scalar_expr(0.7), "0.7");
    }
}
