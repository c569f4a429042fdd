//! Snippets: immutable bundles describing one user-visible model fragment.
//!
//! A snippet carries named parameters, derived parameters (closed-form
//! functions of the parameters and the timestep), extra global parameters,
//! variables and code strings written in the `$(...)` placeholder DSL. The code
//! strings live in a tagged union of snippet kinds, so a neuron snippet and a
//! weight-update snippet share the common tables but expose different roles.

use std::sync::Arc;

use crate::types::VarAccess;

/// Closed-form function deriving a parameter from the raw parameters and the
/// model timestep. Materialized once at finalize.
pub type DerivedParamFn = fn(&[f64], f64) -> f64;

/// Function computing the maximum row length of a sparse connectivity
/// initialiser from `(num_pre, num_post, params)`.
pub type CalcMaxLengthFn = fn(u32, u32, &[f64]) -> u32;

/// A named derived parameter.
#[derive(Debug, Clone, Copy)]
pub struct DerivedParam {
    pub name: &'static str,
    pub func: DerivedParamFn,
}

/// A state variable declared by a snippet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Var {
    pub name: String,
    pub ty: String,
    pub access: VarAccess,
}

impl Var {
    pub fn new(name: &str, ty: &str, access: VarAccess) -> Self {
        Self {
            name: name.to_string(),
            ty: ty.to_string(),
            access,
        }
    }
}

/// A runtime-bound scalar or array parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtraGlobalParam {
    pub name: String,
    pub ty: String,
}

impl ExtraGlobalParam {
    /// Pointer-typed parameters are arrays and matter for memory placement.
    pub fn is_pointer(&self) -> bool {
        self.ty.ends_with('*')
    }
}

/// An additional per-neuron input accumulator a neuron snippet declares
/// alongside `Isyn` (name, type, reset value each timestep).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdditionalInputVar {
    pub name: String,
    pub ty: String,
    pub init_value: String,
}

/// A state variable of the sparse row-building loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowBuildStateVar {
    pub name: String,
    pub ty: String,
    pub value: String,
}

/// Code roles of a neuron snippet.
#[derive(Debug, Clone)]
pub struct NeuronCode {
    pub sim_code: String,
    pub threshold_condition_code: String,
    pub reset_code: String,
    pub additional_input_vars: Vec<AdditionalInputVar>,
    /// Memoize the threshold result from before the sim code ran and only
    /// spike on a rising edge.
    pub auto_refractory: bool,
}

impl Default for NeuronCode {
    fn default() -> Self {
        Self {
            sim_code: String::new(),
            threshold_condition_code: String::new(),
            reset_code: String::new(),
            additional_input_vars: Vec::new(),
            auto_refractory: true,
        }
    }
}

/// Code roles of a postsynaptic snippet.
#[derive(Debug, Clone, Default)]
pub struct PostsynapticCode {
    pub apply_input_code: String,
    pub decay_code: String,
}

/// Code roles of a weight-update snippet, plus its per-source and per-target
/// variables (the `vars` table of the snippet holds the per-synapse state).
#[derive(Debug, Clone, Default)]
pub struct WeightUpdateCode {
    pub sim_code: String,
    pub event_code: String,
    pub event_threshold_condition_code: String,
    pub learn_post_code: String,
    pub synapse_dynamics_code: String,
    pub pre_vars: Vec<Var>,
    pub post_vars: Vec<Var>,
}

/// Code role of a current source snippet.
#[derive(Debug, Clone, Default)]
pub struct CurrentSourceCode {
    pub injection_code: String,
}

/// Code role of a variable initialisation snippet.
#[derive(Debug, Clone, Default)]
pub struct VarInitCode {
    pub code: String,
}

/// Code roles of a sparse connectivity initialisation snippet.
#[derive(Debug, Clone, Default)]
pub struct SparseConnectivityCode {
    pub row_build_code: String,
    pub row_build_state_vars: Vec<RowBuildStateVar>,
    pub calc_max_row_length: Option<CalcMaxLengthFn>,
}

/// The tagged union of snippet kinds.
#[derive(Debug, Clone)]
pub enum SnippetKind {
    Neuron(NeuronCode),
    Postsynaptic(PostsynapticCode),
    WeightUpdate(WeightUpdateCode),
    CurrentSource(CurrentSourceCode),
    VarInit(VarInitCode),
    SparseConnectivity(SparseConnectivityCode),
}

impl SnippetKind {
    pub const fn kind_str(&self) -> &'static str {
        match self {
            SnippetKind::Neuron(_) => "neuron",
            SnippetKind::Postsynaptic(_) => "postsynaptic",
            SnippetKind::WeightUpdate(_) => "weight update",
            SnippetKind::CurrentSource(_) => "current source",
            SnippetKind::VarInit(_) => "variable init",
            SnippetKind::SparseConnectivity(_) => "sparse connectivity",
        }
    }
}

/// An immutable model fragment. Build one with [`Snippet::neuron`] and
/// friends, then share it between groups through the returned [`Arc`].
#[derive(Debug, Clone)]
pub struct Snippet {
    name: String,
    param_names: Vec<String>,
    derived_params: Vec<DerivedParam>,
    extra_global_params: Vec<ExtraGlobalParam>,
    vars: Vec<Var>,
    kind: SnippetKind,
}

impl Snippet {
    pub fn neuron(name: &str, code: NeuronCode) -> SnippetBuilder {
        SnippetBuilder::new(name, SnippetKind::Neuron(code))
    }

    pub fn postsynaptic(name: &str, code: PostsynapticCode) -> SnippetBuilder {
        SnippetBuilder::new(name, SnippetKind::Postsynaptic(code))
    }

    pub fn weight_update(name: &str, code: WeightUpdateCode) -> SnippetBuilder {
        SnippetBuilder::new(name, SnippetKind::WeightUpdate(code))
    }

    pub fn current_source(name: &str, code: CurrentSourceCode) -> SnippetBuilder {
        SnippetBuilder::new(name, SnippetKind::CurrentSource(code))
    }

    pub fn var_init(name: &str, code: &str) -> SnippetBuilder {
        SnippetBuilder::new(
            name,
            SnippetKind::VarInit(VarInitCode { code: code.to_string() }),
        )
    }

    pub fn sparse_connectivity(name: &str, code: SparseConnectivityCode) -> SnippetBuilder {
        SnippetBuilder::new(name, SnippetKind::SparseConnectivity(code))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn param_names(&self) -> &[String] {
        &self.param_names
    }

    pub fn derived_params(&self) -> &[DerivedParam] {
        &self.derived_params
    }

    pub fn derived_param_names(&self) -> Vec<&str> {
        self.derived_params.iter().map(|d| d.name).collect()
    }

    pub fn extra_global_params(&self) -> &[ExtraGlobalParam] {
        &self.extra_global_params
    }

    pub fn vars(&self) -> &[Var] {
        &self.vars
    }

    pub fn var_index(&self, name: &str) -> Option<usize> {
        self.vars.iter().position(|v| v.name == name)
    }

    pub fn kind(&self) -> &SnippetKind {
        &self.kind
    }

    pub fn neuron_code(&self) -> Option<&NeuronCode> {
        match &self.kind {
            SnippetKind::Neuron(code) => Some(code),
            _ => None,
        }
    }

    pub fn postsynaptic_code(&self) -> Option<&PostsynapticCode> {
        match &self.kind {
            SnippetKind::Postsynaptic(code) => Some(code),
            _ => None,
        }
    }

    pub fn weight_update_code(&self) -> Option<&WeightUpdateCode> {
        match &self.kind {
            SnippetKind::WeightUpdate(code) => Some(code),
            _ => None,
        }
    }

    pub fn current_source_code(&self) -> Option<&CurrentSourceCode> {
        match &self.kind {
            SnippetKind::CurrentSource(code) => Some(code),
            _ => None,
        }
    }

    pub fn var_init_code(&self) -> Option<&str> {
        match &self.kind {
            SnippetKind::VarInit(code) => Some(&code.code),
            _ => None,
        }
    }

    pub fn sparse_connectivity_code(&self) -> Option<&SparseConnectivityCode> {
        match &self.kind {
            SnippetKind::SparseConnectivity(code) => Some(code),
            _ => None,
        }
    }

    /// Every code string this snippet carries, labelled by role. Used by the
    /// RNG-requirement and queue-requirement scans.
    pub fn code_strings(&self) -> Vec<(&'static str, &str)> {
        match &self.kind {
            SnippetKind::Neuron(c) => vec![
                ("sim", c.sim_code.as_str()),
                ("thresholdCondition", c.threshold_condition_code.as_str()),
                ("reset", c.reset_code.as_str()),
            ],
            SnippetKind::Postsynaptic(c) => vec![
                ("applyInput", c.apply_input_code.as_str()),
                ("decay", c.decay_code.as_str()),
            ],
            SnippetKind::WeightUpdate(c) => vec![
                ("sim", c.sim_code.as_str()),
                ("event", c.event_code.as_str()),
                ("eventThresholdCondition", c.event_threshold_condition_code.as_str()),
                ("learnPost", c.learn_post_code.as_str()),
                ("synapseDynamics", c.synapse_dynamics_code.as_str()),
            ],
            SnippetKind::CurrentSource(c) => vec![("injection", c.injection_code.as_str())],
            SnippetKind::VarInit(c) => vec![("init", c.code.as_str())],
            SnippetKind::SparseConnectivity(c) => vec![("rowBuild", c.row_build_code.as_str())],
        }
    }
}

/// Builder for [`Snippet`] tables.
pub struct SnippetBuilder {
    snippet: Snippet,
}

impl SnippetBuilder {
    fn new(name: &str, kind: SnippetKind) -> Self {
        Self {
            snippet: Snippet {
                name: name.to_string(),
                param_names: Vec::new(),
                derived_params: Vec::new(),
                extra_global_params: Vec::new(),
                vars: Vec::new(),
                kind,
            },
        }
    }

    pub fn param_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.snippet.param_names = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn derived_param(mut self, name: &'static str, func: DerivedParamFn) -> Self {
        self.snippet.derived_params.push(DerivedParam { name, func });
        self
    }

    pub fn extra_global_param(mut self, name: &str, ty: &str) -> Self {
        self.snippet.extra_global_params.push(ExtraGlobalParam {
            name: name.to_string(),
            ty: ty.to_string(),
        });
        self
    }

    pub fn var(mut self, name: &str, ty: &str) -> Self {
        self.snippet.vars.push(Var::new(name, ty, VarAccess::ReadWrite));
        self
    }

    pub fn read_only_var(mut self, name: &str, ty: &str) -> Self {
        self.snippet.vars.push(Var::new(name, ty, VarAccess::ReadOnly));
        self
    }

    pub fn build(self) -> Arc<Snippet> {
        Arc::new(self.snippet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lif() -> Arc<Snippet> {
        Snippet::neuron(
            "LIF",
            NeuronCode {
                sim_code: "$(V) += (-$(V) + $(Isyn)) * ($(ExpTC));".to_string(),
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

    #[test]
    fn test_snippet_tables() {
        let snippet = lif();
        assert_eq!(snippet.name(), "LIF");
        assert_eq!(snippet.param_names(), ["Vthresh", "Vreset", "TauM"]);
        assert_eq!(snippet.derived_param_names(), ["ExpTC"]);
        assert_eq!(snippet.vars().len(), 1);
        assert_eq!(snippet.var_index("V"), Some(0));
        assert_eq!(snippet.var_index("U"), None);
    }

    #[test]
    fn test_derived_param_evaluates() {
        let snippet = lif();
        let exp_tc = (snippet.derived_params()[0].func)(&[-55.0, -60.0, 20.0], 1.0);
        assert!((exp_tc - (-1.0f64 / 20.0).exp()).abs() < 1e-12);
    }

    #[test]
    fn test_kind_accessors() {
        let snippet = lif();
        assert!(snippet.neuron_code().is_some());
        assert!(snippet.weight_update_code().is_none());
        assert_eq!(snippet.kind().kind_str(), "neuron");
    }

    #[test]
    fn test_extra_global_param_pointer() {
        let egp = ExtraGlobalParam {
            name: "rates".to_string(),
            ty: "scalar*".to_string(),
        };
        assert!(egp.is_pointer());
        let scalar = ExtraGlobalParam {
            name: "offset".to_string(),
            ty: "scalar".to_string(),
        };
        assert!(!scalar.is_pointer());
    }

    #[test]
    fn test_code_strings_roles() {
        let snippet = lif();
        let roles: Vec<&str> = snippet.code_strings().iter().map(|(role, _)| *role).collect();
        assert_eq!(roles, ["sim", "thresholdCondition", "reset"]);
    }
}
