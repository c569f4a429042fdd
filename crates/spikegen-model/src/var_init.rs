//! Variable and connectivity initialisers: a snippet paired with parameter
//! values, with derived parameters materialized at finalize.

use std::sync::Arc;

use crate::error::{ModelError, Result};
use crate::init_snippets;
use crate::snippet::{Snippet, SnippetKind, SparseConnectivityCode};
use crate::utils;

/// Initialiser for one variable of a group.
#[derive(Debug, Clone)]
pub struct VarInit {
    snippet: Arc<Snippet>,
    params: Vec<f64>,
    derived_params: Vec<f64>,
}

impl VarInit {
    /// Initialise using an arbitrary variable-init snippet.
    pub fn new(snippet: Arc<Snippet>, params: Vec<f64>) -> Result<Self> {
        if !matches!(snippet.kind(), SnippetKind::VarInit(_)) {
            return Err(ModelError::WrongSnippetKind {
                name: snippet.name().to_string(),
                expected: "variable init",
                actual: snippet.kind().kind_str(),
            });
        }
        if params.len() != snippet.param_names().len() {
            return Err(ModelError::ParamCountMismatch {
                snippet: snippet.name().to_string(),
                expected: snippet.param_names().len(),
                actual: params.len(),
            });
        }
        Ok(Self {
            snippet,
            params,
            derived_params: Vec::new(),
        })
    }

    /// Initialise to a constant value.
    pub fn constant(value: f64) -> Self {
        Self {
            snippet: init_snippets::constant(),
            params: vec![value],
            derived_params: Vec::new(),
        }
    }

    /// Mark the variable as uninitialised: no automatic initialisation code is
    /// generated and the variable is copied host-to-device verbatim during
    /// `initializeSparse`.
    pub fn uninitialised() -> Self {
        Self {
            snippet: init_snippets::uninitialised(),
            params: Vec::new(),
            derived_params: Vec::new(),
        }
    }

    pub fn snippet(&self) -> &Arc<Snippet> {
        &self.snippet
    }

    /// The initialisation code, empty for uninitialised variables.
    pub fn code(&self) -> &str {
        self.snippet.var_init_code().unwrap_or("")
    }

    pub fn params(&self) -> &[f64] {
        &self.params
    }

    pub fn derived_params(&self) -> &[f64] {
        &self.derived_params
    }

    pub fn is_rng_required(&self) -> bool {
        utils::is_rng_required(self.code())
    }

    /// A constant initialiser exposes its value; global-implemented variables
    /// are substituted with it directly.
    pub fn constant_value(&self) -> Option<f64> {
        if self.snippet.name() == "Constant" {
            self.params.first().copied()
        } else {
            None
        }
    }

    pub(crate) fn materialize_derived_params(&mut self, dt: f64) {
        self.derived_params = self
            .snippet
            .derived_params()
            .iter()
            .map(|d| (d.func)(&self.params, dt))
            .collect();
    }
}

/// Initialiser for a synapse group's sparse connectivity.
#[derive(Debug, Clone)]
pub struct SparseConnectivityInit {
    snippet: Arc<Snippet>,
    params: Vec<f64>,
    derived_params: Vec<f64>,
}

impl SparseConnectivityInit {
    pub fn new(snippet: Arc<Snippet>, params: Vec<f64>) -> Result<Self> {
        if !matches!(snippet.kind(), SnippetKind::SparseConnectivity(_)) {
            return Err(ModelError::WrongSnippetKind {
                name: snippet.name().to_string(),
                expected: "sparse connectivity",
                actual: snippet.kind().kind_str(),
            });
        }
        if params.len() != snippet.param_names().len() {
            return Err(ModelError::ParamCountMismatch {
                snippet: snippet.name().to_string(),
                expected: snippet.param_names().len(),
                actual: params.len(),
            });
        }
        Ok(Self {
            snippet,
            params,
            derived_params: Vec::new(),
        })
    }

    /// Connectivity is copied from the host during `initializeSparse` instead
    /// of being generated.
    pub fn uninitialised() -> Self {
        Self {
            snippet: init_snippets::uninitialised_connectivity(),
            params: Vec::new(),
            derived_params: Vec::new(),
        }
    }

    pub fn snippet(&self) -> &Arc<Snippet> {
        &self.snippet
    }

    fn code(&self) -> &SparseConnectivityCode {
        // Kind is checked at construction.
        match self.snippet.kind() {
            SnippetKind::SparseConnectivity(code) => code,
            _ => unreachable!("connectivity initialiser holds a non-connectivity snippet"),
        }
    }

    pub fn row_build_code(&self) -> &str {
        &self.code().row_build_code
    }

    pub fn row_build_state_vars(&self) -> &[crate::snippet::RowBuildStateVar] {
        &self.code().row_build_state_vars
    }

    pub fn params(&self) -> &[f64] {
        &self.params
    }

    pub fn derived_params(&self) -> &[f64] {
        &self.derived_params
    }

    pub fn is_rng_required(&self) -> bool {
        utils::is_rng_required(self.row_build_code())
    }

    /// Maximum row length, if the snippet can compute one.
    pub fn max_row_length(&self, num_pre: u32, num_post: u32) -> Option<u32> {
        self.code()
            .calc_max_row_length
            .map(|f| f(num_pre, num_post, &self.params))
    }

    pub(crate) fn materialize_derived_params(&mut self, dt: f64) {
        self.derived_params = self
            .snippet
            .derived_params()
            .iter()
            .map(|d| (d.func)(&self.params, dt))
            .collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_init() {
        let init = VarInit::constant(-60.0);
        assert_eq!(init.code(), "$(value) = $(constant);");
        assert_eq!(init.constant_value(), Some(-60.0));
        assert!(!init.is_rng_required());
    }

    #[test]
    fn test_uninitialised_has_no_code() {
        let init = VarInit::uninitialised();
        assert!(init.code().is_empty());
        assert_eq!(init.constant_value(), None);
    }

    #[test]
    fn test_uniform_init_requires_rng() {
        let init = VarInit::new(init_snippets::uniform(), vec![0.0, 1.0]).unwrap();
        assert!(init.is_rng_required());
    }

    #[test]
    fn test_param_count_checked() {
        let err = VarInit::new(init_snippets::uniform(), vec![0.0]).unwrap_err();
        assert!(matches!(err, ModelError::ParamCountMismatch { expected: 2, actual: 1, .. }));
    }

    #[test]
    fn test_wrong_kind_rejected() {
        let neuron = Snippet::neuron("Empty", Default::default()).build();
        let err = VarInit::new(neuron, vec![]).unwrap_err();
        assert!(matches!(err, ModelError::WrongSnippetKind { .. }));
    }
}
