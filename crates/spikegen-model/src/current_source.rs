//! An external current injection applied to a neuron group each timestep.

use std::sync::Arc;

use crate::error::{ModelError, Result};
use crate::snippet::{CurrentSourceCode, Snippet};
use crate::types::{VarImplementation, VarLocation};
use crate::utils;
use crate::var_init::VarInit;

/// A current source. Owned by the [`crate::Model`]; refers to its target
/// neuron group by name.
#[derive(Debug)]
pub struct CurrentSource {
    name: String,
    snippet: Arc<Snippet>,
    params: Vec<f64>,
    derived_params: Vec<f64>,
    var_initialisers: Vec<VarInit>,
    var_location: Vec<VarLocation>,
    var_implementation: Vec<VarImplementation>,
    egp_location: Vec<VarLocation>,
    target: String,
}

impl CurrentSource {
    pub(crate) fn new(
        name: &str,
        snippet: Arc<Snippet>,
        params: Vec<f64>,
        var_initialisers: Vec<VarInit>,
        target: &str,
        default_var_location: VarLocation,
        default_egp_location: VarLocation,
    ) -> Self {
        let num_vars = snippet.vars().len();
        let num_egps = snippet.extra_global_params().len();
        Self {
            name: name.to_string(),
            snippet,
            params,
            derived_params: Vec::new(),
            var_initialisers,
            var_location: vec![default_var_location; num_vars],
            var_implementation: vec![VarImplementation::Individual; num_vars],
            egp_location: vec![default_egp_location; num_egps],
            target: target.to_string(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn snippet(&self) -> &Arc<Snippet> {
        &self.snippet
    }

    pub fn source_code(&self) -> &CurrentSourceCode {
        self.snippet
            .current_source_code()
            .expect("current source holds a non-current-source snippet")
    }

    pub fn params(&self) -> &[f64] {
        &self.params
    }

    pub fn derived_params(&self) -> &[f64] {
        &self.derived_params
    }

    pub fn var_initialisers(&self) -> &[VarInit] {
        &self.var_initialisers
    }

    pub fn target_name(&self) -> &str {
        &self.target
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

    pub fn set_var_location(&mut self, var: &str, location: VarLocation) -> Result<()> {
        let index = self.var_index(var)?;
        self.var_location[index] = location;
        Ok(())
    }

    pub fn set_var_implementation(&mut self, var: &str, implementation: VarImplementation) -> Result<()> {
        let index = self.var_index(var)?;
        self.var_implementation[index] = implementation;
        Ok(())
    }

    /// Does injecting this source need a per-neuron RNG?
    pub fn is_sim_rng_required(&self) -> bool {
        utils::is_rng_required(&self.source_code().injection_code)
    }

    /// Does initialising this source's state need an RNG?
    pub fn is_init_rng_required(&self) -> bool {
        self.var_initialisers.iter().any(|init| init.is_rng_required())
    }

    fn var_index(&self, var: &str) -> Result<usize> {
        self.snippet.var_index(var).ok_or_else(|| ModelError::UnknownVariable {
            group: self.name.clone(),
            var: var.to_string(),
        })
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
}

#[cfg(test)]
mod tests {
    use super::*;

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

    fn gaussian_noise() -> Arc<Snippet> {
        Snippet::current_source(
            "GaussianNoise",
            CurrentSourceCode {
                injection_code: "$(injectCurrent, $(mean) + $(gennrand_normal) * $(sd));".to_string(),
            },
        )
        .param_names(["mean", "sd"])
        .build()
    }

    #[test]
    fn test_dc_source_needs_no_rng() {
        let cs = CurrentSource::new(
            "stim",
            dc(),
            vec![0.7],
            vec![],
            "pop",
            VarLocation::HOST_DEVICE,
            VarLocation::HOST_DEVICE,
        );
        assert!(!cs.is_sim_rng_required());
        assert_eq!(cs.target_name(), "pop");
    }

    #[test]
    fn test_noise_source_needs_rng() {
        let cs = CurrentSource::new(
            "noise",
            gaussian_noise(),
            vec![0.0, 0.1],
            vec![],
            "pop",
            VarLocation::HOST_DEVICE,
            VarLocation::HOST_DEVICE,
        );
        assert!(cs.is_sim_rng_required());
    }
}
