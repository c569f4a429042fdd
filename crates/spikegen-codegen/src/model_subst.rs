//! Substitution passes that insert group-level names and values (variables,
//! parameters, derived parameters, extra global parameters) into snippet
//! code, honoring each variable's implementation and indexing discipline.

use spikegen_model::{CurrentSource, Model, ModelError, NeuronGroup, SynapseGroup, VarImplementation, VarInit, NO_DELAY};

use crate::error::Result;
use crate::text::{name_substitutions, substitute, value_substitutions};

/// The literal for a globally-implemented variable: its constant initialiser
/// value in the model precision.
fn global_var_value(model: &Model, group: &str, var: &str, init: &VarInit) -> Result<String> {
    let value = init.constant_value().ok_or_else(|| ModelError::NonConstantGlobalVar {
        group: group.to_string(),
        var: var.to_string(),
    })?;
    Ok(model.scalar_expr(value))
}

/// Insert a neuron group's variables, parameters and extra global parameters.
/// Individually implemented variables resolve to `local_prefix`-prefixed
/// registers; global ones to their constant value.
pub fn apply_neuron_model_substitutions(
    code: &mut String,
    model: &Model,
    ng: &NeuronGroup,
    local_prefix: &str,
    ext: &str,
) -> Result<()> {
    let snippet = ng.snippet();
    for (index, var) in snippet.vars().iter().enumerate() {
        let replacement = match ng.var_implementation(index) {
            VarImplementation::Individual => format!("{}{}", local_prefix, var.name),
            _ => global_var_value(model, ng.name(), &var.name, &ng.var_initialisers()[index])?,
        };
        substitute(code, &format!("$({}{})", var.name, ext), &replacement);
    }

    value_substitutions(
        code,
        snippet.param_names().iter().map(String::as_str),
        ng.params(),
        ext,
    );
    value_substitutions(code, snippet.derived_param_names(), ng.derived_params(), ext);
    name_substitutions(
        code,
        "",
        snippet.extra_global_params().iter().map(|p| p.name.as_str()),
        ng.name(),
        ext,
    );
    Ok(())
}

/// Insert a synapse group's postsynaptic model variables and parameters.
/// Individual variables resolve to `local_prefix + name + target` registers.
pub fn apply_postsynaptic_model_substitutions(
    code: &mut String,
    model: &Model,
    sg: &SynapseGroup,
    local_prefix: &str,
) -> Result<()> {
    let snippet = sg.ps_snippet();
    let target = sg.ps_model_target_name();
    for (index, var) in snippet.vars().iter().enumerate() {
        let replacement = match sg.ps_var_implementation(index) {
            VarImplementation::Individual => format!("{}{}{}", local_prefix, var.name, target),
            _ => global_var_value(model, sg.name(), &var.name, &sg.ps_var_initialisers()[index])?,
        };
        substitute(code, &format!("$({})", var.name), &replacement);
    }

    value_substitutions(
        code,
        snippet.param_names().iter().map(String::as_str),
        sg.ps_params(),
        "",
    );
    value_substitutions(code, snippet.derived_param_names(), sg.ps_derived_params(), "");
    name_substitutions(
        code,
        "",
        snippet.extra_global_params().iter().map(|p| p.name.as_str()),
        sg.name(),
        "",
    );
    Ok(())
}

/// Insert a current source's variables and parameters.
pub fn apply_current_source_substitutions(
    code: &mut String,
    model: &Model,
    cs: &CurrentSource,
    local_prefix: &str,
) -> Result<()> {
    let snippet = cs.snippet();
    for (index, var) in snippet.vars().iter().enumerate() {
        let replacement = match cs.var_implementation(index) {
            VarImplementation::Individual => format!("{}{}", local_prefix, var.name),
            _ => global_var_value(model, cs.name(), &var.name, &cs.var_initialisers()[index])?,
        };
        substitute(code, &format!("$({})", var.name), &replacement);
    }

    value_substitutions(
        code,
        snippet.param_names().iter().map(String::as_str),
        cs.params(),
        "",
    );
    value_substitutions(code, snippet.derived_param_names(), cs.derived_params(), "");
    name_substitutions(
        code,
        "",
        snippet.extra_global_params().iter().map(|p| p.name.as_str()),
        cs.name(),
        "",
    );
    Ok(())
}

/// Insert a synapse group's weight-update variables and parameters into
/// synaptic code. Per-synapse variables are indexed by `id_syn_expr`
/// (individual), substituted by value (global) or resolved to local
/// registers (procedural); per-source and per-target variables are indexed
/// by the pre/post expressions with their delay offsets.
#[allow(clippy::too_many_arguments)]
pub fn apply_weight_update_model_substitutions(
    code: &mut String,
    model: &Model,
    sg: &SynapseGroup,
    dev_prefix: &str,
    id_syn_expr: &str,
    pre_idx: &str,
    post_idx: &str,
) -> Result<()> {
    let snippet = sg.wu_snippet();
    for (index, var) in snippet.vars().iter().enumerate() {
        let replacement = match sg.wu_var_implementation(index) {
            VarImplementation::Individual => {
                format!("{}{}{}[{}]", dev_prefix, var.name, sg.name(), id_syn_expr)
            }
            VarImplementation::Global => {
                global_var_value(model, sg.name(), &var.name, &sg.wu_var_initialisers()[index])?
            }
            VarImplementation::Procedural => format!("l{}", var.name),
        };
        substitute(code, &format!("$({})", var.name), &replacement);
    }

    let wu_code = sg.wu_code();
    let pre_offset = if sg.delay_steps() != NO_DELAY {
        "preReadDelayOffset + "
    } else {
        ""
    };
    for var in &wu_code.pre_vars {
        substitute(
            code,
            &format!("$({})", var.name),
            &format!("{}{}{}[{}{}]", dev_prefix, var.name, sg.name(), pre_offset, pre_idx),
        );
    }
    let post_offset = if sg.back_prop_delay_steps() != NO_DELAY {
        "postReadDelayOffset + "
    } else {
        ""
    };
    for var in &wu_code.post_vars {
        substitute(
            code,
            &format!("$({})", var.name),
            &format!("{}{}{}[{}{}]", dev_prefix, var.name, sg.name(), post_offset, post_idx),
        );
    }

    value_substitutions(
        code,
        snippet.param_names().iter().map(String::as_str),
        sg.wu_params(),
        "",
    );
    value_substitutions(code, snippet.derived_param_names(), sg.wu_derived_params(), "");
    name_substitutions(
        code,
        "",
        snippet.extra_global_params().iter().map(|p| p.name.as_str()),
        sg.name(),
        "",
    );
    Ok(())
}

/// Insert presynaptic neuron state into synaptic code: `$(X_pre)` resolves to
/// the source group's array, through the queue offset when the variable is
/// queued.
pub fn pre_neuron_substitutions_in_synaptic_code(
    code: &mut String,
    model: &Model,
    sg: &SynapseGroup,
    offset: &str,
    pre_idx: &str,
    dev_prefix: &str,
) -> Result<()> {
    let src = model.src_neuron_group(sg);
    substitute(
        code,
        "$(sT_pre)",
        &format!("{}sT{}[{}{}]", dev_prefix, src.name(), offset, pre_idx),
    );
    neuron_substitutions(code, model, src, offset, pre_idx, dev_prefix, "_pre")
}

/// Insert postsynaptic neuron state into synaptic code: `$(X_post)` resolves
/// to the target group's array, through the back-propagation queue offset
/// when the variable is queued.
pub fn post_neuron_substitutions_in_synaptic_code(
    code: &mut String,
    model: &Model,
    sg: &SynapseGroup,
    offset: &str,
    post_idx: &str,
    dev_prefix: &str,
) -> Result<()> {
    let trg = model.trg_neuron_group(sg);
    substitute(
        code,
        "$(sT_post)",
        &format!("{}sT{}[{}{}]", dev_prefix, trg.name(), offset, post_idx),
    );
    neuron_substitutions(code, model, trg, offset, post_idx, dev_prefix, "_post")
}

fn neuron_substitutions(
    code: &mut String,
    model: &Model,
    ng: &NeuronGroup,
    offset: &str,
    idx: &str,
    dev_prefix: &str,
    ext: &str,
) -> Result<()> {
    let snippet = ng.snippet();
    for (index, var) in snippet.vars().iter().enumerate() {
        let replacement = match ng.var_implementation(index) {
            VarImplementation::Individual => {
                if ng.is_var_queue_required_index(index) {
                    format!("{}{}{}[{}{}]", dev_prefix, var.name, ng.name(), offset, idx)
                } else {
                    format!("{}{}{}[{}]", dev_prefix, var.name, ng.name(), idx)
                }
            }
            _ => global_var_value(model, ng.name(), &var.name, &ng.var_initialisers()[index])?,
        };
        substitute(code, &format!("$({}{})", var.name, ext), &replacement);
    }

    value_substitutions(
        code,
        snippet.param_names().iter().map(String::as_str),
        ng.params(),
        ext,
    );
    value_substitutions(code, snippet.derived_param_names(), ng.derived_params(), ext);
    name_substitutions(
        code,
        "",
        snippet.extra_global_params().iter().map(|p| p.name.as_str()),
        ng.name(),
        ext,
    );
    Ok(())
}
