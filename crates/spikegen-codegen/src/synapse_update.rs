//! Generator for the synapse update artifact.
//!
//! The backend owns the kernels and the strategy dispatch; the handlers built
//! here turn each weight-update code role into concrete source once the
//! backend has bound `id_pre` / `id_post` / `id_syn` and the accumulation
//! function substitutions.

use spikegen_model::{MatrixConnectivity, Model, ModelError, SynapseGroup, VarImplementation};

use crate::backend::Backend;
use crate::code_stream::CodeStream;
use crate::error::{CodegenError, Result};
use crate::model_subst;
use crate::substitutions::Substitutions;
use crate::text::{check_unresolved, ensure_ftype};

/// Emit the synapse update implementation stream.
pub fn generate_synapse_update(os: &mut CodeStream, model: &Model, backend: &dyn Backend) -> Result<()> {
    if !model.is_finalized() {
        return Err(ModelError::NotFinalized.into());
    }

    os.line("#include \"definitionsInternal.h\"");
    os.blank();

    let dev_prefix = backend.var_prefix();

    // Spike-like-event threshold condition, written inline into the
    // backend's `if(...)`.
    let thresh_handler = |os: &mut CodeStream, model: &Model, sg: &SynapseGroup, subs: &Substitutions| -> Result<()> {
        let mut code = sg.wu_code().event_threshold_condition_code.clone();
        let pre_idx = subs.required("id_pre")?.to_string();
        apply_common_wu_substitutions(&mut code, sg)?;
        model_subst::pre_neuron_substitutions_in_synaptic_code(
            &mut code,
            model,
            sg,
            pre_read_offset(model, sg),
            &pre_idx,
            dev_prefix,
        )?;
        subs.apply(&mut code)?;
        let code = ensure_ftype(&code, model.precision());
        check_unresolved(&code, &format!("{} : eventThresholdConditionCode", sg.name()))?;
        os.raw(code);
        Ok(())
    };

    let sim_handler = |os: &mut CodeStream, model: &Model, sg: &SynapseGroup, subs: &Substitutions| -> Result<()> {
        gen_wu_code(os, model, sg, subs, backend, &sg.wu_code().sim_code, "simCode")
    };

    let event_handler = |os: &mut CodeStream, model: &Model, sg: &SynapseGroup, subs: &Substitutions| -> Result<()> {
        gen_wu_code(os, model, sg, subs, backend, &sg.wu_code().event_code, "eventCode")
    };

    // Procedural connectivity: row-build state variables, then the build loop
    // with `addSynapse` bound (by the strategy) to the presynaptic update.
    let procedural_connect_handler =
        |os: &mut CodeStream, model: &Model, sg: &SynapseGroup, subs: &Substitutions| -> Result<()> {
            let connect = sg.connectivity_initialiser();
            let snippet = connect.snippet();

            let mut child = Substitutions::with_parent(subs);
            child.add_func_substitution("endRow", 0, "break");
            child.add_param_value_substitutions(
                snippet.param_names().iter().map(String::as_str),
                connect.params(),
            );
            child.add_param_value_substitutions(snippet.derived_param_names(), connect.derived_params());
            child.add_var_name_substitutions(
                snippet.extra_global_params().iter().map(|p| p.name.as_str()),
                "",
                sg.name(),
            );

            for state_var in connect.row_build_state_vars() {
                let mut value = state_var.value.clone();
                crate::text::value_substitutions(
                    &mut value,
                    snippet.param_names().iter().map(String::as_str),
                    connect.params(),
                    "",
                );
                crate::text::value_substitutions(&mut value, snippet.derived_param_names(), connect.derived_params(), "");
                os.line(format!("{} {} = {};", state_var.ty, state_var.name, value));
            }
            os.line("while(true)");
            os.scope(|os| {
                let mut code = connect.row_build_code().to_string();
                child.apply(&mut code)?;
                let code = ensure_ftype(&code, model.precision());
                check_unresolved(&code, &format!("{} : proceduralConnectivity", sg.name()))?;
                os.line(code);
                Ok(())
            })
        };

    // Procedural weight variables are re-derived into registers on demand;
    // the initialiser expands inline and is substituted into another code
    // section, so the unresolved check is deferred to it.
    let procedural_var_handler =
        |os: &mut CodeStream, model: &Model, sg: &SynapseGroup, subs: &Substitutions| -> Result<()> {
            for (index, var) in sg.wu_snippet().vars().iter().enumerate() {
                let init = &sg.wu_var_initialisers()[index];
                if !matches!(sg.wu_var_implementation(index), VarImplementation::Procedural)
                    || init.code().is_empty()
                {
                    continue;
                }
                os.line(format!("{} l{};", var.ty, var.name));
                os.scope(|os| {
                    let mut var_subs = Substitutions::with_parent(subs);
                    var_subs.add_var_substitution("value", format!("l{}", var.name));
                    var_subs.add_param_value_substitutions(
                        init.snippet().param_names().iter().map(String::as_str),
                        init.params(),
                    );
                    var_subs
                        .add_param_value_substitutions(init.snippet().derived_param_names(), init.derived_params());

                    let mut code = init.code().to_string();
                    var_subs.apply(&mut code)?;
                    os.line(ensure_ftype(&code, model.precision()));
                    Ok::<(), CodegenError>(())
                })?;
            }
            Ok(())
        };

    let post_learn_handler = |os: &mut CodeStream, model: &Model, sg: &SynapseGroup, subs: &Substitutions| -> Result<()> {
        gen_wu_code(os, model, sg, subs, backend, &sg.wu_code().learn_post_code, "learnPostCode")
    };

    let dynamics_handler = |os: &mut CodeStream, model: &Model, sg: &SynapseGroup, subs: &Substitutions| -> Result<()> {
        gen_wu_code(
            os,
            model,
            sg,
            subs,
            backend,
            &sg.wu_code().synapse_dynamics_code,
            "synapseDynamics",
        )
    };

    backend.gen_synapse_update(
        os,
        model,
        &thresh_handler,
        &sim_handler,
        &event_handler,
        &procedural_connect_handler,
        &procedural_var_handler,
        &post_learn_handler,
        &dynamics_handler,
    )
}

/// Offset expression prefix for delayed presynaptic reads; the backend
/// declares `preReadDelayOffset` whenever the source group is delayed.
fn pre_read_offset<'a>(model: &Model, sg: &SynapseGroup) -> &'a str {
    if model.src_neuron_group(sg).is_delay_required() {
        "preReadDelayOffset + "
    } else {
        ""
    }
}

fn post_read_offset<'a>(model: &Model, sg: &SynapseGroup) -> &'a str {
    if model.trg_neuron_group(sg).is_delay_required() {
        "postReadDelayOffset + "
    } else {
        ""
    }
}

/// Weight-update parameter, derived-parameter and extra-global-parameter
/// substitutions common to every code role.
fn apply_common_wu_substitutions(code: &mut String, sg: &SynapseGroup) -> Result<()> {
    let snippet = sg.wu_snippet();
    crate::text::value_substitutions(
        code,
        snippet.param_names().iter().map(String::as_str),
        sg.wu_params(),
        "",
    );
    crate::text::value_substitutions(code, snippet.derived_param_names(), sg.wu_derived_params(), "");
    crate::text::name_substitutions(
        code,
        "",
        snippet.extra_global_params().iter().map(|p| p.name.as_str()),
        sg.name(),
        "",
    );
    Ok(())
}

/// Transform one weight-update code role into concrete source and write it.
fn gen_wu_code(
    os: &mut CodeStream,
    model: &Model,
    sg: &SynapseGroup,
    subs: &Substitutions,
    backend: &dyn Backend,
    code: &str,
    role: &str,
) -> Result<()> {
    let dev_prefix = backend.var_prefix();
    let mut code = code.to_string();

    let id_syn = subs.required("id_syn")?.to_string();
    let pre_idx = subs.required("id_pre")?.to_string();
    let post_idx = subs.required("id_post")?.to_string();

    model_subst::apply_weight_update_model_substitutions(
        &mut code, model, sg, dev_prefix, &id_syn, &pre_idx, &post_idx,
    )?;
    model_subst::pre_neuron_substitutions_in_synaptic_code(
        &mut code,
        model,
        sg,
        pre_read_offset(model, sg),
        &pre_idx,
        dev_prefix,
    )?;
    model_subst::post_neuron_substitutions_in_synaptic_code(
        &mut code,
        model,
        sg,
        post_read_offset(model, sg),
        &post_idx,
        dev_prefix,
    )?;
    subs.apply(&mut code)?;
    let code = ensure_ftype(&code, model.precision());
    // Procedural sim code still carries the `$(0)` of its enclosing
    // `addSynapse` call; the row-build pass runs the barrier after expanding
    // it.
    if !matches!(sg.matrix_type().connectivity, MatrixConnectivity::Procedural) {
        check_unresolved(&code, &format!("{} : {}", sg.name(), role))?;
    }
    os.line(code);
    Ok(())
}

/// Does any synapse group define postsynaptic learning code?
pub fn model_has_post_learning(model: &Model) -> bool {
    model.synapse_groups().any(|sg| !sg.wu_code().learn_post_code.is_empty())
}

/// Does any synapse group define synapse dynamics code?
pub fn model_has_synapse_dynamics(model: &Model) -> bool {
    model
        .synapse_groups()
        .any(|sg| !sg.wu_code().synapse_dynamics_code.is_empty())
}
