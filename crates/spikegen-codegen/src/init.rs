//! Generator for the initialization artifact.
//!
//! Spike buffers and counts are zeroed (one slot per delay slot where
//! delayed), spike times start at the `-TIME_MAX` sentinel, individually
//! implemented variables run their initialiser snippets, and sparse
//! connectivity is built by driving the row-build snippet in a
//! `while(true) { ...; if(endRow) break; }` loop.

use spikegen_model::{Model, ModelError, NeuronGroup, SynapseGroup, Var, VarImplementation, VarInit, VarLocation, NO_DELAY};

use crate::backend::Backend;
use crate::code_stream::CodeStream;
use crate::error::Result;
use crate::substitutions::Substitutions;
use crate::text::ensure_ftype;

/// Emit the initialization implementation stream.
pub fn generate_init(os: &mut CodeStream, model: &Model, backend: &dyn Backend) -> Result<()> {
    if !model.is_finalized() {
        return Err(ModelError::NotFinalized.into());
    }

    os.line("#include \"definitionsInternal.h\"");
    os.blank();

    let ng_handler = |os: &mut CodeStream, model: &Model, ng: &NeuronGroup, pop_subs: &Substitutions| -> Result<()> {
        gen_neuron_group_init(os, model, ng, pop_subs, backend)
    };

    // Dense synaptic matrix variable initialisation: loop rows, one thread
    // per column.
    let dense_var_handler =
        |os: &mut CodeStream, model: &Model, sg: &SynapseGroup, pop_subs: &Substitutions| -> Result<()> {
            os.line(format!("for(unsigned int i = 0; i < {}; i++)", sg.src_num_neurons()));
            os.scope(|os| {
                let mut row_subs = Substitutions::with_parent(pop_subs);
                row_subs.add_var_substitution("id_pre", "i");
                gen_init_wu_var_code(os, backend, model, &row_subs, sg)
            })
        };

    // Sparse connectivity initialisation: row-building state, then the build
    // loop on the generated code.
    let sparse_connect_handler =
        |os: &mut CodeStream, model: &Model, sg: &SynapseGroup, pop_subs: &Substitutions| -> Result<()> {
            let connect = sg.connectivity_initialiser();
            let snippet = connect.snippet();

            let mut subs = Substitutions::with_parent(pop_subs);
            subs.add_func_substitution("endRow", 0, "break");
            subs.add_param_value_substitutions(snippet.param_names().iter().map(String::as_str), connect.params());
            subs.add_param_value_substitutions(snippet.derived_param_names(), connect.derived_params());
            subs.add_var_name_substitutions(
                snippet.extra_global_params().iter().map(|p| p.name.as_str()),
                "",
                sg.name(),
            );

            os.line("// Build sparse connectivity");
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
                subs.apply_check_unresolved(&mut code, &format!("initSparseConnectivity : {}", sg.name()))?;
                os.line(ensure_ftype(&code, model.precision()));
                Ok(())
            })
        };

    let sparse_var_handler =
        |os: &mut CodeStream, model: &Model, sg: &SynapseGroup, pop_subs: &Substitutions| -> Result<()> {
            gen_init_wu_var_code(os, backend, model, pop_subs, sg)
        };

    backend.gen_init(
        os,
        model,
        &ng_handler,
        &dense_var_handler,
        &sparse_connect_handler,
        &sparse_var_handler,
    )
}

fn gen_neuron_group_init(
    os: &mut CodeStream,
    model: &Model,
    ng: &NeuronGroup,
    pop_subs: &Substitutions,
    backend: &dyn Backend,
) -> Result<()> {
    // Initialise spike counts and spikes.
    gen_init_spike_count(os, backend, pop_subs, ng, false)?;
    gen_init_spike_count(os, backend, pop_subs, ng, true)?;
    gen_init_spikes(os, backend, pop_subs, ng, false)?;
    gen_init_spikes(os, backend, pop_subs, ng, true)?;

    // Spike times start at the sentinel.
    if ng.is_spike_time_required() {
        backend.gen_variable_init(
            os,
            ng.spike_time_location(),
            ng.num_neurons(),
            "id",
            pop_subs,
            &|os, var_subs| {
                let id = var_subs.required("id")?;
                if ng.is_delay_required() {
                    os.line(format!("for (unsigned int d = 0; d < {}; d++)", ng.num_delay_slots()));
                    os.scope(|os| {
                        os.line(format!(
                            "{}sT{}[(d * {}) + {}] = -TIME_MAX;",
                            backend.var_prefix(),
                            ng.name(),
                            ng.num_neurons(),
                            id
                        ));
                        Ok(())
                    })
                } else {
                    os.line(format!("{}sT{}[{}] = -TIME_MAX;", backend.var_prefix(), ng.name(), id));
                    Ok(())
                }
            },
        )?;
    }

    // Neuron state variables.
    gen_init_neuron_var_code(
        os,
        backend,
        model,
        pop_subs,
        ng.snippet().vars(),
        ng.var_initialisers(),
        ng.num_neurons(),
        ng.num_delay_slots(),
        ng.name(),
        &|k| ng.var_location(k),
        &|k| ng.var_implementation(k),
        &|k| ng.is_var_queue_required_index(k),
    )?;

    // Merged incoming synapse groups own the inSyn buffer, the dendritic
    // delay ring and the postsynaptic model state.
    for (head, _) in ng.merged_in_syn() {
        let sg = model.synapse_group(head).expect("merged synapse group resolves");
        let target = sg.ps_model_target_name().to_string();

        backend.gen_variable_init(
            os,
            sg.in_syn_location(),
            ng.num_neurons(),
            "id",
            pop_subs,
            &|os, var_subs| {
                os.line(format!(
                    "{}inSyn{}[{}] = {};",
                    backend.var_prefix(),
                    target,
                    var_subs.required("id")?,
                    model.scalar_expr(0.0)
                ));
                Ok(())
            },
        )?;

        if sg.is_dendritic_delay_required() {
            backend.gen_variable_init(
                os,
                sg.dendritic_delay_location(),
                ng.num_neurons(),
                "id",
                pop_subs,
                &|os, var_subs| {
                    let id = var_subs.required("id")?;
                    os.line(format!(
                        "for (unsigned int d = 0; d < {}; d++)",
                        sg.max_dendritic_delay_timesteps()
                    ));
                    os.scope(|os| {
                        os.line(format!(
                            "{}denDelay{}[(d * {}) + {}] = {};",
                            backend.var_prefix(),
                            target,
                            sg.trg_num_neurons(),
                            id,
                            model.scalar_expr(0.0)
                        ));
                        Ok(())
                    })
                },
            )?;
        }

        gen_init_neuron_var_code(
            os,
            backend,
            model,
            pop_subs,
            sg.ps_snippet().vars(),
            sg.ps_var_initialisers(),
            ng.num_neurons(),
            0,
            &target,
            &|k| sg.ps_var_location(k),
            &|k| sg.ps_var_implementation(k),
            &|_| false,
        )?;
    }

    // Weight-update model state living on the postsynaptic side.
    for sg_name in ng.in_syn() {
        let sg = model.synapse_group(sg_name).expect("incoming synapse group resolves");
        gen_init_neuron_var_code(
            os,
            backend,
            model,
            pop_subs,
            &sg.wu_code().post_vars,
            sg.wu_post_var_initialisers(),
            ng.num_neurons(),
            ng.num_delay_slots(),
            sg.name(),
            &|k| sg.wu_post_var_location(k),
            &|_| VarImplementation::Individual,
            &|_| sg.back_prop_delay_steps() != NO_DELAY,
        )?;
    }

    // Weight-update model state living on the presynaptic side.
    for sg_name in ng.out_syn() {
        let sg = model.synapse_group(sg_name).expect("outgoing synapse group resolves");
        gen_init_neuron_var_code(
            os,
            backend,
            model,
            pop_subs,
            &sg.wu_code().pre_vars,
            sg.wu_pre_var_initialisers(),
            ng.num_neurons(),
            ng.num_delay_slots(),
            sg.name(),
            &|k| sg.wu_pre_var_location(k),
            &|_| VarImplementation::Individual,
            &|_| sg.delay_steps() != NO_DELAY,
        )?;
    }

    // Current source state.
    os.line("// current source variables");
    for cs_name in ng.current_sources() {
        let cs = model.current_source(cs_name).expect("current source resolves");
        gen_init_neuron_var_code(
            os,
            backend,
            model,
            pop_subs,
            cs.snippet().vars(),
            cs.var_initialisers(),
            ng.num_neurons(),
            0,
            cs.name(),
            &|k| cs.var_location(k),
            &|k| cs.var_implementation(k),
            &|_| false,
        )?;
    }

    Ok(())
}

fn gen_init_spike_count(
    os: &mut CodeStream,
    backend: &dyn Backend,
    pop_subs: &Substitutions,
    ng: &NeuronGroup,
    spike_event: bool,
) -> Result<()> {
    let init_required = if spike_event { ng.is_spike_event_required() } else { true };
    if !init_required {
        return Ok(());
    }
    let var_loc = if spike_event {
        ng.spike_event_location()
    } else {
        ng.spike_location()
    };

    backend.gen_pop_variable_init(os, var_loc, pop_subs, &|os, _| {
        let spike_cnt_prefix = if spike_event { "glbSpkCntEvnt" } else { "glbSpkCnt" };
        let delay_required = if spike_event {
            ng.is_delay_required()
        } else {
            ng.is_true_spike_required() && ng.is_delay_required()
        };

        if delay_required {
            os.line(format!("for (unsigned int d = 0; d < {}; d++)", ng.num_delay_slots()));
            os.scope(|os| {
                os.line(format!("{}{}{}[d] = 0;", backend.var_prefix(), spike_cnt_prefix, ng.name()));
                Ok(())
            })
        } else {
            os.line(format!("{}{}{}[0] = 0;", backend.var_prefix(), spike_cnt_prefix, ng.name()));
            Ok(())
        }
    })
}

fn gen_init_spikes(
    os: &mut CodeStream,
    backend: &dyn Backend,
    pop_subs: &Substitutions,
    ng: &NeuronGroup,
    spike_event: bool,
) -> Result<()> {
    let init_required = if spike_event { ng.is_spike_event_required() } else { true };
    if !init_required {
        return Ok(());
    }
    let var_loc = if spike_event {
        ng.spike_event_location()
    } else {
        ng.spike_location()
    };

    backend.gen_variable_init(os, var_loc, ng.num_neurons(), "id", pop_subs, &|os, var_subs| {
        let spike_prefix = if spike_event { "glbSpkEvnt" } else { "glbSpk" };
        let delay_required = if spike_event {
            ng.is_delay_required()
        } else {
            ng.is_true_spike_required() && ng.is_delay_required()
        };
        let id = var_subs.required("id")?;

        if delay_required {
            os.line(format!("for (unsigned int d = 0; d < {}; d++)", ng.num_delay_slots()));
            os.scope(|os| {
                os.line(format!(
                    "{}{}{}[(d * {}) + {}] = 0;",
                    backend.var_prefix(),
                    spike_prefix,
                    ng.name(),
                    ng.num_neurons(),
                    id
                ));
                Ok(())
            })
        } else {
            os.line(format!(
                "{}{}{}[{}] = 0;",
                backend.var_prefix(),
                spike_prefix,
                ng.name(),
                id
            ));
            Ok(())
        }
    })
}

/// Initialise one set of per-element variables, copying the value into every
/// delay slot for queued variables.
#[allow(clippy::too_many_arguments)]
fn gen_init_neuron_var_code(
    os: &mut CodeStream,
    backend: &dyn Backend,
    model: &Model,
    pop_subs: &Substitutions,
    vars: &[Var],
    initialisers: &[VarInit],
    count: u32,
    num_delay_slots: u32,
    pop_name: &str,
    var_location: &dyn Fn(usize) -> VarLocation,
    var_implementation: &dyn Fn(usize) -> VarImplementation,
    is_var_queue_required: &dyn Fn(usize) -> bool,
) -> Result<()> {
    for (k, var) in vars.iter().enumerate() {
        let init = &initialisers[k];

        // Only individually implemented variables with initialisation code
        // are touched here.
        if !matches!(var_implementation(k), VarImplementation::Individual) || init.code().is_empty() {
            continue;
        }

        os.scope(|os| {
            backend.gen_variable_init(os, var_location(k), count, "id", pop_subs, &|os, var_subs| {
                let mut subs = Substitutions::with_parent(var_subs);
                subs.add_param_value_substitutions(
                    init.snippet().param_names().iter().map(String::as_str),
                    init.params(),
                );
                subs.add_param_value_substitutions(init.snippet().derived_param_names(), init.derived_params());
                let id = var_subs.required("id")?.to_string();

                if is_var_queue_required(k) {
                    // Generate the initial value into a temporary, then copy
                    // it into all delay slots.
                    os.line(format!("{} initVal;", var.ty));
                    subs.add_var_substitution("value", "initVal");

                    let mut code = init.code().to_string();
                    subs.apply_check_unresolved(&mut code, &format!("initVar : {}{}", var.name, pop_name))?;
                    os.line(ensure_ftype(&code, model.precision()));

                    os.line(format!("for (unsigned int d = 0; d < {}; d++)", num_delay_slots));
                    os.scope(|os| {
                        os.line(format!(
                            "{}{}{}[(d * {}) + {}] = initVal;",
                            backend.var_prefix(),
                            var.name,
                            pop_name,
                            count,
                            id
                        ));
                        Ok(())
                    })
                } else {
                    subs.add_var_substitution(
                        "value",
                        format!("{}{}{}[{}]", backend.var_prefix(), var.name, pop_name, id),
                    );

                    let mut code = init.code().to_string();
                    subs.apply_check_unresolved(&mut code, &format!("initVar : {}{}", var.name, pop_name))?;
                    os.line(ensure_ftype(&code, model.precision()));
                    Ok(())
                }
            })
        })?;
    }
    Ok(())
}

/// Initialise one row of a synapse group's weight-update variables.
fn gen_init_wu_var_code(
    os: &mut CodeStream,
    backend: &dyn Backend,
    model: &Model,
    pop_subs: &Substitutions,
    sg: &SynapseGroup,
) -> Result<()> {
    for (k, var) in sg.wu_snippet().vars().iter().enumerate() {
        let init = &sg.wu_var_initialisers()[k];

        if !matches!(sg.wu_var_implementation(k), VarImplementation::Individual) || init.code().is_empty() {
            continue;
        }

        os.scope(|os| {
            backend.gen_synapse_variable_row_init(os, sg.wu_var_location(k), model, sg, pop_subs, &|os, var_subs| {
                let mut subs = Substitutions::with_parent(var_subs);
                subs.add_var_substitution(
                    "value",
                    format!(
                        "{}{}{}[{}]",
                        backend.var_prefix(),
                        var.name,
                        sg.name(),
                        var_subs.required("id_syn")?
                    ),
                );
                subs.add_param_value_substitutions(
                    init.snippet().param_names().iter().map(String::as_str),
                    init.params(),
                );
                subs.add_param_value_substitutions(init.snippet().derived_param_names(), init.derived_params());

                let mut code = init.code().to_string();
                subs.apply_check_unresolved(&mut code, &format!("initVar : {}{}", var.name, sg.name()))?;
                os.line(ensure_ftype(&code, model.precision()));
                Ok(())
            })
        })?;
    }
    Ok(())
}
