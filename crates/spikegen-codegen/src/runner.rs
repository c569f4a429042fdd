//! Generator for the definitions headers and the runner implementation: one
//! declaration, one implementation, one allocation and one free per model
//! buffer, plus host/device transfer functions honoring zero-copy and queued
//! variables.

use spikegen_model::{MatrixConnectivity, MatrixWeight, Model, ModelError, NeuronGroup, SynapseGroup, VarImplementation, NO_DELAY};

use crate::backend::Backend;
use crate::code_stream::CodeStream;
use crate::error::{CodegenError, Result};

/// Emit the definitions header, the internal definitions header and the
/// runner implementation.
pub fn generate_runner(
    definitions: &mut CodeStream,
    definitions_internal: &mut CodeStream,
    runner: &mut CodeStream,
    model: &Model,
    backend: &dyn Backend,
) -> Result<()> {
    if !model.is_finalized() {
        return Err(ModelError::NotFinalized.into());
    }

    backend.gen_definitions_preamble(definitions, model)?;
    definitions.blank();
    definitions.line("// Runner interface");
    definitions.line("void allocateMem();");
    definitions.line("void freeMem();");
    definitions.line("void initialize();");
    definitions.line("void initializeSparse();");
    definitions.blank();

    definitions_internal.line("#pragma once");
    definitions_internal.line("#include \"definitions.h\"");
    definitions_internal.blank();

    backend.gen_runner_preamble(runner, model)?;
    runner.line("#include \"definitionsInternal.h\"");
    runner.blank();

    let mut allocations = CodeStream::new();
    let mut free = CodeStream::new();

    if model.is_timing_enabled() {
        backend.gen_timer_setup(&mut allocations, &mut free, model)?;
    }

    if is_global_device_rng_required(model) {
        backend.gen_global_rng(definitions, definitions_internal, runner, &mut allocations, &mut free)?;
    }

    for ng in model.neuron_groups() {
        gen_neuron_group_runner(
            definitions,
            definitions_internal,
            runner,
            &mut allocations,
            &mut free,
            model,
            backend,
            ng,
        )?;
    }

    for cs in model.current_sources() {
        let count = model
            .neuron_group(cs.target_name())
            .expect("current source target resolves")
            .num_neurons();
        for (index, var) in cs.snippet().vars().iter().enumerate() {
            gen_array(
                definitions,
                definitions_internal,
                runner,
                &mut allocations,
                &mut free,
                backend,
                &var.ty,
                &format!("{}{}", var.name, cs.name()),
                cs.var_location(index),
                count,
            )?;
        }
    }

    for sg in model.synapse_groups() {
        gen_synapse_group_runner(
            definitions,
            definitions_internal,
            runner,
            &mut allocations,
            &mut free,
            model,
            backend,
            sg,
        )?;
    }

    // Assemble allocateMem / freeMem from the accumulated statements.
    runner.line("void allocateMem()");
    runner.scope(|os| {
        os.line(allocations.as_str().trim_end());
        Ok::<(), CodegenError>(())
    })?;
    runner.blank();
    runner.line("void freeMem()");
    runner.scope(|os| {
        os.line(free.as_str().trim_end());
        Ok::<(), CodegenError>(())
    })?;

    Ok(())
}

/// Emit the makefile fragment for the generated sources.
pub fn generate_makefile(os: &mut CodeStream, backend: &dyn Backend) -> Result<()> {
    backend.gen_makefile_fragment(os)
}

/// The global device RNG feeds procedural connectivity regeneration.
pub fn is_global_device_rng_required(model: &Model) -> bool {
    model.synapse_groups().any(|sg| {
        matches!(sg.matrix_type().connectivity, MatrixConnectivity::Procedural)
            && sg.connectivity_initialiser().is_rng_required()
    })
}

#[allow(clippy::too_many_arguments)]
fn gen_array(
    definitions: &mut CodeStream,
    definitions_internal: &mut CodeStream,
    runner: &mut CodeStream,
    allocations: &mut CodeStream,
    free: &mut CodeStream,
    backend: &dyn Backend,
    ty: &str,
    name: &str,
    loc: spikegen_model::VarLocation,
    count: u32,
) -> Result<()> {
    backend.gen_variable_definition(definitions, definitions_internal, ty, name, loc)?;
    backend.gen_variable_implementation(runner, ty, name, loc)?;
    backend.gen_variable_allocation(allocations, ty, name, loc, count)?;
    backend.gen_variable_free(free, name, loc)?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn gen_neuron_group_runner(
    definitions: &mut CodeStream,
    definitions_internal: &mut CodeStream,
    runner: &mut CodeStream,
    allocations: &mut CodeStream,
    free: &mut CodeStream,
    model: &Model,
    backend: &dyn Backend,
    ng: &NeuronGroup,
) -> Result<()> {
    definitions.line(format!("// neuron group {}", ng.name()));
    let delay_slots = ng.num_delay_slots();
    let spike_count_slots = if ng.is_delay_required() && ng.is_true_spike_required() {
        delay_slots
    } else {
        1
    };
    let spike_slots = if ng.is_delay_required() && ng.is_true_spike_required() {
        delay_slots * ng.num_neurons()
    } else {
        ng.num_neurons()
    };

    gen_array(
        definitions,
        definitions_internal,
        runner,
        allocations,
        free,
        backend,
        "unsigned int",
        &format!("glbSpkCnt{}", ng.name()),
        ng.spike_location(),
        spike_count_slots,
    )?;
    gen_array(
        definitions,
        definitions_internal,
        runner,
        allocations,
        free,
        backend,
        "unsigned int",
        &format!("glbSpk{}", ng.name()),
        ng.spike_location(),
        spike_slots,
    )?;

    if ng.is_spike_event_required() {
        gen_array(
            definitions,
            definitions_internal,
            runner,
            allocations,
            free,
            backend,
            "unsigned int",
            &format!("glbSpkCntEvnt{}", ng.name()),
            ng.spike_event_location(),
            delay_slots,
        )?;
        gen_array(
            definitions,
            definitions_internal,
            runner,
            allocations,
            free,
            backend,
            "unsigned int",
            &format!("glbSpkEvnt{}", ng.name()),
            ng.spike_event_location(),
            delay_slots * ng.num_neurons(),
        )?;
    }

    if ng.is_delay_required() {
        backend.gen_global_scalar(definitions, runner, "unsigned int", &format!("spkQuePtr{}", ng.name()))?;
    }

    if ng.is_spike_time_required() {
        gen_array(
            definitions,
            definitions_internal,
            runner,
            allocations,
            free,
            backend,
            model.time_precision_str(),
            &format!("sT{}", ng.name()),
            ng.spike_time_location(),
            delay_slots * ng.num_neurons(),
        )?;
    }

    if ng.is_sim_rng_required() {
        backend.gen_population_rng(
            definitions,
            definitions_internal,
            runner,
            allocations,
            free,
            &format!("rng{}", ng.name()),
            ng.num_neurons(),
        )?;
    }

    for (index, var) in ng.snippet().vars().iter().enumerate() {
        if !matches!(ng.var_implementation(index), VarImplementation::Individual) {
            continue;
        }
        let count = if ng.is_var_queue_required_index(index) {
            delay_slots * ng.num_neurons()
        } else {
            ng.num_neurons()
        };
        gen_array(
            definitions,
            definitions_internal,
            runner,
            allocations,
            free,
            backend,
            &var.ty,
            &format!("{}{}", var.name, ng.name()),
            ng.var_location(index),
            count,
        )?;
    }

    for (index, egp) in ng.snippet().extra_global_params().iter().enumerate() {
        let name = format!("{}{}", egp.name, ng.name());
        backend.gen_extra_global_param_definition(
            definitions,
            &egp.ty,
            &name,
            ng.extra_global_param_location(index),
        )?;
        backend.gen_extra_global_param_implementation(runner, &egp.ty, &name, ng.extra_global_param_location(index))?;
        if egp.is_pointer() {
            backend.gen_extra_global_param_allocation(runner, &egp.ty, &name)?;
            backend.gen_extra_global_param_push(runner, &egp.ty, &name)?;
            backend.gen_extra_global_param_pull(runner, &egp.ty, &name)?;
        }
    }

    // State transfer functions. Queued variables restrict transfers to the
    // current delay slot through the dedicated entry points.
    runner.line(format!("void push{}StateToDevice()", ng.name()));
    runner.scope(|os| {
        for (index, var) in ng.snippet().vars().iter().enumerate() {
            if !matches!(ng.var_implementation(index), VarImplementation::Individual) {
                continue;
            }
            if ng.is_var_queue_required_index(index) {
                backend.gen_current_variable_push(os, model, ng, &var.ty, &format!("{}{}", var.name, ng.name()),
                    ng.var_location(index))?;
            } else {
                backend.gen_variable_push(
                    os,
                    &var.ty,
                    &format!("{}{}", var.name, ng.name()),
                    ng.var_location(index),
                    !ng.var_initialisers()[index].code().is_empty(),
                    ng.num_neurons(),
                )?;
            }
        }
        Ok::<(), CodegenError>(())
    })?;
    runner.blank();
    runner.line(format!("void pull{}StateFromDevice()", ng.name()));
    runner.scope(|os| {
        for (index, var) in ng.snippet().vars().iter().enumerate() {
            if !matches!(ng.var_implementation(index), VarImplementation::Individual) {
                continue;
            }
            if ng.is_var_queue_required_index(index) {
                backend.gen_current_variable_pull(os, model, ng, &var.ty, &format!("{}{}", var.name, ng.name()),
                    ng.var_location(index))?;
            } else {
                backend.gen_variable_pull(
                    os,
                    &var.ty,
                    &format!("{}{}", var.name, ng.name()),
                    ng.var_location(index),
                    ng.num_neurons(),
                )?;
            }
        }
        Ok::<(), CodegenError>(())
    })?;
    runner.blank();

    definitions.line(format!("void push{}StateToDevice();", ng.name()));
    definitions.line(format!("void pull{}StateFromDevice();", ng.name()));
    definitions.blank();
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn gen_synapse_group_runner(
    definitions: &mut CodeStream,
    definitions_internal: &mut CodeStream,
    runner: &mut CodeStream,
    allocations: &mut CodeStream,
    free: &mut CodeStream,
    model: &Model,
    backend: &dyn Backend,
    sg: &SynapseGroup,
) -> Result<()> {
    definitions.line(format!("// synapse group {}", sg.name()));
    let src_slots = model.src_neuron_group(sg).num_delay_slots();
    let trg_slots = model.trg_neuron_group(sg).num_delay_slots();

    // The head of a merge set owns the inSyn buffer and the dendritic delay
    // ring; followers accumulate into it.
    if sg.ps_model_target_name() == sg.name() {
        gen_array(
            definitions,
            definitions_internal,
            runner,
            allocations,
            free,
            backend,
            model.precision_str(),
            &format!("inSyn{}", sg.name()),
            sg.in_syn_location(),
            sg.trg_num_neurons(),
        )?;

        if sg.is_dendritic_delay_required() {
            gen_array(
                definitions,
                definitions_internal,
                runner,
                allocations,
                free,
                backend,
                model.precision_str(),
                &format!("denDelay{}", sg.name()),
                sg.dendritic_delay_location(),
                sg.max_dendritic_delay_timesteps() * sg.trg_num_neurons(),
            )?;
            backend.gen_global_scalar(definitions, runner, "unsigned int", &format!("denDelayPtr{}", sg.name()))?;
        }

        for (index, var) in sg.ps_snippet().vars().iter().enumerate() {
            if matches!(sg.ps_var_implementation(index), VarImplementation::Individual) {
                gen_array(
                    definitions,
                    definitions_internal,
                    runner,
                    allocations,
                    free,
                    backend,
                    &var.ty,
                    &format!("{}{}", var.name, sg.name()),
                    sg.ps_var_location(index),
                    sg.trg_num_neurons(),
                )?;
            }
        }
    }

    // Connectivity storage.
    match sg.matrix_type().connectivity {
        MatrixConnectivity::Sparse => {
            gen_array(
                definitions,
                definitions_internal,
                runner,
                allocations,
                free,
                backend,
                "unsigned int",
                &format!("rowLength{}", sg.name()),
                sg.sparse_connectivity_location(),
                sg.src_num_neurons(),
            )?;
            gen_array(
                definitions,
                definitions_internal,
                runner,
                allocations,
                free,
                backend,
                sg.sparse_ind_type(),
                &format!("ind{}", sg.name()),
                sg.sparse_connectivity_location(),
                sg.src_num_neurons() * sg.max_connections(),
            )?;
        }
        MatrixConnectivity::Bitmask => {
            let words = (u64::from(sg.src_num_neurons()) * u64::from(sg.trg_num_neurons())).div_ceil(32) as u32;
            gen_array(
                definitions,
                definitions_internal,
                runner,
                allocations,
                free,
                backend,
                "uint32_t",
                &format!("gp{}", sg.name()),
                sg.sparse_connectivity_location(),
                words,
            )?;
        }
        MatrixConnectivity::Dense | MatrixConnectivity::Procedural => {}
    }

    // Per-synapse weight state.
    if matches!(sg.matrix_type().weight, MatrixWeight::Individual) {
        let count = match sg.matrix_type().connectivity {
            MatrixConnectivity::Dense => sg.src_num_neurons() * sg.trg_num_neurons(),
            _ => sg.src_num_neurons() * sg.max_connections(),
        };
        for (index, var) in sg.wu_snippet().vars().iter().enumerate() {
            if matches!(sg.wu_var_implementation(index), VarImplementation::Individual) {
                gen_array(
                    definitions,
                    definitions_internal,
                    runner,
                    allocations,
                    free,
                    backend,
                    &var.ty,
                    &format!("{}{}", var.name, sg.name()),
                    sg.wu_var_location(index),
                    count,
                )?;
            }
        }
    }

    // Per-source and per-target weight-update state.
    let pre_count = if sg.delay_steps() != NO_DELAY {
        sg.src_num_neurons() * src_slots
    } else {
        sg.src_num_neurons()
    };
    for (index, var) in sg.wu_code().pre_vars.iter().enumerate() {
        gen_array(
            definitions,
            definitions_internal,
            runner,
            allocations,
            free,
            backend,
            &var.ty,
            &format!("{}{}", var.name, sg.name()),
            sg.wu_pre_var_location(index),
            pre_count,
        )?;
    }
    let post_count = if sg.back_prop_delay_steps() != NO_DELAY {
        sg.trg_num_neurons() * trg_slots
    } else {
        sg.trg_num_neurons()
    };
    for (index, var) in sg.wu_code().post_vars.iter().enumerate() {
        gen_array(
            definitions,
            definitions_internal,
            runner,
            allocations,
            free,
            backend,
            &var.ty,
            &format!("{}{}", var.name, sg.name()),
            sg.wu_post_var_location(index),
            post_count,
        )?;
    }

    for egp in sg.wu_snippet().extra_global_params() {
        let name = format!("{}{}", egp.name, sg.name());
        backend.gen_extra_global_param_definition(definitions, &egp.ty, &name, sg.in_syn_location())?;
        backend.gen_extra_global_param_implementation(runner, &egp.ty, &name, sg.in_syn_location())?;
        if egp.is_pointer() {
            backend.gen_extra_global_param_allocation(runner, &egp.ty, &name)?;
            backend.gen_extra_global_param_push(runner, &egp.ty, &name)?;
            backend.gen_extra_global_param_pull(runner, &egp.ty, &name)?;
        }
    }

    definitions.blank();
    Ok(())
}
