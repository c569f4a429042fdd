//! Generator for the neuron update artifact.
//!
//! The backend opens the pre-reset and update kernels and dispatches the
//! handler below once per neuron group, with `id` bound to the in-group
//! neuron index and the read/write delay offsets declared for delayed
//! populations.

use spikegen_model::{Model, ModelError, NeuronGroup, VarAccess, VarImplementation};
use tracing::warn;

use crate::backend::Backend;
use crate::code_stream::CodeStream;
use crate::error::{CodegenError, Result};
use crate::model_subst;
use crate::substitutions::Substitutions;
use crate::text::{check_unresolved, ensure_ftype};

/// Emit the neuron update implementation stream.
pub fn generate_neuron_update(os: &mut CodeStream, model: &Model, backend: &dyn Backend) -> Result<()> {
    if !model.is_finalized() {
        return Err(ModelError::NotFinalized.into());
    }

    os.line("#include \"definitionsInternal.h\"");
    os.blank();

    let handler = |os: &mut CodeStream, model: &Model, ng: &NeuronGroup, pop_subs: &Substitutions| -> Result<()> {
        gen_neuron_group_update(os, model, ng, pop_subs, backend)
    };
    backend.gen_neuron_update(os, model, &handler)
}

fn gen_neuron_group_update(
    os: &mut CodeStream,
    model: &Model,
    ng: &NeuronGroup,
    pop_subs: &Substitutions,
    backend: &dyn Backend,
) -> Result<()> {
    let nm = ng.neuron_code();
    let dev_prefix = backend.var_prefix();
    let precision = model.precision();
    let id = pop_subs.required("id")?.to_string();

    // Pull neuron state into local registers, through the read-delay offset
    // for queued variables.
    for (index, var) in ng.snippet().vars().iter().enumerate() {
        if !matches!(ng.var_implementation(index), VarImplementation::Individual) {
            continue;
        }
        let offset = if ng.is_var_queue_required_index(index) && ng.is_delay_required() {
            "readDelayOffset + "
        } else {
            ""
        };
        os.line(format!(
            "{} l{} = {}{}{}[{}{}];",
            var.ty,
            var.name,
            dev_prefix,
            var.name,
            ng.name(),
            offset,
            id
        ));
    }

    // Also read the spike time into a local variable.
    if ng.is_spike_time_required() {
        let offset = if ng.is_delay_required() { "readDelayOffset + " } else { "" };
        os.line(format!(
            "{} lsT = {}sT{}[{}{}];",
            model.time_precision_str(),
            dev_prefix,
            ng.name(),
            offset,
            id
        ));
    }
    os.blank();

    if !ng.merged_in_syn().is_empty() || nm.sim_code.contains("Isyn") {
        os.line(format!("{} Isyn = 0;", model.precision_str()));
    }

    let mut subs = Substitutions::with_parent(pop_subs);
    subs.add_var_substitution("Isyn", "Isyn");
    subs.add_var_substitution("sT", "lsT");

    // Initialise any additional input variables supported by the snippet.
    for input_var in &nm.additional_input_vars {
        os.line(format!("{} {} = {};", input_var.ty, input_var.name, input_var.init_value));
        subs.add_var_substitution(&input_var.name, input_var.name.clone());
    }

    // Apply input from every merged incoming synapse group.
    for (head, _) in ng.merged_in_syn() {
        let sg = model.synapse_group(head).expect("merged synapse group resolves");
        let psm = sg.ps_code();
        let target = sg.ps_model_target_name();

        os.line("// pull inSyn values in a coalesced access");
        os.line(format!(
            "{} linSyn{} = {}inSyn{}[{}];",
            model.precision_str(),
            target,
            dev_prefix,
            target,
            id
        ));

        if sg.is_dendritic_delay_required() {
            // Add the dendritic delay head to the input and zero its slot.
            os.line(format!(
                "{} &denDelayFront{} = {}denDelay{}[{}{}];",
                model.precision_str(),
                target,
                dev_prefix,
                target,
                sg.dendritic_delay_offset(dev_prefix, None),
                id
            ));
            os.line(format!("linSyn{} += denDelayFront{};", target, target));
            os.line(format!("denDelayFront{} = {};", target, model.scalar_expr(0.0)));
        }

        for (index, var) in sg.ps_snippet().vars().iter().enumerate() {
            if matches!(sg.ps_var_implementation(index), VarImplementation::Individual) {
                os.line(format!(
                    "{} lps{}{} = {}{}{}[{}];",
                    var.ty, var.name, target, dev_prefix, var.name, target, id
                ));
            }
        }

        let mut in_syn_subs = Substitutions::with_parent(&subs);
        in_syn_subs.add_var_substitution("inSyn", format!("linSyn{}", target));

        let mut ps_code = psm.apply_input_code.clone();
        model_subst::apply_neuron_model_substitutions(&mut ps_code, model, ng, "l", "")?;
        model_subst::apply_postsynaptic_model_substitutions(&mut ps_code, model, sg, "lps")?;
        in_syn_subs.apply(&mut ps_code)?;
        let ps_code = ensure_ftype(&ps_code, precision);
        check_unresolved(&ps_code, &format!("{} : postSyntoCurrent", target))?;
        os.line(ps_code);
    }

    // Inject every current source targeting this group.
    for cs_name in ng.current_sources() {
        let cs = model.current_source(cs_name).expect("current source resolves");
        os.line(format!("// current source {}", cs.name()));
        os.scope(|os| {
            for (index, var) in cs.snippet().vars().iter().enumerate() {
                if matches!(cs.var_implementation(index), VarImplementation::Individual) {
                    os.line(format!(
                        "{} lcs{} = {}{}{}[{}];",
                        var.ty, var.name, dev_prefix, var.name, cs.name(), id
                    ));
                }
            }

            let mut curr_source_subs = Substitutions::with_parent(&subs);
            curr_source_subs.add_func_substitution("injectCurrent", 1, "Isyn += $(0)");

            let mut i_code = cs.source_code().injection_code.clone();
            model_subst::apply_current_source_substitutions(&mut i_code, model, cs, "lcs")?;
            curr_source_subs.apply(&mut i_code)?;
            let i_code = ensure_ftype(&i_code, precision);
            check_unresolved(&i_code, &format!("{} : current source injectionCode", cs.name()))?;
            os.line(i_code);

            for (index, var) in cs.snippet().vars().iter().enumerate() {
                if matches!(cs.var_implementation(index), VarImplementation::Individual)
                    && matches!(var.access, VarAccess::ReadWrite)
                {
                    os.line(format!(
                        "{}{}{}[{}] = lcs{};",
                        dev_prefix, var.name, cs.name(), id, var.name
                    ));
                }
            }
            Ok::<(), CodegenError>(())
        })?;
    }

    // Threshold condition, memoized before the sim code under auto-refractory.
    let mut th_code = nm.threshold_condition_code.clone();
    if th_code.is_empty() {
        warn!(
            group = %ng.name(),
            "no threshold condition code provided; no spikes will be detected in this population"
        );
    } else {
        os.line("// test whether spike condition was fulfilled previously");
        model_subst::apply_neuron_model_substitutions(&mut th_code, model, ng, "l", "")?;
        subs.apply(&mut th_code)?;
        th_code = ensure_ftype(&th_code, precision);
        check_unresolved(&th_code, &format!("{} : thresholdConditionCode", ng.name()))?;
        if nm.auto_refractory {
            os.line(format!("const bool oldSpike = ({});", th_code));
        }
    }

    os.line("// calculate membrane potential");
    let mut s_code = nm.sim_code.clone();
    subs.apply(&mut s_code)?;
    model_subst::apply_neuron_model_substitutions(&mut s_code, model, ng, "l", "")?;
    let s_code = ensure_ftype(&s_code, precision);
    check_unresolved(&s_code, &format!("{} : neuron simCode", ng.name()))?;
    os.line(s_code);

    // Spike-like events are the OR over all outgoing event conditions.
    if ng.is_spike_event_required() {
        os.line("bool spikeLikeEvent = false;");
        for condition in ng.spike_event_conditions() {
            let mut e_code = condition.clone();
            model_subst::apply_neuron_model_substitutions(&mut e_code, model, ng, "l", "_pre")?;
            subs.apply(&mut e_code)?;
            let e_code = ensure_ftype(&e_code, precision);
            check_unresolved(&e_code, &format!("{} : neuronSpkEvntCondition", ng.name()))?;
            os.scope(|os| {
                os.line(format!("spikeLikeEvent |= ({});", e_code));
                Ok::<(), CodegenError>(())
            })?;
        }

        os.line("// register a spike-like event");
        os.line("if (spikeLikeEvent)");
        os.scope(|os| backend.gen_emit_spike_like_event(os, model, ng, &subs))?;
    }

    // Test for and register a true spike, if a condition was provided.
    if !th_code.is_empty() {
        os.line("// test for and register a true spike");
        if nm.auto_refractory {
            os.line(format!("if (({}) && !(oldSpike))", th_code));
        } else {
            os.line(format!("if ({})", th_code));
        }
        os.scope(|os| {
            backend.gen_emit_true_spike(os, model, ng, &subs)?;

            if !nm.reset_code.is_empty() {
                let mut r_code = nm.reset_code.clone();
                model_subst::apply_neuron_model_substitutions(&mut r_code, model, ng, "l", "")?;
                subs.apply(&mut r_code)?;
                let r_code = ensure_ftype(&r_code, precision);
                check_unresolved(&r_code, &format!("{} : resetCode", ng.name()))?;
                os.line("// spike reset code");
                os.line(r_code);
            }
            Ok::<(), CodegenError>(())
        })?;
    }

    // Store the defined parts of the neuron state back to global memory,
    // through the write-delay offset for queued variables.
    for (index, var) in ng.snippet().vars().iter().enumerate() {
        if !matches!(ng.var_implementation(index), VarImplementation::Individual)
            || !matches!(var.access, VarAccess::ReadWrite)
        {
            continue;
        }
        let offset = if ng.is_var_queue_required_index(index) && ng.is_delay_required() {
            "writeDelayOffset + "
        } else {
            ""
        };
        os.line(format!(
            "{}{}{}[{}{}] = l{};",
            dev_prefix,
            var.name,
            ng.name(),
            offset,
            id,
            var.name
        ));
    }

    // Postsynaptic decay dynamics, then write inSyn and model state back.
    for (head, _) in ng.merged_in_syn() {
        let sg = model.synapse_group(head).expect("merged synapse group resolves");
        let psm = sg.ps_code();
        let target = sg.ps_model_target_name();

        let mut in_syn_subs = Substitutions::with_parent(&subs);
        in_syn_subs.add_var_substitution("inSyn", format!("linSyn{}", target));

        let mut pd_code = psm.decay_code.clone();
        model_subst::apply_neuron_model_substitutions(&mut pd_code, model, ng, "l", "")?;
        model_subst::apply_postsynaptic_model_substitutions(&mut pd_code, model, sg, "lps")?;
        in_syn_subs.apply(&mut pd_code)?;
        let pd_code = ensure_ftype(&pd_code, precision);
        check_unresolved(&pd_code, &format!("{} : postSynDecay", target))?;

        os.line("// the post-synaptic dynamics");
        os.line(pd_code);

        os.line(format!("{}inSyn{}[{}] = linSyn{};", dev_prefix, target, id, target));
        for (index, var) in sg.ps_snippet().vars().iter().enumerate() {
            if matches!(sg.ps_var_implementation(index), VarImplementation::Individual)
                && matches!(var.access, VarAccess::ReadWrite)
            {
                os.line(format!(
                    "{}{}{}[{}] = lps{}{};",
                    dev_prefix, var.name, target, id, var.name, target
                ));
            }
        }
    }

    Ok(())
}
