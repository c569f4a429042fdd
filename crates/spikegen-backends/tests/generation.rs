//! End-to-end generation tests: build a small model, run the full pipeline
//! against the CUDA-flavored backend and check the emitted kernels.

use std::sync::Arc;

use spikegen_backends::CudaBackend;
use spikegen_codegen::{
    generate_init, generate_makefile, generate_neuron_update, generate_runner, generate_synapse_update, CodeStream,
    CodegenError,
};
use spikegen_model::{
    CurrentSourceCode, Model, NeuronCode, PostsynapticCode, Snippet, SparseConnectivityCode,
    SparseConnectivityInit, SpanType, SynapseMatrixType, VarInit, WeightUpdateCode, NO_DELAY,
};

fn init_tracing() {
    let _ = spikegen_tracing::init_global_tracing(&spikegen_tracing::TracingConfig::for_ci());
}

fn lif() -> Arc<Snippet> {
    Snippet::neuron(
        "LIF",
        NeuronCode {
            sim_code: "$(V) += ((-$(V) + $(Isyn)) / $(TauM)) * 1.0;".to_string(),
            threshold_condition_code: "$(V) >= $(Vthresh)".to_string(),
            reset_code: "$(V) = $(Vreset);".to_string(),
            ..Default::default()
        },
    )
    .param_names(["Vthresh", "Vreset", "TauM"])
    .var("V", "scalar")
    .build()
}

fn static_pulse() -> Arc<Snippet> {
    Snippet::weight_update(
        "StaticPulse",
        WeightUpdateCode {
            sim_code: "$(addToInSyn, $(g));".to_string(),
            ..Default::default()
        },
    )
    .var("g", "scalar")
    .build()
}

fn static_pulse_pre_voltage() -> Arc<Snippet> {
    Snippet::weight_update(
        "StaticPulsePreVoltage",
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

fn dc_source() -> Arc<Snippet> {
    Snippet::current_source(
        "DC",
        CurrentSourceCode {
            injection_code: "$(injectCurrent, $(amp));".to_string(),
        },
    )
    .param_names(["amp"])
    .build()
}

fn fixed_number_row() -> Arc<Snippet> {
    Snippet::sparse_connectivity(
        "FixedNumberPostWithReplacement",
        SparseConnectivityCode {
            row_build_code: "if(c == 0) { $(endRow); }\n\
                             const unsigned int idPost = (unsigned int)($(gennrand_uniform) * $(num_post));\n\
                             $(addSynapse, idPost + $(id_post_begin));\n\
                             c--;"
                .to_string(),
            row_build_state_vars: vec![spikegen_model::RowBuildStateVar {
                name: "c".to_string(),
                ty: "unsigned int".to_string(),
                value: "$(rowLength)".to_string(),
            }],
            calc_max_row_length: Some(|_, _, params| params[0] as u32),
        },
    )
    .param_names(["rowLength"])
    .build()
}

/// A ten-neuron population with a DC current source, one dense projection and
/// delayed feedback reading the presynaptic voltage.
fn build_model() -> Model {
    let mut model = Model::new();
    model.set_name("test_network");
    model.set_dt(1.0);

    let neuron = lif();
    model
        .add_neuron_population(
            "Excitatory",
            10,
            &neuron,
            vec![-55.0, -60.0, 20.0],
            vec![VarInit::constant(-60.0)],
            0,
        )
        .unwrap();
    model
        .add_neuron_population(
            "Inhibitory",
            16,
            &neuron,
            vec![-55.0, -60.0, 20.0],
            vec![VarInit::constant(-60.0)],
            0,
        )
        .unwrap();

    model
        .add_current_source("Stim", &dc_source(), "Excitatory", vec![0.7], vec![])
        .unwrap();

    model
        .add_synapse_population(
            "ExcToInh",
            SynapseMatrixType::DENSE_INDIVIDUAL,
            NO_DELAY,
            "Excitatory",
            "Inhibitory",
            &static_pulse(),
            vec![],
            vec![VarInit::constant(0.5)],
            vec![],
            vec![],
            &delta_curr(),
            vec![],
            vec![],
            SparseConnectivityInit::uninitialised(),
        )
        .unwrap();

    model
        .add_synapse_population(
            "InhToExc",
            SynapseMatrixType::DENSE_INDIVIDUAL,
            3,
            "Inhibitory",
            "Excitatory",
            &static_pulse_pre_voltage(),
            vec![],
            vec![VarInit::constant(-0.25)],
            vec![],
            vec![],
            &delta_curr(),
            vec![],
            vec![],
            SparseConnectivityInit::uninitialised(),
        )
        .unwrap();

    model.finalize().unwrap();
    model
}

fn generate_all(model: &Model) -> (String, String, String, String) {
    let backend = CudaBackend::default();

    let mut neuron_update = CodeStream::new();
    generate_neuron_update(&mut neuron_update, model, &backend).unwrap();

    let mut synapse_update = CodeStream::new();
    generate_synapse_update(&mut synapse_update, model, &backend).unwrap();

    let mut init = CodeStream::new();
    generate_init(&mut init, model, &backend).unwrap();

    let mut definitions = CodeStream::new();
    let mut definitions_internal = CodeStream::new();
    let mut runner = CodeStream::new();
    generate_runner(&mut definitions, &mut definitions_internal, &mut runner, model, &backend).unwrap();

    (
        neuron_update.into_string(),
        synapse_update.into_string(),
        init.into_string(),
        format!("{}\n{}\n{}", definitions, definitions_internal, runner),
    )
}

#[test]
fn dc_current_source_emits_full_precision_literal() {
    init_tracing();
    let model = build_model();
    let (neuron_update, _, _, _) = generate_all(&model);

    // The DC amplitude is substituted as a constant and coerced to the model
    // precision.
    assert!(neuron_update.contains("Isyn += 0.7f;"), "{}", neuron_update);
}

#[test]
fn neuron_sim_code_is_fully_substituted_and_coerced() {
    init_tracing();
    let model = build_model();
    let (neuron_update, _, _, _) = generate_all(&model);

    // Parameters become literals, variables become registers, float literals
    // gain the single-precision suffix, integer literals stay integers.
    assert!(neuron_update.contains("lV += ((-lV + Isyn) / 20.0f) * 1.0f;"), "{}", neuron_update);
    assert!(neuron_update.contains("if ((lV >= -55.0f) && !(oldSpike))"), "{}", neuron_update);
    assert!(neuron_update.contains("lV = -60.0f;"), "{}", neuron_update);
    assert!(!neuron_update.contains("$("), "unresolved placeholder survived:\n{}", neuron_update);
}

#[test]
fn delay_widening_gives_queued_reads() {
    init_tracing();
    let model = build_model();

    // delay_steps = 3 on InhToExc widens the source ring to four slots and
    // queues the referenced voltage.
    let inh = model.neuron_group("Inhibitory").unwrap();
    assert_eq!(inh.num_delay_slots(), 4);
    assert!(inh.is_var_queue_required("V"));

    let (neuron_update, synapse_update, _, _) = generate_all(&model);

    // The neuron update reads and writes the queued variable through the
    // delay offsets; the synapse update reads the delayed presynaptic slot.
    assert!(neuron_update.contains("scalar lV = dd_VInhibitory[readDelayOffset + lid];"), "{}", neuron_update);
    assert!(neuron_update.contains("dd_VInhibitory[writeDelayOffset + lid] = lV;"), "{}", neuron_update);
    assert!(
        synapse_update.contains("dd_VInhibitory[preReadDelayOffset + shSpk[j]]"),
        "{}",
        synapse_update
    );
    assert!(
        synapse_update.contains("const unsigned int preReadDelaySlot = ((dd_spkQuePtrInhibitory + 1) % 4);"),
        "{}",
        synapse_update
    );
}

#[test]
fn dense_post_span_accumulates_in_register() {
    init_tracing();
    let model = build_model();
    let (_, synapse_update, _, _) = generate_all(&model);

    assert!(synapse_update.contains("float linSyn = 0;"), "{}", synapse_update);
    assert!(synapse_update.contains("linSyn += dd_gExcToInh[synAddress];"), "{}", synapse_update);
    assert!(synapse_update.contains("dd_inSynExcToInh[lid] += linSyn;"), "{}", synapse_update);
}

#[test]
fn sparse_pre_span_walks_row_lengths() {
    init_tracing();
    let mut model = Model::new();
    model.set_dt(0.1);
    let neuron = lif();
    model
        .add_neuron_population("A", 64, &neuron, vec![-55.0, -60.0, 20.0], vec![VarInit::constant(-60.0)], 0)
        .unwrap();
    model
        .add_neuron_population("B", 64, &neuron, vec![-55.0, -60.0, 20.0], vec![VarInit::constant(-60.0)], 0)
        .unwrap();
    let sg = model
        .add_synapse_population(
            "S",
            SynapseMatrixType::SPARSE_INDIVIDUAL,
            NO_DELAY,
            "A",
            "B",
            &static_pulse(),
            vec![],
            vec![VarInit::constant(0.5)],
            vec![],
            vec![],
            &delta_curr(),
            vec![],
            vec![],
            SparseConnectivityInit::new(fixed_number_row(), vec![8.0]).unwrap(),
        )
        .unwrap();
    sg.set_span_type(SpanType::Presynaptic);
    model.finalize().unwrap();

    // The connectivity snippet bounds the row length.
    assert_eq!(model.synapse_group("S").unwrap().max_connections(), 8);

    let (_, synapse_update, init, _) = generate_all(&model);
    assert!(
        synapse_update.contains("const unsigned int npost = dd_rowLengthS[preInd];"),
        "{}",
        synapse_update
    );
    assert!(
        synapse_update.contains("atomicAdd(&dd_inSynS[ipost], dd_gS[synAddress]);"),
        "{}",
        synapse_update
    );

    // Row building runs in the init kernel, terminated through endRow.
    assert!(init.contains("while(true)"), "{}", init);
    assert!(init.contains("if(c == 0) { break; }"), "{}", init);
    assert!(init.contains("dd_rowLengthS[lid] = rowLength;"), "{}", init);
}

#[test]
fn generation_is_deterministic() {
    init_tracing();
    let first_model = build_model();
    let second_model = build_model();
    let first = generate_all(&first_model);
    let second = generate_all(&second_model);
    assert_eq!(first.0, second.0);
    assert_eq!(first.1, second.1);
    assert_eq!(first.2, second.2);
    assert_eq!(first.3, second.3);
}

#[test]
fn init_zeroes_spikes_and_runs_initialisers() {
    init_tracing();
    let model = build_model();
    let (_, _, init, _) = generate_all(&model);

    assert!(init.contains("dd_glbSpkCntExcitatory[0] = 0;"), "{}", init);
    // The delayed population zeroes one count per delay slot.
    assert!(init.contains("for (unsigned int d = 0; d < 4; d++)"), "{}", init);
    // The queued variable initialises a temporary and copies it into every
    // delay slot.
    assert!(init.contains("scalar initVal;"), "{}", init);
    assert!(init.contains("dd_VInhibitory[(d * 16) + lid] = initVal;"), "{}", init);
    assert!(init.contains("dd_inSynExcToInh[lid] = 0.0f;"), "{}", init);
}

#[test]
fn runner_allocates_and_transfers_state() {
    init_tracing();
    let model = build_model();
    let (_, _, _, runner) = generate_all(&model);

    assert!(runner.contains("typedef float scalar;"), "{}", runner);
    assert!(runner.contains("extern scalar* VExcitatory;"), "{}", runner);
    assert!(
        runner.contains("CHECK_CUDA_ERRORS(cudaMalloc(&d_VExcitatory, 10 * sizeof(scalar)));"),
        "{}",
        runner
    );
    // The queued variable is allocated with one slot per delay step and
    // transferred through the current-slot entry point.
    assert!(
        runner.contains("CHECK_CUDA_ERRORS(cudaMalloc(&d_VInhibitory, 64 * sizeof(scalar)));"),
        "{}",
        runner
    );
    assert!(runner.contains("spkQuePtrInhibitory"), "{}", runner);
    assert!(runner.contains("void pushExcitatoryStateToDevice()"), "{}", runner);
}

#[test]
fn unresolved_placeholder_is_rejected_with_context() {
    init_tracing();
    let mut model = Model::new();
    let broken = Snippet::neuron(
        "Broken",
        NeuronCode {
            sim_code: "$(V) += $(notAParam);".to_string(),
            threshold_condition_code: "$(V) >= 1.0".to_string(),
            ..Default::default()
        },
    )
    .var("V", "scalar")
    .build();
    model
        .add_neuron_population("Pop", 4, &broken, vec![], vec![VarInit::constant(0.0)], 0)
        .unwrap();
    model.finalize().unwrap();

    let backend = CudaBackend::default();
    let mut os = CodeStream::new();
    let err = generate_neuron_update(&mut os, &model, &backend).unwrap_err();
    match err {
        CodegenError::UnresolvedPlaceholders { context, variables } => {
            assert_eq!(context, "Pop : neuron simCode");
            assert_eq!(variables, ["notAParam"]);
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
fn missing_threshold_treats_group_as_spike_free() {
    init_tracing();
    let mut model = Model::new();
    let silent = Snippet::neuron(
        "Silent",
        NeuronCode {
            sim_code: "$(V) *= 0.5;".to_string(),
            ..Default::default()
        },
    )
    .var("V", "scalar")
    .build();
    model
        .add_neuron_population("Pop", 4, &silent, vec![], vec![VarInit::constant(0.0)], 0)
        .unwrap();
    model.finalize().unwrap();

    let backend = CudaBackend::default();
    let mut os = CodeStream::new();
    generate_neuron_update(&mut os, &model, &backend).unwrap();
    let text = os.into_string();
    assert!(!text.contains("test for and register a true spike"), "{}", text);
    assert!(text.contains("lV *= 0.5f;"), "{}", text);
}

#[test]
fn procedural_connectivity_regenerates_rows() {
    init_tracing();
    let mut model = Model::new();
    model.set_dt(1.0);
    let neuron = lif();
    model
        .add_neuron_population("A", 64, &neuron, vec![-55.0, -60.0, 20.0], vec![VarInit::constant(-60.0)], 0)
        .unwrap();
    model
        .add_neuron_population("B", 64, &neuron, vec![-55.0, -60.0, 20.0], vec![VarInit::constant(-60.0)], 0)
        .unwrap();
    model
        .add_synapse_population(
            "P",
            SynapseMatrixType::PROCEDURAL_GLOBAL,
            NO_DELAY,
            "A",
            "B",
            &static_pulse(),
            vec![],
            vec![VarInit::constant(0.5)],
            vec![],
            vec![],
            &delta_curr(),
            vec![],
            vec![],
            SparseConnectivityInit::new(fixed_number_row(), vec![8.0]).unwrap(),
        )
        .unwrap();
    model.finalize().unwrap();

    let (_, synapse_update, _, runner) = generate_all(&model);

    // Row regeneration copies the global Philox stream and skips ahead to
    // this spike's sequence.
    assert!(
        synapse_update.contains("curandStatePhilox4_32_10_t connectRNG = dd_rng[0];"),
        "{}",
        synapse_update
    );
    assert!(synapse_update.contains("skipahead_sequence"), "{}", synapse_update);
    assert!(synapse_update.contains("while(true)"), "{}", synapse_update);
    // The weight-update simulation code was substituted in through
    // addSynapse, with the global weight as a literal.
    assert!(
        synapse_update.contains("atomicAdd(&dd_inSynP[idPost+0], 0.5f);"),
        "{}",
        synapse_update
    );
    // The global device RNG backing regeneration is allocated once.
    assert!(runner.contains("cudaMalloc(&d_rng, 1 * sizeof(curandStatePhilox4_32_10_t))"), "{}", runner);
    // No connectivity or weight storage exists for this group.
    assert!(!runner.contains("indP"), "{}", runner);
    assert!(!runner.contains("gP;"), "{}", runner);
}

#[test]
fn spike_like_events_or_conditions_and_retest() {
    init_tracing();
    let mut model = Model::new();
    model.set_dt(1.0);
    let neuron = lif();
    model
        .add_neuron_population("A", 32, &neuron, vec![-55.0, -60.0, 20.0], vec![VarInit::constant(-60.0)], 0)
        .unwrap();
    model
        .add_neuron_population("B", 64, &neuron, vec![-55.0, -60.0, 20.0], vec![VarInit::constant(-60.0)], 0)
        .unwrap();

    let graded = Snippet::weight_update(
        "GradedSynapse",
        WeightUpdateCode {
            event_code: "$(addToInSyn, $(g) * $(V_pre));".to_string(),
            event_threshold_condition_code: "$(V_pre) > $(Epre)".to_string(),
            ..Default::default()
        },
    )
    .param_names(["Epre"])
    .var("g", "scalar")
    .build();

    let sg = model
        .add_synapse_population(
            "G",
            SynapseMatrixType::DENSE_INDIVIDUAL,
            NO_DELAY,
            "A",
            "B",
            &graded,
            vec![-50.0],
            vec![VarInit::constant(0.1)],
            vec![],
            vec![],
            &delta_curr(),
            vec![],
            vec![],
            SparseConnectivityInit::uninitialised(),
        )
        .unwrap();
    sg.set_event_threshold_retest_required(true);
    model.finalize().unwrap();

    assert!(model.neuron_group("A").unwrap().is_spike_event_required());

    let (neuron_update, synapse_update, _, runner) = generate_all(&model);

    // The neuron update ORs the event condition over outgoing groups and
    // stages events into the shared event buffer.
    assert!(neuron_update.contains("bool spikeLikeEvent = false;"), "{}", neuron_update);
    assert!(neuron_update.contains("spikeLikeEvent |= (lV > -50.0f);"), "{}", neuron_update);
    assert!(neuron_update.contains("shSpkEvnt[spkEvntIdx] = lid;"), "{}", neuron_update);

    // The synapse update re-tests the threshold against the presynaptic
    // state before applying the graded event.
    assert!(
        synapse_update.contains("if(dd_VA[shSpkEvnt[j]] > -50.0f)"),
        "{}",
        synapse_update
    );
    assert!(synapse_update.contains("dd_glbSpkCntEvntA[0]"), "{}", synapse_update);

    // Event buffers are allocated alongside the spike buffers.
    assert!(runner.contains("glbSpkEvntA"), "{}", runner);
}

#[test]
fn makefile_fragment_lists_generated_objects() {
    init_tracing();
    let backend = CudaBackend::default();
    let mut os = CodeStream::new();
    generate_makefile(&mut os, &backend).unwrap();
    let text = os.into_string();
    assert!(text.contains("NVCC := nvcc"), "{}", text);
    assert!(text.contains("neuronUpdate.o synapseUpdate.o init.o runner.o"), "{}", text);
}

#[test]
fn merged_postsynaptic_models_accumulate_atomically() {
    init_tracing();
    let mut model = Model::new();
    model.set_merge_postsynaptic_models(true);
    model.set_dt(1.0);
    let neuron = lif();
    model
        .add_neuron_population("A", 32, &neuron, vec![-55.0, -60.0, 20.0], vec![VarInit::constant(-60.0)], 0)
        .unwrap();
    model
        .add_neuron_population("B", 32, &neuron, vec![-55.0, -60.0, 20.0], vec![VarInit::constant(-60.0)], 0)
        .unwrap();
    model
        .add_neuron_population("C", 48, &neuron, vec![-55.0, -60.0, 20.0], vec![VarInit::constant(-60.0)], 0)
        .unwrap();

    let wum = static_pulse();
    let psm = delta_curr();
    for (name, src) in [("AtoC", "A"), ("BtoC", "B")] {
        model
            .add_synapse_population(
                name,
                SynapseMatrixType::DENSE_INDIVIDUAL,
                NO_DELAY,
                src,
                "C",
                &wum,
                vec![],
                vec![VarInit::constant(0.5)],
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

    assert!(model.synapse_group("BtoC").unwrap().is_ps_model_merged());
    assert_eq!(model.synapse_group("BtoC").unwrap().ps_model_target_name(), "AtoC");

    let (neuron_update, synapse_update, _, runner) = generate_all(&model);

    // Both groups flush into the head group's buffer through an atomic.
    assert!(
        synapse_update.contains("atomicAdd(&dd_inSynAtoC[lid], linSyn);"),
        "{}",
        synapse_update
    );
    assert!(!synapse_update.contains("dd_inSynBtoC"), "{}", synapse_update);
    // Only one inSyn buffer is allocated, and the neuron update pulls it once.
    assert!(runner.contains("cudaMalloc(&d_inSynAtoC"), "{}", runner);
    assert!(!runner.contains("inSynBtoC"), "{}", runner);
    assert!(neuron_update.contains("float linSynAtoC = dd_inSynAtoC[lid];"), "{}", neuron_update);
}
