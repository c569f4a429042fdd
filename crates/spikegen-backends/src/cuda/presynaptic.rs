//! Presynaptic update strategies: how one synapse group's update is
//! parallelized. A group is dispatched to the first compatible strategy in a
//! fixed order: procedural presynaptic span, presynaptic span, postsynaptic
//! span.

use spikegen_model::{MatrixConnectivity, Model, SpanType, SynapseGroup, VarImplementation};

use spikegen_codegen::backend::{Backend, SynapseGroupHandler};
use spikegen_codegen::error::{CodegenError, Result};
use spikegen_codegen::{CodeStream, Substitutions};

use super::{ceil_divide, CudaBackend, Kernel};

pub trait PresynapticUpdateStrategy {
    /// Number of threads the group's update is parallelized across.
    fn num_threads(&self, sg: &SynapseGroup) -> u32;

    /// Stride used to access synaptic matrix rows.
    fn synaptic_matrix_row_stride(&self, sg: &SynapseGroup) -> u32;

    /// Is this strategy compatible with the group?
    fn is_compatible(&self, sg: &SynapseGroup) -> bool;

    /// How many accumulator elements each thread needs in shared memory (one
    /// when the small-population optimization applies, zero otherwise).
    fn shared_memory_per_thread(&self, model: &Model, sg: &SynapseGroup, backend: &CudaBackend) -> u32;

    fn gen_preamble(&self, os: &mut CodeStream, model: &Model, sg: &SynapseGroup, backend: &CudaBackend)
        -> Result<()>;

    /// Generate the main update loop for true spikes or spike-like events.
    #[allow(clippy::too_many_arguments)]
    fn gen_update(
        &self,
        os: &mut CodeStream,
        model: &Model,
        sg: &SynapseGroup,
        pop_subs: &Substitutions,
        backend: &CudaBackend,
        true_spike: bool,
        id_start: u32,
        wum_thresh_handler: SynapseGroupHandler,
        wum_sim_handler: SynapseGroupHandler,
        wum_procedural_connect_handler: SynapseGroupHandler,
        wum_procedural_var_handler: SynapseGroupHandler,
    ) -> Result<()>;

    fn gen_postamble(
        &self,
        os: &mut CodeStream,
        model: &Model,
        sg: &SynapseGroup,
        pop_subs: &Substitutions,
        backend: &CudaBackend,
    ) -> Result<()>;
}

static PRE_SPAN_PROCEDURAL: PreSpanProcedural = PreSpanProcedural;
static PRE_SPAN: PreSpan = PreSpan;
static POST_SPAN: PostSpan = PostSpan;

/// Pick the first compatible strategy for a synapse group.
pub fn select_strategy(sg: &SynapseGroup) -> Result<&'static dyn PresynapticUpdateStrategy> {
    let strategies: [&'static dyn PresynapticUpdateStrategy; 3] = [&PRE_SPAN_PROCEDURAL, &PRE_SPAN, &POST_SPAN];
    strategies
        .into_iter()
        .find(|strategy| strategy.is_compatible(sg))
        .ok_or_else(|| CodegenError::NoCompatibleStrategy(sg.name().to_string()))
}

/// Input to a small enough population can be accumulated in a shared memory
/// array. Not worthwhile where shared atomics are emulated, and impossible
/// with dendritic delays (the buffer is indexed per delay slot).
fn is_small_shared_memory_pop(sg: &SynapseGroup, backend: &CudaBackend) -> bool {
    if !backend.supports_native_shared_atomics() {
        false
    } else if sg.is_dendritic_delay_required() {
        false
    } else {
        sg.trg_num_neurons() <= backend.kernel_block_size(Kernel::PresynapticUpdate)
    }
}

fn gen_small_shared_memory_pop_preamble(os: &mut CodeStream, sg: &SynapseGroup) -> Result<()> {
    os.line(format!("if(threadIdx.x < {})", sg.trg_num_neurons()));
    os.scope(|os| {
        os.line("shLg[threadIdx.x] = 0;");
        Ok::<(), CodegenError>(())
    })?;
    os.line("__syncthreads();");
    Ok::<(), CodegenError>(())
}

fn gen_small_shared_memory_pop_postamble(
    os: &mut CodeStream,
    model: &Model,
    sg: &SynapseGroup,
    backend: &CudaBackend,
) -> Result<()> {
    os.line("__syncthreads();");
    os.line(format!("if (threadIdx.x < {})", sg.trg_num_neurons()));
    os.scope(|os| {
        let in_syn = format!("dd_inSyn{}[threadIdx.x]", sg.ps_model_target_name());
        if sg.is_ps_model_merged() {
            os.line(format!(
                "{}(&{}, shLg[threadIdx.x]);",
                backend.float_atomic_add(model.precision()),
                in_syn
            ));
        } else {
            os.line(format!("{} += shLg[threadIdx.x];", in_syn));
        }
        Ok::<(), CodegenError>(())
    })
}

/// Bind `addToInSyn` / `addToInSynDelay` for one synapse applying input to
/// `post_idx`.
fn add_in_syn_substitutions(
    subs: &mut Substitutions,
    model: &Model,
    sg: &SynapseGroup,
    backend: &CudaBackend,
    post_idx: &str,
    shared: bool,
) {
    let atomic_add = backend.float_atomic_add(model.precision());
    if sg.is_dendritic_delay_required() {
        // Delayed input always lands in the dendritic delay ring through an
        // atomic.
        subs.add_func_substitution(
            "addToInSynDelay",
            2,
            format!(
                "{}(&dd_denDelay{}[{}{}], $(0))",
                atomic_add,
                sg.ps_model_target_name(),
                sg.dendritic_delay_offset("dd_", Some("$(1)")),
                post_idx
            ),
        );
    } else if shared {
        subs.add_func_substitution(
            "addToInSyn",
            1,
            format!("{}(&shLg[{}], $(0))", atomic_add, post_idx),
        );
    } else {
        subs.add_func_substitution(
            "addToInSyn",
            1,
            format!("{}(&dd_inSyn{}[{}], $(0))", atomic_add, sg.ps_model_target_name(), post_idx),
        );
    }
}

// ------------------------------------------------------------------------
// PreSpan
// ------------------------------------------------------------------------

/// Presynaptic parallelism: one (or more) threads per source spike, walking
/// the spiking neuron's sparse row.
pub struct PreSpan;

impl PresynapticUpdateStrategy for PreSpan {
    fn num_threads(&self, sg: &SynapseGroup) -> u32 {
        sg.src_num_neurons() * sg.num_threads_per_spike()
    }

    fn synaptic_matrix_row_stride(&self, sg: &SynapseGroup) -> u32 {
        sg.max_connections()
    }

    fn is_compatible(&self, sg: &SynapseGroup) -> bool {
        matches!(sg.span_type(), SpanType::Presynaptic)
            && matches!(sg.matrix_type().connectivity, MatrixConnectivity::Sparse)
    }

    fn shared_memory_per_thread(&self, _model: &Model, sg: &SynapseGroup, backend: &CudaBackend) -> u32 {
        u32::from(is_small_shared_memory_pop(sg, backend))
    }

    fn gen_preamble(&self, os: &mut CodeStream, _model: &Model, sg: &SynapseGroup, backend: &CudaBackend) -> Result<()> {
        if is_small_shared_memory_pop(sg, backend) {
            gen_small_shared_memory_pop_preamble(os, sg)?;
        }
        Ok::<(), CodegenError>(())
    }

    fn gen_update(
        &self,
        os: &mut CodeStream,
        model: &Model,
        sg: &SynapseGroup,
        pop_subs: &Substitutions,
        backend: &CudaBackend,
        true_spike: bool,
        _id_start: u32,
        wum_thresh_handler: SynapseGroupHandler,
        wum_sim_handler: SynapseGroupHandler,
        _wum_procedural_connect_handler: SynapseGroupHandler,
        _wum_procedural_var_handler: SynapseGroupHandler,
    ) -> Result<()> {
        let event_suffix = if true_spike { "" } else { "Evnt" };
        let src = model.src_neuron_group(sg);
        let id = pop_subs.required("id")?.to_string();

        if sg.num_threads_per_spike() > 1 {
            os.line(format!(
                "const unsigned int spike = {} / {};",
                id,
                sg.num_threads_per_spike()
            ));
            os.line(format!(
                "const unsigned int thread = {} % {};",
                id,
                sg.num_threads_per_spike()
            ));
        } else {
            os.line(format!("const unsigned int spike = {};", id));
        }

        let spike_count_slot = if src.is_delay_required() { "preReadDelaySlot" } else { "0" };
        os.line(format!(
            "if (spike < dd_glbSpkCnt{}{}[{}])",
            event_suffix,
            src.name(),
            spike_count_slot
        ));
        os.scope(|os| {
            if src.is_delay_required() {
                os.line(format!(
                    "const unsigned int preInd = dd_glbSpk{}{}[(preReadDelaySlot * {}) + spike];",
                    event_suffix,
                    src.name(),
                    src.num_neurons()
                ));
            } else {
                os.line(format!(
                    "const unsigned int preInd = dd_glbSpk{}{}[spike];",
                    event_suffix,
                    src.name()
                ));
            }

            if sg.num_threads_per_spike() > 1 {
                os.line(format!(
                    "unsigned int synAddress = (preInd * {}) + thread;",
                    sg.max_connections()
                ));
            } else {
                os.line(format!("unsigned int synAddress = preInd * {};", sg.max_connections()));
            }
            os.line(format!("const unsigned int npost = dd_rowLength{}[preInd];", sg.name()));

            let retest = !true_spike && sg.is_event_threshold_retest_required();
            if retest {
                let mut thresh_subs = Substitutions::with_parent(pop_subs);
                thresh_subs.add_var_substitution("id_pre", "preInd");
                let mut condition = CodeStream::new();
                wum_thresh_handler(&mut condition, model, sg, &thresh_subs)?;
                os.line(format!("if({})", condition.as_str()));
            }

            let row_loop = |os: &mut CodeStream| -> Result<()> {
                if sg.num_threads_per_spike() > 1 {
                    os.line(format!(
                        "for(unsigned int i = thread; i < npost; i += {}, synAddress += {})",
                        sg.num_threads_per_spike(),
                        sg.num_threads_per_spike()
                    ));
                } else {
                    os.line("for(unsigned int i = 0; i < npost; i++, synAddress++)");
                }
                os.scope(|os| {
                    os.line(format!("const unsigned int ipost = dd_ind{}[synAddress];", sg.name()));

                    let mut syn_subs = Substitutions::with_parent(pop_subs);
                    syn_subs.add_var_substitution("id_pre", "preInd");
                    syn_subs.add_var_substitution("id_post", "ipost");
                    syn_subs.add_var_substitution("id_syn", "synAddress");
                    add_in_syn_substitutions(
                        &mut syn_subs,
                        model,
                        sg,
                        backend,
                        "ipost",
                        is_small_shared_memory_pop(sg, backend),
                    );
                    wum_sim_handler(os, model, sg, &syn_subs)
                })
            };

            if retest {
                os.scope(row_loop)
            } else {
                row_loop(os)
            }
        })
    }

    fn gen_postamble(
        &self,
        os: &mut CodeStream,
        model: &Model,
        sg: &SynapseGroup,
        _pop_subs: &Substitutions,
        backend: &CudaBackend,
    ) -> Result<()> {
        if is_small_shared_memory_pop(sg, backend) {
            gen_small_shared_memory_pop_postamble(os, model, sg, backend)?;
        }
        Ok::<(), CodegenError>(())
    }
}

// ------------------------------------------------------------------------
// PostSpan
// ------------------------------------------------------------------------

/// Postsynaptic parallelism: spikes are staged into shared memory in blocks,
/// each thread owns one postsynaptic column.
pub struct PostSpan;

impl PostSpan {
    /// With a dense or bitmask matrix and no dendritic delay, each thread can
    /// accumulate its column's input in a register.
    fn should_accumulate_in_register(&self, sg: &SynapseGroup) -> bool {
        !sg.is_dendritic_delay_required()
            && matches!(
                sg.matrix_type().connectivity,
                MatrixConnectivity::Dense | MatrixConnectivity::Bitmask
            )
    }
}

impl PresynapticUpdateStrategy for PostSpan {
    fn num_threads(&self, sg: &SynapseGroup) -> u32 {
        sg.max_connections()
    }

    fn synaptic_matrix_row_stride(&self, sg: &SynapseGroup) -> u32 {
        sg.max_connections()
    }

    fn is_compatible(&self, sg: &SynapseGroup) -> bool {
        matches!(sg.span_type(), SpanType::Postsynaptic)
            && !matches!(sg.matrix_type().connectivity, MatrixConnectivity::Procedural)
    }

    fn shared_memory_per_thread(&self, _model: &Model, sg: &SynapseGroup, backend: &CudaBackend) -> u32 {
        u32::from(is_small_shared_memory_pop(sg, backend))
    }

    fn gen_preamble(&self, os: &mut CodeStream, model: &Model, sg: &SynapseGroup, backend: &CudaBackend) -> Result<()> {
        if self.should_accumulate_in_register(sg) {
            os.line(format!("{} linSyn = 0;", model.precision_str()));
        } else if is_small_shared_memory_pop(sg, backend) {
            gen_small_shared_memory_pop_preamble(os, sg)?;
        }
        Ok::<(), CodegenError>(())
    }

    fn gen_update(
        &self,
        os: &mut CodeStream,
        model: &Model,
        sg: &SynapseGroup,
        pop_subs: &Substitutions,
        backend: &CudaBackend,
        true_spike: bool,
        _id_start: u32,
        wum_thresh_handler: SynapseGroupHandler,
        wum_sim_handler: SynapseGroupHandler,
        _wum_procedural_connect_handler: SynapseGroupHandler,
        _wum_procedural_var_handler: SynapseGroupHandler,
    ) -> Result<()> {
        let event_suffix = if true_spike { "" } else { "Evnt" };
        let src = model.src_neuron_group(sg);
        let block_size = backend.kernel_block_size(Kernel::PresynapticUpdate);
        let id = pop_subs.required("id")?.to_string();
        let bitmask = matches!(sg.matrix_type().connectivity, MatrixConnectivity::Bitmask);
        let sparse = matches!(sg.matrix_type().connectivity, MatrixConnectivity::Sparse);

        let spike_count_slot = if src.is_delay_required() { "preReadDelaySlot" } else { "0" };
        os.line(format!(
            "const unsigned int numSpikes = dd_glbSpkCnt{}{}[{}];",
            event_suffix,
            src.name(),
            spike_count_slot
        ));
        os.line(format!(
            "const unsigned int numSpikeBlocks = (numSpikes + {} - 1) / {};",
            block_size, block_size
        ));

        os.line("for (unsigned int r = 0; r < numSpikeBlocks; r++)");
        os.scope(|os| {
            os.line(format!(
                "const unsigned int numSpikesInBlock = (r == numSpikeBlocks - 1) ? ((numSpikes - 1) % {}) + 1 : {};",
                block_size, block_size
            ));

            os.line("__syncthreads();");
            os.line("if (threadIdx.x < numSpikesInBlock)");
            os.scope(|os| {
                let queue_offset = if src.is_delay_required() { "preReadDelayOffset + " } else { "" };
                os.line(format!(
                    "const unsigned int spk = dd_glbSpk{}{}[{}(r * {}) + threadIdx.x];",
                    event_suffix,
                    src.name(),
                    queue_offset,
                    block_size
                ));
                os.line(format!("shSpk{}[threadIdx.x] = spk;", event_suffix));
                if sparse {
                    os.line(format!("shRowLength[threadIdx.x] = dd_rowLength{}[spk];", sg.name()));
                }
                Ok::<(), CodegenError>(())
            })?;
            os.line("__syncthreads();");

            os.line("// loop through all incoming spikes");
            os.line("for (unsigned int j = 0; j < numSpikesInBlock; j++)");
            os.scope(|os| {
                os.line("// only work on existing neurons");
                os.line(format!("if ({} < {})", id, sg.max_connections()));
                os.scope(|os| {
                    if bitmask {
                        let max_synapses = u64::from(sg.src_num_neurons()) * u64::from(sg.trg_num_neurons());
                        if max_synapses & 0xFFFF_FFFF_0000_0000 != 0 {
                            os.line(format!(
                                "const uint64_t gid = (shSpk{}[j] * {}ull + {});",
                                event_suffix,
                                sg.trg_num_neurons(),
                                id
                            ));
                        } else {
                            os.line(format!(
                                "const unsigned int gid = (shSpk{}[j] * {} + {});",
                                event_suffix,
                                sg.trg_num_neurons(),
                                id
                            ));
                        }
                    }

                    let retest = !true_spike && sg.is_event_threshold_retest_required();
                    if retest {
                        let mut thresh_subs = Substitutions::with_parent(pop_subs);
                        thresh_subs.add_var_substitution("id_pre", format!("shSpk{}[j]", event_suffix));
                        let mut condition = CodeStream::new();
                        wum_thresh_handler(&mut condition, model, sg, &thresh_subs)?;
                        if bitmask {
                            os.line(format!(
                                "if((B(dd_gp{}[gid / 32], gid & 31)) && ({}))",
                                sg.name(),
                                condition.as_str()
                            ));
                        } else {
                            os.line(format!("if({})", condition.as_str()));
                        }
                    } else if bitmask {
                        os.line(format!("if (B(dd_gp{}[gid / 32], gid & 31))", sg.name()));
                    }

                    let guarded = retest || bitmask;
                    let body = |os: &mut CodeStream| -> Result<()> {
                        let mut syn_subs = Substitutions::with_parent(pop_subs);
                        syn_subs.add_var_substitution("id_pre", format!("shSpk{}[j]", event_suffix));

                        if sparse {
                            os.line(format!(
                                "unsigned int synAddress = shSpk{}[j] * {};",
                                event_suffix,
                                sg.max_connections()
                            ));
                            os.line("const unsigned int npost = shRowLength[j];");
                            os.line(format!("if ({} < npost)", id));
                            os.scope(|os| {
                                os.line(format!("synAddress += {};", id));
                                os.line(format!("const unsigned int ipost = dd_ind{}[synAddress];", sg.name()));

                                syn_subs.add_var_substitution("id_post", "ipost");
                                syn_subs.add_var_substitution("id_syn", "synAddress");
                                add_in_syn_substitutions(
                                    &mut syn_subs,
                                    model,
                                    sg,
                                    backend,
                                    "ipost",
                                    is_small_shared_memory_pop(sg, backend),
                                );
                                wum_sim_handler(os, model, sg, &syn_subs)
                            })
                        } else {
                            os.line(format!(
                                "unsigned int synAddress = (shSpk{}[j] * {}) + {};",
                                event_suffix,
                                sg.trg_num_neurons(),
                                id
                            ));
                            syn_subs.add_var_substitution("id_post", id.clone());
                            syn_subs.add_var_substitution("id_syn", "synAddress");

                            // Register accumulation wins over every other
                            // discipline for dense matrices without delays.
                            let atomic_add = backend.float_atomic_add(model.precision());
                            if sg.is_dendritic_delay_required() {
                                syn_subs.add_func_substitution(
                                    "addToInSynDelay",
                                    2,
                                    format!(
                                        "{}(&dd_denDelay{}[{}{}], $(0))",
                                        atomic_add,
                                        sg.ps_model_target_name(),
                                        sg.dendritic_delay_offset("dd_", Some("$(1)")),
                                        id
                                    ),
                                );
                            } else if self.should_accumulate_in_register(sg) {
                                syn_subs.add_func_substitution("addToInSyn", 1, "linSyn += $(0)");
                            } else if is_small_shared_memory_pop(sg, backend) {
                                syn_subs.add_func_substitution(
                                    "addToInSyn",
                                    1,
                                    format!("shLg[{}] += $(0)", id),
                                );
                            } else {
                                syn_subs.add_func_substitution(
                                    "addToInSyn",
                                    1,
                                    format!("{}(&dd_inSyn{}[{}], $(0))", atomic_add, sg.ps_model_target_name(), id),
                                );
                            }
                            wum_sim_handler(os, model, sg, &syn_subs)
                        }
                    };

                    if guarded {
                        os.scope(body)
                    } else {
                        body(os)
                    }
                })
            })
        })
    }

    fn gen_postamble(
        &self,
        os: &mut CodeStream,
        model: &Model,
        sg: &SynapseGroup,
        pop_subs: &Substitutions,
        backend: &CudaBackend,
    ) -> Result<()> {
        if self.should_accumulate_in_register(sg) {
            let id = pop_subs.required("id")?;
            os.line("// only do this for existing neurons");
            os.line(format!("if ({} < {})", id, sg.trg_num_neurons()));
            os.scope(|os| {
                let in_syn = format!("dd_inSyn{}[{}]", sg.ps_model_target_name(), id);
                if sg.is_ps_model_merged() {
                    os.line(format!(
                        "{}(&{}, linSyn);",
                        backend.float_atomic_add(model.precision()),
                        in_syn
                    ));
                } else {
                    os.line(format!("{} += linSyn;", in_syn));
                }
                Ok::<(), CodegenError>(())
            })?;
        } else if is_small_shared_memory_pop(sg, backend) {
            gen_small_shared_memory_pop_postamble(os, model, sg, backend)?;
        }
        Ok::<(), CodegenError>(())
    }
}

// ------------------------------------------------------------------------
// PreSpanProcedural
// ------------------------------------------------------------------------

/// Presynaptic parallelism with procedural connectivity: each spiking
/// neuron's row is regenerated on the fly and the weight-update simulation
/// code is substituted in through `addSynapse`.
pub struct PreSpanProcedural;

impl PresynapticUpdateStrategy for PreSpanProcedural {
    fn num_threads(&self, sg: &SynapseGroup) -> u32 {
        sg.src_num_neurons() * sg.num_threads_per_spike()
    }

    fn synaptic_matrix_row_stride(&self, sg: &SynapseGroup) -> u32 {
        sg.max_connections()
    }

    fn is_compatible(&self, sg: &SynapseGroup) -> bool {
        matches!(sg.matrix_type().connectivity, MatrixConnectivity::Procedural)
            && sg
                .wu_var_implementations()
                .iter()
                .all(|impl_| matches!(impl_, VarImplementation::Global | VarImplementation::Procedural))
    }

    fn shared_memory_per_thread(&self, _model: &Model, sg: &SynapseGroup, backend: &CudaBackend) -> u32 {
        u32::from(is_small_shared_memory_pop(sg, backend))
    }

    fn gen_preamble(&self, os: &mut CodeStream, _model: &Model, sg: &SynapseGroup, backend: &CudaBackend) -> Result<()> {
        if is_small_shared_memory_pop(sg, backend) {
            gen_small_shared_memory_pop_preamble(os, sg)?;
        }
        Ok::<(), CodegenError>(())
    }

    fn gen_update(
        &self,
        os: &mut CodeStream,
        model: &Model,
        sg: &SynapseGroup,
        pop_subs: &Substitutions,
        backend: &CudaBackend,
        true_spike: bool,
        id_start: u32,
        wum_thresh_handler: SynapseGroupHandler,
        wum_sim_handler: SynapseGroupHandler,
        wum_procedural_connect_handler: SynapseGroupHandler,
        wum_procedural_var_handler: SynapseGroupHandler,
    ) -> Result<()> {
        let event_suffix = if true_spike { "" } else { "Evnt" };
        let src = model.src_neuron_group(sg);
        let num_src = sg.src_num_neurons();
        let num_trg = sg.trg_num_neurons();
        let id = pop_subs.required("id")?.to_string();

        if sg.num_threads_per_spike() > 1 {
            os.line(format!(
                "const unsigned int spike = {} / {};",
                id,
                sg.num_threads_per_spike()
            ));
            os.line(format!(
                "const unsigned int thread = {} % {};",
                id,
                sg.num_threads_per_spike()
            ));
        } else {
            os.line(format!("const unsigned int spike = {};", id));
        }

        let spike_count_slot = if src.is_delay_required() { "preReadDelaySlot" } else { "0" };
        os.line(format!(
            "if (spike < dd_glbSpkCnt{}{}[{}])",
            event_suffix,
            src.name(),
            spike_count_slot
        ));
        os.scope(|os| {
            if src.is_delay_required() {
                os.line(format!(
                    "const unsigned int preInd = dd_glbSpk{}{}[(preReadDelaySlot * {}) + spike];",
                    event_suffix,
                    src.name(),
                    num_src
                ));
            } else {
                os.line(format!(
                    "const unsigned int preInd = dd_glbSpk{}{}[spike];",
                    event_suffix,
                    src.name()
                ));
            }

            let mut proc_pop_subs = Substitutions::with_parent(pop_subs);
            proc_pop_subs.add_var_substitution("id_pre", "preInd");

            // Row regeneration needs its own RNG stream: copy the global
            // Philox state and skip ahead to this spike's sequence.
            if sg.connectivity_initialiser().is_rng_required() {
                os.line("curandStatePhilox4_32_10_t connectRNG = dd_rng[0];");
                if sg.num_threads_per_spike() > 1 {
                    os.line(format!(
                        "skipahead_sequence((unsigned long long)((preInd * {}) + thread + {}), &connectRNG);",
                        sg.num_threads_per_spike(),
                        id_start
                    ));
                } else {
                    os.line(format!(
                        "skipahead_sequence((unsigned long long)(preInd + {}), &connectRNG);",
                        id_start
                    ));
                }
                backend.add_rng_func_substitutions(&mut proc_pop_subs, model.precision(), "&connectRNG");
            }

            let retest = !true_spike && sg.is_event_threshold_retest_required();
            if retest {
                let thresh_subs = Substitutions::with_parent(&proc_pop_subs);
                let mut condition = CodeStream::new();
                wum_thresh_handler(&mut condition, model, sg, &thresh_subs)?;
                os.line(format!("if({})", condition.as_str()));
            }

            let update = |os: &mut CodeStream| -> Result<()> {
                // The simulation code becomes the body of `addSynapse`, with
                // the postsynaptic index as its first argument.
                let mut syn_subs = Substitutions::with_parent(&proc_pop_subs);
                syn_subs.add_var_substitution("id_post", "$(0)");
                syn_subs.add_var_substitution("id_syn", "0");
                add_in_syn_substitutions(
                    &mut syn_subs,
                    model,
                    sg,
                    backend,
                    "$(id_post)",
                    is_small_shared_memory_pop(sg, backend),
                );

                let mut presynaptic_update = CodeStream::new();
                wum_procedural_var_handler(&mut presynaptic_update, model, sg, &syn_subs)?;
                wum_sim_handler(&mut presynaptic_update, model, sg, &syn_subs)?;

                let mut conn_subs = Substitutions::with_parent(&proc_pop_subs);
                if sg.num_threads_per_spike() > 1 {
                    let num_post_per_thread = ceil_divide(num_trg, sg.num_threads_per_spike());
                    os.line(format!(
                        "const unsigned int idPostStart = thread * {};",
                        num_post_per_thread
                    ));
                    if num_trg % num_post_per_thread == 0 {
                        conn_subs.add_var_substitution("num_post", num_post_per_thread.to_string());
                    } else {
                        os.line(format!(
                            "const unsigned int numPost = (thread == {}) ? {} : {};",
                            sg.num_threads_per_spike() - 1,
                            num_trg % num_post_per_thread,
                            num_post_per_thread
                        ));
                        conn_subs.add_var_substitution("num_post", "numPost");
                    }
                    conn_subs.add_var_substitution("id_post_begin", "idPostStart");
                } else {
                    conn_subs.add_var_substitution("id_post_begin", "0");
                    conn_subs.add_var_substitution("num_post", num_trg.to_string());
                }

                let update_code = presynaptic_update.into_string();
                conn_subs.add_func_substitution("addSynapse", 1, update_code.trim_end());

                wum_procedural_connect_handler(os, model, sg, &conn_subs)
            };

            if retest {
                os.scope(update)
            } else {
                update(os)
            }
        })
    }

    fn gen_postamble(
        &self,
        os: &mut CodeStream,
        model: &Model,
        sg: &SynapseGroup,
        _pop_subs: &Substitutions,
        backend: &CudaBackend,
    ) -> Result<()> {
        if is_small_shared_memory_pop(sg, backend) {
            gen_small_shared_memory_pop_postamble(os, model, sg, backend)?;
        }
        Ok::<(), CodegenError>(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spikegen_model::{
        NeuronCode, PostsynapticCode, Snippet, SparseConnectivityInit, SynapseMatrixType, VarInit,
        WeightUpdateCode, NO_DELAY,
    };

    fn test_model(matrix_type: SynapseMatrixType, span: SpanType) -> Model {
        let neuron = Snippet::neuron(
            "LIF",
            NeuronCode {
                sim_code: "$(V) += $(Isyn);".to_string(),
                threshold_condition_code: "$(V) >= 1.0".to_string(),
                ..Default::default()
            },
        )
        .var("V", "scalar")
        .build();
        let wum = Snippet::weight_update(
            "StaticPulse",
            WeightUpdateCode {
                sim_code: "$(addToInSyn, $(g));".to_string(),
                ..Default::default()
            },
        )
        .var("g", "scalar")
        .build();
        let psm = Snippet::postsynaptic(
            "DeltaCurr",
            PostsynapticCode {
                apply_input_code: "$(Isyn) += $(inSyn); $(inSyn) = 0;".to_string(),
                ..Default::default()
            },
        )
        .build();

        let mut model = Model::new();
        model
            .add_neuron_population("A", 64, &neuron, vec![], vec![VarInit::constant(0.0)], 0)
            .unwrap();
        model
            .add_neuron_population("B", 128, &neuron, vec![], vec![VarInit::constant(0.0)], 0)
            .unwrap();
        let sg = model
            .add_synapse_population(
                "S",
                matrix_type,
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
        sg.set_span_type(span);
        model
    }

    fn group(model: &Model) -> &SynapseGroup {
        model.synapse_group("S").unwrap()
    }

    #[test]
    fn test_selection_order() {
        let post = test_model(SynapseMatrixType::SPARSE_INDIVIDUAL, SpanType::Postsynaptic);
        assert!(!PRE_SPAN.is_compatible(group(&post)));
        assert!(POST_SPAN.is_compatible(group(&post)));

        let pre = test_model(SynapseMatrixType::SPARSE_INDIVIDUAL, SpanType::Presynaptic);
        assert!(PRE_SPAN.is_compatible(group(&pre)));
        assert!(!POST_SPAN.is_compatible(group(&pre)));

        let procedural = test_model(SynapseMatrixType::PROCEDURAL_GLOBAL, SpanType::Presynaptic);
        assert!(PRE_SPAN_PROCEDURAL.is_compatible(group(&procedural)));
        assert!(!PRE_SPAN.is_compatible(group(&procedural)));
        assert!(!POST_SPAN.is_compatible(group(&procedural)));
    }

    #[test]
    fn test_thread_counts() {
        let mut pre = test_model(SynapseMatrixType::SPARSE_INDIVIDUAL, SpanType::Presynaptic);
        assert_eq!(PRE_SPAN.num_threads(group(&pre)), 64);
        pre.synapse_group_mut("S").unwrap().set_num_threads_per_spike(4);
        assert_eq!(PRE_SPAN.num_threads(group(&pre)), 256);

        let mut post = test_model(SynapseMatrixType::SPARSE_INDIVIDUAL, SpanType::Postsynaptic);
        post.synapse_group_mut("S").unwrap().set_max_connections(48);
        assert_eq!(POST_SPAN.num_threads(group(&post)), 48);
        assert_eq!(POST_SPAN.synaptic_matrix_row_stride(group(&post)), 48);
    }

    #[test]
    fn test_small_shared_memory_pop_gating() {
        let backend = CudaBackend::default();
        let model = test_model(SynapseMatrixType::SPARSE_INDIVIDUAL, SpanType::Postsynaptic);
        // 128 targets do not fit a 32-wide block.
        assert!(!is_small_shared_memory_pop(group(&model), &backend));

        let small = test_model(SynapseMatrixType::SPARSE_INDIVIDUAL, SpanType::Postsynaptic);
        let old_device = CudaBackend::new(crate::cuda::Preferences {
            device_capability_major: 3,
            ..Default::default()
        });
        assert!(!is_small_shared_memory_pop(group(&small), &old_device));
    }
}
