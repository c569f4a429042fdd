//! CUDA-flavored reference backend.
//!
//! Every emitted kernel is a data-parallel dispatch over a flat thread id
//! space, sliced per population in block-size padded ranges so whole thread
//! blocks stay inside one group and block-level barriers remain legal.
//! Device-resident symbols carry the `dd_` prefix; host mirrors of device
//! pointers the `d_` prefix.

pub mod presynaptic;

use spikegen_model::{MatrixConnectivity, Model, NeuronGroup, ScalarPrecision, SpanType, SynapseGroup, VarLocation};
use tracing::debug;

use spikegen_codegen::backend::{Backend, NeuronGroupHandler, SynapseGroupHandler, VarInitHandler};
use spikegen_codegen::error::{CodegenError, Result};
use spikegen_codegen::{CodeStream, FunctionTemplate, Substitutions};

use presynaptic::{select_strategy, PresynapticUpdateStrategy};

/// Kernels the backend emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kernel {
    NeuronUpdate,
    PresynapticUpdate,
    PostsynapticUpdate,
    SynapseDynamicsUpdate,
    Init,
    InitSparse,
}

impl Kernel {
    pub const fn name(self) -> &'static str {
        match self {
            Kernel::NeuronUpdate => "updateNeuronsKernel",
            Kernel::PresynapticUpdate => "presynapticUpdateKernel",
            Kernel::PostsynapticUpdate => "postsynapticUpdateKernel",
            Kernel::SynapseDynamicsUpdate => "synapseDynamicsKernel",
            Kernel::Init => "initializeKernel",
            Kernel::InitSparse => "initializeSparseKernel",
        }
    }

    /// Stem used for launch configuration variables in host code.
    pub const fn stem(self) -> &'static str {
        match self {
            Kernel::NeuronUpdate => "neuronUpdate",
            Kernel::PresynapticUpdate => "presynapticUpdate",
            Kernel::PostsynapticUpdate => "postsynapticUpdate",
            Kernel::SynapseDynamicsUpdate => "synapseDynamics",
            Kernel::Init => "init",
            Kernel::InitSparse => "initSparse",
        }
    }
}

/// Tunables for the CUDA-flavored backend.
#[derive(Debug, Clone)]
pub struct Preferences {
    pub neuron_update_block_size: u32,
    pub presynaptic_update_block_size: u32,
    pub postsynaptic_update_block_size: u32,
    pub synapse_dynamics_block_size: u32,
    pub init_block_size: u32,
    pub init_sparse_block_size: u32,
    /// Compute capability major version of the chosen device. Shared-memory
    /// atomics are emulated (and slow) before capability 5, and double
    /// precision `atomicAdd` is native from capability 6.
    pub device_capability_major: u32,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            neuron_update_block_size: 32,
            presynaptic_update_block_size: 32,
            postsynaptic_update_block_size: 32,
            synapse_dynamics_block_size: 32,
            init_block_size: 32,
            init_sparse_block_size: 32,
            device_capability_major: 7,
        }
    }
}

/// The reference backend.
#[derive(Debug, Default)]
pub struct CudaBackend {
    prefs: Preferences,
}

pub(crate) fn ceil_divide(numerator: u32, denominator: u32) -> u32 {
    (numerator + denominator - 1) / denominator
}

pub(crate) fn pad_size(size: u32, block_size: u32) -> u32 {
    ceil_divide(size, block_size) * block_size
}

impl CudaBackend {
    pub fn new(prefs: Preferences) -> Self {
        Self { prefs }
    }

    pub fn preferences(&self) -> &Preferences {
        &self.prefs
    }

    pub fn kernel_block_size(&self, kernel: Kernel) -> u32 {
        match kernel {
            Kernel::NeuronUpdate => self.prefs.neuron_update_block_size,
            Kernel::PresynapticUpdate => self.prefs.presynaptic_update_block_size,
            Kernel::PostsynapticUpdate => self.prefs.postsynaptic_update_block_size,
            Kernel::SynapseDynamicsUpdate => self.prefs.synapse_dynamics_block_size,
            Kernel::Init => self.prefs.init_block_size,
            Kernel::InitSparse => self.prefs.init_sparse_block_size,
        }
    }

    /// Shared-memory atomics are emulated before Maxwell and slower than
    /// global memory there.
    pub fn supports_native_shared_atomics(&self) -> bool {
        self.prefs.device_capability_major >= 5
    }

    /// Bind the `$(gennrand_...)` primitives to curand invocations on `rng`,
    /// picking the template column matching the model precision.
    pub(crate) fn add_rng_func_substitutions(&self, subs: &mut Substitutions, precision: ScalarPrecision, rng: &str) {
        subs.add_var_substitution("rng", rng.to_string());
        for function in RNG_FUNCTIONS {
            let template = if precision.is_single() {
                function.single_precision_template
            } else {
                function.double_precision_template
            };
            subs.add_func_substitution(
                function.generic_name,
                function.num_arguments,
                template.replace("$(rng)", rng),
            );
        }
    }

    fn gen_kernel_launch(&self, os: &mut CodeStream, kernel: Kernel, total_threads: u32, args: &str) {
        let block = self.kernel_block_size(kernel);
        let grid = ceil_divide(total_threads, block);
        os.line(format!("const dim3 {}Threads({}, 1);", kernel.stem(), block));
        os.line(format!("const dim3 {}Grid({}, 1);", kernel.stem(), grid));
        os.line(format!(
            "{}<<<{}Grid, {}Threads>>>({});",
            kernel.name(),
            kernel.stem(),
            kernel.stem(),
            args
        ));
        os.line("CHECK_CUDA_ERRORS(cudaPeekAtLastError());");
    }

    /// Dispatch `body` per group over a flat thread id space, one padded
    /// range per group. Binds `id` inside the body to the in-group index.
    fn gen_parallel_group<'m, T, F>(
        &self,
        os: &mut CodeStream,
        groups: &[(&'m T, u32)],
        block_size: u32,
        mut body: F,
    ) -> Result<()>
    where
        F: FnMut(&mut CodeStream, &'m T, &Substitutions, u32) -> Result<()>,
    {
        let mut id_start = 0u32;
        for (group, num_threads) in groups {
            let padded = pad_size(*num_threads, block_size);
            if id_start == 0 {
                os.line(format!("if(id < {})", padded));
            } else {
                os.line(format!("if(id >= {} && id < {})", id_start, id_start + padded));
            }
            let start = id_start;
            os.scope(|os| {
                if start == 0 {
                    os.line("const unsigned int lid = id;");
                } else {
                    os.line(format!("const unsigned int lid = id - {};", start));
                }
                let mut pop_subs = Substitutions::new();
                pop_subs.add_var_substitution("id", "lid");
                body(os, group, &pop_subs, start)
            })?;
            id_start += padded;
        }
        Ok::<(), CodegenError>(())
    }

    fn strategy_for(&self, sg: &SynapseGroup) -> Result<&'static dyn PresynapticUpdateStrategy> {
        select_strategy(sg)
    }

    fn presynaptic_groups<'m>(&self, model: &'m Model) -> Result<Vec<(&'m SynapseGroup, u32)>> {
        let mut groups = Vec::new();
        for sg in model.synapse_groups() {
            if sg.is_true_spike_required() || sg.is_spike_event_required() {
                let strategy = self.strategy_for(sg)?;
                groups.push((sg, strategy.num_threads(sg)));
            }
        }
        Ok(groups)
    }

    fn post_learn_groups<'m>(&self, model: &'m Model) -> Vec<(&'m SynapseGroup, u32)> {
        model
            .synapse_groups()
            .filter(|sg| !sg.wu_code().learn_post_code.is_empty())
            .map(|sg| (sg, sg.src_num_neurons()))
            .collect()
    }

    fn synapse_dynamics_groups<'m>(&self, model: &'m Model) -> Vec<(&'m SynapseGroup, u32)> {
        model
            .synapse_groups()
            .filter(|sg| !sg.wu_code().synapse_dynamics_code.is_empty())
            .map(|sg| {
                let threads = match sg.matrix_type().connectivity {
                    MatrixConnectivity::Dense => sg.src_num_neurons() * sg.trg_num_neurons(),
                    _ => sg.src_num_neurons() * sg.max_connections(),
                };
                (sg, threads)
            })
            .collect()
    }

    fn padded_total<T>(&self, groups: &[(&T, u32)], block_size: u32) -> u32 {
        groups.iter().map(|(_, threads)| pad_size(*threads, block_size)).sum()
    }

    /// Declare the pre/post read-delay constants a group's synaptic code
    /// expects when its endpoints are delayed.
    fn gen_synapse_delay_offsets(&self, os: &mut CodeStream, model: &Model, sg: &SynapseGroup) {
        let src = model.src_neuron_group(sg);
        if src.is_delay_required() {
            os.line(format!(
                "const unsigned int preReadDelaySlot = {};",
                sg.presynaptic_axonal_delay_slot("dd_", src.num_delay_slots())
            ));
            os.line(format!(
                "const unsigned int preReadDelayOffset = preReadDelaySlot * {};",
                src.num_neurons()
            ));
        }
        let trg = model.trg_neuron_group(sg);
        if trg.is_delay_required() {
            os.line(format!(
                "const unsigned int postReadDelaySlot = {};",
                sg.postsynaptic_back_prop_delay_slot("dd_", trg.num_delay_slots())
            ));
            os.line(format!(
                "const unsigned int postReadDelayOffset = postReadDelaySlot * {};",
                trg.num_neurons()
            ));
        }
    }

    fn element_type(ty: &str) -> &str {
        ty.trim_end_matches('*').trim_end()
    }
}

impl Backend for CudaBackend {
    fn gen_neuron_update(&self, os: &mut CodeStream, model: &Model, handler: NeuronGroupHandler) -> Result<()> {
        debug!(model = %model.name(), "generating neuron update kernels");
        let block_size = self.kernel_block_size(Kernel::NeuronUpdate);
        let time_type = model.time_precision_str();

        // The pre-reset kernel advances each delayed population's queue
        // pointer and zeroes this timestep's spike counts, exactly once per
        // step per population.
        os.line("extern \"C\" __global__ void preNeuronResetKernel()");
        os.scope(|os| {
            os.line("const unsigned int id = (blockIdx.x * blockDim.x) + threadIdx.x;");
            for (index, ng) in model.neuron_groups().enumerate() {
                os.line(format!("if(id == {})", index));
                os.scope(|os| {
                    if ng.is_delay_required() {
                        os.line(format!(
                            "dd_spkQuePtr{} = (dd_spkQuePtr{} + 1) % {};",
                            ng.name(),
                            ng.name(),
                            ng.num_delay_slots()
                        ));
                        if ng.is_spike_event_required() {
                            os.line(format!(
                                "dd_glbSpkCntEvnt{}[dd_spkQuePtr{}] = 0;",
                                ng.name(),
                                ng.name()
                            ));
                        }
                        if ng.is_true_spike_required() {
                            os.line(format!("dd_glbSpkCnt{}[dd_spkQuePtr{}] = 0;", ng.name(), ng.name()));
                        } else {
                            os.line(format!("dd_glbSpkCnt{}[0] = 0;", ng.name()));
                        }
                    } else {
                        if ng.is_spike_event_required() {
                            os.line(format!("dd_glbSpkCntEvnt{}[0] = 0;", ng.name()));
                        }
                        os.line(format!("dd_glbSpkCnt{}[0] = 0;", ng.name()));
                    }
                    Ok::<(), CodegenError>(())
                })?;
            }
            Ok::<(), CodegenError>(())
        })?;
        os.blank();

        let any_true_spike = model
            .neuron_groups()
            .any(|ng| !ng.neuron_code().threshold_condition_code.is_empty());
        let any_spike_event = model.neuron_groups().any(|ng| ng.is_spike_event_required());

        os.line(format!(
            "extern \"C\" __global__ void updateNeuronsKernel({} t)",
            time_type
        ));
        os.scope(|os| {
            os.line("const unsigned int id = (blockIdx.x * blockDim.x) + threadIdx.x;");
            if any_true_spike {
                os.line(format!("__shared__ unsigned int shSpk[{}];", block_size));
                os.line("__shared__ volatile unsigned int shPosSpk;");
                os.line("__shared__ volatile unsigned int shSpkCount;");
                os.line("if (threadIdx.x == 0)");
                os.scope(|os| {
                    os.line("shSpkCount = 0;");
                    Ok::<(), CodegenError>(())
                })?;
            }
            if any_spike_event {
                os.line(format!("__shared__ unsigned int shSpkEvnt[{}];", block_size));
                os.line("__shared__ volatile unsigned int shPosSpkEvnt;");
                os.line("__shared__ volatile unsigned int shSpkEvntCount;");
                os.line("if (threadIdx.x == 1)");
                os.scope(|os| {
                    os.line("shSpkEvntCount = 0;");
                    Ok::<(), CodegenError>(())
                })?;
            }
            os.line("__syncthreads();");
            os.blank();

            let groups: Vec<(&NeuronGroup, u32)> = model.neuron_groups().map(|ng| (ng, ng.num_neurons())).collect();
            self.gen_parallel_group(os, &groups, block_size, |os, ng, pop_subs, _| {
                let mut subs = Substitutions::with_parent(pop_subs);
                subs.add_var_substitution("t", "t");
                if ng.is_sim_rng_required() {
                    self.add_rng_func_substitutions(
                        &mut subs,
                        model.precision(),
                        &format!("&dd_rng{}[lid]", ng.name()),
                    );
                }

                if ng.is_delay_required() {
                    os.line(format!(
                        "const unsigned int readDelayOffset = {};",
                        ng.prev_queue_offset("dd_")
                    ));
                    os.line(format!(
                        "const unsigned int writeDelayOffset = {};",
                        ng.current_queue_offset("dd_")
                    ));
                }
                os.line(format!("if(lid < {})", ng.num_neurons()));
                os.scope(|os| handler(os, model, ng, &subs))?;

                // Stage this block's spikes out to the global buffers. The
                // barriers are legal because padding keeps whole blocks
                // inside one group.
                let has_threshold = !ng.neuron_code().threshold_condition_code.is_empty();
                if ng.is_spike_event_required() {
                    os.line("__syncthreads();");
                    os.line("if (threadIdx.x == 1)");
                    os.scope(|os| {
                        os.line("if (shSpkEvntCount > 0)");
                        os.scope(|os| {
                            let slot = if ng.is_delay_required() {
                                format!("dd_spkQuePtr{}", ng.name())
                            } else {
                                "0".to_string()
                            };
                            os.line(format!(
                                "shPosSpkEvnt = atomicAdd((unsigned int *) &dd_glbSpkCntEvnt{}[{}], shSpkEvntCount);",
                                ng.name(),
                                slot
                            ));
                            Ok::<(), CodegenError>(())
                        })
                    })?;
                    os.line("__syncthreads();");
                }
                if has_threshold {
                    os.line("__syncthreads();");
                    os.line("if (threadIdx.x == 0)");
                    os.scope(|os| {
                        os.line("if (shSpkCount > 0)");
                        os.scope(|os| {
                            let slot = if ng.is_delay_required() && ng.is_true_spike_required() {
                                format!("dd_spkQuePtr{}", ng.name())
                            } else {
                                "0".to_string()
                            };
                            os.line(format!(
                                "shPosSpk = atomicAdd((unsigned int *) &dd_glbSpkCnt{}[{}], shSpkCount);",
                                ng.name(),
                                slot
                            ));
                            Ok::<(), CodegenError>(())
                        })
                    })?;
                    os.line("__syncthreads();");
                }

                if ng.is_spike_event_required() {
                    os.line("if (threadIdx.x < shSpkEvntCount)");
                    os.scope(|os| {
                        let offset = if ng.is_delay_required() {
                            format!("{} + ", ng.current_queue_offset("dd_"))
                        } else {
                            String::new()
                        };
                        os.line(format!(
                            "dd_glbSpkEvnt{}[{}shPosSpkEvnt + threadIdx.x] = shSpkEvnt[threadIdx.x];",
                            ng.name(),
                            offset
                        ));
                        Ok::<(), CodegenError>(())
                    })?;
                }
                if has_threshold {
                    os.line("if (threadIdx.x < shSpkCount)");
                    os.scope(|os| {
                        let offset = if ng.is_delay_required() && ng.is_true_spike_required() {
                            format!("{} + ", ng.current_queue_offset("dd_"))
                        } else {
                            String::new()
                        };
                        os.line("const unsigned int n = shSpk[threadIdx.x];");
                        os.line(format!("dd_glbSpk{}[{}shPosSpk + threadIdx.x] = n;", ng.name(), offset));
                        if ng.is_spike_time_required() {
                            let st_offset = if ng.is_delay_required() {
                                format!("{} + ", ng.current_queue_offset("dd_"))
                            } else {
                                String::new()
                            };
                            os.line(format!("dd_sT{}[{}n] = t;", ng.name(), st_offset));
                        }
                        Ok::<(), CodegenError>(())
                    })?;
                }
                Ok::<(), CodegenError>(())
            })?;
            Ok::<(), CodegenError>(())
        })?;
        os.blank();

        // Host-side dispatch.
        let groups: Vec<(&NeuronGroup, u32)> = model.neuron_groups().map(|ng| (ng, ng.num_neurons())).collect();
        let total = self.padded_total(&groups, block_size);
        let num_groups = model.neuron_groups().count() as u32;
        os.line(format!("void updateNeurons({} t)", time_type));
        os.scope(|os| {
            if model.is_timing_enabled() {
                os.line("CHECK_CUDA_ERRORS(cudaEventRecord(neuronUpdateStart));");
            }
            os.line("const dim3 preResetThreads(32, 1);");
            os.line(format!("const dim3 preResetGrid({}, 1);", ceil_divide(num_groups, 32)));
            os.line("preNeuronResetKernel<<<preResetGrid, preResetThreads>>>();");
            os.line("CHECK_CUDA_ERRORS(cudaPeekAtLastError());");
            self.gen_kernel_launch(os, Kernel::NeuronUpdate, total, "t");
            if model.is_timing_enabled() {
                os.line("CHECK_CUDA_ERRORS(cudaEventRecord(neuronUpdateStop));");
            }
            Ok::<(), CodegenError>(())
        })?;
        Ok::<(), CodegenError>(())
    }

    fn gen_synapse_update(
        &self,
        os: &mut CodeStream,
        model: &Model,
        wum_thresh_handler: SynapseGroupHandler,
        wum_sim_handler: SynapseGroupHandler,
        wum_event_handler: SynapseGroupHandler,
        wum_procedural_connect_handler: SynapseGroupHandler,
        wum_procedural_var_handler: SynapseGroupHandler,
        post_learn_handler: SynapseGroupHandler,
        synapse_dynamics_handler: SynapseGroupHandler,
    ) -> Result<()> {
        debug!(model = %model.name(), "generating synapse update kernels");
        let block_size = self.kernel_block_size(Kernel::PresynapticUpdate);
        let time_type = model.time_precision_str();

        let presynaptic_groups = self.presynaptic_groups(model)?;
        let post_learn_groups = self.post_learn_groups(model);
        let dynamics_groups = self.synapse_dynamics_groups(model);

        if !presynaptic_groups.is_empty() {
            let any_true_spike = presynaptic_groups.iter().any(|(sg, _)| sg.is_true_spike_required());
            let any_spike_event = presynaptic_groups.iter().any(|(sg, _)| sg.is_spike_event_required());
            let any_post_span_sparse = presynaptic_groups.iter().any(|(sg, _)| {
                matches!(sg.span_type(), SpanType::Postsynaptic)
                    && matches!(sg.matrix_type().connectivity, MatrixConnectivity::Sparse)
            });
            let mut any_shared_accumulation = false;
            for (sg, _) in &presynaptic_groups {
                let strategy = self.strategy_for(sg)?;
                if strategy.shared_memory_per_thread(model, sg, self) > 0 {
                    any_shared_accumulation = true;
                }
            }

            os.line(format!(
                "extern \"C\" __global__ void presynapticUpdateKernel({} t)",
                time_type
            ));
            os.scope(|os| {
                os.line("const unsigned int id = (blockIdx.x * blockDim.x) + threadIdx.x;");
                if any_true_spike {
                    os.line(format!("__shared__ unsigned int shSpk[{}];", block_size));
                }
                if any_spike_event {
                    os.line(format!("__shared__ unsigned int shSpkEvnt[{}];", block_size));
                }
                if any_post_span_sparse {
                    os.line(format!("__shared__ unsigned int shRowLength[{}];", block_size));
                }
                if any_shared_accumulation {
                    os.line(format!("__shared__ {} shLg[{}];", model.precision_str(), block_size));
                }
                os.blank();

                self.gen_parallel_group(os, &presynaptic_groups, block_size, |os, sg, pop_subs, id_start| {
                    let strategy = self.strategy_for(sg)?;
                    os.line(format!("// synapse group {}", sg.name()));
                    self.gen_synapse_delay_offsets(os, model, sg);

                    strategy.gen_preamble(os, model, sg, self)?;
                    if sg.is_spike_event_required() {
                        strategy.gen_update(
                            os,
                            model,
                            sg,
                            pop_subs,
                            self,
                            false,
                            id_start,
                            wum_thresh_handler,
                            wum_event_handler,
                            wum_procedural_connect_handler,
                            wum_procedural_var_handler,
                        )?;
                    }
                    if sg.is_true_spike_required() {
                        strategy.gen_update(
                            os,
                            model,
                            sg,
                            pop_subs,
                            self,
                            true,
                            id_start,
                            wum_thresh_handler,
                            wum_sim_handler,
                            wum_procedural_connect_handler,
                            wum_procedural_var_handler,
                        )?;
                    }
                    strategy.gen_postamble(os, model, sg, pop_subs, self)
                })
            })?;
            os.blank();
        }

        // Postsynaptic learning, parallelized over presynaptic neurons with
        // postsynaptic spikes staged through shared memory.
        if !post_learn_groups.is_empty() {
            let learn_block = self.kernel_block_size(Kernel::PostsynapticUpdate);
            os.line(format!(
                "extern \"C\" __global__ void postsynapticUpdateKernel({} t)",
                time_type
            ));
            os.scope(|os| {
                os.line("const unsigned int id = (blockIdx.x * blockDim.x) + threadIdx.x;");
                os.line(format!("__shared__ unsigned int shSpk[{}];", learn_block));
                os.blank();

                self.gen_parallel_group(os, &post_learn_groups, learn_block, |os, sg, pop_subs, _| {
                    if !matches!(sg.matrix_type().connectivity, MatrixConnectivity::Dense) {
                        return Err(CodegenError::UnsupportedBackendCapability(format!(
                            "postsynaptic learning in synapse group '{}' requires dense connectivity",
                            sg.name()
                        )));
                    }
                    let trg = model.trg_neuron_group(sg);
                    self.gen_synapse_delay_offsets(os, model, sg);

                    let spike_slot = if trg.is_delay_required() {
                        "postReadDelaySlot".to_string()
                    } else {
                        "0".to_string()
                    };
                    os.line(format!(
                        "const unsigned int numSpikes = dd_glbSpkCnt{}[{}];",
                        trg.name(),
                        spike_slot
                    ));
                    os.line(format!(
                        "const unsigned int numSpikeBlocks = (numSpikes + {} - 1) / {};",
                        learn_block, learn_block
                    ));
                    os.line("for (unsigned int r = 0; r < numSpikeBlocks; r++)");
                    os.scope(|os| {
                        os.line(format!(
                            "const unsigned int numSpikesInBlock = (r == numSpikeBlocks - 1) ? ((numSpikes - 1) % {}) + 1 : {};",
                            learn_block, learn_block
                        ));
                        os.line("__syncthreads();");
                        os.line("if (threadIdx.x < numSpikesInBlock)");
                        os.scope(|os| {
                            let offset = if trg.is_delay_required() {
                                "postReadDelayOffset + "
                            } else {
                                ""
                            };
                            os.line(format!(
                                "shSpk[threadIdx.x] = dd_glbSpk{}[{}(r * {}) + threadIdx.x];",
                                trg.name(),
                                offset,
                                learn_block
                            ));
                            Ok::<(), CodegenError>(())
                        })?;
                        os.line("__syncthreads();");
                        os.line("// loop through all postsynaptic spikes");
                        os.line("for (unsigned int j = 0; j < numSpikesInBlock; j++)");
                        os.scope(|os| {
                            os.line(format!("if (lid < {})", sg.src_num_neurons()));
                            os.scope(|os| {
                                os.line(format!(
                                    "const unsigned int synAddress = (lid * {}) + shSpk[j];",
                                    sg.trg_num_neurons()
                                ));
                                let mut learn_subs = Substitutions::with_parent(pop_subs);
                                learn_subs.add_var_substitution("t", "t");
                                learn_subs.add_var_substitution("id_pre", "lid");
                                learn_subs.add_var_substitution("id_post", "shSpk[j]");
                                learn_subs.add_var_substitution("id_syn", "synAddress");
                                post_learn_handler(os, model, sg, &learn_subs)
                            })
                        })
                    })
                })
            })?;
            os.blank();
        }

        // Synapse dynamics run for every synapse, every timestep.
        if !dynamics_groups.is_empty() {
            let dynamics_block = self.kernel_block_size(Kernel::SynapseDynamicsUpdate);
            os.line(format!(
                "extern \"C\" __global__ void synapseDynamicsKernel({} t)",
                time_type
            ));
            os.scope(|os| {
                os.line("const unsigned int id = (blockIdx.x * blockDim.x) + threadIdx.x;");
                os.blank();
                self.gen_parallel_group(os, &dynamics_groups, dynamics_block, |os, sg, pop_subs, _| {
                    self.gen_synapse_delay_offsets(os, model, sg);
                    let mut dyn_subs = Substitutions::with_parent(pop_subs);
                    dyn_subs.add_var_substitution("t", "t");

                    let atomic_add = self.float_atomic_add(model.precision());
                    if sg.is_dendritic_delay_required() {
                        dyn_subs.add_func_substitution(
                            "addToInSynDelay",
                            2,
                            format!(
                                "{}(&dd_denDelay{}[{}$(id_post)], $(0))",
                                atomic_add,
                                sg.ps_model_target_name(),
                                sg.dendritic_delay_offset("dd_", Some("$(1)"))
                            ),
                        );
                    } else {
                        dyn_subs.add_func_substitution(
                            "addToInSyn",
                            1,
                            format!("{}(&dd_inSyn{}[$(id_post)], $(0))", atomic_add, sg.ps_model_target_name()),
                        );
                    }

                    match sg.matrix_type().connectivity {
                        MatrixConnectivity::Dense => {
                            os.line(format!("if (lid < {})", sg.src_num_neurons() * sg.trg_num_neurons()));
                            os.scope(|os| {
                                os.line(format!("const unsigned int ipre = lid / {};", sg.trg_num_neurons()));
                                os.line(format!("const unsigned int ipost = lid % {};", sg.trg_num_neurons()));
                                let mut subs = Substitutions::with_parent(&dyn_subs);
                                subs.add_var_substitution("id_pre", "ipre");
                                subs.add_var_substitution("id_post", "ipost");
                                subs.add_var_substitution("id_syn", "lid");
                                synapse_dynamics_handler(os, model, sg, &subs)
                            })
                        }
                        MatrixConnectivity::Sparse => {
                            let stride = sg.max_connections();
                            os.line(format!("const unsigned int row = lid / {};", stride));
                            os.line(format!("const unsigned int col = lid % {};", stride));
                            os.line(format!(
                                "if (row < {} && col < dd_rowLength{}[row])",
                                sg.src_num_neurons(),
                                sg.name()
                            ));
                            os.scope(|os| {
                                os.line(format!("const unsigned int synAddress = (row * {}) + col;", stride));
                                os.line(format!("const unsigned int ipost = dd_ind{}[synAddress];", sg.name()));
                                let mut subs = Substitutions::with_parent(&dyn_subs);
                                subs.add_var_substitution("id_pre", "row");
                                subs.add_var_substitution("id_post", "ipost");
                                subs.add_var_substitution("id_syn", "synAddress");
                                synapse_dynamics_handler(os, model, sg, &subs)
                            })
                        }
                        _ => Err(CodegenError::UnsupportedBackendCapability(format!(
                            "synapse dynamics in synapse group '{}' requires dense or sparse connectivity",
                            sg.name()
                        ))),
                    }
                })
            })?;
            os.blank();
        }

        // Host-side dispatch: dynamics feed the presynaptic update, learning
        // consumes the spikes it produced.
        os.line(format!("void updateSynapses({} t)", time_type));
        os.scope(|os| {
            if !dynamics_groups.is_empty() {
                if model.is_timing_enabled() {
                    os.line("CHECK_CUDA_ERRORS(cudaEventRecord(synapseDynamicsStart));");
                }
                let total = self.padded_total(&dynamics_groups, self.kernel_block_size(Kernel::SynapseDynamicsUpdate));
                self.gen_kernel_launch(os, Kernel::SynapseDynamicsUpdate, total, "t");
                if model.is_timing_enabled() {
                    os.line("CHECK_CUDA_ERRORS(cudaEventRecord(synapseDynamicsStop));");
                }
            }
            if !presynaptic_groups.is_empty() {
                if model.is_timing_enabled() {
                    os.line("CHECK_CUDA_ERRORS(cudaEventRecord(presynapticUpdateStart));");
                }
                let total = self.padded_total(&presynaptic_groups, block_size);
                self.gen_kernel_launch(os, Kernel::PresynapticUpdate, total, "t");
                if model.is_timing_enabled() {
                    os.line("CHECK_CUDA_ERRORS(cudaEventRecord(presynapticUpdateStop));");
                }
            }
            if !post_learn_groups.is_empty() {
                let total = self.padded_total(&post_learn_groups, self.kernel_block_size(Kernel::PostsynapticUpdate));
                self.gen_kernel_launch(os, Kernel::PostsynapticUpdate, total, "t");
            }
            Ok::<(), CodegenError>(())
        })?;
        Ok::<(), CodegenError>(())
    }

    fn gen_init(
        &self,
        os: &mut CodeStream,
        model: &Model,
        ng_handler: NeuronGroupHandler,
        sg_dense_var_handler: SynapseGroupHandler,
        sg_sparse_connect_handler: SynapseGroupHandler,
        sg_sparse_var_handler: SynapseGroupHandler,
    ) -> Result<()> {
        debug!(model = %model.name(), "generating initialization kernels");
        let block_size = self.kernel_block_size(Kernel::Init);

        let dense_groups: Vec<(&SynapseGroup, u32)> = model
            .synapse_groups()
            .filter(|sg| {
                matches!(sg.matrix_type().connectivity, MatrixConnectivity::Dense)
                    && sg.matrix_type().has_individual_weights()
            })
            .map(|sg| (sg, sg.trg_num_neurons()))
            .collect();
        let sparse_connect_groups: Vec<(&SynapseGroup, u32)> = model
            .synapse_groups()
            .filter(|sg| {
                matches!(sg.matrix_type().connectivity, MatrixConnectivity::Sparse)
                    && !sg.connectivity_initialiser().row_build_code().is_empty()
            })
            .map(|sg| (sg, sg.src_num_neurons()))
            .collect();
        let sparse_var_groups: Vec<(&SynapseGroup, u32)> = model
            .synapse_groups()
            .filter(|sg| {
                matches!(sg.matrix_type().connectivity, MatrixConnectivity::Sparse)
                    && sg.matrix_type().has_individual_weights()
            })
            .map(|sg| (sg, sg.max_connections()))
            .collect();

        // Shared between initialize() and initializeSparse() so both passes
        // draw from one seed.
        os.line("unsigned long long deviceRNGSeed = 0;");
        os.blank();

        os.line("extern \"C\" __global__ void initializeKernel(unsigned long long deviceRNGSeed)");
        os.scope(|os| {
            os.line("const unsigned int id = (blockIdx.x * blockDim.x) + threadIdx.x;");
            os.blank();

            // Neuron groups first, then dense matrices, then sparse
            // connectivity; each range is block-size padded.
            let ng_groups: Vec<(&NeuronGroup, u32)> = model.neuron_groups().map(|ng| (ng, ng.num_neurons())).collect();
            let mut id_start = 0u32;

            for (ng, num_threads) in &ng_groups {
                let padded = pad_size(*num_threads, block_size);
                self.gen_init_range(os, id_start, padded, |os, pop_subs| {
                    let mut subs = Substitutions::with_parent(pop_subs);
                    if ng.is_sim_rng_required() {
                        os.line(format!("if(lid < {})", ng.num_neurons()));
                        os.scope(|os| {
                            os.line(format!(
                                "curand_init(deviceRNGSeed, {}ull + lid, 0, &dd_rng{}[lid]);",
                                id_start,
                                ng.name()
                            ));
                            Ok::<(), CodegenError>(())
                        })?;
                    }
                    if ng.is_init_rng_required() {
                        os.line("curandStatePhilox4_32_10_t initRNG;");
                        os.line(format!("curand_init(deviceRNGSeed, 0, {}ull + lid, &initRNG);", id_start));
                        self.add_rng_func_substitutions(&mut subs, model.precision(), "&initRNG");
                    }
                    ng_handler(os, model, ng, &subs)
                })?;
                id_start += padded;
            }

            for (sg, num_threads) in &dense_groups {
                let padded = pad_size(*num_threads, block_size);
                self.gen_init_range(os, id_start, padded, |os, pop_subs| {
                    let mut subs = Substitutions::with_parent(pop_subs);
                    if sg.is_wu_init_rng_required() {
                        os.line("curandStatePhilox4_32_10_t initRNG;");
                        os.line(format!("curand_init(deviceRNGSeed, 0, {}ull + lid, &initRNG);", id_start));
                        self.add_rng_func_substitutions(&mut subs, model.precision(), "&initRNG");
                    }
                    sg_dense_var_handler(os, model, sg, &subs)
                })?;
                id_start += padded;
            }

            for (sg, num_threads) in &sparse_connect_groups {
                let padded = pad_size(*num_threads, block_size);
                self.gen_init_range(os, id_start, padded, |os, pop_subs| {
                    os.line(format!("if(lid < {})", sg.src_num_neurons()));
                    os.scope(|os| {
                        let mut subs = Substitutions::with_parent(pop_subs);
                        if sg.connectivity_initialiser().is_rng_required() {
                            os.line("curandStatePhilox4_32_10_t initRNG;");
                            os.line(format!("curand_init(deviceRNGSeed, 0, {}ull + lid, &initRNG);", id_start));
                            self.add_rng_func_substitutions(&mut subs, model.precision(), "&initRNG");
                        }
                        os.line("unsigned int rowLength = 0;");
                        subs.add_var_substitution("id_pre", "lid");
                        subs.add_var_substitution("id_post_begin", "0");
                        subs.add_var_substitution("num_pre", sg.src_num_neurons().to_string());
                        subs.add_var_substitution("num_post", sg.trg_num_neurons().to_string());
                        subs.add_func_substitution(
                            "addSynapse",
                            1,
                            format!(
                                "dd_ind{}[(lid * {}) + (rowLength++)] = $(0)",
                                sg.name(),
                                sg.max_connections()
                            ),
                        );
                        sg_sparse_connect_handler(os, model, sg, &subs)?;
                        os.line(format!("dd_rowLength{}[lid] = rowLength;", sg.name()));
                        Ok::<(), CodegenError>(())
                    })
                })?;
                id_start += padded;
            }
            Ok::<(), CodegenError>(())
        })?;
        os.blank();

        // Sparse variable initialization needs the built connectivity, so it
        // runs in a second kernel after `initializeSparse` uploads any
        // host-provided state.
        if !sparse_var_groups.is_empty() {
            let sparse_block = self.kernel_block_size(Kernel::InitSparse);
            os.line("extern \"C\" __global__ void initializeSparseKernel(unsigned long long deviceRNGSeed)");
            os.scope(|os| {
                os.line("const unsigned int id = (blockIdx.x * blockDim.x) + threadIdx.x;");
                os.blank();
                let mut id_start = 0u32;
                for (sg, num_threads) in &sparse_var_groups {
                    let padded = pad_size(*num_threads, sparse_block);
                    self.gen_init_range(os, id_start, padded, |os, pop_subs| {
                        let mut subs = Substitutions::with_parent(pop_subs);
                        if sg.is_wu_init_rng_required() {
                            os.line("curandStatePhilox4_32_10_t initRNG;");
                            os.line(format!("curand_init(deviceRNGSeed, 0, {}ull + lid, &initRNG);", id_start));
                            self.add_rng_func_substitutions(&mut subs, model.precision(), "&initRNG");
                        }
                        os.line(format!("for(unsigned int r = 0; r < {}; r++)", sg.src_num_neurons()));
                        os.scope(|os| {
                            os.line(format!("if (lid < dd_rowLength{}[r])", sg.name()));
                            os.scope(|os| {
                                os.line(format!(
                                    "const unsigned int ipost = dd_ind{}[(r * {}) + lid];",
                                    sg.name(),
                                    sg.max_connections()
                                ));
                                let mut row_subs = Substitutions::with_parent(&subs);
                                row_subs.add_var_substitution("id_pre", "r");
                                row_subs.add_var_substitution("id_post", "ipost");
                                sg_sparse_var_handler(os, model, sg, &row_subs)
                            })
                        })
                    })?;
                    id_start += padded;
                }
                Ok::<(), CodegenError>(())
            })?;
            os.blank();
        }

        // Host-side entry points.
        let ng_groups: Vec<(&NeuronGroup, u32)> = model.neuron_groups().map(|ng| (ng, ng.num_neurons())).collect();
        let init_total = self.padded_total(&ng_groups, block_size)
            + self.padded_total(&dense_groups, block_size)
            + self.padded_total(&sparse_connect_groups, block_size);

        os.line("void initialize()");
        os.scope(|os| {
            if model.seed() == 0 {
                os.line("std::random_device seedSource;");
                os.line("for(int i = 0; i < 4; i++)");
                os.scope(|os| {
                    os.line("deviceRNGSeed = (deviceRNGSeed << 16) ^ seedSource();");
                    Ok::<(), CodegenError>(())
                })?;
            } else {
                os.line(format!("deviceRNGSeed = {}ull;", model.seed()));
            }
            if model.is_timing_enabled() {
                os.line("CHECK_CUDA_ERRORS(cudaEventRecord(initStart));");
            }
            self.gen_kernel_launch(os, Kernel::Init, init_total, "deviceRNGSeed");
            if model.is_timing_enabled() {
                os.line("CHECK_CUDA_ERRORS(cudaEventRecord(initStop));");
            }
            Ok::<(), CodegenError>(())
        })?;
        os.blank();

        os.line("void initializeSparse()");
        os.scope(|os| {
            // Copy host-initialised connectivity and uninitialised state to
            // the device before the device-side sparse pass consumes it.
            for sg in model.synapse_groups() {
                if matches!(sg.matrix_type().connectivity, MatrixConnectivity::Sparse)
                    && sg.connectivity_initialiser().row_build_code().is_empty()
                {
                    self.gen_variable_push(
                        os,
                        "unsigned int",
                        &format!("rowLength{}", sg.name()),
                        sg.sparse_connectivity_location(),
                        false,
                        sg.src_num_neurons(),
                    )?;
                    self.gen_variable_push(
                        os,
                        sg.sparse_ind_type(),
                        &format!("ind{}", sg.name()),
                        sg.sparse_connectivity_location(),
                        false,
                        sg.src_num_neurons() * sg.max_connections(),
                    )?;
                }
                if matches!(sg.matrix_type().connectivity, MatrixConnectivity::Sparse)
                    && sg.matrix_type().has_individual_weights()
                {
                    for (index, var) in sg.wu_snippet().vars().iter().enumerate() {
                        if sg.wu_var_initialisers()[index].code().is_empty() {
                            self.gen_variable_push(
                                os,
                                &var.ty,
                                &format!("{}{}", var.name, sg.name()),
                                sg.wu_var_location(index),
                                false,
                                sg.src_num_neurons() * sg.max_connections(),
                            )?;
                        }
                    }
                }
            }
            if !sparse_var_groups.is_empty() {
                let total = self.padded_total(&sparse_var_groups, self.kernel_block_size(Kernel::InitSparse));
                self.gen_kernel_launch(os, Kernel::InitSparse, total, "deviceRNGSeed");
            }
            Ok::<(), CodegenError>(())
        })?;
        Ok::<(), CodegenError>(())
    }

    fn gen_definitions_preamble(&self, os: &mut CodeStream, model: &Model) -> Result<()> {
        os.line("#pragma once");
        os.line("#include <cstdint>");
        os.line("#include <random>");
        os.line("#include <cuda_runtime.h>");
        os.line("#include <curand_kernel.h>");
        os.blank();
        os.line(format!("typedef {} scalar;", model.precision_str()));
        os.line(format!("#define DT {}", model.scalar_expr(model.dt())));
        if model.time_precision_str() == "float" {
            os.line("#define TIME_MAX 3.402823466e+38f");
        } else {
            os.line("#define TIME_MAX 1.7976931348623158e+308");
        }
        os.blank();
        os.line("// Bit tests for bitmask connectivity");
        os.line("#define B(x,i) ((x) & (0x80000000 >> (i)))");
        os.blank();
        os.line("#define CHECK_CUDA_ERRORS(call)                                             \\");
        os.line("{                                                                           \\");
        os.line("    cudaError_t error = call;                                               \\");
        os.line("    if (error != cudaSuccess) {                                             \\");
        os.line("        fprintf(stderr, \"cuda error %s: %s\\n\", #call,                      \\");
        os.line("                cudaGetErrorString(error));                                 \\");
        os.line("        exit(EXIT_FAILURE);                                                 \\");
        os.line("    }                                                                       \\");
        os.line("}");
        os.blank();

        if !model.precision().is_single() && self.prefs.device_capability_major < 6 {
            os.line("// Software double-precision atomic add for pre-Pascal devices");
            os.line("__device__ inline double atomicAddSW(double* address, double val)");
            os.scope(|os| {
                os.line("unsigned long long int* address_as_ull = (unsigned long long int*)address;");
                os.line("unsigned long long int old = *address_as_ull, assumed;");
                os.line("do");
                os.scope(|os| {
                    os.line("assumed = old;");
                    os.line("old = atomicCAS(address_as_ull, assumed,");
                    os.line("                __double_as_longlong(val + __longlong_as_double(assumed)));");
                    Ok::<(), CodegenError>(())
                })?;
                os.line("while (assumed != old);");
                os.line("return __longlong_as_double(old);");
                Ok::<(), CodegenError>(())
            })?;
            os.blank();
        }

        os.line("// Sampling helpers for the gennrand distribution primitives");
        if model.precision().is_single() {
            os.line("template<typename RNG>");
            os.line("__device__ inline float exponentialDistFloat(RNG *rng)");
            os.scope(|os| {
                os.line("return -logf(curand_uniform(rng));");
                Ok::<(), CodegenError>(())
            })?;
            os.line("template<typename RNG>");
            os.line("__device__ inline float gammaDistFloat(RNG *rng, float a)");
            os.scope(|os| {
                os.line("if (a > 1.0f)");
                os.scope(|os| {
                    os.line("const float d = a - (1.0f / 3.0f);");
                    os.line("const float c = (1.0f / 3.0f) / sqrtf(d);");
                    os.line("while (true)");
                    os.scope(|os| {
                        os.line("const float x = curand_normal(rng);");
                        os.line("const float v = (1.0f + (c * x)) * (1.0f + (c * x)) * (1.0f + (c * x));");
                        os.line("if (v > 0.0f)");
                        os.scope(|os| {
                            os.line("const float u = curand_uniform(rng);");
                            os.line("if (logf(u) < ((0.5f * x * x) + (d * (1.0f - v + logf(v)))))");
                            os.scope(|os| {
                                os.line("return d * v;");
                                Ok::<(), CodegenError>(())
                            })?;
                            Ok::<(), CodegenError>(())
                        })?;
                        Ok::<(), CodegenError>(())
                    })?;
                    Ok::<(), CodegenError>(())
                })?;
                os.line("const float u = curand_uniform(rng);");
                os.line("return gammaDistFloat(rng, a + 1.0f) * powf(u, 1.0f / a);");
                Ok::<(), CodegenError>(())
            })?;
            os.line("template<typename RNG>");
            os.line("__device__ inline unsigned int binomialDistFloat(RNG *rng, unsigned int n, float p)");
            os.scope(|os| {
                os.line("unsigned int count = 0;");
                os.line("for (unsigned int i = 0; i < n; i++)");
                os.scope(|os| {
                    os.line("if (curand_uniform(rng) < p)");
                    os.scope(|os| {
                        os.line("count++;");
                        Ok::<(), CodegenError>(())
                    })?;
                    Ok::<(), CodegenError>(())
                })?;
                os.line("return count;");
                Ok::<(), CodegenError>(())
            })?;
        } else {
            os.line("template<typename RNG>");
            os.line("__device__ inline double exponentialDistDouble(RNG *rng)");
            os.scope(|os| {
                os.line("return -log(curand_uniform_double(rng));");
                Ok::<(), CodegenError>(())
            })?;
            os.line("template<typename RNG>");
            os.line("__device__ inline double gammaDistDouble(RNG *rng, double a)");
            os.scope(|os| {
                os.line("if (a > 1.0)");
                os.scope(|os| {
                    os.line("const double d = a - (1.0 / 3.0);");
                    os.line("const double c = (1.0 / 3.0) / sqrt(d);");
                    os.line("while (true)");
                    os.scope(|os| {
                        os.line("const double x = curand_normal_double(rng);");
                        os.line("const double v = (1.0 + (c * x)) * (1.0 + (c * x)) * (1.0 + (c * x));");
                        os.line("if (v > 0.0)");
                        os.scope(|os| {
                            os.line("const double u = curand_uniform_double(rng);");
                            os.line("if (log(u) < ((0.5 * x * x) + (d * (1.0 - v + log(v)))))");
                            os.scope(|os| {
                                os.line("return d * v;");
                                Ok::<(), CodegenError>(())
                            })?;
                            Ok::<(), CodegenError>(())
                        })?;
                        Ok::<(), CodegenError>(())
                    })?;
                    Ok::<(), CodegenError>(())
                })?;
                os.line("const double u = curand_uniform_double(rng);");
                os.line("return gammaDistDouble(rng, a + 1.0) * pow(u, 1.0 / a);");
                Ok::<(), CodegenError>(())
            })?;
            os.line("template<typename RNG>");
            os.line("__device__ inline unsigned int binomialDistDouble(RNG *rng, unsigned int n, double p)");
            os.scope(|os| {
                os.line("unsigned int count = 0;");
                os.line("for (unsigned int i = 0; i < n; i++)");
                os.scope(|os| {
                    os.line("if (curand_uniform_double(rng) < p)");
                    os.scope(|os| {
                        os.line("count++;");
                        Ok::<(), CodegenError>(())
                    })?;
                    Ok::<(), CodegenError>(())
                })?;
                os.line("return count;");
                Ok::<(), CodegenError>(())
            })?;
        }
        os.blank();

        if model.is_timing_enabled() {
            os.line("// Timers");
            for timer in TIMER_NAMES {
                os.line(format!("extern cudaEvent_t {}Start;", timer));
                os.line(format!("extern cudaEvent_t {}Stop;", timer));
            }
        }
        Ok::<(), CodegenError>(())
    }

    fn gen_runner_preamble(&self, os: &mut CodeStream, model: &Model) -> Result<()> {
        os.line("#include <cstdio>");
        os.line("#include <cstdlib>");
        os.blank();
        if model.is_timing_enabled() {
            for timer in TIMER_NAMES {
                os.line(format!("cudaEvent_t {}Start;", timer));
                os.line(format!("cudaEvent_t {}Stop;", timer));
            }
            os.blank();
        }
        Ok::<(), CodegenError>(())
    }

    fn gen_variable_definition(
        &self,
        definitions: &mut CodeStream,
        definitions_internal: &mut CodeStream,
        ty: &str,
        name: &str,
        loc: VarLocation,
    ) -> Result<()> {
        if loc.on_host() {
            definitions.line(format!("extern {}* {};", ty, name));
        }
        if loc.on_device() {
            definitions_internal.line(format!("extern {}* d_{};", ty, name));
            definitions_internal.line(format!("extern __device__ {}* dd_{};", ty, name));
        }
        Ok::<(), CodegenError>(())
    }

    fn gen_variable_implementation(&self, os: &mut CodeStream, ty: &str, name: &str, loc: VarLocation) -> Result<()> {
        if loc.on_host() {
            os.line(format!("{}* {};", ty, name));
        }
        if loc.on_device() {
            os.line(format!("{}* d_{};", ty, name));
            os.line(format!("__device__ {}* dd_{};", ty, name));
        }
        Ok::<(), CodegenError>(())
    }

    fn gen_variable_allocation(
        &self,
        os: &mut CodeStream,
        ty: &str,
        name: &str,
        loc: VarLocation,
        count: u32,
    ) -> Result<()> {
        if loc.is_zero_copy() {
            os.line(format!(
                "CHECK_CUDA_ERRORS(cudaHostAlloc(&{}, {} * sizeof({}), cudaHostAllocMapped));",
                name, count, ty
            ));
            os.line(format!("CHECK_CUDA_ERRORS(cudaHostGetDevicePointer(&d_{}, {}, 0));", name, name));
            os.line(format!(
                "CHECK_CUDA_ERRORS(cudaMemcpyToSymbol(dd_{}, &d_{}, sizeof(d_{})));",
                name, name, name
            ));
            return Ok(());
        }
        if loc.on_host() {
            os.line(format!(
                "CHECK_CUDA_ERRORS(cudaHostAlloc(&{}, {} * sizeof({}), cudaHostAllocPortable));",
                name, count, ty
            ));
        }
        if loc.on_device() {
            os.line(format!(
                "CHECK_CUDA_ERRORS(cudaMalloc(&d_{}, {} * sizeof({})));",
                name, count, ty
            ));
            os.line(format!(
                "CHECK_CUDA_ERRORS(cudaMemcpyToSymbol(dd_{}, &d_{}, sizeof(d_{})));",
                name, name, name
            ));
        }
        Ok::<(), CodegenError>(())
    }

    fn gen_variable_free(&self, os: &mut CodeStream, name: &str, loc: VarLocation) -> Result<()> {
        if loc.on_host() || loc.is_zero_copy() {
            os.line(format!("CHECK_CUDA_ERRORS(cudaFreeHost({}));", name));
        }
        if loc.on_device() && !loc.is_zero_copy() {
            os.line(format!("CHECK_CUDA_ERRORS(cudaFree(d_{}));", name));
        }
        Ok::<(), CodegenError>(())
    }

    fn gen_variable_push(
        &self,
        os: &mut CodeStream,
        ty: &str,
        name: &str,
        loc: VarLocation,
        _autoinitialized: bool,
        count: u32,
    ) -> Result<()> {
        // Zero-copy variables share storage; there is nothing to transfer.
        if !loc.is_zero_copy() && loc.on_host() && loc.on_device() {
            os.line(format!(
                "CHECK_CUDA_ERRORS(cudaMemcpy(d_{}, {}, {} * sizeof({}), cudaMemcpyHostToDevice));",
                name, name, count, ty
            ));
        }
        Ok::<(), CodegenError>(())
    }

    fn gen_variable_pull(&self, os: &mut CodeStream, ty: &str, name: &str, loc: VarLocation, count: u32) -> Result<()> {
        if !loc.is_zero_copy() && loc.on_host() && loc.on_device() {
            os.line(format!(
                "CHECK_CUDA_ERRORS(cudaMemcpy({}, d_{}, {} * sizeof({}), cudaMemcpyDeviceToHost));",
                name, name, count, ty
            ));
        }
        Ok::<(), CodegenError>(())
    }

    fn gen_current_variable_push(
        &self,
        os: &mut CodeStream,
        _model: &Model,
        ng: &NeuronGroup,
        ty: &str,
        name: &str,
        loc: VarLocation,
    ) -> Result<()> {
        if loc.is_zero_copy() || !loc.on_host() || !loc.on_device() {
            return Ok(());
        }
        if ng.is_delay_required() {
            // Restrict the transfer to the current delay slot.
            os.line(format!(
                "CHECK_CUDA_ERRORS(cudaMemcpy(d_{} + (spkQuePtr{} * {}), {} + (spkQuePtr{} * {}), {} * sizeof({}), cudaMemcpyHostToDevice));",
                name,
                ng.name(),
                ng.num_neurons(),
                name,
                ng.name(),
                ng.num_neurons(),
                ng.num_neurons(),
                ty
            ));
        } else {
            self.gen_variable_push(os, ty, name, loc, false, ng.num_neurons())?;
        }
        Ok::<(), CodegenError>(())
    }

    fn gen_current_variable_pull(
        &self,
        os: &mut CodeStream,
        _model: &Model,
        ng: &NeuronGroup,
        ty: &str,
        name: &str,
        loc: VarLocation,
    ) -> Result<()> {
        if loc.is_zero_copy() || !loc.on_host() || !loc.on_device() {
            return Ok(());
        }
        if ng.is_delay_required() {
            os.line(format!(
                "CHECK_CUDA_ERRORS(cudaMemcpy({} + (spkQuePtr{} * {}), d_{} + (spkQuePtr{} * {}), {} * sizeof({}), cudaMemcpyDeviceToHost));",
                name,
                ng.name(),
                ng.num_neurons(),
                name,
                ng.name(),
                ng.num_neurons(),
                ng.num_neurons(),
                ty
            ));
        } else {
            self.gen_variable_pull(os, ty, name, loc, ng.num_neurons())?;
        }
        Ok::<(), CodegenError>(())
    }

    fn gen_extra_global_param_definition(
        &self,
        definitions: &mut CodeStream,
        ty: &str,
        name: &str,
        _loc: VarLocation,
    ) -> Result<()> {
        definitions.line(format!("extern {} {};", ty, name));
        if ty.ends_with('*') {
            definitions.line(format!("void allocate{}(unsigned int count);", name));
            definitions.line(format!("void push{}ToDevice(unsigned int count);", name));
            definitions.line(format!("void pull{}FromDevice(unsigned int count);", name));
        }
        Ok::<(), CodegenError>(())
    }

    fn gen_extra_global_param_implementation(
        &self,
        os: &mut CodeStream,
        ty: &str,
        name: &str,
        _loc: VarLocation,
    ) -> Result<()> {
        os.line(format!("{} {};", ty, name));
        if ty.ends_with('*') {
            os.line(format!("{} d_{};", ty, name));
            os.line(format!("__device__ {} dd_{};", ty, name));
        }
        Ok::<(), CodegenError>(())
    }

    fn gen_extra_global_param_allocation(&self, os: &mut CodeStream, ty: &str, name: &str) -> Result<()> {
        let element = Self::element_type(ty);
        os.line(format!("void allocate{}(unsigned int count)", name));
        os.scope(|os| {
            os.line(format!(
                "CHECK_CUDA_ERRORS(cudaHostAlloc(&{}, count * sizeof({}), cudaHostAllocPortable));",
                name, element
            ));
            os.line(format!(
                "CHECK_CUDA_ERRORS(cudaMalloc(&d_{}, count * sizeof({})));",
                name, element
            ));
            os.line(format!(
                "CHECK_CUDA_ERRORS(cudaMemcpyToSymbol(dd_{}, &d_{}, sizeof(d_{})));",
                name, name, name
            ));
            Ok::<(), CodegenError>(())
        })?;
        os.blank();
        Ok::<(), CodegenError>(())
    }

    fn gen_extra_global_param_push(&self, os: &mut CodeStream, ty: &str, name: &str) -> Result<()> {
        let element = Self::element_type(ty);
        os.line(format!("void push{}ToDevice(unsigned int count)", name));
        os.scope(|os| {
            os.line(format!(
                "CHECK_CUDA_ERRORS(cudaMemcpy(d_{}, {}, count * sizeof({}), cudaMemcpyHostToDevice));",
                name, name, element
            ));
            Ok::<(), CodegenError>(())
        })?;
        os.blank();
        Ok::<(), CodegenError>(())
    }

    fn gen_extra_global_param_pull(&self, os: &mut CodeStream, ty: &str, name: &str) -> Result<()> {
        let element = Self::element_type(ty);
        os.line(format!("void pull{}FromDevice(unsigned int count)", name));
        os.scope(|os| {
            os.line(format!(
                "CHECK_CUDA_ERRORS(cudaMemcpy({}, d_{}, count * sizeof({}), cudaMemcpyDeviceToHost));",
                name, name, element
            ));
            Ok::<(), CodegenError>(())
        })?;
        os.blank();
        Ok::<(), CodegenError>(())
    }

    fn gen_global_scalar(
        &self,
        definitions: &mut CodeStream,
        runner: &mut CodeStream,
        ty: &str,
        name: &str,
    ) -> Result<()> {
        definitions.line(format!("extern {} {};", ty, name));
        runner.line(format!("{} {};", ty, name));
        runner.line(format!("__device__ {} dd_{};", ty, name));
        Ok::<(), CodegenError>(())
    }

    fn gen_global_rng(
        &self,
        _definitions: &mut CodeStream,
        definitions_internal: &mut CodeStream,
        runner: &mut CodeStream,
        allocations: &mut CodeStream,
        free: &mut CodeStream,
    ) -> Result<()> {
        definitions_internal.line("extern curandStatePhilox4_32_10_t* d_rng;");
        definitions_internal.line("extern __device__ curandStatePhilox4_32_10_t* dd_rng;");
        runner.line("curandStatePhilox4_32_10_t* d_rng;");
        runner.line("__device__ curandStatePhilox4_32_10_t* dd_rng;");
        allocations.line("CHECK_CUDA_ERRORS(cudaMalloc(&d_rng, 1 * sizeof(curandStatePhilox4_32_10_t)));");
        allocations.line("CHECK_CUDA_ERRORS(cudaMemcpyToSymbol(dd_rng, &d_rng, sizeof(d_rng)));");
        free.line("CHECK_CUDA_ERRORS(cudaFree(d_rng));");
        Ok::<(), CodegenError>(())
    }

    fn gen_population_rng(
        &self,
        _definitions: &mut CodeStream,
        definitions_internal: &mut CodeStream,
        runner: &mut CodeStream,
        allocations: &mut CodeStream,
        free: &mut CodeStream,
        name: &str,
        count: u32,
    ) -> Result<()> {
        definitions_internal.line(format!("extern curandState* d_{};", name));
        definitions_internal.line(format!("extern __device__ curandState* dd_{};", name));
        runner.line(format!("curandState* d_{};", name));
        runner.line(format!("__device__ curandState* dd_{};", name));
        allocations.line(format!(
            "CHECK_CUDA_ERRORS(cudaMalloc(&d_{}, {} * sizeof(curandState)));",
            name, count
        ));
        allocations.line(format!(
            "CHECK_CUDA_ERRORS(cudaMemcpyToSymbol(dd_{}, &d_{}, sizeof(d_{})));",
            name, name, name
        ));
        free.line(format!("CHECK_CUDA_ERRORS(cudaFree(d_{}));", name));
        Ok::<(), CodegenError>(())
    }

    fn gen_pop_variable_init(
        &self,
        os: &mut CodeStream,
        _loc: VarLocation,
        subs: &Substitutions,
        handler: VarInitHandler,
    ) -> Result<()> {
        os.line("// only do this for first thread in population");
        os.line(format!("if({} == 0)", subs.required("id")?));
        os.scope(|os| handler(os, subs))
    }

    fn gen_variable_init(
        &self,
        os: &mut CodeStream,
        _loc: VarLocation,
        count: u32,
        index_var_name: &str,
        subs: &Substitutions,
        handler: VarInitHandler,
    ) -> Result<()> {
        os.line(format!("if({} < {})", subs.required(index_var_name)?, count));
        os.scope(|os| handler(os, subs))
    }

    fn gen_synapse_variable_row_init(
        &self,
        os: &mut CodeStream,
        _loc: VarLocation,
        _model: &Model,
        sg: &SynapseGroup,
        subs: &Substitutions,
        handler: VarInitHandler,
    ) -> Result<()> {
        let row_stride = match sg.matrix_type().connectivity {
            MatrixConnectivity::Dense => sg.trg_num_neurons(),
            _ => sg.max_connections(),
        };
        os.line(format!("if({} < {})", subs.required("id")?, row_stride));
        os.scope(|os| {
            let mut var_subs = Substitutions::with_parent(subs);
            var_subs.add_var_substitution(
                "id_syn",
                format!("(({} * {}) + {})", subs.required("id_pre")?, row_stride, subs.required("id")?),
            );
            if !var_subs.has_var_substitution("id_post") {
                var_subs.add_var_substitution("id_post", subs.required("id")?.to_string());
            }
            handler(os, &var_subs)
        })
    }

    fn float_atomic_add(&self, precision: ScalarPrecision) -> String {
        if precision.is_single() || self.prefs.device_capability_major >= 6 {
            "atomicAdd".to_string()
        } else {
            "atomicAddSW".to_string()
        }
    }

    fn var_prefix(&self) -> &'static str {
        "dd_"
    }

    fn gen_timer_setup(&self, allocations: &mut CodeStream, free: &mut CodeStream, _model: &Model) -> Result<()> {
        for timer in TIMER_NAMES {
            allocations.line(format!("CHECK_CUDA_ERRORS(cudaEventCreate(&{}Start));", timer));
            allocations.line(format!("CHECK_CUDA_ERRORS(cudaEventCreate(&{}Stop));", timer));
            free.line(format!("CHECK_CUDA_ERRORS(cudaEventDestroy({}Start));", timer));
            free.line(format!("CHECK_CUDA_ERRORS(cudaEventDestroy({}Stop));", timer));
        }
        Ok::<(), CodegenError>(())
    }

    fn gen_emit_true_spike(
        &self,
        os: &mut CodeStream,
        _model: &Model,
        _ng: &NeuronGroup,
        subs: &Substitutions,
    ) -> Result<()> {
        os.line("const unsigned int spkIdx = atomicAdd((unsigned int *) &shSpkCount, 1);");
        os.line(format!("shSpk[spkIdx] = {};", subs.required("id")?));
        Ok::<(), CodegenError>(())
    }

    fn gen_emit_spike_like_event(
        &self,
        os: &mut CodeStream,
        _model: &Model,
        _ng: &NeuronGroup,
        subs: &Substitutions,
    ) -> Result<()> {
        os.line("const unsigned int spkEvntIdx = atomicAdd((unsigned int *) &shSpkEvntCount, 1);");
        os.line(format!("shSpkEvnt[spkEvntIdx] = {};", subs.required("id")?));
        Ok::<(), CodegenError>(())
    }

    fn gen_makefile_fragment(&self, os: &mut CodeStream) -> Result<()> {
        os.line("NVCC := nvcc");
        os.line(format!(
            "NVCCFLAGS := -x cu -arch sm_{}0 -rdc=true -std=c++11",
            self.prefs.device_capability_major
        ));
        os.line("OBJECTS := neuronUpdate.o synapseUpdate.o init.o runner.o");
        os.blank();
        os.line("%.o: %.cc definitions.h definitionsInternal.h");
        os.line("\t$(NVCC) $(NVCCFLAGS) -c -o $@ $<");
        Ok::<(), CodegenError>(())
    }
}

impl CudaBackend {
    /// Emit one padded id range of an initialization kernel.
    fn gen_init_range<F>(&self, os: &mut CodeStream, id_start: u32, padded: u32, body: F) -> Result<()>
    where
        F: FnOnce(&mut CodeStream, &Substitutions) -> Result<()>,
    {
        if id_start == 0 {
            os.line(format!("if(id < {})", padded));
        } else {
            os.line(format!("if(id >= {} && id < {})", id_start, id_start + padded));
        }
        os.scope(|os| {
            if id_start == 0 {
                os.line("const unsigned int lid = id;");
            } else {
                os.line(format!("const unsigned int lid = id - {};", id_start));
            }
            let mut pop_subs = Substitutions::new();
            pop_subs.add_var_substitution("id", "lid");
            body(os, &pop_subs)
        })
    }
}

const TIMER_NAMES: [&str; 4] = [
    "neuronUpdate",
    "presynapticUpdate",
    "synapseDynamics",
    "init",
];

/// How each RNG primitive is realised on this target, per precision.
const RNG_FUNCTIONS: [FunctionTemplate; 6] = [
    FunctionTemplate {
        generic_name: "gennrand_uniform",
        num_arguments: 0,
        double_precision_template: "curand_uniform_double($(rng))",
        single_precision_template: "curand_uniform($(rng))",
    },
    FunctionTemplate {
        generic_name: "gennrand_normal",
        num_arguments: 0,
        double_precision_template: "curand_normal_double($(rng))",
        single_precision_template: "curand_normal($(rng))",
    },
    FunctionTemplate {
        generic_name: "gennrand_exponential",
        num_arguments: 0,
        double_precision_template: "exponentialDistDouble($(rng))",
        single_precision_template: "exponentialDistFloat($(rng))",
    },
    FunctionTemplate {
        generic_name: "gennrand_log_normal",
        num_arguments: 2,
        double_precision_template: "curand_log_normal_double($(rng), $(0), $(1))",
        single_precision_template: "curand_log_normal_float($(rng), $(0), $(1))",
    },
    FunctionTemplate {
        generic_name: "gennrand_gamma",
        num_arguments: 1,
        double_precision_template: "gammaDistDouble($(rng), $(0))",
        single_precision_template: "gammaDistFloat($(rng), $(0))",
    },
    FunctionTemplate {
        generic_name: "gennrand_binomial",
        num_arguments: 2,
        double_precision_template: "binomialDistDouble($(rng), $(0), $(1))",
        single_precision_template: "binomialDistFloat($(rng), $(0), $(1))",
    },
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_padding() {
        assert_eq!(pad_size(1, 32), 32);
        assert_eq!(pad_size(32, 32), 32);
        assert_eq!(pad_size(33, 32), 64);
        assert_eq!(ceil_divide(10, 3), 4);
    }

    #[test]
    fn test_float_atomic_add_selection() {
        let modern = CudaBackend::default();
        assert_eq!(modern.float_atomic_add(ScalarPrecision::Single), "atomicAdd");
        assert_eq!(modern.float_atomic_add(ScalarPrecision::Double), "atomicAdd");

        let kepler = CudaBackend::new(Preferences {
            device_capability_major: 3,
            ..Default::default()
        });
        assert_eq!(kepler.float_atomic_add(ScalarPrecision::Single), "atomicAdd");
        assert_eq!(kepler.float_atomic_add(ScalarPrecision::Double), "atomicAddSW");
        assert!(!kepler.supports_native_shared_atomics());
    }

    #[test]
    fn test_kernel_names() {
        assert_eq!(Kernel::NeuronUpdate.name(), "updateNeuronsKernel");
        assert_eq!(Kernel::PresynapticUpdate.name(), "presynapticUpdateKernel");
    }
}
