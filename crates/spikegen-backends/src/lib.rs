//! Backend implementations for the spikegen code generator.
//!
//! The CUDA-flavored backend is the reference implementation of the
//! [`spikegen_codegen::Backend`] contract: flat-id kernel dispatch padded per
//! population, `dd_`-prefixed device symbols, curand-based RNG plumbing and
//! the presynaptic update strategy family.

pub mod cuda;

pub use cuda::presynaptic::{select_strategy, PostSpan, PreSpan, PreSpanProcedural, PresynapticUpdateStrategy};
pub use cuda::{CudaBackend, Kernel, Preferences};
