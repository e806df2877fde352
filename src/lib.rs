//! Control plane for byte-granular dynamic taint analysis embedded in a
//! whole-system emulator.
//!
//! The crate tracks which guest memory and register bytes carry
//! analyst-assigned labels, exposes a label/query/delete API over an
//! external shadow-memory engine, and decodes a guest hypercall protocol
//! for injecting labels and querying taint from inside the analyzed
//! program. Taint propagation itself lives in the instrumentation pass
//! behind [`emu::CodegenPipeline`]; the shadow storage engine lives behind
//! [`shadow::ShadowMemory`].
//!
//! The execution model is single-threaded and cooperative: the emulator's
//! main loop drives translation, instrumented execution and hypercall
//! handling, and lifecycle transitions only resolve at translation-block
//! boundaries.

pub mod addr;
pub mod config;
pub mod context;
pub mod emu;
pub mod hypercall;
pub mod notify;
pub mod records;
pub mod shadow;

/// A guest virtual address.
pub type GuestVirtAddr = u64;
/// A guest physical address.
pub type GuestPhysAddr = u64;
/// Index of a guest or IR scratch register.
pub type GuestRegIdx = u64;

pub use addr::{TaintAddr, TaintRegion};
pub use config::{Granularity, LabelMode, TaintOptions};
pub use context::{EnableError, LifecycleState, ShadowAllocError, TaintContext, TaintMemlog};
pub use emu::{BufferBackend, CodegenPipeline, EmulatorBackend, NopPipeline, PipelineError};
pub use hypercall::{
    HypercallAction, HypercallEnvelope, HypercallHandler, HYPERCALL_MAGIC, TAINT_QUERY_MAX_LEN,
};
pub use notify::{ChangeNotifier, TaintChangeObserver};
pub use records::{LogRecord, LogSink, QueryLogger, QueryResultRecord, SrcInfo, VecSink};
pub use shadow::{InMemoryShadow, LabelSetRef, ShadowMemory};
