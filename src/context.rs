//! The taint context: lifecycle state machine plus the label/query/delete
//! API every other component calls through.
//!
//! The context exclusively owns the shadow-memory collaborator while
//! tracking is enabled. Enabling is synchronous; disabling is deferred to
//! the next translation-block boundary because code already scheduled for
//! instrumented execution must finish first.

use core::fmt::{self, Debug, Display, Formatter};

use crate::{
    addr::TaintAddr,
    config::TaintOptions,
    emu::{CodegenPipeline, EmulatorBackend, PipelineError},
    notify::{ChangeNotifier, TaintChangeObserver},
    records::{LogRecord, LogSink, QueryLogger, QueryResultRecord},
    shadow::{LabelSetRef, ShadowMemory},
    GuestPhysAddr, GuestVirtAddr,
};

/// Number of slots in the physical-memory access ring.
pub const TAINT_MEMLOG_SIZE: usize = 2;

/// Lifecycle of byte-level taint tracking.
///
/// `Disabled` and `Enabled` are stable. `Enabling` only exists within one
/// [`TaintContext::enable`] call; `DisablingPending` collapses to `Disabled`
/// at the next translation-block boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum LifecycleState {
    Disabled,
    Enabling,
    Enabled,
    DisablingPending,
}

/// Shadow-memory allocation failure. Fatal: there is no recovery path.
#[derive(Debug, Clone)]
pub struct ShadowAllocError(pub String);

impl Display for ShadowAllocError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "shadow memory allocation failed: {}", self.0)
    }
}

impl std::error::Error for ShadowAllocError {}

/// Failure while turning taint tracking on. Every variant is fatal; callers
/// are expected to terminate the process rather than continue with silently
/// wrong taint results.
#[derive(Debug, Clone)]
pub enum EnableError {
    ShadowAlloc(ShadowAllocError),
    Pipeline(PipelineError),
}

impl Display for EnableError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            EnableError::ShadowAlloc(err) => write!(f, "{err}"),
            EnableError::Pipeline(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for EnableError {}

impl From<ShadowAllocError> for EnableError {
    fn from(err: ShadowAllocError) -> Self {
        EnableError::ShadowAlloc(err)
    }
}

impl From<PipelineError> for EnableError {
    fn from(err: PipelineError) -> Self {
        EnableError::Pipeline(err)
    }
}

/// Fixed-size ring of recent physical-memory access addresses, fed by the
/// read/write interception hooks and drained by the instrumentation pass.
#[derive(Debug, Clone, Default)]
pub struct TaintMemlog {
    entries: [GuestPhysAddr; TAINT_MEMLOG_SIZE],
    idx: usize,
}

impl TaintMemlog {
    pub fn push(&mut self, addr: GuestPhysAddr) {
        self.idx = (self.idx + TAINT_MEMLOG_SIZE - 1) % TAINT_MEMLOG_SIZE;
        self.entries[self.idx] = addr;
    }

    /// The `n`-th most recent access, 0 being the latest.
    #[must_use]
    pub fn recent(&self, n: usize) -> GuestPhysAddr {
        self.entries[(self.idx + n) % TAINT_MEMLOG_SIZE]
    }
}

/// Allocator for the shadow-memory collaborator, supplied by the host glue.
pub type ShadowFactory = Box<dyn FnMut() -> Result<Box<dyn ShadowMemory>, ShadowAllocError>>;

/// Owner of all taint control-plane state.
pub struct TaintContext<B, P>
where
    B: EmulatorBackend,
    P: CodegenPipeline,
{
    backend: B,
    pipeline: P,
    options: TaintOptions,
    state: LifecycleState,
    shadow: Option<Box<dyn ShadowMemory>>,
    shadow_factory: ShadowFactory,
    notifier: ChangeNotifier,
    logger: QueryLogger,
    sink: Option<Box<dyn LogSink>>,
    memlog: TaintMemlog,
    pass_installed: bool,
    debug_asid: Option<u64>,
}

impl<B, P> TaintContext<B, P>
where
    B: EmulatorBackend,
    P: CodegenPipeline,
{
    pub fn new(backend: B, pipeline: P, options: TaintOptions, shadow_factory: ShadowFactory) -> Self {
        Self {
            backend,
            pipeline,
            options,
            state: LifecycleState::Disabled,
            shadow: None,
            shadow_factory,
            notifier: ChangeNotifier::new(),
            logger: QueryLogger::new(),
            sink: None,
            memlog: TaintMemlog::default(),
            pass_installed: false,
            debug_asid: None,
        }
    }

    pub fn set_log_sink(&mut self, sink: Box<dyn LogSink>) {
        self.sink = Some(sink);
    }

    #[must_use]
    pub fn has_sink(&self) -> bool {
        self.sink.is_some()
    }

    pub fn sink_mut(&mut self) -> Option<&mut (dyn LogSink + 'static)> {
        self.sink.as_deref_mut()
    }

    pub fn register_observer(&mut self, observer: Box<dyn TaintChangeObserver>) {
        self.notifier.register(observer);
    }

    /// Start delivering change notifications to registered observers.
    pub fn track_taint_state(&mut self) {
        self.notifier.arm();
    }

    #[must_use]
    pub fn state(&self) -> LifecycleState {
        self.state
    }

    #[must_use]
    pub fn enabled(&self) -> bool {
        self.state == LifecycleState::Enabled
    }

    #[must_use]
    pub fn options(&self) -> &TaintOptions {
        &self.options
    }

    #[must_use]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    #[must_use]
    pub fn memlog(&self) -> &TaintMemlog {
        &self.memlog
    }

    // -------------------------------------------------------------------
    // Lifecycle

    /// Turn taint tracking on. Idempotent while already enabled.
    ///
    /// Allocates the shadow memory, routes execution through the
    /// instrumented path, enables memory interception and, the first time,
    /// installs the taint pass into the code-generation pipeline,
    /// instruments the bundled helper routines and verifies the result.
    /// The pass stays installed for the process lifetime, even across
    /// disabled periods; only execution routing toggles after that.
    ///
    /// # Errors
    ///
    /// [`EnableError`] on shadow allocation or pipeline failure. Fatal by
    /// design: the context is not usable afterwards.
    pub fn enable(&mut self) -> Result<(), EnableError> {
        match self.state {
            LifecycleState::Enabled | LifecycleState::Enabling => return Ok(()),
            LifecycleState::DisablingPending => {
                // The shadow is still alive until the block boundary; a new
                // label request simply cancels the pending disable.
                log::info!("taint2: re-enable cancels pending disable");
                self.state = LifecycleState::Enabled;
                return Ok(());
            }
            LifecycleState::Disabled => {}
        }

        self.state = LifecycleState::Enabling;
        log::info!("taint2: enabling taint tracking");

        self.shadow = Some((self.shadow_factory)()?);

        self.backend.set_instrumented_exec(true);
        self.backend.set_mem_interception(true);

        if !self.pass_installed {
            self.pipeline.install_taint_pass(&self.options)?;
            self.pipeline.instrument_helpers()?;
            self.pipeline.verify()?;
            self.pass_installed = true;
            log::info!("taint2: instrumentation pass installed and verified");
        }

        self.state = LifecycleState::Enabled;
        Ok(())
    }

    /// Request disablement. Takes effect at the next translation-block
    /// boundary; until then queries and labels still hit the live shadow.
    pub fn request_disable(&mut self) {
        debug_assert!(
            self.enabled(),
            "disable requested while tracking is {}",
            self.state
        );
        if self.enabled() {
            self.state = LifecycleState::DisablingPending;
            log::info!("taint2: disable pending until block boundary");
        }
    }

    /// Translation-block boundary hook. The only safe point for resolving a
    /// pending disable: stop instrumented execution, flush stale
    /// translations, drop interception and tear the shadow down. Labels do
    /// not survive this; re-enabling starts from an empty shadow.
    pub fn on_block_boundary(&mut self) {
        if self.state == LifecycleState::DisablingPending {
            self.backend.set_instrumented_exec(false);
            self.backend.flush_jit();
            self.backend.set_mem_interception(false);
            self.shadow = None;
            self.state = LifecycleState::Disabled;
            log::info!("taint2: taint tracking disabled");
        }
    }

    /// Whether a dispatched block must be retranslated before it may run.
    /// True while tracking is enabled and the block carries no instrumented
    /// code yet.
    #[must_use]
    pub fn needs_retranslation(&self, block_instrumented: bool) -> bool {
        self.enabled() && !block_instrumented
    }

    /// Physical-memory access interception hook.
    pub fn on_phys_mem_access(&mut self, addr: GuestPhysAddr) {
        self.memlog.push(addr);
    }

    /// Address-space-identifier change hook. Drives the debug sub-state:
    /// verbose tracing follows the pinned identifier.
    pub fn on_asid_changed(&mut self, new_asid: u64) {
        if let Some(asid) = self.debug_asid {
            self.backend.set_exec_trace(new_asid == asid);
        }
    }

    fn start_debugging(&mut self) {
        if self.debug_asid.is_none() {
            let asid = self.backend.current_asid();
            self.debug_asid = Some(asid);
            log::info!("taint2: debug tracing pinned to asid {asid:#x}");
        }
        self.backend.set_exec_trace(true);
    }

    // -------------------------------------------------------------------
    // Label/query/delete API

    /// Mark the byte at `addr` with the singleton set `{label}`, replacing
    /// whatever was there.
    pub fn label(&mut self, addr: TaintAddr, label: u32) {
        if self.options.debug() {
            self.start_debugging();
        }
        self.shadow
            .as_deref_mut()
            .expect("taint operation while tracking is disabled")
            .label(addr, label);
        self.notifier.notify(addr.region(), addr.raw_offset(), 1);
    }

    /// The label set at `addr`, `None` when the byte is untainted.
    ///
    /// Querying while tracking is disabled is a caller bug; it asserts in
    /// debug builds and yields `None` otherwise.
    #[must_use]
    pub fn query(&self, addr: TaintAddr) -> Option<LabelSetRef> {
        debug_assert!(self.shadow.is_some(), "taint query while tracking is disabled");
        self.shadow.as_deref().and_then(|shadow| shadow.query(addr))
    }

    /// Taint-compute-number at `addr`, without materializing the label set.
    /// Same disabled-call contract as [`TaintContext::query`], yielding 0.
    #[must_use]
    pub fn query_tcn(&self, addr: TaintAddr) -> u32 {
        debug_assert!(self.shadow.is_some(), "taint query while tracking is disabled");
        self.shadow.as_deref().map_or(0, |shadow| shadow.query_tcn(addr))
    }

    /// Clear the labeling at `addr`.
    pub fn delete(&mut self, addr: TaintAddr) {
        self.shadow
            .as_deref_mut()
            .expect("taint operation while tracking is disabled")
            .delete(addr);
        self.notifier.notify(addr.region(), addr.raw_offset(), 1);
    }

    #[must_use]
    pub fn num_labels_applied(&self) -> u32 {
        self.shadow.as_deref().map_or(0, ShadowMemory::num_labels_applied)
    }

    pub fn label_ram(&mut self, pa: GuestPhysAddr, label: u32) {
        self.label(TaintAddr::Ram(pa), label);
    }

    #[must_use]
    pub fn query_ram(&self, pa: GuestPhysAddr) -> Option<LabelSetRef> {
        self.query(TaintAddr::Ram(pa))
    }

    pub fn delete_ram(&mut self, pa: GuestPhysAddr) {
        self.delete(TaintAddr::Ram(pa));
    }

    /// Label one byte behind a guest virtual address, translating it first.
    /// Emits a [`LogRecord::LabelEvent`] when a sink is attached. Returns
    /// false (and leaves the byte alone) when translation fails.
    pub fn label_virt_byte(&mut self, vaddr: GuestVirtAddr, label: u32) -> bool {
        let Some(pa) = self.backend.virt_to_phys(vaddr) else {
            log::warn!("taint2: cannot label {vaddr:#x}: no virt-to-phys mapping");
            return false;
        };
        if let Some(sink) = self.sink.as_deref_mut() {
            sink.write(LogRecord::LabelEvent {
                vaddr,
                paddr: pa,
                label,
            });
        }
        self.label(TaintAddr::Ram(pa), label);
        true
    }

    /// Query `addr` through the deduplicating log path without emitting the
    /// per-byte record; the caller bundles it. `None` when the byte is
    /// untainted or no sink is attached.
    pub fn build_query_record(&mut self, addr: TaintAddr, offset: u32) -> Option<QueryResultRecord> {
        let Self {
            shadow,
            sink,
            logger,
            ..
        } = self;
        let shadow = shadow.as_deref()?;
        let set = shadow.query(addr)?;
        let tcn = shadow.query_tcn(addr);
        let sink = sink.as_deref_mut()?;
        Some(logger.build_query(&set, tcn, offset, sink))
    }

    /// Query `addr` through the deduplicating log path and write the
    /// per-byte record to the sink. Returns whether anything was written.
    pub fn log_query_at(&mut self, addr: TaintAddr, offset: u32) -> bool {
        match self.build_query_record(addr, offset) {
            Some(record) => {
                if let Some(sink) = self.sink.as_deref_mut() {
                    sink.write(LogRecord::QueryResult(record));
                }
                true
            }
            None => false,
        }
    }
}

impl<B, P> Debug for TaintContext<B, P>
where
    B: EmulatorBackend,
    P: CodegenPipeline,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaintContext")
            .field("state", &self.state)
            .field("shadow", &self.shadow)
            .field("pass_installed", &self.pass_installed)
            .field("debug_asid", &self.debug_asid)
            .finish_non_exhaustive()
    }
}
