//! Seams toward the host emulator and its code-generation pipeline.
//!
//! The control plane never talks to the emulator directly; it goes through
//! [`EmulatorBackend`] for address translation, guest memory reads and
//! execution-mode switches, and through [`CodegenPipeline`] to install the
//! taint instrumentation pass. Both are implemented by the host glue.

use core::fmt::{self, Debug, Display, Formatter};

use hashbrown::HashSet;

use crate::{config::TaintOptions, records::CallStack, GuestPhysAddr, GuestVirtAddr};

/// Failed guest memory access.
#[derive(Debug, Clone)]
pub struct MemRwError {
    pub vaddr: GuestVirtAddr,
    pub size: usize,
}

impl Display for MemRwError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cannot access {} byte(s) of guest memory at {:#x}",
            self.size, self.vaddr
        )
    }
}

impl std::error::Error for MemRwError {}

/// What the control plane needs from the host emulator.
///
/// All calls run synchronously on the emulator thread.
pub trait EmulatorBackend: Debug {
    /// Translate a guest virtual address under the current address space.
    /// `None` when the MMU has no mapping for it.
    fn virt_to_phys(&self, vaddr: GuestVirtAddr) -> Option<GuestPhysAddr>;

    /// Read guest memory at a virtual address.
    fn read_virt_mem(&self, vaddr: GuestVirtAddr, buf: &mut [u8]) -> Result<(), MemRwError>;

    /// Drop all cached translations. Stale instrumented code must not be
    /// reused after an execution-mode switch.
    fn flush_jit(&mut self);

    /// Route execution through the instrumented-code path (or back).
    fn set_instrumented_exec(&mut self, enabled: bool);

    /// Toggle physical-memory read/write interception.
    fn set_mem_interception(&mut self, enabled: bool);

    /// Toggle verbose execution tracing (debug sub-state).
    fn set_exec_trace(&mut self, enabled: bool);

    /// The active address-space identifier.
    fn current_asid(&self) -> u64;

    /// The current guest call stack, innermost frame first.
    fn call_stack(&self) -> CallStack;
}

/// Installation error of the taint instrumentation pass. Every variant is
/// fatal for the enable path: continuing would silently produce wrong taint
/// results.
#[derive(Debug, Clone)]
pub enum PipelineError {
    InstallFailed(String),
    HelperInstrumentation(String),
    VerifyFailed(String),
}

impl Display for PipelineError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::InstallFailed(msg) => {
                write!(f, "taint pass installation failed: {msg}")
            }
            PipelineError::HelperInstrumentation(msg) => {
                write!(f, "helper instrumentation failed: {msg}")
            }
            PipelineError::VerifyFailed(msg) => {
                write!(f, "instrumented code failed verification: {msg}")
            }
        }
    }
}

impl std::error::Error for PipelineError {}

/// The host's code-generation pipeline, as far as taint is concerned.
pub trait CodegenPipeline: Debug {
    /// Install the taint-tracking pass into the pipeline.
    fn install_taint_pass(&mut self, options: &TaintOptions) -> Result<(), PipelineError>;

    /// Eagerly instrument the helper routines bundled with the engine
    /// (routines not tied to a specific translation unit).
    fn instrument_helpers(&mut self) -> Result<(), PipelineError>;

    /// Check that the instrumented code representation is well-formed.
    fn verify(&self) -> Result<(), PipelineError>;
}

/// Pipeline that accepts everything. For hosts whose instrumentation is
/// wired up elsewhere, and for tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct NopPipeline;

impl CodegenPipeline for NopPipeline {
    fn install_taint_pass(&mut self, _options: &TaintOptions) -> Result<(), PipelineError> {
        Ok(())
    }

    fn instrument_helpers(&mut self) -> Result<(), PipelineError> {
        Ok(())
    }

    fn verify(&self) -> Result<(), PipelineError> {
        Ok(())
    }
}

/// Flat-memory backend: one contiguous guest buffer, identity virtual to
/// physical mapping, with individually unmappable addresses. Pairs with
/// [`crate::shadow::InMemoryShadow`] in the test suite and in embedding
/// experiments.
#[derive(Debug, Default)]
pub struct BufferBackend {
    base: GuestVirtAddr,
    mem: Vec<u8>,
    unmapped: HashSet<GuestVirtAddr>,
    asid: u64,
    call_stack: CallStack,
    pub instrumented_exec: bool,
    pub mem_interception: bool,
    pub exec_trace: bool,
    pub jit_flushes: u32,
}

impl BufferBackend {
    #[must_use]
    pub fn new(base: GuestVirtAddr, mem: Vec<u8>) -> Self {
        Self {
            base,
            mem,
            ..Self::default()
        }
    }

    /// Make translation fail for one virtual address.
    pub fn unmap(&mut self, vaddr: GuestVirtAddr) {
        self.unmapped.insert(vaddr);
    }

    pub fn set_asid(&mut self, asid: u64) {
        self.asid = asid;
    }

    pub fn set_call_stack(&mut self, call_stack: CallStack) {
        self.call_stack = call_stack;
    }

    fn contains(&self, vaddr: GuestVirtAddr) -> bool {
        vaddr
            .checked_sub(self.base)
            .is_some_and(|off| off < self.mem.len() as u64)
    }
}

impl EmulatorBackend for BufferBackend {
    fn virt_to_phys(&self, vaddr: GuestVirtAddr) -> Option<GuestPhysAddr> {
        if self.unmapped.contains(&vaddr) || !self.contains(vaddr) {
            return None;
        }
        Some(vaddr)
    }

    fn read_virt_mem(&self, vaddr: GuestVirtAddr, buf: &mut [u8]) -> Result<(), MemRwError> {
        let size = buf.len();
        for (i, byte) in buf.iter_mut().enumerate() {
            let va = vaddr.wrapping_add(i as u64);
            if self.unmapped.contains(&va) || !self.contains(va) {
                return Err(MemRwError { vaddr, size });
            }
            *byte = self.mem[(va - self.base) as usize];
        }
        Ok(())
    }

    fn flush_jit(&mut self) {
        self.jit_flushes += 1;
    }

    fn set_instrumented_exec(&mut self, enabled: bool) {
        self.instrumented_exec = enabled;
    }

    fn set_mem_interception(&mut self, enabled: bool) {
        self.mem_interception = enabled;
    }

    fn set_exec_trace(&mut self, enabled: bool) {
        self.exec_trace = enabled;
    }

    fn current_asid(&self) -> u64 {
        self.asid
    }

    fn call_stack(&self) -> CallStack {
        self.call_stack.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_backend_identity_mapping() {
        let backend = BufferBackend::new(0x1000, vec![0xaa; 16]);
        assert_eq!(backend.virt_to_phys(0x1004), Some(0x1004));
        assert_eq!(backend.virt_to_phys(0x0fff), None);
        assert_eq!(backend.virt_to_phys(0x1010), None);
    }

    #[test]
    fn read_at_address_space_end_fails_cleanly() {
        let backend = BufferBackend::new(0x1000, vec![0; 4]);
        let mut buf = [0u8; 2];
        assert!(backend.read_virt_mem(u64::MAX, &mut buf).is_err());
        assert_eq!(backend.virt_to_phys(u64::MAX), None);
    }

    #[test]
    fn unmapped_byte_fails_read() {
        let mut backend = BufferBackend::new(0x1000, vec![1, 2, 3, 4]);
        backend.unmap(0x1002);

        let mut two = [0u8; 2];
        backend.read_virt_mem(0x1000, &mut two).unwrap();
        assert_eq!(two, [1, 2]);

        let mut four = [0u8; 4];
        assert!(backend.read_virt_mem(0x1000, &mut four).is_err());
    }
}
