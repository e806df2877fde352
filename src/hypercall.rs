//! Guest hypercall protocol: labeling and querying taint from inside the
//! analyzed program.
//!
//! The guest traps with a pointer to a [`HypercallEnvelope`] in guest
//! memory. The envelope is untrusted: a bad pointer or a wrong magic value
//! means the trap belongs to something else and is ignored with a
//! diagnostic, never treated as an error. Guest-supplied lengths are only
//! honored up to the fixed caps below.

use getset::CopyGetters;
use num_enum::TryFromPrimitive;
use typed_builder::TypedBuilder;

use crate::{
    addr::TaintAddr,
    context::TaintContext,
    emu::{CodegenPipeline, EmulatorBackend},
    records::{LogRecord, QueryHypercallRecord, SrcInfo},
    GuestVirtAddr,
};

/// Protocol sentinel; envelopes with any other magic are discarded unparsed.
pub const HYPERCALL_MAGIC: u32 = 0xabcd;

/// Bound on string-mode scans and on the raw-content snippet captured into
/// query records. The extent length is guest-controlled and otherwise
/// unbounded.
pub const TAINT_QUERY_MAX_LEN: u32 = 32;

/// `len` value selecting string mode for [`HypercallAction::QueryBuffer`].
pub const LEN_STRNLEN: u32 = u32::MAX;

/// Guest-issued taint-control request codes.
///
/// Code 9 was a query-on-label action in an earlier protocol revision; it is
/// gone from the dispatch and stray 9s fall into the unknown-action path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u32)]
pub enum HypercallAction {
    /// Label every byte of a buffer with one label.
    LabelBuffer = 7,
    /// Label every byte of a buffer with consecutive positional labels.
    LabelBufferPos = 8,
    /// Query taint over a source-level extent.
    QueryBuffer = 11,
    /// Attack-point sighting; logged, no taint state touched.
    AttackPoint = 12,
    /// Handled by a cooperating plugin, not here.
    PriQuery = 13,
    /// Reserved.
    Exploitability = 14,
}

/// Fixed-layout request block read wholesale from guest memory.
///
/// All fields little-endian. Layout: `magic:u32, action:u32, buf:u64,
/// len:u32, label:u32, src_filename:u32, src_linenum:u32, src_ast_node:u32,
/// insertion_point:u32, info:u32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TypedBuilder, CopyGetters)]
#[getset(get_copy = "pub")]
pub struct HypercallEnvelope {
    #[builder(default = HYPERCALL_MAGIC)]
    magic: u32,
    action: u32,
    #[builder(default)]
    buf: GuestVirtAddr,
    #[builder(default)]
    len: u32,
    #[builder(default)]
    label: u32,
    #[builder(default)]
    src_filename: u32,
    #[builder(default)]
    src_linenum: u32,
    #[builder(default)]
    src_ast_node: u32,
    #[builder(default)]
    insertion_point: u32,
    #[builder(default)]
    info: u32,
}

impl HypercallEnvelope {
    pub const SIZE: usize = 44;

    #[must_use]
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let u32_at = |off: usize| u32::from_le_bytes(bytes[off..off + 4].try_into().unwrap());
        let u64_at = |off: usize| u64::from_le_bytes(bytes[off..off + 8].try_into().unwrap());
        Self {
            magic: u32_at(0),
            action: u32_at(4),
            buf: u64_at(8),
            len: u32_at(16),
            label: u32_at(20),
            src_filename: u32_at(24),
            src_linenum: u32_at(28),
            src_ast_node: u32_at(32),
            insertion_point: u32_at(36),
            info: u32_at(40),
        }
    }

    /// The guest-side wire form, as a cooperating guest would write it.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.magic.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.action.to_le_bytes());
        bytes[8..16].copy_from_slice(&self.buf.to_le_bytes());
        bytes[16..20].copy_from_slice(&self.len.to_le_bytes());
        bytes[20..24].copy_from_slice(&self.label.to_le_bytes());
        bytes[24..28].copy_from_slice(&self.src_filename.to_le_bytes());
        bytes[28..32].copy_from_slice(&self.src_linenum.to_le_bytes());
        bytes[32..36].copy_from_slice(&self.src_ast_node.to_le_bytes());
        bytes[36..40].copy_from_slice(&self.insertion_point.to_le_bytes());
        bytes[40..44].copy_from_slice(&self.info.to_le_bytes());
        bytes
    }

    #[must_use]
    pub fn src_info(&self) -> SrcInfo {
        SrcInfo {
            filename: self.src_filename,
            ast_node: self.src_ast_node,
            linenum: self.src_linenum,
            insertion_point: (self.insertion_point != 0).then_some(self.insertion_point),
        }
    }
}

/// Per-invocation dispatcher of guest taint-control requests. The only
/// state carried across invocations is the positional label counter.
#[derive(Debug, Default)]
pub struct HypercallHandler {
    /// Advanced by the length of every positionally-labeled buffer, so
    /// positional labels are globally unique for the process lifetime.
    /// Behavior past `u32::MAX` labeled bytes is unspecified.
    pos_label_count: u32,
}

impl HypercallHandler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn pos_label_count(&self) -> u32 {
        self.pos_label_count
    }

    /// Decode and dispatch one guest hypercall. `env_ptr` is the untrusted
    /// guest virtual address of the envelope. Never fails: anything that
    /// does not parse as ours is logged and dropped.
    pub fn handle<B, P>(&mut self, ctx: &mut TaintContext<B, P>, env_ptr: GuestVirtAddr)
    where
        B: EmulatorBackend,
        P: CodegenPipeline,
    {
        let mut bytes = [0u8; HypercallEnvelope::SIZE];
        if ctx.backend().read_virt_mem(env_ptr, &mut bytes).is_err() {
            log::warn!(
                "taint2: hypercall with unreadable envelope at {env_ptr:#x}, probably not ours"
            );
            return;
        }

        let env = HypercallEnvelope::from_bytes(&bytes);
        if env.magic() != HYPERCALL_MAGIC {
            log::warn!(
                "taint2: invalid magic {:#x} != {HYPERCALL_MAGIC:#x}, ignoring hypercall",
                env.magic()
            );
            return;
        }

        match HypercallAction::try_from(env.action()) {
            Ok(HypercallAction::LabelBuffer) => {
                Self::ensure_enabled(ctx);
                log::info!(
                    "taint2: labeling {} byte(s) at {:#x} with label {}",
                    env.len(),
                    env.buf(),
                    env.label()
                );
                // Guest pointers wrap around the end of the address space;
                // each wrapped byte still has to translate or gets skipped.
                for i in 0..u64::from(env.len()) {
                    ctx.label_virt_byte(env.buf().wrapping_add(i), env.label());
                }
            }
            Ok(HypercallAction::LabelBufferPos) => {
                Self::ensure_enabled(ctx);
                log::info!(
                    "taint2: positional labels {}..{} at {:#x}",
                    self.pos_label_count,
                    self.pos_label_count.wrapping_add(env.len()),
                    env.buf()
                );
                for i in 0..env.len() {
                    ctx.label_virt_byte(
                        env.buf().wrapping_add(u64::from(i)),
                        self.pos_label_count.wrapping_add(i),
                    );
                }
                self.pos_label_count = self.pos_label_count.wrapping_add(env.len());
            }
            Ok(HypercallAction::QueryBuffer) => Self::query_extent(ctx, &env),
            Ok(HypercallAction::AttackPoint) => {
                if ctx.has_sink() {
                    let call_stack = ctx.backend().call_stack();
                    let src = env.src_info();
                    let info = env.info();
                    if let Some(sink) = ctx.sink_mut() {
                        sink.write(LogRecord::AttackPoint {
                            info,
                            src,
                            call_stack,
                        });
                    }
                }
            }
            Ok(HypercallAction::PriQuery | HypercallAction::Exploitability) => {}
            Err(err) => {
                log::warn!("taint2: unknown hypercall action {}", err.number);
            }
        }
    }

    fn ensure_enabled<B, P>(ctx: &mut TaintContext<B, P>)
    where
        B: EmulatorBackend,
        P: CodegenPipeline,
    {
        if ctx.enabled() {
            return;
        }
        log::info!("taint2: label operation detected, enabling taint tracking");
        if let Err(err) = ctx.enable() {
            log::error!("taint2: {err}");
            std::process::exit(1);
        }
    }

    /// Taint query over a source-level extent.
    ///
    /// In string mode (`len == LEN_STRNLEN`) the scan stops at the first
    /// zero byte or after [`TAINT_QUERY_MAX_LEN`] bytes. Untainted extents
    /// produce no record at all.
    fn query_extent<B, P>(ctx: &mut TaintContext<B, P>, env: &HypercallEnvelope)
    where
        B: EmulatorBackend,
        P: CodegenPipeline,
    {
        if !ctx.has_sink() || !ctx.enabled() || ctx.num_labels_applied() == 0 {
            return;
        }

        let is_strnlen = env.len() == LEN_STRNLEN;
        if !is_strnlen && env.len() == 0 {
            return;
        }

        let mut num_tainted: u32 = 0;
        let mut offset: u32 = 0;
        loop {
            let va = env.buf().wrapping_add(u64::from(offset));
            if is_strnlen {
                let mut c = [0u8; 1];
                if ctx.backend().read_virt_mem(va, &mut c).is_err() || c[0] == 0 {
                    break;
                }
            }
            match ctx.backend().virt_to_phys(va) {
                Some(pa) => {
                    if ctx.query_ram(pa).is_some() {
                        num_tainted += 1;
                    }
                }
                None => {
                    log::warn!("taint2: skipping unmapped byte at {va:#x} in query extent");
                }
            }
            offset += 1;
            if !is_strnlen && offset == env.len() {
                break;
            }
            if is_strnlen && offset == TAINT_QUERY_MAX_LEN {
                break;
            }
        }

        let len = offset;
        if num_tainted == 0 {
            return;
        }

        // Raw content snippet, first bytes only; diagnostic, not a capture.
        let snippet_len = len.min(TAINT_QUERY_MAX_LEN);
        let mut data = vec![0u8; snippet_len as usize];
        for (i, slot) in data.iter_mut().enumerate() {
            let mut c = [0u8; 1];
            if ctx
                .backend()
                .read_virt_mem(env.buf().wrapping_add(i as u64), &mut c)
                .is_ok()
            {
                *slot = c[0];
            }
        }

        let mut queries = Vec::new();
        for offset in 0..len {
            let va = env.buf().wrapping_add(u64::from(offset));
            if let Some(pa) = ctx.backend().virt_to_phys(va) {
                if let Some(record) = ctx.build_query_record(TaintAddr::Ram(pa), offset) {
                    queries.push(record);
                }
            }
        }

        let call_stack = ctx.backend().call_stack();
        let record = LogRecord::QueryHypercall(QueryHypercallRecord {
            buf: env.buf(),
            len,
            num_tainted,
            data,
            src: env.src_info(),
            call_stack,
            queries,
        });
        if let Some(sink) = ctx.sink_mut() {
            sink.write(record);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_wire_round_trip() {
        let env = HypercallEnvelope::builder()
            .action(HypercallAction::LabelBuffer as u32)
            .buf(0x0040_2000)
            .len(16)
            .label(3)
            .src_filename(12)
            .src_linenum(77)
            .src_ast_node(5)
            .info(1)
            .build();
        let bytes = env.to_bytes();
        assert_eq!(HypercallEnvelope::from_bytes(&bytes), env);
        assert_eq!(env.magic(), HYPERCALL_MAGIC);
    }

    #[test]
    fn envelope_layout_is_fixed() {
        let env = HypercallEnvelope::builder()
            .action(11)
            .buf(0x1122_3344_5566_7788)
            .len(0xdead_beef)
            .build();
        let bytes = env.to_bytes();
        assert_eq!(&bytes[0..4], &0xabcdu32.to_le_bytes());
        assert_eq!(&bytes[4..8], &11u32.to_le_bytes());
        assert_eq!(&bytes[8..16], &0x1122_3344_5566_7788u64.to_le_bytes());
        assert_eq!(&bytes[16..20], &0xdead_beefu32.to_le_bytes());
    }

    #[test]
    fn src_info_insertion_point_optional() {
        let env = HypercallEnvelope::builder().action(12).build();
        assert_eq!(env.src_info().insertion_point, None);

        let env = HypercallEnvelope::builder()
            .action(12)
            .insertion_point(2)
            .build();
        assert_eq!(env.src_info().insertion_point, Some(2));
    }

    #[test]
    fn action_codes_decode() {
        assert_eq!(
            HypercallAction::try_from(7).unwrap(),
            HypercallAction::LabelBuffer
        );
        assert_eq!(
            HypercallAction::try_from(11).unwrap(),
            HypercallAction::QueryBuffer
        );
        // Legacy query-on-label code is gone from the protocol.
        assert!(HypercallAction::try_from(9).is_err());
        assert!(HypercallAction::try_from(10).is_err());
    }
}
