//! Log records emitted by the control plane and the label-set deduplicator.
//!
//! The sink (serialization, persistence) is a collaborator behind
//! [`LogSink`]; this module only builds records. Label-set contents are
//! expensive to re-serialize and frequently re-queried, so [`QueryLogger`]
//! writes the full membership of each distinct set exactly once and every
//! later record back-references it by its opaque id.

use core::fmt::Debug;

use hashbrown::HashSet;
use serde::{Deserialize, Serialize};

use crate::{
    shadow::LabelSetRef,
    GuestPhysAddr, GuestVirtAddr,
};

/// Upper bound on labels staged for a single unique-set record.
pub const MAX_QUERY_LABELS: usize = 1_000_000;

/// Guest source-location context carried by query and attack-point records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SrcInfo {
    pub filename: u32,
    pub ast_node: u32,
    pub linenum: u32,
    pub insertion_point: Option<u32>,
}

/// Return addresses of the guest call stack, innermost first. Acquisition is
/// delegated to the emulator backend.
pub type CallStack = Vec<u64>;

/// Result of querying taint on one byte.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryResultRecord {
    /// Back-reference to a previously emitted [`LogRecord::UniqueLabelSet`].
    pub ptr: u64,
    /// Taint-compute-number of the byte.
    pub tcn: u32,
    /// Offset of the byte within the extent that was queried.
    pub offset: u32,
}

/// Aggregate record for a guest-initiated extent query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryHypercallRecord {
    pub buf: GuestVirtAddr,
    pub len: u32,
    pub num_tainted: u32,
    /// Raw content snippet, capped at the fixed query length bound.
    pub data: Vec<u8>,
    pub src: SrcInfo,
    pub call_stack: CallStack,
    pub queries: Vec<QueryResultRecord>,
}

/// Everything the control plane hands to the log sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogRecord {
    /// Full membership of a label set, written at most once per distinct set.
    UniqueLabelSet { ptr: u64, labels: Vec<u32> },
    QueryResult(QueryResultRecord),
    QueryHypercall(QueryHypercallRecord),
    AttackPoint {
        info: u32,
        src: SrcInfo,
        call_stack: CallStack,
    },
    /// One byte was labeled.
    LabelEvent {
        vaddr: GuestVirtAddr,
        paddr: GuestPhysAddr,
        label: u32,
    },
}

/// Record consumer. Serialization and persistence live behind this seam.
pub trait LogSink: Debug {
    fn write(&mut self, record: LogRecord);
}

/// Sink collecting records in memory, mostly for tests.
#[derive(Debug, Default)]
pub struct VecSink {
    pub records: Vec<LogRecord>,
}

impl VecSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl LogSink for VecSink {
    fn write(&mut self, record: LogRecord) {
        self.records.push(record);
    }
}

/// Deduplicating producer of query records.
///
/// Membership of the dedup set only grows; once a set has been written it is
/// never written again for the remainder of the process.
#[derive(Debug, Default)]
pub struct QueryLogger {
    returned: HashSet<LabelSetRef>,
}

impl QueryLogger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the per-byte query record for `set`, writing the unique-set
    /// record to `sink` first if this set has never been logged.
    ///
    /// The caller decides whether the returned record goes straight to the
    /// sink or gets bundled into an aggregate record.
    pub fn build_query(
        &mut self,
        set: &LabelSetRef,
        tcn: u32,
        offset: u32,
        sink: &mut dyn LogSink,
    ) -> QueryResultRecord {
        if self.returned.insert(set.clone()) {
            let cardinality = set.cardinality() as usize;
            assert!(
                cardinality <= MAX_QUERY_LABELS,
                "label set of {cardinality} overflows the staging bound"
            );
            let labels: Vec<u32> = set.labels().collect();
            sink.write(LogRecord::UniqueLabelSet {
                ptr: set.id(),
                labels,
            });
        }
        QueryResultRecord {
            ptr: set.id(),
            tcn,
            offset,
        }
    }

    /// Build the query record for `set` and write it to the sink.
    pub fn log_query(
        &mut self,
        set: &LabelSetRef,
        tcn: u32,
        offset: u32,
        sink: &mut dyn LogSink,
    ) {
        let record = self.build_query(set, tcn, offset, sink);
        sink.write(LogRecord::QueryResult(record));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{addr::TaintAddr, shadow::{InMemoryShadow, ShadowMemory}};

    fn tainted_set(label: u32) -> (InMemoryShadow, LabelSetRef) {
        let mut shadow = InMemoryShadow::new();
        shadow.label(TaintAddr::Ram(0x100), label);
        let set = shadow.query(TaintAddr::Ram(0x100)).unwrap();
        (shadow, set)
    }

    #[test]
    fn unique_set_written_once() {
        let (_shadow, set) = tainted_set(9);
        let mut logger = QueryLogger::new();
        let mut sink = VecSink::new();

        for offset in 0..4 {
            logger.log_query(&set, 0, offset, &mut sink);
        }

        let unique: Vec<_> = sink
            .records
            .iter()
            .filter(|r| matches!(r, LogRecord::UniqueLabelSet { .. }))
            .collect();
        assert_eq!(unique.len(), 1);
        assert_eq!(
            *unique[0],
            LogRecord::UniqueLabelSet {
                ptr: set.id(),
                labels: vec![9]
            }
        );

        let queries: Vec<_> = sink
            .records
            .iter()
            .filter(|r| matches!(r, LogRecord::QueryResult(_)))
            .collect();
        assert_eq!(queries.len(), 4);
    }

    #[test]
    fn distinct_sets_each_written() {
        let mut shadow = InMemoryShadow::new();
        shadow.label(TaintAddr::Ram(0), 1);
        shadow.label(TaintAddr::Ram(1), 2);
        let a = shadow.query(TaintAddr::Ram(0)).unwrap();
        let b = shadow.query(TaintAddr::Ram(1)).unwrap();

        let mut logger = QueryLogger::new();
        let mut sink = VecSink::new();
        logger.log_query(&a, 0, 0, &mut sink);
        logger.log_query(&b, 0, 1, &mut sink);

        let unique = sink
            .records
            .iter()
            .filter(|r| matches!(r, LogRecord::UniqueLabelSet { .. }))
            .count();
        assert_eq!(unique, 2);
    }

    #[test]
    fn query_record_back_references_set() {
        let (_shadow, set) = tainted_set(3);
        let mut logger = QueryLogger::new();
        let mut sink = VecSink::new();
        logger.log_query(&set, 2, 7, &mut sink);

        match &sink.records[1] {
            LogRecord::QueryResult(q) => {
                assert_eq!(q.ptr, set.id());
                assert_eq!(q.tcn, 2);
                assert_eq!(q.offset, 7);
            }
            other => panic!("unexpected record {other:?}"),
        }
    }

    #[test]
    fn records_serialize() {
        let record = LogRecord::LabelEvent {
            vaddr: 0x4000,
            paddr: 0x2000,
            label: 5,
        };
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("LabelEvent"));
        let back: LogRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }
}
