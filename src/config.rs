//! Configuration of the taint engine.
//!
//! Option parsing belongs to the host glue; this is the typed form the
//! control plane and the instrumentation pass consume.

use getset::CopyGetters;
use typed_builder::TypedBuilder;

/// How labels are stored per byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "lowercase")]
pub enum LabelMode {
    /// Full label sets per byte.
    Full,
    /// Present/absent bit per byte.
    Binary,
}

/// Tracking granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Granularity {
    Byte,
    Word,
}

/// Taint engine options.
///
/// The host's `no_tp`, `inline`, `binary`, `word`, `opt` and `debug` flags
/// map onto these fields; `no_tp` inverts [`tainted_pointer`], all other
/// flags set their field directly.
///
/// [`tainted_pointer`]: TaintOptions::tainted_pointer
#[derive(Debug, Clone, TypedBuilder, CopyGetters)]
pub struct TaintOptions {
    /// Propagate taint through pointer dereference.
    #[builder(default = true)]
    #[getset(get_copy = "pub")]
    tainted_pointer: bool,

    /// Inline taint operations into generated code instead of calling out.
    #[builder(default = false)]
    #[getset(get_copy = "pub")]
    inline_ops: bool,

    #[builder(default = LabelMode::Full)]
    #[getset(get_copy = "pub")]
    label_mode: LabelMode,

    #[builder(default = Granularity::Byte)]
    #[getset(get_copy = "pub")]
    granularity: Granularity,

    /// Run the standard optimization pipeline over generated taint code.
    #[builder(default = true)]
    #[getset(get_copy = "pub")]
    optimize: bool,

    /// Address-space-scoped verbose tracing.
    #[builder(default = false)]
    #[getset(get_copy = "pub")]
    debug: bool,
}

impl Default for TaintOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let options = TaintOptions::default();
        assert!(options.tainted_pointer());
        assert!(!options.inline_ops());
        assert_eq!(options.label_mode(), LabelMode::Full);
        assert_eq!(options.granularity(), Granularity::Byte);
        assert!(options.optimize());
        assert!(!options.debug());
    }

    #[test]
    fn builder_overrides() {
        let options = TaintOptions::builder()
            .tainted_pointer(false)
            .label_mode(LabelMode::Binary)
            .granularity(Granularity::Word)
            .debug(true)
            .build();
        assert!(!options.tainted_pointer());
        assert_eq!(options.label_mode().to_string(), "binary");
        assert_eq!(options.granularity().to_string(), "word");
        assert!(options.debug());
    }
}
