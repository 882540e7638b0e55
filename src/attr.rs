//! Construction of kernel event attributes from resolved event types.

use crate::event::EventType;
use crate::ffi::{bindings as b, Attr};

pub const DEFAULT_SAMPLE_FREQ_FOR_NONTRACEPOINT_EVENT: u64 = 4000;
pub const DEFAULT_SAMPLE_PERIOD_FOR_TRACEPOINT_EVENT: u64 = 1;

/// A period no session will ever reach, used to silence sampling on counters
/// that only exist to be read in group snapshots.
pub const INFINITE_SAMPLE_PERIOD: u64 = 1 << 62;

/// The attribute every selection starts from: the event type's codes plus the
/// session-independent sample and read formats. Construction is deterministic;
/// all later adjustments are made by the selection set.
pub fn default_attr(event_type: &EventType) -> Attr {
    let mut attr = Attr::new();
    attr.type_ = event_type.type_;
    attr.config = event_type.config;
    attr.sample_type =
        b::PERF_SAMPLE_IP | b::PERF_SAMPLE_TID | b::PERF_SAMPLE_TIME | b::PERF_SAMPLE_PERIOD;
    attr.read_format =
        b::PERF_FORMAT_TOTAL_TIME_ENABLED | b::PERF_FORMAT_TOTAL_TIME_RUNNING | b::PERF_FORMAT_ID;
    attr.set_flag(b::ATTR_FLAG_FREQ, true);
    attr.sample_period_or_freq = DEFAULT_SAMPLE_FREQ_FOR_NONTRACEPOINT_EVENT;
    attr
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::find_event_type;

    #[test]
    fn default_attr_is_deterministic() {
        let ty = find_event_type("instructions").unwrap();
        let attr = default_attr(&ty);
        assert_eq!(attr, default_attr(&ty));
        assert_eq!(attr.type_, b::PERF_TYPE_HARDWARE);
        assert_eq!(attr.config, b::PERF_COUNT_HW_INSTRUCTIONS);
        assert!(attr.flag(b::ATTR_FLAG_FREQ));
        assert!(!attr.flag(b::ATTR_FLAG_DISABLED));
        assert_eq!(attr.size as usize, size_of::<Attr>());
        assert_ne!(attr.read_format & b::PERF_FORMAT_ID, 0);
    }
}
