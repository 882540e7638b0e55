use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the counter orchestration engine.
#[derive(Debug, Error)]
pub enum Error {
    /// The kernel or hardware does not provide a requested feature.
    #[error("{0} is not supported on this device")]
    CapabilityUnsupported(String),

    /// The kernel rejected a constructed event attribute.
    #[error("event type '{event}' is not supported on the device: {source}")]
    AttributeInvalid { event: String, source: io::Error },

    /// Permission failure opening an event or writing a sysfs file.
    #[error("permission denied for {what}: {source}")]
    AccessDenied { what: String, source: io::Error },

    /// File descriptors, locked memory or hardware counters ran out.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// No live thread matched a monitored target by the time opens completed.
    #[error("no thread to monitor for {0}")]
    TargetGone(String),

    /// A tracepoint filter referenced an unknown field, or an address filter
    /// exceeded the ETM filter slots.
    #[error("invalid filter: {0}")]
    FilterInvalid(String),

    /// Mutually exclusive options were combined.
    #[error("conflicting options: {0}")]
    ConfigConflict(String),

    /// A read/write/mmap failed at runtime.
    #[error("I/O fault: {0}")]
    IoFault(#[from] io::Error),
}

impl Error {
    /// Classifies a failed `perf_event_open` for `event` on `(tid, cpu)`.
    pub(crate) fn from_open(event: &str, tid: libc::pid_t, cpu: i32, err: io::Error) -> Self {
        let what = format!("event '{event}' (tid {tid}, cpu {cpu})");
        match err.raw_os_error() {
            Some(libc::EMFILE) => Error::ResourceExhausted(format!(
                "too many open files while opening {what}; raise the open file limit"
            )),
            Some(libc::EACCES) | Some(libc::EPERM) => Error::AccessDenied { what, source: err },
            Some(libc::EINVAL) => Error::AttributeInvalid {
                event: event.to_string(),
                source: err,
            },
            _ => Error::IoFault(err),
        }
    }
}
