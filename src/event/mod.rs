//! Event types and the name registry.
//!
//! An event is addressed by a name like `cpu-cycles`, `sched:sched_switch` or
//! `r11`, optionally suffixed with modifiers (`branch-misses:u`). Hardware,
//! software and cache events come from a compile-time table; PMU events
//! (including the ETM instruction-trace device) are enumerated from sysfs at
//! first use; tracepoints and raw events are resolved on demand.

use std::sync::OnceLock;

use crate::error::{Error, Result};
use crate::ffi::bindings as b;

pub mod pmu;
pub mod tracepoint;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Category {
    Hardware,
    Software,
    Cache,
    Tracepoint,
    Raw,
    /// Kernel-advertised PMU event from `/sys/bus/event_source`.
    Pmu,
    /// Instruction-trace PMU (produces AUX data, not samples).
    Etm,
}

#[derive(Clone, Debug)]
pub struct EventType {
    pub name: String,
    pub category: Category,
    pub type_: u32,
    pub config: u64,
}

impl EventType {
    fn new(name: impl Into<String>, category: Category, type_: u32, config: u64) -> Self {
        Self {
            name: name.into(),
            category,
            type_,
            config,
        }
    }

    /// Events provided by the kernel itself (sysfs PMUs). These are assumed
    /// supported and skip the throwaway-open probe.
    pub fn is_pmu_event(&self) -> bool {
        matches!(self.category, Category::Pmu | Category::Etm)
    }

    pub fn is_etm_event(&self) -> bool {
        self.category == Category::Etm
    }

    /// Whether the event occupies a hardware counter slot, for the
    /// multiplexing check.
    pub fn is_hardware_event(&self) -> bool {
        matches!(
            self.type_,
            b::PERF_TYPE_HARDWARE | b::PERF_TYPE_HW_CACHE | b::PERF_TYPE_RAW
        ) || self.category == Category::Pmu
    }

    /// The allowed-CPU mask of the owning PMU, when it advertises one.
    pub fn pmu_cpumask(&self) -> Vec<i32> {
        if !self.is_pmu_event() {
            return vec![];
        }
        pmu::cpumask_of_type(self.type_)
    }
}

/// An event type plus the privilege/precision modifiers parsed from its
/// `:u`-style suffix.
#[derive(Clone, Debug)]
pub struct EventSpec {
    pub event_type: EventType,
    /// Normalized `type:modifier` name; unique across a selection set.
    pub name: String,
    /// The bare modifier characters (`"u"`, `"k"`, `""`, ...).
    pub modifier: String,
    pub exclude_user: bool,
    pub exclude_kernel: bool,
    pub exclude_hv: bool,
    pub exclude_host: bool,
    pub exclude_guest: bool,
    pub precise_ip: u8,
}

/// Parses `name[:modifiers]` against the registry.
///
/// A tracepoint name contains a `:` itself, so the full string is tried as an
/// event name before splitting off a modifier suffix.
pub fn parse_event_spec(s: &str) -> Result<EventSpec> {
    let (type_name, modifier) = match find_event_type(s) {
        Some(_) => (s, ""),
        None => match s.rsplit_once(':') {
            Some((name, modifier)) => (name, modifier),
            None => (s, ""),
        },
    };
    let event_type = find_event_type(type_name)
        .ok_or_else(|| Error::CapabilityUnsupported(format!("unknown event type '{type_name}'")))?;

    let mut user_mode = false;
    let mut kernel_mode = false;
    let mut exclude_hv = false;
    let mut exclude_host = false;
    let mut exclude_guest = false;
    let mut precise_ip: u8 = 0;
    for c in modifier.chars() {
        match c {
            'u' => user_mode = true,
            'k' => kernel_mode = true,
            'h' => exclude_hv = true,
            'G' => exclude_host = true,
            'H' => exclude_guest = true,
            'p' => {
                precise_ip = precise_ip.saturating_add(1);
                if precise_ip > 3 {
                    return Err(Error::ConfigConflict(format!(
                        "too many 'p' modifiers in '{s}'"
                    )));
                }
            }
            _ => {
                return Err(Error::ConfigConflict(format!(
                    "unknown modifier '{c}' in '{s}'"
                )));
            }
        }
    }
    let exclude_kernel = user_mode && !kernel_mode;
    let exclude_user = kernel_mode && !user_mode;

    let name = if modifier.is_empty() {
        event_type.name.clone()
    } else {
        format!("{}:{}", event_type.name, modifier)
    };
    Ok(EventSpec {
        event_type,
        name,
        modifier: modifier.to_string(),
        exclude_user,
        exclude_kernel,
        exclude_hv,
        exclude_host,
        exclude_guest,
        precise_ip,
    })
}

/// Resolves an event name against the built-in tables, the sysfs PMU
/// registry, tracepoints and `rN` raw syntax.
pub fn find_event_type(name: &str) -> Option<EventType> {
    if let Some(ty) = builtin_types().iter().find(|t| t.name == name) {
        return Some(ty.clone());
    }
    if let Some(ty) = pmu::find_pmu_event_type(name) {
        return Some(ty);
    }
    if let Some(config) = parse_raw_event_name(name) {
        return Some(EventType::new(name, Category::Raw, b::PERF_TYPE_RAW, config));
    }
    if let Some((subsys, tp_name)) = name.split_once(':') {
        if !tp_name.contains(':') {
            return tracepoint::find_tracepoint(subsys, tp_name).ok();
        }
    }
    None
}

// Raw PMU events use the `rN` format with a hex event number, e.g. `r1b`.
fn parse_raw_event_name(name: &str) -> Option<u64> {
    let hex = name.strip_prefix('r')?;
    if hex.is_empty() || !hex.bytes().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    u64::from_str_radix(hex, 16).ok()
}

fn builtin_types() -> &'static [EventType] {
    static TYPES: OnceLock<Vec<EventType>> = OnceLock::new();
    TYPES.get_or_init(|| {
        let mut types = Vec::new();

        let hw = [
            ("cpu-cycles", b::PERF_COUNT_HW_CPU_CYCLES),
            ("instructions", b::PERF_COUNT_HW_INSTRUCTIONS),
            ("cache-references", b::PERF_COUNT_HW_CACHE_REFERENCES),
            ("cache-misses", b::PERF_COUNT_HW_CACHE_MISSES),
            ("branch-instructions", b::PERF_COUNT_HW_BRANCH_INSTRUCTIONS),
            ("branch-misses", b::PERF_COUNT_HW_BRANCH_MISSES),
            ("bus-cycles", b::PERF_COUNT_HW_BUS_CYCLES),
            (
                "stalled-cycles-frontend",
                b::PERF_COUNT_HW_STALLED_CYCLES_FRONTEND,
            ),
            (
                "stalled-cycles-backend",
                b::PERF_COUNT_HW_STALLED_CYCLES_BACKEND,
            ),
            ("ref-cycles", b::PERF_COUNT_HW_REF_CPU_CYCLES),
        ];
        for (name, config) in hw {
            types.push(EventType::new(
                name,
                Category::Hardware,
                b::PERF_TYPE_HARDWARE,
                config,
            ));
        }

        let sw = [
            ("cpu-clock", b::PERF_COUNT_SW_CPU_CLOCK),
            ("task-clock", b::PERF_COUNT_SW_TASK_CLOCK),
            ("page-faults", b::PERF_COUNT_SW_PAGE_FAULTS),
            ("context-switches", b::PERF_COUNT_SW_CONTEXT_SWITCHES),
            ("cpu-migrations", b::PERF_COUNT_SW_CPU_MIGRATIONS),
            ("minor-faults", b::PERF_COUNT_SW_PAGE_FAULTS_MIN),
            ("major-faults", b::PERF_COUNT_SW_PAGE_FAULTS_MAJ),
            ("alignment-faults", b::PERF_COUNT_SW_ALIGNMENT_FAULTS),
            ("emulation-faults", b::PERF_COUNT_SW_EMULATION_FAULTS),
        ];
        for (name, config) in sw {
            types.push(EventType::new(
                name,
                Category::Software,
                b::PERF_TYPE_SOFTWARE,
                config,
            ));
        }

        let caches = [
            ("L1-dcache", b::PERF_COUNT_HW_CACHE_L1D),
            ("L1-icache", b::PERF_COUNT_HW_CACHE_L1I),
            ("LLC", b::PERF_COUNT_HW_CACHE_LL),
            ("dTLB", b::PERF_COUNT_HW_CACHE_DTLB),
            ("iTLB", b::PERF_COUNT_HW_CACHE_ITLB),
            ("branch", b::PERF_COUNT_HW_CACHE_BPU),
            ("node", b::PERF_COUNT_HW_CACHE_NODE),
        ];
        let ops = [
            ("load", b::PERF_COUNT_HW_CACHE_OP_READ),
            ("store", b::PERF_COUNT_HW_CACHE_OP_WRITE),
            ("prefetch", b::PERF_COUNT_HW_CACHE_OP_PREFETCH),
        ];
        for (cache, id) in caches {
            for (op, op_id) in ops {
                let access_config = id | (op_id << 8) | (b::PERF_COUNT_HW_CACHE_RESULT_ACCESS << 16);
                let miss_config = id | (op_id << 8) | (b::PERF_COUNT_HW_CACHE_RESULT_MISS << 16);
                types.push(EventType::new(
                    format!("{cache}-{op}s"),
                    Category::Cache,
                    b::PERF_TYPE_HW_CACHE,
                    access_config,
                ));
                types.push(EventType::new(
                    format!("{cache}-{op}-misses"),
                    Category::Cache,
                    b::PERF_TYPE_HW_CACHE,
                    miss_config,
                ));
            }
        }

        types
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_lookup() {
        let ty = find_event_type("cpu-cycles").unwrap();
        assert_eq!(ty.type_, b::PERF_TYPE_HARDWARE);
        assert_eq!(ty.config, b::PERF_COUNT_HW_CPU_CYCLES);
        assert_eq!(ty.category, Category::Hardware);

        let ty = find_event_type("task-clock").unwrap();
        assert_eq!(ty.type_, b::PERF_TYPE_SOFTWARE);
        assert_eq!(ty.config, b::PERF_COUNT_SW_TASK_CLOCK);
    }

    #[test]
    fn cache_event_config_encoding() {
        let ty = find_event_type("L1-dcache-load-misses").unwrap();
        assert_eq!(ty.type_, b::PERF_TYPE_HW_CACHE);
        assert_eq!(
            ty.config,
            b::PERF_COUNT_HW_CACHE_L1D
                | (b::PERF_COUNT_HW_CACHE_OP_READ << 8)
                | (b::PERF_COUNT_HW_CACHE_RESULT_MISS << 16)
        );
        assert!(ty.is_hardware_event());
    }

    #[test]
    fn raw_event_syntax() {
        let ty = find_event_type("r1b").unwrap();
        assert_eq!(ty.type_, b::PERF_TYPE_RAW);
        assert_eq!(ty.config, 0x1b);
        assert!(find_event_type("rxyz").is_none());
        assert!(find_event_type("r").is_none());
    }

    #[test]
    fn modifier_parsing() {
        let spec = parse_event_spec("branch-misses:u").unwrap();
        assert_eq!(spec.name, "branch-misses:u");
        assert_eq!(spec.modifier, "u");
        assert!(spec.exclude_kernel);
        assert!(!spec.exclude_user);

        let spec = parse_event_spec("cpu-cycles:k").unwrap();
        assert!(spec.exclude_user);
        assert!(!spec.exclude_kernel);

        let spec = parse_event_spec("cpu-cycles:uk").unwrap();
        assert!(!spec.exclude_user);
        assert!(!spec.exclude_kernel);

        let spec = parse_event_spec("cpu-cycles:upp").unwrap();
        assert_eq!(spec.precise_ip, 2);

        assert!(parse_event_spec("cpu-cycles:z").is_err());
        assert!(parse_event_spec("no-such-event").is_err());
    }
}
