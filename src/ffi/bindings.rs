//! Hand-maintained bindings for the `perf_event_open` uapi surface this crate
//! touches. The struct layouts mirror `include/uapi/linux/perf_event.h`; the
//! attribute bitfield is kept as a flat `flags` word plus bit constants.

pub const PERF_TYPE_HARDWARE: u32 = 0;
pub const PERF_TYPE_SOFTWARE: u32 = 1;
pub const PERF_TYPE_TRACEPOINT: u32 = 2;
pub const PERF_TYPE_HW_CACHE: u32 = 3;
pub const PERF_TYPE_RAW: u32 = 4;

pub const PERF_COUNT_HW_CPU_CYCLES: u64 = 0;
pub const PERF_COUNT_HW_INSTRUCTIONS: u64 = 1;
pub const PERF_COUNT_HW_CACHE_REFERENCES: u64 = 2;
pub const PERF_COUNT_HW_CACHE_MISSES: u64 = 3;
pub const PERF_COUNT_HW_BRANCH_INSTRUCTIONS: u64 = 4;
pub const PERF_COUNT_HW_BRANCH_MISSES: u64 = 5;
pub const PERF_COUNT_HW_BUS_CYCLES: u64 = 6;
pub const PERF_COUNT_HW_STALLED_CYCLES_FRONTEND: u64 = 7;
pub const PERF_COUNT_HW_STALLED_CYCLES_BACKEND: u64 = 8;
pub const PERF_COUNT_HW_REF_CPU_CYCLES: u64 = 9;

pub const PERF_COUNT_SW_CPU_CLOCK: u64 = 0;
pub const PERF_COUNT_SW_TASK_CLOCK: u64 = 1;
pub const PERF_COUNT_SW_PAGE_FAULTS: u64 = 2;
pub const PERF_COUNT_SW_CONTEXT_SWITCHES: u64 = 3;
pub const PERF_COUNT_SW_CPU_MIGRATIONS: u64 = 4;
pub const PERF_COUNT_SW_PAGE_FAULTS_MIN: u64 = 5;
pub const PERF_COUNT_SW_PAGE_FAULTS_MAJ: u64 = 6;
pub const PERF_COUNT_SW_ALIGNMENT_FAULTS: u64 = 7;
pub const PERF_COUNT_SW_EMULATION_FAULTS: u64 = 8;

pub const PERF_COUNT_HW_CACHE_L1D: u64 = 0;
pub const PERF_COUNT_HW_CACHE_L1I: u64 = 1;
pub const PERF_COUNT_HW_CACHE_LL: u64 = 2;
pub const PERF_COUNT_HW_CACHE_DTLB: u64 = 3;
pub const PERF_COUNT_HW_CACHE_ITLB: u64 = 4;
pub const PERF_COUNT_HW_CACHE_BPU: u64 = 5;
pub const PERF_COUNT_HW_CACHE_NODE: u64 = 6;

pub const PERF_COUNT_HW_CACHE_OP_READ: u64 = 0;
pub const PERF_COUNT_HW_CACHE_OP_WRITE: u64 = 1;
pub const PERF_COUNT_HW_CACHE_OP_PREFETCH: u64 = 2;

pub const PERF_COUNT_HW_CACHE_RESULT_ACCESS: u64 = 0;
pub const PERF_COUNT_HW_CACHE_RESULT_MISS: u64 = 1;

pub const PERF_SAMPLE_IP: u64 = 1 << 0;
pub const PERF_SAMPLE_TID: u64 = 1 << 1;
pub const PERF_SAMPLE_TIME: u64 = 1 << 2;
pub const PERF_SAMPLE_ADDR: u64 = 1 << 3;
pub const PERF_SAMPLE_READ: u64 = 1 << 4;
pub const PERF_SAMPLE_CALLCHAIN: u64 = 1 << 5;
pub const PERF_SAMPLE_ID: u64 = 1 << 6;
pub const PERF_SAMPLE_CPU: u64 = 1 << 7;
pub const PERF_SAMPLE_PERIOD: u64 = 1 << 8;
pub const PERF_SAMPLE_STREAM_ID: u64 = 1 << 9;
pub const PERF_SAMPLE_RAW: u64 = 1 << 10;
pub const PERF_SAMPLE_BRANCH_STACK: u64 = 1 << 11;
pub const PERF_SAMPLE_REGS_USER: u64 = 1 << 12;
pub const PERF_SAMPLE_STACK_USER: u64 = 1 << 13;

pub const PERF_SAMPLE_BRANCH_USER: u64 = 1 << 0;
pub const PERF_SAMPLE_BRANCH_KERNEL: u64 = 1 << 1;
pub const PERF_SAMPLE_BRANCH_HV: u64 = 1 << 2;
pub const PERF_SAMPLE_BRANCH_ANY: u64 = 1 << 3;
pub const PERF_SAMPLE_BRANCH_ANY_CALL: u64 = 1 << 4;
pub const PERF_SAMPLE_BRANCH_ANY_RETURN: u64 = 1 << 5;
pub const PERF_SAMPLE_BRANCH_IND_CALL: u64 = 1 << 6;

pub const PERF_FORMAT_TOTAL_TIME_ENABLED: u64 = 1 << 0;
pub const PERF_FORMAT_TOTAL_TIME_RUNNING: u64 = 1 << 1;
pub const PERF_FORMAT_ID: u64 = 1 << 2;
pub const PERF_FORMAT_GROUP: u64 = 1 << 3;

// Bit positions in `PerfEventAttr::flags`.
pub const ATTR_FLAG_DISABLED: u64 = 1 << 0;
pub const ATTR_FLAG_INHERIT: u64 = 1 << 1;
pub const ATTR_FLAG_PINNED: u64 = 1 << 2;
pub const ATTR_FLAG_EXCLUSIVE: u64 = 1 << 3;
pub const ATTR_FLAG_EXCLUDE_USER: u64 = 1 << 4;
pub const ATTR_FLAG_EXCLUDE_KERNEL: u64 = 1 << 5;
pub const ATTR_FLAG_EXCLUDE_HV: u64 = 1 << 6;
pub const ATTR_FLAG_EXCLUDE_IDLE: u64 = 1 << 7;
pub const ATTR_FLAG_MMAP: u64 = 1 << 8;
pub const ATTR_FLAG_COMM: u64 = 1 << 9;
pub const ATTR_FLAG_FREQ: u64 = 1 << 10;
pub const ATTR_FLAG_INHERIT_STAT: u64 = 1 << 11;
pub const ATTR_FLAG_ENABLE_ON_EXEC: u64 = 1 << 12;
pub const ATTR_FLAG_TASK: u64 = 1 << 13;
pub const ATTR_FLAG_WATERMARK: u64 = 1 << 14;
// precise_ip is a two-bit field at bits 15..=16.
pub const ATTR_PRECISE_IP_SHIFT: u32 = 15;
pub const ATTR_PRECISE_IP_MASK: u64 = 0b11 << ATTR_PRECISE_IP_SHIFT;
pub const ATTR_FLAG_MMAP_DATA: u64 = 1 << 17;
pub const ATTR_FLAG_SAMPLE_ID_ALL: u64 = 1 << 18;
pub const ATTR_FLAG_EXCLUDE_HOST: u64 = 1 << 19;
pub const ATTR_FLAG_EXCLUDE_GUEST: u64 = 1 << 20;
pub const ATTR_FLAG_EXCLUDE_CALLCHAIN_KERNEL: u64 = 1 << 21;
pub const ATTR_FLAG_EXCLUDE_CALLCHAIN_USER: u64 = 1 << 22;
pub const ATTR_FLAG_MMAP2: u64 = 1 << 23;
pub const ATTR_FLAG_COMM_EXEC: u64 = 1 << 24;
pub const ATTR_FLAG_USE_CLOCKID: u64 = 1 << 25;
pub const ATTR_FLAG_CONTEXT_SWITCH: u64 = 1 << 26;

pub const PERF_FLAG_FD_CLOEXEC: u64 = 1 << 3;

// _IO('$', ...) ioctl numbers, for 64-bit pointer size.
pub const PERF_IOC_OP_ENABLE: u64 = 0x2400;
pub const PERF_IOC_OP_DISABLE: u64 = 0x2401;
pub const PERF_IOC_OP_RESET: u64 = 0x2403;
pub const PERF_IOC_OP_SET_FILTER: u64 = 0x4008_2406;
pub const PERF_IOC_OP_ID: u64 = 0x8008_2407;

pub const PERF_RECORD_SAMPLE: u32 = 9;

/// `struct perf_event_attr`, through the `config3` revision (attr size 136).
///
/// Unions are flattened to their storage: `sample_period_or_freq` is
/// `sample_period`/`sample_freq` depending on [`ATTR_FLAG_FREQ`],
/// `wakeup_events_or_watermark` is selected by [`ATTR_FLAG_WATERMARK`], and
/// `config1`/`config2` cover the breakpoint/probe unions.
#[repr(C)]
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct PerfEventAttr {
    pub type_: u32,
    pub size: u32,
    pub config: u64,
    pub sample_period_or_freq: u64,
    pub sample_type: u64,
    pub read_format: u64,
    pub flags: u64,
    pub wakeup_events_or_watermark: u32,
    pub bp_type: u32,
    pub config1: u64,
    pub config2: u64,
    pub branch_sample_type: u64,
    pub sample_regs_user: u64,
    pub sample_stack_user: u32,
    pub clockid: i32,
    pub sample_regs_intr: u64,
    pub aux_watermark: u32,
    pub sample_max_stack: u16,
    pub __reserved_2: u16,
    pub aux_sample_size: u32,
    pub __reserved_3: u32,
    pub sig_data: u64,
    pub config3: u64,
}

impl PerfEventAttr {
    pub fn new() -> Self {
        Self {
            size: size_of::<Self>() as u32,
            ..Default::default()
        }
    }

    pub fn flag(&self, flag: u64) -> bool {
        self.flags & flag != 0
    }

    pub fn set_flag(&mut self, flag: u64, on: bool) {
        if on {
            self.flags |= flag;
        } else {
            self.flags &= !flag;
        }
    }

    pub fn precise_ip(&self) -> u8 {
        ((self.flags & ATTR_PRECISE_IP_MASK) >> ATTR_PRECISE_IP_SHIFT) as u8
    }

    pub fn set_precise_ip(&mut self, level: u8) {
        self.flags &= !ATTR_PRECISE_IP_MASK;
        self.flags |= ((level & 0b11) as u64) << ATTR_PRECISE_IP_SHIFT;
    }
}

impl std::fmt::Debug for PerfEventAttr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PerfEventAttr")
            .field("type", &self.type_)
            .field("config", &format_args!("{:#x}", self.config))
            .field("sample_period_or_freq", &self.sample_period_or_freq)
            .field("sample_type", &format_args!("{:#x}", self.sample_type))
            .field("read_format", &format_args!("{:#x}", self.read_format))
            .field("flags", &format_args!("{:#x}", self.flags))
            .finish_non_exhaustive()
    }
}

/// Metadata page at the head of an event mmap region.
///
/// Only the ring head/tail words are accessed; they live at fixed offsets
/// (`data_head` at 1024) so the reserved block below is load-bearing.
#[repr(C)]
pub struct PerfEventMmapPage {
    pub version: u32,
    pub compat_version: u32,
    pub lock: u32,
    pub index: u32,
    pub offset: i64,
    pub time_enabled: u64,
    pub time_running: u64,
    pub capabilities: u64,
    pub pmc_width: u16,
    pub time_shift: u16,
    pub time_mult: u32,
    pub time_offset: u64,
    pub time_zero: u64,
    pub size: u32,
    pub __reserved_1: u32,
    pub time_cycles: u64,
    pub time_mask: u64,
    pub __reserved: [u8; 928],
    pub data_head: u64,
    pub data_tail: u64,
    pub data_offset: u64,
    pub data_size: u64,
    pub aux_head: u64,
    pub aux_tail: u64,
    pub aux_offset: u64,
    pub aux_size: u64,
}

/// `struct perf_event_header`, leading every ring-buffer record.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct PerfEventHeader {
    pub type_: u32,
    pub misc: u16,
    pub size: u16,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attr_layout_matches_uapi() {
        assert_eq!(size_of::<PerfEventAttr>(), 136);
        assert_eq!(std::mem::offset_of!(PerfEventAttr, config), 8);
        assert_eq!(std::mem::offset_of!(PerfEventAttr, sample_type), 24);
        assert_eq!(std::mem::offset_of!(PerfEventAttr, flags), 40);
        assert_eq!(std::mem::offset_of!(PerfEventAttr, config1), 56);
        assert_eq!(std::mem::offset_of!(PerfEventAttr, branch_sample_type), 72);
        assert_eq!(std::mem::offset_of!(PerfEventAttr, clockid), 92);
        assert_eq!(std::mem::offset_of!(PerfEventAttr, aux_watermark), 104);
        assert_eq!(std::mem::offset_of!(PerfEventAttr, config3), 128);
    }

    #[test]
    fn mmap_page_ring_offsets() {
        assert_eq!(std::mem::offset_of!(PerfEventMmapPage, data_head), 1024);
        assert_eq!(std::mem::offset_of!(PerfEventMmapPage, data_tail), 1032);
    }

    #[test]
    fn precise_ip_is_two_bits() {
        let mut attr = PerfEventAttr::new();
        attr.set_precise_ip(3);
        assert_eq!(attr.precise_ip(), 3);
        attr.set_precise_ip(0);
        assert_eq!(attr.precise_ip(), 0);
        assert_eq!(attr.flags, 0);
    }
}
