//! The event-selection set: groups of selections, their kernel fds, and the
//! operations a profiling session performs on them.
//!
//! A group's selections are opened as one transaction per `(thread, cpu)`
//! pair so the kernel schedules them atomically; partial success across
//! pairs is tolerated (threads exit, CPUs go offline), but a group that
//! opened nothing is fatal.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::rc::Rc;
use std::time::Duration;

use itertools::Itertools;
use libc::pid_t;
use log::{debug, error, warn};

use crate::attr::{default_attr, DEFAULT_SAMPLE_PERIOD_FOR_TRACEPOINT_EVENT, INFINITE_SAMPLE_PERIOD};
use crate::env;
use crate::error::{Error, Result};
use crate::evloop::IOEventLoop;
use crate::event::{parse_event_spec, pmu, tracepoint, EventSpec};
use crate::fd::{CounterReading, EventFd};
use crate::feature;
use crate::ffi::{bindings as b, Attr};

/// How often a sampling event fires.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SampleRate {
    /// Samples per second; the kernel adjusts the period to meet it.
    Freq(u64),
    /// One sample every `n` events.
    Period(u64),
}

/// An ETM address filter. Range filters consume two of the device's filter
/// slots, start/stop filters one each.
#[derive(Clone, Debug)]
pub enum AddrFilter {
    FileRange { path: String, addr: u64, size: u64 },
    FileStart { path: String, addr: u64 },
    FileStop { path: String, addr: u64 },
    KernelRange { addr: u64, size: u64 },
    KernelStart { addr: u64 },
    KernelStop { addr: u64 },
}

impl AddrFilter {
    fn filter_slots(&self) -> usize {
        match self {
            AddrFilter::FileRange { .. } | AddrFilter::KernelRange { .. } => 2,
            _ => 1,
        }
    }
}

impl fmt::Display for AddrFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddrFilter::FileRange { path, addr, size } => {
                write!(f, "filter {addr:#x}/{size:#x}@{path}")
            }
            AddrFilter::FileStart { path, addr } => write!(f, "start {addr:#x}@{path}"),
            AddrFilter::FileStop { path, addr } => write!(f, "stop {addr:#x}@{path}"),
            AddrFilter::KernelRange { addr, size } => write!(f, "filter {addr:#x}/{size:#x}"),
            AddrFilter::KernelStart { addr } => write!(f, "start {addr:#x}"),
            AddrFilter::KernelStop { addr } => write!(f, "stop {addr:#x}"),
        }
    }
}

/// One fd's reading plus its `(tid, cpu)` pairing.
#[derive(Clone, Copy, Debug)]
pub struct CounterInfo {
    pub tid: pid_t,
    pub cpu: i32,
    pub counter: CounterReading,
}

/// All counters read for one selection.
#[derive(Clone, Debug)]
pub struct CountersInfo {
    pub group_id: usize,
    pub event_name: String,
    pub event_modifier: String,
    pub counters: Vec<CounterInfo>,
}

struct EventSelection {
    spec: EventSpec,
    attr: Attr,
    fds: Vec<EventFd>,
    tracepoint_filter: Option<String>,
    /// CPU mask of the owning PMU; overrides any cpu list when non-empty.
    allowed_cpus: Vec<i32>,
    /// Readings preserved from fds whose CPU went offline mid-session.
    hotplugged_counters: Vec<CounterInfo>,
    /// Last good reading per live fd, for hotplug preservation.
    last_readings: RefCell<BTreeMap<(pid_t, i32), CounterReading>>,
}

#[derive(Default)]
struct EventSelectionGroup {
    selections: Vec<EventSelection>,
    cpus: Vec<i32>,
    sample_rate_set: bool,
}

/// The ordered population of event groups a session monitors, together with
/// its event loop and monitored targets.
pub struct EventSelectionSet {
    for_stat_cmd: bool,
    groups: Vec<EventSelectionGroup>,
    sample_rate: Option<SampleRate>,
    cpus: Option<Vec<i32>>,
    addr_filters: Vec<AddrFilter>,
    has_aux_trace: bool,
    evloop: Rc<IOEventLoop>,
    processes: BTreeSet<pid_t>,
    threads: BTreeSet<pid_t>,
}

impl EventSelectionSet {
    pub fn new(for_stat_cmd: bool) -> Result<Self> {
        Ok(Self {
            for_stat_cmd,
            groups: vec![],
            sample_rate: None,
            cpus: None,
            addr_filters: vec![],
            has_aux_trace: false,
            evloop: IOEventLoop::new()?,
            processes: BTreeSet::new(),
            threads: BTreeSet::new(),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn io_event_loop(&self) -> &Rc<IOEventLoop> {
        &self.evloop
    }

    /// Event specs in insertion order, across all groups.
    pub fn event_specs(&self) -> impl Iterator<Item = &EventSpec> {
        self.groups
            .iter()
            .flat_map(|g| g.selections.iter().map(|s| &s.spec))
    }

    fn build_and_check_selection(
        &self,
        event_name: &str,
        first_event: bool,
        check: bool,
    ) -> Result<EventSelection> {
        let spec = parse_event_spec(event_name)?;
        if self.for_stat_cmd
            && matches!(spec.event_type.name.as_str(), "cpu-clock" | "task-clock")
            && (spec.exclude_user || spec.exclude_kernel)
        {
            return Err(Error::ConfigConflict(format!(
                "modifiers u and k used in event type {} are not supported by the kernel",
                spec.event_type.name
            )));
        }

        let mut attr = default_attr(&spec.event_type);
        attr.set_flag(b::ATTR_FLAG_EXCLUDE_USER, spec.exclude_user);
        attr.set_flag(b::ATTR_FLAG_EXCLUDE_KERNEL, spec.exclude_kernel);
        attr.set_flag(b::ATTR_FLAG_EXCLUDE_HV, spec.exclude_hv);
        attr.set_flag(b::ATTR_FLAG_EXCLUDE_HOST, spec.exclude_host);
        attr.set_flag(b::ATTR_FLAG_EXCLUDE_GUEST, spec.exclude_guest);
        attr.set_precise_ip(spec.precise_ip);

        if spec.event_type.is_etm_event() {
            if pmu::etm_info().is_none() {
                return Err(Error::CapabilityUnsupported(
                    "ETM instruction tracing".into(),
                ));
            }
            // The kernel allocates high-order pages from aux_watermark; one
            // page keeps the allocation order at zero.
            attr.aux_watermark = 4096;
        }

        let mut set_default_sample_freq = false;
        if !self.for_stat_cmd {
            if attr.type_ == b::PERF_TYPE_TRACEPOINT {
                attr.set_flag(b::ATTR_FLAG_FREQ, false);
                attr.sample_period_or_freq = DEFAULT_SAMPLE_PERIOD_FOR_TRACEPOINT_EVENT;
            } else if spec.event_type.is_etm_event() {
                // ETM has no sample rate to adjust, and can't be armed until
                // its aux buffer is mapped.
                attr.set_flag(b::ATTR_FLAG_FREQ, false);
                attr.sample_period_or_freq = 1;
                attr.set_flag(b::ATTR_FLAG_DISABLED, true);
            } else {
                attr.set_flag(b::ATTR_FLAG_FREQ, true);
                // The final rate arrives via set_sample_rate_for_new_events;
                // a provisional minimum avoids a misleading clamp warning.
                attr.sample_period_or_freq = 1;
                set_default_sample_freq = true;
            }
            // mmap and comm records are only needed once per session; the
            // first event type carries them for everyone.
            if first_event {
                attr.set_flag(b::ATTR_FLAG_MMAP, true);
                attr.set_flag(b::ATTR_FLAG_COMM, true);
                if feature::mmap2_supported() {
                    attr.set_flag(b::ATTR_FLAG_MMAP2, true);
                }
            }
        }

        if check && !spec.event_type.is_pmu_event() && !feature::is_event_attr_supported(&attr, &spec.name)
        {
            return Err(Error::AttributeInvalid {
                event: spec.name.clone(),
                source: std::io::ErrorKind::InvalidInput.into(),
            });
        }
        if set_default_sample_freq {
            attr.sample_period_or_freq = crate::attr::DEFAULT_SAMPLE_FREQ_FOR_NONTRACEPOINT_EVENT;
        }

        for group in &self.groups {
            for selection in &group.selections {
                if selection.spec.name == spec.name {
                    return Err(Error::ConfigConflict(format!(
                        "event type '{}' appears more than once",
                        spec.name
                    )));
                }
            }
        }

        Ok(EventSelection {
            spec,
            attr,
            fds: vec![],
            tracepoint_filter: None,
            allowed_cpus: vec![],
            hotplugged_counters: vec![],
            last_readings: RefCell::new(BTreeMap::new()),
        })
    }

    pub fn add_event_type(&mut self, event_name: &str, check: bool) -> Result<()> {
        self.add_event_group(&[event_name.to_string()], check)
    }

    /// Builds selections for `event_names` and appends them as one atomically
    /// scheduled group.
    pub fn add_event_group(&mut self, event_names: &[String], check: bool) -> Result<()> {
        let mut group = EventSelectionGroup::default();
        let mut first_event = self.groups.is_empty();
        let mut first_in_group = true;
        for event_name in event_names {
            let mut selection = self.build_and_check_selection(event_name, first_event, check)?;
            // Uniqueness against selections already staged in this group.
            if group
                .selections
                .iter()
                .any(|s| s.spec.name == selection.spec.name)
            {
                return Err(Error::ConfigConflict(format!(
                    "event type '{}' appears more than once",
                    selection.spec.name
                )));
            }
            if selection.spec.event_type.is_etm_event() {
                self.has_aux_trace = true;
            }
            if first_in_group {
                selection.allowed_cpus = selection.spec.event_type.pmu_cpumask();
            }
            first_event = false;
            first_in_group = false;
            group.selections.push(selection);
        }
        if let Some(rate) = self.sample_rate {
            set_sample_rate_for_group(&mut group, rate);
        }
        if let Some(cpus) = &self.cpus {
            group.cpus = cpus.clone();
        }
        self.groups.push(group);
        self.union_sample_type();
        Ok(())
    }

    /// Adds pure counters to the (single) existing group; their values ride
    /// along in every sampled record as a group snapshot.
    pub fn add_counters(&mut self, event_names: &[String]) -> Result<()> {
        assert!(!self.groups.is_empty());
        if self.groups.len() > 1 {
            return Err(Error::ConfigConflict(
                "failed to add counters: only one event group is allowed".into(),
            ));
        }
        for event_name in event_names {
            let mut selection = self.build_and_check_selection(event_name, false, true)?;
            // A period nothing reaches, so the added counters never sample.
            selection.attr.set_flag(b::ATTR_FLAG_FREQ, false);
            selection.attr.sample_period_or_freq = INFINITE_SAMPLE_PERIOD;
            selection.attr.set_flag(b::ATTR_FLAG_INHERIT, false);
            self.groups[0].selections.push(selection);
        }
        for selection in &mut self.groups[0].selections {
            selection.attr.sample_type |= b::PERF_SAMPLE_READ;
            selection.attr.read_format |= b::PERF_FORMAT_GROUP;
        }
        Ok(())
    }

    // One sample layout for every record the kernel writes makes the stream
    // decodable without per-event dispatch.
    fn union_sample_type(&mut self) {
        let union = self
            .groups
            .iter()
            .flat_map(|g| &g.selections)
            .fold(0, |acc, s| acc | s.attr.sample_type);
        for group in &mut self.groups {
            for selection in &mut group.selections {
                selection.attr.sample_type = union;
            }
        }
    }

    pub fn set_enable_condition(&mut self, enable_on_open: bool, enable_on_exec: bool) {
        for_each_attr(&mut self.groups, |attr| {
            attr.set_flag(b::ATTR_FLAG_DISABLED, !enable_on_open);
            attr.set_flag(b::ATTR_FLAG_ENABLE_ON_EXEC, enable_on_exec);
        });
    }

    pub fn sample_id_all(&mut self) {
        for_each_attr(&mut self.groups, |attr| {
            attr.set_flag(b::ATTR_FLAG_SAMPLE_ID_ALL, true);
        });
    }

    /// Remembers `rate` as the default for groups added later, and applies it
    /// to existing groups that have no group-local rate.
    pub fn set_sample_rate_for_new_events(&mut self, rate: SampleRate) -> Result<()> {
        match rate {
            SampleRate::Freq(0) => {
                return Err(Error::ConfigConflict("sample frequency 0".into()));
            }
            SampleRate::Period(0) => {
                return Err(Error::ConfigConflict("sample period 0".into()));
            }
            _ => {}
        }
        self.sample_rate = Some(rate);
        for group in &mut self.groups {
            if !group.sample_rate_set {
                set_sample_rate_for_group(group, rate);
            }
        }
        Ok(())
    }

    /// Remembers `cpus` as the default for groups added later, and applies it
    /// to existing groups with no local cpu list.
    pub fn set_cpus_for_new_events(&mut self, cpus: Vec<i32>) {
        for group in &mut self.groups {
            if group.cpus.is_empty() {
                group.cpus = cpus.clone();
            }
        }
        self.cpus = Some(cpus);
    }

    pub fn set_branch_sampling(&mut self, branch_sample_type: u64) -> Result<()> {
        const REQUIRED: u64 = b::PERF_SAMPLE_BRANCH_ANY
            | b::PERF_SAMPLE_BRANCH_ANY_CALL
            | b::PERF_SAMPLE_BRANCH_ANY_RETURN
            | b::PERF_SAMPLE_BRANCH_IND_CALL;
        if branch_sample_type != 0 && branch_sample_type & REQUIRED == 0 {
            return Err(Error::ConfigConflict(format!(
                "invalid branch_sample_type: 0x{branch_sample_type:x}"
            )));
        }
        if branch_sample_type != 0 && !feature::branch_sampling_supported() {
            return Err(Error::CapabilityUnsupported("branch stack sampling".into()));
        }
        for_each_attr(&mut self.groups, |attr| {
            if branch_sample_type != 0 {
                attr.sample_type |= b::PERF_SAMPLE_BRANCH_STACK;
            } else {
                attr.sample_type &= !b::PERF_SAMPLE_BRANCH_STACK;
            }
            attr.branch_sample_type = branch_sample_type;
        });
        Ok(())
    }

    pub fn enable_fp_callchain_sampling(&mut self) {
        for_each_attr(&mut self.groups, |attr| {
            attr.sample_type |= b::PERF_SAMPLE_CALLCHAIN;
        });
    }

    pub fn enable_dwarf_callchain_sampling(&mut self, dump_stack_size: u32) -> Result<()> {
        if !feature::dwarf_callchain_supported() {
            return Err(Error::CapabilityUnsupported("dwarf callchain sampling".into()));
        }
        for_each_attr(&mut self.groups, |attr| {
            attr.sample_type |=
                b::PERF_SAMPLE_CALLCHAIN | b::PERF_SAMPLE_REGS_USER | b::PERF_SAMPLE_STACK_USER;
            attr.set_flag(b::ATTR_FLAG_EXCLUDE_CALLCHAIN_USER, true);
            attr.sample_regs_user = feature::supported_reg_mask();
            attr.sample_stack_user = dump_stack_size;
        });
        Ok(())
    }

    pub fn set_inherit(&mut self, enable: bool) {
        for_each_attr(&mut self.groups, |attr| {
            attr.set_flag(b::ATTR_FLAG_INHERIT, enable);
        });
    }

    pub fn set_clockid(&mut self, clockid: i32) -> Result<()> {
        if !feature::clockid_setting_supported() {
            return Err(Error::CapabilityUnsupported("setting clockid".into()));
        }
        for_each_attr(&mut self.groups, |attr| {
            attr.set_flag(b::ATTR_FLAG_USE_CLOCKID, true);
            attr.clockid = clockid;
        });
        Ok(())
    }

    pub fn wakeup_per_sample(&mut self) {
        for_each_attr(&mut self.groups, |attr| {
            attr.set_flag(b::ATTR_FLAG_WATERMARK, false);
            attr.wakeup_events_or_watermark = 1;
        });
    }

    /// Attaches `filter` to the last added group, which must consist of a
    /// single tracepoint selection. The filter is adjusted for the running
    /// kernel and validated against the tracepoint's field schema.
    pub fn set_tracepoint_filter(&mut self, filter: &str) -> Result<()> {
        let selection = match self.groups.last_mut() {
            Some(group) if group.selections.len() == 1 => {
                let selection = &mut group.selections[0];
                (selection.attr.type_ == b::PERF_TYPE_TRACEPOINT).then_some(selection)
            }
            _ => None,
        };
        let Some(selection) = selection else {
            return Err(Error::FilterInvalid(format!(
                "no tracepoint event before filter: {filter}"
            )));
        };

        // Kernels since 4.19 want quoted string operands.
        let use_quote = env::kernel_version().is_some_and(|v| v >= (4, 19));
        let (adjusted, used_fields) = tracepoint::adjust_filter(filter, use_quote)?;

        let (subsys, name) = selection
            .spec
            .event_type
            .name
            .split_once(':')
            .expect("tracepoint names contain ':'");
        if let Ok(fields) = tracepoint::tracepoint_fields(subsys, name) {
            for field in &used_fields {
                if !fields.contains(field) {
                    return Err(Error::FilterInvalid(format!(
                        "field name {field} used in \"{filter}\" doesn't exist in {}. \
                         Available fields are {}",
                        selection.spec.event_type.name,
                        fields.iter().join(",")
                    )));
                }
            }
        }

        selection.tracepoint_filter = Some(adjusted);
        Ok(())
    }

    /// Registers ETM address filters, checking them against the device's
    /// advertised filter budget.
    pub fn set_addr_filters(&mut self, filters: Vec<AddrFilter>) -> Result<()> {
        if !self.has_aux_trace {
            return Err(Error::FilterInvalid(
                "addr filters only take effect in ETM instruction tracing".into(),
            ));
        }
        let required: usize = filters.iter().map(AddrFilter::filter_slots).sum();
        let available = pmu::etm_info().map_or(0, |i| i.addr_filter_pairs as usize * 2);
        if required > available {
            return Err(Error::FilterInvalid(format!(
                "needed {required} etm filters, but only {available} filters are available"
            )));
        }
        self.addr_filters = filters;
        Ok(())
    }

    pub fn add_monitored_processes(&mut self, pids: impl IntoIterator<Item = pid_t>) {
        self.processes.extend(pids);
    }

    pub fn add_monitored_threads(&mut self, tids: impl IntoIterator<Item = pid_t>) {
        self.threads.extend(tids);
    }

    pub fn monitored_processes(&self) -> &BTreeSet<pid_t> {
        &self.processes
    }

    pub fn monitored_threads(&self) -> &BTreeSet<pid_t> {
        &self.threads
    }

    pub fn has_monitored_target(&self) -> bool {
        !self.processes.is_empty() || !self.threads.is_empty()
    }

    pub fn clear_monitored_targets(&mut self) {
        self.processes.clear();
        self.threads.clear();
    }

    /// Expected hardware-counter pressure per cpu, for the post-session
    /// multiplexing check.
    pub fn hardware_counters_for_cpus(&self) -> BTreeMap<i32, usize> {
        let online = env::online_cpus();
        let mut map = BTreeMap::new();
        for group in &self.groups {
            let hardware_events = group
                .selections
                .iter()
                .filter(|s| s.spec.event_type.is_hardware_event())
                .count();
            let cpus = if group.cpus.is_empty() {
                &online
            } else {
                &group.cpus
            };
            for &cpu in cpus {
                *map.entry(cpu).or_insert(0) += hardware_events;
            }
        }
        map
    }

    /// Opens event files for every monitored thread across the effective CPU
    /// lists.
    pub fn open_event_files(&mut self) -> Result<()> {
        let mut threads = self.threads.clone();
        for &pid in &self.processes {
            threads.extend(env::threads_in_process(pid));
        }
        if threads.is_empty() {
            return Err(Error::TargetGone(
                self.processes.iter().map(|p| p.to_string()).join(","),
            ));
        }
        self.open_event_files_for_threads(&threads)
    }

    /// Opens event files for exactly `threads`. Used for the initial open and
    /// by the new-thread monitor for late arrivals.
    pub fn open_event_files_for_threads(&mut self, threads: &BTreeSet<pid_t>) -> Result<()> {
        let online_cpus = env::online_cpus();
        let check_cpus_online = |cpus: &[i32]| -> Result<()> {
            if cpus == [-1] {
                return Ok(());
            }
            for cpu in cpus {
                if !online_cpus.contains(cpu) {
                    return Err(Error::ResourceExhausted(format!("cpu {cpu} is not online")));
                }
            }
            Ok(())
        };

        for group in &mut self.groups {
            // A PMU with a cpumask is agnostic to cpu selection; its mask
            // overrides any explicit list.
            let cpus = if !group.selections[0].allowed_cpus.is_empty() {
                group.selections[0].allowed_cpus.clone()
            } else if !group.cpus.is_empty() {
                check_cpus_online(&group.cpus)?;
                group.cpus.clone()
            } else {
                online_cpus.clone()
            };

            let mut success_count = 0usize;
            let mut last_error = None;
            for &tid in threads {
                for &cpu in &cpus {
                    match open_group_on(group, tid, cpu) {
                        Ok(()) => success_count += 1,
                        Err(e) => {
                            // Threads exit and CPUs go offline between target
                            // discovery and open; keep going.
                            last_error = Some(e);
                        }
                    }
                }
            }
            if success_count == 0 {
                let err = last_error.unwrap_or_else(|| {
                    Error::TargetGone(threads.iter().map(|t| t.to_string()).join(","))
                });
                error!("failed to open perf event files: {err}");
                return Err(err);
            }
        }
        self.apply_filters()
    }

    fn apply_filters(&mut self) -> Result<()> {
        self.apply_addr_filters()?;
        self.apply_tracepoint_filters()
    }

    fn apply_addr_filters(&mut self) -> Result<()> {
        if self.addr_filters.is_empty() {
            return Ok(());
        }
        let filter_str = self.addr_filters.iter().join(",");
        for group in &self.groups {
            for selection in &group.selections {
                if !selection.spec.event_type.is_etm_event() {
                    continue;
                }
                for fd in &selection.fds {
                    fd.set_filter(&filter_str)?;
                }
            }
        }
        Ok(())
    }

    fn apply_tracepoint_filters(&mut self) -> Result<()> {
        for group in &self.groups {
            for selection in &group.selections {
                let Some(filter) = &selection.tracepoint_filter else {
                    continue;
                };
                for fd in &selection.fds {
                    fd.set_filter(filter)?;
                }
            }
        }
        Ok(())
    }

    /// Collects one [`CounterInfo`] per owning fd for every selection,
    /// including counters preserved from offlined CPUs.
    pub fn read_counters(&mut self) -> Result<Vec<CountersInfo>> {
        let online_cpus = env::online_cpus();
        let mut counters = Vec::new();
        for (group_id, group) in self.groups.iter_mut().enumerate() {
            for selection in &mut group.selections {
                let mut info = CountersInfo {
                    group_id,
                    event_name: selection.spec.event_type.name.clone(),
                    event_modifier: selection.spec.modifier.clone(),
                    counters: selection.hotplugged_counters.clone(),
                };
                let mut offlined = Vec::new();
                for (index, fd) in selection.fds.iter().enumerate() {
                    match fd.read_counter() {
                        Ok(counter) => {
                            selection
                                .last_readings
                                .borrow_mut()
                                .insert((fd.tid(), fd.cpu()), counter);
                            info.counters.push(CounterInfo {
                                tid: fd.tid(),
                                cpu: fd.cpu(),
                                counter,
                            });
                        }
                        Err(e) if fd.cpu() >= 0 && !online_cpus.contains(&fd.cpu()) => {
                            // The cpu went offline; keep its last reading so
                            // aggregates stay correct.
                            warn!(
                                "cpu {} went offline, preserving last reading of '{}'",
                                fd.cpu(),
                                fd.name()
                            );
                            let last = selection
                                .last_readings
                                .borrow()
                                .get(&(fd.tid(), fd.cpu()))
                                .copied()
                                .unwrap_or_default();
                            let preserved = CounterInfo {
                                tid: fd.tid(),
                                cpu: fd.cpu(),
                                counter: last,
                            };
                            selection.hotplugged_counters.push(preserved);
                            info.counters.push(preserved);
                            offlined.push(index);
                            debug!("counter read failed on offlined cpu: {e}");
                        }
                        Err(e) => {
                            // Counter state is now inconsistent; this is fatal.
                            error!("failed to read counter of '{}': {e}", fd.name());
                            return Err(e);
                        }
                    }
                }
                for &index in offlined.iter().rev() {
                    selection.fds.remove(index);
                }
                counters.push(info);
            }
        }
        Ok(counters)
    }

    pub fn set_enable_events(&self, enable: bool) -> Result<()> {
        for group in &self.groups {
            for selection in &group.selections {
                for fd in &selection.fds {
                    fd.set_enable(enable)?;
                }
            }
        }
        Ok(())
    }

    /// Drops every fd. Followers go before leaders: within each group the
    /// first selection holds the leader fd for each `(tid, cpu)`.
    pub fn close_event_files(&mut self) {
        for group in &mut self.groups {
            for selection in group.selections.iter_mut().rev() {
                selection.fds.clear();
            }
        }
    }

    fn has_sampler(&self) -> bool {
        self.groups
            .iter()
            .any(|g| g.selections.iter().any(|s| !s.fds.is_empty()))
    }

    /// Installs a periodic check that exits the loop once every monitored
    /// thread and process is gone.
    pub fn stop_when_no_more_targets(this: &Rc<RefCell<Self>>) -> Result<()> {
        Self::stop_when_no_more_targets_with_interval(this, Duration::from_secs(1))
    }

    pub fn stop_when_no_more_targets_with_interval(
        this: &Rc<RefCell<Self>>,
        check_interval: Duration,
    ) -> Result<()> {
        let evloop = Rc::clone(&this.borrow().evloop);
        let weak = Rc::downgrade(this);
        this.borrow()
            .evloop
            .add_periodic_event(check_interval, move || {
                let Some(set) = weak.upgrade() else {
                    return evloop.exit_loop();
                };
                let set = set.borrow();
                if set.has_sampler()
                    && (set.threads.iter().any(|&tid| env::is_thread_alive(tid))
                        || set.processes.iter().any(|&pid| env::is_thread_alive(pid)))
                {
                    return Ok(());
                }
                evloop.exit_loop()
            })?;
        Ok(())
    }
}

impl Drop for EventSelectionSet {
    fn drop(&mut self) {
        self.close_event_files();
    }
}

fn for_each_attr(groups: &mut [EventSelectionGroup], mut f: impl FnMut(&mut Attr)) {
    for group in groups {
        for selection in &mut group.selections {
            f(&mut selection.attr);
        }
    }
}

fn set_sample_rate_for_group(group: &mut EventSelectionGroup, rate: SampleRate) {
    group.sample_rate_set = true;
    for selection in &mut group.selections {
        match rate {
            SampleRate::Freq(freq) => {
                selection.attr.set_flag(b::ATTR_FLAG_FREQ, true);
                selection.attr.sample_period_or_freq = freq;
            }
            SampleRate::Period(period) => {
                selection.attr.set_flag(b::ATTR_FLAG_FREQ, false);
                selection.attr.sample_period_or_freq = period;
            }
        }
    }
}

/// Opens every selection of `group` on `(tid, cpu)` as one transaction: the
/// first fd becomes the group leader, later opens join it, and any failure
/// unwinds the fds opened so far for this pair.
fn open_group_on(group: &mut EventSelectionGroup, tid: pid_t, cpu: i32) -> Result<()> {
    let mut fds: Vec<EventFd> = Vec::with_capacity(group.selections.len());
    for selection in &group.selections {
        let leader = fds.first();
        match EventFd::open(&selection.attr, tid, cpu, leader, &selection.spec.name, false) {
            Ok(fd) => fds.push(fd),
            Err(e) => {
                // Unwind this pair's fds, followers before the leader.
                while fds.pop().is_some() {}
                return Err(e);
            }
        }
    }
    for (selection, fd) in group.selections.iter_mut().zip(fds) {
        debug!("opened event file for {} on (tid {tid}, cpu {cpu})", fd.name());
        selection.fds.push(fd);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stat_set() -> EventSelectionSet {
        EventSelectionSet::new(true).unwrap()
    }

    fn names(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn event_names_stay_unique() {
        let mut set = stat_set();
        set.add_event_type("cpu-cycles", false).unwrap();
        assert!(matches!(
            set.add_event_type("cpu-cycles", false),
            Err(Error::ConfigConflict(_))
        ));
        // Same event in one group is rejected too.
        let mut set = stat_set();
        assert!(set
            .add_event_group(&names(&["instructions", "instructions"]), false)
            .is_err());
        // Different modifiers are distinct names.
        let mut set = stat_set();
        set.add_event_type("cpu-cycles:u", false).unwrap();
        set.add_event_type("cpu-cycles:k", false).unwrap();
        assert_eq!(set.event_specs().count(), 2);
    }

    #[test]
    fn clock_events_reject_u_and_k_in_stat_mode() {
        let mut set = stat_set();
        assert!(set.add_event_type("cpu-clock:u", false).is_err());
        assert!(set.add_event_type("task-clock:k", false).is_err());
        set.add_event_type("cpu-clock", false).unwrap();
    }

    #[test]
    fn add_counters_requires_exactly_one_group() {
        let mut set = stat_set();
        set.add_event_type("cpu-cycles", false).unwrap();
        set.add_event_type("instructions", false).unwrap();
        assert!(set.add_counters(&names(&["branch-misses"])).is_err());

        let mut set = stat_set();
        set.add_event_group(&names(&["cpu-cycles", "instructions"]), false)
            .unwrap();
        set.add_counters(&names(&["branch-misses"])).unwrap();
        let group = &set.groups[0];
        assert_eq!(group.selections.len(), 3);
        for selection in &group.selections {
            assert_ne!(selection.attr.sample_type & b::PERF_SAMPLE_READ, 0);
            assert_ne!(selection.attr.read_format & b::PERF_FORMAT_GROUP, 0);
        }
        let counter = &group.selections[2].attr;
        assert!(!counter.flag(b::ATTR_FLAG_FREQ));
        assert_eq!(counter.sample_period_or_freq, INFINITE_SAMPLE_PERIOD);
        assert!(!counter.flag(b::ATTR_FLAG_INHERIT));
    }

    #[test]
    fn sample_rate_is_idempotent_and_validated() {
        let mut set = stat_set();
        set.add_event_type("cpu-cycles", false).unwrap();
        set.set_sample_rate_for_new_events(SampleRate::Freq(4000))
            .unwrap();
        let snapshot = set.groups[0].selections[0].attr;
        set.set_sample_rate_for_new_events(SampleRate::Freq(4000))
            .unwrap();
        set.set_sample_rate_for_new_events(SampleRate::Freq(4000))
            .unwrap();
        assert_eq!(set.groups[0].selections[0].attr, snapshot);

        assert!(set
            .set_sample_rate_for_new_events(SampleRate::Freq(0))
            .is_err());
        assert!(set
            .set_sample_rate_for_new_events(SampleRate::Period(0))
            .is_err());
    }

    #[test]
    fn sample_type_is_unioned_across_groups() {
        let mut set = stat_set();
        set.add_event_type("cpu-cycles", false).unwrap();
        set.enable_fp_callchain_sampling();
        set.add_event_type("instructions", false).unwrap();
        for selection in set.groups.iter().flat_map(|g| &g.selections) {
            assert_ne!(selection.attr.sample_type & b::PERF_SAMPLE_CALLCHAIN, 0);
        }
    }

    #[test]
    fn cpu_defaults_apply_to_groups_without_local_list() {
        let mut set = stat_set();
        set.add_event_type("cpu-cycles", false).unwrap();
        set.set_cpus_for_new_events(vec![0]);
        set.add_event_type("instructions", false).unwrap();
        assert_eq!(set.groups[0].cpus, vec![0]);
        assert_eq!(set.groups[1].cpus, vec![0]);
    }

    #[test]
    fn branch_sampling_mask_is_validated() {
        let mut set = stat_set();
        set.add_event_type("cpu-cycles", false).unwrap();
        // Privilege bits alone are not a branch type selection.
        assert!(matches!(
            set.set_branch_sampling(b::PERF_SAMPLE_BRANCH_KERNEL),
            Err(Error::ConfigConflict(_))
        ));
        // Zero clears the branch-stack bit without needing the capability.
        set.set_branch_sampling(0).unwrap();
        assert_eq!(
            set.groups[0].selections[0].attr.sample_type & b::PERF_SAMPLE_BRANCH_STACK,
            0
        );
    }

    #[test]
    fn tracepoint_filter_needs_a_tracepoint_group() {
        let mut set = stat_set();
        set.add_event_type("cpu-cycles", false).unwrap();
        assert!(matches!(
            set.set_tracepoint_filter("prev_pid > 1"),
            Err(Error::FilterInvalid(_))
        ));
    }

    #[test]
    fn addr_filters_need_aux_trace() {
        let mut set = stat_set();
        set.add_event_type("cpu-cycles", false).unwrap();
        let filters = vec![AddrFilter::KernelStart { addr: 0xffff0000 }];
        assert!(matches!(
            set.set_addr_filters(filters),
            Err(Error::FilterInvalid(_))
        ));
    }

    #[test]
    fn enable_condition_writes_attr_bits() {
        let mut set = stat_set();
        set.add_event_type("cpu-cycles", false).unwrap();
        set.set_enable_condition(false, true);
        let attr = &set.groups[0].selections[0].attr;
        assert!(attr.flag(b::ATTR_FLAG_DISABLED));
        assert!(attr.flag(b::ATTR_FLAG_ENABLE_ON_EXEC));
        set.set_enable_condition(true, false);
        let attr = &set.groups[0].selections[0].attr;
        assert!(!attr.flag(b::ATTR_FLAG_DISABLED));
        assert!(!attr.flag(b::ATTR_FLAG_ENABLE_ON_EXEC));
    }

    #[test]
    fn inherit_and_wakeup_bits() {
        let mut set = stat_set();
        set.add_event_group(&names(&["cpu-cycles", "instructions"]), false)
            .unwrap();
        set.set_inherit(true);
        set.wakeup_per_sample();
        for selection in &set.groups[0].selections {
            assert!(selection.attr.flag(b::ATTR_FLAG_INHERIT));
            assert!(!selection.attr.flag(b::ATTR_FLAG_WATERMARK));
            assert_eq!(selection.attr.wakeup_events_or_watermark, 1);
        }
        set.set_inherit(false);
        assert!(!set.groups[0].selections[0].attr.flag(b::ATTR_FLAG_INHERIT));
    }

    #[test]
    fn addr_filter_rendering() {
        let filter = AddrFilter::FileRange {
            path: "/system/lib64/libc.so".into(),
            addr: 0x1000,
            size: 0x200,
        };
        assert_eq!(filter.to_string(), "filter 0x1000/0x200@/system/lib64/libc.so");
        assert_eq!(filter.filter_slots(), 2);
        let filter = AddrFilter::KernelStop { addr: 0xffff };
        assert_eq!(filter.to_string(), "stop 0xffff");
        assert_eq!(filter.filter_slots(), 1);
    }
}
