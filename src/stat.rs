//! The stat command: translates options into selection-set operations, wires
//! the event loop, and renders counter summaries.

use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};
use std::fs::File;
use std::io::{self, Write};
use std::os::fd::FromRawFd;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use clap::ArgMatches;
use libc::pid_t;
use log::{debug, warn};

use crate::attr::default_attr;
use crate::cli::Args;
use crate::env;
use crate::error::Error;
use crate::evloop::Priority;
use crate::event::find_event_type;
use crate::fd::EventFd;
use crate::feature;
use crate::ffi::bindings as b;
use crate::selection::{CountersInfo, EventSelectionSet};
use crate::summary::{
    build_summary_comparator, CounterSum, CounterSummaries, CounterSummaryBuilder,
    SummaryComparator, ThreadInfo,
};
use crate::workload::Workload;

const DEFAULT_MEASURED_EVENT_TYPES: &[&str] = &[
    "cpu-cycles",
    "stalled-cycles-frontend",
    "stalled-cycles-backend",
    "instructions",
    "branch-instructions",
    "branch-misses",
    "task-clock",
    "context-switches",
    "page-faults",
];

// Scan interval of the new-thread monitor. Nominally 1 µs, but the loop's
// timer resolution lower-bounds it, so read it as "as often as possible".
const NEW_THREAD_SCAN_INTERVAL: Duration = Duration::from_micros(1);

pub fn run(args: Args, matches: &ArgMatches) -> anyhow::Result<()> {
    StatCommand::new(args, matches)?.run()
}

struct StatCommand {
    verbose: bool,
    system_wide: bool,
    child_inherit: bool,
    duration_in_sec: f64,
    interval_in_ms: f64,
    interval_only_values: bool,
    csv: bool,
    output: Option<PathBuf>,
    out_fd: Option<i32>,
    stop_signal_fd: Option<i32>,
    report_per_core: bool,
    report_per_thread: bool,
    monitor_new_thread: bool,
    use_devfreq_counters: bool,
    print_hw_counter: bool,
    workload_args: Vec<String>,
    selection: Rc<RefCell<EventSelectionSet>>,
    thread_info: Rc<RefCell<HashMap<pid_t, ThreadInfo>>>,
    comparator: Option<SummaryComparator>,
}

impl StatCommand {
    fn new(args: Args, matches: &ArgMatches) -> anyhow::Result<Self> {
        if let Some(duration) = args.duration {
            if duration < 1e-9 {
                bail!("invalid duration: {duration}");
            }
        }
        if let Some(interval) = args.interval {
            if interval < 1e-9 {
                bail!("invalid interval: {interval}");
            }
        }
        if args.monitor_new_thread && (!args.per_thread || !args.no_inherit) {
            bail!("--monitor-new-thread should be used with --per-thread and --no-inherit");
        }
        if args.system_wide && !env::is_root() {
            bail!("system wide profiling needs root privilege");
        }

        // Default sort keys; the full key list lives in the comparator.
        let sort_keys = args.sort.clone().unwrap_or_else(|| {
            ["count_per_thread", "tid", "cpu", "count"]
                .map(String::from)
                .to_vec()
        });
        let comparator = if args.per_core || args.per_thread {
            Some(build_summary_comparator(
                &sort_keys,
                args.per_thread,
                args.per_core,
            )?)
        } else {
            None
        };

        let mut selection = EventSelectionSet::new(true)?;
        selection.add_monitored_processes(args.pids.iter().copied());
        selection.add_monitored_threads(args.tids.iter().copied());
        apply_ordered_options(&mut selection, matches)?;

        Ok(Self {
            verbose: args.verbose,
            system_wide: args.system_wide,
            child_inherit: !args.no_inherit,
            duration_in_sec: args.duration.unwrap_or(0.0),
            interval_in_ms: args.interval.unwrap_or(0.0),
            interval_only_values: args.interval_only_values,
            csv: args.csv,
            output: args.output,
            out_fd: args.out_fd,
            stop_signal_fd: args.stop_signal_fd,
            report_per_core: args.per_core,
            report_per_thread: args.per_thread,
            monitor_new_thread: args.monitor_new_thread,
            use_devfreq_counters: args.use_devfreq_counters,
            print_hw_counter: args.print_hw_counter,
            workload_args: args.workload,
            selection: Rc::new(RefCell::new(selection)),
            thread_info: Rc::new(RefCell::new(HashMap::new())),
            comparator,
        })
    }

    fn run(self) -> anyhow::Result<()> {
        env::allow_more_opened_files();

        if self.print_hw_counter {
            print_hardware_counters();
            return Ok(());
        }

        let _devfreq = if self.use_devfreq_counters {
            Some(env::DevfreqCounters::claim()?)
        } else {
            None
        };

        if self.selection.borrow().is_empty() {
            self.add_default_measured_event_types()?;
        }
        self.selection.borrow_mut().set_inherit(self.child_inherit);

        // The workload is forked early so counters can attach to its pid; it
        // execs only after the event files are open.
        let mut workload = if self.workload_args.is_empty() {
            None
        } else {
            Some(Workload::create(&self.workload_args)?)
        };

        let mut need_to_check_targets = false;
        {
            let mut selection = self.selection.borrow_mut();
            if self.system_wide {
                if self.report_per_thread {
                    selection.add_monitored_processes(env::all_processes());
                } else {
                    selection.add_monitored_threads([-1]);
                }
            } else if !selection.has_monitored_target() {
                match &workload {
                    Some(workload) => {
                        selection.add_monitored_processes([workload.pid()]);
                        selection.set_enable_condition(false, true);
                    }
                    None => bail!("no threads to monitor; try `perfstat --help`"),
                }
            } else {
                need_to_check_targets = true;
            }
        }

        // Captured before per-thread mode rewrites the target sets.
        let monitored_processes: BTreeSet<pid_t> =
            self.selection.borrow().monitored_processes().clone();

        if self.report_per_thread {
            self.monitor_each_thread(workload.as_ref());
        }

        self.selection
            .borrow_mut()
            .open_event_files()
            .context("opening perf event files")?;

        let out: Box<dyn Write> = if let Some(path) = &self.output {
            Box::new(
                File::create(path).with_context(|| format!("failed to open {}", path.display()))?,
            )
        } else if let Some(fd) = self.out_fd {
            Box::new(unsafe { File::from_raw_fd(fd) })
        } else {
            Box::new(io::stdout())
        };
        let printer = Rc::new(RefCell::new(Printer {
            csv: self.csv,
            verbose: self.verbose,
            interval_only_values: self.interval_only_values,
            report_per_thread: self.report_per_thread,
            report_per_core: self.report_per_core,
            comparator: self.comparator.clone(),
            thread_info: Rc::clone(&self.thread_info),
            last_sum_values: vec![],
            out,
            start_time: Instant::now(),
        }));

        let evloop = Rc::clone(self.selection.borrow().io_event_loop());
        if need_to_check_targets {
            EventSelectionSet::stop_when_no_more_targets(&self.selection)?;
        }
        {
            let evloop2 = Rc::clone(&evloop);
            evloop.add_signal_events(
                &[libc::SIGCHLD, libc::SIGINT, libc::SIGTERM, libc::SIGHUP],
                move || evloop2.exit_loop(),
            )?;
        }
        if let Some(fd) = self.stop_signal_fd {
            let evloop2 = Rc::clone(&evloop);
            evloop.add_read_event(fd, Priority::Low, move || evloop2.exit_loop())?;
        }
        if self.duration_in_sec > 0.0 {
            // The periodic event exits the loop on its first fire.
            let evloop2 = Rc::clone(&evloop);
            evloop.add_periodic_event(Duration::from_secs_f64(self.duration_in_sec), move || {
                evloop2.exit_loop()
            })?;
        }
        if self.interval_in_ms > 0.0 {
            let printer2 = Rc::clone(&printer);
            let selection2 = Rc::clone(&self.selection);
            evloop.add_periodic_event(
                Duration::from_secs_f64(self.interval_in_ms / 1000.0),
                move || printer2.borrow_mut().print(&mut selection2.borrow_mut()),
            )?;
        }
        if self.monitor_new_thread {
            self.start_new_thread_monitor(monitored_processes)?;
        }

        printer.borrow_mut().start_time = Instant::now();
        if let Some(workload) = &mut workload {
            workload.start()?;
        }
        evloop.run_loop()?;

        if self.interval_in_ms == 0.0 {
            printer.borrow_mut().print(&mut self.selection.borrow_mut())?;
        }

        self.selection.borrow_mut().close_event_files();
        self.check_hardware_counter_multiplexing();
        self.print_warning_for_inaccurate_events();
        Ok(())
    }

    fn add_default_measured_event_types(&self) -> anyhow::Result<()> {
        let mut selection = self.selection.borrow_mut();
        for name in DEFAULT_MEASURED_EVENT_TYPES {
            // Some defaults may be missing on a given machine; that's fine as
            // long as at least one survives.
            let Some(ty) = find_event_type(name) else {
                continue;
            };
            let mut name = name.to_string();
            let mut attr = default_attr(&ty);
            if !feature::kernel_event_supported() {
                attr.set_flag(b::ATTR_FLAG_EXCLUDE_KERNEL, true);
                if name == "cpu-clock" || name == "task-clock" {
                    continue;
                }
                name += ":u";
            }
            if feature::is_event_attr_supported(&attr, &name) {
                selection.add_event_type(&name, false)?;
            }
        }
        if selection.is_empty() {
            bail!("failed to add any supported default measured types");
        }
        Ok(())
    }

    /// Expands the monitored processes into their live threads so results can
    /// be reported per thread.
    fn monitor_each_thread(&self, workload: Option<&Workload>) {
        let mut threads = Vec::new();
        let mut selection = self.selection.borrow_mut();
        let mut thread_info = self.thread_info.borrow_mut();
        let processes: Vec<pid_t> = selection.monitored_processes().iter().copied().collect();
        for pid in processes {
            for tid in env::threads_in_process(pid) {
                let Some(mut name) = env::thread_name(tid) else {
                    continue;
                };
                if tid == pid && workload.is_some_and(|w| w.pid() == pid) {
                    name = workload.unwrap().command_name().to_string();
                }
                thread_info.insert(tid, ThreadInfo { pid, tid, name });
                threads.push(tid);
            }
        }
        let tids: Vec<pid_t> = selection.monitored_threads().iter().copied().collect();
        for tid in tids {
            if let Some((name, pid)) = env::read_thread_name_and_pid(tid) {
                thread_info.insert(tid, ThreadInfo { pid, tid, name });
                threads.push(tid);
            }
        }
        selection.clear_monitored_targets();
        selection.add_monitored_threads(threads);
    }

    /// Periodically rescans /proc and opens event files for newly created
    /// threads.
    fn start_new_thread_monitor(&self, monitored_processes: BTreeSet<pid_t>) -> crate::Result<()> {
        // Files opened for new threads must start counting immediately.
        self.selection.borrow_mut().set_enable_condition(true, false);
        let selection = Rc::clone(&self.selection);
        let thread_info = Rc::clone(&self.thread_info);
        let system_wide = self.system_wide;
        let evloop = Rc::clone(self.selection.borrow().io_event_loop());
        evloop.add_periodic_event(NEW_THREAD_SCAN_INTERVAL, move || {
            let mut new_tids = BTreeSet::new();
            {
                let known = thread_info.borrow();
                let pids = if system_wide {
                    env::all_processes()
                } else {
                    monitored_processes.iter().copied().collect()
                };
                for pid in pids {
                    for tid in env::threads_in_process(pid) {
                        if !known.contains_key(&tid) {
                            new_tids.insert(tid);
                        }
                    }
                }
            }
            let mut open_tids = BTreeSet::new();
            for tid in new_tids {
                if let Some((name, pid)) = env::read_thread_name_and_pid(tid) {
                    thread_info
                        .borrow_mut()
                        .insert(tid, ThreadInfo { pid, tid, name });
                    open_tids.insert(tid);
                }
            }
            if !open_tids.is_empty() {
                // New threads may already be gone by the time we open files
                // for them; that's not an error.
                if let Err(e) = selection
                    .borrow_mut()
                    .open_event_files_for_threads(&open_tids)
                {
                    debug!("couldn't open event files for new threads: {e}");
                }
            }
            Ok(())
        })?;
        Ok(())
    }

    fn check_hardware_counter_multiplexing(&self) {
        for (cpu, hardware_events) in self.selection.borrow().hardware_counters_for_cpus() {
            if hardware_events == 0 {
                continue;
            }
            if check_hardware_counters_on_cpu(cpu, hardware_events + 1) == Some(false) {
                warn!(
                    "The number of hardware events is near or above the number of available\n\
                     CPU PMU hardware counters. That triggers hardware counter multiplexing:\n\
                     events are not counted all the time processes are running, and counts\n\
                     are smaller than what really happens.\n\
                     Use --print-hw-counter to show available hardware counters."
                );
                break;
            }
        }
    }

    fn print_warning_for_inaccurate_events(&self) {
        for spec in self.selection.borrow().event_specs() {
            if spec.event_type.name == "raw-l3d-cache-lmiss-rd" {
                warn!(
                    "PMU event L3D_CACHE_LMISS_RD might undercount on A510. \
                     Please use L3D_CACHE_REFILL_RD instead."
                );
                break;
            }
        }
    }
}

/// Replays `--cpu`/`-e`/`--group`/`--tp-filter` in their command-line order:
/// a `--cpu` applies to the event groups after it, and a `--tp-filter`
/// attaches to the group before it.
fn apply_ordered_options(
    selection: &mut EventSelectionSet,
    matches: &ArgMatches,
) -> crate::Result<()> {
    #[derive(Clone, Copy)]
    enum Kind {
        Cpu,
        Event,
        Group,
        TpFilter,
    }

    let mut ordered: Vec<(usize, Kind, String)> = Vec::new();
    for (id, kind) in [
        ("cpus", Kind::Cpu),
        ("events", Kind::Event),
        ("groups", Kind::Group),
        ("tp_filters", Kind::TpFilter),
    ] {
        let (Some(indices), Some(values)) =
            (matches.indices_of(id), matches.get_many::<String>(id))
        else {
            continue;
        };
        for (index, value) in indices.zip(values) {
            ordered.push((index, kind, value.clone()));
        }
    }
    ordered.sort_by_key(|(index, _, _)| *index);

    for (_, kind, value) in ordered {
        match kind {
            Kind::Cpu => {
                let cpus = env::parse_cpu_list(&value)
                    .ok_or_else(|| Error::ConfigConflict(format!("invalid cpu list: {value}")))?;
                selection.set_cpus_for_new_events(cpus);
            }
            Kind::Event => {
                for event in value.split(',') {
                    selection.add_event_type(event, true)?;
                }
            }
            Kind::Group => {
                let names: Vec<String> = value.split(',').map(String::from).collect();
                selection.add_event_group(&names, true)?;
            }
            Kind::TpFilter => selection.set_tracepoint_filter(&value)?,
        }
    }
    Ok(())
}

struct Printer {
    csv: bool,
    verbose: bool,
    interval_only_values: bool,
    report_per_thread: bool,
    report_per_core: bool,
    comparator: Option<SummaryComparator>,
    thread_info: Rc<RefCell<HashMap<pid_t, ThreadInfo>>>,
    /// Shadow of the previous read, for `--interval-only-values` deltas.
    last_sum_values: Vec<Vec<CounterSum>>,
    out: Box<dyn Write>,
    start_time: Instant,
}

impl Printer {
    fn print(&mut self, selection: &mut EventSelectionSet) -> crate::Result<()> {
        let mut counters = selection.read_counters()?;
        let duration_in_sec = self.start_time.elapsed().as_secs_f64();
        if self.interval_only_values {
            self.adjust_to_interval_only_values(&mut counters);
        }
        self.show_counters(&counters, duration_in_sec)?;
        Ok(())
    }

    /// Rewrites cumulative readings into per-interval deltas, keeping the
    /// running sums across calls.
    fn adjust_to_interval_only_values(&mut self, counters: &mut [CountersInfo]) {
        if self.last_sum_values.len() < counters.len() {
            self.last_sum_values.resize(counters.len(), vec![]);
        }
        for (counters_info, last_sum) in counters.iter_mut().zip(&mut self.last_sum_values) {
            if last_sum.len() < counters_info.counters.len() {
                last_sum.resize(counters_info.counters.len(), CounterSum::default());
            }
            for (counter_info, last) in counters_info.counters.iter_mut().zip(last_sum.iter_mut()) {
                let new_sum = CounterSum::from_counter(&counter_info.counter);
                new_sum.sub(*last).to_counter(&mut counter_info.counter);
                *last = new_sum;
            }
        }
    }

    fn show_counters(&mut self, counters: &[CountersInfo], duration_in_sec: f64) -> crate::Result<()> {
        if self.csv {
            writeln!(self.out, "Performance counter statistics,")?;
        } else {
            writeln!(self.out, "Performance counter statistics:\n")?;
        }

        if self.verbose {
            for counters_info in counters {
                for counter_info in &counters_info.counters {
                    let c = &counter_info.counter;
                    if self.csv {
                        writeln!(
                            self.out,
                            "{},tid,{},cpu,{},count,{},time_enabled,{},time running,{},id,{},",
                            counters_info.event_name,
                            counter_info.tid,
                            counter_info.cpu,
                            c.value,
                            c.time_enabled,
                            c.time_running,
                            c.id
                        )?;
                    } else {
                        writeln!(
                            self.out,
                            "{}(tid {}, cpu {}): count {}, time_enabled {}, time running {}, id {}",
                            counters_info.event_name,
                            counter_info.tid,
                            counter_info.cpu,
                            c.value,
                            c.time_enabled,
                            c.time_running,
                            c.id
                        )?;
                    }
                }
            }
        }

        let mut builder = CounterSummaryBuilder::new(
            self.report_per_thread,
            self.report_per_core,
            self.csv,
            self.thread_info.borrow().clone(),
            self.comparator.clone(),
        );
        for info in counters {
            builder.add_counters_for_one_event_type(info);
        }
        let mut summaries = CounterSummaries::new(builder.build(), self.csv);
        summaries.auto_generate_summaries();
        summaries.generate_comments(duration_in_sec);
        summaries.show(&mut self.out)?;

        if self.csv {
            writeln!(self.out, "Total test time,{duration_in_sec:.6},seconds,")?;
        } else {
            writeln!(self.out, "\nTotal test time: {duration_in_sec:.6} seconds.")?;
        }
        self.out.flush()?;
        Ok(())
    }
}

/// Opens `counters` grouped cycles events pinned to `cpu` around a short
/// CPU-affine workload, reporting whether they all stayed on hardware.
/// `None` means the probe itself failed.
fn check_hardware_counters_on_cpu(cpu: i32, counters: usize) -> Option<bool> {
    if counters == 0 {
        return Some(true);
    }
    let ty = find_event_type("cpu-cycles")?;
    let mut attr = default_attr(&ty);
    attr.set_flag(b::ATTR_FLAG_EXCLUDE_KERNEL, true);

    let mut workload = Workload::create(&["sleep".to_string(), "0.1".to_string()]).ok()?;
    workload.set_cpu_affinity(cpu).ok()?;

    let mut fds: Vec<EventFd> = Vec::with_capacity(counters);
    for _ in 0..counters {
        let leader = fds.first();
        match EventFd::open(&attr, workload.pid(), cpu, leader, &ty.name, false) {
            Ok(fd) => fds.push(fd),
            Err(_) => return Some(false),
        }
    }
    workload.start().ok()?;
    workload.wait_child_process().ok()?;
    for fd in &fds {
        let counter = fd.read_counter().ok()?;
        if counter.time_enabled == 0 || counter.time_enabled > counter.time_running {
            return Some(false);
        }
    }
    Some(true)
}

fn hardware_counters_on_cpu(cpu: i32) -> Option<usize> {
    let mut available = 0;
    loop {
        match check_hardware_counters_on_cpu(cpu, available + 1)? {
            true => available += 1,
            false => break,
        }
    }
    Some(available)
}

fn print_hardware_counters() {
    for cpu in env::online_cpus() {
        match hardware_counters_on_cpu(cpu) {
            Some(counters) => {
                println!("There are {counters} CPU PMU hardware counters available on cpu {cpu}.");
            }
            // A 32-bit build can't set affinity to a 64-bit only cpu, so the
            // probe may fail without the cpu being broken.
            None => warn!("failed to get CPU PMU hardware counters on cpu {cpu}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fd::CounterReading;
    use crate::selection::CounterInfo;

    fn info(values: &[u64]) -> CountersInfo {
        CountersInfo {
            group_id: 0,
            event_name: "cpu-cycles".to_string(),
            event_modifier: String::new(),
            counters: values
                .iter()
                .map(|&v| CounterInfo {
                    tid: 1,
                    cpu: 0,
                    counter: CounterReading {
                        value: v,
                        time_enabled: v,
                        time_running: v,
                        id: 0,
                    },
                })
                .collect(),
        }
    }

    fn printer() -> Printer {
        Printer {
            csv: false,
            verbose: false,
            interval_only_values: true,
            report_per_thread: false,
            report_per_core: false,
            comparator: None,
            thread_info: Rc::new(RefCell::new(HashMap::new())),
            last_sum_values: vec![],
            out: Box::new(io::sink()),
            start_time: Instant::now(),
        }
    }

    #[test]
    fn interval_only_values_subtracts_previous_sums() {
        let mut printer = printer();

        let mut first = vec![info(&[100])];
        printer.adjust_to_interval_only_values(&mut first);
        assert_eq!(first[0].counters[0].counter.value, 100);

        let mut second = vec![info(&[250])];
        printer.adjust_to_interval_only_values(&mut second);
        assert_eq!(second[0].counters[0].counter.value, 150);

        let mut third = vec![info(&[400])];
        printer.adjust_to_interval_only_values(&mut third);
        assert_eq!(third[0].counters[0].counter.value, 150);
        assert_eq!(third[0].counters[0].counter.time_enabled, 150);
    }

    #[test]
    fn interval_shadow_grows_with_new_fds() {
        let mut printer = printer();
        let mut first = vec![info(&[100])];
        printer.adjust_to_interval_only_values(&mut first);
        // A new thread appeared: one more counter than last interval.
        let mut second = vec![info(&[150, 30])];
        printer.adjust_to_interval_only_values(&mut second);
        assert_eq!(second[0].counters[0].counter.value, 50);
        assert_eq!(second[0].counters[1].counter.value, 30);
    }

    #[derive(Clone, Default)]
    struct SharedBuf(Rc<RefCell<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn csv_output_frames_summaries() {
        let buf = SharedBuf::default();
        let mut printer = printer();
        printer.csv = true;
        printer.interval_only_values = false;
        printer.out = Box::new(buf.clone());
        printer.show_counters(&[info(&[1000])], 0.5).unwrap();
        let text = String::from_utf8(buf.0.borrow().clone()).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines[0], "Performance counter statistics,");
        assert!(lines[1].starts_with("1000,cpu-cycles,"));
        assert!(lines.last().unwrap().starts_with("Total test time,0.5"));
        assert!(lines.last().unwrap().ends_with(",seconds,"));
    }
}
