//! Aggregation of raw counter readings into per-event summaries, with
//! derived rate comments and text/CSV rendering.

use std::collections::HashMap;
use std::io::{self, Write};

use arrayvec::ArrayVec;
use libc::pid_t;

use crate::error::{Error, Result};
use crate::fd::CounterReading;
use crate::selection::CountersInfo;

/// Scales within `[1, 1 + 1e-5]` mean the event owned a counter for the whole
/// session; such summaries are comparable even across groups.
const SCALE_ERROR_LIMIT: f64 = 1e-5;

/// Miss events whose rate is computed against a sibling base event.
const COMMON_EVENT_RATE_MAP: &[(&str, &str, &str)] = &[
    ("cache-misses", "cache-references", "miss rate"),
    ("branch-misses", "branch-instructions", "miss rate"),
];

// "Meaningful ratios between common microarchitectural events" from the ARMv8
// specification, keyed by the kernel's raw PMU event names.
const ARM_EVENT_RATE_MAP: &[(&str, &str, &str)] = &[
    ("raw-l1i-cache-refill", "raw-l1i-cache", "level 1 instruction cache refill rate"),
    ("raw-l1i-tlb-refill", "raw-l1i-tlb", "level 1 instruction TLB refill rate"),
    ("raw-l1d-cache-refill", "raw-l1d-cache", "level 1 data or unified cache refill rate"),
    ("raw-l1d-tlb-refill", "raw-l1d-tlb", "level 1 data or unified TLB refill rate"),
    ("raw-l2d-cache-refill", "raw-l2d-cache", "level 2 data or unified cache refill rate"),
    ("raw-l2i-cache-refill", "raw-l2i-cache", "level 2 instruction cache refill rate"),
    ("raw-l3d-cache-refill", "raw-l3d-cache", "level 3 data or unified cache refill rate"),
    ("raw-l2d-tlb-refill", "raw-l2d-tlb", "level 2 data or unified TLB refill rate"),
    ("raw-l2i-tlb-refill", "raw-l2i-tlb", "level 2 instruction TLB refill rate"),
    ("raw-bus-access", "raw-bus-cycles", "bus accesses per cycle"),
    ("raw-ll-cache-miss", "raw-ll-cache", "last level data or unified cache refill rate"),
    ("raw-dtlb-walk", "raw-l1d-tlb", "data TLB miss rate"),
    ("raw-itlb-walk", "raw-l1i-tlb", "instruction TLB miss rate"),
    ("raw-ll-cache-miss-rd", "raw-ll-cache-rd", "memory read operation miss rate"),
    ("raw-remote-access-rd", "raw-remote-access", "read accesses to another socket in a multi-socket system"),
    ("raw-l1d-cache-refill-rd", "raw-l1d-cache-rd", "level 1 cache refill rate, read"),
    ("raw-l1d-cache-refill-wr", "raw-l1d-cache-wr", "level 1 cache refill rate, write"),
    ("raw-l1d-tlb-refill-rd", "raw-l1d-tlb-rd", "level 1 TLB refill rate, read"),
    ("raw-l1d-tlb-refill-wr", "raw-l1d-tlb-wr", "level 1 TLB refill rate, write"),
    ("raw-l2d-cache-refill-rd", "raw-l2d-cache-rd", "level 2 data cache refill rate, read"),
    ("raw-l2d-cache-refill-wr", "raw-l2d-cache-wr", "level 2 data cache refill rate, write"),
    ("raw-l2d-tlb-refill-rd", "raw-l2d-tlb-rd", "level 2 data TLB refill rate, read"),
];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ThreadInfo {
    pub pid: pid_t,
    pub tid: pid_t,
    pub name: String,
}

/// Sum of counter readings, used both for aggregation and for the
/// interval-delta adjustment in the stat driver.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CounterSum {
    pub value: u64,
    pub time_enabled: u64,
    pub time_running: u64,
}

impl CounterSum {
    pub fn from_counter(counter: &CounterReading) -> Self {
        Self {
            value: counter.value,
            time_enabled: counter.time_enabled,
            time_running: counter.time_running,
        }
    }

    pub fn to_counter(self, counter: &mut CounterReading) {
        counter.value = self.value;
        counter.time_enabled = self.time_enabled;
        counter.time_running = self.time_running;
    }

    pub fn sub(self, other: CounterSum) -> CounterSum {
        CounterSum {
            value: self.value.wrapping_sub(other.value),
            time_enabled: self.time_enabled.wrapping_sub(other.time_enabled),
            time_running: self.time_running.wrapping_sub(other.time_running),
        }
    }

    fn add_scaled(&mut self, counter: &CounterReading) {
        self.value += scaled_count(counter);
        self.time_enabled += counter.time_enabled;
        self.time_running += counter.time_running;
    }
}

/// The multiplexing-corrected count of one reading:
/// `value * time_enabled / time_running`, raw when the runtime is zero.
fn scaled_count(counter: &CounterReading) -> u64 {
    if counter.time_running == 0 || counter.time_running >= counter.time_enabled {
        return counter.value;
    }
    (counter.value as f64 * counter.time_enabled as f64 / counter.time_running as f64) as u64
}

#[derive(Clone, Debug)]
pub struct CounterSummary {
    pub type_name: String,
    pub modifier: String,
    pub group_id: usize,
    pub thread: Option<ThreadInfo>,
    /// -1 unless per-core aggregation is active.
    pub cpu: i32,
    pub count: u64,
    /// Count of the same event summed across the thread's cpus; only
    /// meaningful for sorting in per-thread mode.
    pub count_per_thread: u64,
    pub runtime_in_ns: u64,
    pub scale: f64,
    pub auto_generated: bool,
    pub readable_count: String,
    pub comment: String,
}

impl CounterSummary {
    #[allow(clippy::too_many_arguments)]
    fn new(
        type_name: &str,
        modifier: &str,
        group_id: usize,
        thread: Option<ThreadInfo>,
        cpu: i32,
        count: u64,
        runtime_in_ns: u64,
        scale: f64,
        auto_generated: bool,
        csv: bool,
    ) -> Self {
        let mut summary = Self {
            type_name: type_name.to_string(),
            modifier: modifier.to_string(),
            group_id,
            thread,
            cpu,
            count,
            count_per_thread: count,
            runtime_in_ns,
            scale,
            auto_generated,
            readable_count: String::new(),
            comment: String::new(),
        };
        summary.readable_count = summary.readable_count_value(csv);
        summary
    }

    pub fn name(&self) -> String {
        if self.modifier.is_empty() {
            self.type_name.clone()
        } else {
            format!("{}:{}", self.type_name, self.modifier)
        }
    }

    fn readable_count_value(&self, csv: bool) -> String {
        if self.type_name == "cpu-clock" || self.type_name == "task-clock" {
            // The clock events count nanoseconds.
            return format!("{:.6}(ms)", self.count as f64 / 1e6);
        }
        if csv {
            return self.count.to_string();
        }
        group_digits(self.count)
    }

    fn monitored_all_the_time(&self) -> bool {
        (self.scale - 1.0).abs() < SCALE_ERROR_LIMIT
    }

    fn monitored_at_the_same_time(&self, other: &CounterSummary) -> bool {
        // Events in the same group are scheduled together by the kernel;
        // otherwise both must have been on hardware the whole session.
        if self.group_id == other.group_id {
            return true;
        }
        self.monitored_all_the_time() && other.monitored_all_the_time()
    }
}

fn group_digits(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    let lead = digits.len() % 3;
    for (i, c) in digits.chars().enumerate() {
        if i != 0 && (i + 3 - lead) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SortKey {
    Count,
    CountPerThread,
    Cpu,
    Pid,
    Tid,
    Comm,
}

/// Sort order for per-thread/per-core reports. At most the six known keys.
#[derive(Clone, Debug, Default)]
pub struct SummaryComparator {
    keys: ArrayVec<SortKey, 6>,
}

/// Translates user sort keys into a comparator. Keys that only apply to an
/// inactive aggregation mode are dropped; unknown keys are an error.
pub fn build_summary_comparator(
    keys: &[String],
    report_per_thread: bool,
    report_per_core: bool,
) -> Result<SummaryComparator> {
    let mut comparator = SummaryComparator::default();
    for key in keys {
        let parsed = match key.as_str() {
            "count" => Some(SortKey::Count),
            "count_per_thread" => report_per_thread.then_some(SortKey::CountPerThread),
            "cpu" => report_per_core.then_some(SortKey::Cpu),
            "pid" => report_per_thread.then_some(SortKey::Pid),
            "tid" => report_per_thread.then_some(SortKey::Tid),
            "comm" => report_per_thread.then_some(SortKey::Comm),
            _ => {
                return Err(Error::ConfigConflict(format!("unknown sort key: {key}")));
            }
        };
        if let Some(parsed) = parsed {
            if comparator.keys.len() == comparator.keys.capacity() {
                return Err(Error::ConfigConflict("too many sort keys".into()));
            }
            comparator.keys.push(parsed);
        }
    }
    Ok(comparator)
}

impl SummaryComparator {
    fn compare(&self, a: &CounterSummary, b: &CounterSummary) -> std::cmp::Ordering {
        use std::cmp::Ordering;
        for key in &self.keys {
            let ordering = match key {
                // Bigger counts first.
                SortKey::Count => b.count.cmp(&a.count),
                SortKey::CountPerThread => b.count_per_thread.cmp(&a.count_per_thread),
                SortKey::Cpu => a.cpu.cmp(&b.cpu),
                SortKey::Pid => thread_field(a, |t| t.pid).cmp(&thread_field(b, |t| t.pid)),
                SortKey::Tid => thread_field(a, |t| t.tid).cmp(&thread_field(b, |t| t.tid)),
                SortKey::Comm => {
                    let name = |s: &CounterSummary| {
                        s.thread.as_ref().map(|t| t.name.clone()).unwrap_or_default()
                    };
                    name(a).cmp(&name(b))
                }
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }
}

fn thread_field(s: &CounterSummary, f: impl Fn(&ThreadInfo) -> pid_t) -> pid_t {
    s.thread.as_ref().map(&f).unwrap_or(-1)
}

/// Builds summaries from raw counters, honoring the aggregation mode.
pub struct CounterSummaryBuilder {
    report_per_thread: bool,
    report_per_core: bool,
    csv: bool,
    thread_map: HashMap<pid_t, ThreadInfo>,
    comparator: Option<SummaryComparator>,
    summaries: Vec<CounterSummary>,
}

impl CounterSummaryBuilder {
    pub fn new(
        report_per_thread: bool,
        report_per_core: bool,
        csv: bool,
        thread_map: HashMap<pid_t, ThreadInfo>,
        comparator: Option<SummaryComparator>,
    ) -> Self {
        Self {
            report_per_thread,
            report_per_core,
            csv,
            thread_map,
            comparator,
            summaries: vec![],
        }
    }

    pub fn add_counters_for_one_event_type(&mut self, info: &CountersInfo) {
        // Aggregation key is (tid, cpu), collapsed to wildcards for the
        // inactive dimensions.
        let mut sums: Vec<((pid_t, i32), CounterSum)> = Vec::new();
        for counter_info in &info.counters {
            let tid = if self.report_per_thread {
                counter_info.tid
            } else {
                -1
            };
            let cpu = if self.report_per_core {
                counter_info.cpu
            } else {
                -1
            };
            match sums.iter_mut().find(|(key, _)| *key == (tid, cpu)) {
                Some((_, sum)) => sum.add_scaled(&counter_info.counter),
                None => {
                    let mut sum = CounterSum::default();
                    sum.add_scaled(&counter_info.counter);
                    sums.push(((tid, cpu), sum));
                }
            }
        }

        let start = self.summaries.len();
        for ((tid, cpu), sum) in sums {
            let thread = if self.report_per_thread {
                Some(self.thread_map.get(&tid).cloned().unwrap_or(ThreadInfo {
                    pid: tid,
                    tid,
                    name: "unknown".to_string(),
                }))
            } else {
                None
            };
            let scale = if sum.time_running < sum.time_enabled && sum.time_running != 0 {
                sum.time_enabled as f64 / sum.time_running as f64
            } else {
                1.0
            };
            self.summaries.push(CounterSummary::new(
                &info.event_name,
                &info.event_modifier,
                info.group_id,
                thread,
                cpu,
                sum.value,
                sum.time_running,
                scale,
                false,
                self.csv,
            ));
        }
        self.fill_count_per_thread(start);
        self.sort_range(start);
    }

    fn fill_count_per_thread(&mut self, start: usize) {
        if !self.report_per_thread {
            return;
        }
        let mut per_thread: HashMap<pid_t, u64> = HashMap::new();
        for summary in &self.summaries[start..] {
            let tid = thread_field(summary, |t| t.tid);
            *per_thread.entry(tid).or_insert(0) += summary.count;
        }
        for summary in &mut self.summaries[start..] {
            let tid = summary.thread.as_ref().map(|t| t.tid).unwrap_or(-1);
            summary.count_per_thread = per_thread[&tid];
        }
    }

    // Sorting is stable and scoped to one event type's block, so ties keep
    // insertion order and event blocks keep command-line order.
    fn sort_range(&mut self, start: usize) {
        if let Some(comparator) = self.comparator.clone() {
            self.summaries[start..].sort_by(|a, b| comparator.compare(a, b));
        }
    }

    pub fn build(self) -> Vec<CounterSummary> {
        self.summaries
    }
}

/// The finished summary set, ready for comment generation and rendering.
pub struct CounterSummaries {
    summaries: Vec<CounterSummary>,
    csv: bool,
}

impl CounterSummaries {
    pub fn new(summaries: Vec<CounterSummary>, csv: bool) -> Self {
        Self { summaries, csv }
    }

    pub fn summaries(&self) -> &[CounterSummary] {
        &self.summaries
    }

    pub fn find_summary(
        &self,
        type_name: &str,
        modifier: &str,
        thread: Option<&ThreadInfo>,
        cpu: i32,
    ) -> Option<&CounterSummary> {
        self.summaries.iter().find(|s| {
            s.type_name == type_name
                && s.modifier == modifier
                && s.thread.as_ref() == thread
                && s.cpu == cpu
        })
    }

    /// For each `event:u` summary with a simultaneously monitored `event:k`
    /// sibling, synthesizes the unmodified `event` summary as their sum.
    pub fn auto_generate_summaries(&mut self) {
        for i in 0..self.summaries.len() {
            if self.summaries[i].modifier != "u" {
                continue;
            }
            let s = self.summaries[i].clone();
            let Some(other) = self.find_summary(&s.type_name, "k", s.thread.as_ref(), s.cpu) else {
                continue;
            };
            if !other.monitored_at_the_same_time(&s) {
                continue;
            }
            let other_count = other.count;
            if self
                .find_summary(&s.type_name, "", s.thread.as_ref(), s.cpu)
                .is_none()
            {
                self.summaries.push(CounterSummary::new(
                    &s.type_name,
                    "",
                    s.group_id,
                    s.thread.clone(),
                    s.cpu,
                    s.count + other_count,
                    s.runtime_in_ns,
                    s.scale,
                    true,
                    self.csv,
                ));
            }
        }
    }

    pub fn generate_comments(&mut self, duration_in_sec: f64) {
        for i in 0..self.summaries.len() {
            let comment = self.comment_for_summary(&self.summaries[i], duration_in_sec);
            self.summaries[i].comment = comment;
        }
    }

    fn comment_for_summary(&self, s: &CounterSummary, duration_in_sec: f64) -> String {
        let sep = if self.csv { ',' } else { ' ' };
        if s.type_name == "task-clock" {
            let run_sec = s.count as f64 / 1e9;
            return format!("{:.6}{sep}cpus used", run_sec / duration_in_sec);
        }
        if s.type_name == "cpu-clock" {
            return String::new();
        }
        if s.type_name == "cpu-cycles" {
            if s.runtime_in_ns == 0 {
                return String::new();
            }
            return format!("{:.6}{sep}GHz", s.count as f64 / s.runtime_in_ns as f64);
        }
        if s.type_name == "instructions" && s.count != 0 {
            if let Some(other) = self.find_summary("cpu-cycles", &s.modifier, s.thread.as_ref(), s.cpu)
            {
                if other.monitored_at_the_same_time(s) {
                    let cpi = other.count as f64 / s.count as f64;
                    return format!("{cpi:.6}{sep}cycles per instruction");
                }
            }
        }
        if let Some(comment) = self.rate_comment(s, sep) {
            return comment;
        }
        if s.runtime_in_ns == 0 {
            return String::new();
        }
        let rate = s.count as f64 / (s.runtime_in_ns as f64 / 1e9);
        if rate >= 1e9 - 1e5 {
            format!("{:.3}{sep}G/sec", rate / 1e9)
        } else if rate >= 1e6 - 1e2 {
            format!("{:.3}{sep}M/sec", rate / 1e6)
        } else if rate >= 1e3 {
            format!("{:.3}{sep}K/sec", rate / 1e3)
        } else {
            format!("{rate:.3}{sep}/sec")
        }
    }

    fn rate_comment(&self, s: &CounterSummary, sep: char) -> Option<String> {
        let lookup = |map: &[(&str, &str, &str)]| {
            map.iter()
                .find(|(miss, _, _)| *miss == s.type_name)
                .map(|&(_, base, desc)| (base.to_string(), desc.to_string()))
        };
        let mut base_event = lookup(COMMON_EVENT_RATE_MAP);
        if base_event.is_none() && cfg!(any(target_arch = "arm", target_arch = "aarch64")) {
            base_event = lookup(ARM_EVENT_RATE_MAP);
        }
        if base_event.is_none() {
            // The *-misses naming convention pairs with the plural base
            // event, e.g. dTLB-load-misses against dTLB-loads.
            if let Some(stem) = s.type_name.strip_suffix("-misses") {
                base_event = Some((format!("{stem}s"), "miss rate".to_string()));
            }
        }
        let (base, desc) = base_event?;
        let other = self.find_summary(&base, &s.modifier, s.thread.as_ref(), s.cpu)?;
        if !other.monitored_at_the_same_time(s) || other.count == 0 {
            return None;
        }
        let miss_rate = s.count as f64 / other.count as f64;
        Some(format!("{:.6}%{sep}{desc}", miss_rate * 100.0))
    }

    pub fn show(&self, w: &mut impl Write) -> io::Result<()> {
        let show_thread = self.summaries.first().is_some_and(|s| s.thread.is_some());
        let show_cpu = self.summaries.first().is_some_and(|s| s.cpu != -1);
        if self.csv {
            self.show_csv(w, show_thread, show_cpu)
        } else {
            self.show_text(w, show_thread, show_cpu)
        }
    }

    fn show_csv(&self, w: &mut impl Write, show_thread: bool, show_cpu: bool) -> io::Result<()> {
        for s in &self.summaries {
            if show_thread {
                let thread = s.thread.as_ref().expect("per-thread summaries carry threads");
                write!(w, "{},{},{},", thread.name, thread.pid, thread.tid)?;
            }
            if show_cpu {
                write!(w, "{},", s.cpu)?;
            }
            let generated = if s.auto_generated { "(generated)," } else { "" };
            writeln!(w, "{},{},{},{}", s.readable_count, s.name(), s.comment, generated)?;
        }
        Ok(())
    }

    fn show_text(&self, w: &mut impl Write, show_thread: bool, show_cpu: bool) -> io::Result<()> {
        let mut titles = Vec::new();
        if show_thread {
            titles.extend(["thread_name", "pid", "tid"]);
        }
        if show_cpu {
            titles.push("cpu");
        }
        titles.extend(["count", "event_name", " # count / runtime"]);

        let mut widths = vec![0usize; titles.len()];
        // The trailing comment title is long; it doesn't drive its column.
        for (i, title) in titles.iter().enumerate().take(titles.len() - 1) {
            widths[i] = widths[i].max(title.len());
        }
        for s in &self.summaries {
            let mut i = 0;
            let mut adjust = |w: &mut Vec<usize>, i: &mut usize, len: usize| {
                w[*i] = w[*i].max(len);
                *i += 1;
            };
            if let Some(thread) = s.thread.as_ref().filter(|_| show_thread) {
                adjust(&mut widths, &mut i, thread.name.len());
                adjust(&mut widths, &mut i, thread.pid.to_string().len());
                adjust(&mut widths, &mut i, thread.tid.to_string().len());
            }
            if show_cpu {
                adjust(&mut widths, &mut i, s.cpu.to_string().len());
            }
            adjust(&mut widths, &mut i, s.readable_count.len());
            adjust(&mut widths, &mut i, s.name().len());
            adjust(&mut widths, &mut i, s.comment.len());
        }

        write!(w, "# ")?;
        for (i, title) in titles.iter().enumerate() {
            if *title == "count" {
                write!(w, "{title:>width$}", width = widths[i])?;
            } else {
                write!(w, "{title:<width$}", width = widths[i])?;
            }
            if i + 1 < titles.len() {
                write!(w, "  ")?;
            }
        }
        writeln!(w)?;

        for s in &self.summaries {
            let mut i = 0;
            if let Some(thread) = s.thread.as_ref().filter(|_| show_thread) {
                write!(w, "  {:<width$}", thread.name, width = widths[i])?;
                write!(w, "  {:<width$}", thread.pid, width = widths[i + 1])?;
                write!(w, "  {:<width$}", thread.tid, width = widths[i + 2])?;
                i += 3;
            }
            if show_cpu {
                write!(w, "  {:<width$}", s.cpu, width = widths[i])?;
                i += 1;
            }
            writeln!(
                w,
                "  {:>cw$}  {:<nw$}   # {:<mw$}{}",
                s.readable_count,
                s.name(),
                s.comment,
                if s.auto_generated { " (generated)" } else { "" },
                cw = widths[i],
                nw = widths[i + 1],
                mw = widths[i + 2],
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selection::CounterInfo;

    fn reading(value: u64, enabled: u64, running: u64) -> CounterReading {
        CounterReading {
            value,
            time_enabled: enabled,
            time_running: running,
            id: 0,
        }
    }

    fn counters_info(
        group_id: usize,
        event_name: &str,
        modifier: &str,
        counters: Vec<CounterInfo>,
    ) -> CountersInfo {
        CountersInfo {
            group_id,
            event_name: event_name.to_string(),
            event_modifier: modifier.to_string(),
            counters,
        }
    }

    fn counter(tid: pid_t, cpu: i32, r: CounterReading) -> CounterInfo {
        CounterInfo {
            tid,
            cpu,
            counter: r,
        }
    }

    fn thread_map(threads: &[(pid_t, pid_t, &str)]) -> HashMap<pid_t, ThreadInfo> {
        threads
            .iter()
            .map(|&(pid, tid, name)| {
                (
                    tid,
                    ThreadInfo {
                        pid,
                        tid,
                        name: name.to_string(),
                    },
                )
            })
            .collect()
    }

    #[test]
    fn session_wide_aggregation_scales_per_fd() {
        let mut builder = CounterSummaryBuilder::new(false, false, false, HashMap::new(), None);
        // Second reading ran half the enabled time: value doubles.
        builder.add_counters_for_one_event_type(&counters_info(
            0,
            "instructions",
            "",
            vec![
                counter(1, 0, reading(1000, 100, 100)),
                counter(1, 1, reading(500, 100, 50)),
            ],
        ));
        let summaries = builder.build();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].count, 2000);
        assert_eq!(summaries[0].cpu, -1);
        assert!(summaries[0].thread.is_none());
        assert_eq!(summaries[0].runtime_in_ns, 150);
    }

    #[test]
    fn per_mode_totals_agree() {
        let counters = vec![
            counter(10, 0, reading(100, 10, 10)),
            counter(10, 1, reading(200, 10, 10)),
            counter(11, 0, reading(300, 10, 10)),
            counter(11, 1, reading(400, 10, 10)),
        ];
        let total = |per_thread: bool, per_core: bool| -> u64 {
            let threads = thread_map(&[(1, 10, "a"), (1, 11, "b")]);
            let mut builder =
                CounterSummaryBuilder::new(per_thread, per_core, false, threads, None);
            builder.add_counters_for_one_event_type(&counters_info(
                0,
                "cpu-cycles",
                "",
                counters.clone(),
            ));
            builder.build().iter().map(|s| s.count).sum()
        };
        let session = total(false, false);
        assert_eq!(session, 1000);
        assert_eq!(total(true, false), session);
        assert_eq!(total(false, true), session);
        assert_eq!(total(true, true), session);
    }

    #[test]
    fn auto_generated_summary_is_exact_sum() {
        let mut builder = CounterSummaryBuilder::new(false, false, false, HashMap::new(), None);
        builder.add_counters_for_one_event_type(&counters_info(
            0,
            "cpu-cycles",
            "u",
            vec![counter(1, 0, reading(123, 10, 10))],
        ));
        builder.add_counters_for_one_event_type(&counters_info(
            0,
            "cpu-cycles",
            "k",
            vec![counter(1, 0, reading(877, 10, 10))],
        ));
        let mut summaries = CounterSummaries::new(builder.build(), false);
        summaries.auto_generate_summaries();
        let generated = summaries.find_summary("cpu-cycles", "", None, -1).unwrap();
        assert!(generated.auto_generated);
        assert_eq!(generated.count, 1000);
        // A second pass must not duplicate it.
        summaries.auto_generate_summaries();
        assert_eq!(
            summaries
                .summaries()
                .iter()
                .filter(|s| s.modifier.is_empty())
                .count(),
            1
        );
    }

    #[test]
    fn comments_for_known_events() {
        let mut builder = CounterSummaryBuilder::new(false, false, false, HashMap::new(), None);
        builder.add_counters_for_one_event_type(&counters_info(
            0,
            "task-clock",
            "",
            vec![counter(1, 0, reading(2_000_000_000, 1, 1))],
        ));
        builder.add_counters_for_one_event_type(&counters_info(
            0,
            "cpu-cycles",
            "",
            vec![counter(1, 0, reading(3_000_000_000, 1_000_000_000, 1_000_000_000))],
        ));
        builder.add_counters_for_one_event_type(&counters_info(
            0,
            "instructions",
            "",
            vec![counter(1, 0, reading(6_000_000_000, 1_000_000_000, 1_000_000_000))],
        ));
        builder.add_counters_for_one_event_type(&counters_info(
            0,
            "branch-instructions",
            "",
            vec![counter(1, 0, reading(1_000_000, 1_000_000_000, 1_000_000_000))],
        ));
        builder.add_counters_for_one_event_type(&counters_info(
            0,
            "branch-misses",
            "",
            vec![counter(1, 0, reading(25_000, 1_000_000_000, 1_000_000_000))],
        ));
        builder.add_counters_for_one_event_type(&counters_info(
            0,
            "context-switches",
            "",
            vec![counter(1, 0, reading(2_500, 1_000_000_000, 1_000_000_000))],
        ));
        let mut summaries = CounterSummaries::new(builder.build(), false);
        summaries.generate_comments(2.0);

        let comment = |name: &str| {
            summaries
                .find_summary(name, "", None, -1)
                .unwrap()
                .comment
                .clone()
        };
        assert_eq!(comment("task-clock"), "1.000000 cpus used");
        assert_eq!(comment("cpu-cycles"), "3.000000 GHz");
        assert_eq!(comment("instructions"), "0.500000 cycles per instruction");
        assert_eq!(comment("branch-misses"), "2.500000% miss rate");
        // Plain events fall back to an auto-scaled rate.
        assert_eq!(comment("context-switches"), "2.500 K/sec");
    }

    #[test]
    fn miss_suffix_pairs_with_plural_base() {
        let mut builder = CounterSummaryBuilder::new(false, false, false, HashMap::new(), None);
        builder.add_counters_for_one_event_type(&counters_info(
            0,
            "dTLB-loads",
            "",
            vec![counter(1, 0, reading(1_000, 10, 10))],
        ));
        builder.add_counters_for_one_event_type(&counters_info(
            0,
            "dTLB-load-misses",
            "",
            vec![counter(1, 0, reading(10, 10, 10))],
        ));
        let mut summaries = CounterSummaries::new(builder.build(), false);
        summaries.generate_comments(1.0);
        let comment = &summaries
            .find_summary("dTLB-load-misses", "", None, -1)
            .unwrap()
            .comment;
        assert_eq!(comment, "1.000000% miss rate");
    }

    #[test]
    fn default_sort_is_count_per_thread_then_tid() {
        let comparator = build_summary_comparator(
            &["count_per_thread", "tid", "cpu", "count"].map(String::from),
            true,
            false,
        )
        .unwrap();
        let threads = thread_map(&[(1, 10, "busy"), (1, 11, "idle"), (1, 12, "mid")]);
        let mut builder = CounterSummaryBuilder::new(true, false, false, threads, Some(comparator));
        builder.add_counters_for_one_event_type(&counters_info(
            0,
            "cpu-cycles",
            "",
            vec![
                counter(11, 0, reading(10, 1, 1)),
                counter(12, 0, reading(500, 1, 1)),
                counter(10, 0, reading(900, 1, 1)),
            ],
        ));
        let summaries = builder.build();
        let tids: Vec<_> = summaries
            .iter()
            .map(|s| s.thread.as_ref().unwrap().tid)
            .collect();
        assert_eq!(tids, vec![10, 12, 11]);
    }

    #[test]
    fn unknown_sort_key_is_rejected() {
        assert!(build_summary_comparator(&["speed".to_string()], true, true).is_err());
        // Keys for inactive modes are dropped, not errors.
        let comparator =
            build_summary_comparator(&["cpu".to_string(), "count".to_string()], false, false)
                .unwrap();
        assert_eq!(comparator.keys.len(), 1);
    }

    #[test]
    fn csv_and_text_encode_the_same_values() {
        let build = |csv: bool| {
            let mut builder = CounterSummaryBuilder::new(false, false, csv, HashMap::new(), None);
            builder.add_counters_for_one_event_type(&counters_info(
                0,
                "instructions",
                "u",
                vec![counter(1, 0, reading(1_234_567, 10, 10))],
            ));
            let mut summaries = CounterSummaries::new(builder.build(), csv);
            summaries.generate_comments(1.0);
            let mut out = Vec::new();
            summaries.show(&mut out).unwrap();
            String::from_utf8(out).unwrap()
        };
        let text = build(false);
        let csv = build(true);
        assert!(text.contains("1,234,567"));
        assert!(text.contains("instructions:u"));
        let line = csv.lines().next().unwrap();
        let fields: Vec<_> = line.split(',').collect();
        assert_eq!(fields[0], "1234567");
        assert_eq!(fields[1], "instructions:u");
        // Same number, different digit grouping.
        assert_eq!(text.replace(',', "").contains("1234567"), true);
    }

    #[test]
    fn csv_numeric_fields_round_trip() {
        let mut builder = CounterSummaryBuilder::new(true, true, true, HashMap::new(), None);
        builder.add_counters_for_one_event_type(&counters_info(
            0,
            "cpu-cycles",
            "",
            vec![counter(42, 3, reading(987_654_321, 10, 10))],
        ));
        let summaries = CounterSummaries::new(builder.build(), true);
        let mut out = Vec::new();
        summaries.show(&mut out).unwrap();
        let csv = String::from_utf8(out).unwrap();
        let fields: Vec<_> = csv.lines().next().unwrap().split(',').collect();
        // thread_name,pid,tid,cpu,count,event_name,comment,
        assert_eq!(fields[1].parse::<i32>().unwrap(), 42);
        assert_eq!(fields[2].parse::<i32>().unwrap(), 42);
        assert_eq!(fields[3].parse::<i32>().unwrap(), 3);
        assert_eq!(fields[4].parse::<u64>().unwrap(), 987_654_321);
    }

    #[test]
    fn digit_grouping() {
        assert_eq!(group_digits(0), "0");
        assert_eq!(group_digits(999), "999");
        assert_eq!(group_digits(1000), "1,000");
        assert_eq!(group_digits(1234567), "1,234,567");
    }

    #[test]
    fn counter_sum_delta() {
        let a = CounterSum {
            value: 100,
            time_enabled: 20,
            time_running: 20,
        };
        let b = CounterSum {
            value: 340,
            time_enabled: 50,
            time_running: 45,
        };
        let delta = b.sub(a);
        assert_eq!(delta.value, 240);
        assert_eq!(delta.time_enabled, 30);
        assert_eq!(delta.time_running, 25);
    }
}
