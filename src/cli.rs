//! Command-line surface of the stat command.
//!
//! `--cpu` affects only the event groups that follow it, so the relative
//! order of `--cpu`/`-e`/`--group`/`--tp-filter` matters; the driver replays
//! them in command-line order using `ArgMatches::indices_of`.

use std::path::PathBuf;

use clap::Parser;
use libc::pid_t;

#[derive(Parser, Debug)]
#[command(
    name = "perfstat",
    about = "Gather performance counter information of running [COMMAND]",
    after_help = "Without -a/-p/-t, a [COMMAND] is profiled for its lifetime."
)]
pub struct Args {
    /// Collect system-wide information.
    #[arg(short = 'a', long = "system-wide", conflicts_with_all = ["pids", "tids"])]
    pub system_wide: bool,

    /// Monitor events on the listed cpus (e.g. 0-3,5). Affects the event
    /// groups following it.
    #[arg(long = "cpu", value_name = "CPUS")]
    pub cpus: Vec<String>,

    /// Write the report in comma-separated form.
    #[arg(long)]
    pub csv: bool,

    /// Monitor for the given number of seconds instead of running [COMMAND].
    #[arg(long, value_name = "SECONDS")]
    pub duration: Option<f64>,

    /// Print stats every given number of milliseconds.
    #[arg(long, value_name = "MILLISECONDS")]
    pub interval: Option<f64>,

    /// Print the counts of each interval instead of cumulative counts.
    #[arg(long)]
    pub interval_only_values: bool,

    /// Events to count, with optional :u/:k modifiers (e.g.
    /// cpu-cycles,branch-misses:u). May be given several times.
    #[arg(short = 'e', long = "event", value_name = "EVENTS")]
    pub events: Vec<String>,

    /// Like -e, but the listed events form a group the kernel schedules in
    /// and out atomically.
    #[arg(long = "group", value_name = "EVENTS")]
    pub groups: Vec<String>,

    /// Don't count child threads and processes of the workload.
    #[arg(long = "no-inherit")]
    pub no_inherit: bool,

    /// Write the report to a file instead of standard output.
    #[arg(short = 'o', value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Write the report to an already opened file descriptor.
    #[arg(long = "out-fd", value_name = "FD", hide = true)]
    pub out_fd: Option<i32>,

    /// Stop the session when this file descriptor becomes readable.
    #[arg(long = "stop-signal-fd", value_name = "FD", hide = true)]
    pub stop_signal_fd: Option<i32>,

    /// Report counters for each cpu core.
    #[arg(long = "per-core")]
    pub per_core: bool,

    /// Report counters for each thread.
    #[arg(long = "per-thread")]
    pub per_thread: bool,

    /// Also open counters for threads created after the session starts.
    /// Needs --per-thread and --no-inherit.
    #[arg(long = "monitor-new-thread")]
    pub monitor_new_thread: bool,

    /// Stat events on existing processes.
    #[arg(short = 'p', value_name = "PIDS", value_delimiter = ',')]
    pub pids: Vec<pid_t>,

    /// Stat events on existing threads.
    #[arg(short = 't', value_name = "TIDS", value_delimiter = ',')]
    pub tids: Vec<pid_t>,

    /// Set a filter on the previous tracepoint event, e.g.
    /// 'prev_comm != "perfstat" && (prev_pid > 1)'.
    #[arg(long = "tp-filter", value_name = "FILTER")]
    pub tp_filters: Vec<String>,

    /// Test and print the CPU PMU hardware counters available per cpu.
    #[arg(long = "print-hw-counter")]
    pub print_hw_counter: bool,

    /// Sort keys for --per-thread/--per-core reports, from
    /// count,count_per_thread,cpu,pid,tid,comm.
    #[arg(long, value_name = "KEYS", value_delimiter = ',')]
    pub sort: Option<Vec<String>>,

    /// Ask devfreq to release PMU counters held by the memory-latency
    /// governor for the session. Needs root; may leave the performance
    /// governor behind if the process is killed.
    #[arg(long = "use-devfreq-counters")]
    pub use_devfreq_counters: bool,

    /// Dump raw counter values per event file.
    #[arg(long)]
    pub verbose: bool,

    /// Workload command to profile.
    #[arg(value_name = "COMMAND", trailing_var_arg = true)]
    pub workload: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_typical_stat_invocation() {
        let args = Args::parse_from([
            "perfstat",
            "-e",
            "cpu-cycles,instructions",
            "--duration",
            "2",
            "--csv",
            "sleep",
            "1",
        ]);
        assert_eq!(args.events, vec!["cpu-cycles,instructions"]);
        assert_eq!(args.duration, Some(2.0));
        assert!(args.csv);
        assert_eq!(args.workload, vec!["sleep", "1"]);
    }

    #[test]
    fn pid_lists_split_on_commas() {
        let args = Args::parse_from(["perfstat", "-p", "1,2,3", "-t", "7"]);
        assert_eq!(args.pids, vec![1, 2, 3]);
        assert_eq!(args.tids, vec![7]);
    }

    #[test]
    fn system_wide_conflicts_with_targets() {
        assert!(Args::try_parse_from(["perfstat", "-a", "-p", "1"]).is_err());
        assert!(Args::try_parse_from(["perfstat", "-a", "-t", "1"]).is_err());
    }
}
