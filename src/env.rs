//! Probing of the local environment through procfs and sysfs: online CPUs,
//! threads of monitored processes, kernel version, resource limits and the
//! optional devfreq governor swap.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use libc::pid_t;
use log::{debug, error, warn};

/// Parses a kernel cpu-list string like `0-3,5,7-8`.
pub fn parse_cpu_list(s: &str) -> Option<Vec<i32>> {
    let mut cpus = Vec::new();
    for part in s.trim().split(',') {
        if part.is_empty() {
            continue;
        }
        match part.split_once('-') {
            Some((lo, hi)) => {
                let lo: i32 = lo.trim().parse().ok()?;
                let hi: i32 = hi.trim().parse().ok()?;
                if lo > hi {
                    return None;
                }
                cpus.extend(lo..=hi);
            }
            None => cpus.push(part.trim().parse().ok()?),
        }
    }
    if cpus.is_empty() {
        return None;
    }
    cpus.sort_unstable();
    cpus.dedup();
    Some(cpus)
}

pub fn online_cpus() -> Vec<i32> {
    match fs::read_to_string("/sys/devices/system/cpu/online") {
        Ok(s) => parse_cpu_list(&s).unwrap_or_default(),
        Err(e) => {
            error!("failed to read online cpus: {e}");
            vec![]
        }
    }
}

pub fn all_processes() -> Vec<pid_t> {
    pids_in_dir("/proc")
}

pub fn threads_in_process(pid: pid_t) -> Vec<pid_t> {
    pids_in_dir(format!("/proc/{pid}/task"))
}

fn pids_in_dir(path: impl AsRef<Path>) -> Vec<pid_t> {
    let Ok(entries) = fs::read_dir(path.as_ref()) else {
        return vec![];
    };
    entries
        .filter_map(|e| e.ok()?.file_name().to_str()?.parse().ok())
        .collect()
}

pub fn is_thread_alive(tid: pid_t) -> bool {
    Path::new(&format!("/proc/{tid}")).exists()
}

/// Reads a thread's comm and the pid of its owning process from
/// `/proc/[tid]/status`.
pub fn read_thread_name_and_pid(tid: pid_t) -> Option<(String, pid_t)> {
    let status = fs::read_to_string(format!("/proc/{tid}/status")).ok()?;
    let mut name = None;
    let mut pid = None;
    for line in status.lines() {
        if let Some(value) = line.strip_prefix("Name:") {
            name = Some(value.trim().to_string());
        } else if let Some(value) = line.strip_prefix("Tgid:") {
            pid = value.trim().parse().ok();
        }
        if name.is_some() && pid.is_some() {
            break;
        }
    }
    Some((name?, pid?))
}

pub fn thread_name(tid: pid_t) -> Option<String> {
    let comm = fs::read_to_string(format!("/proc/{tid}/comm")).ok()?;
    Some(comm.trim_end_matches('\n').to_string())
}

/// `(major, minor)` of the running kernel, from `uname`.
pub fn kernel_version() -> Option<(u32, u32)> {
    let mut uts: libc::utsname = unsafe { std::mem::zeroed() };
    if unsafe { libc::uname(&mut uts) } != 0 {
        return None;
    }
    let release = unsafe { std::ffi::CStr::from_ptr(uts.release.as_ptr()) };
    parse_kernel_release(release.to_str().ok()?)
}

fn parse_kernel_release(release: &str) -> Option<(u32, u32)> {
    let mut parts = release.split(|c: char| !c.is_ascii_digit());
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    Some((major, minor))
}

pub fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

/// Raises the soft open-file limit to the hard limit. Event files are opened
/// per (thread, cpu) pair, which easily runs into the default soft limit.
pub fn allow_more_opened_files() {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) } != 0 {
        return;
    }
    if limit.rlim_cur < limit.rlim_max {
        limit.rlim_cur = limit.rlim_max;
        if unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &limit) } == 0 {
            debug!("raised open file soft limit to {}", limit.rlim_cur);
        }
    }
}

/// Swaps devfreq `mem_latency` governors for `performance` while alive.
///
/// Some SoCs drive memory-latency scaling from PMU counters, leaving fewer
/// counters for profiling. The swap is best-effort: if the process dies
/// between construction and drop, the `performance` governor is left behind.
#[derive(Default)]
pub struct DevfreqCounters {
    swapped_governor_paths: Vec<String>,
}

impl DevfreqCounters {
    pub fn claim() -> crate::Result<Self> {
        if !is_root() {
            return Err(crate::Error::AccessDenied {
                what: "devfreq governors (--use-devfreq-counters needs root)".into(),
                source: std::io::ErrorKind::PermissionDenied.into(),
            });
        }
        let mut counters = Self::default();
        let Ok(entries) = fs::read_dir("/sys/class/devfreq") else {
            return Ok(counters);
        };
        for entry in entries.flatten() {
            let path = entry.path().join("governor");
            let Ok(governor) = fs::read_to_string(&path) else {
                continue;
            };
            if governor.trim() == "mem_latency" {
                fs::write(&path, "performance").map_err(|source| crate::Error::AccessDenied {
                    what: format!("writing {}", path.display()),
                    source,
                })?;
                counters
                    .swapped_governor_paths
                    .push(path.to_string_lossy().into_owned());
            }
        }
        Ok(counters)
    }
}

impl Drop for DevfreqCounters {
    fn drop(&mut self) {
        for path in &self.swapped_governor_paths {
            if let Err(e) = fs::write(path, "mem_latency") {
                warn!("failed to restore devfreq governor at {path}: {e}");
            }
        }
    }
}

/// CPUs reported as Intel Atom cores on a hybrid x86 machine.
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
pub fn x86_intel_atom_cpus() -> BTreeSet<i32> {
    fs::read_to_string("/sys/bus/event_source/devices/cpu_atom/cpus")
        .ok()
        .and_then(|s| parse_cpu_list(&s))
        .map(|cpus| cpus.into_iter().collect())
        .unwrap_or_default()
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
pub fn x86_intel_atom_pmu_type() -> Option<u32> {
    let s = fs::read_to_string("/sys/bus/event_source/devices/cpu_atom/type").ok()?;
    s.trim().parse().ok()
}

#[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
pub fn x86_intel_atom_cpus() -> BTreeSet<i32> {
    BTreeSet::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_list_parsing() {
        assert_eq!(parse_cpu_list("0-3"), Some(vec![0, 1, 2, 3]));
        assert_eq!(parse_cpu_list("0-2,5,7-8\n"), Some(vec![0, 1, 2, 5, 7, 8]));
        assert_eq!(parse_cpu_list("3,1,2,1"), Some(vec![1, 2, 3]));
        assert_eq!(parse_cpu_list("2-1"), None);
        assert_eq!(parse_cpu_list("x"), None);
        assert_eq!(parse_cpu_list(""), None);
    }

    #[test]
    fn kernel_release_parsing() {
        assert_eq!(parse_kernel_release("6.8.0-41-generic"), Some((6, 8)));
        assert_eq!(parse_kernel_release("4.19.322"), Some((4, 19)));
        assert_eq!(parse_kernel_release("bogus"), None);
    }

    #[test]
    fn current_process_is_visible() {
        let pid = std::process::id() as pid_t;
        assert!(is_thread_alive(pid));
        assert!(threads_in_process(pid).contains(&pid));
        let (name, tgid) = read_thread_name_and_pid(pid).unwrap();
        assert!(!name.is_empty());
        assert_eq!(tgid, pid);
    }
}
