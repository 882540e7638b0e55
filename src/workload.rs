//! Forked workload whose exec is gated on the parent.
//!
//! The child is forked immediately so event files can be opened on its pid,
//! but it execs only once [`Workload::start`] releases it through a pipe.
//! Together with `enable_on_exec` this makes counters cover exactly the
//! workload's lifetime.

use std::ffi::CString;
use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd};

use libc::pid_t;
use log::{error, warn};

use crate::error::{Error, Result};

pub struct Workload {
    pid: pid_t,
    start_pipe: Option<File>,
    started: bool,
    command_name: String,
}

impl Workload {
    pub fn create(args: &[String]) -> Result<Workload> {
        if args.is_empty() {
            return Err(Error::ConfigConflict("empty workload command".into()));
        }
        let argv: Vec<CString> = args
            .iter()
            .map(|a| CString::new(a.as_str()))
            .collect::<std::result::Result<_, _>>()
            .map_err(|_| Error::ConfigConflict("workload argument contains a NUL byte".into()))?;
        // Allocate the exec vector before forking; the child must not touch
        // the allocator.
        let mut argv_ptrs: Vec<*const libc::c_char> = argv.iter().map(|a| a.as_ptr()).collect();
        argv_ptrs.push(std::ptr::null());

        let mut pipe_fds = [0i32; 2];
        if unsafe { libc::pipe2(pipe_fds.as_mut_ptr(), libc::O_CLOEXEC) } != 0 {
            return Err(Error::IoFault(io::Error::last_os_error()));
        }
        let [read_fd, write_fd] = pipe_fds;

        let pid = unsafe { libc::fork() };
        match pid {
            -1 => {
                unsafe {
                    libc::close(read_fd);
                    libc::close(write_fd);
                }
                Err(Error::IoFault(io::Error::last_os_error()))
            }
            0 => {
                // Child: wait for the release byte, then exec. Only
                // async-signal-safe calls from here on.
                unsafe {
                    libc::close(write_fd);
                    libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGHUP, 0, 0, 0);
                    let mut byte = 0u8;
                    let n = libc::read(read_fd, &mut byte as *mut u8 as _, 1);
                    if n == 1 {
                        libc::execvp(argv_ptrs[0], argv_ptrs.as_ptr());
                    }
                    libc::_exit(127);
                }
            }
            child => {
                unsafe { libc::close(read_fd) };
                Ok(Workload {
                    pid: child,
                    start_pipe: Some(unsafe { File::from_raw_fd(write_fd) }),
                    started: false,
                    command_name: args[0].clone(),
                })
            }
        }
    }

    pub fn pid(&self) -> pid_t {
        self.pid
    }

    pub fn command_name(&self) -> &str {
        &self.command_name
    }

    /// Pins the (not yet running) child to one cpu.
    pub fn set_cpu_affinity(&self, cpu: i32) -> Result<()> {
        unsafe {
            let mut cpu_set: libc::cpu_set_t = std::mem::zeroed();
            libc::CPU_SET(cpu as usize, &mut cpu_set);
            if libc::sched_setaffinity(self.pid, size_of::<libc::cpu_set_t>(), &cpu_set) != 0 {
                return Err(Error::IoFault(io::Error::last_os_error()));
            }
        }
        Ok(())
    }

    /// Releases the child to exec its command.
    pub fn start(&mut self) -> Result<()> {
        let pipe = self
            .start_pipe
            .take()
            .ok_or_else(|| Error::ConfigConflict("workload already started".into()))?;
        let n = unsafe { libc::write(pipe.as_raw_fd(), b"1".as_ptr() as _, 1) };
        if n != 1 {
            error!("failed to release workload child {}", self.pid);
            return Err(Error::IoFault(io::Error::last_os_error()));
        }
        self.started = true;
        Ok(())
    }

    /// Blocks until the child exits; returns true when it exited with 0.
    pub fn wait_child_process(&mut self) -> Result<bool> {
        let mut status = 0i32;
        let ret = unsafe { libc::waitpid(self.pid, &mut status, 0) };
        if ret != self.pid {
            return Err(Error::IoFault(io::Error::last_os_error()));
        }
        self.pid = 0;
        Ok(libc::WIFEXITED(status) && libc::WEXITSTATUS(status) == 0)
    }
}

impl Drop for Workload {
    fn drop(&mut self) {
        if self.pid == 0 {
            return;
        }
        if !self.started {
            // The child is still parked on the pipe; don't leave it behind.
            unsafe { libc::kill(self.pid, libc::SIGKILL) };
        }
        let mut status = 0i32;
        if unsafe { libc::waitpid(self.pid, &mut status, 0) } != self.pid {
            warn!("failed to reap workload child {}", self.pid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workload_execs_after_start() {
        let mut workload = Workload::create(&["true".to_string()]).unwrap();
        assert!(workload.pid() > 0);
        assert_eq!(workload.command_name(), "true");
        workload.start().unwrap();
        assert!(workload.wait_child_process().unwrap());
        assert!(workload.start().is_err());
    }

    #[test]
    fn unstarted_workload_is_killed_on_drop() {
        let workload = Workload::create(&["sleep".to_string(), "100".to_string()]).unwrap();
        let pid = workload.pid();
        drop(workload);
        // The child is gone: waitpid in drop reaped it.
        assert_ne!(unsafe { libc::kill(pid, 0) }, 0);
    }

    #[test]
    fn failing_workload_reports_nonzero_exit() {
        let mut workload = Workload::create(&["false".to_string()]).unwrap();
        workload.start().unwrap();
        assert!(!workload.wait_child_process().unwrap());
    }
}
