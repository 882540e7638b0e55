//! Thin fallible wrappers over the raw syscalls this crate depends on.
//! Every wrapper turns `-1` into `io::Error::last_os_error()` and hands
//! ownership of new descriptors to `File`.

use std::fs::File;
use std::io::{Error, Result};
use std::os::fd::{AsRawFd, FromRawFd};
use std::time::Duration;

use libc::{epoll_event, itimerspec, sigset_t, timespec};

use super::Attr;

pub fn perf_event_open(attr: &Attr, pid: i32, cpu: i32, group_fd: i32, flags: u64) -> Result<File> {
    let num = libc::SYS_perf_event_open;
    let fd = unsafe { libc::syscall(num, attr as *const Attr, pid, cpu, group_fd, flags) };
    if fd != -1 {
        Ok(unsafe { File::from_raw_fd(fd as _) })
    } else {
        Err(Error::last_os_error())
    }
}

pub fn ioctl_arg(file: &File, op: u64, arg: u64) -> Result<i32> {
    let result = unsafe { libc::ioctl(file.as_raw_fd(), op as _, arg) };
    if result != -1 {
        Ok(result)
    } else {
        Err(Error::last_os_error())
    }
}

pub fn ioctl_argp<T: ?Sized>(file: &File, op: u64, argp: &mut T) -> Result<i32> {
    let result = unsafe { libc::ioctl(file.as_raw_fd(), op as _, argp as *mut T) };
    if result != -1 {
        Ok(result)
    } else {
        Err(Error::last_os_error())
    }
}

pub fn read(file: &File, buf: &mut [u8]) -> Result<usize> {
    let bytes = unsafe { libc::read(file.as_raw_fd(), buf.as_mut_ptr() as _, buf.len()) };
    if bytes != -1 {
        Ok(bytes as _)
    } else {
        Err(Error::last_os_error())
    }
}

pub unsafe fn mmap(len: usize, prot: i32, flags: i32, file: &File, offset: i64) -> Result<*mut u8> {
    let ptr = libc::mmap(std::ptr::null_mut(), len, prot, flags, file.as_raw_fd(), offset);
    if ptr != libc::MAP_FAILED {
        Ok(ptr as _)
    } else {
        Err(Error::last_os_error())
    }
}

pub unsafe fn munmap(ptr: *mut u8, len: usize) -> Result<()> {
    if libc::munmap(ptr as _, len) != -1 {
        Ok(())
    } else {
        Err(Error::last_os_error())
    }
}

pub fn epoll_create1() -> Result<File> {
    let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
    if fd != -1 {
        Ok(unsafe { File::from_raw_fd(fd) })
    } else {
        Err(Error::last_os_error())
    }
}

pub fn epoll_ctl(epoll: &File, op: i32, fd: i32, event: Option<&mut epoll_event>) -> Result<()> {
    let ptr = event.map_or(std::ptr::null_mut(), |e| e as *mut epoll_event);
    let result = unsafe { libc::epoll_ctl(epoll.as_raw_fd(), op, fd, ptr) };
    if result != -1 {
        Ok(())
    } else {
        Err(Error::last_os_error())
    }
}

pub fn epoll_wait<'a>(
    epoll: &File,
    events: &'a mut [epoll_event],
    timeout: i32,
) -> Result<&'a [epoll_event]> {
    let len = unsafe {
        libc::epoll_wait(
            epoll.as_raw_fd(),
            events.as_mut_ptr(),
            events.len() as _,
            timeout,
        )
    };
    if len != -1 {
        Ok(&events[..len as _])
    } else {
        Err(Error::last_os_error())
    }
}

pub fn timerfd_create() -> Result<File> {
    let flags = libc::TFD_CLOEXEC | libc::TFD_NONBLOCK;
    let fd = unsafe { libc::timerfd_create(libc::CLOCK_MONOTONIC, flags) };
    if fd != -1 {
        Ok(unsafe { File::from_raw_fd(fd) })
    } else {
        Err(Error::last_os_error())
    }
}

/// Arms `timer` to first fire after `interval`, then every `interval` if
/// `periodic`. A zero `interval` is bumped to one nanosecond because a zero
/// `it_value` would disarm the timer instead.
pub fn timerfd_settime(timer: &File, interval: Duration, periodic: bool) -> Result<()> {
    let mut value = timespec {
        tv_sec: interval.as_secs() as _,
        tv_nsec: interval.subsec_nanos() as _,
    };
    if value.tv_sec == 0 && value.tv_nsec == 0 {
        value.tv_nsec = 1;
    }
    let spec = itimerspec {
        it_interval: if periodic {
            value
        } else {
            timespec {
                tv_sec: 0,
                tv_nsec: 0,
            }
        },
        it_value: value,
    };
    let result =
        unsafe { libc::timerfd_settime(timer.as_raw_fd(), 0, &spec, std::ptr::null_mut()) };
    if result != -1 {
        Ok(())
    } else {
        Err(Error::last_os_error())
    }
}

pub fn signalfd_create(mask: &sigset_t) -> Result<File> {
    let flags = libc::SFD_CLOEXEC | libc::SFD_NONBLOCK;
    let fd = unsafe { libc::signalfd(-1, mask, flags) };
    if fd != -1 {
        Ok(unsafe { File::from_raw_fd(fd) })
    } else {
        Err(Error::last_os_error())
    }
}

/// Replaces the signal mask of an existing signalfd in place.
pub fn signalfd_update(file: &File, mask: &sigset_t) -> Result<()> {
    let flags = libc::SFD_CLOEXEC | libc::SFD_NONBLOCK;
    let fd = unsafe { libc::signalfd(file.as_raw_fd(), mask, flags) };
    if fd != -1 {
        Ok(())
    } else {
        Err(Error::last_os_error())
    }
}

pub fn eventfd() -> Result<File> {
    let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
    if fd != -1 {
        Ok(unsafe { File::from_raw_fd(fd) })
    } else {
        Err(Error::last_os_error())
    }
}

pub fn block_signals(sigs: &[i32]) -> Result<sigset_t> {
    unsafe {
        let mut mask: sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut mask);
        for &sig in sigs {
            libc::sigaddset(&mut mask, sig);
        }
        let result = libc::pthread_sigmask(libc::SIG_BLOCK, &mask, std::ptr::null_mut());
        if result == 0 {
            Ok(mask)
        } else {
            Err(Error::from_raw_os_error(result))
        }
    }
}
