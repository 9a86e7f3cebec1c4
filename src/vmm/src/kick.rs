// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Periodic vCPU kick.
//!
//! `KVM_RUN` blocks for as long as the guest keeps running, which
//! would starve stdin polling. While a [`KickTimer`] is armed, a
//! SIGALRM fires every 100 ms and its handler sets the immediate-exit
//! flag on the registered vCPU, forcing `KVM_RUN` back to user space.
//! A signal that lands while the thread is in user space leaves the
//! flag set, so the very next `KVM_RUN` returns promptly as well.
//!
//! The handler, interval timer and kick target are all scoped to the
//! guard: dropping it disarms the timer, restores the default SIGALRM
//! disposition and clears the target, so no signal state leaks past
//! the run loop.

use std::cell::Cell;
use std::io;
use std::ptr;

use kvm_ioctls::VcpuFd;
use vmm_sys_util::signal::register_signal_handler;

/// Kick period, which bounds the stdin-poll latency.
pub const KICK_INTERVAL_MS: i64 = 100;

#[derive(Debug, thiserror::Error)]
pub enum KickError {
    #[error("failed to install the SIGALRM handler: {0}")]
    Handler(vmm_sys_util::errno::Error),
    #[error("failed to arm the interval timer: {0}")]
    Timer(io::Error),
}

thread_local! {
    static KICK_TARGET: Cell<*const VcpuFd> = const { Cell::new(ptr::null()) };
}

extern "C" fn kick_handler(_num: libc::c_int, _info: *mut libc::siginfo_t, _ctx: *mut libc::c_void) {
    let vcpu = KICK_TARGET.with(Cell::get);
    if !vcpu.is_null() {
        // SAFETY: the guard clears the target before the vCPU can be
        // dropped, and setting the immediate-exit flag is a single
        // volatile byte store into the shared exit region, which is
        // async-signal-safe.
        unsafe { (*vcpu).set_kvm_immediate_exit(1) };
    }
}

fn interval() -> libc::itimerval {
    let period = libc::timeval {
        tv_sec: KICK_INTERVAL_MS / 1000,
        tv_usec: (KICK_INTERVAL_MS % 1000) * 1000,
    };
    libc::itimerval {
        it_interval: period,
        it_value: period,
    }
}

/// Armed kick timer; disarms on drop.
pub struct KickTimer {
    _private: (),
}

impl KickTimer {
    /// Register `vcpu` as the kick target and start the 100 ms timer.
    pub fn arm(vcpu: &VcpuFd) -> Result<KickTimer, KickError> {
        KICK_TARGET.with(|t| t.set(vcpu as *const VcpuFd));
        register_signal_handler(libc::SIGALRM, kick_handler).map_err(|e| {
            KICK_TARGET.with(|t| t.set(ptr::null()));
            KickError::Handler(e)
        })?;
        let timer = interval();
        // SAFETY: plain libc call with valid pointers.
        let ret = unsafe { libc::setitimer(libc::ITIMER_REAL, &timer, ptr::null_mut()) };
        if ret < 0 {
            KICK_TARGET.with(|t| t.set(ptr::null()));
            return Err(KickError::Timer(io::Error::last_os_error()));
        }
        Ok(KickTimer { _private: () })
    }
}

impl Drop for KickTimer {
    fn drop(&mut self) {
        let disarm = libc::itimerval {
            it_interval: libc::timeval { tv_sec: 0, tv_usec: 0 },
            it_value: libc::timeval { tv_sec: 0, tv_usec: 0 },
        };
        // SAFETY: disarming the timer and restoring the default signal
        // disposition cannot fail in a way we could act on.
        unsafe {
            libc::setitimer(libc::ITIMER_REAL, &disarm, ptr::null_mut());
            libc::signal(libc::SIGALRM, libc::SIG_DFL);
        }
        KICK_TARGET.with(|t| t.set(ptr::null()));
    }
}
