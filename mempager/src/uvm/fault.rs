/*
 *  Copyright (C) 2025  Markus Elias Gerber
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU General Public License for more details.
 *
 *  You should have received a copy of the GNU General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! SIGSEGV handling of the client runtime.
//!
//! Everything reachable from [`handle_fault`] must be async-signal-safe: no allocation, no locks
//! that a normal thread could hold while being interrupted, no logging. Faults are forwarded
//! with plain `write(2)` calls and the handler sleeps in `read(2)` on a pipe until the
//! companion thread received the reply.

use std::{
    io, mem,
    os::raw::{c_int, c_void},
    ptr,
    sync::{
        atomic::{AtomicBool, AtomicPtr, Ordering},
        Arc,
    },
};

use log::warn;

use super::Context;
use crate::{
    config::{UVM_BASE_ADDR, UVM_MAX_ADDR},
    protocol::{Message, MAX_MESSAGE_LEN},
};

/// Context faults are reported to, null if no runtime is active.
static ACTIVE: AtomicPtr<Context> = AtomicPtr::new(ptr::null_mut());

static CLAIMED: AtomicBool = AtomicBool::new(false);

/// Only one client runtime can exist per process, it owns the fault handler and the region.
pub(super) struct Claim(());

impl Claim {
    pub(super) fn acquire() -> Option<Self> {
        CLAIMED
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Claim(()))
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        CLAIMED.store(false, Ordering::Release);
    }
}

/// Installed SIGSEGV handler, the previous handler is restored on drop.
pub(super) struct FaultHandler {
    previous: libc::sigaction,
}

impl FaultHandler {
    /// Routes faults to `context`, which has to outlive the returned handler.
    pub(super) fn install(context: &Arc<Context>) -> io::Result<Self> {
        ACTIVE.store(Arc::as_ptr(context) as *mut Context, Ordering::Release);

        let mut action: libc::sigaction = unsafe { mem::zeroed() };
        let mut previous: libc::sigaction = unsafe { mem::zeroed() };
        action.sa_sigaction = handle_fault as *const () as usize;
        action.sa_flags = libc::SA_SIGINFO;

        let res = unsafe {
            libc::sigemptyset(&mut action.sa_mask);
            libc::sigaction(libc::SIGSEGV, &action, &mut previous)
        };
        if res == -1 {
            ACTIVE.store(ptr::null_mut(), Ordering::Release);
            return Err(io::Error::last_os_error());
        }

        Ok(Self { previous })
    }
}

impl Drop for FaultHandler {
    fn drop(&mut self) {
        let res = unsafe { libc::sigaction(libc::SIGSEGV, &self.previous, ptr::null_mut()) };
        if res == -1 {
            warn!(
                "could not restore previous SIGSEGV handler: {}",
                io::Error::last_os_error()
            );
        }
        ACTIVE.store(ptr::null_mut(), Ordering::Release);
    }
}

/// Blocks SIGSEGV for the calling thread.
pub(super) fn block_faults() -> io::Result<()> {
    let res = unsafe {
        let mut set: libc::sigset_t = mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, libc::SIGSEGV);
        libc::pthread_sigmask(libc::SIG_BLOCK, &set, ptr::null_mut())
    };
    if res != 0 {
        return Err(io::Error::from_raw_os_error(res));
    }
    Ok(())
}

fn write_stderr(bytes: &[u8]) {
    unsafe {
        libc::write(libc::STDERR_FILENO, bytes.as_ptr() as *const c_void, bytes.len());
    }
}

fn fatal(message: &[u8]) -> ! {
    write_stderr(message);
    unsafe { libc::_exit(libc::EXIT_FAILURE) }
}

/// Formats `addr` as `0x...` into `buf` without allocating.
fn format_addr(addr: usize, buf: &mut [u8; 2 + 2 * mem::size_of::<usize>()]) -> &[u8] {
    const DIGITS: &[u8; 16] = b"0123456789abcdef";
    buf[0] = b'0';
    buf[1] = b'x';
    let digits = 2 * mem::size_of::<usize>();
    for i in 0..digits {
        let shift = 4 * (digits - 1 - i);
        buf[2 + i] = DIGITS[(addr >> shift) & 0xf];
    }
    &buf[..]
}

extern "C" fn handle_fault(_signum: c_int, info: *mut libc::siginfo_t, _ucontext: *mut c_void) {
    let (addr, code) = unsafe { ((*info).si_addr() as usize, (*info).si_code) };

    let context = ACTIVE.load(Ordering::Acquire);
    if context.is_null() || !(UVM_BASE_ADDR..=UVM_MAX_ADDR).contains(&addr) {
        fatal(b"(external) segmentation fault\n");
    }
    let context = unsafe { &*context };

    if addr >= UVM_BASE_ADDR + context.page_count() * context.page_size {
        let mut buf = [0u8; 2 + 2 * mem::size_of::<usize>()];
        write_stderr(b"(internal) segmentation fault\naddress ");
        write_stderr(format_addr(addr, &mut buf));
        fatal(b" not allocated\n");
    }

    let mut buf = [0u8; MAX_MESSAGE_LEN];
    let len = match (Message::Fault {
        addr: addr as u64,
        code,
    })
    .encode_into(&mut buf)
    {
        Ok(len) => len,
        Err(_) => fatal(b"could not encode fault\n"),
    };

    if context.send_raw(&buf[..len]).is_err() {
        fatal(b"could not send fault to memory manager\n");
    }
    if context.wait_fault_reply().is_err() {
        fatal(b"memory manager did not answer fault\n");
    }
    // returning retries the access
}
