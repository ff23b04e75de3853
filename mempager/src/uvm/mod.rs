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

//! The client runtime.
//!
//! [`Uvm`] connects the current process to a running [`Mmu`](crate::Mmu) and reserves the client
//! region. Pages handed out by [`Uvm::extend`] are not backed by anything until they are accessed:
//! the resulting SIGSEGV is forwarded to the manager, which maps a frame of its memory image into
//! the region through an upcall, and the access is retried.

mod fault;

use std::{
    fs::File,
    io::{self, BufReader},
    net::Shutdown,
    os::{
        fd::{AsRawFd, FromRawFd, OwnedFd},
        raw::c_void,
        unix::net::UnixStream,
    },
    path::{Path, PathBuf},
    process,
    ptr::NonNull,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
};

use log::{debug, error, info, warn};
use parking_lot::{Condvar, Mutex};
use try_lock::TryLock;

use crate::{
    config::{UvmConfig, UVM_BASE_ADDR, UVM_MAX_ADDR},
    modules::mapping::Protection,
    protocol::{Message, EXTEND_FAILED, MAX_MESSAGE_LEN, PRINT_OK},
    util::{mmap_guard::MMapGuard, page_size},
    ProtocolError, UvmError,
};

use fault::{Claim, FaultHandler};

/// State shared by the application threads, the companion thread and the fault handler.
pub(crate) struct Context {
    socket: UnixStream,
    writer: TryLock<()>,
    pmem: File,
    page_size: usize,
    npages: AtomicUsize,

    /// one byte is written for every fault reply
    fault_rx: OwnedFd,
    fault_tx: OwnedFd,

    calls: Mutex<()>,
    reply: Mutex<Option<Message>>,
    reply_ready: Condvar,
    exiting: AtomicBool,
}

fn check(res: libc::ssize_t) -> io::Result<usize> {
    if res < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(res as usize)
    }
}

impl Context {
    #[inline]
    pub(crate) fn page_count(&self) -> usize {
        self.npages.load(Ordering::Acquire)
    }

    /// Writes `bytes` to the manager, async-signal-safe.
    pub(crate) fn send_raw(&self, mut bytes: &[u8]) -> io::Result<()> {
        let _guard = loop {
            if let Some(guard) = self.writer.try_lock() {
                break guard;
            }
            std::hint::spin_loop();
        };

        while !bytes.is_empty() {
            let res = unsafe {
                libc::write(
                    self.socket.as_raw_fd(),
                    bytes.as_ptr() as *const c_void,
                    bytes.len(),
                )
            };
            match check(res) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(written) => bytes = &bytes[written..],
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    fn send(&self, message: &Message) -> Result<(), ProtocolError> {
        let mut buf = [0u8; MAX_MESSAGE_LEN];
        let len = message.encode_into(&mut buf)?;
        self.send_raw(&buf[..len])?;
        Ok(())
    }

    /// Blocks until the companion thread received a fault reply, async-signal-safe.
    pub(crate) fn wait_fault_reply(&self) -> io::Result<()> {
        let mut byte = 0u8;
        loop {
            let res = unsafe {
                libc::read(
                    self.fault_rx.as_raw_fd(),
                    &mut byte as *mut u8 as *mut c_void,
                    1,
                )
            };
            match check(res) {
                Ok(1) => return Ok(()),
                Ok(_) => return Err(io::ErrorKind::UnexpectedEof.into()),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        }
    }

    fn wake_fault(&self) -> io::Result<()> {
        let byte = 1u8;
        loop {
            let res = unsafe {
                libc::write(
                    self.fault_tx.as_raw_fd(),
                    &byte as *const u8 as *const c_void,
                    1,
                )
            };
            match check(res) {
                Ok(_) => return Ok(()),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        }
    }

    /// Sends `request` and waits for the reply the companion thread hands over.
    fn call(&self, request: Message) -> Result<Message, UvmError> {
        let _call = self.calls.lock();
        self.send(&request)?;

        let mut slot = self.reply.lock();
        loop {
            if let Some(reply) = slot.take() {
                return Ok(reply);
            }
            self.reply_ready.wait(&mut slot);
        }
    }

    fn deliver(&self, reply: Message) {
        *self.reply.lock() = Some(reply);
        self.reply_ready.notify_one();
    }

    fn check_page(&self, vaddr: u64) -> Result<usize, UvmError> {
        let vaddr = vaddr as usize;
        if vaddr < UVM_BASE_ADDR
            || vaddr % self.page_size != 0
            || vaddr + self.page_size > UVM_MAX_ADDR + 1
        {
            return Err(UvmError::InvalidRegion);
        }
        Ok(vaddr)
    }

    /// Maps the frame at `offset` of the memory image to `vaddr`.
    fn map_frame(&self, prot: i32, offset: u64, vaddr: u64) -> Result<(), UvmError> {
        let vaddr = self.check_page(vaddr)?;
        let res = unsafe {
            libc::mmap(
                vaddr as *mut c_void,
                self.page_size,
                prot,
                libc::MAP_SHARED | libc::MAP_FIXED,
                self.pmem.as_raw_fd(),
                offset as libc::off_t,
            )
        };
        if res == libc::MAP_FAILED {
            return Err(UvmError::Memory(io::Error::last_os_error()));
        }
        Ok(())
    }

    fn protect(&self, prot: i32, vaddr: u64) -> Result<(), UvmError> {
        let vaddr = self.check_page(vaddr)?;
        let res = unsafe { libc::mprotect(vaddr as *mut c_void, self.page_size, prot) };
        if res == -1 {
            return Err(UvmError::Memory(io::Error::last_os_error()));
        }
        Ok(())
    }
}

/// Receives everything the manager sends. Returns once the manager confirmed the exit.
fn companion(context: &Context) -> Result<(), UvmError> {
    fault::block_faults().map_err(UvmError::Memory)?;
    let mut reader = BufReader::new(&context.socket);

    loop {
        let message = match Message::read_from(&mut reader) {
            Ok(message) => message,
            Err(ProtocolError::Disconnected) if context.exiting.load(Ordering::SeqCst) => {
                return Ok(())
            }
            Err(err) => return Err(err.into()),
        };

        match message {
            Message::ExtendReply { .. } | Message::PrintReply { .. } => context.deliver(message),
            Message::FaultReply => context.wake_fault()?,
            Message::Resident {
                prot,
                offset,
                vaddr,
            } => {
                debug!(
                    "resident vaddr {:#x} offset {:#x} prot {:?}",
                    vaddr,
                    offset,
                    Protection::from_bits(prot)
                );
                context.map_frame(prot, offset, vaddr)?;
                context.send(&Message::Resident {
                    prot,
                    offset,
                    vaddr,
                })?;
            }
            Message::Protect { prot, vaddr } => {
                debug!(
                    "protect vaddr {:#x} prot {:?}",
                    vaddr,
                    Protection::from_bits(prot)
                );
                context.protect(prot, vaddr)?;
                context.send(&Message::Protect { prot, vaddr })?;
            }
            Message::ExitReply => return Ok(()),
            other => {
                return Err(ProtocolError::Unexpected {
                    expected: "reply or upcall",
                    received: other.name(),
                }
                .into())
            }
        }
    }
}

/// Client runtime of the current process.
///
/// At most one instance can be active per process at any time.
pub struct Uvm {
    /// restores the previous handler, dropped before `context`
    handler: Option<FaultHandler>,
    companion: Option<JoinHandle<()>>,
    region: MMapGuard,
    context: Arc<Context>,
    pmem_path: PathBuf,
    _claim: Claim,
}

impl Uvm {
    /// Connects to the manager at the default socket.
    pub fn create() -> Result<Self, UvmError> {
        Self::connect(UvmConfig::default())
    }

    pub fn connect(config: UvmConfig) -> Result<Self, UvmError> {
        let claim = Claim::acquire().ok_or(UvmError::AlreadyActive)?;

        let mut socket = UnixStream::connect(&config.socket_path)?;
        Message::Register {
            pid: process::id(),
        }
        .write_to(&mut socket)?;
        let pmem_path = match Message::read_from(&mut socket)? {
            Message::RegisterReply { pmem_path } => pmem_path,
            other => {
                return Err(ProtocolError::Unexpected {
                    expected: "REGISTER_REPLY",
                    received: other.name(),
                }
                .into())
            }
        };
        info!(
            "registered pid {} with memory image {}",
            process::id(),
            pmem_path.display()
        );

        let pmem = File::options()
            .read(true)
            .write(true)
            .open(&pmem_path)
            .map_err(UvmError::Memory)?;
        let region = MMapGuard::reserve_fixed(UVM_BASE_ADDR, UVM_MAX_ADDR + 1 - UVM_BASE_ADDR)
            .map_err(UvmError::Memory)?;

        let mut fds = [0; 2];
        if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } == -1 {
            return Err(UvmError::Memory(io::Error::last_os_error()));
        }
        let (fault_rx, fault_tx) =
            unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };

        let context = Arc::new(Context {
            socket,
            writer: TryLock::new(()),
            pmem,
            page_size: page_size(),
            npages: AtomicUsize::new(0),
            fault_rx,
            fault_tx,
            calls: Mutex::new(()),
            reply: Mutex::new(None),
            reply_ready: Condvar::new(),
            exiting: AtomicBool::new(false),
        });

        let handler = FaultHandler::install(&context).map_err(UvmError::Memory)?;
        let companion = {
            let context = context.clone();
            thread::Builder::new()
                .name("uvm-companion".into())
                .spawn(move || {
                    if let Err(err) = companion(&context) {
                        error!("lost connection to memory manager: {}", err);
                        process::exit(1);
                    }
                })?
        };

        Ok(Self {
            handler: Some(handler),
            companion: Some(companion),
            region,
            context,
            pmem_path,
            _claim: claim,
        })
    }

    /// Adds a page to this process and returns its address.
    ///
    /// The page is filled with `'0'` bytes on first access.
    pub fn extend(&self) -> Result<NonNull<u8>, UvmError> {
        match self.context.call(Message::Extend)? {
            Message::ExtendReply {
                vaddr: EXTEND_FAILED,
            } => Err(UvmError::NoSpace),
            Message::ExtendReply { vaddr } => {
                let page = NonNull::new(vaddr as *mut u8).ok_or(UvmError::NoSpace)?;
                self.context.npages.fetch_add(1, Ordering::AcqRel);
                debug!("extend vaddr {:#x}", vaddr);
                Ok(page)
            }
            other => Err(ProtocolError::Unexpected {
                expected: "EXTEND_REPLY",
                received: other.name(),
            }
            .into()),
        }
    }

    /// Lets the manager print `len` bytes at `addr`.
    ///
    /// Fails with [`UvmError::InvalidRegion`] if the bytes are not all inside of extended pages.
    pub fn read_region(&self, addr: *const u8, len: usize) -> Result<(), UvmError> {
        let request = Message::Print {
            addr: addr as u64,
            len: len as u64,
        };
        match self.context.call(request)? {
            Message::PrintReply { status: PRINT_OK } => Ok(()),
            Message::PrintReply { .. } => Err(UvmError::InvalidRegion),
            other => Err(ProtocolError::Unexpected {
                expected: "PRINT_REPLY",
                received: other.name(),
            }
            .into()),
        }
    }

    /// Number of pages extended so far.
    #[inline]
    pub fn page_count(&self) -> usize {
        self.context.page_count()
    }

    #[inline]
    pub fn page_size(&self) -> usize {
        self.context.page_size
    }

    #[inline]
    pub fn pmem_path(&self) -> &Path {
        &self.pmem_path
    }

    /// Leaves the manager, which releases all pages of this process.
    ///
    /// Pointers returned by [`Uvm::extend`] must not be used afterwards.
    pub fn exit(mut self) -> Result<(), UvmError> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<(), UvmError> {
        let companion = match self.companion.take() {
            Some(companion) => companion,
            None => return Ok(()),
        };

        self.context.exiting.store(true, Ordering::SeqCst);
        let sent = self.context.send(&Message::Exit);
        if sent.is_err() {
            // nobody will answer, wake the companion thread
            let _ = self.context.socket.shutdown(Shutdown::Both);
        }
        if companion.join().is_err() {
            warn!("companion thread panicked");
        }

        // the region stays reserved until `self` is dropped
        self.handler.take();
        info!(
            "left memory manager with {} pages, region {:#x}+{:#x}",
            self.page_count(),
            self.region.base(),
            self.region.size()
        );

        sent.map_err(UvmError::from)
    }
}

impl Drop for Uvm {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            warn!("could not leave memory manager: {}", err);
        }
    }
}
