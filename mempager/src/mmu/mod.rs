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

//! The memory manager process.
//!
//! [`Mmu`] owns the [`Pager`] (and with it the emulated physical memory and disk) and serves
//! client runtimes over a unix socket. Every connection runs on its own threads, but all pager
//! operations are serialized by one lock which is also held while the pager waits for clients
//! to apply mapping changes.

mod connection;
mod upcall;


use std::{
    collections::HashMap,
    fs::remove_file,
    os::unix::net::{UnixListener, UnixStream},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use log::{info, warn};
use parking_lot::Mutex;

use crate::{config::MmuConfig, modules::backing_store::FileBackingStore, MmuError, Pager};

use connection::Connection;

/// Distinguishes the memory images of several managers inside of one process.
static INSTANCE: AtomicUsize = AtomicUsize::new(0);

/// Pause after a failed accept.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(10);

/// State shared by the accept loop and all connection threads.
pub(crate) struct Shared {
    pub(crate) pager: Mutex<Pager<FileBackingStore>>,
    pub(crate) connections: Mutex<HashMap<u64, Arc<Connection>>>,
    pub(crate) running: Arc<AtomicBool>,
    pub(crate) pmem_path: PathBuf,
}

pub struct Mmu {
    listener: UnixListener,
    socket_path: PathBuf,
    shared: Arc<Shared>,
    threads: Vec<JoinHandle<()>>,
    next_id: u64,
}

impl Mmu {
    /// Validates `config`, creates the memory image and binds the socket.
    ///
    /// A stale socket file at the configured path is removed first.
    pub fn bind(config: MmuConfig) -> Result<Self, MmuError> {
        config.validate()?;
        let pager_config = config.pager_config();

        let pmem_path = config.pmem_dir.join(format!(
            "mempager.pmem.{}.{}",
            std::process::id(),
            INSTANCE.fetch_add(1, Ordering::Relaxed)
        ));
        let store = FileBackingStore::new(
            pmem_path.clone(),
            pager_config.page_size,
            pager_config.frame_count,
            pager_config.block_count,
        )
        .map_err(MmuError::Memory)?;

        let _ = remove_file(&config.socket_path);
        let listener = UnixListener::bind(&config.socket_path).map_err(|source| MmuError::Bind {
            path: config.socket_path.display().to_string(),
            source,
        })?;
        info!("listening at {}", config.socket_path.display());

        Ok(Self {
            listener,
            socket_path: config.socket_path,
            shared: Arc::new(Shared {
                pager: Mutex::new(Pager::new(pager_config, store)),
                connections: Mutex::new(HashMap::new()),
                running: Arc::new(AtomicBool::new(true)),
                pmem_path,
            }),
            threads: vec![],
            next_id: 1,
        })
    }

    #[inline]
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Path of the physical memory image clients map frames from.
    #[inline]
    pub fn pmem_path(&self) -> &Path {
        &self.shared.pmem_path
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            running: self.shared.running.clone(),
            socket_path: self.socket_path.clone(),
        }
    }

    /// Accepts clients until [`ShutdownHandle::shutdown`] is called.
    ///
    /// On shutdown all connections are closed without destroying their processes.
    pub fn run(mut self) -> Result<(), MmuError> {
        while self.shared.running.load(Ordering::SeqCst) {
            let stream = match self.listener.accept() {
                Ok((stream, _)) => stream,
                Err(err) => {
                    warn!("accept failed: {}", err);
                    // e.g. out of file descriptors, give connections time to close
                    thread::sleep(ACCEPT_BACKOFF);
                    continue;
                }
            };
            if !self.shared.running.load(Ordering::SeqCst) {
                break;
            }

            let id = self.next_id;
            self.next_id += 1;
            self.threads.retain(|thread| !thread.is_finished());
            match connection::spawn(id, stream, self.shared.clone()) {
                Ok(thread) => self.threads.push(thread),
                Err(err) => warn!("could not start connection {}: {}", id, err),
            }
        }

        info!("shutting down");
        let open: Vec<_> = self
            .shared
            .connections
            .lock()
            .values()
            .cloned()
            .collect();
        for connection in open {
            connection.close();
        }
        for thread in self.threads.drain(..) {
            if thread.join().is_err() {
                warn!("connection thread panicked");
            }
        }

        Ok(())
    }
}

impl Drop for Mmu {
    fn drop(&mut self) {
        if let Err(err) = remove_file(&self.socket_path) {
            warn!(
                "could not remove socket {}: {}",
                self.socket_path.display(),
                err
            );
        }
    }
}

/// Stops a running [`Mmu`] from another thread.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    running: Arc<AtomicBool>,
    socket_path: PathBuf,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            info!("shutdown requested");
            // wake up the accept loop
            let _ = UnixStream::connect(&self.socket_path);
        }
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}
