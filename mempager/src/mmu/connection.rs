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

use std::{
    io::{self, BufReader},
    net::Shutdown,
    os::unix::net::UnixStream,
    process,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, OnceLock,
    },
    thread::{self, JoinHandle},
};

use crossbeam_channel::{Receiver, Sender};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use thiserror::Error;

use super::{upcall::RemoteMapping, Shared};
use crate::{
    protocol::{Message, EXTEND_FAILED, PRINT_FAILED, PRINT_OK},
    PagerError, Pid, ProtocolError,
};

/// Reasons to close a connection.
#[derive(Debug, Error)]
enum Teardown {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Pager(#[from] PagerError),
}

/// One client connection.
///
/// The reader thread is the only one reading from the socket. It forwards requests to the worker
/// thread and upcall acknowledgements to whoever holds `acks`. Writes from the worker and from upcalls
/// of other connections are serialized by `writer`.
pub(crate) struct Connection {
    id: u64,
    pid: OnceLock<Pid>,
    exited: AtomicBool,
    stream: UnixStream,
    writer: Mutex<UnixStream>,

    /// acknowledgements of upcalls, locking it allows one upcall at a time
    acks: Mutex<Receiver<Message>>,

    /// set while an upcall waits for its acknowledgement, the reader consumes it
    awaiting_ack: AtomicBool,
}

impl Connection {
    #[inline]
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Process registered on this connection, if any.
    #[inline]
    pub(crate) fn pid(&self) -> Option<Pid> {
        self.pid.get().copied()
    }

    pub(crate) fn send(&self, message: &Message) -> Result<(), ProtocolError> {
        message.write_to(&mut *self.writer.lock())
    }

    /// Sends `upcall` and blocks until the client echoed it back.
    ///
    /// Any failure closes the connection: the client may still map a frame it lost.
    pub(crate) fn upcall(&self, upcall: Message) -> Result<(), ProtocolError> {
        if !matches!(upcall, Message::Resident { .. } | Message::Protect { .. }) {
            return Err(ProtocolError::Unexpected {
                expected: "upcall",
                received: upcall.name(),
            });
        }

        let acks = self.acks.lock();
        debug!("connection {}: upcall {:?}", self.id, upcall);
        self.awaiting_ack.store(true, Ordering::SeqCst);

        let result = self
            .send(&upcall)
            .and_then(|()| acks.recv().map_err(|_| ProtocolError::Disconnected))
            .and_then(|ack| {
                if ack == upcall {
                    Ok(())
                } else {
                    warn!("connection {}: {:?} acknowledged with {:?}", self.id, upcall, ack);
                    Err(ProtocolError::Unexpected {
                        expected: upcall.name(),
                        received: ack.name(),
                    })
                }
            });

        if result.is_err() {
            self.awaiting_ack.store(false, Ordering::SeqCst);
            self.close();
        }
        result
    }

    /// Shuts the socket down, which stops the reader thread.
    pub(crate) fn close(&self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

/// Registers a new connection and starts its reader thread.
pub(crate) fn spawn(
    id: u64,
    stream: UnixStream,
    shared: Arc<Shared>,
) -> io::Result<JoinHandle<()>> {
    let reader = stream.try_clone()?;
    let writer = stream.try_clone()?;
    let (ack_tx, ack_rx) = crossbeam_channel::unbounded();

    let connection = Arc::new(Connection {
        id,
        pid: OnceLock::new(),
        exited: AtomicBool::new(false),
        stream,
        writer: Mutex::new(writer),
        acks: Mutex::new(ack_rx),
        awaiting_ack: AtomicBool::new(false),
    });
    shared.connections.lock().insert(id, connection.clone());

    let thread = {
        let shared = shared.clone();
        let connection = connection.clone();
        thread::Builder::new()
            .name(format!("mmu-conn-{}", id))
            .spawn(move || run(connection, shared, reader, ack_tx))
    };
    if thread.is_err() {
        shared.connections.lock().remove(&id);
    }
    thread
}

fn run(connection: Arc<Connection>, shared: Arc<Shared>, reader: UnixStream, acks: Sender<Message>) {
    let id = connection.id;
    info!("connection {}: accepted", id);

    let (request_tx, request_rx) = crossbeam_channel::unbounded();
    let worker = {
        let shared = shared.clone();
        let connection = connection.clone();
        thread::Builder::new()
            .name(format!("mmu-worker-{}", id))
            .spawn(move || {
                if let Err(err) = serve(&connection, &shared, request_rx) {
                    warn!("connection {}: {}", connection.id, err);
                    connection.close();
                }
            })
    };

    match worker {
        Ok(worker) => {
            if let Err(err) = read_loop(&connection, reader, &request_tx, &acks) {
                warn!("connection {}: {}", id, err);
                connection.close();
            }
            // wakes up the worker and pending upcalls
            drop(request_tx);
            drop(acks);
            if worker.join().is_err() {
                warn!("connection {}: worker panicked", id);
            }
        }
        Err(err) => {
            warn!("connection {}: could not start worker: {}", id, err);
            connection.close();
        }
    }

    shared.connections.lock().remove(&id);
    if let Some(pid) = connection.pid() {
        if !connection.exited.load(Ordering::SeqCst) && shared.running.load(Ordering::SeqCst) {
            match shared.pager.lock().destroy(pid) {
                Ok(()) => info!("connection {}: destroyed pid {}", id, pid),
                Err(err) => warn!("connection {}: {}", id, err),
            }
        }
    }
    info!("connection {}: closed", id);
}

/// Routes incoming messages until the client disconnects.
fn read_loop(
    connection: &Connection,
    reader: UnixStream,
    requests: &Sender<Message>,
    acks: &Sender<Message>,
) -> Result<(), ProtocolError> {
    let mut reader = BufReader::new(reader);
    let mut exiting = false;

    loop {
        let message = match Message::read_from(&mut reader) {
            Ok(message) => message,
            Err(ProtocolError::Disconnected) if exiting => return Ok(()),
            Err(err) => return Err(err),
        };

        debug!("connection {}: received {}", connection.id, message.name());
        match message {
            Message::Resident { .. } | Message::Protect { .. } => {
                if !connection.awaiting_ack.swap(false, Ordering::SeqCst) {
                    return Err(ProtocolError::Unexpected {
                        expected: "request",
                        received: message.name(),
                    });
                }
                if acks.send(message).is_err() {
                    return Err(ProtocolError::Disconnected);
                }
            }
            Message::Register { .. }
            | Message::Extend
            | Message::Print { .. }
            | Message::Fault { .. }
            | Message::Exit => {
                exiting |= message == Message::Exit;
                if requests.send(message).is_err() {
                    // worker is gone
                    return Ok(());
                }
            }
            other => {
                return Err(ProtocolError::Unexpected {
                    expected: "request",
                    received: other.name(),
                })
            }
        }
    }
}

/// Splits pager results into values for the client and reasons to close the connection.
///
/// Fatal errors terminate the whole process: the pager tables are not consistent anymore.
fn check<T>(connection: &Connection, result: Result<T, PagerError>) -> Result<Option<T>, Teardown> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(err) if err.is_recoverable() => {
            debug!("connection {}: {}", connection.id, err);
            Ok(None)
        }
        Err(err) if err.is_fatal() => {
            error!("connection {}: {}", connection.id, err);
            process::exit(1);
        }
        Err(err) => Err(err.into()),
    }
}

fn registered(connection: &Connection, received: &Message) -> Result<Pid, ProtocolError> {
    connection.pid().ok_or(ProtocolError::Unexpected {
        expected: "REGISTER",
        received: received.name(),
    })
}

/// Runs the requests of one client against the pager.
fn serve(
    connection: &Connection,
    shared: &Shared,
    requests: Receiver<Message>,
) -> Result<(), Teardown> {
    for request in requests.iter() {
        match request {
            Message::Register { pid } => {
                if connection.pid().is_some() {
                    return Err(ProtocolError::Unexpected {
                        expected: "request",
                        received: request.name(),
                    }
                    .into());
                }
                // a pid registered twice means the tables are out of sync with the clients
                check(connection, shared.pager.lock().register(pid))?;
                let _ = connection.pid.set(pid);
                info!("connection {}: registered pid {}", connection.id, pid);

                connection.send(&Message::RegisterReply {
                    pmem_path: shared.pmem_path.clone(),
                })?;
            }
            Message::Extend => {
                let pid = registered(connection, &request)?;
                let vaddr = check(connection, shared.pager.lock().extend(pid))?;
                let vaddr = vaddr.map_or(EXTEND_FAILED, |vaddr| vaddr as u64);
                debug!("connection {}: extend vaddr {:#x}", connection.id, vaddr);

                connection.send(&Message::ExtendReply { vaddr })?;
            }
            Message::Print { addr, len } => {
                let pid = registered(connection, &request)?;
                let data = {
                    let mut pager = shared.pager.lock();
                    let mapping = RemoteMapping::new(&shared.connections, pager.config().page_size);
                    let result = pager.read_region(pid, addr as usize, len as usize, &mapping);
                    check(connection, result)?
                };

                let status = match data {
                    Some(data) => {
                        if !data.is_empty() {
                            println!("{}", hex::encode(&data));
                        }
                        PRINT_OK
                    }
                    None => PRINT_FAILED,
                };
                debug!(
                    "connection {}: print vaddr {:#x} len {} status {}",
                    connection.id, addr, len, status as i32
                );

                connection.send(&Message::PrintReply { status })?;
            }
            Message::Fault { addr, code } => {
                let pid = registered(connection, &request)?;
                debug!(
                    "connection {}: fault vaddr {:#x} code {}",
                    connection.id, addr, code
                );
                {
                    let mut pager = shared.pager.lock();
                    let mapping = RemoteMapping::new(&shared.connections, pager.config().page_size);
                    let result = pager.fault(pid, addr as usize, &mapping);
                    check(connection, result)?;
                }

                connection.send(&Message::FaultReply)?;
            }
            Message::Exit => {
                let pid = registered(connection, &request)?;
                check(connection, shared.pager.lock().destroy(pid))?;
                connection.exited.store(true, Ordering::SeqCst);
                info!("connection {}: pid {} exited", connection.id, pid);

                connection.send(&Message::ExitReply)?;
                return Ok(());
            }
            other => {
                return Err(ProtocolError::Unexpected {
                    expected: "request",
                    received: other.name(),
                }
                .into())
            }
        }
    }

    Ok(())
}
