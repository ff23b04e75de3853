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

//! Fixed-layout messages exchanged between the manager and its clients.
//!
//! Every message starts with a little endian `u32` type tag followed by a body whose size
//! only depends on the tag. Clients send requests and receive replies; the manager additionally
//! sends *upcalls* ([`Message::Resident`], [`Message::Protect`]). A client acknowledges an upcall
//! by sending the identical message back once the mapping change is applied.

use std::{
    ffi::OsStr,
    io::{self, Read, Write},
    os::unix::ffi::OsStrExt,
    path::PathBuf,
};

use static_assertions::const_assert;

use crate::{error::ProtocolError, Pid};

/// Maximum length of the memory image path in a [`Message::RegisterReply`].
pub const PATH_MAX: usize = 256;

const TAG_LEN: usize = 4;

/// Size of the largest encoded message.
pub const MAX_MESSAGE_LEN: usize = TAG_LEN + PATH_MAX;

/// `vaddr` of a [`Message::ExtendReply`] if no page could be allocated.
pub const EXTEND_FAILED: u64 = 0;

/// `status` of a successful [`Message::PrintReply`].
pub const PRINT_OK: u32 = 0;

/// `status` of a [`Message::PrintReply`] for a region that is not allocated.
pub const PRINT_FAILED: u32 = u32::MAX;

mod tag {
    pub(super) const REGISTER: u32 = 1;
    pub(super) const REGISTER_REPLY: u32 = 2;
    pub(super) const EXTEND: u32 = 3;
    pub(super) const EXTEND_REPLY: u32 = 4;
    pub(super) const PRINT: u32 = 5;
    pub(super) const PRINT_REPLY: u32 = 6;
    pub(super) const FAULT: u32 = 7;
    pub(super) const FAULT_REPLY: u32 = 8;
    pub(super) const RESIDENT: u32 = 9;
    pub(super) const PROTECT: u32 = 10;
    pub(super) const EXIT: u32 = 11;
    pub(super) const EXIT_REPLY: u32 = 12;
}

const RESIDENT_BODY_LEN: usize = 4 + 8 + 8;
const_assert!(TAG_LEN + RESIDENT_BODY_LEN <= MAX_MESSAGE_LEN);
const_assert!(TAG_LEN + 8 + 8 <= MAX_MESSAGE_LEN);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// client → manager: first message of every connection
    Register { pid: Pid },
    RegisterReply { pmem_path: PathBuf },

    Extend,
    /// `vaddr` is [`EXTEND_FAILED`] if there is no swap space left
    ExtendReply { vaddr: u64 },

    Print { addr: u64, len: u64 },
    PrintReply { status: u32 },

    Fault { addr: u64, code: i32 },
    FaultReply,

    /// manager → client: map `vaddr` to `offset` inside the memory image, echoed as acknowledgement
    Resident { prot: i32, offset: u64, vaddr: u64 },

    /// manager → client: change the protection of `vaddr`, echoed as acknowledgement
    Protect { prot: i32, vaddr: u64 },

    Exit,
    ExitReply,
}

/// Length of the body that follows `tag`.
fn body_len(tag: u32) -> Option<usize> {
    let len = match tag {
        tag::REGISTER => 4,
        tag::REGISTER_REPLY => PATH_MAX,
        tag::EXTEND => 0,
        tag::EXTEND_REPLY => 8,
        tag::PRINT => 16,
        tag::PRINT_REPLY => 4,
        tag::FAULT => 12,
        tag::FAULT_REPLY => 0,
        tag::RESIDENT => RESIDENT_BODY_LEN,
        tag::PROTECT => 12,
        tag::EXIT => 0,
        tag::EXIT_REPLY => 0,
        _ => return None,
    };
    Some(len)
}

/// Little cursor that writes fields into a message buffer.
struct Encoder<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl Encoder<'_> {
    fn put(&mut self, bytes: &[u8]) {
        self.buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
    }
}

fn get_u32(body: &[u8], at: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&body[at..at + 4]);
    u32::from_le_bytes(bytes)
}

fn get_i32(body: &[u8], at: usize) -> i32 {
    get_u32(body, at) as i32
}

fn get_u64(body: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&body[at..at + 8]);
    u64::from_le_bytes(bytes)
}

impl Message {
    fn tag(&self) -> u32 {
        match self {
            Message::Register { .. } => tag::REGISTER,
            Message::RegisterReply { .. } => tag::REGISTER_REPLY,
            Message::Extend => tag::EXTEND,
            Message::ExtendReply { .. } => tag::EXTEND_REPLY,
            Message::Print { .. } => tag::PRINT,
            Message::PrintReply { .. } => tag::PRINT_REPLY,
            Message::Fault { .. } => tag::FAULT,
            Message::FaultReply => tag::FAULT_REPLY,
            Message::Resident { .. } => tag::RESIDENT,
            Message::Protect { .. } => tag::PROTECT,
            Message::Exit => tag::EXIT,
            Message::ExitReply => tag::EXIT_REPLY,
        }
    }

    /// Human readable name, used in logs and errors.
    pub fn name(&self) -> &'static str {
        match self {
            Message::Register { .. } => "REGISTER",
            Message::RegisterReply { .. } => "REGISTER_REPLY",
            Message::Extend => "EXTEND",
            Message::ExtendReply { .. } => "EXTEND_REPLY",
            Message::Print { .. } => "PRINT",
            Message::PrintReply { .. } => "PRINT_REPLY",
            Message::Fault { .. } => "FAULT",
            Message::FaultReply => "FAULT_REPLY",
            Message::Resident { .. } => "RESIDENT",
            Message::Protect { .. } => "PROTECT",
            Message::Exit => "EXIT",
            Message::ExitReply => "EXIT_REPLY",
        }
    }

    /// Encodes this message into `buf` and returns the number of bytes used.
    ///
    /// Does not allocate, so this can be used inside of a signal handler.
    pub fn encode_into(&self, buf: &mut [u8; MAX_MESSAGE_LEN]) -> Result<usize, ProtocolError> {
        let mut enc = Encoder { buf, pos: 0 };
        enc.put(&self.tag().to_le_bytes());

        match self {
            Message::Register { pid } => enc.put(&pid.to_le_bytes()),
            Message::RegisterReply { pmem_path } => {
                let bytes = pmem_path.as_os_str().as_bytes();
                // keep at least one NUL byte at the end
                if bytes.len() >= PATH_MAX {
                    return Err(ProtocolError::PathTooLong(bytes.len()));
                }
                enc.put(bytes);
                enc.put(&[0u8; PATH_MAX][..PATH_MAX - bytes.len()]);
            }
            Message::ExtendReply { vaddr } => enc.put(&vaddr.to_le_bytes()),
            Message::Print { addr, len } => {
                enc.put(&addr.to_le_bytes());
                enc.put(&len.to_le_bytes());
            }
            Message::PrintReply { status } => enc.put(&status.to_le_bytes()),
            Message::Fault { addr, code } => {
                enc.put(&addr.to_le_bytes());
                enc.put(&code.to_le_bytes());
            }
            Message::Resident {
                prot,
                offset,
                vaddr,
            } => {
                enc.put(&prot.to_le_bytes());
                enc.put(&offset.to_le_bytes());
                enc.put(&vaddr.to_le_bytes());
            }
            Message::Protect { prot, vaddr } => {
                enc.put(&prot.to_le_bytes());
                enc.put(&vaddr.to_le_bytes());
            }
            Message::Extend
            | Message::FaultReply
            | Message::Exit
            | Message::ExitReply => {}
        }

        debug_assert_eq!(Some(enc.pos - TAG_LEN), body_len(self.tag()));
        Ok(enc.pos)
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<(), ProtocolError> {
        let mut buf = [0u8; MAX_MESSAGE_LEN];
        let len = self.encode_into(&mut buf)?;
        writer.write_all(&buf[..len])?;
        Ok(())
    }

    /// Reads exactly one message.
    ///
    /// Returns [`ProtocolError::Disconnected`] if the stream ends before a new message starts.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Message, ProtocolError> {
        let mut tag_buf = [0u8; TAG_LEN];
        match reader.read_exact(&mut tag_buf) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(ProtocolError::Disconnected)
            }
            Err(err) => return Err(err.into()),
        }

        let tag = u32::from_le_bytes(tag_buf);
        let len = body_len(tag).ok_or(ProtocolError::UnknownMessage(tag))?;
        let mut body = [0u8; PATH_MAX];
        let body = &mut body[..len];
        reader.read_exact(body)?;

        let message = match tag {
            tag::REGISTER => Message::Register {
                pid: get_u32(body, 0),
            },
            tag::REGISTER_REPLY => {
                let end = body.iter().position(|b| *b == 0).unwrap_or(body.len());
                Message::RegisterReply {
                    pmem_path: PathBuf::from(OsStr::from_bytes(&body[..end])),
                }
            }
            tag::EXTEND => Message::Extend,
            tag::EXTEND_REPLY => Message::ExtendReply {
                vaddr: get_u64(body, 0),
            },
            tag::PRINT => Message::Print {
                addr: get_u64(body, 0),
                len: get_u64(body, 8),
            },
            tag::PRINT_REPLY => Message::PrintReply {
                status: get_u32(body, 0),
            },
            tag::FAULT => Message::Fault {
                addr: get_u64(body, 0),
                code: get_i32(body, 8),
            },
            tag::FAULT_REPLY => Message::FaultReply,
            tag::RESIDENT => Message::Resident {
                prot: get_i32(body, 0),
                offset: get_u64(body, 4),
                vaddr: get_u64(body, 12),
            },
            tag::PROTECT => Message::Protect {
                prot: get_i32(body, 0),
                vaddr: get_u64(body, 4),
            },
            tag::EXIT => Message::Exit,
            tag::EXIT_REPLY => Message::ExitReply,
            _ => return Err(ProtocolError::UnknownMessage(tag)),
        };

        Ok(message)
    }
}
