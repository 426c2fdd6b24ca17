//! Wire codec for AMS/TCP frames and the ADS packet bodies.
//!
//! Every message on the wire is a 6-byte AMS/TCP header, a 32-byte AMS
//! header, and a command-specific body, all little-endian and tightly
//! packed.  [`Request`] and [`Response`] enumerate the packet bodies of
//! the command set this client speaks; [`classify`] tells the receive
//! pump what kind of frame it is looking at before the body is decoded.

use byteorder::{ReadBytesExt, LE};
use zerocopy::byteorder::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, Unaligned};

use crate::errors::{Error, Result};
use crate::netid::{AmsAddr, AmsNetId};

/// Size of the AMS/TCP framing header (2 reserved bytes + 4 length bytes).
pub const TCP_HEADER_SIZE: usize = 6;
/// Size of the AMS routing header.
pub const AMS_HEADER_SIZE: usize = 32;
/// Combined size of the headers preceding every packet body.
pub const HEADER_SIZE: usize = TCP_HEADER_SIZE + AMS_HEADER_SIZE;

/// State flag set on every ADS command frame.
pub const STATE_ADS_COMMAND: u16 = 0x0004;
/// State flag distinguishing responses from requests.
pub const STATE_RESPONSE: u16 = 0x0001;

/// An ADS command identifier.
// https://infosys.beckhoff.com/content/1033/tc3_ads_intro/115847307.html
#[repr(u16)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    /// Query name and version of the device.
    ReadDeviceInfo = 1,
    /// Read data at an index group/offset.
    Read = 2,
    /// Write data to an index group/offset.
    Write = 3,
    /// Query the ADS and device state.  Also sent by the PLC to us as a
    /// liveness probe.
    ReadState = 4,
    /// Register a device notification.
    AddNotification = 6,
    /// Remove a device notification.
    DeleteNotification = 7,
    /// Unsolicited value change, sent by the PLC only.
    Notification = 8,
    /// Write data, then read back a reply (a poor man's RPC).
    ReadWrite = 9,
}

impl Command {
    /// Map a raw command id back to the enum.
    pub fn from_u16(raw: u16) -> Option<Self> {
        Some(match raw {
            1 => Self::ReadDeviceInfo,
            2 => Self::Read,
            3 => Self::Write,
            4 => Self::ReadState,
            6 => Self::AddNotification,
            7 => Self::DeleteNotification,
            8 => Self::Notification,
            9 => Self::ReadWrite,
            _ => return None,
        })
    }

    pub(crate) fn action(self) -> &'static str {
        match self {
            Command::ReadDeviceInfo => "get device info",
            Command::Read => "read data",
            Command::Write => "write data",
            Command::ReadState => "read state",
            Command::AddNotification => "add notification",
            Command::DeleteNotification => "delete notification",
            Command::Notification => "notification",
            Command::ReadWrite => "write and read data",
        }
    }
}

/// The combined AMS/TCP and AMS headers preceding every packet body.
#[derive(FromBytes, IntoBytes, Immutable, Unaligned, Debug, Clone)]
#[repr(C)]
pub struct FrameHeader {
    /// Reserved; zero for ADS command frames.
    pub reserved: U16,
    /// Length of everything after the AMS/TCP header.  Always equals
    /// `length + 32` on a well-formed frame.
    pub frame_length: U32,
    /// Destination NetID.
    pub target_netid: AmsNetId,
    /// Destination AMS port.
    pub target_port: U16,
    /// Source NetID.
    pub sender_netid: AmsNetId,
    /// Source AMS port.
    pub sender_port: U16,
    /// ADS command id.
    pub command: U16,
    /// State flags; see [`STATE_ADS_COMMAND`] and [`STATE_RESPONSE`].
    pub state_flags: U16,
    /// Length of the packet body.
    pub length: U32,
    /// AMS-level error code.
    pub error_code: U32,
    /// Correlates a response with its request.
    pub invoke_id: U32,
}

impl FrameHeader {
    /// Build a request header for the given command and body length.
    ///
    /// The invoke-id is left at zero; the transport assigns it just before
    /// the frame goes out.
    pub fn request(target: AmsAddr, sender: AmsAddr, cmd: Command, body_len: usize) -> Result<Self> {
        let body_len: u32 = body_len.try_into()?;
        Ok(Self {
            reserved: U16::new(0),
            frame_length: U32::new(AMS_HEADER_SIZE as u32 + body_len),
            target_netid: target.netid(),
            target_port: U16::new(target.port()),
            sender_netid: sender.netid(),
            sender_port: U16::new(sender.port()),
            command: U16::new(cmd as u16),
            state_flags: U16::new(STATE_ADS_COMMAND),
            length: U32::new(body_len),
            error_code: U32::new(0),
            invoke_id: U32::new(0),
        })
    }

    /// Build the header answering `request`: addresses swapped, the
    /// response bit set, and the invoke-id carried over.
    pub fn response_to(request: &FrameHeader, body_len: usize) -> Result<Self> {
        let body_len: u32 = body_len.try_into()?;
        Ok(Self {
            reserved: U16::new(0),
            frame_length: U32::new(AMS_HEADER_SIZE as u32 + body_len),
            target_netid: request.sender_netid,
            target_port: request.sender_port,
            sender_netid: request.target_netid,
            sender_port: request.target_port,
            command: request.command,
            state_flags: U16::new(STATE_ADS_COMMAND | STATE_RESPONSE),
            length: U32::new(body_len),
            error_code: U32::new(0),
            invoke_id: request.invoke_id,
        })
    }

    /// Parse a header from the first [`HEADER_SIZE`] bytes of `buf`.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        let head = buf.get(..HEADER_SIZE).ok_or(Error::Decode("frame header", "truncated header"))?;
        Self::read_from_bytes(head).map_err(|_| Error::Decode("frame header", "truncated header"))
    }

    /// Destination address of the frame.
    pub fn target(&self) -> AmsAddr {
        AmsAddr::new(self.target_netid, self.target_port.get())
    }

    /// Source address of the frame.
    pub fn sender(&self) -> AmsAddr {
        AmsAddr::new(self.sender_netid, self.sender_port.get())
    }
}

/// How the receive pump should treat an inbound frame, determined from the
/// command id and the response bit alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// A response to one of our requests, matched by invoke-id.
    Response(Command),
    /// A server-initiated device notification.
    Notification,
    /// The server asking us for our ADS/device state.
    StateQuery,
    /// Anything else; logged and skipped.
    Unknown,
}

/// Classify a frame by `(command, response bit)`.
pub fn classify(header: &FrameHeader) -> FrameKind {
    let response = header.state_flags.get() & STATE_RESPONSE != 0;
    match (Command::from_u16(header.command.get()), response) {
        (Some(Command::Notification), _) => FrameKind::Notification,
        (Some(Command::ReadState), false) => FrameKind::StateQuery,
        (Some(cmd), true) => FrameKind::Response(cmd),
        _ => FrameKind::Unknown,
    }
}

/// A request packet body, one variant per outbound command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Read `length` bytes at an index group/offset.
    Read {
        /// Index group of the resource to read.
        index_group: u32,
        /// Index offset within the group.
        index_offset: u32,
        /// Number of bytes to read.
        length: u32,
    },
    /// Write the payload to an index group/offset.
    Write {
        /// Index group of the resource to write.
        index_group: u32,
        /// Index offset within the group.
        index_offset: u32,
        /// Bytes to write.
        data: Vec<u8>,
    },
    /// Write the payload, then read back up to `read_length` bytes.
    ReadWrite {
        /// Index group of the resource.
        index_group: u32,
        /// Index offset within the group.
        index_offset: u32,
        /// Maximum number of bytes to read back.
        read_length: u32,
        /// Bytes to write.
        data: Vec<u8>,
    },
    /// Query the ADS and device state.
    ReadState,
    /// Query device name and version.
    DeviceInfo,
    /// Register a device notification.
    AddNotification {
        /// Index group of the monitored resource.
        index_group: u32,
        /// Index offset within the group.
        index_offset: u32,
        /// Number of bytes to monitor.
        length: u32,
        /// Transmission mode, see [`crate::notif::TransmissionMode`].
        trans_mode: u32,
        /// Maximum delay between change and transmission, in 100 ns units.
        max_delay: u32,
        /// Change-detection cycle time, in 100 ns units.
        cycle_time: u32,
    },
    /// Remove a device notification.
    DeleteNotification {
        /// The server-assigned notification handle.
        handle: u32,
    },
}

impl Request {
    /// The command id this packet is sent under.
    pub fn command(&self) -> Command {
        match self {
            Request::Read { .. } => Command::Read,
            Request::Write { .. } => Command::Write,
            Request::ReadWrite { .. } => Command::ReadWrite,
            Request::ReadState => Command::ReadState,
            Request::DeviceInfo => Command::ReadDeviceInfo,
            Request::AddNotification { .. } => Command::AddNotification,
            Request::DeleteNotification { .. } => Command::DeleteNotification,
        }
    }

    /// Append the little-endian body to `buf`.
    pub fn encode_body(&self, buf: &mut Vec<u8>) -> Result<()> {
        match self {
            Request::Read { index_group, index_offset, length } => {
                put_u32(buf, *index_group);
                put_u32(buf, *index_offset);
                put_u32(buf, *length);
            }
            Request::Write { index_group, index_offset, data } => {
                put_u32(buf, *index_group);
                put_u32(buf, *index_offset);
                put_u32(buf, data.len().try_into()?);
                buf.extend_from_slice(data);
            }
            Request::ReadWrite { index_group, index_offset, read_length, data } => {
                put_u32(buf, *index_group);
                put_u32(buf, *index_offset);
                put_u32(buf, *read_length);
                put_u32(buf, data.len().try_into()?);
                buf.extend_from_slice(data);
            }
            Request::ReadState | Request::DeviceInfo => {}
            Request::AddNotification {
                index_group, index_offset, length, trans_mode, max_delay, cycle_time,
            } => {
                put_u32(buf, *index_group);
                put_u32(buf, *index_offset);
                put_u32(buf, *length);
                put_u32(buf, *trans_mode);
                put_u32(buf, *max_delay);
                put_u32(buf, *cycle_time);
                buf.extend_from_slice(&[0; 16]);
            }
            Request::DeleteNotification { handle } => put_u32(buf, *handle),
        }
        Ok(())
    }

    /// Decode a request body for the given command.
    pub fn decode(cmd: Command, body: &[u8]) -> Result<Self> {
        let ctx = cmd.action();
        let mut r = body;
        Ok(match cmd {
            Command::Read => Request::Read {
                index_group: read_u32(&mut r, ctx)?,
                index_offset: read_u32(&mut r, ctx)?,
                length: read_u32(&mut r, ctx)?,
            },
            Command::Write => {
                let index_group = read_u32(&mut r, ctx)?;
                let index_offset = read_u32(&mut r, ctx)?;
                let length = read_u32(&mut r, ctx)?;
                let data = take(&mut r, length as usize, ctx)?;
                Request::Write { index_group, index_offset, data }
            }
            Command::ReadWrite => {
                let index_group = read_u32(&mut r, ctx)?;
                let index_offset = read_u32(&mut r, ctx)?;
                let read_length = read_u32(&mut r, ctx)?;
                let write_length = read_u32(&mut r, ctx)?;
                let data = take(&mut r, write_length as usize, ctx)?;
                Request::ReadWrite { index_group, index_offset, read_length, data }
            }
            Command::ReadState => Request::ReadState,
            Command::ReadDeviceInfo => Request::DeviceInfo,
            Command::AddNotification => {
                let req = Request::AddNotification {
                    index_group: read_u32(&mut r, ctx)?,
                    index_offset: read_u32(&mut r, ctx)?,
                    length: read_u32(&mut r, ctx)?,
                    trans_mode: read_u32(&mut r, ctx)?,
                    max_delay: read_u32(&mut r, ctx)?,
                    cycle_time: read_u32(&mut r, ctx)?,
                };
                take(&mut r, 16, ctx)?;
                req
            }
            Command::DeleteNotification => {
                Request::DeleteNotification { handle: read_u32(&mut r, ctx)? }
            }
            Command::Notification => {
                return Err(Error::Decode(ctx, "notification is not a request/response packet"))
            }
        })
    }
}

/// A response packet body, decoded according to the command id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Data read from an index group/offset.
    Read {
        /// ADS result code.
        result: u32,
        /// The returned bytes.
        data: Vec<u8>,
    },
    /// Outcome of a write.
    Write {
        /// ADS result code.
        result: u32,
    },
    /// Data read back by a read/write transaction.
    ReadWrite {
        /// ADS result code.
        result: u32,
        /// The returned bytes.
        data: Vec<u8>,
    },
    /// ADS and device state of the answering device.
    ReadState {
        /// ADS result code.
        result: u32,
        /// Current ADS state.
        ads_state: u16,
        /// Current device-specific state.
        device_state: u16,
    },
    /// Device name and version.
    DeviceInfo {
        /// ADS result code.
        result: u32,
        /// Major version.
        major: u8,
        /// Minor version.
        minor: u8,
        /// Build number.
        build: u16,
        /// Device name, cut at the first NUL of its 16-byte field.
        name: String,
    },
    /// The server-assigned notification handle.
    AddNotification {
        /// ADS result code.
        result: u32,
        /// The new notification handle.
        handle: u32,
    },
    /// Outcome of a notification removal.
    DeleteNotification {
        /// ADS result code.
        result: u32,
    },
}

impl Response {
    /// Decode a response body for the given command.  A short body yields
    /// a decode error.
    pub fn decode(cmd: Command, body: &[u8]) -> Result<Self> {
        let ctx = cmd.action();
        let mut r = body;
        Ok(match cmd {
            Command::Read => {
                let result = read_u32(&mut r, ctx)?;
                let length = read_u32(&mut r, ctx)?;
                Response::Read { result, data: take(&mut r, length as usize, ctx)? }
            }
            Command::Write => Response::Write { result: read_u32(&mut r, ctx)? },
            Command::ReadWrite => {
                let result = read_u32(&mut r, ctx)?;
                let length = read_u32(&mut r, ctx)?;
                Response::ReadWrite { result, data: take(&mut r, length as usize, ctx)? }
            }
            Command::ReadState => Response::ReadState {
                result: read_u32(&mut r, ctx)?,
                ads_state: read_u16(&mut r, ctx)?,
                device_state: read_u16(&mut r, ctx)?,
            },
            Command::ReadDeviceInfo => {
                let result = read_u32(&mut r, ctx)?;
                let major = read_u8(&mut r, ctx)?;
                let minor = read_u8(&mut r, ctx)?;
                let build = read_u16(&mut r, ctx)?;
                let raw_name = take(&mut r, 16, ctx)?;
                // The name is NUL-terminated Windows-1252; in practice it
                // only ever contains ASCII.
                let name = raw_name.iter().take_while(|&&ch| ch > 0).map(|&ch| ch as char).collect();
                Response::DeviceInfo { result, major, minor, build, name }
            }
            Command::AddNotification => Response::AddNotification {
                result: read_u32(&mut r, ctx)?,
                handle: read_u32(&mut r, ctx)?,
            },
            Command::DeleteNotification => {
                Response::DeleteNotification { result: read_u32(&mut r, ctx)? }
            }
            Command::Notification => {
                return Err(Error::Decode(ctx, "notification is not a request/response packet"))
            }
        })
    }

    /// The ADS result code carried in the body.
    pub fn result(&self) -> u32 {
        match self {
            Response::Read { result, .. }
            | Response::Write { result }
            | Response::ReadWrite { result, .. }
            | Response::ReadState { result, .. }
            | Response::DeviceInfo { result, .. }
            | Response::AddNotification { result, .. }
            | Response::DeleteNotification { result } => *result,
        }
    }

    /// Append the little-endian body to `buf`.  Used for the inbound
    /// state-query reply and by test servers.
    pub fn encode_body(&self, buf: &mut Vec<u8>) {
        match self {
            Response::Read { result, data } | Response::ReadWrite { result, data } => {
                put_u32(buf, *result);
                put_u32(buf, data.len() as u32);
                buf.extend_from_slice(data);
            }
            Response::Write { result } | Response::DeleteNotification { result } => {
                put_u32(buf, *result);
            }
            Response::ReadState { result, ads_state, device_state } => {
                put_u32(buf, *result);
                buf.extend_from_slice(&ads_state.to_le_bytes());
                buf.extend_from_slice(&device_state.to_le_bytes());
            }
            Response::DeviceInfo { result, major, minor, build, name } => {
                put_u32(buf, *result);
                buf.push(*major);
                buf.push(*minor);
                buf.extend_from_slice(&build.to_le_bytes());
                let mut raw_name = [0u8; 16];
                let n = name.len().min(16);
                raw_name[..n].copy_from_slice(&name.as_bytes()[..n]);
                buf.extend_from_slice(&raw_name);
            }
            Response::AddNotification { result, handle } => {
                put_u32(buf, *result);
                put_u32(buf, *handle);
            }
        }
    }
}

fn put_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

pub(crate) fn read_u8(r: &mut &[u8], ctx: &'static str) -> Result<u8> {
    r.read_u8().map_err(|_| Error::Decode(ctx, "truncated body"))
}

pub(crate) fn read_u16(r: &mut &[u8], ctx: &'static str) -> Result<u16> {
    r.read_u16::<LE>().map_err(|_| Error::Decode(ctx, "truncated body"))
}

pub(crate) fn read_u32(r: &mut &[u8], ctx: &'static str) -> Result<u32> {
    r.read_u32::<LE>().map_err(|_| Error::Decode(ctx, "truncated body"))
}

pub(crate) fn read_u64(r: &mut &[u8], ctx: &'static str) -> Result<u64> {
    r.read_u64::<LE>().map_err(|_| Error::Decode(ctx, "truncated body"))
}

pub(crate) fn take(r: &mut &[u8], n: usize, ctx: &'static str) -> Result<Vec<u8>> {
    if r.len() < n {
        return Err(Error::Decode(ctx, "truncated body"));
    }
    let (head, rest) = r.split_at(n);
    *r = rest;
    Ok(head.to_vec())
}
