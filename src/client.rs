//! The TCP transport: one connection, one receive pump, many callers.

use std::collections::BTreeMap;
use std::io::{ErrorKind, Read, Write};
use std::net::{IpAddr, Shutdown, TcpStream, ToSocketAddrs};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use byteorder::{ByteOrder, LE};
use crossbeam_channel::{after, bounded, never, select, Receiver, Sender};
use log::{debug, error, warn};
use zerocopy::byteorder::little_endian::U32;
use zerocopy::IntoBytes;

use crate::errors::{ads_error, ErrContext, Error, Result};
use crate::frame::{
    classify, FrameHeader, FrameKind, Request, Response, AMS_HEADER_SIZE, HEADER_SIZE,
    STATE_ADS_COMMAND, STATE_RESPONSE, TCP_HEADER_SIZE,
};
use crate::notif::Notification;
use crate::session::Session;
use crate::{AmsAddr, AmsNetId};

type PendingMap = Arc<Mutex<BTreeMap<u32, Sender<Result<(FrameHeader, Response)>>>>>;

/// Callback invoked by the receive pump for every inbound notification frame.
pub type NotificationHandler = Arc<dyn Fn(&Notification) + Send + Sync>;

type HandlerSlot = Arc<RwLock<Option<NotificationHandler>>>;

/// Holds the different timeouts used by the client.  `None` means no
/// timeout in every case.
#[derive(Clone, Copy, Debug)]
pub struct Timeouts {
    /// Connect timeout.
    pub connect: Option<Duration>,
    /// Default reply timeout, overridable per operation via [`Context`].
    pub read: Option<Duration>,
    /// Socket write timeout.
    pub write: Option<Duration>,
}

impl Timeouts {
    /// Create a new `Timeouts` where all values are identical.
    pub fn new(duration: Duration) -> Self {
        Self { connect: Some(duration), read: Some(duration), write: Some(duration) }
    }

    /// Create a new `Timeouts` without any timeouts specified.
    pub fn none() -> Self {
        Self { connect: None, read: None, write: None }
    }
}

/// Specifies the source AMS address to use.
#[derive(Clone, Copy, Debug)]
pub enum Source {
    /// Derive the NetID from the local IP address with `.1.1` appended and
    /// use an ephemeral AMS port.  `127.0.0.1.1.1` if there is no IPv4
    /// address.
    Auto,
    /// Use the given source address.  The NetID must match the route entry
    /// configured on the target's router.
    Addr(AmsAddr),
}

/// Per-operation cancellation and timeout control.
///
/// Every operation that performs a server round-trip takes a `Context`.
/// The default context never cancels and uses the client's configured read
/// timeout.  Cache lookups never consult the context.
#[derive(Clone)]
pub struct Context {
    cancel: Receiver<()>,
    read_timeout: Option<Duration>,
}

impl Context {
    /// A context that never cancels and uses the client's read timeout.
    pub fn background() -> Self {
        Self { cancel: never(), read_timeout: None }
    }

    /// A context with an explicit read timeout for this operation.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self { cancel: never(), read_timeout: Some(timeout) }
    }

    /// A cancellable context and the handle that cancels it.
    ///
    /// Note that dropping the [`Canceller`] also cancels the context.
    pub fn cancellable() -> (Self, Canceller) {
        let (tx, rx) = bounded(0);
        (Self { cancel: rx, read_timeout: None }, Canceller(tx))
    }

    /// Set the read timeout, keeping the cancellation behavior.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

/// Cancels every wait on the paired [`Context`], current and future.
pub struct Canceller(Sender<()>);

impl Canceller {
    /// Cancel the paired context.
    pub fn cancel(self) {
        drop(self.0);
    }
}

/// Represents a connection to an ADS router or device.
///
/// All communication methods take `&self`, so a client can be shared
/// freely between threads.  Outbound frames get a fresh invoke-id from an
/// atomic counter and are written under a mutex; a dedicated pump thread
/// reads everything the server sends and routes responses back to their
/// callers by invoke-id.
pub struct Client {
    /// Shared with the pump for answering inbound state queries.
    socket: Arc<Mutex<TcpStream>>,
    invoke_id: AtomicU32,
    read_timeout: Option<Duration>,
    source: AmsAddr,
    pending: PendingMap,
    notif_handler: HandlerSlot,
    ads_state: Arc<AtomicU16>,
    device_state: Arc<AtomicU16>,
    pump: Option<JoinHandle<()>>,
}

impl Client {
    /// Open a new connection to an ADS server.
    ///
    /// If the server sits behind an AMS router, the router needs a route
    /// for the source NetID, otherwise it closes the connection right
    /// away.
    pub fn connect(addr: impl ToSocketAddrs, timeouts: Timeouts, source: Source) -> Result<Self> {
        let addr = addr
            .to_socket_addrs()
            .ctx("resolving server address")?
            .next()
            .ok_or(Error::Io("resolving server address", ErrorKind::AddrNotAvailable.into()))?;

        let stream = match timeouts.connect {
            Some(timeout) => TcpStream::connect_timeout(&addr, timeout).ctx("connecting")?,
            None => TcpStream::connect(addr).ctx("connecting")?,
        };
        // Request/reply ping-pong; small frames must go out promptly.
        stream.set_nodelay(true).ctx("connecting")?;
        stream.set_write_timeout(timeouts.write).ctx("connecting")?;

        let source = match source {
            Source::Addr(addr) => addr,
            Source::Auto => match stream.local_addr().ctx("connecting")?.ip() {
                IpAddr::V4(ip) => {
                    let [a, b, c, d] = ip.octets();
                    AmsAddr::new(AmsNetId::new(a, b, c, d, 1, 1), 58913)
                }
                _ => AmsAddr::new(AmsNetId::local(), 58913),
            },
        };

        let pending = PendingMap::default();
        let notif_handler = HandlerSlot::default();
        let ads_state = Arc::new(AtomicU16::new(AdsState::Start as u16));
        let device_state = Arc::new(AtomicU16::new(AdsState::Start as u16));

        let reader = stream.try_clone().ctx("connecting")?;
        let socket = Arc::new(Mutex::new(stream));
        let pump = Pump {
            stream: reader,
            writer: socket.clone(),
            source,
            pending: pending.clone(),
            handler: notif_handler.clone(),
            ads_state: ads_state.clone(),
            device_state: device_state.clone(),
        };
        let pump = std::thread::spawn(move || pump.run());

        Ok(Client {
            socket,
            invoke_id: AtomicU32::new(1),
            read_timeout: timeouts.read,
            source,
            pending,
            notif_handler,
            ads_state,
            device_state,
            pump: Some(pump),
        })
    }

    /// Return the source address the client sends from.
    pub fn source(&self) -> AmsAddr {
        self.source
    }

    /// Return the ADS and device state the client reports when probed by
    /// the server.
    pub fn states(&self) -> (u16, u16) {
        (self.ads_state.load(Ordering::Relaxed), self.device_state.load(Ordering::Relaxed))
    }

    /// Open a session against `target`, with its own symbol registry.
    pub fn new_session(&self, target: AmsAddr) -> Session<'_> {
        Session::new(self, target)
    }

    /// Query name and version of the device at `target`.
    pub fn device_info(&self, ctx: &Context, target: AmsAddr) -> Result<DeviceInfo> {
        match self.request(ctx, target, Request::DeviceInfo)? {
            Response::DeviceInfo { major, minor, build, name, .. } => {
                Ok(DeviceInfo { major, minor, build, name })
            }
            _ => Err(Error::Reply("get device info", "unexpected response packet", 0)),
        }
    }

    /// Install or clear the handler invoked for every inbound notification
    /// frame.
    ///
    /// The handler runs on the receive pump thread.  It must not perform
    /// blocking operations on this same client, or the pump deadlocks
    /// against itself.
    pub fn set_notification_handler(&self, handler: Option<NotificationHandler>) {
        *self.notif_handler.write().expect("handler slot poisoned") = handler;
    }

    /// Execute a request against `target` and return the decoded response.
    ///
    /// Waits until the response arrives, the context is cancelled, or the
    /// read timeout elapses; the pending registration is removed on every
    /// non-success path, so a response arriving later is dropped by the
    /// pump.
    pub fn request(&self, ctx: &Context, target: AmsAddr, request: Request) -> Result<Response> {
        let cmd = request.command();
        let action = cmd.action();

        let mut body = Vec::new();
        request.encode_body(&mut body)?;

        let invoke_id = self.invoke_id.fetch_add(1, Ordering::Relaxed);
        let mut header = FrameHeader::request(target, self.source, cmd, body.len())?;
        header.invoke_id = U32::new(invoke_id);

        // Register the single-capacity response slot before the frame can
        // possibly be answered.
        let (slot_tx, slot_rx) = bounded(1);
        self.pending.lock().expect("pending map poisoned").insert(invoke_id, slot_tx);

        // One write_all per frame keeps frames contiguous on the wire.
        let mut frame = Vec::with_capacity(HEADER_SIZE + body.len());
        frame.extend_from_slice(header.as_bytes());
        frame.extend_from_slice(&body);
        if let Err(e) = self.socket.lock().expect("socket lock poisoned").write_all(&frame) {
            self.discard_pending(invoke_id);
            return Err(Error::Io(action, e));
        }

        let timeout = ctx.read_timeout.or(self.read_timeout);
        let deadline = timeout.map(after).unwrap_or_else(never);

        let delivered = select! {
            recv(slot_rx) -> delivery => match delivery {
                Ok(delivery) => delivery,
                Err(_) => {
                    self.discard_pending(invoke_id);
                    return Err(Error::Io(action, ErrorKind::ConnectionAborted.into()));
                }
            },
            recv(ctx.cancel) -> _ => {
                self.discard_pending(invoke_id);
                return Err(Error::Cancelled(action));
            }
            recv(deadline) -> _ => {
                self.discard_pending(invoke_id);
                return Err(Error::Timeout(action));
            }
        };
        let (resp_header, response) = delivered?;

        // The pump only matched the invoke-id; check the rest here.
        if resp_header.sender() != target {
            return Err(Error::Reply(action, "response from unexpected device", 0));
        }
        if resp_header.command.get() != cmd as u16 {
            return Err(Error::Reply(action, "unexpected command id", resp_header.command.get().into()));
        }
        if resp_header.state_flags.get() != (STATE_ADS_COMMAND | STATE_RESPONSE) {
            return Err(Error::Reply(action, "unexpected state flags", resp_header.state_flags.get().into()));
        }
        if resp_header.error_code.get() != 0 {
            return ads_error(action, resp_header.error_code.get());
        }
        if response.result() != 0 {
            return ads_error(action, response.result());
        }
        Ok(response)
    }

    /// Shut the connection down.  Equivalent to dropping the client.
    pub fn close(self) {}

    fn discard_pending(&self, invoke_id: u32) {
        self.pending.lock().expect("pending map poisoned").remove(&invoke_id);
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        // The pump blocks in read_exact on a duplicate of this socket;
        // shutting down makes that read return so the thread can exit.
        if let Ok(socket) = self.socket.lock() {
            let _ = socket.shutdown(Shutdown::Both);
        }
        if let Some(pump) = self.pump.take() {
            let _ = pump.join();
        }
    }
}

/// Device info returned from an ADS server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Name of the ADS device/service.
    pub name: String,
    /// Major version.
    pub major: u8,
    /// Minor version.
    pub minor: u8,
    /// Build number.
    pub build: u16,
}

/// The ADS state of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
#[repr(u16)]
pub enum AdsState {
    Invalid = 0,
    Idle = 1,
    Reset = 2,
    Init = 3,
    Start = 4,
    Run = 5,
    Stop = 6,
    SaveCfg = 7,
    LoadCfg = 8,
    PowerFail = 9,
    PowerGood = 10,
    Error = 11,
    Shutdown = 12,
    Suspend = 13,
    Resume = 14,
    Config = 15,
    Reconfig = 16,
}

impl TryFrom<u16> for AdsState {
    type Error = &'static str;

    fn try_from(value: u16) -> std::result::Result<Self, &'static str> {
        Ok(match value {
            0 => Self::Invalid,
            1 => Self::Idle,
            2 => Self::Reset,
            3 => Self::Init,
            4 => Self::Start,
            5 => Self::Run,
            6 => Self::Stop,
            7 => Self::SaveCfg,
            8 => Self::LoadCfg,
            9 => Self::PowerFail,
            10 => Self::PowerGood,
            11 => Self::Error,
            12 => Self::Shutdown,
            13 => Self::Suspend,
            14 => Self::Resume,
            15 => Self::Config,
            16 => Self::Reconfig,
            _ => return Err("invalid state constant"),
        })
    }
}

// The receive pump: reads every inbound frame, answers state queries,
// dispatches notifications, and routes responses by invoke-id.
struct Pump {
    stream: TcpStream,
    writer: Arc<Mutex<TcpStream>>,
    source: AmsAddr,
    pending: PendingMap,
    handler: HandlerSlot,
    ads_state: Arc<AtomicU16>,
    device_state: Arc<AtomicU16>,
}

impl Pump {
    fn run(mut self) {
        self.ads_state.store(AdsState::Run as u16, Ordering::Relaxed);
        self.device_state.store(AdsState::Run as u16, Ordering::Relaxed);

        let err = match self.pump_loop() {
            Err(err) => err,
            Ok(()) => Error::Io("receive pump", ErrorKind::UnexpectedEof.into()),
        };
        debug!("receive pump exiting: {}", err);

        self.ads_state.store(AdsState::Stop as u16, Ordering::Relaxed);
        self.device_state.store(AdsState::Stop as u16, Ordering::Relaxed);
        let _ = self.stream.shutdown(Shutdown::Both);

        // Wake up everyone still waiting for a response.
        if let Ok(mut pending) = self.pending.lock() {
            for (_, slot) in std::mem::take(&mut *pending) {
                let _ = slot.send(Err(err.clone()));
            }
        }
    }

    // Runs until the connection dies or a response frame fails to decode.
    fn pump_loop(&mut self) -> Result<()> {
        let mut buf = Vec::with_capacity(1500);
        loop {
            buf.resize(HEADER_SIZE, 0);
            self.stream.read_exact(&mut buf[..TCP_HEADER_SIZE]).ctx("receiving frame")?;
            let frame_len = LE::read_u32(&buf[2..TCP_HEADER_SIZE]) as usize;

            if frame_len < AMS_HEADER_SIZE {
                // Router chatter (port notifications etc.); drain and move on.
                let mut discard = [0u8; AMS_HEADER_SIZE];
                self.stream.read_exact(&mut discard[..frame_len]).ctx("receiving frame")?;
                debug!("skipping runt frame of {} bytes", frame_len);
                continue;
            }

            buf.resize(TCP_HEADER_SIZE + frame_len, 0);
            self.stream.read_exact(&mut buf[TCP_HEADER_SIZE..]).ctx("receiving frame")?;
            let header = FrameHeader::parse(&buf)?;

            if header.length.get() as usize != frame_len - AMS_HEADER_SIZE {
                return Err(Error::Decode("frame header", "inconsistent length fields"));
            }
            if header.target() != self.source {
                debug!("dropping frame addressed to {}", header.target());
                continue;
            }

            let body = &buf[HEADER_SIZE..];
            match classify(&header) {
                FrameKind::Response(cmd) => {
                    // A malformed response leaves the caller hanging and the
                    // stream in an unknown state; give up on the connection.
                    let response = Response::decode(cmd, body)?;
                    let invoke_id = header.invoke_id.get();
                    let slot =
                        self.pending.lock().expect("pending map poisoned").remove(&invoke_id);
                    match slot {
                        Some(slot) => {
                            if slot.send(Ok((header, response))).is_err() {
                                debug!("dropping late response for invoke id {}", invoke_id);
                            }
                        }
                        None => warn!("no pending request for invoke id {}", invoke_id),
                    }
                }
                FrameKind::StateQuery => self.answer_state_query(&header)?,
                FrameKind::Notification => {
                    let handler =
                        self.handler.read().expect("handler slot poisoned").clone();
                    match Notification::decode(body) {
                        Ok(notif) => {
                            if let Some(handler) = handler {
                                if catch_unwind(AssertUnwindSafe(|| handler(&notif))).is_err() {
                                    error!("notification handler panicked");
                                }
                            }
                        }
                        Err(e) => {
                            if handler.is_some() {
                                warn!("skipping undecodable notification: {}", e);
                            }
                        }
                    }
                }
                FrameKind::Unknown => {
                    warn!(
                        "skipping frame with unknown command {:#x} (state flags {:#x})",
                        header.command.get(),
                        header.state_flags.get()
                    );
                }
            }
        }
    }

    // The PLC probes liveness by sending us a ReadState request; answer
    // with the cached states, echoing the invoke-id.
    fn answer_state_query(&self, request: &FrameHeader) -> Result<()> {
        let response = Response::ReadState {
            result: 0,
            ads_state: self.ads_state.load(Ordering::Relaxed),
            device_state: self.device_state.load(Ordering::Relaxed),
        };
        let mut body = Vec::with_capacity(8);
        response.encode_body(&mut body);
        let header = FrameHeader::response_to(request, body.len())?;

        let mut frame = Vec::with_capacity(HEADER_SIZE + body.len());
        frame.extend_from_slice(header.as_bytes());
        frame.extend_from_slice(&body);
        self.writer
            .lock()
            .expect("socket lock poisoned")
            .write_all(&frame)
            .ctx("answering state query")
    }
}
