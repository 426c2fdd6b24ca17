// Shared mock ADS server for the crate test suite.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use byteorder::{ByteOrder, LE};
use once_cell::sync::Lazy;
use zerocopy::byteorder::little_endian::U32;
use zerocopy::IntoBytes;

use crate::client::{Client, Source, Timeouts};
use crate::frame::{
    Command, FrameHeader, Request, Response, AMS_HEADER_SIZE, HEADER_SIZE, STATE_RESPONSE,
    TCP_HEADER_SIZE,
};
use crate::netid::{AmsAddr, AmsNetId};
use crate::{index, Session};

mod test_frame;

/// Source address the test client sends from.
pub const CLIENT_ADDR: AmsAddr = AmsAddr::new(AmsNetId::new(7, 7, 7, 7, 1, 1), 800);
/// Address of the simulated PLC runtime.
pub const SERVER_ADDR: AmsAddr = AmsAddr::new(AmsNetId::new(1, 2, 3, 4, 5, 6), 851);

// Configures different ways the server should behave.
#[derive(Default)]
pub struct ServerOpts {
    /// Swallow requests without ever replying.
    pub no_reply: bool,
    /// Sleep this long before sending each reply.
    pub delay_reply: Option<Duration>,
    /// Push this notification frame after replying to each write, once a
    /// subscription exists.
    pub notify: Option<NotifySpec>,
    /// Send a ReadState request to the client before replying to the next
    /// request; the client's answer lands in `state_replies`.
    pub probe_state: bool,
}

// A notification frame the server injects.
#[derive(Clone)]
pub struct NotifySpec {
    pub handle: u32,
    pub timestamp: u64,
    pub data: Vec<u8>,
}

pub struct TestServer {
    pub port: u16,
    pub opts: Arc<Mutex<ServerOpts>>,
    // (ads_state, device_state, invoke_id) from ReadState responses the
    // client sent back to us.
    pub state_replies: Arc<Mutex<Vec<(u16, u16, u32)>>>,
    // Symbol handles the client released.
    pub released: Arc<Mutex<Vec<u32>>>,
}

// Since Cargo tests run multi-threaded, start one server per thread and
// handle clients from the test functions in that thread.
thread_local! {
    static SERVER: Lazy<TestServer> = Lazy::new(|| {
        let opts = Arc::new(Mutex::new(ServerOpts::default()));
        let state_replies: Arc<Mutex<Vec<(u16, u16, u32)>>> = Arc::default();
        let released: Arc<Mutex<Vec<u32>>> = Arc::default();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut server = Server {
            opts: opts.clone(),
            state_replies: state_replies.clone(),
            released: released.clone(),
            store: HashMap::new(),
            notif_handle: None,
        };
        thread::spawn(move || {
            for client in listener.incoming().flatten() {
                // One client at a time is all the tests need.
                server.handle_client(client);
            }
        });

        TestServer { port, opts, state_replies, released }
    });
}

pub fn config_test_server(opts: ServerOpts) -> u16 {
    SERVER.with(|server| {
        *server.opts.lock().unwrap() = opts;
        server.state_replies.lock().unwrap().clear();
        server.released.lock().unwrap().clear();
        server.port
    })
}

pub fn state_replies() -> Vec<(u16, u16, u32)> {
    SERVER.with(|server| server.state_replies.lock().unwrap().clone())
}

pub fn released_handles() -> Vec<u32> {
    SERVER.with(|server| server.released.lock().unwrap().clone())
}

pub fn run_test(opts: ServerOpts, f: impl FnOnce(&Session)) {
    let port = config_test_server(opts);
    let client =
        Client::connect(("127.0.0.1", port), Timeouts::none(), Source::Addr(CLIENT_ADDR)).unwrap();
    let session = client.new_session(SERVER_ADDR);
    f(&session);
}

// The simulated PLC: a handful of symbols, a value store keyed by handle,
// and a single notification slot.
struct Server {
    opts: Arc<Mutex<ServerOpts>>,
    state_replies: Arc<Mutex<Vec<(u16, u16, u32)>>>,
    released: Arc<Mutex<Vec<u32>>>,
    store: HashMap<u32, Vec<u8>>,
    notif_handle: Option<u32>,
}

// (handle, size, type name) per known symbol.
fn lookup_symbol(name: &str) -> Option<(u32, u32, &'static str)> {
    match name {
        "MAIN.x" => Some((0x12345678, 4, "DINT")),
        "MAIN.i" => Some((21, 4, "DINT")),
        "MAIN.b" => Some((33, 1, "BOOL")),
        "MAIN.root" => Some((55, 10, "ST_ROOT")),
        _ => None,
    }
}

fn known_handle(handle: u32) -> bool {
    matches!(handle, 0x12345678 | 21 | 33 | 55)
}

fn type_layout(name: &str) -> Option<Vec<u8>> {
    match name {
        "ST_ROOT" => Some(type_record(name, "", 10, 0, &[("a", "INT", 0, 2), ("b", "ST_INNER", 2, 8)])),
        "ST_INNER" => Some(type_record(name, "", 8, 0, &[("c", "DINT", 0, 4), ("d", "REAL", 4, 4)])),
        _ => None,
    }
}

impl Server {
    fn handle_client(&mut self, mut socket: TcpStream) {
        loop {
            let mut head = [0u8; HEADER_SIZE];
            if socket.read_exact(&mut head[..TCP_HEADER_SIZE]).is_err() {
                // connection was closed
                return;
            }
            let frame_len = LE::read_u32(&head[2..TCP_HEADER_SIZE]) as usize;
            if socket.read_exact(&mut head[TCP_HEADER_SIZE..]).is_err() {
                return;
            }
            let header = FrameHeader::parse(&head).unwrap();
            let mut body = vec![0; frame_len - AMS_HEADER_SIZE];
            socket.read_exact(&mut body).unwrap();

            // ReadState replies coming back from the client's pump.
            if header.state_flags.get() & STATE_RESPONSE != 0 {
                if header.command.get() == Command::ReadState as u16 {
                    if let Ok(Response::ReadState { ads_state, device_state, .. }) =
                        Response::decode(Command::ReadState, &body)
                    {
                        self.state_replies.lock().unwrap().push((
                            ads_state,
                            device_state,
                            header.invoke_id.get(),
                        ));
                    }
                }
                continue;
            }

            let (no_reply, delay, notify, probe) = {
                let mut opts = self.opts.lock().unwrap();
                let probe = std::mem::take(&mut opts.probe_state);
                (opts.no_reply, opts.delay_reply, opts.notify.clone(), probe)
            };

            if probe {
                send_state_probe(&mut socket);
            }
            if no_reply {
                continue;
            }

            let cmd = Command::from_u16(header.command.get()).unwrap();
            let request = Request::decode(cmd, &body).unwrap();
            let is_write = matches!(request, Request::Write { .. });
            let reply = self.dispatch(request);

            if let Some(delay) = delay {
                thread::sleep(delay);
            }
            send_response(&mut socket, &header, &reply);

            if is_write {
                if let (Some(inject), Some(_)) = (&notify, self.notif_handle) {
                    send_notification(&mut socket, inject);
                }
            }
        }
    }

    fn dispatch(&mut self, request: Request) -> Response {
        match request {
            Request::Read { index_group, index_offset, length } => match index_group {
                index::RW_SYMVAL_BYHANDLE => match self.store.get(&index_offset) {
                    Some(stored) => {
                        let mut data = stored.clone();
                        data.truncate(length as usize);
                        Response::Read { result: 0, data }
                    }
                    None => Response::Read { result: 0x710, data: vec![] },
                },
                index::SYM_UPLOAD_INFO2 => {
                    let table = full_symbol_table();
                    let mut info = vec![0u8; 0x30];
                    LE::write_u32(&mut info[0..4], 2);
                    LE::write_u32(&mut info[4..8], table.len() as u32);
                    Response::Read { result: 0, data: info }
                }
                index::SYM_UPLOAD => Response::Read { result: 0, data: full_symbol_table() },
                _ => Response::Read { result: 0x702, data: vec![] },
            },

            Request::Write { index_group, index_offset, data } => match index_group {
                index::RW_SYMVAL_BYHANDLE => {
                    if known_handle(index_offset) {
                        self.store.insert(index_offset, data);
                        Response::Write { result: 0 }
                    } else {
                        Response::Write { result: 0x710 }
                    }
                }
                index::RELEASE_SYMHANDLE => {
                    self.released.lock().unwrap().push(LE::read_u32(&data));
                    Response::Write { result: 0 }
                }
                _ => Response::Write { result: 0x702 },
            },

            Request::ReadWrite { index_group, data, .. } => {
                let (result, data) = match index_group {
                    index::GET_SYMHANDLE_BYNAME => {
                        match lookup_symbol(&String::from_utf8_lossy(&data)) {
                            Some((handle, ..)) => (0, handle.to_le_bytes().to_vec()),
                            None => (0x710, vec![]),
                        }
                    }
                    index::GET_SYMINFO_BYNAME_EX => match lookup_symbol(&cstr(&data)) {
                        Some((handle, size, ty)) => {
                            (0, symbol_entry(&cstr(&data), ty, size, index::PLC_RW_M, handle))
                        }
                        None => (0x710, vec![]),
                    },
                    index::GET_DATATYPE_BYNAME => match type_layout(&cstr(&data)) {
                        Some(record) => (0, record),
                        None => (0x710, vec![]),
                    },
                    _ => (0x702, vec![]),
                };
                Response::ReadWrite { result, data }
            }

            Request::DeviceInfo => Response::DeviceInfo {
                result: 0,
                major: 7,
                minor: 1,
                build: 4024,
                name: "Mock device".into(),
            },
            Request::ReadState => Response::ReadState { result: 0, ads_state: 5, device_state: 0 },

            Request::AddNotification { .. } => {
                self.notif_handle = Some(7);
                Response::AddNotification { result: 0, handle: 7 }
            }
            Request::DeleteNotification { handle } => {
                if self.notif_handle == Some(handle) {
                    self.notif_handle = None;
                    Response::DeleteNotification { result: 0 }
                } else {
                    Response::DeleteNotification { result: 0x714 }
                }
            }
        }
    }
}

fn send_response(socket: &mut TcpStream, request_header: &FrameHeader, response: &Response) {
    let mut body = Vec::new();
    response.encode_body(&mut body);
    let header = FrameHeader::response_to(request_header, body.len()).unwrap();
    socket.write_all(header.as_bytes()).unwrap();
    socket.write_all(&body).unwrap();
}

fn send_state_probe(socket: &mut TcpStream) {
    let mut header = FrameHeader::request(CLIENT_ADDR, SERVER_ADDR, Command::ReadState, 0).unwrap();
    header.invoke_id = U32::new(999);
    socket.write_all(header.as_bytes()).unwrap();
}

fn send_notification(socket: &mut TcpStream, inject: &NotifySpec) {
    let mut rest = Vec::new();
    rest.extend_from_slice(&1u32.to_le_bytes()); // one stamp
    rest.extend_from_slice(&inject.timestamp.to_le_bytes());
    rest.extend_from_slice(&1u32.to_le_bytes()); // one sample
    rest.extend_from_slice(&inject.handle.to_le_bytes());
    rest.extend_from_slice(&(inject.data.len() as u32).to_le_bytes());
    rest.extend_from_slice(&inject.data);

    let mut body = Vec::with_capacity(4 + rest.len());
    body.extend_from_slice(&(rest.len() as u32).to_le_bytes());
    body.extend_from_slice(&rest);

    let header =
        FrameHeader::request(CLIENT_ADDR, SERVER_ADDR, Command::Notification, body.len()).unwrap();
    socket.write_all(header.as_bytes()).unwrap();
    socket.write_all(&body).unwrap();
}

fn cstr(data: &[u8]) -> String {
    crate::symbol::null_terminated(data)
}

// One symbol entry record in the upload/lookup wire layout.
fn symbol_entry(name: &str, ty: &str, size: u32, group: u32, offset: u32) -> Vec<u8> {
    let entry_len = 30 + name.len() + 1 + ty.len() + 1 + 1;
    let mut body = Vec::with_capacity(entry_len);
    body.extend_from_slice(&(entry_len as u32).to_le_bytes());
    body.extend_from_slice(&group.to_le_bytes());
    body.extend_from_slice(&offset.to_le_bytes());
    body.extend_from_slice(&size.to_le_bytes());
    body.extend_from_slice(&0u32.to_le_bytes()); // base type
    body.extend_from_slice(&0u32.to_le_bytes()); // flags
    body.extend_from_slice(&(name.len() as u16).to_le_bytes());
    body.extend_from_slice(&(ty.len() as u16).to_le_bytes());
    body.extend_from_slice(&0u16.to_le_bytes()); // comment length
    body.extend_from_slice(name.as_bytes());
    body.push(0);
    body.extend_from_slice(ty.as_bytes());
    body.push(0);
    body.push(0); // empty comment
    body
}

fn full_symbol_table() -> Vec<u8> {
    let mut table = Vec::new();
    for name in ["MAIN.x", "MAIN.i"] {
        let (handle, size, ty) = lookup_symbol(name).unwrap();
        table.extend_from_slice(&symbol_entry(name, ty, size, index::PLC_RW_M, handle));
    }
    table
}

// One data-type entry record, with one level of sub-items.
fn type_record(name: &str, ty: &str, size: u32, offs: u32,
               fields: &[(&str, &str, u32, u32)]) -> Vec<u8> {
    let mut subs = Vec::new();
    for &(field_name, field_ty, field_offs, field_size) in fields {
        subs.extend_from_slice(&type_record(field_name, field_ty, field_size, field_offs, &[]));
    }
    let entry_len = 42 + name.len() + 1 + ty.len() + 1 + 1 + subs.len();
    let mut body = Vec::with_capacity(entry_len);
    body.extend_from_slice(&(entry_len as u32).to_le_bytes());
    body.extend_from_slice(&1u32.to_le_bytes()); // version
    body.extend_from_slice(&0u32.to_le_bytes()); // hash
    body.extend_from_slice(&0u32.to_le_bytes()); // type hash
    body.extend_from_slice(&size.to_le_bytes());
    body.extend_from_slice(&offs.to_le_bytes());
    body.extend_from_slice(&0u32.to_le_bytes()); // base type
    body.extend_from_slice(&0u32.to_le_bytes()); // flags
    body.extend_from_slice(&(name.len() as u16).to_le_bytes());
    body.extend_from_slice(&(ty.len() as u16).to_le_bytes());
    body.extend_from_slice(&0u16.to_le_bytes()); // comment length
    body.extend_from_slice(&0u16.to_le_bytes()); // array dims
    body.extend_from_slice(&(fields.len() as u16).to_le_bytes());
    body.extend_from_slice(name.as_bytes());
    body.push(0);
    body.extend_from_slice(ty.as_bytes());
    body.push(0);
    body.push(0); // empty comment
    body.extend_from_slice(&subs);
    body
}
