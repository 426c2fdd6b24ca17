//! Tests for the frame codec: header layout, packet round-trips,
//! classification, and truncation handling.

use crate::errors::Error;
use crate::frame::{
    classify, Command, FrameHeader, FrameKind, Request, Response, AMS_HEADER_SIZE, HEADER_SIZE,
    STATE_ADS_COMMAND, STATE_RESPONSE,
};
use crate::test::{CLIENT_ADDR, SERVER_ADDR};

use zerocopy::byteorder::little_endian::U16;
use zerocopy::IntoBytes;

fn roundtrip_request(request: Request) {
    let mut body = Vec::new();
    request.encode_body(&mut body).unwrap();
    let decoded = Request::decode(request.command(), &body).unwrap();
    assert_eq!(decoded, request);
}

fn roundtrip_response(cmd: Command, response: Response) {
    let mut body = Vec::new();
    response.encode_body(&mut body);
    let decoded = Response::decode(cmd, &body).unwrap();
    assert_eq!(decoded, response);
}

#[test]
fn test_request_roundtrips() {
    roundtrip_request(Request::Read { index_group: 0xF005, index_offset: 77, length: 10 });
    roundtrip_request(Request::Write {
        index_group: 0x4020,
        index_offset: 4,
        data: vec![1, 2, 3, 4],
    });
    roundtrip_request(Request::ReadWrite {
        index_group: 0xF003,
        index_offset: 0,
        read_length: 4,
        data: b"MAIN.x".to_vec(),
    });
    roundtrip_request(Request::ReadState);
    roundtrip_request(Request::DeviceInfo);
    roundtrip_request(Request::AddNotification {
        index_group: 0x4020,
        index_offset: 4,
        length: 1,
        trans_mode: 4,
        max_delay: 10_000_000,
        cycle_time: 10_000_000,
    });
    roundtrip_request(Request::DeleteNotification { handle: 132 });
}

#[test]
fn test_response_roundtrips() {
    roundtrip_response(Command::Read, Response::Read { result: 0, data: vec![0xFF; 4] });
    roundtrip_response(Command::Write, Response::Write { result: 0x710 });
    roundtrip_response(
        Command::ReadWrite,
        Response::ReadWrite { result: 0, data: vec![0x78, 0x56, 0x34, 0x12] },
    );
    roundtrip_response(
        Command::ReadState,
        Response::ReadState { result: 0, ads_state: 5, device_state: 0 },
    );
    roundtrip_response(
        Command::ReadDeviceInfo,
        Response::DeviceInfo { result: 0, major: 3, minor: 1, build: 4024, name: "PLC".into() },
    );
    roundtrip_response(
        Command::AddNotification,
        Response::AddNotification { result: 0, handle: 7 },
    );
    roundtrip_response(Command::DeleteNotification, Response::DeleteNotification { result: 0 });
}

#[test]
fn test_header_layout() {
    let mut header = FrameHeader::request(SERVER_ADDR, CLIENT_ADDR, Command::Read, 12).unwrap();
    header.invoke_id.set(42);

    let bytes = header.as_bytes();
    assert_eq!(bytes.len(), HEADER_SIZE);
    // The AMS/TCP length covers the AMS header plus the body.
    assert_eq!(header.frame_length.get(), header.length.get() + AMS_HEADER_SIZE as u32);
    // Reserved bytes, then the length, little-endian.
    assert_eq!(bytes[..6], [0, 0, 44, 0, 0, 0]);
    // Target NetID and port.
    assert_eq!(bytes[6..12], [1, 2, 3, 4, 5, 6]);
    assert_eq!(bytes[12..14], 851u16.to_le_bytes());

    let parsed = FrameHeader::parse(bytes).unwrap();
    assert_eq!(parsed.target(), SERVER_ADDR);
    assert_eq!(parsed.sender(), CLIENT_ADDR);
    assert_eq!(parsed.command.get(), Command::Read as u16);
    assert_eq!(parsed.state_flags.get(), STATE_ADS_COMMAND);
    assert_eq!(parsed.invoke_id.get(), 42);
}

#[test]
fn test_response_header_mirrors_request() {
    let mut request = FrameHeader::request(SERVER_ADDR, CLIENT_ADDR, Command::Write, 0).unwrap();
    request.invoke_id.set(1234);

    let response = FrameHeader::response_to(&request, 4).unwrap();
    assert_eq!(response.target(), CLIENT_ADDR);
    assert_eq!(response.sender(), SERVER_ADDR);
    assert_eq!(response.state_flags.get(), STATE_ADS_COMMAND | STATE_RESPONSE);
    assert_eq!(response.invoke_id.get(), 1234);
    assert_eq!(response.frame_length.get(), AMS_HEADER_SIZE as u32 + 4);
}

#[test]
fn test_classify() {
    let mut header = FrameHeader::request(CLIENT_ADDR, SERVER_ADDR, Command::Read, 0).unwrap();
    assert_eq!(classify(&header), FrameKind::Unknown); // request for a response-only command

    header.state_flags = U16::new(STATE_ADS_COMMAND | STATE_RESPONSE);
    assert_eq!(classify(&header), FrameKind::Response(Command::Read));

    header.command = U16::new(Command::Notification as u16);
    assert_eq!(classify(&header), FrameKind::Notification);
    header.state_flags = U16::new(STATE_ADS_COMMAND);
    assert_eq!(classify(&header), FrameKind::Notification);

    header.command = U16::new(Command::ReadState as u16);
    assert_eq!(classify(&header), FrameKind::StateQuery);

    header.command = U16::new(0x55);
    assert_eq!(classify(&header), FrameKind::Unknown);
}

#[test]
fn test_truncated_bodies() {
    // Read response missing its data bytes.
    let mut body = Vec::new();
    Response::Read { result: 0, data: vec![1, 2, 3, 4] }.encode_body(&mut body);
    body.truncate(10);
    assert!(matches!(Response::decode(Command::Read, &body), Err(Error::Decode(_, _))));

    // Header fields cut short.
    assert!(matches!(Response::decode(Command::ReadState, &[0, 0]), Err(Error::Decode(_, _))));
    assert!(matches!(Response::decode(Command::AddNotification, &[0; 4]),
                     Err(Error::Decode(_, _))));

    // Short header buffer.
    assert!(matches!(FrameHeader::parse(&[0; 10]), Err(Error::Decode(_, _))));
}

#[test]
fn test_notification_is_not_a_response() {
    assert!(Response::decode(Command::Notification, &[0; 8]).is_err());
    assert!(Request::decode(Command::Notification, &[0; 8]).is_err());
}
