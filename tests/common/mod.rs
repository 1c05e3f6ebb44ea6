//! In-process fake Tuya device used by the session tests.

use localtuya::crypto::TuyaCipher;
use localtuya::protocol::{CommandType, HEADER_LEN, PROTOCOL_33_HEADER, TuyaMessage, pack_message};
use localtuya::{DeviceBuilder, Version};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};

pub const DEVICE_ID: &str = "bf0123456789abcdef01";
pub const LOCAL_KEY: &str = "0123456789abcdef";
pub const SENTINEL: &[u8] = b"json obj data unvalid";

/// A frame as sent by the client (no return code).
#[derive(Debug)]
pub struct Request {
    pub seqno: u32,
    pub cmd: u32,
    pub payload: Vec<u8>,
}

pub fn cipher() -> TuyaCipher {
    TuyaCipher::new(LOCAL_KEY.as_bytes()).unwrap()
}

pub fn builder(version: Version) -> DeviceBuilder {
    DeviceBuilder::new(DEVICE_ID, LOCAL_KEY).version(version)
}

/// Connected client/device pair over an in-memory pipe.
pub fn pipe() -> (DuplexStream, DuplexStream) {
    let _ = env_logger::builder().is_test(true).try_init();
    tokio::io::duplex(64 * 1024)
}

pub async fn read_request<R: AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<Request> {
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header).await?;
    let word = |i: usize| u32::from_be_bytes([header[i], header[i + 1], header[i + 2], header[i + 3]]);
    assert_eq!(word(0), 0x000055AA, "bad prefix");
    let (seqno, cmd, len) = (word(4), word(8), word(12) as usize);

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    assert_eq!(&body[len - 4..], &[0x00, 0x00, 0xAA, 0x55], "bad suffix");
    body.truncate(len - 8);
    Ok(Request { seqno, cmd, payload: body })
}

/// Next request that is not a heartbeat.
pub async fn next_request<R: AsyncRead + Unpin>(reader: &mut R) -> Request {
    loop {
        let req = read_request(reader).await.expect("read request");
        if req.cmd != CommandType::HeartBeat as u32 {
            return req;
        }
    }
}

/// Decode the JSON body of a client request.
pub fn decode_request(version: Version, req: &Request) -> Value {
    let c = cipher();
    let plain = match version {
        Version::V3_3 => {
            let body = req
                .payload
                .strip_prefix(&PROTOCOL_33_HEADER[..])
                .unwrap_or(&req.payload);
            c.decrypt(body, false).unwrap()
        }
        Version::V3_1 => match req.payload.strip_prefix(b"3.1") {
            Some(rest) => c.decrypt(&rest[16..], true).unwrap(),
            None => req.payload.clone(),
        },
    };
    serde_json::from_slice(&plain).unwrap()
}

/// Frame a device response (receive layout, return code 0).
pub fn response(seqno: u32, cmd: u32, payload: Vec<u8>) -> Vec<u8> {
    let mut msg = TuyaMessage::new(seqno, cmd, payload);
    msg.retcode = Some(0);
    pack_message(&msg).unwrap()
}

/// Encrypted v3.3 response with the protocol header.
pub fn v33_response(seqno: u32, cmd: u32, json: &Value) -> Vec<u8> {
    let payload = cipher().encode_payload(
        Version::V3_3,
        CommandType::Control as u32,
        json.to_string().as_bytes(),
    );
    response(seqno, cmd, payload)
}

/// Encrypted v3.3 answer carrying the wrong-device-type sentinel.
pub fn sentinel_response(seqno: u32, cmd: u32) -> Vec<u8> {
    let payload = cipher().encode_payload(Version::V3_3, CommandType::DpQuery as u32, SENTINEL);
    response(seqno, cmd, payload)
}

pub async fn send<W: AsyncWrite + Unpin>(writer: &mut W, frame: &[u8]) {
    writer.write_all(frame).await.unwrap();
    writer.flush().await.unwrap();
}
