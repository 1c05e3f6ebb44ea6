//! Tuya wire protocol implementation.
//! Handles packet framing, header parsing, and CRC calculation for the 0x55AA envelope.

use crate::error::{Result, TuyaError};
use byteorder::{BigEndian, ByteOrder, ReadBytesExt, WriteBytesExt};
use crc::{CRC_32_ISO_HDLC, Crc};
use std::io::Cursor;

pub const PREFIX_55AA: u32 = 0x000055AA;
pub const SUFFIX_55AA: u32 = 0x0000AA55;

/// Send header: Prefix(4), Seq(4), Cmd(4), Len(4)
pub const HEADER_LEN: usize = 16;
/// Receive header: send header + Retcode(4)
pub const RECV_HEADER_LEN: usize = 20;
/// Trailer: CRC(4), Suffix(4)
pub const TRAILER_LEN: usize = 8;
/// Smallest legal length field of a received frame (retcode + trailer)
pub const MIN_RECV_LEN: u32 = 12;
/// Upper bound for the length field; anything larger is treated as garbage
pub const MAX_FRAME_LEN: u32 = 0x10000;

/// v3.3 protocol header: version tag followed by 12 zero bytes.
pub const PROTOCOL_33_HEADER: [u8; 15] = *b"3.3\0\0\0\0\0\0\0\0\0\0\0\0";
/// Length of the MD5 signature slice following the v3.1 tag
pub const SIGNATURE_LEN: usize = 16;

define_command_type! {
    Control = 0x07,
    Status = 0x08,
    HeartBeat = 0x09,
    DpQuery = 0x0a,
    ControlNew = 0x0d,
}

define_version! {
    V3_1 = ("3.1", 3.1),
    V3_3 = ("3.3", 3.3),
}

/// Payload convention spoken by a device.
///
/// `TypeA` devices answer a 0x0A query with every datapoint. `TypeD` devices
/// reject that query with "data unvalid" and only report the datapoints listed
/// (with null values) in a 0x0D query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DeviceType {
    #[default]
    TypeA,
    TypeD,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::TypeA => "type_0a",
            DeviceType::TypeD => "type_0d",
        }
    }
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Logical request kinds issued by a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Status,
    Set,
    HeartBeat,
}

impl Command {
    /// Wire command used for this request by the given device type.
    pub fn command_type(self, dev_type: DeviceType) -> CommandType {
        match (self, dev_type) {
            (Command::Status, DeviceType::TypeA) => CommandType::DpQuery,
            (Command::Status, DeviceType::TypeD) => CommandType::ControlNew,
            (Command::Set, _) => CommandType::Control,
            (Command::HeartBeat, _) => CommandType::HeartBeat,
        }
    }
}

/// Tuya protocol message structure
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TuyaMessage {
    /// Sequence number
    pub seqno: u32,
    /// Command code
    pub cmd: u32,
    /// Return code (present on frames received from a device)
    pub retcode: Option<u32>,
    /// Payload as carried on the wire (possibly encrypted)
    pub payload: Vec<u8>,
    /// CRC32 from the trailer. Informational; never enforced.
    pub crc: u32,
}

impl TuyaMessage {
    pub fn new(seqno: u32, cmd: u32, payload: Vec<u8>) -> Self {
        Self {
            seqno,
            cmd,
            payload,
            ..Default::default()
        }
    }

    pub fn command_type(&self) -> Option<CommandType> {
        CommandType::from_u32(self.cmd)
    }
}

/// Receive header of a 0x55AA frame
#[derive(Debug, Clone)]
pub struct TuyaHeader {
    pub prefix: u32,
    pub seqno: u32,
    pub cmd: u32,
    /// Length field: retcode + payload + CRC + suffix
    pub payload_len: u32,
    pub retcode: u32,
    /// Total frame length (header + length field)
    pub total_length: usize,
}

fn crc32(data: &[u8]) -> u32 {
    Crc::<u32>::new(&CRC_32_ISO_HDLC).checksum(data)
}

/// Pack TuyaMessage into binary data.
///
/// The return code is written only when the message carries one, so outgoing
/// requests use the 4-field header and device-shaped messages the 5-field one.
pub fn pack_message(msg: &TuyaMessage) -> Result<Vec<u8>> {
    let retcode_len = if msg.retcode.is_some() { 4 } else { 0 };
    let payload_len = msg.payload.len() + retcode_len + TRAILER_LEN;
    let mut data = Vec::with_capacity(HEADER_LEN + payload_len);

    data.write_u32::<BigEndian>(PREFIX_55AA)?;
    data.write_u32::<BigEndian>(msg.seqno)?;
    data.write_u32::<BigEndian>(msg.cmd)?;
    data.write_u32::<BigEndian>(payload_len as u32)?;
    if let Some(rc) = msg.retcode {
        data.write_u32::<BigEndian>(rc)?;
    }
    data.extend_from_slice(&msg.payload);

    let crc_val = crc32(&data);
    data.write_u32::<BigEndian>(crc_val)?;
    data.write_u32::<BigEndian>(SUFFIX_55AA)?;

    Ok(data)
}

/// Parse the 5-field receive header from the start of `data`.
pub fn parse_header(data: &[u8]) -> Result<TuyaHeader> {
    if data.len() < RECV_HEADER_LEN {
        return Err(TuyaError::Framing(format!(
            "Header too short ({} bytes)",
            data.len()
        )));
    }

    let mut cursor = Cursor::new(data);
    let prefix = cursor.read_u32::<BigEndian>()?;
    if prefix != PREFIX_55AA {
        return Err(TuyaError::InvalidHeader);
    }
    let seqno = cursor.read_u32::<BigEndian>()?;
    let cmd = cursor.read_u32::<BigEndian>()?;
    let payload_len = cursor.read_u32::<BigEndian>()?;
    let retcode = cursor.read_u32::<BigEndian>()?;

    if !(MIN_RECV_LEN..=MAX_FRAME_LEN).contains(&payload_len) {
        return Err(TuyaError::Framing(format!(
            "Length field {} out of range",
            payload_len
        )));
    }

    Ok(TuyaHeader {
        prefix,
        seqno,
        cmd,
        payload_len,
        retcode,
        total_length: HEADER_LEN + payload_len as usize,
    })
}

/// Unpack exactly one received frame into a TuyaMessage.
///
/// The checksum is copied into the message but not verified; see
/// [`verify_checksum`].
pub fn unpack_message(data: &[u8]) -> Result<TuyaMessage> {
    let header = parse_header(data)?;

    if data.len() != header.total_length {
        return Err(TuyaError::Framing(format!(
            "Length field says {} bytes, got {}",
            header.total_length,
            data.len()
        )));
    }

    let payload_end = header.total_length - TRAILER_LEN;
    let payload = data[RECV_HEADER_LEN..payload_end].to_vec();
    let crc = BigEndian::read_u32(&data[payload_end..payload_end + 4]);

    Ok(TuyaMessage {
        seqno: header.seqno,
        cmd: header.cmd,
        retcode: Some(header.retcode),
        payload,
        crc,
    })
}

/// Recompute the CRC32 of a complete frame and compare it with its trailer.
pub fn verify_checksum(frame: &[u8]) -> Result<bool> {
    if frame.len() < HEADER_LEN + TRAILER_LEN {
        return Err(TuyaError::Framing("Frame too short".into()));
    }
    let payload_end = frame.len() - TRAILER_LEN;
    let received = BigEndian::read_u32(&frame[payload_end..payload_end + 4]);
    Ok(crc32(&frame[..payload_end]) == received)
}
