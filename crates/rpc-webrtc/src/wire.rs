use std::time::Duration;

use bytes::Bytes;

use crate::status::{Code, Metadata, Status};

pub const PROTOCOL_VERSION: u8 = 1;

/// Largest payload a single data channel message may carry.
pub const MAX_DATA_CHANNEL_MESSAGE: usize = 65_535;
/// Room reserved for the frame header, stream id and packet flags.
pub const FRAMING_OVERHEAD: usize = 64;
pub const MAX_PACKET_DATA: usize = MAX_DATA_CHANNEL_MESSAGE - FRAMING_OVERHEAD;

const VERSION_BITS: u8 = 3;
const VERSION_MASK: u8 = 0b1110_0000;
const TYPE_MASK: u8 = 0b0001_1111;

const REQUEST_KIND_HEADERS: u8 = 0;
const REQUEST_KIND_MESSAGE: u8 = 1;
const REQUEST_KIND_RST_STREAM: u8 = 2;

const RESPONSE_KIND_HEADERS: u8 = 0;
const RESPONSE_KIND_MESSAGE: u8 = 1;
const RESPONSE_KIND_TRAILERS: u8 = 2;

const FLAG_HAS_MESSAGE: u8 = 0b001;
const FLAG_EOM: u8 = 0b010;
const FLAG_EOS: u8 = 0b100;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum WireError {
    #[error("invalid protocol version: {0}")]
    InvalidVersion(u8),
    #[error("unknown frame type: {0}")]
    UnknownFrameType(u8),
    #[error("unexpected end of input")]
    UnexpectedEof,
    #[error("varint overflow")]
    VarIntOverflow,
    #[error("invalid data: {0}")]
    InvalidData(&'static str),
}

/// One fragment of a logical message.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PacketMessage {
    pub data: Bytes,
    pub eom: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHeaders {
    pub method: String,
    pub metadata: Metadata,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RequestMessage {
    pub has_message: bool,
    pub packet: PacketMessage,
    pub eos: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestKind {
    Headers(RequestHeaders),
    Message(RequestMessage),
    RstStream,
}

/// Frame sent from the calling side to the serving side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub stream_id: u64,
    pub kind: RequestKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseKind {
    Headers { metadata: Metadata },
    Message { packet: PacketMessage },
    Trailers { status: Status, metadata: Metadata },
}

/// Frame sent from the serving side back to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub stream_id: u64,
    pub kind: ResponseKind,
}

impl Request {
    pub fn headers(stream_id: u64, headers: RequestHeaders) -> Self {
        Self {
            stream_id,
            kind: RequestKind::Headers(headers),
        }
    }

    pub fn message(stream_id: u64, message: RequestMessage) -> Self {
        Self {
            stream_id,
            kind: RequestKind::Message(message),
        }
    }

    pub fn rst_stream(stream_id: u64) -> Self {
        Self {
            stream_id,
            kind: RequestKind::RstStream,
        }
    }
}

impl Response {
    pub fn trailers(stream_id: u64, status: Status) -> Self {
        Self {
            stream_id,
            kind: ResponseKind::Trailers {
                status,
                metadata: Metadata::new(),
            },
        }
    }
}

pub fn encode_request(frame: &Request) -> Bytes {
    let mut buf = Vec::with_capacity(frame_capacity_hint(match &frame.kind {
        RequestKind::Message(message) => message.packet.data.len(),
        _ => 0,
    }));
    match &frame.kind {
        RequestKind::Headers(headers) => {
            write_header(&mut buf, REQUEST_KIND_HEADERS);
            write_var_u64(&mut buf, frame.stream_id);
            write_string(&mut buf, &headers.method);
            encode_metadata(&mut buf, &headers.metadata);
            match headers.timeout {
                Some(timeout) => {
                    buf.push(1);
                    write_var_u64(&mut buf, timeout.as_millis().min(u64::MAX as u128) as u64);
                }
                None => buf.push(0),
            }
        }
        RequestKind::Message(message) => {
            write_header(&mut buf, REQUEST_KIND_MESSAGE);
            write_var_u64(&mut buf, frame.stream_id);
            let mut flags = 0;
            if message.has_message {
                flags |= FLAG_HAS_MESSAGE;
            }
            if message.packet.eom {
                flags |= FLAG_EOM;
            }
            if message.eos {
                flags |= FLAG_EOS;
            }
            buf.push(flags);
            write_blob(&mut buf, &message.packet.data);
        }
        RequestKind::RstStream => {
            write_header(&mut buf, REQUEST_KIND_RST_STREAM);
            write_var_u64(&mut buf, frame.stream_id);
        }
    }
    Bytes::from(buf)
}

pub fn decode_request(bytes: &[u8]) -> Result<Request, WireError> {
    let mut cursor = Cursor::new(bytes);
    let kind = read_header(&mut cursor)?;
    let stream_id = cursor.read_var_u64()?;
    let kind = match kind {
        REQUEST_KIND_HEADERS => {
            let method = cursor.read_string()?;
            let metadata = decode_metadata(&mut cursor)?;
            let timeout = if cursor.read_bool()? {
                Some(Duration::from_millis(cursor.read_var_u64()?))
            } else {
                None
            };
            RequestKind::Headers(RequestHeaders {
                method,
                metadata,
                timeout,
            })
        }
        REQUEST_KIND_MESSAGE => {
            let flags = cursor.read_u8()?;
            if flags & !(FLAG_HAS_MESSAGE | FLAG_EOM | FLAG_EOS) != 0 {
                return Err(WireError::InvalidData("unknown message flags"));
            }
            let data = cursor.read_blob()?;
            RequestKind::Message(RequestMessage {
                has_message: flags & FLAG_HAS_MESSAGE != 0,
                packet: PacketMessage {
                    data,
                    eom: flags & FLAG_EOM != 0,
                },
                eos: flags & FLAG_EOS != 0,
            })
        }
        REQUEST_KIND_RST_STREAM => RequestKind::RstStream,
        other => return Err(WireError::UnknownFrameType(other)),
    };
    cursor.finish()?;
    Ok(Request { stream_id, kind })
}

pub fn encode_response(frame: &Response) -> Bytes {
    let mut buf = Vec::with_capacity(frame_capacity_hint(match &frame.kind {
        ResponseKind::Message { packet } => packet.data.len(),
        _ => 0,
    }));
    match &frame.kind {
        ResponseKind::Headers { metadata } => {
            write_header(&mut buf, RESPONSE_KIND_HEADERS);
            write_var_u64(&mut buf, frame.stream_id);
            encode_metadata(&mut buf, metadata);
        }
        ResponseKind::Message { packet } => {
            write_header(&mut buf, RESPONSE_KIND_MESSAGE);
            write_var_u64(&mut buf, frame.stream_id);
            buf.push(if packet.eom { FLAG_EOM } else { 0 });
            write_blob(&mut buf, &packet.data);
        }
        ResponseKind::Trailers { status, metadata } => {
            write_header(&mut buf, RESPONSE_KIND_TRAILERS);
            write_var_u64(&mut buf, frame.stream_id);
            encode_status(&mut buf, status);
            encode_metadata(&mut buf, metadata);
        }
    }
    Bytes::from(buf)
}

pub fn decode_response(bytes: &[u8]) -> Result<Response, WireError> {
    let mut cursor = Cursor::new(bytes);
    let kind = read_header(&mut cursor)?;
    let stream_id = cursor.read_var_u64()?;
    let kind = match kind {
        RESPONSE_KIND_HEADERS => ResponseKind::Headers {
            metadata: decode_metadata(&mut cursor)?,
        },
        RESPONSE_KIND_MESSAGE => {
            let flags = cursor.read_u8()?;
            if flags & !FLAG_EOM != 0 {
                return Err(WireError::InvalidData("unknown message flags"));
            }
            let data = cursor.read_blob()?;
            ResponseKind::Message {
                packet: PacketMessage {
                    data,
                    eom: flags & FLAG_EOM != 0,
                },
            }
        }
        RESPONSE_KIND_TRAILERS => {
            let status = decode_status(&mut cursor)?;
            let metadata = decode_metadata(&mut cursor)?;
            ResponseKind::Trailers { status, metadata }
        }
        other => return Err(WireError::UnknownFrameType(other)),
    };
    cursor.finish()?;
    Ok(Response { stream_id, kind })
}

fn frame_capacity_hint(payload: usize) -> usize {
    payload + 16
}

fn encode_metadata(buf: &mut Vec<u8>, metadata: &Metadata) {
    write_var_u64(buf, metadata.len() as u64);
    for (key, values) in metadata.iter() {
        write_string(buf, key);
        write_var_u64(buf, values.len() as u64);
        for value in values {
            write_string(buf, value);
        }
    }
}

fn decode_metadata(cursor: &mut Cursor<'_>) -> Result<Metadata, WireError> {
    let keys = cursor.read_len()?;
    let mut metadata = Metadata::new();
    for _ in 0..keys {
        let key = cursor.read_string()?;
        let values = cursor.read_len()?;
        for _ in 0..values {
            let value = cursor.read_string()?;
            metadata.append(&key, value);
        }
    }
    Ok(metadata)
}

fn encode_status(buf: &mut Vec<u8>, status: &Status) {
    buf.push(status.code as u8);
    write_string(buf, &status.message);
    write_var_u64(buf, status.details.len() as u64);
    for detail in &status.details {
        write_blob(buf, detail);
    }
}

fn decode_status(cursor: &mut Cursor<'_>) -> Result<Status, WireError> {
    let code = Code::from_u8(cursor.read_u8()?);
    let message = cursor.read_string()?;
    let count = cursor.read_len()?;
    let mut details = Vec::with_capacity(count.min(16));
    for _ in 0..count {
        details.push(cursor.read_blob()?);
    }
    Ok(Status {
        code,
        message,
        details,
    })
}

fn write_header(buf: &mut Vec<u8>, kind: u8) {
    let version = PROTOCOL_VERSION & ((1 << VERSION_BITS) - 1);
    buf.push((version << 5) | (kind & TYPE_MASK));
}

fn read_header(cursor: &mut Cursor<'_>) -> Result<u8, WireError> {
    let byte = cursor.read_u8()?;
    let version = (byte & VERSION_MASK) >> 5;
    if version != (PROTOCOL_VERSION & ((1 << VERSION_BITS) - 1)) {
        return Err(WireError::InvalidVersion(version));
    }
    Ok(byte & TYPE_MASK)
}

fn write_var_u64(buf: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        buf.push((value as u8) | 0x80);
        value >>= 7;
    }
    buf.push(value as u8);
}

fn write_blob(buf: &mut Vec<u8>, data: &[u8]) {
    write_var_u64(buf, data.len() as u64);
    buf.extend_from_slice(data);
}

fn write_string(buf: &mut Vec<u8>, value: &str) {
    write_blob(buf, value.as_bytes());
}

#[derive(Clone, Copy)]
struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn read_u8(&mut self) -> Result<u8, WireError> {
        if self.pos >= self.bytes.len() {
            return Err(WireError::UnexpectedEof);
        }
        let value = self.bytes[self.pos];
        self.pos += 1;
        Ok(value)
    }

    fn read_var_u64(&mut self) -> Result<u64, WireError> {
        let mut result: u64 = 0;
        let mut shift = 0;
        while shift < 64 {
            let byte = self.read_u8()?;
            result |= ((byte & 0x7F) as u64) << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
        }
        Err(WireError::VarIntOverflow)
    }

    /// Reads a length prefix and rejects values that cannot fit in the rest of the frame.
    fn read_len(&mut self) -> Result<usize, WireError> {
        let len = self.read_var_u64()?;
        if len > self.remaining() as u64 {
            return Err(WireError::UnexpectedEof);
        }
        Ok(len as usize)
    }

    fn read_bool(&mut self) -> Result<bool, WireError> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(WireError::InvalidData("invalid boolean")),
        }
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], WireError> {
        if self.pos + len > self.bytes.len() {
            return Err(WireError::UnexpectedEof);
        }
        let slice = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn read_blob(&mut self) -> Result<Bytes, WireError> {
        let len = self.read_len()?;
        Ok(Bytes::copy_from_slice(self.read_bytes(len)?))
    }

    fn read_string(&mut self) -> Result<String, WireError> {
        let len = self.read_len()?;
        let raw = self.read_bytes(len)?;
        std::str::from_utf8(raw)
            .map(str::to_owned)
            .map_err(|_| WireError::InvalidData("invalid utf-8"))
    }

    fn remaining(&self) -> usize {
        self.bytes.len().saturating_sub(self.pos)
    }

    fn finish(&self) -> Result<(), WireError> {
        if self.remaining() != 0 {
            return Err(WireError::InvalidData("trailing bytes"));
        }
        Ok(())
    }
}
