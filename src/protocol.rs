// Copyright 2020 Joyent, Inc.

//! Frame codec for the socket transport.
//!
//! Protocol messages have the following structure:
//!
//! * VERSION   1-byte integer.  The only supported value is "1".
//!
//! * KIND      1-byte integer.  `Request` (0x1) or `Response` (0x2).
//!
//! * STATUS    1-byte integer.  The supported values are:
//!
//!     * STATUS_DATA  0x1  the payload is a marshalled message
//!
//!     * STATUS_BUSY  0x2  the server had no worker available for the request
//!
//!     * STATUS_ERROR 0x3  the payload is a UTF-8 error description
//!
//! * MSGID1...MSGID4    4-byte big-endian unsigned integer, a unique identifier
//!                    for this message
//!
//! * CRC1...CRC4        4-byte big-endian unsigned integer representing the CRC16
//!                     value of the data payload
//!
//! * DLEN0...DLEN4      4-byte big-endian unsigned integer representing the number
//!                    of bytes of data payload that follow
//!
//! * DATA0...DATAN      Data payload, encoded by the marshaller selected for the
//!                    connection.
//!
//! Message IDs are scoped to a connection and allocated sequentially from a
//! circular 31-bit space.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::time::{Duration, Instant};

use byteorder::{BigEndian, ByteOrder};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc16::{State, ARC};
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::{FromPrimitive, ToPrimitive};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{RemotingError, Result};

const FP_MSGID_MAX: u32 = i32::max_value() as u32;

const FP_OFF_KIND: usize = 0x1;
const FP_OFF_STATUS: usize = 0x2;
const FP_OFF_MSGID: usize = 0x3;
const FP_OFF_CRC: usize = 0x7;
const FP_OFF_DATALEN: usize = 0xb;
const FP_OFF_DATA: usize = 0xf;

pub const FP_HEADER_SZ: usize = FP_OFF_DATA;

const FP_VERSION_1: u8 = 0x1;
const FP_VERSION_CURRENT: u8 = FP_VERSION_1;

pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum FrameKind {
    Request = 1,
    Response = 2,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum FrameStatus {
    Data = 1,
    Busy = 2,
    Error = 3,
}

/// Circular 31-bit message id allocator, one per connection.
#[derive(Debug)]
pub struct MessageId(u32);

impl MessageId {
    pub fn new() -> MessageId {
        MessageId(rand::random::<u32>() % FP_MSGID_MAX)
    }

    pub fn next_id(&mut self) -> u32 {
        let id = self.0;
        self.0 = (self.0 + 1) % FP_MSGID_MAX;
        id
    }
}

impl Default for MessageId {
    fn default() -> MessageId {
        MessageId::new()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    pub kind: FrameKind,
    pub status: FrameStatus,
    pub id: u32,
    pub data: Bytes,
}

impl Frame {
    pub fn request(id: u32, data: Bytes) -> Frame {
        Frame {
            kind: FrameKind::Request,
            status: FrameStatus::Data,
            id,
            data,
        }
    }

    pub fn response(id: u32, data: Bytes) -> Frame {
        Frame {
            kind: FrameKind::Response,
            status: FrameStatus::Data,
            id,
            data,
        }
    }

    pub fn busy(id: u32) -> Frame {
        Frame {
            kind: FrameKind::Response,
            status: FrameStatus::Busy,
            id,
            data: Bytes::new(),
        }
    }

    pub fn error(id: u32, message: &str) -> Frame {
        Frame {
            kind: FrameKind::Response,
            status: FrameStatus::Error,
            id,
            data: Bytes::copy_from_slice(message.as_bytes()),
        }
    }
}

struct FrameHeader {
    kind: FrameKind,
    status: FrameStatus,
    id: u32,
    crc: u32,
    data_len: usize,
}

fn parse_header(buf: &[u8]) -> Result<FrameHeader> {
    if buf[0] != FP_VERSION_CURRENT {
        let msg = format!("unsupported protocol version {}", buf[0]);
        return Err(RemotingError::Protocol(msg));
    }
    let kind = FromPrimitive::from_u8(buf[FP_OFF_KIND])
        .ok_or_else(|| RemotingError::Protocol(String::from("failed to parse frame kind")))?;
    let status = FromPrimitive::from_u8(buf[FP_OFF_STATUS])
        .ok_or_else(|| RemotingError::Protocol(String::from("failed to parse frame status")))?;
    let id = BigEndian::read_u32(&buf[FP_OFF_MSGID..FP_OFF_MSGID + 4]);
    let crc = BigEndian::read_u32(&buf[FP_OFF_CRC..FP_OFF_CRC + 4]);
    let data_len = BigEndian::read_u32(&buf[FP_OFF_DATALEN..FP_OFF_DATALEN + 4]) as usize;

    Ok(FrameHeader {
        kind,
        status,
        id,
        crc,
        data_len,
    })
}

fn checksum(data: &[u8]) -> u32 {
    u32::from(State::<ARC>::calculate(data))
}

pub struct RemotingCodec {
    max_frame_size: usize,
}

impl RemotingCodec {
    pub fn new(max_frame_size: usize) -> RemotingCodec {
        RemotingCodec { max_frame_size }
    }
}

impl Default for RemotingCodec {
    fn default() -> RemotingCodec {
        RemotingCodec::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl Decoder for RemotingCodec {
    type Item = Frame;
    type Error = RemotingError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>> {
        if buf.len() < FP_HEADER_SZ {
            return Ok(None);
        }
        let header = parse_header(&buf[..FP_HEADER_SZ])?;
        if header.data_len > self.max_frame_size {
            let msg = format!(
                "frame of {} bytes exceeds maximum {}",
                header.data_len, self.max_frame_size
            );
            return Err(RemotingError::Protocol(msg));
        }
        if buf.len() < FP_HEADER_SZ + header.data_len {
            buf.reserve(FP_HEADER_SZ + header.data_len - buf.len());
            return Ok(None);
        }

        buf.advance(FP_HEADER_SZ);
        let data = buf.split_to(header.data_len).freeze();
        if checksum(&data) != header.crc {
            let msg = format!("CRC mismatch on message {}", header.id);
            return Err(RemotingError::Protocol(msg));
        }

        Ok(Some(Frame {
            kind: header.kind,
            status: header.status,
            id: header.id,
            data,
        }))
    }
}

impl Encoder<Frame> for RemotingCodec {
    type Error = RemotingError;

    fn encode(&mut self, frame: Frame, buf: &mut BytesMut) -> Result<()> {
        if frame.data.len() > self.max_frame_size {
            let msg = format!(
                "frame of {} bytes exceeds maximum {}",
                frame.data.len(),
                self.max_frame_size
            );
            return Err(RemotingError::Protocol(msg));
        }
        let kind = ToPrimitive::to_u8(&frame.kind)
            .ok_or_else(|| RemotingError::Protocol(String::from("invalid frame kind")))?;
        let status = ToPrimitive::to_u8(&frame.status)
            .ok_or_else(|| RemotingError::Protocol(String::from("invalid frame status")))?;

        buf.reserve(FP_HEADER_SZ + frame.data.len());
        buf.put_u8(FP_VERSION_CURRENT);
        buf.put_u8(kind);
        buf.put_u8(status);
        buf.put_u32(frame.id);
        buf.put_u32(checksum(&frame.data));
        buf.put_u32(frame.data.len() as u32);
        buf.put_slice(&frame.data);
        Ok(())
    }
}

/// Blocking write of a single frame.
pub fn send(frame: Frame, codec: &mut RemotingCodec, stream: &mut TcpStream) -> Result<usize> {
    let mut write_buf = BytesMut::new();
    codec.encode(frame, &mut write_buf)?;
    stream.write_all(&write_buf)?;
    stream.flush()?;
    Ok(write_buf.len())
}

/// Blocking read of the next frame.  Bytes read past the end of the frame stay
/// in `read_buf` for the next call.  `timeout` bounds the whole frame, not
/// each socket read, so a peer trickling bytes cannot hold the caller.
pub fn receive(
    stream: &mut TcpStream,
    codec: &mut RemotingCodec,
    read_buf: &mut BytesMut,
    timeout: Duration,
) -> Result<Frame> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(frame) = codec.decode(read_buf)? {
            return Ok(frame);
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining == Duration::from_millis(0) {
            return Err(RemotingError::Timeout(timeout));
        }
        stream.set_read_timeout(Some(remaining))?;
        let mut chunk = [0; 8192];
        match stream.read(&mut chunk) {
            Ok(0) => {
                let msg = String::from("connection closed by peer");
                return Err(RemotingError::ConnectionFailed(msg));
            }
            Ok(byte_count) => read_buf.extend_from_slice(&chunk[0..byte_count]),
            Err(ref e)
                if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut =>
            {
                return Err(RemotingError::Timeout(timeout));
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => (),
            Err(e) => return Err(RemotingError::Io(e)),
        }
    }
}
