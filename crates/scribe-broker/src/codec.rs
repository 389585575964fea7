//! Binary packet framing.
//!
//! Every packet is a 12-byte header — 4-byte magic (`\0REQ` from clients and
//! workers, `\0RES` from the broker), big-endian packet type, big-endian body
//! length — followed by the body. Bodies are NUL-separated arguments; the
//! last argument is raw and may itself contain NULs. [`PacketCodec`] frames
//! the wire as a tokio-util codec.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::BrokerError;

pub const MAGIC_REQ: [u8; 4] = [0, b'R', b'E', b'Q'];
pub const MAGIC_RES: [u8; 4] = [0, b'R', b'E', b'S'];

const HEADER_LEN: usize = 12;
/// Upper bound on a packet body; recordings stream in well below this.
const MAX_BODY: u32 = 256 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PacketType {
    CanDo = 1,
    PreSleep = 4,
    Noop = 6,
    SubmitJob = 7,
    JobCreated = 8,
    GrabJob = 9,
    NoJob = 10,
    JobAssign = 11,
    WorkComplete = 13,
    WorkFail = 14,
    EchoReq = 16,
    EchoRes = 17,
}

impl PacketType {
    pub fn from_u32(value: u32) -> Option<Self> {
        Some(match value {
            1 => PacketType::CanDo,
            4 => PacketType::PreSleep,
            6 => PacketType::Noop,
            7 => PacketType::SubmitJob,
            8 => PacketType::JobCreated,
            9 => PacketType::GrabJob,
            10 => PacketType::NoJob,
            11 => PacketType::JobAssign,
            13 => PacketType::WorkComplete,
            14 => PacketType::WorkFail,
            16 => PacketType::EchoReq,
            17 => PacketType::EchoRes,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub request: bool,
    pub kind: PacketType,
    pub body: Vec<u8>,
}

impl Packet {
    pub fn request(kind: PacketType, body: Vec<u8>) -> Self {
        Packet {
            request: true,
            kind,
            body,
        }
    }

    pub fn response(kind: PacketType, body: Vec<u8>) -> Self {
        Packet {
            request: false,
            kind,
            body,
        }
    }

    /// Build a body from NUL-separated arguments; the last one is raw.
    pub fn body_from_args(args: &[&[u8]]) -> Vec<u8> {
        let size = args.iter().map(|a| a.len()).sum::<usize>() + args.len().saturating_sub(1);
        let mut body = Vec::with_capacity(size);
        for (idx, arg) in args.iter().enumerate() {
            if idx > 0 {
                body.push(0);
            }
            body.extend_from_slice(arg);
        }
        body
    }

    /// Split the body into `n` arguments. The last argument takes the rest
    /// of the body, NULs included.
    pub fn args(&self, n: usize) -> Result<Vec<&[u8]>, BrokerError> {
        let mut out = Vec::with_capacity(n);
        let mut rest: &[u8] = &self.body;
        for _ in 0..n.saturating_sub(1) {
            let pos = rest
                .iter()
                .position(|b| *b == 0)
                .ok_or_else(|| BrokerError::Protocol(format!("{:?}: short body", self.kind)))?;
            out.push(&rest[..pos]);
            rest = &rest[pos + 1..];
        }
        if n > 0 {
            out.push(rest);
        }
        Ok(out)
    }
}

#[derive(Debug, Default)]
pub struct PacketCodec;

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = BrokerError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>, BrokerError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let request = match &src[..4] {
            m if m == MAGIC_REQ.as_slice() => true,
            m if m == MAGIC_RES.as_slice() => false,
            m => return Err(BrokerError::Protocol(format!("bad magic {m:?}"))),
        };
        let kind_raw = u32::from_be_bytes(src[4..8].try_into().expect("header slice"));
        let kind = PacketType::from_u32(kind_raw)
            .ok_or_else(|| BrokerError::Protocol(format!("unknown packet type {kind_raw}")))?;
        let len = u32::from_be_bytes(src[8..12].try_into().expect("header slice"));
        if len > MAX_BODY {
            return Err(BrokerError::Protocol(format!("oversized body ({len})")));
        }

        let len = len as usize;
        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let body = src.split_to(len).to_vec();
        Ok(Some(Packet {
            request,
            kind,
            body,
        }))
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = BrokerError;

    fn encode(&mut self, packet: Packet, dst: &mut BytesMut) -> Result<(), BrokerError> {
        dst.reserve(HEADER_LEN + packet.body.len());
        dst.put_slice(if packet.request { &MAGIC_REQ } else { &MAGIC_RES });
        dst.put_u32(packet.kind as u32);
        dst.put_u32(packet.body.len() as u32);
        dst.put_slice(&packet.body);
        Ok(())
    }
}
