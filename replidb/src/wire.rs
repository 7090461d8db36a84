//! The fixed part of the node's wire protocol: the handshake preface every
//! stream must open with, and the frame envelope used to tell peer
//! replication streams apart from SQL clients.
//!
//! Only the `Connect` frame is materialized here. Every other frame kind
//! belongs to the per-connection protocol layer and is handed over raw.

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;

/// Protocol version sent as a little-endian u64 preface on every stream.
pub const PROTOCOL_VERSION: u64 = 1;

/// Frame kind carried by peer nodes right after the preface to identify
/// themselves before replication traffic starts.
pub const FRAME_CONNECT: u8 = 0x01;

/// Upper bound on a frame body accepted during demultiplexing, in 8-byte
/// words. A connect frame is tiny; anything larger is not ours to buffer.
pub const MAX_DEMUX_WORDS: u32 = 512;

const WORD: usize = 8;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("unsupported protocol version {0:#x}")]
    BadPreface(u64),
    #[error("frame body of {words} words exceeds the demultiplex limit")]
    Oversized { words: u32 },
    #[error("frame body is truncated")]
    Truncated,
    #[error("connect frame address is not valid UTF-8")]
    BadAddress,
}

/// Fixed 8-byte frame envelope: body length in 8-byte words, frame kind,
/// flags, and a kind-specific extra field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub words: u32,
    pub kind: u8,
    pub flags: u8,
    pub extra: u16,
}

impl Header {
    pub const SIZE: usize = 8;

    pub fn decode(raw: [u8; Self::SIZE]) -> Result<Self, FrameError> {
        let buf = &mut raw.as_slice();
        let header = Header {
            words: buf.get_u32_le(),
            kind: buf.get_u8(),
            flags: buf.get_u8(),
            extra: buf.get_u16_le(),
        };

        if header.words > MAX_DEMUX_WORDS {
            return Err(FrameError::Oversized { words: header.words });
        }

        Ok(header)
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.words);
        buf.put_u8(self.kind);
        buf.put_u8(self.flags);
        buf.put_u16_le(self.extra);
    }

    pub fn body_len(&self) -> usize {
        self.words as usize * WORD
    }
}

pub fn encode_preface(buf: &mut BytesMut) {
    buf.put_u64_le(PROTOCOL_VERSION);
}

pub fn check_preface(raw: [u8; WORD]) -> Result<(), FrameError> {
    let version = u64::from_le_bytes(raw);
    if version == PROTOCOL_VERSION {
        Ok(())
    } else {
        Err(FrameError::BadPreface(version))
    }
}

/// Encodes a complete connect frame (header included): the sender's
/// identity followed by its NUL-terminated address, padded to a word
/// boundary.
pub fn encode_connect(id: u64, address: &str, buf: &mut BytesMut) {
    let text_len = address.len() + 1; // trailing NUL
    let padded = text_len.div_ceil(WORD) * WORD;
    let words = (1 + padded / WORD) as u32; // id word + address words

    Header {
        words,
        kind: FRAME_CONNECT,
        flags: 0,
        extra: 0,
    }
    .encode(buf);

    buf.put_u64_le(id);
    buf.put_slice(address.as_bytes());
    buf.put_bytes(0, padded - address.len());
}

/// Decodes a connect frame body into the peer's identity and address.
pub fn decode_connect(body: &[u8]) -> Result<(u64, String), FrameError> {
    if body.len() < 2 * WORD {
        return Err(FrameError::Truncated);
    }

    let mut buf = body;
    let id = buf.get_u64_le();

    let text_end = buf.iter().position(|&b| b == 0).ok_or(FrameError::Truncated)?;
    let address = core::str::from_utf8(&buf[..text_end]).map_err(|_| FrameError::BadAddress)?;

    Ok((id, address.to_owned()))
}
