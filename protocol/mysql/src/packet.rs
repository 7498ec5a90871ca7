// Copyright 2022 SphereEx Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{
    err::ProtocolError,
    mysql_const::{COM_PING, COM_QUIT, ERR_HEADER, HEADER_LEN, MAX_PAYLOAD_LEN},
    util::get_length,
};

/// One wire packet: sequence byte plus payload. The length is implicit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub seq: u8,
    pub payload: BytesMut,
}

impl Packet {
    /// A payload of exactly 16MiB-1 bytes announces a continuation packet.
    #[inline]
    pub fn is_fragment(&self) -> bool {
        self.payload.len() == MAX_PAYLOAD_LEN
    }
}

/// Splits a byte stream into wire packets. Packets come out one at a time
/// and exactly as they appeared on the wire; merging continuation fragments
/// is left to the consumer, which can ask `is_continuation_tail` whether the
/// packet it just received only carries the tail of an oversized payload.
#[derive(Debug, Default)]
pub struct PacketCodec {
    seq: u8,
    prev_was_max: bool,
    tail: bool,
}

impl PacketCodec {
    pub fn new() -> Self {
        PacketCodec::default()
    }

    /// Whether the most recently decoded packet continues the payload of the
    /// packet before it. Continuation interiors are raw data and need no
    /// classification.
    #[inline]
    pub fn is_continuation_tail(&self) -> bool {
        self.tail
    }

    fn put_header(dst: &mut BytesMut, len: usize, seq: u8) {
        dst.put_u8(len as u8);
        dst.put_u8((len >> 8) as u8);
        dst.put_u8((len >> 16) as u8);
        dst.put_u8(seq);
    }
}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let length = get_length(src);
        if src.len() < HEADER_LEN + length {
            return Ok(None);
        }

        let mut frame = src.split_to(HEADER_LEN + length);
        let seq = frame[3];
        let payload = frame.split_off(HEADER_LEN);

        self.seq = seq.wrapping_add(1);
        self.tail = self.prev_was_max;
        self.prev_was_max = length == MAX_PAYLOAD_LEN;

        Ok(Some(Packet { seq, payload }))
    }
}

/// Frames an outgoing payload, splitting anything of 16MiB-1 bytes or more
/// across continuation packets with consecutive sequence numbers.
impl Encoder<(u8, &[u8])> for PacketCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: (u8, &[u8]), dst: &mut BytesMut) -> Result<(), Self::Error> {
        let (mut seq, mut payload) = item;
        dst.reserve(payload.len() + HEADER_LEN);

        while payload.len() >= MAX_PAYLOAD_LEN {
            Self::put_header(dst, MAX_PAYLOAD_LEN, seq);
            dst.extend_from_slice(&payload[..MAX_PAYLOAD_LEN]);
            payload = &payload[MAX_PAYLOAD_LEN..];
            seq = seq.wrapping_add(1);
        }

        Self::put_header(dst, payload.len(), seq);
        dst.extend_from_slice(payload);
        self.seq = seq.wrapping_add(1);
        Ok(())
    }
}

/// COM_QUIT is always the same five bytes apart from the sequence.
pub fn com_quit_packet(seq: u8) -> BytesMut {
    let mut buf = BytesMut::with_capacity(5);
    buf.extend_from_slice(&[0x01, 0x00, 0x00, seq, COM_QUIT]);
    buf
}

/// A COM_PING whose reply the connection consumes itself, used to keep idle
/// pooled connections warm.
pub fn ping_packet() -> BytesMut {
    let mut buf = BytesMut::with_capacity(5);
    buf.extend_from_slice(&[0x01, 0x00, 0x00, 0x00, COM_PING]);
    buf
}

/// Build an ERR packet the gateway fabricates itself, for faults the server
/// never got to report (lost connections, protocol violations).
pub fn error_packet(seq: u8, code: u16, sqlstate: &str, msg: &str) -> BytesMut {
    debug_assert_eq!(sqlstate.len(), 5);

    let payload_len = 1 + 2 + 1 + 5 + msg.len();
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload_len);

    PacketCodec::put_header(&mut buf, payload_len, seq);
    buf.put_u8(ERR_HEADER);
    buf.put_u16_le(code);
    buf.put_u8(b'#');
    buf.put_slice(sqlstate.as_bytes());
    buf.put_slice(msg.as_bytes());
    buf
}

/// Build a command packet with sequence 0, the framing every fresh client
/// command uses.
pub fn command_packet(cmd: u8, body: &[u8]) -> BytesMut {
    let length = body.len() + 1;
    let mut buf = BytesMut::with_capacity(HEADER_LEN + length);
    PacketCodec::put_header(&mut buf, length, 0);
    buf.put_u8(cmd);
    buf.extend_from_slice(body);
    buf
}
