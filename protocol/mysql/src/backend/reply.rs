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

use std::{collections::HashMap, fmt};

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, error, warn};

use super::auth::BackendAuth;
use crate::{
    err::ProtocolError,
    mysql_const::*,
    session::{SessionState, TrxState},
    util::{get_length, BufExt},
};

pub const LAST_GTID: &str = "last_gtid";
pub const TRX_CHARACTERISTICS: &str = "trx_characteristics";
pub const TRX_STATE: &str = "trx_state";

/// Error reported by the server, or fabricated by the gateway when the
/// server never got the chance.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ServerError {
    pub code: u16,
    pub sqlstate: String,
    pub message: String,
}

impl ServerError {
    pub fn new(code: u16, sqlstate: &str, message: impl Into<String>) -> ServerError {
        ServerError { code, sqlstate: sqlstate.to_string(), message: message.into() }
    }

    /// Decode the body of an ERR packet, everything after the 0xff byte.
    /// Pre-4.1 servers omit the sqlstate marker, in which case the generic
    /// HY000 is substituted.
    pub fn decode(mut payload: &[u8]) -> ServerError {
        if payload.len() < 2 {
            return ServerError::new(0, "HY000", "malformed error packet");
        }

        let code = payload.get_u16_le();

        let sqlstate = if payload.first() == Some(&b'#') && payload.len() >= 6 {
            payload.advance(1);
            let state = String::from_utf8_lossy(&payload[..5]).into_owned();
            payload.advance(5);
            state
        } else {
            "HY000".to_string()
        };

        ServerError { code, sqlstate, message: String::from_utf8_lossy(payload).into_owned() }
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.code, self.sqlstate, self.message)
    }
}

/// Where the tracker stands inside the current reply. The column definition
/// and prepared statement states carry the number of packets still owed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyState {
    Start,
    RSetColDef(u64),
    RSetColDefEof,
    RSetRows,
    Prepare(u32),
    Done,
}

impl ReplyState {
    pub fn is_done(&self) -> bool {
        matches!(self, ReplyState::Done)
    }
}

impl Default for ReplyState {
    fn default() -> Self {
        ReplyState::Done
    }
}

/// Everything known about the response to the most recent command on a
/// backend connection. Cleared when the next command is submitted.
#[derive(Debug, Default)]
pub struct Reply {
    command: u8,
    state: ReplyState,
    rows: u64,
    bytes: u64,
    warnings: u16,
    error: Option<ServerError>,
    field_count: u64,
    is_ok: bool,
    generated_id: u32,
    param_count: u16,
    variables: HashMap<String, String>,
}

impl Reply {
    pub fn command(&self) -> u8 {
        self.command
    }

    pub fn state(&self) -> &ReplyState {
        &self.state
    }

    /// The whole response has been seen and routed.
    pub fn is_complete(&self) -> bool {
        self.state.is_done()
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn warnings(&self) -> u16 {
        self.warnings
    }

    pub fn error(&self) -> Option<&ServerError> {
        self.error.as_ref()
    }

    pub fn field_count(&self) -> u64 {
        self.field_count
    }

    pub fn is_ok(&self) -> bool {
        self.is_ok
    }

    /// Statement id the server generated for COM_STMT_PREPARE.
    pub fn generated_id(&self) -> u32 {
        self.generated_id
    }

    pub fn param_count(&self) -> u16 {
        self.param_count
    }

    pub fn variable(&self, name: &str) -> Option<&str> {
        self.variables.get(name).map(|s| s.as_str())
    }

    pub fn variables(&self) -> &HashMap<String, String> {
        &self.variables
    }

    pub fn last_gtid(&self) -> Option<&str> {
        self.variable(LAST_GTID)
    }

    pub fn trx_characteristics(&self) -> Option<&str> {
        self.variable(TRX_CHARACTERISTICS)
    }

    pub fn trx_state(&self) -> Option<TrxState> {
        self.variable(TRX_STATE).map(TrxState::parse)
    }

    fn clear(&mut self) {
        *self = Reply::default();
    }

    fn set_error(&mut self, error: ServerError) {
        self.error = Some(error);
    }
}

/// Flags attached to a command when it is submitted. They replace buffer
/// metadata: the tracker reads the submission record, not the packet.
#[derive(Debug, Default, Clone, Copy)]
pub struct SubmissionFlags {
    /// Deliver the response as one buffer once it is complete.
    pub collect_result: bool,
    /// Decode the session tracking block of OK packets.
    pub track_state: bool,
}

/// The backend reply state machine. Decoding consumes server packets one
/// frame at a time, classifies them against the command recorded by
/// `track_query` and updates the `Reply`.
#[derive(Debug, Default)]
pub struct ResponseCodec {
    reply: Reply,
    skip_next: bool,
    large_query: bool,
    load_active: bool,
    opening_cursor: bool,
    pub(crate) changing_user: bool,
    track_state: bool,
    collect_result: bool,
    session_track: bool,
    deprecate_eof: bool,
    ignore_replies: u32,
    pub auth: Option<BackendAuth>,
}

impl ResponseCodec {
    pub fn new() -> ResponseCodec {
        ResponseCodec::default()
    }

    /// Build the tracker for an authenticated connection, deriving the
    /// negotiated behavior switches from the handshake.
    pub fn with_auth(auth: BackendAuth) -> ResponseCodec {
        let negotiated = auth.negotiated_capability();

        ResponseCodec {
            session_track: negotiated & CLIENT_SESSION_TRACK != 0,
            deprecate_eof: negotiated & CLIENT_DEPRECATE_EOF != 0,
            auth: Some(auth),
            ..Default::default()
        }
    }

    pub fn with_session_track(mut self, enabled: bool) -> Self {
        self.session_track = enabled;
        self
    }

    pub fn with_deprecate_eof(mut self, enabled: bool) -> Self {
        self.deprecate_eof = enabled;
        self
    }

    pub fn reply(&self) -> &Reply {
        &self.reply
    }

    pub fn is_load_active(&self) -> bool {
        self.load_active
    }

    pub fn collects_result(&self) -> bool {
        self.collect_result
    }

    /// The next reply answers a command the gateway issued for itself (a
    /// keepalive ping, a COM_CHANGE_USER); it bypasses classification and
    /// is not routed upstream.
    pub fn ignore_next_reply(&mut self) {
        self.ignore_replies += 1;
    }

    pub fn ignore_pending(&self) -> u32 {
        self.ignore_replies
    }

    pub fn consume_ignored(&mut self) {
        debug_assert!(self.ignore_replies > 0);
        self.ignore_replies = self.ignore_replies.saturating_sub(1);
    }

    /// The transport died with a reply outstanding. Close out the reply
    /// with the error the server would never get to send.
    pub fn connection_lost(&mut self, message: impl Into<String>) {
        self.reply.set_error(ServerError::new(ER_CONNECTION_FAILED, "HY000", message));
        self.reply.state = ReplyState::Done;
    }

    /// Inspect a client packet before it goes out and arm the tracker.
    ///
    /// Continuation packets of an oversized query and the raw contents of a
    /// LOAD DATA LOCAL stream carry no command byte; both are recognized
    /// here so the current command always reflects the last one submitted.
    pub fn track_query(&mut self, frame: &[u8], flags: SubmissionFlags) {
        if self.changing_user {
            // Reauthentication in progress, the payload is not a command
            return;
        }

        let payload_len = get_length(frame);

        if self.load_active {
            if payload_len == 0 {
                debug!("load data stream ended");
                self.load_active = false;
                self.reply.state = ReplyState::Start;
            }
            return;
        }

        if !self.large_query && frame.len() > HEADER_LEN {
            self.reply.clear();
            self.reply.command = frame[HEADER_LEN];
            self.track_state = flags.track_state;
            self.collect_result = flags.collect_result;

            if command_will_respond(self.reply.command) {
                self.reply.state = ReplyState::Start;
            }

            if self.reply.command == COM_STMT_EXECUTE {
                // Cursor flag byte sits after the statement id; any non-zero
                // value opens a cursor
                self.opening_cursor =
                    frame.get(HEADER_LEN + 5).map(|flags| *flags != 0).unwrap_or(false);
            } else if self.reply.command == COM_STMT_FETCH {
                // The fetch response is rows only
                self.reply.state = ReplyState::RSetRows;
            }
        }

        self.large_query = payload_len == MAX_PAYLOAD_LEN;
    }

    fn process_one_packet(&mut self, payload: &[u8], len: usize) {
        let cmd = payload.first().copied().unwrap_or(0);

        match self.reply.state.clone() {
            ReplyState::Start => self.process_reply_start(payload),

            ReplyState::Done => {
                if cmd == ERR_HEADER {
                    // Error trailing an already completed reply
                    self.update_error(&payload[1..]);
                } else {
                    error!(
                        "unexpected packet after reply completed: cmd 0x{:02x}, len {}",
                        cmd, len
                    );
                    debug_assert!(false, "packet received in Done state");
                }
            }

            ReplyState::RSetColDef(n) => {
                debug_assert!(n > 0);
                let n = n - 1;

                if n == 0 {
                    // Without the EOF terminator the rows follow directly
                    self.reply.state = if self.deprecate_eof {
                        ReplyState::RSetRows
                    } else {
                        ReplyState::RSetColDefEof
                    };
                } else {
                    self.reply.state = ReplyState::RSetColDef(n);
                }
            }

            ReplyState::RSetColDefEof => {
                debug_assert!(cmd == EOF_HEADER && len == EOF_PACKET_LEN);

                if self.opening_cursor {
                    self.opening_cursor = false;
                    debug!("cursor opened, rows arrive via fetch");
                    self.reply.state = ReplyState::Done;
                } else {
                    self.reply.state = ReplyState::RSetRows;
                }
            }

            ReplyState::RSetRows => {
                if cmd == EOF_HEADER && len == EOF_PACKET_LEN {
                    let mut cur = &payload[1..];
                    self.reply.warnings = cur.get_u16_le();
                    let status = cur.get_u16_le();

                    self.reply.state = if status & SERVER_MORE_RESULTS_EXISTS == 0 {
                        ReplyState::Done
                    } else {
                        ReplyState::Start
                    };
                } else if self.deprecate_eof && cmd == EOF_HEADER && len >= OK_PACKET_MIN_LEN {
                    // OK packet wearing the 0xfe header, the terminator used
                    // once EOF packets are deprecated
                    let mut cur = &payload[1..];
                    cur.skip_lenc_int();
                    cur.skip_lenc_int();
                    let status = cur.get_u16_le();
                    self.reply.warnings = cur.get_u16_le();

                    self.reply.state = if status & SERVER_MORE_RESULTS_EXISTS == 0 {
                        ReplyState::Done
                    } else {
                        ReplyState::Start
                    };
                } else if cmd == ERR_HEADER {
                    // Rows accumulated before the error stay reported
                    self.update_error(&payload[1..]);
                    self.reply.state = ReplyState::Done;
                } else {
                    self.reply.rows += 1;
                }
            }

            ReplyState::Prepare(n) => {
                let n = n - 1;
                self.reply.state =
                    if n == 0 { ReplyState::Done } else { ReplyState::Prepare(n) };
            }
        }
    }

    fn process_reply_start(&mut self, payload: &[u8]) {
        match self.reply.command {
            // A binlog stream never terminates
            COM_BINLOG_DUMP => {}

            // Single string response, no result set framing
            COM_STATISTICS => self.reply.state = ReplyState::Done,

            // Column definitions without a leading count, terminated like rows
            COM_FIELD_LIST => self.reply.state = ReplyState::RSetRows,

            _ => self.process_result_start(payload),
        }
    }

    fn process_result_start(&mut self, payload: &[u8]) {
        match payload[0] {
            OK_HEADER => {
                self.reply.is_ok = true;

                if self.reply.command == COM_STMT_PREPARE {
                    self.process_ps_response(payload);
                } else {
                    self.process_ok_packet(payload);
                }
            }

            LOCALINFILE_HEADER => {
                // The client streams the file next; the server closes the
                // exchange with an OK or an ERR
                self.load_active = true;
                self.reply.state = ReplyState::Done;
            }

            ERR_HEADER => {
                self.update_error(&payload[1..]);
                self.reply.state = ReplyState::Done;
            }

            EOF_HEADER => {
                // Only the handshake phase of COM_CHANGE_USER may lead with
                // an EOF
                debug_assert!(self.changing_user, "EOF as the first response packet");
            }

            _ => {
                let mut cur = payload;
                let (count, _, _) = cur.get_lenc_int();
                self.reply.field_count += count;
                self.reply.state = ReplyState::RSetColDef(count);
            }
        }
    }

    fn process_ok_packet(&mut self, payload: &[u8]) {
        let mut cur = &payload[1..];
        cur.skip_lenc_int(); // affected rows
        cur.skip_lenc_int(); // last insert id
        let status = cur.get_u16_le();
        self.reply.warnings = cur.get_u16_le();

        self.reply.state = if status & SERVER_MORE_RESULTS_EXISTS == 0 {
            ReplyState::Done
        } else {
            // The next statement's response follows in the same stream
            ReplyState::Start
        };

        if self.session_track
            && status & SERVER_SESSION_STATE_CHANGED != 0
            && self.track_state
            && !cur.is_empty()
        {
            cur.skip_lenc_str(); // human readable info

            let (total, _, _) = cur.get_lenc_int();
            debug_assert_eq!(total as usize, cur.len(), "bad session tracking block length");
            let take = (total as usize).min(cur.len());
            let mut block = &cur[..take];

            while !block.is_empty() {
                match SessionState::decode(&mut block) {
                    SessionState::SystemVariables(pairs) => {
                        for (name, value) in pairs {
                            self.reply.variables.insert(name, value);
                        }
                    }

                    SessionState::Gtids(gtid) => {
                        self.reply.variables.insert(LAST_GTID.to_string(), gtid);
                    }

                    SessionState::TransactionCharacteristics(trx) => {
                        self.reply.variables.insert(TRX_CHARACTERISTICS.to_string(), trx);
                    }

                    SessionState::TransactionState(state) => {
                        self.reply.variables.insert(TRX_STATE.to_string(), state);
                    }

                    // Tracked but not consumed by the gateway
                    SessionState::Schema(_) | SessionState::StateChange(_) => {}

                    SessionState::Unknown(entry_type) => {
                        warn!("unexpected session track type {}", entry_type);
                    }
                }
            }
        }
    }

    // COM_STMT_PREPARE response header: statement id, column count and
    // parameter count. Definitions for both follow, each list closed by an
    // EOF unless those are deprecated.
    fn process_ps_response(&mut self, payload: &[u8]) {
        debug_assert_eq!(payload[0], OK_HEADER);
        let mut cur = &payload[1..];

        self.reply.generated_id = cur.get_u32_le();
        let columns = cur.get_u16_le();
        let params = cur.get_u16_le();
        self.reply.param_count = params;

        if cur.len() >= 3 {
            cur.advance(1); // filler
            self.reply.warnings = cur.get_u16_le();
        }

        let eof = if self.deprecate_eof { 0 } else { 1 };
        let mut ps_packets = 0u32;

        if columns > 0 {
            ps_packets += columns as u32 + eof;
        }
        if params > 0 {
            ps_packets += params as u32 + eof;
        }

        self.reply.state =
            if ps_packets == 0 { ReplyState::Done } else { ReplyState::Prepare(ps_packets) };
    }

    fn update_error(&mut self, body: &[u8]) {
        self.reply.set_error(ServerError::decode(body));
    }
}

/// Decoding yields `(frame, reply_complete)`: the raw frame to forward plus
/// whether the reply just finished. Pipelined responses left in the buffer
/// surface on the next call.
impl Decoder for ResponseCodec {
    type Item = (BytesMut, bool);
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let length = get_length(src);
        if src.len() < HEADER_LEN + length {
            return Ok(None);
        }

        let frame = src.split_to(HEADER_LEN + length);

        // Replies the gateway consumes itself pass through unclassified
        if self.changing_user || self.ignore_replies > 0 {
            return Ok(Some((frame, false)));
        }

        self.reply.bytes += frame.len() as u64;

        // The tail of an oversized packet is raw data and is never classified
        let skip = self.skip_next;
        self.skip_next = length == MAX_PAYLOAD_LEN;

        if !skip {
            self.process_one_packet(&frame[HEADER_LEN..], length);
        }

        Ok(Some((frame, self.reply.is_complete())))
    }
}

impl<'a> Encoder<(u8, &'a [u8])> for ResponseCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: (u8, &'a [u8]), dst: &mut BytesMut) -> Result<(), Self::Error> {
        let frame = crate::packet::command_packet(item.0, item.1);
        self.track_query(&frame, SubmissionFlags::default());
        dst.extend_from_slice(&frame);
        Ok(())
    }
}

/// Forward an already framed client packet, arming the tracker with the
/// submission's flags.
impl Encoder<(BytesMut, SubmissionFlags)> for ResponseCodec {
    type Error = ProtocolError;

    fn encode(
        &mut self,
        item: (BytesMut, SubmissionFlags),
        dst: &mut BytesMut,
    ) -> Result<(), Self::Error> {
        self.track_query(&item.0, item.1);
        dst.extend_from_slice(&item.0);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::packet::command_packet;

    fn frame(seq: u8, payload: &[u8]) -> Vec<u8> {
        let mut out =
            vec![payload.len() as u8, (payload.len() >> 8) as u8, (payload.len() >> 16) as u8, seq];
        out.extend_from_slice(payload);
        out
    }

    fn ok_payload(status: u16) -> Vec<u8> {
        let mut payload = vec![0x00, 0x00, 0x00];
        payload.extend_from_slice(&status.to_le_bytes());
        payload.extend_from_slice(&[0x00, 0x00]);
        payload
    }

    fn eof_payload(warnings: u16, status: u16) -> Vec<u8> {
        let mut payload = vec![0xfe];
        payload.extend_from_slice(&warnings.to_le_bytes());
        payload.extend_from_slice(&status.to_le_bytes());
        payload
    }

    fn err_payload(code: u16, sqlstate: &str, msg: &str) -> Vec<u8> {
        let mut payload = vec![0xff];
        payload.extend_from_slice(&code.to_le_bytes());
        payload.push(b'#');
        payload.extend_from_slice(sqlstate.as_bytes());
        payload.extend_from_slice(msg.as_bytes());
        payload
    }

    fn submit(codec: &mut ResponseCodec, cmd: u8, body: &[u8]) {
        codec.track_query(&command_packet(cmd, body), SubmissionFlags::default());
    }

    // Feed a server byte stream through the decoder, returning the
    // completion flag of each frame
    fn feed(codec: &mut ResponseCodec, bytes: &[u8]) -> Vec<bool> {
        let mut src = BytesMut::from(bytes);
        let mut out = Vec::new();
        while let Some((_, complete)) = codec.decode(&mut src).unwrap() {
            out.push(complete);
        }
        assert!(src.is_empty(), "undecoded residue");
        out
    }

    #[test]
    fn test_simple_ok() {
        let mut codec = ResponseCodec::new();
        submit(&mut codec, COM_QUERY, b"SET @x=1");

        let done = feed(
            &mut codec,
            &[0x07, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00],
        );

        assert_eq!(done, vec![true]);
        assert!(codec.reply().is_complete());
        assert_eq!(codec.reply().command(), 0x03);
        assert_eq!(codec.reply().rows(), 0);
        assert_eq!(codec.reply().warnings(), 0);
        assert!(codec.reply().error().is_none());
        assert!(codec.reply().is_ok());
    }

    #[test]
    fn test_two_row_result_set() {
        let mut codec = ResponseCodec::new();
        submit(&mut codec, COM_QUERY, b"SELECT 1,2");

        let mut stream = Vec::new();
        stream.extend_from_slice(&frame(1, &[0x02]));
        stream.extend_from_slice(&frame(2, b"coldef-one"));
        stream.extend_from_slice(&frame(3, b"coldef-two"));
        stream.extend_from_slice(&frame(4, &eof_payload(0, 0x0002)));
        stream.extend_from_slice(&frame(5, &[0x01, b'1', 0x01, b'2']));
        stream.extend_from_slice(&frame(6, &[0x01, b'3', 0x01, b'4']));
        stream.extend_from_slice(&frame(7, &eof_payload(0, 0x0000)));

        let done = feed(&mut codec, &stream);

        assert_eq!(done, vec![false, false, false, false, false, false, true]);
        assert!(codec.reply().is_complete());
        assert_eq!(codec.reply().rows(), 2);
        assert_eq!(codec.reply().field_count(), 2);
        assert_eq!(codec.reply().bytes(), stream.len() as u64);
    }

    // A multi statement chain passes through Start once per statement and
    // completes exactly once
    #[test]
    fn test_multi_statement_ok_chain() {
        let mut codec = ResponseCodec::new();
        submit(&mut codec, COM_QUERY, b"SET @x=1; SET @y=2");

        let mut stream = Vec::new();
        stream.extend_from_slice(&frame(1, &ok_payload(0x0008)));
        stream.extend_from_slice(&frame(2, &ok_payload(0x0000)));

        let done = feed(&mut codec, &stream);
        assert_eq!(done, vec![false, true]);
        assert!(codec.reply().is_complete());
    }

    #[test]
    fn test_three_statement_chain_visits_start_each_time() {
        let mut codec = ResponseCodec::new();
        submit(&mut codec, COM_QUERY, b"DO 1; DO 2; DO 3");

        for _ in 0..2 {
            let done = feed(&mut codec, &frame(1, &ok_payload(0x0008)));
            assert_eq!(done, vec![false]);
            assert_eq!(codec.reply().state(), &ReplyState::Start);
        }

        let done = feed(&mut codec, &frame(3, &ok_payload(0x0000)));
        assert_eq!(done, vec![true]);
    }

    #[test]
    fn test_error_inside_result_set() {
        let mut codec = ResponseCodec::new();
        submit(&mut codec, COM_QUERY, b"SELECT sleep(10)");

        let mut stream = Vec::new();
        stream.extend_from_slice(&frame(1, &[0x01]));
        stream.extend_from_slice(&frame(2, b"coldef"));
        stream.extend_from_slice(&frame(3, &eof_payload(0, 0x0002)));
        stream.extend_from_slice(&frame(
            4,
            &err_payload(1317, "70100", "Query execution was interrupted"),
        ));

        let done = feed(&mut codec, &stream);
        assert_eq!(done.last(), Some(&true));

        let error = codec.reply().error().unwrap();
        assert_eq!(error.code, 1317);
        assert_eq!(error.sqlstate, "70100");
        assert_eq!(error.message, "Query execution was interrupted");
        assert_eq!(codec.reply().rows(), 0);
    }

    #[test]
    fn test_prepare_response() {
        let mut codec = ResponseCodec::new();
        submit(&mut codec, COM_STMT_PREPARE, b"SELECT ?, a, b FROM t");

        // PS header: id 7, two columns, one parameter, no warnings
        let mut ps_ok = vec![0x00];
        ps_ok.extend_from_slice(&7u32.to_le_bytes());
        ps_ok.extend_from_slice(&2u16.to_le_bytes());
        ps_ok.extend_from_slice(&1u16.to_le_bytes());
        ps_ok.push(0x00);
        ps_ok.extend_from_slice(&0u16.to_le_bytes());

        let done = feed(&mut codec, &frame(1, &ps_ok));
        assert_eq!(done, vec![false]);
        assert_eq!(codec.reply().state(), &ReplyState::Prepare(5));

        let mut stream = Vec::new();
        stream.extend_from_slice(&frame(2, b"paramdef"));
        stream.extend_from_slice(&frame(3, &eof_payload(0, 0x0002)));
        stream.extend_from_slice(&frame(4, b"coldef-a"));
        stream.extend_from_slice(&frame(5, b"coldef-b"));
        stream.extend_from_slice(&frame(6, &eof_payload(0, 0x0002)));

        let done = feed(&mut codec, &stream);
        assert_eq!(done, vec![false, false, false, false, true]);
        assert_eq!(codec.reply().generated_id(), 7);
        assert_eq!(codec.reply().param_count(), 1);
    }

    #[test]
    fn test_prepare_without_metadata_completes_immediately() {
        let mut codec = ResponseCodec::new();
        submit(&mut codec, COM_STMT_PREPARE, b"DO 1");

        let mut ps_ok = vec![0x00];
        ps_ok.extend_from_slice(&3u32.to_le_bytes());
        ps_ok.extend_from_slice(&0u16.to_le_bytes());
        ps_ok.extend_from_slice(&0u16.to_le_bytes());
        ps_ok.push(0x00);
        ps_ok.extend_from_slice(&0u16.to_le_bytes());

        let done = feed(&mut codec, &frame(1, &ps_ok));
        assert_eq!(done, vec![true]);
        assert_eq!(codec.reply().generated_id(), 3);
    }

    #[test]
    fn test_execute_with_cursor_ends_at_coldef_eof() {
        let mut codec = ResponseCodec::new();

        // COM_STMT_EXECUTE with a non-zero cursor flag after the id
        let mut body = Vec::new();
        body.extend_from_slice(&7u32.to_le_bytes());
        body.push(0x01);
        body.extend_from_slice(&1u32.to_le_bytes());
        submit(&mut codec, COM_STMT_EXECUTE, &body);

        let mut stream = Vec::new();
        stream.extend_from_slice(&frame(1, &[0x02]));
        stream.extend_from_slice(&frame(2, b"coldef-a"));
        stream.extend_from_slice(&frame(3, b"coldef-b"));
        stream.extend_from_slice(&frame(4, &eof_payload(0, 0x0002)));

        let done = feed(&mut codec, &stream);
        assert_eq!(done, vec![false, false, false, true]);
        assert!(codec.reply().is_complete());
        assert_eq!(codec.reply().rows(), 0);
    }

    #[test]
    fn test_fetch_goes_straight_to_rows() {
        let mut codec = ResponseCodec::new();
        let mut body = Vec::new();
        body.extend_from_slice(&7u32.to_le_bytes());
        body.extend_from_slice(&10u32.to_le_bytes());
        submit(&mut codec, COM_STMT_FETCH, &body);

        assert_eq!(codec.reply().state(), &ReplyState::RSetRows);

        let mut stream = Vec::new();
        stream.extend_from_slice(&frame(1, b"row-1"));
        stream.extend_from_slice(&frame(2, b"row-2"));
        stream.extend_from_slice(&frame(3, &eof_payload(0, 0x0000)));

        let done = feed(&mut codec, &stream);
        assert_eq!(done, vec![false, false, true]);
        assert_eq!(codec.reply().rows(), 2);
    }

    // An error halfway through a fetch surfaces the error and keeps the
    // rows that already arrived
    #[test]
    fn test_fetch_error_preserves_rows() {
        let mut codec = ResponseCodec::new();
        let mut body = Vec::new();
        body.extend_from_slice(&7u32.to_le_bytes());
        body.extend_from_slice(&10u32.to_le_bytes());
        submit(&mut codec, COM_STMT_FETCH, &body);

        let mut stream = Vec::new();
        stream.extend_from_slice(&frame(1, b"row-1"));
        stream.extend_from_slice(&frame(2, b"row-2"));
        stream.extend_from_slice(&frame(3, &err_payload(1317, "70100", "interrupted")));

        let done = feed(&mut codec, &stream);
        assert_eq!(done.last(), Some(&true));
        assert_eq!(codec.reply().rows(), 2);
        assert_eq!(codec.reply().error().unwrap().code, 1317);
    }

    #[test]
    fn test_local_infile_round_trip() {
        let mut codec = ResponseCodec::new();
        submit(&mut codec, COM_QUERY, b"LOAD DATA LOCAL INFILE 'x' INTO TABLE t");

        // Server requests the file
        let mut request = vec![0xfb];
        request.extend_from_slice(b"x");
        let done = feed(&mut codec, &frame(1, &request));
        assert_eq!(done, vec![true]);
        assert!(codec.is_load_active());

        // Client streams file contents, then an empty packet to finish
        codec.track_query(&frame(2, b"csv data"), SubmissionFlags::default());
        assert!(codec.is_load_active());
        codec.track_query(&frame(3, &[]), SubmissionFlags::default());
        assert!(!codec.is_load_active());
        assert_eq!(codec.reply().state(), &ReplyState::Start);

        // Server acknowledges the load
        let done = feed(&mut codec, &frame(4, &ok_payload(0)));
        assert_eq!(done, vec![true]);
    }

    #[test]
    fn test_statistics_is_a_single_packet() {
        let mut codec = ResponseCodec::new();
        submit(&mut codec, COM_STATISTICS, &[]);

        let done = feed(&mut codec, &frame(1, b"Uptime: 5  Threads: 1"));
        assert_eq!(done, vec![true]);
    }

    #[test]
    fn test_field_list_rows_until_eof() {
        let mut codec = ResponseCodec::new();
        submit(&mut codec, COM_FIELD_LIST, b"t\x00");

        let mut stream = Vec::new();
        stream.extend_from_slice(&frame(1, b"coldef-a"));
        stream.extend_from_slice(&frame(2, b"coldef-b"));
        stream.extend_from_slice(&frame(3, &eof_payload(0, 0x0000)));

        let done = feed(&mut codec, &stream);
        assert_eq!(done, vec![false, false, true]);
    }

    #[test]
    fn test_binlog_dump_never_completes() {
        let mut codec = ResponseCodec::new();
        submit(&mut codec, COM_BINLOG_DUMP, &[0, 0, 0, 0]);

        let mut stream = Vec::new();
        for i in 0..4 {
            stream.extend_from_slice(&frame(i + 1, b"binlog event"));
        }

        let done = feed(&mut codec, &stream);
        assert_eq!(done, vec![false; 4]);
        assert_eq!(codec.reply().state(), &ReplyState::Start);
    }

    #[test]
    fn test_silent_command_stays_done() {
        let mut codec = ResponseCodec::new();
        let mut body = Vec::new();
        body.extend_from_slice(&7u32.to_le_bytes());
        submit(&mut codec, COM_STMT_CLOSE, &body);

        assert!(codec.reply().is_complete());
    }

    // An oversized row packet sets the skip flag: the continuation tail is
    // forwarded without classification and the row is counted once
    #[test]
    fn test_max_packet_tail_is_not_classified() {
        let mut codec = ResponseCodec::new();
        submit(&mut codec, COM_QUERY, b"SELECT blob FROM t");

        let mut stream = Vec::new();
        stream.extend_from_slice(&frame(1, &[0x01]));
        stream.extend_from_slice(&frame(2, b"coldef"));
        stream.extend_from_slice(&frame(3, &eof_payload(0, 0x0002)));

        let done = feed(&mut codec, &stream);
        assert_eq!(done, vec![false, false, false]);

        // One giant row split across two packets. The tail starts with 0xfe
        // and still must not be mistaken for an EOF.
        let huge = vec![0x31u8; MAX_PAYLOAD_LEN];
        let tail = [0xfe, 0x00, 0x00, 0x02, 0x00];

        let mut stream = Vec::new();
        stream.extend_from_slice(&frame(4, &huge));
        stream.extend_from_slice(&frame(5, &tail));
        let done = feed(&mut codec, &stream);
        assert_eq!(done, vec![false, false]);
        assert_eq!(codec.reply().rows(), 1);

        // The real terminator still lands
        let done = feed(&mut codec, &frame(6, &eof_payload(0, 0x0000)));
        assert_eq!(done, vec![true]);
        assert_eq!(codec.reply().rows(), 1);
    }

    #[test]
    fn test_session_track_extraction() {
        let mut codec = ResponseCodec::new().with_session_track(true);
        codec.track_query(
            &command_packet(COM_QUERY, b"SET autocommit=0"),
            SubmissionFlags { track_state: true, ..Default::default() },
        );

        // OK with SESSION_STATE_CHANGED: autocommit=OFF plus a GTID entry
        let mut payload = vec![0x00, 0x00, 0x00];
        payload.extend_from_slice(&0x4000u16.to_le_bytes());
        payload.extend_from_slice(&[0x00, 0x00]);
        payload.push(0x00); // empty info string

        let mut block: Vec<u8> = Vec::new();
        block.extend_from_slice(&[0x00, 0x0f, 0x0a]);
        block.extend_from_slice(b"autocommit");
        block.push(0x03);
        block.extend_from_slice(b"OFF");
        block.extend_from_slice(&[0x03, 0x08, 0x00, 0x06]);
        block.extend_from_slice(b"0-1-42");

        payload.push(block.len() as u8);
        payload.extend_from_slice(&block);

        let done = feed(&mut codec, &frame(1, &payload));
        assert_eq!(done, vec![true]);

        let reply = codec.reply();
        assert_eq!(reply.variable("autocommit"), Some("OFF"));
        assert_eq!(reply.last_gtid(), Some("0-1-42"));
        assert_eq!(reply.variables().len(), 2);
    }

    // Unknown tracking entries must not derail the ones that follow
    #[test]
    fn test_session_track_skips_unknown_entries() {
        let mut codec = ResponseCodec::new().with_session_track(true);
        codec.track_query(
            &command_packet(COM_QUERY, b"BEGIN"),
            SubmissionFlags { track_state: true, ..Default::default() },
        );

        let mut payload = vec![0x00, 0x00, 0x00];
        payload.extend_from_slice(&0x4000u16.to_le_bytes());
        payload.extend_from_slice(&[0x00, 0x00]);
        payload.push(0x00);

        let mut block: Vec<u8> = Vec::new();
        block.extend_from_slice(&[0x0b, 0x02, 0xde, 0xad]); // unknown type 11
        block.extend_from_slice(&[0x05, 0x09, 0x08]); // transaction state
        block.extend_from_slice(b"T_____S_");

        payload.push(block.len() as u8);
        payload.extend_from_slice(&block);

        let done = feed(&mut codec, &frame(1, &payload));
        assert_eq!(done, vec![true]);

        let state = codec.reply().trx_state().unwrap();
        assert!(state.contains(TrxState::EXPLICIT));
        assert!(state.contains(TrxState::RESULT_SET));
        assert!(!state.contains(TrxState::WRITE_TRX));
    }

    #[test]
    fn test_tracking_needs_the_submission_flag() {
        let mut codec = ResponseCodec::new().with_session_track(true);
        submit(&mut codec, COM_QUERY, b"SET autocommit=0");

        let mut payload = vec![0x00, 0x00, 0x00];
        payload.extend_from_slice(&0x4000u16.to_le_bytes());
        payload.extend_from_slice(&[0x00, 0x00]);
        payload.push(0x00);
        let block = [0x00u8, 0x06, 0x02, b'x', b'y', 0x02, b'o', b'n'];
        payload.push(block.len() as u8);
        payload.extend_from_slice(&block);

        feed(&mut codec, &frame(1, &payload));
        assert!(codec.reply().variables().is_empty());
    }

    #[test]
    fn test_deprecated_eof_result_set() {
        let mut codec = ResponseCodec::new().with_deprecate_eof(true);
        submit(&mut codec, COM_QUERY, b"SELECT 1");

        // Column definitions flow straight into rows; the terminator is an
        // OK packet with the 0xfe header
        let mut terminator = vec![0xfe, 0x00, 0x00];
        terminator.extend_from_slice(&0x0000u16.to_le_bytes());
        terminator.extend_from_slice(&0x0001u16.to_le_bytes());

        let mut stream = Vec::new();
        stream.extend_from_slice(&frame(1, &[0x01]));
        stream.extend_from_slice(&frame(2, b"coldef"));
        stream.extend_from_slice(&frame(3, b"row-1"));
        stream.extend_from_slice(&frame(4, &terminator));

        let done = feed(&mut codec, &stream);
        assert_eq!(done, vec![false, false, false, true]);
        assert_eq!(codec.reply().rows(), 1);
        assert_eq!(codec.reply().warnings(), 1);
    }

    #[test]
    fn test_error_after_done_is_recorded() {
        let mut codec = ResponseCodec::new();
        submit(&mut codec, COM_QUERY, b"SET @x=1");

        let done = feed(&mut codec, &frame(1, &ok_payload(0)));
        assert_eq!(done, vec![true]);

        let done = feed(&mut codec, &frame(2, &err_payload(1927, "70100", "trailing")));
        assert_eq!(done, vec![true]);
        assert_eq!(codec.reply().error().unwrap().code, 1927);
    }

    #[test]
    fn test_connection_lost_synthesizes_error() {
        let mut codec = ResponseCodec::new();
        submit(&mut codec, COM_QUERY, b"SELECT 1");

        codec.connection_lost("Lost connection to backend server");

        assert!(codec.reply().is_complete());
        let error = codec.reply().error().unwrap();
        assert_eq!(error.code, 2003);
        assert_eq!(error.sqlstate, "HY000");
    }

    #[test]
    fn test_err_without_sqlstate_marker() {
        let error = ServerError::decode(&{
            let mut body = 1045u16.to_le_bytes().to_vec();
            body.extend_from_slice(b"denied");
            body
        });

        assert_eq!(error.code, 1045);
        assert_eq!(error.sqlstate, "HY000");
        assert_eq!(error.message, "denied");
    }

    // Split the server stream at arbitrary points; the reply must complete
    // exactly once with identical counters
    #[test]
    fn test_incremental_feed_matches_single_feed() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&frame(1, &[0x01]));
        stream.extend_from_slice(&frame(2, b"coldef"));
        stream.extend_from_slice(&frame(3, &eof_payload(0, 0x0002)));
        stream.extend_from_slice(&frame(4, b"row-1"));
        stream.extend_from_slice(&frame(5, &eof_payload(3, 0x0000)));

        for split in 1..stream.len() {
            let mut codec = ResponseCodec::new();
            submit(&mut codec, COM_QUERY, b"SELECT 1");

            let mut src = BytesMut::from(&stream[..split]);
            let mut completions = 0;
            while let Some((_, complete)) = codec.decode(&mut src).unwrap() {
                if complete {
                    completions += 1;
                }
            }

            src.extend_from_slice(&stream[split..]);
            while let Some((_, complete)) = codec.decode(&mut src).unwrap() {
                if complete {
                    completions += 1;
                }
            }

            assert_eq!(completions, 1, "split at {}", split);
            assert_eq!(codec.reply().rows(), 1);
            assert_eq!(codec.reply().warnings(), 3);
        }
    }
}
