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

use std::{fmt, str, sync::Arc};

use byteorder::{ByteOrder, LittleEndian};
use bytes::{BufMut, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::mpsc,
};
use tokio_util::codec::{Decoder, Encoder, Framed};
use tracing::{debug, error, info};

use super::reply::ServerError;
use crate::{
    err::ProtocolError,
    mysql_const::*,
    session::{AuthToken, SessionCreds},
    util::{get_length, scramble_password},
};

/// Authentication progress of a backend connection. Only `Complete` allows
/// application traffic; both failure states are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Connected,
    ResponseSent,
    Complete,
    Fail,
    FailHandshake,
}

impl AuthState {
    pub fn is_complete(&self) -> bool {
        matches!(self, AuthState::Complete)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AuthState::Complete | AuthState::Fail | AuthState::FailHandshake)
    }
}

impl fmt::Display for AuthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AuthState::Connected => "CONNECTED",
            AuthState::ResponseSent => "RESPONSE_SENT",
            AuthState::Complete => "COMPLETE",
            AuthState::Fail => "FAILED",
            AuthState::FailHandshake => "HANDSHAKE_FAILED",
        };
        f.write_str(name)
    }
}

/// Raised when a backend reports error 1129. The receiving side must move
/// the server into maintenance on the main worker; the connection itself
/// never retries.
#[derive(Debug, Clone)]
pub struct MaintenanceEvent {
    pub error: ServerError,
}

/// Codec that walks a freshly connected backend through the handshake.
///
/// Decoding consumes server packets and yields the responses to write;
/// encoding frames those responses with the running sequence number. The
/// scramble captured here outlives authentication: it is reused verbatim
/// when the connection is later recycled with COM_CHANGE_USER.
#[derive(Debug)]
pub struct BackendAuth {
    pub state: AuthState,
    pub creds: Arc<SessionCreds>,
    pub scramble: [u8; SCRAMBLE_LEN],
    pub connection_id: u32,
    pub server_version: String,
    pub server_capability: u32,
    pub charset: u8,
    pub status: u16,
    pub auth_plugin_name: String,
    /// Ask the server to report session state changes inside OK packets.
    pub session_track: bool,
    pub tls_required: bool,
    pub tls_established: bool,
    sent_capability: u32,
    seq: u8,
    maint_tx: Option<mpsc::UnboundedSender<MaintenanceEvent>>,
}

impl BackendAuth {
    pub fn new(creds: Arc<SessionCreds>) -> BackendAuth {
        BackendAuth {
            state: AuthState::Connected,
            creds,
            scramble: [0; SCRAMBLE_LEN],
            connection_id: 0,
            server_version: String::new(),
            server_capability: 0,
            charset: 0,
            status: 0,
            auth_plugin_name: String::new(),
            session_track: false,
            tls_required: false,
            tls_established: false,
            sent_capability: 0,
            seq: 0,
            maint_tx: None,
        }
    }

    pub fn with_session_track(mut self, enabled: bool) -> Self {
        self.session_track = enabled;
        self
    }

    pub fn with_maintenance_sender(mut self, tx: mpsc::UnboundedSender<MaintenanceEvent>) -> Self {
        self.maint_tx = Some(tx);
        self
    }

    /// Capability bits negotiated with this backend, the intersection of
    /// what was sent and what the server advertised.
    pub fn negotiated_capability(&self) -> u32 {
        self.sent_capability & self.server_capability
    }

    // Read the protocol v10 greeting and capture the 20 byte scramble.
    fn read_initial_handshake(&mut self, data: &mut BytesMut) -> Result<(), ProtocolError> {
        if data[0] == ERR_HEADER {
            self.state = AuthState::FailHandshake;
            return Err(self.server_error(data));
        }

        if data[0] != MIN_PROTOCOL_VERSION {
            self.state = AuthState::FailHandshake;
            return Err(ProtocolError::ProtocolVersion(data[0]));
        }
        let _ = data.split_to(1);

        // server version, NUL terminated
        let pos = nul_position(data, "read_initial_handshake")?;
        self.server_version = String::from_utf8_lossy(&data.split_to(pos)).into_owned();
        let _ = data.split_to(1);

        self.connection_id = LittleEndian::read_u32(&data.split_to(4));

        self.scramble[..SCRAMBLE_LEN_323].copy_from_slice(&data.split_to(SCRAMBLE_LEN_323));

        // filler
        let _ = data.split_to(1);

        self.server_capability = u32::from(LittleEndian::read_u16(&data.split_to(2)));

        if self.server_capability & CLIENT_PROTOCOL_41 == 0 {
            self.state = AuthState::FailHandshake;
            return Err(ProtocolError::ServerProtocolVersion);
        }

        if data.is_empty() {
            return Ok(());
        }

        self.charset = data.split_to(1)[0];
        self.status = LittleEndian::read_u16(&data.split_to(2));
        self.server_capability |= u32::from(LittleEndian::read_u16(&data.split_to(2))) << 16;

        // Declared auth data length, scramble length plus the trailing NUL
        let auth_data_len = data.split_to(1)[0] as usize;
        let scramble_len = if self.server_capability & CLIENT_PLUGIN_AUTH != 0 && auth_data_len > 0
        {
            let len = auth_data_len - 1;
            if len <= SCRAMBLE_LEN_323 || len > SCRAMBLE_LEN {
                self.state = AuthState::FailHandshake;
                return Err(ProtocolError::ScrambleLength(auth_data_len));
            }
            len
        } else {
            SCRAMBLE_LEN
        };

        // 10 reserved zero bytes
        let _ = data.split_to(10);

        let part2 = scramble_len - SCRAMBLE_LEN_323;
        if data.len() < part2 {
            return Err(ProtocolError::InvalidPacket {
                method: "read_initial_handshake".to_string(),
                data: data.to_vec(),
            });
        }
        self.scramble[SCRAMBLE_LEN_323..scramble_len].copy_from_slice(&data.split_to(part2));

        // trailing NUL of the scramble area
        if !data.is_empty() {
            let _ = data.split_to(1);
        }

        if self.server_capability & CLIENT_PLUGIN_AUTH != 0 && !data.is_empty() {
            let pos = nul_position(data, "read_initial_handshake")?;
            self.auth_plugin_name = String::from_utf8_lossy(&data.split_to(pos)).into_owned();
        }

        debug!(
            "greeting from {} (connection id {}), plugin {:?}",
            self.server_version, self.connection_id, self.auth_plugin_name
        );

        Ok(())
    }

    /// Capability bits for the handshake response: the client's own flags
    /// filtered to what the gateway forwards, plus what the gateway itself
    /// needs from every backend.
    fn create_capabilities(&self) -> u32 {
        let mut capability = self.creds.client_capability & CLIENT_CAPABILITIES_MASK;

        capability |= CLIENT_PROTOCOL_41
            | CLIENT_SECURE_CONNECTION
            | CLIENT_PLUGIN_AUTH
            | CLIENT_MULTI_STATEMENTS;

        if self.tls_required {
            capability |= CLIENT_SSL;
        }

        if self.session_track {
            capability |= CLIENT_SESSION_TRACK;
        }

        if self.creds.db.is_empty() {
            capability &= !CLIENT_CONNECT_WITH_DB;
        } else {
            capability |= CLIENT_CONNECT_WITH_DB;
        }

        capability
    }

    /// Build the full handshake response payload. With TLS in play the
    /// stub form (`ssl_request`) goes first and this form follows once the
    /// channel is encrypted.
    pub fn auth_response(&mut self) -> BytesMut {
        let capability = self.create_capabilities();
        self.sent_capability = capability;

        let mut data = BytesMut::with_capacity(255);

        data.put_u32_le(capability);
        data.put_u32_le(MAX_PACKET_SIZE);
        data.put_u8(self.creds.charset);

        // 19 reserved bytes, then the MariaDB extended capabilities. A zero
        // word keeps the classic 23 byte filler layout.
        data.put_bytes(0, 19);
        data.put_u32_le(self.creds.extra_capability);

        data.put_slice(self.creds.user.as_bytes());
        data.put_u8(0x00);

        match &self.creds.auth {
            AuthToken::Sha1(token) => {
                data.put_u8(SCRAMBLE_LEN as u8);
                data.put_slice(&scramble_password(&self.scramble, token));
            }
            AuthToken::None => data.put_u8(0x00),
        }

        if capability & CLIENT_CONNECT_WITH_DB != 0 {
            data.put_slice(self.creds.db.as_bytes());
            data.put_u8(0x00);
        }

        data.put_slice(AUTH_NATIVE_PASSWORD.as_bytes());
        data.put_u8(0x00);

        if capability & self.server_capability & CLIENT_CONNECT_ATTRS != 0
            && !self.creds.connect_attrs.is_empty()
        {
            data.put_slice(&self.creds.connect_attrs);
        }

        data
    }

    /// The 32 byte pre-TLS stub: capabilities, max packet size, charset and
    /// filler only. No user name or password crosses the wire in the clear.
    pub fn ssl_request(&mut self) -> BytesMut {
        let mut data = self.auth_response();
        data.truncate(32);
        data
    }

    // Parse an AuthSwitchRequest, adopt the new scramble when the plugin is
    // the one the gateway speaks.
    fn read_auth_switch(&mut self, data: &BytesMut) -> Result<BytesMut, ProtocolError> {
        if data.len() <= 1 {
            self.state = AuthState::Fail;
            return Err(ProtocolError::AuthPluginUnsupported(
                AUTH_MYSQL_OLD_PASSWORD.to_string(),
            ));
        }

        let body = &data[1..];
        let pos = body.iter().position(|&x| x == 0x00).ok_or_else(|| {
            ProtocolError::InvalidPacket {
                method: "read_auth_switch".to_string(),
                data: data.to_vec(),
            }
        })?;

        let plugin = str::from_utf8(&body[..pos]).unwrap_or_default();
        if plugin != AUTH_NATIVE_PASSWORD {
            self.state = AuthState::Fail;
            error!("backend requested auth switch to {:?}, closing", plugin);
            return Err(ProtocolError::AuthPluginUnsupported(plugin.to_string()));
        }

        let salt = &body[pos + 1..];
        if salt.len() < SCRAMBLE_LEN {
            return Err(ProtocolError::InvalidPacket {
                method: "read_auth_switch".to_string(),
                data: data.to_vec(),
            });
        }

        // The request carries a fresh scramble for the re-authentication
        self.scramble.copy_from_slice(&salt[..SCRAMBLE_LEN]);

        let mut response = BytesMut::with_capacity(SCRAMBLE_LEN);
        if let AuthToken::Sha1(token) = &self.creds.auth {
            response.put_slice(&scramble_password(&self.scramble, token));
        }
        Ok(response)
    }

    // Classify an ERR packet received during authentication, raising the
    // maintenance flag for a blocked host.
    fn server_error(&mut self, data: &BytesMut) -> ProtocolError {
        let err = ServerError::decode(&data[1..]);

        if err.code == ER_HOST_IS_BLOCKED {
            error!(
                "backend blocks connections from this host, flagging for maintenance: {}",
                err.message
            );
            if let Some(tx) = &self.maint_tx {
                let _ = tx.send(MaintenanceEvent { error: err.clone() });
            }
            return ProtocolError::HostBlocked(err);
        }

        match self.state {
            AuthState::FailHandshake => ProtocolError::HandshakeFailed(err),
            _ => ProtocolError::AuthFailed(err),
        }
    }
}

#[derive(Debug)]
pub enum AuthDecoderReturn {
    HandshakeResponse(BytesMut),
    SslRequest(BytesMut),
    ScrambleResponse(BytesMut),
    AuthSuccess,
}

impl Decoder for BackendAuth {
    type Item = AuthDecoderReturn;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let length = get_length(src);
        if src.len() < HEADER_LEN + length {
            return Ok(None);
        }

        self.seq = src[3];
        let mut payload = src.split_to(HEADER_LEN + length).split_off(HEADER_LEN);

        match self.state {
            AuthState::Connected => {
                self.read_initial_handshake(&mut payload)?;

                if self.tls_required && !self.tls_established {
                    Ok(Some(AuthDecoderReturn::SslRequest(self.ssl_request())))
                } else {
                    Ok(Some(AuthDecoderReturn::HandshakeResponse(self.auth_response())))
                }
            }

            AuthState::ResponseSent if payload.is_empty() => Err(ProtocolError::InvalidPacket {
                method: "auth decode".to_string(),
                data: vec![],
            }),

            AuthState::ResponseSent => match payload[0] {
                OK_HEADER => {
                    self.state = AuthState::Complete;
                    info!(
                        "authenticated against {} as {:?}",
                        self.server_version, self.creds.user
                    );
                    Ok(Some(AuthDecoderReturn::AuthSuccess))
                }

                ERR_HEADER => {
                    self.state = AuthState::Fail;
                    Err(self.server_error(&payload))
                }

                EOF_HEADER => {
                    let response = self.read_auth_switch(&payload)?;
                    Ok(Some(AuthDecoderReturn::ScrambleResponse(response)))
                }

                _ => Err(ProtocolError::InvalidPacket {
                    method: "auth decode".to_string(),
                    data: payload.to_vec(),
                }),
            },

            _ => Ok(None),
        }
    }
}

impl Encoder<BytesMut> for BackendAuth {
    type Error = ProtocolError;

    fn encode(&mut self, item: BytesMut, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let length = item.len();
        self.seq = self.seq.wrapping_add(1);

        dst.reserve(HEADER_LEN + length);
        dst.put_u8(length as u8);
        dst.put_u8((length >> 8) as u8);
        dst.put_u8((length >> 16) as u8);
        dst.put_u8(self.seq);
        dst.extend_from_slice(&item);

        if self.state == AuthState::Connected && (!self.tls_required || self.tls_established) {
            self.state = AuthState::ResponseSent;
        }

        Ok(())
    }
}

/// Drive the handshake to completion over a plain channel. The returned
/// framed codec is in `Complete` state and still carries the scramble, the
/// negotiated capabilities and the read buffer with any pipelined bytes.
pub async fn handshake<S>(
    mut framed: Framed<S, BackendAuth>,
) -> Result<Framed<S, BackendAuth>, ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        match framed.next().await {
            Some(Ok(AuthDecoderReturn::HandshakeResponse(data)))
            | Some(Ok(AuthDecoderReturn::SslRequest(data)))
            | Some(Ok(AuthDecoderReturn::ScrambleResponse(data))) => framed.send(data).await?,

            Some(Ok(AuthDecoderReturn::AuthSuccess)) => return Ok(framed),

            Some(Err(e)) => return Err(e),

            None => {
                framed.codec_mut().state = AuthState::Fail;
                return Err(ProtocolError::UnexpectedEof);
            }
        }
    }
}

fn nul_position(data: &BytesMut, method: &str) -> Result<usize, ProtocolError> {
    data.iter().position(|&x| x == 0x00).ok_or_else(|| ProtocolError::InvalidPacket {
        method: method.to_string(),
        data: data.to_vec(),
    })
}
