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

use std::{
    io,
    net::SocketAddr,
    ops::{Deref, DerefMut},
    str,
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::{BufMut, BytesMut};
use futures::SinkExt;
use tokio::{io::AsyncWriteExt, net::TcpStream, sync::mpsc};
use tokio_stream::StreamExt;
use tokio_util::codec::{Framed, FramedParts};
use tracing::{debug, error, info};

use super::{
    auth::{handshake, AuthState, BackendAuth, MaintenanceEvent},
    reply::{Reply, ResponseCodec, ServerError, SubmissionFlags},
};
use crate::{
    err::ProtocolError,
    mysql_const::*,
    packet::{com_quit_packet, ping_packet},
    proxy_header::proxy_protocol_header,
    session::{AuthToken, SessionCreds},
    util::scramble_password,
};

/// Where completed reply traffic goes: the router's upstream side.
pub trait PacketSink {
    fn deliver(&mut self, frame: BytesMut, reply: &Reply);
}

/// Connection settings a service hands to every backend it opens.
#[derive(Debug, Clone)]
pub struct BackendOpt {
    pub endpoint: String,
    /// Original client address, announced with a proxy protocol header.
    pub client_addr: Option<SocketAddr>,
    pub proxy_protocol: bool,
    /// Pooled connections swallow COM_QUIT so they stay reusable.
    pub persistent: bool,
    pub session_track: bool,
    /// Idle time after which `ping` emits a keepalive.
    pub ping_interval: Duration,
}

impl Default for BackendOpt {
    fn default() -> Self {
        BackendOpt {
            endpoint: String::new(),
            client_addr: None,
            proxy_protocol: false,
            persistent: false,
            session_track: false,
            ping_interval: Duration::from_secs(300),
        }
    }
}

/// The codec a backend connection is framed with: authentication first,
/// reply tracking for the rest of its life.
#[derive(Debug)]
pub enum BackendCodec {
    Auth(Framed<TcpStream, BackendAuth>),
    Response(Framed<TcpStream, ResponseCodec>),
}

impl BackendCodec {
    /// Swap the authentication codec for the reply tracker, keeping the
    /// stream and any bytes the server already pipelined.
    pub fn into_response(self) -> Framed<TcpStream, ResponseCodec> {
        match self {
            BackendCodec::Auth(framed) => {
                let parts = framed.into_parts();
                let mut new_parts = FramedParts::new::<(BytesMut, SubmissionFlags)>(
                    parts.io,
                    ResponseCodec::with_auth(parts.codec),
                );
                new_parts.read_buf = parts.read_buf;
                new_parts.write_buf = parts.write_buf;
                Framed::from_parts(new_parts)
            }
            BackendCodec::Response(framed) => framed,
        }
    }
}

// Handshake outcome stays reachable whichever codec is active.
impl Deref for BackendCodec {
    type Target = BackendAuth;

    fn deref(&self) -> &Self::Target {
        match self {
            BackendCodec::Auth(framed) => framed.codec(),
            BackendCodec::Response(framed) => framed.codec().auth.as_ref().unwrap(),
        }
    }
}

impl DerefMut for BackendCodec {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match self {
            BackendCodec::Auth(framed) => framed.codec_mut(),
            BackendCodec::Response(framed) => framed.codec_mut().auth.as_mut().unwrap(),
        }
    }
}

/// Build a COM_CHANGE_USER packet for the given credentials, scrambling the
/// password with the scramble this connection captured when it first
/// authenticated.
pub fn change_user_packet(creds: &SessionCreds, scramble: &[u8; SCRAMBLE_LEN]) -> BytesMut {
    let mut payload = BytesMut::with_capacity(128);

    payload.put_u8(COM_CHANGE_USER);
    payload.put_slice(creds.user.as_bytes());
    payload.put_u8(0x00);

    match &creds.auth {
        AuthToken::Sha1(token) => {
            payload.put_u8(SCRAMBLE_LEN as u8);
            payload.put_slice(&scramble_password(scramble, token));
        }
        AuthToken::None => payload.put_u8(0x00),
    }

    payload.put_slice(creds.db.as_bytes());
    payload.put_u8(0x00);
    payload.put_u16_le(creds.charset as u16);
    payload.put_slice(AUTH_NATIVE_PASSWORD.as_bytes());
    payload.put_u8(0x00);
    payload.put_slice(&creds.connect_attrs);

    let mut frame = BytesMut::with_capacity(HEADER_LEN + payload.len());
    frame.put_u8(payload.len() as u8);
    frame.put_u8((payload.len() >> 8) as u8);
    frame.put_u8((payload.len() >> 16) as u8);
    frame.put_u8(0x00);
    frame.extend_from_slice(&payload);
    frame
}

/// One connection to a backend server, owned by a single worker.
///
/// Client packets written before authentication completes wait in the delay
/// queue; packets written while a COM_CHANGE_USER is outstanding wait in the
/// stored query slot. Neither is ever reordered.
#[derive(Debug)]
pub struct BackendConn {
    framed: Option<Box<BackendCodec>>,
    creds: Arc<SessionCreds>,
    opt: BackendOpt,
    scramble: [u8; SCRAMBLE_LEN],
    delay_queue: Vec<(BytesMut, SubmissionFlags)>,
    stored_query: Option<BytesMut>,
    last_activity: Instant,
    maint_tx: Option<mpsc::UnboundedSender<MaintenanceEvent>>,
}

impl BackendConn {
    pub fn new(creds: Arc<SessionCreds>, opt: BackendOpt) -> BackendConn {
        BackendConn {
            framed: None,
            creds,
            opt,
            scramble: [0; SCRAMBLE_LEN],
            delay_queue: Vec::new(),
            stored_query: None,
            last_activity: Instant::now(),
            maint_tx: None,
        }
    }

    pub fn with_maintenance_sender(mut self, tx: mpsc::UnboundedSender<MaintenanceEvent>) -> Self {
        self.maint_tx = Some(tx);
        self
    }

    pub fn auth_state(&self) -> AuthState {
        match &self.framed {
            Some(codec) => codec.state,
            None => AuthState::Connected,
        }
    }

    /// Ready for application traffic: authenticated, nothing ignorable in
    /// flight and no stored query waiting.
    pub fn established(&self) -> bool {
        self.auth_state().is_complete()
            && self.ignore_pending() == 0
            && self.stored_query.is_none()
    }

    pub fn reply(&self) -> Option<&Reply> {
        match self.framed.as_deref() {
            Some(BackendCodec::Response(framed)) => Some(framed.codec().reply()),
            _ => None,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.opt.endpoint
    }

    /// Open the socket, run the handshake and flush anything the client
    /// wrote while authentication was pending.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        let mut sock = TcpStream::connect(&self.opt.endpoint).await?;
        sock.set_nodelay(true)?;

        // The proxy header goes out before any MySQL bytes
        if self.opt.proxy_protocol {
            if let Some(client) = self.opt.client_addr {
                let header = proxy_protocol_header(client, sock.local_addr()?);
                info!("sending proxy protocol header {:?} to {}", header.trim_end(), self.opt.endpoint);
                sock.write_all(header.as_bytes()).await?;
            }
        }

        let mut auth =
            BackendAuth::new(self.creds.clone()).with_session_track(self.opt.session_track);
        if let Some(tx) = &self.maint_tx {
            auth = auth.with_maintenance_sender(tx.clone());
        }

        let framed = handshake(Framed::with_capacity(sock, auth, 16384)).await?;
        self.scramble = framed.codec().scramble;

        let framed = BackendCodec::Auth(framed).into_response();
        self.framed = Some(Box::new(BackendCodec::Response(framed)));
        self.last_activity = Instant::now();

        let queued = std::mem::take(&mut self.delay_queue);
        for (frame, flags) in queued {
            debug!("flushing delayed command 0x{:02x}", frame.get(4).copied().unwrap_or(0));
            self.send_frame(frame, flags).await?;
        }

        Ok(())
    }

    /// Submit one complete client packet toward the backend.
    pub async fn write(
        &mut self,
        frame: BytesMut,
        flags: SubmissionFlags,
    ) -> Result<(), ProtocolError> {
        if self.ignore_pending() > 0 {
            // Reauthentication still in flight
            if frame.get(HEADER_LEN) == Some(&COM_QUIT) {
                info!("quit received during reauthentication, closing pooled connection");
                self.framed = None;
                return Ok(());
            }

            debug!("reauthentication in progress, storing query");
            match &mut self.stored_query {
                Some(stored) => stored.extend_from_slice(&frame),
                None => self.stored_query = Some(frame),
            }
            return Ok(());
        }

        if self.framed.is_none() {
            // Authentication has not finished; hold the packet
            self.delay_queue.push((frame, flags));
            return Ok(());
        }

        if frame.get(HEADER_LEN) == Some(&COM_QUIT) && self.opt.persistent {
            // Keep pooled connections alive
            return Ok(());
        }

        self.send_frame(frame, flags).await
    }

    /// Read server packets and hand them upstream until the current reply
    /// completes. Ignorable replies on the way are consumed silently.
    pub async fn relay_reply<S: PacketSink>(&mut self, sink: &mut S) -> Result<(), ProtocolError> {
        let mut collected = BytesMut::new();

        loop {
            let (frame, complete) = match self.response_framed()?.next().await {
                Some(Ok(item)) => item,
                Some(Err(e)) => {
                    self.fail_reply("Lost connection to backend server");
                    return Err(e);
                }
                None => {
                    self.fail_reply("Lost connection to backend server");
                    return Err(ProtocolError::UnexpectedEof);
                }
            };

            self.last_activity = Instant::now();
            let codec = self.response_codec()?;

            if codec.ignore_pending() > 0 {
                debug!("discarding reply to an ignorable command");
                codec.consume_ignored();
                continue;
            }

            if codec.collects_result() {
                collected.extend_from_slice(&frame);
                if complete {
                    let reply = self.reply().unwrap();
                    sink.deliver(collected, reply);
                    return Ok(());
                }
            } else {
                let reply = self.response_framed()?.codec().reply();
                sink.deliver(frame, reply);
                if complete {
                    return Ok(());
                }
            }
        }
    }

    /// Reauthenticate the pooled connection as another user with
    /// COM_CHANGE_USER, using the scramble captured at connect time. Returns
    /// the final response packet, its sequence normalized to 3 the way
    /// client connectors expect it.
    pub async fn change_user(
        &mut self,
        creds: Arc<SessionCreds>,
    ) -> Result<BytesMut, ProtocolError> {
        self.creds = creds.clone();

        let packet = change_user_packet(&creds, &self.scramble);
        {
            let framed = self.response_framed()?;
            framed.codec_mut().changing_user = true;
            framed.codec_mut().ignore_next_reply();
            framed.get_mut().write_all(&packet).await?;
        }
        info!("sent COM_CHANGE_USER for {:?}", creds.user);

        loop {
            let mut frame = match self.response_framed()?.next().await {
                Some(Ok((frame, _))) => frame,
                Some(Err(e)) => {
                    self.fail_reply("Lost connection to backend server");
                    return Err(e);
                }
                None => {
                    self.fail_reply("Lost connection to backend server");
                    return Err(ProtocolError::UnexpectedEof);
                }
            };

            self.response_codec()?.consume_ignored();
            let cmd = frame.get(HEADER_LEN).copied().unwrap_or(0);

            match cmd {
                OK_HEADER => {
                    // Sequence normalized for connector compatibility
                    frame[3] = 0x03;
                    self.response_codec()?.changing_user = false;

                    if let Some(stored) = self.stored_query.take() {
                        info!("reauthentication done, writing stored query");
                        self.send_frame(stored, SubmissionFlags::default()).await?;
                    }

                    return Ok(frame);
                }

                EOF_HEADER if frame.len() > HEADER_LEN + EOF_PACKET_LEN => {
                    // Auth switch to the plugin already in use: the request
                    // only renews the scramble
                    let response = self.reauth_response(&frame[HEADER_LEN + 1..])?;
                    let framed = self.response_framed()?;
                    framed.codec_mut().ignore_next_reply();
                    framed.get_mut().write_all(&response).await?;
                }

                ERR_HEADER => {
                    let err = ServerError::decode(&frame[HEADER_LEN + 1..]);
                    error!("COM_CHANGE_USER failed: {}", err);
                    self.stored_query = None;
                    self.framed = None;

                    if err.code == ER_HOST_IS_BLOCKED {
                        if let Some(tx) = &self.maint_tx {
                            let _ = tx.send(MaintenanceEvent { error: err.clone() });
                        }
                        return Err(ProtocolError::HostBlocked(err));
                    }
                    return Err(ProtocolError::AuthFailed(err));
                }

                other => {
                    error!("unknown response to COM_CHANGE_USER (0x{:02x}), closing", other);
                    self.stored_query = None;
                    self.framed = None;
                    return Err(ProtocolError::InvalidPacket {
                        method: "change_user".to_string(),
                        data: frame.to_vec(),
                    });
                }
            }
        }
    }

    /// Keep an idle pooled connection warm. Only pings when the last reply
    /// is fully delivered and the connection has been quiet long enough.
    pub async fn ping(&mut self) -> Result<bool, ProtocolError> {
        let done = self.reply().map(|r| r.is_complete()).unwrap_or(false);
        if !done || self.last_activity.elapsed() < self.opt.ping_interval {
            return Ok(false);
        }

        info!("pinging {}, idle for {:?}", self.opt.endpoint, self.last_activity.elapsed());

        let framed = self.response_framed()?;
        framed.codec_mut().ignore_next_reply();
        framed.get_mut().write_all(&ping_packet()).await?;
        self.last_activity = Instant::now();
        Ok(true)
    }

    /// Say goodbye to the server. Pooled connections skip the COM_QUIT so
    /// they stay usable.
    pub async fn quit(mut self) -> Result<(), ProtocolError> {
        if self.opt.persistent {
            return Ok(());
        }

        if let Ok(framed) = self.response_framed() {
            framed.get_mut().write_all(&com_quit_packet(0)).await?;
        }
        self.framed = None;
        Ok(())
    }

    /// The reactor reported the transport gone; synthesize the error the
    /// router will forward.
    pub fn connection_lost(&mut self) {
        self.fail_reply("Lost connection to backend server");
    }

    fn fail_reply(&mut self, message: &str) {
        if let Ok(codec) = self.response_codec() {
            codec.connection_lost(message);
        }
    }

    // Build the scrambled password packet answering an AuthSwitchRequest
    // during COM_CHANGE_USER. `payload` starts after the 0xfe byte.
    fn reauth_response(&mut self, payload: &[u8]) -> Result<BytesMut, ProtocolError> {
        let pos = payload.iter().position(|&x| x == 0x00).ok_or_else(|| {
            ProtocolError::InvalidPacket {
                method: "reauth_response".to_string(),
                data: payload.to_vec(),
            }
        })?;

        let plugin = str::from_utf8(&payload[..pos]).unwrap_or_default();
        if plugin != AUTH_NATIVE_PASSWORD {
            error!("auth switch to {:?} when {} was expected", plugin, AUTH_NATIVE_PASSWORD);
            self.stored_query = None;
            self.framed = None;
            return Err(ProtocolError::AuthPluginUnsupported(plugin.to_string()));
        }

        let salt = &payload[pos + 1..];
        if salt.len() < SCRAMBLE_LEN {
            return Err(ProtocolError::InvalidPacket {
                method: "reauth_response".to_string(),
                data: payload.to_vec(),
            });
        }
        self.scramble.copy_from_slice(&salt[..SCRAMBLE_LEN]);

        let mut body = BytesMut::new();
        if let AuthToken::Sha1(token) = &self.creds.auth {
            body.put_slice(&scramble_password(&self.scramble, token));
        }

        // Third packet of the exchange
        let mut frame = BytesMut::with_capacity(HEADER_LEN + body.len());
        frame.put_u8(body.len() as u8);
        frame.put_u8((body.len() >> 8) as u8);
        frame.put_u8((body.len() >> 16) as u8);
        frame.put_u8(0x03);
        frame.extend_from_slice(&body);
        Ok(frame)
    }

    async fn send_frame(
        &mut self,
        frame: BytesMut,
        flags: SubmissionFlags,
    ) -> Result<(), ProtocolError> {
        self.last_activity = Instant::now();
        self.response_framed()?.send((frame, flags)).await
    }

    fn ignore_pending(&self) -> u32 {
        match self.framed.as_deref() {
            Some(BackendCodec::Response(framed)) => framed.codec().ignore_pending(),
            _ => 0,
        }
    }

    fn response_framed(&mut self) -> Result<&mut Framed<TcpStream, ResponseCodec>, ProtocolError> {
        match self.framed.as_deref_mut() {
            Some(BackendCodec::Response(framed)) => Ok(framed),
            _ => Err(ProtocolError::Io(io::Error::new(
                io::ErrorKind::NotConnected,
                "backend connection is not established",
            ))),
        }
    }

    fn response_codec(&mut self) -> Result<&mut ResponseCodec, ProtocolError> {
        Ok(self.response_framed()?.codec_mut())
    }
}
