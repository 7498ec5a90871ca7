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

use std::io;

use thiserror::Error;

use crate::backend::reply::ServerError;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProtocolError {
    /// The server answered the connection attempt with an error packet
    /// before the handshake completed.
    #[error("handshake failed: {0}")]
    HandshakeFailed(ServerError),

    #[error("unsupported protocol version {0}")]
    ProtocolVersion(u8),

    #[error("invalid scramble length {0} in server handshake")]
    ScrambleLength(usize),

    #[error("mysql server can not support protocol 41 required by the gateway")]
    ServerProtocolVersion,

    /// The server rejected the authentication response.
    #[error("authentication failed: {0}")]
    AuthFailed(ServerError),

    /// Error 1129: the backend is refusing connections from this host and
    /// has been flagged for maintenance.
    #[error("host blocked by backend: {0}")]
    HostBlocked(ServerError),

    #[error("unsupported auth plugin {0:?}")]
    AuthPluginUnsupported(String),

    #[error("method: {:?} invalid packet {:?}", .method, .data)]
    InvalidPacket { method: String, data: Vec<u8> },

    #[error("connection closed while a reply was outstanding")]
    UnexpectedEof,

    #[error("stdio error: {0:?}")]
    Io(#[from] io::Error),
}
