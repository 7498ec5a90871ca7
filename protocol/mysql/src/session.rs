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

use bitflags::bitflags;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

use crate::util::BufExt;

/// Password material carried by a session. The gateway only ever sees the
/// SHA1 of the password, recovered during client authentication; an account
/// without a password is an explicit variant rather than an all-zero buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthToken {
    None,
    Sha1([u8; 20]),
}

impl AuthToken {
    pub fn as_bytes(&self) -> Option<&[u8; 20]> {
        match self {
            AuthToken::None => None,
            AuthToken::Sha1(token) => Some(token),
        }
    }
}

impl Default for AuthToken {
    fn default() -> Self {
        AuthToken::None
    }
}

/// Credentials and negotiated client settings shared by every backend
/// connection of a session. Immutable once the client has authenticated.
#[derive(Debug, Clone, Default)]
pub struct SessionCreds {
    pub user: String,
    pub db: String,
    pub auth: AuthToken,
    pub charset: u8,
    /// Capability bits the client negotiated with the gateway.
    pub client_capability: u32,
    /// MariaDB extended capabilities advertised by the client, forwarded
    /// verbatim when the server also speaks them.
    pub extra_capability: u32,
    /// Raw connect attribute blob from the client handshake response.
    pub connect_attrs: Vec<u8>,
}

impl SessionCreds {
    pub fn new(user: impl Into<String>, db: impl Into<String>, auth: AuthToken) -> Self {
        SessionCreds { user: user.into(), db: db.into(), auth, ..Default::default() }
    }
}

#[derive(Debug, FromPrimitive)]
#[repr(u8)]
pub enum SessionStateType {
    SystemVariables,            // Session system variables
    Schema,                     // Current schema
    StateChange,                // Session state changes
    Gtids,                      // GTIDs
    TransactionCharacteristics, // Transaction characteristics
    TransactionState,           // Transaction state
}

/// One entry of the session tracking block inside an OK packet.
#[derive(Debug, PartialEq, Eq)]
pub enum SessionState {
    SystemVariables(Vec<(String, String)>),
    Schema(String),
    StateChange(bool),
    Gtids(String),
    TransactionCharacteristics(String),
    TransactionState(String),
    Unknown(u64),
}

impl SessionState {
    /// Decode a single `(type, length, body)` entry, advancing the cursor
    /// past it. Unknown types are skipped by their declared length so the
    /// entries that follow stay intact.
    pub fn decode(data: &mut &[u8]) -> SessionState {
        let (entry_type, _, _) = data.get_lenc_int();
        let (total_size, _, _) = data.get_lenc_int();

        // A declared size past the end of the block is a server bug; take
        // what is there so decoding cannot run off the buffer.
        let take = (total_size as usize).min(data.len());
        debug_assert_eq!(take, total_size as usize);
        let (mut payload, rest) = data.split_at(take);
        *data = rest;

        match FromPrimitive::from_u64(entry_type) {
            Some(SessionStateType::SystemVariables) => {
                let mut pairs = Vec::new();
                while !payload.is_empty() {
                    let name = payload.get_lenc_str();
                    let value = payload.get_lenc_str();
                    pairs.push((name, value))
                }

                SessionState::SystemVariables(pairs)
            }
            Some(SessionStateType::Schema) => SessionState::Schema(payload.get_lenc_str()),
            Some(SessionStateType::StateChange) => {
                SessionState::StateChange(payload.get_lenc_str() == "1")
            }
            Some(SessionStateType::Gtids) => {
                // The encoding specification byte is irrelevant here
                payload.skip_lenc_int();
                SessionState::Gtids(payload.get_lenc_str())
            }
            Some(SessionStateType::TransactionCharacteristics) => {
                SessionState::TransactionCharacteristics(payload.get_lenc_str())
            }
            Some(SessionStateType::TransactionState) => {
                SessionState::TransactionState(payload.get_lenc_str())
            }
            None => SessionState::Unknown(entry_type),
        }
    }
}

bitflags! {
    /// Transaction state reported via TRANSACTION_TYPE tracking. Decoded
    /// from the server's eight character state string.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TrxState: u16 {
        const EXPLICIT      = 0x0001;
        const IMPLICIT      = 0x0002;
        const READ_UNSAFE   = 0x0004;
        const READ_TRX      = 0x0008;
        const WRITE_UNSAFE  = 0x0010;
        const WRITE_TRX     = 0x0020;
        const STMT_UNSAFE   = 0x0040;
        const RESULT_SET    = 0x0080;
        const LOCKED_TABLES = 0x0100;
    }
}

impl TrxState {
    /// Parse the `T_RW_S_L` style string. Underscores mean "not set"; any
    /// unexpected character is ignored.
    pub fn parse(s: &str) -> TrxState {
        let mut state = TrxState::empty();
        for c in s.chars() {
            state |= match c {
                'T' => TrxState::EXPLICIT,
                'I' => TrxState::IMPLICIT,
                'r' => TrxState::READ_UNSAFE,
                'R' => TrxState::READ_TRX,
                'w' => TrxState::WRITE_UNSAFE,
                'W' => TrxState::WRITE_TRX,
                's' => TrxState::STMT_UNSAFE,
                'S' => TrxState::RESULT_SET,
                'L' => TrxState::LOCKED_TABLES,
                _ => TrxState::empty(),
            };
        }
        state
    }
}
