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

use iota::iota;

pub const MIN_PROTOCOL_VERSION: u8 = 10;
pub const MAX_PAYLOAD_LEN: usize = (1 << 24) - 1;
pub const MAX_PACKET_SIZE: u32 = 1 << 24;

pub const HEADER_LEN: usize = 4;
pub const SCRAMBLE_LEN: usize = 20;
pub const SCRAMBLE_LEN_323: usize = 8;
pub const EOF_PACKET_LEN: usize = 5;
pub const OK_PACKET_MIN_LEN: usize = 7;

pub const OK_HEADER: u8 = 0x00;
pub const ERR_HEADER: u8 = 0xff;
pub const EOF_HEADER: u8 = 0xfe;
pub const LOCALINFILE_HEADER: u8 = 0xfb;

/// Server error that means the backend has started refusing connections
/// from this host. The affected server must be taken out of rotation.
pub const ER_HOST_IS_BLOCKED: u16 = 1129;
/// Error code used for errors the gateway fabricates itself.
pub const ER_CONNECTION_FAILED: u16 = 2003;

pub const SERVER_MORE_RESULTS_EXISTS: u16 = 0x0008;
pub const SERVER_SESSION_STATE_CHANGED: u16 = 0x4000;

pub const AUTH_MYSQL_OLD_PASSWORD: &str = "mysql_old_password";
pub const AUTH_NATIVE_PASSWORD: &str = "mysql_native_password";

iota! {
    pub const COM_SLEEP :u8 = iota;
         ,COM_QUIT
         ,COM_INIT_DB
         ,COM_QUERY
         ,COM_FIELD_LIST
         ,COM_CREATE_DB
         ,COM_DROP_DB
         ,COM_REFRESH
         ,COM_SHUTDOWN
         ,COM_STATISTICS
         ,COM_PROCESS_INFO
         ,COM_CONNECT
         ,COM_PROCESS_KILL
         ,COM_DEBUG
         ,COM_PING
         ,COM_TIME
         ,COM_DELAYED_INSERT
         ,COM_CHANGE_USER
         ,COM_BINLOG_DUMP
         ,COM_TABLE_DUMP
         ,COM_CONNECT_OUT
         ,COM_REGISTER_SLAVE
         ,COM_STMT_PREPARE
         ,COM_STMT_EXECUTE
         ,COM_STMT_SEND_LONG_DATA
         ,COM_STMT_CLOSE
         ,COM_STMT_RESET
         ,COM_SET_OPTION
         ,COM_STMT_FETCH
         ,COM_DAEMON
         ,COM_BINLOG_DUMP_GTID
         ,COM_RESET_CONNECTION
}

iota! {
    pub const CLIENT_LONG_PASSWORD: u32 = 1 << iota;
         ,CLIENT_FOUND_ROWS
         ,CLIENT_LONG_FLAG
         ,CLIENT_CONNECT_WITH_DB
         ,CLIENT_NO_SCHEMA
         ,CLIENT_COMPRESS
         ,CLIENT_ODBC
         ,CLIENT_LOCAL_FILES
         ,CLIENT_IGNORE_SPACE
         ,CLIENT_PROTOCOL_41
         ,CLIENT_INTERACTIVE
         ,CLIENT_SSL
         ,CLIENT_IGNORE_SIGPIPE
         ,CLIENT_TRANSACTIONS
         ,CLIENT_RESERVED
         ,CLIENT_SECURE_CONNECTION
         ,CLIENT_MULTI_STATEMENTS
         ,CLIENT_MULTI_RESULTS
         ,CLIENT_PS_MULTI_RESULTS
         ,CLIENT_PLUGIN_AUTH
         ,CLIENT_CONNECT_ATTRS
         ,CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA
         ,CLIENT_CAN_HANDLE_EXPIRED_PASSWORDS
         ,CLIENT_SESSION_TRACK
         ,CLIENT_DEPRECATE_EOF
}

/// Client capability bits the gateway is willing to forward to a backend.
/// Everything else the client may have asked for is masked out.
pub const CLIENT_CAPABILITIES_MASK: u32 = CLIENT_LONG_PASSWORD
    | CLIENT_FOUND_ROWS
    | CLIENT_LONG_FLAG
    | CLIENT_CONNECT_WITH_DB
    | CLIENT_LOCAL_FILES
    | CLIENT_IGNORE_SPACE
    | CLIENT_PROTOCOL_41
    | CLIENT_INTERACTIVE
    | CLIENT_TRANSACTIONS
    | CLIENT_SECURE_CONNECTION
    | CLIENT_MULTI_STATEMENTS
    | CLIENT_MULTI_RESULTS
    | CLIENT_PS_MULTI_RESULTS
    | CLIENT_PLUGIN_AUTH
    | CLIENT_CONNECT_ATTRS
    | CLIENT_SESSION_TRACK
    | CLIENT_DEPRECATE_EOF;

/// Whether the backend will send a response packet for the given command.
/// Commands without a response never arm the reply tracker.
pub fn command_will_respond(cmd: u8) -> bool {
    !matches!(cmd, COM_QUIT | COM_STMT_SEND_LONG_DATA | COM_STMT_CLOSE)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_command_values() {
        assert_eq!(COM_QUERY, 0x03);
        assert_eq!(COM_CHANGE_USER, 0x11);
        assert_eq!(COM_STMT_PREPARE, 0x16);
        assert_eq!(COM_STMT_FETCH, 0x1c);
    }

    #[test]
    fn test_capability_values() {
        assert_eq!(CLIENT_PROTOCOL_41, 1 << 9);
        assert_eq!(CLIENT_SESSION_TRACK, 1 << 23);
        assert_eq!(CLIENT_DEPRECATE_EOF, 1 << 24);
    }

    #[test]
    fn test_silent_commands() {
        assert!(!command_will_respond(COM_QUIT));
        assert!(!command_will_respond(COM_STMT_CLOSE));
        assert!(command_will_respond(COM_QUERY));
        assert!(command_will_respond(COM_STMT_FETCH));
    }
}
