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

use std::net::SocketAddr;

/// Worst case text header length defined by the proxy protocol.
const MAX_HEADER_LEN: usize = 107;

/// Build the proxy protocol v1 text header announcing the original client
/// address to the backend. Sent before any MySQL bytes. Address families
/// that do not match, or anything that is not plain TCP, degrade to the
/// UNKNOWN form which backends accept and ignore.
pub fn proxy_protocol_header(client: SocketAddr, gateway: SocketAddr) -> String {
    let header = match (client, gateway) {
        (SocketAddr::V4(c), SocketAddr::V4(g)) => {
            format!("PROXY TCP4 {} {} {} {}\r\n", c.ip(), g.ip(), c.port(), g.port())
        }
        (SocketAddr::V6(c), SocketAddr::V6(g)) => {
            format!("PROXY TCP6 {} {} {} {}\r\n", c.ip(), g.ip(), c.port(), g.port())
        }
        _ => "PROXY UNKNOWN\r\n".to_string(),
    };

    debug_assert!(header.len() <= MAX_HEADER_LEN);
    header
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_tcp4_header() {
        let client: SocketAddr = "192.168.0.1:56324".parse().unwrap();
        let gateway: SocketAddr = "10.0.0.2:3306".parse().unwrap();

        assert_eq!(
            proxy_protocol_header(client, gateway),
            "PROXY TCP4 192.168.0.1 10.0.0.2 56324 3306\r\n"
        );
    }

    #[test]
    fn test_tcp6_header() {
        let client: SocketAddr = "[2001:db8::1]:4000".parse().unwrap();
        let gateway: SocketAddr = "[::1]:3306".parse().unwrap();

        assert_eq!(
            proxy_protocol_header(client, gateway),
            "PROXY TCP6 2001:db8::1 ::1 4000 3306\r\n"
        );
    }

    #[test]
    fn test_mixed_families_degrade_to_unknown() {
        let client: SocketAddr = "192.168.0.1:56324".parse().unwrap();
        let gateway: SocketAddr = "[::1]:3306".parse().unwrap();

        assert_eq!(proxy_protocol_header(client, gateway), "PROXY UNKNOWN\r\n");
    }

    #[test]
    fn test_header_fits_length_limit() {
        // Worst case IPv6 textual form on both sides
        let client: SocketAddr =
            "[ffff:ffff:ffff:ffff:ffff:ffff:ffff:ffff]:65535".parse().unwrap();
        let gateway: SocketAddr =
            "[ffff:ffff:ffff:ffff:ffff:ffff:ffff:ffff]:65535".parse().unwrap();

        assert!(proxy_protocol_header(client, gateway).len() <= MAX_HEADER_LEN);
    }
}
