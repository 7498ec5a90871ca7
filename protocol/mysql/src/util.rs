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

use bytes::{Buf, BufMut, BytesMut};
use rand::{rngs::StdRng, Rng, SeedableRng};
use sha1::{Digest, Sha1};

use crate::mysql_const::{EOF_HEADER, OK_HEADER, OK_PACKET_MIN_LEN, SCRAMBLE_LEN};

// random_buf: generate a random byte vector without NUL or '$' bytes
#[inline]
pub fn random_buf(size: usize, seed: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(size);
    let mut r = StdRng::seed_from_u64(seed);

    for _ in 0..size {
        let mut b: u8 = r.gen_range(0..127);
        if b == 0 || b as char == '$' {
            b += 1;
        }
        buf.push(b);
    }
    buf
}

/// Scramble the cached password token for `mysql_native_password`.
///
/// `token` is SHA1(password), captured when the client authenticated. The
/// cleartext password is never available. The wire response is
/// `token XOR SHA1(scramble + SHA1(token))`.
pub fn scramble_password(scramble: &[u8], token: &[u8]) -> [u8; SCRAMBLE_LEN] {
    let stage2 = Sha1::digest(token);

    let mut hasher = Sha1::new();
    hasher.update(&scramble[..SCRAMBLE_LEN]);
    hasher.update(stage2);
    let mix = hasher.finalize();

    let mut out = [0u8; SCRAMBLE_LEN];
    for i in 0..SCRAMBLE_LEN {
        out[i] = token[i] ^ mix[i];
    }
    out
}

/// SHA1 of a cleartext password, the token cached per session.
pub fn password_token(password: &[u8]) -> [u8; SCRAMBLE_LEN] {
    Sha1::digest(password).into()
}

/// Cursor-style accessors over any `Buf`. Reading advances the cursor, so a
/// `&mut &[u8]` walks a packet payload the same way a `BytesMut` does.
pub trait BufExt: Buf {
    fn get_lenc_int(&mut self) -> (u64, bool, u64) {
        let first = self.get_u8();
        match first {
            0xfb => (0, true, 1),
            0xfc => (self.get_uint_le(2), false, 3),
            0xfd => (self.get_uint_le(3), false, 4),
            0xfe => (self.get_uint_le(8), false, 9),
            _ => (first as u64, false, 1),
        }
    }

    fn skip_lenc_int(&mut self) {
        match self.get_u8() {
            0xfc => self.advance(2),
            0xfd => self.advance(3),
            0xfe => self.advance(8),
            _ => {}
        }
    }

    fn get_lenc_str_bytes(&mut self) -> (Vec<u8>, bool) {
        let (num, is_null, _) = self.get_lenc_int();

        if num == 0 || self.remaining() < num as usize {
            return (vec![], is_null);
        }

        let mut out = vec![0; num as usize];
        self.copy_to_slice(&mut out);
        (out, is_null)
    }

    fn skip_lenc_str(&mut self) {
        let (num, _, _) = self.get_lenc_int();
        self.advance(num as usize)
    }

    fn get_lenc_str(&mut self) -> String {
        let (bytes, _) = self.get_lenc_str_bytes();
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

impl<T: Buf> BufExt for T {}

pub trait BufMutExt: BufMut {
    fn put_lenc_int(&mut self, n: u64) {
        if n <= 250 {
            self.put_u8(n as u8);
        } else if n <= 0xffff {
            self.put_u8(0xfc);
            self.put_uint_le(n, 2);
        } else if n <= 0xffffff {
            self.put_u8(0xfd);
            self.put_uint_le(n, 3);
        } else {
            self.put_u8(0xfe);
            self.put_uint_le(n, 8);
        }
    }

    fn put_lenc_str(&mut self, s: &[u8]) {
        self.put_lenc_int(s.len() as u64);
        self.put_slice(s);
    }
}

impl BufMutExt for Vec<u8> {}
impl BufMutExt for BytesMut {}

/// EOF detection compatible with DEPRECATE_EOF: a real EOF packet is at most
/// 5 bytes of payload, while a 0xfe lead byte on a longer payload is either a
/// lenenc integer or an OK-shaped terminator.
#[inline]
pub fn is_eof_packet(payload: &[u8]) -> bool {
    !payload.is_empty() && payload[0] == EOF_HEADER && payload.len() < 9
}

#[inline]
pub fn is_ok_packet(payload: &[u8]) -> bool {
    payload.len() >= OK_PACKET_MIN_LEN && payload[0] == OK_HEADER
}

#[inline]
pub fn get_length(buf: &[u8]) -> usize {
    buf[0] as usize | (buf[1] as usize) << 8 | (buf[2] as usize) << 16
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_buf_length_enc_string() {
        let data = [0x04, 0x55, 0x73, 0x65, 0x72];
        let mut buf = &data[..];

        let (info, _is_null) = buf.get_lenc_str_bytes();
        let name = std::str::from_utf8(&info).unwrap();
        assert_eq!(name, "User");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_lenc_int_widths() {
        let mut one = &[0x21u8][..];
        assert_eq!(one.get_lenc_int(), (0x21, false, 1));

        let mut two = &[0xfcu8, 0x34, 0x12][..];
        assert_eq!(two.get_lenc_int(), (0x1234, false, 3));

        let mut three = &[0xfdu8, 0x56, 0x34, 0x12][..];
        assert_eq!(three.get_lenc_int(), (0x123456, false, 4));

        let mut eight = &[0xfeu8, 1, 0, 0, 0, 0, 0, 0, 0][..];
        assert_eq!(eight.get_lenc_int(), (1, false, 9));

        let mut null = &[0xfbu8][..];
        assert_eq!(null.get_lenc_int(), (0, true, 1));
    }

    #[test]
    fn test_lenc_skippers() {
        let data = [0xfcu8, 0x34, 0x12, 0x03, b'a', b'b', b'c', 0x07];
        let mut cur = &data[..];
        cur.skip_lenc_int();
        cur.skip_lenc_str();
        assert_eq!(cur, &[0x07][..]);
    }

    #[test]
    fn test_put_lenc_int_round_trip() {
        for n in [0u64, 250, 251, 0xffff, 0x10000, 0xffffff, 0x1000000] {
            let mut buf = Vec::new();
            buf.put_lenc_int(n);
            let mut cur = &buf[..];
            assert_eq!(cur.get_lenc_int().0, n);
        }
    }

    #[test]
    fn test_ok_eof_detection() {
        assert!(is_ok_packet(&[0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00]));
        assert!(!is_ok_packet(&[0x00, 0x00, 0x00]));
        assert!(is_eof_packet(&[0xfe, 0x00, 0x00, 0x02, 0x00]));
        // A 0xfe lead byte on a long payload is a lenenc integer, not EOF
        assert!(!is_eof_packet(&[0xfe, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0]));
    }

    // The scramble must equal token XOR SHA1(scramble + SHA1(token)), checked
    // against one-shot digests computed independently of the incremental path.
    #[test]
    fn test_scramble_password() {
        let token = password_token(b"secret");
        assert_eq!(
            hex(&token),
            "e5e9fa1ba31ecd1ae84f75caaa474f3a663f05f4",
        );

        let salt = random_buf(20, 0x5eed);
        let out = scramble_password(&salt, &token);
        assert_eq!(out.len(), 20);

        let stage2 = Sha1::digest(token);
        let mut concat = Vec::new();
        concat.extend_from_slice(&salt);
        concat.extend_from_slice(&stage2);
        let mix = Sha1::digest(&concat);

        for i in 0..20 {
            assert_eq!(out[i], token[i] ^ mix[i]);
        }

        // Deterministic for fixed inputs
        assert_eq!(out, scramble_password(&salt, &token));
    }

    #[test]
    fn test_random_buf_excludes_separators() {
        let buf = random_buf(64, 7);
        assert_eq!(buf.len(), 64);
        assert!(buf.iter().all(|&b| b != 0 && b != b'$'));
    }

    fn hex(data: &[u8]) -> String {
        data.iter().map(|b| format!("{:02x}", b)).collect()
    }
}
