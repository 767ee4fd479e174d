// Copyright (C) 2025, Cloudflare, Inc.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions are
// met:
//
//     * Redistributions of source code must retain the above copyright notice,
//       this list of conditions and the following disclaimer.
//
//     * Redistributions in binary form must reproduce the above copyright
//       notice, this list of conditions and the following disclaimer in the
//       documentation and/or other materials provided with the distribution.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS "AS
// IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED TO,
// THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR
// PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER OR
// CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL,
// EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO,
// PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE, DATA, OR
// PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF
// LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING
// NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE OF THIS
// SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

//! Address-validation tokens.
//!
//! Two token flavors share one HMAC scheme: Retry tokens prove a fresh
//! address-validation round trip and embed the client's original DCID;
//! session tokens are handed out in NEW_TOKEN frames after a completed
//! handshake and embed only the client address. A magic byte distinguishes
//! them and a keying-material byte selects the secret generation, so tokens
//! minted before a secret rotation still validate.

use std::io;
use std::io::Write;
use std::net::SocketAddr;

use quiche::ConnectionId;

use crate::quic::cid::encode_addr;
use crate::quic::cid::KeyingMaterials;
use crate::result::QuicResultExt;

const HMAC_TAG_LEN: usize = 32;
const HEADER_LEN: usize = 2;

/// First byte of a token minted for a Retry packet.
const RETRY_TOKEN_MAGIC: u8 = 0xb6;
/// First byte of a token delivered via NEW_TOKEN.
const SESSION_TOKEN_MAGIC: u8 = 0x36;

/// Mints and validates address-validation tokens for one worker.
#[derive(Clone)]
pub(crate) struct AddrValidationTokenManager {
    keying: KeyingMaterials,
}

impl AddrValidationTokenManager {
    pub(crate) fn new(keying: KeyingMaterials) -> Self {
        AddrValidationTokenManager { keying }
    }

    fn gen(&self, magic: u8, payload: &[u8]) -> Vec<u8> {
        let km = self.keying.active();

        let token_len = HEADER_LEN + HMAC_TAG_LEN + payload.len();
        let mut token = io::Cursor::new(vec![0u8; token_len]);

        token.write_all(&[magic, km.id]).unwrap();
        token.set_position((HEADER_LEN + HMAC_TAG_LEN) as u64);
        token.write_all(payload).unwrap();

        let tag = boring::hash::hmac_sha256(
            &km.secret,
            &token.get_ref()[HEADER_LEN + HMAC_TAG_LEN..],
        )
        .unwrap();

        token.set_position(HEADER_LEN as u64);
        token.write_all(tag.as_ref()).unwrap();

        token.into_inner()
    }

    fn validate<'t>(
        &self, magic: u8, token: &'t [u8], client_addr: SocketAddr,
    ) -> io::Result<&'t [u8]> {
        let mut addr_bytes = Vec::with_capacity(18);
        encode_addr(&mut addr_bytes, client_addr);

        if token.len() < HEADER_LEN + HMAC_TAG_LEN + addr_bytes.len() {
            return Err("token is too short").into_io();
        }

        if token[0] != magic {
            return Err("unexpected token type").into_io();
        }

        let km = self
            .keying
            .select(token[1])
            .ok_or("unknown keying material")
            .into_io()?;

        let (tag, payload) = token[HEADER_LEN..].split_at(HMAC_TAG_LEN);

        let expected_tag =
            boring::hash::hmac_sha256(&km.secret, payload).unwrap();

        if !boring::memcmp::eq(&expected_tag, tag) {
            return Err("signature verification failed").into_io();
        }

        if payload[..addr_bytes.len()] != *addr_bytes {
            return Err("addresses don't match").into_io();
        }

        Ok(&payload[addr_bytes.len()..])
    }

    /// Mints a token for a Retry packet, binding `original_dcid` to the
    /// client address.
    pub(crate) fn gen_retry(
        &self, original_dcid: &[u8], client_addr: SocketAddr,
    ) -> Vec<u8> {
        let mut payload = Vec::with_capacity(18 + original_dcid.len());
        encode_addr(&mut payload, client_addr);
        payload.extend_from_slice(original_dcid);

        self.gen(RETRY_TOKEN_MAGIC, &payload)
    }

    /// Validates a Retry token and recovers the original DCID it embeds.
    pub(crate) fn validate_retry<'t>(
        &self, token: &'t [u8], client_addr: SocketAddr,
    ) -> io::Result<ConnectionId<'t>> {
        let rest = self.validate(RETRY_TOKEN_MAGIC, token, client_addr)?;
        Ok(ConnectionId::from_ref(rest))
    }

    /// Mints a token for a NEW_TOKEN frame, bound only to the client
    /// address.
    pub(crate) fn gen_session(&self, client_addr: SocketAddr) -> Vec<u8> {
        let mut payload = Vec::with_capacity(18);
        encode_addr(&mut payload, client_addr);

        self.gen(SESSION_TOKEN_MAGIC, &payload)
    }

    /// Validates a token presented in an Initial packet outside a Retry
    /// exchange.
    pub(crate) fn validate_session(
        &self, token: &[u8], client_addr: SocketAddr,
    ) -> io::Result<()> {
        self.validate(SESSION_TOKEN_MAGIC, token, client_addr)
            .map(|_| ())
    }

    /// Whether `token` looks like a Retry token (as opposed to a session
    /// token) without validating it.
    pub(crate) fn is_retry(token: &[u8]) -> bool {
        token.first() == Some(&RETRY_TOKEN_MAGIC)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::quic::cid::KeyingMaterial;

    fn manager() -> AddrValidationTokenManager {
        AddrValidationTokenManager::new(KeyingMaterials::generate())
    }

    #[test]
    fn retry_round_trip() {
        let manager = manager();

        let addr = "127.0.0.1:1337".parse().unwrap();
        let token = manager.gen_retry(b"foo", addr);

        assert!(AddrValidationTokenManager::is_retry(&token));
        assert_eq!(
            manager.validate_retry(&token, addr).unwrap(),
            ConnectionId::from_ref(b"foo")
        );

        let addr = "[::1]:1338".parse().unwrap();
        let token = manager.gen_retry(b"barbaz", addr);

        assert_eq!(
            manager.validate_retry(&token, addr).unwrap(),
            ConnectionId::from_ref(b"barbaz")
        );
    }

    #[test]
    fn session_round_trip() {
        let manager = manager();
        let addr = "127.0.0.1:1337".parse().unwrap();

        let token = manager.gen_session(addr);

        assert!(!AddrValidationTokenManager::is_retry(&token));
        assert!(manager.validate_session(&token, addr).is_ok());
    }

    #[test]
    fn flavors_do_not_cross_validate() {
        let manager = manager();
        let addr = "127.0.0.1:1337".parse().unwrap();

        let retry = manager.gen_retry(b"foo", addr);
        let session = manager.gen_session(addr);

        assert!(manager.validate_session(&retry, addr).is_err());
        assert!(manager.validate_retry(&session, addr).is_err());
    }

    #[test]
    fn validate_err_short_token() {
        let manager = manager();
        let v4_addr = "127.0.0.1:1337".parse().unwrap();
        let v6_addr = "[::1]:1338".parse().unwrap();

        for addr in [v4_addr, v6_addr] {
            assert!(manager.validate_retry(b"", addr).is_err());
            assert!(manager
                .validate_retry(&[RETRY_TOKEN_MAGIC; HMAC_TAG_LEN], addr)
                .is_err());
        }
    }

    #[test]
    fn validate_err_addr_mismatch() {
        let manager = manager();

        let token = manager.gen_retry(b"foo", "127.0.0.1:1337".parse().unwrap());
        assert!(manager
            .validate_retry(&token, "127.0.0.2:1337".parse().unwrap())
            .is_err());

        // Same IP on a different port is a different path.
        assert!(manager
            .validate_retry(&token, "127.0.0.1:1338".parse().unwrap())
            .is_err());
    }

    #[test]
    fn validate_err_invalid_signature() {
        let manager = manager();

        let addr = "127.0.0.1:1337".parse().unwrap();
        let mut token = manager.gen_retry(b"foo", addr);

        token[HEADER_LEN..HEADER_LEN + HMAC_TAG_LEN]
            .copy_from_slice(&[1u8; HMAC_TAG_LEN]);

        assert!(manager.validate_retry(&token, addr).is_err());
    }

    #[test]
    fn rotated_secret_still_validates_old_tokens() {
        let old = KeyingMaterial::generate(0);
        let new = KeyingMaterial::generate(1);

        let addr = "127.0.0.1:1337".parse().unwrap();

        let old_mgr = AddrValidationTokenManager::new(KeyingMaterials::new(
            vec![old.clone()],
            0,
        ));
        let token = old_mgr.gen_retry(b"foo", addr);

        // New generation active, old one retained for validation.
        let rotated = AddrValidationTokenManager::new(KeyingMaterials::new(
            vec![old, new],
            1,
        ));

        assert!(rotated.validate_retry(&token, addr).is_ok());
    }
}
