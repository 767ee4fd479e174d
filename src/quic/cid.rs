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

//! Source connection ID minting and the secrets that key them.
//!
//! Every CID issued by this endpoint encodes two routing facts: the worker's
//! CID prefix, which lets an eBPF steering program (or any other external
//! balancer) deliver all packets of a connection to the worker that owns it,
//! and a keying material index, which selects the secret that derived the
//! connection's tokens so that secrets can rotate without invalidating
//! outstanding ones.

use std::net::IpAddr;
use std::net::SocketAddr;
use std::sync::Arc;

use quiche::ConnectionId;

/// Length of every source CID issued by this endpoint.
pub const SCID_LEN: usize = 20;

/// Length of the worker-routing prefix embedded in each CID.
pub const CID_PREFIX_LEN: usize = 8;

/// Byte length of a stateless reset token.
pub const RESET_TOKEN_LEN: usize = 16;

const KM_ID_BITS: u8 = 3;
const KM_ID_SHIFT: u8 = 8 - KM_ID_BITS;

/// One generation of the endpoint's token/CID secret.
#[derive(Clone)]
pub struct KeyingMaterial {
    /// Identifier stored in the top bits of the first CID byte and in
    /// issued tokens. At most 3 bits wide.
    pub id: u8,
    /// HMAC secret for this generation.
    pub secret: [u8; 32],
}

impl KeyingMaterial {
    /// Creates a keying material with a freshly drawn secret.
    pub fn generate(id: u8) -> Self {
        assert!(id < (1 << KM_ID_BITS), "keying material id out of range");

        let mut secret = [0; 32];
        boring::rand::rand_bytes(&mut secret).unwrap();

        KeyingMaterial { id, secret }
    }
}

/// The set of keying materials known to a worker: one active generation used
/// to derive new CIDs and tokens, and older generations kept for validating
/// what they derived. Read-only after startup.
#[derive(Clone)]
pub struct KeyingMaterials {
    materials: Arc<Vec<KeyingMaterial>>,
    active: usize,
}

impl KeyingMaterials {
    pub fn new(materials: Vec<KeyingMaterial>, active: usize) -> Self {
        assert!(active < materials.len());

        KeyingMaterials {
            materials: Arc::new(materials),
            active,
        }
    }

    /// A set with a single freshly generated material.
    pub fn generate() -> Self {
        Self::new(vec![KeyingMaterial::generate(0)], 0)
    }

    /// The generation used to derive new CIDs and tokens.
    pub fn active(&self) -> &KeyingMaterial {
        &self.materials[self.active]
    }

    /// Looks up a generation by the identifier recovered from a CID or
    /// token.
    pub fn select(&self, id: u8) -> Option<&KeyingMaterial> {
        self.materials.iter().find(|km| km.id == id)
    }
}

/// Mints and verifies the source CIDs for one worker.
#[derive(Clone)]
pub struct CidIssuer {
    prefix: [u8; CID_PREFIX_LEN],
    keying: KeyingMaterials,
}

impl CidIssuer {
    pub fn new(prefix: [u8; CID_PREFIX_LEN], keying: KeyingMaterials) -> Self {
        CidIssuer { prefix, keying }
    }

    /// A worker with a random prefix and a single-generation secret.
    pub fn ephemeral() -> Self {
        let mut prefix = [0; CID_PREFIX_LEN];
        boring::rand::rand_bytes(&mut prefix).unwrap();

        CidIssuer::new(prefix, KeyingMaterials::generate())
    }

    pub fn keying_materials(&self) -> &KeyingMaterials {
        &self.keying
    }

    /// Generates a fresh source CID: keying material index in the top bits
    /// of the first byte, the worker prefix, and a random tail.
    pub fn new_scid(&self) -> ConnectionId<'static> {
        let mut cid = [0u8; SCID_LEN];
        boring::rand::rand_bytes(&mut cid).unwrap();

        cid[0] = (self.keying.active().id << KM_ID_SHIFT) |
            (cid[0] >> KM_ID_BITS);
        cid[1..1 + CID_PREFIX_LEN].copy_from_slice(&self.prefix);

        ConnectionId::from_vec(cid.to_vec())
    }

    /// The keying material index embedded in `cid`, if the CID is long
    /// enough to carry one.
    pub fn km_id(cid: &ConnectionId) -> Option<u8> {
        cid.as_ref().first().map(|b| b >> KM_ID_SHIFT)
    }

    /// Whether `cid` was minted by this worker.
    pub fn verify_scid(&self, cid: &ConnectionId) -> bool {
        cid.len() == SCID_LEN &&
            cid.as_ref()[1..1 + CID_PREFIX_LEN] == self.prefix
    }

    /// Derives the CID under which the demultiplexer finds a connection for
    /// the client's very first flight, before the client has adopted a
    /// server-chosen CID. Deterministic in the 4-tuple and the original
    /// DCID so retransmitted Initials hash to the same connection.
    pub fn hashed_scid(
        &self, remote: SocketAddr, local: SocketAddr, dcid: &ConnectionId,
    ) -> ConnectionId<'static> {
        let mut input = Vec::with_capacity(64);
        encode_addr(&mut input, remote);
        encode_addr(&mut input, local);
        input.extend_from_slice(dcid.as_ref());

        let tag =
            boring::hash::hmac_sha256(&self.keying.active().secret, &input)
                .unwrap();

        ConnectionId::from_vec(tag.as_ref()[..SCID_LEN].to_vec())
    }

    /// Derives the stateless reset token that accompanies `cid`.
    pub fn reset_token(&self, cid: &ConnectionId) -> [u8; RESET_TOKEN_LEN] {
        let secret = Self::km_id(cid)
            .and_then(|id| self.keying.select(id))
            .unwrap_or_else(|| self.keying.active());

        let tag =
            boring::hash::hmac_sha256(&secret.secret, cid.as_ref()).unwrap();

        let mut token = [0; RESET_TOKEN_LEN];
        token.copy_from_slice(&tag.as_ref()[..RESET_TOKEN_LEN]);
        token
    }
}

pub(crate) fn encode_addr(out: &mut Vec<u8>, addr: SocketAddr) {
    match addr.ip() {
        IpAddr::V4(ip) => out.extend_from_slice(&ip.octets()),
        IpAddr::V6(ip) => out.extend_from_slice(&ip.octets()),
    }
    out.extend_from_slice(&addr.port().to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issuer() -> CidIssuer {
        CidIssuer::new([0xab; CID_PREFIX_LEN], KeyingMaterials::generate())
    }

    #[test]
    fn scid_layout() {
        let issuer = issuer();
        let scid = issuer.new_scid();

        assert_eq!(scid.len(), SCID_LEN);
        assert_eq!(CidIssuer::km_id(&scid), Some(0));
        assert_eq!(&scid.as_ref()[1..1 + CID_PREFIX_LEN], &[0xab; 8]);
        assert!(issuer.verify_scid(&scid));
    }

    #[test]
    fn scid_rejects_foreign_prefix() {
        let issuer = issuer();
        let other = CidIssuer::ephemeral().new_scid();

        assert!(!issuer.verify_scid(&other));
        assert!(!issuer.verify_scid(&ConnectionId::from_ref(b"short")));
    }

    #[test]
    fn hashed_scid_is_deterministic() {
        let issuer = issuer();
        let remote = "198.51.100.7:4433".parse().unwrap();
        let local = "192.0.2.1:443".parse().unwrap();
        let dcid = ConnectionId::from_ref(b"client-chosen-dcid");

        let a = issuer.hashed_scid(remote, local, &dcid);
        let b = issuer.hashed_scid(remote, local, &dcid);
        assert_eq!(a, b);
        assert_eq!(a.len(), SCID_LEN);

        let other_remote = "198.51.100.8:4433".parse().unwrap();
        let c = issuer.hashed_scid(other_remote, local, &dcid);
        assert_ne!(a, c);
    }

    #[test]
    fn reset_token_is_stable_per_cid() {
        let issuer = issuer();
        let scid = issuer.new_scid();

        assert_eq!(issuer.reset_token(&scid), issuer.reset_token(&scid));
        assert_ne!(
            issuer.reset_token(&scid),
            issuer.reset_token(&issuer.new_scid())
        );
    }
}
