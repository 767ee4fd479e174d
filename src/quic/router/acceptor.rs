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

//! Server-side handling of packets that open new connections: version
//! negotiation, stateless Retry with address validation, and acceptance.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use foundations::telemetry::log;
use quiche::ConnectionId;
use quiche::Header;
use quiche::Type as PacketType;
use task_killswitch::spawn_with_killswitch;
use tokio::net::UdpSocket;

use crate::metrics::labels;
use crate::metrics::Metrics;
use crate::quic::cid::CidIssuer;
use crate::quic::connection::Incoming;
use crate::quic::make_qlog_writer;
use crate::quic::token::AddrValidationTokenManager;
use crate::QuicResultExt;

/// Upper bound for packets generated outside a connection (Retry, Version
/// Negotiation, refusal closes).
const MAX_HANDSHAKE_REPLY: usize = 1350;

/// A freshly accepted connection, ready to be registered and spawned.
pub(crate) struct NewConnection {
    pub(crate) conn: quiche::Connection,
    pub(crate) scid: ConnectionId<'static>,
    pub(crate) hashed_scid: ConnectionId<'static>,
    pub(crate) pending_cid: Option<ConnectionId<'static>>,
    pub(crate) handshake_start_time: Instant,
    pub(crate) initial_pkt: Incoming,
    pub(crate) local_addr: SocketAddr,
    pub(crate) peer_addr: SocketAddr,
}

/// Accepts QUIC connections for the router.
pub(crate) struct ConnectionAcceptor<M> {
    qlog_dir: Option<String>,
    require_token: bool,
    socket: Arc<UdpSocket>,
    token_manager: AddrValidationTokenManager,
    cid_issuer: CidIssuer,
    metrics: M,
}

impl<M: Metrics> ConnectionAcceptor<M> {
    pub(crate) fn new(
        qlog_dir: Option<String>, require_token: bool, socket: Arc<UdpSocket>,
        cid_issuer: CidIssuer, metrics: M,
    ) -> Self {
        let token_manager = AddrValidationTokenManager::new(
            cid_issuer.keying_materials().clone(),
        );

        Self {
            qlog_dir,
            require_token,
            socket,
            token_manager,
            cid_issuer,
            metrics,
        }
    }

    pub(crate) fn hashed_scid(
        &self, remote: SocketAddr, local: SocketAddr, dcid: &ConnectionId,
    ) -> ConnectionId<'static> {
        self.cid_issuer.hashed_scid(remote, local, dcid)
    }

    pub(crate) fn handle_initials(
        &mut self, incoming: Incoming, hdr: Header<'_>,
        quiche_config: &mut quiche::Config, shutting_down: bool,
    ) -> io::Result<Option<NewConnection>> {
        if hdr.ty != PacketType::Initial {
            // Non-initial packets should carry a CID we minted; count the
            // ones that don't for telemetry.
            if !self.cid_issuer.verify_scid(&hdr.dcid) {
                self.metrics
                    .rejected_initial_packet_count(
                        labels::QuicInvalidInitialPacketError::WrongType,
                    )
                    .inc();
            }

            Err(labels::QuicInvalidInitialPacketError::WrongType)?;
        }

        if !quiche::version_is_supported(hdr.version) {
            return self.version_negotiation(incoming, &hdr);
        }

        if shutting_down {
            // Existing connections drain out; new ones are told to go
            // elsewhere.
            self.metrics
                .rejected_initial_packet_count(
                    labels::QuicInvalidInitialPacketError::ShuttingDown,
                )
                .inc();
            return self.refuse_conn(incoming, &hdr, quiche_config);
        }

        if !self.require_token {
            return self.accept_conn(incoming, None, &hdr, quiche_config);
        }

        // NOTE: token is always present in Initial packets
        let token = hdr.token.as_ref().unwrap().clone();
        if token.is_empty() {
            return self.stateless_retry(incoming, &hdr);
        }

        if AddrValidationTokenManager::is_retry(&token) {
            let original_dcid = match self
                .token_manager
                .validate_retry(&token, incoming.peer_addr)
            {
                Ok(odcid) => odcid.into_owned(),
                Err(_) => {
                    self.metrics
                        .rejected_initial_packet_count(
                            labels::QuicInvalidInitialPacketError::TokenValidationFail,
                        )
                        .inc();
                    return Err(
                        labels::QuicInvalidInitialPacketError::TokenValidationFail
                            .into(),
                    );
                },
            };

            return self.accept_conn(
                incoming,
                Some(original_dcid),
                &hdr,
                quiche_config,
            );
        }

        // A token handed out for resumption; when it doesn't validate, fall
        // back to a fresh address-validation round trip instead of
        // rejecting the connection.
        match self
            .token_manager
            .validate_session(&token, incoming.peer_addr)
        {
            Ok(()) => self.accept_conn(incoming, None, &hdr, quiche_config),
            Err(_) => self.stateless_retry(incoming, &hdr),
        }
    }

    fn accept_conn(
        &mut self, incoming: Incoming,
        original_dcid: Option<ConnectionId<'static>>, hdr: &Header<'_>,
        quiche_config: &mut quiche::Config,
    ) -> io::Result<Option<NewConnection>> {
        let handshake_start_time = Instant::now();
        let local_addr = incoming.local_addr;
        let peer_addr = incoming.peer_addr;

        let scid = self.cid_issuer.new_scid();

        let mut conn = quiche::accept(
            &scid,
            original_dcid.as_ref(),
            local_addr,
            peer_addr,
            quiche_config,
        )
        .into_io()?;

        if let Some(qlog_dir) = &self.qlog_dir {
            if let Ok(writer) = make_qlog_writer(qlog_dir, &scid) {
                conn.set_qlog(
                    Box::new(writer),
                    "h3gate qlog".to_string(),
                    format!("h3gate qlog scid={scid:?}"),
                );
            }
        }

        // The hashed SCID is keyed on the DCID of the client's very first
        // packet so retransmitted first flights route to this connection.
        let first_flight_dcid =
            original_dcid.as_ref().unwrap_or(&hdr.dcid);
        let hashed_scid = self.cid_issuer.hashed_scid(
            peer_addr,
            local_addr,
            first_flight_dcid,
        );

        Ok(Some(NewConnection {
            conn,
            scid,
            hashed_scid,
            pending_cid: Some(hdr.dcid.clone().into_owned()),
            handshake_start_time,
            initial_pkt: incoming,
            local_addr,
            peer_addr,
        }))
    }

    fn handshake_reply(
        &self, incoming: Incoming,
        writer: impl FnOnce(&mut [u8]) -> io::Result<usize>,
    ) -> io::Result<Option<NewConnection>> {
        let mut send_buf = [0u8; MAX_HANDSHAKE_REPLY];
        let written = writer(&mut send_buf)?;
        let socket = Arc::clone(&self.socket);

        spawn_with_killswitch(async move {
            let send_buf = &send_buf[..written];
            let _ = socket.send_to(send_buf, incoming.peer_addr).await;
        });

        Ok(None)
    }

    /// Asks the client to prove ownership of its address before any
    /// connection state is allocated.
    fn stateless_retry(
        &mut self, incoming: Incoming, hdr: &Header<'_>,
    ) -> io::Result<Option<NewConnection>> {
        let new_scid = self.cid_issuer.new_scid();

        let token = self
            .token_manager
            .gen_retry(&hdr.dcid, incoming.peer_addr);

        let scid = hdr.scid.clone();
        let dcid = hdr.dcid.clone();
        let version = hdr.version;

        self.handshake_reply(incoming, move |buf| {
            quiche::retry(&scid, &dcid, &new_scid, &token, version, buf)
                .into_io()
        })
    }

    fn version_negotiation(
        &self, incoming: Incoming, hdr: &Header<'_>,
    ) -> io::Result<Option<NewConnection>> {
        let peer_addr = incoming.peer_addr;
        let versions = [
            generate_reserved_version(peer_addr, hdr.version),
            quiche::PROTOCOL_VERSION,
        ];

        let scid = hdr.scid.clone();
        let dcid = hdr.dcid.clone();

        self.handshake_reply(incoming, move |buf| {
            write_version_negotiation(&scid, &dcid, &versions, buf)
        })
    }

    /// Refuses a nascent connection during graceful shutdown with
    /// CONNECTION_CLOSE(CONNECTION_REFUSED), built from the client's
    /// decoded version and CIDs.
    fn refuse_conn(
        &mut self, mut incoming: Incoming, _hdr: &Header<'_>,
        quiche_config: &mut quiche::Config,
    ) -> io::Result<Option<NewConnection>> {
        let scid = self.cid_issuer.new_scid();

        let mut conn = quiche::accept(
            &scid,
            None,
            incoming.local_addr,
            incoming.peer_addr,
            quiche_config,
        )
        .into_io()?;

        let recv_info = quiche::RecvInfo {
            from: incoming.peer_addr,
            to: incoming.local_addr,
        };

        // Feed the Initial so the codec derives keys, then close before the
        // handshake goes anywhere.
        if let Err(e) = conn.recv(&mut incoming.buf, recv_info) {
            log::debug!("failed to read initial of refused connection"; "error" => %e);
            return Ok(None);
        }

        let _ = conn.close(
            false,
            quiche::WireErrorCode::ConnectionRefused as u64,
            &[],
        );

        let mut out = [0u8; MAX_HANDSHAKE_REPLY];
        if let Ok((written, _)) = conn.send(&mut out) {
            let socket = Arc::clone(&self.socket);
            let peer_addr = incoming.peer_addr;

            spawn_with_killswitch(async move {
                let _ = socket.send_to(&out[..written], peer_addr).await;
            });
        }

        Ok(None)
    }
}

/// Derives a greased reserved version from the client address and its
/// offered version, advertised ahead of the real version so clients keep
/// exercising version negotiation.
fn generate_reserved_version(addr: SocketAddr, version: u32) -> u32 {
    let mut input = Vec::with_capacity(22);
    crate::quic::cid::encode_addr(&mut input, addr);
    input.extend_from_slice(&version.to_be_bytes());

    let mut h: u32 = 0x811C_9DC5;
    for b in input {
        h ^= u32::from(b);
        h = h.wrapping_mul(0x0100_0193);
    }

    (h & 0xf0f0_f0f0) | 0x0a0a_0a0a
}

/// Writes a Version Negotiation packet: long-header form with version zero,
/// echoing the client's CIDs swapped, followed by the supported versions.
fn write_version_negotiation(
    scid: &ConnectionId, dcid: &ConnectionId, versions: &[u32],
    buf: &mut [u8],
) -> io::Result<usize> {
    let needed =
        1 + 4 + 1 + scid.len() + 1 + dcid.len() + versions.len() * 4;
    if buf.len() < needed {
        return Err(io::ErrorKind::InvalidInput.into());
    }

    let mut rand_byte = [0u8; 1];
    boring::rand::rand_bytes(&mut rand_byte).unwrap();

    let mut off = 0;
    // Long header form; the remaining first-byte bits are unused and
    // randomized.
    buf[off] = 0x80 | (rand_byte[0] & 0x7f);
    off += 1;

    buf[off..off + 4].copy_from_slice(&0u32.to_be_bytes());
    off += 4;

    // The client's SCID becomes our DCID and vice versa.
    buf[off] = scid.len() as u8;
    off += 1;
    buf[off..off + scid.len()].copy_from_slice(scid.as_ref());
    off += scid.len();

    buf[off] = dcid.len() as u8;
    off += 1;
    buf[off..off + dcid.len()].copy_from_slice(dcid.as_ref());
    off += dcid.len();

    for version in versions {
        buf[off..off + 4].copy_from_slice(&version.to_be_bytes());
        off += 4;
    }

    Ok(off)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_version_is_greased_and_stable() {
        let addr: SocketAddr = "198.51.100.7:4433".parse().unwrap();

        let v = generate_reserved_version(addr, 0xdead_beef);
        assert_eq!(v & 0x0f0f_0f0f, 0x0a0a_0a0a, "not a reserved version");
        assert_eq!(v, generate_reserved_version(addr, 0xdead_beef));

        let other: SocketAddr = "198.51.100.8:4433".parse().unwrap();
        assert_ne!(v, generate_reserved_version(other, 0xdead_beef));
    }

    #[test]
    fn version_negotiation_packet_layout() {
        let scid = ConnectionId::from_ref(b"client-scid");
        let dcid = ConnectionId::from_ref(b"client-dcid");
        let versions = [0x1a2a_3a4a, 1];

        let mut buf = [0u8; 128];
        let written =
            write_version_negotiation(&scid, &dcid, &versions, &mut buf)
                .unwrap();

        // Long-header form bit set, version field zero.
        assert_eq!(buf[0] & 0x80, 0x80);
        assert_eq!(&buf[1..5], &[0, 0, 0, 0]);

        // CIDs are echoed swapped.
        assert_eq!(buf[5] as usize, scid.len());
        assert_eq!(&buf[6..6 + scid.len()], scid.as_ref());

        let dcid_off = 6 + scid.len();
        assert_eq!(buf[dcid_off] as usize, dcid.len());

        // Both versions trail the CIDs.
        let vers_off = dcid_off + 1 + dcid.len();
        assert_eq!(written, vers_off + 8);
        assert_eq!(&buf[vers_off..vers_off + 4], &0x1a2a_3a4au32.to_be_bytes());
        assert_eq!(&buf[vers_off + 4..vers_off + 8], &1u32.to_be_bytes());
    }
}
