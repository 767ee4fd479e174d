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

use std::sync::Arc;
use std::sync::Mutex;

use h3gate::http3::ProxyH3Driver;
use h3gate::http3::RequestHeaders;
use h3gate::metrics::DefaultMetrics;
use h3gate::proxy::BackendError;
use h3gate::proxy::DownstreamConnection;
use h3gate::proxy::DownstreamConnector;
use h3gate::proxy::DownstreamEventSender;
use h3gate::quic::CidIssuer;
use h3gate::quic::ErrorKind;
use h3gate::quic::ErrorSlot;
use h3gate::quic::KeyingMaterial;
use h3gate::quic::KeyingMaterials;
use h3gate::quic::ShutdownSignal;
use h3gate::settings::ConnectionParams;

/// A connector that records which requests reached it and refuses them
/// all.
struct RefusingPool {
    seen: Mutex<Vec<(u64, String)>>,
}

impl RefusingPool {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            seen: Mutex::new(Vec::new()),
        })
    }
}

impl DownstreamConnector for RefusingPool {
    fn get_downstream_connection(
        &self, stream_id: u64, req: &RequestHeaders,
        _events: DownstreamEventSender,
    ) -> Result<Box<dyn DownstreamConnection>, BackendError> {
        self.seen
            .lock()
            .unwrap()
            .push((stream_id, req.queue_authority().to_string()));
        Err(BackendError::Refused)
    }
}

#[test]
fn worker_cids_share_prefix_and_keying() {
    let keying = KeyingMaterials::new(
        vec![KeyingMaterial::generate(0), KeyingMaterial::generate(1)],
        1,
    );
    let issuer = CidIssuer::new([0x42; 8], keying);

    let a = issuer.new_scid();
    let b = issuer.new_scid();

    assert_ne!(a, b, "CIDs must carry fresh entropy");
    assert!(issuer.verify_scid(&a));
    assert!(issuer.verify_scid(&b));

    // Both encode the active keying-material generation.
    assert_eq!(CidIssuer::km_id(&a), Some(1));
    assert_eq!(CidIssuer::km_id(&b), Some(1));
}

#[test]
fn hashed_scid_routes_first_flight_retransmissions() {
    let issuer = CidIssuer::new([0x42; 8], KeyingMaterials::generate());

    let remote = "203.0.113.9:50000".parse().unwrap();
    let local = "192.0.2.1:443".parse().unwrap();
    let dcid = quiche::ConnectionId::from_ref(b"first-flight-dcid");

    // A retransmitted Initial hashes to the same CID, so the
    // demultiplexer finds the half-open connection it already created.
    let first = issuer.hashed_scid(remote, local, &dcid);
    let retransmit = issuer.hashed_scid(remote, local, &dcid);
    assert_eq!(first, retransmit);

    // A different client, or a different initial DCID, is another
    // connection.
    let other_dcid = quiche::ConnectionId::from_ref(b"other-dcid");
    assert_ne!(first, issuer.hashed_scid(remote, local, &other_dcid));
}

#[test]
fn error_slot_precedence_is_observable() {
    let mut slot = ErrorSlot::default();
    assert!(slot.is_empty());

    slot.record(ErrorKind::Application, 0x0102, false);
    slot.record(ErrorKind::Transport, 0x0a, false);
    assert_eq!(slot.get(), Some((ErrorKind::Application, 0x0102)));

    // Transport-parameter errors displace whatever came first.
    slot.record(ErrorKind::Transport, 0x08, true);
    assert_eq!(slot.get(), Some((ErrorKind::Transport, 0x08)));
}

#[test]
fn shutdown_signal_is_shared() {
    let signal = ShutdownSignal::new();
    let clone = signal.clone();

    assert!(!clone.is_triggered());
    signal.trigger();
    assert!(clone.is_triggered());
}

#[test]
fn driver_builds_from_params() {
    let params = ConnectionParams::default();
    let pool = RefusingPool::new();

    let driver =
        ProxyH3Driver::new(&params, pool, ShutdownSignal::new());

    assert_eq!(driver.closed_bidi_streams(), 0);
}

#[test]
fn connector_observes_requests() {
    let pool = RefusingPool::new();
    let (ev_tx, _ev_rx) = tokio::sync::mpsc::unbounded_channel();

    let mut req = RequestHeaders::default();
    req.method = "GET".to_string();
    req.authority = Some("a.example".to_string());

    assert!(matches!(
        pool.get_downstream_connection(4, &req, ev_tx),
        Err(BackendError::Refused)
    ));
    assert_eq!(
        *pool.seen.lock().unwrap(),
        vec![(4, "a.example".to_string())]
    );
}

#[tokio::test]
async fn listener_starts_on_ephemeral_port() {
    let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    let params = ConnectionParams::default();

    let mut conns = h3gate::listen(
        socket,
        &params,
        CidIssuer::ephemeral(),
        ShutdownSignal::new(),
        DefaultMetrics,
    )
    .unwrap();

    // No client is talking to us; the stream must simply be live and
    // empty.
    use tokio::sync::mpsc::error::TryRecvError;
    assert!(matches!(conns.try_recv(), Err(TryRecvError::Empty)));
}
