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

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use foundations::telemetry::log;
use futures::Future;
use quiche::ConnectionId;
use tokio::sync::mpsc;

use crate::buf_factory::PooledBuf;
use crate::metrics::Metrics;
use crate::quic::io::worker::IoWorker;
use crate::quic::io::worker::IoWorkerParams;
use crate::quic::io::worker::WriterConfig;
use crate::quic::router::ConnectionMapCommand;
use crate::settings::TlsCertificatePaths;
use crate::QuicResult;

/// Number of incoming packets to be buffered in the incoming channel.
pub(crate) const INCOMING_QUEUE_SIZE: usize = 2048;

/// A set of hooks executed at the level of a [quiche::Connection].
pub trait ConnectionHook {
    /// Constructs an optional [`boring::ssl::SslContextBuilder`].
    ///
    /// This method allows full customization of quiche's SSL context, for
    /// example to install a BoringSSL early-data context for 0-RTT. It is
    /// called once per socket during initial setup, and then reused across
    /// all connections on that socket.
    fn create_custom_ssl_context_builder(
        &self, settings: TlsCertificatePaths<'_>,
    ) -> Option<boring::ssl::SslContextBuilder>;
}

/// A received network packet with additional metadata.
#[derive(Debug)]
pub struct Incoming {
    /// The address that sent the inbound packet.
    pub peer_addr: SocketAddr,
    /// The address on which we received the inbound packet.
    pub local_addr: SocketAddr,
    /// The packet's contents.
    pub buf: PooledBuf,
    /// ECN codepoint from the IP header, if the socket reported one.
    pub ecn: u8,
    /// If set, then `buf` is a GRO buffer containing multiple packets.
    /// Each individual packet has a size of `gro` (except for the last one).
    pub gro: Option<u16>,
}

/// Lifecycle of an upstream connection as the application observes it.
///
/// Transitions are driven by the QUIC codec; Closing and Draining are
/// terminal from the application's point of view, CloseWait only exists in
/// the close-wait registry after the connection object is gone.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ConnectionState {
    /// TLS handshake still in progress.
    #[default]
    Handshaking,
    /// Application keys installed, HTTP/3 session live.
    Established,
    /// We sent CONNECTION_CLOSE and are waiting out the close period.
    Closing,
    /// The peer sent CONNECTION_CLOSE; nothing more may be sent.
    Draining,
    /// Torn down; a sentinel packet remains in the close-wait registry.
    CloseWait,
}

/// Kind of a connection-fatal error, selecting the CONNECTION_CLOSE variant.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    /// QUIC transport error frame.
    Transport,
    /// HTTP/3 application error frame.
    Application,
}

/// The connection's last-error slot.
///
/// The first recorded error wins, except that transport-parameter errors
/// always overwrite: the TLS library may have already recorded a generic
/// alert for what is really a transport-parameter violation.
#[derive(Clone, Copy, Debug, Default)]
pub struct ErrorSlot {
    err: Option<(ErrorKind, u64)>,
}

impl ErrorSlot {
    /// Records an error according to the precedence rule.
    pub fn record(&mut self, kind: ErrorKind, code: u64, is_transport_param: bool) {
        if self.err.is_none() || is_transport_param {
            self.err = Some((kind, code));
        }
    }

    /// The recorded error, if any.
    pub fn get(&self) -> Option<(ErrorKind, u64)> {
        self.err
    }

    pub fn is_empty(&self) -> bool {
        self.err.is_none()
    }
}

/// Details about a connection's QUIC handshake.
#[derive(Debug, Clone)]
pub struct HandshakeInfo {
    /// The time at which the connection was created.
    start_time: Instant,
    /// The timeout before which the handshake must complete.
    timeout: Option<Duration>,
}

impl HandshakeInfo {
    pub(crate) fn new(start_time: Instant, timeout: Option<Duration>) -> Self {
        Self {
            start_time,
            timeout,
        }
    }

    /// The time at which the connection was created.
    #[inline]
    pub fn start_time(&self) -> Instant {
        self.start_time
    }

    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.timeout.map(|timeout| self.start_time + timeout)
    }

    pub(crate) fn is_expired(&self) -> bool {
        self.timeout
            .is_some_and(|timeout| self.start_time.elapsed() >= timeout)
    }
}

/// A trait to implement an application served over QUIC.
///
/// The application is driven by the connection's I/O worker task. The worker
/// feeds inbound packets into the [quiche::Connection], calls
/// [`ApplicationOverQuic::process_reads`] followed by
/// [`ApplicationOverQuic::process_writes`], and then flushes any pending
/// outbound packets to the network. This repeats in a loop until either the
/// connection is closed or the [`ApplicationOverQuic`] returns an error.
///
/// In between loop iterations, the worker yields until a new packet arrives,
/// a timer expires, or [`ApplicationOverQuic::wait_for_data`] resolves.
#[allow(unused_variables)] // for default functions
pub trait ApplicationOverQuic: Send + 'static {
    /// Callback to customize the [`ApplicationOverQuic`] after the QUIC
    /// handshake completed successfully.
    ///
    /// # Errors
    /// Returning an error from this method immediately stops the worker loop
    /// and transitions to the connection closing stage.
    fn on_conn_established(
        &mut self, qconn: &mut quiche::Connection,
        handshake_info: &HandshakeInfo,
    ) -> QuicResult<()>;

    /// Determines whether the application's methods will be called by the
    /// worker.
    fn should_act(&self) -> bool;

    /// Waits for an event to trigger the next iteration of the worker loop.
    ///
    /// The returned future is awaited in parallel to inbound packets and the
    /// connection's timers, so implementations must not block the runtime.
    fn wait_for_data(
        &mut self, qconn: &mut quiche::Connection,
    ) -> impl Future<Output = QuicResult<()>> + Send;

    /// Processes data received on the connection.
    ///
    /// Only called if `should_act()` returns `true` and packets were
    /// received since the last worker loop iteration.
    fn process_reads(
        &mut self, qconn: &mut quiche::Connection,
    ) -> QuicResult<()>;

    /// Adds data to be sent on the connection. Called on every loop
    /// iteration, after `process_reads` and before packets are flushed.
    fn process_writes(
        &mut self, qconn: &mut quiche::Connection,
    ) -> QuicResult<()>;

    /// Pre-I/O hook, invoked at the top of every worker loop iteration.
    /// Used to observe the worker's graceful-shutdown flag.
    fn before_io(
        &mut self, qconn: &mut quiche::Connection,
    ) -> QuicResult<PreIo> {
        Ok(PreIo::Continue)
    }

    /// One of the connection's timers fired.
    fn on_timer(
        &mut self, qconn: &mut quiche::Connection, timer: TimerEvent,
    ) -> QuicResult<()> {
        Ok(())
    }

    /// Callback to inspect the result of the worker task, before a final
    /// packet with a `CONNECTION_CLOSE` frame is flushed to the network.
    fn on_conn_close(
        &mut self, qconn: &mut quiche::Connection,
        connection_result: &QuicResult<()>,
    ) {
    }

    /// The application's contribution to the connection's last-error slot,
    /// consulted when the close-wait sentinel packet is built.
    fn error_slot(&self) -> ErrorSlot {
        ErrorSlot::default()
    }
}

/// Timer events surfaced to the [`ApplicationOverQuic`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TimerEvent {
    /// The graceful-shutdown period elapsed; the final GOAWAY is due.
    GracefulExpired,
}

/// Outcome of the pre-I/O hook.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PreIo {
    /// Nothing of note; serve the connection as usual.
    Continue,
    /// The worker's shutdown flag was newly observed and the shutdown notice
    /// has been submitted; the caller must arm the graceful timer at 3×PTO.
    ShutdownStarted,
}

pub(crate) struct QuicConnectionParams<M: Metrics> {
    pub writer_cfg: WriterConfig,
    pub initial_pkt: Option<Incoming>,
    pub shutdown_tx: mpsc::Sender<()>,
    pub conn_map_cmd_tx: mpsc::UnboundedSender<ConnectionMapCommand>,
    pub scid: ConnectionId<'static>,
    pub hashed_scid: ConnectionId<'static>,
    /// The client-chosen DCID the peer keeps using until it adopts our SCID.
    pub pending_cid: Option<ConnectionId<'static>>,
    pub metrics: M,
    pub handshake_info: HandshakeInfo,
    pub quiche_conn: quiche::Connection,
    pub socket: Arc<tokio::net::UdpSocket>,
    pub local_addr: SocketAddr,
    pub peer_addr: SocketAddr,
    pub idle_timeout: Duration,
    pub initial_rtt: Duration,
}

/// A server-side QUIC connection that has not performed its handshake yet.
///
/// It is created and added to the listener's connection stream after an
/// initial packet from a client has been received and the client's address
/// has been validated. Call [`UpstreamConnection::start`] with an
/// [`ApplicationOverQuic`] to drive the connection in a worker task for the
/// rest of its lifetime.
#[must_use = "call UpstreamConnection::start to establish the connection"]
pub struct UpstreamConnection<M: Metrics> {
    /// An internal ID, to uniquely identify the connection across multiple
    /// QUIC connection IDs.
    pub(crate) id: u64,
    pub(crate) params: QuicConnectionParams<M>,
    pub(crate) incoming_ev_sender: mpsc::Sender<Incoming>,
    incoming_ev_receiver: mpsc::Receiver<Incoming>,
}

impl<M: Metrics> UpstreamConnection<M> {
    #[inline]
    pub(crate) fn new(params: QuicConnectionParams<M>) -> Self {
        let (incoming_ev_sender, incoming_ev_receiver) =
            mpsc::channel(INCOMING_QUEUE_SIZE);

        Self {
            id: Self::generate_id(),
            params,
            incoming_ev_sender,
            incoming_ev_receiver,
        }
    }

    fn generate_id() -> u64 {
        let mut buf = [0; 8];

        boring::rand::rand_bytes(&mut buf).unwrap();

        u64::from_ne_bytes(buf)
    }

    /// The local address this connection listens on.
    pub fn local_addr(&self) -> SocketAddr {
        self.params.local_addr
    }

    /// The remote address for this connection.
    pub fn peer_addr(&self) -> SocketAddr {
        self.params.peer_addr
    }

    /// The QUIC source connection ID chosen for this connection.
    pub fn scid(&self) -> &ConnectionId<'static> {
        &self.params.scid
    }

    /// Drives the connection from handshake to close in a worker task.
    ///
    /// Returns a [`ConnectionHandle`] with metadata about the connection.
    /// All further interaction happens through the [`ApplicationOverQuic`].
    pub fn start<A: ApplicationOverQuic>(self, app: A) -> ConnectionHandle {
        self.params.metrics.connections_in_memory().inc();

        let handle = ConnectionHandle {
            local_addr: self.params.local_addr,
            peer_addr: self.params.peer_addr,
            scid: self.params.scid.clone(),
        };

        let worker_params = IoWorkerParams {
            socket: self.params.socket,
            shutdown_tx: self.params.shutdown_tx,
            cfg: self.params.writer_cfg,
            conn_map_cmd_tx: self.params.conn_map_cmd_tx,
            scid: self.params.scid,
            hashed_scid: self.params.hashed_scid,
            pending_cid: self.params.pending_cid,
            idle_timeout: self.params.idle_timeout,
            initial_rtt: self.params.initial_rtt,
            handshake_info: self.params.handshake_info,
            metrics: self.params.metrics,
        };

        let qconn = self.params.quiche_conn;
        let initial_pkt = self.params.initial_pkt;
        let incoming = self.incoming_ev_receiver;

        task_killswitch::spawn_with_killswitch(async move {
            let mut worker = IoWorker::new(worker_params, app);

            match worker.run(qconn, initial_pkt, incoming).await {
                Ok(()) => log::trace!("QUIC io worker finished"),
                Err(error) => {
                    log::debug!("QUIC io worker exited"; "error" => %error)
                },
            }
        });

        handle
    }
}

/// Metadata about a started QUIC connection.
///
/// While this struct identifies a QUIC connection, it notably does not grant
/// access to the [quiche::Connection] itself. The crate handles all
/// interactions with [quiche] internally in the worker task; users only see
/// the connection through their [`ApplicationOverQuic`] implementation.
#[derive(Clone)]
pub struct ConnectionHandle {
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    scid: ConnectionId<'static>,
}

impl ConnectionHandle {
    /// The local address this connection listens on.
    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The remote address for this connection.
    #[inline]
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// The QUIC source connection ID used by this connection.
    #[inline]
    pub fn scid(&self) -> &ConnectionId<'static> {
        &self.scid
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("peer_addr", &self.peer_addr)
            .field("scid", &self.scid)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_slot_first_error_wins() {
        let mut slot = ErrorSlot::default();

        slot.record(ErrorKind::Application, 0x0107, false);
        slot.record(ErrorKind::Transport, 0x0a, false);

        assert_eq!(slot.get(), Some((ErrorKind::Application, 0x0107)));
    }

    #[test]
    fn transport_param_error_takes_precedence() {
        let mut slot = ErrorSlot::default();

        slot.record(ErrorKind::Application, 0x0107, false);
        // The TLS layer may have recorded a generic alert first; a
        // transport-parameter violation must still win.
        slot.record(ErrorKind::Transport, 0x08, true);

        assert_eq!(slot.get(), Some((ErrorKind::Transport, 0x08)));

        // But later ordinary errors do not displace it.
        slot.record(ErrorKind::Application, 0x0101, false);
        assert_eq!(slot.get(), Some((ErrorKind::Transport, 0x08)));
    }
}
