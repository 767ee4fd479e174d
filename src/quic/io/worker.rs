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

//! The per-connection I/O worker.
//!
//! One worker task owns one client QUIC connection for its entire lifetime:
//! it feeds inbound packets into the codec, drives the
//! [`ApplicationOverQuic`], packs outbound stream data into GSO batches, and
//! runs the connection's timer set. All connection state transitions happen
//! inside this task, so none of it is locked.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use foundations::telemetry::log;
use quiche::ConnectionId;
use tokio::net::UdpSocket;
use tokio::select;
use tokio::sync::mpsc;
use tokio::time;

use super::gso;
use super::gso::FALLBACK_UDP_PAYLOAD_SIZE;
use super::gso::UDP_MAX_GSO_PACKET_SIZE;
use super::gso::UDP_MAX_SEGMENT_COUNT;

use crate::buf_factory::BufFactory;
use crate::buf_factory::PooledBuf;
use crate::metrics::labels;
use crate::metrics::Metrics;
use crate::quic::connection::ApplicationOverQuic;
use crate::quic::connection::ConnectionState;
use crate::quic::connection::ErrorKind;
use crate::quic::connection::ErrorSlot;
use crate::quic::connection::HandshakeInfo;
use crate::quic::connection::Incoming;
use crate::quic::connection::PreIo;
use crate::quic::connection::TimerEvent;
use crate::quic::router::ConnectionMapCommand;
use crate::quic::timer::TimerKind;
use crate::quic::timer::TimerSet;
use crate::QuicResult;

/// Check for incoming packets after sending this many, so a long write pass
/// cannot starve the ACK feed.
const CHECK_INCOMING_QUEUE_RATIO: usize = 128;

/// Stop queuing GSO packets if the packet size is below this threshold.
const GSO_THRESHOLD: usize = 1_000;

/// Packet batch cap when the congestion controller is not BBR.
const NON_BBR_BURST_LIMIT: usize = 10;

/// Largest CONNECTION_CLOSE sentinel retained for close-wait.
const MAX_CLOSE_WAIT_PKT: usize = 1200;

/// How long past the earliest possible send a packet may still be released.
const DEFAULT_MAX_INTO_FUTURE: Duration = Duration::from_millis(1);

const MAX_ACK_DELAY: Duration = Duration::from_millis(25);

pub(crate) struct WriterConfig {
    pub peer_addr: SocketAddr,
    pub with_gso: bool,
    pub pacing_offload: bool,
    pub with_pktinfo: bool,
    pub max_send_udp_payload_size: usize,
    pub is_bbr: bool,
}

#[derive(Default)]
struct WriteState {
    bytes_written: usize,
    segment_size: usize,
    num_pkts: usize,
    tx_time: Option<Instant>,
    has_pending_data: bool,
    // If the pacer schedules packets too far into the future, pause sending
    // until the future arrives.
    next_release_time: Option<Instant>,
    // Outgoing packets are sent to the peer from this address rather than
    // the listening socket's wildcard.
    send_from: Option<SocketAddr>,
    // Byte offset at which the batch's path changed; everything before it is
    // flushed with the previous path, the tail as a singleton.
    split_at: Option<(usize, Option<SocketAddr>)>,
}

pub(crate) struct IoWorkerParams<M: Metrics> {
    pub(crate) socket: Arc<UdpSocket>,
    /// Signals to the router that the connection has gone away (nothing is
    /// sent here, the router just detects the sender has dropped).
    pub(crate) shutdown_tx: mpsc::Sender<()>,
    pub(crate) cfg: WriterConfig,
    pub(crate) conn_map_cmd_tx: mpsc::UnboundedSender<ConnectionMapCommand>,
    pub(crate) scid: ConnectionId<'static>,
    pub(crate) hashed_scid: ConnectionId<'static>,
    pub(crate) pending_cid: Option<ConnectionId<'static>>,
    pub(crate) idle_timeout: Duration,
    pub(crate) initial_rtt: Duration,
    pub(crate) handshake_info: HandshakeInfo,
    pub(crate) metrics: M,
}

pub(crate) struct IoWorker<A, M: Metrics> {
    socket: Arc<UdpSocket>,
    #[allow(dead_code)]
    shutdown_tx: mpsc::Sender<()>,
    cfg: WriterConfig,
    conn_map_cmd_tx: mpsc::UnboundedSender<ConnectionMapCommand>,
    scid: ConnectionId<'static>,
    hashed_scid: ConnectionId<'static>,
    pending_cid: Option<ConnectionId<'static>>,
    idle_timeout: Duration,
    initial_rtt: Duration,
    handshake_info: HandshakeInfo,
    metrics: M,

    app: A,
    state: ConnectionState,
    timers: TimerSet,
    write_state: WriteState,
    send_buf: PooledBuf,
    error_slot: ErrorSlot,
    /// Current outgoing payload ceiling; drops to 1200 for the rest of the
    /// connection after the kernel rejects a GSO send.
    payload_ceiling: usize,
    /// Copy of the CONNECTION_CLOSE datagram, retained for close-wait.
    pending_close_pkt: Option<Vec<u8>>,
    idle_close: bool,
}

impl<A, M> IoWorker<A, M>
where
    A: ApplicationOverQuic,
    M: Metrics,
{
    pub(crate) fn new(params: IoWorkerParams<M>, app: A) -> Self {
        let payload_ceiling = params.cfg.max_send_udp_payload_size;

        Self {
            socket: params.socket,
            shutdown_tx: params.shutdown_tx,
            cfg: params.cfg,
            conn_map_cmd_tx: params.conn_map_cmd_tx,
            scid: params.scid,
            hashed_scid: params.hashed_scid,
            pending_cid: params.pending_cid,
            idle_timeout: params.idle_timeout,
            initial_rtt: params.initial_rtt,
            handshake_info: params.handshake_info,
            metrics: params.metrics,

            app,
            state: ConnectionState::Handshaking,
            timers: TimerSet::default(),
            write_state: WriteState::default(),
            send_buf: BufFactory::get_max_buf(),
            error_slot: ErrorSlot::default(),
            payload_ceiling,
            pending_close_pkt: None,
            idle_close: false,
        }
    }

    pub(crate) async fn run(
        &mut self, mut qconn: quiche::Connection, initial_pkt: Option<Incoming>,
        mut incoming_rx: mpsc::Receiver<Incoming>,
    ) -> QuicResult<()> {
        let result = self
            .work_loop(&mut qconn, initial_pkt, &mut incoming_rx)
            .await;

        self.finalize(&mut qconn, &result).await;

        result
    }

    async fn work_loop(
        &mut self, qconn: &mut quiche::Connection,
        mut in_pkt: Option<Incoming>,
        incoming_rx: &mut mpsc::Receiver<Incoming>,
    ) -> QuicResult<()> {
        const DEFAULT_SLEEP: Duration = Duration::from_secs(60);
        let mut current_deadline: Option<Instant> = None;
        let sleep = time::sleep(DEFAULT_SLEEP);
        tokio::pin!(sleep);

        loop {
            let now = Instant::now();

            if self.app.should_act() {
                if let PreIo::ShutdownStarted = self.app.before_io(qconn)? {
                    let period = 3 * self.pto(qconn);
                    self.timers.arm_graceful(now + period);
                    log::debug!(
                        "graceful shutdown started";
                        "scid" => ?self.scid,
                        "period" => ?period,
                    );
                }
            }

            self.write_state.has_pending_data = true;

            while self.write_state.has_pending_data {
                let mut packets_sent = 0;

                // Clear all received packets first: they carry ACKs, and the
                // incoming queue is bounded, so stalling it stalls the peer.
                let mut did_recv = false;
                while let Some(pkt) =
                    in_pkt.take().or_else(|| incoming_rx.try_recv().ok())
                {
                    self.process_incoming(qconn, pkt)?;
                    did_recv = true;
                }

                if qconn.is_draining() && !qconn.is_closed() {
                    // The peer closed the connection; nothing may be sent
                    // back, so the connection object is dropped right away.
                    self.state = ConnectionState::Draining;
                    return Ok(());
                }

                self.on_handshake_progress(qconn)?;

                if did_recv && self.app.should_act() {
                    self.app.process_reads(qconn)?;
                }

                if self.app.should_act() {
                    self.app.process_writes(qconn)?;
                }

                let can_release = match self.write_state.next_release_time {
                    None => true,
                    Some(next_release) => next_release <= Instant::now(),
                };

                self.write_state.has_pending_data &= can_release;

                while self.write_state.has_pending_data &&
                    packets_sent < CHECK_INCOMING_QUEUE_RATIO
                {
                    self.fill_send_buffer(qconn)?;

                    let has_local_close = qconn.local_error().is_some();
                    self.flush_buffer_to_socket(has_local_close).await;
                    packets_sent += self.write_state.num_pkts;

                    if qconn.is_closed() {
                        self.state = ConnectionState::Closing;
                        return Ok(());
                    }

                    if qconn.local_error().is_some() &&
                        self.pending_close_pkt.is_some()
                    {
                        // CONNECTION_CLOSE is on the wire; close-wait takes
                        // over from here.
                        self.state = ConnectionState::Closing;
                        return Ok(());
                    }
                }
            }

            self.timers.set_expiry(qconn.timeout_instant());

            let mut new_deadline = self.timers.next_deadline(now);
            new_deadline =
                min_of_some(new_deadline, self.write_state.next_release_time);
            if self.state == ConnectionState::Handshaking {
                new_deadline =
                    min_of_some(new_deadline, self.handshake_info.deadline());
            }

            if new_deadline != current_deadline {
                current_deadline = new_deadline;

                sleep
                    .as_mut()
                    .reset(new_deadline.unwrap_or(now + DEFAULT_SLEEP).into());
            }

            let mut timer_fired = false;
            let app = &mut self.app;
            let can_act = app.should_act();
            select! {
                biased;
                () = &mut sleep => {
                    // Keep the timeout arm at the top of this biased select
                    // so it is polled every iteration and timers can never
                    // be starved by a chatty peer.
                    timer_fired = true;
                }
                Some(pkt) = incoming_rx.recv() => in_pkt = Some(pkt),
                status = app.wait_for_data(qconn), if can_act => status?,
            };

            if timer_fired {
                let fired_at = Instant::now();

                match self.timers.fired(fired_at) {
                    Some(TimerKind::Idle) => {
                        // The negotiated idle period passed without any
                        // packet; delete the connection without sending.
                        self.idle_close = true;
                        self.state = ConnectionState::Closing;
                        return Ok(());
                    },
                    Some(TimerKind::Expiry) => qconn.on_timeout(),
                    Some(TimerKind::Graceful) => {
                        self.app
                            .on_timer(qconn, TimerEvent::GracefulExpired)?;
                    },
                    None => qconn.on_timeout(),
                }

                self.write_state.next_release_time = None;
                current_deadline = None;
                sleep.as_mut().reset((fired_at + DEFAULT_SLEEP).into());
            }

            if self.state == ConnectionState::Handshaking &&
                self.handshake_info.is_expired()
            {
                let _ = qconn.close(
                    false,
                    quiche::WireErrorCode::ApplicationError as u64,
                    &[],
                );
                self.metrics
                    .failed_handshakes(labels::HandshakeError::Timeout)
                    .inc();
                return Err("QUIC handshake timed out".into());
            }
        }
    }

    /// Feeds one inbound datagram (or GRO batch) into the codec, applying
    /// the spec'd outcome handling.
    fn process_incoming(
        &mut self, qconn: &mut quiche::Connection, mut pkt: Incoming,
    ) -> QuicResult<()> {
        let recv_info = quiche::RecvInfo {
            from: pkt.peer_addr,
            to: pkt.local_addr,
        };

        let mut recv_one = |dgram: &mut [u8],
                            error_slot: &mut ErrorSlot|
         -> QuicResult<()> {
            match qconn.recv(dgram, recv_info) {
                Ok(_) => Ok(()),
                Err(quiche::Error::Done) => Ok(()),
                Err(e) => {
                    // Transport-parameter violations must be reported as
                    // such even if the TLS library already recorded a
                    // generic alert.
                    let is_tp =
                        matches!(e, quiche::Error::InvalidTransportParam);
                    error_slot.record(
                        ErrorKind::Transport,
                        transport_wire_code(&e),
                        is_tp,
                    );
                    Err(e.into())
                },
            }
        };

        let outcome = if let Some(gro) = pkt.gro {
            let mut res = Ok(());
            for dgram in pkt.buf.chunks_mut(gro as usize) {
                res = recv_one(dgram, &mut self.error_slot);
                if res.is_err() {
                    break;
                }
            }
            res
        } else {
            recv_one(&mut pkt.buf, &mut self.error_slot)
        };

        match outcome {
            Ok(()) => {
                self.timers.reset_idle(Instant::now(), self.idle_timeout);
                Ok(())
            },
            Err(e) => {
                log::debug!(
                    "fatal error processing inbound packet";
                    "scid" => ?self.scid,
                    "error" => %e,
                );
                self.handle_error(qconn);
                // The loop keeps running so the CONNECTION_CLOSE produced by
                // the codec is flushed before teardown.
                Ok(())
            },
        }
    }

    /// Emits a CONNECTION_CLOSE for the recorded error. The codec usually
    /// has closed already; the explicit close covers errors detected above
    /// the codec.
    fn handle_error(&mut self, qconn: &mut quiche::Connection) {
        if qconn.local_error().is_some() {
            return;
        }

        let (app_close, code) = match self.error_slot.get() {
            Some((ErrorKind::Application, code)) => (true, code),
            Some((ErrorKind::Transport, code)) => (false, code),
            None => (false, quiche::WireErrorCode::NoError as u64),
        };

        let _ = qconn.close(app_close, code, &[]);
    }

    /// Transitions to Established once the codec installs application keys:
    /// verifies the negotiated ALPN and hands the connection to the
    /// application (which sets up the HTTP/3 session).
    fn on_handshake_progress(
        &mut self, qconn: &mut quiche::Connection,
    ) -> QuicResult<()> {
        if self.state != ConnectionState::Handshaking || !qconn.is_established()
        {
            return Ok(());
        }

        if qconn.application_proto().is_empty() {
            self.error_slot.record(
                ErrorKind::Transport,
                quiche::WireErrorCode::ProtocolViolation as u64,
                false,
            );
            self.handle_error(qconn);
            self.metrics
                .failed_handshakes(labels::HandshakeError::CryptoFail)
                .inc();
            return Err("no ALPN negotiated".into());
        }

        self.state = ConnectionState::Established;

        // The peer has adopted our SCID; its original DCID no longer routes.
        if let Some(pending_cid) = self.pending_cid.take() {
            let _ = self
                .conn_map_cmd_tx
                .send(ConnectionMapCommand::UnmapCid(pending_cid));
        }

        self.app.on_conn_established(qconn, &self.handshake_info)
    }

    /// The connection's current probe timeout estimate, used to size the
    /// graceful-shutdown and close-wait periods.
    fn pto(&self, qconn: &quiche::Connection) -> Duration {
        qconn
            .path_stats()
            .next()
            .map(|p| p.rtt + 4 * p.rttvar + MAX_ACK_DELAY)
            .unwrap_or(2 * self.initial_rtt + MAX_ACK_DELAY)
    }

    /// Packs outbound packets from the codec into the send buffer, honoring
    /// the GSO batching rules: equal segment sizes except a shorter tail, a
    /// packet budget derived from the send quantum, and a flush boundary
    /// when the path changes mid-batch.
    fn fill_send_buffer(
        &mut self, qconn: &mut quiche::Connection,
    ) -> QuicResult<usize> {
        let mut segment_size: Option<usize> = None;
        let mut send_info: Option<quiche::SendInfo> = None;

        self.write_state.num_pkts = 0;
        self.write_state.bytes_written = 0;
        self.write_state.split_at = None;

        let now = Instant::now();

        let max_udp_payload = self
            .payload_ceiling
            .min(qconn.max_send_udp_payload_size())
            .max(1);

        let mut max_pktcnt = (64 * 1024)
            .min(qconn.send_quantum())
            .div_euclid(max_udp_payload)
            .clamp(1, UDP_MAX_SEGMENT_COUNT);

        // Cap the burst when the congestion controller does not pace its
        // quantum itself.
        if !self.cfg.is_bbr {
            max_pktcnt = max_pktcnt.min(NON_BBR_BURST_LIMIT);
        }

        let buf_cap = UDP_MAX_GSO_PACKET_SIZE
            .min(self.send_buf.len())
            .min(max_pktcnt * max_udp_payload);

        let outcome = loop {
            let offset = self.write_state.bytes_written;
            let mut dst = &mut self.send_buf[offset..buf_cap];
            let seg = segment_size.unwrap_or(max_udp_payload);
            if dst.len() > seg {
                // A packet must never span a GSO segment boundary.
                dst = &mut dst[..seg];
            }

            let packet_size = match qconn.send(dst) {
                Ok((n, info)) => {
                    if let Some(prev) = &send_info {
                        if info.from != prev.from {
                            // Path changed mid-batch: everything before this
                            // packet flushes with the previous path, this
                            // packet flushes as a singleton.
                            self.write_state.split_at =
                                Some((offset, Some(info.from)));
                        }
                    }
                    let _ = send_info.get_or_insert(info);

                    self.write_state.bytes_written += n;
                    self.write_state.num_pkts += 1;
                    self.write_state.has_pending_data = true;
                    n
                },
                Err(quiche::Error::Done) => {
                    self.write_state.has_pending_data = false;
                    break Ok(0);
                },
                Err(e) => {
                    if qconn.local_error().is_none() {
                        let code = quiche::WireErrorCode::InternalError as u64;
                        self.error_slot.record(
                            ErrorKind::Transport,
                            code,
                            false,
                        );
                        let _ = qconn.close(false, code, &[]);
                        log::error!(
                            "quiche::send failed, closing connection";
                            "scid" => ?self.scid,
                            "error" => %e,
                        );
                    }
                    break Err(e);
                },
            };

            // Without GSO every packet is flushed individually.
            if !self.cfg.with_gso {
                break Ok(packet_size);
            }

            if self.write_state.split_at.is_some() {
                break Ok(packet_size);
            }

            if self.write_state.num_pkts == max_pktcnt {
                break Ok(packet_size);
            }

            // A shorter-than-segment packet is the batch's tail: the codec
            // has nothing more to send right now.
            match segment_size {
                Some(size)
                    if packet_size != size || packet_size < GSO_THRESHOLD =>
                    break Ok(packet_size),
                None => {
                    segment_size = Some(packet_size);
                    if packet_size < max_udp_payload.min(GSO_THRESHOLD) {
                        break Ok(packet_size);
                    }
                },
                _ => (),
            }
        };

        let tx_time = send_info
            .as_ref()
            .filter(|_| self.cfg.pacing_offload)
            .map(|v| v.at);

        self.write_state.tx_time = tx_time;
        self.write_state.send_from = send_info.as_ref().map(|v| v.from);
        self.write_state.segment_size =
            segment_size.unwrap_or(self.write_state.bytes_written);

        // If the pacer wants this batch sent noticeably in the future, hold
        // it and wake up shortly before the release time.
        if let Some(time) = tx_time {
            if time.saturating_duration_since(now) > DEFAULT_MAX_INTO_FUTURE {
                self.write_state.next_release_time =
                    Some(now + DEFAULT_MAX_INTO_FUTURE.mul_f32(0.8));
                self.write_state.has_pending_data = false;
            }
        }

        outcome.map_err(|e| -> crate::BoxError { Box::new(e) })
    }

    /// Flushes the accumulated batch with one GSO send (or a plain send when
    /// GSO is unavailable), splitting at a path-change boundary if one was
    /// recorded. Resets the idle timer after any bytes hit the socket.
    async fn flush_buffer_to_socket(&mut self, has_local_close: bool) {
        if self.write_state.bytes_written == 0 {
            return;
        }

        let (head_len, tail_from) = match self.write_state.split_at {
            Some((offset, from)) => (offset, from),
            None => (self.write_state.bytes_written, None),
        };

        let segment_size = self.write_state.segment_size.max(1);

        let head_res = self
            .send_range(0, head_len, self.write_state.send_from, segment_size)
            .await;
        self.note_send_result(head_res, head_len);

        if head_len < self.write_state.bytes_written {
            let tail_len = self.write_state.bytes_written - head_len;
            let tail_res = self
                .send_range(head_len, self.write_state.bytes_written, tail_from,
                    tail_len)
                .await;
            self.note_send_result(tail_res, tail_len);
        }

        // Retain a copy of the CONNECTION_CLOSE datagram for the close-wait
        // registry.
        if has_local_close && self.pending_close_pkt.is_none() {
            let len = self.write_state.bytes_written.min(MAX_CLOSE_WAIT_PKT);
            self.pending_close_pkt = Some(self.send_buf[..len].to_vec());
        }

        self.timers.reset_idle(Instant::now(), self.idle_timeout);
    }

    async fn send_range(
        &self, start: usize, end: usize, from: Option<SocketAddr>,
        segment_size: usize,
    ) -> std::io::Result<usize> {
        let buf = &self.send_buf[start..end];

        if self.cfg.with_gso {
            gso::send_to(
                &self.socket,
                self.cfg.peer_addr,
                from.filter(|_| self.cfg.with_pktinfo),
                buf,
                segment_size,
                self.write_state.tx_time,
            )
            .await
        } else {
            self.socket.send_to(buf, self.cfg.peer_addr).await
        }
    }

    fn note_send_result(
        &mut self, res: std::io::Result<usize>, expected: usize,
    ) {
        match res {
            Ok(n) =>
                if n < expected {
                    self.metrics
                        .write_errors(labels::QuicWriteError::Partial)
                        .inc();
                },
            Err(e) => {
                if self.cfg.with_gso && gso::is_gso_rejection(&e) {
                    // The kernel refused the GSO parameters; fall back to a
                    // payload size any path accepts, for the rest of this
                    // connection.
                    if self.payload_ceiling > FALLBACK_UDP_PAYLOAD_SIZE {
                        self.payload_ceiling = FALLBACK_UDP_PAYLOAD_SIZE;
                        self.metrics.gso_downgrades().inc();
                        log::debug!(
                            "GSO send rejected, shrinking max UDP payload";
                            "scid" => ?self.scid,
                            "payload" => FALLBACK_UDP_PAYLOAD_SIZE,
                        );
                    }
                }
                self.metrics.write_errors(labels::QuicWriteError::Err).inc();
            },
        }
    }

    /// Tears the connection down: final flush, close-wait installation, and
    /// CID unregistration. Every CID registered with the demultiplexer is
    /// unregistered exactly once here.
    async fn finalize(
        &mut self, qconn: &mut quiche::Connection, result: &QuicResult<()>,
    ) {
        if self.app.should_act() {
            self.app.on_conn_close(qconn, result);
        }

        // Merge the application's view of the failure into the error slot
        // before the sentinel is built.
        if let Some((kind, code)) = self.app.error_slot().get() {
            self.error_slot.record(kind, code, false);
        }

        if !self.idle_close && self.state != ConnectionState::Draining {
            self.handle_error(qconn);
            if self.fill_send_buffer(qconn).is_ok() {
                let has_local_close = qconn.local_error().is_some();
                self.flush_buffer_to_socket(has_local_close).await;
            }
        }

        let install_close_wait = !self.idle_close &&
            self.state != ConnectionState::Draining &&
            self.pending_close_pkt.is_some();

        if install_close_wait {
            let pkt = self.pending_close_pkt.take().unwrap();
            let period = 3 * self.pto(qconn);
            let cids = vec![self.scid.clone(), self.hashed_scid.clone()];

            let _ = self.conn_map_cmd_tx.send(
                ConnectionMapCommand::InstallCloseWait { cids, pkt, period },
            );
        }

        if let Some(pending_cid) = self.pending_cid.take() {
            let _ = self
                .conn_map_cmd_tx
                .send(ConnectionMapCommand::UnmapCid(pending_cid));
        }
        let _ = self
            .conn_map_cmd_tx
            .send(ConnectionMapCommand::UnmapCid(self.hashed_scid.clone()));
        let _ = self
            .conn_map_cmd_tx
            .send(ConnectionMapCommand::RemoveScid(self.scid.clone()));

        self.metrics.connections_in_memory().dec();

        log::debug!(
            "connection torn down";
            "scid" => ?self.scid,
            "state" => ?self.state,
            "idle" => self.idle_close,
            "close_wait" => install_close_wait,
        );
    }
}

/// The QUIC transport error code (RFC 9000 §20.1) for a codec error, used
/// when recording the error in the connection's last-error slot.
fn transport_wire_code(e: &quiche::Error) -> u64 {
    use quiche::WireErrorCode;

    let code = match e {
        quiche::Error::Done => WireErrorCode::NoError,
        quiche::Error::InvalidFrame => WireErrorCode::FrameEncodingError,
        quiche::Error::InvalidStreamState(_) => WireErrorCode::StreamStateError,
        quiche::Error::InvalidTransportParam =>
            WireErrorCode::TransportParameterError,
        quiche::Error::FlowControl => WireErrorCode::FlowControlError,
        quiche::Error::StreamLimit => WireErrorCode::StreamLimitError,
        quiche::Error::FinalSize => WireErrorCode::FinalSizeError,
        quiche::Error::IdLimit => WireErrorCode::ConnectionIdLimitError,
        quiche::Error::KeyUpdate => WireErrorCode::KeyUpdateError,
        quiche::Error::CryptoFail | quiche::Error::TlsFail =>
            return 0x0100, // CRYPTO_ERROR range
        _ => WireErrorCode::InternalError,
    };

    code as u64
}

/// Returns the minimum of `v1` and `v2`, ignoring `None`s.
fn min_of_some<T: Ord>(v1: Option<T>, v2: Option<T>) -> Option<T> {
    match (v1, v2) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (Some(v), _) | (_, Some(v)) => Some(v),
        (None, None) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn min_of_some_prefers_present_values() {
        let now = Instant::now();
        let later = now + Duration::from_secs(1);

        assert_eq!(min_of_some(Some(now), Some(later)), Some(now));
        assert_eq!(min_of_some(None, Some(later)), Some(later));
        assert_eq!(min_of_some(Some(now), None), Some(now));
        assert_eq!(min_of_some::<Instant>(None, None), None);
    }
}
