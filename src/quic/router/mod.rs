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

//! The connection demultiplexer.
//!
//! One router task owns the receive half of a frontend UDP socket. It maps
//! each datagram's destination CID to the worker task that owns the
//! connection, replays close-wait sentinels for recently torn-down
//! connections, and hands packets that open new connections to the
//! [`ConnectionAcceptor`]. The CID map is mutated only by this task;
//! workers request changes over a command channel.

pub(crate) mod acceptor;
mod map;

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use foundations::telemetry::log;
use quiche::ConnectionId;
use quiche::Header;
use quiche::MAX_CONN_ID_LEN;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use self::acceptor::ConnectionAcceptor;
use self::acceptor::NewConnection;
use self::map::ConnectionMap;
use crate::buf_factory::BufFactory;
use crate::buf_factory::PooledBuf;
use crate::metrics::labels;
use crate::metrics::Metrics;
use crate::quic::cid::SCID_LEN;
use crate::quic::close_wait::CloseWaitRegistry;
use crate::quic::connection::HandshakeInfo;
use crate::quic::connection::Incoming;
use crate::quic::connection::QuicConnectionParams;
use crate::quic::connection::UpstreamConnection;
use crate::quic::io::worker::WriterConfig;
use crate::settings::Config;
use crate::settings::CongestionController;

pub(crate) type ConnStream<M> =
    mpsc::Receiver<io::Result<UpstreamConnection<M>>>;

/// A message from a worker requesting a connection-map change.
pub(crate) enum ConnectionMapCommand {
    /// Remove a secondary mapping (hashed SCID or the client's pre-adoption
    /// DCID).
    UnmapCid(ConnectionId<'static>),
    /// Remove the connection's primary SCID.
    RemoveScid(ConnectionId<'static>),
    /// Park a CONNECTION_CLOSE sentinel for the connection's former CIDs.
    InstallCloseWait {
        cids: Vec<ConnectionId<'static>>,
        pkt: Vec<u8>,
        period: Duration,
    },
}

/// Flag a worker process sets to begin draining all its connections.
#[derive(Clone, Default)]
pub struct ShutdownSignal(Arc<AtomicBool>);

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begins graceful shutdown. Existing requests complete; new
    /// connections are refused.
    pub fn trigger(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

struct RecvData {
    bytes: usize,
    src_addr: SocketAddr,
    // The packet's real local address if `PKTINFO` reported one.
    dst_addr_override: Option<std::net::IpAddr>,
    ecn: u8,
    gro: Option<u16>,
}

/// Routes inbound datagrams to connections and accepts new ones.
pub(crate) struct InboundPacketRouter<M: Metrics> {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    config: Config,
    conns: ConnectionMap,
    acceptor: ConnectionAcceptor<M>,
    close_wait: CloseWaitRegistry<M>,
    shutdown: ShutdownSignal,
    shutdown_tx: Option<mpsc::Sender<()>>,
    shutdown_rx: mpsc::Receiver<()>,
    conn_map_cmd_tx: mpsc::UnboundedSender<ConnectionMapCommand>,
    conn_map_cmd_rx: mpsc::UnboundedReceiver<ConnectionMapCommand>,
    accept_sink: mpsc::Sender<io::Result<UpstreamConnection<M>>>,
    metrics: M,

    current_buf: PooledBuf,

    reusable_cmsg_space: Vec<u8>,
}

impl<M: Metrics> InboundPacketRouter<M> {
    pub(crate) fn new(
        config: Config, socket: Arc<UdpSocket>, local_addr: SocketAddr,
        acceptor: ConnectionAcceptor<M>, shutdown: ShutdownSignal, metrics: M,
    ) -> (Self, ConnStream<M>) {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let (accept_sink, accept_stream) =
            mpsc::channel(config.listen_backlog);
        let (conn_map_cmd_tx, conn_map_cmd_rx) = mpsc::unbounded_channel();

        // Space for the GRO segment size and IP(V6)_PKTINFO.
        #[cfg(target_os = "linux")]
        let reusable_cmsg_space =
            nix::cmsg_space!(u16, libc::in_pktinfo, libc::in6_pktinfo);
        #[cfg(not(target_os = "linux"))]
        let reusable_cmsg_space = Vec::new();

        (
            InboundPacketRouter {
                socket,
                local_addr,
                config,
                conns: ConnectionMap::default(),
                acceptor,
                close_wait: CloseWaitRegistry::new(metrics.clone()),
                shutdown,
                shutdown_tx: Some(shutdown_tx),
                shutdown_rx,
                conn_map_cmd_tx,
                conn_map_cmd_rx,
                accept_sink,
                metrics,

                current_buf: BufFactory::get_max_buf(),

                reusable_cmsg_space,
            },
            accept_stream,
        )
    }

    pub(crate) async fn run(mut self) -> io::Result<()> {
        loop {
            tokio::select! {
                cmd = self.conn_map_cmd_rx.recv() => match cmd {
                    Some(cmd) => self.on_conn_map_cmd(cmd),
                    // All command senders are gone once every worker
                    // finished; keep serving close-wait until told to stop.
                    None => {},
                },
                recv = Self::recv_packet(
                    &self.socket,
                    &mut self.current_buf,
                    &mut self.reusable_cmsg_space,
                ) => match recv {
                    Ok(recv) => {
                        if let Err(e) = self.on_incoming(recv) {
                            log::debug!("dropped inbound packet"; "error" => %e);
                        }
                    },
                    Err(e) => {
                        log::debug!("recv on listening socket failed"; "error" => %e);
                    },
                },
                _ = self.shutdown_rx.recv() => {},
                _ = std::future::poll_fn(|cx| {
                    self.close_wait.poll_expired(cx);
                    std::task::Poll::<()>::Pending
                }) => unreachable!(),
            }

            if self.accept_sink.is_closed() && self.shutdown_tx.is_some() {
                // The accept stream went away; no new connections from here
                // on. Existing workers keep the router alive for routing.
                self.shutdown_tx = None;
            }

            if self.shutdown_tx.is_none() &&
                self.conns.is_empty() &&
                self.close_wait.is_empty()
            {
                return Ok(());
            }
        }
    }

    fn on_conn_map_cmd(&mut self, cmd: ConnectionMapCommand) {
        match cmd {
            ConnectionMapCommand::UnmapCid(cid) => self.conns.unmap_cid(&cid),
            ConnectionMapCommand::RemoveScid(cid) => self.conns.remove(&cid),
            ConnectionMapCommand::InstallCloseWait { cids, pkt, period } =>
                self.close_wait.install(cids, pkt, period),
        }
    }

    fn on_incoming(&mut self, recv: RecvData) -> io::Result<()> {
        let local_addr = match recv.dst_addr_override {
            Some(ip) => SocketAddr::new(ip, self.local_addr.port()),
            None => self.local_addr,
        };

        let buf = &self.current_buf[..recv.bytes];

        // Short-header packets carry a bare CID of our fixed length.
        if let Some(dcid) = short_dcid(buf) {
            if let Some(ev_sender) = self.conns.get(&dcid) {
                let incoming = Incoming {
                    peer_addr: recv.src_addr,
                    local_addr,
                    buf: BufFactory::buf_from_slice(buf),
                    ecn: recv.ecn,
                    gro: recv.gro,
                };
                let _ = ev_sender.try_send(incoming);
                return Ok(());
            }

            if let Some(pkt) = self.close_wait.lookup(&dcid) {
                self.reply_close_wait(pkt.to_vec(), recv.src_addr);
                return Ok(());
            }

            return Ok(());
        }

        let mut header_buf = self.current_buf[..recv.bytes].to_vec();
        let hdr = Header::from_slice(&mut header_buf, MAX_CONN_ID_LEN)
            .map_err(|e| match e {
                quiche::Error::BufferTooShort | quiche::Error::InvalidPacket =>
                    labels::QuicInvalidInitialPacketError::FailedToParse.into(),
                e => io::Error::other(e),
            })?;

        let incoming = Incoming {
            peer_addr: recv.src_addr,
            local_addr,
            buf: BufFactory::buf_from_slice(buf),
            ecn: recv.ecn,
            gro: recv.gro,
        };

        if let Some(ev_sender) = self.conns.get(&hdr.dcid) {
            let _ = ev_sender.try_send(incoming);
            return Ok(());
        }

        if let Some(pkt) = self.close_wait.lookup(&hdr.dcid) {
            self.reply_close_wait(pkt.to_vec(), recv.src_addr);
            return Ok(());
        }

        // First-flight retransmissions route via the hashed SCID.
        let hashed = self.acceptor.hashed_scid(
            incoming.peer_addr,
            local_addr,
            &hdr.dcid,
        );
        if let Some(ev_sender) = self.conns.get(&hashed) {
            let _ = ev_sender.try_send(incoming);
            return Ok(());
        }

        if self.shutdown_tx.is_none() {
            return Ok(());
        }

        let new_connection = self.acceptor.handle_initials(
            incoming,
            hdr,
            self.config.as_mut(),
            self.shutdown.is_triggered(),
        )?;

        match new_connection {
            Some(new_connection) => self.spawn_new_connection(new_connection),
            None => Ok(()),
        }
    }

    /// Creates a new [`UpstreamConnection`] and passes it to the accept
    /// stream; its worker is spawned when the consumer calls `start`.
    fn spawn_new_connection(
        &mut self, new_connection: NewConnection,
    ) -> io::Result<()> {
        let NewConnection {
            conn,
            scid,
            hashed_scid,
            pending_cid,
            handshake_start_time,
            initial_pkt,
            local_addr,
            peer_addr,
        } = new_connection;

        let Some(ref shutdown_tx) = self.shutdown_tx else {
            // don't create new connections if we're shutting down.
            return Ok(());
        };
        let Ok(send_permit) = self.accept_sink.try_reserve() else {
            // drop the connection if the backlog is full. the client will
            // retry.
            return Err(
                labels::QuicInvalidInitialPacketError::AcceptQueueOverflow
                    .into(),
            );
        };

        let writer_cfg = WriterConfig {
            peer_addr,
            with_gso: self.config.has_gso,
            pacing_offload: self.config.pacing_offload,
            with_pktinfo: if self.local_addr.is_ipv4() {
                self.config.has_ippktinfo
            } else {
                self.config.has_ipv6pktinfo
            },
            max_send_udp_payload_size: self.config.max_send_udp_payload_size,
            is_bbr: matches!(
                self.config.congestion_controller,
                CongestionController::Bbr
            ),
        };

        let handshake_info = HandshakeInfo::new(
            handshake_start_time,
            self.config.handshake_timeout,
        );

        let conn = UpstreamConnection::new(QuicConnectionParams {
            writer_cfg,
            initial_pkt: Some(initial_pkt),
            shutdown_tx: shutdown_tx.clone(),
            conn_map_cmd_tx: self.conn_map_cmd_tx.clone(),
            scid: scid.clone(),
            hashed_scid: hashed_scid.clone(),
            pending_cid: pending_cid.clone(),
            metrics: self.metrics.clone(),
            handshake_info,
            quiche_conn: conn,
            socket: Arc::clone(&self.socket),
            local_addr,
            peer_addr,
            idle_timeout: self.config.idle_timeout,
            initial_rtt: self.config.initial_rtt,
        });

        self.conns.insert(scid, &conn);
        self.conns.map_cid(hashed_scid, &conn);

        // The client keeps using its own DCID until it adopts our SCID.
        if let Some(pending_cid) = pending_cid {
            self.conns.map_cid(pending_cid, &conn);
        }

        self.metrics.accepted_initial_packet_count().inc();

        send_permit.send(Ok(conn));
        Ok(())
    }

    fn reply_close_wait(&self, pkt: Vec<u8>, to: SocketAddr) {
        let socket = Arc::clone(&self.socket);
        task_killswitch::spawn_with_killswitch(async move {
            let _ = socket.send_to(&pkt, to).await;
        });
    }

    #[cfg(target_os = "linux")]
    async fn recv_packet(
        socket: &UdpSocket, buf: &mut PooledBuf, cmsg_space: &mut Vec<u8>,
    ) -> io::Result<RecvData> {
        use nix::sys::socket::recvmsg;
        use nix::sys::socket::ControlMessageOwned;
        use nix::sys::socket::MsgFlags;
        use nix::sys::socket::SockaddrStorage;
        use std::net::SocketAddrV4;
        use std::net::SocketAddrV6;
        use std::os::fd::AsRawFd;
        use tokio::io::Interest;

        loop {
            socket.readable().await?;
            cmsg_space.clear();

            let res = socket.try_io(Interest::READABLE, || {
                let iov_s = &mut [io::IoSliceMut::new(&mut buf[..])];
                recvmsg::<SockaddrStorage>(
                    socket.as_raw_fd(),
                    iov_s,
                    Some(cmsg_space),
                    MsgFlags::empty(),
                )
                .map(|r| {
                    let cmsgs: Vec<ControlMessageOwned> = r
                        .cmsgs()
                        .map(|iter| iter.collect())
                        .unwrap_or_default();
                    (r.bytes, r.address, cmsgs)
                })
                .map_err(io::Error::from)
            });

            let (bytes, address, cmsgs) = match res {
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                res => res?,
            };

            let src_addr = match address {
                Some(addr) =>
                    if let Some(v4) = addr.as_sockaddr_in() {
                        SocketAddrV4::from(*v4).into()
                    } else if let Some(v6) = addr.as_sockaddr_in6() {
                        SocketAddrV6::from(*v6).into()
                    } else {
                        return Err(io::ErrorKind::InvalidInput.into());
                    },
                None => return Err(io::ErrorKind::InvalidInput.into()),
            };

            let mut gro = None;
            let mut dst_addr_override = None;

            for cmsg in cmsgs {
                match cmsg {
                    ControlMessageOwned::UdpGroSegments(seg) =>
                        gro = Some(seg as u16),
                    ControlMessageOwned::Ipv4PacketInfo(info) => {
                        let ip = std::net::Ipv4Addr::from(
                            info.ipi_addr.s_addr.to_ne_bytes(),
                        );
                        dst_addr_override = Some(ip.into());
                    },
                    ControlMessageOwned::Ipv6PacketInfo(info) => {
                        let ip =
                            std::net::Ipv6Addr::from(info.ipi6_addr.s6_addr);
                        dst_addr_override = Some(ip.into());
                    },
                    _ => {},
                }
            }

            return Ok(RecvData {
                bytes,
                src_addr,
                dst_addr_override,
                ecn: 0,
                gro,
            });
        }
    }

    #[cfg(not(target_os = "linux"))]
    async fn recv_packet(
        socket: &UdpSocket, buf: &mut PooledBuf, _cmsg_space: &mut Vec<u8>,
    ) -> io::Result<RecvData> {
        let (bytes, src_addr) = socket.recv_from(&mut buf[..]).await?;

        Ok(RecvData {
            bytes,
            src_addr,
            dst_addr_override: None,
            ecn: 0,
            gro: None,
        })
    }
}

/// Extracts the DCID from a short-header packet. All CIDs issued by this
/// endpoint have the same fixed length, so the slice bounds are known.
fn short_dcid(buf: &[u8]) -> Option<ConnectionId> {
    let is_short = buf.first().map(|b| b & 0x80 == 0)?;

    if is_short && buf.len() > 1 + SCID_LEN {
        Some(ConnectionId::from_ref(&buf[1..1 + SCID_LEN]))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_dcid_parses_fixed_length() {
        let mut pkt = vec![0x41u8];
        pkt.extend_from_slice(&[7u8; SCID_LEN]);
        pkt.extend_from_slice(b"payload");

        let dcid = short_dcid(&pkt).unwrap();
        assert_eq!(dcid.as_ref(), &[7u8; SCID_LEN]);

        // Long-header packets don't take the short-cid fast path.
        let long = [0xc3u8; 64];
        assert!(short_dcid(&long).is_none());

        // Truncated runt packet.
        let runt = [0x41u8; 4];
        assert!(short_dcid(&runt).is_none());
    }
}
