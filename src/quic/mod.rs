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

//! The QUIC transport half of the upstream endpoint: connection
//! demultiplexing, acceptance, per-connection I/O workers, and the
//! close-wait registry.

use std::sync::Arc;

use foundations::telemetry::log;
use quiche::ConnectionId;

use crate::metrics::Metrics;
use crate::settings::Config;
use crate::socket::QuicListener;
use crate::ConnectionParams;

pub mod cid;
pub(crate) mod close_wait;
pub(crate) mod connection;
pub(crate) mod io;
pub(crate) mod router;
pub(crate) mod timer;
pub(crate) mod token;

pub use self::cid::CidIssuer;
pub use self::cid::KeyingMaterial;
pub use self::cid::KeyingMaterials;
pub use self::connection::ApplicationOverQuic;
pub use self::connection::ConnectionHandle;
pub use self::connection::ConnectionHook;
pub use self::connection::ConnectionState;
pub use self::connection::ErrorKind;
pub use self::connection::ErrorSlot;
pub use self::connection::HandshakeInfo;
pub use self::connection::Incoming;
pub use self::connection::PreIo;
pub use self::connection::TimerEvent;
pub use self::connection::UpstreamConnection;
pub use self::router::ShutdownSignal;

use self::router::acceptor::ConnectionAcceptor;
use self::router::ConnStream;
use self::router::InboundPacketRouter;

/// Creates a per-connection qlog writer: `<dir>/<ISO8601>-<hex SCID>.sqlog`,
/// mode 0640.
pub(crate) fn make_qlog_writer(
    dir: &str, scid: &ConnectionId,
) -> std::io::Result<std::io::BufWriter<std::fs::File>> {
    let now = time::OffsetDateTime::now_utc();
    let timestamp = now
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(std::io::Error::other)?;

    let mut path = std::path::PathBuf::from(dir);
    path.push(format!("{timestamp}-{scid:?}.sqlog"));

    let mut opts = std::fs::File::options();
    opts.create_new(true).write(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(0o640);
    }

    let f = opts.open(&path)?;
    Ok(std::io::BufWriter::new(f))
}

pub(crate) fn start_listener<M>(
    socket: QuicListener, params: &ConnectionParams, cid_issuer: CidIssuer,
    shutdown: ShutdownSignal, metrics: M,
) -> std::io::Result<ConnStream<M>>
where
    M: Metrics,
{
    use crate::result::QuicResultExt;

    let config = Config::new(params, socket.capabilities).into_io()?;

    let local_addr = socket.socket.local_addr()?;
    let socket = Arc::new(socket.socket);

    let acceptor = ConnectionAcceptor::new(
        config.qlog_dir.clone(),
        config.require_token,
        Arc::clone(&socket),
        cid_issuer,
        metrics.clone(),
    );

    let (router, accept_stream) = InboundPacketRouter::new(
        config,
        socket,
        local_addr,
        acceptor,
        shutdown,
        metrics,
    );

    task_killswitch::spawn_with_killswitch(async move {
        match router.run().await {
            Ok(()) => log::trace!("incoming packet router finished"),
            Err(error) => {
                log::error!("incoming packet router failed"; "error" => %error)
            },
        }
    });

    Ok(accept_stream)
}
