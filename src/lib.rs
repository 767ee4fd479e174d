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

//! The HTTP/3-over-QUIC upstream endpoint of a reverse proxy.
//!
//! h3gate terminates QUIC connections from remote clients, runs HTTP/3
//! semantics on top of them via [quiche], and bridges each request stream
//! to a backend connection obtained from a
//! [`DownstreamConnector`](crate::proxy::DownstreamConnector) implemented
//! by the surrounding infrastructure.
//!
//! # Serving a frontend address
//!
//! A server [`listen`]s on a UDP socket for QUIC connections and starts
//! each accepted connection with a
//! [`ProxyH3Driver`](crate::http3::ProxyH3Driver):
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use h3gate::http3::ProxyH3Driver;
//! use h3gate::metrics::DefaultMetrics;
//! use h3gate::quic::CidIssuer;
//! use h3gate::quic::ShutdownSignal;
//! use h3gate::settings::ConnectionParams;
//! # use h3gate::http3::RequestHeaders;
//! # use h3gate::proxy::*;
//! # struct Pool;
//! # impl DownstreamConnector for Pool {
//! #     fn get_downstream_connection(
//! #         &self, _: u64, _: &RequestHeaders, _: DownstreamEventSender,
//! #     ) -> Result<Box<dyn DownstreamConnection>, BackendError> {
//! #         Err(BackendError::Network)
//! #     }
//! # }
//!
//! # async fn example(params: ConnectionParams<'_>) -> h3gate::QuicResult<()> {
//! let socket = std::net::UdpSocket::bind("0.0.0.0:443")?;
//! let shutdown = ShutdownSignal::new();
//! let connector = Arc::new(Pool);
//!
//! let mut conns = h3gate::listen(
//!     socket,
//!     &params,
//!     CidIssuer::ephemeral(),
//!     shutdown.clone(),
//!     DefaultMetrics,
//! )?;
//!
//! while let Some(conn) = conns.recv().await {
//!     let driver =
//!         ProxyH3Driver::new(&params, Arc::clone(&connector), shutdown.clone());
//!     conn?.start(driver);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! One such loop runs per worker; workers share nothing but the socket.
//! Datagrams are steered to the owning worker by the CID prefix embedded
//! in every connection ID the endpoint issues (see
//! [`CidIssuer`](crate::quic::CidIssuer)).

pub extern crate quiche;

pub mod buf_factory;
pub mod http3;
pub mod metrics;
pub mod proxy;
pub mod quic;
mod result;
pub mod settings;
pub mod socket;

use std::io;
use std::sync::Arc;
use std::sync::Once;

use foundations::telemetry::settings::LogVerbosity;
use tokio::sync::mpsc;

use crate::metrics::Metrics;
use crate::quic::CidIssuer;
use crate::quic::ShutdownSignal;
use crate::quic::UpstreamConnection;
use crate::socket::QuicListener;

pub use crate::result::BoxError;
pub use crate::result::QuicResult;
pub use crate::settings::ConnectionParams;

#[doc(hidden)]
pub use crate::result::QuicResultExt;

/// A stream of accepted [`UpstreamConnection`]s from a [`listen`] call.
///
/// Errors from processing a client's QUIC initials can also be emitted on
/// this stream. These do not indicate that the listener itself has failed.
pub type UpstreamConnectionStream<M> =
    mpsc::Receiver<io::Result<UpstreamConnection<M>>>;

/// Starts listening for inbound QUIC connections on `socket`.
///
/// The socket is converted into a [`QuicListener`] and all supported
/// capabilities (GSO, GRO, pktinfo, pacing offload) are probed on it. A
/// router task then takes ownership of its receive half, demultiplexes
/// datagrams by destination connection ID, and emits new connections on the
/// returned stream after validating the client's address.
///
/// `shutdown` is shared with the connections' drivers: triggering it
/// refuses new connections and gracefully drains established ones.
pub fn listen<S, M>(
    socket: S, params: &ConnectionParams, cid_issuer: CidIssuer,
    shutdown: ShutdownSignal, metrics: M,
) -> io::Result<UpstreamConnectionStream<M>>
where
    S: TryInto<QuicListener, Error = io::Error>,
    M: Metrics,
{
    #[cfg_attr(not(target_os = "linux"), expect(unused_mut))]
    let mut socket: QuicListener = socket.try_into()?;
    #[cfg(target_os = "linux")]
    socket.apply_max_capabilities();

    listen_with_capabilities(socket, params, cid_issuer, shutdown, metrics)
}

/// Starts listening on a pre-configured [`QuicListener`].
///
/// Unlike [`listen`], the socket's capabilities are taken as-is; use this
/// when sockopts were applied externally (or must stay off).
pub fn listen_with_capabilities<M>(
    socket: QuicListener, params: &ConnectionParams, cid_issuer: CidIssuer,
    shutdown: ShutdownSignal, metrics: M,
) -> io::Result<UpstreamConnectionStream<M>>
where
    M: Metrics,
{
    if params.settings.debug_log {
        capture_quiche_logs();
    }

    crate::quic::start_listener(socket, params, cid_issuer, shutdown, metrics)
}

static GLOBAL_LOGGER_ONCE: Once = Once::new();

/// Forward quiche logs into the slog::Drain currently used by Foundations.
///
/// # Warning
///
/// This should **only be used for local debugging**. Quiche can potentially
/// emit lots (and lots, and lots) of logs (the TRACE level emits a log
/// record on every packet and frame) and you can very easily overwhelm your
/// logging pipeline.
///
/// # Note
///
/// Quiche uses the `log` crate, which requires that the global logger is
/// only set once; the logger is therefore registered on the first
/// [`listen`] call that asks for it.
pub(crate) fn capture_quiche_logs() {
    GLOBAL_LOGGER_ONCE.call_once(|| {
        use foundations::telemetry::log as foundations_log;
        use log::Level as std_level;

        let curr_logger =
            Arc::clone(&foundations_log::slog_logger()).read().clone();
        let scope_guard = slog_scope::set_global_logger(curr_logger);

        // Convert slog::Level from Foundations settings to log::Level
        let normalized_level = match foundations_log::verbosity() {
            LogVerbosity::Critical | LogVerbosity::Error => std_level::Error,
            LogVerbosity::Warning => std_level::Warn,
            LogVerbosity::Info => std_level::Info,
            LogVerbosity::Debug => std_level::Debug,
            LogVerbosity::Trace => std_level::Trace,
        };

        slog_stdlog::init_with_level(normalized_level).unwrap();

        // The slog Drain becomes `slog::Discard` when the scope_guard is
        // dropped, and the global logger cannot be set again because of a
        // mandate in the `log` crate. The scope guard is deliberately
        // leaked so the logger remains registered for the duration of the
        // process.
        std::mem::forget(scope_guard)
    });
}
