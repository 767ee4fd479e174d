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

//! Metrics for the proxy's QUIC upstream endpoint.

pub mod labels;

use foundations::telemetry::metrics::metrics;
use foundations::telemetry::metrics::Counter;
use foundations::telemetry::metrics::Gauge;

/// Collection of metrics for the upstream endpoint.
///
/// The trait is parameterized over the listener so that tenants can track
/// their connections separately. All methods return cheap handles into the
/// metrics registry.
pub trait Metrics: Clone + Send + Sync + Unpin + 'static {
    /// Number of QUIC connections currently in memory.
    fn connections_in_memory(&self) -> Gauge;

    /// Number of accepted QUIC initial packets.
    fn accepted_initial_packet_count(&self) -> Counter;

    /// Number of rejected QUIC initial packets.
    fn rejected_initial_packet_count(
        &self, reason: labels::QuicInvalidInitialPacketError,
    ) -> Counter;

    /// Number of failed QUIC handshakes.
    fn failed_handshakes(&self, reason: labels::HandshakeError) -> Counter;

    /// Number of UDP packets dropped or truncated on write.
    fn write_errors(&self, reason: labels::QuicWriteError) -> Counter;

    /// Number of sends downgraded to a 1200-byte payload ceiling after a
    /// GSO failure.
    fn gso_downgrades(&self) -> Counter;

    /// Number of HTTP responses generated locally by the proxy, by status.
    fn local_error_replies(&self, status: u16) -> Counter;

    /// Number of connections parked in the close-wait registry.
    fn close_wait_entries(&self) -> Gauge;
}

/// Standard implementation of [`Metrics`] using
/// [`foundations::telemetry::metrics`].
#[derive(Default, Clone, Copy, Debug)]
pub struct DefaultMetrics;

impl Metrics for DefaultMetrics {
    fn connections_in_memory(&self) -> Gauge {
        upstream_metrics::connections_in_memory()
    }

    fn accepted_initial_packet_count(&self) -> Counter {
        upstream_metrics::accepted_initial_packet_count()
    }

    fn rejected_initial_packet_count(
        &self, reason: labels::QuicInvalidInitialPacketError,
    ) -> Counter {
        upstream_metrics::rejected_initial_packet_count(reason)
    }

    fn failed_handshakes(&self, reason: labels::HandshakeError) -> Counter {
        upstream_metrics::failed_handshakes(reason)
    }

    fn write_errors(&self, reason: labels::QuicWriteError) -> Counter {
        upstream_metrics::write_errors(reason)
    }

    fn gso_downgrades(&self) -> Counter {
        upstream_metrics::gso_downgrades()
    }

    fn local_error_replies(&self, status: u16) -> Counter {
        upstream_metrics::local_error_replies(status)
    }

    fn close_wait_entries(&self) -> Gauge {
        upstream_metrics::close_wait_entries()
    }
}

#[metrics]
pub(crate) mod upstream_metrics {
    /// Number of QUIC connections currently in memory
    pub fn connections_in_memory() -> Gauge;

    /// Number of accepted QUIC initial packets
    pub fn accepted_initial_packet_count() -> Counter;

    /// Number of rejected QUIC initial packets
    pub fn rejected_initial_packet_count(
        reason: super::labels::QuicInvalidInitialPacketError,
    ) -> Counter;

    /// Number of failed QUIC handshakes
    pub fn failed_handshakes(reason: super::labels::HandshakeError) -> Counter;

    /// Number of write errors on the UDP socket
    pub fn write_errors(reason: super::labels::QuicWriteError) -> Counter;

    /// Number of permanent GSO payload downgrades
    pub fn gso_downgrades() -> Counter;

    /// Number of locally generated HTTP error replies
    pub fn local_error_replies(status: u16) -> Counter;

    /// Number of close-wait entries currently retained
    pub fn close_wait_entries() -> Gauge;
}
