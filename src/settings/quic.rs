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

use foundations::settings::settings;
use serde_with::serde_as;
use serde_with::DurationMilliSeconds;
use std::time::Duration;

/// Congestion control algorithm for upstream QUIC connections.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum CongestionController {
    /// Bottleneck Bandwidth and Round-trip propagation time.
    #[default]
    Bbr,
    /// CUBIC with HyStart++.
    Cubic,
    /// Plain NewReno.
    Reno,
}

impl CongestionController {
    /// Parses the `quic.upstream.congestion_controller` setting.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "bbr" => Some(Self::Bbr),
            "cubic" => Some(Self::Cubic),
            "reno" => Some(Self::Reno),
            _ => None,
        }
    }

    /// The name [quiche] knows this algorithm by.
    pub fn quiche_name(self) -> &'static str {
        match self {
            Self::Bbr => "bbr2",
            Self::Cubic => "cubic",
            Self::Reno => "reno",
        }
    }
}

/// QUIC transport configuration for the client-facing endpoint
/// (`quic.upstream.*`).
#[serde_as]
#[settings]
pub struct QuicSettings {
    /// Idle timeout for the connection. The effective timeout is the minimum
    /// of this and the peer's `max_idle_timeout` transport parameter.
    ///
    /// Defaults to 30 seconds.
    #[serde(
        rename = "timeout_idle_ms",
        default = "QuicSettings::default_idle_timeout"
    )]
    #[serde_as(as = "DurationMilliSeconds")]
    pub timeout_idle: Duration,

    /// Initial smoothed RTT estimate before any sample is taken. Used to seed
    /// loss recovery and to size the 3×PTO graceful-shutdown and close-wait
    /// periods before the first RTT measurement.
    ///
    /// Defaults to 333 milliseconds, the RFC 9002 initial value.
    #[serde(
        rename = "initial_rtt_ms",
        default = "QuicSettings::default_initial_rtt"
    )]
    #[serde_as(as = "DurationMilliSeconds")]
    pub initial_rtt: Duration,

    /// Congestion control algorithm to use, one of `bbr`, `cubic`, or
    /// `reno`. Defaults to `bbr`.
    #[serde(default = "QuicSettings::default_congestion_controller")]
    pub congestion_controller: String,

    /// Forwards [quiche] logs into the logging system currently used by
    /// [`foundations`] (`quic.upstream.debug.log`). Defaults to `false`.
    ///
    /// # Warning
    /// This should **only be used for local debugging**. quiche can emit lots
    /// (and lots, and lots) of logs (the TRACE level emits a log record for
    /// every packet and frame) and you can very easily overwhelm your
    /// logging pipeline.
    pub debug_log: bool,

    /// Path to a directory where per-connection QLOG files will be saved
    /// (`quic.upstream.qlog.dir`). Files are named
    /// `<ISO8601>-<hex SCID>.sqlog` and created with mode 0640.
    pub qlog_dir: Option<String>,

    /// Whether to accept request data in 0-RTT packets.
    pub early_data: bool,

    /// Sets the maximum incoming UDP payload size. Defaults to 65527.
    #[serde(default = "QuicSettings::default_max_recv_udp_payload_size")]
    pub max_recv_udp_payload_size: usize,

    /// Sets the maximum outgoing UDP payload size. Defaults to 1350 bytes;
    /// permanently reduced to 1200 on a connection whose first GSO send
    /// fails with `EINVAL` or `EMSGSIZE`.
    #[serde(default = "QuicSettings::default_max_send_udp_payload_size")]
    pub max_send_udp_payload_size: usize,

    /// Whether to validate client IPs with a stateless Retry before creating
    /// connection state. Defaults to `true`.
    #[serde(default = "QuicSettings::default_require_token")]
    pub require_token: bool,

    /// Optionally enables pacing for outgoing packets.
    ///
    /// Note: this also requires pacing-compatible
    /// [`SocketCapabilities`](crate::socket::SocketCapabilities).
    pub enable_pacing: bool,

    /// A timeout for the QUIC handshake, in milliseconds. Disabled by
    /// default.
    #[serde(rename = "handshake_timeout_ms")]
    #[serde_as(as = "Option<DurationMilliSeconds>")]
    pub handshake_timeout: Option<Duration>,

    /// The maximum number of newly-created connections that will be queued
    /// for the worker to receive. Defaults to 1024 connections.
    #[serde(default = "QuicSettings::default_listen_backlog")]
    pub listen_backlog: usize,
}

impl QuicSettings {
    /// Number of unidirectional streams the peer must allow: HTTP/3 control
    /// plus the QPACK encoder and decoder streams.
    pub const REQUIRED_UNI_STREAMS: u64 = 3;

    #[inline]
    fn default_idle_timeout() -> Duration {
        Duration::from_secs(30)
    }

    #[inline]
    fn default_initial_rtt() -> Duration {
        Duration::from_millis(333)
    }

    #[inline]
    fn default_congestion_controller() -> String {
        "bbr".to_string()
    }

    #[inline]
    fn default_max_recv_udp_payload_size() -> usize {
        65527
    }

    #[inline]
    fn default_max_send_udp_payload_size() -> usize {
        1350
    }

    #[inline]
    fn default_require_token() -> bool {
        true
    }

    #[inline]
    fn default_listen_backlog() -> usize {
        1024
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_parse_as_milliseconds() {
        let quic = serde_json::from_str::<QuicSettings>(
            r#"{ "timeout_idle_ms": 7000, "handshake_timeout_ms": 5000 }"#,
        )
        .unwrap();

        assert_eq!(quic.timeout_idle, Duration::from_secs(7));
        assert_eq!(quic.handshake_timeout.unwrap(), Duration::from_secs(5));
    }

    #[test]
    fn congestion_controller_names() {
        assert_eq!(
            CongestionController::from_name("bbr"),
            Some(CongestionController::Bbr)
        );
        assert_eq!(
            CongestionController::from_name("cubic"),
            Some(CongestionController::Cubic)
        );
        assert_eq!(CongestionController::from_name("vegas"), None);

        assert_eq!(CongestionController::Bbr.quiche_name(), "bbr2");
        assert_eq!(CongestionController::Reno.quiche_name(), "reno");
    }
}
