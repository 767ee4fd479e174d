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

use std::time::Duration;

use crate::result::QuicResult;
use crate::settings::ConnectionParams;
use crate::settings::CongestionController;
use crate::settings::QuicSettings;
use crate::settings::TlsCertificatePaths;
use crate::socket::SocketCapabilities;

/// Internal representation of the combined configuration for a QUIC
/// connection.
pub(crate) struct Config {
    pub quiche_config: quiche::Config,
    pub require_token: bool,
    pub qlog_dir: Option<String>,
    pub has_gso: bool,
    pub pacing_offload: bool,
    pub listen_backlog: usize,
    pub handshake_timeout: Option<Duration>,
    pub idle_timeout: Duration,
    pub initial_rtt: Duration,
    pub max_send_udp_payload_size: usize,
    pub congestion_controller: CongestionController,
    pub has_ippktinfo: bool,
    pub has_ipv6pktinfo: bool,
}

impl AsMut<quiche::Config> for Config {
    fn as_mut(&mut self) -> &mut quiche::Config {
        &mut self.quiche_config
    }
}

impl Config {
    pub(crate) fn new(
        params: &ConnectionParams, socket_capabilities: SocketCapabilities,
    ) -> QuicResult<Self> {
        let quic_settings = &params.settings;

        let congestion_controller = CongestionController::from_name(
            &quic_settings.congestion_controller,
        )
        .ok_or("unknown congestion controller")?;

        let SocketCapabilities {
            has_gso,
            has_txtime: pacing_offload,
            has_ippktinfo,
            has_ipv6pktinfo,
            ..
        } = socket_capabilities;

        Ok(Config {
            quiche_config: make_quiche_config(params, congestion_controller)?,
            require_token: quic_settings.require_token,
            qlog_dir: quic_settings.qlog_dir.clone(),
            has_gso,
            // Only enable pacing if it is explicitly enabled in the
            // configuration and offload is supported.
            pacing_offload: quic_settings.enable_pacing && pacing_offload,
            listen_backlog: quic_settings.listen_backlog,
            handshake_timeout: quic_settings.handshake_timeout,
            idle_timeout: quic_settings.timeout_idle,
            initial_rtt: quic_settings.initial_rtt,
            max_send_udp_payload_size: quic_settings.max_send_udp_payload_size,
            congestion_controller,
            has_ippktinfo,
            has_ipv6pktinfo,
        })
    }

}

fn make_quiche_config(
    params: &ConnectionParams, congestion_controller: CongestionController,
) -> QuicResult<quiche::Config> {
    let ssl_ctx_builder = params
        .hooks
        .connection_hook
        .as_ref()
        .zip(params.tls_cert)
        .and_then(|(hook, tls)| hook.create_custom_ssl_context_builder(tls));

    let mut config = if let Some(builder) = ssl_ctx_builder {
        quiche::Config::with_boring_ssl_ctx_builder(
            quiche::PROTOCOL_VERSION,
            builder,
        )?
    } else {
        quiche_config_with_tls(params.tls_cert)?
    };

    let quic_settings = &params.settings;
    let h3_settings = &params.http3;

    config
        .set_application_protos(quiche::h3::APPLICATION_PROTOCOL)
        .unwrap();

    let idle_ms = quic_settings
        .timeout_idle
        .as_millis()
        .try_into()
        .map_err(|_| "QuicSettings::timeout_idle exceeds u64")?;
    config.set_max_idle_timeout(idle_ms);

    config.set_max_recv_udp_payload_size(quic_settings.max_recv_udp_payload_size);
    config.set_max_send_udp_payload_size(quic_settings.max_send_udp_payload_size);

    config.set_initial_max_data(h3_settings.connection_window_size);
    config.set_initial_max_stream_data_bidi_local(h3_settings.window_size);
    config.set_initial_max_stream_data_bidi_remote(h3_settings.window_size);
    config.set_initial_max_stream_data_uni(h3_settings.window_size);
    config.set_max_connection_window(h3_settings.max_connection_window_size);
    config.set_max_stream_window(h3_settings.max_window_size);

    config.set_initial_max_streams_bidi(h3_settings.max_concurrent_streams);
    config.set_initial_max_streams_uni(QuicSettings::REQUIRED_UNI_STREAMS);

    // The demultiplexer steers every packet of a connection to the worker
    // that owns it by CID prefix, which assumes a symmetric path.
    config.set_disable_active_migration(true);

    config.set_cc_algorithm_name(congestion_controller.quiche_name())?;
    config.enable_hystart(true);
    config.enable_pacing(quic_settings.enable_pacing);
    config.grease(true);

    if quic_settings.early_data {
        config.enable_early_data();
    }

    if cfg!(feature = "capture-keylogs") &&
        std::env::var_os("SSLKEYLOGFILE").is_some()
    {
        config.log_keys();
    }

    Ok(config)
}

fn quiche_config_with_tls(
    tls_cert: Option<TlsCertificatePaths>,
) -> QuicResult<quiche::Config> {
    let Some(tls) = tls_cert else {
        return Ok(quiche::Config::new(quiche::PROTOCOL_VERSION).unwrap());
    };

    let mut config = quiche::Config::new(quiche::PROTOCOL_VERSION).unwrap();
    config.load_cert_chain_from_pem_file(tls.cert)?;
    config.load_priv_key_from_pem_file(tls.private_key)?;
    Ok(config)
}
