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

use h3gate::settings::CongestionController;
use h3gate::settings::Http3Settings;
use h3gate::settings::HttpSettings;
use h3gate::settings::QuicSettings;

#[test]
fn quic_settings_defaults() {
    let quic: QuicSettings = serde_json::from_str("{}").unwrap();

    assert_eq!(quic.timeout_idle, Duration::from_secs(30));
    assert_eq!(quic.initial_rtt, Duration::from_millis(333));
    assert_eq!(
        CongestionController::from_name(&quic.congestion_controller),
        Some(CongestionController::Bbr)
    );
    assert!(quic.require_token);
    assert!(!quic.early_data);
    assert!(quic.qlog_dir.is_none());
    assert_eq!(quic.max_send_udp_payload_size, 1350);
}

#[test]
fn quic_settings_overrides() {
    let quic: QuicSettings = serde_json::from_str(
        r#"{
            "timeout_idle_ms": 60000,
            "initial_rtt_ms": 100,
            "congestion_controller": "cubic",
            "qlog_dir": "/var/log/qlog",
            "early_data": true
        }"#,
    )
    .unwrap();

    assert_eq!(quic.timeout_idle, Duration::from_secs(60));
    assert_eq!(quic.initial_rtt, Duration::from_millis(100));
    assert_eq!(
        CongestionController::from_name(&quic.congestion_controller),
        Some(CongestionController::Cubic)
    );
    assert_eq!(quic.qlog_dir.as_deref(), Some("/var/log/qlog"));
    assert!(quic.early_data);
}

#[test]
fn http3_settings_windows() {
    let h3: Http3Settings = serde_json::from_str("{}").unwrap();

    assert_eq!(h3.max_concurrent_streams, 100);
    assert_eq!(h3.connection_window_size, 1024 * 1024);
    assert_eq!(h3.window_size, 256 * 1024);
    assert_eq!(h3.max_connection_window_size, 6 * 1024 * 1024);
    assert_eq!(h3.max_window_size, 6 * 1024 * 1024);

    let h3: Http3Settings = serde_json::from_str(
        r#"{ "max_concurrent_streams": 4, "window_size": 65536 }"#,
    )
    .unwrap();

    assert_eq!(h3.max_concurrent_streams, 4);
    assert_eq!(h3.window_size, 65536);
}

#[test]
fn http_settings_admission_capacity_follows_proxy_mode() {
    let mut http: HttpSettings = serde_json::from_str(
        r#"{ "connections_per_host": 3, "connections_per_frontend": 50 }"#,
    )
    .unwrap();

    assert!(!http.http2_proxy);
    assert_eq!(http.downstream_capacity(), 50);

    http.http2_proxy = true;
    assert_eq!(http.downstream_capacity(), 3);
}

#[test]
fn http_settings_header_caps_and_rewrites() {
    let http: HttpSettings = serde_json::from_str(
        r#"{
            "server_name": "edge-1",
            "no_via": true,
            "request_header_field_buffer": 16384,
            "max_request_header_fields": 64,
            "add_response_headers": ["x-frame-options: DENY"],
            "redirect_https_port": 8443
        }"#,
    )
    .unwrap();

    assert_eq!(http.server_name, "edge-1");
    assert!(http.no_via);
    assert!(!http.no_server_rewrite);
    assert_eq!(http.request_header_field_buffer, 16384);
    assert_eq!(http.max_request_header_fields, 64);
    assert_eq!(http.redirect_https_port, 8443);
    assert_eq!(
        http.add_response_headers,
        vec!["x-frame-options: DENY".to_string()]
    );
}
