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

/// HTTP-level proxy behavior shared by all upstream flavors (`http.*` plus
/// the per-frontend admission limits).
#[serde_as]
#[settings]
pub struct HttpSettings {
    /// Value injected into the `server` response header and the `via`
    /// pseudonym. Defaults to `h3gate`.
    #[serde(default = "HttpSettings::default_server_name")]
    pub server_name: String,

    /// Suppress appending this hop to the `via` response header.
    pub no_via: bool,

    /// Keep backend `location` headers untouched instead of rewriting their
    /// authority to the frontend's.
    pub no_location_rewrite: bool,

    /// Keep the backend's `server` header instead of replacing it.
    pub no_server_rewrite: bool,

    /// Static `name: value` fields appended to every response.
    pub add_response_headers: Vec<String>,

    /// Port to use in the `https://` redirect issued when a backend demands
    /// TLS. Defaults to 443 (omitted from the authority).
    #[serde(default = "HttpSettings::default_redirect_https_port")]
    pub redirect_https_port: u16,

    /// Total bytes of request header fields accepted on one stream
    /// before replying 431. Defaults to 64 KiB.
    #[serde(default = "HttpSettings::default_request_header_field_buffer")]
    pub request_header_field_buffer: usize,

    /// Number of request header fields accepted on one stream before
    /// replying 431. Defaults to 100.
    #[serde(default = "HttpSettings::default_max_request_header_fields")]
    pub max_request_header_fields: usize,

    /// Maximum concurrently active (dispatched to a backend) requests per
    /// authority when operating as an HTTP/2-style proxy.
    #[serde(default = "HttpSettings::default_connections_per_host")]
    pub connections_per_host: usize,

    /// Maximum concurrently active requests per frontend connection when not
    /// operating as a proxy.
    #[serde(default = "HttpSettings::default_connections_per_frontend")]
    pub connections_per_frontend: usize,

    /// Operate as an HTTP/2-style forward proxy: authority is mandatory for
    /// non-CONNECT requests and paths are forwarded verbatim.
    pub http2_proxy: bool,

    /// Number of times a request that never reached a backend is re-attached
    /// to a fresh backend connection. Defaults to 5.
    #[serde(default = "HttpSettings::default_max_downstream_retries")]
    pub max_downstream_retries: u32,

    /// Per-stream deadline for reading request data from the client.
    /// Defaults to 30 seconds.
    #[serde(
        rename = "stream_read_timeout_ms",
        default = "HttpSettings::default_stream_timeout"
    )]
    #[serde_as(as = "DurationMilliSeconds")]
    pub stream_read_timeout: Duration,

    /// Per-stream deadline for the client to drain buffered response data.
    /// Defaults to 30 seconds.
    #[serde(
        rename = "stream_write_timeout_ms",
        default = "HttpSettings::default_stream_timeout"
    )]
    #[serde_as(as = "DurationMilliSeconds")]
    pub stream_write_timeout: Duration,
}

impl HttpSettings {
    /// Admission cap for one frontend connection, per spec'd proxy mode.
    pub fn downstream_capacity(&self) -> usize {
        if self.http2_proxy {
            self.connections_per_host
        } else {
            self.connections_per_frontend
        }
    }

    #[inline]
    fn default_server_name() -> String {
        "h3gate".to_string()
    }

    #[inline]
    fn default_redirect_https_port() -> u16 {
        443
    }

    #[inline]
    fn default_request_header_field_buffer() -> usize {
        64 * 1024
    }

    #[inline]
    fn default_max_request_header_fields() -> usize {
        100
    }

    #[inline]
    fn default_connections_per_host() -> usize {
        8
    }

    #[inline]
    fn default_connections_per_frontend() -> usize {
        100
    }

    #[inline]
    fn default_max_downstream_retries() -> u32 {
        5
    }

    #[inline]
    fn default_stream_timeout() -> Duration {
        Duration::from_secs(30)
    }
}
