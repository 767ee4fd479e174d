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

/// HTTP/3 session parameters for the client-facing endpoint
/// (`http3.upstream.*`).
#[settings]
pub struct Http3Settings {
    /// Number of request streams the client may have in flight; advertised
    /// as the `initial_max_streams_bidi` transport parameter and topped up
    /// as streams close. Defaults to `100`.
    #[serde(default = "Http3Settings::default_max_concurrent_streams")]
    pub max_concurrent_streams: u64,

    /// Hard cap the connection-level flow control window may grow to.
    /// Defaults to 6 MiB.
    #[serde(default = "Http3Settings::default_max_window_size")]
    pub max_connection_window_size: u64,

    /// Hard cap a single stream's flow control window may grow to.
    /// Defaults to 6 MiB.
    #[serde(default = "Http3Settings::default_max_window_size")]
    pub max_window_size: u64,

    /// Initial connection-level flow control window (`initial_max_data`).
    /// Defaults to 1 MiB.
    #[serde(default = "Http3Settings::default_connection_window_size")]
    pub connection_window_size: u64,

    /// Initial per-stream flow control window
    /// (`initial_max_stream_data_bidi_remote` and `_uni`). Defaults to
    /// 256 KiB.
    #[serde(default = "Http3Settings::default_window_size")]
    pub window_size: u64,
}

impl Http3Settings {
    /// Capacity advertised for the peer's QPACK dynamic table.
    pub const QPACK_MAX_DTABLE_CAPACITY: u64 = 4096;

    #[inline]
    fn default_max_concurrent_streams() -> u64 {
        100
    }

    #[inline]
    fn default_max_window_size() -> u64 {
        6 * 1024 * 1024
    }

    #[inline]
    fn default_connection_window_size() -> u64 {
        1024 * 1024
    }

    #[inline]
    fn default_window_size() -> u64 {
        256 * 1024
    }
}
