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

//! Configuration for the QUIC upstream endpoint.

mod config;
mod http;
mod http3;
mod quic;

pub(crate) use self::config::*;

pub use self::http::*;
pub use self::http3::*;
pub use self::quic::*;

use std::sync::Arc;

use crate::http3::RequestHook;
use crate::quic::ConnectionHook;

/// Paths to the TLS certificate chain and private key presented to clients.
#[derive(Clone, Copy, Debug)]
pub struct TlsCertificatePaths<'a> {
    /// Path to the PEM certificate chain.
    pub cert: &'a str,
    /// Path to the PEM private key.
    pub private_key: &'a str,
}

/// Hook configuration for use in the connection and request lifecycle.
///
/// Use these to manage behavior outside of what the configuration structs
/// can express, such as a custom TLS context or the embedded request hook.
#[derive(Default, Clone)]
pub struct Hooks {
    /// Customizes the SSL context used for all connections on a socket.
    pub connection_hook: Option<Arc<dyn ConnectionHook + Send + Sync + 'static>>,
    /// Runs over every request after its headers complete, before dispatch.
    pub request_hook: Option<Arc<dyn RequestHook + Send + Sync + 'static>>,
}

impl std::fmt::Debug for Hooks {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        fn hook_status<T>(val: &Option<T>) -> &'static str {
            match val {
                Some(_) => "enabled",
                None => "disabled",
            }
        }

        f.debug_struct("Hooks")
            .field("connection_hook", &hook_status(&self.connection_hook))
            .field("request_hook", &hook_status(&self.request_hook))
            .finish()
    }
}

/// Combined configuration parameters required to serve QUIC connections.
///
/// [`ConnectionParams`] aggregates the transport, session, and HTTP proxy
/// settings for one frontend address. Servers should always specify TLS
/// credentials. The parameters can be modified freely after construction.
#[derive(Debug, Default)]
#[non_exhaustive] // force use of constructor functions
pub struct ConnectionParams<'a> {
    /// QUIC transport settings.
    pub settings: QuicSettings,
    /// HTTP/3 session settings.
    pub http3: Http3Settings,
    /// HTTP proxy behavior settings.
    pub http: HttpSettings,
    /// TLS credentials to authenticate with.
    pub tls_cert: Option<TlsCertificatePaths<'a>>,
    /// Hooks to use for connections and requests.
    pub hooks: Hooks,
}

impl<'a> ConnectionParams<'a> {
    /// Creates [`ConnectionParams`] for a frontend address.
    #[inline]
    pub fn new_server(
        settings: QuicSettings, http3: Http3Settings, http: HttpSettings,
        tls_cert: TlsCertificatePaths<'a>, hooks: Hooks,
    ) -> Self {
        Self {
            settings,
            http3,
            http,
            tls_cert: Some(tls_cert),
            hooks,
        }
    }
}
