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

//! The contract toward backend ("downstream") connections.
//!
//! The surrounding infrastructure owns the backend connection pool; this
//! module defines the seam the HTTP/3 driver talks through. A
//! [`DownstreamConnector`] hands out one [`DownstreamConnection`] per
//! proxied request, and the backend reports progress for that request as
//! [`DownstreamEvent`]s on the driver's event channel.

use std::fmt;

use tokio::sync::mpsc;

use crate::http3::RequestHeaders;
use crate::QuicResult;

/// Errors the backend layer reports for a request.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BackendError {
    /// The backend only accepts this request over TLS; the client is
    /// redirected to `https://`.
    TlsRequired,
    /// Connecting to or talking to the backend failed.
    Network,
    /// The backend did not respond in time.
    Timeout,
    /// The backend refused to take the stream; safe to retry elsewhere.
    Refused,
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::TlsRequired => "backend requires TLS",
            Self::Network => "backend network error",
            Self::Timeout => "backend timeout",
            Self::Refused => "backend refused stream",
        };
        f.write_str(s)
    }
}

impl std::error::Error for BackendError {}

/// How a backend ended a response stream prematurely.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DownstreamResetCode {
    /// Clean cutoff; the client sees `H3_NO_ERROR`.
    NoError,
    /// The stream was refused before processing; the client sees
    /// `H3_REQUEST_REJECTED` and may retry.
    RefusedStream,
    /// Anything else maps to `H3_INTERNAL_ERROR`.
    Other,
}

/// A session-affinity cookie to set on responses routed to a particular
/// backend.
#[derive(Clone, Debug)]
pub struct AffinityCookie {
    pub name: String,
    pub value: String,
    pub path: Option<String>,
    pub secure: bool,
}

impl AffinityCookie {
    /// The `set-cookie` header value for this cookie.
    pub fn header_value(&self) -> String {
        let mut value = format!("{}={}", self.name, self.value);

        if let Some(path) = &self.path {
            value.push_str("; Path=");
            value.push_str(path);
        }

        if self.secure {
            value.push_str("; Secure");
        }

        value
    }
}

/// Progress reports from a backend connection for one proxied request,
/// delivered on the driver's event channel.
#[derive(Debug)]
pub enum DownstreamEvent {
    /// The response header section is complete. `content_length` echoes the
    /// backend's `content-length` declaration, if any.
    HeaderComplete {
        stream_id: u64,
        status: u16,
        headers: Vec<(Vec<u8>, Vec<u8>)>,
        content_length: Option<u64>,
    },
    /// A chunk of response body.
    Body { stream_id: u64, data: Vec<u8> },
    /// The response body is complete; trailers follow if non-empty.
    BodyComplete {
        stream_id: u64,
        trailers: Vec<(Vec<u8>, Vec<u8>)>,
    },
    /// The backend closed the stream without completing the response.
    Eof { stream_id: u64 },
    /// The backend produced a header section this endpoint cannot forward.
    BadHeader { stream_id: u64 },
    /// The backend reset the response stream.
    Reset {
        stream_id: u64,
        code: DownstreamResetCode,
    },
    /// The backend connection failed for this request. If `no_retry` is
    /// unset and the request was never submitted, the driver re-attaches it
    /// to a fresh backend connection.
    ConnectionReset {
        stream_id: u64,
        no_retry: bool,
        error: BackendError,
    },
    /// The backend asks the proxy to answer with a canned status.
    AbortRequest { stream_id: u64, status: u16 },
    /// The backend drained its upload buffer; more request body may be
    /// pushed.
    WriteResumed { stream_id: u64 },
}

impl DownstreamEvent {
    pub fn stream_id(&self) -> u64 {
        match self {
            Self::HeaderComplete { stream_id, .. } |
            Self::Body { stream_id, .. } |
            Self::BodyComplete { stream_id, .. } |
            Self::Eof { stream_id } |
            Self::BadHeader { stream_id } |
            Self::Reset { stream_id, .. } |
            Self::ConnectionReset { stream_id, .. } |
            Self::AbortRequest { stream_id, .. } |
            Self::WriteResumed { stream_id } => *stream_id,
        }
    }
}

/// Sends [`DownstreamEvent`]s into the HTTP/3 driver's wait loop.
pub type DownstreamEventSender = mpsc::UnboundedSender<DownstreamEvent>;
pub(crate) type DownstreamEventStream =
    mpsc::UnboundedReceiver<DownstreamEvent>;

/// One backend connection, attached to exactly one proxied request.
pub trait DownstreamConnection: Send {
    /// Submits the (already transformed) request headers to the backend.
    fn push_request_headers(&mut self, req: &RequestHeaders) -> QuicResult<()>;

    /// Pushes a chunk of request body. Implementations buffer internally
    /// and signal renewed capacity with [`DownstreamEvent::WriteResumed`];
    /// an error rejects the chunk and tears the request stream down.
    fn push_upload_data_chunk(
        &mut self, data: &[u8],
    ) -> Result<(), BackendError>;

    /// Marks the request body complete.
    fn end_upload_data(&mut self) -> QuicResult<()>;

    /// Backpressure release: the client acknowledged buffered response data,
    /// the backend may produce more.
    fn resume_read(&mut self);

    /// The affinity cookie to set on this request's response, if the
    /// backend group uses cookie affinity.
    fn affinity_cookie(&self) -> Option<AffinityCookie> {
        None
    }

    /// The authority of the connected backend, used to rewrite `location`
    /// headers that point back at it.
    fn backend_authority(&self) -> Option<String> {
        None
    }

    /// Detaches the connection from its request. `reuse` indicates the
    /// stream completed cleanly and the connection may return to the pool.
    fn release(self: Box<Self>, reuse: bool);
}

/// Hands out backend connections for requests.
pub trait DownstreamConnector: Send + Sync + 'static {
    /// Selects a backend for `req` and attaches a new
    /// [`DownstreamConnection`] that reports its progress for
    /// `stream_id` on `events`.
    fn get_downstream_connection(
        &self, stream_id: u64, req: &RequestHeaders,
        events: DownstreamEventSender,
    ) -> Result<Box<dyn DownstreamConnection>, BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn affinity_cookie_header_value() {
        let cookie = AffinityCookie {
            name: "lb".to_string(),
            value: "a1b2c3".to_string(),
            path: Some("/".to_string()),
            secure: true,
        };

        assert_eq!(cookie.header_value(), "lb=a1b2c3; Path=/; Secure");

        let bare = AffinityCookie {
            name: "lb".to_string(),
            value: "a1b2c3".to_string(),
            path: None,
            secure: false,
        };

        assert_eq!(bare.header_value(), "lb=a1b2c3");
    }
}
