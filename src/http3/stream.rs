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

//! Per-request state for one client-initiated bidirectional stream.

use std::collections::VecDeque;

use tokio_util::time::delay_queue;

use crate::proxy::AffinityCookie;
use crate::proxy::DownstreamConnection;

/// The request's parsed pseudo-headers and regular fields, handed to the
/// request hook and the backend connector.
#[derive(Clone, Debug, Default)]
pub struct RequestHeaders {
    pub method: String,
    pub scheme: Option<String>,
    pub authority: Option<String>,
    pub path: Option<String>,
    /// The `:protocol` pseudo-header of an extended CONNECT.
    pub protocol: Option<String>,
    /// Regular header fields with their never-index flag preserved.
    pub fields: Vec<(Vec<u8>, Vec<u8>, bool)>,
    pub content_length: Option<u64>,
}

impl RequestHeaders {
    /// The authority requests are accounted against in the downstream
    /// queue.
    pub fn queue_authority(&self) -> &str {
        self.authority.as_deref().unwrap_or("")
    }

    /// Whether this is a CONNECT that tunnels raw or WebSocket data.
    pub fn is_connect(&self) -> bool {
        self.method == "CONNECT"
    }
}

/// Where the request is in its path toward a backend.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub(crate) enum DispatchState {
    /// Headers not complete yet.
    #[default]
    Pending,
    /// Waiting in the downstream queue for a backend slot.
    Blocked,
    /// Attached to a backend connection.
    Active,
    /// No backend could be attached; an error reply was (or is being)
    /// sent.
    ConnectFail,
    /// The stream is finished and about to be removed.
    StreamClosed,
}

/// Progress of the backend's response.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub(crate) enum ResponseState {
    #[default]
    Initial,
    HeaderComplete,
    MsgComplete,
    MsgBadHeader,
    MsgReset,
}

/// State for one request stream. Owned by the driver's stream map; the map
/// key is the QUIC stream ID, which stands in for the codec's per-stream
/// user data (removal from the map is the "clear before drop").
pub(crate) struct RequestStream {
    pub(crate) request: RequestHeaders,
    pub(crate) trailers: Vec<(Vec<u8>, Vec<u8>, bool)>,

    pub(crate) dispatch: DispatchState,
    pub(crate) response: ResponseState,

    /// Attached backend connection while `dispatch` is Active.
    pub(crate) downstream: Option<Box<dyn DownstreamConnection>>,

    /// Request body received from the client but not yet accepted by the
    /// backend.
    pub(crate) upload_buf: VecDeque<u8>,
    /// Whether the client finished its request (FIN seen).
    pub(crate) request_done: bool,
    /// Whether `end_upload_data` was delivered to the backend.
    pub(crate) upload_finished: bool,
    /// Whether request headers were pushed to a backend; once they were,
    /// the request can no longer be retried on a fresh connection.
    pub(crate) request_submitted: bool,

    /// Buffered response body not yet accepted by the HTTP/3 codec.
    pub(crate) response_buf: VecDeque<u8>,
    /// Total response body bytes reported by the backend.
    pub(crate) response_bytes_received: u64,
    /// The backend's declared `content-length`, if any.
    pub(crate) response_content_length: Option<u64>,
    /// Trailers to submit once the response body drains.
    pub(crate) response_trailers: Vec<(Vec<u8>, Vec<u8>)>,
    /// Whether the initial response header section went to the codec.
    pub(crate) response_headers_sent: bool,
    /// Whether the response FIN went to the codec.
    pub(crate) response_fin_sent: bool,
    /// A 101 from the backend was translated to 200 for the tunnel.
    pub(crate) websocket_tunnel: bool,
    /// Response body bytes have reached the codec; suppresses retry for
    /// tunneled responses.
    pub(crate) response_body_started: bool,

    /// Affinity cookie pending injection into the response headers.
    pub(crate) pending_cookie: Option<AffinityCookie>,

    pub(crate) retries_left: u32,

    pub(crate) read_timer: Option<delay_queue::Key>,
    pub(crate) write_timer: Option<delay_queue::Key>,

    /// The client shut down its sending side; stop pulling request data.
    pub(crate) stop_reading: bool,
}

impl RequestStream {
    pub(crate) fn new(retries_left: u32) -> Self {
        RequestStream {
            request: RequestHeaders::default(),
            trailers: Vec::new(),

            dispatch: DispatchState::Pending,
            response: ResponseState::Initial,

            downstream: None,

            upload_buf: VecDeque::new(),
            request_done: false,
            upload_finished: false,
            request_submitted: false,

            response_buf: VecDeque::new(),
            response_bytes_received: 0,
            response_content_length: None,
            response_trailers: Vec::new(),
            response_headers_sent: false,
            response_fin_sent: false,
            websocket_tunnel: false,
            response_body_started: false,

            pending_cookie: None,

            retries_left,

            read_timer: None,
            write_timer: None,

            stop_reading: false,
        }
    }

    /// Whether a retry on a fresh backend connection is still permitted.
    pub(crate) fn can_retry(&self) -> bool {
        self.retries_left > 0 &&
            !self.request_submitted &&
            !self.response_body_started
    }

    /// Whether everything the backend produced has been handed to the
    /// codec. A stream with a complete response stays alive until this
    /// holds; the codec then acknowledges delivery to the peer.
    pub(crate) fn response_drained(&self) -> bool {
        self.response == ResponseState::MsgComplete &&
            self.response_buf.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_window_closes_once_submitted() {
        let mut stream = RequestStream::new(2);
        assert!(stream.can_retry());

        stream.request_submitted = true;
        assert!(!stream.can_retry());
    }

    #[test]
    fn retry_suppressed_for_started_tunnels() {
        let mut stream = RequestStream::new(2);
        stream.response_body_started = true;

        assert!(!stream.can_retry());
    }

    #[test]
    fn retry_exhausts() {
        let mut stream = RequestStream::new(1);
        assert!(stream.can_retry());

        stream.retries_left -= 1;
        assert!(!stream.can_retry());
    }
}
