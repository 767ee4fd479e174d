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

//! The server-side HTTP/3 proxy driver.
//!
//! [`ProxyH3Driver`] is the [`ApplicationOverQuic`] that runs HTTP/3
//! semantics on an upstream connection and bridges each request stream to a
//! backend connection: header transforms, body pipelining in both
//! directions, admission queuing, retries, error replies, and graceful
//! shutdown.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use foundations::telemetry::log;
use quiche::h3;
use quiche::h3::NameValue;
use tokio::select;
use tokio_util::time::delay_queue::DelayQueue;

use crate::buf_factory::BufFactory;
use crate::buf_factory::PooledBuf;
use crate::http3::headers;
use crate::http3::queue::DownstreamQueue;
use crate::http3::stream::DispatchState;
use crate::http3::stream::RequestStream;
use crate::http3::stream::ResponseState;
use crate::http3::RequestHeaders;
use crate::http3::RequestHook;
use crate::metrics::upstream_metrics;
use crate::proxy::BackendError;
use crate::proxy::DownstreamConnector;
use crate::proxy::DownstreamEvent;
use crate::proxy::DownstreamEventSender;
use crate::proxy::DownstreamEventStream;
use crate::proxy::DownstreamResetCode;
use crate::quic::ApplicationOverQuic;
use crate::quic::ErrorKind;
use crate::quic::ErrorSlot;
use crate::quic::HandshakeInfo;
use crate::quic::PreIo;
use crate::quic::ShutdownSignal;
use crate::quic::TimerEvent;
use crate::settings::ConnectionParams;
use crate::settings::Http3Settings;
use crate::settings::HttpSettings;
use crate::settings::QuicSettings;
use crate::QuicResult;

/// Advisory GOAWAY stream ID announcing shutdown without committing to a
/// cutoff yet (RFC 9114 §5.2).
const SHUTDOWN_NOTICE_ID: u64 = (1 << 62) - 4;

/// Resume the backend's read side once this little response data remains
/// buffered.
const RESPONSE_RESUME_WATERMARK: usize = 64 * 1024;

/// Which per-stream deadline fired.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum StreamTimer {
    Read,
    Write,
}

/// The server-side HTTP/3 proxy application.
pub struct ProxyH3Driver<C> {
    h3_config: h3::Config,
    /// The underlying HTTP/3 session. Created once application keys are
    /// installed.
    conn: Option<h3::Connection>,

    http: Arc<HttpSettings>,
    request_hook: Option<Arc<dyn RequestHook + Send + Sync + 'static>>,
    connector: Arc<C>,

    shutdown: ShutdownSignal,
    shutdown_notice_sent: bool,
    goaway_sent: bool,

    /// Stream ID → per-request state. The map is the arena the codec's
    /// stream user data points into; removal is the "clear before drop".
    streams: BTreeMap<u64, RequestStream>,
    queue: DownstreamQueue,

    ev_tx: DownstreamEventSender,
    ev_rx: DownstreamEventStream,

    stream_timers: DelayQueue<(u64, StreamTimer)>,
    read_timeout: Duration,
    write_timeout: Duration,

    recv_buf: PooledBuf,
    error_slot: ErrorSlot,

    /// The highest request stream ID seen on this connection.
    max_stream_seen: u64,
    /// Bidirectional request streams fully closed and returned as
    /// max-streams credit.
    closed_bidi_streams: u64,
}

impl<C: DownstreamConnector> ProxyH3Driver<C> {
    pub fn new(
        params: &ConnectionParams, connector: Arc<C>,
        shutdown: ShutdownSignal,
    ) -> Self {
        let (ev_tx, ev_rx) = tokio::sync::mpsc::unbounded_channel();

        let http = Arc::new(params.http.clone());
        let queue =
            DownstreamQueue::new(http.downstream_capacity(), http.http2_proxy);

        ProxyH3Driver {
            h3_config: make_h3_config(&params.http),
            conn: None,

            request_hook: params.hooks.request_hook.clone(),
            connector,

            shutdown,
            shutdown_notice_sent: false,
            goaway_sent: false,

            streams: BTreeMap::new(),
            queue,

            ev_tx,
            ev_rx,

            stream_timers: DelayQueue::new(),
            read_timeout: http.stream_read_timeout,
            write_timeout: http.stream_write_timeout,

            http,

            recv_buf: BufFactory::get_max_buf(),
            error_slot: ErrorSlot::default(),

            max_stream_seen: 0,
            closed_bidi_streams: 0,
        }
    }

    /// Request streams that have been fully closed, each of which returned
    /// one unit of max-streams credit to the peer.
    pub fn closed_bidi_streams(&self) -> u64 {
        self.closed_bidi_streams
    }

    fn conn_mut(&mut self) -> QuicResult<&mut h3::Connection> {
        self.conn
            .as_mut()
            .ok_or_else(|| "HTTP/3 session not established".into())
    }

    // Per-stream timer plumbing. A timer is rearmed in place when its key
    // is still live.

    fn arm_read_timer(&mut self, stream_id: u64) {
        let timeout = self.read_timeout;
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return;
        };

        match &stream.read_timer {
            Some(key) => self.stream_timers.reset(key, timeout),
            None => {
                let key = self
                    .stream_timers
                    .insert((stream_id, StreamTimer::Read), timeout);
                stream.read_timer = Some(key);
            },
        }
    }

    fn disarm_read_timer(&mut self, stream_id: u64) {
        if let Some(stream) = self.streams.get_mut(&stream_id) {
            if let Some(key) = stream.read_timer.take() {
                self.stream_timers.try_remove(&key);
            }
        }
    }

    fn arm_write_timer(&mut self, stream_id: u64) {
        let timeout = self.write_timeout;
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return;
        };

        match &stream.write_timer {
            Some(key) => self.stream_timers.reset(key, timeout),
            None => {
                let key = self
                    .stream_timers
                    .insert((stream_id, StreamTimer::Write), timeout);
                stream.write_timer = Some(key);
            },
        }
    }

    fn disarm_write_timer(&mut self, stream_id: u64) {
        if let Some(stream) = self.streams.get_mut(&stream_id) {
            if let Some(key) = stream.write_timer.take() {
                self.stream_timers.try_remove(&key);
            }
        }
    }

    /// Removes a stream: shuts down the requested sides, detaches its
    /// backend, pulls it out of the admission queue (activating the next
    /// blocked request), and clears its timers. The max-streams credit for
    /// the closed stream is accounted here.
    fn finish_stream(
        &mut self, qconn: &mut quiche::Connection, stream_id: u64,
        read: Option<u64>, write: Option<u64>,
    ) {
        self.disarm_read_timer(stream_id);
        self.disarm_write_timer(stream_id);

        let Some(mut stream) = self.streams.remove(&stream_id) else {
            return;
        };
        stream.dispatch = DispatchState::StreamClosed;

        if let Some(err) = read {
            let _ =
                qconn.stream_shutdown(stream_id, quiche::Shutdown::Read, err);
        }

        if let Some(err) = write {
            let _ =
                qconn.stream_shutdown(stream_id, quiche::Shutdown::Write, err);
        }

        if let Some(downstream) = stream.downstream.take() {
            let reuse = stream.response == ResponseState::MsgComplete &&
                read.is_none() &&
                write.is_none();
            downstream.release(reuse);
        }

        self.closed_bidi_streams += 1;

        if let Some(next) = self.queue.remove(stream_id) {
            if let Err(e) = self.attach_downstream(qconn, next) {
                log::debug!(
                    "failed to activate queued request";
                    "stream_id" => next,
                    "error" => %e,
                );
            }
        }
    }

    /// Attaches a queued request to a backend connection and pushes the
    /// request (headers plus any buffered body) toward it.
    fn attach_downstream(
        &mut self, qconn: &mut quiche::Connection, stream_id: u64,
    ) -> QuicResult<()> {
        debug_assert!(self.queue.is_active(stream_id));

        let ev_tx = self.ev_tx.clone();
        let connector = Arc::clone(&self.connector);

        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return Ok(());
        };

        let dconn = match connector.get_downstream_connection(
            stream_id,
            &stream.request,
            ev_tx,
        ) {
            Ok(dconn) => dconn,
            Err(error) => {
                stream.dispatch = DispatchState::ConnectFail;
                return self.backend_failure_reply(
                    qconn, stream_id, error, false,
                );
            },
        };

        let stream = self.streams.get_mut(&stream_id).unwrap();
        stream.pending_cookie = dconn.affinity_cookie();
        stream.downstream = Some(dconn);
        stream.dispatch = DispatchState::Active;

        let dconn = stream.downstream.as_mut().unwrap();
        if let Err(e) = dconn.push_request_headers(&stream.request) {
            log::debug!(
                "failed to push request headers to backend";
                "stream_id" => stream_id,
                "error" => %e,
            );
            stream.dispatch = DispatchState::ConnectFail;
            stream.downstream.take().unwrap().release(false);
            return self.backend_failure_reply(
                qconn,
                stream_id,
                BackendError::Network,
                false,
            );
        }
        stream.request_submitted = true;

        self.push_upload_buffer(qconn, stream_id)
    }

    /// Drains the client-side upload buffer into the backend, finishing the
    /// upload when the client already sent its FIN.
    fn push_upload_buffer(
        &mut self, qconn: &mut quiche::Connection, stream_id: u64,
    ) -> QuicResult<()> {
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return Ok(());
        };

        let Some(dconn) = stream.downstream.as_mut() else {
            return Ok(());
        };

        while !stream.upload_buf.is_empty() {
            let (front, _) = stream.upload_buf.as_slices();
            match dconn.push_upload_data_chunk(front) {
                Ok(()) => {
                    let n = front.len();
                    stream.upload_buf.drain(..n);
                },
                Err(_) => {
                    // The backend rejected the chunk. The bytes were already
                    // consumed on the QUIC side, so only the stream is torn
                    // down.
                    self.finish_stream(
                        qconn,
                        stream_id,
                        Some(h3::WireErrorCode::InternalError as u64),
                        Some(h3::WireErrorCode::InternalError as u64),
                    );
                    return Ok(());
                },
            }
        }

        if stream.request_done && !stream.upload_finished {
            stream.upload_finished = true;
            if dconn.end_upload_data().is_err() {
                self.finish_stream(
                    qconn,
                    stream_id,
                    Some(h3::WireErrorCode::InternalError as u64),
                    Some(h3::WireErrorCode::InternalError as u64),
                );
            }
        }

        Ok(())
    }

    // Request ingestion.

    fn on_request_headers(
        &mut self, qconn: &mut quiche::Connection, stream_id: u64,
        list: Vec<h3::Header>, more_frames: bool,
    ) -> QuicResult<()> {
        self.max_stream_seen = self.max_stream_seen.max(stream_id);

        if self.streams.contains_key(&stream_id) {
            return self.on_request_trailers(stream_id, list);
        }

        // No new work once the final GOAWAY is out.
        if self.goaway_sent {
            let _ = qconn.stream_shutdown(
                stream_id,
                quiche::Shutdown::Read,
                h3::WireErrorCode::RequestRejected as u64,
            );
            let _ = qconn.stream_shutdown(
                stream_id,
                quiche::Shutdown::Write,
                h3::WireErrorCode::RequestRejected as u64,
            );
            return Ok(());
        }

        self.streams.insert(
            stream_id,
            RequestStream::new(self.http.max_downstream_retries),
        );
        self.arm_read_timer(stream_id);

        if header_section_too_large(&list, &self.http) {
            let stream = self.streams.get_mut(&stream_id).unwrap();
            stream.stop_reading = true;
            let _ = qconn.stream_shutdown(
                stream_id,
                quiche::Shutdown::Read,
                h3::WireErrorCode::NoError as u64,
            );
            return self.error_reply(qconn, stream_id, 431);
        }

        let request = match parse_request(&list, &self.http) {
            Ok(request) => request,
            Err(RequestParseError::UnknownMethod) =>
                return self.error_reply(qconn, stream_id, 501),
            Err(RequestParseError::BadProtocol) =>
                return self.error_reply(qconn, stream_id, 400),
            Err(RequestParseError::MissingAuthority) => {
                self.finish_stream(
                    qconn,
                    stream_id,
                    Some(h3::WireErrorCode::GeneralProtocolError as u64),
                    Some(h3::WireErrorCode::GeneralProtocolError as u64),
                );
                return Ok(());
            },
        };

        let stream = self.streams.get_mut(&stream_id).unwrap();
        stream.websocket_tunnel =
            request.protocol.as_deref() == Some("websocket");
        if !more_frames {
            stream.request_done = true;
        }
        stream.request = request;

        // A request without a body has a known length of zero.
        if stream.request_done && stream.request.content_length.is_none() {
            stream.request.content_length = Some(0);
        }

        if let Some(hook) = self.request_hook.clone() {
            let stream = self.streams.get_mut(&stream_id).unwrap();
            if let Err(e) = hook.on_request(&mut stream.request) {
                log::debug!(
                    "request hook failed";
                    "stream_id" => stream_id,
                    "error" => %e,
                );
                return self.error_reply(qconn, stream_id, 500);
            }
        }

        let stream = self.streams.get_mut(&stream_id).unwrap();
        let authority = stream.request.queue_authority().to_string();

        if self.queue.enqueue(stream_id, &authority) {
            self.attach_downstream(qconn, stream_id)
        } else {
            stream.dispatch = DispatchState::Blocked;
            Ok(())
        }
    }

    fn on_request_trailers(
        &mut self, stream_id: u64, list: Vec<h3::Header>,
    ) -> QuicResult<()> {
        // Trailer sections over the header caps are dropped silently.
        if header_section_too_large(&list, &self.http) {
            if let Some(stream) = self.streams.get_mut(&stream_id) {
                stream.stop_reading = true;
            }
            return Ok(());
        }

        if let Some(stream) = self.streams.get_mut(&stream_id) {
            for header in &list {
                stream.trailers.push((
                    header.name().to_vec(),
                    header.value().to_vec(),
                    false,
                ));
            }
        }

        Ok(())
    }

    fn on_request_body(
        &mut self, qconn: &mut quiche::Connection, stream_id: u64,
    ) -> QuicResult<()> {
        loop {
            let conn = self.conn.as_mut().unwrap();
            let n = match conn.recv_body(qconn, stream_id, &mut self.recv_buf)
            {
                Ok(n) => n,
                Err(h3::Error::Done) => break,
                Err(_) => {
                    self.finish_stream(qconn, stream_id, None, None);
                    break;
                },
            };

            let Some(stream) = self.streams.get_mut(&stream_id) else {
                continue; // consumed and discarded
            };

            if stream.stop_reading {
                continue;
            }

            self.arm_read_timer(stream_id);

            let stream = self.streams.get_mut(&stream_id).unwrap();
            stream
                .upload_buf
                .extend(self.recv_buf[..n].iter().copied());

            if stream.dispatch == DispatchState::Active {
                self.push_upload_buffer(qconn, stream_id)?;
            }
        }

        Ok(())
    }

    fn on_request_finished(
        &mut self, qconn: &mut quiche::Connection, stream_id: u64,
    ) -> QuicResult<()> {
        self.disarm_read_timer(stream_id);

        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return Ok(());
        };
        stream.request_done = true;

        if stream.dispatch == DispatchState::Active {
            self.push_upload_buffer(qconn, stream_id)?;
        }

        self.maybe_close_stream(qconn, stream_id);
        Ok(())
    }

    fn on_request_reset(
        &mut self, qconn: &mut quiche::Connection, stream_id: u64,
    ) -> QuicResult<()> {
        // Cancellation affects only this request; the backend is informed
        // via release and may return the connection to its pool.
        self.finish_stream(
            qconn,
            stream_id,
            None,
            Some(h3::WireErrorCode::RequestCancelled as u64),
        );
        Ok(())
    }

    // Response egress.

    fn on_downstream_event(
        &mut self, qconn: &mut quiche::Connection, event: DownstreamEvent,
    ) -> QuicResult<()> {
        let stream_id = event.stream_id();
        if !self.streams.contains_key(&stream_id) {
            return Ok(());
        }

        match event {
            DownstreamEvent::HeaderComplete {
                status,
                headers,
                content_length,
                ..
            } => self.on_downstream_header_complete(
                qconn,
                stream_id,
                status,
                headers,
                content_length,
            ),
            DownstreamEvent::Body { data, .. } =>
                self.on_downstream_body(qconn, stream_id, data),
            DownstreamEvent::BodyComplete { trailers, .. } =>
                self.on_downstream_body_complete(qconn, stream_id, trailers),
            DownstreamEvent::Eof { .. } =>
                self.on_downstream_eof(qconn, stream_id),
            DownstreamEvent::BadHeader { .. } => {
                if let Some(stream) = self.streams.get_mut(&stream_id) {
                    stream.response = ResponseState::MsgBadHeader;
                }
                self.error_reply(qconn, stream_id, 502)
            },
            DownstreamEvent::Reset { code, .. } =>
                self.on_downstream_stream_reset(qconn, stream_id, code),
            DownstreamEvent::ConnectionReset {
                no_retry, error, ..
            } => self.on_downstream_reset(qconn, stream_id, no_retry, error),
            DownstreamEvent::AbortRequest { status, .. } =>
                self.error_reply(qconn, stream_id, status),
            DownstreamEvent::WriteResumed { .. } =>
                self.push_upload_buffer(qconn, stream_id),
        }
    }

    fn on_downstream_header_complete(
        &mut self, qconn: &mut quiche::Connection, stream_id: u64,
        status: u16, backend_headers: Vec<(Vec<u8>, Vec<u8>)>,
        content_length: Option<u64>,
    ) -> QuicResult<()> {
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return Ok(());
        };

        let websocket = stream.websocket_tunnel;
        let tunnel = stream.request.is_connect();
        let non_final =
            status >= 100 && status < 200 && !(websocket && status == 101);

        let backend_authority = stream
            .downstream
            .as_ref()
            .and_then(|dconn| dconn.backend_authority());

        let resp_headers = headers::build_response_headers(
            status,
            &backend_headers,
            &self.http,
            websocket,
            tunnel,
            stream.pending_cookie.as_ref(),
            backend_authority.as_deref(),
            stream.request.authority.as_deref(),
        );

        let headers_already_sent = stream.response_headers_sent;
        let conn = self.conn.as_mut().unwrap();

        let res = if !headers_already_sent {
            conn.send_response(qconn, stream_id, &resp_headers, false)
        } else {
            conn.send_additional_headers(
                qconn,
                stream_id,
                &resp_headers,
                false,
                false,
            )
        };

        if let Err(e) = res {
            log::debug!(
                "failed to submit response headers";
                "stream_id" => stream_id,
                "error" => %e,
            );
            self.finish_stream(
                qconn,
                stream_id,
                Some(h3::WireErrorCode::InternalError as u64),
                Some(h3::WireErrorCode::InternalError as u64),
            );
            return Ok(());
        }

        let stream = self.streams.get_mut(&stream_id).unwrap();
        stream.response_headers_sent = true;

        if non_final {
            // Informational response delivered; the real header section is
            // still to come.
            return Ok(());
        }

        stream.response = ResponseState::HeaderComplete;
        stream.response_content_length = content_length;
        stream.pending_cookie = None;
        self.arm_write_timer(stream_id);

        Ok(())
    }

    fn on_downstream_body(
        &mut self, qconn: &mut quiche::Connection, stream_id: u64,
        data: Vec<u8>,
    ) -> QuicResult<()> {
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return Ok(());
        };

        stream.response_bytes_received += data.len() as u64;
        stream.response_buf.extend(data);

        self.arm_write_timer(stream_id);
        self.flush_response(qconn, stream_id)
    }

    fn on_downstream_body_complete(
        &mut self, qconn: &mut quiche::Connection, stream_id: u64,
        trailers: Vec<(Vec<u8>, Vec<u8>)>,
    ) -> QuicResult<()> {
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return Ok(());
        };

        // A backend that declared a length must deliver exactly that many
        // bytes; a mismatch poisons the whole connection.
        if let Some(declared) = stream.response_content_length {
            if declared != stream.response_bytes_received {
                log::debug!(
                    "backend content-length mismatch";
                    "stream_id" => stream_id,
                    "declared" => declared,
                    "received" => stream.response_bytes_received,
                );

                let code = h3::WireErrorCode::GeneralProtocolError as u64;
                self.finish_stream(qconn, stream_id, Some(code), Some(code));
                self.error_slot.record(ErrorKind::Application, code, false);
                let _ = qconn.close(true, code, &[]);
                return Ok(());
            }
        }

        stream.response = ResponseState::MsgComplete;
        stream.response_trailers = trailers;

        self.flush_response(qconn, stream_id)
    }

    fn on_downstream_eof(
        &mut self, qconn: &mut quiche::Connection, stream_id: u64,
    ) -> QuicResult<()> {
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return Ok(());
        };

        if stream.response_headers_sent {
            // EOF after headers counts as end of body.
            self.on_downstream_body_complete(qconn, stream_id, Vec::new())
        } else {
            self.error_reply(qconn, stream_id, 502)
        }
    }

    fn on_downstream_stream_reset(
        &mut self, qconn: &mut quiche::Connection, stream_id: u64,
        code: DownstreamResetCode,
    ) -> QuicResult<()> {
        if let Some(stream) = self.streams.get_mut(&stream_id) {
            stream.response = ResponseState::MsgReset;
        }

        let code = match code {
            DownstreamResetCode::NoError => h3::WireErrorCode::NoError,
            DownstreamResetCode::RefusedStream =>
                h3::WireErrorCode::RequestRejected,
            DownstreamResetCode::Other => h3::WireErrorCode::InternalError,
        } as u64;

        self.finish_stream(qconn, stream_id, Some(code), Some(code));
        Ok(())
    }

    fn on_downstream_reset(
        &mut self, qconn: &mut quiche::Connection, stream_id: u64,
        no_retry: bool, error: BackendError,
    ) -> QuicResult<()> {
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return Ok(());
        };

        if !no_retry && stream.can_retry() {
            stream.retries_left -= 1;
            if let Some(old) = stream.downstream.take() {
                old.release(false);
            }
            log::debug!(
                "re-attaching request to a fresh backend connection";
                "stream_id" => stream_id,
                "retries_left" => stream.retries_left,
            );
            return self.attach_downstream(qconn, stream_id);
        }

        let headers_sent = stream.response_headers_sent;
        self.backend_failure_reply(qconn, stream_id, error, headers_sent)
    }

    /// Converts a backend failure into the spec'd client-visible reply:
    /// a 308 redirect for TLS-required, 504/408 for timeouts around the
    /// submission boundary, and 502 otherwise.
    fn backend_failure_reply(
        &mut self, qconn: &mut quiche::Connection, stream_id: u64,
        error: BackendError, headers_sent: bool,
    ) -> QuicResult<()> {
        match error {
            BackendError::TlsRequired =>
                self.https_redirect_reply(qconn, stream_id),
            BackendError::Timeout if headers_sent =>
                self.error_reply(qconn, stream_id, 504),
            BackendError::Timeout => self.error_reply(qconn, stream_id, 408),
            BackendError::Network | BackendError::Refused =>
                self.error_reply(qconn, stream_id, 502),
        }
    }

    fn https_redirect_reply(
        &mut self, qconn: &mut quiche::Connection, stream_id: u64,
    ) -> QuicResult<()> {
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return Ok(());
        };

        // Only plain-http, non-tunnel requests can be redirected.
        let location = (!stream.request.is_connect())
            .then(|| {
                headers::https_redirect_location(
                    stream.request.scheme.as_deref(),
                    stream.request.authority.as_deref(),
                    stream.request.path.as_deref(),
                    self.http.redirect_https_port,
                )
            })
            .flatten();

        match location {
            Some(location) =>
                self.reply(qconn, stream_id, 308, Some(location), Vec::new()),
            None => self.error_reply(qconn, stream_id, 400),
        }
    }

    fn error_reply(
        &mut self, qconn: &mut quiche::Connection, stream_id: u64,
        status: u16,
    ) -> QuicResult<()> {
        let body =
            headers::error_reply_body(status, &self.http.server_name);
        self.reply(qconn, stream_id, status, None, body.into_bytes())
    }

    /// Sends a locally generated response and winds the stream down. The
    /// body is routed through the stream's response buffer so a blocked
    /// stream drains through the regular flush path.
    fn reply(
        &mut self, qconn: &mut quiche::Connection, stream_id: u64,
        status: u16, location: Option<String>, body: Vec<u8>,
    ) -> QuicResult<()> {
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return Ok(());
        };

        if stream.response_headers_sent {
            // Too late for a reply of our own; cut the stream instead.
            self.finish_stream(
                qconn,
                stream_id,
                Some(h3::WireErrorCode::InternalError as u64),
                Some(h3::WireErrorCode::InternalError as u64),
            );
            return Ok(());
        }

        let mut resp_headers = vec![
            h3::Header::new(b":status", status.to_string().as_bytes()),
            h3::Header::new(b"server", self.http.server_name.as_bytes()),
        ];

        if let Some(location) = &location {
            resp_headers
                .push(h3::Header::new(b"location", location.as_bytes()));
        }

        if !body.is_empty() {
            resp_headers.push(h3::Header::new(
                b"content-type",
                b"text/html; charset=UTF-8",
            ));
            resp_headers.push(h3::Header::new(
                b"content-length",
                body.len().to_string().as_bytes(),
            ));
        }

        let conn = self.conn.as_mut().unwrap();
        if let Err(e) =
            conn.send_response(qconn, stream_id, &resp_headers, body.is_empty())
        {
            log::debug!(
                "failed to send local reply";
                "stream_id" => stream_id,
                "status" => status,
                "error" => %e,
            );
            self.finish_stream(qconn, stream_id, None, None);
            return Ok(());
        }

        upstream_metrics::local_error_replies(status).inc();

        let stream = self.streams.get_mut(&stream_id).unwrap();
        stream.dispatch = DispatchState::ConnectFail;
        stream.response = ResponseState::MsgComplete;
        stream.response_headers_sent = true;
        stream.response_fin_sent = body.is_empty();
        stream.response_buf.extend(body);
        stream.stop_reading = true;

        if let Some(downstream) = stream.downstream.take() {
            downstream.release(false);
        }

        // The client may keep sending request data; discard it cleanly.
        let _ = qconn.stream_shutdown(
            stream_id,
            quiche::Shutdown::Read,
            h3::WireErrorCode::NoError as u64,
        );

        self.flush_response(qconn, stream_id)
    }

    /// Drains a stream's buffered response into the codec: body bytes, the
    /// FIN, and trailers once the body is out. Every byte accepted by the
    /// codec is drained from the buffer, keeping delivery, drain, and
    /// acknowledgment counts equal.
    fn flush_response(
        &mut self, qconn: &mut quiche::Connection, stream_id: u64,
    ) -> QuicResult<()> {
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return Ok(());
        };

        if !stream.response_headers_sent || stream.response_fin_sent {
            return Ok(());
        }

        let conn = self.conn.as_mut().unwrap();
        let mut blocked = false;
        let mut failed = false;
        let mut drained = 0usize;

        while !stream.response_buf.is_empty() {
            let (front, _) = stream.response_buf.as_slices();

            let last_data = front.len() == stream.response_buf.len();
            let fin = last_data &&
                stream.response == ResponseState::MsgComplete &&
                stream.response_trailers.is_empty();

            match conn.send_body(qconn, stream_id, front, fin) {
                Ok(n) => {
                    stream.response_buf.drain(..n);
                    drained += n;
                    stream.response_body_started = true;

                    if n == front.len() && fin {
                        stream.response_fin_sent = true;
                        break;
                    }

                    if n < front.len() {
                        blocked = true;
                        break;
                    }
                },
                Err(h3::Error::Done) | Err(h3::Error::StreamBlocked) => {
                    blocked = true;
                    break;
                },
                Err(_) => {
                    failed = true;
                    break;
                },
            }
        }

        if failed {
            self.finish_stream(qconn, stream_id, None, None);
            return Ok(());
        }

        let stream = self.streams.get_mut(&stream_id).unwrap();

        // Zero-length response body: nothing buffered, but the FIN (or the
        // trailer section) still has to go out.
        if stream.response == ResponseState::MsgComplete &&
            stream.response_buf.is_empty() &&
            !stream.response_fin_sent
        {
            let conn = self.conn.as_mut().unwrap();
            let res = if stream.response_trailers.is_empty() {
                conn.send_body(qconn, stream_id, &[], true).map(|_| ())
            } else {
                let trailers: Vec<h3::Header> = stream
                    .response_trailers
                    .iter()
                    .map(|(n, v)| h3::Header::new(n, v))
                    .collect();
                conn.send_additional_headers(
                    qconn, stream_id, &trailers, true, true,
                )
            };

            match res {
                Ok(()) => stream.response_fin_sent = true,
                Err(h3::Error::Done) | Err(h3::Error::StreamBlocked) =>
                    blocked = true,
                Err(_) => {
                    self.finish_stream(qconn, stream_id, None, None);
                    return Ok(());
                },
            }
        }

        let stream = self.streams.get_mut(&stream_id).unwrap();

        if stream.response_buf.is_empty() && !blocked {
            // Nothing left to write: the buffer is the pull source, and an
            // empty one must not keep a write deadline running.
            self.disarm_write_timer(stream_id);
        } else if blocked {
            self.arm_write_timer(stream_id);
        }

        // Backpressure: let the backend produce more once the client has
        // acknowledged enough of what we buffered.
        if drained > 0 {
            if let Some(stream) = self.streams.get_mut(&stream_id) {
                if stream.response_buf.len() < RESPONSE_RESUME_WATERMARK {
                    if let Some(dconn) = stream.downstream.as_mut() {
                        dconn.resume_read();
                    }
                }
            }
        }

        self.maybe_close_stream(qconn, stream_id);
        Ok(())
    }

    /// Completes a stream once both directions are done: the request was
    /// fully read (or cut off) and the response, including its FIN, was
    /// handed to the codec.
    fn maybe_close_stream(
        &mut self, qconn: &mut quiche::Connection, stream_id: u64,
    ) {
        let Some(stream) = self.streams.get(&stream_id) else {
            return;
        };

        let request_side_done = stream.request_done || stream.stop_reading;

        if request_side_done &&
            stream.response_fin_sent &&
            stream.response_drained()
        {
            self.finish_stream(qconn, stream_id, None, None);
        }
    }

    fn on_stream_timer(
        &mut self, qconn: &mut quiche::Connection, stream_id: u64,
        timer: StreamTimer,
    ) -> QuicResult<()> {
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return Ok(());
        };

        match timer {
            StreamTimer::Read => {
                stream.read_timer = None;
                if stream.response_headers_sent {
                    self.finish_stream(
                        qconn,
                        stream_id,
                        Some(h3::WireErrorCode::InternalError as u64),
                        Some(h3::WireErrorCode::InternalError as u64),
                    );
                    Ok(())
                } else {
                    // The client went quiet before the request could be
                    // dispatched.
                    self.error_reply(qconn, stream_id, 408)
                }
            },
            StreamTimer::Write => {
                stream.write_timer = None;
                self.finish_stream(
                    qconn,
                    stream_id,
                    None,
                    Some(h3::WireErrorCode::InternalError as u64),
                );
                Ok(())
            },
        }
    }

    fn process_read_event(
        &mut self, qconn: &mut quiche::Connection, stream_id: u64,
        event: h3::Event,
    ) -> QuicResult<()> {
        match event {
            h3::Event::Headers { list, more_frames } =>
                self.on_request_headers(qconn, stream_id, list, more_frames),
            h3::Event::Data => self.on_request_body(qconn, stream_id),
            h3::Event::Finished => self.on_request_finished(qconn, stream_id),
            h3::Event::Reset(code) => {
                log::debug!(
                    "request stream reset by client";
                    "stream_id" => stream_id,
                    "code" => code,
                );
                self.on_request_reset(qconn, stream_id)
            },
            h3::Event::PriorityUpdate => Ok(()),
            h3::Event::GoAway => {
                // A client GOAWAY only concerns server-initiated streams,
                // of which there are none beyond the control plane.
                Ok(())
            },
        }
    }
}

impl<C: DownstreamConnector> ApplicationOverQuic for ProxyH3Driver<C> {
    fn on_conn_established(
        &mut self, qconn: &mut quiche::Connection,
        _handshake_info: &HandshakeInfo,
    ) -> QuicResult<()> {
        // The session needs its control stream plus the QPACK encoder and
        // decoder streams.
        if qconn.peer_streams_left_uni() < QuicSettings::REQUIRED_UNI_STREAMS {
            return Err("peer allows too few unidirectional streams".into());
        }

        let conn = h3::Connection::with_transport(qconn, &self.h3_config)?;
        self.conn = Some(conn);

        log::debug!(
            "HTTP/3 session established";
            "peer" => ?qconn.trace_id(),
        );

        Ok(())
    }

    #[inline]
    fn should_act(&self) -> bool {
        self.conn.is_some()
    }

    fn before_io(
        &mut self, qconn: &mut quiche::Connection,
    ) -> QuicResult<PreIo> {
        if !self.shutdown.is_triggered() || self.shutdown_notice_sent {
            return Ok(PreIo::Continue);
        }

        // First observation of the worker's shutdown flag: advise the
        // client that shutdown is coming, then let the caller arm the
        // graceful timer.
        let conn = self.conn_mut()?;
        match conn.send_goaway(qconn, SHUTDOWN_NOTICE_ID) {
            Ok(()) => {
                self.shutdown_notice_sent = true;
                Ok(PreIo::ShutdownStarted)
            },
            Err(e) => {
                log::debug!("failed to send shutdown notice"; "error" => %e);
                Ok(PreIo::Continue)
            },
        }
    }

    fn on_timer(
        &mut self, qconn: &mut quiche::Connection, timer: TimerEvent,
    ) -> QuicResult<()> {
        match timer {
            TimerEvent::GracefulExpired => {
                // The grace period is over: commit to a cutoff. In-flight
                // requests still complete; anything newer is rejected.
                let max_stream_seen = self.max_stream_seen;
                let conn = self.conn_mut()?;
                conn.send_goaway(qconn, max_stream_seen)
                    .map_err(|e| -> crate::BoxError {
                        format!("failed to send GOAWAY: {e}").into()
                    })?;
                self.goaway_sent = true;
                Ok(())
            },
        }
    }

    async fn wait_for_data(
        &mut self, qconn: &mut quiche::Connection,
    ) -> QuicResult<()> {
        let has_timers = !self.stream_timers.is_empty();
        let timers = &mut self.stream_timers;
        let ev_rx = &mut self.ev_rx;

        enum Wakeup {
            Downstream(DownstreamEvent),
            StreamTimer(u64, StreamTimer),
        }

        let wakeup = select! {
            biased;
            Some(expired) = std::future::poll_fn(|cx| timers.poll_expired(cx)),
                if has_timers =>
            {
                let (stream_id, timer) = expired.into_inner();
                Wakeup::StreamTimer(stream_id, timer)
            }
            Some(event) = ev_rx.recv() => Wakeup::Downstream(event),
        };

        match wakeup {
            Wakeup::Downstream(event) => self.on_downstream_event(qconn, event),
            Wakeup::StreamTimer(stream_id, timer) =>
                self.on_stream_timer(qconn, stream_id, timer),
        }
    }

    fn process_reads(&mut self, qconn: &mut quiche::Connection) -> QuicResult<()> {
        loop {
            match self.conn_mut()?.poll(qconn) {
                Ok((stream_id, event)) =>
                    self.process_read_event(qconn, stream_id, event)?,
                Err(h3::Error::Done) => break,
                Err(err) => {
                    // Fatal codec errors close the connection with an
                    // application error; the worker keeps looping until the
                    // codec reports closed.
                    log::debug!(
                        "connection closed due to h3 protocol error";
                        "error" => ?err,
                    );
                    self.error_slot.record(
                        ErrorKind::Application,
                        h3::WireErrorCode::InternalError as u64,
                        false,
                    );
                    return Ok(());
                },
            }
        }

        Ok(())
    }

    fn process_writes(
        &mut self, qconn: &mut quiche::Connection,
    ) -> QuicResult<()> {
        while let Some(stream_id) = qconn.stream_writable_next() {
            if self.streams.contains_key(&stream_id) {
                self.flush_response(qconn, stream_id)?;
            }
        }

        // Also drain backend events that arrived while the worker was busy
        // writing, so response data never waits a full loop turn.
        while let Ok(event) = self.ev_rx.try_recv() {
            self.on_downstream_event(qconn, event)?;
        }

        Ok(())
    }

    fn on_conn_close(
        &mut self, _qconn: &mut quiche::Connection,
        connection_result: &QuicResult<()>,
    ) {
        if let Err(e) = connection_result {
            log::debug!("connection closed with error"; "error" => %e);
        }

        // After handle_error no frames are written on any stream; detach
        // the backends so the pool learns right away.
        for (_, mut stream) in std::mem::take(&mut self.streams) {
            if let Some(downstream) = stream.downstream.take() {
                downstream.release(false);
            }
        }
    }

    fn error_slot(&self) -> ErrorSlot {
        self.error_slot
    }
}

fn make_h3_config(http: &HttpSettings) -> h3::Config {
    let mut config = h3::Config::new().unwrap();

    config.set_qpack_max_table_capacity(
        Http3Settings::QPACK_MAX_DTABLE_CAPACITY,
    );

    // Extended CONNECT carries WebSocket over HTTP/3; it stays off when
    // operating as a forward proxy.
    config.enable_extended_connect(!http.http2_proxy);

    config
}

fn header_section_too_large(
    list: &[h3::Header], http: &HttpSettings,
) -> bool {
    let mut total = 0usize;

    if list.len() > http.max_request_header_fields {
        return true;
    }

    for header in list {
        total += header.name().len() + header.value().len();
        if total > http.request_header_field_buffer {
            return true;
        }
    }

    false
}

enum RequestParseError {
    UnknownMethod,
    BadProtocol,
    MissingAuthority,
}

fn parse_request(
    list: &[h3::Header], http: &HttpSettings,
) -> Result<RequestHeaders, RequestParseError> {
    let mut request = RequestHeaders::default();
    let mut host: Option<String> = None;

    for header in list {
        let name = header.name();
        let value = header.value();

        match name {
            b":method" =>
                request.method = String::from_utf8_lossy(value).into_owned(),
            b":scheme" =>
                request.scheme =
                    Some(String::from_utf8_lossy(value).into_owned()),
            b":authority" =>
                request.authority =
                    Some(String::from_utf8_lossy(value).into_owned()),
            b":path" =>
                request.path =
                    Some(String::from_utf8_lossy(value).into_owned()),
            b":protocol" =>
                request.protocol =
                    Some(String::from_utf8_lossy(value).into_owned()),
            _ if name.starts_with(b":") => {},
            b"host" =>
                host = Some(String::from_utf8_lossy(value).into_owned()),
            b"content-length" => {
                request.content_length = std::str::from_utf8(value)
                    .ok()
                    .and_then(|v| v.parse().ok());
                request.fields.push((
                    name.to_vec(),
                    value.to_vec(),
                    false,
                ));
            },
            _ => request.fields.push((name.to_vec(), value.to_vec(), false)),
        }
    }

    if !headers::is_known_method(&request.method) {
        return Err(RequestParseError::UnknownMethod);
    }

    if let Some(protocol) = &request.protocol {
        if protocol != "websocket" {
            return Err(RequestParseError::BadProtocol);
        }
    }

    if request.authority.is_none() {
        request.authority = host;
    }

    if http.http2_proxy &&
        request.method != "CONNECT" &&
        request.authority.is_none()
    {
        return Err(RequestParseError::MissingAuthority);
    }

    // `OPTIONS *` and forward-proxy requests keep their target verbatim;
    // everything else gets the canonical form.
    let verbatim_path = http.http2_proxy ||
        (request.method == "OPTIONS" &&
            request.path.as_deref() == Some("*"));

    if !verbatim_path {
        if let Some(path) = &request.path {
            request.path = Some(headers::clean_path(path));
        }
    }

    Ok(request)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn http_settings() -> HttpSettings {
        serde_json::from_str("{}").unwrap()
    }

    fn req(pseudo: &[(&str, &str)]) -> Vec<h3::Header> {
        pseudo
            .iter()
            .map(|(n, v)| h3::Header::new(n.as_bytes(), v.as_bytes()))
            .collect()
    }

    #[test]
    fn parse_request_extracts_pseudo_headers() {
        let http = http_settings();
        let list = req(&[
            (":method", "GET"),
            (":scheme", "https"),
            (":authority", "a.example"),
            (":path", "/x/../y"),
            ("x-custom", "1"),
        ]);

        let request = parse_request(&list, &http).ok().unwrap();
        assert_eq!(request.method, "GET");
        assert_eq!(request.authority.as_deref(), Some("a.example"));
        // Paths are canonicalized on the way in.
        assert_eq!(request.path.as_deref(), Some("/y"));
        assert_eq!(request.fields.len(), 1);
    }

    #[test]
    fn parse_request_rejects_unknown_method() {
        let http = http_settings();
        let list = req(&[(":method", "BREW"), (":path", "/")]);

        assert!(matches!(
            parse_request(&list, &http),
            Err(RequestParseError::UnknownMethod)
        ));
    }

    #[test]
    fn parse_request_rejects_non_websocket_protocol() {
        let http = http_settings();
        let list = req(&[
            (":method", "CONNECT"),
            (":protocol", "webtransport"),
            (":authority", "a.example"),
        ]);

        assert!(matches!(
            parse_request(&list, &http),
            Err(RequestParseError::BadProtocol)
        ));
    }

    #[test]
    fn parse_request_authority_falls_back_to_host() {
        let http = http_settings();
        let list = req(&[
            (":method", "GET"),
            (":scheme", "https"),
            (":path", "/"),
            ("host", "fallback.example"),
        ]);

        let request = parse_request(&list, &http).ok().unwrap();
        assert_eq!(request.authority.as_deref(), Some("fallback.example"));
        // The host field itself is not forwarded.
        assert!(request.fields.is_empty());
    }

    #[test]
    fn parse_request_keeps_asterisk_and_proxy_paths() {
        let http = http_settings();
        let list = req(&[(":method", "OPTIONS"), (":path", "*")]);
        let request = parse_request(&list, &http).ok().unwrap();
        assert_eq!(request.path.as_deref(), Some("*"));

        let mut proxy: HttpSettings = serde_json::from_str("{}").unwrap();
        proxy.http2_proxy = true;
        let list = req(&[
            (":method", "GET"),
            (":authority", "a.example"),
            (":path", "/kept/../verbatim"),
        ]);
        let request = parse_request(&list, &proxy).ok().unwrap();
        assert_eq!(request.path.as_deref(), Some("/kept/../verbatim"));
    }

    #[test]
    fn proxy_mode_requires_authority() {
        let mut proxy: HttpSettings = serde_json::from_str("{}").unwrap();
        proxy.http2_proxy = true;

        let list = req(&[(":method", "GET"), (":path", "/")]);
        assert!(matches!(
            parse_request(&list, &proxy),
            Err(RequestParseError::MissingAuthority)
        ));
    }

    #[test]
    fn header_caps_by_count_and_bytes() {
        let mut http = http_settings();
        http.max_request_header_fields = 2;

        let list = req(&[(":method", "GET"), (":path", "/"), ("a", "b")]);
        assert!(header_section_too_large(&list, &http));

        let mut http = http_settings();
        http.request_header_field_buffer = 10;
        let list = req(&[(":method", "GET"), ("x", "very-long-value")]);
        assert!(header_section_too_large(&list, &http));

        let http = http_settings();
        let list = req(&[(":method", "GET"), (":path", "/")]);
        assert!(!header_section_too_large(&list, &http));
    }
}
