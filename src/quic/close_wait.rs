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

//! Close-wait retention of CONNECTION_CLOSE packets.
//!
//! After a connection is torn down, a client that lost the final packet will
//! keep retransmitting on the old CIDs. The registry retains the sentinel
//! CONNECTION_CLOSE for 3×PTO per former CID and replays it for any datagram
//! that still routes there, then forgets the CIDs.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::task::Context;
use std::task::Poll;
use std::time::Duration;

use quiche::ConnectionId;
use tokio_util::time::delay_queue::DelayQueue;

use crate::metrics::Metrics;

/// The sentinel packet replayed for a torn-down connection.
pub(crate) struct CloseWaitEntry {
    pkt: Vec<u8>,
}

/// Registry of recently torn-down connections, owned by the packet router.
pub(crate) struct CloseWaitRegistry<M> {
    entries: BTreeMap<Vec<u8>, Arc<CloseWaitEntry>>,
    expiry: DelayQueue<Vec<ConnectionId<'static>>>,
    metrics: M,
}

impl<M: Metrics> CloseWaitRegistry<M> {
    pub(crate) fn new(metrics: M) -> Self {
        CloseWaitRegistry {
            entries: BTreeMap::new(),
            expiry: DelayQueue::new(),
            metrics,
        }
    }

    /// Parks `pkt` for all of a connection's former `cids` for `period`
    /// (3×PTO at the call site).
    pub(crate) fn install(
        &mut self, cids: Vec<ConnectionId<'static>>, pkt: Vec<u8>,
        period: Duration,
    ) {
        let entry = Arc::new(CloseWaitEntry { pkt });

        for cid in &cids {
            self.entries.insert(cid.as_ref().to_vec(), Arc::clone(&entry));
        }

        self.expiry.insert(cids, period);
        self.metrics.close_wait_entries().inc();
    }

    /// The sentinel packet for `dcid`, if the CID is parked here.
    pub(crate) fn lookup(&self, dcid: &ConnectionId) -> Option<&[u8]> {
        self.entries
            .get(dcid.as_ref())
            .map(|entry| entry.pkt.as_slice())
    }

    /// Drops the CIDs of entries whose retention period has passed. Must be
    /// polled by the router's event loop.
    pub(crate) fn poll_expired(&mut self, cx: &mut Context<'_>) {
        while let Poll::Ready(Some(expired)) = self.expiry.poll_expired(cx) {
            for cid in expired.into_inner() {
                self.entries.remove(cid.as_ref());
            }
            self.metrics.close_wait_entries().dec();
        }
    }

    /// Whether the registry holds any live entries.
    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::metrics::DefaultMetrics;

    fn cid(b: &[u8]) -> ConnectionId<'static> {
        ConnectionId::from_vec(b.to_vec())
    }

    #[tokio::test]
    async fn sentinel_is_replayed_per_cid() {
        let mut registry = CloseWaitRegistry::new(DefaultMetrics);

        registry.install(
            vec![cid(b"cid-one"), cid(b"cid-two")],
            b"close-pkt".to_vec(),
            Duration::from_secs(1),
        );

        assert_eq!(registry.lookup(&cid(b"cid-one")), Some(&b"close-pkt"[..]));
        assert_eq!(registry.lookup(&cid(b"cid-two")), Some(&b"close-pkt"[..]));
        assert_eq!(registry.lookup(&cid(b"unknown")), None);
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_period() {
        let mut registry = CloseWaitRegistry::new(DefaultMetrics);

        registry.install(
            vec![cid(b"cid-one")],
            b"close-pkt".to_vec(),
            Duration::from_millis(100),
        );

        tokio::time::advance(Duration::from_millis(150)).await;

        std::future::poll_fn(|cx| {
            registry.poll_expired(cx);
            Poll::Ready(())
        })
        .await;

        assert_eq!(registry.lookup(&cid(b"cid-one")), None);
        assert!(registry.is_empty());
    }
}
