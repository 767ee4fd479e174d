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

//! Admission control for requests headed to backends.
//!
//! A bounded number of requests may be active (dispatched to a backend) at
//! once. In HTTP/2-proxy mode the bound applies per authority; otherwise it
//! applies to the whole frontend connection. Requests over the bound queue
//! up in per-authority FIFOs and activate as active ones finish, oldest
//! first.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::VecDeque;

/// Admission queue for one frontend connection.
pub(crate) struct DownstreamQueue {
    capacity: usize,
    per_authority: bool,
    active: BTreeSet<u64>,
    active_by_authority: BTreeMap<String, usize>,
    blocked: BTreeMap<String, VecDeque<u64>>,
    authority_of: BTreeMap<u64, String>,
}

impl DownstreamQueue {
    /// `per_authority` selects HTTP/2-proxy mode accounting, where
    /// `capacity` bounds each authority separately.
    pub(crate) fn new(capacity: usize, per_authority: bool) -> Self {
        DownstreamQueue {
            capacity: capacity.max(1),
            per_authority,
            active: BTreeSet::new(),
            active_by_authority: BTreeMap::new(),
            blocked: BTreeMap::new(),
            authority_of: BTreeMap::new(),
        }
    }

    /// Whether a new request for `authority` may activate right away.
    pub(crate) fn can_activate(&self, authority: &str) -> bool {
        let used = if self.per_authority {
            self.active_by_authority
                .get(authority)
                .copied()
                .unwrap_or(0)
        } else {
            self.active.len()
        };

        used < self.capacity
    }

    /// Admits `stream_id`: either marks it active (true) or parks it in the
    /// authority's FIFO (false).
    pub(crate) fn enqueue(&mut self, stream_id: u64, authority: &str) -> bool {
        self.authority_of.insert(stream_id, authority.to_string());

        if self.can_activate(authority) {
            self.mark_active(stream_id, authority);
            true
        } else {
            self.blocked
                .entry(authority.to_string())
                .or_default()
                .push_back(stream_id);
            false
        }
    }

    fn mark_active(&mut self, stream_id: u64, authority: &str) {
        self.active.insert(stream_id);
        *self
            .active_by_authority
            .entry(authority.to_string())
            .or_default() += 1;
    }

    /// Removes a stream in any state. If it was active, the oldest blocked
    /// stream for the same authority (or, outside per-authority mode, the
    /// oldest blocked stream overall) is activated and returned.
    pub(crate) fn remove(&mut self, stream_id: u64) -> Option<u64> {
        let authority = self.authority_of.remove(&stream_id)?;

        if !self.active.remove(&stream_id) {
            // It was still blocked; just unlink it from the FIFO.
            if let Entry::Occupied(mut fifo) =
                self.blocked.entry(authority.clone())
            {
                fifo.get_mut().retain(|id| *id != stream_id);
                if fifo.get().is_empty() {
                    fifo.remove();
                }
            }
            return None;
        }

        if let Some(count) = self.active_by_authority.get_mut(&authority) {
            *count -= 1;
            if *count == 0 {
                self.active_by_authority.remove(&authority);
            }
        }

        // A blocked request for the same authority goes first; with a
        // connection-wide bound any other authority's FIFO may fill the
        // freed slot.
        let next_authority = if self.blocked.contains_key(&authority) {
            Some(authority)
        } else if self.per_authority {
            None
        } else {
            self.blocked.keys().next().cloned()
        }?;

        let next = {
            let fifo = self.blocked.get_mut(&next_authority)?;
            let next = fifo.pop_front()?;
            if fifo.is_empty() {
                self.blocked.remove(&next_authority);
            }
            next
        };

        self.mark_active(next, &next_authority);
        Some(next)
    }

    pub(crate) fn is_active(&self, stream_id: u64) -> bool {
        self.active.contains(&stream_id)
    }

    pub(crate) fn active_len(&self) -> usize {
        self.active.len()
    }

    pub(crate) fn blocked_len(&self) -> usize {
        self.blocked.values().map(VecDeque::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_is_never_exceeded() {
        let mut queue = DownstreamQueue::new(2, false);

        assert!(queue.enqueue(0, "a.example"));
        assert!(queue.enqueue(4, "a.example"));
        assert!(!queue.enqueue(8, "b.example"));
        assert!(!queue.enqueue(12, "a.example"));

        assert_eq!(queue.active_len(), 2);
        assert_eq!(queue.blocked_len(), 2);
    }

    #[test]
    fn removal_activates_oldest_blocked() {
        let mut queue = DownstreamQueue::new(1, false);

        assert!(queue.enqueue(0, "a.example"));
        assert!(!queue.enqueue(4, "b.example"));
        assert!(!queue.enqueue(8, "b.example"));

        // Oldest blocked request goes first, regardless of authority.
        assert_eq!(queue.remove(0), Some(4));
        assert!(queue.is_active(4));
        assert_eq!(queue.remove(4), Some(8));
        assert_eq!(queue.remove(8), None);

        assert_eq!(queue.active_len(), 0);
        assert_eq!(queue.blocked_len(), 0);
    }

    #[test]
    fn per_authority_mode_bounds_each_authority() {
        let mut queue = DownstreamQueue::new(1, true);

        assert!(queue.enqueue(0, "a.example"));
        // A different authority has its own budget.
        assert!(queue.enqueue(4, "b.example"));
        assert!(!queue.enqueue(8, "a.example"));

        // Finishing b.example's request unblocks nothing of a.example's.
        assert_eq!(queue.remove(4), None);
        assert_eq!(queue.remove(0), Some(8));
    }

    #[test]
    fn blocked_stream_can_be_cancelled() {
        let mut queue = DownstreamQueue::new(1, false);

        assert!(queue.enqueue(0, "a.example"));
        assert!(!queue.enqueue(4, "a.example"));

        // Client reset the blocked stream before it ever activated.
        assert_eq!(queue.remove(4), None);
        assert_eq!(queue.remove(0), None);
        assert_eq!(queue.active_len(), 0);
    }
}
