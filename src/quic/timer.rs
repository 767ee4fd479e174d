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
use std::time::Instant;

/// Which per-connection timer fired.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum TimerKind {
    /// No packet exchanged for the negotiated idle period; the connection is
    /// deleted without sending anything.
    Idle,
    /// The codec's combined loss/ACK/path timer; firing runs the codec's
    /// expiry handler and then a write pass.
    Expiry,
    /// 3×PTO after the shutdown notice; firing submits the final GOAWAY.
    Graceful,
}

/// The three timers of one upstream connection, folded into a single wakeup
/// deadline for the worker's sleep.
#[derive(Debug, Default)]
pub(crate) struct TimerSet {
    idle: Option<Instant>,
    expiry: Option<Instant>,
    graceful: Option<Instant>,
}

impl TimerSet {
    /// Floor for any deadline so a timer already in the past still yields a
    /// strictly positive sleep and the loop makes forward progress.
    const MIN_DELAY: Duration = Duration::from_nanos(1);

    /// Rearms the idle timer; called after every successful packet send or
    /// receive.
    pub(crate) fn reset_idle(&mut self, now: Instant, idle_timeout: Duration) {
        self.idle = Some(now + idle_timeout);
    }

    /// Rearms the expiry timer from the codec's next timeout, or disarms it.
    pub(crate) fn set_expiry(&mut self, deadline: Option<Instant>) {
        self.expiry = deadline;
    }

    /// Arms the graceful-shutdown timer once; later calls keep the earlier
    /// deadline.
    pub(crate) fn arm_graceful(&mut self, deadline: Instant) {
        self.graceful.get_or_insert(deadline);
    }

    pub(crate) fn graceful_armed(&self) -> bool {
        self.graceful.is_some()
    }

    /// The next wakeup instant, never earlier than `now + 1ns`.
    pub(crate) fn next_deadline(&self, now: Instant) -> Option<Instant> {
        [self.idle, self.expiry, self.graceful]
            .into_iter()
            .flatten()
            .min()
            .map(|deadline| deadline.max(now + Self::MIN_DELAY))
    }

    /// Pops the timer that is due at `now`, earliest first. Idle wins ties:
    /// once the peer has been silent for the whole idle period there is
    /// nothing left worth retransmitting.
    pub(crate) fn fired(&mut self, now: Instant) -> Option<TimerKind> {
        if self.idle.is_some_and(|at| at <= now) {
            self.idle = None;
            return Some(TimerKind::Idle);
        }

        if self.expiry.is_some_and(|at| at <= now) {
            self.expiry = None;
            return Some(TimerKind::Expiry);
        }

        if self.graceful.is_some_and(|at| at <= now) {
            self.graceful = None;
            return Some(TimerKind::Graceful);
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadline_has_a_floor() {
        let now = Instant::now();
        let mut timers = TimerSet::default();

        assert_eq!(timers.next_deadline(now), None);

        // A deadline in the past is clamped to a strictly positive delay.
        timers.set_expiry(Some(now - Duration::from_secs(1)));
        assert_eq!(timers.next_deadline(now), Some(now + TimerSet::MIN_DELAY));
    }

    #[test]
    fn earliest_timer_fires_first() {
        let now = Instant::now();
        let mut timers = TimerSet::default();

        timers.reset_idle(now, Duration::from_secs(30));
        timers.set_expiry(Some(now + Duration::from_millis(25)));
        timers.arm_graceful(now + Duration::from_secs(1));

        let wake = timers.next_deadline(now).unwrap();
        assert_eq!(wake, now + Duration::from_millis(25));

        assert_eq!(timers.fired(wake), Some(TimerKind::Expiry));
        assert_eq!(timers.fired(wake), None);

        let wake = now + Duration::from_secs(2);
        assert_eq!(timers.fired(wake), Some(TimerKind::Graceful));
    }

    #[test]
    fn graceful_keeps_first_deadline() {
        let now = Instant::now();
        let mut timers = TimerSet::default();

        timers.arm_graceful(now + Duration::from_secs(1));
        timers.arm_graceful(now + Duration::from_secs(9));

        assert_eq!(timers.next_deadline(now), Some(now + Duration::from_secs(1)));
    }

    #[test]
    fn idle_takes_precedence() {
        let now = Instant::now();
        let mut timers = TimerSet::default();

        timers.reset_idle(now, Duration::from_millis(10));
        timers.set_expiry(Some(now + Duration::from_millis(10)));

        let wake = now + Duration::from_millis(10);
        assert_eq!(timers.fired(wake), Some(TimerKind::Idle));
    }
}
