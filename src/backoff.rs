use std::cmp::min;
use crate::ids::Epoch;

/// Retransmission schedule for a single outstanding message: it is resent once more than
///  `backoff` epochs have passed since it was last sent. The backoff starts at 0 (resend in
///  every epoch), becomes 1 after the first resend and doubles after every further resend, up
///  to a configured maximum.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RetransmitBackoff {
    last_sent: Epoch,
    backoff: u32,
    max_backoff: u32,
}

impl RetransmitBackoff {
    pub fn new(sent_at: Epoch, max_backoff: u32) -> Self {
        RetransmitBackoff {
            last_sent: sent_at,
            backoff: 0,
            max_backoff,
        }
    }

    pub fn last_sent(&self) -> Epoch {
        self.last_sent
    }

    pub fn is_due(&self, now: Epoch) -> bool {
        now.since(self.last_sent) > self.backoff as u64
    }

    /// registers a resend at `now`, growing the interval until the next one
    pub fn on_resend(&mut self, now: Epoch) {
        self.last_sent = now;
        self.backoff = if self.backoff == 0 {
            1
        }
        else {
            self.backoff.saturating_mul(2)
        };
        self.backoff = min(self.backoff, self.max_backoff);
    }
}
