use std::time::Duration;
use anyhow::bail;

/// Protocol parameters. Client and server of a connection are expected to agree on them, though
///  the protocol stays correct if they don't.
///
/// All timing is expressed in epochs: the epoch timer ticks every `epoch_millis`, and every
///  timeout is "N epochs without some event".
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct LspParams {
    /// Number of epochs without any received message after which a connection is considered
    ///  lost. This is also the number of unanswered `Connect` epochs after which `connect`
    ///  gives up, and the maximum number of epochs a closing connection waits for pending
    ///  acknowledgements.
    pub epoch_limit: u32,

    /// Length of an epoch in milliseconds
    pub epoch_millis: u64,

    /// A data message with sequence number `s` is sent only if `s` is less than the oldest
    ///  unacknowledged sequence number plus `window_size`
    pub window_size: usize,

    /// Upper bound for the number of epochs between two retransmissions of the same message.
    ///  0 means that unacknowledged messages are resent in every epoch.
    pub max_backoff_interval: u32,

    /// Maximum number of sent-but-unacknowledged messages, enforced in addition to
    ///  `window_size`. This only makes a difference if selective acks leave holes in the window.
    pub max_unacked_messages: usize,
}

impl Default for LspParams {
    fn default() -> Self {
        LspParams {
            epoch_limit: 5,
            epoch_millis: 2000,
            window_size: 1,
            max_backoff_interval: 0,
            max_unacked_messages: 1,
        }
    }
}

impl LspParams {
    /// convenience constructor: no backoff, and `max_unacked_messages` equal to `window_size`
    pub fn new(epoch_limit: u32, epoch_millis: u64, window_size: usize) -> LspParams {
        LspParams {
            epoch_limit,
            epoch_millis,
            window_size,
            max_backoff_interval: 0,
            max_unacked_messages: window_size,
        }
    }

    pub fn with_max_backoff_interval(mut self, max_backoff_interval: u32) -> LspParams {
        self.max_backoff_interval = max_backoff_interval;
        self
    }

    pub fn with_max_unacked_messages(mut self, max_unacked_messages: usize) -> LspParams {
        self.max_unacked_messages = max_unacked_messages;
        self
    }

    pub fn epoch_duration(&self) -> Duration {
        Duration::from_millis(self.epoch_millis)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.epoch_limit == 0 {
            bail!("epoch limit must be at least 1");
        }
        if self.epoch_millis == 0 {
            bail!("epoch length must be at least 1 millisecond");
        }
        if self.window_size == 0 {
            bail!("window size must be at least 1");
        }
        if self.max_unacked_messages == 0 {
            bail!("max number of unacknowledged messages must be at least 1");
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_default_is_valid() {
        assert!(LspParams::default().validate().is_ok());
    }

    #[rstest]
    #[case::valid(LspParams::new(5, 100, 3), true)]
    #[case::zero_epoch_limit(LspParams::new(0, 100, 3), false)]
    #[case::zero_epoch_millis(LspParams::new(5, 0, 3), false)]
    #[case::zero_window(LspParams::new(5, 100, 0), false)]
    #[case::zero_unacked(LspParams::new(5, 100, 3).with_max_unacked_messages(0), false)]
    #[case::backoff(LspParams::new(5, 100, 3).with_max_backoff_interval(8), true)]
    fn test_validate(#[case] params: LspParams, #[case] expected_valid: bool) {
        assert_eq!(params.validate().is_ok(), expected_valid);
    }

    #[test]
    fn test_new_couples_unacked_to_window() {
        let params = LspParams::new(5, 100, 7);
        assert_eq!(params.max_unacked_messages, 7);
        assert_eq!(params.max_backoff_interval, 0);
        assert_eq!(params.epoch_duration(), Duration::from_millis(100));
    }
}
