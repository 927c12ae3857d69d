use super::channel::EventConsumer;
use crossbeam::channel::RecvTimeoutError;
use std::time::Duration;

pub type CancellationMessage = ();

impl EventConsumer<CancellationMessage> {
    /// Returns true if a cancellation message arrived (or the channel closed)
    /// before `timeout` elapsed. Otherwise blocks for the whole timeout and
    /// returns false.
    pub fn is_cancelled(&self, timeout: Duration) -> bool {
        let timed_out = matches!(
            self.as_ref().recv_timeout(timeout),
            Err(RecvTimeoutError::Timeout)
        );
        !timed_out
    }
}
