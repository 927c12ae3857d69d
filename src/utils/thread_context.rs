use std::{
    thread::{sleep, JoinHandle},
    time::Duration,
};

const GRACEFUL_STOP_RETRY: u16 = 100;
const GRACEFUL_STOP_RETRY_INTERVAL: Duration = Duration::from_millis(100);

use crate::{
    event::{
        cancellation::CancellationMessage,
        channel::{pub_sub, EventConsumer, EventPublisher},
    },
    utils::threads::spawn_named_thread,
};

/// A named worker thread paired with a cancellation channel. The callback
/// receives the consumer side and is expected to return when a message (or a
/// channel close) is observed on it.
pub struct NotStartedThreadContext<F, T>
where
    F: FnOnce(EventConsumer<CancellationMessage>) -> T + Send + 'static,
    T: Send + 'static,
{
    thread_name: String,
    callback: F,
}

impl<F, T> NotStartedThreadContext<F, T>
where
    F: FnOnce(EventConsumer<CancellationMessage>) -> T + Send + 'static,
    T: Send + 'static,
{
    pub fn new<S: Into<String>>(thread_name: S, callback: F) -> Self {
        Self {
            thread_name: thread_name.into(),
            callback,
        }
    }

    pub fn start(self) -> StartedThreadContext {
        let (stop_publisher, stop_consumer) = pub_sub::<CancellationMessage>();

        StartedThreadContext {
            thread_name: self.thread_name.clone(),
            stop_publisher,
            join_handle: spawn_named_thread(&self.thread_name, move || {
                (self.callback)(stop_consumer);
            }),
        }
    }
}

pub struct StartedThreadContext {
    thread_name: String,
    stop_publisher: EventPublisher<CancellationMessage>,
    join_handle: JoinHandle<()>,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ThreadStopError {
    #[error("error sending stop signal to '{0}' thread: {1}")]
    StopSignal(String, String),

    #[error("error joining '{0}' thread")]
    Join(String),

    #[error("timeout waiting for '{0}' thread to finish")]
    StopTimeout(String),
}

impl StartedThreadContext {
    pub fn thread_name(&self) -> &str {
        &self.thread_name
    }

    pub fn is_thread_finished(&self) -> bool {
        self.join_handle.is_finished()
    }

    /// Sends the stop signal and polls for the thread to finish, giving up
    /// after `GRACEFUL_STOP_RETRY * GRACEFUL_STOP_RETRY_INTERVAL`.
    pub fn stop(self) -> Result<(), ThreadStopError> {
        self.stop_publisher
            .publish(())
            .map_err(|err| ThreadStopError::StopSignal(self.thread_name.clone(), err.to_string()))?;
        for _ in 0..GRACEFUL_STOP_RETRY {
            if self.join_handle.is_finished() {
                return self
                    .join_handle
                    .join()
                    .map_err(|_| ThreadStopError::Join(self.thread_name));
            }
            sleep(GRACEFUL_STOP_RETRY_INTERVAL);
        }

        Err(ThreadStopError::StopTimeout(self.thread_name))
    }

    /// Sends the stop signal and blocks until the thread is joined.
    pub fn stop_blocking(self) -> Result<(), ThreadStopError> {
        self.stop_publisher
            .publish(())
            .map_err(|err| ThreadStopError::StopSignal(self.thread_name.clone(), err.to_string()))?;
        self.join_handle
            .join()
            .map_err(|_| ThreadStopError::Join(self.thread_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::cancellation::CancellationMessage;
    use crate::event::channel::EventConsumer;

    #[test]
    fn thread_context_start_and_stop() {
        let callback = |stop_consumer: EventConsumer<CancellationMessage>| loop {
            if stop_consumer.is_cancelled(Duration::default()) {
                break;
            }
        };

        let started = NotStartedThreadContext::new("test-thread", callback).start();
        assert!(!started.is_thread_finished());
        started.stop_blocking().unwrap();

        let started = NotStartedThreadContext::new("test-thread", callback).start();
        assert!(!started.is_thread_finished());
        started.stop().unwrap();
    }
}
