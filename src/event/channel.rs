use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use thiserror::Error;

pub struct EventConsumer<E>(Receiver<E>);

impl<E> From<Receiver<E>> for EventConsumer<E> {
    fn from(value: Receiver<E>) -> Self {
        Self(value)
    }
}

pub struct EventPublisher<E>(Sender<E>);

impl<E> From<Sender<E>> for EventPublisher<E> {
    fn from(value: Sender<E>) -> Self {
        Self(value)
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum EventPublisherError {
    #[error("error while publishing event: {0}")]
    SendError(String),
}

pub fn pub_sub<E>() -> (EventPublisher<E>, EventConsumer<E>) {
    let (s, r) = unbounded();
    (EventPublisher(s), EventConsumer(r))
}

impl<E> EventPublisher<E> {
    pub fn publish(&self, event: E) -> Result<(), EventPublisherError> {
        self.0
            .send(event)
            .map_err(|err| EventPublisherError::SendError(err.to_string()))
    }
}

impl<E> Clone for EventPublisher<E> {
    fn clone(&self) -> Self {
        EventPublisher(self.0.clone())
    }
}

impl<E> EventConsumer<E> {
    pub fn recv_timeout(&self, timeout: std::time::Duration) -> Result<E, RecvTimeoutError> {
        self.0.recv_timeout(timeout)
    }
}

impl<E> AsRef<Receiver<E>> for EventConsumer<E> {
    fn as_ref(&self) -> &Receiver<E> {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_and_consume_in_order() {
        let (publisher, consumer) = pub_sub::<u8>();
        publisher.publish(1).unwrap();
        publisher.publish(2).unwrap();

        assert_eq!(consumer.as_ref().recv().unwrap(), 1);
        assert_eq!(consumer.as_ref().recv().unwrap(), 2);
    }

    #[test]
    fn publish_after_consumer_dropped_fails() {
        let (publisher, consumer) = pub_sub::<u8>();
        drop(consumer);
        assert!(publisher.publish(1).is_err());
    }
}
