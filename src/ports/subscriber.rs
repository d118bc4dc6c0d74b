//! Live event subscriber port.

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("subscriber is closed")]
    Closed,
    #[error("subscriber is not keeping up")]
    Lagging,
}

/// A connection that receives serialized events.
///
/// `deliver` must return promptly; the hub calls it while holding its lock.
pub trait Subscriber: Send + Sync {
    fn deliver(&self, frame: &str) -> Result<(), DeliveryError>;

    /// Called once when the hub drops the subscriber.
    fn close(&self) {}
}
