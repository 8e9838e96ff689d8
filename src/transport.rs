//! Fragment delivery seam.
//!
//! The request handler only sees [`FragmentTransport`]. The network layer that
//! would sit behind it in a deployment is out of scope; [`ChannelTransport`]
//! routes fragments to in-process crossbeam channels, which is what the
//! emulation binary and the tests use.

use crate::error::DeliveryError;
use crate::request::DataDestination;
use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, SendTimeoutError, Sender};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::Duration;

/// Hands serialized fragments to their destination.
pub trait FragmentTransport: Send + Sync {
    /// Deliver `bytes` to `destination`, giving up after `timeout`.
    ///
    /// Called exactly once per request; implementations must not retry.
    fn send_to(
        &self,
        destination: &DataDestination,
        bytes: Bytes,
        timeout: Duration,
    ) -> Result<(), DeliveryError>;
}

/// In-process transport backed by bounded crossbeam channels.
#[derive(Debug, Default)]
pub struct ChannelTransport {
    routes: RwLock<HashMap<DataDestination, Sender<Bytes>>>,
}

impl ChannelTransport {
    /// Transport with no routes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `destination` with a queue of `capacity` fragments, returning its receiving end.
    ///
    /// Re-registering a destination replaces the previous route.
    pub fn register(&self, destination: DataDestination, capacity: usize) -> Receiver<Bytes> {
        let (tx, rx) = bounded(capacity);
        self.routes.write().insert(destination, tx);
        rx
    }

    /// Remove the route for `destination`.
    pub fn unregister(&self, destination: &DataDestination) -> bool {
        self.routes.write().remove(destination).is_some()
    }
}

impl FragmentTransport for ChannelTransport {
    fn send_to(
        &self,
        destination: &DataDestination,
        bytes: Bytes,
        timeout: Duration,
    ) -> Result<(), DeliveryError> {
        // Clone the sender so the route table lock is not held while blocking.
        let sender = self
            .routes
            .read()
            .get(destination)
            .cloned()
            .ok_or_else(|| DeliveryError::Unreachable(destination.to_string()))?;

        sender.send_timeout(bytes, timeout).map_err(|err| match err {
            SendTimeoutError::Timeout(_) => DeliveryError::Timeout {
                destination: destination.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            },
            SendTimeoutError::Disconnected(_) => {
                DeliveryError::Disconnected(destination.to_string())
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delivers_to_registered_destination() {
        let transport = ChannelTransport::new();
        let rx = transport.register("dfo".into(), 4);
        transport
            .send_to(&"dfo".into(), Bytes::from_static(b"abc"), Duration::from_millis(10))
            .unwrap();
        assert_eq!(rx.try_recv().unwrap(), Bytes::from_static(b"abc"));
    }

    #[test]
    fn test_unknown_destination_is_unreachable() {
        let transport = ChannelTransport::new();
        let err = transport
            .send_to(&"nowhere".into(), Bytes::new(), Duration::from_millis(1))
            .unwrap_err();
        assert_eq!(err, DeliveryError::Unreachable("nowhere".into()));
    }

    #[test]
    fn test_full_queue_times_out() {
        let transport = ChannelTransport::new();
        let _rx = transport.register("slow".into(), 1);
        let dest = DataDestination::from("slow");
        transport
            .send_to(&dest, Bytes::new(), Duration::from_millis(1))
            .unwrap();
        let err = transport
            .send_to(&dest, Bytes::new(), Duration::from_millis(5))
            .unwrap_err();
        assert!(matches!(err, DeliveryError::Timeout { timeout_ms: 5, .. }));
    }

    #[test]
    fn test_dropped_receiver_is_disconnected() {
        let transport = ChannelTransport::new();
        drop(transport.register("gone".into(), 1));
        let err = transport
            .send_to(&"gone".into(), Bytes::new(), Duration::from_millis(1))
            .unwrap_err();
        assert_eq!(err, DeliveryError::Disconnected("gone".into()));
        assert!(transport.unregister(&"gone".into()));
    }
}
