use crate::Message;
use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError, TrySendError};
use parking_lot::Mutex;
use thiserror::Error;

/// Frames queued per subscriber before the transport starts dropping. The
/// meter fast path can outrun a stalled window; overflow loses frames rather
/// than ever blocking the publisher.
pub const SUBSCRIBER_CAP: usize = 256;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("failed to encode message frame: {0}")]
    Encode(#[from] serde_json::Error),
}

/// The shared multicast medium both ends talk over.
///
/// Delivery is at-most-once and unordered across subscribers; there is no
/// confirmation. Implementations may be backed by sockets, pipes, or an
/// in-process bus -- protocol logic never sees the difference.
pub trait MessageBus {
    fn publish(&self, msg: &Message) -> Result<(), BusError>;
    fn subscribe(&self) -> BusReceiver;
}

/// In-process implementation: JSON text frames fanned out over bounded
/// channels, one per subscriber.
#[derive(Default)]
pub struct LocalBus {
    subscribers: Mutex<Vec<Sender<String>>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inject a raw frame, e.g. from a bridging transport. Malformed frames
    /// are filtered on the receive side, not here.
    pub fn publish_frame(&self, frame: String) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| match tx.try_send(frame.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                log::debug!("bus subscriber queue full, dropping frame");
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        });
    }
}

impl MessageBus for LocalBus {
    fn publish(&self, msg: &Message) -> Result<(), BusError> {
        let frame = serde_json::to_string(msg)?;
        self.publish_frame(frame);
        Ok(())
    }

    fn subscribe(&self) -> BusReceiver {
        let (tx, rx) = bounded(SUBSCRIBER_CAP);
        self.subscribers.lock().push(tx);
        BusReceiver { rx }
    }
}

/// Receive side of a subscription. Decodes frames lazily and silently skips
/// anything that is not a valid message.
pub struct BusReceiver {
    rx: Receiver<String>,
}

impl BusReceiver {
    pub fn try_recv(&self) -> Option<Message> {
        loop {
            match self.rx.try_recv() {
                Ok(frame) => match serde_json::from_str(&frame) {
                    Ok(msg) => return Some(msg),
                    Err(e) => {
                        log::debug!("ignoring malformed frame: {e}");
                        continue;
                    }
                },
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::now_millis;

    #[test]
    fn publish_reaches_every_subscriber() {
        let bus = LocalBus::new();
        let a = bus.subscribe();
        let b = bus.subscribe();

        let msg = Message::Ping {
            target_id: "ins-1".to_string(),
            timestamp: now_millis(),
        };
        bus.publish(&msg).unwrap();

        assert_eq!(a.try_recv(), Some(msg.clone()));
        assert_eq!(b.try_recv(), Some(msg));
        assert_eq!(a.try_recv(), None);
    }

    #[test]
    fn malformed_frames_are_skipped() {
        let bus = LocalBus::new();
        let rx = bus.subscribe();

        bus.publish_frame("{not json".to_string());
        let msg = Message::Pong {
            target_id: "ins-1".to_string(),
            timestamp: 0,
        };
        bus.publish(&msg).unwrap();

        assert_eq!(rx.try_recv(), Some(msg));
    }

    #[test]
    fn dropped_subscriber_is_pruned() {
        let bus = LocalBus::new();
        let rx = bus.subscribe();
        drop(rx);

        // Must not error or leak the dead sender.
        bus.publish(&Message::Ping {
            target_id: "ins-1".to_string(),
            timestamp: 0,
        })
        .unwrap();
        assert!(bus.subscribers.lock().is_empty());
    }
}
