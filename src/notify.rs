use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub for committed events, one channel per device.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to a device's events. Creates the channel if needed.
    pub fn subscribe(&self, device_id: Ulid) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(device_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// No-op if nobody is listening.
    pub fn send(&self, device_id: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&device_id) {
            let _ = sender.send(event.clone());
        }
    }

    /// Drop a device's channel. Receivers drain what was already sent, then
    /// see the channel close.
    pub fn remove(&self, device_id: &Ulid) {
        self.channels.remove(device_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let dev = Ulid::new();
        let mut rx = hub.subscribe(dev);

        let event = Event::DeviceDeleted { id: dev };
        hub.send(dev, &event);
        assert_eq!(rx.recv().await.unwrap(), event);
    }

    #[tokio::test]
    async fn channels_are_per_device() {
        let hub = NotifyHub::new();
        let (a, b) = (Ulid::new(), Ulid::new());
        let mut rx_a = hub.subscribe(a);

        hub.send(b, &Event::DeviceDeleted { id: b });
        assert!(matches!(
            rx_a.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        let dev = Ulid::new();
        hub.send(dev, &Event::DeviceDeleted { id: dev });
    }

    #[tokio::test]
    async fn remove_closes_after_drain() {
        let hub = NotifyHub::new();
        let dev = Ulid::new();
        let mut rx = hub.subscribe(dev);
        hub.send(dev, &Event::DeviceDeleted { id: dev });
        hub.remove(&dev);

        assert!(rx.recv().await.is_ok());
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
    }
}
