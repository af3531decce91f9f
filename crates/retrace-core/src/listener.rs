use crate::constants::DELIVERY_QUEUE_CAPACITY;
use crate::packet::CapturedPacket;
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// A packet match predicate.
pub type PacketPredicate = Box<dyn Fn(&CapturedPacket) -> bool + Send + Sync>;

/// A registered packet listener.
///
/// Holds the delivery queue for packets matching the predicate it was
/// registered with.  A listener keeps receiving matches until it is
/// unregistered; unregistering closes the queue.
#[derive(Debug)]
pub struct Listener {
    id: u64,
    queue: Receiver<CapturedPacket>,
}

impl Listener {
    /// The delivery queue.
    ///
    /// The queue has a single slot and deliveries never block the
    /// dispatcher: an undrained packet causes later matches to be dropped.
    #[must_use]
    pub fn queue(&self) -> &Receiver<CapturedPacket> {
        &self.queue
    }
}

struct ListenerEntry {
    id: u64,
    predicate: PacketPredicate,
    sender: Sender<CapturedPacket>,
}

/// Maps predicate-bearing listeners to delivery queues.
pub(crate) struct ListenerTable {
    entries: Mutex<Vec<ListenerEntry>>,
    next_id: AtomicU64,
    dropped: AtomicU64,
}

impl ListenerTable {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Register a listener; the registration is visible to the dispatcher
    /// before this returns.
    pub fn register<P>(&self, predicate: P) -> Listener
    where
        P: Fn(&CapturedPacket) -> bool + Send + Sync + 'static,
    {
        let (sender, queue) = bounded(DELIVERY_QUEUE_CAPACITY);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().push(ListenerEntry {
            id,
            predicate: Box::new(predicate),
            sender,
        });
        Listener { id, queue }
    }

    /// Remove a listener and close its queue.  Returns false if it was
    /// already removed.
    pub fn unregister(&self, listener: &Listener) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|entry| entry.id != listener.id);
        entries.len() != before
    }

    /// Deliver a packet to every listener whose predicate matches, in
    /// insertion order.  Deliveries are non-blocking; a full queue drops the
    /// packet (the prior packet is still pending a consumer).
    pub fn dispatch(&self, packet: &CapturedPacket) {
        let entries = self.entries.lock();
        for entry in entries.iter() {
            if (entry.predicate)(packet) && entry.sender.try_send(packet.clone()).is_err() {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// The number of deliveries dropped due to full queues.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::TryRecvError;

    fn packet(first_byte: u8) -> CapturedPacket {
        let mut data = vec![0x45_u8; 20];
        data[19] = first_byte;
        CapturedPacket::new(data)
    }

    #[test]
    fn test_register_and_dispatch() {
        let table = ListenerTable::new();
        let listener = table.register(|p| p.as_bytes()[19] == 7);
        table.dispatch(&packet(7));
        assert_eq!(7, listener.queue().try_recv().unwrap().as_bytes()[19]);
    }

    #[test]
    fn test_non_matching_not_delivered() {
        let table = ListenerTable::new();
        let listener = table.register(|p| p.as_bytes()[19] == 7);
        table.dispatch(&packet(8));
        assert_eq!(Err(TryRecvError::Empty), listener.queue().try_recv());
    }

    #[test]
    fn test_listener_receives_until_unregistered() {
        let table = ListenerTable::new();
        let listener = table.register(|_| true);
        table.dispatch(&packet(1));
        assert!(listener.queue().try_recv().is_ok());
        table.dispatch(&packet(2));
        assert!(listener.queue().try_recv().is_ok());
    }

    #[test]
    fn test_multiple_matching_listeners_each_delivered() {
        let table = ListenerTable::new();
        let first = table.register(|_| true);
        let second = table.register(|_| true);
        table.dispatch(&packet(1));
        assert!(first.queue().try_recv().is_ok());
        assert!(second.queue().try_recv().is_ok());
    }

    #[test]
    fn test_drop_on_full() {
        let table = ListenerTable::new();
        let listener = table.register(|_| true);
        table.dispatch(&packet(1));
        table.dispatch(&packet(2));
        assert_eq!(1, table.dropped());
        assert_eq!(1, listener.queue().try_recv().unwrap().as_bytes()[19]);
        assert_eq!(Err(TryRecvError::Empty), listener.queue().try_recv());
    }

    #[test]
    fn test_unregister_closes_queue() {
        let table = ListenerTable::new();
        let listener = table.register(|_| true);
        assert!(table.unregister(&listener));
        assert!(!table.unregister(&listener));
        table.dispatch(&packet(1));
        assert_eq!(Err(TryRecvError::Disconnected), listener.queue().try_recv());
    }
}
