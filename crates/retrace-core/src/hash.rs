use crate::constants::DELIVERY_QUEUE_CAPACITY;
use crate::packet::CapturedPacket;
use crate::payload::WIRE_KEY_SIZE;
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// A packet fingerprint: the probe signature followed by a raw UUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PacketHash(pub [u8; WIRE_KEY_SIZE]);

impl PacketHash {
    /// The fingerprint of an application payload, if long enough.
    #[must_use]
    pub fn from_payload(payload: &[u8]) -> Option<Self> {
        let key = payload.get(..WIRE_KEY_SIZE)?;
        let mut bytes = [0_u8; WIRE_KEY_SIZE];
        bytes.copy_from_slice(key);
        Some(Self(bytes))
    }
}

/// Produces a fingerprint for a packet, or `None` for packets it cannot
/// fingerprint.
pub type PacketHasher = Box<dyn Fn(&CapturedPacket) -> Option<PacketHash> + Send + Sync>;

/// The reference hasher: the first [`WIRE_KEY_SIZE`] bytes of the
/// application payload.
#[must_use]
pub fn boomerang_packet_hasher(packet: &CapturedPacket) -> Option<PacketHash> {
    PacketHash::from_payload(packet.application_payload()?)
}

/// Maps packet fingerprints to delivery queues.
///
/// Unlike the listener table no predicates are evaluated at dispatch time;
/// each attached hasher is applied and the produced fingerprints are looked
/// up directly.
pub(crate) struct HashTable {
    map: Mutex<HashMap<PacketHash, Sender<CapturedPacket>>>,
    hashers: Mutex<Vec<PacketHasher>>,
    dropped: AtomicU64,
}

impl HashTable {
    pub fn new() -> Self {
        Self {
            map: Mutex::new(HashMap::new()),
            hashers: Mutex::new(Vec::new()),
            dropped: AtomicU64::new(0),
        }
    }

    /// Attach a hasher.  Hashers may be expensive: attach only what is
    /// needed.
    pub fn attach_hasher(&self, hasher: PacketHasher) {
        self.hashers.lock().push(hasher);
    }

    /// Register interest in a fingerprint, replacing any existing
    /// registration for it.
    pub fn register(&self, hash: PacketHash) -> Receiver<CapturedPacket> {
        let (sender, queue) = bounded(DELIVERY_QUEUE_CAPACITY);
        self.map.lock().insert(hash, sender);
        queue
    }

    /// Remove a fingerprint registration and close its queue.  Returns false
    /// if it was not registered.
    pub fn unregister(&self, hash: &PacketHash) -> bool {
        self.map.lock().remove(hash).is_some()
    }

    /// Fingerprint a packet with every attached hasher and deliver it to any
    /// matching registration.  Hashers that fail on the packet are skipped.
    /// Deliveries are non-blocking; a full queue drops the packet.
    pub fn dispatch(&self, packet: &CapturedPacket) {
        let computed: Vec<PacketHash> = {
            let hashers = self.hashers.lock();
            hashers.iter().filter_map(|hasher| hasher(packet)).collect()
        };
        if computed.is_empty() {
            return;
        }
        let map = self.map.lock();
        for hash in computed {
            if let Some(sender) = map.get(&hash) {
                if sender.try_send(packet.clone()).is_err() {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    /// The number of deliveries dropped due to full queues.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
