use std::collections::BTreeMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::network::circuit::Circuit;
use crate::packet::{CapsMessage, Packet, PacketType};

#[cfg_attr(test, automock)]
#[async_trait]
pub trait PacketCallback: Send + Sync + 'static {
    async fn on_packet(&self, packet: Arc<Packet>, circuit: Arc<Circuit>);
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait CapsEventCallback: Send + Sync + 'static {
    async fn on_caps_event(&self, name: String, message: Arc<CapsMessage>, circuit: Arc<Circuit>);
}

/// Identifies a registered callback for unregistering it
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct CallbackHandle(u64);

/// Callbacks per key, invoked in registration order. Raising an event works on a snapshot of
///  the callbacks, so callbacks may (un)register callbacks themselves.
pub struct CallbackRegistry<K, C: ?Sized> {
    next_handle: AtomicU64,
    callbacks: RwLock<FxHashMap<K, BTreeMap<CallbackHandle, Arc<C>>>>,
}

impl <K: Hash + Eq + Debug, C: ?Sized> CallbackRegistry<K, C> {
    pub fn new() -> CallbackRegistry<K, C> {
        CallbackRegistry {
            next_handle: AtomicU64::new(1),
            callbacks: Default::default(),
        }
    }

    pub fn register(&self, key: K, callback: Arc<C>) -> CallbackHandle {
        let handle = CallbackHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        trace!("registering callback {:?} for {:?}", handle, key);

        self.callbacks.write().unwrap()
            .entry(key)
            .or_default()
            .insert(handle, callback);
        handle
    }

    /// returns false if there was no such callback
    pub fn unregister(&self, key: &K, handle: CallbackHandle) -> bool {
        let mut callbacks = self.callbacks.write().unwrap();
        let Some(for_key) = callbacks.get_mut(key)
        else {
            return false;
        };

        let was_removed = for_key.remove(&handle).is_some();
        if for_key.is_empty() {
            callbacks.remove(key);
        }
        was_removed
    }

    pub fn has_callbacks(&self, key: &K) -> bool {
        self.callbacks.read().unwrap()
            .contains_key(key)
    }

    fn snapshot(&self, key: &K) -> Vec<Arc<C>> {
        self.callbacks.read().unwrap()
            .get(key)
            .map(|for_key| for_key.values().cloned().collect())
            .unwrap_or_default()
    }
}

impl <K: Hash + Eq + Debug, C: ?Sized> Default for CallbackRegistry<K, C> {
    fn default() -> Self {
        CallbackRegistry::new()
    }
}

pub type PacketEvents = CallbackRegistry<PacketType, dyn PacketCallback>;
pub type CapsEvents = CallbackRegistry<String, dyn CapsEventCallback>;

impl CallbackRegistry<PacketType, dyn PacketCallback> {
    /// Invokes the callbacks for the packet's type one after the other, returning the number of
    ///  callbacks
    pub async fn raise(&self, packet: Arc<Packet>, circuit: Arc<Circuit>) -> usize {
        let callbacks = self.snapshot(&packet.packet_type());
        if callbacks.is_empty() {
            debug!("no callback registered for {:?} - ignoring", packet.packet_type());
        }

        for callback in &callbacks {
            callback.on_packet(packet.clone(), circuit.clone()).await;
        }
        callbacks.len()
    }

    /// Invokes the callbacks for the packet's type on spawned tasks, returning the number of
    ///  callbacks
    pub fn begin_raise(&self, packet: Arc<Packet>, circuit: Arc<Circuit>) -> usize {
        let callbacks = self.snapshot(&packet.packet_type());
        if callbacks.is_empty() {
            debug!("no callback registered for {:?} - ignoring", packet.packet_type());
        }

        for callback in &callbacks {
            let callback = callback.clone();
            let packet = packet.clone();
            let circuit = circuit.clone();
            tokio::spawn(async move {
                callback.on_packet(packet, circuit).await;
            });
        }
        callbacks.len()
    }
}

impl CallbackRegistry<String, dyn CapsEventCallback> {
    pub async fn raise(&self, name: &str, message: Arc<CapsMessage>, circuit: Arc<Circuit>) -> usize {
        let callbacks = self.snapshot(&name.to_string());
        if callbacks.is_empty() {
            debug!("no callback registered for capability event {} - ignoring", name);
        }

        for callback in &callbacks {
            callback.on_caps_event(name.to_string(), message.clone(), circuit.clone()).await;
        }
        callbacks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::network::test_circuit;
    use bytes::Bytes;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::runtime::Builder;

    struct Recorder {
        id: u32,
        log: Arc<Mutex<Vec<u32>>>,
    }

    #[async_trait]
    impl PacketCallback for Recorder {
        async fn on_packet(&self, _packet: Arc<Packet>, _circuit: Arc<Circuit>) {
            self.log.lock().unwrap().push(self.id);
        }
    }

    fn ping() -> Arc<Packet> {
        Arc::new(Packet::StartPingCheck { ping_id: 1, oldest_unacked: 0 })
    }

    #[test]
    fn test_raise_in_registration_order() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let registry = PacketEvents::new();
            let log = Arc::new(Mutex::new(Vec::new()));
            for id in [3, 1, 2] {
                registry.register(PacketType::StartPingCheck, Arc::new(Recorder { id, log: log.clone() }));
            }
            registry.register(PacketType::CloseCircuit, Arc::new(Recorder { id: 99, log: log.clone() }));

            let num_invoked = registry.raise(ping(), test_circuit()).await;
            assert_eq!(num_invoked, 3);
            assert_eq!(*log.lock().unwrap(), vec![3, 1, 2]);
        });
    }

    #[test]
    fn test_unregister() {
        let registry = PacketEvents::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let a = registry.register(PacketType::StartPingCheck, Arc::new(Recorder { id: 1, log: log.clone() }));
        let b = registry.register(PacketType::StartPingCheck, Arc::new(Recorder { id: 2, log: log.clone() }));

        assert!(!registry.unregister(&PacketType::CloseCircuit, a));
        assert!(registry.unregister(&PacketType::StartPingCheck, a));
        assert!(!registry.unregister(&PacketType::StartPingCheck, a));
        assert!(registry.has_callbacks(&PacketType::StartPingCheck));
        assert!(registry.unregister(&PacketType::StartPingCheck, b));
        assert!(!registry.has_callbacks(&PacketType::StartPingCheck));
    }

    #[test]
    fn test_begin_raise_runs_callbacks_on_tasks() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let registry = PacketEvents::new();
            let mut callback = MockPacketCallback::new();
            callback.expect_on_packet()
                .times(1)
                .return_const(());
            registry.register(PacketType::StartPingCheck, Arc::new(callback));

            assert_eq!(registry.begin_raise(ping(), test_circuit()), 1);
            tokio::time::sleep(Duration::from_millis(1)).await;
        });
    }

    #[test]
    fn test_raise_caps_event_by_name() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let registry = CapsEvents::new();
            let mut callback = MockCapsEventCallback::new();
            callback.expect_on_caps_event()
                .withf(|name, _, _| name == "EventQueueRunning")
                .times(1)
                .return_const(());
            registry.register("EventQueueRunning".to_string(), Arc::new(callback));

            let message = Arc::new(CapsMessage::Other(Bytes::new()));
            assert_eq!(registry.raise("EventQueueRunning", message.clone(), test_circuit()).await, 1);
            assert_eq!(registry.raise("ParcelProperties", message, test_circuit()).await, 0);
        });
    }
}
