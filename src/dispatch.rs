//! The dispatch surface: packet-type callbacks for decoded wire messages, plus a
//!  parallel registry for capability events (decoded OSD pushed in by the
//!  out-of-band event source), so collaborators see one uniform surface.
//!
//! Registration returns a [`CallbackHandle`] that is the only way to remove a
//!  callback again - closures have no usable identity of their own. Callbacks for
//!  one key run in registration order; a panicking callback is caught and logged
//!  without affecting the ones after it or the receive pump.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use rustc_hash::FxHashMap;
use tracing::error;

use crate::messages::{Message, PacketType};
use crate::osd::Osd;

/// Identity of one circuit in the engine's table.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct CircuitId(pub(crate) u64);

/// A decoded inbound packet as handed to callbacks.
#[derive(Debug, Clone)]
pub struct PacketEvent {
    pub circuit: CircuitId,
    pub sequence: u32,
    pub message: Message,
}

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct CallbackHandle(u64);

type PacketCallback = Arc<dyn Fn(&PacketEvent) + Send + Sync>;
type EventCallback = Arc<dyn Fn(&Osd) + Send + Sync>;

#[derive(Default)]
pub struct Dispatcher {
    next_handle: AtomicU64,
    packet_callbacks: RwLock<FxHashMap<PacketType, Vec<(CallbackHandle, PacketCallback)>>>,
    event_callbacks: RwLock<FxHashMap<String, Vec<(CallbackHandle, EventCallback)>>>,
}

impl Dispatcher {
    pub fn new() -> Dispatcher {
        Dispatcher::default()
    }

    pub fn register(
        &self,
        packet_type: PacketType,
        callback: impl Fn(&PacketEvent) + Send + Sync + 'static,
    ) -> CallbackHandle {
        let handle = self.fresh_handle();
        self.packet_callbacks
            .write()
            .expect("dispatcher lock poisoned")
            .entry(packet_type)
            .or_default()
            .push((handle, Arc::new(callback)));
        handle
    }

    /// `true` if the handle was registered for this packet type and is now gone
    pub fn unregister(&self, packet_type: PacketType, handle: CallbackHandle) -> bool {
        let mut callbacks = self
            .packet_callbacks
            .write()
            .expect("dispatcher lock poisoned");
        match callbacks.get_mut(&packet_type) {
            Some(list) => {
                let before = list.len();
                list.retain(|(h, _)| *h != handle);
                before != list.len()
            }
            None => false,
        }
    }

    pub fn register_event(
        &self,
        event_name: impl Into<String>,
        callback: impl Fn(&Osd) + Send + Sync + 'static,
    ) -> CallbackHandle {
        let handle = self.fresh_handle();
        self.event_callbacks
            .write()
            .expect("dispatcher lock poisoned")
            .entry(event_name.into())
            .or_default()
            .push((handle, Arc::new(callback)));
        handle
    }

    pub fn unregister_event(&self, event_name: &str, handle: CallbackHandle) -> bool {
        let mut callbacks = self
            .event_callbacks
            .write()
            .expect("dispatcher lock poisoned");
        match callbacks.get_mut(event_name) {
            Some(list) => {
                let before = list.len();
                list.retain(|(h, _)| *h != handle);
                before != list.len()
            }
            None => false,
        }
    }

    /// Invoke all callbacks registered for the event's packet type, in
    ///  registration order, on the calling thread.
    pub fn dispatch(&self, event: &PacketEvent) {
        // clone the list out of the lock so callbacks may (un)register freely
        let list: Vec<(CallbackHandle, PacketCallback)> = {
            let callbacks = self
                .packet_callbacks
                .read()
                .expect("dispatcher lock poisoned");
            match callbacks.get(&event.message.packet_type()) {
                Some(list) => list.clone(),
                None => return,
            }
        };

        for (handle, callback) in &list {
            if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                error!(
                    "callback {:?} for {:?} panicked - skipping it for this packet",
                    handle,
                    event.message.packet_type()
                );
            }
        }
    }

    /// Invoke all capability-event callbacks registered under `event_name`.
    pub fn dispatch_event(&self, event_name: &str, body: &Osd) {
        let list: Vec<(CallbackHandle, EventCallback)> = {
            let callbacks = self
                .event_callbacks
                .read()
                .expect("dispatcher lock poisoned");
            match callbacks.get(event_name) {
                Some(list) => list.clone(),
                None => return,
            }
        };

        for (handle, callback) in &list {
            if catch_unwind(AssertUnwindSafe(|| callback(body))).is_err() {
                error!(
                    "capability-event callback {:?} for {:?} panicked - skipping it",
                    handle, event_name
                );
            }
        }
    }

    fn fresh_handle(&self) -> CallbackHandle {
        CallbackHandle(self.next_handle.fetch_add(1, Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Arc, Mutex};

    use crate::messages::{CompletePingCheck, StartPingCheck};

    use super::*;

    fn ping_event() -> PacketEvent {
        PacketEvent {
            circuit: CircuitId(1),
            sequence: 42,
            message: Message::StartPingCheck(StartPingCheck::default()),
        }
    }

    #[test]
    fn test_dispatch_reaches_registered_callback() {
        let dispatcher = Dispatcher::new();
        let count = Arc::new(AtomicUsize::new(0));

        let count_clone = count.clone();
        dispatcher.register(PacketType::StartPingCheck, move |event| {
            assert_eq!(event.sequence, 42);
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        dispatcher.dispatch(&ping_event());
        dispatcher.dispatch(&ping_event());
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_dispatch_ignores_other_types() {
        let dispatcher = Dispatcher::new();
        let count = Arc::new(AtomicUsize::new(0));

        let count_clone = count.clone();
        dispatcher.register(PacketType::CompletePingCheck, move |_| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        dispatcher.dispatch(&ping_event());
        assert_eq!(count.load(Ordering::SeqCst), 0);

        dispatcher.dispatch(&PacketEvent {
            circuit: CircuitId(1),
            sequence: 1,
            message: Message::CompletePingCheck(CompletePingCheck::default()),
        });
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_invocation_order_matches_registration_order() {
        let dispatcher = Dispatcher::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..5 {
            let order = order.clone();
            dispatcher.register(PacketType::StartPingCheck, move |_| {
                order.lock().unwrap().push(i);
            });
        }

        dispatcher.dispatch(&ping_event());
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_unregister_removes_exactly_one() {
        let dispatcher = Dispatcher::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c1 = count.clone();
        let keep = dispatcher.register(PacketType::StartPingCheck, move |_| {
            c1.fetch_add(1, Ordering::SeqCst);
        });
        let c2 = count.clone();
        let remove = dispatcher.register(PacketType::StartPingCheck, move |_| {
            c2.fetch_add(100, Ordering::SeqCst);
        });

        assert!(dispatcher.unregister(PacketType::StartPingCheck, remove));
        assert!(!dispatcher.unregister(PacketType::StartPingCheck, remove));

        dispatcher.dispatch(&ping_event());
        assert_eq!(count.load(Ordering::SeqCst), 1);

        assert!(dispatcher.unregister(PacketType::StartPingCheck, keep));
    }

    #[test]
    fn test_panicking_callback_is_isolated() {
        let dispatcher = Dispatcher::new();
        let count = Arc::new(AtomicUsize::new(0));

        dispatcher.register(PacketType::StartPingCheck, |_| {
            panic!("callback gone wrong");
        });
        let count_clone = count.clone();
        dispatcher.register(PacketType::StartPingCheck, move |_| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        dispatcher.dispatch(&ping_event());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_capability_events() {
        let dispatcher = Dispatcher::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let seen_clone = seen.clone();
        let handle = dispatcher.register_event("TeleportFinish", move |body| {
            seen_clone.lock().unwrap().push(body.get("region_x").as_integer());
        });

        dispatcher.dispatch_event("TeleportFinish", &{
            let mut m = rustc_hash::FxHashMap::default();
            m.insert("region_x".to_string(), Osd::Integer(256));
            Osd::Map(m)
        });
        dispatcher.dispatch_event("SomethingElse", &Osd::Null);

        assert_eq!(*seen.lock().unwrap(), vec![256]);
        assert!(dispatcher.unregister_event("TeleportFinish", handle));
    }
}
