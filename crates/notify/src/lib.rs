//! Typed process-wide publish/subscribe
//!
//! Peers use notifications to fan events out without coupling publisher
//! and subscriber (a query-error broadcast that re-schedules fetch jobs,
//! a liveness change, ...). Each message type gets its own process-wide
//! listener registry behind its own mutex. `publish` snapshots the
//! listener list under the mutex and invokes the listeners with the
//! mutex released, so a listener may publish again (or subscribe) without
//! deadlocking the registry.
//!
//! ```
//! use std::sync::Arc;
//! use tessera_notify::Notification;
//!
//! struct QueryError { query_id: u64 }
//!
//! let seen = Arc::new(std::sync::atomic::AtomicU64::new(0));
//! let seen2 = Arc::clone(&seen);
//! let id = Notification::<QueryError>::add_publish_listener(move |msg| {
//!     seen2.store(msg.query_id, std::sync::atomic::Ordering::SeqCst);
//! });
//!
//! Notification::new(QueryError { query_id: 9 }).publish();
//! assert_eq!(seen.load(std::sync::atomic::Ordering::SeqCst), 9);
//! Notification::<QueryError>::remove_publish_listener(&id);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::any::{Any, TypeId};
use std::sync::Arc;

/// A listener invoked with each published message of its type.
pub type PublishListener<T> = Arc<dyn Fn(&Arc<T>) + Send + Sync>;

/// A listener invoked whenever a new publish listener registers, so a
/// publisher can re-announce current state to late subscribers.
pub type SubscribeListener = Arc<dyn Fn() + Send + Sync>;

/// Opaque handle for removing a registered listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerId {
    type_id: TypeId,
    id: u64,
}

struct Registry<T> {
    publish: Vec<(u64, PublishListener<T>)>,
    subscribe: Vec<(u64, SubscribeListener)>,
    next_id: u64,
}

impl<T> Registry<T> {
    fn new() -> Self {
        Registry {
            publish: Vec::new(),
            subscribe: Vec::new(),
            next_id: 1,
        }
    }
}

/// Outer map from message type to its registry. The outer mutex guards
/// only registry discovery; each registry has a dedicated mutex.
static REGISTRIES: Lazy<Mutex<FxHashMap<TypeId, Box<dyn Any + Send + Sync>>>> =
    Lazy::new(|| Mutex::new(FxHashMap::default()));

fn registry<T: Send + Sync + 'static>() -> Arc<Mutex<Registry<T>>> {
    let mut map = REGISTRIES.lock();
    let entry = map
        .entry(TypeId::of::<T>())
        .or_insert_with(|| Box::new(Arc::new(Mutex::new(Registry::<T>::new()))));
    entry
        .downcast_ref::<Arc<Mutex<Registry<T>>>>()
        .expect("notification registry holds one registry type per TypeId")
        .clone()
}

/// A message of type `T` ready to publish, plus the static registration
/// surface for `T` listeners.
pub struct Notification<T: Send + Sync + 'static> {
    msg: Arc<T>,
}

impl<T: Send + Sync + 'static> Notification<T> {
    /// Wrap a message for publishing.
    pub fn new(msg: T) -> Self {
        Notification { msg: Arc::new(msg) }
    }

    /// Publish to all currently registered listeners.
    ///
    /// The listener list is snapshotted under the registry mutex and the
    /// listeners run with the mutex released.
    pub fn publish(&self) {
        let reg = registry::<T>();
        let listeners: Vec<PublishListener<T>> =
            reg.lock().publish.iter().map(|(_, l)| Arc::clone(l)).collect();
        for listener in listeners {
            listener(&self.msg);
        }
    }

    /// Register a publish listener; fires the subscribe listeners.
    pub fn add_publish_listener(
        listener: impl Fn(&Arc<T>) + Send + Sync + 'static,
    ) -> ListenerId {
        let reg = registry::<T>();
        let (id, subscribers) = {
            let mut reg = reg.lock();
            let id = reg.next_id;
            reg.next_id += 1;
            reg.publish.push((id, Arc::new(listener)));
            let subs: Vec<SubscribeListener> =
                reg.subscribe.iter().map(|(_, l)| Arc::clone(l)).collect();
            (id, subs)
        };
        for subscriber in subscribers {
            subscriber();
        }
        ListenerId {
            type_id: TypeId::of::<T>(),
            id,
        }
    }

    /// Register a subscribe listener.
    pub fn add_subscribe_listener(listener: impl Fn() + Send + Sync + 'static) -> ListenerId {
        let reg = registry::<T>();
        let mut reg = reg.lock();
        let id = reg.next_id;
        reg.next_id += 1;
        reg.subscribe.push((id, Arc::new(listener)));
        ListenerId {
            type_id: TypeId::of::<T>(),
            id,
        }
    }

    /// Remove a publish listener; true when it was present.
    pub fn remove_publish_listener(id: &ListenerId) -> bool {
        if id.type_id != TypeId::of::<T>() {
            return false;
        }
        let reg = registry::<T>();
        let mut reg = reg.lock();
        let before = reg.publish.len();
        reg.publish.retain(|(lid, _)| *lid != id.id);
        reg.publish.len() != before
    }

    /// Remove a subscribe listener; true when it was present.
    pub fn remove_subscribe_listener(id: &ListenerId) -> bool {
        if id.type_id != TypeId::of::<T>() {
            return false;
        }
        let reg = registry::<T>();
        let mut reg = reg.lock();
        let before = reg.subscribe.len();
        reg.subscribe.retain(|(lid, _)| *lid != id.id);
        reg.subscribe.len() != before
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct PingA(u64);
    struct PingB(u64);

    #[test]
    fn publish_reaches_listeners_of_same_type_only() {
        let a_count = Arc::new(AtomicUsize::new(0));
        let b_count = Arc::new(AtomicUsize::new(0));
        let (ac, bc) = (Arc::clone(&a_count), Arc::clone(&b_count));

        let ida = Notification::<PingA>::add_publish_listener(move |_| {
            ac.fetch_add(1, Ordering::SeqCst);
        });
        let idb = Notification::<PingB>::add_publish_listener(move |_| {
            bc.fetch_add(1, Ordering::SeqCst);
        });

        Notification::new(PingA(1)).publish();
        Notification::new(PingA(2)).publish();
        Notification::new(PingB(3)).publish();

        assert_eq!(a_count.load(Ordering::SeqCst), 2);
        assert_eq!(b_count.load(Ordering::SeqCst), 1);

        assert!(Notification::<PingA>::remove_publish_listener(&ida));
        assert!(!Notification::<PingA>::remove_publish_listener(&ida));
        assert!(Notification::<PingB>::remove_publish_listener(&idb));
    }

    #[test]
    fn removed_listener_not_invoked() {
        struct Gone(u64);
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let id = Notification::<Gone>::add_publish_listener(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        Notification::new(Gone(0)).publish();
        assert!(Notification::<Gone>::remove_publish_listener(&id));
        Notification::new(Gone(0)).publish();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn subscribe_listener_fires_on_new_subscription() {
        struct Sub(u64);
        let announced = Arc::new(AtomicUsize::new(0));
        let a = Arc::clone(&announced);
        let sid = Notification::<Sub>::add_subscribe_listener(move || {
            a.fetch_add(1, Ordering::SeqCst);
        });
        let pid = Notification::<Sub>::add_publish_listener(|_| {});
        assert_eq!(announced.load(Ordering::SeqCst), 1);
        assert!(Notification::<Sub>::remove_publish_listener(&pid));
        assert!(Notification::<Sub>::remove_subscribe_listener(&sid));
    }

    #[test]
    fn listener_may_publish_reentrantly() {
        struct Outer;
        struct Inner;
        let inner_count = Arc::new(AtomicUsize::new(0));
        let ic = Arc::clone(&inner_count);
        let inner_id = Notification::<Inner>::add_publish_listener(move |_| {
            ic.fetch_add(1, Ordering::SeqCst);
        });
        // Publishing Inner from an Outer listener exercises the
        // invoke-outside-the-lock rule.
        let outer_id = Notification::<Outer>::add_publish_listener(|_| {
            Notification::new(Inner).publish();
        });
        Notification::new(Outer).publish();
        assert_eq!(inner_count.load(Ordering::SeqCst), 1);
        assert!(Notification::<Outer>::remove_publish_listener(&outer_id));
        assert!(Notification::<Inner>::remove_publish_listener(&inner_id));
    }

    #[test]
    fn cross_type_listener_id_is_rejected() {
        struct TypeOne;
        struct TypeTwo;
        let id = Notification::<TypeOne>::add_publish_listener(|_| {});
        assert!(!Notification::<TypeTwo>::remove_publish_listener(&id));
        assert!(Notification::<TypeOne>::remove_publish_listener(&id));
    }

    #[test]
    fn publish_from_many_threads() {
        struct Threaded;
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let id = Notification::<Threaded>::add_publish_listener(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        let handles: Vec<_> = (0..8)
            .map(|_| {
                std::thread::spawn(|| {
                    for _ in 0..100 {
                        Notification::new(Threaded).publish();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(count.load(Ordering::SeqCst), 800);
        assert!(Notification::<Threaded>::remove_publish_listener(&id));
    }
}
