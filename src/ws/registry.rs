use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use super::connection::{ConnectionConfig, ConnectionSupervisor};
use super::subscriber::Subscriber;
use super::traits::{Endpoint, TransportFactory};
use crate::types::{EndpointKey, ReadyState};

/// Maps endpoint keys to the one physical connection serving them.
///
/// The registry is an ordinary value: share one between [`Client`](crate::Client)s to
/// multiplex their `share` connections, or give each test its own.
#[derive(Default)]
pub struct SharedConnectionRegistry {
    connections: DashMap<EndpointKey, Arc<ConnectionSupervisor>>,
}

/// A subscriber's place on a shared connection, returned by `join` and given back to
/// `leave`.
pub(crate) struct Membership {
    key: EndpointKey,
    supervisor: Arc<ConnectionSupervisor>,
    subscriber: u64,
}

impl Membership {
    pub(crate) fn supervisor(&self) -> &ConnectionSupervisor {
        &self.supervisor
    }
}

impl SharedConnectionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `subscriber` to the connection for `key`, creating it if needed.
    pub(crate) fn join(
        &self,
        key: EndpointKey,
        subscriber: Arc<Subscriber>,
        factory: Arc<dyn TransportFactory>,
        config: ConnectionConfig,
    ) -> Membership {
        let id = subscriber.id();

        // The shard stays locked while attaching so a concurrent last `leave` cannot
        // remove the entry in between.
        let supervisor = match self.connections.entry(key.clone()) {
            Entry::Occupied(entry) => {
                #[cfg(feature = "tracing")]
                tracing::debug!(endpoint = %key, "Joining shared connection");

                let supervisor = Arc::clone(entry.get());
                supervisor.add_subscriber(subscriber);
                supervisor
            }
            Entry::Vacant(entry) => {
                #[cfg(feature = "tracing")]
                tracing::debug!(endpoint = %key, "Opening shared connection");

                let supervisor = Arc::new(ConnectionSupervisor::start(
                    Endpoint::Static(key.clone()),
                    factory,
                    config,
                    subscriber,
                ));
                entry.insert(Arc::clone(&supervisor));
                supervisor
            }
        };

        Membership {
            key,
            supervisor,
            subscriber: id,
        }
    }

    /// Detach a subscriber. The last one out closes the physical connection and removes the
    /// entry.
    pub(crate) fn leave(&self, membership: &Membership) {
        let mut registered = false;
        let removed = self.connections.remove_if(&membership.key, |_, supervisor| {
            if !Arc::ptr_eq(supervisor, &membership.supervisor) {
                return false;
            }
            registered = true;
            supervisor.remove_subscriber(membership.subscriber) == 0
        });

        let last = if removed.is_some() {
            true
        } else if registered {
            false
        } else {
            // The entry was already reset away; the supervisor is only ours to clean up.
            membership.supervisor.remove_subscriber(membership.subscriber) == 0
        };

        if last {
            #[cfg(feature = "tracing")]
            tracing::debug!(endpoint = %membership.key, "Last subscriber left, closing");
            membership.supervisor.stop();
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    #[must_use]
    pub fn contains<K: AsRef<str>>(&self, key: K) -> bool {
        self.connections.contains_key(&EndpointKey::new(key))
    }

    /// Number of subscribers attached to `key`, if it is registered.
    #[must_use]
    pub fn subscriber_count<K: AsRef<str>>(&self, key: K) -> Option<usize> {
        self.connections
            .get(&EndpointKey::new(key))
            .map(|entry| entry.value().subscriber_count())
    }

    /// State of the physical connection for `key`, if it is registered.
    #[must_use]
    pub fn state<K: AsRef<str>>(&self, key: K) -> Option<ReadyState> {
        self.connections
            .get(&EndpointKey::new(key))
            .map(|entry| entry.value().state())
    }

    /// Close every connection and forget them. Their subscribers end up `Closed` and can
    /// no longer reconnect.
    pub fn reset(&self) {
        let supervisors: Vec<_> = self
            .connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        self.connections.clear();

        for supervisor in supervisors {
            supervisor.stop();
        }
    }
}

impl std::fmt::Debug for SharedConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedConnectionRegistry")
            .field("connections", &self.connections.len())
            .finish()
    }
}
