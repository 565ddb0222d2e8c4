//! Observer registration, ownership, and broadcast bookkeeping.
//!
//! The cyclic observer ↔ resource reference problem is broken by strict
//! ownership, realized as two holds: a *self-owned* observer is held weakly
//! (the caller's `Arc` keeps it alive), an *owner-owned* observer is held
//! strongly until its owner is dropped. One observer object registered both
//! ways gets the union of the two.

use std::{
    any::Any,
    sync::{Arc, Weak},
};

use tracing::debug;

use super::Resource;

/// Events broadcast on every observable state transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceEvent {
    /// First event an observer receives, delivered only to it. Pre-existing
    /// data or errors are *not* replayed; inspect the resource directly.
    ObserverAdded,
    /// A load-class request started.
    Requested,
    /// `latest_data` changed.
    NewData(NewDataSource),
    /// A 304 confirmed the current data; only its timestamp moved.
    NotModified,
    /// An in-flight load was cancelled.
    RequestCancelled,
    /// `latest_error` changed; prior data is preserved.
    Error,
}

/// Where fresh data came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NewDataSource {
    Network,
    Cache,
    LocalOverride,
    Wipe,
}

/// Receives notifications about one resource's state transitions.
pub trait ResourceObserver: Send + Sync + 'static {
    fn resource_changed(&self, resource: &Resource, event: &ResourceEvent);

    /// Called once when this observer is removed, unless it was dropped
    /// before the notification could be delivered.
    fn stopped_observing(&self, _resource: &Resource) {}
}

struct ClosureObserver<F>(F);

impl<F> ResourceObserver for ClosureObserver<F>
where
    F: Fn(&Resource, &ResourceEvent) + Send + Sync + 'static,
{
    fn resource_changed(&self, resource: &Resource, event: &ResourceEvent) {
        (self.0)(resource, event);
    }
}

enum ObserverHold {
    Strong(Arc<dyn ResourceObserver>),
    Weak(Weak<dyn ResourceObserver>),
}

pub(crate) struct ObserverEntry {
    ident: usize,
    hold: ObserverHold,
    self_owned: bool,
    owners: Vec<Weak<dyn Any + Send + Sync>>,
}

impl ObserverEntry {
    pub(crate) fn observer(&self) -> Option<Arc<dyn ResourceObserver>> {
        match &self.hold {
            ObserverHold::Strong(observer) => Some(observer.clone()),
            ObserverHold::Weak(observer) => observer.upgrade(),
        }
    }

    /// Drop dead owners and normalize the hold.
    ///
    /// A dead entry yields the observer for its `stopped_observing`
    /// farewell when it can still be reached.
    fn prune(&mut self) -> Pruned {
        self.owners.retain(|owner| owner.strong_count() > 0);
        if !self.owners.is_empty() {
            return match &self.hold {
                ObserverHold::Strong(_) => Pruned::Alive,
                ObserverHold::Weak(observer) => match observer.upgrade() {
                    Some(observer) => {
                        self.hold = ObserverHold::Strong(observer);
                        Pruned::Alive
                    }
                    None => Pruned::Dead(None),
                },
            };
        }
        if self.self_owned {
            match &self.hold {
                ObserverHold::Strong(observer) => {
                    let observer = observer.clone();
                    // hold + local clone account for two refs; more means
                    // someone outside this resource still owns it
                    if Arc::strong_count(&observer) > 2 {
                        self.hold = ObserverHold::Weak(Arc::downgrade(&observer));
                        Pruned::Alive
                    } else {
                        Pruned::Dead(Some(observer))
                    }
                }
                ObserverHold::Weak(observer) => match observer.upgrade() {
                    Some(_) => Pruned::Alive,
                    None => Pruned::Dead(None),
                },
            }
        } else {
            Pruned::Dead(self.observer())
        }
    }
}

enum Pruned {
    Alive,
    Dead(Option<Arc<dyn ResourceObserver>>),
}

fn ident_of(observer: &Arc<dyn ResourceObserver>) -> usize {
    Arc::as_ptr(observer) as *const () as usize
}

enum Ownership {
    SelfOwned,
    Owner(Weak<dyn Any + Send + Sync>),
}

impl Resource {
    /// Register a self-owned observer: the resource holds it weakly, and it
    /// observes for as long as the caller keeps the `Arc` alive.
    ///
    /// Identity-based dedup: registering the same observer object again is
    /// a no-op beyond unioning ownership.
    pub fn add_observer(&self, observer: Arc<dyn ResourceObserver>) {
        self.insert_observer(observer, Ownership::SelfOwned);
    }

    /// Register an observer kept alive by `owner`: the resource holds the
    /// observer strongly until every owner is dropped or removed.
    pub fn add_observer_owned_by<O: Any + Send + Sync>(
        &self,
        observer: Arc<dyn ResourceObserver>,
        owner: &Arc<O>,
    ) {
        let owner: Arc<dyn Any + Send + Sync> = owner.clone();
        self.insert_observer(observer, Ownership::Owner(Arc::downgrade(&owner)));
    }

    /// Observe with a closure, tied to `owner`'s lifetime.
    pub fn observe<O: Any + Send + Sync>(
        &self,
        owner: &Arc<O>,
        observer: impl Fn(&Resource, &ResourceEvent) + Send + Sync + 'static,
    ) {
        self.add_observer_owned_by(Arc::new(ClosureObserver(observer)), owner);
    }

    fn insert_observer(&self, observer: Arc<dyn ResourceObserver>, ownership: Ownership) {
        let ident = ident_of(&observer);
        let added = {
            let mut state = self.inner.state.lock();
            match state.observers.iter_mut().find(|e| e.ident == ident) {
                Some(entry) => {
                    match ownership {
                        Ownership::SelfOwned => entry.self_owned = true,
                        Ownership::Owner(owner) => {
                            entry.owners.push(owner);
                            if let ObserverHold::Weak(_) = entry.hold {
                                entry.hold = ObserverHold::Strong(observer.clone());
                            }
                        }
                    }
                    false
                }
                None => {
                    let (hold, self_owned, owners) = match ownership {
                        Ownership::SelfOwned => {
                            (ObserverHold::Weak(Arc::downgrade(&observer)), true, Vec::new())
                        }
                        Ownership::Owner(owner) => {
                            (ObserverHold::Strong(observer.clone()), false, vec![owner])
                        }
                    };
                    state.observers.push(ObserverEntry {
                        ident,
                        hold,
                        self_owned,
                        owners,
                    });
                    true
                }
            }
        };
        if added {
            debug!(target: "lodestone::observers", url = %self.url(), "observer added");
            self.service().retain_observed(self);
            self.ensure_cache_checked();
            let resource = self.clone();
            self.sequencer().post(move || {
                observer.resource_changed(&resource, &ResourceEvent::ObserverAdded);
            });
        }
    }

    /// Remove every observer owned by `owner`. Observers whose last owner
    /// this was receive `stopped_observing`.
    pub fn remove_observers_owned_by<O: Any + Send + Sync>(&self, owner: &Arc<O>) {
        let owner_ident = Arc::as_ptr(owner) as *const () as usize;
        self.retain_observers(|entry| {
            entry
                .owners
                .retain(|o| o.as_ptr() as *const () as usize != owner_ident);
        });
    }

    /// Remove a self-owned observer registration.
    pub fn remove_observer(&self, observer: &Arc<dyn ResourceObserver>) {
        let ident = ident_of(observer);
        self.retain_observers(|entry| {
            if entry.ident == ident {
                entry.self_owned = false;
            }
        });
    }

    fn retain_observers(&self, adjust: impl Fn(&mut ObserverEntry)) {
        let (removed, now_unobserved) = self.prune_observers(adjust);
        if now_unobserved {
            self.service().release_observed(self);
        }
        self.post_farewells(removed);
    }

    fn prune_observers(
        &self,
        adjust: impl Fn(&mut ObserverEntry),
    ) -> (Vec<Arc<dyn ResourceObserver>>, bool) {
        let mut state = self.inner.state.lock();
        let mut removed = Vec::new();
        state.observers.retain_mut(|entry| {
            adjust(entry);
            match entry.prune() {
                Pruned::Alive => true,
                Pruned::Dead(farewell) => {
                    removed.extend(farewell);
                    false
                }
            }
        });
        (removed, state.observers.is_empty())
    }

    fn post_farewells(&self, removed: Vec<Arc<dyn ResourceObserver>>) {
        if removed.is_empty() {
            return;
        }
        debug!(
            target: "lodestone::observers",
            url = %self.url(),
            count = removed.len(),
            "observers removed"
        );
        let resource = self.clone();
        self.sequencer().post(move || {
            for observer in removed {
                observer.stopped_observing(&resource);
            }
        });
    }

    /// Snapshot live observers at a transition and post one delivery batch.
    ///
    /// Doubles as the cleanup tick: entries whose owners were dropped are
    /// detected here, removed before delivery, and sent their farewell.
    pub(crate) fn broadcast(&self, event: ResourceEvent) {
        let (removed, now_unobserved) = self.prune_observers(|_| {});
        if now_unobserved {
            self.service().release_observed(self);
        }
        self.post_farewells(removed);
        let recipients: Vec<Arc<dyn ResourceObserver>> = {
            let state = self.inner.state.lock();
            state.observers.iter().filter_map(|e| e.observer()).collect()
        };
        debug!(target: "lodestone::state", url = %self.url(), ?event, "state transition");
        if recipients.is_empty() {
            return;
        }
        let resource = self.clone();
        self.sequencer().post(move || {
            for observer in &recipients {
                observer.resource_changed(&resource, &event);
            }
        });
    }
}
