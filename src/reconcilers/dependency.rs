use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    fmt,
    marker::PhantomData,
    sync::{Arc, Mutex, PoisonError, RwLock},
};

use futures::{Stream, StreamExt};
use k8s_openapi::{api::core::v1::Secret, NamespaceResourceScope};
use kube::{
    runtime::{reflector::ObjectRef, watcher},
    Resource, ResourceExt,
};
use serde::de::DeserializeOwned;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

use super::{
    finalizers::{guard_finalizer_name, has_finalizer, set_finalizer_patch},
    progress::{Outcome, ReconcileStatus, WaitingOn},
    store::OrcClient,
};
use crate::{resources::OrcObject, Result, ORC_API_GROUP};

/// Any namespaced object a dependency can point at
pub trait NamespacedObject:
    Resource<DynamicType = (), Scope = NamespaceResourceScope> + Clone + fmt::Debug + DeserializeOwned + Send + Sync + 'static
{
}

impl<T> NamespacedObject for T where
    T: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + fmt::Debug
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

/// A reference from every `K` to objects of kind `G`, by name in the same namespace
///
/// While any `K` references a `G`, the `G` carries a finalizer owned by the
/// deletion guard for the pair. The dependent controller watches `G` and is
/// retriggered when a referenced `G` becomes ready.
pub struct Dependency<K, G> {
    dependent: &'static str,
    guarded: &'static str,
    refs: fn(&K) -> Vec<String>,
    ready: fn(&G) -> bool,
    _kinds: PhantomData<fn() -> (K, G)>,
}

impl<K, G> Clone for Dependency<K, G> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K, G> Copy for Dependency<K, G> {}

impl<K, G> fmt::Debug for Dependency<K, G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dependency")
            .field("dependent", &self.dependent)
            .field("guarded", &self.guarded)
            .finish()
    }
}

impl<K, G> Dependency<K, G>
where
    K: NamespacedObject,
    G: NamespacedObject,
{
    /// `dependent` and `guarded` are the controller names of the two kinds,
    /// e.g. `subnet` and `network`.
    pub const fn new(
        dependent: &'static str,
        guarded: &'static str,
        refs: fn(&K) -> Vec<String>,
        ready: fn(&G) -> bool,
    ) -> Self {
        Self {
            dependent,
            guarded,
            refs,
            ready,
            _kinds: PhantomData,
        }
    }

    pub fn dependent(&self) -> &'static str {
        self.dependent
    }

    pub fn guarded(&self) -> &'static str {
        self.guarded
    }

    /// The finalizer placed on referenced objects
    pub fn finalizer(&self) -> String {
        guard_finalizer_name(self.dependent, self.guarded)
    }

    /// Name of the deletion guard controller for this pair
    pub fn guard_controller_name(&self) -> String {
        format!("{}_deletion_guard_for_{}", self.guarded, self.dependent)
    }

    /// Field owner of the guard finalizer, shared by the dependent controller and the guard
    pub fn field_owner(&self) -> String {
        format!("{ORC_API_GROUP}/{}/finalizer", self.guard_controller_name())
    }

    /// Names referenced by `object`, deduplicated and sorted
    pub fn refs(&self, object: &K) -> Vec<String> {
        (self.refs)(object)
            .into_iter()
            .filter(|name| !name.is_empty())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn references(&self, object: &K, name: &str) -> bool {
        (self.refs)(object).iter().any(|r| r == name)
    }

    /// A referenced object may be used when it satisfies the readiness
    /// predicate. Once it is being deleted it may only be used if it is
    /// already guarded, because the guard can no longer be added.
    pub fn is_ready(&self, guarded: &G) -> bool {
        let deleting = guarded.meta().deletion_timestamp.is_some();
        (self.ready)(guarded) && (!deleting || has_finalizer(guarded, &self.finalizer()))
    }

    /// Fetch one referenced object, waiting until it exists and is ready
    pub async fn get_dependency(&self, orc: &OrcClient, namespace: &str, name: &str) -> Outcome<G> {
        let kind = G::kind(&());
        match orc.get::<G>(namespace, name).await {
            Err(e) => Err(ReconcileStatus::new().with_error(e)),
            Ok(None) => Err(ReconcileStatus::new().waiting_on_object(kind, name, WaitingOn::Creation)),
            Ok(Some(object)) if !self.is_ready(&object) => {
                Err(ReconcileStatus::new().waiting_on_object(kind, name, WaitingOn::Ready))
            }
            Ok(Some(object)) => Ok(object),
        }
    }

    /// Fetch every object referenced by `object`
    ///
    /// Every unmet reference is reported, not only the first.
    pub async fn get_dependencies(&self, orc: &OrcClient, object: &K) -> Outcome<BTreeMap<String, G>> {
        let namespace = object.namespace().unwrap_or_default();
        let mut found = BTreeMap::new();
        let mut status = ReconcileStatus::new();
        for name in self.refs(object) {
            match self.get_dependency(orc, &namespace, &name).await {
                Ok(guarded) => {
                    found.insert(name, guarded);
                }
                Err(waiting) => status = status.merge(waiting),
            }
        }
        if status.is_complete() {
            Ok(found)
        } else {
            Err(status)
        }
    }

    /// Add the guard finalizer to `guarded` unless it is already present
    pub async fn ensure_guard(&self, orc: &OrcClient, guarded: &G) -> Result<()> {
        let finalizer = self.finalizer();
        if has_finalizer(guarded, &finalizer) {
            return Ok(());
        }
        let (namespace, name) = super::object_key(guarded)?;
        debug!(kind = %G::kind(&()), %namespace, %name, %finalizer, "adding deletion guard");
        orc.apply::<G>(
            &namespace,
            &name,
            set_finalizer_patch(guarded, self.field_owner(), &finalizer),
        )
        .await
    }

    /// Resolve every reference and guard each ready object before it is used
    pub async fn get_guarded_dependencies(&self, orc: &OrcClient, object: &K) -> Outcome<BTreeMap<String, G>> {
        let found = self.get_dependencies(orc, object).await?;
        for guarded in found.values() {
            self.ensure_guard(orc, guarded).await?;
        }
        Ok(found)
    }

    /// The objects of kind `G` referenced by `dependent`, for retriggering guards
    pub fn guarded_refs(&self, dependent: &K) -> Vec<ObjectRef<G>> {
        let namespace = dependent.namespace().unwrap_or_default();
        self.refs(dependent)
            .into_iter()
            .map(|name| ObjectRef::new(&name).within(&namespace))
            .collect()
    }
}

/// Namespace and name of a watched object
pub type ObjectKey = (String, String);

fn key_of<R: Resource>(object: &R) -> ObjectKey {
    (object.namespace().unwrap_or_default(), object.name_any())
}

/// Requests to reconcile the objects named by `keys`
pub fn object_refs<K: NamespacedObject>(keys: UnboundedReceiver<ObjectKey>) -> impl Stream<Item = ObjectRef<K>> {
    UnboundedReceiverStream::new(keys).map(|(namespace, name)| ObjectRef::new(&name).within(&namespace))
}

/// Lookup of the dependents referencing a guarded object
pub trait Referrers: Send + Sync {
    /// False until the dependent kind has been listed once
    fn is_synced(&self) -> bool;

    /// Names of the dependents in `namespace` referencing `name`
    fn referrers(&self, namespace: &str, name: &str) -> Vec<String>;
}

#[derive(Default)]
struct IndexState {
    synced: bool,
    /// Names referenced by each dependent
    targets: HashMap<ObjectKey, BTreeSet<String>>,
    /// Dependents referencing each target
    referrers: HashMap<ObjectKey, BTreeSet<String>>,
}

impl IndexState {
    fn link(&mut self, namespace: &str, dependent: &str, target: &str) {
        self.referrers
            .entry((namespace.to_string(), target.to_string()))
            .or_default()
            .insert(dependent.to_string());
    }

    fn unlink(&mut self, namespace: &str, dependent: &str, target: &str) {
        let key = (namespace.to_string(), target.to_string());
        if let Some(referrers) = self.referrers.get_mut(&key) {
            referrers.remove(dependent);
            if referrers.is_empty() {
                self.referrers.remove(&key);
            }
        }
    }
}

/// Reverse index of references from the dependent kind `K`, fed by its watch
///
/// Every change of the referrers of a target is sent to the registered
/// listeners, which is what retriggers the deletion guards.
pub struct ReferenceIndex<K> {
    refs: Box<dyn Fn(&K) -> Vec<String> + Send + Sync>,
    state: RwLock<IndexState>,
    listeners: Mutex<Vec<UnboundedSender<ObjectKey>>>,
}

impl<K: Resource> ReferenceIndex<K> {
    pub fn new<G>(dependency: Dependency<K, G>) -> Self
    where
        K: NamespacedObject,
        G: NamespacedObject,
    {
        Self {
            refs: Box::new(move |object| dependency.refs(object)),
            state: RwLock::default(),
            listeners: Mutex::default(),
        }
    }

    /// Send every target whose referrers change to `listener`
    pub fn notify(&self, listener: UnboundedSender<ObjectKey>) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Apply a watch event on `K`, returning the targets whose referrers changed
    pub fn apply(&self, event: &watcher::Event<K>) -> Vec<ObjectKey> {
        let mut changed = BTreeSet::new();
        {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            match event {
                watcher::Event::Applied(object) => self.update(&mut state, object, &mut changed),
                watcher::Event::Deleted(object) => self.remove(&mut state, &key_of(object), &mut changed),
                watcher::Event::Restarted(objects) => {
                    let listed: HashSet<ObjectKey> = objects.iter().map(key_of).collect();
                    let gone: Vec<ObjectKey> = state.targets.keys().filter(|k| !listed.contains(*k)).cloned().collect();
                    for key in gone {
                        self.remove(&mut state, &key, &mut changed);
                    }
                    for object in objects {
                        self.update(&mut state, object, &mut changed);
                    }
                    state.synced = true;
                }
            }
        }

        let changed: Vec<ObjectKey> = changed.into_iter().collect();
        if !changed.is_empty() {
            let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
            listeners.retain(|listener| changed.iter().all(|key| listener.send(key.clone()).is_ok()));
        }
        changed
    }

    fn update(&self, state: &mut IndexState, object: &K, changed: &mut BTreeSet<ObjectKey>) {
        let (namespace, name) = key_of(object);
        let wanted: BTreeSet<String> = (self.refs)(object).into_iter().collect();
        let previous = state
            .targets
            .insert((namespace.clone(), name.clone()), wanted.clone())
            .unwrap_or_default();
        for target in previous.difference(&wanted) {
            state.unlink(&namespace, &name, target);
            changed.insert((namespace.clone(), target.clone()));
        }
        for target in wanted.difference(&previous) {
            state.link(&namespace, &name, target);
            changed.insert((namespace.clone(), target.clone()));
        }
    }

    fn remove(&self, state: &mut IndexState, key: &ObjectKey, changed: &mut BTreeSet<ObjectKey>) {
        let (namespace, name) = key;
        for target in state.targets.remove(key).unwrap_or_default() {
            state.unlink(namespace, name, &target);
            changed.insert((namespace.clone(), target));
        }
    }
}

impl<K: Resource> Referrers for ReferenceIndex<K> {
    fn is_synced(&self) -> bool {
        self.state.read().unwrap_or_else(PoisonError::into_inner).synced
    }

    fn referrers(&self, namespace: &str, name: &str) -> Vec<String> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .referrers
            .get(&(namespace.to_string(), name.to_string()))
            .map(|names| names.iter().cloned().collect())
            .unwrap_or_default()
    }
}

/// Remembers the last seen readiness of watched objects, so only a transition to ready triggers
#[derive(Clone, Default)]
pub struct BecameReady {
    seen: Arc<Mutex<HashMap<ObjectKey, bool>>>,
}

impl BecameReady {
    /// Record the readiness of `object`, returning true when it was not ready before
    pub fn observe<G: Resource>(&self, object: &G, ready: bool) -> bool {
        let key = key_of(object);
        let mut seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);
        if object.meta().deletion_timestamp.is_some() {
            seen.remove(&key);
            return false;
        }
        let previous = seen.insert(key, ready);
        ready && previous != Some(true)
    }

    /// Forget objects which are gone
    pub fn prune<G: Resource>(&self, event: &watcher::Event<G>) {
        let mut seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);
        match event {
            watcher::Event::Applied(_) => {}
            watcher::Event::Deleted(object) => {
                seen.remove(&key_of(object));
            }
            watcher::Event::Restarted(objects) => {
                let listed: HashSet<ObjectKey> = objects.iter().map(key_of).collect();
                seen.retain(|key, _| listed.contains(key));
            }
        }
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.seen.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl<K, G> Dependency<K, G>
where
    K: NamespacedObject,
    G: NamespacedObject,
{
    /// Map a watch event on `G` to the dependents to reconcile, only when `G` became ready
    pub fn became_ready_dependents(
        &self,
        tracker: &BecameReady,
        index: &dyn Referrers,
        guarded: &G,
    ) -> Vec<ObjectRef<K>> {
        if !tracker.observe(guarded, (self.ready)(guarded)) {
            return Vec::new();
        }
        let namespace = guarded.namespace().unwrap_or_default();
        index
            .referrers(&namespace, &guarded.name_any())
            .into_iter()
            .map(|name| ObjectRef::new(&name).within(&namespace))
            .collect()
    }
}

/// Readiness of an orchestrator object referenced by another
pub fn is_available<G: OrcObject>(object: &G) -> bool {
    object.is_available()
}

/// The names of credential secrets referenced by `object`
pub fn credentials_refs<K: OrcObject>(object: &K) -> Vec<String> {
    vec![object.credentials_ref().secret_name.clone()]
}

fn secret_exists(_: &Secret) -> bool {
    true
}

/// The dependency of every kind on its credentials secret
pub fn credentials_dependency<K: OrcObject>(controller: &'static str) -> Dependency<K, Secret> {
    Dependency::new(controller, "secret", credentials_refs::<K>, secret_exists)
}
