//! Keeps referenced objects alive while anything still points at them
//!
//! One guard runs for every dependency declared by a controller. It owns a
//! single finalizer on the guarded object which is present exactly while a
//! dependent references it. Dependents are looked up in the reference index
//! the dependent controller maintains from its own watch, and every change
//! to the index retriggers the affected guarded objects.

use std::{sync::Arc, time::Duration};

use futures::StreamExt;
use kube::{
    runtime::{controller, controller::Action, watcher, Controller},
    Api, Client, ResourceExt,
};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, field, info, instrument, warn, Span};

use super::{
    dependency::{object_refs, Dependency, NamespacedObject, ObjectKey, Referrers},
    finalizers::{has_finalizer, remove_finalizer_patch, set_finalizer_patch},
    object_key,
    store::OrcClient,
};
use crate::{telemetry, Error, Metrics, Result};

/// How soon to look again while the dependent kind has not been listed yet
const UNSYNCED_RETRY: Duration = Duration::from_secs(1);

/// The finalizer one dependent kind holds on the objects it references
#[derive(Clone)]
pub struct Guard {
    name: String,
    finalizer: String,
    field_owner: String,
    referrers: Arc<dyn Referrers>,
}

impl Guard {
    pub fn new<K, G>(dependency: &Dependency<K, G>, referrers: Arc<dyn Referrers>) -> Self
    where
        K: NamespacedObject,
        G: NamespacedObject,
    {
        Self {
            name: dependency.guard_controller_name(),
            finalizer: dependency.finalizer(),
            field_owner: dependency.field_owner(),
            referrers,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn referrers(&self) -> &dyn Referrers {
        self.referrers.as_ref()
    }
}

struct GuardContext {
    orc: OrcClient,
    guard: Guard,
    metrics: Metrics,
}

/// Bring the guard finalizer on `guarded` in line with its current dependents
pub async fn reconcile_guard<G: NamespacedObject>(orc: &OrcClient, guard: &Guard, guarded: &G) -> Result<Action> {
    if !guard.referrers.is_synced() {
        debug!(guard = %guard.name, "dependents not listed yet");
        return Ok(Action::requeue(UNSYNCED_RETRY));
    }
    let (namespace, name) = object_key(guarded)?;
    let finalizer = &guard.finalizer;
    let guarded_now = has_finalizer(guarded, finalizer);
    let deleting = guarded.meta().deletion_timestamp.is_some();

    let dependents = guard.referrers.referrers(&namespace, &name);
    if dependents.is_empty() {
        if guarded_now {
            info!(%finalizer, "no remaining dependents, removing guard");
            orc.apply::<G>(
                &namespace,
                &name,
                remove_finalizer_patch(guarded, guard.field_owner.clone()),
            )
            .await?;
        }
        return Ok(Action::await_change());
    }

    if deleting {
        debug!(?dependents, "waiting for dependents before releasing");
        return Ok(Action::await_change());
    }
    if !guarded_now {
        info!(%finalizer, "adding guard");
        orc.apply::<G>(
            &namespace,
            &name,
            set_finalizer_patch(guarded, guard.field_owner.clone(), finalizer),
        )
        .await?;
    }
    Ok(Action::await_change())
}

#[instrument(skip(guarded, ctx), fields(trace_id, guard = %ctx.guard.name))]
async fn reconcile<G: NamespacedObject>(guarded: Arc<G>, ctx: Arc<GuardContext>) -> Result<Action> {
    let trace_id = telemetry::get_trace_id();
    Span::current().record("trace_id", &field::display(&trace_id));
    let _timer = ctx.metrics.count_and_measure(&ctx.guard.name);

    reconcile_guard(&ctx.orc, &ctx.guard, guarded.as_ref()).await
}

fn error_policy<G: NamespacedObject>(guarded: Arc<G>, error: &Error, ctx: Arc<GuardContext>) -> Action {
    warn!(name = %guarded.name_any(), %error, "deletion guard failed");
    ctx.metrics.reconcile_failure(&ctx.guard.name, guarded.as_ref(), error);
    Action::requeue(Duration::from_secs(5))
}

/// Run `guard` over every `G` until shutdown, retriggered by `changes`
pub async fn run<G: NamespacedObject>(
    client: Client,
    orc: OrcClient,
    metrics: Metrics,
    guard: Guard,
    changes: UnboundedReceiver<ObjectKey>,
    concurrency: u16,
) {
    let name = guard.name.clone();
    info!(guard = %name, "starting deletion guard");

    Controller::new(Api::<G>::all(client), watcher::Config::default().any_semantic())
        .reconcile_on(object_refs(changes))
        .with_config(controller::Config::default().concurrency(concurrency))
        .shutdown_on_signal()
        .run(reconcile, error_policy, Arc::new(GuardContext { orc, guard, metrics }))
        .filter_map(|x| async move { x.ok() })
        .for_each(|_| futures::future::ready(()))
        .await;
    info!(guard = %name, "deletion guard stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::runtime::reflector::ObjectRef;
    use crate::{
        reconcilers::{
            dependency::{is_available, ReferenceIndex},
            store::fake::FakeObjectStore,
            testing::{available_network, subnet},
        },
        resources::{Network, Subnet},
    };

    fn subnet_network_refs(subnet: &Subnet) -> Vec<String> {
        vec![subnet.spec.network_ref.clone()]
    }

    const SUBNET_NETWORK: Dependency<Subnet, Network> =
        Dependency::new("subnet", "network", subnet_network_refs, is_available);
    const GUARD: &str = "openstack.k-orc.cloud/subnet_guarding_network";

    fn setup() -> (Arc<FakeObjectStore>, OrcClient, Arc<ReferenceIndex<Subnet>>, Guard) {
        let store = Arc::new(FakeObjectStore::new());
        let orc = OrcClient::new(store.clone());
        let index = Arc::new(ReferenceIndex::new(SUBNET_NETWORK));
        let guard = Guard::new(&SUBNET_NETWORK, index.clone());
        (store, orc, index, guard)
    }

    #[tokio::test]
    async fn unsynced_guards_wait_for_the_dependent_listing() {
        let (store, orc, _index, guard) = setup();
        store.insert(&available_network("net-a", "n1"));
        let network = store.object::<Network>("default", "net-a").unwrap();

        let action = reconcile_guard(&orc, &guard, &network).await.unwrap();
        assert_eq!(action, Action::requeue(UNSYNCED_RETRY));
        assert!(store.applies().is_empty());
    }

    #[tokio::test]
    async fn unreferenced_objects_are_not_guarded() {
        let (store, orc, index, guard) = setup();
        store.insert(&available_network("net-a", "n1"));
        index.apply(&watcher::Event::Restarted(vec![subnet("subnet-a", "net-b")]));
        let network = store.object::<Network>("default", "net-a").unwrap();

        reconcile_guard(&orc, &guard, &network).await.unwrap();
        assert!(store.applies().is_empty());
    }

    #[tokio::test]
    async fn guard_follows_dependents() {
        let (store, orc, index, guard) = setup();
        store.insert(&available_network("net-a", "n1"));
        index.apply(&watcher::Event::Restarted(vec![subnet("subnet-a", "net-a")]));

        let network = store.object::<Network>("default", "net-a").unwrap();
        reconcile_guard(&orc, &guard, &network).await.unwrap();
        let network = store.object::<Network>("default", "net-a").unwrap();
        assert_eq!(network.finalizers(), [GUARD]);
        assert_eq!(
            store.applies()[0].patch.field_owner,
            "openstack.k-orc.cloud/network_deletion_guard_for_subnet/finalizer"
        );

        // already guarded
        reconcile_guard(&orc, &guard, &network).await.unwrap();
        assert_eq!(store.applies().len(), 1);

        index.apply(&watcher::Event::Deleted(subnet("subnet-a", "net-a")));
        reconcile_guard(&orc, &guard, &network).await.unwrap();
        let network = store.object::<Network>("default", "net-a").unwrap();
        assert!(network.finalizers().is_empty());
    }

    #[tokio::test]
    async fn deleting_objects_wait_for_dependents() {
        let (store, orc, index, guard) = setup();
        store.insert(&available_network("net-a", "n1"));
        index.apply(&watcher::Event::Restarted(vec![subnet("subnet-a", "net-a")]));
        let network = store.object::<Network>("default", "net-a").unwrap();
        reconcile_guard(&orc, &guard, &network).await.unwrap();

        store.delete_object::<Network>("default", "net-a");
        let network = store.object::<Network>("default", "net-a").unwrap();
        assert!(network.metadata.deletion_timestamp.is_some());
        let action = reconcile_guard(&orc, &guard, &network).await.unwrap();
        assert_eq!(action, Action::await_change());
        assert_eq!(
            store.object::<Network>("default", "net-a").unwrap().finalizers(),
            [GUARD]
        );

        index.apply(&watcher::Event::Deleted(subnet("subnet-a", "net-a")));
        reconcile_guard(&orc, &guard, &network).await.unwrap();
        assert!(store.object::<Network>("default", "net-a").is_none());
    }

    #[tokio::test]
    async fn index_changes_retrigger_the_referenced_objects() {
        let index = ReferenceIndex::new(SUBNET_NETWORK);
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        index.notify(tx);
        index.apply(&watcher::Event::Applied(subnet("subnet-a", "net-a")));
        drop(index);

        let triggered: Vec<kube::runtime::reflector::ObjectRef<Network>> = object_refs(rx).collect().await;
        assert_eq!(triggered, vec![ObjectRef::new("net-a").within("default")]);
    }
}
