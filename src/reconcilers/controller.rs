use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use chrono::Utc;
use futures::{future::BoxFuture, FutureExt, StreamExt, TryStreamExt};
use kube::{
    runtime::{
        controller,
        controller::Action,
        reflector,
        reflector::Store,
        watcher, Controller, WatchStreamExt,
    },
    Api, Client, Resource, ResourceExt,
};
use rand::Rng;
use tokio::sync::mpsc;
use tracing::{debug, field, info, instrument, warn, Span};

use super::{
    actuator::{reconcile_delete, reconcile_normal, ActuatorFactory, Reconciled},
    deletion_guard::{self, Guard},
    dependency::{credentials_dependency, object_refs, BecameReady, Dependency, NamespacedObject, ReferenceIndex},
    object_key,
    status::write_status,
    store::ObjectEvent,
    Context,
};
use crate::{
    resources::{OrcObject, CONDITION_PROGRESSING},
    telemetry, Error, Result,
};

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(300);

/// Per-object exponential backoff with jitter for failed reconciles
#[derive(Default)]
pub struct Backoff {
    failures: Mutex<HashMap<(String, String), u32>>,
}

impl Backoff {
    /// Record a failure of the object, returning how long to wait before retrying
    pub fn next(&self, namespace: &str, name: &str) -> Duration {
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        let count = failures.entry((namespace.to_string(), name.to_string())).or_default();
        let delay = BACKOFF_BASE
            .saturating_mul(2u32.saturating_pow(*count))
            .min(BACKOFF_MAX);
        *count = count.saturating_add(1);
        delay.mul_f64(rand::thread_rng().gen_range(0.9..=1.1))
    }

    pub fn reset(&self, namespace: &str, name: &str) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(namespace.to_string(), name.to_string()));
    }

    /// Forget objects which are gone
    pub fn prune<K: Resource>(&self, event: &watcher::Event<K>) {
        match event {
            watcher::Event::Applied(_) => {}
            watcher::Event::Deleted(object) => {
                self.reset(&object.namespace().unwrap_or_default(), &object.name_any());
            }
            watcher::Event::Restarted(objects) => {
                let listed: HashSet<(String, String)> = objects
                    .iter()
                    .map(|o| (o.namespace().unwrap_or_default(), o.name_any()))
                    .collect();
                self.failures
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .retain(|key, _| listed.contains(key));
            }
        }
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.failures.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Context of one kind's controller
pub struct ControllerContext<F> {
    pub shared: Context,
    pub factory: F,
    backoff: Arc<Backoff>,
}

/// Whether a live object needs reconciling
///
/// An object which finished progressing at its current generation is left
/// alone until its spec changes, whatever triggered the event.
fn should_reconcile<K: OrcObject>(object: &K) -> bool {
    match object.condition(CONDITION_PROGRESSING) {
        Some(progressing) => {
            progressing.status != "False" || progressing.observed_generation != object.meta().generation
        }
        None => true,
    }
}

/// Publish a warning the first time a terminal error is reported
async fn report_terminal<K: OrcObject>(ctx: &Context, object: &K, error: &Error) {
    let reason = error.reason().to_string();
    let message = error.to_string();
    let already_reported = object
        .condition(CONDITION_PROGRESSING)
        .is_some_and(|c| c.reason == reason && c.message == message);
    if !already_reported {
        warn!(%reason, %message, "reconcile failed terminally");
        ctx.orc
            .publish(object, ObjectEvent::warning(reason, "Reconcile", message))
            .await;
    }
}

/// Reconcile the object named by `namespace` and `name`
///
/// Reads the latest version, runs the normal or delete flow, and writes the
/// resulting status before collapsing it into an [`Action`].
pub async fn reconcile_object<K, F>(ctx: &Context, factory: &F, namespace: &str, name: &str) -> Result<Action>
where
    K: OrcObject,
    F: ActuatorFactory<K>,
{
    let Some(object) = ctx.orc.get::<K>(namespace, name).await? else {
        debug!("object no longer exists");
        return Ok(Action::await_change());
    };

    let deleting = object.meta().deletion_timestamp.is_some();
    if !deleting && !should_reconcile(&object) {
        debug!("object is up to date");
        return Ok(Action::await_change());
    }

    let Reconciled {
        mut status,
        resource,
        available,
        write_status: write,
    } = if deleting {
        reconcile_delete(ctx, factory, &object).await
    } else {
        reconcile_normal(ctx, factory, &object).await
    };

    if write {
        let written = write_status(
            &ctx.orc,
            F::CONTROLLER_NAME,
            &object,
            &status,
            resource.as_ref(),
            available,
        )
        .await;
        match written {
            Ok(()) => {}
            // released during this reconcile and already collected
            Err(e) if deleting && e.is_not_found() => {}
            Err(e) => status = status.with_error(e),
        }
    }

    if let Some(error) = status.terminal_error() {
        report_terminal(ctx, &object, error).await;
    }
    debug!(progress = ?status.messages(), errors = status.errors().len(), "reconciled");
    status.into_action()
}

#[instrument(skip(object, ctx), fields(trace_id, controller = F::CONTROLLER_NAME, name = %object.name_any()))]
async fn reconcile<K, F>(object: Arc<K>, ctx: Arc<ControllerContext<F>>) -> Result<Action>
where
    K: OrcObject,
    F: ActuatorFactory<K>,
{
    let trace_id = telemetry::get_trace_id();
    Span::current().record("trace_id", &field::display(&trace_id));
    let _timer = ctx.shared.metrics.count_and_measure(F::CONTROLLER_NAME);
    ctx.shared.diagnostics.write().await.last_event = Utc::now();

    let (namespace, name) = object_key(object.as_ref())?;
    let action = reconcile_object::<K, F>(&ctx.shared, &ctx.factory, &namespace, &name).await?;
    ctx.backoff.reset(&namespace, &name);
    Ok(action)
}

fn error_policy<K, F>(object: Arc<K>, error: &Error, ctx: Arc<ControllerContext<F>>) -> Action
where
    K: OrcObject,
    F: ActuatorFactory<K>,
{
    ctx.shared
        .metrics
        .reconcile_failure(F::CONTROLLER_NAME, object.as_ref(), error);
    let delay = ctx
        .backoff
        .next(&object.namespace().unwrap_or_default(), &object.name_any());
    warn!(
        controller = F::CONTROLLER_NAME,
        name = %object.name_any(),
        %error,
        retry_in = ?delay,
        "reconcile failed"
    );
    Action::requeue(delay)
}

type Wiring<K> = Box<dyn FnOnce(Controller<K>) -> Controller<K> + Send>;
type Observer<K> = Box<dyn Fn(&watcher::Event<K>) + Send + Sync>;

/// Wires one kind's controller to the watches and deletion guards its dependencies need
///
/// The controller is built when it runs, over a watch of `K` whose events
/// also feed the reference indexes of every declared dependency.
pub struct ControllerBuilder<K>
where
    K: OrcObject,
{
    client: Client,
    shared: Context,
    name: &'static str,
    concurrency: u16,
    reader: Store<K>,
    writer: reflector::store::Writer<K>,
    observers: Vec<Observer<K>>,
    wiring: Vec<Wiring<K>>,
    guards: Vec<BoxFuture<'static, ()>>,
}

impl<K> ControllerBuilder<K>
where
    K: OrcObject,
{
    pub fn new(client: Client, shared: Context, name: &'static str, concurrency: u16) -> Self {
        let (reader, writer) = reflector::store();
        Self {
            client,
            shared,
            name,
            concurrency,
            reader,
            writer,
            observers: Vec::new(),
            wiring: Vec::new(),
            guards: Vec::new(),
        }
    }

    /// Index the references of every `K` along `dependency`
    fn index<G>(&mut self, dependency: Dependency<K, G>) -> Arc<ReferenceIndex<K>>
    where
        G: NamespacedObject,
    {
        let index = Arc::new(ReferenceIndex::new(dependency));
        let observed = index.clone();
        self.observers.push(Box::new(move |event| {
            observed.apply(event);
        }));
        index
    }

    fn follow<G>(&mut self, dependency: Dependency<K, G>) -> Arc<ReferenceIndex<K>>
    where
        G: NamespacedObject,
    {
        let index = self.index(dependency);
        let referrers = index.clone();
        let client = self.client.clone();
        self.wiring.push(Box::new(move |controller| {
            let tracker = BecameReady::default();
            let pruned = tracker.clone();
            let trigger = watcher(Api::<G>::all(client), watcher::Config::default().any_semantic())
                .default_backoff()
                .inspect_ok(move |event| pruned.prune(event))
                .touched_objects();
            controller.watches_stream(trigger, move |guarded| {
                dependency.became_ready_dependents(&tracker, referrers.as_ref(), &guarded)
            })
        }));
        index
    }

    /// Reconcile dependents when a referenced object becomes ready
    pub fn follows<G>(mut self, dependency: Dependency<K, G>) -> Self
    where
        G: NamespacedObject,
    {
        self.follow(dependency);
        self
    }

    /// Follow a dependency and guard referenced objects against deletion
    pub fn depends_on<G>(mut self, dependency: Dependency<K, G>) -> Self
    where
        G: NamespacedObject,
    {
        let index = self.follow(dependency);
        let (changes, changed) = mpsc::unbounded_channel();
        index.notify(changes);
        self.guards.push(
            deletion_guard::run::<G>(
                self.client.clone(),
                self.shared.orc.clone(),
                self.shared.metrics.clone(),
                Guard::new(&dependency, index),
                changed,
                self.concurrency,
            )
            .boxed(),
        );
        self
    }

    /// Reconcile the owner when an object it created changes
    pub fn owns<C>(mut self) -> Self
    where
        C: NamespacedObject,
    {
        let client = self.client.clone();
        self.wiring.push(Box::new(move |controller| {
            controller.owns(Api::<C>::all(client), watcher::Config::default().any_semantic())
        }));
        self
    }

    /// Register with the operator's credentials guard, which guards the
    /// referenced secrets and retriggers objects when their secret appears
    pub fn credentials(mut self) -> Self {
        let dependency = credentials_dependency::<K>(self.name);
        let index = self.index(dependency);
        let (retrigger, retriggered) = mpsc::unbounded_channel();
        self.shared.credentials.register(&dependency, index, retrigger);
        self.wiring.push(Box::new(move |controller| {
            controller.reconcile_on(object_refs(retriggered))
        }));
        self
    }

    /// Run the controller and its deletion guards until shutdown
    pub async fn run<F>(self, factory: F)
    where
        F: ActuatorFactory<K>,
    {
        info!(controller = self.name, guards = self.guards.len(), "starting controller");
        let backoff = Arc::new(Backoff::default());
        let pruned = backoff.clone();
        let observers = self.observers;
        let objects = reflector(
            self.writer,
            watcher(Api::<K>::all(self.client), watcher::Config::default().any_semantic()),
        )
        .default_backoff()
        .inspect_ok(move |event| {
            pruned.prune(event);
            for observe in &observers {
                observe(event);
            }
        })
        .applied_objects();

        let controller = self
            .wiring
            .into_iter()
            .fold(Controller::for_stream(objects, self.reader), |controller, wire| wire(controller));
        let ctx = Arc::new(ControllerContext {
            shared: self.shared,
            factory,
            backoff,
        });
        let controller = controller
            .with_config(controller::Config::default().concurrency(self.concurrency))
            .shutdown_on_signal()
            .run(reconcile::<K, F>, error_policy::<K, F>, ctx)
            .for_each(|result| async move {
                if let Err(e) = result {
                    debug!(error = %e, "reconcile loop error");
                }
            });
        futures::future::join(controller, futures::future::join_all(self.guards)).await;
        info!(controller = self.name, "controller stopped");
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{
        osclients,
        reconcilers::{
            deletion_guard::reconcile_guard,
            finalizers::guard_finalizer_name,
            testing::{network, subnet, FakeNetworkFactory, FakeSubnetFactory, TestContext, SUBNET_NETWORK},
        },
        resources::{
            ManagedOptions, ManagementPolicy, Network, NetworkFilter, OnDelete, ResourceImport, Subnet,
            CONDITION_AVAILABLE,
        },
    };

    const NETWORK_FINALIZER: &str = "openstack.k-orc.cloud/network";

    async fn reconcile_network(test: &TestContext, name: &str) -> Result<Action> {
        reconcile_object::<Network, _>(&test.ctx, &FakeNetworkFactory::new(&test.cloud), "default", name).await
    }

    async fn reconcile_subnet(test: &TestContext, name: &str) -> Result<Action> {
        reconcile_object::<Subnet, _>(&test.ctx, &FakeSubnetFactory::new(&test.cloud), "default", name).await
    }

    fn condition<'a>(object: &'a impl OrcObject, type_: &str) -> (&'a str, &'a str, &'a str) {
        let c = object.condition(type_).expect("condition is set");
        (c.status.as_str(), c.reason.as_str(), c.message.as_str())
    }

    #[test]
    fn backoff_grows_and_resets() {
        let backoff = Backoff::default();
        let first = backoff.next("default", "net-a");
        let second = backoff.next("default", "net-a");
        assert!(first >= Duration::from_millis(900) && first <= Duration::from_millis(1100));
        assert!(second >= Duration::from_millis(1800) && second <= Duration::from_millis(2200));
        for _ in 0..20 {
            backoff.next("default", "net-a");
        }
        assert!(backoff.next("default", "net-a") <= BACKOFF_MAX.mul_f64(1.1));

        backoff.reset("default", "net-a");
        assert!(backoff.next("default", "net-a") <= Duration::from_millis(1100));
    }

    #[test]
    fn backoff_forgets_vanished_objects() {
        let backoff = Backoff::default();
        backoff.next("default", "net-a");
        backoff.next("default", "net-b");
        backoff.next("default", "net-c");

        backoff.prune(&watcher::Event::Deleted(network("net-a", "n1")));
        assert_eq!(backoff.tracked(), 2);

        backoff.prune(&watcher::Event::Restarted(vec![network("net-b", "n1")]));
        assert_eq!(backoff.tracked(), 1);
        backoff.prune(&watcher::Event::Applied(network("net-b", "n1")));
        assert_eq!(backoff.tracked(), 1);
    }

    #[tokio::test]
    async fn create_network() {
        let test = TestContext::new();
        let mut object = network("net-a", "n1");
        object.spec.resource.as_mut().unwrap().tags = vec!["t".into()];
        test.store.insert(&object);

        let action = reconcile_network(&test, "net-a").await.unwrap();
        assert_eq!(action, Action::await_change());

        let network: Network = test.store.object("default", "net-a").unwrap();
        let status = network.status.as_ref().unwrap();
        let id = status.id.clone().unwrap();
        assert_eq!(test.cloud.resource(&id).unwrap().name, "n1");
        assert_eq!(status.resource.as_ref().unwrap().tags, vec!["t"]);
        assert_eq!(network.finalizers(), [NETWORK_FINALIZER]);
        assert_eq!(
            condition(&network, CONDITION_AVAILABLE),
            ("True", "Success", "OpenStack resource is available")
        );
        assert_eq!(
            condition(&network, CONDITION_PROGRESSING),
            ("False", "Success", "OpenStack resource is up to date")
        );
        for c in network.conditions() {
            assert_eq!(c.observed_generation, Some(1));
        }

        let events = test.store.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].2.reason, "Created");
    }

    #[tokio::test]
    async fn tags_are_reconciled_after_creation() {
        let test = TestContext::new();
        test.store.insert(&network("net-a", "n1"));
        reconcile_network(&test, "net-a").await.unwrap();

        test.store.edit::<Network>("default", "net-a", |spec| {
            spec["resource"]["tags"] = json!(["b", "a", "b"]);
        });
        let action = reconcile_network(&test, "net-a").await.unwrap();
        assert_eq!(action, Action::requeue(Duration::ZERO));

        let network: Network = test.store.object("default", "net-a").unwrap();
        let id = network.status_id().unwrap();
        assert_eq!(test.cloud.resource(id).unwrap().tags, vec!["a", "b"]);
        assert_eq!(
            condition(&network, CONDITION_PROGRESSING),
            ("True", "Progressing", "resource status will be refreshed")
        );

        reconcile_network(&test, "net-a").await.unwrap();
        let network: Network = test.store.object("default", "net-a").unwrap();
        assert_eq!(network.status.unwrap().resource.unwrap().tags, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn subnet_waits_for_its_network() {
        let test = TestContext::new();
        test.store.insert(&subnet("subnet-a", "net-b"));

        let action = reconcile_subnet(&test, "subnet-a").await.unwrap();
        assert_eq!(action, Action::await_change());

        let subnet: Subnet = test.store.object("default", "subnet-a").unwrap();
        assert_eq!(
            condition(&subnet, CONDITION_PROGRESSING),
            ("True", "Progressing", "waiting for Network/net-b to exist")
        );
        assert_eq!(condition(&subnet, CONDITION_AVAILABLE).1, "DependencyNotReady");
        assert!(subnet.finalizers().is_empty());
        assert!(test.cloud.calls().is_empty());
    }

    #[tokio::test]
    async fn subnet_is_created_once_its_network_is_available() {
        let test = TestContext::new();
        test.store.insert(&network("net-b", "n1"));
        test.store.insert(&subnet("subnet-a", "net-b"));

        reconcile_subnet(&test, "subnet-a").await.unwrap();
        let waiting: Subnet = test.store.object("default", "subnet-a").unwrap();
        assert_eq!(
            condition(&waiting, CONDITION_PROGRESSING).2,
            "waiting for Network/net-b to be available"
        );

        reconcile_network(&test, "net-b").await.unwrap();
        reconcile_subnet(&test, "subnet-a").await.unwrap();

        let subnet: Subnet = test.store.object("default", "subnet-a").unwrap();
        assert!(subnet.status_id().is_some());
        assert_eq!(condition(&subnet, CONDITION_AVAILABLE).0, "True");
        let network: Network = test.store.object("default", "net-b").unwrap();
        assert!(network
            .finalizers()
            .contains(&guard_finalizer_name("subnet", "network")));
        let network_id = network.status_id().unwrap();
        assert_eq!(
            test.cloud.resource(subnet.status_id().unwrap()).unwrap().parent.as_deref(),
            Some(network_id)
        );
    }

    #[tokio::test]
    async fn crashed_creates_are_adopted() {
        let test = TestContext::new();
        let existing = test.cloud.add("network", "n1");
        test.store.insert(&network("net-a", "n1"));

        reconcile_network(&test, "net-a").await.unwrap();

        let network: Network = test.store.object("default", "net-a").unwrap();
        assert_eq!(network.status_id(), Some(existing.as_str()));
        assert!(!test.cloud.calls().iter().any(|c| c.starts_with("create")));
        assert_eq!(test.store.events()[0].2.reason, "Adopted");
    }

    #[tokio::test]
    async fn duplicate_adoption_candidates_are_unrecoverable() {
        let test = TestContext::new();
        test.cloud.add("network", "n1");
        test.cloud.add("network", "n1");
        test.store.insert(&network("net-a", "n1"));

        let action = reconcile_network(&test, "net-a").await.unwrap();
        assert_eq!(action, Action::await_change());
        let network: Network = test.store.object("default", "net-a").unwrap();
        assert_eq!(condition(&network, CONDITION_PROGRESSING).1, "UnrecoverableError");
        assert!(network.status_id().is_none());
    }

    #[tokio::test]
    async fn ambiguous_import_filter_is_invalid() {
        let test = TestContext::new();
        test.cloud.add("network", "n");
        test.cloud.add("network", "n");
        let mut object = network("net-a", "n");
        object.spec.resource = None;
        object.spec.import = Some(ResourceImport {
            id: None,
            filter: Some(NetworkFilter {
                name: Some("n".into()),
                ..Default::default()
            }),
        });
        test.store.insert(&object);

        let action = reconcile_network(&test, "net-a").await.unwrap();
        assert_eq!(action, Action::await_change());

        let network: Network = test.store.object("default", "net-a").unwrap();
        assert_eq!(
            condition(&network, CONDITION_PROGRESSING),
            (
                "False",
                "InvalidConfiguration",
                "expected 1 matching OpenStack resource to import, found 2"
            )
        );
        assert!(network.status_id().is_none());

        let events = test.store.events();
        assert_eq!(events.len(), 1);
        assert!(events[0].2.warning);
        assert_eq!(events[0].2.reason, "InvalidConfiguration");

        // unchanged objects are not retried, nor reported twice
        reconcile_network(&test, "net-a").await.unwrap();
        assert_eq!(test.store.events().len(), 1);
    }

    #[tokio::test]
    async fn import_filter_waits_for_a_match() {
        let test = TestContext::new();
        let mut object = network("net-a", "n");
        object.spec.resource = None;
        object.spec.management_policy = ManagementPolicy::Unmanaged;
        object.spec.import = Some(ResourceImport {
            id: None,
            filter: Some(NetworkFilter {
                name: Some("n".into()),
                ..Default::default()
            }),
        });
        test.store.insert(&object);

        let action = reconcile_network(&test, "net-a").await.unwrap();
        assert_eq!(action, Action::requeue(Duration::from_secs(15)));
        let network: Network = test.store.object("default", "net-a").unwrap();
        assert_eq!(
            condition(&network, CONDITION_PROGRESSING).2,
            "waiting for OpenStack resource to be created externally"
        );

        let id = test.cloud.add("network", "n");
        reconcile_network(&test, "net-a").await.unwrap();
        let network: Network = test.store.object("default", "net-a").unwrap();
        assert_eq!(network.status_id(), Some(id.as_str()));
        assert_eq!(condition(&network, CONDITION_AVAILABLE).0, "True");
        // imported resources are not modified
        assert!(!test.cloud.calls().iter().any(|c| c.starts_with("tags")));
    }

    #[tokio::test]
    async fn vanished_resources_are_unrecoverable() {
        let test = TestContext::new();
        test.store.insert(&network("net-a", "n1"));
        reconcile_network(&test, "net-a").await.unwrap();
        let network: Network = test.store.object("default", "net-a").unwrap();
        test.cloud.remove(network.status_id().unwrap());

        test.store.edit::<Network>("default", "net-a", |spec| {
            spec["resource"]["description"] = json!("changed");
        });
        reconcile_network(&test, "net-a").await.unwrap();
        let network: Network = test.store.object("default", "net-a").unwrap();
        assert_eq!(
            condition(&network, CONDITION_PROGRESSING),
            ("False", "UnrecoverableError", "resource has been deleted from OpenStack")
        );
    }

    #[tokio::test]
    async fn rejected_creates_wait_for_a_spec_change() {
        let test = TestContext::new();
        test.store.insert(&network("net-a", "n1"));
        test.cloud.fail_next_create(osclients::Error::Http {
            status: http::StatusCode::BAD_REQUEST,
            message: "Invalid input for mtu".into(),
        });

        let action = reconcile_network(&test, "net-a").await.unwrap();
        assert_eq!(action, Action::await_change());
        let network: Network = test.store.object("default", "net-a").unwrap();
        assert_eq!(
            condition(&network, CONDITION_PROGRESSING),
            ("False", "InvalidConfiguration", "Invalid input for mtu")
        );
        for c in network.conditions() {
            assert_eq!(c.observed_generation, Some(1));
        }

        test.store.edit::<Network>("default", "net-a", |spec| {
            spec["resource"]["mtu"] = json!(1400);
        });
        reconcile_network(&test, "net-a").await.unwrap();
        let network: Network = test.store.object("default", "net-a").unwrap();
        assert_eq!(condition(&network, CONDITION_PROGRESSING).1, "Success");
        for c in network.conditions() {
            assert_eq!(c.observed_generation, Some(2));
        }
    }

    #[tokio::test]
    async fn transient_failures_are_returned_for_backoff() {
        let test = TestContext::new();
        test.store.insert(&network("net-a", "n1"));
        test.cloud.fail_next_create(osclients::Error::Http {
            status: http::StatusCode::SERVICE_UNAVAILABLE,
            message: "neutron is down".into(),
        });

        let err = reconcile_network(&test, "net-a").await.unwrap_err();
        assert!(matches!(err, Error::OpenStack(_)));
        let network: Network = test.store.object("default", "net-a").unwrap();
        assert_eq!(condition(&network, CONDITION_PROGRESSING).1, "TransientError");
        assert!(test.store.events().is_empty());
    }

    #[tokio::test]
    async fn repeated_reconciles_write_identical_status() {
        let test = TestContext::new();
        test.store.insert(&subnet("subnet-a", "net-b"));
        reconcile_subnet(&test, "subnet-a").await.unwrap();
        reconcile_subnet(&test, "subnet-a").await.unwrap();

        let statuses: Vec<_> = test
            .store
            .applies()
            .into_iter()
            .filter(|a| a.patch.field_owner.ends_with("/status"))
            .map(|a| a.patch.body)
            .collect();
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses[0], statuses[1]);
    }

    #[tokio::test]
    async fn deleting_a_network_deletes_the_resource() {
        let test = TestContext::new();
        test.store.insert(&network("net-a", "n1"));
        reconcile_network(&test, "net-a").await.unwrap();
        let id = test.store.object::<Network>("default", "net-a").unwrap().status_id().unwrap().to_string();

        test.store.delete_object::<Network>("default", "net-a");
        let action = reconcile_network(&test, "net-a").await.unwrap();
        assert_eq!(action, Action::requeue(Duration::from_secs(1)));
        let network: Network = test.store.object("default", "net-a").unwrap();
        assert_eq!(
            condition(&network, CONDITION_PROGRESSING).2,
            "waiting for OpenStack resource to be deleted"
        );
        assert!(test.cloud.resource(&id).is_none());

        let action = reconcile_network(&test, "net-a").await.unwrap();
        assert_eq!(action, Action::await_change());
        assert!(test.store.object::<Network>("default", "net-a").is_none());
        assert!(test.store.events().iter().any(|e| e.2.reason == "Deleted"));
    }

    #[tokio::test]
    async fn detached_resources_survive_deletion() {
        let test = TestContext::new();
        let mut object = network("net-a", "n1");
        object.spec.managed_options = Some(ManagedOptions {
            on_delete: OnDelete::Detach,
        });
        test.store.insert(&object);
        reconcile_network(&test, "net-a").await.unwrap();
        let id = test.store.object::<Network>("default", "net-a").unwrap().status_id().unwrap().to_string();

        test.store.delete_object::<Network>("default", "net-a");
        reconcile_network(&test, "net-a").await.unwrap();
        assert!(test.store.object::<Network>("default", "net-a").is_none());
        assert!(test.cloud.resource(&id).is_some());
    }

    #[tokio::test]
    async fn deletion_waits_for_external_finalizers() {
        let test = TestContext::new();
        test.store.insert(&network("net-a", "n1"));
        reconcile_network(&test, "net-a").await.unwrap();
        test.store.edit_metadata::<Network>("default", "net-a", |metadata| {
            metadata["finalizers"]
                .as_array_mut()
                .unwrap()
                .push(json!("example.com/backup"));
        });

        test.store.delete_object::<Network>("default", "net-a");
        let action = reconcile_network(&test, "net-a").await.unwrap();
        assert_eq!(action, Action::await_change());
        let network: Network = test.store.object("default", "net-a").unwrap();
        assert_eq!(
            condition(&network, CONDITION_PROGRESSING).2,
            "waiting for finalizer example.com/backup to be removed"
        );
        assert!(test.cloud.resource(network.status_id().unwrap()).is_some());
    }

    #[tokio::test]
    async fn orphaned_resources_are_deleted() {
        let test = TestContext::new();
        let mut object = network("net-a", "n1");
        object.metadata.finalizers = Some(vec![NETWORK_FINALIZER.into()]);
        test.store.insert(&object);
        let orphan = test.cloud.add("network", "n1");

        test.store.delete_object::<Network>("default", "net-a");
        reconcile_network(&test, "net-a").await.unwrap();
        assert!(test.cloud.resource(&orphan).is_none());
    }

    #[tokio::test]
    async fn guarded_networks_outlive_their_subnets() {
        let test = TestContext::new();
        test.store.insert(&network("net-a", "n1"));
        test.store.insert(&subnet("subnet-a", "net-a"));
        reconcile_network(&test, "net-a").await.unwrap();
        reconcile_subnet(&test, "subnet-a").await.unwrap();
        let network_id = test.store.object::<Network>("default", "net-a").unwrap().status_id().unwrap().to_string();

        test.store.delete_object::<Network>("default", "net-a");
        reconcile_network(&test, "net-a").await.unwrap();
        let network: Network = test.store.object("default", "net-a").unwrap();
        let guard = guard_finalizer_name("subnet", "network");
        assert!(network.finalizers().contains(&guard));
        assert_eq!(
            condition(&network, CONDITION_PROGRESSING).2,
            format!("waiting for finalizer {guard} to be removed")
        );
        assert!(test.cloud.resource(&network_id).is_some());
        assert!(!test.cloud.calls().iter().any(|c| c.starts_with("delete")));

        test.store.delete_object::<Subnet>("default", "subnet-a");
        reconcile_subnet(&test, "subnet-a").await.unwrap();
        reconcile_subnet(&test, "subnet-a").await.unwrap();
        assert!(test.store.object::<Subnet>("default", "subnet-a").is_none());

        let index = Arc::new(ReferenceIndex::new(SUBNET_NETWORK));
        index.apply(&watcher::Event::Restarted(Vec::new()));
        let network: Network = test.store.object("default", "net-a").unwrap();
        reconcile_guard(&test.ctx.orc, &Guard::new(&SUBNET_NETWORK, index), &network)
            .await
            .unwrap();
        let network: Network = test.store.object("default", "net-a").unwrap();
        assert_eq!(network.finalizers(), [NETWORK_FINALIZER]);

        reconcile_network(&test, "net-a").await.unwrap();
        reconcile_network(&test, "net-a").await.unwrap();
        assert!(test.store.object::<Network>("default", "net-a").is_none());
        assert!(test.cloud.resource(&network_id).is_none());
    }

    #[tokio::test]
    async fn released_objects_are_skipped() {
        let test = TestContext::new();
        let object = network("net-a", "n1");
        test.store.insert(&object);
        test.store.edit_metadata::<Network>("default", "net-a", |metadata| {
            metadata["finalizers"] = json!(["example.com/other"]);
        });
        test.store.delete_object::<Network>("default", "net-a");

        let action = reconcile_network(&test, "net-a").await.unwrap();
        assert_eq!(action, Action::await_change());
        assert!(test.store.applies().is_empty());
    }
}
