use std::sync::{Arc, Mutex, PoisonError, RwLock};

use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::Secret;
use kube::{
    runtime::{controller, controller::Action, reflector, watcher, Controller, WatchStreamExt},
    Api, Client, Resource, ResourceExt,
};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, field, info, instrument, warn, Span};

use super::{
    deletion_guard::{reconcile_guard, Guard},
    dependency::{credentials_dependency, object_refs, BecameReady, Dependency, ObjectKey, ReferenceIndex},
    object_key,
    progress::Outcome,
    store::OrcClient,
    Context,
};
use crate::{
    resources::OrcObject,
    scope::{Scope, ScopeCache},
    telemetry, Error, Result,
};

/// Name of the guard over credentials secrets in logs and metrics
pub const CREDENTIALS_GUARD_NAME: &str = "secret_deletion_guard";

async fn secret<K: OrcObject>(ctx: &Context, dependency: &Dependency<K, Secret>, object: &K) -> Outcome<Secret> {
    let (namespace, _) = object_key(object)?;
    let secret_name = &object.credentials_ref().secret_name;
    dependency.get_dependency(&ctx.orc, &namespace, secret_name).await
}

/// An authenticated scope for `object`, guarding its credentials secret first
pub async fn scope<K: OrcObject>(ctx: &Context, controller: &'static str, object: &K) -> Outcome<Arc<Scope>> {
    let dependency = credentials_dependency::<K>(controller);
    let secret = secret(ctx, &dependency, object).await?;
    dependency.ensure_guard(&ctx.orc, &secret).await?;
    Ok(ctx.scopes.get(&secret, &object.credentials_ref().cloud_name).await?)
}

/// An authenticated scope for deleting `object`
///
/// The secret may itself be deleting. It is usable as long as we still guard it.
pub async fn scope_for_delete<K: OrcObject>(
    ctx: &Context,
    controller: &'static str,
    object: &K,
) -> Outcome<Arc<Scope>> {
    let dependency = credentials_dependency::<K>(controller);
    let secret = secret(ctx, &dependency, object).await?;
    Ok(ctx.scopes.get(&secret, &object.credentials_ref().cloud_name).await?)
}

/// One kind's claim on the secrets its objects authenticate with
struct CredentialsDependent {
    guard: Guard,
    /// Dependents of this kind to reconcile again
    retrigger: UnboundedSender<ObjectKey>,
}

struct Registry {
    dependents: RwLock<Vec<CredentialsDependent>>,
    seen: BecameReady,
    changes: UnboundedSender<ObjectKey>,
    changed: Mutex<Option<UnboundedReceiver<ObjectKey>>>,
}

/// The single watch and deletion guard over credentials secrets
///
/// Every controller registers the references of its kind. One secret watch
/// then guards secrets for all of them, evicts cached sessions of deleted
/// secrets, and retriggers dependents when their secret appears.
#[derive(Clone)]
pub struct CredentialsGuard {
    registry: Arc<Registry>,
}

impl Default for CredentialsGuard {
    fn default() -> Self {
        let (changes, changed) = mpsc::unbounded_channel();
        Self {
            registry: Arc::new(Registry {
                dependents: RwLock::default(),
                seen: BecameReady::default(),
                changes,
                changed: Mutex::new(Some(changed)),
            }),
        }
    }
}

impl CredentialsGuard {
    /// Guard the secrets `index` finds referenced, and send dependents to reconcile to `retrigger`
    pub fn register<K: OrcObject>(
        &self,
        dependency: &Dependency<K, Secret>,
        index: Arc<ReferenceIndex<K>>,
        retrigger: UnboundedSender<ObjectKey>,
    ) {
        index.notify(self.registry.changes.clone());
        self.registry
            .dependents
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(CredentialsDependent {
                guard: Guard::new(dependency, index),
                retrigger,
            });
    }

    fn guards(&self) -> Vec<Guard> {
        self.registry
            .dependents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|d| d.guard.clone())
            .collect()
    }

    /// Keep cached sessions and dependents in step with a secret watch event
    pub fn observe(&self, scopes: &ScopeCache, event: &watcher::Event<Secret>) {
        self.registry.seen.prune(event);
        match event {
            watcher::Event::Applied(secret) => self.observe_secret(scopes, secret),
            watcher::Event::Deleted(secret) => {
                scopes.evict_secret(&secret.namespace().unwrap_or_default(), &secret.name_any());
            }
            watcher::Event::Restarted(secrets) => {
                for secret in secrets {
                    self.observe_secret(scopes, secret);
                }
            }
        }
    }

    fn observe_secret(&self, scopes: &ScopeCache, secret: &Secret) {
        let namespace = secret.namespace().unwrap_or_default();
        let name = secret.name_any();
        if secret.meta().deletion_timestamp.is_some() {
            scopes.evict_secret(&namespace, &name);
        }
        if !self.registry.seen.observe(secret, true) {
            return;
        }
        for dependent in self
            .registry
            .dependents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
        {
            for referrer in dependent.guard.referrers().referrers(&namespace, &name) {
                // the controller may have stopped
                let _ = dependent.retrigger.send((namespace.clone(), referrer));
            }
        }
    }

    /// Bring every registered kind's finalizer on `secret` in line with its dependents
    pub async fn reconcile(&self, orc: &OrcClient, secret: &Secret) -> Result<Action> {
        let mut action = Action::await_change();
        for guard in self.guards() {
            let next = reconcile_guard(orc, &guard, secret).await?;
            if next != Action::await_change() {
                action = next;
            }
        }
        Ok(action)
    }

    fn take_changes(&self) -> Option<UnboundedReceiver<ObjectKey>> {
        self.registry
            .changed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

#[instrument(skip(secret, ctx), fields(trace_id, guard = CREDENTIALS_GUARD_NAME))]
async fn reconcile(secret: Arc<Secret>, ctx: Arc<Context>) -> Result<Action> {
    let trace_id = telemetry::get_trace_id();
    Span::current().record("trace_id", &field::display(&trace_id));
    let _timer = ctx.metrics.count_and_measure(CREDENTIALS_GUARD_NAME);

    ctx.credentials.reconcile(&ctx.orc, secret.as_ref()).await
}

fn error_policy(secret: Arc<Secret>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!(name = %secret.name_any(), %error, "credentials guard failed");
    ctx.metrics
        .reconcile_failure(CREDENTIALS_GUARD_NAME, secret.as_ref(), error);
    Action::requeue(std::time::Duration::from_secs(5))
}

/// Watch credentials secrets for every registered controller until shutdown
pub async fn run_guard(client: Client, ctx: Context, concurrency: u16) {
    let Some(changed) = ctx.credentials.take_changes() else {
        warn!("credentials guard is already running");
        return;
    };
    info!(guard = CREDENTIALS_GUARD_NAME, "starting deletion guard");

    let (reader, writer) = reflector::store();
    let observer = ctx.credentials.clone();
    let scopes = ctx.scopes.clone();
    let secrets = reflector(
        writer,
        watcher(Api::<Secret>::all(client), watcher::Config::default().any_semantic()),
    )
    .default_backoff()
    .inspect_ok(move |event| observer.observe(&scopes, event))
    .applied_objects();

    Controller::for_stream(secrets, reader)
        .reconcile_on(object_refs(changed))
        .with_config(controller::Config::default().concurrency(concurrency))
        .shutdown_on_signal()
        .run(reconcile, error_policy, Arc::new(ctx))
        .for_each(|result| async move {
            if let Err(e) = result {
                debug!(error = %e, "credentials guard loop error");
            }
        })
        .await;
    info!(guard = CREDENTIALS_GUARD_NAME, "deletion guard stopped");
}
