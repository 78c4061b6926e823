use std::time::Duration;

use async_trait::async_trait;
use futures::{future::BoxFuture, stream::BoxStream, TryStreamExt};
use kube::{Resource, ResourceExt};
use tracing::{debug, info};

use super::{
    finalizers::{field_owner, finalizer_name, has_finalizer, remove_finalizer_patch, set_finalizer_patch, Transaction},
    progress::{Outcome, ReconcileStatus, WaitingOn},
    status::set_status_id,
    store::ObjectEvent,
    Context,
};
use crate::{
    osclients,
    resources::{ManagementPolicy, OnDelete, OrcObject},
    Error,
};

/// One drift-closing step run against an existing OpenStack resource
pub type ResourceReconciler<A, K> =
    for<'a> fn(&'a A, &'a K, &'a <A as Actuator<K>>::OsResource) -> BoxFuture<'a, ReconcileStatus>;

/// Stream of OpenStack resources returned by a list call
pub type ResourceStream<R> = BoxStream<'static, osclients::Result<R>>;

/// The per-kind seam between the engine and an OpenStack API
#[async_trait]
pub trait Actuator<K: OrcObject>: Send + Sync + Sized {
    type OsResource: Send + Sync;

    /// Interval between checks that a deleted resource is gone
    const DELETE_POLLING_PERIOD: Duration = Duration::from_secs(1);

    /// Whether imported ids must be UUIDs
    const UUID_IDS: bool = true;

    fn resource_id(resource: &Self::OsResource) -> &str;

    /// The observed state written to `status.resource`
    fn resource_status(&self, resource: &Self::OsResource) -> K::ResourceStatus;

    /// Whether the resource is in a state where it can be used
    fn is_available(&self, _resource: &Self::OsResource) -> bool {
        true
    }

    async fn get_by_id(&self, id: &str) -> osclients::Result<Option<Self::OsResource>>;

    /// Resources this controller would have created from the current spec, or
    /// `None` when the kind cannot be adopted
    fn list_for_adoption(&self, object: &K) -> Option<ResourceStream<Self::OsResource>>;

    /// Resources matching an import filter
    fn list_for_import(&self, object: &K, filter: &K::Filter) -> ResourceStream<Self::OsResource>;

    async fn create(&self, object: &K) -> Outcome<Self::OsResource>;

    async fn delete(&self, object: &K, resource: &Self::OsResource) -> ReconcileStatus;

    /// Remove objects this object created and owns, before its own resource is deleted
    async fn delete_companions(&self, _object: &K) -> ReconcileStatus {
        ReconcileStatus::new()
    }

    /// Steps closing the drift between spec and resource, run in order
    fn reconcilers(&self) -> Vec<ResourceReconciler<Self, K>> {
        Vec::new()
    }
}

/// Builds actuators for a kind once its dependencies are resolved
#[async_trait]
pub trait ActuatorFactory<K: OrcObject>: Send + Sync + 'static {
    type Actuator: Actuator<K>;

    /// Name used for field owners, finalizers and metrics, e.g. `network`
    const CONTROLLER_NAME: &'static str;

    /// An actuator for creating or updating `object`
    ///
    /// Waits for every referenced object to be ready and guards it.
    async fn create_actuator(&self, ctx: &Context, object: &K) -> Outcome<Self::Actuator>;

    /// An actuator for deleting `object`. Referenced objects need not be ready.
    async fn delete_actuator(&self, ctx: &Context, object: &K) -> Outcome<Self::Actuator>;
}

/// Classify an error returned by a create or update call
///
/// Requests the API rejected as invalid will not succeed until the spec changes.
pub fn request_failed(error: osclients::Error) -> ReconcileStatus {
    if error.is_invalid_argument() || error.is_conflict() {
        ReconcileStatus::new().with_error(Error::invalid_configuration(error.server_message()))
    } else {
        ReconcileStatus::new().with_error(error)
    }
}

/// Status of a delete call. A resource which is already gone is deleted.
pub fn delete_result(result: osclients::Result<()>) -> ReconcileStatus {
    match result {
        Err(e) if !e.is_not_found() => ReconcileStatus::new().with_error(e),
        _ => ReconcileStatus::new(),
    }
}

/// Collect a list of candidates, failing on anything other than zero or one
async fn at_most_one<R>(stream: ResourceStream<R>, multiple: impl FnOnce(usize) -> Error) -> Outcome<Option<R>> {
    let mut found: Vec<R> = stream.try_collect().await?;
    match found.len() {
        0 | 1 => Ok(found.pop()),
        n => Err(ReconcileStatus::new().with_error(multiple(n))),
    }
}

fn is_managed<K: OrcObject>(object: &K) -> bool {
    object.management_policy() == ManagementPolicy::Managed
}

async fn record_id<K, A>(ctx: &Context, controller: &str, object: &K, resource: A::OsResource) -> Outcome<A::OsResource>
where
    K: OrcObject,
    A: Actuator<K>,
{
    set_status_id(&ctx.orc, controller, object, A::resource_id(&resource)).await?;
    Ok(resource)
}

/// Find the OpenStack resource for `object`, creating it if it is managed and does not exist
///
/// Any resource found or created is recorded in `status.id` before it is returned.
pub async fn get_or_create<K, A>(ctx: &Context, controller: &str, actuator: &A, object: &K) -> Outcome<A::OsResource>
where
    K: OrcObject,
    A: Actuator<K>,
{
    if let Some(id) = object.status_id() {
        return match actuator.get_by_id(id).await? {
            Some(resource) => Ok(resource),
            None if !is_managed(object) => {
                Err(ReconcileStatus::new().waiting_on_cloud(WaitingOn::Creation, ctx.poll_period))
            }
            None => Err(Error::unrecoverable("resource has been deleted from OpenStack").into()),
        };
    }

    if let Some(import) = object.import() {
        if let Some(id) = &import.id {
            if A::UUID_IDS && uuid::Uuid::parse_str(id).is_err() {
                return Err(Error::invalid_configuration(format!("import id {id:?} is not a valid UUID")).into());
            }
            let Some(resource) = actuator.get_by_id(id).await? else {
                return Err(Error::unrecoverable("referenced resource does not exist in OpenStack").into());
            };
            debug!(id, "imported existing resource by id");
            return record_id::<K, A>(ctx, controller, object, resource).await;
        }
        if let Some(filter) = &import.filter {
            let found = at_most_one(actuator.list_for_import(object, filter), |n| {
                Error::invalid_configuration(format!("expected 1 matching OpenStack resource to import, found {n}"))
            })
            .await?;
            let Some(resource) = found else {
                return Err(ReconcileStatus::new().waiting_on_cloud(WaitingOn::Creation, ctx.poll_period));
            };
            debug!(id = A::resource_id(&resource), "imported existing resource by filter");
            return record_id::<K, A>(ctx, controller, object, resource).await;
        }
    }

    if !is_managed(object) {
        return Err(Error::invalid_configuration("Not creating unmanaged resource").into());
    }
    if object.resource_spec().is_none() {
        return Err(Error::invalid_configuration("resource must be specified when policy is managed").into());
    }

    if let Some(candidates) = actuator.list_for_adoption(object) {
        let adopted = at_most_one(candidates, |_| {
            Error::unrecoverable("found more than one matching OpenStack resource during adoption")
        })
        .await?;
        if let Some(resource) = adopted {
            info!(id = A::resource_id(&resource), "adopted previously created resource");
            let resource = record_id::<K, A>(ctx, controller, object, resource).await?;
            ctx.orc
                .publish(
                    object,
                    ObjectEvent::normal("Adopted", "Create", format!("Adopted OpenStack resource {}", A::resource_id(&resource))),
                )
                .await;
            return Ok(resource);
        }
    }

    info!("creating resource");
    let resource = actuator.create(object).await?;
    let resource = record_id::<K, A>(ctx, controller, object, resource).await?;
    ctx.orc
        .publish(
            object,
            ObjectEvent::normal("Created", "Create", format!("Created OpenStack resource {}", A::resource_id(&resource))),
        )
        .await;
    Ok(resource)
}

/// The outcome of one reconcile, ready to be written to status
pub struct Reconciled<K: OrcObject> {
    pub status: ReconcileStatus,
    pub resource: Option<K::ResourceStatus>,
    pub available: bool,
    /// False once the object has been released and may already be gone
    pub write_status: bool,
}

impl<K: OrcObject> Reconciled<K> {
    fn pending(status: ReconcileStatus) -> Self {
        Self {
            status,
            resource: None,
            available: false,
            write_status: true,
        }
    }

    fn released() -> Self {
        Self {
            status: ReconcileStatus::new(),
            resource: None,
            available: false,
            write_status: false,
        }
    }
}

async fn add_finalizer<K: OrcObject>(ctx: &Context, controller: &str, object: &K) -> crate::Result<()> {
    let finalizer = finalizer_name(controller);
    if has_finalizer(object, &finalizer) {
        return Ok(());
    }
    let (namespace, name) = super::object_key(object)?;
    ctx.orc
        .apply::<K>(
            &namespace,
            &name,
            set_finalizer_patch(object, field_owner(controller, Transaction::Finalizer), &finalizer),
        )
        .await
}

async fn remove_finalizer<K: OrcObject>(ctx: &Context, controller: &str, object: &K) -> crate::Result<()> {
    let (namespace, name) = super::object_key(object)?;
    ctx.orc
        .apply::<K>(
            &namespace,
            &name,
            remove_finalizer_patch(object, field_owner(controller, Transaction::Finalizer)),
        )
        .await
}

/// Drive a live object towards its spec
pub async fn reconcile_normal<K, F>(ctx: &Context, factory: &F, object: &K) -> Reconciled<K>
where
    K: OrcObject,
    F: ActuatorFactory<K>,
{
    let controller = F::CONTROLLER_NAME;
    let actuator = match factory.create_actuator(ctx, object).await {
        Ok(actuator) => actuator,
        Err(status) => return Reconciled::pending(status),
    };

    // Only claim the object once everything it references is ready
    if let Err(e) = add_finalizer(ctx, controller, object).await {
        return Reconciled::pending(e.into());
    }

    let resource = match get_or_create(ctx, controller, &actuator, object).await {
        Ok(resource) => resource,
        Err(status) => return Reconciled::pending(status),
    };

    let mut status = ReconcileStatus::new();
    if is_managed(object) {
        for step in actuator.reconcilers() {
            status = status.merge(step(&actuator, object, &resource).await);
        }
    }

    let available = actuator.is_available(&resource);
    if !available && status.progress().is_empty() {
        status = status.waiting_on_cloud(WaitingOn::Ready, ctx.poll_period);
    }
    Reconciled {
        status,
        resource: Some(actuator.resource_status(&resource)),
        available,
        write_status: true,
    }
}

/// Release an object whose deletion has been requested
pub async fn reconcile_delete<K, F>(ctx: &Context, factory: &F, object: &K) -> Reconciled<K>
where
    K: OrcObject,
    F: ActuatorFactory<K>,
{
    let controller = F::CONTROLLER_NAME;
    let finalizer = finalizer_name(controller);
    if !has_finalizer(object, &finalizer) {
        return Reconciled::released();
    }

    // Anyone else holding the object must let go before the resource is deleted
    let external = object
        .finalizers()
        .iter()
        .filter(|f| **f != finalizer)
        .fold(ReconcileStatus::new(), |status, f| {
            status.with_progress(super::progress::ProgressStatus::WaitingOnFinalizer(f.clone()))
        });
    if !external.is_complete() {
        return Reconciled::pending(external);
    }

    if !is_managed(object) || object.on_delete() == OnDelete::Detach {
        info!("releasing resource without deleting it");
        return match remove_finalizer(ctx, controller, object).await {
            Ok(()) => Reconciled::released(),
            Err(e) => Reconciled::pending(e.into()),
        };
    }

    let actuator = match factory.delete_actuator(ctx, object).await {
        Ok(actuator) => actuator,
        Err(status) => return Reconciled::pending(status),
    };

    let found = match object.status_id() {
        Some(id) => actuator.get_by_id(id).await.map_err(ReconcileStatus::from),
        // A resource may have been created before its id was recorded
        None => match actuator.list_for_adoption(object) {
            Some(candidates) => {
                at_most_one(candidates, |_| {
                    Error::unrecoverable("found more than one matching OpenStack resource during adoption")
                })
                .await
            }
            None => Ok(None),
        },
    };
    let resource = match found {
        Ok(Some(resource)) => resource,
        Ok(None) => {
            info!("resource is gone, removing finalizer");
            return match remove_finalizer(ctx, controller, object).await {
                Ok(()) => {
                    ctx.orc
                        .publish(object, ObjectEvent::normal("Deleted", "Delete", "OpenStack resource deleted"))
                        .await;
                    Reconciled::released()
                }
                Err(e) => Reconciled::pending(e.into()),
            };
        }
        Err(status) => return Reconciled::pending(status),
    };

    let companions = actuator.delete_companions(object).await;
    if !companions.is_complete() {
        return Reconciled {
            resource: Some(actuator.resource_status(&resource)),
            ..Reconciled::pending(companions)
        };
    }

    debug!(id = <F::Actuator as Actuator<K>>::resource_id(&resource), kind = %K::kind(&()), name = %object.name_any(), "deleting resource");
    let mut status = actuator.delete(object, &resource).await;
    if status.progress().is_empty() && status.errors().is_empty() {
        status = status.waiting_on_cloud(WaitingOn::Deletion, <F::Actuator as Actuator<K>>::DELETE_POLLING_PERIOD);
    }
    Reconciled {
        status,
        resource: Some(actuator.resource_status(&resource)),
        available: false,
        write_status: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::osclients::Error as OsError;

    fn http_error(status: u16, message: &str) -> OsError {
        OsError::Http {
            status: http::StatusCode::from_u16(status).unwrap(),
            message: message.into(),
        }
    }

    #[test]
    fn rejected_creates_are_terminal() {
        let status = request_failed(http_error(400, "Invalid input for cidr"));
        let err = status.terminal_error().unwrap();
        assert_eq!(err.reason(), crate::resources::ConditionReason::InvalidConfiguration);
        assert_eq!(err.to_string(), "Invalid input for cidr");

        let status = request_failed(http_error(503, "try later"));
        assert!(status.terminal_error().is_none());
        assert!(status.transient_error().is_some());
    }

    #[test]
    fn deleting_a_missing_resource_succeeds() {
        assert!(delete_result(Err(http_error(404, "gone"))).is_complete());
        assert!(!delete_result(Err(http_error(409, "in use"))).is_complete());
        assert!(delete_result(Ok(())).is_complete());
    }
}
