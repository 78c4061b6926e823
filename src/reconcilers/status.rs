use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::Resource;
use serde_json::json;
use tracing::warn;

use super::{
    finalizers::{field_owner, Transaction},
    progress::ReconcileStatus,
    store::{ApplyPatch, ObjectEvent, OrcClient},
};
use crate::{
    resources::{ConditionReason, OrcObject, CONDITION_AVAILABLE, CONDITION_PROGRESSING},
    Result,
};

const MESSAGE_UP_TO_DATE: &str = "OpenStack resource is up to date";
const MESSAGE_AVAILABLE: &str = "OpenStack resource is available";

/// A condition before observedGeneration and lastTransitionTime are stamped
#[derive(Clone, Debug, PartialEq, Eq)]
struct ConditionState {
    status: &'static str,
    reason: ConditionReason,
    message: String,
}

fn progressing_state(status: &ReconcileStatus) -> ConditionState {
    if let Some(err) = status.terminal_error() {
        return ConditionState {
            status: "False",
            reason: err.reason(),
            message: err.to_string(),
        };
    }
    if let Some(err) = status.transient_error() {
        return ConditionState {
            status: "True",
            reason: ConditionReason::TransientError,
            message: err.to_string(),
        };
    }
    let messages = status.messages();
    if !messages.is_empty() {
        return ConditionState {
            status: "True",
            reason: ConditionReason::Progressing,
            message: messages.join("; "),
        };
    }
    ConditionState {
        status: "False",
        reason: ConditionReason::Success,
        message: MESSAGE_UP_TO_DATE.into(),
    }
}

fn available_state(status: &ReconcileStatus, available: bool, progressing: &ConditionState) -> ConditionState {
    let waiting_on_objects = status.progress().iter().any(|p| p.is_waiting_on_object());
    if available && !waiting_on_objects && !status.is_resource_unusable() {
        return ConditionState {
            status: "True",
            reason: ConditionReason::Success,
            message: MESSAGE_AVAILABLE.into(),
        };
    }
    let reason = if status.only_waiting_on_objects() {
        ConditionReason::DependencyNotReady
    } else {
        progressing.reason
    };
    ConditionState {
        status: "False",
        reason,
        message: progressing.message.clone(),
    }
}

fn stamp(type_: &str, state: ConditionState, previous: Option<&Condition>, generation: Option<i64>, now: &Time) -> Condition {
    let reason = state.reason.to_string();
    let last_transition_time = match previous {
        Some(p) if p.status == state.status && p.reason == reason && p.message == state.message => {
            p.last_transition_time.clone()
        }
        _ => now.clone(),
    };
    Condition {
        type_: type_.to_string(),
        status: state.status.to_string(),
        reason,
        message: state.message,
        observed_generation: generation,
        last_transition_time,
    }
}

/// Build the `Available` and `Progressing` conditions for the outcome of a reconcile
///
/// `available` is true when the OpenStack resource exists and satisfies the
/// kind's availability predicate.
pub fn conditions<K: OrcObject>(object: &K, status: &ReconcileStatus, available: bool) -> Vec<Condition> {
    let now = Time(Utc::now());
    let generation = object.meta().generation;
    let progressing = progressing_state(status);
    let availability = available_state(status, available, &progressing);
    vec![
        stamp(
            CONDITION_AVAILABLE,
            availability,
            object.condition(CONDITION_AVAILABLE),
            generation,
            &now,
        ),
        stamp(
            CONDITION_PROGRESSING,
            progressing,
            object.condition(CONDITION_PROGRESSING),
            generation,
            &now,
        ),
    ]
}

/// Identity of `object` in an apply body: its name, and its uid when known
///
/// The uid acts as a precondition, so a patch never lands on a recreated
/// object of the same name.
pub fn object_identity<K: Resource>(object: &K) -> serde_json::Value {
    let mut metadata = json!({ "name": object.meta().name });
    if let Some(uid) = &object.meta().uid {
        metadata["uid"] = json!(uid);
    }
    metadata
}

/// Apply patch writing conditions and the observed resource under the status owner
pub fn status_patch<K: OrcObject>(
    controller: &str,
    object: &K,
    conditions: Vec<Condition>,
    resource: Option<&K::ResourceStatus>,
) -> Result<ApplyPatch> {
    let mut status = json!({ "conditions": conditions });
    if let Some(resource) = resource {
        status["resource"] = serde_json::to_value(resource)?;
    }
    Ok(ApplyPatch::status(
        field_owner(controller, Transaction::Status),
        json!({
            "apiVersion": K::api_version(&()),
            "kind": K::kind(&()),
            "metadata": object_identity(object),
            "status": status,
        }),
    ))
}

/// Apply patch recording `status.id`
///
/// Not forced, so a different id already written by another owner is a conflict
/// rather than an overwrite.
pub fn id_patch<K: OrcObject>(controller: &str, object: &K, id: &str) -> ApplyPatch {
    let body = json!({
        "apiVersion": K::api_version(&()),
        "kind": K::kind(&()),
        "metadata": object_identity(object),
        "status": { "id": id },
    });
    ApplyPatch::status(field_owner(controller, Transaction::Id), body).without_force()
}

/// Record `status.id` on the object
pub async fn set_status_id<K: OrcObject>(orc: &OrcClient, controller: &str, object: &K, id: &str) -> Result<()> {
    let (namespace, name) = super::object_key(object)?;
    orc.apply::<K>(&namespace, &name, id_patch(controller, object, id)).await
}

/// Write the status for the outcome of a reconcile
///
/// A write rejected by a field manager conflict is reported as a warning event
/// on the object before the error is returned.
pub async fn write_status<K: OrcObject>(
    orc: &OrcClient,
    controller: &str,
    object: &K,
    status: &ReconcileStatus,
    resource: Option<&K::ResourceStatus>,
    available: bool,
) -> Result<()> {
    let (namespace, name) = super::object_key(object)?;
    let patch = status_patch(controller, object, conditions(object, status, available), resource)?;
    match orc.apply::<K>(&namespace, &name, patch).await {
        Err(e) if e.is_conflict() => {
            warn!(%namespace, %name, error = %e, "status write conflicted");
            orc.publish(
                object,
                ObjectEvent::warning("ApplyConflict", "UpdateStatus", e.to_string()),
            )
            .await;
            Err(e)
        }
        result => result,
    }
}
