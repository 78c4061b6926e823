use std::collections::BTreeSet;

use tracing::info;

use super::{actuator::request_failed, progress::ReconcileStatus};
use crate::osclients::NetworkingClient;

/// Tags in the form neutron reports them: sorted, without duplicates
pub fn normalize(tags: &[String]) -> Vec<String> {
    tags.iter().cloned().collect::<BTreeSet<_>>().into_iter().collect()
}

/// Whether the observed tags differ from the desired set
pub fn differ(desired: &[String], observed: &[String]) -> bool {
    normalize(desired) != normalize(observed)
}

/// Replace the tags of a neutron resource when they differ from the spec
///
/// `resource_type` is the URL collection, e.g. `networks`.
pub async fn reconcile_neutron_tags(
    client: &NetworkingClient,
    resource_type: &str,
    id: &str,
    desired: &[String],
    observed: &[String],
) -> ReconcileStatus {
    if !differ(desired, observed) {
        return ReconcileStatus::new();
    }
    let tags = normalize(desired);
    info!(resource_type, id, ?tags, "updating tags");
    match client.replace_tags(resource_type, id, &tags).await {
        Ok(()) => ReconcileStatus::new().needs_refresh(),
        Err(e) => request_failed(e),
    }
}
