use async_trait::async_trait;
use futures::{future::BoxFuture, FutureExt};
use kube::{Client, ResourceExt};
use tracing::info;

use super::{
    actuator::{delete_result, request_failed, Actuator, ActuatorFactory, ResourceReconciler, ResourceStream},
    controller::ControllerBuilder,
    credentials,
    progress::{Outcome, ReconcileStatus},
    tags::{normalize, reconcile_neutron_tags},
    Context,
};
use crate::{
    osclients::{self, NetworkingClient, SecurityGroupCreateOpts, SecurityGroupRuleCreateOpts},
    resources::{
        Ethertype, NeutronStatusMetadata, RuleDirection, SecurityGroup, SecurityGroupFilter,
        SecurityGroupResourceStatus, SecurityGroupRule, SecurityGroupRuleStatus,
    },
};

pub const CONTROLLER_NAME: &str = "securitygroup";

fn resource_name(group: &SecurityGroup) -> String {
    group
        .spec
        .resource
        .as_ref()
        .and_then(|r| r.name.clone())
        .unwrap_or_else(|| group.name_any())
}

fn filter_query(filter: &SecurityGroupFilter) -> Vec<(String, String)> {
    let mut query = filter.tags.query();
    let fields = [
        ("name", &filter.name),
        ("description", &filter.description),
        ("project_id", &filter.project_id),
    ];
    query.extend(
        fields
            .into_iter()
            .filter_map(|(key, value)| Some((key.to_string(), value.clone()?))),
    );
    query
}

/// The fields that identify a rule. Neutron rules are immutable, so a rule
/// which differs in any of them is a different rule.
#[derive(Debug, PartialEq, Eq)]
struct RuleKey {
    description: String,
    direction: String,
    ethertype: String,
    protocol: Option<String>,
    remote_ip_prefix: Option<String>,
    port_range_min: Option<i32>,
    port_range_max: Option<i32>,
}

fn direction(direction: RuleDirection) -> &'static str {
    match direction {
        RuleDirection::Ingress => "ingress",
        RuleDirection::Egress => "egress",
    }
}

fn ethertype(ethertype: Ethertype) -> &'static str {
    match ethertype {
        Ethertype::IPv4 => "IPv4",
        Ethertype::IPv6 => "IPv6",
    }
}

impl RuleKey {
    fn desired(rule: &SecurityGroupRule) -> Self {
        Self {
            description: rule.description.clone().unwrap_or_default(),
            direction: direction(rule.direction).into(),
            ethertype: ethertype(rule.ethertype).into(),
            protocol: rule.protocol.as_ref().map(|p| p.to_lowercase()),
            remote_ip_prefix: rule.remote_ip_prefix.clone(),
            port_range_min: rule.port_range_min,
            port_range_max: rule.port_range_max,
        }
    }

    fn observed(rule: &osclients::SecurityGroupRule) -> Self {
        Self {
            description: rule.description.clone(),
            direction: rule.direction.clone(),
            ethertype: rule.ethertype.clone(),
            protocol: rule.protocol.as_ref().map(|p| p.to_lowercase()),
            remote_ip_prefix: rule.remote_ip_prefix.clone(),
            port_range_min: rule.port_range_min,
            port_range_max: rule.port_range_max,
        }
    }
}

/// Rules to create and rule ids to delete so that `observed` matches `desired`
fn rule_changes<'a>(
    desired: &'a [SecurityGroupRule],
    observed: &'a [osclients::SecurityGroupRule],
) -> (Vec<&'a SecurityGroupRule>, Vec<&'a str>) {
    let mut unmatched: Vec<_> = observed.iter().map(|r| (RuleKey::observed(r), r)).collect();
    let mut create = Vec::new();
    for rule in desired {
        let key = RuleKey::desired(rule);
        match unmatched.iter().position(|(observed, _)| *observed == key) {
            Some(i) => {
                unmatched.swap_remove(i);
            }
            None => create.push(rule),
        }
    }
    let delete = unmatched.into_iter().map(|(_, r)| r.id.as_str()).collect();
    (create, delete)
}

fn create_rule_opts(group_id: &str, rule: &SecurityGroupRule) -> SecurityGroupRuleCreateOpts {
    SecurityGroupRuleCreateOpts {
        security_group_id: group_id.to_string(),
        direction: direction(rule.direction).into(),
        ethertype: ethertype(rule.ethertype).into(),
        description: rule.description.clone(),
        protocol: rule.protocol.clone(),
        remote_ip_prefix: rule.remote_ip_prefix.clone(),
        port_range_min: rule.port_range_min,
        port_range_max: rule.port_range_max,
    }
}

pub struct SecurityGroupActuator {
    client: NetworkingClient,
}

impl SecurityGroupActuator {
    pub fn new(client: NetworkingClient) -> Self {
        Self { client }
    }
}

fn reconcile_tags<'a>(
    actuator: &'a SecurityGroupActuator,
    group: &'a SecurityGroup,
    resource: &'a osclients::SecurityGroup,
) -> BoxFuture<'a, ReconcileStatus> {
    async move {
        let desired = group.spec.resource.as_ref().map(|r| r.tags.as_slice()).unwrap_or_default();
        reconcile_neutron_tags(&actuator.client, "security-groups", &resource.id, desired, &resource.tags).await
    }
    .boxed()
}

fn reconcile_rules<'a>(
    actuator: &'a SecurityGroupActuator,
    group: &'a SecurityGroup,
    resource: &'a osclients::SecurityGroup,
) -> BoxFuture<'a, ReconcileStatus> {
    async move {
        let desired = group.spec.resource.as_ref().map(|r| r.rules.as_slice()).unwrap_or_default();
        let (create, delete) = rule_changes(desired, &resource.security_group_rules);
        if create.is_empty() && delete.is_empty() {
            return ReconcileStatus::new();
        }
        info!(create = create.len(), delete = delete.len(), "updating security group rules");

        let mut status = ReconcileStatus::new();
        for id in delete {
            status = status.merge(delete_result(actuator.client.delete_security_group_rule(id).await));
        }
        for rule in create {
            let opts = create_rule_opts(&resource.id, rule);
            if let Err(e) = actuator.client.create_security_group_rule(&opts).await {
                status = status.merge(request_failed(e));
            }
        }
        status.needs_refresh()
    }
    .boxed()
}

#[async_trait]
impl Actuator<SecurityGroup> for SecurityGroupActuator {
    type OsResource = osclients::SecurityGroup;

    fn resource_id(resource: &osclients::SecurityGroup) -> &str {
        &resource.id
    }

    fn resource_status(&self, resource: &osclients::SecurityGroup) -> SecurityGroupResourceStatus {
        SecurityGroupResourceStatus {
            name: resource.name.clone(),
            description: resource.description.clone(),
            project_id: resource.project_id.clone(),
            tags: normalize(&resource.tags),
            stateful: resource.stateful.unwrap_or(true),
            rules: resource
                .security_group_rules
                .iter()
                .map(|r| SecurityGroupRuleStatus {
                    id: r.id.clone(),
                    description: r.description.clone(),
                    direction: r.direction.clone(),
                    ethertype: r.ethertype.clone(),
                    protocol: r.protocol.clone().unwrap_or_default(),
                    remote_ip_prefix: r.remote_ip_prefix.clone().unwrap_or_default(),
                    port_range_min: r.port_range_min,
                    port_range_max: r.port_range_max,
                })
                .collect(),
            metadata: NeutronStatusMetadata {
                created_at: resource.created_at.clone(),
                updated_at: resource.updated_at.clone(),
                revision_number: resource.revision_number,
            },
        }
    }

    async fn get_by_id(&self, id: &str) -> osclients::Result<Option<osclients::SecurityGroup>> {
        self.client.get_security_group(id).await
    }

    fn list_for_adoption(&self, group: &SecurityGroup) -> Option<ResourceStream<osclients::SecurityGroup>> {
        group.spec.resource.as_ref()?;
        Some(self.client.list_security_groups(&[("name".into(), resource_name(group))]))
    }

    fn list_for_import(
        &self,
        _group: &SecurityGroup,
        filter: &SecurityGroupFilter,
    ) -> ResourceStream<osclients::SecurityGroup> {
        self.client.list_security_groups(&filter_query(filter))
    }

    async fn create(&self, group: &SecurityGroup) -> Outcome<osclients::SecurityGroup> {
        let spec = group.spec.resource.clone().unwrap_or_default();
        let opts = SecurityGroupCreateOpts {
            name: resource_name(group),
            description: spec.description,
            stateful: spec.stateful,
        };
        self.client.create_security_group(&opts).await.map_err(request_failed)
    }

    async fn delete(&self, _group: &SecurityGroup, resource: &osclients::SecurityGroup) -> ReconcileStatus {
        delete_result(self.client.delete_security_group(&resource.id).await)
    }

    fn reconcilers(&self) -> Vec<ResourceReconciler<Self, SecurityGroup>> {
        vec![reconcile_tags, reconcile_rules]
    }
}

pub struct SecurityGroupFactory;

#[async_trait]
impl ActuatorFactory<SecurityGroup> for SecurityGroupFactory {
    type Actuator = SecurityGroupActuator;

    const CONTROLLER_NAME: &'static str = CONTROLLER_NAME;

    async fn create_actuator(&self, ctx: &Context, group: &SecurityGroup) -> Outcome<SecurityGroupActuator> {
        let scope = credentials::scope(ctx, CONTROLLER_NAME, group).await?;
        Ok(SecurityGroupActuator::new(scope.networking()?))
    }

    async fn delete_actuator(&self, ctx: &Context, group: &SecurityGroup) -> Outcome<SecurityGroupActuator> {
        let scope = credentials::scope_for_delete(ctx, CONTROLLER_NAME, group).await?;
        Ok(SecurityGroupActuator::new(scope.networking()?))
    }
}

pub async fn run(client: Client, ctx: Context, concurrency: u16) {
    ControllerBuilder::<SecurityGroup>::new(client, ctx, CONTROLLER_NAME, concurrency)
        .credentials()
        .run(SecurityGroupFactory)
        .await
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use axum::{
        extract::{Path, State},
        routing::{delete, post},
        Json, Router,
    };
    use serde_json::{json, Value};

    use super::*;
    use crate::{
        osclients::{testing, ServiceClient},
        reconcilers::testing::credentials,
        resources::{SecurityGroupResourceSpec, SecurityGroupSpec},
    };

    fn ssh() -> SecurityGroupRule {
        SecurityGroupRule {
            protocol: Some("TCP".into()),
            port_range_min: Some(22),
            port_range_max: Some(22),
            remote_ip_prefix: Some("0.0.0.0/0".into()),
            ..Default::default()
        }
    }

    fn observed(id: &str, direction: &str, protocol: Option<&str>, port: Option<i32>) -> osclients::SecurityGroupRule {
        osclients::SecurityGroupRule {
            id: id.into(),
            description: String::new(),
            direction: direction.into(),
            ethertype: "IPv4".into(),
            protocol: protocol.map(str::to_string),
            remote_ip_prefix: port.map(|_| "0.0.0.0/0".to_string()),
            port_range_min: port,
            port_range_max: port,
        }
    }

    #[test]
    fn rules_are_matched_by_value() {
        let desired = vec![ssh()];
        let existing = vec![
            observed("default-egress", "egress", None, None),
            observed("ssh", "ingress", Some("tcp"), Some(22)),
        ];
        let (create, delete) = rule_changes(&desired, &existing);
        assert!(create.is_empty());
        assert_eq!(delete, vec!["default-egress"]);

        let (create, delete) = rule_changes(&desired, &[]);
        assert_eq!(create, vec![&desired[0]]);
        assert!(delete.is_empty());
    }

    #[tokio::test]
    async fn rule_drift_is_closed_and_refreshed() {
        #[derive(Clone, Default)]
        struct Calls(Arc<Mutex<Vec<String>>>);

        async fn create(State(calls): State<Calls>, Json(body): Json<Value>) -> Json<Value> {
            assert_eq!(body["security_group_rule"]["protocol"], json!("TCP"));
            assert_eq!(body["security_group_rule"]["security_group_id"], json!("sg1"));
            calls.0.lock().unwrap().push("create".into());
            Json(json!({"security_group_rule": {"id": "r2", "direction": "ingress", "ethertype": "IPv4"}}))
        }
        async fn remove(State(calls): State<Calls>, Path(id): Path<String>) {
            calls.0.lock().unwrap().push(format!("delete {id}"));
        }
        let calls = Calls::default();
        let base = testing::serve(
            Router::new()
                .route("/v2.0/security-group-rules", post(create))
                .route("/v2.0/security-group-rules/:id", delete(remove))
                .with_state(calls.clone()),
        )
        .await;
        let actuator =
            SecurityGroupActuator::new(NetworkingClient::new(ServiceClient::new(reqwest::Client::new(), base, "t")));

        let mut group = SecurityGroup::new(
            "sg",
            SecurityGroupSpec {
                resource: Some(SecurityGroupResourceSpec {
                    rules: vec![ssh()],
                    ..Default::default()
                }),
                cloud_credentials_ref: credentials(),
                ..Default::default()
            },
        );
        group.metadata.namespace = Some("default".into());
        let resource = osclients::SecurityGroup {
            id: "sg1".into(),
            security_group_rules: vec![observed("r1", "egress", None, None)],
            ..Default::default()
        };

        let status = reconcile_rules(&actuator, &group, &resource).await;
        assert_eq!(status.messages(), vec!["resource status will be refreshed"]);
        assert_eq!(*calls.0.lock().unwrap(), vec!["delete r1".to_string(), "create".to_string()]);
    }
}
