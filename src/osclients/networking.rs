use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{Result, ServiceClient};

/// Neutron v2.0 API
#[derive(Clone, Debug)]
pub struct NetworkingClient {
    client: ServiceClient,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct Network {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub project_id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub admin_state_up: bool,
    #[serde(default)]
    pub availability_zone_hints: Vec<String>,
    pub dns_domain: Option<String>,
    pub mtu: Option<i32>,
    pub port_security_enabled: Option<bool>,
    #[serde(rename = "router:external", default)]
    pub external: bool,
    #[serde(default)]
    pub shared: bool,
    #[serde(default)]
    pub subnets: Vec<String>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
    pub revision_number: Option<i64>,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct NetworkCreateOpts {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub admin_state_up: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns_domain: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mtu: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port_security_enabled: Option<bool>,
    #[serde(rename = "router:external", skip_serializing_if = "Option::is_none")]
    pub external: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shared: Option<bool>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub availability_zone_hints: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct Subnet {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub network_id: String,
    #[serde(default)]
    pub project_id: String,
    pub ip_version: i32,
    pub cidr: String,
    pub gateway_ip: Option<String>,
    #[serde(default)]
    pub enable_dhcp: bool,
    #[serde(default)]
    pub dns_nameservers: Vec<String>,
    #[serde(default)]
    pub allocation_pools: Vec<AllocationPool>,
    #[serde(default)]
    pub host_routes: Vec<HostRoute>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
    pub revision_number: Option<i64>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct AllocationPool {
    pub start: String,
    pub end: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct HostRoute {
    pub destination: String,
    pub nexthop: String,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct SubnetCreateOpts {
    pub network_id: String,
    pub ip_version: i32,
    pub cidr: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// `Some(None)` serializes as `null`, which disables the gateway
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway_ip: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enable_dhcp: Option<bool>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub dns_nameservers: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub allocation_pools: Vec<AllocationPool>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub host_routes: Vec<HostRoute>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct Router {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub project_id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub admin_state_up: bool,
    pub external_gateway_info: Option<GatewayInfo>,
    pub distributed: Option<bool>,
    #[serde(default)]
    pub availability_zone_hints: Vec<String>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
    pub revision_number: Option<i64>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct GatewayInfo {
    pub network_id: String,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct RouterCreateOpts {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub admin_state_up: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_gateway_info: Option<GatewayInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distributed: Option<bool>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub availability_zone_hints: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct Port {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub network_id: String,
    #[serde(default)]
    pub project_id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub admin_state_up: bool,
    #[serde(default)]
    pub mac_address: String,
    #[serde(default)]
    pub device_id: String,
    #[serde(default)]
    pub device_owner: String,
    #[serde(default)]
    pub allowed_address_pairs: Vec<AddressPair>,
    #[serde(default)]
    pub fixed_ips: Vec<FixedIp>,
    #[serde(default)]
    pub security_groups: Vec<String>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
    pub revision_number: Option<i64>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct AddressPair {
    pub ip_address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac_address: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct FixedIp {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    pub subnet_id: String,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct PortCreateOpts {
    pub network_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub admin_state_up: Option<bool>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub allowed_address_pairs: Vec<AddressPair>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fixed_ips: Vec<FixedIp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub security_groups: Option<Vec<String>>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct SecurityGroup {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub project_id: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub stateful: Option<bool>,
    #[serde(default)]
    pub security_group_rules: Vec<SecurityGroupRule>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
    pub revision_number: Option<i64>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct SecurityGroupRule {
    pub id: String,
    #[serde(default)]
    pub description: String,
    pub direction: String,
    pub ethertype: String,
    pub protocol: Option<String>,
    pub remote_ip_prefix: Option<String>,
    pub port_range_min: Option<i32>,
    pub port_range_max: Option<i32>,
}

#[derive(Clone, Debug, Default, Serialize, PartialEq)]
pub struct SecurityGroupRuleCreateOpts {
    pub security_group_id: String,
    pub direction: String,
    pub ethertype: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_ip_prefix: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port_range_min: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port_range_max: Option<i32>,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct SecurityGroupCreateOpts {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stateful: Option<bool>,
}

/// Result of adding a subnet to a router
#[derive(Clone, Debug, Deserialize)]
pub struct RouterInterfaceInfo {
    pub port_id: String,
    pub subnet_id: String,
}

/// Generates get, list, create, update and delete for one neutron collection
macro_rules! neutron_collection {
    ($get:ident, $list:ident, $create:ident, $update:ident, $delete:ident, $ty:ty, $opts:ty, $path:literal, $key:literal, $collection:literal) => {
        pub async fn $get(&self, id: &str) -> Result<Option<$ty>> {
            self.client
                .get_resource(&format!(concat!("/v2.0/", $path, "/{}"), id), $key)
                .await
        }

        pub fn $list(&self, query: &[(String, String)]) -> BoxStream<'static, Result<$ty>> {
            self.client.list(concat!("/v2.0/", $path), query, $collection)
        }

        pub async fn $create(&self, opts: &$opts) -> Result<$ty> {
            self.client
                .create_resource(concat!("/v2.0/", $path), $key, opts)
                .await
        }

        /// Update with a partial body of only the fields to change
        pub async fn $update(&self, id: &str, changes: &serde_json::Value) -> Result<$ty> {
            self.client
                .update_resource(&format!(concat!("/v2.0/", $path, "/{}"), id), $key, changes)
                .await
        }

        pub async fn $delete(&self, id: &str) -> Result<()> {
            self.client
                .delete(&format!(concat!("/v2.0/", $path, "/{}"), id))
                .await
        }
    };
}

impl NetworkingClient {
    pub fn new(client: ServiceClient) -> Self {
        Self { client }
    }

    neutron_collection!(get_network, list_networks, create_network, update_network, delete_network, Network, NetworkCreateOpts, "networks", "network", "networks");
    neutron_collection!(get_subnet, list_subnets, create_subnet, update_subnet, delete_subnet, Subnet, SubnetCreateOpts, "subnets", "subnet", "subnets");
    neutron_collection!(get_router, list_routers, create_router, update_router, delete_router, Router, RouterCreateOpts, "routers", "router", "routers");
    neutron_collection!(get_port, list_ports, create_port, update_port, delete_port, Port, PortCreateOpts, "ports", "port", "ports");
    neutron_collection!(
        get_security_group,
        list_security_groups,
        create_security_group,
        update_security_group,
        delete_security_group,
        SecurityGroup,
        SecurityGroupCreateOpts,
        "security-groups",
        "security_group",
        "security_groups"
    );

    pub async fn create_security_group_rule(&self, opts: &SecurityGroupRuleCreateOpts) -> Result<SecurityGroupRule> {
        self.client
            .create_resource("/v2.0/security-group-rules", "security_group_rule", opts)
            .await
    }

    pub async fn delete_security_group_rule(&self, id: &str) -> Result<()> {
        self.client
            .delete(&format!("/v2.0/security-group-rules/{id}"))
            .await
    }

    /// Replace the full tag set of a resource; `resource_type` is the URL collection, e.g. `networks`
    pub async fn replace_tags(&self, resource_type: &str, id: &str, tags: &[String]) -> Result<()> {
        let _: serde_json::Value = self
            .client
            .put(&format!("/v2.0/{resource_type}/{id}/tags"), &json!({ "tags": tags }))
            .await?;
        Ok(())
    }

    pub async fn add_router_interface(&self, router_id: &str, subnet_id: &str) -> Result<RouterInterfaceInfo> {
        self.client
            .put(
                &format!("/v2.0/routers/{router_id}/add_router_interface"),
                &json!({ "subnet_id": subnet_id }),
            )
            .await
    }

    pub async fn remove_router_interface(&self, router_id: &str, subnet_id: &str) -> Result<()> {
        let _: serde_json::Value = self
            .client
            .put(
                &format!("/v2.0/routers/{router_id}/remove_router_interface"),
                &json!({ "subnet_id": subnet_id }),
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use axum::{
        extract::{Path, Query},
        routing::{get, put},
        Json, Router as AxumRouter,
    };
    use futures::TryStreamExt;
    use serde_json::{json, Value};
    use std::collections::HashMap;

    use super::*;
    use crate::osclients::testing;

    #[tokio::test]
    async fn networks_are_filtered_and_decoded() {
        async fn networks(Query(query): Query<HashMap<String, String>>) -> Json<Value> {
            assert_eq!(query.get("name").map(String::as_str), Some("net-a"));
            assert_eq!(query.get("tags").map(String::as_str), Some("a,b"));
            Json(json!({
                "networks": [{
                    "id": "6f8e1e0c",
                    "name": "net-a",
                    "status": "ACTIVE",
                    "router:external": true,
                    "mtu": 1450,
                    "tags": ["a", "b"],
                }],
            }))
        }

        let base = testing::serve(AxumRouter::new().route("/v2.0/networks", get(networks))).await;
        let client = NetworkingClient::new(ServiceClient::new(reqwest::Client::new(), base, "t"));

        let query = vec![
            ("name".to_string(), "net-a".to_string()),
            ("tags".to_string(), "a,b".to_string()),
        ];
        let found: Vec<Network> = client.list_networks(&query).try_collect().await.unwrap();
        assert_eq!(found.len(), 1);
        assert!(found[0].external);
        assert_eq!(found[0].mtu, Some(1450));
        assert_eq!(found[0].status, "ACTIVE");
    }

    #[tokio::test]
    async fn router_interfaces_are_added_by_subnet() {
        async fn add(Path(router): Path<String>, Json(body): Json<Value>) -> Json<Value> {
            assert_eq!(router, "r1");
            Json(json!({ "port_id": "p1", "subnet_id": body["subnet_id"] }))
        }

        let base = testing::serve(
            AxumRouter::new().route("/v2.0/routers/:id/add_router_interface", put(add)),
        )
        .await;
        let client = NetworkingClient::new(ServiceClient::new(reqwest::Client::new(), base, "t"));

        let info = client.add_router_interface("r1", "s1").await.unwrap();
        assert_eq!(info.port_id, "p1");
        assert_eq!(info.subnet_id, "s1");
    }

    #[test]
    fn disabled_gateway_serializes_as_null() {
        let opts = SubnetCreateOpts {
            network_id: "n".into(),
            ip_version: 4,
            cidr: "10.0.0.0/24".into(),
            gateway_ip: Some(None),
            ..Default::default()
        };
        let body = serde_json::to_value(&opts).unwrap();
        assert_eq!(body["gateway_ip"], Value::Null);
        assert!(body.get("name").is_none());
    }
}
