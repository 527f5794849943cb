//! Typed resource snapshots.
//!
//! Each snapshot is built from one describe response and never mutated
//! afterwards. Field names are the paths expectations refer to, e.g.
//! `ip_permissions[0].from_port` on a security group.

use super::ResourceKind;
use crate::errors::{Result, VerifyError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Point-in-time read of one resource.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ResourceSnapshot {
    Vpc(VpcSnapshot),
    Subnet(SubnetSnapshot),
    SecurityGroup(SecurityGroupSnapshot),
    DatabaseInstance(DatabaseSnapshot),
    CacheCluster(CacheClusterSnapshot),
    LogGroup(LogGroupSnapshot),
    RouteTable(RouteTableSnapshot),
    InternetGateway(InternetGatewaySnapshot),
    ContainerCluster(ContainerClusterSnapshot),
}

impl ResourceSnapshot {
    pub fn kind(&self) -> ResourceKind {
        match self {
            ResourceSnapshot::Vpc(_) => ResourceKind::Vpc,
            ResourceSnapshot::Subnet(_) => ResourceKind::Subnet,
            ResourceSnapshot::SecurityGroup(_) => ResourceKind::SecurityGroup,
            ResourceSnapshot::DatabaseInstance(_) => ResourceKind::DatabaseInstance,
            ResourceSnapshot::CacheCluster(_) => ResourceKind::CacheCluster,
            ResourceSnapshot::LogGroup(_) => ResourceKind::LogGroup,
            ResourceSnapshot::RouteTable(_) => ResourceKind::RouteTable,
            ResourceSnapshot::InternetGateway(_) => ResourceKind::InternetGateway,
            ResourceSnapshot::ContainerCluster(_) => ResourceKind::ContainerCluster,
        }
    }

    /// Fields whose keys are data rather than schema.
    pub fn map_fields(&self) -> &'static [&'static str] {
        match self {
            ResourceSnapshot::Vpc(_) | ResourceSnapshot::Subnet(_) => &["tags"],
            _ => &[],
        }
    }

    /// Serialized form that field paths resolve against.
    pub fn to_json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VpcSnapshot {
    pub vpc_id: String,
    pub cidr_block: String,
    pub state: String,
    pub is_default: bool,
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubnetSnapshot {
    pub subnet_id: String,
    pub vpc_id: String,
    pub cidr_block: String,
    pub availability_zone: String,
    pub map_public_ip_on_launch: bool,
    pub available_ip_address_count: i64,
    pub tags: BTreeMap<String, String>,
}

/// One ingress or egress rule.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IpPermission {
    pub ip_protocol: String,
    pub from_port: Option<i64>,
    pub to_port: Option<i64>,
    pub cidr_ranges: Vec<String>,
    pub source_group_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SecurityGroupSnapshot {
    pub group_id: String,
    pub group_name: String,
    pub vpc_id: Option<String>,
    pub ip_permissions: Vec<IpPermission>,
    pub ip_permissions_egress: Vec<IpPermission>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatabaseSnapshot {
    pub identifier: String,
    pub engine: String,
    pub engine_version: String,
    pub instance_class: String,
    pub status: String,
    pub allocated_storage: i64,
    pub backup_retention_period: i64,
    pub multi_az: bool,
    pub storage_encrypted: bool,
    pub publicly_accessible: bool,
    pub endpoint_address: Option<String>,
    pub endpoint_port: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheClusterSnapshot {
    pub cluster_id: String,
    pub engine: String,
    pub engine_version: String,
    pub node_type: String,
    pub status: String,
    pub num_cache_nodes: i64,
    pub snapshot_retention_limit: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogGroupSnapshot {
    pub name: String,
    /// `None` when the group never expires events.
    pub retention_in_days: Option<i64>,
    pub stored_bytes: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Route {
    pub destination_cidr: Option<String>,
    pub gateway_id: Option<String>,
    pub nat_gateway_id: Option<String>,
    pub state: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteTableSnapshot {
    pub route_table_id: String,
    pub vpc_id: String,
    pub routes: Vec<Route>,
    pub associated_subnet_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InternetGatewaySnapshot {
    pub gateway_id: String,
    pub attached_vpc_ids: Vec<String>,
    pub attachment_states: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContainerClusterSnapshot {
    pub cluster_name: String,
    pub cluster_arn: String,
    pub status: String,
    pub active_services_count: i64,
    pub running_tasks_count: i64,
    pub pending_tasks_count: i64,
    pub registered_container_instances_count: i64,
}

// ----------------------------------------------------------------------------
// Describe response shapes (AWS CLI JSON output)
// ----------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AwsTag {
    key: String,
    #[serde(default)]
    value: String,
}

fn tag_map(tags: Vec<AwsTag>) -> BTreeMap<String, String> {
    tags.into_iter().map(|t| (t.key, t.value)).collect()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeVpcs {
    #[serde(default)]
    vpcs: Vec<AwsVpc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AwsVpc {
    vpc_id: String,
    cidr_block: String,
    #[serde(default)]
    state: String,
    #[serde(default)]
    is_default: bool,
    #[serde(default)]
    tags: Vec<AwsTag>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeSubnets {
    #[serde(default)]
    subnets: Vec<AwsSubnet>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AwsSubnet {
    subnet_id: String,
    vpc_id: String,
    cidr_block: String,
    #[serde(default)]
    availability_zone: String,
    #[serde(default)]
    map_public_ip_on_launch: bool,
    #[serde(default)]
    available_ip_address_count: i64,
    #[serde(default)]
    tags: Vec<AwsTag>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeSecurityGroups {
    #[serde(default)]
    security_groups: Vec<AwsSecurityGroup>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AwsSecurityGroup {
    group_id: String,
    #[serde(default)]
    group_name: String,
    #[serde(default)]
    vpc_id: Option<String>,
    #[serde(default)]
    ip_permissions: Vec<AwsIpPermission>,
    #[serde(default)]
    ip_permissions_egress: Vec<AwsIpPermission>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AwsIpPermission {
    #[serde(default)]
    ip_protocol: String,
    #[serde(default)]
    from_port: Option<i64>,
    #[serde(default)]
    to_port: Option<i64>,
    #[serde(default)]
    ip_ranges: Vec<AwsIpRange>,
    #[serde(default)]
    user_id_group_pairs: Vec<AwsGroupPair>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AwsIpRange {
    cidr_ip: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AwsGroupPair {
    #[serde(default)]
    group_id: Option<String>,
}

impl From<AwsIpPermission> for IpPermission {
    fn from(p: AwsIpPermission) -> Self {
        Self {
            ip_protocol: p.ip_protocol,
            from_port: p.from_port,
            to_port: p.to_port,
            cidr_ranges: p.ip_ranges.into_iter().map(|r| r.cidr_ip).collect(),
            source_group_ids: p
                .user_id_group_pairs
                .into_iter()
                .filter_map(|g| g.group_id)
                .collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct DescribeDbInstances {
    #[serde(rename = "DBInstances", default)]
    db_instances: Vec<AwsDbInstance>,
}

#[derive(Debug, Deserialize)]
struct AwsDbInstance {
    #[serde(rename = "DBInstanceIdentifier")]
    identifier: String,
    #[serde(rename = "Engine", default)]
    engine: String,
    #[serde(rename = "EngineVersion", default)]
    engine_version: String,
    #[serde(rename = "DBInstanceClass", default)]
    instance_class: String,
    #[serde(rename = "DBInstanceStatus", default)]
    status: String,
    #[serde(rename = "AllocatedStorage", default)]
    allocated_storage: i64,
    #[serde(rename = "BackupRetentionPeriod", default)]
    backup_retention_period: i64,
    #[serde(rename = "MultiAZ", default)]
    multi_az: bool,
    #[serde(rename = "StorageEncrypted", default)]
    storage_encrypted: bool,
    #[serde(rename = "PubliclyAccessible", default)]
    publicly_accessible: bool,
    #[serde(rename = "Endpoint", default)]
    endpoint: Option<AwsEndpoint>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AwsEndpoint {
    #[serde(default)]
    address: Option<String>,
    #[serde(default)]
    port: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeCacheClusters {
    #[serde(default)]
    cache_clusters: Vec<AwsCacheCluster>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AwsCacheCluster {
    cache_cluster_id: String,
    #[serde(default)]
    engine: String,
    #[serde(default)]
    engine_version: String,
    #[serde(default)]
    cache_node_type: String,
    #[serde(default)]
    cache_cluster_status: String,
    #[serde(default)]
    num_cache_nodes: i64,
    #[serde(default)]
    snapshot_retention_limit: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DescribeLogGroups {
    #[serde(default)]
    log_groups: Vec<AwsLogGroup>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AwsLogGroup {
    log_group_name: String,
    #[serde(default)]
    retention_in_days: Option<i64>,
    #[serde(default)]
    stored_bytes: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeRouteTables {
    #[serde(default)]
    route_tables: Vec<AwsRouteTable>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AwsRouteTable {
    route_table_id: String,
    #[serde(default)]
    vpc_id: String,
    #[serde(default)]
    routes: Vec<AwsRoute>,
    #[serde(default)]
    associations: Vec<AwsRouteAssociation>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AwsRoute {
    #[serde(default)]
    destination_cidr_block: Option<String>,
    #[serde(default)]
    gateway_id: Option<String>,
    #[serde(default)]
    nat_gateway_id: Option<String>,
    #[serde(default)]
    state: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AwsRouteAssociation {
    #[serde(default)]
    subnet_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeInternetGateways {
    #[serde(default)]
    internet_gateways: Vec<AwsInternetGateway>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AwsInternetGateway {
    internet_gateway_id: String,
    #[serde(default)]
    attachments: Vec<AwsAttachment>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AwsAttachment {
    vpc_id: String,
    #[serde(default)]
    state: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DescribeClusters {
    #[serde(default)]
    clusters: Vec<AwsEcsCluster>,
    #[serde(default)]
    failures: Vec<AwsEcsFailure>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AwsEcsCluster {
    cluster_name: String,
    #[serde(default)]
    cluster_arn: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    active_services_count: i64,
    #[serde(default)]
    running_tasks_count: i64,
    #[serde(default)]
    pending_tasks_count: i64,
    #[serde(default)]
    registered_container_instances_count: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AwsEcsFailure {
    #[serde(default)]
    arn: String,
    #[serde(default)]
    reason: String,
}

fn decode<T: DeserializeOwned>(kind: ResourceKind, raw: &serde_json::Value) -> Result<T> {
    serde_json::from_value(raw.clone()).map_err(|e| {
        VerifyError::CloudApi(format!("unexpected {kind} describe response: {e}"))
    })
}

fn single<T>(kind: ResourceKind, id: &str, items: Vec<T>) -> Result<T> {
    items
        .into_iter()
        .next()
        .ok_or_else(|| VerifyError::NotFound(format!("{kind} '{id}'")))
}

/// Build a snapshot from a raw describe response.
///
/// An empty result list means the identifier did not resolve.
pub fn parse(kind: ResourceKind, id: &str, raw: &serde_json::Value) -> Result<ResourceSnapshot> {
    let snapshot = match kind {
        ResourceKind::Vpc => {
            let resp: DescribeVpcs = decode(kind, raw)?;
            let v = single(kind, id, resp.vpcs)?;
            ResourceSnapshot::Vpc(VpcSnapshot {
                vpc_id: v.vpc_id,
                cidr_block: v.cidr_block,
                state: v.state,
                is_default: v.is_default,
                tags: tag_map(v.tags),
            })
        }
        ResourceKind::Subnet => {
            let resp: DescribeSubnets = decode(kind, raw)?;
            let s = single(kind, id, resp.subnets)?;
            ResourceSnapshot::Subnet(SubnetSnapshot {
                subnet_id: s.subnet_id,
                vpc_id: s.vpc_id,
                cidr_block: s.cidr_block,
                availability_zone: s.availability_zone,
                map_public_ip_on_launch: s.map_public_ip_on_launch,
                available_ip_address_count: s.available_ip_address_count,
                tags: tag_map(s.tags),
            })
        }
        ResourceKind::SecurityGroup => {
            let resp: DescribeSecurityGroups = decode(kind, raw)?;
            let g = single(kind, id, resp.security_groups)?;
            ResourceSnapshot::SecurityGroup(SecurityGroupSnapshot {
                group_id: g.group_id,
                group_name: g.group_name,
                vpc_id: g.vpc_id,
                ip_permissions: g.ip_permissions.into_iter().map(Into::into).collect(),
                ip_permissions_egress: g
                    .ip_permissions_egress
                    .into_iter()
                    .map(Into::into)
                    .collect(),
            })
        }
        ResourceKind::DatabaseInstance => {
            let resp: DescribeDbInstances = decode(kind, raw)?;
            let d = single(kind, id, resp.db_instances)?;
            let (endpoint_address, endpoint_port) = d
                .endpoint
                .map_or((None, None), |e| (e.address, e.port));
            ResourceSnapshot::DatabaseInstance(DatabaseSnapshot {
                identifier: d.identifier,
                engine: d.engine,
                engine_version: d.engine_version,
                instance_class: d.instance_class,
                status: d.status,
                allocated_storage: d.allocated_storage,
                backup_retention_period: d.backup_retention_period,
                multi_az: d.multi_az,
                storage_encrypted: d.storage_encrypted,
                publicly_accessible: d.publicly_accessible,
                endpoint_address,
                endpoint_port,
            })
        }
        ResourceKind::CacheCluster => {
            let resp: DescribeCacheClusters = decode(kind, raw)?;
            let c = single(kind, id, resp.cache_clusters)?;
            ResourceSnapshot::CacheCluster(CacheClusterSnapshot {
                cluster_id: c.cache_cluster_id,
                engine: c.engine,
                engine_version: c.engine_version,
                node_type: c.cache_node_type,
                status: c.cache_cluster_status,
                num_cache_nodes: c.num_cache_nodes,
                snapshot_retention_limit: c.snapshot_retention_limit,
            })
        }
        ResourceKind::LogGroup => {
            let resp: DescribeLogGroups = decode(kind, raw)?;
            // Describe filters by prefix; only an exact name is a match.
            let matching = resp
                .log_groups
                .into_iter()
                .filter(|g| g.log_group_name == id)
                .collect();
            let g = single(kind, id, matching)?;
            ResourceSnapshot::LogGroup(LogGroupSnapshot {
                name: g.log_group_name,
                retention_in_days: g.retention_in_days,
                stored_bytes: g.stored_bytes,
            })
        }
        ResourceKind::RouteTable => {
            let resp: DescribeRouteTables = decode(kind, raw)?;
            let t = single(kind, id, resp.route_tables)?;
            ResourceSnapshot::RouteTable(RouteTableSnapshot {
                route_table_id: t.route_table_id,
                vpc_id: t.vpc_id,
                routes: t
                    .routes
                    .into_iter()
                    .map(|r| Route {
                        destination_cidr: r.destination_cidr_block,
                        gateway_id: r.gateway_id,
                        nat_gateway_id: r.nat_gateway_id,
                        state: r.state,
                    })
                    .collect(),
                associated_subnet_ids: t
                    .associations
                    .into_iter()
                    .filter_map(|a| a.subnet_id)
                    .collect(),
            })
        }
        ResourceKind::InternetGateway => {
            let resp: DescribeInternetGateways = decode(kind, raw)?;
            let g = single(kind, id, resp.internet_gateways)?;
            ResourceSnapshot::InternetGateway(InternetGatewaySnapshot {
                gateway_id: g.internet_gateway_id,
                attached_vpc_ids: g.attachments.iter().map(|a| a.vpc_id.clone()).collect(),
                attachment_states: g.attachments.into_iter().map(|a| a.state).collect(),
            })
        }
        ResourceKind::ContainerCluster => {
            let resp: DescribeClusters = decode(kind, raw)?;
            if let Some(failure) = resp.failures.first() {
                if failure.reason == "MISSING" {
                    return Err(VerifyError::NotFound(format!("{kind} '{id}'")));
                }
                return Err(VerifyError::CloudApi(format!(
                    "describe {kind} '{}' failed: {}",
                    failure.arn, failure.reason
                )));
            }
            let c = single(kind, id, resp.clusters)?;
            ResourceSnapshot::ContainerCluster(ContainerClusterSnapshot {
                cluster_name: c.cluster_name,
                cluster_arn: c.cluster_arn,
                status: c.status,
                active_services_count: c.active_services_count,
                running_tasks_count: c.running_tasks_count,
                pending_tasks_count: c.pending_tasks_count,
                registered_container_instances_count: c.registered_container_instances_count,
            })
        }
    };

    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    #![allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::indexing_slicing,
        clippy::panic
    )]

    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_vpc() {
        let raw = json!({"Vpcs": [{
            "VpcId": "vpc-0abc",
            "CidrBlock": "10.0.0.0/16",
            "State": "available",
            "IsDefault": false,
            "Tags": [{"Key": "Name", "Value": "main"}]
        }]});

        let snapshot = parse(ResourceKind::Vpc, "vpc-0abc", &raw).unwrap();
        let ResourceSnapshot::Vpc(vpc) = &snapshot else {
            panic!("expected VPC snapshot, got {snapshot:?}");
        };
        assert_eq!(vpc.cidr_block, "10.0.0.0/16");
        assert_eq!(vpc.tags["Name"], "main");
        assert_eq!(snapshot.kind(), ResourceKind::Vpc);
    }

    #[test]
    fn test_empty_result_is_not_found() {
        let err = parse(ResourceKind::Subnet, "subnet-1", &json!({"Subnets": []})).unwrap_err();
        assert!(matches!(err, VerifyError::NotFound(ref m) if m.contains("subnet-1")));
    }

    #[test]
    fn test_parse_security_group_rules() {
        let raw = json!({"SecurityGroups": [{
            "GroupId": "sg-1",
            "GroupName": "rds",
            "VpcId": "vpc-0abc",
            "IpPermissions": [{
                "IpProtocol": "tcp",
                "FromPort": 5432,
                "ToPort": 5432,
                "IpRanges": [],
                "UserIdGroupPairs": [{"GroupId": "sg-ecs", "UserId": "123"}]
            }],
            "IpPermissionsEgress": [{"IpProtocol": "-1", "IpRanges": [{"CidrIp": "0.0.0.0/0"}]}]
        }]});

        let json = parse(ResourceKind::SecurityGroup, "sg-1", &raw)
            .unwrap()
            .to_json()
            .unwrap();

        assert_eq!(json["ip_permissions"][0]["from_port"], 5432);
        assert_eq!(json["ip_permissions"][0]["source_group_ids"][0], "sg-ecs");
        assert_eq!(json["ip_permissions_egress"][0]["from_port"], serde_json::Value::Null);
        assert_eq!(json["ip_permissions_egress"][0]["cidr_ranges"][0], "0.0.0.0/0");
    }

    #[test]
    fn test_parse_database_instance() {
        let raw = json!({"DBInstances": [{
            "DBInstanceIdentifier": "app-db",
            "Engine": "postgres",
            "EngineVersion": "15.4",
            "DBInstanceClass": "db.t3.micro",
            "DBInstanceStatus": "available",
            "AllocatedStorage": 20,
            "BackupRetentionPeriod": 7,
            "MultiAZ": false,
            "StorageEncrypted": true,
            "PubliclyAccessible": false,
            "Endpoint": {"Address": "app-db.x.us-east-1.rds.amazonaws.com", "Port": 5432}
        }]});

        let json = parse(ResourceKind::DatabaseInstance, "app-db", &raw)
            .unwrap()
            .to_json()
            .unwrap();

        assert_eq!(json["status"], "available");
        assert_eq!(json["backup_retention_period"], 7);
        assert_eq!(json["endpoint_port"], 5432);
    }

    #[test]
    fn test_log_group_requires_exact_name() {
        let raw = json!({"logGroups": [
            {"logGroupName": "/ecs/app-worker", "retentionInDays": 7, "storedBytes": 0},
            {"logGroupName": "/ecs/app", "retentionInDays": 30, "storedBytes": 1024}
        ]});

        let json = parse(ResourceKind::LogGroup, "/ecs/app", &raw)
            .unwrap()
            .to_json()
            .unwrap();
        assert_eq!(json["retention_in_days"], 30);

        let err = parse(ResourceKind::LogGroup, "/ecs/ap", &raw).unwrap_err();
        assert!(matches!(err, VerifyError::NotFound(_)));
    }

    #[test]
    fn test_parse_route_table_and_gateway() {
        let raw = json!({"RouteTables": [{
            "RouteTableId": "rtb-1",
            "VpcId": "vpc-0abc",
            "Routes": [
                {"DestinationCidrBlock": "10.0.0.0/16", "GatewayId": "local", "State": "active"},
                {"DestinationCidrBlock": "0.0.0.0/0", "GatewayId": "igw-1", "State": "active"}
            ],
            "Associations": [{"SubnetId": "subnet-1"}, {"Main": true}]
        }]});
        let json = parse(ResourceKind::RouteTable, "rtb-1", &raw)
            .unwrap()
            .to_json()
            .unwrap();
        assert_eq!(json["routes"].as_array().unwrap().len(), 2);
        assert_eq!(json["associated_subnet_ids"], json!(["subnet-1"]));

        let raw = json!({"InternetGateways": [{
            "InternetGatewayId": "igw-1",
            "Attachments": [{"VpcId": "vpc-0abc", "State": "available"}]
        }]});
        let json = parse(ResourceKind::InternetGateway, "vpc-0abc", &raw)
            .unwrap()
            .to_json()
            .unwrap();
        assert_eq!(json["attached_vpc_ids"], json!(["vpc-0abc"]));
    }

    #[test]
    fn test_missing_ecs_cluster_is_not_found() {
        let raw = json!({
            "clusters": [],
            "failures": [{"arn": "arn:aws:ecs:us-east-1:123:cluster/app", "reason": "MISSING"}]
        });
        let err = parse(ResourceKind::ContainerCluster, "app", &raw).unwrap_err();
        assert!(matches!(err, VerifyError::NotFound(_)));

        let raw = json!({"clusters": [{
            "clusterName": "app",
            "clusterArn": "arn:aws:ecs:us-east-1:123:cluster/app",
            "status": "ACTIVE",
            "activeServicesCount": 1,
            "runningTasksCount": 2
        }]});
        let json = parse(ResourceKind::ContainerCluster, "app", &raw)
            .unwrap()
            .to_json()
            .unwrap();
        assert_eq!(json["status"], "ACTIVE");
        assert_eq!(json["pending_tasks_count"], 0);
    }

    #[test]
    fn test_malformed_response_is_cloud_api_error() {
        let err = parse(ResourceKind::Vpc, "vpc-1", &json!({"Vpcs": "nope"})).unwrap_err();
        assert!(matches!(err, VerifyError::CloudApi(_)));
    }
}
