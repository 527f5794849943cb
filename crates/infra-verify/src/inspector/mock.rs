//! Mock cloud API for testing.
//!
//! Serves canned describe responses keyed by kind and identifier. The
//! `aws_*` helpers build responses in the shape the AWS CLI prints, so the
//! same snapshot parsing runs as in production.

use super::{CloudApi, ResourceKind};
use crate::errors::{Result, VerifyError};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

type Key = (ResourceKind, String);

/// In-memory cloud API.
#[derive(Default)]
pub struct MockCloudApi {
    resources: HashMap<Key, Value>,
    /// Remaining transient failures per resource, consumed before success.
    transient_failures: Mutex<HashMap<Key, u32>>,
    /// Resources that fail permanently with `CloudApi`.
    broken: HashMap<Key, String>,
    calls: Mutex<HashMap<Key, usize>>,
}

impl MockCloudApi {
    /// An API with no resources; every describe is `NotFound`.
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_resource(mut self, kind: ResourceKind, id: &str, raw: Value) -> Self {
        self.resources.insert((kind, id.to_string()), raw);
        self
    }

    /// The next `times` describes of this resource fail with a throttling
    /// error.
    #[must_use]
    pub fn with_transient_failures(self, kind: ResourceKind, id: &str, times: u32) -> Self {
        self.transient_failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((kind, id.to_string()), times);
        self
    }

    /// Every describe of this resource fails with a non-retryable error.
    #[must_use]
    pub fn with_permanent_failure(
        mut self,
        kind: ResourceKind,
        id: &str,
        message: impl Into<String>,
    ) -> Self {
        self.broken.insert((kind, id.to_string()), message.into());
        self
    }

    /// Describes issued for one resource.
    pub fn call_count(&self, kind: ResourceKind, id: &str) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(kind, id.to_string()))
            .copied()
            .unwrap_or(0)
    }

    /// Describes issued across all resources.
    pub fn total_calls(&self) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .sum()
    }
}

#[async_trait::async_trait]
impl CloudApi for MockCloudApi {
    async fn describe(&self, kind: ResourceKind, id: &str, _region: &str) -> Result<Value> {
        let key = (kind, id.to_string());

        *self
            .calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.clone())
            .or_insert(0) += 1;

        {
            let mut failures = self
                .transient_failures
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(left) = failures.get_mut(&key) {
                if *left > 0 {
                    *left -= 1;
                    return Err(VerifyError::TransientApi(format!(
                        "describe {kind} '{id}': Throttling: Rate exceeded"
                    )));
                }
            }
        }

        if let Some(message) = self.broken.get(&key) {
            return Err(VerifyError::CloudApi(format!("describe {kind} '{id}': {message}")));
        }

        self.resources
            .get(&key)
            .cloned()
            .ok_or_else(|| VerifyError::NotFound(format!("{kind} '{id}'")))
    }
}

// ----------------------------------------------------------------------------
// Describe response builders
// ----------------------------------------------------------------------------

pub fn aws_vpc(id: &str, cidr: &str) -> Value {
    json!({"Vpcs": [{
        "VpcId": id,
        "CidrBlock": cidr,
        "State": "available",
        "IsDefault": false,
        "Tags": []
    }]})
}

pub fn aws_subnet(id: &str, vpc_id: &str, cidr: &str, public: bool) -> Value {
    json!({"Subnets": [{
        "SubnetId": id,
        "VpcId": vpc_id,
        "CidrBlock": cidr,
        "AvailabilityZone": "us-east-1a",
        "MapPublicIpOnLaunch": public,
        "AvailableIpAddressCount": 251,
        "Tags": []
    }]})
}

/// Security group with one TCP ingress rule per `(from, to)` port pair and
/// the default allow-all egress rule.
pub fn aws_security_group(id: &str, ingress_ports: &[(i64, i64)]) -> Value {
    let ingress: Vec<Value> = ingress_ports
        .iter()
        .map(|(from, to)| {
            json!({
                "IpProtocol": "tcp",
                "FromPort": from,
                "ToPort": to,
                "IpRanges": [{"CidrIp": "10.0.0.0/16"}],
                "UserIdGroupPairs": []
            })
        })
        .collect();

    json!({"SecurityGroups": [{
        "GroupId": id,
        "GroupName": id,
        "VpcId": "vpc-0abc",
        "IpPermissions": ingress,
        "IpPermissionsEgress": [{"IpProtocol": "-1", "IpRanges": [{"CidrIp": "0.0.0.0/0"}]}]
    }]})
}

pub fn aws_db_instance(id: &str, status: &str, backup_retention_days: i64) -> Value {
    json!({"DBInstances": [{
        "DBInstanceIdentifier": id,
        "Engine": "postgres",
        "EngineVersion": "15.4",
        "DBInstanceClass": "db.t3.micro",
        "DBInstanceStatus": status,
        "AllocatedStorage": 20,
        "BackupRetentionPeriod": backup_retention_days,
        "MultiAZ": false,
        "StorageEncrypted": true,
        "PubliclyAccessible": false,
        "Endpoint": {"Address": format!("{id}.abc123.us-east-1.rds.amazonaws.com"), "Port": 5432}
    }]})
}

pub fn aws_cache_cluster(id: &str, status: &str) -> Value {
    json!({"CacheClusters": [{
        "CacheClusterId": id,
        "Engine": "redis",
        "EngineVersion": "7.0.7",
        "CacheNodeType": "cache.t3.micro",
        "CacheClusterStatus": status,
        "NumCacheNodes": 1,
        "SnapshotRetentionLimit": 0
    }]})
}

pub fn aws_log_group(name: &str, retention_in_days: Option<i64>) -> Value {
    let mut group = json!({"logGroupName": name, "storedBytes": 0});
    if let (Some(days), Some(obj)) = (retention_in_days, group.as_object_mut()) {
        obj.insert("retentionInDays".to_string(), json!(days));
    }
    json!({"logGroups": [group]})
}

/// Route table with the implicit local route plus a default route through
/// `gateway_id`.
pub fn aws_route_table(id: &str, vpc_id: &str, gateway_id: &str) -> Value {
    json!({"RouteTables": [{
        "RouteTableId": id,
        "VpcId": vpc_id,
        "Routes": [
            {"DestinationCidrBlock": "10.0.0.0/16", "GatewayId": "local", "State": "active"},
            {"DestinationCidrBlock": "0.0.0.0/0", "GatewayId": gateway_id, "State": "active"}
        ],
        "Associations": []
    }]})
}

pub fn aws_internet_gateway(id: &str, vpc_id: &str) -> Value {
    json!({"InternetGateways": [{
        "InternetGatewayId": id,
        "Attachments": [{"VpcId": vpc_id, "State": "available"}]
    }]})
}

pub fn aws_ecs_cluster(name: &str) -> Value {
    json!({"clusters": [{
        "clusterName": name,
        "clusterArn": format!("arn:aws:ecs:us-east-1:123456789012:cluster/{name}"),
        "status": "ACTIVE",
        "activeServicesCount": 1,
        "runningTasksCount": 1,
        "pendingTasksCount": 0,
        "registeredContainerInstancesCount": 0
    }], "failures": []})
}
