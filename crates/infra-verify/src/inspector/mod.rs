//! Resource inspector.
//!
//! Reads live resource state through [`CloudApi`] and turns it into typed
//! [`ResourceSnapshot`]s. Every call is a pure read. Transient failures are
//! retried with exponential backoff bounded by the configured
//! [`RetryPolicy`].

pub mod aws;
pub mod mock;
pub mod retry;
pub mod snapshot;

pub use aws::AwsCli;
pub use snapshot::ResourceSnapshot;

use crate::config::RetryPolicy;
use crate::errors::Result;
use serde::{Deserialize, Serialize};
use snapshot::{
    CacheClusterSnapshot, ContainerClusterSnapshot, DatabaseSnapshot, InternetGatewaySnapshot,
    LogGroupSnapshot, RouteTableSnapshot, SecurityGroupSnapshot, SubnetSnapshot, VpcSnapshot,
};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Kinds of resources the inspector can read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Vpc,
    Subnet,
    SecurityGroup,
    DatabaseInstance,
    CacheCluster,
    LogGroup,
    RouteTable,
    /// Looked up by gateway id, or by the id of the VPC it is attached to.
    InternetGateway,
    ContainerCluster,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Vpc => "vpc",
            ResourceKind::Subnet => "subnet",
            ResourceKind::SecurityGroup => "security_group",
            ResourceKind::DatabaseInstance => "database_instance",
            ResourceKind::CacheCluster => "cache_cluster",
            ResourceKind::LogGroup => "log_group",
            ResourceKind::RouteTable => "route_table",
            ResourceKind::InternetGateway => "internet_gateway",
            ResourceKind::ContainerCluster => "container_cluster",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Seam to the cloud provider's read API.
///
/// Returns the raw describe response for one resource. Implementations
/// classify failures into `NotFound`, `TransientApi` and `CloudApi`.
#[async_trait::async_trait]
pub trait CloudApi: Send + Sync {
    async fn describe(
        &self,
        kind: ResourceKind,
        id: &str,
        region: &str,
    ) -> Result<serde_json::Value>;
}

/// Typed, retrying reads over a [`CloudApi`].
#[derive(Clone)]
pub struct ResourceInspector {
    api: Arc<dyn CloudApi>,
    policy: RetryPolicy,
}

impl ResourceInspector {
    pub fn new(api: Arc<dyn CloudApi>, policy: RetryPolicy) -> Self {
        Self { api, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Read any resource kind.
    pub async fn inspect(
        &self,
        kind: ResourceKind,
        id: &str,
        region: &str,
    ) -> Result<ResourceSnapshot> {
        let operation = format!("describe {kind} {id}");

        let raw = retry::retry_transient(&self.policy, &operation, || {
            self.api.describe(kind, id, region)
        })
        .await?;

        let snapshot = snapshot::parse(kind, id, &raw)?;

        debug!(
            target: "infra_verify.inspector",
            kind = %kind,
            id = %id,
            region = %region,
            "Snapshot taken"
        );

        Ok(snapshot)
    }

    pub async fn vpc(&self, id: &str, region: &str) -> Result<VpcSnapshot> {
        match self.inspect(ResourceKind::Vpc, id, region).await? {
            ResourceSnapshot::Vpc(s) => Ok(s),
            other => Err(kind_mismatch(ResourceKind::Vpc, &other)),
        }
    }

    pub async fn subnet(&self, id: &str, region: &str) -> Result<SubnetSnapshot> {
        match self.inspect(ResourceKind::Subnet, id, region).await? {
            ResourceSnapshot::Subnet(s) => Ok(s),
            other => Err(kind_mismatch(ResourceKind::Subnet, &other)),
        }
    }

    pub async fn security_group(&self, id: &str, region: &str) -> Result<SecurityGroupSnapshot> {
        match self.inspect(ResourceKind::SecurityGroup, id, region).await? {
            ResourceSnapshot::SecurityGroup(s) => Ok(s),
            other => Err(kind_mismatch(ResourceKind::SecurityGroup, &other)),
        }
    }

    pub async fn database_instance(&self, id: &str, region: &str) -> Result<DatabaseSnapshot> {
        match self.inspect(ResourceKind::DatabaseInstance, id, region).await? {
            ResourceSnapshot::DatabaseInstance(s) => Ok(s),
            other => Err(kind_mismatch(ResourceKind::DatabaseInstance, &other)),
        }
    }

    pub async fn cache_cluster(&self, id: &str, region: &str) -> Result<CacheClusterSnapshot> {
        match self.inspect(ResourceKind::CacheCluster, id, region).await? {
            ResourceSnapshot::CacheCluster(s) => Ok(s),
            other => Err(kind_mismatch(ResourceKind::CacheCluster, &other)),
        }
    }

    pub async fn log_group(&self, name: &str, region: &str) -> Result<LogGroupSnapshot> {
        match self.inspect(ResourceKind::LogGroup, name, region).await? {
            ResourceSnapshot::LogGroup(s) => Ok(s),
            other => Err(kind_mismatch(ResourceKind::LogGroup, &other)),
        }
    }

    pub async fn route_table(&self, id: &str, region: &str) -> Result<RouteTableSnapshot> {
        match self.inspect(ResourceKind::RouteTable, id, region).await? {
            ResourceSnapshot::RouteTable(s) => Ok(s),
            other => Err(kind_mismatch(ResourceKind::RouteTable, &other)),
        }
    }

    pub async fn internet_gateway(
        &self,
        id_or_vpc_id: &str,
        region: &str,
    ) -> Result<InternetGatewaySnapshot> {
        match self
            .inspect(ResourceKind::InternetGateway, id_or_vpc_id, region)
            .await?
        {
            ResourceSnapshot::InternetGateway(s) => Ok(s),
            other => Err(kind_mismatch(ResourceKind::InternetGateway, &other)),
        }
    }

    pub async fn container_cluster(
        &self,
        name: &str,
        region: &str,
    ) -> Result<ContainerClusterSnapshot> {
        match self
            .inspect(ResourceKind::ContainerCluster, name, region)
            .await?
        {
            ResourceSnapshot::ContainerCluster(s) => Ok(s),
            other => Err(kind_mismatch(ResourceKind::ContainerCluster, &other)),
        }
    }
}

fn kind_mismatch(expected: ResourceKind, got: &ResourceSnapshot) -> crate::errors::VerifyError {
    crate::errors::VerifyError::CloudApi(format!(
        "expected {expected} snapshot, got {}",
        got.kind()
    ))
}
