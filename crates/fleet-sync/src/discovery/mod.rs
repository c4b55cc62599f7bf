//! `DiscoveryClient`: one trait, two cloud backends behind it (§6.1).

pub mod aws;
pub mod azure;

use async_trait::async_trait;
use fleet_types::Instance;

use crate::error::DiscoveryError;

/// Enumerates running compute instances the caller has permission to see.
/// Deduplication across overlapping enumeration paths (e.g. plain-EC2 vs ASG
/// membership) is the implementation's responsibility.
#[async_trait]
pub trait DiscoveryClient: Send + Sync {
    async fn discover_all(&self) -> Result<Vec<Instance>, DiscoveryError>;
}

pub use aws::Ec2DiscoveryClient;
pub use azure::AzureDiscoveryClient;
