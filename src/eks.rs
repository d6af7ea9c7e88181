//! AWS EKS operations: cluster, add-ons, node groups, updates, insights.

pub mod addon;
pub mod client;
pub mod insights;
pub mod nodegroup;
pub mod update;
pub mod version;

pub use addon::AddonInfo;
pub use client::{ClusterInfo, EksClient};
pub use insights::{InsightFinding, InsightsSummary};
pub use nodegroup::NodeGroupInfo;
pub use update::{UpdateInfo, UpdateScope, UpdateStatus};
