#![warn(missing_docs)]

//! TideFS data tier.
//!
//! A data node serves replicated data partitions, each backed by one
//! extent store on a local disk. The leader of a partition threads
//! create/write/delete packets through the replica chain, runs the
//! background repair loop that reconciles follower state against its
//! own, and answers the cluster controller's admin tasks.

pub mod cluster;
pub mod disk;
pub mod error;
pub mod metrics;
pub mod partition;
pub mod pipeline;
pub mod repair;
pub mod server;
pub mod service;
pub mod space;

pub use cluster::{ClusterView, StaticClusterView};
pub use disk::Disk;
pub use error::{DataNodeError, DataNodeResult};
pub use metrics::DataPartitionMetrics;
pub use partition::{DataPartition, DataPartitionMeta, PartitionStatus};
pub use pipeline::{ReplicaAck, ReplicationPipeline};
pub use repair::{compute_repair_tasks, launch_repair, MembersFileMetas};
pub use server::{DataNode, DataNodeConfig};
pub use service::{DataNodeService, READ_BLOCK_SIZE};
pub use space::SpaceManager;
