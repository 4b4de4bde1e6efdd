//! Cloud Block Storage CSI Driver Library
//!
//! Kubernetes CSI driver that provisions block volumes on a remote
//! block-storage backend and attaches them to compute nodes.
//!
//! This library provides:
//! - CSI Identity, Controller, and Node service implementations
//! - The backend volume client abstraction and its gRPC agent implementation
//! - The volume identity registry that makes CreateVolume idempotent
//! - Transport wiring for unix socket and TCP endpoints

/// CSI proto generated types
pub mod csi {
    tonic::include_proto!("csi.v1");
}

/// Block agent proto generated types (client)
pub mod agent {
    tonic::include_proto!("block_agent.v1");
}

pub mod agent_client;
pub mod backend;
pub mod capacity;
pub mod config;
pub mod controller;
pub mod driver;
pub mod identity;
pub mod metrics;
pub mod node;
pub mod registry;
pub mod server;
pub mod types;

pub use agent_client::AgentBackend;
pub use backend::{BackendError, MemoryBackend, VolumeBackend};
pub use controller::ControllerService;
pub use driver::{Driver, DriverInfo};
pub use identity::IdentityService;
pub use node::NodeService;
pub use registry::VolumeRegistry;
