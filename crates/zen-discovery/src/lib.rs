//! # zen-discovery
//!
//! Unicast peer discovery, deterministic master election, membership, and a
//! single-writer cluster-state publish loop, modeled on Elasticsearch's Zen
//! Discovery.
//!
//! ## Architecture overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       DiscoveryController                    │
//! ├──────────────────────────────────────────────────────────────┤
//! │  ping (unicast gossip)  →  find_master()  →  join / elect     │
//! │                                                                │
//! │  ClusterStateService (single-writer executor)                 │
//! │    ├── membership: join / leave                               │
//! │    ├── publish: master → followers, pending_states on follower│
//! │    ├── fault_detection: MasterFD (follower), NodesFD (master) │
//! │    └── rejoin: split-brain / quorum-loss surrender             │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core components
//!
//! - **Unicast discovery**: [`ping`] fires timed ping waves against seed
//!   hosts, dynamic [`ping::UnicastHostsProvider`]s, and gossiped peers.
//! - **Election**: [`elect_master`] is a pure `(version, id)` tie-break.
//! - **Membership**: [`membership`] implements join/leave RPCs.
//! - **Cluster state**: [`cluster_state`] and [`cluster_state_service`]
//!   hold the immutable state snapshot and its single-writer executor.
//! - **Fault detection**: [`fault_detection`] runs `MasterFaultDetection`
//!   (follower-side) and `NodesFaultDetection` (master-side).
//! - **Transport**: [`transport`] defines the `Transport` trait this crate
//!   depends on; a production binary supplies the real implementation.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use zen_discovery::{ClusterConfig, DiscoveryController};
//! use zen_discovery::node::NodeDescriptor;
//! use zen_discovery::transport::{InProcessTransport, TransportHub, Transport};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let hub = TransportHub::new();
//! let local = NodeDescriptor::new("node-1", "127.0.0.1:9300".parse()?);
//! let transport = InProcessTransport::register(local.id.clone(), local.address, hub).await;
//!
//! let config = ClusterConfig::builder()
//!     .cluster_name("prod")
//!     .unicast_hosts(vec!["127.0.0.1:9300".into(), "127.0.0.1:9301".into()])
//!     .build()?;
//!
//! let controller = DiscoveryController::start(local, config, transport as Arc<dyn Transport>, Vec::new()).await;
//! let _state = controller.current_state();
//! # Ok(())
//! # }
//! ```

pub mod cluster_state;
pub mod cluster_state_service;
pub mod cluster_state_task;
pub mod config;
pub mod discovery;
pub mod elect_master;
pub mod error;
pub mod fault_detection;
pub mod membership;
pub mod node;
pub mod ping;
pub mod publish;
pub mod transport;

pub use cluster_state::{ClusterBlocks, ClusterState, Metadata, NO_MASTER_BLOCK};
pub use config::ClusterConfig;
pub use discovery::{AckOutcome, ConfigUpdate, DiscoveryController};
pub use elect_master::ElectionFilter;
pub use error::{ClusterError, ClusterResult};
pub use node::{NodeDescriptor, NodeId, NodeRoles, NodeSet};
