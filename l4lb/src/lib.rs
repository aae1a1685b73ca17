//! Control plane of an L4 load balancer.
//!
//! [`LoadBalancer`] owns VIPs, the Real pool and the explicit routing tables,
//! and publishes an immutable [`Tables`] generation after every change.
//! [`Datapath`] is a userspace reader of those tables.

pub mod config;
pub mod datapath;
pub mod down;
pub mod error;
pub mod hash;
pub mod lb;
pub mod publish;
pub mod quic;
pub mod reals;
pub mod src_routing;
pub mod stats;
pub mod vip;

pub use config::{provision, Config, LbConfig};
pub use datapath::{Datapath, Packet, Verdict};
pub use error::{LbError, LbResult};
pub use lb::{AddOutcome, LoadBalancer, ModifyAction, NewReal};
pub use publish::{Publisher, SharedTables, Tables};
