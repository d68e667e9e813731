//! Cache backend implementations
//!
//! - [`LocalBackend`]: bounded in-process cache (Moka), the L1 tier.
//! - [`RemoteBackend`]: distributed Redis cache, the L2 tier, with
//!   standalone / sentinel / cluster deployment modes.
//! - [`MultiTierCoordinator`]: L1+L2 composition with read-through,
//!   write-through and L2-failure fallback.

pub mod local;
pub mod multi_tier;
pub mod remote;

pub use local::LocalBackend;
pub use multi_tier::{MultiTierCoordinator, MultiTierStats};
pub use remote::RemoteBackend;
