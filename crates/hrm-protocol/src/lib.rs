//! HRM - Core types and signaling messages
//!
//! Defines the value types shared by every layer of the hierarchical routing
//! management control plane: hierarchy levels, cluster identities, Bully
//! priorities, the six election message kinds and signed coordinator
//! credentials.

pub mod constants;
pub mod crypto;
pub mod error;
pub mod identity;
pub mod messages;
pub mod priority;

pub use constants::*;
pub use crypto::CoordinatorCredential;
pub use error::*;
pub use identity::*;
pub use messages::*;
pub use priority::*;
