//! Node Manager CRD Definitions
//!
//! Resource types read and written by the node manager controller, plus the
//! well-known labels and annotations it keys on.

pub mod conditions;
pub mod instance;
pub mod node_group;
pub mod well_known;

pub use conditions::*;
pub use instance::*;
pub use node_group::*;
