//! Application-protocol surface for meridian nodes.
//!
//! This crate defines the protobuf wire protocol for both supported
//! application-protocol vintages, the `Abci` trait that the consensus engine
//! consumes, and the normalization helpers that lift legacy (v1) responses
//! into the v2-shaped surface.

pub mod compat;
pub mod service;

// Re-export generated protobuf types
pub mod proto {
    pub mod abci {
        pub mod v1 {
            include!("generated/meridian.abci.v1.rs");
        }
        pub mod v2 {
            include!("generated/meridian.abci.v2.rs");
        }
    }
    pub mod node {
        pub mod v1 {
            include!("generated/meridian.node.v1.rs");
        }
    }
}

pub use service::{Abci, AbciError, AbciResult};
