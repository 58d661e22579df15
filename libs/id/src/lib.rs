//! # rmb-id
//!
//! Opaque identifier types for the resource broker.
//!
//! ## Design Principles
//!
//! - IDs are opaque 128-bit values generated from a secure random source
//! - IDs compare by value only; they carry no ordering or timestamp meaning
//! - All IDs have a canonical string representation with strict parsing
//! - IDs are typed so a client id can never be passed where a handle is expected
//!
//! ## ID Format
//!
//! The canonical text form is `{prefix}_{uuid}`:
//! - `client_67e55044-10b1-426f-9247-bb680e5fe0c8`
//! - `hdl_0d1f6f52-7d39-4c2e-9a53-05a3e5e3f1b2`
//! - `res_8a3b1a34-3c59-4d6b-8d5c-6b16f1f0a0f7`
//!
//! On the wire the same identifiers travel as raw `u128` values, see
//! `from_u128` / `as_u128` on each type.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export uuid for consumers that need raw UUID operations
pub use uuid::Uuid;
