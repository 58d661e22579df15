//! Typed ID definitions for broker entities.
//!
//! Each ID type has a unique prefix that identifies what it names.

use crate::define_id;

// =============================================================================
// Clients
// =============================================================================

define_id!(ClientId, "client");
define_id!(Handle, "hdl");

// =============================================================================
// Resources
// =============================================================================

define_id!(ResourceId, "res");

// =============================================================================
// Tests
// =============================================================================
