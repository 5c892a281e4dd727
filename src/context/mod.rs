//! Hierarchical context store.
//!
//! - [`ContextVar`] a value looked up from the current task up through its ancestors
//! - [`ContextMap`] a map whose entries merge across the task chain, with tombstones
//!
//! Variables are declared as associated constants of a group type:
//!
//! ```rust
//! use taskloop::{ContextMap, ContextVar};
//!
//! pub struct DeployContext;
//!
//! impl DeployContext {
//!     pub const REGION: ContextVar<String> =
//!         ContextVar::with_default("DeployContext", "region", || "eu-west".to_string());
//!     pub const LABELS: ContextMap<String, String> = ContextMap::new("DeployContext", "labels");
//! }
//! ```

mod map;
mod var;

pub use map::{ContextMap, ContextMapView};
pub use var::{ContextVar, VarKey};

pub(crate) use var::{Slot, reset_defaults};
