//! Core types shared across the tabletd workspace.
//!
//! This crate carries the pieces every other crate needs:
//!
//! - [`error`]: the workspace error type and its error kinds
//! - [`position`]: GTID set arithmetic and flavor-tagged replication positions
//! - [`types`]: tablet identity (alias, target, tablet type)

pub mod error;
pub mod position;
pub mod types;

pub use error::{ErrorKind, Result, TabletError};
pub use position::{Flavor, Gtid, GtidSet, Position};
pub use types::{TabletAlias, TabletType, Target};
