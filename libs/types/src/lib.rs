//! Types library for the market data subscription core
//!
//! Core type definitions shared between the feed integration and the
//! snapshot/subscription services.
//!
//! # Modules
//! - `ids`: Symbol and feed resource identifiers
//! - `interval`: Candle interval enumeration and freshness defaults
//! - `errors`: Feed and decode error taxonomy

// Public modules
pub mod ids;
pub mod interval;
pub mod errors;

// Library version constant
pub const LIB_VERSION: &str = "1.0.0";

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::ids::*;
    pub use crate::interval::*;
    pub use crate::errors::*;
}
