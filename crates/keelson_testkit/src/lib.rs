//! # Keelson Testkit
//!
//! Test utilities for Keelson.
//!
//! This crate provides:
//! - Engine fixtures over scripted collaborators and temp directories
//! - Property-based test generators using proptest
//! - Reusable scenarios for snapshot visibility and bulk loads
//! - Concurrency stress helpers
//!
//! ## Usage
//!
//! ```rust,ignore
//! use keelson_testkit::prelude::*;
//!
//! #[test]
//! fn commits_are_visible() {
//!     with_test_engine(|t| {
//!         let mut txn = t.begin_transaction().unwrap();
//!         t.commit(&mut txn).unwrap();
//!     });
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod scenarios;
pub mod stress;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::scenarios::*;
    pub use crate::stress::*;
}

pub use fixtures::*;
pub use generators::*;
pub use scenarios::*;
pub use stress::*;
