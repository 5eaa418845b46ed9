//! # vedispatch Common
//!
//! Shared utilities for the vedispatch crates.
//!
//! ## Logging
//!
//! ```rust,ignore
//! use dispatch_common::{init_logging, TimedOperation};
//!
//! init_logging("info").unwrap();
//!
//! let op = TimedOperation::start("reconcile");
//! // ...
//! op.finish();
//! ```

pub mod logging;

pub use logging::{
    init_logging,
    init_logging_json,
    TimedOperation,
};
