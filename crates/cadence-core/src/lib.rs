//! # Cadence Core
//!
//! Primitives shared by every Cadence crate:
//! - [`ErrorClass`] / [`Classify`]: the error taxonomy retry, breaker and
//!   queue layers agree on
//! - [`Clock`]: injectable wall clock ([`SystemClock`], [`ManualClock`])
//! - [`Shutdown`]: cooperative shutdown signal for background loops

pub mod clock;
pub mod error;
pub mod shutdown;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use error::{Classify, ErrorClass};
pub use shutdown::Shutdown;
