//! Built-in provider backends.
//!
//! Vendor wire protocols live outside this crate; they plug in by
//! implementing [`Provider`](crate::Provider) and registering a factory with
//! the [`ProviderRegistry`](crate::ProviderRegistry). The simulated backend
//! here drives dry runs and tests.

/// Deterministic in-process provider.
pub mod simulated;

pub use simulated::{SimulatedFailure, SimulatedProvider};
