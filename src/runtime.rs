//! Runtime wiring
//!
//! [`CoreRuntime`] owns the session manager, the confirmation gate, the
//! event bus and the collaborators, and drives them from a single inbox.

mod executor;
pub mod traits;

#[cfg(test)]
pub mod testing;

pub use executor::{CoreContext, CoreRuntime, Inbound, RetryAttempt};
pub use traits::*;
