//! Flowchat - conversation orchestration core for an IDE assistant
//!
//! Turns a stream of model fragments into per-session conversation trees,
//! gates tool calls on user confirmation, and rolls the workspace back to
//! earlier turns.

#![allow(clippy::must_use_candidate)] // accessor-heavy API, callers decide
#![allow(clippy::missing_errors_doc)] // error enums document their variants
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::module_name_repetitions)]

pub mod bus;
pub mod config;
pub mod confirmation;
pub mod dispatcher;
pub mod flow;
pub mod replay;
pub mod retry_queue;
pub mod rollback;
pub mod runtime;
pub mod session_manager;
pub mod state_machine;
pub mod stream;

pub use bus::{CoreEvent, EventBus};
pub use config::CoreConfig;
pub use runtime::{Collaborators, CoreRuntime, Inbound};
