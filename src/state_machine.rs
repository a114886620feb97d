//! Conversation state machine
//!
//! Events go in, the session tree changes, effects come out. Nothing in here
//! performs I/O; the runtime executes the effects.

mod effect;
pub mod event;
pub(crate) mod transition;


pub use effect::Effect;
pub use event::SessionEvent;
pub use transition::{transition, ApplyError, TransitionResult};
