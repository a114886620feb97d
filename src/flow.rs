//! Conversation data model
//!
//! Session → dialog turn → model round → flow item. Only the session
//! manager mutates this tree; everyone else works on clones.

pub mod item;
pub mod params;
pub mod round;
pub mod session;
pub mod turn;

pub use item::{FlowItem, ImageAnalysisItem, ItemStatus, TextItem, TextKind, ToolCall, ToolItem, ToolResult};
pub use params::{ParamsBuffer, ParamsState};
pub use round::{ModelRound, RoundStatus};
pub use session::{derive_status, Session, SessionConfig, SessionStatus};
pub use turn::{
    DialogTurn, ImageAnalysisOutcome, ImageAnalysisPhase, ImageAttachment, TokenUsage, TurnStatus,
    UserMessage,
};
