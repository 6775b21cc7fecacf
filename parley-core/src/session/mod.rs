//! Sessions: turn orchestration, cancellation, and the session map.

pub mod diagnostics;
pub mod interrupt;
pub mod orchestrator;
pub mod supervisor;

pub use diagnostics::{DiagnosticsSnapshot, SessionDiagnostics};
pub use interrupt::InterruptFlag;
pub use orchestrator::{ConversationOrchestrator, TurnResult, TurnState};
pub use supervisor::SessionSupervisor;
