//! 核心层：错误与恢复、执行状态、提示词、阶段状态机、主控循环、会话监管

pub mod error;
pub mod orchestrator;
pub mod phase_runner;
pub mod prompts;
pub mod recovery;
pub mod session_supervisor;
pub mod state;

pub use error::{EngineError, RecoveryAction, StoreError};
pub use orchestrator::{AgentRunReport, Orchestrator, RunOutcome};
pub use phase_runner::{PhaseRunner, StepOutcome};
pub use recovery::RecoveryEngine;
pub use session_supervisor::SessionSupervisor;
pub use state::{AgentPhase, AgentState, ValidationStatus};
