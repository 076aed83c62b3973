pub mod analysis_worker;
pub mod error;
pub mod execution_worker;
pub mod intake;
pub mod orchestrator;
pub mod sandbox;
pub mod scripts;
pub mod tools;

pub use analysis_worker::AnalysisHandler;
pub use error::{EngineError, Result};
pub use execution_worker::ExecutionHandler;
pub use intake::{SubmitOutcome, SubmitStatus};
pub use orchestrator::Orchestrator;
pub use sandbox::{HttpSandbox, Sandbox, SandboxError, SandboxOutcome};
pub use scripts::{FsScriptStore, ScriptStore};
