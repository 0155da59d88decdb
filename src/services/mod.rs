pub mod llm;
pub mod orchestrator;
pub mod persistence;
pub mod prompt;
pub mod setup;
