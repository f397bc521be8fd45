pub mod cli;
pub mod orchestrator;
