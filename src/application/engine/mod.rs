mod errors;
mod models;
mod runner;

pub use errors::EngineError;
pub use models::{CancelToken, EngineEvent, EngineOutcome, EngineSettings, EngineStatus};
pub use runner::ChatEngine;

#[cfg(test)]
mod tests;
