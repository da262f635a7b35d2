use crate::infrastructure::model::ModelError;
use thiserror::Error;

/// The only fatal failure inside a reasoning run. Tool failures become
/// observations the model reacts to, and memory failures are logged and
/// absorbed, so neither appears here.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Model(#[from] ModelError),
}

impl EngineError {
    pub fn user_message(&self) -> String {
        match self {
            EngineError::Model(err) => err.user_message(),
        }
    }
}
