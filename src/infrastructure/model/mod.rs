mod openai;
mod traits;
mod types;

pub use openai::OpenAiClient;
pub use traits::ModelClient;
pub use types::{GenerateRequest, ModelError, ModelTurn};
