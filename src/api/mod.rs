pub mod client;
pub mod logging;
#[cfg(test)]
pub mod mock_client;
pub mod models;
pub mod stream;

pub use client::{ApiClient, ByteStream, Completion, CompletionParams};
pub use models::{ModelList, ModelListSource, FALLBACK_MODELS};
pub use stream::{CompletionStream, StreamAssembler, StreamEvent, StreamParser};
