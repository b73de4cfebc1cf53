//! An async client for the DeepSeek chat and fill-in-middle completion APIs.
//!
//! Both endpoints can be called single-shot or streamed. A streamed call
//! returns a [`CompletionStream`] session that decodes the server's event
//! stream one chunk at a time:
//!
//! ```no_run
//! use deepseek_client::{ChatCompletionRequest, ChatMessage, Client, DEEPSEEK_CHAT};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> Result<(), deepseek_client::Error> {
//! let client = Client::from_env()?;
//! let request = ChatCompletionRequest::new(DEEPSEEK_CHAT, vec![ChatMessage::user("Hello!")]);
//!
//! let mut stream = client
//!     .create_chat_completion_stream(&request, &CancellationToken::new())
//!     .await?;
//! while let Some(chunk) = stream.recv().await? {
//!     print!("{}", chunk.content().unwrap_or_default());
//! }
//! # Ok(())
//! # }
//! ```

pub mod accumulator;
pub mod client;
pub mod config;
pub mod error;
pub mod frame_reader;
pub mod request;
pub mod stream;
pub mod types;

// Re-export core types for easy usage
pub use accumulator::{ChatStreamAccumulator, FimStreamAccumulator};
pub use client::Client;
pub use config::{ApiType, ClientConfig};
pub use error::Error;
pub use frame_reader::FrameReader;
pub use request::RequestBuilder;
pub use stream::{
    ChatCompletionStream, CompletionStream, EndOfStreamPolicy, FimCompletionStream, StreamPayload,
};
pub use types::*;
