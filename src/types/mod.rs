//! Request and response models for the chat and fill-in-middle endpoints.

pub mod message;
pub mod request;
pub mod response;
pub mod streaming;

// Re-export commonly used types
pub use message::*;
pub use request::*;
pub use response::*;
pub use streaming::*;
