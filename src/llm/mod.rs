//! LLM integration.
//!
//! An OpenAI-compatible chat client used by the vision quality scorer.
//!
//! ```ignore
//! use reelforge::llm::{ChatClient, ChatRequest, LlmProvider, Message};
//!
//! let client = ChatClient::new("http://localhost:4000/v1", None, "vision-model", timeout)?;
//! let request = ChatRequest::new("", vec![Message::user_with_image("Rate this", data_url)]);
//! let response = client.generate(request).await?;
//! ```

pub mod client;

pub use crate::error::LlmError;
pub use client::{
    ChatClient, ChatRequest, ChatResponse, Choice, ContentPart, ImageUrl, LlmProvider, Message,
    MessageContent,
};
