pub mod chat_completions;
pub mod common;
pub mod completions;
pub mod gemini;
pub mod health;
pub mod messages;
pub mod models;
pub mod responses;
