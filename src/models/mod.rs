pub mod anthropic;
pub mod canonical;
pub mod gemini;
pub mod openai;
pub mod responses;
