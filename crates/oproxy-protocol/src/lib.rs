pub mod error;
pub mod ndjson;
pub mod ollama;
pub mod openai;
