use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::openai::types::{CompletionUsage, ListObjectType};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingsRequest {
    pub model: String,
    /// A string or an array of strings/token arrays.
    pub input: JsonValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EmbeddingObjectType {
    #[serde(rename = "embedding")]
    Embedding,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingsResponse {
    pub object: ListObjectType,
    pub data: Vec<EmbeddingObject>,
    pub model: String,
    pub usage: CompletionUsage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingObject {
    pub object: EmbeddingObjectType,
    pub index: i64,
    pub embedding: JsonValue,
}
