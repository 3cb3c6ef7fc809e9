//! Database row types for conversation state and media blobs.

use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

/// One row per conversation. `state` holds the serialized (and, when an
/// `EncryptionService` is configured, encrypted) `ConversationState`.
#[derive(Debug, Clone, FromRow)]
pub struct ConversationStateRow {
    pub conversation_id: Uuid,
    pub state: Vec<u8>,
    pub encrypted: bool,
    pub updated_at: DateTime<Utc>,
}

/// Content-addressed media blob, deduplicated by `id` (a content hash).
#[derive(Debug, Clone, FromRow)]
pub struct MediaBlobRow {
    pub id: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
    pub metadata: String,
    pub created_at: DateTime<Utc>,
}
