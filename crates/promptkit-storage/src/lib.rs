//! Postgres storage layer: `StateStore` and `MediaStorage` implementations,
//! plus the envelope-encryption service conversation state is optionally
//! protected with at rest.

pub mod encryption;
pub mod models;
pub mod postgres;

pub use encryption::{generate_encryption_key, EncryptedPayload, EncryptionService};
pub use models::{ConversationStateRow, MediaBlobRow};
pub use postgres::{Database, PostgresMediaStorage, PostgresStateStore};
