//! Postgres-backed `StateStore`/`MediaStorage`, grounded on the teacher's
//! `Database` wrapper (`repositories.rs`): one `PgPool`, plain
//! `sqlx::query[_as]` with positional binds rather than the compile-time
//! `query!` macro, so this crate doesn't need a live database at build time.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use uuid::Uuid;

use promptkit_contracts::StorageReference;
use promptkit_core::error::{Error, Result};
use promptkit_core::traits::{ConversationState, MediaStorage, StateStore};

use crate::encryption::EncryptionService;
use crate::models::{ConversationStateRow, MediaBlobRow};

#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn from_url(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn load_conversation_state(&self, conversation_id: Uuid) -> sqlx::Result<Option<ConversationStateRow>> {
        sqlx::query_as::<_, ConversationStateRow>(
            "SELECT conversation_id, state, encrypted, updated_at FROM conversation_states WHERE conversation_id = $1",
        )
        .bind(conversation_id)
        .fetch_optional(&self.pool)
        .await
    }

    async fn upsert_conversation_state(&self, conversation_id: Uuid, state: &[u8], encrypted: bool) -> sqlx::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO conversation_states (conversation_id, state, encrypted, updated_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (conversation_id)
            DO UPDATE SET state = EXCLUDED.state, encrypted = EXCLUDED.encrypted, updated_at = NOW()
            "#,
        )
        .bind(conversation_id)
        .bind(state)
        .bind(encrypted)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_conversation_state(&self, conversation_id: Uuid) -> sqlx::Result<()> {
        sqlx::query("DELETE FROM conversation_states WHERE conversation_id = $1")
            .bind(conversation_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_media_blob(&self, id: &str) -> sqlx::Result<Option<MediaBlobRow>> {
        sqlx::query_as::<_, MediaBlobRow>(
            "SELECT id, mime_type, bytes, metadata, created_at FROM media_blobs WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
    }

    async fn insert_media_blob(&self, id: &str, mime_type: &str, bytes: &[u8], metadata: &str) -> sqlx::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO media_blobs (id, mime_type, bytes, metadata, created_at)
            VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(id)
        .bind(mime_type)
        .bind(bytes)
        .bind(metadata)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_media_blob(&self, id: &str) -> sqlx::Result<()> {
        sqlx::query("DELETE FROM media_blobs WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// `StateStore` backed by `conversation_states`. When constructed with
/// `with_encryption`, the serialized state blob is encrypted at rest via
/// envelope encryption — conversation history can carry arbitrary user
/// content, so this is the one table in the crate that gets it.
pub struct PostgresStateStore {
    db: Database,
    encryption: Option<EncryptionService>,
}

impl PostgresStateStore {
    pub fn new(db: Database) -> Self {
        Self { db, encryption: None }
    }

    pub fn with_encryption(mut self, encryption: EncryptionService) -> Self {
        self.encryption = Some(encryption);
        self
    }
}

#[async_trait]
impl StateStore for PostgresStateStore {
    async fn load(&self, conversation_id: Uuid) -> Result<Option<ConversationState>> {
        let row = self
            .db
            .load_conversation_state(conversation_id)
            .await
            .map_err(|e| Error::transient("state_store_load", e.into()))?;
        let Some(row) = row else { return Ok(None) };

        let plaintext = if row.encrypted {
            let encryption = self
                .encryption
                .as_ref()
                .ok_or_else(|| Error::config("conversation state is encrypted but no encryption key is configured"))?;
            encryption
                .decrypt(&row.state)
                .map_err(|e| Error::transient("state_store_decrypt", e))?
        } else {
            row.state
        };

        let state = serde_json::from_slice(&plaintext)
            .map_err(|e| Error::transient("state_store_deserialize", e.into()))?;
        Ok(Some(state))
    }

    async fn save(&self, conversation_id: Uuid, state: ConversationState) -> Result<()> {
        let plaintext =
            serde_json::to_vec(&state).map_err(|e| Error::transient("state_store_serialize", e.into()))?;

        let (payload, encrypted) = match &self.encryption {
            Some(encryption) => (
                encryption
                    .encrypt(&plaintext)
                    .map_err(|e| Error::transient("state_store_encrypt", e))?,
                true,
            ),
            None => (plaintext, false),
        };

        self.db
            .upsert_conversation_state(conversation_id, &payload, encrypted)
            .await
            .map_err(|e| Error::transient("state_store_save", e.into()))
    }

    async fn delete(&self, conversation_id: Uuid) -> Result<()> {
        self.db
            .delete_conversation_state(conversation_id)
            .await
            .map_err(|e| Error::transient("state_store_delete", e.into()))
    }
}

/// `MediaStorage` backed by `media_blobs`, content-addressed by SHA-256 the
/// same way `InMemoryMediaStorage` is, so swapping between them changes
/// nothing about the `StorageReference`s a conversation accumulates.
pub struct PostgresMediaStorage {
    db: Database,
}

impl PostgresMediaStorage {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl MediaStorage for PostgresMediaStorage {
    async fn store(&self, bytes: &[u8], mime_type: &str, metadata: serde_json::Value) -> Result<StorageReference> {
        let id = hex::encode(Sha256::digest(bytes));
        let metadata_json = serde_json::to_string(&metadata).unwrap_or_else(|_| "{}".to_string());

        self.db
            .insert_media_blob(&id, mime_type, bytes, &metadata_json)
            .await
            .map_err(|e| Error::transient("media_storage_store", e.into()))?;

        let mut meta = match metadata {
            serde_json::Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        meta.insert("mime_type".into(), serde_json::Value::String(mime_type.to_string()));

        Ok(StorageReference {
            id,
            backend: "postgres".into(),
            metadata: meta,
        })
    }

    async fn retrieve(&self, reference: &StorageReference) -> Result<Vec<u8>> {
        let row = self
            .db
            .get_media_blob(&reference.id)
            .await
            .map_err(|e| Error::transient("media_storage_retrieve", e.into()))?;
        row.map(|r| r.bytes)
            .ok_or_else(|| Error::config(format!("no blob for reference {}", reference.id)))
    }

    async fn delete(&self, reference: &StorageReference) -> Result<()> {
        self.db
            .delete_media_blob(&reference.id)
            .await
            .map_err(|e| Error::transient("media_storage_delete", e.into()))
    }
}
