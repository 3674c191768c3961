//! File-based durable store
//!
//! Stores each agent's log as a JSON file in a directory:
//! ```text
//! conversations/
//!   builder.json
//!   reviewer.json
//! ```

use super::memory::upsert;
use super::DurableStore;
use crate::error::{ConverseError, Result};
use crate::types::{ConversationSnapshot, Message};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

pub struct FileDurableStore {
    dir: PathBuf,
    /// Serializes read-modify-write cycles
    write_lock: Mutex<()>,
}

impl FileDurableStore {
    /// Create a new file store, creating the directory if needed
    pub async fn new<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).await.map_err(|e| {
            ConverseError::Persistence(format!(
                "Failed to create conversation directory {}: {}",
                dir.display(),
                e
            ))
        })?;

        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn agent_path(&self, agent_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", encode_file_stem(agent_id)))
    }

    async fn read_log(&self, path: &Path) -> Result<Vec<Message>> {
        if !fs::try_exists(path).await? {
            return Ok(Vec::new());
        }

        let json = fs::read_to_string(path).await.map_err(|e| {
            ConverseError::Persistence(format!(
                "Failed to read conversation file {}: {}",
                path.display(),
                e
            ))
        })?;

        let snapshot: ConversationSnapshot = serde_json::from_str(&json).map_err(|e| {
            ConverseError::Persistence(format!(
                "Failed to parse conversation file {}: {}",
                path.display(),
                e
            ))
        })?;
        Ok(snapshot.messages)
    }

    async fn write_log(&self, path: &Path, messages: Vec<Message>) -> Result<()> {
        let json = serde_json::to_string_pretty(&ConversationSnapshot { messages })?;

        // Atomic write: write to temp file, then rename
        let temp_path = path.with_extension("json.tmp");
        let mut file = fs::File::create(&temp_path).await.map_err(|e| {
            ConverseError::Persistence(format!(
                "Failed to create temp file {}: {}",
                temp_path.display(),
                e
            ))
        })?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;

        fs::rename(&temp_path, path).await.map_err(|e| {
            ConverseError::Persistence(format!(
                "Failed to rename conversation file {} → {}: {}",
                temp_path.display(),
                path.display(),
                e
            ))
        })?;
        Ok(())
    }
}

/// Percent-encode everything but `[A-Za-z0-9_-]`.
///
/// Injective, so distinct agent ids never share a file, and the result
/// cannot contain separators or `..`.
fn encode_file_stem(agent_id: &str) -> String {
    let mut stem = String::with_capacity(agent_id.len());
    for byte in agent_id.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            stem.push(char::from(byte));
        } else {
            stem.push_str(&format!("%{:02X}", byte));
        }
    }
    stem
}

#[async_trait]
impl DurableStore for FileDurableStore {
    async fn load(&self, agent_id: &str) -> Result<Vec<Message>> {
        let path = self.agent_path(agent_id);
        let messages = self.read_log(&path).await?;
        tracing::debug!(agent = %agent_id, path = %path.display(), count = messages.len(), "Conversation loaded");
        Ok(messages)
    }

    async fn save(&self, agent_id: &str, message: &Message) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let path = self.agent_path(agent_id);

        let mut messages = self.read_log(&path).await?;
        upsert(&mut messages, message.clone());
        self.write_log(&path, messages).await?;

        tracing::debug!(agent = %agent_id, message_id = %message.id, "Message saved");
        Ok(())
    }

    fn backend_name(&self) -> &str {
        "file"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Role;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_file_store_save_and_load() {
        let dir = tempdir().unwrap();
        let store = FileDurableStore::new(dir.path()).await.unwrap();

        store
            .save("builder", &Message::new("msg-1", Role::User, "ls"))
            .await
            .unwrap();
        let mut reply = Message::assistant_placeholder("msg-2");
        store.save("builder", &reply).await.unwrap();
        reply.content = "Found 3 files".into();
        store.save("builder", &reply).await.unwrap();

        let log = store.load("builder").await.unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[1].content, "Found 3 files");
        assert_eq!(log[1], reply);
    }

    #[tokio::test]
    async fn test_file_store_load_missing() {
        let dir = tempdir().unwrap();
        let store = FileDurableStore::new(dir.path()).await.unwrap();
        assert!(store.load("nobody").await.unwrap().is_empty());
        assert_eq!(store.backend_name(), "file");
    }

    #[tokio::test]
    async fn test_file_store_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let store = FileDurableStore::new(dir.path()).await.unwrap();
            store
                .save("a", &Message::new("msg-1", Role::User, "persisted"))
                .await
                .unwrap();
        }
        let store = FileDurableStore::new(dir.path()).await.unwrap();
        assert_eq!(store.load("a").await.unwrap()[0].content, "persisted");
    }

    #[tokio::test]
    async fn test_file_store_path_traversal_prevention() {
        let dir = tempdir().unwrap();
        let store = FileDurableStore::new(dir.path()).await.unwrap();

        store
            .save("../../etc/evil", &Message::new("msg-1", Role::User, "x"))
            .await
            .unwrap();

        assert!(store.agent_path("../../etc/evil").starts_with(dir.path()));
        assert_eq!(store.load("../../etc/evil").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_file_store_ids_never_collide() {
        let dir = tempdir().unwrap();
        let store = FileDurableStore::new(dir.path()).await.unwrap();

        let ids = ["a/b", "a\\b", "a_b", "a%2Fb", "a..b"];
        for (i, id) in ids.iter().enumerate() {
            store
                .save(id, &Message::new(format!("msg-{}", i), Role::User, *id))
                .await
                .unwrap();
        }

        for id in ids {
            let log = store.load(id).await.unwrap();
            assert_eq!(log.len(), 1, "agent {id} shares a file");
            assert_eq!(log[0].content, id);
        }
        assert_eq!(encode_file_stem("builder-2_x"), "builder-2_x");
        assert_eq!(encode_file_stem("a/b"), "a%2Fb");
        assert_eq!(encode_file_stem("../x"), "%2E%2E%2Fx");
    }

    #[tokio::test]
    async fn test_file_store_corrupt_file() {
        let dir = tempdir().unwrap();
        let store = FileDurableStore::new(dir.path()).await.unwrap();
        std::fs::write(dir.path().join("a.json"), "not json").unwrap();

        let err = store.load("a").await.unwrap_err();
        assert!(matches!(err, ConverseError::Persistence(_)));
    }
}
