//! File-backed chat store.
//!
//! One JSON file per chat under the chats directory. Writes go to a sibling
//! temp file and are renamed into place. Every read-modify-write holds the
//! chat's async lock and a `<id>.lock` file created exclusively, so
//! updates to one chat never interleave, even across processes.

use super::{now_unix_millis, ChatData, ChatMessage};
use crate::error::StoreError;
use crate::operation::ChatMode;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};

const CHAT_FILE_EXT: &str = "json";
const CHAT_FILE_VERSION: u32 = 1;
const LOCK_FILE_EXT: &str = "lock";
/// A lock file older than this is left over from a dead process.
const STALE_LOCK_AFTER: Duration = Duration::from_secs(30);
const LOCK_WAIT: Duration = Duration::from_secs(10);
const LOCK_POLL: Duration = Duration::from_millis(10);

/// Listing metadata for `steward chats`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatSummary {
    pub id: String,
    pub mode: ChatMode,
    pub messages: usize,
    pub updated_at_millis: u64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedChat {
    version: u32,
    updated_at_millis: u64,
    chat: ChatData,
}

#[derive(Debug, Clone)]
pub struct ChatStore {
    chats_dir: PathBuf,
    default_mode: ChatMode,
    locks: Arc<StdMutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl ChatStore {
    /// Open/create a store in `chats_dir`. New chats start in `default_mode`.
    pub fn open(chats_dir: impl AsRef<Path>, default_mode: ChatMode) -> Result<Self, StoreError> {
        let chats_dir = chats_dir.as_ref().to_path_buf();
        fs::create_dir_all(&chats_dir)?;
        Ok(Self {
            chats_dir,
            default_mode,
            locks: Arc::new(StdMutex::new(HashMap::new())),
        })
    }

    pub fn default_mode(&self) -> ChatMode {
        self.default_mode
    }

    /// Allocate and persist a new empty chat.
    pub async fn create_chat(&self, mode: Option<ChatMode>) -> Result<String, StoreError> {
        for _ in 0..64 {
            let chat_id = generate_chat_id();
            if self.chat_path(&chat_id).exists() {
                continue;
            }
            let _guard = self.lock(&chat_id).await;
            let _file_lock = ChatFileLock::acquire(&chat_id, self.lock_path(&chat_id)).await?;
            self.save(&ChatData::new(&chat_id, mode.unwrap_or(self.default_mode)))?;
            return Ok(chat_id);
        }
        Err(StoreError::InvalidChatId(
            "failed to allocate a unique chat id".to_string(),
        ))
    }

    pub fn exists(&self, chat_id: &str) -> bool {
        validate_chat_id(chat_id).is_ok() && self.chat_path(chat_id).exists()
    }

    /// Load a chat. A chat that was never saved loads as empty.
    pub fn load(&self, chat_id: &str) -> Result<ChatData, StoreError> {
        validate_chat_id(chat_id)?;
        let path = self.chat_path(chat_id);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(ChatData::new(chat_id, self.default_mode));
            }
            Err(e) => return Err(e.into()),
        };
        let payload: PersistedChat = serde_json::from_str(&raw)?;
        if payload.version != CHAT_FILE_VERSION {
            return Err(StoreError::UnsupportedVersion(payload.version));
        }
        Ok(payload.chat)
    }

    pub fn messages(&self, chat_id: &str) -> Result<Vec<ChatMessage>, StoreError> {
        Ok(self.load(chat_id)?.messages)
    }

    /// Begin a serialized read-modify-write of one chat.
    ///
    /// The chat stays locked until the transaction is committed or dropped;
    /// dropping without `commit` discards the changes.
    pub async fn transaction(&self, chat_id: &str) -> Result<ChatTransaction<'_>, StoreError> {
        validate_chat_id(chat_id)?;
        let guard = self.lock(chat_id).await;
        let file_lock = ChatFileLock::acquire(chat_id, self.lock_path(chat_id)).await?;
        let data = self.load(chat_id)?;
        Ok(ChatTransaction {
            store: self,
            _file_lock: file_lock,
            _guard: guard,
            data,
        })
    }

    /// Apply `mutate` to the chat and persist the result atomically.
    pub async fn update<F, R>(&self, chat_id: &str, mutate: F) -> Result<R, StoreError>
    where
        F: FnOnce(&mut ChatData) -> R,
    {
        let mut tx = self.transaction(chat_id).await?;
        let result = mutate(tx.data_mut());
        tx.commit()?;
        Ok(result)
    }

    pub async fn set_mode(&self, chat_id: &str, mode: ChatMode) -> Result<(), StoreError> {
        self.update(chat_id, |data| data.mode = mode).await
    }

    /// All chats, most recently updated first.
    pub fn list(&self) -> Result<Vec<ChatSummary>, StoreError> {
        let mut chats = Vec::new();
        for entry in fs::read_dir(&self.chats_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(CHAT_FILE_EXT) {
                continue;
            }
            // Unreadable files are skipped so one bad chat does not hide the rest.
            let Ok(raw) = fs::read_to_string(&path) else {
                continue;
            };
            let Ok(payload) = serde_json::from_str::<PersistedChat>(&raw) else {
                tracing::warn!(path = %path.display(), "skipping unreadable chat file");
                continue;
            };
            chats.push(ChatSummary {
                id: payload.chat.id,
                mode: payload.chat.mode,
                messages: payload.chat.messages.len(),
                updated_at_millis: payload.updated_at_millis,
            });
        }
        chats.sort_by(|a, b| {
            b.updated_at_millis
                .cmp(&a.updated_at_millis)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(chats)
    }

    /// Most recently updated chat, if any.
    pub fn resolve_last(&self) -> Result<Option<String>, StoreError> {
        Ok(self.list()?.into_iter().next().map(|c| c.id))
    }

    async fn lock(&self, chat_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = match self.locks.lock() {
                Ok(locks) => locks,
                Err(poisoned) => poisoned.into_inner(),
            };
            locks
                .entry(chat_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    fn save(&self, data: &ChatData) -> Result<(), StoreError> {
        validate_chat_id(&data.id)?;
        let payload = PersistedChat {
            version: CHAT_FILE_VERSION,
            updated_at_millis: now_unix_millis(),
            chat: data.clone(),
        };
        let json = serde_json::to_vec_pretty(&payload)?;
        let path = self.chat_path(&data.id);
        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, json)?;
        fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    fn chat_path(&self, chat_id: &str) -> PathBuf {
        self.chats_dir.join(format!("{chat_id}.{CHAT_FILE_EXT}"))
    }

    fn lock_path(&self, chat_id: &str) -> PathBuf {
        self.chats_dir.join(format!("{chat_id}.{LOCK_FILE_EXT}"))
    }
}

/// Cross-process lock: a file created with `create_new`, removed on drop.
struct ChatFileLock {
    path: PathBuf,
}

impl ChatFileLock {
    async fn acquire(chat_id: &str, path: PathBuf) -> Result<Self, StoreError> {
        let started = tokio::time::Instant::now();
        loop {
            match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    let _ = write!(file, "{}", std::process::id());
                    return Ok(Self { path });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e.into()),
            }
            if lock_is_stale(&path) {
                tracing::warn!(path = %path.display(), "removing stale chat lock");
                let _ = fs::remove_file(&path);
                continue;
            }
            if started.elapsed() >= LOCK_WAIT {
                return Err(StoreError::LockTimeout(chat_id.to_string()));
            }
            tokio::time::sleep(LOCK_POLL).await;
        }
    }
}

impl Drop for ChatFileLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn lock_is_stale(path: &Path) -> bool {
    fs::metadata(path)
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|modified| modified.elapsed().ok())
        .is_some_and(|age| age > STALE_LOCK_AFTER)
}

/// Exclusive, uncommitted view of one chat.
pub struct ChatTransaction<'a> {
    store: &'a ChatStore,
    _file_lock: ChatFileLock,
    _guard: OwnedMutexGuard<()>,
    data: ChatData,
}

impl ChatTransaction<'_> {
    pub fn data(&self) -> &ChatData {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut ChatData {
        &mut self.data
    }

    pub fn commit(self) -> Result<(), StoreError> {
        self.store.save(&self.data)
    }
}

/// Chat ids become file names and must be filesystem-safe.
fn validate_chat_id(chat_id: &str) -> Result<(), StoreError> {
    let trimmed = chat_id.trim();
    if trimmed.is_empty() {
        return Err(StoreError::InvalidChatId("chat id cannot be empty".into()));
    }
    if trimmed == "." || trimmed == ".." {
        return Err(StoreError::InvalidChatId("chat id cannot be '.' or '..'".into()));
    }
    if trimmed != chat_id
        || chat_id
            .chars()
            .any(|ch| !(ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' || ch == '.'))
    {
        return Err(StoreError::InvalidChatId(format!(
            "`{chat_id}` may only contain ASCII letters, numbers, '.', '-', '_'"
        )));
    }
    Ok(())
}

/// Random hex chat id (`xxxx-xxxx-xxxx-xxxx`).
pub fn generate_chat_id() -> String {
    let mut bytes = [0u8; 8];
    OsRng.fill_bytes(&mut bytes);
    let hex = format!("{:016x}", u64::from_be_bytes(bytes));
    format!(
        "{}-{}-{}-{}",
        &hex[0..4],
        &hex[4..8],
        &hex[8..12],
        &hex[12..16]
    )
}
