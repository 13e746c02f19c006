//! Keyed store for the full text of truncated operation messages.
//!
//! Long messages are cut before they reach the transcript; the model can
//! retrieve the rest through the `output_fetch` operation. Entries are kept
//! per chat, and when the stash has a file it is rewritten after every put so
//! a later process can still fetch them.

use crate::error::StoreError;
use crate::textutil::truncate_with_suffix_by_chars;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

const STASH_FORMAT_VERSION: u32 = 1;

/// Oldest entries of a chat are dropped past this count.
pub const MAX_ENTRIES_PER_CHAT: usize = 64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct StashEntry {
    key: String,
    text: String,
}

type Entries = BTreeMap<String, VecDeque<StashEntry>>;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedStash {
    version: u32,
    chats: Entries,
}

#[derive(Debug, Default)]
struct StashState {
    path: Option<PathBuf>,
    chats: Entries,
}

#[derive(Debug, Clone, Default)]
pub struct OutputStash {
    state: Arc<Mutex<StashState>>,
}

impl OutputStash {
    /// Stash that lives only as long as the process.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open (or lazily create) the stash file at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let chats = read_stash(&path)?;
        Ok(Self {
            state: Arc::new(Mutex::new(StashState {
                path: Some(path),
                chats,
            })),
        })
    }

    /// Return `text` unchanged when short enough, otherwise a truncated copy
    /// naming the key under which the full text was stashed.
    pub fn shorten(&self, chat_id: &str, text: &str, max_chars: usize) -> String {
        if text.chars().count() <= max_chars {
            return text.to_string();
        }
        let key = self.put(chat_id, text.to_string());
        truncate_with_suffix_by_chars(
            text,
            max_chars,
            &format!("... [truncated; output_fetch key={key}]"),
        )
    }

    pub fn put(&self, chat_id: &str, text: String) -> String {
        let key = generate_key();
        let Ok(mut state) = self.state.lock() else {
            return key;
        };
        // Pick up entries other processes wrote since we last looked.
        if let Some(path) = state.path.clone() {
            match read_stash(&path) {
                Ok(chats) => state.chats = chats,
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to reload output stash"),
            }
        }
        let entries = state.chats.entry(chat_id.to_string()).or_default();
        entries.push_back(StashEntry {
            key: key.clone(),
            text,
        });
        while entries.len() > MAX_ENTRIES_PER_CHAT {
            entries.pop_front();
        }
        if let Some(path) = state.path.as_deref() {
            if let Err(e) = write_stash(path, &state.chats) {
                tracing::warn!(path = %path.display(), error = %e, "failed to save output stash");
            }
        }
        key
    }

    /// Full text stashed under `key` for this chat.
    pub fn fetch(&self, chat_id: &str, key: &str) -> Option<String> {
        let mut state = self.state.lock().ok()?;
        if let Some(text) = find(&state.chats, chat_id, key) {
            return Some(text);
        }
        let path = state.path.clone()?;
        state.chats = read_stash(&path).ok()?;
        find(&state.chats, chat_id, key)
    }
}

fn find(chats: &Entries, chat_id: &str, key: &str) -> Option<String> {
    chats
        .get(chat_id)?
        .iter()
        .find(|entry| entry.key == key)
        .map(|entry| entry.text.clone())
}

fn read_stash(path: &Path) -> Result<Entries, StoreError> {
    match std::fs::read_to_string(path) {
        Ok(text) => {
            let persisted: PersistedStash = serde_json::from_str(&text)?;
            if persisted.version != STASH_FORMAT_VERSION {
                return Err(StoreError::UnsupportedVersion(persisted.version));
            }
            Ok(persisted.chats)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Entries::new()),
        Err(e) => Err(e.into()),
    }
}

fn write_stash(path: &Path, chats: &Entries) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let persisted = PersistedStash {
        version: STASH_FORMAT_VERSION,
        chats: chats.clone(),
    };
    let json = serde_json::to_string(&persisted)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn generate_key() -> String {
    let mut bytes = [0u8; 6];
    OsRng.fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
