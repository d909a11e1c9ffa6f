//! Shared answer cache: question fingerprint -> resolved letter.
//!
//! One instance is shared by every account. State lives in memory and is
//! written through to a [`CacheStore`] after every upsert, so answers survive
//! restarts. Writes happen outside the state lock; readers never wait on disk.
//! Storage failures are logged and never surface to the resolver.

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex as StdMutex},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::{
    domain::{Letter, QuizMessage},
    errors::Error,
    fingerprint::QuestionFingerprint,
    Result,
};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnswerCacheEntry {
    pub fingerprint: QuestionFingerprint,
    pub letter: Letter,
    pub hit_count: u64,
    pub last_used_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer_text: Option<String>,
}

/// Durable key-value persistence for the cache.
pub trait CacheStore: Send + Sync {
    fn load(&self) -> Result<Vec<AnswerCacheEntry>>;
    fn save(&self, entries: &[AnswerCacheEntry]) -> Result<()>;

    /// Whether `save` does blocking I/O and must run off the async workers.
    fn blocks(&self) -> bool {
        false
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheFile {
    entries: Vec<AnswerCacheEntry>,
}

/// `answers.json` in the data dir. Writes go to a temp file first and are
/// renamed into place.
#[derive(Clone, Debug)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CacheStore for JsonFileStore {
    fn load(&self) -> Result<Vec<AnswerCacheEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let txt = fs::read_to_string(&self.path)?;
        if txt.trim().is_empty() {
            return Ok(Vec::new());
        }
        let file: CacheFile = serde_json::from_str(&txt)?;
        Ok(file.entries)
    }

    fn save(&self, entries: &[AnswerCacheEntry]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = CacheFile {
            entries: entries.to_vec(),
        };
        let txt = serde_json::to_string_pretty(&file)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, txt)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn blocks(&self) -> bool {
        true
    }
}

/// In-process store (tests, dry runs).
#[derive(Debug, Default)]
pub struct MemoryStore {
    saved: StdMutex<Vec<AnswerCacheEntry>>,
}

impl MemoryStore {
    pub fn with_entries(entries: Vec<AnswerCacheEntry>) -> Self {
        Self {
            saved: StdMutex::new(entries),
        }
    }

    pub fn snapshot(&self) -> Vec<AnswerCacheEntry> {
        self.saved
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl CacheStore for MemoryStore {
    fn load(&self) -> Result<Vec<AnswerCacheEntry>> {
        Ok(self.snapshot())
    }

    fn save(&self, entries: &[AnswerCacheEntry]) -> Result<()> {
        *self.saved.lock().unwrap_or_else(|e| e.into_inner()) = entries.to_vec();
        Ok(())
    }
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<QuestionFingerprint, AnswerCacheEntry>,
    // Set when the last write-through failed; `flush()` retries.
    dirty: bool,
    // Bumped on every mutation.
    version: u64,
}

pub struct AnswerCache {
    store: Arc<dyn CacheStore>,
    state: Mutex<CacheState>,
    /// Serializes writes; holds the version last persisted.
    persisted: Mutex<u64>,
}

impl AnswerCache {
    /// Load from `store`. An unreadable store starts the cache empty.
    pub fn open(store: Box<dyn CacheStore>) -> Self {
        let entries = match store.load() {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "failed to load answer cache, starting empty");
                Vec::new()
            }
        };

        let mut map = HashMap::with_capacity(entries.len());
        for entry in entries {
            map.insert(entry.fingerprint.clone(), entry);
        }
        tracing::info!(entries = map.len(), "answer cache loaded");

        Self {
            store: Arc::from(store),
            state: Mutex::new(CacheState {
                entries: map,
                dirty: false,
                version: 0,
            }),
            persisted: Mutex::new(0),
        }
    }

    pub async fn lookup(&self, fp: &QuestionFingerprint) -> Option<Letter> {
        self.state
            .lock()
            .await
            .entries
            .get(fp)
            .map(|entry| entry.letter)
    }

    /// Insert or update the entry for `fp`, bumping its hit count.
    /// Returns the hit count after the write.
    pub async fn upsert(&self, fp: &QuestionFingerprint, letter: Letter) -> u64 {
        self.apply(fp, letter, None).await
    }

    /// Like [`AnswerCache::upsert`], also recording the question and option
    /// text for humans reading `answers.json`.
    pub async fn upsert_for(
        &self,
        quiz: &QuizMessage,
        fp: &QuestionFingerprint,
        letter: Letter,
    ) -> u64 {
        self.apply(fp, letter, Some(quiz)).await
    }

    async fn apply(
        &self,
        fp: &QuestionFingerprint,
        letter: Letter,
        quiz: Option<&QuizMessage>,
    ) -> u64 {
        let mut guard = self.state.lock().await;
        let st = &mut *guard;
        let now = Utc::now();

        let entry = st
            .entries
            .entry(fp.clone())
            .or_insert_with(|| AnswerCacheEntry {
                fingerprint: fp.clone(),
                letter,
                hit_count: 0,
                last_used_at: now,
                question: None,
                answer_text: None,
            });
        if entry.letter != letter {
            tracing::info!(
                fingerprint = fp.short(),
                old = %entry.letter,
                new = %letter,
                "cached answer replaced"
            );
        }
        entry.letter = letter;
        entry.hit_count += 1;
        entry.last_used_at = now;
        if let Some(q) = quiz {
            entry.question.get_or_insert_with(|| q.text.clone());
            if let Some(text) = q.option_text(letter) {
                entry.answer_text = Some(text.to_string());
            }
        }
        let hits = entry.hit_count;

        st.version += 1;
        let version = st.version;
        let snapshot: Vec<_> = st.entries.values().cloned().collect();
        drop(guard);

        self.persist(version, snapshot).await;
        hits
    }

    async fn persist(&self, version: u64, snapshot: Vec<AnswerCacheEntry>) {
        let mut written = self.persisted.lock().await;
        if *written >= version {
            // a newer snapshot already reached the store
            return;
        }
        let res = self.save_snapshot(snapshot).await;

        let mut st = self.state.lock().await;
        match res {
            Ok(()) => {
                *written = version;
                if st.version == version {
                    st.dirty = false;
                }
            }
            Err(e) => {
                st.dirty = true;
                tracing::warn!(version, error = %e, "failed to persist answer cache");
            }
        }
    }

    async fn save_snapshot(&self, snapshot: Vec<AnswerCacheEntry>) -> Result<()> {
        if !self.store.blocks() {
            return self.store.save(&snapshot);
        }
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || store.save(&snapshot))
            .await
            .map_err(|e| Error::External(format!("answer cache write task failed: {e}")))?
    }

    /// Write the current state to the store. Called on shutdown.
    pub async fn flush(&self) -> Result<()> {
        let mut written = self.persisted.lock().await;
        let (version, snapshot) = {
            let st = self.state.lock().await;
            (st.version, st.entries.values().cloned().collect::<Vec<_>>())
        };
        self.save_snapshot(snapshot).await?;
        *written = version;

        let mut st = self.state.lock().await;
        if st.version == version {
            st.dirty = false;
        }
        Ok(())
    }

    /// All entries, most recently used first.
    pub async fn entries(&self) -> Vec<AnswerCacheEntry> {
        let st = self.state.lock().await;
        let mut out: Vec<_> = st.entries.values().cloned().collect();
        out.sort_by(|a, b| {
            b.last_used_at
                .cmp(&a.last_used_at)
                .then_with(|| a.fingerprint.cmp(&b.fingerprint))
        });
        out
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn is_dirty(&self) -> bool {
        self.state.lock().await.dirty
    }
}
