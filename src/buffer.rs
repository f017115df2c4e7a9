//! Bounded scrollback retained per session so a detached view can be restored.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

#[derive(Debug)]
struct BufferEntry {
    data: Vec<u8>,
    created_at: Instant,
    last_access: Instant,
}

impl BufferEntry {
    fn new(now: Instant) -> Self {
        Self {
            data: Vec::new(),
            created_at: now,
            last_access: now,
        }
    }

    /// Append, dropping the oldest bytes beyond `max_bytes`
    fn append(&mut self, chunk: &[u8], max_bytes: usize) {
        if chunk.len() >= max_bytes {
            self.data.clear();
            self.data.extend_from_slice(&chunk[chunk.len() - max_bytes..]);
            return;
        }
        let new_len = self.data.len() + chunk.len();
        if new_len > max_bytes {
            self.data.drain(0..new_len - max_bytes);
        }
        self.data.extend_from_slice(chunk);
    }
}

/// Scrollback buffers for all sessions, bounded in size and count
pub struct ScrollbackCache {
    entries: Mutex<HashMap<String, BufferEntry>>,
    max_bytes: usize,
    max_entries: usize,
}

impl ScrollbackCache {
    pub fn new(max_bytes: usize, max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_bytes: max_bytes.max(1),
            max_entries: max_entries.max(1),
        }
    }

    /// Append output to a session's buffer, evicting the least recently used entry if full
    pub async fn append(&self, session_id: &str, chunk: &[u8]) {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;

        if !entries.contains_key(session_id) && entries.len() >= self.max_entries {
            let oldest = entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_access)
                .map(|(id, _)| id.clone());
            if let Some((id, entry)) = oldest.and_then(|id| entries.remove(&id).map(|e| (id, e))) {
                info!(
                    session_id = %id,
                    age_secs = now.saturating_duration_since(entry.created_at).as_secs(),
                    "Evicted scrollback buffer"
                );
            }
        }

        let entry = entries
            .entry(session_id.to_string())
            .or_insert_with(|| BufferEntry::new(now));
        entry.append(chunk, self.max_bytes);
        entry.last_access = now;
    }

    /// Current scrollback for a session
    pub async fn read(&self, session_id: &str) -> Option<String> {
        let mut entries = self.entries.lock().await;
        let entry = entries.get_mut(session_id)?;
        entry.last_access = Instant::now();
        Some(String::from_utf8_lossy(&entry.data).into_owned())
    }

    pub async fn remove(&self, session_id: &str) -> bool {
        self.entries.lock().await.remove(session_id).is_some()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Drop every entry untouched for longer than `max_idle`
    pub async fn sweep(&self, max_idle: Duration) -> Vec<String> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let stale: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| now.saturating_duration_since(entry.last_access) > max_idle)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            entries.remove(id);
        }
        if !stale.is_empty() {
            debug!(count = stale.len(), "Swept idle scrollback buffers");
        }
        stale
    }

    /// Sweep every `interval`, dropping entries idle for `idle_sweeps` intervals
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration, idle_sweeps: u32) -> JoinHandle<()> {
        let max_idle = interval * idle_sweeps;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.sweep(max_idle).await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_append_keeps_most_recent_suffix() {
        let cache = ScrollbackCache::new(8, 4);
        let mut appended = Vec::new();
        for chunk in ["abc", "defg", "hi", "jklmnopqrs", "t"] {
            cache.append("s1", chunk.as_bytes()).await;
            appended.extend_from_slice(chunk.as_bytes());

            let buffer = cache.read("s1").await.unwrap();
            assert!(buffer.len() <= 8);
            let start = appended.len().saturating_sub(8);
            assert_eq!(buffer.as_bytes(), &appended[start..]);
        }
        assert_eq!(cache.read("s1").await.unwrap(), "mnopqrst");
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_limit_evicts_least_recently_accessed() {
        let cache = ScrollbackCache::new(64, 2);
        cache.append("a", b"1").await;
        tokio::time::advance(Duration::from_millis(10)).await;
        cache.append("b", b"2").await;
        tokio::time::advance(Duration::from_millis(10)).await;
        // Reading refreshes "a", leaving "b" as the oldest
        cache.read("a").await;
        tokio::time::advance(Duration::from_millis(10)).await;
        cache.append("c", b"3").await;

        assert_eq!(cache.len().await, 2);
        assert!(cache.read("b").await.is_none());
        assert_eq!(cache.read("a").await.as_deref(), Some("1"));
        assert_eq!(cache.read("c").await.as_deref(), Some("3"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_drops_idle_entries() {
        let cache = Arc::new(ScrollbackCache::new(64, 8));
        cache.append("stale", b"old").await;
        let sweeper = cache.clone().spawn_sweeper(Duration::from_secs(1), 3);

        tokio::time::sleep(Duration::from_millis(2500)).await;
        cache.append("fresh", b"new").await;
        tokio::time::sleep(Duration::from_millis(2000)).await;

        assert!(cache.read("stale").await.is_none());
        assert!(cache.read("fresh").await.is_some());
        sweeper.abort();
    }

    #[tokio::test]
    async fn test_remove_is_immediate() {
        let cache = ScrollbackCache::new(64, 8);
        cache.append("s1", b"data").await;
        assert!(cache.remove("s1").await);
        assert!(!cache.remove("s1").await);
        assert!(cache.read("s1").await.is_none());
    }
}
