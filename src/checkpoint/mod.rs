//! Durable, incremental checkpoint of the extracted record corpus.
//!
//! One checkpoint file per target host. The corpus is keyed by canonical
//! link; merges carry manual flags forward and position state (`last_page`,
//! `last_link`) lets an interrupted crawl resume without reprocessing.
//! Writes are atomic: temp file then rename, so a crash never leaves
//! partial JSON behind.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::warn;
use url::Url;

use crate::errors::CheckpointError;
use crate::models::Record;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckpointFile {
    /// Last fully or partially processed page index.
    pub last_page: u32,
    /// Link of the most recently processed item.
    pub last_link: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
    pub records: Vec<Record>,
}

pub struct CheckpointStore {
    path: PathBuf,
    host: String,
    data: CheckpointFile,
}

impl CheckpointStore {
    /// Open (or initialize) the checkpoint for one target. The file name
    /// is derived from the target host so independent targets never share
    /// a corpus.
    pub fn open(dir: &Path, base_url: &str) -> Result<Self, CheckpointError> {
        let host = host_of(base_url).unwrap_or_else(|| "unknown".to_string());
        let path = dir.join(format!("checkpoint-{}.json", slug(&host)));
        let data = Self::load(&path);
        Ok(Self { path, host, data })
    }

    fn load(path: &Path) -> CheckpointFile {
        match std::fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(data) => data,
                Err(e) => {
                    // A torn or corrupt file is treated as absent; the
                    // crawl restarts from scratch rather than aborting.
                    warn!("Ignoring unreadable checkpoint {}: {}", path.display(), e);
                    CheckpointFile::default()
                }
            },
            Err(_) => CheckpointFile::default(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn last_page(&self) -> u32 {
        self.data.last_page
    }

    pub fn last_link(&self) -> Option<&str> {
        self.data.last_link.as_deref()
    }

    pub fn len(&self) -> usize {
        self.data.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.records.is_empty()
    }

    pub fn records(&self) -> &[Record] {
        &self.data.records
    }

    /// Links already known for this store's host. Records whose link lives
    /// on another host do not suppress a refetch.
    pub fn known_links(&self) -> HashSet<String> {
        self.data
            .records
            .iter()
            .filter(|r| host_of(&r.link).as_deref() == Some(self.host.as_str()))
            .map(|r| r.link.clone())
            .collect()
    }

    /// Merge one record into the corpus, keyed by link. A manual
    /// `published` flag on a replaced record is carried forward onto the
    /// replacement; all other fields take the new values.
    pub fn upsert(&mut self, mut record: Record) {
        if let Some(existing) = self
            .data
            .records
            .iter_mut()
            .find(|r| r.link == record.link)
        {
            record.published = record.published || existing.published;
            *existing = record;
        } else {
            self.data.records.push(record);
        }
    }

    /// Record the resume position.
    pub fn set_position(&mut self, last_page: u32, last_link: Option<String>) {
        self.data.last_page = last_page;
        if last_link.is_some() {
            self.data.last_link = last_link;
        }
    }

    /// Persist the corpus atomically: write a temp file in the same
    /// directory, then rename over the target path.
    pub fn save(&mut self) -> Result<(), CheckpointError> {
        self.data.updated_at = Some(Utc::now());
        let contents = serde_json::to_string_pretty(&self.data)?;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| CheckpointError::Io {
                path: parent.display().to_string(),
                source: e,
            })?;
        }

        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, contents).map_err(|e| CheckpointError::Io {
            path: tmp.display().to_string(),
            source: e,
        })?;
        std::fs::rename(&tmp, &self.path).map_err(|e| CheckpointError::Io {
            path: self.path.display().to_string(),
            source: e,
        })?;
        Ok(())
    }
}

fn host_of(link: &str) -> Option<String> {
    Url::parse(link).ok()?.host_str().map(|h| h.to_string())
}

fn slug(host: &str) -> String {
    host.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(link: &str) -> Record {
        Record {
            title: "title".to_string(),
            title_raw: "title".to_string(),
            link: link.to_string(),
            image_url: None,
            video_url: None,
            meta_description: None,
            og_title: None,
            og_description: None,
            tags: Vec::new(),
            published: false,
            fresh: true,
            error: None,
            scraped_at: Utc::now(),
        }
    }

    #[test]
    fn test_merge_preserves_manual_flag_and_applies_new_fields() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = CheckpointStore::open(dir.path(), "https://x.test").unwrap();

        let mut old = record("https://x.test/video/1");
        old.published = true;
        old.title = "old title".to_string();
        store.upsert(old);

        let mut new = record("https://x.test/video/1");
        new.title = "new title".to_string();
        new.video_url = Some("https://cdn.x.test/1.mp4".to_string());
        store.upsert(new);

        assert_eq!(store.len(), 1);
        let merged = &store.records()[0];
        assert!(merged.published, "manual flag must carry forward");
        assert_eq!(merged.title, "new title");
        assert_eq!(merged.video_url.as_deref(), Some("https://cdn.x.test/1.mp4"));
    }

    #[test]
    fn test_no_duplicate_links_after_repeated_upserts() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = CheckpointStore::open(dir.path(), "https://x.test").unwrap();
        for _ in 0..3 {
            store.upsert(record("https://x.test/video/7"));
        }
        store.upsert(record("https://x.test/video/8"));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_known_links_scoped_to_host() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = CheckpointStore::open(dir.path(), "https://x.test").unwrap();
        store.upsert(record("https://x.test/video/1"));
        store.upsert(record("https://other.test/video/2"));

        let known = store.known_links();
        assert!(known.contains("https://x.test/video/1"));
        assert!(!known.contains("https://other.test/video/2"));
    }

    #[test]
    fn test_save_and_reload_roundtrip_with_position() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = CheckpointStore::open(dir.path(), "https://x.test").unwrap();
            store.upsert(record("https://x.test/video/1"));
            store.set_position(4, Some("https://x.test/video/1".to_string()));
            store.save().unwrap();
        }
        let store = CheckpointStore::open(dir.path(), "https://x.test").unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.last_page(), 4);
        assert_eq!(store.last_link(), Some("https://x.test/video/1"));
        // No stray temp file left behind.
        assert!(!store.path().with_extension("json.tmp").exists());
    }

    #[test]
    fn test_corrupt_checkpoint_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = {
            let mut store = CheckpointStore::open(dir.path(), "https://x.test").unwrap();
            store.upsert(record("https://x.test/video/1"));
            store.save().unwrap();
            store.path().to_path_buf()
        };
        std::fs::write(&path, "{\"records\": [tr").unwrap();

        let store = CheckpointStore::open(dir.path(), "https://x.test").unwrap();
        assert!(store.is_empty());
        assert_eq!(store.last_page(), 0);
    }
}
