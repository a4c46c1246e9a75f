//! File-based JSON storage for full article content.
//!
//! Layout: `{base}/YYYY/MM/DD/SYMBOL/{news_id}.json`. Writes are atomic
//! (temp file then rename). The retention sweep removes whole day
//! directories older than the cutoff and prunes emptied parents.

use crate::error::AppResult;
use chrono::{DateTime, Datelike, TimeZone, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Payload persisted for each article.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ContentBlob {
    pub news_id: Uuid,
    pub symbol: String,
    pub url: String,
    pub title: String,
    pub full_text: String,
    #[serde(default)]
    pub authors: Vec<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    pub top_image: Option<String>,
    pub language: Option<String>,
    pub fetched_at: DateTime<Utc>,
    pub word_count: usize,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub saved_at: DateTime<Utc>,
}

pub struct BlobStore {
    base_path: PathBuf,
}

impl BlobStore {
    pub fn new<P: AsRef<Path>>(base_path: P) -> AppResult<Self> {
        let base_path = base_path.as_ref().to_path_buf();
        fs::create_dir_all(&base_path)?;
        Ok(Self { base_path })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn sanitize_symbol(symbol: &str) -> String {
        let cleaned: String = symbol
            .to_ascii_uppercase()
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        if cleaned.is_empty() {
            "UNKNOWN".to_string()
        } else {
            cleaned
        }
    }

    fn relative_path(news_id: Uuid, symbol: &str, date: DateTime<Utc>) -> PathBuf {
        PathBuf::from(format!("{:04}", date.year()))
            .join(format!("{:02}", date.month()))
            .join(format!("{:02}", date.day()))
            .join(Self::sanitize_symbol(symbol))
            .join(format!("{}.json", news_id))
    }

    /// Persist a blob. Returns the path relative to the base directory.
    pub fn save(
        &self,
        news_id: Uuid,
        symbol: &str,
        mut blob: ContentBlob,
        published_at: Option<DateTime<Utc>>,
    ) -> AppResult<String> {
        let date = published_at.unwrap_or_else(Utc::now);
        let relative = Self::relative_path(news_id, symbol, date);
        let full_path = self.base_path.join(&relative);

        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent)?;
        }

        blob.news_id = news_id;
        blob.symbol = Self::sanitize_symbol(symbol);
        blob.saved_at = Utc::now();

        // Write-then-rename keeps readers from ever seeing a torn file.
        let tmp_path = full_path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(&blob)?;
        fs::write(&tmp_path, json)?;
        fs::rename(&tmp_path, &full_path)?;

        let relative_str = relative.to_string_lossy().replace('\\', "/");
        info!(news_id = %news_id, symbol, path = %relative_str, "saved news content");
        Ok(relative_str)
    }

    pub fn read(&self, relative_path: &str) -> AppResult<Option<ContentBlob>> {
        let full_path = self.base_path.join(relative_path);
        if !full_path.exists() {
            warn!(path = relative_path, "news content file not found");
            return Ok(None);
        }
        let bytes = fs::read(&full_path)?;
        match serde_json::from_slice(&bytes) {
            Ok(blob) => Ok(Some(blob)),
            Err(e) => {
                warn!(path = relative_path, error = %e, "invalid JSON in content file");
                Ok(None)
            }
        }
    }

    /// Delete a blob and prune emptied parent directories.
    pub fn delete(&self, relative_path: &str) -> bool {
        let full_path = self.base_path.join(relative_path);
        if !full_path.exists() {
            debug!(path = relative_path, "content file already deleted");
            return true;
        }
        match fs::remove_file(&full_path) {
            Ok(()) => {
                if let Some(parent) = full_path.parent() {
                    self.cleanup_empty_dirs(parent);
                }
                true
            }
            Err(e) => {
                warn!(path = relative_path, error = %e, "failed to delete content file");
                false
            }
        }
    }

    fn cleanup_empty_dirs(&self, start: &Path) {
        let mut dir = start.to_path_buf();
        while dir != self.base_path && dir.starts_with(&self.base_path) {
            match fs::read_dir(&dir) {
                Ok(mut entries) => {
                    if entries.next().is_some() {
                        break;
                    }
                }
                Err(_) => break,
            }
            if fs::remove_dir(&dir).is_err() {
                break;
            }
            match dir.parent() {
                Some(parent) => dir = parent.to_path_buf(),
                None => break,
            }
        }
    }

    /// Remove whole day directories older than `days`. Returns the number
    /// of JSON files deleted.
    pub fn cleanup_older_than(&self, days: i64) -> AppResult<usize> {
        if days <= 0 {
            warn!(days, "invalid retention window");
            return Ok(0);
        }
        let cutoff = Utc::now() - chrono::Duration::days(days);
        let mut deleted = 0usize;

        for year_entry in fs::read_dir(&self.base_path)? {
            let year_dir = year_entry?.path();
            let Some(year) = dir_number(&year_dir) else { continue };

            for month_entry in fs::read_dir(&year_dir)? {
                let month_dir = month_entry?.path();
                let Some(month) = dir_number(&month_dir) else { continue };

                for day_entry in fs::read_dir(&month_dir)? {
                    let day_dir = day_entry?.path();
                    let Some(day) = dir_number(&day_dir) else { continue };

                    let Some(dir_date) = Utc
                        .with_ymd_and_hms(year as i32, month, day, 0, 0, 0)
                        .single()
                    else {
                        continue;
                    };

                    if dir_date < cutoff {
                        let files = count_json_files(&day_dir);
                        if fs::remove_dir_all(&day_dir).is_ok() {
                            deleted += files;
                            info!(dir = %day_dir.display(), files, "deleted expired news directory");
                        }
                    }
                }

                remove_if_empty(&month_dir);
            }
            remove_if_empty(&year_dir);
        }

        info!(deleted, days, "blob retention sweep completed");
        Ok(deleted)
    }
}

fn dir_number(path: &Path) -> Option<u32> {
    if !path.is_dir() {
        return None;
    }
    path.file_name()?.to_str()?.parse().ok()
}

fn count_json_files(dir: &Path) -> usize {
    let mut count = 0;
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        let Ok(entries) = fs::read_dir(&current) else { continue };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.extension().is_some_and(|e| e == "json") {
                count += 1;
            }
        }
    }
    count
}

fn remove_if_empty(dir: &Path) {
    if let Ok(mut entries) = fs::read_dir(dir) {
        if entries.next().is_none() {
            let _ = fs::remove_dir(dir);
        }
    }
}

impl ContentBlob {
    /// Convenience constructor used by the fetch stage.
    pub fn new(url: &str, title: &str, full_text: String) -> Self {
        let word_count = full_text.split_whitespace().count();
        Self {
            news_id: Uuid::nil(),
            symbol: String::new(),
            url: url.to_string(),
            title: title.to_string(),
            full_text,
            authors: Vec::new(),
            keywords: Vec::new(),
            top_image: None,
            language: None,
            fetched_at: Utc::now(),
            word_count,
            metadata: serde_json::Map::new(),
            saved_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, BlobStore) {
        let dir = TempDir::new().unwrap();
        let store = BlobStore::new(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn test_save_and_read_round_trip() {
        let (_dir, store) = store();
        let id = Uuid::new_v4();
        let blob = ContentBlob::new("http://ex/a", "Title", "Body text here".into());
        let published = Utc.with_ymd_and_hms(2026, 3, 15, 12, 0, 0).unwrap();

        let path = store.save(id, "AAPL", blob, Some(published)).unwrap();
        assert_eq!(path, format!("2026/03/15/AAPL/{}.json", id));

        let read = store.read(&path).unwrap().unwrap();
        assert_eq!(read.news_id, id);
        assert_eq!(read.full_text, "Body text here");
        assert_eq!(read.word_count, 3);
    }

    #[test]
    fn test_symbol_is_sanitized() {
        let (_dir, store) = store();
        let id = Uuid::new_v4();
        let blob = ContentBlob::new("http://ex/a", "T", "x".into());
        let path = store
            .save(id, "brk/a b", blob, Some(Utc.with_ymd_and_hms(2026, 1, 2, 0, 0, 0).unwrap()))
            .unwrap();
        assert!(path.contains("/BRK_A_B/"), "got {}", path);
    }

    #[test]
    fn test_read_missing_returns_none() {
        let (_dir, store) = store();
        assert!(store.read("2026/01/01/AAPL/missing.json").unwrap().is_none());
    }

    #[test]
    fn test_delete_prunes_empty_parents() {
        let (dir, store) = store();
        let id = Uuid::new_v4();
        let blob = ContentBlob::new("http://ex/a", "T", "x".into());
        let published = Utc.with_ymd_and_hms(2026, 5, 5, 0, 0, 0).unwrap();
        let path = store.save(id, "TSLA", blob, Some(published)).unwrap();

        assert!(store.delete(&path));
        assert!(!dir.path().join("2026").exists());
        // Deleting again is a no-op success
        assert!(store.delete(&path));
    }

    #[test]
    fn test_cleanup_removes_old_day_dirs() {
        let (dir, store) = store();
        let old_date = Utc::now() - chrono::Duration::days(90);
        let new_date = Utc::now();

        let old_id = Uuid::new_v4();
        let new_id = Uuid::new_v4();
        store
            .save(old_id, "AAPL", ContentBlob::new("u", "t", "old".into()), Some(old_date))
            .unwrap();
        let new_path = store
            .save(new_id, "AAPL", ContentBlob::new("u", "t", "new".into()), Some(new_date))
            .unwrap();

        let deleted = store.cleanup_older_than(30).unwrap();
        assert_eq!(deleted, 1);
        assert!(store.read(&new_path).unwrap().is_some());
        // Year dir of the old file is gone if it differed; at minimum the
        // old blob itself is no longer readable.
        let old_rel = format!(
            "{:04}/{:02}/{:02}/AAPL/{}.json",
            old_date.year(),
            old_date.month(),
            old_date.day(),
            old_id
        );
        assert!(!dir.path().join(old_rel).exists());
    }

    #[test]
    fn test_cleanup_rejects_nonpositive_days() {
        let (_dir, store) = store();
        assert_eq!(store.cleanup_older_than(0).unwrap(), 0);
    }
}
