/*!
 * JSON-lines persistence sink
 *
 * Appends every flushed item as one JSON object per line. Each batch is
 * written and flushed as a unit.
 */

use async_trait::async_trait;
use serde::Serialize;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::core::PersistenceSink;
use crate::error::{Result, StrandError};

/// Appends batches to a file as JSON lines
#[derive(Debug)]
pub struct JsonLinesSink<T> {
    path: PathBuf,
    file: Mutex<File>,
    _item: PhantomData<fn(T)>,
}

impl<T> JsonLinesSink<T> {
    /// Open (or create) `path` for appending
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| StrandError::Config(format!("cannot open {}: {}", path.display(), e)))?;

        Ok(Self {
            path,
            file: Mutex::new(file),
            _item: PhantomData,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl<T: Serialize + Send + 'static> PersistenceSink<T> for JsonLinesSink<T> {
    async fn persist(&self, batch: Vec<T>) -> Result<()> {
        let mut buf = Vec::with_capacity(batch.len() * 128);
        for item in &batch {
            serde_json::to_writer(&mut buf, item)?;
            buf.push(b'\n');
        }

        let mut file = self.file.lock().await;
        file.write_all(&buf)
            .await
            .map_err(|e| StrandError::Sink(format!("write to {}: {}", self.path.display(), e)))?;
        file.flush()
            .await
            .map_err(|e| StrandError::Sink(format!("flush {}: {}", self.path.display(), e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TaskOutcome;
    use chrono::Utc;
    use serde_json::json;
    use tempfile::TempDir;

    fn outcome(id: u64) -> TaskOutcome {
        TaskOutcome {
            task_id: id,
            operation: "fetch".to_string(),
            result: json!({ "n": id }),
            completed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_batches_appended_as_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("results.jsonl");

        let sink = JsonLinesSink::open(&path).await.unwrap();
        sink.persist(vec![outcome(1), outcome(2)]).await.unwrap();
        sink.persist(vec![outcome(3)]).await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let ids: Vec<u64> = contents
            .lines()
            .map(|line| serde_json::from_str::<TaskOutcome>(line).unwrap().task_id)
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_reopen_appends() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("results.jsonl");

        JsonLinesSink::open(&path)
            .await
            .unwrap()
            .persist(vec![outcome(1)])
            .await
            .unwrap();
        JsonLinesSink::open(&path)
            .await
            .unwrap()
            .persist(vec![outcome(2)])
            .await
            .unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);
    }

    #[tokio::test]
    async fn test_open_missing_directory_fails() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing").join("results.jsonl");
        let err = JsonLinesSink::<TaskOutcome>::open(&path).await.unwrap_err();
        assert!(err.is_fatal());
    }
}
