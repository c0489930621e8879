//! Naming and placement of verified content on disk.
//!
//! Each success is written to `data/<bucket>/<name>` under the output root.
//! When the computed path already holds a file, the policy compares size and
//! then a SHA-256 digest: identical content is reused without writing,
//! different content moves on to `<stem>_2.<ext>`, `<stem>_3.<ext>`, ...
//!
//! Writes go to a temporary sibling and are renamed into place, so a killed
//! run never leaves a truncated file under its final name. Placements of the
//! same base name are serialized; different names proceed in parallel.

pub mod naming;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use crate::task::{SourceRoute, Task};
use crate::verify::EffectiveType;

pub use naming::{DATA_DIR, MIRROR_BUCKET, file_name, file_stem, sanitize_segment, target_dir};

/// Upper bound on numeric disambiguators tried for one name.
const MAX_DISAMBIGUATOR: usize = 1000;

/// Errors raised while placing content.
#[derive(Debug, Error)]
pub enum PlacementError {
    /// A filesystem operation failed.
    #[error("filesystem error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Every disambiguated name is taken by different content.
    #[error("no free file name for {name} in {dir}")]
    Exhausted { dir: PathBuf, name: String },
}

impl PlacementError {
    fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Where a success ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placed {
    /// The body was written to this path.
    Written(PathBuf),
    /// Identical content already existed at this path; nothing was written.
    AlreadyPresent(PathBuf),
}

impl Placed {
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            Self::Written(path) | Self::AlreadyPresent(path) => path,
        }
    }
}

/// Placement policy rooted at one output directory.
#[derive(Debug)]
pub struct Placement {
    output_root: PathBuf,
    /// One lock per base path held across the exists/compare/write sequence.
    /// Entries are dropped once no placement holds them.
    name_locks: DashMap<PathBuf, Arc<Mutex<()>>>,
}

impl Placement {
    #[must_use]
    pub fn new(output_root: impl Into<PathBuf>) -> Self {
        Self {
            output_root: output_root.into(),
            name_locks: DashMap::new(),
        }
    }

    #[must_use]
    pub fn output_root(&self) -> &Path {
        &self.output_root
    }

    /// Creates the data directory, failing when the output root is unwritable.
    ///
    /// # Errors
    ///
    /// Returns [`PlacementError::Io`] if the directory cannot be created.
    pub async fn prepare(&self) -> Result<(), PlacementError> {
        let data_dir = self.output_root.join(DATA_DIR);
        tokio::fs::create_dir_all(&data_dir)
            .await
            .map_err(|e| PlacementError::io(&data_dir, e))
    }

    /// Writes `body` for `task`, applying the collision policy.
    ///
    /// # Errors
    ///
    /// Returns [`PlacementError`] when the filesystem rejects the write.
    #[instrument(skip(self, task, body), fields(task_id = %task.id, route = %route, len = body.len()))]
    pub async fn place(
        &self,
        task: &Task,
        effective_type: EffectiveType,
        route: &SourceRoute,
        body: &[u8],
    ) -> Result<Placed, PlacementError> {
        let dir = target_dir(&self.output_root, effective_type, route);
        let name = file_name(task, effective_type, body);
        let key = dir.join(&name);

        let lock = Arc::clone(
            self.name_locks
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        );
        let guard = lock.lock_owned().await;
        let placed = place_locked(dir, name, body).await;
        drop(guard);
        self.name_locks.remove_if(&key, |_, lock| Arc::strong_count(lock) == 1);
        placed
    }
}

async fn place_locked(dir: PathBuf, name: String, body: &[u8]) -> Result<Placed, PlacementError> {
    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|e| PlacementError::io(&dir, e))?;

    for n in 1..=MAX_DISAMBIGUATOR {
        let candidate = dir.join(naming::numbered_name(&name, n));
        match tokio::fs::metadata(&candidate).await {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                write_atomically(&candidate, body).await?;
                debug!(path = %candidate.display(), "content written");
                return Ok(Placed::Written(candidate));
            }
            Err(e) => return Err(PlacementError::io(&candidate, e)),
            Ok(meta) => {
                if same_content(&candidate, meta.len(), body).await? {
                    debug!(path = %candidate.display(), "identical content already present");
                    return Ok(Placed::AlreadyPresent(candidate));
                }
            }
        }
    }

    Err(PlacementError::Exhausted { dir, name })
}

async fn same_content(path: &Path, existing_len: u64, body: &[u8]) -> Result<bool, PlacementError> {
    if existing_len != body.len() as u64 {
        return Ok(false);
    }
    let existing = tokio::fs::read(path)
        .await
        .map_err(|e| PlacementError::io(path, e))?;
    let body = body.to_vec();
    tokio::task::spawn_blocking(move || Sha256::digest(&existing) == Sha256::digest(&body))
        .await
        .map_err(|e| PlacementError::io(path, std::io::Error::other(e)))
}

async fn write_atomically(path: &Path, body: &[u8]) -> Result<(), PlacementError> {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp_path = path.with_file_name(format!(".{file_name}.part"));

    let mut file = tokio::fs::File::create(&temp_path)
        .await
        .map_err(|e| PlacementError::io(&temp_path, e))?;
    let written = async {
        file.write_all(body).await?;
        file.flush().await?;
        file.sync_all().await
    }
    .await;
    drop(file);

    if let Err(e) = written {
        let _ = tokio::fs::remove_file(&temp_path).await;
        return Err(PlacementError::io(&temp_path, e));
    }

    tokio::fs::rename(&temp_path, path)
        .await
        .map_err(|e| PlacementError::io(path, e))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn task() -> Task {
        Task {
            id: "1".to_string(),
            url: "http://example.org/paper".to_string(),
            doi: Some("10.1/x".to_string()),
            author: "Smith".to_string(),
            title: "Example Study".to_string(),
            year: None,
        }
    }

    #[tokio::test]
    async fn test_place_writes_into_type_bucket() {
        let temp = TempDir::new().unwrap();
        let placement = Placement::new(temp.path());
        placement.prepare().await.unwrap();

        let placed = placement
            .place(&task(), EffectiveType::Pdf, &SourceRoute::Direct, b"%PDF-1.4 body")
            .await
            .unwrap();
        let expected = temp.path().join("data/pdf/10.1_x_Smith_Example_Study.pdf");
        assert_eq!(placed, Placed::Written(expected.clone()));
        assert_eq!(std::fs::read(&expected).unwrap(), b"%PDF-1.4 body");
    }

    #[tokio::test]
    async fn test_identical_content_is_not_rewritten() {
        let temp = TempDir::new().unwrap();
        let placement = Placement::new(temp.path());

        let first = placement
            .place(&task(), EffectiveType::Pdf, &SourceRoute::Direct, b"same bytes")
            .await
            .unwrap();
        let second = placement
            .place(&task(), EffectiveType::Pdf, &SourceRoute::Direct, b"same bytes")
            .await
            .unwrap();
        assert!(matches!(first, Placed::Written(_)));
        assert_eq!(second, Placed::AlreadyPresent(first.path().to_path_buf()));

        let entries = std::fs::read_dir(temp.path().join("data/pdf")).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[tokio::test]
    async fn test_different_content_gets_disambiguator() {
        let temp = TempDir::new().unwrap();
        let placement = Placement::new(temp.path());

        placement
            .place(&task(), EffectiveType::Pdf, &SourceRoute::Direct, b"first version")
            .await
            .unwrap();
        let placed = placement
            .place(&task(), EffectiveType::Pdf, &SourceRoute::Direct, b"second version!")
            .await
            .unwrap();
        assert_eq!(
            placed,
            Placed::Written(temp.path().join("data/pdf/10.1_x_Smith_Example_Study_2.pdf"))
        );

        // Same length, different bytes.
        let third = placement
            .place(&task(), EffectiveType::Pdf, &SourceRoute::Direct, b"first versioN")
            .await
            .unwrap();
        assert_eq!(
            third,
            Placed::Written(temp.path().join("data/pdf/10.1_x_Smith_Example_Study_3.pdf"))
        );
    }

    #[tokio::test]
    async fn test_mirror_success_lands_in_sci_pdf() {
        let temp = TempDir::new().unwrap();
        let placement = Placement::new(temp.path());
        let route = SourceRoute::FallbackMirror("mirror.example".to_string());

        let placed = placement
            .place(&task(), EffectiveType::Pdf, &route, b"%PDF-1.4")
            .await
            .unwrap();
        assert!(placed.path().starts_with(temp.path().join("data/sci_pdf")));
    }

    #[tokio::test]
    async fn test_concurrent_identical_placements_write_once() {
        let temp = TempDir::new().unwrap();
        let placement = Arc::new(Placement::new(temp.path()));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let placement = Arc::clone(&placement);
                tokio::spawn(async move {
                    placement
                        .place(&task(), EffectiveType::Pdf, &SourceRoute::Direct, b"shared body")
                        .await
                        .unwrap()
                })
            })
            .collect();
        let mut written = 0;
        for handle in handles {
            if matches!(handle.await.unwrap(), Placed::Written(_)) {
                written += 1;
            }
        }
        assert_eq!(written, 1);
        assert_eq!(std::fs::read_dir(temp.path().join("data/pdf")).unwrap().count(), 1);
        assert!(placement.name_locks.is_empty());
    }

    #[tokio::test]
    async fn test_different_names_place_in_parallel() {
        let temp = TempDir::new().unwrap();
        let placement = Arc::new(Placement::new(temp.path()));
        let other = Task {
            id: "2".to_string(),
            doi: Some("10.2/y".to_string()),
            title: "Other Study".to_string(),
            ..task()
        };

        let held = Arc::clone(
            placement
                .name_locks
                .entry(temp.path().join("data/pdf/10.1_x_Smith_Example_Study.pdf"))
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        );
        let _guard = held.lock().await;

        let placed = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            placement.place(&other, EffectiveType::Pdf, &SourceRoute::Direct, b"other body"),
        )
        .await
        .expect("placement of another name must not wait")
        .unwrap();
        assert!(matches!(placed, Placed::Written(_)));
    }

    #[tokio::test]
    async fn test_no_temporary_files_remain() {
        let temp = TempDir::new().unwrap();
        let placement = Placement::new(temp.path());
        placement
            .place(&task(), EffectiveType::Text, &SourceRoute::Direct, b"text body")
            .await
            .unwrap();
        let names: Vec<String> = std::fs::read_dir(temp.path().join("data/text"))
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["10.1_x_Smith_Example_Study.txt".to_string()]);
    }
}
