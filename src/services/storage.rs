use crate::config::UploadConfig;
use crate::error::UploadError;
use crate::events::{EventBus, UploadEvent};
use crate::models::FileRecord;
use crate::services::naming;
use crate::services::versions::ensure_dir;
use crate::utils::urls::PublicUrls;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Stored originals under `upload_dir` and their versions under
/// `upload_dir/<version>/`.
#[derive(Clone)]
pub struct FileStore {
    config: Arc<UploadConfig>,
    events: EventBus,
}

impl FileStore {
    pub fn new(config: Arc<UploadConfig>, events: EventBus) -> Self {
        Self { config, events }
    }

    /// Moves a staged temp file into the upload directory under a reserved
    /// name derived from `name`. Returns the final name and path.
    pub async fn promote(&self, temp: &Path, name: &str) -> Result<(String, PathBuf), UploadError> {
        let dir = self.config.upload_dir();
        ensure_dir(dir).await?;

        let final_name = naming::reserve(dir, name).await?;
        let target = dir.join(&final_name);

        if let Err(e) = tokio::fs::rename(temp, &target).await {
            debug!("Rename of {} failed ({}), copying instead", temp.display(), e);
            if let Err(e) = copy_then_remove(temp, &target).await {
                let _ = tokio::fs::remove_file(&target).await;
                return Err(UploadError::Staging(format!(
                    "{} -> {}: {}",
                    temp.display(),
                    target.display(),
                    e
                )));
            }
        }

        debug!("Stored {} at {}", name, target.display());
        Ok((final_name, target))
    }

    /// Fills in the original and delete URLs, plus one URL per version whose
    /// file exists on disk.
    pub async fn init_urls(&self, record: &mut FileRecord, urls: &PublicUrls) {
        let original = urls.original(&record.name);
        record.delete_url = Some(original.clone());
        record.urls.insert(String::new(), original);

        for version in &self.config.image_versions {
            let path = self.config.version_path(&version.name, &record.name);
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                record
                    .urls
                    .insert(version.name.clone(), urls.version(&version.name, &record.name));
            }
        }
    }

    /// Every visible regular file of the upload directory, sorted by name.
    pub async fn list(&self, urls: &PublicUrls) -> Result<Vec<FileRecord>, UploadError> {
        let mut entries = match tokio::fs::read_dir(self.config.upload_dir()).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            let meta = entry.metadata().await?;
            if !meta.is_file() {
                continue;
            }
            let mut record = FileRecord::new(name, meta.len(), None);
            self.init_urls(&mut record, urls).await;
            files.push(record);
        }
        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }

    /// Removes the original and any version files. Only the original has to
    /// exist; a `delete` event is emitted once it is gone.
    pub async fn delete(&self, name: &str) -> Result<(), UploadError> {
        if name.is_empty() || name.starts_with('.') || name.contains(['/', '\\']) {
            return Err(UploadError::InvalidName(name.to_string()));
        }

        match tokio::fs::remove_file(self.config.original_path(name)).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(UploadError::NotFound(name.to_string()));
            }
            Err(e) => return Err(e.into()),
        }

        for version in &self.config.image_versions {
            let path = self.config.version_path(&version.name, name);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => debug!("Removed version {} of {}", version.name, name),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
            }
        }

        info!("Deleted {}", name);
        self.events.emit(UploadEvent::Delete(name.to_string()));
        Ok(())
    }
}

async fn copy_then_remove(from: &Path, to: &Path) -> io::Result<()> {
    tokio::fs::copy(from, to).await?;
    tokio::fs::remove_file(from).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::versions::{ConvertOptions, VersionSpec};
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> (FileStore, EventBus) {
        let config = UploadConfig::default()
            .with_upload_dir(dir.path().join("files"))
            .with_image_version("large", VersionSpec::options(ConvertOptions::default()));
        let events = EventBus::default();
        (FileStore::new(Arc::new(config), events.clone()), events)
    }

    fn write(path: PathBuf) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, b"data").unwrap();
    }

    #[tokio::test]
    async fn test_promote_renames_on_collision() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = store(&dir);
        write(dir.path().join("files").join("a.png"));
        let temp = dir.path().join("upload-1");
        std::fs::write(&temp, b"new").unwrap();

        let (name, path) = store.promote(&temp, "a.png").await.unwrap();

        assert_eq!(name, "a-1.png");
        assert_eq!(std::fs::read(path).unwrap(), b"new");
        assert!(!temp.exists());
    }

    #[tokio::test]
    async fn test_copy_fallback_moves_content() {
        let dir = tempfile::tempdir().unwrap();
        let from = dir.path().join("upload-2");
        let to = dir.path().join("stored.txt");
        std::fs::write(&from, b"payload").unwrap();

        copy_then_remove(&from, &to).await.unwrap();

        assert_eq!(std::fs::read(&to).unwrap(), b"payload");
        assert!(!from.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_promote_across_devices() {
        use std::os::unix::fs::MetadataExt;

        let Ok(staging) = tempfile::tempdir_in("/dev/shm") else {
            return;
        };
        let dir = tempfile::tempdir().unwrap();
        let staging_dev = std::fs::metadata(staging.path()).unwrap().dev();
        if staging_dev == std::fs::metadata(dir.path()).unwrap().dev() {
            return;
        }
        let (store, _) = store(&dir);
        let temp = staging.path().join("upload-3");
        std::fs::write(&temp, b"moved").unwrap();

        let (name, path) = store.promote(&temp, "b.txt").await.unwrap();

        assert_eq!(name, "b.txt");
        assert_eq!(std::fs::read(path).unwrap(), b"moved");
        assert!(!temp.exists());
    }

    #[tokio::test]
    async fn test_init_urls_only_for_existing_versions() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = store(&dir);
        write(dir.path().join("files").join("thumbnail").join("a.png"));
        let urls = PublicUrls::new(&store.config, Some("h"));

        let mut record = FileRecord::new("a.png", 4, None);
        store.init_urls(&mut record, &urls).await;

        assert_eq!(record.url(None), Some("http://h/files/a.png"));
        assert_eq!(record.url(Some("thumbnail")), Some("http://h/files/thumbnail/a.png"));
        assert_eq!(record.url(Some("large")), None);
        assert_eq!(record.delete_url.as_deref(), Some("http://h/files/a.png"));
    }

    #[tokio::test]
    async fn test_list_skips_hidden_and_directories() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = store(&dir);
        write(dir.path().join("files").join("b.txt"));
        write(dir.path().join("files").join("a.png"));
        write(dir.path().join("files").join(".hidden"));
        write(dir.path().join("files").join("thumbnail").join("a.png"));

        let files = store.list(&PublicUrls::new(&store.config, None)).await.unwrap();

        let names: Vec<_> = files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, ["a.png", "b.txt"]);
        assert_eq!(files[0].url(Some("thumbnail")), Some("http://localhost/files/thumbnail/a.png"));
    }

    #[tokio::test]
    async fn test_delete_removes_original_and_versions() {
        let dir = tempfile::tempdir().unwrap();
        let (store, events) = store(&dir);
        let mut rx = events.subscribe();
        let files = dir.path().join("files");
        write(files.join("a.png"));
        write(files.join("thumbnail").join("a.png"));
        write(files.join("large").join("a.png"));

        store.delete("a.png").await.unwrap();

        assert!(!files.join("a.png").exists());
        assert!(!files.join("thumbnail").join("a.png").exists());
        assert!(!files.join("large").join("a.png").exists());
        assert_eq!(rx.try_recv().unwrap(), UploadEvent::Delete("a.png".to_string()));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_delete_missing_file_emits_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let (store, events) = store(&dir);
        let mut rx = events.subscribe();

        let result = store.delete("missing.png").await;

        assert!(matches!(result, Err(UploadError::NotFound(_))));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_delete_refuses_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = store(&dir);
        for name in ["../secret", ".env", "a/b.png", ""] {
            assert!(matches!(
                store.delete(name).await,
                Err(UploadError::InvalidName(_))
            ));
        }
    }
}
