use crate::schema::ObjectRef;
use std::path::{Component, Path, PathBuf};

#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    /// `None` when the object does not exist.
    async fn get(&self, object: &ObjectRef) -> anyhow::Result<Option<Vec<u8>>>;
    async fn put(&self, object: &ObjectRef, body: Vec<u8>) -> anyhow::Result<()>;
    /// Deleting a missing object is not an error.
    async fn delete(&self, object: &ObjectRef) -> anyhow::Result<()>;

    async fn exists(&self, object: &ObjectRef) -> anyhow::Result<bool> {
        Ok(self.get(object).await?.is_some())
    }
}

/// Hot storage laid out as `<root>/<bucket>/<key>`.
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_of(&self, object: &ObjectRef) -> anyhow::Result<PathBuf> {
        let relative = Path::new(&object.bucket).join(&object.key);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if escapes || object.bucket.is_empty() || object.key.is_empty() {
            anyhow::bail!("invalid object reference {object}");
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait::async_trait]
impl ObjectStore for FsObjectStore {
    async fn get(&self, object: &ObjectRef) -> anyhow::Result<Option<Vec<u8>>> {
        let path = self.path_of(object)?;
        match tokio::fs::read(&path).await {
            Ok(body) => Ok(Some(body)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(anyhow::anyhow!("failed to read {object}: {e}")),
        }
    }

    async fn put(&self, object: &ObjectRef, body: Vec<u8>) -> anyhow::Result<()> {
        let path = self.path_of(object)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // write-then-rename so readers never observe a partial object
        let staging = path.with_extension(format!("partial-{}", uuid::Uuid::new_v4().as_simple()));
        tokio::fs::write(&staging, body).await?;
        tokio::fs::rename(&staging, &path).await?;
        Ok(())
    }

    async fn delete(&self, object: &ObjectRef) -> anyhow::Result<()> {
        let path = self.path_of(object)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(anyhow::anyhow!("failed to delete {object}: {e}")),
        }
    }
}
