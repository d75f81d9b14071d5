use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use labstage_core::StorageLocation;

use crate::event::{MetadataError, ObjectMetadata, ObjectMetadataSource};

pub const SIDECAR_SUFFIX: &str = ".meta.json";

/// Filesystem-backed object store: `<root>/<bucket>/<key>`, with declared
/// user metadata in a `<key>.meta.json` sidecar.
///
/// Sidecar keys are matched case-insensitively, with or without the
/// `x-amz-meta-` prefix, and `_` is accepted in place of `-`.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn bucket_dir(&self, bucket: &str) -> PathBuf {
        self.root.join(bucket)
    }

    /// `None` for keys that would escape the bucket directory.
    pub fn object_path(&self, location: &StorageLocation) -> Option<PathBuf> {
        let key = Path::new(&location.key);
        let safe = !location.bucket.is_empty()
            && !location.bucket.contains(['/', '\\'])
            && location.bucket != ".."
            && key.components().all(|c| matches!(c, Component::Normal(_)));
        safe.then(|| self.bucket_dir(&location.bucket).join(key))
    }

    /// Store an object and its sidecar. Used by tests and local tooling.
    pub async fn put(
        &self,
        location: &StorageLocation,
        bytes: &[u8],
        metadata: &[(&str, &str)],
    ) -> std::io::Result<PathBuf> {
        let path = self.object_path(location).ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, format!("unsafe object key {location}"))
        })?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let sidecar: HashMap<&str, &str> = metadata.iter().copied().collect();
        let json = serde_json::to_vec_pretty(&sidecar)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        tokio::fs::write(sidecar_path(&path), json).await?;
        tokio::fs::write(&path, bytes).await?;
        Ok(path)
    }

    /// Key of a file under `<root>/<bucket>`, with `/` separators.
    pub fn key_for(&self, bucket: &str, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(self.bucket_dir(bucket)).ok()?;
        let parts: Option<Vec<&str>> = relative
            .components()
            .map(|c| match c {
                Component::Normal(part) => part.to_str(),
                _ => None,
            })
            .collect();
        let parts = parts?;
        (!parts.is_empty()).then(|| parts.join("/"))
    }
}

pub fn is_sidecar(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.ends_with(SIDECAR_SUFFIX))
}

/// The object a sidecar path describes.
pub fn object_for_sidecar(path: &Path) -> Option<PathBuf> {
    let name = path.file_name()?.to_str()?;
    let object = name.strip_suffix(SIDECAR_SUFFIX).filter(|n| !n.is_empty())?;
    Some(path.with_file_name(object))
}

fn sidecar_path(object: &Path) -> PathBuf {
    let mut name = object.as_os_str().to_os_string();
    name.push(SIDECAR_SUFFIX);
    PathBuf::from(name)
}

fn normalize_meta_key(key: &str) -> String {
    let key = key.trim().to_ascii_lowercase().replace('_', "-");
    key.strip_prefix("x-amz-meta-").map(str::to_string).unwrap_or(key)
}

impl ObjectMetadataSource for LocalObjectStore {
    async fn head(&self, location: &StorageLocation) -> Result<ObjectMetadata, MetadataError> {
        let lookup = |detail: String| MetadataError::Lookup {
            location: location.clone(),
            detail,
        };
        let path = self
            .object_path(location)
            .ok_or_else(|| MetadataError::NotFound(location.clone()))?;

        let stat = match tokio::fs::metadata(&path).await {
            Ok(stat) if stat.is_file() => stat,
            Ok(_) => return Err(MetadataError::NotFound(location.clone())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(MetadataError::NotFound(location.clone()))
            }
            Err(e) => return Err(lookup(e.to_string())),
        };
        let last_modified = stat.modified().ok().map(DateTime::<Utc>::from);

        let sidecar: HashMap<String, String> = match tokio::fs::read(sidecar_path(&path)).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| lookup(format!("unreadable metadata sidecar: {e}")))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(lookup(e.to_string())),
        };
        let mut fields: HashMap<String, String> = sidecar
            .into_iter()
            .map(|(k, v)| (normalize_meta_key(&k), v))
            .collect();

        Ok(ObjectMetadata {
            patient_id: fields.remove("patient-id"),
            document_type: fields.remove("document-type"),
            last_modified,
        })
    }
}

/// In-memory metadata source.
#[derive(Debug, Clone, Default)]
pub struct StaticMetadataSource {
    objects: HashMap<StorageLocation, ObjectMetadata>,
}

impl StaticMetadataSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, location: StorageLocation, metadata: ObjectMetadata) -> Self {
        self.objects.insert(location, metadata);
        self
    }
}

impl ObjectMetadataSource for StaticMetadataSource {
    async fn head(&self, location: &StorageLocation) -> Result<ObjectMetadata, MetadataError> {
        self.objects
            .get(location)
            .cloned()
            .ok_or_else(|| MetadataError::NotFound(location.clone()))
    }
}
