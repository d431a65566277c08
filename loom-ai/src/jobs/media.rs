//! Generated artifact storage under `<root>/media`

use std::path::{Path, PathBuf};

use loom_common::Result;
use uuid::Uuid;

use crate::provider::ImageOutput;

/// URL prefix the media directory is served under
pub const MEDIA_URL_PREFIX: &str = "/media";

#[derive(Debug, Clone)]
pub struct MediaStore {
    root: PathBuf,
    url_prefix: String,
}

impl MediaStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            url_prefix: MEDIA_URL_PREFIX.to_string(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Write an image as `<root>/<timeline>/<stem>-<uuid>.<ext>` and return its URL
    pub async fn save(&self, timeline_id: Uuid, stem: &str, image: &ImageOutput) -> Result<String> {
        let dir = self.root.join(timeline_id.to_string());
        tokio::fs::create_dir_all(&dir).await?;

        let file_name = format!("{}-{}.{}", stem, Uuid::new_v4(), image.extension());
        let path = dir.join(&file_name);

        // Write to a temp name first so readers never see a partial file
        let tmp_path = dir.join(format!(".{}.tmp", file_name));
        tokio::fs::write(&tmp_path, &image.image).await?;
        tokio::fs::rename(&tmp_path, &path).await?;

        tracing::debug!(path = %path.display(), bytes = image.image.len(), "Artifact written");
        Ok(format!("{}/{}/{}", self.url_prefix, timeline_id, file_name))
    }
}
