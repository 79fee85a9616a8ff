use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use serde::Deserialize;
use stacked_errors::StackableErr;

use crate::{
    error::Result,
    options::BuildParams,
    transport::Transport,
};

/// An image known to the daemon. Call [Image::id] to get the full id.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Image {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "RepoTags", default, deserialize_with = "null_as_default")]
    tags: Vec<String>,
    #[serde(rename = "Labels", default, deserialize_with = "null_as_default")]
    labels: BTreeMap<String, String>,
    #[serde(rename = "Created", default)]
    created: Option<String>,
}

fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl Image {
    /// An image handle with only an id
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tags: Vec::new(),
            labels: BTreeMap::new(),
            created: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The first 12 hex digits of the id, without any `sha256:` prefix
    pub fn short_id(&self) -> &str {
        let id = self.id.strip_prefix("sha256:").unwrap_or(&self.id);
        &id[..id.len().min(12)]
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.labels
    }

    pub fn created(&self) -> Option<&str> {
        self.created.as_deref()
    }

    pub fn into_id(self) -> String {
        self.id
    }
}

/// Resolves an image id reported by a build into an [Image]
#[async_trait]
pub trait ImageLookup: Send + Sync {
    async fn get_image(&self, id: &str) -> Result<Image>;
}

/// Image lookups through the daemon's inspect endpoint
#[derive(Debug, Clone)]
pub struct Images<T> {
    transport: Arc<T>,
}

impl<T: Transport> Images<T> {
    pub fn new(transport: Arc<T>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl<T: Transport> ImageLookup for Images<T> {
    #[tracing::instrument(skip(self))]
    async fn get_image(&self, id: &str) -> Result<Image> {
        let response = self
            .transport
            .get(&format!("/images/{id}/json"), &BuildParams::new())
            .await
            .stack_err_with(|| format!("Images::get_image(id: {id})"))?
            .error_for_status()
            .await?;
        let body = response.text().await?;
        let image = serde_json::from_str(&body)
            .stack_err_with(|| format!("Images::get_image(id: {id}) -> unexpected body"))?;
        Ok(image)
    }
}
