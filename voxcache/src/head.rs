//! # Head-file fetch
//!
//! The service serves a pre-decrypted prefix of each audio object (the
//! "head file") from a dedicated host for instant playback starts. The
//! blob is fetched with a single GET of
//! `https://heads-fa.<service-host>/head/<file_id_hex>`.

use bytes::Bytes;
use thiserror::Error;
use tracing::debug;
use voxid::FileId;

/// Failure fetching a head blob, classified by cause.
#[derive(Error, Debug)]
pub enum HeadFileError {
    #[error("HTTP status {status} fetching head file {file_id}")]
    HttpError { file_id: FileId, status: u16 },

    #[error("network error fetching head file {file_id}: {source}")]
    NetworkError {
        file_id: FileId,
        #[source]
        source: reqwest::Error,
    },
}

impl HeadFileError {
    pub fn file_id(&self) -> &FileId {
        match self {
            HeadFileError::HttpError { file_id, .. } => file_id,
            HeadFileError::NetworkError { file_id, .. } => file_id,
        }
    }
}

/// Client for the instant-start head endpoint.
pub struct HeadFileClient {
    client: reqwest::Client,
    base_url: String,
}

impl HeadFileClient {
    /// `base_url` is the head host origin, e.g.
    /// `https://heads-fa.example.com`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    fn url_for(&self, file_id: &FileId) -> String {
        format!(
            "{}/head/{}",
            self.base_url.trim_end_matches('/'),
            file_id.to_base16()
        )
    }

    /// Fetches the head blob, failing with a classified error.
    pub async fn fetch_head(&self, file_id: &FileId) -> Result<Bytes, HeadFileError> {
        let url = self.url_for(file_id);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|source| HeadFileError::NetworkError {
                file_id: *file_id,
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(HeadFileError::HttpError {
                file_id: *file_id,
                status: status.as_u16(),
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|source| HeadFileError::NetworkError {
                file_id: *file_id,
                source,
            })?;
        debug!(file = %file_id, bytes = body.len(), "head file fetched");
        Ok(body)
    }

    /// Best-effort variant: any failure becomes `None`.
    pub async fn try_fetch_head(&self, file_id: &FileId) -> Option<Bytes> {
        match self.fetch_head(file_id).await {
            Ok(body) => Some(body),
            Err(e) => {
                debug!("head file unavailable: {e}");
                None
            }
        }
    }
}
