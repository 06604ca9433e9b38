//! Remote segment store backed by the disk API.
//!
//! The disk API exposes volumes and their segments as an authenticated JSON
//! HTTP surface. This client maps the [`SegmentStore`] contract onto it;
//! every call is a single request, and HTTP 404 on segment reads is how the
//! API reports an unwritten segment.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::store::SegmentStore;
use crate::types::{LeaseGrant, SegmentVolumeInfo, VolumeSpec};

/// Client for a remote disk API endpoint.
#[derive(Debug, Clone)]
pub struct RemoteSegmentStore {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

#[derive(Debug, Serialize)]
struct LeaseRequest<'a> {
    node_id: &'a str,
    app_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
}

impl RemoteSegmentStore {
    /// Creates a client for the disk API at `base_url`, authenticating with
    /// the given bearer token.
    #[must_use]
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self {
            client: reqwest::Client::new(),
            base_url,
            token: token.into(),
        }
    }

    /// The endpoint this client talks to.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn volume_url(&self, volume_id: &str) -> String {
        format!("{}/v1/volumes/{volume_id}", self.base_url)
    }

    fn request(&self, method: reqwest::Method, url: String) -> reqwest::RequestBuilder {
        self.client.request(method, url).bearer_auth(&self.token)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let message = match response.json::<ApiError>().await {
            Ok(body) => body.message,
            Err(_) => status
                .canonical_reason()
                .unwrap_or("unknown error")
                .to_string(),
        };
        Err(Error::Api {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl SegmentStore for RemoteSegmentStore {
    async fn init_container(&self) -> Result<()> {
        // The remote container exists by virtue of the endpoint; a listing
        // doubles as a connectivity check.
        let response = self
            .request(reqwest::Method::GET, format!("{}/v1/volumes", self.base_url))
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn init_volume(&self, spec: &VolumeSpec) -> Result<SegmentVolumeInfo> {
        let response = self
            .request(reqwest::Method::PUT, self.volume_url(&spec.id))
            .json(spec)
            .send()
            .await?;
        let info = Self::check(response).await?.json().await?;
        debug!(volume_id = %spec.id, "remote volume ensured");
        Ok(info)
    }

    async fn volume_info(&self, volume_id: &str) -> Result<SegmentVolumeInfo> {
        let response = self
            .request(reqwest::Method::GET, self.volume_url(volume_id))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(Error::VolumeNotFound {
                id: volume_id.to_string(),
            });
        }
        Ok(Self::check(response).await?.json().await?)
    }

    async fn list_volumes(&self) -> Result<Vec<SegmentVolumeInfo>> {
        let response = self
            .request(reqwest::Method::GET, format!("{}/v1/volumes", self.base_url))
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn list_segments(&self, volume_id: &str) -> Result<Vec<u64>> {
        let url = format!("{}/segments", self.volume_url(volume_id));
        let response = self.request(reqwest::Method::GET, url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(Error::VolumeNotFound {
                id: volume_id.to_string(),
            });
        }
        Ok(Self::check(response).await?.json().await?)
    }

    async fn read_segment(&self, volume_id: &str, index: u64) -> Result<Option<Vec<u8>>> {
        let url = format!("{}/segments/{index}", self.volume_url(volume_id));
        let response = self.request(reqwest::Method::GET, url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(Self::check(response).await?.bytes().await?.to_vec()))
    }

    async fn write_segment(&self, volume_id: &str, index: u64, data: Vec<u8>) -> Result<()> {
        let url = format!("{}/segments/{index}", self.volume_url(volume_id));
        let response = self
            .request(reqwest::Method::PUT, url)
            .body(data)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn acquire_lease(
        &self,
        volume_id: &str,
        node_id: &str,
        app_id: &str,
    ) -> Result<LeaseGrant> {
        let url = format!("{}/lease", self.volume_url(volume_id));
        let response = self
            .request(reqwest::Method::POST, url)
            .json(&LeaseRequest { node_id, app_id })
            .send()
            .await?;

        if response.status() == StatusCode::CONFLICT {
            let holder = response.json::<LeaseGrant>().await?;
            return Err(Error::LeaseHeld {
                id: volume_id.to_string(),
                node_id: holder.node_id,
                app_id: holder.app_id,
            });
        }
        Ok(Self::check(response).await?.json().await?)
    }

    async fn release_lease(&self, volume_id: &str, nonce: &str) -> Result<()> {
        let url = format!("{}/lease/{nonce}", self.volume_url(volume_id));
        let response = self.request(reqwest::Method::DELETE, url).send().await?;
        // An absent lease means the release already happened.
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        if response.status() == StatusCode::CONFLICT {
            return Err(Error::LeaseNonceMismatch {
                id: volume_id.to_string(),
            });
        }
        Self::check(response).await?;
        Ok(())
    }
}
