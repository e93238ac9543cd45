use anyhow::bail;
use anyhow::Context as _;
use async_trait::async_trait;
use base64::prelude::BASE64_STANDARD;
use base64::Engine;

/// Resolves the restreamer host a camera URI should be probed through.
#[async_trait]
pub trait RestreamerProvider: Send + Sync {
    async fn provide_restreamer(&self, uri: &str) -> anyhow::Result<String>;
}

/// Client for the restreamer allocator service.
pub struct HttpRestreamerProvider {
    base_url: String,
    client: reqwest::Client,
}

impl HttpRestreamerProvider {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_owned();
        Self {
            base_url,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl RestreamerProvider for HttpRestreamerProvider {
    async fn provide_restreamer(&self, uri: &str) -> anyhow::Result<String> {
        let response = self
            .client
            .get(format!("{}/host", self.base_url))
            .query(&[("uri", uri)])
            .send()
            .await
            .context("HTTP get host")?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            bail!("no restreamer host available");
        }
        let response = response.error_for_status().context("HTTP get host")?;

        let host: String = response.json().await.context("JSON decode host")?;
        Ok(host)
    }
}

/// Rewrites a camera URI to pull through `host`. The restreamer decodes
/// the base64 path segment to learn which upstream to fetch, so many
/// probes can share a single upstream camera connection.
pub fn restream_uri(host: &str, original_uri: &str) -> String {
    format!("rtsp://{host}/{}", BASE64_STANDARD.encode(original_uri))
}
