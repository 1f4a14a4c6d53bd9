use std::time::Duration;

use plugin_mirror::{Catalog, CatalogError, CatalogSource, ProductVersion};
use reqwest::Url;

use crate::xml;

/// Fetches `plugin-repository` catalogs from an upstream marketplace.
pub struct CatalogClient {
    client: reqwest::Client,
    base_url: String,
    upstream_url: String,
}

impl CatalogClient {
    /// `base_url` serves `/plugins/list/`; `upstream_url` serves
    /// `/plugin/download` and is used for entries without an explicit URL.
    pub fn new(base_url: impl Into<String>, upstream_url: impl Into<String>) -> Self {
        Self::with_client(default_client(), base_url, upstream_url)
    }

    pub fn with_client(
        client: reqwest::Client,
        base_url: impl Into<String>,
        upstream_url: impl Into<String>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            upstream_url: upstream_url.into(),
        }
    }

    /// `{base_url}/plugins/list/?build={version}`
    pub fn list_url(&self, version: &ProductVersion) -> Result<Url, CatalogError> {
        Url::parse_with_params(
            &format!("{}/plugins/list/", self.base_url.trim_end_matches('/')),
            &[("build", version.as_str())],
        )
        .map_err(|e| CatalogError::Unreachable(format!("invalid catalog URL: {e}")))
    }

    /// `{upstream_url}/plugin/download`, before query parameters.
    pub fn download_endpoint(&self) -> Result<Url, CatalogError> {
        Url::parse(&format!(
            "{}/plugin/download",
            self.upstream_url.trim_end_matches('/')
        ))
        .map_err(|e| CatalogError::Unreachable(format!("invalid upstream URL: {e}")))
    }
}

fn default_client() -> reqwest::Client {
    reqwest::Client::builder()
        .user_agent(crate::USER_AGENT)
        .connect_timeout(Duration::from_secs(30))
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

#[async_trait::async_trait]
impl CatalogSource for CatalogClient {
    fn label(&self) -> &str {
        &self.base_url
    }

    async fn fetch_catalog(&self, version: &ProductVersion) -> Result<Catalog, CatalogError> {
        let url = self.list_url(version)?;
        let endpoint = self.download_endpoint()?;
        tracing::debug!(%version, %url, "fetching catalog");

        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| CatalogError::Unreachable(format!("{url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(CatalogError::Unreachable(format!("{url}: HTTP {status}")));
        }

        let body = response
            .text()
            .await
            .map_err(|e| CatalogError::Unreachable(format!("{url}: reading body failed: {e}")))?;

        let catalog = xml::parse_catalog(version, &body, &endpoint)?;
        tracing::info!(
            %version,
            entries = catalog.entries.len(),
            "loaded plugin list"
        );
        Ok(catalog)
    }
}
