//! Support to download size metadata from the HTTP endpoint.

use futures::future::BoxFuture;
use reqwest::{Client, header};
use url::Url;

use crate::caching::FetchError;
use crate::config::Config;
use crate::normalize::RawPayload;
use crate::utils::http::{DownloadTimeouts, create_client};

use super::{SizeInfoFetcher, USER_AGENT};

/// Fetcher implementation that queries the size-metadata endpoint.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
    endpoint: Url,
    timeouts: DownloadTimeouts,
}

impl HttpFetcher {
    pub fn new(client: Client, endpoint: Url, timeouts: DownloadTimeouts) -> Self {
        Self {
            client,
            endpoint,
            timeouts,
        }
    }

    /// Creates a fetcher for the configured endpoint, with its own client.
    pub fn from_config(config: &Config) -> Result<Self, FetchError> {
        let timeouts = DownloadTimeouts::from_config(config);
        let client = create_client(&timeouts)?;
        Ok(Self::new(client, config.endpoint.clone(), timeouts))
    }

    /// The URL queried for the given garment.
    pub fn request_url(&self, garment_id: &str, brand: &str) -> Url {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut()
            .append_pair("ClothID", garment_id)
            .append_pair("Brand", brand);
        url
    }

    async fn download(&self, garment_id: &str, brand: &str) -> Result<RawPayload, FetchError> {
        let url = self.request_url(garment_id, brand);
        tracing::debug!("Fetching size info from `{}`", url);

        let request = self
            .client
            .get(url)
            .header(header::CONTENT_TYPE, "text/plain")
            .header(header::USER_AGENT, USER_AGENT)
            .send();

        let response = match tokio::time::timeout(self.timeouts.head, request).await {
            Ok(response) => response?,
            Err(_) => {
                return Err(FetchError::Network(format!(
                    "no response headers within {:?}",
                    self.timeouts.head
                )));
            }
        };

        let status = response.status();
        if !status.is_success() {
            tracing::debug!(%status, "Unexpected status code from size info endpoint");
            return Err(FetchError::Status(status.as_u16()));
        }

        let body = response.text().await?;
        Ok(serde_json::from_str(&body)?)
    }
}

impl SizeInfoFetcher for HttpFetcher {
    fn fetch<'a>(
        &'a self,
        garment_id: &'a str,
        brand: &'a str,
    ) -> BoxFuture<'a, Result<RawPayload, FetchError>> {
        Box::pin(self.download(garment_id, brand))
    }
}
