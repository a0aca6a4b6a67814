use std::time::Duration;

use crate::config::Config;

/// Timeouts applied to requests against the size-metadata endpoint.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DownloadTimeouts {
    /// The timeout for establishing a connection.
    pub connect: Duration,
    /// The timeout for receiving the response headers.
    pub head: Duration,
    /// Global timeout for one request, none by default.
    pub max_download: Option<Duration>,
}

impl DownloadTimeouts {
    pub fn from_config(config: &Config) -> Self {
        Self {
            connect: config.connect_timeout,
            head: config.head_timeout,
            max_download: config.max_download_timeout,
        }
    }
}

impl Default for DownloadTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_millis(500),
            head: Duration::from_secs(5),
            max_download: None,
        }
    }
}

/// Creates a [`reqwest::Client`] with the provided timeouts.
///
/// The head timeout is not a client setting, it is enforced per request by the
/// [`HttpFetcher`](crate::download::HttpFetcher).
pub fn create_client(timeouts: &DownloadTimeouts) -> reqwest::Result<reqwest::Client> {
    let mut builder = reqwest::ClientBuilder::new()
        .gzip(true)
        .connect_timeout(timeouts.connect)
        .pool_idle_timeout(Duration::from_secs(30));

    if let Some(max_download) = timeouts.max_download {
        builder = builder.timeout(max_download);
    }

    builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeouts_from_config() {
        let config = Config {
            connect_timeout: Duration::from_secs(1),
            max_download_timeout: Some(Duration::from_secs(10)),
            ..Default::default()
        };
        let timeouts = DownloadTimeouts::from_config(&config);

        assert_eq!(timeouts.connect, Duration::from_secs(1));
        assert_eq!(timeouts.head, Duration::from_secs(5));
        assert_eq!(timeouts.max_download, Some(Duration::from_secs(10)));
        assert_eq!(
            DownloadTimeouts::from_config(&Config::default()),
            DownloadTimeouts::default()
        );
    }

    #[tokio::test]
    async fn test_client() {
        sizeinfo_test::setup();

        let server = sizeinfo_test::SizeInfoServer::new();

        let response = create_client(&Default::default())
            .unwrap()
            .get(server.url("/garbage_data/OK"))
            .send()
            .await
            .unwrap();

        assert_eq!(response.text().await.unwrap(), "OK");
    }
}
