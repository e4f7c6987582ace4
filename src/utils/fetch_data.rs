use anyhow::Result;
use reqwest::Client;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::warn;

/// Retrying JSON GET used for every REST collaborator call. Transient
/// network errors and non-2xx statuses are retried with exponential
/// backoff up to `retries` attempts, then surfaced to the caller.
pub struct HttpFetcher {
    client: Client,
    retries: u32,
}

impl HttpFetcher {
    pub fn new(timeout_ms: u64, retries: u32) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()?;
        Ok(HttpFetcher { client, retries })
    }

    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        let retry_delay = Duration::from_secs(1);

        for attempt in 1..=self.retries {
            let result = self.client.get(url).send().await;
            match result {
                Ok(response) => {
                    if response.status().is_success() {
                        return Ok(response.json().await?);
                    }
                    let status = response.status();
                    if attempt < self.retries {
                        let delay = retry_delay * (1 << (attempt - 1));
                        warn!(%url, %status, attempt, "http error, retrying after backoff");
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    anyhow::bail!("HTTP error {status} fetching {url}");
                }
                Err(e) => {
                    let transient = e.is_timeout() || e.is_connect() || e.is_request();
                    if transient && attempt < self.retries {
                        let delay = retry_delay * (1 << (attempt - 1));
                        warn!(%url, error = %e, attempt, "network error, retrying after backoff");
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    return Err(e.into());
                }
            }
        }

        unreachable!("retry loop always returns")
    }
}
