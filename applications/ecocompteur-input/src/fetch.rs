use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::debug;

use crate::error::{AppError, Result};

pub const INDEX_PATH: &str = "/1.html";
pub const JSON_PATH: &str = "/inst.json";

/// HTTP access to the single meter endpoint.
#[derive(Debug, Clone)]
pub struct Fetcher {
    client: Client,
    base_url: String,
}

impl Fetcher {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// GET `path` and return the body of a 200 response.
    pub async fn fetch(&self, path: &str) -> Result<String> {
        let url = format!("{}{}", self.base_url, path);
        debug!(url = %url, "loading");

        let fetch_err = |reason: String| AppError::Fetch {
            path: path.to_string(),
            reason,
        };

        let res = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| fetch_err(describe(&e)))?;

        let status = res.status();
        if status != StatusCode::OK {
            return Err(fetch_err(format!("bad status code {status}")));
        }

        res.text().await.map_err(|e| fetch_err(describe(&e)))
    }
}

fn describe(e: &reqwest::Error) -> String {
    if e.is_timeout() {
        format!("timed out: {e}")
    } else if e.is_connect() {
        format!("connection failed: {e}")
    } else {
        e.to_string()
    }
}
