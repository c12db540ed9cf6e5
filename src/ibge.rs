use std::sync::Arc;
use std::thread;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde_json::Value;
use tracing::{info, warn};

use crate::cache::{ResponseCache, cache_key};
use crate::error::ImportError;

/// Source of raw geography records. Each call returns the endpoint's JSON array.
pub trait GeographyApi: Send + Sync {
    fn municipios(&self) -> Result<Vec<Value>, ImportError>;
    fn distritos(&self) -> Result<Vec<Value>, ImportError>;
    fn estados(&self) -> Result<Vec<Value>, ImportError>;
}

#[derive(Clone)]
pub struct IbgeHttpClient {
    client: Client,
    base_url: String,
    cache: Arc<dyn ResponseCache>,
    cache_ttl: Duration,
    bypass_cache: bool,
}

impl IbgeHttpClient {
    pub fn new(
        base_url: &str,
        timeout: Duration,
        cache: Arc<dyn ResponseCache>,
        cache_ttl: Duration,
    ) -> Result<Self, ImportError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("ibge-import/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| ImportError::Config(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|err| ImportError::Transport {
                url: base_url.to_string(),
                message: err.to_string(),
            })?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            cache,
            cache_ttl,
            bypass_cache: false,
        })
    }

    /// Skip cache reads; fresh responses still refresh the cache.
    pub fn with_cache_bypass(mut self, bypass: bool) -> Self {
        self.bypass_cache = bypass;
        self
    }

    pub fn endpoint_url(&self, endpoint: &str) -> String {
        format!("{}/{endpoint}", self.base_url)
    }

    fn get_data(&self, endpoint: &str) -> Result<Vec<Value>, ImportError> {
        let url = self.endpoint_url(endpoint);
        let key = cache_key(&url);

        if !self.bypass_cache {
            match self.cache.get(&key) {
                Ok(Some(Value::Array(records))) => {
                    info!(count = records.len(), %endpoint, "using cached response");
                    return Ok(records);
                }
                Ok(Some(_)) => warn!(%endpoint, "cached response is not an array, refetching"),
                Ok(None) => {}
                Err(err) => warn!(%endpoint, error = %err, "cache read failed, refetching"),
            }
        }

        let response = self.send_with_retries(&url, || self.client.get(&url))?;
        if !response.status().is_success() {
            return Err(ImportError::Download {
                url,
                status: response.status().as_u16(),
            });
        }
        let body: Value = response.json().map_err(|err| ImportError::Transport {
            url: url.clone(),
            message: err.to_string(),
        })?;
        if !body.is_array() {
            return Err(ImportError::Transport {
                url,
                message: "expected a JSON array".to_string(),
            });
        }

        if let Err(err) = self.cache.set(&key, &body, self.cache_ttl) {
            warn!(%endpoint, error = %err, "failed to store response in cache");
        }
        let records: Vec<Value> =
            serde_json::from_value(body).map_err(|err| ImportError::Transport {
                url: url.clone(),
                message: err.to_string(),
            })?;
        info!(count = records.len(), %endpoint, "loaded records from API");
        Ok(records)
    }

    fn send_with_retries<F>(
        &self,
        url: &str,
        mut make_req: F,
    ) -> Result<reqwest::blocking::Response, ImportError>
    where
        F: FnMut() -> reqwest::blocking::RequestBuilder,
    {
        const MAX_RETRIES: usize = 3;
        const BASE_DELAY_MS: u64 = 200;
        let mut attempt = 0usize;
        loop {
            let response = make_req().send();
            match response {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < MAX_RETRIES && is_retryable_status(status) {
                        warn!(%url, status, attempt, "retrying request");
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < MAX_RETRIES && is_retryable_error(&err) {
                        warn!(%url, error = %err, attempt, "retrying request");
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Err(ImportError::Transport {
                        url: url.to_string(),
                        message: err.to_string(),
                    });
                }
            }
        }
    }
}

impl GeographyApi for IbgeHttpClient {
    fn municipios(&self) -> Result<Vec<Value>, ImportError> {
        self.get_data("municipios")
    }

    fn distritos(&self) -> Result<Vec<Value>, ImportError> {
        self.get_data("distritos")
    }

    fn estados(&self) -> Result<Vec<Value>, ImportError> {
        self.get_data("estados")
    }
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::cache::MemoryCache;

    #[test]
    fn serves_cached_array_without_network() {
        let cache = Arc::new(MemoryCache::new());
        // Unroutable base: any network access would fail the test.
        let client = IbgeHttpClient::new(
            "http://127.0.0.1:9/api",
            Duration::from_millis(200),
            cache.clone(),
            Duration::from_secs(60),
        )
        .unwrap();
        let url = client.endpoint_url("estados");
        cache
            .set(&cache_key(&url), &json!([{"id": 11}]), Duration::from_secs(60))
            .unwrap();

        let records = client.estados().unwrap();
        assert_eq!(records, vec![json!({"id": 11})]);
    }

    #[test]
    fn endpoint_url_joins_base() {
        let client = IbgeHttpClient::new(
            "http://localhost/api/",
            Duration::from_secs(1),
            Arc::new(MemoryCache::new()),
            Duration::from_secs(1),
        )
        .unwrap();
        assert_eq!(client.endpoint_url("distritos"), "http://localhost/api/distritos");
    }
}
