// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Cache-aware HTTP client.

An explicit handle wrapping a [reqwest::Client] and a [DiskCache], passed
through the pipeline instead of mutating any process-wide state. Fresh
cache entries are served without network I/O; stale entries are
revalidated with conditional requests; transient failures retry with
backoff.
*/

use {
    crate::{
        cache::DiskCache,
        error::{BuildError, Result},
    },
    reqwest::{header, Client, StatusCode},
    std::{collections::BTreeMap, time::Duration},
    tracing::debug,
    url::Url,
};

/// Attempts per request for transient failures (timeouts, 5xx).
const TRANSIENT_ATTEMPTS: usize = 3;
const BACKOFF_BASE: Duration = Duration::from_millis(500);

/// HTTP client with transparent disk caching.
#[derive(Clone, Debug)]
pub struct CachingClient {
    http: Client,
    cache: DiskCache,
}

impl CachingClient {
    pub fn new(cache: DiskCache) -> Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("deboci/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self { http, cache })
    }

    /// GET a URL, honoring the disk cache.
    ///
    /// On a fresh cache hit no request is issued. On a stale hit a
    /// conditional request revalidates the entry; `304` serves the cached
    /// body. `no-store` responses are returned without being cached.
    pub async fn get(&self, url: &Url) -> Result<Vec<u8>> {
        let now = chrono::Utc::now().timestamp();
        let url_str = url.as_str();

        let cached = self.cache.lookup(url_str, now)?;

        if let Some(entry) = &cached {
            if entry.metadata.is_fresh(now) {
                debug!(url = url_str, "cache hit (fresh)");
                return Ok(std::fs::read(&entry.body_path)?);
            }
        }

        let mut request = self.http.get(url.clone());

        if let Some(entry) = &cached {
            if let Some(etag) = entry.metadata.etag() {
                request = request.header(header::IF_NONE_MATCH, etag);
            }
            if let Some(last_modified) = entry.metadata.last_modified() {
                request = request.header(header::IF_MODIFIED_SINCE, last_modified);
            }
        }

        let response = self.send_with_retry(request).await?;

        if response.status() == StatusCode::NOT_MODIFIED {
            if let Some(entry) = &cached {
                debug!(url = url_str, "cache hit (revalidated)");
                self.cache.refresh(url_str, now)?;
                return Ok(std::fs::read(&entry.body_path)?);
            }
        }

        let response = response.error_for_status()?;

        let headers = cacheable_headers(&response);
        let body = response.bytes().await?.to_vec();

        self.cache.store(url_str, headers, &body, now)?;

        Ok(body)
    }

    async fn send_with_retry(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let mut last_err: Option<BuildError> = None;

        for attempt in 0..TRANSIENT_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(BACKOFF_BASE * attempt as u32).await;
            }

            let request = request
                .try_clone()
                .expect("GET requests have no streaming body");

            match request.send().await {
                Ok(response) if response.status().is_server_error() => {
                    debug!(
                        status = %response.status(),
                        attempt,
                        "server error; retrying"
                    );
                    last_err = Some(BuildError::Reqwest(
                        response.error_for_status().expect_err("status is 5xx"),
                    ));
                }
                Ok(response) => return Ok(response),
                Err(e) if e.is_timeout() || e.is_connect() || e.is_request() => {
                    debug!(error = %e, attempt, "transient request failure; retrying");
                    last_err = Some(e.into());
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(last_err.expect("at least one attempt happened"))
    }
}

fn cacheable_headers(response: &reqwest::Response) -> BTreeMap<String, String> {
    ["etag", "last-modified", "cache-control", "date"]
        .into_iter()
        .filter_map(|name| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|v| (name.to_string(), v.to_string()))
        })
        .collect()
}
