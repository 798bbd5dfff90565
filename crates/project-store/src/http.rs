use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, Method, RequestBuilder, Response};
use tracing::info;
use url::Url;

use crate::error::{StoreError, StoreResult};

/// Default timeout for storage requests.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared HTTP client for the Supabase REST and storage APIs. Owns the
/// connection pool, base URL and API key. Clone is a cheap Arc refcount bump.
#[derive(Clone)]
pub(crate) struct HttpClient {
    inner: Arc<Inner>,
}

struct Inner {
    client: Client,
    base: Url,
    api_key: String,
}

impl HttpClient {
    pub(crate) fn new(base: &str, api_key: String) -> StoreResult<Self> {
        let base = Url::parse(base)
            .map_err(|e| StoreError::Internal(format!("invalid base url {base:?}: {e}")))?;
        if base.cannot_be_a_base() {
            return Err(StoreError::Internal(format!("invalid base url {base}")));
        }

        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| StoreError::Internal(format!("http client: {e}")))?;

        info!(base = %base, "storage http client initialized");

        Ok(Self {
            inner: Arc::new(Inner {
                client,
                base,
                api_key,
            }),
        })
    }

    /// Base URL extended with `segments`. Segments containing `/` are split,
    /// every piece is percent-encoded on its own.
    pub(crate) fn url(&self, segments: &[&str], query: &[(&str, &str)]) -> StoreResult<Url> {
        let mut url = self.inner.base.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|()| StoreError::Internal("base url cannot carry a path".into()))?;
            path.pop_if_empty();
            for segment in segments {
                path.extend(segment.split('/'));
            }
        }
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        Ok(url)
    }

    /// Build an authenticated request with both the `apikey` header and the
    /// bearer token Supabase expects.
    pub(crate) fn request(&self, method: Method, url: Url) -> RequestBuilder {
        self.inner
            .client
            .request(method, url)
            .header("apikey", &self.inner.api_key)
            .bearer_auth(&self.inner.api_key)
    }
}

/// Send `req`, turning transport errors and non-2xx statuses into
/// [`StoreError::Api`] tagged with `what`.
pub(crate) async fn send(req: RequestBuilder, what: &str) -> StoreResult<Response> {
    let resp = req
        .send()
        .await
        .map_err(|e| StoreError::Api(format!("{what}: {e}")))?;

    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(StoreError::Api(format!("{what} {status}: {body}")));
    }
    Ok(resp)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_appends_and_encodes_segments() {
        let http = HttpClient::new("https://abc.supabase.co/", "key".into()).unwrap();
        let url = http
            .url(
                &["storage/v1/object", "projects", "site-1/app/my page.js"],
                &[],
            )
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://abc.supabase.co/storage/v1/object/projects/site-1/app/my%20page.js"
        );
    }

    #[test]
    fn url_keeps_base_path_and_adds_query() {
        let http = HttpClient::new("http://localhost:54321/base", "key".into()).unwrap();
        let url = http
            .url(&["rest/v1", "projects"], &[("id", "eq.site-1"), ("select", "*")])
            .unwrap();
        assert_eq!(
            url.as_str(),
            "http://localhost:54321/base/rest/v1/projects?id=eq.site-1&select=*"
        );
    }

    #[test]
    fn rejects_non_base_url() {
        assert!(HttpClient::new("mailto:someone@example.com", "key".into()).is_err());
        assert!(HttpClient::new("not a url", "key".into()).is_err());
    }
}
