use crate::api::models::PreviewLookupResponse;
use crate::api::preview::{
    cache_bust_token, is_resolvable, ByteFetcher, EncodedBytes, PreviewResolver,
};
use crate::config::EngineConfig;
use crate::error::{AppError, AppResult};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};

/// HTTP client for the preview catalog lookup and the byte relay.
pub struct CatalogClient {
    http: reqwest::Client,
    catalog_url: String,
    relay_url: String,
}

impl CatalogClient {
    pub fn new(config: &EngineConfig) -> AppResult<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let http = reqwest::Client::builder()
            .user_agent(config.user_agent.as_str())
            .timeout(config.request_timeout())
            .default_headers(headers)
            .build()?;

        Ok(Self {
            http,
            catalog_url: config.catalog_url.clone(),
            relay_url: config.relay_url.clone(),
        })
    }

    pub fn http_client(&self) -> &reqwest::Client {
        &self.http
    }

    /// Look up a preview URL. `Ok(None)` is a clean miss.
    pub async fn lookup(
        &self,
        title: &str,
        artist: &str,
        bust_cache: bool,
    ) -> AppResult<Option<String>> {
        let query = lookup_query(title, artist, bust_cache);
        let response = self
            .http
            .get(&self.catalog_url)
            .query(&query)
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            log::warn!(
                "Preview lookup for {} - {} returned HTTP {}",
                artist,
                title,
                status
            );
            return Ok(None);
        }

        let body: PreviewLookupResponse = response.json().await?;
        Ok(body.into_url())
    }

    /// The same-origin address that streams back the bytes of `preview_url`.
    pub fn relay_url_for(&self, preview_url: &str) -> AppResult<url::Url> {
        let mut relay = url::Url::parse(&self.relay_url)
            .map_err(|e| AppError::Config(format!("Invalid relay_url: {}", e)))?;
        relay.query_pairs_mut().append_pair("url", preview_url);
        Ok(relay)
    }

    pub async fn fetch_bytes(&self, preview_url: &str) -> AppResult<EncodedBytes> {
        let relay = self.relay_url_for(preview_url)?;
        log::debug!("Fetching preview bytes via {}", relay);

        let response = self.http.get(relay).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(AppError::Relay {
                status: status.as_u16(),
            });
        }

        let bytes = response.bytes().await?;
        log::debug!("Relay delivered {} bytes", bytes.len());
        Ok(EncodedBytes::from(bytes.as_ref()))
    }
}

/// Query parameters for a catalog lookup.
pub fn lookup_query(title: &str, artist: &str, bust_cache: bool) -> Vec<(&'static str, String)> {
    let mut query = vec![
        ("artist", artist.trim().to_string()),
        ("title", title.trim().to_string()),
    ];
    if bust_cache {
        query.push(("_", cache_bust_token()));
    }
    query
}

impl PreviewResolver for CatalogClient {
    fn resolve<'a>(
        &'a self,
        title: &'a str,
        artist: &'a str,
        bust_cache: bool,
    ) -> BoxFuture<'a, Option<String>> {
        async move {
            if !is_resolvable(title, artist) {
                log::debug!("Skipping preview lookup for blank title/artist");
                return None;
            }
            match self.lookup(title, artist, bust_cache).await {
                Ok(Some(url)) => Some(url),
                Ok(None) => {
                    log::debug!("No preview for {} - {}", artist, title);
                    None
                }
                Err(e) => {
                    log::warn!("Preview lookup for {} - {} failed: {}", artist, title, e);
                    None
                }
            }
        }
        .boxed()
    }
}

impl ByteFetcher for CatalogClient {
    fn fetch<'a>(&'a self, url: &'a str) -> BoxFuture<'a, AppResult<EncodedBytes>> {
        self.fetch_bytes(url).boxed()
    }
}
