//! HTTP transport shared by the provider clients.
//!
//! Handles authentication headers, status mapping, rate-limit detection and
//! link-header pagination.

use chrono::Utc;
use prflow_core::{GitError, GitResult};
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use tracing::debug;
use url::Url;

/// Items requested per page on paginated listings.
pub const PAGE_SIZE: u32 = 100;

/// Reset delay assumed when a rate-limited response carries no reset hint.
const DEFAULT_RESET_SECS: i64 = 60;

/// A response whose status was in the 2xx range.
#[derive(Debug)]
pub struct RawResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: String,
}

impl RawResponse {
    pub fn json<T: DeserializeOwned>(&self) -> GitResult<T> {
        Ok(serde_json::from_str(&self.body)?)
    }
}

#[derive(Clone)]
pub struct Transport {
    client: reqwest::Client,
    headers: HeaderMap,
}

impl Transport {
    pub fn new(headers: HeaderMap) -> GitResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent("prflow")
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| GitError::Request(e.to_string()))?;
        Ok(Self { client, headers })
    }

    /// Headers for bearer-token authentication.
    pub fn bearer_headers(token: Option<&str>, accept: &str) -> GitResult<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(
            reqwest::header::ACCEPT,
            HeaderValue::from_str(accept).map_err(|e| GitError::Request(e.to_string()))?,
        );
        if let Some(token) = token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| GitError::Request(format!("invalid token: {}", e)))?;
            headers.insert(reqwest::header::AUTHORIZATION, value);
        }
        Ok(headers)
    }

    /// Issue one request. Non-2xx statuses become typed errors.
    pub async fn request(
        &self,
        method: Method,
        url: &str,
        body: Option<&serde_json::Value>,
    ) -> GitResult<RawResponse> {
        let mut builder = self
            .client
            .request(method.clone(), url)
            .headers(self.headers.clone());
        if let Some(body) = body {
            builder = builder.json(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| GitError::Request(e.to_string()))?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .text()
            .await
            .map_err(|e| GitError::Request(e.to_string()))?;

        debug!(%method, url, status = status.as_u16(), "git api request");

        if status.is_success() {
            return Ok(RawResponse {
                status,
                headers,
                body,
            });
        }

        if let Some(reset_at) = rate_limit_reset(status, &headers) {
            return Err(GitError::RateLimited {
                reset_at,
                message: format!("code {}", status.as_u16()),
            });
        }

        let message = format!("[{}] {}: {}", method, url, body);
        if status == StatusCode::NOT_FOUND {
            return Err(GitError::NotFound(message));
        }
        Err(GitError::Api {
            status: status.as_u16(),
            message,
        })
    }

    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> GitResult<T> {
        self.request(Method::GET, url, None).await?.json()
    }

    /// Follow `rel="next"` links, decoding each page into a fresh `T` and
    /// handing it to `accumulate`, until the server stops sending one.
    pub async fn paginate<T, F>(&self, url: &str, mut accumulate: F) -> GitResult<()>
    where
        T: DeserializeOwned,
        F: FnMut(T),
    {
        let mut next = Some(with_page_size(url)?);
        while let Some(uri) = next.take() {
            let response = self.request(Method::GET, &uri, None).await?;
            let page: T = response.json()?;
            accumulate(page);
            next = next_link(&response.headers);
        }
        Ok(())
    }

    /// Collect every item of a paginated JSON array listing.
    pub async fn get_all<T: DeserializeOwned>(&self, url: &str) -> GitResult<Vec<T>> {
        let mut items = Vec::new();
        self.paginate::<Vec<T>, _>(url, |page| items.extend(page))
            .await?;
        Ok(items)
    }
}

fn with_page_size(url: &str) -> GitResult<String> {
    let mut parsed = Url::parse(url).map_err(|e| GitError::Request(e.to_string()))?;
    parsed
        .query_pairs_mut()
        .append_pair("per_page", &PAGE_SIZE.to_string());
    Ok(parsed.to_string())
}

/// Reset epoch of a rate-limited response, or `None` when it is not one.
fn rate_limit_reset(status: StatusCode, headers: &HeaderMap) -> Option<i64> {
    let header = |names: &[&str]| {
        names
            .iter()
            .find_map(|name| headers.get(*name))
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<i64>().ok())
    };

    let exhausted = header(&["x-ratelimit-remaining", "ratelimit-remaining"]) == Some(0);
    let limited = status == StatusCode::TOO_MANY_REQUESTS
        || (status == StatusCode::FORBIDDEN && exhausted);
    if !limited {
        return None;
    }

    let now = Utc::now().timestamp();
    let reset = header(&["x-ratelimit-reset", "ratelimit-reset"])
        .or_else(|| header(&["retry-after"]).map(|secs| now + secs))
        .unwrap_or(now + DEFAULT_RESET_SECS);
    Some(reset)
}

/// One entry of an RFC 8288 `Link` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub url: String,
    pub rel: String,
}

pub fn parse_link_header(value: &str) -> Vec<Link> {
    value
        .split(',')
        .filter_map(|part| {
            let mut segments = part.split(';');
            let url = segments
                .next()?
                .trim()
                .strip_prefix('<')?
                .strip_suffix('>')?
                .to_string();
            let rel = segments.find_map(|param| {
                let (key, value) = param.trim().split_once('=')?;
                (key.trim() == "rel").then(|| value.trim().trim_matches('"').to_string())
            })?;
            Some(Link { url, rel })
        })
        .collect()
}

fn next_link(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(reqwest::header::LINK)?.to_str().ok()?;
    parse_link_header(value)
        .into_iter()
        .find(|l| l.rel.split_whitespace().any(|r| r == "next"))
        .map(|l| l.url)
}
