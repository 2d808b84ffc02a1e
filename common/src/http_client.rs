use crate::errors::AppError;
use reqwest::{Client, Url};
use std::time::Duration;
use tracing::{error, info, instrument, warn};

/// HTTP client with retry logic and timeout
pub struct HttpClient {
    client: Client,
    max_retries: u32,
    timeout: Duration,
}

impl HttpClient {
    pub fn new(timeout_secs: u64, max_retries: u32) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;

        Ok(Self {
            client,
            max_retries,
            timeout: Duration::from_secs(timeout_secs),
        })
    }

    /// Fetch JSON with retry and exponential backoff, encoding `params` into
    /// the query string.
    ///
    /// The query string is not recorded in spans since it may carry credentials.
    #[instrument(skip(self, params), fields(url = %url))]
    pub async fn get_json_with_query<T>(
        &self,
        url: &str,
        params: &[(&str, &str)],
    ) -> Result<T, AppError>
    where
        T: serde::de::DeserializeOwned,
    {
        let url = Url::parse_with_params(url, params)
            .map_err(|e| AppError::internal(format!("Invalid URL: {}", e)))?;
        self.get_json_url(url).await
    }

    async fn get_json_url<T>(&self, url: Url) -> Result<T, AppError>
    where
        T: serde::de::DeserializeOwned,
    {
        let target = format!(
            "{}://{}{}",
            url.scheme(),
            url.host_str().unwrap_or_default(),
            url.path()
        );
        let mut last_error = None;

        for attempt in 0..=self.max_retries {
            let span = tracing::span!(tracing::Level::INFO, "http_request", attempt = attempt + 1);
            let _enter = span.enter();

            match self.fetch_with_timeout(&url, &target).await {
                Ok(response) => {
                    info!(url = %target, attempt = attempt + 1, "Request successful");
                    return Ok(response);
                }
                Err(e) if !is_retryable(&e) => {
                    warn!(url = %target, error = %e, "Request failed with non-retryable error");
                    return Err(e);
                }
                Err(e) => {
                    last_error = Some(e);
                    if attempt < self.max_retries {
                        let backoff = Duration::from_millis(2_u64.pow(attempt) * 100);
                        warn!(
                            url = %target,
                            attempt = attempt + 1,
                            backoff_ms = backoff.as_millis(),
                            "Request failed, retrying with exponential backoff"
                        );
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }

        error!(
            url = %target,
            attempts = self.max_retries + 1,
            "All retry attempts exhausted"
        );
        Err(last_error.unwrap_or_else(|| AppError::internal("Unknown error after retries")))
    }

    async fn fetch_with_timeout<T>(&self, url: &Url, target: &str) -> Result<T, AppError>
    where
        T: serde::de::DeserializeOwned,
    {
        let response = tokio::time::timeout(self.timeout, self.client.get(url.clone()).send())
            .await
            .map_err(|_| AppError::timeout(format!("Request to {} timed out", target)))?
            .map_err(|e| {
                if e.is_timeout() {
                    AppError::timeout(format!("Request to {} timed out", target))
                } else {
                    AppError::NetworkError(e.without_url())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::http(
                status.as_u16(),
                format!("HTTP error: {}", status),
            ));
        }

        let text = response
            .text()
            .await
            .map_err(|e| AppError::NetworkError(e.without_url()))?;
        let json: T = serde_json::from_str(&text).map_err(AppError::ParseError)?;

        Ok(json)
    }
}

/// Client errors and malformed bodies will not change on retry.
fn is_retryable(err: &AppError) -> bool {
    match err {
        AppError::HttpError { status, .. } => *status >= 500 || *status == 429,
        AppError::ParseError(_) => false,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{method, path, query_param},
    };

    #[tokio::test]
    async fn encodes_query_parameters() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/weather"))
            .and(query_param("q", "São Paulo"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "ok": true })))
            .expect(1)
            .mount(&server)
            .await;

        let client = HttpClient::new(2, 0).expect("client");
        let body: serde_json::Value = client
            .get_json_with_query(&format!("{}/weather", server.uri()), &[("q", "São Paulo")])
            .await
            .expect("request should succeed");

        assert_eq!(body["ok"], true);
    }

    #[tokio::test]
    async fn does_not_retry_client_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let client = HttpClient::new(2, 3).expect("client");
        let result: Result<serde_json::Value, _> =
            client.get_json_with_query(&format!("{}/missing", server.uri()), &[]).await;

        assert!(matches!(result, Err(AppError::HttpError { status: 404, .. })));
    }

    #[tokio::test]
    async fn retries_server_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let client = HttpClient::new(2, 2).expect("client");
        let result: Result<serde_json::Value, _> =
            client.get_json_with_query(&format!("{}/flaky", server.uri()), &[]).await;

        assert!(matches!(result, Err(AppError::HttpError { status: 503, .. })));
    }
}
