use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::Semaphore;

use crate::config::MoodleConfig;
use crate::error::{classify_body, classify_status, MoodleError};
use crate::params::flatten_params;

/// Path of Moodle's single REST endpoint, relative to the site base URL.
const REST_ENDPOINT_PATH: &str = "/webservice/rest/server.php";

/// Pooled client for Moodle's web-service REST endpoint.
///
/// One instance is created at process start and shared by every tool call;
/// concurrent calls are bounded by `max_connections` and otherwise
/// independent. TLS certificate verification is reqwest's default and is
/// never disabled.
#[derive(Debug)]
pub struct MoodleClient {
    endpoint: String,
    token: String,
    http: reqwest::Client,
    limiter: Semaphore,
    closed: AtomicBool,
}

impl MoodleClient {
    pub fn new(config: &MoodleConfig) -> Result<Self, MoodleError> {
        let endpoint = format!(
            "{}{REST_ENDPOINT_PATH}",
            config.base_url.trim_end_matches('/')
        );
        // Reject malformed base URLs up front instead of on the first call.
        reqwest::Url::parse(&endpoint)
            .map_err(|e| MoodleError::Validation(format!("Invalid Moodle base URL: {e}")))?;

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.api_timeout_secs))
            .pool_max_idle_per_host(config.max_keepalive_connections)
            .build()
            .map_err(|e| MoodleError::Connection(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            endpoint,
            token: config.token.clone(),
            http,
            limiter: Semaphore::new(config.max_connections),
            closed: AtomicBool::new(false),
        })
    }

    /// Call a web-service function with no parameters.
    pub async fn call_empty(&self, function_name: &str) -> Result<Value, MoodleError> {
        self.call(function_name, &Map::new()).await
    }

    /// Call a Moodle web-service function.
    ///
    /// Nested `params` are flattened to Moodle's bracket-indexed form and
    /// merged with the fixed `wstoken`/`wsfunction`/`moodlewsrestformat`
    /// triple. Returns the parsed JSON payload or a classified error; errors
    /// are never retried here.
    pub async fn call(
        &self,
        function_name: &str,
        params: &Map<String, Value>,
    ) -> Result<Value, MoodleError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(MoodleError::Connection(
                "Moodle client has been closed; no further calls are possible".to_string(),
            ));
        }
        let _permit = self
            .limiter
            .acquire()
            .await
            .map_err(|_| MoodleError::Connection("Moodle client has been closed".to_string()))?;

        let mut url = reqwest::Url::parse(&self.endpoint)
            .map_err(|e| MoodleError::Validation(format!("Invalid endpoint URL: {e}")))?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("wstoken", &self.token);
            query.append_pair("wsfunction", function_name);
            query.append_pair("moodlewsrestformat", "json");
            for (key, value) in flatten_params(params) {
                query.append_pair(&key, &value);
            }
        }

        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| MoodleError::Connection(format!("Connection failed: {e}")))?;

        let status = response.status().as_u16();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| MoodleError::Connection(format!("Failed to read response body: {e}")))?;

        match serde_json::from_slice::<Value>(&bytes) {
            // Error-shaped bodies win over the HTTP status: Moodle reports
            // most application errors with HTTP 200. A failure status whose
            // body carries no error markers still maps by status; it is
            // never a success.
            Ok(body) => {
                let body = classify_body(body)?;
                if !(200..=299).contains(&status) {
                    return Err(classify_status(status));
                }
                Ok(body)
            }
            Err(_) if !(200..=299).contains(&status) => Err(classify_status(status)),
            Err(e) => Err(MoodleError::api(
                "invalidjson",
                format!("Invalid JSON response: {e}"),
            )),
        }
    }

    /// Fetch site/session metadata, including the authenticated user's id.
    /// Always a live round trip; never memoized.
    pub async fn site_info(&self) -> Result<Value, MoodleError> {
        self.call_empty("core_webservice_get_site_info").await
    }

    /// Release the connection pool. Safe to call more than once; any call
    /// issued afterwards fails fast instead of hanging.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.limiter.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Environment, WritePolicy};

    fn test_config(base_url: &str) -> MoodleConfig {
        MoodleConfig {
            base_url: base_url.to_string(),
            token: "testtoken".to_string(),
            api_timeout_secs: 5,
            max_connections: 4,
            max_keepalive_connections: 2,
            max_response_chars: 50_000,
            write_policy: WritePolicy::new(Environment::Development, [7299], false),
        }
    }

    #[test]
    fn endpoint_is_derived_from_base_url() {
        let client = MoodleClient::new(&test_config("https://moodle.example.edu/")).unwrap();
        assert_eq!(
            client.endpoint,
            "https://moodle.example.edu/webservice/rest/server.php"
        );
    }

    #[test]
    fn malformed_base_url_is_rejected_at_construction() {
        let err = MoodleClient::new(&test_config("not a url")).unwrap_err();
        assert!(matches!(err, MoodleError::Validation(_)));
    }

    #[tokio::test]
    async fn call_after_close_fails_fast() {
        let client = MoodleClient::new(&test_config("http://127.0.0.1:9")).unwrap();
        client.close();
        // Idempotent shutdown.
        client.close();

        let err = client.site_info().await.unwrap_err();
        assert!(matches!(err, MoodleError::Connection(msg) if msg.contains("closed")));
    }
}
