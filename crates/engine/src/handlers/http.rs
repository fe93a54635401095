//! Outbound HTTP steps
//!
//! A single step attempt may send the request several times: transport
//! errors and responses with a retryable status are retried in place with
//! exponential backoff before the attempt reports its outcome. The step-level
//! retry policy then decides whether the whole step runs again.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::Method;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{template, HandlerError, StepContext, StepHandler, StepResult};
use crate::dsl::{HttpStep, StepKind, StepSpec};
use crate::reliability::{RetryPolicy, DEFAULT_RETRYABLE_STATUS_CODES};

/// First in-place retry delay when the step has no retry policy
pub const DEFAULT_HTTP_RETRY_DELAY_MS: u64 = 200;

/// Sends the rendered request with reqwest
#[derive(Debug, Clone, Default)]
pub struct HttpHandler {
    client: reqwest::Client,
}

struct Prepared {
    method: Method,
    url: String,
    headers: HeaderMap,
    body: Option<String>,
}

impl HttpHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a preconfigured client (proxies, TLS roots, pooling)
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn prepare(spec: &HttpStep, ctx: &StepContext<'_>) -> Result<Prepared, String> {
        let method = Method::from_bytes(spec.method.trim().to_uppercase().as_bytes())
            .map_err(|_| format!("invalid HTTP method: {}", spec.method))?;

        let mut headers = HeaderMap::new();
        for (name, value) in &spec.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| format!("invalid header name: {name}"))?;
            let value = HeaderValue::from_str(&template::render(value, ctx.data))
                .map_err(|_| format!("invalid value for header {name}"))?;
            headers.insert(name, value);
        }

        let body = spec
            .body_template
            .as_deref()
            .filter(|b| !b.trim().is_empty())
            .map(|b| template::render(b, ctx.data));

        Ok(Prepared {
            method,
            url: template::render(&spec.url, ctx.data),
            headers,
            body,
        })
    }

    async fn send(&self, request: &Prepared) -> Result<(u16, String), reqwest::Error> {
        let mut builder = self
            .client
            .request(request.method.clone(), &request.url)
            .headers(request.headers.clone());
        if let Some(body) = &request.body {
            builder = builder
                .header(CONTENT_TYPE, "application/json")
                .body(body.clone());
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let text = response.text().await?;
        Ok((status, text))
    }
}

/// In-place retry schedule derived from the step's policy
fn inner_policy(step_policy: Option<&RetryPolicy>) -> RetryPolicy {
    match step_policy {
        Some(p) => RetryPolicy::default()
            .with_max_attempts(p.max_attempts.max(1))
            .with_initial_delay_ms(p.initial_delay_ms)
            .with_jitter(p.jitter),
        None => RetryPolicy::no_retry().with_initial_delay_ms(DEFAULT_HTTP_RETRY_DELAY_MS),
    }
}

fn is_retryable_status(code: u16, retryable: &[u16]) -> bool {
    retryable.contains(&code) || code == 408 || code == 429 || code >= 500
}

#[async_trait]
impl StepHandler for HttpHandler {
    fn kind(&self) -> StepKind {
        StepKind::Http
    }

    async fn handle(
        &self,
        ctx: StepContext<'_>,
        cancel: CancellationToken,
    ) -> Result<StepResult, HandlerError> {
        let StepSpec::Http(spec) = &ctx.step.spec else {
            return Err(HandlerError::kind_mismatch(ctx.step, StepKind::Http));
        };

        let request = match Self::prepare(spec, &ctx) {
            Ok(request) => request,
            Err(reason) => return Ok(StepResult::failed(reason, false)),
        };

        let policy = inner_policy(ctx.step.retry_policy.as_ref());
        let retry_codes: Vec<u16> = ctx
            .step
            .retry_policy
            .as_ref()
            .and_then(|p| p.retryable_status_codes.clone())
            .unwrap_or_else(|| DEFAULT_RETRYABLE_STATUS_CODES.to_vec());

        let mut attempt = 1;
        let outcome = loop {
            let outcome = tokio::select! {
                out = self.send(&request) => out,
                _ = cancel.cancelled() => return Err(HandlerError::Cancelled),
            };

            let retry = match &outcome {
                Ok((status, _)) => retry_codes.contains(status),
                Err(_) => true,
            };
            if !retry || attempt >= policy.max_attempts {
                break outcome;
            }

            let delay = policy.delay_for_attempt(attempt);
            match &outcome {
                Ok((status, _)) => {
                    warn!(step_id = %ctx.step.id, status, attempt, ?delay, "retrying HTTP request")
                }
                Err(e) => {
                    warn!(step_id = %ctx.step.id, error = %e, attempt, ?delay, "retrying HTTP request")
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return Err(HandlerError::Cancelled),
            }
            attempt += 1;
        };

        match outcome {
            Ok((status, body)) if (200..300).contains(&status) => {
                debug!(step_id = %ctx.step.id, status, "HTTP step succeeded");
                let output = serde_json::from_str(&body).unwrap_or(Value::String(body));
                Ok(StepResult::succeeded(Some(output)))
            }
            Ok((status, body)) => Ok(StepResult::failed(
                format!("HTTP {status}: {body}"),
                is_retryable_status(status, &retry_codes),
            )),
            Err(e) => Ok(StepResult::failed(e.to_string(), true)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::test_support::Fixture;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fixture(step: Value) -> Fixture {
        Fixture::new(
            json!({"name": "t", "trigger": {"type": "manual"}, "steps": [step]}),
            json!({"customer": "acme", "api_key": "k-123"}),
        )
    }

    async fn run(fx: &Fixture) -> StepResult {
        HttpHandler::new()
            .handle(fx.ctx("h1"), CancellationToken::new())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_renders_request_and_returns_json_output() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/customers/acme"))
            .and(header("x-api-key", "k-123"))
            .and(header("content-type", "application/json"))
            .and(body_json(json!({"name": "acme"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .expect(1)
            .mount(&server)
            .await;

        let fx = fixture(json!({
            "id": "h1", "type": "http", "method": "post",
            "url": format!("{}/customers/{{{{ customer }}}}", server.uri()),
            "headers": {"x-api-key": "{{ api_key }}"},
            "bodyTemplate": "{\"name\": \"{{ customer }}\"}"
        }));

        assert_eq!(run(&fx).await, StepResult::succeeded(Some(json!({"ok": true}))));
    }

    #[tokio::test]
    async fn test_non_json_body_is_returned_as_text() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("pong"))
            .mount(&server)
            .await;

        let fx = fixture(json!({"id": "h1", "type": "http", "method": "GET", "url": server.uri()}));
        assert_eq!(run(&fx).await, StepResult::succeeded(Some(json!("pong"))));
    }

    #[tokio::test]
    async fn test_retryable_status_is_retried_in_place() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"n": 3})))
            .expect(1)
            .mount(&server)
            .await;

        let fx = fixture(json!({
            "id": "h1", "type": "http", "method": "GET", "url": server.uri(),
            "retryPolicy": {"maxAttempts": 3, "initialDelayMs": 1, "jitter": false}
        }));
        assert_eq!(run(&fx).await, StepResult::succeeded(Some(json!({"n": 3}))));
    }

    #[tokio::test]
    async fn test_exhausted_retryable_status_fails_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503).set_body_string("busy"))
            .expect(2)
            .mount(&server)
            .await;

        let fx = fixture(json!({
            "id": "h1", "type": "http", "method": "GET", "url": server.uri(),
            "retryPolicy": {"maxAttempts": 2, "initialDelayMs": 1, "jitter": false}
        }));
        assert_eq!(run(&fx).await, StepResult::failed("HTTP 503: busy", true));
    }

    #[tokio::test]
    async fn test_client_error_is_not_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404).set_body_string("nope"))
            .expect(1)
            .mount(&server)
            .await;

        let fx = fixture(json!({"id": "h1", "type": "http", "method": "GET", "url": server.uri()}));
        assert_eq!(run(&fx).await, StepResult::failed("HTTP 404: nope", false));
    }

    #[tokio::test]
    async fn test_transport_error_is_retryable() {
        let fx = fixture(json!({
            "id": "h1", "type": "http", "method": "GET", "url": "http://127.0.0.1:1/unreachable"
        }));
        match run(&fx).await {
            StepResult::Failed { retryable, .. } => assert!(retryable),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_invalid_method_fails_permanently() {
        let fx = fixture(json!({"id": "h1", "type": "http", "method": "GE T", "url": "http://localhost"}));
        assert!(matches!(run(&fx).await, StepResult::Failed { retryable: false, .. }));
    }

    #[test]
    fn test_status_classification() {
        let defaults = DEFAULT_RETRYABLE_STATUS_CODES;
        assert!(is_retryable_status(503, &defaults));
        assert!(is_retryable_status(429, &[]));
        assert!(is_retryable_status(501, &[]));
        assert!(is_retryable_status(409, &[409]));
        assert!(!is_retryable_status(400, &defaults));
    }
}
