//! Built-in step handlers: `echo`, `sleep` and `http`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{classify_status, StepError};
use crate::handler::{HandlerRegistry, StepContext, StepHandler};

/// Longest response body kept in an error message
const MAX_ERROR_BODY: usize = 512;

pub fn register_all(registry: &mut HandlerRegistry) {
    registry.register(Arc::new(EchoHandler));
    registry.register(Arc::new(SleepHandler));
    registry.register(Arc::new(HttpHandler::new()));
}

fn parse_config<T: DeserializeOwned>(handler: &str, config: &Value) -> Result<T, StepError> {
    serde_json::from_value(config.clone())
        .map_err(|e| StepError::invalid_config(handler, e.to_string()))
}

/// Returns its resolved config unchanged
#[derive(Debug, Default)]
pub struct EchoHandler;

#[async_trait]
impl StepHandler for EchoHandler {
    fn name(&self) -> &str {
        "echo"
    }

    async fn handle(&self, config: &Value, _ctx: &StepContext) -> Result<Value, StepError> {
        Ok(config.clone())
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SleepConfig {
    pub ms: u64,
}

/// Waits `ms` milliseconds, then returns `{"slept_ms": ms}`
#[derive(Debug, Default)]
pub struct SleepHandler;

#[async_trait]
impl StepHandler for SleepHandler {
    fn name(&self) -> &str {
        "sleep"
    }

    fn validate(&self, config: &Value) -> Result<(), StepError> {
        parse_config::<SleepConfig>(self.name(), config).map(|_| ())
    }

    async fn handle(&self, config: &Value, _ctx: &StepContext) -> Result<Value, StepError> {
        let cfg: SleepConfig = parse_config(self.name(), config)?;
        tokio::time::sleep(Duration::from_millis(cfg.ms)).await;
        Ok(json!({ "slept_ms": cfg.ms }))
    }
}

fn default_method() -> String {
    "GET".to_string()
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpConfig {
    #[serde(default = "default_method")]
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub body: Option<Value>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Per-request timeout on top of the step deadline
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl HttpConfig {
    fn parsed_method(&self) -> Result<reqwest::Method, StepError> {
        reqwest::Method::from_bytes(self.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| StepError::invalid_config("http", format!("bad method '{}'", self.method)))
    }

    fn parsed_url(&self) -> Result<reqwest::Url, StepError> {
        let url = reqwest::Url::parse(&self.url)
            .map_err(|e| StepError::invalid_config("http", format!("bad url '{}': {e}", self.url)))?;
        match url.scheme() {
            "http" | "https" => Ok(url),
            other => Err(StepError::invalid_config(
                "http",
                format!("unsupported scheme '{other}'"),
            )),
        }
    }
}

/// Sends a JSON request and returns `{"status": u16, "body": ...}`.
///
/// Non-2xx responses become errors classified by status code. The body is
/// parsed as JSON when possible, otherwise kept as a string.
#[derive(Debug, Clone)]
pub struct HttpHandler {
    client: reqwest::Client,
}

impl HttpHandler {
    pub fn new() -> Self {
        Self::with_client(reqwest::Client::new())
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for HttpHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StepHandler for HttpHandler {
    fn name(&self) -> &str {
        "http"
    }

    fn validate(&self, config: &Value) -> Result<(), StepError> {
        let cfg: HttpConfig = parse_config(self.name(), config)?;
        cfg.parsed_method()?;
        cfg.parsed_url()?;
        Ok(())
    }

    fn dependency(&self, config: &Value) -> Option<String> {
        let url = config.get("url")?.as_str()?;
        let parsed = reqwest::Url::parse(url).ok()?;
        parsed.host_str().map(|host| format!("http:{host}"))
    }

    async fn handle(&self, config: &Value, ctx: &StepContext) -> Result<Value, StepError> {
        let cfg: HttpConfig = parse_config(self.name(), config)?;
        let method = cfg.parsed_method()?;
        let url = cfg.parsed_url()?;

        tracing::debug!(
            run_id = %ctx.run_id,
            step = %ctx.step_id,
            method = %method,
            url = %url,
            "Sending HTTP request"
        );

        let mut request = self.client.request(method, url);
        for (name, value) in &cfg.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &cfg.body {
            request = request.json(body);
        }
        if let Some(ms) = cfg.timeout_ms {
            request = request.timeout(Duration::from_millis(ms));
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            let mut snippet = text;
            if snippet.len() > MAX_ERROR_BODY {
                let mut cut = MAX_ERROR_BODY;
                while !snippet.is_char_boundary(cut) {
                    cut -= 1;
                }
                snippet.truncate(cut);
            }
            return Err(classify_status(
                status.as_u16(),
                format!("HTTP {status}: {snippet}"),
            ));
        }

        let body = serde_json::from_str(&text).unwrap_or(Value::String(text));
        Ok(json!({ "status": status.as_u16(), "body": body }))
    }
}
