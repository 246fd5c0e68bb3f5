// HTTP runner. Payload shape:
//   req:
//     /users?role=admin:
//       post:
//         headers: {Authorization: "Bearer {{ vars.token }}"}
//         body:
//           application/json: {name: alice}
// Output record: {status, headers, body, rawBody}. A non-2xx status is data,
// not an error; only transport faults fail the step.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderName, HeaderValue, CONTENT_TYPE, SET_COOKIE};
use serde_json::{json, Map, Value};
use url::Url;

use rundown_common::errors::{Result, RundownError};

use super::{RunnerKind, StepContext, StepRunner};

pub const DEFAULT_TRACE_HEADER: &str = "X-Rundown-Trace";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

pub struct HttpRunner {
    name: String,
    endpoint: Url,
    client: reqwest::Client,
    use_cookie: bool,
    trace: bool,
    trace_header: String,
}

impl HttpRunner {
    pub fn new(name: &str, endpoint: &str) -> Result<Self> {
        Self::from_config(name, endpoint, None)
    }

    pub fn from_config(
        name: &str,
        endpoint: &str,
        config: Option<&Map<String, Value>>,
    ) -> Result<Self> {
        let endpoint = Url::parse(endpoint).map_err(|e| RundownError::InvalidBook {
            path: String::new(),
            message: format!("runner {name}: invalid endpoint {endpoint:?}: {e}"),
        })?;

        let mut timeout = DEFAULT_TIMEOUT;
        let mut use_cookie = false;
        let mut trace = false;
        let mut trace_header = DEFAULT_TRACE_HEADER.to_string();
        let mut host_rules: Vec<(String, SocketAddr)> = Vec::new();

        if let Some(map) = config {
            if let Some(t) = map.get("timeout").and_then(Value::as_str) {
                timeout = rundown_common::parse_duration(t)?;
            } else if let Some(secs) = map.get("timeout").and_then(Value::as_f64) {
                timeout = Duration::from_secs_f64(secs);
            }
            use_cookie = map.get("useCookie").and_then(Value::as_bool).unwrap_or(false);
            trace = map.get("trace").and_then(Value::as_bool).unwrap_or(false);
            if let Some(h) = map.get("traceHeader").and_then(Value::as_str) {
                trace_header = h.to_string();
            }
            if let Some(rules) = map.get("hostRules").and_then(Value::as_object) {
                for (host, addr) in rules {
                    if let Some(addr) = addr.as_str().and_then(|a| a.parse().ok()) {
                        host_rules.push((host.clone(), addr));
                    }
                }
            }
        }

        let mut builder = reqwest::Client::builder().timeout(timeout);
        for (host, addr) in host_rules {
            builder = builder.resolve(&host, addr);
        }
        let client = builder.build().map_err(|e| RundownError::RunnerFailure {
            runner: name.to_string(),
            message: format!("building HTTP client: {e}"),
        })?;

        Ok(Self { name: name.to_string(), endpoint, client, use_cookie, trace, trace_header })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    fn fail(&self, message: impl Into<String>) -> RundownError {
        RundownError::RunnerFailure { runner: self.name.clone(), message: message.into() }
    }
}

#[async_trait]
impl StepRunner for HttpRunner {
    fn kind(&self) -> RunnerKind {
        RunnerKind::Http
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &StepContext) -> Result<Value> {
        let (path, method, spec) = parse_payload(&ctx.payload)
            .map_err(|m| self.fail(m))?;

        let url = self
            .endpoint
            .join(path.trim_start_matches('/'))
            .map_err(|e| self.fail(format!("joining {path:?}: {e}")))?;

        let method = reqwest::Method::from_bytes(method.to_uppercase().as_bytes())
            .map_err(|_| self.fail(format!("invalid method {method:?}")))?;

        ctx.capturers.each(|c| c.on_http_request(&self.name, method.as_str(), url.as_str()));

        let mut request = self.client.request(method, url.clone());

        if let Some(headers) = spec.get("headers").and_then(Value::as_object) {
            for (k, v) in headers {
                let name = HeaderName::from_bytes(k.as_bytes())
                    .map_err(|_| self.fail(format!("invalid header name {k:?}")))?;
                let value = HeaderValue::from_str(&value_as_header(v))
                    .map_err(|_| self.fail(format!("invalid header value for {k}")))?;
                request = request.header(name, value);
            }
        }

        if self.trace && !ctx.trace_chain.is_empty() {
            let trace = json!({ "id": ctx.trace_chain.join(".") }).to_string();
            request = request.header(self.trace_header.as_str(), trace);
        }

        if let Some(body) = spec.get("body").filter(|b| !b.is_null()) {
            request = encode_body(request, body).map_err(|m| self.fail(m))?;
        }

        let response = tokio::select! {
            r = request.send() => r.map_err(|e| self.fail(format!("request: {e}")))?,
            _ = ctx.cancel.cancelled() => return Err(RundownError::Canceled),
        };

        let status = response.status().as_u16();
        ctx.capturers.each(|c| c.on_http_response(&self.name, status));

        let mut headers = Map::new();
        for (k, v) in response.headers() {
            let entry = headers
                .entry(k.as_str().to_string())
                .or_insert_with(|| Value::Array(Vec::new()));
            if let (Value::Array(list), Ok(s)) = (entry, v.to_str()) {
                list.push(Value::String(s.to_string()));
            }
        }

        if self.use_cookie {
            let host = url.host_str().unwrap_or_default().to_string();
            let mut jar = ctx.cookies.lock();
            for set_cookie in response.headers().get_all(SET_COOKIE) {
                if let Ok(raw) = set_cookie.to_str() {
                    if let Some((name, value)) = raw.split(';').next().and_then(|kv| kv.split_once('=')) {
                        let entry = jar
                            .entry(host.clone())
                            .or_insert_with(|| Value::Object(Map::new()));
                        if let Value::Object(map) = entry {
                            map.insert(name.trim().to_string(), json!(value.trim()));
                        }
                    }
                }
            }
        }

        let is_json = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.contains("json"))
            .unwrap_or(false);

        let raw_body = response
            .text()
            .await
            .map_err(|e| self.fail(format!("reading body: {e}")))?;

        let body = if is_json {
            serde_json::from_str(&raw_body).unwrap_or(Value::Null)
        } else {
            Value::Null
        };

        Ok(json!({
            "status": status,
            "headers": headers,
            "body": body,
            "rawBody": raw_body,
        }))
    }
}

/// Extract (path, method, request spec) from the single-path single-method
/// payload shape.
fn parse_payload(payload: &Value) -> std::result::Result<(&str, &str, &Value), String> {
    let map = payload.as_object().ok_or("payload must be a map of one path")?;
    let (path, methods) = map.iter().next().ok_or("payload has no path")?;
    if map.len() != 1 {
        return Err("payload must have exactly one path".to_string());
    }
    let methods = methods.as_object().ok_or("path entry must map method to request")?;
    let (method, spec) = methods.iter().next().ok_or("path entry has no method")?;
    if methods.len() != 1 {
        return Err("path entry must have exactly one method".to_string());
    }
    Ok((path, method, spec))
}

fn encode_body(
    request: reqwest::RequestBuilder,
    body: &Value,
) -> std::result::Result<reqwest::RequestBuilder, String> {
    let map = body.as_object().ok_or("body must map a media type to content")?;
    let (mime, content) = map.iter().next().ok_or("body has no media type")?;
    match mime.as_str() {
        "application/json" => Ok(request.json(content)),
        "text/plain" => match content {
            Value::String(s) => Ok(request
                .header(CONTENT_TYPE, "text/plain")
                .body(s.clone())),
            other => Ok(request
                .header(CONTENT_TYPE, "text/plain")
                .body(other.to_string())),
        },
        "application/x-www-form-urlencoded" => {
            let form: std::collections::HashMap<String, String> = content
                .as_object()
                .ok_or("form body must be a map")?
                .iter()
                .map(|(k, v)| (k.clone(), value_as_header(v)))
                .collect();
            Ok(request.form(&form))
        }
        other => Err(format!("unsupported media type {other:?}")),
    }
}

pub(crate) fn value_as_header(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_parses_single_path_and_method() {
        let payload = json!({"/users": {"get": {"headers": {}}}});
        let (path, method, _) = parse_payload(&payload).unwrap();
        assert_eq!(path, "/users");
        assert_eq!(method, "get");
    }

    #[test]
    fn payload_rejects_multiple_paths() {
        let payload = json!({"/a": {"get": {}}, "/b": {"get": {}}});
        assert!(parse_payload(&payload).is_err());
    }

    #[test]
    fn runner_parses_endpoint() {
        let runner = HttpRunner::new("req", "https://example.com/").unwrap();
        assert_eq!(runner.endpoint().as_str(), "https://example.com/");
        assert_eq!(runner.name(), "req");
        assert_eq!(runner.kind(), RunnerKind::Http);
    }

    #[test]
    fn config_map_knobs() {
        let config = json!({
            "endpoint": "https://example.com",
            "useCookie": true,
            "trace": true,
            "timeout": "5s",
        });
        let runner =
            HttpRunner::from_config("req", "https://example.com", config.as_object()).unwrap();
        assert!(runner.use_cookie);
        assert!(runner.trace);
    }
}
