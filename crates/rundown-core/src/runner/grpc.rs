// gRPC runner boundary.
// Payload: {"<service>/<method>": {headers?, message?}}. The dynamic invoker
// is an external collaborator injected via options; the runner owns URI and
// payload validation, and fails cleanly when no invoker is bound.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use rundown_common::errors::{Result, RundownError};

use super::{RunnerKind, StepContext, StepRunner};

/// One dynamic call, fully resolved.
#[derive(Debug, Clone)]
pub struct GrpcCall {
    pub target: String,
    pub service: String,
    pub method: String,
    pub headers: Map<String, Value>,
    pub message: Value,
    pub no_tls: bool,
}

/// External collaborator performing the dynamic invocation.
#[async_trait]
pub trait GrpcInvoker: Send + Sync {
    async fn invoke(&self, call: &GrpcCall, cancel: CancellationToken) -> Result<Value>;

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

pub struct GrpcRunner {
    name: String,
    target: String,
    no_tls: bool,
    invoker: Option<Arc<dyn GrpcInvoker>>,
}

impl GrpcRunner {
    pub fn from_config(name: &str, uri: &str, config: Option<&Map<String, Value>>) -> Result<Self> {
        let no_tls = uri.starts_with("grpc://")
            || config
                .and_then(|m| m.get("noTLS"))
                .and_then(Value::as_bool)
                .unwrap_or(false);
        let target = uri
            .trim_start_matches("grpcs://")
            .trim_start_matches("grpc://")
            .to_string();
        if target.is_empty() {
            return Err(RundownError::InvalidBook {
                path: String::new(),
                message: format!("runner {name}: empty gRPC target"),
            });
        }
        Ok(Self { name: name.to_string(), target, no_tls, invoker: None })
    }

    pub fn with_invoker(mut self, invoker: Arc<dyn GrpcInvoker>) -> Self {
        self.invoker = Some(invoker);
        self
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    fn fail(&self, message: impl Into<String>) -> RundownError {
        RundownError::RunnerFailure { runner: self.name.clone(), message: message.into() }
    }
}

#[async_trait]
impl StepRunner for GrpcRunner {
    fn kind(&self) -> RunnerKind {
        RunnerKind::Grpc
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &StepContext) -> Result<Value> {
        let call = parse_payload(&ctx.payload, &self.target, self.no_tls)
            .map_err(|m| self.fail(m))?;
        let invoker = self
            .invoker
            .as_ref()
            .ok_or_else(|| self.fail(format!("no gRPC client bound for target {}", self.target)))?;
        invoker.invoke(&call, ctx.cancel.clone()).await
    }

    async fn close(&self) -> Result<()> {
        if let Some(ref invoker) = self.invoker {
            invoker.close().await?;
        }
        Ok(())
    }
}

fn parse_payload(
    payload: &Value,
    target: &str,
    no_tls: bool,
) -> std::result::Result<GrpcCall, String> {
    let map = payload.as_object().ok_or("payload must map service/method to a request")?;
    let (selector, body) = map.iter().next().ok_or("payload has no service/method")?;
    if map.len() != 1 {
        return Err("payload must have exactly one service/method".to_string());
    }
    let (service, method) = selector
        .rsplit_once('/')
        .ok_or_else(|| format!("selector {selector:?} is not service/method"))?;

    let headers = body
        .get("headers")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    let message = body.get("message").cloned().unwrap_or(Value::Null);

    Ok(GrpcCall {
        target: target.to_string(),
        service: service.to_string(),
        method: method.to_string(),
        headers,
        message,
        no_tls,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scheme_controls_tls() {
        let plain = GrpcRunner::from_config("greq", "grpc://localhost:50051", None).unwrap();
        assert!(plain.no_tls);
        let tls = GrpcRunner::from_config("greq", "grpcs://localhost:50051", None).unwrap();
        assert!(!tls.no_tls);
        assert_eq!(tls.target(), "localhost:50051");
    }

    #[test]
    fn payload_splits_service_and_method() {
        let call = parse_payload(
            &json!({"grpctest.GrpcTestService/Hello": {"message": {"name": "alice"}}}),
            "localhost:50051",
            true,
        )
        .unwrap();
        assert_eq!(call.service, "grpctest.GrpcTestService");
        assert_eq!(call.method, "Hello");
        assert_eq!(call.message["name"], json!("alice"));
    }

    #[test]
    fn payload_without_method_is_rejected(){
        assert!(parse_payload(&json!({"NoSlash": {}}), "t", true).is_err());
    }
}
