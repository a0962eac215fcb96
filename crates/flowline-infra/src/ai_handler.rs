//! HTTP implementation of the AI-step handler port.
//!
//! POSTs the camelCase `AiStepRequest` to the configured node-type handler
//! endpoint and decodes an `AiStepResponse`. The API key is wrapped in
//! [`secrecy::SecretString`] and only exposed when building the
//! `Authorization` header.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use flowline_core::flow::handler::{
    AiStepHandler, AiStepRequest, AiStepResponse, HandlerError, UnconfiguredAiHandler,
};
use flowline_types::config::AiHandlerConfig;
use secrecy::{ExposeSecret, SecretString};

/// Handler service reached over HTTP.
pub struct HttpAiStepHandler {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<SecretString>,
}

impl HttpAiStepHandler {
    pub fn new(
        endpoint: String,
        api_key: Option<SecretString>,
        timeout: Duration,
    ) -> Result<Self, HandlerError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| HandlerError::Transport(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint,
            api_key,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn post(&self, request: AiStepRequest) -> Result<AiStepResponse, HandlerError> {
        let mut builder = self.client.post(&self.endpoint).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key.expose_secret());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| HandlerError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(HandlerError::Status {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json::<AiStepResponse>()
            .await
            .map_err(|e| HandlerError::InvalidResponse(e.to_string()))
    }
}

// HttpAiStepHandler does not derive Debug so the key never reaches logs.

impl AiStepHandler for HttpAiStepHandler {
    fn invoke(
        &self,
        request: AiStepRequest,
    ) -> Pin<Box<dyn Future<Output = Result<AiStepResponse, HandlerError>> + Send + '_>> {
        tracing::debug!(
            execution_id = %request.execution_id,
            node_type = request.node_type.as_str(),
            action = request.action.as_str(),
            "invoking AI step handler"
        );
        Box::pin(self.post(request))
    }
}

/// Build the handler described by `config`.
///
/// Without an endpoint every AI step fails with `NotConfigured` and
/// traversal continues. The API key is read from the environment variable
/// named by `api_key_env`.
pub fn build_ai_handler(config: &AiHandlerConfig) -> Result<Arc<dyn AiStepHandler>, HandlerError> {
    let Some(endpoint) = config.endpoint.clone() else {
        tracing::warn!("no AI step handler endpoint configured; AI steps will fail");
        return Ok(Arc::new(UnconfiguredAiHandler));
    };

    let api_key = std::env::var(&config.api_key_env)
        .ok()
        .filter(|k| !k.is_empty())
        .map(SecretString::from);
    if api_key.is_none() {
        tracing::debug!(env = config.api_key_env.as_str(), "AI step handler key not set");
    }

    let handler =
        HttpAiStepHandler::new(endpoint, api_key, Duration::from_secs(config.timeout_secs))?;
    Ok(Arc::new(handler))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowline_core::flow::handler::PromptMessage;
    use serde_json::json;
    use uuid::Uuid;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn sample_request() -> AiStepRequest {
        AiStepRequest {
            system_prompt: "You are a friendly SDR.".to_string(),
            messages: vec![PromptMessage::user("Draft an intro email.")],
            node_type: "send_email".to_string(),
            action: "send_message".to_string(),
            channel: Some("email".to_string()),
            model: None,
            target_entity_id: Uuid::now_v7(),
            execution_id: Uuid::now_v7(),
            workspace_id: Uuid::now_v7(),
        }
    }

    fn handler(server: &MockServer, key: Option<&str>) -> HttpAiStepHandler {
        HttpAiStepHandler::new(
            format!("{}/invoke", server.uri()),
            key.map(|k| SecretString::from(k.to_string())),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_posts_camel_case_request_with_bearer_key() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/invoke"))
            .and(header("authorization", "Bearer secret-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "output": { "messageId": "m-1" }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let response = handler(&server, Some("secret-key"))
            .invoke(sample_request())
            .await
            .unwrap();
        assert!(response.success);
        assert_eq!(response.output["messageId"], "m-1");

        let received = server.received_requests().await.unwrap();
        let body: serde_json::Value = received[0].body_json().unwrap();
        assert_eq!(body["nodeType"], "send_email");
        assert_eq!(body["channel"], "email");
        assert!(body.get("targetEntityId").is_some());
        assert!(body.get("model").is_none());
    }

    #[tokio::test]
    async fn test_error_status_maps_to_status_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502).set_body_string("upstream down"))
            .mount(&server)
            .await;

        let err = handler(&server, None)
            .invoke(sample_request())
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::Status { status: 502, ref body } if body == "upstream down"));
    }

    #[tokio::test]
    async fn test_malformed_body_is_invalid_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let err = handler(&server, None)
            .invoke(sample_request())
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn test_missing_endpoint_builds_unconfigured_handler() {
        let handler = build_ai_handler(&AiHandlerConfig::default()).unwrap();
        let err = handler.invoke(sample_request()).await.unwrap_err();
        assert!(matches!(err, HandlerError::NotConfigured));
    }
}
