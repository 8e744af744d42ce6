//! Model client: a provider registry with a middleware chain around `complete`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::errors::{ConfigurationError, SDKError};
use crate::provider::ProviderAdapter;
use crate::types::{Request, Response};

pub type CompleteHandler =
    Arc<dyn Fn(Request) -> BoxFuture<'static, Result<Response, SDKError>> + Send + Sync>;

/// Middleware wrapping complete() calls.
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn handle_complete(
        &self,
        request: Request,
        next: CompleteHandler,
    ) -> Result<Response, SDKError>;
}

#[derive(Clone, Default)]
pub struct Client {
    providers: HashMap<String, Arc<dyn ProviderAdapter>>,
    default_provider: Option<String>,
    middleware: Vec<Arc<dyn Middleware>>,
}

impl Client {
    /// Client with a single provider that is also the default.
    pub fn with_provider(provider: Arc<dyn ProviderAdapter>) -> Self {
        let mut client = Self::default();
        client.register_provider(provider);
        client
    }

    /// The first registered provider becomes the default.
    pub fn register_provider(&mut self, provider: Arc<dyn ProviderAdapter>) {
        let name = provider.name().to_string();
        self.default_provider.get_or_insert_with(|| name.clone());
        self.providers.insert(name, provider);
    }

    pub fn add_middleware(&mut self, middleware: Arc<dyn Middleware>) {
        self.middleware.push(middleware);
    }

    /// Sends the request through every middleware, outermost first, then to
    /// the provider named on the request or the default one.
    pub async fn complete(&self, mut request: Request) -> Result<Response, SDKError> {
        let name = request
            .provider
            .clone()
            .or_else(|| self.default_provider.clone())
            .ok_or_else(|| {
                SDKError::Configuration(ConfigurationError::new("no provider configured"))
            })?;
        let adapter = self.providers.get(&name).cloned().ok_or_else(|| {
            SDKError::Configuration(ConfigurationError::new(format!(
                "provider '{name}' not registered"
            )))
        })?;
        request.provider = Some(name);

        let mut handler: CompleteHandler = Arc::new(move |request| {
            let adapter = adapter.clone();
            Box::pin(async move { adapter.complete(request).await })
        });
        for middleware in self.middleware.iter().rev().cloned() {
            let next = handler;
            handler = Arc::new(move |request| {
                let middleware = middleware.clone();
                let next = next.clone();
                Box::pin(async move { middleware.handle_complete(request, next).await })
            });
        }
        handler(request).await
    }
}

/// Logs every model call with its latency and token usage.
#[derive(Default)]
pub struct TracingMiddleware;

#[async_trait]
impl Middleware for TracingMiddleware {
    async fn handle_complete(
        &self,
        request: Request,
        next: CompleteHandler,
    ) -> Result<Response, SDKError> {
        let model = request.model.clone();
        let messages = request.messages.len();
        let started = Instant::now();
        let result = next(request).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(response) => tracing::debug!(
                %model,
                messages,
                elapsed_ms,
                input_tokens = response.usage.input_tokens,
                output_tokens = response.usage.output_tokens,
                "model call completed"
            ),
            Err(error) => tracing::warn!(%model, elapsed_ms, %error, "model call failed"),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Message, Usage};
    use std::sync::Mutex;

    struct EchoAdapter {
        name: String,
    }

    #[async_trait]
    impl ProviderAdapter for EchoAdapter {
        fn name(&self) -> &str {
            &self.name
        }

        async fn complete(&self, request: Request) -> Result<Response, SDKError> {
            Ok(Response {
                id: "resp".to_string(),
                model: request.model,
                provider: self.name.clone(),
                message: Message::assistant("ok"),
                stop_reason: Some("end_turn".to_string()),
                usage: Usage::default(),
            })
        }
    }

    struct RecordingMiddleware {
        label: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl Middleware for RecordingMiddleware {
        async fn handle_complete(
            &self,
            request: Request,
            next: CompleteHandler,
        ) -> Result<Response, SDKError> {
            self.log.lock().unwrap().push(self.label);
            let result = next(request).await;
            self.log.lock().unwrap().push(self.label);
            result
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn middleware_wraps_in_registration_order() {
        let mut client = Client::with_provider(Arc::new(EchoAdapter {
            name: "test".to_string(),
        }));

        let log = Arc::new(Mutex::new(Vec::new()));
        client.add_middleware(Arc::new(RecordingMiddleware {
            label: "a",
            log: log.clone(),
        }));
        client.add_middleware(Arc::new(RecordingMiddleware {
            label: "b",
            log: log.clone(),
        }));
        client.add_middleware(Arc::new(TracingMiddleware));

        let _ = client
            .complete(Request::new("model", vec![Message::user("hi")]))
            .await
            .unwrap();
        let order = log.lock().unwrap().clone();
        assert_eq!(order, vec!["a", "b", "b", "a"]);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn missing_provider_is_a_configuration_error() {
        let client = Client::default();
        let error = client
            .complete(Request::new("model", vec![Message::user("hi")]))
            .await
            .unwrap_err();
        assert!(matches!(error, SDKError::Configuration(_)));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn request_provider_overrides_the_default() {
        let mut client = Client::with_provider(Arc::new(EchoAdapter {
            name: "first".to_string(),
        }));
        client.register_provider(Arc::new(EchoAdapter {
            name: "second".to_string(),
        }));

        let mut request = Request::new("model", vec![Message::user("hi")]);
        request.provider = Some("second".to_string());
        let response = client.complete(request).await.unwrap();
        assert_eq!(response.provider, "second");
    }
}
