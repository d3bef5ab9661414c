//! Payment processor client implementation

use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Serialize;
use std::time::{Duration, Instant};
use ticket_engine_core::gateway::{GatewayError, PaymentGateway, ProviderPaymentView};
use ticket_engine_core::store::BoxFuture;
use ticket_engine_core::types::{PaymentId, TransactionId};

/// Default processor base URL.
pub const DEFAULT_BASE_URL: &str = "https://api.minepi.com/v2";

/// Default per-request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// Connection settings for [`HttpPaymentGateway`].
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Base URL without a trailing slash.
    pub base_url: String,
    /// Server API key, sent as `Authorization: Key <api_key>`.
    pub api_key: String,
    /// Bound on every request, connect included.
    pub timeout: Duration,
}

impl GatewayConfig {
    /// Defaults with the given API key.
    #[must_use]
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: api_key.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Override the base URL.
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Override the timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Serialize)]
struct CompleteBody<'a> {
    txid: &'a str,
}

/// Payment processor HTTP client
///
/// Never retries; a timeout surfaces as `ProviderUnavailable` and leaves the
/// payment for the reconciliation worker.
#[derive(Clone, Debug)]
pub struct HttpPaymentGateway {
    client: Client,
    api_key: String,
    base_url: String,
}

impl HttpPaymentGateway {
    /// Create a client.
    ///
    /// # Errors
    ///
    /// Returns `InvalidResponse` if the TLS backend fails to initialize.
    pub fn new(config: GatewayConfig) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.timeout)
            .build()
            .map_err(|e| GatewayError::InvalidResponse(format!("client setup failed: {e}")))?;
        Ok(Self {
            client,
            api_key: config.api_key,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, payment_id: &PaymentId, action: Option<&str>) -> String {
        match action {
            Some(action) => format!("{}/payments/{}/{action}", self.base_url, payment_id),
            None => format!("{}/payments/{}", self.base_url, payment_id),
        }
    }

    async fn send(
        &self,
        operation: &'static str,
        request: RequestBuilder,
    ) -> Result<Response, GatewayError> {
        let started = Instant::now();
        let result = request
            .header("Authorization", format!("Key {}", self.api_key))
            .send()
            .await;
        metrics::histogram!("gateway.request_duration_seconds", "operation" => operation)
            .record(started.elapsed().as_secs_f64());

        result.map_err(|e| {
            metrics::counter!("gateway.errors", "operation" => operation, "kind" => "transport")
                .increment(1);
            tracing::warn!(operation, error = %e, "Payment provider request failed");
            GatewayError::ProviderUnavailable(e.to_string())
        })
    }

    async fn read_view(response: Response) -> Result<ProviderPaymentView, GatewayError> {
        response
            .json::<ProviderPaymentView>()
            .await
            .map_err(|e| GatewayError::InvalidResponse(e.to_string()))
    }

    async fn error_for(
        operation: &'static str,
        payment_id: &PaymentId,
        response: Response,
    ) -> GatewayError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let error = match status {
            StatusCode::NOT_FOUND => GatewayError::NotFound(payment_id.clone()),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => GatewayError::Unauthorized,
            StatusCode::TOO_MANY_REQUESTS => GatewayError::ProviderUnavailable(format!(
                "rate limited: {body}"
            )),
            s if s.is_server_error() => {
                GatewayError::ProviderUnavailable(format!("status {}: {body}", s.as_u16()))
            }
            s => GatewayError::Rejected {
                status: s.as_u16(),
                body,
            },
        };
        metrics::counter!("gateway.errors", "operation" => operation, "kind" => error.code())
            .increment(1);
        error
    }

    fn is_already_done(error: &GatewayError) -> bool {
        match error {
            GatewayError::Rejected { status, body } => {
                (*status == 400 || *status == 409) && body.to_ascii_lowercase().contains("already")
            }
            _ => false,
        }
    }

    async fn fetch(&self, payment_id: &PaymentId) -> Result<ProviderPaymentView, GatewayError> {
        let response = self
            .send("fetch_status", self.client.get(self.url(payment_id, None)))
            .await?;
        if response.status().is_success() {
            Self::read_view(response).await
        } else {
            Err(Self::error_for("fetch_status", payment_id, response).await)
        }
    }

    async fn post_approve(&self, payment_id: &PaymentId) -> Result<(), GatewayError> {
        let response = self
            .send("approve", self.client.post(self.url(payment_id, Some("approve"))))
            .await?;
        if response.status().is_success() {
            tracing::info!(payment_id = %payment_id, "Payment approved with provider");
            return Ok(());
        }
        let error = Self::error_for("approve", payment_id, response).await;
        if Self::is_already_done(&error) {
            tracing::debug!(payment_id = %payment_id, "Payment was already approved");
            return Ok(());
        }
        Err(error)
    }

    async fn post_complete(
        &self,
        payment_id: &PaymentId,
        txid: &TransactionId,
    ) -> Result<ProviderPaymentView, GatewayError> {
        let request = self
            .client
            .post(self.url(payment_id, Some("complete")))
            .json(&CompleteBody { txid: txid.as_str() });
        let response = self.send("complete", request).await?;
        if response.status().is_success() {
            tracing::info!(payment_id = %payment_id, txid = %txid, "Payment completed with provider");
            return Self::read_view(response).await;
        }
        let error = Self::error_for("complete", payment_id, response).await;
        if Self::is_already_done(&error) {
            tracing::debug!(payment_id = %payment_id, "Payment was already completed");
            return self.fetch(payment_id).await;
        }
        Err(error)
    }

    async fn post_cancel(&self, payment_id: &PaymentId) -> Result<(), GatewayError> {
        let response = self
            .send("cancel", self.client.post(self.url(payment_id, Some("cancel"))))
            .await?;
        if response.status().is_success() {
            tracing::info!(payment_id = %payment_id, "Payment cancelled with provider");
            Ok(())
        } else {
            Err(Self::error_for("cancel", payment_id, response).await)
        }
    }
}

impl PaymentGateway for HttpPaymentGateway {
    fn fetch_status<'a>(
        &'a self,
        payment_id: &'a PaymentId,
    ) -> BoxFuture<'a, Result<ProviderPaymentView, GatewayError>> {
        Box::pin(self.fetch(payment_id))
    }

    fn approve<'a>(&'a self, payment_id: &'a PaymentId) -> BoxFuture<'a, Result<(), GatewayError>> {
        Box::pin(self.post_approve(payment_id))
    }

    fn complete<'a>(
        &'a self,
        payment_id: &'a PaymentId,
        txid: &'a TransactionId,
    ) -> BoxFuture<'a, Result<ProviderPaymentView, GatewayError>> {
        Box::pin(self.post_complete(payment_id, txid))
    }

    fn cancel<'a>(&'a self, payment_id: &'a PaymentId) -> BoxFuture<'a, Result<(), GatewayError>> {
        Box::pin(self.post_cancel(payment_id))
    }
}
