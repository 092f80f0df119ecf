//! Blocking HTTP delivery of custom provider requests.

use orchestrator::{ProviderError, ProviderRequest, RequestTransport};
use std::time::Duration;

/// Posts each request as JSON to the resource's service token URL.
///
/// A 4xx answer means the endpoint refused the request and is reported as
/// [`ProviderError::Rejected`]. Everything else that goes wrong on the wire
/// is a [`ProviderError::Transport`] and may be retried.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use std::time::Duration;
/// use webhook::HttpTransport;
///
/// let transport = Arc::new(HttpTransport::new(Duration::from_secs(10)));
/// ```
pub struct HttpTransport {
    agent: ureq::Agent,
}

impl HttpTransport {
    /// Create a transport whose requests give up after `timeout`.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .build()
            .into();
        Self { agent }
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl RequestTransport for HttpTransport {
    fn send(&self, service_token: &str, request: &ProviderRequest) -> Result<(), ProviderError> {
        if !(service_token.starts_with("http://") || service_token.starts_with("https://")) {
            return Err(ProviderError::Rejected(format!(
                "service token {service_token} is not an http(s) url"
            )));
        }

        log::debug!(
            "POST {service_token} {:?} {} ({})",
            request.request_type,
            request.logical_resource_id,
            request.request_id
        );

        match self
            .agent
            .post(service_token)
            .header("User-Agent", "strata")
            .send_json(request)
        {
            Ok(_) => Ok(()),
            Err(ureq::Error::StatusCode(code)) if (400..500).contains(&code) => Err(
                ProviderError::Rejected(format!("{service_token} answered HTTP {code}")),
            ),
            Err(ureq::Error::StatusCode(code)) => Err(ProviderError::Transport(format!(
                "{service_token} answered HTTP {code}"
            ))),
            Err(e) => Err(ProviderError::Transport(format!("{service_token}: {e}"))),
        }
    }
}
