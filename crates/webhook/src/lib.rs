//! # Webhook
//!
//! HTTP plumbing for custom resource providers:
//!
//! - [`HttpTransport`] posts provider requests to service token URLs
//! - [`CallbackListener`] serves the endpoint providers answer on, feeding
//!   each response into the engine's [`CallbackGateway`](orchestrator::CallbackGateway)
//!
//! ## Example
//!
//! ```no_run
//! use orchestrator::{Engine, EngineOptions, MemoryStore, ProviderRegistry};
//! use std::sync::Arc;
//! use std::time::Duration;
//! use webhook::{CallbackListener, HttpTransport};
//!
//! let engine = Engine::new(Arc::new(MemoryStore::new()), ProviderRegistry::new(), EngineOptions::default())?
//!     .with_transport(Arc::new(HttpTransport::new(Duration::from_secs(10))));
//! let listener = CallbackListener::start("127.0.0.1:8787".parse()?, engine.gateway())?;
//! println!("callbacks at {}", listener.response_url());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod error;
mod listener;
mod transport;

pub use error::{Error, Result};
pub use listener::{CallbackListener, ListenerHandle};
pub use transport::HttpTransport;

#[cfg(test)]
mod tests {
    use super::*;
    use orchestrator::gateway::CallbackOutcome;
    use orchestrator::{
        CallbackGateway, CallbackStatus, ProviderError, ProviderRequest, ProviderResponse, RequestTransport,
        RequestType, ResponseStatus,
    };
    use serde_json::Value;
    use std::sync::Arc;
    use std::time::Duration;

    fn request(listener: &ListenerHandle) -> ProviderRequest {
        ProviderRequest {
            request_id: uuid::Uuid::new_v4().to_string(),
            request_type: RequestType::Create,
            stack_id: "prod".to_string(),
            logical_resource_id: "Hook".to_string(),
            resource_type: "Custom::Hook".to_string(),
            resource_properties: orchestrator::Properties::new(),
            old_resource_properties: None,
            physical_resource_id: None,
            response_url: listener.response_url(),
            callback_token: "secret".to_string(),
        }
    }

    fn answer(request: &ProviderRequest, token: &str) -> ProviderResponse {
        ProviderResponse {
            request_id: request.request_id.clone(),
            status: ResponseStatus::Success,
            physical_resource_id: Some("hook-1".to_string()),
            data: orchestrator::Properties::new(),
            reason: None,
            callback_token: token.to_string(),
        }
    }

    fn client() -> ureq::Agent {
        ureq::Agent::config_builder()
            .timeout_global(Some(Duration::from_secs(5)))
            .http_status_as_error(false)
            .build()
            .into()
    }

    fn start() -> (Arc<CallbackGateway>, ListenerHandle) {
        let gateway = Arc::new(CallbackGateway::default());
        let listener = CallbackListener::start("127.0.0.1:0".parse().unwrap(), Arc::clone(&gateway)).unwrap();
        (gateway, listener)
    }

    #[test]
    fn test_health() {
        let (_gateway, listener) = start();
        let mut response = client()
            .get(&format!("http://{}/health", listener.addr()))
            .call()
            .unwrap();
        assert_eq!(response.status().as_u16(), 200);
        let body: Value = response.body_mut().read_json().unwrap();
        assert_eq!(body["status"], "ok");
    }

    #[test]
    fn test_callback_resolves_pending_request_once() {
        let (gateway, listener) = start();
        let req = request(&listener);
        let (_, rx) = gateway.register(&req, Duration::from_secs(60), chrono::Utc::now());

        let first = client().post(&listener.response_url()).send_json(&answer(&req, "secret")).unwrap();
        assert_eq!(first.status().as_u16(), 202);

        let outcome = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(
            outcome,
            CallbackOutcome::Succeeded {
                physical_id: Some("hook-1".to_string()),
                data: orchestrator::Properties::new(),
            }
        );

        let mut duplicate = client().post(&listener.response_url()).send_json(&answer(&req, "secret")).unwrap();
        assert_eq!(duplicate.status().as_u16(), 409);
        let body: Value = duplicate.body_mut().read_json().unwrap();
        assert_eq!(body["accepted"], false);

        let mut status = client()
            .get(&format!("{}/{}", listener.response_url(), req.request_id))
            .call()
            .unwrap();
        assert_eq!(status.status().as_u16(), 200);
        let body: Value = status.body_mut().read_json().unwrap();
        assert_eq!(body["status"], "Succeeded");
    }

    #[test]
    fn test_wrong_token_is_rejected() {
        let (gateway, listener) = start();
        let req = request(&listener);
        let _rx = gateway.register(&req, Duration::from_secs(60), chrono::Utc::now());

        let response = client().post(&listener.response_url()).send_json(&answer(&req, "guess")).unwrap();
        assert_eq!(response.status().as_u16(), 409);
        assert_eq!(gateway.get(&req.request_id).unwrap().status, CallbackStatus::Pending);
    }

    #[test]
    fn test_unknown_request_lookup() {
        let (_gateway, listener) = start();
        let response = client()
            .get(&format!("{}/nope", listener.response_url()))
            .call()
            .unwrap();
        assert_eq!(response.status().as_u16(), 404);
    }

    #[test]
    fn test_transport_delivers_and_maps_errors() {
        let (_gateway, listener) = start();
        let transport = HttpTransport::new(Duration::from_secs(5));
        let req = request(&listener);

        // The callback route refuses a request body: a client error
        let err = transport.send(&listener.response_url(), &req).unwrap_err();
        assert!(matches!(err, ProviderError::Rejected(_)), "{err}");

        let err = transport.send("file:///tmp/hook", &req).unwrap_err();
        assert!(matches!(err, ProviderError::Rejected(_)));

        let addr = listener.addr();
        drop(listener);
        let err = transport.send(&format!("http://{addr}/v1/callbacks"), &req).unwrap_err();
        assert!(matches!(err, ProviderError::Transport(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_bind_conflict() {
        let (_gateway, listener) = start();
        let err = CallbackListener::start(listener.addr(), Arc::new(CallbackGateway::default())).err().unwrap();
        assert!(matches!(err, Error::Bind { .. }));
    }
}
