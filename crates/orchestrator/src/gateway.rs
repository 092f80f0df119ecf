//! Custom provider gateway
//!
//! Custom resources are provisioned by external endpoints. The engine sends a
//! [`ProviderRequest`] to the resource's service token and waits for exactly
//! one [`ProviderResponse`] to come back through the callback endpoint.
//!
//! The gateway itself is a table of pending requests. Every state change
//! takes the current time as an argument, and the single terminal outcome of
//! a request is handed to the waiting worker over a channel. Whichever of
//! callback, sweep, expiry or abandonment arrives first wins; everything after
//! it is discarded.

use crate::error::ProviderError;
use crate::properties::Properties;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// Kind of request sent to a custom provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestType {
    Create,
    Update,
    Delete,
}

/// Request delivered to a custom provider endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderRequest {
    pub request_id: String,
    pub request_type: RequestType,
    pub stack_id: String,
    pub logical_resource_id: String,
    pub resource_type: String,
    pub resource_properties: Properties,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_resource_properties: Option<Properties>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub physical_resource_id: Option<String>,
    pub response_url: String,
    pub callback_token: String,
}

/// Status reported by a custom provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseStatus {
    Success,
    Failed,
}

/// Callback body sent by a custom provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderResponse {
    pub request_id: String,
    pub status: ResponseStatus,
    #[serde(default)]
    pub physical_resource_id: Option<String>,
    #[serde(default)]
    pub data: Properties,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub callback_token: String,
}

/// State of a pending request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallbackStatus {
    Pending,
    Succeeded,
    Failed,
    TimedOut,
}

impl fmt::Display for CallbackStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "Pending",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
            Self::TimedOut => "TimedOut",
        };
        f.write_str(name)
    }
}

/// Bookkeeping for one outstanding request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderCallback {
    pub request_id: String,
    pub stack_id: String,
    pub resource_logical_id: String,
    pub issued_at: DateTime<Utc>,
    pub timeout_at: DateTime<Utc>,
    pub callback_token: String,
    pub status: CallbackStatus,
}

/// Terminal outcome delivered to the waiting worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackOutcome {
    Succeeded {
        physical_id: Option<String>,
        data: Properties,
    },
    Failed {
        reason: String,
    },
    TimedOut {
        deadline: DateTime<Utc>,
    },
}

/// Why an inbound callback was ignored
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    UnknownRequest,
    AlreadyResolved(CallbackStatus),
    TokenMismatch,
}

impl fmt::Display for DiscardReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownRequest => f.write_str("unknown request id"),
            Self::AlreadyResolved(status) => write!(f, "request already {status}"),
            Self::TokenMismatch => f.write_str("callback token does not match"),
        }
    }
}

/// Result of delivering a callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Accepted,
    Discarded(DiscardReason),
}

/// Delivers requests to custom provider endpoints
pub trait RequestTransport: Send + Sync {
    /// Deliver `request` to the endpoint named by `service_token`
    fn send(&self, service_token: &str, request: &ProviderRequest) -> Result<(), ProviderError>;
}

/// Transport for engines without custom resources
pub struct NoTransport;

impl RequestTransport for NoTransport {
    fn send(&self, service_token: &str, _request: &ProviderRequest) -> Result<(), ProviderError> {
        Err(ProviderError::Rejected(format!(
            "no transport configured for custom provider {service_token}"
        )))
    }
}

struct Entry {
    callback: ProviderCallback,
    notify: Option<Sender<CallbackOutcome>>,
    resolved_at: Option<DateTime<Utc>>,
}

impl Entry {
    fn settle(&mut self, status: CallbackStatus, outcome: CallbackOutcome, now: DateTime<Utc>) {
        self.callback.status = status;
        self.resolved_at = Some(now);
        if let Some(notify) = self.notify.take() {
            // The worker may have given up already
            let _ = notify.send(outcome);
        }
    }
}

/// Pending-request table for custom providers
pub struct CallbackGateway {
    entries: Mutex<HashMap<String, Entry>>,
    retention: TimeDelta,
}

impl CallbackGateway {
    /// Create a gateway that remembers resolved requests for `retention`
    pub fn new(retention: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            retention: to_delta(retention),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Record a request as pending and return the receiver for its outcome
    pub fn register(
        &self,
        request: &ProviderRequest,
        timeout: Duration,
        now: DateTime<Utc>,
    ) -> (ProviderCallback, Receiver<CallbackOutcome>) {
        let (tx, rx) = mpsc::channel();
        let callback = ProviderCallback {
            request_id: request.request_id.clone(),
            stack_id: request.stack_id.clone(),
            resource_logical_id: request.logical_resource_id.clone(),
            issued_at: now,
            timeout_at: now + to_delta(timeout),
            callback_token: request.callback_token.clone(),
            status: CallbackStatus::Pending,
        };
        log::debug!(
            "registered callback {} for {}/{} (deadline {})",
            callback.request_id,
            callback.stack_id,
            callback.resource_logical_id,
            callback.timeout_at
        );
        self.lock().insert(
            callback.request_id.clone(),
            Entry {
                callback: callback.clone(),
                notify: Some(tx),
                resolved_at: None,
            },
        );
        (callback, rx)
    }

    /// Apply an inbound callback
    pub fn resolve(&self, response: &ProviderResponse, now: DateTime<Utc>) -> Resolution {
        let mut entries = self.lock();
        let Some(entry) = entries.get_mut(&response.request_id) else {
            log::warn!("discarding callback for unknown request {}", response.request_id);
            return Resolution::Discarded(DiscardReason::UnknownRequest);
        };

        if entry.callback.status != CallbackStatus::Pending {
            log::warn!(
                "discarding duplicate callback for request {} (already {})",
                response.request_id,
                entry.callback.status
            );
            return Resolution::Discarded(DiscardReason::AlreadyResolved(entry.callback.status));
        }
        if entry.callback.callback_token != response.callback_token {
            log::warn!("discarding callback for request {}: token mismatch", response.request_id);
            return Resolution::Discarded(DiscardReason::TokenMismatch);
        }

        match response.status {
            ResponseStatus::Success => entry.settle(
                CallbackStatus::Succeeded,
                CallbackOutcome::Succeeded {
                    physical_id: response.physical_resource_id.clone(),
                    data: response.data.clone(),
                },
                now,
            ),
            ResponseStatus::Failed => entry.settle(
                CallbackStatus::Failed,
                CallbackOutcome::Failed {
                    reason: response
                        .reason
                        .clone()
                        .unwrap_or_else(|| "custom provider reported failure".to_string()),
                },
                now,
            ),
        }
        log::debug!("callback {} resolved as {}", response.request_id, entry.callback.status);
        Resolution::Accepted
    }

    /// Force a pending request to `TimedOut`. Returns false if it was
    /// already resolved.
    pub fn expire(&self, request_id: &str, now: DateTime<Utc>) -> bool {
        let mut entries = self.lock();
        match entries.get_mut(request_id) {
            Some(entry) if entry.callback.status == CallbackStatus::Pending => {
                let deadline = entry.callback.timeout_at;
                entry.settle(CallbackStatus::TimedOut, CallbackOutcome::TimedOut { deadline }, now);
                log::debug!("callback {request_id} timed out");
                true
            }
            _ => false,
        }
    }

    /// Fail a pending request that could not be delivered
    pub fn abandon(&self, request_id: &str, reason: &str, now: DateTime<Utc>) -> bool {
        let mut entries = self.lock();
        match entries.get_mut(request_id) {
            Some(entry) if entry.callback.status == CallbackStatus::Pending => {
                entry.settle(
                    CallbackStatus::Failed,
                    CallbackOutcome::Failed {
                        reason: reason.to_string(),
                    },
                    now,
                );
                true
            }
            _ => false,
        }
    }

    /// Expire overdue requests and prune resolved ones past retention.
    ///
    /// Returns the ids that were timed out by this sweep.
    pub fn sweep(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut entries = self.lock();
        let mut expired = Vec::new();

        for (id, entry) in entries.iter_mut() {
            if entry.callback.status == CallbackStatus::Pending && now >= entry.callback.timeout_at {
                let deadline = entry.callback.timeout_at;
                entry.settle(CallbackStatus::TimedOut, CallbackOutcome::TimedOut { deadline }, now);
                expired.push(id.clone());
            }
        }

        let retention = self.retention;
        entries.retain(|_, entry| match entry.resolved_at {
            Some(resolved_at) => now - resolved_at < retention,
            None => true,
        });

        if !expired.is_empty() {
            expired.sort();
            log::info!("timed out {} custom provider request(s)", expired.len());
        }
        expired
    }

    pub fn get(&self, request_id: &str) -> Option<ProviderCallback> {
        self.lock().get(request_id).map(|e| e.callback.clone())
    }

    pub fn pending_count(&self) -> usize {
        self.lock()
            .values()
            .filter(|e| e.callback.status == CallbackStatus::Pending)
            .count()
    }
}

impl Default for CallbackGateway {
    fn default() -> Self {
        Self::new(Duration::from_secs(600))
    }
}

fn to_delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or_else(|_| TimeDelta::days(365))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(id: &str, stack: &str) -> ProviderRequest {
        ProviderRequest {
            request_id: id.to_string(),
            request_type: RequestType::Create,
            stack_id: stack.to_string(),
            logical_resource_id: "Hook".to_string(),
            resource_type: "Custom::Hook".to_string(),
            resource_properties: Properties::new(),
            old_resource_properties: None,
            physical_resource_id: None,
            response_url: "http://127.0.0.1/v1/callbacks".to_string(),
            callback_token: format!("token-{id}"),
        }
    }

    fn success(id: &str) -> ProviderResponse {
        ProviderResponse {
            request_id: id.to_string(),
            status: ResponseStatus::Success,
            physical_resource_id: Some("phys-hook".to_string()),
            data: [("Url".to_string(), json!("http://x"))].into_iter().collect(),
            reason: None,
            callback_token: format!("token-{id}"),
        }
    }

    #[test]
    fn test_success_is_delivered_once() {
        let gateway = CallbackGateway::default();
        let now = Utc::now();
        let (_, rx) = gateway.register(&request("r1", "prod"), Duration::from_secs(60), now);

        assert_eq!(gateway.resolve(&success("r1"), now), Resolution::Accepted);
        assert_eq!(
            gateway.resolve(&success("r1"), now),
            Resolution::Discarded(DiscardReason::AlreadyResolved(CallbackStatus::Succeeded))
        );

        match rx.recv().unwrap() {
            CallbackOutcome::Succeeded { physical_id, data } => {
                assert_eq!(physical_id.as_deref(), Some("phys-hook"));
                assert_eq!(data["Url"], json!("http://x"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_unknown_and_bad_token_discarded() {
        let gateway = CallbackGateway::default();
        let now = Utc::now();
        let _rx = gateway.register(&request("r1", "prod"), Duration::from_secs(60), now);

        assert_eq!(
            gateway.resolve(&success("nope"), now),
            Resolution::Discarded(DiscardReason::UnknownRequest)
        );

        let mut forged = success("r1");
        forged.callback_token = "forged".to_string();
        assert_eq!(
            gateway.resolve(&forged, now),
            Resolution::Discarded(DiscardReason::TokenMismatch)
        );
        assert_eq!(gateway.get("r1").unwrap().status, CallbackStatus::Pending);
    }

    #[test]
    fn test_sweep_times_out_exactly_once() {
        let gateway = CallbackGateway::default();
        let now = Utc::now();
        let (callback, rx) = gateway.register(&request("r1", "prod"), Duration::from_secs(30), now);
        let (_, other_rx) = gateway.register(&request("r2", "staging"), Duration::from_secs(3600), now);

        assert!(gateway.sweep(now + TimeDelta::seconds(10)).is_empty());

        let later = now + TimeDelta::seconds(31);
        assert_eq!(gateway.sweep(later), vec!["r1".to_string()]);
        assert!(gateway.sweep(later).is_empty());
        assert!(!gateway.expire("r1", later));

        assert_eq!(
            rx.recv().unwrap(),
            CallbackOutcome::TimedOut {
                deadline: callback.timeout_at
            }
        );
        assert_eq!(
            gateway.resolve(&success("r1"), later),
            Resolution::Discarded(DiscardReason::AlreadyResolved(CallbackStatus::TimedOut))
        );

        // The other stack's request is untouched
        assert_eq!(gateway.get("r2").unwrap().status, CallbackStatus::Pending);
        assert!(other_rx.try_recv().is_err());
    }

    #[test]
    fn test_failed_response_carries_reason() {
        let gateway = CallbackGateway::default();
        let now = Utc::now();
        let (_, rx) = gateway.register(&request("r1", "prod"), Duration::from_secs(60), now);

        let mut response = success("r1");
        response.status = ResponseStatus::Failed;
        response.reason = Some("quota exceeded".to_string());
        assert_eq!(gateway.resolve(&response, now), Resolution::Accepted);
        assert_eq!(
            rx.recv().unwrap(),
            CallbackOutcome::Failed {
                reason: "quota exceeded".to_string()
            }
        );
    }

    #[test]
    fn test_abandon_then_late_callback() {
        let gateway = CallbackGateway::default();
        let now = Utc::now();
        let (_, rx) = gateway.register(&request("r1", "prod"), Duration::from_secs(60), now);

        assert!(gateway.abandon("r1", "connection refused", now));
        assert!(matches!(rx.recv().unwrap(), CallbackOutcome::Failed { .. }));
        assert!(matches!(
            gateway.resolve(&success("r1"), now),
            Resolution::Discarded(DiscardReason::AlreadyResolved(CallbackStatus::Failed))
        ));
    }

    #[test]
    fn test_resolved_entries_pruned_after_retention() {
        let gateway = CallbackGateway::new(Duration::from_secs(60));
        let now = Utc::now();
        let _rx = gateway.register(&request("r1", "prod"), Duration::from_secs(600), now);
        gateway.resolve(&success("r1"), now);

        gateway.sweep(now + TimeDelta::seconds(30));
        assert!(gateway.get("r1").is_some());

        gateway.sweep(now + TimeDelta::seconds(61));
        assert!(gateway.get("r1").is_none());
        assert_eq!(
            gateway.resolve(&success("r1"), now),
            Resolution::Discarded(DiscardReason::UnknownRequest)
        );
    }

    #[test]
    fn test_wire_format_is_camel_case() {
        let body = serde_json::to_value(request("r1", "prod")).unwrap();
        assert_eq!(body["requestType"], json!("Create"));
        assert_eq!(body["logicalResourceId"], json!("Hook"));
        assert!(body.get("oldResourceProperties").is_none());

        let response: ProviderResponse = serde_json::from_value(json!({
            "requestId": "r1",
            "status": "SUCCESS",
            "physicalResourceId": "p",
            "callbackToken": "t"
        }))
        .unwrap();
        assert_eq!(response.status, ResponseStatus::Success);
        assert!(response.data.is_empty());
    }
}
