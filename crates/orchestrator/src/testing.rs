//! Scripted providers and transports for engine tests

use crate::error::ProviderError;
use crate::gateway::{CallbackGateway, ProviderRequest, ProviderResponse, RequestType, ResponseStatus, RequestTransport};
use crate::properties::Properties;
use crate::provider::{CreateRequest, Provisioned, ResourceProvider};
use chrono::Utc;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::thread;
use std::time::Duration;

#[derive(Default)]
struct Script {
    /// physical id -> (logical id, properties)
    resources: HashMap<String, (String, Properties)>,
    tokens: HashMap<String, String>,
    calls: Vec<String>,
    fail_create: HashSet<String>,
    fail_update: HashSet<String>,
    fail_delete: HashSet<String>,
    /// Remaining transient failures per logical id
    flaky: HashMap<String, u32>,
    /// Delay before a create takes effect
    slow_create: HashMap<String, Duration>,
}

/// In-memory provider whose failures are scripted per logical id
pub struct ScriptedProvider {
    resource_type: String,
    replacing: Vec<&'static str>,
    counter: AtomicUsize,
    script: Mutex<Script>,
}

impl ScriptedProvider {
    pub fn new(resource_type: &str) -> Self {
        Self {
            resource_type: resource_type.to_string(),
            replacing: Vec::new(),
            counter: AtomicUsize::new(0),
            script: Mutex::new(Script::default()),
        }
    }

    pub fn replacing(mut self, keys: &[&'static str]) -> Self {
        self.replacing = keys.to_vec();
        self
    }

    fn lock(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn fail_create(&self, logical_id: &str) {
        self.lock().fail_create.insert(logical_id.to_string());
    }

    pub fn fail_update(&self, logical_id: &str) {
        self.lock().fail_update.insert(logical_id.to_string());
    }

    pub fn fail_delete(&self, logical_id: &str) {
        self.lock().fail_delete.insert(logical_id.to_string());
    }

    pub fn heal(&self) {
        let mut script = self.lock();
        script.fail_create.clear();
        script.fail_update.clear();
        script.fail_delete.clear();
    }

    /// Fail the next `times` calls for `logical_id` with a transient error
    pub fn flaky(&self, logical_id: &str, times: u32) {
        self.lock().flaky.insert(logical_id.to_string(), times);
    }

    /// Creates of `logical_id` take `delay` before the resource exists
    pub fn slow_create(&self, logical_id: &str, delay: Duration) {
        self.lock().slow_create.insert(logical_id.to_string(), delay);
    }

    /// Calls made so far, e.g. `"create A"`
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn count(&self, call: &str) -> usize {
        self.lock().calls.iter().filter(|c| *c == call).count()
    }

    /// Live physical ids for a logical id
    pub fn live(&self, logical_id: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .lock()
            .resources
            .iter()
            .filter(|(_, (logical, _))| logical == logical_id)
            .map(|(physical, _)| physical.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn properties(&self, physical_id: &str) -> Option<Properties> {
        self.lock().resources.get(physical_id).map(|(_, props)| props.clone())
    }

    pub fn live_count(&self) -> usize {
        self.lock().resources.len()
    }

    /// Change a property behind the engine's back
    pub fn set_external(&self, physical_id: &str, key: &str, value: Value) {
        if let Some((_, props)) = self.lock().resources.get_mut(physical_id) {
            props.insert(key.to_string(), value);
        }
    }

    /// Delete a resource behind the engine's back
    pub fn remove_external(&self, physical_id: &str) {
        self.lock().resources.remove(physical_id);
    }

    /// Create a resource as if a call had gone through before a crash
    pub fn adopt(&self, logical_id: &str, token: &str, properties: Properties) -> String {
        let physical_id = self.next_id(logical_id);
        let mut script = self.lock();
        script.tokens.insert(token.to_string(), physical_id.clone());
        script
            .resources
            .insert(physical_id.clone(), (logical_id.to_string(), properties));
        physical_id
    }

    fn next_id(&self, logical_id: &str) -> String {
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{logical_id}-{n}")
    }

    fn logical_of(script: &Script, physical_id: &str) -> String {
        script
            .resources
            .get(physical_id)
            .map_or_else(|| physical_id.to_string(), |(logical, _)| logical.clone())
    }

    fn check_flaky(script: &mut Script, logical_id: &str) -> Result<(), ProviderError> {
        if let Some(remaining) = script.flaky.get_mut(logical_id) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(ProviderError::Transient(format!("{logical_id} throttled")));
            }
        }
        Ok(())
    }
}

impl ResourceProvider for ScriptedProvider {
    fn resource_type(&self) -> &str {
        &self.resource_type
    }

    fn replacement_properties(&self) -> &[&str] {
        &self.replacing
    }

    fn create(&self, request: &CreateRequest) -> Result<Provisioned, ProviderError> {
        let (existing, delay) = {
            let mut script = self.lock();
            script.calls.push(format!("create {}", request.logical_id));
            Self::check_flaky(&mut script, &request.logical_id)?;
            if script.fail_create.contains(&request.logical_id) {
                return Err(ProviderError::Rejected(format!("create {} refused", request.logical_id)));
            }
            (
                script.tokens.get(&request.idempotency_token).cloned(),
                script.slow_create.get(&request.logical_id).copied(),
            )
        };
        if let Some(delay) = delay {
            thread::sleep(delay);
        }

        let physical_id = existing.unwrap_or_else(|| self.next_id(&request.logical_id));
        let mut script = self.lock();
        script
            .tokens
            .insert(request.idempotency_token.clone(), physical_id.clone());
        script.resources.insert(
            physical_id.clone(),
            (request.logical_id.clone(), request.properties.clone()),
        );
        let outputs = [("Arn".to_string(), Value::String(format!("arn:{physical_id}")))]
            .into_iter()
            .collect();
        Ok(Provisioned { physical_id, outputs })
    }

    fn update(&self, physical_id: &str, _old: &Properties, new: &Properties) -> Result<Properties, ProviderError> {
        let mut script = self.lock();
        let logical_id = Self::logical_of(&script, physical_id);
        script.calls.push(format!("update {logical_id}"));
        Self::check_flaky(&mut script, &logical_id)?;
        if script.fail_update.contains(&logical_id) {
            return Err(ProviderError::Rejected(format!("update {logical_id} refused")));
        }
        match script.resources.get_mut(physical_id) {
            Some((_, props)) => {
                *props = new.clone();
                Ok([("Arn".to_string(), Value::String(format!("arn:{physical_id}")))]
                    .into_iter()
                    .collect())
            }
            None => Err(ProviderError::NotFound(physical_id.to_string())),
        }
    }

    fn delete(&self, physical_id: &str) -> Result<(), ProviderError> {
        let mut script = self.lock();
        let logical_id = Self::logical_of(&script, physical_id);
        script.calls.push(format!("delete {logical_id}"));
        if script.fail_delete.contains(&logical_id) {
            return Err(ProviderError::Rejected(format!("delete {logical_id} refused")));
        }
        match script.resources.remove(physical_id) {
            Some(_) => Ok(()),
            None => Err(ProviderError::NotFound(physical_id.to_string())),
        }
    }

    fn read(&self, physical_id: &str) -> Result<Option<Properties>, ProviderError> {
        Ok(self.properties(physical_id))
    }

    fn find_by_token(&self, token: &str) -> Result<Option<Provisioned>, ProviderError> {
        let script = self.lock();
        Ok(script.tokens.get(token).and_then(|physical_id| {
            script.resources.get(physical_id).map(|_| Provisioned {
                physical_id: physical_id.clone(),
                outputs: Properties::new(),
            })
        }))
    }
}

/// How the scripted endpoint answers a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Behaviour {
    Respond,
    /// Respond to updates with a fresh physical id
    NewIdOnUpdate,
    Fail(String),
    Silent,
    Unreachable,
}

/// Transport that answers custom provider requests in-process
#[derive(Default)]
pub struct ScriptedTransport {
    gateway: OnceLock<Arc<CallbackGateway>>,
    behaviour: Mutex<HashMap<String, Behaviour>>,
    requests: Mutex<Vec<ProviderRequest>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver responses to `gateway`
    pub fn attach(&self, gateway: Arc<CallbackGateway>) {
        let _ = self.gateway.set(gateway);
    }

    pub fn behave(&self, logical_id: &str, behaviour: Behaviour) {
        self.behaviour
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(logical_id.to_string(), behaviour);
    }

    pub fn requests(&self) -> Vec<ProviderRequest> {
        self.requests
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

impl RequestTransport for ScriptedTransport {
    fn send(&self, _service_token: &str, request: &ProviderRequest) -> Result<(), ProviderError> {
        self.requests
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(request.clone());
        let behaviour = self
            .behaviour
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&request.logical_resource_id)
            .cloned()
            .unwrap_or(Behaviour::Respond);

        let mut response = ProviderResponse {
            request_id: request.request_id.clone(),
            status: ResponseStatus::Success,
            physical_resource_id: request
                .physical_resource_id
                .clone()
                .or_else(|| Some(format!("custom-{}", request.logical_resource_id))),
            data: [("Url".to_string(), Value::String(format!("https://{}", request.logical_resource_id)))]
                .into_iter()
                .collect(),
            reason: None,
            callback_token: request.callback_token.clone(),
        };
        match behaviour {
            Behaviour::Respond => {}
            Behaviour::NewIdOnUpdate => {
                if request.request_type == RequestType::Update {
                    response.physical_resource_id = Some(format!("custom-{}-v2", request.logical_resource_id));
                }
            }
            Behaviour::Fail(reason) => {
                response.status = ResponseStatus::Failed;
                response.reason = Some(reason);
            }
            Behaviour::Silent => return Ok(()),
            Behaviour::Unreachable => {
                return Err(ProviderError::Transport("connection refused".to_string()));
            }
        }
        if let Some(gateway) = self.gateway.get() {
            gateway.resolve(&response, Utc::now());
        }
        Ok(())
    }
}
