//! Null::Resource - records its properties and does nothing else.
//!
//! Useful for wiring outputs between resources and for trying out
//! templates. Properties are echoed back as outputs next to `Id`.

use orchestrator::{CreateRequest, Properties, ProviderError, Provisioned, ResourceProvider};
use serde_json::Value;
use std::sync::Arc;

use super::TOKENS;
use super::ledger::Ledger;

const RECORDS: &str = "null";

pub struct NullResource {
    ledger: Arc<Ledger>,
}

impl NullResource {
    pub fn new(ledger: Arc<Ledger>) -> Self {
        Self { ledger }
    }

    fn outputs(physical_id: &str, properties: &Properties) -> Properties {
        let mut outputs = properties.clone();
        outputs.insert("Id".to_string(), Value::String(physical_id.to_string()));
        outputs
    }
}

impl ResourceProvider for NullResource {
    fn resource_type(&self) -> &str {
        "Null::Resource"
    }

    fn create(&self, request: &CreateRequest) -> Result<Provisioned, ProviderError> {
        let hash = blake3::hash(request.idempotency_token.as_bytes()).to_hex();
        let physical_id = format!("null-{}", &hash[..12]);
        self.ledger.put(RECORDS, &physical_id, &request.properties)?;
        self.ledger.put(TOKENS, &request.idempotency_token, &physical_id)?;
        Ok(Provisioned {
            outputs: Self::outputs(&physical_id, &request.properties),
            physical_id,
        })
    }

    fn update(&self, physical_id: &str, _old: &Properties, new: &Properties) -> Result<Properties, ProviderError> {
        if self.ledger.get::<Properties>(RECORDS, physical_id)?.is_none() {
            return Err(ProviderError::NotFound(physical_id.to_string()));
        }
        self.ledger.put(RECORDS, physical_id, new)?;
        Ok(Self::outputs(physical_id, new))
    }

    fn delete(&self, physical_id: &str) -> Result<(), ProviderError> {
        if self.ledger.remove(RECORDS, physical_id)? {
            Ok(())
        } else {
            Err(ProviderError::NotFound(physical_id.to_string()))
        }
    }

    fn read(&self, physical_id: &str) -> Result<Option<Properties>, ProviderError> {
        self.ledger.get(RECORDS, physical_id)
    }

    fn find_by_token(&self, token: &str) -> Result<Option<Provisioned>, ProviderError> {
        let Some(physical_id) = self.ledger.get::<String>(TOKENS, token)? else {
            return Ok(None);
        };
        Ok(self
            .ledger
            .get::<Properties>(RECORDS, &physical_id)?
            .map(|properties| Provisioned {
                outputs: Self::outputs(&physical_id, &properties),
                physical_id,
            }))
    }
}
