use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::DeliveryId;
use crate::webhooks::EmitOptions;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct EmitEventRequest {
    pub event: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub entity_id: Option<String>,
    #[serde(default)]
    pub entity_type: Option<String>,
    #[serde(default)]
    pub metadata: Option<Map<String, Value>>,
}

impl EmitEventRequest {
    pub fn into_parts(self) -> (String, Value, EmitOptions) {
        let options = EmitOptions {
            entity_id: self.entity_id,
            entity_type: self.entity_type,
            metadata: self.metadata,
        };
        (self.event, self.data, options)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EmitEventResponse {
    pub delivery_ids: Vec<DeliveryId>,
}
