use serde::{Deserialize, Serialize};

use lorekeeper_core::{AssetJob, AssetJobId, AssetType, LoreReferences, WorldId};

use crate::gateway::QueueError;

/// Known job types. Routing keys are the upper-case strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobType {
    AssetGeneration,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::AssetGeneration => "ASSET_GENERATION",
        }
    }
}

impl core::fmt::Display for JobType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wire shape of every queue message body.
///
/// `job_type` stays a plain string so that messages of a type this process
/// has no handler for still parse and can be left for another consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEnvelope {
    pub job_type: String,
    pub payload: serde_json::Value,
}

impl QueueEnvelope {
    pub fn new(job_type: JobType, payload: serde_json::Value) -> Self {
        Self {
            job_type: job_type.as_str().to_string(),
            payload,
        }
    }

    pub fn asset_generation(payload: &AssetGenerationPayload) -> Result<Self, QueueError> {
        let payload = serde_json::to_value(payload)
            .map_err(|e| QueueError::Serialization(e.to_string()))?;
        Ok(Self::new(JobType::AssetGeneration, payload))
    }

    pub fn to_body(&self) -> Result<String, QueueError> {
        serde_json::to_string(self).map_err(|e| QueueError::Serialization(e.to_string()))
    }

    pub fn from_body(body: &str) -> Result<Self, QueueError> {
        serde_json::from_str(body).map_err(|e| QueueError::Deserialization(e.to_string()))
    }

    pub fn is(&self, job_type: JobType) -> bool {
        self.job_type == job_type.as_str()
    }
}

/// Payload of an `ASSET_GENERATION` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetGenerationPayload {
    pub asset_job_id: AssetJobId,
    pub world_id: WorldId,
    pub asset_type: AssetType,
    pub provider: String,
    pub model_id: Option<String>,
    pub prompt_spec: serde_json::Value,
    pub priority: Option<i32>,
    pub requested_by: String,
    #[serde(default)]
    pub references: LoreReferences,
}

impl AssetGenerationPayload {
    pub fn for_job(job: &AssetJob, references: LoreReferences) -> Self {
        Self {
            asset_job_id: job.id,
            world_id: job.world_id,
            asset_type: job.asset_type,
            provider: job.provider.clone(),
            model_id: job.model_id.clone(),
            prompt_spec: job.prompt_spec.clone(),
            priority: job.priority,
            requested_by: job.requested_by.clone(),
            references,
        }
    }

    pub fn from_envelope(envelope: &QueueEnvelope) -> Result<Self, QueueError> {
        serde_json::from_value(envelope.payload.clone())
            .map_err(|e| QueueError::Deserialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use lorekeeper_core::EntityId;
    use serde_json::json;

    #[test]
    fn envelope_wire_shape() {
        let job = AssetJob::queued(
            WorldId::new(),
            AssetType::Map,
            "cartographer",
            Some("v3".into()),
            Some(5),
            "user-7",
            "abc",
            json!({"region": "north"}),
            Utc::now(),
        );
        let entity = EntityId::new();
        let refs = LoreReferences {
            entity_ids: vec![entity],
            ..Default::default()
        };
        let envelope =
            QueueEnvelope::asset_generation(&AssetGenerationPayload::for_job(&job, refs)).unwrap();
        let body: serde_json::Value =
            serde_json::from_str(&envelope.to_body().unwrap()).unwrap();

        assert_eq!(body["job_type"], "ASSET_GENERATION");
        assert_eq!(body["payload"]["asset_job_id"], job.id.to_string());
        assert_eq!(body["payload"]["asset_type"], "MAP");
        assert_eq!(body["payload"]["priority"], 5);
        assert_eq!(body["payload"]["references"]["entity_ids"][0], entity.to_string());
    }

    #[test]
    fn unknown_job_types_still_parse() {
        let envelope = QueueEnvelope::from_body(r#"{"job_type":"EMBEDDING","payload":{}}"#).unwrap();
        assert!(!envelope.is(JobType::AssetGeneration));
        assert!(QueueEnvelope::from_body("not json").is_err());
    }
}
