use serde::Serialize;

use crate::services::DeletionScheduled;

#[derive(Debug, Serialize)]
pub struct DeletionRequestedResponse {
    pub message: String,
    #[serde(flatten)]
    pub schedule: DeletionScheduled,
}
