use serde::{Deserialize, Serialize};

/// A project as exposed by the collaborator endpoints. Each project is a room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: i64,
    pub name: String,
    pub users: Vec<String>,
    /// Last file tree snapshot saved by a member, `{}` until one is saved.
    pub file_tree: serde_json::Value,
    pub created_at: String,
}

/// Identity decoded from a verified bearer credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub participant_id: commsync_common::ParticipantId,
    pub display_label: String,
}

impl Identity {
    pub fn sender(&self) -> commsync_common::Sender {
        commsync_common::Sender::new(self.participant_id.clone(), self.display_label.clone())
    }
}
