//! User context: the identity the local cache is scoped to.

use serde::{Deserialize, Serialize};

/// Snapshot of the active user identity and its version.
///
/// `version` increases on every mutation; cache entries are stamped with the
/// version they were written under and reads filter on the current value.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UserContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<String>,
    pub version: u64,
}

impl UserContext {
    pub fn new(
        user_id: Option<String>,
        external_user_id: Option<String>,
        workspace_id: Option<String>,
    ) -> Self {
        Self {
            user_id: non_empty(user_id),
            external_user_id: non_empty(external_user_id),
            workspace_id: non_empty(workspace_id),
            version: 0,
        }
    }

    /// A context is set when either identity is present.
    pub fn is_set(&self) -> bool {
        self.user_id.is_some() || self.external_user_id.is_some()
    }

    /// Filesystem-safe key for the user-scoped cache directory.
    pub fn user_key(&self) -> Option<String> {
        if let Some(id) = &self.user_id {
            return Some(format!("user_{}", sanitize(id)));
        }
        self.external_user_id
            .as_ref()
            .map(|id| format!("ext_{}", sanitize(id)))
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
