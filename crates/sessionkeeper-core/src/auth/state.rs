use serde::{Deserialize, Serialize};

/// Authentication state as seen by the UI.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum SessionState {
    /// Validity is still being determined (startup only).
    #[default]
    Unknown,
    Authenticated { persistent: bool },
    Unauthenticated,
}

impl SessionState {
    pub fn is_authenticated(&self) -> bool {
        matches!(self, Self::Authenticated { .. })
    }

    pub fn is_resolved(&self) -> bool {
        !matches!(self, Self::Unknown)
    }
}

/// The signed-in user as reported by the identity endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthUser {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
}

impl AuthUser {
    /// Name to greet the user with
    pub fn display(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.username)
    }
}
