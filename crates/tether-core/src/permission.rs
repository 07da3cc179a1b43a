use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::CoreError;

/// How a session answers tool-permission questions.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PermissionMode {
    #[default]
    Default,
    AcceptEdits,
    BypassPermissions,
    Plan,
}

/// Tools auto-approved under [`PermissionMode::AcceptEdits`].
pub const EDIT_TOOLS: &[&str] = &["Edit", "MultiEdit", "Write", "NotebookEdit"];

impl PermissionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::AcceptEdits => "acceptEdits",
            Self::BypassPermissions => "bypassPermissions",
            Self::Plan => "plan",
        }
    }

    /// Whether a tool may run without asking the user.
    pub fn auto_allows(&self, tool_name: &str) -> bool {
        match self {
            Self::BypassPermissions => true,
            Self::AcceptEdits => EDIT_TOOLS.contains(&tool_name),
            Self::Default | Self::Plan => false,
        }
    }
}

impl std::str::FromStr for PermissionMode {
    type Err = CoreError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "default" => Ok(Self::Default),
            "acceptEdits" => Ok(Self::AcceptEdits),
            "bypassPermissions" => Ok(Self::BypassPermissions),
            "plan" => Ok(Self::Plan),
            other => Err(CoreError::UnknownPermissionMode(other.to_string())),
        }
    }
}

/// The single answer a running operation receives for a permission question.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "behavior", rename_all = "snake_case")]
pub enum PermissionOutcome {
    Allow {
        #[serde(rename = "updatedInput")]
        updated_input: Value,
    },
    Deny {
        message: String,
        /// Set when the operation itself was aborted.
        interrupt: bool,
    },
}

impl PermissionOutcome {
    pub fn is_allow(&self) -> bool {
        matches!(self, Self::Allow { .. })
    }
}
