//! Agent configuration model and validation.
//!
//! The configuration is content-addressed: the deploy pipeline hashes the
//! behavior-relevant fields into the v3 config hash, so validation here is
//! strict about exactly which shapes are accepted before anything touches
//! the network.

use crate::error::{SdkError, SdkResult};
use serde::{Deserialize, Serialize};

/// Fallback maximum size for agent JSON files (24 KiB). The authoritative
/// limit is fetched from the backend schema endpoint when reachable.
pub const DEFAULT_MAX_JSON_SIZE: usize = 24 * 1024;

/// How the agent is addressed by the routing backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentType {
    /// Explicit command triggers.
    Command,
    /// Natural-language routing.
    Nlp,
    /// Agent backed by an MCP manifest.
    Mcp,
}

impl AgentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentType::Command => "command",
            AgentType::Nlp => "nlp",
            AgentType::Mcp => "mcp",
        }
    }
}

/// One advertised capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capability {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Capability {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
        }
    }
}

/// One command trigger, optionally priced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub trigger: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(
        default,
        alias = "pricePerUnit",
        skip_serializing_if = "Option::is_none"
    )]
    pub price_per_unit: Option<f64>,
    #[serde(default, alias = "priceType", skip_serializing_if = "Option::is_none")]
    pub price_type: Option<String>,
    #[serde(default, alias = "taskUnit", skip_serializing_if = "Option::is_none")]
    pub task_unit: Option<String>,
}

/// The full agent descriptor as loaded from JSON or built in code.
///
/// Keys are snake_case; camelCase aliases keep older agent files loading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub name: String,
    #[serde(alias = "agentId")]
    pub agent_id: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(alias = "agentType")]
    pub agent_type: AgentType,
    pub categories: Vec<String>,
    pub capabilities: Vec<Capability>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub commands: Vec<Command>,
    #[serde(default, alias = "nlpFallback")]
    pub nlp_fallback: bool,
    #[serde(default, alias = "mcpManifest", skip_serializing_if = "Option::is_none")]
    pub mcp_manifest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_version: Option<String>,
}

impl AgentConfig {
    /// Cheap checks that run before full validation: required fields and
    /// the agent-id character class. No length scans of nested arrays.
    pub fn pre_validate(&self) -> SdkResult<()> {
        if self.name.is_empty() {
            return Err(SdkError::InvalidConfig("name is required".into()));
        }
        if self.agent_id.is_empty() {
            return Err(SdkError::InvalidConfig("agent_id is required".into()));
        }
        validate_agent_id(&self.agent_id)?;
        Ok(())
    }

    /// Full validation against the agent schema. Runs before any network
    /// call so a bad config never consumes a challenge or reservation.
    pub fn validate(&self) -> SdkResult<()> {
        self.pre_validate()?;

        if self.name.len() < 3 {
            return Err(SdkError::InvalidConfig(
                "name must be at least 3 characters".into(),
            ));
        }
        if self.name.len() > 100 {
            return Err(SdkError::InvalidConfig(
                "name must not exceed 100 characters".into(),
            ));
        }
        if contains_html_tag(&self.name) {
            return Err(SdkError::InvalidConfig(
                "name must not contain HTML tags".into(),
            ));
        }

        if self.agent_id.len() > 64 {
            return Err(SdkError::InvalidConfig(
                "agent_id must not exceed 64 characters".into(),
            ));
        }

        if self.description.len() < 10 {
            return Err(SdkError::InvalidConfig(
                "description must be at least 10 characters".into(),
            ));
        }
        if self.description.len() > 2000 {
            return Err(SdkError::InvalidConfig(
                "description must not exceed 2000 characters".into(),
            ));
        }
        if contains_html_tag(&self.description) {
            return Err(SdkError::InvalidConfig(
                "description must not contain HTML tags".into(),
            ));
        }

        if self.categories.is_empty() {
            return Err(SdkError::InvalidConfig(
                "at least 1 category is required".into(),
            ));
        }
        if self.categories.len() > 2 {
            return Err(SdkError::InvalidConfig(
                "maximum 2 categories allowed".into(),
            ));
        }

        if self.capabilities.is_empty() {
            return Err(SdkError::InvalidConfig(
                "at least 1 capability is required".into(),
            ));
        }
        if self.capabilities.len() > 50 {
            return Err(SdkError::InvalidConfig(
                "maximum 50 capabilities allowed".into(),
            ));
        }
        for (i, cap) in self.capabilities.iter().enumerate() {
            if cap.name.is_empty() {
                return Err(SdkError::InvalidConfig(format!(
                    "capability {}: name is required",
                    i + 1
                )));
            }
            if cap.name.len() > 100 {
                return Err(SdkError::InvalidConfig(format!(
                    "capability {}: name must not exceed 100 characters",
                    i + 1
                )));
            }
            if let Some(desc) = &cap.description {
                if desc.len() > 500 {
                    return Err(SdkError::InvalidConfig(format!(
                        "capability {}: description must not exceed 500 characters",
                        i + 1
                    )));
                }
            }
        }

        if self.commands.len() > 100 {
            return Err(SdkError::InvalidConfig(
                "maximum 100 commands allowed".into(),
            ));
        }
        for (i, cmd) in self.commands.iter().enumerate() {
            if cmd.trigger.is_empty() {
                return Err(SdkError::InvalidConfig(format!(
                    "command {}: trigger is required",
                    i + 1
                )));
            }
            if cmd.trigger.len() > 100 {
                return Err(SdkError::InvalidConfig(format!(
                    "command {}: trigger must not exceed 100 characters",
                    i + 1
                )));
            }
            if let Some(desc) = &cmd.description {
                if desc.len() > 500 {
                    return Err(SdkError::InvalidConfig(format!(
                        "command {}: description must not exceed 500 characters",
                        i + 1
                    )));
                }
            }
        }

        if self.agent_type == AgentType::Mcp && self.mcp_manifest.is_none() {
            return Err(SdkError::InvalidConfig(
                "mcp_manifest is required for mcp agent type".into(),
            ));
        }

        Ok(())
    }
}

/// Validate the agent-id character class: `[a-z0-9-]` only.
pub fn validate_agent_id(agent_id: &str) -> SdkResult<()> {
    let valid = agent_id
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    if !valid {
        return Err(SdkError::InvalidConfig(
            "agent_id can only contain lowercase letters, numbers, and hyphens".into(),
        ));
    }
    Ok(())
}

/// Derive a valid agent id from a display name: lowercase, spaces become
/// hyphens, anything outside `[a-z0-9-]` is dropped, runs of hyphens
/// collapse, leading/trailing hyphens are trimmed.
pub fn agent_id_from_name(name: &str) -> String {
    let mut id = String::with_capacity(name.len());
    let mut prev_hyphen = false;
    for c in name.to_lowercase().chars() {
        let mapped = if c == ' ' { '-' } else { c };
        if mapped.is_ascii_lowercase() || mapped.is_ascii_digit() {
            id.push(mapped);
            prev_hyphen = false;
        } else if mapped == '-' && !prev_hyphen {
            id.push('-');
            prev_hyphen = true;
        }
    }
    id.trim_matches('-').to_string()
}

/// Detect HTML/script tags. Anything shaped like `<...>` is rejected; this
/// intentionally overmatches rather than trying to parse markup.
pub fn contains_html_tag(text: &str) -> bool {
    let mut in_tag = false;
    for c in text.chars() {
        match c {
            '<' => in_tag = true,
            '>' if in_tag => return true,
            _ => {}
        }
    }
    false
}
