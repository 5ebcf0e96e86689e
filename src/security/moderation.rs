//! Content moderation against a versioned category policy.
//!
//! The policy (categories, patterns, warn/block actions) is data loaded from
//! TOML, not code. It is compiled into a single `RegexSet` so each message is
//! scanned once regardless of how many rules exist. Classification depends
//! only on the message content and the policy snapshot.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use arc_swap::ArcSwap;
use regex::{Regex, RegexSet, RegexSetBuilder};
use serde::{Deserialize, Serialize};

use crate::conversation::Message;

/// Policy shipped with the gateway, used when no policy file is configured.
pub const DEFAULT_POLICY: &str = include_str!("../../policy/moderation.toml");

/// Action for a matched rule. Ordered: `Block` beats `Warn` beats `Allow`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModerationAction {
    Allow,
    Warn,
    Block,
}

impl ModerationAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModerationAction::Allow => "allow",
            ModerationAction::Warn => "warn",
            ModerationAction::Block => "block",
        }
    }
}

/// One pattern and the action it triggers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRule {
    pub pattern: String,
    pub action: ModerationAction,
}

/// A named policy category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyCategory {
    pub name: String,
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
}

/// Versioned moderation policy as written on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModerationPolicy {
    pub version: String,
    #[serde(default)]
    pub categories: Vec<PolicyCategory>,
}

/// Error loading or compiling a policy.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("failed to read policy: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse policy: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid pattern in category '{category}': {source}")]
    InvalidPattern {
        category: String,
        #[source]
        source: regex::Error,
    },

    #[error("policy {0} must not be empty")]
    Empty(&'static str),
}

impl ModerationPolicy {
    pub fn from_toml(content: &str) -> Result<Self, PolicyError> {
        Ok(toml::from_str(content)?)
    }

    pub fn load(path: &Path) -> Result<Self, PolicyError> {
        Self::from_toml(&fs::read_to_string(path)?)
    }

    /// The policy bundled with the gateway.
    pub fn builtin() -> Result<Self, PolicyError> {
        Self::from_toml(DEFAULT_POLICY)
    }
}

/// A policy ready for matching.
#[derive(Debug)]
pub struct CompiledPolicy {
    version: String,
    categories: Vec<String>,
    set: RegexSet,
    /// (category index, action) per pattern in `set`.
    rules: Vec<(usize, ModerationAction)>,
}

impl CompiledPolicy {
    pub fn compile(policy: &ModerationPolicy) -> Result<Self, PolicyError> {
        if policy.version.trim().is_empty() {
            return Err(PolicyError::Empty("version"));
        }

        let mut categories = Vec::with_capacity(policy.categories.len());
        let mut patterns = Vec::new();
        let mut rules = Vec::new();

        for (index, category) in policy.categories.iter().enumerate() {
            if category.name.trim().is_empty() {
                return Err(PolicyError::Empty("category name"));
            }
            categories.push(category.name.clone());

            for rule in &category.rules {
                // Compile individually first so errors name the category.
                Regex::new(&rule.pattern).map_err(|source| PolicyError::InvalidPattern {
                    category: category.name.clone(),
                    source,
                })?;
                patterns.push(rule.pattern.as_str());
                rules.push((index, rule.action));
            }
        }

        let set = RegexSetBuilder::new(&patterns)
            .case_insensitive(true)
            .build()
            .map_err(|source| PolicyError::InvalidPattern {
                category: "*".to_string(),
                source,
            })?;

        Ok(Self {
            version: policy.version.clone(),
            categories,
            set,
            rules,
        })
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn categories(&self) -> &[String] {
        &self.categories
    }

    /// Verdict for a single piece of content. `categories` names only the
    /// categories whose rules produced the final action, so a block verdict
    /// never lists a category that merely warned.
    pub fn classify(&self, content: &str) -> ModerationVerdict {
        let matched: Vec<(usize, ModerationAction)> = self
            .set
            .matches(content)
            .iter()
            .map(|i| self.rules[i])
            .collect();

        let action = matched
            .iter()
            .map(|(_, action)| *action)
            .max()
            .unwrap_or(ModerationAction::Allow);
        if action == ModerationAction::Allow {
            return ModerationVerdict::allow();
        }

        let categories = matched
            .iter()
            .filter(|(_, a)| *a == action)
            .map(|(category, _)| self.categories[*category].clone())
            .collect();
        ModerationVerdict { action, categories }
    }
}

/// Verdict for one message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModerationVerdict {
    pub action: ModerationAction,
    pub categories: BTreeSet<String>,
}

impl ModerationVerdict {
    pub fn allow() -> Self {
        Self {
            action: ModerationAction::Allow,
            categories: BTreeSet::new(),
        }
    }
}

/// Verdicts for a whole conversation, in message order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModerationResult {
    pub has_blocked_content: bool,
    pub results: Vec<(usize, ModerationVerdict)>,
    pub policy_version: String,
}

impl ModerationResult {
    /// Categories that caused a block, across all messages.
    pub fn blocked_categories(&self) -> BTreeSet<&str> {
        self.results
            .iter()
            .filter(|(_, v)| v.action == ModerationAction::Block)
            .flat_map(|(_, v)| v.categories.iter().map(String::as_str))
            .collect()
    }

    /// Messages flagged `warn`, as (index, categories).
    pub fn warnings(&self) -> impl Iterator<Item = (usize, &BTreeSet<String>)> {
        self.results
            .iter()
            .filter(|(_, v)| v.action == ModerationAction::Warn)
            .map(|(i, v)| (*i, &v.categories))
    }

    /// Caller-facing rejection text. Names categories, never echoes content.
    pub fn policy_message(&self) -> String {
        let categories = self.blocked_categories();
        if categories.is_empty() {
            "Your message was blocked by our content policy.".to_string()
        } else {
            format!(
                "Your message was blocked by our content policy ({}).",
                categories.into_iter().collect::<Vec<_>>().join(", ")
            )
        }
    }
}

/// Moderates conversations with a hot-swappable policy.
pub struct ContentModerator {
    policy: ArcSwap<CompiledPolicy>,
    enabled: bool,
}

impl ContentModerator {
    pub fn new(policy: CompiledPolicy) -> Self {
        Self {
            policy: ArcSwap::from_pointee(policy),
            enabled: true,
        }
    }

    /// Build a moderator from the built-in policy.
    pub fn builtin() -> Result<Self, PolicyError> {
        Ok(Self::new(CompiledPolicy::compile(&ModerationPolicy::builtin()?)?))
    }

    /// A disabled moderator allows every message.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Snapshot of the active policy.
    pub fn policy(&self) -> Arc<CompiledPolicy> {
        self.policy.load_full()
    }

    pub fn policy_version(&self) -> String {
        self.policy.load().version().to_string()
    }

    /// Classify every message independently against one policy snapshot.
    pub fn moderate(&self, messages: &[Message]) -> ModerationResult {
        let policy = self.policy.load();

        let results: Vec<_> = messages
            .iter()
            .enumerate()
            .map(|(index, message)| {
                let verdict = if self.enabled {
                    policy.classify(&message.content)
                } else {
                    ModerationVerdict::allow()
                };
                (index, verdict)
            })
            .collect();

        ModerationResult {
            has_blocked_content: results
                .iter()
                .any(|(_, v)| v.action == ModerationAction::Block),
            results,
            policy_version: policy.version().to_string(),
        }
    }

    /// Compile and atomically install a new policy. The old policy stays
    /// active if compilation fails. Returns the previous version.
    pub fn reload(&self, policy: &ModerationPolicy) -> Result<String, PolicyError> {
        let compiled = CompiledPolicy::compile(policy)?;
        let previous = self.policy.swap(Arc::new(compiled));
        Ok(previous.version().to_string())
    }
}
