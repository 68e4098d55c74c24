//! Permission checks for tool side effects
//!
//! Evaluation order for a capability and target:
//! 1. Deny globs (path capabilities only) - any match denies
//! 2. Allow globs (path capabilities only) - any match allows
//! 3. Ordered rules - first match wins
//! 4. Default - ask
//!
//! Shell commands are screened by substring lists first. An `ask` outcome
//! goes to the [`ConfirmationHandler`]; with none installed the call is
//! denied.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Kinds of side effect a tool can request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Read,
    Write,
    Edit,
    Bash,
    Web,
}

impl Capability {
    /// Whether deny/allow path globs apply
    pub fn is_path_scoped(&self) -> bool {
        matches!(self, Self::Read | Self::Write | Self::Edit)
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Edit => "edit",
            Self::Bash => "bash",
            Self::Web => "web",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionAction {
    Allow,
    Deny,
    Ask,
}

/// One ordered rule
///
/// A rule without a pattern matches every target of its capability.
///
/// Examples:
/// - `{capability: bash, pattern: "cargo:*", action: allow}` - any cargo command
/// - `{capability: write, pattern: "src/**/*.rs", action: allow}` - Rust sources
/// - `{capability: web, action: deny}` - all network fetches
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionRule {
    pub capability: Capability,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    pub action: PermissionAction,
}

impl PermissionRule {
    pub fn new(capability: Capability, pattern: Option<&str>, action: PermissionAction) -> Self {
        Self {
            capability,
            pattern: pattern.map(str::to_string),
            action,
        }
    }

    pub fn matches(&self, capability: Capability, target: Option<&str>) -> bool {
        if self.capability != capability {
            return false;
        }
        match (&self.pattern, target) {
            (None, _) => true,
            (Some(pattern), Some(target)) => glob_match(pattern, target),
            (Some(_), None) => false,
        }
    }
}

/// Glob-style matching
///
/// - `*` matches any sequence except `/`
/// - `**` matches any sequence including `/`
/// - `?` matches one character except `/`
/// - a trailing `:*` matches any suffix after the prefix
pub fn glob_match(pattern: &str, text: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix(":*") {
        return text.starts_with(prefix);
    }
    match regex::Regex::new(&glob_to_regex(pattern)) {
        Ok(re) => re.is_match(text),
        Err(e) => {
            tracing::warn!("Invalid permission pattern {:?}: {}", pattern, e);
            false
        }
    }
}

fn glob_to_regex(pattern: &str) -> String {
    let mut regex = String::from("^");
    let chars: Vec<char> = pattern.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '*' if chars.get(i + 1) == Some(&'*') => {
                regex.push_str(".*");
                // `**/` also matches zero directories
                i += if chars.get(i + 2) == Some(&'/') { 3 } else { 2 };
            }
            '*' => {
                regex.push_str("[^/]*");
                i += 1;
            }
            '?' => {
                regex.push_str("[^/]");
                i += 1;
            }
            _ => {
                regex.push_str(&regex::escape(&c.to_string()));
                i += 1;
            }
        }
    }

    regex.push('$');
    regex
}

/// Substrings that block a shell command outright
pub fn default_denied_commands() -> Vec<String> {
    [
        "rm -rf /",
        "rm -rf ~",
        "rm -rf *",
        "rm -fr /",
        "git push --force",
        "git push -f",
        ":(){ :|:& };:",
        "| sh",
        "| bash",
        "mkfs",
        "dd if=/dev/zero of=/dev/",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Declarative permission configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionPolicy {
    /// Path globs that are always denied
    #[serde(default)]
    pub deny_paths: Vec<String>,
    /// Path globs that are always allowed
    #[serde(default)]
    pub allow_paths: Vec<String>,
    /// Ordered rules, first match wins
    #[serde(default)]
    pub rules: Vec<PermissionRule>,
    /// Shell substrings that deny immediately
    #[serde(default = "default_denied_commands")]
    pub denied_commands: Vec<String>,
    /// Shell substrings that allow immediately
    #[serde(default)]
    pub allowed_commands: Vec<String>,
}

impl Default for PermissionPolicy {
    fn default() -> Self {
        Self {
            deny_paths: Vec::new(),
            allow_paths: Vec::new(),
            rules: Vec::new(),
            denied_commands: default_denied_commands(),
            allowed_commands: Vec::new(),
        }
    }
}

impl PermissionPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deny_path(mut self, glob: &str) -> Self {
        self.deny_paths.push(glob.to_string());
        self
    }

    pub fn allow_path(mut self, glob: &str) -> Self {
        self.allow_paths.push(glob.to_string());
        self
    }

    pub fn rule(mut self, capability: Capability, pattern: Option<&str>, action: PermissionAction) -> Self {
        self.rules.push(PermissionRule::new(capability, pattern, action));
        self
    }

    pub fn deny_command(mut self, substring: &str) -> Self {
        self.denied_commands.push(substring.to_string());
        self
    }

    pub fn allow_command(mut self, substring: &str) -> Self {
        self.allowed_commands.push(substring.to_string());
        self
    }

    /// Resolve an action without consulting any handler
    pub fn evaluate(&self, capability: Capability, target: Option<&str>) -> (PermissionAction, String) {
        if let (true, Some(path)) = (capability.is_path_scoped(), target) {
            if let Some(glob) = self.deny_paths.iter().find(|g| glob_match(g, path)) {
                return (PermissionAction::Deny, format!("{} matches denied path {}", path, glob));
            }
            if let Some(glob) = self.allow_paths.iter().find(|g| glob_match(g, path)) {
                return (PermissionAction::Allow, format!("{} matches allowed path {}", path, glob));
            }
        }

        if let Some(rule) = self.rules.iter().find(|r| r.matches(capability, target)) {
            let reason = match &rule.pattern {
                Some(p) => format!("{} rule {}({})", capability, capability, p),
                None => format!("{} rule {}", capability, capability),
            };
            return (rule.action, reason);
        }

        (PermissionAction::Ask, format!("no rule for {}", capability))
    }
}

/// Outcome of a permission check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionDecision {
    pub allowed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl PermissionDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }

    /// Text a tool returns when refused
    pub fn denial_message(&self) -> String {
        format!(
            "Permission denied: {}",
            self.reason.as_deref().unwrap_or("not allowed")
        )
    }
}

/// What is being asked of the user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionRequest {
    pub capability: Capability,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    pub reason: String,
}

/// Asks a human to approve an `ask` outcome
#[async_trait]
pub trait ConfirmationHandler: Send + Sync {
    async fn confirm(&self, request: PermissionRequest) -> bool;
}

/// Stateless checker over a [`PermissionPolicy`]
pub struct PermissionChecker {
    policy: PermissionPolicy,
    confirmer: Option<Arc<dyn ConfirmationHandler>>,
}

impl PermissionChecker {
    pub fn new(policy: PermissionPolicy) -> Self {
        Self {
            policy,
            confirmer: None,
        }
    }

    /// Checker that allows everything not explicitly denied
    pub fn permissive() -> Self {
        let mut policy = PermissionPolicy::default();
        for capability in [
            Capability::Read,
            Capability::Write,
            Capability::Edit,
            Capability::Bash,
            Capability::Web,
        ] {
            policy.rules.push(PermissionRule::new(capability, None, PermissionAction::Allow));
        }
        Self::new(policy)
    }

    pub fn with_confirmer(mut self, confirmer: Arc<dyn ConfirmationHandler>) -> Self {
        self.confirmer = Some(confirmer);
        self
    }

    pub fn policy(&self) -> &PermissionPolicy {
        &self.policy
    }

    pub async fn check(&self, capability: Capability, target: Option<&str>) -> PermissionDecision {
        let (action, reason) = self.policy.evaluate(capability, target);
        self.resolve(capability, target, action, reason).await
    }

    pub async fn check_bash(&self, command: &str) -> PermissionDecision {
        if let Some(hit) = self
            .policy
            .denied_commands
            .iter()
            .find(|s| !s.is_empty() && command.contains(s.as_str()))
        {
            tracing::info!(command, "Blocked shell command containing {:?}", hit);
            return PermissionDecision::deny(format!("command contains blocked pattern {:?}", hit));
        }
        if self
            .policy
            .allowed_commands
            .iter()
            .any(|s| !s.is_empty() && command.contains(s.as_str()))
        {
            return PermissionDecision::allow();
        }
        self.check(Capability::Bash, Some(command)).await
    }

    async fn resolve(
        &self,
        capability: Capability,
        target: Option<&str>,
        action: PermissionAction,
        reason: String,
    ) -> PermissionDecision {
        match action {
            PermissionAction::Allow => PermissionDecision::allow(),
            PermissionAction::Deny => PermissionDecision::deny(reason),
            PermissionAction::Ask => {
                let Some(confirmer) = &self.confirmer else {
                    return PermissionDecision::deny(format!(
                        "{} requires confirmation and no confirmation handler is available",
                        capability
                    ));
                };
                let request = PermissionRequest {
                    capability,
                    target: target.map(str::to_string),
                    reason,
                };
                if confirmer.confirm(request).await {
                    PermissionDecision::allow()
                } else {
                    PermissionDecision::deny(format!("{} was rejected by the user", capability))
                }
            }
        }
    }
}

impl std::fmt::Debug for PermissionChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermissionChecker")
            .field("policy", &self.policy)
            .field("confirmer", &self.confirmer.is_some())
            .finish()
    }
}
