//! Constitution: the YAML policy document governing every mutating action.
//!
//! The document lives at `AutoSnippet/constitution.yaml` and declares
//! capabilities (probeable environmental abilities), roles (permission
//! strings), and priority rules. `check` evaluates an
//! `(actor, action, resource)` triple into an allow/deny decision with a
//! reason; the gateway consults it before dispatching any write.

pub mod capability;

use crate::core::error::EngineError;
use crate::core::store::Store;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;

/// Probe configuration for one capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilitySpec {
    /// Shell command whose exit code answers the probe.
    pub probe: String,
    /// Behavior when the probe command cannot run at all.
    #[serde(default = "default_behavior")]
    pub on_missing_repo: String,
    /// Behavior when the probe runs and reports failure.
    #[serde(default = "default_behavior")]
    pub on_missing_remote: String,
    /// Seconds a probe result stays fresh.
    #[serde(default = "default_ttl")]
    pub cache_ttl_secs: u64,
}

fn default_behavior() -> String {
    "deny".to_string()
}

fn default_ttl() -> u64 {
    300
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoleSpec {
    /// Permission strings of the form `verb:resource`; `*` wildcards allowed
    /// on either side.
    #[serde(default)]
    pub permissions: Vec<String>,
    /// Capabilities this role must hold.
    #[serde(default)]
    pub requires: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriorityRule {
    pub priority: i64,
    #[serde(default)]
    pub description: String,
    /// Action matchers, `*` wildcards allowed per `verb:resource` part.
    #[serde(default)]
    pub actions: Vec<String>,
    /// Resource matchers with trailing-`*` globs.
    #[serde(default)]
    pub resources: Vec<String>,
    /// `allow` or `deny`.
    pub outcome: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Constitution {
    #[serde(default)]
    pub capabilities: BTreeMap<String, CapabilitySpec>,
    #[serde(default)]
    pub roles: BTreeMap<String, RoleSpec>,
    #[serde(default)]
    pub priorities: Vec<PriorityRule>,
}

/// Outcome of a constitution check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub allow: bool,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<i64>,
}

impl Constitution {
    /// Load the project's constitution, falling back to the embedded default
    /// when the project has none.
    pub fn load(store: &Store) -> Result<Constitution, EngineError> {
        let path = store.constitution_path();
        let raw = if path.exists() {
            fs::read_to_string(&path).map_err(EngineError::Io)?
        } else {
            crate::core::assets::TEMPLATE_CONSTITUTION.to_string()
        };
        serde_yaml::from_str(&raw).map_err(|e| {
            EngineError::Schema(format!("invalid constitution at {}: {}", path.display(), e))
        })
    }

    /// Evaluate `(actor, action, resource)`.
    ///
    /// Order: role resolution, permission match, required-capability probes
    /// (cached), then priority rules in descending priority; first match
    /// wins. The default when permissions pass and no rule fires is allow.
    pub fn check(
        &self,
        store: &Store,
        actor: &str,
        action: &str,
        resource: &str,
    ) -> Result<Decision, EngineError> {
        let Some(role) = self.roles.get(actor) else {
            return Ok(Decision {
                allow: false,
                reason: format!("unknown role '{}'", actor),
                priority: None,
            });
        };

        if !role
            .permissions
            .iter()
            .any(|permission| permission_matches(permission, action))
        {
            return Ok(Decision {
                allow: false,
                reason: format!("no permission {}", action),
                priority: None,
            });
        }

        for capability_id in &role.requires {
            let Some(spec) = self.capabilities.get(capability_id) else {
                return Ok(Decision {
                    allow: false,
                    reason: format!("undeclared capability '{}'", capability_id),
                    priority: None,
                });
            };
            match capability::ensure(store, capability_id, spec)? {
                capability::CapabilityState::Available => {}
                capability::CapabilityState::Unavailable(reason) => {
                    return Ok(Decision {
                        allow: false,
                        reason,
                        priority: None,
                    });
                }
            }
        }

        let mut rules: Vec<&PriorityRule> = self.priorities.iter().collect();
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));
        for rule in rules {
            let action_hit = rule
                .actions
                .iter()
                .any(|matcher| permission_matches(matcher, action));
            let resource_hit = rule.resources.is_empty()
                || rule
                    .resources
                    .iter()
                    .any(|matcher| glob_matches(matcher, resource));
            if action_hit && resource_hit {
                let allow = rule.outcome == "allow";
                return Ok(Decision {
                    allow,
                    reason: if rule.description.is_empty() {
                        format!("priority rule {}", rule.priority)
                    } else {
                        rule.description.clone()
                    },
                    priority: Some(rule.priority),
                });
            }
        }

        Ok(Decision {
            allow: true,
            reason: format!("role '{}' permits {}", actor, action),
            priority: None,
        })
    }
}

/// Match a `verb:resource` permission pattern against an action string.
fn permission_matches(pattern: &str, action: &str) -> bool {
    let (pattern_verb, pattern_resource) = pattern.split_once(':').unwrap_or((pattern, "*"));
    let (action_verb, action_resource) = action.split_once(':').unwrap_or((action, ""));
    (pattern_verb == "*" || pattern_verb == action_verb)
        && (pattern_resource == "*" || pattern_resource == action_resource)
}

/// Trailing-`*` glob match for resource matchers.
fn glob_matches(pattern: &str, value: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    match pattern.strip_suffix('*') {
        Some(prefix) => value.starts_with(prefix),
        None => pattern == value,
    }
}

pub fn schema() -> serde_json::Value {
    serde_json::json!({
        "name": "constitution",
        "version": "1.0.0",
        "description": "YAML policy document: roles, permissions, capabilities, priority rules",
        "document": "AutoSnippet/constitution.yaml",
        "outcomes": ["allow", "deny"],
        "storage": []
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn doc() -> Constitution {
        serde_yaml::from_str(
            r#"
capabilities:
  always_ok:
    probe: "true"
    cache_ttl_secs: 60
roles:
  developer_admin:
    permissions: ["*:*"]
  developer_contributor:
    permissions: ["create:recipe", "promote:candidate"]
  visitor:
    permissions: []
priorities:
  - priority: 100
    description: "AI candidates need human review"
    actions: ["promote:candidate"]
    resources: ["candidate:ai/*"]
    outcome: deny
"#,
        )
        .expect("valid doc")
    }

    fn test_store() -> (tempfile::TempDir, Store) {
        let tmp = tempdir().expect("tempdir");
        let store = Store::open(tmp.path()).expect("store");
        (tmp, store)
    }

    #[test]
    fn test_permission_matching_with_wildcards() {
        assert!(permission_matches("*:*", "create:recipe"));
        assert!(permission_matches("create:*", "create:recipe"));
        assert!(permission_matches("*:recipe", "create:recipe"));
        assert!(permission_matches("create:recipe", "create:recipe"));
        assert!(!permission_matches("update:recipe", "create:recipe"));
        assert!(!permission_matches("create:candidate", "create:recipe"));
    }

    #[test]
    fn test_visitor_is_denied_writes() {
        let (_tmp, store) = test_store();
        let decision = doc()
            .check(&store, "visitor", "create:recipe", "recipe")
            .expect("check");
        assert!(!decision.allow);
        assert_eq!(decision.reason, "no permission create:recipe");
    }

    #[test]
    fn test_unknown_role_is_denied() {
        let (_tmp, store) = test_store();
        let decision = doc()
            .check(&store, "nobody", "create:recipe", "recipe")
            .expect("check");
        assert!(!decision.allow);
        assert!(decision.reason.contains("unknown role"));
    }

    #[test]
    fn test_admin_wildcard_allows() {
        let (_tmp, store) = test_store();
        let decision = doc()
            .check(&store, "developer_admin", "delete:recipe", "recipe:rcp-1")
            .expect("check");
        assert!(decision.allow);
    }

    #[test]
    fn test_priority_rule_denies_matching_resource() {
        let (_tmp, store) = test_store();
        let constitution = doc();
        let denied = constitution
            .check(
                &store,
                "developer_contributor",
                "promote:candidate",
                "candidate:ai/cnd-1",
            )
            .expect("check");
        assert!(!denied.allow);
        assert_eq!(denied.priority, Some(100));

        let allowed = constitution
            .check(
                &store,
                "developer_contributor",
                "promote:candidate",
                "candidate:human/cnd-2",
            )
            .expect("check");
        assert!(allowed.allow);
    }

    #[test]
    fn test_embedded_default_constitution_parses() {
        let constitution: Constitution =
            serde_yaml::from_str(crate::core::assets::TEMPLATE_CONSTITUTION)
                .expect("default document parses");
        assert!(constitution.roles.contains_key("visitor"));
        assert!(constitution.capabilities.contains_key("git_write"));
    }
}
