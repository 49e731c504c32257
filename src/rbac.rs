//! Role-based access control for the signed control plane.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Roles a join certificate can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Operator,
    Admin,
    Anchor,
    Client,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Operator => "operator",
            Role::Admin => "admin",
            Role::Anchor => "anchor",
            Role::Client => "client",
        }
    }

    pub fn parse(s: &str) -> Option<Role> {
        match s {
            "operator" => Some(Role::Operator),
            "admin" => Some(Role::Admin),
            "anchor" => Some(Role::Anchor),
            "client" => Some(Role::Client),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Control message kinds subject to RBAC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ControlKind {
    PolicyUpdate,
    Revoke,
    Shutdown,
    CrlPush,
    Ping,
}

impl ControlKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlKind::PolicyUpdate => "PolicyUpdate",
            ControlKind::Revoke => "Revoke",
            ControlKind::Shutdown => "Shutdown",
            ControlKind::CrlPush => "CrlPush",
            ControlKind::Ping => "Ping",
        }
    }
}

/// Control kinds a role may issue.
pub fn allowed_kinds(role: Role) -> &'static [ControlKind] {
    match role {
        Role::Operator => &[ControlKind::PolicyUpdate],
        Role::Admin => &[
            ControlKind::PolicyUpdate,
            ControlKind::Revoke,
            ControlKind::Shutdown,
        ],
        Role::Anchor => &[ControlKind::CrlPush, ControlKind::Ping],
        Role::Client => &[],
    }
}

/// Scope patterns a role may operate within.
pub fn allowed_scopes(role: Role) -> &'static [&'static str] {
    match role {
        Role::Operator => &["policy:*"],
        Role::Admin => &["*"],
        Role::Anchor => &["mesh:*"],
        Role::Client => &[],
    }
}

/// Match a scope against a pattern: `*`, `prefix:*`, or a literal.
pub fn scope_matches(pattern: &str, scope: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        return scope.starts_with(prefix);
    }
    pattern == scope
}

/// True iff any of the certificate's roles authorizes `kind` over `scope`.
pub fn authorizes(roles: &[Role], kind: ControlKind, scope: &str) -> bool {
    roles.iter().any(|role| {
        allowed_kinds(*role).contains(&kind)
            && allowed_scopes(*role)
                .iter()
                .any(|pattern| scope_matches(pattern, scope))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admin_can_shutdown_anywhere() {
        assert!(authorizes(&[Role::Admin], ControlKind::Shutdown, "mesh:all"));
        assert!(authorizes(&[Role::Admin], ControlKind::Revoke, "node:abc"));
    }

    #[test]
    fn operator_limited_to_policy_scope() {
        assert!(authorizes(
            &[Role::Operator],
            ControlKind::PolicyUpdate,
            "policy:routing"
        ));
        assert!(!authorizes(
            &[Role::Operator],
            ControlKind::PolicyUpdate,
            "mesh:all"
        ));
        assert!(!authorizes(
            &[Role::Operator],
            ControlKind::Shutdown,
            "policy:routing"
        ));
    }

    #[test]
    fn client_has_no_control_capability() {
        assert!(!authorizes(&[Role::Client], ControlKind::Ping, "mesh:all"));
        assert!(!authorizes(&[Role::Client], ControlKind::Shutdown, "*"));
    }

    #[test]
    fn anchor_relays_crl() {
        assert!(authorizes(&[Role::Anchor], ControlKind::CrlPush, "mesh:all"));
        assert!(!authorizes(&[Role::Anchor], ControlKind::Revoke, "mesh:all"));
    }

    #[test]
    fn multiple_roles_union() {
        let roles = [Role::Client, Role::Operator];
        assert!(authorizes(&roles, ControlKind::PolicyUpdate, "policy:x"));
    }

    #[test]
    fn scope_grammar() {
        assert!(scope_matches("*", "anything"));
        assert!(scope_matches("mesh:*", "mesh:all"));
        assert!(!scope_matches("mesh:*", "policy:x"));
        assert!(scope_matches("node:abc", "node:abc"));
        assert!(!scope_matches("node:abc", "node:abd"));
    }

    #[test]
    fn role_serde_is_lowercase() {
        assert_eq!(serde_json::to_string(&Role::Admin).unwrap(), "\"admin\"");
        let role: Role = serde_json::from_str("\"anchor\"").unwrap();
        assert_eq!(role, Role::Anchor);
    }
}
