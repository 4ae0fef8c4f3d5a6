//! Tenant context resolution
//!
//! A tenant is the `(org, project?, user)` tuple that scopes persistent state
//! and billing. Contexts are per-request values: resolved from a validated
//! identity plus optional connect parameters, never stored.

use std::path::{Path, PathBuf};

use super::identity::IdentityClaims;
use crate::types::{GatewayError, Result};

/// Reason string for a membership rejection
pub const TENANT_ORG_NOT_MEMBER: &str = "tenant_org_not_member";

/// Scope for state paths and billing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantContext {
    pub org_id: String,
    pub project_id: Option<String>,
    pub user_id: String,
    pub user_name: Option<String>,
    pub env: Option<String>,
}

/// Connect parameters that may pin the tenant explicitly
#[derive(Debug, Clone, Default)]
pub struct TenantParams {
    pub org_id: Option<String>,
    pub project_id: Option<String>,
    pub env: Option<String>,
}

/// Pick the effective org for an identity.
///
/// Priority: explicit connect parameter, then the provider's currently
/// selected org, then the first known org. `None` means personal mode.
pub fn resolve_org_id(params: &TenantParams, identity: &IdentityClaims) -> Option<String> {
    params
        .org_id
        .clone()
        .or_else(|| identity.current_org_id.clone())
        .or_else(|| identity.org_ids.first().cloned())
}

/// Build a tenant context for a validated identity, or `None` in personal mode
pub fn resolve_tenant(params: &TenantParams, identity: &IdentityClaims) -> Option<TenantContext> {
    let org_id = resolve_org_id(params, identity)?;
    Some(TenantContext {
        org_id,
        project_id: params.project_id.clone(),
        user_id: identity.user_id.clone(),
        user_name: identity.display_name.clone(),
        env: params.env.clone(),
    })
}

/// Reject tenants whose org the identity does not belong to
pub fn validate_tenant_access(tenant: &TenantContext, identity: &IdentityClaims) -> Result<()> {
    if identity.is_org_member(&tenant.org_id) {
        Ok(())
    } else {
        Err(GatewayError::auth(TENANT_ORG_NOT_MEMBER))
    }
}

/// Directory scoping a tenant's persistent state
pub fn tenant_state_dir(base: &Path, tenant: &TenantContext) -> PathBuf {
    let mut dir = base.join("tenants").join(sanitize_slug(&tenant.org_id));
    if let Some(ref project) = tenant.project_id {
        dir = dir.join(sanitize_slug(project));
    }
    dir
}

const SLUG_MAX_LEN: usize = 128;

/// Make an identifier safe for use as a path segment.
///
/// Values already matching `^[A-Za-z0-9][A-Za-z0-9._-]{0,127}$` pass through
/// untouched; anything else is percent-escaped with `_` as the escape marker.
/// Sanitation is idempotent: escaped output always satisfies the pattern.
pub fn sanitize_slug(raw: &str) -> String {
    if is_valid_slug(raw) {
        return raw.to_string();
    }

    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'.' | b'-' => out.push(byte as char),
            _ => out.push_str(&format!("_{:02x}", byte)),
        }
    }
    if !out.chars().next().is_some_and(|c| c.is_ascii_alphanumeric()) {
        out.insert(0, 'x');
    }
    out.truncate(SLUG_MAX_LEN);
    out
}

fn is_valid_slug(s: &str) -> bool {
    if s.is_empty() || s.len() > SLUG_MAX_LEN {
        return false;
    }
    let mut chars = s.chars();
    let first = chars.next().unwrap();
    if !first.is_ascii_alphanumeric() {
        return false;
    }
    chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn identity(org_ids: &[&str], current: Option<&str>) -> IdentityClaims {
        IdentityClaims {
            user_id: "user-1".to_string(),
            email: None,
            display_name: Some("Ada".to_string()),
            owner: "acme/ada".to_string(),
            org_ids: org_ids.iter().map(|s| s.to_string()).collect(),
            roles: vec![],
            current_org_id: current.map(String::from),
            raw: Map::new(),
        }
    }

    #[test]
    fn test_org_priority() {
        let id = identity(&["acme", "labs"], Some("labs"));

        let explicit = TenantParams {
            org_id: Some("acme".into()),
            ..Default::default()
        };
        assert_eq!(resolve_org_id(&explicit, &id).as_deref(), Some("acme"));

        let current = TenantParams::default();
        assert_eq!(resolve_org_id(&current, &id).as_deref(), Some("labs"));

        let first = identity(&["acme", "labs"], None);
        assert_eq!(
            resolve_org_id(&TenantParams::default(), &first).as_deref(),
            Some("acme")
        );
    }

    #[test]
    fn test_personal_mode_when_no_org() {
        let id = identity(&[], None);
        assert_eq!(resolve_tenant(&TenantParams::default(), &id), None);
    }

    #[test]
    fn test_membership_enforced() {
        let id = identity(&["acme"], None);
        let member = TenantContext {
            org_id: "acme".into(),
            project_id: None,
            user_id: "user-1".into(),
            user_name: None,
            env: None,
        };
        assert!(validate_tenant_access(&member, &id).is_ok());

        let outsider = TenantContext {
            org_id: "evil".into(),
            ..member
        };
        let err = validate_tenant_access(&outsider, &id).unwrap_err();
        assert!(err.to_string().contains(TENANT_ORG_NOT_MEMBER));
    }

    #[test]
    fn test_state_dir_layout() {
        let tenant = TenantContext {
            org_id: "acme".into(),
            project_id: Some("web app".into()),
            user_id: "user-1".into(),
            user_name: None,
            env: None,
        };
        let dir = tenant_state_dir(Path::new("/var/lib/gatehouse"), &tenant);
        assert_eq!(
            dir,
            PathBuf::from("/var/lib/gatehouse/tenants/acme/web_20app")
        );
    }

    #[test]
    fn test_sanitize_passthrough() {
        assert_eq!(sanitize_slug("acme-corp.v2"), "acme-corp.v2");
        assert_eq!(sanitize_slug("a"), "a");
    }

    #[test]
    fn test_sanitize_escapes() {
        assert_eq!(sanitize_slug("web app"), "web_20app");
        assert_eq!(sanitize_slug("a/b"), "a_2fb");
        // Leading non-alphanumeric gets an anchor so the result stays valid
        assert_eq!(sanitize_slug("_private"), "x_5fprivate");
    }

    #[test]
    fn test_sanitize_idempotent() {
        for raw in ["acme", "web app", "_private", "a/b/c", "é-org", ""] {
            let once = sanitize_slug(raw);
            assert_eq!(sanitize_slug(&once), once, "not idempotent for {:?}", raw);
        }
    }
}
