// src/server/identity.rs

//! Extraction of the caller's identity from the trusted headers an
//! authenticating reverse proxy (Gafaelfawr) sets in front of this service.
//!
//! The identity service itself (user records: name, uid, groups, token) is
//! out of scope for this controller; by the time a request reaches us, the
//! proxy has already authenticated the caller and attached their identity as
//! headers. We trust those headers completely, the same way this codebase's
//! own HTTP layer trusts its upstream reverse proxy for TLS termination.

use crate::config::{Config, QuotaConfig};
use crate::core::errors::ControllerError;
use crate::core::lab::{UserGroup, UserIdentity, UserQuota};
use axum::http::HeaderMap;

const USER_HEADER: &str = "x-auth-request-user";
const UID_HEADER: &str = "x-auth-request-uid";
const GROUPS_HEADER: &str = "x-auth-request-groups";

/// A single `name:gid` pair as carried in the groups header.
fn parse_group(raw: &str) -> Option<UserGroup> {
    let (name, gid) = raw.split_once(':')?;
    Some(UserGroup {
        name: name.to_string(),
        gid: gid.parse().ok()?,
    })
}

/// The caller's identity plus whether they belong to a configured admin
/// group, entitling them to act on another user's resources.
pub struct Caller {
    pub identity: UserIdentity,
    pub is_admin: bool,
}

/// Parses the proxy-supplied headers into a [`Caller`], resolving quota from
/// configuration by the most generous matching group override.
///
/// `Forbidden` is returned rather than `Validation`: a request missing these
/// headers has bypassed (or isn't behind) the authenticating proxy, which is
/// an authorization failure from this service's point of view.
pub fn caller_from_headers(headers: &HeaderMap, config: &Config) -> Result<Caller, ControllerError> {
    let username = headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ControllerError::Forbidden(format!("missing {USER_HEADER} header")))?
        .to_string();

    let uid: u32 = headers
        .get(UID_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| ControllerError::Forbidden(format!("missing or invalid {UID_HEADER} header")))?;

    let groups: Vec<UserGroup> = headers
        .get(GROUPS_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .split(',')
        .filter_map(|raw| parse_group(raw.trim()))
        .collect();

    let primary_gid = groups.first().map(|g| g.gid).unwrap_or(uid);
    let is_admin = groups
        .iter()
        .any(|g| config.identity.admin_groups.iter().any(|admin| admin == &g.name));
    let quota = resolve_quota(&groups, config);

    Ok(Caller {
        identity: UserIdentity {
            username,
            uid,
            primary_gid,
            groups,
            quota,
        },
        is_admin,
    })
}

/// The most generous quota among the caller's matching group overrides,
/// falling back to `identity.default_quota` when none match.
fn resolve_quota(groups: &[UserGroup], config: &Config) -> UserQuota {
    let mut best: QuotaConfig = config.identity.default_quota;
    for group in groups {
        if let Some(override_quota) = config.identity.group_quotas.get(&group.name) {
            if override_quota.memory_bytes > best.memory_bytes {
                best = *override_quota;
            }
        }
    }
    UserQuota {
        cpu: best.cpu,
        memory_bytes: best.memory_bytes,
    }
}

/// Enforces that `caller` may act on `target_user`'s resources: either they
/// are the same user, or the caller belongs to a configured admin group.
pub fn authorize_for_user(caller: &Caller, target_user: &str) -> Result<(), ControllerError> {
    if caller.identity.username == target_user || caller.is_admin {
        Ok(())
    } else {
        Err(ControllerError::Forbidden(format!(
            "'{}' may not act on behalf of '{}'",
            caller.identity.username, target_user
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_well_formed_group_pair() {
        let group = parse_group("rubin-users:1200").unwrap();
        assert_eq!(group.name, "rubin-users");
        assert_eq!(group.gid, 1200);
    }

    #[test]
    fn rejects_a_group_pair_missing_a_gid() {
        assert!(parse_group("rubin-users").is_none());
    }
}
