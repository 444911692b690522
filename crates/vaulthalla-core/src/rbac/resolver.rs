//! The per-request bit resolution algorithm.
//!
//! Given the OR of a subject's role bitmasks and the overrides targeting
//! it, a single permission bit resolves by precedence:
//!
//! user-level deny > user-level allow > group-level deny > group-level allow
//!
//! The highest-precedence matching override wins; absent any, the bit
//! keeps its base value. The result is invariant to the load order of
//! overrides within one precedence level (deny wins ties by construction).

use regex::Regex;

use crate::error::{Result, VaultError};
use crate::model::{AdminPermission, OverrideEffect, PermissionOverride, VaultPermission};

/// An action submitted for authorization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Admin(AdminPermission),
    Vault(VaultPermission),
}

/// Whether an override reached the request through the user itself or
/// through one of its groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverrideScope {
    User,
    Group,
}

/// Resolve one vault-permission bit.
///
/// `overrides` carries every override collected for the subject (user and
/// group level); entries whose `path_pattern` does not fully match the
/// canonical vault-relative `path` are ignored, as are entries for other
/// bit positions.
pub fn resolve_vault_bit(
    base: u16,
    bit: u8,
    overrides: &[(OverrideScope, PermissionOverride)],
    path: &str,
) -> Result<bool> {
    if bit >= VaultPermission::COUNT {
        return Err(VaultError::InvalidArgument(format!(
            "vault permission bit out of range: {bit}"
        )));
    }

    let mut user_deny = false;
    let mut user_allow = false;
    let mut group_deny = false;
    let mut group_allow = false;

    for (scope, ov) in overrides {
        if ov.bit_position != bit {
            continue;
        }
        if !pattern_matches(ov.path_pattern.as_deref(), path)? {
            continue;
        }
        match (scope, ov.effect) {
            (OverrideScope::User, OverrideEffect::Deny) => user_deny = true,
            (OverrideScope::User, OverrideEffect::Allow) => user_allow = true,
            (OverrideScope::Group, OverrideEffect::Deny) => group_deny = true,
            (OverrideScope::Group, OverrideEffect::Allow) => group_allow = true,
        }
    }

    if user_deny {
        return Ok(false);
    }
    if user_allow {
        return Ok(true);
    }
    if group_deny {
        return Ok(false);
    }
    if group_allow {
        return Ok(true);
    }
    Ok(base & (1 << bit) != 0)
}

/// Full-path match of an override pattern against the canonical
/// vault-relative path. An absent or empty pattern applies vault-wide.
fn pattern_matches(pattern: Option<&str>, path: &str) -> Result<bool> {
    let Some(pattern) = pattern else {
        return Ok(true);
    };
    if pattern.is_empty() {
        return Ok(true);
    }
    let re = Regex::new(&format!("^(?:{pattern})$"))?;
    Ok(re.is_match(path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{OverrideEffect, Subject, SubjectType};

    fn ov(
        scope: OverrideScope,
        bit: u8,
        effect: OverrideEffect,
        pattern: Option<&str>,
    ) -> (OverrideScope, PermissionOverride) {
        let subject_type = match scope {
            OverrideScope::User => SubjectType::User,
            OverrideScope::Group => SubjectType::Group,
        };
        (
            scope,
            PermissionOverride {
                id: 0,
                vault_id: 1,
                subject: Subject {
                    subject_type,
                    subject_id: 1,
                },
                bit_position: bit,
                effect,
                path_pattern: pattern.map(String::from),
            },
        )
    }

    const DOWNLOAD: u8 = 9;

    #[test]
    fn test_base_bit_without_overrides() {
        assert!(resolve_vault_bit(1 << DOWNLOAD, DOWNLOAD, &[], "/f").unwrap());
        assert!(!resolve_vault_bit(0, DOWNLOAD, &[], "/f").unwrap());
    }

    #[test]
    fn test_scoped_allow_beats_group_deny_only_on_matching_paths() {
        // Base: download granted. Group-level deny vault-wide,
        // user-level allow scoped to /public/.*.
        let overrides = vec![
            ov(OverrideScope::Group, DOWNLOAD, OverrideEffect::Deny, None),
            ov(
                OverrideScope::User,
                DOWNLOAD,
                OverrideEffect::Allow,
                Some("/public/.*"),
            ),
        ];

        assert!(resolve_vault_bit(1 << DOWNLOAD, DOWNLOAD, &overrides, "/public/file").unwrap());
        assert!(!resolve_vault_bit(1 << DOWNLOAD, DOWNLOAD, &overrides, "/private/file").unwrap());
    }

    #[test]
    fn test_user_deny_beats_user_allow() {
        let overrides = vec![
            ov(OverrideScope::User, DOWNLOAD, OverrideEffect::Allow, None),
            ov(OverrideScope::User, DOWNLOAD, OverrideEffect::Deny, None),
        ];
        assert!(!resolve_vault_bit(1 << DOWNLOAD, DOWNLOAD, &overrides, "/f").unwrap());
    }

    #[test]
    fn test_group_allow_grants_missing_base_bit() {
        let overrides = vec![ov(OverrideScope::Group, DOWNLOAD, OverrideEffect::Allow, None)];
        assert!(resolve_vault_bit(0, DOWNLOAD, &overrides, "/f").unwrap());
    }

    #[test]
    fn test_insertion_order_within_level_is_irrelevant() {
        let a = ov(OverrideScope::Group, DOWNLOAD, OverrideEffect::Deny, None);
        let b = ov(OverrideScope::Group, DOWNLOAD, OverrideEffect::Allow, None);

        let forward = resolve_vault_bit(0, DOWNLOAD, &[a.clone(), b.clone()], "/f").unwrap();
        let backward = resolve_vault_bit(0, DOWNLOAD, &[b, a], "/f").unwrap();
        assert_eq!(forward, backward);
        assert!(!forward, "deny wins ties within a precedence level");
    }

    #[test]
    fn test_other_bits_are_ignored() {
        let overrides = vec![ov(OverrideScope::User, 8, OverrideEffect::Deny, None)];
        assert!(resolve_vault_bit(1 << DOWNLOAD, DOWNLOAD, &overrides, "/f").unwrap());
    }

    #[test]
    fn test_empty_pattern_is_vault_wide() {
        let overrides = vec![ov(OverrideScope::User, DOWNLOAD, OverrideEffect::Deny, Some(""))];
        assert!(!resolve_vault_bit(1 << DOWNLOAD, DOWNLOAD, &overrides, "/anything").unwrap());
    }

    #[test]
    fn test_pattern_is_full_match_not_substring() {
        let overrides = vec![ov(
            OverrideScope::User,
            DOWNLOAD,
            OverrideEffect::Deny,
            Some("/tmp"),
        )];
        // /tmp matches exactly; /tmp/file does not (full match).
        assert!(!resolve_vault_bit(1 << DOWNLOAD, DOWNLOAD, &overrides, "/tmp").unwrap());
        assert!(resolve_vault_bit(1 << DOWNLOAD, DOWNLOAD, &overrides, "/tmp/file").unwrap());
    }

    #[test]
    fn test_malformed_pattern_is_invalid_argument() {
        let overrides = vec![ov(
            OverrideScope::User,
            DOWNLOAD,
            OverrideEffect::Deny,
            Some("([unclosed"),
        )];
        let err = resolve_vault_bit(0, DOWNLOAD, &overrides, "/f").unwrap_err();
        assert!(matches!(err, VaultError::InvalidArgument(_)));
    }

    #[test]
    fn test_out_of_range_bit_rejected() {
        let err = resolve_vault_bit(0, 14, &[], "/f").unwrap_err();
        assert!(matches!(err, VaultError::InvalidArgument(_)));
    }
}
