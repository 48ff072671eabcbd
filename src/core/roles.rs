//! Access-control role identifiers.
//!
//! Roles are referenced by name in plans and hashed the way OpenZeppelin
//! `AccessControl` does: `keccak256(name)`, except the default admin role
//! which is the zero hash.

use alloy_primitives::{keccak256, B256};

pub const DEFAULT_ADMIN_ROLE: &str = "DEFAULT_ADMIN_ROLE";

/// Roles used by the reference deployment plans
pub const KNOWN_ROLES: &[&str] = &[
    DEFAULT_ADMIN_ROLE,
    "FUNDER_ROLE",
    "MINTER_ROLE",
    "POOL_MANAGER_ROLE",
    "HARVEST_ROLE",
    "PAUSE_ROLE",
    "RECOVERY_ROLE",
    "GOVERNOR_ROLE",
];

/// 32-byte role identifier, 0x-prefixed hex.
///
/// A name that is already a 0x-prefixed 32-byte hex string is passed
/// through unchanged.
pub fn role_hash(name: &str) -> String {
    if is_bytes32(name) {
        return name.to_ascii_lowercase();
    }
    let hash = if name == DEFAULT_ADMIN_ROLE {
        B256::ZERO
    } else {
        keccak256(name.as_bytes())
    };
    format!("0x{}", hex::encode(hash.as_slice()))
}

pub fn is_known(name: &str) -> bool {
    KNOWN_ROLES.contains(&name)
}

fn is_bytes32(value: &str) -> bool {
    value
        .strip_prefix("0x")
        .map(|digits| digits.len() == 64 && digits.chars().all(|c| c.is_ascii_hexdigit()))
        .unwrap_or(false)
}
