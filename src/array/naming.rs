//! Naming and Key Derivation
//!
//! Masking objects are found again by name, never by a remembered handle,
//! so every name here is a pure function of (host, tier, protocol). Two
//! calls with the same inputs always agree, across processes and restarts.

use crate::domain::classes::SYSTEM_NAME_PREFIX;
use crate::domain::model::InstanceName;
use crate::domain::ports::Protocol;
use sha2::{Digest, Sha256};

/// Longest object name the array accepts
pub const MAX_NAME_LEN: usize = 64;

/// Longest host component kept verbatim
const MAX_HOST_LEN: usize = 16;

/// Hex digits of the digest appended to shortened names
const HASH_LEN: usize = 8;

// =============================================================================
// Components
// =============================================================================

/// Short host name: the part before the first `.`, restricted to
/// `[A-Za-z0-9_-]`. Long names keep 8 characters plus a digest of the full
/// host so distinct hosts stay distinct.
pub fn short_host_name(host: &str) -> String {
    let first = host.split('.').next().unwrap_or_default();
    let sanitized: String = first
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect();

    if sanitized.len() > MAX_HOST_LEN {
        format!("{}{}", &sanitized[..HASH_LEN], digest_prefix(host))
    } else if sanitized.is_empty() {
        digest_prefix(host)
    } else {
        sanitized
    }
}

/// Tier component: the FAST policy when configured, otherwise the pool
pub fn tier_name(pool: &str, fast_policy: Option<&str>) -> String {
    match fast_policy {
        Some(policy) => format!("{}-FP", policy),
        None => pool.to_string(),
    }
}

// =============================================================================
// Masking Object Names
// =============================================================================

/// `OS-{host}-{I|F}-IG`
pub fn initiator_group_name(host: &str, protocol: Protocol) -> String {
    cap_length(format!(
        "OS-{}-{}-IG",
        short_host_name(host),
        protocol.tag()
    ))
}

/// `OS-{host}-{tier}-{I|F}-SG`
pub fn storage_group_name(host: &str, tier: &str, protocol: Protocol) -> String {
    cap_length(format!(
        "OS-{}-{}-{}-SG",
        short_host_name(host),
        tier,
        protocol.tag()
    ))
}

/// `OS-{host}-{tier}-{I|F}-MV`
pub fn masking_view_name(host: &str, tier: &str, protocol: Protocol) -> String {
    cap_length(format!(
        "OS-{}-{}-{}-MV",
        short_host_name(host),
        tier,
        protocol.tag()
    ))
}

/// `OS_default_{policy}_SG`, one per (array, FAST policy)
pub fn default_storage_group_name(policy: &str) -> String {
    cap_length(format!("OS_default_{}_SG", policy))
}

/// The three masking names derived for one host and tier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaskingNames {
    pub initiator_group: String,
    pub storage_group: String,
    pub masking_view: String,
}

impl MaskingNames {
    pub fn derive(host: &str, tier: &str, protocol: Protocol) -> Self {
        Self {
            initiator_group: initiator_group_name(host, protocol),
            storage_group: storage_group_name(host, tier, protocol),
            masking_view: masking_view_name(host, tier, protocol),
        }
    }
}

// =============================================================================
// Key Bindings
// =============================================================================

/// Storage system name of an array
pub fn system_name(array: &str) -> String {
    format!("{}{}", SYSTEM_NAME_PREFIX, array)
}

/// Key binding of a named group or view on an array
pub fn group_key(array: &str, class_name: &str, name: &str) -> InstanceName {
    InstanceName::new(class_name)
        .with_key("InstanceID", format!("{}+{}", system_name(array), name))
}

/// Key binding of a device on an array
pub fn device_key(array: &str, class_name: &str, device_id: &str) -> InstanceName {
    InstanceName::new(class_name)
        .with_key("CreationClassName", class_name)
        .with_key("DeviceID", device_id)
        .with_key("SystemCreationClassName", crate::domain::classes::class::STORAGE_SYSTEM)
        .with_key("SystemName", system_name(array))
}

// =============================================================================
// Helpers
// =============================================================================

fn digest_prefix(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    digest
        .iter()
        .take(HASH_LEN / 2)
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Cap a name at [`MAX_NAME_LEN`], replacing the tail with a digest of the
/// whole name.
fn cap_length(name: String) -> String {
    if name.len() <= MAX_NAME_LEN {
        return name;
    }
    let keep = MAX_NAME_LEN - HASH_LEN - 1;
    // Names are ASCII apart from operator-provided tiers; back off to a char boundary.
    let mut cut = keep;
    while !name.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}-{}", &name[..cut], digest_prefix(&name))
}
