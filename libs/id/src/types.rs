//! Typed name and ID definitions for all reconciler resources.
//!
//! Names mirror what the cluster orchestrator calls things. Intent IDs are
//! ULID-based for sortability and uniqueness.

use sha2::{Digest, Sha256};

use crate::{define_id, define_name, IdError};

/// Maximum length of a DNS-1123 subdomain.
pub const MAX_NAME_LEN: usize = 253;

/// Maximum length of a capability label.
pub const MAX_LABEL_LEN: usize = 253;

// =============================================================================
// Validators
// =============================================================================

/// Validates a DNS-1123 subdomain: lowercase alphanumerics, `-` and `.`,
/// starting and ending with an alphanumeric.
fn validate_dns_subdomain(kind: &'static str, s: &str) -> Result<String, IdError> {
    validate_charset(kind, s, MAX_NAME_LEN, |c| {
        c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.'
    })?;
    Ok(s.to_string())
}

/// Validates a capability label. Labels compare case-insensitively, so the
/// canonical form is lowercase (`public-IP` and `public-ip` are the same).
fn validate_capability(kind: &'static str, s: &str) -> Result<String, IdError> {
    let lowered = s.to_ascii_lowercase();
    validate_charset(kind, &lowered, MAX_LABEL_LEN, |c| {
        c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '-' | '.' | '_' | '/')
    })?;
    Ok(lowered)
}

fn validate_charset(
    kind: &'static str,
    s: &str,
    max: usize,
    allowed: impl Fn(char) -> bool,
) -> Result<(), IdError> {
    if s.is_empty() {
        return Err(IdError::Empty { kind });
    }

    if s.len() > max {
        return Err(IdError::TooLong {
            kind,
            value: s.to_string(),
            max,
        });
    }

    if let Some(ch) = s.chars().find(|c| !allowed(*c)) {
        return Err(IdError::InvalidCharacter {
            kind,
            value: s.to_string(),
            ch,
        });
    }

    let alnum = |c: Option<char>| c.is_some_and(|c| c.is_ascii_alphanumeric());
    if !alnum(s.chars().next()) || !alnum(s.chars().last()) {
        return Err(IdError::InvalidBoundary {
            kind,
            value: s.to_string(),
        });
    }

    Ok(())
}

// =============================================================================
// Cluster Resources
// =============================================================================

define_name!(NodeName, "node name", validate_dns_subdomain);
define_name!(WorkloadName, "workload name", validate_dns_subdomain);
define_name!(VolumeName, "volume name", validate_dns_subdomain);

// =============================================================================
// Capabilities
// =============================================================================

define_name!(Capability, "capability label", validate_capability);

impl Capability {
    /// Label carried by nodes with a publicly routable address.
    pub const PUBLIC_IP: &'static str = "public-ip";

    /// Label carried by nodes allowed to run Cardano relays.
    pub const CARDANO_ELIGIBLE: &'static str = "cardano-eligible";

    /// The `public-ip` capability.
    #[must_use]
    pub fn public_ip() -> Self {
        Self(Self::PUBLIC_IP.to_string())
    }
}

// =============================================================================
// Orchestrator Intents
// =============================================================================

define_id!(IntentId, "int");

impl VolumeName {
    /// Default claim name for a workload's persistent volume.
    #[must_use]
    ///
    /// Names that would exceed [`MAX_NAME_LEN`] are shortened and suffixed
    /// with a digest of the full workload name, so distinct workloads never
    /// share a claim.
    pub fn claim_for(workload: &WorkloadName) -> Self {
        let name = format!("data-{workload}");
        if name.len() <= MAX_NAME_LEN {
            return Self(name);
        }

        let digest = Sha256::digest(workload.as_str().as_bytes());
        let suffix = hex::encode(&digest[..8]);
        let mut prefix = name;
        prefix.truncate(MAX_NAME_LEN - suffix.len() - 1);
        while prefix.ends_with(['-', '.']) {
            prefix.pop();
        }
        Self(format!("{prefix}-{suffix}"))
    }
}

// =============================================================================
// Tests
// =============================================================================
