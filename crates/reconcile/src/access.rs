//! Roles, capabilities and the acting user.
//!
//! Every core operation takes an explicit [`ActingUser`] and checks it once,
//! at its boundary, with [`require_role`]. There is no ambient session.

use std::{fmt, str::FromStr};

use pharmatrace_store::VerifierScope;
use serde::{Deserialize, Serialize};

use crate::error::{SupplyError, SupplyResult};

/// Portal roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Portal administrator.
    Admin,
    /// Registers new drugs.
    Manufacturer,
    /// Raw material or finished goods supplier.
    Supplier,
    /// Repackages drugs.
    Repackager,
    /// First-tier distributor.
    DistributorPrimary,
    /// Second-tier distributor.
    DistributorSecondary,
    /// Dispensing hospital.
    Hospital,
    /// End patient; may only look up and verify.
    Patient,
    /// Regulator; may record status changes such as recalls.
    Regulator,
}

impl Role {
    /// Every role.
    pub const ALL: [Role; 9] = [
        Role::Admin,
        Role::Manufacturer,
        Role::Supplier,
        Role::Repackager,
        Role::DistributorPrimary,
        Role::DistributorSecondary,
        Role::Hospital,
        Role::Patient,
        Role::Regulator,
    ];

    /// The role's wire name (`distributor_primary`, ...).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Manufacturer => "manufacturer",
            Self::Supplier => "supplier",
            Self::Repackager => "repackager",
            Self::DistributorPrimary => "distributor_primary",
            Self::DistributorSecondary => "distributor_secondary",
            Self::Hospital => "hospital",
            Self::Patient => "patient",
            Self::Regulator => "regulator",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = SupplyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|role| role.as_str() == s)
            .ok_or_else(|| SupplyError::validation(format!("unknown role {s:?}")))
    }
}

/// Operations guarded by role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Register a drug on the ledger and in the store.
    AddDrug,
    /// Record a custody or status change.
    UpdateStatus,
    /// Read a single drug.
    ViewDrug,
    /// Run a verification.
    Verify,
    /// List drugs.
    ListDrugs,
    /// Flag or unflag drugs manually.
    ManageFlags,
    /// Read reports and the audit log.
    ViewReports,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::AddDrug => "add drugs",
            Self::UpdateStatus => "update drug status",
            Self::ViewDrug => "view drugs",
            Self::Verify => "verify drugs",
            Self::ListDrugs => "list drugs",
            Self::ManageFlags => "manage flags",
            Self::ViewReports => "view reports",
        };
        f.write_str(name)
    }
}

/// Returns `true` if `role` grants `required`.
pub fn has_capability(role: Role, required: Capability) -> bool {
    use Role::*;
    match required {
        Capability::AddDrug => role == Manufacturer,
        Capability::UpdateStatus => matches!(
            role,
            DistributorPrimary | DistributorSecondary | Supplier | Hospital | Repackager | Regulator
        ),
        Capability::ViewDrug | Capability::Verify => true,
        Capability::ListDrugs => matches!(role, Admin | Manufacturer),
        Capability::ManageFlags | Capability::ViewReports => role == Admin,
    }
}

/// The authenticated user an operation runs on behalf of.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bon::Builder)]
pub struct ActingUser {
    /// Stable user identifier.
    #[builder(into)]
    pub id: String,
    /// Display name, recorded as owner and manufacturer.
    #[builder(into)]
    pub name: String,
    /// The user's role.
    pub role: Role,
    /// Ledger account used to sign this user's transactions.
    #[builder(into)]
    pub wallet_address: Option<String>,
}

impl ActingUser {
    /// Whether the user is an administrator.
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    /// The prefix applied to this user's verification audit tags.
    pub fn verifier_scope(&self) -> VerifierScope {
        match self.role {
            Role::Admin => VerifierScope::Admin,
            Role::Patient => VerifierScope::Patient,
            _ => VerifierScope::Other,
        }
    }

    /// The user's wallet, if set and non-blank.
    pub fn wallet(&self) -> Option<&str> {
        self.wallet_address.as_deref().map(str::trim).filter(|w| !w.is_empty())
    }
}

/// Checks that `user` holds `required`.
///
/// # Errors
///
/// [`SupplyError::Forbidden`] naming the role and the capability.
pub fn require_role(user: &ActingUser, required: Capability) -> SupplyResult<()> {
    if has_capability(user.role, required) {
        return Ok(());
    }
    tracing::debug!(user = %user.id, role = %user.role, capability = %required, "access denied");
    Err(SupplyError::forbidden(format!("role {} may not {required}", user.role)))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn user(role: Role) -> ActingUser {
        ActingUser::builder().id("u1").name("User One").role(role).build()
    }

    #[rstest]
    #[case(Role::Manufacturer, Capability::AddDrug, true)]
    #[case(Role::Admin, Capability::AddDrug, false)]
    #[case(Role::Regulator, Capability::UpdateStatus, true)]
    #[case(Role::Repackager, Capability::UpdateStatus, true)]
    #[case(Role::Manufacturer, Capability::UpdateStatus, false)]
    #[case(Role::Patient, Capability::UpdateStatus, false)]
    #[case(Role::Patient, Capability::Verify, true)]
    #[case(Role::Hospital, Capability::ViewDrug, true)]
    #[case(Role::Manufacturer, Capability::ListDrugs, true)]
    #[case(Role::Hospital, Capability::ListDrugs, false)]
    #[case(Role::Admin, Capability::ManageFlags, true)]
    #[case(Role::Regulator, Capability::ManageFlags, false)]
    #[case(Role::Admin, Capability::ViewReports, true)]
    fn test_capabilities(#[case] role: Role, #[case] capability: Capability, #[case] allowed: bool) {
        assert_eq!(has_capability(role, capability), allowed);
        assert_eq!(require_role(&user(role), capability).is_ok(), allowed);
    }

    #[test]
    fn test_forbidden_error_names_role() {
        let err = require_role(&user(Role::Patient), Capability::AddDrug).unwrap_err();
        assert_eq!(err.http_status(), 403);
        assert!(err.to_string().contains("patient"));
    }

    #[test]
    fn test_role_round_trips_through_wire_name() {
        for role in Role::ALL {
            assert_eq!(role.as_str().parse::<Role>().unwrap(), role);
        }
        assert!("superuser".parse::<Role>().is_err());
    }

    #[test]
    fn test_blank_wallet_is_ignored() {
        let mut u = user(Role::Manufacturer);
        u.wallet_address = Some("  ".into());
        assert_eq!(u.wallet(), None);
        u.wallet_address = Some("0xabc".into());
        assert_eq!(u.wallet(), Some("0xabc"));
    }
}
