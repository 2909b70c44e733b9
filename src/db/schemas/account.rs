//! Account Schema
//!
//! Application-level identity for a provider account. The id is the
//! provider-issued account id; `normalized_email` is unique across all
//! accounts, enforced through the email claim ledger.

use serde::{Deserialize, Serialize};

use super::metadata::Metadata;

/// Which portal an account belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Account that generates linking codes and receives assignments
    Dependent,
    /// Account that redeems linking codes and assigns activities
    Manager,
}

/// Account lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Active,
    PendingVerification,
    Disabled,
}

/// How the provider identity authenticates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignInMethod {
    Password,
    Federated,
}

/// Profile fields owned by the account holder
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub age: Option<u16>,

    /// Manager-only: clinical specialty
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub specialty: Option<String>,

    /// Manager-only: professional license number
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub professional_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bio: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo_url: Option<String>,
}

impl ProfileFields {
    /// Fill in fields this profile lacks from `other`.
    ///
    /// Existing values are never overwritten. Returns true if anything changed.
    pub fn merge_from(&mut self, other: &ProfileFields) -> bool {
        fn fill<T: Clone>(slot: &mut Option<T>, value: &Option<T>) -> bool {
            if slot.is_none() && value.is_some() {
                *slot = value.clone();
                return true;
            }
            false
        }

        let mut changed = false;
        changed |= fill(&mut self.name, &other.name);
        changed |= fill(&mut self.phone, &other.phone);
        changed |= fill(&mut self.age, &other.age);
        changed |= fill(&mut self.specialty, &other.specialty);
        changed |= fill(&mut self.professional_id, &other.professional_id);
        changed |= fill(&mut self.bio, &other.bio);
        changed |= fill(&mut self.photo_url, &other.photo_url);
        changed
    }

    /// Check the fields required for `role`
    pub fn validate_for(&self, role: Role) -> Result<(), String> {
        if let Some(age) = self.age {
            if !(1..=120).contains(&age) {
                return Err("age must be between 1 and 120".into());
            }
        }

        let name_len = trimmed_len(&self.name);
        match role {
            Role::Dependent => {
                if name_len == 0 {
                    return Err("name is required".into());
                }
            }
            Role::Manager => {
                if name_len < 2 {
                    return Err("name must be at least 2 characters".into());
                }
                if trimmed_len(&self.professional_id) < 3 {
                    return Err("professional id must be at least 3 characters".into());
                }
                if self.age.is_none() {
                    return Err("age is required".into());
                }
                if trimmed_len(&self.specialty) < 2 {
                    return Err("specialty must be at least 2 characters".into());
                }
            }
        }

        Ok(())
    }
}

fn trimmed_len(value: &Option<String>) -> usize {
    value
        .as_deref()
        .map(|v| v.trim().chars().count())
        .unwrap_or(0)
}

/// Account document, stored at `accounts/{id}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountDoc {
    /// Provider-issued account id
    pub id: String,

    /// Email as the holder typed it
    pub email: String,

    /// Trimmed, lower-cased email (uniqueness key)
    pub normalized_email: String,

    pub role: Role,

    pub status: AccountStatus,

    pub sign_in_method: SignInMethod,

    #[serde(default)]
    pub profile: ProfileFields,

    /// Dependent-only: the manager this account is linked to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manager_id: Option<String>,

    pub metadata: Metadata,
}

impl AccountDoc {
    /// Whether the account may sign in
    pub fn is_enabled(&self) -> bool {
        self.status != AccountStatus::Disabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager_profile() -> ProfileFields {
        ProfileFields {
            name: Some("Dr. Rivera".into()),
            age: Some(41),
            specialty: Some("Physio".into()),
            professional_id: Some("LIC-0042".into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_merge_fills_but_never_overwrites() {
        let mut profile = ProfileFields {
            name: Some("Ana".into()),
            ..Default::default()
        };
        let incoming = ProfileFields {
            name: Some("Someone Else".into()),
            phone: Some("555-0100".into()),
            ..Default::default()
        };

        assert!(profile.merge_from(&incoming));
        assert_eq!(profile.name.as_deref(), Some("Ana"));
        assert_eq!(profile.phone.as_deref(), Some("555-0100"));

        // Second merge of the same fields is a no-op
        assert!(!profile.merge_from(&incoming));
    }

    #[test]
    fn test_manager_validation() {
        assert!(manager_profile().validate_for(Role::Manager).is_ok());

        let mut short_license = manager_profile();
        short_license.professional_id = Some("L1".into());
        assert!(short_license.validate_for(Role::Manager).is_err());

        let mut no_age = manager_profile();
        no_age.age = None;
        assert!(no_age.validate_for(Role::Manager).is_err());
    }

    #[test]
    fn test_dependent_validation() {
        let mut profile = ProfileFields {
            name: Some("  ".into()),
            ..Default::default()
        };
        assert!(profile.validate_for(Role::Dependent).is_err());

        profile.name = Some("Ana".into());
        assert!(profile.validate_for(Role::Dependent).is_ok());

        profile.age = Some(0);
        assert!(profile.validate_for(Role::Dependent).is_err());
    }

    #[test]
    fn test_role_serializes_snake_case() {
        assert_eq!(serde_json::to_string(&Role::Manager).unwrap(), "\"manager\"");
        assert_eq!(
            serde_json::to_string(&AccountStatus::PendingVerification).unwrap(),
            "\"pending_verification\""
        );
    }
}
