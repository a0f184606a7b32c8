//! Household aggregate as seen from the identity core.
//!
//! Households belong to the inventory service. The identity core reads
//! membership to put the household and role into access tokens, and mutates
//! ownership only when an owner deletes their account.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HouseholdRole {
    Owner,
    Member,
}

impl HouseholdRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            HouseholdRole::Owner => "owner",
            HouseholdRole::Member => "member",
        }
    }
}

impl FromStr for HouseholdRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "owner" => Ok(HouseholdRole::Owner),
            "member" => Ok(HouseholdRole::Member),
            other => Err(format!("Unknown household role: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Household {
    pub household_id: Uuid,
    pub household_name: String,
    pub owner_subject_id: Uuid,
    pub created_utc: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HouseholdMember {
    pub household_id: Uuid,
    pub subject_id: Uuid,
    pub role: HouseholdRole,
    pub joined_utc: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HouseholdInvite {
    pub invite_code: String,
    pub household_id: Uuid,
    pub expiry_utc: DateTime<Utc>,
    pub used: bool,
}

/// A household with its current members.
#[derive(Debug, Clone, PartialEq)]
pub struct HouseholdSnapshot {
    pub household: Household,
    pub members: Vec<HouseholdMember>,
}

impl HouseholdSnapshot {
    pub fn member(&self, subject_id: Uuid) -> Option<&HouseholdMember> {
        self.members.iter().find(|m| m.subject_id == subject_id)
    }

    pub fn is_owned_by(&self, subject_id: Uuid) -> bool {
        self.household.owner_subject_id == subject_id
    }

    /// Members other than `subject_id`.
    pub fn others(&self, subject_id: Uuid) -> impl Iterator<Item = &HouseholdMember> {
        self.members.iter().filter(move |m| m.subject_id != subject_id)
    }

    pub fn is_sole_member(&self, subject_id: Uuid) -> bool {
        self.member(subject_id).is_some() && self.others(subject_id).next().is_none()
    }

    /// Who inherits ownership when `leaving` goes: the earliest-joined other
    /// member, ties broken by the lower subject id.
    pub fn successor_for(&self, leaving: Uuid) -> Option<&HouseholdMember> {
        self.others(leaving)
            .min_by(|a, b| {
                a.joined_utc
                    .cmp(&b.joined_utc)
                    .then_with(|| a.subject_id.cmp(&b.subject_id))
            })
    }

    /// Exactly one owner, and the owner row matches the household record.
    pub fn has_single_owner(&self) -> bool {
        let owners: Vec<_> = self
            .members
            .iter()
            .filter(|m| m.role == HouseholdRole::Owner)
            .collect();
        owners.len() == 1 && owners[0].subject_id == self.household.owner_subject_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn member(household_id: Uuid, subject_id: Uuid, role: HouseholdRole, joined: DateTime<Utc>) -> HouseholdMember {
        HouseholdMember {
            household_id,
            subject_id,
            role,
            joined_utc: joined,
        }
    }

    #[test]
    fn test_successor_is_earliest_joined() {
        let now = Utc::now();
        let hid = Uuid::new_v4();
        let (owner, early, late) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let snapshot = HouseholdSnapshot {
            household: Household {
                household_id: hid,
                household_name: "Home".to_string(),
                owner_subject_id: owner,
                created_utc: now,
            },
            members: vec![
                member(hid, late, HouseholdRole::Member, now + Duration::days(2)),
                member(hid, owner, HouseholdRole::Owner, now),
                member(hid, early, HouseholdRole::Member, now + Duration::days(1)),
            ],
        };

        assert_eq!(snapshot.successor_for(owner).map(|m| m.subject_id), Some(early));
        assert!(snapshot.has_single_owner());
        assert!(!snapshot.is_sole_member(owner));
    }

    #[test]
    fn test_successor_tie_broken_by_subject_id() {
        let now = Utc::now();
        let hid = Uuid::new_v4();
        let owner = Uuid::new_v4();
        let a = Uuid::from_u128(1);
        let b = Uuid::from_u128(2);
        let snapshot = HouseholdSnapshot {
            household: Household {
                household_id: hid,
                household_name: "Home".to_string(),
                owner_subject_id: owner,
                created_utc: now,
            },
            members: vec![
                member(hid, owner, HouseholdRole::Owner, now),
                member(hid, b, HouseholdRole::Member, now + Duration::hours(1)),
                member(hid, a, HouseholdRole::Member, now + Duration::hours(1)),
            ],
        };

        assert_eq!(snapshot.successor_for(owner).map(|m| m.subject_id), Some(a));
    }

    #[test]
    fn test_sole_member_has_no_successor() {
        let now = Utc::now();
        let hid = Uuid::new_v4();
        let owner = Uuid::new_v4();
        let snapshot = HouseholdSnapshot {
            household: Household {
                household_id: hid,
                household_name: "Flat".to_string(),
                owner_subject_id: owner,
                created_utc: now,
            },
            members: vec![member(hid, owner, HouseholdRole::Owner, now)],
        };

        assert!(snapshot.is_sole_member(owner));
        assert!(snapshot.successor_for(owner).is_none());
    }
}
