//! Caller identity: the acting user and their role.
//!
//! Session/cookie auth lives outside this crate; by the time a core
//! operation runs, the HTTP layer has already resolved the caller into a
//! [`Caller`].

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Role of the acting user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Lecturer,
    Member,
}

impl Role {
    /// Staff roles may take attendance, reset punishments, and manage
    /// meetings and unlocks.
    pub fn is_staff(self) -> bool {
        matches!(self, Role::Admin | Role::Lecturer)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Lecturer => "lecturer",
            Role::Member => "member",
        }
    }

    /// Parse a role from its wire string. Unknown values fall back to the
    /// least-privileged role.
    pub fn parse(value: &str) -> Role {
        match value {
            "admin" => Role::Admin,
            "lecturer" => Role::Lecturer,
            _ => Role::Member,
        }
    }
}

/// The authenticated caller of a core operation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Caller {
    pub user_id: Uuid,
    pub role: Role,
}

impl Caller {
    pub fn new(user_id: Uuid, role: Role) -> Self {
        Self { user_id, role }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_staff_roles() {
        assert!(Role::Admin.is_staff());
        assert!(Role::Lecturer.is_staff());
        assert!(!Role::Member.is_staff());
    }

    #[test]
    fn test_parse_unknown_role_is_member() {
        assert_eq!(Role::parse("lecturer"), Role::Lecturer);
        assert_eq!(Role::parse("superuser"), Role::Member);
    }
}
