//! Participant roles and collision-resolution politeness

use serde::{Deserialize, Serialize};

/// Role of the local user in the classroom
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Teacher or administrator; may create call sessions
    Host,
    /// Student; joins sessions created by a host
    Participant,
}

impl Role {
    /// Map the backend's `role`/`status` pair onto a call role.
    ///
    /// Only staff accounts with teacher or admin status may start calls.
    pub fn from_backend(role: &str, status: Option<&str>) -> Self {
        let staff = role.eq_ignore_ascii_case("staff");
        let elevated_status = match status {
            Some(status) => {
                status.eq_ignore_ascii_case("teacher") || status.eq_ignore_ascii_case("admin")
            }
            None => true,
        };
        if staff && elevated_status {
            Role::Host
        } else {
            Role::Participant
        }
    }

    /// Whether this role may create a session
    pub fn is_elevated(&self) -> bool {
        matches!(self, Role::Host)
    }
}

/// Which side yields during an offer collision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Politeness {
    /// Rolls back its own offer and accepts the remote one
    Polite,
    /// Ignores colliding remote offers
    Impolite,
}

impl Politeness {
    /// Whether this side yields
    pub fn is_polite(&self) -> bool {
        matches!(self, Politeness::Polite)
    }
}

/// How politeness is assigned when a call starts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolitenessPolicy {
    /// Hosts are impolite, everyone else polite
    #[default]
    ByRole,
    /// The first active member of the session is impolite
    ByJoinOrder,
}

impl PolitenessPolicy {
    /// Resolve politeness for the local user.
    ///
    /// `peers_already_joined` is whether another participant held an active
    /// membership when the local user joined.
    pub fn resolve(&self, role: Role, peers_already_joined: bool) -> Politeness {
        match self {
            PolitenessPolicy::ByRole => {
                if role.is_elevated() {
                    Politeness::Impolite
                } else {
                    Politeness::Polite
                }
            }
            PolitenessPolicy::ByJoinOrder => {
                if peers_already_joined {
                    Politeness::Polite
                } else {
                    Politeness::Impolite
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_role_mapping() {
        assert_eq!(Role::from_backend("staff", Some("teacher")), Role::Host);
        assert_eq!(Role::from_backend("staff", Some("admin")), Role::Host);
        assert_eq!(Role::from_backend("staff", Some("assistant")), Role::Participant);
        assert_eq!(Role::from_backend("student", None), Role::Participant);
    }

    #[test]
    fn test_politeness_policies() {
        assert_eq!(
            PolitenessPolicy::ByRole.resolve(Role::Host, true),
            Politeness::Impolite
        );
        assert_eq!(
            PolitenessPolicy::ByRole.resolve(Role::Participant, false),
            Politeness::Polite
        );
        assert_eq!(
            PolitenessPolicy::ByJoinOrder.resolve(Role::Participant, false),
            Politeness::Impolite
        );
        assert_eq!(
            PolitenessPolicy::ByJoinOrder.resolve(Role::Host, true),
            Politeness::Polite
        );
    }
}
