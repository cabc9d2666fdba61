use std::fmt;
use std::ops::BitOr;

use serde::{Deserialize, Serialize};

use crate::error::IdentityError;

/// Bitfield of operations a permission grants.
///
/// A distinct newtype from [`Scope`] so the two can never be swapped at a
/// call site.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Action(pub u32);

impl Action {
    pub const NONE: Action = Action(0);
    pub const READ: Action = Action(1);
    pub const WRITE: Action = Action(1 << 1);
    pub const UPDATE: Action = Action(1 << 2);
    pub const DELETE: Action = Action(1 << 3);
    pub const CRUD: Action =
        Action(Self::READ.0 | Self::WRITE.0 | Self::UPDATE.0 | Self::DELETE.0);

    /// True when every bit of `wanted` is present.
    pub fn grants(&self, wanted: Action) -> bool {
        self.0 & wanted.0 == wanted.0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl BitOr for Action {
    type Output = Action;
    fn bitor(self, rhs: Action) -> Action {
        Action(self.0 | rhs.0)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(Action, &str); 4] = [
            (Action::READ, "READ"),
            (Action::WRITE, "WRITE"),
            (Action::UPDATE, "UPDATE"),
            (Action::DELETE, "DELETE"),
        ];
        let mut first = true;
        for (bit, name) in NAMES {
            if self.grants(bit) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        if first {
            f.write_str("NONE")?;
        }
        Ok(())
    }
}

/// Bitfield of subject sets a permission applies to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Scope(pub u32);

impl Scope {
    pub const NONE: Scope = Scope(0);
    pub const SELF_: Scope = Scope(1);
    pub const USERS: Scope = Scope(1 << 1);
    pub const ROLES: Scope = Scope(1 << 2);
    pub const GROUPS: Scope = Scope(1 << 3);
    pub const ORG: Scope = Scope(1 << 4);
    pub const ALL: Scope = Scope(0xFF);

    /// True when every bit of `wanted` is present.
    pub fn grants(&self, wanted: Scope) -> bool {
        self.0 & wanted.0 == wanted.0
    }
}

impl BitOr for Scope {
    type Output = Scope;
    fn bitor(self, rhs: Scope) -> Scope {
        Scope(self.0 | rhs.0)
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == Scope::ALL.0 {
            return f.write_str("ALL");
        }
        const NAMES: [(Scope, &str); 5] = [
            (Scope::SELF_, "SELF"),
            (Scope::USERS, "USERS"),
            (Scope::ROLES, "ROLES"),
            (Scope::GROUPS, "GROUPS"),
            (Scope::ORG, "ORG"),
        ];
        let mut first = true;
        for (bit, name) in NAMES {
            if self.grants(bit) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        if first {
            f.write_str("NONE")?;
        }
        Ok(())
    }
}

/// A `(resource, action, scope)` grant. The resource `"*"` matches every
/// resource (the encoding of all-resources grants on system roles).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permission {
    pub resource: String,
    pub action: Action,
    pub scope: Scope,
}

impl Permission {
    pub fn new(resource: impl Into<String>, action: Action, scope: Scope) -> Self {
        Self {
            resource: resource.into(),
            action,
            scope,
        }
    }

    /// Wildcard grant: every resource, every action, every scope.
    pub fn everything() -> Self {
        Self::new("*", Action::CRUD, Scope::ALL)
    }

    pub fn applies_to(&self, resource: &str) -> bool {
        self.resource == "*" || self.resource == resource
    }

    /// Compact string form carried inside access tokens:
    /// `"<resource>.<scope>.<action>"` with decimal bitfields.
    pub fn encode(&self) -> String {
        format!("{}.{}.{}", self.resource, self.scope.0, self.action.0)
    }

    /// Parse the compact string form. The resource may itself contain
    /// dots, so the two numeric fields are taken from the right.
    pub fn decode(encoded: &str) -> Result<Self, IdentityError> {
        let mut parts = encoded.rsplitn(3, '.');
        let action = parts
            .next()
            .and_then(|s| s.parse::<u32>().ok())
            .ok_or_else(|| bad_permission(encoded))?;
        let scope = parts
            .next()
            .and_then(|s| s.parse::<u32>().ok())
            .ok_or_else(|| bad_permission(encoded))?;
        let resource = parts.next().ok_or_else(|| bad_permission(encoded))?;
        if resource.is_empty() {
            return Err(bad_permission(encoded));
        }
        Ok(Permission {
            resource: resource.to_string(),
            action: Action(action),
            scope: Scope(scope),
        })
    }
}

fn bad_permission(encoded: &str) -> IdentityError {
    IdentityError::Validation(format!("malformed permission string '{encoded}'"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crud_is_the_or_of_the_parts() {
        assert_eq!(
            Action::CRUD,
            Action::READ | Action::WRITE | Action::UPDATE | Action::DELETE
        );
        assert!(Action::CRUD.grants(Action::READ));
        assert!(Action::CRUD.grants(Action::WRITE | Action::DELETE));
        assert!(!Action::READ.grants(Action::WRITE));
    }

    #[test]
    fn compound_grants_require_every_bit() {
        let rw = Action::READ | Action::WRITE;
        assert!(rw.grants(Action::READ));
        assert!(rw.grants(Action::WRITE));
        assert!(!rw.grants(Action::READ | Action::DELETE));
    }

    #[test]
    fn scope_all_covers_everything() {
        assert!(Scope::ALL.grants(Scope::SELF_));
        assert!(Scope::ALL.grants(Scope::ORG | Scope::USERS));
        assert!(!Scope::USERS.grants(Scope::ORG));
    }

    #[test]
    fn action_display_joins_names() {
        assert_eq!((Action::READ | Action::WRITE).to_string(), "READ|WRITE");
        assert_eq!(Action::NONE.to_string(), "NONE");
        assert_eq!(Action::CRUD.to_string(), "READ|WRITE|UPDATE|DELETE");
    }

    #[test]
    fn encode_decode_round_trips() {
        let p = Permission::new("identity", Action::READ | Action::WRITE, Scope::USERS);
        let encoded = p.encode();
        assert_eq!(encoded, "identity.2.3");
        assert_eq!(Permission::decode(&encoded).unwrap(), p);
    }

    #[test]
    fn decode_keeps_dotted_resources_intact() {
        let p = Permission::decode("apps.portal.255.15").unwrap();
        assert_eq!(p.resource, "apps.portal");
        assert_eq!(p.scope, Scope::ALL);
        assert_eq!(p.action, Action::CRUD);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(Permission::decode("identity").is_err());
        assert!(Permission::decode("identity.x.1").is_err());
        assert!(Permission::decode(".1.1").is_err());
    }

    #[test]
    fn wildcard_resource_applies_everywhere() {
        let p = Permission::everything();
        assert!(p.applies_to("identity"));
        assert!(p.applies_to("network"));
    }
}
