//! Room identity, participant roles and the send-permission matrix.
//!
//! | Opcode          | Sender role | Receiver role |
//! |-----------------|-------------|---------------|
//! | FULL_SYNC       | edit        | any           |
//! | POINTER         | any         | any           |
//! | ELEMENTS_UPDATE | edit        | any           |

use serde::{Deserialize, Serialize};

use crate::protocol::Opcode;

/// Role of the local participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    View,
    Edit,
}

impl Role {
    pub fn can_edit(self) -> bool {
        matches!(self, Role::Edit)
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "view" => Ok(Role::View),
            "edit" => Ok(Role::Edit),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// Whether `role` may transmit frames with `opcode`.
pub fn can_send(opcode: Opcode, role: Role) -> bool {
    match opcode {
        Opcode::Pointer => true,
        Opcode::FullSync | Opcode::ElementsUpdate => role.can_edit(),
    }
}

/// Whether `role` may receive frames with `opcode`.
pub fn can_receive(_opcode: Opcode, _role: Role) -> bool {
    true
}

/// A joined room. Immutable for the session lifetime.
#[derive(Clone, PartialEq, Eq)]
pub struct Room {
    id: String,
    secret: String,
    role: Role,
}

impl Room {
    pub fn new(id: impl Into<String>, secret: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            secret: secret.into(),
            role,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    pub fn role(&self) -> Role {
        self.role
    }
}

impl std::fmt::Debug for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Room")
            .field("id", &self.id)
            .field("role", &self.role)
            .finish_non_exhaustive()
    }
}
