use std::fmt;

use crate::auth::role::Role;
use crate::error::{Result, WorkerError};

/// A call a client can make against the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Start,
    Stop,
    Query,
    Stream,
}

impl Operation {
    pub const ALL: [Operation; 4] = [
        Operation::Start,
        Operation::Stop,
        Operation::Query,
        Operation::Stream,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Operation::Start => "start",
            Operation::Stop => "stop",
            Operation::Query => "query",
            Operation::Stream => "stream",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.name() == name)
    }

    /// Roles allowed to perform this operation.
    pub fn allowed_roles(&self) -> &'static [Role] {
        match self {
            Operation::Start | Operation::Stop => &[Role::Writer],
            Operation::Query | Operation::Stream => &[Role::Reader, Role::Writer],
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Decide whether a caller holding `role` may perform `operation`.
pub fn authorize(role: Option<Role>, operation: Operation) -> Result<Role> {
    let role = role.ok_or_else(|| {
        WorkerError::Unauthenticated("no role could be established for the caller".to_string())
    })?;
    if operation.allowed_roles().contains(&role) {
        Ok(role)
    } else {
        Err(WorkerError::PermissionDenied {
            role: role.to_string(),
            operation: operation.to_string(),
        })
    }
}

/// Like [`authorize`], for an operation known only by name. Names outside
/// the rule table are denied.
pub fn authorize_name(role: Option<Role>, operation: &str) -> Result<Role> {
    match Operation::from_name(operation) {
        Some(op) => authorize(role, op),
        None => {
            let role = role.ok_or_else(|| {
                WorkerError::Unauthenticated(
                    "no role could be established for the caller".to_string(),
                )
            })?;
            Err(WorkerError::PermissionDenied {
                role: role.to_string(),
                operation: operation.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip() {
        for op in Operation::ALL {
            assert_eq!(Operation::from_name(op.name()), Some(op));
        }
        assert_eq!(Operation::from_name("Start"), None);
    }

    #[test]
    fn writer_is_a_superset_of_reader() {
        for op in Operation::ALL {
            if authorize(Some(Role::Reader), op).is_ok() {
                assert!(authorize(Some(Role::Writer), op).is_ok(), "{}", op);
            }
        }
    }
}
