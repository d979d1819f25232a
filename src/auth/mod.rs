//! Caller identity and authorization.
//!
//! Callers authenticate with a client certificate over mTLS. The role they
//! act under is read from a dedicated certificate extension and checked
//! against a fixed rule table before any job operation runs:
//!
//! | operation | reader | writer |
//! |-----------|--------|--------|
//! | start     |        | yes    |
//! | stop      |        | yes    |
//! | query     | yes    | yes    |
//! | stream    | yes    | yes    |

pub mod policy;
pub mod role;

use tonic::Request;

use crate::error::{Result, WorkerError};

pub use policy::{authorize, authorize_name, Operation};
pub use role::{
    encode_role_extension, role_from_certificate, IdentityError, Role, ROLE_EXTENSION_ARCS,
    ROLE_EXTENSION_OID,
};

/// Role of the peer that sent `request`, read from its leaf certificate.
pub fn peer_role<T>(request: &Request<T>) -> std::result::Result<Role, IdentityError> {
    let certs = request.peer_certs().ok_or(IdentityError::NoCertificate)?;
    let leaf = certs.first().ok_or(IdentityError::NoCertificate)?;
    role_from_certificate(leaf.as_ref())
}

/// Authenticate the peer and authorize it for `operation`.
pub fn check<T>(request: &Request<T>, operation: Operation) -> Result<Role> {
    let role = peer_role(request).map_err(|e| {
        tracing::warn!(operation = %operation, error = %e, "Rejecting unauthenticated call");
        WorkerError::from(e)
    })?;

    authorize(Some(role), operation).inspect_err(|e| {
        tracing::warn!(operation = %operation, role = %role, error = %e, "Rejecting unauthorized call");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plaintext_requests_are_unauthenticated() {
        let request = Request::new(());
        assert_eq!(peer_role(&request), Err(IdentityError::NoCertificate));
        assert!(matches!(
            check(&request, Operation::Query),
            Err(WorkerError::Unauthenticated(_))
        ));
    }
}
