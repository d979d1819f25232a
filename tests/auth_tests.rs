//! Role extraction from real certificates and the authorization rule table.


use job_worker::auth::{
    authorize, authorize_name, role_from_certificate, IdentityError, Operation, Role,
};
use job_worker::error::WorkerError;

use test_harness::{client_cert_der, RoleClaim};

// ============================================================================
// Rule table
// ============================================================================

#[test]
fn test_writer_may_do_everything() {
    for op in Operation::ALL {
        assert_eq!(authorize(Some(Role::Writer), op).unwrap(), Role::Writer);
    }
}

#[test]
fn test_reader_may_only_observe() {
    assert!(authorize(Some(Role::Reader), Operation::Query).is_ok());
    assert!(authorize(Some(Role::Reader), Operation::Stream).is_ok());

    for op in [Operation::Start, Operation::Stop] {
        match authorize(Some(Role::Reader), op) {
            Err(WorkerError::PermissionDenied { role, operation }) => {
                assert_eq!(role, "reader");
                assert_eq!(operation, op.name());
            }
            other => panic!("reader {} should be denied, got {:?}", op, other),
        }
    }
}

#[test]
fn test_no_role_is_unauthenticated() {
    for op in Operation::ALL {
        assert!(matches!(
            authorize(None, op),
            Err(WorkerError::Unauthenticated(_))
        ));
    }
}

#[test]
fn test_unknown_operation_is_denied() {
    for role in [Role::Reader, Role::Writer] {
        assert!(matches!(
            authorize_name(Some(role), "list"),
            Err(WorkerError::PermissionDenied { .. })
        ));
    }
    assert!(matches!(
        authorize_name(None, "list"),
        Err(WorkerError::Unauthenticated(_))
    ));
    assert!(authorize_name(Some(Role::Reader), "query").is_ok());
}

// ============================================================================
// Role extraction
// ============================================================================

#[test]
fn test_role_is_read_from_certificate() {
    for role in [Role::Reader, Role::Writer] {
        let der = client_cert_der(RoleClaim::Role(role));
        assert_eq!(role_from_certificate(&der).unwrap(), role);
    }
}

#[test]
fn test_certificate_without_role_is_rejected() {
    let der = client_cert_der(RoleClaim::Absent);
    assert_eq!(role_from_certificate(&der), Err(IdentityError::MissingRole));
}

#[test]
fn test_duplicate_role_extension_is_rejected() {
    let der = client_cert_der(RoleClaim::Duplicated(Role::Writer));
    // The parser may refuse duplicate extensions before we look at them.
    assert!(matches!(
        role_from_certificate(&der),
        Err(IdentityError::DuplicateRole) | Err(IdentityError::MalformedCertificate(_))
    ));
}

#[test]
fn test_critical_role_extension_is_rejected() {
    let der = client_cert_der(RoleClaim::Critical(Role::Writer));
    assert_eq!(role_from_certificate(&der), Err(IdentityError::CriticalRole));
}

#[test]
fn test_unknown_role_is_rejected() {
    let mut value = vec![0x0c, 5];
    value.extend_from_slice(b"admin");
    let der = client_cert_der(RoleClaim::Raw(value));
    assert_eq!(
        role_from_certificate(&der),
        Err(IdentityError::UnknownRole("admin".to_string()))
    );
}

#[test]
fn test_role_case_is_significant() {
    let mut value = vec![0x0c, 6];
    value.extend_from_slice(b"Writer");
    let der = client_cert_der(RoleClaim::Raw(value));
    assert!(matches!(
        role_from_certificate(&der),
        Err(IdentityError::UnknownRole(_))
    ));
}

#[test]
fn test_role_must_be_utf8_string() {
    // PrintableString "writer"
    let mut value = vec![0x13, 6];
    value.extend_from_slice(b"writer");
    let der = client_cert_der(RoleClaim::Raw(value));
    assert_eq!(role_from_certificate(&der), Err(IdentityError::MalformedRole));
}

#[test]
fn test_identity_errors_become_unauthenticated() {
    let err: WorkerError = IdentityError::MissingRole.into();
    assert!(matches!(err, WorkerError::Unauthenticated(_)));
    assert_eq!(tonic::Status::from(err).code(), tonic::Code::Unauthenticated);
}

#[test]
fn test_role_length_must_be_minimal() {
    let mut value = vec![0x0c, 0x81, 6];
    value.extend_from_slice(b"writer");
    let der = client_cert_der(RoleClaim::Raw(value));
    assert_eq!(role_from_certificate(&der), Err(IdentityError::MalformedRole));
}
