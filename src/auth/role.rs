use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use x509_parser::der_parser::asn1_rs::{FromDer, SerializeError, ToDer, Utf8String};

/// Dotted form of the certificate extension that carries the caller's role.
pub const ROLE_EXTENSION_OID: &str = "1.3.6.1.4.1.58296.1.1";

/// The same OID as arcs, for certificate builders.
pub const ROLE_EXTENSION_ARCS: &[u64] = &[1, 3, 6, 1, 4, 1, 58296, 1, 1];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Reader,
    Writer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Reader => "reader",
            Role::Writer => "writer",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = IdentityError;

    /// Exact match only: no trimming, no case folding.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reader" => Ok(Role::Reader),
            "writer" => Ok(Role::Writer),
            other => Err(IdentityError::UnknownRole(other.to_string())),
        }
    }
}

/// Why no role could be established for a caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error("no client certificate presented")]
    NoCertificate,

    #[error("client certificate could not be parsed: {0}")]
    MalformedCertificate(String),

    #[error("client certificate carries no role")]
    MissingRole,

    #[error("client certificate carries more than one role")]
    DuplicateRole,

    #[error("role extension must not be critical")]
    CriticalRole,

    #[error("role extension is not a DER UTF8String")]
    MalformedRole,

    #[error("unknown role {0:?}")]
    UnknownRole(String),
}

/// Read the caller's role from a DER-encoded leaf certificate.
///
/// The certificate must carry exactly one role extension and its value must
/// be a UTF8String naming a known role. There is no default role.
pub fn role_from_certificate(der: &[u8]) -> Result<Role, IdentityError> {
    let (_, cert) = x509_parser::parse_x509_certificate(der)
        .map_err(|e| IdentityError::MalformedCertificate(e.to_string()))?;

    let mut value = None;
    for ext in cert.extensions() {
        if ext.oid.to_id_string() != ROLE_EXTENSION_OID {
            continue;
        }
        if value.is_some() {
            return Err(IdentityError::DuplicateRole);
        }
        if ext.critical {
            return Err(IdentityError::CriticalRole);
        }
        value = Some(ext.value);
    }

    let value = value.ok_or(IdentityError::MissingRole)?;
    decode_utf8_string(value)?.parse()
}

/// DER encoding of `role` as the role extension's value.
pub fn encode_role_extension(role: Role) -> Result<Vec<u8>, SerializeError> {
    Utf8String::new(role.as_str()).to_der_vec()
}

/// Strict DER: a single UTF8String, minimal length octets, nothing after it.
fn decode_utf8_string(der: &[u8]) -> Result<String, IdentityError> {
    if !has_minimal_length(der) {
        return Err(IdentityError::MalformedRole);
    }
    let (rest, value) = Utf8String::from_der(der).map_err(|_| IdentityError::MalformedRole)?;
    if !rest.is_empty() {
        return Err(IdentityError::MalformedRole);
    }
    Ok(value.string())
}

/// The parser also accepts BER length forms, so check the length octets here.
fn has_minimal_length(der: &[u8]) -> bool {
    match der.get(1) {
        None | Some(0x80) => false,
        Some(&first) if first & 0x80 == 0 => true,
        Some(&first) => {
            let octets = usize::from(first & 0x7f);
            match der.get(2..2 + octets) {
                Some(length) => length[0] != 0 && !(octets == 1 && length[0] < 0x80),
                None => false,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_names_are_exact() {
        assert_eq!("reader".parse::<Role>().unwrap(), Role::Reader);
        assert_eq!("writer".parse::<Role>().unwrap(), Role::Writer);
        for bad in ["Reader", "WRITER", " writer", "writer\n", "admin", ""] {
            assert!(matches!(
                bad.parse::<Role>(),
                Err(IdentityError::UnknownRole(_))
            ));
        }
    }

    #[test]
    fn encoded_extension_decodes() {
        for role in [Role::Reader, Role::Writer] {
            let der = encode_role_extension(role).unwrap();
            assert_eq!(der[..2], [0x0c, role.as_str().len() as u8]);
            assert_eq!(decode_utf8_string(&der).unwrap(), role.as_str());
        }
    }

    #[test]
    fn non_minimal_length_is_rejected() {
        let long_form = [0x0c, 0x81, 6, b'w', b'r', b'i', b't', b'e', b'r'];
        assert_eq!(decode_utf8_string(&long_form), Err(IdentityError::MalformedRole));

        let padded = [0x0c, 0x82, 0, 6, b'w', b'r', b'i', b't', b'e', b'r'];
        assert_eq!(decode_utf8_string(&padded), Err(IdentityError::MalformedRole));
    }

    #[test]
    fn long_form_length_is_accepted_when_required() {
        let name = "w".repeat(200);
        let mut der = vec![0x0c, 0x81, 200];
        der.extend_from_slice(name.as_bytes());
        assert_eq!(decode_utf8_string(&der).unwrap(), name);
    }

    #[test]
    fn malformed_values_are_rejected() {
        let cases: [&[u8]; 6] = [
            &[],
            // PrintableString, not UTF8String
            &[0x13, 6, b'w', b'r', b'i', b't', b'e', b'r'],
            &[0x0c, 7, b'w', b'r', b'i', b't', b'e', b'r'],
            &[0x0c, 5, b'w', b'r', b'i', b't', b'e', b'r'],
            &[0x0c, 0x80],
            &[0x0c, 2, 0xff, 0xfe],
        ];
        for der in cases {
            assert_eq!(
                decode_utf8_string(der),
                Err(IdentityError::MalformedRole),
                "{:?}",
                der
            );
        }
    }

    #[test]
    fn garbage_is_not_a_certificate() {
        assert!(matches!(
            role_from_certificate(b"not a certificate"),
            Err(IdentityError::MalformedCertificate(_))
        ));
    }
}
