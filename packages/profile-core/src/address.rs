//! # Addresses
//!
//! A user is identified by a UUID, an E.164 phone number, or both.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          ADDRESS EQUALITY                               │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │   {uuid: u1}              ==  {uuid: u1, phone: +1555}   (uuid match)   │
//! │   {phone: +1555}          ==  {uuid: u1, phone: +1555}   (phone match)  │
//! │   {uuid: u1, phone: +1}   !=  {uuid: u2, phone: +1}      (uuid differs) │
//! │   {uuid: u1}              !=  {phone: +1555}             (no overlap)   │
//! │                                                                         │
//! │   Canonical key:  "uuid:<hyphenated>" if a UUID is known,               │
//! │                   "e164:<number>" otherwise.                            │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Equality is not transitive (`{u1}` and `{+1555}` are both equal to
//! `{u1, +1555}` but not to each other), so `Address` deliberately does not
//! implement `Hash`. Code that needs a map key uses [`Address::canonical_key`].

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Key prefix for UUID identifiers
const UUID_PREFIX: &str = "uuid:";

/// Key prefix for phone-number identifiers
const E164_PREFIX: &str = "e164:";

/// Maximum number of digits in an E.164 number
const MAX_E164_DIGITS: usize = 15;

/// Stable identity of a user
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "RawAddress")]
pub struct Address {
    uuid: Option<Uuid>,
    phone_number: Option<String>,
}

/// Unvalidated wire form of [`Address`]
#[derive(Deserialize)]
struct RawAddress {
    uuid: Option<Uuid>,
    phone_number: Option<String>,
}

impl TryFrom<RawAddress> for Address {
    type Error = Error;

    fn try_from(raw: RawAddress) -> Result<Self> {
        Address::new(raw.uuid, raw.phone_number)
    }
}

impl Address {
    /// Create an address from optional identifiers.
    ///
    /// At least one identifier must be present and the phone number, if
    /// any, must be in E.164 form (`+` followed by 2-15 digits).
    pub fn new(uuid: Option<Uuid>, phone_number: Option<String>) -> Result<Self> {
        if uuid.is_none() && phone_number.is_none() {
            return Err(Error::InvalidAddress(
                "an address needs a UUID or a phone number".into(),
            ));
        }
        if let Some(ref phone) = phone_number {
            validate_e164(phone)?;
        }
        Ok(Self { uuid, phone_number })
    }

    /// Address known only by UUID
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self {
            uuid: Some(uuid),
            phone_number: None,
        }
    }

    /// Address known only by phone number
    pub fn from_phone(phone_number: &str) -> Result<Self> {
        Self::new(None, Some(phone_number.to_string()))
    }

    /// The UUID, if known
    pub fn uuid(&self) -> Option<Uuid> {
        self.uuid
    }

    /// The E.164 phone number, if known
    pub fn phone_number(&self) -> Option<&str> {
        self.phone_number.as_deref()
    }

    /// Canonical storage key; the UUID dominates the phone number
    pub fn canonical_key(&self) -> String {
        match (&self.uuid, &self.phone_number) {
            (Some(uuid), _) => uuid_key(uuid),
            (None, Some(phone)) => phone_key(phone),
            (None, None) => unreachable!("addresses always carry an identifier"),
        }
    }

    /// Keys for every identifier this address carries
    pub fn identifier_keys(&self) -> Vec<String> {
        let mut keys = Vec::with_capacity(2);
        if let Some(ref uuid) = self.uuid {
            keys.push(uuid_key(uuid));
        }
        if let Some(ref phone) = self.phone_number {
            keys.push(phone_key(phone));
        }
        keys
    }

    /// Whether both identifiers are known
    pub fn is_complete(&self) -> bool {
        self.uuid.is_some() && self.phone_number.is_some()
    }

    /// Whether the two addresses can describe the same user without
    /// contradicting each other.
    ///
    /// Unlike `==` this does not require an overlapping identifier.
    pub fn is_compatible_with(&self, other: &Address) -> bool {
        let uuid_ok = match (self.uuid, other.uuid) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        };
        let phone_ok = match (&self.phone_number, &other.phone_number) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        };
        uuid_ok && phone_ok
    }

    /// Union of the identifiers of two compatible addresses
    pub fn union(&self, other: &Address) -> Result<Address> {
        if !self.is_compatible_with(other) {
            return Err(Error::AddressConflict(format!(
                "{} and {} name different users",
                self, other
            )));
        }
        Ok(Address {
            uuid: self.uuid.or(other.uuid),
            phone_number: self
                .phone_number
                .clone()
                .or_else(|| other.phone_number.clone()),
        })
    }
}

impl PartialEq for Address {
    /// Equal if either identifier matches and the other one is absent on
    /// at least one side or equal.
    fn eq(&self, other: &Self) -> bool {
        let uuid_match = matches!((self.uuid, other.uuid), (Some(a), Some(b)) if a == b);
        let phone_match = matches!(
            (&self.phone_number, &other.phone_number),
            (Some(a), Some(b)) if a == b
        );
        (uuid_match || phone_match) && self.is_compatible_with(other)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.uuid, &self.phone_number) {
            (Some(uuid), Some(phone)) => write!(f, "{}/{}", uuid, redact_phone(phone)),
            (Some(uuid), None) => write!(f, "{}", uuid),
            (None, Some(phone)) => write!(f, "{}", redact_phone(phone)),
            (None, None) => write!(f, "<empty>"),
        }
    }
}

/// Storage key for a UUID identifier
pub(crate) fn uuid_key(uuid: &Uuid) -> String {
    format!("{}{}", UUID_PREFIX, uuid.hyphenated())
}

/// Storage key for a phone-number identifier
pub(crate) fn phone_key(phone: &str) -> String {
    format!("{}{}", E164_PREFIX, phone)
}

fn validate_e164(phone: &str) -> Result<()> {
    let digits = phone
        .strip_prefix('+')
        .ok_or_else(|| Error::InvalidAddress(format!("phone number must start with '+': {}", phone)))?;

    if digits.len() < 2 || digits.len() > MAX_E164_DIGITS {
        return Err(Error::InvalidAddress(format!(
            "phone number must have 2-{} digits",
            MAX_E164_DIGITS
        )));
    }
    if !digits.bytes().all(|b| b.is_ascii_digit()) || digits.starts_with('0') {
        return Err(Error::InvalidAddress(format!(
            "phone number is not E.164: {}",
            phone
        )));
    }
    Ok(())
}

// Log lines carry addresses; keep only the last few digits.
fn redact_phone(phone: &str) -> String {
    let tail = phone.len().saturating_sub(3);
    format!("+…{}", &phone[tail..])
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn u(n: u128) -> Uuid {
        Uuid::from_u128(n)
    }

    #[test]
    fn test_requires_an_identifier() {
        assert!(matches!(
            Address::new(None, None),
            Err(Error::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_rejects_non_e164() {
        assert!(Address::from_phone("15551234").is_err());
        assert!(Address::from_phone("+0155").is_err());
        assert!(Address::from_phone("+1555-1234").is_err());
        assert!(Address::from_phone("+1234567890123456").is_err());
        assert!(Address::from_phone("+15551234").is_ok());
    }

    #[test]
    fn test_equality_rules() {
        let uuid_only = Address::from_uuid(u(1));
        let phone_only = Address::from_phone("+15551234").unwrap();
        let both = Address::new(Some(u(1)), Some("+15551234".into())).unwrap();
        let other_uuid = Address::new(Some(u(2)), Some("+15551234".into())).unwrap();

        assert_eq!(uuid_only, both);
        assert_eq!(phone_only, both);
        assert_ne!(uuid_only, phone_only);
        assert_ne!(both, other_uuid);
    }

    #[test]
    fn test_canonical_key_prefers_uuid() {
        let both = Address::new(Some(u(7)), Some("+15551234".into())).unwrap();
        assert!(both.canonical_key().starts_with("uuid:"));
        assert_eq!(
            Address::from_phone("+15551234").unwrap().canonical_key(),
            "e164:+15551234"
        );
        assert_eq!(both.identifier_keys().len(), 2);
    }

    #[test]
    fn test_union() {
        let phone_only = Address::from_phone("+15551234").unwrap();
        let merged = phone_only.union(&Address::from_uuid(u(3))).unwrap();
        assert!(merged.is_complete());
        assert_eq!(merged.uuid(), Some(u(3)));

        let conflicting = Address::new(Some(u(4)), Some("+15550000".into())).unwrap();
        assert!(matches!(
            merged.union(&conflicting),
            Err(Error::AddressConflict(_))
        ));
    }

    #[test]
    fn test_deserialize_validates() {
        let err = serde_json::from_str::<Address>(r#"{"uuid":null,"phone_number":null}"#);
        assert!(err.is_err());

        let json = serde_json::to_string(&Address::from_uuid(u(9))).unwrap();
        let back: Address = serde_json::from_str(&json).unwrap();
        assert_eq!(back.uuid(), Some(u(9)));
    }

    #[test]
    fn test_display_redacts_phone() {
        let addr = Address::from_phone("+15551234").unwrap();
        assert_eq!(addr.to_string(), "+…234");
    }
}
