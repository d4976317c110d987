use serde::Deserialize;
use serde::Serialize;
use sha2::Digest;
use sha2::Sha256;
use validator::ValidateEmail;

use crate::domain::Channel;

/// A parsed, known-valid email address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailAddress(String);

impl EmailAddress {
    pub fn parse(email: String) -> Result<Self, String> {
        ValidateEmail::validate_email(&email)
            .then_some(Self(email.clone()))
            .ok_or(format!("invalid email address: {:?}", redact_email(&email)))
    }
}

impl AsRef<str> for EmailAddress {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A parsed E.164-style phone number: leading `+`, 8-15 digits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhoneNumber(String);

impl PhoneNumber {
    pub fn parse(phone: String) -> Result<Self, String> {
        let digits = phone.strip_prefix('+').unwrap_or_default();
        let valid = (8..=15).contains(&digits.len()) && digits.chars().all(|c| c.is_ascii_digit());
        valid
            .then_some(Self(phone.clone()))
            .ok_or(format!("invalid phone number: {:?}", redact_phone(&phone)))
    }
}

impl AsRef<str> for PhoneNumber {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// The target of a notification. The per-channel contact fields are optional;
/// validity for a given channel is checked at request construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recipient {
    pub id: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub push_token: Option<String>,
    /// IANA timezone name, e.g. `America/Los_Angeles`. Used for quiet hours.
    pub timezone: Option<String>,
}

impl Recipient {
    pub fn contact_for(&self, channel: Channel) -> Option<&str> {
        match channel {
            Channel::Email => self.email.as_deref(),
            Channel::Sms => self.phone.as_deref(),
            Channel::Push => self.push_token.as_deref(),
        }
    }

    pub fn has_contact_for(&self, channel: Channel) -> bool {
        self.contact_for(channel).is_some_and(|c| !c.is_empty())
    }
}

/// SHA-256 hex digest of a normalized recipient address. Suppression entries
/// are keyed on this hash so raw addresses never appear in the block list.
pub fn address_hash(address: &str) -> String {
    let normalized = address.trim().to_lowercase();
    hex::encode(Sha256::digest(normalized.as_bytes()))
}

/// Mask the local part of an email, keeping the domain for debuggability.
pub fn redact_email(address: &str) -> String {
    match address.split_once('@') {
        Some((local, domain)) => {
            let head = local.chars().next().map(String::from).unwrap_or_default();
            format!("{head}***@{domain}")
        }
        None => "***".to_string(),
    }
}

/// Keep only the last four digits of a phone number.
pub fn redact_phone(phone: &str) -> String {
    let digits: String = phone.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() <= 4 {
        "***".to_string()
    } else {
        format!("***{}", &digits[digits.len() - 4..])
    }
}
