//! Validated value objects shared by the purchase models.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

static BIN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[0-9]{6}$").expect("valid bin regex"));
static LAST_FOUR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9]{4}$").expect("valid last four regex"));
static ZIP_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9 \-]{0,9}$").expect("valid zip regex"));

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValueError {
    #[error("Invalid ip address: {0}")]
    InvalidIp(String),
    #[error("Invalid email: {0}")]
    InvalidEmail(String),
    #[error("Invalid zip code: {0}")]
    InvalidZip(String),
    #[error("Invalid bin: {0}")]
    InvalidBin(String),
    #[error("Invalid last four digits: {0}")]
    InvalidLastFour(String),
}

/// Identifier of one purchase session. A new session always means a new purchase process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Ip(IpAddr);

impl Ip {
    pub fn parse(raw: &str) -> Result<Self, ValueError> {
        raw.trim()
            .parse::<IpAddr>()
            .map(Self)
            .map_err(|_| ValueError::InvalidIp(raw.to_string()))
    }
}

impl fmt::Display for Ip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Email(String);

impl Email {
    pub fn parse(raw: &str) -> Result<Self, ValueError> {
        let trimmed = raw.trim();
        if validator::validate_email(trimmed) {
            Ok(Self(trimmed.to_ascii_lowercase()))
        } else {
            Err(ValueError::InvalidEmail(raw.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Email {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Zip(String);

impl Zip {
    pub fn parse(raw: &str) -> Result<Self, ValueError> {
        let trimmed = raw.trim();
        if ZIP_RE.is_match(trimmed) {
            Ok(Self(trimmed.to_string()))
        } else {
            Err(ValueError::InvalidZip(raw.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Zip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// First six digits of a card number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Bin(String);

impl Bin {
    pub fn parse(raw: &str) -> Result<Self, ValueError> {
        let trimmed = raw.trim();
        if BIN_RE.is_match(trimmed) {
            Ok(Self(trimmed.to_string()))
        } else {
            Err(ValueError::InvalidBin(raw.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Bin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct LastFour(String);

impl LastFour {
    pub fn parse(raw: &str) -> Result<Self, ValueError> {
        let trimmed = raw.trim();
        if LAST_FOUR_RE.is_match(trimmed) {
            Ok(Self(trimmed.to_string()))
        } else {
            Err(ValueError::InvalidLastFour(raw.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

macro_rules! string_conversions {
    ($($ty:ident),*) => {
        $(
            impl TryFrom<String> for $ty {
                type Error = ValueError;

                fn try_from(value: String) -> Result<Self, Self::Error> {
                    Self::parse(&value)
                }
            }

            impl From<$ty> for String {
                fn from(value: $ty) -> Self {
                    value.to_string()
                }
            }
        )*
    };
}

impl fmt::Display for LastFour {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

string_conversions!(Ip, Email, Zip, Bin, LastFour);

/// How the member pays. Only a biller token or a stored-card reference is
/// kept, never a card number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PaymentInstrument {
    Card {
        token: String,
        first_six: Bin,
        last_four: LastFour,
    },
    Template {
        template_id: Uuid,
        first_six: Bin,
    },
}

impl PaymentInstrument {
    pub fn first_six(&self) -> &Bin {
        match self {
            PaymentInstrument::Card { first_six, .. } | PaymentInstrument::Template { first_six, .. } => {
                first_six
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bin_requires_six_digits() {
        assert!(Bin::parse("411111").is_ok());
        assert_eq!(
            Bin::parse("41111"),
            Err(ValueError::InvalidBin("41111".to_string()))
        );
        assert!(Bin::parse("4111a1").is_err());
    }

    #[test]
    fn last_four_rejects_malformed_input() {
        assert!(LastFour::parse("1234").is_ok());
        assert!(LastFour::parse("12345").is_err());
        assert!(LastFour::parse("12a4").is_err());
    }

    #[test]
    fn email_is_normalized() {
        let email = Email::parse(" Member@Example.COM ").unwrap();
        assert_eq!(email.as_str(), "member@example.com");
        assert!(Email::parse("not-an-email").is_err());
    }

    #[test]
    fn ip_accepts_v4_and_v6() {
        assert!(Ip::parse("10.0.0.1").is_ok());
        assert!(Ip::parse("::1").is_ok());
        assert!(Ip::parse("999.0.0.1").is_err());
    }

    #[test]
    fn values_deserialize_through_validation() {
        let zip: Result<Zip, _> = serde_json::from_str("\"H0H 0H0\"");
        assert!(zip.is_ok());
        let bin: Result<Bin, _> = serde_json::from_str("\"12\"");
        assert!(bin.is_err());
    }
}
