use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString};
use thiserror::Error;

/// Payment processors the gateway knows how to talk to.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
    AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum BillerName {
    Rocketgate,
    Netbilling,
    Epoch,
    Qysso,
    Unknown,
}

impl BillerName {
    /// Total lookup: names outside the known set map to `Unknown`.
    pub fn from_name(name: &str) -> Self {
        name.trim().parse().unwrap_or(BillerName::Unknown)
    }

    /// Third-party billers take the member to an external page instead of charging server to server.
    pub fn is_third_party(&self) -> bool {
        matches!(self, BillerName::Epoch | BillerName::Qysso)
    }

    pub fn default_max_submits(&self) -> u32 {
        match self {
            BillerName::Rocketgate | BillerName::Netbilling => 3,
            BillerName::Epoch | BillerName::Qysso | BillerName::Unknown => 1,
        }
    }

    pub fn supports_three_d(&self) -> bool {
        matches!(self, BillerName::Rocketgate)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BillerError {
    #[error("max submits for biller {0} must be a positive integer")]
    InvalidMaxSubmits(BillerName),
}

/// One processor's capabilities within a cascade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Biller {
    name: BillerName,
    is_third_party: bool,
    max_submits: u32,
}

impl Biller {
    pub fn new(name: BillerName, max_submits: u32) -> Result<Self, BillerError> {
        if max_submits == 0 {
            return Err(BillerError::InvalidMaxSubmits(name));
        }
        Ok(Self {
            name,
            is_third_party: name.is_third_party(),
            max_submits,
        })
    }

    pub fn with_defaults(name: BillerName) -> Self {
        Self {
            name,
            is_third_party: name.is_third_party(),
            max_submits: name.default_max_submits(),
        }
    }

    pub fn name(&self) -> BillerName {
        self.name
    }

    pub fn is_third_party(&self) -> bool {
        self.is_third_party
    }

    pub fn max_submits(&self) -> u32 {
        self.max_submits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn biller_names_are_case_insensitive() {
        assert_eq!(BillerName::from_name("RocketGate"), BillerName::Rocketgate);
        assert_eq!(BillerName::from_name(" qysso "), BillerName::Qysso);
        assert_eq!(BillerName::from_name("paypal"), BillerName::Unknown);
    }

    #[test]
    fn third_party_flag_follows_the_processor() {
        assert!(Biller::with_defaults(BillerName::Epoch).is_third_party());
        assert!(Biller::with_defaults(BillerName::Qysso).is_third_party());
        assert!(!Biller::with_defaults(BillerName::Netbilling).is_third_party());
    }

    #[test]
    fn zero_max_submits_is_rejected() {
        assert_eq!(
            Biller::new(BillerName::Rocketgate, 0),
            Err(BillerError::InvalidMaxSubmits(BillerName::Rocketgate))
        );
        assert_eq!(Biller::new(BillerName::Rocketgate, 2).unwrap().max_submits(), 2);
    }
}
