use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::values::{Bin, Email, Ip, Zip};

/// Recommendation codes returned by the fraud scoring service.
pub mod codes {
    pub const ALLOW: i32 = 1000;
    pub const BLOCK: i32 = 100;
    pub const CAPTCHA: i32 = 300;
    pub const FORCE_THREE_D: i32 = 400;
    pub const BYPASS_PAYMENT_TEMPLATE_VALIDATION: i32 = 500;
}

pub const SEVERITY_ALLOW: &str = "Allow";
pub const SEVERITY_BLOCK: &str = "Block";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FraudRecommendation {
    pub code: i32,
    pub severity: String,
    pub message: String,
}

impl FraudRecommendation {
    pub fn new(code: i32, severity: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code,
            severity: severity.into(),
            message: message.into(),
        }
    }

    /// Substituted whenever the fraud service cannot give an answer.
    pub fn default_allow() -> Self {
        Self::new(codes::ALLOW, SEVERITY_ALLOW, "Allow")
    }

    pub fn is_block(&self) -> bool {
        self.severity.eq_ignore_ascii_case(SEVERITY_BLOCK)
            || matches!(self.code, codes::BLOCK | codes::CAPTCHA)
    }

    pub fn requires_captcha(&self) -> bool {
        self.code == codes::CAPTCHA
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FraudRecommendationCollection(Vec<FraudRecommendation>);

impl FraudRecommendationCollection {
    pub fn new(recommendations: Vec<FraudRecommendation>) -> Self {
        Self(recommendations)
    }

    pub fn default_allow() -> Self {
        Self(vec![FraudRecommendation::default_allow()])
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FraudRecommendation> {
        self.0.iter()
    }

    pub fn has_code(&self, code: i32) -> bool {
        self.0.iter().any(|r| r.code == code)
    }

    pub fn is_blocked(&self) -> bool {
        self.0.iter().any(FraudRecommendation::is_block)
    }

    pub fn requires_captcha(&self) -> bool {
        self.0.iter().any(FraudRecommendation::requires_captcha)
    }

    pub fn is_force_three_d(&self) -> bool {
        self.has_code(codes::FORCE_THREE_D)
    }

    pub fn has_bypass_payment_template_validation(&self) -> bool {
        self.has_code(codes::BYPASS_PAYMENT_TEMPLATE_VALIDATION)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FraudAdviceError {
    #[error("process captcha cannot be validated before the init captcha was advised")]
    ProcessCaptchaBeforeInitCaptcha,
    #[error("init captcha was not advised for this purchase")]
    InitCaptchaNotAdvised,
    #[error("process captcha was not advised for this purchase")]
    ProcessCaptchaNotAdvised,
}

/// Outcome of fraud screening for one purchase.
///
/// Flags are derived from the recommendations when they are attached and
/// never recomputed afterwards. Init-time screening happens at construction;
/// process-time screening is attached at most once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FraudAdvice {
    ip: Option<Ip>,
    email: Option<Email>,
    zip: Option<Zip>,
    bin: Option<Bin>,
    recommendations: FraudRecommendationCollection,
    process_recommendations: Option<FraudRecommendationCollection>,
    force_three_d: bool,
    blocked_on_init: bool,
    blocked_on_process: bool,
    bypass_payment_template_validation: bool,
    init_captcha_advised: bool,
    init_captcha_validated: bool,
    process_captcha_advised: bool,
    process_captcha_validated: bool,
}

impl FraudAdvice {
    pub fn new(
        ip: Option<Ip>,
        email: Option<Email>,
        zip: Option<Zip>,
        bin: Option<Bin>,
        recommendations: FraudRecommendationCollection,
    ) -> Self {
        Self {
            ip,
            email,
            zip,
            bin,
            force_three_d: recommendations.is_force_three_d(),
            blocked_on_init: recommendations.is_blocked(),
            blocked_on_process: false,
            bypass_payment_template_validation: recommendations
                .has_bypass_payment_template_validation(),
            recommendations,
            process_recommendations: None,
            init_captcha_advised: false,
            init_captcha_validated: false,
            process_captcha_advised: false,
            process_captcha_validated: false,
        }
    }

    pub fn ip(&self) -> Option<&Ip> {
        self.ip.as_ref()
    }

    pub fn email(&self) -> Option<&Email> {
        self.email.as_ref()
    }

    pub fn zip(&self) -> Option<&Zip> {
        self.zip.as_ref()
    }

    pub fn bin(&self) -> Option<&Bin> {
        self.bin.as_ref()
    }

    pub fn recommendations(&self) -> &FraudRecommendationCollection {
        &self.recommendations
    }

    pub fn process_recommendations(&self) -> Option<&FraudRecommendationCollection> {
        self.process_recommendations.as_ref()
    }

    pub fn is_force_three_d(&self) -> bool {
        self.force_three_d
    }

    /// Init-time screening said block.
    pub fn is_blocked(&self) -> bool {
        self.blocked_on_init
    }

    pub fn is_blocked_on_process(&self) -> bool {
        self.blocked_on_process
    }

    pub fn has_bypass_payment_template_validation(&self) -> bool {
        self.bypass_payment_template_validation
    }

    pub fn is_init_captcha_advised(&self) -> bool {
        self.init_captcha_advised
    }

    pub fn is_init_captcha_validated(&self) -> bool {
        self.init_captcha_validated
    }

    pub fn is_process_captcha_advised(&self) -> bool {
        self.process_captcha_advised
    }

    pub fn is_process_captcha_validated(&self) -> bool {
        self.process_captcha_validated
    }

    pub fn has_process_screening(&self) -> bool {
        self.process_recommendations.is_some()
    }

    /// Attaches process-time screening. A second attachment is ignored.
    pub fn attach_process_recommendations(
        &mut self,
        bin: Option<Bin>,
        recommendations: FraudRecommendationCollection,
    ) {
        if self.process_recommendations.is_some() {
            return;
        }
        if bin.is_some() {
            self.bin = bin;
        }
        self.force_three_d |= recommendations.is_force_three_d();
        self.bypass_payment_template_validation |=
            recommendations.has_bypass_payment_template_validation();
        self.blocked_on_process = recommendations.is_blocked();
        self.process_recommendations = Some(recommendations);
    }

    pub fn mark_init_captcha_advised(&mut self) {
        self.init_captcha_advised = true;
    }

    pub fn mark_process_captcha_advised(&mut self) {
        self.process_captcha_advised = true;
    }

    pub fn validate_init_captcha(&mut self) -> Result<(), FraudAdviceError> {
        if !self.init_captcha_advised {
            return Err(FraudAdviceError::InitCaptchaNotAdvised);
        }
        self.init_captcha_validated = true;
        Ok(())
    }

    /// Process-time challenge; only valid once the init-time challenge has been advised.
    pub fn validate_process_captcha(&mut self) -> Result<(), FraudAdviceError> {
        if !self.init_captcha_advised {
            return Err(FraudAdviceError::ProcessCaptchaBeforeInitCaptcha);
        }
        if !self.process_captcha_advised {
            return Err(FraudAdviceError::ProcessCaptchaNotAdvised);
        }
        self.process_captcha_validated = true;
        Ok(())
    }

    /// Every advised challenge has been passed.
    pub fn is_captcha_cleared(&self) -> bool {
        (!self.init_captcha_advised || self.init_captcha_validated)
            && (!self.process_captcha_advised || self.process_captcha_validated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn advice(recommendations: Vec<FraudRecommendation>) -> FraudAdvice {
        FraudAdvice::new(
            Some(Ip::parse("10.10.10.10").unwrap()),
            Some(Email::parse("member@example.com").unwrap()),
            Some(Zip::parse("90210").unwrap()),
            Some(Bin::parse("411111").unwrap()),
            FraudRecommendationCollection::new(recommendations),
        )
    }

    #[test]
    fn default_allow_is_a_single_non_blocking_recommendation() {
        let collection = FraudRecommendationCollection::default_allow();
        assert_eq!(collection.len(), 1);
        assert!(!collection.is_blocked());
        assert!(!collection.has_bypass_payment_template_validation());
        assert!(!collection.is_force_three_d());
    }

    #[test]
    fn flags_are_derived_from_recommendations() {
        let advice = advice(vec![
            FraudRecommendation::new(codes::FORCE_THREE_D, "Allow", "Force 3DS"),
            FraudRecommendation::new(codes::BYPASS_PAYMENT_TEMPLATE_VALIDATION, "Allow", "Bypass"),
        ]);
        assert!(advice.is_force_three_d());
        assert!(advice.has_bypass_payment_template_validation());
        assert!(!advice.is_blocked());
    }

    #[test]
    fn captcha_clears_an_init_block() {
        let mut advice = advice(vec![FraudRecommendation::new(
            codes::CAPTCHA,
            SEVERITY_BLOCK,
            "Show captcha",
        )]);
        advice.mark_init_captcha_advised();
        assert!(advice.is_blocked());
        assert!(!advice.is_captcha_cleared());

        advice.validate_init_captcha().unwrap();
        assert!(advice.is_captcha_cleared());
        // the derived flag is never recomputed
        assert!(advice.is_blocked());
    }

    #[test]
    fn hard_block_without_captcha_stays_blocked() {
        let advice = advice(vec![FraudRecommendation::new(
            codes::BLOCK,
            SEVERITY_BLOCK,
            "Blacklisted",
        )]);
        assert!(advice.is_blocked());
    }

    #[test]
    fn process_captcha_before_init_captcha_fails() {
        let mut advice = advice(vec![FraudRecommendation::default_allow()]);
        advice.mark_process_captcha_advised();
        assert_eq!(
            advice.validate_process_captcha(),
            Err(FraudAdviceError::ProcessCaptchaBeforeInitCaptcha)
        );
        assert!(!advice.is_process_captcha_validated());
    }

    #[test]
    fn process_screening_is_attached_once() {
        let mut advice = advice(vec![FraudRecommendation::default_allow()]);
        advice.mark_init_captcha_advised();
        advice.validate_init_captcha().unwrap();
        advice.attach_process_recommendations(
            None,
            FraudRecommendationCollection::new(vec![FraudRecommendation::new(
                codes::CAPTCHA,
                SEVERITY_BLOCK,
                "Show captcha",
            )]),
        );
        advice.mark_process_captcha_advised();
        assert!(!advice.is_blocked());
        assert!(advice.is_blocked_on_process());
        assert!(!advice.is_captcha_cleared());

        advice.attach_process_recommendations(None, FraudRecommendationCollection::default_allow());
        assert!(advice.is_blocked_on_process());

        advice.validate_process_captcha().unwrap();
        assert!(advice.is_captcha_cleared());
    }
}
