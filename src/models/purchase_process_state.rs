//! Lifecycle states of a purchase process.
//!
//! Every lifecycle method consumes the current state and returns the next one,
//! or an [`IllegalStateTransition`] when the method is not legal from there.
//! `Processed` and `CascadeBillersExhausted` are absorbing: they accept
//! `finish_processing` idempotently and reject everything else, so a replayed
//! downstream event can never reopen a settled purchase.

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString};
use thiserror::Error;

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
#[serde(try_from = "String", into = "String")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum PurchaseProcessState {
    Created,
    Valid,
    BlockedDueToFraudAdvice,
    Processing,
    Pending,
    ThreeDLookupPerformed,
    ThreeDAuthenticated,
    Redirected,
    Processed,
    CascadeBillersExhausted,
}

/// Lifecycle methods, used for error reporting and table-driven dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter)]
#[strum(serialize_all = "snake_case")]
pub enum StateAction {
    Validate,
    BlockDueToFraudAdvice,
    StartProcessing,
    StartPending,
    AuthenticateThreeD,
    PerformThreeDLookup,
    Redirect,
    FinishProcessing,
    NoMoreBillersAvailable,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IllegalStateTransition {
    #[error("cannot {action} while the purchase process is {from}")]
    Action {
        from: PurchaseProcessState,
        action: StateAction,
    },
    #[error("cannot park the purchase process for a third-party biller while it is {from}")]
    ThirdPartyPending { from: PurchaseProcessState },
    #[error("unknown purchase process state: {0}")]
    UnknownState(String),
}

type Transition = Result<PurchaseProcessState, IllegalStateTransition>;

impl PurchaseProcessState {
    /// Total, case-insensitive lookup of a persisted state tag.
    pub fn restore(tag: &str) -> Transition {
        tag.trim()
            .parse()
            .map_err(|_| IllegalStateTransition::UnknownState(tag.to_string()))
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PurchaseProcessState::Processed | PurchaseProcessState::CascadeBillersExhausted
        )
    }

    fn illegal(self, action: StateAction) -> Transition {
        Err(IllegalStateTransition::Action { from: self, action })
    }

    pub fn apply(self, action: StateAction) -> Transition {
        match action {
            StateAction::Validate => self.validate(),
            StateAction::BlockDueToFraudAdvice => self.block_due_to_fraud_advice(),
            StateAction::StartProcessing => self.start_processing(),
            StateAction::StartPending => self.start_pending(),
            StateAction::AuthenticateThreeD => self.authenticate_three_d(),
            StateAction::PerformThreeDLookup => self.perform_three_d_lookup(),
            StateAction::Redirect => self.redirect(),
            StateAction::FinishProcessing => self.finish_processing(),
            StateAction::NoMoreBillersAvailable => self.no_more_billers_available(),
        }
    }

    pub fn validate(self) -> Transition {
        use PurchaseProcessState::*;
        match self {
            Created | Valid | BlockedDueToFraudAdvice | Processing | ThreeDLookupPerformed
            | ThreeDAuthenticated | Redirected => Ok(Valid),
            Pending | Processed | CascadeBillersExhausted => self.illegal(StateAction::Validate),
        }
    }

    pub fn block_due_to_fraud_advice(self) -> Transition {
        use PurchaseProcessState::*;
        match self {
            Created | Valid | BlockedDueToFraudAdvice => Ok(BlockedDueToFraudAdvice),
            Processing | Pending | ThreeDLookupPerformed | ThreeDAuthenticated | Redirected
            | Processed | CascadeBillersExhausted => {
                self.illegal(StateAction::BlockDueToFraudAdvice)
            }
        }
    }

    pub fn start_processing(self) -> Transition {
        use PurchaseProcessState::*;
        match self {
            Valid | Processing => Ok(Processing),
            Created | BlockedDueToFraudAdvice | Pending | ThreeDLookupPerformed
            | ThreeDAuthenticated | Redirected | Processed | CascadeBillersExhausted => {
                self.illegal(StateAction::StartProcessing)
            }
        }
    }

    pub fn start_pending(self) -> Transition {
        use PurchaseProcessState::*;
        match self {
            Processing => Ok(Pending),
            Created | Valid | BlockedDueToFraudAdvice | Pending | ThreeDLookupPerformed
            | ThreeDAuthenticated | Redirected | Processed | CascadeBillersExhausted => {
                self.illegal(StateAction::StartPending)
            }
        }
    }

    pub fn authenticate_three_d(self) -> Transition {
        use PurchaseProcessState::*;
        match self {
            Pending => Ok(ThreeDAuthenticated),
            Created | Valid | BlockedDueToFraudAdvice | Processing | ThreeDLookupPerformed
            | ThreeDAuthenticated | Redirected | Processed | CascadeBillersExhausted => {
                self.illegal(StateAction::AuthenticateThreeD)
            }
        }
    }

    pub fn perform_three_d_lookup(self) -> Transition {
        use PurchaseProcessState::*;
        match self {
            Pending => Ok(ThreeDLookupPerformed),
            Created | Valid | BlockedDueToFraudAdvice | Processing | ThreeDLookupPerformed
            | ThreeDAuthenticated | Redirected | Processed | CascadeBillersExhausted => {
                self.illegal(StateAction::PerformThreeDLookup)
            }
        }
    }

    pub fn redirect(self) -> Transition {
        use PurchaseProcessState::*;
        match self {
            Valid => Ok(Redirected),
            Created | BlockedDueToFraudAdvice | Processing | Pending | ThreeDLookupPerformed
            | ThreeDAuthenticated | Redirected | Processed | CascadeBillersExhausted => {
                self.illegal(StateAction::Redirect)
            }
        }
    }

    pub fn finish_processing(self) -> Transition {
        use PurchaseProcessState::*;
        match self {
            Processing | Pending | ThreeDLookupPerformed | ThreeDAuthenticated | Redirected
            | Processed => Ok(Processed),
            CascadeBillersExhausted => Ok(CascadeBillersExhausted),
            Created | Valid | BlockedDueToFraudAdvice => {
                self.illegal(StateAction::FinishProcessing)
            }
        }
    }

    /// Third-party billers cannot be retried synchronously, so selecting one
    /// parks the process in `Pending` until the member comes back.
    pub fn force_third_party_pending(self) -> Result<Self, IllegalStateTransition> {
        use PurchaseProcessState::*;
        match self {
            Valid | Processing | Pending => Ok(Pending),
            Created | BlockedDueToFraudAdvice | ThreeDLookupPerformed | ThreeDAuthenticated
            | Redirected | Processed | CascadeBillersExhausted => {
                Err(IllegalStateTransition::ThirdPartyPending { from: self })
            }
        }
    }

    pub fn no_more_billers_available(self) -> Transition {
        use PurchaseProcessState::*;
        match self {
            Valid => Ok(CascadeBillersExhausted),
            Created | BlockedDueToFraudAdvice | Processing | Pending | ThreeDLookupPerformed
            | ThreeDAuthenticated | Redirected | Processed | CascadeBillersExhausted => {
                self.illegal(StateAction::NoMoreBillersAvailable)
            }
        }
    }
}

impl TryFrom<String> for PurchaseProcessState {
    type Error = IllegalStateTransition;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::restore(&value)
    }
}

impl From<PurchaseProcessState> for String {
    fn from(state: PurchaseProcessState) -> Self {
        state.to_string()
    }
}
