use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::biller::{Biller, BillerName};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CascadeError {
    #[error("no more billers available in the cascade")]
    InvalidNextBiller,
    #[error("a cascade needs at least one biller")]
    Empty,
    #[error("biller {0} is not part of the cascade")]
    BillerNotInCascade(BillerName),
    #[error("cascade position {position} is outside its {len} billers")]
    PositionOutOfRange { position: usize, len: usize },
    #[error("submit {submit_number} is beyond the {max_submits} allowed for biller {biller}")]
    SubmitOutOfRange {
        biller: BillerName,
        submit_number: u32,
        max_submits: u32,
    },
}

/// Ordered retry plan across billers for one purchase attempt.
///
/// The biller list is fixed at construction. `submit_number` is the zero-based
/// index of the submission currently in flight against the current biller, so
/// a biller with `max_submits = n` is used for submissions `0..n`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "CascadeRecord")]
pub struct Cascade {
    billers: Vec<Biller>,
    current: usize,
    submit_number: u32,
}

/// Wire shape of a [`Cascade`]; checked before it becomes one.
#[derive(Deserialize)]
struct CascadeRecord {
    billers: Vec<Biller>,
    current: usize,
    submit_number: u32,
}

impl TryFrom<CascadeRecord> for Cascade {
    type Error = CascadeError;

    fn try_from(record: CascadeRecord) -> Result<Self, Self::Error> {
        let mut cascade = Self::new(record.billers)?;
        if record.current >= cascade.billers.len() {
            return Err(CascadeError::PositionOutOfRange {
                position: record.current,
                len: cascade.billers.len(),
            });
        }
        cascade.current = record.current;
        cascade.set_submit_number(record.submit_number)?;
        Ok(cascade)
    }
}

impl Cascade {
    pub fn new(billers: Vec<Biller>) -> Result<Self, CascadeError> {
        if billers.is_empty() {
            return Err(CascadeError::Empty);
        }
        Ok(Self {
            billers,
            current: 0,
            submit_number: 0,
        })
    }

    /// Rebuilds a cascade at an in-flight position, e.g. after a 3-D Secure round trip.
    pub fn resume(
        billers: Vec<Biller>,
        current_biller: BillerName,
        submit_number: u32,
    ) -> Result<Self, CascadeError> {
        let mut cascade = Self::new(billers)?;
        cascade.current = cascade
            .billers
            .iter()
            .position(|b| b.name() == current_biller)
            .ok_or(CascadeError::BillerNotInCascade(current_biller))?;
        cascade.set_submit_number(submit_number)?;
        Ok(cascade)
    }

    fn set_submit_number(&mut self, submit_number: u32) -> Result<(), CascadeError> {
        let biller = self.current_biller();
        if submit_number >= biller.max_submits() {
            return Err(CascadeError::SubmitOutOfRange {
                biller: biller.name(),
                submit_number,
                max_submits: biller.max_submits(),
            });
        }
        self.submit_number = submit_number;
        Ok(())
    }

    pub fn billers(&self) -> &[Biller] {
        &self.billers
    }

    pub fn current_biller(&self) -> Biller {
        self.billers[self.current]
    }

    pub fn current_position(&self) -> usize {
        self.current
    }

    pub fn submit_number(&self) -> u32 {
        self.submit_number
    }

    /// True when the submission in flight is the last one the current biller allows.
    pub fn is_retry_limit_reached(&self) -> bool {
        self.submit_number.saturating_add(1) >= self.current_biller().max_submits()
    }

    pub fn has_next_biller(&self) -> bool {
        self.current + 1 < self.billers.len()
    }

    /// Nothing left to try: last biller, last submission.
    pub fn is_exhausted(&self) -> bool {
        self.is_retry_limit_reached() && !self.has_next_biller()
    }

    pub fn next_biller_is_third_party(&self) -> bool {
        self.billers
            .get(self.current + 1)
            .map(|b| b.is_third_party())
            .unwrap_or(false)
    }

    /// Moves to the next submission: another attempt on the same biller while
    /// it has submits left, otherwise the first submission of the next biller.
    pub fn next_biller(&mut self) -> Result<Biller, CascadeError> {
        if !self.is_retry_limit_reached() {
            self.submit_number += 1;
            return Ok(self.current_biller());
        }

        if !self.has_next_biller() {
            return Err(CascadeError::InvalidNextBiller);
        }

        self.current += 1;
        self.submit_number = 0;
        Ok(self.current_biller())
    }
}
