use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

use super::biller::BillerName;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TransactionState {
    Approved,
    Declined,
    Pending,
    /// Outcome unknown, e.g. the biller call timed out. Treated as failed.
    Aborted,
}

/// 3-D Secure challenge data handed back by a biller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreeDChallenge {
    pub authentication_url: String,
    pub pareq: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub transaction_id: Uuid,
    pub biller_name: BillerName,
    pub state: TransactionState,
    pub submit_number: u32,
    pub is_nsf: bool,
    pub three_d: Option<ThreeDChallenge>,
    pub redirect_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Transaction {
    pub fn new(biller_name: BillerName, state: TransactionState, submit_number: u32) -> Self {
        Self {
            transaction_id: Uuid::new_v4(),
            biller_name,
            state,
            submit_number,
            is_nsf: false,
            three_d: None,
            redirect_url: None,
            created_at: Utc::now(),
        }
    }

    pub fn aborted(biller_name: BillerName, submit_number: u32) -> Self {
        Self::new(biller_name, TransactionState::Aborted, submit_number)
    }

    pub fn is_approved(&self) -> bool {
        self.state == TransactionState::Approved
    }

    pub fn is_pending(&self) -> bool {
        self.state == TransactionState::Pending
    }
}

/// A product the member is buying: the main item or a cross-sale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitializedItem {
    pub item_id: Uuid,
    pub site_id: Uuid,
    pub bundle_id: Option<Uuid>,
    pub amount: Decimal,
    pub is_cross_sale: bool,
    pub is_cross_sale_selected: bool,
    transactions: Vec<Transaction>,
}

impl InitializedItem {
    pub fn main(site_id: Uuid, amount: Decimal) -> Self {
        Self {
            item_id: Uuid::new_v4(),
            site_id,
            bundle_id: None,
            amount,
            is_cross_sale: false,
            is_cross_sale_selected: false,
            transactions: Vec::new(),
        }
    }

    pub fn cross_sale(site_id: Uuid, amount: Decimal) -> Self {
        Self {
            is_cross_sale: true,
            ..Self::main(site_id, amount)
        }
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    pub fn last_transaction(&self) -> Option<&Transaction> {
        self.transactions.last()
    }

    pub fn last_transaction_mut(&mut self) -> Option<&mut Transaction> {
        self.transactions.last_mut()
    }

    pub fn add_transaction(&mut self, transaction: Transaction) {
        self.transactions.push(transaction);
    }

    pub fn was_successful(&self) -> bool {
        self.last_transaction()
            .map(Transaction::is_approved)
            .unwrap_or(false)
    }
}
