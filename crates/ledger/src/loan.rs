use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use creditunion_core::{Entity, MemberId, ValueObject};

/// One member's pledge toward a loan (immutable once recorded).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Voucher {
    pub voucher: MemberId,
    pub amount: u64,
    pub interest_rate: u64,
}

impl ValueObject for Voucher {}

/// Loan lifecycle, derived from the voucher list on every read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoanStatus {
    Requested,
    PartiallyVouched,
    Approved,
}

/// A borrower's loan request and the vouches recorded against it.
///
/// `interest_rate` and `due_date` are derived: zero / `None` until the first
/// vouch, then recomputed on every vouch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Loan {
    borrower: MemberId,
    amount: u64,
    interest_rate: u64,
    due_date: Option<DateTime<Utc>>,
    vouchers: Vec<Voucher>,
}

impl Loan {
    pub fn request(borrower: MemberId, amount: u64) -> Self {
        Self {
            borrower,
            amount,
            interest_rate: 0,
            due_date: None,
            vouchers: Vec::new(),
        }
    }

    pub fn borrower(&self) -> MemberId {
        self.borrower
    }

    /// Requested principal.
    pub fn amount(&self) -> u64 {
        self.amount
    }

    pub fn interest_rate(&self) -> u64 {
        self.interest_rate
    }

    pub fn due_date(&self) -> Option<DateTime<Utc>> {
        self.due_date
    }

    /// Vouches in the order they were recorded.
    pub fn vouchers(&self) -> &[Voucher] {
        &self.vouchers
    }

    /// Total amount pledged so far.
    pub fn funded(&self) -> u64 {
        self.vouchers
            .iter()
            .fold(0u64, |acc, v| acc.saturating_add(v.amount))
    }

    pub fn is_approved(&self) -> bool {
        self.funded() >= self.amount
    }

    pub fn status(&self) -> LoanStatus {
        if self.is_approved() {
            LoanStatus::Approved
        } else if self.vouchers.is_empty() {
            LoanStatus::Requested
        } else {
            LoanStatus::PartiallyVouched
        }
    }

    /// Whether recording one more pledge of `amount` is the vouch that first
    /// reaches the requested principal.
    pub fn crosses_threshold_with(&self, amount: u64) -> bool {
        !self.is_approved() && self.funded().saturating_add(amount) >= self.amount
    }

    /// Rate the loan would carry after an additional vouch.
    pub fn rate_with(&self, extra: &Voucher) -> u64 {
        weighted_interest_rate(self.vouchers.iter().chain(core::iter::once(extra)))
    }

    pub(crate) fn record_vouch(&mut self, voucher: Voucher, due_date: DateTime<Utc>) {
        self.vouchers.push(voucher);
        self.interest_rate = weighted_interest_rate(self.vouchers.iter());
        self.due_date = Some(due_date);
    }
}

impl Entity for Loan {
    type Id = MemberId;

    fn id(&self) -> &Self::Id {
        &self.borrower
    }
}

/// `Σ(amount × rate) / Σ amount`, truncating. Zero for an empty set.
pub fn weighted_interest_rate<'a>(vouchers: impl IntoIterator<Item = &'a Voucher>) -> u64 {
    let (weighted, total) = vouchers.into_iter().fold((0u128, 0u128), |(w, t), v| {
        (
            w + u128::from(v.amount) * u128::from(v.interest_rate),
            t + u128::from(v.amount),
        )
    });

    if total == 0 {
        return 0;
    }
    // A weighted mean never exceeds the largest rate, so it fits back into u64.
    u64::try_from(weighted / total).unwrap_or(u64::MAX)
}
