use serde::{Deserialize, Serialize};

use creditunion_core::{DomainError, DomainResult, Entity, MemberId};

/// A member's position in one union.
///
/// `staked_amount` is the part of `balance` locked as collateral behind loan
/// vouches. Staked funds stay in the balance (and in the union's pooled
/// total) but cannot be withdrawn or pledged a second time, which keeps
/// `staked_amount <= balance` true after every operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberAccount {
    member: MemberId,
    balance: u64,
    staked_amount: u64,
}

impl MemberAccount {
    /// Fresh account for a newly admitted member.
    pub fn open(member: MemberId) -> Self {
        Self {
            member,
            balance: 0,
            staked_amount: 0,
        }
    }

    pub fn member(&self) -> MemberId {
        self.member
    }

    pub fn balance(&self) -> u64 {
        self.balance
    }

    pub fn staked_amount(&self) -> u64 {
        self.staked_amount
    }

    /// Funds that are neither withdrawn nor pledged.
    pub fn available(&self) -> u64 {
        self.balance.saturating_sub(self.staked_amount)
    }

    pub fn ensure_can_deposit(&self, amount: u64) -> DomainResult<()> {
        self.balance
            .checked_add(amount)
            .map(|_| ())
            .ok_or_else(|| DomainError::validation("balance overflow"))
    }

    /// `balance >= amount`, then `balance - amount >= staked_amount`.
    pub fn ensure_can_withdraw(&self, amount: u64) -> DomainResult<()> {
        if self.balance < amount {
            return Err(DomainError::InsufficientBalance {
                available: self.balance,
                requested: amount,
            });
        }
        if self.balance - amount < self.staked_amount {
            return Err(DomainError::CannotWithdrawStaked {
                balance: self.balance,
                staked: self.staked_amount,
                requested: amount,
            });
        }
        Ok(())
    }

    pub fn ensure_can_stake(&self, amount: u64) -> DomainResult<()> {
        let available = self.available();
        if available < amount {
            return Err(DomainError::InsufficientBalance {
                available,
                requested: amount,
            });
        }
        Ok(())
    }

    pub(crate) fn credit(&mut self, amount: u64) {
        self.balance = self.balance.saturating_add(amount);
    }

    pub(crate) fn debit(&mut self, amount: u64) {
        self.balance = self.balance.saturating_sub(amount);
    }

    pub(crate) fn stake(&mut self, amount: u64) {
        self.staked_amount = self.staked_amount.saturating_add(amount);
    }
}

impl Entity for MemberAccount {
    type Id = MemberId;

    fn id(&self) -> &Self::Id {
        &self.member
    }
}
