//! Asset custody collaborator.
//!
//! Custody moves fungible value between members' external wallets and a
//! union's pool. The ledger never holds value itself; it only records who is
//! owed what. Value in flight is represented by [`Value`], which cannot be
//! cloned, so a released amount has to end up somewhere.

use std::collections::HashMap;
use std::sync::Mutex;

use thiserror::Error;

use creditunion_core::MemberId;
use creditunion_ledger::{AssetType, PoolId};

/// An amount of one asset taken out of custody and not yet placed anywhere.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "value dropped without being deposited is lost"]
pub struct Value {
    asset: AssetType,
    amount: u64,
}

impl Value {
    /// Only custody implementations should construct values.
    pub fn new(asset: AssetType, amount: u64) -> Self {
        Self { asset, amount }
    }

    pub fn asset(&self) -> &AssetType {
        &self.asset
    }

    pub fn amount(&self) -> u64 {
        self.amount
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CustodyError {
    #[error("unknown pool {0}")]
    UnknownPool(PoolId),

    #[error("insufficient funds (held: {held}, requested: {requested})")]
    InsufficientFunds { held: u64, requested: u64 },

    #[error("asset mismatch (expected: {expected}, found: {found})")]
    AssetMismatch { expected: AssetType, found: AssetType },

    #[error("pool {0} still holds funds")]
    PoolNotEmpty(PoolId),

    #[error("balance overflow")]
    Overflow,

    #[error("custody unavailable: {0}")]
    Unavailable(String),
}

/// A deposit that custody refused; hands the value back to the caller.
#[derive(Debug)]
pub struct Refused {
    pub error: CustodyError,
    pub value: Value,
}

/// Custody service consumed by the ledger.
///
/// Pool operations are only ever invoked by `CreditUnionService` on behalf of
/// the union that owns the pool.
pub trait AssetCustody: Send + Sync {
    /// Provision a dedicated, empty pool for a new union.
    fn create_pool(&self, asset: &AssetType) -> Result<PoolId, CustodyError>;

    /// Remove an empty pool (used to undo a union creation that failed).
    fn retire_pool(&self, pool: PoolId) -> Result<(), CustodyError>;

    /// Take `amount` out of the caller's external wallet.
    fn withdraw_from_caller(
        &self,
        caller: MemberId,
        asset: &AssetType,
        amount: u64,
    ) -> Result<Value, CustodyError>;

    fn deposit_to_pool(&self, pool: PoolId, value: Value) -> Result<(), Refused>;

    fn release_from_pool(&self, pool: PoolId, amount: u64) -> Result<Value, CustodyError>;

    fn deposit_to_wallet(&self, owner: MemberId, value: Value) -> Result<(), Refused>;

    fn wallet_balance(&self, owner: MemberId, asset: &AssetType) -> u64;

    fn pool_balance(&self, pool: PoolId) -> Result<u64, CustodyError>;
}

impl<C> AssetCustody for std::sync::Arc<C>
where
    C: AssetCustody + ?Sized,
{
    fn create_pool(&self, asset: &AssetType) -> Result<PoolId, CustodyError> {
        (**self).create_pool(asset)
    }

    fn retire_pool(&self, pool: PoolId) -> Result<(), CustodyError> {
        (**self).retire_pool(pool)
    }

    fn withdraw_from_caller(
        &self,
        caller: MemberId,
        asset: &AssetType,
        amount: u64,
    ) -> Result<Value, CustodyError> {
        (**self).withdraw_from_caller(caller, asset, amount)
    }

    fn deposit_to_pool(&self, pool: PoolId, value: Value) -> Result<(), Refused> {
        (**self).deposit_to_pool(pool, value)
    }

    fn release_from_pool(&self, pool: PoolId, amount: u64) -> Result<Value, CustodyError> {
        (**self).release_from_pool(pool, amount)
    }

    fn deposit_to_wallet(&self, owner: MemberId, value: Value) -> Result<(), Refused> {
        (**self).deposit_to_wallet(owner, value)
    }

    fn wallet_balance(&self, owner: MemberId, asset: &AssetType) -> u64 {
        (**self).wallet_balance(owner, asset)
    }

    fn pool_balance(&self, pool: PoolId) -> Result<u64, CustodyError> {
        (**self).pool_balance(pool)
    }
}

#[derive(Debug)]
struct Pool {
    asset: AssetType,
    balance: u64,
}

#[derive(Debug, Default)]
struct Holdings {
    wallets: HashMap<(MemberId, AssetType), u64>,
    pools: HashMap<PoolId, Pool>,
}

/// In-memory custody for tests/dev. Wallets are funded with [`InMemoryCustody::mint`].
#[derive(Debug, Default)]
pub struct InMemoryCustody {
    holdings: Mutex<Holdings>,
}

impl InMemoryCustody {
    pub fn new() -> Self {
        Self::default()
    }

    /// Credit a wallet out of thin air.
    pub fn mint(&self, owner: MemberId, asset: &AssetType, amount: u64) -> Result<(), CustodyError> {
        let mut h = self.lock()?;
        let slot = h.wallets.entry((owner, asset.clone())).or_default();
        *slot = slot.checked_add(amount).ok_or(CustodyError::Overflow)?;
        Ok(())
    }

    /// Sum of every wallet and pool holding `asset`.
    pub fn total_supply(&self, asset: &AssetType) -> u128 {
        let Ok(h) = self.lock() else { return 0 };
        let wallets: u128 = h
            .wallets
            .iter()
            .filter(|((_, a), _)| a == asset)
            .map(|(_, v)| u128::from(*v))
            .sum();
        let pools: u128 = h
            .pools
            .values()
            .filter(|p| &p.asset == asset)
            .map(|p| u128::from(p.balance))
            .sum();
        wallets + pools
    }

    /// Number of live (not retired) pools.
    pub fn pool_count(&self) -> usize {
        self.lock().map(|h| h.pools.len()).unwrap_or(0)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Holdings>, CustodyError> {
        self.holdings
            .lock()
            .map_err(|_| CustodyError::Unavailable("lock poisoned".to_string()))
    }
}

impl AssetCustody for InMemoryCustody {
    fn create_pool(&self, asset: &AssetType) -> Result<PoolId, CustodyError> {
        let pool = PoolId::new();
        self.lock()?.pools.insert(
            pool,
            Pool {
                asset: asset.clone(),
                balance: 0,
            },
        );
        Ok(pool)
    }

    fn retire_pool(&self, pool: PoolId) -> Result<(), CustodyError> {
        let mut h = self.lock()?;
        match h.pools.get(&pool) {
            None => Err(CustodyError::UnknownPool(pool)),
            Some(p) if p.balance > 0 => Err(CustodyError::PoolNotEmpty(pool)),
            Some(_) => {
                h.pools.remove(&pool);
                Ok(())
            }
        }
    }

    fn withdraw_from_caller(
        &self,
        caller: MemberId,
        asset: &AssetType,
        amount: u64,
    ) -> Result<Value, CustodyError> {
        let mut h = self.lock()?;
        let held = h.wallets.get(&(caller, asset.clone())).copied().unwrap_or(0);
        if held < amount {
            return Err(CustodyError::InsufficientFunds {
                held,
                requested: amount,
            });
        }
        h.wallets.insert((caller, asset.clone()), held - amount);
        Ok(Value::new(asset.clone(), amount))
    }

    fn deposit_to_pool(&self, pool: PoolId, value: Value) -> Result<(), Refused> {
        let mut h = match self.lock() {
            Ok(h) => h,
            Err(error) => return Err(Refused { error, value }),
        };
        let Some(p) = h.pools.get_mut(&pool) else {
            return Err(Refused {
                error: CustodyError::UnknownPool(pool),
                value,
            });
        };
        if p.asset != value.asset {
            return Err(Refused {
                error: CustodyError::AssetMismatch {
                    expected: p.asset.clone(),
                    found: value.asset.clone(),
                },
                value,
            });
        }
        match p.balance.checked_add(value.amount) {
            Some(next) => {
                p.balance = next;
                Ok(())
            }
            None => Err(Refused {
                error: CustodyError::Overflow,
                value,
            }),
        }
    }

    fn release_from_pool(&self, pool: PoolId, amount: u64) -> Result<Value, CustodyError> {
        let mut h = self.lock()?;
        let p = h.pools.get_mut(&pool).ok_or(CustodyError::UnknownPool(pool))?;
        if p.balance < amount {
            return Err(CustodyError::InsufficientFunds {
                held: p.balance,
                requested: amount,
            });
        }
        p.balance -= amount;
        Ok(Value::new(p.asset.clone(), amount))
    }

    fn deposit_to_wallet(&self, owner: MemberId, value: Value) -> Result<(), Refused> {
        let mut h = match self.lock() {
            Ok(h) => h,
            Err(error) => return Err(Refused { error, value }),
        };
        let slot = h.wallets.entry((owner, value.asset.clone())).or_default();
        match slot.checked_add(value.amount) {
            Some(next) => {
                *slot = next;
                Ok(())
            }
            None => Err(Refused {
                error: CustodyError::Overflow,
                value,
            }),
        }
    }

    fn wallet_balance(&self, owner: MemberId, asset: &AssetType) -> u64 {
        self.lock()
            .ok()
            .and_then(|h| h.wallets.get(&(owner, asset.clone())).copied())
            .unwrap_or(0)
    }

    fn pool_balance(&self, pool: PoolId) -> Result<u64, CustodyError> {
        self.lock()?
            .pools
            .get(&pool)
            .map(|p| p.balance)
            .ok_or(CustodyError::UnknownPool(pool))
    }
}
