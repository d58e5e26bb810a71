//! Credit union entry points.
//!
//! `CreditUnionService` is what callers talk to. Every operation is one
//! transaction against one union stream:
//!
//! 1. take the union's lock (transactions on one union never interleave)
//! 2. rehydrate the union and decide (all preconditions, no writes)
//! 3. move value through custody, if the operation touches the pool
//! 4. append the events (optimistic check against the decided revision)
//! 5. publish notifications
//!
//! A failure in step 3 leaves the stream untouched. A failure in step 4 undoes
//! step 3 before the error is returned. A failure in step 5 is logged only.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value as JsonValue;
use tracing::{error, info, instrument, warn};

use creditunion_core::{DomainError, MemberId, UnionId};
use creditunion_events::{EventBus, EventEnvelope};
use creditunion_ledger::{
    AGGREGATE_TYPE, AssetType, CreateUnion, CreditUnion, Deposit, JoinUnion, Loan, LoanStatus,
    MemberAccount, PoolId, RequestLoan, UnionCommand, UnionConfig, VouchForLoan, Withdraw,
    event_types,
};

use crate::clock::Clock;
use crate::command_dispatcher::{CommandDispatcher, DispatchError};
use crate::config::ServiceConfig;
use crate::custody::{AssetCustody, Value};
use crate::event_store::EventStore;

/// Public surface of the credit union ledger.
///
/// ## Execution Guarantees
///
/// - **Serialized per union**: every write runs under that union's lock, so
///   the decision, the custody transfer and the append see one consistent
///   revision. Different unions never contend.
/// - **Lock table only holds real unions**: a lock is registered when a union
///   is created (or first seen in the store); operations on unknown ids fail
///   with `NotInitialized` without leaving anything behind.
/// - **Custody follows the ledger**: value moves only after the decision
///   succeeded, and moves back if the append fails.
/// - **Optimistic append**: the append is checked against the decided
///   revision. A lost race undoes the transfer and re-runs the whole
///   transaction, up to `ServiceConfig::max_conflict_retries` times.
///
/// ## Error Semantics
///
/// - `DispatchError::Domain`: a precondition failed. Nothing was written,
///   moved or published.
/// - `DispatchError::Custody`: custody refused the transfer. Nothing was
///   written; value already taken from a wallet is handed back. The one
///   exception is a refused wallet credit in `withdraw_to_wallet`, which is
///   reversed by a compensating deposit.
/// - `DispatchError::Concurrency` / `Store`: the append failed and the
///   transfer was undone.
///
/// Queries rehydrate from the stream on every call and take no lock.
pub struct CreditUnionService<S, B, C, K> {
    dispatcher: CommandDispatcher<S, B>,
    custody: C,
    clock: K,
    config: ServiceConfig,
    locks: Mutex<HashMap<UnionId, Arc<Mutex<()>>>>,
}

impl<S, B, C, K> CreditUnionService<S, B, C, K>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
    C: AssetCustody,
    K: Clock,
{
    pub fn new(store: S, bus: B, custody: C, clock: K, config: ServiceConfig) -> Self {
        Self {
            dispatcher: CommandDispatcher::new(store, bus, AGGREGATE_TYPE),
            custody,
            clock,
            config,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn custody(&self) -> &C {
        &self.custody
    }

    /// Create a union with its own custodial pool. The creator does not
    /// become a member.
    #[instrument(skip_all, fields(creator = %creator, min_rate = min_rate, max_rate = max_rate), err)]
    pub fn create_union(
        &self,
        creator: MemberId,
        name: impl Into<String>,
        min_rate: u64,
        max_rate: u64,
    ) -> Result<UnionId, DispatchError> {
        let union_id = UnionId::new();
        let name = name.into();
        let pool = self.custody.create_pool(&self.config.asset)?;

        let command = UnionCommand::CreateUnion(CreateUnion {
            union_id,
            creator,
            name: name.clone(),
            asset: self.config.asset.clone(),
            min_interest_rate: min_rate,
            max_interest_rate: max_rate,
            pool,
            occurred_at: self.clock.now(),
        });

        // Fresh id: no other writer can reach this stream until it is returned.
        match self.dispatch(union_id, command) {
            Ok(()) => {
                self.register_lock(union_id);
                info!(union_id = %union_id, %pool, name = %name, "union created");
                Ok(union_id)
            }
            Err(e) => {
                if let Err(undo) = self.custody.retire_pool(pool) {
                    error!(%pool, error = %undo, "failed to retire pool of rejected union");
                }
                Err(e)
            }
        }
    }

    #[instrument(skip_all, fields(union_id = %union_id, member = %member), err)]
    pub fn join_union(&self, member: MemberId, union_id: UnionId) -> Result<(), DispatchError> {
        let command = UnionCommand::JoinUnion(JoinUnion {
            union_id,
            member,
            occurred_at: self.clock.now(),
        });

        self.locked(union_id, || self.dispatch(union_id, command))?;
        info!("member joined");
        Ok(())
    }

    /// Move `amount` from the member's wallet into the union's pool and
    /// credit their balance.
    #[instrument(skip_all, fields(union_id = %union_id, member = %member, amount = amount), err)]
    pub fn deposit(
        &self,
        member: MemberId,
        union_id: UnionId,
        asset: &AssetType,
        amount: u64,
    ) -> Result<(), DispatchError> {
        let command = UnionCommand::Deposit(Deposit {
            union_id,
            member,
            asset: asset.clone(),
            amount,
            occurred_at: self.clock.now(),
        });

        self.transact(
            union_id,
            command,
            |config| {
                let value = self.custody.withdraw_from_caller(member, &config.asset, amount)?;
                self.custody.deposit_to_pool(config.pool, value).map_err(|refused| {
                    self.restore_to_wallet(member, refused.value);
                    DispatchError::Custody(refused.error)
                })
            },
            |config, ()| {
                match self.custody.release_from_pool(config.pool, amount) {
                    Ok(value) => self.restore_to_wallet(member, value),
                    Err(e) => error!(pool = %config.pool, error = %e, "failed to undo deposit"),
                }
            },
            |_, ()| Ok(()),
        )?;

        info!("deposit recorded");
        Ok(())
    }

    /// Debit the member's balance and hand the released value to the caller.
    #[instrument(skip_all, fields(union_id = %union_id, member = %member, amount = amount), err)]
    pub fn withdraw(
        &self,
        member: MemberId,
        union_id: UnionId,
        asset: &AssetType,
        amount: u64,
    ) -> Result<Value, DispatchError> {
        let command = self.withdraw_command(member, union_id, asset, amount);

        let value = self.transact(
            union_id,
            command,
            |config| Ok(self.custody.release_from_pool(config.pool, amount)?),
            |config, value| self.restore_to_pool(config.pool, value),
            |_, value| Ok(value),
        )?;

        info!("withdrawal recorded");
        Ok(value)
    }

    /// `withdraw`, with the released value credited to the member's own
    /// wallet.
    ///
    /// The value is released from the pool before the append and credited to
    /// the wallet only after it, while the union lock is still held. An append
    /// failure therefore only has to return value to the pool, never to pull
    /// it back out of a wallet other unions can also reach. If custody then
    /// refuses the wallet credit, the withdrawal is reversed with a
    /// compensating deposit and the custody error is returned.
    #[instrument(skip_all, fields(union_id = %union_id, member = %member, amount = amount), err)]
    pub fn withdraw_to_wallet(
        &self,
        member: MemberId,
        union_id: UnionId,
        asset: &AssetType,
        amount: u64,
    ) -> Result<(), DispatchError> {
        let command = self.withdraw_command(member, union_id, asset, amount);

        self.transact(
            union_id,
            command,
            |config| Ok(self.custody.release_from_pool(config.pool, amount)?),
            |config, value| self.restore_to_pool(config.pool, value),
            |config, value| match self.custody.deposit_to_wallet(member, value) {
                Ok(()) => Ok(()),
                Err(refused) => {
                    self.refund(union_id, member, config, refused.value);
                    Err(DispatchError::Custody(refused.error))
                }
            },
        )?;

        info!("withdrawal to wallet recorded");
        Ok(())
    }

    #[instrument(skip_all, fields(union_id = %union_id, borrower = %borrower, amount = amount), err)]
    pub fn request_loan(
        &self,
        borrower: MemberId,
        union_id: UnionId,
        amount: u64,
    ) -> Result<(), DispatchError> {
        let command = UnionCommand::RequestLoan(RequestLoan {
            union_id,
            borrower,
            amount,
            occurred_at: self.clock.now(),
        });

        self.locked(union_id, || self.dispatch(union_id, command))?;
        info!("loan requested");
        Ok(())
    }

    /// Pledge `amount` of the voucher's funds toward `borrower`'s loan at
    /// `interest_rate`.
    #[instrument(
        skip_all,
        fields(union_id = %union_id, voucher = %voucher, borrower = %borrower, amount = amount, interest_rate = interest_rate),
        err
    )]
    pub fn vouch_for_loan(
        &self,
        voucher: MemberId,
        union_id: UnionId,
        borrower: MemberId,
        amount: u64,
        interest_rate: u64,
    ) -> Result<(), DispatchError> {
        let command = UnionCommand::VouchForLoan(VouchForLoan {
            union_id,
            voucher,
            borrower,
            amount,
            interest_rate,
            loan_term_days: self.config.loan_term_days,
            occurred_at: self.clock.now(),
        });

        let stored = self.locked(union_id, || {
            self.dispatcher
                .dispatch(union_id, command, CreditUnion::empty, self.config.max_conflict_retries)
                .inspect_err(log_rejection)
        })?;

        info!("vouch recorded");
        if stored.iter().any(|e| e.event_type == event_types::LOAN_APPROVED) {
            info!("loan approved");
        }
        Ok(())
    }

    /// Current state of a union (rehydrated from its stream).
    pub fn union(&self, union_id: UnionId) -> Result<CreditUnion, DispatchError> {
        let (union, _) = self.dispatcher.load(union_id, CreditUnion::empty)?;
        if !union.is_created() {
            return Err(DomainError::NotInitialized.into());
        }
        Ok(union)
    }

    pub fn is_member(&self, union_id: UnionId, member: MemberId) -> Result<bool, DispatchError> {
        Ok(self.union(union_id)?.is_member(member))
    }

    pub fn account(&self, union_id: UnionId, member: MemberId) -> Result<MemberAccount, DispatchError> {
        self.union(union_id)?
            .account(member)
            .cloned()
            .ok_or_else(|| DomainError::NotMember(member).into())
    }

    /// Balance that can be withdrawn right now (balance minus stake).
    pub fn withdrawable(&self, union_id: UnionId, member: MemberId) -> Result<u64, DispatchError> {
        Ok(self.account(union_id, member)?.available())
    }

    pub fn loan(&self, union_id: UnionId, borrower: MemberId) -> Result<Loan, DispatchError> {
        self.union(union_id)?
            .loan(borrower)
            .cloned()
            .ok_or_else(|| DomainError::LoanNotFound(borrower).into())
    }

    pub fn loan_status(&self, union_id: UnionId, borrower: MemberId) -> Result<LoanStatus, DispatchError> {
        Ok(self.loan(union_id, borrower)?.status())
    }

    pub fn pool_balance(&self, union_id: UnionId) -> Result<u64, DispatchError> {
        let pool = self.pool_of(union_id)?;
        Ok(self.custody.pool_balance(pool)?)
    }

    fn pool_of(&self, union_id: UnionId) -> Result<PoolId, DispatchError> {
        self.union(union_id)?
            .pool()
            .ok_or_else(|| DomainError::NotInitialized.into())
    }

    fn withdraw_command(
        &self,
        member: MemberId,
        union_id: UnionId,
        asset: &AssetType,
        amount: u64,
    ) -> UnionCommand {
        UnionCommand::Withdraw(Withdraw {
            union_id,
            member,
            asset: asset.clone(),
            amount,
            occurred_at: self.clock.now(),
        })
    }

    fn dispatch(&self, union_id: UnionId, command: UnionCommand) -> Result<(), DispatchError> {
        self.dispatcher
            .dispatch(union_id, command, CreditUnion::empty, self.config.max_conflict_retries)
            .map(|_| ())
            .inspect_err(log_rejection)
    }

    /// Run a command whose effect includes a custody transfer.
    ///
    /// Under the union lock: decide, `transfer`, append. `undo` receives the
    /// transfer's output if the append fails; `settle` receives it after a
    /// successful append, still under the lock.
    fn transact<T, R>(
        &self,
        union_id: UnionId,
        command: UnionCommand,
        transfer: impl Fn(&UnionConfig) -> Result<T, DispatchError>,
        undo: impl Fn(&UnionConfig, T),
        settle: impl FnOnce(&UnionConfig, T) -> Result<R, DispatchError>,
    ) -> Result<R, DispatchError> {
        self.locked(union_id, || {
            let mut attempt = 0;

            loop {
                let decision = self
                    .dispatcher
                    .decide(union_id, &command, CreditUnion::empty)
                    .inspect_err(log_rejection)?;
                let config = decision
                    .aggregate
                    .config()
                    .cloned()
                    .ok_or(DispatchError::Domain(DomainError::NotInitialized))?;

                let output = transfer(&config)?;

                match self.dispatcher.commit(union_id, &decision) {
                    Ok(_) => return settle(&config, output),
                    Err(e) => {
                        undo(&config, output);
                        if e.is_conflict() && attempt < self.config.max_conflict_retries {
                            attempt += 1;
                            warn!(union_id = %union_id, attempt, "append conflict after transfer, retrying");
                            continue;
                        }
                        log_rejection(&e);
                        return Err(e);
                    }
                }
            }
        })
    }

    /// Reverse a committed withdrawal whose value could not be delivered:
    /// the value goes back to the pool and the member's balance is credited
    /// again. Caller holds the union lock.
    fn refund(&self, union_id: UnionId, member: MemberId, config: &UnionConfig, value: Value) {
        let amount = value.amount();
        if let Err(refused) = self.custody.deposit_to_pool(config.pool, value) {
            error!(
                %member,
                amount,
                error = %refused.error,
                "failed to return undeliverable withdrawal to pool"
            );
            return;
        }

        let command = UnionCommand::Deposit(Deposit {
            union_id,
            member,
            asset: config.asset.clone(),
            amount,
            occurred_at: self.clock.now(),
        });
        match self.dispatch(union_id, command) {
            Ok(()) => warn!(%member, amount, "wallet refused withdrawal; balance re-credited"),
            Err(e) => error!(%member, amount, error = %e, "failed to re-credit undeliverable withdrawal"),
        }
    }

    /// Run `f` under the union's transaction lock.
    fn locked<R>(
        &self,
        union_id: UnionId,
        f: impl FnOnce() -> Result<R, DispatchError>,
    ) -> Result<R, DispatchError> {
        let lock = self.union_lock(union_id).inspect_err(log_rejection)?;
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        f()
    }

    /// Lock of an existing union. Unions created by another service over the
    /// same store are registered on first use; unknown ids are rejected
    /// without touching the table.
    ///
    /// Poisoning is ignored: state lives in the stream, not behind the mutex.
    fn union_lock(&self, union_id: UnionId) -> Result<Arc<Mutex<()>>, DispatchError> {
        if let Some(lock) = self.lock_table().get(&union_id) {
            return Ok(lock.clone());
        }
        if self.dispatcher.store().load_stream(union_id)?.is_empty() {
            return Err(DomainError::NotInitialized.into());
        }
        Ok(self.register_lock(union_id))
    }

    fn register_lock(&self, union_id: UnionId) -> Arc<Mutex<()>> {
        self.lock_table().entry(union_id).or_default().clone()
    }

    fn lock_table(&self) -> MutexGuard<'_, HashMap<UnionId, Arc<Mutex<()>>>> {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of unions with a registered transaction lock.
    pub fn tracked_unions(&self) -> usize {
        self.lock_table().len()
    }

    fn restore_to_wallet(&self, member: MemberId, value: Value) {
        if let Err(refused) = self.custody.deposit_to_wallet(member, value) {
            error!(
                %member,
                amount = refused.value.amount(),
                error = %refused.error,
                "failed to return value to wallet"
            );
        }
    }

    fn restore_to_pool(&self, pool: PoolId, value: Value) {
        if let Err(refused) = self.custody.deposit_to_pool(pool, value) {
            error!(
                %pool,
                amount = refused.value.amount(),
                error = %refused.error,
                "failed to return value to pool"
            );
        }
    }
}

fn log_rejection(e: &DispatchError) {
    match e {
        DispatchError::Domain(d) => warn!(code = d.code(), error = %d, "operation rejected"),
        other => error!(error = %other, "operation failed"),
    }
}
