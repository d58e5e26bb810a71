use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use creditunion_core::{Aggregate, AggregateRoot, DomainError, DomainResult, MemberId, UnionId};
use creditunion_events::Event;

use crate::account::MemberAccount;
use crate::loan::{Loan, Voucher};

/// Stream type for union event streams.
pub const AGGREGATE_TYPE: &str = "creditunion.union";

/// Default loan term applied on every vouch.
pub const DEFAULT_LOAN_TERM_DAYS: u32 = 30;

/// Opaque handle to the union's custodial pool.
///
/// Issued once by the custody service at union creation and never reassigned.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PoolId(Uuid);

impl PoolId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for PoolId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for PoolId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "pool:{}", self.0)
    }
}

/// The single asset a union accepts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssetType(String);

impl AssetType {
    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for AssetType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Immutable union configuration, fixed by `UnionCreated`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnionConfig {
    pub creator: MemberId,
    pub name: String,
    pub asset: AssetType,
    pub min_interest_rate: u64,
    pub max_interest_rate: u64,
    pub pool: PoolId,
}

/// Aggregate root: one credit union.
///
/// Owns the member set, every member account, every loan, and the pooled
/// total, so each ledger operation is a single-aggregate transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreditUnion {
    id: UnionId,
    config: Option<UnionConfig>,
    members: Vec<MemberId>,
    accounts: BTreeMap<MemberId, MemberAccount>,
    loans: HashMap<MemberId, Loan>,
    total_deposits: u64,
    version: u64,
}

impl CreditUnion {
    /// Empty aggregate for rehydration.
    pub fn empty(id: UnionId) -> Self {
        Self {
            id,
            config: None,
            members: Vec::new(),
            accounts: BTreeMap::new(),
            loans: HashMap::new(),
            total_deposits: 0,
            version: 0,
        }
    }

    pub fn id_typed(&self) -> UnionId {
        self.id
    }

    pub fn is_created(&self) -> bool {
        self.config.is_some()
    }

    pub fn config(&self) -> Option<&UnionConfig> {
        self.config.as_ref()
    }

    pub fn name(&self) -> Option<&str> {
        self.config.as_ref().map(|c| c.name.as_str())
    }

    pub fn pool(&self) -> Option<PoolId> {
        self.config.as_ref().map(|c| c.pool)
    }

    /// Members in admission order.
    pub fn members(&self) -> &[MemberId] {
        &self.members
    }

    pub fn is_member(&self, member: MemberId) -> bool {
        self.accounts.contains_key(&member)
    }

    pub fn account(&self, member: MemberId) -> Option<&MemberAccount> {
        self.accounts.get(&member)
    }

    pub fn accounts(&self) -> impl Iterator<Item = &MemberAccount> {
        self.accounts.values()
    }

    pub fn loan(&self, borrower: MemberId) -> Option<&Loan> {
        self.loans.get(&borrower)
    }

    pub fn total_deposits(&self) -> u64 {
        self.total_deposits
    }

    /// Check the ledger-wide invariants:
    /// `total_deposits == Σ balance` and `staked_amount <= balance` per member.
    pub fn verify_invariants(&self) -> DomainResult<()> {
        let sum: u128 = self.accounts.values().map(|a| u128::from(a.balance())).sum();
        if sum != u128::from(self.total_deposits) {
            return Err(DomainError::validation(format!(
                "total_deposits {} != sum of balances {sum}",
                self.total_deposits
            )));
        }
        if let Some(acc) = self.accounts.values().find(|a| a.staked_amount() > a.balance()) {
            return Err(DomainError::validation(format!(
                "member {} has staked {} > balance {}",
                acc.member(),
                acc.staked_amount(),
                acc.balance()
            )));
        }
        Ok(())
    }
}

impl AggregateRoot for CreditUnion {
    type Id = UnionId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: CreateUnion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateUnion {
    pub union_id: UnionId,
    pub creator: MemberId,
    pub name: String,
    pub asset: AssetType,
    pub min_interest_rate: u64,
    pub max_interest_rate: u64,
    pub pool: PoolId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: JoinUnion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinUnion {
    pub union_id: UnionId,
    pub member: MemberId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: Deposit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deposit {
    pub union_id: UnionId,
    pub member: MemberId,
    pub asset: AssetType,
    pub amount: u64,
    pub occurred_at: DateTime<Utc>,
}

/// Command: Withdraw.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Withdraw {
    pub union_id: UnionId,
    pub member: MemberId,
    pub asset: AssetType,
    pub amount: u64,
    pub occurred_at: DateTime<Utc>,
}

/// Command: RequestLoan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestLoan {
    pub union_id: UnionId,
    pub borrower: MemberId,
    pub amount: u64,
    pub occurred_at: DateTime<Utc>,
}

/// Command: VouchForLoan.
///
/// `occurred_at` doubles as "now" for the due date: the loan falls due
/// `loan_term_days` after the latest vouch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VouchForLoan {
    pub union_id: UnionId,
    pub voucher: MemberId,
    pub borrower: MemberId,
    pub amount: u64,
    pub interest_rate: u64,
    pub loan_term_days: u32,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnionCommand {
    CreateUnion(CreateUnion),
    JoinUnion(JoinUnion),
    Deposit(Deposit),
    Withdraw(Withdraw),
    RequestLoan(RequestLoan),
    VouchForLoan(VouchForLoan),
}

impl UnionCommand {
    pub fn union_id(&self) -> UnionId {
        match self {
            UnionCommand::CreateUnion(c) => c.union_id,
            UnionCommand::JoinUnion(c) => c.union_id,
            UnionCommand::Deposit(c) => c.union_id,
            UnionCommand::Withdraw(c) => c.union_id,
            UnionCommand::RequestLoan(c) => c.union_id,
            UnionCommand::VouchForLoan(c) => c.union_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            UnionCommand::CreateUnion(_) => "create_union",
            UnionCommand::JoinUnion(_) => "join_union",
            UnionCommand::Deposit(_) => "deposit",
            UnionCommand::Withdraw(_) => "withdraw",
            UnionCommand::RequestLoan(_) => "request_loan",
            UnionCommand::VouchForLoan(_) => "vouch_for_loan",
        }
    }
}

/// Event: UnionCreated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnionCreated {
    pub union_id: UnionId,
    pub creator: MemberId,
    pub name: String,
    pub asset: AssetType,
    pub min_interest_rate: u64,
    pub max_interest_rate: u64,
    pub pool: PoolId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: MemberJoined.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberJoined {
    pub union_id: UnionId,
    pub member: MemberId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: Deposited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deposited {
    pub union_id: UnionId,
    pub member: MemberId,
    pub amount: u64,
    pub occurred_at: DateTime<Utc>,
}

/// Event: Withdrawn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Withdrawn {
    pub union_id: UnionId,
    pub member: MemberId,
    pub amount: u64,
    pub occurred_at: DateTime<Utc>,
}

/// Event: LoanRequested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoanRequested {
    pub union_id: UnionId,
    pub borrower: MemberId,
    pub amount: u64,
    pub occurred_at: DateTime<Utc>,
}

/// Event: LoanVouched. Carries the loan's terms after the vouch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoanVouched {
    pub union_id: UnionId,
    pub borrower: MemberId,
    pub voucher: Voucher,
    pub interest_rate: u64,
    pub due_date: DateTime<Utc>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: LoanApproved.
///
/// A notification only. Applying it changes nothing: approval is re-derived
/// from the voucher list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoanApproved {
    pub union_id: UnionId,
    pub borrower: MemberId,
    pub amount: u64,
    pub interest_rate: u64,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnionEvent {
    UnionCreated(UnionCreated),
    MemberJoined(MemberJoined),
    Deposited(Deposited),
    Withdrawn(Withdrawn),
    LoanRequested(LoanRequested),
    LoanVouched(LoanVouched),
    LoanApproved(LoanApproved),
}

/// Stable event type names, as stored and published.
pub mod event_types {
    pub const UNION_CREATED: &str = "creditunion.union.created";
    pub const MEMBER_JOINED: &str = "creditunion.union.member_joined";
    pub const DEPOSITED: &str = "creditunion.union.deposited";
    pub const WITHDRAWN: &str = "creditunion.union.withdrawn";
    pub const LOAN_REQUESTED: &str = "creditunion.union.loan_requested";
    pub const LOAN_VOUCHED: &str = "creditunion.union.loan_vouched";
    pub const LOAN_APPROVED: &str = "creditunion.union.loan_approved";
}

impl Event for UnionEvent {
    fn event_type(&self) -> &'static str {
        match self {
            UnionEvent::UnionCreated(_) => event_types::UNION_CREATED,
            UnionEvent::MemberJoined(_) => event_types::MEMBER_JOINED,
            UnionEvent::Deposited(_) => event_types::DEPOSITED,
            UnionEvent::Withdrawn(_) => event_types::WITHDRAWN,
            UnionEvent::LoanRequested(_) => event_types::LOAN_REQUESTED,
            UnionEvent::LoanVouched(_) => event_types::LOAN_VOUCHED,
            UnionEvent::LoanApproved(_) => event_types::LOAN_APPROVED,
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            UnionEvent::UnionCreated(e) => e.occurred_at,
            UnionEvent::MemberJoined(e) => e.occurred_at,
            UnionEvent::Deposited(e) => e.occurred_at,
            UnionEvent::Withdrawn(e) => e.occurred_at,
            UnionEvent::LoanRequested(e) => e.occurred_at,
            UnionEvent::LoanVouched(e) => e.occurred_at,
            UnionEvent::LoanApproved(e) => e.occurred_at,
        }
    }
}

impl Aggregate for CreditUnion {
    type Command = UnionCommand;
    type Event = UnionEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            UnionEvent::UnionCreated(e) => {
                self.id = e.union_id;
                self.config = Some(UnionConfig {
                    creator: e.creator,
                    name: e.name.clone(),
                    asset: e.asset.clone(),
                    min_interest_rate: e.min_interest_rate,
                    max_interest_rate: e.max_interest_rate,
                    pool: e.pool,
                });
            }
            UnionEvent::MemberJoined(e) => {
                self.members.push(e.member);
                self.accounts.insert(e.member, MemberAccount::open(e.member));
            }
            UnionEvent::Deposited(e) => {
                if let Some(acc) = self.accounts.get_mut(&e.member) {
                    acc.credit(e.amount);
                    self.total_deposits = self.total_deposits.saturating_add(e.amount);
                }
            }
            UnionEvent::Withdrawn(e) => {
                if let Some(acc) = self.accounts.get_mut(&e.member) {
                    acc.debit(e.amount);
                    self.total_deposits = self.total_deposits.saturating_sub(e.amount);
                }
            }
            UnionEvent::LoanRequested(e) => {
                self.loans.insert(e.borrower, Loan::request(e.borrower, e.amount));
            }
            UnionEvent::LoanVouched(e) => {
                if let Some(acc) = self.accounts.get_mut(&e.voucher.voucher) {
                    acc.stake(e.voucher.amount);
                }
                if let Some(loan) = self.loans.get_mut(&e.borrower) {
                    loan.record_vouch(e.voucher, e.due_date);
                }
            }
            UnionEvent::LoanApproved(_) => {}
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        if let UnionCommand::CreateUnion(cmd) = command {
            return self.handle_create(cmd);
        }

        let config = self.config.as_ref().ok_or(DomainError::NotInitialized)?;
        self.ensure_union_id(command.union_id())?;

        match command {
            UnionCommand::CreateUnion(_) => Err(DomainError::AlreadyInitialized),
            UnionCommand::JoinUnion(cmd) => self.handle_join(cmd),
            UnionCommand::Deposit(cmd) => self.handle_deposit(config, cmd),
            UnionCommand::Withdraw(cmd) => self.handle_withdraw(config, cmd),
            UnionCommand::RequestLoan(cmd) => self.handle_request_loan(cmd),
            UnionCommand::VouchForLoan(cmd) => self.handle_vouch(config, cmd),
        }
    }
}

impl CreditUnion {
    fn ensure_union_id(&self, union_id: UnionId) -> DomainResult<()> {
        if self.id != union_id {
            return Err(DomainError::validation("union_id mismatch"));
        }
        Ok(())
    }

    fn member_account(&self, member: MemberId) -> DomainResult<&MemberAccount> {
        self.accounts.get(&member).ok_or(DomainError::NotMember(member))
    }

    fn ensure_asset(config: &UnionConfig, asset: &AssetType) -> DomainResult<()> {
        if &config.asset != asset {
            return Err(DomainError::validation(format!(
                "asset type mismatch (union: {}, given: {asset})",
                config.asset
            )));
        }
        Ok(())
    }

    fn handle_create(&self, cmd: &CreateUnion) -> DomainResult<Vec<UnionEvent>> {
        if self.is_created() {
            return Err(DomainError::AlreadyInitialized);
        }
        self.ensure_union_id(cmd.union_id)?;
        if cmd.name.trim().is_empty() {
            return Err(DomainError::validation("name cannot be empty"));
        }
        if cmd.min_interest_rate > cmd.max_interest_rate {
            return Err(DomainError::InvalidRateBounds {
                min: cmd.min_interest_rate,
                max: cmd.max_interest_rate,
            });
        }

        Ok(vec![UnionEvent::UnionCreated(UnionCreated {
            union_id: cmd.union_id,
            creator: cmd.creator,
            name: cmd.name.clone(),
            asset: cmd.asset.clone(),
            min_interest_rate: cmd.min_interest_rate,
            max_interest_rate: cmd.max_interest_rate,
            pool: cmd.pool,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_join(&self, cmd: &JoinUnion) -> DomainResult<Vec<UnionEvent>> {
        if self.is_member(cmd.member) {
            return Err(DomainError::AlreadyMember(cmd.member));
        }

        Ok(vec![UnionEvent::MemberJoined(MemberJoined {
            union_id: cmd.union_id,
            member: cmd.member,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_deposit(&self, config: &UnionConfig, cmd: &Deposit) -> DomainResult<Vec<UnionEvent>> {
        let account = self.member_account(cmd.member)?;
        if cmd.amount == 0 {
            return Err(DomainError::InvalidAmount);
        }
        Self::ensure_asset(config, &cmd.asset)?;
        account.ensure_can_deposit(cmd.amount)?;
        if self.total_deposits.checked_add(cmd.amount).is_none() {
            return Err(DomainError::validation("total deposits overflow"));
        }

        Ok(vec![UnionEvent::Deposited(Deposited {
            union_id: cmd.union_id,
            member: cmd.member,
            amount: cmd.amount,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_withdraw(&self, config: &UnionConfig, cmd: &Withdraw) -> DomainResult<Vec<UnionEvent>> {
        let account = self.member_account(cmd.member)?;
        if cmd.amount == 0 {
            return Err(DomainError::InvalidAmount);
        }
        Self::ensure_asset(config, &cmd.asset)?;
        account.ensure_can_withdraw(cmd.amount)?;

        Ok(vec![UnionEvent::Withdrawn(Withdrawn {
            union_id: cmd.union_id,
            member: cmd.member,
            amount: cmd.amount,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_request_loan(&self, cmd: &RequestLoan) -> DomainResult<Vec<UnionEvent>> {
        self.member_account(cmd.borrower)?;
        if cmd.amount == 0 {
            return Err(DomainError::InvalidAmount);
        }
        if self.loans.contains_key(&cmd.borrower) {
            return Err(DomainError::LoanAlreadyRequested(cmd.borrower));
        }

        Ok(vec![UnionEvent::LoanRequested(LoanRequested {
            union_id: cmd.union_id,
            borrower: cmd.borrower,
            amount: cmd.amount,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_vouch(&self, config: &UnionConfig, cmd: &VouchForLoan) -> DomainResult<Vec<UnionEvent>> {
        let account = self.member_account(cmd.voucher)?;
        if cmd.interest_rate < config.min_interest_rate || cmd.interest_rate > config.max_interest_rate {
            return Err(DomainError::InterestRateOutOfBounds {
                rate: cmd.interest_rate,
                min: config.min_interest_rate,
                max: config.max_interest_rate,
            });
        }
        if cmd.amount == 0 {
            return Err(DomainError::InvalidAmount);
        }
        account.ensure_can_stake(cmd.amount)?;
        let loan = self
            .loans
            .get(&cmd.borrower)
            .ok_or(DomainError::LoanNotFound(cmd.borrower))?;

        let voucher = Voucher {
            voucher: cmd.voucher,
            amount: cmd.amount,
            interest_rate: cmd.interest_rate,
        };
        let interest_rate = loan.rate_with(&voucher);
        let due_date = Duration::try_days(i64::from(cmd.loan_term_days))
            .and_then(|term| cmd.occurred_at.checked_add_signed(term))
            .ok_or_else(|| DomainError::validation("due date out of range"))?;

        let mut events = vec![UnionEvent::LoanVouched(LoanVouched {
            union_id: cmd.union_id,
            borrower: cmd.borrower,
            voucher,
            interest_rate,
            due_date,
            occurred_at: cmd.occurred_at,
        })];

        if loan.crosses_threshold_with(cmd.amount) {
            events.push(UnionEvent::LoanApproved(LoanApproved {
                union_id: cmd.union_id,
                borrower: cmd.borrower,
                amount: loan.amount(),
                interest_rate,
                occurred_at: cmd.occurred_at,
            }));
        }

        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loan::LoanStatus;
    use creditunion_events::execute;
    use proptest::prelude::*;

    struct Fixture {
        union: CreditUnion,
        now: DateTime<Utc>,
    }

    fn asset() -> AssetType {
        AssetType::new("CU")
    }

    impl Fixture {
        fn new(min: u64, max: u64) -> Self {
            let union_id = UnionId::new();
            let now = Utc::now();
            let mut union = CreditUnion::empty(union_id);
            execute(
                &mut union,
                &UnionCommand::CreateUnion(CreateUnion {
                    union_id,
                    creator: MemberId::new(),
                    name: "Riverside Mutual".to_string(),
                    asset: asset(),
                    min_interest_rate: min,
                    max_interest_rate: max,
                    pool: PoolId::new(),
                    occurred_at: now,
                }),
            )
            .unwrap();
            Self { union, now }
        }

        fn run(&mut self, cmd: UnionCommand) -> DomainResult<Vec<UnionEvent>> {
            execute(&mut self.union, &cmd)
        }

        fn join(&mut self) -> MemberId {
            let member = MemberId::new();
            self.run(UnionCommand::JoinUnion(JoinUnion {
                union_id: self.union.id_typed(),
                member,
                occurred_at: self.now,
            }))
            .unwrap();
            member
        }

        fn deposit(&mut self, member: MemberId, amount: u64) -> DomainResult<Vec<UnionEvent>> {
            self.run(UnionCommand::Deposit(Deposit {
                union_id: self.union.id_typed(),
                member,
                asset: asset(),
                amount,
                occurred_at: self.now,
            }))
        }

        fn withdraw(&mut self, member: MemberId, amount: u64) -> DomainResult<Vec<UnionEvent>> {
            self.run(UnionCommand::Withdraw(Withdraw {
                union_id: self.union.id_typed(),
                member,
                asset: asset(),
                amount,
                occurred_at: self.now,
            }))
        }

        fn request(&mut self, borrower: MemberId, amount: u64) -> DomainResult<Vec<UnionEvent>> {
            self.run(UnionCommand::RequestLoan(RequestLoan {
                union_id: self.union.id_typed(),
                borrower,
                amount,
                occurred_at: self.now,
            }))
        }

        fn vouch(
            &mut self,
            voucher: MemberId,
            borrower: MemberId,
            amount: u64,
            rate: u64,
        ) -> DomainResult<Vec<UnionEvent>> {
            self.run(UnionCommand::VouchForLoan(VouchForLoan {
                union_id: self.union.id_typed(),
                voucher,
                borrower,
                amount,
                interest_rate: rate,
                loan_term_days: DEFAULT_LOAN_TERM_DAYS,
                occurred_at: self.now,
            }))
        }
    }

    fn approvals(events: &[UnionEvent]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, UnionEvent::LoanApproved(_)))
            .count()
    }

    #[test]
    fn commands_on_missing_union_fail_not_initialized() {
        let union_id = UnionId::new();
        let union = CreditUnion::empty(union_id);
        let err = union
            .handle(&UnionCommand::JoinUnion(JoinUnion {
                union_id,
                member: MemberId::new(),
                occurred_at: Utc::now(),
            }))
            .unwrap_err();
        assert_eq!(err, DomainError::NotInitialized);
    }

    #[test]
    fn create_rejects_inverted_rate_bounds() {
        let union_id = UnionId::new();
        let union = CreditUnion::empty(union_id);
        let err = union
            .handle(&UnionCommand::CreateUnion(CreateUnion {
                union_id,
                creator: MemberId::new(),
                name: "Inverted".to_string(),
                asset: asset(),
                min_interest_rate: 9,
                max_interest_rate: 3,
                pool: PoolId::new(),
                occurred_at: Utc::now(),
            }))
            .unwrap_err();
        assert_eq!(err, DomainError::InvalidRateBounds { min: 9, max: 3 });
    }

    #[test]
    fn create_twice_is_rejected() {
        let mut fx = Fixture::new(1, 10);
        let config = fx.union.config().unwrap().clone();
        let err = fx
            .run(UnionCommand::CreateUnion(CreateUnion {
                union_id: fx.union.id_typed(),
                creator: config.creator,
                name: config.name,
                asset: config.asset,
                min_interest_rate: 1,
                max_interest_rate: 10,
                pool: PoolId::new(),
                occurred_at: fx.now,
            }))
            .unwrap_err();
        assert_eq!(err, DomainError::AlreadyInitialized);
        assert_eq!(fx.union.pool(), Some(config.pool));
    }

    #[test]
    fn joining_twice_fails_and_leaves_members_unchanged() {
        let mut fx = Fixture::new(1, 10);
        let member = fx.join();
        let before = fx.union.members().to_vec();

        let err = fx
            .run(UnionCommand::JoinUnion(JoinUnion {
                union_id: fx.union.id_typed(),
                member,
                occurred_at: fx.now,
            }))
            .unwrap_err();

        assert_eq!(err, DomainError::AlreadyMember(member));
        assert_eq!(fx.union.members(), before.as_slice());
    }

    #[test]
    fn joined_member_starts_with_empty_account() {
        let mut fx = Fixture::new(1, 10);
        let member = fx.join();
        let acc = fx.union.account(member).unwrap();
        assert_eq!((acc.balance(), acc.staked_amount()), (0, 0));
    }

    #[test]
    fn non_member_operations_fail_and_mutate_nothing() {
        let mut fx = Fixture::new(1, 10);
        let borrower = fx.join();
        fx.request(borrower, 100).unwrap();
        let stranger = MemberId::new();
        let before = fx.union.clone();

        assert_eq!(fx.deposit(stranger, 10).unwrap_err(), DomainError::NotMember(stranger));
        assert_eq!(fx.withdraw(stranger, 10).unwrap_err(), DomainError::NotMember(stranger));
        assert_eq!(
            fx.vouch(stranger, borrower, 10, 5).unwrap_err(),
            DomainError::NotMember(stranger)
        );
        assert_eq!(fx.request(stranger, 10).unwrap_err(), DomainError::NotMember(stranger));
        assert_eq!(fx.union, before);
    }

    #[test]
    fn deposit_and_withdraw_move_balance_and_pool_total() {
        let mut fx = Fixture::new(1, 10);
        let a = fx.join();
        let b = fx.join();

        fx.deposit(a, 250).unwrap();
        fx.deposit(b, 100).unwrap();
        fx.withdraw(a, 50).unwrap();

        assert_eq!(fx.union.account(a).unwrap().balance(), 200);
        assert_eq!(fx.union.total_deposits(), 300);
        fx.union.verify_invariants().unwrap();
    }

    #[test]
    fn zero_amounts_are_rejected() {
        let mut fx = Fixture::new(1, 10);
        let a = fx.join();
        assert_eq!(fx.deposit(a, 0).unwrap_err(), DomainError::InvalidAmount);
        assert_eq!(fx.withdraw(a, 0).unwrap_err(), DomainError::InvalidAmount);
        assert_eq!(fx.request(a, 0).unwrap_err(), DomainError::InvalidAmount);
    }

    #[test]
    fn deposit_in_foreign_asset_is_rejected() {
        let mut fx = Fixture::new(1, 10);
        let a = fx.join();
        let err = fx
            .run(UnionCommand::Deposit(Deposit {
                union_id: fx.union.id_typed(),
                member: a,
                asset: AssetType::new("BTC"),
                amount: 5,
                occurred_at: fx.now,
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(msg) if msg.contains("asset type mismatch")));
    }

    #[test]
    fn withdraw_cannot_touch_staked_funds() {
        let mut fx = Fixture::new(1, 10);
        let voucher = fx.join();
        let borrower = fx.join();
        fx.deposit(voucher, 100).unwrap();
        fx.request(borrower, 500).unwrap();
        fx.vouch(voucher, borrower, 70, 5).unwrap();

        assert_eq!(
            fx.withdraw(voucher, 101).unwrap_err(),
            DomainError::InsufficientBalance { available: 100, requested: 101 }
        );
        assert_eq!(
            fx.withdraw(voucher, 31).unwrap_err(),
            DomainError::CannotWithdrawStaked { balance: 100, staked: 70, requested: 31 }
        );

        fx.withdraw(voucher, 30).unwrap();
        let acc = fx.union.account(voucher).unwrap();
        assert_eq!((acc.balance(), acc.staked_amount()), (70, 70));
        fx.union.verify_invariants().unwrap();
    }

    #[test]
    fn vouch_outside_rate_bounds_mutates_nothing() {
        let mut fx = Fixture::new(3, 12);
        let voucher = fx.join();
        let borrower = fx.join();
        fx.deposit(voucher, 100).unwrap();
        fx.request(borrower, 50).unwrap();
        let before = fx.union.clone();

        for rate in [0, 2, 13, u64::MAX] {
            assert_eq!(
                fx.vouch(voucher, borrower, 10, rate).unwrap_err(),
                DomainError::InterestRateOutOfBounds { rate, min: 3, max: 12 }
            );
        }
        assert_eq!(fx.union, before);

        // Bounds are inclusive.
        fx.vouch(voucher, borrower, 10, 3).unwrap();
        fx.vouch(voucher, borrower, 10, 12).unwrap();
    }

    #[test]
    fn vouch_requires_unpledged_funds() {
        let mut fx = Fixture::new(1, 10);
        let voucher = fx.join();
        let borrower = fx.join();
        fx.deposit(voucher, 100).unwrap();
        fx.request(borrower, 1_000).unwrap();

        fx.vouch(voucher, borrower, 80, 5).unwrap();
        assert_eq!(
            fx.vouch(voucher, borrower, 21, 5).unwrap_err(),
            DomainError::InsufficientBalance { available: 20, requested: 21 }
        );
        fx.vouch(voucher, borrower, 20, 5).unwrap();
        fx.union.verify_invariants().unwrap();
    }

    #[test]
    fn vouch_for_unknown_loan_fails() {
        let mut fx = Fixture::new(1, 10);
        let voucher = fx.join();
        let borrower = fx.join();
        fx.deposit(voucher, 100).unwrap();
        assert_eq!(
            fx.vouch(voucher, borrower, 10, 5).unwrap_err(),
            DomainError::LoanNotFound(borrower)
        );
    }

    #[test]
    fn second_loan_request_is_rejected() {
        let mut fx = Fixture::new(1, 10);
        let borrower = fx.join();
        fx.request(borrower, 100).unwrap();
        assert_eq!(
            fx.request(borrower, 50).unwrap_err(),
            DomainError::LoanAlreadyRequested(borrower)
        );
        assert_eq!(fx.union.loan(borrower).unwrap().amount(), 100);
    }

    #[test]
    fn new_loan_has_no_terms_yet() {
        let mut fx = Fixture::new(1, 10);
        let borrower = fx.join();
        fx.request(borrower, 100).unwrap();
        let loan = fx.union.loan(borrower).unwrap();
        assert_eq!(loan.interest_rate(), 0);
        assert_eq!(loan.due_date(), None);
        assert!(loan.vouchers().is_empty());
        assert_eq!(loan.status(), LoanStatus::Requested);
    }

    #[test]
    fn loan_rate_is_weighted_average_of_vouchers() {
        let mut fx = Fixture::new(1, 20);
        let a = fx.join();
        let b = fx.join();
        let borrower = fx.join();
        fx.deposit(a, 100).unwrap();
        fx.deposit(b, 300).unwrap();
        fx.request(borrower, 1_000).unwrap();

        fx.vouch(a, borrower, 100, 5).unwrap();
        assert_eq!(fx.union.loan(borrower).unwrap().interest_rate(), 5);

        let events = fx.vouch(b, borrower, 300, 9).unwrap();
        let loan = fx.union.loan(borrower).unwrap();
        assert_eq!(loan.interest_rate(), 8);
        match &events[0] {
            UnionEvent::LoanVouched(e) => assert_eq!(e.interest_rate, 8),
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(loan.vouchers()[0].voucher, a);
        assert_eq!(loan.vouchers()[1].voucher, b);
    }

    #[test]
    fn approval_fires_once_when_funding_crosses_principal() {
        let mut fx = Fixture::new(1, 10);
        let borrower = fx.join();
        let vouchers: Vec<MemberId> = (0..4).map(|_| fx.join()).collect();
        for v in &vouchers {
            fx.deposit(*v, 200).unwrap();
        }
        fx.request(borrower, 500).unwrap();

        let first = fx.vouch(vouchers[0], borrower, 200, 4).unwrap();
        assert_eq!(approvals(&first), 0);
        let second = fx.vouch(vouchers[1], borrower, 200, 4).unwrap();
        assert_eq!(approvals(&second), 0);
        assert!(!fx.union.loan(borrower).unwrap().is_approved());

        let third = fx.vouch(vouchers[2], borrower, 200, 4).unwrap();
        assert_eq!(approvals(&third), 1);
        match &third[1] {
            UnionEvent::LoanApproved(e) => {
                assert_eq!(e.amount, 500);
                assert_eq!(e.interest_rate, 4);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(fx.union.loan(borrower).unwrap().is_approved());

        // Vouching past the threshold is allowed but does not re-approve.
        let fourth = fx.vouch(vouchers[3], borrower, 200, 4).unwrap();
        assert_eq!(approvals(&fourth), 0);
        assert_eq!(fx.union.loan(borrower).unwrap().funded(), 800);
    }

    #[test]
    fn due_date_moves_with_every_vouch() {
        let mut fx = Fixture::new(1, 10);
        let voucher = fx.join();
        let borrower = fx.join();
        fx.deposit(voucher, 100).unwrap();
        fx.request(borrower, 10).unwrap();

        fx.vouch(voucher, borrower, 10, 5).unwrap();
        let first_due = fx.union.loan(borrower).unwrap().due_date().unwrap();
        assert_eq!(first_due, fx.now + Duration::days(30));

        fx.now += Duration::days(2);
        fx.vouch(voucher, borrower, 10, 5).unwrap();
        let second_due = fx.union.loan(borrower).unwrap().due_date().unwrap();
        assert_eq!(second_due, first_due + Duration::days(2));
    }

    #[test]
    fn unrepresentable_due_date_is_rejected() {
        let mut fx = Fixture::new(1, 10);
        let voucher = fx.join();
        let borrower = fx.join();
        fx.deposit(voucher, 100).unwrap();
        fx.request(borrower, 50).unwrap();
        let before = fx.union.clone();

        let err = fx
            .run(UnionCommand::VouchForLoan(VouchForLoan {
                union_id: fx.union.id_typed(),
                voucher,
                borrower,
                amount: 10,
                interest_rate: 5,
                loan_term_days: 200_000_000,
                occurred_at: fx.now,
            }))
            .unwrap_err();

        assert_eq!(err, DomainError::validation("due date out of range"));
        assert_eq!(fx.union, before);
    }

    #[test]
    fn same_member_may_vouch_repeatedly() {
        let mut fx = Fixture::new(1, 10);
        let voucher = fx.join();
        let borrower = fx.join();
        fx.deposit(voucher, 100).unwrap();
        fx.request(borrower, 100).unwrap();

        fx.vouch(voucher, borrower, 40, 2).unwrap();
        fx.vouch(voucher, borrower, 60, 7).unwrap();

        let loan = fx.union.loan(borrower).unwrap();
        assert_eq!(loan.vouchers().len(), 2);
        assert_eq!(loan.interest_rate(), 5);
        assert_eq!(fx.union.account(voucher).unwrap().staked_amount(), 100);
    }

    #[test]
    fn version_counts_applied_events() {
        let mut fx = Fixture::new(1, 10);
        let member = fx.join();
        fx.deposit(member, 5).unwrap();
        assert_eq!(fx.union.version(), 3);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Deposit(usize, u64),
        Withdraw(usize, u64),
        Vouch(usize, usize, u64, u64),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0usize..4, 1u64..1_000).prop_map(|(m, a)| Op::Deposit(m, a)),
            (0usize..4, 1u64..1_000).prop_map(|(m, a)| Op::Withdraw(m, a)),
            (0usize..4, 0usize..4, 1u64..500, 0u64..15)
                .prop_map(|(v, b, a, r)| Op::Vouch(v, b, a, r)),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: whatever mix of deposits, withdrawals and vouches is
        /// attempted, pooled deposits equal the sum of balances and nobody
        /// has more staked than they hold.
        #[test]
        fn ledger_invariants_hold_after_every_operation(
            ops in prop::collection::vec(op(), 1..60)
        ) {
            let mut fx = Fixture::new(2, 10);
            let members: Vec<MemberId> = (0..4).map(|_| fx.join()).collect();
            for m in &members {
                fx.request(*m, 1_000).unwrap();
            }

            for op in ops {
                let before = fx.union.clone();
                let result = match op {
                    Op::Deposit(m, a) => fx.deposit(members[m], a),
                    Op::Withdraw(m, a) => {
                        let acc = fx.union.account(members[m]).unwrap().clone();
                        let result = fx.withdraw(members[m], a);
                        if a <= acc.available() {
                            prop_assert!(result.is_ok());
                            prop_assert_eq!(
                                fx.union.account(members[m]).unwrap().balance(),
                                acc.balance() - a
                            );
                        } else if a <= acc.balance() {
                            let is_staked_error = matches!(
                                result,
                                Err(DomainError::CannotWithdrawStaked { .. })
                            );
                            prop_assert!(is_staked_error);
                        }
                        result
                    }
                    Op::Vouch(v, b, a, r) => fx.vouch(members[v], members[b], a, r),
                };

                if result.is_err() {
                    prop_assert_eq!(&fx.union, &before);
                }
                prop_assert!(fx.union.verify_invariants().is_ok());
            }
        }
    }
}
