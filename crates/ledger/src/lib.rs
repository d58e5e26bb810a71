//! Credit union ledger (event-sourced).
//!
//! Registry, membership, account ledger and loan vouching as one aggregate
//! per union. Pure domain logic only: no IO, no clocks, no custody.

pub mod account;
pub mod loan;
pub mod union;

pub use account::MemberAccount;
pub use loan::{Loan, LoanStatus, Voucher, weighted_interest_rate};
pub use union::{
    AGGREGATE_TYPE, AssetType, CreateUnion, CreditUnion, DEFAULT_LOAN_TERM_DAYS, Deposit,
    Deposited, JoinUnion, LoanApproved, LoanRequested, LoanVouched, MemberJoined, PoolId,
    RequestLoan, UnionCommand, UnionConfig, UnionCreated, UnionEvent, VouchForLoan, Withdraw,
    Withdrawn, event_types,
};
