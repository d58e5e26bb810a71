//! Scripted credit union session over in-memory infrastructure.
//!
//! Creates a union, funds three members, runs a loan through vouching to
//! approval and reports the resulting ledger, custody and notification state.

use std::sync::Arc;

use anyhow::Context;
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::info;

use creditunion_core::{MemberId, UnionId};
use creditunion_events::{EventBus, EventEnvelope, InMemoryEventBus};
use creditunion_infra::{
    AssetCustody, CreditUnionService, InMemoryCustody, InMemoryEventStore, ServiceConfig,
    SystemClock,
};
use creditunion_ledger::Loan;

const OPENING_WALLET: u64 = 1_000;

#[derive(Debug, Serialize)]
pub struct SessionReport {
    pub union_id: UnionId,
    pub name: String,
    pub asset: String,
    pub pool_balance: u64,
    pub total_deposits: u64,
    pub members: Vec<MemberReport>,
    pub loan: Loan,
    pub notifications: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct MemberReport {
    pub member: MemberId,
    pub balance: u64,
    pub staked: u64,
    pub wallet: u64,
}

/// Run the scripted session and report the final state.
pub fn run_session(config: ServiceConfig) -> anyhow::Result<SessionReport> {
    let asset = config.asset.clone();
    let bus: Arc<InMemoryEventBus<EventEnvelope<JsonValue>>> = Arc::new(InMemoryEventBus::new());
    let notifications = bus.subscribe();
    let custody = Arc::new(InMemoryCustody::new());
    let service = CreditUnionService::new(
        Arc::new(InMemoryEventStore::new()),
        bus,
        custody.clone(),
        SystemClock,
        config,
    );

    let union_id = service
        .create_union(MemberId::new(), "Harbor Credit", 2, 12)
        .context("creating union")?;

    let [alice, bob, carol] = [MemberId::new(), MemberId::new(), MemberId::new()];
    for member in [alice, bob, carol] {
        custody.mint(member, &asset, OPENING_WALLET)?;
        service.join_union(member, union_id).context("joining union")?;
    }

    service.deposit(alice, union_id, &asset, 600).context("alice deposit")?;
    service.deposit(bob, union_id, &asset, 400).context("bob deposit")?;

    service.request_loan(carol, union_id, 500).context("requesting loan")?;
    service
        .vouch_for_loan(alice, union_id, carol, 200, 4)
        .context("alice vouch")?;
    service
        .vouch_for_loan(bob, union_id, carol, 300, 10)
        .context("bob vouch")?;

    service
        .withdraw_to_wallet(alice, union_id, &asset, 100)
        .context("alice withdrawal")?;

    let union = service.union(union_id)?;
    let members = [alice, bob, carol]
        .into_iter()
        .map(|member| -> anyhow::Result<MemberReport> {
            let account = service.account(union_id, member)?;
            Ok(MemberReport {
                member,
                balance: account.balance(),
                staked: account.staked_amount(),
                wallet: custody.wallet_balance(member, &asset),
            })
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    let report = SessionReport {
        union_id,
        name: union.name().unwrap_or_default().to_string(),
        asset: asset.to_string(),
        pool_balance: service.pool_balance(union_id)?,
        total_deposits: union.total_deposits(),
        members,
        loan: service.loan(union_id, carol)?,
        notifications: notifications
            .drain()
            .into_iter()
            .map(|e| e.event_type().to_string())
            .collect(),
    };

    info!(
        union_id = %report.union_id,
        pool_balance = report.pool_balance,
        notifications = report.notifications.len(),
        "session complete"
    );
    Ok(report)
}
