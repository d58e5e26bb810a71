fn main() -> anyhow::Result<()> {
    creditunion_observability::init();

    let config = creditunion_infra::ServiceConfig::from_env();
    tracing::info!(
        asset = %config.asset,
        loan_term_days = config.loan_term_days,
        max_conflict_retries = config.max_conflict_retries,
        "starting credit union session"
    );

    let report = creditunion_node::run_session(config)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
