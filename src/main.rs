//! Prediction market core simulation.
//!
//! Drives a full market lifecycle end to end: create, trade, realize PnL,
//! resolve, and snapshot round-trip. All numbers are printed from the live
//! ledger, so this doubles as a smoke test for credit conservation.

use prediction_core::*;
use rust_decimal_macros::dec;

fn main() {
    let mut engine = MarketEngine::new();

    let alice = engine.risk_mut().create_account();
    let bob = engine.risk_mut().create_account();
    engine.risk_mut().mint(alice, dec!(1000)).expect("mint");
    engine.risk_mut().mint(bob, dec!(1000)).expect("mint");

    let market_id = engine
        .create_market(MarketParams::yes_no("Will PR #1 merge this week?"))
        .expect("create market");

    println!("=== prediction-core simulation ===\n");
    print_prices(&engine, market_id);
    print_totals(&engine, market_id, alice, bob);

    println!("\n--- Alice buys yes for 50 ---");
    let trade = engine
        .buy(market_id, alice, "yes", dec!(50))
        .expect("alice buys");
    println!(
        "filled {} yes @ {} (cost {})",
        trade.amount,
        trade.price,
        trade.amount * trade.price
    );
    print_prices(&engine, market_id);

    println!("\n--- Bob piles in: no for 200 ---");
    let trade = engine
        .buy(market_id, bob, "no", dec!(200))
        .expect("bob buys");
    println!(
        "filled {} no @ {} (cost {})",
        trade.amount,
        trade.price,
        trade.amount * trade.price
    );
    print_prices(&engine, market_id);

    println!("\n--- Alice cuts her position in half ---");
    let held = engine.market(market_id).expect("market").position(alice)[0];
    let half = engine
        .market(market_id)
        .expect("market")
        .quantize_amount_floor(held / dec!(2));
    let trade = engine
        .sell(market_id, alice, "yes", half)
        .expect("alice sells");
    println!("sold {} yes @ {}", trade.amount, trade.price);
    print_locks(&engine, market_id, alice, "alice");
    print_totals(&engine, market_id, alice, bob);

    println!("\n--- Resolve: no wins ---");
    engine.resolve(market_id, "no").expect("resolve");
    print_totals(&engine, market_id, alice, bob);

    let dir = std::env::temp_dir().join("prediction-sim-snapshot.json");
    save_snapshot(&engine, &dir).expect("save snapshot");
    let restored = load_snapshot(&dir).expect("load snapshot");
    println!(
        "\nsnapshot round-trip: {}",
        if restored == engine { "identical" } else { "DIVERGED" }
    );
}

fn print_prices(engine: &MarketEngine, market_id: MarketId) {
    let prices = engine.prices(market_id).expect("prices");
    let rendered: Vec<String> = prices
        .iter()
        .map(|(outcome, p)| format!("{outcome}={}", p.round_dp(4)))
        .collect();
    println!("prices: {}", rendered.join(" "));
}

fn print_locks(engine: &MarketEngine, market_id: MarketId, account: AccountId, name: &str) {
    let acc = engine.risk().account(account).expect("account");
    for lock in acc.locks_for_market(market_id) {
        println!("{name} lock: {} = {}", lock.kind, lock.amount);
    }
}

fn print_totals(engine: &MarketEngine, market_id: MarketId, alice: AccountId, bob: AccountId) {
    let risk = engine.risk();
    let amm = engine.market(market_id).expect("market").amm_account_id;
    let show = |id: AccountId| {
        let acc = risk.account(id).expect("account");
        format!(
            "avail {} frozen {}",
            acc.available_balance.round_dp(4),
            acc.frozen_balance.round_dp(4)
        )
    };
    println!("alice: {}", show(alice));
    println!("bob:   {}", show(bob));
    println!("amm:   {}", show(amm));
    println!(
        "conservation: system {} == minted {}",
        risk.system_total(),
        risk.total_minted()
    );
}
