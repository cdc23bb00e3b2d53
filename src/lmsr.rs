//! Logarithmic Market Scoring Rule. Pure math, no state.
//!
//! The cost function is C(q) = b * ln(sum_i e^(q_i / b)). A trade from q to q'
//! costs C(q') - C(q); instantaneous prices are the softmax of q / b and sum
//! to 1. The market maker's worst-case loss is b * ln(n) for n outcomes.
//!
//! q is a fixed-length vector indexed by outcome; the caller resolves outcome
//! names to indices. All inputs and outputs are Decimal. exp and ln run in
//! double precision on q-normalized values (largest exponent is 0, so the
//! intermediate terms stay in (0, 1]) and convert back to Decimal.

use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;

// Decimal -> f64 never fails; f64 -> Decimal can (inf/NaN from a caller-supplied
// extreme budget). Saturating keeps these functions total: a saturated result
// fails the caller's balance check instead of panicking.
fn to_f64(x: Decimal) -> f64 {
    x.to_f64().unwrap_or(f64::MAX)
}

fn from_f64_saturating(x: f64) -> Decimal {
    Decimal::from_f64(x).unwrap_or(Decimal::MAX)
}

fn exp_ratio(x: Decimal, b: Decimal) -> Decimal {
    from_f64_saturating((to_f64(x) / to_f64(b)).exp())
}

fn ln_dec(x: Decimal) -> Decimal {
    from_f64_saturating(to_f64(x).ln())
}

/// Subtract max(q) from every entry. Prices are invariant under the shift and
/// every exponent becomes <= 0.
fn normalize(q: &[Decimal]) -> (Decimal, Vec<Decimal>) {
    let shift = q.iter().copied().max().unwrap_or(Decimal::ZERO);
    (shift, q.iter().map(|v| *v - shift).collect())
}

/// sum_i e^(q_i / b) over the normalized vector.
fn exp_sum(qn: &[Decimal], b: Decimal) -> Decimal {
    qn.iter().map(|v| exp_ratio(*v, b)).sum()
}

// 2.1: cost function. C(q) = b * ln(sum e^(q_i/b)), evaluated in the shifted
// frame and shifted back: C(q) = max(q) + b * ln(sum e^((q_i - max)/b)).
// The shift must be restored or cost *differences* break whenever a trade
// moves the extremum of q.
pub fn cost(q: &[Decimal], b: Decimal) -> Decimal {
    let (shift, qn) = normalize(q);
    shift + b * ln_dec(exp_sum(&qn, b))
}

// 2.2: instantaneous prices, softmax over q/b. Sum to 1 up to Decimal division.
pub fn prices(q: &[Decimal], b: Decimal) -> Vec<Decimal> {
    let (_, qn) = normalize(q);
    let terms: Vec<Decimal> = qn.iter().map(|v| exp_ratio(*v, b)).collect();
    let total: Decimal = terms.iter().copied().sum();
    terms.into_iter().map(|t| t / total).collect()
}

// 2.3: credits to buy `amount` tokens of outcome `o`: C(after) - C(before).
// Negative amount is a sell and returns a negative number (credit back).
pub fn cost_to_buy(q: &[Decimal], b: Decimal, outcome: usize, amount: Decimal) -> Decimal {
    let mut after = q.to_vec();
    after[outcome] += amount;
    cost(&after, b) - cost(q, b)
}

// 2.4: inverse of cost_to_buy. Token count purchasable on `outcome` for a
// positive `budget`:
//
//   tokens = b * ln(S * (e^(budget/b) - 1) / e_o + 1)
//
// with S = sum e^(q_i/b) and e_o = e^(q_o/b). The S/e_o ratio is
// shift-invariant, so the normalized values are used directly. Evaluated in
// f64 end to end: a budget past the f64 exp range collapses to the token cap,
// which any balance check rejects downstream.
pub fn amount_for_cost(q: &[Decimal], b: Decimal, outcome: usize, budget: Decimal) -> Decimal {
    // keeps q + tokens and tokens * price inside Decimal range
    const TOKEN_CAP: Decimal = rust_decimal_macros::dec!(1_000_000_000_000_000);

    let (_, qn) = normalize(q);
    let b_f = to_f64(b);
    let s: f64 = qn.iter().map(|v| (to_f64(*v) / b_f).exp()).sum();
    let e_o = (to_f64(qn[outcome]) / b_f).exp();
    let inner = s * ((to_f64(budget) / b_f).exp() - 1.0) / e_o + 1.0;
    from_f64_saturating(b_f * inner.ln()).min(TOKEN_CAP)
}

// 2.5: tokens to trade to move an outcome's price to `target` in (0, 1).
// Returns (amount, cost): positive amount buys, negative sells.
//
// Solving target = e^(q_new/b) / (e^(q_new/b) + others) for q_new gives
// q_new = b * ln(target * others / (1 - target)) in the shifted frame.
pub fn cost_to_move_price(
    q: &[Decimal],
    b: Decimal,
    outcome: usize,
    target: Decimal,
) -> (Decimal, Decimal) {
    let (shift, qn) = normalize(q);
    let others: Decimal = qn
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != outcome)
        .map(|(_, v)| exp_ratio(*v, b))
        .sum();
    let ratio = target * others / (Decimal::ONE - target);
    let q_new = b * ln_dec(ratio) + shift;
    let amount = q_new - q[outcome];
    let trade_cost = cost_to_buy(q, b, outcome, amount);
    (amount, trade_cost)
}

// 2.6: liquidity change. Given extra funding, the new liquidity parameter is
//
//   new_b = b + funding / ln(sum e^(q_i/b))
//
// and q rescales by new_b/b so prices are unchanged. The divisor is the true
// ln-sum C(q)/b, not the shifted one; for q >= 0 it is at least ln(n) > 0.
pub fn b_for_funding(q: &[Decimal], b: Decimal, funding: Decimal) -> (Decimal, Vec<Decimal>) {
    let ln_sum = cost(q, b) / b;
    let new_b = b + funding / ln_sum;
    let ratio = new_b / b;
    let new_q = q.iter().map(|v| *v * ratio).collect();
    (new_b, new_q)
}

// 2.7: worst-case market maker loss, b * ln(n). The required initial subsidy.
pub fn max_loss(b: Decimal, n_outcomes: usize) -> Decimal {
    b * ln_dec(Decimal::from(n_outcomes as u64))
}
