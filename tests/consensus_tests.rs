use analog_quant::consensus::{resolve_consensus, Blocker, ConsensusConfig, Tier, VoteInput};
use analog_quant::model::Direction;

fn close(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-9
}

#[test]
/// 7d BUY 0.6 / 30d SELL 0.5 / 90d SELL 0.7 with default tier weights.
fn closed_form_sell_consensus() {
    let cfg = ConsensusConfig::default();
    let votes = vec![
        VoteInput::new(7, Direction::Buy, 0.6),
        VoteInput::new(30, Direction::Sell, 0.5),
        VoteInput::new(90, Direction::Sell, 0.7),
    ];
    let result = resolve_consensus(&votes, &cfg);
    assert_eq!(result.direction, Direction::Sell);
    assert!(close(result.buy_weight, 0.15));
    assert!(close(result.sell_weight, 0.455));
    assert!(close(result.total_weight, 0.605));
    assert!(close(result.score, 0.455 / 0.605));
    assert!(close(result.dispersion, 1.0 - 0.455 / 0.605));
    assert!(close(result.net_contribution, -0.305));
    assert!(result.multiplier > cfg.min_multiplier && result.multiplier < cfg.max_multiplier);

    let structure = result.tier(Tier::Structure).unwrap();
    assert_eq!(structure.direction(), Direction::Sell);
    assert!(close(structure.net(), -0.28));
}

#[test]
/// 7d BUY 0.8 / 14d BUY 0.7 / 30d SELL 0.6: the timing budget is shared, tactical wins.
fn short_buys_lose_to_tactical_sell() {
    let cfg = ConsensusConfig::default();
    let votes = vec![
        VoteInput::new(7, Direction::Buy, 0.8),
        VoteInput::new(14, Direction::Buy, 0.7),
        VoteInput::new(30, Direction::Sell, 0.6),
    ];
    let result = resolve_consensus(&votes, &cfg);
    assert!(close(result.votes[0].tier_weight, 0.125));
    assert!(close(result.votes[1].tier_weight, 0.125));
    assert!(close(result.buy_weight, 0.1875));
    assert!(close(result.sell_weight, 0.21));
    assert!(close(result.total_weight, 0.3975));
    assert_eq!(result.direction, Direction::Sell);
    assert!(close(result.score, 0.21 / 0.3975));
    assert!((result.score - 0.5283).abs() < 1e-4);
    assert!(close(result.net_contribution, 0.1875 - 0.21));
    let timing = result.tier(Tier::Timing).unwrap();
    assert_eq!(timing.direction(), Direction::Buy);
}

#[test]
/// A tail-risk blocker scales the vote by one minus its penalty.
fn blocker_penalty_reduces_weight() {
    let cfg = ConsensusConfig::default();
    let mut structure = VoteInput::new(90, Direction::Sell, 0.7);
    structure.blockers.push(Blocker::HighTailRisk);
    let votes = vec![
        VoteInput::new(7, Direction::Buy, 0.6),
        VoteInput::new(30, Direction::Sell, 0.5),
        structure,
    ];
    let result = resolve_consensus(&votes, &cfg);
    assert!(close(result.votes[2].effective_weight, 0.28 * 0.65));
    assert!(close(result.sell_weight, 0.175 + 0.182));
    assert!(close(result.score, 0.357 / 0.507));
}

#[test]
fn tier_budget_is_split_between_its_horizons() {
    let cfg = ConsensusConfig::default();
    let votes = vec![
        VoteInput::new(7, Direction::Buy, 1.0),
        VoteInput::new(14, Direction::Buy, 1.0),
    ];
    let result = resolve_consensus(&votes, &cfg);
    assert!(close(result.votes[0].tier_weight, 0.125));
    assert!(close(result.votes[1].tier_weight, 0.125));
    assert_eq!(result.direction, Direction::Buy);
    assert!(close(result.score, 1.0));
    assert_eq!(result.multiplier, cfg.max_multiplier);
}

#[test]
fn reliability_modifier_suppresses_weight() {
    let cfg = ConsensusConfig::default();
    let mut vote = VoteInput::new(30, Direction::Buy, 0.8);
    vote.reliability_modifier = 0.5;
    let result = resolve_consensus(&[vote], &cfg);
    assert!(close(result.votes[0].effective_weight, 0.35 * 0.8 * 0.5));
}

#[test]
fn empty_or_zero_weight_input_holds() {
    let cfg = ConsensusConfig::default();
    let empty = resolve_consensus(&[], &cfg);
    assert_eq!(empty.direction, Direction::Hold);
    assert_eq!(empty.score, 0.0);
    assert_eq!(empty.dispersion, 1.0);
    assert_eq!(empty.multiplier, cfg.min_multiplier);

    let zero = resolve_consensus(&[VoteInput::new(30, Direction::Buy, 0.0)], &cfg);
    assert_eq!(zero.direction, Direction::Hold);
    assert_eq!(zero.score, 0.0);
}

#[test]
fn tied_buy_and_sell_resolve_to_hold() {
    let cfg = ConsensusConfig {
        timing_weight: 0.5,
        tactical_weight: 0.5,
        structure_weight: 0.0,
        ..ConsensusConfig::default()
    };
    let votes = vec![
        VoteInput::new(7, Direction::Buy, 0.6),
        VoteInput::new(30, Direction::Sell, 0.6),
    ];
    let result = resolve_consensus(&votes, &cfg);
    assert_eq!(result.direction, Direction::Hold);
    assert!(close(result.score, 0.5));
}

#[test]
fn invalid_weights_fail_validation() {
    let cfg = ConsensusConfig {
        timing_weight: 0.0,
        tactical_weight: 0.0,
        structure_weight: 0.0,
        ..ConsensusConfig::default()
    };
    assert!(cfg.validate().is_err());
    let band = ConsensusConfig {
        band_lo: 0.9,
        band_hi: 0.3,
        ..ConsensusConfig::default()
    };
    assert!(band.validate().is_err());
    assert!(ConsensusConfig::default().validate().is_ok());
}
