use std::collections::HashMap;

use analog_quant::analog::{match_series, retrieve, MatchRequest};
use analog_quant::clock::{calendar_year, parse_date_ms, DAY_MS};
use analog_quant::config::{EngineConfig, SimilarityFloor};
use analog_quant::error::EngineError;
use analog_quant::model::Candle;

fn lcg_series(n: usize, seed: u64, start_ms: u64) -> Vec<Candle> {
    let mut state = seed;
    let mut price = 100.0;
    (0..n)
        .map(|i| {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            let u = (state >> 11) as f64 / (1u64 << 53) as f64;
            price *= 1.0 + (u - 0.5) * 0.04;
            Candle::from_close(start_ms + i as u64 * DAY_MS, price)
        })
        .collect()
}

fn start_2015() -> u64 {
    parse_date_ms("2015-01-01").unwrap()
}

#[test]
/// Similarities stay within cosine bounds for every supported window length.
fn similarity_is_bounded_for_all_window_lengths() {
    let candles = lcg_series(1500, 7, start_2015());
    for w in [30, 60, 90] {
        let cfg = EngineConfig::builder()
            .window_len(w)
            .min_similarity(0.0)
            .build()
            .unwrap();
        let result = retrieve(&candles, &cfg, 30).unwrap();
        assert!(!result.insufficient_history);
        assert!(!result.matches.is_empty(), "window {} found nothing", w);
        for m in &result.matches {
            assert!((-1.0..=1.0).contains(&m.similarity), "{}", m.similarity);
            assert!(m.age_weight > 0.0 && m.age_weight <= 1.0);
        }
    }
}

#[test]
/// No match ends closer to the query than the configured gap, and none peeks past it.
fn matches_respect_min_gap_and_forward_window() {
    let candles = lcg_series(1500, 11, start_2015());
    let cfg = EngineConfig::builder()
        .min_similarity(0.0)
        .min_gap_days(120)
        .build()
        .unwrap();
    let result = retrieve(&candles, &cfg, 30).unwrap();
    let pattern = result.pattern.unwrap();
    assert!(!result.matches.is_empty());
    for m in &result.matches {
        assert!(m.distance_days >= 120);
        assert!(m.end_ts + 30 * DAY_MS <= pattern.end_ts);
    }
}

#[test]
fn per_year_cap_limits_matches() {
    let candles = lcg_series(2500, 3, start_2015());
    let cfg = EngineConfig::builder()
        .min_similarity(0.0)
        .top_k(40)
        .max_matches_per_year(Some(2))
        .regime_conditioning(false)
        .build()
        .unwrap();
    let result = retrieve(&candles, &cfg, 30).unwrap();
    let mut per_year: HashMap<i32, usize> = HashMap::new();
    for m in &result.matches {
        *per_year.entry(calendar_year(m.end_ts)).or_default() += 1;
    }
    assert!(!per_year.is_empty());
    assert!(per_year.values().all(|count| *count <= 2), "{:?}", per_year);
}

#[test]
/// Ranking is by decayed score, and older matches carry smaller age weights.
fn matches_are_ranked_by_decayed_score() {
    let candles = lcg_series(2000, 19, start_2015());
    let cfg = EngineConfig::builder()
        .min_similarity(0.0)
        .age_decay(Some(0.3))
        .build()
        .unwrap();
    let result = retrieve(&candles, &cfg, 30).unwrap();
    assert!(result.matches.len() > 2);
    for pair in result.matches.windows(2) {
        assert!(pair[0].final_score >= pair[1].final_score);
    }
    let mut by_age = result.matches.clone();
    by_age.sort_by_key(|m| m.distance_days);
    for pair in by_age.windows(2) {
        assert!(pair[0].age_weight >= pair[1].age_weight);
    }
    for m in &result.matches {
        assert!((m.final_score - m.similarity * m.age_weight).abs() < 1e-12);
    }
}

#[test]
/// A scaled copy of the current window planted in the past is the top analog.
fn exact_repeated_pattern_ranks_first() {
    let mut candles = lcg_series(900, 23, start_2015());
    let n = candles.len();
    let w = 60;
    let planted_end = 359;
    for k in 0..w {
        let src = candles[n - w + k].close;
        candles[planted_end + 1 - w + k].close = src * 0.5;
    }
    let cfg = EngineConfig::builder()
        .window_len(w)
        .min_similarity(0.0)
        .age_decay(None)
        .regime_conditioning(false)
        .max_matches_per_year(None)
        .build()
        .unwrap();
    let result = retrieve(&candles, &cfg, 30).unwrap();
    let best = &result.matches[0];
    assert_eq!(best.end_index, planted_end);
    assert!(best.similarity > 0.999, "{}", best.similarity);
    assert_eq!(best.end_ts, candles[planted_end].open_time_ms);
}

#[test]
/// Requests pinned to a past date see nothing at or after that date.
fn as_of_hides_the_future() {
    let candles = lcg_series(3200, 31, start_2015());
    let as_of = parse_date_ms("2021-06-01").unwrap();
    let cfg = EngineConfig::builder().min_similarity(0.0).build().unwrap();
    let req = MatchRequest::new("btcusdt", "1d", 30).as_of(Some(as_of));
    let resp = match_series(&candles, &req, &cfg).unwrap();
    assert!(resp.ok);
    assert_eq!(resp.symbol, "BTCUSDT");
    let pattern = resp.pattern.unwrap();
    assert!(pattern.end_ts < as_of);
    assert_eq!(pattern.end_ts, as_of - DAY_MS);
    assert!(!resp.matches.is_empty());
    for m in &resp.matches {
        assert!(m.end_ts + 30 * DAY_MS <= pattern.end_ts);
    }
    assert!(resp.safety.context_only);
    assert!(!resp.safety.training_eligible);
}

#[test]
fn short_history_is_reported_not_failed() {
    let candles = lcg_series(100, 5, start_2015());
    let cfg = EngineConfig::default();
    let req = MatchRequest::new("ETHUSDT", "1d", 30);
    let resp = match_series(&candles, &req, &cfg).unwrap();
    assert!(resp.ok);
    assert!(resp.insufficient_history);
    assert!(resp.matches.is_empty());
    assert_eq!(resp.forward_stats.sample_size, 0);
}

#[test]
fn unsupported_window_is_rejected() {
    let err = EngineConfig::builder().window_len(45).build().unwrap_err();
    assert!(matches!(err, EngineError::InvalidWindowSize(45)));
    assert!(err.is_rejection());
}

#[test]
fn negative_similarity_floors_are_rejected() {
    let err = EngineConfig::builder().min_similarity(-0.5).build().unwrap_err();
    assert!(matches!(err, EngineError::InvalidConfig(_)));
    let err = EngineConfig::builder()
        .floor(SimilarityFloor::Quantile {
            q: 0.6,
            floor_min: -0.1,
        })
        .build()
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidConfig(_)));
}

#[test]
/// Two exact copies of the query at different ages: the younger one ranks ahead, and a
/// mirrored (anti-correlated) copy never becomes a match.
fn equal_similarity_prefers_the_younger_copy() {
    let mut candles = lcg_series(900, 29, start_2015());
    let n = candles.len();
    let w = 60;
    let (older_end, mirrored_end, younger_end) = (359, 500, 659);
    let query: Vec<f64> = candles[n - w..].iter().map(|c| c.close).collect();
    let mean = query.iter().sum::<f64>() / w as f64;
    for (k, q) in query.iter().enumerate() {
        candles[older_end + 1 - w + k].close = q * 0.5;
        candles[younger_end + 1 - w + k].close = q * 0.8;
        candles[mirrored_end + 1 - w + k].close = 2.0 * mean - q;
    }
    let cfg = EngineConfig::builder()
        .window_len(w)
        .min_similarity(0.0)
        .top_k(40)
        .age_decay(Some(0.1))
        .regime_conditioning(false)
        .max_matches_per_year(None)
        .build()
        .unwrap();
    let result = retrieve(&candles, &cfg, 30).unwrap();

    let rank = |end: usize| result.matches.iter().position(|m| m.end_index == end);
    let older = rank(older_end).expect("older copy matched");
    let younger = rank(younger_end).expect("younger copy matched");
    assert!(younger < older);
    let (o, y) = (&result.matches[older], &result.matches[younger]);
    assert!((o.similarity - y.similarity).abs() < 1e-9);
    assert!(o.age_weight < y.age_weight);
    assert!(o.final_score < y.final_score);

    assert_eq!(rank(mirrored_end), None);
    assert!(result
        .matches
        .iter()
        .all(|m| m.similarity >= 0.0 && m.final_score >= 0.0));
}

#[test]
/// BTC-style request pinned to 2021-06-01 with the production retrieval settings.
fn pinned_request_with_default_floor_stays_in_the_past() {
    let candles = lcg_series(3200, 31, start_2015());
    let as_of = parse_date_ms("2021-06-01").unwrap();
    let cfg = EngineConfig::builder()
        .window_len(60)
        .min_similarity(0.30)
        .min_gap_days(60)
        .build()
        .unwrap();
    let req = MatchRequest::new("BTCUSDT", "1d", 30).as_of(Some(as_of));
    let resp = match_series(&candles, &req, &cfg).unwrap();
    assert!(resp.ok);
    assert!(!resp.insufficient_history);
    assert!(resp.matches.len() <= cfg.retrieval().top_k);
    let pattern = resp.pattern.unwrap();
    assert!(pattern.end_ts < as_of);
    for m in &resp.matches {
        assert!(m.end_ts < as_of);
        assert!(m.similarity >= 0.30);
        assert!(m.distance_days >= 60);
        assert!(m.end_ts + 30 * DAY_MS <= pattern.end_ts);
    }
}
