use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use serde_json::json;

use crate::analog::engine::{AnalogEngine, JsonFileCandleSource, MatchRequest};
use crate::clock::{parse_date_ms, Clock, SystemClock};
use crate::config::{parse_interval_ms, Config, EngineConfig};
use crate::outcome::{
    OutcomeResolver, PredictionSnapshot, ResolverConfig, SeriesPriceLookup, SnapshotStore,
};
use crate::pipeline::{SignalPipeline, SignalRequest};
use crate::shadow::{ParamOverrides, PromotionPolicy, ShadowRegistry};
use crate::sizing::Preset;
use crate::store::SqliteStore;
use crate::sweep::{run_sweep, sweep_grid, WalkForwardOptions};

pub const USAGE: &str = "\
usage: analog-quant <command> [options]

commands:
  match   <candles> <SYMBOL> [--tf 1d] [--horizon 30] [--as-of YYYY-MM-DD]
  signal  <candles> <SYMBOL> [--tf 1d] [--preset balanced] [--as-of YYYY-MM-DD] [--record]
  resolve <candles> [--max 500]
  sweep   <candles> <SYMBOL> [--tf 1d] [--horizon 30] [--points 60]
  shadow-add <name> [--window 30|60|90] [--min-sim 0.4] [--top-k 20] [--decay 0.15]
  shadows

<candles> is a JSON candle file, or a directory of SYMBOL_tf.json files.";

const SHADOW_FLUSH_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Match {
        source: PathBuf,
        symbol: String,
        timeframe: String,
        horizon_days: u32,
        as_of_ms: Option<u64>,
    },
    Signal {
        source: PathBuf,
        symbol: String,
        timeframe: String,
        preset: Preset,
        as_of_ms: Option<u64>,
        record: bool,
    },
    Resolve {
        source: PathBuf,
        max: usize,
    },
    Sweep {
        source: PathBuf,
        symbol: String,
        timeframe: String,
        horizon_days: u32,
        max_points: usize,
    },
    ShadowAdd {
        name: String,
        params: ParamOverrides,
    },
    Shadows,
    Help,
}

struct ArgCursor<'a> {
    positional: Vec<&'a str>,
    flags: Vec<(&'a str, Option<&'a str>)>,
}

impl<'a> ArgCursor<'a> {
    fn new(args: &'a [String]) -> Self {
        let mut positional = Vec::new();
        let mut flags = Vec::new();
        let mut i = 0;
        while i < args.len() {
            let a = args[i].as_str();
            if let Some(name) = a.strip_prefix("--") {
                let value = args
                    .get(i + 1)
                    .map(String::as_str)
                    .filter(|v| !v.starts_with("--"));
                if value.is_some() {
                    i += 1;
                }
                flags.push((name, value));
            } else {
                positional.push(a);
            }
            i += 1;
        }
        Self { positional, flags }
    }

    fn positional(&self, idx: usize, what: &str) -> Result<&'a str> {
        self.positional
            .get(idx)
            .copied()
            .ok_or_else(|| anyhow!("missing {}", what))
    }

    fn flag(&self, name: &str) -> Option<&'a str> {
        self.flags
            .iter()
            .find(|(n, _)| *n == name)
            .and_then(|(_, v)| *v)
    }

    fn switch(&self, name: &str) -> bool {
        self.flags.iter().any(|(n, _)| *n == name)
    }

    fn parsed<T: std::str::FromStr>(&self, name: &str, default: T) -> Result<T> {
        match self.flag(name) {
            Some(v) => v
                .parse()
                .map_err(|_| anyhow!("invalid value '{}' for --{}", v, name)),
            None => Ok(default),
        }
    }

    fn timeframe(&self) -> Result<String> {
        let tf = self.flag("tf").unwrap_or("1d");
        parse_interval_ms(tf)?;
        Ok(tf.to_string())
    }

    fn as_of(&self) -> Result<Option<u64>> {
        self.flag("as-of")
            .map(|d| parse_date_ms(d).ok_or_else(|| anyhow!("invalid --as-of '{}', expected YYYY-MM-DD", d)))
            .transpose()
    }
}

pub fn parse_args(args: &[String]) -> Result<Command> {
    let Some((cmd, rest)) = args.split_first() else {
        return Ok(Command::Help);
    };
    let a = ArgCursor::new(rest);
    let command = match cmd.trim().to_ascii_lowercase().as_str() {
        "match" => Command::Match {
            source: PathBuf::from(a.positional(0, "candle source")?),
            symbol: a.positional(1, "symbol")?.to_ascii_uppercase(),
            timeframe: a.timeframe()?,
            horizon_days: a.parsed("horizon", 30u32)?,
            as_of_ms: a.as_of()?,
        },
        "signal" => Command::Signal {
            source: PathBuf::from(a.positional(0, "candle source")?),
            symbol: a.positional(1, "symbol")?.to_ascii_uppercase(),
            timeframe: a.timeframe()?,
            preset: match a.flag("preset") {
                Some(p) => Preset::parse(p).ok_or_else(|| anyhow!("unknown preset '{}'", p))?,
                None => Preset::Balanced,
            },
            as_of_ms: a.as_of()?,
            record: a.switch("record"),
        },
        "resolve" => Command::Resolve {
            source: PathBuf::from(a.positional(0, "candle source")?),
            max: a.parsed("max", 500usize)?,
        },
        "sweep" => Command::Sweep {
            source: PathBuf::from(a.positional(0, "candle source")?),
            symbol: a.positional(1, "symbol")?.to_ascii_uppercase(),
            timeframe: a.timeframe()?,
            horizon_days: a.parsed("horizon", 30u32)?,
            max_points: a.parsed("points", 60usize)?,
        },
        "shadow-add" => Command::ShadowAdd {
            name: a.positional(0, "model name")?.to_string(),
            params: ParamOverrides {
                window_len: a.flag("window").map(str::parse).transpose().context("invalid --window")?,
                min_similarity: a.flag("min-sim").map(str::parse).transpose().context("invalid --min-sim")?,
                top_k: a.flag("top-k").map(str::parse).transpose().context("invalid --top-k")?,
                age_decay_per_year: a.flag("decay").map(str::parse).transpose().context("invalid --decay")?,
                ..ParamOverrides::default()
            },
        },
        "shadows" => Command::Shadows,
        "help" | "-h" | "--help" => Command::Help,
        other => bail!("unknown command '{}'", other),
    };
    Ok(command)
}

/// Distinct (symbol, timeframe) series the pending snapshots need, in a stable order.
fn pending_series(pending: &[PredictionSnapshot]) -> BTreeSet<(String, String)> {
    pending
        .iter()
        .map(|s| (s.symbol.clone(), s.timeframe.clone()))
        .collect()
}

fn engine_for(source: &Path, cfg: &EngineConfig, clock: Arc<dyn Clock>) -> AnalogEngine<JsonFileCandleSource> {
    AnalogEngine::new(JsonFileCandleSource::new(source), clock, cfg.cache_ttl_ms)
}

/// Execute one command and return its JSON report.
pub async fn execute(command: Command, config: &Config) -> Result<serde_json::Value> {
    let cfg = config.engine_config()?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    match command {
        Command::Help => Ok(json!({ "usage": USAGE })),
        Command::Match {
            source,
            symbol,
            timeframe,
            horizon_days,
            as_of_ms,
        } => {
            let engine = engine_for(&source, &cfg, clock);
            let req = MatchRequest::new(&symbol, &timeframe, horizon_days).as_of(as_of_ms);
            let resp = engine.match_pattern(&req, &cfg).await?;
            Ok(serde_json::to_value(resp)?)
        }
        Command::Signal {
            source,
            symbol,
            timeframe,
            preset,
            as_of_ms,
            record,
        } => {
            let store = Arc::new(SqliteStore::open(&config.storage.db_path)?);
            let registry = Arc::new(ShadowRegistry::new(
                store.clone(),
                clock.clone(),
                PromotionPolicy::default(),
            ));
            let pipeline = SignalPipeline::new(engine_for(&source, &cfg, clock), store, cfg)
                .with_shadows(registry, WalkForwardOptions::default());
            let mut req = SignalRequest::new(&symbol, &timeframe, preset);
            req.as_of_ms = as_of_ms;
            req.record = record;
            let decision = pipeline.run(&req).await?;
            // One-shot process: let shadow models record before the runtime shuts down.
            pipeline.flush_shadows(SHADOW_FLUSH_TIMEOUT).await;
            Ok(serde_json::to_value(decision)?)
        }
        Command::Resolve { source, max } => {
            let store = Arc::new(SqliteStore::open(&config.storage.db_path)?);
            let now = clock.now_ms();
            let engine = engine_for(&source, &cfg, clock);
            let mut prices = SeriesPriceLookup::new();
            for (symbol, timeframe) in pending_series(&store.pending_snapshots(now, max)?) {
                let bar_ms = match parse_interval_ms(&timeframe) {
                    Ok(ms) => ms,
                    Err(err) => {
                        tracing::warn!(symbol = %symbol, timeframe = %timeframe, error = %err, "snapshot timeframe not understood");
                        continue;
                    }
                };
                match engine.history(&symbol, &timeframe).await {
                    Ok(series) => prices.insert(&symbol, &timeframe, bar_ms, series),
                    Err(err) => tracing::warn!(symbol = %symbol, timeframe = %timeframe, error = %err, "no prices for pending snapshots"),
                }
            }
            let resolver = OutcomeResolver::new(
                store,
                ResolverConfig {
                    flat_band: cfg.flat_band,
                    hold_band: cfg.hold_band,
                    bucket_count: cfg.calibration.buckets,
                    ..ResolverConfig::default()
                },
            );
            Ok(serde_json::to_value(resolver.run(&prices, now, max)?)?)
        }
        Command::Sweep {
            source,
            symbol,
            timeframe,
            horizon_days,
            max_points,
        } => {
            let engine = engine_for(&source, &cfg, clock);
            let candles = engine.history(&symbol, &timeframe).await?;
            let grid = sweep_grid(&cfg, &[30, 60, 90], &[0.2, 0.3, 0.4, 0.5]);
            let opts = WalkForwardOptions {
                max_points,
                ..WalkForwardOptions::default()
            };
            let results = run_sweep(candles, grid, horizon_days, opts).await;
            Ok(serde_json::to_value(results)?)
        }
        Command::ShadowAdd { name, params } => {
            let store = Arc::new(SqliteStore::open(&config.storage.db_path)?);
            let registry = ShadowRegistry::new(store, clock, PromotionPolicy::default());
            Ok(serde_json::to_value(registry.register(&name, &cfg, params)?)?)
        }
        Command::Shadows => {
            let store = Arc::new(SqliteStore::open(&config.storage.db_path)?);
            let registry = ShadowRegistry::new(store, clock, PromotionPolicy::default());
            let models: Vec<serde_json::Value> = registry
                .tracking()?
                .into_iter()
                .map(|m| {
                    json!({
                        "id": m.id,
                        "name": m.name,
                        "status": m.status,
                        "samples": m.samples,
                        "hit_rate": m.hit_rate(),
                        "hit_rate_delta": m.hit_rate_delta(),
                        "return_delta": m.return_delta(),
                    })
                })
                .collect();
            Ok(json!({ "models": models }))
        }
    }
}
