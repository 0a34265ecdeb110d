//! Sample compute services registered by the server.
//!
//! - `time()`: current UTC time, keep-alive 1s, invalidated every tick
//! - `uptime()`: seconds since start, depends on `time()`
//! - `sum(a, b)`: keep-alive 1s
//! - `composed(parameter)`: session-scoped, combines the three above
//!
//! Because `uptime` and `composed` call `time`, each tick refreshes every
//! subscribed view built on it.

use std::time::{Duration, Instant};

use kinetic_compute::{
    producer_fn, ComputeCache, ComputeConfig, OperationDescriptor, OperationRegistry,
};
use kinetic_core::{ComputationKey, ComputeError, ComputeResult, ConfigError, KeepAlive, Value};
use serde_json::json;
use tokio::sync::watch;
use tokio::time::{interval_at, MissedTickBehavior};

pub const TIME: &str = "time";
pub const UPTIME: &str = "uptime";
pub const SUM: &str = "sum";
pub const COMPOSED: &str = "composed";

const SAMPLE_KEEP_ALIVE_SECS: u64 = 1;

/// Build the sample registry. `started` anchors `uptime`.
pub fn sample_registry(started: Instant) -> Result<OperationRegistry, ConfigError> {
    sample_registry_with(ComputeConfig::default(), started)
}

pub fn sample_registry_with(
    config: ComputeConfig,
    started: Instant,
) -> Result<OperationRegistry, ConfigError> {
    let keep_alive = KeepAlive::from_secs(SAMPLE_KEEP_ALIVE_SECS);
    OperationRegistry::builder_with(config)
        .operation(
            TIME,
            keep_alive,
            producer_fn(|_ctx, _args| async { Ok(Value::from(chrono::Utc::now().to_rfc3339())) }),
        )
        .operation(
            UPTIME,
            keep_alive,
            producer_fn(move |ctx, _args| async move {
                // Recomputed whenever the clock ticks.
                ctx.call(TIME, Vec::new()).await?;
                Ok(json!(round_tenths(started.elapsed().as_secs_f64())))
            }),
        )
        .operation(
            SUM,
            keep_alive,
            producer_fn(|_ctx, args| async move { sum(&args) }),
        )
        .register(
            OperationDescriptor::new(
                COMPOSED,
                producer_fn(|ctx, args| async move {
                    let parameter = match args.first() {
                        Some(Value::String(parameter)) => parameter.clone(),
                        Some(other) => other.to_string(),
                        None => String::new(),
                    };
                    let uptime = ctx.call(UPTIME, Vec::new()).await?;
                    let time = ctx.call(TIME, Vec::new()).await?;
                    let whole_seconds = uptime.as_f64().unwrap_or(0.0).floor() as i64;
                    let sum = ctx
                        .call(
                            SUM,
                            vec![json!(parameter.chars().count()), json!(whole_seconds)],
                        )
                        .await?;
                    Ok(json!({
                        "parameter": parameter,
                        "uptime": uptime,
                        "sum": sum,
                        "time": time,
                        "session": ctx.session().map(|s| s.as_str()),
                    }))
                }),
            )
            .with_keep_alive(keep_alive)
            .session_scoped(),
        )
        .build()
}

/// Add two numbers; integers stay integers.
fn sum(args: &[Value]) -> ComputeResult<Value> {
    let invalid = |reason: &str| ComputeError::InvalidArguments {
        operation: SUM.to_string(),
        reason: reason.to_string(),
    };
    let [a, b] = args else {
        return Err(invalid("expected exactly two arguments"));
    };
    if let (Some(a), Some(b)) = (a.as_i64(), b.as_i64()) {
        return a
            .checked_add(b)
            .map(Value::from)
            .ok_or_else(|| invalid("integer overflow"));
    }
    match (a.as_f64(), b.as_f64()) {
        (Some(a), Some(b)) => Ok(json!(a + b)),
        _ => Err(invalid("arguments must be numbers")),
    }
}

fn round_tenths(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// Invalidate `time()` every `period` until shutdown.
pub async fn time_ticker(cache: ComputeCache, period: Duration, mut shutdown_rx: watch::Receiver<bool>) {
    let key = ComputationKey::new(TIME, Vec::new());
    let mut ticks = interval_at(tokio::time::Instant::now() + period, period);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(period_ms = period.as_millis() as u64, "Time ticker started");

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    tracing::info!("Time ticker shutting down");
                    break;
                }
            }

            _ = ticks.tick() => {
                let report = cache.invalidate(&key);
                tracing::trace!(invalidated = report.len(), "Clock tick");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kinetic_core::Session;

    fn cache() -> ComputeCache {
        ComputeCache::new(sample_registry(Instant::now()).unwrap())
    }

    #[test]
    fn test_sum_arguments() {
        assert_eq!(sum(&[json!(2), json!(3)]).unwrap(), json!(5));
        assert_eq!(sum(&[json!(1.5), json!(2)]).unwrap(), json!(3.5));
        assert!(matches!(
            sum(&[json!(1)]),
            Err(ComputeError::InvalidArguments { .. })
        ));
        assert!(sum(&[json!("a"), json!(1)]).is_err());
        assert!(sum(&[json!(i64::MAX), json!(1)]).is_err());
    }

    #[tokio::test]
    async fn test_sum_failure_is_cached_result() {
        let cache = cache();
        let key = ComputationKey::new(SUM, vec![json!(1)]);
        let result = cache.get_or_compute(&key).await.unwrap();
        assert!(result.is_failure());
    }

    #[tokio::test]
    async fn test_composed_combines_dependencies() {
        let cache = cache();
        let value = cache
            .invoke(COMPOSED, vec![json!("abc")], Some(Session::new("s1")))
            .await
            .unwrap();

        assert_eq!(value["parameter"], "abc");
        assert_eq!(value["session"], "s1");
        assert!(value["time"].is_string());
        assert!(value["uptime"].is_number());
        let uptime = value["uptime"].as_f64().unwrap().floor() as i64;
        assert_eq!(value["sum"], json!(3 + uptime));
    }

    #[tokio::test]
    async fn test_time_invalidation_reaches_dependents() {
        let cache = cache();
        let composed = cache
            .registry()
            .key_for(COMPOSED, vec![json!("x")], Some(Session::new("s")))
            .unwrap();
        let first = cache.get_or_compute(&composed).await.unwrap();

        let report = cache.invalidate(&ComputationKey::new(TIME, Vec::new()));
        assert!(report.contains(&composed));
        assert!(report.contains(&ComputationKey::new(UPTIME, Vec::new())));

        let second = cache.get_or_compute(&composed).await.unwrap();
        assert!(second.version() > first.version());
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_ticker_invalidates_and_stops() {
        let cache = cache();
        let key = ComputationKey::new(TIME, Vec::new());
        let first = cache.get_or_compute(&key).await.unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let ticker = tokio::spawn(time_ticker(
            cache.clone(),
            Duration::from_millis(100),
            shutdown_rx,
        ));

        tokio::time::sleep(Duration::from_millis(150)).await;
        let entry = cache.entry(&key).unwrap();
        assert!(!entry.validity.is_valid());

        let second = cache.get_or_compute(&key).await.unwrap();
        assert!(second.version() > first.version());

        shutdown_tx.send(true).unwrap();
        ticker.await.unwrap();
    }
}
