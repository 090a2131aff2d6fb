use cutover_signals::{
    AdapterError, Environment, HealthError, HealthProbe, HealthReading, HealthSettings,
    HealthSource,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

struct Fixed {
    old: HealthReading,
    new: Mutex<Result<HealthReading, AdapterError>>,
}

#[async_trait::async_trait]
impl HealthSource for Fixed {
    async fn health(&self, env: Environment) -> Result<HealthReading, AdapterError> {
        match env {
            Environment::Old => Ok(self.old),
            Environment::New => self.new.lock().clone(),
        }
    }
}

fn reading(requests: u64, errors: u64, p99_ms: u64) -> HealthReading {
    HealthReading {
        request_count: requests,
        error_count: errors,
        p99_latency: Duration::from_millis(p99_ms),
    }
}

#[tokio::test(start_paused = true)]
async fn poller_fills_both_windows() {
    let source = Arc::new(Fixed {
        old: reading(1000, 1, 80),
        new: Mutex::new(Ok(reading(1000, 50, 120))),
    });
    let probe = Arc::new(HealthProbe::new(HealthSettings::default()));
    let handle = probe.spawn_poller(source, Duration::from_secs(1));

    tokio::time::sleep(Duration::from_millis(1500)).await;
    let window = Duration::from_secs(60);
    assert!(matches!(
        probe.error_rate(Environment::New, window),
        Err(HealthError::InsufficientData { available: 2, required: 3, .. })
    ));

    tokio::time::sleep(Duration::from_secs(1)).await;
    let old = probe.error_rate(Environment::Old, window).unwrap();
    let new = probe.error_rate(Environment::New, window).unwrap();
    assert!((old - 0.001).abs() < 1e-9);
    assert!((new - 0.05).abs() < 1e-9);
    assert_eq!(
        probe.p99_latency(Environment::New, window).unwrap(),
        Duration::from_millis(120)
    );

    let stamps: Vec<_> = probe
        .snapshots(Environment::Old)
        .iter()
        .map(|s| s.timestamp)
        .collect();
    assert!(stamps.windows(2).all(|w| w[0] < w[1]));

    handle.abort();
}

#[tokio::test(start_paused = true)]
async fn narrow_window_excludes_old_snapshots() {
    let source = Arc::new(Fixed {
        old: reading(10, 0, 5),
        new: Mutex::new(Ok(reading(10, 0, 5))),
    });
    let probe = Arc::new(HealthProbe::new(HealthSettings {
        window_capacity: 100,
        min_samples: 3,
    }));
    let handle = probe.spawn_poller(source, Duration::from_secs(10));
    tokio::time::sleep(Duration::from_secs(45)).await;
    handle.abort();

    assert_eq!(probe.snapshots(Environment::Old).len(), 5);
    assert!(probe
        .error_rate(Environment::Old, Duration::from_secs(20))
        .is_ok());
    assert!(matches!(
        probe.error_rate(Environment::Old, Duration::from_secs(15)),
        Err(HealthError::InsufficientData { available: 2, .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn failed_reads_are_counted_per_environment() {
    let source = Arc::new(Fixed {
        old: reading(10, 0, 5),
        new: Mutex::new(Err(AdapterError::Unavailable("metrics".into()))),
    });
    let probe = Arc::new(HealthProbe::new(HealthSettings::default()));

    for _ in 0..3 {
        let failed = probe.poll_once(source.as_ref()).await;
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].0, Environment::New);
    }
    assert_eq!(probe.consecutive_failures(Environment::New), 3);
    assert_eq!(probe.consecutive_failures(Environment::Old), 0);
    assert!(probe.latest(Environment::New).is_none());

    *source.new.lock() = Ok(reading(10, 0, 5));
    assert!(probe.poll_once(source.as_ref()).await.is_empty());
    assert_eq!(probe.consecutive_failures(Environment::New), 0);
    assert!(probe.latest(Environment::New).is_some());
}

#[tokio::test(start_paused = true)]
async fn poller_stops_when_probe_is_dropped() {
    let source = Arc::new(Fixed {
        old: reading(1, 0, 1),
        new: Mutex::new(Ok(reading(1, 0, 1))),
    });
    let probe = Arc::new(HealthProbe::new(HealthSettings::default()));
    let handle = probe.spawn_poller(source, Duration::from_secs(1));
    tokio::time::sleep(Duration::from_millis(100)).await;

    drop(probe);
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(handle.is_finished());
}
