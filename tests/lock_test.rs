//! Integration tests for the worker lease.

use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serial_archiver::clock::{Clock, ManualClock};
use serial_archiver::constants::LOCK_KEY;
use serial_archiver::lock::{LockConfig, LockManager, WorkerIdentity};
use serial_archiver::store::{KvStore, MemoryStore};

const TIMEOUT: Duration = Duration::from_secs(10);

fn config() -> LockConfig {
    LockConfig {
        timeout: TIMEOUT,
        renew_interval: Duration::from_secs(2),
    }
}

fn workers(
    names: &[&str],
) -> (Arc<MemoryStore>, Arc<ManualClock>, Vec<LockManager>) {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::new(1_700_000_000_000));
    let managers = names
        .iter()
        .map(|name| {
            LockManager::new(
                store.clone() as Arc<dyn KvStore>,
                clock.clone() as Arc<dyn Clock>,
                WorkerIdentity::new(*name),
                config(),
            )
        })
        .collect();
    (store, clock, managers)
}

async fn holder(store: &MemoryStore) -> Option<String> {
    let raw = store.get(LOCK_KEY).await.unwrap()?;
    let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
    value["holderId"].as_str().map(ToString::to_string)
}

#[tokio::test]
async fn test_free_lease_is_acquired_and_released() {
    let (store, _clock, managers) = workers(&["a"]);
    let a = &managers[0];

    assert!(a.acquire().await.unwrap());
    assert!(a.is_holder().await.unwrap());
    assert_eq!(holder(&store).await.as_deref(), Some("a"));

    a.release().await.unwrap();
    assert_eq!(holder(&store).await, None);
}

#[tokio::test]
async fn test_fresh_lease_is_refused_to_others() {
    let (store, clock, managers) = workers(&["a", "b"]);
    let (a, b) = (&managers[0], &managers[1]);

    assert!(a.acquire().await.unwrap());
    clock.advance(TIMEOUT);
    assert!(!b.acquire().await.unwrap());
    assert_eq!(holder(&store).await.as_deref(), Some("a"));
}

#[tokio::test]
async fn test_stale_lease_is_taken_over() {
    let (store, clock, managers) = workers(&["a", "b"]);
    let (a, b) = (&managers[0], &managers[1]);

    assert!(a.acquire().await.unwrap());
    clock.advance(TIMEOUT + Duration::from_millis(1));

    assert!(!a.is_holder().await.unwrap());
    assert!(b.acquire().await.unwrap());
    assert_eq!(holder(&store).await.as_deref(), Some("b"));

    // The previous holder must not delete the new holder's lease.
    a.release().await.unwrap();
    assert_eq!(holder(&store).await.as_deref(), Some("b"));
}

#[tokio::test]
async fn test_renewal_by_holder_extends_lease() {
    let (_store, clock, managers) = workers(&["a", "b"]);
    let (a, b) = (&managers[0], &managers[1]);

    assert!(a.acquire().await.unwrap());
    for _ in 0..5 {
        clock.advance(Duration::from_secs(8));
        assert!(a.acquire().await.unwrap());
        assert!(!b.acquire().await.unwrap());
    }
}

#[tokio::test]
async fn test_corrupt_lease_is_overwritten() {
    let (store, _clock, managers) = workers(&["a"]);
    store.set(LOCK_KEY, "not json").await.unwrap();

    assert!(managers[0].acquire().await.unwrap());
    assert_eq!(holder(&store).await.as_deref(), Some("a"));
}

#[tokio::test(start_paused = true)]
async fn test_renewal_task_stops_after_takeover() {
    let (store, clock, managers) = workers(&["a", "b"]);
    let (a, b) = (&managers[0], &managers[1]);

    assert!(a.acquire().await.unwrap());
    let renewal = a.start_renewal();

    // Simulate the holder stalling past the timeout and being replaced.
    clock.advance(TIMEOUT + Duration::from_secs(1));
    assert!(b.acquire().await.unwrap());

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(renewal.is_finished());
    assert_eq!(holder(&store).await.as_deref(), Some("b"));
}

/// Two workers race from an empty store under random interleavings of
/// acquire calls and clock movement. Whoever the stored lease names must
/// have seen `acquire() == true` at the moment it became the holder, and
/// while one keeps renewing inside the timeout the other never takes over.
#[tokio::test]
async fn test_randomized_contention_keeps_one_lineage() {
    for seed in 0..200u64 {
        let mut rng = StdRng::seed_from_u64(seed);
        let (store, clock, managers) = workers(&["a", "b"]);
        let mut believed: [bool; 2] = [false, false];
        let mut last_holder: Option<String> = None;

        for _ in 0..60 {
            let who = rng.gen_range(0..2);
            let step = Duration::from_millis(rng.gen_range(0..4_000));
            clock.advance(step);

            let acquired = managers[who].acquire().await.unwrap();
            believed[who] = acquired;

            let current = holder(&store).await;
            if current != last_holder {
                let new_holder = current.clone().expect("lease is never deleted here");
                let index = usize::from(new_holder == "b");
                assert!(
                    believed[index] && index == who,
                    "seed {seed}: {new_holder} became holder without acquiring"
                );
                last_holder = current;
            }
            if acquired {
                believed[1 - who] = false;
            }
        }

        // Once a lineage renews faster than the timeout, nobody displaces it.
        let survivor = usize::from(last_holder.as_deref() == Some("b"));
        assert!(managers[survivor].acquire().await.unwrap());
        for _ in 0..10 {
            clock.advance(Duration::from_secs(9));
            assert!(!managers[1 - survivor].acquire().await.unwrap(), "seed {seed}");
            assert!(managers[survivor].acquire().await.unwrap(), "seed {seed}");
        }
    }
}
