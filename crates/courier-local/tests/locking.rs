use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use courier_core::{CourierError, LockConfig, LockKind, LockManager, LockStore, WithLockError};
use courier_local::MemoryLockStore;
use tokio::sync::Barrier;

const LEASE: Duration = Duration::from_secs(30);

fn setup() -> (LockManager, Arc<MemoryLockStore>) {
    let store = Arc::new(MemoryLockStore::new());
    let config = LockConfig {
        retry_base: Duration::from_millis(5),
        retry_max: Duration::from_millis(50),
        ..LockConfig::default()
    };
    (LockManager::with_config(store.clone(), config), store)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_mutual_exclusion_under_contention() {
    let (locks, _store) = setup();

    const NUM_TASKS: usize = 10;
    let barrier = Arc::new(Barrier::new(NUM_TASKS));
    let active = Arc::new(AtomicUsize::new(0));
    let max_active = Arc::new(AtomicUsize::new(0));
    let completed = Arc::new(AtomicUsize::new(0));
    let mut handles = vec![];

    for i in 0..NUM_TASKS {
        let locks = locks.clone();
        let barrier = Arc::clone(&barrier);
        let active = Arc::clone(&active);
        let max_active = Arc::clone(&max_active);
        let completed = Arc::clone(&completed);

        handles.push(tokio::spawn(async move {
            barrier.wait().await;

            let token = locks
                .acquire("shared-resource", Duration::from_secs(20), LEASE)
                .await
                .expect("acquire failed")
                .unwrap_or_else(|| panic!("task {} failed to acquire lock", i));

            // Critical section
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            max_active.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            active.fetch_sub(1, Ordering::SeqCst);
            completed.fetch_add(1, Ordering::SeqCst);

            assert!(locks.release(&token).await.expect("release failed"));
        }));
    }

    for handle in handles {
        handle.await.expect("task panicked");
    }

    assert_eq!(completed.load(Ordering::SeqCst), NUM_TASKS);
    assert_eq!(max_active.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_user_42_scenario() {
    let (locks, _store) = setup();
    let lease = Duration::from_secs(5);

    let first = locks.acquire("user:42", Duration::ZERO, lease).await.unwrap();
    assert!(first.is_some());

    // Second holder with no wait: refused immediately.
    let second = locks.acquire("user:42", Duration::ZERO, lease).await.unwrap();
    assert!(second.is_none());

    // Not before the lease ends...
    tokio::time::advance(Duration::from_millis(4_999)).await;
    assert!(locks
        .try_acquire("user:42", lease)
        .await
        .unwrap()
        .is_none());

    // ...but right after.
    tokio::time::advance(Duration::from_millis(1)).await;
    let fresh = locks.acquire("user:42", Duration::ZERO, lease).await.unwrap();
    assert!(fresh.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_stale_holder_cannot_release_new_holder() {
    let (locks, _store) = setup();

    let stale = locks
        .try_acquire("invoice:7", Duration::from_secs(1))
        .await
        .unwrap()
        .unwrap();
    tokio::time::advance(Duration::from_secs(2)).await;

    let current = locks.try_acquire("invoice:7", LEASE).await.unwrap().unwrap();
    assert_ne!(stale.holder(), current.holder());

    assert!(!locks.release(&stale).await.unwrap());
    assert!(locks.is_locked("invoice:7").await.unwrap());
    assert!(locks.is_held_by(&current).await.unwrap());
    assert!(!locks.is_held_by(&stale).await.unwrap());

    assert!(locks.release(&current).await.unwrap());
    assert!(!locks.release(&current).await.unwrap());
    assert!(!locks.is_locked("invoice:7").await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_renew_extends_only_own_lease() {
    let (locks, _store) = setup();

    let mut token = locks
        .try_acquire("report", Duration::from_secs(5))
        .await
        .unwrap()
        .unwrap();
    tokio::time::advance(Duration::from_secs(4)).await;

    assert!(locks.renew(&mut token, Duration::from_secs(10)).await.unwrap());
    assert_eq!(token.lease(), Duration::from_secs(10));

    tokio::time::advance(Duration::from_secs(6)).await;
    assert!(locks.is_held_by(&token).await.unwrap());
    assert_eq!(
        locks.remaining_lease("report").await.unwrap(),
        Some(Duration::from_secs(4))
    );

    tokio::time::advance(Duration::from_secs(4)).await;
    assert!(!locks.renew(&mut token, LEASE).await.unwrap());
}

#[tokio::test]
async fn test_default_lock_timings() {
    let (locks, store) = setup();

    let token = locks.lock("orders").await.unwrap().unwrap();
    assert_eq!(token.lease(), Duration::from_secs(30));
    assert_eq!(token.kind(), LockKind::Exclusive);
    assert_eq!(token.store_key(), "lock:orders");
    assert_eq!(locks.backend_name(), "memory");

    assert_eq!(
        store.get("lock:orders").await.unwrap().as_deref(),
        Some(token.holder())
    );
}

#[tokio::test]
async fn test_force_release() {
    let (locks, _store) = setup();

    let token = locks.try_acquire("stuck", LEASE).await.unwrap().unwrap();
    assert!(locks.force_release("stuck").await.unwrap());
    assert!(!locks.is_held_by(&token).await.unwrap());
    assert!(locks.try_acquire("stuck", LEASE).await.unwrap().is_some());
}

#[tokio::test]
async fn test_with_lock_outcomes() {
    let (locks, _store) = setup();

    let value = locks
        .with_lock("job", Duration::ZERO, LEASE, || async {
            Ok::<_, CourierError>(42)
        })
        .await
        .unwrap();
    assert_eq!(value, 42);
    assert!(!locks.is_locked("job").await.unwrap());

    let failed = locks
        .with_lock("job", Duration::ZERO, LEASE, || async {
            Err::<(), _>(CourierError::Handler("boom".to_string()))
        })
        .await;
    assert!(matches!(failed, Err(WithLockError::Body(_))));
    assert!(!locks.is_locked("job").await.unwrap());

    let held = locks.try_acquire("job", LEASE).await.unwrap().unwrap();
    let mut ran = false;
    let contended: Result<(), WithLockError<CourierError>> = locks
        .with_lock("job", Duration::ZERO, LEASE, || {
            ran = true;
            async { Ok(()) }
        })
        .await;
    assert!(contended.as_ref().unwrap_err().is_not_acquired());
    assert!(!ran);
    locks.release(&held).await.unwrap();
}

#[tokio::test]
async fn test_with_lock_releases_when_cancelled() {
    let (locks, _store) = setup();

    let worker = locks.clone();
    let handle = tokio::spawn(async move {
        worker
            .with_lock("job", Duration::ZERO, LEASE, || async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok::<_, CourierError>(())
            })
            .await
    });

    while !locks.is_locked("job").await.unwrap() {
        tokio::task::yield_now().await;
    }
    handle.abort();
    assert!(handle.await.unwrap_err().is_cancelled());

    // The guard spawned its release when the future was dropped.
    for _ in 0..10 {
        if !locks.is_locked("job").await.unwrap() {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert!(!locks.is_locked("job").await.unwrap());
}

#[tokio::test]
async fn test_guard_release_and_drop() {
    let (locks, _store) = setup();

    let guard = locks
        .guard("cart:1", Duration::ZERO, LEASE)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(guard.token().key(), "cart:1");
    assert!(guard.release().await.unwrap());

    let guard = locks
        .guard("cart:1", Duration::ZERO, LEASE)
        .await
        .unwrap()
        .unwrap();
    let token = guard.into_token();
    assert!(locks.is_held_by(&token).await.unwrap());
    assert!(locks.release(&token).await.unwrap());
}

#[tokio::test]
async fn test_read_write_exclusion() {
    let (locks, _store) = setup();
    let wait = Duration::ZERO;

    let r1 = locks.acquire_read("doc:9", wait, LEASE).await.unwrap().unwrap();
    let r2 = locks.acquire_read("doc:9", wait, LEASE).await.unwrap().unwrap();
    assert_eq!(locks.reader_count("doc:9").await.unwrap(), 2);
    assert!(locks.acquire_write("doc:9", wait, LEASE).await.unwrap().is_none());

    // Readers alone do not make the key locked.
    assert!(!locks.is_locked("doc:9").await.unwrap());

    assert!(locks.release_read(&r1).await.unwrap());
    assert!(locks.acquire_write("doc:9", wait, LEASE).await.unwrap().is_none());
    assert!(locks.release_read(&r2).await.unwrap());

    let w = locks.acquire_write("doc:9", wait, LEASE).await.unwrap().unwrap();
    assert!(locks.is_write_locked("doc:9").await.unwrap());
    assert!(locks.is_locked("doc:9").await.unwrap());
    assert!(locks.acquire_read("doc:9", wait, LEASE).await.unwrap().is_none());
    assert!(locks.acquire_write("doc:9", wait, LEASE).await.unwrap().is_none());
    assert!(locks.is_held_by(&w).await.unwrap());

    // Tokens must be released through the matching call.
    assert!(matches!(
        locks.release_read(&w).await,
        Err(CourierError::InvalidArgument(_))
    ));
    assert!(locks.release_write(&w).await.unwrap());
    assert!(locks.acquire_read("doc:9", wait, LEASE).await.unwrap().is_some());
}

#[tokio::test(start_paused = true)]
async fn test_unbounded_wait_and_lease() {
    let (locks, _store) = setup();

    let forever = locks
        .try_acquire("user:42", Duration::MAX)
        .await
        .unwrap()
        .unwrap();
    assert!(locks.is_held_by(&forever).await.unwrap());
    assert!(locks.remaining_lease("user:42").await.unwrap().is_some());
    assert!(locks.release(&forever).await.unwrap());

    let holder = locks
        .acquire("user:42", Duration::MAX, Duration::from_secs(5))
        .await
        .unwrap()
        .unwrap();
    assert!(locks.is_held_by(&holder).await.unwrap());

    // Waits without bound until the 5s lease lapses.
    let next = locks
        .acquire("user:42", Duration::MAX, LEASE)
        .await
        .unwrap()
        .unwrap();
    assert!(locks.is_held_by(&next).await.unwrap());
    assert!(!locks.is_held_by(&holder).await.unwrap());

    let reader = locks
        .acquire_read("doc:1", Duration::MAX, Duration::MAX)
        .await
        .unwrap()
        .unwrap();
    assert!(locks.release_read(&reader).await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_writer_waits_for_reader_lease() {
    let (locks, _store) = setup();

    let _reader = locks
        .acquire_read("doc:3", Duration::ZERO, Duration::from_secs(2))
        .await
        .unwrap()
        .unwrap();

    // The abandoned read lease expires while the writer is waiting.
    let writer = locks
        .acquire_write("doc:3", Duration::from_secs(5), LEASE)
        .await
        .unwrap();
    assert!(writer.is_some());
}

#[tokio::test]
async fn test_store_outage_is_an_error() {
    let (locks, store) = setup();
    let token = locks.try_acquire("user:1", LEASE).await.unwrap().unwrap();

    store.set_reachable(false);
    assert!(locks
        .try_acquire("user:2", LEASE)
        .await
        .unwrap_err()
        .is_unavailable());
    assert!(locks.release(&token).await.unwrap_err().is_unavailable());

    store.set_reachable(true);
    assert!(locks.release(&token).await.unwrap());
}
