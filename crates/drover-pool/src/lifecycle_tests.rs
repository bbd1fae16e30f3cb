//! Cross-component tests for the worker lifecycle.
//!
//! These tests drive the watcher and the pool together with fake processes:
//! - Exclusive checkout under concurrent take/release
//! - Container capacity and eviction
//! - Crash replacement
//! - Reset and destroy while work is in flight
//! - Allocation retries and the events they emit

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::time::Duration;

    use drover_core::logging::init_test_logging;
    use drover_core::{DroverError, PoolConfig};
    use futures_util::future::join_all;
    use parking_lot::Mutex;
    use tokio_util::sync::CancellationToken;

    use crate::allocator::Allocator;
    use crate::events::{EventBus, EventType};
    use crate::pool::Pool;
    use crate::state::WorkerState;
    use crate::testing::{FakeAllocator, collect_events, drain_events, eventually};
    use crate::watcher::WorkerWatcher;

    const SETTLE: Duration = Duration::from_secs(3);

    fn watcher(
        alloc: &Arc<FakeAllocator>,
        n: u64,
        timeout: Duration,
    ) -> (WorkerWatcher, Arc<EventBus>) {
        let events = Arc::new(EventBus::new());
        let allocator: Arc<dyn Allocator> = alloc.clone();
        (
            WorkerWatcher::new(allocator, n, timeout, Arc::clone(&events)),
            events,
        )
    }

    // =========================================================================
    // Exclusive Checkout
    // =========================================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_take_release_is_exclusive() {
        init_test_logging();
        let alloc = FakeAllocator::new(1);
        let (ww, _events) = watcher(&alloc, 4, Duration::ZERO);
        ww.watch(alloc.spawn_many(4));

        let in_use: Arc<Mutex<HashSet<u32>>> = Arc::new(Mutex::new(HashSet::new()));
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let ww = ww.clone();
            let in_use = Arc::clone(&in_use);
            tasks.push(tokio::spawn(async move {
                for _ in 0..50 {
                    let w = ww.take(&CancellationToken::new()).await.unwrap();
                    assert!(in_use.lock().insert(w.pid()), "pid {} handed out twice", w.pid());
                    tokio::task::yield_now().await;
                    assert!(in_use.lock().remove(&w.pid()));
                    ww.release(w);
                }
            }));
        }
        for result in join_all(tasks).await {
            result.unwrap();
        }

        assert_eq!(ww.idle(), 4);
        assert_eq!(alloc.calls(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_pool_checkouts_are_exclusive() {
        let alloc = FakeAllocator::new(1);
        let allocator: Arc<dyn Allocator> = alloc.clone();
        let pool = Arc::new(
            Pool::new(PoolConfig::new(3), allocator, Arc::new(EventBus::new()))
                .await
                .unwrap(),
        );

        let in_use: Arc<Mutex<HashSet<u32>>> = Arc::new(Mutex::new(HashSet::new()));
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let pool = Arc::clone(&pool);
            let in_use = Arc::clone(&in_use);
            tasks.push(tokio::spawn(async move {
                for _ in 0..25 {
                    let w = pool.checkout(&CancellationToken::new()).await.unwrap();
                    assert!(in_use.lock().insert(w.pid()));
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    in_use.lock().remove(&w.pid());
                }
            }));
        }
        for result in join_all(tasks).await {
            result.unwrap();
        }

        let execs: u64 = pool.workers().iter().map(|w| w.state().num_execs()).sum();
        assert_eq!(execs, 8 * 25);
    }

    // =========================================================================
    // Capacity
    // =========================================================================

    #[tokio::test]
    async fn test_capacity_never_exceeded_and_single_eviction() {
        let alloc = FakeAllocator::new(1);
        let (ww, _events) = watcher(&alloc, 3, Duration::ZERO);
        let workers = alloc.spawn_many(3);
        ww.watch(workers.clone());

        // A stray worker released into a full container evicts nothing healthy.
        let stray = alloc.spawn_ready();
        ww.release(Arc::clone(&stray));
        assert_eq!(ww.idle(), 3);
        assert!(alloc.handle(stray.pid()).is_exited());

        // With one unhealthy buffered worker, exactly that one is evicted.
        workers[2].state().set(WorkerState::Errored);
        let second = alloc.spawn_ready();
        ww.release(Arc::clone(&second));
        assert_eq!(ww.idle(), 3);
        assert!(alloc.handle(workers[2].pid()).is_exited());
        assert!(!alloc.handle(workers[0].pid()).is_exited());
        assert!(!alloc.handle(workers[1].pid()).is_exited());
        assert!(!alloc.handle(second.pid()).is_exited());
    }

    // =========================================================================
    // Timeout Then Release
    // =========================================================================

    #[tokio::test]
    async fn test_take_with_deadline_then_release() {
        let alloc = FakeAllocator::new(1);
        let (ww, _events) = watcher(&alloc, 2, Duration::ZERO);
        let initial = alloc.spawn_many(2);
        ww.watch(initial.clone());

        let w1 = ww.take(&CancellationToken::new()).await.unwrap();
        let w2 = ww.take(&CancellationToken::new()).await.unwrap();
        assert_eq!(w1.pid(), initial[0].pid());
        assert_eq!(w2.pid(), initial[1].pid());

        let deadline = CancellationToken::new();
        let timer = deadline.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            timer.cancel();
        });
        let started = tokio::time::Instant::now();
        assert!(ww.take(&deadline).await.is_err());
        assert!(started.elapsed() >= Duration::from_millis(40));

        ww.release(Arc::clone(&w1));
        let w = ww.take(&CancellationToken::new()).await.unwrap();
        assert_eq!(w.pid(), w1.pid());
    }

    // =========================================================================
    // Crash Replacement
    // =========================================================================

    #[tokio::test]
    async fn test_each_crash_replaced_exactly_once() {
        init_test_logging();
        let alloc = FakeAllocator::new(1);
        let (ww, events) = watcher(&alloc, 4, Duration::ZERO);
        let mut rx = collect_events(&events, "test");
        let workers = alloc.spawn_many(4);
        ww.watch(workers.clone());

        alloc.handle(workers[0].pid()).crash();
        alloc.handle(workers[3].pid()).crash();

        assert!(eventually(SETTLE, || alloc.calls() == 2 && ww.len() == 4 && ww.idle() == 4).await);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(alloc.calls(), 2);

        let constructs = drain_events(&mut rx)
            .iter()
            .filter(|e| e.event_type == EventType::WorkerConstruct)
            .count();
        assert_eq!(constructs, 2);
        assert_eq!(workers[0].state().get(), WorkerState::Stopped);
    }

    #[tokio::test]
    async fn test_crash_while_checked_out() {
        let alloc = FakeAllocator::new(1);
        let allocator: Arc<dyn Allocator> = alloc.clone();
        let pool = Pool::new(PoolConfig::new(1), allocator, Arc::new(EventBus::new()))
            .await
            .unwrap();

        let worker = pool.checkout(&CancellationToken::new()).await.unwrap();
        let pid = worker.pid();
        alloc.handle(pid).crash();

        assert!(eventually(SETTLE, || pool.watcher().idle() == 1).await);
        // Checking in the dead worker must not put it back.
        worker.finish();
        assert_eq!(pool.watcher().idle(), 1);

        let next = pool.checkout(&CancellationToken::new()).await.unwrap();
        assert_ne!(next.pid(), pid);
    }

    // =========================================================================
    // Reset / Destroy
    // =========================================================================

    #[tokio::test]
    async fn test_reset_keeps_count_with_new_pids() {
        let alloc = FakeAllocator::new(1);
        let allocator: Arc<dyn Allocator> = alloc.clone();
        let pool = Pool::new(PoolConfig::new(4), allocator, Arc::new(EventBus::new()))
            .await
            .unwrap();
        let before: HashSet<u32> = pool.workers().iter().map(|w| w.pid()).collect();

        pool.reset(&CancellationToken::new()).await.unwrap();

        let after: HashSet<u32> = pool.workers().iter().map(|w| w.pid()).collect();
        assert_eq!(after.len(), before.len());
        assert!(before.is_disjoint(&after));

        // Old lifecycle tasks must not allocate replacements.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(alloc.calls(), 8);
        assert_eq!(pool.workers().len(), 4);
    }

    #[tokio::test]
    async fn test_reset_lets_in_flight_work_finish() {
        let alloc = FakeAllocator::new(1);
        let allocator: Arc<dyn Allocator> = alloc.clone();
        let pool = Arc::new(
            Pool::new(PoolConfig::new(2), allocator, Arc::new(EventBus::new()))
                .await
                .unwrap(),
        );

        let busy = pool.checkout(&CancellationToken::new()).await.unwrap();
        let busy_pid = busy.pid();

        let reset = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.reset(&CancellationToken::new()).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!alloc.handle(busy_pid).is_exited());

        busy.finish();
        reset.await.unwrap().unwrap();

        assert!(alloc.handle(busy_pid).is_exited());
        assert!(!pool.workers().iter().any(|w| w.pid() == busy_pid));
        assert_eq!(pool.workers().len(), 2);
    }

    #[tokio::test]
    async fn test_take_after_reset_waits_for_new_workers() {
        let alloc = FakeAllocator::new(1);
        let (ww, _events) = watcher(&alloc, 1, Duration::ZERO);
        ww.watch(alloc.spawn_many(1));

        let held = ww.take(&CancellationToken::new()).await.unwrap();
        ww.reset(&CancellationToken::new()).await;
        assert!(alloc.handle(held.pid()).is_exited());

        let waiter = {
            let ww = ww.clone();
            tokio::spawn(async move { ww.take(&CancellationToken::new()).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let fresh = alloc.spawn_ready();
        ww.watch(vec![Arc::clone(&fresh)]);

        let got = waiter.await.unwrap().unwrap();
        assert_eq!(got.pid(), fresh.pid());
    }

    #[tokio::test]
    async fn test_forced_reset_drops_replacement_allocated_meanwhile() {
        init_test_logging();
        let alloc = FakeAllocator::new(1);
        let allocator: Arc<dyn Allocator> = alloc.clone();
        let config = PoolConfig::new(1).with_allocate_timeout(Duration::from_secs(2));
        let pool = Pool::new(config, allocator, Arc::new(EventBus::new()))
            .await
            .unwrap();

        // The crashed worker's replacement stalls inside the allocator.
        let gate = alloc.hold_next();
        alloc.handle(1).crash();
        assert!(eventually(SETTLE, || alloc.calls() == 2).await);

        let forced = CancellationToken::new();
        forced.cancel();
        pool.reset(&forced).await.unwrap();
        assert_eq!(alloc.calls(), 3);
        let fresh: Vec<u32> = pool.workers().iter().map(|w| w.pid()).collect();
        assert_eq!(fresh, vec![2]);

        // The stalled replacement lands after the reset and is discarded.
        gate.cancel();
        assert!(eventually(SETTLE, || alloc.handle(3).is_exited()).await);
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(alloc.calls(), 3);
        assert_eq!(pool.workers().len(), 1);
        assert_eq!(pool.workers()[0].pid(), 2);
        assert_eq!(pool.watcher().num_workers(), 1);
        assert_eq!(pool.watcher().idle(), 1);

        let worker = pool.checkout(&CancellationToken::new()).await.unwrap();
        assert_eq!(worker.pid(), 2);
    }

    #[tokio::test]
    async fn test_surplus_worker_exit_is_not_replaced() {
        let alloc = FakeAllocator::new(1);
        let (ww, _events) = watcher(&alloc, 1, Duration::ZERO);
        let workers = alloc.spawn_many(2);

        // The container holds one worker, so the second is killed on arrival.
        ww.watch(workers.clone());
        assert!(alloc.handle(workers[1].pid()).is_exited());
        assert!(eventually(SETTLE, || ww.len() == 1).await);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(alloc.calls(), 0);
        assert_eq!(ww.len(), 1);
    }

    #[tokio::test]
    async fn test_destroy_with_deadline_forces_teardown() {
        init_test_logging();
        let alloc = FakeAllocator::new(1);
        let allocator: Arc<dyn Allocator> = alloc.clone();
        let pool = Pool::new(PoolConfig::new(2), allocator, Arc::new(EventBus::new()))
            .await
            .unwrap();

        let busy = pool.checkout(&CancellationToken::new()).await.unwrap();
        let busy_pid = busy.pid();

        let deadline = CancellationToken::new();
        let timer = deadline.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            timer.cancel();
        });
        pool.destroy(&deadline).await;

        assert!(alloc.handle(busy_pid).is_exited());
        assert_eq!(busy.state().get(), WorkerState::Destroyed);
        drop(busy);

        let err = pool.checkout(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, DroverError::PoolStopped));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(alloc.calls(), 2);
    }

    // =========================================================================
    // Allocation Retries
    // =========================================================================

    #[tokio::test]
    async fn test_replacement_retries_emit_errors_then_construct() {
        init_test_logging();
        let alloc = FakeAllocator::new(1);
        let (ww, events) = watcher(&alloc, 1, Duration::from_secs(2));
        let mut rx = collect_events(&events, "test");
        let workers = alloc.spawn_many(1);
        ww.watch(workers.clone());

        alloc.fail_next(2);
        alloc.handle(workers[0].pid()).crash();

        assert!(eventually(SETTLE, || ww.idle() == 1 && alloc.calls() == 3).await);
        tokio::time::sleep(Duration::from_millis(20)).await;

        let events = drain_events(&mut rx);
        let errors = events
            .iter()
            .filter(|e| e.event_type == EventType::WorkerError)
            .count();
        let constructs = events
            .iter()
            .filter(|e| e.event_type == EventType::WorkerConstruct)
            .count();
        assert_eq!(errors, 2);
        assert_eq!(constructs, 1);
        assert_eq!(ww.num_workers(), 1);
    }
}
