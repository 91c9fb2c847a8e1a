//! Unit tests for the work queue

#[cfg(test)]
mod tests {
    use crate::queue::{ItemExponentialRateLimiter, WorkQueue};
    use std::time::Duration;

    #[tokio::test]
    async fn test_burst_of_adds_collapses_to_one_entry() {
        let queue: WorkQueue<String> = WorkQueue::new();
        for _ in 0..10 {
            queue.add("ns1/app-config".to_string());
        }
        assert_eq!(queue.len(), 1);

        assert_eq!(queue.get().await.as_deref(), Some("ns1/app-config"));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_distinct_keys_are_fifo() {
        let queue: WorkQueue<&'static str> = WorkQueue::new();
        queue.add("a");
        queue.add("b");
        queue.add("a");

        assert_eq!(queue.get().await, Some("a"));
        assert_eq!(queue.get().await, Some("b"));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_add_while_processing_requeues_on_done() {
        let queue: WorkQueue<&'static str> = WorkQueue::new();
        queue.add("a");
        let key = queue.get().await.unwrap();

        // Not handed out again while in flight
        queue.add("a");
        queue.add("a");
        assert_eq!(queue.len(), 0);

        queue.done(&key);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await, Some("a"));
    }

    #[tokio::test]
    async fn test_done_without_new_add_does_not_requeue() {
        let queue: WorkQueue<&'static str> = WorkQueue::new();
        queue.add("a");
        let key = queue.get().await.unwrap();
        queue.done(&key);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_get_blocks_until_add() {
        let queue: WorkQueue<&'static str> = WorkQueue::new();
        let worker = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };
        tokio::task::yield_now().await;
        assert!(!worker.is_finished());

        queue.add("a");
        assert_eq!(worker.await.unwrap(), Some("a"));
    }

    #[tokio::test]
    async fn test_two_workers_both_receive_work() {
        let queue: WorkQueue<&'static str> = WorkQueue::new();
        let w1 = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };
        let w2 = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };
        tokio::task::yield_now().await;

        queue.add("a");
        queue.add("b");

        let mut got = vec![w1.await.unwrap().unwrap(), w2.await.unwrap().unwrap()];
        got.sort();
        assert_eq!(got, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_shutdown_wakes_blocked_get() {
        let queue: WorkQueue<&'static str> = WorkQueue::new();
        let worker = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };
        tokio::task::yield_now().await;

        queue.shutdown();
        assert_eq!(worker.await.unwrap(), None);

        // Adds after shutdown are ignored
        queue.add("a");
        assert!(queue.is_empty());
        assert_eq!(queue.get().await, None);
    }

    #[tokio::test]
    async fn test_shutdown_with_drain_waits_for_in_flight() {
        let queue: WorkQueue<&'static str> = WorkQueue::new();
        queue.add("a");
        let key = queue.get().await.unwrap();

        let drain = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.shutdown_with_drain().await })
        };
        tokio::task::yield_now().await;
        assert!(!drain.is_finished());

        queue.done(&key);
        drain.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_rate_limited_backs_off_exponentially() {
        let limiter = ItemExponentialRateLimiter::new(Duration::from_millis(100), Duration::from_secs(1));
        let queue: WorkQueue<&'static str> = WorkQueue::with_rate_limiter(limiter);

        queue.add_rate_limited("a");
        assert_eq!(queue.num_requeues(&"a"), 1);
        assert!(queue.is_empty());

        tokio::time::sleep(Duration::from_millis(101)).await;
        assert_eq!(queue.len(), 1);
        let key = queue.get().await.unwrap();
        queue.done(&key);

        // Second failure waits 200ms
        queue.add_rate_limited("a");
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(queue.is_empty());
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(queue.len(), 1);

        queue.forget(&"a");
        assert_eq!(queue.num_requeues(&"a"), 0);
    }

    #[test]
    fn test_rate_limiter_caps_at_max() {
        let limiter = ItemExponentialRateLimiter::new(Duration::from_millis(5), Duration::from_millis(40));
        let delays: Vec<_> = (0..6).map(|_| limiter.when(&"a")).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(5),
                Duration::from_millis(10),
                Duration::from_millis(20),
                Duration::from_millis(40),
                Duration::from_millis(40),
                Duration::from_millis(40),
            ]
        );
        // Other keys are independent
        assert_eq!(limiter.when(&"b"), Duration::from_millis(5));
    }

    #[tokio::test]
    async fn test_debug_shows_queued_and_processing_keys() {
        let queue: WorkQueue<&'static str> = WorkQueue::new();
        queue.add("a");
        queue.add("b");
        assert_eq!(queue.get().await, Some("a"));

        let debug = format!("{:?}", queue);
        assert!(debug.starts_with("WorkQueue"));
        assert!(debug.contains("queued: [\"b\"]"));
        assert!(debug.contains("processing: {\"a\"}"));
    }
}
