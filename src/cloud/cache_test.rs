#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use crate::cloud::cache::{CacheReadType, ResourceCache};
    use crate::error::Result;

    async fn counted(calls: &AtomicUsize, value: Option<u32>) -> Result<Option<u32>> {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok(value)
    }

    #[tokio::test]
    async fn fresh_entries_are_served_from_cache() {
        let cache = ResourceCache::new("test", Duration::from_secs(60));
        let calls = AtomicUsize::new(0);

        let first = cache
            .get("LB", CacheReadType::Default, || counted(&calls, Some(1)))
            .await
            .unwrap();
        let second = cache
            .get("lb", CacheReadType::Default, || counted(&calls, Some(2)))
            .await
            .unwrap();

        assert_eq!(first, Some(1));
        assert_eq!(second, Some(1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn not_found_is_cached_too() {
        let cache: ResourceCache<u32> = ResourceCache::new("test", Duration::from_secs(60));
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let value = cache
                .get("missing", CacheReadType::Default, || counted(&calls, None))
                .await
                .unwrap();
            assert!(value.is_none());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn force_refresh_and_invalidate_refetch() {
        let cache = ResourceCache::new("test", Duration::from_secs(60));
        let calls = AtomicUsize::new(0);

        cache
            .get("lb", CacheReadType::Default, || counted(&calls, Some(1)))
            .await
            .unwrap();
        let refreshed = cache
            .get_force_refresh("lb", || counted(&calls, Some(2)))
            .await
            .unwrap();
        assert_eq!(refreshed, Some(2));

        cache.invalidate("lb");
        let after = cache
            .get("lb", CacheReadType::Default, || counted(&calls, Some(3)))
            .await
            .unwrap();
        assert_eq!(after, Some(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn expired_entries_only_served_when_unsafe_allowed() {
        let cache = ResourceCache::new("test", Duration::from_millis(0));
        let calls = AtomicUsize::new(0);

        cache
            .get("lb", CacheReadType::Default, || counted(&calls, Some(1)))
            .await
            .unwrap();
        let stale = cache
            .get("lb", CacheReadType::AllowUnsafe, || counted(&calls, Some(2)))
            .await
            .unwrap();
        assert_eq!(stale, Some(1));

        let fresh = cache
            .get("lb", CacheReadType::Default, || counted(&calls, Some(3)))
            .await
            .unwrap();
        assert_eq!(fresh, Some(3));
    }
}
