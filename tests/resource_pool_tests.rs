use reactor_server::auth::{
    memory_authenticator, Authenticator, MemoryCacheFactory, MemoryStoreFactory,
    PooledAuthenticator,
};
use reactor_server::error::{ServerError, ServerResult};
use reactor_server::resource_pool::{ResourceFactory, ResourcePool};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Numbered resources; every second `create` fails when `flaky` is set.
struct Numbers {
    next: AtomicUsize,
    flaky: bool,
}

impl Numbers {
    fn new(flaky: bool) -> Self {
        Self {
            next: AtomicUsize::new(0),
            flaky,
        }
    }
}

impl ResourceFactory for Numbers {
    type Resource = usize;

    fn kind(&self) -> &'static str {
        "number"
    }

    fn create(&self) -> ServerResult<usize> {
        let n = self.next.fetch_add(1, Ordering::SeqCst);
        if self.flaky && n % 2 == 1 {
            return Err(ServerError::Config(format!("refused {}", n)));
        }
        Ok(n)
    }
}

struct Broken;

impl ResourceFactory for Broken {
    type Resource = ();

    fn kind(&self) -> &'static str {
        "broken"
    }

    fn create(&self) -> ServerResult<()> {
        Err(ServerError::Config("unreachable backend".to_string()))
    }
}

#[test]
fn test_acquire_and_release_through_guard() {
    let pool = ResourcePool::new(Numbers::new(false), 3, Duration::from_millis(100)).unwrap();
    assert_eq!(pool.size(), 3);
    assert_eq!(pool.available(), 3);

    {
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_ne!(*a, *b);
        assert_eq!(pool.available(), 1);
    }
    assert_eq!(pool.available(), 3);
}

#[test]
fn test_guard_gives_mutable_access() {
    let pool = ResourcePool::new(Numbers::new(false), 1, Duration::from_millis(100)).unwrap();
    {
        let mut n = pool.acquire().unwrap();
        *n += 100;
    }
    assert_eq!(*pool.acquire().unwrap(), 100);
}

#[test]
fn test_acquire_times_out_when_exhausted() {
    let timeout = Duration::from_millis(100);
    let pool = ResourcePool::new(Numbers::new(false), 1, timeout).unwrap();
    let _held = pool.acquire().unwrap();

    let start = Instant::now();
    match pool.acquire() {
        Err(ServerError::PoolTimeout(kind)) => assert_eq!(kind, "number"),
        Err(e) => panic!("expected PoolTimeout, got {}", e),
        Ok(_) => panic!("expected PoolTimeout, got a resource"),
    }
    assert!(start.elapsed() >= timeout);
}

#[test]
fn test_release_wakes_waiting_acquirer() {
    let pool = Arc::new(ResourcePool::new(Numbers::new(false), 1, Duration::from_secs(5)).unwrap());
    let held = pool.acquire().unwrap();
    let value = *held;

    let waiter = {
        let pool = Arc::clone(&pool);
        thread::spawn(move || {
            let start = Instant::now();
            let n = *pool.acquire().unwrap();
            (n, start.elapsed())
        })
    };

    thread::sleep(Duration::from_millis(50));
    drop(held);

    let (n, waited) = waiter.join().unwrap();
    assert_eq!(n, value);
    assert!(waited < Duration::from_secs(5));
}

#[test]
fn test_partial_creation_failures_shrink_pool() {
    let pool = ResourcePool::new(Numbers::new(true), 4, Duration::from_millis(100)).unwrap();
    assert_eq!(pool.size(), 2);
    assert_eq!(pool.available(), 2);
}

#[test]
fn test_pool_with_no_resources_is_config_error() {
    assert!(matches!(
        ResourcePool::new(Broken, 3, Duration::from_millis(10)),
        Err(ServerError::Config(_))
    ));
}

#[test]
fn test_login_is_served_from_cache_after_first_hit() {
    let store = MemoryStoreFactory::new().with_user("dave", "pw");
    let cache = MemoryCacheFactory::new();
    let timeout = Duration::from_millis(200);
    let auth = PooledAuthenticator::new(
        ResourcePool::new(cache.clone(), 1, timeout).unwrap(),
        ResourcePool::new(store, 1, timeout).unwrap(),
    );

    assert!(cache.is_empty());
    assert!(auth.verify("dave", "pw", true));
    assert_eq!(cache.len(), 1);
    assert!(auth.verify("dave", "pw", true));
    assert!(!auth.verify("dave", "nope", true));

    // every connection went back to its pool
    assert_eq!(auth.cache_pool().available(), 1);
    assert_eq!(auth.store_pool().available(), 1);
}

#[test]
fn test_registration_is_not_cached_until_login() {
    let store = MemoryStoreFactory::new();
    let cache = MemoryCacheFactory::new();
    let timeout = Duration::from_millis(200);
    let auth = PooledAuthenticator::new(
        ResourcePool::new(cache.clone(), 1, timeout).unwrap(),
        ResourcePool::new(store.clone(), 1, timeout).unwrap(),
    );

    assert!(auth.verify("erin", "pw", false));
    assert!(store.contains("erin"));
    assert!(!cache.contains("erin"));

    assert!(!auth.verify("erin", "pw", false));
    assert!(cache.contains("erin"));
}

#[test]
fn test_exhausted_pool_fails_verification() {
    let timeout = Duration::from_millis(50);
    let auth = memory_authenticator(1, 1, timeout).unwrap();
    let _held = auth.cache_pool().acquire().unwrap();

    assert!(!auth.verify("frank", "pw", false));
}

#[test]
fn test_empty_credentials_never_verify() {
    let auth = memory_authenticator(1, 1, Duration::from_millis(50)).unwrap();
    assert!(!auth.verify("", "pw", false));
    assert!(!auth.verify("user", "", false));
    assert!(!auth.verify("", "", true));
}
