use crate::error::ServerResult;
use crate::resource_pool::{ResourceFactory, ResourcePool};
use log::{error, info};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Verifies the credentials posted to the login and register pages.
pub trait Authenticator: Send + Sync {
    /// `is_login` distinguishes a login attempt from a registration.
    fn verify(&self, user: &str, password: &str, is_login: bool) -> bool;
}

/// One connection to the credential cache.
pub trait UserCache: Send {
    fn get(&mut self, user: &str) -> Option<String>;
    fn set(&mut self, user: &str, password: &str);
}

/// One connection to the persistent user store.
pub trait UserStore: Send {
    fn find_password(&mut self, user: &str) -> ServerResult<Option<String>>;
    fn insert_user(&mut self, user: &str, password: &str) -> ServerResult<()>;
}

/// Cache-first verification: reads go to the cache, then the store, and a
/// store hit is copied into the cache. Registrations only write the store.
pub struct PooledAuthenticator<C, S>
where
    C: ResourceFactory,
    S: ResourceFactory,
{
    cache: ResourcePool<C>,
    store: ResourcePool<S>,
}

impl<C, S> PooledAuthenticator<C, S>
where
    C: ResourceFactory,
    C::Resource: UserCache,
    S: ResourceFactory,
    S::Resource: UserStore,
{
    pub fn new(cache: ResourcePool<C>, store: ResourcePool<S>) -> Self {
        Self { cache, store }
    }

    pub fn cache_pool(&self) -> &ResourcePool<C> {
        &self.cache
    }

    pub fn store_pool(&self) -> &ResourcePool<S> {
        &self.store
    }

    fn verify_inner(&self, user: &str, password: &str, is_login: bool) -> ServerResult<bool> {
        let mut cache = self.cache.acquire()?;

        if let Some(cached) = cache.get(user) {
            if !is_login {
                info!("User {} already exists (checked with cache)", user);
                return Ok(false);
            }
            let ok = cached == password;
            info!("User {} login {} with cache", user, if ok { "succeeded" } else { "failed" });
            return Ok(ok);
        }

        let mut store = self.store.acquire()?;
        match store.find_password(user)? {
            Some(stored) => {
                cache.set(user, &stored);
                if !is_login {
                    info!("User {} already exists (checked with store)", user);
                    return Ok(false);
                }
                let ok = stored == password;
                info!("User {} login {} with store", user, if ok { "succeeded" } else { "failed" });
                Ok(ok)
            }
            None if is_login => Ok(false),
            None => {
                store.insert_user(user, password)?;
                info!("User {} registered", user);
                Ok(true)
            }
        }
    }
}

impl<C, S> Authenticator for PooledAuthenticator<C, S>
where
    C: ResourceFactory,
    C::Resource: UserCache,
    S: ResourceFactory,
    S::Resource: UserStore,
{
    fn verify(&self, user: &str, password: &str, is_login: bool) -> bool {
        if user.is_empty() || password.is_empty() {
            return false;
        }
        match self.verify_inner(user, password, is_login) {
            Ok(ok) => ok,
            Err(e) => {
                error!("User verification for {} failed: {}", user, e);
                false
            }
        }
    }
}

type Credentials = Arc<Mutex<HashMap<String, String>>>;

/// In-process cache connection; every handle shares one table.
pub struct MemoryUserCache {
    entries: Credentials,
}

impl UserCache for MemoryUserCache {
    fn get(&mut self, user: &str) -> Option<String> {
        self.entries.lock().get(user).cloned()
    }

    fn set(&mut self, user: &str, password: &str) {
        self.entries.lock().insert(user.to_string(), password.to_string());
    }
}

/// In-process store connection; every handle shares one table.
pub struct MemoryUserStore {
    users: Credentials,
}

impl UserStore for MemoryUserStore {
    fn find_password(&mut self, user: &str) -> ServerResult<Option<String>> {
        Ok(self.users.lock().get(user).cloned())
    }

    fn insert_user(&mut self, user: &str, password: &str) -> ServerResult<()> {
        self.users.lock().insert(user.to_string(), password.to_string());
        Ok(())
    }
}

/// Hands out `MemoryUserCache` connections.
#[derive(Clone, Default)]
pub struct MemoryCacheFactory {
    entries: Credentials,
}

impl MemoryCacheFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of cached users
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn contains(&self, user: &str) -> bool {
        self.entries.lock().contains_key(user)
    }
}

impl ResourceFactory for MemoryCacheFactory {
    type Resource = MemoryUserCache;

    fn kind(&self) -> &'static str {
        "cache"
    }

    fn create(&self) -> ServerResult<MemoryUserCache> {
        Ok(MemoryUserCache {
            entries: Arc::clone(&self.entries),
        })
    }
}

/// Hands out `MemoryUserStore` connections.
#[derive(Clone, Default)]
pub struct MemoryStoreFactory {
    users: Credentials,
}

impl MemoryStoreFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store with an existing account
    pub fn with_user(self, user: &str, password: &str) -> Self {
        self.users.lock().insert(user.to_string(), password.to_string());
        self
    }

    pub fn contains(&self, user: &str) -> bool {
        self.users.lock().contains_key(user)
    }
}

impl ResourceFactory for MemoryStoreFactory {
    type Resource = MemoryUserStore;

    fn kind(&self) -> &'static str {
        "store"
    }

    fn create(&self) -> ServerResult<MemoryUserStore> {
        Ok(MemoryUserStore {
            users: Arc::clone(&self.users),
        })
    }
}

/// The default authenticator: pooled connections over in-memory tables.
pub fn memory_authenticator(
    cache_connections: usize,
    store_connections: usize,
    acquire_timeout: Duration,
) -> ServerResult<PooledAuthenticator<MemoryCacheFactory, MemoryStoreFactory>> {
    let cache = ResourcePool::new(MemoryCacheFactory::new(), cache_connections, acquire_timeout)?;
    let store = ResourcePool::new(MemoryStoreFactory::new(), store_connections, acquire_timeout)?;
    Ok(PooledAuthenticator::new(cache, store))
}
