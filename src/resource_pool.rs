use crate::error::{ServerError, ServerResult};
use log::{error, info};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::time::{Duration, Instant};

/// Creates the resources a `ResourcePool` hands out (cache or store
/// connections, for instance).
pub trait ResourceFactory: Send + Sync + 'static {
    type Resource: Send;

    /// Short name used in logs and timeout errors
    fn kind(&self) -> &'static str;

    fn create(&self) -> ServerResult<Self::Resource>;
}

/// A fixed-size pool of reusable resources with a blocking, bounded
/// `acquire`. One pool is built per resource kind.
pub struct ResourcePool<F: ResourceFactory> {
    factory: F,
    idle: Mutex<VecDeque<F::Resource>>,
    returned: Condvar,
    size: usize,
    acquire_timeout: Duration,
}

impl<F: ResourceFactory> ResourcePool<F> {
    /// Create `size` resources up front. Individual failures are logged;
    /// a pool that ends up empty is an error.
    pub fn new(factory: F, size: usize, acquire_timeout: Duration) -> ServerResult<Self> {
        let mut idle = VecDeque::with_capacity(size);
        for _ in 0..size {
            match factory.create() {
                Ok(resource) => idle.push_back(resource),
                Err(e) => error!("Create {} connection error: {}", factory.kind(), e),
            }
        }
        if idle.is_empty() {
            return Err(ServerError::Config(format!(
                "no {} connections could be created",
                factory.kind()
            )));
        }
        info!("{} pool ready with {} connections", factory.kind(), idle.len());

        let size = idle.len();
        Ok(Self {
            factory,
            idle: Mutex::new(idle),
            returned: Condvar::new(),
            size,
            acquire_timeout,
        })
    }

    /// Take a resource, waiting up to the pool's acquire timeout.
    pub fn acquire(&self) -> ServerResult<Pooled<'_, F>> {
        let deadline = Instant::now() + self.acquire_timeout;
        let mut idle = self.idle.lock();
        while idle.is_empty() {
            if self.returned.wait_until(&mut idle, deadline).timed_out() && idle.is_empty() {
                return Err(ServerError::PoolTimeout(self.factory.kind()));
            }
        }

        let resource = idle.pop_front();
        Ok(Pooled {
            pool: self,
            resource,
        })
    }

    /// Put a resource back and wake one waiter.
    pub fn release(&self, resource: F::Resource) {
        self.idle.lock().push_back(resource);
        self.returned.notify_one();
    }

    /// Idle resources right now
    pub fn available(&self) -> usize {
        self.idle.lock().len()
    }

    /// Total resources owned by the pool
    pub fn size(&self) -> usize {
        self.size
    }
}

/// A resource on loan from a `ResourcePool`; returned when dropped.
pub struct Pooled<'a, F: ResourceFactory> {
    pool: &'a ResourcePool<F>,
    resource: Option<F::Resource>,
}

impl<F: ResourceFactory> Deref for Pooled<'_, F> {
    type Target = F::Resource;

    fn deref(&self) -> &Self::Target {
        match &self.resource {
            Some(resource) => resource,
            None => unreachable!("pooled resource used after release"),
        }
    }
}

impl<F: ResourceFactory> DerefMut for Pooled<'_, F> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match &mut self.resource {
            Some(resource) => resource,
            None => unreachable!("pooled resource used after release"),
        }
    }
}

impl<F: ResourceFactory> Drop for Pooled<'_, F> {
    fn drop(&mut self) {
        if let Some(resource) = self.resource.take() {
            self.pool.release(resource);
        }
    }
}
