use slp_protocol::ServiceUrl;
use slp_protocol::LIFETIME_MAXIMUM;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Duration;
use tokio::time::Instant;

/// A service advertisement acknowledged by an agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub url: ServiceUrl,
    pub lifetime: u16,
    pub attributes: String,
    pub fresh: bool,
    pub registered_at: Instant,
}

impl Registration {
    pub fn is_permanent(&self) -> bool {
        self.lifetime == LIFETIME_MAXIMUM
    }

    /// When the lease lapses unless it is registered again.
    pub fn expires_at(&self) -> Option<Instant> {
        if self.is_permanent() {
            None
        } else {
            Some(self.registered_at + Duration::from_secs(self.lifetime.into()))
        }
    }
}

/// Keeps track of leases. Refreshing them is up to the caller.
pub struct LifetimeManager {
    minimum_refresh_interval: u32,
    registrations: Mutex<HashMap<String, Registration>>,
}

impl LifetimeManager {
    pub fn new(minimum_refresh_interval: u32) -> Self {
        Self {
            minimum_refresh_interval,
            registrations: Default::default(),
        }
    }

    /// Smallest lifetime worth asking for, in seconds. 0 means no minimum.
    ///
    /// Shorter lifetimes are still sent, though agents may refuse them.
    pub fn minimum_refresh_interval(&self) -> u32 {
        self.minimum_refresh_interval
    }

    pub fn record(&self, registration: Registration) {
        log::debug!(
            "Tracking registration of {} for {} seconds",
            registration.url,
            registration.lifetime
        );
        self.lock()
            .insert(registration.url.to_string(), registration);
    }

    pub fn forget(&self, url: &ServiceUrl) {
        if self.lock().remove(&url.to_string()).is_some() {
            log::debug!("Stopped tracking registration of {}", url);
        }
    }

    pub fn registrations(&self) -> Vec<Registration> {
        self.lock().values().cloned().collect()
    }

    /// Registrations whose lease ends within `margin` from `now`.
    pub fn due_for_refresh(&self, now: Instant, margin: Duration) -> Vec<Registration> {
        self.lock()
            .values()
            .filter(|r| r.expires_at().is_some_and(|t| t <= now + margin))
            .cloned()
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Registration>> {
        self.registrations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
