use dashmap::DashMap;
use std::{
    fmt::Display,
    net::Ipv4Addr,
    sync::{Arc, Weak},
    time::Duration,
};

use crate::{
    config::TimerConfig,
    errors::TimerError,
    state::TimerState,
    timer::Timer,
    user_data::Borrowed,
};

/// Default age after which an entry is dropped.
pub const ROUTE_EXPIRATION: Duration = Duration::from_secs(30);

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub struct RouteKey {
    pub dest: Ipv4Addr,
    pub mask: u8,
}

impl RouteKey {
    pub fn new(dest: Ipv4Addr, mask: u8) -> Self {
        Self { dest, mask }
    }
}

impl Display for RouteKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.dest, self.mask)
    }
}

struct RouteEntry {
    gateway: Ipv4Addr,
    oif: String,
    timer: Timer<Borrowed<RouteKey>>,
}

/// One line of [`RouteTable::dump`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouteRow {
    pub key: RouteKey,
    pub gateway: Ipv4Addr,
    pub oif: String,
    pub time_to_expire: Duration,
    /// `None` if the entry timer is no longer armed.
    pub remaining: Option<Duration>,
}

impl Display for RouteRow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let remaining = self
            .remaining
            .map(|r| r.as_millis().to_string())
            .unwrap_or_else(|| "-".to_string());
        write!(
            f,
            "{:<20} {:<4} {:<20} {:<12} {}sec ({}ms)",
            self.key.dest,
            self.key.mask,
            self.gateway,
            self.oif,
            self.time_to_expire.as_secs(),
            remaining
        )
    }
}

/// Routing table whose entries age out.
///
/// Every entry owns a one-shot timer armed with the table expiration. When it fires, the entry
/// timer is deleted and the entry removed. The table is an explicit value: share it with an
/// `Arc` if several threads add routes.
pub struct RouteTable {
    entries: Arc<DashMap<RouteKey, RouteEntry>>,
    expiration: Duration,
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::with_expiration(ROUTE_EXPIRATION)
    }
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn with_expiration(expiration: Duration) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            expiration,
        }
    }

    /// Adds a route and starts its expiration timer. An existing route with the same key is
    /// replaced and its timer deleted.
    pub fn add(&self, key: RouteKey, gateway: Ipv4Addr, oif: &str) -> Result<(), TimerError> {
        let entries: Weak<DashMap<RouteKey, RouteEntry>> = Arc::downgrade(&self.entries);
        let timer = Timer::with_user_data(
            TimerConfig::new().initial_delay(self.expiration),
            Borrowed::new(Arc::new(key)),
        )
        .set_expiration_event(move |timer, key| {
            if let Err(e) = timer.delete() {
                log::warn!("route expiration: {}", e);
            }
            let (Some(entries), Some(key)) = (entries.upgrade(), key) else {
                return;
            };
            // only remove the entry this timer belongs to, the route may have been re-added.
            if entries
                .remove_if(key.as_ref(), |_, entry| entry.timer.id() == timer.id())
                .is_some()
            {
                log::info!("route [{}] expired", key);
            }
        })
        .build()?;

        // the entry must be in the table before its timer can fire.
        let previous = self.entries.insert(
            key,
            RouteEntry {
                gateway,
                oif: oif.to_string(),
                timer: timer.clone(),
            },
        );
        if let Some(previous) = previous {
            retire(&key, &previous.timer);
        }
        if let Err(e) = timer.start() {
            self.entries
                .remove_if(&key, |_, entry| entry.timer.id() == timer.id());
            retire(&key, &timer);
            return Err(e);
        }
        log::debug!("route [{}] via {} {} added", key, gateway, oif);
        Ok(())
    }

    /// Removes a route before it expires.
    pub fn remove(&self, key: &RouteKey) -> bool {
        match self.entries.remove(key) {
            Some((_, entry)) => {
                retire(key, &entry.timer);
                log::debug!("route [{}] deleted", key);
                true
            }
            None => false,
        }
    }

    /// Changes gateway and outgoing interface. The expiration timer keeps running.
    pub fn update(&self, key: &RouteKey, gateway: Ipv4Addr, oif: &str) -> bool {
        match self.entries.get_mut(key) {
            Some(mut entry) => {
                entry.gateway = gateway;
                entry.oif = oif.to_string();
                true
            }
            None => false,
        }
    }

    pub fn clear(&self) {
        let keys: Vec<RouteKey> = self.entries.iter().map(|entry| *entry.key()).collect();
        for key in keys {
            self.remove(&key);
        }
    }

    pub fn contains(&self, key: &RouteKey) -> bool {
        self.entries.contains_key(key)
    }
    pub fn len(&self) -> usize {
        self.entries.len()
    }
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn dump(&self) -> Vec<RouteRow> {
        self.entries
            .iter()
            .map(|entry| RouteRow {
                key: *entry.key(),
                gateway: entry.gateway,
                oif: entry.oif.clone(),
                time_to_expire: self.expiration,
                remaining: entry.timer.remaining_time(),
            })
            .collect()
    }
}

/// Deletes the timer of an entry leaving the table. Returns `false` if it could not be deleted.
fn retire(key: &RouteKey, timer: &Timer<Borrowed<RouteKey>>) -> bool {
    // an expired entry timer deletes itself.
    if timer.state() == TimerState::Deleted {
        return true;
    }
    match timer.delete() {
        Ok(()) => true,
        Err(e) => {
            log::warn!("route [{}] timer {} not released: {}", key, timer.id(), e);
            false
        }
    }
}

impl Drop for RouteTable {
    fn drop(&mut self) {
        self.clear();
    }
}
