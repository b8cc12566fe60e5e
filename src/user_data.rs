use std::sync::{Arc, Mutex, PoisonError};

/// Ownership tag for the opaque data handed to the expiration callback.
///
/// Two tags exist:
/// - [`Borrowed<T>`]: the caller keeps ownership. The timer holds a shared reference and never
///   releases it.
/// - [`Owned<T>`]: the timer owns the value. It is released exactly once through
///   [`Timer::release_user_data`](crate::Timer::release_user_data), which only exists for this tag.
pub trait UserData: Send + Sync + 'static {
    type Value: Send + Sync + 'static;

    /// Reference handed to the callback, `None` once released.
    fn get(&self) -> Option<Arc<Self::Value>>;
}

pub struct Borrowed<T>(Arc<T>);

impl<T> Borrowed<T> {
    pub fn new(value: Arc<T>) -> Self {
        Self(value)
    }
}

impl<T: Send + Sync + 'static> UserData for Borrowed<T> {
    type Value = T;
    fn get(&self) -> Option<Arc<T>> {
        Some(self.0.clone())
    }
}

pub struct Owned<T>(Mutex<Option<Arc<T>>>);

impl<T> Owned<T> {
    pub fn new(value: T) -> Self {
        Self(Mutex::new(Some(Arc::new(value))))
    }
    /// Drops the timer's reference. A callback running at that moment keeps its own until it returns.
    pub(crate) fn release(&self) -> bool {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some()
    }
}

impl<T: Send + Sync + 'static> UserData for Owned<T> {
    type Value = T;
    fn get(&self) -> Option<Arc<T>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}
