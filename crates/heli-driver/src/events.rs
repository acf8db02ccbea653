//! 类型化事件通知
//!
//! `Observers<T>` 是一张回调表。`notify()` 在发布者线程上同步调用每个回调，
//! 调用期间不持有回调表的锁，因此回调里可以再订阅或退订。
//!
//! 需要跨线程排队时用 `subscribe_channel()`：回调只做 `try_send`，
//! 队列满时丢弃该事件。
//!
//! ```rust
//! use heli_driver::events::Observers;
//!
//! let mode_changed: Observers<u8> = Observers::new();
//! let (_sub, rx) = mode_changed.subscribe_channel(8);
//! mode_changed.notify(&2);
//! assert_eq!(rx.try_recv().unwrap(), 2);
//! ```

use crossbeam_channel::{Receiver, bounded};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Inner<T> {
    next_id: AtomicU64,
    callbacks: Mutex<Vec<(u64, Callback<T>)>>,
}

impl<T> Inner<T> {
    fn remove(&self, id: u64) {
        self.callbacks.lock().retain(|(cb_id, _)| *cb_id != id);
    }
}

/// 回调表（克隆后共享同一张表）
pub struct Observers<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Observers<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: 'static> Default for Observers<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> Observers<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                next_id: AtomicU64::new(0),
                callbacks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// 注册回调，返回的 `Subscription` 被丢弃时自动退订
    #[must_use = "dropping the Subscription unsubscribes immediately"]
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.callbacks.lock().push((id, Arc::new(callback)));

        let weak: Weak<Inner<T>> = Arc::downgrade(&self.inner);
        Subscription {
            unsubscribe: Some(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.remove(id);
                }
            })),
        }
    }

    /// 以有界队列的形式订阅
    #[must_use = "dropping the Subscription unsubscribes immediately"]
    pub fn subscribe_channel(&self, capacity: usize) -> (Subscription, Receiver<T>)
    where
        T: Clone + Send,
    {
        let (tx, rx) = bounded(capacity);
        let subscription = self.subscribe(move |value: &T| {
            let _ = tx.try_send(value.clone());
        });
        (subscription, rx)
    }

    /// 在当前线程上依次调用全部回调
    pub fn notify(&self, value: &T) {
        let snapshot: Vec<Callback<T>> = self
            .inner
            .callbacks
            .lock()
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();

        for callback in snapshot {
            callback(value);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.callbacks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 订阅句柄
pub struct Subscription {
    unsubscribe: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// 放弃句柄但保持订阅，直到 `Observers` 本身被释放
    pub fn detach(mut self) {
        self.unsubscribe = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.unsubscribe.is_some())
            .finish()
    }
}
