use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

use crate::osal::SpinWhile;

/// 可以跨 await 持有的互斥锁
///
/// 用于地址 0 锁、Hub 状态读取锁和带宽锁，这些临界区内会睡眠。
pub struct AsyncMutex<T> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for AsyncMutex<T> {}
unsafe impl<T: Send> Sync for AsyncMutex<T> {}

impl<T> AsyncMutex<T> {
    pub const fn new(data: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(data),
        }
    }

    pub fn try_lock(&self) -> Option<AsyncMutexGuard<'_, T>> {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| AsyncMutexGuard { lock: self })
    }

    pub async fn lock(&self) -> AsyncMutexGuard<'_, T> {
        loop {
            if let Some(guard) = self.try_lock() {
                return guard;
            }
            SpinWhile::new(|| self.locked.load(Ordering::Relaxed)).await;
        }
    }
}

pub struct AsyncMutexGuard<'a, T> {
    lock: &'a AsyncMutex<T>,
}

impl<T> Deref for AsyncMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for AsyncMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for AsyncMutexGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_async_mutex() {
        let lock = AsyncMutex::new(0u32);
        spin_on::spin_on(async {
            {
                let mut guard = lock.lock().await;
                *guard += 1;
                assert!(lock.try_lock().is_none());
            }
            assert_eq!(*lock.lock().await, 1);
        });
        assert!(lock.try_lock().is_some());
    }
}
