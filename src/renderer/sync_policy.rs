//! Host-side locking strategy shared by every component that keeps mutable state.
//!
//! Components are generic over `S: SyncPolicy`. [`Synchronized`] backs the locks with
//! `parking_lot`, [`Unsynchronized`] with `RefCell`, which makes the component `!Sync`
//! so the compiler keeps it on one thread.

use std::cell::{Ref, RefCell, RefMut};
use std::ops::{Deref, DerefMut};

pub trait SyncPolicy: 'static {
    const ENABLED: bool;

    type Mutex<T>: PolicyMutex<T>;
    type RwLock<T>: PolicyRwLock<T>;
}

pub trait PolicyMutex<T> {
    type Guard<'a>: DerefMut<Target = T>
    where
        Self: 'a;

    fn new(value: T) -> Self;
    fn lock(&self) -> Self::Guard<'_>;
    fn get_mut(&mut self) -> &mut T;
}

pub trait PolicyRwLock<T> {
    type ReadGuard<'a>: Deref<Target = T>
    where
        Self: 'a;
    type WriteGuard<'a>: DerefMut<Target = T>
    where
        Self: 'a;

    fn new(value: T) -> Self;
    fn read(&self) -> Self::ReadGuard<'_>;
    fn write(&self) -> Self::WriteGuard<'_>;
    fn get_mut(&mut self) -> &mut T;
}

/// Real locks, safe to share across threads.
#[derive(Debug, Clone, Copy, Default)]
pub struct Synchronized;

/// No locks. Single-threaded use only.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unsynchronized;

impl SyncPolicy for Synchronized {
    const ENABLED: bool = true;

    type Mutex<T> = parking_lot::Mutex<T>;
    type RwLock<T> = parking_lot::RwLock<T>;
}

impl SyncPolicy for Unsynchronized {
    const ENABLED: bool = false;

    type Mutex<T> = RefCell<T>;
    type RwLock<T> = RefCell<T>;
}

impl<T> PolicyMutex<T> for parking_lot::Mutex<T> {
    type Guard<'a>
        = parking_lot::MutexGuard<'a, T>
    where
        Self: 'a;

    fn new(value: T) -> Self {
        parking_lot::Mutex::new(value)
    }

    fn lock(&self) -> Self::Guard<'_> {
        parking_lot::Mutex::lock(self)
    }

    fn get_mut(&mut self) -> &mut T {
        parking_lot::Mutex::get_mut(self)
    }
}

impl<T> PolicyRwLock<T> for parking_lot::RwLock<T> {
    type ReadGuard<'a>
        = parking_lot::RwLockReadGuard<'a, T>
    where
        Self: 'a;
    type WriteGuard<'a>
        = parking_lot::RwLockWriteGuard<'a, T>
    where
        Self: 'a;

    fn new(value: T) -> Self {
        parking_lot::RwLock::new(value)
    }

    fn read(&self) -> Self::ReadGuard<'_> {
        parking_lot::RwLock::read(self)
    }

    fn write(&self) -> Self::WriteGuard<'_> {
        parking_lot::RwLock::write(self)
    }

    fn get_mut(&mut self) -> &mut T {
        parking_lot::RwLock::get_mut(self)
    }
}

impl<T> PolicyMutex<T> for RefCell<T> {
    type Guard<'a>
        = RefMut<'a, T>
    where
        Self: 'a;

    fn new(value: T) -> Self {
        RefCell::new(value)
    }

    fn lock(&self) -> Self::Guard<'_> {
        self.borrow_mut()
    }

    fn get_mut(&mut self) -> &mut T {
        RefCell::get_mut(self)
    }
}

impl<T> PolicyRwLock<T> for RefCell<T> {
    type ReadGuard<'a>
        = Ref<'a, T>
    where
        Self: 'a;
    type WriteGuard<'a>
        = RefMut<'a, T>
    where
        Self: 'a;

    fn new(value: T) -> Self {
        RefCell::new(value)
    }

    fn read(&self) -> Self::ReadGuard<'_> {
        self.borrow()
    }

    fn write(&self) -> Self::WriteGuard<'_> {
        self.borrow_mut()
    }

    fn get_mut(&mut self) -> &mut T {
        RefCell::get_mut(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    struct Counter<S: SyncPolicy> {
        value: S::Mutex<u32>,
        names: S::RwLock<Vec<&'static str>>,
    }

    impl<S: SyncPolicy> Counter<S> {
        fn new() -> Self {
            Self {
                value: PolicyMutex::new(0),
                names: PolicyRwLock::new(Vec::new()),
            }
        }

        fn bump(&self) -> u32 {
            let mut value = self.value.lock();
            *value += 1;
            *value
        }
    }

    #[test]
    fn unsynchronized_locks_behave_like_cells() {
        let counter = Counter::<Unsynchronized>::new();
        assert_eq!(counter.bump(), 1);
        assert_eq!(counter.bump(), 2);

        counter.names.write().push("a");
        assert_eq!(counter.names.read().len(), 1);
        assert!(!Unsynchronized::ENABLED);
    }

    #[test]
    fn synchronized_locks_serialize_threads() {
        let counter = Arc::new(Counter::<Synchronized>::new());
        let handles = (0..4)
            .map(|_| {
                let counter = counter.clone();
                std::thread::spawn(move || {
                    for _ in 0..250 {
                        counter.bump();
                    }
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(*counter.value.lock(), 1000);
        assert!(Synchronized::ENABLED);
    }
}
