use std::collections::VecDeque;
use std::fmt;

use parking_lot::Mutex;

/// Bounded history of values, shared between one writer and any number of readers.
///
/// Appending evicts the oldest entry once `capacity` is reached. Readers never
/// iterate the live buffer, they take a [`History::snapshot`] and compute on the
/// copy, so the receive path can keep appending while a window is recalculating
/// its batch delay on another thread.
pub struct History<T> {
    capacity: usize,
    values: Mutex<VecDeque<T>>,
}

impl<T: Clone> History<T> {
    /// Creates an empty history holding at most `capacity` values (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        History {
            capacity,
            values: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Appends a value, evicting the oldest one if full.
    pub fn push(&self, v: T) {
        let mut lock = self.values.lock();
        if lock.len() == self.capacity {
            lock.pop_front();
        }
        lock.push_back(v);
    }

    /// Copy of the current contents, oldest first.
    pub fn snapshot(&self) -> Vec<T> {
        self.values.lock().iter().cloned().collect()
    }

    /// Copy of the values matching `f`, oldest first.
    pub fn filtered<F>(&self, mut f: F) -> Vec<T>
    where
        F: FnMut(&T) -> bool,
    {
        self.values.lock().iter().filter(|v| f(v)).cloned().collect()
    }

    /// The most recently appended value.
    pub fn last(&self) -> Option<T> {
        self.values.lock().back().cloned()
    }

    /// Number of values currently held.
    pub fn len(&self) -> usize {
        self.values.lock().len()
    }

    /// Whether the history holds no values.
    pub fn is_empty(&self) -> bool {
        self.values.lock().is_empty()
    }

    /// Maximum number of values held.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drops all values.
    pub fn clear(&self) {
        self.values.lock().clear();
    }
}

impl<T: Clone> Clone for History<T> {
    fn clone(&self) -> Self {
        let values = self.values.lock().clone();
        History {
            capacity: self.capacity,
            values: Mutex::new(values),
        }
    }
}

impl<T: Clone + fmt::Debug> fmt::Debug for History<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("History")
            .field("capacity", &self.capacity)
            .field("values", &self.snapshot())
            .finish()
    }
}
