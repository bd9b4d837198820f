//! Bounded priority buffer.
//!
//! [`PriorityBuffer`] keeps at most `capacity` items ordered by ascending priority. Once full, a new
//! item is only accepted when its priority beats the current minimum, which is then evicted. It is
//! used to hold the highest-weight cluster seeds and the most recent samples of a target history.

/// Anything that can be ranked inside a [`PriorityBuffer`].
pub trait Prioritized {
    fn priority(&self) -> f64;
}

#[derive(Clone, Debug)]
pub struct PriorityBuffer<T> {
    entries: Vec<(f64, T)>,
    capacity: usize,
}
impl<T: Prioritized> PriorityBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        PriorityBuffer {
            entries: Vec::with_capacity(capacity),
            capacity,
        }
    }
    /// Insert `item`, returning whether it was kept.
    ///
    /// Items with equal priority keep their insertion order.
    pub fn push(&mut self, item: T) -> bool {
        let priority = item.priority();
        if self.capacity == 0 || priority.is_nan() {
            return false;
        }
        if self.entries.len() >= self.capacity {
            match self.entries.first() {
                Some((lowest, _)) if priority > *lowest => {
                    self.entries.remove(0);
                }
                _ => return false,
            }
        }
        let index = self.entries.partition_point(|(p, _)| *p <= priority);
        self.entries.insert(index, (priority, item));
        true
    }
    pub fn min(&self) -> Option<&T> {
        self.entries.first().map(|(_, item)| item)
    }
    pub fn max(&self) -> Option<&T> {
        self.entries.last().map(|(_, item)| item)
    }
    /// Items in ascending priority.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> + '_ {
        self.entries.iter().map(|(_, item)| item)
    }
    pub fn len(&self) -> usize {
        self.entries.len()
    }
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }
    pub fn capacity(&self) -> usize {
        self.capacity
    }
    pub fn reset(&mut self) {
        self.entries.clear();
    }
}
