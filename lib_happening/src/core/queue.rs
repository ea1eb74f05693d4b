//! # Event Queue
//!
//! A growable circular FIFO buffer. Items come out in exactly the order they
//! went in; there is no comparator, weight or priority anywhere in the parsed
//! data, so despite the "priority queue" naming the ingestion layer inherited,
//! this is a plain FIFO.
//!
//! ## Concurrency
//! `Queue` has no synchronisation of its own. Producers sharing one queue must
//! serialise access themselves (the ingestion service wraps it in a
//! `Mutex`), and callers that need an atomic check-then-pop own that critical
//! section too.
//!
//! ## Growth
//! When the ring is full the backing storage grows by the initial capacity
//! `C` (not doubling), unrolling the ring so the oldest item lands at index 0.

use super::event::Event;

/// Default initial capacity, also the growth increment.
pub const EVENTS_QUEUE_SIZE: usize = 4096;

/// Queue of parsed events shared by the ingestion handlers of one service.
pub type EventQueue = Queue<Event>;

/// Growable ring buffer with FIFO semantics.
#[derive(Debug)]
pub struct Queue<T> {
    nodes: Vec<Option<T>>,
    step: usize,
    head: usize,
    tail: usize,
    count: usize,
}

impl<T> Queue<T> {
    /// Creates a queue with room for `capacity` items before the first growth.
    /// A zero capacity is treated as one.
    pub fn new(capacity: usize) -> Self {
        let step = capacity.max(1);
        let mut nodes = Vec::with_capacity(step);
        nodes.resize_with(step, || None);
        Self {
            nodes,
            step,
            head: 0,
            tail: 0,
            count: 0,
        }
    }

    /// Appends an item. Amortised O(1); reallocates only when every slot is in use.
    pub fn push(&mut self, item: T) {
        if self.head == self.tail && self.count > 0 {
            self.grow();
        }
        self.nodes[self.tail] = Some(item);
        self.tail = (self.tail + 1) % self.nodes.len();
        self.count += 1;
    }

    /// Removes and returns the oldest item, or `None` when empty.
    pub fn pop(&mut self) -> Option<T> {
        if self.count == 0 {
            return None;
        }
        let item = self.nodes[self.head].take();
        self.head = (self.head + 1) % self.nodes.len();
        self.count -= 1;
        item
    }

    /// Pops everything currently queued, oldest first.
    pub fn drain_all(&mut self) -> Vec<T> {
        let mut items = Vec::with_capacity(self.count);
        while let Some(item) = self.pop() {
            items.push(item);
        }
        items
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.count
    }

    /// `true` when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Current number of slots.
    pub fn capacity(&self) -> usize {
        self.nodes.len()
    }

    fn grow(&mut self) {
        let len = self.nodes.len();
        let mut nodes: Vec<Option<T>> = Vec::with_capacity(len + self.step);
        nodes.extend(self.nodes[self.head..].iter_mut().map(Option::take));
        nodes.extend(self.nodes[..self.head].iter_mut().map(Option::take));
        nodes.resize_with(len + self.step, || None);

        self.nodes = nodes;
        self.head = 0;
        self.tail = len;
    }
}

impl<T> Default for Queue<T> {
    fn default() -> Self {
        Self::new(EVENTS_QUEUE_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pops_in_push_order() {
        let mut queue = EventQueue::new(8);
        let a = Event::new("a", 1, 1, "t");
        let b = Event::new("b", 2, 2, "t");
        let c = Event::new("c", 3, 3, "t");

        queue.push(a.clone());
        queue.push(b.clone());
        queue.push(c.clone());

        assert_eq!(queue.pop(), Some(a));
        assert_eq!(queue.pop(), Some(b));
        assert_eq!(queue.pop(), Some(c));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn grows_by_initial_capacity_and_keeps_order() {
        let capacity = 4;
        let mut queue = Queue::new(capacity);
        for i in 0..capacity + 5 {
            queue.push(i);
        }

        assert_eq!(queue.len(), capacity + 5);
        assert_eq!(queue.capacity(), capacity * 3);
        let popped: Vec<usize> = std::iter::from_fn(|| queue.pop()).collect();
        assert_eq!(popped, (0..capacity + 5).collect::<Vec<_>>());
    }

    #[test]
    fn grows_correctly_when_wrapped() {
        let mut queue = Queue::new(4);
        for i in 0..4 {
            queue.push(i);
        }
        // Move head forward so the ring wraps before it fills again.
        assert_eq!(queue.pop(), Some(0));
        assert_eq!(queue.pop(), Some(1));
        for i in 4..10 {
            queue.push(i);
        }

        assert_eq!(queue.drain_all(), (2..10).collect::<Vec<_>>());
        assert!(queue.is_empty());
    }

    #[test]
    fn does_not_grow_when_emptied_at_the_wrap_point() {
        let mut queue = Queue::new(2);
        queue.push(1);
        queue.push(2);
        queue.pop();
        queue.pop();
        queue.push(3);
        queue.push(4);

        assert_eq!(queue.capacity(), 2);
        assert_eq!(queue.drain_all(), vec![3, 4]);
    }

    #[test]
    fn zero_capacity_still_works() {
        let mut queue = Queue::new(0);
        queue.push("x");
        queue.push("y");
        assert_eq!(queue.pop(), Some("x"));
        assert_eq!(queue.pop(), Some("y"));
        assert_eq!(queue.pop(), None);
    }
}
