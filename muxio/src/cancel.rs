//! Cancellation handles for asynchronous operations.

use std::cell::Cell;
use std::rc::Rc;

/// A cheap-clone cancellation flag shared between the caller and an
/// outstanding waiter. Checked at every waiter completion point.
#[derive(Debug, Clone, Default)]
pub struct Cancellable {
    flag: Rc<Cell<bool>>,
}

impl Cancellable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.flag.set(true);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.get()
    }
}
