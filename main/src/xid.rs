use mockall::automock;
use std::sync::atomic::AtomicU16;
use std::sync::atomic::Ordering;

/// Source of transaction IDs for outgoing requests.
#[automock]
pub trait XidGenerator {
    fn generate(&self) -> u16;
}

/// Hands out consecutive XIDs starting from a random value.
pub struct SequentialXidGenerator {
    next: AtomicU16,
}

impl Default for SequentialXidGenerator {
    fn default() -> Self {
        Self {
            next: AtomicU16::new(rand::random()),
        }
    }
}

impl XidGenerator for SequentialXidGenerator {
    fn generate(&self) -> u16 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}
