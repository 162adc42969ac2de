//! Shared intrusive-list accessor used by both the per-priority ready
//! queues ([`crate::prio::ReadyQueue`]) and per-object wait queues
//! ([`crate::wait::WaitQueue`]).
//!
//! Invariant 2 of the spec (a task is in at most one of {a ready list, one
//! object's wait list} at a time) means a single pair of link fields on the
//! task can be shared between both purposes instead of keeping two
//! separate sets of pointers around.
use nimbus_hal::Id;

pub trait IntrusiveLinks {
    fn links_mut(&mut self, id: Id) -> (&mut Option<Id>, &mut Option<Id>);
    fn links(&self, id: Id) -> (Option<Id>, Option<Id>);
    /// The member's scheduling priority, consulted by
    /// [`crate::wait::WaitQueue::enqueue`] to find a priority-ordered
    /// insertion point without a separate closure that would otherwise
    /// have to borrow the same backing pool a second time.
    fn priority(&self, id: Id) -> u8;
}
