use crate::stack::layout;
use crate::MaybeTagged;
use alloc::alloc::{alloc, dealloc, handle_alloc_error};
use core::mem::MaybeUninit;
use core::ptr::{null_mut, NonNull};
use core::sync::atomic::{AtomicUsize, Ordering};
use haphazard::{Domain, HazardPointer, Singleton};

struct Node<V> {
    val: MaybeUninit<V>,
    next: MaybeTagged<Self>,
}

impl<V> Node<V> {
    fn new(val: V) -> *mut Self {
        unsafe {
            let node = Self::sentinel();
            (*node).val.write(val);
            node
        }
    }

    /// A node with no payload. The queue keeps exactly one reachable at all
    /// times so `head` is never null.
    fn sentinel() -> *mut Self {
        unsafe {
            let layout = layout::<Self>();
            let node = alloc(layout).cast::<Self>();
            if node.is_null() {
                handle_alloc_error(layout);
            }
            core::ptr::write(&mut (*node).next, MaybeTagged::new(null_mut()));
            node
        }
    }

    unsafe fn dealloc(raw: *mut Self) {
        dealloc(raw.cast(), layout::<Self>());
    }
}

/// A Michael–Scott queue.
///
/// `head` always points at a sentinel whose payload has already been handed
/// out (or never existed); the first real value lives one link behind it.
/// `tail` may lag the true last node by one link and is repaired
/// cooperatively by whichever thread observes the lag.
pub struct Queue<V> {
    head: MaybeTagged<Node<V>>,
    tail: MaybeTagged<Node<V>>,
    len: AtomicUsize,
}

struct QueueFamily;

unsafe impl Singleton for QueueFamily {}

static QUEUE_FAMILY: Domain<QueueFamily> = Domain::new(&QueueFamily);

impl<V> Queue<V> {
    pub fn new() -> Self {
        let sentinel = Node::sentinel();

        Queue {
            head: MaybeTagged::new(sentinel),
            tail: MaybeTagged::new(sentinel),
            len: AtomicUsize::new(0),
        }
    }

    /// Advisory length; may be stale the instant it returns.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        // The sentinel must be protected even for a peek; a racing dequeue
        // may retire it at any moment.
        let head = NodeRef::from_live(&self.head);
        head.next.load_ptr().is_null()
    }

    pub fn enqueue(&self, val: V) {
        let node_ptr = Node::new(val);

        loop {
            let tail = NodeRef::from_live(&self.tail);
            let next_ptr = tail.next.load_ptr();

            if !next_ptr.is_null() {
                // Stale tail left behind by a half-finished enqueue. Help
                // advance it and retry; nothing is allocated on this path.
                let _ = self.tail.compare_exchange(
                    tail.as_ptr(),
                    next_ptr,
                    Ordering::Release,
                    Ordering::Relaxed,
                );
                continue;
            }

            if tail
                .next
                .compare_exchange(null_mut(), node_ptr, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                // Best effort; a failure here is repaired by the next
                // operation that observes the lag.
                let _ = self.tail.compare_exchange(
                    tail.as_ptr(),
                    node_ptr,
                    Ordering::Release,
                    Ordering::Relaxed,
                );

                self.len.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
    }

    /// Dequeues the oldest value, or `None` if the queue is observed empty.
    pub fn dequeue(&self) -> Option<V>
    where
        V: Send,
    {
        loop {
            let head = NodeRef::from_live(&self.head);
            let tail_ptr = self.tail.load_ptr();
            let next_ptr = head.next.load_ptr();

            if head.as_ptr() == tail_ptr {
                if next_ptr.is_null() {
                    return None;
                }

                // Tail is lagging behind an enqueue that has linked its node
                // but not yet swung the tail.
                let _ = self.tail.compare_exchange(
                    tail_ptr,
                    next_ptr,
                    Ordering::Release,
                    Ordering::Relaxed,
                );
                continue;
            }

            if next_ptr.is_null() {
                // Inconsistent snapshot; re-read from the top.
                continue;
            }

            // Protect the successor before the head CAS: the moment it
            // becomes the sentinel, another dequeuer may advance past it and
            // retire it while we are still reading the payload.
            let mut next_hazard = HazardPointer::new_in_domain(&QUEUE_FAMILY);
            next_hazard.protect_raw(next_ptr);

            if self.head.load_ptr() != head.as_ptr() {
                continue;
            }

            if self
                .head
                .compare_exchange(head.as_ptr(), next_ptr, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                self.len.fetch_sub(1, Ordering::Relaxed);

                // The payload travels with the node the head advanced onto;
                // the winning CAS makes this thread its unique reader.
                let val = unsafe { (*next_ptr).val.assume_init_read() };

                unsafe {
                    QUEUE_FAMILY.retire_ptr::<_, FreeNode<_>>(head.as_ptr());
                }

                return Some(val);
            }
        }
    }
}

impl<V> Default for Queue<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Drop for Queue<V> {
    fn drop(&mut self) {
        unsafe {
            // The sentinel's payload is dead; every node after it is live.
            let sentinel = self.head.load_ptr();
            let mut curr = (*sentinel).next.load_ptr();
            Node::dealloc(sentinel);

            while !curr.is_null() {
                let next = (*curr).next.load_ptr();
                (*curr).val.assume_init_drop();
                Node::dealloc(curr);
                curr = next;
            }
        }
    }
}

struct NodeRef<'a, V> {
    node: NonNull<Node<V>>,
    _hazard: HazardPointer<'a, QueueFamily>,
}

impl<'a, V> NodeRef<'a, V> {
    fn as_ptr(&self) -> *mut Node<V> {
        self.node.as_ptr()
    }

    /// Protects the pointer held by a cell that is never null (the queue's
    /// head and tail), re-reading until the protection sticks.
    fn from_live(cell: &MaybeTagged<Node<V>>) -> Self {
        let mut _hazard = HazardPointer::new_in_domain(&QUEUE_FAMILY);
        let mut ptr = cell.load_ptr();

        _hazard.protect_raw(ptr);

        let mut v_ptr = cell.load_ptr();

        while !core::ptr::eq(ptr, v_ptr) {
            ptr = v_ptr;
            _hazard.protect_raw(ptr);

            v_ptr = cell.load_ptr();
        }

        debug_assert!(!ptr.is_null());

        unsafe {
            NodeRef {
                node: NonNull::new_unchecked(ptr),
                _hazard,
            }
        }
    }
}

impl<'a, V> core::ops::Deref for NodeRef<'a, V> {
    type Target = Node<V>;
    fn deref(&self) -> &Self::Target {
        unsafe { self.node.as_ref() }
    }
}

/// Retired queue nodes are always dead sentinels: their payload was either
/// moved out when the head advanced onto them or never written. Only the
/// allocation is released.
#[repr(transparent)]
struct FreeNode<V>(NonNull<Node<V>>);

impl<V> Drop for FreeNode<V> {
    fn drop(&mut self) {
        unsafe {
            Node::dealloc(self.0.as_ptr());
        }
    }
}

impl<V> core::ops::Deref for FreeNode<V> {
    type Target = Node<V>;
    fn deref(&self) -> &Self::Target {
        unsafe { self.0.as_ref() }
    }
}

unsafe impl<V> haphazard::raw::Pointer<Node<V>> for FreeNode<V> {
    fn into_raw(self) -> *mut Node<V> {
        let ptr = self.0.as_ptr();
        core::mem::forget(self);
        ptr
    }

    unsafe fn from_raw(ptr: *mut Node<V>) -> Self {
        Self(NonNull::new_unchecked(ptr))
    }
}
