mod queue;
mod ring;
mod skiplist;
mod stack;
mod tagged;

pub use queue::Queue;
pub use ring::RingBuffer;
pub use skiplist::SkipList;
pub use stack::Stack;
pub(crate) use tagged::MaybeTagged;

extern crate alloc;

#[cfg(feature = "arbitrary")]
#[derive(Clone, Debug)]
#[cfg_attr(feature = "arbitrary", derive(arbitrary::Arbitrary))]
pub enum Operation<T> {
    Push { item: T },
    Pop,
    Enqueue { item: T },
    Dequeue,
    Offer { item: T },
    Poll,
}

#[cfg(feature = "arbitrary")]
#[derive(Clone, Debug)]
#[cfg_attr(feature = "arbitrary", derive(arbitrary::Arbitrary))]
pub enum SetOperation<K> {
    Add { key: K },
    Remove { key: K },
    Contains { key: K },
}
