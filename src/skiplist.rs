use core::sync::atomic::{AtomicUsize, Ordering};
use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};

/// Ceiling on tower height. A node's height is drawn from fair coin flips,
/// so level `i` carries roughly every `2^i`-th key.
const MAX_LEVEL: usize = 16;

/// Tag bit on a link marking its owner as logically deleted.
const MARKED: usize = 0b1;

struct Node<K> {
    key: K,
    /// One markable link per level of this node's tower. The mark lives in
    /// the link's tag so pointer and flag always change under a single CAS.
    next: Vec<Atomic<Node<K>>>,
}

impl<K> Node<K> {
    fn new(key: K, height: usize) -> Self {
        let mut next = Vec::with_capacity(height);
        for _ in 0..height {
            next.push(Atomic::null());
        }
        Node { key, next }
    }

    /// Marks every level of the tower, top down. Returns `true` for the
    /// thread whose CAS tagged level 0; that thread owns the removal.
    fn mark_tower(&self, guard: &Guard) -> bool {
        for level in (0..self.next.len()).rev() {
            let mut next = self.next[level].load(Ordering::SeqCst, guard);
            loop {
                if next.tag() == MARKED {
                    if level == 0 {
                        return false;
                    }
                    break;
                }
                match self.next[level].compare_exchange(
                    next,
                    next.with_tag(MARKED),
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                    guard,
                ) {
                    Ok(_) => break,
                    Err(err) => next = err.current,
                }
            }
        }
        true
    }
}

/// A probabilistic ordered set with lock free `add`, `remove` and
/// `contains`.
///
/// Every link is markable: removal first tags a node's own links (the
/// logical delete, which is the linearization point) and only then unlinks
/// it physically. Traversals that run into a marked link help unlink its
/// owner, so the list reachable through unmarked links is always sorted and
/// duplicate free at every level.
///
/// Unlinked nodes are handed to the epoch collector and freed once every
/// thread pinned at unlink time has moved on.
pub struct SkipList<K> {
    head: [Atomic<Node<K>>; MAX_LEVEL],
    len: AtomicUsize,
}

impl<K> SkipList<K>
where
    K: Ord,
{
    pub fn new() -> Self {
        SkipList {
            head: core::array::from_fn(|_| Atomic::null()),
            len: AtomicUsize::new(0),
        }
    }

    /// Advisory number of keys; stale under concurrent mutation.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn random_height() -> usize {
        let mut height = 1;
        while height < MAX_LEVEL && rand::random::<bool>() {
            height += 1;
        }
        height
    }

    /// Locates `key`'s would-be position at every level.
    ///
    /// Returns, per level, the link cell of the last node with a smaller key
    /// (the cell an insertion would CAS) and the first node with a key not
    /// smaller. Marked nodes encountered on the way are snipped out; a
    /// failed snip restarts the whole descent, so a clean return certifies
    /// that no marked node sits on the search path at any level.
    fn find<'g>(
        &'g self,
        key: &K,
        guard: &'g Guard,
    ) -> (
        [&'g Atomic<Node<K>>; MAX_LEVEL],
        [Shared<'g, Node<K>>; MAX_LEVEL],
    ) {
        'retry: loop {
            let mut preds: [&'g Atomic<Node<K>>; MAX_LEVEL] =
                core::array::from_fn(|level| &self.head[level]);
            let mut succs = [Shared::null(); MAX_LEVEL];

            let mut pred_next: &'g [Atomic<Node<K>>] = &self.head;

            for level in (0..MAX_LEVEL).rev() {
                let mut curr = pred_next[level].load(Ordering::SeqCst, guard);

                // A tag here belongs to the predecessor: it was marked under
                // us, so any CAS through its cells would be void. Start over.
                if curr.tag() == MARKED {
                    continue 'retry;
                }

                while let Some(node) = unsafe { curr.as_ref() } {
                    let succ = node.next[level].load(Ordering::SeqCst, guard);

                    if succ.tag() == MARKED {
                        // Logically deleted; unlink it from this level
                        // before moving on.
                        match pred_next[level].compare_exchange(
                            curr,
                            succ.with_tag(0),
                            Ordering::SeqCst,
                            Ordering::SeqCst,
                            guard,
                        ) {
                            Ok(_) => {
                                curr = succ.with_tag(0);
                                continue;
                            }
                            Err(_) => continue 'retry,
                        }
                    }

                    if node.key < *key {
                        pred_next = &node.next;
                        curr = succ;
                    } else {
                        break;
                    }
                }

                preds[level] = &pred_next[level];
                succs[level] = curr;
            }

            return (preds, succs);
        }
    }

    /// Adds `key` to the set. Returns `false` without modifying the set if
    /// the key is already a member, so racing duplicate adds leave level 0
    /// with a single copy.
    pub fn add(&self, key: K) -> bool {
        let guard = &epoch::pin();
        let height = Self::random_height();
        let mut node = Owned::new(Node::new(key, height));

        loop {
            let (preds, succs) = self.find(&node.key, guard);

            if let Some(found) = unsafe { succs[0].as_ref() } {
                if found.key == node.key {
                    return false;
                }
            }

            // The node is still private; plain stores set up its links.
            for level in 0..height {
                node.next[level].store(succs[level], Ordering::Relaxed);
            }

            // Level 0 is the linearization point: once this CAS lands the
            // key is a member.
            match preds[0].compare_exchange(
                succs[0],
                node,
                Ordering::SeqCst,
                Ordering::SeqCst,
                guard,
            ) {
                Ok(new) => {
                    self.len.fetch_add(1, Ordering::Relaxed);
                    self.link_tower(new, height, preds, succs, guard);
                    return true;
                }
                Err(err) => node = err.new,
            }
        }
    }

    /// Links an inserted node in at levels `1..height`. Each level is one
    /// CAS; a failed level re-locates its predecessor and retries just that
    /// level. If the node is removed while we are still linking, stop --
    /// traversals finish the unlink from whatever levels were reached.
    fn link_tower<'g>(
        &'g self,
        new: Shared<'g, Node<K>>,
        height: usize,
        preds: [&'g Atomic<Node<K>>; MAX_LEVEL],
        succs: [Shared<'g, Node<K>>; MAX_LEVEL],
        guard: &'g Guard,
    ) {
        let new_ref = unsafe { new.deref() };
        let mut preds = preds;
        let mut succs = succs;

        'levels: for level in 1..height {
            loop {
                let next = new_ref.next[level].load(Ordering::SeqCst, guard);
                if next.tag() == MARKED {
                    break 'levels;
                }

                // Refresh our own forward link first; a failure means a
                // remover tagged it under us.
                if next != succs[level]
                    && new_ref.next[level]
                        .compare_exchange(
                            next,
                            succs[level],
                            Ordering::SeqCst,
                            Ordering::SeqCst,
                            guard,
                        )
                        .is_err()
                {
                    break 'levels;
                }

                if preds[level]
                    .compare_exchange(
                        succs[level],
                        new,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                        guard,
                    )
                    .is_ok()
                {
                    continue 'levels;
                }

                // Lost the race at this level; re-locate the predecessor.
                let (fresh_preds, fresh_succs) = self.find(&new_ref.key, guard);
                if fresh_succs[0] != new {
                    // Removed (and possibly replaced) while linking.
                    break 'levels;
                }
                preds = fresh_preds;
                succs = fresh_succs;
            }
        }

        // If a remover tagged the node mid-link, lend a hand with the
        // physical unlink before returning.
        if new_ref.next[0].load(Ordering::SeqCst, guard).tag() == MARKED {
            let _ = self.find(&new_ref.key, guard);
        }
    }

    /// Removes `key` from the set. Returns `false` if it was not a member.
    pub fn remove(&self, key: &K) -> bool {
        let guard = &epoch::pin();

        let (_, succs) = self.find(key, guard);

        let node = match unsafe { succs[0].as_ref() } {
            Some(node) if node.key == *key => node,
            _ => return false,
        };

        // Tagging level 0 is the linearization point; exactly one racing
        // remover wins it and owns the reclamation.
        if !node.mark_tower(guard) {
            return false;
        }

        self.len.fetch_sub(1, Ordering::Relaxed);

        // Certify the node is off every level, then let the collector free
        // it once all current pins have ended.
        let _ = self.find(key, guard);
        unsafe {
            guard.defer_destroy(succs[0]);
        }

        true
    }

    /// Membership test. Read only: marked nodes are skipped but not
    /// unlinked, so lookups never write to shared memory.
    pub fn contains(&self, key: &K) -> bool {
        let guard = &epoch::pin();

        let mut pred_next: &[Atomic<Node<K>>] = &self.head;
        let mut candidate = Shared::null();

        for level in (0..MAX_LEVEL).rev() {
            let mut curr = pred_next[level].load(Ordering::SeqCst, guard);

            while let Some(node) = unsafe { curr.as_ref() } {
                let succ = node.next[level].load(Ordering::SeqCst, guard);

                if succ.tag() == MARKED {
                    curr = succ.with_tag(0);
                    continue;
                }

                if node.key < *key {
                    pred_next = &node.next;
                    curr = succ;
                } else {
                    break;
                }
            }

            candidate = curr;
        }

        match unsafe { candidate.as_ref() } {
            Some(node) => node.key == *key,
            None => false,
        }
    }

    /// Collects the live keys in order by walking level 0 once. The result
    /// is a consistent-enough snapshot for inspection; concurrent updates
    /// may or may not be included.
    pub fn snapshot(&self) -> Vec<K>
    where
        K: Clone,
    {
        let guard = &epoch::pin();
        let mut keys = Vec::new();

        let mut curr = self.head[0].load(Ordering::SeqCst, guard);
        while let Some(node) = unsafe { curr.as_ref() } {
            let succ = node.next[0].load(Ordering::SeqCst, guard);
            if succ.tag() != MARKED {
                keys.push(node.key.clone());
            }
            curr = succ.with_tag(0);
        }

        keys
    }
}

impl<K: Ord> Default for SkipList<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K> Drop for SkipList<K> {
    fn drop(&mut self) {
        // Exclusive access: every reachable node hangs off level 0, and
        // nodes already unlinked belong to the collector.
        unsafe {
            let guard = epoch::unprotected();
            let mut curr = self.head[0].load(Ordering::Relaxed, guard);

            while let Some(node) = curr.as_ref() {
                let next = node.next[0].load(Ordering::Relaxed, guard);
                drop(curr.into_owned());
                curr = next.with_tag(0);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_add_contains() {
        let list = SkipList::new();

        assert!(list.add(3));
        assert!(list.add(1));
        assert!(list.add(2));

        assert!(list.contains(&1));
        assert!(list.contains(&2));
        assert!(list.contains(&3));
        assert!(!list.contains(&4));
        assert_eq!(list.len(), 3);
    }

    #[test]
    fn test_duplicate_add() {
        let list = SkipList::new();

        assert!(list.add(7));
        assert!(!list.add(7));

        assert!(list.contains(&7));
        assert_eq!(list.snapshot(), vec![7]);
    }

    #[test]
    fn test_remove() {
        let list = SkipList::new();

        list.add(1);
        list.add(2);

        assert!(list.remove(&1));
        assert!(!list.contains(&1));
        assert!(list.contains(&2));
        assert!(!list.remove(&1));
        assert!(!list.remove(&9));
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_snapshot_sorted() {
        let list = SkipList::new();

        for key in [9, 4, 7, 1, 8, 2, 6, 3, 5] {
            list.add(key);
        }

        assert_eq!(list.snapshot(), vec![1, 2, 3, 4, 5, 6, 7, 8, 9]);
    }

    #[test]
    fn test_sorted_after_concurrent_adds() {
        let list = Arc::new(SkipList::new());

        let mut threads = vec![];

        // Overlapping ranges force key-level races.
        for i in 0..4u64 {
            let list = list.clone();

            threads.push(thread::spawn(move || {
                for j in 0..500 {
                    list.add(i * 250 + j);
                }
            }));
        }

        for thread in threads {
            thread.join().unwrap();
        }

        let keys = list.snapshot();
        let expected: Vec<u64> = (0..1_250).collect();
        assert_eq!(keys, expected, "level 0 must stay sorted and duplicate free");

        for key in (0..1_250).step_by(97) {
            assert!(list.contains(&key));
        }
    }

    #[test]
    fn test_racing_duplicate_adds() {
        let list = Arc::new(SkipList::new());

        let mut threads = vec![];

        for _ in 0..8 {
            let list = list.clone();

            threads.push(thread::spawn(move || {
                for key in 0..64 {
                    list.add(key);
                }
            }));
        }

        for thread in threads {
            thread.join().unwrap();
        }

        let expected: Vec<i32> = (0..64).collect();
        assert_eq!(list.snapshot(), expected);
    }

    #[test]
    fn test_add_remove_sync() {
        let list = Arc::new(SkipList::new());

        let mut threads = vec![];

        for _ in 0..8 {
            let list = list.clone();

            threads.push(thread::spawn(move || {
                for _ in 0..500 {
                    let key = rand::random::<u8>() % 32;
                    if rand::random::<u8>() % 3 == 0 {
                        list.remove(&key);
                    } else {
                        list.add(key);
                    }
                }
            }));
        }

        for thread in threads {
            thread.join().unwrap();
        }

        // Whatever survived, level 0 is sorted and duplicate free, and
        // membership agrees with the snapshot.
        let keys = list.snapshot();
        for pair in keys.windows(2) {
            assert!(pair[0] < pair[1]);
        }
        for key in &keys {
            assert!(list.contains(key));
        }
    }

    #[test]
    fn test_remove_then_readd() {
        let list = SkipList::new();

        assert!(list.add(5));
        assert!(list.remove(&5));
        assert!(list.add(5));
        assert!(list.contains(&5));
        assert_eq!(list.snapshot(), vec![5]);
    }
}
