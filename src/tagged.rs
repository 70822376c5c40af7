use core::marker::PhantomData;
use core::sync::atomic::{AtomicUsize, Ordering};

/// An atomic pointer cell whose lowest alignment bit is reserved as a mark.
///
/// Pointer and mark share one word, so a single CAS always covers the pair:
/// a link observed unmarked cannot be swung by a thread racing with a marker.
/// The stack and queue only ever use the plain-pointer subset; a CAS against
/// a link that has since been marked fails on the tag bit alone.
pub(crate) struct MaybeTagged<T> {
    cell: AtomicUsize,
    _marker: PhantomData<*mut T>,
}

unsafe impl<T: Send> Send for MaybeTagged<T> {}
unsafe impl<T: Send> Sync for MaybeTagged<T> {}

const MARK: usize = 0b1;

impl<T> MaybeTagged<T> {
    pub(crate) fn new(ptr: *mut T) -> Self {
        MaybeTagged {
            cell: AtomicUsize::new(ptr as usize),
            _marker: PhantomData,
        }
    }

    fn decompose(raw: usize) -> (*mut T, bool) {
        ((raw & !MARK) as *mut T, raw & MARK == MARK)
    }

    pub(crate) fn load_ptr(&self) -> *mut T {
        Self::decompose(self.cell.load(Ordering::Acquire)).0
    }

    pub(crate) fn store_ptr(&self, ptr: *mut T) {
        self.cell.store(ptr as usize, Ordering::Release);
    }

    /// CAS from one unmarked pointer to another.
    ///
    /// On failure the observed pointer and mark are handed back so the
    /// caller can re-route without a second load.
    pub(crate) fn compare_exchange(
        &self,
        current: *mut T,
        new: *mut T,
        success: Ordering,
        failure: Ordering,
    ) -> Result<*mut T, (*mut T, bool)> {
        self.cell
            .compare_exchange(current as usize, new as usize, success, failure)
            .map(|prev| prev as *mut T)
            .map_err(Self::decompose)
    }
}
