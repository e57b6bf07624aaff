//! Process Heap Allocator
//!
//! Uses `linked_list_allocator` for block management and `memop` to get
//! memory from the kernel.
//!
//! # Memory Layout
//! The heap sits directly above the process break:
//! - The first allocation moves the break and initialises the heap there
//! - Later growth extends the heap in place, so the break must not be
//!   moved by anyone else once the heap owns it
//!
//! Applications install it with
//! `#[global_allocator] static HEAP: ProcessHeap<Trap> = ProcessHeap::new(Trap);`

use core::alloc::{GlobalAlloc, Layout};
use core::fmt;
use core::ptr::{self, NonNull};

use linked_list_allocator::Heap;
use log::{debug, warn};
use spin::Mutex;

use crate::syscall::{decode, Kernel, KernelError, MemOp};

/// Minimum number of bytes the break moves by when the heap grows.
pub const HEAP_GROWTH_STEP: usize = 4096;

/// A global allocator growing through `memop`.
pub struct ProcessHeap<K: Kernel> {
    kernel: K,
    heap: Mutex<Heap>,
}

impl<K: Kernel> ProcessHeap<K> {
    /// Create an empty heap; no memory is requested until the first
    /// allocation.
    pub const fn new(kernel: K) -> Self {
        Self {
            kernel,
            heap: Mutex::new(Heap::empty()),
        }
    }

    /// Bytes currently owned by the heap.
    pub fn size(&self) -> usize {
        self.heap.lock().size()
    }

    /// Bytes handed out and not yet freed.
    pub fn used(&self) -> usize {
        self.heap.lock().used()
    }

    /// Allocate `layout`, growing the heap once if needed.
    ///
    /// Returns the block (null on failure) and the growth attempt, if any.
    /// The heap lock is released on return, so the caller may log freely.
    fn claim(&self, layout: Layout) -> (*mut u8, Option<Result<usize, GrowError>>) {
        let mut heap = self.heap.lock();
        if let Ok(block) = heap.allocate_first_fit(layout) {
            return (block.as_ptr(), None);
        }
        match self.grow(&mut heap, layout) {
            Ok(step) => {
                let block = heap
                    .allocate_first_fit(layout)
                    .map_or(ptr::null_mut(), |block| block.as_ptr());
                (block, Some(Ok(step)))
            }
            Err(e) => (ptr::null_mut(), Some(Err(e))),
        }
    }

    /// Move the break so that a request of `layout` fits.
    ///
    /// # Returns
    /// The number of bytes the heap grew by.
    fn grow(&self, heap: &mut Heap, layout: Layout) -> Result<usize, GrowError> {
        let wanted = layout.size().saturating_add(layout.align());
        let step = wanted.div_ceil(HEAP_GROWTH_STEP).saturating_mul(HEAP_GROWTH_STEP);
        let increment = isize::try_from(step).map_err(|_| GrowError::TooLarge(step))?;

        let old_break = decode(self.kernel.memop(MemOp::Sbrk, increment))
            .map_err(|e| GrowError::Refused(step, e))? as *mut u8;

        if heap.bottom().is_null() {
            // SAFETY: The kernel just handed us [old_break, old_break + step)
            // and nothing else uses it.
            unsafe { heap.init(old_break, step) };
        } else if heap.top() == old_break {
            // SAFETY: The new region directly follows the current heap
            unsafe { heap.extend(step) };
        } else {
            return Err(GrowError::BreakMoved {
                found: old_break as usize,
                expected: heap.top() as usize,
            });
        }
        Ok(step)
    }
}

/// Why the heap could not grow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GrowError {
    /// The request does not fit in a `memop` argument
    TooLarge(usize),
    /// `memop(Sbrk)` failed
    Refused(usize, KernelError),
    /// Someone else moved the break
    BreakMoved { found: usize, expected: usize },
}

impl fmt::Display for GrowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooLarge(step) => write!(f, "growth of {} bytes too large", step),
            Self::Refused(step, e) => write!(f, "sbrk({}) refused: {}", step, e),
            Self::BreakMoved { found, expected } => {
                write!(f, "break moved behind our back ({:#x} != {:#x})", found, expected)
            }
        }
    }
}

unsafe impl<K: Kernel> GlobalAlloc for ProcessHeap<K> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let (block, growth) = self.claim(layout);
        match growth {
            Some(Ok(step)) => debug!("heap: grew by {} bytes", step),
            Some(Err(e)) => warn!("heap: {}", e),
            None => {}
        }
        block
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if let Some(block) = NonNull::new(ptr) {
            // SAFETY: Caller passes a block this allocator returned for `layout`
            unsafe { self.heap.lock().deallocate(block, layout) };
        }
    }
}
