//! Shared Buffer Grants
//!
//! A grant lends a region of process memory to a driver. While lent, the
//! owner must not read or write it; the kernel may (DMA, UART FIFOs).
//!
//! # Ownership Model
//! - Persistent grants move the caller's `&'a` borrow into the dispatcher
//!   as a [`Lent`]; revoking hands the borrow back
//! - Scoped grants cover stack buffers inside synchronous wrappers and are
//!   always revoked before the wrapper returns
//!
//! Lent buffers are kept as raw parts rather than references so the
//! kernel's writes never race a live `&mut`.

use core::marker::PhantomData;
use core::ptr::NonNull;

use log::{debug, warn};

use super::{Dispatcher, SlotKey};
use crate::syscall::{decode, DriverId, Kernel, KernelError, KernelResult};

/// A buffer currently (or formerly) lent to a driver.
#[derive(Debug)]
pub struct Lent<'a> {
    ptr: NonNull<u8>,
    len: usize,
    exclusive: bool,
    _borrow: PhantomData<&'a mut [u8]>,
}

impl<'a> Lent<'a> {
    /// Lend a buffer the driver may write.
    pub(crate) fn exclusive(buffer: &'a mut [u8]) -> Self {
        Self {
            len: buffer.len(),
            ptr: NonNull::from(buffer).cast(),
            exclusive: true,
            _borrow: PhantomData,
        }
    }

    /// Lend a buffer the driver only reads.
    pub(crate) fn shared(buffer: &'a [u8]) -> Self {
        Self {
            len: buffer.len(),
            ptr: NonNull::from(buffer).cast(),
            exclusive: false,
            _borrow: PhantomData,
        }
    }

    /// Length of the lent region.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if the lent region is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Check if the driver was allowed to write the region.
    #[inline]
    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    /// Raw parts handed to the `allow` trap.
    #[inline]
    pub(crate) fn raw_parts(&self) -> (*mut u8, usize) {
        (self.ptr.as_ptr(), self.len)
    }

    /// Take back a writable buffer.
    ///
    /// Returns `None` for a read-only grant, which never carried a `&mut`.
    pub fn into_mut(self) -> Option<&'a mut [u8]> {
        if !self.exclusive {
            return None;
        }
        // SAFETY: Built from a `&'a mut [u8]` in `exclusive`; the borrow was
        // held by this value alone and the kernel no longer has the region.
        Some(unsafe { core::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) })
    }

    /// Take back the buffer for reading.
    pub fn into_ref(self) -> &'a [u8] {
        // SAFETY: Built from a `&'a [u8]` or `&'a mut [u8]` of this length
        unsafe { core::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

/// A grant of a stack buffer that is revoked when dropped.
///
/// Borrows the buffer for its whole life, so the owner cannot touch it
/// while the driver may.
pub(crate) struct ScopedGrant<'s, 'a, K: Kernel> {
    dispatcher: &'s Dispatcher<'a, K>,
    key: SlotKey,
    _buffer: PhantomData<&'s mut [u8]>,
}

impl<'s, 'a, K: Kernel> Drop for ScopedGrant<'s, 'a, K> {
    fn drop(&mut self) {
        if let Err(e) = self.dispatcher.revoke_key(self.key) {
            warn!("{}: revoking scoped grant on slot {} failed: {}", self.key.driver, self.key.slot, e);
        }
    }
}

impl<'a, K: Kernel> Dispatcher<'a, K> {
    /// Lend `buffer` to `(driver, slot)` for writing until revoked.
    ///
    /// # Returns
    /// The buffer previously lent on that slot, if any. The kernel no
    /// longer holds it.
    pub fn allow(
        &self,
        driver: DriverId,
        slot: u32,
        buffer: &'a mut [u8],
    ) -> KernelResult<Option<Lent<'a>>> {
        self.lend(SlotKey::new(driver, slot), Lent::exclusive(buffer))
    }

    /// Lend `buffer` to `(driver, slot)` for reading until revoked.
    pub fn allow_readonly(
        &self,
        driver: DriverId,
        slot: u32,
        buffer: &'a [u8],
    ) -> KernelResult<Option<Lent<'a>>> {
        self.lend(SlotKey::new(driver, slot), Lent::shared(buffer))
    }

    /// Revoke whatever is lent on `(driver, slot)`.
    ///
    /// Always issues `allow(driver, slot, null, 0)`, so it is safe to call on
    /// a slot that was never granted.
    pub fn revoke(&self, driver: DriverId, slot: u32) -> KernelResult<Option<Lent<'a>>> {
        let key = SlotKey::new(driver, slot);
        self.revoke_key(key)?;
        Ok(self.grants.borrow_mut().remove(&key))
    }

    /// Check if a persistent grant is held on `(driver, slot)`.
    pub fn is_lent(&self, driver: DriverId, slot: u32) -> bool {
        self.grants.borrow().contains_key(&SlotKey::new(driver, slot))
    }

    fn lend(&self, key: SlotKey, lent: Lent<'a>) -> KernelResult<Option<Lent<'a>>> {
        if lent.is_empty() {
            return Err(KernelError::Size);
        }
        let (ptr, len) = lent.raw_parts();
        // SAFETY: `lent` owns the borrow and is stored below; it is only
        // released by `revoke`, by a replacing grant, or on drop, all of
        // which revoke the kernel's access first.
        decode(unsafe { self.kernel.allow(key.driver, key.slot, ptr, len) })?;
        debug!("{}: lent {} bytes on allow slot {}", key.driver, len, key.slot);
        Ok(self.grants.borrow_mut().insert(key, lent))
    }

    /// Lend a read-only stack buffer for the life of the returned guard.
    pub(crate) fn lend_scoped<'s>(
        &'s self,
        driver: DriverId,
        slot: u32,
        buffer: &'s [u8],
    ) -> KernelResult<ScopedGrant<'s, 'a, K>> {
        // Read-only slots are never written by the driver.
        self.lend_scoped_raw(driver, slot, buffer.as_ptr() as *mut u8, buffer.len())
    }

    /// Lend a writable stack buffer for the life of the returned guard.
    pub(crate) fn lend_scoped_mut<'s>(
        &'s self,
        driver: DriverId,
        slot: u32,
        buffer: &'s mut [u8],
    ) -> KernelResult<ScopedGrant<'s, 'a, K>> {
        self.lend_scoped_raw(driver, slot, buffer.as_mut_ptr(), buffer.len())
    }

    fn lend_scoped_raw<'s>(
        &'s self,
        driver: DriverId,
        slot: u32,
        ptr: *mut u8,
        len: usize,
    ) -> KernelResult<ScopedGrant<'s, 'a, K>> {
        if len == 0 {
            return Err(KernelError::Size);
        }
        let key = SlotKey::new(driver, slot);
        // SAFETY: The guard borrows the buffer for 's and revokes on drop
        decode(unsafe { self.kernel.allow(driver, slot, ptr, len) })?;
        if self.grants.borrow_mut().remove(&key).is_some() {
            debug!("{}: persistent grant on slot {} displaced", driver, slot);
        }
        Ok(ScopedGrant {
            dispatcher: self,
            key,
            _buffer: PhantomData,
        })
    }

    pub(super) fn revoke_key(&self, key: SlotKey) -> KernelResult<()> {
        // SAFETY: A zero-length grant lends nothing
        decode(unsafe {
            self.kernel
                .allow(key.driver, key.slot, core::ptr::null_mut(), 0)
        })
        .map(|_| ())
    }
}
