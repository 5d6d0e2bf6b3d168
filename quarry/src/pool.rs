//! Bulk arenas that buffers are carved from.
//!
//! A pool holds and manages the memory of the buffers allocated from it, so that the driver can
//! amortize the cost of servicing allocations across a whole batch. The pool is the unit of
//! invalidation: destroying or resetting it invalidates every buffer carved from it at once,
//! without the buffers having to be released individually.
//!
//! A pool is application-synchronized: it must not be used from more than one thread at a time,
//! including through the buffers allocated from it. The type is therefore not `Sync`, and every
//! operation on a buffer goes through a reference to its pool.

use crate::{
    device::{Device, DeviceOwned, DeviceOwnedDebugWrapper},
    ffi,
    macros::{driver_bitflags, impl_id_counter},
    QuarryError, QuarryObject, Validated, ValidationError,
};
use foldhash::HashSet;
use smallvec::SmallVec;
use std::{
    cell::{Cell, RefCell},
    num::NonZero,
    ptr,
    sync::Arc,
};

/// Represents a buffer pool.
///
/// A pool is always tied to a specific queue family, and buffers allocated from it can only be
/// submitted on queues of that family.
#[derive(Debug)]
pub struct Pool {
    handle: ffi::PoolHandle,
    device: DeviceOwnedDebugWrapper<Arc<Device>>,
    id: NonZero<u64>,

    flags: PoolCreateFlags,
    queue_family_index: u32,

    // Advanced by every reset; buffers carry the epoch they were allocated under, which is how
    // stale buffers are recognized after a reset.
    epoch: Cell<u64>,
    // Ids of the buffers currently carved from this pool.
    live: RefCell<HashSet<NonZero<u64>>>,
    destroyed: Cell<bool>,
    // The interior mutability above also keeps this type `!Sync`, which is required: the driver
    // treats a pool and its buffers as externally synchronized.
}

impl Pool {
    /// Creates a new `Pool`.
    pub fn new(
        device: Arc<Device>,
        create_info: PoolCreateInfo,
    ) -> Result<Pool, Validated<QuarryError>> {
        Self::validate_new(&device, &create_info)?;

        Ok(unsafe { Self::new_unchecked(device, create_info) }?)
    }

    fn validate_new(
        device: &Device,
        create_info: &PoolCreateInfo,
    ) -> Result<(), Box<ValidationError>> {
        create_info
            .validate(device)
            .map_err(|err| err.add_context("create_info"))?;

        Ok(())
    }

    #[cfg_attr(not(feature = "document_unchecked"), doc(hidden))]
    pub unsafe fn new_unchecked(
        device: Arc<Device>,
        create_info: PoolCreateInfo,
    ) -> Result<Pool, QuarryError> {
        let &PoolCreateInfo {
            flags,
            queue_family_index,
            _ne: _,
        } = &create_info;

        let create_info_raw = ffi::PoolCreateInfo {
            stype: ffi::StructureType::POOL_CREATE_INFO,
            next: ptr::null(),
            flags: flags.into(),
            queue_family_index,
        };

        let handle = {
            let driver = device.driver();
            let mut output = std::mem::MaybeUninit::uninit();
            unsafe { driver.create_pool(device.handle(), &create_info_raw, output.as_mut_ptr()) }
                .result()
                .map_err(QuarryError::from)?;
            unsafe { output.assume_init() }
        };

        Ok(Pool {
            handle,
            device: DeviceOwnedDebugWrapper(device),
            id: Self::next_id(),
            flags,
            queue_family_index,
            epoch: Cell::new(0),
            live: RefCell::new(HashSet::default()),
            destroyed: Cell::new(false),
        })
    }

    /// Returns the flags that the pool was created with.
    #[inline]
    pub fn flags(&self) -> PoolCreateFlags {
        self.flags
    }

    /// Returns the queue family on which buffers of this pool can be submitted.
    #[inline]
    pub fn queue_family_index(&self) -> u32 {
        self.queue_family_index
    }

    /// Returns the number of buffers currently carved from this pool.
    #[inline]
    pub fn live_buffers(&self) -> usize {
        self.live.borrow().len()
    }

    /// Resets the pool, which invalidates all the buffers that were allocated from it.
    ///
    /// The pool itself stays usable; only the outstanding buffers are returned to it. With
    /// [`PoolResetFlags::RELEASE_RESOURCES`], the backing memory is returned to the system
    /// instead of being retained for reuse.
    #[inline]
    pub fn reset(&self, flags: PoolResetFlags) -> Result<(), Validated<QuarryError>> {
        self.validate_reset(flags)?;

        Ok(unsafe { self.reset_unchecked(flags) }?)
    }

    fn validate_reset(&self, _flags: PoolResetFlags) -> Result<(), Box<ValidationError>> {
        self.validate_usable()?;

        Ok(())
    }

    #[cfg_attr(not(feature = "document_unchecked"), doc(hidden))]
    pub unsafe fn reset_unchecked(&self, flags: PoolResetFlags) -> Result<(), QuarryError> {
        let driver = self.device.driver();
        unsafe { driver.reset_pool(self.device.handle(), self.handle, flags.into()) }
            .result()
            .map_err(QuarryError::from)?;

        self.epoch.set(self.epoch.get() + 1);
        self.live.borrow_mut().clear();

        Ok(())
    }

    /// Allocates buffers from the pool, in one batch.
    ///
    /// Every returned buffer is in its initial state. The batch is all-or-nothing: if the
    /// driver fails partway through, whatever it did produce is released again and the pool is
    /// left exactly as it was before the call. Requesting zero buffers returns an empty vec
    /// without calling into the driver.
    pub fn allocate_buffers(
        &self,
        allocate_info: BufferAllocateInfo,
    ) -> Result<Vec<PoolAlloc>, Validated<QuarryError>> {
        self.validate_usable()?;

        let BufferAllocateInfo {
            level,
            buffer_count,
            _ne: _,
        } = allocate_info;

        let handles = if buffer_count == 0 {
            vec![]
        } else {
            let allocate_info_raw = ffi::BufferAllocateInfo {
                stype: ffi::StructureType::BUFFER_ALLOCATE_INFO,
                next: ptr::null(),
                pool: self.handle,
                level: level.into(),
                buffer_count,
            };

            let driver = self.device.driver();
            // Zero-initialized so that a failed call can tell which prefix of the batch the
            // driver actually produced.
            let mut handles = vec![ffi::BufferHandle::null(); buffer_count as usize];
            let result = unsafe {
                driver.allocate_buffers(
                    self.device.handle(),
                    &allocate_info_raw,
                    handles.as_mut_ptr(),
                )
            };

            if let Err(code) = result.result() {
                let produced: SmallVec<[_; 4]> = handles
                    .iter()
                    .copied()
                    .filter(|handle| !handle.is_null())
                    .collect();

                if !produced.is_empty() {
                    unsafe {
                        driver.free_buffers(
                            self.device.handle(),
                            self.handle,
                            produced.len() as u32,
                            produced.as_ptr(),
                        )
                    };
                }

                return Err(QuarryError::from(code).into());
            }

            handles
        };

        let epoch = self.epoch.get();
        let mut live = self.live.borrow_mut();

        Ok(handles
            .into_iter()
            .map(|handle| {
                let alloc = PoolAlloc {
                    handle,
                    device: self.device.clone(),
                    id: PoolAlloc::next_id(),
                    pool_id: self.id,
                    epoch,
                    level,
                };
                live.insert(alloc.id);
                alloc
            })
            .collect())
    }

    /// Frees individual buffers back to the pool.
    ///
    /// The pool must have been created with [`PoolCreateFlags::RESET_BUFFER`]; pools created
    /// without it can only reclaim their buffers wholesale, through [`reset`](Self::reset) or
    /// destruction. Every buffer must have been allocated from this pool and must not have been
    /// invalidated by a reset.
    pub fn free_buffers(
        &self,
        buffers: impl IntoIterator<Item = PoolAlloc>,
    ) -> Result<(), Box<ValidationError>> {
        let buffers: SmallVec<[PoolAlloc; 4]> = buffers.into_iter().collect();
        self.validate_free_buffers(&buffers)?;

        unsafe { self.free_buffers_unchecked(buffers) };
        Ok(())
    }

    fn validate_free_buffers(&self, buffers: &[PoolAlloc]) -> Result<(), Box<ValidationError>> {
        self.validate_usable()?;

        if !buffers.is_empty() && !self.flags.intersects(PoolCreateFlags::RESET_BUFFER) {
            return Err(Box::new(ValidationError {
                context: "self.flags()".into(),
                problem: "does not contain `PoolCreateFlags::RESET_BUFFER`, so buffers cannot \
                    be freed individually"
                    .into(),
                ..Default::default()
            }));
        }

        for (index, buffer) in buffers.iter().enumerate() {
            if buffer.pool_id != self.id {
                return Err(Box::new(ValidationError {
                    context: format!("buffers[{}]", index).into(),
                    problem: "was not allocated from this pool".into(),
                    ..Default::default()
                }));
            }

            if buffer.epoch != self.epoch.get() {
                return Err(Box::new(ValidationError {
                    context: format!("buffers[{}]", index).into(),
                    problem: "was invalidated by a reset of the pool".into(),
                    ..Default::default()
                }));
            }
        }

        Ok(())
    }

    #[cfg_attr(not(feature = "document_unchecked"), doc(hidden))]
    pub unsafe fn free_buffers_unchecked(&self, buffers: impl IntoIterator<Item = PoolAlloc>) {
        let buffers: SmallVec<[PoolAlloc; 4]> = buffers.into_iter().collect();

        if buffers.is_empty() {
            return;
        }

        {
            let mut live = self.live.borrow_mut();
            for buffer in &buffers {
                let removed = live.remove(&buffer.id);
                debug_assert!(removed, "buffer was not in the pool's live set");
            }
        }

        let handles: SmallVec<[_; 4]> = buffers.iter().map(|buffer| buffer.handle).collect();

        let driver = self.device.driver();
        unsafe {
            driver.free_buffers(
                self.device.handle(),
                self.handle,
                handles.len() as u32,
                handles.as_ptr(),
            )
        };
    }

    /// Destroys the pool, invalidating every buffer still carved from it.
    ///
    /// The buffers do not need to be freed first. Destruction happens exactly once: it is also
    /// performed automatically when the pool is dropped, and calling any operation on the pool
    /// (or on its buffers, through it) after an explicit `destroy` is a usage error.
    pub fn destroy(&self) -> Result<(), Box<ValidationError>> {
        self.validate_usable()?;

        let driver = self.device.driver();
        unsafe { driver.destroy_pool(self.device.handle(), self.handle) };

        self.destroyed.set(true);
        self.live.borrow_mut().clear();

        Ok(())
    }

    fn validate_usable(&self) -> Result<(), Box<ValidationError>> {
        if self.destroyed.get() {
            return Err(Box::new(ValidationError {
                context: "self".into(),
                problem: "the pool has already been destroyed".into(),
                ..Default::default()
            }));
        }

        Ok(())
    }
}

impl Drop for Pool {
    #[inline]
    fn drop(&mut self) {
        if !self.destroyed.get() {
            let driver = self.device.driver();
            unsafe { driver.destroy_pool(self.device.handle(), self.handle) };
        }
    }
}

unsafe impl QuarryObject for Pool {
    type Handle = ffi::PoolHandle;

    #[inline]
    fn handle(&self) -> Self::Handle {
        self.handle
    }
}

unsafe impl DeviceOwned for Pool {
    #[inline]
    fn device(&self) -> &Arc<Device> {
        &self.device
    }
}

impl_id_counter!(Pool);

/// Parameters to create a `Pool`.
#[derive(Clone, Debug)]
pub struct PoolCreateInfo {
    /// Additional properties of the pool.
    ///
    /// The default value is empty.
    pub flags: PoolCreateFlags,

    /// The index of the queue family that this pool is created for. All buffers allocated from
    /// the pool must be submitted on queues of that family.
    ///
    /// The default value is `u32::MAX`, which must be overridden.
    pub queue_family_index: u32,

    pub _ne: crate::NonExhaustive,
}

impl Default for PoolCreateInfo {
    #[inline]
    fn default() -> Self {
        Self {
            flags: PoolCreateFlags::empty(),
            queue_family_index: u32::MAX,
            _ne: crate::NonExhaustive(()),
        }
    }
}

impl PoolCreateInfo {
    pub(crate) fn validate(&self, device: &Device) -> Result<(), Box<ValidationError>> {
        let &Self {
            flags: _,
            queue_family_index,
            _ne: _,
        } = self;

        if queue_family_index >= device.physical_device().queue_family_properties().len() as u32 {
            return Err(Box::new(ValidationError {
                context: "queue_family_index".into(),
                problem: "is not less than the number of queue families in the physical device"
                    .into(),
                ..Default::default()
            }));
        }

        Ok(())
    }
}

driver_bitflags! {
    /// Additional properties of a pool.
    PoolCreateFlags = (u32);

    /// A hint to the driver that the buffers allocated from the pool will be short-lived.
    TRANSIENT = POOL_CREATE_TRANSIENT,

    /// Buffers allocated from the pool can be freed and recycled individually.
    RESET_BUFFER = POOL_CREATE_RESET_BUFFER,
}

driver_bitflags! {
    /// Additional properties of a pool reset operation.
    PoolResetFlags = (u32);

    /// Return the backing memory of the pool to the system, instead of retaining it for the
    /// next allocations.
    RELEASE_RESOURCES = POOL_RESET_RELEASE_RESOURCES,
}

/// Parameters to allocate a batch of buffers from a pool.
#[derive(Clone, Debug)]
pub struct BufferAllocateInfo {
    /// The level of buffer to allocate.
    ///
    /// The default value is [`BufferLevel::Primary`].
    pub level: BufferLevel,

    /// The number of buffers to allocate.
    ///
    /// The default value is `1`.
    pub buffer_count: u32,

    pub _ne: crate::NonExhaustive,
}

impl Default for BufferAllocateInfo {
    #[inline]
    fn default() -> Self {
        Self {
            level: BufferLevel::Primary,
            buffer_count: 1,
            _ne: crate::NonExhaustive(()),
        }
    }
}

/// The level of a buffer allocated from a pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum BufferLevel {
    /// The buffer can be submitted on a queue directly.
    Primary = ffi::BUFFER_LEVEL_PRIMARY,
    /// The buffer can only be consumed from within a primary buffer.
    Secondary = ffi::BUFFER_LEVEL_SECONDARY,
}

impl From<BufferLevel> for u32 {
    #[inline]
    fn from(val: BufferLevel) -> Self {
        val as u32
    }
}

/// Opaque type that represents a buffer allocated from a pool.
///
/// The buffer does not own anything: its validity is bounded by the pool it was carved from,
/// and every operation on it goes through that pool. It cannot be freed twice, because freeing
/// consumes it.
#[derive(Debug)]
pub struct PoolAlloc {
    handle: ffi::BufferHandle,
    device: DeviceOwnedDebugWrapper<Arc<Device>>,
    id: NonZero<u64>,

    pool_id: NonZero<u64>,
    epoch: u64,
    level: BufferLevel,
}

impl PoolAlloc {
    /// Returns the level of the buffer.
    #[inline]
    pub fn level(&self) -> BufferLevel {
        self.level
    }
}

unsafe impl QuarryObject for PoolAlloc {
    type Handle = ffi::BufferHandle;

    #[inline]
    fn handle(&self) -> Self::Handle {
        self.handle
    }
}

unsafe impl DeviceOwned for PoolAlloc {
    #[inline]
    fn device(&self) -> &Arc<Device> {
        &self.device
    }
}

impl_id_counter!(PoolAlloc);
