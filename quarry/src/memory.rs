//! Raw device memory allocation.
//!
//! A `DeviceMemory` is a block of memory allocated directly from the driver. It is not carved
//! from a pool: each allocation is its own driver object, released when the value is dropped.
//! When the [`EXT_MEMORY_EXPORT`] extension is enabled on the device, an allocation can be
//! exported through a POSIX file descriptor and imported by another process.

use crate::{
    device::{Device, DeviceOwned, DeviceOwnedDebugWrapper},
    extensions::EXT_MEMORY_EXPORT,
    ffi,
    macros::{driver_bitflags, impl_id_counter},
    DeviceSize, QuarryError, QuarryObject, Requires, RequiresAllOf, RequiresOneOf, Validated,
    ValidationError,
};
use std::{mem::MaybeUninit, num::NonZero, ptr, sync::Arc};

/// Represents a block of memory allocated from the driver.
#[derive(Debug)]
pub struct DeviceMemory {
    handle: ffi::MemoryHandle,
    device: DeviceOwnedDebugWrapper<Arc<Device>>,
    id: NonZero<u64>,

    allocation_size: DeviceSize,
    memory_type_index: u32,
    export_handle_types: ExternalMemoryHandleTypes,
}

impl DeviceMemory {
    /// Allocates a new block of memory.
    pub fn allocate(
        device: Arc<Device>,
        allocate_info: MemoryAllocateInfo,
    ) -> Result<DeviceMemory, Validated<QuarryError>> {
        Self::validate_allocate(&device, &allocate_info)?;

        Ok(unsafe { Self::allocate_unchecked(device, allocate_info) }?)
    }

    fn validate_allocate(
        device: &Device,
        allocate_info: &MemoryAllocateInfo,
    ) -> Result<(), Box<ValidationError>> {
        allocate_info
            .validate(device)
            .map_err(|err| err.add_context("allocate_info"))?;

        Ok(())
    }

    #[cfg_attr(not(feature = "document_unchecked"), doc(hidden))]
    pub unsafe fn allocate_unchecked(
        device: Arc<Device>,
        allocate_info: MemoryAllocateInfo,
    ) -> Result<DeviceMemory, QuarryError> {
        let MemoryAllocateInfo {
            allocation_size,
            memory_type_index,
            export_handle_types,
            _ne: _,
        } = allocate_info;

        let allocate_info_raw = ffi::MemoryAllocateInfo {
            stype: ffi::StructureType::MEMORY_ALLOCATE_INFO,
            next: ptr::null(),
            allocation_size,
            memory_type_index,
            export_handle_types: export_handle_types.into(),
        };

        let handle = {
            let driver = device.driver();
            let mut output = MaybeUninit::uninit();
            unsafe {
                driver.allocate_memory(device.handle(), &allocate_info_raw, output.as_mut_ptr())
            }
            .result()
            .map_err(QuarryError::from)?;
            unsafe { output.assume_init() }
        };

        Ok(DeviceMemory {
            handle,
            device: DeviceOwnedDebugWrapper(device),
            id: Self::next_id(),
            allocation_size,
            memory_type_index,
            export_handle_types,
        })
    }

    /// Returns the size of the allocation in bytes.
    #[inline]
    pub fn allocation_size(&self) -> DeviceSize {
        self.allocation_size
    }

    /// Returns the index of the memory type the memory was allocated from.
    #[inline]
    pub fn memory_type_index(&self) -> u32 {
        self.memory_type_index
    }

    /// Returns the handle types the allocation can be exported through.
    #[inline]
    pub fn export_handle_types(&self) -> ExternalMemoryHandleTypes {
        self.export_handle_types
    }

    /// Exports the memory through a POSIX file descriptor.
    ///
    /// The returned file owns the descriptor. The device must have the [`EXT_MEMORY_EXPORT`]
    /// extension enabled, and the memory must have been allocated with `handle_type` in its
    /// [`export_handle_types`](MemoryAllocateInfo::export_handle_types).
    #[cfg(unix)]
    pub fn export_fd(
        &self,
        handle_type: ExternalMemoryHandleTypes,
    ) -> Result<std::fs::File, Validated<QuarryError>> {
        self.validate_export_fd(handle_type)?;

        Ok(unsafe { self.export_fd_unchecked(handle_type) }?)
    }

    #[cfg(unix)]
    fn validate_export_fd(
        &self,
        handle_type: ExternalMemoryHandleTypes,
    ) -> Result<(), Box<ValidationError>> {
        if !self.device.enabled_extensions().ext_memory_export {
            return Err(Box::new(ValidationError {
                problem: "`export_fd` was called".into(),
                requires_one_of: RequiresOneOf(&[RequiresAllOf(&[Requires::DriverExtension(
                    EXT_MEMORY_EXPORT,
                )])]),
                ..Default::default()
            }));
        }

        if handle_type.count() != 1 {
            return Err(Box::new(ValidationError {
                context: "handle_type".into(),
                problem: "must have exactly one handle type set".into(),
                ..Default::default()
            }));
        }

        if !self.export_handle_types.contains(handle_type) {
            return Err(Box::new(ValidationError {
                context: "handle_type".into(),
                problem: "is not among the handle types the memory was allocated for export \
                    through"
                    .into(),
                ..Default::default()
            }));
        }

        Ok(())
    }

    #[cfg(unix)]
    #[cfg_attr(not(feature = "document_unchecked"), doc(hidden))]
    pub unsafe fn export_fd_unchecked(
        &self,
        handle_type: ExternalMemoryHandleTypes,
    ) -> Result<std::fs::File, QuarryError> {
        use std::os::fd::FromRawFd;

        let fd = {
            let driver = self.device.driver();
            let mut output = MaybeUninit::uninit();
            unsafe {
                driver.get_memory_fd(
                    self.device.handle(),
                    self.handle,
                    handle_type.into(),
                    output.as_mut_ptr(),
                )
            }
            .result()
            .map_err(QuarryError::from)?;
            unsafe { output.assume_init() }
        };

        // The driver transferred ownership of the descriptor to us.
        Ok(unsafe { std::fs::File::from_raw_fd(fd) })
    }
}

impl Drop for DeviceMemory {
    #[inline]
    fn drop(&mut self) {
        let driver = self.device.driver();
        unsafe { driver.free_memory(self.device.handle(), self.handle) };
    }
}

unsafe impl QuarryObject for DeviceMemory {
    type Handle = ffi::MemoryHandle;

    #[inline]
    fn handle(&self) -> Self::Handle {
        self.handle
    }
}

unsafe impl DeviceOwned for DeviceMemory {
    #[inline]
    fn device(&self) -> &Arc<Device> {
        &self.device
    }
}

impl_id_counter!(DeviceMemory);

/// Parameters to allocate a new `DeviceMemory`.
#[derive(Clone, Debug)]
pub struct MemoryAllocateInfo {
    /// The number of bytes to allocate.
    ///
    /// The default value is `0`, which must be overridden.
    pub allocation_size: DeviceSize,

    /// The index of the memory type to allocate from.
    ///
    /// The default value is `0`.
    pub memory_type_index: u32,

    /// The handle types that the allocation can later be exported through. Non-empty values
    /// require the [`EXT_MEMORY_EXPORT`] extension to be enabled on the device.
    ///
    /// The default value is empty.
    pub export_handle_types: ExternalMemoryHandleTypes,

    pub _ne: crate::NonExhaustive,
}

impl Default for MemoryAllocateInfo {
    #[inline]
    fn default() -> Self {
        Self {
            allocation_size: 0,
            memory_type_index: 0,
            export_handle_types: ExternalMemoryHandleTypes::empty(),
            _ne: crate::NonExhaustive(()),
        }
    }
}

impl MemoryAllocateInfo {
    pub(crate) fn validate(&self, device: &Device) -> Result<(), Box<ValidationError>> {
        let &Self {
            allocation_size,
            memory_type_index: _,
            export_handle_types,
            _ne: _,
        } = self;

        if allocation_size == 0 {
            return Err(Box::new(ValidationError {
                context: "allocation_size".into(),
                problem: "is zero".into(),
                ..Default::default()
            }));
        }

        if !export_handle_types.is_empty() && !device.enabled_extensions().ext_memory_export {
            return Err(Box::new(ValidationError {
                context: "export_handle_types".into(),
                problem: "is not empty".into(),
                requires_one_of: RequiresOneOf(&[RequiresAllOf(&[Requires::DriverExtension(
                    EXT_MEMORY_EXPORT,
                )])]),
                ..Default::default()
            }));
        }

        Ok(())
    }
}

driver_bitflags! {
    /// The types of external handle that a memory allocation can be exported through.
    ExternalMemoryHandleTypes = (u32);

    /// A POSIX file descriptor that carries no structure beyond referring to the allocation.
    OPAQUE_FD = MEMORY_HANDLE_TYPE_OPAQUE_FD,
}

#[cfg(test)]
mod tests {
    use super::{DeviceMemory, ExternalMemoryHandleTypes, MemoryAllocateInfo};
    use crate::{
        device::{Device, DeviceCreateInfo},
        library::QuarryLibrary,
        tests::MockDriver,
        Validated,
    };

    #[test]
    fn allocate_and_drop() {
        let (driver, device, _) = mock_driver_device_and_queue!();

        let memory = DeviceMemory::allocate(
            device,
            MemoryAllocateInfo {
                allocation_size: 1024,
                ..Default::default()
            },
        )
        .unwrap();

        assert_eq!(memory.allocation_size(), 1024);
        assert_eq!(driver.live_memories(), 1);

        drop(memory);
        assert_eq!(driver.live_memories(), 0);
    }

    #[test]
    fn zero_size_is_rejected() {
        let (device, _) = mock_device_and_queue!();

        match DeviceMemory::allocate(device, MemoryAllocateInfo::default()) {
            Err(Validated::ValidationError(_)) => (),
            _ => panic!(),
        }
    }

    #[test]
    fn export_requires_extension() {
        let library = QuarryLibrary::with_driver(MockDriver::new()).unwrap();
        let physical_device = library.enumerate_physical_devices().unwrap().remove(0);
        // The driver supports the extension, but the device does not enable it.
        let device = Device::new(physical_device, DeviceCreateInfo::default()).unwrap();

        match DeviceMemory::allocate(
            device,
            MemoryAllocateInfo {
                allocation_size: 64,
                export_handle_types: ExternalMemoryHandleTypes::OPAQUE_FD,
                ..Default::default()
            },
        ) {
            Err(Validated::ValidationError(_)) => (),
            _ => panic!(),
        }
    }

    #[cfg(unix)]
    #[test]
    fn export_fd_round_trip() {
        let (device, _) = mock_device_and_queue!();

        let memory = DeviceMemory::allocate(
            device,
            MemoryAllocateInfo {
                allocation_size: 64,
                export_handle_types: ExternalMemoryHandleTypes::OPAQUE_FD,
                ..Default::default()
            },
        )
        .unwrap();

        let file = memory.export_fd(ExternalMemoryHandleTypes::OPAQUE_FD).unwrap();
        // The descriptor must be live; a metadata query on a dead one would fail.
        assert!(file.metadata().is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn export_fd_needs_matching_allocation() {
        let (device, _) = mock_device_and_queue!();

        let memory = DeviceMemory::allocate(
            device,
            MemoryAllocateInfo {
                allocation_size: 64,
                ..Default::default()
            },
        )
        .unwrap();

        match memory.export_fd(ExternalMemoryHandleTypes::OPAQUE_FD) {
            Err(Validated::ValidationError(_)) => (),
            _ => panic!(),
        }
    }
}
