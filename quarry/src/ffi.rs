//! Raw ABI shared with the native driver.
//!
//! Everything in this module mirrors the driver's C interface exactly: opaque handles, packed
//! result codes, `#[repr(C)]` parameter structures and the entry point signatures. Nothing here
//! validates anything; the safe wrappers in the rest of the crate are built on top of these
//! definitions.

use bytemuck::{Pod, Zeroable};
use std::{
    ffi::{c_char, c_void},
    fmt::{Debug, Error as FmtError, Formatter},
};

/// Maximum length, in bytes, of an extension name, including the terminating nul.
pub const MAX_EXTENSION_NAME_SIZE: usize = 64;
/// Maximum length, in bytes, of a device name, including the terminating nul.
pub const MAX_DEVICE_NAME_SIZE: usize = 256;

macro_rules! driver_handles {
    ($($(#[doc = $doc:literal])* $name:ident,)+) => {
        $(
            $(#[doc = $doc])*
            ///
            /// This is an opaque 64-bit identity assigned by the driver. The only operations
            /// defined on it directly are equality comparison and the null check.
            #[repr(transparent)]
            #[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Pod, Zeroable)]
            pub struct $name(u64);

            impl $name {
                /// The null handle.
                #[inline]
                pub const fn null() -> Self {
                    Self(0)
                }

                #[inline]
                pub const fn from_raw(raw: u64) -> Self {
                    Self(raw)
                }

                #[inline]
                pub const fn as_raw(self) -> u64 {
                    self.0
                }

                #[inline]
                pub const fn is_null(self) -> bool {
                    self.0 == 0
                }
            }

            impl Debug for $name {
                fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
                    write!(f, concat!(stringify!($name), "({:#x})"), self.0)
                }
            }
        )+
    };
}

driver_handles! {
    /// Handle to a physical device reported by the driver.
    PhysicalDeviceHandle,
    /// Handle to an opened device.
    DeviceHandle,
    /// Handle to a buffer pool.
    PoolHandle,
    /// Handle to a buffer allocated from a pool.
    BufferHandle,
    /// Handle to a device memory allocation.
    MemoryHandle,
}

/// Status code returned by driver entry points.
///
/// Zero is success, positive values are non-error statuses and negative values are errors.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResultCode(i32);

impl ResultCode {
    pub const SUCCESS: Self = Self(0);
    /// A variable-length read returned fewer elements than the driver-side table holds.
    pub const INCOMPLETE: Self = Self(1);
    pub const ERROR_OUT_OF_HOST_MEMORY: Self = Self(-1);
    pub const ERROR_OUT_OF_DEVICE_MEMORY: Self = Self(-2);
    pub const ERROR_OUT_OF_POOL_MEMORY: Self = Self(-3);
    pub const ERROR_DEVICE_LOST: Self = Self(-4);
    pub const ERROR_INITIALIZATION_FAILED: Self = Self(-5);
    pub const ERROR_EXTENSION_NOT_PRESENT: Self = Self(-6);
    pub const ERROR_FEATURE_NOT_PRESENT: Self = Self(-7);

    #[inline]
    pub const fn from_raw(raw: i32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_raw(self) -> i32 {
        self.0
    }

    /// Returns whether the code is an error.
    #[inline]
    pub const fn is_error(self) -> bool {
        self.0 < 0
    }

    /// Converts the code into a `Result`, with anything other than [`SUCCESS`] as the error.
    ///
    /// [`SUCCESS`]: Self::SUCCESS
    #[inline]
    pub fn result(self) -> Result<(), ResultCode> {
        match self {
            Self::SUCCESS => Ok(()),
            err => Err(err),
        }
    }
}

impl Debug for ResultCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        let name = match *self {
            Self::SUCCESS => "SUCCESS",
            Self::INCOMPLETE => "INCOMPLETE",
            Self::ERROR_OUT_OF_HOST_MEMORY => "ERROR_OUT_OF_HOST_MEMORY",
            Self::ERROR_OUT_OF_DEVICE_MEMORY => "ERROR_OUT_OF_DEVICE_MEMORY",
            Self::ERROR_OUT_OF_POOL_MEMORY => "ERROR_OUT_OF_POOL_MEMORY",
            Self::ERROR_DEVICE_LOST => "ERROR_DEVICE_LOST",
            Self::ERROR_INITIALIZATION_FAILED => "ERROR_INITIALIZATION_FAILED",
            Self::ERROR_EXTENSION_NOT_PRESENT => "ERROR_EXTENSION_NOT_PRESENT",
            Self::ERROR_FEATURE_NOT_PRESENT => "ERROR_FEATURE_NOT_PRESENT",
            Self(raw) => return write!(f, "ResultCode({})", raw),
        };

        f.write_str(name)
    }
}

/// Tag identifying the layout of an extensible parameter structure.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StructureType(i32);

impl StructureType {
    pub const DEVICE_CREATE_INFO: Self = Self(1);
    pub const POOL_CREATE_INFO: Self = Self(2);
    pub const BUFFER_ALLOCATE_INFO: Self = Self(3);
    pub const MEMORY_ALLOCATE_INFO: Self = Self(4);
}

// Pool creation flag bits.
pub const POOL_CREATE_TRANSIENT: u32 = 1 << 0;
pub const POOL_CREATE_RESET_BUFFER: u32 = 1 << 1;

// Pool reset flag bits.
pub const POOL_RESET_RELEASE_RESOURCES: u32 = 1 << 0;

// Buffer levels.
pub const BUFFER_LEVEL_PRIMARY: u32 = 0;
pub const BUFFER_LEVEL_SECONDARY: u32 = 1;

// Queue capability flag bits.
pub const QUEUE_COMPUTE: u32 = 1 << 0;
pub const QUEUE_TRANSFER: u32 = 1 << 1;

// External memory handle type bits.
pub const MEMORY_HANDLE_TYPE_OPAQUE_FD: u32 = 1 << 0;

// Device type values reported in `Properties::device_type`.
pub const DEVICE_TYPE_OTHER: u32 = 0;
pub const DEVICE_TYPE_INTEGRATED: u32 = 1;
pub const DEVICE_TYPE_DISCRETE: u32 = 2;
pub const DEVICE_TYPE_VIRTUAL: u32 = 3;
pub const DEVICE_TYPE_CPU: u32 = 4;

/// Properties reported for a physical device.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct Properties {
    pub api_version: u32,
    pub driver_version: u32,
    pub device_id: u32,
    pub device_type: u32,
    pub device_name: [u8; MAX_DEVICE_NAME_SIZE],
}

/// Properties of one queue family of a physical device.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct QueueFamilyProperties {
    pub queue_flags: u32,
    pub queue_count: u32,
}

/// Properties of one extension in the driver's extension catalog.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct ExtensionProperties {
    pub extension_name: [u8; MAX_EXTENSION_NAME_SIZE],
    pub spec_version: u32,
}

/// A two-dimensional offset.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct Offset2D {
    pub x: i32,
    pub y: i32,
}

/// A two-dimensional extent.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct Extent2D {
    pub width: u32,
    pub height: u32,
}

/// A two-dimensional axis-aligned rectangle.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct Rect2D {
    pub offset: Offset2D,
    pub extent: Extent2D,
}

/// Parameters of `qryCreateDevice`.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct DeviceCreateInfo {
    pub stype: StructureType,
    pub next: *const c_void,
    pub enabled_extension_count: u32,
    pub enabled_extension_names: *const *const c_char,
}

/// Parameters of `qryCreatePool`.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct PoolCreateInfo {
    pub stype: StructureType,
    pub next: *const c_void,
    pub flags: u32,
    pub queue_family_index: u32,
}

/// Parameters of `qryAllocateBuffers`.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct BufferAllocateInfo {
    pub stype: StructureType,
    pub next: *const c_void,
    pub pool: PoolHandle,
    pub level: u32,
    pub buffer_count: u32,
}

/// Parameters of `qryAllocateMemory`.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct MemoryAllocateInfo {
    pub stype: StructureType,
    pub next: *const c_void,
    pub allocation_size: u64,
    pub memory_type_index: u32,
    pub export_handle_types: u32,
}

pub type PfnEnumerateDevices =
    unsafe extern "system" fn(*mut u32, *mut PhysicalDeviceHandle) -> ResultCode;
pub type PfnGetDeviceProperties =
    unsafe extern "system" fn(PhysicalDeviceHandle, *mut Properties) -> ResultCode;
pub type PfnGetDeviceQueueFamilies =
    unsafe extern "system" fn(PhysicalDeviceHandle, *mut u32, *mut QueueFamilyProperties) -> ResultCode;
pub type PfnGetPresentRects =
    unsafe extern "system" fn(PhysicalDeviceHandle, *mut u32, *mut Rect2D) -> ResultCode;
pub type PfnCreateDevice = unsafe extern "system" fn(
    PhysicalDeviceHandle,
    *const DeviceCreateInfo,
    *mut DeviceHandle,
) -> ResultCode;
pub type PfnDestroyDevice = unsafe extern "system" fn(DeviceHandle);
pub type PfnCreatePool =
    unsafe extern "system" fn(DeviceHandle, *const PoolCreateInfo, *mut PoolHandle) -> ResultCode;
pub type PfnDestroyPool = unsafe extern "system" fn(DeviceHandle, PoolHandle);
pub type PfnResetPool = unsafe extern "system" fn(DeviceHandle, PoolHandle, u32) -> ResultCode;
pub type PfnAllocateBuffers = unsafe extern "system" fn(
    DeviceHandle,
    *const BufferAllocateInfo,
    *mut BufferHandle,
) -> ResultCode;
pub type PfnFreeBuffers =
    unsafe extern "system" fn(DeviceHandle, PoolHandle, u32, *const BufferHandle);
pub type PfnAllocateMemory = unsafe extern "system" fn(
    DeviceHandle,
    *const MemoryAllocateInfo,
    *mut MemoryHandle,
) -> ResultCode;
pub type PfnFreeMemory = unsafe extern "system" fn(DeviceHandle, MemoryHandle);
pub type PfnGetMemoryFd =
    unsafe extern "system" fn(DeviceHandle, MemoryHandle, u32, *mut i32) -> ResultCode;
pub type PfnEnumerateExtensions =
    unsafe extern "system" fn(*mut u32, *mut ExtensionProperties) -> ResultCode;
pub type PfnGetDriverVersion = unsafe extern "system" fn(*mut u32) -> ResultCode;

#[cfg(test)]
mod tests {
    use super::{BufferHandle, PoolHandle, ResultCode};

    #[test]
    fn handle_null() {
        assert!(PoolHandle::null().is_null());
        assert!(!PoolHandle::from_raw(7).is_null());
        assert_eq!(BufferHandle::from_raw(7).as_raw(), 7);
    }

    #[test]
    fn result_code_classification() {
        assert!(ResultCode::SUCCESS.result().is_ok());
        assert!(!ResultCode::INCOMPLETE.is_error());
        assert!(ResultCode::INCOMPLETE.result().is_err());
        assert!(ResultCode::ERROR_DEVICE_LOST.is_error());
    }
}
