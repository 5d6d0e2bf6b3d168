//! Communication channel with a device.
//!
//! A `Device` is an opened physical device. Creating one chooses the extensions to enable on
//! it; almost every other object in this crate is created from a `Device` and keeps it alive.

use crate::{
    extensions::DriverExtensions,
    ffi,
    library::{Driver, QuarryLibrary},
    macros::impl_id_counter,
    physical::PhysicalDevice,
    QuarryError, QuarryObject, Validated, ValidationError,
};
use std::{
    ffi::{c_char, CString},
    fmt::{Debug, Error as FmtError, Formatter},
    mem::MaybeUninit,
    num::NonZero,
    ops::Deref,
    ptr,
    sync::Arc,
};

/// Represents an open channel of communication with a physical device.
#[derive(Debug)]
pub struct Device {
    handle: ffi::DeviceHandle,
    physical_device: Arc<PhysicalDevice>,
    id: NonZero<u64>,

    enabled_extensions: DriverExtensions,
}

impl Device {
    /// Opens `physical_device`.
    pub fn new(
        physical_device: Arc<PhysicalDevice>,
        create_info: DeviceCreateInfo,
    ) -> Result<Arc<Device>, Validated<QuarryError>> {
        Self::validate_new(&physical_device, &create_info)?;

        Ok(unsafe { Self::new_unchecked(physical_device, create_info) }?)
    }

    fn validate_new(
        physical_device: &PhysicalDevice,
        create_info: &DeviceCreateInfo,
    ) -> Result<(), Box<ValidationError>> {
        create_info
            .validate(physical_device)
            .map_err(|err| err.add_context("create_info"))?;

        Ok(())
    }

    #[cfg_attr(not(feature = "document_unchecked"), doc(hidden))]
    pub unsafe fn new_unchecked(
        physical_device: Arc<PhysicalDevice>,
        create_info: DeviceCreateInfo,
    ) -> Result<Arc<Device>, QuarryError> {
        let DeviceCreateInfo {
            enabled_extensions,
            _ne: _,
        } = create_info;

        let extension_names: Vec<CString> = enabled_extensions
            .names()
            .map(|name| CString::new(name).unwrap())
            .collect();
        let extension_name_ptrs: Vec<*const c_char> =
            extension_names.iter().map(|name| name.as_ptr()).collect();

        let create_info_raw = ffi::DeviceCreateInfo {
            stype: ffi::StructureType::DEVICE_CREATE_INFO,
            next: ptr::null(),
            enabled_extension_count: extension_name_ptrs.len() as u32,
            enabled_extension_names: if extension_name_ptrs.is_empty() {
                ptr::null()
            } else {
                extension_name_ptrs.as_ptr()
            },
        };

        let handle = {
            let driver = physical_device.library().driver();
            let mut output = MaybeUninit::uninit();
            unsafe {
                driver.create_device(physical_device.handle(), &create_info_raw, output.as_mut_ptr())
            }
            .result()
            .map_err(QuarryError::from)?;
            unsafe { output.assume_init() }
        };

        Ok(Arc::new(Device {
            handle,
            physical_device,
            id: Self::next_id(),
            enabled_extensions,
        }))
    }

    /// Returns the physical device the device was opened from.
    #[inline]
    pub fn physical_device(&self) -> &Arc<PhysicalDevice> {
        &self.physical_device
    }

    /// Returns the library the device belongs to.
    #[inline]
    pub fn library(&self) -> &Arc<QuarryLibrary> {
        self.physical_device.library()
    }

    /// Returns the extensions that were enabled when the device was opened.
    #[inline]
    pub fn enabled_extensions(&self) -> &DriverExtensions {
        &self.enabled_extensions
    }

    pub(crate) fn driver(&self) -> &dyn Driver {
        self.physical_device.library().driver()
    }
}

impl Drop for Device {
    #[inline]
    fn drop(&mut self) {
        unsafe { self.driver().destroy_device(self.handle) };
    }
}

unsafe impl QuarryObject for Device {
    type Handle = ffi::DeviceHandle;

    #[inline]
    fn handle(&self) -> Self::Handle {
        self.handle
    }
}

impl_id_counter!(Device);

/// Implemented on objects that belong to a device.
///
/// # Safety
///
/// `device` must return the device that actually owns `self`.
pub unsafe trait DeviceOwned {
    /// Returns the device that owns `self`.
    fn device(&self) -> &Arc<Device>;
}

unsafe impl<T> DeviceOwned for T
where
    T: Deref,
    T::Target: DeviceOwned,
{
    #[inline]
    fn device(&self) -> &Arc<Device> {
        (**self).device()
    }
}

/// Wraps a device-owned reference so that its `Debug` output stays at one line instead of
/// recursing into the whole object graph.
pub(crate) struct DeviceOwnedDebugWrapper<T>(pub(crate) T);

impl<T> Clone for DeviceOwnedDebugWrapper<Arc<T>> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T> Debug for DeviceOwnedDebugWrapper<Arc<T>>
where
    T: QuarryObject,
    T::Handle: Debug,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        write!(f, "{:?}", self.0.handle())
    }
}

impl<T> Deref for DeviceOwnedDebugWrapper<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Parameters to create a `Device`.
#[derive(Clone, Debug)]
pub struct DeviceCreateInfo {
    /// The extensions to enable on the device.
    ///
    /// Every extension must be supported by the driver. The default value is empty.
    pub enabled_extensions: DriverExtensions,

    pub _ne: crate::NonExhaustive,
}

impl Default for DeviceCreateInfo {
    #[inline]
    fn default() -> Self {
        Self {
            enabled_extensions: DriverExtensions::empty(),
            _ne: crate::NonExhaustive(()),
        }
    }
}

impl DeviceCreateInfo {
    pub(crate) fn validate(
        &self,
        physical_device: &PhysicalDevice,
    ) -> Result<(), Box<ValidationError>> {
        let &Self {
            ref enabled_extensions,
            _ne: _,
        } = self;

        let supported = physical_device.library().supported_extensions();

        if !supported.contains(enabled_extensions) {
            return Err(Box::new(ValidationError {
                context: "enabled_extensions".into(),
                problem: "contains extensions that are not supported by the driver".into(),
                ..Default::default()
            }));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{Device, DeviceCreateInfo};
    use crate::{
        extensions::DriverExtensions, library::QuarryLibrary, tests::MockDriver, Validated,
    };

    #[test]
    fn basic_create() {
        let driver = MockDriver::new();
        let library = QuarryLibrary::with_driver(driver.clone()).unwrap();
        let physical_device = library.enumerate_physical_devices().unwrap().remove(0);

        let device = Device::new(physical_device, DeviceCreateInfo::default()).unwrap();
        assert_eq!(driver.live_devices(), 1);

        drop(device);
        assert_eq!(driver.live_devices(), 0);
    }

    #[test]
    fn unsupported_extension() {
        let driver = MockDriver::new().with_extensions(DriverExtensions::empty());
        let library = QuarryLibrary::with_driver(driver).unwrap();
        let physical_device = library.enumerate_physical_devices().unwrap().remove(0);

        let result = Device::new(
            physical_device,
            DeviceCreateInfo {
                enabled_extensions: DriverExtensions {
                    ext_memory_export: true,
                    ..DriverExtensions::empty()
                },
                ..Default::default()
            },
        );

        match result {
            Err(Validated::ValidationError(_)) => (),
            _ => panic!("expected a validation error"),
        }
    }

    #[test]
    fn enabled_extensions_recorded() {
        let (device, _queue_family_index) = mock_device_and_queue!();

        assert!(device.enabled_extensions().ext_memory_export);
        assert!(device.enabled_extensions().ext_present_regions);
    }
}
