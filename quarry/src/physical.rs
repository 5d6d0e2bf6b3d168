//! Physical devices reported by the driver.
//!
//! A physical device represents one device the driver can open. The list of physical devices
//! and everything they report about themselves is read-only; to actually use one, create a
//! [`Device`](crate::device::Device) from it.

pub use crate::ffi::{Extent2D, Offset2D, Rect2D};
use crate::{
    extensions::{string_from_bytes, EXT_PRESENT_REGIONS},
    ffi,
    library::QuarryLibrary,
    macros::{driver_bitflags, impl_id_counter},
    probe, QuarryError, QuarryObject, Requires, RequiresAllOf, RequiresOneOf, Validated,
    ValidationError, Version,
};
use std::{mem::MaybeUninit, num::NonZero, sync::Arc};

/// Represents one of the available devices on this system.
#[derive(Debug)]
pub struct PhysicalDevice {
    handle: ffi::PhysicalDeviceHandle,
    library: Arc<QuarryLibrary>,
    id: NonZero<u64>,

    properties: Properties,
    queue_family_properties: Vec<QueueFamilyProperties>,
}

pub(crate) fn init_physical_devices(
    library: &Arc<QuarryLibrary>,
) -> Result<Vec<Arc<PhysicalDevice>>, QuarryError> {
    let driver = library.driver();

    let handles =
        probe::read_to_vec(|count, out| unsafe { driver.enumerate_devices(count, out) })?;

    handles
        .into_iter()
        .map(|handle| PhysicalDevice::from_handle(library.clone(), handle).map(Arc::new))
        .collect()
}

impl PhysicalDevice {
    /// Creates a `PhysicalDevice` from a raw handle, fetching everything it reports about
    /// itself.
    pub(crate) fn from_handle(
        library: Arc<QuarryLibrary>,
        handle: ffi::PhysicalDeviceHandle,
    ) -> Result<Self, QuarryError> {
        let driver = library.driver();

        let properties_raw = {
            let mut output = MaybeUninit::uninit();
            unsafe { driver.get_device_properties(handle, output.as_mut_ptr()) }
                .result()
                .map_err(QuarryError::from)?;
            unsafe { output.assume_init() }
        };

        let queue_family_properties =
            probe::read_to_vec(|count, out| unsafe {
                driver.get_device_queue_families(handle, count, out)
            })?
            .into_iter()
            .map(Into::into)
            .collect();

        Ok(PhysicalDevice {
            handle,
            library,
            id: Self::next_id(),
            properties: properties_raw.into(),
            queue_family_properties,
        })
    }

    /// Returns the library the physical device belongs to.
    #[inline]
    pub fn library(&self) -> &Arc<QuarryLibrary> {
        &self.library
    }

    /// Returns the properties the driver reports for this device.
    #[inline]
    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    /// Returns the version of the driver interface this device supports.
    #[inline]
    pub fn api_version(&self) -> Version {
        self.properties.api_version
    }

    /// Returns the properties of the queue families of this device.
    #[inline]
    pub fn queue_family_properties(&self) -> &[QueueFamilyProperties] {
        &self.queue_family_properties
    }

    /// Returns the rectangles of the device's presentable regions.
    ///
    /// The regions are a live, device-side table; the returned list is a snapshot of it. The
    /// driver must support the [`EXT_PRESENT_REGIONS`] extension.
    #[inline]
    pub fn present_rectangles(&self) -> Result<Vec<Rect2D>, Validated<QuarryError>> {
        self.validate_present_rectangles()?;

        Ok(self.present_rectangles_unchecked()?)
    }

    fn validate_present_rectangles(&self) -> Result<(), Box<ValidationError>> {
        if !self.library.supported_extensions().ext_present_regions {
            return Err(Box::new(ValidationError {
                problem: "`present_rectangles` was called".into(),
                requires_one_of: RequiresOneOf(&[RequiresAllOf(&[Requires::DriverExtension(
                    EXT_PRESENT_REGIONS,
                )])]),
                ..Default::default()
            }));
        }

        Ok(())
    }

    #[cfg_attr(not(feature = "document_unchecked"), doc(hidden))]
    pub fn present_rectangles_unchecked(&self) -> Result<Vec<Rect2D>, QuarryError> {
        let driver = self.library.driver();

        probe::read_to_vec(|count, out| unsafe {
            driver.get_present_rects(self.handle, count, out)
        })
    }
}

unsafe impl QuarryObject for PhysicalDevice {
    type Handle = ffi::PhysicalDeviceHandle;

    #[inline]
    fn handle(&self) -> Self::Handle {
        self.handle
    }
}

impl_id_counter!(PhysicalDevice);

/// The properties of a physical device.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct Properties {
    /// The version of the driver interface the device supports.
    pub api_version: Version,
    /// The version of the device's driver build.
    pub driver_version: u32,
    /// An identifier for the device model.
    pub device_id: u32,
    /// The kind of hardware the device is.
    pub device_type: DeviceType,
    /// A human readable name for the device.
    pub device_name: String,
}

impl From<ffi::Properties> for Properties {
    fn from(val: ffi::Properties) -> Self {
        Self {
            api_version: Version::from(val.api_version),
            driver_version: val.driver_version,
            device_id: val.device_id,
            device_type: DeviceType::try_from(val.device_type).unwrap_or(DeviceType::Other),
            device_name: string_from_bytes(&val.device_name),
        }
    }
}

/// The kind of hardware a physical device is.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
#[repr(u32)]
pub enum DeviceType {
    /// The device does not match any other available type.
    Other = ffi::DEVICE_TYPE_OTHER,
    /// The device is typically one embedded in or tightly coupled with the host.
    IntegratedGpu = ffi::DEVICE_TYPE_INTEGRATED,
    /// The device is typically a separate processor connected to the host.
    DiscreteGpu = ffi::DEVICE_TYPE_DISCRETE,
    /// The device is typically a virtual node in a virtualization environment.
    VirtualGpu = ffi::DEVICE_TYPE_VIRTUAL,
    /// The device is running on the same processors as the host.
    Cpu = ffi::DEVICE_TYPE_CPU,
}

impl TryFrom<u32> for DeviceType {
    type Error = ();

    #[inline]
    fn try_from(val: u32) -> Result<Self, Self::Error> {
        match val {
            ffi::DEVICE_TYPE_OTHER => Ok(Self::Other),
            ffi::DEVICE_TYPE_INTEGRATED => Ok(Self::IntegratedGpu),
            ffi::DEVICE_TYPE_DISCRETE => Ok(Self::DiscreteGpu),
            ffi::DEVICE_TYPE_VIRTUAL => Ok(Self::VirtualGpu),
            ffi::DEVICE_TYPE_CPU => Ok(Self::Cpu),
            _ => Err(()),
        }
    }
}

/// Properties of one queue family of a physical device.
#[derive(Clone, Copy, Debug)]
#[non_exhaustive]
pub struct QueueFamilyProperties {
    /// The capabilities of queues in this family.
    pub queue_flags: QueueFlags,
    /// The number of queues the family contains.
    pub queue_count: u32,
}

impl From<ffi::QueueFamilyProperties> for QueueFamilyProperties {
    #[inline]
    fn from(val: ffi::QueueFamilyProperties) -> Self {
        Self {
            queue_flags: val.queue_flags.into(),
            queue_count: val.queue_count,
        }
    }
}

driver_bitflags! {
    /// The capabilities of the queues in a queue family.
    QueueFlags = (u32);

    /// Queues of this family can execute compute work.
    COMPUTE = QUEUE_COMPUTE,

    /// Queues of this family can execute transfer work.
    TRANSFER = QUEUE_TRANSFER,
}

#[cfg(test)]
mod tests {
    use super::DeviceType;
    use crate::{
        extensions::DriverExtensions, ffi, library::QuarryLibrary, tests::MockDriver, Validated,
    };

    #[test]
    fn enumerate() {
        let library = QuarryLibrary::with_driver(MockDriver::new()).unwrap();
        let physical_devices = library.enumerate_physical_devices().unwrap();

        assert_eq!(physical_devices.len(), 1);

        let physical_device = &physical_devices[0];
        assert_eq!(physical_device.properties().device_name, "Mock Device");
        assert_eq!(physical_device.properties().device_type, DeviceType::DiscreteGpu);
        assert_eq!(physical_device.queue_family_properties().len(), 2);
    }

    #[test]
    fn present_rectangles() {
        let rects = vec![
            ffi::Rect2D {
                offset: ffi::Offset2D { x: 0, y: 0 },
                extent: ffi::Extent2D {
                    width: 800,
                    height: 600,
                },
            },
            ffi::Rect2D {
                offset: ffi::Offset2D { x: 800, y: 0 },
                extent: ffi::Extent2D {
                    width: 1024,
                    height: 768,
                },
            },
        ];

        let library =
            QuarryLibrary::with_driver(MockDriver::new().with_present_rects(rects.clone()))
                .unwrap();
        let physical_device = &library.enumerate_physical_devices().unwrap()[0];

        assert_eq!(physical_device.present_rectangles().unwrap(), rects);
    }

    #[test]
    fn present_rectangles_requires_extension() {
        let library = QuarryLibrary::with_driver(
            MockDriver::new().with_extensions(DriverExtensions::empty()),
        )
        .unwrap();
        let physical_device = &library.enumerate_physical_devices().unwrap()[0];

        match physical_device.present_rectangles() {
            Err(Validated::ValidationError(_)) => (),
            _ => panic!("expected a validation error"),
        }
    }
}
