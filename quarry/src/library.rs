//! Driver library loading system.
//!
//! Before anything else can happen, a library containing an implementation of the driver
//! interface must be found. An implementation is defined as the set of `qry*` entry points,
//! which is abstracted twice here: the [`Loader`] trait turns symbol names into addresses, and
//! the [`Driver`] trait is the resolved, callable interface everything in this crate goes
//! through. Production code loads a shared library with [`QuarryLibrary::new`]; software
//! drivers and test harnesses can plug in their own `Driver` implementation with
//! [`QuarryLibrary::with_driver`].

pub use crate::fns::DriverFunctions;
use crate::{
    extensions::{DriverExtensions, ExtensionProperties},
    ffi, probe, QuarryError, Version,
};
use libloading::{Error as LibloadingError, Library};
use std::{
    error::Error,
    ffi::{c_void, CStr},
    fmt::{Debug, Display, Error as FmtError, Formatter},
    mem::MaybeUninit,
    path::Path,
    sync::Arc,
};

/// The resolved driver interface.
///
/// Each method mirrors one native entry point exactly: raw handles in, raw pointers out, a
/// [`ResultCode`](ffi::ResultCode) back. The safe wrappers in this crate are written entirely
/// against this trait, so anything that implements it can stand in for a real driver.
///
/// # Safety
///
/// An implementation must follow the driver interface contract: out-pointers are only written
/// within the bounds the caller communicated, handles returned from creation calls are valid
/// until passed to the matching destruction call, and no method accesses caller memory beyond
/// its arguments.
pub unsafe trait Driver: Debug + Send + Sync {
    /// # Safety
    ///
    /// Two-phase convention: if `devices` is null, `count` receives the element count;
    /// otherwise `count` carries the capacity of `devices` in and the written element count out.
    unsafe fn enumerate_devices(
        &self,
        count: *mut u32,
        devices: *mut ffi::PhysicalDeviceHandle,
    ) -> ffi::ResultCode;

    /// # Safety
    ///
    /// `properties` must point to storage for one [`ffi::Properties`].
    unsafe fn get_device_properties(
        &self,
        physical_device: ffi::PhysicalDeviceHandle,
        properties: *mut ffi::Properties,
    ) -> ffi::ResultCode;

    /// # Safety
    ///
    /// Two-phase convention, as [`enumerate_devices`](Self::enumerate_devices).
    unsafe fn get_device_queue_families(
        &self,
        physical_device: ffi::PhysicalDeviceHandle,
        count: *mut u32,
        families: *mut ffi::QueueFamilyProperties,
    ) -> ffi::ResultCode;

    /// # Safety
    ///
    /// Two-phase convention, as [`enumerate_devices`](Self::enumerate_devices).
    unsafe fn get_present_rects(
        &self,
        physical_device: ffi::PhysicalDeviceHandle,
        count: *mut u32,
        rects: *mut ffi::Rect2D,
    ) -> ffi::ResultCode;

    /// # Safety
    ///
    /// `create_info` must point to a prepared [`ffi::DeviceCreateInfo`]; `device` must point to
    /// storage for one handle.
    unsafe fn create_device(
        &self,
        physical_device: ffi::PhysicalDeviceHandle,
        create_info: *const ffi::DeviceCreateInfo,
        device: *mut ffi::DeviceHandle,
    ) -> ffi::ResultCode;

    /// # Safety
    ///
    /// `device` must be a live device handle; it is invalid after the call returns.
    unsafe fn destroy_device(&self, device: ffi::DeviceHandle);

    /// # Safety
    ///
    /// `create_info` must point to a prepared [`ffi::PoolCreateInfo`]; `pool` must point to
    /// storage for one handle.
    unsafe fn create_pool(
        &self,
        device: ffi::DeviceHandle,
        create_info: *const ffi::PoolCreateInfo,
        pool: *mut ffi::PoolHandle,
    ) -> ffi::ResultCode;

    /// # Safety
    ///
    /// `pool` must be a live pool of `device`; the pool and every buffer allocated from it are
    /// invalid after the call returns.
    unsafe fn destroy_pool(&self, device: ffi::DeviceHandle, pool: ffi::PoolHandle);

    /// # Safety
    ///
    /// `pool` must be a live pool of `device`.
    unsafe fn reset_pool(
        &self,
        device: ffi::DeviceHandle,
        pool: ffi::PoolHandle,
        flags: u32,
    ) -> ffi::ResultCode;

    /// # Safety
    ///
    /// `buffers` must point to storage for `allocate_info.buffer_count` handles. On failure the
    /// driver may have written any prefix of the batch; the caller is responsible for releasing
    /// those handles.
    unsafe fn allocate_buffers(
        &self,
        device: ffi::DeviceHandle,
        allocate_info: *const ffi::BufferAllocateInfo,
        buffers: *mut ffi::BufferHandle,
    ) -> ffi::ResultCode;

    /// # Safety
    ///
    /// `buffers` must point to `count` handles, all allocated from `pool` and all live; they
    /// are invalid after the call returns.
    unsafe fn free_buffers(
        &self,
        device: ffi::DeviceHandle,
        pool: ffi::PoolHandle,
        count: u32,
        buffers: *const ffi::BufferHandle,
    );

    /// # Safety
    ///
    /// `allocate_info` must point to a prepared [`ffi::MemoryAllocateInfo`]; `memory` must
    /// point to storage for one handle.
    unsafe fn allocate_memory(
        &self,
        device: ffi::DeviceHandle,
        allocate_info: *const ffi::MemoryAllocateInfo,
        memory: *mut ffi::MemoryHandle,
    ) -> ffi::ResultCode;

    /// # Safety
    ///
    /// `memory` must be a live memory allocation of `device`; it is invalid after the call
    /// returns.
    unsafe fn free_memory(&self, device: ffi::DeviceHandle, memory: ffi::MemoryHandle);

    /// # Safety
    ///
    /// `fd` must point to storage for one file descriptor. On success the caller owns the
    /// returned descriptor.
    unsafe fn get_memory_fd(
        &self,
        device: ffi::DeviceHandle,
        memory: ffi::MemoryHandle,
        handle_type: u32,
        fd: *mut i32,
    ) -> ffi::ResultCode;

    /// # Safety
    ///
    /// Two-phase convention, as [`enumerate_devices`](Self::enumerate_devices).
    unsafe fn enumerate_extensions(
        &self,
        count: *mut u32,
        properties: *mut ffi::ExtensionProperties,
    ) -> ffi::ResultCode;

    /// # Safety
    ///
    /// `version` must point to storage for one packed version value.
    unsafe fn get_driver_version(&self, version: *mut u32) -> ffi::ResultCode;
}

/// Implemented on objects that provide access to driver symbols.
pub trait Loader: Send + Sync {
    /// Returns the address of the symbol named `name`, or null if the library does not export
    /// it.
    ///
    /// # Safety
    ///
    /// The returned address must stay valid for as long as `self` is alive, and must be the
    /// address of a symbol with the signature the driver interface declares for `name`.
    unsafe fn get_proc_addr(&self, name: &CStr) -> *const c_void;
}

/// Implementation of `Loader` that loads the driver from a dynamic library.
pub struct DynamicLibraryLoader {
    library: Library,
}

impl DynamicLibraryLoader {
    /// Loads the dynamic library at `path`.
    ///
    /// # Safety
    ///
    /// The dynamic library must be a driver implementation; its initialization and termination
    /// routines run inside this call and must be sound.
    pub unsafe fn new(path: impl AsRef<Path>) -> Result<Self, LoadingError> {
        let library =
            unsafe { Library::new(path.as_ref()) }.map_err(LoadingError::LibraryLoadFailure)?;

        Ok(Self { library })
    }
}

impl Loader for DynamicLibraryLoader {
    unsafe fn get_proc_addr(&self, name: &CStr) -> *const c_void {
        unsafe { self.library.get::<unsafe extern "system" fn()>(name.to_bytes_with_nul()) }
            .map_or(std::ptr::null(), |symbol| *symbol as *const c_void)
    }
}

/// A `Driver` backed by an entry point table resolved from a [`Loader`].
struct DynamicDriver {
    fns: DriverFunctions,
    // The loader must outlive the resolved entry points.
    _loader: Box<dyn Loader>,
}

impl Debug for DynamicDriver {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        f.debug_struct("DynamicDriver").finish_non_exhaustive()
    }
}

// SAFETY: the entry points were resolved from a loaded driver library, which promises the
// interface contract for the symbols it exports.
unsafe impl Driver for DynamicDriver {
    unsafe fn enumerate_devices(
        &self,
        count: *mut u32,
        devices: *mut ffi::PhysicalDeviceHandle,
    ) -> ffi::ResultCode {
        unsafe { (self.fns.enumerate_devices)(count, devices) }
    }

    unsafe fn get_device_properties(
        &self,
        physical_device: ffi::PhysicalDeviceHandle,
        properties: *mut ffi::Properties,
    ) -> ffi::ResultCode {
        unsafe { (self.fns.get_device_properties)(physical_device, properties) }
    }

    unsafe fn get_device_queue_families(
        &self,
        physical_device: ffi::PhysicalDeviceHandle,
        count: *mut u32,
        families: *mut ffi::QueueFamilyProperties,
    ) -> ffi::ResultCode {
        unsafe { (self.fns.get_device_queue_families)(physical_device, count, families) }
    }

    unsafe fn get_present_rects(
        &self,
        physical_device: ffi::PhysicalDeviceHandle,
        count: *mut u32,
        rects: *mut ffi::Rect2D,
    ) -> ffi::ResultCode {
        unsafe { (self.fns.get_present_rects)(physical_device, count, rects) }
    }

    unsafe fn create_device(
        &self,
        physical_device: ffi::PhysicalDeviceHandle,
        create_info: *const ffi::DeviceCreateInfo,
        device: *mut ffi::DeviceHandle,
    ) -> ffi::ResultCode {
        unsafe { (self.fns.create_device)(physical_device, create_info, device) }
    }

    unsafe fn destroy_device(&self, device: ffi::DeviceHandle) {
        unsafe { (self.fns.destroy_device)(device) }
    }

    unsafe fn create_pool(
        &self,
        device: ffi::DeviceHandle,
        create_info: *const ffi::PoolCreateInfo,
        pool: *mut ffi::PoolHandle,
    ) -> ffi::ResultCode {
        unsafe { (self.fns.create_pool)(device, create_info, pool) }
    }

    unsafe fn destroy_pool(&self, device: ffi::DeviceHandle, pool: ffi::PoolHandle) {
        unsafe { (self.fns.destroy_pool)(device, pool) }
    }

    unsafe fn reset_pool(
        &self,
        device: ffi::DeviceHandle,
        pool: ffi::PoolHandle,
        flags: u32,
    ) -> ffi::ResultCode {
        unsafe { (self.fns.reset_pool)(device, pool, flags) }
    }

    unsafe fn allocate_buffers(
        &self,
        device: ffi::DeviceHandle,
        allocate_info: *const ffi::BufferAllocateInfo,
        buffers: *mut ffi::BufferHandle,
    ) -> ffi::ResultCode {
        unsafe { (self.fns.allocate_buffers)(device, allocate_info, buffers) }
    }

    unsafe fn free_buffers(
        &self,
        device: ffi::DeviceHandle,
        pool: ffi::PoolHandle,
        count: u32,
        buffers: *const ffi::BufferHandle,
    ) {
        unsafe { (self.fns.free_buffers)(device, pool, count, buffers) }
    }

    unsafe fn allocate_memory(
        &self,
        device: ffi::DeviceHandle,
        allocate_info: *const ffi::MemoryAllocateInfo,
        memory: *mut ffi::MemoryHandle,
    ) -> ffi::ResultCode {
        unsafe { (self.fns.allocate_memory)(device, allocate_info, memory) }
    }

    unsafe fn free_memory(&self, device: ffi::DeviceHandle, memory: ffi::MemoryHandle) {
        unsafe { (self.fns.free_memory)(device, memory) }
    }

    unsafe fn get_memory_fd(
        &self,
        device: ffi::DeviceHandle,
        memory: ffi::MemoryHandle,
        handle_type: u32,
        fd: *mut i32,
    ) -> ffi::ResultCode {
        unsafe { (self.fns.get_memory_fd)(device, memory, handle_type, fd) }
    }

    unsafe fn enumerate_extensions(
        &self,
        count: *mut u32,
        properties: *mut ffi::ExtensionProperties,
    ) -> ffi::ResultCode {
        unsafe { (self.fns.enumerate_extensions)(count, properties) }
    }

    unsafe fn get_driver_version(&self, version: *mut u32) -> ffi::ResultCode {
        unsafe { (self.fns.get_driver_version)(version) }
    }
}

/// A loaded driver containing a valid implementation of the driver interface.
#[derive(Debug)]
pub struct QuarryLibrary {
    driver: Box<dyn Driver>,

    api_version: Version,
    extension_properties: Vec<ExtensionProperties>,
    supported_extensions: DriverExtensions,
}

impl QuarryLibrary {
    /// Loads the default driver library for this system.
    pub fn new() -> Result<Arc<Self>, LoadingError> {
        #[cfg(windows)]
        const PATHS: &[&str] = &["quarry.dll"];
        #[cfg(target_vendor = "apple")]
        const PATHS: &[&str] = &["libquarry.dylib", "libquarry.1.dylib"];
        #[cfg(all(unix, not(target_vendor = "apple")))]
        const PATHS: &[&str] = &["libquarry.so.1", "libquarry.so"];

        let mut err: Option<LoadingError> = None;

        for path in PATHS {
            match unsafe { DynamicLibraryLoader::new(path) } {
                Ok(library) => return Self::with_loader(library),
                Err(e) => err = Some(e),
            }
        }

        Err(err.unwrap())
    }

    /// Loads a driver through a custom symbol loader.
    pub fn with_loader(loader: impl Loader + 'static) -> Result<Arc<Self>, LoadingError> {
        let fns = DriverFunctions::load(|name| unsafe { loader.get_proc_addr(name) })?;

        Self::with_driver(DynamicDriver {
            fns,
            _loader: Box::new(loader),
        })
    }

    /// Wraps a custom driver implementation.
    ///
    /// This bypasses dynamic loading entirely, which is how software drivers and test harnesses
    /// are plugged in.
    pub fn with_driver(driver: impl Driver + 'static) -> Result<Arc<Self>, LoadingError> {
        let api_version = {
            let mut output = MaybeUninit::uninit();
            unsafe { driver.get_driver_version(output.as_mut_ptr()) }
                .result()
                .map_err(QuarryError::from)?;
            Version::from(unsafe { output.assume_init() })
        };

        let extension_properties: Vec<ExtensionProperties> =
            probe::read_to_vec(|count, out| unsafe { driver.enumerate_extensions(count, out) })?
                .into_iter()
                .map(Into::into)
                .collect();

        let supported_extensions = extension_properties
            .iter()
            .map(|properties| properties.extension_name.as_str())
            .collect();

        Ok(Arc::new(QuarryLibrary {
            driver: Box::new(driver),
            api_version,
            extension_properties,
            supported_extensions,
        }))
    }

    pub(crate) fn driver(&self) -> &dyn Driver {
        &*self.driver
    }

    /// Returns the version of the driver interface the loaded driver implements.
    #[inline]
    pub fn api_version(&self) -> Version {
        self.api_version
    }

    /// Returns the extension catalog of the loaded driver.
    #[inline]
    pub fn extension_properties(&self) -> &[ExtensionProperties] {
        &self.extension_properties
    }

    /// Returns the extensions known to this crate that the loaded driver supports.
    #[inline]
    pub fn supported_extensions(&self) -> &DriverExtensions {
        &self.supported_extensions
    }

    /// Returns the physical devices the driver reports.
    ///
    /// The list is a snapshot; calling this again re-reads it from the driver.
    pub fn enumerate_physical_devices(
        self: &Arc<Self>,
    ) -> Result<Vec<Arc<crate::physical::PhysicalDevice>>, QuarryError> {
        crate::physical::init_physical_devices(self)
    }
}

/// Error that can happen when loading a driver library.
#[derive(Debug)]
pub enum LoadingError {
    /// Failure while loading the driver shared library.
    LibraryLoadFailure(LibloadingError),

    /// The library does not export a mandatory entry point.
    MissingEntryPoint(String),

    /// The driver failed to answer the initial version or extension queries.
    DriverError(QuarryError),
}

impl Error for LoadingError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::LibraryLoadFailure(err) => Some(err),
            Self::MissingEntryPoint(_) => None,
            Self::DriverError(err) => Some(err),
        }
    }
}

impl Display for LoadingError {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        match self {
            Self::LibraryLoadFailure(_) => write!(f, "failed to load the driver shared library"),
            Self::MissingEntryPoint(name) => {
                write!(f, "the library does not export the `{}` entry point", name)
            }
            Self::DriverError(_) => write!(f, "the driver failed its initial queries"),
        }
    }
}

impl From<QuarryError> for LoadingError {
    #[inline]
    fn from(err: QuarryError) -> Self {
        Self::DriverError(err)
    }
}
