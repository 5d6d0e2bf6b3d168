#![cfg(test)]

//! Test harness: a scripted in-memory driver, and macros to set up a device against it.

use crate::{
    extensions::DriverExtensions,
    ffi::{self, ResultCode},
    library::Driver,
    Version,
};
use foldhash::{HashMap, HashSet};
use parking_lot::Mutex;
use std::sync::Arc;

/// Creates a device (with every supported extension enabled) and a queue family to use with it.
macro_rules! mock_device_and_queue {
    () => {{
        let (_driver, device, queue_family_index) = mock_driver_device_and_queue!();
        (device, queue_family_index)
    }};
}

/// As [`mock_device_and_queue!`], but also hands back the driver for inspection.
macro_rules! mock_driver_device_and_queue {
    () => {{
        mock_driver_device_and_queue!($crate::tests::MockDriver::new())
    }};
    ($driver:expr) => {{
        let driver = $driver;
        let library = $crate::library::QuarryLibrary::with_driver(driver.clone()).unwrap();
        let physical_device = library.enumerate_physical_devices().unwrap().remove(0);
        let enabled_extensions = *library.supported_extensions();
        let device = $crate::device::Device::new(
            physical_device,
            $crate::device::DeviceCreateInfo {
                enabled_extensions,
                ..Default::default()
            },
        )
        .unwrap();
        (driver, device, 0u32)
    }};
}

const PHYSICAL_DEVICE: ffi::PhysicalDeviceHandle = ffi::PhysicalDeviceHandle::from_raw(0x10);

/// An in-memory `Driver` with full bookkeeping of the objects created through it.
///
/// The mock panics when the wrapper breaks the interface contract (destroying an object twice,
/// freeing a buffer from the wrong pool, and so on), so contract violations fail tests loudly
/// instead of corrupting state. Clones share their state, which is how tests keep a handle for
/// inspection after moving the driver into a library.
#[derive(Clone, Debug)]
pub(crate) struct MockDriver(Arc<MockInner>);

#[derive(Debug)]
struct MockInner {
    state: Mutex<MockState>,
}

#[derive(Debug)]
struct MockState {
    extensions: DriverExtensions,
    present_rects: Vec<ffi::Rect2D>,

    next_handle: u64,
    devices: HashSet<u64>,
    pools: HashMap<u64, MockPool>,
    memories: HashSet<u64>,

    buffer_allocation_calls: u32,
    fail_pool_create: Option<ResultCode>,
    fail_buffer_allocation: Option<(u32, ResultCode)>,
}

#[derive(Debug)]
struct MockPool {
    device: u64,
    buffers: HashSet<u64>,
}

impl MockDriver {
    pub(crate) fn new() -> Self {
        MockDriver(Arc::new(MockInner {
            state: Mutex::new(MockState {
                extensions: DriverExtensions {
                    ext_memory_export: true,
                    ext_present_regions: true,
                },
                present_rects: vec![],
                next_handle: 0x100,
                devices: HashSet::default(),
                pools: HashMap::default(),
                memories: HashSet::default(),
                buffer_allocation_calls: 0,
                fail_pool_create: None,
                fail_buffer_allocation: None,
            }),
        }))
    }

    /// Sets the extension catalog the driver reports.
    pub(crate) fn with_extensions(self, extensions: DriverExtensions) -> Self {
        self.0.state.lock().extensions = extensions;
        self
    }

    /// Sets the presentable regions the driver reports.
    pub(crate) fn with_present_rects(self, rects: Vec<ffi::Rect2D>) -> Self {
        self.0.state.lock().present_rects = rects;
        self
    }

    /// Makes the next pool creation fail with `code`.
    pub(crate) fn fail_next_pool_create(&self, code: ResultCode) {
        self.0.state.lock().fail_pool_create = Some(code);
    }

    /// Makes the next buffer allocation produce `produced` handles and then fail the batch
    /// with `code`.
    pub(crate) fn fail_buffer_allocation_after(&self, produced: u32, code: ResultCode) {
        self.0.state.lock().fail_buffer_allocation = Some((produced, code));
    }

    pub(crate) fn live_devices(&self) -> usize {
        self.0.state.lock().devices.len()
    }

    pub(crate) fn live_pools(&self) -> usize {
        self.0.state.lock().pools.len()
    }

    pub(crate) fn live_buffers(&self) -> usize {
        self.0.state.lock().pools.values().map(|pool| pool.buffers.len()).sum()
    }

    pub(crate) fn live_memories(&self) -> usize {
        self.0.state.lock().memories.len()
    }

    pub(crate) fn buffer_allocation_calls(&self) -> u32 {
        self.0.state.lock().buffer_allocation_calls
    }
}

impl MockState {
    fn take_handle(&mut self) -> u64 {
        let handle = self.next_handle;
        self.next_handle += 1;
        handle
    }
}

/// Writes `items` in the driver's two-phase convention.
unsafe fn write_list<T: Copy>(items: &[T], count: *mut u32, out: *mut T) -> ResultCode {
    if out.is_null() {
        unsafe { *count = items.len() as u32 };
        return ResultCode::SUCCESS;
    }

    let capacity = unsafe { *count } as usize;
    let written = capacity.min(items.len());
    for (i, &item) in items.iter().take(written).enumerate() {
        unsafe { *out.add(i) = item };
    }
    unsafe { *count = written as u32 };

    if written < items.len() {
        ResultCode::INCOMPLETE
    } else {
        ResultCode::SUCCESS
    }
}

fn name_field<const N: usize>(name: &str) -> [u8; N] {
    let mut out = [0; N];
    out[..name.len()].copy_from_slice(name.as_bytes());
    out
}

unsafe impl Driver for MockDriver {
    unsafe fn enumerate_devices(
        &self,
        count: *mut u32,
        devices: *mut ffi::PhysicalDeviceHandle,
    ) -> ResultCode {
        unsafe { write_list(&[PHYSICAL_DEVICE], count, devices) }
    }

    unsafe fn get_device_properties(
        &self,
        physical_device: ffi::PhysicalDeviceHandle,
        properties: *mut ffi::Properties,
    ) -> ResultCode {
        assert_eq!(physical_device, PHYSICAL_DEVICE);

        unsafe {
            *properties = ffi::Properties {
                api_version: Version::V1_1.try_into_raw().unwrap(),
                driver_version: 1,
                device_id: 0x51ab,
                device_type: ffi::DEVICE_TYPE_DISCRETE,
                device_name: name_field("Mock Device"),
            };
        }

        ResultCode::SUCCESS
    }

    unsafe fn get_device_queue_families(
        &self,
        physical_device: ffi::PhysicalDeviceHandle,
        count: *mut u32,
        families: *mut ffi::QueueFamilyProperties,
    ) -> ResultCode {
        assert_eq!(physical_device, PHYSICAL_DEVICE);

        let table = [
            ffi::QueueFamilyProperties {
                queue_flags: ffi::QUEUE_COMPUTE | ffi::QUEUE_TRANSFER,
                queue_count: 4,
            },
            ffi::QueueFamilyProperties {
                queue_flags: ffi::QUEUE_TRANSFER,
                queue_count: 2,
            },
        ];

        unsafe { write_list(&table, count, families) }
    }

    unsafe fn get_present_rects(
        &self,
        physical_device: ffi::PhysicalDeviceHandle,
        count: *mut u32,
        rects: *mut ffi::Rect2D,
    ) -> ResultCode {
        assert_eq!(physical_device, PHYSICAL_DEVICE);

        let table = self.0.state.lock().present_rects.clone();
        unsafe { write_list(&table, count, rects) }
    }

    unsafe fn create_device(
        &self,
        physical_device: ffi::PhysicalDeviceHandle,
        _create_info: *const ffi::DeviceCreateInfo,
        device: *mut ffi::DeviceHandle,
    ) -> ResultCode {
        assert_eq!(physical_device, PHYSICAL_DEVICE);

        let mut state = self.0.state.lock();
        let handle = state.take_handle();
        state.devices.insert(handle);
        unsafe { *device = ffi::DeviceHandle::from_raw(handle) };

        ResultCode::SUCCESS
    }

    unsafe fn destroy_device(&self, device: ffi::DeviceHandle) {
        let mut state = self.0.state.lock();
        assert!(
            state.devices.remove(&device.as_raw()),
            "destroyed a device that does not exist",
        );
    }

    unsafe fn create_pool(
        &self,
        device: ffi::DeviceHandle,
        _create_info: *const ffi::PoolCreateInfo,
        pool: *mut ffi::PoolHandle,
    ) -> ResultCode {
        let mut state = self.0.state.lock();
        assert!(state.devices.contains(&device.as_raw()), "unknown device");

        if let Some(code) = state.fail_pool_create.take() {
            return code;
        }

        let handle = state.take_handle();
        state.pools.insert(
            handle,
            MockPool {
                device: device.as_raw(),
                buffers: HashSet::default(),
            },
        );
        unsafe { *pool = ffi::PoolHandle::from_raw(handle) };

        ResultCode::SUCCESS
    }

    unsafe fn destroy_pool(&self, device: ffi::DeviceHandle, pool: ffi::PoolHandle) {
        let mut state = self.0.state.lock();
        let entry = state
            .pools
            .remove(&pool.as_raw())
            .expect("destroyed a pool that does not exist");
        assert_eq!(entry.device, device.as_raw(), "pool belongs to another device");
    }

    unsafe fn reset_pool(
        &self,
        device: ffi::DeviceHandle,
        pool: ffi::PoolHandle,
        _flags: u32,
    ) -> ResultCode {
        let mut state = self.0.state.lock();
        let entry = state.pools.get_mut(&pool.as_raw()).expect("unknown pool");
        assert_eq!(entry.device, device.as_raw(), "pool belongs to another device");
        entry.buffers.clear();

        ResultCode::SUCCESS
    }

    unsafe fn allocate_buffers(
        &self,
        device: ffi::DeviceHandle,
        allocate_info: *const ffi::BufferAllocateInfo,
        buffers: *mut ffi::BufferHandle,
    ) -> ResultCode {
        let info = unsafe { *allocate_info };

        let mut state = self.0.state.lock();
        state.buffer_allocation_calls += 1;
        assert!(state.devices.contains(&device.as_raw()), "unknown device");
        assert!(state.pools.contains_key(&info.pool.as_raw()), "unknown pool");

        let (produced, result) = match state.fail_buffer_allocation.take() {
            Some((produced, code)) => (produced.min(info.buffer_count), code),
            None => (info.buffer_count, ResultCode::SUCCESS),
        };

        for i in 0..produced {
            let handle = state.take_handle();
            let pool = state.pools.get_mut(&info.pool.as_raw()).unwrap();
            pool.buffers.insert(handle);
            unsafe { *buffers.add(i as usize) = ffi::BufferHandle::from_raw(handle) };
        }

        result
    }

    unsafe fn free_buffers(
        &self,
        device: ffi::DeviceHandle,
        pool: ffi::PoolHandle,
        count: u32,
        buffers: *const ffi::BufferHandle,
    ) {
        let handles = unsafe { std::slice::from_raw_parts(buffers, count as usize) };

        let mut state = self.0.state.lock();
        let entry = state.pools.get_mut(&pool.as_raw()).expect("unknown pool");
        assert_eq!(entry.device, device.as_raw(), "pool belongs to another device");

        for handle in handles {
            assert!(
                entry.buffers.remove(&handle.as_raw()),
                "freed a buffer that is not live in this pool",
            );
        }
    }

    unsafe fn allocate_memory(
        &self,
        device: ffi::DeviceHandle,
        allocate_info: *const ffi::MemoryAllocateInfo,
        memory: *mut ffi::MemoryHandle,
    ) -> ResultCode {
        let info = unsafe { *allocate_info };
        assert_ne!(info.allocation_size, 0);

        let mut state = self.0.state.lock();
        assert!(state.devices.contains(&device.as_raw()), "unknown device");

        let handle = state.take_handle();
        state.memories.insert(handle);
        unsafe { *memory = ffi::MemoryHandle::from_raw(handle) };

        ResultCode::SUCCESS
    }

    unsafe fn free_memory(&self, device: ffi::DeviceHandle, memory: ffi::MemoryHandle) {
        let mut state = self.0.state.lock();
        assert!(state.devices.contains(&device.as_raw()), "unknown device");
        assert!(
            state.memories.remove(&memory.as_raw()),
            "freed a memory allocation that does not exist",
        );
    }

    unsafe fn get_memory_fd(
        &self,
        _device: ffi::DeviceHandle,
        memory: ffi::MemoryHandle,
        handle_type: u32,
        fd: *mut i32,
    ) -> ResultCode {
        assert_eq!(handle_type, ffi::MEMORY_HANDLE_TYPE_OPAQUE_FD);
        assert!(self.0.state.lock().memories.contains(&memory.as_raw()));

        #[cfg(unix)]
        {
            use std::os::fd::IntoRawFd;

            // Hand out a real descriptor so that ownership transfer can be exercised.
            let file = std::fs::File::open("/dev/null").unwrap();
            unsafe { *fd = file.into_raw_fd() };
            ResultCode::SUCCESS
        }
        #[cfg(not(unix))]
        {
            let _ = fd;
            ResultCode::ERROR_FEATURE_NOT_PRESENT
        }
    }

    unsafe fn enumerate_extensions(
        &self,
        count: *mut u32,
        properties: *mut ffi::ExtensionProperties,
    ) -> ResultCode {
        let table: Vec<ffi::ExtensionProperties> = self
            .0
            .state
            .lock()
            .extensions
            .names()
            .map(|name| ffi::ExtensionProperties {
                extension_name: name_field(name),
                spec_version: 1,
            })
            .collect();

        unsafe { write_list(&table, count, properties) }
    }

    unsafe fn get_driver_version(&self, version: *mut u32) -> ResultCode {
        unsafe { *version = Version::V1_1.try_into_raw().unwrap() };
        ResultCode::SUCCESS
    }
}
