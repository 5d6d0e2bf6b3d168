//! The table of entry points resolved from a driver library.

use crate::{ffi, library::LoadingError};
use std::{
    ffi::{c_void, CStr},
    fmt::{Debug, Error as FmtError, Formatter},
    mem::transmute,
};

macro_rules! driver_fns {
    ($struct_name:ident, { $($member:ident: $fn_type:ident => $symbol:literal,)+ }) => {
        /// The entry points of a loaded driver, resolved by symbol name.
        pub struct $struct_name {
            $(
                pub $member: ffi::$fn_type,
            )+
        }

        impl $struct_name {
            /// Resolves every entry point through `load_fn`.
            ///
            /// `load_fn` receives the nul-terminated symbol name and returns the address of the
            /// symbol, or null if the library does not export it. Every entry point is
            /// mandatory; the first one that fails to resolve aborts the load.
            pub fn load(
                mut load_fn: impl FnMut(&CStr) -> *const c_void,
            ) -> Result<$struct_name, LoadingError> {
                Ok($struct_name {
                    $(
                        $member: {
                            let name = CStr::from_bytes_with_nul($symbol).unwrap();
                            let ptr = load_fn(name);

                            if ptr.is_null() {
                                return Err(LoadingError::MissingEntryPoint(
                                    name.to_string_lossy().into_owned(),
                                ));
                            }

                            // SAFETY: the caller contract of `load` requires that a non-null
                            // address is the address of the named driver symbol, which has the
                            // signature `ffi` declares for it.
                            unsafe { transmute::<*const c_void, ffi::$fn_type>(ptr) }
                        },
                    )+
                })
            }
        }

        impl Debug for $struct_name {
            fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
                f.debug_struct(stringify!($struct_name)).finish_non_exhaustive()
            }
        }
    };
}

driver_fns!(DriverFunctions, {
    enumerate_devices: PfnEnumerateDevices => b"qryEnumerateDevices\0",
    get_device_properties: PfnGetDeviceProperties => b"qryGetDeviceProperties\0",
    get_device_queue_families: PfnGetDeviceQueueFamilies => b"qryGetDeviceQueueFamilies\0",
    get_present_rects: PfnGetPresentRects => b"qryGetPresentRects\0",
    create_device: PfnCreateDevice => b"qryCreateDevice\0",
    destroy_device: PfnDestroyDevice => b"qryDestroyDevice\0",
    create_pool: PfnCreatePool => b"qryCreatePool\0",
    destroy_pool: PfnDestroyPool => b"qryDestroyPool\0",
    reset_pool: PfnResetPool => b"qryResetPool\0",
    allocate_buffers: PfnAllocateBuffers => b"qryAllocateBuffers\0",
    free_buffers: PfnFreeBuffers => b"qryFreeBuffers\0",
    allocate_memory: PfnAllocateMemory => b"qryAllocateMemory\0",
    free_memory: PfnFreeMemory => b"qryFreeMemory\0",
    get_memory_fd: PfnGetMemoryFd => b"qryGetMemoryFd\0",
    enumerate_extensions: PfnEnumerateExtensions => b"qryEnumerateExtensions\0",
    get_driver_version: PfnGetDriverVersion => b"qryGetDriverVersion\0",
});

#[cfg(test)]
mod tests {
    use super::DriverFunctions;
    use crate::library::LoadingError;
    use std::ptr;

    #[test]
    fn missing_entry_point() {
        let result = DriverFunctions::load(|_name| ptr::null());

        match result {
            Err(LoadingError::MissingEntryPoint(name)) => {
                assert_eq!(name, "qryEnumerateDevices");
            }
            _ => panic!("expected the first entry point to be reported missing"),
        }
    }
}
