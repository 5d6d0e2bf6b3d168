//! Safe and rich Rust wrapper around the Quarry compute resource driver interface.
//!
//! # Brief overview
//!
//! - The [`QuarryLibrary`] represents a Quarry driver on the system. It must be loaded before
//!   you can do anything else, and stays alive for as long as any object created from it.
//!
//! - The [`PhysicalDevice`](crate::physical::PhysicalDevice) object represents one device
//!   reported by the driver. Physical devices can be enumerated from a library with
//!   [`QuarryLibrary::enumerate_physical_devices`].
//!
//! - Once you have chosen a physical device to use, you can create a
//!   [`Device`](crate::device::Device) object from it. The `Device` is an open channel of
//!   communication with the driver, and almost every other object is created from one.
//!
//! - Buffers are carved in batches from a [`Pool`](crate::pool::Pool). A pool is a bulk arena:
//!   destroying or resetting it invalidates every buffer allocated from it at once. The
//!   [`allocator`] module provides a higher-level allocator that recycles freed buffers.
//!
//! - [`DeviceMemory`](crate::memory::DeviceMemory) represents a raw device memory allocation,
//!   which can be exported to other processes through the platform's native handles.
//!
//! Driver objects are only ever manipulated through the entry points resolved at load time; the
//! driver itself stays a black box. Every fallible wrapper call validates its usage contract
//! first and then translates the driver's status code into the error types of this crate, so
//! raw status codes never reach callers undigested.

use std::{
    borrow::Cow,
    error::Error,
    fmt::{Debug, Display, Error as FmtError, Formatter},
};

pub use crate::{library::QuarryLibrary, version::Version};

#[macro_use]
mod tests;
pub mod allocator;
pub mod device;
pub mod extensions;
pub mod ffi;
mod fns;
pub mod library;
pub(crate) mod macros;
pub mod memory;
pub mod physical;
pub mod pool;
pub mod probe;
mod version;

/// Represents memory size and offset values on a device.
pub type DeviceSize = u64;

/// Gives access to the raw handle of a driver object.
///
/// # Safety
///
/// The handle returned by `handle` must be the handle the driver assigned to this object, for
/// the whole lifetime of the object.
pub unsafe trait QuarryObject {
    /// The type of the raw handle.
    type Handle;

    /// Returns the raw handle of the object.
    fn handle(&self) -> Self::Handle;
}

/// An error that can happen when calling into the driver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QuarryError {
    /// The driver was unable to satisfy a resource allocation request.
    ///
    /// Allocation failures are never retried automatically; they are reported to the caller
    /// right away.
    AllocationFailed(AllocationFailure),

    /// A two-phase variable-length read kept returning a different element count across its
    /// retry budget, so no consistent snapshot could be produced.
    ///
    /// This happens when the driver-side table is mutated at a pathological rate. The operation
    /// can be retried at a higher level.
    QueryInconsistent {
        /// The number of fill attempts that were made before giving up.
        attempts: u32,
    },

    /// The device has been lost.
    DeviceLost,

    /// The driver rejected the call with a status code not covered by the other variants. The
    /// original code is preserved for diagnostics.
    Rejected(ffi::ResultCode),
}

impl Error for QuarryError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::AllocationFailed(err) => Some(err),
            _ => None,
        }
    }
}

impl Display for QuarryError {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        match self {
            Self::AllocationFailed(_) => write!(f, "a driver allocation has failed"),
            Self::QueryInconsistent { attempts } => write!(
                f,
                "a variable-length read did not stabilize within {} attempts",
                attempts,
            ),
            Self::DeviceLost => write!(f, "the device has been lost"),
            Self::Rejected(code) => write!(f, "the driver rejected the call: {:?}", code),
        }
    }
}

impl From<AllocationFailure> for QuarryError {
    #[inline]
    fn from(err: AllocationFailure) -> Self {
        Self::AllocationFailed(err)
    }
}

impl From<ffi::ResultCode> for QuarryError {
    #[inline]
    fn from(code: ffi::ResultCode) -> Self {
        match code {
            ffi::ResultCode::ERROR_OUT_OF_HOST_MEMORY => {
                Self::AllocationFailed(AllocationFailure::OutOfHostMemory)
            }
            ffi::ResultCode::ERROR_OUT_OF_DEVICE_MEMORY => {
                Self::AllocationFailed(AllocationFailure::OutOfDeviceMemory)
            }
            ffi::ResultCode::ERROR_OUT_OF_POOL_MEMORY => {
                Self::AllocationFailed(AllocationFailure::OutOfPoolMemory)
            }
            ffi::ResultCode::ERROR_DEVICE_LOST => Self::DeviceLost,
            code => Self::Rejected(code),
        }
    }
}

/// The resource the driver ran out of when an allocation failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocationFailure {
    /// There is no memory available on the host.
    OutOfHostMemory,
    /// There is no memory available on the device.
    OutOfDeviceMemory,
    /// The pool the allocation was requested from has no memory left.
    OutOfPoolMemory,
}

impl Error for AllocationFailure {}

impl Display for AllocationFailure {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        let msg = match self {
            Self::OutOfHostMemory => "no memory available on the host",
            Self::OutOfDeviceMemory => "no memory available on the device",
            Self::OutOfPoolMemory => "no memory left in the pool",
        };

        f.write_str(msg)
    }
}

/// A wrapper for error types of operations that are validated before being passed on to the
/// driver.
#[derive(Clone)]
pub enum Validated<E> {
    /// The driver returned an error.
    Error(E),

    /// The operation violated its usage contract; the driver was never called.
    ValidationError(Box<ValidationError>),
}

impl<E> Validated<E> {
    /// Maps the inner `Error` value using the provided function, or does nothing if the value is
    /// `ValidationError`.
    pub fn map<F>(self, f: impl FnOnce(E) -> F) -> Validated<F> {
        match self {
            Self::Error(err) => Validated::Error(f(err)),
            Self::ValidationError(err) => Validated::ValidationError(err),
        }
    }

    /// Returns the inner `Error` value, or panics if the value is `ValidationError`.
    pub fn unwrap(self) -> E {
        match self {
            Self::Error(err) => err,
            Self::ValidationError(err) => {
                panic!("expected a driver error, got a validation error: {}", err)
            }
        }
    }
}

impl<E> Error for Validated<E>
where
    E: Error + 'static,
{
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Error(err) => Some(err),
            Self::ValidationError(err) => Some(err),
        }
    }
}

impl<E> Display for Validated<E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        match self {
            Self::Error(_) => write!(f, "a driver error occurred"),
            Self::ValidationError(_) => write!(f, "a validation error occurred"),
        }
    }
}

impl<E> Debug for Validated<E>
where
    E: Debug,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        match self {
            Self::Error(err) => write!(f, "a driver error occurred: {:?}", err),
            Self::ValidationError(err) => write!(f, "a validation error occurred: {}", err),
        }
    }
}

impl From<QuarryError> for Validated<QuarryError> {
    #[inline]
    fn from(err: QuarryError) -> Self {
        Self::Error(err)
    }
}

impl<E> From<Box<ValidationError>> for Validated<E> {
    #[inline]
    fn from(err: Box<ValidationError>) -> Self {
        Self::ValidationError(err)
    }
}

/// The usage contract of an operation was violated.
///
/// This is always the result of a mistake in the calling code, not of anything the driver did,
/// and is detected before the driver is ever called.
#[derive(Clone, Debug, Default)]
pub struct ValidationError {
    /// The context in which the problem exists, for example a parameter name.
    pub context: Cow<'static, str>,

    /// A description of the problem.
    pub problem: Cow<'static, str>,

    /// The requirements that would have to be met for the operation to be valid, if the problem
    /// is that none of them were.
    pub requires_one_of: RequiresOneOf,
}

impl ValidationError {
    pub(crate) fn add_context(
        mut self: Box<Self>,
        context: impl Into<Cow<'static, str>>,
    ) -> Box<Self> {
        let context = context.into();

        self.context = if self.context.is_empty() {
            context
        } else {
            Cow::Owned(format!("{}.{}", context, self.context))
        };

        self
    }
}

impl Error for ValidationError {}

impl Display for ValidationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        if !self.context.is_empty() {
            write!(f, "{}: ", self.context)?;
        }

        if self.problem.is_empty() {
            write!(f, "{}", self.requires_one_of)?;
        } else {
            write!(f, "{}", self.problem)?;

            if !self.requires_one_of.0.is_empty() {
                write!(f, " -- {}", self.requires_one_of)?;
            }
        }

        Ok(())
    }
}

/// Used in errors to indicate a set of alternative requirements, at least one of which must be
/// met.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RequiresOneOf(pub &'static [RequiresAllOf]);

impl Display for RequiresOneOf {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        write!(f, "requires one of: ")?;

        let mut alternatives = self.0.iter();

        if let Some(alternative) = alternatives.next() {
            write!(f, "{}", alternative)?;

            for alternative in alternatives {
                write!(f, " or {}", alternative)?;
            }
        }

        Ok(())
    }
}

/// Used in errors to indicate a set of requirements that must all be met.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RequiresAllOf(pub &'static [Requires]);

impl Display for RequiresAllOf {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        let mut requirements = self.0.iter();

        if let Some(requirement) = requirements.next() {
            write!(f, "{}", requirement)?;

            for requirement in requirements {
                write!(f, " + {}", requirement)?;
            }
        }

        Ok(())
    }
}

/// Something that needs to be supported or enabled to make an operation valid.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Requires {
    /// A minimum driver interface version.
    ApiVersion(Version),
    /// A driver extension, by name.
    DriverExtension(&'static str),
}

impl Display for Requires {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        match self {
            Self::ApiVersion(version) => write!(f, "driver API version {}", version),
            Self::DriverExtension(name) => write!(f, "extension `{}`", name),
        }
    }
}

/// A helper type for non-exhaustive structs.
///
/// This type cannot be constructed outside this crate. Structures with a field of this type can
/// only be constructed by calling a constructor function or `Default::default()`. The effect is
/// similar to the standard Rust `#[non_exhaustive]` attribute, except that it does not prevent
/// update syntax from being used.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NonExhaustive(pub(crate) ());

#[cfg(test)]
mod lib_tests {
    use super::{
        ffi, AllocationFailure, QuarryError, Requires, RequiresAllOf, RequiresOneOf, Validated,
        ValidationError, Version,
    };

    #[test]
    fn result_code_translation() {
        assert_eq!(
            QuarryError::from(ffi::ResultCode::ERROR_OUT_OF_POOL_MEMORY),
            QuarryError::AllocationFailed(AllocationFailure::OutOfPoolMemory),
        );
        assert_eq!(
            QuarryError::from(ffi::ResultCode::ERROR_DEVICE_LOST),
            QuarryError::DeviceLost,
        );

        // Codes without a dedicated variant keep the raw value around.
        let code = ffi::ResultCode::from_raw(-99);
        assert_eq!(QuarryError::from(code), QuarryError::Rejected(code));
    }

    #[test]
    fn validation_error_context() {
        let err = Box::new(ValidationError {
            context: "flags".into(),
            problem: "is invalid".into(),
            ..Default::default()
        })
        .add_context("create_info");

        assert_eq!(err.to_string(), "create_info.flags: is invalid");
    }

    #[test]
    fn requirements_display() {
        let err = ValidationError {
            problem: "`present_rectangles` was called".into(),
            requires_one_of: RequiresOneOf(&[
                RequiresAllOf(&[Requires::ApiVersion(Version::V1_2)]),
                RequiresAllOf(&[Requires::DriverExtension("QRY_EXT_present_regions")]),
            ]),
            ..Default::default()
        };

        let msg = err.to_string();
        assert!(msg.contains("driver API version 1.2"));
        assert!(msg.contains("or extension `QRY_EXT_present_regions`"));
    }

    #[test]
    fn validated_unwrap() {
        let err: Validated<QuarryError> = QuarryError::DeviceLost.into();
        assert_eq!(err.unwrap(), QuarryError::DeviceLost);
    }
}
