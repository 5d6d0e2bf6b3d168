//! The driver's extension catalog.
//!
//! Extensions add optional entry points and behaviors on top of the core driver interface. The
//! catalog of extensions a driver supports is read once when the library is loaded; device
//! creation then chooses which of them to enable.

use crate::ffi;
use std::{
    ffi::CStr,
    fmt::{Debug, Error as FmtError, Formatter},
};

/// The name of the extension that allows exporting device memory through POSIX file
/// descriptors.
pub const EXT_MEMORY_EXPORT: &str = "QRY_EXT_memory_export";
/// The name of the extension that reports the presentable regions of a device.
pub const EXT_PRESENT_REGIONS: &str = "QRY_EXT_present_regions";

/// Properties of one extension in the driver's catalog.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExtensionProperties {
    /// The name of the extension.
    pub extension_name: String,

    /// The version of the extension that is implemented.
    pub spec_version: u32,
}

impl From<ffi::ExtensionProperties> for ExtensionProperties {
    #[inline]
    fn from(val: ffi::ExtensionProperties) -> Self {
        Self {
            extension_name: string_from_bytes(&val.extension_name),
            spec_version: val.spec_version,
        }
    }
}

/// Reads a driver-reported, nul-terminated name field.
pub(crate) fn string_from_bytes(bytes: &[u8]) -> String {
    let bytes = CStr::from_bytes_until_nul(bytes)
        .map(CStr::to_bytes)
        .unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

/// A set of known driver extensions.
///
/// One field per extension this crate knows how to use, `true` when the extension is present in
/// the set. Extension names the crate does not know are dropped when building a set from names.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct DriverExtensions {
    /// [`EXT_MEMORY_EXPORT`]
    pub ext_memory_export: bool,
    /// [`EXT_PRESENT_REGIONS`]
    pub ext_present_regions: bool,
}

impl DriverExtensions {
    /// Returns a set with no extensions.
    #[inline]
    pub const fn empty() -> Self {
        Self {
            ext_memory_export: false,
            ext_present_regions: false,
        }
    }

    /// Returns whether every extension in `other` is also in `self`.
    #[inline]
    pub const fn contains(&self, other: &Self) -> bool {
        (self.ext_memory_export || !other.ext_memory_export)
            && (self.ext_present_regions || !other.ext_present_regions)
    }

    /// Returns the union of `self` and `other`.
    #[inline]
    pub const fn union(&self, other: &Self) -> Self {
        Self {
            ext_memory_export: self.ext_memory_export || other.ext_memory_export,
            ext_present_regions: self.ext_present_regions || other.ext_present_regions,
        }
    }

    /// Returns the names of the extensions in the set.
    pub fn names(&self) -> impl Iterator<Item = &'static str> {
        [
            self.ext_memory_export.then_some(EXT_MEMORY_EXPORT),
            self.ext_present_regions.then_some(EXT_PRESENT_REGIONS),
        ]
        .into_iter()
        .flatten()
    }
}

impl<'a> FromIterator<&'a str> for DriverExtensions {
    fn from_iter<I>(iter: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut extensions = Self::empty();

        for name in iter {
            match name {
                EXT_MEMORY_EXPORT => extensions.ext_memory_export = true,
                EXT_PRESENT_REGIONS => extensions.ext_present_regions = true,
                _ => (),
            }
        }

        extensions
    }
}

impl Debug for DriverExtensions {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        let mut written = false;

        for name in self.names() {
            if written {
                write!(f, ", ")?;
            }

            f.write_str(name)?;
            written = true;
        }

        if !written {
            write!(f, "[]")?;
        }

        Ok(())
    }
}
