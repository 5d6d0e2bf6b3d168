//! Two-phase reads of variable-length driver tables.
//!
//! Several entry points report arrays whose length is not known ahead of time: the driver is
//! first called with a null output buffer to obtain the current element count, and then again
//! with a buffer sized to that count. Because the driver-side table may change between the two
//! calls, the second call can come back [`INCOMPLETE`], in which case the whole read must be
//! started over. [`read_to_vec`] packages this convention up once, so the call sites only
//! provide the entry point to probe.
//!
//! [`INCOMPLETE`]: crate::ffi::ResultCode::INCOMPLETE

use crate::{ffi::ResultCode, QuarryError};
use bytemuck::Pod;
use std::ptr;

/// The maximum number of fill attempts a single read makes before giving up with
/// [`QuarryError::QueryInconsistent`].
pub const MAX_PROBE_ATTEMPTS: u32 = 4;

/// Reads a variable-length table from the driver into a `Vec`.
///
/// `probe_fn` is called in the driver's two-phase convention:
///
/// - With a null buffer pointer, it must write the current element count to the count pointer.
/// - With a non-null buffer pointer, the count carries the buffer capacity in, and the number of
///   elements actually written out. The driver returns [`INCOMPLETE`] if the table held more
///   elements than the buffer could hold.
///
/// If the element count grows between the two phases, the read is restarted, up to
/// [`MAX_PROBE_ATTEMPTS`] fill attempts in total. An error status from either phase aborts the
/// read immediately. A count that *shrank* between the phases is not an error; the result is
/// simply the shorter table.
///
/// The returned `Vec` is a snapshot: calling `read_to_vec` again probes the driver from scratch.
///
/// [`INCOMPLETE`]: ResultCode::INCOMPLETE
pub fn read_to_vec<T>(
    mut probe_fn: impl FnMut(&mut u32, *mut T) -> ResultCode,
) -> Result<Vec<T>, QuarryError>
where
    T: Pod,
{
    let mut attempts = 0;

    loop {
        let mut count = 0;
        probe_fn(&mut count, ptr::null_mut())
            .result()
            .map_err(QuarryError::from)?;

        let mut data = vec![T::zeroed(); count as usize];
        attempts += 1;

        match probe_fn(&mut count, data.as_mut_ptr()) {
            ResultCode::SUCCESS => {
                data.truncate(count as usize);
                return Ok(data);
            }
            ResultCode::INCOMPLETE => {
                if attempts >= MAX_PROBE_ATTEMPTS {
                    return Err(QuarryError::QueryInconsistent { attempts });
                }
            }
            err => return Err(QuarryError::from(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{read_to_vec, MAX_PROBE_ATTEMPTS};
    use crate::{ffi::ResultCode, QuarryError};

    // A probe over a plain slice, following the driver convention, that counts its invocations.
    fn slice_probe<'a>(
        table: &'a [u32],
        calls: &'a mut u32,
    ) -> impl FnMut(&mut u32, *mut u32) -> ResultCode + 'a {
        move |count, out| {
            *calls += 1;

            if out.is_null() {
                *count = table.len() as u32;
                return ResultCode::SUCCESS;
            }

            let capacity = *count as usize;
            let written = capacity.min(table.len());
            for (i, &value) in table.iter().take(written).enumerate() {
                unsafe { *out.add(i) = value };
            }
            *count = written as u32;

            if written < table.len() {
                ResultCode::INCOMPLETE
            } else {
                ResultCode::SUCCESS
            }
        }
    }

    #[test]
    fn stable_counts() {
        for len in [0usize, 1, 100] {
            let table: Vec<u32> = (0..len as u32).collect();
            let mut calls = 0;
            let result = read_to_vec(slice_probe(&table, &mut calls)).unwrap();

            assert_eq!(result, table);
            // One count phase and one fill phase, nothing extra.
            assert_eq!(calls, 2);
        }
    }

    #[test]
    fn grows_once_between_phases() {
        let mut table: Vec<u32> = vec![1, 2, 3];
        let mut fills = 0;

        let result = read_to_vec(|count, out: *mut u32| {
            if out.is_null() {
                *count = table.len() as u32;
                // The table grows right after the first count was reported.
                if table.len() == 3 {
                    table.extend([4, 5, 6, 7]);
                }
                return ResultCode::SUCCESS;
            }

            fills += 1;
            let capacity = *count as usize;
            let written = capacity.min(table.len());
            for (i, &value) in table.iter().take(written).enumerate() {
                unsafe { *out.add(i) = value };
            }
            *count = written as u32;

            if written < table.len() {
                ResultCode::INCOMPLETE
            } else {
                ResultCode::SUCCESS
            }
        })
        .unwrap();

        assert_eq!(result, [1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(fills, 2);
    }

    #[test]
    fn shrinks_between_phases() {
        // A table that shrinks is returned at its shorter length, without a retry.
        let mut calls = 0;
        let result = read_to_vec(|count, out: *mut u32| {
            calls += 1;

            if out.is_null() {
                *count = 5;
                return ResultCode::SUCCESS;
            }

            unsafe {
                *out = 42;
                *out.add(1) = 43;
            }
            *count = 2;
            ResultCode::SUCCESS
        })
        .unwrap();

        assert_eq!(result, [42, 43]);
        assert_eq!(calls, 2);
    }

    #[test]
    fn unstable_table_exhausts_budget() {
        let result = read_to_vec(|count, out: *mut u32| {
            if out.is_null() {
                *count = 1;
                return ResultCode::SUCCESS;
            }

            // The table always claims to have grown past the buffer.
            unsafe { *out = 0 };
            ResultCode::INCOMPLETE
        });

        assert_eq!(
            result,
            Err(QuarryError::QueryInconsistent {
                attempts: MAX_PROBE_ATTEMPTS,
            }),
        );
    }

    #[test]
    fn count_phase_error_is_fatal() {
        let mut calls = 0;
        let result = read_to_vec(|_count, _out: *mut u32| {
            calls += 1;
            ResultCode::ERROR_DEVICE_LOST
        });

        assert_eq!(result, Err(QuarryError::DeviceLost));
        assert_eq!(calls, 1);
    }
}
