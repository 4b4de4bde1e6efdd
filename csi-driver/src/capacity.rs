//! Capacity quantization.
//!
//! The backend allocates disks in whole gibibytes. Requested byte ranges are
//! rounded up to the next GiB, never down.

use tonic::Status;

use crate::csi;

pub const GIB: i64 = 1024 * 1024 * 1024;

/// Size used when the request carries no capacity range: 4 GiB
pub const DEFAULT_VOLUME_SIZE: i64 = 4 * GIB;

/// Ceiling division of `bytes` into whole GiB.
pub fn round_up_gib(bytes: i64) -> i64 {
    if bytes <= 0 {
        return 0;
    }
    (bytes - 1) / GIB + 1
}

/// Bytes the request asks for before quantization.
///
/// `required_bytes` wins when positive; otherwise `limit_bytes` when
/// positive; otherwise the default size.
pub fn requested_bytes(capacity_range: Option<&csi::CapacityRange>) -> i64 {
    capacity_range
        .map(|range| {
            if range.required_bytes > 0 {
                range.required_bytes
            } else if range.limit_bytes > 0 {
                range.limit_bytes
            } else {
                DEFAULT_VOLUME_SIZE
            }
        })
        .unwrap_or(DEFAULT_VOLUME_SIZE)
}

/// Resolve a capacity range to the whole number of GiB to allocate.
///
/// Fails with `InvalidArgument` on negative bounds and `OutOfRange` when the
/// rounded size no longer fits under a positive `limit_bytes` or in an `i64`
/// byte count.
pub fn quantize(capacity_range: Option<&csi::CapacityRange>) -> Result<i64, Status> {
    if let Some(range) = capacity_range {
        if range.required_bytes < 0 || range.limit_bytes < 0 {
            return Err(Status::invalid_argument(
                "Capacity range bounds must not be negative",
            ));
        }
        if range.limit_bytes > 0 && range.required_bytes > range.limit_bytes {
            return Err(Status::invalid_argument(format!(
                "Required bytes {} exceed limit bytes {}",
                range.required_bytes, range.limit_bytes
            )));
        }
    }

    let gib = match capacity_range {
        // Only a ceiling was given: take the largest whole GiB under it
        Some(range) if range.required_bytes == 0 && range.limit_bytes > 0 => {
            range.limit_bytes / GIB
        }
        _ => round_up_gib(requested_bytes(capacity_range)),
    };

    if let Some(range) = capacity_range
        && range.limit_bytes > 0
        && (gib == 0 || gib.saturating_mul(GIB) > range.limit_bytes)
    {
        return Err(Status::out_of_range(format!(
            "No whole GiB size satisfies the capacity range (required {} bytes, limit {} bytes)",
            range.required_bytes, range.limit_bytes
        )));
    }

    gib_to_bytes(gib)?;
    Ok(gib)
}

/// Byte size of `gib` whole GiB.
///
/// Fails with `OutOfRange` when the size does not fit in a signed 64-bit byte count.
pub fn gib_to_bytes(gib: i64) -> Result<i64, Status> {
    gib.checked_mul(GIB).ok_or_else(|| {
        Status::out_of_range(format!("Volume size of {} GiB exceeds the maximum byte size", gib))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(required_bytes: i64, limit_bytes: i64) -> csi::CapacityRange {
        csi::CapacityRange {
            required_bytes,
            limit_bytes,
        }
    }

    #[test]
    fn test_round_up_gib() {
        assert_eq!(round_up_gib(1), 1);
        assert_eq!(round_up_gib(GIB), 1);
        assert_eq!(round_up_gib(GIB + 1), 2);
        assert_eq!(round_up_gib(20 * GIB), 20);
        assert_eq!(round_up_gib(20 * GIB + 1), 21);
        assert_eq!(round_up_gib(0), 0);
    }

    #[test]
    fn test_default_without_range() {
        assert_eq!(quantize(None).unwrap(), 4);
    }

    #[test]
    fn test_required_bytes_round_up() {
        assert_eq!(quantize(Some(&range(20 * GIB, 0))).unwrap(), 20);
        assert_eq!(quantize(Some(&range(20 * GIB + 1, 0))).unwrap(), 21);
        assert_eq!(quantize(Some(&range(512, 0))).unwrap(), 1);
    }

    #[test]
    fn test_limit_bytes_fallback() {
        assert_eq!(requested_bytes(Some(&range(0, 5 * GIB))), 5 * GIB);
        assert_eq!(quantize(Some(&range(0, 5 * GIB))).unwrap(), 5);
        // A ceiling that is not a GiB multiple rounds down to stay under it
        assert_eq!(quantize(Some(&range(0, 5 * GIB + 7))).unwrap(), 5);
    }

    #[test]
    fn test_limit_below_one_gib_is_out_of_range() {
        let err = quantize(Some(&range(0, GIB - 1))).unwrap_err();
        assert_eq!(err.code(), tonic::Code::OutOfRange);
    }

    #[test]
    fn test_empty_range_uses_default() {
        assert_eq!(quantize(Some(&range(0, 0))).unwrap(), 4);
    }

    #[test]
    fn test_rounding_past_limit_is_out_of_range() {
        let err = quantize(Some(&range(GIB + 1, GIB + 100))).unwrap_err();
        assert_eq!(err.code(), tonic::Code::OutOfRange);
    }

    #[test]
    fn test_size_past_i64_bytes_is_out_of_range() {
        let err = quantize(Some(&range(i64::MAX, 0))).unwrap_err();
        assert_eq!(err.code(), tonic::Code::OutOfRange);

        // Largest request whose rounded size still fits
        let max_gib = i64::MAX / GIB;
        assert_eq!(quantize(Some(&range(max_gib * GIB, 0))).unwrap(), max_gib);
        assert_eq!(gib_to_bytes(max_gib).unwrap(), max_gib * GIB);
        assert!(gib_to_bytes(max_gib + 1).is_err());
    }

    #[test]
    fn test_invalid_ranges() {
        let err = quantize(Some(&range(-1, 0))).unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);

        let err = quantize(Some(&range(10 * GIB, 5 * GIB))).unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
    }
}
