// NTFS Windows Timestamp Handling
// Converts between chrono date-times and Windows FILETIME values

use chrono::{DateTime, TimeZone, Utc};

/// Number of seconds between 1601-01-01 and the Unix epoch
const WINDOWS_EPOCH_DIFF: i64 = 11_644_473_600;

/// FILETIME is in 100-nanosecond intervals
const FILETIME_TICKS_PER_SECOND: i64 = 10_000_000;

/// Converts a Windows FILETIME to a UTC date-time
pub fn filetime_to_datetime(filetime: u64) -> Option<DateTime<Utc>> {
    let ticks = i64::try_from(filetime).ok()?;
    let seconds = ticks / FILETIME_TICKS_PER_SECOND - WINDOWS_EPOCH_DIFF;
    let nanos = ((ticks % FILETIME_TICKS_PER_SECOND) * 100) as u32;
    Utc.timestamp_opt(seconds, nanos).single()
}

/// Converts a UTC date-time to a Windows FILETIME, clamping to the FILETIME epoch
pub fn datetime_to_filetime(time: DateTime<Utc>) -> u64 {
    let seconds = time.timestamp() + WINDOWS_EPOCH_DIFF;
    if seconds < 0 {
        return 0;
    }
    (seconds * FILETIME_TICKS_PER_SECOND + (time.timestamp_subsec_nanos() / 100) as i64) as u64
}

/// Get current time as Windows FILETIME
pub fn current_filetime() -> u64 {
    datetime_to_filetime(Utc::now())
}

/// The four timestamps carried by $STANDARD_INFORMATION and $FILE_NAME
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NtfsTimestamps {
    pub creation_time: u64,
    pub modification_time: u64,
    pub mft_modification_time: u64,
    pub access_time: u64,
}

impl NtfsTimestamps {
    /// Create new timestamps with current time
    pub fn now() -> Self {
        let now = current_filetime();
        Self {
            creation_time: now,
            modification_time: now,
            mft_modification_time: now,
            access_time: now,
        }
    }

    /// Record a content change
    pub fn touch_modified(&mut self) {
        let now = current_filetime();
        self.modification_time = now;
        self.mft_modification_time = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unix_epoch() {
        let epoch = Utc.timestamp_opt(0, 0).single().unwrap();
        assert_eq!(datetime_to_filetime(epoch), 116_444_736_000_000_000);
        assert_eq!(filetime_to_datetime(116_444_736_000_000_000), Some(epoch));
    }

    #[test]
    fn test_sub_second_precision() {
        let time = Utc.timestamp_opt(1_700_000_000, 123_456_700).single().unwrap();
        let filetime = datetime_to_filetime(time);
        assert_eq!(filetime_to_datetime(filetime), Some(time));
    }

    #[test]
    fn test_before_filetime_epoch_clamps() {
        let ancient = Utc.with_ymd_and_hms(1500, 1, 1, 0, 0, 0).single().unwrap();
        assert_eq!(datetime_to_filetime(ancient), 0);
    }

    #[test]
    fn test_now_is_monotonic_enough() {
        let timestamps = NtfsTimestamps::now();
        assert!(timestamps.creation_time > 116_444_736_000_000_000);
        assert_eq!(timestamps.creation_time, timestamps.access_time);
    }
}
