//! Small shared helpers: time windows and free disk space.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Parses a `"H:MM"` clock string into minutes since midnight.
/// Returns `None` on malformed input.
pub fn parse_clock(s: &str) -> Option<u32> {
    let (h, m) = s.trim().split_once(':')?;
    let h: u32 = h.trim().parse().ok()?;
    let m: u32 = m.trim().parse().ok()?;
    if h > 23 || m > 59 {
        return None;
    }
    Some(h * 60 + m)
}

/// True if `now` (minutes since midnight) lies inside the window `[start, end)`.
///
/// A window whose start equals its end is always open. Windows may wrap
/// past midnight (`23:00`–`6:00`).
pub fn in_time_window(start: u32, end: u32, now: u32) -> bool {
    if start == end {
        return true;
    }
    if start < end {
        (start..end).contains(&now)
    } else {
        now >= start || now < end
    }
}

/// True if the current local wall clock is inside the `"H:MM"`–`"H:MM"` window.
/// Malformed clock strings leave the window open.
pub fn compare_time(start: &str, end: &str) -> bool {
    let (Some(s), Some(e)) = (parse_clock(start), parse_clock(end)) else {
        return true;
    };
    in_time_window(s, e, minutes_since_midnight())
}

fn minutes_since_midnight() -> u32 {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    // Local offset is not tracked; windows are interpreted in UTC.
    ((secs % 86_400) / 60) as u32
}

/// Available space in bytes at `path`.
#[cfg(unix)]
pub fn free_space(path: &Path) -> u64 {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let Ok(c_path) = CString::new(path.as_os_str().as_bytes()) else {
        return 0;
    };
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let r = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if r != 0 {
        return 0;
    }
    stat.f_bavail as u64 * stat.f_frsize as u64
}

/// Non-Unix fallback: report unlimited space so the disk floor never trips.
#[cfg(not(unix))]
pub fn free_space(_path: &Path) -> u64 {
    u64::MAX
}

/// Sanitizes a candidate filename (e.g. from content-disposition) for safe
/// use on Linux.
///
/// - Replaces NUL, `/`, `\`, whitespace and control characters with `_`
/// - Trims leading/trailing spaces and dots
/// - Collapses consecutive underscores
/// - Limits length to 255 bytes (NAME_MAX)
pub fn sanitize_filename(name: &str) -> String {
    const NAME_MAX: usize = 255;

    let mut out = String::with_capacity(name.len());
    let mut prev_underscore = false;

    for c in name.chars() {
        let replacement = if c == '\0' || c == '/' || c == '\\' || c.is_control() {
            '_'
        } else if c == ' ' || c == '\t' {
            '_'
        } else {
            c
        };

        if replacement == '_' {
            if !prev_underscore {
                out.push('_');
            }
            prev_underscore = true;
        } else {
            out.push(replacement);
            prev_underscore = false;
        }
    }

    let trimmed = out.trim_matches(|c| c == ' ' || c == '\t' || c == '.' || c == '_');

    if trimmed.len() > NAME_MAX {
        let mut take = NAME_MAX;
        while take > 0 && !trimmed.is_char_boundary(take) {
            take -= 1;
        }
        trimmed[..take].to_string()
    } else {
        trimmed.to_string()
    }
}

/// Current unix time in whole seconds.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_clock_accepts_single_digit_hours() {
        assert_eq!(parse_clock("0:00"), Some(0));
        assert_eq!(parse_clock("8:30"), Some(510));
        assert_eq!(parse_clock("23:59"), Some(1439));
    }

    #[test]
    fn parse_clock_rejects_garbage() {
        assert_eq!(parse_clock("25:00"), None);
        assert_eq!(parse_clock("12:61"), None);
        assert_eq!(parse_clock("noon"), None);
    }

    #[test]
    fn window_equal_bounds_is_always_open() {
        assert!(in_time_window(0, 0, 720));
        assert!(in_time_window(510, 510, 0));
    }

    #[test]
    fn window_plain() {
        assert!(in_time_window(60, 120, 90));
        assert!(!in_time_window(60, 120, 120));
        assert!(!in_time_window(60, 120, 30));
    }

    #[test]
    fn window_wraps_midnight() {
        // 23:00 - 6:00
        assert!(in_time_window(1380, 360, 1400));
        assert!(in_time_window(1380, 360, 100));
        assert!(!in_time_window(1380, 360, 720));
    }

    #[test]
    fn free_space_reports_nonzero_for_tmp() {
        assert!(free_space(Path::new("/tmp")) > 0 || cfg!(not(unix)));
    }

    #[test]
    fn sanitize_replaces_separators_and_collapses() {
        assert_eq!(sanitize_filename("a/b\\c.txt"), "a_b_c.txt");
        assert_eq!(sanitize_filename("file___name.txt"), "file_name.txt");
        assert_eq!(sanitize_filename("  ..  file.txt  ..  "), "file.txt");
        assert_eq!(sanitize_filename("file\x00name.txt"), "file_name.txt");
    }
}
