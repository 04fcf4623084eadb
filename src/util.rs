//! Small helpers shared across the crate.

/// Return the greatest valid UTF-8 char boundary at or below `index`.
///
/// Mirrors `str::floor_char_boundary` while remaining compatible with
/// stable toolchains where that API is not available.
pub fn floor_utf8_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }

    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

/// Last path component of a program token, accepting both `/` and `\`
/// separators so Windows-style argv entries are handled on any host.
pub fn program_basename(token: &str) -> &str {
    token.rsplit(['/', '\\']).next().unwrap_or(token)
}

/// Current wall-clock time in milliseconds since the epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn floor_boundary_ascii() {
        assert_eq!(floor_utf8_char_boundary("hello", 0), 0);
        assert_eq!(floor_utf8_char_boundary("hello", 3), 3);
        assert_eq!(floor_utf8_char_boundary("hello", 99), 5);
    }

    #[test]
    fn floor_boundary_multibyte() {
        let s = "aé你🦀";
        assert_eq!(floor_utf8_char_boundary(s, 1), 1);
        // Index 2 is inside "é" (2-byte char), floor moves back to 1.
        assert_eq!(floor_utf8_char_boundary(s, 2), 1);
        // Index 5 is inside "你" (3-byte char), floor moves back to 3.
        assert_eq!(floor_utf8_char_boundary(s, 5), 3);
    }

    #[test]
    fn basename_handles_both_separators() {
        assert_eq!(program_basename("/usr/bin/git"), "git");
        assert_eq!(program_basename("C:\\Windows\\System32\\cmd.exe"), "cmd.exe");
        assert_eq!(program_basename("bash"), "bash");
    }
}
