//! Filesystem-name sanitization and unique-path resolution.
//!
//! Mirrors the reconciler's "unsafe characters stripped" rule: URL fragments
//! removed, filesystem-reserved characters removed, newlines replaced with
//! spaces.

use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};

static RE_URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(https?|ftp|file)://[-A-Za-z0-9+&@#/%?=~_|!:,.;]+[-A-Za-z0-9+&@#/%=~_|]").unwrap()
});
static RE_NEWLINE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\r\n|\r|\n").unwrap());
static RE_RESERVED: Lazy<Regex> = Lazy::new(|| Regex::new(r#"[/\\:*?"<>|]"#).unwrap());

/// Strip URL fragments and filesystem-reserved characters, collapse newlines to spaces.
pub fn sanitize(input: &str) -> String {
    let no_urls = RE_URL.replace_all(input, "");
    let no_reserved = RE_RESERVED.replace_all(&no_urls, "");
    RE_NEWLINE.replace_all(&no_reserved, " ").into_owned()
}

/// Probe `dir/stem.ext`, `dir/stem(1).ext`, `dir/stem(2).ext`, ... in order,
/// returning the first candidate that does not exist. The original requested
/// stem is never reinterpreted: a `(N)` already present in `stem` is just
/// part of the literal name being probed, not a counter to bump.
pub fn unique_path(dir: &Path, stem: &str, ext: &str) -> std::io::Result<PathBuf> {
    let mut i: u64 = 0;
    loop {
        let candidate = if i == 0 {
            dir.join(format!("{stem}{ext}"))
        } else {
            dir.join(format!("{stem}({i}){ext}"))
        };
        if !candidate.exists() {
            return Ok(candidate);
        }
        i += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn sanitize_strips_urls() {
        assert_eq!(sanitize("https://x/y?name=test"), "");
    }

    #[test]
    fn sanitize_strips_reserved_chars() {
        assert_eq!(sanitize("a|b?c"), "abc");
    }

    #[test]
    fn sanitize_collapses_newlines() {
        assert_eq!(sanitize("x\ny\r"), "x y");
    }

    #[test]
    fn unique_path_skips_existing_sequential_suffixes() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"").unwrap();
        std::fs::write(dir.path().join("a(1).txt"), b"").unwrap();
        std::fs::write(dir.path().join("a(2).txt"), b"").unwrap();

        let got = unique_path(dir.path(), "a", ".txt").unwrap();
        assert_eq!(got, dir.path().join("a(3).txt"));
    }

    #[test]
    fn unique_path_does_not_reinterpret_requested_suffix() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a(2).txt"), b"").unwrap();

        let got = unique_path(dir.path(), "a(2)", ".txt").unwrap();
        assert_eq!(got, dir.path().join("a(2)(1).txt"));
    }

    #[test]
    fn unique_path_returns_requested_name_when_free() {
        let dir = tempdir().unwrap();
        let got = unique_path(dir.path(), "fresh", ".jpg").unwrap();
        assert_eq!(got, dir.path().join("fresh.jpg"));
    }
}
