//! Package name inference: group URLs by the name their paths suggest.
//!
//! Used when auto-creating packages from a link dump and when building the
//! online-check skeleton. The heuristic strips archive/split suffixes so
//! `foo.part1.rar` and `foo.part2.rar` land in the same package.

use std::collections::BTreeMap;

use url::Url;

const ARCHIVE_SUFFIXES: &[&str] = &[
    ".rar", ".zip", ".7z", ".tar", ".gz", ".bz2", ".xz", ".html", ".htm", ".php",
];

/// Derives a grouping key from a single URL or plain name.
///
/// Takes the last path segment, drops the query, percent-decodes common
/// escapes, strips archive extensions and `partNN` / `.rNN` split markers,
/// and lowercases. Falls back to the host, then `"unknown"`.
pub fn name_for(link: &str) -> String {
    let (tail, host) = match Url::parse(link) {
        Ok(u) => {
            let tail = u
                .path_segments()
                .and_then(|mut s| s.next_back())
                .unwrap_or("")
                .to_string();
            (tail, u.host_str().unwrap_or("").to_string())
        }
        Err(_) => (link.rsplit('/').next().unwrap_or(link).to_string(), String::new()),
    };

    let mut name = tail.split('?').next().unwrap_or("").replace("%20", " ");

    loop {
        let lower = name.to_ascii_lowercase();
        let before = name.len();
        for suffix in ARCHIVE_SUFFIXES {
            if lower.ends_with(suffix) {
                name.truncate(name.len() - suffix.len());
                break;
            }
        }
        if name.len() == before {
            break;
        }
    }

    // Split-volume markers: "name.part01", "name.r00", trailing ".001".
    if let Some(idx) = name.rfind('.') {
        let ext = &name[idx + 1..];
        let is_part = ext
            .get(..4)
            .map(|p| p.eq_ignore_ascii_case("part"))
            .unwrap_or(false)
            && ext.len() > 4
            && ext[4..].chars().all(|c| c.is_ascii_digit());
        let is_rnn = ext.len() >= 2
            && (ext.starts_with('r') || ext.starts_with('R'))
            && ext[1..].chars().all(|c| c.is_ascii_digit());
        let is_num = !ext.is_empty() && ext.chars().all(|c| c.is_ascii_digit());
        if is_part || is_rnn || is_num {
            name.truncate(idx);
        }
    }

    let name = name.trim_matches(|c: char| c == '.' || c == '-' || c == '_' || c.is_whitespace());
    if !name.is_empty() {
        return name.to_ascii_lowercase();
    }
    if !host.is_empty() {
        return host;
    }
    "unknown".to_string()
}

/// Groups `(link, payload)` pairs by inferred package name.
///
/// The map is ordered so callers produce stable package ordering.
pub fn parse_names<T>(pairs: impl IntoIterator<Item = (String, T)>) -> BTreeMap<String, Vec<T>> {
    let mut out: BTreeMap<String, Vec<T>> = BTreeMap::new();
    for (link, payload) in pairs {
        out.entry(name_for(&link)).or_default().push(payload);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_volumes_group_together() {
        let urls = [
            "http://host/dl/movie.part1.rar",
            "http://host/dl/movie.part2.rar",
            "http://host/dl/movie.r00",
        ];
        let grouped = parse_names(urls.iter().map(|u| (u.to_string(), *u)));
        assert_eq!(grouped.len(), 1);
        assert_eq!(grouped["movie"].len(), 3);
    }

    #[test]
    fn query_strings_are_ignored() {
        assert_eq!(name_for("http://host/files/data.zip?token=abc"), "data");
    }

    #[test]
    fn falls_back_to_host_for_bare_roots() {
        assert_eq!(name_for("http://example.com/"), "example.com");
    }

    #[test]
    fn unparseable_links_still_yield_a_key() {
        assert_eq!(name_for("///"), "unknown");
    }

    #[test]
    fn numeric_split_suffix_stripped() {
        assert_eq!(name_for("http://h/backup.tar.gz"), "backup");
        assert_eq!(name_for("http://h/backup.001"), "backup");
    }
}
