use std::path::Path;

/// Normalize an HTTP target into a path beginning with `/` and without
/// `.`/`..` segments.
pub fn normalize_path(target: &str) -> String {
    let trimmed = target.trim();
    let raw = if trimmed.is_empty() { "/" } else { trimmed };
    let mut normalized = String::from("/");
    let mut first = true;
    for segment in raw.split('/') {
        if segment.is_empty() || segment == "." || segment == ".." {
            continue;
        }
        if !first {
            normalized.push('/');
        }
        normalized.push_str(segment);
        first = false;
    }
    normalized
}

/// Final path segment of a URL path, without the query string.
pub fn url_basename(path: &str) -> String {
    let without_query = path.split('?').next().unwrap_or(path);
    without_query
        .rsplit('/')
        .next()
        .unwrap_or("")
        .to_string()
}

/// Whether the URL names a file, judged by the presence of an extension on
/// its final segment.
pub fn has_extension(path: &str) -> bool {
    let name = url_basename(path);
    match name.rfind('.') {
        Some(idx) => idx > 0 && idx + 1 < name.len(),
        None => false,
    }
}

/// Index files to probe for a directory, Apache style: the configured
/// space-separated list first, then the defaults, first occurrence wins.
pub fn index_candidates(directory_index: &str) -> Vec<String> {
    let mut candidates: Vec<String> = Vec::new();
    for name in directory_index.split_whitespace() {
        if !candidates.iter().any(|c| c == name) {
            candidates.push(name.to_string());
        }
    }
    for default in ["index.html", "index.htm", "index.php"] {
        if !candidates.iter().any(|c| c == default) {
            candidates.push(default.to_string());
        }
    }
    candidates
}

/// First index candidate that exists as a regular file in `dir`.
pub fn find_index_file(dir: &Path, directory_index: &str) -> Option<String> {
    for candidate in index_candidates(directory_index) {
        let probe = dir.join(&candidate);
        match std::fs::metadata(&probe) {
            Ok(meta) if meta.is_file() => return Some(candidate),
            _ => continue,
        }
    }
    None
}

/// Human-readable size used in directory listings.
pub fn format_size(size: u64) -> String {
    if size < 1024 {
        format!("{size} B")
    } else if size < 1024 * 1024 {
        format!("{:.1} KB", size as f64 / 1024.0)
    } else {
        format!("{:.1} MB", size as f64 / (1024.0 * 1024.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_dot_segments() {
        assert_eq!(normalize_path("/a/../../etc/passwd"), "/etc/passwd");
        assert_eq!(normalize_path("/a/./b//c"), "/a/b/c");
        assert_eq!(normalize_path(""), "/");
    }

    #[test]
    fn basename_ignores_query() {
        assert_eq!(url_basename("/blog/index.php?p=1"), "index.php");
        assert_eq!(url_basename("/"), "");
    }

    #[test]
    fn extension_detection() {
        assert!(has_extension("/site/app.js"));
        assert!(!has_extension("/api/users"));
        assert!(!has_extension("/.htaccess/"));
    }

    #[test]
    fn index_candidates_dedupe_first_seen() {
        let list = index_candidates("index.php home.html index.php");
        assert_eq!(
            list,
            vec!["index.php", "home.html", "index.html", "index.htm"]
        );
    }

    #[test]
    fn size_formatting() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2.0 KB");
        assert_eq!(format_size(3 * 1024 * 1024), "3.0 MB");
    }
}
