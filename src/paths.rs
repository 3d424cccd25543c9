//! Slash-separated path helpers for namespace paths and destination keys.
//!
//! Both the crawler (`objectPath = join(directory, urlName)`) and the
//! annotation key derivation need the same lexical join: empty segments are
//! skipped, `.` and `..` are resolved, and a leading `/` is preserved.

/// Join path segments, skipping empty ones, and clean the result.
///
/// Returns an empty string when every segment is empty.
pub fn join<S: AsRef<str>>(segments: &[S]) -> String {
    let joined = segments
        .iter()
        .map(AsRef::as_ref)
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("/");
    if joined.is_empty() {
        return joined;
    }
    clean(&joined)
}

/// Lexically clean a slash-separated path.
pub fn clean(path: &str) -> String {
    if path.is_empty() {
        return ".".to_string();
    }

    let rooted = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => match parts.last() {
                Some(&last) if last != ".." => {
                    parts.pop();
                }
                _ if rooted => {}
                _ => parts.push(".."),
            },
            other => parts.push(other),
        }
    }

    let body = parts.join("/");
    match (rooted, body.is_empty()) {
        (true, _) => format!("/{body}"),
        (false, true) => ".".to_string(),
        (false, false) => body,
    }
}

/// Turn a namespace prefix into something usable inside a file name.
pub fn file_stem_for_prefix(prefix: &str) -> String {
    prefix
        .trim_matches('/')
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' => '_',
            other => other,
        })
        .collect()
}
