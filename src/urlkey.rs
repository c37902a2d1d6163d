//! URL Normaliser: derive stable cache keys, on-disk paths and ancillary
//! file names from repository URLs. Pure, stateless functions only.

use camino::{Utf8Path, Utf8PathBuf};

#[cfg(windows)]
pub const SEP: &str = "__";
#[cfg(not(windows))]
pub const SEP: &str = ":";

/// Filesystem-safe cache key for `url`. Strips a leading `scheme://`,
/// strips a leading `user@`, then replaces `/` and `:` with `-`. When
/// `local` is set the key is prefixed with the literal `local`.
pub fn key(url: &str, local: bool) -> String {
    let mut rest = url;
    if let Some(idx) = rest.find("://") {
        rest = &rest[idx + 3..];
    }
    if let Some(at) = rest.find('@') {
        if !rest[..at].contains('/') {
            rest = &rest[at + 1..];
        }
    }
    let stripped = rest.replace(['/', ':'], "-");
    if local {
        format!("local{stripped}")
    } else {
        stripped
    }
}

pub fn mirror_dir(root: &Utf8Path, url: &str, local: bool) -> Utf8PathBuf {
    root.join(key(url, local))
}

pub fn submodules_file(root: &Utf8Path, url: &str, local: bool) -> Utf8PathBuf {
    root.join(format!("{}{SEP}submodules", key(url, local)))
}

pub fn lock_file_path(root: &Utf8Path, url: &str, local: bool) -> Utf8PathBuf {
    root.join(format!("{}{SEP}lock", key(url, local)))
}

/// Extracts `(path, url)` from a `git submodule init` status line of the
/// form `Submodule 'path' (url) registered for path ...`. Tolerates
/// trailing whitespace and CRLF line endings.
pub fn parse_submodule_line(line: &str) -> Option<(String, String)> {
    let line = line.trim_end_matches(['\r', '\n']).trim_end();
    let path = extract_last_delimited(line, '\'', '\'')?;
    let url = extract_last_delimited(line, '(', ')')?;
    Some((path, url))
}

fn extract_last_delimited(s: &str, open: char, close: char) -> Option<String> {
    let close_idx = s.rfind(close)?;
    let open_idx = s[..close_idx].rfind(open)?;
    Some(s[open_idx + 1..close_idx].to_string())
}

/// Final path component of `url` with a trailing `.git` stripped, for use
/// as the default clone destination when the caller gives none.
pub fn default_destination(url: &str) -> String {
    let trimmed = url.trim_end_matches('/');
    let last = if let Ok(parsed) = url::Url::parse(trimmed) {
        parsed
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .map(str::to_string)
            .unwrap_or_else(|| trimmed.to_string())
    } else {
        trimmed
            .rsplit(['/', ':'])
            .next()
            .unwrap_or(trimmed)
            .to_string()
    };
    last.strip_suffix(".git").unwrap_or(&last).to_string()
}

fn split_scp_scheme(url: &str) -> Option<(usize, usize)> {
    let at = url.find('@');
    let colon = url.find(':');
    match (at, colon) {
        (Some(at_pos), Some(colon_pos)) if at_pos < colon_pos => Some((at_pos, colon_pos)),
        _ => None,
    }
}

fn is_scp_scheme(url: &str) -> bool {
    split_scp_scheme(url).is_some()
}

/// Returns `true` if `url` names a local filesystem path rather than a
/// remote. Mirrors git's own notion of a local repository closely enough
/// for cache-key purposes: a `file://` URL, a relative/absolute path, or
/// any string that is neither a recognised URL nor an scp-like
/// `host:path` reference and happens to exist on disk.
pub fn is_local(url: &str) -> bool {
    if let Ok(parsed) = url::Url::parse(url) {
        parsed.scheme() == "file"
    } else {
        url.starts_with("./")
            || url.starts_with('/')
            || (!is_scp_scheme(url) && std::path::Path::new(url).exists())
    }
}
