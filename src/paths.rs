// src/paths.rs

//! Destination naming for downloads.

use std::path::{Path, PathBuf};

const FALLBACK_FILENAME: &str = "download";
const MAX_FILENAME_BYTES: usize = 200;
const PARTIAL_SUFFIX: &str = ".part";

/// Returns the path of the in-progress file for a destination,
/// e.g. `/path/to/file.zip` becomes `/path/to/file.zip.part`.
pub fn partial_path(destination: &Path) -> PathBuf {
    let mut name = destination.as_os_str().to_owned();
    name.push(PARTIAL_SUFFIX);
    PathBuf::from(name)
}

/// Stems Windows refuses as file names, whatever the extension.
const WINDOWS_RESERVED: [&str; 22] = [
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Makes a filename safe to create on any common filesystem.
pub fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let trimmed = cleaned.trim().trim_matches('.').trim();

    if trimmed.is_empty() {
        return FALLBACK_FILENAME.to_string();
    }

    let stem = trimmed.split('.').next().unwrap_or(trimmed).trim_end();
    let name = if WINDOWS_RESERVED.contains(&stem.to_ascii_uppercase().as_str()) {
        format!("_{}", trimmed)
    } else {
        trimmed.to_string()
    };
    truncate_keeping_extension(&name, MAX_FILENAME_BYTES)
}

/// Shortens the stem so the whole name fits in `max` bytes; the extension
/// survives unless it alone is too long.
fn truncate_keeping_extension(name: &str, max: usize) -> String {
    if name.len() <= max {
        return name.to_string();
    }
    match split_extension(name) {
        (stem, Some(ext)) if ext.len() + 1 < max => {
            let stem = truncate_to_boundary(stem, max - ext.len() - 1);
            format!("{}.{}", stem, ext)
        }
        _ => truncate_to_boundary(name, max).to_string(),
    }
}

fn truncate_to_boundary(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Last non-empty path segment of a URL, without query or fragment.
pub fn filename_from_url(url: &str) -> Option<String> {
    let parsed = reqwest::Url::parse(url).ok()?;
    let segment = parsed.path_segments()?.filter(|s| !s.is_empty()).last()?;
    let decoded = percent_encoding::percent_decode_str(segment)
        .decode_utf8_lossy()
        .into_owned();
    Some(decoded)
}

/// Picks `dir/filename`, or `dir/stem (n).ext` when that name is taken.
///
/// `is_taken` decides whether a candidate is already claimed, either by a
/// live session or by a file on disk.
pub fn unique_destination(dir: &Path, filename: &str, is_taken: impl Fn(&Path) -> bool) -> PathBuf {
    let candidate = dir.join(filename);
    if !is_taken(&candidate) {
        return candidate;
    }

    let (stem, ext) = split_extension(filename);
    let mut n = 1u32;
    loop {
        let name = match ext {
            Some(ext) => format!("{stem} ({n}).{ext}"),
            None => format!("{stem} ({n})"),
        };
        let candidate = dir.join(name);
        if !is_taken(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

fn split_extension(filename: &str) -> (&str, Option<&str>) {
    match filename.rfind('.') {
        Some(0) | None => (filename, None),
        Some(idx) => (&filename[..idx], Some(&filename[idx + 1..])),
    }
}

/// True when either the finished file or its partial counterpart exists.
pub fn occupied_on_disk(candidate: &Path) -> bool {
    candidate.exists() || partial_path(candidate).exists()
}
