//! Filename normalization shared by every component.
//!
//! Filenames are used as state keys, stream payloads and path components, so
//! they pass through [`sanitize_filename`] before any lookup or publish.

/// Replacement for path separators.
const SEPARATOR_REPLACEMENT: char = '-';

/// Sanitize a filename for use as a key and as a single path component.
///
/// This function:
/// 1. Removes null bytes
/// 2. Replaces `/` and `\` with `-`
/// 3. Trims leading/trailing whitespace
///
/// The result is stable under repeated application.
///
/// # Examples
///
/// ```
/// use stem_relay::utils::filename::sanitize_filename;
///
/// assert_eq!(sanitize_filename("a/b\\c\0 "), "a-b-c");
/// assert_eq!(sanitize_filename("  song.mp3 "), "song.mp3");
/// ```
pub fn sanitize_filename(input: &str) -> String {
    let replaced: String = input
        .chars()
        .filter(|&c| c != '\0')
        .map(|c| match c {
            '/' | '\\' => SEPARATOR_REPLACEMENT,
            other => other,
        })
        .collect();

    replaced.trim().to_string()
}
