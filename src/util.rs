//! Shared utility functions for the shipwright crate.

/// Derive a repository/project name from a human-readable name.
///
/// Lower-cases ASCII letters and digits and collapses every other run of
/// characters into a single hyphen. Returns `"project"` if nothing is left.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_hyphen = false;
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_hyphen && !slug.is_empty() {
                slug.push('-');
            }
            pending_hyphen = false;
            slug.push(ch.to_ascii_lowercase());
        } else {
            pending_hyphen = true;
        }
    }
    if slug.is_empty() {
        "project".to_string()
    } else {
        slug
    }
}

/// Keep at most `limit` bytes of command output.
///
/// The tail is kept since failures are reported last; a marker records how
/// much was dropped.
pub fn truncate_output(output: &str, limit: usize) -> String {
    if output.len() <= limit {
        return output.to_string();
    }
    let mut cut = output.len() - limit;
    while !output.is_char_boundary(cut) {
        cut += 1;
    }
    format!("[truncated {} bytes]\n{}", cut, &output[cut..])
}
