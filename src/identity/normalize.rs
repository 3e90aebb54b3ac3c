//! Name normalization and slug derivation for canonical entities.
//!
//! The normalized form is the matching key: case-folded with every
//! non-alphanumeric character removed, so "The-Beatles " and "the beatles"
//! collapse onto the same canonical entity. Slugs are the readable ids
//! given to ghost entities created from report strings.

/// Normalize a raw source name into its matching key.
///
/// Lowercases (Unicode-aware) and strips everything that is not a letter
/// or digit. Returns an empty string for names with no usable characters;
/// callers treat that as unresolvable.
pub fn normalize_name(raw: &str) -> String {
    raw.chars()
        .flat_map(|c| c.to_lowercase())
        .filter(|c| c.is_alphanumeric())
        .collect()
}

/// Derive a URL-safe slug from a raw name.
///
/// Runs of non-alphanumeric characters become single dashes. The result is
/// never empty; names with no usable characters fall back to "unknown".
pub fn slug_from_name(raw: &str) -> String {
    let mut slug = String::with_capacity(raw.len());
    let mut pending_dash = false;
    for c in raw.chars().flat_map(|c| c.to_lowercase()) {
        if c.is_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c);
        } else {
            pending_dash = true;
        }
    }
    if slug.is_empty() {
        slug.push_str("unknown");
    }
    slug
}
