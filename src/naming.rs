//! Collision-resistant resource names.

use std::sync::LazyLock;

use regex::Regex;

/// Prefix shared by every generated name, so leftovers are easy to spot.
pub const NAME_PREFIX: &str = "pytest";

static NON_WORD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\W").expect("valid regex"));

/// Generate `pytest[_<base>]_<16 hex digits>` from 64 random bits.
pub fn random_name(base: Option<&str>) -> String {
    let suffix: u64 = rand::random();
    match base {
        Some(base) => format!("{NAME_PREFIX}_{base}_{suffix:016x}"),
        None => format!("{NAME_PREFIX}_{suffix:016x}"),
    }
}

/// `desired` when the caller supplied one, otherwise [`random_name`] of `base`.
pub fn desired_or_random(desired: &str, base: Option<&str>) -> String {
    if desired.is_empty() {
        random_name(base)
    } else {
        desired.to_string()
    }
}

/// Replace every non-word character with `_`.
pub fn sanitize_token(name: &str) -> String {
    NON_WORD.replace_all(name, "_").into_owned()
}
