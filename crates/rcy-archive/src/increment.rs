//! Increment numbering of result files
//!
//! Solvers embed an increment number in the names of the files they write,
//! `<base>_<inc>.<ext>`. Nothing central records these numbers; they are
//! recovered from file listings with the pure functions in this module.

use std::cmp::Ordering;
use std::path::Path;

/// File category of a result file (its extension, without the dot)
///
/// Files without an extension belong to the empty category.
#[inline]
#[must_use]
pub fn category_of(file_name: &str) -> &str {
    Path::new(file_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or("")
}

/// Increment number embedded in a file name, if any
///
/// # Examples
/// - `part1_003.frs` → `Some(3)`
/// - `part1_fpp_012.fpp` → `Some(12)`
/// - `part1.frs` → `None`
#[must_use]
pub fn increment_of(file_name: &str) -> Option<u32> {
    let name = Path::new(file_name).file_name()?.to_str()?;
    let stem = match name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => name,
    };
    let (_, digits) = stem.rsplit_once('_')?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Order two file names by increment, then lexicographically
///
/// Names without an increment sort as increment zero.
#[must_use]
pub fn compare_increments(a: &str, b: &str) -> Ordering {
    let ka = increment_of(a).unwrap_or(0);
    let kb = increment_of(b).unwrap_or(0);
    ka.cmp(&kb).then_with(|| a.cmp(b))
}

/// Select the latest increment of `category` among `names`
///
/// Returns `None` if no name belongs to the category.
pub fn latest<'a, I>(names: I, category: &str) -> Option<&'a str>
where
    I: IntoIterator<Item = &'a str>,
{
    names
        .into_iter()
        .filter(|name| category_of(name) == category)
        .max_by(|a, b| compare_increments(a, b))
}

/// Next free increment number for `category` among `names`
///
/// Starts at 1 when no numbered file of the category exists.
pub fn next_increment<'a, I>(names: I, category: &str) -> u32
where
    I: IntoIterator<Item = &'a str>,
{
    names
        .into_iter()
        .filter(|name| category_of(name) == category)
        .filter_map(increment_of)
        .max()
        .map_or(1, |highest| highest.saturating_add(1))
}

/// Compose a numbered file name, `<base>_<inc:03>.<ext>`
#[inline]
#[must_use]
pub fn numbered_file_name(base: &str, increment: u32, category: &str) -> String {
    format!("{base}_{increment:03}.{category}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn increment_parsing() {
        assert_eq!(increment_of("part1_003.frs"), Some(3));
        assert_eq!(increment_of("part1_fpp_012.fpp"), Some(12));
        assert_eq!(increment_of("dir/th_p_7.frs"), Some(7));
        assert_eq!(increment_of("part1.frs"), None);
        assert_eq!(increment_of("part_a.frs"), None);
        assert_eq!(increment_of("_.frs"), None);
    }

    #[test]
    fn category_is_extension() {
        assert_eq!(category_of("part1_003.frs"), "frs");
        assert_eq!(category_of("fedem_solver.fsi"), "fsi");
        assert_eq!(category_of("README"), "");
    }

    #[test]
    fn latest_compares_numerically() {
        let names = ["part1_009.frs", "part1_010.frs", "part1_2.frs", "part1_011.fpp"];
        assert_eq!(latest(names, "frs"), Some("part1_010.frs"));
        assert_eq!(latest(names, "fpp"), Some("part1_011.fpp"));
        assert_eq!(latest(names, "res"), None);
    }

    #[test]
    fn latest_prefers_numbered_over_plain() {
        let names = ["part1.frs", "part1_001.frs"];
        assert_eq!(latest(names, "frs"), Some("part1_001.frs"));
    }

    #[test]
    fn next_increment_starts_at_one() {
        assert_eq!(next_increment(Vec::<&str>::new(), "frs"), 1);
        assert_eq!(next_increment(["fedem_stress.fco"], "frs"), 1);
        assert_eq!(next_increment(["a_001.frs", "a_004.frs", "a_009.res"], "frs"), 5);
    }

    #[test]
    fn numbered_names_round_trip() {
        let name = numbered_file_name("part1_fpp", 12, "fpp");
        assert_eq!(name, "part1_fpp_012.fpp");
        assert_eq!(increment_of(&name), Some(12));
    }

    proptest! {
        #[test]
        fn latest_is_highest_increment(incs in proptest::collection::btree_set(0u32..5000, 1..20)) {
            let names: Vec<String> = incs
                .iter()
                .map(|i| numbered_file_name("part", *i, "frs"))
                .collect();
            let highest = *incs.iter().max().unwrap();
            let chosen = latest(names.iter().map(String::as_str), "frs").unwrap();
            prop_assert_eq!(increment_of(chosen), Some(highest));
            prop_assert_eq!(next_increment(names.iter().map(String::as_str), "frs"), highest + 1);
        }
    }
}
