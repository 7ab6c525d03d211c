use std::collections::HashSet;

/// A set of names used to filter lists, in one of two polarities.
///
/// An include set matches only its members, an exclude set matches
/// everything except its members. Either kind built from an empty list
/// matches everything, so an absent filter never filters anything out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterSet {
    set: HashSet<String>,
    is_exclude: bool,
    always_matches: bool,
}

impl FilterSet {
    pub fn new_include<S: AsRef<str>>(list: &[S]) -> Self {
        FilterSet {
            set: list.iter().map(|s| s.as_ref().to_string()).collect(),
            is_exclude: false,
            always_matches: list.is_empty(),
        }
    }

    pub fn new_exclude<S: AsRef<str>>(list: &[S]) -> Self {
        FilterSet {
            is_exclude: true,
            ..FilterSet::new_include(list)
        }
    }

    /// Include-polarity set that never degrades to "match everything": an
    /// empty membership set matches nothing.
    pub fn membership<S: AsRef<str>>(list: &[S]) -> Self {
        FilterSet {
            always_matches: false,
            ..FilterSet::new_include(list)
        }
    }

    /// Include list wins whenever it is non-empty.
    pub fn from_lists<S: AsRef<str>>(include: &[S], exclude: &[S]) -> Self {
        if !include.is_empty() {
            FilterSet::new_include(include)
        } else {
            FilterSet::new_exclude(exclude)
        }
    }

    pub fn matches_filter(&self, item: &str) -> bool {
        if self.always_matches {
            return true;
        }
        let matches = self.set.contains(item);
        if self.is_exclude { !matches } else { matches }
    }

    pub fn is_exclude(&self) -> bool {
        self.is_exclude
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_include_set() {
        let set = FilterSet::new_include(&["a", "b"]);
        assert!(set.matches_filter("a"));
        assert!(!set.matches_filter("c"));
        assert!(!set.is_exclude());
    }

    #[test]
    fn test_exclude_set() {
        let set = FilterSet::new_exclude(&["a"]);
        assert!(!set.matches_filter("a"));
        assert!(set.matches_filter("c"));
        assert!(set.is_exclude());
    }

    #[test]
    fn test_empty_sets_match_everything() {
        let empty: [&str; 0] = [];
        assert!(FilterSet::new_include(&empty).matches_filter("anything"));
        assert!(FilterSet::new_exclude(&empty).matches_filter("anything"));
    }

    #[test]
    fn test_empty_membership_matches_nothing() {
        let empty: [&str; 0] = [];
        let set = FilterSet::membership(&empty);
        assert!(!set.matches_filter("anything"));
    }

    #[test]
    fn test_from_lists_prefers_include() {
        let set = FilterSet::from_lists(&["a"], &["a"]);
        assert!(!set.is_exclude());
        assert!(set.matches_filter("a"));
        let none: [&str; 0] = [];
        let set = FilterSet::from_lists(&none, &["a"]);
        assert!(set.is_exclude());
    }
}
