//! Property-based tests for manifest preprocessing and path sanitising.

#[cfg(test)]
mod proptest_tests {
    use crate::manifest::preprocess;
    use crate::path::{
        encode_url_path, is_contained, is_valid_environment_name, normalize_environment_name,
    };
    use proptest::prelude::*;
    use std::path::PathBuf;

    // Quote-free lines, so comment stripping cannot depend on how lines are
    // joined.
    fn manifest_lines() -> impl Strategy<Value = Vec<String>> {
        prop::collection::vec("[a-z0-9 :=>,#]{0,24}", 0..12)
    }

    // ============================================================================
    // preprocess property tests
    // ============================================================================

    proptest! {
        /// Property: preprocessing its own output changes nothing
        #[test]
        fn preprocess_is_idempotent(lines in manifest_lines()) {
            let content = lines.join("\n");
            if let Ok(first) = preprocess(&content, "Puppetfile") {
                let joined = first
                    .iter()
                    .map(|l| l.text.as_str())
                    .collect::<Vec<_>>()
                    .join("\n");
                let second = preprocess(&joined, "Puppetfile").unwrap();
                let first_texts: Vec<_> = first.iter().map(|l| l.text.clone()).collect();
                let second_texts: Vec<_> = second.iter().map(|l| l.text.clone()).collect();
                prop_assert_eq!(first_texts, second_texts);
            }
        }

        /// Property: logical lines are trimmed, non-empty and complete
        #[test]
        fn preprocess_emits_complete_lines(lines in manifest_lines()) {
            let content = lines.join("\n");
            if let Ok(logical) = preprocess(&content, "Puppetfile") {
                let mut previous = 0;
                for line in &logical {
                    prop_assert!(!line.text.is_empty());
                    prop_assert_eq!(line.text.trim(), line.text.as_str());
                    prop_assert!(!line.text.ends_with(','));
                    prop_assert!(!line.text.contains('#'));
                    prop_assert!(line.line > previous);
                    previous = line.line;
                }
            }
        }
    }

    // ============================================================================
    // Path sanitising property tests
    // ============================================================================

    proptest! {
        /// Property: encode_url_path never produces filesystem-unsafe characters
        #[test]
        fn encode_url_path_never_produces_unsafe_chars(input in ".*") {
            let result = encode_url_path(&input);
            let unsafe_chars = ['/', '\\', ':', '*', '?', '"', '<', '>', '|'];
            for ch in unsafe_chars {
                prop_assert!(
                    !result.contains(ch),
                    "encode_url_path produced unsafe character '{}' from input '{}'",
                    ch,
                    input
                );
            }
        }

        /// Property: encode_url_path replaces characters 1:1
        #[test]
        fn encode_url_path_preserves_char_count(input in ".+") {
            let result = encode_url_path(&input);
            prop_assert_eq!(result.chars().count(), input.chars().count());
        }

        /// Property: normalized branch names are always usable as environments
        #[test]
        fn normalized_names_are_valid(input in ".+") {
            let normalized = normalize_environment_name(&input);
            prop_assert!(is_valid_environment_name(&normalized));
        }

        /// Property: valid names survive normalization unchanged
        #[test]
        fn normalize_keeps_valid_names(input in "[A-Za-z0-9_]{1,30}") {
            prop_assert_eq!(normalize_environment_name(&input), input);
        }

        /// Property: any parent component escapes containment
        #[test]
        fn parent_components_are_never_contained(
            before in prop::collection::vec("[a-z]{1,8}", 0..4),
            after in prop::collection::vec("[a-z]{1,8}", 0..4),
        ) {
            let mut path = PathBuf::new();
            for part in &before {
                path.push(part);
            }
            path.push("..");
            for part in &after {
                path.push(part);
            }
            prop_assert!(!is_contained(&path));
        }

        /// Property: plain relative paths are contained
        #[test]
        fn plain_relative_paths_are_contained(
            parts in prop::collection::vec("[a-z0-9_.-]{1,8}", 1..5),
        ) {
            prop_assume!(parts.iter().all(|p| p != "." && p != ".."));
            let path: PathBuf = parts.iter().collect();
            prop_assert!(is_contained(&path));
        }
    }
}
