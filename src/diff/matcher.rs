/// Outcome of matching two lists as multisets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Diff {
    /// Every element found a distinct partner.
    None,
    /// Only the second list has unpaired elements.
    Addition,
    /// The first list has unpaired elements and the second has a different number of them.
    Removal,
    /// Both lists have the same, non-zero number of unpaired elements.
    Change,
}

/// Pairs each element of `one` with a distinct, not yet used element of
/// `two` that `eq` accepts, and classifies what is left over on each side.
pub fn diff_list<T, U, F>(one: &[T], two: &[U], eq: F) -> Diff
where
    F: Fn(&T, &U) -> bool,
{
    let mut used = vec![false; two.len()];
    let mut unpaired_one = 0;
    for a in one {
        let partner = two
            .iter()
            .enumerate()
            .position(|(j, b)| !used[j] && eq(a, b));
        match partner {
            Some(j) => used[j] = true,
            None => unpaired_one += 1,
        }
    }
    let unpaired_two = used.iter().filter(|u| !**u).count();

    if unpaired_one > 0 && unpaired_one == unpaired_two {
        Diff::Change
    } else if unpaired_one > 0 {
        Diff::Removal
    } else if unpaired_two > 0 {
        Diff::Addition
    } else {
        Diff::None
    }
}

/// Multiset equality under `eq`.
pub fn lists_equal<T, U, F>(one: &[T], two: &[U], eq: F) -> bool
where
    F: Fn(&T, &U) -> bool,
{
    one.len() == two.len() && diff_list(one, two, eq) == Diff::None
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_classifies_leftovers() {
        let eq = |a: &&str, b: &&str| a == b;
        assert_eq!(diff_list(&["a", "b"], &["b", "a"], eq), Diff::None);
        assert_eq!(diff_list(&["a"], &["a", "b"], eq), Diff::Addition);
        assert_eq!(diff_list(&["a", "b"], &["a"], eq), Diff::Removal);
        assert_eq!(diff_list(&["a", "b"], &["a", "c"], eq), Diff::Change);
        assert_eq!(diff_list::<&str, &str, _>(&[], &[], eq), Diff::None);
    }

    #[test]
    fn test_each_partner_used_once() {
        let eq = |a: &i32, b: &i32| a == b;
        assert_eq!(diff_list(&[1, 1], &[1], eq), Diff::Removal);
        assert_eq!(diff_list(&[1], &[1, 1], eq), Diff::Addition);
        assert!(!lists_equal(&[1, 1, 2], &[1, 2, 2], eq));
    }

    proptest! {
        #[test]
        fn prop_permutation_is_equal(values in proptest::collection::vec(0u8..8, 0..12), seed in any::<u64>()) {
            let mut shuffled = values.clone();
            // Deterministic rotation plus reversal stands in for a shuffle.
            if !shuffled.is_empty() {
                let k = (seed as usize) % shuffled.len();
                shuffled.rotate_left(k);
            }
            if seed % 2 == 0 {
                shuffled.reverse();
            }
            prop_assert!(lists_equal(&values, &shuffled, |a, b| a == b));
        }

        #[test]
        fn prop_one_extra_element_is_unequal(values in proptest::collection::vec(0u8..8, 0..12), extra in 0u8..8) {
            let mut longer = values.clone();
            longer.push(extra);
            prop_assert!(!lists_equal(&values, &longer, |a, b| a == b));
            prop_assert_eq!(diff_list(&values, &longer, |a, b| a == b), Diff::Addition);
        }

        #[test]
        fn prop_one_replaced_element_is_unequal(values in proptest::collection::vec(0u8..8, 1..12), at in any::<usize>()) {
            let mut changed = values.clone();
            let i = at % changed.len();
            changed[i] = 100;
            prop_assert_eq!(diff_list(&values, &changed, |a, b| a == b), Diff::Change);
        }
    }
}
