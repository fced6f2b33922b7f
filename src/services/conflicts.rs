use crate::models::{Conflict, OverrideAction};
use indexmap::{IndexMap, IndexSet};

/// Find override destinations claimed by more than one distinct mod.
///
/// Destinations are compared case-insensitively. Conflicts are reported in the
/// order their destination was first seen, each with its mods in first-seen order.
pub fn detect_conflicts(overrides: &[OverrideAction]) -> Vec<Conflict> {
    let mut by_destination: IndexMap<String, (&OverrideAction, IndexSet<&str>)> = IndexMap::new();

    for action in overrides {
        let key = action.destination.as_str().to_lowercase();
        by_destination
            .entry(key)
            .or_insert_with(|| (action, IndexSet::new()))
            .1
            .insert(action.mod_name.as_str());
    }

    by_destination
        .into_values()
        .filter(|(_, mods)| mods.len() > 1)
        .map(|(first, mods)| Conflict {
            destination: first.destination.clone(),
            mods: mods.into_iter().map(str::to_string).collect(),
        })
        .collect()
}

/// Human-readable conflict report, one destination per line.
pub fn describe_conflicts(conflicts: &[Conflict]) -> String {
    conflicts
        .iter()
        .map(|c| format!("{}: {}", c.destination, c.mods.join(", ")))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;
    use proptest::prelude::*;

    fn over(mod_name: &str, dest: &str) -> OverrideAction {
        OverrideAction {
            source: Utf8PathBuf::from(format!("/mods/{}/src", mod_name)),
            destination: Utf8PathBuf::from(dest),
            mod_name: mod_name.to_string(),
        }
    }

    #[test]
    fn test_single_conflict_group() {
        let conflicts = detect_conflicts(&[
            over("A", "/game/X.png"),
            over("B", "/game/x.PNG"),
            over("C", "/game/Y.png"),
        ]);

        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].destination, Utf8PathBuf::from("/game/X.png"));
        assert_eq!(conflicts[0].mods, vec!["A".to_string(), "B".to_string()]);
    }

    #[test]
    fn test_same_mod_twice_is_not_a_conflict() {
        let conflicts = detect_conflicts(&[over("A", "/game/x"), over("A", "/game/x")]);
        assert!(conflicts.is_empty());
    }

    #[test]
    fn test_describe_conflicts() {
        let conflicts = detect_conflicts(&[over("A", "/g/x"), over("B", "/g/x")]);
        assert_eq!(describe_conflicts(&conflicts), "/g/x: A, B");
    }

    proptest! {
        #[test]
        fn prop_conflicts_need_two_distinct_mods(
            entries in prop::collection::vec((0usize..3, 0usize..4), 0..20)
        ) {
            let overrides: Vec<OverrideAction> = entries
                .iter()
                .map(|(m, d)| over(&format!("mod{}", m), &format!("/game/dest{}", d)))
                .collect();

            let conflicts = detect_conflicts(&overrides);

            for conflict in &conflicts {
                prop_assert!(conflict.mods.len() >= 2);
            }
            for d in 0..4 {
                let dest = format!("/game/dest{}", d);
                let distinct: IndexSet<&str> = overrides
                    .iter()
                    .filter(|o| o.destination.as_str() == dest)
                    .map(|o| o.mod_name.as_str())
                    .collect();
                let reported = conflicts.iter().any(|c| c.destination.as_str() == dest);
                prop_assert_eq!(reported, distinct.len() > 1);
            }
        }
    }
}
