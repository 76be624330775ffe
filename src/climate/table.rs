use serde_json::Value;

use super::{DpWrite, Snapshot};

/// One named mode or preset, defined by the DP values that identify it.
///
/// The set is an ordered list, not a map: encode writes are issued in
/// declared order, and matching walks entries as declared.
#[derive(Debug, Clone, PartialEq)]
pub struct ModeRule {
    pub name: String,
    pub set: Vec<(u32, Value)>,
}

impl ModeRule {
    pub fn new(name: impl Into<String>, set: Vec<(u32, Value)>) -> Self {
        Self {
            name: name.into(),
            set,
        }
    }

    /// True when every (dp, value) pair is present in the snapshot with an
    /// equal value. A type mismatch (string "1" vs bool true) is a plain
    /// non-match, never an error.
    fn matches(&self, snapshot: &Snapshot) -> bool {
        self.set
            .iter()
            .all(|(dp_id, expected)| snapshot.get(dp_id) == Some(expected))
    }
}

/// Ordered table of mode or preset rules.
///
/// Order is meaningful: when overlapping rules both match a snapshot, the
/// last match in table order wins. Rules are not required to be mutually
/// exclusive; the tie-break is deterministic, not an error.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModeTable {
    rules: Vec<ModeRule>,
}

impl ModeTable {
    pub fn new(rules: Vec<ModeRule>) -> Self {
        Self { rules }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.rules.iter().map(|rule| rule.name.as_str())
    }

    /// Decode: the name of the last rule whose full set is contained in the
    /// snapshot. Every rule is checked; matching does not short-circuit.
    pub fn resolve(&self, snapshot: &Snapshot) -> Option<&str> {
        let mut found = None;
        for rule in &self.rules {
            if rule.matches(snapshot) {
                found = Some(rule.name.as_str());
            }
        }
        found
    }

    /// Encode: the ordered DP writes that realize the named rule, or None
    /// when the name is not in the table.
    pub fn plan(&self, name: &str) -> Option<Vec<DpWrite>> {
        self.rules.iter().find(|rule| rule.name == name).map(|rule| {
            rule.set
                .iter()
                .map(|(dp_id, value)| DpWrite {
                    dp_id: *dp_id,
                    value: value.clone(),
                })
                .collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn mode_table() -> ModeTable {
        ModeTable::new(vec![
            ModeRule::new("off", vec![(1, json!(false))]),
            ModeRule::new("heat", vec![(1, json!(true)), (4, json!("1"))]),
            ModeRule::new("auto", vec![(1, json!(true)), (4, json!("0"))]),
        ])
    }

    #[test]
    fn resolves_unique_full_match() {
        let snapshot = Snapshot::from([(1, json!(true)), (4, json!("0"))]);
        assert_eq!(mode_table().resolve(&snapshot), Some("auto"));
    }

    #[test]
    fn extra_keys_are_tolerated() {
        let snapshot = Snapshot::from([
            (1, json!(false)),
            (9, json!("unrelated")),
            (12, json!(250)),
        ]);
        assert_eq!(mode_table().resolve(&snapshot), Some("off"));
    }

    #[test]
    fn no_match_resolves_to_none() {
        let snapshot = Snapshot::from([(4, json!("1"))]);
        assert_eq!(mode_table().resolve(&snapshot), None);
    }

    #[test]
    fn type_mismatch_is_a_non_match() {
        // DP 1 reports string "false", table expects bool false.
        let snapshot = Snapshot::from([(1, json!("false"))]);
        assert_eq!(mode_table().resolve(&snapshot), None);
    }

    #[test]
    fn overlapping_rules_resolve_to_last_match() {
        let table = ModeTable::new(vec![
            ModeRule::new("on", vec![(1, json!(true))]),
            ModeRule::new("boost", vec![(1, json!(true)), (2, json!(true))]),
        ]);
        let snapshot = Snapshot::from([(1, json!(true)), (2, json!(true))]);
        assert_eq!(table.resolve(&snapshot), Some("boost"));
    }

    #[test]
    fn plan_preserves_declared_order() {
        let plan = mode_table().plan("heat").unwrap();
        assert_eq!(
            plan,
            vec![
                DpWrite {
                    dp_id: 1,
                    value: json!(true)
                },
                DpWrite {
                    dp_id: 4,
                    value: json!("1")
                },
            ]
        );
    }

    #[test]
    fn plan_unknown_name_is_none() {
        assert_eq!(mode_table().plan("cool"), None);
    }
}
