use serde::{Deserialize, Serialize};

use crate::segmentation::LabelMap;

/// Named, ordered label groups. A label belongs to at most one group.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Groups {
    entries: Vec<(String, Vec<u32>)>,
}

impl Groups {
    pub const BRIGHT: &'static str = "bright";
    pub const STREAKS: &'static str = "streaks";

    /// Assign `labels` to group `name`, replacing its members and removing
    /// the labels from every other group. Empty groups are dropped.
    pub fn set(&mut self, name: &str, labels: Vec<u32>) {
        for (other, members) in self.entries.iter_mut() {
            if other != name {
                members.retain(|l| !labels.contains(l));
            }
        }
        match self.entries.iter_mut().find(|(n, _)| n == name) {
            Some((_, members)) => *members = labels,
            None => self.entries.push((name.to_string(), labels)),
        }
        self.entries.retain(|(_, m)| !m.is_empty());
    }

    /// Members of `name`; empty when the group does not exist.
    pub fn get(&self, name: &str) -> &[u32] {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, m)| m.as_slice())
            .unwrap_or(&[])
    }

    pub fn bright(&self) -> &[u32] {
        self.get(Self::BRIGHT)
    }

    pub fn streaks(&self) -> &[u32] {
        self.get(Self::STREAKS)
    }

    /// Group owning `label`.
    pub fn group_of(&self, label: u32) -> Option<&str> {
        self.entries
            .iter()
            .find(|(_, m)| m.contains(&label))
            .map(|(n, _)| n.as_str())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u32])> {
        self.entries.iter().map(|(n, m)| (n.as_str(), m.as_slice()))
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Rewrite labels through `map`.
    pub fn remap(&mut self, map: &LabelMap) {
        for (_, members) in self.entries.iter_mut() {
            *members = map.apply(members);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_membership_unique() {
        let mut g = Groups::default();
        g.set("tier0", vec![1, 2, 3]);
        g.set(Groups::BRIGHT, vec![1]);
        assert_eq!(g.get("tier0"), &[2, 3]);
        assert_eq!(g.group_of(1), Some(Groups::BRIGHT));
        g.set(Groups::BRIGHT, vec![2, 3]);
        assert!(g.get("tier0").is_empty());
        assert_eq!(g.names().collect::<Vec<_>>(), vec![Groups::BRIGHT]);
    }
}
