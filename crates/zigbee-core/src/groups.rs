//! Group table
//!
//! A group is a 16-bit multicast id with a name and a membership of
//! (device, endpoint) pairs. Members are composite keys, not references, so
//! removing an endpoint simply cascades its memberships out.

use dashmap::DashMap;
use std::collections::BTreeSet;
use zigbee_wire::Eui64;

#[derive(Debug, Clone)]
pub struct Group {
    pub group_id: u16,
    pub name: String,
    pub members: BTreeSet<(Eui64, u8)>,
}

impl Group {
    #[must_use]
    pub fn new(group_id: u16, name: impl Into<String>) -> Self {
        Self {
            group_id,
            name: name.into(),
            members: BTreeSet::new(),
        }
    }
}

/// All known groups, keyed by group id
#[derive(Debug, Default)]
pub struct Groups {
    groups: DashMap<u16, Group>,
}

impl Groups {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a group if absent; returns true when it was created
    pub fn add_group(&self, group_id: u16, name: Option<String>) -> bool {
        if self.groups.contains_key(&group_id) {
            return false;
        }
        let name = name.unwrap_or_else(|| format!("Group {group_id:#06x}"));
        self.groups.insert(group_id, Group::new(group_id, name));
        true
    }

    pub fn remove_group(&self, group_id: u16) -> Option<Group> {
        self.groups.remove(&group_id).map(|(_, group)| group)
    }

    /// Add a member; returns true when membership changed
    pub fn add_member(&self, group_id: u16, ieee: Eui64, endpoint: u8) -> bool {
        match self.groups.get_mut(&group_id) {
            Some(mut group) => group.members.insert((ieee, endpoint)),
            None => false,
        }
    }

    /// Remove a member; returns true when membership changed
    pub fn remove_member(&self, group_id: u16, ieee: Eui64, endpoint: u8) -> bool {
        match self.groups.get_mut(&group_id) {
            Some(mut group) => group.members.remove(&(ieee, endpoint)),
            None => false,
        }
    }

    /// Cascade out every membership of a removed device. Returns the group
    /// ids that lost members.
    pub fn remove_device(&self, ieee: Eui64) -> Vec<(u16, u8)> {
        let mut removed = Vec::new();
        for mut entry in self.groups.iter_mut() {
            let group_id = entry.group_id;
            let members: Vec<(Eui64, u8)> = entry
                .members
                .iter()
                .filter(|(member_ieee, _)| *member_ieee == ieee)
                .copied()
                .collect();
            for member in members {
                entry.members.remove(&member);
                removed.push((group_id, member.1));
            }
        }
        removed
    }

    #[must_use]
    pub fn get(&self, group_id: u16) -> Option<Group> {
        self.groups.get(&group_id).map(|g| g.clone())
    }

    #[must_use]
    pub fn all(&self) -> Vec<Group> {
        self.groups.iter().map(|g| g.clone()).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_lifecycle() {
        let groups = Groups::new();
        let ieee: Eui64 = "00:11:22:33:44:55:66:77".parse().unwrap();

        assert!(groups.add_group(0x0001, Some("Living room".into())));
        assert!(!groups.add_group(0x0001, None));

        assert!(groups.add_member(0x0001, ieee, 1));
        assert!(!groups.add_member(0x0001, ieee, 1));
        assert!(groups.add_member(0x0001, ieee, 2));

        let removed = groups.remove_device(ieee);
        assert_eq!(removed.len(), 2);
        assert!(groups.get(0x0001).unwrap().members.is_empty());
    }

    #[test]
    fn test_member_of_missing_group() {
        let groups = Groups::new();
        let ieee: Eui64 = "00:11:22:33:44:55:66:77".parse().unwrap();
        assert!(!groups.add_member(0x0F00, ieee, 1));
    }
}
