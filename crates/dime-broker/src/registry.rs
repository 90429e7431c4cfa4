use indexmap::{IndexMap, IndexSet};
use mio::Token;

use crate::client::ClientState;

/// Group membership, keyed by group name.
///
/// Kept separate from `ClientState` so lookups by name (`send`, `broadcast`,
/// `devices`) don't need to scan every client. Each client mirrors its own
/// membership set in `ClientState::groups` so leave-on-disconnect doesn't
/// need to scan every group either.
#[derive(Default)]
pub struct GroupRegistry {
    members: IndexMap<String, IndexSet<Token>>,
}

impl GroupRegistry {
    pub fn join(&mut self, token: Token, client: &mut ClientState, names: impl IntoIterator<Item = String>) {
        for name in names {
            self.members.entry(name.clone()).or_default().insert(token);
            client.groups.insert(name);
        }
    }

    pub fn leave(&mut self, token: Token, client: &mut ClientState, names: impl IntoIterator<Item = String>) {
        for name in names {
            if let Some(set) = self.members.get_mut(&name) {
                set.shift_remove(&token);
            }
            client.groups.remove(&name);
        }
    }

    /// Removes `token` from every group it belongs to. Called once on
    /// disconnect; groups with no remaining members are left in place
    /// (empty) rather than deleted, matching [`list_nonempty`] filtering
    /// them out instead of forgetting they ever existed.
    pub fn leave_all(&mut self, token: Token, client: &mut ClientState) {
        for name in client.groups.drain() {
            if let Some(set) = self.members.get_mut(&name) {
                set.shift_remove(&token);
            }
        }
    }

    /// Group names with at least one member, in first-joined order.
    pub fn list_nonempty(&self) -> Vec<String> {
        self.members.iter().filter(|(_, set)| !set.is_empty()).map(|(name, _)| name.clone()).collect()
    }

    pub fn members(&self, name: &str) -> impl Iterator<Item = Token> + '_ {
        self.members.get(name).into_iter().flat_map(|set| set.iter().copied())
    }

    pub fn has_members(&self, name: &str) -> bool {
        self.members.get(name).is_some_and(|set| !set.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> ClientState {
        ClientState::new()
    }

    #[test]
    fn join_then_leave_clears_both_directions() {
        let mut reg = GroupRegistry::default();
        let mut c = client();
        let t = Token(1);

        reg.join(t, &mut c, ["room-a".to_owned(), "room-b".to_owned()]);
        assert_eq!(reg.members("room-a").collect::<Vec<_>>(), vec![t]);
        assert!(c.groups.contains("room-b"));

        reg.leave(t, &mut c, ["room-a".to_owned()]);
        assert_eq!(reg.members("room-a").count(), 0);
        assert!(!c.groups.contains("room-a"));
        assert!(c.groups.contains("room-b"));
    }

    #[test]
    fn leave_all_empties_every_membership() {
        let mut reg = GroupRegistry::default();
        let mut c = client();
        let t = Token(7);
        reg.join(t, &mut c, ["a".to_owned(), "b".to_owned()]);

        reg.leave_all(t, &mut c);

        assert!(c.groups.is_empty());
        assert_eq!(reg.members("a").count(), 0);
        assert_eq!(reg.members("b").count(), 0);
    }

    #[test]
    fn empty_groups_are_excluded_from_list_nonempty_but_not_forgotten() {
        let mut reg = GroupRegistry::default();
        let mut c = client();
        let t = Token(3);
        reg.join(t, &mut c, ["solo".to_owned()]);
        assert_eq!(reg.list_nonempty(), vec!["solo".to_owned()]);

        reg.leave(t, &mut c, ["solo".to_owned()]);
        assert!(reg.list_nonempty().is_empty());
        assert!(!reg.has_members("solo"));
    }

    #[test]
    fn membership_order_is_join_order() {
        let mut reg = GroupRegistry::default();
        let mut a = client();
        let mut b = client();
        reg.join(Token(1), &mut a, ["room".to_owned()]);
        reg.join(Token(2), &mut b, ["room".to_owned()]);
        assert_eq!(reg.members("room").collect::<Vec<_>>(), vec![Token(1), Token(2)]);
    }
}
