use std::collections::hash_map;

use ahash::{AHashMap, AHashSet};
use cid::Cid;

use crate::message::{Priority, WantType};

/// A deduplicated list of wanted blocks and their priorities.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Wantlist {
    set: AHashMap<Cid, Entry>,
}

/// An entry in a wantlist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry {
    pub cid: Cid,
    pub priority: Priority,
    pub want_type: WantType,
}

impl Entry {
    pub fn new(cid: Cid, priority: Priority, want_type: WantType) -> Self {
        Entry {
            cid,
            priority,
            want_type,
        }
    }
}

impl Wantlist {
    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    pub fn clear(&mut self) {
        self.set.clear();
    }

    /// Adds an entry, returns `true` if the wantlist changed.
    ///
    /// A want-have never replaces a want-block.
    pub fn add(&mut self, cid: Cid, priority: Priority, want_type: WantType) -> bool {
        match self.set.entry(cid) {
            hash_map::Entry::Vacant(entry) => {
                entry.insert(Entry::new(cid, priority, want_type));
                true
            }
            hash_map::Entry::Occupied(mut entry) => {
                if entry.get().want_type == WantType::Block || want_type == WantType::Have {
                    return false;
                }
                entry.insert(Entry::new(cid, priority, want_type));
                true
            }
        }
    }

    pub fn remove(&mut self, cid: &Cid) -> Option<Entry> {
        self.set.remove(cid)
    }

    /// Removes the entry, unless a want-block would be removed by a want-have.
    pub fn remove_type(&mut self, cid: &Cid, want_type: WantType) -> Option<Entry> {
        match self.set.entry(*cid) {
            hash_map::Entry::Vacant(_) => None,
            hash_map::Entry::Occupied(entry) => {
                if entry.get().want_type == WantType::Block && want_type == WantType::Have {
                    return None;
                }
                Some(entry.remove())
            }
        }
    }

    pub fn get(&self, cid: &Cid) -> Option<&Entry> {
        self.set.get(cid)
    }

    pub fn contains(&self, cid: &Cid) -> bool {
        self.set.contains_key(cid)
    }

    pub fn cids(&self) -> impl Iterator<Item = &Cid> {
        self.set.keys()
    }

    /// Returns the entries, sorted descending by priority.
    pub fn entries(&self) -> Vec<Entry> {
        sorted(self.set.values().copied())
    }
}

/// A wantlist that remembers which sessions want each `Cid`.
///
/// A `Cid` only leaves the list once the last interested session removed it.
#[derive(Default, Debug, Clone)]
pub struct SessionTrackedWantlist {
    set: AHashMap<Cid, SessionTrackedEntry>,
}

#[derive(Debug, Clone)]
struct SessionTrackedEntry {
    entry: Entry,
    sessions: AHashSet<u64>,
}

impl SessionTrackedWantlist {
    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    /// Records the interest of `session`, returns `true` if the wantlist itself
    /// changed, i.e. the `Cid` is new or was upgraded to a want-block.
    pub fn add(&mut self, entry: Entry, session: u64) -> bool {
        match self.set.entry(entry.cid) {
            hash_map::Entry::Vacant(e) => {
                e.insert(SessionTrackedEntry {
                    entry,
                    sessions: std::iter::once(session).collect(),
                });
                true
            }
            hash_map::Entry::Occupied(mut e) => {
                let tracked = e.get_mut();
                tracked.sessions.insert(session);
                if tracked.entry.want_type == WantType::Have && entry.want_type == WantType::Block
                {
                    tracked.entry = entry;
                    return true;
                }
                false
            }
        }
    }

    /// Drops the interest of `session`, returns `true` if that removed the `Cid`.
    pub fn remove(&mut self, cid: &Cid, session: u64) -> bool {
        let hash_map::Entry::Occupied(mut e) = self.set.entry(*cid) else {
            return false;
        };
        e.get_mut().sessions.remove(&session);
        if e.get().sessions.is_empty() {
            e.remove();
            return true;
        }
        false
    }

    pub fn contains(&self, cid: &Cid) -> bool {
        self.set.contains_key(cid)
    }

    pub fn get(&self, cid: &Cid) -> Option<&Entry> {
        self.set.get(cid).map(|e| &e.entry)
    }

    /// The sessions currently interested in `cid`.
    pub fn sessions(&self, cid: &Cid) -> impl Iterator<Item = u64> + '_ {
        self.set
            .get(cid)
            .into_iter()
            .flat_map(|e| e.sessions.iter().copied())
    }

    pub fn cids(&self) -> impl Iterator<Item = &Cid> {
        self.set.keys()
    }

    /// Returns the entries, sorted descending by priority.
    pub fn entries(&self) -> Vec<Entry> {
        sorted(self.set.values().map(|e| e.entry))
    }

    /// Copies every entry and its sessions from `other` into this list.
    pub fn absorb(&mut self, other: &SessionTrackedWantlist) {
        for tracked in other.set.values() {
            for session in &tracked.sessions {
                self.add(tracked.entry, *session);
            }
        }
    }
}

fn sorted(entries: impl Iterator<Item = Entry>) -> Vec<Entry> {
    let mut entries: Vec<_> = entries.collect();
    entries.sort_by(|a, b| b.priority.cmp(&a.priority));
    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cids() -> Vec<Cid> {
        [
            "QmQL8LqkEgYXaDHdNYCG2mmpow7Sp8Z8Kt3QS688vyBeC7",
            "QmcBDsdjgSXU7BP4A4V8LJCXENE5xVwnhrhRGVTJr9YCVj",
            "QmQakgd2wDxc3uUF4orGdEm28zUT9Mmimp5pyPG2SFS9Gj",
        ]
        .into_iter()
        .map(|c| Cid::try_from(c).unwrap())
        .collect()
    }

    #[test]
    fn test_add_dedups() {
        let cids = test_cids();
        let mut wl = Wantlist::default();

        assert!(wl.add(cids[0], 5, WantType::Block));
        assert!(wl.add(cids[1], 4, WantType::Block));
        assert!(!wl.add(cids[1], 4, WantType::Block));
        assert_eq!(wl.len(), 2);

        assert!(wl.remove_type(&cids[0], WantType::Block).is_some());
        assert!(!wl.contains(&cids[0]));
        assert_eq!(wl.get(&cids[1]).unwrap().cid, cids[1]);
    }

    #[test]
    fn test_have_and_block_precedence() {
        let cids = test_cids();
        let mut wl = Wantlist::default();

        assert!(wl.add(cids[0], 5, WantType::Have));
        assert!(wl.add(cids[0], 5, WantType::Block));
        assert!(!wl.add(cids[0], 5, WantType::Have));
        assert_eq!(wl.get(&cids[0]).unwrap().want_type, WantType::Block);

        assert!(wl.remove_type(&cids[0], WantType::Have).is_none());
        assert_eq!(wl.len(), 1);
        assert!(wl.remove(&cids[0]).is_some());
        assert!(wl.is_empty());
    }

    #[test]
    fn test_entries_sorted_by_priority() {
        let cids = test_cids();
        let mut wl = Wantlist::default();
        wl.add(cids[0], 3, WantType::Block);
        wl.add(cids[1], 5, WantType::Have);
        wl.add(cids[2], 4, WantType::Have);

        let order: Vec<_> = wl.entries().into_iter().map(|e| e.cid).collect();
        assert_eq!(order, vec![cids[1], cids[2], cids[0]]);
    }

    #[test]
    fn test_session_tracked_removal_needs_all_sessions() {
        let cids = test_cids();
        let mut wl = SessionTrackedWantlist::default();

        assert!(wl.add(Entry::new(cids[0], 10, WantType::Block), 1));
        assert!(!wl.add(Entry::new(cids[0], 10, WantType::Block), 2));
        assert_eq!(wl.sessions(&cids[0]).count(), 2);

        assert!(!wl.remove(&cids[0], 1));
        assert!(wl.contains(&cids[0]));
        // unknown session does nothing
        assert!(!wl.remove(&cids[0], 7));
        assert!(wl.remove(&cids[0], 2));
        assert!(wl.is_empty());
        assert!(!wl.remove(&cids[0], 2));
    }

    #[test]
    fn test_session_tracked_upgrade() {
        let cids = test_cids();
        let mut wl = SessionTrackedWantlist::default();

        assert!(wl.add(Entry::new(cids[0], 1, WantType::Have), 1));
        assert!(wl.add(Entry::new(cids[0], 1, WantType::Block), 1));
        assert!(!wl.add(Entry::new(cids[0], 1, WantType::Have), 2));
        assert_eq!(wl.get(&cids[0]).unwrap().want_type, WantType::Block);
    }

    #[test]
    fn test_absorb() {
        let cids = test_cids();
        let mut a = SessionTrackedWantlist::default();
        a.add(Entry::new(cids[0], 1, WantType::Block), 1);
        a.add(Entry::new(cids[1], 2, WantType::Block), 2);

        let mut b = SessionTrackedWantlist::default();
        b.add(Entry::new(cids[1], 2, WantType::Block), 3);
        b.absorb(&a);

        assert_eq!(b.len(), 2);
        assert!(!b.remove(&cids[1], 3));
        assert!(b.remove(&cids[1], 2));
    }
}
