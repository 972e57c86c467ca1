use std::fmt::{self, Debug};

use ahash::AHashMap;
use cid::Cid;

use crate::block::Block;
use crate::error::{Error, MalformedReason};

/// Priority of a wanted block, higher values are served first.
pub type Priority = i32;

/// Whether a want asks for the block itself or only for a presence answer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WantType {
    /// "Tell me if you have it."
    Have,
    /// "Send me the bytes."
    Block,
}

/// Whether an entry adds a want or retracts it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Action {
    Add,
    Cancel,
}

/// Represents a HAVE / DONT_HAVE for a given Cid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockPresence {
    pub cid: Cid,
    pub typ: BlockPresenceType,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BlockPresenceType {
    Have,
    DontHave,
}

/// A wantlist entry in a bitswap message.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Entry {
    pub cid: Cid,
    pub priority: Priority,
    pub want_type: WantType,
    pub action: Action,
    /// The requester wants an explicit DONT_HAVE if the block is missing.
    pub send_dont_have: bool,
}

impl Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("cid", &self.cid.to_string())
            .field("priority", &self.priority)
            .field("want_type", &self.want_type)
            .field("action", &self.action)
            .field("send_dont_have", &self.send_dont_have)
            .finish()
    }
}

impl Entry {
    pub fn want(cid: Cid, priority: Priority, want_type: WantType) -> Self {
        Entry {
            cid,
            priority,
            want_type,
            action: Action::Add,
            send_dont_have: false,
        }
    }

    pub fn cancel(cid: Cid) -> Self {
        Entry {
            cid,
            priority: 0,
            want_type: WantType::Block,
            action: Action::Cancel,
            send_dont_have: false,
        }
    }

    pub fn with_send_dont_have(mut self, send_dont_have: bool) -> Self {
        self.send_dont_have = send_dont_have;
        self
    }

    pub fn is_cancel(&self) -> bool {
        self.action == Action::Cancel
    }
}

/// A bitswap message.
///
/// Holds at most one entry, block and presence per `Cid`. How the message is
/// framed on the wire is the business of the transport.
#[derive(Default, Clone, PartialEq, Eq)]
pub struct BitswapMessage {
    full: bool,
    wantlist: AHashMap<Cid, Entry>,
    blocks: AHashMap<Cid, Block>,
    block_presences: AHashMap<Cid, BlockPresenceType>,
}

struct Fmt<F>(pub F)
where
    F: Fn(&mut fmt::Formatter) -> fmt::Result;

impl<F> fmt::Debug for Fmt<F>
where
    F: Fn(&mut fmt::Formatter) -> fmt::Result,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        (self.0)(f)
    }
}

impl Debug for BitswapMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BitswapMessage")
            .field("full", &self.full)
            .field("wantlist", &self.wantlist.values().collect::<Vec<_>>())
            .field(
                "blocks",
                &Fmt(|f| {
                    let mut blocks = f.debug_map();
                    for (cid, block) in &self.blocks {
                        blocks.entry(&cid.to_string(), &block.len());
                    }
                    blocks.finish()
                }),
            )
            .field(
                "block_presences",
                &Fmt(|f| {
                    let mut presences = f.debug_map();
                    for (cid, typ) in &self.block_presences {
                        presences.entry(&cid.to_string(), typ);
                    }
                    presences.finish()
                }),
            )
            .finish()
    }
}

impl BitswapMessage {
    pub fn new(full: bool) -> Self {
        BitswapMessage {
            full,
            ..Default::default()
        }
    }

    /// A full message replaces the receiver's view of our wantlist.
    pub fn full(&self) -> bool {
        self.full
    }

    pub fn set_full(&mut self, full: bool) {
        self.full = full;
    }

    pub fn is_empty(&self) -> bool {
        self.wantlist.is_empty() && self.blocks.is_empty() && self.block_presences.is_empty()
    }

    pub fn wantlist(&self) -> impl Iterator<Item = &Entry> {
        self.wantlist.values()
    }

    pub fn wantlist_len(&self) -> usize {
        self.wantlist.len()
    }

    pub fn blocks(&self) -> impl Iterator<Item = &Block> {
        self.blocks.values()
    }

    pub fn blocks_len(&self) -> usize {
        self.blocks.len()
    }

    pub fn block_presences(&self) -> impl Iterator<Item = BlockPresence> + '_ {
        self.block_presences
            .iter()
            .map(|(cid, typ)| BlockPresence { cid: *cid, typ: *typ })
    }

    pub fn haves(&self) -> impl Iterator<Item = &Cid> {
        self.presences_of(BlockPresenceType::Have)
    }

    pub fn dont_haves(&self) -> impl Iterator<Item = &Cid> {
        self.presences_of(BlockPresenceType::DontHave)
    }

    fn presences_of(&self, typ: BlockPresenceType) -> impl Iterator<Item = &Cid> {
        self.block_presences
            .iter()
            .filter_map(move |(cid, t)| if *t == typ { Some(cid) } else { None })
    }

    /// Total payload bytes of the blocks in this message.
    pub fn blocks_size(&self) -> usize {
        self.blocks.values().map(|b| b.len()).sum()
    }

    /// Adds a want to the message. A want-have never downgrades an existing want-block.
    pub fn add_entry(
        &mut self,
        cid: Cid,
        priority: Priority,
        want_type: WantType,
        send_dont_have: bool,
    ) {
        let entry = Entry::want(cid, priority, want_type).with_send_dont_have(send_dont_have);
        match self.wantlist.get(&cid) {
            Some(existing)
                if !existing.is_cancel()
                    && existing.want_type == WantType::Block
                    && want_type == WantType::Have =>
            {
                // keep the want-block
            }
            _ => {
                self.wantlist.insert(cid, entry);
            }
        }
    }

    /// Adds a cancel for the given `Cid`, replacing any want for it.
    pub fn cancel(&mut self, cid: Cid) {
        self.wantlist.insert(cid, Entry::cancel(cid));
    }

    pub fn push_entry(&mut self, entry: Entry) {
        match entry.action {
            Action::Add => self.add_entry(
                entry.cid,
                entry.priority,
                entry.want_type,
                entry.send_dont_have,
            ),
            Action::Cancel => self.cancel(entry.cid),
        }
    }

    pub fn remove(&mut self, cid: &Cid) {
        self.wantlist.remove(cid);
    }

    /// Adds a block, superseding any presence for the same `Cid`.
    pub fn add_block(&mut self, block: Block) {
        self.block_presences.remove(block.cid());
        self.blocks.insert(*block.cid(), block);
    }

    /// Adds a presence, unless the block itself is already part of the message.
    pub fn add_block_presence(&mut self, cid: Cid, typ: BlockPresenceType) {
        if self.blocks.contains_key(&cid) {
            return;
        }
        self.block_presences.insert(cid, typ);
    }

    pub fn add_have(&mut self, cid: Cid) {
        self.add_block_presence(cid, BlockPresenceType::Have);
    }

    pub fn add_dont_have(&mut self, cid: Cid) {
        self.add_block_presence(cid, BlockPresenceType::DontHave);
    }

    /// Moves the blocks and presences of `other` into this message.
    pub fn merge_payload(&mut self, other: BitswapMessage) {
        for (_, block) in other.blocks {
            self.add_block(block);
        }
        for (cid, typ) in other.block_presences {
            self.add_block_presence(cid, typ);
        }
    }

    /// Removes the cancels for `Cid`s whose block is part of this message.
    pub fn take_cancels_for_blocks(&mut self) -> Vec<Cid> {
        let cids: Vec<Cid> = self
            .wantlist
            .values()
            .filter(|e| e.is_cancel() && self.blocks.contains_key(&e.cid))
            .map(|e| e.cid)
            .collect();
        for cid in &cids {
            self.wantlist.remove(cid);
        }
        cids
    }

    /// Checks the invariants an inbound message has to hold before it is applied.
    pub fn validate(&self) -> Result<(), Error> {
        if self.is_empty() && !self.full {
            return Err(Error::Malformed(MalformedReason::Empty));
        }
        for entry in self.wantlist.values() {
            if entry.is_cancel() && self.blocks.contains_key(&entry.cid) {
                return Err(Error::Malformed(MalformedReason::BlockAndCancel(entry.cid)));
            }
        }
        Ok(())
    }
}
