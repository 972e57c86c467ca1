use cid::Cid;
use libp2p_identity::PeerId;

const MIN_RECEIVED_TO_ADJUST_SPLIT: usize = 2;
const MAX_SPLIT: usize = 16;
const MAX_ACCEPTABLE_DUPES: f64 = 0.4;
const MIN_DUPES_TO_TRY_LESS_SPLITS: f64 = 0.2;
const INITIAL_SPLIT: usize = 2;

/// A subset of keys to request from a subset of peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialRequest {
    pub peers: Vec<PeerId>,
    pub keys: Vec<Cid>,
}

/// Decides how many peer groups a session spreads its wants over.
///
/// Duplicates widen the split, so fewer peers get asked for the same block.
/// A clean stream of unique blocks narrows it again.
#[derive(Debug)]
pub struct RequestSplitter {
    split: usize,
    received: usize,
    duplicates: usize,
}

impl Default for RequestSplitter {
    fn default() -> Self {
        RequestSplitter {
            split: INITIAL_SPLIT,
            received: 0,
            duplicates: 0,
        }
    }
}

impl RequestSplitter {
    pub fn split(&self) -> usize {
        self.split
    }

    /// Deals `peers` and `keys` round-robin into matching groups.
    pub fn split_request(&self, peers: &[PeerId], keys: &[Cid]) -> Vec<PartialRequest> {
        if peers.is_empty() || keys.is_empty() {
            return Vec::new();
        }
        let split = self.split.min(peers.len()).min(keys.len()).max(1);
        let peer_groups = deal(peers, split);
        let key_groups = deal(keys, split);
        peer_groups
            .into_iter()
            .zip(key_groups)
            .map(|(peers, keys)| PartialRequest { peers, keys })
            .collect()
    }

    pub fn record_duplicate_block(&mut self) {
        self.duplicates += 1;
        self.received += 1;
        if self.received > MIN_RECEIVED_TO_ADJUST_SPLIT
            && self.duplicate_ratio() > MAX_ACCEPTABLE_DUPES
            && self.split < MAX_SPLIT
        {
            self.split += 1;
        }
    }

    pub fn record_unique_block(&mut self) {
        self.received += 1;
        if self.split > 1 && self.duplicate_ratio() < MIN_DUPES_TO_TRY_LESS_SPLITS {
            self.split -= 1;
        }
    }

    fn duplicate_ratio(&self) -> f64 {
        if self.received == 0 {
            return 0.0;
        }
        self.duplicates as f64 / self.received as f64
    }
}

fn deal<T: Copy>(items: &[T], groups: usize) -> Vec<Vec<T>> {
    let mut out = vec![Vec::with_capacity(items.len() / groups + 1); groups];
    for (i, item) in items.iter().enumerate() {
        out[i % groups].push(*item);
    }
    out
}
