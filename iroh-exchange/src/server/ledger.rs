use std::time::Instant;

use cid::Cid;
use libp2p_identity::PeerId;

use crate::client::wantlist::{Entry, Wantlist};
use crate::message::{Priority, WantType};

/// What we know about our exchange with a single partner.
#[derive(Debug)]
pub struct Ledger {
    partner: PeerId,
    /// What the partner told us it wants.
    wantlist: Wantlist,
    bytes_sent: u64,
    bytes_recv: u64,
    /// Messages exchanged in either direction.
    exchanged: u64,
    last_exchange: Option<Instant>,
    /// Open connections to the partner.
    ref_count: usize,
}

/// A snapshot of a [`Ledger`].
#[derive(Debug, Clone, PartialEq)]
pub struct Receipt {
    pub peer: PeerId,
    /// Debt ratio, bytes sent over bytes received.
    pub value: f64,
    pub sent: u64,
    pub recv: u64,
    pub exchanged: u64,
}

impl Ledger {
    pub fn new(partner: PeerId) -> Self {
        Ledger {
            partner,
            wantlist: Wantlist::default(),
            bytes_sent: 0,
            bytes_recv: 0,
            exchanged: 0,
            last_exchange: None,
            ref_count: 0,
        }
    }

    pub fn partner(&self) -> &PeerId {
        &self.partner
    }

    pub fn wants(&mut self, cid: Cid, priority: Priority, want_type: WantType) {
        self.wantlist.add(cid, priority, want_type);
    }

    pub fn cancel_want(&mut self, cid: &Cid) -> Option<Entry> {
        self.wantlist.remove(cid)
    }

    pub fn wantlist_get(&self, cid: &Cid) -> Option<&Entry> {
        self.wantlist.get(cid)
    }

    pub fn wantlist(&self) -> &Wantlist {
        &self.wantlist
    }

    pub fn wantlist_mut(&mut self) -> &mut Wantlist {
        &mut self.wantlist
    }

    pub fn record_sent(&mut self, bytes: usize) {
        self.exchanged += 1;
        self.bytes_sent += bytes as u64;
        self.last_exchange = Some(Instant::now());
    }

    pub fn record_received(&mut self, bytes: usize) {
        self.exchanged += 1;
        self.bytes_recv += bytes as u64;
        self.last_exchange = Some(Instant::now());
    }

    pub fn last_exchange(&self) -> Option<Instant> {
        self.last_exchange
    }

    pub fn debt_ratio(&self) -> f64 {
        self.bytes_sent as f64 / (self.bytes_recv as f64 + 1.0)
    }

    pub fn connected(&mut self) {
        self.ref_count += 1;
    }

    /// Returns true once the last connection went away.
    pub fn disconnected(&mut self) -> bool {
        self.ref_count = self.ref_count.saturating_sub(1);
        self.ref_count == 0
    }

    pub fn receipt(&self) -> Receipt {
        Receipt {
            peer: self.partner,
            value: self.debt_ratio(),
            sent: self.bytes_sent,
            recv: self.bytes_recv,
            exchanged: self.exchanged,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debt_ratio() {
        let mut ledger = Ledger::new(PeerId::random());
        assert_eq!(ledger.debt_ratio(), 0.0);

        ledger.record_sent(100);
        assert_eq!(ledger.debt_ratio(), 100.0);
        ledger.record_received(99);
        assert_eq!(ledger.debt_ratio(), 1.0);

        let receipt = ledger.receipt();
        assert_eq!(receipt.sent, 100);
        assert_eq!(receipt.recv, 99);
        assert_eq!(receipt.exchanged, 2);
        assert!(ledger.last_exchange().is_some());
    }

    #[test]
    fn test_ref_count() {
        let mut ledger = Ledger::new(PeerId::random());
        ledger.connected();
        ledger.connected();
        assert!(!ledger.disconnected());
        assert!(ledger.disconnected());
        assert!(ledger.disconnected());
    }
}
