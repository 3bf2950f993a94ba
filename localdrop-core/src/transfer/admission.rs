//! Receiver admission queue: at most one sender streams into this receiver at
//! a time. Further streams from the sender holding the lock are admitted
//! immediately; other senders wait in arrival order.

use std::collections::VecDeque;

use crate::identity::PeerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Granted,
    /// Parked at this zero-based position.
    Queued(usize),
}

#[derive(Debug)]
pub struct AdmissionQueue<K> {
    holder: Option<(PeerId, usize)>,
    waiting: VecDeque<(PeerId, K)>,
}

impl<K: PartialEq> Default for AdmissionQueue<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: PartialEq> AdmissionQueue<K> {
    pub fn new() -> Self {
        Self {
            holder: None,
            waiting: VecDeque::new(),
        }
    }

    pub fn request(&mut self, peer: &PeerId, key: K) -> Admission {
        match &mut self.holder {
            None => {
                self.holder = Some((peer.clone(), 1));
                Admission::Granted
            }
            Some((holder, count)) if holder == peer => {
                *count += 1;
                Admission::Granted
            }
            Some(_) => {
                self.waiting.push_back((peer.clone(), key));
                Admission::Queued(self.waiting.len() - 1)
            }
        }
    }

    /// One admitted stream of `peer` finished. Returns the requests admitted
    /// as a result, in order.
    pub fn release(&mut self, peer: &PeerId) -> Vec<K> {
        match &mut self.holder {
            Some((holder, count)) if holder == peer => {
                *count -= 1;
                if *count > 0 {
                    return Vec::new();
                }
                self.holder = None;
                self.admit_next()
            }
            _ => Vec::new(),
        }
    }

    /// Drop a parked request. Returns false if it was not waiting.
    pub fn remove(&mut self, key: &K) -> bool {
        let before = self.waiting.len();
        self.waiting.retain(|(_, k)| k != key);
        before != self.waiting.len()
    }

    /// Forget everything belonging to `peer`: its parked requests and, if it
    /// holds the lock, the lock itself.
    pub fn remove_peer(&mut self, peer: &PeerId) -> Vec<K> {
        self.waiting.retain(|(p, _)| p != peer);
        match &self.holder {
            Some((holder, _)) if holder == peer => {
                self.holder = None;
                self.admit_next()
            }
            _ => Vec::new(),
        }
    }

    pub fn holder(&self) -> Option<&PeerId> {
        self.holder.as_ref().map(|(p, _)| p)
    }

    pub fn waiting(&self) -> usize {
        self.waiting.len()
    }

    fn admit_next(&mut self) -> Vec<K> {
        let Some((peer, key)) = self.waiting.pop_front() else {
            return Vec::new();
        };
        let mut admitted = vec![key];
        let mut rest = VecDeque::with_capacity(self.waiting.len());
        for (p, k) in self.waiting.drain(..) {
            if p == peer {
                admitted.push(k);
            } else {
                rest.push_back((p, k));
            }
        }
        self.waiting = rest;
        self.holder = Some((peer, admitted.len()));
        admitted
    }
}
