//! Network: signed, session-numbered transmission between participants.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use tracing::{trace, warn};

use crate::crypto::{CryptoPort, Digest20};
use crate::error::NetworkError;
use crate::roster::{NodeId, Roster};
use crate::wire::{Destination, Packet};

/// Snapshot of all verified messages seen in the current round, in arrival order.
/// Used only by blame.
#[derive(Debug, Clone, Default)]
pub struct Log {
    entries: Vec<(NodeId, Vec<u8>)>,
}

impl Log {
    pub fn push(&mut self, sender: NodeId, signed_bytes: Vec<u8>) {
        self.entries.push((sender, signed_bytes));
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> &[(NodeId, Vec<u8>)] {
        &self.entries
    }

    pub fn entries_from(&self, sender: NodeId) -> impl Iterator<Item = &Vec<u8>> {
        self.entries.iter().filter(move |(id, _)| *id == sender).map(|(_, b)| b)
    }
}

/// Per-sender bookkeeping the network layer needs to enforce the running-hash
/// invariant.
#[derive(Debug, Clone)]
struct SenderState {
    expected_nonce: u32,
    running_hash: Digest20,
}

impl Default for SenderState {
    fn default() -> Self {
        Self { expected_nonce: 0, running_hash: [0u8; 20] }
    }
}

/// Logical network layer: the concrete transport is injected via [`Transport`].
/// In scope here is signing/verification/ordering/logging bookkeeping; `Transport`
/// is the out-of-scope wire carrier.
pub trait Transport {
    fn send_packet(&mut self, dst: NodeId, packet: Packet) -> Result<(), NetworkError>;
    fn broadcast_packet(&mut self, packet: Packet) -> Result<(), NetworkError>;
}

/// An in-memory transport connecting every node in a test run to every other.
/// This is the mock used throughout `tests/` (and the in-process equivalent of
/// `manul::dev`'s `run_sync` harness).
#[derive(Debug, Default)]
pub struct InMemoryBus {
    queues: BTreeMap<(NodeId, NodeId), VecDeque<Packet>>,
}

impl InMemoryBus {
    pub fn deliver(&mut self, from: NodeId, to: NodeId, packet: Packet) {
        self.queues.entry((from, to)).or_default().push_back(packet);
    }

    pub fn pop(&mut self, from: NodeId, to: NodeId) -> Option<Packet> {
        self.queues.get_mut(&(from, to)).and_then(|q| q.pop_front())
    }
}

/// A handle into a shared [`InMemoryBus`] for one node.
pub struct InMemoryTransport<'bus> {
    pub me: NodeId,
    pub peers: Vec<NodeId>,
    pub bus: &'bus std::cell::RefCell<InMemoryBus>,
}

impl<'bus> Transport for InMemoryTransport<'bus> {
    fn send_packet(&mut self, dst: NodeId, packet: Packet) -> Result<(), NetworkError> {
        self.bus.borrow_mut().deliver(self.me, dst, packet);
        Ok(())
    }

    fn broadcast_packet(&mut self, packet: Packet) -> Result<(), NetworkError> {
        for peer in self.peers.clone() {
            if peer != self.me {
                self.bus.borrow_mut().deliver(self.me, peer, packet.clone());
            }
        }
        Ok(())
    }
}

/// Whether a received packet should be buffered because no listener is
/// currently installed for its phase (see `start_incoming`/`stop_incoming`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Listening {
    Off,
    On(&'static str),
}

/// The per-round network instance. Owns the session nonce counter, per-sender
/// running-hash state, the append-only log, and (logically) routes through a
/// [`Transport`].
pub struct Network<C: CryptoPort, T: Transport> {
    crypto: C,
    transport: T,
    me: NodeId,
    my_sk: crate::crypto::SecretKey,
    roster: Roster,
    session_nonce: u32,
    my_next_nonce: u32,
    my_running_hash: Digest20,
    senders: BTreeMap<NodeId, SenderState>,
    inbox: BTreeMap<NodeId, VecDeque<Packet>>,
    buffered: Vec<(NodeId, Packet)>,
    listening: Listening,
    log: Log,
    faulty: BTreeSet<NodeId>,
}

impl<C: CryptoPort, T: Transport> Network<C, T> {
    pub fn new(crypto: C, transport: T, me: NodeId, my_sk: crate::crypto::SecretKey, roster: Roster) -> Self {
        Self {
            crypto,
            transport,
            me,
            my_sk,
            roster,
            session_nonce: 0,
            my_next_nonce: 0,
            my_running_hash: [0u8; 20],
            senders: BTreeMap::new(),
            inbox: BTreeMap::new(),
            buffered: Vec::new(),
            listening: Listening::Off,
            log: Log::default(),
            faulty: BTreeSet::new(),
        }
    }

    /// Installs a session tag used in signatures; discards queued state from a
    /// prior round.
    pub fn reset_session(&mut self, nonce: u32) {
        self.session_nonce = nonce;
        self.my_next_nonce = 0;
        self.my_running_hash = [0u8; 20];
        self.senders.clear();
        self.inbox.clear();
        self.buffered.clear();
        self.log = Log::default();
        self.faulty.clear();
    }

    fn sign_and_send(&mut self, to: Destination, body: Vec<u8>) -> Result<(), NetworkError> {
        let running_hash = Packet::next_running_hash(&self.crypto, &self.my_running_hash, to, &body);
        let nonce = self.my_next_nonce;
        let packet = Packet::sign(&self.crypto, &self.my_sk, nonce, running_hash, self.me, to, body)
            .map_err(|e| NetworkError::Transport(e.to_string()))?;
        self.my_next_nonce += 1;
        self.my_running_hash = running_hash;
        self.log.push(self.me, Self::signed_log_bytes(&packet));

        match to.0 {
            Some(dst) => self.transport.send_packet(dst, packet),
            None => self.transport.broadcast_packet(packet),
        }
    }

    pub fn send(&mut self, dst: NodeId, bytes: Vec<u8>) -> Result<(), NetworkError> {
        self.sign_and_send(Destination(Some(dst)), bytes)
    }

    pub fn broadcast(&mut self, bytes: Vec<u8>) -> Result<(), NetworkError> {
        self.sign_and_send(Destination(None), bytes)
    }

    fn signed_log_bytes(packet: &Packet) -> Vec<u8> {
        let mut buf = packet.body.clone();
        buf.extend_from_slice(&packet.nonce.to_be_bytes());
        buf
    }

    /// Delivers a packet that arrived over the transport. Returns `Ok(true)` if it
    /// was accepted (verified, correctly ordered), `Ok(false)` if it was dropped
    /// as faulty; the sender is then recorded and surfaced to the caller directly,
    /// never written into the blame log.
    pub fn on_packet_arrived(&mut self, packet: Packet) -> Result<bool, NetworkError> {
        let from = packet.from;
        if from == self.me {
            return Err(NetworkError::Transport("received a packet we sent ourselves".into()));
        }
        let Some(info) = self.roster.info(from) else {
            return Err(NetworkError::UnknownDestination { dst: from.0 });
        };

        let expected_nonce = self.senders.get(&from).map(|s| s.expected_nonce).unwrap_or(0);
        if packet.nonce != expected_nonce {
            warn!(?from, "nonce mismatch, dropping");
            self.faulty.insert(from);
            return Ok(false);
        }

        if packet.verify(&self.crypto, &info.signing_pk).is_err() {
            warn!(?from, "bad signature, dropping");
            self.faulty.insert(from);
            return Ok(false);
        }

        let state = self.senders.entry(from).or_default();
        let expected_hash = Packet::next_running_hash(&self.crypto, &state.running_hash, packet.to, &packet.body);
        if expected_hash != packet.running_hash {
            warn!(?from, "running hash chain broken, dropping");
            self.faulty.insert(from);
            return Ok(false);
        }
        state.expected_nonce += 1;
        state.running_hash = expected_hash;

        self.log.push(from, Self::signed_log_bytes(&packet));

        match self.listening {
            Listening::On(_) => {
                self.inbox.entry(from).or_default().push_back(packet);
            }
            Listening::Off => {
                self.buffered.push((from, packet));
            }
        }
        Ok(true)
    }

    /// Non-blocking: returns the next verified packet from `src`, if any.
    pub fn recv(&mut self, src: NodeId) -> Option<Vec<u8>> {
        self.inbox.get_mut(&src).and_then(VecDeque::pop_front).map(|p| p.body)
    }

    pub fn start_incoming(&mut self, phase_label: &'static str) {
        self.listening = Listening::On(phase_label);
        for (from, packet) in std::mem::take(&mut self.buffered) {
            self.inbox.entry(from).or_default().push_back(packet);
        }
    }

    pub fn stop_incoming(&mut self) {
        self.listening = Listening::Off;
    }

    pub fn log_view(&self) -> Log {
        self.log.clone()
    }

    /// Senders whose packets were dropped for signature/ordering violations this
    /// round (not part of the blame log, surfaced directly to the caller instead).
    pub fn faulty_senders(&self) -> &BTreeSet<NodeId> {
        &self.faulty
    }

    pub fn me(&self) -> NodeId {
        self.me
    }
}
