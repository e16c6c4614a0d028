//! SessionController: the single-threaded driver that owns the roster, the
//! send queue, and the round lifecycle `Offline → Registering → RoundActive →
//! {RoundActive, Blaming, Finished}`.
//!
//! [`SessionController::drive_round`] is the per-node demultiplexer that turns
//! a `RoundActive` state into calls into [`crate::shuffle::run_shuffle`] and
//! [`crate::bulk::run_bulk_phase`]: every roster member gathers the other
//! members' tagged wire submissions, the roster leader runs the pure round
//! function (the same role [`crate::roster::Roster::leader`] already plays for
//! `Prepare`), and the outcome is broadcast back out and fed into
//! [`Self::on_round_success`]/[`Self::on_round_failure`]. See DESIGN.md for
//! what this leader-coordinated shape costs versus a fully peer-to-peer
//! state machine.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::Duration;

use tracing::warn;

use crate::blame::{self, Alibi};
use crate::bulk::{self, BulkFaults, BulkParams, OwnerMessage, Slot};
use crate::config::{Config, ProtocolVersion};
use crate::crypto::CryptoPort;
use crate::error::{ApplicationError, ConfigError, LocalError, ProtocolViolation};
use crate::network::{Network, Transport};
use crate::protocol::{RoundId, RoundOutcome};
use crate::roster::{NodeId, Roster};
use crate::scheduler::{Instant, Scheduler};
use crate::shuffle::{self, ShuffleFaults, ShuffleParams, Submission};
use crate::wire::MessageType;

/// Application callbacks: the host asks, this controller answers, in both
/// directions.
pub trait ApplicationCallbacks {
    /// Returns up to `max` bytes from the host's outgoing data, and whether
    /// more is pending beyond what was returned.
    fn get_data(&mut self, max: usize) -> (Vec<u8>, bool);
    fn deliver_plaintext(&mut self, bytes: Vec<u8>);
    fn round_starting(&mut self, round_id: RoundId);
    fn round_finished(&mut self, round_id: RoundId, success: bool, bad_members: BTreeSet<NodeId>);
    fn protocol_finished(&mut self);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Offline,
    /// Leader-driven handshake: tracks which registered peers have replied
    /// `Prepared` to the leader's `Prepare(round_id, ...)`.
    Registering { prepared: BTreeSet<NodeId> },
    RoundActive { round_id: RoundId },
    Blaming { round_id: RoundId },
    Finished,
}

/// The single-threaded session driver. Generic over the application callback
/// sink the way [`crate::crypto::CryptoPort`] is generic over the crypto
/// backend — the controller itself never touches I/O directly; [`Self::drive_round`]
/// takes the network, scheduler and crypto ports it needs for the duration of
/// one round.
pub struct SessionController<A: ApplicationCallbacks> {
    config: Config,
    roster: Roster,
    state: SessionState,
    round_counter: u64,
    session_id: Vec<u8>,
    /// User bytes not yet handed to any round: `send(bytes)` appends to a FIFO.
    send_queue: VecDeque<Vec<u8>>,
    /// Bytes tentatively removed from `send_queue` for the round currently
    /// running, restored verbatim if that round fails (the send-queue trimming
    /// rule).
    committed_prefix: VecDeque<Vec<u8>>,
    min_round_size: usize,
    peer_join_delay_ms: u64,
    last_join_at: Instant,
    app: A,
}

/// What a completed bulk-DC-net phase resolves to, decoded off the wire the
/// same way on the leader (who computed it) and every follower (who receives
/// it broadcast).
enum BulkRoundResult {
    Success { cleartexts: Vec<Vec<u8>>, needs_accusation: bool },
    Failure(BTreeSet<NodeId>),
}

impl<A: ApplicationCallbacks> SessionController<A> {
    pub fn new(
        config: Config,
        roster: Roster,
        session_id: Vec<u8>,
        min_round_size: usize,
        peer_join_delay_ms: u64,
        app: A,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            roster,
            state: SessionState::Offline,
            round_counter: 0,
            session_id,
            send_queue: VecDeque::new(),
            committed_prefix: VecDeque::new(),
            min_round_size,
            peer_join_delay_ms,
            last_join_at: Instant(0),
            app,
        })
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    pub fn round_counter(&self) -> u64 {
        self.round_counter
    }

    /// Queues application bytes for the next round that has room for them.
    pub fn send(&mut self, bytes: Vec<u8>) {
        self.send_queue.push_back(bytes);
    }

    /// A new peer registers; mid-round registrations are accepted into the
    /// roster immediately but only change `Registering`'s gating clock, never
    /// the currently active round's roster — mutations to the roster happen
    /// only at round boundaries.
    pub fn register_peer(&mut self, id: NodeId, info: crate::roster::NodeInfo, now: Instant) {
        let mut members: std::collections::BTreeMap<_, _> =
            self.roster.all_ids().into_iter().filter_map(|i| self.roster.info(i).map(|inf| (i, inf.clone()))).collect();
        members.insert(id, info);
        let subgroup = self.roster.subgroup().to_vec();
        self.roster = Roster::new(members, subgroup);
        self.last_join_at = now;
    }

    /// If gating conditions hold, moves `Offline`/a finished round into
    /// `Registering` and returns `true` (the caller, e.g. the leader's network
    /// layer, is then responsible for broadcasting `Prepare`).
    pub fn maybe_start_registering(&mut self, now: Instant) -> bool {
        if !matches!(self.state, SessionState::Offline) {
            return false;
        }
        let elapsed = now.0.saturating_sub(self.last_join_at.0);
        if self.roster.len() >= self.min_round_size && elapsed >= self.peer_join_delay_ms {
            self.state = SessionState::Registering { prepared: BTreeSet::new() };
            true
        } else {
            false
        }
    }

    /// Records a peer's `Prepared` reply; returns the round id once every
    /// roster member has replied, at which point the caller issues `Begin`.
    pub fn on_prepared(&mut self, from: NodeId) -> Option<RoundId> {
        let SessionState::Registering { prepared } = &mut self.state else {
            return None;
        };
        prepared.insert(from);
        if prepared.len() < self.roster.len() {
            return None;
        }
        let round_id = RoundId::derive(&crate::crypto::RsaCrypto, &self.session_id, self.round_counter);
        self.state = SessionState::RoundActive { round_id };
        self.app.round_starting(round_id);
        Some(round_id)
    }

    /// `GetData(max)`: pulls from the send queue, tentatively committing the
    /// bytes returned (the send-queue trimming rule).
    pub fn get_data(&mut self, max: usize) -> (Vec<u8>, bool) {
        let mut out = Vec::new();
        while out.len() < max {
            let Some(front) = self.send_queue.pop_front() else { break };
            if out.len() + front.len() > max {
                self.send_queue.push_front(front);
                break;
            }
            out.extend_from_slice(&front);
            self.committed_prefix.push_back(front);
        }
        (out, !self.send_queue.is_empty())
    }

    /// The round succeeded: deliver plaintexts, permanently drop the
    /// committed send-queue prefix, and advance to the next round boundary.
    /// A panicking application callback is caught and reported as an
    /// [`ApplicationError`] rather than taking the whole session down with it.
    pub fn on_round_success(&mut self, plaintexts: Vec<Vec<u8>>) {
        let SessionState::RoundActive { round_id } = &self.state else {
            return;
        };
        let round_id = *round_id;
        for bytes in plaintexts {
            let app = &mut self.app;
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || app.deliver_plaintext(bytes)));
            if let Err(payload) = outcome {
                let err = ApplicationError(panic_message(&payload));
                warn!(%err, "application callback panicked while delivering a round plaintext");
            }
        }
        self.committed_prefix.clear();
        self.round_counter += 1;
        self.app.round_finished(round_id, true, BTreeSet::new());
        self.state = SessionState::Offline;
    }

    /// The round failed: restore the send queue, evict the bad members, and
    /// fall back to `Registering` with the shrunk roster.
    pub fn on_round_failure(&mut self, bad_members: BTreeSet<NodeId>) {
        let round_id = match &self.state {
            SessionState::RoundActive { round_id } => *round_id,
            SessionState::Blaming { round_id } => *round_id,
            _ => return,
        };
        while let Some(bytes) = self.committed_prefix.pop_back() {
            self.send_queue.push_front(bytes);
        }
        self.roster = self.roster.without(&bad_members);
        self.app.round_finished(round_id, false, bad_members);
        self.state = SessionState::Offline;
    }

    /// Enters the blaming state explicitly (used when a round's state machine
    /// detects a violation before it can call [`Self::on_round_failure`]
    /// directly, e.g. mid-round, so the controller's state reflects it).
    pub fn enter_blaming(&mut self) {
        if let SessionState::RoundActive { round_id } = &self.state {
            let round_id = *round_id;
            self.state = SessionState::Blaming { round_id };
        }
    }

    pub fn shut_down(&mut self) {
        self.state = SessionState::Finished;
        self.app.protocol_finished();
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Drives one `RoundActive` round to completion: gathers every roster
    /// member's shuffle submission, has the leader run [`shuffle::run_shuffle`]
    /// and broadcast the result, and — for [`ProtocolVersion::V1ShuffleBulk`] —
    /// has the leader additionally run one [`bulk::run_bulk_phase`] cycle over
    /// the shuffled content before resolving the round. `pump` is called
    /// whenever this node has nothing more to do but wait; it is the caller's
    /// hook to service the transport (e.g. draining a socket or an in-memory
    /// bus into [`Network::on_packet_arrived`]).
    pub fn drive_round<C: CryptoPort, T: Transport>(
        &mut self,
        crypto: &C,
        network: &mut Network<C, T>,
        scheduler: &mut impl Scheduler,
        round_timeout: Duration,
        mut pump: impl FnMut(&mut Network<C, T>),
    ) -> Result<(), LocalError> {
        if !matches!(self.state, SessionState::RoundActive { .. }) {
            return Err(LocalError::new("drive_round called outside RoundActive"));
        }
        let me = network.me();
        let members: Vec<NodeId> = self.roster.all_ids().into_iter().collect();
        let leader = self.roster.leader().ok_or_else(|| LocalError::new("round has no server subgroup"))?;

        let max_body = self.config.shuffle_msg_length.saturating_sub(4);
        let (my_plaintext, _more) = self.get_data(max_body);

        let (shuffle_outcome, submissions) = self.run_anonymizing_exchange(
            crypto,
            network,
            scheduler,
            round_timeout,
            &mut pump,
            &members,
            me,
            MessageType::ShuffleData,
            MessageType::ShufflePermuted,
            my_plaintext,
            self.config.shuffle_msg_length,
            self.config.disposable_key_length,
        )?;

        let plaintexts = match shuffle_outcome {
            RoundOutcome::Failure { bad_members } => {
                self.on_round_failure(bad_members);
                return Ok(());
            }
            RoundOutcome::Success(plaintexts) => plaintexts,
        };

        if self.config.protocol_version == ProtocolVersion::ShuffleOnly {
            self.on_round_success(plaintexts);
            return Ok(());
        }

        // V1ShuffleBulk: only the leader runs the DC-net phase, the same
        // round-simulator convention the shuffle above already uses. Everyone
        // else waits for the leader's broadcast result.
        if me != leader {
            network.start_incoming("bulk-phase-result");
            let result = loop {
                if let Some(body) = network.recv(leader) {
                    if let Some((MessageType::BulkCleartextPush, payload)) = decode_tagged(&body) {
                        break decode_bulk_round_result(payload)?;
                    }
                }
                pump(network);
            };
            network.stop_incoming();
            self.finish_bulk_round(result);
            return Ok(());
        }

        let result = self.run_bulk_phase_as_leader(crypto, &plaintexts, &submissions)?;
        network
            .broadcast(encode_tagged(MessageType::BulkCleartextPush, &encode_bulk_round_result(&result)))
            .map_err(|e| LocalError::new(format!("broadcasting bulk outcome failed: {e}")))?;
        self.finish_bulk_round(result);
        Ok(())
    }

    /// Runs a generic "gather real submissions, have the leader run a pure
    /// shuffle, broadcast the outcome" exchange. Shared by the main round's
    /// shuffle step and [`Self::drive_blame_round`]'s accusation shuffle, so
    /// the latter's `MessageType::BlameAccusationShuffleData`/`BlameAlibi` tags
    /// get the same real wiring instead of sitting unused.
    ///
    /// Submissions are broadcast as plaintext wire bodies: the anonymity this
    /// buys is the shuffle's internal unlinkability of output-to-submitter, not
    /// unlinkability against other participants who can see who sent what
    /// before the shuffle runs. See DESIGN.md.
    #[allow(clippy::too_many_arguments)]
    fn run_anonymizing_exchange<C: CryptoPort, T: Transport>(
        &mut self,
        crypto: &C,
        network: &mut Network<C, T>,
        scheduler: &mut impl Scheduler,
        round_timeout: Duration,
        pump: &mut impl FnMut(&mut Network<C, T>),
        participants: &[NodeId],
        me: NodeId,
        submit_tag: MessageType,
        result_tag: MessageType,
        my_plaintext: Vec<u8>,
        msg_length: usize,
        disposable_key_bits: usize,
    ) -> Result<(RoundOutcome<Vec<Vec<u8>>>, BTreeMap<NodeId, Vec<u8>>), LocalError> {
        let leader = self.roster.leader().ok_or_else(|| LocalError::new("exchange has no leader"))?;

        network
            .broadcast(encode_tagged(submit_tag, &my_plaintext))
            .map_err(|e| LocalError::new(format!("broadcasting submission failed: {e}")))?;
        network.start_incoming("anonymizing-exchange-submit");

        let mut submissions = BTreeMap::new();
        submissions.insert(me, my_plaintext);

        let deadline = scheduler.schedule_at(scheduler.now().advance(round_timeout));
        loop {
            for &peer in participants {
                if peer == me || submissions.contains_key(&peer) {
                    continue;
                }
                if let Some(body) = network.recv(peer) {
                    if let Some((tag, payload)) = decode_tagged(&body) {
                        if tag == submit_tag {
                            submissions.insert(peer, payload.to_vec());
                        }
                    }
                }
            }
            if submissions.len() == participants.len() {
                break;
            }
            if !scheduler.poll_expired().is_empty() {
                network.stop_incoming();
                let missing: BTreeSet<NodeId> =
                    participants.iter().copied().filter(|p| !submissions.contains_key(p)).collect();
                for &m in &missing {
                    let violation = ProtocolViolation::Timeout(m.0);
                    warn!(%violation, "no submission arrived before the exchange deadline");
                }
                return Ok((RoundOutcome::Failure { bad_members: missing }, submissions));
            }
            pump(network);
        }
        if let Err(err) = scheduler.cancel(deadline) {
            warn!(%err, "exchange deadline timer already gone once every submission had arrived");
        }
        network.stop_incoming();

        let servers = self.roster.subgroup().to_vec();
        let shuffle_params = ShuffleParams { topology_order: servers, msg_length, disposable_key_bits };

        let outcome = if me == leader {
            let subs: Vec<Submission> = submissions
                .iter()
                .map(|(&member, plaintext)| Submission { member, plaintext: plaintext.clone() })
                .collect();
            let outcome = shuffle::run_shuffle(crypto, &shuffle_params, subs, ShuffleFaults::default())?;
            network
                .broadcast(encode_tagged(result_tag, &encode_plaintexts_outcome(&outcome)))
                .map_err(|e| LocalError::new(format!("broadcasting exchange outcome failed: {e}")))?;
            outcome
        } else {
            network.start_incoming("anonymizing-exchange-result");
            let outcome = loop {
                if let Some(body) = network.recv(leader) {
                    if let Some((tag, payload)) = decode_tagged(&body) {
                        if tag == result_tag {
                            break decode_plaintexts_outcome(payload)?;
                        }
                    }
                }
                pump(network);
            };
            network.stop_incoming();
            outcome
        };

        Ok((outcome, submissions))
    }

    /// The leader's side of a bulk DC-net phase: correlates each shuffled
    /// plaintext back to its pre-shuffle submitter by exact byte match (the
    /// leader already holds `submissions`, so this adds no new capability
    /// beyond what the round-simulator architecture already grants it — see
    /// DESIGN.md), builds fresh per-slot disposable keys, and runs one phase.
    fn run_bulk_phase_as_leader(
        &self,
        crypto: &impl CryptoPort,
        plaintexts: &[Vec<u8>],
        submissions: &BTreeMap<NodeId, Vec<u8>>,
    ) -> Result<BulkRoundResult, LocalError> {
        let servers = self.roster.subgroup().to_vec();
        let clients = self.roster.clients();
        let phase = self.round_counter as u32;

        // Only client-submitted content becomes a bulk slot: a slot's
        // plaintext is only ever filled in by its owner's `OwnerMessage`, and
        // only clients submit those, so a server's own shuffle submission
        // (needed so `shuffle::run_shuffle` has every roster member's
        // contribution to permute) has no further role once the shuffle
        // completes.
        let mut slots = Vec::with_capacity(plaintexts.len());
        let mut anon_sks = BTreeMap::new();
        let mut messages = BTreeMap::new();
        for body in plaintexts {
            let Some(owner_id) = submissions.iter().find(|(_, v)| v.as_slice() == body.as_slice()).map(|(&id, _)| id)
            else {
                continue;
            };
            if !clients.contains(&owner_id) {
                continue;
            }
            let (anon_sk, anon_pk) = crypto
                .gen_keypair(self.config.disposable_key_length)
                .map_err(|e| LocalError::new(format!("slot anon keypair generation failed: {e}")))?;
            let idx = slots.len();
            messages.insert(idx, OwnerMessage { body: body.clone(), accuse: false });
            anon_sks.insert(idx, anon_sk);
            slots.push(Slot { owner: Some(owner_id), anon_pk: Some(anon_pk) });
        }

        let params = BulkParams { servers: servers.clone(), clients: clients.clone(), slots };
        let slot_length: BTreeMap<usize, usize> =
            (0..params.slots.len()).map(|i| (i, self.config.shuffle_msg_length)).collect();
        let open_slots: BTreeSet<usize> = (0..params.slots.len()).collect();

        let mut pairwise_seeds = BTreeMap::new();
        for &c in &clients {
            for &s in &servers {
                pairwise_seeds.insert((c, s), pairwise_seed_bytes(crypto, &self.roster, c, s));
            }
        }
        let mut prngs = BTreeMap::new();

        let outcome = bulk::run_bulk_phase(
            crypto,
            &params,
            &mut prngs,
            &pairwise_seeds,
            &slot_length,
            &open_slots,
            &anon_sks,
            &messages,
            phase,
            self.config.shuffle_msg_length as u32,
            &BulkFaults::default(),
        )?;

        Ok(match outcome {
            RoundOutcome::Failure { bad_members } => BulkRoundResult::Failure(bad_members),
            RoundOutcome::Success(result) => {
                let mut cleartexts = Vec::with_capacity(result.cleartexts.len());
                for (&idx, raw) in &result.cleartexts {
                    let Some(anon_pk) = &params.slots[idx].anon_pk else { continue };
                    if let Some((_next_length, _accuse, body)) = bulk::parse_slot_cleartext(crypto, anon_pk, phase, raw) {
                        cleartexts.push(body);
                    }
                }
                BulkRoundResult::Success { cleartexts, needs_accusation: !result.needs_accusation.is_empty() }
            }
        })
    }

    fn finish_bulk_round(&mut self, result: BulkRoundResult) {
        match result {
            BulkRoundResult::Failure(bad_members) => self.on_round_failure(bad_members),
            BulkRoundResult::Success { cleartexts, needs_accusation } => {
                if needs_accusation {
                    // A slot's signature failed to verify this phase; the real
                    // remedy is the accusation-shuffle subprotocol in
                    // `Self::drive_blame_round`, which a caller with a concrete
                    // `Accusation` and `Alibi` in hand can run directly. This
                    // driving loop does not yet derive those on its own, so it
                    // falls back to an inconclusive failure rather than
                    // silently dropping the report.
                    self.enter_blaming();
                    warn!("bulk phase flagged a signature mismatch this round driver does not yet pinpoint on its own");
                    self.on_round_failure(BTreeSet::new());
                    return;
                }
                self.on_round_success(cleartexts);
            }
        }
    }

    /// Runs the accusation-shuffle subprotocol: every implicated party (plus
    /// the leader, who must participate regardless of implication to perform
    /// its shuffling duty) submits its own [`Alibi`] through the same
    /// anonymizing exchange the main round uses, and the gathered, anonymized
    /// alibis are cross-referenced by [`blame::pinpoint_conflict`]. Returns the
    /// pinpointed (client, server) pair, or `None` if the alibis were
    /// consistent (or the exchange itself failed, which is reported via
    /// [`Self::on_round_failure`] as usual).
    pub fn drive_blame_round<C: CryptoPort, T: Transport>(
        &mut self,
        crypto: &C,
        network: &mut Network<C, T>,
        scheduler: &mut impl Scheduler,
        round_timeout: Duration,
        mut pump: impl FnMut(&mut Network<C, T>),
        implicated: &[NodeId],
        my_alibi: Alibi,
    ) -> Result<Option<(NodeId, NodeId)>, LocalError> {
        let me = network.me();
        let leader = self.roster.leader().ok_or_else(|| LocalError::new("round has no server subgroup"))?;

        let mut participants = implicated.to_vec();
        if !participants.contains(&leader) {
            participants.push(leader);
        }
        participants.sort_by_key(|n| n.0);
        participants.dedup();

        let my_alibi = if me == leader && !implicated.contains(&me) {
            Alibi { party: me, claims: BTreeMap::new() }
        } else {
            my_alibi
        };

        let msg_length = 4 + 4 + participants.len() * 5 + 8;
        let (outcome, _submissions) = self.run_anonymizing_exchange(
            crypto,
            network,
            scheduler,
            round_timeout,
            &mut pump,
            &participants,
            me,
            MessageType::BlameAccusationShuffleData,
            MessageType::BlameAlibi,
            encode_alibi(&my_alibi),
            msg_length,
            self.config.disposable_key_length,
        )?;

        let alibis = match outcome {
            RoundOutcome::Failure { bad_members } => {
                self.on_round_failure(bad_members);
                return Ok(None);
            }
            RoundOutcome::Success(plaintexts) => {
                let mut alibis = Vec::with_capacity(plaintexts.len());
                for bytes in plaintexts {
                    alibis.push(decode_alibi(&bytes)?);
                }
                alibis
            }
        };

        Ok(blame::pinpoint_conflict(&alibis))
    }
}

fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "application callback panicked with a non-string payload".to_string()
    }
}

/// A symmetric seed both a client and a server can derive on their own from
/// the pair's public DH keys: `hash(lower_id_pk || higher_id_pk)`, ordered by
/// id so either side computes the same bytes.
fn pairwise_seed_bytes(crypto: &impl CryptoPort, roster: &Roster, a: NodeId, b: NodeId) -> Vec<u8> {
    let (lo, hi) = if a.0 <= b.0 { (a, b) } else { (b, a) };
    let lo_pk = roster.info(lo).map(|i| i.dh_pk.to_seed_bytes()).unwrap_or_default();
    let hi_pk = roster.info(hi).map(|i| i.dh_pk.to_seed_bytes()).unwrap_or_default();
    crypto.hash(&[lo_pk.as_slice(), hi_pk.as_slice()]).to_vec()
}

fn encode_tagged(tag: MessageType, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + payload.len());
    buf.push(tag as u8);
    buf.extend_from_slice(payload);
    buf
}

fn decode_tagged(bytes: &[u8]) -> Option<(MessageType, &[u8])> {
    let (&tag_byte, rest) = bytes.split_first()?;
    let tag = MessageType::from_tag(tag_byte).ok()?;
    Some((tag, rest))
}

fn take_u32(buf: &mut &[u8]) -> Result<u32, LocalError> {
    if buf.len() < 4 {
        return Err(LocalError::new("truncated u32 field"));
    }
    let (head, tail) = buf.split_at(4);
    *buf = tail;
    Ok(u32::from_be_bytes(head.try_into().unwrap()))
}

/// `[tag: 1][count: u32]([len: u32][bytes])*` for success, `[0][count][id: u32]*`
/// for failure — the wire shape shared by the shuffle and accusation-shuffle
/// outcomes.
fn encode_plaintexts_outcome(outcome: &RoundOutcome<Vec<Vec<u8>>>) -> Vec<u8> {
    match outcome {
        RoundOutcome::Success(plaintexts) => {
            let mut buf = vec![1u8];
            buf.extend_from_slice(&(plaintexts.len() as u32).to_be_bytes());
            for p in plaintexts {
                buf.extend_from_slice(&(p.len() as u32).to_be_bytes());
                buf.extend_from_slice(p);
            }
            buf
        }
        RoundOutcome::Failure { bad_members } => {
            let mut buf = vec![0u8];
            buf.extend_from_slice(&(bad_members.len() as u32).to_be_bytes());
            for m in bad_members {
                buf.extend_from_slice(&m.0.to_be_bytes());
            }
            buf
        }
    }
}

fn decode_plaintexts_outcome(bytes: &[u8]) -> Result<RoundOutcome<Vec<Vec<u8>>>, LocalError> {
    let mut r = bytes;
    let (&tag, rest) = r.split_first().ok_or_else(|| LocalError::new("empty outcome encoding"))?;
    r = rest;
    match tag {
        1 => {
            let count = take_u32(&mut r)?;
            let mut plaintexts = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let len = take_u32(&mut r)? as usize;
                if r.len() < len {
                    return Err(LocalError::new("truncated outcome plaintext"));
                }
                let (item, rest) = r.split_at(len);
                plaintexts.push(item.to_vec());
                r = rest;
            }
            Ok(RoundOutcome::Success(plaintexts))
        }
        0 => {
            let count = take_u32(&mut r)?;
            let mut bad_members = BTreeSet::new();
            for _ in 0..count {
                bad_members.insert(NodeId(take_u32(&mut r)?));
            }
            Ok(RoundOutcome::Failure { bad_members })
        }
        other => Err(LocalError::new(format!("unknown outcome tag {other}"))),
    }
}

fn encode_bulk_round_result(result: &BulkRoundResult) -> Vec<u8> {
    match result {
        BulkRoundResult::Success { cleartexts, needs_accusation } => {
            let mut buf = vec![1u8, *needs_accusation as u8];
            buf.extend_from_slice(&(cleartexts.len() as u32).to_be_bytes());
            for c in cleartexts {
                buf.extend_from_slice(&(c.len() as u32).to_be_bytes());
                buf.extend_from_slice(c);
            }
            buf
        }
        BulkRoundResult::Failure(bad_members) => {
            let mut buf = vec![0u8];
            buf.extend_from_slice(&(bad_members.len() as u32).to_be_bytes());
            for m in bad_members {
                buf.extend_from_slice(&m.0.to_be_bytes());
            }
            buf
        }
    }
}

fn decode_bulk_round_result(bytes: &[u8]) -> Result<BulkRoundResult, LocalError> {
    let mut r = bytes;
    let (&tag, rest) = r.split_first().ok_or_else(|| LocalError::new("empty bulk outcome encoding"))?;
    r = rest;
    match tag {
        1 => {
            let (&needs_accusation_byte, rest) = r.split_first().ok_or_else(|| LocalError::new("truncated bulk outcome"))?;
            r = rest;
            let count = take_u32(&mut r)?;
            let mut cleartexts = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let len = take_u32(&mut r)? as usize;
                if r.len() < len {
                    return Err(LocalError::new("truncated bulk outcome cleartext"));
                }
                let (item, rest) = r.split_at(len);
                cleartexts.push(item.to_vec());
                r = rest;
            }
            Ok(BulkRoundResult::Success { cleartexts, needs_accusation: needs_accusation_byte != 0 })
        }
        0 => {
            let count = take_u32(&mut r)?;
            let mut bad = BTreeSet::new();
            for _ in 0..count {
                bad.insert(NodeId(take_u32(&mut r)?));
            }
            Ok(BulkRoundResult::Failure(bad))
        }
        other => Err(LocalError::new(format!("unknown bulk outcome tag {other}"))),
    }
}

/// `[party: u32][count: u32]([id: u32][bit: u8])*`.
fn encode_alibi(alibi: &Alibi) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8 + alibi.claims.len() * 5);
    buf.extend_from_slice(&alibi.party.0.to_be_bytes());
    buf.extend_from_slice(&(alibi.claims.len() as u32).to_be_bytes());
    for (&id, &bit) in &alibi.claims {
        buf.extend_from_slice(&id.0.to_be_bytes());
        buf.push(bit as u8);
    }
    buf
}

fn decode_alibi(bytes: &[u8]) -> Result<Alibi, LocalError> {
    let mut r = bytes;
    let party = NodeId(take_u32(&mut r)?);
    let count = take_u32(&mut r)?;
    let mut claims = BTreeMap::new();
    for _ in 0..count {
        let id = NodeId(take_u32(&mut r)?);
        let (&bit, rest) = r.split_first().ok_or_else(|| LocalError::new("truncated alibi claim"))?;
        r = rest;
        claims.insert(id, bit != 0);
    }
    Ok(Alibi { party, claims })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{CryptoPort, RsaCrypto};
    use crate::dh::DhKeypair;
    use std::collections::BTreeMap;

    #[test]
    fn session_controller_is_send_when_the_app_is() {
        // The host is expected to be able to move a `SessionController` into a
        // worker task; that only holds if the application callbacks it wraps
        // are themselves `Send`.
        struct DummyApp;
        impl ApplicationCallbacks for DummyApp {
            fn get_data(&mut self, _max: usize) -> (Vec<u8>, bool) {
                unimplemented!()
            }
            fn deliver_plaintext(&mut self, _bytes: Vec<u8>) {}
            fn round_starting(&mut self, _round_id: RoundId) {}
            fn round_finished(&mut self, _round_id: RoundId, _success: bool, _bad_members: BTreeSet<NodeId>) {}
            fn protocol_finished(&mut self) {}
        }

        assert!(impls::impls!(SessionController<DummyApp>: Send));
    }

    struct RecordingApp {
        delivered: Vec<Vec<u8>>,
        finished: Vec<(bool, BTreeSet<NodeId>)>,
    }

    impl ApplicationCallbacks for RecordingApp {
        fn get_data(&mut self, _max: usize) -> (Vec<u8>, bool) {
            (Vec::new(), false)
        }
        fn deliver_plaintext(&mut self, bytes: Vec<u8>) {
            self.delivered.push(bytes);
        }
        fn round_starting(&mut self, _round_id: RoundId) {}
        fn round_finished(&mut self, _round_id: RoundId, success: bool, bad_members: BTreeSet<NodeId>) {
            self.finished.push((success, bad_members));
        }
        fn protocol_finished(&mut self) {}
    }

    fn roster_of(ids: &[u32]) -> Roster {
        let crypto = RsaCrypto;
        let mut members = BTreeMap::new();
        for &id in ids {
            let (_sk, pk) = crypto.gen_keypair(512).unwrap();
            members.insert(
                NodeId(id),
                crate::roster::NodeInfo { signing_pk: pk, dh_pk: DhKeypair::generate().public() },
            );
        }
        Roster::new(members, ids.iter().take(1).map(|&i| NodeId(i)).collect())
    }

    fn sample_config(topology: Vec<crate::config::TopologyEntry>) -> crate::config::Config {
        crate::config::Config {
            my_node_id: NodeId(1),
            identity_sk: None,
            nodes: BTreeMap::new(),
            num_nodes: 0,
            disposable_key_length: 512,
            shuffle_msg_length: 32,
            topology,
            my_position: crate::config::Position::Server(0),
            protocol_version: crate::config::ProtocolVersion::ShuffleOnly,
            wait_between_rounds_ms: 0,
        }
    }

    #[test]
    fn registering_requires_min_size_and_join_delay() {
        let crypto = RsaCrypto;
        let (_sk, pk) = crypto.gen_keypair(512).unwrap();
        let config = sample_config(vec![crate::config::TopologyEntry { node_id: NodeId(1), next_id: -1, prev_id: -1 }]);
        let _ = pk;
        let roster = roster_of(&[1, 2, 3]);
        let app = RecordingApp { delivered: Vec::new(), finished: Vec::new() };
        let mut session = SessionController::new(config, roster, b"session".to_vec(), 3, 1000, app).unwrap();

        assert!(!session.maybe_start_registering(Instant(500)));
        assert!(session.maybe_start_registering(Instant(1000)));
        assert!(matches!(session.state(), SessionState::Registering { .. }));
    }

    #[test]
    fn failed_round_restores_committed_send_queue() {
        let crypto = RsaCrypto;
        let config = sample_config(vec![crate::config::TopologyEntry { node_id: NodeId(1), next_id: -1, prev_id: -1 }]);
        let roster = roster_of(&[1, 2]);
        let app = RecordingApp { delivered: Vec::new(), finished: Vec::new() };
        let mut session = SessionController::new(config, roster, b"session".to_vec(), 2, 0, app).unwrap();

        session.send(b"hello".to_vec());
        assert!(session.maybe_start_registering(Instant(0)));
        session.on_prepared(NodeId(1));
        session.on_prepared(NodeId(2));
        assert!(matches!(session.state(), SessionState::RoundActive { .. }));

        let (data, _more) = session.get_data(64);
        assert_eq!(data, b"hello");
        assert!(session.send_queue.is_empty());

        session.on_round_failure(BTreeSet::from([NodeId(2)]));
        assert_eq!(session.send_queue.len(), 1);
        assert_eq!(session.roster().len(), 1);
        let _ = crypto;
    }

    #[test]
    fn invalid_config_is_rejected_at_construction() {
        let roster = roster_of(&[1]);
        let app = RecordingApp { delivered: Vec::new(), finished: Vec::new() };
        let config = sample_config(Vec::new()); // empty topology: invalid
        assert!(matches!(
            SessionController::new(config, roster, b"session".to_vec(), 1, 0, app),
            Err(ConfigError::EmptySubgroup)
        ));
    }

    #[test]
    fn tagged_messages_round_trip() {
        let encoded = encode_tagged(MessageType::ShuffleData, b"hello");
        let (tag, payload) = decode_tagged(&encoded).unwrap();
        assert_eq!(tag, MessageType::ShuffleData);
        assert_eq!(payload, b"hello");
    }

    #[test]
    fn plaintexts_outcome_round_trips_success_and_failure() {
        let success = RoundOutcome::Success(vec![b"a".to_vec(), b"bb".to_vec()]);
        let decoded = decode_plaintexts_outcome(&encode_plaintexts_outcome(&success)).unwrap();
        match decoded {
            RoundOutcome::Success(v) => assert_eq!(v, vec![b"a".to_vec(), b"bb".to_vec()]),
            RoundOutcome::Failure { .. } => panic!("expected success"),
        }

        let failure: RoundOutcome<Vec<Vec<u8>>> = RoundOutcome::Failure { bad_members: BTreeSet::from([NodeId(7)]) };
        let decoded = decode_plaintexts_outcome(&encode_plaintexts_outcome(&failure)).unwrap();
        match decoded {
            RoundOutcome::Failure { bad_members } => assert_eq!(bad_members, BTreeSet::from([NodeId(7)])),
            RoundOutcome::Success(_) => panic!("expected failure"),
        }
    }

    #[test]
    fn alibi_round_trips_through_wire_encoding() {
        let alibi = Alibi { party: NodeId(3), claims: BTreeMap::from([(NodeId(10), true), (NodeId(11), false)]) };
        let decoded = decode_alibi(&encode_alibi(&alibi)).unwrap();
        assert_eq!(decoded.party, alibi.party);
        assert_eq!(decoded.claims, alibi.claims);
    }

    #[test]
    fn leader_correlates_shuffled_bodies_back_to_their_submitters_by_content() {
        let crypto = RsaCrypto;
        let roster = roster_of(&[1, 2]); // subgroup = [1] (leader/server), 2 is the only client
        let config = sample_config(vec![crate::config::TopologyEntry { node_id: NodeId(1), next_id: -1, prev_id: -1 }]);
        let mut config = config;
        config.protocol_version = crate::config::ProtocolVersion::V1ShuffleBulk;
        // large enough to hold a 512-bit anon signature plus header/seed/accuse overhead
        config.shuffle_msg_length = 128;
        config.validate().unwrap();
        let app = RecordingApp { delivered: Vec::new(), finished: Vec::new() };
        let session = SessionController::new(config, roster, b"session".to_vec(), 2, 0, app).unwrap();

        let submissions = BTreeMap::from([(NodeId(1), b"from server".to_vec()), (NodeId(2), b"from client".to_vec())]);
        // the shuffle permutes order; simulate that by reversing it here.
        let plaintexts = vec![b"from client".to_vec(), b"from server".to_vec()];

        let result = session.run_bulk_phase_as_leader(&crypto, &plaintexts, &submissions).unwrap();
        match result {
            BulkRoundResult::Success { cleartexts, needs_accusation } => {
                assert!(!needs_accusation);
                assert!(cleartexts.iter().any(|c| c == b"from client"));
            }
            BulkRoundResult::Failure(bad) => panic!("expected success, got failure: {bad:?}"),
        }
    }
}
