//! The trampoline relayer FSM (§4.6): validates an incoming multipart HTLC
//! set as a candidate trampoline forward, drives an outgoing multipart send
//! through a narrow listener port, and binds the incoming HTLCs' fate to the
//! outgoing attempt's outcome -- atomically, per the invariant in §7
//! (testable property 6): once a preimage is known, every incoming part
//! still present gets fulfilled, even if the outgoing attempt later reports
//! a failure for some of its own parts.
//!
//! States: RECEIVING, SENDING (with sub-modes `Processing`, `Stopping`,
//! `Revealed`), FINALIZING, SHUTDOWN. Same single-mailbox-drain, one-FSM-
//! per-`FullPaymentTag` discipline as `receiver`.

use std::collections::HashSet;

use lightning::ln::channelmanager::PendingHTLCRouting;
use lightning::ln::msgs::UpdateAddHTLC;
use lightning::ln::{PaymentHash, PaymentPreimage};
use tracing::{info, instrument, warn};

use super::preimage_cache::PreimageCache;
use super::{
    FullPaymentTag, IncomingPart, InFlightPayments, OutgoingFailure, OutgoingOutcome,
    TrampolinePayload,
};
use crate::error::FailureMessage;

/// Fee schedule and CLTV-delta parameters for the relay, per SPEC_FULL §2.3.
#[derive(Copy, Clone, Debug)]
pub struct TrampolineConfig {
    pub base_fee_msat: u64,
    pub proportional_ppm: u64,
    /// Exponent applied to the forwarded amount in the exponential term.
    pub fee_exponent: f64,
    /// Log-scale divisor for the exponential term.
    pub fee_log_exponent: f64,
    /// Minimum CLTV delta the relay must reserve between the incoming
    /// expiry and the outgoing expiry it offers.
    pub min_cltv_delta: u32,
    /// Smallest amount the relay will forward; below this it's not worth
    /// the routing risk.
    pub min_forward_msat: u64,
    /// How close to the tip an incoming part's CLTV may get before the
    /// relay refuses to even attempt the forward.
    pub cltv_reject_threshold: u32,
}

/// `base + proportional(a, ppm) + exponential(a, exponent, log_exponent)`,
/// an affine-plus-exponential schedule (§4.6) so that small forwards pay a
/// flat-ish fee while large forwards scale up faster than linearly.
fn required_trampoline_fee(amount_msat: u64, config: &TrampolineConfig) -> u64 {
    let amount = amount_msat as f64;
    let linear =
        config.base_fee_msat as f64 + amount * (config.proportional_ppm as f64) / 1_000_000.0;
    let exponential = amount.powf(config.fee_exponent) / 10f64.powf(config.fee_log_exponent);
    (linear + exponential).ceil() as u64
}

/// Which remote failure to surface to the incoming peers, scanning every
/// failure the outgoing attempt observed in priority order: a failure
/// reported by the final node, then any intermediate-hop failure, then a
/// local no-route, else a generic temporary failure.
fn choose_failure(failures: &[OutgoingFailure]) -> FailureMessage {
    if let Some(message) = failures.iter().find_map(|f| match f {
        OutgoingFailure::Remote {
            from_final_node: true,
            message,
        } => Some(message.clone()),
        _ => None,
    }) {
        return message;
    }
    if let Some(message) = failures.iter().find_map(|f| match f {
        OutgoingFailure::Remote {
            from_final_node: false,
            message,
        } => Some(message.clone()),
        _ => None,
    }) {
        return message;
    }
    if failures.iter().any(|f| matches!(f, OutgoingFailure::NoRouteFound)) {
        return FailureMessage::TrampolineFeeInsufficient;
    }
    FailureMessage::TemporaryNodeFailure
}

/// The constraints handed to the outgoing multipart sender: everything it
/// needs to route the forward, derived once at successful validation.
#[derive(Clone, Debug)]
pub struct OutgoingRouteConstraints {
    pub amount_to_forward_msat: u64,
    pub final_cltv: u32,
    /// Remaining CLTV slack the router may spend on intermediate hops
    /// without violating the incoming parts' expiries.
    pub max_cltv_delta: u32,
    /// Channels the router must not use, since they're the same peers that
    /// routed the incoming parts in.
    pub excluded_channels: Vec<[u8; 32]>,
    pub next_trampoline_routing: PendingHTLCRouting,
}

struct ValidatedRoute {
    route: OutgoingRouteConstraints,
    /// `incoming_total - amount_to_forward` at validation time: what the
    /// relay actually reserved as margin, which may exceed the nominal fee
    /// if the incoming parts overpaid.
    reserved_fee_msat: u64,
    /// The nominal scheduled fee from the fee formula, used as the earnings
    /// fallback when the outgoing sender has no part-level data to show.
    required_fee_msat: u64,
}

fn validate(
    parts: &[IncomingPart],
    config: &TrampolineConfig,
    current_height: u32,
    operational_channels: &HashSet<[u8; 32]>,
) -> Result<ValidatedRoute, FailureMessage> {
    let incoming_total: u64 = parts.iter().map(|p| p.amount_msat).sum();

    let claimed_totals: Vec<u64> = parts.iter().map(|p| p.payload.total_amount_msat).collect();
    if claimed_totals.iter().any(|&a| a != claimed_totals[0]) {
        return Err(FailureMessage::IncorrectOrUnknownPaymentDetails {
            amount_msat: incoming_total,
            height: current_height,
        });
    }

    let mut inner_payloads: Vec<&TrampolinePayload> = Vec::with_capacity(parts.len());
    for part in parts {
        match &part.payload.trampoline {
            Some(inner) => inner_payloads.push(inner),
            None => return Err(FailureMessage::TemporaryNodeFailure),
        }
    }

    let amount_to_forward = inner_payloads[0].amount_to_forward_msat;
    if inner_payloads
        .iter()
        .any(|p| p.amount_to_forward_msat != amount_to_forward)
    {
        return Err(FailureMessage::IncorrectOrUnknownPaymentDetails {
            amount_msat: incoming_total,
            height: current_height,
        });
    }

    for (part, inner) in parts.iter().zip(&inner_payloads) {
        if inner.invoice_features_present && part.payload.payment_secret.is_none() {
            return Err(FailureMessage::TemporaryNodeFailure);
        }
    }

    let required_fee = required_trampoline_fee(amount_to_forward, config);
    if incoming_total < amount_to_forward + required_fee {
        return Err(FailureMessage::TrampolineFeeInsufficient);
    }

    let min_incoming_cltv = parts
        .iter()
        .map(|p| p.cltv_expiry)
        .min()
        .unwrap_or(current_height);
    let outgoing_cltv = inner_payloads[0].outgoing_cltv_value;
    if min_incoming_cltv.saturating_sub(outgoing_cltv) < config.min_cltv_delta {
        return Err(FailureMessage::TrampolineExpiryTooSoon);
    }
    if outgoing_cltv <= current_height {
        return Err(FailureMessage::TrampolineExpiryTooSoon);
    }

    if amount_to_forward < config.min_forward_msat {
        return Err(FailureMessage::TemporaryNodeFailure);
    }

    if parts
        .iter()
        .any(|p| !operational_channels.contains(&p.channel_id))
    {
        return Err(FailureMessage::TemporaryNodeFailure);
    }

    Ok(ValidatedRoute {
        route: OutgoingRouteConstraints {
            amount_to_forward_msat: amount_to_forward,
            final_cltv: outgoing_cltv,
            max_cltv_delta: min_incoming_cltv.saturating_sub(outgoing_cltv),
            excluded_channels: parts.iter().map(|p| p.channel_id).collect(),
            next_trampoline_routing: inner_payloads[0].next_trampoline_routing.clone(),
        },
        reserved_fee_msat: incoming_total.saturating_sub(amount_to_forward),
        required_fee_msat: required_fee,
    })
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SendingMode {
    /// The outgoing sender is actively working the forward.
    Processing,
    /// Draining a leftover outgoing attempt from a prior run; once it
    /// concludes, retry validation from scratch.
    StoppingRetry,
    /// Draining a leftover outgoing attempt from a prior run that is no
    /// longer viable (incoming amount can no longer cover it); once it
    /// concludes, abort.
    StoppingNoRetry,
    /// The preimage is known. Still SENDING, not FINALIZING yet, so that
    /// incoming parts still arriving (late MPP stragglers) get fulfilled as
    /// they show up, same as FINALIZING would, while the outgoing side's
    /// remaining parts drain on their own.
    Revealed,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum State {
    Receiving,
    Sending(SendingMode),
    Finalizing,
    Shutdown,
}

/// The retained finalization outcome, replayed on every subsequent snapshot
/// while in FINALIZING (or while SENDING/`Revealed`), mirroring `receiver`'s
/// `FinalOutcome`. Unlike the local receiver, every trampoline abort carries
/// an explicit message -- the validation table and the outgoing-failure
/// translation always produce one.
#[derive(Clone, Debug)]
enum Outcome {
    Revealed(PaymentPreimage),
    Aborted(FailureMessage),
}

#[derive(Clone, Debug)]
pub enum Message {
    Snapshot(InFlightPayments),
    /// The outgoing multipart sender's terminal callback through the narrow
    /// listener port (§1).
    OutgoingOutcome(OutgoingOutcome),
    /// The single `CMDTimeout` timer fired while still RECEIVING.
    Timeout,
}

#[derive(Clone, Debug)]
pub enum Command {
    /// On entry, unconditionally: the outgoing sender sub-FSM is created
    /// regardless of whether this relay ever ends up forwarding anything.
    CreateOutgoingSender {
        tag: FullPaymentTag,
    },
    SendMultiPart {
        tag: FullPaymentTag,
        route: OutgoingRouteConstraints,
    },
    SetPreimage {
        hash: PaymentHash,
        preimage: PaymentPreimage,
    },
    AddRelayedPreimageInfo {
        tag: FullPaymentTag,
        preimage: PaymentPreimage,
        relayed_msat: u64,
        earned_msat: u64,
    },
    FulfillHtlc {
        add: UpdateAddHTLC,
        preimage: PaymentPreimage,
    },
    FailHtlc {
        add: UpdateAddHTLC,
        failure: FailureMessage,
    },
    ArmTimeout,
    CancelTimeout,
}

#[derive(Clone, Debug)]
pub enum Event {
    Revealed(PaymentPreimage),
    Aborted(FailureMessage),
}

pub struct TrampolineFsm {
    pub tag: FullPaymentTag,
    state: State,
    config: TrampolineConfig,
    preimage_cache: PreimageCache,
    operational_channels: HashSet<[u8; 32]>,
    current_height: u32,
    reserved_fee_msat: u64,
    required_fee_msat: u64,
    outcome: Option<Outcome>,
}

impl TrampolineFsm {
    /// Returns the new FSM plus the commands its creation implies -- just
    /// `CreateOutgoingSender`, unconditionally (§4.6: "on entry").
    pub fn new(
        tag: FullPaymentTag,
        config: TrampolineConfig,
        preimage_cache: PreimageCache,
        operational_channels: HashSet<[u8; 32]>,
        current_height: u32,
    ) -> (Self, Vec<Command>) {
        let fsm = Self {
            tag,
            state: State::Receiving,
            config,
            preimage_cache,
            operational_channels,
            current_height,
            reserved_fee_msat: 0,
            required_fee_msat: 0,
            outcome: None,
        };
        (fsm, vec![Command::CreateOutgoingSender { tag }])
    }

    pub fn state(&self) -> State {
        self.state
    }

    #[instrument(skip_all, name = "(trampoline-fsm)")]
    pub fn handle(
        &mut self,
        message: Message,
        current_height: u32,
    ) -> (Vec<Command>, Vec<Event>) {
        self.current_height = current_height;
        let mut commands = Vec::new();
        let mut events = Vec::new();

        match self.state {
            State::Receiving => self.handle_receiving(message, &mut commands, &mut events),
            State::Sending(mode) => self.handle_sending(mode, message, &mut commands, &mut events),
            State::Finalizing => self.handle_finalizing(message, &mut commands, &mut events),
            State::Shutdown => {}
        }

        (commands, events)
    }

    fn handle_receiving(
        &mut self,
        message: Message,
        commands: &mut Vec<Command>,
        events: &mut Vec<Event>,
    ) {
        match message {
            Message::Timeout => {
                // Still RECEIVING means nothing was ever sent out.
                self.abort(FailureMessage::PaymentTimeout, commands, events);
            }
            Message::OutgoingOutcome(_) => {
                warn!(tag = ?self.tag, "outgoing outcome while still receiving, ignoring");
            }
            Message::Snapshot(snapshot) => {
                let parts = snapshot.incoming_for(self.tag);
                if parts.is_empty() {
                    return;
                }
                commands.push(Command::ArmTimeout);

                // Rule 1: a known preimage fulfills and finalizes directly,
                // regardless of whatever the (unconditionally created)
                // outgoing sender is doing -- it's no longer relevant to
                // this relay's incoming fate.
                if let Some(preimage) = self.preimage_cache.get(self.tag.payment_hash) {
                    self.fulfill_and_finalize(preimage, parts, commands, events);
                    return;
                }

                let outgoing_exists = !snapshot.outgoing_for(self.tag).is_empty();
                // Wait for the full multipart set the sender claims, same
                // gate the local receiver uses (rule 4) -- fee sufficiency
                // is one of `validate`'s own checks, run only once every
                // claimed part is thought to be in hand, so a still-
                // incomplete MPP set isn't mistaken for an underpaid one.
                let claimed_total = parts.first().map(|p| p.payload.total_amount_msat);
                let incoming_total: u64 = parts.iter().map(|p| p.amount_msat).sum();
                let floor = claimed_total.unwrap_or(u64::MAX);

                if incoming_total >= floor {
                    if !outgoing_exists {
                        match validate(
                            parts,
                            &self.config,
                            self.current_height,
                            &self.operational_channels,
                        ) {
                            Ok(validated) => {
                                self.reserved_fee_msat = validated.reserved_fee_msat;
                                self.required_fee_msat = validated.required_fee_msat;
                                commands.push(Command::SendMultiPart {
                                    tag: self.tag,
                                    route: validated.route,
                                });
                                self.state = State::Sending(SendingMode::Processing);
                            }
                            Err(failure) => self.abort(failure, commands, events),
                        }
                    } else {
                        // A leftover outgoing attempt from a prior run, and
                        // the current incoming parts still cover it -- wait
                        // for it to conclude, then retry validation fresh.
                        self.state = State::Sending(SendingMode::StoppingRetry);
                    }
                } else if outgoing_exists {
                    // Pathological restart: a leftover outgoing attempt with
                    // an incoming set that no longer covers it.
                    self.state = State::Sending(SendingMode::StoppingNoRetry);
                }
                // Otherwise: wait for more parts.
            }
        }
    }

    fn handle_sending(
        &mut self,
        mode: SendingMode,
        message: Message,
        commands: &mut Vec<Command>,
        events: &mut Vec<Event>,
    ) {
        match message {
            Message::Timeout => {
                // The timeout only governs RECEIVING; an attempt already in
                // flight runs to its own conclusion.
            }
            Message::OutgoingOutcome(OutgoingOutcome::Preimage { preimage, parts }) => {
                self.reveal(preimage, &parts, commands);
                self.state = State::Sending(SendingMode::Revealed);
            }
            Message::OutgoingOutcome(OutgoingOutcome::Failure(failures)) => match mode {
                SendingMode::Processing | SendingMode::StoppingNoRetry => {
                    self.abort(choose_failure(&failures), commands, events);
                }
                SendingMode::StoppingRetry => {
                    info!(tag = ?self.tag, "leftover outgoing attempt failed, retrying from scratch");
                    self.state = State::Receiving;
                }
                SendingMode::Revealed => {
                    // Spurious: the preimage is already known, so nothing
                    // about this relay's incoming fate changes.
                }
            },
            Message::Snapshot(snapshot) => {
                if mode == SendingMode::Revealed {
                    let parts = snapshot.incoming_for(self.tag);
                    if let Some(Outcome::Revealed(preimage)) = self.outcome {
                        for part in parts {
                            commands.push(Command::FulfillHtlc {
                                add: part.htlc.clone(),
                                preimage,
                            });
                        }
                    }
                    if snapshot.outgoing_for(self.tag).is_empty() {
                        self.state = State::Finalizing;
                    }
                }
            }
        }
    }

    fn handle_finalizing(
        &mut self,
        message: Message,
        commands: &mut Vec<Command>,
        events: &mut Vec<Event>,
    ) {
        match message {
            Message::Timeout => {}
            // A preimage can still arrive after FINALIZING was entered for
            // an abort reason (e.g. a slow outgoing sender); atomicity
            // requires honoring it even this late.
            Message::OutgoingOutcome(OutgoingOutcome::Preimage { preimage, parts }) => {
                if !matches!(self.outcome, Some(Outcome::Revealed(_))) {
                    self.reveal(preimage, &parts, commands);
                    events.push(Event::Revealed(preimage));
                }
            }
            Message::OutgoingOutcome(OutgoingOutcome::Failure(_)) => {
                // Already finalizing one way or another; a late failure
                // changes nothing.
            }
            Message::Snapshot(snapshot) => {
                let parts = snapshot.incoming_for(self.tag);
                if parts.is_empty() {
                    self.state = State::Shutdown;
                    commands.push(Command::CancelTimeout);
                    return;
                }
                match self.outcome.clone() {
                    Some(Outcome::Revealed(preimage)) => {
                        for part in parts {
                            commands.push(Command::FulfillHtlc {
                                add: part.htlc.clone(),
                                preimage,
                            });
                        }
                    }
                    Some(Outcome::Aborted(failure)) => {
                        for part in parts {
                            commands.push(Command::FailHtlc {
                                add: part.htlc.clone(),
                                failure: failure.clone(),
                            });
                        }
                    }
                    None => {
                        warn!("finalizing trampoline relay with no retained outcome, this is a bug");
                    }
                }
            }
        }
    }

    /// Records a revealed preimage: persists it, accounts for earnings, and
    /// fulfills whatever incoming parts were passed in. Does not itself
    /// change `self.state` -- callers decide whether that means SENDING or
    /// FINALIZING.
    fn reveal(
        &mut self,
        preimage: PaymentPreimage,
        sender_parts: &[super::OutgoingPart],
        commands: &mut Vec<Command>,
    ) {
        commands.push(Command::SetPreimage {
            hash: self.tag.payment_hash,
            preimage,
        });
        let earned_msat = if !sender_parts.is_empty() {
            let used_fee_msat: u64 = sender_parts.iter().map(|p| p.used_fee_msat).sum();
            self.reserved_fee_msat.saturating_sub(used_fee_msat)
        } else {
            self.required_fee_msat
        };
        commands.push(Command::AddRelayedPreimageInfo {
            tag: self.tag,
            preimage,
            relayed_msat: sender_parts.iter().map(|p| p.amount_msat).sum(),
            earned_msat,
        });
        info!(tag = ?self.tag, earned_msat, "trampoline relay revealed preimage");
        self.outcome = Some(Outcome::Revealed(preimage));
    }

    /// Fulfills every currently-present incoming part and moves straight to
    /// FINALIZING -- used when the preimage was already known before any
    /// outgoing attempt in this run reported one (rule 1 and restarts where
    /// the invoice was already settled by a prior process).
    fn fulfill_and_finalize(
        &mut self,
        preimage: PaymentPreimage,
        parts: &[IncomingPart],
        commands: &mut Vec<Command>,
        events: &mut Vec<Event>,
    ) {
        commands.push(Command::SetPreimage {
            hash: self.tag.payment_hash,
            preimage,
        });
        commands.push(Command::AddRelayedPreimageInfo {
            tag: self.tag,
            preimage,
            relayed_msat: 0,
            earned_msat: self.required_fee_msat,
        });
        for part in parts {
            commands.push(Command::FulfillHtlc {
                add: part.htlc.clone(),
                preimage,
            });
        }
        self.outcome = Some(Outcome::Revealed(preimage));
        self.state = State::Finalizing;
        events.push(Event::Revealed(preimage));
    }

    fn abort(
        &mut self,
        failure: FailureMessage,
        commands: &mut Vec<Command>,
        events: &mut Vec<Event>,
    ) {
        info!(tag = ?self.tag, ?failure, "trampoline relay aborting");
        self.outcome = Some(Outcome::Aborted(failure.clone()));
        self.state = State::Finalizing;
        commands.push(Command::CancelTimeout);
        events.push(Event::Aborted(failure));
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::payments::{IncomingPayload, OutgoingPart, TagKind};
    use lightning::ln::PaymentSecret;

    fn config() -> TrampolineConfig {
        TrampolineConfig {
            base_fee_msat: 1000,
            proportional_ppm: 100,
            fee_exponent: 0.0,
            fee_log_exponent: 1.0,
            min_cltv_delta: 40,
            min_forward_msat: 1,
            cltv_reject_threshold: 10,
        }
    }

    fn tag() -> FullPaymentTag {
        FullPaymentTag {
            payment_hash: PaymentHash([7u8; 32]),
            payment_secret: PaymentSecret([8u8; 32]),
            tag: TagKind::Trampoline,
        }
    }

    fn routing() -> PendingHTLCRouting {
        PendingHTLCRouting::Forward {
            onion_packet: lightning::ln::msgs::OnionPacket {
                version: 0,
                public_key: Err(bitcoin::secp256k1::Error::InvalidPublicKey),
                hop_data: [0u8; 1300],
                hmac: [0u8; 32],
            },
            short_channel_id: 12345,
        }
    }

    fn part(
        amount_msat: u64,
        cltv_expiry: u32,
        total_amount_msat: u64,
        amount_to_forward_msat: u64,
        outgoing_cltv_value: u32,
        channel_id: [u8; 32],
    ) -> IncomingPart {
        IncomingPart {
            htlc: UpdateAddHTLC {
                channel_id,
                htlc_id: 0,
                amount_msat,
                payment_hash: tag().payment_hash,
                cltv_expiry,
                onion_routing_packet: lightning::ln::msgs::OnionPacket {
                    version: 0,
                    public_key: Err(bitcoin::secp256k1::Error::InvalidPublicKey),
                    hop_data: [0u8; 1300],
                    hmac: [0u8; 32],
                },
            },
            payload: IncomingPayload {
                total_amount_msat,
                payment_secret: Some(tag().payment_secret),
                trampoline: Some(TrampolinePayload {
                    amount_to_forward_msat,
                    outgoing_cltv_value,
                    next_trampoline_routing: routing(),
                    invoice_features_present: false,
                }),
            },
            cltv_expiry,
            amount_msat,
            channel_id,
        }
    }

    fn snapshot_with(incoming: Vec<IncomingPart>, outgoing: Vec<OutgoingPart>) -> InFlightPayments {
        let mut snapshot = InFlightPayments::default();
        snapshot.incoming.insert(tag(), incoming);
        if !outgoing.is_empty() {
            snapshot.outgoing.insert(tag(), outgoing);
        }
        snapshot
    }

    fn channels(ids: &[[u8; 32]]) -> HashSet<[u8; 32]> {
        ids.iter().copied().collect()
    }

    fn new_fsm(height: u32) -> TrampolineFsm {
        let (fsm, commands) = TrampolineFsm::new(
            tag(),
            config(),
            PreimageCache::new(16),
            channels(&[[1u8; 32]]),
            height,
        );
        assert!(matches!(
            commands.as_slice(),
            [Command::CreateOutgoingSender { .. }]
        ));
        fsm
    }

    #[test]
    fn creation_always_emits_create_outgoing_sender() {
        let fsm = new_fsm(100);
        assert_eq!(fsm.state(), State::Receiving);
    }

    #[test]
    fn valid_forward_moves_to_sending_and_requests_route() {
        let mut fsm = new_fsm(100);
        // amount_to_forward=100_000, required fee = ceil(1000 + 10 + 0.1) =
        // 1011, so incoming of 101_100 (also the claimed total, so the
        // waiting gate is satisfied) comfortably covers it.
        let p = part(101_100, 600, 101_100, 100_000, 540, [1u8; 32]);
        let (commands, _events) =
            fsm.handle(Message::Snapshot(snapshot_with(vec![p], vec![])), 100);
        assert!(commands
            .iter()
            .any(|c| matches!(c, Command::SendMultiPart { .. })));
        assert_eq!(fsm.state(), State::Sending(SendingMode::Processing));
    }

    #[test]
    fn partial_amount_waits_for_more_parts() {
        let mut fsm = new_fsm(100);
        // Claims a total of 101_100 but only 40_000 has arrived so far.
        let p = part(40_000, 600, 101_100, 100_000, 540, [1u8; 32]);
        let (_commands, events) =
            fsm.handle(Message::Snapshot(snapshot_with(vec![p], vec![])), 100);
        assert!(events.is_empty());
        assert_eq!(fsm.state(), State::Receiving);
    }

    #[test]
    fn insufficient_fee_aborts_with_trampoline_fee_insufficient() {
        let mut fsm = new_fsm(100);
        // amount_to_forward=100_000, incoming (and claimed total) exactly
        // equal -- no fee left once every claimed part is in hand.
        let p = part(100_000, 600, 100_000, 100_000, 540, [1u8; 32]);
        let (_commands, events) =
            fsm.handle(Message::Snapshot(snapshot_with(vec![p], vec![])), 100);
        assert!(matches!(
            events[0],
            Event::Aborted(FailureMessage::TrampolineFeeInsufficient)
        ));
        assert_eq!(fsm.state(), State::Finalizing);
    }

    #[test]
    fn expiry_too_close_to_tip_aborts() {
        let mut fsm = new_fsm(100);
        // min_cltv_delta is 40, incoming-outgoing gap is only 20.
        let p = part(101_100, 560, 101_100, 100_000, 540, [1u8; 32]);
        let (_commands, events) =
            fsm.handle(Message::Snapshot(snapshot_with(vec![p], vec![])), 100);
        assert!(matches!(
            events[0],
            Event::Aborted(FailureMessage::TrampolineExpiryTooSoon)
        ));
    }

    #[test]
    fn non_operational_channel_aborts_with_temporary_node_failure() {
        let mut fsm = new_fsm(100);
        let p = part(101_100, 600, 101_100, 100_000, 540, [9u8; 32]);
        let (_commands, events) =
            fsm.handle(Message::Snapshot(snapshot_with(vec![p], vec![])), 100);
        assert!(matches!(
            events[0],
            Event::Aborted(FailureMessage::TemporaryNodeFailure)
        ));
    }

    #[test]
    fn reveal_fulfills_all_present_parts_despite_outgoing_failure_on_other_parts() {
        let mut fsm = new_fsm(100);
        let p = part(101_100, 600, 101_100, 100_000, 540, [1u8; 32]);
        fsm.handle(Message::Snapshot(snapshot_with(vec![p.clone()], vec![])), 100);
        assert_eq!(fsm.state(), State::Sending(SendingMode::Processing));

        let (commands, _events) = fsm.handle(
            Message::OutgoingOutcome(OutgoingOutcome::Preimage {
                preimage: PaymentPreimage([4u8; 32]),
                parts: vec![OutgoingPart {
                    amount_msat: 100_000,
                    used_fee_msat: 500,
                    peer_channel_id: [2u8; 32],
                }],
            }),
            100,
        );
        assert!(commands
            .iter()
            .any(|c| matches!(c, Command::AddRelayedPreimageInfo { earned_msat: 600, .. })));
        assert_eq!(fsm.state(), State::Sending(SendingMode::Revealed));

        // A late incoming leftover still gets fulfilled.
        let (commands, _events) = fsm.handle(
            Message::Snapshot(snapshot_with(vec![p], vec![])),
            100,
        );
        assert!(commands
            .iter()
            .any(|c| matches!(c, Command::FulfillHtlc { .. })));

        // Once the outgoing side has drained, move to FINALIZING.
        let (_commands, _events) =
            fsm.handle(Message::Snapshot(snapshot_with(vec![], vec![])), 100);
        assert_eq!(fsm.state(), State::Finalizing);
    }

    #[test]
    fn outgoing_failure_while_processing_aborts_and_picks_final_node_message() {
        let mut fsm = new_fsm(100);
        let p = part(101_100, 600, 101_100, 100_000, 540, [1u8; 32]);
        fsm.handle(Message::Snapshot(snapshot_with(vec![p], vec![])), 100);

        let (_commands, events) = fsm.handle(
            Message::OutgoingOutcome(OutgoingOutcome::Failure(vec![
                OutgoingFailure::Other,
                OutgoingFailure::Remote {
                    from_final_node: true,
                    message: FailureMessage::IncorrectOrUnknownPaymentDetails {
                        amount_msat: 100_000,
                        height: 100,
                    },
                },
            ])),
            100,
        );
        assert!(matches!(
            events[0],
            Event::Aborted(FailureMessage::IncorrectOrUnknownPaymentDetails { .. })
        ));
        assert_eq!(fsm.state(), State::Finalizing);
    }

    #[test]
    fn restart_with_leftover_outgoing_retries_after_failure() {
        let mut fsm = new_fsm(100);
        let p = part(101_100, 600, 101_100, 100_000, 540, [1u8; 32]);
        let leftover = OutgoingPart {
            amount_msat: 100_000,
            used_fee_msat: 500,
            peer_channel_id: [2u8; 32],
        };
        fsm.handle(
            Message::Snapshot(snapshot_with(vec![p.clone()], vec![leftover])),
            100,
        );
        assert_eq!(fsm.state(), State::Sending(SendingMode::StoppingRetry));

        fsm.handle(
            Message::OutgoingOutcome(OutgoingOutcome::Failure(vec![OutgoingFailure::Other])),
            100,
        );
        assert_eq!(fsm.state(), State::Receiving);
    }

    #[test]
    fn timeout_while_receiving_with_nothing_outgoing_aborts() {
        let mut fsm = new_fsm(100);
        let (commands, events) = fsm.handle(Message::Timeout, 100);
        assert!(matches!(
            events[0],
            Event::Aborted(FailureMessage::PaymentTimeout)
        ));
        assert!(commands.iter().any(|c| matches!(c, Command::CancelTimeout)));
    }

    #[test]
    fn finalizing_shuts_down_once_tag_vanishes() {
        let mut fsm = new_fsm(100);
        let p = part(100_000, 600, 100_000, 100_000, 540, [1u8; 32]);
        fsm.handle(Message::Snapshot(snapshot_with(vec![p], vec![])), 100);
        assert_eq!(fsm.state(), State::Finalizing);

        let (commands, _events) =
            fsm.handle(Message::Snapshot(snapshot_with(vec![], vec![])), 100);
        assert!(commands.iter().any(|c| matches!(c, Command::CancelTimeout)));
        assert_eq!(fsm.state(), State::Shutdown);
    }
}
