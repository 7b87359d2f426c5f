//! The local receiver FSM (§4.5): merges incoming multipart HTLCs against a
//! local invoice (or, for rule 1 below, a bare known preimage with no
//! invoice at all -- a spontaneous/keysend-style receive).
//!
//! States: RECEIVING, FINALIZING, SHUTDOWN. One instance is created per
//! `FullPaymentTag` on its first matching HTLC and destroyed once every part
//! has resolved, mirroring the wallet FSM's single mailbox-drain discipline
//! in `wallet::fsm`.

use lightning::ln::msgs::UpdateAddHTLC;
use lightning::ln::{PaymentHash, PaymentPreimage};
use tracing::{info, instrument, warn};

use super::preimage_cache::PreimageCache;
use super::{FullPaymentTag, IncomingPart, InFlightPayments};
use crate::error::FailureMessage;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum InvoiceStatus {
    Pending,
    /// The invoice was already marked succeeded, e.g. by a prior run of
    /// this same FSM before a restart. `preimage` is carried alongside the
    /// invoice rather than looked up separately: it is known the moment
    /// the invoice is created, since the hash committed to the invoice is
    /// derived from it.
    Succeeded,
}

/// What this receiver is matching incoming parts against. `None` models a
/// bare spontaneous receive with no invoice at all (rule 1 below still
/// applies via the preimage cache).
#[derive(Clone, Debug)]
pub struct InvoiceView {
    pub amount_msat: u64,
    pub preimage: PaymentPreimage,
    pub status: InvoiceStatus,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum State {
    Receiving,
    Finalizing,
    Shutdown,
}

/// The retained finalization outcome, replayed identically on every
/// subsequent snapshot while in FINALIZING (§7: "retained in the FSM so
/// repeated snapshots produce identical error bytes").
#[derive(Clone, Debug)]
enum FinalOutcome {
    Revealed(PaymentPreimage),
    /// `None` means "no specific message": the peer gets
    /// `IncorrectOrUnknownPaymentDetails(amount, height)` computed
    /// per-part at send time. `Some` is a literal message replayed as-is.
    Aborted(Option<FailureMessage>),
}

#[derive(Clone, Debug)]
pub enum Message {
    Snapshot(InFlightPayments),
    /// The single `CMDTimeout` timer (armed on creation, reset on each new
    /// part) fired.
    Timeout,
}

/// What a driving loop must do in response to a `handle()` call. Never
/// awaited inline by the FSM itself (§5).
#[derive(Clone, Debug)]
pub enum Command {
    SetPreimage {
        hash: PaymentHash,
        preimage: PaymentPreimage,
    },
    MarkInvoiceSucceeded {
        tag: FullPaymentTag,
        received_msat: u64,
    },
    AddSearchablePayment {
        tag: FullPaymentTag,
    },
    FulfillHtlc {
        add: UpdateAddHTLC,
        preimage: PaymentPreimage,
    },
    /// `failure = None` means the per-part `IncorrectOrUnknownPaymentDetails`
    /// default; the driving loop fills in the current block height itself.
    FailHtlc {
        add: UpdateAddHTLC,
        failure: Option<FailureMessage>,
    },
    ArmTimeout,
    CancelTimeout,
}

/// Either a literal event the FSM emitted, for the owning manager to log or
/// surface upstream (e.g. to mark a UI-visible payment state).
#[derive(Clone, Debug)]
pub enum Event {
    Revealed(PaymentPreimage),
    Aborted(Option<FailureMessage>),
}

pub struct ReceiverFsm {
    pub tag: FullPaymentTag,
    state: State,
    invoice: Option<InvoiceView>,
    preimage_cache: PreimageCache,
    cltv_reject_threshold: u32,
    current_height: u32,
    outcome: Option<FinalOutcome>,
}

impl ReceiverFsm {
    pub fn new(
        tag: FullPaymentTag,
        invoice: Option<InvoiceView>,
        preimage_cache: PreimageCache,
        cltv_reject_threshold: u32,
        current_height: u32,
    ) -> Self {
        Self {
            tag,
            state: State::Receiving,
            invoice,
            preimage_cache,
            cltv_reject_threshold,
            current_height,
            outcome: None,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    #[instrument(skip_all, name = "(receiver-fsm)")]
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
            State::Finalizing => self.handle_finalizing(message, &mut commands),
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
                self.abort(Some(FailureMessage::PaymentTimeout), commands, events);
            }
            Message::Snapshot(snapshot) => {
                let parts = snapshot.incoming_for(self.tag);
                if parts.is_empty() {
                    return;
                }
                commands.push(Command::ArmTimeout);

                // Rule 1: a known preimage fulfills even with no invoice.
                if let Some(preimage) = self.preimage_cache.get(self.tag.payment_hash) {
                    self.fulfill(preimage, parts, commands, events);
                    return;
                }

                // Rule 2: an already-succeeded invoice is an idempotent
                // retry -- the preimage that made it succeed is known
                // already, since it was derived before the invoice's hash
                // was ever committed.
                if let Some(invoice) = &self.invoice {
                    if invoice.status == InvoiceStatus::Succeeded {
                        let preimage = invoice.preimage;
                        self.fulfill(preimage, parts, commands, events);
                        return;
                    }
                }

                // Rule 3: any part's CLTV is too close to the tip.
                let too_close = parts
                    .iter()
                    .any(|p| p.cltv_expiry <= self.current_height + self.cltv_reject_threshold);
                if too_close {
                    self.abort(None, commands, events);
                    return;
                }

                // Rule 4: the aggregate covers the invoice amount.
                if let Some(invoice) = &self.invoice {
                    let total: u64 = parts.iter().map(|p| p.amount_msat).sum();
                    if total >= invoice.amount_msat {
                        let preimage = invoice.preimage;
                        self.fulfill(preimage, parts, commands, events);
                        return;
                    }
                }

                // Rule 5: wait for more parts.
            }
        }
    }

    fn handle_finalizing(&mut self, message: Message, commands: &mut Vec<Command>) {
        let Message::Snapshot(snapshot) = message else {
            return;
        };
        let parts = snapshot.incoming_for(self.tag);
        if parts.is_empty() {
            self.state = State::Shutdown;
            commands.push(Command::CancelTimeout);
            return;
        }
        match self.outcome.clone() {
            Some(FinalOutcome::Revealed(preimage)) => {
                for part in parts {
                    commands.push(Command::FulfillHtlc {
                        add: part.htlc.clone(),
                        preimage,
                    });
                }
            }
            Some(FinalOutcome::Aborted(failure)) => {
                for part in parts {
                    commands.push(Command::FailHtlc {
                        add: part.htlc.clone(),
                        failure: failure.clone(),
                    });
                }
            }
            None => {
                warn!("finalizing receiver with no retained outcome, this is a bug");
            }
        }
    }

    fn fulfill(
        &mut self,
        preimage: PaymentPreimage,
        parts: &[IncomingPart],
        commands: &mut Vec<Command>,
        events: &mut Vec<Event>,
    ) {
        let received_msat: u64 = parts.iter().map(|p| p.amount_msat).sum();
        // Persistence precedes transmission (§5 ordering guarantee,
        // testable property 5): these three commands are expected to run,
        // in order, inside a single storage transaction before any
        // `FulfillHtlc` command is executed.
        commands.push(Command::SetPreimage {
            hash: self.tag.payment_hash,
            preimage,
        });
        commands.push(Command::MarkInvoiceSucceeded {
            tag: self.tag,
            received_msat,
        });
        commands.push(Command::AddSearchablePayment { tag: self.tag });
        for part in parts {
            commands.push(Command::FulfillHtlc {
                add: part.htlc.clone(),
                preimage,
            });
        }
        info!(tag = ?self.tag, parts = parts.len(), "receiver revealed preimage");
        self.outcome = Some(FinalOutcome::Revealed(preimage));
        self.state = State::Finalizing;
        events.push(Event::Revealed(preimage));
    }

    fn abort(
        &mut self,
        failure: Option<FailureMessage>,
        commands: &mut Vec<Command>,
        events: &mut Vec<Event>,
    ) {
        info!(tag = ?self.tag, ?failure, "receiver aborting");
        self.outcome = Some(FinalOutcome::Aborted(failure.clone()));
        self.state = State::Finalizing;
        commands.push(Command::CancelTimeout);
        events.push(Event::Aborted(failure));
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::payments::{IncomingPayload, TagKind};
    use lightning::ln::PaymentSecret;

    fn tag() -> FullPaymentTag {
        FullPaymentTag {
            payment_hash: PaymentHash([1u8; 32]),
            payment_secret: PaymentSecret([2u8; 32]),
            tag: TagKind::Local,
        }
    }

    fn part(amount_msat: u64, cltv_expiry: u32) -> IncomingPart {
        IncomingPart {
            htlc: UpdateAddHTLC {
                channel_id: [0u8; 32],
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
                total_amount_msat: amount_msat,
                payment_secret: Some(tag().payment_secret),
                trampoline: None,
            },
            cltv_expiry,
            amount_msat,
            channel_id: [0u8; 32],
        }
    }

    fn snapshot_with(parts: Vec<IncomingPart>) -> InFlightPayments {
        let mut snapshot = InFlightPayments::default();
        snapshot.incoming.insert(tag(), parts);
        snapshot
    }

    fn invoice(amount_msat: u64) -> InvoiceView {
        InvoiceView {
            amount_msat,
            preimage: PaymentPreimage([9u8; 32]),
            status: InvoiceStatus::Pending,
        }
    }

    #[test]
    fn happy_path_fulfills_once_aggregate_covers_invoice() {
        // Scenario S1.
        let cache = PreimageCache::new(16);
        let mut fsm = ReceiverFsm::new(tag(), Some(invoice(1000)), cache, 180, 100);
        let (commands, events) =
            fsm.handle(Message::Snapshot(snapshot_with(vec![part(1000, 200)])), 100);
        assert!(matches!(events[0], Event::Revealed(_)));
        assert!(commands
            .iter()
            .any(|c| matches!(c, Command::FulfillHtlc { .. })));
        assert_eq!(fsm.state(), State::Finalizing);
    }

    #[test]
    fn cltv_too_close_to_tip_aborts_with_no_explicit_message() {
        // Scenario S2: height 100, threshold 180, part cltv 150.
        let cache = PreimageCache::new(16);
        let mut fsm = ReceiverFsm::new(tag(), Some(invoice(1000)), cache, 180, 100);
        let (_commands, events) =
            fsm.handle(Message::Snapshot(snapshot_with(vec![part(1000, 150)])), 100);
        assert!(matches!(events[0], Event::Aborted(None)));
    }

    #[test]
    fn known_preimage_fulfills_with_no_invoice_at_all() {
        let cache = PreimageCache::new(16);
        cache.insert(tag().payment_hash, PaymentPreimage([5u8; 32]));
        let mut fsm = ReceiverFsm::new(tag(), None, cache, 180, 100);
        let (_commands, events) =
            fsm.handle(Message::Snapshot(snapshot_with(vec![part(10, 500)])), 100);
        assert!(matches!(events[0], Event::Revealed(p) if p == PaymentPreimage([5u8; 32])));
    }

    #[test]
    fn partial_amount_waits_for_more_parts() {
        let cache = PreimageCache::new(16);
        let mut fsm = ReceiverFsm::new(tag(), Some(invoice(1000)), cache, 180, 100);
        let (_commands, events) =
            fsm.handle(Message::Snapshot(snapshot_with(vec![part(400, 500)])), 100);
        assert!(events.is_empty());
        assert_eq!(fsm.state(), State::Receiving);
    }

    #[test]
    fn finalizing_reissues_fulfill_until_tag_vanishes() {
        let cache = PreimageCache::new(16);
        let mut fsm = ReceiverFsm::new(tag(), Some(invoice(1000)), cache, 180, 100);
        fsm.handle(Message::Snapshot(snapshot_with(vec![part(1000, 200)])), 100);

        let (commands, _) =
            fsm.handle(Message::Snapshot(snapshot_with(vec![part(1000, 200)])), 100);
        assert!(commands
            .iter()
            .any(|c| matches!(c, Command::FulfillHtlc { .. })));

        let (commands, _) = fsm.handle(Message::Snapshot(snapshot_with(vec![])), 100);
        assert!(commands
            .iter()
            .any(|c| matches!(c, Command::CancelTimeout)));
        assert_eq!(fsm.state(), State::Shutdown);
    }
}
