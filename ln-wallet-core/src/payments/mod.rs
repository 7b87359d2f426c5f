//! Core B: incoming-payment relay.
//!
//! `FullPaymentTag` is the fingerprint that groups HTLC parts into one
//! logical payment (§4.4); `receiver` and `trampoline` are the two FSMs
//! that consume `InFlightPayments` snapshots keyed by it.

pub mod preimage_cache;
pub mod receiver;
pub mod trampoline;

pub use preimage_cache::PreimageCache;
pub use trampoline::TrampolineConfig;

use std::collections::HashMap;

use lightning::ln::channelmanager::PendingHTLCRouting;
use lightning::ln::msgs::UpdateAddHTLC;
use lightning::ln::{PaymentHash, PaymentPreimage, PaymentSecret};

pub use crate::error::FailureMessage;

/// Which role this payment tag plays: the final hop of an incoming
/// payment, or an intermediate relay forwarding further via trampoline.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum TagKind {
    Local,
    Trampoline,
}

/// Fingerprint of one HTLC stream. `payment_secret` disambiguates distinct
/// concurrent payments that happen to share a `payment_hash` (e.g. two
/// invoices paid with the same preimage, or trampoline-over-MPP); every
/// part of one logical payment shares the same tag.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct FullPaymentTag {
    pub payment_hash: PaymentHash,
    pub payment_secret: PaymentSecret,
    pub tag: TagKind,
}

/// One inbound HTLC part, carrying the onion payload needed to decide
/// whether to fulfill, forward, or fail it.
#[derive(Clone)]
pub struct IncomingPart {
    pub htlc: UpdateAddHTLC,
    /// The decrypted payload: for a local part, the amount and total the
    /// sender claims; for a trampoline part, also the nested packet.
    pub payload: IncomingPayload,
    pub cltv_expiry: u32,
    pub amount_msat: u64,
    /// Channel this HTLC arrived on; used to exclude the inbound peer from
    /// outgoing trampoline routing and to check channel operational state.
    pub channel_id: [u8; 32],
}

#[derive(Clone)]
pub struct IncomingPayload {
    pub total_amount_msat: u64,
    pub payment_secret: Option<PaymentSecret>,
    /// Present only for trampoline parts: the further packet to forward,
    /// plus the inner payload's own claims about amount and expiry.
    pub trampoline: Option<TrampolinePayload>,
}

#[derive(Clone)]
pub struct TrampolinePayload {
    pub amount_to_forward_msat: u64,
    pub outgoing_cltv_value: u32,
    pub next_trampoline_routing: PendingHTLCRouting,
    pub invoice_features_present: bool,
}

/// One outgoing part of a trampoline relay, as reported by the outgoing
/// multipart sender sub-FSM (an out-of-scope collaborator delivering
/// events through a narrow listener port).
#[derive(Clone)]
pub struct OutgoingPart {
    pub amount_msat: u64,
    pub used_fee_msat: u64,
    pub peer_channel_id: [u8; 32],
}

/// Terminal outcome of an outgoing multipart send attempt, as delivered
/// through the narrow listener port the (out-of-scope) outgoing sender
/// calls back on.
#[derive(Clone, Debug)]
pub enum OutgoingOutcome {
    /// `parts` is the sender's view of its own in-flight parts at the
    /// moment of reveal ("sender data" in §4.6); used to compute relay
    /// earnings. Empty on a restart where that bookkeeping wasn't
    /// available, in which case the relayer falls back to its own nominal
    /// scheduled fee.
    Preimage {
        preimage: PaymentPreimage,
        parts: Vec<OutgoingPart>,
    },
    /// Every failure observed across the attempt's routing tries, in
    /// whatever order the sender encountered them; §4.6's failure-choice
    /// priority (final node, then any intermediate, then local
    /// no-routes-found, else generic) scans this list.
    Failure(Vec<OutgoingFailure>),
}

#[derive(Clone, Debug)]
pub enum OutgoingFailure {
    /// A remote node (possibly the final payee) explicitly failed the
    /// payment with a failure message.
    Remote {
        from_final_node: bool,
        message: FailureMessage,
    },
    /// The local router found no viable route.
    NoRouteFound,
    Other,
}

/// A point-in-time snapshot of all in-flight HTLC activity, keyed by tag.
/// Both FSMs react to snapshots rather than raw per-HTLC events so that
/// restart recovery and steady-state operation share one code path.
#[derive(Clone, Default)]
pub struct InFlightPayments {
    pub incoming: HashMap<FullPaymentTag, Vec<IncomingPart>>,
    pub outgoing: HashMap<FullPaymentTag, Vec<OutgoingPart>>,
}

impl InFlightPayments {
    pub fn incoming_for(&self, tag: FullPaymentTag) -> &[IncomingPart] {
        self.incoming.get(&tag).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn outgoing_for(&self, tag: FullPaymentTag) -> &[OutgoingPart] {
        self.outgoing.get(&tag).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn incoming_total_msat(&self, tag: FullPaymentTag) -> u64 {
        self.incoming_for(tag).iter().map(|p| p.amount_msat).sum()
    }
}
