//! §4.1 Exchange: the per-exchange MRP state machine. The largest single
//! component in the core — send/retransmit, receive/ack, standalone-ack
//! timing, and the close/closing-grace dance.
//!
//! The retransmission sub-machine runs inline inside [`Exchange::send`]
//! rather than as a detached background task: the caller is already the
//! natural owner of "wait for ack or fail", and keeping it inline means
//! there is exactly one place that decides when a send is over. The
//! standalone-ack timer is the one piece of state the *exchange itself*
//! must drive unprompted (nobody is blocked waiting for it), so that one
//! does get a background task, spawned off a `Weak` the way the teacher's
//! `transport.rs` spawns its reader loop off `Arc::downgrade`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, Mutex, Notify};

use crate::abort::AbortToken;
use crate::channel::Channel;
use crate::constants::{
    DEFAULT_EXPECTED_PROCESSING_TIME, MATTER_MESSAGE_OVERHEAD, MRP_MAX_TRANSMISSIONS,
    STANDALONE_ACK_TIMEOUT,
};
use crate::error::{AbortReason, ExchangeError, Result};
use crate::message::{standalone_ack, Message, PayloadHeader};
use crate::observable::Latch;
use crate::session::Session;
use crate::timer::Timer;

/// §4.1 `send` options.
pub struct SendOptions {
    pub requires_ack: Option<bool>,
    pub expect_ack_only: bool,
    pub expected_processing_time: Duration,
    pub disable_mrp_logic: bool,
    pub max_retransmissions: Option<u8>,
    pub initial_retransmission_time: Option<Duration>,
    pub max_retransmission_time: Option<Duration>,
    pub abort: AbortToken,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            requires_ack: None,
            expect_ack_only: false,
            expected_processing_time: DEFAULT_EXPECTED_PROCESSING_TIME,
            disable_mrp_logic: false,
            max_retransmissions: None,
            initial_retransmission_time: None,
            max_retransmission_time: None,
            abort: AbortToken::new(),
        }
    }
}

/// §4.1 `nextMessage` options.
pub struct ReceiveOptions {
    pub timeout: Option<Duration>,
    pub abort: AbortToken,
}

impl Default for ReceiveOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            abort: AbortToken::new(),
        }
    }
}

/// Items fed into the inbound queue (§3.4 "inbound message queue"); a close
/// cause is delivered the same way so `nextMessage` observes it without a
/// second channel.
enum Delivery {
    Message(Message),
    Closed(ExchangeError),
}

/// Outcome an in-flight `sentMessageToAck` eventually resolves to. A
/// deliberately small, `Clone`-able subset of [`ExchangeError`] — the full
/// enum carries a non-`Clone` `anyhow::Error` in its `Network` variant.
#[derive(Debug, Clone)]
enum AckOutcome {
    Acked,
    UnexpectedMessage,
    Aborted(AbortReason),
    PeerUnresponsive,
    SessionClosed,
}

struct AckSlot {
    outcome: std::sync::Mutex<Option<AckOutcome>>,
    notify: Notify,
}

impl AckSlot {
    fn new() -> Self {
        Self {
            outcome: std::sync::Mutex::new(None),
            notify: Notify::new(),
        }
    }

    fn resolve(&self, outcome: AckOutcome) {
        let mut slot = self.outcome.lock().unwrap();
        if slot.is_none() {
            *slot = Some(outcome);
        }
        self.notify.notify_waiters();
    }

    async fn wait(&self) -> AckOutcome {
        loop {
            if let Some(outcome) = self.outcome.lock().unwrap().clone() {
                return outcome;
            }
            self.notify.notified().await;
        }
    }
}

/// A sent message still awaiting its ack (§3.4 `sentMessageToAck`).
struct SentMessage {
    counter: u32,
    bytes: Vec<u8>,
    acked_message_counter: Option<u32>,
    expect_ack_only: bool,
    ack_slot: Arc<AckSlot>,
}

/// Resolution of a concurrently in-flight graceful close (§4.1 `close()`
/// steps 3-4), observed by whichever fires first: the grace timer, or the
/// ack arriving (possibly superseded by a forced close).
enum CloseSignal {
    AckObserved,
    Forced(ExchangeError),
}

/// §3.4 exchange entity.
pub struct Exchange {
    id: u16,
    protocol_id: u16,
    is_initiator: bool,
    session: Arc<dyn Session>,
    channel: Arc<dyn Channel>,

    inbound_tx: mpsc::UnboundedSender<Delivery>,
    inbound_rx: Mutex<mpsc::UnboundedReceiver<Delivery>>,

    sent_message_to_ack: Mutex<Option<SentMessage>>,
    received_message_to_ack: Mutex<Option<Message>>,
    send_in_progress: AtomicBool,

    retransmission_counter: AtomicU8,
    active_retransmit_timer: Mutex<Option<Arc<Timer>>>,
    standalone_ack_timer: Arc<Timer>,

    timed_interaction_deadline: Mutex<Option<tokio::time::Instant>>,

    close_cause: Mutex<Option<String>>,
    close_signal: Mutex<Option<CloseSignal>>,
    close_notify: Notify,
    closed: Latch,
    closing: Latch,
    peer_unresponsive: Latch,
}

fn abort_err(abort: &AbortToken) -> ExchangeError {
    ExchangeError::Aborted(abort.reason().unwrap_or(AbortReason::CallerRequested))
}

impl Exchange {
    /// Creates an exchange and spawns its standalone-ack background task.
    /// `is_initiator` is `true` for application-initiated exchanges, `false`
    /// for ones the dispatcher creates on first inbound message.
    pub fn new(
        id: u16,
        protocol_id: u16,
        is_initiator: bool,
        session: Arc<dyn Session>,
        channel: Arc<dyn Channel>,
    ) -> Arc<Self> {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let exchange = Arc::new(Self {
            id,
            protocol_id,
            is_initiator,
            session,
            channel,
            inbound_tx,
            inbound_rx: Mutex::new(inbound_rx),
            sent_message_to_ack: Mutex::new(None),
            received_message_to_ack: Mutex::new(None),
            send_in_progress: AtomicBool::new(false),
            retransmission_counter: AtomicU8::new(0),
            active_retransmit_timer: Mutex::new(None),
            standalone_ack_timer: Arc::new(Timer::parked()),
            timed_interaction_deadline: Mutex::new(None),
            close_cause: Mutex::new(None),
            close_signal: Mutex::new(None),
            close_notify: Notify::new(),
            closed: Latch::new(),
            closing: Latch::new(),
            peer_unresponsive: Latch::new(),
        });

        let weak = Arc::downgrade(&exchange);
        let timer = exchange.standalone_ack_timer.clone();
        tokio::spawn(async move {
            Self::standalone_ack_task(weak, timer).await;
        });

        exchange
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn protocol_id(&self) -> u16 {
        self.protocol_id
    }

    pub fn is_initiator(&self) -> bool {
        self.is_initiator
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_emitted()
    }

    pub fn is_closing(&self) -> bool {
        self.closing.is_emitted()
    }

    pub fn close_cause(&self) -> Option<String> {
        self.close_cause.try_lock().ok().and_then(|g| g.clone())
    }

    /// Resolves once `closed` has emitted; used by the dispatcher to reap
    /// this exchange from its session's table (§3.4 "removes itself from
    /// the session's exchange set").
    pub async fn closed(&self) {
        self.closed.wait().await
    }

    pub async fn closing(&self) {
        self.closing.wait().await
    }

    /// Resolves once this exchange has given up on an unresponsive peer
    /// (§4.1 `AckOutcome::PeerUnresponsive`). The dispatcher watches this to
    /// fan `peerLost` out to the rest of the session (§4.2) without
    /// `Exchange` holding a reference back to the manager (§9 arena note).
    pub async fn peer_unresponsive(&self) {
        self.peer_unresponsive.wait().await
    }

    /// §6.3: shortcuts the armed retransmission backoff, if any.
    pub fn kick(&self) {
        if let Ok(guard) = self.active_retransmit_timer.try_lock() {
            if let Some(timer) = guard.as_ref() {
                timer.fire_now();
            }
        }
    }

    pub async fn start_timed_interaction(&self, duration: Duration) {
        *self.timed_interaction_deadline.lock().await = Some(tokio::time::Instant::now() + duration);
    }

    pub async fn clear_timed_interaction(&self) {
        *self.timed_interaction_deadline.lock().await = None;
    }

    pub async fn has_active_timed_interaction(&self) -> bool {
        match *self.timed_interaction_deadline.lock().await {
            Some(deadline) => tokio::time::Instant::now() < deadline,
            None => false,
        }
    }

    fn max_application_payload(&self) -> usize {
        self.channel.max_payload_size().saturating_sub(MATTER_MESSAGE_OVERHEAD)
    }

    /// §4.1 `send`.
    pub async fn send(self: &Arc<Self>, opcode: u8, payload: &[u8], options: SendOptions) -> Result<()> {
        if self.closed.is_emitted() {
            return Err(ExchangeError::Closed);
        }
        let max = self.max_application_payload();
        if payload.len() > max {
            return Err(ExchangeError::PayloadTooLarge { len: payload.len(), max });
        }
        if self.send_in_progress.swap(true, Ordering::SeqCst) {
            return Err(ExchangeError::MatterFlow(
                "a previous send on this exchange still awaits its ack".into(),
            ));
        }
        let result = self.send_inner(opcode, payload, options).await;
        self.send_in_progress.store(false, Ordering::SeqCst);
        result
    }

    async fn send_inner(self: &Arc<Self>, opcode: u8, payload: &[u8], options: SendOptions) -> Result<()> {
        if options.abort.is_aborted() {
            return Err(abort_err(&options.abort));
        }

        // step 1: determine requiresAck
        let mut requires_ack = options.requires_ack.unwrap_or_else(|| self.session.uses_mrp());
        if options.disable_mrp_logic || self.session.is_peer_lost() {
            requires_ack = false;
        }

        // step 2: consume a pending piggyback ack
        let acked_message_counter = {
            let mut pending = self.received_message_to_ack.lock().await;
            pending.take().map(|m| m.packet_header.message_counter)
        };
        if acked_message_counter.is_some() {
            // Piggybacked, not abandoned for good: park rather than cancel so
            // the background task stays alive for the *next* message that
            // needs a standalone ack (§I6).
            self.standalone_ack_timer.park();
        }

        // step 3: allocate a message counter
        let counter = self
            .session
            .next_message_counter(&options.abort)
            .await
            .map_err(|_| abort_err(&options.abort))?;

        // step 4: compose headers
        let payload_header = PayloadHeader {
            initiator_message: self.is_initiator,
            requires_ack,
            has_secured_extension: false,
            is_vendor_specific: false,
            opcode,
            exchange_id: self.id,
            protocol_id: self.protocol_id,
            vendor_id: None,
            acked_message_counter,
        };
        let plaintext = Message::encode_payload(&payload_header, payload)
            .map_err(|e| ExchangeError::MatterFlow(e.to_string()))?;
        let wire = self
            .session
            .encode_message(counter, &plaintext)
            .map_err(ExchangeError::Network)?;

        // step 5: hand off to the channel
        self.send_to_channel(&wire).await?;

        if !requires_ack {
            self.session.notify_activity(false);
            return Ok(());
        }

        // step 6: register the pending ack and run the retransmission sub-machine
        let ack_slot = Arc::new(AckSlot::new());
        {
            let mut slot = self.sent_message_to_ack.lock().await;
            *slot = Some(SentMessage {
                counter,
                bytes: wire,
                acked_message_counter,
                expect_ack_only: options.expect_ack_only,
                ack_slot: ack_slot.clone(),
            });
        }
        self.retransmission_counter.store(0, Ordering::SeqCst);

        let max_retransmissions = options.max_retransmissions.unwrap_or(MRP_MAX_TRANSMISSIONS);
        let params = self.session.parameters();
        let initial = options
            .initial_retransmission_time
            .unwrap_or_else(|| self.channel.get_mrp_resubmission_backoff_time(0, params, false));
        let mut last_interval = cap(initial, options.max_retransmission_time);
        let timer = Arc::new(Timer::new(last_interval));
        *self.active_retransmit_timer.lock().await = Some(timer.clone());

        let mut attempt: u8 = 0;
        let mut final_wait_armed = false;
        let outcome = loop {
            tokio::select! {
                biased;
                outcome = ack_slot.wait() => break outcome,
                _ = options.abort.cancelled() => {
                    ack_slot.resolve(AckOutcome::Aborted(
                        options.abort.reason().unwrap_or(AbortReason::CallerRequested),
                    ));
                    continue;
                }
                fired = timer.wait() => {
                    if !fired {
                        continue;
                    }
                    if final_wait_armed {
                        ack_slot.resolve(AckOutcome::PeerUnresponsive);
                        continue;
                    }
                    attempt += 1;
                    self.retransmission_counter.store(attempt, Ordering::SeqCst);
                    if attempt >= max_retransmissions {
                        if options.expected_processing_time > Duration::ZERO && !self.closing.is_emitted() {
                            let max_peer_wait = self.channel.calculate_maximum_peer_response_time(
                                params,
                                params,
                                options.expected_processing_time,
                            );
                            let extra = max_peer_wait.saturating_sub(last_interval);
                            timer.rearm(extra);
                            final_wait_armed = true;
                        } else {
                            ack_slot.resolve(AckOutcome::PeerUnresponsive);
                            continue;
                        }
                    } else {
                        let sent_bytes = {
                            let slot = self.sent_message_to_ack.lock().await;
                            slot.as_ref().map(|s| s.bytes.clone())
                        };
                        if let Some(bytes) = sent_bytes {
                            if let Err(e) = self.send_to_channel_logged(&bytes).await {
                                if self.session.is_closed() {
                                    ack_slot.resolve(AckOutcome::SessionClosed);
                                    continue;
                                }
                                log::debug!("retransmit send failed on exchange {}: {:?}", self.id, e);
                            }
                        }
                        last_interval = cap(
                            self.channel.get_mrp_resubmission_backoff_time(attempt, params, false),
                            options.max_retransmission_time,
                        );
                        timer.rearm(last_interval);
                    }
                }
            }
        };

        *self.active_retransmit_timer.lock().await = None;
        {
            let mut slot = self.sent_message_to_ack.lock().await;
            *slot = None;
        }

        match outcome {
            AckOutcome::Acked => {
                self.session.notify_activity(false);
                Ok(())
            }
            AckOutcome::UnexpectedMessage => Err(ExchangeError::UnexpectedMessage(
                "expectAckOnly was set but a data message arrived".into(),
            )),
            AckOutcome::Aborted(reason) => Err(ExchangeError::Aborted(reason)),
            AckOutcome::PeerUnresponsive => {
                self.session.mark_peer_lost();
                self.peer_unresponsive.emit();
                self.force_close(ExchangeError::PeerUnresponsive).await;
                Err(ExchangeError::PeerUnresponsive)
            }
            AckOutcome::SessionClosed => {
                self.force_close(ExchangeError::SessionClosed).await;
                Err(ExchangeError::SessionClosed)
            }
        }
    }

    async fn send_to_channel(&self, bytes: &[u8]) -> Result<()> {
        self.channel.send(bytes).await.map_err(|e| {
            if self.session.is_closed() {
                ExchangeError::SessionClosed
            } else {
                ExchangeError::Network(e)
            }
        })
    }

    async fn send_to_channel_logged(&self, bytes: &[u8]) -> anyhow::Result<()> {
        self.channel.send(bytes).await
    }

    /// §4.1 `sendStandaloneAckForMessage`.
    async fn send_standalone_ack_for_message(&self, message: &Message) -> Result<()> {
        if !self.session.uses_mrp() || !message.payload_header.requires_ack {
            return Ok(());
        }
        let abort = AbortToken::new();
        let counter = self
            .session
            .next_message_counter(&abort)
            .await
            .map_err(ExchangeError::Network)?;
        let plaintext = standalone_ack(self.id, self.is_initiator, message.packet_header.message_counter)
            .map_err(|e| ExchangeError::MatterFlow(e.to_string()))?;
        let wire = self
            .session
            .encode_message(counter, &plaintext)
            .map_err(ExchangeError::Network)?;
        self.send_to_channel(&wire).await
    }

    /// §4.1 receive path, driven by [`crate::exchange_manager::ExchangeManager`].
    pub async fn on_message_received(self: &Arc<Self>, mut message: Message, is_duplicate: bool) -> Result<()> {
        // step 1: defensive clear
        if message.payload_header.requires_ack && !self.session.uses_mrp() {
            message.payload_header.requires_ack = false;
        }

        // step 2: protocol id check
        if message.payload_header.protocol_id != self.protocol_id && !message.payload_header.is_standalone_ack() {
            return Err(ExchangeError::MatterFlow(format!(
                "received protocol id {:#06x} does not match exchange protocol id {:#06x}",
                message.payload_header.protocol_id, self.protocol_id
            )));
        }

        // step 3: activity notification
        self.session.notify_activity(true);

        // step 4: duplicate handling
        if is_duplicate {
            if message.payload_header.requires_ack {
                self.send_standalone_ack_for_message(&message).await?;
            }
            return Ok(());
        }

        // step 5: re-send suppression (our own ack/reply was lost)
        let resend_bytes = {
            let slot = self.sent_message_to_ack.lock().await;
            match slot.as_ref() {
                Some(sent) if sent.acked_message_counter.is_some() => {
                    if message.payload_header.acked_message_counter == sent.acked_message_counter {
                        Some(sent.bytes.clone())
                    } else {
                        None
                    }
                }
                _ => None,
            }
        };
        if let Some(bytes) = resend_bytes {
            let _ = self.send_to_channel(&bytes).await;
        }

        // step 6: ack matching
        let mut ack_just_matched = false;
        {
            let mut slot = self.sent_message_to_ack.lock().await;
            if let Some(sent) = slot.as_ref() {
                match message.payload_header.acked_message_counter {
                    None => {
                        return Err(ExchangeError::MatterFlow("previous message ack missing".into()));
                    }
                    Some(acked) if acked == sent.counter => {
                        let outcome = if sent.expect_ack_only && !message.payload_header.is_standalone_ack() {
                            AckOutcome::UnexpectedMessage
                        } else {
                            AckOutcome::Acked
                        };
                        sent.ack_slot.resolve(outcome);
                        *slot = None;
                        ack_just_matched = true;
                    }
                    Some(_) => {
                        if message.payload_header.is_standalone_ack() {
                            return Ok(());
                        }
                        return Err(ExchangeError::MatterFlow(
                            "ack counter matches neither the current nor a previous send".into(),
                        ));
                    }
                }
            }
        }
        if ack_just_matched && self.closing.is_emitted() && message.payload_header.is_standalone_ack() {
            *self.close_signal.lock().await = Some(CloseSignal::AckObserved);
            self.close_notify.notify_waiters();
        }

        // step 7: standalone acks stop here
        if message.payload_header.is_standalone_ack() {
            return Ok(());
        }

        // step 8: requires-ack bookkeeping
        if message.payload_header.requires_ack {
            let previous = {
                let mut recv_slot = self.received_message_to_ack.lock().await;
                recv_slot.replace(message.clone())
            };
            if let Some(previous) = previous {
                self.send_standalone_ack_for_message(&previous).await?;
            }
            self.standalone_ack_timer.rearm(STANDALONE_ACK_TIMEOUT);
        }

        // step 9: enqueue
        let _ = self.inbound_tx.send(Delivery::Message(message));
        Ok(())
    }

    /// §4.1 `nextMessage`.
    pub async fn next_message(&self, options: ReceiveOptions) -> Result<Message> {
        if self.closed.is_emitted() {
            return Err(ExchangeError::Closed);
        }
        let timeout = options.timeout.unwrap_or_else(|| {
            let params = self.session.parameters();
            self.channel
                .calculate_maximum_peer_response_time(params, params, DEFAULT_EXPECTED_PROCESSING_TIME)
        });

        let mut rx = self.inbound_rx.lock().await;
        tokio::select! {
            biased;
            item = rx.recv() => match item {
                Some(Delivery::Message(m)) => Ok(m),
                Some(Delivery::Closed(cause)) => Err(cause),
                None => Err(ExchangeError::Closed),
            },
            _ = options.abort.cancelled() => Err(abort_err(&options.abort)),
            _ = tokio::time::sleep(timeout) => Err(ExchangeError::PeerUnresponsive),
        }
    }

    /// §4.1 `close`.
    pub async fn close(self: &Arc<Self>, cause: Option<ExchangeError>) {
        if self.closed.is_emitted() {
            return;
        }
        match cause {
            Some(cause) => self.force_close(cause).await,
            None => self.graceful_close().await,
        }
    }

    pub async fn force_close(self: &Arc<Self>, cause: ExchangeError) {
        if self.closed.is_emitted() {
            return;
        }
        if self.closing.is_emitted() {
            // a graceful close is racing its grace timer; hand it the cause
            // and let it finish instead of finishing twice.
            *self.close_signal.lock().await = Some(CloseSignal::Forced(cause));
            self.close_notify.notify_waiters();
            return;
        }
        self.finish_close(Some(cause)).await;
    }

    async fn graceful_close(self: &Arc<Self>) {
        self.closing.emit();

        let pending = self.received_message_to_ack.lock().await.take();
        if let Some(pending) = pending {
            // Sent directly here, not by the background task: park it (the
            // terminal `cancel()` in `finish_close` below still tears the
            // task down once this exchange actually closes).
            self.standalone_ack_timer.park();
            let _ = self.send_standalone_ack_for_message(&pending).await;
        }

        let has_sent = self.sent_message_to_ack.lock().await.is_some();
        if !has_sent {
            self.finish_close(None).await;
            return;
        }

        let attempt = self.retransmission_counter.load(Ordering::SeqCst);
        let params = self.session.parameters();
        let mut grace = Duration::ZERO;
        for i in attempt..MRP_MAX_TRANSMISSIONS {
            grace += self.channel.get_mrp_resubmission_backoff_time(i, params, true);
        }
        let grace_timer = Timer::new(grace);

        // Single-threaded-per-session cooperative scheduling (§5) means no
        // other task can mutate `close_signal` between this check and the
        // select below: there is no await between them.
        if self.close_signal.lock().await.is_some() {
            self.apply_close_signal().await;
            return;
        }

        tokio::select! {
            _ = grace_timer.wait() => {}
            _ = self.close_notify.notified() => {}
        }
        self.apply_close_signal().await;
    }

    async fn apply_close_signal(self: &Arc<Self>) {
        match self.close_signal.lock().await.take() {
            Some(CloseSignal::Forced(cause)) => self.finish_close(Some(cause)).await,
            Some(CloseSignal::AckObserved) | None => self.finish_close(None).await,
        }
    }

    async fn finish_close(self: &Arc<Self>, cause: Option<ExchangeError>) {
        if self.closed.is_emitted() {
            return;
        }
        self.standalone_ack_timer.cancel();

        if let Some(sent) = self.sent_message_to_ack.lock().await.take() {
            let outcome = match &cause {
                Some(ExchangeError::SessionClosed) => AckOutcome::SessionClosed,
                Some(ExchangeError::PeerUnresponsive) => AckOutcome::PeerUnresponsive,
                _ => AckOutcome::Aborted(AbortReason::CallerRequested),
            };
            sent.ack_slot.resolve(outcome);
        }

        let drain_cause_text = cause.as_ref().map(|c| c.to_string());
        let drain_cause = cause.unwrap_or(ExchangeError::Closed);
        let _ = self.inbound_tx.send(Delivery::Closed(drain_cause));

        *self.close_cause.lock().await = drain_cause_text;
        self.closed.emit();
    }

    async fn standalone_ack_task(weak: Weak<Exchange>, timer: Arc<Timer>) {
        loop {
            if !timer.wait().await {
                return;
            }
            // consume this firing before doing anything that awaits, so a
            // concurrent rearm() is never clobbered by parking back over it.
            timer.park();

            let Some(exchange) = weak.upgrade() else { return };
            if exchange.closed.is_emitted() {
                return;
            }
            let pending = exchange.received_message_to_ack.lock().await.take();
            if let Some(pending) = pending {
                if let Err(e) = exchange.send_standalone_ack_for_message(&pending).await {
                    log::debug!("failed to send standalone ack on exchange {}: {:?}", exchange.id, e);
                }
            }
        }
    }
}

fn cap(duration: Duration, max: Option<Duration>) -> Duration {
    match max {
        Some(max) if duration > max => max,
        _ => duration,
    }
}
