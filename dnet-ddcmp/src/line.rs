use embassy_time::{Duration, Instant};

use log::{debug, trace, warn};

use crate::crc;
use crate::{
    seq_le, seq_lt, ControlKind, DLE, ENQ, HEADER_LEN, MAX_DATA_LEN, MAX_TRANSMIT_QUEUE_LEN,
    NAK_BUFFER_UNAVAILABLE, NAK_DATA_CRC, NAK_HEADER_CRC, NAK_MESSAGE_HEADER_FORMAT,
    NAK_REP_RESPONSE, RX_BUFFER_LEN, SOH, STATION,
};

const STARTUP_TIMER: Duration = Duration::from_secs(3);
const ACK_WAIT_TIMER: Duration = Duration::from_secs(15);

const OUT_BUFFER_LEN: usize = 8192;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum LineState {
    Halted,
    IStrt,
    AStrt,
    Running,
}

/// State transitions the owner of the line needs to hear about.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Notification {
    Running,
    Halted,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum SackNak {
    NotSet,
    Sack,
    Snak,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum Event {
    UserHalt,
    UserStartup,
    UserSendReady,
    RcvStack,
    RcvStrt,
    Timer,
    RcvAckResp0,
    RcvRepEqualsR,
    RcvRepNotEqualsR,
    RcvDataInSeq,
    RcvDataOutOfSeq,
    RcvAckOutstanding,
    RcvNakOutstanding,
    RetransmitReady,
    RcvMaintenance,
}

#[derive(Copy, Clone, Debug)]
enum Action {
    StopTimer,
    StartStartupTimer,
    SendStrt,
    SendStack,
    SendAck,
    ResetVars,
    NotifyRunning,
    NotifyHalt,
    SetSack,
    SetSnak,
    ClearSackSnak,
    NakReason3,
    IncR,
    GiveToUser,
    SendMsg,
    IncN,
    IncT,
    SetA,
    SetTFromAck,
    SetTFromNak,
    SetXFromN,
    CheckAckTimer,
    SetSrep,
    CompleteAcked,
}

struct Row {
    event: Event,
    state: Option<LineState>,
    next: LineState,
    actions: &'static [Action],
}

const fn row(
    event: Event,
    state: Option<LineState>,
    next: LineState,
    actions: &'static [Action],
) -> Row {
    Row {
        event,
        state,
        next,
        actions,
    }
}

use Action::*;
use LineState::{AStrt, Halted, IStrt, Running};

#[rustfmt::skip]
const STATE_TABLE: &[Row] = &[
    row(Event::UserHalt,         None,          Halted,  &[StopTimer]),
    row(Event::UserStartup,      Some(Halted),  IStrt,   &[StopTimer, SendStrt, ResetVars, StartStartupTimer]),
    row(Event::RcvStack,         Some(IStrt),   Running, &[SendAck, StopTimer, NotifyRunning]),
    row(Event::RcvStrt,          Some(IStrt),   AStrt,   &[SendStack, StartStartupTimer]),
    row(Event::Timer,            Some(IStrt),   IStrt,   &[SendStrt, StartStartupTimer]),
    row(Event::RcvAckResp0,      Some(AStrt),   Running, &[StopTimer, NotifyRunning]),
    row(Event::RcvStack,         Some(AStrt),   Running, &[SendAck, StopTimer, NotifyRunning]),
    row(Event::RcvStrt,          Some(AStrt),   AStrt,   &[SendStack, StartStartupTimer]),
    row(Event::Timer,            Some(AStrt),   AStrt,   &[SendStack, StartStartupTimer]),
    row(Event::RcvStrt,          Some(Running), Halted,  &[NotifyHalt]),
    row(Event::RcvStack,         Some(Running), Running, &[SendAck]),
    row(Event::RcvRepEqualsR,    Some(Running), Running, &[SetSack]),
    row(Event::RcvRepNotEqualsR, Some(Running), Running, &[NakReason3, SetSnak]),
    row(Event::RcvDataInSeq,     Some(Running), Running, &[GiveToUser, IncR, SetSack]),
    row(Event::RcvDataOutOfSeq,  Some(Running), Running, &[]),
    row(Event::RcvAckResp0,      Some(Running), Running, &[CompleteAcked, SetA, SetTFromAck, CheckAckTimer]),
    row(Event::RcvAckOutstanding, Some(Running), Running, &[CompleteAcked, SetA, SetTFromAck, CheckAckTimer]),
    row(Event::RcvNakOutstanding, Some(Running), Running, &[SetA, SetTFromNak, StopTimer]),
    row(Event::RetransmitReady,  Some(Running), Running, &[SendMsg, IncT, ClearSackSnak, SetXFromN, CheckAckTimer]),
    row(Event::UserSendReady,    Some(Running), Running, &[SendMsg, IncN, IncT, ClearSackSnak, SetXFromN, CheckAckTimer]),
    row(Event::Timer,            Some(Running), Running, &[SetSrep]),
    row(Event::RcvMaintenance,   None,          Halted,  &[NotifyHalt]),
];

struct TxEntry {
    in_use: bool,
    len: usize,
    frame: [u8; crate::TX_FRAME_LEN],
}

impl TxEntry {
    const fn new() -> Self {
        Self {
            in_use: false,
            len: 0,
            frame: [0; crate::TX_FRAME_LEN],
        }
    }

    fn num(&self) -> u8 {
        self.frame[4]
    }
}

/// Fixed ring of data frames awaiting acknowledgement, with the
/// first-unacknowledged / current / last-allocated pointers of the
/// protocol description.
struct TransmitQueue {
    entries: [TxEntry; MAX_TRANSMIT_QUEUE_LEN],
    first: usize,
    current: usize,
    last_allocated: Option<usize>,
}

impl TransmitQueue {
    const fn new() -> Self {
        Self {
            entries: [
                TxEntry::new(),
                TxEntry::new(),
                TxEntry::new(),
                TxEntry::new(),
                TxEntry::new(),
            ],
            first: 0,
            current: 0,
            last_allocated: None,
        }
    }

    fn reset(&mut self) {
        for entry in &mut self.entries {
            entry.in_use = false;
        }

        self.first = 0;
        self.current = 0;
        self.last_allocated = None;
    }

    fn allocate(&mut self) -> Option<usize> {
        let found = match self.last_allocated {
            None => Some(0),
            Some(last) => (0..MAX_TRANSMIT_QUEUE_LEN)
                .map(|i| (last + i) % MAX_TRANSMIT_QUEUE_LEN)
                .find(|&i| !self.entries[i].in_use),
        };

        if let Some(i) = found {
            self.last_allocated = Some(i);
            self.entries[i].in_use = true;
        }

        found
    }

    fn first_unacknowledged(&mut self) -> Option<usize> {
        if self.entries[self.first].in_use {
            self.current = self.first;
            Some(self.first)
        } else {
            None
        }
    }

    fn free_first(&mut self) {
        self.entries[self.first].in_use = false;

        if Some(self.first) != self.last_allocated {
            self.first = (self.first + 1) % MAX_TRANSMIT_QUEUE_LEN;
        }
    }
}

enum Extracted {
    Incomplete,
    Bad { consumed: usize, nak: Option<u8> },
    Frame { consumed: usize, kind: FrameKind },
}

#[derive(Copy, Clone)]
enum FrameKind {
    Control {
        kind: u8,
        subtype: u8,
        flags: u8,
        resp: u8,
        num: u8,
        station: u8,
    },
    Data {
        count: usize,
        resp: u8,
        num: u8,
        station: u8,
        maintenance: bool,
    },
}

/// One DDCMP line. See the crate docs for the calling conventions.
pub struct Line {
    state: LineState,

    /// Highest data number received in sequence.
    r: u8,
    /// Highest data number transmitted.
    n: u8,
    /// Highest data number acknowledged by the peer.
    a: u8,
    /// Number of the next data frame to transmit.
    t: u8,
    /// Number of the last data frame sent.
    x: u8,

    sacknak: SackNak,
    srep: bool,
    nak_reason: u8,

    timer_due: Option<Instant>,

    rx: heapless::Vec<u8, RX_BUFFER_LEN>,
    rx_msg: heapless::Vec<u8, MAX_DATA_LEN>,
    rx_msg_full: bool,

    out: heapless::Vec<u8, OUT_BUFFER_LEN>,
    tx: TransmitQueue,

    notification: Option<Notification>,

    // Fields of the frame the current event refers to.
    cur_resp: u8,
    cur_num: u8,
    cur_data: (usize, usize),
    cur_tx: Option<usize>,
}

impl Default for Line {
    fn default() -> Self {
        Self::new()
    }
}

impl Line {
    pub fn new() -> Self {
        Self {
            state: LineState::Halted,
            r: 0,
            n: 0,
            a: 0,
            t: 1,
            x: 0,
            sacknak: SackNak::NotSet,
            srep: false,
            nak_reason: 0,
            timer_due: None,
            rx: heapless::Vec::new(),
            rx_msg: heapless::Vec::new(),
            rx_msg_full: false,
            out: heapless::Vec::new(),
            tx: TransmitQueue::new(),
            notification: None,
            cur_resp: 0,
            cur_num: 0,
            cur_data: (0, 0),
            cur_tx: None,
        }
    }

    pub fn state(&self) -> LineState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == LineState::Running
    }

    /// (Re)starts the protocol: resets every variable and sends STRT.
    pub fn start(&mut self, now: Instant) {
        self.state = LineState::Halted;
        self.sacknak = SackNak::NotSet;
        self.srep = false;
        self.nak_reason = 0;
        self.timer_due = None;
        self.rx.clear();
        self.rx_msg.clear();
        self.rx_msg_full = false;
        self.out.clear();
        self.tx.reset();
        self.notification = None;

        self.process_event(Event::UserStartup, now);
    }

    pub fn halt(&mut self, now: Instant) {
        self.process_event(Event::UserHalt, now);
    }

    /// Feeds bytes read from the transport.
    pub fn receive(&mut self, chunk: &[u8], now: Instant) {
        if self.rx.extend_from_slice(chunk).is_err() {
            warn!("receive buffer overflow, resynchronizing");
            self.rx.clear();

            if self.rx.extend_from_slice(chunk).is_err() {
                return;
            }
        }

        self.pump(now);
        self.idle(now);
    }

    /// Takes the next delivered data message, copying it into `buf`.
    /// Call until it returns `None`; extraction of further buffered
    /// frames resumes as each message is taken.
    pub fn take_received(&mut self, buf: &mut [u8], now: Instant) -> Option<usize> {
        if !self.rx_msg_full {
            return None;
        }

        self.rx_msg_full = false;

        let len = self.rx_msg.len();
        if buf.len() < len {
            warn!("receive scratch too small for {} byte message", len);
            self.pump(now);
            self.idle(now);
            return None;
        }

        buf[..len].copy_from_slice(&self.rx_msg);

        self.pump(now);
        self.idle(now);

        Some(len)
    }

    /// Queues one user message for transmission. Returns false when the
    /// line is not running, the window is full, or the protocol is
    /// momentarily unable to accept data; the caller backs off.
    pub fn send(&mut self, payload: &[u8], now: Instant) -> bool {
        let mut sent = false;

        if payload.len() > crate::MAX_SEND_DATA_LEN {
            warn!("send of {} bytes exceeds maximum message", payload.len());
        } else if self.state == LineState::Running
            && self.t == self.n.wrapping_add(1)
            && self.sacknak != SackNak::Snak
            && !self.srep
        {
            if let Some(i) = self.tx.allocate() {
                let len = payload.len();
                let entry = &mut self.tx.entries[i];

                entry.frame[0] = SOH;
                entry.frame[1] = len as u8;
                entry.frame[2] = (len >> 8) as u8 & 0x3F;
                entry.frame[3] = self.r;
                entry.frame[4] = self.n.wrapping_add(1);
                entry.frame[5] = STATION;
                crc::append_crc16(&mut entry.frame, 6);
                entry.frame[HEADER_LEN..HEADER_LEN + len].copy_from_slice(payload);
                crc::append_crc16(&mut entry.frame[HEADER_LEN..], len);
                entry.len = HEADER_LEN + len + 2;

                self.cur_tx = Some(i);
                self.cur_num = self.n.wrapping_add(1);
                self.process_event(Event::UserSendReady, now);
                sent = true;
            }
        }

        self.idle(now);

        sent
    }

    /// The single outstanding protocol deadline, if any.
    pub fn next_timer_due(&self) -> Option<Instant> {
        self.timer_due
    }

    pub fn on_timer(&mut self, now: Instant) {
        if self.timer_due.is_some_and(|due| due <= now) {
            self.timer_due = None;
            trace!("reply timer expired");
            self.process_event(Event::Timer, now);
            self.idle(now);
        }
    }

    pub fn take_notification(&mut self) -> Option<Notification> {
        self.notification.take()
    }

    /// Bytes waiting to go out on the transport. Consume what was
    /// written with [`Self::consume_output`].
    pub fn pending_output(&self) -> &[u8] {
        &self.out
    }

    pub fn consume_output(&mut self, n: usize) {
        let len = self.out.len();
        self.out.copy_within(n.., 0);
        self.out.truncate(len - n);
    }

    fn drain_rx(&mut self, n: usize) {
        let len = self.rx.len();
        self.rx.copy_within(n.., 0);
        self.rx.truncate(len - n);
    }

    /// Extracts and processes frames from the receive buffer, stopping
    /// when a data message is parked for the user or the buffer has no
    /// complete frame.
    fn pump(&mut self, now: Instant) {
        while !self.rx_msg_full {
            // Synchronize on the next frame start.
            match self.rx.iter().position(|b| matches!(*b, ENQ | SOH | DLE)) {
                Some(0) => (),
                Some(skip) => {
                    trace!("synchronization skipped {} bytes", skip);
                    self.drain_rx(skip);
                }
                None => {
                    if !self.rx.is_empty() {
                        trace!("synchronization skipped {} bytes", self.rx.len());
                    }
                    self.rx.clear();
                    return;
                }
            }

            match self.extract() {
                Extracted::Incomplete => return,
                Extracted::Bad { consumed, nak } => {
                    if let Some(reason) = nak {
                        self.nak_reason = reason;
                        self.send_nak();
                    }
                    self.drain_rx(consumed);
                }
                Extracted::Frame { consumed, kind } => {
                    match kind {
                        FrameKind::Control {
                            kind,
                            subtype,
                            flags,
                            resp,
                            num,
                            station,
                        } => self.process_control(kind, subtype, flags, resp, num, station, now),
                        FrameKind::Data {
                            count,
                            resp,
                            num,
                            station,
                            maintenance,
                        } => self.process_data(count, resp, num, station, maintenance, now),
                    }
                    self.drain_rx(consumed);
                }
            }
        }
    }

    fn extract(&self) -> Extracted {
        match self.rx[0] {
            ENQ => {
                if self.rx.len() < HEADER_LEN {
                    return Extracted::Incomplete;
                }

                if !crc::check(&self.rx[..HEADER_LEN]) {
                    warn!("CRC error on received control message");
                    return Extracted::Bad {
                        consumed: HEADER_LEN,
                        nak: None,
                    };
                }

                Extracted::Frame {
                    consumed: HEADER_LEN,
                    kind: FrameKind::Control {
                        kind: self.rx[1],
                        subtype: self.rx[2] & 0x3F,
                        flags: (self.rx[2] >> 6) & 0x03,
                        resp: self.rx[3],
                        num: self.rx[4],
                        station: self.rx[5],
                    },
                }
            }
            _ => {
                // SOH or DLE: an 8-byte header with its own CRC, then the
                // counted payload with another.
                if self.rx.len() < HEADER_LEN {
                    return Extracted::Incomplete;
                }

                if !crc::check(&self.rx[..HEADER_LEN]) {
                    warn!("CRC error on received message header");
                    return Extracted::Bad {
                        consumed: HEADER_LEN,
                        nak: Some(NAK_HEADER_CRC),
                    };
                }

                let count = self.rx[1] as usize | ((self.rx[2] as usize & 0x3F) << 8);

                if HEADER_LEN + count + 2 > RX_BUFFER_LEN {
                    // Can never be buffered whole; the user side has no
                    // buffer for it.
                    warn!("data message of {} bytes exceeds receive buffer", count);
                    return Extracted::Bad {
                        consumed: HEADER_LEN,
                        nak: Some(NAK_BUFFER_UNAVAILABLE),
                    };
                }

                if self.rx.len() < HEADER_LEN + count + 2 {
                    return Extracted::Incomplete;
                }

                if !crc::check(&self.rx[HEADER_LEN..HEADER_LEN + count + 2]) {
                    warn!("CRC error on received data block");
                    return Extracted::Bad {
                        consumed: HEADER_LEN + count + 2,
                        nak: if self.rx[0] == SOH {
                            Some(NAK_DATA_CRC)
                        } else {
                            None
                        },
                    };
                }

                Extracted::Frame {
                    consumed: HEADER_LEN + count + 2,
                    kind: FrameKind::Data {
                        count,
                        resp: self.rx[3],
                        num: self.rx[4],
                        station: self.rx[5],
                        maintenance: self.rx[0] == DLE,
                    },
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn process_control(
        &mut self,
        kind: u8,
        subtype: u8,
        flags: u8,
        resp: u8,
        num: u8,
        station: u8,
        now: Instant,
    ) {
        let kind = match ControlKind::try_from(kind) {
            Ok(kind) => kind,
            Err(_) => {
                warn!("unknown control message type {}", kind);
                return;
            }
        };

        match kind {
            ControlKind::Ack => {
                if subtype != 0 || num != 0 || station != STATION {
                    warn!("invalid ACK message ignored");
                    return;
                }

                debug!("received ACK, resp={}", resp);
                self.cur_resp = resp;

                if resp == 0 {
                    self.process_event(Event::RcvAckResp0, now);
                } else if seq_lt(self.a, resp) && seq_le(resp, self.n) {
                    self.process_event(Event::RcvAckOutstanding, now);
                }
            }
            ControlKind::Nak => {
                if num != 0 || station != STATION {
                    warn!("invalid NAK message ignored");
                    return;
                }

                debug!("received NAK, reason={}, resp={}", subtype, resp);
                self.cur_resp = resp;

                if seq_le(self.a, resp) && seq_le(resp, self.n) {
                    self.process_event(Event::RcvNakOutstanding, now);
                }
            }
            ControlKind::Rep => {
                if subtype != 0 || resp != 0 || station != STATION {
                    warn!("invalid REP message ignored");
                    return;
                }

                debug!("received REP, num={}", num);
                self.cur_num = num;

                if num == self.r {
                    self.process_event(Event::RcvRepEqualsR, now);
                } else {
                    self.process_event(Event::RcvRepNotEqualsR, now);
                }
            }
            ControlKind::Strt | ControlKind::Stack => {
                if subtype != 0 || flags != 3 || resp != 0 || num != 0 || station != STATION {
                    warn!("invalid {:?} message ignored", kind);
                    return;
                }

                debug!("received {:?}", kind);

                if kind == ControlKind::Strt {
                    self.process_event(Event::RcvStrt, now);
                } else {
                    self.process_event(Event::RcvStack, now);
                }
            }
        }
    }

    fn process_data(
        &mut self,
        count: usize,
        resp: u8,
        num: u8,
        station: u8,
        maintenance: bool,
        now: Instant,
    ) {
        if maintenance {
            warn!("maintenance message received, halting: maintenance mode is not supported");
            self.process_event(Event::RcvMaintenance, now);
            return;
        }

        if station != STATION {
            warn!("invalid DATA message, station address should be {}", STATION);
            self.nak_reason = NAK_MESSAGE_HEADER_FORMAT;
            self.send_nak();
            return;
        }

        debug!("received DATA, len={}, resp={}, num={}", count, resp, num);

        self.cur_resp = resp;
        if seq_lt(self.a, resp) && seq_le(resp, self.n) {
            self.process_event(Event::RcvAckOutstanding, now);
        }

        self.cur_num = num;
        self.cur_data = (HEADER_LEN, count);

        if num == self.r.wrapping_add(1) {
            self.process_event(Event::RcvDataInSeq, now);
        } else {
            trace!("data message out of sequence, num={}, R={}", num, self.r);
            self.process_event(Event::RcvDataOutOfSeq, now);
        }
    }

    fn process_event(&mut self, event: Event, now: Instant) {
        let Some(entry) = STATE_TABLE
            .iter()
            .find(|row| row.event == event && row.state.map_or(true, |s| s == self.state))
        else {
            trace!("event {:?} ignored in state {:?}", event, self.state);
            return;
        };

        if self.state != entry.next {
            debug!("changing line state from {:?} to {:?}", self.state, entry.next);
        }

        self.state = entry.next;

        for action in entry.actions {
            self.run_action(*action, now);
        }

        trace!(
            "variables after event {:?}: N={}, A={}, R={}, T={}, X={}",
            event,
            self.n,
            self.a,
            self.r,
            self.t,
            self.x
        );
    }

    fn run_action(&mut self, action: Action, now: Instant) {
        match action {
            Action::StopTimer => self.timer_due = None,
            Action::StartStartupTimer => self.start_timer(now, STARTUP_TIMER),
            Action::SendStrt => {
                debug!("sending STRT");
                self.send_control(&[ENQ, ControlKind::Strt as u8, 0xC0, 0, 0, STATION]);
            }
            Action::SendStack => {
                debug!("sending STACK");
                self.send_control(&[ENQ, ControlKind::Stack as u8, 0xC0, 0, 0, STATION]);
            }
            Action::SendAck => self.send_ack(),
            Action::ResetVars => {
                self.r = 0;
                self.n = 0;
                self.a = 0;
                self.t = 1;
                self.x = 0;
            }
            Action::NotifyRunning => self.notification = Some(Notification::Running),
            Action::NotifyHalt => self.notification = Some(Notification::Halted),
            Action::SetSack => {
                self.sacknak = SackNak::Sack;
            }
            Action::SetSnak => {
                self.sacknak = SackNak::Snak;
            }
            Action::ClearSackSnak => {
                self.sacknak = SackNak::NotSet;
            }
            Action::NakReason3 => self.nak_reason = NAK_REP_RESPONSE,
            Action::IncR => self.r = self.r.wrapping_add(1),
            Action::GiveToUser => {
                let (at, len) = self.cur_data;

                self.rx_msg.clear();
                // Capacity covers every extractable frame.
                let _ = self.rx_msg.extend_from_slice(&self.rx[at..at + len]);
                self.rx_msg_full = true;
            }
            Action::SendMsg => {
                if let Some(i) = self.cur_tx {
                    let r = self.r;
                    let entry = &mut self.tx.entries[i];

                    // Bring the piggybacked resp up to date, then redo
                    // the header CRC.
                    entry.frame[3] = r;
                    crc::append_crc16(&mut entry.frame, 6);

                    debug!("sending DATA, num={}, resp={}", entry.frame[4], r);

                    let len = entry.len;
                    let frame = &self.tx.entries[i].frame[..len];
                    if self.out.extend_from_slice(frame).is_err() {
                        warn!("transmit buffer overflow, dropping frame");
                    }
                }
            }
            Action::IncN => self.n = self.n.wrapping_add(1),
            Action::IncT => self.t = self.t.wrapping_add(1),
            Action::SetA => self.a = self.cur_resp,
            Action::SetTFromAck => {
                if seq_le(self.t, self.a) {
                    self.t = self.a.wrapping_add(1);
                }
            }
            Action::SetTFromNak => self.t = self.a.wrapping_add(1),
            Action::SetXFromN => self.x = self.n,
            Action::CheckAckTimer => {
                if seq_lt(self.a, self.x) {
                    self.start_timer(now, ACK_WAIT_TIMER);
                } else {
                    self.timer_due = None;
                }
            }
            Action::SetSrep => self.srep = true,
            Action::CompleteAcked => {
                let resp = self.cur_resp;

                while let Some(i) = self.tx.first_unacknowledged() {
                    if seq_le(self.tx.entries[i].num(), resp) {
                        self.tx.free_first();
                    } else {
                        break;
                    }
                }
            }
        }
    }

    /// Steady-state servicing after every receive, send and timer event,
    /// in the order the protocol prescribes: NAK, REP, retransmission,
    /// ACK.
    fn idle(&mut self, now: Instant) {
        if self.sacknak == SackNak::Snak {
            self.send_nak();
        }

        if self.srep {
            self.send_rep(now);
        }

        if self.sacknak != SackNak::Snak
            && !self.srep
            && seq_le(self.t, self.n)
            && self.timer_due.is_none()
        {
            if let Some(i) = self.tx.first_unacknowledged() {
                self.cur_tx = Some(i);
                self.cur_num = self.tx.entries[i].num();
                self.process_event(Event::RetransmitReady, now);
            }
        }

        if self.sacknak == SackNak::Sack {
            self.send_ack();
        }
    }

    fn start_timer(&mut self, now: Instant, period: Duration) {
        if self.timer_due.is_none() {
            self.timer_due = Some(now + period);
        }
    }

    fn send_control(&mut self, fields: &[u8; 6]) {
        let mut frame = [0u8; HEADER_LEN];
        frame[..6].copy_from_slice(fields);
        crc::append_crc16(&mut frame, 6);

        if self.out.extend_from_slice(&frame).is_err() {
            warn!("transmit buffer overflow, dropping frame");
        }
    }

    fn send_ack(&mut self) {
        debug!("sending ACK, num={}", self.r);
        self.send_control(&[ENQ, ControlKind::Ack as u8, 0, self.r, 0, STATION]);
        self.sacknak = SackNak::NotSet;
    }

    fn send_nak(&mut self) {
        debug!("sending NAK, num={}, reason={}", self.r, self.nak_reason);
        self.send_control(&[ENQ, ControlKind::Nak as u8, self.nak_reason, self.r, 0, STATION]);
        self.sacknak = SackNak::NotSet;
    }

    fn send_rep(&mut self, now: Instant) {
        debug!("sending REP, num={}", self.n);
        self.send_control(&[ENQ, ControlKind::Rep as u8, 0, 0, self.n, STATION]);
        self.srep = false;
        self.start_timer(now, ACK_WAIT_TIMER);
    }
}
