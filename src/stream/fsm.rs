//! Admission checks: a simple TCP state machine and an option checker.

use thiserror::Error;

use crate::protocol::{TcpFlags, TcpSegment};

use super::FlowDirection;

/// Connection-level TCP state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsmState {
    Closed,
    SynSent,
    SynAck,
    Established,
    Closing,
    Reset,
}

impl FsmState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FsmState::Closed => "closed",
            FsmState::SynSent => "syn_sent",
            FsmState::SynAck => "syn_ack",
            FsmState::Established => "established",
            FsmState::Closing => "closing",
            FsmState::Reset => "reset",
        }
    }
}

/// Tracks the handshake and teardown of one connection.
#[derive(Debug, Clone)]
pub struct TcpFsm {
    state: FsmState,
    /// Direction that sent the opening SYN.
    initiator: Option<FlowDirection>,
    /// Infer a plausible state from the first segment when no SYN was seen.
    support_missing_establishment: bool,
}

impl TcpFsm {
    pub fn new(support_missing_establishment: bool) -> Self {
        Self {
            state: FsmState::Closed,
            initiator: None,
            support_missing_establishment,
        }
    }

    pub fn state(&self) -> FsmState {
        self.state
    }

    /// Advance the state machine. Returns `false` when the segment does
    /// not fit the current state.
    pub fn check(&mut self, flags: TcpFlags, dir: FlowDirection) -> bool {
        let opening_syn = flags.syn && !flags.ack;

        if self.state == FsmState::Closed && self.support_missing_establishment && !opening_syn {
            self.state = if flags.syn && flags.ack {
                self.initiator = Some(dir.reverse());
                FsmState::SynAck
            } else if flags.rst {
                FsmState::Reset
            } else if flags.fin {
                FsmState::Closing
            } else {
                FsmState::Established
            };
            return true;
        }

        match self.state {
            FsmState::Closed => {
                if opening_syn {
                    self.initiator = Some(dir);
                    self.state = FsmState::SynSent;
                    return true;
                }
                false
            }
            FsmState::SynSent => {
                if flags.rst {
                    self.state = FsmState::Reset;
                    return true;
                }
                let from_initiator = self.initiator == Some(dir);
                if flags.syn && flags.ack && !from_initiator {
                    self.state = FsmState::SynAck;
                    return true;
                }
                // SYN retransmission
                opening_syn && from_initiator
            }
            FsmState::SynAck => {
                if flags.rst {
                    self.state = FsmState::Reset;
                    return true;
                }
                let from_initiator = self.initiator == Some(dir);
                if flags.ack && !flags.syn && from_initiator {
                    self.state = FsmState::Established;
                    return true;
                }
                // SYN/ACK retransmission
                flags.syn && flags.ack && !from_initiator
            }
            FsmState::Established => {
                if flags.rst {
                    self.state = FsmState::Reset;
                } else if flags.fin {
                    self.state = FsmState::Closing;
                }
                true
            }
            FsmState::Closing => {
                if flags.rst {
                    self.state = FsmState::Reset;
                }
                true
            }
            FsmState::Reset => !flags.syn,
        }
    }
}

/// Why the option checker refused a segment.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OptionViolation {
    #[error("malformed MSS or window scale option")]
    Malformed,
    #[error("re-emitted segment (diff {diff})")]
    ReEmitted { diff: i64 },
    #[error("segment of {len} bytes exceeds peer MSS {mss}")]
    ExceedsMss { len: usize, mss: u16 },
    #[error("segment {diff} bytes ahead of peer window {window}")]
    OutOfWindow { diff: i64, window: u64 },
}

#[derive(Debug, Clone, Copy, Default)]
struct HalfOptions {
    mss: Option<u16>,
    scale: Option<u8>,
    ack_seq: Option<u32>,
    receive_window: u64,
}

/// Checks data segments against the MSS and window the peer announced.
#[derive(Debug, Clone, Default)]
pub struct OptionChecker {
    halves: [HalfOptions; 2],
}

impl OptionChecker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accept(
        &mut self,
        segment: &TcpSegment,
        dir: FlowDirection,
        next_seq: Option<u32>,
    ) -> Result<(), OptionViolation> {
        let peer = self.halves[dir.reverse().index()];
        let own = &mut self.halves[dir.index()];

        if segment.flags.syn {
            if segment.options.malformed {
                return Err(OptionViolation::Malformed);
            }
            own.mss = segment.options.mss;
            own.scale = segment.options.window_scale;
        } else if let Some(next) = next_seq {
            let len = segment.payload.len();
            let diff = i64::from(segment.seq.wrapping_sub(next) as i32);
            let keep_alive = diff == -1 && len <= 1;

            if !keep_alive {
                if diff < 0 {
                    return Err(OptionViolation::ReEmitted { diff });
                }
                if let Some(mss) = peer.mss.filter(|&m| m > 0) {
                    if len > usize::from(mss) {
                        return Err(OptionViolation::ExceedsMss { len, mss });
                    }
                }
                if peer.receive_window != 0
                    && peer.ack_seq.is_some()
                    && diff as u64 > peer.receive_window
                {
                    return Err(OptionViolation::OutOfWindow {
                        diff,
                        window: peer.receive_window,
                    });
                }
            }
        }

        if segment.flags.ack {
            own.ack_seq = Some(segment.ack);
        }
        own.receive_window = u64::from(segment.window) << own.scale.unwrap_or(0).min(14);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::FlowIdent;
    use crate::protocol::TcpOptions;
    use bytes::Bytes;

    use FlowDirection::{Forward, Reverse};

    fn seg(seq: u32, flags: TcpFlags, payload: &'static [u8]) -> TcpSegment {
        let flow = FlowIdent::new(
            "10.0.0.1:51000".parse().unwrap(),
            "10.0.0.2:80".parse().unwrap(),
        );
        TcpSegment::new(flow, seq, flags, Bytes::from_static(payload), 0)
    }

    // Test 1: Full handshake and teardown
    #[test]
    fn test_handshake() {
        let mut fsm = TcpFsm::new(false);
        assert!(fsm.check(TcpFlags::SYN, Forward));
        assert_eq!(fsm.state(), FsmState::SynSent);
        assert!(fsm.check(TcpFlags::SYN_ACK, Reverse));
        assert_eq!(fsm.state(), FsmState::SynAck);
        assert!(fsm.check(TcpFlags::ACK, Forward));
        assert_eq!(fsm.state(), FsmState::Established);
        assert!(fsm.check(TcpFlags::FIN_ACK, Reverse));
        assert_eq!(fsm.state(), FsmState::Closing);
        assert!(fsm.check(TcpFlags::ACK, Forward));
    }

    // Test 2: Data without handshake is rejected unless tolerated
    #[test]
    fn test_missing_establishment() {
        let mut strict = TcpFsm::new(false);
        assert!(!strict.check(TcpFlags::ACK, Forward));
        assert_eq!(strict.state(), FsmState::Closed);

        let mut lenient = TcpFsm::new(true);
        assert!(lenient.check(TcpFlags::ACK, Forward));
        assert_eq!(lenient.state(), FsmState::Established);
    }

    // Test 3: SYN/ACK from the initiator is invalid
    #[test]
    fn test_syn_ack_wrong_direction() {
        let mut fsm = TcpFsm::new(false);
        assert!(fsm.check(TcpFlags::SYN, Forward));
        assert!(!fsm.check(TcpFlags::SYN_ACK, Forward));
        assert!(fsm.check(TcpFlags::SYN, Forward)); // retransmission
    }

    // Test 4: Reset state refuses new SYNs
    #[test]
    fn test_reset() {
        let mut fsm = TcpFsm::new(false);
        assert!(fsm.check(TcpFlags::SYN, Forward));
        assert!(fsm.check(TcpFlags::RST, Reverse));
        assert_eq!(fsm.state(), FsmState::Reset);
        assert!(!fsm.check(TcpFlags::SYN, Forward));
        assert!(fsm.check(TcpFlags::ACK, Forward));
    }

    // Test 5: Re-emitted data and keep-alives
    #[test]
    fn test_reemitted_and_keepalive() {
        let mut checker = OptionChecker::new();
        assert_eq!(
            checker.accept(&seg(90, TcpFlags::ACK, b"0123456789"), Forward, Some(100)),
            Err(OptionViolation::ReEmitted { diff: -10 })
        );
        assert!(checker
            .accept(&seg(99, TcpFlags::ACK, b"x"), Forward, Some(100))
            .is_ok());
        assert!(checker
            .accept(&seg(100, TcpFlags::ACK, b"next"), Forward, Some(100))
            .is_ok());
    }

    // Test 6: Peer MSS bounds segment size
    #[test]
    fn test_mss_enforced() {
        let mut checker = OptionChecker::new();
        let mut syn = seg(0, TcpFlags::SYN_ACK, b"");
        syn.options = TcpOptions {
            mss: Some(4),
            window_scale: None,
            malformed: false,
        };
        assert!(checker.accept(&syn, Reverse, None).is_ok());

        assert_eq!(
            checker.accept(&seg(1, TcpFlags::ACK, b"too long"), Forward, Some(1)),
            Err(OptionViolation::ExceedsMss { len: 8, mss: 4 })
        );
        assert!(checker
            .accept(&seg(1, TcpFlags::ACK, b"ok"), Forward, Some(1))
            .is_ok());
    }

    // Test 7: Malformed options on SYN
    #[test]
    fn test_malformed_syn_options() {
        let mut checker = OptionChecker::new();
        let mut syn = seg(0, TcpFlags::SYN, b"");
        syn.options.malformed = true;
        assert_eq!(
            checker.accept(&syn, Forward, None),
            Err(OptionViolation::Malformed)
        );
    }

    // Test 8: Segment beyond the peer's advertised window
    #[test]
    fn test_out_of_window() {
        let mut checker = OptionChecker::new();
        let mut ack = seg(500, TcpFlags::ACK, b"").with_ack(1);
        ack.window = 100;
        assert!(checker.accept(&ack, Reverse, None).is_ok());

        assert_eq!(
            checker.accept(&seg(1201, TcpFlags::ACK, b"x"), Forward, Some(1000)),
            Err(OptionViolation::OutOfWindow {
                diff: 201,
                window: 100
            })
        );
    }
}
