//! Per-peer SWIM-style state machine: ALIVE -> SUSPECT -> DEAD, monotone
//! within one incarnation; a higher incarnation from the peer itself resets
//! it to ALIVE.

use std::net::IpAddr;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Alive,
    Suspect,
    Dead,
}

#[derive(Debug, Clone)]
pub struct PeerEntry {
    pub ip: IpAddr,
    pub port: u16,
    pub state: PeerState,
    pub last_seen: Instant,
    pub suspect_time: Option<Instant>,
    pub incarnation: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupAction {
    None,
    BecameSuspect,
    BecameDead,
    ShouldRemove,
}

impl PeerEntry {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self {
            ip,
            port,
            state: PeerState::Alive,
            last_seen: Instant::now(),
            suspect_time: None,
            incarnation: 0,
        }
    }

    pub fn is_live(&self) -> bool {
        self.state != PeerState::Dead
    }

    /// Any inbound traffic refreshes `last_seen`.
    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    /// Transitions SUSPECT -> ALIVE on a direct acknowledgement from the
    /// peer itself.
    pub fn recover(&mut self) {
        if self.state == PeerState::Suspect {
            self.state = PeerState::Alive;
            self.suspect_time = None;
        }
    }

    /// Incoming `suspect` for a currently-ALIVE peer moves it to SUSPECT
    /// without resetting `last_seen`.
    pub fn mark_suspect_external(&mut self) {
        if self.state == PeerState::Alive {
            self.state = PeerState::Suspect;
            self.suspect_time = Some(Instant::now());
        }
    }

    /// Incoming `dead` for a peer not already DEAD moves it to DEAD.
    pub fn mark_dead_external(&mut self) {
        if self.state != PeerState::Dead {
            self.state = PeerState::Dead;
        }
    }

    /// A `state` sync carrying a higher incarnation than ours overrides our
    /// local view, possibly reviving the peer to ALIVE — the only path by
    /// which a DEAD peer returns to ALIVE.
    pub fn merge_incarnation(&mut self, incoming_incarnation: u64, incoming_alive: bool) -> bool {
        if incoming_incarnation <= self.incarnation {
            return false;
        }
        self.incarnation = incoming_incarnation;
        if incoming_alive {
            self.state = PeerState::Alive;
            self.suspect_time = None;
        }
        self.last_seen = Instant::now();
        true
    }

    /// Runs one cleanup-loop tick's state-machine transition for this peer.
    pub fn cleanup_tick(&mut self, suspicion_timeout: Duration, dead_timeout: Duration) -> CleanupAction {
        match self.state {
            PeerState::Alive => {
                if self.last_seen.elapsed() > suspicion_timeout {
                    self.state = PeerState::Suspect;
                    self.suspect_time = Some(Instant::now());
                    CleanupAction::BecameSuspect
                } else {
                    CleanupAction::None
                }
            }
            PeerState::Suspect => {
                let elapsed = self.suspect_time.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed > suspicion_timeout {
                    self.state = PeerState::Dead;
                    CleanupAction::BecameDead
                } else {
                    CleanupAction::None
                }
            }
            PeerState::Dead => {
                if self.last_seen.elapsed() > dead_timeout {
                    CleanupAction::ShouldRemove
                } else {
                    CleanupAction::None
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn peer() -> PeerEntry {
        PeerEntry::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9000)
    }

    #[test]
    fn never_reverts_dead_to_alive_without_higher_incarnation() {
        let mut p = peer();
        p.state = PeerState::Dead;
        p.incarnation = 5;
        assert!(!p.merge_incarnation(5, true));
        assert_eq!(p.state, PeerState::Dead);
        assert!(p.merge_incarnation(6, true));
        assert_eq!(p.state, PeerState::Alive);
    }

    #[test]
    fn cleanup_tick_progresses_alive_to_suspect_to_dead() {
        let mut p = peer();
        p.last_seen = Instant::now() - Duration::from_secs(20);
        assert_eq!(p.cleanup_tick(Duration::from_secs(10), Duration::from_secs(60)), CleanupAction::BecameSuspect);
        p.suspect_time = Some(Instant::now() - Duration::from_secs(20));
        assert_eq!(p.cleanup_tick(Duration::from_secs(10), Duration::from_secs(60)), CleanupAction::BecameDead);
    }
}
