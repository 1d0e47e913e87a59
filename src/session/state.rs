/// Internal lifecycle of a session endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionState {
    /// No session activity.
    Closed,
    /// Sending invitations on the control port.
    InviteControl,
    /// Control port accepted, inviting on the data port.
    InviteData,
    /// Waiting to be invited by the remote station.
    WaitInvite,
    /// Send the first synchronization message (CK0).
    ClockSync0,
    /// Waiting for CK1 from the remote node.
    ClockSync1,
    /// Send the closing synchronization message (CK2).
    ClockSync2,
    /// Session is opened, MIDI flows and keepalive traffic runs.
    Opened,
}

/// Coarse session status reported to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Closed,
    Inviting,
    Syncing,
    Opened,
}

impl From<SessionState> for SessionStatus {
    fn from(state: SessionState) -> Self {
        match state {
            SessionState::Closed => SessionStatus::Closed,
            SessionState::InviteControl | SessionState::InviteData => SessionStatus::Inviting,
            SessionState::WaitInvite | SessionState::ClockSync0 | SessionState::ClockSync1 | SessionState::ClockSync2 => SessionStatus::Syncing,
            SessionState::Opened => SessionStatus::Opened,
        }
    }
}
