/// Connection state shared by the signaling client, each peer, and the room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

/// The three constituent states the engine tracks, and whether the primary
/// peer (publisher unless subscriber-primary) is part of `pub_state` or
/// `sub_state`.
#[derive(Debug, Clone, Copy)]
pub struct ConstituentStates {
    pub sig: ConnectionState,
    pub publisher: ConnectionState,
    pub subscriber: ConnectionState,
    pub subscriber_primary: bool,
    /// Set once a capture-start or stream-task failure occurs; sticky
    /// until the next `Join` rebuilds the engine's state.
    pub media_failed: bool,
}

/// Recomputes the engine's aggregate state from its three constituents.
/// Rules applied in order, first match wins.
pub fn aggregate_state(states: ConstituentStates) -> ConnectionState {
    use ConnectionState::*;

    let primary = if states.subscriber_primary {
        states.subscriber
    } else {
        states.publisher
    };

    if states.media_failed || states.sig == Failed || states.publisher == Failed || states.subscriber == Failed {
        return Failed;
    }
    if states.sig == Reconnecting || states.publisher == Reconnecting || states.subscriber == Reconnecting {
        return Reconnecting;
    }
    if states.sig == Connected && primary == Connected {
        return Connected;
    }
    if states.sig == Disconnected && states.publisher == Disconnected && states.subscriber == Disconnected {
        return Disconnected;
    }
    Connecting
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionState::*;

    fn states(sig: ConnectionState, publisher: ConnectionState, subscriber: ConnectionState) -> ConstituentStates {
        ConstituentStates {
            sig,
            publisher,
            subscriber,
            subscriber_primary: false,
            media_failed: false,
        }
    }

    #[test]
    fn all_disconnected_is_disconnected() {
        assert_eq!(aggregate_state(states(Disconnected, Disconnected, Disconnected)), Disconnected);
    }

    #[test]
    fn any_failed_wins_over_everything() {
        assert_eq!(aggregate_state(states(Connected, Failed, Connected)), Failed);
        assert_eq!(aggregate_state(states(Reconnecting, Failed, Disconnected)), Failed);
    }

    #[test]
    fn any_reconnecting_wins_unless_failed_present() {
        assert_eq!(aggregate_state(states(Connected, Reconnecting, Connected)), Reconnecting);
    }

    #[test]
    fn connected_requires_signaling_and_primary_peer() {
        assert_eq!(aggregate_state(states(Connected, Connected, Disconnected)), Connected);
        assert_eq!(aggregate_state(states(Connected, Disconnected, Connected)), Connecting);
    }

    #[test]
    fn subscriber_primary_picks_subscriber_as_primary() {
        let s = ConstituentStates {
            sig: Connected,
            publisher: Connecting,
            subscriber: Connected,
            subscriber_primary: true,
            media_failed: false,
        };
        assert_eq!(aggregate_state(s), Connected);
    }

    #[test]
    fn partial_progress_is_connecting() {
        assert_eq!(aggregate_state(states(Connecting, Disconnected, Disconnected)), Connecting);
        assert_eq!(aggregate_state(states(Connected, Connecting, Disconnected)), Connecting);
    }

    #[test]
    fn media_failed_wins_even_when_everything_else_is_connected() {
        let s = ConstituentStates {
            sig: Connected,
            publisher: Connected,
            subscriber: Connected,
            subscriber_primary: false,
            media_failed: true,
        };
        assert_eq!(aggregate_state(s), Failed);
    }
}
