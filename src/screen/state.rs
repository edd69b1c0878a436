//! Active-screen state and the transition decision function.
//!
//! The server owns input locally while `active` is `None`; a direction
//! means the client configured at that edge receives the input streams.
//! [`decide`] is a pure function of the current state and a connectivity
//! view, so every rule is unit-testable without sockets.

use std::fmt;

use serde::{Deserialize, Serialize};

/// One of the four edges of the server screen, each mappable to a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScreenPosition {
    Left,
    Right,
    Up,
    Down,
}

impl ScreenPosition {
    pub const ALL: [ScreenPosition; 4] = [
        ScreenPosition::Left,
        ScreenPosition::Right,
        ScreenPosition::Up,
        ScreenPosition::Down,
    ];

    /// Edge on the far side of the screen.
    pub fn opposite(self) -> Self {
        match self {
            Self::Left => Self::Right,
            Self::Right => Self::Left,
            Self::Up => Self::Down,
            Self::Down => Self::Up,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Left => "left",
            Self::Right => "right",
            Self::Up => "up",
            Self::Down => "down",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "left" => Some(Self::Left),
            "right" => Some(Self::Right),
            "up" => Some(Self::Up),
            "down" => Some(Self::Down),
            _ => None,
        }
    }
}

impl fmt::Display for ScreenPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a transition decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Nothing changes: guard blocked, same target, or target unusable.
    NoTransition,
    /// Input ownership returns to the server.
    NoScreen,
    /// Input ownership moves to the client at this edge.
    ToScreen(ScreenPosition),
}

/// Connectivity view the decision function consults.
///
/// Implemented by the clients registry; tests use a plain set.
pub trait ClientView {
    /// A client is configured at this position.
    fn has_position(&self, pos: ScreenPosition) -> bool;
    /// The client at this position currently has a live connection.
    fn is_connected(&self, pos: ScreenPosition) -> bool;
}

/// Decide the transition for a proposed target.
///
/// Rules, in order:
/// 1. a blocked guard freezes everything;
/// 2. re-selecting the active screen is a no-op;
/// 3. `None` always collapses to local ownership;
/// 4. an absent or disconnected target is ignored;
/// 5. switching directly between two clients detours through local
///    ownership first;
/// 6. otherwise control moves to the target edge.
pub fn decide<V: ClientView>(
    active: Option<ScreenPosition>,
    target: Option<ScreenPosition>,
    blocked: bool,
    clients: &V,
) -> Transition {
    if blocked {
        return Transition::NoTransition;
    }
    if target == active {
        return Transition::NoTransition;
    }
    let Some(t) = target else {
        return Transition::NoScreen;
    };
    if !clients.has_position(t) || !clients.is_connected(t) {
        return Transition::NoTransition;
    }
    if active.is_some() {
        return Transition::NoScreen;
    }
    Transition::ToScreen(t)
}

/// Warp coordinates for entering the screen at `target`.
///
/// The cursor lands just inside the crossed edge, one safe inset past the
/// threshold, so the warp itself cannot re-trigger edge detection.
pub fn entry_warp(
    target: ScreenPosition,
    mouse: (f64, f64),
    width: i32,
    height: i32,
    threshold: i32,
    inset: i32,
) -> (f64, f64) {
    let near = f64::from(threshold + inset);
    match target {
        ScreenPosition::Left => (near, mouse.1),
        ScreenPosition::Right => (f64::from(width - threshold - inset), mouse.1),
        ScreenPosition::Up => (mouse.0, near),
        ScreenPosition::Down => (mouse.0, f64::from(height - threshold - inset)),
    }
}

/// Warp coordinates for a return edge: the cursor re-enters the server on
/// the inner point of the edge opposite the client it came from, at the
/// coordinate the client reported.
pub fn return_warp(
    from: ScreenPosition,
    coordinate: f64,
    width: i32,
    height: i32,
    threshold: i32,
    inset: i32,
) -> (f64, f64) {
    entry_warp(from.opposite(), (coordinate, coordinate), width, height, threshold, inset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    struct FakeClients {
        configured: HashSet<ScreenPosition>,
        connected: HashSet<ScreenPosition>,
    }

    impl FakeClients {
        fn new(configured: &[ScreenPosition], connected: &[ScreenPosition]) -> Self {
            Self {
                configured: configured.iter().copied().collect(),
                connected: connected.iter().copied().collect(),
            }
        }
    }

    impl ClientView for FakeClients {
        fn has_position(&self, pos: ScreenPosition) -> bool {
            self.configured.contains(&pos)
        }
        fn is_connected(&self, pos: ScreenPosition) -> bool {
            self.connected.contains(&pos)
        }
    }

    use ScreenPosition::{Down, Left, Right, Up};

    #[test]
    fn test_blocked_guard_freezes_all() {
        let clients = FakeClients::new(&[Left], &[Left]);
        for active in [None, Some(Left), Some(Right)] {
            for target in [None, Some(Left), Some(Up)] {
                assert_eq!(decide(active, target, true, &clients), Transition::NoTransition);
            }
        }
    }

    #[test]
    fn test_same_target_is_noop() {
        let clients = FakeClients::new(&[Left], &[Left]);
        assert_eq!(decide(Some(Left), Some(Left), false, &clients), Transition::NoTransition);
        assert_eq!(decide(None, None, false, &clients), Transition::NoTransition);
    }

    #[test]
    fn test_none_collapses_to_local() {
        let clients = FakeClients::new(&[Left], &[Left]);
        assert_eq!(decide(Some(Left), None, false, &clients), Transition::NoScreen);
    }

    #[test]
    fn test_cross_to_connected_client() {
        let clients = FakeClients::new(&[Left], &[Left]);
        assert_eq!(decide(None, Some(Left), false, &clients), Transition::ToScreen(Left));
    }

    #[test]
    fn test_cross_to_disconnected_client_ignored() {
        let clients = FakeClients::new(&[Left], &[]);
        assert_eq!(decide(None, Some(Left), false, &clients), Transition::NoTransition);
    }

    #[test]
    fn test_cross_to_unconfigured_edge_ignored() {
        let clients = FakeClients::new(&[Left], &[Left]);
        assert_eq!(decide(None, Some(Right), false, &clients), Transition::NoTransition);
    }

    #[test]
    fn test_client_to_client_detours_through_local() {
        let clients = FakeClients::new(&[Left, Right], &[Left, Right]);
        assert_eq!(decide(Some(Left), Some(Right), false, &clients), Transition::NoScreen);
    }

    #[test]
    fn test_decide_is_deterministic_over_all_states() {
        let clients = FakeClients::new(&[Left, Up], &[Left]);
        let positions = [None, Some(Left), Some(Right), Some(Up), Some(Down)];
        for active in positions {
            for target in positions {
                let a = decide(active, target, false, &clients);
                let b = decide(active, target, false, &clients);
                assert_eq!(a, b);
                // Reachable actives stay within None + connected clients.
                if let Transition::ToScreen(p) = a {
                    assert!(clients.is_connected(p));
                }
            }
        }
    }

    #[test]
    fn test_entry_warp_coordinates() {
        // 1920x1080, threshold 10, inset 10, cursor at (5, 500).
        assert_eq!(entry_warp(Left, (5.0, 500.0), 1920, 1080, 10, 10), (20.0, 500.0));
        assert_eq!(entry_warp(Right, (1915.0, 500.0), 1920, 1080, 10, 10), (1900.0, 500.0));
        assert_eq!(entry_warp(Up, (700.0, 5.0), 1920, 1080, 10, 10), (700.0, 20.0));
        assert_eq!(entry_warp(Down, (700.0, 1075.0), 1920, 1080, 10, 10), (700.0, 1060.0));
    }

    #[test]
    fn test_return_warp_lands_on_opposite_edge() {
        // Return from the left client at y=400 lands on the right inner edge.
        assert_eq!(return_warp(Left, 400.0, 1920, 1080, 10, 10), (1900.0, 400.0));
        // Return from the right client lands on the left inner edge.
        assert_eq!(return_warp(Right, 400.0, 1920, 1080, 10, 10), (20.0, 400.0));
        // Vertical returns use the x coordinate.
        assert_eq!(return_warp(Up, 640.0, 1920, 1080, 10, 10), (640.0, 1060.0));
    }
}
