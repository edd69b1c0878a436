//! Transition controller: serializes active-screen changes.
//!
//! Two cooperating tasks share a `changed` generation signal and a
//! `completed` notification:
//!
//! - the **checker** realizes a committed transition (overlay toggle +
//!   cursor warp) and signals completion;
//! - the **securer** holds the `blocked` flag until completion, with a
//!   5 s ceiling so a stuck warp can never deadlock input routing.
//!
//! `blocked` is set synchronously at commit time, under the state lock,
//! so a second edge event racing the in-flight warp is rejected by
//! [`decide`] before anything moves. Without this guard, a slow warp plus
//! continued mouse motion flips the active screen back and forth.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::constants::{TRANSITION_GUARD_TIMEOUT, WARP_SAFE_INSET};
use crate::event::{BusEvent, EventBus};
use crate::input::ScreenController;

use super::state::{decide, entry_warp, return_warp, ClientView, ScreenPosition, Transition};

/// Work item handed from a commit to the checker task.
#[derive(Debug, Clone)]
struct Pending {
    overlay: bool,
    warp: Option<(f64, f64)>,
}

struct GuardInner {
    active: Mutex<Option<ScreenPosition>>,
    mouse_position: Mutex<(f64, f64)>,
    blocked: AtomicBool,
    pending: Mutex<Option<Pending>>,
    changed_tx: watch::Sender<u64>,
    completed: Notify,
    screen: Arc<dyn ScreenController>,
    events: Arc<EventBus>,
    threshold: i32,
}

/// Server-side active-screen controller.
pub struct TransitionController {
    inner: Arc<GuardInner>,
    checker: JoinHandle<()>,
    securer: JoinHandle<()>,
}

impl std::fmt::Debug for TransitionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransitionController")
            .field("active", &self.active())
            .field("blocked", &self.is_blocked())
            .finish_non_exhaustive()
    }
}

impl TransitionController {
    pub fn new(
        screen: Arc<dyn ScreenController>,
        events: Arc<EventBus>,
        threshold: i32,
    ) -> Self {
        let (changed_tx, changed_rx) = watch::channel(0u64);
        let inner = Arc::new(GuardInner {
            active: Mutex::new(None),
            mouse_position: Mutex::new((0.0, 0.0)),
            blocked: AtomicBool::new(false),
            pending: Mutex::new(None),
            changed_tx,
            completed: Notify::new(),
            screen,
            events,
            threshold,
        });

        let checker = tokio::spawn(Self::checker_loop(Arc::clone(&inner), changed_rx.clone()));
        let securer = tokio::spawn(Self::securer_loop(Arc::clone(&inner), changed_rx));

        Self {
            inner,
            checker,
            securer,
        }
    }

    /// Checker: waits for `changed`, realizes the transition, signals
    /// `completed`.
    async fn checker_loop(inner: Arc<GuardInner>, mut changed: watch::Receiver<u64>) {
        while changed.changed().await.is_ok() {
            let pending = inner.pending.lock().expect("pending lock").take();
            let Some(p) = pending else { continue };

            log::debug!(
                "[Guard] realizing transition (overlay={}, warp={:?})",
                p.overlay,
                p.warp
            );
            inner.screen.set_overlay(p.overlay).await;
            if let Some((x, y)) = p.warp {
                inner.screen.warp(x, y).await;
            }
            inner.completed.notify_one();
        }
    }

    /// Securer: waits for `changed`, then clears `blocked` once the
    /// checker completes or the guard timeout elapses.
    async fn securer_loop(inner: Arc<GuardInner>, mut changed: watch::Receiver<u64>) {
        while changed.changed().await.is_ok() {
            if timeout(TRANSITION_GUARD_TIMEOUT, inner.completed.notified())
                .await
                .is_err()
            {
                log::warn!(
                    "[Guard] transition not completed within {}s; clearing block",
                    TRANSITION_GUARD_TIMEOUT.as_secs()
                );
            }
            inner.blocked.store(false, Ordering::SeqCst);
        }
    }

    /// Latest cursor position as reported by the mouse listener.
    pub fn update_mouse_position(&self, x: f64, y: f64) {
        *self.inner.mouse_position.lock().expect("mouse lock") = (x, y);
    }

    pub fn mouse_position(&self) -> (f64, f64) {
        *self.inner.mouse_position.lock().expect("mouse lock")
    }

    pub fn active(&self) -> Option<ScreenPosition> {
        *self.inner.active.lock().expect("active lock")
    }

    pub fn is_blocked(&self) -> bool {
        self.inner.blocked.load(Ordering::SeqCst)
    }

    /// Propose a new target (edge crossing or explicit change).
    ///
    /// Runs the decision under the state lock with no I/O inside; a commit
    /// sets `blocked`, stashes the warp for the checker and publishes
    /// `ActiveScreenChanged`.
    pub fn change_screen<V: ClientView>(
        &self,
        clients: &V,
        target: Option<ScreenPosition>,
    ) -> Transition {
        let (width, height) = self.inner.screen.screen_size();
        let mouse = self.mouse_position();

        let mut active = self.inner.active.lock().expect("active lock");
        let decision = decide(*active, target, self.is_blocked(), clients);

        match decision {
            Transition::NoTransition => {}
            Transition::NoScreen => {
                *active = None;
                self.commit(None, None, "");
            }
            Transition::ToScreen(t) => {
                *active = Some(t);
                let warp = entry_warp(t, mouse, width, height, self.inner.threshold, WARP_SAFE_INSET);
                self.commit(Some(t), Some(warp), "");
            }
        }
        decision
    }

    /// Handle a `return` command from the client at `from`.
    ///
    /// Collapses to local ownership and warps the cursor onto the inner
    /// point of the opposite edge at the client-reported coordinate.
    pub fn handle_return<V: ClientView>(
        &self,
        clients: &V,
        from: ScreenPosition,
        coordinate: f64,
    ) -> Transition {
        let (width, height) = self.inner.screen.screen_size();

        let mut active = self.inner.active.lock().expect("active lock");
        let decision = decide(*active, None, self.is_blocked(), clients);
        if decision == Transition::NoScreen {
            *active = None;
            let warp = return_warp(
                from,
                coordinate,
                width,
                height,
                self.inner.threshold,
                WARP_SAFE_INSET,
            );
            self.commit(None, Some(warp), from.as_str());
        }
        decision
    }

    /// Collapse after the active client disconnected.
    ///
    /// Bypasses the `blocked` flag: a transition in flight toward a dead
    /// client must still land on local ownership.
    pub fn client_disconnected(&self, screen: ScreenPosition) {
        let mut active = self.inner.active.lock().expect("active lock");
        if *active == Some(screen) {
            log::info!("[Guard] active client {screen} disconnected; collapsing to local");
            *active = None;
            self.commit(None, None, screen.as_str());
        }
    }

    /// Stash the realized state for the checker, raise the block and
    /// publish the change. Caller holds the `active` lock.
    fn commit(&self, active: Option<ScreenPosition>, warp: Option<(f64, f64)>, source: &str) {
        self.inner.blocked.store(true, Ordering::SeqCst);
        *self.inner.pending.lock().expect("pending lock") = Some(Pending {
            overlay: active.is_some(),
            warp,
        });
        self.inner.changed_tx.send_modify(|generation| *generation += 1);

        let (x, y) = warp.unwrap_or((-1.0, -1.0));
        self.inner.events.publish(BusEvent::ActiveScreenChanged {
            active,
            source: source.to_string(),
            x,
            y,
        });
    }

    /// Abort both guard tasks. Pending transitions are dropped.
    pub fn shutdown(&self) {
        self.checker.abort();
        self.securer.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;
    use crate::input::{HeadlessInput, MouseController};
    use std::collections::HashSet;
    use std::time::Duration;

    struct FakeClients(HashSet<ScreenPosition>);

    impl ClientView for FakeClients {
        fn has_position(&self, pos: ScreenPosition) -> bool {
            self.0.contains(&pos)
        }
        fn is_connected(&self, pos: ScreenPosition) -> bool {
            self.0.contains(&pos)
        }
    }

    fn connected(positions: &[ScreenPosition]) -> FakeClients {
        FakeClients(positions.iter().copied().collect())
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(80)).await;
    }

    #[tokio::test]
    async fn test_cross_to_left_commits_and_unblocks() {
        let input = HeadlessInput::new(1920, 1080);
        let events = EventBus::new();
        let guard = TransitionController::new(input.clone(), events, 10);
        guard.update_mouse_position(5.0, 500.0);

        let clients = connected(&[ScreenPosition::Left]);
        let decision = guard.change_screen(&clients, Some(ScreenPosition::Left));
        assert_eq!(decision, Transition::ToScreen(ScreenPosition::Left));
        assert_eq!(guard.active(), Some(ScreenPosition::Left));

        settle().await;
        // Warp landed at (threshold + inset, my) and the block cleared.
        assert_eq!(input.position().await, (20.0, 500.0));
        assert!(!guard.is_blocked());
        guard.shutdown();
    }

    #[tokio::test]
    async fn test_cross_to_disconnected_target_is_ignored() {
        let input = HeadlessInput::new(1920, 1080);
        let events = EventBus::new();
        let guard = TransitionController::new(input.clone(), events, 10);
        guard.update_mouse_position(5.0, 500.0);

        let clients = connected(&[]);
        let decision = guard.change_screen(&clients, Some(ScreenPosition::Left));
        assert_eq!(decision, Transition::NoTransition);
        assert_eq!(guard.active(), None);

        settle().await;
        // No warp was issued.
        assert_eq!(input.position().await, (0.0, 0.0));
        guard.shutdown();
    }

    #[tokio::test]
    async fn test_return_from_left_warps_to_right_inner_edge() {
        let input = HeadlessInput::new(1920, 1080);
        let events = EventBus::new();

        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        events.subscribe(EventKind::ActiveScreenChanged, move |e| {
            if let BusEvent::ActiveScreenChanged { active, .. } = e {
                seen_clone.lock().unwrap().push(*active);
            }
        });

        let guard = TransitionController::new(input.clone(), Arc::clone(&events), 10);
        guard.update_mouse_position(5.0, 500.0);

        let clients = connected(&[ScreenPosition::Left]);
        guard.change_screen(&clients, Some(ScreenPosition::Left));
        settle().await;

        let decision = guard.handle_return(&clients, ScreenPosition::Left, 400.0);
        assert_eq!(decision, Transition::NoScreen);
        assert_eq!(guard.active(), None);

        settle().await;
        assert_eq!(input.position().await, (1900.0, 400.0));
        assert_eq!(
            &*seen.lock().unwrap(),
            &[Some(ScreenPosition::Left), None]
        );
        guard.shutdown();
    }

    #[tokio::test]
    async fn test_blocked_guard_rejects_second_transition() {
        let input = HeadlessInput::new(1920, 1080);
        let events = EventBus::new();
        let guard = TransitionController::new(input, events, 10);

        let clients = connected(&[ScreenPosition::Left, ScreenPosition::Right]);
        guard.change_screen(&clients, Some(ScreenPosition::Left));
        // Immediately after commit the guard is blocked; a second edge
        // event must not flip anything.
        assert!(guard.is_blocked());
        let second = guard.change_screen(&clients, Some(ScreenPosition::Right));
        assert_eq!(second, Transition::NoTransition);
        assert_eq!(guard.active(), Some(ScreenPosition::Left));
        guard.shutdown();
    }

    #[tokio::test]
    async fn test_disconnect_of_active_client_collapses() {
        let input = HeadlessInput::new(1920, 1080);
        let events = EventBus::new();
        let guard = TransitionController::new(input, events, 10);

        let clients = connected(&[ScreenPosition::Right]);
        guard.change_screen(&clients, Some(ScreenPosition::Right));
        settle().await;
        assert_eq!(guard.active(), Some(ScreenPosition::Right));

        guard.client_disconnected(ScreenPosition::Right);
        assert_eq!(guard.active(), None);
        settle().await;
        assert!(!guard.is_blocked());
        guard.shutdown();
    }

    /// A screen controller whose warp never finishes.
    struct StuckScreen;

    #[async_trait::async_trait]
    impl crate::input::ScreenController for StuckScreen {
        async fn warp(&self, _x: f64, _y: f64) {
            std::future::pending::<()>().await;
        }
        async fn set_overlay(&self, _active: bool) {}
        fn screen_size(&self) -> (i32, i32) {
            (1920, 1080)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_warp_unblocks_after_timeout() {
        let events = EventBus::new();
        let guard = TransitionController::new(Arc::new(StuckScreen), events, 10);

        let clients = connected(&[ScreenPosition::Left]);
        guard.change_screen(&clients, Some(ScreenPosition::Left));
        assert!(guard.is_blocked());

        // The warp never completes; the securer clears the block at the
        // guard timeout so input routing cannot deadlock.
        tokio::time::sleep(crate::constants::TRANSITION_GUARD_TIMEOUT + Duration::from_millis(100))
            .await;
        assert!(!guard.is_blocked());
        assert_eq!(guard.active(), Some(ScreenPosition::Left));
        guard.shutdown();
    }

    #[tokio::test]
    async fn test_disconnect_of_inactive_client_is_noop() {
        let input = HeadlessInput::new(1920, 1080);
        let events = EventBus::new();
        let guard = TransitionController::new(input, events, 10);

        guard.client_disconnected(ScreenPosition::Down);
        assert_eq!(guard.active(), None);
        assert!(!guard.is_blocked());
        guard.shutdown();
    }
}
