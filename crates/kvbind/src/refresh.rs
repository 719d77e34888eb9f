use tokio::sync::broadcast;
use tracing::debug;

/// Why a binding should re-read its record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshReason {
    /// The application became visible again after being hidden.
    VisibilityRegained,
    Manual,
}

/// Broadcast source of refresh triggers.
///
/// Every mounted binding subscribes; firing re-reads all of them. Tests use
/// it directly instead of real visibility events.
#[derive(Debug, Clone)]
pub struct RefreshTrigger {
    tx: broadcast::Sender<RefreshReason>,
}

impl RefreshTrigger {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(16);
        Self { tx }
    }

    /// Notify every subscriber. Returns how many received it.
    pub fn fire(&self, reason: RefreshReason) -> usize {
        let delivered = self.tx.send(reason).unwrap_or(0);
        debug!(?reason, delivered, "refresh fired");
        delivered
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RefreshReason> {
        self.tx.subscribe()
    }
}

impl Default for RefreshTrigger {
    fn default() -> Self {
        Self::new()
    }
}

/// Application visibility as reported by the host environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisibilityState {
    Visible,
    Hidden,
}

/// Turns visibility changes into refresh triggers: becoming visible fires
/// [`RefreshReason::VisibilityRegained`], everything else is ignored.
#[derive(Debug, Clone)]
pub struct Visibility {
    trigger: RefreshTrigger,
    last: VisibilityState,
}

impl Visibility {
    pub fn new(trigger: RefreshTrigger) -> Self {
        Self {
            trigger,
            last: VisibilityState::Visible,
        }
    }

    /// Report the current visibility. Returns whether a refresh fired.
    pub fn set(&mut self, state: VisibilityState) -> bool {
        let regained = state == VisibilityState::Visible && self.last == VisibilityState::Hidden;
        self.last = state;
        if regained {
            self.trigger.fire(RefreshReason::VisibilityRegained);
        }
        regained
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_hidden_to_visible_fires() {
        let trigger = RefreshTrigger::new();
        let mut rx = trigger.subscribe();
        let mut visibility = Visibility::new(trigger);

        assert!(!visibility.set(VisibilityState::Visible));
        assert!(!visibility.set(VisibilityState::Hidden));
        assert!(!visibility.set(VisibilityState::Hidden));
        assert!(visibility.set(VisibilityState::Visible));

        assert_eq!(rx.try_recv().unwrap(), RefreshReason::VisibilityRegained);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn fire_without_subscribers_is_harmless() {
        assert_eq!(RefreshTrigger::new().fire(RefreshReason::Manual), 0);
    }
}
