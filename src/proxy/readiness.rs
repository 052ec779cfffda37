use tokio::sync::watch;

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ProxyReadiness {
    Pending,
    Ready(String),
    Failed(String),
}

impl ProxyReadiness {
    pub fn is_pending(&self) -> bool {
        matches!(self, ProxyReadiness::Pending)
    }
}

/// A write-once readiness signal with any number of readers
pub struct Readiness {
    state: watch::Sender<ProxyReadiness>,
}

impl Default for Readiness {
    fn default() -> Self {
        Readiness::new()
    }
}

impl Readiness {
    pub fn new() -> Readiness {
        let (state, _) = watch::channel(ProxyReadiness::Pending);
        Readiness { state }
    }

    /// Records the final state. Returns `false` (and leaves the state unchanged) if a final
    ///  state was recorded before.
    pub fn set(&self, final_state: ProxyReadiness) -> bool {
        if final_state.is_pending() {
            return false;
        }
        self.state.send_if_modified(|state| {
            if state.is_pending() {
                *state = final_state;
                true
            }
            else {
                false
            }
        })
    }

    pub fn current(&self) -> ProxyReadiness {
        self.state.borrow().clone()
    }

    /// Waits until a final state is recorded
    pub async fn wait(&self) -> ProxyReadiness {
        let mut receiver = self.state.subscribe();
        let final_state = receiver.wait_for(|state| !state.is_pending()).await
            .map(|state| state.clone());
        final_state.unwrap_or_else(|_| self.current())
    }
}
