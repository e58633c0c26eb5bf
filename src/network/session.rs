use tokio::sync::watch;
use uuid::Uuid;

/// Credentials of the agent's session as handed out by the login service
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AgentSession {
    pub agent_id: Uuid,
    pub session_id: Uuid,
    pub secure_session_id: Uuid,
    pub circuit_code: u32,
}

/// Read side of the session-wide 'connected' flag. Bounded waits race against
///  [`LivenessFlag::wait_for_shutdown`] so that they fail fast when the session goes down.
#[derive(Clone, Debug)]
pub struct LivenessFlag {
    receiver: watch::Receiver<bool>,
}

impl LivenessFlag {
    pub fn new(receiver: watch::Receiver<bool>) -> LivenessFlag {
        LivenessFlag { receiver }
    }

    pub fn is_alive(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Completes as soon as the session is (or already was) shut down
    pub async fn wait_for_shutdown(&mut self) {
        let _ = self.receiver.wait_for(|is_alive| !*is_alive).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::runtime::Builder;

    #[test]
    fn test_wait_for_shutdown() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let (sender, receiver) = watch::channel(true);
            let mut flag = LivenessFlag::new(receiver);
            assert!(flag.is_alive());

            let waiting = tokio::time::timeout(Duration::from_secs(1), flag.wait_for_shutdown()).await;
            assert!(waiting.is_err());

            sender.send_replace(false);
            flag.wait_for_shutdown().await;
            assert!(!flag.is_alive());
        });
    }

    #[test]
    fn test_dropped_sender_counts_as_shutdown() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let (sender, receiver) = watch::channel(true);
            let mut flag = LivenessFlag::new(receiver);
            drop(sender);
            tokio::time::timeout(Duration::from_secs(1), flag.wait_for_shutdown()).await.unwrap();
        });
    }
}
