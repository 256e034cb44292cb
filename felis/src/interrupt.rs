use tokio::sync::watch;

/// Set once the process receives SIGINT; shared by everything that has to stop.
#[derive(Clone, Debug)]
pub struct InterruptState {
    sender: std::sync::Arc<watch::Sender<bool>>,
}

impl InterruptState {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: std::sync::Arc::new(sender),
        }
    }

    pub fn set_interrupted(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_interrupted(&self) -> bool {
        *self.sender.borrow()
    }

    /// Resolves once interrupted.
    pub async fn interrupted(&self) {
        let mut receiver = self.sender.subscribe();
        // the sender lives as long as self
        let _ = receiver.wait_for(|interrupted| *interrupted).await;
    }
}

fn set_process_interrupt_handler(interrupted: &InterruptState) -> anyhow::Result<()> {
    let interrupted = interrupted.clone();
    ctrlc::set_handler(move || {
        tracing::info!("interrupted, finishing running changesets");
        interrupted.set_interrupted();
    })
    .map_err(|e| anyhow::anyhow!("Error setting interrupt handler: {}", e))
}

pub fn set_up_process_interrupt_handler() -> anyhow::Result<InterruptState> {
    let interrupt_state = InterruptState::new();
    set_process_interrupt_handler(&interrupt_state)?;
    Ok(interrupt_state)
}
