use tokio::sync::broadcast;

/// Cancellation signal shared by the dispatcher, the transfer
/// workers, and their per-endpoint reader and writer tasks. Each task
/// holds its own clone and waits on `recv` at its suspension points;
/// one `send` releases them all.
#[derive(Debug)]
pub struct ShutdownManager {
    shutdown: bool,
    receiver: broadcast::Receiver<()>,
    sender: broadcast::Sender<()>,
}

impl ShutdownManager {
    pub fn new() -> ShutdownManager {
        let (sender, receiver) = broadcast::channel(1);
        ShutdownManager { shutdown: false, receiver, sender }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown
    }

    /// Resolves once shutdown has been signalled. Returns immediately
    /// on every call after the first observed signal.
    pub async fn recv(&mut self) {
        if self.shutdown {
            return;
        }

        let _ = self.receiver.recv().await;
        self.shutdown = true;
    }

    pub fn send(&mut self) {
        self.shutdown = true;
        let _ = self.sender.send(());
    }
}

impl Default for ShutdownManager {
    fn default() -> ShutdownManager {
        ShutdownManager::new()
    }
}

impl Clone for ShutdownManager {
    fn clone(&self) -> ShutdownManager {
        ShutdownManager {
            shutdown: false,
            receiver: self.sender.subscribe(),
            sender: self.sender.clone(),
        }
    }
}
