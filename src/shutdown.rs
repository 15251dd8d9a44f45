use tokio::sync::watch;
use tracing::info;

/// Cloneable handle signalling service shutdown to background tasks.
#[derive(Clone, Debug)]
pub struct Shutdown {
    sender: watch::Sender<bool>,
    receiver: watch::Receiver<bool>,
}

impl Shutdown {
    #[must_use]
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(false);
        Self { sender, receiver }
    }

    /// Send the signal to shut the service down.
    pub fn shutdown(&self) {
        // Does not fail because we hold a receiver ourselves.
        self.sender.send(true).unwrap();
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Wait for the shutdown signal.
    ///
    /// Resolves immediately if the service is already shutting down.
    /// The resulting future is safe to cancel by dropping.
    pub async fn await_shutdown_begin(&self) {
        let mut watch = self.receiver.clone();
        if *watch.borrow_and_update() {
            return;
        }
        // Does not fail because we hold a sender ourselves.
        watch.changed().await.unwrap();
    }

    /// Trigger shutdown on SIGINT/SIGTERM.
    pub fn watch_signals(&self) {
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(err) = signal_shutdown().await {
                tracing::error!("Error listening for shutdown signals: {}", err);
            }
            this.shutdown();
        });
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
async fn signal_shutdown() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let sigint = signal(SignalKind::interrupt())?;
    let sigterm = signal(SignalKind::terminate())?;
    tokio::pin!(sigint);
    tokio::pin!(sigterm);
    tokio::select! {
        _ = sigint.recv() => { info!("SIGINT received, shutting down"); }
        _ = sigterm.recv() => { info!("SIGTERM received, shutting down"); }
    };
    Ok(())
}

#[cfg(not(unix))]
async fn signal_shutdown() -> std::io::Result<()> {
    use tokio::signal::ctrl_c;

    ctrl_c().await?;
    info!("Ctrl-C received, shutting down");
    Ok(())
}
