use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy)]
pub enum ShutdownEvent {
    Graceful,
    Immediate,
}

/// First CTRL+C asks for a graceful stop; the second forces an exit.
pub fn spawn_ctrl_c_handler(shutdown_tx: mpsc::UnboundedSender<ShutdownEvent>) {
    tokio::spawn(async move {
        let mut signals = 0u32;
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            signals += 1;
            let event = if signals == 1 {
                ShutdownEvent::Graceful
            } else {
                ShutdownEvent::Immediate
            };
            if shutdown_tx.send(event).is_err() || signals > 1 {
                return;
            }
        }
    });
}
