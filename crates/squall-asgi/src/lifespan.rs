//! The lifespan protocol adapter.
//!
//! Drives application startup and shutdown from transport lifecycle
//! events. Hook failures are reported back over the transport as
//! structured failure events and never raised — the server decides how
//! to react to a failed startup. The loop exits unconditionally after
//! shutdown.

use std::sync::Arc;

use squall_core::App;
use tokio::sync::mpsc;
use tracing::info;

use crate::events::{LifespanRecvEvent, LifespanSendEvent, SendFn};

/// Bridges server lifecycle events to the app's serving hooks.
pub struct AsgiLifespan {
    app: Arc<App>,
}

impl AsgiLifespan {
    pub fn new(app: Arc<App>) -> Self {
        Self { app }
    }

    pub async fn run(
        self,
        mut receive: mpsc::Receiver<LifespanRecvEvent>,
        send: SendFn<LifespanSendEvent>,
    ) -> anyhow::Result<()> {
        while let Some(event) = receive.recv().await {
            match event {
                LifespanRecvEvent::Startup => {
                    let event = match self.app.startup().await {
                        Ok(()) => {
                            info!(app = %self.app.name(), "application started");
                            LifespanSendEvent::StartupComplete
                        }
                        Err(error) => LifespanSendEvent::StartupFailed {
                            message: error.to_string(),
                        },
                    };
                    send(event).await?;
                }
                LifespanRecvEvent::Shutdown => {
                    let event = match self.app.shutdown().await {
                        Ok(()) => {
                            info!(app = %self.app.name(), "application stopped");
                            LifespanSendEvent::ShutdownComplete
                        }
                        Err(error) => LifespanSendEvent::ShutdownFailed {
                            message: error.to_string(),
                        },
                    };
                    send(event).await?;
                    return Ok(());
                }
            }
        }
        Ok(())
    }
}
