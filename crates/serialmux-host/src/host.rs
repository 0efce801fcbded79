use std::future::Future;
use std::sync::Arc;

use serialmux_device::DeviceBackend;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;

use crate::config::HostConfig;
use crate::error::{HostError, Result};
use crate::hub::EventHub;
use crate::outbound::{self, run_pipe_writer};

/// A complete host: dispatch loop plus pipe writer over one input and one output.
pub struct Host {
    config: HostConfig,
    backend: Arc<dyn DeviceBackend>,
}

impl Host {
    pub fn new(config: HostConfig, backend: Arc<dyn DeviceBackend>) -> Self {
        Self { config, backend }
    }

    /// Serve until `input` closes, `shutdown` completes, or the output pipe fails.
    ///
    /// Must be called inside a multi-threaded tokio runtime; session readers block on
    /// device I/O from the blocking pool.
    pub async fn run<R, W, F>(self, input: R, output: W, shutdown: F) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
        F: Future<Output = ()>,
    {
        self.config.validate()?;
        let shutdown_timeout = self.config.shutdown_timeout;

        let (outbound, queue) =
            outbound::channel(self.config.outbound_capacity, self.config.debug_events);
        let mut writer = tokio::spawn(run_pipe_writer(
            queue,
            output,
            self.config.data_encoding,
            self.config.frame.clone(),
        ));

        let mut hub = EventHub::new(self.config, self.backend, outbound);
        let served = {
            let serving = hub.serve(input, shutdown);
            tokio::pin!(serving);
            tokio::select! {
                served = &mut serving => served,
                joined = &mut writer => {
                    tracing::error!("pipe writer stopped while serving");
                    return match joined? {
                        Ok(()) => Err(HostError::PipeClosed),
                        Err(err) => Err(err),
                    };
                }
            }
        };

        // Closing sessions and flushing their final events share one window.
        let deadline = Instant::now() + shutdown_timeout;
        let closed = hub.close_all(deadline).await;
        drop(hub);

        // Sessions still holding a producer past the deadline are abandoned.
        match tokio::time::timeout_at(deadline, &mut writer).await {
            Ok(joined) => {
                served?;
                closed?;
                joined?
            }
            Err(_) => {
                tracing::warn!("pipe writer did not drain in time");
                writer.abort();
                served.and(closed)
            }
        }
    }
}
