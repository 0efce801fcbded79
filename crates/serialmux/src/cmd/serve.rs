use std::sync::Arc;

use serialmux_device::{DeviceBackend, SerialportBackend};
use serialmux_host::Host;

use crate::cmd::ServeArgs;
use crate::exit::{host_error, io_error, CliResult, SUCCESS};

pub fn run(args: ServeArgs) -> CliResult<i32> {
    if !args.origin.is_empty() || args.parent_window.is_some() {
        tracing::debug!(origin = ?args.origin, parent_window = ?args.parent_window, "launched by browser");
    }
    let config = args.host_config();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("serialmux")
        .build()
        .map_err(|err| io_error("failed to start runtime", err))?;

    let backend: Arc<dyn DeviceBackend> = Arc::new(SerialportBackend::new());
    let served = runtime.block_on(async move {
        let host = Host::new(config, backend);
        host.run(tokio::io::stdin(), tokio::io::stdout(), shutdown_signal())
            .await
    });

    // A pending stdin read holds a blocking thread that never wakes up; do not wait on it.
    runtime.shutdown_background();

    served.map_err(|err| host_error("serve failed", err))?;
    tracing::info!("host stopped");
    Ok(SUCCESS)
}

/// Resolves on Ctrl-C, or SIGTERM on Unix.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
                return;
            }
            Err(err) => tracing::warn!(error = %err, "cannot listen for SIGTERM"),
        }
    }

    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "cannot listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}
