//! Entry point for the Cocoon guest supervisor.

#[cfg(not(target_os = "linux"))]
compile_error!("the cocoon guest supervisor is Linux-only; build with a Linux target");

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use cocoon_shared::{CocoonError, CocoonResult, Transport};
use guest::bridge;
use guest::core::GuestCore;
use guest::oslayer::SystemOs;
use guest::runtime::RuncRuntime;
use tracing::info;

/// Cocoon guest supervisor - manages OCI containers inside the utility VM
/// on behalf of the host runtime.
#[derive(Parser, Debug)]
#[command(author, version, about = "Cocoon guest supervisor")]
struct GuestArgs {
    /// Listen URI for host communication
    ///
    /// Examples:
    ///   --listen vsock://2695
    ///   --listen unix:///run/cocoon.sock
    #[arg(short, long)]
    listen: String,

    /// Notify URI dialed once the supervisor is ready to serve
    #[arg(short, long)]
    notify: Option<String>,

    /// OCI runtime binary used for container operations
    #[arg(long, default_value = "runc")]
    runtime: PathBuf,

    /// State directory handed to the OCI runtime
    #[arg(long, default_value = "/run/cocoon/runtime")]
    runtime_root: PathBuf,
}

#[tokio::main]
async fn main() -> CocoonResult<()> {
    // Panics must reach the console even before logging is up.
    std::panic::set_hook(Box::new(|panic_info| {
        eprintln!("[PANIC] guest supervisor panicked: {panic_info}");
        std::process::exit(1);
    }));

    if let Err(e) = tracing_subscriber::fmt()
        .with_target(true)
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init()
    {
        eprintln!("[ERROR] failed to initialize tracing: {e}");
        // Logging failure should not stop the supervisor.
    }

    let args = GuestArgs::parse();

    // Detached container processes reparent to us; without the subreaper
    // flag their exit statuses would be lost to pid 1.
    nix::sys::prctl::set_child_subreaper(true)
        .map_err(|e| CocoonError::os("set child subreaper", e))?;

    let listen = Transport::from_uri(&args.listen)?;
    let notify = args
        .notify
        .as_deref()
        .map(Transport::from_uri)
        .transpose()?;

    info!(
        runtime = %args.runtime.display(),
        runtime_root = %args.runtime_root.display(),
        "cocoon guest supervisor starting"
    );

    let runtime = Arc::new(RuncRuntime::new(args.runtime, args.runtime_root));
    let os = Arc::new(SystemOs::new());
    let core = GuestCore::new(runtime, os);

    bridge::serve(core, listen, notify).await
}
