use console::Term;
use threadkeep::CancelSignal;

/// Set up the Ctrl+C handler for graceful shutdown.
///
/// The first Ctrl+C cancels the session: the crawl stops before its next
/// page, buffered records are flushed and reply tasks settle as cancelled.
/// A second Ctrl+C exits immediately.
pub(crate) fn setup_shutdown_handler(cancel: CancelSignal) {
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to install Ctrl+C handler");
            return;
        }

        let is_tty = Term::stdout().is_term();
        if is_tty {
            eprintln!("\n\nShutdown requested, flushing buffered comments...");
            eprintln!("Press Ctrl+C again to force quit.");
        } else {
            tracing::warn!("Shutdown requested, flushing buffered comments");
        }

        cancel.cancel();

        // Wait for second Ctrl+C for force quit
        if tokio::signal::ctrl_c().await.is_ok() {
            if is_tty {
                eprintln!("Force quit!");
            }
            std::process::exit(130);
        }
    });
}
