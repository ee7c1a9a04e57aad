use tracing::{info, warn};

/// Presents the authorization URL to the user.
///
/// Implementations must return promptly and never fail the flow.
pub trait BrowserLauncher: Send + Sync {
    fn open(&self, url: &str);
}

/// Opens URLs with the platform handler (`open`, `start`, `xdg-open`).
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemBrowser;

impl BrowserLauncher for SystemBrowser {
    fn open(&self, url: &str) {
        info!("opening browser for authentication");
        if let Err(e) = open::that_detached(url) {
            warn!(error = %e, "failed to open browser automatically, visit the URL manually");
        }
    }
}

