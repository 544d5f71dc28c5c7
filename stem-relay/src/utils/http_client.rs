use std::{sync::OnceLock, time::Duration};

use tracing::{debug, warn};

/// Install the aws-lc rustls provider once per process.
///
/// Both reqwest and lettre build rustls client configs; with more than one
/// provider compiled in, rustls requires a process default.
pub fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            // Safe to ignore: can happen if another crate installed it first.
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}

/// Build the HTTP client used by notification channels.
pub fn build_notify_client(request_timeout: Duration) -> reqwest::Client {
    install_rustls_provider();

    let mut builder = reqwest::Client::builder();
    if request_timeout > Duration::ZERO {
        builder = builder.timeout(request_timeout);
    }

    builder.build().unwrap_or_else(|error| {
        warn!(error = %error, "Failed to build HTTP client; using defaults");
        reqwest::Client::new()
    })
}
