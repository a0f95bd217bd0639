use std::sync::OnceLock;

/// Select the rustls crypto provider once per process.
///
/// rustls 0.23 panics on first use when more than one provider feature is enabled in the
/// dependency graph (reqwest and tokio-tungstenite both pull rustls in). Both the websocket
/// transport and the forwarding client call this before building TLS state.
pub fn install_rustls_crypto_provider() {
    static INSTALLED: OnceLock<()> = OnceLock::new();
    INSTALLED.get_or_init(|| {
        // Err means another provider is already installed, which is fine.
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}
