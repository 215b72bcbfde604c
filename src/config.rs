use clap::Parser;

/// IRCv3 gateway to a Matrix homeserver.
#[derive(Parser, Debug, Clone)]
#[command(name = "matrix-irc-gateway", version, about)]
pub struct ServerConfig {
    /// Plain TCP listener address.
    #[arg(long, default_value = "127.0.0.1:6667")]
    pub listen_addr: String,

    /// TLS listener address. Only active if --tls-cert and --tls-key are set.
    #[arg(long, default_value = "127.0.0.1:6697")]
    pub tls_listen_addr: String,

    /// Path to TLS certificate PEM file.
    #[arg(long)]
    pub tls_cert: Option<String>,

    /// Path to TLS private key PEM file.
    #[arg(long)]
    pub tls_key: Option<String>,

    /// Homeserver base URL for every connection. By default each user's
    /// homeserver is derived from their nick (`localpart:homeserver`).
    #[arg(long)]
    pub homeserver_url: Option<String>,

    /// Long-poll timeout for /sync, in milliseconds.
    #[arg(long, default_value = "30000")]
    pub sync_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:6667".to_string(),
            tls_listen_addr: "127.0.0.1:6697".to_string(),
            tls_cert: None,
            tls_key: None,
            homeserver_url: None,
            sync_timeout_ms: 30_000,
        }
    }
}

impl ServerConfig {
    /// Returns true if TLS is configured.
    pub fn tls_enabled(&self) -> bool {
        self.tls_cert.is_some() && self.tls_key.is_some()
    }
}
