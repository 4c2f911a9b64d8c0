// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

/// Configuration for the hub server.
#[derive(Debug, Clone, clap::Parser)]
pub struct HubConfig {
    /// Host to bind on.
    #[arg(long, default_value = "127.0.0.1", env = "WIREHUB_HOST")]
    pub host: String,

    /// Port to listen on.
    #[arg(long, default_value_t = 9520, env = "WIREHUB_PORT")]
    pub port: u16,

    /// NATS server URL. If unset, an in-process broker is used and the hub
    /// runs single-node.
    #[arg(long, env = "WIREHUB_NATS_URL")]
    pub nats_url: Option<String>,

    /// NATS auth token.
    #[arg(long, env = "WIREHUB_NATS_TOKEN")]
    pub nats_token: Option<String>,

    /// Subject prefix for broker channels and the registry bucket.
    #[arg(long, default_value = "wirehub", env = "WIREHUB_NATS_PREFIX")]
    pub nats_prefix: String,

    /// Secret for signing access and reconnection tokens. If unset, a
    /// random per-process secret is generated (tokens then do not survive
    /// restarts and are not portable across fleet nodes).
    #[arg(long, env = "WIREHUB_TOKEN_SECRET")]
    pub token_secret: Option<String>,

    /// How long a probed client may take to answer a liveness ping, in
    /// milliseconds.
    #[arg(long, default_value_t = 5000, env = "WIREHUB_PING_TIMEOUT_MS")]
    pub ping_timeout_ms: u64,

    /// How long to wait for the first handshake frame, in milliseconds.
    #[arg(long, default_value_t = 10000, env = "WIREHUB_HANDSHAKE_TIMEOUT_MS")]
    pub handshake_timeout_ms: u64,

    /// Reconnection token lifetime, in seconds.
    #[arg(long, default_value_t = 2 * 24 * 60 * 60, env = "WIREHUB_RECONNECTION_TOKEN_TTL_SECS")]
    pub reconnection_token_ttl_secs: u64,
}

impl HubConfig {
    pub fn ping_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.ping_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.handshake_timeout_ms)
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_owned(),
            port: 9520,
            nats_url: None,
            nats_token: None,
            nats_prefix: "wirehub".to_owned(),
            token_secret: None,
            ping_timeout_ms: 5000,
            handshake_timeout_ms: 10000,
            reconnection_token_ttl_secs: 2 * 24 * 60 * 60,
        }
    }
}
