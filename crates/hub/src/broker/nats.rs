// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! NATS broker: core pub/sub for channels, JetStream KV for the registry.
//!
//! Channel names use the hub grammar (`event:<kind>:<name>`); NATS subjects
//! are dot-separated tokens with `*`/`>` reserved. The mapping splits a
//! channel on `:` into subject tokens, percent-escaping characters NATS
//! reserves, under a configurable subject prefix:
//!
//! - channel `event:b:w/c:msg` → subject `{prefix}.event.b.w/c.msg`
//! - pattern `event:*` → subject `{prefix}.event.>`

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::mpsc;

use super::{channel_matches, Broker, BrokerMessage};

/// Characters that cannot appear literally in a NATS subject token.
fn is_reserved(c: char) -> bool {
    c == '.' || c == '*' || c == '>' || c == '%' || c.is_whitespace() || c.is_control()
}

/// Percent-escape one channel segment into a subject token.
fn escape_token(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for c in segment.chars() {
        if is_reserved(c) {
            let mut buf = [0u8; 4];
            for b in c.encode_utf8(&mut buf).as_bytes() {
                out.push_str(&format!("%{b:02X}"));
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Reverse of [`escape_token`]. Malformed escapes are kept verbatim.
fn unescape_token(token: &str) -> String {
    let mut out = Vec::with_capacity(token.len());
    let bytes = token.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            if let Some(hex) = token.get(i + 1..i + 3) {
                if let Ok(b) = u8::from_str_radix(hex, 16) {
                    out.push(b);
                    i += 3;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Map a channel name to a NATS subject under `prefix`.
fn channel_to_subject(prefix: &str, channel: &str) -> String {
    let tokens: Vec<String> = channel.split(':').map(escape_token).collect();
    format!("{}.{}", prefix, tokens.join("."))
}

/// Map a NATS subject back to a channel name, if it carries `prefix`.
fn subject_to_channel(prefix: &str, subject: &str) -> Option<String> {
    let rest = subject.strip_prefix(prefix)?.strip_prefix('.')?;
    Some(rest.split('.').map(unescape_token).collect::<Vec<_>>().join(":"))
}

/// NATS-backed [`Broker`].
pub struct NatsBroker {
    client: async_nats::Client,
    kv: async_nats::jetstream::kv::Store,
    prefix: String,
}

impl NatsBroker {
    /// Connect to the NATS server and open (or create) the registry bucket.
    pub async fn connect(
        url: &str,
        token: Option<String>,
        prefix: &str,
    ) -> anyhow::Result<Self> {
        let mut opts = async_nats::ConnectOptions::new();
        if let Some(token) = token {
            opts = opts.token(token);
        }
        opts = opts.retry_on_initial_connect();

        tracing::info!(url = %url, prefix = %prefix, "connecting NATS broker");
        let client = opts.connect(url).await?;
        tracing::info!("NATS broker connected");

        let jetstream = async_nats::jetstream::new(client.clone());
        let bucket = format!("{prefix}-registry");
        let kv = match jetstream.get_key_value(bucket.as_str()).await {
            Ok(kv) => kv,
            Err(_) => {
                jetstream
                    .create_key_value(async_nats::jetstream::kv::Config {
                        bucket: bucket.clone(),
                        ..Default::default()
                    })
                    .await?
            }
        };

        Ok(Self { client, kv, prefix: prefix.to_owned() })
    }

    fn subject(&self, channel: &str) -> String {
        channel_to_subject(&self.prefix, channel)
    }

    /// KV keys allow a narrower charset than subjects; hex-escape with `=`.
    fn kv_key(&self, key: &str) -> String {
        let mut out = String::with_capacity(key.len());
        for c in key.chars() {
            if c.is_ascii_alphanumeric() || matches!(c, '/' | '-' | '_' | '.') {
                out.push(c);
            } else {
                let mut buf = [0u8; 4];
                for b in c.encode_utf8(&mut buf).as_bytes() {
                    out.push_str(&format!("={b:02X}"));
                }
            }
        }
        out
    }

    fn key_from_kv(&self, key: &str) -> String {
        let mut out = Vec::with_capacity(key.len());
        let bytes = key.as_bytes();
        let mut i = 0;
        while i < bytes.len() {
            if bytes[i] == b'=' {
                if let Some(hex) = key.get(i + 1..i + 3) {
                    if let Ok(b) = u8::from_str_radix(hex, 16) {
                        out.push(b);
                        i += 3;
                        continue;
                    }
                }
            }
            out.push(bytes[i]);
            i += 1;
        }
        String::from_utf8_lossy(&out).into_owned()
    }
}

#[async_trait]
impl Broker for NatsBroker {
    async fn publish(&self, channel: &str, payload: Bytes) -> anyhow::Result<()> {
        self.client.publish(self.subject(channel), payload).await?;
        Ok(())
    }

    async fn subscribe(
        &self,
        pattern: &str,
    ) -> anyhow::Result<mpsc::UnboundedReceiver<BrokerMessage>> {
        // `x:*` becomes a `>` wildcard; any other trailing `*` falls back to
        // subscribing the whole prefix and filtering here.
        let (subject, filter) = match pattern.strip_suffix(":*") {
            Some(head) => (format!("{}.>", self.subject(head)), None),
            None => match pattern.strip_suffix('*') {
                Some(_) => (format!("{}.>", self.prefix), Some(pattern.to_owned())),
                None => (self.subject(pattern), None),
            },
        };

        let mut sub = self.client.subscribe(subject).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let prefix = self.prefix.clone();

        tokio::spawn(async move {
            while let Some(msg) = sub.next().await {
                let Some(channel) = subject_to_channel(&prefix, msg.subject.as_str()) else {
                    continue;
                };
                if let Some(ref pat) = filter {
                    if !channel_matches(pat, &channel) {
                        continue;
                    }
                }
                if tx.send(BrokerMessage { channel, payload: msg.payload }).is_err() {
                    break;
                }
            }
        });

        Ok(rx)
    }

    async fn kv_put(&self, key: &str, value: Bytes) -> anyhow::Result<()> {
        self.kv.put(self.kv_key(key), value).await?;
        Ok(())
    }

    async fn kv_get(&self, key: &str) -> anyhow::Result<Option<Bytes>> {
        Ok(self.kv.get(self.kv_key(key)).await?)
    }

    async fn kv_delete(&self, key: &str) -> anyhow::Result<()> {
        self.kv.purge(self.kv_key(key)).await?;
        Ok(())
    }

    async fn kv_keys(&self, prefix: &str) -> anyhow::Result<Vec<String>> {
        let mut keys = self.kv.keys().await?;
        let mut out = Vec::new();
        while let Some(key) = keys.next().await {
            let key = self.key_from_kv(&key?);
            if key.starts_with(prefix) {
                out.push(key);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
#[path = "nats_tests.rs"]
mod tests;
