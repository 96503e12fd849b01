#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use parley_api::{ApiState, BroadcastNotifier};
use parley_auth::WalletKey;
use parley_engine::{
    PeerClient, PeerConfig, PeerSet, RateLimitRule, RateLimiter, RpcProcessor, SweepConfig,
    Sweeper, Validator,
};
use parley_storage::{migrate_with_pool, PostgresStorage};
use url::Url;

/// Pending pushes buffered per peer before gossip starts dropping; the
/// sweeper's pull recovers anything dropped here.
const OUTBOX_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub database_url: String,
    /// Canonical base URL of this node, stamped into every envelope it
    /// originates.
    pub host: String,
    pub private_key_hex: String,
    pub peers: Vec<PeerConfig>,
    pub sweep: SweepConfig,
    pub rate_limits: Vec<(RateLimitRule, i64)>,
}

#[derive(Debug, Clone, Default)]
struct RateLimitEnv {
    timeframe_hours: Option<String>,
    max_new_chats: Option<String>,
    max_messages: Option<String>,
    max_messages_per_recipient: Option<String>,
}

impl RateLimitEnv {
    fn from_env() -> Self {
        Self {
            timeframe_hours: std::env::var("RATE_LIMIT_TIMEFRAME_HOURS").ok(),
            max_new_chats: std::env::var("RATE_LIMIT_MAX_NEW_CHATS").ok(),
            max_messages: std::env::var("RATE_LIMIT_MAX_MESSAGES").ok(),
            max_messages_per_recipient: std::env::var("RATE_LIMIT_MAX_MESSAGES_PER_RECIPIENT")
                .ok(),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = Self::from_values(
            std::env::var("LISTEN_ADDR").ok(),
            std::env::var("DATABASE_URL").ok(),
            std::env::var("PARLEY_HOST").ok(),
            std::env::var("PARLEY_PRIVATE_KEY").ok(),
            std::env::var("PARLEY_PEERS").ok(),
            std::env::var("SWEEP_INTERVAL_SECS").ok(),
            std::env::var("SWEEP_MAX_ATTEMPTS").ok(),
        )?;
        config.rate_limits = parse_rate_limits(RateLimitEnv::from_env())?;
        Ok(config)
    }

    fn from_values(
        listen_addr: Option<String>,
        database_url: Option<String>,
        host: Option<String>,
        private_key: Option<String>,
        peers: Option<String>,
        sweep_interval: Option<String>,
        sweep_max_attempts: Option<String>,
    ) -> anyhow::Result<Self> {
        let listen_addr = SocketAddr::from_str(listen_addr.as_deref().unwrap_or("0.0.0.0:8925"))?;
        let database_url =
            database_url.ok_or_else(|| anyhow::anyhow!("DATABASE_URL must be set"))?;
        let host = parse_host(host)?;
        let private_key_hex =
            private_key.ok_or_else(|| anyhow::anyhow!("PARLEY_PRIVATE_KEY must be set"))?;
        let peers = parse_peers(peers.as_deref().unwrap_or_default(), &host)?;

        let mut sweep = SweepConfig::default();
        if let Some(raw) = sweep_interval {
            sweep.interval = Duration::from_secs(
                raw.parse()
                    .map_err(|_| anyhow::anyhow!("invalid SWEEP_INTERVAL_SECS {raw:?}"))?,
            );
        }
        if let Some(raw) = sweep_max_attempts {
            sweep.max_attempts = raw
                .parse()
                .map_err(|_| anyhow::anyhow!("invalid SWEEP_MAX_ATTEMPTS {raw:?}"))?;
        }

        Ok(Self {
            listen_addr,
            database_url,
            host,
            private_key_hex,
            peers,
            sweep,
            rate_limits: Vec::new(),
        })
    }
}

pub async fn run(config: AppConfig) -> anyhow::Result<()> {
    let storage = PostgresStorage::connect(&config.database_url).await?;
    migrate_with_pool(storage.pool()).await?;

    let key = Arc::new(WalletKey::from_hex(&config.private_key_hex)?);
    tracing::info!(
        host = %config.host,
        wallet = %key.wallet(),
        peers = config.peers.len(),
        "node identity"
    );

    let limiter = RateLimiter::new();
    for (rule, value) in &config.rate_limits {
        limiter.set_override(*rule, *value);
    }
    let validator = Validator::new(storage.clone(), limiter);
    let processor = RpcProcessor::new(storage.clone(), validator);

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()?;
    let clients = config
        .peers
        .iter()
        .cloned()
        .map(|peer| PeerClient::spawn(peer, key.clone(), http.clone(), OUTBOX_CAPACITY))
        .collect();
    let peers = PeerSet::new(clients);

    let sweeper = Sweeper::new(
        storage.clone(),
        processor.clone(),
        key.clone(),
        config.peers.clone(),
        http,
        config.sweep.clone(),
    );
    tokio::spawn(sweeper.run());

    let state = ApiState::new(
        config.host.clone(),
        key,
        storage,
        processor,
        peers,
        BroadcastNotifier::new(1024),
    );
    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    tracing::info!(addr = %config.listen_addr, "server listening");
    axum::serve(listener, parley_api::router(state)).await?;
    Ok(())
}

fn parse_host(value: Option<String>) -> anyhow::Result<String> {
    let raw = value.ok_or_else(|| anyhow::anyhow!("PARLEY_HOST must be set"))?;
    validate_http_url(&raw, "host")?;
    Ok(raw.trim_end_matches('/').to_owned())
}

/// Parses the whitespace-separated `host=wallet` peer list. The node's own
/// host is skipped so a shared fleet-wide peer list works unedited.
fn parse_peers(raw: &str, own_host: &str) -> anyhow::Result<Vec<PeerConfig>> {
    let mut peers = Vec::new();
    for entry in raw.split_whitespace() {
        let (host, wallet) = entry
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("invalid peer entry {entry:?}: expected host=wallet"))?;
        validate_http_url(host, "peer")?;
        if !wallet.starts_with("0x") || wallet.len() != 42 {
            return Err(anyhow::anyhow!(
                "invalid peer entry {entry:?}: wallet must be a 0x-prefixed address"
            ));
        }
        let host = host.trim_end_matches('/').to_owned();
        if host == own_host {
            continue;
        }
        peers.push(PeerConfig {
            host,
            wallet: wallet.to_lowercase(),
        });
    }
    Ok(peers)
}

fn parse_rate_limits(env: RateLimitEnv) -> anyhow::Result<Vec<(RateLimitRule, i64)>> {
    let mut limits = Vec::new();
    for (rule, raw, name) in [
        (
            RateLimitRule::TimeframeHours,
            env.timeframe_hours,
            "RATE_LIMIT_TIMEFRAME_HOURS",
        ),
        (
            RateLimitRule::MaxNewChats,
            env.max_new_chats,
            "RATE_LIMIT_MAX_NEW_CHATS",
        ),
        (
            RateLimitRule::MaxMessages,
            env.max_messages,
            "RATE_LIMIT_MAX_MESSAGES",
        ),
        (
            RateLimitRule::MaxMessagesPerRecipient,
            env.max_messages_per_recipient,
            "RATE_LIMIT_MAX_MESSAGES_PER_RECIPIENT",
        ),
    ] {
        if let Some(raw) = raw {
            let value: i64 = raw
                .parse()
                .map_err(|_| anyhow::anyhow!("invalid {name} {raw:?}"))?;
            if value <= 0 {
                return Err(anyhow::anyhow!("invalid {name} {raw:?}: must be positive"));
            }
            limits.push((rule, value));
        }
    }
    Ok(limits)
}

fn validate_http_url(raw: &str, label: &str) -> anyhow::Result<()> {
    let parsed =
        Url::parse(raw).map_err(|error| anyhow::anyhow!("invalid {label} URL {raw:?}: {error}"))?;
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return Err(anyhow::anyhow!(
            "invalid {label} URL {raw:?}: must use http or https"
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const WALLET_B: &str = "0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";
    const WALLET_C: &str = "0xcccccccccccccccccccccccccccccccccccccccc";

    fn minimal(peers: Option<String>) -> anyhow::Result<AppConfig> {
        AppConfig::from_values(
            None,
            Some("postgres://localhost/parley".to_owned()),
            Some("https://node-a.example.com".to_owned()),
            Some("ab".repeat(32)),
            peers,
            None,
            None,
        )
    }

    #[test]
    fn from_values_uses_defaults() {
        let config = minimal(None).expect("parse config");
        assert_eq!(config.listen_addr.to_string(), "0.0.0.0:8925");
        assert_eq!(config.sweep.interval, Duration::from_secs(10));
        assert_eq!(config.sweep.max_attempts, 30);
        assert!(config.peers.is_empty());
        assert!(config.rate_limits.is_empty());
    }

    #[test]
    fn from_values_requires_database_url_host_and_key() {
        let error = AppConfig::from_values(
            None,
            None,
            Some("https://node-a.example.com".to_owned()),
            Some("ab".repeat(32)),
            None,
            None,
            None,
        )
        .expect_err("missing DATABASE_URL should fail");
        assert!(error.to_string().contains("DATABASE_URL"));

        let error = AppConfig::from_values(
            None,
            Some("postgres://localhost/parley".to_owned()),
            None,
            Some("ab".repeat(32)),
            None,
            None,
            None,
        )
        .expect_err("missing host should fail");
        assert!(error.to_string().contains("PARLEY_HOST"));

        let error = AppConfig::from_values(
            None,
            Some("postgres://localhost/parley".to_owned()),
            Some("https://node-a.example.com".to_owned()),
            None,
            None,
            None,
            None,
        )
        .expect_err("missing key should fail");
        assert!(error.to_string().contains("PARLEY_PRIVATE_KEY"));
    }

    #[test]
    fn parse_peers_accepts_host_wallet_pairs() {
        let config = minimal(Some(format!(
            "https://node-b.example.com={WALLET_B} https://node-c.example.com/={WALLET_C}"
        )))
        .expect("parse config");
        assert_eq!(config.peers.len(), 2);
        assert_eq!(config.peers[0].host, "https://node-b.example.com");
        assert_eq!(config.peers[0].wallet, WALLET_B);
        // Trailing slashes are normalized away.
        assert_eq!(config.peers[1].host, "https://node-c.example.com");
    }

    #[test]
    fn parse_peers_skips_own_host() {
        let config = minimal(Some(format!(
            "https://node-a.example.com={WALLET_B} https://node-b.example.com={WALLET_C}"
        )))
        .expect("parse config");
        assert_eq!(config.peers.len(), 1);
        assert_eq!(config.peers[0].host, "https://node-b.example.com");
    }

    #[test]
    fn parse_peers_rejects_malformed_entries() {
        let error = minimal(Some("https://node-b.example.com".to_owned()))
            .expect_err("missing wallet should fail");
        assert!(error.to_string().contains("host=wallet"));

        let error = minimal(Some("https://node-b.example.com=nothex".to_owned()))
            .expect_err("bad wallet should fail");
        assert!(error.to_string().contains("0x-prefixed"));

        let error =
            minimal(Some(format!("ftp://node-b.example.com={WALLET_B}"))).expect_err("bad scheme");
        assert!(error.to_string().contains("http or https"));
    }

    #[test]
    fn sweep_settings_are_parsed() {
        let config = AppConfig::from_values(
            None,
            Some("postgres://localhost/parley".to_owned()),
            Some("https://node-a.example.com".to_owned()),
            Some("ab".repeat(32)),
            None,
            Some("3".to_owned()),
            Some("5".to_owned()),
        )
        .expect("parse config");
        assert_eq!(config.sweep.interval, Duration::from_secs(3));
        assert_eq!(config.sweep.max_attempts, 5);
    }

    #[test]
    fn rate_limit_overrides_are_parsed() {
        let limits = parse_rate_limits(RateLimitEnv {
            max_messages: Some("50".to_owned()),
            ..RateLimitEnv::default()
        })
        .expect("parse limits");
        assert_eq!(limits, vec![(RateLimitRule::MaxMessages, 50)]);

        let error = parse_rate_limits(RateLimitEnv {
            max_new_chats: Some("-1".to_owned()),
            ..RateLimitEnv::default()
        })
        .expect_err("negative limit should fail");
        assert!(error.to_string().contains("positive"));
    }
}
