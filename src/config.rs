use crate::server::services::fetch_services::{DEFAULT_TIMEOUT_MS, GUIDE_TIMEOUT_MS};

#[derive(clap::ValueEnum, Clone, Debug, Copy)]
pub enum CargoEnv {
    Development,
    Production,
}

/// which shape the channel directory is published in, one per deployment
#[derive(clap::ValueEnum, Clone, Debug, Copy, PartialEq, Eq)]
pub enum ChannelSourceFormat {
    Json,
    M3u,
}

#[derive(clap::Parser, Clone, Debug)]
pub struct AppConfig {
    // production or development
    #[clap(long, env, value_enum)]
    pub cargo_env: CargoEnv,

    // port that the app will bind to
    #[clap(long, env, default_value = "5000")]
    pub port: u16,

    // public origin of this service, rewritten manifests point back at
    // <public_base_url>/stream-proxy so it has to be reachable by the player
    #[clap(long, env, default_value = "http://localhost:5000")]
    pub public_base_url: String,

    // this should be either * for allowing everything, or a comma seperated list of domains like
    // example.com,something.com. only used by the json api, the stream proxy is always *
    #[clap(long, env, default_value = "*")]
    pub cors_origin: String,

    // where the channel directory lives
    #[clap(long, env)]
    pub channel_source_url: String,

    #[clap(long, env, value_enum, default_value = "json")]
    pub channel_source_format: ChannelSourceFormat,

    // xmltv guide, plain or gzipped
    #[clap(long, env)]
    pub guide_url: String,

    // ordered relay prefixes tried before going direct, comma seperated like
    // https://corsproxy.io/?url=,https://api.allorigins.win/raw?url=
    #[clap(long, env, value_delimiter = ',')]
    pub fallback_proxies: Vec<String>,

    #[clap(long, env, default_value = "15000")]
    pub fetch_timeout_ms: u64,

    // the guide is a lot bigger than the directory so it gets more time
    #[clap(long, env, default_value = "20000")]
    pub guide_timeout_ms: u64,

    // how long the stream proxy waits for upstream response headers
    #[clap(long, env, default_value = "15000")]
    pub gateway_timeout_ms: u64,

    // how long a channel/guide snapshot is served before it gets rebuilt
    #[clap(long, env, default_value = "900")]
    pub snapshot_ttl_secs: u64,

    // optional sentry integration
    #[clap(long, env)]
    pub sentry_dsn: Option<String>,
}

impl AppConfig {
    /// full url of the stream proxy endpoint as seen by players
    pub fn gateway_url(&self) -> String {
        format!("{}/stream-proxy", self.public_base_url.trim_end_matches('/'))
    }

    pub fn proxy_prefixes(&self) -> Vec<String> {
        self.fallback_proxies
            .iter()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect()
    }
}

impl Default for AppConfig {
    // defaults aren't really needed here but it's here as a bad fallback
    fn default() -> Self {
        Self {
            cargo_env: CargoEnv::Development,
            port: 5000,
            public_base_url: "http://localhost:5000".to_string(),
            cors_origin: "*".to_string(),
            channel_source_url: "https://i.mjh.nz/nz/tv.json".to_string(),
            channel_source_format: ChannelSourceFormat::Json,
            guide_url: "https://i.mjh.nz/nz/epg.xml".to_string(),
            fallback_proxies: Vec::new(),
            fetch_timeout_ms: DEFAULT_TIMEOUT_MS,
            guide_timeout_ms: GUIDE_TIMEOUT_MS,
            gateway_timeout_ms: DEFAULT_TIMEOUT_MS,
            snapshot_ttl_secs: 900,
            sentry_dsn: None,
        }
    }
}
