use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use headerd_consensus::{chain_params, Network};

use crate::logging;

const DEFAULT_DATA_DIR: &str = "data";
const CONF_FILE_NAME: &str = "headerd.conf";
const ENV_PREFIX: &str = "HEADERD_";
const DEFAULT_HTTP_PORT: u16 = 8080;
const DEFAULT_WEBHOOK_MAX_TRIES: u32 = 10;
const DEFAULT_MAX_PEERS: usize = 8;

/// Keys accepted in the config file, as `HEADERD_<KEY>` variables and as
/// `--key value` flags.
const KEYS: &[&str] = &[
    "data_dir",
    "network",
    "db_dsn",
    "http_port",
    "auth_token",
    "use_auth",
    "webhook_max_tries",
    "log_level",
    "log_format",
    "log_timestamps",
    "p2p_seed_peers",
    "p2p_user_agent",
    "network_magic",
    "min_protocol_version",
    "max_peers",
];

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DbDsn {
    Fjall(PathBuf),
    Memory,
}

impl DbDsn {
    pub fn parse(raw: &str) -> Result<Self, String> {
        let raw = raw.trim();
        if raw == "memory:" || raw == "memory" {
            return Ok(DbDsn::Memory);
        }
        match raw.strip_prefix("fjall:") {
            Some(path) if !path.is_empty() => Ok(DbDsn::Fjall(PathBuf::from(path))),
            _ => Err(format!(
                "invalid db_dsn '{raw}' (expected fjall:<path> or memory:)"
            )),
        }
    }
}

impl std::fmt::Display for DbDsn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DbDsn::Fjall(path) => write!(f, "fjall:{}", path.display()),
            DbDsn::Memory => f.write_str("memory:"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub data_dir: PathBuf,
    pub conf_path: PathBuf,
    pub network: Network,
    pub db: DbDsn,
    pub http_port: u16,
    pub auth_token: Option<String>,
    pub use_auth: bool,
    pub webhook_max_tries: u32,
    pub log_level: logging::Level,
    pub log_format: logging::Format,
    pub log_timestamps: bool,
    pub seed_peers: Vec<String>,
    pub user_agent: String,
    pub network_magic: [u8; 4],
    pub min_protocol_version: i32,
    pub max_peers: usize,
}

impl Config {
    pub fn banlist_path(&self) -> PathBuf {
        self.data_dir.join("banlist.json")
    }
}

#[derive(Debug)]
pub enum CliAction {
    Run(Box<Config>),
    PrintHelp,
    PrintVersion,
}

pub fn default_user_agent() -> String {
    concat!("/headerd:", env!("CARGO_PKG_VERSION"), "/").to_string()
}

pub fn parse_args() -> Result<CliAction, String> {
    parse_args_from(std::env::args().skip(1), |key| std::env::var(key).ok())
}

/// Resolves the configuration from, in increasing precedence: defaults, the
/// config file, `HEADERD_*` environment variables, command-line flags.
pub fn parse_args_from<I, E>(raw_args: I, env: E) -> Result<CliAction, String>
where
    I: IntoIterator<Item = String>,
    E: Fn(&str) -> Option<String>,
{
    let mut flags: Vec<(String, String)> = Vec::new();
    let mut conf_flag: Option<PathBuf> = None;
    let mut args = raw_args.into_iter();
    let mut first = true;
    while let Some(arg) = args.next() {
        if first {
            first = false;
            match arg.as_str() {
                "help" => return Ok(CliAction::PrintHelp),
                "version" => return Ok(CliAction::PrintVersion),
                _ => {}
            }
        }
        match arg.as_str() {
            "--help" | "-h" => return Ok(CliAction::PrintHelp),
            "--version" | "-V" => return Ok(CliAction::PrintVersion),
            _ => {}
        }
        let Some(name) = arg.strip_prefix("--") else {
            return Err(format!("unexpected argument '{arg}'\n\n{}", usage()));
        };
        let (name, inline) = match name.split_once('=') {
            Some((name, value)) => (name, Some(value.to_string())),
            None => (name, None),
        };
        let key = name.replace('-', "_");
        let value = match inline {
            Some(value) => value,
            None => args
                .next()
                .ok_or_else(|| format!("missing value for --{name}\n\n{}", usage()))?,
        };
        if key == "conf" {
            conf_flag = Some(PathBuf::from(value));
            continue;
        }
        if !KEYS.contains(&key.as_str()) {
            return Err(format!("unknown option --{name}\n\n{}", usage()));
        }
        flags.push((key, value));
    }

    let env_values: Vec<(String, String)> = KEYS
        .iter()
        .filter_map(|key| {
            env(&format!("{ENV_PREFIX}{}", key.to_ascii_uppercase()))
                .map(|value| (key.to_string(), value))
        })
        .collect();

    // The data dir decides where the config file lives, so it is resolved
    // from the higher layers first.
    let data_dir = flags
        .iter()
        .rev()
        .chain(env_values.iter().rev())
        .find(|(key, _)| key == "data_dir")
        .map(|(_, value)| PathBuf::from(value))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));
    let conf_path = conf_flag
        .or_else(|| env("HEADERD_CONF").map(PathBuf::from))
        .unwrap_or_else(|| data_dir.join(CONF_FILE_NAME));

    let mut layers: Vec<(String, String)> = Vec::new();
    if let Some(conf) = load_conf(&conf_path)? {
        for (key, value) in conf {
            if !KEYS.contains(&key.as_str()) {
                return Err(format!(
                    "unknown key '{key}' in {}",
                    conf_path.display()
                ));
            }
            layers.push((key, value));
        }
    }
    layers.extend(env_values);
    layers.extend(flags);

    let mut values: HashMap<String, String> = HashMap::new();
    for (key, value) in layers {
        values.insert(key, value);
    }
    build_config(values, conf_path).map(|config| CliAction::Run(Box::new(config)))
}

fn build_config(values: HashMap<String, String>, conf_path: PathBuf) -> Result<Config, String> {
    let get = |key: &str| values.get(key).map(|value| value.trim().to_string());

    let data_dir = get("data_dir")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));
    let network = match get("network") {
        Some(raw) => raw.parse::<Network>()?,
        None => Network::Mainnet,
    };
    let params = chain_params(network);

    let db = match get("db_dsn") {
        Some(raw) => DbDsn::parse(&raw)?,
        None => DbDsn::Fjall(data_dir.join("db")),
    };
    let http_port = parse_number(get("http_port"), "http_port", DEFAULT_HTTP_PORT)?;
    let auth_token = get("auth_token").filter(|token| !token.is_empty());
    let use_auth = match get("use_auth") {
        Some(raw) => parse_bool(&raw).ok_or_else(|| format!("invalid use_auth '{raw}'"))?,
        None => true,
    };
    if use_auth && auth_token.is_none() {
        return Err("auth_token is required when use_auth is enabled".to_string());
    }
    let webhook_max_tries = parse_number(
        get("webhook_max_tries"),
        "webhook_max_tries",
        DEFAULT_WEBHOOK_MAX_TRIES,
    )?;
    if webhook_max_tries == 0 {
        return Err("webhook_max_tries must be at least 1".to_string());
    }

    let log_level = match get("log_level") {
        Some(raw) => {
            logging::Level::parse(&raw).ok_or_else(|| format!("invalid log_level '{raw}'"))?
        }
        None => logging::Level::Info,
    };
    let log_format = match get("log_format") {
        Some(raw) => {
            logging::Format::parse(&raw).ok_or_else(|| format!("invalid log_format '{raw}'"))?
        }
        None => logging::Format::Text,
    };
    let log_timestamps = match get("log_timestamps") {
        Some(raw) => {
            parse_bool(&raw).ok_or_else(|| format!("invalid log_timestamps '{raw}'"))?
        }
        None => true,
    };

    let seed_peers = match get("p2p_seed_peers") {
        Some(raw) => raw
            .split(',')
            .map(str::trim)
            .filter(|peer| !peer.is_empty())
            .map(str::to_string)
            .collect(),
        None => params.seed_peers.iter().map(|peer| peer.to_string()).collect(),
    };
    let user_agent = get("p2p_user_agent")
        .filter(|agent| !agent.is_empty())
        .unwrap_or_else(default_user_agent);
    let network_magic = match get("network_magic") {
        Some(raw) => parse_magic(&raw)?,
        None => params.message_start,
    };
    let min_protocol_version = parse_number(
        get("min_protocol_version"),
        "min_protocol_version",
        params.min_protocol_version,
    )?;
    let max_peers = parse_number(get("max_peers"), "max_peers", DEFAULT_MAX_PEERS)?;
    if max_peers == 0 {
        return Err("max_peers must be at least 1".to_string());
    }

    Ok(Config {
        data_dir,
        conf_path,
        network,
        db,
        http_port,
        auth_token,
        use_auth,
        webhook_max_tries,
        log_level,
        log_format,
        log_timestamps,
        seed_peers,
        user_agent,
        network_magic,
        min_protocol_version,
        max_peers,
    })
}

fn parse_number<T: std::str::FromStr>(
    raw: Option<String>,
    key: &str,
    default: T,
) -> Result<T, String> {
    match raw {
        Some(raw) => raw
            .parse::<T>()
            .map_err(|_| format!("invalid {key} '{raw}'")),
        None => Ok(default),
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_magic(raw: &str) -> Result<[u8; 4], String> {
    let raw = raw.trim().trim_start_matches("0x");
    if raw.len() != 8 || !raw.bytes().all(|byte| byte.is_ascii_hexdigit()) {
        return Err(format!("invalid network_magic '{raw}' (expected 8 hex chars)"));
    }
    let mut out = [0u8; 4];
    for (index, byte) in out.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&raw[index * 2..index * 2 + 2], 16)
            .map_err(|_| format!("invalid network_magic '{raw}'"))?;
    }
    Ok(out)
}

/// `key=value` lines; `#` and `;` start comments. Later lines win.
fn load_conf(path: &Path) -> Result<Option<Vec<(String, String)>>, String> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(format!("failed to read {}: {err}", path.display())),
    };

    let mut out = Vec::new();
    for raw_line in contents.lines() {
        let mut line = raw_line.trim();
        if let Some(idx) = line.find(['#', ';']) {
            line = &line[..idx];
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            return Err(format!("malformed line '{line}' in {}", path.display()));
        };
        let key = key.trim().to_ascii_lowercase().replace('-', "_");
        if key.is_empty() {
            continue;
        }
        out.push((key, value.trim().to_string()));
    }
    Ok(Some(out))
}

pub fn usage() -> String {
    [
        "Usage:",
        "  headerd [options]",
        "  headerd <command>",
        "",
        "Commands:",
        "  help     Print this help and exit",
        "  version  Print version and exit",
        "",
        "Options (also HEADERD_<KEY> env vars or key=value lines in headerd.conf):",
        "  --conf <path>                 Config file (default: <data-dir>/headerd.conf)",
        "  --data-dir <path>             Base data directory (default: ./data)",
        "  --network <name>              mainnet|testnet|regtest (default: mainnet)",
        "  --db-dsn <dsn>                fjall:<path> or memory: (default: fjall:<data-dir>/db)",
        "  --http-port <port>            HTTP listen port (default: 8080)",
        "  --auth-token <token>          Admin bearer token",
        "  --use-auth <bool>             Require bearer tokens on chain routes (default: true)",
        "  --webhook-max-tries <n>       Failed deliveries before a webhook is disabled (default: 10)",
        "  --log-level <level>           error|warn|info|debug|trace (default: info)",
        "  --log-format <format>         text|json (default: text)",
        "  --log-timestamps <bool>       Timestamps in text logs (default: true)",
        "  --p2p-seed-peers <list>       Comma-separated host:port list (default: network seeds)",
        "  --p2p-user-agent <agent>      User agent sent in version messages",
        "  --network-magic <hex>         Override the 4-byte message start",
        "  --min-protocol-version <n>    Lowest peer protocol version accepted (default: 70013)",
        "  --max-peers <n>               Outbound peer sessions (default: 8)",
    ]
    .join("\n")
}
