use std::{
    env, fs,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::Path,
    time::Duration,
};

use crate::{backoff::BackoffPolicy, errors::Error, messaging::throttled::ThrottleConfig, Result};

const DEFAULT_LINK_ACK: &str =
    "You're connected! Notifications from your clinic will arrive in this chat.";

/// Typed configuration for the gateway process.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub store: StoreConfig,

    // Timing
    pub send_timeout: Duration,
    pub credential_refresh_interval: Duration,
    pub reconnect: BackoffPolicy,

    // Telegram
    pub telegram_poll_timeout: Duration,
    pub throttle: ThrottleConfig,

    // Inbound
    pub inbound_queue_capacity: usize,
    pub link_ack_message: String,

    pub log_format: LogFormat,
}

/// Where tenant credentials, patients and chat linkages live.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    pub url: String,
    pub service_key: String,
    pub clinics_table: String,
    pub clinic_token_column: String,
    pub patients_table: String,
    pub patient_clinic_column: String,
    pub links_table: String,
    pub timeout: Duration,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl Config {
    /// Load from the process environment, after merging an optional `.env`.
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).and_then(non_empty);

        let bind_addr = match get("GATEWAY_BIND") {
            Some(raw) => raw
                .trim()
                .parse::<SocketAddr>()
                .map_err(|e| Error::Config(format!("GATEWAY_BIND is invalid: {e}")))?,
            None => {
                let port = parse_or(&get, "PORT", 3000u16)?;
                SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)
            }
        };

        let url = get("SUPABASE_URL").ok_or_else(|| {
            Error::Config("SUPABASE_URL environment variable is required".to_string())
        })?;
        let service_key = get("SUPABASE_SERVICE_ROLE_KEY").ok_or_else(|| {
            Error::Config("SUPABASE_SERVICE_ROLE_KEY environment variable is required".to_string())
        })?;

        let store = StoreConfig {
            url: url.trim_end_matches('/').to_string(),
            service_key,
            clinics_table: get("CLINICS_TABLE").unwrap_or_else(|| "clinics".to_string()),
            clinic_token_column: get("CLINIC_TOKEN_COLUMN")
                .unwrap_or_else(|| "telegram_bot_token".to_string()),
            patients_table: get("PATIENTS_TABLE").unwrap_or_else(|| "patients".to_string()),
            patient_clinic_column: get("PATIENT_CLINIC_COLUMN")
                .unwrap_or_else(|| "clinic_id".to_string()),
            links_table: get("LINKS_TABLE").unwrap_or_else(|| "telegram_links".to_string()),
            timeout: Duration::from_millis(parse_or(&get, "STORE_TIMEOUT_MS", 10_000u64)?),
        };

        let send_timeout = Duration::from_millis(parse_or(&get, "SEND_TIMEOUT_MS", 10_000u64)?);
        let credential_refresh_interval =
            Duration::from_secs(parse_or(&get, "CREDENTIAL_REFRESH_SECS", 60u64)?);
        if send_timeout.is_zero() || credential_refresh_interval.is_zero() {
            return Err(Error::Config(
                "SEND_TIMEOUT_MS and CREDENTIAL_REFRESH_SECS must be positive".to_string(),
            ));
        }

        let reconnect = BackoffPolicy {
            min: Duration::from_millis(parse_or(&get, "RECONNECT_MIN_MS", 1_000u64)?),
            max: Duration::from_millis(parse_or(&get, "RECONNECT_MAX_MS", 60_000u64)?),
            multiplier: parse_or(&get, "RECONNECT_MULTIPLIER", 2.0f64)?,
            jitter: parse_or(&get, "RECONNECT_JITTER", 0.5f64)?,
        };
        reconnect.validate().map_err(Error::Config)?;

        let telegram_poll_timeout =
            Duration::from_secs(parse_or(&get, "TELEGRAM_POLL_TIMEOUT_SECS", 30u64)?);
        let defaults = ThrottleConfig::default();
        let throttle = ThrottleConfig {
            global_min_interval: Duration::from_millis(parse_or(
                &get,
                "TELEGRAM_GLOBAL_MIN_INTERVAL_MS",
                defaults.global_min_interval.as_millis() as u64,
            )?),
            per_chat_min_interval: Duration::from_millis(parse_or(
                &get,
                "TELEGRAM_PER_CHAT_MIN_INTERVAL_MS",
                defaults.per_chat_min_interval.as_millis() as u64,
            )?),
        };

        let inbound_queue_capacity = parse_or(&get, "INBOUND_QUEUE_CAPACITY", 256usize)?.max(1);
        let link_ack_message =
            get("LINK_ACK_MESSAGE").unwrap_or_else(|| DEFAULT_LINK_ACK.to_string());

        let log_format = match get("LOG_FORMAT").map(|s| s.trim().to_lowercase()).as_deref() {
            None | Some("pretty") | Some("text") => LogFormat::Pretty,
            Some("json") => LogFormat::Json,
            Some(other) => {
                return Err(Error::Config(format!(
                    "LOG_FORMAT must be 'pretty' or 'json', got '{other}'"
                )))
            }
        };

        Ok(Self {
            bind_addr,
            store,
            send_timeout,
            credential_refresh_interval,
            reconnect,
            telegram_poll_timeout,
            throttle,
            inbound_queue_capacity,
            link_ack_message,
            log_format,
        })
    }
}

fn parse_or<T>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| Error::Config(format!("{key} is invalid ('{raw}'): {e}"))),
    }
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }
        if env::var_os(key).is_some() {
            continue; // do not override existing env
        }

        let mut val = v.trim().to_string();
        // Strip optional surrounding quotes.
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }

        env::set_var(key, val);
    }
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(pairs: &[(&str, &str)]) -> Result<Config> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|k| map.get(k).cloned())
    }

    const REQUIRED: [(&str, &str); 2] = [
        ("SUPABASE_URL", "https://db.example.com/"),
        ("SUPABASE_SERVICE_ROLE_KEY", "service-key"),
    ];

    #[test]
    fn defaults_apply_when_only_required_keys_set() {
        let cfg = load(&REQUIRED).unwrap();
        assert_eq!(cfg.bind_addr.port(), 3000);
        assert_eq!(cfg.store.url, "https://db.example.com");
        assert_eq!(cfg.store.clinics_table, "clinics");
        assert_eq!(cfg.store.links_table, "telegram_links");
        assert_eq!(cfg.send_timeout, Duration::from_secs(10));
        assert_eq!(cfg.reconnect.min, Duration::from_secs(1));
        assert_eq!(cfg.reconnect.max, Duration::from_secs(60));
        assert_eq!(cfg.log_format, LogFormat::Pretty);
        assert_eq!(cfg.inbound_queue_capacity, 256);
    }

    #[test]
    fn missing_store_url_is_a_config_error() {
        let err = load(&[("SUPABASE_SERVICE_ROLE_KEY", "k")]).unwrap_err();
        assert!(matches!(err, Error::Config(msg) if msg.contains("SUPABASE_URL")));
    }

    #[test]
    fn port_fallback_and_explicit_bind() {
        let mut pairs = REQUIRED.to_vec();
        pairs.push(("PORT", "8080"));
        assert_eq!(load(&pairs).unwrap().bind_addr.port(), 8080);

        pairs.push(("GATEWAY_BIND", "127.0.0.1:9000"));
        let cfg = load(&pairs).unwrap();
        assert_eq!(cfg.bind_addr, "127.0.0.1:9000".parse::<SocketAddr>().unwrap());
    }

    #[test]
    fn rejects_jitter_larger_than_growth() {
        let mut pairs = REQUIRED.to_vec();
        pairs.push(("RECONNECT_MULTIPLIER", "1.5"));
        pairs.push(("RECONNECT_JITTER", "0.9"));
        assert!(matches!(load(&pairs), Err(Error::Config(_))));
    }

    #[test]
    fn rejects_unparsable_numbers_and_log_format() {
        let mut pairs = REQUIRED.to_vec();
        pairs.push(("SEND_TIMEOUT_MS", "soon"));
        assert!(matches!(load(&pairs), Err(Error::Config(msg)) if msg.contains("SEND_TIMEOUT_MS")));

        let mut pairs = REQUIRED.to_vec();
        pairs.push(("LOG_FORMAT", "xml"));
        assert!(load(&pairs).is_err());

        let mut pairs = REQUIRED.to_vec();
        pairs.push(("LOG_FORMAT", "JSON"));
        assert_eq!(load(&pairs).unwrap().log_format, LogFormat::Json);
    }
}
