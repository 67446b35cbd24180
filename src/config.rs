//! Environment + CLI argument resolution (spec.md §6 "Environment").
//!
//! Every other module is handed an already-resolved [`ArchiveConfig`]; only
//! this module reads `std::env`, so the rest of the crate is testable
//! without touching process-global state (spec.md §9 "Global state ...
//! pass explicitly via a context value; no process-wide singletons").

use std::env;

use crate::error::{Error, Result};

/// Which blob-store backend a `WALE_*_PREFIX` selects.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreScheme {
    S3,
    Wabs,
    Gs,
    Swift,
}

/// A parsed `scheme://bucket/path` prefix context (spec.md §3 "Prefix
/// Context"). All keys for one writing cluster live under `bucket` + `path`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StorePrefix {
    pub scheme: StoreScheme,
    pub bucket: String,
    /// Path component under the bucket, without leading/trailing slashes.
    pub path: String,
}

impl StorePrefix {
    fn parse(scheme: StoreScheme, raw: &str) -> Result<Self> {
        let scheme_prefix = match scheme {
            StoreScheme::S3 => "s3://",
            StoreScheme::Wabs => "wabs://",
            StoreScheme::Gs => "gs://",
            StoreScheme::Swift => "swift://",
        };
        let rest = raw
            .strip_prefix(scheme_prefix)
            .ok_or_else(|| Error::Fatal(format!("prefix {raw:?} missing {scheme_prefix} scheme")))?;
        let (bucket, path) = match rest.split_once('/') {
            Some((b, p)) => (b, p.trim_matches('/')),
            None => (rest, ""),
        };
        if bucket.is_empty() {
            return Err(Error::Fatal(format!("prefix {raw:?} has no bucket/container")));
        }
        Ok(Self {
            scheme,
            bucket: bucket.to_string(),
            path: path.to_string(),
        })
    }
}

/// Per-backend credentials, resolved from the scheme-specific environment
/// variables in spec.md §6.
#[derive(Clone, Debug)]
pub enum BackendCredentials {
    S3 {
        access_key_id: String,
        secret_access_key: String,
        region: String,
        security_token: Option<String>,
        endpoint: Option<String>,
    },
    Wabs {
        account_name: String,
        access_key: Option<String>,
        sas_token: Option<String>,
    },
    Gs {
        application_credentials_path: String,
    },
    Swift {
        auth_url: String,
        tenant: String,
        user: String,
        password: String,
        auth_version: Option<String>,
        endpoint_type: Option<String>,
    },
}

fn env_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.is_empty())
}

fn require_env(name: &str) -> Result<String> {
    env_var(name).ok_or_else(|| Error::Fatal(format!("missing required environment variable {name}")))
}

impl BackendCredentials {
    fn from_env(scheme: StoreScheme) -> Result<Self> {
        match scheme {
            StoreScheme::S3 => Ok(Self::S3 {
                access_key_id: require_env("AWS_ACCESS_KEY_ID")?,
                secret_access_key: require_env("AWS_SECRET_ACCESS_KEY")?,
                region: env_var("AWS_REGION").unwrap_or_else(|| "us-east-1".to_string()),
                security_token: env_var("AWS_SECURITY_TOKEN"),
                endpoint: env_var("WALE_S3_ENDPOINT"),
            }),
            StoreScheme::Wabs => {
                let access_key = env_var("WABS_ACCESS_KEY");
                let sas_token = env_var("WABS_SAS_TOKEN");
                if access_key.is_none() && sas_token.is_none() {
                    return Err(Error::Fatal(
                        "one of WABS_ACCESS_KEY or WABS_SAS_TOKEN is required".into(),
                    ));
                }
                Ok(Self::Wabs {
                    account_name: require_env("WABS_ACCOUNT_NAME")?,
                    access_key,
                    sas_token,
                })
            }
            StoreScheme::Gs => Ok(Self::Gs {
                application_credentials_path: require_env("GOOGLE_APPLICATION_CREDENTIALS")?,
            }),
            StoreScheme::Swift => Ok(Self::Swift {
                auth_url: require_env("SWIFT_AUTHURL")?,
                tenant: require_env("SWIFT_TENANT")?,
                user: require_env("SWIFT_USER")?,
                password: require_env("SWIFT_PASSWORD")?,
                auth_version: env_var("SWIFT_AUTH_VERSION"),
                endpoint_type: env_var("SWIFT_ENDPOINT_TYPE"),
            }),
        }
    }
}

/// Where `tracing` output goes; `WALE_LOG_DESTINATION`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LogDestination {
    pub stderr: bool,
    pub syslog: bool,
}

impl LogDestination {
    fn from_env() -> Self {
        match env_var("WALE_LOG_DESTINATION") {
            None => Self { stderr: true, syslog: false },
            Some(v) => {
                let mut d = Self::default();
                for part in v.split(',').map(str::trim) {
                    match part {
                        "stderr" => d.stderr = true,
                        "syslog" => d.syslog = true,
                        "" => {}
                        other => tracing::warn!(value = other, "unknown WALE_LOG_DESTINATION entry"),
                    }
                }
                if !d.stderr && !d.syslog {
                    d.stderr = true;
                }
                d
            }
        }
    }
}

/// `WALE_SYSLOG_FACILITY`: `LOCAL0`..`LOCAL7` or `USER`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyslogFacility {
    Local(u8),
    User,
}

impl SyslogFacility {
    fn from_env() -> Result<Option<Self>> {
        match env_var("WALE_SYSLOG_FACILITY") {
            None => Ok(None),
            Some(v) if v == "USER" => Ok(Some(Self::User)),
            Some(v) => {
                if let Some(n) = v.strip_prefix("LOCAL")
                    && let Ok(n) = n.parse::<u8>()
                    && n <= 7
                {
                    return Ok(Some(Self::Local(n)));
                }
                Err(Error::Fatal(format!("invalid WALE_SYSLOG_FACILITY {v:?}")))
            }
        }
    }
}

/// Fully resolved archiver configuration: everything spec.md §6's
/// "Environment" section describes, merged with CLI flags where the
/// binary's `cli` feature is enabled (see `bin/walarc.rs`).
#[derive(Clone, Debug)]
pub struct ArchiveConfig {
    pub prefix: StorePrefix,
    pub credentials: BackendCredentials,
    pub pool_size: usize,
    pub cluster_read_rate_limit: Option<u64>,
    pub gpg_key_id: Option<String>,
    pub log_destination: LogDestination,
    pub syslog_facility: Option<SyslogFacility>,
}

const PREFIX_VARS: &[(&str, StoreScheme)] = &[
    ("WALE_S3_PREFIX", StoreScheme::S3),
    ("WALE_WABS_PREFIX", StoreScheme::Wabs),
    ("WALE_GS_PREFIX", StoreScheme::Gs),
    ("WALE_SWIFT_PREFIX", StoreScheme::Swift),
];

impl ArchiveConfig {
    /// Resolve from environment variables only (no CLI overrides); the
    /// `cli` feature layers `--pool-size`/`--gpg-key-id` on top via `clap`'s
    /// `env` attribute sharing the same variable names.
    pub fn from_env() -> Result<Self> {
        let mut found = PREFIX_VARS
            .iter()
            .filter_map(|(var, scheme)| env_var(var).map(|v| (*scheme, v)));

        let (scheme, raw_prefix) = match (found.next(), found.next()) {
            (None, _) => {
                return Err(Error::Fatal(
                    "exactly one of WALE_S3_PREFIX, WALE_WABS_PREFIX, WALE_GS_PREFIX, \
                     WALE_SWIFT_PREFIX must be set"
                        .into(),
                ));
            }
            (Some(_), Some(_)) => {
                return Err(Error::Fatal(
                    "more than one WALE_*_PREFIX is set; exactly one writing context is allowed"
                        .into(),
                ));
            }
            (Some(first), None) => first,
        };

        let prefix = StorePrefix::parse(scheme, &raw_prefix)?;
        let credentials = BackendCredentials::from_env(scheme)?;

        let pool_size = env_var("WALE_POOL_SIZE")
            .and_then(|v| v.parse().ok())
            .unwrap_or(4);

        Ok(Self {
            prefix,
            credentials,
            pool_size,
            cluster_read_rate_limit: env_var("WALE_CLUSTER_READ_RATE_LIMIT").and_then(|v| v.parse().ok()),
            gpg_key_id: env_var("WALE_GPG_KEY_ID"),
            log_destination: LogDestination::from_env(),
            syslog_facility: SyslogFacility::from_env()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Environment-variable tests must not run concurrently with each other.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn clear_prefix_vars() {
        for (var, _) in PREFIX_VARS {
            unsafe { env::remove_var(var) };
        }
    }

    #[test]
    fn store_prefix_parses_bucket_and_path() {
        let p = StorePrefix::parse(StoreScheme::S3, "s3://my-bucket/clusters/prod").unwrap();
        assert_eq!(p.bucket, "my-bucket");
        assert_eq!(p.path, "clusters/prod");
    }

    #[test]
    fn store_prefix_without_path() {
        let p = StorePrefix::parse(StoreScheme::S3, "s3://my-bucket").unwrap();
        assert_eq!(p.bucket, "my-bucket");
        assert_eq!(p.path, "");
    }

    #[test]
    fn store_prefix_rejects_wrong_scheme() {
        assert!(StorePrefix::parse(StoreScheme::S3, "gs://bucket/path").is_err());
    }

    #[test]
    fn from_env_requires_exactly_one_prefix() {
        let _g = ENV_LOCK.lock().unwrap();
        clear_prefix_vars();
        assert!(ArchiveConfig::from_env().is_err());

        unsafe {
            env::set_var("WALE_S3_PREFIX", "s3://bucket/path");
            env::set_var("WALE_WABS_PREFIX", "wabs://account/path");
        }
        assert!(ArchiveConfig::from_env().is_err());
        clear_prefix_vars();
    }

    #[test]
    fn from_env_resolves_s3_credentials() {
        let _g = ENV_LOCK.lock().unwrap();
        clear_prefix_vars();
        unsafe {
            env::set_var("WALE_S3_PREFIX", "s3://bucket/path");
            env::set_var("AWS_ACCESS_KEY_ID", "AKIA");
            env::set_var("AWS_SECRET_ACCESS_KEY", "secret");
            env::remove_var("AWS_REGION");
        }
        let cfg = ArchiveConfig::from_env().unwrap();
        assert_eq!(cfg.prefix.scheme, StoreScheme::S3);
        match cfg.credentials {
            BackendCredentials::S3 { access_key_id, region, .. } => {
                assert_eq!(access_key_id, "AKIA");
                assert_eq!(region, "us-east-1");
            }
            _ => panic!("expected S3 credentials"),
        }
        clear_prefix_vars();
        unsafe {
            env::remove_var("AWS_ACCESS_KEY_ID");
            env::remove_var("AWS_SECRET_ACCESS_KEY");
        }
    }

    #[test]
    fn log_destination_defaults_to_stderr() {
        let _g = ENV_LOCK.lock().unwrap();
        unsafe { env::remove_var("WALE_LOG_DESTINATION") };
        let d = LogDestination::from_env();
        assert!(d.stderr);
        assert!(!d.syslog);
    }

    #[test]
    fn log_destination_both() {
        let _g = ENV_LOCK.lock().unwrap();
        unsafe { env::set_var("WALE_LOG_DESTINATION", "stderr,syslog") };
        let d = LogDestination::from_env();
        assert!(d.stderr);
        assert!(d.syslog);
        unsafe { env::remove_var("WALE_LOG_DESTINATION") };
    }

    #[test]
    fn syslog_facility_parses_local_and_user() {
        let _g = ENV_LOCK.lock().unwrap();
        unsafe { env::set_var("WALE_SYSLOG_FACILITY", "LOCAL3") };
        assert_eq!(SyslogFacility::from_env().unwrap(), Some(SyslogFacility::Local(3)));
        unsafe { env::set_var("WALE_SYSLOG_FACILITY", "USER") };
        assert_eq!(SyslogFacility::from_env().unwrap(), Some(SyslogFacility::User));
        unsafe { env::set_var("WALE_SYSLOG_FACILITY", "LOCAL9") };
        assert!(SyslogFacility::from_env().is_err());
        unsafe { env::remove_var("WALE_SYSLOG_FACILITY") };
    }
}
