//! Configuration for the provisioner
//!
//! The best way to configure the provisioner is by using
//! [`Config::default_config`] or by turning on the "cli" feature and using
//! [`Config::new_from_flags`].

use std::path::PathBuf;
use std::time::Duration;

#[cfg(feature = "cli")]
use structopt::StructOpt;
use thiserror::Error;

use crate::leader::{ElectionConfigError, LeaderElectionConfig};

const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(15);
const DEFAULT_RENEW_DEADLINE: Duration = Duration::from_secs(10);
const DEFAULT_RETRY_PERIOD: Duration = Duration::from_secs(2);
const DEFAULT_WORKER_COUNT: usize = 4;
const DEFAULT_LOCK_NAMESPACE: &str = "kube-system";
const DEFAULT_MAX_RETRIES: u32 = 5;
const DEFAULT_EVENT_BUFFER: usize = 256;

/// A configuration value was missing or out of range.
#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    /// Volume directories must be created under an absolute path.
    #[error("root directory {0:?} must be an absolute path")]
    RootDirNotAbsolute(PathBuf),
    /// Storage classes are matched against the provisioner name.
    #[error("provisioner name must not be empty")]
    EmptyProvisionerName,
    /// At least one worker is needed to make progress.
    #[error("worker count must be greater than zero")]
    ZeroWorkers,
    /// Attempts at creating a volume must be at least one.
    #[error("max retries must be greater than zero")]
    ZeroRetries,
    /// The election timings do not guarantee a single leader.
    #[error(transparent)]
    Election(#[from] ElectionConfigError),
    /// A duration flag could not be parsed.
    #[error("invalid duration {0:?}, expected a number with an optional ms, s, m or h suffix")]
    InvalidDuration(String),
}

/// The configuration needed for the provisioner to run properly.
///
/// This can be configured manually in your code or if you are exposing a CLI,
/// use [`Config::new_from_flags`] (this requires the "cli" feature to be
/// enabled).
#[derive(Clone, Debug)]
pub struct Config {
    /// The directory under which volume directories are created
    pub root_dir: PathBuf,
    /// Matched against the provisioner of each storage class
    pub provisioner_name: String,
    /// How long a leader lease is honored after it last changed
    pub lease_duration: Duration,
    /// How long a leader keeps trying to renew before stepping down
    pub renew_deadline: Duration,
    /// How often the leader record is read or renewed. Also bounds every API
    /// request
    pub retry_period: Duration,
    /// The number of workers per work queue
    pub worker_count: usize,
    /// The namespace of the object holding the leader record
    pub lock_namespace: String,
    /// The name of the object holding the leader record
    pub lock_name: String,
    /// Attempts at saving a volume object before the claim is requeued
    pub max_retries: u32,
    /// Whether the leader clears the record when shutting down
    pub release_on_cancel: bool,
    /// How many events may wait for delivery before new ones are dropped
    pub event_buffer: usize,
}

impl Config {
    /// Returns a Config object set with all of the defaults.
    pub fn default_config(root_dir: impl Into<PathBuf>, provisioner_name: &str) -> Self {
        Config {
            root_dir: root_dir.into(),
            provisioner_name: provisioner_name.to_string(),
            lease_duration: DEFAULT_LEASE_DURATION,
            renew_deadline: DEFAULT_RENEW_DEADLINE,
            retry_period: DEFAULT_RETRY_PERIOD,
            worker_count: DEFAULT_WORKER_COUNT,
            lock_namespace: DEFAULT_LOCK_NAMESPACE.to_string(),
            lock_name: default_lock_name(provisioner_name),
            max_retries: DEFAULT_MAX_RETRIES,
            release_on_cancel: true,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }

    /// Parses all command line flags and sets the proper defaults. The version
    /// of your application should be passed to set the proper version for the
    /// CLI. The result has been validated.
    #[cfg(any(feature = "cli", feature = "docs"))]
    #[cfg_attr(feature = "docs", doc(cfg(feature = "cli")))]
    pub fn new_from_flags(version: &str) -> Result<Self, ConfigError> {
        let app = Opts::clap().version(version);
        let opts = Opts::from_clap(&app.get_matches());
        Config::from_opts(opts)
    }

    #[cfg(any(feature = "cli", feature = "docs"))]
    fn from_opts(opts: Opts) -> Result<Self, ConfigError> {
        let lock_name = opts
            .lock_name
            .unwrap_or_else(|| default_lock_name(&opts.provisioner_name));
        let config = Config {
            root_dir: opts.root_dir,
            provisioner_name: opts.provisioner_name,
            lease_duration: opts.lease_duration,
            renew_deadline: opts.renew_deadline,
            retry_period: opts.retry_period,
            worker_count: opts.worker_count,
            lock_namespace: opts.lock_namespace,
            lock_name,
            max_retries: opts.max_retries,
            release_on_cancel: opts.release_on_cancel,
            event_buffer: opts.event_buffer,
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks the values that cannot be caught by parsing alone.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.root_dir.is_absolute() {
            return Err(ConfigError::RootDirNotAbsolute(self.root_dir.clone()));
        }
        if self.provisioner_name.trim().is_empty() {
            return Err(ConfigError::EmptyProvisionerName);
        }
        if self.worker_count == 0 {
            return Err(ConfigError::ZeroWorkers);
        }
        if self.max_retries == 0 {
            return Err(ConfigError::ZeroRetries);
        }
        self.election().validate()?;
        Ok(())
    }

    /// The leader election timings.
    pub fn election(&self) -> LeaderElectionConfig {
        LeaderElectionConfig {
            lease_duration: self.lease_duration,
            renew_deadline: self.renew_deadline,
            retry_period: self.retry_period,
            release_on_cancel: self.release_on_cancel,
        }
    }
}

/// CLI options that can be configured for the provisioner
///
/// These can be parsed from args using `Opts::from_args()`
#[derive(StructOpt, Clone, Debug)]
#[cfg(any(feature = "cli", feature = "docs"))]
#[cfg_attr(feature = "docs", doc(cfg(feature = "cli")))]
#[structopt(
    name = "storage-provisioner",
    about = "Dynamically provisions hostPath persistent volumes"
)]
pub struct Opts {
    #[structopt(
        long = "root-dir",
        env = "HOSTPATH_ROOT_DIR",
        help = "The absolute path under which volume directories are created"
    )]
    root_dir: PathBuf,

    #[structopt(
        long = "provisioner-name",
        env = "PROVISIONER_NAME",
        help = "The provisioner name that storage classes must name for their claims to be served"
    )]
    provisioner_name: String,

    #[structopt(
        long = "lease-duration",
        env = "LEASE_DURATION",
        default_value = "15s",
        parse(try_from_str = parse_duration),
        help = "How long a leader lease is honored after it last changed"
    )]
    lease_duration: Duration,

    #[structopt(
        long = "renew-deadline",
        env = "RENEW_DEADLINE",
        default_value = "10s",
        parse(try_from_str = parse_duration),
        help = "How long the leader keeps trying to renew its lease before stepping down"
    )]
    renew_deadline: Duration,

    #[structopt(
        long = "retry-period",
        env = "RETRY_PERIOD",
        default_value = "2s",
        parse(try_from_str = parse_duration),
        help = "How often the lease is checked or renewed. Also the timeout for every API request"
    )]
    retry_period: Duration,

    #[structopt(
        long = "worker-count",
        env = "WORKER_COUNT",
        default_value = "4",
        help = "The number of workers for each of the claim and volume queues"
    )]
    worker_count: usize,

    #[structopt(
        long = "lock-namespace",
        env = "LOCK_NAMESPACE",
        default_value = DEFAULT_LOCK_NAMESPACE,
        help = "The namespace of the object holding the leader record"
    )]
    lock_namespace: String,

    #[structopt(
        long = "lock-name",
        env = "LOCK_NAME",
        help = "The name of the object holding the leader record. Defaults to the provisioner name with '/' replaced by '-'"
    )]
    lock_name: Option<String>,

    #[structopt(
        long = "max-retries",
        env = "MAX_RETRIES",
        default_value = "5",
        help = "Attempts at saving a volume object before the claim is requeued"
    )]
    max_retries: u32,

    #[structopt(
        long = "release-on-cancel",
        env = "RELEASE_ON_CANCEL",
        default_value = "true",
        parse(try_from_str),
        help = "Whether the leader clears the leader record when shutting down"
    )]
    release_on_cancel: bool,

    #[structopt(
        long = "event-buffer",
        env = "EVENT_BUFFER",
        default_value = "256",
        help = "How many events may wait for delivery before new ones are dropped"
    )]
    event_buffer: usize,
}

// Object names may not contain slashes, which provisioner names usually do
fn default_lock_name(provisioner_name: &str) -> String {
    provisioner_name.replace('/', "-")
}

/// Parses `250ms`, `15s`, `5m`, `1h`, or a bare number of seconds.
pub fn parse_duration(value: &str) -> Result<Duration, ConfigError> {
    let invalid = || ConfigError::InvalidDuration(value.to_string());
    let value = value.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or_else(|| value.len());
    let (number, unit) = value.split_at(split);
    let number: u64 = number.parse().map_err(|_| invalid())?;
    let seconds = |per_unit: u64| {
        number
            .checked_mul(per_unit)
            .map(Duration::from_secs)
            .ok_or_else(invalid)
    };
    match unit {
        "ms" => Ok(Duration::from_millis(number)),
        "" | "s" => Ok(Duration::from_secs(number)),
        "m" => seconds(60),
        "h" => seconds(60 * 60),
        _ => Err(invalid()),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default_config("/tmp/hostpath-provisioner", "k8s.io/minikube-hostpath");
        assert_eq!(config.validate(), Ok(()));
        assert_eq!(config.lock_name, "k8s.io-minikube-hostpath");
        assert_eq!(config.lock_namespace, "kube-system");
        assert_eq!(config.worker_count, 4);
        assert_eq!(config.election().lease_duration, Duration::from_secs(15));
        assert_eq!(config.election().renew_deadline, Duration::from_secs(10));
        assert_eq!(config.election().retry_period, Duration::from_secs(2));
    }

    #[test]
    fn invalid_values_are_rejected() {
        let config = Config::default_config("relative/dir", "p");
        assert!(matches!(
            config.validate(),
            Err(ConfigError::RootDirNotAbsolute(_))
        ));

        let config = Config::default_config("/tmp", " ");
        assert_eq!(config.validate(), Err(ConfigError::EmptyProvisionerName));

        let mut config = Config::default_config("/tmp", "p");
        config.worker_count = 0;
        assert_eq!(config.validate(), Err(ConfigError::ZeroWorkers));

        let mut config = Config::default_config("/tmp", "p");
        config.renew_deadline = Duration::from_secs(20);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Election(ElectionConfigError::LeaseTooShort { .. }))
        ));

        let mut config = Config::default_config("/tmp", "p");
        config.lease_duration = parse_duration(&format!("{}s", u64::MAX / 2)).unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Election(ElectionConfigError::LeaseTooLong { .. }))
        ));
    }

    #[test]
    fn durations_parse_with_units() {
        assert_eq!(parse_duration("250ms"), Ok(Duration::from_millis(250)));
        assert_eq!(parse_duration("15s"), Ok(Duration::from_secs(15)));
        assert_eq!(parse_duration("15"), Ok(Duration::from_secs(15)));
        assert_eq!(parse_duration("2m"), Ok(Duration::from_secs(120)));
        assert_eq!(parse_duration("1h"), Ok(Duration::from_secs(3600)));
        for bad in &["", "s", "1.5s", "10d", "-1s", "99999999999999999999s"] {
            assert!(parse_duration(bad).is_err(), "{:?} should not parse", bad);
        }
        let too_many_hours = format!("{}h", u64::MAX / 60);
        assert_eq!(
            parse_duration(&too_many_hours),
            Err(ConfigError::InvalidDuration(too_many_hours.clone()))
        );
        assert!(parse_duration(&format!("{}m", u64::MAX)).is_err());
    }

    #[cfg(feature = "cli")]
    #[test]
    fn flags_fill_in_defaults() {
        let opts = Opts::from_iter_safe(&[
            "storage-provisioner",
            "--root-dir",
            "/tmp/hostpath-provisioner",
            "--provisioner-name",
            "k8s.io/minikube-hostpath",
            "--retry-period",
            "500ms",
            "--renew-deadline",
            "5s",
        ])
        .unwrap();
        let config = Config::from_opts(opts).unwrap();
        assert_eq!(config.retry_period, Duration::from_millis(500));
        assert_eq!(config.renew_deadline, Duration::from_secs(5));
        assert_eq!(config.lease_duration, Duration::from_secs(15));
        assert_eq!(config.lock_name, "k8s.io-minikube-hostpath");
        assert!(config.release_on_cancel);
        assert_eq!(config.max_retries, 5);
    }
}
