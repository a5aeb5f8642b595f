use anyhow::{Context, Result};
use std::{
    env,
    net::{IpAddr, Ipv4Addr},
    path::{Path, PathBuf},
    str::FromStr,
    sync::OnceLock,
    time::Duration,
};
use uuid::Uuid;

/// Application configuration loaded and validated at startup
#[derive(Clone, Debug)]
pub struct AppConfig {
    /// Administrative HTTP server configuration
    pub admin: AdminConfig,

    /// Privilege and checkout settings for system commands
    pub system: SystemConfig,

    /// Wireless interface and access point configuration
    pub access_point: AccessPointConfig,

    /// Captive portal listener configuration
    pub portal: PortalConfig,

    /// Connectivity probing configuration
    pub provisioning: ProvisioningConfig,

    /// Persisted state locations
    pub paths: PathConfig,

    /// Store lock timeout
    pub store_lock_timeout: Duration,

    /// Per-process secret for signing session tokens
    pub token_secret: String,
}

#[derive(Clone, Debug)]
pub struct AdminConfig {
    pub port: u16,
}

#[derive(Clone, Debug)]
pub struct SystemConfig {
    pub use_sudo: bool,
    pub repo_dir: PathBuf,
    pub repo_user: Option<String>,
}

#[derive(Clone, Debug)]
pub struct AccessPointConfig {
    pub interface: String,
    pub ssid: String,
    pub address: String,
    pub hostapd_config: PathBuf,
    pub settle: Duration,
    pub use_sudo: bool,
}

#[derive(Clone, Debug)]
pub struct PortalConfig {
    pub bind_address: IpAddr,
    pub port: u16,
    pub shutdown_grace: Duration,
}

#[derive(Clone, Debug)]
pub struct ProvisioningConfig {
    pub probe_retries: u32,
    pub probe_backoff: Duration,
    pub health_check_interval: Duration,
    pub accept_unmanaged_networks: bool,
    pub scan_settle: Duration,
}

#[derive(Clone, Debug)]
pub struct PathConfig {
    pub data_dir: PathBuf,
    pub store_dir: PathBuf,
    pub device_secret_file: PathBuf,
    pub password_file: PathBuf,
    pub tls_dir: PathBuf,
    pub ssh_dir: PathBuf,
}

impl AppConfig {
    /// Get or load the application configuration
    ///
    /// Returns a reference to the cached configuration. On first call, it loads
    /// and validates all configuration from environment variables. Subsequent
    /// calls return the cached instance.
    ///
    /// # Panics
    /// Panics if configuration loading fails. This is intentional as the
    /// application cannot function without valid configuration.
    pub fn get() -> &'static Self {
        static APP_CONFIG: OnceLock<AppConfig> = OnceLock::new();
        APP_CONFIG.get_or_init(|| {
            Self::load_internal().expect("failed to load application configuration")
        })
    }

    /// Internal function to load and validate all configuration from environment variables
    fn load_internal() -> Result<Self> {
        let admin = AdminConfig::load()?;
        let system = SystemConfig::load()?;
        let access_point = AccessPointConfig::load(&system)?;
        let portal = PortalConfig::load()?;
        let provisioning = ProvisioningConfig::load()?;
        let paths = PathConfig::load()?;
        let store_lock_timeout = Duration::from_millis(parse_env("STORE_LOCK_TIMEOUT_MS", 5000)?);

        // Generate a unique signing secret for this instance
        let token_secret = Uuid::new_v4().to_string();

        Ok(Self {
            admin,
            system,
            access_point,
            portal,
            provisioning,
            paths,
            store_lock_timeout,
            token_secret,
        })
    }
}

impl AdminConfig {
    fn load() -> Result<Self> {
        let port = parse_env("ADMIN_PORT", 8443)?;

        Ok(Self { port })
    }
}

impl SystemConfig {
    fn load() -> Result<Self> {
        let use_sudo = parse_env("USE_SUDO", true)?;

        let repo_dir = match env::var("REPO_DIR") {
            Ok(dir) => PathBuf::from(dir),
            Err(_) => env::current_dir().context("failed to determine current directory")?,
        };

        let repo_user = env::var("REPO_USER").ok().filter(|u| !u.is_empty());

        Ok(Self {
            use_sudo,
            repo_dir,
            repo_user,
        })
    }
}

impl AccessPointConfig {
    fn load(system: &SystemConfig) -> Result<Self> {
        let interface = env::var("WIFI_INTERFACE").unwrap_or_else(|_| "wlan0".to_string());
        let ssid = env::var("AP_SSID").unwrap_or_else(|_| "ArrivalBoard-Setup".to_string());
        let address = env::var("AP_ADDRESS").unwrap_or_else(|_| "192.168.4.1/24".to_string());
        let hostapd_config = env::var("HOSTAPD_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| system.repo_dir.join("hostapd_provisioning.conf"));
        let settle = Duration::from_secs(parse_env("AP_SETTLE_SECS", 2)?);

        anyhow::ensure!(
            address.contains('/'),
            "failed to parse AP_ADDRESS: expected CIDR notation"
        );

        Ok(Self {
            interface,
            ssid,
            address,
            hostapd_config,
            settle,
            use_sudo: system.use_sudo,
        })
    }

    /// Address of the access point without prefix length
    pub fn host_address(&self) -> &str {
        self.address
            .split_once('/')
            .map_or(self.address.as_str(), |(host, _)| host)
    }
}

impl PortalConfig {
    fn load() -> Result<Self> {
        let port = parse_env("PORTAL_PORT", 80)?;
        let shutdown_grace = Duration::from_secs(parse_env("PORTAL_SHUTDOWN_GRACE_SECS", 5)?);

        Ok(Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port,
            shutdown_grace,
        })
    }
}

impl ProvisioningConfig {
    fn load() -> Result<Self> {
        let probe_retries = parse_env("PROBE_RETRIES", 3)?;
        let probe_backoff = Duration::from_secs(parse_env("PROBE_BACKOFF_SECS", 5)?);
        let health_check_interval =
            Duration::from_secs(parse_env("HEALTH_CHECK_INTERVAL_SECS", 30)?);
        let accept_unmanaged_networks = parse_env("ACCEPT_UNMANAGED_NETWORKS", true)?;
        let scan_settle = Duration::from_secs(parse_env("SCAN_SETTLE_SECS", 2)?);

        anyhow::ensure!(
            probe_retries > 0,
            "failed to parse PROBE_RETRIES: must be at least 1"
        );

        Ok(Self {
            probe_retries,
            probe_backoff,
            health_check_interval,
            accept_unmanaged_networks,
            scan_settle,
        })
    }
}

impl PathConfig {
    fn load() -> Result<Self> {
        let data_dir = env::var("DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/var/lib/arrival-board"));

        let tls_dir = env::var("TLS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("https"));

        let ssh_dir = match env::var("SSH_DIR") {
            Ok(dir) => PathBuf::from(dir),
            Err(_) => PathBuf::from(env::var("HOME").context("failed to get HOME")?).join(".ssh"),
        };

        let paths = Self::in_data_dir(&data_dir, tls_dir, ssh_dir);

        std::fs::create_dir_all(paths.data_dir.join("config"))
            .context("failed to create config directory")?;

        Ok(paths)
    }

    /// Layout below a data directory
    pub fn in_data_dir(data_dir: &Path, tls_dir: PathBuf, ssh_dir: PathBuf) -> Self {
        Self {
            data_dir: data_dir.to_path_buf(),
            store_dir: data_dir.join("store"),
            device_secret_file: data_dir.join("device_secret"),
            password_file: data_dir.join("config").join("password"),
            tls_dir,
            ssh_dir,
        }
    }
}

fn parse_env<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .with_context(|| format!("failed to parse {name}: invalid format")),
        Err(_) => Ok(default),
    }
}
