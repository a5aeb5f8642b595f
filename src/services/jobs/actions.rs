//! Bodies of the administrative jobs
//!
//! Every job is a short sequence of runner calls. Cancellation is honoured at
//! `checkpoint()` until the job passes `commit()`, after which the system has
//! been modified and the job runs to the end.

use super::{InvalidRequest, JobContext, JobCoordinator, JobId, JobKind, SubmitError};
use crate::{
    config::{PathConfig, SystemConfig},
    services::{
        network::{NetworkServices, Secret, Security, validate_credentials},
        system_actions::{CommandRunner, CommandSpec, Outcome},
    },
};
use anyhow::{Context, Result, bail};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_valid::Validate;
use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    time::Duration,
};
use tokio::sync::mpsc;

const GIT_PULL_TIMEOUT: Duration = Duration::from_secs(300);
const GIT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);
const GIT_TIMEOUT: Duration = Duration::from_secs(10);
const POWER_TIMEOUT: Duration = Duration::from_secs(30);
const SSH_KEYGEN_TIMEOUT: Duration = Duration::from_secs(30);
const TAILSCALE_STATUS_TIMEOUT: Duration = Duration::from_secs(10);
const TAILSCALE_CERT_TIMEOUT: Duration = Duration::from_secs(60);
const CHOWN_TIMEOUT: Duration = Duration::from_secs(10);

const SSH_KEY_NAME: &str = "id_ed25519";
const REMOTE_BRANCHES: [&str; 2] = ["origin/main", "origin/master"];
const SHORT_COMMIT_LEN: usize = 8;
const GITHUB_HTTPS_PREFIX: &str = "https://github.com/";

const GIT_ERROR_INDICATORS: [&str; 6] = [
    "error:",
    "fatal:",
    "could not",
    "failed to",
    "permission denied",
    "cannot",
];

const GIT_UPDATE_INDICATORS: [&str; 6] = [
    "updating",
    "fast-forward",
    "files changed",
    "file changed",
    "insertions",
    "deletions",
];

/// A job as requested over HTTP, e.g. `{"kind": "generate-ssh-key", "params": {...}}`
#[derive(Debug, Deserialize)]
#[serde(tag = "kind", content = "params", rename_all = "kebab-case")]
pub enum JobRequest {
    Update,
    CheckForUpdates,
    Reboot,
    Shutdown,
    GenerateSshKey(SshKeyParams),
    GenerateTlsCert,
    ConnectNetwork(ConnectParams),
    ScanNetworks,
}

#[derive(Debug, Deserialize, Validate)]
pub struct SshKeyParams {
    #[validate(min_length = 3)]
    #[validate(max_length = 254)]
    pub email: String,
    #[serde(default)]
    pub regenerate: bool,
}

#[derive(Debug, Deserialize, Validate)]
pub struct ConnectParams {
    #[validate(min_length = 1)]
    pub ssid: String,
    #[serde(default)]
    pub secret: Option<Secret>,
}

#[derive(Debug, PartialEq, Serialize)]
pub struct SshKeyStatus {
    pub exists: bool,
    pub public_key: Option<String>,
}

#[derive(Debug, PartialEq, Serialize)]
pub struct TlsStatus {
    pub tailscale_installed: bool,
    pub tailscale_hostname: Option<String>,
    pub certificate: Option<PathBuf>,
    pub key: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteKind {
    Https,
    Ssh,
    Unknown,
}

impl RemoteKind {
    fn of(url: &str) -> Self {
        if url.starts_with("https://") {
            RemoteKind::Https
        } else if url.starts_with("git@") || url.starts_with("ssh://") {
            RemoteKind::Ssh
        } else {
            RemoteKind::Unknown
        }
    }
}

#[derive(Debug, PartialEq, Serialize)]
pub struct GitRemoteStatus {
    #[serde(rename = "type")]
    pub kind: RemoteKind,
    pub url: Option<String>,
}

impl JobRequest {
    pub fn kind(&self) -> JobKind {
        match self {
            JobRequest::Update => JobKind::Update,
            JobRequest::CheckForUpdates => JobKind::CheckForUpdates,
            JobRequest::Reboot => JobKind::Reboot,
            JobRequest::Shutdown => JobKind::Shutdown,
            JobRequest::GenerateSshKey(_) => JobKind::GenerateSshKey,
            JobRequest::GenerateTlsCert => JobKind::GenerateTlsCert,
            JobRequest::ConnectNetwork(_) => JobKind::ConnectNetwork,
            JobRequest::ScanNetworks => JobKind::ScanNetworks,
        }
    }

    /// Reject malformed parameters before any group is claimed
    pub fn validate(&self) -> Result<(), SubmitError> {
        match self {
            JobRequest::GenerateSshKey(params) => {
                params
                    .validate()
                    .map_err(|e| SubmitError::InvalidRequest(e.to_string()))?;
                if !is_valid_email(params.email.trim()) {
                    return Err(SubmitError::InvalidRequest(
                        "invalid email address format".to_string(),
                    ));
                }
                Ok(())
            }
            JobRequest::ConnectNetwork(params) => {
                params
                    .validate()
                    .map_err(|e| SubmitError::InvalidRequest(e.to_string()))?;
                validate_credentials(&params.ssid, params.secret.as_ref())
                    .map_err(SubmitError::InvalidRequest)
            }
            _ => Ok(()),
        }
    }
}

/// Executes job requests against the system
#[derive(Clone)]
pub struct JobActions<R> {
    runner: R,
    network: NetworkServices<R>,
    system: SystemConfig,
    paths: PathConfig,
}

impl<R: CommandRunner + Clone> JobActions<R> {
    pub fn new(
        runner: R,
        network: NetworkServices<R>,
        system: SystemConfig,
        paths: PathConfig,
    ) -> Self {
        Self {
            runner,
            network,
            system,
            paths,
        }
    }

    pub fn network(&self) -> &NetworkServices<R> {
        &self.network
    }

    /// Validate a request and hand it to the coordinator
    pub fn submit(
        &self,
        coordinator: &JobCoordinator,
        request: JobRequest,
    ) -> Result<JobId, SubmitError> {
        request.validate()?;

        let actions = self.clone();
        coordinator.submit(request.kind(), move |ctx| async move {
            actions.execute(&ctx, request).await
        })
    }

    async fn execute(&self, ctx: &JobContext, request: JobRequest) -> Result<()> {
        match request {
            JobRequest::Update => self.update(ctx).await,
            JobRequest::CheckForUpdates => self.check_for_updates(ctx).await,
            JobRequest::Reboot => self.power(ctx, true).await,
            JobRequest::Shutdown => self.power(ctx, false).await,
            JobRequest::GenerateSshKey(params) => self.generate_ssh_key(ctx, params).await,
            JobRequest::GenerateTlsCert => self.generate_tls_cert(ctx).await,
            JobRequest::ConnectNetwork(params) => self.connect_network(ctx, params).await,
            JobRequest::ScanNetworks => self.scan_networks(ctx).await,
        }
    }

    fn git(&self, label: &str, timeout: Duration) -> CommandSpec {
        CommandSpec::new(label, "git", timeout)
            .current_dir(&self.system.repo_dir)
            .run_as(self.system.repo_user.as_deref())
    }

    async fn update(&self, ctx: &JobContext) -> Result<()> {
        ctx.commit()?;
        ctx.log("Running git pull...");

        let (lines_tx, mut lines_rx) = mpsc::unbounded_channel::<String>();
        let pull = self
            .runner
            .run_streaming(self.git("git_pull", GIT_PULL_TIMEOUT).arg("pull"), lines_tx);
        let forward = async {
            while let Some(line) = lines_rx.recv().await {
                ctx.log(line);
            }
        };
        let (result, ()) = tokio::join!(pull, forward);
        let result = result.checked().context("failed to update")?;

        let output = format!("{}\n{}", result.stdout, result.stderr);
        if has_git_error(&output) {
            bail!("failed to update: git pull reported an error");
        }

        if !has_git_changes(&output) {
            ctx.log("Already up to date");
            return Ok(());
        }

        let latest = self
            .runner
            .run(self.git("git_log", GIT_TIMEOUT).args(["log", "-1", "--format=%s"]))
            .await;
        match latest.stdout.trim() {
            subject if latest.ok() && !subject.is_empty() => {
                ctx.log(format!("Updated to: {subject}"))
            }
            _ => ctx.log("Updated"),
        }
        info!("update finished");

        Ok(())
    }

    /// Fetch and compare `HEAD` with the remote default branch, changing nothing
    async fn check_for_updates(&self, ctx: &JobContext) -> Result<()> {
        ctx.log("Fetching from origin...");
        self.runner
            .run(self.git("git_fetch", GIT_FETCH_TIMEOUT).arg("fetch"))
            .await
            .checked()
            .context("failed to fetch from origin")?;
        ctx.checkpoint()?;

        let local = self
            .rev_parse("HEAD")
            .await
            .context("failed to resolve local HEAD")?;

        let mut remote = None;
        for branch in REMOTE_BRANCHES {
            if let Some(commit) = self.rev_parse(branch).await {
                remote = Some(commit);
                break;
            }
        }
        let remote = remote.context("could not determine the remote branch")?;

        if local == remote {
            ctx.log(format!("Up to date at {}", short_commit(&local)));
        } else {
            ctx.log(format!(
                "Update available: {} -> {}",
                short_commit(&local),
                short_commit(&remote)
            ));
        }

        Ok(())
    }

    async fn rev_parse(&self, rev: &str) -> Option<String> {
        let result = self
            .runner
            .run(self.git("git_rev_parse", GIT_TIMEOUT).args(["rev-parse", rev]))
            .await;
        let commit = result.stdout.trim();

        (result.ok() && !commit.is_empty()).then(|| commit.to_string())
    }

    async fn power(&self, ctx: &JobContext, reboot: bool) -> Result<()> {
        ctx.checkpoint()?;
        ctx.commit()?;

        let spec = CommandSpec::new("power", "shutdown", POWER_TIMEOUT)
            .privileged(self.system.use_sudo);
        let spec = if reboot {
            ctx.log("Rebooting now");
            spec.args(["-r", "now"])
        } else {
            ctx.log("Shutting down now");
            spec.arg("now")
        };

        self.runner
            .run(spec)
            .await
            .checked()
            .context("failed to power off")?;

        Ok(())
    }

    async fn generate_ssh_key(&self, ctx: &JobContext, params: SshKeyParams) -> Result<()> {
        let ssh_dir = &self.paths.ssh_dir;
        let (private_key, public_key) = self.ssh_key_paths();

        let exists = tokio::fs::try_exists(&private_key).await.unwrap_or(false)
            || tokio::fs::try_exists(&public_key).await.unwrap_or(false);
        if exists && !params.regenerate {
            bail!(InvalidRequest("SSH keys already exist".to_string()));
        }

        tokio::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(ssh_dir)
            .await
            .with_context(|| format!("failed to create {}", ssh_dir.display()))?;

        ctx.checkpoint()?;
        ctx.commit()?;

        if exists {
            ctx.log("Removing existing keys");
            remove_if_present(&private_key).await?;
            remove_if_present(&public_key).await?;
        }

        let spec = CommandSpec::new("ssh_keygen", "ssh-keygen", SSH_KEYGEN_TIMEOUT)
            .args(["-t", "ed25519", "-C"])
            .arg(params.email.trim())
            .args(["-N", "", "-q", "-f"])
            .arg(private_key.to_string_lossy());
        self.runner
            .run(spec)
            .await
            .checked()
            .context("failed to generate SSH key")?;

        let key = tokio::fs::read_to_string(&public_key)
            .await
            .context("failed to read public key")?;
        ctx.log(key.trim());

        if let Err(e) = self.convert_origin_to_ssh(ctx).await {
            warn!("failed to convert origin remote: {e:#}");
            ctx.log("Could not convert the origin remote to SSH");
        }

        Ok(())
    }

    async fn convert_origin_to_ssh(&self, ctx: &JobContext) -> Result<()> {
        let origin = self
            .runner
            .run(
                self.git("git_remote_get", GIT_TIMEOUT)
                    .args(["remote", "get-url", "origin"]),
            )
            .await
            .checked()?;

        let Some(ssh_url) = github_ssh_url(origin.stdout.trim()) else {
            return Ok(());
        };

        self.runner
            .run(
                self.git("git_remote_set", GIT_TIMEOUT)
                    .args(["remote", "set-url", "origin"])
                    .arg(&ssh_url),
            )
            .await
            .checked()?;

        ctx.log(format!("Origin remote switched to {ssh_url}"));
        Ok(())
    }

    async fn generate_tls_cert(&self, ctx: &JobContext) -> Result<()> {
        let status = self
            .runner
            .run(
                CommandSpec::new("tailscale_status", "tailscale", TAILSCALE_STATUS_TIMEOUT)
                    .args(["status", "--json"]),
            )
            .await
            .checked()
            .context("failed to query tailscale status")?;
        let host = tailscale_dns_name(&status.stdout)?;
        ctx.log(format!("Requesting certificate for {host}"));

        ctx.checkpoint()?;
        ctx.commit()?;

        let tls_dir = &self.paths.tls_dir;
        match tokio::fs::remove_dir_all(tls_dir).await {
            Err(e) if e.kind() != ErrorKind::NotFound => {
                return Err(e).with_context(|| format!("failed to clear {}", tls_dir.display()));
            }
            _ => {}
        }
        tokio::fs::create_dir_all(tls_dir)
            .await
            .with_context(|| format!("failed to create {}", tls_dir.display()))?;

        let cert_file = tls_dir.join(format!("{host}.crt"));
        let key_file = tls_dir.join(format!("{host}.key"));

        self.runner
            .run(
                CommandSpec::new("tailscale_cert", "tailscale", TAILSCALE_CERT_TIMEOUT)
                    .arg("cert")
                    .arg("--cert-file")
                    .arg(cert_file.to_string_lossy())
                    .arg("--key-file")
                    .arg(key_file.to_string_lossy())
                    .arg(&host)
                    .privileged(self.system.use_sudo),
            )
            .await
            .checked()
            .context("failed to generate certificate")?;

        // SAFETY: getuid and getgid cannot fail and touch no memory
        let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };
        self.runner
            .run(
                CommandSpec::new("tls_chown", "chown", CHOWN_TIMEOUT)
                    .arg(format!("{uid}:{gid}"))
                    .arg(cert_file.to_string_lossy())
                    .arg(key_file.to_string_lossy())
                    .privileged(self.system.use_sudo),
            )
            .await
            .checked()
            .context("failed to take ownership of certificate")?;

        ctx.log(format!(
            "Certificate stored in {}, used after the next restart",
            tls_dir.display()
        ));
        Ok(())
    }

    async fn connect_network(&self, ctx: &JobContext, params: ConnectParams) -> Result<()> {
        let ConnectParams { ssid, secret } = params;
        let network = &self.network;

        let secret = match secret {
            Some(secret) => Some(secret),
            None => match network.profiles.get(&ssid).await? {
                Some(profile) => network.profiles.reveal(&profile)?,
                None => None,
            },
        };

        let security = match network.scans.security_of(&ssid) {
            Some(Security::WpaEnterpriseUnsupported) => {
                bail!(InvalidRequest(format!(
                    "{ssid:?} uses WPA-Enterprise, which is not supported"
                )));
            }
            Some(Security::WpaPsk) if secret.is_none() => {
                bail!(InvalidRequest(format!("{ssid:?} requires a password")));
            }
            Some(security) => security,
            None if secret.is_some() => Security::WpaPsk,
            None => Security::Open,
        };

        ctx.checkpoint()?;
        network.connections.add(&ssid, secret.as_ref()).await?;
        ctx.commit()?;

        let was_broadcasting = network.access_point.is_broadcasting();
        if was_broadcasting {
            ctx.log("Stopping setup network");
            if let Err(e) = network.access_point.stop().await {
                warn!("continuing after incomplete access point stop: {e:#}");
            }
        }

        ctx.log(format!("Connecting to {ssid}"));
        match network.connections.activate(&ssid, secret.as_ref()).await {
            Ok(()) => {
                network
                    .profiles
                    .record_connection(&ssid, security, secret.as_ref())
                    .await?;
                ctx.log(format!("Connected to {ssid}"));
                Ok(())
            }
            Err(e) => {
                ctx.log(format!("Connection failed: {}", e.root_cause()));

                if let Err(e) = network.connections.delete(&ssid).await {
                    warn!("failed to remove rejected connection: {e:#}");
                }
                if was_broadcasting {
                    ctx.log("Restarting setup network");
                    network
                        .access_point
                        .start()
                        .await
                        .context("failed to restore setup network")?;
                }

                Err(e)
            }
        }
    }

    async fn scan_networks(&self, ctx: &JobContext) -> Result<()> {
        let networks = self.network.prober.scan().await?;
        ctx.log(format!("Found {} networks", networks.len()));
        self.network.scans.store(networks);
        Ok(())
    }

    fn ssh_key_paths(&self) -> (PathBuf, PathBuf) {
        let ssh_dir = &self.paths.ssh_dir;
        (
            ssh_dir.join(SSH_KEY_NAME),
            ssh_dir.join(format!("{SSH_KEY_NAME}.pub")),
        )
    }
}

/// Read-only status queries, answered without a job
impl<R: CommandRunner + Clone> JobActions<R> {
    pub async fn ssh_key_status(&self) -> Result<SshKeyStatus> {
        let (private_key, public_key) = self.ssh_key_paths();

        let exists = tokio::fs::try_exists(&private_key).await.unwrap_or(false)
            && tokio::fs::try_exists(&public_key).await.unwrap_or(false);
        if !exists {
            return Ok(SshKeyStatus {
                exists,
                public_key: None,
            });
        }

        let public_key = match tokio::fs::read_to_string(&public_key).await {
            Ok(key) => Some(key.trim().to_string()),
            Err(e) => {
                warn!("failed to read {}: {e}", public_key.display());
                None
            }
        };

        Ok(SshKeyStatus { exists, public_key })
    }

    pub async fn tls_status(&self) -> Result<TlsStatus> {
        let status = self
            .runner
            .run(
                CommandSpec::new("tailscale_status", "tailscale", TAILSCALE_STATUS_TIMEOUT)
                    .args(["status", "--json"]),
            )
            .await;

        let tailscale_hostname = if status.ok() {
            tailscale_dns_name(&status.stdout)
                .inspect_err(|e| warn!("no tailscale hostname: {e:#}"))
                .ok()
        } else {
            None
        };
        let (certificate, key) = find_tls_files(&self.paths.tls_dir).await?;

        Ok(TlsStatus {
            tailscale_installed: !matches!(status.outcome, Outcome::SpawnFailed(_)),
            tailscale_hostname,
            certificate,
            key,
        })
    }

    pub async fn git_remote_status(&self) -> Result<GitRemoteStatus> {
        let origin = self
            .runner
            .run(
                self.git("git_remote_get", GIT_TIMEOUT)
                    .args(["remote", "get-url", "origin"]),
            )
            .await;
        let url = origin.stdout.trim();

        if !origin.ok() || url.is_empty() {
            return Ok(GitRemoteStatus {
                kind: RemoteKind::Unknown,
                url: None,
            });
        }

        Ok(GitRemoteStatus {
            kind: RemoteKind::of(url),
            url: Some(url.to_string()),
        })
    }
}

async fn remove_if_present(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != ErrorKind::NotFound => {
            Err(e).with_context(|| format!("failed to remove {}", path.display()))
        }
        _ => Ok(()),
    }
}

/// First `.crt` and first `.key` file in `dir`, by file name
async fn find_tls_files(dir: &Path) -> Result<(Option<PathBuf>, Option<PathBuf>)> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok((None, None)),
        Err(e) => return Err(e).with_context(|| format!("failed to read {}", dir.display())),
    };

    let mut files = vec![];
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("failed to read {}", dir.display()))?
    {
        if entry.file_type().await.is_ok_and(|t| t.is_file()) {
            files.push(entry.path());
        }
    }
    files.sort();

    let first = |extension: &str| {
        files
            .iter()
            .find(|path| path.extension().is_some_and(|e| e == extension))
            .cloned()
    };

    Ok((first("crt"), first("key")))
}

fn short_commit(commit: &str) -> &str {
    commit.get(..SHORT_COMMIT_LEN).unwrap_or(commit)
}

/// `local@domain.tld` with a restricted character set, safe to pass to ssh-keygen
fn is_valid_email(email: &str) -> bool {
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    let Some((_, tld)) = domain.rsplit_once('.') else {
        return false;
    };

    let local_ok = !local.is_empty()
        && local
            .chars()
            .all(|c| c.is_alphanumeric() || matches!(c, '_' | '.' | '+' | '-'));
    let domain_ok = domain
        .chars()
        .all(|c| c.is_alphanumeric() || matches!(c, '_' | '.' | '-'));
    let tld_ok = tld.len() >= 2 && tld.chars().all(|c| c.is_ascii_alphabetic());

    local_ok && domain_ok && tld_ok && !domain.starts_with('.')
}

fn has_git_error(output: &str) -> bool {
    let output = output.to_lowercase();
    GIT_ERROR_INDICATORS.iter().any(|i| output.contains(i))
}

/// Whether `git pull` output shows that the checkout changed
fn has_git_changes(output: &str) -> bool {
    let lower = output.to_lowercase();

    if lower.contains("already up to date") || lower.contains("already up-to-date") {
        return false;
    }
    if GIT_UPDATE_INDICATORS.iter().any(|i| lower.contains(i)) {
        return true;
    }

    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with("From") && !l.starts_with("remote:"))
        .count()
        > 1
}

/// SSH form of a GitHub HTTPS remote, `None` for anything else
fn github_ssh_url(url: &str) -> Option<String> {
    let path = url.strip_prefix(GITHUB_HTTPS_PREFIX)?;
    let (user, repo) = path.split_once('/')?;
    let repo = repo.trim_end_matches('/');
    let repo = repo.strip_suffix(".git").unwrap_or(repo);

    if user.is_empty() || repo.is_empty() {
        return None;
    }

    Some(format!("git@github.com:{user}/{repo}.git"))
}

fn tailscale_dns_name(status_json: &str) -> Result<String> {
    #[derive(Deserialize)]
    struct Status {
        #[serde(rename = "Self")]
        node: Node,
    }

    #[derive(Deserialize)]
    struct Node {
        #[serde(rename = "DNSName", default)]
        dns_name: String,
    }

    let status: Status =
        serde_json::from_str(status_json).context("failed to parse tailscale status")?;
    let host = status.node.dns_name.trim_end_matches('.');

    if host.is_empty() {
        bail!("tailscale reports no DNS name for this device");
    }

    Ok(host.to_string())
}
