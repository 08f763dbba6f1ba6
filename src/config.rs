//! Daemon options and startup validation.
//!
//! Only the startup surface lives here; per-path replication policy comes
//! from the `*.conf` registry in [`crate::paths`].

use anyhow::{bail, ensure, Context, Result};
use clap::Parser;
use std::path::PathBuf;

use crate::protocol::Endpoint;
use crate::quiesce::DEFAULT_TRANSFER_AFTER;

/// Login/password pair appended to data headers and checked on receipt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub login: String,
    pub password: String,
}

#[derive(Debug, Parser)]
#[command(name = "rfsd", about = "Cluster file replication daemon", version)]
pub struct Options {
    /// Plain listen URI for the data channel (scheme rfs).
    #[arg(long, default_value = "rfs://0.0.0.0:4044")]
    pub listen: String,

    /// TLS listen URI for the data channel (scheme rfss).
    #[arg(long)]
    pub secure_listen: Option<String>,

    /// PEM certificate for the TLS data channel.
    #[arg(long)]
    pub certificate: Option<PathBuf>,

    /// PEM private key for the TLS data channel.
    #[arg(long)]
    pub private_key: Option<PathBuf>,

    /// Colon-separated directories where received files are staged.
    #[arg(long, default_value = "/var/lib/rfsd/tmp")]
    pub temp_dirs: String,

    /// Colon-separated roots scanned for *.conf watched-path files.
    #[arg(long, default_value = "/usr/share/rfsd/watch-dirs:/var/lib/rfsd/watch-dirs")]
    pub watch_dirs: String,

    /// Seconds a file must stay unmodified before an open file is
    /// transferred anyway (minimum 3).
    #[arg(long, default_value_t = DEFAULT_TRANSFER_AFTER)]
    pub transfer_after_sec: u32,

    /// Login announced to peers and required from them.
    #[arg(long)]
    pub login: Option<String>,

    /// Password paired with --login.
    #[arg(long)]
    pub password: Option<String>,

    /// Address of the control bus (host:port). Without it the daemon
    /// still serves pulls but neither hears nor makes announcements.
    #[arg(long)]
    pub bus: Option<String>,
}

/// Options after validation, with the listen URIs parsed.
#[derive(Debug, Clone)]
pub struct Settings {
    pub listen: Endpoint,
    pub secure_listen: Option<Endpoint>,
    pub certificate: Option<PathBuf>,
    pub private_key: Option<PathBuf>,
    pub temp_dirs: Vec<PathBuf>,
    pub watch_dirs: Vec<PathBuf>,
    pub transfer_after_sec: u32,
    pub credentials: Option<Credentials>,
    pub bus: Option<String>,
}

impl Options {
    /// Validate and resolve the raw options.
    ///
    /// # Errors
    ///
    /// Any violation here is fatal: wrong URI scheme, partial TLS
    /// configuration, empty temp or watch-dir lists.
    pub fn into_settings(self) -> Result<Settings> {
        let listen = Endpoint::parse(&self.listen)
            .with_context(|| format!("--listen {:?} is not a valid rfs:// URI", self.listen))?;
        ensure!(
            !listen.secure,
            "--listen must use the rfs:// scheme; use --secure-listen for TLS"
        );

        let secure_listen = match &self.secure_listen {
            Some(uri) => {
                let endpoint = Endpoint::parse(uri)
                    .with_context(|| format!("--secure-listen {uri:?} is not a valid URI"))?;
                ensure!(
                    endpoint.secure,
                    "--secure-listen must use the rfss:// scheme"
                );
                Some(endpoint)
            }
            None => None,
        };

        let tls_parts = [
            self.secure_listen.is_some(),
            self.certificate.is_some(),
            self.private_key.is_some(),
        ];
        if tls_parts.iter().any(|p| *p) && !tls_parts.iter().all(|p| *p) {
            bail!("--secure-listen, --certificate and --private-key must be given together");
        }

        let temp_dirs = split_dirs(&self.temp_dirs);
        ensure!(!temp_dirs.is_empty(), "--temp-dirs must name at least one directory");
        let watch_dirs = split_dirs(&self.watch_dirs);
        ensure!(!watch_dirs.is_empty(), "--watch-dirs must name at least one directory");

        let credentials = match (self.login, self.password) {
            (Some(login), Some(password)) => Some(Credentials { login, password }),
            (None, None) => None,
            _ => bail!("--login and --password must be given together"),
        };

        Ok(Settings {
            listen,
            secure_listen,
            certificate: self.certificate,
            private_key: self.private_key,
            temp_dirs,
            watch_dirs,
            transfer_after_sec: self.transfer_after_sec,
            credentials,
            bus: self.bus,
        })
    }
}

impl Settings {
    /// Comma-separated list of this daemon's reachable data endpoints,
    /// as advertised in announcements.
    pub fn advertised_endpoints(&self) -> String {
        let mut uris = self.listen.uri();
        if let Some(secure) = &self.secure_listen {
            uris.push(',');
            uris.push_str(&secure.uri());
        }
        uris
    }
}

fn split_dirs(list: &str) -> Vec<PathBuf> {
    list.split(':')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .collect()
}
