//! Guided setup and configuration wizard to make deployment as easy as possible

use std::{fs::File, io::Write, path::Path};

use anyhow::anyhow;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use inquire::{validator::Validation, Confirm, CustomUserError, Password, Select, Text};
use rand::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::Level;

/// Minimum length for the two HMAC secrets, in characters.
pub const MIN_SECRET_LEN: usize = 32;

/// Global configuration for the entire application read from 'config.toml'.
///
/// Curious what all the options do? Simply go through the interactive setup wizard by invoking the
/// application with the '--init' flag and the displayed help text should answer your questions.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfiguration {
    pub interface: String,
    /// Base URL prepended to generated download links, e.g. "https://drop.example.com".
    pub public_base_url: String,
    pub database_url: String,
    /// Signs session cookies. Must differ from `download_secret` so a leak of
    /// one cannot forge the other's artifacts.
    pub session_secret: String,
    /// Signs download tokens.
    pub download_secret: String,
    /// bcrypt hash of the bootstrap admin password ($2a$/$2b$/$2y$, 60 chars).
    pub admin_password_hash: String,
    pub s3_endpoint: String,
    pub s3_region: String,
    pub s3_access_key: String,
    pub s3_secret_key: String,
    pub s3_bucket: String,
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: u64,
    #[serde(default = "default_session_ttl_hours")]
    pub session_ttl_hours: i64,
    #[serde(default = "default_true")]
    pub cleanup_enabled: bool,
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
    /// Unfinished (pending/failed) records older than this are reaped.
    #[serde(default = "default_cleanup_max_age_hours")]
    pub cleanup_max_age_hours: i64,
    /// Directory where resumable-upload chunks are staged before they reach
    /// the object store.
    #[serde(default = "default_spool_dir")]
    pub spool_dir: String,
    #[serde(default = "default_resumable_ttl_hours")]
    pub resumable_ttl_hours: i64,
    #[serde(default = "default_lockout_threshold")]
    pub lockout_threshold: u32,
    #[serde(default = "default_lockout_window_secs")]
    pub lockout_window_secs: i64,
    #[serde(default = "default_lockout_duration_secs")]
    pub lockout_duration_secs: i64,
    /// Cookies carry the Secure flag when true. Disable only for local testing.
    #[serde(default = "default_true")]
    pub secure_cookies: bool,
    pub log_level: String,
}

fn default_max_upload_bytes() -> u64 {
    // 50 GiB
    50 * 1024 * 1024 * 1024
}

fn default_session_ttl_hours() -> i64 {
    12
}

fn default_true() -> bool {
    true
}

fn default_cleanup_interval_secs() -> u64 {
    3600
}

fn default_cleanup_max_age_hours() -> i64 {
    24
}

fn default_spool_dir() -> String {
    "./spool".into()
}

fn default_resumable_ttl_hours() -> i64 {
    24
}

fn default_lockout_threshold() -> u32 {
    5
}

fn default_lockout_window_secs() -> i64 {
    600
}

fn default_lockout_duration_secs() -> i64 {
    900
}

/// Returns true if the given string looks like a bcrypt hash,
/// i.e. one of the modular-crypt prefixes $2a$, $2b$ or $2y$ and 60 characters total.
pub fn is_bcrypt_hash(s: &str) -> bool {
    (s.starts_with("$2a$") || s.starts_with("$2b$") || s.starts_with("$2y$")) && s.len() == 60
}

impl AppConfiguration {
    /// Translate the log_level-String in the config.toml to the actual tracing::Level.
    /// Should that fail the app will simply fall back to INFO.
    pub fn translate_log_level(&self) -> Level {
        match self.log_level.as_str() {
            "ERROR" => Level::ERROR,
            "WARN" => Level::WARN,
            _ => Level::INFO,
        }
    }

    /// Check the whole configuration in one pass and collect every problem found.
    ///
    /// The caller is expected to fail startup if the returned Vec is non-empty;
    /// enumerating all errors at once beats fixing them one restart at a time.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.interface.trim().is_empty() {
            errors.push("'interface' must not be empty".into());
        }
        if !self.database_url.starts_with("sqlite:") {
            errors.push("'database_url' must be a sqlite URL, e.g. 'sqlite://sfdrop.db'".into());
        }
        if !(self.public_base_url.starts_with("http://")
            || self.public_base_url.starts_with("https://"))
        {
            errors.push("'public_base_url' must start with http:// or https://".into());
        }
        if self.session_secret.len() < MIN_SECRET_LEN {
            errors.push(format!(
                "'session_secret' must be at least {MIN_SECRET_LEN} characters"
            ));
        }
        if self.download_secret.len() < MIN_SECRET_LEN {
            errors.push(format!(
                "'download_secret' must be at least {MIN_SECRET_LEN} characters"
            ));
        }
        if !self.session_secret.is_empty() && self.session_secret == self.download_secret {
            errors.push("'session_secret' and 'download_secret' must differ".into());
        }
        if !is_bcrypt_hash(&self.admin_password_hash) {
            errors.push(
                "'admin_password_hash' must be a bcrypt hash ($2a$/$2b$/$2y$ prefix, 60 chars)"
                    .into(),
            );
        }
        if self.s3_endpoint.trim().is_empty() {
            errors.push("'s3_endpoint' must not be empty".into());
        }
        if self.s3_bucket.trim().is_empty() {
            errors.push("'s3_bucket' must not be empty".into());
        }
        if self.max_upload_bytes == 0 {
            errors.push("'max_upload_bytes' must be greater than zero".into());
        }
        if !matches!(self.log_level.as_str(), "INFO" | "WARN" | "ERROR") {
            errors.push("'log_level' must be one of INFO, WARN, ERROR".into());
        }

        errors
    }
}

/// Translate a filesize string to the actual number of bytes it represents.
///
/// The prompt uses suffixes 'K', 'M' and 'G' which are read as binary suffixes:
///    '25M' ->  25 MiB ->    26_214_400 Bytes
///   '250K' -> 250 KiB ->       256_000 Bytes
///     '5G' ->   5 GiB -> 5_368_709_120 Bytes
fn transform_filesize_input(input: &str) -> Option<u64> {
    // Split the string into number and suffix.
    let (number_str, suffix) = input.split_at(input.len().checked_sub(1)?);
    // Try to parse the number.
    let number = number_str.parse::<u64>().ok();
    // Next, try to parse the suffix and return the actual byte value.
    match suffix {
        "K" => number.and_then(|n| n.checked_mul(1024)),
        "M" => number.and_then(|n| n.checked_mul(1024 * 1024)),
        "G" => number.and_then(|n| n.checked_mul(1024 * 1024 * 1024)),
        _ => None,
    }
}

/// Validator for 'inquire' to check that the filesize input is valid.
fn validate_filesize_input(input: &str) -> Result<Validation, CustomUserError> {
    match transform_filesize_input(input) {
        Some(_) => Ok(Validation::Valid),
        None => Ok(Validation::Invalid(
            "Failed to parse filesize. Use values like '100K', '25M' or '5G'.".into(),
        )),
    }
}

/// Formats filesize input such as '25M' as '25M = 26214400 Bytes'.
fn format_filesize_input(input: &str) -> String {
    format!(
        "{} = {} Bytes",
        input,
        transform_filesize_input(input).unwrap_or_default()
    )
}

/// Generate a fresh URL-safe secret out of 32 bytes of strong entropy.
fn generate_secret() -> String {
    let bytes = rand::rngs::OsRng.gen::<[u8; 32]>();
    URL_SAFE_NO_PAD.encode(bytes)
}

/// The application's interactive configuration wizard started with the '--init' flag.
pub fn setup_config(config_path: &Path) -> Result<(), anyhow::Error> {
    eprintln!("Setting up new configuration at {config_path:?}");
    eprintln!("On setup completion, any previously present config file will be overwritten");
    eprintln!("Interactively prompting for all settings ...\n");

    let interface = Text::new("Interface:")
        .with_initial_value("0.0.0.0:3000")
        .with_help_message(
            "
  The interface the server will listen on.

  Examples:
    127.0.0.1:8000 -> Serve only on localhost (port 8000)
      0.0.0.0:3000 -> Serve all incoming IPv4 connections (port 3000)

  Using Docker with a reverse-proxy? Just leave this untouched.
",
        )
        .prompt()?;

    let public_base_url = Text::new("Public base URL:")
        .with_initial_value("http://localhost:3000")
        .with_help_message(
            "
  The URL under which clients reach this server.
  Used when generating absolute download links.
",
        )
        .prompt()?;

    let database_url = Text::new("Database URL:")
        .with_initial_value("sqlite://sfdrop.db")
        .with_help_message(
            "
  Connection URL for the metadata database.
  The database file is created on first start if it does not exist.
",
        )
        .prompt()?;

    let admin_password = Password::new("Admin password:")
        .with_display_mode(inquire::PasswordDisplayMode::Masked)
        .with_help_message(
            "
  Bootstrap administrator password used at the '/login'-endpoint
  with username 'admin' before any real accounts exist.

  A bcrypt-hash of your password will be stored in the generated config.
",
        )
        .prompt()?;

    let s3_endpoint = Text::new("Object store endpoint:")
        .with_initial_value("http://localhost:9000")
        .with_help_message(
            "
  URL of the S3-compatible object store holding the uploaded bytes.
  Works with MinIO, Garage, Ceph RGW and the real thing alike.
",
        )
        .prompt()?;

    let s3_region = Text::new("Object store region:")
        .with_initial_value("us-east-1")
        .prompt()?;

    let s3_access_key = Text::new("Object store access key:").prompt()?;

    let s3_secret_key = Password::new("Object store secret key:")
        .with_display_mode(inquire::PasswordDisplayMode::Masked)
        .without_confirmation()
        .prompt()?;

    let s3_bucket = Text::new("Bucket name:")
        .with_initial_value("sfdrop")
        .with_help_message(
            "
  Private bucket that stores all objects under the 'uploads/' prefix.
  Create it before the first upload; the server will not do so for you.
",
        )
        .prompt()?;

    let max_upload = Text::new("Maximum upload size:")
        .with_initial_value("1G")
        .with_validator(validate_filesize_input)
        .with_formatter(&format_filesize_input)
        .with_help_message(
            "
  Maximum number of bytes a single upload may carry.
  Streams exceeding this are terminated and the record marked failed.

  The prompt uses suffixes 'K', 'M' and 'G' which are read as binary suffixes:
    '250K' -> 250 KiB ->       256_000 Bytes
     '25M' ->  25 MiB ->    26_214_400 Bytes
      '1G' ->   1 GiB -> 1_073_741_824 Bytes
",
        )
        .prompt()?;

    let cleanup_enabled = Confirm::new("Enable background cleanup?")
        .with_default(true)
        .with_help_message(
            "
  Periodically removes stale unfinished uploads and expired files,
  both from the database and the object store.
",
        )
        .prompt()?;

    let log_levels = vec![Level::INFO, Level::WARN, Level::ERROR];
    let log_level = Select::new("Log level:", log_levels)
        .with_help_message(
            "
  Set the log level of the entire application. (↑↓ to move, enter to select)
  Unless terse logs are somehow required it is recommended to set this to INFO.

  ERROR logs all internal server errors and failures.
  WARN logs suspicious client-side errors.
  INFO logs all HTTP responses and application events, including
  file creation/deletion/expiry and login/logout.
",
        )
        .prompt()?;

    eprintln!("\nFinalizing configuration...");
    eprint!("Hashing password ...");

    let max_upload_bytes = transform_filesize_input(&max_upload)
        .ok_or_else(|| anyhow!("failed to parse maximum upload size"))?;

    // Cost 12 is a notch above the crate default.
    let admin_password_hash =
        bcrypt::hash(&admin_password, 12).map_err(|e| anyhow!("failed to hash password: {e}"))?;

    eprintln!(" done!");

    // Bring it all together. Both HMAC secrets are generated rather than
    // prompted; nobody should be typing these in by hand.
    let app_config = AppConfiguration {
        interface,
        public_base_url,
        database_url,
        session_secret: generate_secret(),
        download_secret: generate_secret(),
        admin_password_hash,
        s3_endpoint,
        s3_region,
        s3_access_key,
        s3_secret_key,
        s3_bucket,
        max_upload_bytes,
        session_ttl_hours: default_session_ttl_hours(),
        cleanup_enabled,
        cleanup_interval_secs: default_cleanup_interval_secs(),
        cleanup_max_age_hours: default_cleanup_max_age_hours(),
        spool_dir: default_spool_dir(),
        resumable_ttl_hours: default_resumable_ttl_hours(),
        lockout_threshold: default_lockout_threshold(),
        lockout_window_secs: default_lockout_window_secs(),
        lockout_duration_secs: default_lockout_duration_secs(),
        secure_cookies: true,
        log_level: log_level.to_string(),
    };

    // Serialize to TOML and write to disk as 'config.toml'.
    File::create(config_path)?.write_all(toml::to_string(&app_config)?.as_bytes())?;

    eprintln!("Successfully wrote config to {config_path:?}.");
    eprintln!("You can now launch the app.");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> AppConfiguration {
        AppConfiguration {
            interface: "127.0.0.1:3000".into(),
            public_base_url: "http://localhost:3000".into(),
            database_url: "sqlite://test.db".into(),
            session_secret: "a".repeat(32),
            download_secret: "b".repeat(32),
            admin_password_hash: format!("$2b$12${}", "x".repeat(53)),
            s3_endpoint: "http://localhost:9000".into(),
            s3_region: "us-east-1".into(),
            s3_access_key: "minioadmin".into(),
            s3_secret_key: "minioadmin".into(),
            s3_bucket: "sfdrop".into(),
            max_upload_bytes: 1024,
            session_ttl_hours: 12,
            cleanup_enabled: true,
            cleanup_interval_secs: 3600,
            cleanup_max_age_hours: 24,
            spool_dir: "./spool".into(),
            resumable_ttl_hours: 24,
            lockout_threshold: 5,
            lockout_window_secs: 600,
            lockout_duration_secs: 900,
            secure_cookies: false,
            log_level: "INFO".into(),
        }
    }

    #[test]
    fn valid_config_passes() {
        assert!(valid_config().validate().is_empty());
    }

    #[test]
    fn all_problems_are_enumerated() {
        let mut conf = valid_config();
        conf.session_secret = "short".into();
        conf.download_secret = "also-short".into();
        conf.admin_password_hash = "plaintext-oops".into();
        conf.database_url = "postgres://nope".into();
        conf.log_level = "TRACE".into();
        let errors = conf.validate();
        assert_eq!(errors.len(), 5);
    }

    #[test]
    fn identical_secrets_are_rejected() {
        let mut conf = valid_config();
        conf.download_secret = conf.session_secret.clone();
        let errors = conf.validate();
        assert!(errors.iter().any(|e| e.contains("must differ")));
    }

    #[test]
    fn bcrypt_shape_check() {
        assert!(is_bcrypt_hash(&format!("$2a$10${}", "y".repeat(53))));
        assert!(is_bcrypt_hash(&format!("$2y$10${}", "y".repeat(53))));
        assert!(!is_bcrypt_hash("$2b$12$tooshort"));
        assert!(!is_bcrypt_hash(&format!("$1$10${}", "y".repeat(56))));
    }

    #[test]
    fn filesize_suffixes() {
        assert_eq!(transform_filesize_input("25M"), Some(26_214_400));
        assert_eq!(transform_filesize_input("250K"), Some(256_000));
        assert_eq!(transform_filesize_input("5G"), Some(5_368_709_120));
        assert_eq!(transform_filesize_input("nonsense"), None);
        assert_eq!(transform_filesize_input(""), None);
    }
}
