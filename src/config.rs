//! Main configuration: INI-style load, validation, and live reload with
//! hot versus restart-required change classification.
//!
//! The live configuration is an immutable snapshot behind a lock; readers
//! clone the `Arc` and never observe a partially applied reload. A reload
//! builds a fresh snapshot from both files, validates it, then transfers
//! fields onto a copy of the live one and publishes the copy.

use std::path::Path;
use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use parking_lot::RwLock;
use tracing::{debug, info, trace, warn};

use crate::crypto::{self, Encryption};
use crate::error::{ConfigError, Result};
use crate::logging::Logging;
use crate::security::SecretStore;
use crate::{
    MAX_PASSWORD_LENGTH, MAX_PATH, MAX_USERNAME_LENGTH, MISC_LENGTH, NUMBER_OF_SERVERS,
    NUMBER_OF_USERS,
};

/// Default location of the main configuration file.
pub const DEFAULT_CONFIG_FILE_PATH: &str = "/etc/pgvictoria/pgvictoria.conf";
/// Default location of the users file.
pub const DEFAULT_USERS_FILE_PATH: &str = "/etc/pgvictoria/pgvictoria_users.conf";

/// Rotation disabled marker for size and age settings.
pub const LOG_ROTATION_DISABLED: i32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogType {
    #[default]
    Console,
    File,
    Syslog,
}

impl LogType {
    fn parse(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "file" => LogType::File,
            "syslog" => LogType::Syslog,
            _ => LogType::Console,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum LogLevel {
    Debug5,
    Debug4,
    Debug3,
    Debug2,
    Debug1,
    #[default]
    Info,
    Warn,
    Error,
    Fatal,
}

impl LogLevel {
    fn parse(value: &str) -> Self {
        let lower = value.to_ascii_lowercase();

        if let Some(rest) = lower.strip_prefix("debug") {
            // Bare "debug" or an unparsable suffix means level 1.
            let level = rest.parse::<i32>().unwrap_or(1);
            return match level {
                i32::MIN..=1 => LogLevel::Debug1,
                2 => LogLevel::Debug2,
                3 => LogLevel::Debug3,
                4 => LogLevel::Debug4,
                _ => LogLevel::Debug5,
            };
        }

        match lower.as_str() {
            "warn" => LogLevel::Warn,
            "error" => LogLevel::Error,
            "fatal" => LogLevel::Fatal,
            _ => LogLevel::Info,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogMode {
    #[default]
    Append,
    Create,
}

impl LogMode {
    fn parse(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "c" | "create" => LogMode::Create,
            _ => LogMode::Append,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Hugepage {
    #[default]
    Off,
    Try,
    On,
}

impl Hugepage {
    fn parse(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "try" => Hugepage::Try,
            "on" => Hugepage::On,
            _ => Hugepage::Off,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpdateProcessTitle {
    Never,
    Strict,
    Minimal,
    #[default]
    Verbose,
}

impl UpdateProcessTitle {
    fn parse(value: &str, default: Self) -> Self {
        match value {
            "never" | "off" => UpdateProcessTitle::Never,
            "strict" => UpdateProcessTitle::Strict,
            "minimal" => UpdateProcessTitle::Minimal,
            "verbose" | "full" => UpdateProcessTitle::Verbose,
            _ => default,
        }
    }
}

/// One backend server. Identity is `name`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub primary: bool,
    pub username: String,
    pub version: i32,
    pub minor_version: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct User {
    pub username: String,
    pub password: String,
}

/// Configuration shared between all tools of the family.
#[derive(Debug, Clone, Default)]
pub struct CommonConfiguration {
    pub home_dir: String,

    pub log_type: LogType,
    pub log_level: LogLevel,
    pub log_path: String,
    pub log_mode: LogMode,
    /// Bytes to force log rotation; 0 disables.
    pub log_rotation_size: i32,
    /// Seconds between rotations; 0 disables.
    pub log_rotation_age: i32,
    pub log_line_prefix: String,

    pub servers: Vec<ServerConfig>,
    pub users: Vec<User>,

    pub configuration_path: String,
    pub users_path: String,
}

/// The main configuration.
#[derive(Debug, Clone, Default)]
pub struct MainConfiguration {
    pub common: CommonConfiguration,

    pub running: bool,

    pub host: String,

    /// Seconds granted to a client to authenticate.
    pub authentication_timeout: i32,
    pub pidfile: String,

    pub update_process_title: UpdateProcessTitle,

    /// Preferred event engine name.
    pub libev: String,
    pub backlog: i32,
    pub hugepage: Hugepage,

    pub unix_socket_dir: String,
}

impl MainConfiguration {
    /// The defaults applied before a file is read.
    pub fn init() -> Self {
        MainConfiguration {
            running: true,
            authentication_timeout: 5,
            backlog: 16,
            hugepage: Hugepage::Try,
            update_process_title: UpdateProcessTitle::Verbose,
            common: CommonConfiguration {
                home_dir: std::env::var("HOME").unwrap_or_default(),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

/// Truncates `value` to the fixed field capacity, on a char boundary.
/// Writes truncate rather than overflow.
fn capped(value: &str, max: usize) -> String {
    if value.len() < max {
        return value.to_string();
    }

    let mut end = max - 1;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    value[..end].to_string()
}

/// Strips leading whitespace and cuts the line at a `;` or `#` comment.
fn strip_comments(line: &str) -> &str {
    let line = line.trim_start();
    let end = line.find([';', '#']).unwrap_or(line.len());
    line[..end].trim_end()
}

/// Splits a `key = value` line, stripping quotes from the value.
fn extract_key_value(line: &str) -> Option<(String, String)> {
    let (left, right) = line.split_once('=')?;

    let key = left
        .trim_matches(|c| c == ' ' || c == '\t' || c == '"' || c == '\'')
        .to_string();
    let value = right
        .trim()
        .trim_matches(|c| c == '"' || c == '\'')
        .to_string();

    if key.is_empty() {
        return None;
    }

    Some((key, value))
}

/// As [`extract_key_value`] for the system-key subset, with the value
/// path-resolved: environment variables expand in subpaths that are
/// either double-quoted or unquoted; single quotes suppress expansion.
fn extract_syskey_value(line: &str) -> std::result::Result<(String, String), ConfigError> {
    let (left, right) = line
        .split_once('=')
        .ok_or_else(|| ConfigError::Parse(format!("expected key = value: {line}")))?;

    let key = left.trim().to_string();
    let value = resolve_path(right.trim())?;

    Ok((key, value))
}

fn resolve_path(orig: &str) -> std::result::Result<String, ConfigError> {
    let mut out = String::with_capacity(orig.len());
    let mut chars = orig.chars().peekable();
    let mut in_single = false;
    let mut in_double = false;

    while let Some(c) = chars.next() {
        match c {
            '\'' if !in_double => in_single = !in_single,
            '"' if !in_single => in_double = !in_double,
            '$' if !in_single => {
                let mut name = String::new();
                while let Some(&n) = chars.peek() {
                    if n.is_ascii_alphanumeric() || n == '_' {
                        name.push(n);
                        chars.next();
                    } else {
                        break;
                    }
                }

                let value = std::env::var(&name)
                    .map_err(|_| ConfigError::Parse(format!("undefined variable ${name}")))?;
                out.push_str(&value);
            }
            c => out.push(c),
        }
    }

    Ok(out)
}

fn as_int(value: &str) -> std::result::Result<i32, ConfigError> {
    value
        .trim()
        .parse::<i32>()
        .map_err(|_| ConfigError::Parse(format!("not a number: {value}")))
}

/// Parses an age with an optional `s`/`m`/`h`/`d`/`w` suffix into
/// seconds. Unparsable input yields the default.
fn as_seconds(value: &str, default: i32) -> i32 {
    if value.is_empty() {
        return default;
    }

    let mut digits = String::new();
    let mut multiplier = 1i64;
    let mut multiplier_set = false;

    for c in value.chars() {
        if c.is_ascii_digit() && !multiplier_set {
            digits.push(c);
        } else if c.is_ascii_alphabetic() && !multiplier_set {
            multiplier = match c.to_ascii_lowercase() {
                's' => 1,
                'm' => 60,
                'h' => 3600,
                'd' => 24 * 3600,
                'w' => 24 * 3600 * 7,
                _ => return default,
            };
            multiplier_set = true;
        } else {
            return default;
        }
    }

    finish_suffixed(&digits, multiplier, default)
}

/// Parses a size with an optional `B`/`K`/`M`/`G` suffix
/// (case-insensitive; a trailing `B` on `K`/`M`/`G` is accepted) into
/// bytes. Unparsable input yields the default.
fn as_bytes(value: &str, default: i32) -> i32 {
    if value.is_empty() {
        return default;
    }

    let mut digits = String::new();
    let mut multiplier = 1i64;
    let mut multiplier_set = false;

    for c in value.chars() {
        if c.is_ascii_digit() && !multiplier_set {
            digits.push(c);
        } else if c.is_ascii_alphabetic() {
            if multiplier_set {
                // "MB" and friends carry a trailing B; "BB" does not.
                if multiplier == 1 || !c.eq_ignore_ascii_case(&'b') {
                    return default;
                }
            } else {
                multiplier = match c.to_ascii_lowercase() {
                    'b' => 1,
                    'k' => 1024,
                    'm' => 1024 * 1024,
                    'g' => 1024 * 1024 * 1024,
                    _ => return default,
                };
                multiplier_set = true;
            }
        } else {
            return default;
        }
    }

    finish_suffixed(&digits, multiplier, default)
}

fn finish_suffixed(digits: &str, multiplier: i64, default: i32) -> i32 {
    match digits.parse::<i64>() {
        Ok(v) if v >= 0 => (v * multiplier).try_into().unwrap_or(default),
        _ => default,
    }
}

const SYSTEM_KEYS: [&str; 3] = ["unix_socket_dir", "log_path", "pidfile"];

/// Reads the main configuration file into `config`.
pub fn read_main_configuration(
    config: &mut MainConfiguration,
    filename: &Path,
) -> std::result::Result<(), ConfigError> {
    let content = std::fs::read_to_string(filename)
        .map_err(|_| ConfigError::NotFound(filename.display().to_string()))?;

    let mut section = String::new();
    let mut server: Option<ServerConfig> = None;

    for raw in content.lines() {
        let line = strip_comments(raw);
        if line.is_empty() {
            continue;
        }

        if let Some(rest) = line.strip_prefix('[') {
            let Some(end) = rest.find(']') else {
                continue;
            };

            section = capped(&rest[..end], MISC_LENGTH);
            if section != "pgvictoria" {
                if let Some(done) = server.take() {
                    push_server(config, done);
                }
                server = Some(ServerConfig {
                    name: section.clone(),
                    ..Default::default()
                });
            }
            continue;
        }

        let is_system_key = SYSTEM_KEYS.iter().any(|k| line.starts_with(k));
        let pair = if is_system_key {
            extract_syskey_value(line).ok()
        } else {
            extract_key_value(line)
        };

        let Some((key, value)) = pair else {
            warn!("Unknown: Section={section}, Line={raw}");
            continue;
        };

        let known = match key.as_str() {
            "host" if section == "pgvictoria" => {
                config.host = capped(&value, MISC_LENGTH);
                true
            }
            "host" => apply_server(&mut server, |s| s.host = capped(&value, MISC_LENGTH)),
            "port" => match as_int(&value) {
                Ok(port) => apply_server(&mut server, |s| s.port = port as u16),
                Err(_) => false,
            },
            "user" => {
                apply_server(&mut server, |s| {
                    s.username = capped(&value, MAX_USERNAME_LENGTH);
                })
            }
            "pidfile" if section == "pgvictoria" => {
                config.pidfile = capped(&value, MAX_PATH);
                true
            }
            "update_process_title" if section == "pgvictoria" => {
                config.update_process_title =
                    UpdateProcessTitle::parse(&value, UpdateProcessTitle::Verbose);
                true
            }
            "log_type" if section == "pgvictoria" => {
                config.common.log_type = LogType::parse(&value);
                true
            }
            "log_level" if section == "pgvictoria" => {
                config.common.log_level = LogLevel::parse(&value);
                true
            }
            "log_path" if section == "pgvictoria" => {
                config.common.log_path = capped(&value, MISC_LENGTH);
                true
            }
            "log_rotation_size" if section == "pgvictoria" => {
                config.common.log_rotation_size = as_bytes(&value, LOG_ROTATION_DISABLED);
                true
            }
            "log_rotation_age" if section == "pgvictoria" => {
                config.common.log_rotation_age = as_seconds(&value, LOG_ROTATION_DISABLED);
                true
            }
            "log_line_prefix" if section == "pgvictoria" => {
                config.common.log_line_prefix = capped(&value, MISC_LENGTH);
                true
            }
            "log_mode" if section == "pgvictoria" => {
                config.common.log_mode = LogMode::parse(&value);
                true
            }
            "unix_socket_dir" if section == "pgvictoria" => {
                config.unix_socket_dir = capped(&value, MISC_LENGTH);
                true
            }
            "libev" if section == "pgvictoria" => {
                config.libev = capped(&value, MISC_LENGTH);
                true
            }
            "backlog" if section == "pgvictoria" => match as_int(&value) {
                Ok(backlog) => {
                    config.backlog = backlog;
                    true
                }
                Err(_) => false,
            },
            "hugepage" if section == "pgvictoria" => {
                config.hugepage = Hugepage::parse(&value);
                true
            }
            _ => false,
        };

        if !known {
            let section = if section.is_empty() { "<unknown>" } else { &section };
            warn!("Unknown: Section={section}, Key={key}, Value={value}");
        }
    }

    if let Some(done) = server.take() {
        push_server(config, done);
    }

    Ok(())
}

fn push_server(config: &mut MainConfiguration, server: ServerConfig) {
    if config.common.servers.len() >= NUMBER_OF_SERVERS {
        warn!("Maximum number of servers exceeded");
        return;
    }

    config.common.servers.push(server);
}

fn apply_server(server: &mut Option<ServerConfig>, f: impl FnOnce(&mut ServerConfig)) -> bool {
    match server {
        Some(server) => {
            f(server);
            true
        }
        None => false,
    }
}

/// Validates the loaded main configuration; the backlog is clamped.
pub fn validate_main_configuration(
    config: &mut MainConfiguration,
) -> std::result::Result<(), ConfigError> {
    if config.host.is_empty() {
        return Err(ConfigError::Validation("no host defined".into()));
    }

    if config.unix_socket_dir.is_empty() {
        return Err(ConfigError::Validation("no unix_socket_dir defined".into()));
    }

    if !Path::new(&config.unix_socket_dir).is_dir() {
        return Err(ConfigError::Validation(format!(
            "unix_socket_dir is not a directory ({})",
            config.unix_socket_dir
        )));
    }

    if config.backlog < 16 {
        config.backlog = 16;
    }

    if config.common.servers.is_empty() {
        return Err(ConfigError::Validation("no servers defined".into()));
    }

    for server in &config.common.servers {
        if server.name == "pgvictoria" || server.name == "all" {
            return Err(ConfigError::Validation(format!(
                "{} is a reserved word for a host",
                server.name
            )));
        }

        if server.host.is_empty() {
            return Err(ConfigError::Validation(format!(
                "no host defined for {}",
                server.name
            )));
        }

        if server.port == 0 {
            return Err(ConfigError::Validation(format!(
                "no port defined for {}",
                server.name
            )));
        }

        if server.username.is_empty() {
            return Err(ConfigError::Validation(format!(
                "no user defined for {}",
                server.name
            )));
        }
    }

    Ok(())
}

/// Reads the users file: one `username:base64(aes256cbc(password))` line
/// per user, decrypted with the master key.
pub fn read_users_configuration(
    config: &mut MainConfiguration,
    filename: &Path,
    secrets: &dyn SecretStore,
) -> std::result::Result<(), ConfigError> {
    let content = std::fs::read_to_string(filename)
        .map_err(|_| ConfigError::NotFound(filename.display().to_string()))?;

    let master_key = secrets.master_key().map_err(|_| ConfigError::MasterKey)?;

    let mut users = Vec::new();
    let mut entries = 0usize;

    for raw in content.lines() {
        let line = strip_comments(raw);
        if line.is_empty() {
            continue;
        }

        let (username, encoded) = line
            .split_once(':')
            .ok_or_else(|| ConfigError::Parse(format!("expected username:password: {raw}")))?;

        let decoded = BASE64
            .decode(encoded)
            .map_err(|e| ConfigError::Parse(format!("invalid base64 for {username}: {e}")))?;

        let password = crypto::decrypt(&decoded, &master_key, Encryption::Aes256Cbc)
            .map_err(|e| ConfigError::Parse(format!("could not decrypt password: {e}")))?;
        let password = String::from_utf8(password)
            .map_err(|_| ConfigError::Parse(format!("password for {username} is not UTF-8")))?;

        entries += 1;

        if username.len() < MAX_USERNAME_LENGTH && password.len() < MAX_PASSWORD_LENGTH {
            users.push(User {
                username: username.to_string(),
                password,
            });
        } else {
            warn!("Invalid USER entry");
            warn!("{raw}");
        }
    }

    if entries > NUMBER_OF_USERS {
        return Err(ConfigError::TooManyUsers(entries));
    }

    config.common.users = users;

    Ok(())
}

/// Validates the user table against the server table.
pub fn validate_users_configuration(
    config: &MainConfiguration,
) -> std::result::Result<(), ConfigError> {
    if config.common.users.is_empty() {
        return Err(ConfigError::Validation("no users defined".into()));
    }

    for server in &config.common.servers {
        let known = config
            .common
            .users
            .iter()
            .any(|u| u.username == server.username);

        if !known {
            return Err(ConfigError::Validation(format!(
                "unknown user ('{}') defined for {}",
                server.username, server.name
            )));
        }
    }

    Ok(())
}

/// The live configuration snapshot.
pub struct ConfigStore {
    current: RwLock<Arc<MainConfiguration>>,
}

impl ConfigStore {
    pub fn new(config: MainConfiguration) -> Self {
        ConfigStore {
            current: RwLock::new(Arc::new(config)),
        }
    }

    /// Clones out the current snapshot.
    pub fn load(&self) -> Arc<MainConfiguration> {
        self.current.read().clone()
    }

    /// Re-reads both configuration files and applies the result.
    ///
    /// Returns whether a process restart is required. A failing reload
    /// leaves the live snapshot untouched; callers must treat the error
    /// as restart-required.
    pub fn reload(&self, secrets: &dyn SecretStore, logging: Option<&Logging>) -> Result<bool> {
        let current = self.load();

        trace!("Configuration: {}", current.common.configuration_path);
        trace!("Users: {}", current.common.users_path);

        let result = self.try_reload(&current, secrets, logging);

        match &result {
            Ok(_) => debug!("Reload: Success"),
            Err(_) => debug!("Reload: Failure"),
        }

        result
    }

    fn try_reload(
        &self,
        current: &MainConfiguration,
        secrets: &dyn SecretStore,
        logging: Option<&Logging>,
    ) -> Result<bool> {
        let mut fresh = MainConfiguration::init();

        read_main_configuration(&mut fresh, Path::new(&current.common.configuration_path))?;
        read_users_configuration(&mut fresh, Path::new(&current.common.users_path), secrets)?;
        validate_main_configuration(&mut fresh)?;
        validate_users_configuration(&fresh)?;

        fresh.common.configuration_path = current.common.configuration_path.clone();
        fresh.common.users_path = current.common.users_path.clone();

        let mut next = current.clone();
        let restart = transfer_configuration(&mut next, &fresh, logging);
        *self.current.write() = Arc::new(next);

        Ok(restart)
    }
}

/// Applies a freshly loaded configuration onto the live one.
///
/// Hot fields are copied silently. The log-routing set restarts the
/// logger around the copy. Everything else is restart-required: the
/// change is applied, logged with old and new values, and the returned
/// flag is raised.
pub fn transfer_configuration(
    config: &mut MainConfiguration,
    reload: &MainConfiguration,
    logging: Option<&Logging>,
) -> bool {
    let mut changed = false;

    if restart_value("host", &config.host, &reload.host) {
        changed = true;
    }
    config.host = reload.host.clone();

    if restart_value("log_type", &config.common.log_type, &reload.common.log_type) {
        changed = true;
    }
    config.common.log_type = reload.common.log_type;

    if config.common.log_level != reload.common.log_level {
        config.common.log_level = reload.common.log_level;
        if let Some(logging) = logging {
            logging.set_level(config.common.log_level);
        }
    }

    if config.common.log_path != reload.common.log_path
        || config.common.log_rotation_size != reload.common.log_rotation_size
        || config.common.log_rotation_age != reload.common.log_rotation_age
        || config.common.log_mode != reload.common.log_mode
        || config.common.log_line_prefix != reload.common.log_line_prefix
    {
        debug!("Log restart triggered!");
        config.common.log_path = reload.common.log_path.clone();
        config.common.log_rotation_size = reload.common.log_rotation_size;
        config.common.log_rotation_age = reload.common.log_rotation_age;
        config.common.log_mode = reload.common.log_mode;
        config.common.log_line_prefix = reload.common.log_line_prefix.clone();

        if let Some(logging) = logging {
            logging.restart(&config.common);
        }
    }

    config.authentication_timeout = reload.authentication_timeout;

    if !reload.pidfile.is_empty() {
        if restart_value("pidfile", &config.pidfile, &reload.pidfile) {
            changed = true;
        }
        config.pidfile = reload.pidfile.clone();
    }

    if restart_value("libev", &config.libev, &reload.libev) {
        changed = true;
    }
    config.libev = reload.libev.clone();

    config.backlog = reload.backlog;

    if restart_value("hugepage", &config.hugepage, &reload.hugepage) {
        changed = true;
    }
    config.hugepage = reload.hugepage;

    if restart_value(
        "update_process_title",
        &config.update_process_title,
        &reload.update_process_title,
    ) {
        changed = true;
    }
    config.update_process_title = reload.update_process_title;

    if restart_value("unix_socket_dir", &config.unix_socket_dir, &reload.unix_socket_dir) {
        changed = true;
    }
    config.unix_socket_dir = reload.unix_socket_dir.clone();

    let servers = config.common.servers.len().max(reload.common.servers.len());
    for i in 0..servers {
        let existing = config.common.servers.get(i).cloned().unwrap_or_default();
        let incoming = reload.common.servers.get(i).cloned().unwrap_or_default();

        if server_changed(&existing, &incoming) {
            changed = true;
        }
    }
    if restart_value(
        "number_of_servers",
        &config.common.servers.len(),
        &reload.common.servers.len(),
    ) {
        changed = true;
    }
    config.common.servers = reload.common.servers.clone();

    config.common.users = reload.common.users.clone();

    changed
}

fn server_changed(existing: &ServerConfig, incoming: &ServerConfig) -> bool {
    let mut changed = false;

    if restart_value("name", &existing.name, &incoming.name) {
        changed = true;
    }
    if restart_value("host", &existing.host, &incoming.host) {
        changed = true;
    }
    if restart_value("port", &existing.port, &incoming.port) {
        changed = true;
    }
    if restart_value("username", &existing.username, &incoming.username) {
        changed = true;
    }

    changed
}

fn restart_value<T: PartialEq + std::fmt::Debug>(name: &str, existing: &T, new: &T) -> bool {
    if existing != new {
        info!("Restart required for {name} - Existing {existing:?} New {new:?}");
        return true;
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::tests::FixedKey;
    use std::io::Write;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    fn sample(unix_socket_dir: &str) -> String {
        format!(
            "# pgvictoria sample\n\
             [pgvictoria]\n\
             host = *\n\
             unix_socket_dir = {unix_socket_dir}\n\
             log_type = console\n\
             log_level = debug3  ; inline comment\n\
             log_rotation_size = 2M\n\
             log_rotation_age = 1d\n\
             backlog = 64\n\
             hugepage = try\n\
             update_process_title = minimal\n\
             \n\
             [primary]\n\
             host = localhost\n\
             port = 5432\n\
             user = repl\n\
             \n\
             [standby]\n\
             host = \"10.0.0.2\"\n\
             port = 5433\n\
             user = repl\n"
        )
    }

    #[test]
    fn test_read_main_configuration() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_config(&sample(&dir.path().display().to_string()));

        let mut config = MainConfiguration::init();
        read_main_configuration(&mut config, file.path()).unwrap();

        assert_eq!("*", config.host);
        assert_eq!(LogType::Console, config.common.log_type);
        assert_eq!(LogLevel::Debug3, config.common.log_level);
        assert_eq!(2 * 1024 * 1024, config.common.log_rotation_size);
        assert_eq!(24 * 3600, config.common.log_rotation_age);
        assert_eq!(64, config.backlog);
        assert_eq!(Hugepage::Try, config.hugepage);
        assert_eq!(UpdateProcessTitle::Minimal, config.update_process_title);

        assert_eq!(2, config.common.servers.len());
        assert_eq!("primary", config.common.servers[0].name);
        assert_eq!("localhost", config.common.servers[0].host);
        assert_eq!(5432, config.common.servers[0].port);
        assert_eq!("repl", config.common.servers[0].username);
        assert_eq!("10.0.0.2", config.common.servers[1].host);

        validate_main_configuration(&mut config).unwrap();
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let mut config = MainConfiguration::init();
        let err = read_main_configuration(&mut config, Path::new("/nonexistent.conf")).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }

    #[test]
    fn test_syskey_expands_environment() {
        // SAFETY: test-local variable, no concurrent reader depends on it.
        unsafe { std::env::set_var("PGVICTORIA_TEST_DIR", "/tmp") };

        let file = write_config(
            "[pgvictoria]\nhost = *\nunix_socket_dir = $PGVICTORIA_TEST_DIR/sockets\n",
        );

        let mut config = MainConfiguration::init();
        read_main_configuration(&mut config, file.path()).unwrap();
        assert_eq!("/tmp/sockets", config.unix_socket_dir);
    }

    #[test]
    fn test_single_quotes_suppress_expansion() {
        assert_eq!("$HOME/x", resolve_path("'$HOME/x'").unwrap());
    }

    #[test]
    fn test_log_level_parsing() {
        assert_eq!(LogLevel::Debug1, LogLevel::parse("debug"));
        assert_eq!(LogLevel::Debug1, LogLevel::parse("debug1"));
        assert_eq!(LogLevel::Debug2, LogLevel::parse("DEBUG2"));
        assert_eq!(LogLevel::Debug5, LogLevel::parse("debug7"));
        assert_eq!(LogLevel::Info, LogLevel::parse("info"));
        assert_eq!(LogLevel::Warn, LogLevel::parse("warn"));
        assert_eq!(LogLevel::Error, LogLevel::parse("error"));
        assert_eq!(LogLevel::Fatal, LogLevel::parse("fatal"));
        assert_eq!(LogLevel::Info, LogLevel::parse("bogus"));
    }

    #[test]
    fn test_size_suffixes() {
        assert_eq!(512, as_bytes("512", -1));
        assert_eq!(512, as_bytes("512B", -1));
        assert_eq!(2048, as_bytes("2k", -1));
        assert_eq!(2048, as_bytes("2KB", -1));
        assert_eq!(3 * 1024 * 1024, as_bytes("3M", -1));
        assert_eq!(1024 * 1024 * 1024, as_bytes("1g", -1));
        assert_eq!(-1, as_bytes("1BB", -1));
        assert_eq!(-1, as_bytes("junk", -1));
        assert_eq!(-1, as_bytes("1x", -1));
    }

    #[test]
    fn test_age_suffixes() {
        assert_eq!(30, as_seconds("30", -1));
        assert_eq!(30, as_seconds("30s", -1));
        assert_eq!(120, as_seconds("2m", -1));
        assert_eq!(7200, as_seconds("2H", -1));
        assert_eq!(86400, as_seconds("1d", -1));
        assert_eq!(604800, as_seconds("1w", -1));
        assert_eq!(-1, as_seconds("1q", -1));
    }

    #[test]
    fn test_reserved_server_names() {
        for reserved in ["pgvictoria", "all"] {
            let dir = tempfile::tempdir().unwrap();
            let file = write_config(&format!(
                "[pgvictoria]\nhost = *\nunix_socket_dir = {}\n\n[{reserved}]\nhost = h\nport = 5\nuser = u\n",
                dir.path().display()
            ));

            let mut config = MainConfiguration::init();
            // The section named "pgvictoria" is the main section, so only
            // "all" makes it into the server table.
            read_main_configuration(&mut config, file.path()).unwrap();
            if config.common.servers.is_empty() {
                continue;
            }
            assert!(validate_main_configuration(&mut config).is_err());
        }
    }

    #[test]
    fn test_validation_requires_servers() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = MainConfiguration::init();
        config.host = "*".into();
        config.unix_socket_dir = dir.path().display().to_string();

        assert!(matches!(
            validate_main_configuration(&mut config),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn test_backlog_clamped() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = MainConfiguration::init();
        config.host = "*".into();
        config.unix_socket_dir = dir.path().display().to_string();
        config.backlog = 2;
        config.common.servers.push(ServerConfig {
            name: "primary".into(),
            host: "localhost".into(),
            port: 5432,
            username: "repl".into(),
            ..Default::default()
        });

        validate_main_configuration(&mut config).unwrap();
        assert_eq!(16, config.backlog);
    }

    fn users_line(username: &str, password: &str, master_key: &str) -> String {
        let ciphertext = crypto::encrypt(password.as_bytes(), master_key, Encryption::Aes256Cbc).unwrap();
        format!("{username}:{}", BASE64.encode(ciphertext))
    }

    #[test]
    fn test_read_users_configuration() {
        let file = write_config(&users_line("alice", "secret", "topsecret"));

        let mut config = MainConfiguration::init();
        let secrets = FixedKey("topsecret".into());
        read_users_configuration(&mut config, file.path(), &secrets).unwrap();

        assert_eq!(1, config.common.users.len());
        assert_eq!("alice", config.common.users[0].username);
        assert_eq!("secret", config.common.users[0].password);
    }

    #[test]
    fn test_users_file_bound_is_distinct() {
        let mut content = String::new();
        for i in 0..=NUMBER_OF_USERS {
            content.push_str(&users_line(&format!("user{i}"), "pw", "k"));
            content.push('\n');
        }
        let file = write_config(&content);

        let mut config = MainConfiguration::init();
        let err = read_users_configuration(&mut config, file.path(), &FixedKey("k".into()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::TooManyUsers(n) if n == NUMBER_OF_USERS + 1));
    }

    #[test]
    fn test_users_missing_master_key_is_distinct() {
        let file = write_config("alice:AAAA\n");

        let mut config = MainConfiguration::init();
        let err = read_users_configuration(&mut config, file.path(), &crate::security::tests::NoKey)
            .unwrap_err();
        assert!(matches!(err, ConfigError::MasterKey));
    }

    #[test]
    fn test_validate_users_requires_known_server_user() {
        let mut config = MainConfiguration::init();
        config.common.servers.push(ServerConfig {
            name: "primary".into(),
            username: "repl".into(),
            ..Default::default()
        });
        config.common.users.push(User {
            username: "alice".into(),
            password: "pw".into(),
        });

        assert!(validate_users_configuration(&config).is_err());

        config.common.users.push(User {
            username: "repl".into(),
            password: "pw".into(),
        });
        assert!(validate_users_configuration(&config).is_ok());
    }

    fn baseline() -> MainConfiguration {
        let mut config = MainConfiguration::init();
        config.host = "*".into();
        config.unix_socket_dir = "/tmp".into();
        config.common.servers.push(ServerConfig {
            name: "primary".into(),
            host: "localhost".into(),
            port: 5432,
            username: "repl".into(),
            ..Default::default()
        });
        config.common.users.push(User {
            username: "repl".into(),
            password: "pw".into(),
        });
        config
    }

    #[test]
    fn test_transfer_hot_fields_do_not_restart() {
        let mut live = baseline();
        let mut fresh = baseline();
        fresh.common.log_level = LogLevel::Debug5;
        fresh.authentication_timeout = 30;
        fresh.backlog = 128;
        fresh.common.users[0].password = "rotated".into();

        assert!(!transfer_configuration(&mut live, &fresh, None));
        assert_eq!(LogLevel::Debug5, live.common.log_level);
        assert_eq!(30, live.authentication_timeout);
        assert_eq!(128, live.backlog);
        assert_eq!("rotated", live.common.users[0].password);
    }

    #[test]
    fn test_transfer_restart_fields() {
        let changes: [fn(&mut MainConfiguration); 8] = [
            |c: &mut MainConfiguration| c.host = "127.0.0.1".into(),
            |c: &mut MainConfiguration| c.common.log_type = LogType::File,
            |c: &mut MainConfiguration| c.libev = "epoll".into(),
            |c: &mut MainConfiguration| c.hugepage = Hugepage::On,
            |c: &mut MainConfiguration| c.update_process_title = UpdateProcessTitle::Never,
            |c: &mut MainConfiguration| c.unix_socket_dir = "/var/run".into(),
            |c: &mut MainConfiguration| c.common.servers[0].port = 5433,
            |c: &mut MainConfiguration| {
                c.common.servers.push(ServerConfig {
                    name: "standby".into(),
                    host: "h".into(),
                    port: 5434,
                    username: "repl".into(),
                    ..Default::default()
                })
            },
        ];

        for change in changes {
            let mut live = baseline();
            let mut fresh = baseline();
            change(&mut fresh);

            assert!(transfer_configuration(&mut live, &fresh, None));
        }
    }

    #[test]
    fn test_transfer_applies_new_values() {
        let mut live = baseline();
        let mut fresh = baseline();
        fresh.host = "127.0.0.1".into();

        transfer_configuration(&mut live, &fresh, None);
        assert_eq!("127.0.0.1", live.host);
    }

    #[test]
    fn test_store_reload_failure_keeps_snapshot() {
        let mut config = baseline();
        config.common.configuration_path = "/nonexistent.conf".into();
        config.common.users_path = "/nonexistent_users.conf".into();

        let store = ConfigStore::new(config);
        let before = store.load();

        assert!(store.reload(&FixedKey("k".into()), None).is_err());
        assert!(Arc::ptr_eq(&before, &store.load()));
    }

    #[test]
    fn test_capped_truncates() {
        let long = "x".repeat(MISC_LENGTH * 2);
        assert_eq!(MISC_LENGTH - 1, capped(&long, MISC_LENGTH).len());
        assert_eq!("short", capped("short", MISC_LENGTH));
    }
}
