//! Validation of user-supplied MCP server launch specs.
//!
//! Everything here is pure: identical input yields an identical verdict, and
//! nothing is spawned, persisted or logged with side effects. A spec must
//! pass `validate_spec` before it is written to the config store, and the
//! store write must be acknowledged before any subprocess is launched.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex_lite::Regex;
use relay_protocol::ServerSpec;
use thiserror::Error;

/// Closed set of launchable commands: package-exec runners, interpreters and
/// the container launcher. Anything else is rejected outright.
pub const COMMAND_WHITELIST: &[&str] = &["npx", "uvx", "uv", "node", "python", "docker"];

/// Absolute path prefixes a server argument may point into.
pub const ALLOWED_PATH_ROOTS: &[&str] = &["/tmp", "/var/tmp", "/opt/mcp", "/workspace"];

const MAX_ARGS: usize = 50;
const MAX_ENV_ENTRIES: usize = 50;
const MAX_ARG_LEN: usize = 1024;
const MAX_ENV_VALUE_LEN: usize = 1024;

/// Characters that end, chain or substitute shell commands. Args and env
/// values containing any of these are rejected no matter the command.
const SHELL_METACHARACTERS: &[char] = &[
    ';', '|', '&', '`', '$', '(', ')', '{', '}', '<', '>', '\\', '\'', '"', '\n', '\r', '\0',
];

/// Env keys that change how the loader, interpreters or TLS verification
/// behave in the child. Matching keys fail the whole spec.
const ENV_KEY_BLOCKLIST: &[&str] = &[
    "PATH",
    "PYTHONPATH",
    "PYTHONHOME",
    "PYTHONSTARTUP",
    "PYTHONIOENCODING",
    "NODE_OPTIONS",
    "NODE_PATH",
    "BASH_ENV",
    "ENV",
    "IFS",
    "LANG",
    "LC_ALL",
    "SSL_CERT_FILE",
    "SSL_CERT_DIR",
    "REQUESTS_CA_BUNDLE",
    "CURL_CA_BUNDLE",
];

/// Blocked key prefixes: dynamic-loader knobs on Linux (`LD_*`) and macOS
/// (`DYLD_*`).
const ENV_KEY_BLOCKED_PREFIXES: &[&str] = &["LD_", "DYLD_"];

/// The patterns are compile-time constants; a parse failure is a programmer
/// error caught by the test suite.
#[expect(clippy::unwrap_used)]
fn compile(pattern: &str) -> Regex {
    Regex::new(pattern).unwrap()
}

static SERVER_ID_RE: LazyLock<Regex> = LazyLock::new(|| compile(r"^[A-Za-z0-9_-]{1,64}$"));

static ENV_KEY_RE: LazyLock<Regex> = LazyLock::new(|| compile(r"^[A-Z][A-Z0-9_]{0,127}$"));

static ARG_SAFE_RE: LazyLock<Regex> = LazyLock::new(|| compile(r"^[A-Za-z0-9_@./:=,+-]*$"));

/// Docker additionally needs brackets for IPv6 binds in port mappings
/// (`-p [::1]:8080:80`).
static DOCKER_ARG_SAFE_RE: LazyLock<Regex> =
    LazyLock::new(|| compile(r"^[A-Za-z0-9_@./:=,+\[\]-]*$"));

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("command `{0}` is not on the whitelist")]
    UnknownCommand(String),

    #[error("server_id must be 1-64 chars from [A-Za-z0-9_-]")]
    BadServerId,

    #[error("argument rejected: {0}")]
    BadArg(String),

    #[error("env key rejected: {0}")]
    BadEnvKey(String),

    #[error("env value for `{0}` rejected: {1}")]
    BadEnvValue(String, String),

    #[error("argument escapes the allowed workspace roots: {0}")]
    PathTraversal(String),

    #[error("too many {0} (limit {1})")]
    TooMany(&'static str, usize),
}

impl ValidationError {
    pub fn kind(&self) -> &'static str {
        match self {
            ValidationError::UnknownCommand(_) => "validation:unknown-command",
            ValidationError::BadServerId => "validation:bad-server-id",
            ValidationError::BadArg(_) => "validation:bad-arg",
            ValidationError::BadEnvKey(_) => "validation:bad-env-key",
            ValidationError::BadEnvValue(..) => "validation:bad-env-value",
            ValidationError::PathTraversal(_) => "validation:path-traversal",
            ValidationError::TooMany(..) => "validation:too-many",
        }
    }
}

/// Full-spec entry point; the order of checks is part of the contract
/// (cheapest first, and an unknown command is reported before its args).
pub fn validate_spec(spec: &ServerSpec) -> Result<(), ValidationError> {
    if !SERVER_ID_RE.is_match(&spec.server_id) {
        return Err(ValidationError::BadServerId);
    }
    if !COMMAND_WHITELIST.contains(&spec.command.as_str()) {
        return Err(ValidationError::UnknownCommand(spec.command.clone()));
    }
    validate_args_for_command(&spec.command, &spec.args)?;
    validate_env(&spec.env)?;
    Ok(())
}

pub fn validate_args_for_command(command: &str, args: &[String]) -> Result<(), ValidationError> {
    if args.len() > MAX_ARGS {
        return Err(ValidationError::TooMany("args", MAX_ARGS));
    }

    let safe_class: &Regex = if command == "docker" {
        &DOCKER_ARG_SAFE_RE
    } else {
        &ARG_SAFE_RE
    };

    for arg in args {
        if arg.len() > MAX_ARG_LEN {
            return Err(ValidationError::BadArg(format!(
                "argument exceeds {MAX_ARG_LEN} bytes"
            )));
        }
        if arg.contains(SHELL_METACHARACTERS) {
            return Err(ValidationError::BadArg(truncate_for_report(arg)));
        }
        if !safe_class.is_match(arg) {
            return Err(ValidationError::BadArg(truncate_for_report(arg)));
        }
        check_path_traversal(arg)?;
    }
    Ok(())
}

pub fn validate_env(env: &HashMap<String, String>) -> Result<(), ValidationError> {
    if env.len() > MAX_ENV_ENTRIES {
        return Err(ValidationError::TooMany("env entries", MAX_ENV_ENTRIES));
    }

    for (key, value) in env {
        if !ENV_KEY_RE.is_match(key) {
            return Err(ValidationError::BadEnvKey(key.clone()));
        }
        if ENV_KEY_BLOCKLIST.contains(&key.as_str())
            || ENV_KEY_BLOCKED_PREFIXES
                .iter()
                .any(|prefix| key.starts_with(prefix))
        {
            return Err(ValidationError::BadEnvKey(key.clone()));
        }
        if value.len() > MAX_ENV_VALUE_LEN {
            return Err(ValidationError::BadEnvValue(
                key.clone(),
                format!("value exceeds {MAX_ENV_VALUE_LEN} bytes"),
            ));
        }
        if value.contains(SHELL_METACHARACTERS) {
            return Err(ValidationError::BadEnvValue(
                key.clone(),
                "value contains shell metacharacters".to_string(),
            ));
        }
    }
    Ok(())
}

fn check_path_traversal(arg: &str) -> Result<(), ValidationError> {
    if arg.contains("../") || arg == ".." || arg.starts_with("~/") || arg == "~" {
        return Err(ValidationError::PathTraversal(truncate_for_report(arg)));
    }
    if arg.starts_with('/') {
        let inside_allowed_root = ALLOWED_PATH_ROOTS.iter().any(|root| {
            arg == *root || arg.starts_with(&format!("{root}/"))
        });
        if !inside_allowed_root {
            return Err(ValidationError::PathTraversal(truncate_for_report(arg)));
        }
    }
    Ok(())
}

/// Rejected values are echoed back in error bodies; cap what we echo so a
/// hostile kilobyte arg cannot bloat logs or responses.
fn truncate_for_report(arg: &str) -> String {
    const MAX_REPORT: usize = 80;
    if arg.len() <= MAX_REPORT {
        arg.to_string()
    } else {
        let cut: String = arg.chars().take(MAX_REPORT).collect();
        format!("{cut}…")
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used)]
    use pretty_assertions::assert_eq;

    use super::*;

    fn spec(command: &str, args: &[&str]) -> ServerSpec {
        ServerSpec {
            server_id: "fs".to_string(),
            server_name: "files".to_string(),
            command: command.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            env: HashMap::new(),
        }
    }

    #[test]
    fn accepts_a_typical_npx_launcher() {
        let spec = spec("npx", &["-y", "mcp-server-filesystem", "/tmp"]);
        assert_eq!(validate_spec(&spec), Ok(()));
    }

    #[test]
    fn rejects_unknown_commands() {
        let err = validate_spec(&spec("bash", &["-c", "true"])).expect_err("must reject");
        assert_eq!(err.kind(), "validation:unknown-command");
    }

    #[test]
    fn rejects_shell_metacharacters_in_args() {
        for bad in [
            "a;b",
            "a|b",
            "`id`",
            "$(id)",
            "a&b",
            "a\0b",
            "import os; os.system('id')",
        ] {
            let err = validate_args_for_command("python", &["-c".to_string(), bad.to_string()])
                .expect_err(bad);
            assert_eq!(err.kind(), "validation:bad-arg", "arg: {bad}");
        }
    }

    #[test]
    fn rejects_traversal_and_home_escapes() {
        for bad in ["../etc/passwd", "~/secrets", "/etc/passwd", "/tmpfoo"] {
            let err = validate_args_for_command("npx", &[bad.to_string()]).expect_err(bad);
            assert_eq!(err.kind(), "validation:path-traversal", "arg: {bad}");
        }
        // Allowed roots themselves and their children pass.
        assert!(validate_args_for_command("npx", &["/tmp".to_string()]).is_ok());
        assert!(validate_args_for_command("npx", &["/tmp/data".to_string()]).is_ok());
    }

    #[test]
    fn docker_gets_brackets_nobody_else_does() {
        assert!(validate_args_for_command("docker", &["-p".into(), "[::1]:8080:80".into()]).is_ok());
        let err = validate_args_for_command("npx", &["[x]".to_string()]).expect_err("npx brackets");
        assert_eq!(err.kind(), "validation:bad-arg");
    }

    #[test]
    fn rejects_hijacking_env_keys() {
        for key in ["LD_PRELOAD", "DYLD_INSERT_LIBRARIES", "PATH", "PYTHONPATH"] {
            let env = HashMap::from([(key.to_string(), "x".to_string())]);
            let err = validate_env(&env).expect_err(key);
            assert_eq!(err.kind(), "validation:bad-env-key", "key: {key}");
        }
    }

    #[test]
    fn rejects_malformed_env_keys_and_values() {
        let lowercase = HashMap::from([("weird".to_string(), "x".to_string())]);
        assert_eq!(
            validate_env(&lowercase).expect_err("lowercase key").kind(),
            "validation:bad-env-key"
        );

        let injected = HashMap::from([("API_URL".to_string(), "$(curl evil)".to_string())]);
        assert_eq!(
            validate_env(&injected).expect_err("injected value").kind(),
            "validation:bad-env-value"
        );
    }

    #[test]
    fn enforces_size_ceilings() {
        let args: Vec<String> = (0..51).map(|i| format!("a{i}")).collect();
        assert_eq!(
            validate_args_for_command("npx", &args)
                .expect_err("51 args")
                .kind(),
            "validation:too-many"
        );

        let env: HashMap<String, String> =
            (0..51).map(|i| (format!("K{i}"), "v".to_string())).collect();
        assert_eq!(
            validate_env(&env).expect_err("51 env entries").kind(),
            "validation:too-many"
        );

        let long_arg = "a".repeat(1025);
        assert_eq!(
            validate_args_for_command("npx", &[long_arg])
                .expect_err("long arg")
                .kind(),
            "validation:bad-arg"
        );
    }

    #[test]
    fn rejects_bad_server_ids() {
        let mut bad = spec("npx", &[]);
        bad.server_id = "has spaces".to_string();
        assert_eq!(
            validate_spec(&bad).expect_err("spaces").kind(),
            "validation:bad-server-id"
        );
        bad.server_id = String::new();
        assert_eq!(
            validate_spec(&bad).expect_err("empty").kind(),
            "validation:bad-server-id"
        );
        bad.server_id = "x".repeat(65);
        assert_eq!(
            validate_spec(&bad).expect_err("too long").kind(),
            "validation:bad-server-id"
        );
    }

    #[test]
    fn verdicts_are_deterministic() {
        let candidate = spec("python", &["-m", "my_server"]);
        let first = validate_spec(&candidate);
        for _ in 0..10 {
            assert_eq!(validate_spec(&candidate), first);
        }
    }
}
