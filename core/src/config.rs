use std::collections::HashSet;

use crate::error::MoodleError;

/// Course that write operations default to in development.
const DEFAULT_DEV_COURSE_ALLOWLIST: &str = "7299";

/// Which Moodle instance the process talks to.
///
/// Mode selection is security-sensitive: only the exact string `prod`
/// (after lowercase + trim) selects Production. Every other value,
/// including near-misses like `production`, resolves to Development so a
/// typo can never point writes at the live instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    pub fn from_mode(raw: &str) -> Self {
        if raw.trim().to_lowercase() == "prod" {
            Environment::Production
        } else {
            Environment::Development
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Environment::Development => "DEVELOPMENT",
            Environment::Production => "PRODUCTION",
        }
    }

    pub fn is_production(self) -> bool {
        self == Environment::Production
    }
}

/// Write-safety policy, fixed for the process lifetime.
///
/// Development: writes only to allow-listed course ids. Production: writes
/// disabled unless `prod_allow_writes` is set. The restrictive branch is
/// always the default.
#[derive(Debug, Clone)]
pub struct WritePolicy {
    pub environment: Environment,
    pub dev_course_allowlist: HashSet<i64>,
    pub prod_allow_writes: bool,
}

impl WritePolicy {
    pub fn new(
        environment: Environment,
        dev_course_allowlist: impl IntoIterator<Item = i64>,
        prod_allow_writes: bool,
    ) -> Self {
        Self {
            environment,
            dev_course_allowlist: dev_course_allowlist.into_iter().collect(),
            prod_allow_writes,
        }
    }

    /// Whether a mutating call targeting `course_id` is allowed.
    pub fn can_write(&self, course_id: i64) -> bool {
        match self.environment {
            Environment::Production => self.prod_allow_writes,
            Environment::Development => self.dev_course_allowlist.contains(&course_id),
        }
    }

    /// Whether mutating calls with no pre-existing course target (course
    /// creation) are allowed in the current mode.
    pub fn can_write_mode(&self) -> bool {
        match self.environment {
            Environment::Production => self.prod_allow_writes,
            Environment::Development => true,
        }
    }

    /// Human-readable explanation of why a write to `course_id` is blocked.
    pub fn denial_message(&self, course_id: i64) -> String {
        match self.environment {
            Environment::Production => format!(
                "Write operations are DISABLED in PRODUCTION mode.\n\
                 Attempted: Course {course_id}\n\
                 Safety: prod_allow_writes={}",
                self.prod_allow_writes
            ),
            Environment::Development => {
                let mut allowed: Vec<i64> = self.dev_course_allowlist.iter().copied().collect();
                allowed.sort_unstable();
                format!(
                    "Write operations are only allowed on allow-listed courses in DEV mode.\n\
                     Attempted: Course {course_id}\n\
                     Allowed: {allowed:?}\n\
                     To allow writes to this course, add it to MOODLE_DEV_COURSE_WHITELIST"
                )
            }
        }
    }

    /// Gate check used by write tools: errors with the full policy
    /// explanation when the target is not allowed.
    pub fn require_write(&self, course_id: i64) -> Result<(), MoodleError> {
        if self.can_write(course_id) {
            Ok(())
        } else {
            Err(MoodleError::WriteDenied(self.denial_message(course_id)))
        }
    }

    /// Gate check for mutating calls with no course target yet.
    pub fn require_write_mode(&self) -> Result<(), MoodleError> {
        if self.can_write_mode() {
            Ok(())
        } else {
            Err(MoodleError::WriteDenied(format!(
                "Write operations are DISABLED in PRODUCTION mode.\n\
                 Safety: prod_allow_writes={}",
                self.prod_allow_writes
            )))
        }
    }
}

/// Process configuration, loaded once at startup from `MOODLE_*` environment
/// variables and treated as read-only afterwards.
#[derive(Debug, Clone)]
pub struct MoodleConfig {
    pub base_url: String,
    pub token: String,
    pub api_timeout_secs: u64,
    pub max_connections: usize,
    pub max_keepalive_connections: usize,
    pub max_response_chars: usize,
    pub write_policy: WritePolicy,
}

impl MoodleConfig {
    /// Load configuration from the process environment. `MOODLE_ENV`
    /// selects between the dev and prod URL/token pairs; only the selected
    /// pair is required to be present.
    pub fn from_env() -> Result<Self, MoodleError> {
        let var = |name: &str| std::env::var(name).ok();
        Self::from_lookup(&var)
    }

    /// Same as [`Self::from_env`] but with an injectable variable lookup so
    /// tests never touch process state.
    pub fn from_lookup(var: &dyn Fn(&str) -> Option<String>) -> Result<Self, MoodleError> {
        let environment = Environment::from_mode(&var("MOODLE_ENV").unwrap_or_default());

        let (url_var, token_var) = match environment {
            Environment::Production => ("MOODLE_PROD_URL", "MOODLE_PROD_TOKEN"),
            Environment::Development => ("MOODLE_DEV_URL", "MOODLE_DEV_TOKEN"),
        };
        let base_url = var(url_var).filter(|v| !v.trim().is_empty()).ok_or_else(|| {
            MoodleError::Validation(format!(
                "{url_var} must be set for the {} environment",
                environment.name()
            ))
        })?;
        let token = var(token_var).filter(|v| !v.trim().is_empty()).ok_or_else(|| {
            MoodleError::Validation(format!(
                "{token_var} must be set for the {} environment",
                environment.name()
            ))
        })?;

        let write_policy = WritePolicy::new(
            environment,
            parse_course_allowlist(var("MOODLE_DEV_COURSE_WHITELIST").as_deref()),
            parse_bool_flag(var("MOODLE_PROD_ALLOW_WRITES"), false),
        );

        Ok(Self {
            base_url,
            token,
            api_timeout_secs: parse_u64(var("MOODLE_API_TIMEOUT"), 30),
            max_connections: parse_u64(var("MOODLE_MAX_CONNECTIONS"), 100) as usize,
            max_keepalive_connections: parse_u64(var("MOODLE_MAX_KEEPALIVE_CONNECTIONS"), 20)
                as usize,
            max_response_chars: parse_u64(var("MOODLE_MAX_RESPONSE_CHARS"), 50_000) as usize,
            write_policy,
        })
    }

    pub fn environment(&self) -> Environment {
        self.write_policy.environment
    }
}

fn parse_bool_flag(raw: Option<String>, default: bool) -> bool {
    match raw {
        Some(value) => matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        None => default,
    }
}

fn parse_u64(raw: Option<String>, default: u64) -> u64 {
    raw.and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

/// Parse the comma-separated course allow-list. Any unparseable entry makes
/// the whole value fall back to the default: a half-understood allow-list
/// must not silently widen.
fn parse_course_allowlist(raw: Option<&str>) -> Vec<i64> {
    let raw = raw.unwrap_or(DEFAULT_DEV_COURSE_ALLOWLIST);
    let parsed: Result<Vec<i64>, _> = raw
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::parse::<i64>)
        .collect();
    match parsed {
        Ok(ids) if !ids.is_empty() => ids,
        _ => vec![7299],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_exact_prod_selects_production() {
        assert_eq!(Environment::from_mode("prod"), Environment::Production);
        // Whitespace is trimmed and case is folded before the comparison.
        assert_eq!(Environment::from_mode(" prod "), Environment::Production);
        assert_eq!(Environment::from_mode("Prod"), Environment::Production);
        assert_eq!(Environment::from_mode("PROD"), Environment::Production);
    }

    #[test]
    fn every_other_mode_string_is_development() {
        for raw in ["production", "dev", "", "prd", "prod1", "default"] {
            assert_eq!(
                Environment::from_mode(raw),
                Environment::Development,
                "mode {raw:?} must fail safe to development"
            );
        }
    }

    #[test]
    fn dev_mode_enforces_course_allowlist() {
        let policy = WritePolicy::new(Environment::Development, [7299], false);
        assert!(policy.can_write(7299));
        assert!(!policy.can_write(1));
        assert!(policy.can_write_mode());
    }

    #[test]
    fn prod_mode_blocks_writes_by_default() {
        let policy = WritePolicy::new(Environment::Production, [7299], false);
        assert!(!policy.can_write(7299));
        assert!(!policy.can_write(1));
        assert!(!policy.can_write_mode());

        let open = WritePolicy::new(Environment::Production, [], true);
        assert!(open.can_write(1));
        assert!(open.can_write_mode());
    }

    #[test]
    fn denial_message_names_target_and_policy() {
        let policy = WritePolicy::new(Environment::Development, [7299], false);
        let msg = policy.denial_message(42);
        assert!(msg.contains("Course 42"));
        assert!(msg.contains("7299"));
        assert!(msg.contains("DEV"));

        let policy = WritePolicy::new(Environment::Production, [], false);
        let msg = policy.denial_message(42);
        assert!(msg.contains("PRODUCTION"));
        assert!(msg.contains("prod_allow_writes=false"));
    }

    #[test]
    fn require_write_errors_with_write_denied() {
        let policy = WritePolicy::new(Environment::Development, [7299], false);
        assert!(policy.require_write(7299).is_ok());
        let err = policy.require_write(2).unwrap_err();
        assert!(matches!(err, MoodleError::WriteDenied(msg) if msg.contains("Course 2")));
    }

    #[test]
    fn allowlist_parsing_accepts_comma_separated_ids() {
        assert_eq!(parse_course_allowlist(Some("7299, 2292")), vec![7299, 2292]);
        assert_eq!(parse_course_allowlist(None), vec![7299]);
    }

    #[test]
    fn allowlist_parse_failure_falls_back_to_default() {
        assert_eq!(parse_course_allowlist(Some("7299,oops")), vec![7299]);
        assert_eq!(parse_course_allowlist(Some("")), vec![7299]);
    }

    #[test]
    fn config_selects_url_token_pair_by_mode() {
        let vars = |name: &str| -> Option<String> {
            match name {
                "MOODLE_ENV" => Some("dev".into()),
                "MOODLE_DEV_URL" => Some("https://moodle-dev.example.edu".into()),
                "MOODLE_DEV_TOKEN" => Some("devtoken".into()),
                "MOODLE_PROD_URL" => Some("https://moodle.example.edu".into()),
                "MOODLE_PROD_TOKEN" => Some("prodtoken".into()),
                _ => None,
            }
        };
        let config = MoodleConfig::from_lookup(&vars).unwrap();
        assert_eq!(config.base_url, "https://moodle-dev.example.edu");
        assert_eq!(config.token, "devtoken");
        assert_eq!(config.api_timeout_secs, 30);
        assert_eq!(config.max_connections, 100);
        assert_eq!(config.max_keepalive_connections, 20);
        assert_eq!(config.max_response_chars, 50_000);
        assert_eq!(config.environment(), Environment::Development);
    }

    #[test]
    fn missing_selected_pair_is_a_startup_error() {
        let vars = |name: &str| -> Option<String> {
            match name {
                "MOODLE_ENV" => Some("prod".into()),
                "MOODLE_DEV_URL" => Some("https://moodle-dev.example.edu".into()),
                "MOODLE_DEV_TOKEN" => Some("devtoken".into()),
                _ => None,
            }
        };
        let err = MoodleConfig::from_lookup(&vars).unwrap_err();
        assert!(matches!(err, MoodleError::Validation(msg) if msg.contains("MOODLE_PROD_URL")));
    }
}
