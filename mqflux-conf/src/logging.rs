//! The `[log]` section.
//!
//! ```toml
//! [log]
//! output = "both"
//! level = "info"
//! file = "/var/log/mqflux/mqflux.log"
//! targets = { "mqflux::handler" = "debug", "sqlx" = "warn" }
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Log {
    #[serde(alias = "to")]
    pub output: Output,
    pub level: Level,
    pub file: String,
    /// Per-target overrides keyed by module path prefix.
    pub targets: BTreeMap<String, Level>,
}

impl Default for Log {
    fn default() -> Self {
        Self {
            output: Output::Console,
            level: Level(slog::Level::Info),
            file: "/var/log/mqflux/mqflux.log".into(),
            targets: BTreeMap::new(),
        }
    }
}

impl Log {
    /// Threshold for records of `target`, the longest matching prefix wins.
    ///
    /// A prefix matches whole path segments only, `mqflux::handler` covers
    /// `mqflux::handler::log` but not `mqflux::handlers`.
    pub fn level_for(&self, target: &str) -> slog::Level {
        self.targets
            .iter()
            .filter(|(prefix, _)| {
                target.strip_prefix(prefix.as_str()).is_some_and(|rest| rest.is_empty() || rest.starts_with("::"))
            })
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, l)| l.0)
            .unwrap_or(self.level.0)
    }

    /// The most verbose threshold of the base level and all overrides.
    pub fn max_level(&self) -> slog::Level {
        self.targets.values().map(|l| l.0).fold(self.level.0, |a, b| if b.as_usize() > a.as_usize() { b } else { a })
    }

    #[inline]
    pub fn file_dir(&self) -> Option<&Path> {
        Path::new(&self.file).parent().filter(|p| !p.as_os_str().is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Output {
    Off,
    #[serde(alias = "stdout")]
    Console,
    File,
    Both,
}

impl Output {
    #[inline]
    pub fn file(self) -> bool {
        matches!(self, Output::Both | Output::File)
    }

    #[inline]
    pub fn console(self) -> bool {
        matches!(self, Output::Both | Output::Console)
    }
}

/// A slog level read from its name, `warn` and `warning` are both accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct Level(pub slog::Level);

impl TryFrom<String> for Level {
    type Error = String;

    fn try_from(name: String) -> Result<Self, Self::Error> {
        let name = name.trim().to_ascii_lowercase();
        let name = if name == "warning" { "warn" } else { name.as_str() };
        slog::Level::from_str(name).map(Level).map_err(|_| format!("unknown log level {:?}", name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log(targets: &[(&str, slog::Level)]) -> Log {
        Log {
            targets: targets.iter().map(|(t, l)| (t.to_string(), Level(*l))).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn parses_output_level_and_targets() {
        let l: Log = serde_json::from_str(
            r#"{"to": "file", "level": "Warning", "targets": {"mqflux::handler": "debug", "sqlx": "error"}}"#,
        )
        .unwrap();
        assert_eq!(l.output, Output::File);
        assert!(l.output.file() && !l.output.console());
        assert_eq!(l.level, Level(slog::Level::Warning));
        assert_eq!(l.targets["mqflux::handler"], Level(slog::Level::Debug));
        assert_eq!(l.file, "/var/log/mqflux/mqflux.log");

        assert!(serde_json::from_str::<Log>(r#"{"level": "loud"}"#).is_err());
        assert!(serde_json::from_str::<Log>(r#"{"output": "syslog"}"#).is_err());
        let l: Log = serde_json::from_str(r#"{"output": "stdout"}"#).unwrap();
        assert_eq!(l.output, Output::Console);
    }

    #[test]
    fn longest_segment_prefix_wins() {
        let l = log(&[("mqflux", slog::Level::Warning), ("mqflux::handler", slog::Level::Trace)]);
        assert_eq!(l.level_for("mqflux::handler::log"), slog::Level::Trace);
        assert_eq!(l.level_for("mqflux::handler"), slog::Level::Trace);
        assert_eq!(l.level_for("mqflux::handlers"), slog::Level::Warning);
        assert_eq!(l.level_for("mqflux_bin::hook_api"), slog::Level::Info);
        assert_eq!(l.level_for("sqlx::query"), slog::Level::Info);
    }

    #[test]
    fn max_level_covers_overrides() {
        assert_eq!(log(&[]).max_level(), slog::Level::Info);
        assert_eq!(log(&[("a", slog::Level::Error)]).max_level(), slog::Level::Info);
        assert_eq!(log(&[("a", slog::Level::Error), ("b", slog::Level::Debug)]).max_level(), slog::Level::Debug);
    }

    #[test]
    fn file_dir() {
        assert_eq!(Log::default().file_dir(), Some(Path::new("/var/log/mqflux")));
        let l = Log { file: "mqflux.log".into(), ..Default::default() };
        assert_eq!(l.file_dir(), None);
    }
}
