//! Process environment settings.
//!
//! The `WIT_OPT` environment variable carries default flags and is read
//! exactly once at process start: a whitespace or comma separated list of
//! `key=value` tokens.

use std::path::PathBuf;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ColorMode {
    #[default]
    Auto,
    Off,
    On,
}

#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub color: ColorMode,
    pub line_width: Option<usize>,
    pub titles_db: Option<PathBuf>,
    pub key_dir: Option<PathBuf>,
}

impl Settings {
    pub fn parse(raw: &str) -> Settings {
        let mut settings = Settings::default();
        for token in raw.split(|c: char| c.is_whitespace() || c == ',') {
            if token.is_empty() {
                continue;
            }
            match token.split_once('=') {
                Some(("color", v)) => {
                    settings.color = match v {
                        "off" | "0" => ColorMode::Off,
                        "on" | "1" => ColorMode::On,
                        _ => ColorMode::Auto,
                    }
                }
                Some(("width", v)) => settings.line_width = v.parse().ok(),
                Some(("titles", v)) => settings.titles_db = Some(PathBuf::from(v)),
                Some(("keys", v)) => settings.key_dir = Some(PathBuf::from(v)),
                _ => tracing::warn!(token, "unknown WIT_OPT token"),
            }
        }
        settings
    }

    /// The process-wide settings, parsed once from `WIT_OPT`.
    pub fn get() -> &'static Settings {
        static SETTINGS: OnceLock<Settings> = OnceLock::new();
        SETTINGS.get_or_init(|| {
            std::env::var("WIT_OPT")
                .map(|raw| Settings::parse(&raw))
                .unwrap_or_default()
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_tokens() {
        let s = Settings::parse("color=off width=132,titles=/opt/titles.db keys=/opt/keys");
        assert_eq!(s.color, ColorMode::Off);
        assert_eq!(s.line_width, Some(132));
        assert_eq!(s.titles_db.as_deref(), Some(std::path::Path::new("/opt/titles.db")));
        assert_eq!(s.key_dir.as_deref(), Some(std::path::Path::new("/opt/keys")));
    }

    #[test]
    fn empty_is_default() {
        let s = Settings::parse("");
        assert_eq!(s.color, ColorMode::Auto);
        assert!(s.line_width.is_none());
    }
}
