use std::{collections::HashMap, fs};

#[derive(Debug)]
pub struct Settings {
    pub database_url: String,
    pub tenant_id: i64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: "sqlite://./data/gymdesk.db".into(),
            tenant_id: 1,
        }
    }
}

/// Defaults, then `gymdesk.toml` (all values as strings), then environment
/// variables. Missing or unparsable sources fall through to the last value.
pub fn load_settings() -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string("gymdesk.toml") {
        if let Ok(file_cfg) = toml::from_str::<HashMap<String, String>>(&raw) {
            if let Some(v) = file_cfg.get("database_url") {
                settings.database_url = v.clone();
            }
            if let Some(v) = file_cfg.get("tenant_id") {
                if let Ok(parsed) = v.parse::<i64>() {
                    settings.tenant_id = parsed;
                }
            }
        }
    }

    if let Ok(v) = std::env::var("DATABASE_URL") {
        settings.database_url = v;
    }
    if let Ok(v) = std::env::var("GYMDESK_DATABASE_URL") {
        settings.database_url = v;
    }
    if let Ok(v) = std::env::var("GYMDESK_TENANT_ID") {
        if let Ok(parsed) = v.parse::<i64>() {
            settings.tenant_id = parsed;
        }
    }

    settings
}

/// Accepts bare file paths as well as `sqlite:` urls; the storage layer
/// creates the file and its parent directory on first open.
pub fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return Settings::default().database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:")
        || raw_database_url.starts_with("sqlite://")
        || raw_database_url.contains("://")
    {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        let path = path.replace('\\', "/");
        return format!("sqlite://{path}");
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_plain_file_path_to_sqlite_url() {
        assert_eq!(
            normalize_database_url("./data/test.db"),
            "sqlite://./data/test.db"
        );
    }

    #[test]
    fn keeps_memory_and_full_urls_untouched() {
        assert_eq!(normalize_database_url("sqlite::memory:"), "sqlite::memory:");
        assert_eq!(
            normalize_database_url("sqlite:///var/lib/gymdesk.db"),
            "sqlite:///var/lib/gymdesk.db"
        );
    }

    #[test]
    fn empty_url_falls_back_to_the_default() {
        assert_eq!(
            normalize_database_url("   "),
            Settings::default().database_url
        );
    }
}
