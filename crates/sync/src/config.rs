use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu, ensure};

use super::error::SyncError;
use super::local::write_json_atomically;
use super::runtime::RuntimeDescriptor;

pub const SETTINGS_DIRECTORY_NAME: &str = "threadline";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const SETTINGS_ENV_PREFIX: &str = "THREADLINE_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Upper bound for one conversation listing attempt.
    pub load_timeout_ms: u64,
    /// Extra listing attempts after a transient failure.
    pub load_retries: u32,
    pub max_message_bytes: usize,
    pub max_attachments: usize,
    pub title_max_chars: usize,
    /// Number of recent turns sent to the generation service.
    pub history_window: usize,
    pub default_runtime: RuntimeDescriptor,
    pub snapshot_dir: Option<PathBuf>,
    pub model_id: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u64>,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            load_timeout_ms: 10_000,
            load_retries: 1,
            max_message_bytes: 32_768,
            max_attachments: 10,
            title_max_chars: 48,
            history_window: 24,
            default_runtime: RuntimeDescriptor::core(),
            snapshot_dir: None,
            model_id: None,
            temperature: None,
            max_tokens: None,
        }
    }
}

impl SyncSettings {
    pub fn load_timeout(&self) -> Duration {
        Duration::from_millis(self.load_timeout_ms)
    }

    pub fn snapshot_dir(&self) -> PathBuf {
        self.snapshot_dir.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
                .unwrap_or_else(|| PathBuf::from(".threadline"))
                .join("snapshots")
        })
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if let Some(temperature) = self.temperature {
            ensure!(
                (0.0..=2.0).contains(&temperature),
                InvalidSettingSnafu {
                    stage: "settings-validate-temperature",
                    field: "temperature",
                    details: format!("{temperature} is outside 0.0..=2.0"),
                }
            );
        }
        if let Some(directory) = &self.snapshot_dir {
            ensure!(
                !directory.as_os_str().is_empty(),
                InvalidSettingSnafu {
                    stage: "settings-validate-snapshot-dir",
                    field: "snapshot_dir",
                    details: "path is empty".to_string(),
                }
            );
        }
        Ok(())
    }

    pub fn normalized(mut self) -> Self {
        let defaults = Self::default();
        if self.load_timeout_ms == 0 {
            self.load_timeout_ms = defaults.load_timeout_ms;
        }
        if self.max_message_bytes == 0 {
            self.max_message_bytes = defaults.max_message_bytes;
        }
        if self.title_max_chars == 0 {
            self.title_max_chars = defaults.title_max_chars;
        }
        if self.history_window == 0 {
            self.history_window = defaults.history_window;
        }
        self.model_id = self
            .model_id
            .map(|model| model.trim().to_string())
            .filter(|model| !model.is_empty());
        self
    }
}

/// Live settings for one process, layered from defaults, a JSON file and `THREADLINE_`
/// environment variables.
pub struct SettingsStore {
    current: ArcSwap<SyncSettings>,
    path: PathBuf,
}

impl SettingsStore {
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".threadline"))
            .join(SETTINGS_FILE_NAME)
    }

    /// Unreadable or invalid files fall back to defaults.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let settings = read_layers(&path);
        Self {
            current: ArcSwap::from_pointee(settings),
            path,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn current(&self) -> Arc<SyncSettings> {
        self.current.load_full()
    }

    /// Applies `edit`, checks the result, writes it and swaps it in. The live settings are
    /// left alone when any step fails.
    pub fn update(
        &self,
        edit: impl FnOnce(&mut SyncSettings),
    ) -> Result<Arc<SyncSettings>, SettingsError> {
        let mut next = SyncSettings::clone(&self.current());
        edit(&mut next);
        let next = next.normalized();
        next.validate()?;

        write_json_atomically(&self.path, &next).context(PersistSnafu {
            stage: "settings-update-persist",
            path: self.path.clone(),
        })?;

        let next = Arc::new(next);
        self.current.store(next.clone());
        tracing::info!(path = ?self.path, "settings updated");
        Ok(next)
    }
}

fn read_layers(path: &Path) -> SyncSettings {
    if !path.exists() {
        tracing::info!(path = ?path, "settings file not found, using defaults");
    }

    let figment = Figment::from(Serialized::defaults(SyncSettings::default()))
        .merge(Json::file(path))
        .merge(Env::prefixed(SETTINGS_ENV_PREFIX).split("__"));

    let settings = match figment.extract::<SyncSettings>() {
        Ok(settings) => settings.normalized(),
        Err(error) => {
            tracing::warn!(path = ?path, error = %error, "failed to parse settings, using defaults");
            return SyncSettings::default();
        }
    };
    match settings.validate() {
        Ok(()) => settings,
        Err(error) => {
            tracing::warn!(path = ?path, error = %error, "ignoring invalid settings, using defaults");
            SyncSettings::default()
        }
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("setting `{field}` rejected on `{stage}`: {details}"))]
    InvalidSetting {
        stage: &'static str,
        field: &'static str,
        details: String,
    },
    #[snafu(display("failed to store settings at {path:?} on `{stage}`: {source}"))]
    Persist {
        stage: &'static str,
        path: PathBuf,
        source: SyncError,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let directory = tempfile::tempdir().expect("tempdir");
        let store = SettingsStore::open(directory.path().join("absent.json"));
        let settings = store.current();

        assert_eq!(settings.load_timeout_ms, 10_000);
        assert_eq!(settings.load_retries, 1);
        assert_eq!(settings.title_max_chars, 48);
        assert_eq!(settings.default_runtime, RuntimeDescriptor::core());
    }

    #[test]
    fn file_values_override_defaults() {
        let directory = tempfile::tempdir().expect("tempdir");
        let path = directory.path().join(SETTINGS_FILE_NAME);
        std::fs::write(&path, r#"{ "history_window": 6, "model_id": "  gpt-4.1  " }"#)
            .expect("write settings");

        let settings = SettingsStore::open(path).current();
        assert_eq!(settings.history_window, 6);
        assert_eq!(settings.model_id.as_deref(), Some("gpt-4.1"));
        assert_eq!(settings.max_attachments, 10);
    }

    #[test]
    fn unreadable_or_invalid_files_fall_back_to_defaults() {
        let directory = tempfile::tempdir().expect("tempdir");
        let broken = directory.path().join("broken.json");
        std::fs::write(&broken, "{ broken").expect("write settings");
        let hot = directory.path().join("hot.json");
        std::fs::write(&hot, r#"{ "temperature": 7.5 }"#).expect("write settings");

        assert_eq!(*SettingsStore::open(broken).current(), SyncSettings::default());
        assert_eq!(*SettingsStore::open(hot).current(), SyncSettings::default());
    }

    #[test]
    fn configured_snapshot_dir_wins_over_the_data_dir() {
        let settings = SyncSettings {
            snapshot_dir: Some(PathBuf::from("/tmp/threadline-qa")),
            ..SyncSettings::default()
        };
        assert_eq!(settings.snapshot_dir(), PathBuf::from("/tmp/threadline-qa"));
        assert!(SyncSettings::default().snapshot_dir().ends_with("snapshots"));
    }

    #[test]
    fn update_persists_and_swaps() {
        let directory = tempfile::tempdir().expect("tempdir");
        let path = directory.path().join("nested").join(SETTINGS_FILE_NAME);
        let store = SettingsStore::open(path.clone());

        let updated = store
            .update(|settings| {
                settings.title_max_chars = 20;
                settings.history_window = 0;
                settings.snapshot_dir = Some(directory.path().join("snapshots"));
            })
            .expect("update");

        assert_eq!(updated.title_max_chars, 20);
        assert_eq!(store.current().history_window, 24);
        assert!(!path.with_extension("json.tmp").exists());

        let reopened = SettingsStore::open(path).current();
        assert_eq!(reopened.title_max_chars, 20);
        assert_eq!(reopened.snapshot_dir(), directory.path().join("snapshots"));
    }

    #[test]
    fn rejected_updates_leave_settings_and_file_untouched() {
        let directory = tempfile::tempdir().expect("tempdir");
        let path = directory.path().join(SETTINGS_FILE_NAME);
        let store = SettingsStore::open(path.clone());

        let result = store.update(|settings| settings.temperature = Some(f64::NAN));

        assert!(matches!(
            result,
            Err(SettingsError::InvalidSetting {
                field: "temperature",
                ..
            })
        ));
        assert_eq!(store.current().temperature, None);
        assert!(!path.exists());
    }
}
