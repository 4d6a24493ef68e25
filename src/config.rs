use ::config::{Config, Environment, File};
use serde::Deserialize;

use crate::error::Result;
use crate::persist::PersistenceMode;

#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub struct DatabaseSettings {
    /// SQLite file; the datastore lives in memory when absent.
    pub path: Option<String>,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct RelationSettings {
    /// Relation records handled per propagation run.
    pub batch_size: usize,
    /// Added to the save time to get the minimum change time of a propagation.
    pub change_time_offset_ms: i64,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct SearchSettings {
    /// Tags this long or longer are not written to `viur_tags`.
    pub max_tag_length: usize,
    /// Entities handled per search index rebuild run.
    pub page_size: usize,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct TaskSettings {
    pub max_attempts: u32,
    pub poll_interval_ms: u64,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct LogSettings {
    pub filter: String,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Settings {
    #[serde(default)]
    pub database: DatabaseSettings,
    pub relations: RelationSettings,
    pub search: SearchSettings,
    pub tasks: TaskSettings,
    pub log: LogSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database: DatabaseSettings::default(),
            relations: RelationSettings {
                batch_size: 100,
                change_time_offset_ms: 1000,
            },
            search: SearchSettings {
                max_tag_length: 400,
                page_size: 100,
            },
            tasks: TaskSettings {
                max_attempts: 5,
                poll_interval_ms: 250,
            },
            log: LogSettings {
                filter: "info".to_string(),
            },
        }
    }
}

impl Settings {
    /// Defaults, then `config/ossature.*` if present, then `OSSATURE__*`
    /// environment variables (e.g. `OSSATURE__DATABASE__PATH`).
    pub fn load() -> Result<Self> {
        Self::from_file("config/ossature")
    }

    pub fn from_file(name: &str) -> Result<Self> {
        let settings = Self::builder()?
            .add_source(File::with_name(name).required(false))
            .add_source(Environment::with_prefix("OSSATURE").separator("__"))
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    fn builder() -> Result<::config::ConfigBuilder<::config::builder::DefaultState>> {
        let defaults = Self::default();
        Ok(Config::builder()
            .set_default("relations.batch_size", defaults.relations.batch_size as u64)?
            .set_default(
                "relations.change_time_offset_ms",
                defaults.relations.change_time_offset_ms,
            )?
            .set_default("search.max_tag_length", defaults.search.max_tag_length as u64)?
            .set_default("search.page_size", defaults.search.page_size as u64)?
            .set_default("tasks.max_attempts", defaults.tasks.max_attempts as u64)?
            .set_default("tasks.poll_interval_ms", defaults.tasks.poll_interval_ms)?
            .set_default("log.filter", defaults.log.filter)?)
    }

    pub fn persistence_mode(&self) -> PersistenceMode {
        match &self.database.path {
            Some(path) => PersistenceMode::File(path.clone()),
            None => PersistenceMode::InMemory,
        }
    }
}
