use super::{Config, ConfigError};
use std::path::PathBuf;

/// Produces the next configuration snapshot on refresh.
pub trait ConfigSource {
    fn reload(&mut self, current: &Config) -> Result<Config, ConfigError>;
}

/// Command-line values that take precedence over the file, on startup and
/// on every reload.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub minutes: Option<u64>,
    pub dbname: Option<String>,
    pub dbuser: Option<String>,
    pub dbhost: Option<String>,
    pub verbose: bool,
}

impl CliOverrides {
    pub fn apply(&self, config: &mut Config) {
        if let Some(minutes) = self.minutes {
            config.run.minutes = minutes;
        }
        if let Some(dbname) = &self.dbname {
            config.database.dbname = dbname.clone();
        }
        if let Some(user) = &self.dbuser {
            config.database.user = user.clone();
        }
        if let Some(host) = &self.dbhost {
            config.database.host = host.clone();
        }
        if self.verbose {
            config.run.verbose = true;
        }
    }
}

/// Re-reads the config file the daemon was started with.
pub struct FileConfigSource {
    path: PathBuf,
    overrides: CliOverrides,
}

impl FileConfigSource {
    pub fn new(path: PathBuf, overrides: CliOverrides) -> Self {
        Self { path, overrides }
    }
}

impl ConfigSource for FileConfigSource {
    fn reload(&mut self, current: &Config) -> Result<Config, ConfigError> {
        let mut fresh = Config::load(&self.path)?;
        self.overrides.apply(&mut fresh);
        fresh.validate()?;
        Ok(current.with_reloaded(fresh))
    }
}
