use super::{LogResolver, SourceError, SourceIdentity};
use crate::config::DatabaseSettings;
use crate::pg;
use chrono::NaiveDateTime;
use chrono::format::{Item, StrftimeItems};
use std::fmt::Write as _;
use std::path::PathBuf;

/// Expands a `log_filename` style strftime template.
pub fn expand_template(template: &str, at: NaiveDateTime) -> Result<String, SourceError> {
    let items: Vec<Item<'_>> = StrftimeItems::new(template).collect();
    if items.iter().any(|item| matches!(item, Item::Error)) {
        return Err(SourceError::Template(template.to_string()));
    }
    let mut name = String::new();
    write!(name, "{}", at.format_with_items(items.into_iter()))
        .map_err(|_| SourceError::Template(template.to_string()))?;
    Ok(name)
}

/// Current file = `log_filename` expanded at the current time. Retries look
/// one hour further back each, which covers a file that has not been
/// created yet right after the hour or day turns.
pub struct TemplateResolver {
    directory: PathBuf,
    template: String,
}

impl TemplateResolver {
    pub fn new(directory: PathBuf, template: String) -> Result<Self, SourceError> {
        // reject bad templates up front rather than on every refresh
        expand_template(&template, NaiveDateTime::default())?;
        Ok(Self {
            directory,
            template,
        })
    }
}

impl LogResolver for TemplateResolver {
    fn resolve(&mut self, now: NaiveDateTime, attempt: u32) -> Result<SourceIdentity, SourceError> {
        let as_of = now - chrono::Duration::hours(i64::from(attempt));
        let name = expand_template(&self.template, as_of)?;
        let path = self.directory.join(&name);
        if !path.is_file() {
            return Err(SourceError::Missing(path));
        }
        Ok(SourceIdentity {
            name,
            path,
            size: None,
        })
    }

    fn materialize(&mut self, identity: &SourceIdentity) -> Result<PathBuf, SourceError> {
        Ok(identity.path.clone())
    }
}

/// Asks the server which file its logging collector writes to.
pub struct CurrentLogfileResolver {
    client: postgres::Client,
    data_directory: PathBuf,
}

impl CurrentLogfileResolver {
    pub fn connect(db: &DatabaseSettings, data_directory: PathBuf) -> Result<Self, SourceError> {
        let client = pg::connect(db).map_err(|e| SourceError::Query(e.to_string()))?;
        Ok(Self {
            client,
            data_directory,
        })
    }
}

impl LogResolver for CurrentLogfileResolver {
    fn resolve(&mut self, _now: NaiveDateTime, _attempt: u32) -> Result<SourceIdentity, SourceError> {
        let current = pg::current_logfile(&mut self.client)
            .map_err(|e| SourceError::Query(pg::format_postgres_error(&e)))?
            .ok_or_else(|| SourceError::NoLogFile("pg_current_logfile()".into()))?;
        let path = self.data_directory.join(&current);
        if !path.is_file() {
            return Err(SourceError::Missing(path));
        }
        Ok(SourceIdentity {
            name: current,
            path,
            size: None,
        })
    }

    fn materialize(&mut self, identity: &SourceIdentity) -> Result<PathBuf, SourceError> {
        Ok(identity.path.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap()
    }

    #[test]
    fn test_expand_template() {
        let name = expand_template("postgresql-%Y-%m-%d_%H%M%S.log", at("2024-03-01 07:05:09")).unwrap();
        assert_eq!(name, "postgresql-2024-03-01_070509.log");
        assert_eq!(expand_template("postgresql-%a.log", at("2024-03-01 07:05:09")).unwrap(), "postgresql-Fri.log");
        assert!(matches!(
            expand_template("postgresql-%Q.log", at("2024-03-01 07:05:09")),
            Err(SourceError::Template(_))
        ));
    }

    #[test]
    fn test_template_resolver_looks_back_on_retry() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("postgresql-2024-02-29.log"), "").unwrap();
        let mut resolver =
            TemplateResolver::new(dir.path().to_path_buf(), "postgresql-%Y-%m-%d.log".into()).unwrap();

        let just_after_midnight = at("2024-03-01 00:00:30");
        assert!(matches!(
            resolver.resolve(just_after_midnight, 0),
            Err(SourceError::Missing(_))
        ));
        let identity = resolver.resolve(just_after_midnight, 1).unwrap();
        assert_eq!(identity.name, "postgresql-2024-02-29.log");
        assert_eq!(resolver.materialize(&identity).unwrap(), identity.path);
    }
}
