use std::env;

use sqlx::postgres::PgConnectOptions;

/// Database connection settings.
///
/// Two layers: discrete `WEFT_DB_*` variables (host, port, user, password,
/// name) with local-development defaults, and a full `WEFT_DATABASE_URL`
/// that wins over all of them when present. The CLI's `--database-url`
/// flag maps to the latter.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Full connection URL; overrides the discrete fields when set.
    pub url: Option<String>,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    pub database: String,
}

impl DbConfig {
    /// Read the configuration from the environment.
    pub fn from_env() -> Self {
        Self {
            url: env::var("WEFT_DATABASE_URL").ok(),
            host: env::var("WEFT_DB_HOST").unwrap_or_else(|_| "localhost".to_owned()),
            port: env::var("WEFT_DB_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(5432),
            user: env::var("WEFT_DB_USER").unwrap_or_else(|_| "postgres".to_owned()),
            password: env::var("WEFT_DB_PASSWORD").ok(),
            database: env::var("WEFT_DB_NAME").unwrap_or_else(|_| "weft".to_owned()),
        }
    }

    /// Configuration from an explicit URL (CLI flag, tests).
    pub fn from_url(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Self::local_defaults()
        }
    }

    fn local_defaults() -> Self {
        Self {
            url: None,
            host: "localhost".to_owned(),
            port: 5432,
            user: "postgres".to_owned(),
            password: None,
            database: "weft".to_owned(),
        }
    }

    /// Connection options for the configured database.
    pub fn connect_options(&self) -> Result<PgConnectOptions, sqlx::Error> {
        if let Some(url) = &self.url {
            return url.parse();
        }
        let mut options = PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.user)
            .database(&self.database);
        if let Some(password) = &self.password {
            options = options.password(password);
        }
        Ok(options)
    }

    /// Options for the `postgres` maintenance database on the same server.
    ///
    /// `db-init` connects there to issue `CREATE DATABASE` before the
    /// target database exists.
    pub fn maintenance_options(&self) -> Result<PgConnectOptions, sqlx::Error> {
        Ok(self.connect_options()?.database("postgres"))
    }

    /// The database name this configuration points at, whichever layer it
    /// came from.
    pub fn database_name(&self) -> Option<String> {
        self.connect_options()
            .ok()
            .and_then(|options| options.get_database().map(str::to_owned))
    }
}

impl Default for DbConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn discrete() -> DbConfig {
        DbConfig {
            url: None,
            host: "db.internal".to_owned(),
            port: 5433,
            user: "svc".to_owned(),
            password: Some("hunter2".to_owned()),
            database: "weft_prod".to_owned(),
        }
    }

    #[test]
    fn discrete_fields_build_options() {
        let options = discrete().connect_options().unwrap();
        assert_eq!(options.get_host(), "db.internal");
        assert_eq!(options.get_port(), 5433);
        assert_eq!(options.get_username(), "svc");
        assert_eq!(options.get_database(), Some("weft_prod"));
    }

    #[test]
    fn url_wins_over_discrete_fields() {
        let mut config = discrete();
        config.url = Some("postgresql://elsewhere:5444/other_db".to_owned());
        let options = config.connect_options().unwrap();
        assert_eq!(options.get_host(), "elsewhere");
        assert_eq!(options.get_port(), 5444);
        assert_eq!(options.get_database(), Some("other_db"));
    }

    #[test]
    fn maintenance_options_target_postgres() {
        let options = discrete().maintenance_options().unwrap();
        assert_eq!(options.get_database(), Some("postgres"));

        let from_url = DbConfig::from_url("postgresql://localhost:5432/weft")
            .maintenance_options()
            .unwrap();
        assert_eq!(from_url.get_database(), Some("postgres"));
    }

    #[test]
    fn database_name_resolution() {
        assert_eq!(discrete().database_name().as_deref(), Some("weft_prod"));
        assert_eq!(
            DbConfig::from_url("postgresql://localhost/abc")
                .database_name()
                .as_deref(),
            Some("abc")
        );
        // A URL with no path has no database to create.
        assert_eq!(
            DbConfig::from_url("postgresql://localhost:5432").database_name(),
            None
        );
    }

    #[test]
    fn invalid_url_is_an_error() {
        assert!(DbConfig::from_url("not-a-url").connect_options().is_err());
    }
}
