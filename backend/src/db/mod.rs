pub mod schema;

use std::borrow::Cow;
use std::time::Duration;

use sqlx::AnyPool;
use sqlx::any::AnyPoolOptions;

use crate::error::PipelineError;

/// SQL flavour behind an `AnyPool`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dialect {
    Postgres,
    Sqlite,
}

impl Dialect {
    pub fn from_url(url: &str) -> Result<Self, PipelineError> {
        let scheme = url.split(':').next().unwrap_or_default().to_ascii_lowercase();
        match scheme.as_str() {
            "postgres" | "postgresql" => Ok(Dialect::Postgres),
            "sqlite" => Ok(Dialect::Sqlite),
            other => Err(PipelineError::Config(format!(
                "unsupported database scheme: {other}"
            ))),
        }
    }

    /// Rewrites `?` placeholders to `$1..$n` for PostgreSQL.
    ///
    /// Question marks inside single-quoted literals are left alone.
    pub fn sql<'a>(&self, query: &'a str) -> Cow<'a, str> {
        match self {
            Dialect::Sqlite => Cow::Borrowed(query),
            Dialect::Postgres => {
                let mut out = String::with_capacity(query.len() + 16);
                let mut n = 0;
                let mut in_literal = false;
                for ch in query.chars() {
                    match ch {
                        '\'' => {
                            in_literal = !in_literal;
                            out.push(ch);
                        }
                        '?' if !in_literal => {
                            n += 1;
                            out.push('$');
                            out.push_str(&n.to_string());
                        }
                        _ => out.push(ch),
                    }
                }
                Cow::Owned(out)
            }
        }
    }

    /// Row lock for the claim subquery. SQLite serialises writers instead.
    pub fn lock_clause(&self) -> &'static str {
        match self {
            Dialect::Postgres => "FOR UPDATE SKIP LOCKED",
            Dialect::Sqlite => "",
        }
    }

    /// Transaction-scoped statement timeout, where the backend has one.
    pub fn statement_timeout(&self, timeout: Duration) -> Option<String> {
        match self {
            Dialect::Postgres => Some(format!(
                "SET LOCAL statement_timeout = {}",
                timeout.as_millis()
            )),
            Dialect::Sqlite => None,
        }
    }
}

/// `?, ?, ?` for an `IN (...)` list of `n` binds.
pub fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

#[derive(Clone)]
pub struct Db {
    pub pool: AnyPool,
    pub dialect: Dialect,
}

impl Db {
    pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<Self> {
        sqlx::any::install_default_drivers();

        let dialect = Dialect::from_url(database_url)?;
        let pool = AnyPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await?;

        Ok(Self { pool, dialect })
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        schema::migrate(&self.pool).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dialect_follows_url_scheme() {
        assert_eq!(
            Dialect::from_url("postgres://u:p@localhost/capi").unwrap(),
            Dialect::Postgres
        );
        assert_eq!(
            Dialect::from_url("postgresql://localhost/capi").unwrap(),
            Dialect::Postgres
        );
        assert_eq!(
            Dialect::from_url("sqlite://capi_dev.db?mode=rwc").unwrap(),
            Dialect::Sqlite
        );
        assert_eq!(
            Dialect::from_url("sqlite:file:abc?mode=memory&cache=shared").unwrap(),
            Dialect::Sqlite
        );
        assert!(matches!(
            Dialect::from_url("mysql://localhost/capi"),
            Err(PipelineError::Config(_))
        ));
    }

    #[test]
    fn postgres_placeholders_are_numbered() {
        let q = "UPDATE t SET a = ?, b = 'what?' WHERE id IN (?, ?)";
        assert_eq!(Dialect::Sqlite.sql(q), q);
        assert_eq!(
            Dialect::Postgres.sql(q),
            "UPDATE t SET a = $1, b = 'what?' WHERE id IN ($2, $3)"
        );
    }

    #[test]
    fn lock_and_timeout_are_postgres_only() {
        assert_eq!(Dialect::Postgres.lock_clause(), "FOR UPDATE SKIP LOCKED");
        assert_eq!(Dialect::Sqlite.lock_clause(), "");
        assert_eq!(
            Dialect::Postgres
                .statement_timeout(Duration::from_secs(10))
                .as_deref(),
            Some("SET LOCAL statement_timeout = 10000")
        );
        assert!(Dialect::Sqlite.statement_timeout(Duration::from_secs(10)).is_none());
    }

    #[test]
    fn placeholder_list() {
        assert_eq!(placeholders(3), "?, ?, ?");
        assert_eq!(placeholders(1), "?");
    }
}
