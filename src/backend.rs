use std::sync::Arc;

use simplebank_core::{Database, StorageError};
use simplebank_memory::InMemoryStorage;
use simplebank_postgres::PostgresStorage;
use simplebank_sqlite::SqliteStorage;

use crate::config::{Backend, DatabaseConfig};

/// Opens the configured storage backend, creating its schema if needed.
pub fn open_database(config: &DatabaseConfig) -> Result<Arc<dyn Database>, StorageError> {
    let db: Arc<dyn Database> = match config.backend {
        Backend::Memory => Arc::new(InMemoryStorage::new()),
        Backend::Sqlite => {
            let path = if config.url.is_empty() {
                "simplebank.db"
            } else {
                config.url.as_str()
            };
            Arc::new(SqliteStorage::new(path)?)
        }
        Backend::Postgres => {
            if config.url.is_empty() {
                return Err(StorageError::Other(
                    "database.url is required for the postgres backend".to_string(),
                ));
            }
            Arc::new(PostgresStorage::with_max_connections(
                &config.url,
                config.max_connections,
            )?)
        }
    };
    tracing::info!(backend = ?config.backend, "Storage backend ready");
    Ok(db)
}

#[cfg(test)]
mod tests {
    use simplebank_core::{Context, CreateAccountParams, Store};

    use super::*;

    #[test]
    fn test_open_sqlite_in_memory() {
        let db = open_database(&DatabaseConfig {
            backend: Backend::Sqlite,
            url: ":memory:".to_string(),
            ..DatabaseConfig::default()
        })
        .unwrap();
        let store = Store::new(db);
        let ctx = Context::background();

        let account = store
            .create_account(
                &ctx,
                &CreateAccountParams {
                    owner: "alice".to_string(),
                    balance: 0,
                    currency: "USD".to_string(),
                },
            )
            .unwrap();
        assert_eq!(store.get_account(&ctx, account.id).unwrap().owner, "alice");
    }

    #[test]
    fn test_postgres_requires_url() {
        let err = open_database(&DatabaseConfig {
            backend: Backend::Postgres,
            url: String::new(),
            ..DatabaseConfig::default()
        })
        .err()
        .unwrap();
        assert!(matches!(err, StorageError::Other(_)));
    }
}
