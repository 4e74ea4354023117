use crate::store::{
    DatabaseConfig, DatabaseType, MemoryRunStore, PostgresRunStore, RunStore, SqliteRunStore,
};
use std::sync::Arc;

pub async fn create_store(config: &DatabaseConfig) -> crate::Result<Arc<dyn RunStore>> {
    config.validate().map_err(crate::Error::Config)?;

    let store: Arc<dyn RunStore> = match config.db_type {
        DatabaseType::Memory => Arc::new(MemoryRunStore::new()),
        DatabaseType::Sqlite => {
            let path = config
                .sqlite_path
                .as_ref()
                .ok_or_else(|| crate::Error::Config("SQLite path not configured".into()))?
                .to_str()
                .ok_or_else(|| crate::Error::Config("SQLite path is not valid UTF-8".into()))?;
            Arc::new(SqliteRunStore::new(path, config.max_connections).await?)
        }
        DatabaseType::Postgres => {
            let connection_string = config.connection_string.as_ref().ok_or_else(|| {
                crate::Error::Config("PostgreSQL connection string not configured".into())
            })?;
            Arc::new(PostgresRunStore::new(connection_string, config.max_connections).await?)
        }
    };

    store.init().await?;
    Ok(store)
}
