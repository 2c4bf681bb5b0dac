use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;

/// A forward-only schema step. Downgrades are expressed as new forward
/// migrations; applied versions are recorded in `_schema_version`.
pub struct Migration {
    pub version: i64,
    pub statements: &'static [&'static str],
}

pub fn migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            statements: &[
                "CREATE TABLE users (
                    user_id TEXT PRIMARY KEY,
                    github_username TEXT NOT NULL UNIQUE,
                    ssh_public_key TEXT,
                    ssh_key_fingerprint TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                )",
                "CREATE INDEX idx_users_github_username ON users (github_username)",
                "CREATE TABLE github_installations (
                    user_id TEXT PRIMARY KEY,
                    installation_id INTEGER NOT NULL DEFAULT 0,
                    github_user_id INTEGER NOT NULL,
                    github_username TEXT NOT NULL,
                    repo_full_name TEXT,
                    token TEXT NOT NULL,
                    token_expires_at TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                )",
                "CREATE INDEX idx_github_installations_user_id ON github_installations (user_id)",
                "CREATE TABLE github_forks (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    user_id TEXT NOT NULL,
                    original_owner TEXT NOT NULL,
                    original_repo TEXT NOT NULL,
                    fork_owner TEXT NOT NULL,
                    fork_url TEXT,
                    created_at TEXT NOT NULL,
                    UNIQUE (user_id, original_owner, original_repo)
                )",
                "CREATE INDEX idx_github_forks_triple
                    ON github_forks (user_id, original_owner, original_repo)",
                "CREATE TABLE workspaces (
                    workspace_id TEXT PRIMARY KEY,
                    user_id TEXT NOT NULL,
                    workspace_name TEXT NOT NULL,
                    status TEXT NOT NULL,
                    provider TEXT NOT NULL,
                    image TEXT NOT NULL,
                    repo_owner TEXT NOT NULL,
                    repo_name TEXT NOT NULL,
                    repo_url TEXT NOT NULL,
                    branch TEXT NOT NULL DEFAULT 'main',
                    commit_sha TEXT,
                    is_fork INTEGER NOT NULL DEFAULT 0,
                    fork_url TEXT,
                    ssh_host TEXT,
                    ssh_port INTEGER,
                    node_id TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                )",
                "CREATE INDEX idx_workspaces_user_id ON workspaces (user_id)",
                "CREATE INDEX idx_workspaces_status ON workspaces (status)",
                "CREATE TABLE services (
                    service_id TEXT PRIMARY KEY,
                    workspace_id TEXT NOT NULL
                        REFERENCES workspaces (workspace_id) ON DELETE CASCADE,
                    name TEXT NOT NULL,
                    command TEXT NOT NULL,
                    port INTEGER NOT NULL,
                    local_port INTEGER,
                    status TEXT NOT NULL,
                    health_status TEXT NOT NULL,
                    last_check TEXT,
                    depends_on TEXT NOT NULL DEFAULT '[]',
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                )",
                "CREATE INDEX idx_services_workspace_id ON services (workspace_id)",
            ],
        },
        Migration {
            version: 2,
            statements: &[
                "CREATE TABLE nodes (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    provider TEXT NOT NULL,
                    status TEXT NOT NULL,
                    address TEXT NOT NULL,
                    port INTEGER NOT NULL,
                    labels TEXT NOT NULL DEFAULT '{}',
                    capabilities TEXT NOT NULL DEFAULT '{}',
                    services TEXT,
                    metadata TEXT NOT NULL DEFAULT '{}',
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    last_seen TEXT NOT NULL
                )",
            ],
        },
    ]
}

/// Open (creating if missing) the single-file database and bound pool.
pub async fn connect(path: &str) -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str(&format!("sqlite://{path}"))?
        .create_if_missing(true)
        .foreign_keys(true);
    SqlitePoolOptions::new()
        .max_connections(25)
        .min_connections(5)
        .connect_with(options)
        .await
}

/// Apply every unapplied migration inside a single transaction, recording
/// each applied version.
pub async fn run_migrations(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS _schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await?;

    let row = sqlx::query("SELECT MAX(version) AS version FROM _schema_version")
        .fetch_one(pool)
        .await?;
    let current: i64 = row.try_get::<Option<i64>, _>("version")?.unwrap_or(0);

    let pending: Vec<Migration> = migrations()
        .into_iter()
        .filter(|m| m.version > current)
        .collect();
    if pending.is_empty() {
        return Ok(());
    }

    let mut tx = pool.begin().await?;
    for migration in &pending {
        for statement in migration.statements {
            sqlx::query(statement).execute(&mut tx).await?;
        }
        sqlx::query("INSERT INTO _schema_version (version, applied_at) VALUES (?, ?)")
            .bind(migration.version)
            .bind(chrono::Utc::now().to_rfc3339())
            .execute(&mut tx)
            .await?;
        tracing::info!(version = migration.version, "applied schema migration");
    }
    tx.commit().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::Row;

    #[tokio::test]
    async fn migrations_apply_once_and_record_versions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("coordination.db");
        let pool = connect(path.to_str().unwrap()).await.unwrap();
        run_migrations(&pool).await.unwrap();
        // A second run over the same file is a no-op.
        run_migrations(&pool).await.unwrap();

        let row = sqlx::query("SELECT COUNT(*) AS n FROM _schema_version")
            .fetch_one(&pool)
            .await
            .unwrap();
        let n: i64 = row.get("n");
        assert_eq!(n, migrations().len() as i64);
    }

    #[tokio::test]
    async fn schema_has_expected_tables() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("coordination.db");
        let pool = connect(path.to_str().unwrap()).await.unwrap();
        run_migrations(&pool).await.unwrap();

        for table in [
            "users",
            "github_installations",
            "github_forks",
            "workspaces",
            "services",
            "nodes",
        ] {
            let row =
                sqlx::query("SELECT COUNT(*) AS n FROM sqlite_master WHERE type = 'table' AND name = ?")
                    .bind(table)
                    .fetch_one(&pool)
                    .await
                    .unwrap();
            let n: i64 = row.get("n");
            assert_eq!(n, 1, "missing table {table}");
        }
    }
}
