use super::{
    BackupError, BackupFile, BackupProfile, BackupRun, BackupRunLog, Command, FileRule, LogLevel,
    NamingRule, NewBackupFile, NewBackupRun, Result, RunFilter, RunStatus, Server,
    StorageLocation,
};
use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// Read access to long-lived configuration owned by the administrative layer.
#[async_trait]
pub trait ConfigStore: Send + Sync + std::fmt::Debug {
    async fn get_server(&self, id: i64) -> Result<Server>;
    async fn list_servers(&self) -> Result<Vec<Server>>;
    async fn get_profile(&self, id: i64) -> Result<BackupProfile>;
    async fn list_profiles(&self) -> Result<Vec<BackupProfile>>;
    /// Enabled profiles with a non-empty cron expression.
    async fn list_scheduled_profiles(&self) -> Result<Vec<BackupProfile>>;
    /// Ordered by run order, then id.
    async fn list_commands(&self, profile_id: i64) -> Result<Vec<Command>>;
    async fn list_file_rules(&self, profile_id: i64) -> Result<Vec<FileRule>>;
    async fn get_naming_rule(&self, id: i64) -> Result<NamingRule>;
    async fn get_storage_location(&self, id: i64) -> Result<StorageLocation>;
}

/// Persistence for runs, their files and their log entries.
#[async_trait]
pub trait RunStore: Send + Sync + std::fmt::Debug {
    async fn insert_run(&self, run: &NewBackupRun) -> Result<BackupRun>;
    async fn update_run(&self, run: &BackupRun) -> Result<()>;
    async fn get_run(&self, id: i64) -> Result<BackupRun>;
    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<BackupRun>>;
    async fn insert_file(&self, file: &NewBackupFile) -> Result<BackupFile>;
    async fn get_file(&self, id: i64) -> Result<BackupFile>;
    async fn list_files(&self, run_id: i64) -> Result<Vec<BackupFile>>;
    async fn insert_log(&self, run_id: i64, level: LogLevel, message: &str)
        -> Result<BackupRunLog>;
    async fn list_logs(&self, run_id: i64) -> Result<Vec<BackupRunLog>>;
    /// Removes the run's logs and files, then the run. `NotFound` for unknown ids.
    async fn delete_run(&self, id: i64) -> Result<()>;
}

/// PostgreSQL implementation of both stores
#[derive(Debug, Clone)]
pub struct PostgresStore {
    db_pool: Arc<PgPool>,
}

const RUN_COLUMNS: &str = "id, profile_id, start_time, end_time, status, local_backup_path, \
     total_files, total_size_bytes, error_message, log";

impl PostgresStore {
    pub fn new(db_pool: Arc<PgPool>) -> Self {
        Self { db_pool }
    }

    /// Create the tables this crate reads and writes if they do not exist yet.
    pub async fn initialize(&self) -> Result<()> {
        debug!("Initializing backup orchestrator schema");

        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS servers (
                id BIGSERIAL PRIMARY KEY,
                name VARCHAR NOT NULL,
                host VARCHAR NOT NULL,
                port INTEGER NOT NULL DEFAULT 22,
                username VARCHAR NOT NULL,
                auth_type VARCHAR NOT NULL,
                private_key TEXT NOT NULL DEFAULT '',
                password TEXT NOT NULL DEFAULT ''
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS storage_locations (
                id BIGSERIAL PRIMARY KEY,
                name VARCHAR NOT NULL,
                base_path TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS naming_rules (
                id BIGSERIAL PRIMARY KEY,
                name VARCHAR NOT NULL,
                pattern TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS backup_profiles (
                id BIGSERIAL PRIMARY KEY,
                name VARCHAR NOT NULL,
                server_id BIGINT NOT NULL,
                storage_location_id BIGINT NOT NULL,
                naming_rule_id BIGINT NOT NULL,
                enabled BOOLEAN NOT NULL DEFAULT true,
                schedule_cron VARCHAR
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS commands (
                id BIGSERIAL PRIMARY KEY,
                profile_id BIGINT NOT NULL,
                command TEXT NOT NULL,
                run_stage VARCHAR NOT NULL,
                run_order INTEGER NOT NULL DEFAULT 0
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS file_rules (
                id BIGSERIAL PRIMARY KEY,
                profile_id BIGINT NOT NULL,
                remote_path TEXT NOT NULL,
                recursive BOOLEAN NOT NULL DEFAULT true,
                exclude_pattern TEXT
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS backup_runs (
                id BIGSERIAL PRIMARY KEY,
                profile_id BIGINT NOT NULL,
                start_time TIMESTAMPTZ,
                end_time TIMESTAMPTZ,
                status VARCHAR NOT NULL,
                local_backup_path TEXT,
                total_files BIGINT NOT NULL DEFAULT 0,
                total_size_bytes BIGINT NOT NULL DEFAULT 0,
                error_message TEXT,
                log TEXT NOT NULL DEFAULT ''
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS backup_files (
                id BIGSERIAL PRIMARY KEY,
                run_id BIGINT NOT NULL REFERENCES backup_runs(id),
                local_path TEXT NOT NULL,
                remote_path TEXT NOT NULL,
                size_bytes BIGINT NOT NULL DEFAULT 0
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS backup_run_logs (
                id BIGSERIAL PRIMARY KEY,
                run_id BIGINT NOT NULL REFERENCES backup_runs(id),
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                level VARCHAR NOT NULL,
                message TEXT NOT NULL
            )
            "#,
        ];

        for statement in statements {
            sqlx::query(statement)
                .execute(self.db_pool.as_ref())
                .await?;
        }

        debug!("Backup orchestrator schema initialized");
        Ok(())
    }

    fn row_to_server(row: PgRow) -> Result<Server> {
        let id: i64 = row.try_get("id")?;
        Ok(Server {
            id,
            name: row.try_get("name")?,
            host: row.try_get("host")?,
            port: port_from_column(id, row.try_get("port")?)?,
            username: row.try_get("username")?,
            auth_type: row.try_get("auth_type")?,
            private_key: row.try_get("private_key")?,
            password: row.try_get("password")?,
        })
    }

    fn row_to_profile(row: PgRow) -> Result<BackupProfile> {
        Ok(BackupProfile {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            server_id: row.try_get("server_id")?,
            storage_location_id: row.try_get("storage_location_id")?,
            naming_rule_id: row.try_get("naming_rule_id")?,
            enabled: row.try_get("enabled")?,
            schedule_cron: row.try_get("schedule_cron")?,
        })
    }

    fn row_to_command(row: PgRow) -> Result<Command> {
        let stage: String = row.try_get("run_stage")?;
        Ok(Command {
            id: row.try_get("id")?,
            profile_id: row.try_get("profile_id")?,
            command: row.try_get("command")?,
            run_stage: stage.parse()?,
            run_order: row.try_get("run_order")?,
        })
    }

    fn row_to_file_rule(row: PgRow) -> Result<FileRule> {
        Ok(FileRule {
            id: row.try_get("id")?,
            profile_id: row.try_get("profile_id")?,
            remote_path: row.try_get("remote_path")?,
            recursive: row.try_get("recursive")?,
            exclude_pattern: row.try_get("exclude_pattern")?,
        })
    }

    fn row_to_run(row: PgRow) -> Result<BackupRun> {
        let status: String = row.try_get("status")?;
        let local_path: Option<String> = row.try_get("local_backup_path")?;
        Ok(BackupRun {
            id: row.try_get("id")?,
            profile_id: row.try_get("profile_id")?,
            start_time: row.try_get("start_time")?,
            end_time: row.try_get("end_time")?,
            status: status.parse::<RunStatus>()?,
            local_backup_path: local_path.map(PathBuf::from),
            total_files: row.try_get("total_files")?,
            total_size_bytes: row.try_get("total_size_bytes")?,
            error_message: row.try_get("error_message")?,
            log: row.try_get("log")?,
        })
    }

    fn row_to_file(row: PgRow) -> Result<BackupFile> {
        let local_path: String = row.try_get("local_path")?;
        Ok(BackupFile {
            id: row.try_get("id")?,
            run_id: row.try_get("run_id")?,
            local_path: PathBuf::from(local_path),
            remote_path: row.try_get("remote_path")?,
            size_bytes: row.try_get("size_bytes")?,
        })
    }

    fn row_to_log(row: PgRow) -> Result<BackupRunLog> {
        let level: String = row.try_get("level")?;
        Ok(BackupRunLog {
            id: row.try_get("id")?,
            run_id: row.try_get("run_id")?,
            created_at: row.try_get("created_at")?,
            level: level.parse()?,
            message: row.try_get("message")?,
        })
    }
}

/// Maps a missing row to `NotFound` so callers can tell it apart from storage failures.
fn found<T>(row: Option<T>, entity: &'static str, id: i64) -> Result<T> {
    row.ok_or_else(|| BackupError::not_found(entity, id))
}

#[async_trait]
impl ConfigStore for PostgresStore {
    async fn get_server(&self, id: i64) -> Result<Server> {
        let row = sqlx::query("SELECT * FROM servers WHERE id = $1")
            .bind(id)
            .fetch_optional(self.db_pool.as_ref())
            .await?;
        Self::row_to_server(found(row, "server", id)?)
    }

    async fn list_servers(&self) -> Result<Vec<Server>> {
        let rows = sqlx::query("SELECT * FROM servers ORDER BY id")
            .fetch_all(self.db_pool.as_ref())
            .await?;
        rows.into_iter().map(Self::row_to_server).collect()
    }

    async fn get_profile(&self, id: i64) -> Result<BackupProfile> {
        let row = sqlx::query("SELECT * FROM backup_profiles WHERE id = $1")
            .bind(id)
            .fetch_optional(self.db_pool.as_ref())
            .await?;
        Self::row_to_profile(found(row, "backup profile", id)?)
    }

    async fn list_profiles(&self) -> Result<Vec<BackupProfile>> {
        let rows = sqlx::query("SELECT * FROM backup_profiles ORDER BY id")
            .fetch_all(self.db_pool.as_ref())
            .await?;
        rows.into_iter().map(Self::row_to_profile).collect()
    }

    async fn list_scheduled_profiles(&self) -> Result<Vec<BackupProfile>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM backup_profiles
            WHERE enabled = true
            AND schedule_cron IS NOT NULL
            AND TRIM(schedule_cron) != ''
            ORDER BY id
        "#,
        )
        .fetch_all(self.db_pool.as_ref())
        .await?;
        rows.into_iter().map(Self::row_to_profile).collect()
    }

    async fn list_commands(&self, profile_id: i64) -> Result<Vec<Command>> {
        let rows =
            sqlx::query("SELECT * FROM commands WHERE profile_id = $1 ORDER BY run_order, id")
                .bind(profile_id)
                .fetch_all(self.db_pool.as_ref())
                .await?;
        rows.into_iter().map(Self::row_to_command).collect()
    }

    async fn list_file_rules(&self, profile_id: i64) -> Result<Vec<FileRule>> {
        let rows = sqlx::query("SELECT * FROM file_rules WHERE profile_id = $1 ORDER BY id")
            .bind(profile_id)
            .fetch_all(self.db_pool.as_ref())
            .await?;
        rows.into_iter().map(Self::row_to_file_rule).collect()
    }

    async fn get_naming_rule(&self, id: i64) -> Result<NamingRule> {
        let row = sqlx::query("SELECT id, name, pattern FROM naming_rules WHERE id = $1")
            .bind(id)
            .fetch_optional(self.db_pool.as_ref())
            .await?;
        let row = found(row, "naming rule", id)?;
        Ok(NamingRule {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            pattern: row.try_get("pattern")?,
        })
    }

    async fn get_storage_location(&self, id: i64) -> Result<StorageLocation> {
        let row = sqlx::query("SELECT id, name, base_path FROM storage_locations WHERE id = $1")
            .bind(id)
            .fetch_optional(self.db_pool.as_ref())
            .await?;
        let row = found(row, "storage location", id)?;
        let base_path: String = row.try_get("base_path")?;
        Ok(StorageLocation {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            base_path: PathBuf::from(base_path),
        })
    }
}

#[async_trait]
impl RunStore for PostgresStore {
    async fn insert_run(&self, run: &NewBackupRun) -> Result<BackupRun> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO backup_runs (profile_id, status, local_backup_path)
            VALUES ($1, $2, $3)
            RETURNING {RUN_COLUMNS}
        "#
        ))
        .bind(run.profile_id)
        .bind(RunStatus::Pending.as_str())
        .bind(
            run.local_backup_path
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned()),
        )
        .fetch_one(self.db_pool.as_ref())
        .await?;

        Self::row_to_run(row)
    }

    async fn update_run(&self, run: &BackupRun) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE backup_runs SET
                start_time = $2, end_time = $3, status = $4,
                local_backup_path = $5, total_files = $6,
                total_size_bytes = $7, error_message = $8, log = $9
            WHERE id = $1
        "#,
        )
        .bind(run.id)
        .bind(run.start_time)
        .bind(run.end_time)
        .bind(run.status.as_str())
        .bind(
            run.local_backup_path
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned()),
        )
        .bind(run.total_files)
        .bind(run.total_size_bytes)
        .bind(&run.error_message)
        .bind(&run.log)
        .execute(self.db_pool.as_ref())
        .await?;

        if result.rows_affected() == 0 {
            return Err(BackupError::not_found("backup run", run.id));
        }
        Ok(())
    }

    async fn get_run(&self, id: i64) -> Result<BackupRun> {
        let row = sqlx::query(&format!("SELECT {RUN_COLUMNS} FROM backup_runs WHERE id = $1"))
            .bind(id)
            .fetch_optional(self.db_pool.as_ref())
            .await?;
        Self::row_to_run(found(row, "backup run", id)?)
    }

    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<BackupRun>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {RUN_COLUMNS} FROM backup_runs
            WHERE ($1::BIGINT IS NULL OR profile_id = $1)
            AND ($2::VARCHAR IS NULL OR status = $2)
            ORDER BY id DESC
        "#
        ))
        .bind(filter.profile_id)
        .bind(filter.status.map(|s| s.as_str()))
        .fetch_all(self.db_pool.as_ref())
        .await?;

        rows.into_iter().map(Self::row_to_run).collect()
    }

    async fn insert_file(&self, file: &NewBackupFile) -> Result<BackupFile> {
        let row = sqlx::query(
            r#"
            INSERT INTO backup_files (run_id, local_path, remote_path, size_bytes)
            VALUES ($1, $2, $3, $4)
            RETURNING id, run_id, local_path, remote_path, size_bytes
        "#,
        )
        .bind(file.run_id)
        .bind(file.local_path.to_string_lossy().into_owned())
        .bind(&file.remote_path)
        .bind(file.size_bytes)
        .fetch_one(self.db_pool.as_ref())
        .await?;

        Self::row_to_file(row)
    }

    async fn get_file(&self, id: i64) -> Result<BackupFile> {
        let row = sqlx::query(
            "SELECT id, run_id, local_path, remote_path, size_bytes FROM backup_files WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(self.db_pool.as_ref())
        .await?;
        Self::row_to_file(found(row, "backup file", id)?)
    }

    async fn list_files(&self, run_id: i64) -> Result<Vec<BackupFile>> {
        let rows = sqlx::query(
            r#"
            SELECT id, run_id, local_path, remote_path, size_bytes
            FROM backup_files WHERE run_id = $1 ORDER BY id
        "#,
        )
        .bind(run_id)
        .fetch_all(self.db_pool.as_ref())
        .await?;
        rows.into_iter().map(Self::row_to_file).collect()
    }

    async fn insert_log(
        &self,
        run_id: i64,
        level: LogLevel,
        message: &str,
    ) -> Result<BackupRunLog> {
        let row = sqlx::query(
            r#"
            INSERT INTO backup_run_logs (run_id, level, message)
            VALUES ($1, $2, $3)
            RETURNING id, run_id, created_at, level, message
        "#,
        )
        .bind(run_id)
        .bind(level.as_str())
        .bind(message)
        .fetch_one(self.db_pool.as_ref())
        .await?;
        Self::row_to_log(row)
    }

    async fn list_logs(&self, run_id: i64) -> Result<Vec<BackupRunLog>> {
        let rows = sqlx::query(
            r#"
            SELECT id, run_id, created_at, level, message
            FROM backup_run_logs WHERE run_id = $1 ORDER BY id
        "#,
        )
        .bind(run_id)
        .fetch_all(self.db_pool.as_ref())
        .await?;
        rows.into_iter().map(Self::row_to_log).collect()
    }

    async fn delete_run(&self, id: i64) -> Result<()> {
        let mut tx = self.db_pool.begin().await?;

        let exists: Option<i64> = sqlx::query_scalar("SELECT id FROM backup_runs WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            return Err(BackupError::not_found("backup run", id));
        }

        sqlx::query("DELETE FROM backup_run_logs WHERE run_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM backup_files WHERE run_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM backup_runs WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        debug!(run_id = id, "Deleted backup run with its files and logs");
        Ok(())
    }
}

/// Stored ports are `INTEGER`; anything outside `u16` is a bad record.
fn port_from_column(server_id: i64, port: i32) -> Result<u16> {
    u16::try_from(port).map_err(|_| BackupError::Configuration {
        message: format!("server {server_id} has out-of-range port {port}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_column_in_range() {
        assert_eq!(port_from_column(1, 22).unwrap(), 22);
        assert_eq!(port_from_column(1, 0).unwrap(), 0);
        assert_eq!(port_from_column(1, 65535).unwrap(), 65535);
    }

    #[test]
    fn test_port_column_out_of_range_is_configuration_error() {
        for port in [-1, 65536, i32::MAX] {
            match port_from_column(7, port) {
                Err(BackupError::Configuration { message }) => {
                    assert!(message.contains("server 7"), "{message}");
                    assert!(message.contains(&port.to_string()), "{message}");
                }
                other => panic!("port {port}: expected configuration error, got {other:?}"),
            }
        }
    }
}
