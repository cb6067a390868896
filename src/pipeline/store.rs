//! Audit pipeline database.
//!
//! One store backs the three persistent concerns of the pipeline: the ABI
//! cache (unique per address and network, provenance-priority upsert), the
//! insert-only audit records and the job rows the state machine moves with
//! compare-and-set updates. SQLite and PostgreSQL are both supported through
//! the `sqlx` Any driver.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{Any, Pool, Row};

use super::abi::{AbiCacheEntry, AbiSourceTag, InterfaceDescription};
use super::error::{FailureKind, PersistenceError};
use super::jobs::{AuditOptions, Job, JobFailure, JobId, JobState, JobStatus};
use super::record::{AuditFilter, AuditId, AuditRecord, ContractMetadata, NewAudit};
use super::scoring::{RiskAssessment, RiskLevel};
use super::types::{ContractAddress, Network};

/// Embedded SQL schemas
const SQLITE_SCHEMA_SQL: &str = include_str!("../../sql/audit_schema.sql");
const POSTGRES_SCHEMA_SQL: &str = include_str!("../../sql/audit_schema_postgres.sql");

const JOB_COLUMNS: &str = "id, address, network, options, state, audit_id, error_kind, error_detail, attempts, created_at, updated_at";
const AUDIT_COLUMNS: &str = "id, job_id, address, network, status, score, risk_level, summary, features, abi_source, abi, metadata, created_at";

type Result<T> = std::result::Result<T, PersistenceError>;

#[derive(Debug, Clone)]
pub struct AuditDbConfig {
    /// SQLite path, `:memory:`, `sqlite:` URL or `postgres://` URL.
    pub url: String,
    pub max_connections: u32,
}

impl AuditDbConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DbBackend {
    Sqlite,
    Postgres,
}

/// Whether a cache upsert replaced the stored entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheWrite {
    Written,
    /// A manual override is stored and the write did not carry the override flag.
    KeptManual,
}

pub struct AuditDb {
    pool: Pool<Any>,
    backend: DbBackend,
}

impl AuditDb {
    pub async fn new(config: AuditDbConfig) -> anyhow::Result<Self> {
        use anyhow::Context;

        sqlx::any::install_default_drivers();

        let url = config.url.as_str();
        let backend = if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            DbBackend::Postgres
        } else {
            DbBackend::Sqlite
        };
        let is_memory = url == ":memory:" || url == "sqlite::memory:";

        // Ensure parent directory exists for sqlite file databases.
        if backend == DbBackend::Sqlite && !is_memory && !url.starts_with("sqlite:") {
            if let Some(parent) = Path::new(url).parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent)
                    .await
                    .context(format!("Failed to create directory: {}", parent.display()))?;
            }
        }

        let database_url = match backend {
            DbBackend::Postgres => url.to_string(),
            DbBackend::Sqlite if is_memory => "sqlite::memory:".to_string(),
            DbBackend::Sqlite if url.starts_with("sqlite:") => url.to_string(),
            DbBackend::Sqlite => format!("sqlite://{url}?mode=rwc"),
        };

        tracing::debug!(
            target: "auditor::pipeline::store",
            "Connecting to database: {}",
            database_url
        );

        // Every connection to `sqlite::memory:` is a separate database, so the
        // pool is pinned to a single connection that never expires.
        let mut options = AnyPoolOptions::new();
        options = if is_memory {
            options
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            options.max_connections(config.max_connections.max(1))
        };
        let pool = options
            .acquire_timeout(Duration::from_secs(30))
            .after_connect(move |conn, _meta| {
                Box::pin(async move {
                    if backend == DbBackend::Sqlite {
                        sqlx::query("PRAGMA busy_timeout=5000").execute(&mut *conn).await?;
                        sqlx::query("PRAGMA foreign_keys=ON").execute(&mut *conn).await?;
                    }
                    Ok(())
                })
            })
            .connect(&database_url)
            .await
            .context("Failed to connect to audit database")?;

        let db = Self { pool, backend };
        db.init_schema().await?;

        Ok(db)
    }

    /// In-memory SQLite store.
    pub async fn in_memory() -> anyhow::Result<Self> {
        Self::new(AuditDbConfig::new(":memory:")).await
    }

    fn sql<'a>(&self, sqlite: &'a str, postgres: &'a str) -> &'a str {
        match self.backend {
            DbBackend::Sqlite => sqlite,
            DbBackend::Postgres => postgres,
        }
    }

    fn placeholder(&self, index: usize) -> String {
        match self.backend {
            DbBackend::Sqlite => "?".to_string(),
            DbBackend::Postgres => format!("${index}"),
        }
    }

    async fn init_schema(&self) -> anyhow::Result<()> {
        self.apply_pragmas().await?;
        self.load_schema_from_sql().await?;

        tracing::info!(target: "auditor::pipeline::store", "Audit database schema initialized");

        Ok(())
    }

    async fn apply_pragmas(&self) -> anyhow::Result<()> {
        if self.backend != DbBackend::Sqlite {
            return Ok(());
        }

        sqlx::query("PRAGMA journal_mode=WAL")
            .execute(&self.pool)
            .await?;

        sqlx::query("PRAGMA synchronous=NORMAL")
            .execute(&self.pool)
            .await?;

        tracing::debug!(target: "auditor::pipeline::store", "Applied SQLite PRAGMAs");

        Ok(())
    }

    async fn load_schema_from_sql(&self) -> anyhow::Result<()> {
        use anyhow::Context;

        let schema_sql = self.sql(SQLITE_SCHEMA_SQL, POSTGRES_SCHEMA_SQL);

        for statement in schema_sql.split(';') {
            let clean_sql = statement
                .lines()
                .filter(|line| {
                    let trimmed = line.trim();
                    !trimmed.is_empty() && !trimmed.starts_with("--")
                })
                .collect::<Vec<_>>()
                .join("\n");

            if clean_sql.is_empty() {
                continue;
            }

            let first_line = clean_sql.lines().next().unwrap_or("");
            tracing::debug!(target: "auditor::pipeline::store", "Executing SQL: {}", first_line);

            sqlx::query(&clean_sql)
                .execute(&self.pool)
                .await
                .context(format!("Failed to execute SQL: {first_line}"))?;
        }

        Ok(())
    }

    // ===== ABI cache =====

    pub async fn get_abi(
        &self,
        address: &ContractAddress,
        network: &Network,
    ) -> Result<Option<AbiCacheEntry>> {
        let sql = self.sql(
            "SELECT abi, source, updated_at FROM abi_cache WHERE address = ? AND network = ?",
            "SELECT abi, source, updated_at FROM abi_cache WHERE address = $1 AND network = $2",
        );

        let row = sqlx::query(sql)
            .bind(address.to_hex())
            .bind(network.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| -> Result<AbiCacheEntry> {
            let abi: String = row.try_get(0)?;
            let source: String = row.try_get(1)?;
            let updated_at: i64 = row.try_get(2)?;
            Ok(AbiCacheEntry {
                address: *address,
                network: network.clone(),
                description: serde_json::from_str(&abi)?,
                source: AbiSourceTag::from_db(&source).ok_or_else(|| {
                    PersistenceError::Unavailable(format!("unknown ABI source '{source}'"))
                })?,
                updated_at: timestamp(updated_at),
            })
        })
        .transpose()
    }

    /// Single-row upsert of a cache entry.
    ///
    /// A stored `manual_override` is only replaced by another manual write or
    /// when `overwrite_manual` is set.
    pub async fn upsert_abi(
        &self,
        address: &ContractAddress,
        network: &Network,
        description: &InterfaceDescription,
        source: AbiSourceTag,
        overwrite_manual: bool,
    ) -> Result<CacheWrite> {
        let guard = if overwrite_manual {
            ""
        } else {
            " WHERE abi_cache.source <> 'manual_override' OR excluded.source = 'manual_override'"
        };
        let sql = match self.backend {
            DbBackend::Sqlite => format!(
                "INSERT INTO abi_cache (address, network, abi, source, updated_at) \
                 VALUES (?, ?, ?, ?, ?) \
                 ON CONFLICT(address, network) \
                 DO UPDATE SET abi = excluded.abi, source = excluded.source, updated_at = excluded.updated_at{guard}"
            ),
            DbBackend::Postgres => format!(
                "INSERT INTO abi_cache (address, network, abi, source, updated_at) \
                 VALUES ($1, $2, $3, $4, $5) \
                 ON CONFLICT(address, network) \
                 DO UPDATE SET abi = EXCLUDED.abi, source = EXCLUDED.source, updated_at = EXCLUDED.updated_at{guard}"
            ),
        };

        let result = sqlx::query(&sql)
            .bind(address.to_hex())
            .bind(network.as_str())
            .bind(description.to_json_string())
            .bind(source.as_str())
            .bind(Utc::now().timestamp())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            tracing::debug!(
                target: "auditor::pipeline::store",
                %address,
                %network,
                source = source.as_str(),
                "Kept manual override over lower-priority cache write"
            );
            Ok(CacheWrite::KeptManual)
        } else {
            Ok(CacheWrite::Written)
        }
    }

    // ===== Jobs =====

    pub async fn insert_job(
        &self,
        address: &ContractAddress,
        network: &Network,
        options: &AuditOptions,
    ) -> Result<Job> {
        let sql = self.sql(
            "INSERT INTO jobs (address, network, options, state, attempts, created_at, updated_at) \
             VALUES (?, ?, ?, 'pending', 0, ?, ?) RETURNING id",
            "INSERT INTO jobs (address, network, options, state, attempts, created_at, updated_at) \
             VALUES ($1, $2, $3, 'pending', 0, $4, $5) RETURNING id",
        );
        let now = Utc::now().timestamp();

        let id: i64 = sqlx::query_scalar(sql)
            .bind(address.to_hex())
            .bind(network.as_str())
            .bind(serde_json::to_string(options)?)
            .bind(now)
            .bind(now)
            .fetch_one(&self.pool)
            .await?;

        Ok(Job {
            id: JobId(id),
            address: *address,
            network: network.clone(),
            options: options.clone(),
            state: JobState::Pending,
            attempts: 0,
            created_at: timestamp(now),
            updated_at: timestamp(now),
        })
    }

    pub async fn get_job(&self, id: JobId) -> Result<Option<Job>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE id = {}",
            self.placeholder(1)
        );
        let row = sqlx::query(&sql)
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(job_from_row).transpose()
    }

    /// Jobs in `status`, oldest first.
    pub async fn list_jobs(&self, status: JobStatus, limit: u32) -> Result<Vec<Job>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE state = {} ORDER BY id ASC LIMIT {}",
            self.placeholder(1),
            self.placeholder(2)
        );
        let rows = sqlx::query(&sql)
            .bind(status.as_str())
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(job_from_row).collect()
    }

    /// Compare-and-set on the job state. Returns whether the row moved.
    pub async fn transition_job(
        &self,
        id: JobId,
        expected: JobStatus,
        next: &JobState,
    ) -> Result<bool> {
        let (sql, values) = self.transition_statement(id, expected, next);
        let result = bind_transition(sqlx::query(&sql), values)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn record_job_attempts(&self, id: JobId, attempts: u32) -> Result<()> {
        let sql = self.sql(
            "UPDATE jobs SET attempts = ?, updated_at = ? WHERE id = ?",
            "UPDATE jobs SET attempts = $1, updated_at = $2 WHERE id = $3",
        );
        sqlx::query(sql)
            .bind(i64::from(attempts))
            .bind(Utc::now().timestamp())
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Inserts the audit record and moves the job RUNNING → COMPLETED in one
    /// transaction. Returns `None` (and writes nothing) if the job was no
    /// longer RUNNING.
    pub async fn complete_job_with_audit(&self, audit: &NewAudit) -> Result<Option<AuditId>> {
        let mut tx = self.pool.begin().await?;

        let sql = self.sql(
            "INSERT INTO audits (job_id, address, network, status, score, risk_level, summary, features, abi_source, abi, metadata, created_at) \
             VALUES (?, ?, ?, 'completed', ?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
            "INSERT INTO audits (job_id, address, network, status, score, risk_level, summary, features, abi_source, abi, metadata, created_at) \
             VALUES ($1, $2, $3, 'completed', $4, $5, $6, $7, $8, $9, $10, $11) RETURNING id",
        );
        let metadata = if audit.metadata.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&audit.metadata)?)
        };

        let audit_id: i64 = sqlx::query_scalar(sql)
            .bind(audit.job_id.0)
            .bind(audit.address.to_hex())
            .bind(audit.network.as_str())
            .bind(audit.assessment.score)
            .bind(audit.assessment.level.as_str())
            .bind(audit.assessment.summary.as_str())
            .bind(serde_json::to_string(&audit.assessment.features)?)
            .bind(audit.abi_source.as_str())
            .bind(audit.description.to_json_string())
            .bind(metadata)
            .bind(Utc::now().timestamp())
            .fetch_one(&mut *tx)
            .await?;
        let audit_id = AuditId(audit_id);

        let (sql, values) = self.transition_statement(
            audit.job_id,
            JobStatus::Running,
            &JobState::Completed { audit_id },
        );
        let moved = bind_transition(sqlx::query(&sql), values)
            .execute(&mut *tx)
            .await?
            .rows_affected()
            == 1;

        if !moved {
            tx.rollback().await?;
            return Ok(None);
        }

        tx.commit().await?;
        Ok(Some(audit_id))
    }

    fn transition_statement(
        &self,
        id: JobId,
        expected: JobStatus,
        next: &JobState,
    ) -> (String, TransitionValues) {
        let (audit_id, error_kind, error_detail) = match next {
            JobState::Completed { audit_id } => (Some(audit_id.0), None, None),
            JobState::Failed(failure) => (
                None,
                Some(failure.kind.as_str().to_string()),
                Some(failure.detail.clone()),
            ),
            JobState::Pending | JobState::Running => (None, None, None),
        };
        let p = |i| self.placeholder(i);
        let sql = format!(
            "UPDATE jobs SET state = {}, audit_id = {}, error_kind = {}, error_detail = {}, updated_at = {} \
             WHERE id = {} AND state = {}",
            p(1),
            p(2),
            p(3),
            p(4),
            p(5),
            p(6),
            p(7)
        );
        let values = TransitionValues {
            state: next.status().as_str(),
            audit_id,
            error_kind,
            error_detail,
            updated_at: Utc::now().timestamp(),
            id: id.0,
            expected: expected.as_str(),
        };
        (sql, values)
    }

    // ===== Audits =====

    pub async fn get_audit(&self, id: AuditId) -> Result<Option<AuditRecord>> {
        let sql = format!(
            "SELECT {AUDIT_COLUMNS} FROM audits WHERE id = {}",
            self.placeholder(1)
        );
        let row = sqlx::query(&sql)
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(audit_from_row).transpose()
    }

    /// Audits matching `filter`, newest first.
    pub async fn list_audits(&self, filter: &AuditFilter) -> Result<Vec<AuditRecord>> {
        let mut clauses = Vec::new();
        let mut binds = Vec::new();
        if let Some(address) = &filter.address {
            binds.push(address.to_hex());
            clauses.push(format!("address = {}", self.placeholder(binds.len())));
        }
        if let Some(network) = &filter.network {
            binds.push(network.as_str().to_string());
            clauses.push(format!("network = {}", self.placeholder(binds.len())));
        }
        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };
        let sql = format!(
            "SELECT {AUDIT_COLUMNS} FROM audits{where_clause} ORDER BY id DESC LIMIT {}",
            self.placeholder(binds.len() + 1)
        );

        let mut query = sqlx::query(&sql);
        for value in binds {
            query = query.bind(value);
        }
        let rows = query
            .bind(i64::from(filter.effective_limit()))
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(audit_from_row).collect()
    }
}

struct TransitionValues {
    state: &'static str,
    audit_id: Option<i64>,
    error_kind: Option<String>,
    error_detail: Option<String>,
    updated_at: i64,
    id: i64,
    expected: &'static str,
}

fn bind_transition<'q>(
    query: sqlx::query::Query<'q, Any, sqlx::any::AnyArguments<'q>>,
    values: TransitionValues,
) -> sqlx::query::Query<'q, Any, sqlx::any::AnyArguments<'q>> {
    query
        .bind(values.state)
        .bind(values.audit_id)
        .bind(values.error_kind)
        .bind(values.error_detail)
        .bind(values.updated_at)
        .bind(values.id)
        .bind(values.expected)
}

fn timestamp(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

fn corrupt(what: &str, value: &str) -> PersistenceError {
    PersistenceError::Unavailable(format!("corrupt {what} '{value}'"))
}

fn job_from_row(row: &AnyRow) -> Result<Job> {
    let id: i64 = row.try_get("id")?;
    let address: String = row.try_get("address")?;
    let network: String = row.try_get("network")?;
    let options: String = row.try_get("options")?;
    let state: String = row.try_get("state")?;
    let audit_id: Option<i64> = row.try_get("audit_id")?;
    let error_kind: Option<String> = row.try_get("error_kind")?;
    let error_detail: Option<String> = row.try_get("error_detail")?;
    let attempts: i64 = row.try_get("attempts")?;
    let created_at: i64 = row.try_get("created_at")?;
    let updated_at: i64 = row.try_get("updated_at")?;

    let state = match JobStatus::from_db(&state) {
        Some(JobStatus::Pending) => JobState::Pending,
        Some(JobStatus::Running) => JobState::Running,
        Some(JobStatus::Completed) => JobState::Completed {
            audit_id: AuditId(audit_id.ok_or_else(|| corrupt("completed job without audit", &id.to_string()))?),
        },
        Some(JobStatus::Failed) => {
            let kind = error_kind.unwrap_or_default();
            JobState::Failed(JobFailure {
                kind: FailureKind::from_db(&kind).ok_or_else(|| corrupt("failure kind", &kind))?,
                detail: error_detail.unwrap_or_default(),
            })
        }
        None => return Err(corrupt("job state", &state)),
    };

    Ok(Job {
        id: JobId(id),
        address: address.parse().map_err(|_| corrupt("address", &address))?,
        network: Network::new(network),
        options: serde_json::from_str(&options)?,
        state,
        attempts: attempts as u32,
        created_at: timestamp(created_at),
        updated_at: timestamp(updated_at),
    })
}

fn audit_from_row(row: &AnyRow) -> Result<AuditRecord> {
    let id: i64 = row.try_get("id")?;
    let job_id: i64 = row.try_get("job_id")?;
    let address: String = row.try_get("address")?;
    let network: String = row.try_get("network")?;
    let status: String = row.try_get("status")?;
    let score: f64 = row.try_get("score")?;
    let risk_level: String = row.try_get("risk_level")?;
    let summary: String = row.try_get("summary")?;
    let features: String = row.try_get("features")?;
    let abi_source: String = row.try_get("abi_source")?;
    let abi: String = row.try_get("abi")?;
    let metadata: Option<String> = row.try_get("metadata")?;
    let created_at: i64 = row.try_get("created_at")?;

    let metadata: ContractMetadata = match metadata {
        Some(raw) => serde_json::from_str(&raw)?,
        None => ContractMetadata::new(),
    };

    Ok(AuditRecord {
        id: AuditId(id),
        job_id: JobId(job_id),
        address: address.parse().map_err(|_| corrupt("address", &address))?,
        network: Network::new(network),
        status: JobStatus::from_db(&status).ok_or_else(|| corrupt("audit status", &status))?,
        assessment: RiskAssessment {
            score,
            level: RiskLevel::from_db(&risk_level).ok_or_else(|| corrupt("risk level", &risk_level))?,
            summary,
            features: serde_json::from_str(&features)?,
        },
        abi_source: AbiSourceTag::from_db(&abi_source)
            .ok_or_else(|| corrupt("ABI source", &abi_source))?,
        description: serde_json::from_str(&abi)?,
        metadata,
        created_at: timestamp(created_at),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::abi::{AbiMember, Mutability};
    use crate::pipeline::features::FeatureVector;

    fn address(n: u8) -> ContractAddress {
        ContractAddress::from_bytes([n; 20])
    }

    fn description(name: &str) -> InterfaceDescription {
        InterfaceDescription::new(vec![AbiMember::function(name, Mutability::View)])
    }

    fn new_audit(job_id: JobId, address: ContractAddress) -> NewAudit {
        NewAudit {
            job_id,
            address,
            network: Network::default(),
            assessment: RiskAssessment {
                score: 0.42,
                level: RiskLevel::Low,
                summary: "low risk".into(),
                features: FeatureVector::zeroed(),
            },
            abi_source: AbiSourceTag::RemoteFetch,
            description: description("totalSupply"),
            metadata: ContractMetadata::from([("symbol".to_string(), "TKN".to_string())]),
        }
    }

    #[tokio::test]
    async fn test_abi_cache_upsert_and_read() {
        let db = AuditDb::in_memory().await.unwrap();
        let network = Network::default();

        assert!(db.get_abi(&address(1), &network).await.unwrap().is_none());

        let write = db
            .upsert_abi(&address(1), &network, &description("a"), AbiSourceTag::RemoteFetch, false)
            .await
            .unwrap();
        assert_eq!(write, CacheWrite::Written);

        db.upsert_abi(&address(1), &network, &description("b"), AbiSourceTag::RemoteFetch, false)
            .await
            .unwrap();
        let entry = db.get_abi(&address(1), &network).await.unwrap().unwrap();
        assert_eq!(entry.description, description("b"));
        assert_eq!(entry.source, AbiSourceTag::RemoteFetch);

        // Same address, other network: separate entry.
        assert!(db
            .get_abi(&address(1), &Network::new("mainnet"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_manual_override_wins_over_remote_fetch() {
        let db = AuditDb::in_memory().await.unwrap();
        let network = Network::default();

        db.upsert_abi(&address(2), &network, &description("manual"), AbiSourceTag::ManualOverride, false)
            .await
            .unwrap();

        let write = db
            .upsert_abi(&address(2), &network, &description("remote"), AbiSourceTag::RemoteFetch, false)
            .await
            .unwrap();
        assert_eq!(write, CacheWrite::KeptManual);
        let entry = db.get_abi(&address(2), &network).await.unwrap().unwrap();
        assert_eq!(entry.description, description("manual"));
        assert_eq!(entry.source, AbiSourceTag::ManualOverride);

        // Explicit override replaces it.
        let write = db
            .upsert_abi(&address(2), &network, &description("remote"), AbiSourceTag::RemoteFetch, true)
            .await
            .unwrap();
        assert_eq!(write, CacheWrite::Written);
        let entry = db.get_abi(&address(2), &network).await.unwrap().unwrap();
        assert_eq!(entry.source, AbiSourceTag::RemoteFetch);
    }

    #[tokio::test]
    async fn test_job_compare_and_set() {
        let db = AuditDb::in_memory().await.unwrap();
        let job = db
            .insert_job(&address(3), &Network::default(), &AuditOptions::default())
            .await
            .unwrap();
        assert_eq!(job.state, JobState::Pending);

        assert!(db.transition_job(job.id, JobStatus::Pending, &JobState::Running).await.unwrap());
        // Second claim loses.
        assert!(!db.transition_job(job.id, JobStatus::Pending, &JobState::Running).await.unwrap());

        let failure = JobFailure::new(FailureKind::NotFound, "nothing anywhere");
        assert!(db
            .transition_job(job.id, JobStatus::Running, &JobState::Failed(failure.clone()))
            .await
            .unwrap());

        let stored = db.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Failed(failure));
        assert!(db.get_job(JobId(999)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_complete_is_atomic_with_audit_insert() {
        let db = AuditDb::in_memory().await.unwrap();
        let job = db
            .insert_job(&address(4), &Network::default(), &AuditOptions::default())
            .await
            .unwrap();

        // Not running yet: nothing is written.
        assert_eq!(db.complete_job_with_audit(&new_audit(job.id, address(4))).await.unwrap(), None);
        assert!(db.list_audits(&AuditFilter::default()).await.unwrap().is_empty());

        db.transition_job(job.id, JobStatus::Pending, &JobState::Running)
            .await
            .unwrap();
        let audit_id = db
            .complete_job_with_audit(&new_audit(job.id, address(4)))
            .await
            .unwrap()
            .unwrap();

        let stored = db.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Completed { audit_id });

        let audit = db.get_audit(audit_id).await.unwrap().unwrap();
        assert_eq!(audit.job_id, job.id);
        assert_eq!(audit.status, JobStatus::Completed);
        assert_eq!(audit.assessment.level, RiskLevel::Low);
        assert_eq!(audit.metadata.get("symbol").map(String::as_str), Some("TKN"));
        assert_eq!(audit.description, description("totalSupply"));
    }

    #[tokio::test]
    async fn test_list_audits_filters_and_orders_newest_first() {
        let db = AuditDb::in_memory().await.unwrap();

        for n in [5u8, 6, 5] {
            let job = db
                .insert_job(&address(n), &Network::default(), &AuditOptions::default())
                .await
                .unwrap();
            db.transition_job(job.id, JobStatus::Pending, &JobState::Running)
                .await
                .unwrap();
            db.complete_job_with_audit(&new_audit(job.id, address(n)))
                .await
                .unwrap()
                .unwrap();
        }

        let all = db.list_audits(&AuditFilter::default()).await.unwrap();
        assert_eq!(all.len(), 3);
        assert!(all[0].id > all[1].id && all[1].id > all[2].id);

        let only_five = db
            .list_audits(&AuditFilter::for_address(address(5)))
            .await
            .unwrap();
        assert_eq!(only_five.len(), 2);
        assert!(only_five.iter().all(|a| a.address == address(5)));

        let limited = db
            .list_audits(&AuditFilter {
                limit: Some(1),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].id, all[0].id);

        let other_network = db
            .list_audits(&AuditFilter {
                network: Some(Network::new("mainnet")),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(other_network.is_empty());
    }

    #[tokio::test]
    async fn test_list_jobs_by_state() {
        let db = AuditDb::in_memory().await.unwrap();
        let a = db
            .insert_job(&address(7), &Network::default(), &AuditOptions::default())
            .await
            .unwrap();
        let b = db
            .insert_job(&address(8), &Network::default(), &AuditOptions::default())
            .await
            .unwrap();
        db.transition_job(a.id, JobStatus::Pending, &JobState::Running)
            .await
            .unwrap();

        let pending = db.list_jobs(JobStatus::Pending, 10).await.unwrap();
        assert_eq!(pending.iter().map(|j| j.id).collect::<Vec<_>>(), vec![b.id]);
    }

    #[tokio::test]
    async fn test_file_database_persists_across_connections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("audit.db");
        let url = path.to_string_lossy().to_string();

        {
            let db = AuditDb::new(AuditDbConfig::new(url.clone())).await.unwrap();
            db.upsert_abi(&address(9), &Network::default(), &description("x"), AbiSourceTag::ManualOverride, false)
                .await
                .unwrap();
        }

        let db = AuditDb::new(AuditDbConfig::new(url)).await.unwrap();
        let entry = db.get_abi(&address(9), &Network::default()).await.unwrap().unwrap();
        assert_eq!(entry.source, AbiSourceTag::ManualOverride);
    }
}
