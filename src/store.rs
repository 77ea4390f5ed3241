use crate::error::{IngestError, Result};
use crate::schema::{FinancialStatementExtraction, MovementType};
use crate::utils::round_cents;
use async_trait::async_trait;
use log::{debug, info};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::path::Path;
use std::sync::{Arc, Mutex};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS movements (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        competency TEXT NOT NULL,
        project_code TEXT NOT NULL,
        project_name TEXT,
        movement_type TEXT NOT NULL,
        amount REAL NOT NULL,
        source TEXT,
        inserted_at DATETIME DEFAULT CURRENT_TIMESTAMP,
        UNIQUE(competency, project_code, movement_type)
    );
    CREATE TABLE IF NOT EXISTS uploads (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        filename TEXT NOT NULL,
        competency TEXT,
        uploaded_at DATETIME DEFAULT CURRENT_TIMESTAMP,
        status TEXT NOT NULL DEFAULT 'processed'
    );
    CREATE INDEX IF NOT EXISTS idx_movements_project ON movements(project_code);
";

/// One row of the movements table before it is written.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Movement {
    pub competency: String,
    pub project_code: String,
    pub project_name: Option<String>,
    pub movement_type: MovementType,
    pub amount: f64,
    pub source: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    Processed,
    Error,
}

impl UploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processed => "processed",
            Self::Error => "error",
        }
    }
}

/// Relational sink for validated records.
#[async_trait]
pub trait MovementStore: Send + Sync {
    /// Idempotent: overwrites any row with the same
    /// (competency, project_code, movement_type).
    async fn upsert_movement(&self, movement: Movement) -> Result<()>;

    async fn record_upload(
        &self,
        filename: &str,
        competency: Option<&str>,
        status: UploadStatus,
    ) -> Result<()>;

    /// Writes every movement of one document plus its upload marker, all or
    /// nothing. Returns the number of movements written.
    async fn persist_document(
        &self,
        filename: &str,
        records: &[FinancialStatementExtraction],
    ) -> Result<usize>;
}

/// Maps a validated record to one movement per type it informs.
pub fn movements_for(record: &FinancialStatementExtraction, source: &str) -> Vec<Movement> {
    let movement = |movement_type: MovementType, amount: f64| Movement {
        competency: record.competency.clone(),
        project_code: record.project_code.clone(),
        project_name: record.project_name.clone(),
        movement_type,
        amount: round_cents(amount),
        source: source.to_string(),
    };
    let has_revenue = |movement_type: MovementType| {
        record
            .revenues
            .iter()
            .any(|r| r.movement_type == movement_type)
    };

    let mut movements = vec![movement(MovementType::Expense, record.expenses_total)];

    if let Some(pool) = &record.pooled_contribution {
        movements.push(movement(
            MovementType::ProratedContribution,
            pool.allocated_amount,
        ));
    } else if has_revenue(MovementType::ProratedContribution) {
        movements.push(movement(
            MovementType::ProratedContribution,
            record.revenue_total_for(MovementType::ProratedContribution),
        ));
    }

    for movement_type in [MovementType::Profitability, MovementType::Other] {
        if has_revenue(movement_type) {
            movements.push(movement(
                movement_type,
                record.revenue_total_for(movement_type),
            ));
        }
    }

    if let Some(closing) = record.closing_balance.value() {
        movements.push(movement(MovementType::ClosingBalance, closing));
    }

    movements
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredMovement {
    pub id: i64,
    pub competency: String,
    pub project_code: String,
    pub project_name: Option<String>,
    pub movement_type: MovementType,
    pub amount: f64,
    pub source: Option<String>,
    pub inserted_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProjectSummary {
    pub project_code: String,
    pub project_name: Option<String>,
    pub expenses: f64,
    pub prorated_contributions: f64,
    pub profitability: f64,
    pub closing_balance: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PortfolioTotals {
    pub expenses: f64,
    pub prorated_contributions: f64,
    pub profitability: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PortfolioSummary {
    pub projects: Vec<ProjectSummary>,
    pub totals: PortfolioTotals,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreCounts {
    pub movements: u64,
    pub uploads: u64,
}

/// SQLite-backed store. Statements run on the blocking pool behind one
/// connection.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        info!("Opening movement store at {}", path.display());
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.busy_timeout(std::time::Duration::from_secs(10))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_connection<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            f(&mut guard)
        })
        .await
        .map_err(|e| IngestError::Io(std::io::Error::other(e.to_string())))?
    }

    /// Movements ordered by competency (newest first) then project code.
    pub async fn list_movements(
        &self,
        competency: Option<&str>,
        project_code: Option<&str>,
    ) -> Result<Vec<StoredMovement>> {
        let competency = competency.map(str::to_string);
        let project_code = project_code.map(str::to_string);

        self.with_connection(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, competency, project_code, project_name, movement_type, amount, source,
                        CAST(inserted_at AS TEXT)
                 FROM movements
                 WHERE (?1 IS NULL OR competency = ?1)
                   AND (?2 IS NULL OR project_code = ?2)
                 ORDER BY substr(competency, 4, 4) DESC, substr(competency, 1, 2) DESC,
                          project_code ASC, movement_type ASC",
            )?;
            let rows = stmt
                .query_map(params![competency, project_code], |row| {
                    let movement_type: String = row.get(4)?;
                    Ok(StoredMovement {
                        id: row.get(0)?,
                        competency: row.get(1)?,
                        project_code: row.get(2)?,
                        project_name: row.get(3)?,
                        movement_type: MovementType::from_label(&movement_type),
                        amount: row.get(5)?,
                        source: row.get(6)?,
                        inserted_at: row.get(7)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    /// Per-project sums of each movement type, largest expense first.
    pub async fn project_summary(&self) -> Result<PortfolioSummary> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT project_code, MAX(project_name),
                        COALESCE(SUM(CASE WHEN movement_type = 'Expense' THEN amount END), 0),
                        COALESCE(SUM(CASE WHEN movement_type = 'ProratedContribution' THEN amount END), 0),
                        COALESCE(SUM(CASE WHEN movement_type = 'Profitability' THEN amount END), 0),
                        COALESCE(SUM(CASE WHEN movement_type = 'ClosingBalance' THEN amount END), 0)
                 FROM movements
                 GROUP BY project_code
                 ORDER BY 3 DESC, project_code ASC",
            )?;
            let projects = stmt
                .query_map([], |row| {
                    Ok(ProjectSummary {
                        project_code: row.get(0)?,
                        project_name: row.get(1)?,
                        expenses: row.get(2)?,
                        prorated_contributions: row.get(3)?,
                        profitability: row.get(4)?,
                        closing_balance: row.get(5)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            let totals = conn.query_row(
                "SELECT COALESCE(SUM(CASE WHEN movement_type = 'Expense' THEN amount END), 0),
                        COALESCE(SUM(CASE WHEN movement_type = 'ProratedContribution' THEN amount END), 0),
                        COALESCE(SUM(CASE WHEN movement_type = 'Profitability' THEN amount END), 0)
                 FROM movements",
                [],
                |row| {
                    Ok(PortfolioTotals {
                        expenses: row.get(0)?,
                        prorated_contributions: row.get(1)?,
                        profitability: row.get(2)?,
                    })
                },
            )?;

            Ok(PortfolioSummary { projects, totals })
        })
        .await
    }

    pub async fn counts(&self) -> Result<StoreCounts> {
        self.with_connection(|conn| {
            let movements: i64 = conn.query_row("SELECT COUNT(*) FROM movements", [], |r| r.get(0))?;
            let uploads: i64 = conn.query_row("SELECT COUNT(*) FROM uploads", [], |r| r.get(0))?;
            Ok(StoreCounts {
                movements: movements.max(0) as u64,
                uploads: uploads.max(0) as u64,
            })
        })
        .await
    }

    /// Status of the most recent upload row for a filename.
    pub async fn last_upload_status(&self, filename: &str) -> Result<Option<String>> {
        let filename = filename.to_string();
        self.with_connection(move |conn| {
            let status = conn
                .query_row(
                    "SELECT status FROM uploads WHERE filename = ?1 ORDER BY id DESC LIMIT 1",
                    params![filename],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(status)
        })
        .await
    }
}

/// The competency every record shares, or `None` when a document spans
/// several periods.
fn document_competency(records: &[FinancialStatementExtraction]) -> Option<String> {
    let first = &records.first()?.competency;
    if records.iter().all(|r| &r.competency == first) {
        Some(first.clone())
    } else {
        debug!(
            "Document spans {} records across several competencies",
            records.len()
        );
        None
    }
}

fn upsert(conn: &Connection, movement: &Movement) -> rusqlite::Result<usize> {
    conn.execute(
        "INSERT OR REPLACE INTO movements
            (competency, project_code, project_name, movement_type, amount, source)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            movement.competency,
            movement.project_code,
            movement.project_name,
            movement.movement_type.as_str(),
            movement.amount,
            movement.source,
        ],
    )
}

fn insert_upload(
    conn: &Connection,
    filename: &str,
    competency: Option<&str>,
    status: UploadStatus,
) -> rusqlite::Result<usize> {
    conn.execute(
        "INSERT INTO uploads (filename, competency, status) VALUES (?1, ?2, ?3)",
        params![filename, competency, status.as_str()],
    )
}

#[async_trait]
impl MovementStore for SqliteStore {
    async fn upsert_movement(&self, movement: Movement) -> Result<()> {
        self.with_connection(move |conn| {
            upsert(conn, &movement)?;
            Ok(())
        })
        .await
    }

    async fn record_upload(
        &self,
        filename: &str,
        competency: Option<&str>,
        status: UploadStatus,
    ) -> Result<()> {
        let filename = filename.to_string();
        let competency = competency.map(str::to_string);
        self.with_connection(move |conn| {
            insert_upload(conn, &filename, competency.as_deref(), status)?;
            Ok(())
        })
        .await
    }

    async fn persist_document(
        &self,
        filename: &str,
        records: &[FinancialStatementExtraction],
    ) -> Result<usize> {
        let movements: Vec<Movement> = records
            .iter()
            .flat_map(|record| movements_for(record, filename))
            .collect();
        let competency = document_competency(records);
        let filename = filename.to_string();

        self.with_connection(move |conn| {
            let tx = conn.transaction()?;
            for movement in &movements {
                upsert(&tx, movement)?;
            }
            insert_upload(&tx, &filename, competency.as_deref(), UploadStatus::Processed)?;
            tx.commit()?;

            debug!(
                "{}: committed {} movement(s)",
                filename,
                movements.len()
            );
            Ok(movements.len())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validator::validate_extraction;
    use serde_json::json;

    fn record() -> FinancialStatementExtraction {
        validate_extraction(&json!({
            "competency": "09/2025",
            "project_code": "616",
            "project_name": "Fiação Enterrada",
            "opening_balance": 282995.57,
            "closing_balance": 355854.25,
            "expenses": [{"description": "Serviço", "amount": 82.60, "category": "Services"}],
            "revenues": [
                {"type": "Rentabilidade", "amount": 72941.28},
                {"type": "Reembolso", "amount": 0.00}
            ],
            "pooled_contribution": {
                "total_pool_amount": 5483433.37,
                "all_documents_expense_total": 7319162.16
            }
        }))
        .unwrap()
        .remove(0)
    }

    #[test]
    fn test_movement_mapping() {
        let movements = movements_for(&record(), "posicao.pdf");
        let by_type = |t: MovementType| {
            movements
                .iter()
                .find(|m| m.movement_type == t)
                .map(|m| m.amount)
        };
        assert_eq!(by_type(MovementType::Expense), Some(82.60));
        assert_eq!(by_type(MovementType::Profitability), Some(72941.28));
        assert_eq!(by_type(MovementType::ClosingBalance), Some(355854.25));
        assert_eq!(by_type(MovementType::Other), Some(0.0));
        assert!(by_type(MovementType::ProratedContribution).is_some());
        assert!(movements.iter().all(|m| m.source == "posicao.pdf"));
    }

    #[tokio::test]
    async fn test_reprocessing_does_not_duplicate() {
        let store = SqliteStore::open_in_memory().unwrap();
        let rec = record();

        let written = store.persist_document("posicao.pdf", &[rec.clone()]).await.unwrap();
        let first = store.counts().await.unwrap();
        store.persist_document("posicao.pdf", &[rec]).await.unwrap();
        let second = store.counts().await.unwrap();

        assert_eq!(first.movements, written as u64);
        assert_eq!(second.movements, first.movements);
        assert_eq!(second.uploads, 2);
    }

    async fn upload_competency(store: &SqliteStore, filename: &str) -> Option<String> {
        let filename = filename.to_string();
        store
            .with_connection(move |conn| {
                Ok(conn.query_row(
                    "SELECT competency FROM uploads WHERE filename = ?1 ORDER BY id DESC LIMIT 1",
                    params![filename],
                    |row| row.get(0),
                )?)
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_upload_competency_for_mixed_periods() {
        let store = SqliteStore::open_in_memory().unwrap();
        let september = record();
        let mut october = record();
        october.competency = "10/2025".to_string();
        october.project_code = "562".to_string();

        store
            .persist_document("mesmo_mes.pdf", &[september.clone(), september.clone()])
            .await
            .unwrap();
        store
            .persist_document("dois_meses.pdf", &[september, october])
            .await
            .unwrap();

        assert_eq!(
            upload_competency(&store, "mesmo_mes.pdf").await.as_deref(),
            Some("09/2025")
        );
        assert_eq!(upload_competency(&store, "dois_meses.pdf").await, None);
        assert_eq!(
            store.list_movements(Some("10/2025"), Some("562")).await.unwrap().len(),
            store.list_movements(Some("09/2025"), Some("616")).await.unwrap().len()
        );
    }

    #[tokio::test]
    async fn test_last_writer_wins() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut movement = Movement {
            competency: "09/2025".into(),
            project_code: "BCO".into(),
            project_name: None,
            movement_type: MovementType::Expense,
            amount: 10.0,
            source: "a.pdf".into(),
        };
        store.upsert_movement(movement.clone()).await.unwrap();
        movement.amount = 12.5;
        movement.source = "b.pdf".into();
        store.upsert_movement(movement).await.unwrap();

        let rows = store.list_movements(Some("09/2025"), Some("BCO")).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].amount, 12.5);
        assert_eq!(rows[0].source.as_deref(), Some("b.pdf"));
    }

    #[tokio::test]
    async fn test_listing_order_and_filters() {
        let store = SqliteStore::open_in_memory().unwrap();
        for (competency, code) in [("08/2025", "616"), ("12/2024", "BCO"), ("09/2025", "562"), ("09/2025", "BCO")] {
            store
                .upsert_movement(Movement {
                    competency: competency.into(),
                    project_code: code.into(),
                    project_name: None,
                    movement_type: MovementType::Expense,
                    amount: 1.0,
                    source: "x.pdf".into(),
                })
                .await
                .unwrap();
        }

        let all = store.list_movements(None, None).await.unwrap();
        let keys: Vec<_> = all
            .iter()
            .map(|m| (m.competency.as_str(), m.project_code.as_str()))
            .collect();
        assert_eq!(
            keys,
            vec![("09/2025", "562"), ("09/2025", "BCO"), ("08/2025", "616"), ("12/2024", "BCO")]
        );

        let bco = store.list_movements(None, Some("BCO")).await.unwrap();
        assert_eq!(bco.len(), 2);
    }

    #[tokio::test]
    async fn test_summary_and_failed_uploads() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.persist_document("posicao.pdf", &[record()]).await.unwrap();
        store
            .record_upload("scan.pdf", None, UploadStatus::Error)
            .await
            .unwrap();

        let summary = store.project_summary().await.unwrap();
        assert_eq!(summary.projects.len(), 1);
        assert_eq!(summary.projects[0].project_code, "616");
        assert!((summary.projects[0].expenses - 82.60).abs() < 1e-9);
        assert!((summary.totals.profitability - 72941.28).abs() < 1e-9);

        assert_eq!(
            store.last_upload_status("scan.pdf").await.unwrap().as_deref(),
            Some("error")
        );
        assert_eq!(
            store.last_upload_status("posicao.pdf").await.unwrap().as_deref(),
            Some("processed")
        );
    }

    #[tokio::test]
    async fn test_on_disk_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("historico.db");

        let store = SqliteStore::open(&path).unwrap();
        store.persist_document("posicao.pdf", &[record()]).await.unwrap();
        drop(store);

        let reopened = SqliteStore::open(&path).unwrap();
        assert!(reopened.counts().await.unwrap().movements >= 4);
    }
}
