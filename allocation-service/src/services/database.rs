//! PostgreSQL ledger and escalation queue for allocation-service.

use crate::error::AllocationError;
use crate::models::{
    Allocation, CandidateMatch, CreditSource, DecisionLogEntry, DecisionOutcome, EscalationReason,
    EscalationStatus, EscalationTicket, IncomingPayment, Invoice, InvoiceStatus, MatchType,
    MatchedBy,
};
use crate::services::escalation::EscalationQueue;
use crate::services::ledger::{
    apply_credit_update, apply_invoice_update, check_shape, LedgerStore, LedgerTransaction,
    PaymentGuard,
};
use crate::services::metrics::DB_QUERY_DURATION;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{FromRow, Postgres, Transaction};
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

const UNIQUE_VIOLATION: &str = "23505";

fn db_error(context: &str, e: impl std::fmt::Display) -> AllocationError {
    AllocationError::DatabaseError(anyhow::anyhow!("{}: {}", context, e))
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.code().as_deref() == Some(UNIQUE_VIOLATION))
}

// ============================================================================
// Row types
// ============================================================================

#[derive(Debug, FromRow)]
struct InvoiceRow {
    tenant_id: String,
    invoice_id: String,
    contact_id: String,
    invoice_number: String,
    total_minor_units: i64,
    amount_due_minor_units: i64,
    contact_name: String,
    status: String,
    issue_date: NaiveDate,
}

impl TryFrom<InvoiceRow> for Invoice {
    type Error = AllocationError;

    fn try_from(row: InvoiceRow) -> Result<Self, Self::Error> {
        let status = InvoiceStatus::parse(&row.status)
            .ok_or_else(|| db_error("Unknown invoice status", &row.status))?;
        Ok(Invoice {
            id: row.invoice_id,
            tenant_id: row.tenant_id,
            contact_id: row.contact_id,
            invoice_number: row.invoice_number,
            total_minor_units: row.total_minor_units,
            amount_due_minor_units: row.amount_due_minor_units,
            contact_name: row.contact_name,
            status,
            issue_date: row.issue_date,
        })
    }
}

#[derive(Debug, FromRow)]
struct AllocationRow {
    allocation_id: Uuid,
    tenant_id: String,
    contact_id: String,
    payment_id: String,
    invoice_id: String,
    amount_minor_units: i64,
    match_type: String,
    matched_by: String,
    confidence: i16,
    credit_delta_minor_units: i64,
    created_utc: DateTime<Utc>,
    is_reversed: bool,
    reversed_utc: Option<DateTime<Utc>>,
    reversal_reason: Option<String>,
}

impl TryFrom<AllocationRow> for Allocation {
    type Error = AllocationError;

    fn try_from(row: AllocationRow) -> Result<Self, Self::Error> {
        Ok(Allocation {
            id: row.allocation_id,
            tenant_id: row.tenant_id,
            contact_id: row.contact_id,
            payment_id: row.payment_id,
            invoice_id: row.invoice_id,
            amount_minor_units: row.amount_minor_units,
            match_type: MatchType::parse(&row.match_type)
                .ok_or_else(|| db_error("Unknown match type", &row.match_type))?,
            matched_by: MatchedBy::parse(&row.matched_by)
                .ok_or_else(|| db_error("Unknown matched_by", &row.matched_by))?,
            confidence: row.confidence.clamp(0, 100) as u8,
            credit_delta_minor_units: row.credit_delta_minor_units,
            created_at: row.created_utc,
            is_reversed: row.is_reversed,
            reversed_at: row.reversed_utc,
            reversal_reason: row.reversal_reason,
        })
    }
}

#[derive(Debug, FromRow)]
struct DecisionRow {
    decision_id: Uuid,
    tenant_id: String,
    payment_id: Option<String>,
    contact_id: Option<String>,
    outcome: String,
    candidates: String,
    chosen: Option<String>,
    allocation_ids: Vec<Uuid>,
    escalation_reason: Option<String>,
    reasoning: String,
    created_utc: DateTime<Utc>,
}

impl TryFrom<DecisionRow> for DecisionLogEntry {
    type Error = AllocationError;

    fn try_from(row: DecisionRow) -> Result<Self, Self::Error> {
        let candidates: Vec<CandidateMatch> = serde_json::from_str(&row.candidates)
            .map_err(|e| db_error("Invalid candidates JSON", e))?;
        let chosen: Option<CandidateMatch> = row
            .chosen
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| db_error("Invalid chosen candidate JSON", e))?;
        Ok(DecisionLogEntry {
            id: row.decision_id,
            tenant_id: row.tenant_id,
            payment_id: row.payment_id,
            contact_id: row.contact_id,
            outcome: DecisionOutcome::parse(&row.outcome)
                .ok_or_else(|| db_error("Unknown decision outcome", &row.outcome))?,
            candidates,
            chosen,
            allocation_ids: row.allocation_ids,
            escalation_reason: row
                .escalation_reason
                .as_deref()
                .and_then(EscalationReason::parse),
            reasoning: row.reasoning,
            created_at: row.created_utc,
        })
    }
}

#[derive(Debug, FromRow)]
struct EscalationRow {
    tenant_id: String,
    payment: String,
    reason: String,
    detail: String,
    candidates: String,
    decision_id: Option<Uuid>,
    status: String,
    created_utc: DateTime<Utc>,
    resolved_utc: Option<DateTime<Utc>>,
}

impl TryFrom<EscalationRow> for EscalationTicket {
    type Error = AllocationError;

    fn try_from(row: EscalationRow) -> Result<Self, Self::Error> {
        let payment: IncomingPayment = serde_json::from_str(&row.payment)
            .map_err(|e| db_error("Invalid escalated payment JSON", e))?;
        let candidates: Vec<CandidateMatch> = serde_json::from_str(&row.candidates)
            .map_err(|e| db_error("Invalid escalation candidates JSON", e))?;
        Ok(EscalationTicket {
            tenant_id: row.tenant_id,
            payment,
            reason: EscalationReason::parse(&row.reason)
                .ok_or_else(|| db_error("Unknown escalation reason", &row.reason))?,
            detail: row.detail,
            candidates,
            decision_id: row.decision_id,
            status: match row.status.as_str() {
                "resolved" => EscalationStatus::Resolved,
                _ => EscalationStatus::Pending,
            },
            created_at: row.created_utc,
            resolved_at: row.resolved_utc,
        })
    }
}

const INVOICE_COLUMNS: &str = "tenant_id, invoice_id, contact_id, invoice_number, total_minor_units, amount_due_minor_units, contact_name, status, issue_date";
const ALLOCATION_COLUMNS: &str = "allocation_id, tenant_id, contact_id, payment_id, invoice_id, amount_minor_units, match_type, matched_by, confidence, credit_delta_minor_units, created_utc, is_reversed, reversed_utc, reversal_reason";
const DECISION_COLUMNS: &str = "decision_id, tenant_id, payment_id, contact_id, outcome, candidates::text AS candidates, chosen::text AS chosen, allocation_ids, escalation_reason, reasoning, created_utc";

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "allocation-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AllocationError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| db_error("Failed to connect", e))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AllocationError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| db_error("Migration failed", e))?;
        info!("Database migrations completed");
        Ok(())
    }

    /// Insert or replace an invoice, as synced from the invoicing service.
    #[instrument(skip(self, invoice), fields(tenant_id = %invoice.tenant_id, invoice_id = %invoice.id))]
    pub async fn upsert_invoice(&self, invoice: &Invoice) -> Result<(), AllocationError> {
        invoice.check_consistency()?;
        let timer = DB_QUERY_DURATION
            .with_label_values(&["upsert_invoice"])
            .start_timer();

        sqlx::query(
            r#"
            INSERT INTO invoices (tenant_id, invoice_id, contact_id, invoice_number, total_minor_units, amount_due_minor_units, contact_name, status, issue_date)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (tenant_id, invoice_id) DO UPDATE
            SET contact_id = EXCLUDED.contact_id,
                invoice_number = EXCLUDED.invoice_number,
                total_minor_units = EXCLUDED.total_minor_units,
                amount_due_minor_units = EXCLUDED.amount_due_minor_units,
                contact_name = EXCLUDED.contact_name,
                status = EXCLUDED.status,
                issue_date = EXCLUDED.issue_date,
                updated_utc = NOW()
            "#,
        )
        .bind(&invoice.tenant_id)
        .bind(&invoice.id)
        .bind(&invoice.contact_id)
        .bind(&invoice.invoice_number)
        .bind(invoice.total_minor_units)
        .bind(invoice.amount_due_minor_units)
        .bind(&invoice.contact_name)
        .bind(invoice.status.as_str())
        .bind(invoice.issue_date)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to upsert invoice", e))?;

        timer.observe_duration();
        Ok(())
    }

    // =========================================================================
    // Commit helpers (run inside one transaction)
    // =========================================================================

    async fn check_guard(
        conn: &mut Transaction<'_, Postgres>,
        tenant_id: &str,
        guard: &PaymentGuard,
    ) -> Result<(), AllocationError> {
        let payment_id = guard.payment_id();

        // Serializes commits for the same payment across contacts.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1 || '/' || $2))")
            .bind(tenant_id)
            .bind(payment_id)
            .execute(&mut **conn)
            .await
            .map_err(|e| db_error("Failed to lock payment", e))?;

        let allocated: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM allocations
                WHERE tenant_id = $1 AND payment_id = $2
                  AND NOT is_reversed AND match_type <> 'credit_balance'
            )
            "#,
        )
        .bind(tenant_id)
        .bind(payment_id)
        .fetch_one(&mut **conn)
        .await
        .map_err(|e| db_error("Failed to check payment allocations", e))?;

        let taken = match guard {
            PaymentGuard::Unallocated(_) => allocated,
            PaymentGuard::FirstDecision(_) => {
                allocated || {
                    sqlx::query_scalar::<_, bool>(
                        "SELECT EXISTS (SELECT 1 FROM decision_log WHERE tenant_id = $1 AND idempotency_key = $2)",
                    )
                    .bind(tenant_id)
                    .bind(payment_id)
                    .fetch_one(&mut **conn)
                    .await
                    .map_err(|e| db_error("Failed to check idempotency key", e))?
                }
            }
        };
        if taken {
            return Err(AllocationError::AlreadyProcessed(payment_id.to_string()));
        }
        Ok(())
    }

    async fn insert_allocation(
        conn: &mut Transaction<'_, Postgres>,
        allocation: &Allocation,
    ) -> Result<(), AllocationError> {
        sqlx::query(
            r#"
            INSERT INTO allocations (allocation_id, tenant_id, contact_id, payment_id, invoice_id, amount_minor_units, match_type, matched_by, confidence, credit_delta_minor_units, created_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(allocation.id)
        .bind(&allocation.tenant_id)
        .bind(&allocation.contact_id)
        .bind(&allocation.payment_id)
        .bind(&allocation.invoice_id)
        .bind(allocation.amount_minor_units)
        .bind(allocation.match_type.as_str())
        .bind(allocation.matched_by.as_str())
        .bind(allocation.confidence as i16)
        .bind(allocation.credit_delta_minor_units)
        .bind(allocation.created_at)
        .execute(&mut **conn)
        .await
        .map_err(|e| db_error("Failed to insert allocation", e))?;
        Ok(())
    }

    async fn insert_decision(
        conn: &mut Transaction<'_, Postgres>,
        decision: &DecisionLogEntry,
        idempotency_key: Option<&str>,
    ) -> Result<(), AllocationError> {
        let candidates = serde_json::to_string(&decision.candidates)
            .map_err(|e| db_error("Failed to encode candidates", e))?;
        let chosen = decision
            .chosen
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| db_error("Failed to encode chosen candidate", e))?;

        sqlx::query(
            r#"
            INSERT INTO decision_log (decision_id, tenant_id, payment_id, contact_id, outcome, candidates, chosen, allocation_ids, escalation_reason, reasoning, idempotency_key, created_utc)
            VALUES ($1, $2, $3, $4, $5, $6::jsonb, $7::jsonb, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(decision.id)
        .bind(&decision.tenant_id)
        .bind(&decision.payment_id)
        .bind(&decision.contact_id)
        .bind(decision.outcome.as_str())
        .bind(candidates)
        .bind(chosen)
        .bind(&decision.allocation_ids)
        .bind(decision.escalation_reason.map(|r| r.as_str()))
        .bind(&decision.reasoning)
        .bind(idempotency_key)
        .bind(decision.created_at)
        .execute(&mut **conn)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                AllocationError::AlreadyProcessed(
                    decision.payment_id.clone().unwrap_or_default(),
                )
            } else {
                db_error("Failed to insert decision", e)
            }
        })?;
        Ok(())
    }

    async fn commit_in(
        conn: &mut Transaction<'_, Postgres>,
        tx: &LedgerTransaction,
    ) -> Result<(), AllocationError> {
        let tenant_id = tx.tenant_id.as_str();

        if let Some(guard) = &tx.guard {
            Self::check_guard(conn, tenant_id, guard).await?;
        }

        for reversal in &tx.reversals {
            let current: Option<bool> = sqlx::query_scalar(
                "SELECT is_reversed FROM allocations WHERE tenant_id = $1 AND allocation_id = $2 FOR UPDATE",
            )
            .bind(tenant_id)
            .bind(reversal.allocation_id)
            .fetch_optional(&mut **conn)
            .await
            .map_err(|e| db_error("Failed to lock allocation", e))?;
            match current {
                None => {
                    return Err(AllocationError::NotFound(format!(
                        "allocation {}",
                        reversal.allocation_id
                    )))
                }
                Some(true) => {
                    return Err(AllocationError::ReversalConflict(format!(
                        "allocation {} is already reversed",
                        reversal.allocation_id
                    )))
                }
                Some(false) => {}
            }

            sqlx::query(
                r#"
                UPDATE allocations
                SET is_reversed = TRUE, reversed_utc = $3, reversal_reason = $4
                WHERE tenant_id = $1 AND allocation_id = $2
                "#,
            )
            .bind(tenant_id)
            .bind(reversal.allocation_id)
            .bind(reversal.reversed_at)
            .bind(&reversal.reason)
            .execute(&mut **conn)
            .await
            .map_err(|e| db_error("Failed to reverse allocation", e))?;
        }

        for update in &tx.invoice_updates {
            let row = sqlx::query_as::<_, InvoiceRow>(&format!(
                "SELECT {} FROM invoices WHERE tenant_id = $1 AND invoice_id = $2 FOR UPDATE",
                INVOICE_COLUMNS
            ))
            .bind(tenant_id)
            .bind(&update.invoice_id)
            .fetch_optional(&mut **conn)
            .await
            .map_err(|e| db_error("Failed to lock invoice", e))?
            .ok_or_else(|| AllocationError::NotFound(format!("invoice {}", update.invoice_id)))?;
            let updated = apply_invoice_update(&Invoice::try_from(row)?, update)?;

            sqlx::query(
                r#"
                UPDATE invoices
                SET amount_due_minor_units = $3, status = $4, updated_utc = NOW()
                WHERE tenant_id = $1 AND invoice_id = $2
                "#,
            )
            .bind(tenant_id)
            .bind(&update.invoice_id)
            .bind(updated.amount_due_minor_units)
            .bind(updated.status.as_str())
            .execute(&mut **conn)
            .await
            .map_err(|e| db_error("Failed to update invoice", e))?;
        }

        for allocation in &tx.new_allocations {
            Self::insert_allocation(conn, allocation).await?;
        }

        if let Some(credit) = &tx.credit {
            sqlx::query(
                r#"
                INSERT INTO credit_balances (tenant_id, contact_id, balance_minor_units)
                VALUES ($1, $2, 0)
                ON CONFLICT (tenant_id, contact_id) DO NOTHING
                "#,
            )
            .bind(tenant_id)
            .bind(&credit.contact_id)
            .execute(&mut **conn)
            .await
            .map_err(|e| db_error("Failed to initialise credit balance", e))?;

            let current: i64 = sqlx::query_scalar(
                "SELECT balance_minor_units FROM credit_balances WHERE tenant_id = $1 AND contact_id = $2 FOR UPDATE",
            )
            .bind(tenant_id)
            .bind(&credit.contact_id)
            .fetch_one(&mut **conn)
            .await
            .map_err(|e| db_error("Failed to lock credit balance", e))?;
            let next = apply_credit_update(current, credit)?;

            sqlx::query(
                r#"
                UPDATE credit_balances
                SET balance_minor_units = $3, updated_utc = NOW()
                WHERE tenant_id = $1 AND contact_id = $2
                "#,
            )
            .bind(tenant_id)
            .bind(&credit.contact_id)
            .bind(next)
            .execute(&mut **conn)
            .await
            .map_err(|e| db_error("Failed to update credit balance", e))?;
        }

        Self::insert_decision(conn, &tx.decision, tx.idempotency_key()).await
    }
}

#[async_trait]
impl LedgerStore for Database {
    #[instrument(skip(self), fields(tenant_id = %tenant_id, contact_id = %contact_id))]
    async fn find_open_invoices_for_contact(
        &self,
        tenant_id: &str,
        contact_id: &str,
    ) -> Result<Vec<Invoice>, AllocationError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_open_invoices"])
            .start_timer();

        let rows = sqlx::query_as::<_, InvoiceRow>(&format!(
            r#"
            SELECT {}
            FROM invoices
            WHERE tenant_id = $1 AND contact_id = $2
              AND amount_due_minor_units > 0 AND status <> 'void'
            ORDER BY issue_date, invoice_number, invoice_id
            "#,
            INVOICE_COLUMNS
        ))
        .bind(tenant_id)
        .bind(contact_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to list open invoices", e))?;

        timer.observe_duration();
        rows.into_iter().map(Invoice::try_from).collect()
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, invoice_id = %invoice_id))]
    async fn get_invoice(
        &self,
        tenant_id: &str,
        invoice_id: &str,
    ) -> Result<Option<Invoice>, AllocationError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_invoice"])
            .start_timer();

        let row = sqlx::query_as::<_, InvoiceRow>(&format!(
            "SELECT {} FROM invoices WHERE tenant_id = $1 AND invoice_id = $2",
            INVOICE_COLUMNS
        ))
        .bind(tenant_id)
        .bind(invoice_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to get invoice", e))?;

        timer.observe_duration();
        row.map(Invoice::try_from).transpose()
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, contact_id = %contact_id))]
    async fn get_credit_balance(
        &self,
        tenant_id: &str,
        contact_id: &str,
    ) -> Result<i64, AllocationError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_credit_balance"])
            .start_timer();

        let balance: Option<i64> = sqlx::query_scalar(
            "SELECT balance_minor_units FROM credit_balances WHERE tenant_id = $1 AND contact_id = $2",
        )
        .bind(tenant_id)
        .bind(contact_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to get credit balance", e))?;

        timer.observe_duration();
        Ok(balance.unwrap_or(0))
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, payment_id = %payment_id))]
    async fn allocations_for_payment(
        &self,
        tenant_id: &str,
        payment_id: &str,
    ) -> Result<Vec<Allocation>, AllocationError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["allocations_for_payment"])
            .start_timer();

        let rows = sqlx::query_as::<_, AllocationRow>(&format!(
            "SELECT {} FROM allocations WHERE tenant_id = $1 AND payment_id = $2 ORDER BY created_utc, allocation_id",
            ALLOCATION_COLUMNS
        ))
        .bind(tenant_id)
        .bind(payment_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to list allocations", e))?;

        timer.observe_duration();
        rows.into_iter().map(Allocation::try_from).collect()
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, allocation_id = %allocation_id))]
    async fn get_allocation(
        &self,
        tenant_id: &str,
        allocation_id: Uuid,
    ) -> Result<Option<Allocation>, AllocationError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_allocation"])
            .start_timer();

        let row = sqlx::query_as::<_, AllocationRow>(&format!(
            "SELECT {} FROM allocations WHERE tenant_id = $1 AND allocation_id = $2",
            ALLOCATION_COLUMNS
        ))
        .bind(tenant_id)
        .bind(allocation_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to get allocation", e))?;

        timer.observe_duration();
        row.map(Allocation::try_from).transpose()
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, contact_id = %contact_id))]
    async fn credit_sources(
        &self,
        tenant_id: &str,
        contact_id: &str,
    ) -> Result<Vec<CreditSource>, AllocationError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["credit_sources"])
            .start_timer();

        let rows: Vec<(String, i64, DateTime<Utc>)> = sqlx::query_as(
            r#"
            SELECT payment_id,
                   SUM(credit_delta_minor_units)::BIGINT AS available,
                   COALESCE(MIN(created_utc) FILTER (WHERE credit_delta_minor_units > 0), MIN(created_utc)) AS first_credited_utc
            FROM allocations
            WHERE tenant_id = $1 AND contact_id = $2
              AND NOT is_reversed AND credit_delta_minor_units <> 0
            GROUP BY payment_id
            HAVING SUM(credit_delta_minor_units) > 0
            ORDER BY first_credited_utc, payment_id
            "#,
        )
        .bind(tenant_id)
        .bind(contact_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to list credit sources", e))?;

        timer.observe_duration();
        Ok(rows
            .into_iter()
            .map(|(payment_id, available, first_credited_at)| CreditSource {
                payment_id,
                available_minor_units: available,
                first_credited_at,
            })
            .collect())
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, payment_id = %payment_id))]
    async fn decisions_for_payment(
        &self,
        tenant_id: &str,
        payment_id: &str,
    ) -> Result<Vec<DecisionLogEntry>, AllocationError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["decisions_for_payment"])
            .start_timer();

        let rows = sqlx::query_as::<_, DecisionRow>(&format!(
            "SELECT {} FROM decision_log WHERE tenant_id = $1 AND payment_id = $2 ORDER BY created_utc, decision_id",
            DECISION_COLUMNS
        ))
        .bind(tenant_id)
        .bind(payment_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to list decisions", e))?;

        timer.observe_duration();
        rows.into_iter().map(DecisionLogEntry::try_from).collect()
    }

    #[instrument(skip(self, tx), fields(tenant_id = %tx.tenant_id, decision_id = %tx.decision.id))]
    async fn commit(&self, tx: LedgerTransaction) -> Result<(), AllocationError> {
        check_shape(&tx)?;
        let timer = DB_QUERY_DURATION
            .with_label_values(&["commit"])
            .start_timer();

        let mut conn = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("Failed to begin transaction", e))?;

        // Dropping the transaction on error rolls it back.
        Self::commit_in(&mut conn, &tx).await?;

        conn.commit()
            .await
            .map_err(|e| db_error("Failed to commit transaction", e))?;

        timer.observe_duration();
        info!(
            allocations = tx.new_allocations.len(),
            reversals = tx.reversals.len(),
            outcome = tx.decision.outcome.as_str(),
            "Ledger transaction committed"
        );
        Ok(())
    }

    async fn health_check(&self) -> Result<(), AllocationError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["health_check"])
            .start_timer();

        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("Health check failed", e))?;

        timer.observe_duration();
        Ok(())
    }
}

#[async_trait]
impl EscalationQueue for Database {
    #[instrument(skip(self, ticket), fields(tenant_id = %ticket.tenant_id, payment_id = %ticket.payment.id))]
    async fn push(&self, ticket: EscalationTicket) -> Result<(), AllocationError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["push_escalation"])
            .start_timer();

        let payment = serde_json::to_string(&ticket.payment)
            .map_err(|e| db_error("Failed to encode payment", e))?;
        let candidates = serde_json::to_string(&ticket.candidates)
            .map_err(|e| db_error("Failed to encode candidates", e))?;

        sqlx::query(
            r#"
            INSERT INTO escalations (tenant_id, payment_id, payment, reason, detail, candidates, decision_id, status, created_utc)
            VALUES ($1, $2, $3::jsonb, $4, $5, $6::jsonb, $7, 'pending', $8)
            ON CONFLICT (tenant_id, payment_id) WHERE status = 'pending' DO UPDATE
            SET payment = EXCLUDED.payment,
                reason = EXCLUDED.reason,
                detail = EXCLUDED.detail,
                candidates = EXCLUDED.candidates,
                decision_id = EXCLUDED.decision_id
            "#,
        )
        .bind(&ticket.tenant_id)
        .bind(&ticket.payment.id)
        .bind(payment)
        .bind(ticket.reason.as_str())
        .bind(&ticket.detail)
        .bind(candidates)
        .bind(ticket.decision_id)
        .bind(ticket.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| AllocationError::EscalationError(format!("Failed to push escalation: {}", e)))?;

        timer.observe_duration();
        info!(reason = ticket.reason.as_str(), "Payment escalated for review");
        Ok(())
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    async fn pending(&self, tenant_id: &str) -> Result<Vec<EscalationTicket>, AllocationError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["pending_escalations"])
            .start_timer();

        let rows = sqlx::query_as::<_, EscalationRow>(
            r#"
            SELECT tenant_id, payment::text AS payment, reason, detail, candidates::text AS candidates, decision_id, status, created_utc, resolved_utc
            FROM escalations
            WHERE tenant_id = $1 AND status = 'pending'
            ORDER BY created_utc, payment_id
            "#,
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AllocationError::EscalationError(format!("Failed to list escalations: {}", e)))?;

        timer.observe_duration();
        rows.into_iter().map(EscalationTicket::try_from).collect()
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, payment_id = %payment_id))]
    async fn resolve(&self, tenant_id: &str, payment_id: &str) -> Result<bool, AllocationError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["resolve_escalation"])
            .start_timer();

        let result = sqlx::query(
            r#"
            UPDATE escalations
            SET status = 'resolved', resolved_utc = NOW()
            WHERE tenant_id = $1 AND payment_id = $2 AND status = 'pending'
            "#,
        )
        .bind(tenant_id)
        .bind(payment_id)
        .execute(&self.pool)
        .await
        .map_err(|e| AllocationError::EscalationError(format!("Failed to resolve escalation: {}", e)))?;

        timer.observe_duration();
        Ok(result.rows_affected() > 0)
    }
}
