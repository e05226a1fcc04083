/// SQLite persistence for drip sequences and enrollments

use crate::db::{from_millis, opt_from_millis, to_millis};
use crate::drip::types::{DripSequence, DripStep, Enrollment, EnrollmentStatus};
use crate::integrations::MessageChannel;
use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnection, SqlitePool, SqliteRow},
    Row,
};

#[derive(Debug, Clone)]
pub struct DripStorage {
    pool: SqlitePool,
}

/// Counter increments applied to a sequence in one tick step
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterDelta {
    pub sent: i64,
    pub delivered: i64,
    pub failed: i64,
}

impl DripStorage {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn insert_sequence(&self, sequence: &DripSequence) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO drip_sequences
                (id, user_id, name, channel, total_sent, total_delivered, total_replied,
                 total_failed, created_at, updated_at)
            VALUES (?, ?, ?, ?, 0, 0, 0, 0, ?, ?)
            "#,
        )
        .bind(&sequence.id)
        .bind(&sequence.user_id)
        .bind(&sequence.name)
        .bind(sequence.channel.as_str())
        .bind(to_millis(sequence.created_at))
        .bind(to_millis(sequence.updated_at))
        .execute(&mut *tx)
        .await?;

        for step in &sequence.steps {
            sqlx::query(
                r#"
                INSERT INTO drip_steps
                    (sequence_id, step_order, delay_days, delay_hours, subject, body, skip_if_engaged)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&sequence.id)
            .bind(step.step_order)
            .bind(step.delay_days)
            .bind(step.delay_hours)
            .bind(&step.subject)
            .bind(&step.body)
            .bind(step.skip_if_engaged)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn get_sequence(&self, user_id: &str, sequence_id: &str) -> Result<Option<DripSequence>> {
        let row = sqlx::query("SELECT * FROM drip_sequences WHERE id = ? AND user_id = ?")
            .bind(sequence_id)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(self.hydrate(&row).await?)),
            None => Ok(None),
        }
    }

    /// Unscoped lookup for the tick, which works from already tenant-owned enrollments
    pub async fn load_sequence(&self, sequence_id: &str) -> Result<Option<DripSequence>> {
        let row = sqlx::query("SELECT * FROM drip_sequences WHERE id = ?")
            .bind(sequence_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(self.hydrate(&row).await?)),
            None => Ok(None),
        }
    }

    pub async fn list_sequences(&self, user_id: &str) -> Result<Vec<DripSequence>> {
        let rows = sqlx::query("SELECT * FROM drip_sequences WHERE user_id = ? ORDER BY created_at DESC, id DESC")
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;

        let mut sequences = Vec::with_capacity(rows.len());
        for row in rows {
            sequences.push(self.hydrate(&row).await?);
        }
        Ok(sequences)
    }

    async fn hydrate(&self, row: &SqliteRow) -> Result<DripSequence> {
        let mut sequence = sequence_from_row(row)?;
        let steps = sqlx::query("SELECT * FROM drip_steps WHERE sequence_id = ? ORDER BY step_order ASC")
            .bind(&sequence.id)
            .fetch_all(&self.pool)
            .await?;
        sequence.steps = steps.iter().map(step_from_row).collect::<Result<_>>()?;
        Ok(sequence)
    }

    pub async fn insert_enrollment(&self, enrollment: &Enrollment) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO drip_enrollments
                (id, user_id, sequence_id, contact_id, contact_name, email, phone, status,
                 current_step, next_send_at, enrolled_at, last_engaged_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&enrollment.id)
        .bind(&enrollment.user_id)
        .bind(&enrollment.sequence_id)
        .bind(&enrollment.contact_id)
        .bind(&enrollment.contact_name)
        .bind(&enrollment.email)
        .bind(&enrollment.phone)
        .bind(enrollment.status.as_str())
        .bind(enrollment.current_step)
        .bind(enrollment.next_send_at.map(to_millis))
        .bind(to_millis(enrollment.enrolled_at))
        .bind(enrollment.last_engaged_at.map(to_millis))
        .bind(to_millis(enrollment.updated_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_enrollment(&self, user_id: &str, enrollment_id: &str) -> Result<Option<Enrollment>> {
        let row = sqlx::query("SELECT * FROM drip_enrollments WHERE id = ? AND user_id = ?")
            .bind(enrollment_id)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(enrollment_from_row).transpose()
    }

    pub async fn list_enrollments(&self, user_id: &str, sequence_id: &str) -> Result<Vec<Enrollment>> {
        let rows = sqlx::query(
            "SELECT * FROM drip_enrollments WHERE user_id = ? AND sequence_id = ? ORDER BY enrolled_at ASC, id ASC",
        )
        .bind(user_id)
        .bind(sequence_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(enrollment_from_row).collect()
    }

    /// ACTIVE enrollments whose next message is due, oldest first
    pub async fn due_enrollments(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Enrollment>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM drip_enrollments
            WHERE status = 'ACTIVE' AND next_send_at IS NOT NULL AND next_send_at <= ?
            ORDER BY next_send_at ASC, id ASC
            LIMIT ?
            "#,
        )
        .bind(to_millis(now))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(enrollment_from_row).collect()
    }

    /// Record a reply: stamp engagement and count it on the sequence, atomically
    pub async fn record_reply(&self, user_id: &str, enrollment_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            r#"
            UPDATE drip_enrollments SET last_engaged_at = ?, updated_at = ?
            WHERE id = ? AND user_id = ?
            RETURNING sequence_id
            "#,
        )
        .bind(to_millis(now))
        .bind(to_millis(now))
        .bind(enrollment_id)
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            return Ok(false);
        };
        let sequence_id: String = row.try_get("sequence_id")?;

        sqlx::query("UPDATE drip_sequences SET total_replied = total_replied + 1, updated_at = ? WHERE id = ?")
            .bind(to_millis(now))
            .bind(&sequence_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }

    pub async fn cancel_enrollment(&self, user_id: &str, enrollment_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE drip_enrollments SET status = 'CANCELLED', next_send_at = NULL, updated_at = ?
            WHERE id = ? AND user_id = ? AND status = 'ACTIVE'
            "#,
        )
        .bind(to_millis(now))
        .bind(enrollment_id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

/// Move an ACTIVE enrollment from `from_step` to `to_step`. The step guard makes a
/// concurrent second tick on the same enrollment a no-op.
pub async fn advance_enrollment(
    conn: &mut SqliteConnection,
    enrollment_id: &str,
    from_step: i64,
    to_step: i64,
    status: EnrollmentStatus,
    next_send_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE drip_enrollments
        SET current_step = ?, status = ?, next_send_at = ?, updated_at = ?
        WHERE id = ? AND status = 'ACTIVE' AND current_step = ?
        "#,
    )
    .bind(to_step)
    .bind(status.as_str())
    .bind(next_send_at.map(to_millis))
    .bind(to_millis(now))
    .bind(enrollment_id)
    .bind(from_step)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn bump_counters(
    conn: &mut SqliteConnection,
    sequence_id: &str,
    delta: CounterDelta,
    now: DateTime<Utc>,
) -> Result<()> {
    if delta == CounterDelta::default() {
        return Ok(());
    }
    sqlx::query(
        r#"
        UPDATE drip_sequences
        SET total_sent = total_sent + ?, total_delivered = total_delivered + ?,
            total_failed = total_failed + ?, updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(delta.sent)
    .bind(delta.delivered)
    .bind(delta.failed)
    .bind(to_millis(now))
    .bind(sequence_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

fn sequence_from_row(row: &SqliteRow) -> Result<DripSequence> {
    let channel: String = row.try_get("channel")?;
    Ok(DripSequence {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        name: row.try_get("name")?,
        channel: MessageChannel::parse(&channel)?,
        steps: Vec::new(),
        total_sent: row.try_get("total_sent")?,
        total_delivered: row.try_get("total_delivered")?,
        total_replied: row.try_get("total_replied")?,
        total_failed: row.try_get("total_failed")?,
        created_at: from_millis(row.try_get("created_at")?),
        updated_at: from_millis(row.try_get("updated_at")?),
    })
}

fn step_from_row(row: &SqliteRow) -> Result<DripStep> {
    Ok(DripStep {
        step_order: row.try_get("step_order")?,
        delay_days: row.try_get("delay_days")?,
        delay_hours: row.try_get("delay_hours")?,
        subject: row.try_get("subject")?,
        body: row.try_get("body")?,
        skip_if_engaged: row.try_get("skip_if_engaged")?,
    })
}

fn enrollment_from_row(row: &SqliteRow) -> Result<Enrollment> {
    let status: String = row.try_get("status")?;
    Ok(Enrollment {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        sequence_id: row.try_get("sequence_id")?,
        contact_id: row.try_get("contact_id")?,
        contact_name: row.try_get("contact_name")?,
        email: row.try_get("email")?,
        phone: row.try_get("phone")?,
        status: EnrollmentStatus::parse(&status)?,
        current_step: row.try_get("current_step")?,
        next_send_at: opt_from_millis(row.try_get("next_send_at")?),
        enrolled_at: from_millis(row.try_get("enrolled_at")?),
        last_engaged_at: opt_from_millis(row.try_get("last_engaged_at")?),
        updated_at: from_millis(row.try_get("updated_at")?),
    })
}
