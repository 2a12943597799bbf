//! `PostgreSQL` implementation of [`BookingStore`].
//!
//! Conditional writes run in a transaction that first takes a transaction-scoped
//! advisory lock on the (provider, service) pair, so overlap checks, lock
//! acquisition and booking insertion for one calendar are serialized. The
//! partial unique index `bookings_active_slot_uniq` backs this up: a unique
//! violation surfaces as [`StoreError::Conflict`].

use super::{BookingFilter, BookingStore, StoreFuture};
use crate::error::StoreError;
use crate::notifications::{Recipient, RecipientFuture, UserDirectory};
use crate::types::{
    Booking, BookingId, BookingStatus, Cancellation, CancellationActor, CancellationPolicy,
    HolderId, Money, PaymentIntentId, PaymentStatus, PolicySnapshot, Provider, ProviderId,
    ReminderFlags, ReminderId, ReminderKind, ReminderSchedule, ReminderStatus, Service,
    ServiceId, SlotKey, SlotLock, UserId, WeeklyHours,
};
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgConnection, Row};
use std::time::Duration;

const BOOKING_COLUMNS: &str = r"
    id, reference, user_id, provider_id, service_id, start_at, end_at, status, policy,
    total_cost_cents, deposit_amount_cents, deposit_paid_cents, payment_status,
    payment_intent_id, confirmation_sent, reminder_24h_sent, reminder_2h_sent,
    cancellation_reason, cancellation_actor, cancelled_at, fee_charged_cents,
    refund_due_cents, rescheduled_to, rescheduled_from, created_at, updated_at
";

const REMINDER_COLUMNS: &str = r"
    id, booking_id, kind, scheduled_for, status, attempts, next_attempt_at, last_error, sent_at
";

/// [`BookingStore`] backed by a `PostgreSQL` pool
#[derive(Debug, Clone)]
pub struct PostgresBookingStore {
    pool: PgPool,
}

impl PostgresBookingStore {
    /// Wrap an existing pool
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect with default pool settings
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the connection fails.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(30))
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    /// Apply the embedded schema migrations
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if a migration fails.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    /// The underlying pool
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }
}

// ============================================================================
// Conversions
// ============================================================================

fn to_db_cents(money: Money) -> Result<i64, StoreError> {
    i64::try_from(money.cents())
        .map_err(|_| StoreError::Serialization(format!("amount out of range: {money}")))
}

fn from_db_cents(cents: i64) -> Result<Money, StoreError> {
    u64::try_from(cents)
        .map(Money::from_cents)
        .map_err(|_| StoreError::Serialization(format!("negative amount: {cents}")))
}

fn to_db_int(value: u32) -> Result<i32, StoreError> {
    i32::try_from(value)
        .map_err(|_| StoreError::Serialization(format!("value out of range: {value}")))
}

fn from_db_int(value: i32) -> Result<u32, StoreError> {
    u32::try_from(value).map_err(|_| StoreError::Serialization(format!("negative value: {value}")))
}

fn row_to_provider(row: &PgRow) -> Result<Provider, StoreError> {
    let hours: Json<WeeklyHours> = row.try_get("hours")?;
    let policy: Json<CancellationPolicy> = row.try_get("policy")?;
    Ok(Provider {
        id: ProviderId::new(row.try_get::<String, _>("id")?),
        name: row.try_get("name")?,
        hours: hours.0,
        utc_offset_minutes: row.try_get("utc_offset_minutes")?,
        policy: policy.0,
    })
}

fn row_to_service(row: &PgRow) -> Result<Service, StoreError> {
    let percentage: i16 = row.try_get("deposit_percentage")?;
    Ok(Service {
        id: ServiceId::new(row.try_get::<String, _>("id")?),
        provider_id: ProviderId::new(row.try_get::<String, _>("provider_id")?),
        name: row.try_get("name")?,
        duration_minutes: from_db_int(row.try_get("duration_minutes")?)?,
        price: from_db_cents(row.try_get("price_cents")?)?,
        deposit_required: row.try_get("deposit_required")?,
        deposit_percentage: u8::try_from(percentage).map_err(|_| {
            StoreError::Serialization(format!("invalid deposit percentage: {percentage}"))
        })?,
        preparation_instructions: row.try_get("preparation_instructions")?,
        version: from_db_int(row.try_get("version")?)?,
    })
}

fn row_to_booking(row: &PgRow) -> Result<Booking, StoreError> {
    let policy: Json<PolicySnapshot> = row.try_get("policy")?;
    let status: String = row.try_get("status")?;
    let payment_status: String = row.try_get("payment_status")?;

    let reason: Option<String> = row.try_get("cancellation_reason")?;
    let actor: Option<String> = row.try_get("cancellation_actor")?;
    let cancelled_at: Option<DateTime<Utc>> = row.try_get("cancelled_at")?;
    let cancellation = match (reason, actor, cancelled_at) {
        (Some(reason), Some(actor), Some(cancelled_at)) => Some(Cancellation {
            reason,
            actor: CancellationActor::parse(&actor)?,
            cancelled_at,
        }),
        _ => None,
    };

    Ok(Booking {
        id: BookingId::new(row.try_get::<String, _>("id")?),
        reference: row.try_get("reference")?,
        user_id: row.try_get::<String, _>("user_id")?.into(),
        provider_id: row.try_get::<String, _>("provider_id")?.into(),
        service_id: row.try_get::<String, _>("service_id")?.into(),
        start: row.try_get("start_at")?,
        end: row.try_get("end_at")?,
        status: BookingStatus::parse(&status)?,
        policy: policy.0,
        total_cost: from_db_cents(row.try_get("total_cost_cents")?)?,
        deposit_amount: from_db_cents(row.try_get("deposit_amount_cents")?)?,
        deposit_paid: from_db_cents(row.try_get("deposit_paid_cents")?)?,
        payment_status: PaymentStatus::parse(&payment_status)?,
        payment_intent_id: row
            .try_get::<Option<String>, _>("payment_intent_id")?
            .map(PaymentIntentId::from),
        confirmation_sent: row.try_get("confirmation_sent")?,
        reminders_sent: ReminderFlags {
            twenty_four_hours: row.try_get("reminder_24h_sent")?,
            two_hours: row.try_get("reminder_2h_sent")?,
        },
        cancellation,
        fee_charged: from_db_cents(row.try_get("fee_charged_cents")?)?,
        refund_due: from_db_cents(row.try_get("refund_due_cents")?)?,
        rescheduled_to: row.try_get::<Option<String>, _>("rescheduled_to")?.map(BookingId::from),
        rescheduled_from: row
            .try_get::<Option<String>, _>("rescheduled_from")?
            .map(BookingId::from),
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_reminder(row: &PgRow) -> Result<ReminderSchedule, StoreError> {
    let kind: String = row.try_get("kind")?;
    let status: String = row.try_get("status")?;
    Ok(ReminderSchedule {
        id: ReminderId::new(row.try_get::<String, _>("id")?),
        booking_id: BookingId::new(row.try_get::<String, _>("booking_id")?),
        kind: ReminderKind::parse(&kind)?,
        scheduled_for: row.try_get("scheduled_for")?,
        status: ReminderStatus::parse(&status)?,
        attempts: from_db_int(row.try_get("attempts")?)?,
        next_attempt_at: row.try_get("next_attempt_at")?,
        last_error: row.try_get("last_error")?,
        sent_at: row.try_get("sent_at")?,
    })
}

// ============================================================================
// Transaction helpers
// ============================================================================

/// Serialize writers of one (provider, service) calendar until commit
async fn lock_calendar(
    conn: &mut PgConnection,
    provider_id: &ProviderId,
    service_id: &ServiceId,
) -> Result<(), StoreError> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
        .bind(format!("{provider_id}:{service_id}"))
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn overlap_exists(
    conn: &mut PgConnection,
    provider_id: &ProviderId,
    service_id: &ServiceId,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    ignore: Option<&BookingId>,
) -> Result<bool, StoreError> {
    let (exists,): (bool,) = sqlx::query_as(
        r"
        SELECT EXISTS (
            SELECT 1 FROM bookings
            WHERE provider_id = $1
              AND service_id = $2
              AND status NOT IN ('cancelled', 'rescheduled')
              AND start_at < $4
              AND end_at > $3
              AND ($5::text IS NULL OR id <> $5)
        )
        ",
    )
    .bind(provider_id.as_str())
    .bind(service_id.as_str())
    .bind(start)
    .bind(end)
    .bind(ignore.map(BookingId::as_str))
    .fetch_one(&mut *conn)
    .await?;
    Ok(exists)
}

async fn locked_by_other(
    conn: &mut PgConnection,
    key: &SlotKey,
    holder: Option<&HolderId>,
    now: DateTime<Utc>,
) -> Result<bool, StoreError> {
    let active: Option<(String,)> = sqlx::query_as(
        r"
        SELECT holder_id FROM slot_locks
        WHERE provider_id = $1 AND service_id = $2 AND start_at = $3 AND locked_until >= $4
        ",
    )
    .bind(key.provider_id.as_str())
    .bind(key.service_id.as_str())
    .bind(key.start)
    .bind(now)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(active.is_some_and(|(current,)| holder.is_none_or(|h| h.as_str() != current)))
}

async fn consume_lock(
    conn: &mut PgConnection,
    key: &SlotKey,
    holder: Option<&HolderId>,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    sqlx::query(
        r"
        DELETE FROM slot_locks
        WHERE provider_id = $1 AND service_id = $2 AND start_at = $3
          AND (locked_until < $4 OR holder_id = $5)
        ",
    )
    .bind(key.provider_id.as_str())
    .bind(key.service_id.as_str())
    .bind(key.start)
    .bind(now)
    .bind(holder.map(HolderId::as_str))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn insert_booking_row(conn: &mut PgConnection, booking: &Booking) -> Result<(), StoreError> {
    let cancellation = booking.cancellation.as_ref();
    sqlx::query(
        r"
        INSERT INTO bookings (
            id, reference, user_id, provider_id, service_id, start_at, end_at, status, policy,
            total_cost_cents, deposit_amount_cents, deposit_paid_cents, payment_status,
            payment_intent_id, confirmation_sent, reminder_24h_sent, reminder_2h_sent,
            cancellation_reason, cancellation_actor, cancelled_at, fee_charged_cents,
            refund_due_cents, rescheduled_to, rescheduled_from, created_at, updated_at
        ) VALUES (
            $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13,
            $14, $15, $16, $17, $18, $19, $20, $21, $22, $23, $24, $25, $26
        )
        ",
    )
    .bind(booking.id.as_str())
    .bind(&booking.reference)
    .bind(booking.user_id.as_str())
    .bind(booking.provider_id.as_str())
    .bind(booking.service_id.as_str())
    .bind(booking.start)
    .bind(booking.end)
    .bind(booking.status.as_str())
    .bind(Json(&booking.policy))
    .bind(to_db_cents(booking.total_cost)?)
    .bind(to_db_cents(booking.deposit_amount)?)
    .bind(to_db_cents(booking.deposit_paid)?)
    .bind(booking.payment_status.as_str())
    .bind(booking.payment_intent_id.as_ref().map(PaymentIntentId::as_str))
    .bind(booking.confirmation_sent)
    .bind(booking.reminders_sent.twenty_four_hours)
    .bind(booking.reminders_sent.two_hours)
    .bind(cancellation.map(|c| c.reason.as_str()))
    .bind(cancellation.map(|c| c.actor.as_str()))
    .bind(cancellation.map(|c| c.cancelled_at))
    .bind(to_db_cents(booking.fee_charged)?)
    .bind(to_db_cents(booking.refund_due)?)
    .bind(booking.rescheduled_to.as_ref().map(BookingId::as_str))
    .bind(booking.rescheduled_from.as_ref().map(BookingId::as_str))
    .bind(booking.created_at)
    .bind(booking.updated_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Compare-and-set update. Returns whether a row matched. Delivery flags
/// are only ever raised.
async fn update_booking_row(
    conn: &mut PgConnection,
    booking: &Booking,
    expected: BookingStatus,
) -> Result<bool, StoreError> {
    let cancellation = booking.cancellation.as_ref();
    let result = sqlx::query(
        r"
        UPDATE bookings SET
            status = $3,
            deposit_paid_cents = $4,
            payment_status = $5,
            payment_intent_id = $6,
            confirmation_sent = confirmation_sent OR $7,
            reminder_24h_sent = reminder_24h_sent OR $8,
            reminder_2h_sent = reminder_2h_sent OR $9,
            cancellation_reason = $10,
            cancellation_actor = $11,
            cancelled_at = $12,
            fee_charged_cents = $13,
            refund_due_cents = $14,
            rescheduled_to = $15,
            updated_at = $16
        WHERE id = $1 AND status = $2
        ",
    )
    .bind(booking.id.as_str())
    .bind(expected.as_str())
    .bind(booking.status.as_str())
    .bind(to_db_cents(booking.deposit_paid)?)
    .bind(booking.payment_status.as_str())
    .bind(booking.payment_intent_id.as_ref().map(PaymentIntentId::as_str))
    .bind(booking.confirmation_sent)
    .bind(booking.reminders_sent.twenty_four_hours)
    .bind(booking.reminders_sent.two_hours)
    .bind(cancellation.map(|c| c.reason.as_str()))
    .bind(cancellation.map(|c| c.actor.as_str()))
    .bind(cancellation.map(|c| c.cancelled_at))
    .bind(to_db_cents(booking.fee_charged)?)
    .bind(to_db_cents(booking.refund_due)?)
    .bind(booking.rescheduled_to.as_ref().map(BookingId::as_str))
    .bind(booking.updated_at)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() == 1)
}

async fn booking_exists(conn: &mut PgConnection, id: &BookingId) -> Result<bool, StoreError> {
    let (exists,): (bool,) = sqlx::query_as("SELECT EXISTS (SELECT 1 FROM bookings WHERE id = $1)")
        .bind(id.as_str())
        .fetch_one(&mut *conn)
        .await?;
    Ok(exists)
}

const fn reminder_flag_column(kind: ReminderKind) -> &'static str {
    match kind {
        ReminderKind::TwentyFourHours => "reminder_24h_sent",
        ReminderKind::TwoHours => "reminder_2h_sent",
    }
}

async fn reminder_exists(pool: &PgPool, id: &ReminderId) -> Result<bool, StoreError> {
    let (exists,): (bool,) = sqlx::query_as("SELECT EXISTS (SELECT 1 FROM reminders WHERE id = $1)")
        .bind(id.as_str())
        .fetch_one(pool)
        .await?;
    Ok(exists)
}

// ============================================================================
// Store
// ============================================================================

impl BookingStore for PostgresBookingStore {
    fn put_provider(&self, provider: &Provider) -> StoreFuture<'_, ()> {
        let provider = provider.clone();
        Box::pin(async move {
            sqlx::query(
                r"
                INSERT INTO providers (id, name, hours, utc_offset_minutes, policy)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (id) DO UPDATE SET
                    name = EXCLUDED.name,
                    hours = EXCLUDED.hours,
                    utc_offset_minutes = EXCLUDED.utc_offset_minutes,
                    policy = EXCLUDED.policy
                ",
            )
            .bind(provider.id.as_str())
            .bind(&provider.name)
            .bind(Json(&provider.hours))
            .bind(provider.utc_offset_minutes)
            .bind(Json(&provider.policy))
            .execute(&self.pool)
            .await?;
            Ok(())
        })
    }

    fn get_provider(&self, id: &ProviderId) -> StoreFuture<'_, Option<Provider>> {
        let id = id.clone();
        Box::pin(async move {
            let row = sqlx::query(
                "SELECT id, name, hours, utc_offset_minutes, policy FROM providers WHERE id = $1",
            )
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
            row.as_ref().map(row_to_provider).transpose()
        })
    }

    fn put_service(&self, service: &Service) -> StoreFuture<'_, ()> {
        let service = service.clone();
        Box::pin(async move {
            sqlx::query(
                r"
                INSERT INTO services (
                    id, provider_id, name, duration_minutes, price_cents, deposit_required,
                    deposit_percentage, preparation_instructions, version
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                ON CONFLICT (id) DO UPDATE SET
                    provider_id = EXCLUDED.provider_id,
                    name = EXCLUDED.name,
                    duration_minutes = EXCLUDED.duration_minutes,
                    price_cents = EXCLUDED.price_cents,
                    deposit_required = EXCLUDED.deposit_required,
                    deposit_percentage = EXCLUDED.deposit_percentage,
                    preparation_instructions = EXCLUDED.preparation_instructions,
                    version = EXCLUDED.version
                ",
            )
            .bind(service.id.as_str())
            .bind(service.provider_id.as_str())
            .bind(&service.name)
            .bind(to_db_int(service.duration_minutes)?)
            .bind(to_db_cents(service.price)?)
            .bind(service.deposit_required)
            .bind(i16::from(service.deposit_percentage))
            .bind(service.preparation_instructions.as_deref())
            .bind(to_db_int(service.version)?)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
    }

    fn get_service(&self, id: &ServiceId) -> StoreFuture<'_, Option<Service>> {
        let id = id.clone();
        Box::pin(async move {
            let row = sqlx::query(
                r"
                SELECT id, provider_id, name, duration_minutes, price_cents, deposit_required,
                       deposit_percentage, preparation_instructions, version
                FROM services WHERE id = $1
                ",
            )
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
            row.as_ref().map(row_to_service).transpose()
        })
    }

    fn get_booking(&self, id: &BookingId) -> StoreFuture<'_, Option<Booking>> {
        let id = id.clone();
        Box::pin(async move {
            let row = sqlx::query(&format!("SELECT {BOOKING_COLUMNS} FROM bookings WHERE id = $1"))
                .bind(id.as_str())
                .fetch_optional(&self.pool)
                .await?;
            row.as_ref().map(row_to_booking).transpose()
        })
    }

    fn find_booking_by_intent(
        &self,
        intent_id: &PaymentIntentId,
    ) -> StoreFuture<'_, Option<Booking>> {
        let intent_id = intent_id.clone();
        Box::pin(async move {
            let row = sqlx::query(&format!(
                r"
                SELECT {BOOKING_COLUMNS} FROM bookings
                WHERE payment_intent_id = $1
                ORDER BY (status NOT IN ('cancelled', 'rescheduled')) DESC, created_at DESC
                LIMIT 1
                "
            ))
            .bind(intent_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
            row.as_ref().map(row_to_booking).transpose()
        })
    }

    fn list_bookings(&self, filter: &BookingFilter) -> StoreFuture<'_, Vec<Booking>> {
        let filter = filter.clone();
        Box::pin(async move {
            let rows = sqlx::query(&format!(
                r"
                SELECT {BOOKING_COLUMNS} FROM bookings
                WHERE ($1::text IS NULL OR provider_id = $1)
                  AND ($2::text IS NULL OR service_id = $2)
                  AND ($3::timestamptz IS NULL OR end_at > $3)
                  AND ($4::timestamptz IS NULL OR start_at < $4)
                  AND (NOT $5 OR status NOT IN ('cancelled', 'rescheduled'))
                ORDER BY start_at ASC, created_at ASC
                "
            ))
            .bind(filter.provider_id.as_ref().map(ProviderId::as_str))
            .bind(filter.service_id.as_ref().map(ServiceId::as_str))
            .bind(filter.from)
            .bind(filter.to)
            .bind(filter.active_only)
            .fetch_all(&self.pool)
            .await?;
            rows.iter().map(row_to_booking).collect()
        })
    }

    fn insert_booking(
        &self,
        booking: &Booking,
        holder: Option<&HolderId>,
        now: DateTime<Utc>,
    ) -> StoreFuture<'_, ()> {
        let booking = booking.clone();
        let holder = holder.cloned();
        Box::pin(async move {
            let mut tx = self.pool.begin().await?;
            lock_calendar(&mut tx, &booking.provider_id, &booking.service_id).await?;

            let key = booking.slot_key();
            if booking.occupies_slot()
                && overlap_exists(
                    &mut tx,
                    &booking.provider_id,
                    &booking.service_id,
                    booking.start,
                    booking.end,
                    None,
                )
                .await?
            {
                return Err(StoreError::Conflict);
            }
            if locked_by_other(&mut tx, &key, holder.as_ref(), now).await? {
                return Err(StoreError::Conflict);
            }

            insert_booking_row(&mut tx, &booking).await?;
            consume_lock(&mut tx, &key, holder.as_ref(), now).await?;
            tx.commit().await?;

            tracing::debug!(booking_id = %booking.id, slot = %key, "Booking row inserted");
            Ok(())
        })
    }

    fn update_booking(&self, booking: &Booking, expected: BookingStatus) -> StoreFuture<'_, ()> {
        let booking = booking.clone();
        Box::pin(async move {
            let mut conn = self.pool.acquire().await?;
            if update_booking_row(&mut conn, &booking, expected).await? {
                return Ok(());
            }
            if booking_exists(&mut conn, &booking.id).await? {
                Err(StoreError::Conflict)
            } else {
                Err(StoreError::NotFound)
            }
        })
    }

    fn reschedule_booking(
        &self,
        old: &Booking,
        expected: BookingStatus,
        replacement: &Booking,
        now: DateTime<Utc>,
    ) -> StoreFuture<'_, ()> {
        let old = old.clone();
        let replacement = replacement.clone();
        Box::pin(async move {
            let mut tx = self.pool.begin().await?;
            lock_calendar(&mut tx, &replacement.provider_id, &replacement.service_id).await?;

            if !update_booking_row(&mut tx, &old, expected).await? {
                return Err(if booking_exists(&mut tx, &old.id).await? {
                    StoreError::Conflict
                } else {
                    StoreError::NotFound
                });
            }

            let key = replacement.slot_key();
            if overlap_exists(
                &mut tx,
                &replacement.provider_id,
                &replacement.service_id,
                replacement.start,
                replacement.end,
                Some(&old.id),
            )
            .await?
                || locked_by_other(&mut tx, &key, None, now).await?
            {
                return Err(StoreError::Conflict);
            }

            insert_booking_row(&mut tx, &replacement).await?;
            consume_lock(&mut tx, &key, None, now).await?;
            tx.commit().await?;
            Ok(())
        })
    }

    fn try_acquire_lock(
        &self,
        lock: &SlotLock,
        slot_end: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreFuture<'_, bool> {
        let lock = lock.clone();
        Box::pin(async move {
            let key = &lock.key;
            let mut tx = self.pool.begin().await?;
            lock_calendar(&mut tx, &key.provider_id, &key.service_id).await?;

            let overlapping = overlap_exists(
                &mut tx,
                &key.provider_id,
                &key.service_id,
                key.start,
                slot_end,
                None,
            )
            .await?;
            if overlapping {
                return Ok(false);
            }

            let result = sqlx::query(
                r"
                INSERT INTO slot_locks (provider_id, service_id, start_at, holder_id, locked_until)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (provider_id, service_id, start_at) DO UPDATE SET
                    holder_id = EXCLUDED.holder_id,
                    locked_until = EXCLUDED.locked_until
                WHERE slot_locks.locked_until < $6 OR slot_locks.holder_id = EXCLUDED.holder_id
                ",
            )
            .bind(key.provider_id.as_str())
            .bind(key.service_id.as_str())
            .bind(key.start)
            .bind(lock.holder.as_str())
            .bind(lock.locked_until)
            .bind(now)
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;
            Ok(result.rows_affected() == 1)
        })
    }

    fn release_lock(&self, key: &SlotKey, holder: &HolderId) -> StoreFuture<'_, bool> {
        let key = key.clone();
        let holder = holder.clone();
        Box::pin(async move {
            let result = sqlx::query(
                r"
                DELETE FROM slot_locks
                WHERE provider_id = $1 AND service_id = $2 AND start_at = $3 AND holder_id = $4
                ",
            )
            .bind(key.provider_id.as_str())
            .bind(key.service_id.as_str())
            .bind(key.start)
            .bind(holder.as_str())
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() == 1)
        })
    }

    fn active_lock(&self, key: &SlotKey, now: DateTime<Utc>) -> StoreFuture<'_, Option<SlotLock>> {
        let key = key.clone();
        Box::pin(async move {
            let row: Option<(String, DateTime<Utc>)> = sqlx::query_as(
                r"
                SELECT holder_id, locked_until FROM slot_locks
                WHERE provider_id = $1 AND service_id = $2 AND start_at = $3 AND locked_until >= $4
                ",
            )
            .bind(key.provider_id.as_str())
            .bind(key.service_id.as_str())
            .bind(key.start)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row.map(|(holder, locked_until)| SlotLock {
                key,
                holder: HolderId::new(holder),
                locked_until,
            }))
        })
    }

    fn purge_expired_locks(&self, now: DateTime<Utc>) -> StoreFuture<'_, u64> {
        Box::pin(async move {
            let result = sqlx::query("DELETE FROM slot_locks WHERE locked_until < $1")
                .bind(now)
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected())
        })
    }

    fn insert_reminder(&self, reminder: &ReminderSchedule) -> StoreFuture<'_, bool> {
        let reminder = reminder.clone();
        Box::pin(async move {
            let result = sqlx::query(
                r"
                INSERT INTO reminders (
                    id, booking_id, kind, scheduled_for, status, attempts,
                    next_attempt_at, last_error, sent_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                ON CONFLICT (booking_id, kind) DO NOTHING
                ",
            )
            .bind(reminder.id.as_str())
            .bind(reminder.booking_id.as_str())
            .bind(reminder.kind.as_str())
            .bind(reminder.scheduled_for)
            .bind(reminder.status.as_str())
            .bind(to_db_int(reminder.attempts)?)
            .bind(reminder.next_attempt_at)
            .bind(reminder.last_error.as_deref())
            .bind(reminder.sent_at)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() == 1)
        })
    }

    fn reminders_for_booking(
        &self,
        booking_id: &BookingId,
    ) -> StoreFuture<'_, Vec<ReminderSchedule>> {
        let booking_id = booking_id.clone();
        Box::pin(async move {
            let rows = sqlx::query(&format!(
                r"
                SELECT {REMINDER_COLUMNS} FROM reminders
                WHERE booking_id = $1
                ORDER BY scheduled_for ASC
                "
            ))
            .bind(booking_id.as_str())
            .fetch_all(&self.pool)
            .await?;
            rows.iter().map(row_to_reminder).collect()
        })
    }

    fn due_reminders(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> StoreFuture<'_, Vec<ReminderSchedule>> {
        Box::pin(async move {
            let limit = i64::try_from(limit).unwrap_or(i64::MAX);
            let rows = sqlx::query(&format!(
                r"
                SELECT {REMINDER_COLUMNS} FROM reminders
                WHERE status = 'pending' AND scheduled_for <= $1 AND next_attempt_at <= $1
                ORDER BY scheduled_for ASC, next_attempt_at ASC
                LIMIT $2
                "
            ))
            .bind(now)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
            rows.iter().map(row_to_reminder).collect()
        })
    }

    fn mark_reminder_sent(&self, id: &ReminderId, now: DateTime<Utc>) -> StoreFuture<'_, bool> {
        let id = id.clone();
        Box::pin(async move {
            let result = sqlx::query(
                r"
                UPDATE reminders SET status = 'sent', sent_at = $2
                WHERE id = $1 AND status = 'pending'
                ",
            )
            .bind(id.as_str())
            .bind(now)
            .execute(&self.pool)
            .await?;
            if result.rows_affected() == 1 {
                return Ok(true);
            }
            if reminder_exists(&self.pool, &id).await? {
                Ok(false)
            } else {
                Err(StoreError::NotFound)
            }
        })
    }

    fn mark_booking_reminder_sent(
        &self,
        booking_id: &BookingId,
        kind: ReminderKind,
    ) -> StoreFuture<'_, bool> {
        let booking_id = booking_id.clone();
        Box::pin(async move {
            let column = reminder_flag_column(kind);
            let sql = format!("UPDATE bookings SET {column} = TRUE WHERE id = $1 AND NOT {column}");
            let result = sqlx::query(&sql).bind(booking_id.as_str()).execute(&self.pool).await?;
            if result.rows_affected() == 1 {
                return Ok(true);
            }
            let mut conn = self.pool.acquire().await?;
            if booking_exists(&mut conn, &booking_id).await? {
                Ok(false)
            } else {
                Err(StoreError::NotFound)
            }
        })
    }

    fn record_reminder_failure(
        &self,
        id: &ReminderId,
        error: &str,
        next_attempt_at: Option<DateTime<Utc>>,
    ) -> StoreFuture<'_, bool> {
        let id = id.clone();
        let error = error.to_string();
        Box::pin(async move {
            let result = sqlx::query(
                r"
                UPDATE reminders SET
                    attempts = attempts + 1,
                    last_error = $2,
                    next_attempt_at = COALESCE($3::timestamptz, next_attempt_at),
                    status = CASE WHEN $3::timestamptz IS NULL THEN 'failed' ELSE status END
                WHERE id = $1 AND status = 'pending'
                ",
            )
            .bind(id.as_str())
            .bind(&error)
            .bind(next_attempt_at)
            .execute(&self.pool)
            .await?;
            if result.rows_affected() == 1 {
                return Ok(true);
            }
            if reminder_exists(&self.pool, &id).await? {
                Ok(false)
            } else {
                Err(StoreError::NotFound)
            }
        })
    }

    fn cancel_reminders(&self, booking_id: &BookingId) -> StoreFuture<'_, u64> {
        let booking_id = booking_id.clone();
        Box::pin(async move {
            let result = sqlx::query(
                r"
                UPDATE reminders SET status = 'cancelled'
                WHERE booking_id = $1 AND status = 'pending'
                ",
            )
            .bind(booking_id.as_str())
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected())
        })
    }
}

// ============================================================================
// Patient contacts
// ============================================================================

impl PostgresBookingStore {
    /// Insert or replace the contact details of a patient
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the write fails.
    pub async fn put_recipient(&self, recipient: &Recipient) -> Result<(), StoreError> {
        sqlx::query(
            r"
            INSERT INTO patient_contacts (user_id, name, email, phone, updated_at)
            VALUES ($1, $2, $3, $4, now())
            ON CONFLICT (user_id) DO UPDATE SET
                name = EXCLUDED.name,
                email = EXCLUDED.email,
                phone = EXCLUDED.phone,
                updated_at = EXCLUDED.updated_at
            ",
        )
        .bind(recipient.user_id.as_str())
        .bind(&recipient.name)
        .bind(recipient.email.as_deref())
        .bind(recipient.phone.as_deref())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_recipient(&self, user_id: &UserId) -> Result<Option<Recipient>, StoreError> {
        let row = sqlx::query("SELECT name, email, phone FROM patient_contacts WHERE user_id = $1")
            .bind(user_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(Recipient {
            user_id: user_id.clone(),
            name: row.try_get("name")?,
            email: row.try_get("email")?,
            phone: row.try_get("phone")?,
        }))
    }
}

impl UserDirectory for PostgresBookingStore {
    fn recipient(&self, user_id: &UserId) -> RecipientFuture {
        let store = self.clone();
        let user_id = user_id.clone();
        Box::pin(async move {
            match store.find_recipient(&user_id).await {
                Ok(found) => found,
                Err(error) => {
                    tracing::warn!(user_id = %user_id, error = %error, "Recipient lookup failed");
                    None
                },
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cents_conversion_rejects_out_of_range() {
        assert_eq!(to_db_cents(Money::from_cents(1_250)), Ok(1_250));
        assert!(to_db_cents(Money::from_cents(u64::MAX)).is_err());
        assert_eq!(from_db_cents(99), Ok(Money::from_cents(99)));
        assert!(from_db_cents(-1).is_err());
    }

    #[test]
    fn test_int_conversion() {
        assert_eq!(to_db_int(30), Ok(30));
        assert!(to_db_int(u32::MAX).is_err());
        assert!(from_db_int(-5).is_err());
    }
}
