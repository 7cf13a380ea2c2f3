//! `PostgreSQL` gateway for the Trailhead club.
//!
//! Implements every repository trait from `trailhead-club` over one sqlx
//! connection pool. Queries are checked at runtime, so building the crate
//! does not need a live database.
//!
//! # Schema
//!
//! - `hikes`: hike catalogue
//! - `profiles`: member profiles, keyed by user id
//! - `hike_enrollments`: one row per (hike, member), `UNIQUE (hike_id, user_id)`,
//!   status restricted to `enrolled`, `waitlisted`, `verified`
//! - `user_roles`: role grants
//!
//! # Capacity check
//!
//! [`EnrollmentRepository::insert_within_capacity`] counts and inserts inside
//! one transaction holding a per-hike advisory lock, so concurrent joins for
//! the same hike are decided one after the other.
//!
//! # Example
//!
//! ```ignore
//! use trailhead_postgres::PostgresClubStore;
//!
//! let store = PostgresClubStore::connect(&config.database).await?;
//! store.migrate().await?;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use std::time::Duration;
use tracing::Instrument;
use trailhead_club::config::DatabaseConfig;
use trailhead_club::gateway::{
    EnrollmentRepository, GatewayError, GatewayFuture, GatewayResult, HikeRepository,
    ProfileRepository, RoleRepository,
};
use trailhead_club::policy::decide_enrollment_status;
use trailhead_club::types::{
    Enrollment, EnrollmentId, EnrollmentStatus, Hike, HikeId, HistoryEntry, Participant, Profile,
    Role, UserId,
};
use uuid::Uuid;

const HIKE_COLUMNS: &str = "h.id, h.name, h.description, h.date, h.end_date, h.difficulty, \
     h.distance_km, h.elevation_m, h.duration, h.location_name, h.location_lat, h.location_lng, \
     h.max_participants, h.organizer_id, h.organizer_name";

const ENROLLMENT_COLUMNS: &str = "e.id, e.hike_id, e.user_id, e.status, e.enrolled_at";

// ============================================================================
// Error mapping
// ============================================================================

fn gateway_error(error: sqlx::Error) -> GatewayError {
    let mapped = match &error {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            GatewayError::Conflict(db.message().to_string())
        },
        sqlx::Error::Database(db) if db.is_foreign_key_violation() => {
            GatewayError::NotFound(db.message().to_string())
        },
        sqlx::Error::RowNotFound => GatewayError::NotFound(error.to_string()),
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            GatewayError::Unavailable(error.to_string())
        },
        _ => GatewayError::Database(error.to_string()),
    };
    let kind = match mapped {
        GatewayError::NotFound(_) => "not_found",
        GatewayError::Conflict(_) => "conflict",
        GatewayError::Database(_) => "database",
        GatewayError::Unavailable(_) => "unavailable",
    };
    metrics::counter!("trailhead_postgres_errors_total", "kind" => kind).increment(1);
    mapped
}

fn decode_error(error: impl std::fmt::Display) -> GatewayError {
    GatewayError::Database(format!("Failed to decode row: {error}"))
}

fn to_count(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

// ============================================================================
// Row mapping
// ============================================================================

fn hike_from_row(row: &PgRow) -> GatewayResult<Hike> {
    let max_participants: i32 = row.try_get("max_participants").map_err(decode_error)?;
    Ok(Hike {
        id: HikeId::from_uuid(row.try_get("id").map_err(decode_error)?),
        name: row.try_get("name").map_err(decode_error)?,
        description: row.try_get("description").map_err(decode_error)?,
        date: row.try_get::<NaiveDate, _>("date").map_err(decode_error)?,
        end_date: row.try_get("end_date").map_err(decode_error)?,
        difficulty: row.try_get("difficulty").map_err(decode_error)?,
        distance_km: row.try_get("distance_km").map_err(decode_error)?,
        elevation_m: row.try_get("elevation_m").map_err(decode_error)?,
        duration: row.try_get("duration").map_err(decode_error)?,
        location_name: row.try_get("location_name").map_err(decode_error)?,
        location_lat: row.try_get("location_lat").map_err(decode_error)?,
        location_lng: row.try_get("location_lng").map_err(decode_error)?,
        max_participants: u32::try_from(max_participants).map_err(decode_error)?,
        organizer_id: row
            .try_get::<Option<Uuid>, _>("organizer_id")
            .map_err(decode_error)?
            .map(UserId::from_uuid),
        organizer_name: row.try_get("organizer_name").map_err(decode_error)?,
    })
}

fn status_from_row(row: &PgRow) -> GatewayResult<EnrollmentStatus> {
    row.try_get::<String, _>("status")
        .map_err(decode_error)?
        .parse()
        .map_err(decode_error)
}

fn enrollment_from_row(row: &PgRow) -> GatewayResult<Enrollment> {
    Ok(Enrollment {
        id: EnrollmentId::from_uuid(row.try_get("id").map_err(decode_error)?),
        hike_id: HikeId::from_uuid(row.try_get("hike_id").map_err(decode_error)?),
        user_id: UserId::from_uuid(row.try_get("user_id").map_err(decode_error)?),
        status: status_from_row(row)?,
        enrolled_at: row.try_get::<DateTime<Utc>, _>("enrolled_at").map_err(decode_error)?,
    })
}

fn profile_from_row(row: &PgRow) -> GatewayResult<Option<Profile>> {
    let Some(id) = row.try_get::<Option<Uuid>, _>("profile_id").map_err(decode_error)? else {
        return Ok(None);
    };
    Ok(Some(Profile {
        user_id: UserId::from_uuid(id),
        full_name: row.try_get("full_name").map_err(decode_error)?,
        email: row.try_get("email").map_err(decode_error)?,
        avatar_url: row.try_get("avatar_url").map_err(decode_error)?,
    }))
}

// ============================================================================
// Store
// ============================================================================

/// `PostgreSQL` implementation of every club repository
#[derive(Clone, Debug)]
pub struct PostgresClubStore {
    pool: PgPool,
}

impl PostgresClubStore {
    /// Wrap an existing pool
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool as described by `config`
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Unavailable`] if no connection can be made.
    pub async fn connect(config: &DatabaseConfig) -> GatewayResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout))
            .connect(&config.url)
            .await
            .map_err(|e| GatewayError::Unavailable(format!("Failed to connect: {e}")))?;
        tracing::info!(max_connections = config.max_connections, "Connected to PostgreSQL");
        Ok(Self::from_pool(pool))
    }

    /// Apply the embedded migrations
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Database`] if a migration fails.
    pub async fn migrate(&self) -> GatewayResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| GatewayError::Database(format!("Migration failed: {e}")))?;
        Ok(())
    }

    /// Underlying pool
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Insert or replace a hike
    ///
    /// # Errors
    ///
    /// Gateway failures.
    pub async fn upsert_hike(&self, hike: &Hike) -> GatewayResult<()> {
        let max_participants = i32::try_from(hike.max_participants).map_err(decode_error)?;
        sqlx::query(
            r"
            INSERT INTO hikes (
                id, name, description, date, end_date, difficulty, distance_km, elevation_m,
                duration, location_name, location_lat, location_lng, max_participants,
                organizer_id, organizer_name
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                description = EXCLUDED.description,
                date = EXCLUDED.date,
                end_date = EXCLUDED.end_date,
                difficulty = EXCLUDED.difficulty,
                distance_km = EXCLUDED.distance_km,
                elevation_m = EXCLUDED.elevation_m,
                duration = EXCLUDED.duration,
                location_name = EXCLUDED.location_name,
                location_lat = EXCLUDED.location_lat,
                location_lng = EXCLUDED.location_lng,
                max_participants = EXCLUDED.max_participants,
                organizer_id = EXCLUDED.organizer_id,
                organizer_name = EXCLUDED.organizer_name
            ",
        )
        .bind(hike.id.as_uuid())
        .bind(&hike.name)
        .bind(&hike.description)
        .bind(hike.date)
        .bind(hike.end_date)
        .bind(&hike.difficulty)
        .bind(hike.distance_km)
        .bind(hike.elevation_m)
        .bind(&hike.duration)
        .bind(&hike.location_name)
        .bind(hike.location_lat)
        .bind(hike.location_lng)
        .bind(max_participants)
        .bind(hike.organizer_id.map(|id| *id.as_uuid()))
        .bind(&hike.organizer_name)
        .execute(&self.pool)
        .await
        .map_err(gateway_error)?;
        Ok(())
    }

    /// Insert or replace a profile
    ///
    /// # Errors
    ///
    /// Gateway failures.
    pub async fn upsert_profile(&self, profile: &Profile) -> GatewayResult<()> {
        sqlx::query(
            r"
            INSERT INTO profiles (id, full_name, email, avatar_url)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO UPDATE SET
                full_name = EXCLUDED.full_name,
                email = EXCLUDED.email,
                avatar_url = EXCLUDED.avatar_url,
                updated_at = now()
            ",
        )
        .bind(profile.user_id.as_uuid())
        .bind(&profile.full_name)
        .bind(&profile.email)
        .bind(&profile.avatar_url)
        .execute(&self.pool)
        .await
        .map_err(gateway_error)?;
        Ok(())
    }
}

impl EnrollmentRepository for PostgresClubStore {
    fn count_with_status(&self, hike_id: HikeId, status: EnrollmentStatus) -> GatewayFuture<'_, u64> {
        Box::pin(async move {
            let count: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM hike_enrollments WHERE hike_id = $1 AND status = $2",
            )
            .bind(hike_id.as_uuid())
            .bind(status.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(gateway_error)?;
            Ok(to_count(count))
        })
    }

    fn count_all(&self, hike_id: HikeId) -> GatewayFuture<'_, u64> {
        Box::pin(async move {
            let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM hike_enrollments WHERE hike_id = $1")
                .bind(hike_id.as_uuid())
                .fetch_one(&self.pool)
                .await
                .map_err(gateway_error)?;
            Ok(to_count(count))
        })
    }

    fn get_enrollment(&self, hike_id: HikeId, user_id: UserId) -> GatewayFuture<'_, Option<Enrollment>> {
        Box::pin(async move {
            let row = sqlx::query(&format!(
                "SELECT {ENROLLMENT_COLUMNS} FROM hike_enrollments e WHERE e.hike_id = $1 AND e.user_id = $2"
            ))
            .bind(hike_id.as_uuid())
            .bind(user_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(gateway_error)?;
            row.as_ref().map(enrollment_from_row).transpose()
        })
    }

    fn insert_enrollment(
        &self,
        hike_id: HikeId,
        user_id: UserId,
        status: EnrollmentStatus,
    ) -> GatewayFuture<'_, Enrollment> {
        Box::pin(async move {
            let row = sqlx::query(
                r"
                INSERT INTO hike_enrollments (id, hike_id, user_id, status)
                VALUES ($1, $2, $3, $4)
                RETURNING id, hike_id, user_id, status, enrolled_at
                ",
            )
            .bind(*EnrollmentId::new().as_uuid())
            .bind(hike_id.as_uuid())
            .bind(user_id.as_uuid())
            .bind(status.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(gateway_error)?;
            enrollment_from_row(&row)
        })
    }

    fn insert_within_capacity(
        &self,
        hike_id: HikeId,
        user_id: UserId,
        max_participants: u32,
    ) -> GatewayFuture<'_, Enrollment> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await.map_err(gateway_error)?;

            // Serializes capacity decisions per hike until commit.
            sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
                .bind(hike_id.to_string())
                .execute(&mut *tx)
                .await
                .map_err(gateway_error)?;

            let enrolled: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM hike_enrollments WHERE hike_id = $1 AND status = 'enrolled'",
            )
            .bind(hike_id.as_uuid())
            .fetch_one(&mut *tx)
            .await
            .map_err(gateway_error)?;
            let status = decide_enrollment_status(to_count(enrolled), max_participants);

            let row = sqlx::query(
                r"
                INSERT INTO hike_enrollments (id, hike_id, user_id, status)
                VALUES ($1, $2, $3, $4)
                RETURNING id, hike_id, user_id, status, enrolled_at
                ",
            )
            .bind(*EnrollmentId::new().as_uuid())
            .bind(hike_id.as_uuid())
            .bind(user_id.as_uuid())
            .bind(status.as_str())
            .fetch_one(&mut *tx)
            .await
            .map_err(gateway_error)?;
            let enrollment = enrollment_from_row(&row)?;

            tx.commit().await.map_err(gateway_error)?;
            tracing::debug!(enrolled, %status, "Capacity decided under advisory lock");
            Ok(enrollment)
        }
        .instrument(tracing::debug_span!("insert_within_capacity", %hike_id, %user_id, max_participants)))
    }

    fn delete_enrollment(&self, hike_id: HikeId, user_id: UserId) -> GatewayFuture<'_, ()> {
        Box::pin(async move {
            sqlx::query("DELETE FROM hike_enrollments WHERE hike_id = $1 AND user_id = $2")
                .bind(hike_id.as_uuid())
                .bind(user_id.as_uuid())
                .execute(&self.pool)
                .await
                .map_err(gateway_error)?;
            Ok(())
        })
    }

    fn update_enrollment_status(
        &self,
        enrollment_id: EnrollmentId,
        status: EnrollmentStatus,
    ) -> GatewayFuture<'_, ()> {
        Box::pin(async move {
            let result = sqlx::query("UPDATE hike_enrollments SET status = $1 WHERE id = $2")
                .bind(status.as_str())
                .bind(enrollment_id.as_uuid())
                .execute(&self.pool)
                .await
                .map_err(gateway_error)?;
            if result.rows_affected() == 0 {
                return Err(GatewayError::NotFound(format!("enrollment {enrollment_id}")));
            }
            Ok(())
        })
    }

    fn list_participants(&self, hike_id: HikeId) -> GatewayFuture<'_, Vec<Participant>> {
        Box::pin(async move {
            let rows = sqlx::query(&format!(
                r"
                SELECT {ENROLLMENT_COLUMNS},
                       p.id AS profile_id, p.full_name, p.email, p.avatar_url
                FROM hike_enrollments e
                LEFT JOIN profiles p ON p.id = e.user_id
                WHERE e.hike_id = $1
                ORDER BY e.enrolled_at ASC
                "
            ))
            .bind(hike_id.as_uuid())
            .fetch_all(&self.pool)
            .await
            .map_err(gateway_error)?;

            rows.iter()
                .map(|row| {
                    Ok(Participant {
                        enrollment: enrollment_from_row(row)?,
                        profile: profile_from_row(row)?,
                    })
                })
                .collect()
        })
    }

    fn list_for_user(&self, user_id: UserId) -> GatewayFuture<'_, Vec<HistoryEntry>> {
        Box::pin(async move {
            let rows = sqlx::query(&format!(
                r"
                SELECT {HIKE_COLUMNS}, e.status, e.enrolled_at
                FROM hike_enrollments e
                JOIN hikes h ON h.id = e.hike_id
                WHERE e.user_id = $1
                ORDER BY h.date DESC
                "
            ))
            .bind(user_id.as_uuid())
            .fetch_all(&self.pool)
            .await
            .map_err(gateway_error)?;

            rows.iter()
                .map(|row| {
                    Ok(HistoryEntry {
                        hike: hike_from_row(row)?,
                        status: status_from_row(row)?,
                        enrolled_at: row.try_get("enrolled_at").map_err(decode_error)?,
                    })
                })
                .collect()
        })
    }
}

impl ProfileRepository for PostgresClubStore {
    fn find_profile(&self, user_id: UserId) -> GatewayFuture<'_, Option<Profile>> {
        Box::pin(async move {
            let row = sqlx::query(
                "SELECT id AS profile_id, full_name, email, avatar_url FROM profiles WHERE id = $1",
            )
            .bind(user_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(gateway_error)?;
            match row {
                Some(row) => profile_from_row(&row),
                None => Ok(None),
            }
        })
    }
}

impl HikeRepository for PostgresClubStore {
    fn get_hike(&self, hike_id: HikeId) -> GatewayFuture<'_, Option<Hike>> {
        Box::pin(async move {
            let row = sqlx::query(&format!("SELECT {HIKE_COLUMNS} FROM hikes h WHERE h.id = $1"))
                .bind(hike_id.as_uuid())
                .fetch_optional(&self.pool)
                .await
                .map_err(gateway_error)?;
            row.as_ref().map(hike_from_row).transpose()
        })
    }
}

impl RoleRepository for PostgresClubStore {
    fn roles_for(&self, user_id: UserId) -> GatewayFuture<'_, Vec<Role>> {
        Box::pin(async move {
            let names: Vec<String> = sqlx::query_scalar("SELECT role FROM user_roles WHERE user_id = $1 ORDER BY role")
                .bind(user_id.as_uuid())
                .fetch_all(&self.pool)
                .await
                .map_err(gateway_error)?;
            names
                .iter()
                .map(|name| name.parse().map_err(decode_error))
                .collect()
        })
    }

    fn assign_role(&self, user_id: UserId, role: Role) -> GatewayFuture<'_, ()> {
        Box::pin(async move {
            sqlx::query("INSERT INTO user_roles (user_id, role) VALUES ($1, $2) ON CONFLICT DO NOTHING")
                .bind(user_id.as_uuid())
                .bind(role.as_str())
                .execute(&self.pool)
                .await
                .map_err(gateway_error)?;
            Ok(())
        })
    }

    fn remove_role(&self, user_id: UserId, role: Role) -> GatewayFuture<'_, ()> {
        Box::pin(async move {
            sqlx::query("DELETE FROM user_roles WHERE user_id = $1 AND role = $2")
                .bind(user_id.as_uuid())
                .bind(role.as_str())
                .execute(&self.pool)
                .await
                .map_err(gateway_error)?;
            Ok(())
        })
    }
}
