//! Read access to the marketplace records the resolver needs (users,
//! vehicles, bookings). The create helpers exist for seeding and tests.

use tracing::instrument;

use convoy_core::ids::{BookingId, UserId, VehicleId};
use convoy_core::model::{BookingRecord, Role, UserRecord, VehicleRecord};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers::{self, now_timestamp};

pub struct DirectoryRepo {
    db: Database,
}

impl DirectoryRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self), fields(email))]
    pub fn create_user(&self, name: &str, email: &str, role: Role) -> Result<UserRecord, StoreError> {
        let (_, now) = now_timestamp();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (name, email, role, created_at) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![name, email, role.to_string(), now],
            )
            .map_err(|e| match e {
                rusqlite::Error::SqliteFailure(f, _)
                    if f.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    StoreError::Conflict(format!("user email {email}"))
                }
                other => other.into(),
            })?;
            Ok(UserRecord {
                id: UserId(conn.last_insert_rowid()),
                name: name.to_string(),
                email: email.to_string(),
                role,
            })
        })
    }

    #[instrument(skip(self), fields(user_id = %id))]
    pub fn find_user(&self, id: UserId) -> Result<Option<UserRecord>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT id, name, email, role FROM users WHERE id = ?1")?;
            let mut rows = stmt.query([id.get()])?;
            match rows.next()? {
                Some(row) => {
                    let role: String = row_helpers::get(row, 3, "users", "role")?;
                    Ok(Some(UserRecord {
                        id: UserId(row_helpers::get(row, 0, "users", "id")?),
                        name: row_helpers::get(row, 1, "users", "name")?,
                        email: row_helpers::get(row, 2, "users", "email")?,
                        role: row_helpers::parse_enum(&role, "users", "role")?,
                    }))
                }
                None => Ok(None),
            }
        })
    }

    #[instrument(skip(self), fields(owner_id = %owner_id))]
    pub fn create_vehicle(
        &self,
        owner_id: UserId,
        make: &str,
        model: &str,
        year: i32,
    ) -> Result<VehicleRecord, StoreError> {
        let (_, now) = now_timestamp();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO vehicles (owner_id, make, model, year, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![owner_id.get(), make, model, year, now],
            )?;
            Ok(VehicleRecord {
                id: VehicleId(conn.last_insert_rowid()),
                owner_id,
                make: make.to_string(),
                model: model.to_string(),
                year,
            })
        })
    }

    #[instrument(skip(self), fields(vehicle_id = %id))]
    pub fn find_vehicle(&self, id: VehicleId) -> Result<Option<VehicleRecord>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT id, owner_id, make, model, year FROM vehicles WHERE id = ?1")?;
            let mut rows = stmt.query([id.get()])?;
            match rows.next()? {
                Some(row) => Ok(Some(VehicleRecord {
                    id: VehicleId(row_helpers::get(row, 0, "vehicles", "id")?),
                    owner_id: UserId(row_helpers::get(row, 1, "vehicles", "owner_id")?),
                    make: row_helpers::get(row, 2, "vehicles", "make")?,
                    model: row_helpers::get(row, 3, "vehicles", "model")?,
                    year: row_helpers::get(row, 4, "vehicles", "year")?,
                })),
                None => Ok(None),
            }
        })
    }

    #[instrument(skip(self), fields(vehicle_id = %vehicle_id, renter_id = %renter_id))]
    pub fn create_booking(&self, vehicle_id: VehicleId, renter_id: UserId) -> Result<BookingRecord, StoreError> {
        let (_, now) = now_timestamp();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO bookings (vehicle_id, renter_id, created_at) VALUES (?1, ?2, ?3)",
                rusqlite::params![vehicle_id.get(), renter_id.get(), now],
            )?;
            Ok(BookingRecord {
                id: BookingId(conn.last_insert_rowid()),
                vehicle_id,
                renter_id,
            })
        })
    }

    #[instrument(skip(self), fields(booking_id = %id))]
    pub fn find_booking(&self, id: BookingId) -> Result<Option<BookingRecord>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT id, vehicle_id, renter_id FROM bookings WHERE id = ?1")?;
            let mut rows = stmt.query([id.get()])?;
            match rows.next()? {
                Some(row) => Ok(Some(BookingRecord {
                    id: BookingId(row_helpers::get(row, 0, "bookings", "id")?),
                    vehicle_id: VehicleId(row_helpers::get(row, 1, "bookings", "vehicle_id")?),
                    renter_id: UserId(row_helpers::get(row, 2, "bookings", "renter_id")?),
                })),
                None => Ok(None),
            }
        })
    }
}
