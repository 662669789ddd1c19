use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};

use motormart_types::models::{Presence, UserId};

use crate::Database;

impl Database {
    // -- Users --

    /// Mirrors a profile from the account service (display name + role).
    pub fn upsert_user(&self, id: UserId, display_name: &str, role: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, display_name, role) VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET display_name = excluded.display_name, role = excluded.role",
                params![id, display_name, role],
            )?;
            Ok(())
        })
    }

    pub fn get_display_name(&self, id: UserId) -> Result<Option<String>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row("SELECT display_name FROM users WHERE id = ?1", [id], |row| row.get(0))
                .optional()?)
        })
    }

    /// Recipient set for an admin broadcast.
    pub fn user_ids_with_role(&self, role: &str) -> Result<Vec<UserId>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT id FROM users WHERE role = ?1 ORDER BY id")?;
            let ids = stmt
                .query_map([role], |row| row.get(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(ids)
        })
    }

    // -- Presence --

    /// Returns the timestamp written, which a session later hands to
    /// [`Database::set_offline_since`].
    pub fn set_online(&self, user_id: UserId) -> Result<DateTime<Utc>> {
        self.set_presence(user_id, true)
    }

    pub fn set_offline(&self, user_id: UserId) -> Result<()> {
        self.set_presence(user_id, false)?;
        Ok(())
    }

    /// Marks the user offline unless presence was written after
    /// `online_since`, i.e. by a newer session. Returns whether it did.
    pub fn set_offline_since(&self, user_id: UserId, online_since: DateTime<Utc>) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE presence SET online = 0, last_active_at = ?2
                 WHERE user_id = ?1 AND last_active_at <= ?3",
                params![user_id, Utc::now(), online_since],
            )?;
            Ok(changed > 0)
        })
    }

    fn set_presence(&self, user_id: UserId, online: bool) -> Result<DateTime<Utc>> {
        let now = Utc::now();
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO presence (user_id, online, last_active_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(user_id) DO UPDATE SET online = excluded.online, last_active_at = excluded.last_active_at",
                params![user_id, online, now],
            )?;
            Ok(now)
        })
    }

    pub fn get_presence(&self, user_id: UserId) -> Result<Option<Presence>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT user_id, online, last_active_at FROM presence WHERE user_id = ?1",
                    [user_id],
                    |row| {
                        Ok(Presence {
                            user_id: row.get(0)?,
                            online: row.get(1)?,
                            last_active_at: row.get(2)?,
                        })
                    },
                )
                .optional()?)
        })
    }

    // -- Device tokens --

    /// Written by the device registration flow; one token per user, last write wins.
    pub fn set_device_token(&self, user_id: UserId, token: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO device_tokens (user_id, token, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(user_id) DO UPDATE SET token = excluded.token, updated_at = excluded.updated_at",
                params![user_id, token, Utc::now()],
            )?;
            Ok(())
        })
    }

    pub fn get_device_token(&self, user_id: UserId) -> Result<Option<String>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row("SELECT token FROM device_tokens WHERE user_id = ?1", [user_id], |row| {
                    row.get(0)
                })
                .optional()?)
        })
    }
}
