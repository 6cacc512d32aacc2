//! SQLite persistence layer.
//!
//! Stores clients (phone identities), message groups with their member
//! lists, and messages. Uses WAL mode for concurrent reads during writes.
//!
//! Every method is a single statement except [`Db::create_group`], which
//! inserts the group and its members in one transaction.

use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult};
use serde::Serialize;

/// A persisted client identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Client {
    pub id: i64,
    pub country_code: String,
    pub phone_number: String,
    /// Last confirmed verification code, if any.
    pub verification_code: Option<String>,
}

/// A message group and its members, in insertion order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Group {
    pub id: i64,
    pub name: String,
    pub member_ids: Vec<i64>,
    pub date_created: String,
}

/// A persisted message. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    pub id: i64,
    pub group_id: i64,
    pub sender_id: i64,
    pub content: String,
    pub date_created: String,
}

/// Database handle wrapping a SQLite connection.
pub struct Db {
    conn: Connection,
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

impl Db {
    /// Open (or create) the database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> SqlResult<Self> {
        let conn = Connection::open(path)?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing).
    pub fn open_memory() -> SqlResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> SqlResult<()> {
        self.conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        self.conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS client (
                id                INTEGER PRIMARY KEY AUTOINCREMENT,
                country_code      TEXT NOT NULL,
                phone_number      TEXT NOT NULL,
                verification_code TEXT,
                UNIQUE(country_code, phone_number)
            );

            CREATE TABLE IF NOT EXISTS message_group (
                id           INTEGER PRIMARY KEY AUTOINCREMENT,
                name         TEXT NOT NULL,
                date_created TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS message_group_member (
                message_group_id INTEGER NOT NULL REFERENCES message_group(id),
                member_id        INTEGER NOT NULL,
                PRIMARY KEY (message_group_id, member_id)
            );

            CREATE INDEX IF NOT EXISTS idx_group_member_member
                ON message_group_member(member_id);

            CREATE TABLE IF NOT EXISTS message (
                id               INTEGER PRIMARY KEY AUTOINCREMENT,
                message_group_id INTEGER NOT NULL REFERENCES message_group(id),
                sender_id        INTEGER NOT NULL,
                content          TEXT NOT NULL,
                date_created     TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_message_group
                ON message(message_group_id, id);
            ",
        )?;
        Ok(())
    }

    // ── Clients ────────────────────────────────────────────────────────

    /// Look up a client by phone number.
    pub fn find_client(&self, country_code: &str, phone_number: &str) -> SqlResult<Option<Client>> {
        self.conn
            .query_row(
                "SELECT id, country_code, phone_number, verification_code
                 FROM client
                 WHERE country_code = ?1 AND phone_number = ?2",
                params![country_code, phone_number],
                map_client_row,
            )
            .optional()
    }

    /// Look up a client whose phone number and confirmed code all match exactly.
    pub fn find_client_with_code(
        &self,
        country_code: &str,
        phone_number: &str,
        verification_code: &str,
    ) -> SqlResult<Option<Client>> {
        self.conn
            .query_row(
                "SELECT id, country_code, phone_number, verification_code
                 FROM client
                 WHERE country_code = ?1 AND phone_number = ?2 AND verification_code = ?3",
                params![country_code, phone_number, verification_code],
                map_client_row,
            )
            .optional()
    }

    /// Look up a client by id.
    pub fn get_client(&self, id: i64) -> SqlResult<Option<Client>> {
        self.conn
            .query_row(
                "SELECT id, country_code, phone_number, verification_code FROM client WHERE id = ?1",
                params![id],
                map_client_row,
            )
            .optional()
    }

    /// Insert a new client with no confirmed code.
    pub fn create_client(&self, country_code: &str, phone_number: &str) -> SqlResult<Client> {
        self.conn.execute(
            "INSERT INTO client (country_code, phone_number) VALUES (?1, ?2)",
            params![country_code, phone_number],
        )?;
        Ok(Client {
            id: self.conn.last_insert_rowid(),
            country_code: country_code.to_string(),
            phone_number: phone_number.to_string(),
            verification_code: None,
        })
    }

    /// Return the client for this phone number, creating it if needed.
    ///
    /// Not transactional: two racing callers may both miss the lookup, but
    /// the unique index keeps a single row and the loser re-reads it.
    pub fn find_or_create_client(&self, country_code: &str, phone_number: &str) -> SqlResult<Client> {
        if let Some(client) = self.find_client(country_code, phone_number)? {
            return Ok(client);
        }
        self.conn.execute(
            "INSERT OR IGNORE INTO client (country_code, phone_number) VALUES (?1, ?2)",
            params![country_code, phone_number],
        )?;
        self.find_client(country_code, phone_number)?
            .ok_or(rusqlite::Error::QueryReturnedNoRows)
    }

    /// Record the confirmed verification code for a client.
    pub fn update_verification_code(&self, client_id: i64, code: &str) -> SqlResult<usize> {
        self.conn.execute(
            "UPDATE client SET verification_code = ?1 WHERE id = ?2",
            params![code, client_id],
        )
    }

    // ── Groups ─────────────────────────────────────────────────────────

    /// Create a group with the given members.
    pub fn create_group(&self, name: &str, member_ids: &[i64]) -> SqlResult<Group> {
        let date_created = now_rfc3339();
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO message_group (name, date_created) VALUES (?1, ?2)",
            params![name, date_created],
        )?;
        let id = tx.last_insert_rowid();
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO message_group_member (message_group_id, member_id) VALUES (?1, ?2)",
            )?;
            for member_id in member_ids {
                stmt.execute(params![id, member_id])?;
            }
        }
        tx.commit()?;
        Ok(Group {
            id,
            name: name.to_string(),
            member_ids: member_ids.to_vec(),
            date_created,
        })
    }

    /// Load a group with its current member list.
    pub fn get_group(&self, group_id: i64) -> SqlResult<Option<Group>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, name, date_created FROM message_group WHERE id = ?1",
                params![group_id],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?)),
            )
            .optional()?;
        let Some((id, name, date_created)) = row else {
            return Ok(None);
        };
        let member_ids = self.member_ids(id)?;
        Ok(Some(Group { id, name, member_ids, date_created }))
    }

    /// Whether the client is currently a member of the group.
    pub fn is_member(&self, group_id: i64, client_id: i64) -> SqlResult<bool> {
        self.conn.query_row(
            "SELECT EXISTS(
                SELECT 1 FROM message_group_member WHERE message_group_id = ?1 AND member_id = ?2
             )",
            params![group_id, client_id],
            |row| row.get(0),
        )
    }

    /// Add members to a group. Existing members are left as they are.
    pub fn add_members(&self, group_id: i64, member_ids: &[i64]) -> SqlResult<()> {
        let mut stmt = self.conn.prepare(
            "INSERT OR IGNORE INTO message_group_member (message_group_id, member_id) VALUES (?1, ?2)",
        )?;
        for member_id in member_ids {
            stmt.execute(params![group_id, member_id])?;
        }
        Ok(())
    }

    /// Remove members from a group. The group itself is never deleted.
    pub fn remove_members(&self, group_id: i64, member_ids: &[i64]) -> SqlResult<usize> {
        let mut stmt = self.conn.prepare(
            "DELETE FROM message_group_member WHERE message_group_id = ?1 AND member_id = ?2",
        )?;
        let mut removed = 0;
        for member_id in member_ids {
            removed += stmt.execute(params![group_id, member_id])?;
        }
        Ok(removed)
    }

    /// Current member ids of a group, oldest membership first.
    pub fn member_ids(&self, group_id: i64) -> SqlResult<Vec<i64>> {
        let mut stmt = self.conn.prepare(
            "SELECT member_id FROM message_group_member WHERE message_group_id = ?1 ORDER BY rowid",
        )?;
        let rows = stmt.query_map(params![group_id], |row| row.get::<_, i64>(0))?;
        rows.collect()
    }

    // ── Messages ───────────────────────────────────────────────────────

    /// Store a message sent to a group.
    pub fn create_message(&self, group_id: i64, sender_id: i64, content: &str) -> SqlResult<Message> {
        let date_created = now_rfc3339();
        self.conn.execute(
            "INSERT INTO message (message_group_id, sender_id, content, date_created)
             VALUES (?1, ?2, ?3, ?4)",
            params![group_id, sender_id, content, date_created],
        )?;
        Ok(Message {
            id: self.conn.last_insert_rowid(),
            group_id,
            sender_id,
            content: content.to_string(),
            date_created,
        })
    }

    /// Fetch the most recent messages of a group, oldest first.
    #[cfg(test)]
    pub fn get_messages(&self, group_id: i64, limit: usize) -> SqlResult<Vec<Message>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, message_group_id, sender_id, content, date_created
             FROM message
             WHERE message_group_id = ?1
             ORDER BY id DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![group_id, limit as i64], |row| {
            Ok(Message {
                id: row.get(0)?,
                group_id: row.get(1)?,
                sender_id: row.get(2)?,
                content: row.get(3)?,
                date_created: row.get(4)?,
            })
        })?;
        let mut messages = rows.collect::<SqlResult<Vec<_>>>()?;
        messages.reverse();
        Ok(messages)
    }
}

fn map_client_row(row: &rusqlite::Row) -> SqlResult<Client> {
    Ok(Client {
        id: row.get(0)?,
        country_code: row.get(1)?,
        phone_number: row.get(2)?,
        verification_code: row.get(3)?,
    })
}
