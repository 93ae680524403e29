//! The per-account store schema.
//!
//! [`ACCOUNT_CREATE`] holds the current DDL of every entity store and is used
//! only for brand-new stores. [`ACCOUNT_UPGRADES`] is the complete history of
//! schema changes since the first release; existing stores replay the part
//! of it they have not seen yet. Both tables must describe the same final
//! schema: a store created fresh and a store upgraded from version 1 end up
//! with identical tables, columns and indexes.
//!
//! Version 1 stores held only the message send log.

use std::path::Path;

use crate::db::Database;
use crate::error::StoreResult;
use crate::migration::{CreationStep, MigrationStep, Schema};

/// Schema version written by this build.
pub const ACCOUNT_DATABASE_VERSION: u32 = 9;

const RECIPIENT_TABLE: &str = "
CREATE TABLE recipient (
  _id INTEGER PRIMARY KEY AUTOINCREMENT,
  number TEXT UNIQUE,
  uuid BLOB UNIQUE,
  profile_key BLOB,
  profile_key_credential BLOB,

  given_name TEXT,
  family_name TEXT,
  color TEXT,

  expiration_time INTEGER NOT NULL DEFAULT 0,
  blocked BOOLEAN NOT NULL DEFAULT FALSE,
  archived BOOLEAN NOT NULL DEFAULT FALSE,
  profile_sharing BOOLEAN NOT NULL DEFAULT FALSE,

  profile_last_update_timestamp INTEGER NOT NULL DEFAULT 0,
  profile_given_name TEXT,
  profile_family_name TEXT,
  profile_about TEXT,
  profile_about_emoji TEXT,
  profile_avatar_url_path TEXT,
  profile_mobile_coin_address BLOB,
  profile_unidentified_access_mode TEXT,
  profile_capabilities TEXT
);
";

const STICKER_TABLE: &str = "
CREATE TABLE sticker (
  _id INTEGER PRIMARY KEY,
  pack_id BLOB UNIQUE NOT NULL,
  pack_key BLOB NOT NULL,
  installed BOOLEAN NOT NULL DEFAULT FALSE
);
";

const SIGNED_PRE_KEY_TABLE: &str = "
CREATE TABLE signed_pre_key (
  _id INTEGER PRIMARY KEY,
  account_id_type INTEGER NOT NULL,
  key_id INTEGER NOT NULL,
  public_key BLOB NOT NULL,
  private_key BLOB NOT NULL,
  signature BLOB NOT NULL,
  timestamp INTEGER DEFAULT 0,
  UNIQUE(account_id_type, key_id)
);
";

const PRE_KEY_TABLE: &str = "
CREATE TABLE pre_key (
  _id INTEGER PRIMARY KEY,
  account_id_type INTEGER NOT NULL,
  key_id INTEGER NOT NULL,
  public_key BLOB NOT NULL,
  private_key BLOB NOT NULL,
  UNIQUE(account_id_type, key_id)
);
";

const GROUP_TABLES: &str = "
CREATE TABLE group_v2 (
  _id INTEGER PRIMARY KEY,
  group_id BLOB UNIQUE NOT NULL,
  master_key BLOB NOT NULL,
  group_data BLOB,
  distribution_id BLOB UNIQUE NOT NULL,
  blocked BOOLEAN NOT NULL DEFAULT FALSE,
  permission_denied BOOLEAN NOT NULL DEFAULT FALSE
);
CREATE TABLE group_v1 (
  _id INTEGER PRIMARY KEY,
  group_id BLOB UNIQUE NOT NULL,
  group_id_v2 BLOB UNIQUE,
  name TEXT,
  color TEXT,
  expiration_time INTEGER NOT NULL DEFAULT 0,
  blocked BOOLEAN NOT NULL DEFAULT FALSE,
  archived BOOLEAN NOT NULL DEFAULT FALSE
);
CREATE TABLE group_v1_member (
  _id INTEGER PRIMARY KEY,
  group_id INTEGER NOT NULL REFERENCES group_v1 (_id) ON DELETE CASCADE,
  recipient_id INTEGER NOT NULL REFERENCES recipient (_id) ON DELETE CASCADE,
  UNIQUE(group_id, recipient_id)
);
";

const SESSION_TABLE: &str = "
CREATE TABLE session (
  _id INTEGER PRIMARY KEY,
  account_id_type INTEGER NOT NULL,
  recipient_id INTEGER NOT NULL REFERENCES recipient (_id) ON DELETE CASCADE,
  device_id INTEGER NOT NULL,
  record BLOB NOT NULL,
  UNIQUE(account_id_type, recipient_id, device_id)
);
";

const IDENTITY_TABLE: &str = "
CREATE TABLE identity (
  _id INTEGER PRIMARY KEY,
  recipient_id INTEGER UNIQUE NOT NULL REFERENCES recipient (_id) ON DELETE CASCADE,
  identity_key BLOB NOT NULL,
  added_timestamp INTEGER NOT NULL,
  trust_level INTEGER NOT NULL
);
";

const SENDER_KEY_TABLE: &str = "
CREATE TABLE sender_key (
  _id INTEGER PRIMARY KEY,
  recipient_id INTEGER NOT NULL REFERENCES recipient (_id) ON DELETE CASCADE,
  device_id INTEGER NOT NULL,
  distribution_id BLOB NOT NULL,
  record BLOB NOT NULL,
  created_timestamp INTEGER NOT NULL,
  UNIQUE(recipient_id, device_id, distribution_id)
);
";

const SENDER_KEY_SHARED_TABLE: &str = "
CREATE TABLE sender_key_shared (
  _id INTEGER PRIMARY KEY,
  recipient_id INTEGER NOT NULL REFERENCES recipient (_id) ON DELETE CASCADE,
  device_id INTEGER NOT NULL,
  distribution_id BLOB NOT NULL,
  timestamp INTEGER NOT NULL,
  UNIQUE(recipient_id, device_id, distribution_id)
);
";

const MESSAGE_SEND_LOG_TABLES: &str = "
CREATE TABLE message_send_log (
  _id INTEGER PRIMARY KEY,
  content_id INTEGER NOT NULL REFERENCES message_send_log_content (_id) ON DELETE CASCADE,
  recipient_id INTEGER NOT NULL,
  device_id INTEGER NOT NULL
);
CREATE TABLE message_send_log_content (
  _id INTEGER PRIMARY KEY,
  group_id BLOB,
  timestamp INTEGER NOT NULL,
  content BLOB NOT NULL,
  content_hint INTEGER NOT NULL,
  urgent BOOLEAN NOT NULL DEFAULT TRUE
);
CREATE INDEX mslc_timestamp_index ON message_send_log_content (timestamp);
CREATE INDEX msl_recipient_index ON message_send_log (recipient_id, device_id, content_id);
CREATE INDEX msl_content_index ON message_send_log (content_id);
";

/// Current DDL, one step per entity store, in dependency order.
pub static ACCOUNT_CREATE: &[CreationStep] = &[
    CreationStep {
        entity: "recipient",
        sql: RECIPIENT_TABLE,
    },
    CreationStep {
        entity: "message_send_log",
        sql: MESSAGE_SEND_LOG_TABLES,
    },
    CreationStep {
        entity: "sticker",
        sql: STICKER_TABLE,
    },
    CreationStep {
        entity: "pre_key",
        sql: PRE_KEY_TABLE,
    },
    CreationStep {
        entity: "signed_pre_key",
        sql: SIGNED_PRE_KEY_TABLE,
    },
    CreationStep {
        entity: "group",
        sql: GROUP_TABLES,
    },
    CreationStep {
        entity: "session",
        sql: SESSION_TABLE,
    },
    CreationStep {
        entity: "identity",
        sql: IDENTITY_TABLE,
    },
    CreationStep {
        entity: "sender_key",
        sql: SENDER_KEY_TABLE,
    },
    CreationStep {
        entity: "sender_key_shared",
        sql: SENDER_KEY_SHARED_TABLE,
    },
];

/// Every schema change since version 1. Append only; never edit a released step.
pub static ACCOUNT_UPGRADES: &[MigrationStep] = &[
    MigrationStep {
        version: 2,
        entity: "recipient",
        description: "create recipient table",
        sql: RECIPIENT_TABLE,
    },
    MigrationStep {
        version: 3,
        entity: "sticker",
        description: "create sticker table",
        sql: STICKER_TABLE,
    },
    MigrationStep {
        version: 4,
        entity: "signed_pre_key",
        description: "create signed pre key table",
        sql: SIGNED_PRE_KEY_TABLE,
    },
    MigrationStep {
        version: 4,
        entity: "pre_key",
        description: "create pre key table",
        sql: PRE_KEY_TABLE,
    },
    MigrationStep {
        version: 5,
        entity: "group",
        description: "create group tables",
        sql: GROUP_TABLES,
    },
    MigrationStep {
        version: 6,
        entity: "session",
        description: "create session table",
        sql: SESSION_TABLE,
    },
    MigrationStep {
        version: 7,
        entity: "identity",
        description: "create identity table",
        sql: IDENTITY_TABLE,
    },
    MigrationStep {
        version: 8,
        entity: "sender_key",
        description: "create sender key table",
        sql: SENDER_KEY_TABLE,
    },
    MigrationStep {
        version: 8,
        entity: "sender_key_shared",
        description: "create sender key shared table",
        sql: SENDER_KEY_SHARED_TABLE,
    },
    MigrationStep {
        version: 9,
        entity: "message_send_log",
        description: "add urgent flag to message send log content",
        sql: "ALTER TABLE message_send_log_content ADD COLUMN urgent BOOLEAN NOT NULL DEFAULT TRUE;",
    },
];

/// The account store schema.
pub static ACCOUNT_SCHEMA: Schema = Schema {
    name: "account",
    target: ACCOUNT_DATABASE_VERSION,
    creation: ACCOUNT_CREATE,
    upgrades: ACCOUNT_UPGRADES,
};

/// Entry points for the per-account store.
pub struct AccountDatabase;

impl AccountDatabase {
    /// Open the account store at `path`, creating or upgrading it as needed.
    pub fn init(path: impl AsRef<Path>) -> StoreResult<Database> {
        Database::open(path, &ACCOUNT_SCHEMA)
    }

    /// [`AccountDatabase::init`] on the blocking thread pool.
    pub async fn init_async(path: impl AsRef<Path> + Send + 'static) -> StoreResult<Database> {
        Database::open_and_migrate(path, &ACCOUNT_SCHEMA).await
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use rusqlite::Connection;

    use super::*;
    use crate::migration::{self, MigrationReport};

    /// Shape of a version-1 store.
    const V1_BASELINE: &str = "
        CREATE TABLE message_send_log (
          _id INTEGER PRIMARY KEY,
          content_id INTEGER NOT NULL REFERENCES message_send_log_content (_id) ON DELETE CASCADE,
          recipient_id INTEGER NOT NULL,
          device_id INTEGER NOT NULL
        );
        CREATE TABLE message_send_log_content (
          _id INTEGER PRIMARY KEY,
          group_id BLOB,
          timestamp INTEGER NOT NULL,
          content BLOB NOT NULL,
          content_hint INTEGER NOT NULL
        );
        CREATE INDEX mslc_timestamp_index ON message_send_log_content (timestamp);
        CREATE INDEX msl_recipient_index ON message_send_log (recipient_id, device_id, content_id);
        CREATE INDEX msl_content_index ON message_send_log (content_id);
        PRAGMA user_version = 1;
    ";

    type Columns = Vec<(String, String, bool, Option<String>, i64)>;

    /// Tables with their sorted column definitions, plus index names.
    fn describe(conn: &Connection) -> (BTreeMap<String, Columns>, Vec<String>) {
        let tables: Vec<String> = conn
            .prepare(
                "SELECT name FROM sqlite_master WHERE type = 'table' \
                 AND name NOT LIKE 'sqlite_%' AND name != '_migrations' ORDER BY name",
            )
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .map(|r| r.unwrap())
            .collect();

        let mut shape = BTreeMap::new();
        for table in tables {
            let mut columns: Columns = conn
                .prepare(&format!("PRAGMA table_info({table})"))
                .unwrap()
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, bool>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, i64>(5)?,
                    ))
                })
                .unwrap()
                .map(|r| r.unwrap())
                .collect();
            columns.sort();
            shape.insert(table, columns);
        }

        let indexes: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'index' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .map(|r| r.unwrap())
            .collect();

        (shape, indexes)
    }

    fn v1_store() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(V1_BASELINE).unwrap();
        conn
    }

    #[test]
    fn account_schema_is_valid() {
        ACCOUNT_SCHEMA.validate().unwrap();
        assert_eq!(
            ACCOUNT_UPGRADES.last().map(|s| s.version),
            Some(ACCOUNT_DATABASE_VERSION)
        );
    }

    #[test]
    fn fresh_and_upgraded_stores_match() {
        let mut fresh = Connection::open_in_memory().unwrap();
        migration::migrate(&mut fresh, &ACCOUNT_SCHEMA).unwrap();

        let mut upgraded = v1_store();
        let report = migration::migrate(&mut upgraded, &ACCOUNT_SCHEMA).unwrap();
        assert_eq!(report.steps_applied(), ACCOUNT_UPGRADES.len());

        assert_eq!(describe(&fresh), describe(&upgraded));
    }

    #[test]
    fn direct_upgrade_matches_stepwise_upgrade() {
        let mut direct = v1_store();
        migration::migrate(&mut direct, &ACCOUNT_SCHEMA).unwrap();

        // Replay the history one threshold at a time, stamping as we go.
        let stepwise = v1_store();
        for version in 2..=ACCOUNT_DATABASE_VERSION {
            for step in ACCOUNT_UPGRADES.iter().filter(|s| s.version == version) {
                stepwise.execute_batch(step.sql).unwrap();
            }
            stepwise.pragma_update(None, "user_version", version).unwrap();
        }

        assert_eq!(describe(&direct).0, describe(&stepwise).0);
        assert_eq!(describe(&direct).1, describe(&stepwise).1);
    }

    #[test]
    fn upgrade_from_every_version_applies_exactly_the_missing_steps() {
        for start in 1..ACCOUNT_DATABASE_VERSION {
            let mut conn = v1_store();
            for step in ACCOUNT_UPGRADES.iter().filter(|s| s.version <= start) {
                conn.execute_batch(step.sql).unwrap();
            }
            conn.pragma_update(None, "user_version", start).unwrap();

            let report = migration::migrate(&mut conn, &ACCOUNT_SCHEMA).unwrap();
            let MigrationReport::Upgraded { from, to, applied } = report else {
                panic!("expected an upgrade from v{start}");
            };
            assert_eq!(from, start);
            assert_eq!(to, ACCOUNT_DATABASE_VERSION);

            let expected: Vec<(u32, &str)> = ACCOUNT_UPGRADES
                .iter()
                .filter(|s| s.version > start)
                .map(|s| (s.version, s.entity))
                .collect();
            assert_eq!(applied, expected);
        }
    }

    #[test]
    fn upgraded_send_log_rows_default_to_urgent() {
        let mut conn = v1_store();
        conn.execute(
            "INSERT INTO message_send_log_content (timestamp, content, content_hint) VALUES (1, x'00', 0)",
            [],
        )
        .unwrap();

        migration::migrate(&mut conn, &ACCOUNT_SCHEMA).unwrap();

        let urgent: bool = conn
            .query_row("SELECT urgent FROM message_send_log_content", [], |row| row.get(0))
            .unwrap();
        assert!(urgent);
    }

    #[test]
    fn deleting_a_recipient_cascades() {
        let db = Database::open_in_memory(&ACCOUNT_SCHEMA).unwrap();
        db.with_connection(|conn| {
            conn.execute_batch(
                "INSERT INTO recipient (_id, number) VALUES (1, '+15550100');
                 INSERT INTO session (account_id_type, recipient_id, device_id, record) VALUES (0, 1, 1, x'00');
                 INSERT INTO identity (recipient_id, identity_key, added_timestamp, trust_level) VALUES (1, x'05', 0, 1);
                 INSERT INTO sender_key (recipient_id, device_id, distribution_id, record, created_timestamp) VALUES (1, 1, x'aa', x'00', 0);
                 DELETE FROM recipient WHERE _id = 1;",
            )?;
            let remaining: i64 = conn.query_row(
                "SELECT (SELECT count(*) FROM session) + (SELECT count(*) FROM identity) + (SELECT count(*) FROM sender_key)",
                [],
                |row| row.get(0),
            )?;
            assert_eq!(remaining, 0);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn pre_keys_are_unique_per_account_type() {
        let db = Database::open_in_memory(&ACCOUNT_SCHEMA).unwrap();
        let duplicate = db.with_connection(|conn| {
            conn.execute(
                "INSERT INTO pre_key (account_id_type, key_id, public_key, private_key) VALUES (0, 7, x'01', x'02')",
                [],
            )?;
            conn.execute(
                "INSERT INTO pre_key (account_id_type, key_id, public_key, private_key) VALUES (1, 7, x'01', x'02')",
                [],
            )?;
            conn.execute(
                "INSERT INTO pre_key (account_id_type, key_id, public_key, private_key) VALUES (0, 7, x'03', x'04')",
                [],
            )?;
            Ok(())
        });
        assert!(duplicate.is_err());
    }
}
