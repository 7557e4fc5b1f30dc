//! The site's schema history, compiled into the binary.
//!
//! Tables live in per-concern namespaces. SQLite cannot enforce foreign keys
//! across attached databases, so `owner_id` columns that point at
//! `identity.users` are checked by the application.

use folio_common::Result;

use crate::migration::Migration;

/// A compiled-in migration.
pub struct BuiltinMigration {
    pub id: &'static str,
    pub up: &'static str,
    pub down: &'static str,
    pub lossy: Option<&'static str>,
}

/// Namespaces the catalog writes to.
pub const REQUIRED_NAMESPACES: &[&str] = &["identity", "bookmarks", "crm", "habits"];

pub const CREATE_IDENTITY_USERS: BuiltinMigration = BuiltinMigration {
    id: "20230115093000_create_identity_users",
    up: "
CREATE TABLE identity.users (
    id INTEGER PRIMARY KEY,
    email TEXT NOT NULL UNIQUE COLLATE NOCASE,
    password_hash TEXT NOT NULL,
    display_name TEXT,
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX identity.idx_users_created_at ON users(created_at);
",
    down: "DROP TABLE identity.users;",
    lossy: None,
};

pub const CREATE_IDENTITY_ROLES: BuiltinMigration = BuiltinMigration {
    id: "20230115094500_create_identity_roles",
    up: "
CREATE TABLE identity.roles (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    description TEXT
);

CREATE TABLE identity.user_roles (
    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    role_id INTEGER NOT NULL REFERENCES roles(id) ON DELETE CASCADE,
    granted_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (user_id, role_id)
);

INSERT INTO identity.roles (name, description) VALUES
    ('admin', 'Full access to the site dashboard'),
    ('editor', 'Can publish posts and manage bookmarks');
",
    down: "
DROP TABLE identity.user_roles;
DROP TABLE identity.roles;
",
    lossy: None,
};

pub const CREATE_BOOKMARKS: BuiltinMigration = BuiltinMigration {
    id: "20230302110000_create_bookmarks",
    up: "
CREATE TABLE bookmarks.bookmarks (
    id INTEGER PRIMARY KEY,
    owner_id INTEGER NOT NULL,
    url TEXT NOT NULL,
    title TEXT NOT NULL,
    notes TEXT,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE UNIQUE INDEX bookmarks.idx_bookmarks_owner_url ON bookmarks(owner_id, url);

CREATE TABLE bookmarks.tags (
    id INTEGER PRIMARY KEY,
    label TEXT NOT NULL UNIQUE
);

CREATE TABLE bookmarks.bookmark_tags (
    bookmark_id INTEGER NOT NULL REFERENCES bookmarks(id) ON DELETE CASCADE,
    tag_id INTEGER NOT NULL REFERENCES tags(id) ON DELETE CASCADE,
    PRIMARY KEY (bookmark_id, tag_id)
);
",
    down: "
DROP TABLE bookmarks.bookmark_tags;
DROP TABLE bookmarks.tags;
DROP TABLE bookmarks.bookmarks;
",
    lossy: None,
};

pub const CREATE_CRM_INQUIRIES: BuiltinMigration = BuiltinMigration {
    id: "20230610150000_create_crm_inquiries",
    up: "
CREATE TABLE crm.inquiries (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    email TEXT NOT NULL,
    company TEXT,
    message TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'new' CHECK (status IN ('new', 'contacted', 'closed')),
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX crm.idx_inquiries_status ON inquiries(status, created_at);

CREATE TABLE crm.inquiry_notes (
    id INTEGER PRIMARY KEY,
    inquiry_id INTEGER NOT NULL REFERENCES inquiries(id) ON DELETE CASCADE,
    body TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);
",
    down: "
DROP TABLE crm.inquiry_notes;
DROP TABLE crm.inquiries;
",
    lossy: None,
};

pub const ADD_BOOKMARK_VISIBILITY: BuiltinMigration = BuiltinMigration {
    id: "20231104081500_add_bookmark_visibility",
    up: "
ALTER TABLE bookmarks.bookmarks ADD COLUMN is_public INTEGER NOT NULL DEFAULT 0;

CREATE INDEX bookmarks.idx_bookmarks_public ON bookmarks(is_public, created_at);
",
    down: "
DROP INDEX bookmarks.idx_bookmarks_public;
ALTER TABLE bookmarks.bookmarks DROP COLUMN is_public;
",
    lossy: None,
};

pub const CREATE_HABITS: BuiltinMigration = BuiltinMigration {
    id: "20240120120000_create_habits",
    up: "
CREATE TABLE habits.habits (
    id INTEGER PRIMARY KEY,
    owner_id INTEGER NOT NULL,
    title TEXT NOT NULL,
    cadence TEXT NOT NULL DEFAULT 'daily' CHECK (cadence IN ('daily', 'weekly')),
    archived_at TEXT,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE habits.habit_entries (
    id INTEGER PRIMARY KEY,
    habit_id INTEGER NOT NULL REFERENCES habits(id) ON DELETE CASCADE,
    completed_on TEXT NOT NULL,
    note TEXT,
    UNIQUE (habit_id, completed_on)
);
",
    down: "
DROP TABLE habits.habit_entries;
DROP TABLE habits.habits;
",
    lossy: None,
};

pub const DROP_CRM_INQUIRY_NOTES: BuiltinMigration = BuiltinMigration {
    id: "20240402090000_drop_crm_inquiry_notes",
    up: "DROP TABLE crm.inquiry_notes;",
    down: "
CREATE TABLE crm.inquiry_notes (
    id INTEGER PRIMARY KEY,
    inquiry_id INTEGER NOT NULL REFERENCES inquiries(id) ON DELETE CASCADE,
    body TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);
",
    lossy: Some("recreates crm.inquiry_notes empty; notes stored before the drop are lost"),
};

/// Declared order is authoring order.
pub const CATALOG: &[BuiltinMigration] = &[
    CREATE_IDENTITY_USERS,
    CREATE_IDENTITY_ROLES,
    CREATE_BOOKMARKS,
    CREATE_CRM_INQUIRIES,
    ADD_BOOKMARK_VISIBILITY,
    CREATE_HABITS,
    DROP_CRM_INQUIRY_NOTES,
];

/// The catalog as owned migrations, in declared order. Ordering is checked
/// when the caller builds a `MigrationSet` from it.
pub fn builtin() -> Result<Vec<Migration>> {
    CATALOG
        .iter()
        .map(|b| {
            let migration = Migration::new(b.id, b.up, b.down)?;
            Ok(match b.lossy {
                Some(reason) => migration.lossy(reason),
                None => migration,
            })
        })
        .collect()
}

/// Required namespaces that `attached` does not provide.
pub fn missing_namespaces(attached: &[String]) -> Vec<&'static str> {
    REQUIRED_NAMESPACES
        .iter()
        .copied()
        .filter(|ns| !attached.iter().any(|a| a.eq_ignore_ascii_case(ns)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::MigrationSet;

    #[test]
    fn catalog_is_a_valid_ordered_set() {
        let set = MigrationSet::new(builtin().unwrap()).unwrap();
        assert_eq!(set.len(), CATALOG.len());
    }

    #[test]
    fn only_the_notes_drop_is_lossy() {
        let lossy: Vec<_> = builtin()
            .unwrap()
            .into_iter()
            .filter(|m| m.is_lossy())
            .map(|m| m.id.to_string())
            .collect();
        assert_eq!(lossy, ["20240402090000_drop_crm_inquiry_notes"]);
    }

    #[test]
    fn reports_missing_namespaces() {
        let attached = vec!["identity".to_string(), "CRM".to_string()];
        assert_eq!(missing_namespaces(&attached), ["bookmarks", "habits"]);
        let all: Vec<String> = REQUIRED_NAMESPACES.iter().map(|s| s.to_string()).collect();
        assert!(missing_namespaces(&all).is_empty());
    }
}
