/// Current schema version, stored in `PRAGMA user_version`.
pub const SCHEMA_VERSION: i64 = 2;

/// Schema for the cache record tables.
pub const SCHEMA: &str = r#"
-- One row per logical group (e.g. a saved article)
CREATE TABLE IF NOT EXISTS cache_groups (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    key TEXT NOT NULL UNIQUE,
    root_item TEXT,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- One row per physical cached resource. variant 0 means "no variant";
-- otherwise it is the pixel width of an image rendition.
CREATE TABLE IF NOT EXISTS cache_items (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    key TEXT NOT NULL,
    variant INTEGER NOT NULL DEFAULT 0,
    url TEXT,
    mime_type TEXT,
    etag TEXT,
    size INTEGER,
    cached_at TEXT,
    UNIQUE (key, variant)
);

-- Group membership; reference counts are derived from this table
CREATE TABLE IF NOT EXISTS cache_group_items (
    group_id INTEGER NOT NULL,
    item_id INTEGER NOT NULL,
    PRIMARY KEY (group_id, item_id),
    FOREIGN KEY (group_id) REFERENCES cache_groups(id) ON DELETE CASCADE,
    FOREIGN KEY (item_id) REFERENCES cache_items(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_cache_group_items_item ON cache_group_items(item_id);
"#;

/// Version 1 to 2: items are unique per (key, variant) instead of per key.
///
/// SQLite cannot alter a UNIQUE constraint, so the table is rebuilt with
/// foreign keys off to keep link rows from cascading away.
pub const MIGRATE_ITEM_VARIANTS: &str = r#"
PRAGMA foreign_keys = OFF;
BEGIN;
CREATE TABLE cache_items_v2 (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    key TEXT NOT NULL,
    variant INTEGER NOT NULL DEFAULT 0,
    url TEXT,
    mime_type TEXT,
    etag TEXT,
    size INTEGER,
    cached_at TEXT,
    UNIQUE (key, variant)
);
INSERT INTO cache_items_v2 (id, key, variant, url, mime_type, etag, size, cached_at)
    SELECT id, key, 0, url, mime_type, etag, size, cached_at FROM cache_items;
DROP TABLE cache_items;
ALTER TABLE cache_items_v2 RENAME TO cache_items;
COMMIT;
PRAGMA foreign_keys = ON;
"#;
