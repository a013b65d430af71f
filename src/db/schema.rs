//! Schema DDL and forward migrations.
//!
//! Each migration is one schema generation applied inside a transaction;
//! `schema_version` records every generation ever applied. Generation 1 is
//! the full current schema, so a fresh store and a migrated store end up
//! byte-compatible.

/// Applied before any migration so version bookkeeping always exists.
pub const VERSION_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at REAL NOT NULL
)
"#;

/// Ordered (generation, DDL batch) pairs.
pub const MIGRATIONS: &[(i64, &str)] = &[(1, SCHEMA_V1)];

const SCHEMA_V1: &str = r#"
-- Files: one row per discovered image on disk
CREATE TABLE files (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    path TEXT NOT NULL UNIQUE,
    size INTEGER NOT NULL,
    mtime REAL NOT NULL,
    fast_hash INTEGER,
    sha256 TEXT,
    discovered_at REAL NOT NULL,
    last_seen_at REAL NOT NULL,
    status TEXT NOT NULL DEFAULT 'active' CHECK (status IN ('active', 'missing')),
    unprocessable INTEGER NOT NULL DEFAULT 0,
    needs_features INTEGER NOT NULL DEFAULT 1
);

CREATE INDEX idx_files_size_fast_hash ON files (size, fast_hash);
CREATE INDEX idx_files_status ON files (status);
CREATE INDEX idx_files_needs_features ON files (needs_features);
CREATE INDEX idx_files_last_seen ON files (last_seen_at);

-- Features: derived fingerprints, 1:1 with files
CREATE TABLE features (
    file_id INTEGER PRIMARY KEY,
    phash INTEGER,
    dhash INTEGER,
    ahash INTEGER,
    width INTEGER,
    height INTEGER,
    exif_dt REAL,
    camera_make TEXT,
    camera_model TEXT,
    orientation INTEGER NOT NULL DEFAULT 1,
    generated_at REAL NOT NULL,
    FOREIGN KEY (file_id) REFERENCES files (id) ON DELETE CASCADE
);

-- Groups: equivalence classes of duplicate files
CREATE TABLE groups (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    tier TEXT NOT NULL CHECK (tier IN ('exact', 'near')),
    confidence REAL NOT NULL,
    created_at REAL NOT NULL,
    updated_at REAL NOT NULL
);

-- Group members: participation of a file in a group
CREATE TABLE group_members (
    group_id INTEGER NOT NULL,
    file_id INTEGER NOT NULL,
    role TEXT NOT NULL DEFAULT 'duplicate'
        CHECK (role IN ('original', 'duplicate', 'safe_duplicate')),
    similarity_score REAL,
    notes TEXT,
    PRIMARY KEY (group_id, file_id),
    FOREIGN KEY (group_id) REFERENCES groups (id) ON DELETE CASCADE,
    FOREIGN KEY (file_id) REFERENCES files (id) ON DELETE CASCADE
);

CREATE INDEX idx_group_members_file_id ON group_members (file_id);
CREATE UNIQUE INDEX idx_group_members_original
    ON group_members (group_id) WHERE role = 'original';

-- Manual overrides: user decisions that pin a group's original
CREATE TABLE manual_overrides (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    group_id INTEGER NOT NULL,
    original_file_id INTEGER NOT NULL,
    auto_original_id INTEGER NOT NULL,
    override_type TEXT NOT NULL CHECK (override_type IN ('single_group', 'default_rule')),
    reason TEXT NOT NULL CHECK (reason IN ('user_preference', 'quality_better',
        'format_preference', 'manual_selection', 'algorithm_error')),
    created_at REAL NOT NULL,
    notes TEXT,
    is_active BOOLEAN DEFAULT 1,
    FOREIGN KEY (group_id) REFERENCES groups (id) ON DELETE CASCADE,
    FOREIGN KEY (original_file_id) REFERENCES files (id) ON DELETE CASCADE,
    FOREIGN KEY (auto_original_id) REFERENCES files (id) ON DELETE CASCADE,
    UNIQUE (group_id, is_active)
);

CREATE INDEX idx_manual_overrides_group_id ON manual_overrides (group_id);
CREATE INDEX idx_manual_overrides_active ON manual_overrides (is_active);
"#;
