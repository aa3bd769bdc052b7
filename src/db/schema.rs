pub const SCHEMA: &str = r#"
-- Assets: one row per indexed image file
CREATE TABLE IF NOT EXISTS assets (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    file_path TEXT NOT NULL UNIQUE,

    -- Extracted scalars, NULL until known
    date_taken TEXT,
    camera_make TEXT,
    camera_model TEXT,
    lens TEXT,
    shutter_speed TEXT,
    iso INTEGER,
    aperture REAL,
    focal_length REAL,

    -- Every extracted key/value as a JSON object
    metadata_json TEXT,

    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_assets_date_taken ON assets(date_taken);
CREATE INDEX IF NOT EXISTS idx_assets_camera ON assets(camera_make, camera_model);

-- Full-text index over the raw metadata, kept in step with assets by triggers
CREATE VIRTUAL TABLE IF NOT EXISTS assets_fts USING fts5(
    file_path,
    metadata_json,
    content = 'assets',
    content_rowid = 'id'
);

CREATE TRIGGER IF NOT EXISTS assets_fts_insert AFTER INSERT ON assets BEGIN
    INSERT INTO assets_fts (rowid, file_path, metadata_json)
    VALUES (new.id, new.file_path, new.metadata_json);
END;

CREATE TRIGGER IF NOT EXISTS assets_fts_update AFTER UPDATE ON assets BEGIN
    INSERT INTO assets_fts (assets_fts, rowid, file_path, metadata_json)
    VALUES ('delete', old.id, old.file_path, old.metadata_json);
    INSERT INTO assets_fts (rowid, file_path, metadata_json)
    VALUES (new.id, new.file_path, new.metadata_json);
END;

-- Backups: replication state of each corpus file
CREATE TABLE IF NOT EXISTS backups (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    file_path TEXT NOT NULL UNIQUE,
    s3_key TEXT NOT NULL,
    source_type TEXT NOT NULL,      -- internal/external/immich_upload
    file_size INTEGER,
    uploaded_at TEXT,
    last_verified_at TEXT,
    checksum TEXT,                  -- hex MD5 of the uploaded contents
    status TEXT NOT NULL,           -- uploaded/error
    last_error TEXT
);

CREATE INDEX IF NOT EXISTS idx_backups_source ON backups(source_type);
CREATE INDEX IF NOT EXISTS idx_backups_status ON backups(status);

-- Deleted backups: append-only audit of records whose file disappeared
CREATE TABLE IF NOT EXISTS deleted_backups (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    file_path TEXT NOT NULL,
    s3_key TEXT NOT NULL,
    s3_full_path TEXT,
    source_type TEXT NOT NULL,
    file_size INTEGER,
    uploaded_at TEXT,
    checksum TEXT,
    original_status TEXT NOT NULL,
    deleted_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_deleted_backups_path ON deleted_backups(file_path);
CREATE INDEX IF NOT EXISTS idx_deleted_backups_deleted_at ON deleted_backups(deleted_at);
"#;
