pub const POSTGRES_SCHEMA: &str = r#"
-- PostgreSQL schema for photostash

CREATE TABLE IF NOT EXISTS assets (
    id BIGSERIAL PRIMARY KEY,
    file_path TEXT NOT NULL UNIQUE,

    date_taken TEXT,
    camera_make TEXT,
    camera_model TEXT,
    lens TEXT,
    shutter_speed TEXT,
    iso BIGINT,
    aperture DOUBLE PRECISION,
    focal_length DOUBLE PRECISION,

    metadata_json JSONB,

    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_assets_date_taken ON assets(date_taken);
CREATE INDEX IF NOT EXISTS idx_assets_camera ON assets(camera_make, camera_model);
CREATE INDEX IF NOT EXISTS idx_assets_metadata ON assets USING GIN (metadata_json);
CREATE INDEX IF NOT EXISTS idx_assets_metadata_text ON assets
    USING GIN (to_tsvector('simple', file_path || ' ' || COALESCE(metadata_json::text, '')));

CREATE TABLE IF NOT EXISTS backups (
    id BIGSERIAL PRIMARY KEY,
    file_path TEXT NOT NULL UNIQUE,
    s3_key TEXT NOT NULL,
    source_type TEXT NOT NULL,
    file_size BIGINT,
    uploaded_at TEXT,
    last_verified_at TEXT,
    checksum TEXT,
    status TEXT NOT NULL,
    last_error TEXT
);

CREATE INDEX IF NOT EXISTS idx_backups_source ON backups(source_type);
CREATE INDEX IF NOT EXISTS idx_backups_status ON backups(status);

CREATE TABLE IF NOT EXISTS deleted_backups (
    id BIGSERIAL PRIMARY KEY,
    file_path TEXT NOT NULL,
    s3_key TEXT NOT NULL,
    s3_full_path TEXT,
    source_type TEXT NOT NULL,
    file_size BIGINT,
    uploaded_at TEXT,
    checksum TEXT,
    original_status TEXT NOT NULL,
    deleted_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_deleted_backups_path ON deleted_backups(file_path);
CREATE INDEX IF NOT EXISTS idx_deleted_backups_deleted_at ON deleted_backups(deleted_at);
"#;
