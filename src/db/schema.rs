pub const SCHEMA: &str = r#"
-- Media files table: one row per discovered file
CREATE TABLE IF NOT EXISTS media_files (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    path TEXT NOT NULL UNIQUE,
    filename TEXT NOT NULL,

    -- Stream metadata (filled once the source has been opened)
    duration REAL,
    width INTEGER,
    height INTEGER,
    fps REAL,
    has_audio INTEGER NOT NULL DEFAULT 0,

    -- Pipeline state
    processing_status TEXT NOT NULL DEFAULT 'pending',  -- pending/in_progress/completed/failed
    scene_detection_complete INTEGER NOT NULL DEFAULT 0,
    features_extraction_complete INTEGER NOT NULL DEFAULT 0,
    scene_detection_progress REAL NOT NULL DEFAULT 0,   -- percent [0,100]
    feature_extraction_progress REAL NOT NULL DEFAULT 0,

    -- Timestamps
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    processing_started_at TEXT,
    processing_completed_at TEXT,

    -- Error bookkeeping
    last_error TEXT,
    error_count INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_media_files_status ON media_files(processing_status);

-- Video segments: contiguous frame ranges within a file
CREATE TABLE IF NOT EXISTS video_segments (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    media_file_id INTEGER NOT NULL,
    start_frame INTEGER NOT NULL,
    end_frame INTEGER NOT NULL,
    duration REAL NOT NULL,          -- (end - start) / fps, kept for convenience
    scene_score REAL,                -- boundary strength that ended this scene

    processing_status TEXT NOT NULL DEFAULT 'pending',
    features_extracted INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    last_error TEXT,
    error_count INTEGER NOT NULL DEFAULT 0,

    UNIQUE (media_file_id, start_frame, end_frame),
    FOREIGN KEY (media_file_id) REFERENCES media_files(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_segments_file ON video_segments(media_file_id);
CREATE INDEX IF NOT EXISTS idx_segments_status ON video_segments(processing_status);

-- Per-segment feature blobs, one row per (segment, type, name)
CREATE TABLE IF NOT EXISTS segment_features (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    segment_id INTEGER NOT NULL,
    feature_type TEXT NOT NULL,      -- e.g. 'visual'
    feature_name TEXT NOT NULL,      -- e.g. 'clip_embedding', 'color_histogram'
    feature_value BLOB NOT NULL,     -- versioned JSON envelope
    frame_number INTEGER,            -- source frame, NULL for pooled features
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,

    UNIQUE (segment_id, feature_type, feature_name),
    FOREIGN KEY (segment_id) REFERENCES video_segments(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_features_segment ON segment_features(segment_id);

-- Semantic tags derived from concept scores
CREATE TABLE IF NOT EXISTS tags (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    segment_id INTEGER NOT NULL,
    tag_type TEXT NOT NULL,          -- 'concept' or 'dominant_concept'
    tag_value TEXT NOT NULL,
    confidence REAL NOT NULL,        -- [0,1]
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,

    FOREIGN KEY (segment_id) REFERENCES video_segments(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_tags_segment ON tags(segment_id);
CREATE INDEX IF NOT EXISTS idx_tags_value ON tags(tag_type, tag_value);

-- Processing checkpoints, append-only. The row with the highest frame_number
-- for a (file, type) pair is authoritative; older rows survive until pruned.
CREATE TABLE IF NOT EXISTS checkpoints (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    media_file_id INTEGER NOT NULL,
    checkpoint_type TEXT NOT NULL,   -- 'scene_detection' or 'feature_extraction'
    frame_number INTEGER NOT NULL,
    state BLOB NOT NULL,             -- versioned JSON envelope
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,

    FOREIGN KEY (media_file_id) REFERENCES media_files(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_checkpoints_key ON checkpoints(media_file_id, checkpoint_type);
"#;

/// Column additions applied on open; errors are ignored so re-running against
/// an up-to-date database is harmless.
pub const MIGRATIONS: &[&str] = &[
    "ALTER TABLE media_files ADD COLUMN has_audio INTEGER NOT NULL DEFAULT 0",
    "ALTER TABLE video_segments ADD COLUMN scene_score REAL",
];
