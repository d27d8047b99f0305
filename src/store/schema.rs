pub const SCHEMA: &str = r#"
-- Flags are never deleted; archiving is a status
CREATE TABLE IF NOT EXISTS flags (
    id TEXT PRIMARY KEY,
    key TEXT NOT NULL,
    name TEXT,
    description TEXT,
    flag_type TEXT NOT NULL DEFAULT 'boolean',
    status TEXT NOT NULL DEFAULT 'active',
    default_value INTEGER NOT NULL DEFAULT 0,
    rollout_percentage INTEGER NOT NULL DEFAULT 0,
    rollout_by TEXT,

    -- JSON documents, opaque to scheduling
    rules TEXT NOT NULL DEFAULT '[]',
    variants TEXT NOT NULL DEFAULT '[]',

    -- JSON array of flag keys in the same scope
    dependencies TEXT NOT NULL DEFAULT '[]',

    -- Exactly one owner: website, organization or user
    scope_kind TEXT NOT NULL,
    scope_id TEXT NOT NULL,
    environment TEXT,

    created_at TEXT DEFAULT (datetime('now')),
    updated_at TEXT DEFAULT (datetime('now')),

    UNIQUE(scope_kind, scope_id, key)
);

-- One row per schedule; soft-disabled through is_enabled
CREATE TABLE IF NOT EXISTS flag_schedules (
    id TEXT PRIMARY KEY,
    flag_id TEXT NOT NULL REFERENCES flags(id) ON DELETE CASCADE,
    schedule_type TEXT NOT NULL,
    is_enabled INTEGER NOT NULL DEFAULT 1,

    -- Single-shot schedules only
    scheduled_at TEXT,
    executed_at TEXT,

    -- JSON array of delivery-service message ids
    message_ids TEXT NOT NULL DEFAULT '[]',

    created_at TEXT DEFAULT (datetime('now')),
    updated_at TEXT DEFAULT (datetime('now'))
);

-- Rollout steps of batch schedules; executed_at is claimed with a conditional update
CREATE TABLE IF NOT EXISTS flag_schedule_steps (
    schedule_id TEXT NOT NULL REFERENCES flag_schedules(id) ON DELETE CASCADE,
    position INTEGER NOT NULL,
    scheduled_at TEXT NOT NULL,
    executed_at TEXT,
    value TEXT NOT NULL,
    PRIMARY KEY (schedule_id, position),
    UNIQUE(schedule_id, scheduled_at)
);

CREATE INDEX IF NOT EXISTS idx_flags_scope ON flags(scope_kind, scope_id);
CREATE INDEX IF NOT EXISTS idx_flags_scope_status ON flags(scope_kind, scope_id, status);
CREATE INDEX IF NOT EXISTS idx_flag_schedules_flag ON flag_schedules(flag_id);
"#;
