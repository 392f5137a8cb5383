//! SQL migration definitions for the chartdoc database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "Initial schema: ledger, llm_cache",
            sql: r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- One row per published document, keyed by canonical name within a sheet
CREATE TABLE IF NOT EXISTS ledger (
    sheet        TEXT NOT NULL,
    key          TEXT NOT NULL,
    display_name TEXT NOT NULL,
    url          TEXT NOT NULL,
    external_id  TEXT NOT NULL,
    html         TEXT NOT NULL,
    updated_at   TEXT NOT NULL,
    PRIMARY KEY (sheet, key)
);

-- Language-model replies keyed by prompt hash
CREATE TABLE IF NOT EXISTS llm_cache (
    prompt_hash TEXT NOT NULL,
    model       TEXT NOT NULL,
    response    TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    PRIMARY KEY (prompt_hash, model)
);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
        },
        Migration {
            version: 2,
            description: "Run history",
            sql: r#"
CREATE TABLE IF NOT EXISTS runs (
    id          TEXT PRIMARY KEY,
    mode        TEXT NOT NULL,
    started_at  TEXT NOT NULL,
    finished_at TEXT NOT NULL,
    report_json TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_runs_started ON runs(started_at);

INSERT INTO schema_migrations (version) VALUES (2);
"#,
        },
    ]
}
