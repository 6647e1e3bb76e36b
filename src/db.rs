use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Transaction};

use crate::pipeline::Stage;

pub fn connect(path: &Path) -> Result<Connection> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {:?}", dir))?;
    }
    let conn = Connection::open(path).with_context(|| format!("Failed to open {:?}", path))?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    init_schema(&conn)?;
    Ok(conn)
}

#[cfg(test)]
pub fn open_in_memory() -> Connection {
    let conn = Connection::open_in_memory().unwrap();
    init_schema(&conn).unwrap();
    conn
}

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS run_meta (
            key   TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS stage_runs (
            id          INTEGER PRIMARY KEY,
            run_id      TEXT NOT NULL,
            stage       INTEGER NOT NULL CHECK(stage BETWEEN 1 AND 5),
            status      TEXT NOT NULL
                        CHECK(status IN ('running','completed','partially_completed','aborted')),
            attempted   INTEGER NOT NULL DEFAULT 0,
            succeeded   INTEGER NOT NULL DEFAULT 0,
            exhausted   INTEGER NOT NULL DEFAULT 0,
            rejected    INTEGER NOT NULL DEFAULT 0,
            resumed     INTEGER NOT NULL DEFAULT 0,
            message     TEXT,
            started_at  TEXT NOT NULL DEFAULT (datetime('now')),
            finished_at TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_stage_runs_stage ON stage_runs(stage);

        -- Completed-item index: what a resumed stage must not redo
        CREATE TABLE IF NOT EXISTS completed_items (
            stage        INTEGER NOT NULL,
            item_key     TEXT NOT NULL,
            completed_at TEXT NOT NULL DEFAULT (datetime('now')),
            PRIMARY KEY (stage, item_key)
        );

        CREATE TABLE IF NOT EXISTS item_failures (
            id        INTEGER PRIMARY KEY,
            stage     INTEGER NOT NULL,
            item_key  TEXT NOT NULL,
            attempts  INTEGER NOT NULL,
            error     TEXT NOT NULL,
            failed_at TEXT NOT NULL DEFAULT (datetime('now'))
        );
        CREATE INDEX IF NOT EXISTS idx_failures_item ON item_failures(stage, item_key);

        -- Stage artifacts
        CREATE TABLE IF NOT EXISTS stage1_cards (
            card_id    TEXT PRIMARY KEY,
            page_url   TEXT NOT NULL,
            card_html  TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS stage2_links (
            source_url TEXT PRIMARY KEY,
            card_id    TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS stage3_captures (
            source_url     TEXT PRIMARY KEY,
            html           TEXT NOT NULL,
            revealed_phone TEXT,
            captured_at    TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS stage4_candidates (
            source_url          TEXT PRIMARY KEY,
            title               TEXT NOT NULL,
            raw_phone_candidate TEXT NOT NULL,
            created_at          TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS stage5_phones (
            source_url TEXT PRIMARY KEY,
            title      TEXT NOT NULL,
            phone      TEXT NOT NULL
                       CHECK(phone GLOB '([0-9][0-9][0-9]) [0-9][0-9][0-9]-[0-9][0-9][0-9][0-9]'),
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );
        ",
    )?;
    Ok(())
}

// ── Run metadata ──

pub fn set_meta(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO run_meta (key, value) VALUES (?1, ?2)",
        params![key, value],
    )?;
    Ok(())
}

pub fn get_meta(conn: &Connection, key: &str) -> Result<Option<String>> {
    let value = conn
        .query_row("SELECT value FROM run_meta WHERE key = ?1", [key], |r| r.get(0))
        .optional()?;
    Ok(value)
}

// ── Completed-item index ──

pub fn completed_keys(conn: &Connection, stage: Stage) -> Result<HashSet<String>> {
    let mut stmt = conn.prepare("SELECT item_key FROM completed_items WHERE stage = ?1")?;
    let keys = stmt
        .query_map([stage.ordinal()], |row| row.get(0))?
        .collect::<Result<HashSet<String>, _>>()?;
    Ok(keys)
}

pub fn completed_count(conn: &Connection, stage: Stage) -> Result<usize> {
    let n: usize = conn.query_row(
        "SELECT COUNT(*) FROM completed_items WHERE stage = ?1",
        [stage.ordinal()],
        |r| r.get(0),
    )?;
    Ok(n)
}

fn mark_completed(tx: &Transaction, stage: Stage, key: &str) -> Result<()> {
    tx.execute(
        "INSERT OR IGNORE INTO completed_items (stage, item_key) VALUES (?1, ?2)",
        params![stage.ordinal(), key],
    )?;
    tx.execute(
        "DELETE FROM item_failures WHERE stage = ?1 AND item_key = ?2",
        params![stage.ordinal(), key],
    )?;
    Ok(())
}

pub fn record_failure(conn: &Connection, stage: Stage, key: &str, attempts: u32, error: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO item_failures (stage, item_key, attempts, error) VALUES (?1, ?2, ?3, ?4)",
        params![stage.ordinal(), key, attempts, error],
    )?;
    Ok(())
}

// ── Stage 1: cards ──

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardRow {
    pub card_id: String,
    pub page_url: String,
    pub card_html: String,
}

/// Persist one search page's cards and mark the page done, atomically.
pub fn save_cards(conn: &Connection, page_key: &str, cards: &[CardRow]) -> Result<()> {
    let tx = conn.unchecked_transaction()?;
    {
        let mut stmt = tx.prepare(
            "INSERT OR IGNORE INTO stage1_cards (card_id, page_url, card_html) VALUES (?1, ?2, ?3)",
        )?;
        for c in cards {
            stmt.execute(params![c.card_id, c.page_url, c.card_html])?;
        }
    }
    mark_completed(&tx, Stage::Search, page_key)?;
    tx.commit()?;
    Ok(())
}

pub fn fetch_pending_cards(conn: &Connection) -> Result<Vec<CardRow>> {
    let mut stmt = conn.prepare(
        "SELECT c.card_id, c.page_url, c.card_html
         FROM stage1_cards c
         WHERE NOT EXISTS (
             SELECT 1 FROM completed_items ci WHERE ci.stage = 2 AND ci.item_key = c.card_id
         )
         ORDER BY c.rowid",
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok(CardRow {
                card_id: row.get(0)?,
                page_url: row.get(1)?,
                card_html: row.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ── Stage 2: detail links ──

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkRow {
    pub source_url: String,
    pub card_id: String,
}

/// `(card_id, link)` pairs; cards without a link are still marked done.
pub fn save_links(conn: &Connection, results: &[(String, Option<String>)]) -> Result<()> {
    let tx = conn.unchecked_transaction()?;
    {
        let mut stmt =
            tx.prepare("INSERT OR IGNORE INTO stage2_links (source_url, card_id) VALUES (?1, ?2)")?;
        for (card_id, link) in results {
            if let Some(url) = link {
                stmt.execute(params![url, card_id])?;
            }
        }
    }
    for (card_id, _) in results {
        mark_completed(&tx, Stage::Links, card_id)?;
    }
    tx.commit()?;
    Ok(())
}

pub fn fetch_links(conn: &Connection) -> Result<Vec<LinkRow>> {
    let mut stmt = conn.prepare("SELECT source_url, card_id FROM stage2_links ORDER BY rowid")?;
    let rows = stmt
        .query_map([], |row| {
            Ok(LinkRow {
                source_url: row.get(0)?,
                card_id: row.get(1)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ── Stage 3: page captures ──

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureRow {
    pub source_url: String,
    pub html: String,
    pub revealed_phone: Option<String>,
}

pub fn save_capture(conn: &Connection, row: &CaptureRow) -> Result<()> {
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "INSERT OR REPLACE INTO stage3_captures (source_url, html, revealed_phone) VALUES (?1, ?2, ?3)",
        params![row.source_url, row.html, row.revealed_phone],
    )?;
    mark_completed(&tx, Stage::Details, &row.source_url)?;
    tx.commit()?;
    Ok(())
}

pub fn fetch_pending_captures(conn: &Connection) -> Result<Vec<CaptureRow>> {
    let mut stmt = conn.prepare(
        "SELECT c.source_url, c.html, c.revealed_phone
         FROM stage3_captures c
         WHERE NOT EXISTS (
             SELECT 1 FROM completed_items ci WHERE ci.stage = 4 AND ci.item_key = c.source_url
         )
         ORDER BY c.rowid",
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok(CaptureRow {
                source_url: row.get(0)?,
                html: row.get(1)?,
                revealed_phone: row.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ── Stage 4: title + phone candidate ──

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateRow {
    pub source_url: String,
    pub title: String,
    pub raw_phone_candidate: String,
}

/// `(source_url, candidate)` pairs; `None` means the capture was excluded.
pub fn save_candidates(conn: &Connection, results: &[(String, Option<CandidateRow>)]) -> Result<()> {
    let tx = conn.unchecked_transaction()?;
    {
        let mut stmt = tx.prepare(
            "INSERT OR REPLACE INTO stage4_candidates (source_url, title, raw_phone_candidate)
             VALUES (?1, ?2, ?3)",
        )?;
        for row in results.iter().filter_map(|(_, c)| c.as_ref()) {
            stmt.execute(params![row.source_url, row.title, row.raw_phone_candidate])?;
        }
    }
    for (key, _) in results {
        mark_completed(&tx, Stage::Extract, key)?;
    }
    tx.commit()?;
    Ok(())
}

pub fn fetch_pending_candidates(conn: &Connection) -> Result<Vec<CandidateRow>> {
    let mut stmt = conn.prepare(
        "SELECT c.source_url, c.title, c.raw_phone_candidate
         FROM stage4_candidates c
         WHERE NOT EXISTS (
             SELECT 1 FROM completed_items ci WHERE ci.stage = 5 AND ci.item_key = c.source_url
         )
         ORDER BY c.rowid",
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok(CandidateRow {
                source_url: row.get(0)?,
                title: row.get(1)?,
                raw_phone_candidate: row.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ── Stage 5: validated phones ──

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhoneRow {
    pub source_url: String,
    pub title: String,
    pub phone: String,
}

pub fn save_phones(conn: &Connection, results: &[(String, Option<PhoneRow>)]) -> Result<()> {
    let tx = conn.unchecked_transaction()?;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO stage5_phones (source_url, title, phone) VALUES (?1, ?2, ?3)
             ON CONFLICT(source_url) DO NOTHING",
        )?;
        for row in results.iter().filter_map(|(_, p)| p.as_ref()) {
            stmt.execute(params![row.source_url, row.title, row.phone])?;
        }
    }
    for (key, _) in results {
        mark_completed(&tx, Stage::Filter, key)?;
    }
    tx.commit()?;
    Ok(())
}

pub fn fetch_phones(conn: &Connection, limit: Option<usize>) -> Result<Vec<PhoneRow>> {
    let sql = match limit {
        Some(n) => format!(
            "SELECT source_url, title, phone FROM stage5_phones ORDER BY rowid LIMIT {}",
            n
        ),
        None => "SELECT source_url, title, phone FROM stage5_phones ORDER BY rowid".to_string(),
    };
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([], |row| {
            Ok(PhoneRow {
                source_url: row.get(0)?,
                title: row.get(1)?,
                phone: row.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ── Stage bookkeeping ──

pub fn artifact_count(conn: &Connection, stage: Stage) -> Result<usize> {
    let sql = format!("SELECT COUNT(*) FROM {}", stage.artifact_table());
    let n: usize = conn.query_row(&sql, [], |r| r.get(0))?;
    Ok(n)
}

pub fn begin_stage_run(conn: &Connection, run_id: &str, stage: Stage) -> Result<i64> {
    conn.execute(
        "INSERT INTO stage_runs (run_id, stage, status) VALUES (?1, ?2, 'running')",
        params![run_id, stage.ordinal()],
    )?;
    Ok(conn.last_insert_rowid())
}

pub struct StageRunUpdate<'a> {
    pub status: &'a str,
    pub attempted: usize,
    pub succeeded: usize,
    pub exhausted: usize,
    pub rejected: usize,
    pub resumed: usize,
    pub message: Option<&'a str>,
}

pub fn finish_stage_run(conn: &Connection, id: i64, u: &StageRunUpdate) -> Result<()> {
    conn.execute(
        "UPDATE stage_runs
         SET status = ?2, attempted = ?3, succeeded = ?4, exhausted = ?5, rejected = ?6,
             resumed = ?7, message = ?8, finished_at = datetime('now')
         WHERE id = ?1",
        params![id, u.status, u.attempted, u.succeeded, u.exhausted, u.rejected, u.resumed, u.message],
    )?;
    Ok(())
}

pub struct StageStats {
    pub stage: Stage,
    pub artifact_rows: usize,
    pub completed_items: usize,
    pub failures: usize,
    pub last_status: Option<String>,
    pub last_finished: Option<String>,
}

pub fn stage_stats(conn: &Connection) -> Result<Vec<StageStats>> {
    let mut out = Vec::with_capacity(Stage::ALL.len());
    for stage in Stage::ALL {
        let completed_items = completed_count(conn, stage)?;
        let failures: usize = conn.query_row(
            "SELECT COUNT(DISTINCT item_key) FROM item_failures WHERE stage = ?1",
            [stage.ordinal()],
            |r| r.get(0),
        )?;
        let last: Option<(String, Option<String>)> = conn
            .query_row(
                "SELECT status, finished_at FROM stage_runs WHERE stage = ?1 ORDER BY id DESC LIMIT 1",
                [stage.ordinal()],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        out.push(StageStats {
            stage,
            artifact_rows: artifact_count(conn, stage)?,
            completed_items,
            failures,
            last_status: last.as_ref().map(|(s, _)| s.clone()),
            last_finished: last.and_then(|(_, f)| f),
        });
    }
    Ok(out)
}

/// Forget one stage's artifact and progress so it can be recomputed.
pub fn reset_stage(conn: &Connection, stage: Stage) -> Result<usize> {
    let tx = conn.unchecked_transaction()?;
    let removed = tx.execute(&format!("DELETE FROM {}", stage.artifact_table()), [])?;
    tx.execute("DELETE FROM completed_items WHERE stage = ?1", [stage.ordinal()])?;
    tx.execute("DELETE FROM item_failures WHERE stage = ?1", [stage.ordinal()])?;
    tx.commit()?;
    Ok(removed)
}
