use chrono::Utc;
use gacha_core::{GachaId, Item, ItemId, RarityRates, UserId};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::Serialize;

/// Open (or create) the database file and bootstrap the schema.
pub fn open(path: &str) -> rusqlite::Result<Connection> {
    let conn = Connection::open(path)?;
    configure(&conn)?;
    Ok(conn)
}

pub fn open_in_memory() -> rusqlite::Result<Connection> {
    let conn = Connection::open_in_memory()?;
    configure(&conn)?;
    Ok(conn)
}

fn configure(conn: &Connection) -> rusqlite::Result<()> {
    // Cascade from gachas to gacha_items relies on this pragma.
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    init_schema(conn)
}

pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            email TEXT NOT NULL UNIQUE,
            password_hash TEXT NOT NULL,
            display_name TEXT,
            role TEXT NOT NULL DEFAULT 'user',
            failed_login_attempts INTEGER NOT NULL DEFAULT 0,
            locked_until TEXT,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS gachas (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            title TEXT NOT NULL,
            description TEXT,
            category TEXT,
            thumbnail TEXT,
            rarity_rates TEXT NOT NULL DEFAULT '{}',
            author_id INTEGER,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS gacha_items (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            gacha_id INTEGER NOT NULL REFERENCES gachas(id) ON DELETE CASCADE,
            name TEXT NOT NULL,
            rarity TEXT NOT NULL,
            img_src TEXT,
            weight INTEGER NOT NULL DEFAULT 1
        );

        -- Append-only roll history; nothing ever updates or deletes rows.
        CREATE TABLE IF NOT EXISTS gacha_rolls (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL,
            gacha_id INTEGER NOT NULL,
            item_id INTEGER NOT NULL,
            rarity TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_items_gacha ON gacha_items(gacha_id);
        CREATE INDEX IF NOT EXISTS idx_rolls_gacha ON gacha_rolls(gacha_id);
        "#,
    )
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

#[derive(Clone, Debug)]
pub struct UserRecord {
    pub id: UserId,
    pub email: String,
    pub password_hash: String,
    pub display_name: Option<String>,
    pub role: String,
    pub failed_login_attempts: i64,
    pub locked_until: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct GachaRecord {
    pub id: GachaId,
    pub title: String,
    pub description: Option<String>,
    pub category: Option<String>,
    pub thumbnail: Option<String>,
    pub rarity_rates: RarityRates,
    pub author_id: Option<UserId>,
    pub created_at: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct GachaSummary {
    pub id: GachaId,
    pub title: String,
    pub thumbnail: Option<String>,
    pub category: Option<String>,
    pub rarity_rates: RarityRates,
    pub created_at: String,
}

/// Mutable gacha columns, shared by create and update.
#[derive(Clone, Debug)]
pub struct GachaMeta {
    pub title: String,
    pub description: Option<String>,
    pub category: Option<String>,
    pub thumbnail: Option<String>,
    pub rarity_rates: RarityRates,
}

#[derive(Clone, Debug)]
pub struct NewItem {
    pub name: String,
    pub rarity: String,
    pub img_src: Option<String>,
    pub weight: i64,
}

fn parse_rates(raw: Option<String>) -> RarityRates {
    raw.and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default()
}

// --- users ---

pub fn insert_user(
    conn: &Connection,
    email: &str,
    password_hash: &str,
    display_name: Option<&str>,
    role: &str,
) -> rusqlite::Result<UserId> {
    conn.execute(
        "INSERT INTO users (email, password_hash, display_name, role, created_at) VALUES (?,?,?,?,?)",
        params![email, password_hash, display_name, role, now_rfc3339()],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn find_user_by_email(conn: &Connection, email: &str) -> rusqlite::Result<Option<UserRecord>> {
    conn.query_row(
        "SELECT id, email, password_hash, display_name, role, failed_login_attempts, locked_until
         FROM users WHERE email = ?",
        [email],
        |row| {
            Ok(UserRecord {
                id: row.get(0)?,
                email: row.get(1)?,
                password_hash: row.get(2)?,
                display_name: row.get(3)?,
                role: row.get(4)?,
                failed_login_attempts: row.get(5)?,
                locked_until: row.get(6)?,
            })
        },
    )
    .optional()
}

/// Promote an existing account to admin with a fresh password hash.
pub fn promote_to_admin(
    conn: &Connection,
    user_id: UserId,
    password_hash: &str,
) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE users SET password_hash = ?, role = 'admin' WHERE id = ?",
        params![password_hash, user_id],
    )?;
    Ok(())
}

pub fn record_failed_login(
    conn: &Connection,
    user_id: UserId,
    attempts: i64,
    locked_until: Option<&str>,
) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE users SET failed_login_attempts = ?, locked_until = ? WHERE id = ?",
        params![attempts, locked_until, user_id],
    )?;
    Ok(())
}

pub fn reset_login_counters(conn: &Connection, user_id: UserId) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE users SET failed_login_attempts = 0, locked_until = NULL WHERE id = ?",
        [user_id],
    )?;
    Ok(())
}

// --- gachas ---

pub fn list_gachas(conn: &Connection) -> rusqlite::Result<Vec<GachaSummary>> {
    let mut stmt = conn.prepare(
        "SELECT id, title, thumbnail, category, rarity_rates, created_at
         FROM gachas ORDER BY created_at DESC",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(GachaSummary {
            id: row.get(0)?,
            title: row.get(1)?,
            thumbnail: row.get(2)?,
            category: row.get(3)?,
            rarity_rates: parse_rates(row.get(4)?),
            created_at: row.get(5)?,
        })
    })?;
    rows.collect()
}

pub fn get_gacha(conn: &Connection, id: GachaId) -> rusqlite::Result<Option<GachaRecord>> {
    conn.query_row(
        "SELECT id, title, description, category, thumbnail, rarity_rates, author_id, created_at
         FROM gachas WHERE id = ?",
        [id],
        |row| {
            Ok(GachaRecord {
                id: row.get(0)?,
                title: row.get(1)?,
                description: row.get(2)?,
                category: row.get(3)?,
                thumbnail: row.get(4)?,
                rarity_rates: parse_rates(row.get(5)?),
                author_id: row.get(6)?,
                created_at: row.get(7)?,
            })
        },
    )
    .optional()
}

pub fn get_items(conn: &Connection, gacha_id: GachaId) -> rusqlite::Result<Vec<Item>> {
    let mut stmt = conn.prepare(
        "SELECT id, name, rarity, img_src, weight FROM gacha_items WHERE gacha_id = ?",
    )?;
    let rows = stmt.query_map([gacha_id], |row| {
        Ok(Item {
            id: row.get(0)?,
            name: row.get(1)?,
            rarity: row.get(2)?,
            img_src: row.get(3)?,
            weight: row.get(4)?,
        })
    })?;
    rows.collect()
}

/// Insert a gacha and its items in one transaction; either both land or
/// neither does.
pub fn create_gacha(
    conn: &mut Connection,
    meta: &GachaMeta,
    author_id: UserId,
    items: &[NewItem],
) -> rusqlite::Result<GachaId> {
    let rates_json = serde_json::to_string(&meta.rarity_rates).unwrap_or_else(|_| "{}".into());
    let tx = conn.transaction()?;
    tx.execute(
        "INSERT INTO gachas (title, description, category, thumbnail, rarity_rates, author_id, created_at)
         VALUES (?,?,?,?,?,?,?)",
        params![
            meta.title,
            meta.description,
            meta.category,
            meta.thumbnail,
            rates_json,
            author_id,
            now_rfc3339(),
        ],
    )?;
    let gacha_id = tx.last_insert_rowid();
    {
        let mut stmt = tx.prepare_cached(
            "INSERT INTO gacha_items (gacha_id, name, rarity, img_src, weight) VALUES (?,?,?,?,?)",
        )?;
        for item in items {
            stmt.execute(params![gacha_id, item.name, item.rarity, item.img_src, item.weight])?;
        }
    }
    tx.commit()?;
    Ok(gacha_id)
}

pub fn update_gacha(conn: &Connection, id: GachaId, meta: &GachaMeta) -> rusqlite::Result<usize> {
    let rates_json = serde_json::to_string(&meta.rarity_rates).unwrap_or_else(|_| "{}".into());
    conn.execute(
        "UPDATE gachas SET title=?, description=?, category=?, thumbnail=?, rarity_rates=? WHERE id=?",
        params![meta.title, meta.description, meta.category, meta.thumbnail, rates_json, id],
    )
}

pub fn delete_gacha(conn: &Connection, id: GachaId) -> rusqlite::Result<usize> {
    conn.execute("DELETE FROM gachas WHERE id = ?", [id])
}

// --- roll history ---

pub fn insert_roll(
    tx: &Transaction,
    user_id: UserId,
    gacha_id: GachaId,
    item_id: ItemId,
    rarity: &str,
    created_at: &str,
) -> rusqlite::Result<()> {
    tx.execute(
        "INSERT INTO gacha_rolls (user_id, gacha_id, item_id, rarity, created_at) VALUES (?,?,?,?,?)",
        params![user_id, gacha_id, item_id, rarity, created_at],
    )?;
    Ok(())
}

pub fn count_rolls(conn: &Connection, gacha_id: GachaId) -> rusqlite::Result<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM gacha_rolls WHERE gacha_id = ?",
        [gacha_id],
        |row| row.get(0),
    )
}
