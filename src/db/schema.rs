pub const SCHEMA: &str = r#"
-- key/value table backing the persisted state
CREATE TABLE IF NOT EXISTS kv (
    area TEXT NOT NULL,
    key TEXT NOT NULL,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (area, key)
);
"#;

// Header rows of the two flat record sets. Field order is fixed.
pub const SOURCE_FIELDS: [&str; 3] = ["internalId", "rawName", "isSubscribed"];
pub const FEED_STATE_FIELDS: [&str; 4] = ["internalId", "configFrequency", "statTotal", "statSkips"];

pub const CSV_DELIMITER: char = ',';
pub const CSV_NEWLINE: char = '\n';
