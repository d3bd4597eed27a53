//! Flat text encoding of the two stored collections.
//!
//! Each collection is a header row followed by one row per record. Decoding
//! is lenient about values (bad numbers fall back to defaults) and strict
//! about structure: a broken row rejects the whole input.

use std::collections::HashMap;

use crate::error::{AppError, Result};
use crate::models::{
    clamp_frequency, resolve_from_name, FeedConfig, FeedState, FeedStats, Source,
    DEFAULT_FREQUENCY, SOURCE_PREFIX,
};

use super::schema::{CSV_DELIMITER, CSV_NEWLINE, FEED_STATE_FIELDS, SOURCE_FIELDS};

const SOURCES: &str = "sources";
const FEED_STATES: &str = "feed states";

pub fn encode_sources(sources: &[Source]) -> String {
    let rows = sources.iter().map(|source| {
        vec![
            source.internal_id.clone(),
            source.identity.raw_name().to_string(),
            if source.is_subscribed { "1" } else { "0" }.to_string(),
        ]
    });
    encode_table(&SOURCE_FIELDS, rows)
}

pub fn decode_sources(data: &str) -> Result<Vec<Source>> {
    let table = Table::parse(data, SOURCES)?;
    let Some(table) = table else {
        return Ok(Vec::new());
    };
    table.require(&["internalId", "rawName"])?;

    table
        .rows
        .iter()
        .map(|row| -> Result<Source> {
            let raw_name = table.field(row, "rawName").unwrap_or_default();
            let identity = resolve_from_name(&format!("{}{}", SOURCE_PREFIX, raw_name))
                .ok_or_else(|| AppError::Decode {
                    collection: SOURCES,
                    line: row.line,
                    reason: format!("unresolvable source name {:?}", raw_name),
                })?;

            Ok(Source {
                identity,
                internal_id: table.field(row, "internalId").unwrap_or_default().to_string(),
                is_subscribed: table.field(row, "isSubscribed").map(str::trim) == Some("1"),
            })
        })
        .collect()
}

pub fn encode_feed_states(feeds: &[FeedState]) -> String {
    let rows = feeds.iter().map(|feed| {
        vec![
            feed.internal_id.clone(),
            feed.config.frequency.to_string(),
            feed.stats.total.to_string(),
            feed.stats.skips.to_string(),
        ]
    });
    encode_table(&FEED_STATE_FIELDS, rows)
}

pub fn decode_feed_states(data: &str) -> Result<Vec<FeedState>> {
    let table = Table::parse(data, FEED_STATES)?;
    let Some(table) = table else {
        return Ok(Vec::new());
    };
    table.require(&["internalId"])?;

    let feeds = table
        .rows
        .iter()
        .map(|row| {
            let frequency = table
                .field(row, "configFrequency")
                .and_then(|v| v.trim().parse::<f64>().ok())
                .filter(|v| v.is_finite())
                .unwrap_or(DEFAULT_FREQUENCY);

            FeedState {
                internal_id: table.field(row, "internalId").unwrap_or_default().to_string(),
                config: FeedConfig {
                    frequency: clamp_frequency(frequency),
                },
                stats: FeedStats {
                    total: parse_counter(table.field(row, "statTotal")),
                    skips: parse_counter(table.field(row, "statSkips")),
                },
            }
            .normalized()
        })
        .collect();

    Ok(feeds)
}

/// Counters are integers on write but may have been stored as floats.
fn parse_counter(raw: Option<&str>) -> u64 {
    let raw = raw.map(str::trim).unwrap_or("");
    if let Ok(value) = raw.parse::<u64>() {
        return value;
    }
    match raw.parse::<f64>() {
        Ok(value) if value.is_finite() && value >= 0.0 => value as u64,
        _ => 0,
    }
}

fn encode_table(header: &[&str], rows: impl Iterator<Item = Vec<String>>) -> String {
    let mut lines = vec![join_row(header.iter().map(|h| h.to_string()))];
    lines.extend(rows.map(|row| join_row(row.into_iter())));
    lines.join(&CSV_NEWLINE.to_string())
}

fn join_row(fields: impl Iterator<Item = String>) -> String {
    fields
        .map(|field| quote_field(&field))
        .collect::<Vec<_>>()
        .join(&CSV_DELIMITER.to_string())
}

fn quote_field(field: &str) -> String {
    let needs_quotes = field
        .chars()
        .any(|c| c == CSV_DELIMITER || c == '"' || c == '\n' || c == '\r');
    if needs_quotes {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

struct Row {
    line: usize,
    fields: Vec<String>,
}

struct Table {
    columns: HashMap<String, usize>,
    collection: &'static str,
    rows: Vec<Row>,
}

impl Table {
    /// Parse header + rows. `None` when the input holds no header at all.
    fn parse(data: &str, collection: &'static str) -> Result<Option<Self>> {
        let mut records = split_records(data, collection)?.into_iter();
        let Some(header) = records.next() else {
            return Ok(None);
        };

        let columns: HashMap<String, usize> = header
            .fields
            .iter()
            .enumerate()
            .map(|(index, name)| (name.trim().to_string(), index))
            .collect();

        let mut rows = Vec::new();
        for record in records {
            if record.fields.len() != header.fields.len() {
                return Err(AppError::Decode {
                    collection,
                    line: record.line,
                    reason: format!(
                        "expected {} fields, found {}",
                        header.fields.len(),
                        record.fields.len()
                    ),
                });
            }
            rows.push(record);
        }

        Ok(Some(Self {
            columns,
            collection,
            rows,
        }))
    }

    fn require(&self, names: &[&str]) -> Result<()> {
        match names.iter().find(|name| !self.columns.contains_key(**name)) {
            Some(missing) => Err(AppError::Decode {
                collection: self.collection,
                line: 1,
                reason: format!("missing column {:?}", missing),
            }),
            None => Ok(()),
        }
    }

    fn field<'a>(&self, row: &'a Row, name: &str) -> Option<&'a str> {
        self.columns
            .get(name)
            .and_then(|index| row.fields.get(*index))
            .map(String::as_str)
    }
}

/// Split delimited text into records, honouring double-quoted fields.
/// A quote inside an unquoted field is kept as text. Blank lines are dropped.
fn split_records(data: &str, collection: &'static str) -> Result<Vec<Row>> {
    let mut records = Vec::new();
    let mut fields: Vec<String> = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut was_quoted = false;
    let mut line = 1;
    let mut record_line = 1;
    let mut chars = data.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    chars.next();
                    field.push('"');
                }
                '"' => in_quotes = false,
                _ => {
                    if c == CSV_NEWLINE {
                        line += 1;
                    }
                    field.push(c);
                }
            }
            continue;
        }

        match c {
            '"' if field.is_empty() && !was_quoted => {
                in_quotes = true;
                was_quoted = true;
            }
            c if c == CSV_DELIMITER => {
                fields.push(std::mem::take(&mut field));
                was_quoted = false;
            }
            '\r' if chars.peek() == Some(&CSV_NEWLINE) => {}
            c if c == CSV_NEWLINE => {
                fields.push(std::mem::take(&mut field));
                push_record(&mut records, std::mem::take(&mut fields), record_line, was_quoted);
                was_quoted = false;
                line += 1;
                record_line = line;
            }
            _ => {
                if was_quoted {
                    return Err(AppError::Decode {
                        collection,
                        line,
                        reason: "text after closing quote".to_string(),
                    });
                }
                field.push(c);
            }
        }
    }

    if in_quotes {
        return Err(AppError::Decode {
            collection,
            line: record_line,
            reason: "unterminated quoted field".to_string(),
        });
    }

    fields.push(field);
    push_record(&mut records, fields, record_line, was_quoted);
    Ok(records)
}

fn push_record(records: &mut Vec<Row>, fields: Vec<String>, line: usize, was_quoted: bool) {
    let blank = fields.len() == 1 && fields[0].trim().is_empty() && !was_quoted;
    if !blank {
        records.push(Row { line, fields });
    }
}
