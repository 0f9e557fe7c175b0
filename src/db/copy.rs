//! Bulk loading through `COPY ... FROM STDIN`.
//!
//! Rows are read from the caller's iterator and encoded in PostgreSQL's text COPY format as they
//! are sent, so memory use stays bounded by one chunk whatever the size of the input.

use crate::error::{DbError, DbResult};
use sqlx::postgres::{PgConnection, PgCopyIn};
use std::ops::DerefMut;
use tracing::{debug, warn};

/// Size of each CopyData message sent to the server.
const COPY_CHUNK_SIZE: usize = 64 * 1024;

/// A possibly schema-qualified table name, e.g. `["audit", "events"]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identifier(Vec<String>);

impl Identifier {
    pub fn new<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(parts.into_iter().map(Into::into).collect())
    }

    pub fn parts(&self) -> &[String] {
        &self.0
    }

    /// Quote every part for safe interpolation into SQL.
    pub fn sanitize(&self) -> String {
        self.0
            .iter()
            .map(|part| quote_ident(part))
            .collect::<Vec<_>>()
            .join(".")
    }
}

impl From<&str> for Identifier {
    fn from(name: &str) -> Self {
        Self(vec![name.to_string()])
    }
}

impl<const N: usize> From<[&str; N]> for Identifier {
    fn from(parts: [&str; N]) -> Self {
        Self::new(parts)
    }
}

/// Double-quote an identifier, doubling embedded quotes and dropping NUL bytes.
pub fn quote_ident(name: &str) -> String {
    let mut quoted = String::with_capacity(name.len() + 2);
    quoted.push('"');
    for ch in name.chars() {
        match ch {
            '"' => quoted.push_str("\"\""),
            '\0' => {}
            _ => quoted.push(ch),
        }
    }
    quoted.push('"');
    quoted
}

/// Build the `COPY` statement for a table and column list.
pub(crate) fn copy_statement(table: &Identifier, columns: &[&str]) -> DbResult<String> {
    if table.parts().is_empty() || table.parts().iter().any(|part| part.is_empty()) {
        return Err(DbError::invalid_input("COPY target table name cannot be empty"));
    }
    if columns.is_empty() {
        return Err(DbError::invalid_input("COPY requires at least one column"));
    }

    let columns = columns
        .iter()
        .map(|column| quote_ident(column))
        .collect::<Vec<_>>()
        .join(", ");

    Ok(format!(
        "COPY {} ({}) FROM STDIN",
        table.sanitize(),
        columns
    ))
}

/// Append one row in text COPY format. `None` is SQL NULL; values use PostgreSQL text input syntax.
pub(crate) fn encode_row<R, S>(out: &mut Vec<u8>, index: usize, width: usize, row: R) -> DbResult<()>
where
    R: IntoIterator<Item = Option<S>>,
    S: AsRef<str>,
{
    let start = out.len();
    let mut fields = 0usize;
    for value in row {
        if fields > 0 {
            out.push(b'\t');
        }
        match value {
            Some(text) => escape_into(out, text.as_ref()),
            None => out.extend_from_slice(b"\\N"),
        }
        fields += 1;
    }
    if fields != width {
        out.truncate(start);
        return Err(DbError::invalid_input(format!(
            "row {} has {} values, expected {}",
            index, fields, width
        )));
    }
    out.push(b'\n');
    Ok(())
}

fn escape_into(out: &mut Vec<u8>, text: &str) {
    for byte in text.bytes() {
        match byte {
            b'\\' => out.extend_from_slice(b"\\\\"),
            b'\t' => out.extend_from_slice(b"\\t"),
            b'\n' => out.extend_from_slice(b"\\n"),
            b'\r' => out.extend_from_slice(b"\\r"),
            _ => out.push(byte),
        }
    }
}

/// Stream `rows` through `COPY` on `conn`. Returns the row count reported by the server.
///
/// The statement is sent before any row is read, so a bad target fails without touching `rows`.
/// Rows are then encoded into a buffer that is flushed every [`COPY_CHUNK_SIZE`] bytes. A row of the
/// wrong width aborts the COPY, leaving the table unchanged.
pub(crate) async fn copy_rows<R, S>(
    conn: &mut PgConnection,
    table: &Identifier,
    columns: &[&str],
    rows: impl IntoIterator<Item = R>,
) -> DbResult<u64>
where
    R: IntoIterator<Item = Option<S>>,
    S: AsRef<str>,
{
    let statement = copy_statement(table, columns)?;
    let width = columns.len();

    debug!(table = %table.sanitize(), columns = width, "Starting COPY");

    let mut copy = conn.copy_in_raw(&statement).await?;
    let mut buf = Vec::with_capacity(COPY_CHUNK_SIZE);

    for (index, row) in rows.into_iter().enumerate() {
        if let Err(err) = encode_row(&mut buf, index, width, row) {
            abort(copy, &err).await;
            return Err(err);
        }
        if buf.len() >= COPY_CHUNK_SIZE {
            if let Err(err) = flush(&mut copy, &mut buf).await {
                abort(copy, &err).await;
                return Err(err);
            }
        }
    }

    if !buf.is_empty() {
        if let Err(err) = flush(&mut copy, &mut buf).await {
            abort(copy, &err).await;
            return Err(err);
        }
    }

    let copied = copy.finish().await?;
    debug!(table = %table.sanitize(), rows = copied, "COPY finished");
    Ok(copied)
}

async fn flush<C>(copy: &mut PgCopyIn<C>, buf: &mut Vec<u8>) -> DbResult<()>
where
    C: DerefMut<Target = PgConnection>,
{
    copy.send(buf.as_slice()).await?;
    buf.clear();
    Ok(())
}

async fn abort<C>(copy: PgCopyIn<C>, reason: &DbError)
where
    C: DerefMut<Target = PgConnection>,
{
    if let Err(err) = copy.abort(reason.to_string()).await {
        warn!(error = %err, reason = %reason, "Failed to abort COPY");
    }
}
