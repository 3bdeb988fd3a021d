use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use rusqlite::types::{Value, ValueRef};
use rusqlite::{Connection, OpenFlags, params_from_iter};
use serde::Serialize;
use tracing::debug;

use crate::config::BotConfig;
use crate::mediawiki::{CategoryApi, full_title};

/// One page to process, as the replica reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DraftRow {
    pub page_id: i64,
    pub namespace: i32,
    /// Title without namespace prefix, in database form (underscores).
    pub title: String,
}

impl DraftRow {
    pub fn full_title(&self) -> Result<String> {
        full_title(self.namespace, &self.title)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchQuery {
    /// Category name in database form, without the `Category:` prefix.
    pub category: String,
    pub namespaces: Vec<i32>,
}

impl BatchQuery {
    pub fn from_config(config: &BotConfig) -> Self {
        Self {
            category: config.category(),
            namespaces: config.namespaces(),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.category.trim().is_empty() {
            bail!("batch query requires a category");
        }
        if self.namespaces.is_empty() {
            bail!("batch query requires at least one namespace");
        }
        Ok(())
    }
}

pub trait BatchSource {
    fn fetch_batch(&mut self, query: &BatchQuery) -> Result<Vec<DraftRow>>;
    fn describe(&self) -> String;
}

/// Reads the `page` / `categorylinks` tables of a replica snapshot.
#[derive(Debug, Clone)]
pub struct ReplicaBatchSource {
    db_path: PathBuf,
}

impl ReplicaBatchSource {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
        }
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn open(&self) -> Result<Connection> {
        if !self.db_path.exists() {
            bail!("replica database not found: {}", self.db_path.display());
        }
        let connection = Connection::open_with_flags(
            &self.db_path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("failed to open replica {}", self.db_path.display()))?;
        connection
            .busy_timeout(Duration::from_secs(5))
            .context("failed to set sqlite busy timeout")?;
        for table in ["page", "categorylinks"] {
            if !table_exists(&connection, table)? {
                bail!(
                    "replica {} has no `{table}` table",
                    self.db_path.display()
                );
            }
        }
        Ok(connection)
    }
}

impl BatchSource for ReplicaBatchSource {
    fn fetch_batch(&mut self, query: &BatchQuery) -> Result<Vec<DraftRow>> {
        query.validate()?;
        let connection = self.open()?;

        let placeholders = (0..query.namespaces.len())
            .map(|index| format!("?{}", index + 2))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT page.page_id, page.page_namespace, page.page_title
             FROM categorylinks
             JOIN page ON page.page_id = categorylinks.cl_from
             WHERE CAST(categorylinks.cl_to AS TEXT) = ?1
               AND page.page_namespace IN ({placeholders})
               AND page.page_is_redirect = 0
             ORDER BY page.page_id"
        );

        let mut values = Vec::with_capacity(query.namespaces.len() + 1);
        values.push(Value::Text(query.category.clone()));
        values.extend(
            query
                .namespaces
                .iter()
                .map(|namespace| Value::Integer(i64::from(*namespace))),
        );

        let mut statement = connection
            .prepare(&sql)
            .context("failed to prepare replica batch query")?;
        let rows = statement
            .query_map(params_from_iter(values.iter()), |row| {
                let title = match row.get_ref(2)? {
                    ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
                        String::from_utf8_lossy(bytes).into_owned()
                    }
                    _ => String::new(),
                };
                Ok(DraftRow {
                    page_id: row.get(0)?,
                    namespace: row.get(1)?,
                    title,
                })
            })
            .context("failed to run replica batch query")?;

        let mut output = Vec::new();
        for row in rows {
            output.push(row.context("failed to decode replica row")?);
        }
        debug!(rows = output.len(), category = %query.category, "replica batch loaded");
        Ok(output)
    }

    fn describe(&self) -> String {
        format!("replica:{}", self.db_path.to_string_lossy().replace('\\', "/"))
    }
}

/// Lists the category through the live API instead of a replica.
pub struct ApiBatchSource<'a, A: CategoryApi> {
    api: &'a mut A,
}

impl<'a, A: CategoryApi> ApiBatchSource<'a, A> {
    pub fn new(api: &'a mut A) -> Self {
        Self { api }
    }
}

impl<A: CategoryApi> BatchSource for ApiBatchSource<'_, A> {
    fn fetch_batch(&mut self, query: &BatchQuery) -> Result<Vec<DraftRow>> {
        query.validate()?;
        let members = self
            .api
            .category_members(&query.category, &query.namespaces)
            .with_context(|| format!("failed to list Category:{}", query.category))?;

        let mut rows = Vec::with_capacity(members.len());
        for member in members {
            if !query.namespaces.contains(&member.namespace) {
                continue;
            }
            let title = strip_namespace_prefix(&member.title).replace(' ', "_");
            rows.push(DraftRow {
                page_id: member.page_id,
                namespace: member.namespace,
                title,
            });
        }
        rows.sort_by_key(|row| row.page_id);
        rows.dedup_by_key(|row| row.page_id);
        Ok(rows)
    }

    fn describe(&self) -> String {
        "api:categorymembers".to_string()
    }
}

fn strip_namespace_prefix(title: &str) -> &str {
    title
        .split_once(':')
        .map(|(_, rest)| rest)
        .unwrap_or(title)
}

fn table_exists(connection: &Connection, table_name: &str) -> Result<bool> {
    let exists: i64 = connection
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type IN ('table', 'view') AND name = ?1)",
            [table_name],
            |row| row.get(0),
        )
        .with_context(|| format!("failed to inspect sqlite_master for table {table_name}"))?;
    Ok(exists == 1)
}
