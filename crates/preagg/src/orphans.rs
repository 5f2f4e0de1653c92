//! Garbage collection of superseded physical tables
//!
//! After a build, every table in the schema is dropped unless it is one of:
//! the build just created, a table marked used by any loader, or the
//! representative build of its logical table. The representative is the
//! first decoded entry for that name; nothing here depends on it being the
//! newest build.

use crate::driver::Driver;
use crate::error::Result;
use crate::orchestrator::PreAggregations;
use crate::table_name::{VersionEntry, parse_version_entries};
use diagnostics::*;
use std::collections::HashSet;

/// First entry per logical table, in decoded order
#[must_use]
pub fn representatives(entries: &[VersionEntry]) -> Vec<&VersionEntry> {
    let mut seen = HashSet::new();
    entries
        .iter()
        .filter(|e| seen.insert(e.table_name.as_str()))
        .collect()
}

/// Schema-qualified names from `raw_tables` that no retention rule covers
#[must_use]
pub fn orphaned_tables(
    schema: &str,
    raw_tables: &[String],
    tables_used: &[String],
    just_created: &str,
) -> Vec<String> {
    let entries = parse_version_entries(schema, raw_tables);
    let mut retain: HashSet<String> = tables_used.iter().cloned().collect();
    retain.extend(representatives(&entries).iter().map(|e| e.target_table_name()));
    _ = retain.insert(just_created.to_string());

    raw_tables
        .iter()
        .map(|raw| format!("{schema}.{raw}"))
        .filter(|table| !retain.contains(table))
        .collect()
}

/// Drop orphans from `schema` on `driver`, returning what was dropped
pub async fn drop_orphaned_tables(
    orchestrator: &PreAggregations,
    driver: &dyn Driver,
    schema: &str,
    just_created: &str,
    request_id: &str,
) -> Result<Vec<String>> {
    orchestrator.add_table_used(just_created).await?;
    let raw_tables = driver.list_tables(schema).await?;
    let tables_used = orchestrator.tables_used().await?;
    let to_drop = orphaned_tables(schema, &raw_tables, &tables_used, just_created);

    info!(
        "Dropping orphaned tables {tables_to_drop} ({request_id})",
        tables_to_drop: serde_json::to_string(&to_drop)?,
        request_id: request_id
    );
    _ = futures::future::try_join_all(to_drop.iter().map(|table| driver.drop_table(table))).await?;
    Ok(to_drop)
}
