//! Physical table naming for versioned pre-aggregation builds
//!
//! Every build of a pre-aggregation is stored under
//! `<table_name>_<content_version>_<structure_version>_<last_updated_at>`.
//! [`VersionEntry::target_table_name`] encodes that triple and
//! [`parse_version_entries`] decodes a schema listing back into entries.

use serde::{Deserialize, Serialize};

pub const DELIMITER: char = '_';

/// Decoded metadata for one physical table build
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionEntry {
    /// Schema-qualified logical name, e.g. `stb_pre_aggregations.orders_rollup`
    pub table_name: String,
    pub content_version: String,
    pub structure_version: String,
    /// Build time in epoch milliseconds
    pub last_updated_at: i64,
}

impl VersionEntry {
    /// Physical name of this build.
    #[must_use]
    pub fn target_table_name(&self) -> String {
        format!(
            "{}{DELIMITER}{}{DELIMITER}{}{DELIMITER}{}",
            self.table_name, self.content_version, self.structure_version, self.last_updated_at
        )
    }

    /// Same build, renamed to another logical table (used for index names).
    #[must_use]
    pub fn with_table_name(&self, table_name: &str) -> Self {
        Self {
            table_name: table_name.to_string(),
            ..self.clone()
        }
    }
}

/// Split a raw (unqualified) physical name into its four segments.
///
/// The last three delimiters are significant; everything before them is the
/// logical name. A logical name may therefore contain `_`, but a version tag
/// may not, and a name whose tags were produced elsewhere with `_` inside
/// them decodes into the wrong segments. Names with an empty segment do not
/// decode.
#[must_use]
pub fn split_target_name(raw: &str) -> Option<(&str, &str, &str, &str)> {
    let mut parts = raw.rsplitn(4, DELIMITER);
    let last_updated_at = parts.next()?;
    let structure_version = parts.next()?;
    let content_version = parts.next()?;
    let table_name = parts.next()?;
    if [table_name, content_version, structure_version, last_updated_at]
        .iter()
        .any(|s| s.is_empty())
    {
        return None;
    }
    Some((table_name, content_version, structure_version, last_updated_at))
}

/// Decode one raw name, qualifying the logical part with `schema`.
#[must_use]
pub fn parse_version_entry(schema: &str, raw: &str) -> Option<VersionEntry> {
    let (table_name, content_version, structure_version, last_updated_at) =
        split_target_name(raw)?;
    let last_updated_at = last_updated_at.parse::<i64>().ok()?;
    Some(VersionEntry {
        table_name: format!("{schema}.{table_name}"),
        content_version: content_version.to_string(),
        structure_version: structure_version.to_string(),
        last_updated_at,
    })
}

/// Decode a schema listing, newest build first.
///
/// Names that do not follow the scheme are skipped. The sort is stable, so
/// builds with equal timestamps keep their listing order.
pub fn parse_version_entries<I, S>(schema: &str, raw_names: I) -> Vec<VersionEntry>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut entries: Vec<VersionEntry> = raw_names
        .into_iter()
        .filter_map(|raw| parse_version_entry(schema, raw.as_ref()))
        .collect();
    entries.sort_by(|a, b| b.last_updated_at.cmp(&a.last_updated_at));
    entries
}
