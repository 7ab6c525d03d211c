// clusterrestore/src/toc/matching.rs
use regex::{Captures, Regex};
use std::collections::HashMap;

use super::{CoordinatorDataEntry, MetadataEntry, Section, StatementWithType, Toc, object_type};
use crate::errors::{RestoreError, Result};
use crate::toc::FilterSet;
use crate::utils::make_fqn;

/// The user's schema and relation filters. Include lists win over exclude
/// lists on the same axis whenever they are non-empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filters {
    pub include_schemas: Vec<String>,
    pub exclude_schemas: Vec<String>,
    pub include_relations: Vec<String>,
    pub exclude_relations: Vec<String>,
}

impl Filters {
    pub fn schema_set(&self) -> FilterSet {
        FilterSet::from_lists(&self.include_schemas, &self.exclude_schemas)
    }

    pub fn relation_set(&self) -> FilterSet {
        FilterSet::from_lists(&self.include_relations, &self.exclude_relations)
    }
}

fn should_include_statement(
    entry: &MetadataEntry,
    object_set: &FilterSet,
    schema_set: &FilterSet,
    relation_set: &FilterSet,
) -> bool {
    if !object_set.matches_filter(&entry.object_type) || !schema_set.matches_filter(&entry.schema) {
        return false;
    }
    let relation_fqn = entry.fqn();
    let is_relation = object_type::is_relation(&entry.object_type);
    let has_reference = !entry.reference_object.is_empty();

    // Leaf partitions point at their root; an excluded root drags its leaves
    // out with it.
    let include_leaf_partition =
        !(relation_set.is_exclude() && has_reference && !relation_set.matches_filter(&entry.reference_object));

    let unreferenced_non_relation = relation_set.is_exclude() && !is_relation && !has_reference;
    let matching_relation =
        is_relation && relation_set.matches_filter(&relation_fqn) && include_leaf_partition;
    let matching_reference = entry.object_type != object_type::SEQUENCE_OWNER
        && has_reference
        && relation_set.matches_filter(&entry.reference_object);
    let matching_sequence_owner = entry.object_type == object_type::SEQUENCE_OWNER
        && relation_set.matches_filter(&relation_fqn)
        && relation_set.matches_filter(&entry.reference_object);

    unreferenced_non_relation || matching_relation || matching_reference || matching_sequence_owner
}

fn slice_statement(section: Section, entry: &MetadataEntry, metadata: &[u8]) -> Result<String> {
    let (start, end) = (entry.start_byte as usize, entry.end_byte as usize);
    if start > end || end > metadata.len() {
        return Err(RestoreError::Integrity(format!(
            "{} entry {} addresses bytes {}..{} but the metadata file is only {} bytes long",
            section,
            entry.fqn(),
            start,
            end,
            metadata.len()
        )));
    }
    String::from_utf8(metadata[start..end].to_vec()).map_err(|e| {
        RestoreError::Integrity(format!(
            "{} entry {} is not valid UTF-8: {}",
            section,
            entry.fqn(),
            e
        ))
    })
}

/// Leaves whose root appears in `table_fqns`.
fn get_leaf_partitions(table_fqns: &[String], data_entries: &[CoordinatorDataEntry]) -> Vec<String> {
    let tables = FilterSet::membership(table_fqns);
    data_entries
        .iter()
        .filter(|e| e.is_leaf_partition())
        .filter(|e| tables.matches_filter(&make_fqn(&e.schema, &e.partition_root)))
        .map(|e| e.fqn())
        .collect()
}

impl Toc {
    /// Materializes the statements of `section` that pass the object type,
    /// schema and relation filters, in the order they were written.
    pub fn get_statements_for_object_types<S: AsRef<str>>(
        &self,
        section: Section,
        metadata: &[u8],
        include_object_types: &[S],
        exclude_object_types: &[S],
        filters: &Filters,
    ) -> Result<Vec<StatementWithType>> {
        let object_set = FilterSet::from_lists(include_object_types, exclude_object_types);
        let schema_set = filters.schema_set();
        let relation_set = filters.relation_set();

        let mut statements = Vec::new();
        for entry in self.entries(section) {
            if !should_include_statement(entry, &object_set, &schema_set, &relation_set) {
                continue;
            }
            statements.push(StatementWithType {
                schema: entry.schema.clone(),
                name: entry.name.clone(),
                object_type: entry.object_type.clone(),
                reference_object: entry.reference_object.clone(),
                statement: slice_statement(section, entry, metadata)?,
            });
        }
        Ok(statements)
    }

    /// Data entries passing the schema and table filters that also have data
    /// in `restore_plan_tables`. Leaves of a listed root are added to the
    /// list they were named through.
    pub fn get_data_entries_matching(
        &self,
        include_schemas: &[String],
        exclude_schemas: &[String],
        include_tables: &[String],
        exclude_tables: &[String],
        restore_plan_tables: &[String],
    ) -> Vec<CoordinatorDataEntry> {
        let schema_set = FilterSet::from_lists(include_schemas, exclude_schemas);

        let table_set = if !include_tables.is_empty() {
            let mut tables = include_tables.to_vec();
            tables.extend(get_leaf_partitions(include_tables, &self.data_entries));
            FilterSet::new_include(&tables)
        } else if !exclude_tables.is_empty() {
            let mut tables = exclude_tables.to_vec();
            tables.extend(get_leaf_partitions(exclude_tables, &self.data_entries));
            FilterSet::new_exclude(&tables)
        } else {
            FilterSet::new_include::<String>(&[])
        };

        let restore_plan_set = FilterSet::membership(restore_plan_tables);

        self.data_entries
            .iter()
            .filter(|entry| {
                let fqn = entry.fqn();
                restore_plan_set.matches_filter(&fqn)
                    && schema_set.matches_filter(&entry.schema)
                    && table_set.matches_filter(&fqn)
            })
            .cloned()
            .collect()
    }
}

/// Roots of any leaf partitions named in `include_relations`, so the
/// partition hierarchy exists before the leaf is restored.
pub fn get_included_partition_roots(
    data_entries: &[CoordinatorDataEntry],
    include_relations: &[String],
) -> Vec<String> {
    if include_relations.is_empty() {
        return Vec::new();
    }
    let leaf_to_root: HashMap<String, String> = data_entries
        .iter()
        .filter(|e| e.is_leaf_partition())
        .map(|e| (e.fqn(), make_fqn(&e.schema, &e.partition_root)))
        .collect();

    include_relations
        .iter()
        .filter_map(|relation| leaf_to_root.get(relation).cloned())
        .collect()
}

/// Rewrites the database name in database-level statements for a restore
/// into a differently named database.
pub fn substitute_redirect_database_in_statements(
    mut statements: Vec<StatementWithType>,
    old_quoted_name: &str,
    new_quoted_name: &str,
) -> Result<Vec<StatementWithType>> {
    let pattern = Regex::new(&format!(
        "DATABASE {}(;| OWNER| SET| TO| FROM| IS| TEMPLATE)",
        regex::escape(old_quoted_name)
    ))?;
    for statement in statements.iter_mut() {
        if matches!(
            statement.object_type.as_str(),
            object_type::DATABASE | object_type::DATABASE_GUC | object_type::DATABASE_METADATA
        ) {
            statement.statement = pattern
                .replace_all(&statement.statement, |caps: &Captures| {
                    format!("DATABASE {}{}", new_quoted_name, &caps[1])
                })
                .into_owned();
        }
    }
    Ok(statements)
}

/// Moves statements into `new_schema`. Only the first qualified name is
/// rewritten, plus the leaf of an ATTACH PARTITION and the reference object.
pub fn substitute_redirect_schema_in_statements(
    mut statements: Vec<StatementWithType>,
    new_schema: &str,
) -> Vec<StatementWithType> {
    let new_prefix = format!("{}.", new_schema);
    for statement in statements.iter_mut() {
        let old_prefix = format!("{}.", statement.schema);
        statement.statement = statement.statement.replacen(&old_prefix, &new_prefix, 1);
        if statement.object_type == object_type::TABLE && !statement.reference_object.is_empty() {
            if let Some((table, leaf)) = statement.statement.split_once(" ATTACH PARTITION ") {
                statement.statement = format!(
                    "{} ATTACH PARTITION {}",
                    table,
                    leaf.replacen(&old_prefix, &new_prefix, 1)
                );
            }
        }
        if !statement.reference_object.is_empty() {
            statement.reference_object = statement.reference_object.replacen(&old_prefix, &new_prefix, 1);
        }
        statement.schema = new_schema.to_string();
    }
    statements
}

/// Drops the CREATE ROLE of the connected user, which always exists already.
pub fn remove_active_role(active_user: &str, statements: Vec<StatementWithType>) -> Vec<StatementWithType> {
    statements
        .into_iter()
        .filter(|s| !(s.object_type == object_type::ROLE && s.name == active_user))
        .collect()
}
