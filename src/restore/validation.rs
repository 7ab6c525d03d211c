// clusterrestore/src/restore/validation.rs
use std::collections::HashSet;
use std::path::Path;
use tracing::{error, warn};

use super::db_restore::{
    RestoreConnection, database_exists, get_existing_schemas, get_existing_table_fqns,
    get_relations_in_database, schema_exists,
};
use crate::cluster::FilePathInfo;
use crate::config::{BackupConfig, RestoreConfig};
use crate::errors::{RestoreError, Result};
use crate::toc::{FilterSet, Filters, Toc, object_type};
use crate::utils::{schema_of_fqn, validate_fqns};

/// Members of `wanted` that none of `present` accounts for, in input order.
fn missing_from<I>(wanted: &[String], present: I) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    if wanted.is_empty() {
        return Vec::new();
    }
    let present: HashSet<String> = present.into_iter().collect();
    wanted.iter().filter(|w| !present.contains(*w)).cloned().collect()
}

fn schemas_missing_from_backup(toc: &Toc, backup: &BackupConfig, schemas: &[String]) -> Vec<String> {
    if backup.data_only {
        missing_from(schemas, toc.data_entries.iter().map(|e| e.schema.clone()))
    } else {
        missing_from(schemas, toc.predata_entries.iter().map(|e| e.schema.clone()))
    }
}

fn relations_missing_from_backup(toc: &Toc, backup: &BackupConfig, relations: &[String]) -> Vec<String> {
    let defined = toc
        .predata_entries
        .iter()
        .filter(|e| {
            matches!(
                e.object_type.as_str(),
                object_type::TABLE | object_type::SEQUENCE | object_type::VIEW | object_type::MATERIALIZED_VIEW
            )
        })
        .map(|e| e.fqn());
    missing_from(relations, defined.chain(backup.all_restore_plan_tables()))
}

/// Included schemas and relations must be in the backup; excluded ones that
/// are not only earn a warning.
pub fn validate_filter_lists_in_backup_set(toc: &Toc, backup: &BackupConfig, filters: &Filters) -> Result<()> {
    let missing = schemas_missing_from_backup(toc, backup, &filters.include_schemas);
    if !missing.is_empty() {
        return Err(RestoreError::Filter(format!(
            "Could not find the following schema(s) in the backup set: {}",
            missing.join(", ")
        )));
    }
    let missing = schemas_missing_from_backup(toc, backup, &filters.exclude_schemas);
    if !missing.is_empty() {
        warn!(
            "Could not find the following excluded schema(s) in the backup set: {}",
            missing.join(", ")
        );
    }
    let missing = relations_missing_from_backup(toc, backup, &filters.include_relations);
    if !missing.is_empty() {
        return Err(RestoreError::Filter(format!(
            "Could not find the following relation(s) in the backup set: {}",
            missing.join(", ")
        )));
    }
    let missing = relations_missing_from_backup(toc, backup, &filters.exclude_relations);
    if !missing.is_empty() {
        warn!(
            "Could not find the following excluded relation(s) in the backup set: {}",
            missing.join(", ")
        );
    }
    Ok(())
}

/// Tables the restore will create or load into.
pub fn generate_restore_relation_list(toc: &Toc, filters: &Filters) -> Vec<String> {
    if !filters.include_relations.is_empty() {
        return filters.include_relations.clone();
    }
    let included_schemas = FilterSet::new_include(&filters.include_schemas);
    let excluded_schemas = FilterSet::new_exclude(&filters.exclude_schemas);
    let excluded_relations = FilterSet::new_exclude(&filters.exclude_relations);
    toc.data_entries
        .iter()
        .filter(|e| {
            included_schemas.matches_filter(&e.schema)
                && excluded_schemas.matches_filter(&e.schema)
                && excluded_relations.matches_filter(&e.fqn())
        })
        .map(|e| e.fqn())
        .collect()
}

/// Data-only restores load into tables that must already exist; any other
/// restore creates them and so they must not.
pub async fn validate_relations_in_restore_database(
    conn: &mut dyn RestoreConnection,
    relations: &[String],
    data_only: bool,
) -> Result<()> {
    if relations.is_empty() {
        return Ok(());
    }
    validate_fqns(relations)?;
    let in_db = get_relations_in_database(conn, relations).await?;
    if data_only {
        let existing: HashSet<&String> = in_db.iter().collect();
        if let Some(absent) = relations.iter().find(|r| !existing.contains(r)) {
            return Err(RestoreError::Filter(format!(
                "Relation {} must exist for data-only restore",
                absent
            )));
        }
    } else if let Some(present) = in_db.first() {
        return Err(RestoreError::Filter(format!("Relation {} already exists", present)));
    }
    Ok(())
}

pub async fn validate_redirect_schema(conn: &mut dyn RestoreConnection, unquoted_name: &str) -> Result<()> {
    if !schema_exists(conn, unquoted_name).await? {
        return Err(RestoreError::Filter(format!(
            "Schema {} to redirect into does not exist",
            unquoted_name
        )));
    }
    Ok(())
}

pub async fn validate_database_existence(
    conn: &mut dyn RestoreConnection,
    unquoted_name: &str,
    create_db: bool,
    is_filtered: bool,
) -> Result<()> {
    let exists = database_exists(conn, unquoted_name).await?;
    if !exists {
        if is_filtered {
            return Err(RestoreError::Filter(format!(
                "Database \"{}\" must be created manually to restore table-filtered or data-only backups.",
                unquoted_name
            )));
        }
        if !create_db {
            return Err(RestoreError::Filter(format!(
                "Database \"{name}\" does not exist. Use the --create-db flag to create \"{name}\" as part of the restore process.",
                name = unquoted_name
            )));
        }
    } else if create_db {
        return Err(RestoreError::Filter(format!(
            "Database \"{}\" already exists. Run gprestore again without --create-db flag.",
            unquoted_name
        )));
    }
    Ok(())
}

/// Options that contradict how the backup was taken.
pub fn validate_backup_flag_combinations(backup: &BackupConfig, config: &RestoreConfig) -> Result<()> {
    if (backup.include_table_filtered || backup.data_only) && config.with_globals {
        return Err(RestoreError::Config(
            "Global metadata is not backed up in table-filtered or data-only backups.".into(),
        ));
    }
    if backup.metadata_only && config.data_only {
        return Err(RestoreError::Config(
            "Cannot use data-only flag when restoring metadata-only backup".into(),
        ));
    }
    if backup.data_only && config.metadata_only {
        return Err(RestoreError::Config(
            "Cannot use metadata-only flag when restoring data-only backup".into(),
        ));
    }
    if !backup.plugin.is_empty() && config.plugin_config.is_none() {
        return Err(RestoreError::Config(format!(
            "Backup was taken with plugin {}. The plugin_config option must be used to restore.",
            backup.plugin
        )));
    }
    if backup.plugin.is_empty() && config.plugin_config.is_some() {
        return Err(RestoreError::Config(
            "The plugin_config option cannot be used to restore a backup taken without a plugin.".into(),
        ));
    }
    if backup.single_data_file && config.jobs > 1 {
        return Err(RestoreError::Config(
            "Cannot use jobs flag when restoring backups with a single data file per segment.".into(),
        ));
    }
    if backup.incremental && backup.restore_plan.is_empty() {
        return Err(RestoreError::Integrity(format!(
            "Incremental backup {} has an empty restore plan",
            backup.timestamp
        )));
    }
    Ok(())
}

/// The coordinator files a restore cannot start without.
pub fn verify_metadata_file_paths(fp: &FilePathInfo, with_stats: bool) -> Result<()> {
    let mut files = vec![
        ("config", fp.get_config_file_path()),
        ("table of contents", fp.get_toc_file_path()),
        ("metadata", fp.get_metadata_file_path()),
    ];
    if with_stats {
        files.push(("statistics", fp.get_statistics_file_path()));
    }
    let mut missing = false;
    for (kind, path) in &files {
        if !Path::new(path).is_file() {
            error!("Cannot access {} file {}", kind, path);
            if *kind == "statistics" {
                error!("Note that the backup must be taken with statistics to generate a statistics file.");
            }
            missing = true;
        }
    }
    if missing {
        return Err(RestoreError::Config(
            "One or more metadata files do not exist or are not readable.".into(),
        ));
    }
    Ok(())
}

fn excluded_by_user(include: &[String], exclude: &[String], name: &str) -> bool {
    (!include.is_empty() && !include.iter().any(|i| i == name)) || exclude.iter().any(|e| e == name)
}

/// Before an incremental restore, every table the last backup carries data
/// for (and its schema) must already be in the target database.
pub async fn verify_incremental_state(
    conn: &mut dyn RestoreConnection,
    backup: &BackupConfig,
    filters: &Filters,
    on_error_continue: bool,
) -> Result<()> {
    let Some(last) = backup.restore_plan.last() else {
        return Err(RestoreError::Integrity("Restore plan is empty".into()));
    };
    let existing_schemas: HashSet<String> = get_existing_schemas(conn).await?.into_iter().collect();
    let existing_tables: HashSet<String> = get_existing_table_fqns(conn).await?.into_iter().collect();

    let mut schemas_to_create: Vec<String> = Vec::new();
    let mut tables_to_create: Vec<String> = Vec::new();
    for table in &last.table_fqns {
        let schema = schema_of_fqn(table);
        if excluded_by_user(&filters.include_schemas, &filters.exclude_schemas, schema) {
            continue;
        }
        if existing_tables.contains(table) {
            continue;
        }
        if excluded_by_user(&filters.include_relations, &filters.exclude_relations, table) {
            continue;
        }
        if !existing_schemas.contains(schema) && !schemas_to_create.iter().any(|s| s == schema) {
            schemas_to_create.push(schema.to_string());
        }
        tables_to_create.push(table.clone());
    }

    if on_error_continue {
        return Ok(());
    }
    let missing: Vec<String> = schemas_to_create.into_iter().chain(tables_to_create).collect();
    if !missing.is_empty() {
        return Err(RestoreError::Filter(format!(
            "Following objects are missing from the target database: [{}]",
            missing.join(" ")
        )));
    }
    Ok(())
}
