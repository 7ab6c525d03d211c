//! Table of contents of a backup: where every DDL statement lives in the
//! metadata file and which tables carry bulk data.

pub mod filter;
pub mod matching;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::Path;

use crate::errors::{RestoreError, Result};
use crate::utils::make_fqn;

pub use filter::FilterSet;
pub use matching::{
    Filters, get_included_partition_roots, remove_active_role,
    substitute_redirect_database_in_statements, substitute_redirect_schema_in_statements,
};

pub mod object_type {
    pub const TABLE: &str = "TABLE";
    pub const VIEW: &str = "VIEW";
    pub const MATERIALIZED_VIEW: &str = "MATERIALIZED VIEW";
    pub const SEQUENCE: &str = "SEQUENCE";
    pub const SEQUENCE_OWNER: &str = "SEQUENCE OWNER";
    pub const STATISTICS: &str = "STATISTICS";
    pub const INDEX: &str = "INDEX";
    pub const SCHEMA: &str = "SCHEMA";
    pub const ROLE: &str = "ROLE";
    pub const DATABASE: &str = "DATABASE";
    pub const DATABASE_GUC: &str = "DATABASE GUC";
    pub const DATABASE_METADATA: &str = "DATABASE METADATA";

    /// Object types matched against the relation filter by their own name.
    pub fn is_relation(object_type: &str) -> bool {
        matches!(
            object_type,
            TABLE | VIEW | MATERIALIZED_VIEW | SEQUENCE | STATISTICS
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Section {
    Global,
    Predata,
    Postdata,
    Statistics,
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Section::Global => "global",
            Section::Predata => "predata",
            Section::Postdata => "postdata",
            Section::Statistics => "statistics",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataEntry {
    #[serde(rename = "schema")]
    pub schema: String,
    #[serde(rename = "name")]
    pub name: String,
    #[serde(rename = "objecttype")]
    pub object_type: String,
    #[serde(rename = "referenceobject", default)]
    pub reference_object: String,
    #[serde(rename = "startbyte")]
    pub start_byte: u64,
    #[serde(rename = "endbyte")]
    pub end_byte: u64,
}

impl MetadataEntry {
    pub fn new(schema: &str, name: &str, object_type: &str, reference_object: &str) -> Self {
        MetadataEntry {
            schema: schema.to_string(),
            name: name.to_string(),
            object_type: object_type.to_string(),
            reference_object: reference_object.to_string(),
            start_byte: 0,
            end_byte: 0,
        }
    }

    pub fn fqn(&self) -> String {
        make_fqn(&self.schema, &self.name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorDataEntry {
    #[serde(rename = "schema")]
    pub schema: String,
    #[serde(rename = "name")]
    pub name: String,
    #[serde(rename = "oid")]
    pub oid: u32,
    #[serde(rename = "attributestring", default)]
    pub attribute_string: String,
    #[serde(rename = "rowscopied", default)]
    pub rows_copied: i64,
    #[serde(rename = "partitionroot", default)]
    pub partition_root: String,
    #[serde(rename = "isreplicated", default)]
    pub is_replicated: bool,
}

impl CoordinatorDataEntry {
    pub fn fqn(&self) -> String {
        make_fqn(&self.schema, &self.name)
    }

    pub fn is_leaf_partition(&self) -> bool {
        !self.partition_root.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AoEntry {
    #[serde(rename = "modcount")]
    pub modcount: i64,
    #[serde(rename = "lastddltimestamp", default)]
    pub last_ddl_timestamp: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncrementalEntries {
    #[serde(rename = "ao", default)]
    pub ao: BTreeMap<String, AoEntry>,
}

/// A fully materialized statement, sliced out of the metadata file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatementWithType {
    pub schema: String,
    pub name: String,
    pub object_type: String,
    pub reference_object: String,
    pub statement: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Toc {
    #[serde(rename = "globalentries", alias = "global", default)]
    pub global_entries: Vec<MetadataEntry>,
    #[serde(rename = "predataentries", alias = "predata", default)]
    pub predata_entries: Vec<MetadataEntry>,
    #[serde(rename = "postdataentries", alias = "postdata", default)]
    pub postdata_entries: Vec<MetadataEntry>,
    #[serde(rename = "statisticsentries", alias = "statistics", default)]
    pub statistics_entries: Vec<MetadataEntry>,
    #[serde(rename = "dataentries", default)]
    pub data_entries: Vec<CoordinatorDataEntry>,
    #[serde(rename = "incrementalmetadata", default)]
    pub incremental_metadata: IncrementalEntries,
}

impl Toc {
    pub fn from_yaml_str(contents: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(contents)?)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            RestoreError::Integrity(format!(
                "Cannot read table of contents file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_yaml_str(&contents)
    }

    pub fn entries(&self, section: Section) -> &[MetadataEntry] {
        match section {
            Section::Global => &self.global_entries,
            Section::Predata => &self.predata_entries,
            Section::Postdata => &self.postdata_entries,
            Section::Statistics => &self.statistics_entries,
        }
    }

    fn entries_mut(&mut self, section: Section) -> &mut Vec<MetadataEntry> {
        match section {
            Section::Global => &mut self.global_entries,
            Section::Predata => &mut self.predata_entries,
            Section::Postdata => &mut self.postdata_entries,
            Section::Statistics => &mut self.statistics_entries,
        }
    }

    pub fn add_metadata_entry(&mut self, section: Section, mut entry: MetadataEntry, start: u64, end: u64) {
        entry.start_byte = start;
        entry.end_byte = end;
        self.entries_mut(section).push(entry);
    }

    pub fn add_coordinator_data_entry(
        &mut self,
        schema: &str,
        name: &str,
        oid: u32,
        attribute_string: &str,
        rows_copied: i64,
        partition_root: &str,
        dist_policy: &str,
    ) {
        self.data_entries.push(CoordinatorDataEntry {
            schema: schema.to_string(),
            name: name.to_string(),
            oid,
            attribute_string: attribute_string.to_string(),
            rows_copied,
            partition_root: partition_root.to_string(),
            is_replicated: dist_policy.contains("REPLICATED"),
        });
    }

    /// Checks the structural invariants the restore relies on: byte ranges
    /// are well formed and increase without overlap within a section, and
    /// every leaf partition names a root present in the same schema.
    pub fn validate(&self) -> Result<()> {
        for section in [Section::Global, Section::Predata, Section::Postdata, Section::Statistics] {
            let mut previous_end = 0u64;
            for entry in self.entries(section) {
                if entry.start_byte > entry.end_byte {
                    return Err(RestoreError::Integrity(format!(
                        "{} entry {} has start byte {} past end byte {}",
                        section,
                        entry.fqn(),
                        entry.start_byte,
                        entry.end_byte
                    )));
                }
                if entry.start_byte < previous_end {
                    return Err(RestoreError::Integrity(format!(
                        "{} entry {} starts at byte {} inside the previous entry ending at {}",
                        section,
                        entry.fqn(),
                        entry.start_byte,
                        previous_end
                    )));
                }
                previous_end = entry.end_byte;
            }
        }

        let tables: HashSet<(&str, &str)> = self
            .data_entries
            .iter()
            .map(|e| (e.schema.as_str(), e.name.as_str()))
            .collect();
        for entry in self.data_entries.iter().filter(|e| e.is_leaf_partition()) {
            if !tables.contains(&(entry.schema.as_str(), entry.partition_root.as_str())) {
                return Err(RestoreError::Integrity(format!(
                    "Leaf partition {} references root partition {} which is not in the backup",
                    entry.fqn(),
                    make_fqn(&entry.schema, &entry.partition_root)
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOC_YAML: &str = r#"
globalentries:
- schema: ""
  name: somedb
  objecttype: DATABASE
  referenceobject: ""
  startbyte: 0
  endbyte: 20
predataentries:
- schema: public
  name: foo
  objecttype: TABLE
  referenceobject: ""
  startbyte: 0
  endbyte: 30
postdataentries: []
statisticsentries: []
dataentries:
- schema: public
  name: foo
  oid: 16384
  attributestring: (i,j)
  rowscopied: 10
  partitionroot: ""
  isreplicated: false
incrementalmetadata:
  ao:
    public.ao_table:
      modcount: 3
      lastddltimestamp: "20240101010101"
"#;

    #[test]
    fn test_parse_toc_yaml() -> anyhow::Result<()> {
        let toc = Toc::from_yaml_str(TOC_YAML)?;
        assert_eq!(toc.global_entries.len(), 1);
        assert_eq!(toc.predata_entries[0].fqn(), "public.foo");
        assert_eq!(toc.data_entries[0].oid, 16384);
        assert_eq!(toc.data_entries[0].attribute_string, "(i,j)");
        assert_eq!(toc.incremental_metadata.ao["public.ao_table"].modcount, 3);
        toc.validate()?;
        Ok(())
    }

    #[test]
    fn test_parse_toc_with_short_section_names() -> anyhow::Result<()> {
        let toc = Toc::from_yaml_str(
            "predata:\n- {schema: s, name: t, objecttype: TABLE, startbyte: 0, endbyte: 4}\n",
        )?;
        assert_eq!(toc.entries(Section::Predata).len(), 1);
        assert!(toc.entries(Section::Postdata).is_empty());
        Ok(())
    }

    #[test]
    fn test_add_coordinator_data_entry_detects_replicated() {
        let mut toc = Toc::default();
        toc.add_coordinator_data_entry("s", "r", 1, "(i)", 0, "", "DISTRIBUTED REPLICATED");
        toc.add_coordinator_data_entry("s", "h", 2, "(i)", 0, "", "DISTRIBUTED BY (i)");
        assert!(toc.data_entries[0].is_replicated);
        assert!(!toc.data_entries[1].is_replicated);
    }

    #[test]
    fn test_validate_rejects_overlapping_ranges() {
        let mut toc = Toc::default();
        toc.add_metadata_entry(Section::Predata, MetadataEntry::new("s", "a", "TABLE", ""), 0, 10);
        toc.add_metadata_entry(Section::Predata, MetadataEntry::new("s", "b", "TABLE", ""), 5, 15);
        assert!(matches!(toc.validate(), Err(RestoreError::Integrity(_))));
    }

    #[test]
    fn test_validate_rejects_inverted_range() {
        let mut toc = Toc::default();
        toc.add_metadata_entry(Section::Postdata, MetadataEntry::new("s", "i", "INDEX", "s.a"), 10, 5);
        assert!(matches!(toc.validate(), Err(RestoreError::Integrity(_))));
    }

    #[test]
    fn test_validate_rejects_orphan_leaf_partition() {
        let mut toc = Toc::default();
        toc.add_coordinator_data_entry("s", "root", 1, "(i)", 0, "", "");
        toc.add_coordinator_data_entry("s", "leaf", 2, "(i)", 0, "root", "");
        assert!(toc.validate().is_ok());
        toc.add_coordinator_data_entry("other", "leaf", 3, "(i)", 0, "root", "");
        assert!(matches!(toc.validate(), Err(RestoreError::Integrity(_))));
    }
}
