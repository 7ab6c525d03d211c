use std::collections::BTreeMap;
use std::path::Path;

use super::SegConfig;

pub const COORDINATOR_CONTENT: i32 = -1;

/// Names of every file a backup or restore reads or writes on the cluster.
///
/// With no user backup directory the files live under each segment's data
/// directory; otherwise under `<backup_dir>/<seg_prefix><content>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePathInfo {
    pub pid: u32,
    pub timestamp: String,
    pub user_specified_backup_dir: String,
    pub user_specified_seg_prefix: String,
    pub seg_dir_map: BTreeMap<i32, String>,
    pub data_dir_map: BTreeMap<i32, String>,
}

impl FilePathInfo {
    pub fn new(segments: &[SegConfig], user_dir: &str, timestamp: &str, seg_prefix: &str, pid: u32) -> Self {
        let mut seg_dir_map = BTreeMap::new();
        let mut data_dir_map = BTreeMap::new();
        let user_dir = user_dir.trim_end_matches('/');
        for segment in segments {
            data_dir_map.insert(segment.content_id, segment.data_dir.clone());
            if user_dir.is_empty() {
                seg_dir_map.insert(segment.content_id, segment.data_dir.clone());
            } else {
                seg_dir_map.insert(
                    segment.content_id,
                    format!("{}/{}{}", user_dir, seg_prefix, segment.content_id),
                );
            }
        }
        FilePathInfo {
            pid,
            timestamp: timestamp.to_string(),
            user_specified_backup_dir: user_dir.to_string(),
            user_specified_seg_prefix: seg_prefix.to_string(),
            seg_dir_map,
            data_dir_map,
        }
    }

    fn date(&self) -> &str {
        self.timestamp.get(0..8).unwrap_or(&self.timestamp)
    }

    fn backup_subdir(&self) -> String {
        format!("backups/{}/{}", self.date(), self.timestamp)
    }

    fn base_dir(&self, content: i32) -> &str {
        self.seg_dir_map.get(&content).map(String::as_str).unwrap_or_default()
    }

    fn data_dir(&self, content: i32) -> &str {
        self.data_dir_map.get(&content).map(String::as_str).unwrap_or_default()
    }

    pub fn get_dir_for_content(&self, content: i32) -> String {
        format!("{}/{}", self.base_dir(content), self.backup_subdir())
    }

    pub fn get_table_backup_file_path(&self, content: i32, oid: u32, extension: &str, single_data_file: bool) -> String {
        let mut path = format!(
            "{}/gpbackup_{}_{}",
            self.get_dir_for_content(content),
            content,
            self.timestamp
        );
        if !single_data_file {
            path.push_str(&format!("_{}", oid));
        }
        path + extension
    }

    /// Path template expanded on every segment by `COPY ... ON SEGMENT`.
    pub fn get_table_backup_file_path_for_copy_command(
        &self,
        oid: u32,
        extension: &str,
        single_data_file: bool,
    ) -> String {
        let base = if self.user_specified_backup_dir.is_empty() {
            "<SEG_DATA_DIR>".to_string()
        } else {
            format!("{}/{}<SEGID>", self.user_specified_backup_dir, self.user_specified_seg_prefix)
        };
        let mut path = format!("{}/{}/gpbackup_<SEGID>_{}", base, self.backup_subdir(), self.timestamp);
        if !single_data_file {
            path.push_str(&format!("_{}", oid));
        }
        path + extension
    }

    fn coordinator_file(&self, suffix: &str) -> String {
        format!(
            "{}/gpbackup_{}_{}",
            self.get_dir_for_content(COORDINATOR_CONTENT),
            self.timestamp,
            suffix
        )
    }

    pub fn get_config_file_path(&self) -> String {
        self.coordinator_file("config.yaml")
    }

    pub fn get_metadata_file_path(&self) -> String {
        self.coordinator_file("metadata.sql")
    }

    pub fn get_statistics_file_path(&self) -> String {
        self.coordinator_file("statistics.sql")
    }

    pub fn get_toc_file_path(&self) -> String {
        self.coordinator_file("toc.yaml")
    }

    pub fn get_restore_report_file_path(&self, restore_timestamp: &str) -> String {
        format!(
            "{}/gprestore_{}_{}_report",
            self.get_dir_for_content(COORDINATOR_CONTENT),
            self.timestamp,
            restore_timestamp
        )
    }

    pub fn get_segment_toc_file_path(&self, content: i32) -> String {
        format!(
            "{}/gpbackup_{}_{}_toc.yaml",
            self.get_dir_for_content(content),
            content,
            self.timestamp
        )
    }

    pub fn get_segment_pipe_file_path(&self, content: i32) -> String {
        format!("{}/gpbackup_{}_{}_pipe", self.data_dir(content), content, self.timestamp)
    }

    pub fn get_segment_pipe_path_for_copy_command(&self) -> String {
        format!("<SEG_DATA_DIR>/gpbackup_<SEGID>_{}_pipe", self.timestamp)
    }

    /// Oid list and launch script for the helper agent; the pid keeps
    /// concurrent restores of the same backup apart.
    pub fn get_segment_helper_file_path(&self, content: i32, suffix: &str) -> String {
        format!(
            "{}/gpbackup_{}_{}_{}_{}",
            self.data_dir(content),
            content,
            self.timestamp,
            suffix,
            self.pid
        )
    }

    pub fn get_helper_log_path(&self, home_dir: &Path) -> String {
        format!("{}/gpAdminLogs/gpbackup_helper_{}.log", home_dir.display(), self.date())
    }
}

/// Whether `timestamp` has the `YYYYMMDDHHMMSS` shape.
pub fn is_valid_timestamp(timestamp: &str) -> bool {
    timestamp.len() == 14 && timestamp.bytes().all(|b| b.is_ascii_digit())
}
