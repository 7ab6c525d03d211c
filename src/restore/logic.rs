// clusterrestore/src/restore/logic.rs
//! One restore run, from reading the backup set to the last phase, plus the
//! teardown registered with the lifecycle.

use async_trait::async_trait;
use chrono::Local;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use super::data::{DataJob, DataSource, restore_data_entries, session_gucs, set_session_gucs};
use super::db_restore::{
    Connector, RestoreConnection, close_connections, get_segment_configuration, open_connections,
    terminate_hanging_copy_sessions,
};
use super::parallel::{ExecOptions, batch_postdata_statements, execute_statements, restore_schemas};
use super::plugin::PluginConfig;
use super::remote::SegmentCoordinator;
use super::report::{RestoreReport, TIMESTAMP_FORMAT};
use super::validation::{
    generate_restore_relation_list, validate_backup_flag_combinations, validate_database_existence,
    validate_filter_lists_in_backup_set, validate_redirect_schema, validate_relations_in_restore_database,
    verify_incremental_state, verify_metadata_file_paths,
};
use crate::cluster::{Cluster, FilePathInfo, RemoteExecutor};
use crate::config::{BackupConfig, RestoreConfig, RestorePlanEntry};
use crate::errors::{RestoreError, Result};
use crate::lifecycle::{Cleanup, Lifecycle, TerminationCause};
use crate::toc::{
    CoordinatorDataEntry, FilterSet, Filters, Section, StatementWithType, Toc, get_included_partition_roots,
    object_type, remove_active_role, substitute_redirect_database_in_statements,
    substitute_redirect_schema_in_statements,
};
use crate::utils::{quote_ident, schema_of_fqn, unquote_ident};

/// Database every run first connects to, before the target may exist.
const ADMIN_DATABASE: &str = "postgres";

const GLOBAL_OBJECT_TYPES: &[&str] = &[
    "SESSION GUCS",
    object_type::DATABASE_GUC,
    object_type::DATABASE_METADATA,
    "RESOURCE QUEUE",
    "RESOURCE GROUP",
    object_type::ROLE,
    "ROLE GUCS",
    "ROLE GRANT",
    "TABLESPACE",
];
const CREATE_DATABASE_OBJECT_TYPES: &[&str] = &[
    "SESSION GUCS",
    object_type::DATABASE_GUC,
    object_type::DATABASE,
    object_type::DATABASE_METADATA,
];
const SCHEMA_ONLY: &[&str] = &[object_type::SCHEMA];
const SEQUENCE_ONLY: &[&str] = &[object_type::SEQUENCE];
const NO_TYPES: &[&str] = &[];

fn every_statement() -> FilterSet {
    FilterSet::new_include(NO_TYPES)
}

fn first(conns: &mut [Box<dyn RestoreConnection>]) -> Result<&mut Box<dyn RestoreConnection>> {
    conns
        .first_mut()
        .ok_or_else(|| RestoreError::Execution("No database connection available".into()))
}

/// Tags every session of a run, so hanging COPYs can be found again.
pub fn application_name(backup_timestamp: &str, restore_start: &str) -> String {
    format!("gprestore_{}_{}", backup_timestamp, restore_start)
}

pub fn restore_start_timestamp() -> String {
    Local::now().format(TIMESTAMP_FORMAT).to_string()
}

/// The same tables, named inside `schema`.
fn redirect_relations(relations: &[String], schema: &str) -> Vec<String> {
    relations
        .iter()
        .map(|r| {
            let table = r.get(schema_of_fqn(r).len() + 1..).unwrap_or_default();
            format!("{}.{}", schema, table)
        })
        .collect()
}

fn helper_log_path(fp: &FilePathInfo) -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| "~".to_string());
    fp.get_helper_log_path(Path::new(&home))
}

/// Cluster resources a run has acquired and teardown must release.
#[derive(Default)]
struct Resources {
    database: Option<String>,
    plugin: Option<(PluginConfig, FilePathInfo)>,
    agent_fps: Vec<FilePathInfo>,
}

pub(crate) struct Teardown {
    cluster: Arc<Cluster>,
    connector: Arc<dyn Connector>,
    gphome: String,
    application_name: String,
    resources: Mutex<Resources>,
}

impl Teardown {
    fn new(cluster: Arc<Cluster>, connector: Arc<dyn Connector>, gphome: &str, application_name: &str) -> Self {
        Teardown {
            cluster,
            connector,
            gphome: gphome.to_string(),
            application_name: application_name.to_string(),
            resources: Mutex::new(Resources::default()),
        }
    }

    fn with_resources(&self, update: impl FnOnce(&mut Resources)) {
        if let Ok(mut resources) = self.resources.lock() {
            update(&mut resources);
        }
    }

    fn set_database(&self, database: &str) {
        self.with_resources(|r| r.database = Some(unquote_ident(database)));
    }

    fn set_plugin(&self, plugin: &PluginConfig, fp: &FilePathInfo) {
        self.with_resources(|r| r.plugin = Some((plugin.clone(), fp.clone())));
    }

    fn track_agents(&self, fp: &FilePathInfo) {
        self.with_resources(|r| {
            if !r.agent_fps.contains(fp) {
                r.agent_fps.push(fp.clone());
            }
        });
    }

    async fn terminate_hanging_copies(&self, database: &str, agent_fps: &[FilePathInfo]) {
        match self.connector.connect(database, 0).await {
            Ok(mut conn) => {
                for fp in agent_fps {
                    terminate_hanging_copy_sessions(
                        conn.as_mut(),
                        &self.application_name,
                        &fp.get_segment_pipe_path_for_copy_command(),
                    )
                    .await;
                }
                if let Err(e) = conn.close().await {
                    debug!("Closing cleanup connection failed: {}", e);
                }
            }
            Err(e) => warn!("Unable to connect to {} to terminate COPY sessions: {}", database, e),
        }
    }
}

#[async_trait]
impl Cleanup for Teardown {
    async fn cleanup(&self, restore_failed: bool, cause: Option<TerminationCause>) -> Result<()> {
        let (database, plugin, agent_fps) = match self.resources.lock() {
            Ok(r) => (r.database.clone(), r.plugin.clone(), r.agent_fps.clone()),
            Err(_) => (None, None, Vec::new()),
        };

        if !agent_fps.is_empty() {
            if cause == Some(TerminationCause::Signal) {
                if let Some(database) = &database {
                    self.terminate_hanging_copies(database, &agent_fps).await;
                }
            }
            let plugin_path = plugin.as_ref().map(|(p, _)| p.config_path.clone());
            for fp in &agent_fps {
                let agents = SegmentCoordinator::new(&self.cluster, fp, &self.gphome, plugin_path.clone());
                if restore_failed {
                    agents.terminate_agents().await?;
                }
                agents.cleanup_helper_files().await?;
            }
        }

        if let Some((plugin, fp)) = plugin {
            plugin.cleanup_plugin_for_restore(&self.cluster, &fp).await?;
        }
        Ok(())
    }
}

/// Everything setup learned about the backup set and the cluster.
struct Session {
    cluster: Arc<Cluster>,
    fp: FilePathInfo,
    backup: BackupConfig,
    toc: Toc,
    metadata: Vec<u8>,
    plugin: Option<PluginConfig>,
    teardown: Arc<Teardown>,
    /// Quoted name of the database being restored into.
    database: String,
    globals_errors: u32,
}

pub struct RestoreContext {
    config: RestoreConfig,
    connector: Arc<dyn Connector>,
    executor: Arc<dyn RemoteExecutor>,
    lifecycle: Arc<Lifecycle>,
    restore_start: String,
    pid: u32,
    report: Mutex<Option<(PathBuf, RestoreReport)>>,
}

impl RestoreContext {
    pub fn new(
        config: RestoreConfig,
        restore_start: String,
        connector: Arc<dyn Connector>,
        executor: Arc<dyn RemoteExecutor>,
        lifecycle: Arc<Lifecycle>,
    ) -> Self {
        RestoreContext {
            config,
            connector,
            executor,
            lifecycle,
            restore_start,
            pid: std::process::id(),
            report: Mutex::new(None),
        }
    }

    pub fn application_name(&self) -> String {
        application_name(&self.config.timestamp, &self.restore_start)
    }

    /// Where the report goes and what it says, once setup got that far.
    pub fn report(&self) -> Option<(PathBuf, RestoreReport)> {
        self.report.lock().ok().and_then(|r| r.clone())
    }

    fn filters(&self) -> &Filters {
        &self.config.filters
    }

    /// Quoted schema every restored relation lands in, when redirected.
    fn redirect_schema(&self) -> Option<String> {
        self.config.redirect_schema.as_deref().map(quote_ident)
    }

    fn redirect_statements(&self, statements: Vec<StatementWithType>) -> Vec<StatementWithType> {
        match self.redirect_schema() {
            Some(schema) => substitute_redirect_schema_in_statements(statements, &schema),
            None => statements,
        }
    }

    fn exec_options(&self, parallel: bool) -> ExecOptions {
        ExecOptions::new(parallel, self.config.on_error_continue)
    }

    fn fp_for_timestamp(&self, cluster: &Cluster, timestamp: &str) -> FilePathInfo {
        FilePathInfo::new(
            &cluster.segments,
            &self.config.backup_dir,
            timestamp,
            &self.config.cluster.seg_prefix,
            self.pid,
        )
    }

    fn check_terminated(&self) -> Result<()> {
        if self.lifecycle.is_terminated() {
            return Err(RestoreError::Cancelled("restore was terminated".into()));
        }
        Ok(())
    }

    fn finish_phase(&self, subject: &str, num_errors: u32) -> Result<u32> {
        if self.lifecycle.is_terminated() {
            info!("{} incomplete", subject);
            return Err(RestoreError::Cancelled(format!("{} was interrupted", subject)));
        }
        if num_errors > 0 {
            info!("{} completed with failures", subject);
        } else {
            info!("{} complete", subject);
        }
        Ok(num_errors)
    }

    /// Runs the whole restore and returns how many statements and tables
    /// failed under on-error-continue.
    pub async fn run(&self) -> Result<u32> {
        let session = self.setup().await?;
        let database = unquote_ident(&session.database);
        let mut conns = open_connections(self.connector.as_ref(), &database, self.config.jobs).await?;
        let result = self.restore(&session, &mut conns).await;
        close_connections(conns).await;
        result
    }

    async fn setup(&self) -> Result<Session> {
        let mut admin = self.connector.connect(ADMIN_DATABASE, 0).await?;
        let result = self.setup_on(&mut admin).await;
        if let Err(e) = admin.close().await {
            debug!("Closing connection to {} failed: {}", ADMIN_DATABASE, e);
        }
        result
    }

    async fn setup_on(&self, admin: &mut Box<dyn RestoreConnection>) -> Result<Session> {
        info!("Restore Key = {}", self.config.timestamp);
        let segments = get_segment_configuration(admin.as_mut()).await?;
        let cluster = Arc::new(Cluster::new(segments, self.executor.clone()));
        let fp = self.fp_for_timestamp(&cluster, &self.config.timestamp);
        let gphome = self.config.cluster.gphome.as_str();

        let teardown = Arc::new(Teardown::new(
            cluster.clone(),
            self.connector.clone(),
            gphome,
            &self.application_name(),
        ));
        self.lifecycle.register_cleanup(teardown.clone());

        let plugin = match &self.config.plugin_config {
            Some(path) => {
                let plugin = PluginConfig::read(path, gphome)?;
                plugin.copy_config_to_all_hosts(&cluster).await?;
                teardown.set_plugin(&plugin, &fp);
                plugin.setup_plugin_for_restore(&cluster, &fp).await?;
                plugin.restore_metadata(&cluster, &fp.get_config_file_path()).await?;
                plugin.restore_metadata(&cluster, &fp.get_toc_file_path()).await?;
                plugin.restore_metadata(&cluster, &fp.get_metadata_file_path()).await?;
                if self.config.with_stats {
                    plugin.restore_metadata(&cluster, &fp.get_statistics_file_path()).await?;
                }
                Some(plugin)
            }
            None => None,
        };

        verify_metadata_file_paths(&fp, self.config.with_stats)?;
        let backup = BackupConfig::from_file(Path::new(&fp.get_config_file_path()))?;
        if backup.failed() {
            warn!("Backup {} was marked as failed; the restore may be incomplete", backup.timestamp);
        }
        validate_backup_flag_combinations(&backup, &self.config)?;

        let toc = Toc::from_file(Path::new(&fp.get_toc_file_path()))?;
        toc.validate()?;
        validate_filter_lists_in_backup_set(&toc, &backup, self.filters())?;

        let database = match &self.config.redirect_db {
            Some(redirect) => quote_ident(redirect),
            None => backup.database_name.clone(),
        };
        teardown.set_database(&database);
        let is_filtered = !self.filters().include_relations.is_empty() || self.config.data_only || backup.data_only;
        validate_database_existence(admin.as_mut(), &unquote_ident(&database), self.config.create_db, is_filtered)
            .await?;

        let agents = SegmentCoordinator::new(&cluster, &fp, gphome, None);
        if plugin.is_none() {
            agents.verify_backup_directories().await?;
        }
        if backup.single_data_file && !(self.config.metadata_only || backup.metadata_only) {
            agents.verify_helper_version(&self.config.cluster.helper_version).await?;
        }

        if let Ok(mut report) = self.report.lock() {
            *report = Some((
                PathBuf::from(fp.get_restore_report_file_path(&self.restore_start)),
                RestoreReport {
                    backup_timestamp: self.config.timestamp.clone(),
                    restore_start: self.restore_start.clone(),
                    database: database.clone(),
                    command_line: std::env::args().collect::<Vec<_>>().join(" "),
                    segment_count: cluster.num_segments(),
                },
            ));
        }

        let metadata = tokio::fs::read(fp.get_metadata_file_path()).await?;
        let globals_errors = if self.config.with_globals || self.config.create_db {
            self.restore_globals(admin, &toc, &metadata, &backup, &database).await?
        } else {
            0
        };

        Ok(Session {
            cluster,
            fp,
            backup,
            toc,
            metadata,
            plugin,
            teardown,
            database,
            globals_errors,
        })
    }

    /// Global objects, or only the database itself when it is being created
    /// without globals. Runs on the admin connection.
    async fn restore_globals(
        &self,
        admin: &mut Box<dyn RestoreConnection>,
        toc: &Toc,
        metadata: &[u8],
        backup: &BackupConfig,
        database: &str,
    ) -> Result<u32> {
        self.check_terminated()?;
        let (subject, object_types) = if self.config.with_globals {
            info!("Restoring global metadata");
            let mut types = GLOBAL_OBJECT_TYPES.to_vec();
            if self.config.create_db {
                types.push(object_type::DATABASE);
            }
            ("Global database metadata restore", types)
        } else {
            info!("Creating database");
            ("Database creation", CREATE_DATABASE_OBJECT_TYPES.to_vec())
        };

        let mut statements = toc.get_statements_for_object_types(
            Section::Global,
            metadata,
            object_types.as_slice(),
            NO_TYPES,
            &Filters::default(),
        )?;
        if self.config.redirect_db.is_some() {
            statements = substitute_redirect_database_in_statements(statements, &backup.database_name, database)?;
        }
        if self.config.with_globals {
            statements = remove_active_role(&self.connector.user(), statements);
        }
        let num_errors = execute_statements(
            std::slice::from_mut(admin),
            &statements,
            &every_statement(),
            self.exec_options(false),
            self.lifecycle.token(),
        )
        .await?;
        self.finish_phase(subject, num_errors)
    }

    async fn restore(&self, session: &Session, conns: &mut [Box<dyn RestoreConnection>]) -> Result<u32> {
        let backup = &session.backup;
        let data_only = self.config.data_only || backup.data_only;
        let metadata_only = self.config.metadata_only || backup.metadata_only;
        let incremental = self.config.incremental;

        let gucs = session_gucs(&self.application_name(), !metadata_only);
        for conn in conns.iter_mut() {
            set_session_gucs(conn.as_mut(), &gucs).await?;
        }

        if !(self.config.create_db || self.config.on_error_continue || incremental) {
            let mut relations = generate_restore_relation_list(&session.toc, self.filters());
            if let Some(schema) = self.redirect_schema() {
                relations = redirect_relations(&relations, &schema);
            }
            validate_relations_in_restore_database(first(conns)?.as_mut(), &relations, data_only).await?;
        }
        if let Some(schema) = &self.config.redirect_schema {
            validate_redirect_schema(first(conns)?.as_mut(), schema).await?;
        }
        if incremental {
            verify_incremental_state(first(conns)?.as_mut(), backup, self.filters(), self.config.on_error_continue).await?;
        }

        let mut num_errors = session.globals_errors;
        if !data_only && !incremental {
            num_errors += self.restore_predata(session, conns).await?;
        } else if data_only {
            num_errors += self.restore_sequence_values(session, conns).await?;
        }

        let mut restored = Vec::new();
        if !metadata_only {
            let (data_errors, tables) = self.restore_data(session, conns).await?;
            num_errors += data_errors;
            restored = tables;
        }

        if !data_only && !incremental {
            num_errors += self.restore_postdata(session, conns).await?;
        }

        if self.config.with_stats && backup.with_statistics {
            num_errors += self.restore_statistics(session, conns).await?;
        } else if self.config.run_analyze && !restored.is_empty() {
            num_errors += self.run_analyze(&restored, conns).await?;
        }
        Ok(num_errors)
    }

    /// Schemas are created first and one at a time; with an include-relation
    /// filter only the schemas of the included relations are.
    fn schema_filters(&self, filters: &Filters) -> Filters {
        if filters.include_relations.is_empty() {
            return filters.clone();
        }
        let mut schemas: Vec<String> = Vec::new();
        for relation in &filters.include_relations {
            let schema = schema_of_fqn(relation).to_string();
            if !schemas.contains(&schema) {
                schemas.push(schema);
            }
        }
        Filters {
            include_schemas: schemas,
            ..Filters::default()
        }
    }

    async fn restore_predata(&self, session: &Session, conns: &mut [Box<dyn RestoreConnection>]) -> Result<u32> {
        self.check_terminated()?;
        info!("Restoring pre-data metadata");
        let mut filters = self.filters().clone();
        let roots = get_included_partition_roots(&session.toc.data_entries, &filters.include_relations);
        for root in roots {
            if !filters.include_relations.contains(&root) {
                filters.include_relations.push(root);
            }
        }

        // A redirected restore lands in a schema that already exists.
        let schemas = if self.config.redirect_schema.is_some() {
            Vec::new()
        } else {
            session.toc.get_statements_for_object_types(
                Section::Predata,
                &session.metadata,
                SCHEMA_ONLY,
                NO_TYPES,
                &self.schema_filters(&filters),
            )?
        };
        let statements = self.redirect_statements(session.toc.get_statements_for_object_types(
            Section::Predata,
            &session.metadata,
            NO_TYPES,
            SCHEMA_ONLY,
            &filters,
        )?);

        let token = self.lifecycle.token();
        let mut num_errors = restore_schemas(first(conns)?.as_mut(), &schemas, self.config.on_error_continue, token).await?;
        num_errors += execute_statements(conns, &statements, &every_statement(), self.exec_options(false), token).await?;
        self.finish_phase("Pre-data metadata restore", num_errors)
    }

    /// Replays only the setval part of each sequence definition.
    async fn restore_sequence_values(
        &self,
        session: &Session,
        conns: &mut [Box<dyn RestoreConnection>],
    ) -> Result<u32> {
        self.check_terminated()?;
        info!("Restoring sequence values");
        let setval = Regex::new(r"SELECT pg_catalog\.setval\(.*")?;
        let sequences = session.toc.get_statements_for_object_types(
            Section::Predata,
            &session.metadata,
            SEQUENCE_ONLY,
            NO_TYPES,
            self.filters(),
        )?;
        let statements: Vec<StatementWithType> = self
            .redirect_statements(sequences)
            .into_iter()
            .filter_map(|mut statement| {
                let call = setval.find(&statement.statement)?.as_str().to_string();
                statement.statement = call;
                Some(statement)
            })
            .collect();

        let num_errors = if statements.is_empty() {
            debug!("No sequence values to restore");
            0
        } else {
            execute_statements(conns, &statements, &every_statement(), self.exec_options(true), self.lifecycle.token())
                .await?
        };
        self.finish_phase("Sequence values restore", num_errors)
    }

    /// Plan entries whose data this run loads, in chain order.
    fn restore_plan_entries(&self, session: &Session) -> Vec<RestorePlanEntry> {
        let plan = &session.backup.restore_plan;
        if self.config.incremental {
            return plan.last().cloned().into_iter().collect();
        }
        if plan.is_empty() {
            return vec![RestorePlanEntry {
                timestamp: self.config.timestamp.clone(),
                table_fqns: session.toc.data_entries.iter().map(|e| e.fqn()).collect(),
            }];
        }
        plan.clone()
    }

    async fn restore_data(
        &self,
        session: &Session,
        conns: &mut [Box<dyn RestoreConnection>],
    ) -> Result<(u32, Vec<CoordinatorDataEntry>)> {
        self.check_terminated()?;
        info!("Restoring data");
        let filters = self.filters();
        let mut num_errors = 0;
        let mut restored = Vec::new();

        for plan_entry in self.restore_plan_entries(session) {
            let loaded_toc;
            let (fp, toc) = if plan_entry.timestamp == session.fp.timestamp {
                (session.fp.clone(), &session.toc)
            } else {
                let fp = self.fp_for_timestamp(&session.cluster, &plan_entry.timestamp);
                if let Some(plugin) = &session.plugin {
                    plugin.restore_metadata(&session.cluster, &fp.get_toc_file_path()).await?;
                }
                loaded_toc = Toc::from_file(Path::new(&fp.get_toc_file_path()))?;
                loaded_toc.validate()?;
                (fp, &loaded_toc)
            };
            let mut entries = toc.get_data_entries_matching(
                &filters.include_schemas,
                &filters.exclude_schemas,
                &filters.include_relations,
                &filters.exclude_relations,
                &plan_entry.table_fqns,
            );
            if entries.is_empty() {
                continue;
            }
            if let Some(schema) = self.redirect_schema() {
                for entry in entries.iter_mut() {
                    entry.schema = schema.clone();
                }
            }
            debug!(
                "Restoring data for {} tables from backup with timestamp: {}",
                entries.len(),
                plan_entry.timestamp
            );
            num_errors += self.restore_data_from_timestamp(session, &fp, &entries, conns).await?;
            restored.extend(entries);
        }

        self.finish_phase("Data restore", num_errors)
            .map(|num_errors| (num_errors, restored))
    }

    fn data_source(&self, session: &Session, fp: &FilePathInfo) -> DataSource {
        let extension = session.backup.data_file_extension().to_string();
        let decompress = session.backup.decompress_program().to_string();
        if session.backup.single_data_file {
            DataSource::SingleDataFile {
                pipe_template: fp.get_segment_pipe_path_for_copy_command(),
            }
        } else if let Some(plugin) = &session.plugin {
            DataSource::Plugin {
                executable: plugin.executable_path.clone(),
                config_path: plugin.config_path.clone(),
                fp: fp.clone(),
                extension,
                decompress,
            }
        } else {
            DataSource::Files {
                fp: fp.clone(),
                extension,
                decompress,
            }
        }
    }

    async fn restore_data_from_timestamp(
        &self,
        session: &Session,
        fp: &FilePathInfo,
        entries: &[CoordinatorDataEntry],
        conns: &mut [Box<dyn RestoreConnection>],
    ) -> Result<u32> {
        let source = self.data_source(session, fp);
        let token = self.lifecycle.token();
        let num_segments = session.cluster.num_segments();

        if !session.backup.single_data_file {
            let job = DataJob {
                source: &source,
                num_segments,
                on_error_continue: self.config.on_error_continue,
                agents: None,
            };
            return restore_data_entries(conns, entries, &job, token).await;
        }

        let options = &self.config.cluster;
        let plugin_path = session.plugin.as_ref().map(|p| p.config_path.clone());
        let agents = SegmentCoordinator::new(&session.cluster, fp, &options.gphome, plugin_path);
        session.teardown.track_agents(fp);
        if let Some(plugin) = &session.plugin {
            plugin.restore_segment_tocs(&session.cluster, fp).await?;
        }
        let oids: Vec<u32> = entries.iter().map(|e| e.oid).collect();
        let extension = session.backup.data_file_extension();
        agents
            .prepare(
                &oids,
                |content| fp.get_table_backup_file_path(content, 0, extension, true),
                options.agent_timeout,
                options.agent_poll_interval,
                token,
            )
            .await?;

        let job = DataJob {
            source: &source,
            num_segments,
            on_error_continue: self.config.on_error_continue,
            agents: Some(&agents),
        };
        let num_errors = restore_data_entries(conns, entries, &job, token).await?;
        agents.check_agent_errors(&helper_log_path(fp)).await?;
        Ok(num_errors)
    }

    async fn restore_postdata(&self, session: &Session, conns: &mut [Box<dyn RestoreConnection>]) -> Result<u32> {
        self.check_terminated()?;
        info!("Restoring post-data metadata");
        let statements = self.redirect_statements(session.toc.get_statements_for_object_types(
            Section::Postdata,
            &session.metadata,
            NO_TYPES,
            NO_TYPES,
            self.filters(),
        )?);
        let (first_batch, second_batch) = batch_postdata_statements(statements);
        let parallel = conns.len() > 1;
        let token = self.lifecycle.token();
        let all = every_statement();

        let mut num_errors = execute_statements(conns, &first_batch, &all, self.exec_options(parallel), token).await?;
        if !self.lifecycle.is_terminated() {
            num_errors += execute_statements(conns, &second_batch, &all, self.exec_options(parallel), token).await?;
        }
        self.finish_phase("Post-data metadata restore", num_errors)
    }

    async fn restore_statistics(&self, session: &Session, conns: &mut [Box<dyn RestoreConnection>]) -> Result<u32> {
        self.check_terminated()?;
        let statistics_file = session.fp.get_statistics_file_path();
        info!("Restoring query planner statistics from {}", statistics_file);
        let statistics = tokio::fs::read(&statistics_file).await?;
        let statements = self.redirect_statements(session.toc.get_statements_for_object_types(
            Section::Statistics,
            &statistics,
            NO_TYPES,
            NO_TYPES,
            self.filters(),
        )?);
        let num_errors =
            execute_statements(conns, &statements, &every_statement(), self.exec_options(false), self.lifecycle.token())
                .await?;
        self.finish_phase("Query planner statistics restore", num_errors)
    }

    async fn run_analyze(
        &self,
        restored: &[CoordinatorDataEntry],
        conns: &mut [Box<dyn RestoreConnection>],
    ) -> Result<u32> {
        self.check_terminated()?;
        info!("Running ANALYZE on restored tables");
        let statements: Vec<StatementWithType> = restored
            .iter()
            .map(|entry| StatementWithType {
                schema: entry.schema.clone(),
                name: entry.name.clone(),
                object_type: object_type::TABLE.to_string(),
                reference_object: String::new(),
                statement: format!("ANALYZE {}", entry.fqn()),
            })
            .collect();
        let parallel = conns.len() > 1;
        let num_errors =
            execute_statements(conns, &statements, &every_statement(), self.exec_options(parallel), self.lifecycle.token())
                .await?;
        self.finish_phase("Table analysis", num_errors)
    }
}
