// clusterrestore/src/restore/db_restore.rs
use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::{ConnectOptions, Connection, Executor, Row};
use std::str::FromStr;
use tracing::{debug, info};
use url::Url;

use crate::cluster::SegConfig;
use crate::errors::{RestoreError, Result};
use crate::utils::escape_single_quotes;

/// One database session owned by one worker for its whole life.
#[async_trait]
pub trait RestoreConnection: Send {
    fn conn_num(&self) -> usize;

    /// Runs `sql` and returns the affected row count reported by the server.
    async fn exec(&mut self, sql: &str) -> Result<u64>;

    /// Runs a query whose columns are all text.
    async fn select_rows(&mut self, sql: &str) -> Result<Vec<Vec<String>>>;

    async fn select_strings(&mut self, sql: &str) -> Result<Vec<String>> {
        Ok(self
            .select_rows(sql)
            .await?
            .into_iter()
            .filter_map(|row| row.into_iter().next())
            .collect())
    }

    async fn close(self: Box<Self>) -> Result<()>;
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, database: &str, conn_num: usize) -> Result<Box<dyn RestoreConnection>>;

    /// Role the sessions log in as.
    fn user(&self) -> String;
}

pub struct PgSession {
    conn: PgConnection,
    conn_num: usize,
}

#[async_trait]
impl RestoreConnection for PgSession {
    fn conn_num(&self) -> usize {
        self.conn_num
    }

    async fn exec(&mut self, sql: &str) -> Result<u64> {
        // A bare &str goes over the simple query protocol, so metadata
        // entries holding several statements run as written.
        let result = (&mut self.conn).execute(sql).await?;
        Ok(result.rows_affected())
    }

    async fn select_rows(&mut self, sql: &str) -> Result<Vec<Vec<String>>> {
        let rows = sqlx::query(sql).fetch_all(&mut self.conn).await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let mut values = Vec::with_capacity(row.len());
            for i in 0..row.len() {
                let value: Option<String> = row.try_get(i)?;
                values.push(value.unwrap_or_default());
            }
            out.push(values);
        }
        Ok(out)
    }

    async fn close(self: Box<Self>) -> Result<()> {
        self.conn.close().await?;
        Ok(())
    }
}

/// Opens sessions against the server named by the target URL, tagged with
/// this restore's application name.
pub struct PgConnector {
    server_url: Url,
    application_name: String,
}

impl PgConnector {
    pub fn new(target_db_url: &str, application_name: &str) -> Result<Self> {
        Ok(PgConnector {
            server_url: Url::parse(target_db_url)?,
            application_name: application_name.to_string(),
        })
    }

    pub fn url_for_database(&self, database: &str) -> Url {
        let mut url = self.server_url.clone();
        url.set_path(&format!("/{}", database));
        url
    }
}

#[async_trait]
impl Connector for PgConnector {
    async fn connect(&self, database: &str, conn_num: usize) -> Result<Box<dyn RestoreConnection>> {
        let url = self.url_for_database(database);
        let options = PgConnectOptions::from_str(url.as_str())?
            .database(database)
            .application_name(&self.application_name);
        let conn = options.connect().await.map_err(|e| {
            RestoreError::Execution(format!(
                "Failed to connect to database '{}' on {}: {}",
                database,
                self.server_url.host_str().unwrap_or("unknown_host"),
                e
            ))
        })?;
        debug!("Opened connection {} to database {}", conn_num, database);
        Ok(Box::new(PgSession { conn, conn_num }))
    }

    fn user(&self) -> String {
        self.server_url.username().to_string()
    }
}

/// Opens `count` sessions numbered from zero.
pub async fn open_connections(
    connector: &dyn Connector,
    database: &str,
    count: usize,
) -> Result<Vec<Box<dyn RestoreConnection>>> {
    let mut conns = Vec::with_capacity(count);
    for conn_num in 0..count {
        conns.push(connector.connect(database, conn_num).await?);
    }
    Ok(conns)
}

pub async fn close_connections(conns: Vec<Box<dyn RestoreConnection>>) {
    for conn in conns {
        let num = conn.conn_num();
        if let Err(e) = conn.close().await {
            debug!("Closing connection {} failed: {}", num, e);
        }
    }
}

/// Primary segments and the coordinator, ordered by content id.
pub async fn get_segment_configuration(conn: &mut dyn RestoreConnection) -> Result<Vec<SegConfig>> {
    let rows = conn
        .select_rows(
            "SELECT content::text, hostname::text, datadir::text FROM gp_segment_configuration WHERE role = 'p' ORDER BY content",
        )
        .await?;
    rows.into_iter()
        .map(|row| match row.as_slice() {
            [content, hostname, datadir] => {
                let content_id = content.parse::<i32>().map_err(|e| {
                    RestoreError::Config(format!("Invalid segment content id '{}': {}", content, e))
                })?;
                Ok(SegConfig::new(content_id, hostname, datadir))
            }
            _ => Err(RestoreError::Config(
                "Unexpected row shape in gp_segment_configuration".into(),
            )),
        })
        .collect()
}

pub async fn database_exists(conn: &mut dyn RestoreConnection, unquoted_name: &str) -> Result<bool> {
    let found = conn
        .select_strings(&format!(
            "SELECT CASE WHEN EXISTS (SELECT 1 FROM pg_database WHERE datname = '{}') THEN 'true' ELSE 'false' END",
            escape_single_quotes(unquoted_name)
        ))
        .await?;
    Ok(found.first().map(|s| s == "true").unwrap_or(false))
}

pub async fn schema_exists(conn: &mut dyn RestoreConnection, unquoted_name: &str) -> Result<bool> {
    let found = conn
        .select_strings(&format!(
            "SELECT quote_ident(nspname)::text FROM pg_namespace WHERE nspname = '{}'",
            escape_single_quotes(unquoted_name)
        ))
        .await?;
    Ok(!found.is_empty())
}

pub async fn get_existing_schemas(conn: &mut dyn RestoreConnection) -> Result<Vec<String>> {
    conn.select_strings("SELECT quote_ident(nspname)::text FROM pg_namespace ORDER BY nspname")
        .await
}

pub async fn get_existing_table_fqns(conn: &mut dyn RestoreConnection) -> Result<Vec<String>> {
    conn.select_strings(
        "SELECT (quote_ident(n.nspname) || '.' || quote_ident(c.relname))::text \
         FROM pg_class c JOIN pg_namespace n ON c.relnamespace = n.oid \
         WHERE c.relkind IN ('r', 'p') AND n.nspname NOT LIKE 'pg_%' AND n.nspname <> 'information_schema' \
         ORDER BY 1",
    )
    .await
}

/// Which of `relations` already exist in the connected database.
pub async fn get_relations_in_database(
    conn: &mut dyn RestoreConnection,
    relations: &[String],
) -> Result<Vec<String>> {
    if relations.is_empty() {
        return Ok(Vec::new());
    }
    let quoted = relations
        .iter()
        .map(|r| format!("'{}'", escape_single_quotes(r)))
        .collect::<Vec<_>>()
        .join(",");
    conn.select_strings(&format!(
        "SELECT (quote_ident(n.nspname) || '.' || quote_ident(c.relname))::text \
         FROM pg_namespace n JOIN pg_class c ON n.oid = c.relnamespace \
         WHERE quote_ident(n.nspname) || '.' || quote_ident(c.relname) IN ({})",
        quoted
    ))
    .await
}

/// Kills the backends of this restore still stuck in a COPY that reads from
/// a segment pipe. Errors are ignored; the sessions may already be gone.
pub async fn terminate_hanging_copy_sessions(
    conn: &mut dyn RestoreConnection,
    application_name: &str,
    copy_pipe_template: &str,
) {
    let sql = format!(
        "SELECT pg_terminate_backend(pid) FROM pg_stat_activity \
         WHERE application_name = '{}' AND query LIKE '%{}%' AND pid <> pg_backend_pid()",
        escape_single_quotes(application_name),
        escape_single_quotes(copy_pipe_template)
    );
    match conn.exec(&sql).await {
        Ok(_) => info!("Terminated hanging COPY sessions for {}", application_name),
        Err(e) => debug!("Terminating hanging COPY sessions failed: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::MockConnection;

    #[test]
    fn test_url_for_database() -> anyhow::Result<()> {
        let connector = PgConnector::new("postgres://gpadmin:pw@cdw:5432/postgres", "gprestore_x")?;
        assert_eq!(
            connector.url_for_database("sales").as_str(),
            "postgres://gpadmin:pw@cdw:5432/sales"
        );
        assert_eq!(connector.user(), "gpadmin");
        Ok(())
    }

    #[tokio::test]
    async fn test_get_segment_configuration() -> anyhow::Result<()> {
        let mut conn = MockConnection::new(0);
        conn.respond_rows(
            "gp_segment_configuration",
            vec![
                vec!["-1".into(), "cdw".into(), "/data/gpseg-1".into()],
                vec!["0".into(), "sdw1".into(), "/data/gpseg0".into()],
            ],
        );
        let segments = get_segment_configuration(&mut conn).await?;
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[1], SegConfig::new(0, "sdw1", "/data/gpseg0"));
        Ok(())
    }

    #[tokio::test]
    async fn test_database_exists_escapes_name() -> anyhow::Result<()> {
        let mut conn = MockConnection::new(0);
        conn.respond_rows("pg_database", vec![vec!["true".into()]]);
        assert!(database_exists(&mut conn, "o'brien").await?);
        assert!(conn.executed().iter().any(|s| s.contains("datname = 'o''brien'")));
        Ok(())
    }

    #[tokio::test]
    async fn test_terminate_hanging_copy_sessions_ignores_errors() {
        let mut conn = MockConnection::new(0);
        conn.fail_when_contains("pg_terminate_backend", "permission denied");
        terminate_hanging_copy_sessions(&mut conn, "gprestore_1_2", "<SEG_DATA_DIR>/gpbackup_<SEGID>_1_pipe").await;
        assert_eq!(conn.executed().len(), 1);
    }
}
