//! Database checks: connection usage, idle transactions, long queries,
//! replication and `pg_stat_database` counters.
//!
//! Evaluation is kept in free functions over plain rows so it can be tested
//! without a server.

use super::{CheckContext, HealthError, HealthProbe};
use crate::config::{DatabaseSettings, Thresholds};
use crate::limiter::AlertCategory;
use crate::pg::{self, format_postgres_error};
use postgres::Client;
use std::collections::HashMap;
use tracing::{info, warn};

const CONNECTIONS_QUERY: &str = "SELECT \
     (SELECT count(*) FROM pg_stat_activity)::bigint, \
     (SELECT count(*) FROM pg_stat_activity WHERE state = 'active')::bigint, \
     current_setting('max_connections')::bigint";

const IDLE_QUERY: &str = "SELECT count(*)::bigint FROM pg_stat_activity \
     WHERE state = 'idle in transaction' \
     AND now() - state_change > make_interval(secs => $1)";

const LONG_QUERY: &str = "SELECT pid, coalesce(datname::text, ''), coalesce(usename::text, ''), \
     coalesce(nullif(application_name, ''), 'n/a'), coalesce(host(client_addr), 'local'), \
     extract(epoch FROM now() - query_start)::bigint, coalesce(left(query, 200), '') \
     FROM pg_stat_activity \
     WHERE state = 'active' AND pid <> pg_backend_pid() \
     AND now() - query_start > make_interval(secs => $1) \
     AND NOT ($2 AND query ILIKE 'autovacuum:%') \
     AND NOT ($3 AND (query ILIKE 'vacuum%' OR query ILIKE 'analyze%')) \
     AND NOT (coalesce(application_name, '') = ANY($4)) \
     AND NOT (coalesce(usename::text, '') = ANY($5)) \
     AND NOT (query = ANY($6)) \
     ORDER BY query_start";

const REPLICATION_QUERY: &str = "SELECT coalesce(host(client_addr), ''), coalesce(state, ''), \
     coalesce(sent_lsn::text, ''), coalesce(write_lsn::text, '') \
     FROM pg_stat_replication";

const DBSTAT_QUERY: &str = "SELECT datname::text, conflicts, deadlocks, temp_bytes \
     FROM pg_stat_database WHERE datname IS NOT NULL";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStats {
    pub total: i64,
    pub active: i64,
    pub max: i64,
}

pub fn connection_alerts(
    stats: ConnectionStats,
    cpus: usize,
    pct: u32,
) -> Vec<(AlertCategory, String)> {
    let mut alerts = Vec::new();
    let limit = stats.max * i64::from(pct) / 100;
    if stats.total > limit {
        alerts.push((
            AlertCategory::ConnectionTotal,
            format!(
                "Connections ({}) exceed {pct}% of max_connections ({}).",
                stats.total, stats.max
            ),
        ));
    }
    if stats.active > cpus as i64 {
        alerts.push((
            AlertCategory::ConnectionActive,
            format!(
                "Active connections ({}) exceed CPU count ({cpus}).",
                stats.active
            ),
        ));
    }
    alerts
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LongQuery {
    pub pid: i32,
    pub datname: String,
    pub usename: String,
    pub application: String,
    pub client: String,
    pub seconds: i64,
    pub query: String,
}

pub fn long_query_alert(queries: &[LongQuery], threshold: u64) -> Option<String> {
    let first = queries.first()?;
    let mut text = format!(
        "{} long running queries (> {threshold} seconds). Longest: pid={} db={} user={} app={} client={} duration={}s query={}",
        queries.len(),
        first.pid,
        first.datname,
        first.usename,
        first.application,
        first.client,
        first.seconds,
        first.query.replace('\n', " "),
    );
    if queries.len() > 1 {
        let pids: Vec<String> = queries[1..].iter().map(|q| q.pid.to_string()).collect();
        text.push_str(&format!(" Others: {}", pids.join(",")));
    }
    Some(text)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaRow {
    pub client: String,
    pub state: String,
    pub sent_lsn: String,
    pub write_lsn: String,
}

pub fn replica_alerts(expected: &[String], rows: &[ReplicaRow], monitor_lag: bool) -> Vec<String> {
    let mut alerts = Vec::new();
    for replica in expected.iter().filter(|r| !r.trim().is_empty()) {
        let Some(row) = rows.iter().find(|row| row.client == replica.trim()) else {
            alerts.push(format!("Replica {replica} is not connected."));
            continue;
        };
        if row.state != "streaming" {
            alerts.push(format!(
                "Replica {replica} is not streaming (state: {}).",
                row.state
            ));
        } else if monitor_lag && row.sent_lsn != row.write_lsn {
            alerts.push(format!(
                "Replica {replica} is lagging (sent {} / written {}).",
                row.sent_lsn, row.write_lsn
            ));
        }
    }
    alerts
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DbCounters {
    pub conflicts: i64,
    pub deadlocks: i64,
    pub temp_bytes: i64,
}

/// Alerts for counters that moved since the previous check. Temp bytes only
/// alert when the growth exceeds `temp_threshold`.
pub fn dbstat_alerts(
    previous: &HashMap<String, DbCounters>,
    current: &HashMap<String, DbCounters>,
    temp_threshold: u64,
) -> Vec<String> {
    let mut names: Vec<&String> = current.keys().collect();
    names.sort();

    let mut alerts = Vec::new();
    for name in names {
        let (Some(prev), Some(cur)) = (previous.get(name), current.get(name)) else {
            continue;
        };
        if cur.conflicts > prev.conflicts {
            alerts.push(format!(
                "Database {name}: {} new recovery conflicts.",
                cur.conflicts - prev.conflicts
            ));
        }
        if cur.deadlocks > prev.deadlocks {
            alerts.push(format!(
                "Database {name}: {} new deadlocks.",
                cur.deadlocks - prev.deadlocks
            ));
        }
        let temp_growth = cur.temp_bytes.saturating_sub(prev.temp_bytes);
        if temp_growth > 0 && temp_growth as u64 > temp_threshold {
            alerts.push(format!(
                "Database {name}: {temp_growth} bytes of temp files written since last check (threshold {temp_threshold})."
            ));
        }
    }
    alerts
}

/// Database side checks. The connection is re-established on the next
/// cycle after a failure.
pub struct DbHealth {
    settings: DatabaseSettings,
    client: Option<Client>,
    cpus: usize,
    previous: Option<HashMap<String, DbCounters>>,
}

impl DbHealth {
    pub fn new(settings: DatabaseSettings, client: Option<Client>, cpus: usize) -> Self {
        Self {
            settings,
            client,
            cpus,
            previous: None,
        }
    }

    fn ensure_connected(&mut self) -> Result<&mut Client, HealthError> {
        if self.client.is_none() {
            let client = pg::connect(&self.settings).map_err(|e| HealthError::Database(e.to_string()))?;
            info!(host = %self.settings.host, "reconnected to database");
            self.client = Some(client);
        }
        self.client
            .as_mut()
            .ok_or_else(|| HealthError::Database("not connected".into()))
    }

    fn run_checks(&mut self, ctx: &mut CheckContext<'_>) -> Result<(), postgres::Error> {
        let cpus = self.cpus;
        let config = ctx.config;
        let t: &Thresholds = &config.thresholds;
        let filters = &config.filters;
        let Some(client) = self.client.as_mut() else {
            return Ok(());
        };

        let row = client.query_one(CONNECTIONS_QUERY, &[])?;
        let stats = ConnectionStats {
            total: row.try_get(0)?,
            active: row.try_get(1)?,
            max: row.try_get(2)?,
        };
        for (category, text) in connection_alerts(stats, cpus, t.connection_pct) {
            ctx.raise(category, text);
        }

        let idle_secs = t.idle_transaction as f64;
        let idle: i64 = client.query_one(IDLE_QUERY, &[&idle_secs])?.try_get(0)?;
        if idle > 0 {
            ctx.raise(
                AlertCategory::IdleInTransaction,
                format!(
                    "{idle} connection(s) idle in transaction for more than {} seconds.",
                    t.idle_transaction
                ),
            );
        }

        let long_secs = t.long_query as f64;
        let rows = client.query(
            LONG_QUERY,
            &[
                &long_secs,
                &t.ignore_autovac_daemon,
                &t.ignore_user_vacuum,
                &filters.ignore_apps,
                &filters.ignore_users,
                &filters.ignore_queries,
            ],
        )?;
        let queries = rows
            .iter()
            .map(|row| {
                Ok(LongQuery {
                    pid: row.try_get(0)?,
                    datname: row.try_get(1)?,
                    usename: row.try_get(2)?,
                    application: row.try_get(3)?,
                    client: row.try_get(4)?,
                    seconds: row.try_get(5)?,
                    query: row.try_get(6)?,
                })
            })
            .collect::<Result<Vec<_>, postgres::Error>>()?;
        if let Some(text) = long_query_alert(&queries, t.long_query) {
            ctx.raise(AlertCategory::LongQuery, text);
        }

        if !t.slaves.is_empty() {
            let rows = client.query(REPLICATION_QUERY, &[])?;
            let replicas = rows
                .iter()
                .map(|row| {
                    Ok(ReplicaRow {
                        client: row.try_get(0)?,
                        state: row.try_get(1)?,
                        sent_lsn: row.try_get(2)?,
                        write_lsn: row.try_get(3)?,
                    })
                })
                .collect::<Result<Vec<_>, postgres::Error>>()?;
            for text in replica_alerts(&t.slaves, &replicas, t.monitor_lag) {
                ctx.raise(AlertCategory::ReplicaLag, text);
            }
        }

        let rows = client.query(DBSTAT_QUERY, &[])?;
        let mut current = HashMap::new();
        for row in &rows {
            current.insert(
                row.try_get::<_, String>(0)?,
                DbCounters {
                    conflicts: row.try_get(1)?,
                    deadlocks: row.try_get(2)?,
                    temp_bytes: row.try_get(3)?,
                },
            );
        }
        if let Some(previous) = &self.previous {
            for text in dbstat_alerts(previous, &current, t.temp_bytes) {
                ctx.raise_unthrottled(text);
            }
        }
        self.previous = Some(current);
        Ok(())
    }
}

impl HealthProbe for DbHealth {
    fn name(&self) -> &'static str {
        "database"
    }

    fn check(&mut self, ctx: &mut CheckContext<'_>) -> Result<(), HealthError> {
        self.ensure_connected()?;
        self.run_checks(ctx).map_err(|e| {
            warn!(error = %format_postgres_error(&e), "dropping database connection");
            self.client = None;
            HealthError::Database(format_postgres_error(&e))
        })
    }
}
