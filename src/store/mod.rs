//! Persistent session state (SQLite, one file).
//!
//! Five tables mirror the session entities, plus one table of action
//! plugin execution records. `session_id` is the fan-out foreign key;
//! deleting a session removes its whole closure in one transaction.

use crate::actions::{ActionPlugin, ActionPluginInstance, ActionType};
use crate::session::{Action, Host, HostType, Instance, Project, ProjectState, WorkflowState};
use crate::{DrydockError, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// Persisted session row.
#[derive(Debug, Clone)]
pub struct SessionRow {
    pub session_id: String,
    pub state: WorkflowState,
    pub maintenance_at: DateTime<Utc>,
    pub meta: String,
    pub workflow: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// SQLite-backed session store.
pub struct Store {
    db_path: PathBuf,
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(&db_path)?;
        let store = Self {
            db_path,
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Private in-memory database, used by tests.
    pub fn open_in_memory() -> Result<Self> {
        let store = Self {
            db_path: PathBuf::from(":memory:"),
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| DrydockError::Internal("session store mutex poisoned".to_string()))
    }

    fn init_schema(&self) -> Result<()> {
        self.conn()?.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS sessions (
              session_id TEXT PRIMARY KEY,
              state TEXT NOT NULL,
              maintenance_at TEXT NOT NULL,
              meta TEXT NOT NULL,
              workflow TEXT NOT NULL,
              created_at TEXT NOT NULL,
              updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS hosts (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              session_id TEXT NOT NULL,
              hostname TEXT NOT NULL,
              type TEXT NOT NULL,
              maintained INTEGER NOT NULL DEFAULT 0,
              disabled INTEGER NOT NULL DEFAULT 0,
              details TEXT,
              created_at TEXT NOT NULL,
              updated_at TEXT NOT NULL,
              UNIQUE (session_id, hostname)
            );

            CREATE TABLE IF NOT EXISTS projects (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              session_id TEXT NOT NULL,
              project_id TEXT NOT NULL,
              state TEXT,
              created_at TEXT NOT NULL,
              updated_at TEXT NOT NULL,
              UNIQUE (session_id, project_id)
            );

            CREATE TABLE IF NOT EXISTS instances (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              session_id TEXT NOT NULL,
              instance_id TEXT NOT NULL,
              instance_name TEXT NOT NULL,
              project_id TEXT NOT NULL,
              host TEXT NOT NULL,
              state TEXT NOT NULL,
              project_state TEXT,
              action TEXT,
              action_done INTEGER NOT NULL DEFAULT 0,
              details TEXT,
              created_at TEXT NOT NULL,
              updated_at TEXT NOT NULL,
              UNIQUE (session_id, instance_id)
            );

            CREATE TABLE IF NOT EXISTS action_plugins (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              session_id TEXT NOT NULL,
              plugin TEXT NOT NULL,
              type TEXT NOT NULL,
              state TEXT,
              meta TEXT NOT NULL,
              created_at TEXT NOT NULL,
              updated_at TEXT NOT NULL,
              UNIQUE (session_id, plugin)
            );

            CREATE TABLE IF NOT EXISTS action_plugin_instances (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              session_id TEXT NOT NULL,
              plugin TEXT NOT NULL,
              hostname TEXT NOT NULL,
              state TEXT,
              created_at TEXT NOT NULL,
              updated_at TEXT NOT NULL,
              UNIQUE (session_id, plugin, hostname)
            );
            "#,
        )?;
        Ok(())
    }

    // ── sessions ─────────────────────────────────────────────────────

    pub fn create_session(
        &self,
        session_id: &str,
        state: WorkflowState,
        maintenance_at: DateTime<Utc>,
        meta: &str,
        workflow: &str,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.conn()?
            .execute(
                r#"
                INSERT INTO sessions (
                  session_id, state, maintenance_at, meta, workflow, created_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
                params![
                    session_id,
                    state.as_str(),
                    maintenance_at.to_rfc3339(),
                    meta,
                    workflow,
                    now,
                    now,
                ],
            )
            .map_err(|e| map_insert_err("sessions", e))?;
        Ok(())
    }

    pub fn session_get(&self, session_id: &str) -> Result<Option<SessionRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT session_id, state, maintenance_at, meta, workflow, created_at, updated_at
            FROM sessions WHERE session_id = ?1
            "#,
        )?;
        let row = stmt
            .query_row([session_id], |row| {
                Ok(SessionRow {
                    session_id: row.get(0)?,
                    state: WorkflowState::parse(&row.get::<_, String>(1)?).map_err(to_sql_err)?,
                    maintenance_at: parse_rfc3339(&row.get::<_, String>(2)?).map_err(to_sql_err)?,
                    meta: row.get(3)?,
                    workflow: row.get(4)?,
                    created_at: parse_rfc3339(&row.get::<_, String>(5)?).map_err(to_sql_err)?,
                    updated_at: parse_rfc3339(&row.get::<_, String>(6)?).map_err(to_sql_err)?,
                })
            })
            .optional()?;
        Ok(row)
    }

    pub fn session_ids(&self) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT session_id FROM sessions ORDER BY created_at")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }

    pub fn set_session_state(&self, session_id: &str, state: WorkflowState) -> Result<()> {
        self.conn()?.execute(
            "UPDATE sessions SET state = ?1, updated_at = ?2 WHERE session_id = ?3",
            params![state.as_str(), Utc::now().to_rfc3339(), session_id],
        )?;
        Ok(())
    }

    /// Delete a session and its whole closure in one transaction.
    ///
    /// Missing dependents are not fatal; a missing session row is.
    pub fn remove_session(&self, session_id: &str) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        for table in [
            "action_plugin_instances",
            "action_plugins",
            "hosts",
            "projects",
            "instances",
        ] {
            tx.execute(
                &format!("DELETE FROM {} WHERE session_id = ?1", table),
                [session_id],
            )?;
        }
        let deleted = tx.execute("DELETE FROM sessions WHERE session_id = ?1", [session_id])?;
        if deleted == 0 {
            return Err(DrydockError::NotFound {
                model: "sessions",
                id: session_id.to_string(),
            });
        }
        tx.commit()?;
        Ok(())
    }

    // ── hosts ────────────────────────────────────────────────────────

    pub fn create_host(&self, session_id: &str, host: &Host) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.conn()?
            .execute(
                r#"
                INSERT INTO hosts (
                  session_id, hostname, type, maintained, disabled, details,
                  created_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
                params![
                    session_id,
                    host.hostname,
                    host.kind.as_str(),
                    host.maintained,
                    host.disabled,
                    host.details,
                    now,
                    now,
                ],
            )
            .map_err(|e| map_insert_err("hosts", e))?;
        Ok(())
    }

    pub fn create_hosts(&self, session_id: &str, hostnames: &[String]) -> Result<()> {
        for hostname in hostnames {
            self.create_host(session_id, &Host::new(hostname))?;
        }
        Ok(())
    }

    pub fn hosts_get(&self, session_id: &str) -> Result<Vec<Host>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT hostname, type, maintained, disabled, details
            FROM hosts WHERE session_id = ?1 ORDER BY id
            "#,
        )?;
        let rows = stmt.query_map([session_id], |row| {
            Ok(Host {
                hostname: row.get(0)?,
                kind: HostType::parse(&row.get::<_, String>(1)?).map_err(to_sql_err)?,
                maintained: row.get(2)?,
                disabled: row.get(3)?,
                details: row.get(4)?,
            })
        })?;
        let mut hosts = Vec::new();
        for row in rows {
            hosts.push(row?);
        }
        Ok(hosts)
    }

    pub fn update_host(&self, session_id: &str, host: &Host) -> Result<()> {
        self.conn()?.execute(
            r#"
            UPDATE hosts SET type = ?1, maintained = ?2, disabled = ?3, details = ?4,
                             updated_at = ?5
            WHERE session_id = ?6 AND hostname = ?7
            "#,
            params![
                host.kind.as_str(),
                host.maintained,
                host.disabled,
                host.details,
                Utc::now().to_rfc3339(),
                session_id,
                host.hostname,
            ],
        )?;
        Ok(())
    }

    // ── projects ─────────────────────────────────────────────────────

    pub fn create_projects(&self, session_id: &str, project_ids: &[String]) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn()?;
        for project_id in project_ids {
            conn.execute(
                r#"
                INSERT INTO projects (session_id, project_id, state, created_at, updated_at)
                VALUES (?1, ?2, NULL, ?3, ?3)
                "#,
                params![session_id, project_id, now],
            )
            .map_err(|e| map_insert_err("projects", e))?;
        }
        Ok(())
    }

    pub fn projects_get(&self, session_id: &str) -> Result<Vec<Project>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT project_id, state FROM projects WHERE session_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map([session_id], |row| {
            let state: Option<String> = row.get(1)?;
            Ok(Project {
                project_id: row.get(0)?,
                state: state
                    .map(|s| ProjectState::parse(&s).map_err(to_sql_err))
                    .transpose()?,
            })
        })?;
        let mut projects = Vec::new();
        for row in rows {
            projects.push(row?);
        }
        Ok(projects)
    }

    pub fn set_project_state(
        &self,
        session_id: &str,
        project_id: &str,
        state: Option<&ProjectState>,
    ) -> Result<()> {
        self.conn()?.execute(
            r#"
            UPDATE projects SET state = ?1, updated_at = ?2
            WHERE session_id = ?3 AND project_id = ?4
            "#,
            params![
                state.map(ProjectState::to_string),
                Utc::now().to_rfc3339(),
                session_id,
                project_id,
            ],
        )?;
        Ok(())
    }

    // ── instances ────────────────────────────────────────────────────

    pub fn create_instance(&self, session_id: &str, instance: &Instance) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.conn()?
            .execute(
                r#"
                INSERT INTO instances (
                  session_id, instance_id, instance_name, project_id, host, state,
                  project_state, action, action_done, details, created_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)
                "#,
                params![
                    session_id,
                    instance.instance_id,
                    instance.instance_name,
                    instance.project_id,
                    instance.host,
                    instance.state,
                    instance.project_state.map(WorkflowState::as_str),
                    instance.action.map(Action::as_str),
                    instance.action_done,
                    instance.details,
                    now,
                ],
            )
            .map_err(|e| map_insert_err("instances", e))?;
        Ok(())
    }

    pub fn instances_get(&self, session_id: &str) -> Result<Vec<Instance>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT instance_id, instance_name, project_id, host, state,
                   project_state, action, action_done, details
            FROM instances WHERE session_id = ?1 ORDER BY id
            "#,
        )?;
        let rows = stmt.query_map([session_id], |row| {
            let project_state: Option<String> = row.get(5)?;
            let action: Option<String> = row.get(6)?;
            Ok(Instance {
                instance_id: row.get(0)?,
                instance_name: row.get(1)?,
                project_id: row.get(2)?,
                host: row.get(3)?,
                state: row.get(4)?,
                project_state: project_state
                    .map(|s| WorkflowState::parse(&s).map_err(to_sql_err))
                    .transpose()?,
                action: action
                    .map(|a| Action::parse(&a).map_err(to_sql_err))
                    .transpose()?,
                action_done: row.get(7)?,
                details: row.get(8)?,
            })
        })?;
        let mut instances = Vec::new();
        for row in rows {
            instances.push(row?);
        }
        Ok(instances)
    }

    pub fn update_instance(&self, session_id: &str, instance: &Instance) -> Result<()> {
        self.conn()?.execute(
            r#"
            UPDATE instances SET instance_name = ?1, project_id = ?2, host = ?3,
                                 state = ?4, project_state = ?5, action = ?6,
                                 action_done = ?7, details = ?8, updated_at = ?9
            WHERE session_id = ?10 AND instance_id = ?11
            "#,
            params![
                instance.instance_name,
                instance.project_id,
                instance.host,
                instance.state,
                instance.project_state.map(WorkflowState::as_str),
                instance.action.map(Action::as_str),
                instance.action_done,
                instance.details,
                Utc::now().to_rfc3339(),
                session_id,
                instance.instance_id,
            ],
        )?;
        Ok(())
    }

    pub fn remove_instance(&self, session_id: &str, instance_id: &str) -> Result<()> {
        let deleted = self.conn()?.execute(
            "DELETE FROM instances WHERE session_id = ?1 AND instance_id = ?2",
            params![session_id, instance_id],
        )?;
        if deleted == 0 {
            return Err(DrydockError::NotFound {
                model: "instances",
                id: instance_id.to_string(),
            });
        }
        Ok(())
    }

    // ── action plugins ───────────────────────────────────────────────

    pub fn create_action_plugins(&self, session_id: &str, plugins: &[ActionPlugin]) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn()?;
        for plugin in plugins {
            conn.execute(
                r#"
                INSERT INTO action_plugins (session_id, plugin, type, state, meta,
                                            created_at, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
                "#,
                params![
                    session_id,
                    plugin.plugin,
                    plugin.kind.as_str(),
                    plugin.state,
                    plugin.meta,
                    now,
                ],
            )
            .map_err(|e| map_insert_err("action_plugins", e))?;
        }
        Ok(())
    }

    pub fn action_plugins_get(&self, session_id: &str) -> Result<Vec<ActionPlugin>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT plugin, type, state, meta FROM action_plugins WHERE session_id = ?1 ORDER BY plugin",
        )?;
        let rows = stmt.query_map([session_id], |row| {
            Ok(ActionPlugin {
                plugin: row.get(0)?,
                kind: ActionType::parse(&row.get::<_, String>(1)?).map_err(to_sql_err)?,
                state: row.get(2)?,
                meta: row.get(3)?,
            })
        })?;
        let mut plugins = Vec::new();
        for row in rows {
            plugins.push(row?);
        }
        Ok(plugins)
    }

    pub fn create_action_plugin_instance(
        &self,
        session_id: &str,
        plugin: &str,
        hostname: &str,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.conn()?
            .execute(
                r#"
                INSERT INTO action_plugin_instances (session_id, plugin, hostname, state,
                                                     created_at, updated_at)
                VALUES (?1, ?2, ?3, NULL, ?4, ?4)
                "#,
                params![session_id, plugin, hostname, now],
            )
            .map_err(|e| map_insert_err("action_plugin_instances", e))?;
        Ok(())
    }

    pub fn set_action_plugin_instance_state(
        &self,
        session_id: &str,
        plugin: &str,
        hostname: &str,
        state: &str,
    ) -> Result<()> {
        self.conn()?.execute(
            r#"
            UPDATE action_plugin_instances SET state = ?1, updated_at = ?2
            WHERE session_id = ?3 AND plugin = ?4 AND hostname = ?5
            "#,
            params![state, Utc::now().to_rfc3339(), session_id, plugin, hostname],
        )?;
        Ok(())
    }

    pub fn action_plugin_instances_get(
        &self,
        session_id: &str,
    ) -> Result<Vec<ActionPluginInstance>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT plugin, hostname, state FROM action_plugin_instances
            WHERE session_id = ?1 ORDER BY id
            "#,
        )?;
        let rows = stmt.query_map([session_id], |row| {
            Ok(ActionPluginInstance {
                plugin: row.get(0)?,
                hostname: row.get(1)?,
                state: row.get(2)?,
            })
        })?;
        let mut instances = Vec::new();
        for row in rows {
            instances.push(row?);
        }
        Ok(instances)
    }

    /// Row counts per table for a session, in closure-delete order.
    pub fn session_row_counts(&self, session_id: &str) -> Result<[usize; 6]> {
        let conn = self.conn()?;
        let mut counts = [0usize; 6];
        for (slot, table) in [
            "action_plugin_instances",
            "action_plugins",
            "hosts",
            "projects",
            "instances",
            "sessions",
        ]
        .iter()
        .enumerate()
        {
            counts[slot] = conn.query_row(
                &format!("SELECT COUNT(*) FROM {} WHERE session_id = ?1", table),
                [session_id],
                |row| row.get::<_, i64>(0),
            )? as usize;
        }
        Ok(counts)
    }
}

fn map_insert_err(model: &'static str, err: rusqlite::Error) -> DrydockError {
    if let rusqlite::Error::SqliteFailure(code, Some(message)) = &err {
        if code.code == rusqlite::ErrorCode::ConstraintViolation {
            let columns = message
                .splitn(2, ": ")
                .nth(1)
                .unwrap_or(message)
                .to_string();
            return DrydockError::Duplicate { model, columns };
        }
    }
    DrydockError::Database(err)
}

fn parse_rfc3339(value: &str) -> Result<DateTime<Utc>> {
    chrono::DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DrydockError::Internal(format!("invalid timestamp '{}': {}", value, e)))
}

fn to_sql_err(err: DrydockError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(err))
}
