//! C2: the transactional persistence contract. `SqliteRepository` is the
//! concrete implementation backing `Repository`, following the teacher's
//! `Database` struct (a thin wrapper around a single `rusqlite::Connection`)
//! but with real transactions via `Connection::transaction()` instead of
//! one-statement-at-a-time execution.

use crate::error::{CoreError, CoreResult};
use crate::models::{
    Connection as GraphConnection, ConnectionType, DecisionOption, Execution, ExecutionStatus,
    NavigationActionType, NavigationEvent, Outcome, ResourceKind, Step, StepExecution,
    StepExecutionStatus, StepResource, StepType, Visibility, Workflow, WorkflowStatus,
};
use crate::value::{value_map_from_json, value_map_to_json, ValueMap};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    pub eager_children: bool,
}

#[derive(Debug, Clone, Default)]
pub struct WorkflowFilter {
    pub text: Option<String>,
    pub status: Option<WorkflowStatus>,
    pub is_template: Option<bool>,
    pub difficulty_level: Option<String>,
    pub created_by: Option<String>,
    pub project_id: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct Page {
    pub offset: usize,
    pub limit: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ExecutionFilter {
    pub workflow_id: Option<String>,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ExecutionStatistics {
    pub total_count: i64,
    pub completed_count: i64,
    pub mean_duration_minutes: Option<f64>,
    pub top_outcome_id: Option<String>,
}

fn status_to_str(s: WorkflowStatus) -> &'static str {
    s.as_str()
}

fn status_from_str(s: &str) -> CoreResult<WorkflowStatus> {
    Ok(match s {
        "draft" => WorkflowStatus::Draft,
        "active" => WorkflowStatus::Active,
        "published" => WorkflowStatus::Published,
        "archived" => WorkflowStatus::Archived,
        other => return Err(CoreError::Internal(format!("unknown workflow status '{}'", other))),
    })
}

fn visibility_to_str(v: Visibility) -> &'static str {
    match v {
        Visibility::Private => "private",
        Visibility::Public => "public",
        Visibility::Shared => "shared",
        Visibility::System => "system",
    }
}

fn visibility_from_str(s: &str) -> CoreResult<Visibility> {
    Ok(match s {
        "private" => Visibility::Private,
        "public" => Visibility::Public,
        "shared" => Visibility::Shared,
        "system" => Visibility::System,
        other => return Err(CoreError::Internal(format!("unknown visibility '{}'", other))),
    })
}

fn step_type_to_str(t: StepType) -> &'static str {
    match t {
        StepType::Instruction => "instruction",
        StepType::Material => "material",
        StepType::Tool => "tool",
        StepType::Time => "time",
        StepType::Decision => "decision",
        StepType::Outcome => "outcome",
    }
}

fn step_type_from_str(s: &str) -> CoreResult<StepType> {
    Ok(match s {
        "instruction" => StepType::Instruction,
        "material" => StepType::Material,
        "tool" => StepType::Tool,
        "time" => StepType::Time,
        "decision" => StepType::Decision,
        "outcome" => StepType::Outcome,
        other => return Err(CoreError::Internal(format!("unknown step type '{}'", other))),
    })
}

fn connection_type_to_str(t: ConnectionType) -> &'static str {
    match t {
        ConnectionType::Sequential => "sequential",
        ConnectionType::Conditional => "conditional",
        ConnectionType::Decision => "decision",
        ConnectionType::Parallel => "parallel",
    }
}

fn connection_type_from_str(s: &str) -> CoreResult<ConnectionType> {
    Ok(match s {
        "sequential" => ConnectionType::Sequential,
        "conditional" => ConnectionType::Conditional,
        "decision" => ConnectionType::Decision,
        "parallel" => ConnectionType::Parallel,
        other => return Err(CoreError::Internal(format!("unknown connection type '{}'", other))),
    })
}

fn resource_kind_to_str(k: ResourceKind) -> &'static str {
    match k {
        ResourceKind::Material => "material",
        ResourceKind::Tool => "tool",
        ResourceKind::Documentation => "documentation",
    }
}

fn resource_kind_from_str(s: &str) -> CoreResult<ResourceKind> {
    Ok(match s {
        "material" => ResourceKind::Material,
        "tool" => ResourceKind::Tool,
        "documentation" => ResourceKind::Documentation,
        other => return Err(CoreError::Internal(format!("unknown resource kind '{}'", other))),
    })
}

fn execution_status_to_str(s: ExecutionStatus) -> &'static str {
    s.as_str()
}

fn execution_status_from_str(s: &str) -> CoreResult<ExecutionStatus> {
    Ok(match s {
        "active" => ExecutionStatus::Active,
        "paused" => ExecutionStatus::Paused,
        "completed" => ExecutionStatus::Completed,
        "cancelled" => ExecutionStatus::Cancelled,
        "failed" => ExecutionStatus::Failed,
        other => return Err(CoreError::Internal(format!("unknown execution status '{}'", other))),
    })
}

fn step_exec_status_to_str(s: StepExecutionStatus) -> &'static str {
    s.as_str()
}

fn step_exec_status_from_str(s: &str) -> CoreResult<StepExecutionStatus> {
    Ok(match s {
        "ready" => StepExecutionStatus::Ready,
        "active" => StepExecutionStatus::Active,
        "completed" => StepExecutionStatus::Completed,
        "skipped" => StepExecutionStatus::Skipped,
        "failed" => StepExecutionStatus::Failed,
        other => return Err(CoreError::Internal(format!("unknown step execution status '{}'", other))),
    })
}

fn nav_action_to_str(a: NavigationActionType) -> &'static str {
    a.as_str()
}

fn nav_action_from_str(s: &str) -> CoreResult<NavigationActionType> {
    Ok(match s {
        "navigate_to" => NavigationActionType::NavigateTo,
        "started" => NavigationActionType::Started,
        "completed" => NavigationActionType::Completed,
        "decision_made" => NavigationActionType::DecisionMade,
        "paused" => NavigationActionType::Paused,
        "resumed" => NavigationActionType::Resumed,
        "cancelled" => NavigationActionType::Cancelled,
        "skipped" => NavigationActionType::Skipped,
        "workflow_completed" => NavigationActionType::WorkflowCompleted,
        "failed" => NavigationActionType::Failed,
        other => return Err(CoreError::Internal(format!("unknown navigation action '{}'", other))),
    })
}

/// A single execution-lifecycle write queued for atomic commit. The engine
/// (§4.5) builds one of these per state change it decides on in memory, then
/// hands the whole batch to `Repository::commit` so a logical operation such
/// as `CompleteStep` lands as one transaction instead of one per row.
#[derive(Debug, Clone)]
pub enum PendingWrite {
    CreateExecution(Execution),
    UpdateExecution { execution: Execution, expected_version: i64 },
    UpsertStepExecution(StepExecution),
    AppendNavigation(NavigationEvent),
}

/// The transactional persistence contract described in §4.2. A trait so
/// engine/navigator/coordinator code can be exercised against an in-memory
/// fake in tests without spinning up SQLite.
pub trait Repository {
    fn load_workflow(&self, id: &str, opts: &LoadOptions) -> CoreResult<Option<Workflow>>;
    fn save_workflow(&self, workflow: &Workflow) -> CoreResult<()>;
    fn search_workflows(&self, filter: &WorkflowFilter, page: Page) -> CoreResult<(Vec<Workflow>, usize)>;
    fn delete_workflow(&self, id: &str) -> CoreResult<()>;

    fn load_execution(&self, id: Uuid) -> CoreResult<Option<(Execution, Vec<StepExecution>, Vec<NavigationEvent>)>>;
    fn create_execution(&self, execution: &Execution) -> CoreResult<()>;
    fn update_execution(&self, execution: &Execution, expected_version: i64) -> CoreResult<()>;
    fn upsert_step_execution(&self, step_execution: &StepExecution) -> CoreResult<()>;
    fn append_navigation(&self, event: &NavigationEvent) -> CoreResult<()>;
    /// Commits every write in `writes`, in order, as a single transaction
    /// (§4.2): if an `UpdateExecution` entry's version check fails, the whole
    /// batch rolls back and no partial state — including no NavigationEvent —
    /// is observed (§4.5.9). This is what lets a logical engine operation that
    /// touches several rows (a step_execution, one or two navigation_events,
    /// the execution itself) commit atomically.
    fn commit(&self, writes: Vec<PendingWrite>) -> CoreResult<()>;
    fn list_active_executions(&self, filter: &ExecutionFilter) -> CoreResult<Vec<Execution>>;
    fn execution_statistics(&self, workflow_id: &str) -> CoreResult<ExecutionStatistics>;
    fn has_non_terminal_executions(&self, workflow_id: &str) -> CoreResult<bool>;
}

pub struct SqliteRepository {
    conn: Mutex<Connection>,
}

impl SqliteRepository {
    pub fn new<P: AsRef<Path>>(path: P, config: &crate::config::DatabaseConfig) -> CoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_millis(config.busy_timeout_ms))?;
        let repo = Self {
            conn: Mutex::new(conn),
        };
        repo.init_schema()?;
        Ok(repo)
    }

    pub fn in_memory() -> CoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        let repo = Self {
            conn: Mutex::new(conn),
        };
        repo.init_schema()?;
        Ok(repo)
    }

    /// `ON DELETE CASCADE` is declared in schema.sql but SQLite ignores it
    /// unless foreign key enforcement is turned on per connection.
    fn init_schema(&self) -> CoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(include_str!("schema.sql"))?;
        Ok(())
    }

    /// Runs `f` inside a single SQLite transaction; on error the transaction
    /// rolls back and no partial state is observed. `commit` is the main
    /// caller for execution-lifecycle writes; `save_workflow`/`delete_workflow`
    /// use it directly for their own multi-statement bodies.
    pub fn transaction<T>(&self, f: impl FnOnce(&rusqlite::Transaction) -> CoreResult<T>) -> CoreResult<T> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }

    fn load_steps(tx: &rusqlite::Connection, workflow_id: &str) -> CoreResult<Vec<Step>> {
        let mut stmt = tx.prepare(
            "SELECT id, workflow_id, name, instructions, display_order, step_type, estimated_duration, \
             parent_step_id, is_milestone, is_decision_point, is_outcome, condition_logic \
             FROM steps WHERE workflow_id = ?1 ORDER BY display_order ASC",
        )?;
        let rows = stmt.query_map(params![workflow_id], |row| Self::row_to_step(row))?;
        let mut steps = Vec::new();
        for row in rows {
            steps.push(row??);
        }
        for step in steps.iter_mut() {
            step.resources = Self::load_resources(tx, &step.id)?;
            step.decision_options = Self::load_decision_options(tx, &step.id)?;
            step.outgoing_connections = Self::load_connections(tx, &step.id)?;
        }
        Ok(steps)
    }

    fn row_to_step(row: &Row) -> rusqlite::Result<CoreResult<Step>> {
        let step_type_str: String = row.get(5)?;
        let step_type = match step_type_from_str(&step_type_str) {
            Ok(t) => t,
            Err(e) => return Ok(Err(e)),
        };
        Ok(Ok(Step {
            id: row.get(0)?,
            workflow_id: row.get(1)?,
            name: row.get(2)?,
            instructions: row.get(3)?,
            display_order: row.get(4)?,
            step_type,
            estimated_duration: row.get(6)?,
            parent_step_id: row.get(7)?,
            is_milestone: row.get::<_, i64>(8)? != 0,
            is_decision_point: row.get::<_, i64>(9)? != 0,
            is_outcome: row.get::<_, i64>(10)? != 0,
            condition_logic: row.get(11)?,
            resources: Vec::new(),
            decision_options: Vec::new(),
            outgoing_connections: Vec::new(),
        }))
    }

    fn load_resources(tx: &rusqlite::Connection, step_id: &str) -> CoreResult<Vec<StepResource>> {
        let mut stmt = tx.prepare(
            "SELECT id, step_id, resource_kind, material_id, tool_id, documentation_id, quantity, unit, is_optional \
             FROM step_resources WHERE step_id = ?1",
        )?;
        let rows = stmt.query_map(params![step_id], |row| {
            let kind_str: String = row.get(2)?;
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                kind_str,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, Option<f64>>(6)?,
                row.get::<_, Option<String>>(7)?,
                row.get::<_, i64>(8)?,
            ))
        })?;
        let mut resources = Vec::new();
        for row in rows {
            let (id, step_id, kind_str, material_id, tool_id, documentation_id, quantity, unit, is_optional) = row?;
            resources.push(StepResource {
                id,
                step_id,
                resource_kind: resource_kind_from_str(&kind_str)?,
                material_id,
                tool_id,
                documentation_id,
                quantity,
                unit,
                is_optional: is_optional != 0,
            });
        }
        Ok(resources)
    }

    fn load_decision_options(tx: &rusqlite::Connection, step_id: &str) -> CoreResult<Vec<DecisionOption>> {
        let mut stmt = tx.prepare(
            "SELECT id, step_id, option_text, result_action, display_order, is_default \
             FROM decision_options WHERE step_id = ?1 ORDER BY display_order ASC",
        )?;
        let rows = stmt.query_map(params![step_id], |row| {
            Ok(DecisionOption {
                id: row.get(0)?,
                step_id: row.get(1)?,
                option_text: row.get(2)?,
                result_action: row.get(3)?,
                display_order: row.get(4)?,
                is_default: row.get::<_, i64>(5)? != 0,
            })
        })?;
        let mut options = Vec::new();
        for row in rows {
            options.push(row?);
        }
        Ok(options)
    }

    fn load_connections(tx: &rusqlite::Connection, step_id: &str) -> CoreResult<Vec<GraphConnection>> {
        let mut stmt = tx.prepare(
            "SELECT id, source_step_id, target_step_id, connection_type, condition, display_order, is_default \
             FROM connections WHERE source_step_id = ?1 ORDER BY display_order ASC",
        )?;
        let rows = stmt.query_map(params![step_id], |row| {
            let ct: String = row.get(3)?;
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                ct,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, i64>(5)?,
                row.get::<_, i64>(6)?,
            ))
        })?;
        let mut conns = Vec::new();
        for row in rows {
            let (id, source_step_id, target_step_id, ct, condition, display_order, is_default) = row?;
            conns.push(GraphConnection {
                id,
                source_step_id,
                target_step_id,
                connection_type: connection_type_from_str(&ct)?,
                condition,
                display_order,
                is_default: is_default != 0,
            });
        }
        Ok(conns)
    }

    fn load_outcomes(tx: &rusqlite::Connection, workflow_id: &str) -> CoreResult<Vec<Outcome>> {
        let mut stmt = tx.prepare(
            "SELECT id, workflow_id, name, display_order, is_default, success_criteria \
             FROM outcomes WHERE workflow_id = ?1 ORDER BY display_order ASC",
        )?;
        let rows = stmt.query_map(params![workflow_id], |row| {
            Ok(Outcome {
                id: row.get(0)?,
                workflow_id: row.get(1)?,
                name: row.get(2)?,
                display_order: row.get(3)?,
                is_default: row.get::<_, i64>(4)? != 0,
                success_criteria: row.get(5)?,
            })
        })?;
        let mut outcomes = Vec::new();
        for row in rows {
            outcomes.push(row?);
        }
        Ok(outcomes)
    }

    fn row_to_workflow(tx: &rusqlite::Connection, row: &Row) -> CoreResult<Workflow> {
        let status_str: String = row.get(3)?;
        let visibility_str: String = row.get(8)?;
        let id: String = row.get(0)?;
        let mut workflow = Workflow {
            id: id.clone(),
            name: row.get(1)?,
            description: row.get(2)?,
            status: status_from_str(&status_str)?,
            created_by: row.get(4)?,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
            is_template: row.get::<_, i64>(7)? != 0,
            visibility: visibility_from_str(&visibility_str)?,
            version: row.get(9)?,
            has_multiple_outcomes: row.get::<_, i64>(10)? != 0,
            estimated_duration: row.get(11)?,
            difficulty_level: row.get(12)?,
            project_id: row.get(13)?,
            theme_id: row.get(14)?,
            steps: Vec::new(),
            outcomes: Vec::new(),
        };
        workflow.steps = Self::load_steps(tx, &id)?;
        workflow.outcomes = Self::load_outcomes(tx, &id)?;
        Ok(workflow)
    }

    const WORKFLOW_SELECT: &'static str = "SELECT id, name, description, status, created_by, created_at, updated_at, \
         is_template, visibility, version, has_multiple_outcomes, estimated_duration, \
         difficulty_level, project_id, theme_id FROM workflows";

    fn save_workflow_tx(tx: &rusqlite::Transaction, workflow: &Workflow) -> CoreResult<()> {
        tx.execute(
            "INSERT INTO workflows (id, name, description, status, created_by, created_at, updated_at, \
             is_template, visibility, version, has_multiple_outcomes, estimated_duration, difficulty_level, \
             project_id, theme_id) \
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15) \
             ON CONFLICT(id) DO UPDATE SET name=excluded.name, description=excluded.description, \
             status=excluded.status, updated_at=excluded.updated_at, is_template=excluded.is_template, \
             visibility=excluded.visibility, version=excluded.version, \
             has_multiple_outcomes=excluded.has_multiple_outcomes, estimated_duration=excluded.estimated_duration, \
             difficulty_level=excluded.difficulty_level, project_id=excluded.project_id, theme_id=excluded.theme_id",
            params![
                workflow.id,
                workflow.name,
                workflow.description,
                status_to_str(workflow.status),
                workflow.created_by,
                workflow.created_at.to_rfc3339(),
                workflow.updated_at.to_rfc3339(),
                workflow.is_template as i64,
                visibility_to_str(workflow.visibility),
                workflow.version,
                workflow.has_multiple_outcomes as i64,
                workflow.estimated_duration,
                workflow.difficulty_level,
                workflow.project_id,
                workflow.theme_id,
            ],
        )?;

        // Cascade: replace children wholesale. Simpler and safer than a diff
        // against prior state, and each workflow's child set is small.
        tx.execute("DELETE FROM connections WHERE source_step_id IN (SELECT id FROM steps WHERE workflow_id = ?1)", params![workflow.id])?;
        tx.execute("DELETE FROM decision_options WHERE step_id IN (SELECT id FROM steps WHERE workflow_id = ?1)", params![workflow.id])?;
        tx.execute("DELETE FROM step_resources WHERE step_id IN (SELECT id FROM steps WHERE workflow_id = ?1)", params![workflow.id])?;
        tx.execute("DELETE FROM steps WHERE workflow_id = ?1", params![workflow.id])?;
        tx.execute("DELETE FROM outcomes WHERE workflow_id = ?1", params![workflow.id])?;

        for step in &workflow.steps {
            tx.execute(
                "INSERT INTO steps (id, workflow_id, name, instructions, display_order, step_type, \
                 estimated_duration, parent_step_id, is_milestone, is_decision_point, is_outcome, condition_logic) \
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12)",
                params![
                    step.id,
                    step.workflow_id,
                    step.name,
                    step.instructions,
                    step.display_order,
                    step_type_to_str(step.step_type),
                    step.estimated_duration,
                    step.parent_step_id,
                    step.is_milestone as i64,
                    step.is_decision_point as i64,
                    step.is_outcome as i64,
                    step.condition_logic,
                ],
            )?;
            for resource in &step.resources {
                tx.execute(
                    "INSERT INTO step_resources (id, step_id, resource_kind, material_id, tool_id, \
                     documentation_id, quantity, unit, is_optional) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
                    params![
                        resource.id,
                        resource.step_id,
                        resource_kind_to_str(resource.resource_kind),
                        resource.material_id,
                        resource.tool_id,
                        resource.documentation_id,
                        resource.quantity,
                        resource.unit,
                        resource.is_optional as i64,
                    ],
                )?;
            }
            for option in &step.decision_options {
                tx.execute(
                    "INSERT INTO decision_options (id, step_id, option_text, result_action, display_order, is_default) \
                     VALUES (?1,?2,?3,?4,?5,?6)",
                    params![
                        option.id,
                        option.step_id,
                        option.option_text,
                        option.result_action,
                        option.display_order,
                        option.is_default as i64,
                    ],
                )?;
            }
            for conn in &step.outgoing_connections {
                tx.execute(
                    "INSERT INTO connections (id, source_step_id, target_step_id, connection_type, condition, \
                     display_order, is_default) VALUES (?1,?2,?3,?4,?5,?6,?7)",
                    params![
                        conn.id,
                        conn.source_step_id,
                        conn.target_step_id,
                        connection_type_to_str(conn.connection_type),
                        conn.condition,
                        conn.display_order,
                        conn.is_default as i64,
                    ],
                )?;
            }
        }

        for outcome in &workflow.outcomes {
            tx.execute(
                "INSERT INTO outcomes (id, workflow_id, name, display_order, is_default, success_criteria) \
                 VALUES (?1,?2,?3,?4,?5,?6)",
                params![
                    outcome.id,
                    outcome.workflow_id,
                    outcome.name,
                    outcome.display_order,
                    outcome.is_default as i64,
                    outcome.success_criteria,
                ],
            )?;
        }

        Ok(())
    }

    fn row_to_execution(row: &Row) -> CoreResult<Execution> {
        let status_str: String = row.get(3)?;
        let data_str: String = row.get(7)?;
        Ok(Execution {
            id: Uuid::parse_str(&row.get::<_, String>(0)?)?,
            workflow_id: row.get(1)?,
            started_by: row.get(2)?,
            status: execution_status_from_str(&status_str)?,
            started_at: row.get(4)?,
            completed_at: row.get(5)?,
            selected_outcome_id: row.get(6)?,
            current_step_id: {
                let v: Option<String> = row.get(8)?;
                v
            },
            execution_data: value_map_from_json(&data_str)?,
            total_duration_minutes: row.get(9)?,
            version: row.get(10)?,
        })
    }

    fn row_to_step_execution(row: &Row) -> CoreResult<StepExecution> {
        let status_str: String = row.get(3)?;
        let data_str: String = row.get(7)?;
        Ok(StepExecution {
            id: Uuid::parse_str(&row.get::<_, String>(0)?)?,
            execution_id: Uuid::parse_str(&row.get::<_, String>(1)?)?,
            step_id: row.get(2)?,
            status: step_exec_status_from_str(&status_str)?,
            started_at: row.get(4)?,
            completed_at: row.get(5)?,
            actual_duration_minutes: row.get(6)?,
            step_data: value_map_from_json(&data_str)?,
        })
    }

    fn row_to_navigation_event(row: &Row) -> CoreResult<NavigationEvent> {
        let action_str: String = row.get(3)?;
        let data_str: String = row.get(4)?;
        Ok(NavigationEvent {
            id: Uuid::parse_str(&row.get::<_, String>(0)?)?,
            execution_id: Uuid::parse_str(&row.get::<_, String>(1)?)?,
            step_id: row.get(2)?,
            action_type: nav_action_from_str(&action_str)?,
            action_data: value_map_from_json(&data_str)?,
            timestamp: row.get(5)?,
        })
    }
}

impl Repository for SqliteRepository {
    fn load_workflow(&self, id: &str, _opts: &LoadOptions) -> CoreResult<Option<Workflow>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                &format!("{} WHERE id = ?1", Self::WORKFLOW_SELECT),
                params![id],
                |row| Ok(Self::row_to_workflow(&conn, row)),
            )
            .optional()?;
        row.transpose()
    }

    fn save_workflow(&self, workflow: &Workflow) -> CoreResult<()> {
        self.transaction(|tx| Self::save_workflow_tx(tx, workflow))
    }

    fn search_workflows(&self, filter: &WorkflowFilter, page: Page) -> CoreResult<(Vec<Workflow>, usize)> {
        let conn = self.conn.lock().unwrap();
        let mut clauses = Vec::new();
        let mut args: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if let Some(text) = &filter.text {
            clauses.push("(name LIKE ?1 OR description LIKE ?1)".to_string());
            args.push(Box::new(format!("%{}%", text)));
        }
        if let Some(status) = filter.status {
            clauses.push(format!("status = ?{}", args.len() + 1));
            args.push(Box::new(status_to_str(status).to_string()));
        }
        if let Some(is_template) = filter.is_template {
            clauses.push(format!("is_template = ?{}", args.len() + 1));
            args.push(Box::new(is_template as i64));
        }
        if let Some(difficulty) = &filter.difficulty_level {
            clauses.push(format!("difficulty_level = ?{}", args.len() + 1));
            args.push(Box::new(difficulty.clone()));
        }
        if let Some(created_by) = &filter.created_by {
            clauses.push(format!("created_by = ?{}", args.len() + 1));
            args.push(Box::new(created_by.clone()));
        }
        if let Some(project_id) = &filter.project_id {
            clauses.push(format!("project_id = ?{}", args.len() + 1));
            args.push(Box::new(project_id.clone()));
        }

        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };

        let count_sql = format!("SELECT COUNT(*) FROM workflows{}", where_clause);
        let param_refs: Vec<&dyn rusqlite::types::ToSql> = args.iter().map(|b| b.as_ref()).collect();
        let total: i64 = conn.query_row(&count_sql, param_refs.as_slice(), |row| row.get(0))?;

        let select_sql = format!(
            "{}{} ORDER BY created_at DESC LIMIT {} OFFSET {}",
            Self::WORKFLOW_SELECT,
            where_clause,
            page.limit,
            page.offset
        );
        let mut stmt = conn.prepare(&select_sql)?;
        let param_refs: Vec<&dyn rusqlite::types::ToSql> = args.iter().map(|b| b.as_ref()).collect();
        let rows = stmt.query_map(param_refs.as_slice(), |row| Ok(Self::row_to_workflow(&conn, row)))?;
        let mut workflows = Vec::new();
        for row in rows {
            workflows.push(row??);
        }
        Ok((workflows, total as usize))
    }

    fn delete_workflow(&self, id: &str) -> CoreResult<()> {
        if self.has_non_terminal_executions(id)? {
            return Err(CoreError::BusinessRule(format!(
                "workflow '{}' has non-terminal executions referencing it",
                id
            )));
        }
        self.transaction(|tx| {
            tx.execute("DELETE FROM workflows WHERE id = ?1", params![id])?;
            Ok(())
        })
    }

    fn load_execution(&self, id: Uuid) -> CoreResult<Option<(Execution, Vec<StepExecution>, Vec<NavigationEvent>)>> {
        let conn = self.conn.lock().unwrap();
        let execution = conn
            .query_row(
                "SELECT id, workflow_id, started_by, status, started_at, completed_at, selected_outcome_id, \
                 execution_data, current_step_id, total_duration_minutes, version FROM executions WHERE id = ?1",
                params![id.to_string()],
                |row| Ok(Self::row_to_execution(row)),
            )
            .optional()?;
        let execution = match execution {
            Some(e) => e?,
            None => return Ok(None),
        };

        let mut stmt = conn.prepare(
            "SELECT id, execution_id, step_id, status, started_at, completed_at, actual_duration_minutes, step_data \
             FROM step_executions WHERE execution_id = ?1",
        )?;
        let rows = stmt.query_map(params![id.to_string()], |row| Ok(Self::row_to_step_execution(row)))?;
        let mut step_executions = Vec::new();
        for row in rows {
            step_executions.push(row??);
        }

        let mut stmt = conn.prepare(
            "SELECT id, execution_id, step_id, action_type, action_data, timestamp \
             FROM navigation_events WHERE execution_id = ?1 ORDER BY timestamp ASC",
        )?;
        let rows = stmt.query_map(params![id.to_string()], |row| Ok(Self::row_to_navigation_event(row)))?;
        let mut events = Vec::new();
        for row in rows {
            events.push(row??);
        }

        Ok(Some((execution, step_executions, events)))
    }

    fn create_execution(&self, execution: &Execution) -> CoreResult<()> {
        self.commit(vec![PendingWrite::CreateExecution(execution.clone())])
    }

    fn update_execution(&self, execution: &Execution, expected_version: i64) -> CoreResult<()> {
        self.commit(vec![PendingWrite::UpdateExecution {
            execution: execution.clone(),
            expected_version,
        }])
    }

    fn upsert_step_execution(&self, step_execution: &StepExecution) -> CoreResult<()> {
        self.commit(vec![PendingWrite::UpsertStepExecution(step_execution.clone())])
    }

    fn append_navigation(&self, event: &NavigationEvent) -> CoreResult<()> {
        self.commit(vec![PendingWrite::AppendNavigation(event.clone())])
    }

    fn commit(&self, writes: Vec<PendingWrite>) -> CoreResult<()> {
        self.transaction(|tx| {
            for write in writes {
                match write {
                    PendingWrite::CreateExecution(execution) => {
                        tx.execute(
                            "INSERT INTO executions (id, workflow_id, started_by, status, started_at, completed_at, \
                             selected_outcome_id, current_step_id, execution_data, total_duration_minutes, version) \
                             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)",
                            params![
                                execution.id.to_string(),
                                execution.workflow_id,
                                execution.started_by,
                                execution_status_to_str(execution.status),
                                execution.started_at.to_rfc3339(),
                                execution.completed_at.map(|t| t.to_rfc3339()),
                                execution.selected_outcome_id,
                                execution.current_step_id,
                                value_map_to_json(&execution.execution_data)?,
                                execution.total_duration_minutes,
                                execution.version,
                            ],
                        )?;
                    }
                    PendingWrite::UpdateExecution { execution, expected_version } => {
                        let changed = tx.execute(
                            "UPDATE executions SET status=?1, completed_at=?2, selected_outcome_id=?3, current_step_id=?4, \
                             execution_data=?5, total_duration_minutes=?6, version=?7 \
                             WHERE id=?8 AND version=?9",
                            params![
                                execution_status_to_str(execution.status),
                                execution.completed_at.map(|t| t.to_rfc3339()),
                                execution.selected_outcome_id,
                                execution.current_step_id,
                                value_map_to_json(&execution.execution_data)?,
                                execution.total_duration_minutes,
                                execution.version,
                                execution.id.to_string(),
                                expected_version,
                            ],
                        )?;
                        if changed == 0 {
                            return Err(CoreError::Conflict(format!(
                                "execution '{}' was modified concurrently (expected version {})",
                                execution.id, expected_version
                            )));
                        }
                    }
                    PendingWrite::UpsertStepExecution(step_execution) => {
                        tx.execute(
                            "INSERT INTO step_executions (id, execution_id, step_id, status, started_at, completed_at, \
                             actual_duration_minutes, step_data) VALUES (?1,?2,?3,?4,?5,?6,?7,?8) \
                             ON CONFLICT(execution_id, step_id) DO UPDATE SET status=excluded.status, \
                             started_at=excluded.started_at, completed_at=excluded.completed_at, \
                             actual_duration_minutes=excluded.actual_duration_minutes, step_data=excluded.step_data",
                            params![
                                step_execution.id.to_string(),
                                step_execution.execution_id.to_string(),
                                step_execution.step_id,
                                step_exec_status_to_str(step_execution.status),
                                step_execution.started_at.map(|t| t.to_rfc3339()),
                                step_execution.completed_at.map(|t| t.to_rfc3339()),
                                step_execution.actual_duration_minutes,
                                value_map_to_json(&step_execution.step_data)?,
                            ],
                        )?;
                    }
                    PendingWrite::AppendNavigation(event) => {
                        tx.execute(
                            "INSERT INTO navigation_events (id, execution_id, step_id, action_type, action_data, timestamp) \
                             VALUES (?1,?2,?3,?4,?5,?6)",
                            params![
                                event.id.to_string(),
                                event.execution_id.to_string(),
                                event.step_id,
                                nav_action_to_str(event.action_type),
                                value_map_to_json(&event.action_data)?,
                                event.timestamp.to_rfc3339(),
                            ],
                        )?;
                    }
                }
            }
            Ok(())
        })
    }

    fn list_active_executions(&self, filter: &ExecutionFilter) -> CoreResult<Vec<Execution>> {
        let conn = self.conn.lock().unwrap();
        let sql = if filter.workflow_id.is_some() {
            "SELECT id, workflow_id, started_by, status, started_at, completed_at, selected_outcome_id, \
             execution_data, current_step_id, total_duration_minutes, version FROM executions \
             WHERE status IN ('active','paused') AND workflow_id = ?1"
        } else {
            "SELECT id, workflow_id, started_by, status, started_at, completed_at, selected_outcome_id, \
             execution_data, current_step_id, total_duration_minutes, version FROM executions \
             WHERE status IN ('active','paused')"
        };
        let mut stmt = conn.prepare(sql)?;
        let rows = if let Some(workflow_id) = &filter.workflow_id {
            stmt.query_map(params![workflow_id], |row| Ok(Self::row_to_execution(row)))?
        } else {
            stmt.query_map([], |row| Ok(Self::row_to_execution(row)))?
        };
        let mut executions = Vec::new();
        for row in rows {
            executions.push(row??);
        }
        Ok(executions)
    }

    fn execution_statistics(&self, workflow_id: &str) -> CoreResult<ExecutionStatistics> {
        let conn = self.conn.lock().unwrap();
        let total: i64 = conn.query_row(
            "SELECT COUNT(*) FROM executions WHERE workflow_id = ?1",
            params![workflow_id],
            |row| row.get(0),
        )?;
        let completed: i64 = conn.query_row(
            "SELECT COUNT(*) FROM executions WHERE workflow_id = ?1 AND status = 'completed'",
            params![workflow_id],
            |row| row.get(0),
        )?;
        let mean_duration: Option<f64> = conn.query_row(
            "SELECT AVG(total_duration_minutes) FROM executions WHERE workflow_id = ?1 AND total_duration_minutes IS NOT NULL",
            params![workflow_id],
            |row| row.get(0),
        ).optional()?.flatten();
        let top_outcome: Option<String> = conn
            .query_row(
                "SELECT selected_outcome_id FROM executions WHERE workflow_id = ?1 AND selected_outcome_id IS NOT NULL \
                 GROUP BY selected_outcome_id ORDER BY COUNT(*) DESC LIMIT 1",
                params![workflow_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(ExecutionStatistics {
            total_count: total,
            completed_count: completed,
            mean_duration_minutes: mean_duration,
            top_outcome_id: top_outcome,
        })
    }

    fn has_non_terminal_executions(&self, workflow_id: &str) -> CoreResult<bool> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM executions WHERE workflow_id = ?1 AND status IN ('active','paused')",
            params![workflow_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Connection as GraphConn, ConnectionType, Step, Workflow};

    fn sample_workflow() -> Workflow {
        let mut wf = Workflow::new("wf-1", "Sample", "user-1");
        let mut a = Step::new("a", "wf-1", "A", 1);
        let mut c = Step::new("c", "wf-1", "C", 2);
        c.is_outcome = true;
        a.outgoing_connections.push(
            GraphConn::new("conn-1", "a", "c", ConnectionType::Sequential, 1).unwrap(),
        );
        wf.steps = vec![a, c];
        wf
    }

    #[test]
    fn save_and_load_round_trips_the_graph() {
        let repo = SqliteRepository::in_memory().unwrap();
        let wf = sample_workflow();
        repo.save_workflow(&wf).unwrap();

        let loaded = repo.load_workflow("wf-1", &LoadOptions::default()).unwrap().unwrap();
        assert_eq!(loaded.steps.len(), 2, "both steps should round-trip");
        assert_eq!(loaded.steps[0].outgoing_connections.len(), 1);
    }

    #[test]
    fn delete_refuses_with_active_execution() {
        let repo = SqliteRepository::in_memory().unwrap();
        let wf = sample_workflow();
        repo.save_workflow(&wf).unwrap();

        let execution = Execution::new("wf-1", "user-1");
        repo.create_execution(&execution).unwrap();

        let result = repo.delete_workflow("wf-1");
        assert!(result.is_err(), "delete should refuse while an active execution references the workflow");
    }

    #[test]
    fn update_execution_detects_version_conflict() {
        let repo = SqliteRepository::in_memory().unwrap();
        let wf = sample_workflow();
        repo.save_workflow(&wf).unwrap();

        let mut execution = Execution::new("wf-1", "user-1");
        repo.create_execution(&execution).unwrap();

        execution.version = 1;
        let result = repo.update_execution(&execution, 5);
        assert!(matches!(result, Err(CoreError::Conflict(_))));
    }

    #[test]
    fn navigation_events_are_appended_in_order() {
        use crate::models::NavigationActionType;
        let repo = SqliteRepository::in_memory().unwrap();
        let wf = sample_workflow();
        repo.save_workflow(&wf).unwrap();
        let execution = Execution::new("wf-1", "user-1");
        repo.create_execution(&execution).unwrap();

        let e1 = NavigationEvent::new(execution.id, Some("a".to_string()), NavigationActionType::Started, ValueMap::new());
        repo.append_navigation(&e1).unwrap();
        let e2 = NavigationEvent::new(execution.id, Some("a".to_string()), NavigationActionType::Completed, ValueMap::new());
        repo.append_navigation(&e2).unwrap();

        let (_, _, events) = repo.load_execution(execution.id).unwrap().unwrap();
        assert_eq!(events.len(), 2);
        assert!(events[0].timestamp <= events[1].timestamp);
    }
}
