// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQL dialect strategy and the statements rendered from it.
//!
//! Statements are written once with PostgreSQL-style numbered placeholders
//! (`$1`, `$2`, ...) and rendered per dialect when a backend is created.

use super::InstanceQuery;

/// Database-specific SQL fragments.
pub trait SqlDialect: Send + Sync {
    fn name(&self) -> &'static str;

    /// Placeholder for the 1-based bind parameter `index`.
    fn param(&self, index: usize) -> String;

    /// Expression for the earlier of two nullable timestamps.
    ///
    /// `NULL` only when both are `NULL`; otherwise the non-null or earliest value.
    fn earliest(&self, a: &str, b: &str) -> String;

    /// Row-locking clause that skips rows locked by other transactions, if supported.
    fn skip_locked(&self) -> Option<&'static str>;

    /// Replace `$n` placeholders in `sql` with this dialect's syntax.
    fn render(&self, sql: &str) -> String {
        let mut out = String::with_capacity(sql.len());
        let mut chars = sql.chars().peekable();
        while let Some(c) = chars.next() {
            if c != '$' {
                out.push(c);
                continue;
            }
            let mut digits = String::new();
            while let Some(d) = chars.peek().copied().filter(char::is_ascii_digit) {
                digits.push(d);
                chars.next();
            }
            match digits.parse::<usize>() {
                Ok(index) => out.push_str(&self.param(index)),
                Err(_) => {
                    out.push('$');
                    out.push_str(&digits);
                }
            }
        }
        out
    }
}

/// PostgreSQL: `$n` placeholders, `LEAST`, `FOR UPDATE SKIP LOCKED`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresDialect;

impl SqlDialect for PostgresDialect {
    fn name(&self) -> &'static str {
        "postgresql"
    }

    fn param(&self, index: usize) -> String {
        format!("${}", index)
    }

    fn earliest(&self, a: &str, b: &str) -> String {
        // LEAST ignores NULL arguments.
        format!("LEAST({}, {})", a, b)
    }

    fn skip_locked(&self) -> Option<&'static str> {
        Some("FOR UPDATE SKIP LOCKED")
    }

    fn render(&self, sql: &str) -> String {
        sql.to_string()
    }
}

/// SQLite: `?n` placeholders, no row locks. Writers are serialized by the database lock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteDialect;

impl SqlDialect for SqliteDialect {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn param(&self, index: usize) -> String {
        format!("?{}", index)
    }

    fn earliest(&self, a: &str, b: &str) -> String {
        // Timestamps are stored as RFC 3339 UTC text, which orders lexically.
        format!(
            "CASE WHEN {a} IS NULL THEN {b} WHEN {b} IS NULL THEN {a} WHEN {a} <= {b} THEN {a} ELSE {b} END"
        )
    }

    fn skip_locked(&self) -> Option<&'static str> {
        None
    }
}

pub(crate) const INSTANCE_COLUMNS: &str = "id, workflow_type, external_id, business_key, \
    parent_workflow_id, parent_action_id, root_workflow_id, state, state_text, status, retries, \
    next_activation, external_next_activation, executor_id, executor_group, signal, \
    state_variables, created, modified, started";

const CLAIMABLE: &str = "status IN ('created', 'inProgress')";

/// Statements used by the backends, rendered for one dialect.
#[derive(Debug, Clone)]
pub(crate) struct Queries {
    pub insert_instance: String,
    pub select_instance: String,
    pub select_actions: String,
    /// Single-statement claim, only rendered for dialects with row locking.
    pub claim_batch: Option<String>,
    pub claim_candidates: String,
    pub claim_one: String,
    pub persist_update: String,
    pub insert_action: String,
    pub park_instance: String,
    pub update_unclaimed: String,
    pub request_activation: String,
    pub set_signal: String,
    pub insert_executor: String,
    pub keepalive_executor: String,
    pub stop_executor: String,
    pub select_executor: String,
    pub select_orphans: String,
    pub release_orphan: String,
}

impl Queries {
    pub fn new(dialect: &dyn SqlDialect) -> Self {
        let lock = dialect.skip_locked().unwrap_or_default();

        let insert_instance = r#"
            INSERT INTO workflow_instances (
                workflow_type, external_id, business_key, parent_workflow_id, parent_action_id,
                root_workflow_id, state, status, retries, next_activation, executor_group,
                state_variables, created, modified
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 0, $9, $10, $11, $12, $12)
            RETURNING id
            "#;

        let select_instance =
            format!("SELECT {INSTANCE_COLUMNS} FROM workflow_instances WHERE id = $1");

        let select_actions = r#"
            SELECT id, workflow_instance_id, executor_id, action_type, state, state_text,
                   retry_no, execution_start, execution_end, updated_state_variables
            FROM workflow_actions
            WHERE workflow_instance_id = $1
            ORDER BY execution_start, id
            "#;

        // $1 executor id, $2 now, $3 group, $4 limit
        let claim_batch = dialect.skip_locked().map(|lock| {
            format!(
                r#"
                UPDATE workflow_instances
                SET executor_id = $1, status = 'executing', modified = $2
                WHERE executor_id IS NULL AND id IN (
                    SELECT id FROM workflow_instances
                    WHERE executor_id IS NULL AND {CLAIMABLE}
                      AND next_activation <= $2 AND executor_group = $3
                    ORDER BY next_activation, id
                    LIMIT $4
                    {lock}
                )
                RETURNING id, next_activation
                "#
            )
        });

        // $1 now, $2 group, $3 limit
        let claim_candidates = format!(
            r#"
            SELECT id FROM workflow_instances
            WHERE executor_id IS NULL AND {CLAIMABLE}
              AND next_activation <= $1 AND executor_group = $2
            ORDER BY next_activation, id
            LIMIT $3
            "#
        );

        // $1 executor id, $2 now, $3 instance id, $4 group
        let claim_one = format!(
            r#"
            UPDATE workflow_instances
            SET executor_id = $1, status = 'executing', modified = $2
            WHERE id = $3 AND executor_id IS NULL AND {CLAIMABLE}
              AND next_activation <= $2 AND executor_group = $4
            "#
        );

        let persist_update = format!(
            r#"
            UPDATE workflow_instances
            SET state = $1, state_text = $2, status = $3, retries = $4,
                next_activation = {merged},
                external_next_activation = NULL,
                executor_id = $6, state_variables = $7,
                started = COALESCE(started, $8), modified = $9,
                signal = CASE WHEN $10 THEN $11 ELSE signal END
            WHERE id = $12 AND executor_id = $13
            "#,
            merged = dialect.earliest("$5", "external_next_activation"),
        );

        let insert_action = r#"
            INSERT INTO workflow_actions (
                workflow_instance_id, executor_id, action_type, state, state_text, retry_no,
                execution_start, execution_end, updated_state_variables
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING id
            "#;

        let park_instance = r#"
            UPDATE workflow_instances
            SET next_activation = NULL, state_text = $1, status = 'inProgress',
                executor_id = NULL, modified = $2
            WHERE id = $3 AND executor_id = $4
            "#;

        let update_unclaimed = r#"
            UPDATE workflow_instances
            SET state = $1, state_text = $2, status = $3, retries = $4, next_activation = $5,
                state_variables = $6, modified = $7
            WHERE id = $8 AND executor_id IS NULL AND modified = $9
            "#;

        let request_activation = format!(
            r#"
            UPDATE workflow_instances
            SET external_next_activation = {merged}
            WHERE id = $2 AND executor_id IS NOT NULL
            "#,
            merged = dialect.earliest("$1", "external_next_activation"),
        );

        let set_signal = r#"
            UPDATE workflow_instances SET signal = $1, modified = $2
            WHERE id = $3 AND modified = $4
            "#;

        let insert_executor = r#"
            INSERT INTO executors (host, pid, executor_group, started, active, expires)
            VALUES ($1, $2, $3, $4, $4, $5)
            RETURNING id
            "#;

        let keepalive_executor = r#"
            UPDATE executors SET active = $1, expires = $2 WHERE id = $3 AND stopped IS NULL
            "#;

        let stop_executor = r#"
            UPDATE executors SET stopped = $1, expires = $1 WHERE id = $2
            "#;

        let select_executor = "SELECT expires, stopped FROM executors WHERE id = $1";

        // $1 group, $2 now
        let select_orphans = format!(
            r#"
            SELECT id, executor_id, state, retries FROM workflow_instances
            WHERE executor_group = $1 AND executor_id IN (
                SELECT id FROM executors
                WHERE executor_group = $1 AND (expires < $2 OR stopped IS NOT NULL)
            )
            ORDER BY id
            {lock}
            "#
        );

        let release_orphan = r#"
            UPDATE workflow_instances
            SET executor_id = NULL, status = 'inProgress', modified = $1
            WHERE id = $2 AND executor_id = $3
            "#;

        Self {
            insert_instance: dialect.render(insert_instance),
            select_instance: dialect.render(&select_instance),
            select_actions: dialect.render(select_actions),
            claim_batch: claim_batch.map(|sql| dialect.render(&sql)),
            claim_candidates: dialect.render(&claim_candidates),
            claim_one: dialect.render(&claim_one),
            persist_update: dialect.render(&persist_update),
            insert_action: dialect.render(insert_action),
            park_instance: dialect.render(park_instance),
            update_unclaimed: dialect.render(update_unclaimed),
            request_activation: dialect.render(&request_activation),
            set_signal: dialect.render(set_signal),
            insert_executor: dialect.render(insert_executor),
            keepalive_executor: dialect.render(keepalive_executor),
            stop_executor: dialect.render(stop_executor),
            select_executor: dialect.render(select_executor),
            select_orphans: dialect.render(&select_orphans),
            release_orphan: dialect.render(release_orphan),
        }
    }
}

/// Bind value of a dynamically built query.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum QueryParam {
    Text(String),
    Int(i64),
}

/// Build the listing query for `query`, returning SQL and parameters in bind order.
pub(crate) fn list_instances_sql(
    dialect: &dyn SqlDialect,
    query: &InstanceQuery,
) -> (String, Vec<QueryParam>) {
    let mut sql = format!("SELECT {INSTANCE_COLUMNS} FROM workflow_instances WHERE 1=1");
    let mut params = Vec::new();

    let mut filter = |column: &str, value: QueryParam, params: &mut Vec<QueryParam>| {
        params.push(value);
        sql.push_str(&format!(" AND {} = {}", column, dialect.param(params.len())));
    };

    if let Some(workflow_type) = &query.workflow_type {
        filter("workflow_type", QueryParam::Text(workflow_type.clone()), &mut params);
    }
    if let Some(state) = &query.state {
        filter("state", QueryParam::Text(state.clone()), &mut params);
    }
    if let Some(status) = query.status {
        filter("status", QueryParam::Text(status.as_str().to_string()), &mut params);
    }
    if let Some(business_key) = &query.business_key {
        filter("business_key", QueryParam::Text(business_key.clone()), &mut params);
    }
    if let Some(group) = &query.executor_group {
        filter("executor_group", QueryParam::Text(group.clone()), &mut params);
    }
    if let Some(parent) = query.parent_workflow_id {
        filter("parent_workflow_id", QueryParam::Int(parent), &mut params);
    }

    params.push(QueryParam::Int(query.limit.max(0)));
    sql.push_str(&format!(
        " ORDER BY created DESC, id DESC LIMIT {}",
        dialect.param(params.len())
    ));
    (sql, params)
}
