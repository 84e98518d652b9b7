use std::collections::HashMap;

use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input. Column aliases are already resolved, so the
/// engine only ever sees these shapes.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertUser {
        id: Ulid,
        name: String,
        role: Role,
    },
    InsertFacility {
        id: Ulid,
        name: String,
        capacity: Option<u32>,
        is_active: bool,
    },
    UpdateFacility {
        id: Ulid,
        patch: FacilityPatch,
    },
    DeleteFacility {
        id: Ulid,
    },
    SelectFacilities {
        id: Option<Ulid>,
        /// `(date, start_time, end_time)`: only facilities bookable in that window.
        window: Option<(String, String, String)>,
        min_capacity: Option<u32>,
    },
    InsertReservation {
        requester_id: Ulid,
        input: NewReservation,
    },
    UpdateReservation {
        id: Ulid,
        requester_id: Ulid,
        patch: ReservationPatch,
    },
    SetReservationStatus {
        id: Ulid,
        status: String,
        /// Administrator making the decision; required over SQL.
        acted_by: Ulid,
        note: Option<String>,
    },
    CancelReservation {
        id: Ulid,
        requester_id: Ulid,
    },
    SelectReservations {
        id: Option<Ulid>,
        requester_id: Option<Ulid>,
    },
    SelectAvailability {
        facility_id: Ulid,
        date: String,
        start_time: String,
        end_time: String,
    },
    SelectBusySlots {
        facility_id: Ulid,
        date: String,
    },
    SelectFreeSlots {
        facility_id: Ulid,
        date: String,
    },
    SelectApprovalLog {
        reservation_id: Ulid,
        requester_id: Option<Ulid>,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let mut commands = parse_batch(sql)?;
    if commands.len() > 1 {
        return Err(SqlError::Unsupported(
            "multiple statements in one prepared query".into(),
        ));
    }
    Ok(commands.remove(0))
}

/// Every statement of a simple-query string, in order. Never empty.
pub fn parse_batch(sql: &str) -> Result<Vec<Command>, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }
    stmts.iter().map(parse_statement).collect()
}

fn parse_statement(stmt: &Statement) -> Result<Command, SqlError> {
    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(&table.relation, assignments, selection.as_ref()),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// Map legacy and camelCase column names onto the canonical ones.
pub fn canonical_column(name: &str) -> String {
    let lower = name.to_ascii_lowercase();
    let canonical = match lower.as_str() {
        "facilityid" | "facility" => "facility_id",
        "reservationid" => "reservation_id",
        "user_id" | "userid" | "requesterid" => "requester_id",
        "starttime" | "start" => "start_time",
        "endtime" | "end" => "end_time",
        "participants" | "attendee_count" | "attendeecount" => "attendees",
        "proposal_url" | "proposalurl" | "proposal" | "proposalref" => "proposal_ref",
        "isactive" | "active" => "is_active",
        "maintenanceuntil" => "maintenance_until",
        "maintenancereason" => "maintenance_reason",
        "actedby" | "admin_id" | "adminid" => "acted_by",
        "reason" | "notes" => "note",
        "mincapacity" => "min_capacity",
        _ => return lower,
    };
    canonical.to_string()
}

// ── INSERT ────────────────────────────────────────────────────

const USER_COLUMNS: &[&str] = &["id", "name", "role"];
const FACILITY_COLUMNS: &[&str] = &["id", "name", "capacity", "is_active"];
const RESERVATION_COLUMNS: &[&str] = &[
    "requester_id",
    "facility_id",
    "date",
    "start_time",
    "end_time",
    "purpose",
    "attendees",
    "id",
    "proposal_ref",
];

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;

    match table.as_str() {
        "users" => {
            let row = Row::from_insert(insert, USER_COLUMNS, values)?;
            let role = match row.opt_string("role")? {
                Some(r) => r.parse().map_err(SqlError::Parse)?,
                None => Role::Member,
            };
            Ok(Command::InsertUser {
                id: row.ulid("id")?,
                name: row.string("name")?,
                role,
            })
        }
        "facilities" => {
            let row = Row::from_insert(insert, FACILITY_COLUMNS, values)?;
            Ok(Command::InsertFacility {
                id: row.ulid("id")?,
                name: row.string("name")?,
                capacity: row.opt_u32("capacity")?,
                is_active: row.opt_bool("is_active")?.unwrap_or(true),
            })
        }
        "reservations" => {
            let row = Row::from_insert(insert, RESERVATION_COLUMNS, values)?;
            Ok(Command::InsertReservation {
                requester_id: row.ulid("requester_id")?,
                input: NewReservation {
                    id: row.opt_ulid("id")?,
                    facility_id: row.opt_ulid("facility_id")?,
                    date: row.string("date")?,
                    start_time: row.string("start_time")?,
                    end_time: row.string("end_time")?,
                    purpose: row.string("purpose")?,
                    attendees: row.u32("attendees")?,
                    proposal_ref: row.opt_string("proposal_ref")?,
                },
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── UPDATE ────────────────────────────────────────────────────

fn parse_update(
    relation: &TableFactor,
    assignments: &[ast::Assignment],
    selection: Option<&Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    let filters = Filters::from_selection(selection)?;
    let set = Row::from_assignments(assignments)?;
    let id = filters.ulid("id")?;

    match table.as_str() {
        "facilities" => {
            let mut patch = FacilityPatch::default();
            for col in set.columns() {
                match col {
                    "name" => patch.name = Some(set.string("name")?),
                    "capacity" => patch.capacity = Some(set.opt_u32("capacity")?),
                    "is_active" => patch.is_active = Some(set.bool("is_active")?),
                    "maintenance_until" => {
                        patch.maintenance_until = Some(set.opt_string("maintenance_until")?)
                    }
                    "maintenance_reason" => {
                        patch.maintenance_reason = Some(set.opt_string("maintenance_reason")?)
                    }
                    other => return Err(SqlError::UnknownColumn(other.to_string())),
                }
            }
            Ok(Command::UpdateFacility { id, patch })
        }
        "reservations" => {
            if set.contains("status") {
                if let Some(other) = set
                    .columns()
                    .find(|c| !matches!(*c, "status" | "note" | "acted_by"))
                {
                    return Err(SqlError::Unsupported(format!(
                        "status change cannot also set {other}"
                    )));
                }
                return Ok(Command::SetReservationStatus {
                    id,
                    status: set.string("status")?,
                    acted_by: match set.opt_ulid("acted_by")? {
                        Some(a) => a,
                        None => filters
                            .opt_ulid("acted_by")?
                            .ok_or(SqlError::MissingFilter("acted_by"))?,
                    },
                    note: set.opt_string("note")?,
                });
            }
            let mut patch = ReservationPatch::default();
            for col in set.columns() {
                match col {
                    "date" => patch.date = Some(set.string("date")?),
                    "start_time" => patch.start_time = Some(set.string("start_time")?),
                    "end_time" => patch.end_time = Some(set.string("end_time")?),
                    "purpose" => patch.purpose = Some(set.string("purpose")?),
                    "attendees" => patch.attendees = Some(set.u32("attendees")?),
                    "proposal_ref" => {
                        patch.proposal_ref = Some(set.opt_string("proposal_ref")?.unwrap_or_default())
                    }
                    other => return Err(SqlError::UnknownColumn(other.to_string())),
                }
            }
            Ok(Command::UpdateReservation {
                id,
                requester_id: filters.ulid("requester_id")?,
                patch,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = Filters::from_selection(delete.selection.as_ref())?;
    let id = filters.ulid("id")?;

    match table.as_str() {
        "facilities" => Ok(Command::DeleteFacility { id }),
        // Reservations are never removed; DELETE is the owner's cancel.
        "reservations" => Ok(Command::CancelReservation {
            id,
            requester_id: filters.ulid("requester_id")?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── SELECT ────────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;
    let filters = Filters::from_selection(select.selection.as_ref())?;

    match table.as_str() {
        "facilities" => {
            let date = filters.opt_string("date")?;
            let start = filters.opt_string("start_time")?;
            let end = filters.opt_string("end_time")?;
            let window = match (date, start, end) {
                (Some(d), Some(s), Some(e)) => Some((d, s, e)),
                (None, None, None) => None,
                (None, ..) => return Err(SqlError::MissingFilter("date")),
                (_, None, _) => return Err(SqlError::MissingFilter("start_time")),
                (_, _, None) => return Err(SqlError::MissingFilter("end_time")),
            };
            let min_capacity = match filters.opt_u32("min_capacity")? {
                Some(n) => Some(n),
                None => filters.opt_u32("capacity")?,
            };
            Ok(Command::SelectFacilities {
                id: filters.opt_ulid("id")?,
                window,
                min_capacity,
            })
        }
        "reservations" => Ok(Command::SelectReservations {
            id: filters.opt_ulid("id")?,
            requester_id: filters.opt_ulid("requester_id")?,
        }),
        "availability" => Ok(Command::SelectAvailability {
            facility_id: filters.ulid("facility_id")?,
            date: filters.string("date")?,
            start_time: filters.string("start_time")?,
            end_time: filters.string("end_time")?,
        }),
        "busy_slots" => Ok(Command::SelectBusySlots {
            facility_id: filters.ulid("facility_id")?,
            date: filters.string("date")?,
        }),
        "free_slots" => Ok(Command::SelectFreeSlots {
            facility_id: filters.ulid("facility_id")?,
            date: filters.string("date")?,
        }),
        "approval_logs" => Ok(Command::SelectApprovalLog {
            reservation_id: filters.ulid("reservation_id")?,
            requester_id: filters.opt_ulid("requester_id")?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── Column maps ───────────────────────────────────────────────

/// Canonical column name → value expression, from INSERT or SET.
struct Row {
    values: Vec<(String, Expr)>,
}

impl Row {
    /// Named columns when given, else the table's positional order.
    fn from_insert(
        insert: &ast::Insert,
        positional: &[&str],
        values: Vec<Expr>,
    ) -> Result<Self, SqlError> {
        let names: Vec<String> = if insert.columns.is_empty() {
            if values.len() > positional.len() {
                return Err(SqlError::WrongArity(positional.len(), values.len()));
            }
            positional.iter().map(|c| c.to_string()).collect()
        } else {
            if insert.columns.len() != values.len() {
                return Err(SqlError::WrongArity(insert.columns.len(), values.len()));
            }
            insert
                .columns
                .iter()
                .map(|c| canonical_column(&c.value))
                .collect()
        };
        Ok(Self {
            values: names.into_iter().zip(values).collect(),
        })
    }

    fn from_assignments(assignments: &[ast::Assignment]) -> Result<Self, SqlError> {
        let mut values = Vec::with_capacity(assignments.len());
        for a in assignments {
            let name = match &a.target {
                AssignmentTarget::ColumnName(name) => object_name_last(name)
                    .ok_or_else(|| SqlError::Parse("empty column name".into()))?,
                AssignmentTarget::Tuple(_) => {
                    return Err(SqlError::Unsupported("tuple assignment".into()));
                }
            };
            values.push((canonical_column(&name), a.value.clone()));
        }
        if values.is_empty() {
            return Err(SqlError::Parse("UPDATE without SET".into()));
        }
        Ok(Self { values })
    }

    fn columns(&self) -> impl Iterator<Item = &str> {
        self.values.iter().map(|(c, _)| c.as_str())
    }

    fn contains(&self, col: &str) -> bool {
        self.get(col).is_some()
    }

    fn get(&self, col: &str) -> Option<&Expr> {
        self.values.iter().find(|(c, _)| c == col).map(|(_, e)| e)
    }

    fn required(&self, col: &'static str) -> Result<&Expr, SqlError> {
        self.get(col).ok_or(SqlError::MissingColumn(col))
    }

    fn ulid(&self, col: &'static str) -> Result<Ulid, SqlError> {
        parse_ulid_expr(self.required(col)?)
    }

    fn opt_ulid(&self, col: &'static str) -> Result<Option<Ulid>, SqlError> {
        self.get(col).map(parse_ulid_or_null).transpose().map(Option::flatten)
    }

    fn string(&self, col: &'static str) -> Result<String, SqlError> {
        parse_string_or_null(self.required(col)?)?.ok_or(SqlError::MissingColumn(col))
    }

    fn opt_string(&self, col: &'static str) -> Result<Option<String>, SqlError> {
        self.get(col).map(parse_string_or_null).transpose().map(Option::flatten)
    }

    fn u32(&self, col: &'static str) -> Result<u32, SqlError> {
        parse_u32(self.required(col)?)
    }

    fn opt_u32(&self, col: &'static str) -> Result<Option<u32>, SqlError> {
        match self.get(col) {
            None => Ok(None),
            Some(e) if is_null(e) => Ok(None),
            Some(e) => parse_u32(e).map(Some),
        }
    }

    fn bool(&self, col: &'static str) -> Result<bool, SqlError> {
        parse_bool(self.required(col)?)
    }

    fn opt_bool(&self, col: &'static str) -> Result<Option<bool>, SqlError> {
        match self.get(col) {
            None => Ok(None),
            Some(e) if is_null(e) => Ok(None),
            Some(e) => parse_bool(e).map(Some),
        }
    }
}

/// WHERE clause flattened into `column = value` / `column >= value` pairs joined by AND.
struct Filters {
    row: Row,
}

impl Filters {
    fn from_selection(selection: Option<&Expr>) -> Result<Self, SqlError> {
        let mut values = Vec::new();
        if let Some(expr) = selection {
            collect_filters(expr, &mut values)?;
        }
        Ok(Self {
            row: Row { values },
        })
    }

    fn ulid(&self, col: &'static str) -> Result<Ulid, SqlError> {
        let expr = self.row.get(col).ok_or(SqlError::MissingFilter(col))?;
        parse_ulid_expr(expr)
    }

    fn opt_ulid(&self, col: &'static str) -> Result<Option<Ulid>, SqlError> {
        self.row.opt_ulid(col)
    }

    fn string(&self, col: &'static str) -> Result<String, SqlError> {
        self.row
            .opt_string(col)?
            .ok_or(SqlError::MissingFilter(col))
    }

    fn opt_string(&self, col: &'static str) -> Result<Option<String>, SqlError> {
        self.row.opt_string(col)
    }

    fn opt_u32(&self, col: &'static str) -> Result<Option<u32>, SqlError> {
        self.row.opt_u32(col)
    }
}

fn collect_filters(expr: &Expr, out: &mut Vec<(String, Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_filters(inner, out),
        Expr::BinaryOp { left, op, right } => match op {
            ast::BinaryOperator::And => {
                collect_filters(left, out)?;
                collect_filters(right, out)
            }
            ast::BinaryOperator::Eq | ast::BinaryOperator::GtEq => {
                let col = expr_column_name(left)
                    .ok_or_else(|| SqlError::Parse(format!("expected column, got {left}")))?;
                out.push((canonical_column(&col), right.as_ref().clone()));
                Ok(())
            }
            other => Err(SqlError::Unsupported(format!("operator {other} in WHERE"))),
        },
        other => Err(SqlError::Unsupported(format!("WHERE {other}"))),
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

/// Single-row VALUES only.
fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.clone()),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

/// Column identifiers keep their original case here; `canonical_column` folds it.
fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.clone()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.clone()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    parse_ulid_or_null(expr)?.ok_or_else(|| SqlError::Parse("expected ULID, got NULL".into()))
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        Some(Value::SingleQuotedString(s)) => Ulid::from_string(s)
            .map(Some)
            .map_err(|e| SqlError::Parse(format!("bad ULID '{s}': {e}"))),
        Some(value) => Err(SqlError::Parse(format!(
            "expected string or NULL, got {value}"
        ))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        Some(Value::SingleQuotedString(s)) => Ok(Some(s.clone())),
        Some(Value::Number(n, _)) => Ok(Some(n.clone())),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .trim()
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer '{s}': {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64_expr(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of range")))
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Boolean(b) => Ok(*b),
            Value::SingleQuotedString(s) => match s.to_lowercase().as_str() {
                "true" | "t" | "1" => Ok(true),
                "false" | "f" | "0" => Ok(false),
                _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
            },
            Value::Number(n, _) => Ok(n != "0"),
            _ => Err(SqlError::Parse(format!("expected bool, got {value}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("unknown column: {0}")]
    UnknownColumn(String),
    #[error("expected {0} values, got {1}")]
    WrongArity(usize, usize),
    #[error("missing column: {0}")]
    MissingColumn(&'static str),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
}

impl SqlError {
    pub fn sqlstate(&self) -> &'static str {
        match self {
            SqlError::UnknownTable(_) => "42P01",
            SqlError::UnknownColumn(_) => "42703",
            SqlError::Unsupported(_) => "0A000",
            SqlError::MissingColumn(_) | SqlError::MissingFilter(_) => "23502",
            SqlError::Parse(_) | SqlError::Empty | SqlError::WrongArity(..) => "42601",
        }
    }
}
