use chrono::FixedOffset;
use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;
use ulid::Ulid;

use crate::model::*;
use crate::time::{self, TimeError};

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertDeviceType {
        id: Option<Ulid>,
        name: String,
    },
    DeleteDeviceType {
        id: Ulid,
    },
    SelectDeviceTypes,
    InsertDevice {
        id: Option<Ulid>,
        name: String,
        device_type_id: Option<Ulid>,
    },
    UpdateDevice {
        id: Ulid,
        patch: DevicePatch,
    },
    DeleteDevice {
        id: Ulid,
    },
    SelectDevices {
        id: Option<Ulid>,
    },
    InsertReservation {
        id: Option<Ulid>,
        device_id: Ulid,
        start: Ms,
        end: Ms,
    },
    InsertQueuedReservation {
        id: Option<Ulid>,
        device_id: Ulid,
        simulation_time_secs: i64,
        timezone: Option<FixedOffset>,
    },
    UpdateReservation {
        id: Ulid,
        patch: ReservationPatch,
    },
    DeleteReservation {
        id: Ulid,
    },
    SelectReservations {
        filter: ReservationFilter,
    },
    SelectCurrentReservation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationFilter {
    All,
    Id(Ulid),
    Device(Ulid),
}

/// Row layout a statement produces, known before it runs (for Describe).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultShape {
    DeviceTypes,
    Devices,
    Reservations,
}

#[derive(Debug, Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("{table}: unknown column {column}")]
    UnknownColumn { table: &'static str, column: String },
    #[error("{0}: missing value for {1}")]
    MissingColumn(&'static str, &'static str),
    #[error("{0}: expected {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
    #[error(transparent)]
    Time(#[from] TimeError),
}

impl SqlError {
    pub fn sqlstate(&self) -> &'static str {
        match self {
            SqlError::Time(_) => "22007",
            _ => "42601",
        }
    }
}

const DEVICE_TYPES: &str = "device_types";
const DEVICES: &str = "devices";
const RESERVATIONS: &str = "reservations";
const RESERVATION_QUEUE: &str = "reservation_queue";
const CURRENT_RESERVATION: &str = "current_reservation";

fn table_ref(name: &str) -> Result<&'static str, SqlError> {
    match name {
        DEVICE_TYPES => Ok(DEVICE_TYPES),
        DEVICES => Ok(DEVICES),
        RESERVATIONS => Ok(RESERVATIONS),
        RESERVATION_QUEUE => Ok(RESERVATION_QUEUE),
        CURRENT_RESERVATION => Ok(CURRENT_RESERVATION),
        _ => Err(SqlError::UnknownTable(name.to_string())),
    }
}

/// Columns accepted by INSERT, in the order used when the column list is omitted.
fn insert_columns(table: &'static str) -> Result<&'static [&'static str], SqlError> {
    match table {
        DEVICE_TYPES => Ok(&["id", "name"]),
        DEVICES => Ok(&["id", "name", "device_type_id"]),
        RESERVATIONS => Ok(&["id", "device_id", "start", "end", "timezone"]),
        RESERVATION_QUEUE => Ok(&["id", "device_id", "simulation_time", "timezone"]),
        other => Err(SqlError::Unsupported(format!("INSERT into {other}"))),
    }
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    match &parse_statement(sql)? {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(table, assignments, selection),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// Row layout of `sql` without evaluating its values, so `$n` placeholders
/// are fine. `None` for statements that only return a command tag.
pub fn result_shape(sql: &str) -> Option<ResultShape> {
    let stmt = parse_statement(sql).ok()?;
    let table = match &stmt {
        Statement::Insert(insert) => insert_table_name(insert).ok()?,
        Statement::Update { table, .. } => table_factor_name(&table.relation).ok()?,
        Statement::Query(query) => match query.body.as_ref() {
            SetExpr::Select(select) => table_factor_name(&select.from.first()?.relation).ok()?,
            _ => return None,
        },
        _ => return None,
    };
    match (&stmt, table.as_str()) {
        (Statement::Query(_), DEVICE_TYPES) => Some(ResultShape::DeviceTypes),
        (Statement::Query(_), DEVICES) => Some(ResultShape::Devices),
        (Statement::Query(_), RESERVATIONS | CURRENT_RESERVATION) => Some(ResultShape::Reservations),
        (Statement::Insert(_), RESERVATIONS | RESERVATION_QUEUE) => Some(ResultShape::Reservations),
        (Statement::Update { .. }, RESERVATIONS) => Some(ResultShape::Reservations),
        _ => None,
    }
}

fn parse_statement(sql: &str) -> Result<Statement, SqlError> {
    let dialect = PostgreSqlDialect {};
    let mut stmts =
        Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }
    if stmts.len() > 1 {
        return Err(SqlError::Unsupported("multiple statements".into()));
    }
    Ok(stmts.remove(0))
}

// ── INSERT ───────────────────────────────────────────────────────

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = table_ref(&insert_table_name(insert)?)?;
    let allowed = insert_columns(table)?;
    let values = extract_insert_values(insert)?;

    let columns: Vec<String> = if insert.columns.is_empty() {
        if values.len() > allowed.len() {
            return Err(SqlError::WrongArity(table, allowed.len(), values.len()));
        }
        allowed[..values.len()].iter().map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| normalize_ident(&c.to_string())).collect()
    };
    if columns.len() != values.len() {
        return Err(SqlError::WrongArity(table, columns.len(), values.len()));
    }

    let mut row = Row::new(table);
    for (column, value) in columns.iter().zip(values.iter()) {
        row.set(allowed, column, value)?;
    }

    match table {
        DEVICE_TYPES => Ok(Command::InsertDeviceType {
            id: row.optional("id", parse_ulid_or_null)?.flatten(),
            name: row.required("name", parse_string)?,
        }),
        DEVICES => Ok(Command::InsertDevice {
            id: row.optional("id", parse_ulid_or_null)?.flatten(),
            name: row.required("name", parse_string)?,
            device_type_id: row.optional("device_type_id", parse_ulid_or_null)?.flatten(),
        }),
        RESERVATIONS => {
            let tz = row.optional("timezone", parse_offset)?;
            Ok(Command::InsertReservation {
                id: row.optional("id", parse_ulid_or_null)?.flatten(),
                device_id: row.required("device_id", parse_ulid)?,
                start: row.required("start", |e| parse_instant(e, tz))?,
                end: row.required("end", |e| parse_instant(e, tz))?,
            })
        }
        RESERVATION_QUEUE => Ok(Command::InsertQueuedReservation {
            id: row.optional("id", parse_ulid_or_null)?.flatten(),
            device_id: row.required("device_id", parse_ulid)?,
            simulation_time_secs: row.required("simulation_time", parse_i64)?,
            timezone: row.optional("timezone", parse_offset)?,
        }),
        other => Err(SqlError::Unsupported(format!("INSERT into {other}"))),
    }
}

/// Column → value pairs of one INSERT row or UPDATE assignment list.
struct Row<'a> {
    table: &'static str,
    cells: Vec<(&'static str, &'a Expr)>,
}

impl<'a> Row<'a> {
    fn new(table: &'static str) -> Self {
        Self {
            table,
            cells: Vec::new(),
        }
    }

    fn set(&mut self, allowed: &[&'static str], column: &str, value: &'a Expr) -> Result<(), SqlError> {
        let known: &'static str = allowed
            .iter()
            .copied()
            .find(|c| *c == column)
            .ok_or_else(|| SqlError::UnknownColumn {
                table: self.table,
                column: column.to_string(),
            })?;
        if self.get(known).is_some() {
            return Err(SqlError::Parse(format!("column {known} given twice")));
        }
        self.cells.push((known, value));
        Ok(())
    }

    fn get(&self, column: &str) -> Option<&'a Expr> {
        self.cells.iter().find(|(c, _)| *c == column).map(|(_, e)| *e)
    }

    fn optional<T>(
        &self,
        column: &'static str,
        parse: impl FnOnce(&Expr) -> Result<T, SqlError>,
    ) -> Result<Option<T>, SqlError> {
        self.get(column).map(parse).transpose()
    }

    fn required<T>(
        &self,
        column: &'static str,
        parse: impl FnOnce(&Expr) -> Result<T, SqlError>,
    ) -> Result<T, SqlError> {
        self.optional(column, parse)?
            .ok_or(SqlError::MissingColumn(self.table, column))
    }
}

// ── UPDATE ───────────────────────────────────────────────────────

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_ref(&table_factor_name(&table.relation)?)?;
    let allowed: &[&'static str] = match table {
        DEVICES => &["name", "device_type_id"],
        RESERVATIONS => &["device_id", "start", "end", "timezone"],
        other => return Err(SqlError::Unsupported(format!("UPDATE on {other}"))),
    };
    let id = extract_where_id(selection)?;

    let mut row = Row::new(table);
    for assignment in assignments {
        let column = match &assignment.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name)
                .ok_or_else(|| SqlError::Parse("empty column name".into()))?,
            AssignmentTarget::Tuple(_) => {
                return Err(SqlError::Unsupported("tuple assignment".into()));
            }
        };
        row.set(allowed, &column, &assignment.value)?;
    }

    if table == DEVICES {
        let patch = DevicePatch {
            name: row.optional("name", parse_string)?,
            device_type_id: row.optional("device_type_id", parse_ulid_or_null)?,
        };
        return Ok(Command::UpdateDevice { id, patch });
    }

    let tz = row.optional("timezone", parse_offset)?;
    let patch = ReservationPatch {
        device_id: row.optional("device_id", parse_ulid)?,
        start: row.optional("start", |e| parse_instant(e, tz))?,
        end: row.optional("end", |e| parse_instant(e, tz))?,
    };
    Ok(Command::UpdateReservation { id, patch })
}

// ── DELETE / SELECT ──────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = table_ref(&delete_table_name(delete)?)?;
    let id = extract_where_id(&delete.selection)?;

    match table {
        DEVICE_TYPES => Ok(Command::DeleteDeviceType { id }),
        DEVICES => Ok(Command::DeleteDevice { id }),
        RESERVATIONS => Ok(Command::DeleteReservation { id }),
        other => Err(SqlError::Unsupported(format!("DELETE from {other}"))),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    let from = select
        .from
        .first()
        .ok_or_else(|| SqlError::Parse("SELECT without FROM".into()))?;
    let table = table_ref(&table_factor_name(&from.relation)?)?;
    let filter = select
        .selection
        .as_ref()
        .map(extract_eq_filter)
        .transpose()?;

    match (table, filter) {
        (DEVICE_TYPES, None) => Ok(Command::SelectDeviceTypes),
        (DEVICES, None) => Ok(Command::SelectDevices { id: None }),
        (DEVICES, Some((col, id))) if col == "id" => Ok(Command::SelectDevices { id: Some(id) }),
        (RESERVATIONS, None) => Ok(Command::SelectReservations {
            filter: ReservationFilter::All,
        }),
        (RESERVATIONS, Some((col, id))) if col == "id" => Ok(Command::SelectReservations {
            filter: ReservationFilter::Id(id),
        }),
        (RESERVATIONS, Some((col, id))) if col == "device_id" => Ok(Command::SelectReservations {
            filter: ReservationFilter::Device(id),
        }),
        (CURRENT_RESERVATION, None) => Ok(Command::SelectCurrentReservation),
        (RESERVATION_QUEUE, _) => Err(SqlError::Unsupported(
            "reservation_queue is insert-only; select from reservations".into(),
        )),
        (_, Some((col, _))) => Err(SqlError::Unsupported(format!("filter on {col}"))),
        (other, None) => Err(SqlError::UnknownTable(other.to_string())),
    }
}

/// `column = '<ulid>'`
fn extract_eq_filter(expr: &Expr) -> Result<(String, Ulid), SqlError> {
    match expr {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            let column = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter {expr}")))?;
            Ok((column, parse_ulid(right)?))
        }
        Expr::Nested(inner) => extract_eq_filter(inner),
        _ => Err(SqlError::Unsupported(format!("filter {expr}"))),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match extract_eq_filter(sel)? {
        (column, id) if column == "id" => Ok(id),
        _ => Err(SqlError::MissingFilter("id")),
    }
}

// ── AST helpers ──────────────────────────────────────────────────

fn normalize_ident(raw: &str) -> String {
    raw.trim_matches('"').to_lowercase()
}

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
    match tables_with_joins.first() {
        Some(first) => table_factor_name(&first.relation),
        None => Err(SqlError::Parse("DELETE without table".into())),
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

fn extract_insert_values(insert: &ast::Insert) -> Result<&[Expr], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [row] => Ok(row.as_slice()),
            [] => Err(SqlError::Parse("empty VALUES".into())),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
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

// ── Value parsers ────────────────────────────────────────────────

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID '{s}': {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected ULID string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_ulid(expr).map(Some)
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        return parse_i64(expr).map(|v| -v);
    }
    match extract_value(expr) {
        Some(Value::Number(s, _)) | Some(Value::SingleQuotedString(s)) => s
            .trim()
            .parse()
            .map_err(|e| SqlError::Parse(format!("bad integer '{s}': {e}"))),
        Some(value) => Err(SqlError::Parse(format!("expected number, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_offset(expr: &Expr) -> Result<FixedOffset, SqlError> {
    Ok(time::parse_offset(&parse_string(expr)?)?)
}

/// Unix ms as a bare number, or a timestamp string normalized to UTC.
fn parse_instant(expr: &Expr, tz: Option<FixedOffset>) -> Result<Ms, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(time::parse_timestamp(s, tz)?),
        _ => parse_i64(expr),
    }
}
