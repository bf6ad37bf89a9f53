use std::collections::HashMap;
use std::str::FromStr;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::limits::MAX_DURATION_HOURS;
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertResource {
        config: ResourceConfig,
    },
    UpdateResource {
        id: Ulid,
        patch: ResourcePatch,
    },
    DeleteResource {
        id: Ulid,
    },
    SelectResources {
        id: Option<Ulid>,
    },
    InsertBooking {
        request: BookingRequest,
    },
    /// Multi-row INSERT: committed all-or-nothing.
    BatchInsertBookings {
        requests: Vec<BookingRequest>,
    },
    UpdateBookingStatus {
        id: Ulid,
        status: BookingStatus,
    },
    UpdatePaymentStatus {
        id: Ulid,
        payment_status: PaymentStatus,
    },
    DeleteBooking {
        id: Ulid,
    },
    SelectBookings {
        id: Option<Ulid>,
        filter: BookingFilter,
    },
    SelectAvailability {
        resource_id: Ulid,
        date: NaiveDate,
        start: Minute,
        duration: u32,
    },
    SelectSlots {
        resource_id: Ulid,
        date: NaiveDate,
        duration: u32,
    },
    Listen {
        channel: String,
    },
    Unlisten {
        channel: String,
    },
    UnlistenAll,
}

const RESOURCE_COLUMNS: &[&str] = &[
    "id",
    "name",
    "open",
    "close",
    "granularity",
    "max_duration",
    "price",
    "sub_units",
    "slots",
    "room",
];

const BOOKING_COLUMNS: &[&str] = &[
    "id",
    "resource_id",
    "sub_unit_ids",
    "date",
    "start",
    "duration",
    "customer_name",
    "customer_email",
    "customer_phone",
    "status",
];

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim().trim_end_matches(';').trim();
    if let Some(cmd) = parse_listen(trimmed) {
        return Ok(cmd);
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let stmt = match stmts.as_slice() {
        [] => return Err(SqlError::Empty),
        [stmt] => stmt,
        _ => return Err(SqlError::Unsupported("one statement per query".into())),
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(&table.relation, assignments, selection),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// LISTEN / UNLISTEN are matched by prefix; the channel is validated later.
fn parse_listen(sql: &str) -> Option<Command> {
    let upper = sql.to_uppercase();
    if let Some(rest) = upper.strip_prefix("UNLISTEN") {
        let channel = sql[sql.len() - rest.len()..].trim();
        return Some(if channel == "*" {
            Command::UnlistenAll
        } else {
            Command::Unlisten {
                channel: channel.trim_matches('"').to_string(),
            }
        });
    }
    if let Some(rest) = upper.strip_prefix("LISTEN ") {
        let channel = sql[sql.len() - rest.len()..].trim();
        return Some(Command::Listen {
            channel: channel.trim_matches('"').to_string(),
        });
    }
    None
}

// ── INSERT ────────────────────────────────────────────────────

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let columns: Vec<String> = insert.columns.iter().map(|c| c.value.to_lowercase()).collect();
    let rows = extract_insert_rows(insert)?;

    match table.as_str() {
        "resources" => {
            if rows.len() != 1 {
                return Err(SqlError::Unsupported("one resource per INSERT".into()));
            }
            let fields = Fields::from_row("resources", RESOURCE_COLUMNS, &columns, &rows[0])?;
            Ok(Command::InsertResource {
                config: resource_from_fields(fields)?,
            })
        }
        "bookings" => {
            let mut requests = Vec::with_capacity(rows.len());
            for (i, row) in rows.iter().enumerate() {
                let fields = Fields::from_row("bookings", BOOKING_COLUMNS, &columns, row)?;
                let request = booking_from_fields(fields).map_err(|e| match rows.len() {
                    1 => e,
                    _ => SqlError::Parse(format!("row {i}: {e}")),
                })?;
                requests.push(request);
            }
            if requests.len() == 1 {
                let request = requests.remove(0);
                Ok(Command::InsertBooking { request })
            } else {
                Ok(Command::BatchInsertBookings { requests })
            }
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn resource_from_fields(mut f: Fields) -> Result<ResourceConfig, SqlError> {
    let id = parse_ulid(&f.required("id")?)?;
    let open = parse_clock_expr(&f.required("open")?)?;
    let close = parse_clock_expr(&f.required("close")?)?;
    let granularity = match f.take("granularity") {
        Some(e) => parse_int::<Minute>(&e)?,
        None => 60,
    };
    let max_duration = match f.take("max_duration") {
        Some(e) => parse_int::<u32>(&e)?,
        None => u32::try_from((close - open) / 60)
            .unwrap_or(1)
            .clamp(1, MAX_DURATION_HOURS),
    };
    let price_per_unit_hour = match f.take("price") {
        Some(e) => parse_decimal(&e)?,
        None => Decimal::ZERO,
    };
    let config = ResourceConfig {
        id,
        name: f.take("name").map(|e| parse_text(&e)).transpose()?.flatten(),
        room: f.take("room").map(|e| parse_text(&e)).transpose()?.flatten(),
        open,
        close,
        granularity,
        slots: f.take("slots").map(|e| parse_slots(&e)).transpose()?.flatten(),
        max_duration,
        price_per_unit_hour,
        sub_units: f.take("sub_units").map(|e| parse_list(&e)).transpose()?.flatten().unwrap_or_default(),
    };
    f.finish()?;
    Ok(config)
}

fn booking_from_fields(mut f: Fields) -> Result<BookingRequest, SqlError> {
    let id = match f.take("id") {
        Some(e) => parse_ulid_or_null(&e)?.unwrap_or_else(Ulid::new),
        None => Ulid::new(),
    };
    let request = BookingRequest {
        id,
        resource_id: parse_ulid(&f.required("resource_id")?)?,
        sub_unit_ids: f.take("sub_unit_ids").map(|e| parse_list(&e)).transpose()?.flatten().unwrap_or_default(),
        date: parse_date(&f.required("date")?)?,
        start: parse_clock_expr(&f.required("start")?)?,
        duration: parse_int(&f.required("duration")?)?,
        customer: Customer {
            name: parse_text(&f.required("customer_name")?)?.unwrap_or_default(),
            email: f.take("customer_email").map(|e| parse_text(&e)).transpose()?.flatten(),
            phone: f.take("customer_phone").map(|e| parse_text(&e)).transpose()?.flatten(),
        },
        status: f.take("status").map(|e| parse_enum::<BookingStatus>(&e)).transpose()?.flatten(),
    };
    f.finish()?;
    Ok(request)
}

// ── UPDATE ────────────────────────────────────────────────────

fn parse_update(table: &TableFactor, assignments: &[ast::Assignment], selection: &Option<Expr>) -> Result<Command, SqlError> {
    let table = table_factor_name(table)?;
    let id = extract_where_id(selection)?;

    let mut sets = Vec::with_capacity(assignments.len());
    for a in assignments {
        let column = match &a.target {
            AssignmentTarget::ColumnName(name) => {
                object_name_last(name).ok_or_else(|| SqlError::Parse("empty column name".into()))?
            }
            AssignmentTarget::Tuple(_) => return Err(SqlError::Unsupported("tuple assignment".into())),
        };
        sets.push((column, a.value.clone()));
    }
    if sets.is_empty() {
        return Err(SqlError::Parse("UPDATE without SET".into()));
    }

    match table.as_str() {
        "resources" => {
            let mut patch = ResourcePatch::default();
            for (column, value) in &sets {
                match column.as_str() {
                    "name" => patch.name = Some(parse_text(value)?),
                    "room" => patch.room = Some(parse_text(value)?),
                    "open" => patch.open = Some(parse_clock_expr(value)?),
                    "close" => patch.close = Some(parse_clock_expr(value)?),
                    "granularity" => patch.granularity = Some(parse_int(value)?),
                    "max_duration" => patch.max_duration = Some(parse_int(value)?),
                    "price" => patch.price_per_unit_hour = Some(parse_decimal(value)?),
                    "sub_units" => patch.sub_units = Some(parse_list(value)?.unwrap_or_default()),
                    "slots" => patch.slots = Some(parse_slots(value)?),
                    "id" => return Err(SqlError::Unsupported("resource id is immutable".into())),
                    _ => return Err(SqlError::UnknownColumn("resources", column.clone())),
                }
            }
            Ok(Command::UpdateResource { id, patch })
        }
        "bookings" => match sets.as_slice() {
            [(column, value)] => match column.as_str() {
                "status" => Ok(Command::UpdateBookingStatus {
                    id,
                    status: parse_enum(value)?.ok_or(SqlError::Parse("status cannot be NULL".into()))?,
                }),
                "payment_status" => Ok(Command::UpdatePaymentStatus {
                    id,
                    payment_status: parse_enum(value)?
                        .ok_or(SqlError::Parse("payment_status cannot be NULL".into()))?,
                }),
                _ => Err(SqlError::Unsupported(format!(
                    "bookings.{column} cannot be updated; only status or payment_status"
                ))),
            },
            _ => Err(SqlError::Unsupported(
                "update status and payment_status in separate statements".into(),
            )),
        },
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "resources" => Ok(Command::DeleteResource { id }),
        "bookings" => Ok(Command::DeleteBooking { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── SELECT ────────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;
    let table: &'static str = match table.as_str() {
        "resources" => "resources",
        "bookings" => "bookings",
        "availability" => "availability",
        "slots" => "slots",
        _ => return Err(SqlError::UnknownTable(table)),
    };

    let mut values = HashMap::new();
    if let Some(selection) = &select.selection {
        collect_equalities(selection, &mut values)?;
    }
    let mut f = Fields { table, values };

    let cmd = match table {
        "resources" => Command::SelectResources {
            id: f.take("id").map(|e| parse_ulid(&e)).transpose()?,
        },
        "bookings" => {
            let newest_first = query
                .order_by
                .as_ref()
                .is_some_and(|o| o.to_string().to_uppercase().contains("DESC"));
            let filter = BookingFilter {
                resource_id: f.take("resource_id").map(|e| parse_ulid(&e)).transpose()?,
                status: f.take("status").map(|e| parse_enum(&e)).transpose()?.flatten(),
                date: f.take("date").map(|e| parse_date(&e)).transpose()?,
                search: f.take("search").map(|e| parse_text(&e)).transpose()?.flatten(),
                order: if newest_first {
                    SortOrder::NewestFirst
                } else {
                    SortOrder::Chronological
                },
            };
            Command::SelectBookings {
                id: f.take("id").map(|e| parse_ulid(&e)).transpose()?,
                filter,
            }
        }
        "availability" => Command::SelectAvailability {
            resource_id: parse_ulid(&f.filter("resource_id")?)?,
            date: parse_date(&f.filter("date")?)?,
            start: parse_clock_expr(&f.filter("start")?)?,
            duration: parse_int(&f.filter("duration")?)?,
        },
        "slots" => Command::SelectSlots {
            resource_id: parse_ulid(&f.filter("resource_id")?)?,
            date: parse_date(&f.filter("date")?)?,
            duration: match f.take("duration") {
                Some(e) => parse_int(&e)?,
                None => 1,
            },
        },
        _ => unreachable!("table names are checked above"),
    };
    f.finish()?;
    Ok(cmd)
}

/// Flatten `a = 1 AND (b = 2 AND c = 3)` into column → value.
fn collect_equalities(expr: &Expr, out: &mut HashMap<String, Expr>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_equalities(inner, out),
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            collect_equalities(left, out)?;
            collect_equalities(right, out)
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            let col = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
            out.insert(col, right.as_ref().clone());
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
    }
}

// ── Column plumbing ───────────────────────────────────────────

/// Named values of one row or one WHERE clause.
struct Fields {
    table: &'static str,
    values: HashMap<String, Expr>,
}

impl Fields {
    /// Pair values with the explicit column list, or with `default_order` when none is given.
    fn from_row(
        table: &'static str,
        default_order: &[&str],
        columns: &[String],
        row: &[Expr],
    ) -> Result<Self, SqlError> {
        let names: Vec<String> = if columns.is_empty() {
            default_order.iter().map(|c| c.to_string()).collect()
        } else {
            columns.to_vec()
        };
        if row.len() > names.len() || (!columns.is_empty() && row.len() != names.len()) {
            return Err(SqlError::WrongArity(table, names.len(), row.len()));
        }
        let mut values = HashMap::with_capacity(row.len());
        for (name, value) in names.into_iter().zip(row.iter()) {
            if !default_order.contains(&name.as_str()) {
                return Err(SqlError::UnknownColumn(table, name));
            }
            if values.insert(name.clone(), value.clone()).is_some() {
                return Err(SqlError::Parse(format!("column {name} given twice")));
            }
        }
        Ok(Self { table, values })
    }

    fn take(&mut self, name: &str) -> Option<Expr> {
        self.values.remove(name)
    }

    fn required(&mut self, name: &'static str) -> Result<Expr, SqlError> {
        self.take(name).ok_or(SqlError::MissingColumn(self.table, name))
    }

    fn filter(&mut self, name: &'static str) -> Result<Expr, SqlError> {
        self.take(name).ok_or(SqlError::MissingFilter(name))
    }

    /// Anything not consumed is a column we do not know.
    fn finish(self) -> Result<(), SqlError> {
        match self.values.into_keys().next() {
            Some(col) => Err(SqlError::UnknownColumn(self.table, col)),
            None => Ok(()),
        }
    }
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

fn extract_insert_rows(insert: &ast::Insert) -> Result<Vec<Vec<Expr>>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) if !values.rows.is_empty() => Ok(values.rows.clone()),
        SetExpr::Values(_) => Err(SqlError::Parse("empty VALUES".into())),
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some("id") => parse_ulid(right),
        _ => Err(SqlError::MissingFilter("id")),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

// ── Values ────────────────────────────────────────────────────

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

/// Text form of a literal. `NULL` is `None`; numbers come back as written.
fn parse_text(expr: &Expr) -> Result<Option<String>, SqlError> {
    match expr {
        Expr::UnaryOp {
            op: ast::UnaryOperator::Minus,
            expr,
        } => Ok(parse_text(expr)?.map(|s| format!("-{s}"))),
        _ => match extract_value(expr) {
            Some(Value::Null) => Ok(None),
            Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => Ok(Some(s.clone())),
            Some(Value::Boolean(b)) => Ok(Some(b.to_string())),
            Some(other) => Err(SqlError::Parse(format!("unexpected literal {other}"))),
            None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
        },
    }
}

fn parse_required_text(expr: &Expr) -> Result<String, SqlError> {
    parse_text(expr)?.ok_or_else(|| SqlError::Parse("unexpected NULL".into()))
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_required_text(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    match parse_text(expr)? {
        None => Ok(None),
        Some(s) => Ulid::from_string(&s)
            .map(Some)
            .map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}"))),
    }
}

fn parse_int<T: TryFrom<i64>>(expr: &Expr) -> Result<T, SqlError> {
    let s = parse_required_text(expr)?;
    let v: i64 = s
        .trim()
        .parse()
        .map_err(|_| SqlError::Parse(format!("expected integer, got {s:?}")))?;
    T::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of range")))
}

fn parse_decimal(expr: &Expr) -> Result<Decimal, SqlError> {
    let s = parse_required_text(expr)?;
    Decimal::from_str(s.trim()).map_err(|e| SqlError::Parse(format!("bad decimal {s:?}: {e}")))
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_required_text(expr)?;
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|_| SqlError::Parse(format!("expected YYYY-MM-DD, got {s:?}")))
}

fn parse_clock_expr(expr: &Expr) -> Result<Minute, SqlError> {
    let s = parse_required_text(expr)?;
    parse_clock(&s).ok_or_else(|| SqlError::Parse(format!("expected HH:MM, got {s:?}")))
}

/// Comma-separated text list; blanks are dropped. `NULL` is `None`.
fn parse_list(expr: &Expr) -> Result<Option<Vec<String>>, SqlError> {
    Ok(parse_text(expr)?.map(|s| {
        s.split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect()
    }))
}

fn parse_slots(expr: &Expr) -> Result<Option<Vec<Minute>>, SqlError> {
    let Some(items) = parse_list(expr)? else {
        return Ok(None);
    };
    items
        .iter()
        .map(|s| parse_clock(s).ok_or_else(|| SqlError::Parse(format!("bad slot time {s:?}"))))
        .collect::<Result<Vec<_>, _>>()
        .map(Some)
}

fn parse_enum<T: FromStr<Err = String>>(expr: &Expr) -> Result<Option<T>, SqlError> {
    parse_text(expr)?
        .map(|s| s.parse::<T>().map_err(SqlError::Parse))
        .transpose()
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(&'static str, String),
    WrongArity(&'static str, usize, usize),
    MissingColumn(&'static str, &'static str),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(t, c) => write!(f, "unknown column {c} for {t}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingColumn(t, c) => write!(f, "{t}: missing required column {c}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const RID: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";
    const BID: &str = "01BX5ZZKBKACTAV9WEVGEMMVRZ";

    fn rid() -> Ulid {
        Ulid::from_string(RID).unwrap()
    }

    #[test]
    fn insert_resource_with_columns() {
        let sql = format!(
            "INSERT INTO resources (id, name, open, close, max_duration, price, sub_units) \
             VALUES ('{RID}', 'Cafe', '14:00', '23:00', 8, '10.00', 'C1, C2,C3')"
        );
        let Command::InsertResource { config } = parse_sql(&sql).unwrap() else {
            panic!("expected InsertResource");
        };
        assert_eq!(config.id, rid());
        assert_eq!(config.name.as_deref(), Some("Cafe"));
        assert_eq!((config.open, config.close), (840, 1380));
        assert_eq!(config.granularity, 60);
        assert_eq!(config.max_duration, 8);
        assert_eq!(config.price_per_unit_hour, dec!(10));
        assert_eq!(config.sub_units, vec!["C1", "C2", "C3"]);
        assert_eq!(config.slots, None);
    }

    #[test]
    fn insert_resource_defaults() {
        let sql = format!("INSERT INTO resources (id, open, close) VALUES ('{RID}', '09:00', '12:30')");
        let Command::InsertResource { config } = parse_sql(&sql).unwrap() else {
            panic!("expected InsertResource");
        };
        assert_eq!(config.max_duration, 3);
        assert_eq!(config.price_per_unit_hour, Decimal::ZERO);
        assert!(config.sub_units.is_empty());
    }

    #[test]
    fn insert_resource_positional_with_slots() {
        let sql = format!(
            "INSERT INTO resources VALUES ('{RID}', NULL, '14:00', '23:00', 30, 4, 12.5, NULL, '18:00,20:30', 'Room 2')"
        );
        let Command::InsertResource { config } = parse_sql(&sql).unwrap() else {
            panic!("expected InsertResource");
        };
        assert_eq!(config.name, None);
        assert_eq!(config.granularity, 30);
        assert_eq!(config.price_per_unit_hour, dec!(12.5));
        assert_eq!(config.slots, Some(vec![1080, 1230]));
        assert_eq!(config.room.as_deref(), Some("Room 2"));
    }

    #[test]
    fn insert_resource_requires_hours() {
        let sql = format!("INSERT INTO resources (id, open) VALUES ('{RID}', '14:00')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::MissingColumn("resources", "close"))));
    }

    #[test]
    fn insert_booking_named_columns() {
        let sql = format!(
            "INSERT INTO bookings (resource_id, sub_unit_ids, date, start, duration, customer_name, customer_email) \
             VALUES ('{RID}', 'C1', '2025-06-01', '18:00', 2, 'Alice', 'alice@example.com')"
        );
        let Command::InsertBooking { request } = parse_sql(&sql).unwrap() else {
            panic!("expected InsertBooking");
        };
        assert_eq!(request.resource_id, rid());
        assert_eq!(request.sub_unit_ids, vec!["C1"]);
        assert_eq!(request.date, NaiveDate::from_ymd_opt(2025, 6, 1).unwrap());
        assert_eq!(request.start, 18 * 60);
        assert_eq!(request.duration, 2);
        assert_eq!(request.customer.email.as_deref(), Some("alice@example.com"));
        assert_eq!(request.customer.phone, None);
        assert_eq!(request.status, None);
    }

    #[test]
    fn insert_booking_positional_with_id_and_status() {
        let sql = format!(
            "INSERT INTO bookings VALUES ('{BID}', '{RID}', NULL, '2025-06-01', '22:00', 1, 'Bob', NULL, '555-0101', 'confirmed')"
        );
        let Command::InsertBooking { request } = parse_sql(&sql).unwrap() else {
            panic!("expected InsertBooking");
        };
        assert_eq!(request.id.to_string(), BID);
        assert!(request.sub_unit_ids.is_empty());
        assert_eq!(request.customer.phone.as_deref(), Some("555-0101"));
        assert_eq!(request.status, Some(BookingStatus::Confirmed));
    }

    #[test]
    fn multi_row_insert_is_batch() {
        let sql = format!(
            "INSERT INTO bookings (resource_id, sub_unit_ids, date, start, duration, customer_name, customer_email) VALUES \
             ('{RID}', 'C1', '2025-06-01', '18:00', 1, 'A', 'a@x'), \
             ('{RID}', 'C2', '2025-06-01', '19:00', 2, 'A', 'a@x')"
        );
        let Command::BatchInsertBookings { requests } = parse_sql(&sql).unwrap() else {
            panic!("expected BatchInsertBookings");
        };
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].start, 19 * 60);
        assert_ne!(requests[0].id, requests[1].id);
    }

    #[test]
    fn insert_booking_rejects_unknown_column_and_bad_values() {
        let unknown = format!("INSERT INTO bookings (resource_id, seat) VALUES ('{RID}', 'C1')");
        assert!(matches!(parse_sql(&unknown), Err(SqlError::UnknownColumn("bookings", _))));

        let bad_time = format!(
            "INSERT INTO bookings (resource_id, date, start, duration, customer_name) VALUES ('{RID}', '2025-06-01', '6pm', 1, 'A')"
        );
        assert!(matches!(parse_sql(&bad_time), Err(SqlError::Parse(_))));

        let bad_status = format!(
            "INSERT INTO bookings (resource_id, date, start, duration, customer_name, status) VALUES ('{RID}', '2025-06-01', '18:00', 1, 'A', 'maybe')"
        );
        assert!(matches!(parse_sql(&bad_status), Err(SqlError::Parse(_))));
    }

    #[test]
    fn update_booking_status_and_payment() {
        let sql = format!("UPDATE bookings SET status = 'cancelled' WHERE id = '{BID}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::UpdateBookingStatus {
                id: Ulid::from_string(BID).unwrap(),
                status: BookingStatus::Cancelled,
            }
        );

        let sql = format!("UPDATE bookings SET payment_status = 'failed' WHERE id = '{BID}'");
        assert!(matches!(
            parse_sql(&sql).unwrap(),
            Command::UpdatePaymentStatus { payment_status: PaymentStatus::Failed, .. }
        ));

        let both = format!("UPDATE bookings SET status = 'confirmed', payment_status = 'completed' WHERE id = '{BID}'");
        assert!(matches!(parse_sql(&both), Err(SqlError::Unsupported(_))));

        let no_id = "UPDATE bookings SET status = 'confirmed'";
        assert!(matches!(parse_sql(no_id), Err(SqlError::MissingFilter("id"))));
    }

    #[test]
    fn update_resource_builds_patch() {
        let sql = format!("UPDATE resources SET price = 12.5, name = NULL, close = '24:00' WHERE id = '{RID}'");
        let Command::UpdateResource { id, patch } = parse_sql(&sql).unwrap() else {
            panic!("expected UpdateResource");
        };
        assert_eq!(id, rid());
        assert_eq!(patch.price_per_unit_hour, Some(dec!(12.5)));
        assert_eq!(patch.name, Some(None));
        assert_eq!(patch.close, Some(1440));
        assert_eq!(patch.open, None);
    }

    #[test]
    fn delete_statements() {
        let sql = format!("DELETE FROM bookings WHERE id = '{BID}'");
        assert!(matches!(parse_sql(&sql).unwrap(), Command::DeleteBooking { .. }));
        let sql = format!("DELETE FROM resources WHERE id = '{RID}'");
        assert_eq!(parse_sql(&sql).unwrap(), Command::DeleteResource { id: rid() });
    }

    #[test]
    fn select_availability() {
        let sql = format!(
            "SELECT * FROM availability WHERE resource_id = '{RID}' AND date = '2025-06-01' AND start = '19:00' AND duration = 1"
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectAvailability {
                resource_id: rid(),
                date: NaiveDate::from_ymd_opt(2025, 6, 1).unwrap(),
                start: 19 * 60,
                duration: 1,
            }
        );

        let missing = format!("SELECT * FROM availability WHERE resource_id = '{RID}' AND date = '2025-06-01'");
        assert!(matches!(parse_sql(&missing), Err(SqlError::MissingFilter("start"))));
    }

    #[test]
    fn select_slots_defaults_duration() {
        let sql = format!("SELECT * FROM slots WHERE resource_id = '{RID}' AND date = '2025-06-01'");
        assert!(matches!(parse_sql(&sql).unwrap(), Command::SelectSlots { duration: 1, .. }));
    }

    #[test]
    fn select_bookings_filters_and_order() {
        let sql = format!(
            "SELECT * FROM bookings WHERE status = 'pending' AND (date = '2025-06-01' AND search = 'ali') \
             AND resource_id = '{RID}' ORDER BY date DESC"
        );
        let Command::SelectBookings { id, filter } = parse_sql(&sql).unwrap() else {
            panic!("expected SelectBookings");
        };
        assert_eq!(id, None);
        assert_eq!(filter.status, Some(BookingStatus::Pending));
        assert_eq!(filter.search.as_deref(), Some("ali"));
        assert_eq!(filter.resource_id, Some(rid()));
        assert_eq!(filter.order, SortOrder::NewestFirst);

        let plain = parse_sql("SELECT * FROM bookings").unwrap();
        assert_eq!(
            plain,
            Command::SelectBookings { id: None, filter: BookingFilter::default() }
        );

        let range = "SELECT * FROM bookings WHERE duration > 1";
        assert!(matches!(parse_sql(range), Err(SqlError::Unsupported(_))));
        let unknown = "SELECT * FROM bookings WHERE colour = 'red'";
        assert!(matches!(parse_sql(unknown), Err(SqlError::UnknownColumn("bookings", _))));
    }

    #[test]
    fn listen_and_unlisten() {
        let sql = format!("LISTEN resource_{RID}");
        assert_eq!(parse_sql(&sql).unwrap(), Command::Listen { channel: format!("resource_{RID}") });
        let sql = format!("unlisten \"resource_{RID}\";");
        assert_eq!(parse_sql(&sql).unwrap(), Command::Unlisten { channel: format!("resource_{RID}") });
        assert_eq!(parse_sql("UNLISTEN *").unwrap(), Command::UnlistenAll);
    }

    #[test]
    fn unknown_table_and_empty() {
        assert!(matches!(
            parse_sql("DELETE FROM rules WHERE id = '01ARZ3NDEKTSV4RRFFQ69G5FAV'"),
            Err(SqlError::UnknownTable(_))
        ));
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
    }
}
