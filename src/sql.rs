use chrono::NaiveDate;
use sqlparser::ast::{
    self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// What an `INSERT INTO status_changes` asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusRequest {
    /// awaiting-payment → payment-pending-confirmation
    PaymentPending,
    /// cancellation-requested → cancelled | refunded | credit-issued
    Resolve(BookingStatus),
    /// Group session scheduled → completed
    CompleteSession,
}

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertTutor {
        id: Ulid,
        name: String,
        utc_offset_minutes: i32,
    },
    InsertBooking {
        id: Ulid,
        tutor_id: Ulid,
        start: Ms,
        end: Ms,
        lesson_type: String,
        price_cents: u64,
        user_id: Option<UserId>,
    },
    InsertGroupSession {
        id: Ulid,
        tutor_id: Ulid,
        start: Ms,
        end: Ms,
        title: String,
        max_students: u32,
    },
    InsertTimeOff {
        id: Ulid,
        tutor_id: Ulid,
        start: Ms,
        end: Ms,
        reason: String,
    },
    Reschedule {
        id: Ulid,
        start: Ms,
        end: Ms,
    },
    /// `DELETE FROM bookings | group_sessions | time_off`.
    Cancel {
        id: Ulid,
        reason: Option<String>,
    },
    SetStatus {
        id: Ulid,
        status: StatusRequest,
        reason: Option<String>,
    },
    RegisterParticipant {
        session_id: Ulid,
        user_id: Option<UserId>,
    },
    UnregisterParticipant {
        session_id: Ulid,
        user_id: Option<UserId>,
    },
    ApplyPayment {
        notice: PaymentNotice,
    },
    SelectAvailability {
        tutor_id: Ulid,
        day: NaiveDate,
        min_duration: Option<Ms>,
    },
    SelectTutors,
    SelectBookings {
        id: Option<Ulid>,
        tutor_id: Option<Ulid>,
        user_id: Option<UserId>,
    },
    SelectGroupSessions {
        tutor_id: Ulid,
    },
    SelectTimeOff {
        tutor_id: Ulid,
    },
    SelectCredits {
        user_id: Option<UserId>,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }
    if stmts.len() > 1 {
        return Err(SqlError::Unsupported("multiple statements".into()));
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;
    let v = Row {
        table: static_table(&table)?,
        values: &values,
    };

    match v.table {
        "tutors" => Ok(Command::InsertTutor {
            id: parse_ulid(v.required(0, 2)?)?,
            name: parse_string(v.required(1, 2)?)?,
            utc_offset_minutes: v.optional(2).map(parse_i32).transpose()?.unwrap_or(0),
        }),
        "bookings" => Ok(Command::InsertBooking {
            id: parse_ulid(v.required(0, 6)?)?,
            tutor_id: parse_ulid(v.required(1, 6)?)?,
            start: parse_i64(v.required(2, 6)?)?,
            end: parse_i64(v.required(3, 6)?)?,
            lesson_type: parse_string(v.required(4, 6)?)?,
            price_cents: parse_u64(v.required(5, 6)?)?,
            user_id: v.optional(6).map(parse_string_or_null).transpose()?.flatten(),
        }),
        "group_sessions" => Ok(Command::InsertGroupSession {
            id: parse_ulid(v.required(0, 6)?)?,
            tutor_id: parse_ulid(v.required(1, 6)?)?,
            start: parse_i64(v.required(2, 6)?)?,
            end: parse_i64(v.required(3, 6)?)?,
            title: parse_string(v.required(4, 6)?)?,
            max_students: parse_u32(v.required(5, 6)?)?,
        }),
        "time_off" => Ok(Command::InsertTimeOff {
            id: parse_ulid(v.required(0, 4)?)?,
            tutor_id: parse_ulid(v.required(1, 4)?)?,
            start: parse_i64(v.required(2, 4)?)?,
            end: parse_i64(v.required(3, 4)?)?,
            reason: v
                .optional(4)
                .map(parse_string_or_null)
                .transpose()?
                .flatten()
                .unwrap_or_default(),
        }),
        "reschedules" => Ok(Command::Reschedule {
            id: parse_ulid(v.required(0, 3)?)?,
            start: parse_i64(v.required(1, 3)?)?,
            end: parse_i64(v.required(2, 3)?)?,
        }),
        "status_changes" => Ok(Command::SetStatus {
            id: parse_ulid(v.required(0, 2)?)?,
            status: parse_status_request(&parse_string(v.required(1, 2)?)?)?,
            reason: v.optional(2).map(parse_string_or_null).transpose()?.flatten(),
        }),
        "participants" => Ok(Command::RegisterParticipant {
            session_id: parse_ulid(v.required(0, 1)?)?,
            user_id: v.optional(1).map(parse_string_or_null).transpose()?.flatten(),
        }),
        "payments" => {
            let payment_id = parse_string(v.required(0, 4)?)?;
            let user_id = parse_string(v.required(1, 4)?)?;
            let product_kind = parse_string(v.required(2, 4)?)?.to_lowercase();
            let reference = v.required(3, 4)?;
            let product = match product_kind.as_str() {
                "package" => PaymentProduct::Package {
                    credit_type: parse_string(reference)?,
                    lessons: parse_u32(v.required(4, 5)?)?,
                },
                "booking" => PaymentProduct::Booking {
                    booking_id: parse_ulid(reference)?,
                },
                other => {
                    return Err(SqlError::Parse(format!(
                        "unknown product '{other}' (expected package or booking)"
                    )));
                }
            };
            Ok(Command::ApplyPayment {
                notice: PaymentNotice {
                    payment_id,
                    user_id,
                    product,
                },
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_status_request(status: &str) -> Result<StatusRequest, SqlError> {
    if status == SessionStatus::Completed.as_str() {
        return Ok(StatusRequest::CompleteSession);
    }
    match BookingStatus::parse(status) {
        Some(BookingStatus::PaymentPendingConfirmation) => Ok(StatusRequest::PaymentPending),
        Some(
            s @ (BookingStatus::Cancelled | BookingStatus::Refunded | BookingStatus::CreditIssued),
        ) => Ok(StatusRequest::Resolve(s)),
        _ => Err(SqlError::Parse(format!("status '{status}' cannot be set directly"))),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = eq_filters(delete.selection.as_ref())?;

    match table.as_str() {
        "bookings" | "group_sessions" | "time_off" => Ok(Command::Cancel {
            id: parse_ulid(filters.required("id")?)?,
            reason: filters.get("reason").map(parse_string).transpose()?,
        }),
        "participants" => Ok(Command::UnregisterParticipant {
            session_id: parse_ulid(filters.required("session_id")?)?,
            user_id: filters.get("user_id").map(parse_string).transpose()?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;
    let filters = eq_filters(select.selection.as_ref())?;

    match table.as_str() {
        "availability" => {
            let day_text = parse_string(filters.required("day")?)?;
            let day = NaiveDate::parse_from_str(&day_text, "%Y-%m-%d")
                .map_err(|e| SqlError::Parse(format!("bad day '{day_text}': {e}")))?;
            Ok(Command::SelectAvailability {
                tutor_id: parse_ulid(filters.required("tutor_id")?)?,
                day,
                min_duration: filters.get("min_duration").map(parse_i64).transpose()?,
            })
        }
        "tutors" => Ok(Command::SelectTutors),
        "bookings" => {
            let cmd = Command::SelectBookings {
                id: filters.get("id").map(parse_ulid).transpose()?,
                tutor_id: filters.get("tutor_id").map(parse_ulid).transpose()?,
                user_id: filters.get("user_id").map(parse_string).transpose()?,
            };
            if matches!(
                cmd,
                Command::SelectBookings {
                    id: None,
                    tutor_id: None,
                    user_id: None
                }
            ) {
                return Err(SqlError::MissingFilter("id, tutor_id or user_id"));
            }
            Ok(cmd)
        }
        "group_sessions" => Ok(Command::SelectGroupSessions {
            tutor_id: parse_ulid(filters.required("tutor_id")?)?,
        }),
        "time_off" => Ok(Command::SelectTimeOff {
            tutor_id: parse_ulid(filters.required("tutor_id")?)?,
        }),
        "credits" => Ok(Command::SelectCredits {
            user_id: filters.get("user_id").map(parse_string).transpose()?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── Helpers ───────────────────────────────────────────────────

/// Tables we know, as `'static` names for arity errors.
const TABLES: &[&str] = &[
    "tutors",
    "bookings",
    "group_sessions",
    "time_off",
    "reschedules",
    "status_changes",
    "participants",
    "payments",
];

fn static_table(name: &str) -> Result<&'static str, SqlError> {
    TABLES
        .iter()
        .copied()
        .find(|t| *t == name)
        .ok_or_else(|| SqlError::UnknownTable(name.to_string()))
}

/// First VALUES row, read positionally.
struct Row<'a> {
    table: &'static str,
    values: &'a [Expr],
}

impl<'a> Row<'a> {
    fn required(&self, idx: usize, arity: usize) -> Result<&'a Expr, SqlError> {
        self.values
            .get(idx)
            .ok_or(SqlError::WrongArity(self.table, arity, self.values.len()))
    }

    fn optional(&self, idx: usize) -> Option<&'a Expr> {
        self.values.get(idx)
    }
}

/// `col = value` pairs joined by AND.
struct Filters(Vec<(String, Expr)>);

impl Filters {
    fn get(&self, col: &str) -> Option<&Expr> {
        self.0.iter().find(|(c, _)| c == col).map(|(_, e)| e)
    }

    fn required(&self, col: &'static str) -> Result<&Expr, SqlError> {
        self.get(col).ok_or(SqlError::MissingFilter(col))
    }
}

fn eq_filters(selection: Option<&Expr>) -> Result<Filters, SqlError> {
    let mut out = Vec::new();
    if let Some(expr) = selection {
        collect_eq_filters(expr, &mut out)?;
    }
    Ok(Filters(out))
}

fn collect_eq_filters(expr: &Expr, out: &mut Vec<(String, Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            collect_eq_filters(left, out)?;
            collect_eq_filters(right, out)
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            let col = expr_column_name(left)
                .ok_or_else(|| SqlError::Parse(format!("expected column, got {left}")))?;
            out.push((col, right.as_ref().clone()));
            Ok(())
        }
        Expr::Nested(inner) => collect_eq_filters(inner, out),
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
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

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID '{s}': {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected ULID string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_string(expr).map(Some),
    }
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        return parse_i64(expr)?
            .checked_neg()
            .ok_or_else(|| SqlError::Parse("integer overflow".into()));
    }
    match extract_value(expr) {
        // Extended-protocol parameters arrive as quoted text.
        Some(Value::Number(s, _)) | Some(Value::SingleQuotedString(s)) => s
            .parse()
            .map_err(|e| SqlError::Parse(format!("bad integer '{s}': {e}"))),
        Some(value) => Err(SqlError::Parse(format!("expected number, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_i32(expr: &Expr) -> Result<i32, SqlError> {
    let v = parse_i64(expr)?;
    i32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of i32 range")))
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_u64(expr: &Expr) -> Result<u64, SqlError> {
    let v = parse_i64(expr)?;
    u64::try_from(v).map_err(|_| SqlError::Parse(format!("{v} must not be negative")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected at least {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
