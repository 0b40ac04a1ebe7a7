use chrono::NaiveDate;
use rust_decimal::Decimal;
use sqlparser::ast::{
    self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    UpsertUser(UserInfo),
    UpsertListing(Listing),
    InsertBooking(NewBooking),
    ConfirmBooking { id: Ulid },
    CancelBooking { id: Ulid },
    DeleteBooking { id: Ulid },
    SelectBooking { id: Ulid },
    SelectBookings { mine: bool, filter: BookingFilter },
    SelectPayments,
    SelectBookingLogs { booking_id: Ulid },
    SelectHostStats,
    SelectRenterStats,
    SelectCommissionStats,
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// VALUES of a single-row INSERT, addressable by column name when a column
/// list is given and by position otherwise.
struct Row<'a> {
    table: &'static str,
    columns: Vec<String>,
    values: &'a [Expr],
}

impl<'a> Row<'a> {
    fn get(&self, column: &str, position: usize) -> Option<&'a Expr> {
        if self.columns.is_empty() {
            self.values.get(position)
        } else {
            self.columns
                .iter()
                .position(|c| c == column)
                .and_then(|i| self.values.get(i))
        }
    }

    fn require(&self, column: &'static str, position: usize) -> Result<&'a Expr, SqlError> {
        self.get(column, position)
            .ok_or(SqlError::MissingColumn(self.table, column))
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let rows = extract_insert_rows(insert)?;
    if rows.len() != 1 {
        return Err(SqlError::Unsupported("multi-row INSERT".into()));
    }
    let columns: Vec<String> = insert
        .columns
        .iter()
        .map(|c| c.value.to_lowercase())
        .collect();
    if !columns.is_empty() && columns.len() != rows[0].len() {
        return Err(SqlError::WrongArity(columns.len(), rows[0].len()));
    }
    let row = |table: &'static str| Row {
        table,
        columns: columns.clone(),
        values: &rows[0],
    };

    match table.as_str() {
        "users" => {
            let r = row("users");
            Ok(Command::UpsertUser(UserInfo {
                id: parse_ulid(r.require("id", 0)?)?,
                is_staff: r.get("is_staff", 1).map(parse_bool).transpose()?.unwrap_or(false),
                is_host: r.get("is_host", 2).map(parse_bool).transpose()?.unwrap_or(false),
            }))
        }
        "listings" => {
            let r = row("listings");
            Ok(Command::UpsertListing(Listing {
                id: parse_ulid(r.require("id", 0)?)?,
                owner_id: parse_ulid(r.require("owner_id", 1)?)?,
                daily_price: parse_decimal_or_null(r.require("daily_price", 2)?)?,
                city: parse_string(r.require("city", 3)?)?,
                is_active: r.get("is_active", 4).map(parse_bool).transpose()?.unwrap_or(true),
            }))
        }
        "bookings" => {
            let r = row("bookings");
            Ok(Command::InsertBooking(NewBooking {
                id: parse_ulid(r.require("id", 0)?)?,
                listing_id: parse_ulid(r.require("listing_id", 1)?)?,
                start_date: parse_date(r.require("start_date", 2)?)?,
                end_date: parse_date(r.require("end_date", 3)?)?,
                message: r.get("message", 4).map(parse_string_or_null).transpose()?.flatten(),
            }))
        }
        "confirmations" => {
            let r = row("confirmations");
            Ok(Command::ConfirmBooking {
                id: parse_ulid(r.require("booking_id", 0)?)?,
            })
        }
        "cancellations" => {
            let r = row("cancellations");
            Ok(Command::CancelBooking {
                id: parse_ulid(r.require("booking_id", 0)?)?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    match table.as_str() {
        "bookings" => Ok(Command::DeleteBooking {
            id: extract_where_id(&delete.selection)?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

#[derive(Default)]
struct Filters {
    id: Option<Ulid>,
    booking_id: Option<Ulid>,
    status: Option<BookingStatus>,
    start_date: Option<NaiveDate>,
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

    let mut filters = Filters::default();
    if let Some(selection) = &select.selection {
        extract_filters(selection, &mut filters)?;
    }
    let filter = BookingFilter {
        status: filters.status,
        start_date: filters.start_date,
    };

    match table.as_str() {
        "bookings" => match filters.id {
            Some(id) => Ok(Command::SelectBooking { id }),
            None => Ok(Command::SelectBookings {
                mine: false,
                filter,
            }),
        },
        "my_bookings" => Ok(Command::SelectBookings { mine: true, filter }),
        "payments" => Ok(Command::SelectPayments),
        "booking_logs" => Ok(Command::SelectBookingLogs {
            booking_id: filters
                .booking_id
                .ok_or(SqlError::MissingFilter("booking_id"))?,
        }),
        "host_stats" => Ok(Command::SelectHostStats),
        "renter_stats" => Ok(Command::SelectRenterStats),
        "commission_stats" => Ok(Command::SelectCommissionStats),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn extract_filters(expr: &Expr, filters: &mut Filters) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => extract_filters(inner, filters),
        Expr::BinaryOp { left, op, right } => match op {
            ast::BinaryOperator::And => {
                extract_filters(left, filters)?;
                extract_filters(right, filters)
            }
            ast::BinaryOperator::Eq => {
                match expr_column_name(left).as_deref() {
                    Some("id") => filters.id = Some(parse_ulid(right)?),
                    Some("booking_id") => filters.booking_id = Some(parse_ulid(right)?),
                    Some("status") => {
                        let s = parse_string(right)?;
                        filters.status =
                            Some(BookingStatus::parse(&s).ok_or(SqlError::BadValue("status", s))?);
                    }
                    Some("start_date") => filters.start_date = Some(parse_date(right)?),
                    Some(other) => return Err(SqlError::UnsupportedFilter(other.to_string())),
                    None => return Err(SqlError::Unsupported(format!("{expr}"))),
                }
                Ok(())
            }
            _ => Err(SqlError::Unsupported(format!("operator {op}"))),
        },
        _ => Err(SqlError::Unsupported(format!("{expr}"))),
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

fn extract_insert_rows(insert: &ast::Insert) -> Result<&[Vec<Expr>], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            Ok(&values.rows)
        }
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

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
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

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_string(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID {s}: {e}")))
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_string(expr)?;
    s.parse()
        .map_err(|e| SqlError::Parse(format!("bad date {s} (expected YYYY-MM-DD): {e}")))
}

fn parse_decimal_or_null(expr: &Expr) -> Result<Option<Decimal>, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr: inner,
    } = expr
    {
        return Ok(parse_decimal_or_null(inner)?.map(|d| -d));
    }
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        Some(Value::Number(s, _)) | Some(Value::SingleQuotedString(s)) => s
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| SqlError::Parse(format!("bad decimal {s}: {e}"))),
        Some(value) => Err(SqlError::Parse(format!("expected number, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
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

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    WrongArity(usize, usize),
    MissingColumn(&'static str, &'static str),
    MissingFilter(&'static str),
    UnsupportedFilter(String),
    BadValue(&'static str, String),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::WrongArity(columns, values) => {
                write!(f, "{columns} columns but {values} values")
            }
            SqlError::MissingColumn(t, col) => write!(f, "{t}: missing column {col}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::UnsupportedFilter(col) => write!(f, "cannot filter on {col}"),
            SqlError::BadValue(col, v) => write!(f, "bad value for {col}: {v}"),
        }
    }
}

impl std::error::Error for SqlError {}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const A: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";
    const B: &str = "01BX5ZZKBKACTAV9WEVGEMMVRZ";

    fn ulid(s: &str) -> Ulid {
        Ulid::from_string(s).unwrap()
    }

    #[test]
    fn parse_insert_user() {
        let sql = format!("INSERT INTO users (id, is_staff, is_host) VALUES ('{A}', false, true)");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::UpsertUser(UserInfo {
                id: ulid(A),
                is_staff: false,
                is_host: true,
            })
        );
    }

    #[test]
    fn parse_insert_user_defaults_to_plain() {
        let sql = format!("INSERT INTO users (id) VALUES ('{A}')");
        match parse_sql(&sql).unwrap() {
            Command::UpsertUser(u) => assert!(!u.is_staff && !u.is_host),
            cmd => panic!("expected UpsertUser, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_listing() {
        let sql = format!(
            "INSERT INTO listings (id, owner_id, daily_price, city) VALUES ('{A}', '{B}', 89.90, 'Berlin')"
        );
        match parse_sql(&sql).unwrap() {
            Command::UpsertListing(l) => {
                assert_eq!(l.id, ulid(A));
                assert_eq!(l.owner_id, ulid(B));
                assert_eq!(l.daily_price, Some(dec!(89.90)));
                assert_eq!(l.city, "Berlin");
                assert!(l.is_active);
            }
            cmd => panic!("expected UpsertListing, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_listing_quoted_price_and_null() {
        let sql = format!(
            "INSERT INTO listings (id, owner_id, daily_price, city, is_active) VALUES ('{A}', '{B}', NULL, 'Leipzig', 'false')"
        );
        match parse_sql(&sql).unwrap() {
            Command::UpsertListing(l) => {
                assert_eq!(l.daily_price, None);
                assert!(!l.is_active);
            }
            cmd => panic!("expected UpsertListing, got {cmd:?}"),
        }
        let sql = format!(
            "INSERT INTO listings (id, owner_id, daily_price, city) VALUES ('{A}', '{B}', '120.5', 'Hamburg')"
        );
        match parse_sql(&sql).unwrap() {
            Command::UpsertListing(l) => assert_eq!(l.daily_price, Some(dec!(120.5))),
            cmd => panic!("expected UpsertListing, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_booking_by_column_name() {
        let sql = format!(
            "INSERT INTO bookings (listing_id, id, end_date, start_date, message) VALUES ('{B}', '{A}', '2030-06-05', '2030-06-01', 'Late arrival')"
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::InsertBooking(NewBooking {
                id: ulid(A),
                listing_id: ulid(B),
                start_date: "2030-06-01".parse().unwrap(),
                end_date: "2030-06-05".parse().unwrap(),
                message: Some("Late arrival".into()),
            })
        );
    }

    #[test]
    fn parse_insert_booking_positional() {
        let sql = format!("INSERT INTO bookings VALUES ('{A}', '{B}', '2030-06-01', '2030-06-05')");
        match parse_sql(&sql).unwrap() {
            Command::InsertBooking(b) => assert_eq!(b.message, None),
            cmd => panic!("expected InsertBooking, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_booking_bad_date() {
        let sql = format!(
            "INSERT INTO bookings (id, listing_id, start_date, end_date) VALUES ('{A}', '{B}', '06/01/2030', '2030-06-05')"
        );
        assert!(matches!(parse_sql(&sql), Err(SqlError::Parse(_))));
    }

    #[test]
    fn parse_insert_missing_column() {
        let sql = format!("INSERT INTO bookings (id, listing_id) VALUES ('{A}', '{B}')");
        assert!(matches!(
            parse_sql(&sql),
            Err(SqlError::MissingColumn("bookings", "start_date"))
        ));
    }

    #[test]
    fn parse_confirm_and_cancel() {
        let sql = format!("INSERT INTO confirmations (booking_id) VALUES ('{A}')");
        assert_eq!(parse_sql(&sql).unwrap(), Command::ConfirmBooking { id: ulid(A) });
        let sql = format!("INSERT INTO cancellations (booking_id) VALUES ('{A}')");
        assert_eq!(parse_sql(&sql).unwrap(), Command::CancelBooking { id: ulid(A) });
    }

    #[test]
    fn parse_delete_booking() {
        let sql = format!("DELETE FROM bookings WHERE id = '{A}'");
        assert_eq!(parse_sql(&sql).unwrap(), Command::DeleteBooking { id: ulid(A) });
        assert!(matches!(
            parse_sql("DELETE FROM bookings"),
            Err(SqlError::MissingFilter("id"))
        ));
        assert!(matches!(
            parse_sql(&format!("DELETE FROM listings WHERE id = '{A}'")),
            Err(SqlError::UnknownTable(_))
        ));
    }

    #[test]
    fn parse_select_bookings_with_filters() {
        let cmd = parse_sql(
            "SELECT * FROM my_bookings WHERE status = 'Confirmed' AND start_date = '2030-06-01'",
        )
        .unwrap();
        assert_eq!(
            cmd,
            Command::SelectBookings {
                mine: true,
                filter: BookingFilter {
                    status: Some(BookingStatus::Confirmed),
                    start_date: Some("2030-06-01".parse().unwrap()),
                },
            }
        );
        assert_eq!(
            parse_sql("SELECT * FROM bookings").unwrap(),
            Command::SelectBookings {
                mine: false,
                filter: BookingFilter::default(),
            }
        );
    }

    #[test]
    fn parse_select_single_booking() {
        let sql = format!("SELECT * FROM bookings WHERE id = '{A}'");
        assert_eq!(parse_sql(&sql).unwrap(), Command::SelectBooking { id: ulid(A) });
    }

    #[test]
    fn parse_select_rejects_unknown_status_and_filter() {
        assert!(matches!(
            parse_sql("SELECT * FROM bookings WHERE status = 'paid'"),
            Err(SqlError::BadValue("status", _))
        ));
        assert!(matches!(
            parse_sql("SELECT * FROM bookings WHERE city = 'Berlin'"),
            Err(SqlError::UnsupportedFilter(_))
        ));
        assert!(parse_sql("SELECT * FROM bookings WHERE start_date > '2030-01-01'").is_err());
    }

    #[test]
    fn parse_select_logs_requires_booking() {
        let sql = format!("SELECT * FROM booking_logs WHERE booking_id = '{A}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectBookingLogs {
                booking_id: ulid(A)
            }
        );
        assert!(matches!(
            parse_sql("SELECT * FROM booking_logs"),
            Err(SqlError::MissingFilter("booking_id"))
        ));
    }

    #[test]
    fn parse_select_stats_and_payments() {
        assert_eq!(parse_sql("SELECT * FROM payments").unwrap(), Command::SelectPayments);
        assert_eq!(parse_sql("SELECT * FROM host_stats").unwrap(), Command::SelectHostStats);
        assert_eq!(parse_sql("SELECT * FROM renter_stats").unwrap(), Command::SelectRenterStats);
        assert_eq!(
            parse_sql("SELECT * FROM commission_stats").unwrap(),
            Command::SelectCommissionStats
        );
    }

    #[test]
    fn parse_unknown_table_errors() {
        let sql = format!("INSERT INTO foobar (id) VALUES ('{A}')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownTable(_))));
    }

    #[test]
    fn parse_multi_row_insert_rejected() {
        let sql = format!("INSERT INTO users (id) VALUES ('{A}'), ('{B}')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn parse_empty_errors() {
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
    }
}
