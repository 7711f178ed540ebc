use std::ops::ControlFlow;

use chrono::NaiveDate;
use sqlparser::ast::{visit_expressions, visit_expressions_mut, self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::limits::MAX_IN_CLAUSE_IDS;
use crate::model::*;

/// Parsed command from SQL input. One variant per action, carrying only
/// the fields that action needs.
#[derive(Debug, PartialEq)]
pub enum Command {
    SyncListing {
        id: Ulid,
        owner_id: Ulid,
        listing_type: ListingType,
        status: ListingStatus,
    },
    SetListingStatus {
        listing_id: Ulid,
        caller: Actor,
        status: ListingStatus,
    },
    RemoveListing {
        id: Ulid,
    },
    CreateBlock {
        id: Ulid,
        listing_id: Ulid,
        caller: Actor,
        start: NaiveDate,
        end: NaiveDate,
        is_available: bool,
        reason: Option<String>,
    },
    DeleteBlock {
        id: Ulid,
        caller: Actor,
    },
    Submit {
        id: Ulid,
        listing_id: Ulid,
        start: NaiveDate,
        end: NaiveDate,
        renter: Renter,
    },
    Confirm {
        request_id: Ulid,
        caller: Actor,
        response: Option<String>,
    },
    Decline {
        request_id: Ulid,
        caller: Actor,
        response: Option<String>,
    },
    Cancel {
        request_id: Ulid,
        caller: Actor,
    },
    SelectBlocks {
        listing_id: Ulid,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    },
    SelectRequest {
        id: Ulid,
    },
    SelectListingRequests {
        listing_id: Ulid,
    },
    SelectOpenRequests {
        listing_id: Ulid,
    },
    SelectConflicts {
        listing_ids: Vec<Ulid>,
        start: NaiveDate,
        end: NaiveDate,
    },
    ExpireOverdue,
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    parse_bound(sql, &[])
}

/// Parse a statement with `$N` placeholders bound to text values (`None`
/// binds NULL). Values are placed into the parsed tree as literals, so
/// their content is never re-read as SQL.
pub fn parse_bound(sql: &str, params: &[Option<String>]) -> Result<Command, SqlError> {
    let mut stmt = parse_statement(sql)?;
    bind_params(&mut stmt, params)?;
    match &stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// Highest `$N` placeholder index in the statement, 0 if none or unparsable.
pub fn placeholder_count(sql: &str) -> usize {
    let Ok(stmt) = parse_statement(sql) else {
        return 0;
    };
    let mut max = 0;
    let _ = visit_expressions(&stmt, |expr| {
        if let Some(n) = placeholder_index(expr) {
            max = max.max(n);
        }
        ControlFlow::<()>::Continue(())
    });
    max
}

fn parse_statement(sql: &str) -> Result<Statement, SqlError> {
    let dialect = PostgreSqlDialect {};
    let mut stmts =
        Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }
    Ok(stmts.swap_remove(0))
}

fn placeholder_index(expr: &Expr) -> Option<usize> {
    match extract_value(expr)? {
        Value::Placeholder(p) => p.strip_prefix('$')?.parse().ok(),
        _ => None,
    }
}

fn bind_params(stmt: &mut Statement, params: &[Option<String>]) -> Result<(), SqlError> {
    let flow = visit_expressions_mut(stmt, |expr| {
        let Expr::Value(ValueWithSpan { value, .. }) = expr else {
            return ControlFlow::Continue(());
        };
        let Value::Placeholder(p) = value else {
            return ControlFlow::Continue(());
        };
        let bound = p
            .strip_prefix('$')
            .and_then(|n| n.parse::<usize>().ok())
            .and_then(|n| n.checked_sub(1))
            .and_then(|i| params.get(i));
        match bound {
            Some(Some(text)) => *value = Value::SingleQuotedString(text.clone()),
            Some(None) => *value = Value::Null,
            None => return ControlFlow::Break(SqlError::Parse(format!("unbound parameter {p}"))),
        }
        ControlFlow::Continue(())
    });
    match flow {
        ControlFlow::Break(e) => Err(e),
        ControlFlow::Continue(()) => Ok(()),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;
    let arity = |n: usize| {
        if values.len() < n {
            Err(SqlError::WrongArity(table.clone(), n, values.len()))
        } else {
            Ok(())
        }
    };

    match table.as_str() {
        "listings" => {
            arity(4)?;
            Ok(Command::SyncListing {
                id: parse_ulid(&values[0])?,
                owner_id: parse_ulid(&values[1])?,
                listing_type: parse_keyword(&values[2])?,
                status: parse_keyword(&values[3])?,
            })
        }
        "listing_status" => {
            arity(3)?;
            Ok(Command::SetListingStatus {
                listing_id: parse_ulid(&values[0])?,
                caller: user_or_anonymous(&values[1])?,
                status: parse_keyword(&values[2])?,
            })
        }
        "blocks" => {
            arity(6)?;
            Ok(Command::CreateBlock {
                id: parse_ulid(&values[0])?,
                listing_id: parse_ulid(&values[1])?,
                caller: user_or_anonymous(&values[2])?,
                start: parse_date(&values[3])?,
                end: parse_date(&values[4])?,
                is_available: parse_bool(&values[5])?,
                reason: optional(&values, 6, parse_string_or_null)?,
            })
        }
        "requests" => {
            arity(5)?;
            let renter = match parse_ulid_or_null(&values[4])? {
                Some(user_id) => Renter::Registered { user_id },
                None => {
                    let name = optional(&values, 5, parse_string_or_null)?;
                    let phone = optional(&values, 6, parse_string_or_null)?;
                    let token = optional(&values, 7, parse_string_or_null)?;
                    match (name, phone, token) {
                        (Some(name), Some(phone), Some(cancel_token)) => Renter::Guest {
                            name,
                            phone,
                            cancel_token,
                        },
                        _ => return Err(SqlError::MissingRenter),
                    }
                }
            };
            Ok(Command::Submit {
                id: parse_ulid(&values[0])?,
                listing_id: parse_ulid(&values[1])?,
                start: parse_date(&values[2])?,
                end: parse_date(&values[3])?,
                renter,
            })
        }
        "confirmations" | "declines" => {
            arity(2)?;
            let request_id = parse_ulid(&values[0])?;
            let caller = user_or_anonymous(&values[1])?;
            let response = optional(&values, 2, parse_string_or_null)?;
            if table == "confirmations" {
                Ok(Command::Confirm { request_id, caller, response })
            } else {
                Ok(Command::Decline { request_id, caller, response })
            }
        }
        "cancellations" => {
            arity(2)?;
            let request_id = parse_ulid(&values[0])?;
            let caller = match parse_ulid_or_null(&values[1])? {
                Some(user_id) => Actor::User(user_id),
                None => match optional(&values, 2, parse_string_or_null)? {
                    Some(token) => Actor::Guest(token),
                    None => Actor::Anonymous,
                },
            };
            Ok(Command::Cancel { request_id, caller })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let selection = delete.selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    let filters = Filters::collect(selection)?;
    let id = parse_ulid(filters.eq("id").ok_or(SqlError::MissingFilter("id"))?)?;

    match table.as_str() {
        "listings" => Ok(Command::RemoveListing { id }),
        "blocks" => {
            let caller = match filters.eq("caller_id") {
                Some(expr) => user_or_anonymous(expr)?,
                None => Actor::Anonymous,
            };
            Ok(Command::DeleteBlock { id, caller })
        }
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
    let filters = match &select.selection {
        Some(selection) => Filters::collect(selection)?,
        None => Filters::default(),
    };
    let listing_id = || -> Result<Ulid, SqlError> {
        parse_ulid(filters.eq("listing_id").ok_or(SqlError::MissingFilter("listing_id"))?)
    };

    match table.as_str() {
        // Blocks overlapping [X, Y]: `end_date >= X AND start_date <= Y`.
        "blocks" => {
            if filters.gt_eq("start_date").is_some() || filters.lt_eq("end_date").is_some() {
                return Err(SqlError::Unsupported(
                    "blocks are windowed by overlap: end_date >= ... AND start_date <= ...".into(),
                ));
            }
            Ok(Command::SelectBlocks {
                listing_id: listing_id()?,
                start: filters.gt_eq("end_date").map(parse_date).transpose()?,
                end: filters.lt_eq("start_date").map(parse_date).transpose()?,
            })
        }
        "requests" => match filters.eq("id") {
            Some(id) => Ok(Command::SelectRequest { id: parse_ulid(id)? }),
            None => Ok(Command::SelectListingRequests {
                listing_id: listing_id()?,
            }),
        },
        "open_requests" => Ok(Command::SelectOpenRequests {
            listing_id: listing_id()?,
        }),
        "conflicts" => {
            let listing_ids = match (filters.in_list("listing_id"), filters.eq("listing_id")) {
                (Some(list), _) => {
                    if list.len() > MAX_IN_CLAUSE_IDS {
                        return Err(SqlError::TooManyIds(list.len()));
                    }
                    list.iter().map(parse_ulid).collect::<Result<Vec<_>, _>>()?
                }
                (None, Some(one)) => vec![parse_ulid(one)?],
                (None, None) => return Err(SqlError::MissingFilter("listing_id")),
            };
            Ok(Command::SelectConflicts {
                listing_ids,
                start: parse_date(filters.eq("start_date").ok_or(SqlError::MissingFilter("start_date"))?)?,
                end: parse_date(filters.eq("end_date").ok_or(SqlError::MissingFilter("end_date"))?)?,
            })
        }
        "expire_overdue" => Ok(Command::ExpireOverdue),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── WHERE clause ──────────────────────────────────────────────

/// Conjunction of simple column predicates.
#[derive(Default)]
struct Filters<'a> {
    preds: Vec<(String, Pred<'a>)>,
}

enum Pred<'a> {
    Eq(&'a Expr),
    GtEq(&'a Expr),
    LtEq(&'a Expr),
    In(&'a [Expr]),
}

impl<'a> Filters<'a> {
    fn collect(expr: &'a Expr) -> Result<Self, SqlError> {
        let mut filters = Filters::default();
        filters.walk(expr)?;
        Ok(filters)
    }

    fn walk(&mut self, expr: &'a Expr) -> Result<(), SqlError> {
        match expr {
            Expr::Nested(inner) => self.walk(inner),
            Expr::BinaryOp { left, op, right } => {
                let pred = match op {
                    ast::BinaryOperator::And => {
                        self.walk(left)?;
                        return self.walk(right);
                    }
                    ast::BinaryOperator::Eq => Pred::Eq(right),
                    ast::BinaryOperator::GtEq => Pred::GtEq(right),
                    ast::BinaryOperator::LtEq => Pred::LtEq(right),
                    other => return Err(SqlError::Unsupported(format!("operator {other}"))),
                };
                let col = expr_column_name(left)
                    .ok_or_else(|| SqlError::Parse(format!("expected column, got {left}")))?;
                self.preds.push((col, pred));
                Ok(())
            }
            Expr::InList {
                expr,
                list,
                negated: false,
            } => {
                let col = expr_column_name(expr)
                    .ok_or_else(|| SqlError::Parse(format!("expected column, got {expr}")))?;
                self.preds.push((col, Pred::In(list)));
                Ok(())
            }
            other => Err(SqlError::Unsupported(format!("filter {other}"))),
        }
    }

    fn eq(&self, col: &str) -> Option<&'a Expr> {
        self.preds.iter().find_map(|(c, p)| match p {
            Pred::Eq(e) if c == col => Some(*e),
            _ => None,
        })
    }

    fn gt_eq(&self, col: &str) -> Option<&'a Expr> {
        self.preds.iter().find_map(|(c, p)| match p {
            Pred::GtEq(e) if c == col => Some(*e),
            _ => None,
        })
    }

    fn lt_eq(&self, col: &str) -> Option<&'a Expr> {
        self.preds.iter().find_map(|(c, p)| match p {
            Pred::LtEq(e) if c == col => Some(*e),
            _ => None,
        })
    }

    fn in_list(&self, col: &str) -> Option<&'a [Expr]> {
        self.preds.iter().find_map(|(c, p)| match p {
            Pred::In(list) if c == col => Some(*list),
            _ => None,
        })
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

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.clone()),
            _ => Err(SqlError::Unsupported("multi-row VALUES".into())),
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

/// Trailing optional column: absent and NULL both mean None.
fn optional<T>(
    values: &[Expr],
    idx: usize,
    parse: fn(&Expr) -> Result<Option<T>, SqlError>,
) -> Result<Option<T>, SqlError> {
    values.get(idx).map_or(Ok(None), parse)
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    parse_ulid_or_null(expr)?.ok_or_else(|| SqlError::Parse("unexpected NULL id".into()))
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    match parse_string_or_null(expr)? {
        None => Ok(None),
        Some(s) => Ulid::from_string(&s)
            .map(Some)
            .map_err(|e| SqlError::Parse(format!("bad ULID: {e}"))),
    }
}

fn user_or_anonymous(expr: &Expr) -> Result<Actor, SqlError> {
    Ok(parse_ulid_or_null(expr)?.map_or(Actor::Anonymous, Actor::User))
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => Ok(Some(s.clone())),
        Some(value) => Err(SqlError::Parse(format!("expected string or NULL, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

/// Dates travel as `'YYYY-MM-DD'` text.
fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let text = parse_string_or_null(expr)?
        .ok_or_else(|| SqlError::Parse("unexpected NULL date".into()))?;
    NaiveDate::parse_from_str(&text, "%Y-%m-%d")
        .map_err(|e| SqlError::Parse(format!("bad date {text:?}: {e}")))
}

fn parse_keyword<T>(expr: &Expr) -> Result<T, SqlError>
where
    T: std::str::FromStr<Err = UnknownKeyword>,
{
    let text = parse_string_or_null(expr)?
        .ok_or_else(|| SqlError::Parse("unexpected NULL keyword".into()))?;
    text.parse().map_err(|e: UnknownKeyword| SqlError::Parse(e.to_string()))
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
            _ => Err(SqlError::Parse(format!("expected bool, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    WrongArity(String, usize, usize),
    MissingFilter(&'static str),
    MissingRenter,
    TooManyIds(usize),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::MissingRenter => {
                write!(f, "requests need renter_id or guest name, phone and cancel token")
            }
            SqlError::TooManyIds(n) => {
                write!(f, "too many ids in IN list: {n} (max {MAX_IN_CLAUSE_IDS})")
            }
        }
    }
}

impl std::error::Error for SqlError {}

#[cfg(test)]
mod tests {
    use super::*;

    const A: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";
    const B: &str = "01BX5ZZKBKACTAV9WEVGEMMVRZ";

    fn ulid(s: &str) -> Ulid {
        Ulid::from_string(s).unwrap()
    }

    fn d(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    #[test]
    fn parse_sync_listing() {
        let sql = format!("INSERT INTO listings VALUES ('{A}', '{B}', 'both', 'ACTIVE')");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SyncListing {
                id: ulid(A),
                owner_id: ulid(B),
                listing_type: ListingType::Both,
                status: ListingStatus::Active,
            }
        );
    }

    #[test]
    fn parse_bad_keyword() {
        let sql = format!("INSERT INTO listings VALUES ('{A}', '{B}', 'LEASE', 'ACTIVE')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Parse(_))));
    }

    #[test]
    fn parse_set_listing_status() {
        let sql = format!("INSERT INTO listing_status VALUES ('{A}', '{B}', 'SOLD')");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SetListingStatus {
                listing_id: ulid(A),
                caller: Actor::User(ulid(B)),
                status: ListingStatus::Sold,
            }
        );
    }

    #[test]
    fn parse_create_block() {
        let sql = format!(
            "INSERT INTO blocks VALUES ('{A}', '{B}', '{B}', '2026-06-01', '2026-06-05', false, 'maintenance')"
        );
        match parse_sql(&sql).unwrap() {
            Command::CreateBlock {
                start,
                end,
                is_available,
                reason,
                caller,
                ..
            } => {
                assert_eq!(start, d("2026-06-01"));
                assert_eq!(end, d("2026-06-05"));
                assert!(!is_available);
                assert_eq!(reason.as_deref(), Some("maintenance"));
                assert_eq!(caller, Actor::User(ulid(B)));
            }
            cmd => panic!("expected CreateBlock, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_create_block_without_reason() {
        let sql = format!(
            "INSERT INTO blocks VALUES ('{A}', '{B}', '{B}', '2026-06-01', '2026-06-05', 't')"
        );
        match parse_sql(&sql).unwrap() {
            Command::CreateBlock {
                start,
                is_available,
                reason,
                ..
            } => {
                assert_eq!(start, d("2026-06-01"));
                assert!(is_available);
                assert_eq!(reason, None);
            }
            cmd => panic!("expected CreateBlock, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_bad_date() {
        let sql = format!(
            "INSERT INTO blocks VALUES ('{A}', '{B}', '{B}', '2026-13-01', '2026-06-05', false)"
        );
        assert!(matches!(parse_sql(&sql), Err(SqlError::Parse(_))));
    }

    #[test]
    fn parse_submit_registered() {
        let sql = format!(
            "INSERT INTO requests VALUES ('{A}', '{B}', '2026-06-01', '2026-06-05', '{B}', NULL, NULL, NULL)"
        );
        match parse_sql(&sql).unwrap() {
            Command::Submit { renter, start, .. } => {
                assert_eq!(renter, Renter::Registered { user_id: ulid(B) });
                assert_eq!(start, d("2026-06-01"));
            }
            cmd => panic!("expected Submit, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_submit_guest() {
        let sql = format!(
            "INSERT INTO requests VALUES ('{A}', '{B}', '2026-06-01', '2026-06-05', NULL, 'Ana', '+15550100', 'tok-0123456789abcdef')"
        );
        match parse_sql(&sql).unwrap() {
            Command::Submit { renter, .. } => assert_eq!(
                renter,
                Renter::Guest {
                    name: "Ana".into(),
                    phone: "+15550100".into(),
                    cancel_token: "tok-0123456789abcdef".into(),
                }
            ),
            cmd => panic!("expected Submit, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_submit_without_renter() {
        let sql = format!(
            "INSERT INTO requests VALUES ('{A}', '{B}', '2026-06-01', '2026-06-05', NULL, 'Ana', NULL, NULL)"
        );
        assert!(matches!(parse_sql(&sql), Err(SqlError::MissingRenter)));
    }

    #[test]
    fn parse_confirm_and_decline() {
        let sql = format!("INSERT INTO confirmations VALUES ('{A}', '{B}', 'see you')");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::Confirm {
                request_id: ulid(A),
                caller: Actor::User(ulid(B)),
                response: Some("see you".into()),
            }
        );
        let sql = format!("INSERT INTO declines VALUES ('{A}', NULL)");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::Decline {
                request_id: ulid(A),
                caller: Actor::Anonymous,
                response: None,
            }
        );
    }

    #[test]
    fn parse_cancel_callers() {
        let by_user = format!("INSERT INTO cancellations VALUES ('{A}', '{B}', NULL)");
        let by_guest = format!("INSERT INTO cancellations VALUES ('{A}', NULL, 'tok-0123456789abcdef')");
        let anonymous = format!("INSERT INTO cancellations VALUES ('{A}', NULL)");
        let callers: Vec<Actor> = [by_user, by_guest, anonymous]
            .iter()
            .map(|sql| match parse_sql(sql).unwrap() {
                Command::Cancel { caller, .. } => caller,
                cmd => panic!("expected Cancel, got {cmd:?}"),
            })
            .collect();
        assert_eq!(
            callers,
            vec![
                Actor::User(ulid(B)),
                Actor::Guest("tok-0123456789abcdef".into()),
                Actor::Anonymous,
            ]
        );
    }

    #[test]
    fn parse_deletes() {
        let sql = format!("DELETE FROM listings WHERE id = '{A}'");
        assert_eq!(parse_sql(&sql).unwrap(), Command::RemoveListing { id: ulid(A) });

        let sql = format!("DELETE FROM blocks WHERE id = '{A}' AND caller_id = '{B}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::DeleteBlock {
                id: ulid(A),
                caller: Actor::User(ulid(B)),
            }
        );

        let sql = "DELETE FROM blocks".to_string();
        assert!(matches!(parse_sql(&sql), Err(SqlError::MissingFilter("id"))));
    }

    #[test]
    fn parse_select_blocks_window() {
        let sql = format!(
            "SELECT * FROM blocks WHERE listing_id = '{A}' AND end_date >= '2026-06-01' AND start_date <= '2026-06-30'"
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectBlocks {
                listing_id: ulid(A),
                start: Some(d("2026-06-01")),
                end: Some(d("2026-06-30")),
            }
        );
        let sql = format!("SELECT * FROM blocks WHERE listing_id = '{A}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectBlocks {
                listing_id: ulid(A),
                start: None,
                end: None,
            }
        );
    }

    #[test]
    fn parse_select_blocks_rejects_containment_filters() {
        let sql = format!(
            "SELECT * FROM blocks WHERE listing_id = '{A}' AND start_date >= '2026-06-01'"
        );
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn bound_text_is_never_reparsed() {
        let sql = "INSERT INTO confirmations VALUES ($1, $2, $3)";
        let params = vec![
            Some(A.to_string()),
            Some(B.to_string()),
            Some("bring $1 cash, it's '$2'".to_string()),
        ];
        assert_eq!(
            parse_bound(sql, &params).unwrap(),
            Command::Confirm {
                request_id: ulid(A),
                caller: Actor::User(ulid(B)),
                response: Some("bring $1 cash, it's '$2'".into()),
            }
        );
    }

    #[test]
    fn bound_null_and_missing_params() {
        let sql = "INSERT INTO declines VALUES ($1, $2)";
        assert_eq!(
            parse_bound(sql, &[Some(A.to_string()), None]).unwrap(),
            Command::Decline {
                request_id: ulid(A),
                caller: Actor::Anonymous,
                response: None,
            }
        );
        assert!(matches!(parse_bound(sql, &[Some(A.to_string())]), Err(SqlError::Parse(_))));
    }

    #[test]
    fn parse_select_requests() {
        let by_id = format!("SELECT * FROM requests WHERE id = '{A}'");
        assert_eq!(parse_sql(&by_id).unwrap(), Command::SelectRequest { id: ulid(A) });
        let by_listing = format!("SELECT * FROM requests WHERE listing_id = '{A}'");
        assert_eq!(
            parse_sql(&by_listing).unwrap(),
            Command::SelectListingRequests { listing_id: ulid(A) }
        );
        let open = format!("SELECT * FROM open_requests WHERE listing_id = '{A}'");
        assert_eq!(
            parse_sql(&open).unwrap(),
            Command::SelectOpenRequests { listing_id: ulid(A) }
        );
        assert!(matches!(
            parse_sql("SELECT * FROM requests"),
            Err(SqlError::MissingFilter("listing_id"))
        ));
    }

    #[test]
    fn parse_select_conflicts_in_list() {
        let sql = format!(
            "SELECT * FROM conflicts WHERE listing_id IN ('{A}', '{B}') AND start_date = '2026-06-01' AND end_date = '2026-06-05'"
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectConflicts {
                listing_ids: vec![ulid(A), ulid(B)],
                start: d("2026-06-01"),
                end: d("2026-06-05"),
            }
        );
    }

    #[test]
    fn parse_select_conflicts_requires_dates() {
        let sql = format!("SELECT * FROM conflicts WHERE listing_id = '{A}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::MissingFilter("start_date"))));
    }

    #[test]
    fn parse_select_conflicts_bounds_ids() {
        let ids: Vec<String> = (0..=MAX_IN_CLAUSE_IDS).map(|_| format!("'{}'", Ulid::new())).collect();
        let sql = format!(
            "SELECT * FROM conflicts WHERE listing_id IN ({}) AND start_date = '2026-06-01' AND end_date = '2026-06-05'",
            ids.join(", ")
        );
        assert!(matches!(parse_sql(&sql), Err(SqlError::TooManyIds(_))));
    }

    #[test]
    fn parse_expire_overdue() {
        assert_eq!(parse_sql("SELECT * FROM expire_overdue").unwrap(), Command::ExpireOverdue);
    }

    #[test]
    fn parse_rejects_or_filters() {
        let sql = format!("SELECT * FROM requests WHERE id = '{A}' OR id = '{B}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn parse_unknown_table_errors() {
        let sql = format!("INSERT INTO foobar VALUES ('{A}')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownTable(_))));
    }

    #[test]
    fn parse_wrong_arity() {
        let sql = format!("INSERT INTO listings VALUES ('{A}', '{B}')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::WrongArity(t, 4, 2)) if t == "listings"));

        let sql = format!("INSERT INTO declines VALUES ('{A}')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::WrongArity(t, 2, 1)) if t == "declines"));
    }

    #[test]
    fn parse_empty_errors() {
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
    }
}
