use chrono::{DateTime, NaiveDateTime};
use sqlparser::ast::{
    self, BinaryOperator, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::engine::{LedgerFilter, NewRequest, RequestFilter};
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertCategory {
        id: Ulid,
        name: String,
        asset_type: Option<String>,
    },
    InsertAsset {
        id: Ulid,
        category_id: Ulid,
        code: String,
        asset_type: Option<String>,
    },
    SetAssetStatus {
        asset_id: Ulid,
        status: AssetStatus,
    },
    InsertRequest(NewRequest),
    UpdateRequestStatus {
        request_id: Ulid,
        status: RequestStatus,
        actor_id: Option<Ulid>,
        reason: Option<String>,
    },
    AcceptBooking {
        request_id: Ulid,
        user_id: Ulid,
    },
    CancelRequest {
        id: Ulid,
    },
    /// Rows grouped per category, in the order categories first appear.
    Allocate {
        request_id: Ulid,
        lines: Vec<(Ulid, Vec<Ulid>)>,
    },
    MarkReturned {
        borrowed_id: Ulid,
        returned_at: Option<Ms>,
    },
    ReturnRequest {
        request_id: Ulid,
        returned_at: Option<Ms>,
    },
    SelectAvailability {
        request_id: Ulid,
    },
    SelectCategoryAvailability {
        category_id: Ulid,
        start: Ms,
        end: Ms,
        quantity: u32,
    },
    SelectBorrowedAssets(LedgerFilter),
    SelectCategories,
    SelectAssets {
        category_id: Option<Ulid>,
    },
    SelectRequests(RequestFilter),
    SelectAllocations {
        request_id: Ulid,
    },
}

// Positional column order used when an INSERT names no columns.
const CATEGORY_COLUMNS: &[&str] = &["id", "name", "asset_type"];
const ASSET_COLUMNS: &[&str] = &["id", "category_id", "code", "asset_type"];
const ASSET_STATUS_COLUMNS: &[&str] = &["asset_id", "status"];
const REQUEST_COLUMNS: &[&str] = &[
    "id",
    "requester_id",
    "project_id",
    "department_id",
    "asset_id",
    "categories",
    "start",
    "end",
    "initial_status",
    "description",
];
const REQUEST_STATUS_COLUMNS: &[&str] = &["request_id", "status", "actor_id", "reason"];
const BOOKING_COLUMNS: &[&str] = &["request_id", "user_id"];
const ALLOCATION_COLUMNS: &[&str] = &["request_id", "category_id", "asset_id"];
const RETURN_COLUMNS: &[&str] = &["borrowed_id", "returned_at"];
const REQUEST_RETURN_COLUMNS: &[&str] = &["request_id", "returned_at"];

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let stmt = match stmts.as_slice() {
        [] => return Err(SqlError::Empty),
        [one] => one,
        many => {
            return Err(SqlError::Unsupported(format!(
                "{} statements in one query string",
                many.len()
            )));
        }
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// The virtual table whose rows a statement returns, if it returns any.
/// Used to describe prepared statements before their parameters are bound.
pub fn result_table(sql: &str) -> Option<String> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).ok()?;
    match stmts.first()? {
        Statement::Query(query) => match query.body.as_ref() {
            SetExpr::Select(select) => {
                table_factor_name(&select.from.first()?.relation).ok()
            }
            _ => None,
        },
        Statement::Insert(insert) => {
            let table = insert_table_name(insert).ok()?;
            matches!(table.as_str(), "allocations" | "booking_acceptances").then_some(table)
        }
        _ => None,
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let columns: Vec<String> = insert
        .columns
        .iter()
        .map(|c| c.value.to_lowercase())
        .collect();

    if table == "allocations" {
        return parse_allocations(&columns, &extract_all_insert_rows(insert)?);
    }

    let values = extract_insert_values(insert)?;
    match table.as_str() {
        "categories" => {
            let row = Row::new("categories", CATEGORY_COLUMNS, &columns, &values)?;
            Ok(Command::InsertCategory {
                id: parse_ulid(row.required("id")?)?,
                name: parse_string(row.required("name")?)?,
                asset_type: row.opt_col("asset_type", parse_string)?,
            })
        }
        "assets" => {
            let row = Row::new("assets", ASSET_COLUMNS, &columns, &values)?;
            Ok(Command::InsertAsset {
                id: parse_ulid(row.required("id")?)?,
                category_id: parse_ulid(row.required("category_id")?)?,
                code: parse_string(row.required("code")?)?,
                asset_type: row.opt_col("asset_type", parse_string)?,
            })
        }
        "asset_status" => {
            let row = Row::new("asset_status", ASSET_STATUS_COLUMNS, &columns, &values)?;
            Ok(Command::SetAssetStatus {
                asset_id: parse_ulid(row.required("asset_id")?)?,
                status: parse_asset_status(row.required("status")?)?,
            })
        }
        "requests" => parse_request(Row::new("requests", REQUEST_COLUMNS, &columns, &values)?),
        "request_status" => {
            let row = Row::new("request_status", REQUEST_STATUS_COLUMNS, &columns, &values)?;
            Ok(Command::UpdateRequestStatus {
                request_id: parse_ulid(row.required("request_id")?)?,
                status: parse_request_status(row.required("status")?)?,
                actor_id: row.opt_col("actor_id", parse_ulid)?,
                reason: row.opt_col("reason", parse_string)?,
            })
        }
        "booking_acceptances" => {
            let row = Row::new("booking_acceptances", BOOKING_COLUMNS, &columns, &values)?;
            Ok(Command::AcceptBooking {
                request_id: parse_ulid(row.required("request_id")?)?,
                user_id: parse_ulid(row.required("user_id")?)?,
            })
        }
        "returns" => {
            let row = Row::new("returns", RETURN_COLUMNS, &columns, &values)?;
            Ok(Command::MarkReturned {
                borrowed_id: parse_ulid(row.required("borrowed_id")?)?,
                returned_at: row.opt_col("returned_at", parse_ms)?,
            })
        }
        "request_returns" => {
            let row = Row::new("request_returns", REQUEST_RETURN_COLUMNS, &columns, &values)?;
            Ok(Command::ReturnRequest {
                request_id: parse_ulid(row.required("request_id")?)?,
                returned_at: row.opt_col("returned_at", parse_ms)?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_request(row: Row<'_>) -> Result<Command, SqlError> {
    let asset_id = row.opt_col("asset_id", parse_ulid)?;
    let categories = row.opt_col("categories", parse_categories)?;
    let kind = match (asset_id, categories) {
        (Some(_), Some(c)) if !c.is_empty() => {
            return Err(SqlError::BadValue(
                "a request names either asset_id or categories, not both".into(),
            ));
        }
        (Some(asset_id), _) => RequestKind::Specific { asset_id },
        (None, categories) => RequestKind::Categories(categories.unwrap_or_default()),
    };
    Ok(Command::InsertRequest(NewRequest {
        id: parse_ulid(row.required("id")?)?,
        requester_id: parse_ulid(row.required("requester_id")?)?,
        project_id: row.opt_col("project_id", parse_ulid)?,
        department_id: row.opt_col("department_id", parse_ulid)?,
        description: row.opt_col("description", parse_string)?,
        kind,
        start: parse_ms(row.required("start")?)?,
        end: parse_ms(row.required("end")?)?,
        initial_status: row.opt_col("initial_status", parse_request_status)?,
    }))
}

fn parse_allocations(columns: &[String], rows: &[Vec<Expr>]) -> Result<Command, SqlError> {
    let mut request_id = None;
    let mut lines: Vec<(Ulid, Vec<Ulid>)> = Vec::new();
    for (i, values) in rows.iter().enumerate() {
        let at_row = |e: SqlError| SqlError::Parse(format!("row {i}: {e}"));
        let row = Row::new("allocations", ALLOCATION_COLUMNS, columns, values).map_err(at_row)?;
        let rid = parse_ulid(row.required("request_id").map_err(at_row)?).map_err(at_row)?;
        let category_id = parse_ulid(row.required("category_id").map_err(at_row)?).map_err(at_row)?;
        let asset_id = parse_ulid(row.required("asset_id").map_err(at_row)?).map_err(at_row)?;

        match request_id {
            None => request_id = Some(rid),
            Some(first) if first != rid => {
                return Err(SqlError::BadValue(
                    "all allocation rows must name the same request".into(),
                ));
            }
            Some(_) => {}
        }
        match lines.iter_mut().find(|(c, _)| *c == category_id) {
            Some((_, units)) => units.push(asset_id),
            None => lines.push((category_id, vec![asset_id])),
        }
    }
    let request_id = request_id.ok_or_else(|| SqlError::Parse("empty VALUES".into()))?;
    Ok(Command::Allocate { request_id, lines })
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "requests" => Ok(Command::CancelRequest { id }),
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

    let mut filters = Vec::new();
    if let Some(selection) = &select.selection {
        collect_filters(selection, &mut filters)?;
    }
    let filter = |col: &str| filters.iter().find(|f| f.column == col);
    let eq_ulid = |col: &str| -> Result<Option<Ulid>, SqlError> {
        filter(col).map(|f| parse_ulid(f.value)).transpose()
    };

    match table.as_str() {
        "availability" => Ok(Command::SelectAvailability {
            request_id: eq_ulid("request_id")?.ok_or(SqlError::MissingFilter("request_id"))?,
        }),
        "category_availability" => {
            let start = filter("start").ok_or(SqlError::MissingFilter("start"))?;
            let end = filter("end").ok_or(SqlError::MissingFilter("end"))?;
            if !matches!(start.op, BinaryOperator::Eq | BinaryOperator::GtEq) {
                return Err(SqlError::Unsupported("start filter must be = or >=".into()));
            }
            if !matches!(end.op, BinaryOperator::Eq | BinaryOperator::LtEq) {
                return Err(SqlError::Unsupported("end filter must be = or <=".into()));
            }
            Ok(Command::SelectCategoryAvailability {
                category_id: eq_ulid("category_id")?
                    .ok_or(SqlError::MissingFilter("category_id"))?,
                start: parse_ms(start.value)?,
                end: parse_ms(end.value)?,
                quantity: filter("quantity")
                    .map(|f| parse_u32(f.value))
                    .transpose()?
                    .unwrap_or(1),
            })
        }
        "borrowed_assets" => {
            let mut chosen = Vec::new();
            if let Some(id) = eq_ulid("id")? {
                chosen.push(LedgerFilter::Id(id));
            }
            if let Some(id) = eq_ulid("staff_id")? {
                chosen.push(LedgerFilter::Staff(id));
            }
            if let Some(id) = eq_ulid("asset_id")? {
                chosen.push(LedgerFilter::Asset(id));
            }
            if let Some(id) = eq_ulid("request_id")? {
                chosen.push(LedgerFilter::Request(id));
            }
            match chosen.as_slice() {
                [] => Ok(Command::SelectBorrowedAssets(LedgerFilter::All)),
                [one] => Ok(Command::SelectBorrowedAssets(*one)),
                _ => Err(SqlError::Unsupported(
                    "borrowed_assets takes at most one of id, staff_id, asset_id, request_id"
                        .into(),
                )),
            }
        }
        "categories" => Ok(Command::SelectCategories),
        "assets" => Ok(Command::SelectAssets {
            category_id: eq_ulid("category_id")?,
        }),
        "requests" => Ok(Command::SelectRequests(RequestFilter {
            id: eq_ulid("id")?,
            status: filter("status")
                .map(|f| parse_request_status(f.value))
                .transpose()?,
            requester_id: eq_ulid("requester_id")?,
            department_id: eq_ulid("department_id")?,
        })),
        "allocations" => Ok(Command::SelectAllocations {
            request_id: eq_ulid("request_id")?.ok_or(SqlError::MissingFilter("request_id"))?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

struct Filter<'a> {
    column: String,
    op: BinaryOperator,
    value: &'a Expr,
}

/// Flatten an AND chain of `column <op> value` comparisons.
fn collect_filters<'a>(expr: &'a Expr, out: &mut Vec<Filter<'a>>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_filters(inner, out),
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            collect_filters(left, out)?;
            collect_filters(right, out)
        }
        Expr::BinaryOp { left, op, right } => {
            let column = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
            if !matches!(op, BinaryOperator::Eq | BinaryOperator::GtEq | BinaryOperator::LtEq) {
                return Err(SqlError::Unsupported(format!("operator {op}")));
            }
            out.push(Filter {
                column,
                op: op.clone(),
                value: right,
            });
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
    }
}

// ── Helpers ───────────────────────────────────────────────────

/// One VALUES row keyed by column name.
struct Row<'a> {
    table: &'static str,
    columns: Vec<String>,
    values: &'a [Expr],
}

impl<'a> Row<'a> {
    fn new(
        table: &'static str,
        defaults: &[&str],
        columns: &[String],
        values: &'a [Expr],
    ) -> Result<Self, SqlError> {
        let columns: Vec<String> = if columns.is_empty() {
            if values.len() > defaults.len() {
                return Err(SqlError::WrongArity(table, defaults.len(), values.len()));
            }
            defaults[..values.len()].iter().map(|c| c.to_string()).collect()
        } else {
            if columns.len() != values.len() {
                return Err(SqlError::WrongArity(table, columns.len(), values.len()));
            }
            if let Some(unknown) = columns.iter().find(|c| !defaults.contains(&c.as_str())) {
                return Err(SqlError::UnknownColumn(table, unknown.clone()));
            }
            columns.to_vec()
        };
        Ok(Self {
            table,
            columns,
            values,
        })
    }

    fn get(&self, column: &str) -> Option<&'a Expr> {
        self.columns
            .iter()
            .position(|c| c == column)
            .map(|i| &self.values[i])
    }

    fn required(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        match self.get(column) {
            Some(e) if !is_null(e) => Ok(e),
            _ => Err(SqlError::MissingColumn(self.table, column)),
        }
    }

    /// A column that may be absent or NULL.
    fn opt_col<T>(
        &self,
        column: &str,
        parse: impl Fn(&Expr) -> Result<T, SqlError>,
    ) -> Result<Option<T>, SqlError> {
        match self.get(column) {
            Some(e) if !is_null(e) => parse(e).map(Some),
            _ => Ok(None),
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
    let mut rows = extract_all_insert_rows(insert)?;
    if rows.len() > 1 {
        return Err(SqlError::Unsupported(
            "multi-row INSERT is only supported for allocations".into(),
        ));
    }
    Ok(rows.swap_remove(0))
}

fn extract_all_insert_rows(insert: &ast::Insert) -> Result<Vec<Vec<Expr>>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            Ok(values.rows.clone())
        }
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: BinaryOperator::Eq,
            right,
        } => {
            if expr_column_name(left).as_deref() == Some("id") {
                parse_ulid(right)
            } else {
                Err(SqlError::MissingFilter("id"))
            }
        }
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

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::DoubleQuotedString(s)) => Ok(s.clone()),
        Some(Value::Number(s, _)) => Ok(s.clone()),
        Some(other) => Err(SqlError::Parse(format!("expected string, got {other:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_string(expr)?;
    Ulid::from_string(s.trim()).map_err(|e| SqlError::BadValue(format!("bad ULID {s:?}: {e}")))
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .trim()
                .parse()
                .map_err(|e| SqlError::BadValue(format!("bad integer {s:?}: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::BadValue(format!("{v} out of u32 range")))
}

/// Integer Unix milliseconds, or an RFC 3339 / ISO-8601 timestamp string.
/// A timestamp without an offset is taken as UTC.
fn parse_ms(expr: &Expr) -> Result<Ms, SqlError> {
    if let Some(Value::SingleQuotedString(s)) = extract_value(expr) {
        let s = s.trim();
        if let Ok(ms) = s.parse::<i64>() {
            return Ok(ms);
        }
        return parse_timestamp(s)
            .ok_or_else(|| SqlError::BadValue(format!("bad timestamp {s:?}")));
    }
    parse_i64(expr)
}

pub fn parse_timestamp(s: &str) -> Option<Ms> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.timestamp_millis());
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|naive| naive.and_utc().timestamp_millis())
}

fn parse_asset_status(expr: &Expr) -> Result<AssetStatus, SqlError> {
    let s = parse_string(expr)?;
    AssetStatus::parse(&s).ok_or_else(|| SqlError::BadValue(format!("unknown asset status {s:?}")))
}

fn parse_request_status(expr: &Expr) -> Result<RequestStatus, SqlError> {
    let s = parse_string(expr)?;
    RequestStatus::parse(&s)
        .ok_or_else(|| SqlError::BadValue(format!("unknown request status {s:?}")))
}

/// `[{"categoryId": "...", "quantity": 2}, ...]`
fn parse_categories(expr: &Expr) -> Result<Vec<CategoryDemand>, SqlError> {
    let json = parse_string(expr)?;
    serde_json::from_str(&json).map_err(|e| SqlError::BadValue(format!("bad categories JSON: {e}")))
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
    /// Well-formed SQL carrying a value the column cannot hold.
    BadValue(String),
}

impl SqlError {
    pub fn sqlstate(&self) -> &'static str {
        match self {
            SqlError::BadValue(_) => "22023",
            _ => "42601",
        }
    }
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(t, c) => write!(f, "{t}: unknown column {c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingColumn(t, c) => write!(f, "{t}: {c} is required"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::BadValue(s) => write!(f, "invalid value: {s}"),
        }
    }
}

impl std::error::Error for SqlError {}

#[cfg(test)]
mod tests {
    use super::*;

    const A: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";
    const B: &str = "01BX5ZZKBKACTAV9WEVGEMMVRZ";
    const C: &str = "01BX5ZZKBKACTAV9WEVGEMMVS0";

    fn ulid(s: &str) -> Ulid {
        Ulid::from_string(s).unwrap()
    }

    #[test]
    fn parse_insert_category() {
        let sql = format!("INSERT INTO categories (id, name, asset_type) VALUES ('{A}', 'Laptop', 'IT')");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::InsertCategory {
                id: ulid(A),
                name: "Laptop".into(),
                asset_type: Some("IT".into()),
            }
        );
    }

    #[test]
    fn parse_insert_category_positional_without_type() {
        let sql = format!("INSERT INTO categories VALUES ('{A}', 'Projector')");
        match parse_sql(&sql).unwrap() {
            Command::InsertCategory { name, asset_type, .. } => {
                assert_eq!(name, "Projector");
                assert_eq!(asset_type, None);
            }
            cmd => panic!("expected InsertCategory, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_asset_with_null_type() {
        let sql = format!(
            "INSERT INTO assets (id, category_id, code, asset_type) VALUES ('{A}', '{B}', 'LAP-001', NULL)"
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::InsertAsset {
                id: ulid(A),
                category_id: ulid(B),
                code: "LAP-001".into(),
                asset_type: None,
            }
        );
    }

    #[test]
    fn parse_asset_status_synonym() {
        let sql = format!("INSERT INTO asset_status (asset_id, status) VALUES ('{A}', 'lost')");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SetAssetStatus {
                asset_id: ulid(A),
                status: AssetStatus::Lost,
            }
        );
        let bad = format!("INSERT INTO asset_status (asset_id, status) VALUES ('{A}', 'MISSING')");
        assert!(matches!(parse_sql(&bad), Err(SqlError::BadValue(_))));
    }

    #[test]
    fn parse_category_request_with_json_and_rfc3339() {
        let sql = format!(
            r#"INSERT INTO requests (id, requester_id, categories, start, "end", initial_status, description)
               VALUES ('{A}', '{B}', '[{{"categoryId": "{C}", "quantity": 2}}]',
                       '2024-03-01T09:00:00Z', '2024-03-01T17:00:00.500+00:00', 'PENDING_AM', 'offsite')"#
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertRequest(new) => {
                assert_eq!(new.id, ulid(A));
                assert_eq!(new.requester_id, ulid(B));
                assert_eq!(
                    new.kind,
                    RequestKind::Categories(vec![CategoryDemand {
                        category_id: ulid(C),
                        quantity: 2
                    }])
                );
                assert_eq!(new.start, 1_709_283_600_000);
                assert_eq!(new.end, 1_709_283_600_000 + 8 * 3_600_000 + 500);
                assert_eq!(new.initial_status, Some(RequestStatus::PendingAm));
                assert_eq!(new.description.as_deref(), Some("offsite"));
                assert_eq!(new.project_id, None);
            }
            cmd => panic!("expected InsertRequest, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_specific_request_with_ms() {
        let sql = format!(
            r#"INSERT INTO requests (id, requester_id, asset_id, start, "end") VALUES ('{A}', '{B}', '{C}', 1000, '2000')"#
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertRequest(new) => {
                assert_eq!(new.kind, RequestKind::Specific { asset_id: ulid(C) });
                assert_eq!((new.start, new.end), (1000, 2000));
                assert_eq!(new.initial_status, None);
            }
            cmd => panic!("expected InsertRequest, got {cmd:?}"),
        }
    }

    #[test]
    fn request_with_asset_and_categories_is_refused() {
        let sql = format!(
            r#"INSERT INTO requests (id, requester_id, asset_id, categories, start, "end")
               VALUES ('{A}', '{B}', '{C}', '[{{"categoryId": "{C}", "quantity": 1}}]', 1000, 2000)"#
        );
        assert!(matches!(parse_sql(&sql), Err(SqlError::BadValue(_))));
    }

    #[test]
    fn request_missing_window_is_refused() {
        let sql = format!("INSERT INTO requests (id, requester_id, asset_id) VALUES ('{A}', '{B}', '{C}')");
        assert!(matches!(
            parse_sql(&sql),
            Err(SqlError::MissingColumn("requests", "start"))
        ));
    }

    #[test]
    fn parse_request_status_with_reason() {
        let sql = format!(
            "INSERT INTO request_status (request_id, status, actor_id, reason) VALUES ('{A}', 'REJECTED', '{B}', 'no budget')"
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::UpdateRequestStatus {
                request_id: ulid(A),
                status: RequestStatus::Rejected,
                actor_id: Some(ulid(B)),
                reason: Some("no budget".into()),
            }
        );
    }

    #[test]
    fn parse_booking_acceptance() {
        let sql = format!("INSERT INTO booking_acceptances (request_id, user_id) VALUES ('{A}', '{B}')");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::AcceptBooking {
                request_id: ulid(A),
                user_id: ulid(B),
            }
        );
    }

    #[test]
    fn parse_delete_request_is_cancel() {
        let sql = format!("DELETE FROM requests WHERE id = '{A}'");
        assert_eq!(parse_sql(&sql).unwrap(), Command::CancelRequest { id: ulid(A) });
        let other = format!("DELETE FROM assets WHERE id = '{A}'");
        assert!(matches!(parse_sql(&other), Err(SqlError::UnknownTable(_))));
    }

    #[test]
    fn parse_allocations_groups_rows_by_category() {
        let (u1, u2, u3) = (Ulid::new(), Ulid::new(), Ulid::new());
        let sql = format!(
            "INSERT INTO allocations (request_id, category_id, asset_id) VALUES \
             ('{A}', '{B}', '{u1}'), ('{A}', '{C}', '{u2}'), ('{A}', '{B}', '{u3}')"
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::Allocate {
                request_id: ulid(A),
                lines: vec![(ulid(B), vec![u1, u3]), (ulid(C), vec![u2])],
            }
        );
    }

    #[test]
    fn allocations_for_two_requests_are_refused() {
        let sql = format!(
            "INSERT INTO allocations (request_id, category_id, asset_id) VALUES \
             ('{A}', '{B}', '{C}'), ('{B}', '{B}', '{C}')"
        );
        assert!(matches!(parse_sql(&sql), Err(SqlError::BadValue(_))));
    }

    #[test]
    fn parse_returns() {
        let sql = format!("INSERT INTO returns (borrowed_id, returned_at) VALUES ('{A}', 5000)");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::MarkReturned {
                borrowed_id: ulid(A),
                returned_at: Some(5000),
            }
        );
        let sql = format!("INSERT INTO request_returns (request_id) VALUES ('{A}')");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::ReturnRequest {
                request_id: ulid(A),
                returned_at: None,
            }
        );
    }

    #[test]
    fn unknown_column_is_refused() {
        let sql = format!("INSERT INTO categories (id, label) VALUES ('{A}', 'x')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownColumn("categories", _))));
    }

    #[test]
    fn parse_select_availability() {
        let sql = format!("SELECT * FROM availability WHERE request_id = '{A}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectAvailability { request_id: ulid(A) }
        );
        assert!(matches!(
            parse_sql("SELECT * FROM availability"),
            Err(SqlError::MissingFilter("request_id"))
        ));
    }

    #[test]
    fn parse_select_category_availability() {
        let sql = format!(
            r#"SELECT * FROM category_availability WHERE category_id = '{A}' AND start >= 1000 AND "end" <= '1970-01-01T00:00:02Z' AND quantity = 3"#
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectCategoryAvailability {
                category_id: ulid(A),
                start: 1000,
                end: 2000,
                quantity: 3,
            }
        );
    }

    #[test]
    fn parse_select_borrowed_assets_filters() {
        assert_eq!(
            parse_sql("SELECT * FROM borrowed_assets").unwrap(),
            Command::SelectBorrowedAssets(LedgerFilter::All)
        );
        let sql = format!("SELECT * FROM borrowed_assets WHERE staff_id = '{A}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectBorrowedAssets(LedgerFilter::Staff(ulid(A)))
        );
        let sql = format!("SELECT * FROM borrowed_assets WHERE asset_id = '{A}' AND request_id = '{B}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn parse_select_listings() {
        assert_eq!(parse_sql("SELECT * FROM categories").unwrap(), Command::SelectCategories);
        let sql = format!("SELECT * FROM assets WHERE category_id = '{A}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectAssets { category_id: Some(ulid(A)) }
        );
        assert_eq!(
            parse_sql("SELECT * FROM requests WHERE status = 'PENDING_AM'").unwrap(),
            Command::SelectRequests(RequestFilter {
                status: Some(RequestStatus::PendingAm),
                ..Default::default()
            })
        );
        let sql = format!(
            "SELECT * FROM requests WHERE department_id = '{A}' AND status = 'PENDING_LEADER'"
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectRequests(RequestFilter {
                status: Some(RequestStatus::PendingLeader),
                department_id: Some(ulid(A)),
                ..Default::default()
            })
        );
        let sql = format!("SELECT * FROM allocations WHERE request_id = '{A}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectAllocations { request_id: ulid(A) }
        );
    }

    #[test]
    fn result_table_for_describe() {
        assert_eq!(
            result_table("SELECT * FROM availability WHERE request_id = $1").as_deref(),
            Some("availability")
        );
        assert_eq!(
            result_table("INSERT INTO allocations (request_id, category_id, asset_id) VALUES ($1, $2, $3)")
                .as_deref(),
            Some("allocations")
        );
        assert_eq!(result_table("INSERT INTO categories (id, name) VALUES ($1, $2)"), None);
    }

    #[test]
    fn timestamps_accept_naive_iso() {
        assert_eq!(parse_timestamp("1970-01-01T00:00:01"), Some(1000));
        assert_eq!(parse_timestamp("1970-01-01 00:00:01.250"), Some(1250));
        assert_eq!(parse_timestamp("yesterday"), None);
    }

    #[test]
    fn parse_unknown_table_errors() {
        let sql = format!("INSERT INTO foobar (id) VALUES ('{A}')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownTable(_))));
    }

    #[test]
    fn parse_empty_errors() {
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
    }

    #[test]
    fn parse_several_statements_errors() {
        let sql = format!(
            "INSERT INTO categories (id, name) VALUES ('{A}', 'Laptop'); DELETE FROM requests WHERE id = '{B}'"
        );
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
        assert!(matches!(
            parse_sql("SELECT * FROM categories; SELECT * FROM categories"),
            Err(SqlError::Unsupported(_))
        ));
        // A trailing semicolon is still one statement.
        assert_eq!(parse_sql("SELECT * FROM categories;").unwrap(), Command::SelectCategories);
    }
}
