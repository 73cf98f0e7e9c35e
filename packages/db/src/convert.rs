//! Conversion between [`Value`] and SQLite values.

use std::collections::BTreeMap;

use capbridge_core::{Error, Value};
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{Row, Statement};

/// Convert a statement parameter.
///
/// Booleans bind as 0/1 and containers bind as their JSON text.
pub fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Integer(i) => SqlValue::Integer(*i),
        Value::Float(f) => SqlValue::Real(*f),
        Value::String(s) => SqlValue::Text(s.clone()),
        Value::Bytes(b) => SqlValue::Blob(b.clone()),
        Value::Array(_) | Value::Map(_) => SqlValue::Text(value.to_json().to_string()),
    }
}

pub fn from_sql(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Integer(i),
        ValueRef::Real(f) => Value::Float(f),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::Bytes(b.to_vec()),
    }
}

/// Map a driver error. A busy database is reported as a timeout.
pub fn sql_error(context: &str, e: rusqlite::Error) -> Error {
    match e.sqlite_error_code() {
        Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked) => {
            Error::timeout(format!("{} (database busy)", context))
        }
        _ => Error::upstream(context.to_string(), e),
    }
}

/// Run a prepared query and collect every row as a map keyed by column name.
pub fn collect_rows(stmt: &mut Statement<'_>, params: &[Value]) -> Result<Vec<Value>, Error> {
    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let mut rows = stmt
        .query(rusqlite::params_from_iter(params.iter().map(to_sql)))
        .map_err(|e| sql_error("query", e))?;

    let mut records = Vec::new();
    while let Some(row) = rows.next().map_err(|e| sql_error("query", e))? {
        records.push(row_to_value(row, &columns)?);
    }
    Ok(records)
}

fn row_to_value(row: &Row<'_>, columns: &[String]) -> Result<Value, Error> {
    let mut record = BTreeMap::new();
    for (index, name) in columns.iter().enumerate() {
        let cell = row.get_ref(index).map_err(|e| sql_error("read column", e))?;
        record.insert(name.clone(), from_sql(cell));
    }
    Ok(Value::Map(record))
}

#[cfg(test)]
mod tests {
    use super::*;
    use collection_literals::btree;

    #[test]
    fn parameters_bind_naturally() {
        assert_eq!(to_sql(&Value::Bool(true)), SqlValue::Integer(1));
        assert_eq!(to_sql(&Value::from("x")), SqlValue::Text("x".into()));
        assert_eq!(to_sql(&Value::from(vec![1u8])), SqlValue::Blob(vec![1]));
        let map = Value::Map(btree! { "k".into() => Value::from(1i64) });
        assert_eq!(to_sql(&map), SqlValue::Text(r#"{"k":1}"#.into()));
    }

    #[test]
    fn rows_become_maps() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        let mut stmt = conn
            .prepare("SELECT ?1 AS n, 'hi' AS s, NULL AS z, x'0102' AS b")
            .unwrap();
        let rows = collect_rows(&mut stmt, &[Value::from(7i64)]).unwrap();
        assert_eq!(
            rows,
            vec![Value::Map(btree! {
                "n".into() => Value::from(7i64),
                "s".into() => Value::from("hi"),
                "z".into() => Value::Null,
                "b".into() => Value::Bytes(vec![1, 2]),
            })]
        );
    }

    #[test]
    fn driver_errors_are_upstream() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        let err = conn.prepare("SELEC nonsense").map_err(|e| sql_error("prepare", e));
        assert_eq!(err.unwrap_err().kind(), capbridge_core::ErrorKind::Upstream);
    }
}
