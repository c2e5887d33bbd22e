//! SQL generation for filtered, sorted and paged object views.
//!
//! Every distinct tag key referenced by the view becomes one
//! `LEFT OUTER JOIN` against `ObjectTags`. Keys and values are bound as
//! parameters; only generated aliases and the fixed static column names
//! reach the SQL text.

use color_eyre::{eyre::eyre, Result};
use rusqlite::types::Value;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use uuid::Uuid;

use super::filter::{CompareOp, Filter, FilterValue};

/// Columns of the `Objects` table a view can filter and sort on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaticColumn {
  Id,
  Guid,
  Typ,
  Nr,
  ServerId,
  IsRev,
  RemoteRevId,
  PulledRevId,
  IsDocumentChanged,
}

impl StaticColumn {
  /// Selection order of the static part of every view row.
  pub const ALL: [StaticColumn; 9] = [
    Self::Id,
    Self::Guid,
    Self::Typ,
    Self::Nr,
    Self::ServerId,
    Self::IsRev,
    Self::RemoteRevId,
    Self::PulledRevId,
    Self::IsDocumentChanged,
  ];

  pub fn name(self) -> &'static str {
    match self {
      Self::Id => "Id",
      Self::Guid => "Guid",
      Self::Typ => "Typ",
      Self::Nr => "Nr",
      Self::ServerId => "ServerId",
      Self::IsRev => "IsRev",
      Self::RemoteRevId => "RemoteRevId",
      Self::PulledRevId => "PulledRevId",
      Self::IsDocumentChanged => "IsDocumentChanged",
    }
  }

  pub fn lookup(name: &str) -> Option<Self> {
    Self::ALL
      .into_iter()
      .find(|c| c.name().eq_ignore_ascii_case(name))
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewOrder {
  pub column: String,
  pub descending: bool,
}

impl ViewOrder {
  /// `nr` sorts ascending, `nr-` descending (a leading `+`/`-` works too).
  pub fn parse(text: &str) -> Result<Self> {
    let text = text.trim();
    let (column, descending) = if let Some(c) = text.strip_suffix('-') {
      (c, true)
    } else if let Some(c) = text.strip_prefix('-') {
      (c, true)
    } else {
      (text.trim_start_matches('+').trim_end_matches('+'), false)
    };
    let column = column.trim();
    if column.is_empty() {
      return Err(eyre!("Empty order column in '{}'", text));
    }
    Ok(Self {
      column: column.to_string(),
      descending,
    })
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ViewQuery {
  pub filter: Filter,
  /// Tag keys to return with every row
  pub columns: Vec<String>,
  pub order: Vec<ViewOrder>,
  pub offset: Option<usize>,
  pub limit: Option<usize>,
}

impl Default for ViewQuery {
  fn default() -> Self {
    Self {
      filter: Filter::True,
      columns: Vec::new(),
      order: Vec::new(),
      offset: None,
      limit: None,
    }
  }
}

/// Generated statement with its positional parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlView {
  pub sql: String,
  pub params: Vec<Value>,
  /// Tag keys in join order; the selected values follow the static columns
  pub tag_keys: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectViewRow {
  pub id: i64,
  pub guid: Uuid,
  pub typ: Option<String>,
  pub nr: Option<String>,
  pub server_id: Option<i64>,
  pub is_rev: bool,
  pub remote_rev_id: Option<i64>,
  pub pulled_rev_id: Option<i64>,
  pub is_document_changed: bool,
  pub tags: BTreeMap<String, Option<String>>,
}

#[derive(Clone, Copy)]
enum ColumnRef {
  Static(StaticColumn),
  Tag(usize),
}

struct Builder {
  tag_keys: Vec<String>,
  params: Vec<Value>,
}

impl Builder {
  fn bind(&mut self, value: Value) -> String {
    self.params.push(value);
    format!("?{}", self.params.len())
  }

  fn column(&mut self, name: &str) -> Result<ColumnRef> {
    if let Some(column) = StaticColumn::lookup(name) {
      return Ok(ColumnRef::Static(column));
    }
    if name.trim().is_empty() {
      return Err(eyre!("Empty column name in view"));
    }
    let index = match self
      .tag_keys
      .iter()
      .position(|k| k.eq_ignore_ascii_case(name))
    {
      Some(index) => index,
      None => {
        self.tag_keys.push(name.to_string());
        self.tag_keys.len() - 1
      }
    };
    Ok(ColumnRef::Tag(index))
  }

  fn column_sql(column: ColumnRef) -> String {
    match column {
      ColumnRef::Static(c) => format!("o.[{}]", c.name()),
      ColumnRef::Tag(i) => format!("t{}.[Value]", i),
    }
  }

  fn predicate(&mut self, filter: &Filter) -> Result<String> {
    Ok(match filter {
      Filter::True => "1".to_string(),
      Filter::And(items) if items.is_empty() => "1".to_string(),
      Filter::Or(items) if items.is_empty() => "0".to_string(),
      Filter::And(items) => self.join(items, " AND ")?,
      Filter::Or(items) => self.join(items, " OR ")?,
      Filter::Not(inner) => format!("NOT ({})", self.predicate(inner)?),
      Filter::Compare { column, op, value } => {
        let column = self.column(column)?;
        self.comparison(column, *op, value)?
      }
    })
  }

  fn join(&mut self, items: &[Filter], separator: &str) -> Result<String> {
    let parts = items
      .iter()
      .map(|f| self.predicate(f))
      .collect::<Result<Vec<_>>>()?;
    Ok(format!("({})", parts.join(separator)))
  }

  fn comparison(&mut self, column: ColumnRef, op: CompareOp, value: &FilterValue) -> Result<String> {
    let plain = Self::column_sql(column);

    if let FilterValue::Null = value {
      return match op {
        CompareOp::Equal => Ok(format!("{} IS NULL", plain)),
        CompareOp::NotEqual => Ok(format!("{} IS NOT NULL", plain)),
        _ => Err(eyre!("Operator {:?} cannot compare with null", op)),
      };
    }

    if let CompareOp::Contains | CompareOp::StartsWith = op {
      let escaped = escape_like(&value.to_string());
      let pattern = if op == CompareOp::Contains {
        format!("%{}%", escaped)
      } else {
        format!("{}%", escaped)
      };
      let param = self.bind(Value::Text(pattern));
      return Ok(format!("{} LIKE {} ESCAPE '\\'", plain, param));
    }

    // Tag values are text; typed comparisons convert them first.
    let (expr, param) = match (column, value) {
      (ColumnRef::Tag(_), FilterValue::Integer(i)) => {
        (format!("CAST({} AS REAL)", plain), Value::Real(*i as f64))
      }
      (ColumnRef::Tag(_), FilterValue::Number(n)) => (format!("CAST({} AS REAL)", plain), Value::Real(*n)),
      (_, FilterValue::Date(d)) => (
        format!("date({})", plain),
        Value::Text(d.format("%Y-%m-%d").to_string()),
      ),
      (ColumnRef::Static(_), FilterValue::Integer(i)) => (plain, Value::Integer(*i)),
      (ColumnRef::Static(_), FilterValue::Number(n)) => (plain, Value::Real(*n)),
      (_, FilterValue::Text(s)) => (plain, Value::Text(s.clone())),
      (_, FilterValue::Null) => unreachable!("null handled above"),
    };

    let op = match op {
      CompareOp::Equal => "=",
      CompareOp::NotEqual => "<>",
      CompareOp::Less => "<",
      CompareOp::LessOrEqual => "<=",
      CompareOp::Greater => ">",
      CompareOp::GreaterOrEqual => ">=",
      CompareOp::Contains | CompareOp::StartsWith => unreachable!("like handled above"),
    };
    let param = self.bind(param);
    Ok(format!("{} {} {}", expr, op, param))
  }
}

fn escape_like(text: &str) -> String {
  let mut out = String::with_capacity(text.len());
  for c in text.chars() {
    if matches!(c, '%' | '_' | '\\') {
      out.push('\\');
    }
    out.push(c);
  }
  out
}

/// Build the SQL for a view query.
pub fn build(query: &ViewQuery) -> Result<SqlView> {
  let mut builder = Builder {
    tag_keys: Vec::new(),
    params: Vec::new(),
  };

  for key in &query.columns {
    if StaticColumn::lookup(key).is_none() {
      builder.column(key)?;
    }
  }

  let predicate = builder.predicate(&query.filter)?;

  let order = query
    .order
    .iter()
    .map(|o| {
      let column = builder.column(&o.column)?;
      Ok(format!(
        "{} {}",
        Builder::column_sql(column),
        if o.descending { "DESC" } else { "ASC" }
      ))
    })
    .collect::<Result<Vec<_>>>()?;

  let static_columns: Vec<String> = StaticColumn::ALL
    .iter()
    .map(|c| format!("o.[{}]", c.name()))
    .collect();
  let tag_columns: Vec<String> = (0..builder.tag_keys.len())
    .map(|i| format!("t{}.[Value]", i))
    .collect();
  let selected = static_columns
    .iter()
    .chain(tag_columns.iter())
    .cloned()
    .collect::<Vec<_>>()
    .join(", ");

  let mut sql = format!("SELECT {} FROM main.[Objects] o", selected);

  let keys = builder.tag_keys.clone();
  for (i, key) in keys.iter().enumerate() {
    let param = builder.bind(Value::Text(key.clone()));
    write!(
      sql,
      " LEFT OUTER JOIN main.[ObjectTags] t{i} ON t{i}.[ObjectId] = o.[Id] AND t{i}.[Key] = {param} AND t{i}.[Class] >= 0"
    )?;
  }

  write!(sql, " WHERE {}", predicate)?;
  write!(sql, " GROUP BY {}", selected)?;

  if order.is_empty() {
    sql.push_str(" ORDER BY o.[Id] ASC");
  } else {
    write!(sql, " ORDER BY {}, o.[Id] ASC", order.join(", "))?;
  }

  match (query.limit, query.offset) {
    (Some(limit), offset) => {
      let limit = builder.bind(Value::Integer(paging_value("limit", limit)?));
      let offset = builder.bind(Value::Integer(paging_value("offset", offset.unwrap_or(0))?));
      write!(sql, " LIMIT {} OFFSET {}", limit, offset)?;
    }
    (None, Some(offset)) => {
      let offset = builder.bind(Value::Integer(paging_value("offset", offset)?));
      write!(sql, " LIMIT -1 OFFSET {}", offset)?;
    }
    (None, None) => {}
  }

  Ok(SqlView {
    sql,
    params: builder.params,
    tag_keys: builder.tag_keys,
  })
}

/// SQLite reads a negative LIMIT as unbounded, so values past `i64::MAX`
/// must not wrap.
fn paging_value(name: &str, value: usize) -> Result<i64> {
  i64::try_from(value).map_err(|_| eyre!("View {} {} is out of range", name, value))
}
