//! Versioned table scripts and the migration that applies them.
//!
//! Every table of the local store is described by one embedded script:
//!
//! ```text
//! --<info schema="main" name="ObjectTags" rev="1"/>
//! CREATE TABLE main.[ObjectTags] (...);
//! CREATE UNIQUE INDEX ...;
//! --<convert/>
//! INSERT INTO main.[ObjectTags] (...) SELECT ... FROM main.[ObjectTags_Old];
//! ```
//!
//! The revision of each table is tracked in `main.TableVersions`. An outdated
//! table is renamed to `<Name>_Old`, recreated, filled by the convert script
//! and dropped, all inside the single migration transaction.

use color_eyre::{eyre::eyre, eyre::WrapErr, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use tracing::{info, warn};

/// Embedded table scripts, in creation order.
static TABLE_SCRIPTS: &[(&str, &str)] = &[
  ("objects.sql", include_str!("sql/objects.sql")),
  ("object_tags.sql", include_str!("sql/object_tags.sql")),
  ("object_links.sql", include_str!("sql/object_links.sql")),
  ("offline_cache.sql", include_str!("sql/offline_cache.sql")),
];

const META_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS main.[TableVersions] (
  [Schema] TEXT NOT NULL,
  [Name] TEXT NOT NULL,
  [Revision] INTEGER NOT NULL,
  PRIMARY KEY ([Schema], [Name])
);
"#;

const HEADER_START: &str = "--<info";
const HEADER_END: &str = "/>";
const CONVERT_MARKER: &str = "--<convert/>";

/// A parsed table script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableScript {
  pub schema: String,
  pub name: String,
  pub revision: i64,
  /// Creates the table and its indexes
  pub create: String,
  /// Copies rows from `<name>_Old` into the new table
  pub convert: Option<String>,
}

impl TableScript {
  pub fn qualified_name(&self) -> String {
    format!("{}.{}", self.schema, self.name)
  }

  fn old_name(&self) -> String {
    format!("{}_Old", self.name)
  }
}

/// Tables touched by one verification run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
  pub created: Vec<String>,
  pub upgraded: Vec<String>,
}

impl MigrationReport {
  pub fn is_empty(&self) -> bool {
    self.created.is_empty() && self.upgraded.is_empty()
  }
}

/// Parse all embedded table scripts.
pub fn embedded_scripts() -> Result<Vec<TableScript>> {
  TABLE_SCRIPTS
    .iter()
    .map(|(source, text)| parse_script(source, text))
    .collect()
}

/// Parse one script. `source` only names the script in error messages.
pub fn parse_script(source: &str, text: &str) -> Result<TableScript> {
  let mut lines = text.lines().skip_while(|l| l.trim().is_empty());

  let header = lines
    .next()
    .map(str::trim)
    .filter(|l| l.starts_with(HEADER_START) && l.ends_with(HEADER_END))
    .ok_or_else(|| eyre!("Script {} does not start with an info header", source))?;

  let attrs = parse_attributes(&header[HEADER_START.len()..header.len() - HEADER_END.len()])
    .wrap_err_with(|| format!("Invalid info header in script {}", source))?;

  let attr = |key: &str| {
    attrs
      .get(key)
      .map(|v| v.to_string())
      .ok_or_else(|| eyre!("Script {} has no '{}' attribute", source, key))
  };

  let schema = attr("schema")?;
  let name = attr("name")?;
  let revision = attr("rev")?
    .parse::<i64>()
    .map_err(|e| eyre!("Script {} has an invalid revision: {}", source, e))?;

  for ident in [&schema, &name] {
    if ident.is_empty() || !ident.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
      return Err(eyre!("Script {} has an invalid identifier '{}'", source, ident));
    }
  }

  let mut create = Vec::new();
  let mut convert: Option<Vec<&str>> = None;
  for line in lines {
    if line.trim() == CONVERT_MARKER {
      convert = Some(Vec::new());
    } else if let Some(convert) = convert.as_mut() {
      convert.push(line);
    } else {
      create.push(line);
    }
  }

  let create = create.join("\n").trim().to_string();
  if create.is_empty() {
    return Err(eyre!("Script {} has no create statement", source));
  }
  let convert = convert
    .map(|lines| lines.join("\n").trim().to_string())
    .filter(|s| !s.is_empty());

  Ok(TableScript {
    schema,
    name,
    revision,
    create,
    convert,
  })
}

/// Parse `key="value"` pairs (single or double quotes).
fn parse_attributes(text: &str) -> Result<HashMap<String, String>> {
  let mut attrs = HashMap::new();
  let mut rest = text.trim();

  while !rest.is_empty() {
    let eq = rest
      .find('=')
      .ok_or_else(|| eyre!("Expected '=' in '{}'", rest))?;
    let key = rest[..eq].trim();
    let after = rest[eq + 1..].trim_start();

    let quote = after
      .chars()
      .next()
      .filter(|c| *c == '"' || *c == '\'')
      .ok_or_else(|| eyre!("Value of '{}' is not quoted", key))?;
    let end = after[1..]
      .find(quote)
      .ok_or_else(|| eyre!("Value of '{}' is not terminated", key))?;

    attrs.insert(key.to_string(), after[1..1 + end].to_string());
    rest = after[end + 2..].trim_start();
  }

  Ok(attrs)
}

/// Bring every table described by `scripts` to its script revision.
///
/// All work happens in one transaction; a failure leaves the database as it
/// was.
pub fn verify(conn: &mut Connection, scripts: &[TableScript]) -> Result<MigrationReport> {
  let tx = conn
    .transaction()
    .wrap_err("Failed to begin migration transaction")?;

  tx.execute_batch(META_TABLE)
    .wrap_err("Failed to create table version meta table")?;

  let mut report = MigrationReport::default();
  for script in scripts {
    verify_table(&tx, script, &mut report)
      .wrap_err_with(|| format!("Failed to verify table {}", script.qualified_name()))?;
  }

  tx.commit().wrap_err("Failed to commit migration")?;

  if !report.is_empty() {
    info!(created = ?report.created, upgraded = ?report.upgraded, "local store schema updated");
  }
  Ok(report)
}

fn verify_table(conn: &Connection, script: &TableScript, report: &mut MigrationReport) -> Result<()> {
  let exists = table_exists(conn, &script.schema, &script.name)?;
  let stored = stored_revision(conn, script)?;

  if !exists {
    conn.execute_batch(&script.create)?;
    set_revision(conn, script)?;
    report.created.push(script.qualified_name());
    return Ok(());
  }

  match stored {
    Some(rev) if rev == script.revision => Ok(()),
    Some(rev) if rev > script.revision => Err(eyre!(
      "Stored revision {} is newer than the supported revision {}",
      rev,
      script.revision
    )),
    _ => {
      upgrade_table(conn, script, stored)?;
      report.upgraded.push(script.qualified_name());
      Ok(())
    }
  }
}

fn upgrade_table(conn: &Connection, script: &TableScript, stored: Option<i64>) -> Result<()> {
  let schema = &script.schema;
  let old = script.old_name();

  conn.execute_batch(&format!(
    "DROP TABLE IF EXISTS [{schema}].[{old}];\nALTER TABLE [{schema}].[{name}] RENAME TO [{old}];",
    name = script.name
  ))?;

  // Renamed tables keep their indexes; drop them so the create script can
  // reuse the names.
  for index in table_indexes(conn, schema, &old)? {
    conn.execute_batch(&format!("DROP INDEX [{schema}].[{index}];"))?;
  }

  conn.execute_batch(&script.create)?;

  match &script.convert {
    Some(convert) => conn
      .execute_batch(convert)
      .wrap_err("Convert script failed")?,
    None => warn!(
      table = %script.qualified_name(),
      "no convert script, rows of the previous revision are dropped"
    ),
  }

  conn.execute_batch(&format!("DROP TABLE [{schema}].[{old}];"))?;
  set_revision(conn, script)?;

  info!(
    table = %script.qualified_name(),
    from = ?stored,
    to = script.revision,
    "table upgraded"
  );
  Ok(())
}

fn table_exists(conn: &Connection, schema: &str, name: &str) -> Result<bool> {
  let count: i64 = conn.query_row(
    &format!("SELECT COUNT(*) FROM [{schema}].sqlite_master WHERE type = 'table' AND name = ?1"),
    params![name],
    |row| row.get(0),
  )?;
  Ok(count > 0)
}

fn table_indexes(conn: &Connection, schema: &str, table: &str) -> Result<Vec<String>> {
  let mut stmt = conn.prepare(&format!(
    "SELECT name FROM [{schema}].sqlite_master WHERE type = 'index' AND tbl_name = ?1 AND sql IS NOT NULL"
  ))?;
  let names = stmt
    .query_map(params![table], |row| row.get(0))?
    .collect::<rusqlite::Result<Vec<String>>>()?;
  Ok(names)
}

fn stored_revision(conn: &Connection, script: &TableScript) -> Result<Option<i64>> {
  let rev = conn
    .query_row(
      "SELECT [Revision] FROM main.[TableVersions] WHERE [Schema] = ?1 AND [Name] = ?2",
      params![script.schema, script.name],
      |row| row.get(0),
    )
    .optional()?;
  Ok(rev)
}

fn set_revision(conn: &Connection, script: &TableScript) -> Result<()> {
  conn.execute(
    "INSERT OR REPLACE INTO main.[TableVersions] ([Schema], [Name], [Revision]) VALUES (?1, ?2, ?3)",
    params![script.schema, script.name, script.revision],
  )?;
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  fn schema_snapshot(conn: &Connection) -> Vec<(String, String)> {
    let mut stmt = conn
      .prepare("SELECT name, IFNULL(sql, '') FROM sqlite_master ORDER BY name")
      .unwrap();
    stmt
      .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
      .unwrap()
      .map(|r| r.unwrap())
      .collect()
  }

  #[test]
  fn test_parse_embedded_scripts() {
    let scripts = embedded_scripts().unwrap();
    let names: Vec<_> = scripts.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, ["Objects", "ObjectTags", "ObjectLinks", "OfflineCache"]);
    assert!(scripts.iter().all(|s| s.schema == "main"));

    let objects = &scripts[0];
    assert_eq!(objects.revision, 2);
    assert!(objects.create.starts_with("CREATE TABLE main.[Objects]"));
    assert!(objects.convert.as_deref().unwrap().contains("Objects_Old"));
    assert!(scripts[1].convert.is_none());
  }

  #[test]
  fn test_parse_single_quoted_attributes() {
    let script = parse_script(
      "t.sql",
      "\n--<info schema='main' name='T' rev='7'/>\nCREATE TABLE main.T (a);\n",
    )
    .unwrap();
    assert_eq!(script.name, "T");
    assert_eq!(script.revision, 7);
    assert_eq!(script.create, "CREATE TABLE main.T (a);");
  }

  #[test]
  fn test_parse_rejects_bad_scripts() {
    assert!(parse_script("a", "CREATE TABLE x (a);").is_err());
    assert!(parse_script("b", "--<info schema=\"main\" name=\"X\"/>\nCREATE TABLE x (a);").is_err());
    assert!(parse_script("c", "--<info schema=\"main\" name=\"X\" rev=\"one\"/>\nCREATE TABLE x (a);").is_err());
    assert!(parse_script("d", "--<info schema=\"main\" name=\"X\" rev=\"1\"/>\n").is_err());
    assert!(parse_script("e", "--<info schema=\"main\" name=\"X;\" rev=\"1\"/>\nCREATE TABLE x (a);").is_err());
  }

  #[test]
  fn test_verify_creates_all_tables() {
    let mut conn = Connection::open_in_memory().unwrap();
    let scripts = embedded_scripts().unwrap();

    let report = verify(&mut conn, &scripts).unwrap();
    assert_eq!(report.created.len(), 4);
    assert!(report.upgraded.is_empty());

    let rev: i64 = conn
      .query_row(
        "SELECT Revision FROM TableVersions WHERE Schema = 'main' AND Name = 'Objects'",
        [],
        |row| row.get(0),
      )
      .unwrap();
    assert_eq!(rev, 2);
  }

  #[test]
  fn test_verify_twice_changes_nothing() {
    let mut conn = Connection::open_in_memory().unwrap();
    let scripts = embedded_scripts().unwrap();

    verify(&mut conn, &scripts).unwrap();
    let before = schema_snapshot(&conn);

    let report = verify(&mut conn, &scripts).unwrap();
    assert!(report.is_empty());
    assert_eq!(schema_snapshot(&conn), before);
  }

  #[test]
  fn test_upgrade_converts_rows() {
    let mut conn = Connection::open_in_memory().unwrap();
    conn
      .execute_batch(
        r#"
        CREATE TABLE main.[TableVersions] ([Schema] TEXT NOT NULL, [Name] TEXT NOT NULL, [Revision] INTEGER NOT NULL, PRIMARY KEY ([Schema], [Name]));
        INSERT INTO main.[TableVersions] VALUES ('main', 'Objects', 1);
        CREATE TABLE main.[Objects] (
          [Id] INTEGER PRIMARY KEY AUTOINCREMENT, [ServerId] INTEGER NULL, [Guid] TEXT NOT NULL,
          [Typ] TEXT NULL, [Nr] TEXT NULL, [MimeType] TEXT NULL, [IsRev] INTEGER NOT NULL DEFAULT 0,
          [RemoteRevId] INTEGER NULL, [PulledRevId] INTEGER NULL,
          [IsDocumentChanged] INTEGER NOT NULL DEFAULT 0, [Document] BLOB NULL
        );
        CREATE UNIQUE INDEX main.[Objects_Guid] ON [Objects] ([Guid]);
        INSERT INTO main.[Objects] ([Id], [ServerId], [Guid], [Typ], [Nr]) VALUES (3, 42, 'g-1', 'invoice', 'R1');
        "#,
      )
      .unwrap();

    let report = verify(&mut conn, &embedded_scripts().unwrap()).unwrap();
    assert_eq!(report.upgraded, vec!["main.Objects".to_string()]);
    assert_eq!(report.created.len(), 3);

    let (id, nr, token): (i64, String, i64) = conn
      .query_row(
        "SELECT Id, Nr, SyncToken FROM Objects WHERE Guid = 'g-1'",
        [],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
      )
      .unwrap();
    assert_eq!((id, nr.as_str(), token), (3, "R1", 0));

    assert!(!table_exists(&conn, "main", "Objects_Old").unwrap());
    assert!(verify(&mut conn, &embedded_scripts().unwrap()).unwrap().is_empty());
  }

  #[test]
  fn test_failed_upgrade_leaves_database_unchanged() {
    let mut conn = Connection::open_in_memory().unwrap();
    let v1 = parse_script(
      "v1",
      "--<info schema=\"main\" name=\"Items\" rev=\"1\"/>\nCREATE TABLE main.[Items] ([A] TEXT);",
    )
    .unwrap();
    verify(&mut conn, &[v1]).unwrap();
    conn
      .execute("INSERT INTO Items (A) VALUES ('keep')", [])
      .unwrap();
    let before = schema_snapshot(&conn);

    let broken = parse_script(
      "v2",
      "--<info schema=\"main\" name=\"Items\" rev=\"2\"/>\nCREATE TABLE main.[Items] ([A] TEXT, [B] TEXT);\n--<convert/>\nINSERT INTO main.[Items] SELECT [Missing] FROM main.[Items_Old];",
    )
    .unwrap();
    let err = verify(&mut conn, &[broken]).unwrap_err();
    assert!(err.to_string().contains("main.Items"));

    assert_eq!(schema_snapshot(&conn), before);
    let value: String = conn
      .query_row("SELECT A FROM Items", [], |row| row.get(0))
      .unwrap();
    assert_eq!(value, "keep");
  }

  #[test]
  fn test_newer_stored_revision_is_rejected() {
    let mut conn = Connection::open_in_memory().unwrap();
    let v3 = parse_script(
      "v3",
      "--<info schema=\"main\" name=\"Items\" rev=\"3\"/>\nCREATE TABLE main.[Items] ([A] TEXT);",
    )
    .unwrap();
    verify(&mut conn, &[v3]).unwrap();

    let v2 = parse_script(
      "v2",
      "--<info schema=\"main\" name=\"Items\" rev=\"2\"/>\nCREATE TABLE main.[Items] ([A] TEXT);",
    )
    .unwrap();
    assert!(verify(&mut conn, &[v2]).is_err());
  }

  #[test]
  fn test_upgrade_without_convert_drops_rows() {
    let mut conn = Connection::open_in_memory().unwrap();
    let v1 = parse_script(
      "v1",
      "--<info schema=\"main\" name=\"Items\" rev=\"1\"/>\nCREATE TABLE main.[Items] ([A] TEXT);\nCREATE INDEX main.[Items_A] ON [Items] ([A]);",
    )
    .unwrap();
    verify(&mut conn, &[v1]).unwrap();
    conn.execute("INSERT INTO Items (A) VALUES ('x')", []).unwrap();

    let v2 = parse_script(
      "v2",
      "--<info schema=\"main\" name=\"Items\" rev=\"2\"/>\nCREATE TABLE main.[Items] ([A] TEXT, [B] INTEGER);\nCREATE INDEX main.[Items_A] ON [Items] ([A]);",
    )
    .unwrap();
    let report = verify(&mut conn, &[v2]).unwrap();
    assert_eq!(report.upgraded, vec!["main.Items".to_string()]);

    let count: i64 = conn
      .query_row("SELECT COUNT(*) FROM Items", [], |row| row.get(0))
      .unwrap();
    assert_eq!(count, 0);
  }
}
