//! Command line subcommands and their execution.

use clap::Subcommand;
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

use ppsn_offline::config::Config;
use ppsn_offline::db::Database;
use ppsn_offline::environment::{Environment, DEFAULT_PAGE_SIZE};
use ppsn_offline::objects::{Filter, ObjectViewRow, SyncRequest, ViewOrder, ViewQuery};

#[derive(Subcommand, Debug)]
pub enum Command {
  /// Open the local store and bring its tables up to date
  Verify,

  /// Check the credentials against the server
  Login,

  /// Fetch the server's object list and merge it into the local store
  Pull {
    /// Server-side filter expression
    #[arg(short, long)]
    filter: Option<String>,

    /// Delete local tags and links the server no longer reports
    #[arg(long)]
    remove_missing: bool,

    /// Rows per request
    #[arg(long, default_value_t = DEFAULT_PAGE_SIZE)]
    count: usize,
  },

  /// Download the document of an object
  Fetch {
    guid: Uuid,

    /// Overwrite local changes
    #[arg(long)]
    force: bool,
  },

  /// List local objects
  Objects {
    #[arg(short, long)]
    filter: Option<String>,

    /// Tag to show as an extra column (repeatable)
    #[arg(short, long = "column")]
    columns: Vec<String>,

    /// Sort column, a trailing '-' sorts descending (repeatable)
    #[arg(short, long)]
    order: Vec<String>,

    #[arg(long)]
    offset: Option<usize>,

    #[arg(long)]
    limit: Option<usize>,
  },

  /// Resolve a resource through the offline cache
  Resource {
    path: String,

    /// Write the content to a file instead of stdout
    #[arg(long)]
    out: Option<PathBuf>,
  },

  /// Refetch offline resources that changed on the server
  RefreshResources,
}

pub async fn run(command: Command, config: Config) -> Result<()> {
  match command {
    Command::Verify => verify(&config),
    Command::Login => {
      let env = Environment::open(config)?;
      let login = env.client()?.login().await?;
      println!(
        "Logged in to {} as {} ({})",
        env.name(),
        login.display_name.as_deref().unwrap_or(&login.user_name),
        login.user_id
      );
      Ok(())
    }
    Command::Pull {
      filter,
      remove_missing,
      count,
    } => {
      let env = Environment::open(config)?;
      let report = env.pull_list(filter.as_deref(), remove_missing, count).await?;
      println!("{} objects refreshed, {} failed", report.refreshed, report.failed);
      Ok(())
    }
    Command::Fetch { guid, force } => fetch(config, guid, force).await,
    Command::Objects {
      filter,
      columns,
      order,
      offset,
      limit,
    } => {
      let query = ViewQuery {
        filter: Filter::parse(filter.as_deref().unwrap_or_default())?,
        columns,
        order: order
          .iter()
          .map(|o| ViewOrder::parse(o))
          .collect::<Result<Vec<_>>>()?,
        offset,
        limit,
      };
      let env = Environment::open(Config {
        offline: true,
        ..config
      })?;
      let rows = env.objects().query_view(&query)?;
      print_rows(&query.columns, &rows);
      Ok(())
    }
    Command::Resource { path, out } => {
      let env = Environment::open(config)?;
      let resource = env.resolve_resource(&path).await?;
      match out {
        Some(file) => std::fs::write(&file, &resource.data.content)
          .map_err(|e| eyre!("Failed to write {}: {}", file.display(), e))?,
        None => {
          use std::io::Write;
          std::io::stdout()
            .write_all(&resource.data.content)
            .map_err(|e| eyre!("Failed to write resource: {}", e))?;
        }
      }
      eprintln!(
        "{} ({}, {} bytes, {:?})",
        resource.data.path,
        resource.data.content_type,
        resource.data.length(),
        resource.source
      );
      Ok(())
    }
    Command::RefreshResources => {
      let env = Environment::open(config)?;
      let report = env.refresh_resources().await?;
      println!(
        "{} updated, {} unchanged, {} failed",
        report.updated, report.unchanged, report.failed
      );
      Ok(())
    }
  }
}

fn verify(config: &Config) -> Result<()> {
  let path = config.database_path()?;
  let (_, report) = Database::open_with_report(&path)?;
  println!("Local store: {}", path.display());
  if report.is_empty() {
    println!("All tables are up to date");
  }
  for table in &report.created {
    println!("  created  {}", table);
  }
  for table in &report.upgraded {
    println!("  upgraded {}", table);
  }
  Ok(())
}

/// Pulls go through the sync worker so they share its failure handling.
async fn fetch(config: Config, guid: Uuid, force: bool) -> Result<()> {
  let env = Arc::new(Environment::open(config)?);
  let object = env
    .objects()
    .get_object_by_guid(guid)?
    .ok_or_else(|| eyre!("Object {} is not in the local store", guid))?;

  let (worker, handle) = env.spawn_worker();
  worker.enqueue(SyncRequest::Pull {
    local_id: object.local_id(),
    force,
  })?;
  worker.shutdown();

  let report = handle
    .await
    .map_err(|e| eyre!("Sync worker panicked: {}", e))?;
  if report.failed > 0 {
    return Err(eyre!("Failed to pull {}", guid));
  }

  let state = object.state();
  println!(
    "{} pulled (revision {})",
    guid,
    state
      .pulled_rev_id
      .map_or_else(|| "-".to_string(), |r| r.to_string())
  );
  Ok(())
}

fn print_rows(columns: &[String], rows: &[ObjectViewRow]) {
  let mut header = format!("{:>6}  {:<36}  {:<12}  {:<12}", "Id", "Guid", "Typ", "Nr");
  for column in columns {
    header.push_str(&format!("  {:<12}", column));
  }
  println!("{}", header);

  for row in rows {
    let mut line = format!(
      "{:>6}  {:<36}  {:<12}  {:<12}",
      row.id,
      row.guid,
      row.typ.as_deref().unwrap_or("-"),
      row.nr.as_deref().unwrap_or("-")
    );
    for column in columns {
      let value = row
        .tags
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(column))
        .and_then(|(_, v)| v.as_deref())
        .unwrap_or("-");
      line.push_str(&format!("  {:<12}", value));
    }
    if row.is_document_changed {
      line.push_str("  *");
    }
    println!("{}", line);
  }
}
