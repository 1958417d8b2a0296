mod cache;
mod config;
mod connectivity;
mod db;
mod drafts;
mod logging;
mod queue;
mod worker;

use chrono::Utc;
use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

use cache::{
  CacheStorage, CachedResponse, Destination, Fetcher, HttpFetcher, NoopStorage, Request,
  RequestMode, SqliteStorage,
};
use config::Config;
use connectivity::{Connectivity, NetworkStatus};
use db::{Database, LocalStorage, SqliteLocalStorage};
use drafts::DraftStore;
use queue::{
  ActionKind, ActionRegistry, DrainOutcome, OfflineQueue, QueueMonitor, QueueStatus, RetryPolicy,
};
use worker::{Notification, NotificationHost, ServiceWorker};

#[derive(Parser, Debug)]
#[command(name = "habesha-offline")]
#[command(about = "Offline write queue and response cache for HabeshaCommunity")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/habesha-offline/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Start offline instead of probing the backend
  #[arg(long, global = true)]
  offline: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Inspect and replay queued writes
  Queue {
    #[command(subcommand)]
    command: QueueCommand,
  },
  /// Manage form drafts
  Drafts {
    #[command(subcommand)]
    command: DraftsCommand,
  },
  /// Drive the service worker
  Worker {
    #[command(subcommand)]
    command: WorkerCommand,
  },
}

#[derive(Subcommand, Debug)]
enum QueueCommand {
  /// Show connectivity and pending actions
  Status,
  /// Queue a write and replay it right away when online
  Add {
    /// favorite, message, listing or booking
    #[arg(short, long)]
    kind: ActionKind,
    /// Row to insert, as JSON
    #[arg(short, long)]
    data: String,
  },
  /// Run one drain cycle
  Drain,
  /// Drop every pending action
  Clear,
  /// Follow queue status and sync on reconnect until Ctrl-C
  Watch,
}

#[derive(Subcommand, Debug)]
enum DraftsCommand {
  Save { key: String, data: String },
  Show { key: String },
  Discard { key: String },
  List,
  /// Remove drafts not saved in the last N days
  Prune {
    #[arg(long, default_value_t = 30)]
    days: i64,
  },
}

#[derive(Subcommand, Debug)]
enum WorkerCommand {
  /// Install the current version and activate it
  Update,
  /// Send a request through the worker
  Fetch {
    /// Absolute URL, or a path relative to the app origin
    url: String,
    #[arg(short, long, default_value = "GET")]
    method: String,
    /// Mark the request as an image load
    #[arg(long)]
    image: bool,
    /// Mark the request as a page navigation
    #[arg(long, conflicts_with_all = ["image", "destination", "mode"])]
    navigate: bool,
    /// document, image, script, style, font, other or empty
    #[arg(long, conflicts_with = "image")]
    destination: Option<Destination>,
    /// navigate, same-origin, no-cors or cors
    #[arg(long)]
    mode: Option<RequestMode>,
  },
  /// Show where a URL is cached, without touching the network
  Lookup { url: String },
  /// List cache partitions
  Partitions,
  /// Post a JSON message to the worker
  Message { message: String },
  /// Deliver a push message
  Push {
    payload: Option<String>,
    /// Also click the notification
    #[arg(long)]
    click: bool,
  },
}

/// Prints notifications instead of displaying them.
struct StdoutHost;

impl NotificationHost for StdoutHost {
  fn show_notification(&self, notification: &Notification) -> Result<()> {
    println!("[{}] {}", notification.title, notification.body);
    if let Some(tag) = &notification.tag {
      println!("  tag: {}", tag);
    }
    Ok(())
  }

  fn open_window(&self, url: &Url) -> Result<()> {
    println!("open {}", url);
    Ok(())
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;
  let _log_guard = logging::init(&config.logging)?;

  let db = Arc::new(match &config.database {
    Some(path) => Database::open_at(path)?,
    None => Database::open()?,
  });

  let client = reqwest::Client::new();
  let initial = if args.offline {
    NetworkStatus::Offline
  } else {
    connectivity::probe(&client, &config.backend.url).await
  };
  let connectivity = Connectivity::new(initial);
  debug!(?initial, backend = %config.backend.url, "starting");

  match args.command {
    Command::Queue { command } => {
      run_queue(command, &config, db, connectivity, client, args.offline).await
    }
    Command::Drafts { command } => run_drafts(command, db),
    Command::Worker { command } => {
      if config.cache.enabled {
        let storage = Arc::new(SqliteStorage::new(db));
        run_worker(command, &config, storage, connectivity).await
      } else {
        run_worker(command, &config, Arc::new(NoopStorage), connectivity).await
      }
    }
  }
}

async fn run_queue(
  command: QueueCommand,
  config: &Config,
  db: Arc<Database>,
  connectivity: Connectivity,
  client: reqwest::Client,
  offline: bool,
) -> Result<()> {
  let storage: Arc<dyn LocalStorage> = Arc::new(SqliteLocalStorage::new(db));
  let registry = ActionRegistry::backend(&config.backend, Config::get_api_key())?;
  let policy = RetryPolicy {
    max_retries: config.queue.max_retries,
    max_age: chrono::Duration::hours(config.queue.max_age_hours),
  };
  let open = |connectivity: Connectivity| {
    OfflineQueue::new(storage.clone(), registry.clone(), connectivity, policy)
  };
  let queue = open(connectivity.clone());
  let poll_interval = Duration::from_millis(config.queue.poll_interval_ms);

  match command {
    QueueCommand::Status => {
      let status = if connectivity.is_online() { "online" } else { "offline" };
      println!("{}, {} pending", status, queue.len());
      let now = Utc::now();
      for action in queue.snapshot() {
        println!(
          "  {}  {:<8}  retries={}  age={}m",
          action.id,
          action.kind,
          action.retries,
          action.age(now).num_minutes()
        );
      }
    }
    QueueCommand::Add { kind, data } => {
      let data: serde_json::Value =
        serde_json::from_str(&data).map_err(|e| eyre!("Invalid action data: {}", e))?;
      let (id, outcome) = enqueue_and_sync(open, kind, data, connectivity.is_online()).await;
      println!("queued {}", id);
      if connectivity.is_online() {
        print_outcome(outcome);
      }
    }
    QueueCommand::Drain => {
      let monitor = QueueMonitor::spawn(queue.clone(), connectivity, poll_interval);
      print_outcome(monitor.sync_now().await);
      println!("{} pending", monitor.status().pending);
    }
    QueueCommand::Clear => {
      let count = queue.len();
      queue.clear();
      println!("cleared {} action(s)", count);
    }
    QueueCommand::Watch => {
      let monitor = QueueMonitor::spawn(queue.clone(), connectivity.clone(), poll_interval);
      let prober = (!offline).then(|| {
        connectivity.spawn_prober(
          client,
          config.backend.url.clone(),
          Duration::from_secs(config.queue.probe_interval_secs),
        )
      });

      let mut status_rx = monitor.subscribe();
      print_status(&monitor.status());
      let ctrl_c = tokio::signal::ctrl_c();
      tokio::pin!(ctrl_c);
      loop {
        tokio::select! {
          _ = &mut ctrl_c => break,
          changed = status_rx.changed() => {
            if changed.is_err() {
              break;
            }
            let status = *status_rx.borrow_and_update();
            print_status(&status);
          }
        }
      }

      if let Some(prober) = prober {
        prober.abort();
      }
      info!("stopped watching");
    }
  }

  Ok(())
}

/// Absolute URL, or a path resolved against the app origin
fn resolve_url(config: &Config, url: &str) -> Result<Url> {
  let origin = Url::parse(&config.cache.origin)
    .map_err(|e| eyre!("Invalid cache origin '{}': {}", config.cache.origin, e))?;
  Url::parse(url)
    .or_else(|_| origin.join(url))
    .map_err(|e| eyre!("Invalid URL '{}': {}", url, e))
}

/// Queue one action and, when online, replay it in a cycle owned by this call.
///
/// The queue is gated offline while enqueueing so no background cycle starts
/// and the returned outcome covers everything that was synced.
async fn enqueue_and_sync(
  open: impl Fn(Connectivity) -> OfflineQueue,
  kind: ActionKind,
  data: serde_json::Value,
  online: bool,
) -> (String, Option<DrainOutcome>) {
  let gate = Connectivity::new(NetworkStatus::Offline);
  let queue = open(gate.clone());
  let id = queue.enqueue(kind, data);

  if !online {
    return (id, None);
  }
  gate.set(NetworkStatus::Online);
  (id, queue.drain().await)
}

fn print_status(status: &QueueStatus) {
  let network = if status.online { "online" } else { "offline" };
  let syncing = if status.syncing { ", syncing" } else { "" };
  match status.last_sync {
    Some(last) => println!(
      "{}, {} pending{} (last sync: {} synced, {} dropped)",
      network, status.pending, syncing, last.success, last.failed
    ),
    None => println!("{}, {} pending{}", network, status.pending, syncing),
  }
}

fn print_outcome(outcome: Option<DrainOutcome>) {
  match outcome {
    Some(outcome) => println!("synced {}, dropped {}", outcome.success, outcome.failed),
    None => println!("nothing synced"),
  }
}

fn run_drafts(command: DraftsCommand, db: Arc<Database>) -> Result<()> {
  let drafts = DraftStore::new(Arc::new(SqliteLocalStorage::new(db)));

  match command {
    DraftsCommand::Save { key, data } => {
      let data = serde_json::from_str(&data).map_err(|e| eyre!("Invalid draft data: {}", e))?;
      drafts.save(&key, data)?;
      println!("saved {}", key);
    }
    DraftsCommand::Show { key } => match drafts.load(&key) {
      Some(draft) => println!("{}", serde_json::to_string_pretty(&draft.data)?),
      None => return Err(eyre!("No draft for '{}'", key)),
    },
    DraftsCommand::Discard { key } => {
      if drafts.discard(&key)? {
        println!("discarded {}", key);
      } else {
        println!("no draft for {}", key);
      }
    }
    DraftsCommand::List => {
      for (key, draft) in drafts.list() {
        println!("{}  saved_at={}", key, draft.saved_at);
      }
    }
    DraftsCommand::Prune { days } => {
      let removed = drafts.prune(chrono::Duration::days(days))?;
      println!("removed {} draft(s)", removed);
    }
  }

  Ok(())
}

async fn run_worker<S: CacheStorage + 'static>(
  command: WorkerCommand,
  config: &Config,
  storage: Arc<S>,
  connectivity: Connectivity,
) -> Result<()> {
  let fetcher: Arc<dyn Fetcher> = Arc::new(HttpFetcher::new()?);
  let worker = ServiceWorker::new(&config.cache, storage, fetcher.clone(), connectivity)?;

  match command {
    WorkerCommand::Update => {
      worker.install().await?;
      let deleted = worker.activate().await?;
      println!(
        "{} {:?}, clients claimed: {}",
        config.cache.precache_name,
        worker.state(),
        worker.clients_claimed()
      );
      for name in deleted {
        println!("  deleted {}", name);
      }
    }
    WorkerCommand::Fetch {
      url,
      method,
      image,
      navigate,
      destination,
      mode,
    } => {
      let url = resolve_url(config, &url)?;
      let method = Method::from_bytes(method.to_uppercase().as_bytes())
        .map_err(|e| eyre!("Invalid method '{}': {}", method, e))?;

      let request = if navigate {
        Request::navigate(url)
      } else {
        let destination = if image { Some(Destination::Image) } else { destination };
        let request = Request::new(method, url).with_destination(destination.unwrap_or_default());
        match mode {
          Some(mode) => request.with_mode(mode),
          None => request,
        }
      };

      match worker.handle_fetch(&request).await {
        Some(served) => {
          let served = served?;
          println!(
            "{} {:?} {} ({} bytes)",
            served.response.status,
            served.source,
            served.response.header("content-type").unwrap_or("-"),
            served.response.body.len()
          );
          // Let the background cache write land before exiting
          tokio::time::sleep(Duration::from_millis(100)).await;
        }
        None => {
          let response = fetcher.fetch(request).await?;
          println!("{} passthrough ({} bytes)", response.status, response.body.len());
        }
      }
    }
    WorkerCommand::Lookup { url } => {
      let request = Request::get(resolve_url(config, &url)?);
      match worker.storage().match_any(&request)? {
        Some(CachedResponse {
          response,
          partition,
          cached_at,
        }) => println!(
          "{} in {} since {} ({} bytes)",
          response.status,
          partition,
          cached_at.to_rfc3339(),
          response.body.len()
        ),
        None => println!("not cached"),
      }
    }
    WorkerCommand::Partitions => {
      for name in worker.storage().partitions()? {
        println!("{}", name);
      }
    }
    WorkerCommand::Message { message } => {
      let message: serde_json::Value =
        serde_json::from_str(&message).map_err(|e| eyre!("Invalid message: {}", e))?;
      worker.handle_message(&message);
      println!("skip waiting: {}", worker.is_skip_waiting());
    }
    WorkerCommand::Push { payload, click } => {
      let host = StdoutHost;
      let notification = worker.handle_push(payload.as_deref().map(str::as_bytes), &host)?;
      if click {
        worker.handle_notification_click(&notification, &host)?;
      }
    }
  }

  Ok(())
}
