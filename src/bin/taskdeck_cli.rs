//! taskdeck-cli - terminal client for a taskdeck server.
//!
//! Talks to `TASKDECK_API_URL` through the remote store and the lifecycle
//! controller. Snapshots go to stdout, notifications to stderr.

use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use taskdeck::config::Config;
use taskdeck::controller::LifecycleController;
use taskdeck::store::{RemoteTaskStore, SharedTaskStore, StoreError};
use taskdeck::task::{Task, TaskId, TaskStatus};
use taskdeck::view::{self, StatusFilter, TaskFilter};
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "taskdeck-cli", version, about = "Terminal client for a taskdeck server")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Command {
    /// List tasks, newest first
    List {
        /// `all` or a task status
        #[arg(long, value_name = "STATUS", default_value = "all", value_parser = parse_status)]
        status: StatusFilter,
        /// Case-insensitive match on title and description
        #[arg(long, value_name = "QUERY", default_value = "")]
        search: String,
    },
    /// Show one task
    Get {
        #[arg(value_parser = parse_task_id)]
        id: TaskId,
    },
    /// Create a pending task
    Create {
        title: String,
        #[arg(default_value = "")]
        description: String,
    },
    /// Start a pending task
    Run {
        #[arg(value_parser = parse_task_id)]
        id: TaskId,
        /// Follow progress until the task stops
        #[arg(long)]
        watch: bool,
    },
    /// Pause a running task
    Pause {
        #[arg(value_parser = parse_task_id)]
        id: TaskId,
    },
    /// Resume a paused task
    Resume {
        #[arg(value_parser = parse_task_id)]
        id: TaskId,
        /// Follow progress until the task stops
        #[arg(long)]
        watch: bool,
    },
    /// Cancel a task
    Cancel {
        #[arg(value_parser = parse_task_id)]
        id: TaskId,
    },
    /// Follow a running task until it stops
    Watch {
        #[arg(value_parser = parse_task_id)]
        id: TaskId,
    },
}

fn parse_status(raw: &str) -> Result<StatusFilter, String> {
    raw.parse()
}

fn parse_task_id(raw: &str) -> Result<TaskId, String> {
    TaskId::parse(raw).ok_or_else(|| format!("invalid task id: {}", raw))
}

/// `text` with every match of `query` wrapped in brackets.
fn marked(text: &str, query: &str) -> String {
    view::highlight(text, query)
        .into_iter()
        .map(|segment| {
            if segment.matched {
                format!("[{}]", segment.text)
            } else {
                segment.text.to_string()
            }
        })
        .collect()
}

fn print_task(task: &Task) {
    print_matching(task, "");
}

fn print_matching(task: &Task, query: &str) {
    println!(
        "{}  {:<11}  {:>5.1}%  {}",
        task.id(),
        task.status(),
        task.progress(),
        marked(task.title(), query)
    );
    let description = marked(task.description(), query);
    if !query.trim().is_empty() && description != task.description() {
        println!("    {}", description);
    }
    if let Some(result) = task.result() {
        println!("    {}", result);
    }
}

fn drain_notifications(rx: &mut broadcast::Receiver<taskdeck::Notification>) {
    while let Ok(notification) = rx.try_recv() {
        eprintln!("{}", notification);
    }
}

/// Print merged snapshots for `id` until it leaves `in-progress`.
async fn follow(
    controller: &LifecycleController,
    updates: &mut broadcast::Receiver<Task>,
    id: TaskId,
) {
    controller.observe(id);
    // A refresh may already have recorded the final state; no update follows that.
    if let Some(task) = controller.task(id).await {
        if task.status().is_terminal() {
            print_task(&task);
            controller.stop_observing(id);
            return;
        }
    }
    loop {
        match updates.recv().await {
            Ok(task) if task.id() == id => {
                print_task(&task);
                if task.status() != TaskStatus::InProgress {
                    break;
                }
            }
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    controller.stop_observing(id);
}

async fn show(controller: &LifecycleController, id: TaskId) -> Option<Task> {
    match controller.store().get(id).await {
        Ok(Some(task)) => {
            print_task(&task);
            Some(task)
        }
        Ok(None) => {
            eprintln!("Error: Task not found");
            None
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            None
        }
    }
}

/// Print the outcome of `run`/`resume`, then follow it when asked.
async fn started(
    controller: &LifecycleController,
    result: Result<Task, StoreError>,
    watch: bool,
    notifications: &mut broadcast::Receiver<taskdeck::Notification>,
    updates: &mut broadcast::Receiver<Task>,
) -> bool {
    let Ok(task) = result else {
        return false;
    };
    drain_notifications(notifications);
    print_task(&task);
    if watch {
        follow(controller, updates, task.id()).await;
    }
    true
}

async fn execute(controller: &LifecycleController, command: Command) -> bool {
    let mut notifications = controller.subscribe_notifications();
    let mut updates = controller.subscribe_updates();

    let ok = match command {
        Command::List { status, search } => match controller.refresh().await {
            Ok(tasks) => {
                let filter = TaskFilter::new(status, search);
                println!("{}", filter.summarize(&tasks));
                for task in filter.apply(&tasks) {
                    print_matching(&task, &filter.query);
                }
                true
            }
            Err(_) => false,
        },
        Command::Get { id } => show(controller, id).await.is_some(),
        Command::Create { title, description } => {
            match controller.create(&title, &description).await {
                Ok(Some(task)) => {
                    print_task(&task);
                    true
                }
                Ok(None) => {
                    eprintln!("Error: title must not be blank");
                    false
                }
                Err(_) => false,
            }
        }
        Command::Run { id, watch } => {
            let result = controller.run(id).await;
            started(controller, result, watch, &mut notifications, &mut updates).await
        }
        Command::Resume { id, watch } => {
            let result = controller.resume(id).await;
            started(controller, result, watch, &mut notifications, &mut updates).await
        }
        Command::Pause { id } => controller.pause(id).await.map(|t| print_task(&t)).is_ok(),
        Command::Cancel { id } => controller.cancel(id).await.map(|t| print_task(&t)).is_ok(),
        Command::Watch { id } => match show(controller, id).await {
            Some(task) => {
                if task.status() == TaskStatus::InProgress {
                    follow(controller, &mut updates, id).await;
                }
                true
            }
            None => false,
        },
    };

    drain_notifications(&mut notifications);
    ok
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "taskdeck=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = Config::from_env()?;
    let store: SharedTaskStore = Arc::new(RemoteTaskStore::new(
        config.api_url.as_str(),
        config.poll_interval,
    )?);
    let controller = LifecycleController::new(store);

    if execute(&controller, cli.command).await {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}
