use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use client_core::{load_settings, CheckMode, ClientContext, Notice, NoticeLevel};
use futures::StreamExt;
use serde_json::Value;
use shared::protocol::{FileUpload, LlmConfigUpdate, NewProject, StartWorkflow, UploadMode};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Command-line front end for the project workbench server")]
struct Cli {
    /// Overrides client.toml and API_BASE.
    #[arg(long)]
    api_base: Option<String>,
    /// Project to operate on; defaults to the server's current project.
    #[arg(long, global = true)]
    project: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Probe the server and report reachability.
    Check,
    Projects,
    /// Show the project the server currently has selected.
    Current,
    CreateProject {
        name: String,
        #[arg(long)]
        display_name: Option<String>,
        #[arg(long)]
        description: Option<String>,
    },
    Switch {
        name: String,
    },
    DeleteProject {
        name: String,
    },
    Dates,
    Metadata {
        date: String,
    },
    Upload {
        date: String,
        path: PathBuf,
        #[arg(long, default_value = "manual_upload")]
        source: String,
        #[arg(long = "tag")]
        tags: Vec<String>,
        #[arg(long)]
        notes: Option<String>,
        /// Replace an existing file of the same name.
        #[arg(long)]
        update: bool,
    },
    Preview {
        date: String,
        filename: String,
        /// Write the bytes here instead of stdout.
        #[arg(long)]
        output: Option<PathBuf>,
    },
    Template,
    Workflows,
    CreateWorkflow {
        date: String,
        name: String,
        /// JSON object merged into the template.
        #[arg(long)]
        overrides: Option<String>,
    },
    UploadWorkflow {
        date: String,
        wf_id: String,
        config: PathBuf,
    },
    Start {
        wf_id: String,
        date: String,
        #[arg(long = "file")]
        files: Vec<String>,
        #[arg(long)]
        prompt: Option<String>,
        /// Keep polling until the run finishes.
        #[arg(long)]
        watch: bool,
        #[arg(long, default_value_t = 2000, value_parser = clap::value_parser!(u64).range(1..))]
        interval_ms: u64,
    },
    Status {
        wf_id: String,
    },
    Detail {
        wf_id: String,
    },
    #[command(subcommand)]
    Llm(LlmCommand),
    #[command(subcommand)]
    Tool(ToolCommand),
}

#[derive(Subcommand, Debug)]
enum LlmCommand {
    Config,
    SetConfig {
        base_url: String,
        #[arg(long)]
        api_key: Option<String>,
        #[arg(long)]
        default_model: Option<String>,
    },
    Models,
    Status,
    Reinitialize,
}

#[derive(Subcommand, Debug)]
enum ToolCommand {
    List,
    Show {
        name: String,
    },
    /// Register a user tool from a JSON config file.
    Add {
        name: String,
        config: PathBuf,
    },
    Edit {
        name: String,
        config: PathBuf,
    },
    Defaults,
    Templates,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();

    let mut settings = load_settings()?;
    if let Some(api_base) = &cli.api_base {
        settings = settings.override_api_base(api_base)?;
    }
    info!("desktop: using api_base={}", settings.api_base);

    let context = ClientContext::new(settings)?;
    let notices = context.notifier().stream();
    let printer = tokio::spawn(async move {
        futures::pin_mut!(notices);
        while let Some(notice) = notices.next().await {
            print_notice(&notice);
        }
    });

    let result = run(&context, cli.project, cli.command).await;

    // Closing the context closes the notice stream once everything is printed.
    drop(context);
    let _ = printer.await;
    result
}

fn print_notice(notice: &Notice) {
    match notice.level {
        NoticeLevel::Success => eprintln!("ok: {}", notice.message),
        NoticeLevel::Error => eprintln!("error: {}", notice.message),
    }
}

async fn run(context: &ClientContext, project: Option<String>, command: Command) -> Result<()> {
    match command {
        Command::Check => {
            let state = context.connectivity().check(CheckMode::Verbose).await;
            if !state.is_connected {
                bail!("server at {} is not reachable", context.settings().api_base);
            }
        }
        Command::Projects => {
            let snapshot = context.projects().load_projects().await?;
            for project in &snapshot.projects {
                let marker = if snapshot.current.as_deref() == Some(project.name.as_str()) {
                    "*"
                } else {
                    " "
                };
                println!("{marker} {}\t{}", project.name, project.display_name);
            }
        }
        Command::Current => match context.gateway().current_project().await? {
            Some(current) => println!("{current}"),
            None => println!("no current project"),
        },
        Command::CreateProject {
            name,
            display_name,
            description,
        } => {
            let snapshot = context
                .projects()
                .create_project(NewProject {
                    name,
                    display_name,
                    description,
                })
                .await?;
            println!("current project: {}", snapshot.current.unwrap_or_default());
        }
        Command::Switch { name } => {
            context.projects().load_projects().await?;
            let snapshot = context.projects().switch_project(&name).await?;
            println!("current project: {}", snapshot.current.unwrap_or_default());
        }
        Command::DeleteProject { name } => {
            context.projects().load_projects().await?;
            let snapshot = context.projects().delete_project(&name).await?;
            match snapshot.current {
                Some(current) => println!("current project: {current}"),
                None => println!("no projects left"),
            }
        }
        Command::Dates => {
            let project = resolve_project(context, project).await?;
            for date in context.files().list_dates(&project).await? {
                println!("{date}");
            }
        }
        Command::Metadata { date } => {
            let project = resolve_project(context, project).await?;
            match context.files().fetch_metadata(&project, &date).await? {
                Some(metadata) => println!("{}", serde_json::to_string_pretty(&metadata)?),
                None => println!("no record for {date}"),
            }
        }
        Command::Upload {
            date,
            path,
            source,
            tags,
            notes,
            update,
        } => {
            let project = resolve_project(context, project).await?;
            let bytes = tokio::fs::read(&path)
                .await
                .with_context(|| format!("failed to read {}", path.display()))?;
            let filename = path
                .file_name()
                .and_then(|name| name.to_str())
                .context("upload path has no usable file name")?
                .to_string();
            let mode = if update {
                UploadMode::Update
            } else {
                UploadMode::Create
            };
            let upload = FileUpload {
                filename,
                bytes,
                source,
                tags,
                notes,
            };
            let record = context
                .files()
                .upload(&project, &date, &upload, mode)
                .await?;
            println!("stored {} as {}", record.filename, record.file_id);
        }
        Command::Preview {
            date,
            filename,
            output,
        } => {
            let project = resolve_project(context, project).await?;
            let bytes = context.files().preview(&project, &date, &filename).await?;
            match output {
                Some(path) => tokio::fs::write(&path, &bytes)
                    .await
                    .with_context(|| format!("failed to write {}", path.display()))?,
                None => println!("{}", String::from_utf8_lossy(&bytes)),
            }
        }
        Command::Template => {
            let project = resolve_project(context, project).await?;
            let template = context.workflows().template(&project).await?;
            println!("{}", serde_json::to_string_pretty(&template)?);
        }
        Command::Workflows => {
            let project = resolve_project(context, project).await?;
            for run in context.workflows().list_workflows(&project).await? {
                println!("{}\t{}\t{}", run.wf_id, run.status, run.name);
            }
        }
        Command::CreateWorkflow {
            date,
            name,
            overrides,
        } => {
            let project = resolve_project(context, project).await?;
            let overrides = overrides
                .map(|raw| serde_json::from_str::<Value>(&raw))
                .transpose()
                .context("--overrides must be valid JSON")?;
            let wf_id = context
                .workflows()
                .create_from_template(&project, &date, &name, overrides)
                .await?;
            println!("{wf_id}");
        }
        Command::UploadWorkflow {
            date,
            wf_id,
            config,
        } => {
            let project = resolve_project(context, project).await?;
            let config = read_json(&config).await?;
            let stored = context
                .workflows()
                .upload_workflow(&project, &date, &wf_id, config)
                .await?;
            println!("{stored}");
        }
        Command::Start {
            wf_id,
            date,
            files,
            prompt,
            watch,
            interval_ms,
        } => {
            let project = resolve_project(context, project).await?;
            let started = context
                .workflows()
                .start_workflow(
                    &project,
                    StartWorkflow {
                        wf_id,
                        date,
                        files,
                        custom_prompt: prompt,
                    },
                )
                .await?;
            println!("started {} for {}", started.wf_id, started.date);
            if watch {
                let run = context
                    .workflows()
                    .poll_until_terminal(
                        &project,
                        &started.wf_id,
                        Duration::from_millis(interval_ms),
                    )
                    .await?;
                println!("{}\t{}", run.wf_id, run.status);
                if let Some(message) = run.error_message {
                    println!("{message}");
                }
            }
        }
        Command::Status { wf_id } => {
            let project = resolve_project(context, project).await?;
            let run = context.workflows().poll_status(&project, &wf_id).await?;
            println!("{}\t{}\t{}", run.wf_id, run.status, run.name);
        }
        Command::Detail { wf_id } => {
            let project = resolve_project(context, project).await?;
            let detail = context.workflows().get_detail(&project, &wf_id).await?;
            println!("{}", serde_json::to_string_pretty(&detail)?);
        }
        Command::Llm(command) => run_llm(context, command).await?,
        Command::Tool(command) => run_tool(context, command).await?,
    }
    Ok(())
}

async fn run_llm(context: &ClientContext, command: LlmCommand) -> Result<()> {
    let gateway = context.gateway();
    match command {
        LlmCommand::Config => {
            let config = gateway.llm_config().await?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        LlmCommand::SetConfig {
            base_url,
            api_key,
            default_model,
        } => {
            gateway
                .update_llm_config(&LlmConfigUpdate {
                    base_url,
                    api_key,
                    default_model,
                })
                .await?;
            println!("llm config updated");
        }
        LlmCommand::Models => {
            for model in gateway.llm_models().await? {
                println!("{}", model.id);
            }
        }
        LlmCommand::Status => {
            let status = gateway.llm_status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        LlmCommand::Reinitialize => {
            let result = gateway.reinitialize_llm().await?;
            println!("{} models available", result.count);
        }
    }
    Ok(())
}

async fn run_tool(context: &ClientContext, command: ToolCommand) -> Result<()> {
    let gateway = context.gateway();
    let reply = match command {
        ToolCommand::List => gateway.tool_list().await?,
        ToolCommand::Show { name } => gateway.tool(&name).await?,
        ToolCommand::Add { name, config } => {
            let config = read_json(&config).await?;
            gateway.add_tool(&name, &config).await?
        }
        ToolCommand::Edit { name, config } => {
            let config = read_json(&config).await?;
            gateway.edit_tool(&name, &config).await?
        }
        ToolCommand::Defaults => gateway.default_tools().await?,
        ToolCommand::Templates => gateway.tool_templates().await?,
    };
    println!("{}", serde_json::to_string_pretty(&reply)?);
    Ok(())
}

async fn read_json(path: &Path) -> Result<Value> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("{} must be valid JSON", path.display()))
}

async fn resolve_project(context: &ClientContext, explicit: Option<String>) -> Result<String> {
    if let Some(project) = explicit.filter(|name| !name.is_empty()) {
        return Ok(project);
    }
    let snapshot = context.projects().load_projects().await?;
    snapshot
        .current
        .context("no current project; pass --project or create one first")
}
