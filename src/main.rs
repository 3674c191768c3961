use std::io::Write;
use std::path::PathBuf;

use a3s_converse::{
    AgentController, ConversationEvent, ConversationHub, ConverseConfig, ConverseError, Message,
    Result, Role, TurnOutcome,
};
use clap::{Parser, Subcommand};
use colored::Colorize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

#[derive(Parser)]
#[command(
    name = "a3s-converse",
    about = "a3s-converse: talk to a long-running agent server"
)]
struct Cli {
    /// Path to a JSON config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Agent server base URL (adds or overrides the selected agent)
    #[arg(short, long)]
    url: Option<String>,

    /// Agent id (default: first configured agent)
    #[arg(short, long)]
    agent: Option<String>,

    /// Model sent with every command
    #[arg(short, long)]
    model: Option<String>,

    /// Keep conversations in local JSON files under this directory
    #[arg(long)]
    store: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Interactive session
    Chat,
    /// Send one command and print the reply
    Send {
        /// Command text
        message: String,
    },
    /// Print the stored conversation
    History,
}

const DEFAULT_AGENT_ID: &str = "default";

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(cli).await {
        eprintln!("{} {e}", "[a3s-converse]".red().bold());
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let (config, agent_id) = load_config(&cli)?;
    let hub = ConversationHub::from_config(&config).await?;
    let controller = hub.controller(&agent_id).await?;
    hub.select(&agent_id).await?;

    match cli.command {
        Commands::Chat => chat(&controller).await,
        Commands::Send { message } => send_once(&controller, &message).await,
        Commands::History => {
            for message in controller.messages().await {
                print_message(&message);
            }
            Ok(())
        }
    }
}

/// Merge the config file with command-line overrides
fn load_config(cli: &Cli) -> Result<(ConverseConfig, String)> {
    let mut config = match &cli.config {
        Some(path) => ConverseConfig::from_file(path)?,
        None => ConverseConfig::default(),
    };

    let agent_id = cli
        .agent
        .clone()
        .or_else(|| config.agents.first().map(|a| a.id.clone()))
        .unwrap_or_else(|| DEFAULT_AGENT_ID.to_string());

    if let Some(url) = &cli.url {
        config = config.with_agent(agent_id.clone(), url.clone());
    }
    if let Some(model) = &cli.model {
        config = config.with_model(model.clone());
        // An explicit flag beats per-agent overrides
        for agent in &mut config.agents {
            agent.model = None;
        }
    }
    if let Some(dir) = &cli.store {
        config = config.with_store_dir(dir.clone());
    }

    if config.find_agent(&agent_id).is_none() {
        return Err(ConverseError::Config(format!(
            "no agent '{}' configured; pass --url or --config",
            agent_id
        )));
    }
    config.validate()?;
    Ok((config, agent_id))
}

async fn send_once(controller: &AgentController, message: &str) -> Result<()> {
    let printer = tokio::spawn(print_events(controller.clone()));
    let outcome = controller.send(message).await?.wait().await;
    controller.flush().await;
    printer.abort();
    println!();

    match outcome {
        TurnOutcome::Completed { .. } => {
            if let Some(pending) = controller.pending_approval().await {
                println!(
                    "{} {} (run `chat` to approve or deny)",
                    "approval required:".yellow().bold(),
                    pending.operation
                );
            }
            Ok(())
        }
        TurnOutcome::Cancelled => Ok(()),
        TurnOutcome::Failed(e) => Err(e),
    }
}

async fn chat(controller: &AgentController) -> Result<()> {
    for message in controller.messages().await {
        print_message(&message);
    }
    if controller.is_busy().await {
        println!("{}", "(a previous turn may still be running)".dimmed());
    }
    println!(
        "{}",
        "commands: /approve /deny /cancel /reload /clear /history /quit".dimmed()
    );

    let printer = tokio::spawn(print_events(controller.clone()));
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let result = match line {
            "/quit" | "/exit" => break,
            "/approve" => controller.approve().await.map(|_| ()),
            "/deny" => controller.deny().await,
            "/cancel" => {
                if !controller.cancel().await {
                    println!("{}", "nothing to cancel".dimmed());
                }
                Ok(())
            }
            "/reload" => controller.reload().await.map(|outcome| {
                println!(
                    "{} {:?}, {} messages",
                    "reloaded:".dimmed(),
                    outcome.status,
                    outcome.message_count
                );
            }),
            "/clear" => controller.clear().await,
            "/history" => {
                for message in controller.messages().await {
                    print_message(&message);
                }
                let totals = controller.usage_totals().await;
                println!(
                    "{}",
                    format!(
                        "{} replies, {} in / {} out tokens, ${:.4}",
                        totals.replies,
                        totals.input_tokens,
                        totals.output_tokens,
                        totals.total_cost_usd
                    )
                    .dimmed()
                );
                Ok(())
            }
            command => controller.send(command).await.map(|_| ()),
        };

        if let Err(e) = result {
            if e.is_validation() {
                println!("{} {}", "!".yellow().bold(), e);
            } else {
                eprintln!("{} {}", "[a3s-converse]".red().bold(), e);
            }
        }
    }

    controller.flush().await;
    printer.abort();
    Ok(())
}

/// Render controller events as they arrive
async fn print_events(controller: AgentController) {
    let mut events = controller.subscribe();
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Event printer lagged");
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        match event {
            ConversationEvent::ContentDelta { text, .. } => {
                print!("{}", text);
                let _ = std::io::stdout().flush();
            }
            ConversationEvent::MessageCompleted { .. } => println!(),
            ConversationEvent::MessageAppended { message, .. } if message.role == Role::System => {
                println!("{}", message.content.yellow());
            }
            ConversationEvent::OperationChanged {
                operation: Some(operation),
                ..
            } => {
                println!("{}", format!("[{}]", operation).dimmed());
            }
            ConversationEvent::ApprovalRequired { approval, .. } => {
                println!(
                    "{} {} {}",
                    "approval required:".yellow().bold(),
                    approval.operation,
                    "(/approve or /deny)".dimmed()
                );
            }
            _ => {}
        }
    }
}

fn print_message(message: &Message) {
    let label = match message.role {
        Role::User => "you".cyan().bold(),
        Role::Assistant => "agent".green().bold(),
        Role::System => "system".yellow().bold(),
    };
    let live = if message.role == Role::Assistant && !message.is_complete() {
        " (incomplete)".dimmed().to_string()
    } else {
        String::new()
    };
    println!("{}{} {}", label, live, message.content);
}
