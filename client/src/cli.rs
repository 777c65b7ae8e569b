use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};
use common::{QueryV1Message, SubmitRequest, SubmitResponse};
use reqwest::Client;
use serde::Deserialize;
use std::env;

/// - En Docker: COORDINATOR_URL=http://coordinator:8080
/// - Local: default http://localhost:8080
fn coordinator_base_url() -> String {
    env::var("COORDINATOR_URL").unwrap_or_else(|_| "http://localhost:8080".to_string())
}

#[derive(Parser, Debug)]
#[command(name = "client")]
#[command(about = "CLI simple para hablar con el coordinador")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Encola una tarea de traducción
    Submit(SubmitArgs),
    /// Consulta el estado de una tarea
    Status {
        #[arg(value_name = "TASK_ID")]
        id: String,
    },
    /// Tamaño de la cola y workers conectados
    Queue,
}

#[derive(Args, Debug)]
pub struct SubmitArgs {
    #[arg(long)]
    id: String,
    /// Clave del archivo fuente en el storage privado
    #[arg(long)]
    file: String,
    #[arg(long)]
    group: Option<String>,
    #[arg(long, default_value = "ENG")]
    target_language: String,
    #[arg(long, default_value = "default")]
    detector: String,
    #[arg(long, default_value = "auto")]
    direction: String,
    #[arg(long, default_value = "gpt3.5")]
    translator: String,
    #[arg(long, default_value = "M")]
    size: String,
}

impl From<SubmitArgs> for SubmitRequest {
    fn from(args: SubmitArgs) -> Self {
        SubmitRequest {
            id: args.id,
            group: args.group,
            file: args.file,
            target_language: args.target_language,
            detector: args.detector,
            direction: args.direction,
            translator: args.translator,
            size: args.size,
        }
    }
}

#[derive(Debug, Deserialize)]
struct QueueStats {
    queue: usize,
    workers: usize,
}

fn describe(message: &QueryV1Message) -> String {
    match message {
        QueryV1Message::Pending { pos } => format!("en cola (posición {})", pos),
        QueryV1Message::Status { status } => format!("procesando: {}", status),
        QueryV1Message::Result { result } => format!("terminada: {}", result.translation_mask),
        QueryV1Message::Error { error, .. } => match error {
            Some(code) => format!("error ({})", code),
            None => "error".to_string(),
        },
        QueryV1Message::NotFound => "no existe".to_string(),
    }
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let client = Client::new();
    let base_url = coordinator_base_url();

    match cli.command {
        Commands::Status { id } => {
            let url = format!("{}/status/{}", base_url, id);
            let resp = client.get(&url).send().await?;
            if !resp.status().is_success() {
                bail!("el coordinador respondió {}", resp.status());
            }
            let message: QueryV1Message = resp.json().await?;
            println!("Tarea {}: {}", id, describe(&message));
        }

        Commands::Queue => {
            let url = format!("{}/status", base_url);
            let stats: QueueStats = client.get(&url).send().await?.json().await?;
            println!("Cola:");
            println!("  tareas : {}", stats.queue);
            println!("  workers: {}", stats.workers);
        }

        Commands::Submit(args) => {
            let req = SubmitRequest::from(args);
            let url = format!("{}/submit", base_url);
            let resp = client.put(&url).json(&req).send().await?;
            let status = resp.status();
            match resp.json::<SubmitResponse>().await? {
                SubmitResponse::Accepted { id, pos } => {
                    println!("Tarea encolada:");
                    println!("  id : {}", id);
                    println!("  pos: {}", pos);
                }
                SubmitResponse::Rejected { error, .. } => {
                    bail!("submit rechazado ({}): {}", status, error);
                }
            }
        }
    }

    Ok(())
}
