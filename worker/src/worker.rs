use anyhow::{anyhow, bail, Context, Result};
use common::{NewTask, WorkerMessage};
use futures_util::{SinkExt, StreamExt};
use reqwest::Client;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::{env, sync::Arc, time::Duration};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::sleep;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

const DEFAULT_WORKER_CONCURRENCY: usize = 2;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub ws_url: String,
    pub secret: String,
    /// Programa que hace la traducción: `<input> <output> <lang> <detector> <direction> <translator> <size>`
    pub pipeline_cmd: String,
    pub work_dir: PathBuf,
    pub concurrency: usize,
    pub reconnect_delay: Duration,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self> {
        let secret = env::var("MIT_WORKERS_SECRET").context("falta MIT_WORKERS_SECRET")?;
        let concurrency = env::var("WORKER_CONCURRENCY")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_WORKER_CONCURRENCY);

        Ok(Self {
            ws_url: env::var("COORDINATOR_WS_URL")
                .unwrap_or_else(|_| "ws://localhost:8080/worker_ws".to_string()),
            secret,
            pipeline_cmd: env::var("WORKER_PIPELINE_CMD")
                .unwrap_or_else(|_| "mit-pipeline".to_string()),
            work_dir: env::var("WORKER_WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| env::temp_dir().join("mit-worker")),
            concurrency,
            reconnect_delay: Duration::from_secs(5),
        })
    }
}

/// Loop principal del worker.
/// - Se conecta al coordinador por websocket.
/// - Ejecuta cada `new-task` en paralelo (hasta `concurrency`).
/// - Si se cae la conexión, espera y reconecta.
pub async fn run(cfg: WorkerConfig) -> Result<()> {
    tokio::fs::create_dir_all(&cfg.work_dir)
        .await
        .with_context(|| format!("no se pudo crear {}", cfg.work_dir.display()))?;

    let cfg = Arc::new(cfg);
    loop {
        match session(cfg.clone()).await {
            Ok(()) => info!("el coordinador cerró la conexión"),
            Err(e) => warn!("conexión con el coordinador perdida: {:#}", e),
        }
        sleep(cfg.reconnect_delay).await;
    }
}

async fn session(cfg: Arc<WorkerConfig>) -> Result<()> {
    let mut req = cfg.ws_url.as_str().into_client_request()?;
    req.headers_mut()
        .insert("x-secret", HeaderValue::from_str(&cfg.secret)?);
    let (ws, _) = connect_async(req).await?;
    info!("conectado a {} con {} slots", cfg.ws_url, cfg.concurrency);

    let (mut sink, mut stream) = ws.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<WorkerMessage>();

    let writer = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            let bytes = match msg.encode() {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("no se pudo codificar {:?}: {}", msg, e);
                    continue;
                }
            };
            if sink.send(Message::Binary(bytes)).await.is_err() {
                break;
            }
        }
    });

    let sem = Arc::new(Semaphore::new(cfg.concurrency));
    let http = Client::new();

    while let Some(frame) = stream.next().await {
        match frame? {
            Message::Binary(bytes) => match WorkerMessage::decode(&bytes) {
                Ok(WorkerMessage::NewTask(task)) => {
                    info!("tengo tarea {}", task.id);
                    let permit = sem.clone().acquire_owned().await?;
                    let http = http.clone();
                    let cfg = cfg.clone();
                    let out = out_tx.clone();
                    tokio::spawn(async move {
                        let id = task.id.clone();
                        let (success, has_translation_mask) =
                            match run_job(&http, &cfg, &task, &out).await {
                                Ok(has_mask) => {
                                    info!("terminé tarea {}", id);
                                    (true, has_mask)
                                }
                                Err(e) => {
                                    warn!("error procesando tarea {}: {:#}", id, e);
                                    (false, false)
                                }
                            };
                        let _ = out.send(WorkerMessage::FinishTask {
                            id,
                            success,
                            has_translation_mask,
                        });
                        drop(permit);
                    });
                }
                Ok(other) => warn!("mensaje inesperado del coordinador: {:?}", other),
                Err(e) => warn!("no se pudo decodificar un mensaje: {}", e),
            },
            Message::Close(frame) => {
                debug!("cierre recibido: {:?}", frame);
                break;
            }
            _ => {}
        }
    }

    writer.abort();
    Ok(())
}

/// Nombre de archivo seguro a partir del id de la tarea.
fn file_stem(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

/// Descarga, procesa y sube. Devuelve si se subió una máscara.
async fn run_job(
    http: &Client,
    cfg: &WorkerConfig,
    task: &NewTask,
    out: &mpsc::UnboundedSender<WorkerMessage>,
) -> Result<bool> {
    let stem = file_stem(&task.id);
    let input = cfg.work_dir.join(format!("{}.src", stem));
    let output = cfg.work_dir.join(format!("{}.png", stem));

    let result = process(http, cfg, task, out, &input, &output).await;

    let _ = tokio::fs::remove_file(&input).await;
    let _ = tokio::fs::remove_file(&output).await;
    result
}

async fn process(
    http: &Client,
    cfg: &WorkerConfig,
    task: &NewTask,
    out: &mpsc::UnboundedSender<WorkerMessage>,
    input: &Path,
    output: &Path,
) -> Result<bool> {
    report(out, &task.id, "downloading");
    let source = http
        .get(&task.source_image_url)
        .send()
        .await?
        .error_for_status()?
        .bytes()
        .await?;
    tokio::fs::write(input, &source).await?;

    report(out, &task.id, "processing");
    run_pipeline(&cfg.pipeline_cmd, input, output, task, out).await?;

    if !tokio::fs::try_exists(output).await.unwrap_or(false) {
        return Ok(false);
    }
    report(out, &task.id, "uploading");
    let mask = tokio::fs::read(output).await?;
    http.put(&task.translation_mask_upload_url)
        .header("content-type", "image/png")
        .body(mask)
        .send()
        .await?
        .error_for_status()?;
    Ok(true)
}

fn report(out: &mpsc::UnboundedSender<WorkerMessage>, id: &str, status: &str) {
    let _ = out.send(WorkerMessage::Status {
        id: id.to_string(),
        status: status.to_string(),
    });
}

/// Corre el pipeline externo; cada línea de stdout se reenvía como estado.
async fn run_pipeline(
    cmd: &str,
    input: &Path,
    output: &Path,
    task: &NewTask,
    out: &mpsc::UnboundedSender<WorkerMessage>,
) -> Result<()> {
    let mut child = Command::new(cmd)
        .arg(input)
        .arg(output)
        .args([
            &task.target_language,
            &task.detector,
            &task.direction,
            &task.translator,
            &task.size,
        ])
        .stdout(Stdio::piped())
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("no se pudo ejecutar {}", cmd))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("el pipeline no tiene stdout"))?;
    let mut lines = BufReader::new(stdout).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if !line.is_empty() {
            report(out, &task.id, line);
        }
    }

    let status = child.wait().await?;
    if !status.success() {
        bail!("el pipeline terminó con {}", status);
    }
    Ok(())
}
