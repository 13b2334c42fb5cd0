use std::{
    path::{Path, PathBuf},
    process::Stdio,
};

use anyhow::Context;
use async_trait::async_trait;
use sqlx::PgPool;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    process::{Child, Command},
};

use super::{ArtifactStore, Notifier, Orcamento, RecordId, RenderEngine, Renderer, RecordStore};

/// Reads orçamentos from the clinic database.
#[derive(Clone, Debug)]
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn fetch(&self, id: &RecordId) -> anyhow::Result<Option<Orcamento>> {
        let row: Option<(String, Option<String>, serde_json::Value)> = sqlx::query_as(
            r#"SELECT
                o.id::text,
                to_jsonb(o) ->> 'email',
                to_jsonb(o)
            FROM orcamentos o
            WHERE o.id::text = $1
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .context("loading orcamento")?;

        Ok(row.map(|(id, email, data)| Orcamento { id, email, data }))
    }

    async fn attach_pdf(&self, id: &str, location: &str) -> anyhow::Result<()> {
        let updated = sqlx::query("UPDATE orcamentos SET pdf_url = $2 WHERE id::text = $1")
            .bind(id)
            .bind(location)
            .execute(&self.pool)
            .await
            .context("linking pdf to orcamento")?
            .rows_affected();
        anyhow::ensure!(updated == 1, "orcamento {id} disappeared before the pdf was linked");
        Ok(())
    }
}

/// Renders HTML by piping it through an external program, `wkhtmltopdf - -` by default.
#[derive(Clone, Debug)]
pub struct CommandRenderer {
    program: String,
    args: Vec<String>,
}

impl CommandRenderer {
    pub fn new(command: &[String]) -> anyhow::Result<Self> {
        let (program, args) = command
            .split_first()
            .context("render command must name a program")?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }

    fn spawn(&self) -> anyhow::Result<ProcessEngine> {
        let child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("starting renderer `{}`", self.program))?;
        Ok(ProcessEngine { child })
    }
}

#[async_trait]
impl Renderer for CommandRenderer {
    async fn start(&self) -> anyhow::Result<Box<dyn RenderEngine>> {
        Ok(Box::new(self.spawn()?))
    }
}

struct ProcessEngine {
    child: Child,
}

#[async_trait]
impl RenderEngine for ProcessEngine {
    async fn render(&mut self, html: &str) -> anyhow::Result<Vec<u8>> {
        let mut stdin = self.child.stdin.take().context("renderer input already used")?;
        let mut stdout = self.child.stdout.take().context("renderer output already used")?;

        let write = async move {
            stdin.write_all(html.as_bytes()).await?;
            stdin.shutdown().await
        };
        let mut pdf = Vec::new();
        let (written, read) = tokio::join!(write, stdout.read_to_end(&mut pdf));
        written.context("writing to renderer")?;
        read.context("reading from renderer")?;

        let status = self.child.wait().await.context("waiting for renderer")?;
        anyhow::ensure!(status.success(), "renderer exited with {status}");
        Ok(pdf)
    }

    fn release(&mut self) {
        if let Ok(Some(_)) = self.child.try_wait() {
            return;
        }
        if let Err(error) = self.child.start_kill() {
            tracing::warn!(?error, "Failed to stop renderer");
        }
    }
}

/// Writes artifacts to a local directory.
#[derive(Clone, Debug)]
pub struct FsArtifactStore {
    dir: PathBuf,
}

impl FsArtifactStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn store(&self, name: &str, bytes: &[u8]) -> anyhow::Result<String> {
        anyhow::ensure!(
            Path::new(name).file_name().is_some_and(|file| file == name),
            "invalid artifact name `{name}`"
        );
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("creating {}", self.dir.display()))?;
        let path = self.dir.join(name);
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(path.display().to_string())
    }
}

/// Records the notification in the log; delivery channels live outside this service.
#[derive(Clone, Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn pdf_ready(&self, orcamento: &Orcamento, location: &str) -> anyhow::Result<()> {
        let email = orcamento
            .email
            .as_deref()
            .with_context(|| format!("orcamento {} has no email", orcamento.id))?;
        tracing::info!(orcamento_id = %orcamento.id, email, location, "PDF ready");
        Ok(())
    }
}
