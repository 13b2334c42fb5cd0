//! The `generate-pdf` job: render an orçamento to PDF, store it, link it from the record and
//! notify the patient.
use std::{fmt::Display, sync::Arc};

use async_trait::async_trait;
use fila::{
    handler::{Handler, HandlerError},
    job::Job,
};
use serde::Deserialize;

mod collaborators;

pub use collaborators::{CommandRenderer, FsArtifactStore, LogNotifier, PgRecordStore};

pub const GENERATE_PDF: &str = "generate-pdf";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum RecordId {
    Number(i64),
    Text(String),
}

impl Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(id) => write!(f, "{id}"),
            Self::Text(id) => write!(f, "{id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratePdf {
    #[serde(alias = "targetId")]
    pub orcamento_id: RecordId,
}

/// The record a PDF is rendered from.
#[derive(Debug, Clone, PartialEq)]
pub struct Orcamento {
    pub id: String,
    pub email: Option<String>,
    pub data: serde_json::Value,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn fetch(&self, id: &RecordId) -> anyhow::Result<Option<Orcamento>>;

    async fn attach_pdf(&self, id: &str, location: &str) -> anyhow::Result<()>;
}

/// A running rendering engine, released when its [`RenderSession`] is dropped.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RenderEngine: Send {
    async fn render(&mut self, html: &str) -> anyhow::Result<Vec<u8>>;

    fn release(&mut self);
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Renderer: Send + Sync {
    async fn start(&self) -> anyhow::Result<Box<dyn RenderEngine>>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store `bytes` as `name`, returning where it can be found.
    async fn store(&self, name: &str, bytes: &[u8]) -> anyhow::Result<String>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn pdf_ready(&self, orcamento: &Orcamento, location: &str) -> anyhow::Result<()>;
}

/// Scoped hold on a rendering engine.
pub struct RenderSession {
    engine: Box<dyn RenderEngine>,
}

impl RenderSession {
    pub async fn acquire(renderer: &dyn Renderer) -> anyhow::Result<Self> {
        Ok(Self {
            engine: renderer.start().await?,
        })
    }

    pub async fn render(&mut self, html: &str) -> anyhow::Result<Vec<u8>> {
        self.engine.render(html).await
    }
}

impl Drop for RenderSession {
    fn drop(&mut self) {
        self.engine.release();
    }
}

pub struct GeneratePdfHandler {
    records: Arc<dyn RecordStore>,
    renderer: Arc<dyn Renderer>,
    artifacts: Arc<dyn ArtifactStore>,
    notifier: Arc<dyn Notifier>,
}

impl GeneratePdfHandler {
    pub fn new(
        records: impl RecordStore + 'static,
        renderer: impl Renderer + 'static,
        artifacts: impl ArtifactStore + 'static,
        notifier: impl Notifier + 'static,
    ) -> Self {
        Self {
            records: Arc::new(records),
            renderer: Arc::new(renderer),
            artifacts: Arc::new(artifacts),
            notifier: Arc::new(notifier),
        }
    }

    async fn render(&self, orcamento: &Orcamento) -> anyhow::Result<Vec<u8>> {
        let mut session = RenderSession::acquire(self.renderer.as_ref()).await?;
        session.render(&render_html(orcamento)).await
    }
}

fn retryable(error: anyhow::Error) -> HandlerError {
    HandlerError::retryable(format!("{error:#}"))
}

#[async_trait]
impl Handler for GeneratePdfHandler {
    async fn handle(&self, job: &Job) -> Result<serde_json::Value, HandlerError> {
        let GeneratePdf { orcamento_id } = serde_json::from_value(job.payload.clone())
            .map_err(|error| HandlerError::non_retryable(format!("invalid payload: {error}")))?;

        let orcamento = self
            .records
            .fetch(&orcamento_id)
            .await
            .map_err(retryable)?
            .ok_or_else(|| {
                HandlerError::non_retryable(format!("orcamento {orcamento_id} not found"))
            })?;

        let pdf = self.render(&orcamento).await.map_err(retryable)?;
        let location = self
            .artifacts
            .store(&format!("orcamento-{}.pdf", orcamento.id), &pdf)
            .await
            .map_err(retryable)?;
        self.records
            .attach_pdf(&orcamento.id, &location)
            .await
            .map_err(retryable)?;

        let notified = match self.notifier.pdf_ready(&orcamento, &location).await {
            Ok(()) => true,
            Err(error) => {
                tracing::warn!(?error, job_id = %job.id, "Failed to send pdf notification");
                false
            }
        };

        Ok(serde_json::json!({
            "orcamentoId": orcamento.id,
            "pdfUrl": location,
            "notified": notified,
        }))
    }
}

/// A plain HTML document listing the record's fields.
pub fn render_html(orcamento: &Orcamento) -> String {
    let mut rows = String::new();
    if let Some(fields) = orcamento.data.as_object() {
        for (key, value) in fields {
            let value = match value {
                serde_json::Value::String(text) => text.clone(),
                other => other.to_string(),
            };
            rows.push_str(&format!(
                "<tr><th>{}</th><td>{}</td></tr>",
                escape(key),
                escape(&value)
            ));
        }
    }
    format!(
        "<!DOCTYPE html><html><head><meta charset=\"utf-8\"><title>Orçamento {id}</title></head>\
         <body><h1>Orçamento {id}</h1><table>{rows}</table></body></html>",
        id = escape(&orcamento.id),
    )
}

fn escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            c => escaped.push(c),
        }
    }
    escaped
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;
    use chrono::Utc;
    use fila::job::{JobId, JobStatus};

    use super::*;

    fn job(payload: serde_json::Value) -> Job {
        let now = Utc::now();
        Job {
            id: JobId::from("t1"),
            queue: "orcamento".to_owned(),
            job_type: GENERATE_PDF.to_owned(),
            payload,
            status: JobStatus::Processing,
            attempts: 0,
            max_attempts: 3,
            next_attempt_at: None,
            result: None,
            last_error: None,
            created_at: now,
            updated_at: now,
            processed_at: None,
        }
    }

    fn orcamento() -> Orcamento {
        Orcamento {
            id: "42".to_owned(),
            email: Some("paciente@example.com".to_owned()),
            data: serde_json::json!({"paciente": "Ana", "total": 350}),
        }
    }

    fn records() -> MockRecordStore {
        let mut records = MockRecordStore::new();
        records
            .expect_fetch()
            .returning(|_| Ok(Some(orcamento())));
        records.expect_attach_pdf().returning(|_, _| Ok(()));
        records
    }

    fn renderer(result: fn() -> anyhow::Result<Vec<u8>>) -> MockRenderer {
        let mut renderer = MockRenderer::new();
        renderer.expect_start().times(1).returning(move || {
            let mut engine = MockRenderEngine::new();
            engine.expect_render().times(1).returning(move |_| result());
            engine.expect_release().times(1).return_const(());
            Ok(Box::new(engine) as Box<dyn RenderEngine>)
        });
        renderer
    }

    fn artifacts() -> MockArtifactStore {
        let mut artifacts = MockArtifactStore::new();
        artifacts
            .expect_store()
            .returning(|name, _| Ok(format!("/artifacts/{name}")));
        artifacts
    }

    fn notifier(result: fn() -> anyhow::Result<()>) -> MockNotifier {
        let mut notifier = MockNotifier::new();
        notifier
            .expect_pdf_ready()
            .times(1)
            .returning(move |_, _| result());
        notifier
    }

    #[tokio::test]
    async fn renders_stores_and_links_the_pdf() {
        let mut records = MockRecordStore::new();
        records
            .expect_fetch()
            .withf(|id| *id == RecordId::Number(42))
            .returning(|_| Ok(Some(orcamento())));
        records
            .expect_attach_pdf()
            .withf(|id, location| id == "42" && location == "/artifacts/orcamento-42.pdf")
            .times(1)
            .returning(|_, _| Ok(()));
        let handler = GeneratePdfHandler::new(
            records,
            renderer(|| Ok(b"%PDF".to_vec())),
            artifacts(),
            notifier(|| Ok(())),
        );

        let result = handler
            .handle(&job(serde_json::json!({"orcamentoId": 42})))
            .await
            .unwrap();

        assert_eq!(
            result,
            serde_json::json!({
                "orcamentoId": "42",
                "pdfUrl": "/artifacts/orcamento-42.pdf",
                "notified": true,
            })
        );
    }

    #[tokio::test]
    async fn notification_failure_still_succeeds() {
        let handler = GeneratePdfHandler::new(
            records(),
            renderer(|| Ok(b"%PDF".to_vec())),
            artifacts(),
            notifier(|| Err(anyhow::anyhow!("smtp unavailable"))),
        );

        let result = handler
            .handle(&job(serde_json::json!({"targetId": "o1"})))
            .await
            .unwrap();

        assert_eq!(result["notified"], serde_json::json!(false));
    }

    #[tokio::test]
    async fn missing_record_is_not_retried() {
        let mut records = MockRecordStore::new();
        records.expect_fetch().returning(|_| Ok(None));
        records.expect_attach_pdf().never();
        let mut renderer = MockRenderer::new();
        renderer.expect_start().never();
        let mut notifier = MockNotifier::new();
        notifier.expect_pdf_ready().never();
        let handler = GeneratePdfHandler::new(records, renderer, artifacts(), notifier);

        let result = handler
            .handle(&job(serde_json::json!({"orcamentoId": 7})))
            .await;

        assert_matches!(result, Err(HandlerError::NonRetryable(message)) if message.contains('7'));
    }

    #[tokio::test]
    async fn invalid_payload_is_not_retried() {
        let mut records = MockRecordStore::new();
        records.expect_fetch().never();
        let handler = GeneratePdfHandler::new(
            records,
            MockRenderer::new(),
            artifacts(),
            MockNotifier::new(),
        );

        let result = handler.handle(&job(serde_json::json!({"outro": 1}))).await;

        assert_matches!(result, Err(HandlerError::NonRetryable(_)));
    }

    #[tokio::test]
    async fn render_failure_releases_session_and_retries() {
        let mut artifacts = MockArtifactStore::new();
        artifacts.expect_store().never();
        let handler = GeneratePdfHandler::new(
            records(),
            renderer(|| Err(anyhow::anyhow!("renderer crashed"))),
            artifacts,
            MockNotifier::new(),
        );

        let result = handler
            .handle(&job(serde_json::json!({"orcamentoId": 42})))
            .await;

        assert_matches!(result, Err(HandlerError::Retryable(message)) if message.contains("renderer crashed"));
    }

    #[tokio::test]
    async fn storage_failure_is_retried() {
        let mut artifacts = MockArtifactStore::new();
        artifacts
            .expect_store()
            .returning(|_, _| Err(anyhow::anyhow!("disk full")));
        let handler = GeneratePdfHandler::new(
            records(),
            renderer(|| Ok(b"%PDF".to_vec())),
            artifacts,
            MockNotifier::new(),
        );

        let result = handler
            .handle(&job(serde_json::json!({"orcamentoId": 42})))
            .await;

        assert_matches!(result, Err(HandlerError::Retryable(_)));
    }

    #[test]
    fn html_escapes_record_fields() {
        let html = render_html(&Orcamento {
            id: "1".to_owned(),
            email: None,
            data: serde_json::json!({"paciente": "<script>"}),
        });

        assert!(html.contains("<th>paciente</th><td>&lt;script&gt;</td>"));
        assert!(!html.contains("<script>"));
    }
}
