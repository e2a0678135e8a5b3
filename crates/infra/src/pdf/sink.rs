use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, instrument};

use applyflow_core::JobRecord;
use applyflow_events::{event_type, Delivery, EventEnvelope};

use crate::pipeline::{HandlerError, MessageHandler};

use super::render::{render_pdf, DocumentKind, RenderError};

/// Writes rendered PDFs into one output directory. Never publishes.
#[derive(Debug, Clone)]
pub struct PdfSink {
    output_dir: PathBuf,
}

impl PdfSink {
    pub fn new(output_dir: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            output_dir: output_dir.into(),
        })
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn cv_handler(self: &Arc<Self>) -> CvPdfHandler {
        CvPdfHandler(self.clone())
    }

    pub fn cover_letter_handler(self: &Arc<Self>) -> CoverLetterPdfHandler {
        CoverLetterPdfHandler(self.clone())
    }

    /// Render `text` and write it, replacing any earlier file for the job.
    #[instrument(skip(self, job, text), fields(job_id = %job.id), err)]
    pub async fn write(&self, kind: DocumentKind, job: &JobRecord, text: &str) -> Result<PathBuf, HandlerError> {
        let bytes = render_pdf(text).map_err(|e| match e {
            RenderError::Empty => HandlerError::Malformed(format!("job {} has nothing to render", job.id)),
            RenderError::Pdf(msg) => HandlerError::Collaborator(msg),
        })?;

        tokio::fs::create_dir_all(&self.output_dir)
            .await
            .map_err(|e| HandlerError::Collaborator(format!("create {}: {}", self.output_dir.display(), e)))?;

        let path = self.output_dir.join(kind.file_name(&job.company, &job.title));
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| HandlerError::Collaborator(format!("write {}: {}", path.display(), e)))?;
        Ok(path)
    }
}

/// Renders the CV on `jobs.cvgenerated`.
pub struct CvPdfHandler(Arc<PdfSink>);

#[async_trait]
impl MessageHandler for CvPdfHandler {
    async fn handle(&self, delivery: &Delivery) -> Result<(), HandlerError> {
        let job = EventEnvelope::<JobRecord>::decode(&delivery.payload, event_type::CV_GENERATED)?.into_data();
        if !job.has_cv() {
            return Err(HandlerError::Malformed(format!("job {} has no generated cv", job.id)));
        }

        let path = self.0.write(DocumentKind::Cv, &job, &job.cv).await?;
        info!(job_id = %job.id, path = %path.display(), "cv pdf written");
        Ok(())
    }
}

/// Renders the cover letter on `cover.generated`.
pub struct CoverLetterPdfHandler(Arc<PdfSink>);

#[async_trait]
impl MessageHandler for CoverLetterPdfHandler {
    async fn handle(&self, delivery: &Delivery) -> Result<(), HandlerError> {
        let job = EventEnvelope::<JobRecord>::decode(&delivery.payload, event_type::COVER_GENERATED)?.into_data();
        if job.cover_letter.trim().is_empty() {
            return Err(HandlerError::Malformed(format!("job {} has no cover letter", job.id)));
        }

        let path = self.0.write(DocumentKind::CoverLetter, &job, &job.cover_letter).await?;
        info!(job_id = %job.id, path = %path.display(), "cover letter pdf written");
        Ok(())
    }
}
