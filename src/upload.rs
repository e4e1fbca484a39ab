//! Upload preparation and receipt accounting.
//!
//! The engine does not take part in the transfer itself; new invoices show
//! up later as insert events on the invoice stream.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Length of the content tag appended to uploaded file names.
const TAG_LEN: usize = 8;

/// A document selected for upload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Document {
    pub name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

impl Document {
    pub fn new(name: impl Into<String>, content_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            content_type: content_type.into(),
            bytes,
        }
    }

    pub fn is_image(&self) -> bool {
        self.content_type.starts_with("image/")
    }

    /// Short hex tag derived from the content.
    pub fn content_tag(&self) -> String {
        let digest = Sha256::digest(&self.bytes);
        hex::encode(digest)[..TAG_LEN].to_string()
    }

    /// `<stem>_<tag>.<ext>`, so repeated uploads of the same name stay distinct.
    pub fn tagged_name(&self) -> String {
        let tag = self.content_tag();
        match self.name.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => format!("{}_{}.{}", stem, tag, ext),
            _ => format!("{}_{}", self.name, tag),
        }
    }
}

/// Keep only image documents and tag their names.
pub fn prepare_batch(documents: Vec<Document>) -> Vec<Document> {
    documents
        .into_iter()
        .filter(Document::is_image)
        .map(|doc| Document {
            name: doc.tagged_name(),
            ..doc
        })
        .collect()
}

/// Per-document acceptance status.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UploadStatus {
    /// Accepted; an invoice row will be created.
    Pending,
    /// Refused by the pipeline.
    Rejected { code: String },
}

/// Pipeline response for one uploaded document.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadReceipt {
    pub file_name: String,
    #[serde(flatten)]
    pub status: UploadStatus,
}

/// Accepted vs rejected counts of one upload.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UploadSummary {
    pub accepted: usize,
    pub rejected: usize,
}

impl UploadSummary {
    pub fn tally(receipts: &[UploadReceipt]) -> Self {
        receipts
            .iter()
            .fold(UploadSummary::default(), |mut summary, receipt| {
                match receipt.status {
                    UploadStatus::Pending => summary.accepted += 1,
                    UploadStatus::Rejected { .. } => summary.rejected += 1,
                }
                summary
            })
    }
}
