use std::path::{Path, PathBuf};

use async_trait::async_trait;
use caixa_storage::HttpFetcher;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use tokio::fs;
use tracing::info;

use crate::{ArchiveError, ArchiveItem, ArchiveSink, UploadReport};

pub const IA_S3_ENDPOINT: &str = "https://s3.us.archive.org";
const SUBJECTS: [&str; 3] = ["real estate", "brazil", "caixa"];

#[derive(Debug, Clone)]
pub struct ArchiveCredentials {
    pub access_key: String,
    pub secret_key: String,
}

impl ArchiveCredentials {
    /// `IA_ACCESS_KEY` / `IA_SECRET_KEY`; `None` unless both are set and non-empty.
    pub fn from_env() -> Option<Self> {
        let access_key = std::env::var("IA_ACCESS_KEY").ok()?;
        let secret_key = std::env::var("IA_SECRET_KEY").ok()?;
        if access_key.trim().is_empty() || secret_key.trim().is_empty() {
            return None;
        }
        Some(Self {
            access_key,
            secret_key,
        })
    }
}

/// Uploads through the Internet Archive S3-compatible API, one PUT per file.
#[derive(Debug, Clone)]
pub struct InternetArchiveSink {
    http: HttpFetcher,
    endpoint: String,
    credentials: Option<ArchiveCredentials>,
}

impl InternetArchiveSink {
    pub fn new(http: HttpFetcher, credentials: Option<ArchiveCredentials>) -> Self {
        Self {
            http,
            endpoint: IA_S3_ENDPOINT.to_string(),
            credentials,
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into().trim_end_matches('/').to_string();
        self
    }

    fn headers(&self, item: &ArchiveItem, credentials: &ArchiveCredentials) -> Vec<(String, String)> {
        let mut headers = vec![
            (
                "authorization".to_string(),
                format!("LOW {}:{}", credentials.access_key, credentials.secret_key),
            ),
            ("x-amz-auto-make-bucket".to_string(), "1".to_string()),
            ("x-archive-meta-mediatype".to_string(), "data".to_string()),
            (
                "x-archive-meta-collection".to_string(),
                "opensource_data".to_string(),
            ),
            ("x-archive-meta-title".to_string(), header_text(&item.title)),
            (
                "x-archive-meta-description".to_string(),
                header_text(&item.description),
            ),
        ];
        for (idx, subject) in SUBJECTS.iter().enumerate() {
            headers.push((
                format!("x-archive-meta{:02}-subject", idx + 1),
                subject.to_string(),
            ));
        }
        headers
    }
}

#[async_trait]
impl ArchiveSink for InternetArchiveSink {
    async fn upload(
        &self,
        item: &ArchiveItem,
        files: &[PathBuf],
        dry_run: bool,
    ) -> Result<UploadReport, ArchiveError> {
        let mut report = plan_upload(item, files, dry_run).await?;
        if dry_run {
            info!(identifier = %item.identifier, files = ?report.files, bytes = report.bytes, "dry run: nothing uploaded");
            return Ok(report);
        }

        let credentials = self
            .credentials
            .as_ref()
            .ok_or(ArchiveError::MissingCredentials)?;
        let headers = self.headers(item, credentials);

        report.bytes = 0;
        for path in files {
            let body = fs::read(path).await.map_err(|source| ArchiveError::Io {
                path: path.clone(),
                source,
            })?;
            let url = format!("{}/{}/{}", self.endpoint, item.identifier, file_name(path));
            let size = body.len() as u64;
            self.http.put_bytes(&url, &headers, body).await?;
            report.bytes += size;
            info!(identifier = %item.identifier, file = %file_name(path), bytes = size, "uploaded");
        }
        Ok(report)
    }
}

/// Never touches the network; records what would have been uploaded.
#[derive(Debug, Clone, Default)]
pub struct DryRunArchiveSink;

#[async_trait]
impl ArchiveSink for DryRunArchiveSink {
    async fn upload(
        &self,
        item: &ArchiveItem,
        files: &[PathBuf],
        _dry_run: bool,
    ) -> Result<UploadReport, ArchiveError> {
        let report = plan_upload(item, files, true).await?;
        info!(identifier = %item.identifier, title = %item.title, files = ?report.files, "dry run: nothing uploaded");
        Ok(report)
    }
}

async fn plan_upload(
    item: &ArchiveItem,
    files: &[PathBuf],
    dry_run: bool,
) -> Result<UploadReport, ArchiveError> {
    if files.is_empty() {
        return Err(ArchiveError::NoFiles);
    }
    let mut bytes = 0u64;
    for path in files {
        let meta = fs::metadata(path).await.map_err(|source| ArchiveError::Io {
            path: path.clone(),
            source,
        })?;
        bytes += meta.len();
    }
    Ok(UploadReport {
        identifier: item.identifier.clone(),
        files: files.iter().map(|p| file_name(p)).collect(),
        bytes,
        dry_run,
    })
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

// RFC 3986 unreserved characters pass through.
const HEADER_ESCAPE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

// Non-ASCII metadata travels as `uri(<percent-encoded>)`.
fn header_text(value: &str) -> String {
    if value
        .bytes()
        .all(|b| b.is_ascii_graphic() || b == b' ')
    {
        return value.to_string();
    }
    format!("uri({})", utf8_percent_encode(value, HEADER_ESCAPE))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn item() -> ArchiveItem {
        ArchiveItem {
            identifier: "imoveis-caixa-2024".into(),
            title: "Imóveis Caixa".into(),
            description: "Historical ledger".into(),
        }
    }

    #[test]
    fn non_ascii_metadata_is_uri_encoded() {
        assert_eq!(header_text("Historical ledger"), "Historical ledger");
        assert_eq!(header_text("Imóveis"), "uri(Im%C3%B3veis)");
        assert_eq!(
            header_text("Leilões: 2024-01"),
            "uri(Leil%C3%B5es%3A%202024-01)"
        );
    }

    #[test]
    fn headers_carry_auth_and_subjects() {
        let sink = InternetArchiveSink::new(HttpFetcher::new(Default::default()).unwrap(), None);
        let creds = ArchiveCredentials {
            access_key: "ak".into(),
            secret_key: "sk".into(),
        };
        let headers = sink.headers(&item(), &creds);
        assert!(headers.contains(&("authorization".into(), "LOW ak:sk".into())));
        assert!(headers.contains(&("x-archive-meta03-subject".into(), "caixa".into())));
    }

    #[tokio::test]
    async fn dry_run_needs_no_credentials_and_reports_sizes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("imoveis_BR.parquet");
        std::fs::write(&path, b"12345").unwrap();

        let sink = InternetArchiveSink::new(HttpFetcher::new(Default::default()).unwrap(), None);
        let report = sink.upload(&item(), &[path], true).await.unwrap();
        assert!(report.dry_run);
        assert_eq!(report.bytes, 5);
        assert_eq!(report.files, vec!["imoveis_BR.parquet".to_string()]);
    }

    #[tokio::test]
    async fn real_upload_without_credentials_is_refused() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("imoveis_BR.csv");
        std::fs::write(&path, b"key").unwrap();

        let sink = InternetArchiveSink::new(HttpFetcher::new(Default::default()).unwrap(), None);
        let err = sink.upload(&item(), &[path], false).await.unwrap_err();
        assert!(matches!(err, ArchiveError::MissingCredentials));
    }

    #[tokio::test]
    async fn empty_file_list_is_an_error() {
        let err = DryRunArchiveSink.upload(&item(), &[], true).await.unwrap_err();
        assert!(matches!(err, ArchiveError::NoFiles));
    }
}
