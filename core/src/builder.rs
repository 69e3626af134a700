use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::config::DownloadConfig;
use crate::error::{CoreError, CoreResult};
use crate::events::{DownloadCompletion, DownloadEvent};
use crate::net::HttpTransport;
use crate::package::{DownloadPackage, DownloadStatus};
use crate::service::DownloadService;

/// Fluent construction of a [`Download`].
#[derive(Default)]
pub struct DownloadBuilder {
    urls: Vec<String>,
    directory: Option<PathBuf>,
    file_name: Option<String>,
    config: DownloadConfig,
    transport: Option<Arc<dyn HttpTransport>>,
}

impl DownloadBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.urls.push(url.into());
        self
    }

    pub fn with_urls<I, S>(mut self, urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.urls.extend(urls.into_iter().map(Into::into));
        self
    }

    /// Splits `path` into directory and file name.
    pub fn with_file_location(mut self, path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        self.directory = path.parent().map(Path::to_path_buf);
        self.file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned());
        self
    }

    pub fn with_directory(mut self, dir: impl AsRef<Path>) -> Self {
        self.directory = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn with_file_name(mut self, name: impl Into<String>) -> Self {
        self.file_name = Some(name.into());
        self
    }

    pub fn with_configuration(mut self, config: DownloadConfig) -> Self {
        self.config = config;
        self
    }

    pub fn configure(mut self, apply: impl FnOnce(&mut DownloadConfig)) -> Self {
        apply(&mut self.config);
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    fn service(&mut self) -> CoreResult<DownloadService> {
        let config = std::mem::take(&mut self.config);
        match self.transport.take() {
            Some(transport) => Ok(DownloadService::with_transport(config, transport)),
            None => DownloadService::new(config),
        }
    }

    pub fn build(mut self) -> CoreResult<Download> {
        if self.urls.is_empty() {
            return Err(CoreError::InvalidState("download needs at least one url".to_string()));
        }
        let service = self.service()?;
        Ok(Download {
            service,
            urls: self.urls,
            directory: self.directory,
            file_name: self.file_name,
            resume: false,
        })
    }

    /// Builds a download that continues `package`.
    pub fn build_from_package(mut self, package: DownloadPackage) -> CoreResult<Download> {
        if package.urls.is_empty() {
            return Err(CoreError::InvalidState("package has no url".to_string()));
        }
        let service = self.service()?;
        let urls = package.urls.clone();
        let (directory, file_name) = match &package.file_name {
            Some(path) => (
                path.parent().map(Path::to_path_buf),
                path.file_name().map(|name| name.to_string_lossy().into_owned()),
            ),
            None => (None, None),
        };
        service.load_package(package)?;
        Ok(Download {
            service,
            urls,
            directory,
            file_name,
            resume: true,
        })
    }
}

/// A configured download, started with [`Download::start`].
pub struct Download {
    service: DownloadService,
    urls: Vec<String>,
    directory: Option<PathBuf>,
    file_name: Option<String>,
    resume: bool,
}

impl Download {
    pub fn urls(&self) -> &[String] {
        &self.urls
    }

    pub fn directory(&self) -> Option<&Path> {
        self.directory.as_deref()
    }

    pub fn file_name(&self) -> Option<&str> {
        self.file_name.as_deref()
    }

    pub fn service(&self) -> &DownloadService {
        &self.service
    }

    pub fn status(&self) -> DownloadStatus {
        self.service.status()
    }

    pub fn package(&self) -> CoreResult<DownloadPackage> {
        self.service.package()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DownloadEvent> {
        self.service.subscribe()
    }

    pub async fn start(&self, cancel: Option<CancellationToken>) -> CoreResult<DownloadCompletion> {
        if self.resume {
            let package = self.service.package()?;
            return self.service.download_package(package, cancel).await;
        }
        let urls = self.urls.clone();
        match (&self.directory, &self.file_name) {
            (Some(dir), Some(name)) => self.service.download_to_file(urls, dir.join(name), cancel).await,
            (None, Some(name)) => self.service.download_to_file(urls, name, cancel).await,
            (Some(dir), None) => self.service.download_to_dir(urls, dir, cancel).await,
            (None, None) => self.service.download(urls, cancel).await,
        }
    }

    pub fn pause(&self) {
        self.service.pause();
    }

    pub fn resume(&self) {
        self.service.resume();
    }

    pub async fn stop(&self) {
        self.service.cancel_and_wait().await;
    }

    pub async fn dispose(&self) -> CoreResult<()> {
        self.service.dispose().await
    }
}
