pub mod bandwidth;
pub mod builder;
pub mod checksum;
pub mod chunk;
pub mod chunk_downloader;
pub mod config;
pub mod error;
pub mod events;
pub mod hub;
pub mod net;
pub mod package;
pub mod packet;
pub mod pause;
pub mod request;
pub mod service;
pub mod storage;
pub mod store;
pub mod throttle;

#[cfg(test)]
mod testing;
#[cfg(test)]
mod tests;

pub use crate::builder::{Download, DownloadBuilder};
pub use crate::config::{DownloadConfig, RequestConfig};
pub use crate::error::{CoreError, CoreResult};
pub use crate::events::{DownloadCompletion, DownloadEvent, ProgressInfo};
pub use crate::package::{DownloadPackage, DownloadStatus, PackageId};
pub use crate::service::DownloadService;
