//! Built-in direct HTTP/FTP hoster plugin.
//!
//! Claims plain `http(s)`/`ftp(s)` URLs no hoster-specific plugin wants and
//! hands them straight to the chunked downloader. Probes resolve size and
//! availability with a HEAD request.

use std::str;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};

use crate::context::Context;
use crate::downloader::HttpDownload;
use crate::file::FileRef;
use crate::store::FileStore;
use crate::utils::sanitize_filename;

use super::{HosterPlugin, OnlineStatus, ProbeStatus};

pub const PLUGIN_NAME: &str = "http";
pub const URL_PATTERN: &str = r"(?i)^(https?|ftps?)://";

pub struct BasicHttp;

impl BasicHttp {
    pub fn new() -> Self {
        BasicHttp
    }
}

impl Default for BasicHttp {
    fn default() -> Self {
        Self::new()
    }
}

impl HosterPlugin for BasicHttp {
    fn process(&self, file: &FileRef, ctx: &Context) -> Result<()> {
        let cfg = ctx.config();
        let mut dir = cfg.general.storage_folder.clone();
        if cfg.general.folder_per_package {
            if let Some(package) = ctx.store.package(file.package_id) {
                let folder = package.folder();
                if !folder.is_empty() {
                    dir = dir.join(folder);
                }
            }
        }
        let target = dir.join(sanitize_filename(&file.name()));

        let progress_file = Arc::clone(file);
        let download = HttpDownload::new(&file.url, &target)
            .chunks(cfg.download.chunks)
            .bucket(Arc::clone(&ctx.bucket))
            .abort_token(file.abort_token())
            .on_progress(move |p| {
                progress_file.set_size(p.size);
                progress_file.set_bytes_done(p.arrived);
                progress_file.set_speed(p.speed);
            });

        let out = download.download()?;
        if let Some(name) = out.file_name().and_then(|n| n.to_str()) {
            file.set_name(name);
        }
        let size = file.size().max(file.bytes_done());
        file.set_size(size);
        file.set_bytes_done(size);
        Ok(())
    }

    fn get_info(&self, urls: &[String]) -> Vec<(String, OnlineStatus)> {
        urls.iter()
            .map(|url| {
                let name = url
                    .split('?')
                    .next()
                    .and_then(|u| u.rsplit('/').next())
                    .filter(|s| !s.is_empty())
                    .unwrap_or(url)
                    .to_string();
                let mut status = OnlineStatus::unknown(name, PLUGIN_NAME);
                match head_probe(url) {
                    Ok(Some(size)) => {
                        status.status = ProbeStatus::Online;
                        status.size = size;
                    }
                    Ok(None) => status.status = ProbeStatus::Online,
                    Err(err) => {
                        tracing::debug!("probe {} failed: {}", url, err);
                        status.status = ProbeStatus::Offline;
                    }
                }
                (url.clone(), status)
            })
            .collect()
    }
}

/// HEAD request returning the content length when the URL is reachable.
fn head_probe(url: &str) -> Result<Option<u64>> {
    let mut content_length: Option<u64> = None;

    let mut easy = curl::easy::Easy::new();
    easy.url(url).context("invalid URL")?;
    easy.nobody(true)?;
    easy.follow_location(true)?;
    easy.connect_timeout(Duration::from_secs(15))?;
    easy.timeout(Duration::from_secs(30))?;

    {
        let mut transfer = easy.transfer();
        transfer.header_function(|data| {
            if let Ok(s) = str::from_utf8(data) {
                let line = s.trim();
                if let Some(value) = line
                    .to_ascii_lowercase()
                    .strip_prefix("content-length:")
                    .map(str::trim)
                    .and_then(|v| v.parse::<u64>().ok())
                {
                    content_length = Some(value);
                }
            }
            true
        })?;
        transfer.perform().context("HEAD request failed")?;
    }

    let code = easy.response_code().context("no response code")?;
    if code >= 400 {
        anyhow::bail!("HEAD {} returned HTTP {}", url, code);
    }
    Ok(content_length)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_claims_http_variants() {
        let re = regex::Regex::new(URL_PATTERN).unwrap();
        assert!(re.is_match("http://host/f"));
        assert!(re.is_match("HTTPS://host/f"));
        assert!(re.is_match("ftp://host/f"));
        assert!(re.is_match("ftps://host/f"));
        assert!(!re.is_match("file:///etc/passwd"));
    }

    #[test]
    fn default_probe_names_come_from_path() {
        let plugin = BasicHttp::new();
        let infos = plugin.get_info(&[]);
        assert!(infos.is_empty());
    }
}
